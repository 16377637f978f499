use std::{collections::BTreeMap, path::Path};

use {skillhub_config::ValidationLevel, tracing::debug};

use crate::{
    error::{Error, Result},
    schema::{self, Schema},
    types::{
        Dependency, FieldValue, Frontmatter, PlatformMeta, Skill, UpgradePolicy, default_license,
    },
};

const DELIMITER: &str = "---";

/// Unknown keys beyond this many are dropped from [`Skill::extra`].
pub const MAX_EXTRA_KEYS: usize = 64;

/// Validate a skill name: lowercase ASCII, digits, hyphens, 1-64 chars.
///
/// Names become directory names under the install root, so this also keeps
/// separators and `..` out of paths.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
}

/// Split a metadata document into its metadata block and unparsed body.
///
/// The first line must be exactly `---`; the block ends at the next line that
/// is exactly `---`.
pub fn split_frontmatter(content: &str) -> Result<(&str, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let (first, rest) = match content.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (content, ""),
    };
    if first.trim_end() != DELIMITER {
        return Err(Error::parse(
            "frontmatter",
            "document must start with a --- delimiter line",
        ));
    }

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER {
            let block = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((block, body));
        }
        offset += line.len();
    }
    Err(Error::parse("frontmatter", "missing closing --- delimiter"))
}

/// Parse the leading metadata block of a document into a flat mapping.
pub fn parse_frontmatter(content: &str) -> Result<Frontmatter> {
    let (block, _body) = split_frontmatter(content)?;
    Ok(parse_block(block))
}

fn parse_block(block: &str) -> Frontmatter {
    let mut map = Frontmatter::new();
    let lines: Vec<&str> = block.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim();
        i += 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('-') {
            debug!(line, "skipping list item outside a sequence");
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            debug!(line, "skipping frontmatter line without a key");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = value.trim();
        if value.is_empty() {
            let mut items = Vec::new();
            while i < lines.len() {
                let Some(item) = lines[i].trim().strip_prefix('-') else {
                    break;
                };
                items.push(unquote(item.trim()).to_string());
                i += 1;
            }
            map.insert(key.to_string(), FieldValue::List(items));
        } else {
            map.insert(key.to_string(), FieldValue::Scalar(unquote(value).to_string()));
        }
    }

    map
}

/// Strip one matching pair of surrounding quotes.
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value != value.trim()
        || value.starts_with(['"', '\''])
        || value.ends_with(['"', '\''])
}

fn render_value(value: &str) -> String {
    if needs_quotes(value) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Render a mapping and body back into a metadata document.
///
/// Output stays inside the grammar [`parse_frontmatter`] reads, so a parse of
/// the rendered document yields the same mapping.
pub fn render_frontmatter(map: &Frontmatter, body: &str) -> String {
    let mut out = String::from("---\n");
    for (key, value) in map {
        match value {
            FieldValue::Scalar(s) => {
                out.push_str(&format!("{key}: {}\n", render_value(s)));
            },
            FieldValue::List(items) => {
                out.push_str(&format!("{key}:\n"));
                for item in items {
                    out.push_str(&format!("  - {}\n", render_value(item)));
                }
            },
        }
    }
    out.push_str("---\n");
    out.push_str(body);
    out
}

/// Parse and validate a `SKILL.md` document into a [`Skill`].
pub fn parse_skill(content: &str, skill_dir: &Path, level: ValidationLevel) -> Result<Skill> {
    let map = parse_frontmatter(content)?;
    let errors = schema::validate(&map, &Schema::skill(), level);
    if !errors.is_empty() {
        return Err(Error::Validation { errors });
    }
    let mut skill = skill_from_frontmatter(&map)?;
    skill.path = skill_dir.to_path_buf();
    Ok(skill)
}

/// Read `SKILL.md` from a directory and parse it.
pub fn read_skill_dir(skill_dir: &Path, level: ValidationLevel) -> Result<Skill> {
    let skill_md = skill_dir.join("SKILL.md");
    let content = std::fs::read_to_string(&skill_md).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found("SKILL.md", skill_md.display().to_string()),
        _ => Error::io_at(&skill_md, e),
    })?;
    parse_skill(&content, skill_dir, level)
}

/// Build a typed [`Skill`] from a parsed mapping.
///
/// Only shape errors that would make the record meaningless fail here; the
/// schema validator reports everything else with field paths.
pub fn skill_from_frontmatter(map: &Frontmatter) -> Result<Skill> {
    let scalar = |key: &str| -> Result<String> {
        match map.get(key) {
            None => Ok(String::new()),
            Some(FieldValue::Scalar(s)) => Ok(s.clone()),
            Some(FieldValue::List(_)) => Err(Error::invalid(key, "expected a scalar value")),
        }
    };
    let list = |key: &str| -> Vec<String> {
        match map.get(key) {
            Some(FieldValue::List(items)) => items.clone(),
            Some(FieldValue::Scalar(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    };

    let name = scalar("name")?;
    if name.is_empty() {
        return Err(Error::invalid("name", "required field is missing"));
    }

    let license = match scalar("license")? {
        l if l.is_empty() => default_license(),
        l => l,
    };

    let dependencies = list("dependencies")
        .iter()
        .filter_map(|item| parse_dependency(item))
        .collect();

    let schema = Schema::skill();
    let mut extra = BTreeMap::new();
    for (key, value) in map {
        if schema.knows(key) {
            continue;
        }
        if extra.len() >= MAX_EXTRA_KEYS {
            tracing::warn!(%key, skill = %name, "dropping metadata key beyond extra-key limit");
            continue;
        }
        extra.insert(key.clone(), value.clone());
    }

    Ok(Skill {
        name,
        version: scalar("version")?,
        description: scalar("description")?,
        author: scalar("author")?,
        tags: list("tags").into_iter().collect(),
        entrypoint: scalar("entrypoint")?,
        files: list("files"),
        license,
        checksum: scalar("checksum")?.to_ascii_lowercase(),
        dependencies,
        ctos: platform_from_frontmatter(map, &scalar)?,
        extra,
        path: Default::default(),
    })
}

fn platform_from_frontmatter(
    map: &Frontmatter,
    scalar: &impl Fn(&str) -> Result<String>,
) -> Result<Option<PlatformMeta>> {
    if !map.keys().any(|k| k.starts_with("ctos.")) {
        return Ok(None);
    }
    let compatible_with = match map.get("ctos.compatible_with") {
        Some(FieldValue::List(items)) => items.clone(),
        Some(FieldValue::Scalar(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };
    let policy = scalar("ctos.upgrade_policy")?;
    let upgrade_policy = if policy.is_empty() {
        UpgradePolicy::default()
    } else {
        UpgradePolicy::parse(&policy).ok_or_else(|| {
            Error::invalid(
                "ctos.upgrade_policy",
                format!("must be one of {}", UpgradePolicy::NAMES.join("|")),
            )
        })?
    };
    Ok(Some(PlatformMeta {
        version: scalar("ctos.version")?,
        compatible_with,
        upgrade_policy,
    }))
}

/// `name@version`, or a bare `name` meaning any version.
pub(crate) fn parse_dependency(item: &str) -> Option<Dependency> {
    let (name, version) = match item.split_once('@') {
        Some((name, version)) => (name.trim(), version.trim()),
        None => (item.trim(), "*"),
    };
    if name.is_empty() {
        return None;
    }
    Some(Dependency {
        name: name.to_string(),
        version: if version.is_empty() { "*" } else { version }.to_string(),
    })
}

/// Render a [`Skill`] into the flat mapping the parser produces.
pub fn skill_to_frontmatter(skill: &Skill) -> Frontmatter {
    let mut map = Frontmatter::new();
    let mut scalar = |key: &str, value: &str| {
        map.insert(key.to_string(), FieldValue::Scalar(value.to_string()));
    };
    scalar("name", &skill.name);
    scalar("version", &skill.version);
    scalar("description", &skill.description);
    scalar("author", &skill.author);
    scalar("entrypoint", &skill.entrypoint);
    scalar("license", &skill.license);
    if !skill.checksum.is_empty() {
        scalar("checksum", &skill.checksum);
    }
    if let Some(ctos) = &skill.ctos {
        scalar("ctos.version", &ctos.version);
        let policy = match ctos.upgrade_policy {
            UpgradePolicy::Auto => "auto",
            UpgradePolicy::Manual => "manual",
            UpgradePolicy::Notify => "notify",
        };
        scalar("ctos.upgrade_policy", policy);
        map.insert(
            "ctos.compatible_with".into(),
            FieldValue::List(ctos.compatible_with.clone()),
        );
    }
    map.insert("tags".into(), FieldValue::List(skill.tags.iter().cloned().collect()));
    if !skill.files.is_empty() {
        map.insert("files".into(), FieldValue::List(skill.files.clone()));
    }
    if !skill.dependencies.is_empty() {
        let deps = skill
            .dependencies
            .iter()
            .map(|d| format!("{}@{}", d.name, d.version))
            .collect();
        map.insert("dependencies".into(), FieldValue::List(deps));
    }
    for (key, value) in &skill.extra {
        map.entry(key.clone()).or_insert_with(|| value.clone());
    }
    map
}
