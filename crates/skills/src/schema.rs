//! Schema validation for parsed skill metadata.
//!
//! Two levels are available. [`ValidationLevel::Strict`] checks presence,
//! shape and content of every declared field. [`ValidationLevel::Basic`]
//! only checks that required fields are present, so it accepts everything
//! strict accepts and more.

use std::fmt;

use skillhub_config::ValidationLevel;

use crate::{
    extract::relative_path_problem,
    parse::{parse_dependency, validate_name},
    types::{FieldValue, Frontmatter, UpgradePolicy},
};

/// A single field-qualified validation failure.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldError {
    /// Dotted field path, with `[i]` for list items (e.g. `files[2]`).
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Expected shape of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Any scalar.
    Text,
    /// Scalar with visible content.
    NonEmptyText,
    /// Scalar passing [`validate_name`].
    Name,
    /// Scalar relative path that stays inside the install root.
    RelativePath,
    /// Empty, or 64 hex characters.
    Digest,
    Enum(&'static [&'static str]),
    /// List of non-empty scalars.
    TextList,
    /// List of relative paths.
    RelativePathList,
    /// List of `name@version` items.
    DependencyList,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub path: &'static str,
    pub required: bool,
    pub kind: FieldKind,
}

const fn required(path: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        path,
        required: true,
        kind,
    }
}

const fn optional(path: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        path,
        required: false,
        kind,
    }
}

/// Prefix of the nested platform-metadata keys.
const PLATFORM_PREFIX: &str = "ctos.";

#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldRule>,
}

impl Schema {
    /// The `SKILL.md` metadata schema.
    pub fn skill() -> Self {
        use FieldKind::*;

        Self {
            fields: vec![
                required("name", Name),
                required("version", NonEmptyText),
                required("author", NonEmptyText),
                required("entrypoint", RelativePath),
                required("tags", TextList),
                optional("description", Text),
                optional("files", RelativePathList),
                optional("license", NonEmptyText),
                optional("checksum", Digest),
                optional("dependencies", DependencyList),
                optional("ctos.version", NonEmptyText),
                optional("ctos.compatible_with", TextList),
                optional("ctos.upgrade_policy", Enum(UpgradePolicy::NAMES)),
            ],
        }
    }

    pub fn fields(&self) -> &[FieldRule] {
        &self.fields
    }

    /// Whether `key` is a declared field.
    pub fn knows(&self, key: &str) -> bool {
        self.fields.iter().any(|f| f.path == key)
    }
}

/// Validate `map` against `schema`, returning errors sorted by field path.
pub fn validate(map: &Frontmatter, schema: &Schema, level: ValidationLevel) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for rule in schema.fields() {
        match map.get(rule.path) {
            None if rule.required => {
                errors.push(FieldError::new(rule.path, "required field is missing"));
            },
            None => {},
            Some(value) => {
                if level == ValidationLevel::Strict {
                    check_value(rule, value, &mut errors);
                }
            },
        }
    }

    if level == ValidationLevel::Strict
        && map.keys().any(|k| k.starts_with(PLATFORM_PREFIX))
        && !map.contains_key("ctos.version")
    {
        errors.push(FieldError::new(
            "ctos.version",
            "required when ctos metadata is present",
        ));
    }

    errors.sort();
    errors
}

fn check_value(rule: &FieldRule, value: &FieldValue, errors: &mut Vec<FieldError>) {
    let path = rule.path;
    match rule.kind {
        FieldKind::Text
        | FieldKind::NonEmptyText
        | FieldKind::Name
        | FieldKind::RelativePath
        | FieldKind::Digest
        | FieldKind::Enum(_) => {
            let Some(s) = value.as_scalar() else {
                errors.push(FieldError::new(path, "expected a single value, found a list"));
                return;
            };
            if let Some(message) = check_scalar(rule.kind, s) {
                errors.push(FieldError::new(path, message));
            }
        },
        FieldKind::TextList | FieldKind::RelativePathList | FieldKind::DependencyList => {
            let Some(items) = value.as_list() else {
                errors.push(FieldError::new(path, "expected a list"));
                return;
            };
            for (i, item) in items.iter().enumerate() {
                if let Some(message) = check_item(rule.kind, item) {
                    errors.push(FieldError::new(format!("{path}[{i}]"), message));
                }
            }
        },
    }
}

fn check_scalar(kind: FieldKind, s: &str) -> Option<String> {
    match kind {
        FieldKind::Text => None,
        FieldKind::NonEmptyText => s.trim().is_empty().then(|| "must not be empty".into()),
        FieldKind::Name => (!validate_name(s))
            .then(|| "must be 1-64 lowercase alphanumeric or hyphen characters".into()),
        FieldKind::RelativePath => relative_path_problem(s).map(Into::into),
        FieldKind::Digest => (!s.is_empty() && !is_sha256_hex(s))
            .then(|| "must be empty or a 64-character hex sha256".into()),
        FieldKind::Enum(allowed) => {
            (!allowed.contains(&s)).then(|| format!("must be one of {}", allowed.join("|")))
        },
        _ => None,
    }
}

fn check_item(kind: FieldKind, item: &str) -> Option<String> {
    match kind {
        FieldKind::TextList => item.trim().is_empty().then(|| "must not be empty".into()),
        FieldKind::RelativePathList => relative_path_problem(item).map(Into::into),
        FieldKind::DependencyList => parse_dependency(item)
            .is_none()
            .then(|| "expected name@version".into()),
        _ => None,
    }
}

/// Whether `s` is a 64-character hex digest (either case).
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
