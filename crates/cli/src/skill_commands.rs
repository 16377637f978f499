use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use {
    skillhub_config::{SkillhubConfig, ValidationLevel},
    skillhub_skills::{
        Error, Installer, Removal, discover,
        health::check_installed,
        index::IndexClient,
        lockfile::LockfileStore,
        pack::pack_skill,
        parse::{parse_frontmatter, parse_skill},
        schema::{self, Schema},
    },
};

pub fn list(config: &SkillhubConfig, json: bool) -> anyhow::Result<ExitCode> {
    let install_dir = config.resolved_install_dir();
    let skills = discover::list_skills(&install_dir, ValidationLevel::Basic)?;
    let locked = LockfileStore::new(config.resolved_lockfile()).list_installed()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&skills)?);
        return Ok(ExitCode::SUCCESS);
    }

    if skills.is_empty() && locked.is_empty() {
        println!("No skills installed in {}.", install_dir.display());
        return Ok(ExitCode::SUCCESS);
    }
    for skill in &skills {
        println!("  {} {} — {}", skill.name, skill.version, skill.description);
    }
    for (name, entry) in &locked {
        if !skills.iter().any(|s| &s.name == name) {
            println!("  {name} {} (no SKILL.md)", entry.version);
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn info(config: &SkillhubConfig, name: &str, json: bool) -> anyhow::Result<ExitCode> {
    let skill = discover::get_skill(&config.resolved_install_dir(), name, ValidationLevel::Basic)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&skill)?);
        return Ok(ExitCode::SUCCESS);
    }

    let locked = LockfileStore::new(config.resolved_lockfile()).list_installed()?;
    println!("Name:        {}", skill.name);
    println!("Version:     {}", skill.version);
    println!("Description: {}", skill.description);
    println!("Author:      {}", skill.author);
    println!("License:     {}", skill.license);
    println!("Entrypoint:  {}", skill.entrypoint);
    if !skill.tags.is_empty() {
        let tags: Vec<_> = skill.tags.iter().map(String::as_str).collect();
        println!("Tags:        {}", tags.join(", "));
    }
    if !skill.dependencies.is_empty() {
        let deps: Vec<_> = skill
            .dependencies
            .iter()
            .map(|d| format!("{}@{}", d.name, d.version))
            .collect();
        println!("Depends on:  {}", deps.join(", "));
    }
    if let Some(entry) = locked.get(name) {
        println!("Checksum:    {}", entry.checksum);
    }
    println!("Path:        {}", skill.path.display());
    Ok(ExitCode::SUCCESS)
}

pub fn validate(config: &SkillhubConfig, json: bool) -> anyhow::Result<ExitCode> {
    let lockfile = LockfileStore::new(config.resolved_lockfile());
    let report = check_installed(&config.resolved_install_dir(), &lockfile)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_empty() {
        println!("No skills installed.");
    } else {
        for (name, ok) in &report {
            println!("  {:<7} {name}", if *ok { "ok" } else { "MISSING" });
        }
    }

    Ok(if report.values().all(|ok| *ok) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub fn check(paths: &[PathBuf], level: ValidationLevel) -> anyhow::Result<ExitCode> {
    let schema = Schema::skill();
    let mut failed = false;

    for path in paths {
        let doc = if path.is_dir() {
            path.join("SKILL.md")
        } else {
            path.clone()
        };
        let content = std::fs::read_to_string(&doc)
            .map_err(|e| Error::io_at(&doc, e))?;

        let errors = match parse_frontmatter(&content) {
            Ok(map) => schema::validate(&map, &schema, level),
            Err(e) => {
                failed = true;
                println!("{}: {e}", doc.display());
                continue;
            },
        };
        if errors.is_empty() {
            // Typed construction can still reject what the schema lets through.
            let dir = doc.parent().unwrap_or(Path::new("."));
            match parse_skill(&content, dir, level) {
                Ok(skill) => println!("{}: ok ({} {}, {level})", doc.display(), skill.name, skill.version),
                Err(e) => {
                    failed = true;
                    println!("{}: {e}", doc.display());
                },
            }
        } else {
            failed = true;
            println!("{}: {} problem(s)", doc.display(), errors.len());
            for error in errors {
                println!("  {error}");
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

pub async fn list_remote(config: &SkillhubConfig) -> anyhow::Result<ExitCode> {
    let client = IndexClient::new(config.index_url.clone(), &config.fetch)?;
    let index = client.fetch().await?;
    if index.skills.is_empty() {
        println!("The index at {} lists no skills.", client.url());
    }
    for entry in &index.skills {
        let verified = if entry.expected_digest().is_some() {
            ""
        } else {
            " [no sha256]"
        };
        println!(
            "  {} {} — {}{verified}",
            entry.slug, entry.version, entry.description
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn install(
    config: &SkillhubConfig,
    slug: &str,
    allow_unverified: bool,
) -> anyhow::Result<ExitCode> {
    let mut installer = Installer::from_config(config)?;
    if allow_unverified {
        installer = installer.require_checksum(false);
    }
    let installed = installer.install(slug).await?;
    println!(
        "Installed {} {} into {}",
        installed.skill.name,
        installed.skill.version,
        installed.root.display()
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn install_local(config: &SkillhubConfig, dir: &Path) -> anyhow::Result<ExitCode> {
    let installer = Installer::from_config(config)?;
    let installed = installer.install_local(dir).await?;
    println!(
        "Installed {} {} into {} ({} paths)",
        installed.skill.name,
        installed.skill.version,
        installed.root.display(),
        installed.files.len()
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn uninstall(config: &SkillhubConfig, name: &str) -> anyhow::Result<ExitCode> {
    let installer = Installer::from_config(config)?;
    let removal = installer.uninstall(name).await?;
    println!("{}", removal_message(name, removal));
    Ok(ExitCode::SUCCESS)
}

fn removal_message(name: &str, removal: Removal) -> String {
    match (removal.removed_dir, removal.removed_entry) {
        (true, true) => format!("Removed '{name}'."),
        (true, false) => format!("Removed directory for '{name}' (it had no lockfile entry)."),
        (false, true) => {
            format!("Removed lockfile entry for '{name}' (its directory was already gone).")
        },
        (false, false) => format!("Skill '{name}' is not installed."),
    }
}

pub fn pack(dir: &Path, out_dir: Option<&Path>) -> anyhow::Result<ExitCode> {
    let out_dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::fs::canonicalize(dir)
            .map_err(|e| Error::io_at(dir, e))?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| ".".into()),
    };
    let packed = pack_skill(dir, &out_dir)?;
    println!("Packed:  {}", packed.path.display());
    println!("SHA-256: {}", packed.sha256);
    Ok(ExitCode::SUCCESS)
}
