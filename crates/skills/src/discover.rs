use std::path::{Path, PathBuf};

use {skillhub_config::ValidationLevel, tracing::warn};

use crate::{
    error::{Error, Result},
    parse,
    types::Skill,
};

/// Directories one level below `base` that hold a `SKILL.md`, sorted by
/// directory name. Hidden directories (staging, trash) are ignored; a missing
/// `base` yields nothing.
pub fn skill_dirs(base: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(base) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at(base, e)),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_at(base, e))?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let dir = entry.path();
        if dir.is_dir() && dir.join("SKILL.md").is_file() {
            dirs.push(dir);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Parse every skill under `base`. Documents that fail to parse or validate
/// are skipped with a warning.
pub fn list_skills(base: &Path, level: ValidationLevel) -> Result<Vec<Skill>> {
    let mut skills = Vec::new();
    for dir in skill_dirs(base)? {
        match parse::read_skill_dir(&dir, level) {
            Ok(skill) => skills.push(skill),
            Err(e) => warn!(skill_dir = %dir.display(), %e, "failed to parse SKILL.md"),
        }
    }
    Ok(skills)
}

/// The skill installed as `base/<name>`.
pub fn get_skill(base: &Path, name: &str, level: ValidationLevel) -> Result<Skill> {
    if !parse::validate_name(name) {
        return Err(Error::not_found("skill", name));
    }
    let dir = base.join(name);
    if !dir.join("SKILL.md").is_file() {
        return Err(Error::not_found("skill", name));
    }
    parse::read_skill_dir(&dir, level)
}
