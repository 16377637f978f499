//! Read-only post-install health check.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use {skillhub_config::ValidationLevel, tracing::debug};

use crate::{
    discover::skill_dirs,
    error::Result,
    extract::relative_path_problem,
    lockfile::LockfileStore,
    parse::{read_skill_dir, validate_name},
};

/// For every installed skill, whether `target_dir/<name>/<entrypoint>` exists
/// and stays inside the install root.
///
/// The installed set is recomputed on each call from the lockfile and from
/// the `SKILL.md` directories under `target_dir`. Nothing is written.
pub fn check_installed(target_dir: &Path, lockfile: &LockfileStore) -> Result<BTreeMap<String, bool>> {
    let locked = lockfile.list_installed()?;
    let mut names: BTreeSet<String> = locked.keys().cloned().collect();
    for dir in skill_dirs(target_dir)? {
        if let Some(name) = dir.file_name() {
            names.insert(name.to_string_lossy().into_owned());
        }
    }

    let mut report = BTreeMap::new();
    for name in names {
        let declared = read_skill_dir(&target_dir.join(&name), ValidationLevel::Basic)
            .ok()
            .map(|s| s.entrypoint)
            .filter(|e| !e.is_empty());
        let entrypoint =
            declared.or_else(|| locked.get(&name).and_then(|e| e.entrypoint.clone()));
        let healthy = entrypoint
            .as_deref()
            .is_some_and(|ep| entrypoint_ok(target_dir, &name, ep));
        debug!(%name, entrypoint = ?entrypoint, healthy, "checked installed skill");
        report.insert(name, healthy);
    }
    Ok(report)
}

fn entrypoint_ok(target_dir: &Path, name: &str, entrypoint: &str) -> bool {
    if !validate_name(name) || relative_path_problem(entrypoint).is_some() {
        return false;
    }
    let root = target_dir.join(name);
    match (
        std::fs::canonicalize(&root),
        std::fs::canonicalize(root.join(entrypoint)),
    ) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    }
}
