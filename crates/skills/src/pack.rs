//! Package a skill directory as an installable zip.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use {
    tracing::{info, warn},
    walkdir::WalkDir,
    zip::{CompressionMethod, DateTime, ZipWriter, write::SimpleFileOptions},
};

use crate::{
    error::{Error, Result},
    fetch::sha256_file,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedSkill {
    pub path: PathBuf,
    pub sha256: String,
}

/// Zip `skill_dir` into `out_dir/<dir name>.zip`.
///
/// Entries are prefixed with the directory name so an install unwraps them,
/// written in sorted order with a fixed timestamp so the same tree always
/// produces the same digest. Symlinks are skipped.
pub fn pack_skill(skill_dir: &Path, out_dir: &Path) -> Result<PackedSkill> {
    let skill_dir = fs::canonicalize(skill_dir).map_err(|e| Error::io_at(skill_dir, e))?;
    if !skill_dir.is_dir() {
        return Err(Error::not_found("directory", skill_dir.display().to_string()));
    }
    let Some(name) = skill_dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Err(Error::invalid("skill_dir", "has no directory name"));
    };

    // Checked before and after creation: nothing may be created inside the
    // skill directory, and links in the created path are only known after.
    check_outside(&projected_path(out_dir)?, &skill_dir)?;
    fs::create_dir_all(out_dir).map_err(|e| Error::io_at(out_dir, e))?;
    let out_dir = fs::canonicalize(out_dir).map_err(|e| Error::io_at(out_dir, e))?;
    check_outside(&out_dir, &skill_dir)?;

    let path = out_dir.join(format!("{name}.zip"));
    let mut tmp = tempfile::Builder::new()
        .prefix(".pack-")
        .tempfile_in(&out_dir)
        .map_err(|e| Error::io_at(&out_dir, e))?;

    let mut zip = ZipWriter::new(tmp.as_file_mut());
    let mut count = 0usize;
    for entry in WalkDir::new(&skill_dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            warn!(path = %entry.path().display(), "skipping symlink while packing");
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&skill_dir) else {
            continue;
        };
        let entry_name = format!("{name}/{}", slash_path(rel));

        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());
        if let Some(mode) = file_mode(entry.path()) {
            options = options.unix_permissions(mode);
        }
        zip.start_file(entry_name, options)?;
        let mut input = fs::File::open(entry.path()).map_err(|e| Error::io_at(entry.path(), e))?;
        io::copy(&mut input, &mut zip).map_err(|e| Error::io_at(entry.path(), e))?;
        count += 1;
    }
    zip.finish()?.flush().map_err(|e| Error::io_at(&path, e))?;

    tmp.persist(&path).map_err(|e| Error::io_at(&path, e.error))?;
    let sha256 = sha256_file(&path)?;
    info!(path = %path.display(), files = count, %sha256, "packed skill");
    Ok(PackedSkill { path, sha256 })
}

fn check_outside(out_dir: &Path, skill_dir: &Path) -> Result<()> {
    if out_dir.starts_with(skill_dir) {
        return Err(Error::invalid(
            "out_dir",
            "must not be inside the skill directory",
        ));
    }
    Ok(())
}

/// `path` made absolute, with its deepest existing ancestor canonicalized.
fn projected_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path).map_err(|e| Error::io_at(path, e))?;
    for ancestor in absolute.ancestors() {
        if let Ok(real) = fs::canonicalize(ancestor)
            && let Ok(rest) = absolute.strip_prefix(ancestor)
        {
            return Ok(real.join(rest));
        }
    }
    Ok(absolute)
}

fn slash_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}
