//! Fail-closed zip extraction.
//!
//! Every entry name is validated before anything touches the disk. The tree
//! is then written into a scratch directory next to the destination and only
//! moved into place once every write succeeded, so a rejected archive leaves
//! the destination exactly as it was.

use std::{
    collections::BTreeSet,
    fs,
    io::{Read, Seek},
    path::{Component, Path, PathBuf},
};

use {
    tracing::{debug, warn},
    zip::ZipArchive,
};

use crate::error::{Error, Result};

/// Longest symlink target read from an archive.
const MAX_LINK_TARGET: u64 = 4096;

/// Why a slash-separated relative path is unsafe to join onto a root, or
/// `None` when it is safe.
pub fn relative_path_problem(path: &str) -> Option<&'static str> {
    if path.is_empty() {
        return Some("path is empty");
    }
    if path.contains('\0') {
        return Some("path contains a NUL byte");
    }
    if path.starts_with(['/', '\\']) || has_drive_prefix(path) {
        return Some("absolute paths are not allowed");
    }
    if path.split(['/', '\\']).any(|seg| seg == "..") {
        return Some("parent-directory segments are not allowed");
    }
    None
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Normalize an entry name to a relative path. `None` for entries that name
/// the archive root itself (e.g. `./`).
fn normalize_entry(name: &str) -> Result<Option<PathBuf>> {
    if let Some(reason) = relative_path_problem(name) {
        return Err(Error::traversal(name, reason));
    }
    let path: PathBuf = name
        .split(['/', '\\'])
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();
    Ok((!path.as_os_str().is_empty()).then_some(path))
}

#[derive(Debug)]
enum EntryKind {
    Dir,
    File,
    /// Normalized, slash-joined relative target.
    Symlink(String),
}

#[derive(Debug)]
struct PlannedEntry {
    index: usize,
    name: String,
    rel: PathBuf,
    kind: EntryKind,
    mode: Option<u32>,
}

/// Extract the zip at `archive` into `dest`. See [`extract`].
pub fn extract_file(archive: &Path, dest: &Path) -> Result<BTreeSet<PathBuf>> {
    let file = fs::File::open(archive).map_err(|e| Error::io_at(archive, e))?;
    extract(file, dest)
}

/// Extract a zip archive into `dest`, creating it if absent.
///
/// Returns the relative paths of every extracted file, directory and symlink.
/// Any unsafe entry aborts the whole extraction with
/// [`Error::PathTraversal`] before a single byte is written.
pub fn extract<R: Read + Seek>(reader: R, dest: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut archive = ZipArchive::new(reader)?;
    let plan = plan_entries(&mut archive)?;

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| Error::io_at(&parent, e))?;
    let scratch = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(&parent)
        .map_err(|e| Error::io_at(&parent, e))?;

    write_entries(&mut archive, &plan, scratch.path())?;
    move_into_place(scratch, dest)?;

    debug!(dest = %dest.display(), entries = plan.len(), "archive extracted");
    Ok(plan.into_iter().map(|e| e.rel).collect())
}

/// Validation pass: classify and check every entry without writing.
fn plan_entries<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Vec<PlannedEntry>> {
    let mut plan = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let Some(rel) = normalize_entry(&name)? else {
            continue;
        };
        let mode = entry.unix_mode();

        let kind = if entry.is_symlink() {
            let mut target = String::new();
            entry
                .by_ref()
                .take(MAX_LINK_TARGET)
                .read_to_string(&mut target)
                .map_err(|e| Error::parse(format!("symlink entry '{name}'"), e))?;
            EntryKind::Symlink(resolve_link_target(&name, &rel, &target)?)
        } else if entry.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        plan.push(PlannedEntry {
            index,
            name,
            rel,
            kind,
            mode,
        });
    }

    check_symlink_nesting(&plan)?;
    Ok(plan)
}

/// Check a symlink target lexically from the link's own directory, returning
/// the normalized target to write.
fn resolve_link_target(name: &str, rel: &Path, target: &str) -> Result<String> {
    let target = target.trim_end_matches('\0');
    if target.is_empty() || target.contains('\0') {
        return Err(Error::traversal(name, "symlink target is empty or malformed"));
    }
    if target.starts_with(['/', '\\']) || has_drive_prefix(target) {
        return Err(Error::traversal(name, "symlink target is absolute"));
    }

    let mut resolved: Vec<&std::ffi::OsStr> = rel
        .parent()
        .map(|p| p.components().map(Component::as_os_str).collect())
        .unwrap_or_default();
    let mut segments = Vec::new();
    for seg in target.split(['/', '\\']) {
        match seg {
            "" | "." => continue,
            ".." => {
                if resolved.pop().is_none() {
                    return Err(Error::traversal(name, "symlink target escapes the destination"));
                }
            },
            other => resolved.push(std::ffi::OsStr::new(other)),
        }
        segments.push(seg);
    }
    if resolved.is_empty() {
        return Err(Error::traversal(name, "symlink target is the destination root"));
    }
    Ok(segments.join("/"))
}

/// No entry may live beneath a symlink entry, and no symlink may resolve
/// through another symlink entry.
fn check_symlink_nesting(plan: &[PlannedEntry]) -> Result<()> {
    let links: BTreeSet<&Path> = plan
        .iter()
        .filter(|e| matches!(e.kind, EntryKind::Symlink(_)))
        .map(|e| e.rel.as_path())
        .collect();
    if links.is_empty() {
        return Ok(());
    }

    for entry in plan {
        if entry.rel.ancestors().skip(1).any(|a| links.contains(a)) {
            return Err(Error::traversal(&entry.name, "entry is nested beneath a symlink"));
        }
        if let EntryKind::Symlink(target) = &entry.kind {
            let base = entry.rel.parent().unwrap_or(Path::new(""));
            let mut resolved = PathBuf::new();
            for comp in base.join(target).components() {
                match comp {
                    Component::ParentDir => {
                        resolved.pop();
                    },
                    Component::Normal(seg) => {
                        resolved.push(seg);
                        if links.contains(resolved.as_path()) {
                            return Err(Error::traversal(
                                &entry.name,
                                "symlink target passes through another symlink",
                            ));
                        }
                    },
                    _ => {},
                }
            }
        }
    }
    Ok(())
}

/// Write pass: materialize the planned entries under `root`.
fn write_entries<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    plan: &[PlannedEntry],
    root: &Path,
) -> Result<()> {
    let canonical_root = fs::canonicalize(root).map_err(|e| Error::io_at(root, e))?;
    let mut dir_modes = Vec::new();

    // Symlinks last, so no write can follow one.
    let ordered = plan
        .iter()
        .filter(|e| !matches!(e.kind, EntryKind::Symlink(_)))
        .chain(plan.iter().filter(|e| matches!(e.kind, EntryKind::Symlink(_))));

    for planned in ordered {
        let dest = root.join(&planned.rel);
        let parent = dest.parent().unwrap_or(root);
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        let canonical_parent = fs::canonicalize(parent).map_err(|e| Error::io_at(parent, e))?;
        if !canonical_parent.starts_with(&canonical_root) {
            return Err(Error::traversal(
                &planned.name,
                "entry resolves outside the destination",
            ));
        }
        if let Ok(meta) = fs::symlink_metadata(&dest)
            && meta.file_type().is_symlink()
        {
            return Err(Error::traversal(
                &planned.name,
                "entry resolves to a symlink destination",
            ));
        }

        match &planned.kind {
            EntryKind::Dir => {
                fs::create_dir_all(&dest).map_err(|e| Error::io_at(&dest, e))?;
                if let Some(mode) = planned.mode {
                    dir_modes.push((dest, mode));
                }
            },
            EntryKind::File => {
                let mut entry = archive.by_index(planned.index)?;
                let mut out = fs::File::create(&dest).map_err(|e| Error::io_at(&dest, e))?;
                std::io::copy(&mut entry, &mut out).map_err(|e| Error::io_at(&dest, e))?;
                if let Some(mode) = planned.mode {
                    set_mode(&dest, mode & 0o777)?;
                }
            },
            EntryKind::Symlink(target) => write_symlink(target, &dest, &planned.name)?,
        }
    }

    // Directory modes go on after their contents are written; the owner keeps
    // full access so the tree can still be moved.
    for (dir, mode) in dir_modes {
        set_mode(&dir, (mode & 0o777) | 0o700)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| Error::io_at(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn write_symlink(target: &str, dest: &Path, _name: &str) -> Result<()> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| Error::io_at(dest, e))
}

#[cfg(not(unix))]
fn write_symlink(_target: &str, _dest: &Path, name: &str) -> Result<()> {
    warn!(entry = %name, "skipping symlink entry on this platform");
    Ok(())
}

/// Move the finished scratch tree into `dest`.
fn move_into_place(scratch: tempfile::TempDir, dest: &Path) -> Result<()> {
    let is_empty_dir = match fs::read_dir(dest) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let staged = scratch.keep();
            return fs::rename(&staged, dest).map_err(|e| {
                let _ = fs::remove_dir_all(&staged);
                Error::io_at(dest, e)
            });
        },
        Err(e) => return Err(Error::io_at(dest, e)),
    };

    if is_empty_dir {
        fs::remove_dir(dest).map_err(|e| Error::io_at(dest, e))?;
        let staged = scratch.keep();
        return fs::rename(&staged, dest).map_err(|e| {
            let _ = fs::remove_dir_all(&staged);
            Error::io_at(dest, e)
        });
    }

    let children: Vec<_> = fs::read_dir(scratch.path())
        .map_err(|e| Error::io_at(scratch.path(), e))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::io_at(scratch.path(), e))?;
    for child in &children {
        let target = dest.join(child.file_name());
        if fs::symlink_metadata(&target).is_ok() {
            warn!(path = %target.display(), "extraction would overwrite an existing path");
            return Err(Error::io_at(
                &target,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "path already exists"),
            ));
        }
    }
    let moves: Vec<_> = children
        .iter()
        .map(|child| (child.path(), dest.join(child.file_name())))
        .collect();
    rename_all(&moves, |from, to| fs::rename(from, to))
}

/// Apply each `(from, to)` rename in order. If one fails, the renames already
/// made are reversed before the error is returned.
fn rename_all(
    moves: &[(PathBuf, PathBuf)],
    mut rename: impl FnMut(&Path, &Path) -> std::io::Result<()>,
) -> Result<()> {
    for (done, (from, to)) in moves.iter().enumerate() {
        if let Err(e) = rename(from, to) {
            for (from, to) in moves[..done].iter().rev() {
                if let Err(undo) = rename(to, from) {
                    warn!(path = %to.display(), error = %undo, "failed to undo partial extraction");
                }
            }
            return Err(Error::io_at(to, e));
        }
    }
    Ok(())
}
