use std::{
    collections::BTreeSet,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

use {
    fd_lock::RwLock,
    skillhub_config::{SkillhubConfig, ValidationLevel},
    tracing::{debug, info, warn},
    walkdir::WalkDir,
};

use crate::{
    error::{Error, Result},
    extract::{extract_file, relative_path_problem},
    fetch::{Fetcher, http_client},
    index::IndexClient,
    lockfile::LockfileStore,
    parse::{read_skill_dir, validate_name},
    types::{IndexEntry, InstalledSkill, Skill},
};

/// Advisory lock serializing replace and remove of install roots.
const INSTALL_LOCK: &str = ".skillhub.lock";

/// What [`Installer::uninstall`] found and removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removal {
    pub removed_dir: bool,
    pub removed_entry: bool,
}

impl Removal {
    /// Whether anything was installed under the name.
    pub fn found(&self) -> bool {
        self.removed_dir || self.removed_entry
    }
}

/// Orchestrates resolve, fetch, extract, atomic placement and lockfile
/// bookkeeping.
///
/// Every install is staged in a hidden directory inside `target_dir`, so the
/// final placement is a rename on the same filesystem. Observers see either
/// the old tree or the new tree, never a mix.
#[derive(Debug, Clone)]
pub struct Installer {
    target_dir: PathBuf,
    lockfile: LockfileStore,
    index: IndexClient,
    fetcher: Fetcher,
    require_checksum: bool,
    validation: ValidationLevel,
}

impl Installer {
    pub fn new(
        target_dir: impl Into<PathBuf>,
        lockfile: LockfileStore,
        index: IndexClient,
        fetcher: Fetcher,
    ) -> Self {
        Self {
            target_dir: target_dir.into(),
            lockfile,
            index,
            fetcher,
            require_checksum: true,
            validation: ValidationLevel::default(),
        }
    }

    pub fn from_config(config: &SkillhubConfig) -> Result<Self> {
        let client = http_client(&config.fetch)?;
        Ok(Self::new(
            config.resolved_install_dir(),
            LockfileStore::new(config.resolved_lockfile()),
            IndexClient::with_client(
                config.index_url.clone(),
                client.clone(),
                config.fetch.max_download_bytes,
            ),
            Fetcher::with_client(client, config.fetch.max_download_bytes),
        )
        .require_checksum(config.security.require_checksum)
        .validation(config.validation))
    }

    /// Refuse index entries without a digest (the default), or install them
    /// unverified with a warning.
    #[must_use]
    pub fn require_checksum(mut self, required: bool) -> Self {
        self.require_checksum = required;
        self
    }

    /// Validation level applied to `SKILL.md` on local installs.
    #[must_use]
    pub fn validation(mut self, level: ValidationLevel) -> Self {
        self.validation = level;
        self
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn lockfile(&self) -> &LockfileStore {
        &self.lockfile
    }

    pub fn index(&self) -> &IndexClient {
        &self.index
    }

    /// Resolve `slug` in the remote index and install it.
    pub async fn install(&self, slug: &str) -> Result<InstalledSkill> {
        check_name("slug", slug)?;
        let entry = self.index.resolve(slug).await?;
        self.install_entry(&entry).await
    }

    /// Install an already-resolved index entry.
    ///
    /// The entry's `download_url` is resolved against the configured index, so
    /// a network index can only point at http(s) archives.
    pub async fn install_entry(&self, entry: &IndexEntry) -> Result<InstalledSkill> {
        let slug = entry.slug.as_str();
        check_name("slug", slug)?;

        let expected = entry.expected_digest();
        if expected.is_none() {
            if self.require_checksum {
                return Err(Error::ChecksumMissing { slug: slug.into() });
            }
            warn!(%slug, "index entry has no sha256; installing unverified archive");
        }

        let source = self.index.archive_source(entry)?;
        let staging = self.staging_dir()?;
        let download = match expected {
            Some(digest) => {
                self.fetcher
                    .fetch_verified(&source, digest, staging.path())
                    .await?
            },
            None => self.fetcher.download(&source, staging.path()).await?,
        };

        let digest = download.sha256.clone();
        let tree = staging.path().join("tree");
        let slug_owned = slug.to_string();
        let (root, files) = tokio::task::spawn_blocking(move || -> Result<_> {
            let files = extract_file(&download.path, &tree)?;
            drop(download);
            unwrap_single_dir(&tree, &slug_owned, files)
        })
        .await??;

        let mut skill = entry.to_skill(&digest);
        if skill.entrypoint.is_empty()
            && let Ok(declared) = read_skill_dir(&root, ValidationLevel::Basic)
        {
            skill.entrypoint = declared.entrypoint;
        }
        check_entrypoint(&skill)?;

        self.commit(skill, root, files).await
    }

    /// Install a skill directory already on disk.
    ///
    /// `SKILL.md` is parsed and validated with the configured level; the tree
    /// is copied so the source stays untouched. Symlinks are skipped.
    pub async fn install_local(&self, dir: &Path) -> Result<InstalledSkill> {
        let skill = read_skill_dir(dir, self.validation)?;
        check_name("name", &skill.name)?;
        check_entrypoint(&skill)?;

        let staging = self.staging_dir()?;
        let tree = staging.path().join("tree");
        let source = dir.to_path_buf();
        let copy_to = tree.clone();
        let files = tokio::task::spawn_blocking(move || copy_tree(&source, &copy_to)).await??;

        self.commit(skill, tree, files).await
    }

    /// Remove `target_dir/<name>` and its lockfile entry.
    ///
    /// Nothing to remove is not an error; the returned [`Removal`] says what
    /// was there.
    pub async fn uninstall(&self, name: &str) -> Result<Removal> {
        check_name("name", name)?;
        let target_dir = self.target_dir.clone();
        let lockfile = self.lockfile.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || -> Result<Removal> {
            let mut lock = install_lock(&target_dir)?;
            let _guard = lock
                .write()
                .map_err(|e| Error::io_at(&target_dir.join(INSTALL_LOCK), e))?;

            let root = target_dir.join(&name);
            let removed_dir = match fs::remove_dir_all(&root) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(Error::io_at(&root, e)),
            };
            let removal = Removal {
                removed_dir,
                removed_entry: lockfile.remove(&name)?,
            };
            if removal.found() {
                info!(%name, removed_dir, removed_entry = removal.removed_entry, "uninstalled skill");
            } else {
                debug!(%name, "nothing to uninstall");
            }
            Ok(removal)
        })
        .await?
    }

    fn staging_dir(&self) -> Result<tempfile::TempDir> {
        fs::create_dir_all(&self.target_dir).map_err(|e| Error::io_at(&self.target_dir, e))?;
        tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.target_dir)
            .map_err(|e| Error::io_at(&self.target_dir, e))
    }

    /// Swap the staged tree into `target_dir/<name>` and record it.
    async fn commit(
        &self,
        mut skill: Skill,
        staged: PathBuf,
        files: BTreeSet<PathBuf>,
    ) -> Result<InstalledSkill> {
        let target_dir = self.target_dir.clone();
        let lockfile = self.lockfile.clone();
        let record = skill.clone();

        let root = tokio::task::spawn_blocking(move || {
            replace_root(&target_dir, &lockfile, &record, &staged)
        })
        .await??;

        info!(name = %skill.name, version = %skill.version, root = %root.display(), "installed skill");
        skill.path = root.clone();
        Ok(InstalledSkill { skill, root, files })
    }
}

fn check_name(field: &str, name: &str) -> Result<()> {
    if validate_name(name) {
        Ok(())
    } else {
        Err(Error::invalid(
            field,
            format!("'{name}' is not a valid skill name"),
        ))
    }
}

fn check_entrypoint(skill: &Skill) -> Result<()> {
    if skill.entrypoint.is_empty() {
        return Ok(());
    }
    match relative_path_problem(&skill.entrypoint) {
        Some(reason) => Err(Error::invalid("entrypoint", reason)),
        None => Ok(()),
    }
}

fn install_lock(target_dir: &Path) -> Result<RwLock<fs::File>> {
    fs::create_dir_all(target_dir).map_err(|e| Error::io_at(target_dir, e))?;
    let path = target_dir.join(INSTALL_LOCK);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| Error::io_at(&path, e))?;
    Ok(RwLock::new(file))
}

/// Under the install lock: move any previous root aside, rename the staged
/// tree in, restore the previous root if that fails, then write the lockfile
/// entry.
fn replace_root(
    target_dir: &Path,
    lockfile: &LockfileStore,
    skill: &Skill,
    staged: &Path,
) -> Result<PathBuf> {
    let mut lock = install_lock(target_dir)?;
    let _guard = lock
        .write()
        .map_err(|e| Error::io_at(&target_dir.join(INSTALL_LOCK), e))?;

    let root = target_dir.join(&skill.name);
    let previous = if fs::symlink_metadata(&root).is_ok() {
        let aside = target_dir.join(format!(".trash-{}-{}", skill.name, uuid::Uuid::new_v4()));
        fs::rename(&root, &aside).map_err(|e| Error::io_at(&root, e))?;
        debug!(name = %skill.name, "moved previous install aside");
        Some(aside)
    } else {
        None
    };

    let restore = |previous: &Option<PathBuf>| {
        if let Some(aside) = previous
            && let Err(e) = fs::rename(aside, &root)
        {
            warn!(path = %aside.display(), error = %e, "failed to restore previous install");
        }
    };

    if let Err(e) = fs::rename(staged, &root) {
        restore(&previous);
        return Err(Error::io_at(&root, e));
    }

    if let Err(e) = lockfile.add(skill) {
        if let Err(rm) = fs::remove_dir_all(&root) {
            warn!(path = %root.display(), error = %rm, "failed to remove new install after lockfile error");
        }
        restore(&previous);
        return Err(e);
    }

    if let Some(aside) = previous
        && let Err(e) = fs::remove_dir_all(&aside)
    {
        warn!(path = %aside.display(), error = %e, "failed to remove previous install");
    }
    Ok(root)
}

/// When the extracted tree is exactly one directory named `slug`, install
/// that directory's contents instead.
fn unwrap_single_dir(
    tree: &Path,
    slug: &str,
    files: BTreeSet<PathBuf>,
) -> Result<(PathBuf, BTreeSet<PathBuf>)> {
    let entries = fs::read_dir(tree)
        .map_err(|e| Error::io_at(tree, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::io_at(tree, e))?;

    if let [only] = entries.as_slice()
        && only.file_name() == slug
        && only.file_type().is_ok_and(|t| t.is_dir())
    {
        let files = files
            .iter()
            .filter_map(|p| p.strip_prefix(slug).ok())
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();
        debug!(%slug, "unwrapping single top-level directory");
        return Ok((only.path(), files));
    }
    Ok((tree.to_path_buf(), files))
}

/// Copy a skill directory, returning relative paths of what was copied.
fn copy_tree(source: &Path, dest: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    fs::create_dir_all(dest).map_err(|e| Error::io_at(dest, e))?;

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::traversal(entry.path().display().to_string(), "outside source"))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            warn!(path = %entry.path().display(), "skipping symlink in local skill directory");
            continue;
        }
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io_at(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| Error::io_at(entry.path(), e))?;
        }
        files.insert(rel.to_path_buf());
    }
    Ok(files)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const SKILL_MD: &str = "---\nname: local-demo\nversion: 0.2.0\nauthor: me\nentrypoint: run.sh\ntags:\n  - local\n---\n# Local\n";

    fn installer(root: &Path) -> Installer {
        let client = reqwest::Client::new();
        Installer::new(
            root.join("skills"),
            LockfileStore::new(root.join("skills-lock.json")),
            IndexClient::with_client(
                root.join("index.json").display().to_string(),
                client.clone(),
                1024 * 1024,
            ),
            Fetcher::with_client(client, 1024 * 1024),
        )
    }

    fn write_local_skill(dir: &Path) {
        fs::create_dir_all(dir.join("lib")).unwrap();
        fs::write(dir.join("SKILL.md"), SKILL_MD).unwrap();
        fs::write(dir.join("run.sh"), "echo local").unwrap();
        fs::write(dir.join("lib/helper.txt"), "h").unwrap();
    }

    #[test]
    fn test_unwrap_single_matching_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(tree.join("demo")).unwrap();
        fs::write(tree.join("demo/run.sh"), "x").unwrap();
        let files = BTreeSet::from([PathBuf::from("demo"), PathBuf::from("demo/run.sh")]);

        let (root, files) = unwrap_single_dir(&tree, "demo", files).unwrap();
        assert_eq!(root, tree.join("demo"));
        assert_eq!(files, BTreeSet::from([PathBuf::from("run.sh")]));
    }

    #[test]
    fn test_no_unwrap_for_other_layouts() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(tree.join("other")).unwrap();
        let (root, _) = unwrap_single_dir(&tree, "demo", BTreeSet::new()).unwrap();
        assert_eq!(root, tree);

        fs::remove_dir(tree.join("other")).unwrap();
        fs::create_dir_all(tree.join("demo")).unwrap();
        fs::write(tree.join("run.sh"), "x").unwrap();
        let (root, _) = unwrap_single_dir(&tree, "demo", BTreeSet::new()).unwrap();
        assert_eq!(root, tree);
    }

    #[tokio::test]
    async fn test_install_local_and_reinstall() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src/local-demo");
        write_local_skill(&source);
        let installer = installer(tmp.path());

        let installed = installer.install_local(&source).await.unwrap();
        assert_eq!(installed.root, tmp.path().join("skills/local-demo"));
        assert!(installed.files.contains(Path::new("lib/helper.txt")));
        assert_eq!(
            fs::read_to_string(installed.root.join("run.sh")).unwrap(),
            "echo local"
        );

        fs::write(source.join("run.sh"), "echo v2").unwrap();
        fs::remove_file(source.join("lib/helper.txt")).unwrap();
        installer.install_local(&source).await.unwrap();
        assert_eq!(
            fs::read_to_string(installed.root.join("run.sh")).unwrap(),
            "echo v2"
        );
        assert!(!installed.root.join("lib/helper.txt").exists());

        let locked = installer.lockfile().list_installed().unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked["local-demo"].version, "0.2.0");

        // Only the install root and the lock file remain in the target dir.
        let mut names: Vec<_> = fs::read_dir(installer.target_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![".skillhub.lock", "local-demo"]);
    }

    #[tokio::test]
    async fn test_install_local_rejects_invalid_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("bad");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("SKILL.md"), "---\nname: bad\n---\n").unwrap();

        let err = installer(tmp.path()).install_local(&source).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!tmp.path().join("skills/bad").exists());
    }

    #[tokio::test]
    async fn test_install_local_basic_level_still_guards_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("esc");
        fs::create_dir_all(&source).unwrap();
        fs::write(
            source.join("SKILL.md"),
            "---\nname: esc\nversion: 1\nauthor: a\nentrypoint: ../../bin/sh\ntags:\n---\n",
        )
        .unwrap();

        let err = installer(tmp.path())
            .validation(ValidationLevel::Basic)
            .install_local(&source)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_uninstall() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src/local-demo");
        write_local_skill(&source);
        let installer = installer(tmp.path());

        assert_eq!(installer.uninstall("local-demo").await.unwrap(), Removal::default());
        installer.install_local(&source).await.unwrap();
        assert_eq!(installer.uninstall("local-demo").await.unwrap(), Removal {
            removed_dir: true,
            removed_entry: true,
        });
        assert!(!installer.target_dir().join("local-demo").exists());
        assert!(installer.lockfile().list_installed().unwrap().is_empty());
        assert!(!installer.uninstall("local-demo").await.unwrap().found());
    }

    #[tokio::test]
    async fn test_uninstall_unrecorded_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = installer(tmp.path());
        write_local_skill(&installer.target_dir().join("stray"));

        let removal = installer.uninstall("stray").await.unwrap();
        assert!(removal.found());
        assert!(removal.removed_dir);
        assert!(!removal.removed_entry);
        assert!(!installer.target_dir().join("stray").exists());
    }

    #[tokio::test]
    async fn test_unsafe_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = installer(tmp.path());
        for name in ["..", "../etc", "a/b", ""] {
            let err = installer.uninstall(name).await.unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{name}");
        }
    }

    #[tokio::test]
    async fn test_missing_checksum_is_refused_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let entry: IndexEntry = serde_json::from_value(serde_json::json!({
            "slug": "demo",
            "download_url": tmp.path().join("demo.zip").display().to_string(),
        }))
        .unwrap();

        let err = installer(tmp.path()).install_entry(&entry).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMissing { .. }));
        assert!(!tmp.path().join("skills").exists());
    }
}
