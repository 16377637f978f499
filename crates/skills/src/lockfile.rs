use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use {fd_lock::RwLock, tracing::debug};

use crate::{
    error::{Error, Result},
    types::{LockEntry, Lockfile, Skill},
};

/// Persistent lockfile storage.
///
/// Reads never lock: writers replace the document with a rename, so a reader
/// sees either the previous or the next document in full. Every
/// read-modify-write holds an exclusive advisory lock on `<lockfile>.lock`.
#[derive(Debug, Clone)]
pub struct LockfileStore {
    path: PathBuf,
}

impl LockfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the lockfile, returning an empty one if it does not exist yet.
    pub fn read(&self) -> Result<Lockfile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Lockfile::default()),
            Err(e) => return Err(Error::io_at(&self.path, e)),
        };
        serde_json::from_str(&data).map_err(|e| Error::parse(self.path.display().to_string(), e))
    }

    /// Record `skill` as installed, overwriting any previous entry.
    pub fn add(&self, skill: &Skill) -> Result<()> {
        let installed_at_ms = now_ms();
        self.update(|lock| {
            lock.add(skill, installed_at_ms);
            true
        })?;
        debug!(name = %skill.name, version = %skill.version, "lockfile entry written");
        Ok(())
    }

    /// Drop the entry for `name`, returning whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = self.update(|lock| lock.remove(name))?;
        if removed {
            debug!(%name, "lockfile entry removed");
        }
        Ok(removed)
    }

    /// All recorded installs, keyed by skill name.
    pub fn list_installed(&self) -> Result<BTreeMap<String, LockEntry>> {
        Ok(self.read()?.skills)
    }

    /// Run `mutate` on the current document under the write lock, saving it
    /// when `mutate` reports a change.
    fn update(&self, mutate: impl FnOnce(&mut Lockfile) -> bool) -> Result<bool> {
        let parent = self.parent_dir();
        std::fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;

        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::io_at(&lock_path, e))?;
        let mut lock = RwLock::new(file);
        let _guard = lock.write().map_err(|e| Error::io_at(&lock_path, e))?;

        let mut lockfile = self.read()?;
        let changed = mutate(&mut lockfile);
        if changed {
            self.save(&lockfile)?;
        }
        Ok(changed)
    }

    /// Write the document via temp file + rename.
    fn save(&self, lockfile: &Lockfile) -> Result<()> {
        let parent = self.parent_dir();
        let data = serde_json::to_string_pretty(lockfile)
            .map_err(|e| Error::parse(self.path.display().to_string(), e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::io_at(parent, e))?;
        tmp.write_all(data.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::io_at(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::io_at(&self.path, e.error))?;
        Ok(())
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::types::IndexEntry};

    fn skill(name: &str, version: &str) -> Skill {
        let entry: IndexEntry = serde_json::from_value(serde_json::json!({
            "slug": name,
            "version": version,
            "download_url": "https://example.com/x.zip",
            "entrypoint": "run.sh",
        }))
        .unwrap();
        entry.to_skill(&"ab".repeat(32))
    }

    #[test]
    fn test_read_missing_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LockfileStore::new(tmp.path().join("missing.json"));
        assert!(store.read().unwrap().skills.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_add_then_list_then_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LockfileStore::new(tmp.path().join("nested/skills-lock.json"));

        store.add(&skill("demo", "1.0.0")).unwrap();
        let installed = store.list_installed().unwrap();
        let entry = &installed["demo"];
        assert_eq!(entry.version, "1.0.0");
        assert_eq!(entry.checksum, "ab".repeat(32));
        assert_eq!(entry.entrypoint.as_deref(), Some("run.sh"));
        assert!(entry.installed_at_ms.is_some());

        assert!(store.remove("demo").unwrap());
        assert!(!store.list_installed().unwrap().contains_key("demo"));
        assert!(!store.remove("demo").unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_lose_no_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LockfileStore::new(tmp.path().join("skills-lock.json"));
        store.add(&skill("keep", "1.0.0")).unwrap();
        store.add(&skill("gone", "1.0.0")).unwrap();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                store.add(&skill(&format!("skill-{i}"), "1.0.0"))
            }));
        }
        let remover = store.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            remover.remove("gone").map(|_| ())
        }));
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let installed = store.list_installed().unwrap();
        assert_eq!(installed.len(), 33);
        assert!(installed.contains_key("keep"));
        assert!(!installed.contains_key("gone"));
        assert!((0..32).all(|i| installed.contains_key(&format!("skill-{i}"))));
    }

    #[test]
    fn test_add_overwrites_existing_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LockfileStore::new(tmp.path().join("lock.json"));
        store.add(&skill("demo", "1.0.0")).unwrap();
        store.add(&skill("demo", "2.0.0")).unwrap();
        store.add(&skill("other", "0.1.0")).unwrap();

        let installed = store.list_installed().unwrap();
        assert_eq!(installed.len(), 2);
        assert_eq!(installed["demo"].version, "2.0.0");
    }

    #[test]
    fn test_document_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LockfileStore::new(tmp.path().join("lock.json"));
        store.add(&skill("demo", "1.0.0")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["skills"]["demo"]["version"], "1.0.0");
        assert!(raw["skills"]["demo"]["checksum"].is_string());
    }

    #[test]
    fn test_legacy_document_still_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock.json");
        std::fs::write(&path, r#"{"skills":{"old":{"version":"0.1","checksum":""}}}"#).unwrap();
        let store = LockfileStore::new(&path);
        assert_eq!(store.list_installed().unwrap()["old"].version, "0.1");

        store.add(&skill("demo", "1.0.0")).unwrap();
        assert_eq!(store.list_installed().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_document_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = LockfileStore::new(&path).read().unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LockfileStore::new(tmp.path().join("lock.json"));
        store.add(&skill("demo", "1.0.0")).unwrap();
        let mut names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["lock.json", "lock.json.lock"]);
    }
}
