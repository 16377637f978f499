#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::BTreeMap,
    fs,
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use {
    sha2::{Digest, Sha256},
    skillhub_skills::{
        Error, ErrorKind, Installer,
        fetch::Fetcher,
        health::check_installed,
        index::IndexClient,
        lockfile::LockfileStore,
    },
    zip::{ZipWriter, write::SimpleFileOptions},
};

const SKILL_MD: &str = "---\nname: demo\nversion: 1.0.0\nauthor: Demo Team\nentrypoint: run.sh\ntags:\n  - example\n---\n# Demo\n";

fn build_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        zip.start_file(*name, SimpleFileOptions::default().unix_permissions(0o755))
            .unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn demo_zip() -> Vec<u8> {
    build_zip(&[
        ("demo/SKILL.md", SKILL_MD),
        ("demo/run.sh", "#!/bin/sh\necho demo\n"),
        ("demo/lib/helper.sh", "echo helper\n"),
    ])
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn index_json(slug: &str, download_url: &str, sha256: &str) -> String {
    serde_json::json!({
        "version": "1",
        "updated_at": "2024-05-01T00:00:00Z",
        "skills": [{
            "slug": slug,
            "name": "Demo",
            "version": "1.0.0",
            "download_url": download_url,
            "sha256": sha256,
            "entrypoint": "run.sh",
            "tags": ["example"],
        }]
    })
    .to_string()
}

struct Registry {
    server: mockito::ServerGuard,
    _mocks: Vec<mockito::Mock>,
}

impl Registry {
    async fn new() -> Self {
        Self {
            server: mockito::Server::new_async().await,
            _mocks: Vec::new(),
        }
    }

    async fn serve(&mut self, path: &str, body: Vec<u8>) {
        let mock = self
            .server
            .mock("GET", path)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
        self._mocks.push(mock);
    }

    /// Serve an index at `/<name>/index.json` listing `slug` at `download_url`
    /// with `digest`. Returns the index URL.
    async fn publish_index(
        &mut self,
        name: &str,
        slug: &str,
        download_url: &str,
        digest: &str,
    ) -> String {
        let index_path = format!("/{name}/index.json");
        let body = index_json(slug, download_url, digest);
        self.serve(&index_path, body.into_bytes()).await;
        format!("{}{index_path}", self.server.url())
    }

    /// Serve `archive` at `/<name>/pkg.zip` and an index for `slug` at
    /// `/<name>/index.json` advertising `digest`.
    async fn publish(&mut self, name: &str, slug: &str, archive: Vec<u8>, digest: &str) -> String {
        let archive_path = format!("/{name}/pkg.zip");
        self.serve(&archive_path, archive).await;
        let download_url = format!("{}{archive_path}", self.server.url());
        self.publish_index(name, slug, &download_url, digest).await
    }
}

fn installer(index_url: &str, root: &Path) -> Installer {
    let client = reqwest::Client::new();
    Installer::new(
        root.join("skills"),
        LockfileStore::new(root.join("skills-lock.json")),
        IndexClient::with_client(index_url, client.clone(), 1024 * 1024),
        Fetcher::with_client(client, 16 * 1024 * 1024),
    )
}

/// Every file under `root` with its content, for byte-level comparisons.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            (
                e.path().strip_prefix(root).unwrap().to_path_buf(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect()
}

/// Visible entries in the install directory.
fn visible_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .map(|rd| {
            rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| !n.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn hidden_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .map(|rd| {
            rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with('.') && n != ".skillhub.lock")
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn install_from_index_end_to_end() {
    let archive = demo_zip();
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    let index_url = registry.publish("good", "demo", archive, &digest).await;

    let tmp = tempfile::tempdir().unwrap();
    let installer = installer(&index_url, tmp.path());
    let installed = installer.install("demo").await.unwrap();

    let root = tmp.path().join("skills/demo");
    assert_eq!(installed.root, root);
    assert!(root.join("run.sh").is_file());
    assert!(root.join("lib/helper.sh").is_file());
    assert!(installed.files.contains(Path::new("run.sh")));
    assert_eq!(installed.skill.checksum, digest);

    let locked = installer.lockfile().list_installed().unwrap();
    assert_eq!(locked["demo"].version, "1.0.0");
    assert_eq!(locked["demo"].checksum, digest);

    let health = check_installed(installer.target_dir(), installer.lockfile()).unwrap();
    assert_eq!(health, BTreeMap::from([("demo".to_string(), true)]));
    assert!(hidden_entries(installer.target_dir()).is_empty());
}

#[tokio::test]
async fn digest_mismatch_leaves_target_absent() {
    let mut registry = Registry::new().await;
    let index_url = registry
        .publish("bad", "demo", demo_zip(), &"0".repeat(64))
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let installer = installer(&index_url, tmp.path());
    let err = installer.install("demo").await.unwrap_err();

    assert!(matches!(err, Error::Integrity { .. }), "{err}");
    assert!(!tmp.path().join("skills/demo").exists());
    assert!(installer.lockfile().list_installed().unwrap().is_empty());
    assert!(hidden_entries(installer.target_dir()).is_empty());
}

#[tokio::test]
async fn digest_mismatch_keeps_previous_install() {
    let archive = demo_zip();
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    let good = registry.publish("good", "demo", archive, &digest).await;
    let tampered = build_zip(&[("demo/run.sh", "rm -rf /\n")]);
    let bad = registry.publish("bad", "demo", tampered, &digest).await;

    let tmp = tempfile::tempdir().unwrap();
    installer(&good, tmp.path()).install("demo").await.unwrap();
    let before = snapshot(&tmp.path().join("skills/demo"));

    let err = installer(&bad, tmp.path()).install("demo").await.unwrap_err();
    assert!(matches!(err, Error::Integrity { .. }));
    assert_eq!(snapshot(&tmp.path().join("skills/demo")), before);
}

#[tokio::test]
async fn reinstall_is_idempotent() {
    let archive = demo_zip();
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    let index_url = registry.publish("good", "demo", archive, &digest).await;

    let fresh = tempfile::tempdir().unwrap();
    installer(&index_url, fresh.path()).install("demo").await.unwrap();

    let twice = tempfile::tempdir().unwrap();
    let installer = installer(&index_url, twice.path());
    installer.install("demo").await.unwrap();
    installer.install("demo").await.unwrap();

    let locked = installer.lockfile().list_installed().unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(
        snapshot(&twice.path().join("skills/demo")),
        snapshot(&fresh.path().join("skills/demo"))
    );
    assert_eq!(visible_entries(installer.target_dir()), vec!["demo"]);
    assert!(hidden_entries(installer.target_dir()).is_empty());
}

#[tokio::test]
async fn traversal_archive_is_rejected() {
    let archive = build_zip(&[
        ("evil/run.sh", "echo\n"),
        ("../../etc/passwd", "root::0:0\n"),
    ]);
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    let index_url = registry.publish("evil", "evil", archive, &digest).await;

    let tmp = tempfile::tempdir().unwrap();
    let installer = installer(&index_url, tmp.path());
    let err = installer.install("evil").await.unwrap_err();

    match err {
        Error::PathTraversal { entry, .. } => assert_eq!(entry, "../../etc/passwd"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(visible_entries(installer.target_dir()).is_empty());
    assert!(hidden_entries(installer.target_dir()).is_empty());
    assert!(!tmp.path().join("etc").exists());
    assert!(installer.lockfile().list_installed().unwrap().is_empty());
}

#[tokio::test]
async fn flat_archive_installs_as_is() {
    let archive = build_zip(&[("run.sh", "echo flat\n"), ("data/x.txt", "x")]);
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    let index_url = registry.publish("flat", "demo", archive, &digest).await;

    let tmp = tempfile::tempdir().unwrap();
    let installer = installer(&index_url, tmp.path());
    installer.install("demo").await.unwrap();

    let root = tmp.path().join("skills/demo");
    assert_eq!(fs::read_to_string(root.join("run.sh")).unwrap(), "echo flat\n");
    assert!(root.join("data/x.txt").is_file());
}

#[tokio::test]
async fn unknown_slug_is_not_found() {
    let mut registry = Registry::new().await;
    let index_url = registry
        .publish("good", "demo", demo_zip(), &"0".repeat(64))
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let err = installer(&index_url, tmp.path())
        .install("missing")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn uninstall_after_install() {
    let archive = demo_zip();
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    let index_url = registry.publish("good", "demo", archive, &digest).await;

    let tmp = tempfile::tempdir().unwrap();
    let installer = installer(&index_url, tmp.path());
    assert!(!installer.uninstall("demo").await.unwrap().found());

    installer.install("demo").await.unwrap();
    let removal = installer.uninstall("demo").await.unwrap();
    assert!(removal.removed_dir && removal.removed_entry);
    assert!(!tmp.path().join("skills/demo").exists());
    assert!(
        check_installed(installer.target_dir(), installer.lockfile())
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn network_index_cannot_point_at_local_files() {
    let tmp = tempfile::tempdir().unwrap();
    let private = tmp.path().join("private");
    fs::create_dir_all(&private).unwrap();
    let archive = demo_zip();
    let digest = sha256_hex(&archive);
    let outside = private.join("outside.zip");
    fs::write(&outside, &archive).unwrap();

    let mut registry = Registry::new().await;
    let as_path = registry
        .publish_index("path", "demo", &outside.display().to_string(), &digest)
        .await;
    let file_url = url::Url::from_file_path(&outside).unwrap().to_string();
    let as_file_url = registry
        .publish_index("file", "demo", &file_url, &digest)
        .await;

    for index_url in [as_path, as_file_url] {
        let installer = installer(&index_url, tmp.path());
        let err = installer.install("demo").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch, "{err}");
        assert!(!tmp.path().join("skills/demo").exists());
        assert!(installer.lockfile().list_installed().unwrap().is_empty());
    }
}

#[tokio::test]
async fn relative_download_url_resolves_against_index() {
    let archive = demo_zip();
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    registry.serve("/rel/pkgs/demo.zip", archive).await;
    let index_url = registry
        .publish_index("rel", "demo", "pkgs/demo.zip", &digest)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    installer(&index_url, tmp.path()).install("demo").await.unwrap();
    assert!(tmp.path().join("skills/demo/run.sh").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_installs_of_one_skill_serialize() {
    let archive = demo_zip();
    let digest = sha256_hex(&archive);
    let mut registry = Registry::new().await;
    let index_url = registry.publish("good", "demo", archive, &digest).await;

    let fresh = tempfile::tempdir().unwrap();
    installer(&index_url, fresh.path()).install("demo").await.unwrap();

    let shared = tempfile::tempdir().unwrap();
    let installer = installer(&index_url, shared.path());
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let installer = installer.clone();
            tokio::spawn(async move { installer.install("demo").await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let locked = installer.lockfile().list_installed().unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked["demo"].checksum, digest);
    assert_eq!(
        snapshot(&shared.path().join("skills/demo")),
        snapshot(&fresh.path().join("skills/demo"))
    );
    assert_eq!(visible_entries(installer.target_dir()), vec!["demo"]);
    assert!(hidden_entries(installer.target_dir()).is_empty());
}
