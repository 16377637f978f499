use {
    skillhub_config::FetchConfig,
    tracing::{debug, info},
};

use crate::{
    error::{Error, Result},
    fetch::{Source, http_client, local_source},
    types::{IndexEntry, SkillIndex},
};

impl SkillIndex {
    /// Parse an index document.
    pub fn from_json(url: &str, data: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(data).map_err(|e| Error::fetch(url, e))?;
        if index.version.is_empty() || index.updated_at.is_empty() {
            debug!(%url, "index document omits version or updated_at");
        }
        Ok(index)
    }

    /// The entry whose slug is exactly `slug`.
    pub fn resolve(&self, slug: &str) -> Result<&IndexEntry> {
        self.skills
            .iter()
            .find(|e| e.slug == slug)
            .ok_or_else(|| Error::not_found("skill", slug))
    }
}

/// Fetches the registry index. Never retries; every transport or decoding
/// failure is an [`Error::Fetch`].
#[derive(Debug, Clone)]
pub struct IndexClient {
    url: String,
    client: reqwest::Client,
    max_bytes: u64,
}

impl IndexClient {
    pub fn new(url: impl Into<String>, config: &FetchConfig) -> Result<Self> {
        Ok(Self::with_client(
            url,
            http_client(config)?,
            config.max_download_bytes,
        ))
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client, max_bytes: u64) -> Self {
        Self {
            url: url.into(),
            client,
            max_bytes,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Where to download `entry`'s archive from, resolved against this index.
    pub fn archive_source(&self, entry: &IndexEntry) -> Result<Source> {
        Source::resolve(&self.url, &entry.download_url)
    }

    pub async fn fetch(&self) -> Result<SkillIndex> {
        let url = self.url.as_str();
        let data = match local_source(url) {
            Some(path) => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| Error::fetch(url, e))?;
                if meta.len() > self.max_bytes {
                    return Err(self.too_large());
                }
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::fetch(url, e))?
            },
            None => self.fetch_remote().await?,
        };

        let index = SkillIndex::from_json(url, &data)?;
        info!(%url, skills = index.skills.len(), "fetched skill index");
        Ok(index)
    }

    /// Fetch the index and return the entry for `slug`.
    pub async fn resolve(&self, slug: &str) -> Result<IndexEntry> {
        self.fetch().await?.resolve(slug).cloned()
    }

    async fn fetch_remote(&self) -> Result<Vec<u8>> {
        let url = self.url.as_str();
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::fetch(url, format!("HTTP {status}")));
        }
        if let Some(len) = resp.content_length()
            && len > self.max_bytes
        {
            return Err(self.too_large());
        }

        let mut data = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| Error::fetch(url, e))? {
            if (data.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(self.too_large());
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    fn too_large(&self) -> Error {
        Error::fetch(&self.url, format!("index exceeds {} bytes", self.max_bytes))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::error::ErrorKind};

    const MAX: u64 = 1024 * 1024;

    fn client(url: impl Into<String>) -> IndexClient {
        IndexClient::with_client(url, reqwest::Client::new(), MAX)
    }

    const INDEX: &str = r#"{
        "version": "1",
        "updated_at": "2024-01-01",
        "skills": [
            {"slug": "demo", "name": "Demo", "version": "1.0.0",
             "download_url": "https://x/demo.zip", "sha256": "ab", "entrypoint": "run.sh",
             "tags": ["a"]},
            {"slug": "other", "download_url": "https://x/other.zip"}
        ]
    }"#;

    #[test]
    fn resolve_exact_slug() {
        let index = SkillIndex::from_json("test", INDEX.as_bytes()).unwrap();
        assert_eq!(index.resolve("demo").unwrap().display_name(), "Demo");
        assert_eq!(index.resolve("other").unwrap().display_name(), "other");
        let err = index.resolve("Demo").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn minimal_index_is_accepted() {
        let index = SkillIndex::from_json(
            "test",
            br#"{"skills":[{"slug":"demo","download_url":"https://x/demo.zip","sha256":"00","entrypoint":"run.sh"}]}"#,
        )
        .unwrap();
        assert!(index.version.is_empty());
        assert_eq!(index.skills.len(), 1);
    }

    #[test]
    fn malformed_index_is_fetch_error() {
        for doc in [&b"[]"[..], b"{\"version\":\"1\"}", b"not json"] {
            let err = SkillIndex::from_json("test", doc).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Fetch);
        }
    }

    #[tokio::test]
    async fn fetch_over_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/index.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(INDEX)
            .create_async()
            .await;

        let client = client(format!("{}/index.json", server.url()));
        let entry = client.resolve("demo").await.unwrap();
        mock.assert_async().await;
        assert_eq!(entry.version, "1.0.0");
        assert_eq!(entry.expected_digest(), Some("ab"));
    }

    #[tokio::test]
    async fn server_error_is_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/index.json")
            .with_status(500)
            .create_async()
            .await;

        let client = client(format!("{}/index.json", server.url()));
        let err = client.fetch().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn fetch_from_file_url() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.json");
        std::fs::write(&path, INDEX).unwrap();

        let url = url::Url::from_file_path(&path).unwrap().to_string();
        assert_eq!(client(url).fetch().await.unwrap().skills.len(), 2);

        let missing = client(tmp.path().join("nope.json").display().to_string());
        assert_eq!(missing.fetch().await.unwrap_err().kind(), ErrorKind::Fetch);
    }

    #[tokio::test]
    async fn oversize_index_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/index.json")
            .with_status(200)
            .with_body(vec![b' '; 4096])
            .create_async()
            .await;

        let client =
            IndexClient::with_client(format!("{}/index.json", server.url()), reqwest::Client::new(), 100);
        let err = client.fetch().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(err.to_string().contains("exceeds 100 bytes"), "{err}");

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.json");
        std::fs::write(&path, vec![b' '; 4096]).unwrap();
        let local = IndexClient::with_client(path.display().to_string(), reqwest::Client::new(), 100);
        assert!(local.fetch().await.unwrap_err().to_string().contains("exceeds"));
    }

    #[test]
    fn archive_source_follows_index_origin() {
        let index = SkillIndex::from_json("test", INDEX.as_bytes()).unwrap();
        let mut entry = index.resolve("demo").unwrap().clone();

        entry.download_url = "pkgs/demo.zip".into();
        let remote = client("https://hub.example/index.json");
        assert_eq!(
            remote.archive_source(&entry).unwrap().to_string(),
            "https://hub.example/pkgs/demo.zip"
        );
        entry.download_url = "file:///etc/passwd".into();
        assert_eq!(remote.archive_source(&entry).unwrap_err().kind(), ErrorKind::Fetch);

        let local = client("/srv/mirror/index.json");
        entry.download_url = "demo.zip".into();
        assert_eq!(
            local.archive_source(&entry).unwrap(),
            Source::Local("/srv/mirror/demo.zip".into())
        );
    }
}
