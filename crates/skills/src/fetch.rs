//! Archive download with streaming SHA-256 verification.

use std::{
    fmt,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use {
    sha2::{Digest, Sha256},
    skillhub_config::FetchConfig,
    tempfile::TempPath,
    tokio::io::AsyncWriteExt,
    tracing::{debug, info},
    url::Url,
};

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 8 * 1024;

/// A downloaded artifact on local disk. The file is removed on drop.
#[derive(Debug)]
pub struct Download {
    pub path: TempPath,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
    pub size: u64,
}

/// Build the HTTP client shared by index and archive fetches.
pub fn http_client(config: &FetchConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| Error::fetch("http client", e))
}

/// Resolve `location` to a filesystem path when it is a `file://` URL or a
/// bare path rather than a network URL.
pub(crate) fn local_source(location: &str) -> Option<PathBuf> {
    match Url::parse(location) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
        Ok(_) => None,
        Err(_) => Some(PathBuf::from(location)),
    }
}

/// Where an artifact is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local(PathBuf),
    Remote(Url),
}

impl Source {
    /// Resolve `location` as listed in the document at `base`.
    ///
    /// Filesystem locations are honoured only when `base` is itself local.
    /// Under a network index every location is joined against the index URL
    /// and must come out as http(s).
    pub fn resolve(base: &str, location: &str) -> Result<Self> {
        if let Some(base_path) = local_source(base) {
            return match local_source(location) {
                Some(path) if path.is_relative() => {
                    let dir = base_path.parent().unwrap_or(Path::new(""));
                    Ok(Self::Local(dir.join(path)))
                },
                Some(path) => Ok(Self::Local(path)),
                None => {
                    let url = Url::parse(location).map_err(|e| Error::fetch(location, e))?;
                    Self::network(location, url)
                },
            };
        }

        let base_url = Url::parse(base).map_err(|e| Error::fetch(base, e))?;
        let url = base_url
            .join(location)
            .map_err(|e| Error::fetch(location, e))?;
        Self::network(location, url)
    }

    fn network(location: &str, url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Remote(url)),
            other => Err(Error::fetch(
                location,
                format!("'{other}' locations are not allowed in a network index"),
            )),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// Streams remote or local artifacts into temporary files.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self::with_client(
            http_client(config)?,
            config.max_download_bytes,
        ))
    }

    pub fn with_client(client: reqwest::Client, max_bytes: u64) -> Self {
        Self { client, max_bytes }
    }

    /// Download `source` into a temporary file inside `dir`, hashing as it
    /// goes.
    ///
    /// The body is never held in memory as a whole. Transport failures,
    /// non-success statuses and oversize bodies all surface as
    /// [`Error::Fetch`].
    pub async fn download(&self, source: &Source, dir: &Path) -> Result<Download> {
        let url = match source {
            Source::Local(path) => return self.copy_local(path.clone(), dir).await,
            Source::Remote(url) => url.as_str(),
        };

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
            return Err(self.too_large(url));
        }

        let (file, path) = temp_file_in(dir)?.into_parts();
        let mut out = tokio::fs::File::from_std(file);
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        while let Some(chunk) = resp.chunk().await.map_err(|e| Error::fetch(url, e))? {
            size += chunk.len() as u64;
            if size > self.max_bytes {
                return Err(self.too_large(url));
            }
            hasher.update(&chunk);
            out.write_all(&chunk)
                .await
                .map_err(|e| Error::io_at(&path, e))?;
        }
        out.flush().await.map_err(|e| Error::io_at(&path, e))?;

        let sha256 = format!("{:x}", hasher.finalize());
        debug!(%url, size, %sha256, "download complete");
        Ok(Download { path, sha256, size })
    }

    /// Download `source` and confirm its digest matches `expected`.
    pub async fn fetch_verified(
        &self,
        source: &Source,
        expected: &str,
        dir: &Path,
    ) -> Result<Download> {
        let download = self.download(source, dir).await?;
        verify_digest(&download.sha256, expected)?;
        info!(%source, sha256 = %download.sha256, "archive digest verified");
        Ok(download)
    }

    async fn copy_local(&self, source: PathBuf, dir: &Path) -> Result<Download> {
        let url = source.display().to_string();
        let dir = dir.to_path_buf();
        let max_bytes = self.max_bytes;
        tokio::task::spawn_blocking(move || -> Result<Download> {
            let mut input = std::fs::File::open(&source).map_err(|e| Error::fetch(&url, e))?;
            let (mut file, path) = temp_file_in(&dir)?.into_parts();
            let (sha256, size) = copy_hashed(&mut input, &mut file, max_bytes)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::FileTooLarge => {
                        Error::fetch(&url, format!("download exceeds {max_bytes} bytes"))
                    },
                    _ => Error::io_at(&source, e),
                })?;
            debug!(%url, size, %sha256, "local artifact copied");
            Ok(Download { path, sha256, size })
        })
        .await?
    }

    fn too_large(&self, url: &str) -> Error {
        Error::fetch(url, format!("download exceeds {} bytes", self.max_bytes))
    }
}

fn temp_file_in(dir: &Path) -> Result<tempfile::NamedTempFile> {
    std::fs::create_dir_all(dir).map_err(|e| Error::io_at(dir, e))?;
    tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(dir)
        .map_err(|e| Error::io_at(dir, e))
}

/// Copy `input` to `output` in fixed-size chunks, returning the hex digest and
/// byte count.
fn copy_hashed(
    input: &mut impl Read,
    output: &mut impl Write,
    max_bytes: u64,
) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        if size > max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::FileTooLarge,
                "size limit exceeded",
            ));
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
    }
    output.flush()?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// SHA-256 of a file, streamed in 8 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io_at(path, e))?;
    let (digest, _) =
        copy_hashed(&mut file, &mut std::io::sink(), u64::MAX).map_err(|e| Error::io_at(path, e))?;
    Ok(digest)
}

/// Compare digests case-insensitively.
pub fn verify_digest(actual: &str, expected: &str) -> Result<()> {
    let expected = expected.trim();
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::Integrity {
            expected: expected.to_ascii_lowercase(),
            actual: actual.to_ascii_lowercase(),
        })
    }
}
