use crate::schema::FieldError;

/// Coarse failure classes, for callers that map errors to exit or status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Validation,
    Fetch,
    Integrity,
    PathTraversal,
    NotFound,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed metadata document, index, or lockfile.
    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },
    #[error("validation failed: {}", join_errors(.errors))]
    Validation { errors: Vec<FieldError> },
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    /// The index entry carries no digest and unverified installs are disabled.
    #[error("refusing to install '{slug}': index entry has no sha256 to verify against")]
    ChecksumMissing { slug: String },
    #[error("unsafe archive entry '{entry}': {reason}")]
    PathTraversal { entry: String, reason: &'static str },
    #[error("{what} '{name}' not found")]
    NotFound { what: &'static str, name: String },
    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),
    #[error("{context}: {source}")]
    IoAt {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn parse(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn fetch(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn traversal(entry: impl Into<String>, reason: &'static str) -> Self {
        Self::PathTraversal {
            entry: entry.into(),
            reason,
        }
    }

    #[must_use]
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![FieldError::new(path, message)],
        }
    }

    #[must_use]
    pub fn io_at(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::IoAt {
            context: path.display().to_string(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } | Self::Archive(_) => ErrorKind::Parse,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Integrity { .. } | Self::ChecksumMissing { .. } => ErrorKind::Integrity,
            Self::PathTraversal { .. } => ErrorKind::PathTraversal,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::IoAt { .. } | Self::Io(_) => ErrorKind::Io,
        }
    }
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        let context = err
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "directory walk".into());
        match err.into_io_error() {
            Some(source) => Self::IoAt { context, source },
            None => Self::IoAt {
                context,
                source: std::io::Error::other("filesystem loop detected"),
            },
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
