/// Config schema types (index location, install paths, fetch limits, security).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Registry index used when nothing else is configured.
pub const DEFAULT_INDEX_URL: &str =
    "https://raw.githubusercontent.com/yazelin/ching-tech-os-skillhub/main/index.json";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillhubConfig {
    /// Location of the remote index (`https://`, `http://` or `file://`).
    pub index_url: String,
    /// Where skills are installed. Defaults to `<data_dir>/skills`.
    pub install_dir: Option<PathBuf>,
    /// Lockfile location. Defaults to `<data_dir>/skills-lock.json`.
    pub lockfile: Option<PathBuf>,
    pub fetch: FetchConfig,
    pub security: SecurityConfig,
    /// Which schema validation level runs on local installs and `check`.
    pub validation: ValidationLevel,
}

impl Default for SkillhubConfig {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_INDEX_URL.into(),
            install_dir: None,
            lockfile: None,
            fetch: FetchConfig::default(),
            security: SecurityConfig::default(),
            validation: ValidationLevel::default(),
        }
    }
}

impl SkillhubConfig {
    /// Install directory, falling back to `<data_dir>/skills`.
    pub fn resolved_install_dir(&self) -> PathBuf {
        self.install_dir
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("skills"))
    }

    /// Lockfile path, falling back to `<data_dir>/skills-lock.json`.
    pub fn resolved_lockfile(&self) -> PathBuf {
        self.lockfile
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("skills-lock.json"))
    }
}

/// Network fetch limits for index and archive downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout. Expiry surfaces as a fetch error; nothing retries.
    pub timeout_secs: u64,
    /// Downloads larger than this are aborted.
    pub max_download_bytes: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_download_bytes: 64 * 1024 * 1024,
            user_agent: concat!("skillhub/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Refuse to install an archive whose index entry carries no sha256.
    pub require_checksum: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_checksum: true,
        }
    }
}

/// Schema validation level.
///
/// `Basic` only checks that required fields are present and accepts a
/// superset of what `Strict` accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    #[default]
    Strict,
    Basic,
}

impl std::fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Basic => write!(f, "basic"),
        }
    }
}

impl std::str::FromStr for ValidationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "basic" => Ok(Self::Basic),
            other => Err(format!("unknown validation level '{other}'")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fail_closed() {
        let cfg = SkillhubConfig::default();
        assert!(cfg.security.require_checksum);
        assert_eq!(cfg.validation, ValidationLevel::Strict);
        assert_eq!(cfg.fetch.timeout_secs, 30);
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let cfg: SkillhubConfig = toml::from_str(
            r#"
index_url = "file:///srv/index.json"
validation = "basic"

[fetch]
timeout_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(cfg.index_url, "file:///srv/index.json");
        assert_eq!(cfg.validation, ValidationLevel::Basic);
        assert_eq!(cfg.fetch.timeout_secs, 5);
        assert_eq!(cfg.fetch.max_download_bytes, 64 * 1024 * 1024);
        assert!(cfg.security.require_checksum);
    }

    #[test]
    fn validation_level_from_str() {
        assert_eq!("STRICT".parse::<ValidationLevel>(), Ok(ValidationLevel::Strict));
        assert_eq!(" basic".parse::<ValidationLevel>(), Ok(ValidationLevel::Basic));
        assert!("loose".parse::<ValidationLevel>().is_err());
    }
}
