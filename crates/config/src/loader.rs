use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    schema::{SkillhubConfig, ValidationLevel},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "skillhub.toml",
    "skillhub.yaml",
    "skillhub.yml",
    "skillhub.json",
];

static DATA_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<SkillhubConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg = parse_config(&raw, path)?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./skillhub.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/skillhub/skillhub.{toml,yaml,yml,json}` (user-global)
///
/// Returns defaults (plus env overrides) if no usable config file is found.
pub fn discover_and_load() -> SkillhubConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    let mut cfg = SkillhubConfig::default();
    apply_env_overrides(&mut cfg);
    cfg
}

/// Apply `SKILLHUB_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(cfg: &mut SkillhubConfig) {
    apply_overrides_with(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides_with(cfg: &mut SkillhubConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("SKILLHUB_INDEX_URL").filter(|v| !v.trim().is_empty()) {
        cfg.index_url = url;
    }
    if let Some(dir) = lookup("SKILLHUB_INSTALL_DIR").filter(|v| !v.trim().is_empty()) {
        cfg.install_dir = Some(PathBuf::from(dir));
    }
    if let Some(path) = lookup("SKILLHUB_LOCKFILE").filter(|v| !v.trim().is_empty()) {
        cfg.lockfile = Some(PathBuf::from(path));
    }
    if let Some(raw) = lookup("SKILLHUB_REQUIRE_CHECKSUM") {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => cfg.security.require_checksum = true,
            "0" | "false" | "no" | "off" => cfg.security.require_checksum = false,
            other => warn!(value = %other, "ignoring unrecognised SKILLHUB_REQUIRE_CHECKSUM"),
        }
    }
    if let Some(raw) = lookup("SKILLHUB_VALIDATION") {
        match raw.parse::<ValidationLevel>() {
            Ok(level) => cfg.validation = level,
            Err(e) => warn!(error = %e, "ignoring SKILLHUB_VALIDATION"),
        }
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/skillhub/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "skillhub").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory holding installed skills and the lockfile.
///
/// An explicit [`set_data_dir`] wins over the platform default.
pub fn data_dir() -> PathBuf {
    let guard = DATA_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(dir) = guard.as_ref() {
        return dir.clone();
    }
    directories::ProjectDirs::from("", "", "skillhub")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".skillhub"))
}

/// Override the data directory for the rest of the process.
pub fn set_data_dir(dir: PathBuf) {
    let mut guard = DATA_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(dir);
}

/// Drop a previous [`set_data_dir`] override.
pub fn clear_data_dir() {
    let mut guard = DATA_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = None;
}

fn parse_config(raw: &str, path: &Path) -> Result<SkillhubConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    let invalid = |message: String| Error::Invalid {
        path: path.to_path_buf(),
        message,
    };
    match ext {
        "toml" => toml::from_str(raw).map_err(|e| invalid(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| invalid(e.to_string())),
        "json" => serde_json::from_str(raw).map_err(|e| invalid(e.to_string())),
        _ => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}
