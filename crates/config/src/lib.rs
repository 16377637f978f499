//! Configuration loading and data-directory resolution.
//!
//! Config files: `skillhub.toml`, `skillhub.yaml`, or `skillhub.json`
//! Searched in `./` then `~/.config/skillhub/`.
//!
//! `SKILLHUB_*` environment variables override file values.

pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{
        apply_env_overrides, clear_data_dir, config_dir, data_dir, discover_and_load, load_config,
        set_data_dir,
    },
    schema::{DEFAULT_INDEX_URL, FetchConfig, SecurityConfig, SkillhubConfig, ValidationLevel},
};
