//! Skill packages: metadata parsing and validation, remote index, verified
//! download, safe extraction, atomic install and lockfile bookkeeping.
//!
//! A skill is a directory holding a `SKILL.md` document whose leading
//! `---` block declares its metadata, plus the files it ships.

pub mod discover;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod health;
pub mod index;
pub mod install;
pub mod lockfile;
pub mod pack;
pub mod parse;
pub mod schema;
pub mod types;

pub use {
    error::{Error, ErrorKind, Result},
    install::{Installer, Removal},
};
