use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

// ── Frontmatter values ───────────────────────────────────────────────────────

/// A single value from a metadata block: either a scalar or a `-` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::Scalar(_) => None,
            Self::List(items) => Some(items),
        }
    }
}

/// Parsed metadata block, keyed by field name.
pub type Frontmatter = BTreeMap<String, FieldValue>;

// ── Skill metadata ───────────────────────────────────────────────────────────

/// Declared attributes of a skill.
///
/// Built fresh from a `SKILL.md` metadata block or an index entry; never
/// persisted as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    /// Unique identifier; doubles as the install directory name.
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Path relative to the install root that runs or loads the skill.
    pub entrypoint: String,
    /// Declared relative paths shipped with the skill.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default = "default_license")]
    pub license: String,
    /// Lowercase hex SHA-256, or empty when unknown.
    #[serde(default)]
    pub checksum: String,
    /// Declared, never resolved here.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctos: Option<PlatformMeta>,
    /// Unknown metadata keys, kept for forward compatibility.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, FieldValue>,
    /// Directory the skill was read from, when it came from disk.
    #[serde(skip)]
    pub path: PathBuf,
}

pub(crate) fn default_license() -> String {
    "MIT".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

/// Host-platform compatibility block (`ctos.*` keys in frontmatter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMeta {
    pub version: String,
    #[serde(default)]
    pub compatible_with: Vec<String>,
    #[serde(default)]
    pub upgrade_policy: UpgradePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradePolicy {
    Auto,
    Manual,
    #[default]
    Notify,
}

impl UpgradePolicy {
    pub const NAMES: &'static [&'static str] = &["auto", "manual", "notify"];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "notify" => Some(Self::Notify),
            _ => None,
        }
    }
}

// ── Remote index ─────────────────────────────────────────────────────────────

/// Registry index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillIndex {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub updated_at: String,
    pub skills: Vec<IndexEntry>,
}

/// One downloadable skill in the registry index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Routing key; may differ from the skill's own name.
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    pub download_url: String,
    /// Expected archive digest.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl IndexEntry {
    /// The expected digest, ignoring blank values.
    pub fn expected_digest(&self) -> Option<&str> {
        self.sha256
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Display name, falling back to the slug.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.slug
        } else {
            &self.name
        }
    }

    /// Build the skill record that a verified install of this entry produces.
    ///
    /// The skill is keyed by slug so the lockfile and the install directory
    /// agree.
    pub fn to_skill(&self, checksum: &str) -> Skill {
        Skill {
            name: self.slug.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            tags: self.tags.iter().cloned().collect(),
            entrypoint: self.entrypoint.clone(),
            files: Vec::new(),
            license: default_license(),
            checksum: checksum.to_ascii_lowercase(),
            dependencies: Vec::new(),
            ctos: None,
            extra: BTreeMap::new(),
            path: PathBuf::new(),
        }
    }
}

// ── Lockfile ─────────────────────────────────────────────────────────────────

/// Persisted record of installed skills.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    #[serde(default)]
    pub skills: BTreeMap<String, LockEntry>,
}

impl Lockfile {
    /// Insert or overwrite the entry for `skill`.
    pub fn add(&mut self, skill: &Skill, installed_at_ms: u64) {
        self.skills.insert(skill.name.clone(), LockEntry {
            version: skill.version.clone(),
            checksum: skill.checksum.clone(),
            entrypoint: (!skill.entrypoint.is_empty()).then(|| skill.entrypoint.clone()),
            installed_at_ms: Some(installed_at_ms),
        });
    }

    /// Remove `name`, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.skills.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&LockEntry> {
        self.skills.get(name)
    }
}

/// A single installed skill in the lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub version: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at_ms: Option<u64>,
}

// ── Install results ──────────────────────────────────────────────────────────

/// What a successful install produced.
#[derive(Debug, Clone)]
pub struct InstalledSkill {
    pub skill: Skill,
    /// Final install root, `target_dir/<slug>`.
    pub root: PathBuf,
    /// Paths relative to `root`.
    pub files: BTreeSet<PathBuf>,
}
