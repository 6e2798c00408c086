#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Releases with published reference results, oldest first.
pub const BUILTIN_RELEASES: [(&str, &str); 5] = [
    ("0.5.11", "0-5-11"),
    ("0.5.12", "0-5-12"),
    ("0.5.13", "0-5-13"),
    ("0.5.14", "0-5-14"),
    ("0.6.0", "0-6-0"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub tag: String,
    pub suffix: String,
}

impl ReleaseEntry {
    #[must_use]
    pub fn new(tag: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            suffix: suffix.into(),
        }
    }
}

/// Filesystem-safe token inserted into reference file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ReferenceSuffix(String);

impl ReferenceSuffix {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "no reference results available for release '{requested}'\n{}",
    render_release_listing(.known)
)]
pub struct UnknownRelease {
    pub requested: String,
    pub known: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("release registry is empty")]
    Empty,
    #[error("release '{0}' is registered more than once")]
    DuplicateTag(String),
    #[error("release '{tag}' has suffix '{suffix}' which is not filesystem-safe")]
    UnsafeSuffix { tag: String, suffix: String },
}

#[must_use]
pub fn render_release_listing(known: &[String]) -> String {
    let mut out = String::from("Available releases:");
    for tag in known {
        out.push_str("\n  ");
        out.push_str(tag);
    }
    out
}

fn is_filesystem_safe(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

/// Release tag to reference suffix lookup table.
///
/// Insertion order is significant: the last entry is the newest release and
/// the default comparison target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRegistry {
    entries: Vec<ReleaseEntry>,
}

impl ReleaseRegistry {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_RELEASES
                .iter()
                .map(|(tag, suffix)| ReleaseEntry::new(*tag, *suffix))
                .collect(),
        }
    }

    pub fn from_entries(entries: Vec<ReleaseEntry>) -> Result<Self, RegistryError> {
        if entries.is_empty() {
            return Err(RegistryError::Empty);
        }
        for (idx, entry) in entries.iter().enumerate() {
            if entries[..idx].iter().any(|prior| prior.tag == entry.tag) {
                return Err(RegistryError::DuplicateTag(entry.tag.clone()));
            }
            if !is_filesystem_safe(&entry.suffix) {
                return Err(RegistryError::UnsafeSuffix {
                    tag: entry.tag.clone(),
                    suffix: entry.suffix.clone(),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn resolve(&self, release_tag: &str) -> Result<ReferenceSuffix, UnknownRelease> {
        let requested = release_tag.trim();
        self.entries
            .iter()
            .find(|entry| entry.tag == requested)
            .map(|entry| ReferenceSuffix(entry.suffix.clone()))
            .ok_or_else(|| UnknownRelease {
                requested: requested.to_string(),
                known: self.tags().map(str::to_string).collect(),
            })
    }

    #[must_use]
    pub fn newest(&self) -> &ReleaseEntry {
        // from_entries/builtin never build an empty registry
        &self.entries[self.entries.len() - 1]
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.tag.as_str())
    }
}

impl Default for ReleaseRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
