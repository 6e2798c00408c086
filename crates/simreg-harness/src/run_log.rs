#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// One line of the JSONL run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub ts_unix_ms: u64,
    pub phase: String,
    pub case_id: Option<String>,
    pub dataset: Option<String>,
    pub outcome: String,
    pub relative_error: Option<f64>,
    pub reason_code: Option<String>,
    pub detail: Option<String>,
}

impl RunLogEntry {
    #[must_use]
    pub fn new(phase: &str, outcome: &str) -> Self {
        Self {
            ts_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            phase: phase.to_string(),
            case_id: None,
            dataset: None,
            outcome: outcome.to_string(),
            relative_error: None,
            reason_code: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn case(mut self, case_id: &str) -> Self {
        self.case_id = Some(case_id.to_string());
        self
    }

    #[must_use]
    pub fn dataset(mut self, dataset: &str) -> Self {
        self.dataset = Some(dataset.to_string());
        self
    }

    #[must_use]
    pub fn relative_error(mut self, value: f64) -> Self {
        self.relative_error = Some(value);
        self
    }

    #[must_use]
    pub fn failure(mut self, reason_code: &str, detail: impl Into<String>) -> Self {
        self.reason_code = Some(reason_code.to_string());
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("failed creating {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed opening {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed serializing run log entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed appending run log {}: {source}", .path.display())]
    Append {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Append-only JSONL sink. A log without a path accepts and drops entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLog {
    path: Option<PathBuf>,
}

impl RunLog {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, entry: &RunLogEntry) -> Result<(), RunLogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| RunLogError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| RunLogError::Open {
                path: path.clone(),
                source,
            })?;
        let line = serde_json::to_string(entry)?;
        let mut payload = line.into_bytes();
        payload.push(b'\n');
        file.write_all(&payload).map_err(|source| RunLogError::Append {
            path: path.clone(),
            source,
        })
    }
}
