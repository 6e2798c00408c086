#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkdirError {
    #[error("cannot determine the invoking directory: {0}")]
    InvokingDir(#[source] io::Error),
    #[error("suite directory {} is not accessible: {source}", .path.display())]
    SuiteDirUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("suite path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

/// Directory a suite runs in, carried explicitly instead of changing the
/// process-wide current directory.
///
/// Every relative path the harness touches is joined onto [`Self::root`], and
/// child processes receive it as their working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingContext {
    root: PathBuf,
    invoking_dir: PathBuf,
}

impl WorkingContext {
    /// Relative `suite_dir` values are taken relative to the current directory.
    pub fn enter(suite_dir: &Path) -> Result<Self, WorkdirError> {
        let invoking_dir = std::env::current_dir().map_err(WorkdirError::InvokingDir)?;
        Self::enter_from(&invoking_dir, suite_dir)
    }

    pub fn enter_from(invoking_dir: &Path, suite_dir: &Path) -> Result<Self, WorkdirError> {
        let joined = invoking_dir.join(suite_dir);
        let root = joined
            .canonicalize()
            .map_err(|source| WorkdirError::SuiteDirUnavailable {
                path: joined.clone(),
                source,
            })?;
        if !root.is_dir() {
            return Err(WorkdirError::NotADirectory(root));
        }
        Ok(Self {
            root,
            invoking_dir: invoking_dir.to_path_buf(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn invoking_dir(&self) -> &Path {
        &self.invoking_dir
    }

    #[must_use]
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkdirError, WorkingContext};
    use std::path::Path;

    #[test]
    fn resolves_paths_under_the_suite_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("suite")).expect("mkdir");
        let before = std::env::current_dir().expect("cwd");

        let ctx = WorkingContext::enter_from(dir.path(), Path::new("suite")).expect("enter");
        assert!(ctx.root().ends_with("suite"));
        assert_eq!(ctx.invoking_dir(), dir.path());
        assert_eq!(
            ctx.resolve("Output/a.npz"),
            ctx.root().join("Output").join("a.npz")
        );
        assert_eq!(std::env::current_dir().expect("cwd"), before);
    }

    #[test]
    fn missing_or_plain_file_suite_dir_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = WorkingContext::enter_from(dir.path(), Path::new("absent")).expect_err("missing");
        assert!(matches!(err, WorkdirError::SuiteDirUnavailable { .. }));

        std::fs::write(dir.path().join("file"), b"x").expect("write");
        let err = WorkingContext::enter_from(dir.path(), Path::new("file")).expect_err("file");
        assert!(matches!(err, WorkdirError::NotADirectory(_)));
    }
}
