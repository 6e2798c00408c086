#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed listing {}: {source}", .path.display())]
    ListDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed removing {}: {source}", .path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CleanupError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ListDir { .. } => "cleanup_list_failed",
            Self::Remove { .. } => "cleanup_remove_failed",
        }
    }
}

/// What a cleanup pass removed and which removals failed.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<CleanupError>,
}

impl CleanupReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn remove(&mut self, path: &Path) {
        match remove_artifact(path) {
            Ok(true) => self.removed.push(path.to_path_buf()),
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "generated artifact left in place");
                self.failures.push(err);
            }
        }
    }
}

/// Removes one file and reports whether it was there.
pub fn remove_artifact(path: &Path) -> Result<bool, CleanupError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed generated artifact");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(CleanupError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn generated_files(
    output_dir: &Path,
    generated_prefix: &str,
    report: &mut CleanupReport,
) -> Vec<PathBuf> {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(source) => {
            report.failures.push(CleanupError::ListDir {
                path: output_dir.to_path_buf(),
                source,
            });
            return Vec::new();
        }
    };

    let mut generated = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) => {
                report.failures.push(CleanupError::ListDir {
                    path: output_dir.to_path_buf(),
                    source,
                });
                continue;
            }
        };
        let is_file = entry.file_type().is_ok_and(|kind| kind.is_file());
        if is_file
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(generated_prefix))
        {
            generated.push(entry.path());
        }
    }
    generated.sort();
    generated
}

/// Deletes every regular file in `output_dir` whose name starts with
/// `generated_prefix`, then each of `extra_files`.
///
/// Absent directories and files are skipped, so repeated calls converge on
/// the same state. A removal that fails is recorded in the report and the
/// remaining artifacts are still attempted. Reference files never carry the
/// generated prefix.
pub fn clean_artifacts(
    output_dir: &Path,
    generated_prefix: &str,
    extra_files: &[PathBuf],
) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in generated_files(output_dir, generated_prefix, &mut report) {
        report.remove(&path);
    }
    for path in extra_files {
        report.remove(path);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::{CleanupError, clean_artifacts, remove_artifact};
    use std::fs;

    #[test]
    fn removes_generated_files_and_keeps_references() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("Output");
        fs::create_dir(&output).expect("mkdir");
        for name in [
            "test_static_base_res_0011.h5",
            "test_dynamic_base_res_0011.h5",
            "ref_static_base_0-6-0_res_0011.h5",
            "notes.txt",
        ] {
            fs::write(output.join(name), b"x").expect("write");
        }
        fs::create_dir(output.join("test_subdir")).expect("mkdir");
        let geo = dir.path().join("geo_input.h5");
        fs::write(&geo, b"geo").expect("write");

        let report = clean_artifacts(&output, "test", &[geo.clone()]);
        assert!(report.is_complete());
        assert_eq!(report.removed.len(), 3);
        assert!(!geo.exists());
        assert!(!output.join("test_static_base_res_0011.h5").exists());
        assert!(output.join("ref_static_base_0-6-0_res_0011.h5").exists());
        assert!(output.join("notes.txt").exists());
        assert!(output.join("test_subdir").is_dir());
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("Output");
        fs::create_dir(&output).expect("mkdir");
        fs::write(output.join("test_a.npz"), b"x").expect("write");
        let extra = vec![dir.path().join("geo_input.h5")];

        let first = clean_artifacts(&output, "test", &extra);
        assert_eq!(first.removed.len(), 1);
        let second = clean_artifacts(&output, "test", &extra);
        assert!(second.removed.is_empty());
        assert!(second.is_complete());
    }

    #[test]
    fn missing_output_directory_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = clean_artifacts(&dir.path().join("Output"), "test", &[]);
        assert!(report.removed.is_empty());
        assert!(report.is_complete());
    }

    #[test]
    fn failed_removal_does_not_stop_the_pass() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("Output");
        fs::create_dir(&output).expect("mkdir");
        fs::write(output.join("test_a.h5"), b"x").expect("write");
        let blocker = dir.path().join("not_a_file");
        fs::create_dir(&blocker).expect("mkdir");
        let geo = dir.path().join("geo_input.h5");
        fs::write(&geo, b"geo").expect("write");

        let report = clean_artifacts(&output, "test", &[blocker.clone(), geo.clone()]);
        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            CleanupError::Remove { path, .. } if *path == blocker
        ));
        assert_eq!(report.failures[0].reason_code(), "cleanup_remove_failed");
        assert!(!geo.exists());
        assert_eq!(report.removed, vec![output.join("test_a.h5"), geo]);
    }

    #[test]
    fn remove_artifact_reports_whether_the_file_was_there() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test_a.h5");
        fs::write(&path, b"x").expect("write");
        assert!(remove_artifact(&path).expect("remove"));
        assert!(!remove_artifact(&path).expect("already gone"));
    }
}
