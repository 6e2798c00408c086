#![forbid(unsafe_code)]

use crate::release::{
    BUILTIN_RELEASES, ReferenceSuffix, RegistryError, ReleaseEntry, ReleaseRegistry,
};
use serde::{Deserialize, Serialize};
use simreg_io::{ArchiveFormat, IOError};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One pipeline configuration to run through the solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input_file: String,
    pub description: String,
    pub output_basename: String,
}

impl TestCase {
    #[must_use]
    pub fn new(
        input_file: impl Into<String>,
        description: impl Into<String>,
        output_basename: impl Into<String>,
    ) -> Self {
        Self {
            input_file: input_file.into(),
            description: description.into(),
            output_basename: output_basename.into(),
        }
    }
}

/// A named array inside the structured output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub path: String,
    pub description: String,
}

impl DatasetSpec {
    #[must_use]
    pub fn new(path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutableNames {
    pub preprocessor: String,
    pub solver: String,
    pub postprocessor: String,
}

impl Default for ExecutableNames {
    fn default() -> Self {
        Self {
            preprocessor: "dust_pre".to_string(),
            solver: "dust".to_string(),
            postprocessor: "dust_post".to_string(),
        }
    }
}

impl ExecutableNames {
    #[must_use]
    pub fn resolve(&self, exe_dir: &Path) -> PipelineExecutables {
        PipelineExecutables {
            preprocessor: exe_dir.join(&self.preprocessor),
            solver: exe_dir.join(&self.solver),
            postprocessor: exe_dir.join(&self.postprocessor),
        }
    }
}

/// Absolute locations of the three pipeline stages.
///
/// The post-processor is resolved for reporting only and is never launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineExecutables {
    pub preprocessor: PathBuf,
    pub solver: PathBuf,
    pub postprocessor: PathBuf,
}

/// Naming of candidate and reference files under the suite's output folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLayout {
    pub output_dir: String,
    pub generated_prefix: String,
    pub reference_prefix: String,
    pub resolution_suffix: String,
    pub extension: String,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            output_dir: "Output".to_string(),
            generated_prefix: "test".to_string(),
            reference_prefix: "ref".to_string(),
            resolution_suffix: "_res_0011".to_string(),
            extension: "h5".to_string(),
        }
    }
}

impl OutputLayout {
    /// Container format selected by `extension`.
    pub fn format(&self) -> Result<ArchiveFormat, IOError> {
        ArchiveFormat::from_extension(&self.extension)
    }

    /// `<output_dir>/<generated_prefix>_<basename><resolution_suffix>.<extension>`
    #[must_use]
    pub fn candidate_file(&self, output_basename: &str) -> PathBuf {
        Path::new(&self.output_dir).join(format!(
            "{}_{output_basename}{}.{}",
            self.generated_prefix, self.resolution_suffix, self.extension
        ))
    }

    /// `<output_dir>/<reference_prefix>_<basename>_<suffix><resolution_suffix>.<extension>`
    #[must_use]
    pub fn reference_file(&self, output_basename: &str, suffix: &ReferenceSuffix) -> PathBuf {
        Path::new(&self.output_dir).join(format!(
            "{}_{output_basename}_{suffix}{}.{}",
            self.reference_prefix, self.resolution_suffix, self.extension
        ))
    }
}

#[derive(Debug, Error)]
pub enum SuiteConfigError {
    #[error("failed reading suite config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid suite config json {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("suite declares no test cases")]
    NoCases,
    #[error("suite declares no datasets")]
    NoDatasets,
    #[error("output basename '{0}' is used by more than one case")]
    DuplicateCase(String),
    #[error("dataset '{0}' is declared more than once")]
    DuplicateDataset(String),
    #[error("suite field '{field}' must not be empty")]
    EmptyField { field: &'static str },
    #[error("output extension '{0}' names no known structured file format (npz, h5)")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SuiteConfigError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "suite_read_failed",
            Self::Parse { .. } => "suite_parse_failed",
            Self::NoCases => "suite_no_cases",
            Self::NoDatasets => "suite_no_datasets",
            Self::DuplicateCase(_) => "suite_duplicate_case",
            Self::DuplicateDataset(_) => "suite_duplicate_dataset",
            Self::EmptyField { .. } => "suite_empty_field",
            Self::UnsupportedFormat(_) => "suite_unsupported_format",
            Self::Registry(_) => "suite_registry_invalid",
        }
    }
}

fn default_suite_dir() -> PathBuf {
    PathBuf::from("reg_test_a")
}

fn default_cleanup_files() -> Vec<String> {
    vec!["geo_input.h5".to_string()]
}

fn default_releases() -> Vec<ReleaseEntry> {
    BUILTIN_RELEASES
        .iter()
        .map(|(tag, suffix)| ReleaseEntry::new(*tag, *suffix))
        .collect()
}

/// Everything the orchestrator needs to know about one regression suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_suite_dir")]
    pub suite_dir: PathBuf,
    #[serde(default)]
    pub executables: ExecutableNames,
    #[serde(default)]
    pub layout: OutputLayout,
    #[serde(default = "default_cleanup_files")]
    pub cleanup_files: Vec<String>,
    #[serde(default = "default_releases")]
    pub releases: Vec<ReleaseEntry>,
    pub cases: Vec<TestCase>,
    pub datasets: Vec<DatasetSpec>,
}

impl SuiteConfig {
    /// The static mirrored-wing suite.
    #[must_use]
    pub fn builtin() -> Self {
        let mut datasets = vec![
            DatasetSpec::new("/ParticleWake/WakePoints", "Particles position"),
            DatasetSpec::new("/ParticleWake/WakeVort", "Particles Intensity"),
        ];
        for component in 1..=3 {
            let base = format!("/Components/Comp{component:03}/Solution");
            datasets.push(DatasetSpec::new(
                format!("{base}/Vort"),
                format!("Component {component} Intensity"),
            ));
            datasets.push(DatasetSpec::new(
                format!("{base}/Pres"),
                format!("Component {component} Pressure"),
            ));
        }

        Self {
            description: "Basic wing with mirror".to_string(),
            suite_dir: default_suite_dir(),
            executables: ExecutableNames::default(),
            layout: OutputLayout::default(),
            cleanup_files: default_cleanup_files(),
            releases: default_releases(),
            cases: vec![
                TestCase::new(
                    "dust_static_base.in",
                    "static, basic configuration",
                    "static_base",
                ),
                TestCase::new(
                    "dust_dynamic_base.in",
                    "dynamic, basic configuration",
                    "dynamic_base",
                ),
            ],
            datasets,
        }
    }

    pub fn load(path: &Path) -> Result<Self, SuiteConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| SuiteConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| SuiteConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SuiteConfigError> {
        if self.cases.is_empty() {
            return Err(SuiteConfigError::NoCases);
        }
        if self.datasets.is_empty() {
            return Err(SuiteConfigError::NoDatasets);
        }

        let mut basenames = BTreeSet::new();
        for case in &self.cases {
            if case.input_file.trim().is_empty() {
                return Err(SuiteConfigError::EmptyField {
                    field: "cases.input_file",
                });
            }
            if case.output_basename.trim().is_empty() {
                return Err(SuiteConfigError::EmptyField {
                    field: "cases.output_basename",
                });
            }
            if !basenames.insert(case.output_basename.as_str()) {
                return Err(SuiteConfigError::DuplicateCase(case.output_basename.clone()));
            }
        }

        let mut paths = BTreeSet::new();
        for dataset in &self.datasets {
            let normalized = dataset.path.trim().trim_start_matches('/');
            if normalized.is_empty() {
                return Err(SuiteConfigError::EmptyField {
                    field: "datasets.path",
                });
            }
            if !paths.insert(normalized) {
                return Err(SuiteConfigError::DuplicateDataset(dataset.path.clone()));
            }
        }

        for (field, value) in [
            ("executables.preprocessor", &self.executables.preprocessor),
            ("executables.solver", &self.executables.solver),
            ("layout.output_dir", &self.layout.output_dir),
            ("layout.generated_prefix", &self.layout.generated_prefix),
            ("layout.extension", &self.layout.extension),
        ] {
            if value.trim().is_empty() {
                return Err(SuiteConfigError::EmptyField { field });
            }
        }

        if self.layout.format().is_err() {
            return Err(SuiteConfigError::UnsupportedFormat(
                self.layout.extension.clone(),
            ));
        }

        self.registry()?;
        Ok(())
    }

    pub fn registry(&self) -> Result<ReleaseRegistry, RegistryError> {
        ReleaseRegistry::from_entries(self.releases.clone())
    }
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::{OutputLayout, SuiteConfig, SuiteConfigError, TestCase};
    use simreg_io::ArchiveFormat;
    use crate::release::ReleaseRegistry;
    use std::path::Path;

    #[test]
    fn builtin_suite_matches_mirror_wing_layout() {
        let suite = SuiteConfig::builtin();
        suite.validate().expect("builtin suite is valid");
        assert_eq!(suite.suite_dir, Path::new("reg_test_a"));
        assert_eq!(suite.cases.len(), 2);
        assert_eq!(suite.cases[0].output_basename, "static_base");
        assert_eq!(suite.cases[1].input_file, "dust_dynamic_base.in");
        assert_eq!(suite.datasets.len(), 8);
        assert_eq!(suite.datasets[0].path, "/ParticleWake/WakePoints");
        assert_eq!(suite.datasets[7].path, "/Components/Comp003/Solution/Pres");
        assert_eq!(suite.datasets[7].description, "Component 3 Pressure");
        assert_eq!(suite.cleanup_files, vec!["geo_input.h5".to_string()]);
    }

    #[test]
    fn layout_builds_candidate_and_reference_names() {
        let layout = OutputLayout::default();
        let suffix = ReleaseRegistry::builtin().resolve("0.6.0").expect("known");
        assert_eq!(
            layout.candidate_file("static_base"),
            Path::new("Output/test_static_base_res_0011.h5")
        );
        assert_eq!(
            layout.reference_file("static_base", &suffix),
            Path::new("Output/ref_static_base_0-6-0_res_0011.h5")
        );
        assert_eq!(layout.format(), Ok(ArchiveFormat::Hdf5));
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let raw = r#"{
            "cases": [{"input_file": "a.in", "description": "case a", "output_basename": "a"}],
            "datasets": [{"path": "/Field/U", "description": "velocity"}]
        }"#;
        let suite: SuiteConfig = serde_json::from_str(raw).expect("parses");
        suite.validate().expect("valid");
        assert_eq!(suite.executables.solver, "dust");
        assert_eq!(suite.layout.extension, "h5");
        assert_eq!(suite.registry().expect("registry").newest().tag, "0.6.0");
    }

    #[test]
    fn validation_rejects_ambiguous_suites() {
        let mut suite = SuiteConfig::builtin();
        suite.cases.clear();
        assert!(matches!(suite.validate(), Err(SuiteConfigError::NoCases)));

        let mut suite = SuiteConfig::builtin();
        suite
            .cases
            .push(TestCase::new("other.in", "other", "static_base"));
        let err = suite.validate().expect_err("duplicate basename");
        assert_eq!(err.reason_code(), "suite_duplicate_case");

        let mut suite = SuiteConfig::builtin();
        let mut duplicate = suite.datasets[0].clone();
        duplicate.path = duplicate.path.trim_start_matches('/').to_string();
        suite.datasets.push(duplicate);
        assert!(matches!(
            suite.validate(),
            Err(SuiteConfigError::DuplicateDataset(_))
        ));

        let mut suite = SuiteConfig::builtin();
        suite.layout.extension = "csv".to_string();
        assert_eq!(
            suite.validate().expect_err("unknown format").reason_code(),
            "suite_unsupported_format"
        );

        let mut suite = SuiteConfig::builtin();
        suite.releases.clear();
        assert_eq!(
            suite.validate().expect_err("empty registry").reason_code(),
            "suite_registry_invalid"
        );
    }

    #[test]
    fn load_reports_path_on_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("suite.json");
        std::fs::write(&path, "{ not json").expect("write");
        let err = SuiteConfig::load(&path).expect_err("bad json");
        assert!(matches!(err, SuiteConfigError::Parse { .. }));
        assert!(err.to_string().contains("suite.json"));

        let missing = SuiteConfig::load(&dir.path().join("absent.json")).expect_err("missing");
        assert_eq!(missing.reason_code(), "suite_read_failed");
    }
}
