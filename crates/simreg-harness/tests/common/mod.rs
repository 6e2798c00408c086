#![allow(dead_code)]

use simreg_harness::release::ReleaseRegistry;
use simreg_harness::SuiteConfig;
use simreg_io::DatasetArchiveWriter;
use simreg_ndarray::NumericArray;
use std::path::{Path, PathBuf};

/// Deterministic field for the `index`-th dataset of a suite.
pub fn dataset_values(index: usize) -> NumericArray {
    let base = index as f64 + 1.0;
    let values = (0..12).map(|k| base * 0.37 + k as f64 * 1.25 - 3.0).collect();
    NumericArray::new(vec![4, 3], values).expect("4x3 field")
}

/// Archive holding every dataset of `suite`, each passed through `field`.
/// Datasets for which `field` returns `None` are left out.
pub fn suite_archive(
    suite: &SuiteConfig,
    field: impl Fn(usize, NumericArray) -> Option<NumericArray>,
) -> DatasetArchiveWriter {
    suite
        .datasets
        .iter()
        .enumerate()
        .fold(DatasetArchiveWriter::new(), |writer, (idx, dataset)| {
            match field(idx, dataset_values(idx)) {
                Some(array) => writer.with_dataset(&dataset.path, array),
                None => writer,
            }
        })
}

pub fn reference_path(suite: &SuiteConfig, root: &Path, basename: &str, release: &str) -> PathBuf {
    let suffix = ReleaseRegistry::builtin()
        .resolve(release)
        .expect("builtin release");
    root.join(suite.layout.reference_file(basename, &suffix))
}

pub fn candidate_path(suite: &SuiteConfig, root: &Path, basename: &str) -> PathBuf {
    root.join(suite.layout.candidate_file(basename))
}

/// Writes unmodified reference files for every case of `suite` under `root`.
pub fn write_references(suite: &SuiteConfig, root: &Path, release: &str) {
    for case in &suite.cases {
        suite_archive(suite, |_, array| Some(array))
            .write(reference_path(suite, root, &case.output_basename, release))
            .expect("reference archive");
    }
}
