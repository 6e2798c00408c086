#![forbid(unsafe_code)]

use crate::{IOError, dataset_member_name};
use simreg_ndarray::NumericArray;
use std::path::Path;

fn hdf5_error(err: hdf5::Error) -> IOError {
    IOError::Hdf5(err.to_string())
}

/// Every group prefix of `name`, outermost first: `a/b/c` yields `a`, `a/b`.
fn group_prefixes(name: &str) -> impl Iterator<Item = &str> {
    name.match_indices('/').map(move |(at, _)| &name[..at])
}

#[derive(Debug)]
pub(crate) struct Hdf5File {
    file: hdf5::File,
}

impl Hdf5File {
    pub(crate) fn open(path: &Path) -> Result<Self, IOError> {
        hdf5::File::open(path)
            .map(|file| Self { file })
            .map_err(hdf5_error)
    }

    pub(crate) fn contains(&self, dataset_path: &str) -> bool {
        let name = dataset_member_name(dataset_path);
        !name.is_empty()
            && group_prefixes(&name).all(|group| self.file.link_exists(group))
            && self.file.link_exists(&name)
    }

    pub(crate) fn dataset(&self, dataset_path: &str) -> Result<NumericArray, IOError> {
        let name = dataset_member_name(dataset_path);
        if !self.contains(&name) {
            return Err(IOError::MemberNotFound(name));
        }
        let dataset = self.file.dataset(&name).map_err(hdf5_error)?;
        let values = dataset.read_raw::<f64>().map_err(hdf5_error)?;
        NumericArray::new(dataset.shape(), values).map_err(|_| {
            IOError::ReadPayloadIncomplete("hdf5: decoded value count does not match shape")
        })
    }
}

pub(crate) fn write(path: &Path, entries: &[(String, NumericArray)]) -> Result<(), IOError> {
    let file = hdf5::File::create(path).map_err(hdf5_error)?;
    for (dataset_path, array) in entries {
        let name = dataset_member_name(dataset_path);
        for group in group_prefixes(&name) {
            if !file.link_exists(group) {
                file.create_group(group).map_err(hdf5_error)?;
            }
        }
        file.new_dataset::<f64>()
            .shape(array.shape().to_vec())
            .create(name.as_str())
            .map_err(hdf5_error)?
            .write_raw(array.values())
            .map_err(hdf5_error)?;
    }
    Ok(())
}
