#![forbid(unsafe_code)]

use crate::{
    IOError, MAX_ARCHIVE_MEMBERS, NPZ_MAGIC_PREFIX, NpyArrayBytes, encode_numeric_npy,
    read_npy_bytes,
};
use simreg_ndarray::NumericArray;
use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

const LOCAL_HEADER_SIGNATURE: [u8; 4] = NPZ_MAGIC_PREFIX;
const CENTRAL_DIRECTORY_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

/// A named array inside an NPZ archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpzEntry {
    pub name: String,
    pub array: NpyArrayBytes,
}

/// Maps a hierarchical dataset path onto its archive member name.
///
/// `/ParticleWake/WakePoints` and `ParticleWake/WakePoints` both resolve to
/// `ParticleWake/WakePoints`.
#[must_use]
pub fn dataset_member_name(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches('/');
    trimmed.strip_suffix(".npy").unwrap_or(trimmed).to_string()
}

fn read_u16(data: &[u8], at: usize) -> usize {
    usize::from(u16::from_le_bytes([data[at], data[at + 1]]))
}

fn read_u32(data: &[u8], at: usize) -> usize {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as usize
}

fn to_u32(value: usize) -> Result<u32, IOError> {
    u32::try_from(value).map_err(|_| {
        IOError::NpzArchiveContractViolation("npz: archive exceeds 32-bit zip offsets")
    })
}

/// Walks the central directory and returns each member's name and payload span.
fn index_members(data: &[u8]) -> Result<Vec<(String, Range<usize>)>, IOError> {
    if data.len() < 22 {
        return Err(IOError::NpzArchiveContractViolation(
            "npz: data too short for a ZIP archive",
        ));
    }
    if data[..4] != NPZ_MAGIC_PREFIX {
        return Err(IOError::NpzArchiveContractViolation(
            "npz: not a valid ZIP/NPZ archive",
        ));
    }

    let eocd = (0..=data.len() - 22)
        .rev()
        .find(|&i| data[i..i + 4] == END_OF_CENTRAL_DIRECTORY_SIGNATURE)
        .ok_or(IOError::NpzArchiveContractViolation(
            "npz: cannot find end of central directory",
        ))?;

    let entry_count = read_u16(data, eocd + 10);
    let cd_offset = read_u32(data, eocd + 16);
    if entry_count > MAX_ARCHIVE_MEMBERS {
        return Err(IOError::NpzArchiveContractViolation(
            "npz: member count exceeds bounded limit",
        ));
    }

    let mut members = Vec::with_capacity(entry_count);
    let mut pos = cd_offset;

    for _ in 0..entry_count {
        if pos + 46 > data.len() {
            return Err(IOError::NpzArchiveContractViolation(
                "npz: central directory truncated",
            ));
        }
        if data[pos..pos + 4] != CENTRAL_DIRECTORY_SIGNATURE {
            return Err(IOError::NpzArchiveContractViolation(
                "npz: invalid central directory entry signature",
            ));
        }
        if read_u16(data, pos + 10) != 0 {
            return Err(IOError::NpzArchiveContractViolation(
                "npz: only uncompressed (STORE) entries are supported",
            ));
        }

        let compressed_size = read_u32(data, pos + 20);
        let fname_len = read_u16(data, pos + 28);
        let extra_len = read_u16(data, pos + 30);
        let comment_len = read_u16(data, pos + 32);
        let local_offset = read_u32(data, pos + 42);

        let fname_start = pos + 46;
        if fname_start + fname_len > data.len() {
            return Err(IOError::NpzArchiveContractViolation(
                "npz: filename extends beyond data",
            ));
        }
        let file_name =
            String::from_utf8_lossy(&data[fname_start..fname_start + fname_len]).into_owned();

        if local_offset + 30 > data.len()
            || data[local_offset..local_offset + 4] != LOCAL_HEADER_SIGNATURE
        {
            return Err(IOError::NpzArchiveContractViolation(
                "npz: local header offset out of bounds",
            ));
        }
        let local_fname_len = read_u16(data, local_offset + 26);
        let local_extra_len = read_u16(data, local_offset + 28);
        let data_start = local_offset + 30 + local_fname_len + local_extra_len;
        let data_end = data_start + compressed_size;
        if data_end > data.len() {
            return Err(IOError::NpzArchiveContractViolation(
                "npz: entry data extends beyond archive",
            ));
        }

        members.push((dataset_member_name(&file_name), data_start..data_end));
        pos = fname_start + fname_len + extra_len + comment_len;
    }

    Ok(members)
}

/// Write named arrays into an uncompressed NPZ archive (np.savez layout).
///
/// Each entry is stored without compression; `.npy` is appended to member
/// names that lack it.
pub fn write_npz_bytes(entries: &[(&str, &NumericArray)]) -> Result<Vec<u8>, IOError> {
    if entries.is_empty() {
        return Err(IOError::NpzArchiveContractViolation(
            "npz: cannot write archive with zero entries",
        ));
    }
    if entries.len() > MAX_ARCHIVE_MEMBERS {
        return Err(IOError::NpzArchiveContractViolation(
            "npz: member count exceeds bounded limit",
        ));
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut central_directory: Vec<u8> = Vec::new();

    for &(name, array) in entries {
        let npy_data = encode_numeric_npy(array)?;
        let file_name = format!("{}.npy", dataset_member_name(name));
        let fname_bytes = file_name.as_bytes();
        let fname_len = u16::try_from(fname_bytes.len()).map_err(|_| {
            IOError::NpzArchiveContractViolation("npz: member name exceeds u16 length")
        })?;
        let local_offset = to_u32(buf.len())?;
        let size = to_u32(npy_data.len())?;
        let crc = crc32_ieee(&npy_data);

        buf.extend_from_slice(&LOCAL_HEADER_SIGNATURE);
        buf.extend_from_slice(&20_u16.to_le_bytes()); // version needed (2.0)
        buf.extend_from_slice(&0_u16.to_le_bytes()); // flags
        buf.extend_from_slice(&0_u16.to_le_bytes()); // compression: STORE
        buf.extend_from_slice(&0_u16.to_le_bytes()); // mod time
        buf.extend_from_slice(&0_u16.to_le_bytes()); // mod date
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes()); // compressed size
        buf.extend_from_slice(&size.to_le_bytes()); // uncompressed size
        buf.extend_from_slice(&fname_len.to_le_bytes());
        buf.extend_from_slice(&0_u16.to_le_bytes()); // extra field len
        buf.extend_from_slice(fname_bytes);
        buf.extend_from_slice(&npy_data);

        central_directory.extend_from_slice(&CENTRAL_DIRECTORY_SIGNATURE);
        central_directory.extend_from_slice(&20_u16.to_le_bytes()); // version made by
        central_directory.extend_from_slice(&20_u16.to_le_bytes()); // version needed
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // flags
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // compression
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // mod time
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // mod date
        central_directory.extend_from_slice(&crc.to_le_bytes());
        central_directory.extend_from_slice(&size.to_le_bytes());
        central_directory.extend_from_slice(&size.to_le_bytes());
        central_directory.extend_from_slice(&fname_len.to_le_bytes());
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // extra field len
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // comment len
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // disk number
        central_directory.extend_from_slice(&0_u16.to_le_bytes()); // internal attrs
        central_directory.extend_from_slice(&0_u32.to_le_bytes()); // external attrs
        central_directory.extend_from_slice(&local_offset.to_le_bytes());
        central_directory.extend_from_slice(fname_bytes);
    }

    // Bounded by MAX_ARCHIVE_MEMBERS above.
    let entry_count = entries.len() as u16;
    let cd_offset = to_u32(buf.len())?;
    let cd_size = to_u32(central_directory.len())?;
    buf.extend_from_slice(&central_directory);

    buf.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE);
    buf.extend_from_slice(&0_u16.to_le_bytes()); // disk number
    buf.extend_from_slice(&0_u16.to_le_bytes()); // disk with CD
    buf.extend_from_slice(&entry_count.to_le_bytes()); // entries on disk
    buf.extend_from_slice(&entry_count.to_le_bytes()); // total entries
    buf.extend_from_slice(&cd_size.to_le_bytes());
    buf.extend_from_slice(&cd_offset.to_le_bytes());
    buf.extend_from_slice(&0_u16.to_le_bytes()); // comment length

    Ok(buf)
}

/// Decode every member of an NPZ archive.
pub fn read_npz_bytes(data: &[u8]) -> Result<Vec<NpzEntry>, IOError> {
    index_members(data)?
        .into_iter()
        .map(|(name, span)| {
            Ok(NpzEntry {
                name,
                array: read_npy_bytes(&data[span])?,
            })
        })
        .collect()
}

/// IEEE 802.3 CRC-32 (used by ZIP format).
fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Container formats a structured output file may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Npz,
    Hdf5,
}

impl ArchiveFormat {
    /// `npz`, `h5` and `hdf5`, case-insensitive, with or without a leading dot.
    pub fn from_extension(extension: &str) -> Result<Self, IOError> {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "npz" => Ok(Self::Npz),
            "h5" | "hdf5" => Ok(Self::Hdf5),
            _ => Err(IOError::UnsupportedFormat(extension.to_string())),
        }
    }

    pub fn for_path(path: &Path) -> Result<Self, IOError> {
        Self::from_extension(
            path.extension()
                .and_then(|extension| extension.to_str())
                .unwrap_or_default(),
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Npz => "npz",
            Self::Hdf5 => "hdf5",
        }
    }

    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            Self::Npz => true,
            Self::Hdf5 => cfg!(feature = "hdf5"),
        }
    }

    pub fn ensure_available(self) -> Result<Self, IOError> {
        if self.is_available() {
            Ok(self)
        } else {
            Err(IOError::BackendUnavailable(self.as_str()))
        }
    }
}

#[derive(Debug)]
enum Members {
    Npz(BTreeMap<String, Range<usize>>),
    #[cfg(feature = "hdf5")]
    Hdf5(crate::hdf5_file::Hdf5File),
}

/// Read-only view of a structured output file.
///
/// Opening validates the container directory only; datasets are decoded one
/// at a time by [`DatasetArchive::dataset`].
#[derive(Debug)]
pub struct DatasetArchive {
    path: PathBuf,
    format: ArchiveFormat,
    bytes: Vec<u8>,
    members: Members,
}

fn file_access(path: &Path, err: &std::io::Error) -> IOError {
    IOError::FileAccess {
        path: path.to_path_buf(),
        kind: err.kind(),
    }
}

impl DatasetArchive {
    /// Missing files surface as [`IOError::FileAccess`] before the format is
    /// looked at.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IOError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|err| file_access(path, &err))?;
        let format = ArchiveFormat::for_path(path)?.ensure_available()?;
        let members = match format {
            ArchiveFormat::Npz => Members::Npz(index_members(&bytes)?.into_iter().collect()),
            #[cfg(feature = "hdf5")]
            ArchiveFormat::Hdf5 => Members::Hdf5(crate::hdf5_file::Hdf5File::open(path)?),
            #[cfg(not(feature = "hdf5"))]
            ArchiveFormat::Hdf5 => return Err(IOError::BackendUnavailable(format.as_str())),
        };
        Ok(Self {
            path: path.to_path_buf(),
            format,
            bytes,
            members,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// File contents as read at open time.
    #[must_use]
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn contains(&self, dataset_path: &str) -> bool {
        match &self.members {
            Members::Npz(members) => members.contains_key(&dataset_member_name(dataset_path)),
            #[cfg(feature = "hdf5")]
            Members::Hdf5(file) => file.contains(dataset_path),
        }
    }

    pub fn dataset(&self, dataset_path: &str) -> Result<NumericArray, IOError> {
        match &self.members {
            Members::Npz(members) => {
                let name = dataset_member_name(dataset_path);
                let span = members
                    .get(&name)
                    .ok_or_else(|| IOError::MemberNotFound(name.clone()))?;
                read_npy_bytes(&self.bytes[span.clone()])?.to_numeric()
            }
            #[cfg(feature = "hdf5")]
            Members::Hdf5(file) => file.dataset(dataset_path),
        }
    }
}

/// Builder for structured files, used for reference fixtures and tests.
#[derive(Debug, Default)]
pub struct DatasetArchiveWriter {
    entries: Vec<(String, NumericArray)>,
}

impl DatasetArchiveWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_dataset(mut self, dataset_path: &str, array: NumericArray) -> Self {
        self.entries.push((dataset_path.to_string(), array));
        self
    }

    /// NPZ encoding of the collected datasets.
    pub fn to_bytes(&self) -> Result<Vec<u8>, IOError> {
        let borrowed: Vec<(&str, &NumericArray)> = self
            .entries
            .iter()
            .map(|(name, array)| (name.as_str(), array))
            .collect();
        write_npz_bytes(&borrowed)
    }

    /// Writes the datasets in the format named by the path's extension,
    /// creating parent directories.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), IOError> {
        let path = path.as_ref();
        let format = ArchiveFormat::for_path(path)?.ensure_available()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| file_access(parent, &err))?;
        }
        match format {
            ArchiveFormat::Npz => {
                let bytes = self.to_bytes()?;
                fs::write(path, bytes).map_err(|err| file_access(path, &err))
            }
            #[cfg(feature = "hdf5")]
            ArchiveFormat::Hdf5 => crate::hdf5_file::write(path, &self.entries),
            #[cfg(not(feature = "hdf5"))]
            ArchiveFormat::Hdf5 => Err(IOError::BackendUnavailable(format.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ArchiveFormat, DatasetArchive, DatasetArchiveWriter, crc32_ieee, dataset_member_name,
        read_npz_bytes, write_npz_bytes,
    };
    use crate::IOError;
    use simreg_ndarray::NumericArray;

    fn wake_points() -> NumericArray {
        NumericArray::new(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).expect("points")
    }

    #[test]
    fn member_names_drop_leading_slash_and_extension() {
        assert_eq!(
            dataset_member_name("/Components/Comp001/Solution/Vort"),
            "Components/Comp001/Solution/Vort"
        );
        assert_eq!(dataset_member_name("arr_0.npy"), "arr_0");
    }

    #[test]
    fn crc32_matches_reference_vector() {
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn npz_bytes_list_every_member() {
        let pres = NumericArray::vector(vec![101_325.0]);
        let points = wake_points();
        let bytes = write_npz_bytes(&[
            ("/ParticleWake/WakePoints", &points),
            ("/Components/Comp001/Solution/Pres", &pres),
        ])
        .expect("write archive");

        let entries = read_npz_bytes(&bytes).expect("read archive");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["ParticleWake/WakePoints", "Components/Comp001/Solution/Pres"]
        );
        assert_eq!(entries[0].array.header.shape, vec![2, 3]);
    }

    #[test]
    fn empty_archive_is_rejected() {
        let err = write_npz_bytes(&[]).expect_err("zero entries");
        assert_eq!(err.reason_code(), "io_npz_archive_contract_violation");
    }

    #[test]
    fn archive_on_disk_serves_datasets_by_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Output/test_static_base_res_0011.npz");
        DatasetArchiveWriter::new()
            .with_dataset("/ParticleWake/WakePoints", wake_points())
            .write(&path)
            .expect("write");

        let archive = DatasetArchive::open(&path).expect("open");
        assert_eq!(archive.path(), path.as_path());
        assert_eq!(archive.format(), ArchiveFormat::Npz);
        assert!(archive.contains("/ParticleWake/WakePoints"));
        assert!(!archive.contains("/ParticleWake/WakeVort"));
        assert_eq!(
            archive.dataset("/ParticleWake/WakePoints").expect("dataset"),
            wake_points()
        );

        let err = archive
            .dataset("/ParticleWake/WakeVort")
            .expect_err("absent member");
        assert_eq!(err, IOError::MemberNotFound("ParticleWake/WakeVort".to_string()));
    }

    #[test]
    fn open_reports_missing_file_and_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.npz");
        let err = DatasetArchive::open(&missing).expect_err("missing file");
        assert!(matches!(
            err,
            IOError::FileAccess { kind: std::io::ErrorKind::NotFound, .. }
        ));

        let garbage = dir.path().join("garbage.npz");
        std::fs::write(&garbage, b"this is not a zip archive at all").expect("write garbage");
        let err = DatasetArchive::open(&garbage).expect_err("garbage");
        assert_eq!(err.reason_code(), "io_npz_archive_contract_violation");
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ArchiveFormat::from_extension("npz"), Ok(ArchiveFormat::Npz));
        assert_eq!(ArchiveFormat::from_extension(".H5"), Ok(ArchiveFormat::Hdf5));
        assert_eq!(ArchiveFormat::from_extension("hdf5"), Ok(ArchiveFormat::Hdf5));
        assert_eq!(
            ArchiveFormat::for_path(std::path::Path::new("Output/test_a_res_0011.h5")),
            Ok(ArchiveFormat::Hdf5)
        );
        let err = ArchiveFormat::from_extension("csv").expect_err("unknown");
        assert_eq!(err.reason_code(), "io_unsupported_format");
        assert!(ArchiveFormat::Npz.is_available());
    }

    #[cfg(not(feature = "hdf5"))]
    #[test]
    fn hdf5_without_feature_is_reported_not_misread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test_a_res_0011.h5");
        let err = DatasetArchiveWriter::new()
            .with_dataset("/Wake/Points", wake_points())
            .write(&path)
            .expect_err("no hdf5 backend");
        assert_eq!(err, IOError::BackendUnavailable("hdf5"));

        std::fs::write(&path, b"\x89HDF\r\n\x1a\n").expect("write");
        let err = DatasetArchive::open(&path).expect_err("no hdf5 backend");
        assert_eq!(err.reason_code(), "io_backend_unavailable");

        let missing = DatasetArchive::open(dir.path().join("absent.h5")).expect_err("missing");
        assert!(matches!(
            missing,
            IOError::FileAccess { kind: std::io::ErrorKind::NotFound, .. }
        ));
    }
}
