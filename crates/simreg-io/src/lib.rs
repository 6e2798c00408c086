#![forbid(unsafe_code)]

//! Readers for the structured output files compared by the regression harness.
//!
//! Two containers are understood, chosen by file extension:
//! HDF5 files (`hdf5` feature) as written by the solver, and NPZ archives,
//! an uncompressed ZIP whose members are `.npy` arrays. Hierarchical dataset
//! paths such as `/Components/Comp001/Solution/Vort` name HDF5 datasets
//! directly and map onto NPZ member names by dropping the leading slash.

mod archive;
#[cfg(feature = "hdf5")]
mod hdf5_file;

pub use archive::{
    ArchiveFormat, DatasetArchive, DatasetArchiveWriter, NpzEntry, dataset_member_name,
    read_npz_bytes, write_npz_bytes,
};

use core::fmt;
use simreg_ndarray::NumericArray;
use std::path::PathBuf;

pub const NPY_MAGIC_PREFIX: [u8; 6] = [0x93, b'N', b'U', b'M', b'P', b'Y'];
pub const NPZ_MAGIC_PREFIX: [u8; 4] = [b'P', b'K', 0x03, 0x04];

pub const MAX_HEADER_BYTES: usize = 65_536;
pub const MAX_ARCHIVE_MEMBERS: usize = 4_096;
pub const MAX_SHAPE_RANK: usize = 32;

const NPY_HEADER_REQUIRED_KEYS: [&str; 3] = ["descr", "fortran_order", "shape"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOSupportedDType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl IOSupportedDType {
    #[must_use]
    pub const fn descr(self) -> &'static str {
        match self {
            Self::Bool => "|b1",
            Self::I8 => "|i1",
            Self::I16 => "<i2",
            Self::I32 => "<i4",
            Self::I64 => "<i8",
            Self::U8 => "|u1",
            Self::U16 => "<u2",
            Self::U32 => "<u4",
            Self::U64 => "<u8",
            Self::F32 => "<f4",
            Self::F64 => "<f8",
        }
    }

    pub fn decode(descr: &str) -> Result<Self, IOError> {
        match descr {
            "|b1" => Ok(Self::Bool),
            "|i1" => Ok(Self::I8),
            "<i2" => Ok(Self::I16),
            "<i4" => Ok(Self::I32),
            "<i8" => Ok(Self::I64),
            "|u1" => Ok(Self::U8),
            "<u2" => Ok(Self::U16),
            "<u4" => Ok(Self::U32),
            "<u8" => Ok(Self::U64),
            "<f4" => Ok(Self::F32),
            "<f8" => Ok(Self::F64),
            _ => Err(IOError::DTypeDescriptorInvalid(descr.to_string())),
        }
    }

    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    // Integer widening above 2^53 loses precision; the solver writes floats.
    #[allow(clippy::cast_precision_loss)]
    fn widen(self, chunk: &[u8]) -> f64 {
        match self {
            Self::Bool => f64::from(u8::from(chunk[0] != 0)),
            Self::I8 => f64::from(i8::from_le_bytes([chunk[0]])),
            Self::U8 => f64::from(chunk[0]),
            Self::I16 => f64::from(i16::from_le_bytes([chunk[0], chunk[1]])),
            Self::U16 => f64::from(u16::from_le_bytes([chunk[0], chunk[1]])),
            Self::I32 => f64::from(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            Self::U32 => f64::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            Self::F32 => f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            Self::I64 => i64::from_le_bytes(le8(chunk)) as f64,
            Self::U64 => u64::from_le_bytes(le8(chunk)) as f64,
            Self::F64 => f64::from_le_bytes(le8(chunk)),
        }
    }
}

fn le8(chunk: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&chunk[..8]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IOError {
    MagicInvalid,
    HeaderSchemaInvalid(&'static str),
    DTypeDescriptorInvalid(String),
    WriteContractViolation(&'static str),
    ReadPayloadIncomplete(&'static str),
    NpzArchiveContractViolation(&'static str),
    MemberNotFound(String),
    FileAccess {
        path: PathBuf,
        kind: std::io::ErrorKind,
    },
    UnsupportedFormat(String),
    BackendUnavailable(&'static str),
    Hdf5(String),
}

impl IOError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MagicInvalid => "io_magic_invalid",
            Self::HeaderSchemaInvalid(_) => "io_header_schema_invalid",
            Self::DTypeDescriptorInvalid(_) => "io_dtype_descriptor_invalid",
            Self::WriteContractViolation(_) => "io_write_contract_violation",
            Self::ReadPayloadIncomplete(_) => "io_read_payload_incomplete",
            Self::NpzArchiveContractViolation(_) => "io_npz_archive_contract_violation",
            Self::MemberNotFound(_) => "io_member_not_found",
            Self::FileAccess { .. } => "io_file_access_failed",
            Self::UnsupportedFormat(_) => "io_unsupported_format",
            Self::BackendUnavailable(_) => "io_backend_unavailable",
            Self::Hdf5(_) => "io_hdf5_failed",
        }
    }
}

impl fmt::Display for IOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MagicInvalid => write!(f, "invalid or unsupported npy/npz magic/version"),
            Self::HeaderSchemaInvalid(msg) => write!(f, "{msg}"),
            Self::DTypeDescriptorInvalid(descr) => {
                write!(f, "dtype descriptor '{descr}' is invalid or unsupported")
            }
            Self::WriteContractViolation(msg) => write!(f, "{msg}"),
            Self::ReadPayloadIncomplete(msg) => write!(f, "{msg}"),
            Self::NpzArchiveContractViolation(msg) => write!(f, "{msg}"),
            Self::MemberNotFound(name) => write!(f, "archive has no member '{name}'"),
            Self::FileAccess { path, kind } => {
                write!(f, "failed accessing {}: {kind}", path.display())
            }
            Self::UnsupportedFormat(extension) => {
                write!(f, "no structured file format for extension '{extension}'")
            }
            Self::BackendUnavailable(format) => write!(
                f,
                "{format} files are not supported by this build (enable the '{format}' feature)"
            ),
            Self::Hdf5(msg) => write!(f, "hdf5: {msg}"),
        }
    }
}

impl std::error::Error for IOError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub shape: Vec<usize>,
    pub fortran_order: bool,
    pub descr: IOSupportedDType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyArrayBytes {
    pub version: (u8, u8),
    pub header: NpyHeader,
    pub payload: Vec<u8>,
}

impl NpyArrayBytes {
    /// Widens the payload to `f64`, reordering Fortran-ordered data to row-major.
    pub fn to_numeric(&self) -> Result<NumericArray, IOError> {
        let item_size = self.header.descr.item_size();
        let mut values: Vec<f64> = self
            .payload
            .chunks_exact(item_size)
            .map(|chunk| self.header.descr.widen(chunk))
            .collect();
        if self.header.fortran_order && self.header.shape.len() > 1 {
            values = fortran_to_row_major(&self.header.shape, &values);
        }
        NumericArray::new(self.header.shape.clone(), values)
            .map_err(|_| IOError::ReadPayloadIncomplete("decoded value count does not match shape"))
    }
}

fn fortran_to_row_major(shape: &[usize], values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut index = vec![0usize; shape.len()];
    for _ in 0..values.len() {
        let mut offset = 0usize;
        let mut stride = 1usize;
        for (axis, &dim) in shape.iter().enumerate() {
            offset += index[axis] * stride;
            stride *= dim;
        }
        out.push(values[offset]);

        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

fn element_count(shape: &[usize]) -> Result<usize, IOError> {
    simreg_ndarray::element_count(shape)
        .map_err(|_| IOError::HeaderSchemaInvalid("shape element-count overflowed"))
}

fn npy_length_field_size(version: (u8, u8)) -> Result<usize, IOError> {
    match version {
        (1, 0) => Ok(2),
        (2, 0) | (3, 0) => Ok(4),
        _ => Err(IOError::MagicInvalid),
    }
}

fn format_shape_tuple(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [single] => format!("({single},)"),
        _ => {
            let joined = shape
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("({joined})")
        }
    }
}

fn encode_header_dict(header: &NpyHeader) -> String {
    let fortran_order = if header.fortran_order {
        "True"
    } else {
        "False"
    };
    let shape = format_shape_tuple(&header.shape);
    format!(
        "{{'descr': '{}', 'fortran_order': {fortran_order}, 'shape': {shape}, }}",
        header.descr.descr()
    )
}

fn encode_npy_header_bytes(header: &NpyHeader, version: (u8, u8)) -> Result<Vec<u8>, IOError> {
    let length_field_size = npy_length_field_size(version)?;
    let dictionary = encode_header_dict(header);
    let dictionary_bytes = dictionary.as_bytes();
    let prefix_len = NPY_MAGIC_PREFIX.len() + 2 + length_field_size;
    let base_header_len = dictionary_bytes.len() + 1;
    let padding = (16 - ((prefix_len + base_header_len) % 16)) % 16;
    let header_len = base_header_len + padding;
    if header_len > MAX_HEADER_BYTES {
        return Err(IOError::HeaderSchemaInvalid(
            "header bytes must be within bounded budget",
        ));
    }

    let mut header_bytes = Vec::with_capacity(header_len);
    header_bytes.extend_from_slice(dictionary_bytes);
    header_bytes.extend(std::iter::repeat_n(b' ', padding));
    header_bytes.push(b'\n');
    Ok(header_bytes)
}

fn write_npy_preamble(
    buffer: &mut Vec<u8>,
    version: (u8, u8),
    header_len: usize,
) -> Result<(), IOError> {
    buffer.extend_from_slice(&NPY_MAGIC_PREFIX);
    buffer.push(version.0);
    buffer.push(version.1);
    match version {
        (1, 0) => {
            let header_len = u16::try_from(header_len).map_err(|_| {
                IOError::HeaderSchemaInvalid("version 1.0 header length exceeds u16 boundary")
            })?;
            buffer.extend_from_slice(&header_len.to_le_bytes());
        }
        (2, 0) | (3, 0) => {
            let header_len = u32::try_from(header_len)
                .map_err(|_| IOError::HeaderSchemaInvalid("header length exceeds u32 boundary"))?;
            buffer.extend_from_slice(&header_len.to_le_bytes());
        }
        _ => return Err(IOError::MagicInvalid),
    }
    Ok(())
}

fn read_header_span(payload: &[u8], version: (u8, u8)) -> Result<(usize, usize), IOError> {
    let length_field_size = npy_length_field_size(version)?;
    let header_offset = NPY_MAGIC_PREFIX.len() + 2 + length_field_size;
    let header_len = match version {
        (1, 0) => {
            if payload.len() < 10 {
                return Err(IOError::HeaderSchemaInvalid(
                    "payload truncated before v1 header length field",
                ));
            }
            usize::from(u16::from_le_bytes([payload[8], payload[9]]))
        }
        (2, 0) | (3, 0) => {
            if payload.len() < 12 {
                return Err(IOError::HeaderSchemaInvalid(
                    "payload truncated before v2/v3 header length field",
                ));
            }
            let raw = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]);
            usize::try_from(raw).map_err(|_| {
                IOError::HeaderSchemaInvalid("header length exceeds platform usize boundary")
            })?
        }
        _ => return Err(IOError::MagicInvalid),
    };

    if header_len == 0 || header_len > MAX_HEADER_BYTES {
        return Err(IOError::HeaderSchemaInvalid(
            "header bytes must be within bounded budget",
        ));
    }
    let end = header_offset
        .checked_add(header_len)
        .ok_or(IOError::HeaderSchemaInvalid(
            "header offset/length overflowed",
        ))?;
    if payload.len() < end {
        return Err(IOError::HeaderSchemaInvalid(
            "payload truncated before declared header bytes",
        ));
    }

    Ok((header_offset, header_len))
}

fn extract_after_key<'a>(dictionary: &'a str, key: &str) -> Result<&'a str, IOError> {
    let single = format!("'{key}'");
    let double = format!("\"{key}\"");
    let key_start = dictionary
        .find(&single)
        .or_else(|| dictionary.find(&double))
        .ok_or(IOError::HeaderSchemaInvalid(
            "required header field is missing",
        ))?;
    let tail = &dictionary[key_start + single.len()..];
    let tail = tail.trim_start();
    let tail = tail.strip_prefix(':').ok_or(IOError::HeaderSchemaInvalid(
        "header field is missing ':' separator",
    ))?;
    Ok(tail.trim_start())
}

fn parse_quoted_value(value: &str) -> Result<&str, IOError> {
    let quote = value
        .as_bytes()
        .first()
        .copied()
        .ok_or(IOError::HeaderSchemaInvalid("header quoted value is empty"))?;
    if quote != b'\'' && quote != b'"' {
        return Err(IOError::HeaderSchemaInvalid(
            "header quoted value must start with quote",
        ));
    }

    let tail = &value[1..];
    let end = tail
        .find(char::from(quote))
        .ok_or(IOError::HeaderSchemaInvalid(
            "header quoted value missing closing quote",
        ))?;
    Ok(&tail[..end])
}

fn parse_shape_tuple(tuple_literal: &str) -> Result<Vec<usize>, IOError> {
    let inner = tuple_literal.trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    let has_comma = inner.contains(',');

    let mut shape = Vec::new();
    for token in inner.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        // Writers on some platforms emit `3L` for long dimensions.
        let token = token.trim_end_matches('L');
        let dim = token
            .parse::<usize>()
            .map_err(|_| IOError::HeaderSchemaInvalid("shape tuple entries must be usize"))?;
        shape.push(dim);
    }

    if shape.is_empty() {
        return Err(IOError::HeaderSchemaInvalid(
            "shape tuple contains no dimensions",
        ));
    }
    if shape.len() == 1 && !has_comma {
        return Err(IOError::HeaderSchemaInvalid(
            "singleton shape tuples must include trailing comma",
        ));
    }

    Ok(shape)
}

fn parse_header_keys(dictionary: &str) -> Result<Vec<String>, IOError> {
    let bytes = dictionary.as_bytes();
    let mut keys = Vec::new();
    let mut idx = 0usize;

    while idx < bytes.len() {
        let byte = bytes[idx];
        if byte != b'\'' && byte != b'"' {
            idx += 1;
            continue;
        }

        let quote = byte;
        let start = idx + 1;
        idx += 1;
        while idx < bytes.len() && bytes[idx] != quote {
            idx += 1;
        }
        if idx >= bytes.len() {
            return Err(IOError::HeaderSchemaInvalid(
                "header key/value quote is not terminated",
            ));
        }

        let token = &dictionary[start..idx];
        idx += 1;

        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx < bytes.len() && bytes[idx] == b':' {
            if keys.iter().any(|existing| existing == token) {
                return Err(IOError::HeaderSchemaInvalid(
                    "header dictionary contains duplicate keys",
                ));
            }
            keys.push(token.to_string());
        }
    }

    Ok(keys)
}

fn parse_header_dictionary(header_bytes: &[u8]) -> Result<NpyHeader, IOError> {
    let dictionary = std::str::from_utf8(header_bytes).map_err(|_| {
        IOError::HeaderSchemaInvalid("header bytes must decode as utf-8/ascii dictionary")
    })?;
    let dictionary = dictionary.trim_end();
    if !(dictionary.starts_with('{') && dictionary.ends_with('}')) {
        return Err(IOError::HeaderSchemaInvalid(
            "header dictionary must be wrapped in braces",
        ));
    }
    let keys = parse_header_keys(dictionary)?;
    if keys.len() != NPY_HEADER_REQUIRED_KEYS.len()
        || NPY_HEADER_REQUIRED_KEYS
            .iter()
            .any(|required| !keys.iter().any(|key| key == required))
    {
        return Err(IOError::HeaderSchemaInvalid(
            "header dictionary must contain exactly descr/fortran_order/shape keys",
        ));
    }

    let descr_tail = extract_after_key(dictionary, "descr")?;
    let descr = IOSupportedDType::decode(parse_quoted_value(descr_tail)?)?;

    let fortran_tail = extract_after_key(dictionary, "fortran_order")?;
    let fortran_order = if fortran_tail.starts_with("True") {
        true
    } else if fortran_tail.starts_with("False") {
        false
    } else {
        return Err(IOError::HeaderSchemaInvalid(
            "fortran_order field must be True or False",
        ));
    };

    let shape_tail = extract_after_key(dictionary, "shape")?;
    let shape_tail = shape_tail
        .strip_prefix('(')
        .ok_or(IOError::HeaderSchemaInvalid(
            "shape field must begin with tuple syntax",
        ))?;
    let shape_end = shape_tail.find(')').ok_or(IOError::HeaderSchemaInvalid(
        "shape tuple missing closing ')'",
    ))?;
    let shape = parse_shape_tuple(&shape_tail[..shape_end])?;
    if shape.len() > MAX_SHAPE_RANK {
        return Err(IOError::HeaderSchemaInvalid(
            "shape rank exceeds validation budget",
        ));
    }
    let _ = element_count(&shape)?;

    Ok(NpyHeader {
        shape,
        fortran_order,
        descr,
    })
}

pub fn validate_magic_version(payload: &[u8]) -> Result<(u8, u8), IOError> {
    if payload.len() < 8 || payload[..6] != NPY_MAGIC_PREFIX {
        return Err(IOError::MagicInvalid);
    }

    let version = (payload[6], payload[7]);
    if version == (1, 0) || version == (2, 0) || version == (3, 0) {
        Ok(version)
    } else {
        Err(IOError::MagicInvalid)
    }
}

pub fn validate_read_payload(
    shape: &[usize],
    payload_len_bytes: usize,
    dtype: IOSupportedDType,
) -> Result<usize, IOError> {
    let expected_count = element_count(shape)
        .map_err(|_| IOError::ReadPayloadIncomplete("failed to compute expected element count"))?;
    let expected_bytes = expected_count.checked_mul(dtype.item_size()).ok_or(
        IOError::ReadPayloadIncomplete("expected payload bytes overflowed"),
    )?;

    if payload_len_bytes != expected_bytes {
        return Err(IOError::ReadPayloadIncomplete(
            "payload bytes must exactly match expected shape/dtype footprint",
        ));
    }

    Ok(expected_count)
}

pub fn write_npy_bytes(header: &NpyHeader, payload: &[u8]) -> Result<Vec<u8>, IOError> {
    let item_size = header.descr.item_size();
    if !payload.len().is_multiple_of(item_size) {
        return Err(IOError::WriteContractViolation(
            "payload bytes must align with dtype item size",
        ));
    }
    if element_count(&header.shape)? != payload.len() / item_size {
        return Err(IOError::WriteContractViolation(
            "value_count does not match shape element count",
        ));
    }

    let version = (1, 0);
    let header_bytes = encode_npy_header_bytes(header, version)?;
    let mut encoded =
        Vec::with_capacity(NPY_MAGIC_PREFIX.len() + 4 + header_bytes.len() + payload.len());
    write_npy_preamble(&mut encoded, version, header_bytes.len())?;
    encoded.extend_from_slice(&header_bytes);
    encoded.extend_from_slice(payload);
    Ok(encoded)
}

pub fn read_npy_bytes(payload: &[u8]) -> Result<NpyArrayBytes, IOError> {
    let version = validate_magic_version(payload)?;
    let (header_offset, header_len) = read_header_span(payload, version)?;
    let header_end = header_offset + header_len;
    let header = parse_header_dictionary(&payload[header_offset..header_end])?;
    let body = &payload[header_end..];
    let _ = validate_read_payload(&header.shape, body.len(), header.descr)?;

    Ok(NpyArrayBytes {
        version,
        header,
        payload: body.to_vec(),
    })
}

/// Encodes a numeric array as a little-endian `<f8` C-ordered `.npy` payload.
pub fn encode_numeric_npy(array: &NumericArray) -> Result<Vec<u8>, IOError> {
    let header = NpyHeader {
        shape: array.shape().to_vec(),
        fortran_order: false,
        descr: IOSupportedDType::F64,
    };
    let payload: Vec<u8> = array
        .values()
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect();
    write_npy_bytes(&header, &payload)
}
