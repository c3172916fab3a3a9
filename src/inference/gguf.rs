//! GGUF container header reader.
//!
//! Only the header is interpreted: magic, version, metadata key/values and
//! tensor descriptors. Tensor data is the engine's concern and is never read.
//! Versions 2 and 3 share the same layout (64-bit counts and lengths).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// "GGUF" read as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Version written by [`GgufBuilder`].
pub const GGUF_VERSION: u32 = 3;

/// Upper bound on string and array lengths accepted from a header.
const MAX_LEN: u64 = 1 << 24;

/// Most elements reserved up front for a header-declared count; the rest
/// grow as entries are actually read.
const PREALLOC_LIMIT: u64 = 4096;

/// Upper bound on tensor dimensions (ggml supports 4).
const MAX_DIMS: u32 = 4;

#[derive(Error, Debug)]
pub enum GgufError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad magic 0x{0:08x} (not a GGUF file)")]
    BadMagic(u32),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid metadata value type {0}")]
    InvalidValueType(u32),

    #[error("Invalid UTF-8 in header string")]
    InvalidString,

    #[error("Header field too large: {0}")]
    TooLarge(u64),
}

/// A metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    fn type_id(&self) -> u32 {
        match self {
            GgufValue::U8(_) => 0,
            GgufValue::I8(_) => 1,
            GgufValue::U16(_) => 2,
            GgufValue::I16(_) => 3,
            GgufValue::U32(_) => 4,
            GgufValue::I32(_) => 5,
            GgufValue::F32(_) => 6,
            GgufValue::Bool(_) => 7,
            GgufValue::String(_) => 8,
            GgufValue::Array(_) => 9,
            GgufValue::U64(_) => 10,
            GgufValue::I64(_) => 11,
            GgufValue::F64(_) => 12,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any non-negative integer value, widened.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            GgufValue::U8(v) => Some(v as u64),
            GgufValue::U16(v) => Some(v as u64),
            GgufValue::U32(v) => Some(v as u64),
            GgufValue::U64(v) => Some(v),
            GgufValue::I8(v) if v >= 0 => Some(v as u64),
            GgufValue::I16(v) if v >= 0 => Some(v as u64),
            GgufValue::I32(v) if v >= 0 => Some(v as u64),
            GgufValue::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            GgufValue::F32(v) => Some(v),
            GgufValue::F64(v) => Some(v as f32),
            _ => self.as_u64().map(|v| v as f32),
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Tensor descriptor from the header.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    /// Dimensions in ggml order (ne0 first).
    pub dims: Vec<u64>,
    pub ggml_type: u32,
    pub offset: u64,
}

/// Parsed GGUF header.
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub metadata: BTreeMap<String, GgufValue>,
    pub tensors: Vec<TensorInfo>,
}

impl GgufHeader {
    /// Read the header of a GGUF file.
    pub fn read(path: &Path) -> Result<Self, GgufError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Read a header from any byte source.
    pub fn from_reader<R: Read>(mut r: R) -> Result<Self, GgufError> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            return Err(GgufError::BadMagic(magic));
        }

        let version = r.read_u32::<LittleEndian>()?;
        if !(2..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let tensor_count = bounded(r.read_u64::<LittleEndian>()?)?;
        let kv_count = bounded(r.read_u64::<LittleEndian>()?)?;

        let mut metadata = BTreeMap::new();
        for _ in 0..kv_count {
            let key = read_string(&mut r)?;
            let value_type = r.read_u32::<LittleEndian>()?;
            let value = read_value(&mut r, value_type)?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::with_capacity(tensor_count.min(PREALLOC_LIMIT) as usize);
        for _ in 0..tensor_count {
            let name = read_string(&mut r)?;
            let n_dims = r.read_u32::<LittleEndian>()?;
            if n_dims > MAX_DIMS {
                return Err(GgufError::TooLarge(n_dims as u64));
            }
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(r.read_u64::<LittleEndian>()?);
            }
            let ggml_type = r.read_u32::<LittleEndian>()?;
            let offset = r.read_u64::<LittleEndian>()?;
            tensors.push(TensorInfo {
                name,
                dims,
                ggml_type,
                offset,
            });
        }

        Ok(Self {
            version,
            metadata,
            tensors,
        })
    }

    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(GgufValue::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(GgufValue::as_u64)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(GgufValue::as_f32)
    }

    /// `general.architecture`, e.g. "llama".
    pub fn architecture(&self) -> Option<&str> {
        self.get_str("general.architecture")
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

fn bounded(len: u64) -> Result<u64, GgufError> {
    if len > MAX_LEN {
        return Err(GgufError::TooLarge(len));
    }
    Ok(len)
}

fn read_string<R: Read>(r: &mut R) -> Result<String, GgufError> {
    let len = bounded(r.read_u64::<LittleEndian>()?)?;
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT) as usize);
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(GgufError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    String::from_utf8(buf).map_err(|_| GgufError::InvalidString)
}

fn read_value<R: Read>(r: &mut R, value_type: u32) -> Result<GgufValue, GgufError> {
    let value = match value_type {
        0 => GgufValue::U8(r.read_u8()?),
        1 => GgufValue::I8(r.read_i8()?),
        2 => GgufValue::U16(r.read_u16::<LittleEndian>()?),
        3 => GgufValue::I16(r.read_i16::<LittleEndian>()?),
        4 => GgufValue::U32(r.read_u32::<LittleEndian>()?),
        5 => GgufValue::I32(r.read_i32::<LittleEndian>()?),
        6 => GgufValue::F32(r.read_f32::<LittleEndian>()?),
        7 => GgufValue::Bool(r.read_u8()? != 0),
        8 => GgufValue::String(read_string(r)?),
        9 => {
            let elem_type = r.read_u32::<LittleEndian>()?;
            // Nested arrays are legal in the format but never produced by llama.cpp.
            if elem_type == 9 {
                return Err(GgufError::InvalidValueType(elem_type));
            }
            let len = bounded(r.read_u64::<LittleEndian>()?)?;
            let mut items = Vec::with_capacity(len.min(PREALLOC_LIMIT) as usize);
            for _ in 0..len {
                items.push(read_value(r, elem_type)?);
            }
            GgufValue::Array(items)
        }
        10 => GgufValue::U64(r.read_u64::<LittleEndian>()?),
        11 => GgufValue::I64(r.read_i64::<LittleEndian>()?),
        12 => GgufValue::F64(r.read_f64::<LittleEndian>()?),
        other => return Err(GgufError::InvalidValueType(other)),
    };
    Ok(value)
}

/// Writes GGUF headers (no tensor data).
///
/// Used to author model and adapter fixtures; the reader above never looks
/// past the tensor descriptors, so a header-only file is a valid input.
#[derive(Debug, Default, Clone)]
pub struct GgufBuilder {
    metadata: Vec<(String, GgufValue)>,
    tensors: Vec<TensorInfo>,
}

impl GgufBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(mut self, key: impl Into<String>, value: GgufValue) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    pub fn string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata(key, GgufValue::String(value.into()))
    }

    pub fn u32(self, key: impl Into<String>, value: u32) -> Self {
        self.metadata(key, GgufValue::U32(value))
    }

    pub fn f32(self, key: impl Into<String>, value: f32) -> Self {
        self.metadata(key, GgufValue::F32(value))
    }

    /// Add an F32 tensor descriptor.
    pub fn tensor(mut self, name: impl Into<String>, dims: &[u64]) -> Self {
        let offset = self
            .tensors
            .last()
            .map(|t| t.offset + t.dims.iter().product::<u64>() * 4)
            .unwrap_or(0);
        self.tensors.push(TensorInfo {
            name: name.into(),
            dims: dims.to_vec(),
            ggml_type: 0,
            offset,
        });
        self
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), GgufError> {
        w.write_u32::<LittleEndian>(GGUF_MAGIC)?;
        w.write_u32::<LittleEndian>(GGUF_VERSION)?;
        w.write_u64::<LittleEndian>(self.tensors.len() as u64)?;
        w.write_u64::<LittleEndian>(self.metadata.len() as u64)?;

        for (key, value) in &self.metadata {
            write_string(&mut w, key)?;
            w.write_u32::<LittleEndian>(value.type_id())?;
            write_value(&mut w, value)?;
        }

        for tensor in &self.tensors {
            write_string(&mut w, &tensor.name)?;
            w.write_u32::<LittleEndian>(tensor.dims.len() as u32)?;
            for d in &tensor.dims {
                w.write_u64::<LittleEndian>(*d)?;
            }
            w.write_u32::<LittleEndian>(tensor.ggml_type)?;
            w.write_u64::<LittleEndian>(tensor.offset)?;
        }

        w.flush()?;
        Ok(())
    }

    pub fn write_file(&self, path: &Path) -> Result<(), GgufError> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file))
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), GgufError> {
    w.write_u64::<LittleEndian>(s.len() as u64)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn write_value<W: Write>(w: &mut W, value: &GgufValue) -> Result<(), GgufError> {
    match value {
        GgufValue::U8(v) => w.write_u8(*v)?,
        GgufValue::I8(v) => w.write_i8(*v)?,
        GgufValue::U16(v) => w.write_u16::<LittleEndian>(*v)?,
        GgufValue::I16(v) => w.write_i16::<LittleEndian>(*v)?,
        GgufValue::U32(v) => w.write_u32::<LittleEndian>(*v)?,
        GgufValue::I32(v) => w.write_i32::<LittleEndian>(*v)?,
        GgufValue::F32(v) => w.write_f32::<LittleEndian>(*v)?,
        GgufValue::Bool(v) => w.write_u8(u8::from(*v))?,
        GgufValue::String(s) => write_string(w, s)?,
        GgufValue::Array(items) => {
            let elem_type = items.first().map(GgufValue::type_id).unwrap_or(0);
            w.write_u32::<LittleEndian>(elem_type)?;
            w.write_u64::<LittleEndian>(items.len() as u64)?;
            for item in items {
                write_value(w, item)?;
            }
        }
        GgufValue::U64(v) => w.write_u64::<LittleEndian>(*v)?,
        GgufValue::I64(v) => w.write_i64::<LittleEndian>(*v)?,
        GgufValue::F64(v) => w.write_f64::<LittleEndian>(*v)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(builder: &GgufBuilder) -> Vec<u8> {
        let mut buf = Vec::new();
        builder.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_read_back_metadata_and_tensors() {
        let builder = GgufBuilder::new()
            .string("general.architecture", "llama")
            .u32("llama.block_count", 2)
            .f32("adapter.lora.alpha", 16.0)
            .metadata(
                "tokenizer.ggml.tokens",
                GgufValue::Array(vec![
                    GgufValue::String("<s>".into()),
                    GgufValue::String("</s>".into()),
                ]),
            )
            .tensor("blk.0.attn_q.weight.lora_a", &[64, 8])
            .tensor("blk.0.attn_q.weight.lora_b", &[8, 64]);

        let header = GgufHeader::from_reader(header_bytes(&builder).as_slice()).unwrap();

        assert_eq!(header.version, GGUF_VERSION);
        assert_eq!(header.architecture(), Some("llama"));
        assert_eq!(header.get_u64("llama.block_count"), Some(2));
        assert_eq!(header.get_f32("adapter.lora.alpha"), Some(16.0));
        assert_eq!(
            header
                .get("tokenizer.ggml.tokens")
                .and_then(GgufValue::as_array)
                .map(|a| a.len()),
            Some(2)
        );
        assert_eq!(header.tensors.len(), 2);
        let b = header.tensor("blk.0.attn_q.weight.lora_b").unwrap();
        assert_eq!(b.dims, vec![8, 64]);
        assert_eq!(b.offset, 64 * 8 * 4);
    }

    #[test]
    fn test_bad_magic() {
        let bytes = b"GGML\x03\x00\x00\x00".to_vec();
        let err = GgufHeader::from_reader(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, GgufError::BadMagic(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = header_bytes(&GgufBuilder::new());
        bytes[4] = 1;
        let err = GgufHeader::from_reader(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, GgufError::UnsupportedVersion(1)));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = header_bytes(&GgufBuilder::new().string("general.architecture", "llama"));
        let err = GgufHeader::from_reader(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, GgufError::Io(_)));
    }

    #[test]
    fn test_oversized_string_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        let err = GgufHeader::from_reader(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, GgufError::TooLarge(_)));
    }

    #[test]
    fn test_huge_tensor_count_without_data() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&MAX_LEN.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(bytes.len(), 24);
        let err = GgufHeader::from_reader(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, GgufError::Io(_)));

        bytes[8..16].copy_from_slice(&(MAX_LEN + 1).to_le_bytes());
        let err = GgufHeader::from_reader(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, GgufError::TooLarge(_)));
    }

    #[test]
    fn test_string_length_past_end_of_file() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&MAX_LEN.to_le_bytes());
        bytes.extend_from_slice(b"general");
        let err = GgufHeader::from_reader(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, GgufError::Io(_)));
    }
}
