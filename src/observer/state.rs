//! Byte-level codec for operator checkpoint records.
//!
//! The recovery system only deals in bytes so each operator can store
//! custom state without going through generic gymnastics. Scalars are
//! written little-endian; structured values are length-prefixed JSON.

use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Schema tag of an operator's persisted state.
///
/// Paired with the operator's name; a record written at one version
/// is only read back by the fast path when the versions match.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const V1: Version = Version::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Append-only writer for one or more operator records.
#[derive(Debug, Default)]
pub struct OperatorStateWriter {
    buf: Vec<u8>,
}

impl OperatorStateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_version(&mut self, version: Version) {
        self.write_u32(version.major);
        self.write_u32(version.minor);
        self.write_u32(version.patch);
    }

    /// Serialize a structured value as length-prefixed JSON.
    pub fn write<T: Serialize>(&mut self, value: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write_bytes(&bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over bytes produced by [`OperatorStateWriter`].
#[derive(Debug)]
pub struct OperatorStateReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> OperatorStateReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> EngineResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                EngineError::StateCorrupted(format!(
                    "wanted {len} bytes at offset {} but only {} remain",
                    self.pos,
                    self.remaining()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> EngineResult<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn read_bool(&mut self) -> EngineResult<bool> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(EngineError::StateCorrupted(format!(
                "invalid flag byte {other}"
            ))),
        }
    }

    pub fn read_u32(&mut self) -> EngineResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> EngineResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> EngineResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self) -> EngineResult<&'a [u8]> {
        let len = usize::try_from(self.read_u64()?)
            .map_err(|_| EngineError::StateCorrupted("length overflow".to_owned()))?;
        self.take(len)
    }

    pub fn read_str(&mut self) -> EngineResult<&'a str> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes).map_err(|err| EngineError::StateCorrupted(err.to_string()))
    }

    pub fn read_version(&mut self) -> EngineResult<Version> {
        Ok(Version::new(
            self.read_u32()?,
            self.read_u32()?,
            self.read_u32()?,
        ))
    }

    pub fn read<T: DeserializeOwned>(&mut self) -> EngineResult<T> {
        let bytes = self.read_bytes()?;
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }
}

#[test]
fn scalars_and_structs_read_back_in_order() {
    let mut writer = OperatorStateWriter::new();
    writer.write_bool(true);
    writer.write_i64(-42);
    writer.write_str("take");
    writer.write_version(Version::new(2, 1, 0));
    writer.write(&vec![1u32, 2, 3]).unwrap();
    let bytes = writer.into_bytes();

    let mut reader = OperatorStateReader::new(&bytes);
    assert!(reader.read_bool().unwrap());
    assert_eq!(reader.read_i64().unwrap(), -42);
    assert_eq!(reader.read_str().unwrap(), "take");
    assert_eq!(reader.read_version().unwrap(), Version::new(2, 1, 0));
    assert_eq!(reader.read::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
    assert!(reader.is_at_end());
}

#[test]
fn truncated_input_is_corruption() {
    let mut writer = OperatorStateWriter::new();
    writer.write_str("a longer string");
    let bytes = writer.into_bytes();

    let mut reader = OperatorStateReader::new(&bytes[..10]);
    assert!(matches!(
        reader.read_str(),
        Err(EngineError::StateCorrupted(_))
    ));
}

#[test]
fn bad_flag_byte_is_corruption() {
    let bytes = [7u8];
    let mut reader = OperatorStateReader::new(&bytes);
    assert!(matches!(
        reader.read_bool(),
        Err(EngineError::StateCorrupted(_))
    ));
}

#[test]
fn version_display() {
    assert_eq!(Version::V1.to_string(), "1.0.0");
}
