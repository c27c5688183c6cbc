//! Binary serializers for B-tree keys and values.
//!
//! A serializer writes a value into a byte slice inside a bucket and reads it
//! back. Every serializer has a one-byte id persisted in the tree metadata, so
//! a tree reopened with different serializers is rejected.

use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

pub trait BinarySerializer<T>: Send + Sync {
    /// Identifier stored in the tree metadata.
    fn id(&self) -> u8;

    /// Number of bytes `value` occupies once serialized.
    fn object_size(&self, value: &T) -> usize;

    /// Number of bytes of the serialized value at the start of `stream`.
    fn object_size_in_bytes(&self, stream: &[u8]) -> usize;

    /// Write `value` into `out`, which is exactly `object_size(value)` long.
    fn serialize(&self, value: &T, out: &mut [u8]);

    fn deserialize(&self, stream: &[u8]) -> StorageResult<T>;

    fn to_bytes(&self, value: &T) -> Vec<u8> {
        let mut out = vec![0u8; self.object_size(value)];
        self.serialize(value, &mut out);
        out
    }
}

fn truncated(what: &str, needed: usize, available: usize) -> StorageError {
    StorageError::Serialization(format!(
        "{} needs {} bytes but only {} are available",
        what, needed, available
    ))
}

/// Persisted type of one key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyType {
    Integer = 1,
    Long = 3,
    String = 7,
    Binary = 8,
    Link = 13,
}

impl KeyType {
    pub fn from_id(id: u8) -> StorageResult<Self> {
        match id {
            1 => Ok(KeyType::Integer),
            3 => Ok(KeyType::Long),
            7 => Ok(KeyType::String),
            8 => Ok(KeyType::Binary),
            13 => Ok(KeyType::Link),
            other => Err(StorageError::Serialization(format!(
                "unknown key type id {}",
                other
            ))),
        }
    }
}

pub struct IntegerSerializer;

impl IntegerSerializer {
    pub const ID: u8 = 8;
}

impl BinarySerializer<i32> for IntegerSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, _value: &i32) -> usize {
        4
    }

    fn object_size_in_bytes(&self, _stream: &[u8]) -> usize {
        4
    }

    fn serialize(&self, value: &i32, out: &mut [u8]) {
        LittleEndian::write_i32(out, *value);
    }

    fn deserialize(&self, stream: &[u8]) -> StorageResult<i32> {
        if stream.len() < 4 {
            return Err(truncated("integer", 4, stream.len()));
        }
        Ok(LittleEndian::read_i32(stream))
    }
}

pub struct LongSerializer;

impl LongSerializer {
    pub const ID: u8 = 10;
}

impl BinarySerializer<i64> for LongSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, _value: &i64) -> usize {
        8
    }

    fn object_size_in_bytes(&self, _stream: &[u8]) -> usize {
        8
    }

    fn serialize(&self, value: &i64, out: &mut [u8]) {
        LittleEndian::write_i64(out, *value);
    }

    fn deserialize(&self, stream: &[u8]) -> StorageResult<i64> {
        if stream.len() < 8 {
            return Err(truncated("long", 8, stream.len()));
        }
        Ok(LittleEndian::read_i64(stream))
    }
}

/// Length-prefixed UTF-8 string.
pub struct StringSerializer;

impl StringSerializer {
    pub const ID: u8 = 13;
}

impl BinarySerializer<String> for StringSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, value: &String) -> usize {
        4 + value.len()
    }

    fn object_size_in_bytes(&self, stream: &[u8]) -> usize {
        4 + LittleEndian::read_u32(stream) as usize
    }

    fn serialize(&self, value: &String, out: &mut [u8]) {
        LittleEndian::write_u32(out, value.len() as u32);
        out[4..4 + value.len()].copy_from_slice(value.as_bytes());
    }

    fn deserialize(&self, stream: &[u8]) -> StorageResult<String> {
        if stream.len() < 4 {
            return Err(truncated("string length", 4, stream.len()));
        }
        let len = LittleEndian::read_u32(stream) as usize;
        let bytes = stream
            .get(4..4 + len)
            .ok_or_else(|| truncated("string", 4 + len, stream.len()))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::Serialization(format!("invalid UTF-8 in string: {}", e)))
    }
}

/// Length-prefixed byte array.
pub struct ByteArraySerializer;

impl ByteArraySerializer {
    pub const ID: u8 = 17;
}

impl BinarySerializer<Vec<u8>> for ByteArraySerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, value: &Vec<u8>) -> usize {
        4 + value.len()
    }

    fn object_size_in_bytes(&self, stream: &[u8]) -> usize {
        4 + LittleEndian::read_u32(stream) as usize
    }

    fn serialize(&self, value: &Vec<u8>, out: &mut [u8]) {
        LittleEndian::write_u32(out, value.len() as u32);
        out[4..4 + value.len()].copy_from_slice(value);
    }

    fn deserialize(&self, stream: &[u8]) -> StorageResult<Vec<u8>> {
        if stream.len() < 4 {
            return Err(truncated("byte array length", 4, stream.len()));
        }
        let len = LittleEndian::read_u32(stream) as usize;
        stream
            .get(4..4 + len)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| truncated("byte array", 4 + len, stream.len()))
    }
}

/// Record id: the cluster a record lives in and its position there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub cluster_id: i16,
    pub cluster_position: i64,
}

impl Rid {
    pub fn new(cluster_id: i16, cluster_position: i64) -> Self {
        Self {
            cluster_id,
            cluster_position,
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

pub struct LinkSerializer;

impl LinkSerializer {
    pub const ID: u8 = 9;
    const SIZE: usize = 10;
}

impl BinarySerializer<Rid> for LinkSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, _value: &Rid) -> usize {
        Self::SIZE
    }

    fn object_size_in_bytes(&self, _stream: &[u8]) -> usize {
        Self::SIZE
    }

    fn serialize(&self, value: &Rid, out: &mut [u8]) {
        LittleEndian::write_i16(out, value.cluster_id);
        LittleEndian::write_i64(&mut out[2..], value.cluster_position);
    }

    fn deserialize(&self, stream: &[u8]) -> StorageResult<Rid> {
        if stream.len() < Self::SIZE {
            return Err(truncated("link", Self::SIZE, stream.len()));
        }
        Ok(Rid::new(
            LittleEndian::read_i16(stream),
            LittleEndian::read_i64(&stream[2..]),
        ))
    }
}
