//! .vmem snapshot file format reader/writer.

use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CacheEntry, Memory, MemoryError, MemoryResult, MemoryVersion};

/// Magic bytes: "VMEM"
const VMEM_MAGIC: u32 = 0x564D454D;

/// Current format version.
const FORMAT_VERSION: u16 = 1;

/// Header size in bytes.
const HEADER_SIZE: usize = 64;

/// Everything a store persists. Indexes are derived and rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub memories: Vec<Memory>,
    pub versions: Vec<MemoryVersion>,
    pub cache: Vec<CacheEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoreSnapshot {
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            memories: Vec::new(),
            versions: Vec::new(),
            cache: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Writer for .vmem files.
pub struct VmemWriter;

/// Reader for .vmem files.
pub struct VmemReader;

impl VmemWriter {
    /// Write a snapshot to a file, replacing it atomically.
    ///
    /// The bytes go to a sibling temp file first, which is then renamed over
    /// the target so readers never observe a half-written file.
    pub fn write_to_file(snapshot: &StoreSnapshot, path: &Path) -> MemoryResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);

        {
            let mut file = std::fs::File::create(&tmp_path)?;
            Self::write_to(snapshot, &mut file)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Write a snapshot to any writer.
    pub fn write_to<W: Write>(snapshot: &StoreSnapshot, writer: &mut W) -> MemoryResult<()> {
        let payload = serde_json::to_vec(snapshot)
            .map_err(|e| MemoryError::Storage(format!("Serialization failed: {e}")))?;

        let mut header = [0u8; HEADER_SIZE];
        write_u32(&mut header[0..4], VMEM_MAGIC);
        write_u16(&mut header[4..6], FORMAT_VERSION);
        write_u16(&mut header[6..8], 0); // flags
        write_u64(&mut header[8..16], snapshot.memories.len() as u64);
        write_u64(&mut header[16..24], snapshot.versions.len() as u64);
        write_u64(&mut header[24..32], snapshot.cache.len() as u64);
        write_i64(&mut header[32..40], snapshot.created_at.timestamp_millis());
        write_i64(&mut header[40..48], snapshot.updated_at.timestamp_millis());
        write_u64(&mut header[48..56], payload.len() as u64);

        writer.write_all(&header)?;
        writer.write_all(&payload)?;

        Ok(())
    }
}

impl VmemReader {
    /// Read a snapshot from a file.
    pub fn read_from_file(path: &Path) -> MemoryResult<StoreSnapshot> {
        let mut file = std::fs::File::open(path)?;
        Self::read_from(&mut file)
    }

    /// Read a snapshot from any reader.
    pub fn read_from<R: Read>(reader: &mut R) -> MemoryResult<StoreSnapshot> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let magic = read_u32(&header[0..4]);
        if magic != VMEM_MAGIC {
            return Err(MemoryError::Storage(format!(
                "Invalid magic: expected 0x{VMEM_MAGIC:08X}, got 0x{magic:08X}"
            )));
        }

        let version = read_u16(&header[4..6]);
        if version != FORMAT_VERSION {
            return Err(MemoryError::Storage(format!(
                "Unsupported version: {version}"
            )));
        }

        let memory_count = read_u64(&header[8..16]);
        let version_count = read_u64(&header[16..24]);
        let cache_count = read_u64(&header[24..32]);
        let payload_len = read_u64(&header[48..56]);

        // The header length is untrusted, so never allocate from it.
        let mut payload = Vec::new();
        reader.take(payload_len).read_to_end(&mut payload)?;
        if payload.len() as u64 != payload_len {
            return Err(MemoryError::Storage(format!(
                "Payload truncated: header declares {payload_len} bytes, found {}",
                payload.len()
            )));
        }

        let snapshot: StoreSnapshot = serde_json::from_slice(&payload)
            .map_err(|e| MemoryError::Storage(format!("Deserialization failed: {e}")))?;

        let found = (
            snapshot.memories.len() as u64,
            snapshot.versions.len() as u64,
            snapshot.cache.len() as u64,
        );
        if found != (memory_count, version_count, cache_count) {
            return Err(MemoryError::Storage(format!(
                "Header counts ({memory_count} memories, {version_count} versions, {cache_count} cache entries) \
                 do not match payload ({}, {}, {})",
                found.0, found.1, found.2
            )));
        }
        Ok(snapshot)
    }
}

// Little-endian byte helpers
fn write_u16(buf: &mut [u8], val: u16) {
    buf[..2].copy_from_slice(&val.to_le_bytes());
}
fn write_u32(buf: &mut [u8], val: u32) {
    buf[..4].copy_from_slice(&val.to_le_bytes());
}
fn write_u64(buf: &mut [u8], val: u64) {
    buf[..8].copy_from_slice(&val.to_le_bytes());
}
fn write_i64(buf: &mut [u8], val: i64) {
    buf[..8].copy_from_slice(&val.to_le_bytes());
}
fn read_u16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}
fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}
fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes([buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7]])
}
