//! The sidecar codec.
//!
//! This is the only place that touches byte-level layout; the volume
//! operates on the parsed [VolumeConfig]. All integers are fixed-width
//! little-endian, strings are length-prefixed UTF-8, and every list is
//! length-prefixed. The general-info header carries the element sizes
//! of the binary that wrote the sidecar, so a reader can refuse to
//! interpret files written with a different layout.

use std::mem;

use crate::error::StoreError;
use crate::file_formats::{
    BlockHeader, RecordHeader, RecordKey, SessionBlockHeader, SessionRecordHeader,
    VOLUME_CONFIG_MAGIC_1_0, VOLUME_CONFIG_VERSION,
};

/// Element sizes of the binary that wrote a sidecar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralInfo {
    pub block_header_size: u32,
    pub record_header_size: u32,
    pub store_block_header_size: u32,
    pub store_record_header_size: u32,
}

impl GeneralInfo {
    /// The running binary's sizes.
    pub fn current() -> Self {
        Self {
            block_header_size: mem::size_of::<SessionBlockHeader>() as u32,
            record_header_size: mem::size_of::<SessionRecordHeader>() as u32,
            store_block_header_size: mem::size_of::<BlockHeader>() as u32,
            store_record_header_size: mem::size_of::<RecordHeader>() as u32,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockFileSection {
    pub begin: u64,
    pub end: u64,
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordFileSection {
    pub begin: u64,
    pub end: u64,
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataFileSection {
    pub index: u32,
    pub blocksize: u64,
    pub path: String,
    pub end: u64,
}

/// One row of the unfinished-record table. `file_offset` is where the
/// record's next payload byte goes, `size` how many are still missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnfinishedRecord {
    pub key: RecordKey,
    pub data_file: u32,
    pub file_offset: u64,
    pub size: u64,
}

/// Parsed form of the sidecar.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeConfig {
    pub info: GeneralInfo,
    pub block_files: Vec<BlockFileSection>,
    pub record_files: Vec<RecordFileSection>,
    pub data_files: Vec<DataFileSection>,
    pub unfinished: Vec<UnfinishedRecord>,
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

/// Serialize `config` into the sidecar wire form. Deterministic: equal
/// configs produce equal bytes.
pub fn to_bytes(config: &VolumeConfig) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&VOLUME_CONFIG_MAGIC_1_0);
    put_u32(&mut out, VOLUME_CONFIG_VERSION);
    put_u32(&mut out, config.info.block_header_size);
    put_u32(&mut out, config.info.record_header_size);
    put_u32(&mut out, config.info.store_block_header_size);
    put_u32(&mut out, config.info.store_record_header_size);

    put_u32(&mut out, config.block_files.len() as u32);
    for section in &config.block_files {
        put_u64(&mut out, section.begin);
        put_u64(&mut out, section.end);
        put_str(&mut out, &section.path);
    }

    put_u32(&mut out, config.record_files.len() as u32);
    for section in &config.record_files {
        put_u64(&mut out, section.begin);
        put_u64(&mut out, section.end);
        put_str(&mut out, &section.path);
    }

    put_u32(&mut out, config.data_files.len() as u32);
    for section in &config.data_files {
        put_u32(&mut out, section.index);
        put_u64(&mut out, section.blocksize);
        put_str(&mut out, &section.path);
        put_u64(&mut out, section.end);
    }

    put_u32(&mut out, config.unfinished.len() as u32);
    for row in &config.unfinished {
        put_u32(&mut out, row.key.session_id);
        put_u32(&mut out, row.key.session_time);
        put_i32(&mut out, row.key.file_index);
        put_i32(&mut out, row.key.stream);
        put_u32(&mut out, row.data_file);
        put_u64(&mut out, row.file_offset);
        put_u64(&mut out, row.size);
    }

    out
}

struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        if self.buf.len() < n {
            return Err(StoreError::Corrupt("truncated config"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn i32(&mut self) -> Result<i32, StoreError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, StoreError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, StoreError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| StoreError::Corrupt("path is not valid utf-8"))
    }

    /// Read a list length and sanity-check it against the remaining
    /// bytes, so a corrupt count cannot drive a huge allocation.
    fn count(&mut self, min_entry_size: usize) -> Result<usize, StoreError> {
        let n = self.u32()? as usize;
        if n.checked_mul(min_entry_size)
            .map_or(true, |total| total > self.buf.len())
        {
            return Err(StoreError::Corrupt("list count exceeds the remaining bytes"));
        }
        Ok(n)
    }

    fn finish(self) -> Result<(), StoreError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Corrupt("trailing bytes after the unfinished table"))
        }
    }
}

/// Parse a sidecar. A failure never leaves partial state behind; the
/// caller either gets a complete config or none.
pub fn from_bytes(bytes: &[u8]) -> Result<VolumeConfig, StoreError> {
    let mut dec = Decoder { buf: bytes };

    if dec.take(8)? != VOLUME_CONFIG_MAGIC_1_0 {
        return Err(StoreError::Corrupt("bad magic"));
    }
    if dec.u32()? != VOLUME_CONFIG_VERSION {
        return Err(StoreError::Corrupt("unknown config version"));
    }
    let info = GeneralInfo {
        block_header_size: dec.u32()?,
        record_header_size: dec.u32()?,
        store_block_header_size: dec.u32()?,
        store_record_header_size: dec.u32()?,
    };

    let mut block_files = Vec::new();
    for _ in 0..dec.count(8 + 8 + 4)? {
        block_files.push(BlockFileSection {
            begin: dec.u64()?,
            end: dec.u64()?,
            path: dec.string()?,
        });
    }

    let mut record_files = Vec::new();
    for _ in 0..dec.count(8 + 8 + 4)? {
        record_files.push(RecordFileSection {
            begin: dec.u64()?,
            end: dec.u64()?,
            path: dec.string()?,
        });
    }

    let mut data_files = Vec::new();
    for _ in 0..dec.count(4 + 8 + 4 + 8)? {
        data_files.push(DataFileSection {
            index: dec.u32()?,
            blocksize: dec.u64()?,
            path: dec.string()?,
            end: dec.u64()?,
        });
    }

    let mut unfinished = Vec::new();
    for _ in 0..dec.count(4 * 5 + 8 * 2)? {
        unfinished.push(UnfinishedRecord {
            key: RecordKey {
                session_id: dec.u32()?,
                session_time: dec.u32()?,
                file_index: dec.i32()?,
                stream: dec.i32()?,
            },
            data_file: dec.u32()?,
            file_offset: dec.u64()?,
            size: dec.u64()?,
        });
    }

    dec.finish()?;

    Ok(VolumeConfig {
        info,
        block_files,
        record_files,
        data_files,
        unfinished,
    })
}
