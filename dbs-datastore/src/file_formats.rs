//! On-disk data structures.
//!
//! All header sizes below are part of the on-disk contract: the sidecar
//! records them and `Volume::open` refuses a volume written by a binary
//! with different ones.

use std::fmt;

use endian_trait::Endian;

use dbs_tools::static_assert_size;

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

// openssl::sha::sha256(b"dedup backup store volume config v1.0")[0..8]
pub const VOLUME_CONFIG_MAGIC_1_0: [u8; 8] = [212, 55, 160, 11, 73, 188, 2, 139];

/// Sidecar format version.
pub const VOLUME_CONFIG_VERSION: u32 = 1;

/// Block header as it arrives from a backup session.
#[derive(Endian, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SessionBlockHeader {
    pub checksum: u32,
    pub block_size: u32,
    pub block_number: u32,
    pub id: [u8; 4],
    pub session_id: u32,
    pub session_time: u32,
}
static_assert_size!(SessionBlockHeader, 24);

/// Record header as it arrives from a backup session.
///
/// `data_len` is the record's full payload length; the payload may
/// reach the store spread over several blocks.
#[derive(Endian, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SessionRecordHeader {
    pub session_id: u32,
    pub session_time: u32,
    pub file_index: i32,
    pub stream: i32,
    pub data_len: u32,
}
static_assert_size!(SessionRecordHeader, 20);

/// Element type of the block file.
///
/// Each entry covers the record headers
/// `[record_start, record_start + record_count)` in the record file.
#[derive(Endian, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BlockHeader {
    pub record_start: u64,
    pub record_count: u32,
    pub checksum: u32,
    pub block_size: u32,
    pub block_number: u32,
    pub session_id: u32,
    pub session_time: u32,
    pub id: [u8; 4],
    reserved: [u8; 4],
}
static_assert_size!(BlockHeader, 40);

impl BlockHeader {
    pub fn new(session: &SessionBlockHeader, record_start: u64, record_count: u32) -> Self {
        Self {
            record_start,
            record_count,
            checksum: session.checksum,
            block_size: session.block_size,
            block_number: session.block_number,
            session_id: session.session_id,
            session_time: session.session_time,
            id: session.id,
            reserved: [0; 4],
        }
    }
}

/// Element type of the record file.
///
/// Points at the payload region `[file_offset, file_offset + size)`
/// inside data file `data_file`.
#[derive(Endian, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RecordHeader {
    pub file_offset: u64,
    pub size: u64,
    pub session_id: u32,
    pub session_time: u32,
    pub file_index: i32,
    pub stream: i32,
    pub data_file: u32,
    reserved: [u8; 4],
}
static_assert_size!(RecordHeader, 40);

impl RecordHeader {
    pub fn new(key: RecordKey, data_file: u32, file_offset: u64, size: u64) -> Self {
        Self {
            file_offset,
            size,
            session_id: key.session_id,
            session_time: key.session_time,
            file_index: key.file_index,
            stream: key.stream,
            data_file,
            reserved: [0; 4],
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            session_id: self.session_id,
            session_time: self.session_time,
            file_index: self.file_index,
            stream: self.stream,
        }
    }
}

/// Identity of an in-progress record, stable across process restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub session_id: u32,
    pub session_time: u32,
    pub file_index: i32,
    pub stream: i32,
}

impl RecordKey {
    pub fn of(hdr: &SessionRecordHeader) -> Self {
        Self {
            session_id: hdr.session_id,
            session_time: hdr.session_time,
            file_index: hdr.file_index,
            stream: hdr.stream,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.session_id, self.session_time, self.file_index, self.stream
        )
    }
}
