//! The deduplicating volume.
//!
//! A volume is a directory: a `config` sidecar describing everything
//! else, one block file, one record file, and one or more data files.
//! Records whose payload has not fully arrived are tracked in the
//! unfinished table; the sidecar persists that table, so a reopened
//! volume resumes every unfinished record exactly where it stopped.
//!
//! The sidecar is always written *after* the files it describes have
//! been flushed. The data, record and block files are the source of
//! truth for bytes already written; the sidecar must never get ahead of
//! them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use endian_trait::Endian;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use dbs_tools::fd::Fd;

use crate::config::{
    self, BlockFileSection, DataFileSection, GeneralInfo, RecordFileSection, UnfinishedRecord,
    VolumeConfig,
};
use crate::error::StoreError;
use crate::file_formats::{
    BlockHeader, RecordHeader, RecordKey, SessionBlockHeader, SessionRecordHeader,
};
use crate::file_vec::FileVec;

const SIDECAR_NAME: &str = "config";
const BLOCK_FILE_NAME: &str = "blocks";
const RECORD_FILE_NAME: &str = "records";

const BLOCK_FILE_CHUNK: u64 = 128;
const RECORD_FILE_CHUNK: u64 = 1024;

fn data_file_name(index: u32) -> String {
    format!("data_{:04}", index)
}

fn create_flags() -> OFlag {
    OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC
}

fn file_mode() -> Mode {
    Mode::from_bits_truncate(0o644)
}

/// Progress cursor of an unfinished record inside its data file.
///
/// `[current, end)` is the still-unwritten remainder of the record's
/// reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteLoc {
    pub file_index: u32,
    pub current: u64,
    pub end: u64,
}

struct DataFile {
    index: u32,
    blocksize: u64,
    path: String,
    file: Fd,
    end: u64,
}

impl DataFile {
    /// Reserve `len` bytes at the end, extending the file.
    fn reserve(&mut self, len: u64) -> Result<u64, StoreError> {
        let begin = self.end;
        let end = begin
            .checked_add(len)
            .ok_or(StoreError::InvalidArgument("data file offset overflows"))?;
        self.file.resize(end)?;
        self.end = end;
        Ok(begin)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        self.file.seek(offset)?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, data: &mut [u8]) -> Result<(), StoreError> {
        self.file.seek(offset)?;
        self.file.read_exact(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(self.file.flush()?)
    }
}

/// A single backup volume rooted in one directory.
///
/// A volume is owned by one thread; concurrent access has to be
/// serialized outside.
pub struct Volume {
    dir: PathBuf,
    dirfd: Fd,
    sidecar: Fd,
    block_file: FileVec<BlockHeader>,
    block_begin: u64,
    block_path: String,
    record_file: FileVec<RecordHeader>,
    record_begin: u64,
    record_path: String,
    data_files: Vec<DataFile>,
    unfinished: HashMap<RecordKey, WriteLoc>,
    /// Record-file index of every header this process appended; needed
    /// to stamp records that complete short of their reservation.
    open_records: HashMap<RecordKey, u64>,
    /// First record header not yet covered by a block.
    block_record_start: u64,
    error: bool,
}

/// Everything `open`/`reload` produce, built completely before any of
/// it touches the volume.
struct LoadedFiles {
    block_file: FileVec<BlockHeader>,
    block_begin: u64,
    block_path: String,
    record_file: FileVec<RecordHeader>,
    record_begin: u64,
    record_path: String,
    data_files: Vec<DataFile>,
    unfinished: HashMap<RecordKey, WriteLoc>,
}

fn read_sidecar(sidecar: &mut Fd) -> Result<Vec<u8>, StoreError> {
    let len = sidecar.size_then_reset()?;
    let mut bytes = vec![0u8; len as usize];
    sidecar.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn check_size(field: &'static str, found: u32, expected: u32) -> Result<(), StoreError> {
    if found != expected {
        return Err(StoreError::IncompatibleLayout {
            field,
            found,
            expected,
        });
    }
    Ok(())
}

fn open_vec<T: Copy + Default>(
    dirfd: &Fd,
    path: &str,
    used: u64,
    chunk: u64,
) -> Result<FileVec<T>, StoreError> {
    let fd = Fd::openat(
        dirfd,
        Path::new(path),
        OFlag::O_RDWR | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    match FileVec::new(fd, used, chunk) {
        Err(StoreError::InvalidArgument(_)) => Err(StoreError::Corrupt(
            "file is shorter than its config section claims",
        )),
        other => other,
    }
}

fn load_files(dirfd: &Fd, cfg: &VolumeConfig) -> Result<LoadedFiles, StoreError> {
    // the current format supports exactly one block and one record file
    if cfg.block_files.len() != 1 {
        return Err(StoreError::Corrupt("expected exactly one block file"));
    }
    if cfg.record_files.len() != 1 {
        return Err(StoreError::Corrupt("expected exactly one record file"));
    }

    let current = GeneralInfo::current();
    check_size(
        "block_header_size",
        cfg.info.block_header_size,
        current.block_header_size,
    )?;
    check_size(
        "record_header_size",
        cfg.info.record_header_size,
        current.record_header_size,
    )?;
    check_size(
        "store_block_header_size",
        cfg.info.store_block_header_size,
        current.store_block_header_size,
    )?;
    check_size(
        "store_record_header_size",
        cfg.info.store_record_header_size,
        current.store_record_header_size,
    )?;

    let block_section = &cfg.block_files[0];
    if block_section.begin > block_section.end {
        return Err(StoreError::Corrupt("block section begin past its end"));
    }
    let record_section = &cfg.record_files[0];
    if record_section.begin > record_section.end {
        return Err(StoreError::Corrupt("record section begin past its end"));
    }

    for (pos, section) in cfg.data_files.iter().enumerate() {
        if section.index as usize != pos {
            return Err(StoreError::Corrupt("data file indices must be dense and ordered"));
        }
    }

    let mut unfinished = HashMap::new();
    for row in &cfg.unfinished {
        let section = cfg
            .data_files
            .get(row.data_file as usize)
            .ok_or(StoreError::Corrupt("unfinished record names an unknown data file"))?;
        let end = row
            .file_offset
            .checked_add(row.size)
            .ok_or(StoreError::Corrupt("unfinished record range overflows"))?;
        if end > section.end {
            return Err(StoreError::Corrupt(
                "unfinished record extends past its data file",
            ));
        }
        match unfinished.entry(row.key) {
            Entry::Occupied(_) => return Err(StoreError::DuplicateKey(row.key)),
            Entry::Vacant(slot) => {
                slot.insert(WriteLoc {
                    file_index: row.data_file,
                    current: row.file_offset,
                    end,
                });
            }
        }
    }

    // only a fully validated sidecar gets to open files
    let block_file = open_vec(dirfd, &block_section.path, block_section.end, BLOCK_FILE_CHUNK)?;
    let record_file = open_vec(
        dirfd,
        &record_section.path,
        record_section.end,
        RECORD_FILE_CHUNK,
    )?;
    let mut data_files = Vec::with_capacity(cfg.data_files.len());
    for section in &cfg.data_files {
        let fd = Fd::openat(
            dirfd,
            Path::new(&section.path),
            OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        data_files.push(DataFile {
            index: section.index,
            blocksize: section.blocksize,
            path: section.path.clone(),
            file: fd,
            end: section.end,
        });
    }

    Ok(LoadedFiles {
        block_file,
        block_begin: block_section.begin,
        block_path: block_section.path.clone(),
        record_file,
        record_begin: record_section.begin,
        record_path: record_section.path.clone(),
        data_files,
        unfinished,
    })
}

impl Volume {
    /// Create a fresh volume under `dir` with one data file of the
    /// given blocksize. Refuses a directory that already holds one.
    pub fn create(dir: &Path, blocksize: u64) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let dirfd = Fd::open(
            dir,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let sidecar = Fd::openat(&dirfd, Path::new(SIDECAR_NAME), create_flags(), file_mode())?;
        let block_fd = Fd::openat(&dirfd, Path::new(BLOCK_FILE_NAME), create_flags(), file_mode())?;
        let record_fd = Fd::openat(
            &dirfd,
            Path::new(RECORD_FILE_NAME),
            create_flags(),
            file_mode(),
        )?;
        let data_path = data_file_name(0);
        let data_fd = Fd::openat(&dirfd, Path::new(&data_path), create_flags(), file_mode())?;

        let mut volume = Self {
            dir: dir.to_owned(),
            dirfd,
            sidecar,
            block_file: FileVec::new(block_fd, 0, BLOCK_FILE_CHUNK)?,
            block_begin: 0,
            block_path: BLOCK_FILE_NAME.to_string(),
            record_file: FileVec::new(record_fd, 0, RECORD_FILE_CHUNK)?,
            record_begin: 0,
            record_path: RECORD_FILE_NAME.to_string(),
            data_files: vec![DataFile {
                index: 0,
                blocksize,
                path: data_path,
                file: data_fd,
                end: 0,
            }],
            unfinished: HashMap::new(),
            open_records: HashMap::new(),
            block_record_start: 0,
            error: false,
        };
        volume.write_current_config()?;
        log::info!("created volume at {:?}", volume.dir);
        Ok(volume)
    }

    /// Open an existing volume.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let dirfd = Fd::open(
            dir,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let mut sidecar = Fd::openat(
            &dirfd,
            Path::new(SIDECAR_NAME),
            OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let bytes = read_sidecar(&mut sidecar)?;
        let cfg = config::from_bytes(&bytes)?;
        let files = load_files(&dirfd, &cfg)?;
        let block_record_start = files.record_file.len();
        log::debug!(
            "opened volume at {:?} with {} unfinished records",
            dir,
            files.unfinished.len()
        );
        Ok(Self {
            dir: dir.to_owned(),
            dirfd,
            sidecar,
            block_file: files.block_file,
            block_begin: files.block_begin,
            block_path: files.block_path,
            record_file: files.record_file,
            record_begin: files.record_begin,
            record_path: files.record_path,
            data_files: files.data_files,
            unfinished: files.unfinished,
            open_records: HashMap::new(),
            block_record_start,
            error: false,
        })
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.error {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "volume disabled by an earlier sidecar write failure",
            )))
        } else {
            Ok(())
        }
    }

    /// Re-read the sidecar into this volume. On any failure the volume
    /// is left exactly as it was.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.check()?;
        let bytes = read_sidecar(&mut self.sidecar)?;
        let cfg = config::from_bytes(&bytes)?;
        let files = load_files(&self.dirfd, &cfg)?;
        self.block_file = files.block_file;
        self.block_begin = files.block_begin;
        self.block_path = files.block_path;
        self.record_file = files.record_file;
        self.record_begin = files.record_begin;
        self.record_path = files.record_path;
        self.data_files = files.data_files;
        self.unfinished = files.unfinished;
        self.open_records.clear();
        self.block_record_start = self.record_file.len();
        Ok(())
    }

    fn current_config(&self) -> VolumeConfig {
        VolumeConfig {
            info: GeneralInfo::current(),
            block_files: vec![BlockFileSection {
                begin: self.block_begin,
                end: self.block_file.len(),
                path: self.block_path.clone(),
            }],
            record_files: vec![RecordFileSection {
                begin: self.record_begin,
                end: self.record_file.len(),
                path: self.record_path.clone(),
            }],
            data_files: self
                .data_files
                .iter()
                .map(|data| DataFileSection {
                    index: data.index,
                    blocksize: data.blocksize,
                    path: data.path.clone(),
                    end: data.end,
                })
                .collect(),
            unfinished: self
                .unfinished
                .iter()
                .map(|(key, loc)| UnfinishedRecord {
                    key: *key,
                    data_file: loc.file_index,
                    file_offset: loc.current,
                    size: loc.end - loc.current,
                })
                .collect(),
        }
    }

    /// Rewrite the sidecar from the live state.
    ///
    /// Any failure here leaves a sidecar of unknown content behind;
    /// the volume trips its sticky error and refuses further work.
    pub fn write_current_config(&mut self) -> Result<(), StoreError> {
        self.check()?;
        let bytes = config::to_bytes(&self.current_config());
        let res = (|| {
            self.sidecar.resize(0)?;
            self.sidecar.seek(0)?;
            self.sidecar.write_all(&bytes)
        })();
        if let Err(err) = res {
            self.error = true;
            return Err(err.into());
        }
        Ok(())
    }

    /// Open a record, or resume one the sidecar brought back.
    ///
    /// A new record reserves its full payload range in a data file and
    /// appends its header to the record file; resuming is a no-op, the
    /// range is already reserved.
    pub fn begin_record(&mut self, hdr: &SessionRecordHeader) -> Result<(), StoreError> {
        self.check()?;
        let key = RecordKey::of(hdr);
        if self.unfinished.contains_key(&key) {
            return Ok(());
        }
        let len = hdr.data_len as u64;
        let file_index = self.choose_data_file(len);
        let begin = self.data_files[file_index as usize].reserve(len)?;
        let header = RecordHeader::new(key, file_index, begin, len);
        let index = self.record_file.write(&[header.to_le()])?;
        if len > 0 {
            self.unfinished.insert(
                key,
                WriteLoc {
                    file_index,
                    current: begin,
                    end: begin + len,
                },
            );
            self.open_records.insert(key, index);
        }
        log::debug!(
            "opened record {} at {}+{} in data file {}",
            key,
            begin,
            len,
            file_index
        );
        Ok(())
    }

    /// The data file with the largest blocksize dividing the payload
    /// length; the first file is the catch-all.
    fn choose_data_file(&self, len: u64) -> u32 {
        let mut best: Option<(u64, u32)> = None;
        for file in &self.data_files {
            if file.blocksize > 0 && len > 0 && len % file.blocksize == 0 {
                if best.map_or(true, |(blocksize, _)| file.blocksize > blocksize) {
                    best = Some((file.blocksize, file.index));
                }
            }
        }
        best.map_or(0, |(_, index)| index)
    }

    /// Append payload bytes to an unfinished record. Returns true when
    /// the reservation is exactly consumed and the record is complete.
    pub fn append_record_data(&mut self, key: RecordKey, payload: &[u8]) -> Result<bool, StoreError> {
        self.check()?;
        let loc = match self.unfinished.get_mut(&key) {
            Some(loc) => loc,
            None => return Err(StoreError::InvalidArgument("record is not open")),
        };
        let len = payload.len() as u64;
        if len > loc.end - loc.current {
            return Err(StoreError::InvalidArgument(
                "payload exceeds the record's reservation",
            ));
        }
        let offset = loc.current;
        self.data_files[loc.file_index as usize].write_at(offset, payload)?;
        loc.current += len;
        let finished = loc.current == loc.end;
        if finished {
            self.unfinished.remove(&key);
            self.open_records.remove(&key);
            log::debug!("record {} complete", key);
        }
        Ok(finished)
    }

    /// Finish a record before its reservation is consumed.
    ///
    /// When this process appended the header, its size field is stamped
    /// down to the bytes actually present. A record resumed from the
    /// sidecar keeps its reserved size, the header's position is not
    /// recorded on disk.
    pub fn complete_record(&mut self, key: RecordKey) -> Result<(), StoreError> {
        self.check()?;
        let loc = match self.unfinished.get(&key) {
            Some(loc) => *loc,
            None => return Err(StoreError::InvalidArgument("record is not open")),
        };
        if let Some(&index) = self.open_records.get(&key) {
            if loc.current < loc.end {
                let mut header = self.record_file.read_at(index, 1)?[0].from_le();
                header.size -= loc.end - loc.current;
                self.record_file.write_at(index, &[header.to_le()])?;
            }
        }
        self.unfinished.remove(&key);
        self.open_records.remove(&key);
        log::debug!("record {} closed", key);
        Ok(())
    }

    /// Append the block header covering every record header appended
    /// since the previous block. Returns the block's index.
    pub fn append_block(&mut self, hdr: &SessionBlockHeader) -> Result<u64, StoreError> {
        self.check()?;
        let start = self.block_record_start;
        let count = self.record_file.len() - start;
        let header = BlockHeader::new(hdr, start, count as u32);
        let index = self.block_file.write(&[header.to_le()])?;
        self.block_record_start = self.record_file.len();
        Ok(index)
    }

    /// Add another data file with its own blocksize. Returns its index.
    pub fn add_data_file(&mut self, blocksize: u64) -> Result<u32, StoreError> {
        self.check()?;
        let index = self.data_files.len() as u32;
        let path = data_file_name(index);
        let fd = Fd::openat(&self.dirfd, Path::new(&path), create_flags(), file_mode())?;
        self.data_files.push(DataFile {
            index,
            blocksize,
            path,
            file: fd,
            end: 0,
        });
        Ok(index)
    }

    pub fn block_header_at(&mut self, index: u64) -> Result<BlockHeader, StoreError> {
        Ok(self.block_file.read_at(index, 1)?[0].from_le())
    }

    pub fn record_header_at(&mut self, index: u64) -> Result<RecordHeader, StoreError> {
        Ok(self.record_file.read_at(index, 1)?[0].from_le())
    }

    /// Read a record's payload back, as described by its header.
    pub fn read_record_data(&mut self, header: &RecordHeader) -> Result<Vec<u8>, StoreError> {
        self.check()?;
        let file = self
            .data_files
            .get_mut(header.data_file as usize)
            .ok_or(StoreError::InvalidArgument("record names an unknown data file"))?;
        let end = header
            .file_offset
            .checked_add(header.size)
            .ok_or(StoreError::InvalidArgument("record range overflows"))?;
        if end > file.end {
            return Err(StoreError::InvalidArgument(
                "record extends past its data file",
            ));
        }
        let mut data = vec![0u8; header.size as usize];
        file.read_at(header.file_offset, &mut data)?;
        Ok(data)
    }

    /// Flush everything. Data, record and block files first; the
    /// sidecar is rewritten and synced last so it never describes
    /// state the other files do not have yet.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.check()?;
        for file in &mut self.data_files {
            file.flush()?;
        }
        self.record_file.flush()?;
        self.block_file.flush()?;
        self.write_current_config()?;
        if let Err(err) = self.sidecar.flush() {
            self.error = true;
            return Err(err.into());
        }
        Ok(())
    }

    pub fn is_ok(&self) -> bool {
        !self.error
            && self.sidecar.is_ok()
            && self.block_file.is_ok()
            && self.record_file.is_ok()
            && self.data_files.iter().all(|data| data.file.is_ok())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn unfinished_records(&self) -> impl Iterator<Item = (&RecordKey, &WriteLoc)> {
        self.unfinished.iter()
    }

    pub fn block_count(&self) -> u64 {
        self.block_file.len()
    }

    pub fn record_count(&self) -> u64 {
        self.record_file.len()
    }

    pub fn data_file_count(&self) -> usize {
        self.data_files.len()
    }
}
