//! A typed vector persisted one-to-one with a file.
//!
//! The file is nothing but `capacity` elements of `T` back to back, no
//! header, no padding. The first `used` of them are live; the rest is
//! reserved capacity from chunked growth and must be ignored on read.
//! Random-access reads and writes always restore the descriptor's
//! offset to the sequential cursor, so interleaving them with
//! sequential operations never needs an extra seek.

use std::marker::PhantomData;
use std::mem;

use dbs_tools::fd::Fd;

use crate::error::StoreError;

/// File-backed vector of plain `#[repr(C)]` elements.
///
/// Elements are written to the file exactly as they are laid out in
/// memory, so `T` must not contain pointers, padding the format cares
/// about, or anything else that does not survive a round-trip through
/// raw bytes.
pub struct FileVec<T> {
    file: Fd,
    used: u64,
    capacity: u64,
    iter: u64,
    chunk: u64,
    error: bool,
    _marker: PhantomData<T>,
}

impl<T: Copy + Default> FileVec<T> {
    const ELEM_SIZE: u64 = mem::size_of::<T>() as u64;

    /// Adopt `file` as storage.
    ///
    /// The file's current length defines the capacity; the first `used`
    /// elements are considered live. Growth happens in multiples of
    /// `chunk` elements.
    pub fn new(mut file: Fd, used: u64, chunk: u64) -> Result<Self, StoreError> {
        let len = file.size_then_reset()?;
        let capacity = len / Self::ELEM_SIZE;
        if used > capacity {
            return Err(StoreError::InvalidArgument(
                "used element count exceeds the file's capacity",
            ));
        }
        Ok(Self {
            file,
            used,
            capacity,
            iter: 0,
            chunk: chunk.max(1),
            error: false,
            _marker: PhantomData,
        })
    }

    /// Live element count.
    pub fn len(&self) -> u64 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The sequential cursor, in elements.
    pub fn position(&self) -> u64 {
        self.iter
    }

    /// File length in elements, including reserved growth.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_ok(&self) -> bool {
        !self.error && self.file.is_ok()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.error {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "file-backed vector disabled by an earlier i/o failure",
            )))
        } else {
            Ok(())
        }
    }

    /// Extend the vector by `count` elements, growing the file in
    /// multiples of the chunk size as needed. Returns the index of the
    /// first new element; the sequential cursor moves to the
    /// pre-reserve end.
    pub fn reserve(&mut self, count: u64) -> Result<u64, StoreError> {
        let start = self.reserve_at(self.used, count)?;
        self.iter = start;
        Ok(start)
    }

    fn reserve_at(&mut self, at: u64, count: u64) -> Result<u64, StoreError> {
        self.check()?;
        let new_end = at
            .checked_add(count)
            .ok_or(StoreError::InvalidArgument("element range overflows"))?;
        if at > self.used {
            // internal callers only ever pass `iter` or `used`
            self.error = true;
            return Err(StoreError::InvalidArgument("reserve past the used range"));
        }
        if new_end > self.capacity {
            let delta = new_end - self.capacity;
            let grown = (delta + self.chunk - 1) / self.chunk * self.chunk;
            let new_cap = self
                .capacity
                .checked_add(grown)
                .ok_or(StoreError::InvalidArgument("capacity overflows"))?;
            let new_len = new_cap
                .checked_mul(Self::ELEM_SIZE)
                .ok_or(StoreError::InvalidArgument("file length overflows"))?;
            if let Err(err) = self.file.resize(new_len) {
                self.error = true;
                return Err(err.into());
            }
            self.capacity = new_cap;
        }
        self.used = self.used.max(new_end);
        Ok(at)
    }

    /// Append `arr` at the sequential cursor, reserving as needed.
    /// Returns the index of the first element written and advances the
    /// cursor past the last.
    pub fn write(&mut self, arr: &[T]) -> Result<u64, StoreError> {
        let count = arr.len() as u64;
        let start = self.reserve_at(self.iter, count)?;
        // write_at restores the descriptor to the cursor; advancing the
        // cursor first saves the second seek
        let old_iter = self.iter;
        self.iter = start + count;
        match self.write_at(start, arr) {
            Ok(pos) => Ok(pos),
            Err(err) => {
                self.iter = old_iter;
                Err(err)
            }
        }
    }

    /// Overwrite `arr.len()` elements starting at `start`, which must
    /// not lie past the used range. The sequential cursor is
    /// unaffected.
    pub fn write_at(&mut self, start: u64, arr: &[T]) -> Result<u64, StoreError> {
        self.check()?;
        if start > self.used {
            return Err(StoreError::InvalidArgument("write past the used range"));
        }
        // plain #[repr(C)] elements, see the type-level contract
        let bytes = unsafe {
            std::slice::from_raw_parts(arr.as_ptr() as *const u8, arr.len() * mem::size_of::<T>())
        };
        let res = (|| {
            self.file.seek(start * Self::ELEM_SIZE)?;
            self.file.write_all(bytes)?;
            self.file.seek(self.iter * Self::ELEM_SIZE)
        })();
        if let Err(err) = res {
            self.error = true;
            return Err(err.into());
        }
        Ok(start)
    }

    /// Read `count` elements at the sequential cursor, advancing it.
    pub fn read(&mut self, count: u64) -> Result<Vec<T>, StoreError> {
        self.check()?;
        let old_iter = self.iter;
        let new_iter = old_iter
            .checked_add(count)
            .ok_or(StoreError::InvalidArgument("element range overflows"))?;
        self.iter = new_iter;
        match self.read_at(old_iter, count) {
            Ok(data) => Ok(data),
            Err(err) => {
                self.iter = old_iter;
                Err(err)
            }
        }
    }

    /// Read at the sequential cursor without advancing it.
    pub fn peek(&mut self, count: u64) -> Result<Vec<T>, StoreError> {
        self.check()?;
        self.read_at(self.iter, count)
    }

    /// Read `count` elements starting at `start`; the whole range must
    /// lie inside the used range. The sequential cursor is unaffected.
    pub fn read_at(&mut self, start: u64, count: u64) -> Result<Vec<T>, StoreError> {
        self.check()?;
        let end = start
            .checked_add(count)
            .ok_or(StoreError::InvalidArgument("element range overflows"))?;
        if end > self.used {
            return Err(StoreError::InvalidArgument("read past the used range"));
        }
        let mut out = vec![T::default(); count as usize];
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                out.as_mut_ptr() as *mut u8,
                out.len() * mem::size_of::<T>(),
            )
        };
        let res = (|| {
            self.file.seek(start * Self::ELEM_SIZE)?;
            self.file.read_exact(bytes)?;
            self.file.seek(self.iter * Self::ELEM_SIZE)
        })();
        if let Err(err) = res {
            self.error = true;
            return Err(err.into());
        }
        Ok(out)
    }

    /// Move the sequential cursor to `start`.
    pub fn move_to(&mut self, start: u64) -> Result<(), StoreError> {
        self.check()?;
        if start > self.used {
            return Err(StoreError::InvalidArgument("cursor past the used range"));
        }
        if self.iter == start {
            return Ok(());
        }
        self.iter = start;
        if let Err(err) = self.file.seek(start * Self::ELEM_SIZE) {
            self.error = true;
            return Err(err.into());
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.check()?;
        Ok(self.file.flush()?)
    }
}
