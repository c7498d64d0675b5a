//! Scoped file descriptors.
//!
//! Thin wrappers over the raw syscalls the store needs. A partial read
//! or write counts as a failure: callers rely on "all bytes or nothing
//! usable". Every failure also trips a sticky error flag so call sites
//! that batch many operations can check once at the end.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Whence;

fn io_err(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// A file descriptor that is closed exactly once, when dropped.
pub struct Fd {
    file: OwnedFd,
    error: bool,
}

impl Fd {
    /// Open `path` directly.
    pub fn open(path: &Path, flags: OFlag, mode: Mode) -> io::Result<Self> {
        let fd = nix::fcntl::open(path, flags, mode).map_err(io_err)?;
        Ok(Self {
            file: unsafe { OwnedFd::from_raw_fd(fd) },
            error: false,
        })
    }

    /// Open `path` relative to the directory handle `dir`.
    pub fn openat(dir: &Fd, path: &Path, flags: OFlag, mode: Mode) -> io::Result<Self> {
        let fd = nix::fcntl::openat(dir.as_raw_fd(), path, flags, mode).map_err(io_err)?;
        Ok(Self {
            file: unsafe { OwnedFd::from_raw_fd(fd) },
            error: false,
        })
    }

    /// False once any operation on this descriptor has failed.
    pub fn is_ok(&self) -> bool {
        !self.error
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.error = true;
        err
    }

    /// Read exactly `buf.len()` bytes at the current offset.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match nix::unistd::read(self.file.as_raw_fd(), buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(_) => Err(self.fail(io::ErrorKind::UnexpectedEof.into())),
            Err(err) => Err(self.fail(io_err(err))),
        }
    }

    /// Write all of `buf` at the current offset.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match nix::unistd::write(self.file.as_raw_fd(), buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(_) => Err(self.fail(io::ErrorKind::WriteZero.into())),
            Err(err) => Err(self.fail(io_err(err))),
        }
    }

    /// Seek to the absolute offset `pos`.
    pub fn seek(&mut self, pos: u64) -> io::Result<()> {
        match nix::unistd::lseek(self.file.as_raw_fd(), pos as i64, Whence::SeekSet) {
            Ok(res) if res as u64 == pos => Ok(()),
            Ok(_) => Err(self.fail(io::Error::new(
                io::ErrorKind::Other,
                "lseek landed at the wrong offset",
            ))),
            Err(err) => Err(self.fail(io_err(err))),
        }
    }

    /// `fsync`.
    pub fn flush(&mut self) -> io::Result<()> {
        nix::unistd::fsync(self.file.as_raw_fd()).map_err(|err| self.fail(io_err(err)))
    }

    /// `ftruncate` to `len` bytes.
    pub fn resize(&mut self, len: u64) -> io::Result<()> {
        nix::unistd::ftruncate(self.file.as_raw_fd(), len as i64)
            .map_err(|err| self.fail(io_err(err)))
    }

    /// Current file length; leaves the offset at 0.
    pub fn size_then_reset(&mut self) -> io::Result<u64> {
        let end = nix::unistd::lseek(self.file.as_raw_fd(), 0, Whence::SeekEnd)
            .map_err(|err| self.fail(io_err(err)))?;
        nix::unistd::lseek(self.file.as_raw_fd(), 0, Whence::SeekSet)
            .map_err(|err| self.fail(io_err(err)))?;
        Ok(end as u64)
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn create_flags() -> OFlag {
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_CLOEXEC
    }

    #[test]
    fn roundtrip_through_a_file() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fd = Fd::open(
            &dir.path().join("f"),
            create_flags(),
            Mode::from_bits_truncate(0o644),
        )?;
        fd.write_all(b"0123456789")?;
        fd.seek(2)?;
        let mut buf = [0u8; 4];
        fd.read_exact(&mut buf)?;
        assert_eq!(&buf, b"2345");
        assert_eq!(fd.size_then_reset()?, 10);
        fd.resize(4)?;
        assert_eq!(fd.size_then_reset()?, 4);
        assert!(fd.is_ok());
        Ok(())
    }

    #[test]
    fn openat_resolves_relative_to_the_directory() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let dirfd = Fd::open(
            dir.path(),
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let mut fd = Fd::openat(
            &dirfd,
            Path::new("inner"),
            create_flags(),
            Mode::from_bits_truncate(0o644),
        )?;
        fd.write_all(b"x")?;
        assert!(dir.path().join("inner").exists());
        Ok(())
    }

    #[test]
    fn short_read_is_sticky() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fd = Fd::open(
            &dir.path().join("f"),
            create_flags(),
            Mode::from_bits_truncate(0o644),
        )?;
        fd.write_all(b"ab")?;
        fd.seek(0)?;
        let mut buf = [0u8; 8];
        assert!(fd.read_exact(&mut buf).is_err());
        assert!(!fd.is_ok());
        Ok(())
    }
}
