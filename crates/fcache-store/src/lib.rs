#![forbid(unsafe_code)]
//! Backing-store seam for the page cache.
//!
//! The cache engine performs all of its I/O through [`ByteSource`], a
//! stateful file-like interface (seek, read, write, length, EOF flag), and
//! obtains sources through a [`SourceOpener`]. The default implementation
//! is the local filesystem ([`FileSource`]/[`FsOpener`]); anything
//! file-shaped (a network blob, an archive member) can be substituted
//! behind the same traits.

use fcache_error::{FcError, Result};
use fcache_types::OpenMode;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

/// Byte-oriented data source with an explicit position.
///
/// Reads and writes move the position; a read that returns fewer bytes than
/// requested raises the EOF flag, mirroring classic buffered file access.
pub trait ByteSource: Send + fmt::Debug {
    /// Move the position to an absolute byte offset.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Current byte position.
    fn position(&self) -> u64;

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Returns the number of bytes read; a short count means end of file
    /// was reached and sets the EOF flag.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write up to `buf.len()` bytes at the current position.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Total length of the source in bytes.
    fn len(&self) -> Result<u64>;

    /// Whether the last read stopped short of the requested count.
    fn eof_reached(&self) -> bool;

    /// Release the underlying handle. Further operations fail.
    fn close(&mut self) -> Result<()>;

    /// Write the whole of `buf`, retrying short writes.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..])?;
            if n == 0 {
                return Err(FcError::CantWrite("write made no progress".to_owned()));
            }
            written += n;
        }
        Ok(())
    }
}

/// Factory handing out [`ByteSource`]s for paths.
pub trait SourceOpener: Send + Sync + fmt::Debug {
    /// Open `path` with the given mode.
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn ByteSource>>;

    /// Whether `path` names an existing source.
    fn exists(&self, path: &Path) -> bool;
}

/// Local file implementing [`ByteSource`] with pread/pwrite-style I/O.
///
/// The position lives here rather than in the kernel file description, so
/// no seek syscalls are issued and a shared `File` never sees interleaved
/// cursor updates.
#[derive(Debug)]
pub struct FileSource {
    file: Option<File>,
    pos: u64,
    eof: bool,
    writable: bool,
}

impl FileSource {
    /// Open `path` with `mode`.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(mode.readable()).write(mode.writable());
        if mode.truncates() {
            options.create(true).truncate(true);
        }
        let file = options
            .open(path)
            .map_err(|err| FcError::CantOpen(format!("{}: {err}", path.display())))?;
        trace!(
            target: "fcache::store",
            event = "source_opened",
            path = %path.display(),
            mode = ?mode
        );
        Ok(Self {
            file: Some(file),
            pos: 0,
            eof: false,
            writable: mode.writable(),
        })
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| FcError::Unavailable("source is closed".to_owned()))
    }
}

impl ByteSource for FileSource {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file()?;
        self.pos = offset;
        self.eof = false;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let file = self.file()?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], self.pos + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.pos += filled as u64;
        self.eof = filled < buf.len();
        Ok(filled)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(FcError::CantWrite("source is read-only".to_owned()));
        }
        let file = self.file()?;
        let n = file.write_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn eof_reached(&self) -> bool {
        self.eof
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            if self.writable {
                file.sync_all()?;
            }
            trace!(target: "fcache::store", event = "source_closed");
        }
        Ok(())
    }
}

/// [`SourceOpener`] backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOpener;

impl SourceOpener for FsOpener {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn ByteSource>> {
        Ok(Box::new(FileSource::open(path, mode)?))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(contents: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fixture.bin");
        std::fs::write(&path, contents).expect("write fixture");
        (dir, path)
    }

    #[test]
    fn read_advances_position_and_flags_eof() {
        let (_dir, path) = fixture(b"abcdef");
        let mut source = FileSource::open(&path, OpenMode::Read).expect("open");

        let mut buf = [0_u8; 4];
        assert_eq!(source.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(source.position(), 4);
        assert!(!source.eof_reached());

        assert_eq!(source.read(&mut buf).expect("read tail"), 2);
        assert_eq!(&buf[..2], b"ef");
        assert!(source.eof_reached());
    }

    #[test]
    fn seek_clears_eof() {
        let (_dir, path) = fixture(b"xy");
        let mut source = FileSource::open(&path, OpenMode::Read).expect("open");
        let mut buf = [0_u8; 8];
        let _ = source.read(&mut buf).expect("read");
        assert!(source.eof_reached());
        source.seek(0).expect("seek");
        assert!(!source.eof_reached());
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn write_extends_file() {
        let (_dir, path) = fixture(b"");
        let mut source = FileSource::open(&path, OpenMode::WriteRead).expect("open");
        source.seek(4096).expect("seek");
        source.write_all(b"tail").expect("write");
        assert_eq!(source.len().expect("len"), 4100);
    }

    #[test]
    fn read_only_source_rejects_writes() {
        let (_dir, path) = fixture(b"ro");
        let mut source = FileSource::open(&path, OpenMode::Read).expect("open");
        assert!(matches!(
            source.write(b"nope"),
            Err(FcError::CantWrite(_))
        ));
    }

    #[test]
    fn closed_source_is_unavailable() {
        let (_dir, path) = fixture(b"z");
        let mut source = FileSource::open(&path, OpenMode::Read).expect("open");
        source.close().expect("close");
        let mut buf = [0_u8; 1];
        assert!(matches!(source.read(&mut buf), Err(FcError::Unavailable(_))));
    }

    #[test]
    fn write_mode_truncates() {
        let (_dir, path) = fixture(b"previous contents");
        let mut source = FileSource::open(&path, OpenMode::Write).expect("open");
        assert_eq!(source.len().expect("len"), 0);
        source.write_all(b"new").expect("write");
        drop(source);
        assert_eq!(std::fs::read(&path).expect("read back"), b"new");
    }
}
