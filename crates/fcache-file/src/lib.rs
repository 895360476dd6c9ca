#![forbid(unsafe_code)]
//! Byte-oriented convenience wrapper over the cache engine.
//!
//! [`CachedFile`] is a thin façade over `check_cache`/`read`/`write`/
//! `seek`: typed little-endian accessors, buffered bulk transfers that
//! interleave prefetch windows with the copies, and line/CSV helpers.

use fcache_core::PageCache;
use fcache_error::{FcError, Result};
use fcache_types::{CachePolicy, Handle, OpenMode, PAGE_SIZE_U64, Whence};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Pages staged ahead of each bulk-transfer chunk.
const WINDOW_BYTES: u64 = 4 * PAGE_SIZE_U64;
/// Bytes moved per bulk-transfer chunk. Half the window, so the pages of a
/// chunk are always staged before the copy reaches them.
const CHUNK_BYTES: usize = 2 * PAGE_SIZE_U64 as usize;

/// A cached file with typed accessors.
///
/// Dropping the wrapper closes the file (flushing dirty pages); the file
/// stays tracked by the cache and can be reopened cheaply.
#[derive(Debug)]
pub struct CachedFile {
    cache: Arc<PageCache>,
    handle: Option<Handle>,
    path: PathBuf,
}

impl CachedFile {
    /// Open `path` through `cache`.
    pub fn open(
        cache: &Arc<PageCache>,
        path: impl AsRef<Path>,
        mode: OpenMode,
        policy: CachePolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let handle = cache.open(&path, mode, policy)?;
        Ok(Self {
            cache: Arc::clone(cache),
            handle: Some(handle),
            path,
        })
    }

    fn handle(&self) -> Result<Handle> {
        self.handle
            .ok_or_else(|| FcError::Unavailable(format!("{} is closed", self.path.display())))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.handle.is_some_and(|handle| self.cache.is_open(handle))
    }

    /// Flush and close the backing handle; cached pages stay resident.
    pub fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle {
            self.cache.close(handle)?;
        }
        Ok(())
    }

    /// Close and drop every trace of the file from the cache.
    pub fn permanent_close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            self.cache.permanent_close(handle)?;
        }
        Ok(())
    }

    /// Queue a write-back of all dirty pages.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush(self.handle()?)
    }

    /// Seek to an absolute position and prefetch the default window.
    pub fn seek(&self, position: u64) -> Result<()> {
        let handle = self.handle()?;
        let position = i64::try_from(position)
            .map_err(|_| FcError::InvalidParameter("position overflow".to_owned()))?;
        self.cache.seek(handle, position, Whence::Set)?;
        self.cache.check_cache(handle, None)
    }

    /// Seek relative to the end of the file and prefetch.
    pub fn seek_end(&self, offset: i64) -> Result<()> {
        let handle = self.handle()?;
        self.cache.seek(handle, offset, Whence::End)?;
        self.cache.check_cache(handle, None)
    }

    pub fn position(&self) -> Result<u64> {
        self.cache.position(self.handle()?)
    }

    pub fn len(&self) -> Result<u64> {
        self.cache.get_len(self.handle()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn eof_reached(&self) -> Result<bool> {
        self.cache.eof_reached(self.handle()?)
    }

    /// Whether `path` exists on the backing store.
    #[must_use]
    pub fn file_exists(&self, path: impl AsRef<Path>) -> bool {
        self.cache.file_exists(path)
    }

    /// Read up to `buf.len()` bytes, staging pages chunk by chunk.
    ///
    /// Returns the bytes actually read; short counts mean end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handle()?;
        let mut filled = 0;
        for chunk in buf.chunks_mut(CHUNK_BYTES) {
            self.cache.check_cache(handle, Some(WINDOW_BYTES))?;
            let n = self.cache.read(handle, chunk)?;
            filled += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(filled)
    }

    /// Write the whole of `buf`, staging pages chunk by chunk.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let handle = self.handle()?;
        let mut written = 0;
        for chunk in buf.chunks(CHUNK_BYTES) {
            self.cache.check_cache(handle, Some(WINDOW_BYTES))?;
            let n = self.cache.write(handle, chunk)?;
            written += n;
            if n < chunk.len() {
                warn!(
                    event = "short_write",
                    path = %self.path.display(),
                    requested = buf.len(),
                    written
                );
                break;
            }
        }
        Ok(written)
    }

    fn get_exact<const N: usize>(&self) -> Result<[u8; N]> {
        let handle = self.handle()?;
        self.cache.check_cache(handle, Some(N as u64))?;
        let mut buf = [0_u8; N];
        let n = self.cache.read(handle, &mut buf)?;
        if n < N {
            return Err(FcError::Eof);
        }
        Ok(buf)
    }

    fn store_exact<const N: usize>(&self, bytes: [u8; N]) -> Result<()> {
        let handle = self.handle()?;
        self.cache.check_cache(handle, Some(N as u64))?;
        let n = self.cache.write(handle, &bytes)?;
        if n < N {
            return Err(FcError::CantWrite(format!(
                "wrote {n} of {N} bytes to {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&self) -> Result<u8> {
        Ok(u8::from_le_bytes(self.get_exact::<1>()?))
    }

    pub fn get_u16(&self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_exact::<2>()?))
    }

    pub fn get_u32(&self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_exact::<4>()?))
    }

    pub fn get_u64(&self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_exact::<8>()?))
    }

    pub fn get_f32(&self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.get_exact::<4>()?))
    }

    pub fn get_f64(&self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.get_exact::<8>()?))
    }

    pub fn store_u8(&self, value: u8) -> Result<()> {
        self.store_exact(value.to_le_bytes())
    }

    pub fn store_u16(&self, value: u16) -> Result<()> {
        self.store_exact(value.to_le_bytes())
    }

    pub fn store_u32(&self, value: u32) -> Result<()> {
        self.store_exact(value.to_le_bytes())
    }

    pub fn store_u64(&self, value: u64) -> Result<()> {
        self.store_exact(value.to_le_bytes())
    }

    pub fn store_f32(&self, value: f32) -> Result<()> {
        self.store_exact(value.to_le_bytes())
    }

    pub fn store_f64(&self, value: f64) -> Result<()> {
        self.store_exact(value.to_le_bytes())
    }

    /// Read bytes up to and excluding the next `\n` (or end of file).
    ///
    /// Returns `Err(Eof)` when the file is already exhausted. Invalid
    /// UTF-8 is replaced, not rejected.
    pub fn get_line(&self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            match self.get_u8() {
                Ok(b'\n') => break,
                Ok(byte) => bytes.push(byte),
                Err(FcError::Eof) if !bytes.is_empty() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `line` followed by `\n`.
    pub fn store_line(&self, line: &str) -> Result<()> {
        self.store_string(line)?;
        self.store_u8(b'\n')
    }

    /// Write a string's bytes without a terminator.
    pub fn store_string(&self, value: &str) -> Result<()> {
        let written = self.write(value.as_bytes())?;
        if written < value.len() {
            return Err(FcError::CantWrite(format!(
                "wrote {written} of {} bytes to {}",
                value.len(),
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Read one line and split it into delimiter-separated values.
    ///
    /// Double-quoted fields may contain the delimiter and escape quotes by
    /// doubling them.
    pub fn get_csv_line(&self, delim: char) -> Result<Vec<String>> {
        let line = self.get_line()?;
        let mut values = Vec::new();
        let mut field = String::new();
        let mut quoted = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if quoted {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        let _ = chars.next();
                        field.push('"');
                    } else {
                        quoted = false;
                    }
                } else {
                    field.push(c);
                }
            } else if c == '"' && field.is_empty() {
                quoted = true;
            } else if c == delim {
                values.push(std::mem::take(&mut field));
            } else {
                field.push(c);
            }
        }
        values.push(field);
        Ok(values)
    }

    /// Write `values` as one delimiter-separated line, quoting fields that
    /// need it.
    pub fn store_csv_line(&self, values: &[String], delim: char) -> Result<()> {
        let mut line = String::new();
        for (index, value) in values.iter().enumerate() {
            if index > 0 {
                line.push(delim);
            }
            if value.contains(delim) || value.contains('"') || value.contains('\n') {
                line.push('"');
                line.push_str(&value.replace('"', "\"\""));
                line.push('"');
            } else {
                line.push_str(value);
            }
        }
        self.store_line(&line)
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        if let Some(handle) = self.handle
            && let Err(err) = self.cache.close(handle)
        {
            warn!(
                event = "close_on_drop_failed",
                path = %self.path.display(),
                error = %err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> Arc<PageCache> {
        Arc::new(PageCache::new().expect("cache"))
    }

    #[test]
    fn typed_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = test_cache();
        let mut file = CachedFile::open(
            &cache,
            dir.path().join("typed"),
            OpenMode::WriteRead,
            CachePolicy::Keep,
        )
        .expect("open");

        file.store_u8(0xAB).expect("u8");
        file.store_u16(0xBEEF).expect("u16");
        file.store_u32(0xDEAD_BEEF).expect("u32");
        file.store_u64(0x0123_4567_89AB_CDEF).expect("u64");
        file.store_f32(1.5).expect("f32");
        file.store_f64(-2.25).expect("f64");

        file.seek(0).expect("rewind");
        assert_eq!(file.get_u8().expect("u8"), 0xAB);
        assert_eq!(file.get_u16().expect("u16"), 0xBEEF);
        assert_eq!(file.get_u32().expect("u32"), 0xDEAD_BEEF);
        assert_eq!(file.get_u64().expect("u64"), 0x0123_4567_89AB_CDEF);
        assert_eq!(file.get_f32().expect("f32"), 1.5);
        assert_eq!(file.get_f64().expect("f64"), -2.25);

        file.permanent_close().expect("cleanup");
    }

    #[test]
    fn typed_read_past_end_is_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short");
        std::fs::write(&path, [0x01, 0x02]).expect("fixture");
        let cache = test_cache();
        let file =
            CachedFile::open(&cache, &path, OpenMode::Read, CachePolicy::Lru).expect("open");

        assert_eq!(file.get_u16().expect("u16"), 0x0201);
        assert!(matches!(file.get_u32(), Err(FcError::Eof)));
    }

    #[test]
    fn lines_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = test_cache();
        let file = CachedFile::open(
            &cache,
            dir.path().join("lines"),
            OpenMode::WriteRead,
            CachePolicy::Fifo,
        )
        .expect("open");

        file.store_line("first line").expect("line 1");
        file.store_line("second line").expect("line 2");
        file.store_string("no newline").expect("trailer");

        file.seek(0).expect("rewind");
        assert_eq!(file.get_line().expect("line 1"), "first line");
        assert_eq!(file.get_line().expect("line 2"), "second line");
        assert_eq!(file.get_line().expect("trailer"), "no newline");
        assert!(matches!(file.get_line(), Err(FcError::Eof)));
    }

    #[test]
    fn csv_quoting_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = test_cache();
        let file = CachedFile::open(
            &cache,
            dir.path().join("csv"),
            OpenMode::WriteRead,
            CachePolicy::Keep,
        )
        .expect("open");

        let row = vec![
            "plain".to_owned(),
            "with,comma".to_owned(),
            "with \"quotes\"".to_owned(),
            String::new(),
        ];
        file.store_csv_line(&row, ',').expect("store csv");

        file.seek(0).expect("rewind");
        assert_eq!(file.get_csv_line(',').expect("get csv"), row);
    }

    #[test]
    fn bulk_transfer_crosses_many_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = test_cache();
        let file = CachedFile::open(
            &cache,
            dir.path().join("bulk"),
            OpenMode::WriteRead,
            CachePolicy::Fifo,
        )
        .expect("open");

        let payload: Vec<u8> = (0..40_000_u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write(&payload).expect("write"), payload.len());

        file.seek(0).expect("rewind");
        let mut readback = vec![0_u8; payload.len()];
        assert_eq!(file.read(&mut readback).expect("read"), payload.len());
        assert_eq!(readback, payload);

        // Short reads stop at end of file.
        file.seek(0).expect("rewind");
        let mut oversized = vec![0_u8; payload.len() + 1000];
        assert_eq!(file.read(&mut oversized).expect("read"), payload.len());
        assert!(oversized[payload.len()..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn close_keeps_the_file_reopenable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("revive");
        let cache = test_cache();
        let mut file =
            CachedFile::open(&cache, &path, OpenMode::WriteRead, CachePolicy::Keep)
                .expect("open");
        file.store_string("persisted").expect("write");
        file.close().expect("close");
        assert!(!file.is_open());
        assert_eq!(std::fs::read(&path).expect("backing"), b"persisted");

        let reopened =
            CachedFile::open(&cache, &path, OpenMode::Read, CachePolicy::Keep).expect("reopen");
        reopened.seek(0).expect("rewind");
        let mut buf = [0_u8; 9];
        assert_eq!(reopened.read(&mut buf).expect("read"), 9);
        assert_eq!(&buf, b"persisted");
    }
}
