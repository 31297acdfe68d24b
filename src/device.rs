//! Backing storage for the record log.
//!
//! A [`Device`] hands out a fresh handle per operation; the record log drops
//! it before returning, so nothing stays open between calls.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use spin::Mutex;

use crate::{FsError, FsResult, DISK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read from the start.
    Read,
    /// Every write lands at the end; creates the disk if missing.
    Append,
    /// Read and overwrite in place; the disk must exist.
    ReadWrite,
}

pub trait Device {
    type Handle: Read + Write + Seek;

    /// Opens the disk. A disk that cannot be opened is
    /// [`FsError::ResourceUnavailable`].
    fn open(&self, access: Access) -> FsResult<Self::Handle>;

    /// Deletes the disk. Removing a missing disk is not an error.
    fn remove(&self) -> FsResult<()>;

    fn exists(&self) -> bool;
}

/// A disk stored in a host file.
#[derive(Debug, Clone)]
pub struct FileDevice {
    path: PathBuf,
}

impl FileDevice {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileDevice {
    fn default() -> Self {
        Self::new(DISK)
    }
}

impl Device for FileDevice {
    type Handle = std::fs::File;

    fn open(&self, access: Access) -> FsResult<Self::Handle> {
        let mut options = OpenOptions::new();
        match access {
            Access::Read => options.read(true),
            Access::Append => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                options.append(true).create(true)
            }
            Access::ReadWrite => options.read(true).write(true),
        };
        options.open(&self.path).map_err(|err| {
            warn!("cannot open disk {}: {}", self.path.display(), err);
            FsError::ResourceUnavailable
        })
    }

    fn remove(&self) -> FsResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("removed disk {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// An in-memory disk. Clones share the same buffer. `None` plays the part of
/// a disk file that does not exist yet.
#[derive(Debug, Clone, Default)]
pub struct RamDevice {
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl RamDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A disk pre-filled with raw log bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    /// Copy of the raw log, or `None` if the disk does not exist.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.data.lock().clone()
    }
}

impl Device for RamDevice {
    type Handle = RamHandle;

    fn open(&self, access: Access) -> FsResult<Self::Handle> {
        let mut data = self.data.lock();
        if data.is_none() {
            if access != Access::Append {
                warn!("cannot open ram disk: not created");
                return Err(FsError::ResourceUnavailable);
            }
            *data = Some(Vec::new());
        }
        Ok(RamHandle {
            data: self.data.clone(),
            pos: 0,
            append: access == Access::Append,
        })
    }

    fn remove(&self) -> FsResult<()> {
        *self.data.lock() = None;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.data.lock().is_some()
    }
}

pub struct RamHandle {
    data: Arc<Mutex<Option<Vec<u8>>>>,
    pos: u64,
    append: bool,
}

fn removed() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "ram disk removed")
}

impl Read for RamHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.data.lock();
        let data = guard.as_ref().ok_or_else(removed)?;
        let start = core::cmp::min(self.pos as usize, data.len());
        let len = core::cmp::min(buf.len(), data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        self.pos += len as u64;
        Ok(len)
    }
}

impl Write for RamHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.data.lock();
        let data = guard.as_mut().ok_or_else(removed)?;
        if self.append {
            self.pos = data.len() as u64;
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for RamHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().as_ref().map_or(0, |data| data.len()) as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => len + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of ram disk",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_device_starts_missing() {
        let dev = RamDevice::new();
        assert!(!dev.exists());
        assert_eq!(dev.open(Access::Read).err(), Some(FsError::ResourceUnavailable));
        assert_eq!(
            dev.open(Access::ReadWrite).err(),
            Some(FsError::ResourceUnavailable)
        );
    }

    #[test]
    fn ram_append_then_overwrite() {
        let dev = RamDevice::new();
        dev.open(Access::Append).unwrap().write_all(b"hello").unwrap();
        dev.open(Access::Append).unwrap().write_all(b" world").unwrap();

        let mut rw = dev.open(Access::ReadWrite).unwrap();
        rw.seek(SeekFrom::Start(6)).unwrap();
        rw.write_all(b"W").unwrap();
        drop(rw);

        let mut out = String::new();
        dev.open(Access::Read).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello World");

        dev.remove().unwrap();
        assert_eq!(dev.snapshot(), None);
    }

    #[test]
    fn file_device_missing_file_is_unavailable() {
        let path = std::env::temp_dir().join(format!("blocfs-missing-{}", std::process::id()));
        let dev = FileDevice::new(&path);
        dev.remove().unwrap();
        assert_eq!(dev.open(Access::Read).err(), Some(FsError::ResourceUnavailable));
        dev.open(Access::Append).unwrap().write_all(&[1, 2, 3]).unwrap();
        assert!(dev.exists());
        dev.remove().unwrap();
        assert!(!dev.exists());
    }
}
