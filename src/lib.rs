//! A hierarchical filesystem emulated on one flat, append-only disk file.
//!
//! The disk is a log of tagged fixed-size records: inodes describe files and
//! directories, blocs carry content. Records are found by linear scan and are
//! only ever appended, rewritten in place at the same size, or tombstoned by
//! setting their id to [`DELETED`]. Nothing is reclaimed.
//!
//! Layers, bottom up:
//! - [`Device`]: opens a fresh handle onto the backing storage per operation
//! - [`RecordLog`]: append / scan / rewrite-in-place of tagged records
//! - inode and bloc stores: methods on [`Disk`], including content chunking
//! - directory codec: child id lists encoded as text in a directory's first bloc
//! - [`FileSystem`]: the façade callers use

mod bloc;
mod device;
mod dir;
mod error;
mod fs;
mod inode;
mod record;


pub use bloc::{split_content, Bloc};
pub use device::{Access, Device, FileDevice, RamDevice};
pub use dir::{decode_children, encode_children, DELIMITER};
pub use error::{FsError, FsResult};
pub use fs::{DiskUsage, FileSystem, FsOptions, OpenMode};
pub use inode::{FileType, Inode, InodeCount, Permissions, TimeSpec};
pub use record::{Disk, DumpEntry, LogEntry, Record, RecordKind, RecordLog};

/// Id of a tombstoned record.
pub const DELETED: u32 = 0;
/// Id of the root inode and of the root directory's bloc.
pub const ROOT_ID: u32 = 1;

/// Default location of the disk file.
pub const DISK: &str = "rsc/disk";

/// Maximum number of blocs one inode can own.
pub const MAX_BLOCS: usize = 32;
/// Bytes reserved for a filename, NUL padded.
pub const FILENAME_SIZE: usize = 64;
/// Bytes reserved for a user or group name, NUL padded.
pub const USERNAME_SIZE: usize = 32;

#[cfg(feature = "bloc512")]
pub const BLOC_SIZE: usize = 512;

#[cfg(all(feature = "bloc4k", not(feature = "bloc512")))]
pub const BLOC_SIZE: usize = 4096;

#[cfg(not(any(feature = "bloc512", feature = "bloc4k")))]
pub const BLOC_SIZE: usize = 1024;

/// Reads a little-endian `u32` out of a 4-byte slice.
#[macro_export]
macro_rules! le_u32 {
    ($x:expr) => {{
        let mut raw = [0u8; 4];
        raw.copy_from_slice($x);
        u32::from_le_bytes(raw)
    }};
}

/// Reads a little-endian `u64` out of an 8-byte slice.
#[macro_export]
macro_rules! le_u64 {
    ($x:expr) => {{
        let mut raw = [0u8; 8];
        raw.copy_from_slice($x);
        u64::from_le_bytes(raw)
    }};
}

/// Copies `src` into a NUL padded fixed-size field, truncating if needed.
fn put_str(field: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let len = core::cmp::min(bytes.len(), field.len());
    field[..len].copy_from_slice(&bytes[..len]);
    field[len..].fill(0);
}

/// Reads a NUL padded fixed-size field back into a string.
fn get_str(field: &[u8]) -> String {
    let len = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..len]).into_owned()
}
