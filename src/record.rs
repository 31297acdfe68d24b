//! The record log: a flat sequence of `(tag, payload)` pairs.
//!
//! Format: `[tag: u32 LE] [payload: fixed size for that tag]`, repeated until
//! end of file. There is no length prefix and no end marker. Payload sizes
//! never change for a kind, which is what lets [`RecordLog::rewrite_at`]
//! update a record without touching its neighbours.

use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;

use log::{debug, warn};
use serde::Serialize;
use spin::Mutex;

use crate::{Access, Bloc, Device, FsError, FsResult, Inode, DELETED, ROOT_ID};

/// Bytes taken by the tag in front of every payload.
pub const TAG_SIZE: usize = 4;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    Inode = 1,
    Bloc = 2,
}

impl RecordKind {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::Inode),
            2 => Some(RecordKind::Bloc),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn payload_size(self) -> usize {
        match self {
            RecordKind::Inode => Inode::SIZE,
            RecordKind::Bloc => Bloc::SIZE,
        }
    }
}

/// A fixed-size payload that can live in the log.
pub trait Record: Sized + Clone {
    const KIND: RecordKind;
    /// Exact payload size; `encode` must always produce this many bytes.
    const SIZE: usize;

    fn id(&self) -> u32;
    fn set_id(&mut self, id: u32);
    fn encode(&self) -> Vec<u8>;
    fn decode(raw: &[u8]) -> FsResult<Self>;

    fn is_live(&self) -> bool {
        self.id() != DELETED
    }
}

/// Sequential reader over a payload, used by the `decode` impls.
pub(crate) struct Fields<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> FsResult<&'a [u8]> {
        let end = self.pos + len;
        let field = self.raw.get(self.pos..end).ok_or(FsError::CorruptRecord)?;
        self.pos = end;
        Ok(field)
    }

    pub(crate) fn u32(&mut self) -> FsResult<u32> {
        Ok(crate::le_u32!(self.take(4)?))
    }

    pub(crate) fn u64(&mut self) -> FsResult<u64> {
        Ok(crate::le_u64!(self.take(8)?))
    }
}

/// One slot of the log as seen by a full walk.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogEntry {
    Inode(Inode),
    Bloc(Bloc),
    /// A tag that is neither inode nor bloc. The walk skips the tag only.
    Unknown { tag: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpEntry {
    pub offset: u64,
    #[serde(flatten)]
    pub entry: LogEntry,
}

enum Slot<'a> {
    Payload(RecordKind, &'a [u8]),
    Unknown(u32),
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> FsResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

pub struct RecordLog<D: Device> {
    device: D,
}

impl<D: Device> RecordLog<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Appends the tag and payload at end of file and returns the offset of
    /// the tag.
    pub fn append<R: Record>(&self, record: &R) -> FsResult<u64> {
        let mut handle = self.device.open(Access::Append)?;
        let offset = handle.seek(SeekFrom::End(0))?;
        let payload = record.encode();
        debug_assert_eq!(payload.len(), R::SIZE);

        let mut raw = Vec::with_capacity(TAG_SIZE + R::SIZE);
        raw.extend_from_slice(&R::KIND.tag().to_le_bytes());
        raw.extend_from_slice(&payload);
        handle.write_all(&raw)?;
        handle.flush()?;

        debug!("append {:?} id={} at offset {}", R::KIND, record.id(), offset);
        Ok(offset)
    }

    /// Overwrites the payload of the record whose tag sits at `offset`. The
    /// tag must be `R`'s, so the written payload always has the old size.
    pub fn rewrite_at<R: Record>(&self, offset: u64, record: &R) -> FsResult<()> {
        let mut handle = self.device.open(Access::ReadWrite)?;
        handle.seek(SeekFrom::Start(offset))?;
        let mut tag = [0u8; TAG_SIZE];
        let read = read_full(&mut handle, &mut tag)?;
        if read != TAG_SIZE || u32::from_le_bytes(tag) != R::KIND.tag() {
            warn!("refusing to rewrite {:?} at offset {}: tag mismatch", R::KIND, offset);
            return Err(FsError::CorruptRecord);
        }

        let payload = record.encode();
        debug_assert_eq!(payload.len(), R::SIZE);
        handle.seek(SeekFrom::Start(offset + TAG_SIZE as u64))?;
        handle.write_all(&payload)?;
        handle.flush()?;

        debug!("rewrite {:?} id={} at offset {}", R::KIND, record.id(), offset);
        Ok(())
    }

    /// Returns the first record of kind `R` accepted by `predicate`, with its
    /// offset. An unopenable disk is reported and treated as empty.
    pub fn scan<R: Record>(
        &self,
        mut predicate: impl FnMut(&R) -> bool,
    ) -> FsResult<Option<(u64, R)>> {
        let mut found = None;
        let walked = self.walk(|offset, slot| {
            if let Slot::Payload(kind, raw) = slot {
                if kind == R::KIND {
                    match R::decode(raw) {
                        Ok(record) if predicate(&record) => {
                            found = Some((offset, record));
                            return ControlFlow::Break(());
                        }
                        Ok(_) => {}
                        Err(err) => warn!("skipping {:?} at offset {}: {}", kind, offset, err),
                    }
                }
            }
            ControlFlow::Continue(())
        });
        match walked {
            Ok(()) => Ok(found),
            Err(FsError::ResourceUnavailable) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Every record of kind `R`, live or tombstoned, in log order.
    pub fn records<R: Record>(&self) -> FsResult<Vec<(u64, R)>> {
        let mut records = Vec::new();
        let walked = self.walk(|offset, slot| {
            if let Slot::Payload(kind, raw) = slot {
                if kind == R::KIND {
                    match R::decode(raw) {
                        Ok(record) => records.push((offset, record)),
                        Err(err) => warn!("skipping {:?} at offset {}: {}", kind, offset, err),
                    }
                }
            }
            ControlFlow::Continue(())
        });
        match walked {
            Ok(()) | Err(FsError::ResourceUnavailable) => Ok(records),
            Err(err) => Err(err),
        }
    }

    /// Every slot of the log, including unknown tags.
    pub fn entries(&self) -> FsResult<Vec<(u64, LogEntry)>> {
        let mut entries = Vec::new();
        let walked = self.walk(|offset, slot| {
            let entry = match slot {
                Slot::Payload(RecordKind::Inode, raw) => Inode::decode(raw).map(LogEntry::Inode),
                Slot::Payload(RecordKind::Bloc, raw) => Bloc::decode(raw).map(LogEntry::Bloc),
                Slot::Unknown(tag) => Ok(LogEntry::Unknown { tag }),
            };
            match entry {
                Ok(entry) => entries.push((offset, entry)),
                Err(err) => warn!("undecodable record at offset {}: {}", offset, err),
            }
            ControlFlow::Continue(())
        });
        match walked {
            Ok(()) | Err(FsError::ResourceUnavailable) => Ok(entries),
            Err(err) => Err(err),
        }
    }

    /// Byte length of the log; zero when the disk does not exist.
    pub fn len(&self) -> FsResult<u64> {
        match self.device.open(Access::Read) {
            Ok(mut handle) => Ok(handle.seek(SeekFrom::End(0))?),
            Err(FsError::ResourceUnavailable) => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn walk(&self, mut visit: impl FnMut(u64, Slot<'_>) -> ControlFlow<()>) -> FsResult<()> {
        let handle = self.device.open(Access::Read)?;
        let mut reader = BufReader::new(handle);
        let mut payload = vec![0u8; core::cmp::max(Inode::SIZE, Bloc::SIZE)];
        let mut tag_raw = [0u8; TAG_SIZE];
        let mut offset = 0u64;

        loop {
            match read_full(&mut reader, &mut tag_raw)? {
                0 => break,
                TAG_SIZE => {}
                n => {
                    warn!("truncated tag ({} bytes) at offset {}", n, offset);
                    break;
                }
            }
            let tag = u32::from_le_bytes(tag_raw);
            let Some(kind) = RecordKind::from_tag(tag) else {
                warn!("unknown record tag {} at offset {}", tag, offset);
                if visit(offset, Slot::Unknown(tag)).is_break() {
                    break;
                }
                offset += TAG_SIZE as u64;
                continue;
            };

            let size = kind.payload_size();
            let n = read_full(&mut reader, &mut payload[..size])?;
            if n < size {
                warn!("truncated {:?} payload at offset {}", kind, offset);
                break;
            }
            if visit(offset, Slot::Payload(kind, &payload[..size])).is_break() {
                break;
            }
            offset += (TAG_SIZE + size) as u64;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct IdAllocator {
    seeded: bool,
    next_inode: u32,
    next_bloc: u32,
}

/// The record log plus id allocation. The inode and bloc stores are
/// implemented as methods on this type.
pub struct Disk<D: Device> {
    log: RecordLog<D>,
    ids: Mutex<IdAllocator>,
}

impl<D: Device> Disk<D> {
    pub fn new(device: D) -> Self {
        Self {
            log: RecordLog::new(device),
            ids: Mutex::new(IdAllocator::default()),
        }
    }

    pub fn log(&self) -> &RecordLog<D> {
        &self.log
    }

    /// Removes the disk file and forgets allocated ids.
    pub fn clean(&self) -> FsResult<()> {
        self.log.device().remove()?;
        *self.ids.lock() = IdAllocator::default();
        Ok(())
    }

    pub(crate) fn next_id(&self, kind: RecordKind) -> FsResult<u32> {
        let mut ids = self.ids.lock();
        if !ids.seeded {
            self.seed(&mut ids)?;
        }
        let next = match kind {
            RecordKind::Inode => &mut ids.next_inode,
            RecordKind::Bloc => &mut ids.next_bloc,
        };
        let id = *next;
        *next = id.checked_add(1).ok_or(FsError::CapacityExceeded)?;
        Ok(id)
    }

    fn seed(&self, ids: &mut IdAllocator) -> FsResult<()> {
        let mut max_inode = ROOT_ID;
        let mut max_bloc = ROOT_ID;
        for (_, entry) in self.log.entries()? {
            match entry {
                LogEntry::Inode(inode) => max_inode = max_inode.max(inode.id),
                LogEntry::Bloc(bloc) => max_bloc = max_bloc.max(bloc.id),
                LogEntry::Unknown { .. } => {}
            }
        }
        let exhausted = |max: u32| {
            warn!("id space exhausted: a record already uses id {}", max);
            FsError::CapacityExceeded
        };
        ids.next_inode = max_inode.checked_add(1).ok_or_else(|| exhausted(max_inode))?;
        ids.next_bloc = max_bloc.checked_add(1).ok_or_else(|| exhausted(max_bloc))?;
        ids.seeded = true;
        debug!(
            "id allocator seeded: next inode {}, next bloc {}",
            ids.next_inode, ids.next_bloc
        );
        Ok(())
    }

    /// Appends a record after checking no live record of its kind uses the
    /// same id.
    pub(crate) fn append_unique<R: Record>(&self, record: &R) -> FsResult<u64> {
        let id = record.id();
        if id != DELETED && self.log.scan::<R>(|other| other.id() == id)?.is_some() {
            warn!("{:?} id {} already live, not appending", R::KIND, id);
            return Err(FsError::CollisionRetry(id));
        }
        self.log.append(record)
    }

    /// Finds the live record of kind `R` with `target_id` and rewrites it
    /// with `record`.
    pub(crate) fn overwrite<R: Record>(&self, record: &R, target_id: u32) -> FsResult<()> {
        let (offset, _) = self.locate::<R>(target_id)?;
        self.log.rewrite_at(offset, record)
    }

    /// Tombstones the live record of kind `R` with `id`.
    pub(crate) fn tombstone<R: Record>(&self, id: u32) -> FsResult<()> {
        let (offset, mut record) = self.locate::<R>(id)?;
        record.set_id(DELETED);
        self.log.rewrite_at(offset, &record)?;
        debug!("tombstoned {:?} id={}", R::KIND, id);
        Ok(())
    }

    pub(crate) fn locate<R: Record>(&self, id: u32) -> FsResult<(u64, R)> {
        if id == DELETED {
            return Err(FsError::NotFound);
        }
        self.log
            .scan::<R>(|record| record.id() == id)?
            .ok_or(FsError::NotFound)
    }

    /// `(live, tombstoned)` records of kind `R`.
    pub(crate) fn tally<R: Record>(&self) -> FsResult<(u32, u32)> {
        let records = self.log.records::<R>()?;
        let live = records.iter().filter(|(_, r)| r.is_live()).count() as u32;
        Ok((live, records.len() as u32 - live))
    }

    /// Every record with its offset, for diagnostics.
    pub fn dump(&self) -> FsResult<Vec<DumpEntry>> {
        Ok(self
            .log
            .entries()?
            .into_iter()
            .map(|(offset, entry)| DumpEntry { offset, entry })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileType, Permissions, RamDevice};

    fn inode(id: u32) -> Inode {
        Inode::new(id, FileType::RegularFile, Permissions::DEFAULT, "paul", None)
    }

    #[test]
    fn scan_finds_first_match_and_offset() {
        let log = RecordLog::new(RamDevice::new());
        let first = log.append(&inode(7)).unwrap();
        let bloc_at = log.append(&Bloc::new(7, b"data").unwrap()).unwrap();
        let second = log.append(&inode(8)).unwrap();

        assert_eq!(first, 0);
        assert_eq!(bloc_at, (TAG_SIZE + Inode::SIZE) as u64);
        assert_eq!(second, (2 * TAG_SIZE + Inode::SIZE + Bloc::SIZE) as u64);

        let (offset, found) = log.scan::<Inode>(|i| i.id == 8).unwrap().unwrap();
        assert_eq!(offset, second);
        assert_eq!(found.id, 8);

        // same id space per kind: bloc 7 does not satisfy an inode scan
        let (offset, _) = log.scan::<Inode>(|i| i.id == 7).unwrap().unwrap();
        assert_eq!(offset, first);
        assert!(log.scan::<Bloc>(|b| b.id == 8).unwrap().is_none());
    }

    #[test]
    fn rewrite_in_place_keeps_length() {
        let log = RecordLog::new(RamDevice::new());
        log.append(&inode(3)).unwrap();
        let offset = log.append(&inode(4)).unwrap();
        log.append(&Bloc::new(9, b"tail").unwrap()).unwrap();
        let before = log.len().unwrap();

        let mut renamed = inode(4);
        renamed.name = "renamed".into();
        log.rewrite_at(offset, &renamed).unwrap();

        assert_eq!(log.len().unwrap(), before);
        let (_, found) = log.scan::<Inode>(|i| i.id == 4).unwrap().unwrap();
        assert_eq!(found.name, "renamed");
        let (_, tail) = log.scan::<Bloc>(|b| b.id == 9).unwrap().unwrap();
        assert_eq!(tail.content, b"tail");
    }

    #[test]
    fn rewrite_refuses_other_kind() {
        let log = RecordLog::new(RamDevice::new());
        let offset = log.append(&Bloc::new(2, b"").unwrap()).unwrap();
        assert_eq!(log.rewrite_at(offset, &inode(2)), Err(FsError::CorruptRecord));
    }

    #[test]
    fn missing_disk_reads_as_empty() {
        let log = RecordLog::new(RamDevice::new());
        assert!(log.scan::<Inode>(|_| true).unwrap().is_none());
        assert!(log.entries().unwrap().is_empty());
        assert_eq!(log.len().unwrap(), 0);
        assert_eq!(
            log.rewrite_at(0, &inode(1)),
            Err(FsError::ResourceUnavailable)
        );
    }

    #[test]
    fn unknown_tag_is_skipped() {
        let mut raw = 99u32.to_le_bytes().to_vec();
        raw.extend_from_slice(&RecordKind::Inode.tag().to_le_bytes());
        raw.extend_from_slice(&inode(5).encode());
        let log = RecordLog::new(RamDevice::from_bytes(raw));

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], (0, LogEntry::Unknown { tag: 99 })));
        assert!(matches!(&entries[1], (4, LogEntry::Inode(i)) if i.id == 5));
        assert!(log.scan::<Inode>(|i| i.id == 5).unwrap().is_some());
    }

    #[test]
    fn truncated_tail_stops_walk() {
        let mut raw = RecordKind::Bloc.tag().to_le_bytes().to_vec();
        raw.extend_from_slice(&Bloc::new(4, b"x").unwrap().encode());
        raw.extend_from_slice(&RecordKind::Inode.tag().to_le_bytes());
        raw.extend_from_slice(&[0u8; 10]);
        let log = RecordLog::new(RamDevice::from_bytes(raw));
        assert_eq!(log.entries().unwrap().len(), 1);
    }

    #[test]
    fn ids_continue_after_existing_records() {
        let disk = Disk::new(RamDevice::new());
        disk.log().append(&inode(41)).unwrap();
        disk.log().append(&Bloc::new(12, b"").unwrap()).unwrap();

        assert_eq!(disk.next_id(RecordKind::Inode).unwrap(), 42);
        assert_eq!(disk.next_id(RecordKind::Inode).unwrap(), 43);
        assert_eq!(disk.next_id(RecordKind::Bloc).unwrap(), 13);

        disk.clean().unwrap();
        assert_eq!(disk.next_id(RecordKind::Inode).unwrap(), ROOT_ID + 1);
    }

    #[test]
    fn max_id_on_disk_exhausts_allocator() {
        let disk = Disk::new(RamDevice::new());
        disk.log().append(&inode(u32::MAX)).unwrap();
        assert_eq!(disk.next_id(RecordKind::Inode), Err(FsError::CapacityExceeded));
        assert_eq!(disk.next_id(RecordKind::Bloc), Err(FsError::CapacityExceeded));
    }

    #[test]
    fn append_unique_rejects_live_duplicate() {
        let disk = Disk::new(RamDevice::new());
        disk.append_unique(&inode(6)).unwrap();
        assert_eq!(disk.append_unique(&inode(6)), Err(FsError::CollisionRetry(6)));

        disk.tombstone::<Inode>(6).unwrap();
        disk.append_unique(&inode(6)).unwrap();
        assert_eq!(disk.tally::<Inode>().unwrap(), (1, 1));
    }
}
