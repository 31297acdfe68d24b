//! Inode records and the inode store.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use log::{debug, warn};
use serde::{Serialize, Serializer};

use crate::record::Fields;
use crate::{
    get_str, put_str, Bloc, Device, Disk, FsError, FsResult, Record, RecordKind, BLOC_SIZE,
    FILENAME_SIZE, MAX_BLOCS, USERNAME_SIZE,
};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    RegularFile = 1,
    Directory = 2,
}

impl FileType {
    fn from_raw(raw: u32) -> FsResult<Self> {
        match raw {
            1 => Ok(FileType::RegularFile),
            2 => Ok(FileType::Directory),
            _ => Err(FsError::CorruptRecord),
        }
    }
}

bitflags! {
    /// Mode bits. Stored, never enforced.
    pub struct Permissions: u32 {
        const S_IRUSR = 0o400;
        const S_IWUSR = 0o200;
        const S_IXUSR = 0o100;
        const S_IRWXU = 0o700;
        const S_IRGRP = 0o040;
        const S_IWGRP = 0o020;
        const S_IXGRP = 0o010;
        const S_IRWXG = 0o070;
        const S_IROTH = 0o004;
        const S_IWOTH = 0o002;
        const S_IXOTH = 0o001;
        const S_IRWXO = 0o007;

        /// rw-r--r--
        const DEFAULT = Self::S_IRUSR.bits | Self::S_IWUSR.bits | Self::S_IRGRP.bits | Self::S_IROTH.bits;
        /// rwxr-xr-x
        const DIRECTORY = Self::S_IRWXU.bits | Self::S_IRGRP.bits | Self::S_IXGRP.bits | Self::S_IROTH.bits | Self::S_IXOTH.bits;
        /// rwxr-xr-x, the root directory's mode
        const ROOT = Self::DIRECTORY.bits;
    }
}

fn serialize_permissions<S: Serializer>(perm: &Permissions, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:o}", perm.bits()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TimeSpec {
    pub sec: u64,
    pub nsec: u32,
}

impl TimeSpec {
    pub const SIZE: usize = 12;

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs(),
            nsec: elapsed.subsec_nanos(),
        }
    }

    fn encode_into(&self, raw: &mut Vec<u8>) {
        raw.extend_from_slice(&self.sec.to_le_bytes());
        raw.extend_from_slice(&self.nsec.to_le_bytes());
    }

    fn decode_from(fields: &mut Fields<'_>) -> FsResult<Self> {
        Ok(Self {
            sec: fields.u64()?,
            nsec: fields.u32()?,
        })
    }
}

/// A file or directory. The filename lives here and nowhere else; blocs only
/// carry content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inode {
    pub id: u32,
    pub kind: FileType,
    #[serde(serialize_with = "serialize_permissions")]
    pub permissions: Permissions,
    pub user: String,
    pub group: String,
    pub name: String,
    pub created_at: TimeSpec,
    pub updated_at: TimeSpec,
    /// Content length in bytes.
    pub size: u64,
    /// Number of directory entries referring to this inode.
    pub links: u32,
    bloc_ids: Vec<u32>,
}

impl Inode {
    /// A fresh, unpersisted inode with no blocs. `group` defaults to `user`.
    pub fn new(
        id: u32,
        kind: FileType,
        permissions: Permissions,
        user: &str,
        group: Option<&str>,
    ) -> Self {
        let now = TimeSpec::now();
        Self {
            id,
            kind,
            permissions,
            user: user.into(),
            group: group.unwrap_or(user).into(),
            name: String::new(),
            created_at: now,
            updated_at: now,
            size: 0,
            links: 1,
            bloc_ids: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileType::RegularFile
    }

    pub fn bloc_ids(&self) -> &[u32] {
        &self.bloc_ids
    }

    pub fn bloc_count(&self) -> usize {
        self.bloc_ids.len()
    }

    pub fn contains(&self, bloc_id: u32) -> bool {
        self.bloc_ids.contains(&bloc_id)
    }

    /// Links `bloc` at the end of the bloc list. Fails without touching the
    /// inode once [`MAX_BLOCS`] are linked.
    pub fn add_bloc(&mut self, bloc: &Bloc) -> FsResult<()> {
        if self.bloc_ids.len() == MAX_BLOCS {
            warn!("inode {} cannot hold more than {} blocs", self.id, MAX_BLOCS);
            return Err(FsError::CapacityExceeded);
        }
        self.bloc_ids.push(bloc.id);
        Ok(())
    }

    /// Unlinks a bloc id; returns whether it was linked.
    pub fn remove_bloc(&mut self, bloc_id: u32) -> bool {
        match self.bloc_ids.iter().position(|&id| id == bloc_id) {
            Some(index) => {
                self.bloc_ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = TimeSpec::now();
    }
}

impl Record for Inode {
    const KIND: RecordKind = RecordKind::Inode;
    const SIZE: usize = 4 * 3
        + USERNAME_SIZE * 2
        + FILENAME_SIZE
        + TimeSpec::SIZE * 2
        + 8
        + 4 * 2
        + 4 * MAX_BLOCS;

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(Self::SIZE);
        raw.extend_from_slice(&self.id.to_le_bytes());
        raw.extend_from_slice(&(self.kind as u32).to_le_bytes());
        raw.extend_from_slice(&self.permissions.bits().to_le_bytes());

        let mut user = [0u8; USERNAME_SIZE];
        put_str(&mut user, &self.user);
        raw.extend_from_slice(&user);
        let mut group = [0u8; USERNAME_SIZE];
        put_str(&mut group, &self.group);
        raw.extend_from_slice(&group);
        let mut name = [0u8; FILENAME_SIZE];
        put_str(&mut name, &self.name);
        raw.extend_from_slice(&name);

        self.created_at.encode_into(&mut raw);
        self.updated_at.encode_into(&mut raw);
        raw.extend_from_slice(&self.size.to_le_bytes());
        raw.extend_from_slice(&self.links.to_le_bytes());
        raw.extend_from_slice(&(self.bloc_ids.len() as u32).to_le_bytes());
        for slot in 0..MAX_BLOCS {
            let id = self.bloc_ids.get(slot).copied().unwrap_or(0);
            raw.extend_from_slice(&id.to_le_bytes());
        }
        raw
    }

    fn decode(raw: &[u8]) -> FsResult<Self> {
        let mut fields = Fields::new(raw);
        let id = fields.u32()?;
        let kind = FileType::from_raw(fields.u32()?)?;
        let permissions = Permissions::from_bits_truncate(fields.u32()?);
        let user = get_str(fields.take(USERNAME_SIZE)?);
        let group = get_str(fields.take(USERNAME_SIZE)?);
        let name = get_str(fields.take(FILENAME_SIZE)?);
        let created_at = TimeSpec::decode_from(&mut fields)?;
        let updated_at = TimeSpec::decode_from(&mut fields)?;
        let size = fields.u64()?;
        if size > (MAX_BLOCS * BLOC_SIZE) as u64 {
            return Err(FsError::CorruptRecord);
        }
        let links = fields.u32()?;
        let bloc_count = fields.u32()? as usize;
        if bloc_count > MAX_BLOCS {
            return Err(FsError::CorruptRecord);
        }
        let mut bloc_ids = Vec::with_capacity(bloc_count);
        for slot in 0..MAX_BLOCS {
            let id = fields.u32()?;
            if slot < bloc_count {
                bloc_ids.push(id);
            }
        }
        Ok(Self {
            id,
            kind,
            permissions,
            user,
            group,
            name,
            created_at,
            updated_at,
            size,
            links,
            bloc_ids,
        })
    }
}

/// Live and tombstoned inode records on the disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InodeCount {
    pub live: u32,
    pub tombstoned: u32,
}

impl<D: Device> Disk<D> {
    /// Allocates an id and stamps the current time; nothing is written.
    pub fn new_inode(
        &self,
        kind: FileType,
        permissions: Permissions,
        user: &str,
        group: Option<&str>,
    ) -> FsResult<Inode> {
        let id = self.next_id(RecordKind::Inode)?;
        Ok(Inode::new(id, kind, permissions, user, group))
    }

    pub fn write_inode(&self, inode: &Inode) -> FsResult<()> {
        self.append_unique(inode)?;
        Ok(())
    }

    /// Rewrites the live inode `target_id` with `inode`.
    pub fn overwrite_inode(&self, inode: &Inode, target_id: u32) -> FsResult<()> {
        self.overwrite(inode, target_id)
    }

    /// Tombstones the inode. A second delete of the same id is `NotFound`.
    pub fn delete_inode(&self, inode: &Inode) -> FsResult<()> {
        let mut dead = inode.clone();
        dead.id = crate::DELETED;
        self.overwrite_inode(&dead, inode.id)?;
        debug!("deleted inode {}", inode.id);
        Ok(())
    }

    pub fn get_inode_by_id(&self, id: u32) -> FsResult<Inode> {
        self.locate::<Inode>(id).map(|(_, inode)| inode)
    }

    /// Live inodes for `ids`, in the order given, found in one pass. Ids with
    /// no live inode are skipped.
    pub fn inodes_by_ids(&self, ids: &[u32]) -> FsResult<Vec<Inode>> {
        let mut live: HashMap<u32, Inode> = self
            .log()
            .records::<Inode>()?
            .into_iter()
            .filter(|(_, inode)| inode.is_live() && ids.contains(&inode.id))
            .map(|(_, inode)| (inode.id, inode))
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let inode = live.remove(id);
                if inode.is_none() {
                    warn!("no live inode {}", id);
                }
                inode
            })
            .collect())
    }

    /// Full scan tallying live and tombstoned inodes.
    pub fn inode_count(&self) -> FsResult<InodeCount> {
        let (live, tombstoned) = self.tally::<Inode>()?;
        Ok(InodeCount { live, tombstoned })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RamDevice, DELETED};

    fn disk() -> Disk<RamDevice> {
        Disk::new(RamDevice::new())
    }

    #[test]
    fn encode_is_fixed_size() {
        let mut inode = Inode::new(3, FileType::Directory, Permissions::ROOT, "root", None);
        assert_eq!(inode.encode().len(), Inode::SIZE);
        inode.name = "x".repeat(FILENAME_SIZE * 2);
        for id in 0..MAX_BLOCS as u32 {
            inode.add_bloc(&Bloc::new(id + 10, b"").unwrap()).unwrap();
        }
        assert_eq!(inode.encode().len(), Inode::SIZE);
    }

    #[test]
    fn decode_restores_fields() {
        let mut inode =
            Inode::new(9, FileType::RegularFile, Permissions::DEFAULT, "paul", Some("staff"));
        inode.name = "hello_world.c".into();
        inode.size = 77;
        inode.add_bloc(&Bloc::new(21, b"").unwrap()).unwrap();
        inode.add_bloc(&Bloc::new(22, b"").unwrap()).unwrap();

        let back = Inode::decode(&inode.encode()).unwrap();
        assert_eq!(back, inode);
        assert_eq!(back.group, "staff");
        assert_eq!(back.bloc_ids(), &[21, 22]);
    }

    #[test]
    fn decode_rejects_impossible_size() {
        let mut inode = Inode::new(9, FileType::RegularFile, Permissions::DEFAULT, "paul", None);
        inode.size = (MAX_BLOCS * BLOC_SIZE) as u64;
        assert!(Inode::decode(&inode.encode()).is_ok());
        inode.size += 1;
        assert_eq!(Inode::decode(&inode.encode()), Err(FsError::CorruptRecord));
        inode.size = u64::MAX;
        assert_eq!(Inode::decode(&inode.encode()), Err(FsError::CorruptRecord));
    }

    #[test]
    fn group_defaults_to_user() {
        let inode = Inode::new(2, FileType::RegularFile, Permissions::S_IRWXU, "paul", None);
        assert_eq!(inode.group, "paul");
        assert_eq!(inode.created_at, inode.updated_at);
        assert_eq!(inode.bloc_count(), 0);
    }

    #[test]
    fn add_bloc_stops_at_capacity() {
        let mut inode = Inode::new(2, FileType::RegularFile, Permissions::DEFAULT, "paul", None);
        for id in 0..MAX_BLOCS as u32 {
            inode.add_bloc(&Bloc::new(id + 100, b"").unwrap()).unwrap();
        }
        let extra = Bloc::new(999, b"").unwrap();
        assert_eq!(inode.add_bloc(&extra), Err(FsError::CapacityExceeded));
        assert_eq!(inode.bloc_count(), MAX_BLOCS);
        assert!(!inode.contains(999));
    }

    #[test]
    fn count_write_delete() {
        let disk = disk();
        let inode = disk
            .new_inode(FileType::RegularFile, Permissions::S_IRWXU, "paul", None)
            .unwrap();
        disk.write_inode(&inode).unwrap();
        assert_eq!(disk.inode_count().unwrap(), InodeCount { live: 1, tombstoned: 0 });

        disk.delete_inode(&inode).unwrap();
        assert_eq!(disk.inode_count().unwrap(), InodeCount { live: 0, tombstoned: 1 });

        assert_eq!(disk.delete_inode(&inode), Err(FsError::NotFound));
        assert_eq!(disk.inode_count().unwrap(), InodeCount { live: 0, tombstoned: 1 });
        assert_eq!(disk.get_inode_by_id(inode.id), Err(FsError::NotFound));
    }

    #[test]
    fn overwrite_updates_metadata() {
        let disk = disk();
        let mut inode = disk
            .new_inode(FileType::RegularFile, Permissions::S_IRWXU, "paul", None)
            .unwrap();
        disk.write_inode(&inode).unwrap();

        inode.user = "hello_world.cpp".into();
        inode.group = "hello_wezfz".into();
        disk.overwrite_inode(&inode, inode.id).unwrap();

        let back = disk.get_inode_by_id(inode.id).unwrap();
        assert_eq!(back.user, "hello_world.cpp");
        assert_eq!(back.group, "hello_wezfz");
        assert_eq!(disk.overwrite_inode(&inode, 4242), Err(FsError::NotFound));
        assert_eq!(disk.overwrite_inode(&inode, DELETED), Err(FsError::NotFound));
    }

    #[test]
    fn write_rejects_duplicate_live_id() {
        let disk = disk();
        let inode = disk
            .new_inode(FileType::RegularFile, Permissions::DEFAULT, "paul", None)
            .unwrap();
        disk.write_inode(&inode).unwrap();
        assert_eq!(disk.write_inode(&inode), Err(FsError::CollisionRetry(inode.id)));
        assert_eq!(disk.inode_count().unwrap().live, 1);
    }

    #[test]
    fn inodes_by_ids_keeps_order_and_skips_dead() {
        let disk = disk();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let inode = disk
                .new_inode(FileType::RegularFile, Permissions::DEFAULT, "paul", None)
                .unwrap();
            disk.write_inode(&inode).unwrap();
            ids.push(inode.id);
        }
        let dead = disk.get_inode_by_id(ids[1]).unwrap();
        disk.delete_inode(&dead).unwrap();

        let wanted = [ids[2], ids[1], ids[0]];
        let found: Vec<u32> = disk
            .inodes_by_ids(&wanted)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(found, vec![ids[2], ids[0]]);
    }
}
