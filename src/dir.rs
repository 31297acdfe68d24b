//! Directory codec.
//!
//! A directory owns exactly one bloc, and that bloc's content is the list of
//! its children's inode ids as decimal text, each followed by [`DELIMITER`]:
//! `"12,7,30,"`. The tree only exists through these lists. The functions here
//! compute the updated directory bloc; writing it back is the caller's job.

use log::{debug, warn};

use crate::{Bloc, Device, Disk, FsError, FsResult, Inode, BLOC_SIZE};

pub const DELIMITER: char = ',';

pub fn encode_children(ids: &[u32]) -> String {
    ids.iter().map(|id| format!("{}{}", id, DELIMITER)).collect()
}

/// Empty tokens (the trailing one included) are ignored; anything else that
/// is not a decimal id makes the list corrupt.
pub fn decode_children(text: &str) -> FsResult<Vec<u32>> {
    text.split(DELIMITER)
        .filter(|token| !token.is_empty())
        .map(|token| token.parse::<u32>().map_err(|_| FsError::CorruptRecord))
        .collect()
}

impl<D: Device> Disk<D> {
    /// The bloc holding `dir`'s child list.
    pub fn directory_bloc(&self, dir: &Inode) -> FsResult<Bloc> {
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let id = dir.bloc_ids().first().copied().ok_or_else(|| {
            warn!("directory {} owns no bloc", dir.id);
            FsError::CorruptRecord
        })?;
        self.get_bloc_by_id(id)
    }

    pub fn children_ids(&self, dir: &Inode) -> FsResult<Vec<u32>> {
        self.decode_bloc(&self.directory_bloc(dir)?)
    }

    pub fn child_count(&self, dir: &Inode) -> FsResult<usize> {
        Ok(self.children_ids(dir)?.len())
    }

    /// Appends `child` to `dir`'s list and returns the updated bloc.
    pub fn link_child(&self, dir: &Inode, child: &Inode) -> FsResult<Bloc> {
        let mut bloc = self.directory_bloc(dir)?;
        let mut ids = self.decode_bloc(&bloc)?;
        if ids.contains(&child.id) {
            return Err(FsError::AlreadyExists);
        }
        ids.push(child.id);
        let text = encode_children(&ids);
        if text.len() > BLOC_SIZE {
            warn!("directory {} is full ({} entries)", dir.id, ids.len() - 1);
            return Err(FsError::CapacityExceeded);
        }
        debug!("directory {}: link {}", dir.id, child.id);
        bloc.content = text.into_bytes();
        Ok(bloc)
    }

    /// Removes `child_id` from `dir`'s list and returns the updated bloc.
    pub fn unlink_child(&self, dir: &Inode, child_id: u32) -> FsResult<Bloc> {
        let mut bloc = self.directory_bloc(dir)?;
        let mut ids = self.decode_bloc(&bloc)?;
        let index = ids
            .iter()
            .position(|&id| id == child_id)
            .ok_or(FsError::NotFound)?;
        ids.remove(index);
        debug!("directory {}: unlink {}", dir.id, child_id);
        bloc.content = encode_children(&ids).into_bytes();
        Ok(bloc)
    }

    fn decode_bloc(&self, bloc: &Bloc) -> FsResult<Vec<u32>> {
        let text = core::str::from_utf8(&bloc.content).map_err(|_| FsError::CorruptRecord)?;
        decode_children(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileType, Permissions, RamDevice};

    #[test]
    fn trailing_delimiter_encoding() {
        assert_eq!(encode_children(&[]), "");
        assert_eq!(encode_children(&[12, 7, 30]), "12,7,30,");
        assert_eq!(decode_children("12,7,30,").unwrap(), vec![12, 7, 30]);
        assert_eq!(decode_children("").unwrap(), Vec::<u32>::new());
        assert_eq!(decode_children("4,,5").unwrap(), vec![4, 5]);
        assert_eq!(decode_children("4,x,"), Err(FsError::CorruptRecord));
    }

    fn directory(disk: &Disk<RamDevice>) -> Inode {
        let mut dir = disk
            .new_inode(FileType::Directory, Permissions::DIRECTORY, "paul", None)
            .unwrap();
        let bloc = disk.new_bloc(b"").unwrap();
        disk.write_bloc(&bloc).unwrap();
        dir.add_bloc(&bloc).unwrap();
        disk.write_inode(&dir).unwrap();
        dir
    }

    #[test]
    fn link_and_unlink() {
        let disk = Disk::new(RamDevice::new());
        let dir = directory(&disk);
        assert_eq!(disk.child_count(&dir).unwrap(), 0);

        let child = disk
            .new_inode(FileType::RegularFile, Permissions::DEFAULT, "paul", None)
            .unwrap();
        let bloc = disk.link_child(&dir, &child).unwrap();
        // nothing persisted until the caller writes the bloc back
        assert_eq!(disk.child_count(&dir).unwrap(), 0);
        disk.overwrite_bloc(&bloc, bloc.id).unwrap();
        assert_eq!(disk.children_ids(&dir).unwrap(), vec![child.id]);

        assert_eq!(disk.link_child(&dir, &child), Err(FsError::AlreadyExists));

        let bloc = disk.unlink_child(&dir, child.id).unwrap();
        disk.overwrite_bloc(&bloc, bloc.id).unwrap();
        assert_eq!(disk.child_count(&dir).unwrap(), 0);
        assert_eq!(disk.unlink_child(&dir, child.id), Err(FsError::NotFound));
    }

    #[test]
    fn regular_file_is_not_a_directory() {
        let disk = Disk::new(RamDevice::new());
        let file = Inode::new(5, FileType::RegularFile, Permissions::DEFAULT, "paul", None);
        assert_eq!(disk.child_count(&file), Err(FsError::NotDirectory));
    }

    #[test]
    fn full_directory_bloc() {
        let disk = Disk::new(RamDevice::new());
        let dir = directory(&disk);
        let mut bloc = disk.directory_bloc(&dir).unwrap();
        // ten-digit ids fill the bloc fastest
        let ids: Vec<u32> = (0..(BLOC_SIZE / 11) as u32).map(|i| 1_000_000_000 + i).collect();
        bloc.content = encode_children(&ids).into_bytes();
        disk.overwrite_bloc(&bloc, bloc.id).unwrap();

        let child =
            Inode::new(4_000_000_000, FileType::RegularFile, Permissions::DEFAULT, "paul", None);
        assert_eq!(disk.link_child(&dir, &child), Err(FsError::CapacityExceeded));
    }
}
