//! The filesystem façade.
//!
//! Every operation takes the directory it works in as an explicit argument;
//! there is no working directory. Operations that touch several records are
//! not atomic: a failure (or crash) between two writes leaves the earlier
//! ones in place and nothing is rolled back. Writes are ordered so that an
//! interrupted mutation leaves an extra record or reference rather than a
//! dangling one: blocs before the inode that lists them, the new directory
//! entry before the old one is removed.

use bitflags::bitflags;
use log::{info, warn};
use serde::Serialize;

use crate::{
    split_content, Bloc, Device, Disk, DumpEntry, FileDevice, FileType, FsError, FsResult, Inode,
    InodeCount, LogEntry, Permissions, BLOC_SIZE, DELETED, FILENAME_SIZE, MAX_BLOCS, ROOT_ID,
};

bitflags! {
    /// How [`FileSystem::open`] treats the named entry. Read and write bits
    /// are recorded for callers but not enforced.
    pub struct OpenMode: u32 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        /// Create an empty regular file when the name is missing.
        const CREATE = 0b0100;
        /// Empty an existing regular file.
        const TRUNCATE = 0b1000;
        const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
    }
}

/// Owner stamped onto inodes this filesystem creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsOptions {
    pub user: String,
    pub group: String,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            user: "root".into(),
            group: "root".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub live_inodes: u32,
    pub tombstoned_inodes: u32,
    pub live_blocs: u32,
    pub tombstoned_blocs: u32,
    pub unknown_tags: u32,
    /// Bytes in the log, tombstones included.
    pub bytes: u64,
}

pub struct FileSystem<D: Device> {
    disk: Disk<D>,
    options: FsOptions,
}

impl FileSystem<FileDevice> {
    /// A filesystem stored in the host file at `path`.
    pub fn at(path: impl AsRef<std::path::Path>) -> Self {
        Self::new(FileDevice::new(path), FsOptions::default())
    }
}

fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty()
        || name.len() > FILENAME_SIZE
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

impl<D: Device> FileSystem<D> {
    pub fn new(device: D, options: FsOptions) -> Self {
        Self {
            disk: Disk::new(device),
            options,
        }
    }

    pub fn disk(&self) -> &Disk<D> {
        &self.disk
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// Deletes the disk file.
    pub fn clean(&self) -> FsResult<()> {
        self.disk.clean()
    }

    /// Writes the root directory. Fails with `CollisionRetry` if the disk
    /// already has one.
    pub fn create_root(&self) -> FsResult<Inode> {
        let mut root = Inode::new(ROOT_ID, FileType::Directory, Permissions::ROOT, "root", None);
        let bloc = Bloc::new(ROOT_ID, b"")?;
        root.add_bloc(&bloc)?;

        self.disk.write_bloc(&bloc)?;
        self.disk.write_inode(&root)?;
        info!("created root directory");
        Ok(root)
    }

    pub fn root(&self) -> FsResult<Inode> {
        self.directory(ROOT_ID)
    }

    pub fn get_inode_by_id(&self, id: u32) -> FsResult<Inode> {
        self.disk.get_inode_by_id(id)
    }

    /// Creates an empty file or directory named `name` in `dir`.
    pub fn create_empty_file(&self, dir: &Inode, name: &str, kind: FileType) -> FsResult<Inode> {
        check_name(name)?;
        let dir = self.directory(dir.id)?;
        if self.find_child(&dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let permissions = match kind {
            FileType::RegularFile => Permissions::DEFAULT,
            FileType::Directory => Permissions::DIRECTORY,
        };
        let bloc = self.disk.new_bloc(b"")?;
        let mut inode = self.disk.new_inode(
            kind,
            permissions,
            &self.options.user,
            Some(&self.options.group),
        )?;
        inode.name = name.into();
        inode.add_bloc(&bloc)?;
        let dir_bloc = self.disk.link_child(&dir, &inode)?;

        self.disk.write_bloc(&bloc)?;
        self.disk.write_inode(&inode)?;
        self.disk.overwrite_bloc(&dir_bloc, dir_bloc.id)?;
        info!("created {:?} {} ({}) in {}", kind, name, inode.id, dir.id);
        Ok(inode)
    }

    pub fn create_file(&self, dir: &Inode, name: &str, content: &[u8]) -> FsResult<Inode> {
        if split_content(content, BLOC_SIZE).len() > MAX_BLOCS {
            return Err(FsError::CapacityExceeded);
        }
        let mut inode = self.create_empty_file(dir, name, FileType::RegularFile)?;
        if !content.is_empty() {
            self.write(&mut inode, content)?;
        }
        Ok(inode)
    }

    pub fn create_directory(&self, dir: &Inode, name: &str) -> FsResult<Inode> {
        self.create_empty_file(dir, name, FileType::Directory)
    }

    /// Resolves `name` in `dir`, creating or truncating it as `mode` asks.
    pub fn open(&self, dir: &Inode, name: &str, mode: OpenMode) -> FsResult<Inode> {
        match self.lookup(dir, name) {
            Ok(mut inode) => {
                if mode.contains(OpenMode::TRUNCATE) && inode.is_file() {
                    self.write(&mut inode, b"")?;
                }
                Ok(inode)
            }
            Err(FsError::NotFound) if mode.contains(OpenMode::CREATE) => {
                self.create_empty_file(dir, name, FileType::RegularFile)
            }
            Err(err) => Err(err),
        }
    }

    pub fn lookup(&self, dir: &Inode, name: &str) -> FsResult<Inode> {
        self.find_child(dir, name)?.ok_or(FsError::NotFound)
    }

    /// Walks a `/`-separated path from the root.
    pub fn resolve(&self, path: &str) -> FsResult<Inode> {
        let mut current = self.root()?;
        for name in path.split('/').filter(|name| !name.is_empty()) {
            current = self.lookup(&current, name)?;
        }
        Ok(current)
    }

    /// Copies up to `buf.len()` bytes of the file into `buf`.
    pub fn read(&self, inode: &Inode, buf: &mut [u8]) -> FsResult<usize> {
        let content = self.read_to_end(inode)?;
        let len = core::cmp::min(buf.len(), content.len());
        buf[..len].copy_from_slice(&content[..len]);
        Ok(len)
    }

    pub fn read_to_end(&self, inode: &Inode) -> FsResult<Vec<u8>> {
        let inode = self.disk.get_inode_by_id(inode.id)?;
        if !inode.is_file() {
            return Err(FsError::NotRegularFile);
        }
        self.disk.read_content(&inode)
    }

    /// Replaces the file's content, then persists the inode. `inode` is
    /// refreshed with what was written.
    pub fn write(&self, inode: &mut Inode, content: &[u8]) -> FsResult<()> {
        let mut current = self.disk.get_inode_by_id(inode.id)?;
        if !current.is_file() {
            return Err(FsError::NotRegularFile);
        }
        self.disk.update_content(&mut current, content)?;
        self.disk.overwrite_inode(&current, current.id)?;
        *inode = current;
        Ok(())
    }

    /// Removes the entry `name` of type `kind` from `dir`. A directory must
    /// be empty.
    pub fn remove_file(&self, dir: &Inode, name: &str, kind: FileType) -> FsResult<()> {
        let dir = self.directory(dir.id)?;
        let child = self
            .find_child(&dir, name)?
            .filter(|child| child.kind == kind)
            .ok_or(FsError::NotFound)?;
        if child.is_dir() && self.disk.child_count(&child)? != 0 {
            return Err(FsError::DirectoryNotEmpty);
        }
        self.detach(&dir, child)
    }

    pub fn remove_empty_directory(&self, dir: &Inode, name: &str) -> FsResult<()> {
        let dir = self.directory(dir.id)?;
        let child = self.find_child(&dir, name)?.ok_or(FsError::NotFound)?;
        if !child.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if self.disk.child_count(&child)? != 0 {
            return Err(FsError::DirectoryNotEmpty);
        }
        self.detach(&dir, child)
    }

    /// Moves `name` from `src_dir` to `dst_dir` under `new_name`. The name is
    /// stored on the inode, so every hard link of a file sees the rename.
    pub fn move_entry(
        &self,
        src_dir: &Inode,
        name: &str,
        dst_dir: &Inode,
        new_name: &str,
    ) -> FsResult<Inode> {
        check_name(new_name)?;
        let src = self.directory(src_dir.id)?;
        let dst = self.directory(dst_dir.id)?;
        let mut child = self.find_child(&src, name)?.ok_or(FsError::NotFound)?;

        if let Some(existing) = self.find_child(&dst, new_name)? {
            if src.id == dst.id && existing.id == child.id {
                return Ok(child);
            }
            return Err(FsError::AlreadyExists);
        }
        if child.is_dir() && (child.id == dst.id || self.is_ancestor(&child, dst.id)?) {
            return Err(FsError::InvalidMove);
        }
        if child.links > 1 && child.name != new_name {
            // every directory linking the inode sees the new name
            for parent in self.parents_of(child.id)? {
                if parent.id == src.id && src.id != dst.id {
                    continue;
                }
                if self.find_child(&parent, new_name)?.is_some() {
                    warn!("{} already taken in directory {}", new_name, parent.id);
                    return Err(FsError::AlreadyExists);
                }
            }
        }

        if src.id != dst.id {
            let dst_bloc = self.disk.link_child(&dst, &child)?;
            self.disk.overwrite_bloc(&dst_bloc, dst_bloc.id)?;
            let src_bloc = self.disk.unlink_child(&src, child.id)?;
            self.disk.overwrite_bloc(&src_bloc, src_bloc.id)?;
        }
        if child.name != new_name {
            child.name = new_name.into();
            child.touch();
            self.disk.overwrite_inode(&child, child.id)?;
        }
        info!("moved {} ({}) from {} to {} as {}", name, child.id, src.id, dst.id, new_name);
        Ok(child)
    }

    /// Copies the regular file `name` into `dst_dir` as `new_name`.
    pub fn copy(
        &self,
        src_dir: &Inode,
        name: &str,
        dst_dir: &Inode,
        new_name: &str,
    ) -> FsResult<Inode> {
        let source = self.lookup(src_dir, name)?;
        if !source.is_file() {
            return Err(FsError::NotRegularFile);
        }
        let content = self.disk.read_content(&source)?;
        self.create_file(dst_dir, new_name, &content)
    }

    /// Adds an entry for the regular file `name` of `src_dir` to `dst_dir`.
    /// Both entries share one inode.
    pub fn link(&self, src_dir: &Inode, name: &str, dst_dir: &Inode) -> FsResult<Inode> {
        let dst = self.directory(dst_dir.id)?;
        let mut child = self.lookup(src_dir, name)?;
        if !child.is_file() {
            return Err(FsError::NotRegularFile);
        }
        if self.find_child(&dst, &child.name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let dst_bloc = self.disk.link_child(&dst, &child)?;
        child.links += 1;
        child.touch();
        self.disk.overwrite_inode(&child, child.id)?;
        self.disk.overwrite_bloc(&dst_bloc, dst_bloc.id)?;
        info!("linked {} ({}) into {}", name, child.id, dst.id);
        Ok(child)
    }

    /// Removes one entry of a regular file; the last one deletes it.
    pub fn unlink(&self, dir: &Inode, name: &str) -> FsResult<()> {
        let dir = self.directory(dir.id)?;
        let child = self.find_child(&dir, name)?.ok_or(FsError::NotFound)?;
        if !child.is_file() {
            return Err(FsError::NotRegularFile);
        }
        self.detach(&dir, child)
    }

    pub fn list_files(&self, dir: &Inode) -> FsResult<Vec<String>> {
        Ok(self
            .children(dir)?
            .into_iter()
            .map(|child| child.name)
            .collect())
    }

    /// Child inodes in the order they were linked.
    pub fn children(&self, dir: &Inode) -> FsResult<Vec<Inode>> {
        let ids = self.disk.children_ids(dir)?;
        self.disk.inodes_by_ids(&ids)
    }

    pub fn child_count(&self, dir: &Inode) -> FsResult<usize> {
        self.disk.child_count(dir)
    }

    pub fn inode_blocs(&self, inode: &Inode) -> FsResult<Vec<Bloc>> {
        self.disk.inode_blocs(inode)
    }

    pub fn inode_count(&self) -> FsResult<InodeCount> {
        self.disk.inode_count()
    }

    pub fn usage(&self) -> FsResult<DiskUsage> {
        let mut usage = DiskUsage {
            bytes: self.disk.log().len()?,
            ..DiskUsage::default()
        };
        for (_, entry) in self.disk.log().entries()? {
            match entry {
                LogEntry::Inode(inode) if inode.id != DELETED => usage.live_inodes += 1,
                LogEntry::Inode(_) => usage.tombstoned_inodes += 1,
                LogEntry::Bloc(bloc) if bloc.id != DELETED => usage.live_blocs += 1,
                LogEntry::Bloc(_) => usage.tombstoned_blocs += 1,
                LogEntry::Unknown { .. } => usage.unknown_tags += 1,
            }
        }
        Ok(usage)
    }

    pub fn dump(&self) -> FsResult<Vec<DumpEntry>> {
        self.disk.dump()
    }

    /// The dump as pretty-printed JSON.
    pub fn dump_json(&self) -> FsResult<String> {
        serde_json::to_string_pretty(&self.dump()?).map_err(|err| {
            warn!("cannot encode dump: {}", err);
            FsError::Encoding
        })
    }

    fn directory(&self, id: u32) -> FsResult<Inode> {
        let dir = self.disk.get_inode_by_id(id)?;
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok(dir)
    }

    fn find_child(&self, dir: &Inode, name: &str) -> FsResult<Option<Inode>> {
        Ok(self
            .children(dir)?
            .into_iter()
            .find(|child| child.name == name))
    }

    /// Live directories whose child list holds `id`.
    fn parents_of(&self, id: u32) -> FsResult<Vec<Inode>> {
        let mut parents = Vec::new();
        for (_, inode) in self.disk.log().records::<Inode>()? {
            if inode.id == DELETED || !inode.is_dir() {
                continue;
            }
            if self.disk.children_ids(&inode)?.contains(&id) {
                parents.push(inode);
            }
        }
        Ok(parents)
    }

    /// Whether `target` lies somewhere below `dir`.
    fn is_ancestor(&self, dir: &Inode, target: u32) -> FsResult<bool> {
        let mut pending = vec![dir.clone()];
        let mut seen = vec![dir.id];
        while let Some(current) = pending.pop() {
            for child in self.children(&current)? {
                if child.id == target {
                    return Ok(true);
                }
                if child.is_dir() && !seen.contains(&child.id) {
                    seen.push(child.id);
                    pending.push(child);
                }
            }
        }
        Ok(false)
    }

    /// Drops `child`'s entry from `dir` and releases one link. The last link
    /// tombstones the inode, then its blocs.
    fn detach(&self, dir: &Inode, mut child: Inode) -> FsResult<()> {
        let dir_bloc = self.disk.unlink_child(dir, child.id)?;
        self.disk.overwrite_bloc(&dir_bloc, dir_bloc.id)?;

        if child.links > 1 {
            child.links -= 1;
            child.touch();
            self.disk.overwrite_inode(&child, child.id)?;
            info!(
                "unlinked {} ({}) from {}, {} links left",
                child.name, child.id, dir.id, child.links
            );
            return Ok(());
        }

        self.disk.delete_inode(&child)?;
        for &id in child.bloc_ids() {
            match self.disk.delete_bloc_id(id) {
                Ok(()) => {}
                Err(FsError::NotFound) => warn!("bloc {} of inode {} already gone", id, child.id),
                Err(err) => return Err(err),
            }
        }
        info!("removed {} ({}) from {}", child.name, child.id, dir.id);
        Ok(())
    }
}
