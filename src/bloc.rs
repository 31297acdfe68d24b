//! Content blocs, the bloc store, and the chunking policy that spreads a
//! file's bytes over as many blocs as it needs.

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Serialize, Serializer};

use crate::record::Fields;
use crate::{Device, Disk, FsError, FsResult, Inode, Record, RecordKind, BLOC_SIZE, MAX_BLOCS};

fn serialize_content<S: Serializer>(content: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(content))
}

/// One fixed-capacity chunk of a file, or a directory's child list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bloc {
    pub id: u32,
    /// Set on the chunk that ends a file.
    pub last_bloc: bool,
    #[serde(serialize_with = "serialize_content")]
    pub content: Vec<u8>,
}

impl Bloc {
    /// Content longer than [`BLOC_SIZE`] is refused; splitting is the
    /// chunking policy's job.
    pub fn new(id: u32, content: &[u8]) -> FsResult<Self> {
        if content.len() > BLOC_SIZE {
            return Err(FsError::CapacityExceeded);
        }
        Ok(Self {
            id,
            last_bloc: true,
            content: content.to_vec(),
        })
    }
}

impl Record for Bloc {
    const KIND: RecordKind = RecordKind::Bloc;
    const SIZE: usize = 4 * 3 + BLOC_SIZE;

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(Self::SIZE);
        raw.extend_from_slice(&self.id.to_le_bytes());
        raw.extend_from_slice(&u32::from(self.last_bloc).to_le_bytes());
        let len = core::cmp::min(self.content.len(), BLOC_SIZE);
        raw.extend_from_slice(&(len as u32).to_le_bytes());
        raw.extend_from_slice(&self.content[..len]);
        raw.resize(Self::SIZE, 0);
        raw
    }

    fn decode(raw: &[u8]) -> FsResult<Self> {
        let mut fields = Fields::new(raw);
        let id = fields.u32()?;
        let last_bloc = fields.u32()? != 0;
        let len = fields.u32()? as usize;
        if len > BLOC_SIZE {
            return Err(FsError::CorruptRecord);
        }
        let content = fields.take(BLOC_SIZE)?[..len].to_vec();
        Ok(Self {
            id,
            last_bloc,
            content,
        })
    }
}

/// Cuts `content` into `size`-byte pieces. Empty content still yields one
/// empty piece, so a file always has a terminating bloc.
pub fn split_content(content: &[u8], size: usize) -> Vec<&[u8]> {
    if content.is_empty() {
        return vec![content];
    }
    content.chunks(size).collect()
}

fn check_capacity(bloc: &Bloc) -> FsResult<()> {
    if bloc.content.len() > BLOC_SIZE {
        warn!("bloc {} holds {} bytes, capacity is {}", bloc.id, bloc.content.len(), BLOC_SIZE);
        return Err(FsError::CapacityExceeded);
    }
    Ok(())
}

impl<D: Device> Disk<D> {
    /// Allocates an id for a bloc holding `content`; nothing is written.
    pub fn new_bloc(&self, content: &[u8]) -> FsResult<Bloc> {
        if content.len() > BLOC_SIZE {
            return Err(FsError::CapacityExceeded);
        }
        let id = self.next_id(RecordKind::Bloc)?;
        Bloc::new(id, content)
    }

    /// Content longer than [`BLOC_SIZE`] is refused rather than truncated.
    pub fn write_bloc(&self, bloc: &Bloc) -> FsResult<()> {
        check_capacity(bloc)?;
        self.append_unique(bloc)?;
        Ok(())
    }

    pub fn overwrite_bloc(&self, bloc: &Bloc, target_id: u32) -> FsResult<()> {
        check_capacity(bloc)?;
        self.overwrite(bloc, target_id)
    }

    /// Tombstones the bloc. A second delete of the same id is `NotFound`.
    pub fn delete_bloc(&self, bloc: &Bloc) -> FsResult<()> {
        let mut dead = bloc.clone();
        dead.id = crate::DELETED;
        self.overwrite_bloc(&dead, bloc.id)
    }

    pub(crate) fn delete_bloc_id(&self, id: u32) -> FsResult<()> {
        self.tombstone::<Bloc>(id)
    }

    pub fn get_bloc_by_id(&self, id: u32) -> FsResult<Bloc> {
        self.locate::<Bloc>(id).map(|(_, bloc)| bloc)
    }

    /// The inode's blocs in `bloc_ids` order, collected in one pass.
    pub fn inode_blocs(&self, inode: &Inode) -> FsResult<Vec<Bloc>> {
        let wanted = inode.bloc_ids();
        let mut live: HashMap<u32, Bloc> = self
            .log()
            .records::<Bloc>()?
            .into_iter()
            .filter(|(_, bloc)| bloc.is_live() && wanted.contains(&bloc.id))
            .map(|(_, bloc)| (bloc.id, bloc))
            .collect();
        wanted
            .iter()
            .map(|id| {
                live.remove(id).ok_or_else(|| {
                    warn!("inode {} references missing bloc {}", inode.id, id);
                    FsError::NotFound
                })
            })
            .collect()
    }

    /// Concatenates the inode's blocs up to the terminating one.
    pub fn read_content(&self, inode: &Inode) -> FsResult<Vec<u8>> {
        let blocs = self.inode_blocs(inode)?;
        let mut content = Vec::with_capacity(blocs.len() * BLOC_SIZE);
        for (index, bloc) in blocs.iter().enumerate() {
            content.extend_from_slice(&bloc.content);
            if bloc.last_bloc {
                if index + 1 != blocs.len() {
                    warn!(
                        "inode {}: bloc {} ends the file before the bloc list does",
                        inode.id, bloc.id
                    );
                }
                break;
            }
        }
        if content.len() as u64 != inode.size {
            warn!(
                "inode {}: read {} bytes, inode records {}",
                inode.id,
                content.len(),
                inode.size
            );
        }
        Ok(content)
    }

    /// Replaces the inode's content with `content`.
    ///
    /// Existing blocs are overwritten chunk by chunk, missing ones appended
    /// and linked, surplus ones tombstoned and unlinked. Only the final chunk
    /// has `last_bloc` set. The inode is updated in memory; persisting it is
    /// the caller's job. Content needing more than [`MAX_BLOCS`] chunks fails
    /// before anything is written.
    pub fn update_content(&self, inode: &mut Inode, content: &[u8]) -> FsResult<()> {
        let chunks = split_content(content, BLOC_SIZE);
        if chunks.len() > MAX_BLOCS {
            warn!(
                "inode {}: {} bytes need {} blocs, limit is {}",
                inode.id,
                content.len(),
                chunks.len(),
                MAX_BLOCS
            );
            return Err(FsError::CapacityExceeded);
        }

        let owned = inode.bloc_ids().to_vec();
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.iter().enumerate() {
            match owned.get(index) {
                Some(&id) => {
                    let mut bloc = Bloc::new(id, chunk)?;
                    bloc.last_bloc = index == last;
                    self.overwrite_bloc(&bloc, id)?;
                }
                None => {
                    let mut bloc = self.new_bloc(chunk)?;
                    bloc.last_bloc = index == last;
                    self.write_bloc(&bloc)?;
                    inode.add_bloc(&bloc)?;
                }
            }
        }
        for &id in owned.iter().skip(chunks.len()) {
            self.delete_bloc_id(id)?;
            inode.remove_bloc(id);
        }

        debug!(
            "inode {}: {} bytes over {} blocs (had {})",
            inode.id,
            content.len(),
            chunks.len(),
            owned.len()
        );
        inode.size = content.len() as u64;
        inode.touch();
        Ok(())
    }
}
