use crate::manager::{ALLOC_IGNORE_FREELIST, PageManager};
use crate::page::PageType;
use bytes::Bytes;
use common::{Address, CHUNK_SIZE, DbError, DbId, DbResult};
use hashbrown::HashMap;

/// Bytes occupied by the on-disk blob header.
pub const BLOB_HEADER_SIZE: usize = 28;

// {self_address: u64, alloc_size: u64, size: u64, flags: u32},
// little-endian. `alloc_size` is the full allocation including this
// header; the slack past `size` goes back to the freelist on free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlobHeader {
    self_address: Address,
    alloc_size: u64,
    size: u64,
    flags: u32,
}

impl BlobHeader {
    fn encode(&self) -> [u8; BLOB_HEADER_SIZE] {
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.self_address.to_le_bytes());
        buf[8..16].copy_from_slice(&self.alloc_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            self_address: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            alloc_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        }
    }
}

/// Stores variable-length records out-of-line.
///
/// On disk a blob is a header plus payload placed either in a freelist
/// run or at the start of freshly grown pages; the opaque blob id is
/// the header's file offset. The in-memory flavor keeps each blob in
/// its own buffer and hands out synthetic ids; it involves neither
/// pages nor the freelist.
pub enum BlobManager {
    Disk,
    InMemory {
        blobs: HashMap<u64, (usize, Vec<u8>)>,
        next_id: u64,
    },
}

impl BlobManager {
    pub fn new(in_memory: bool) -> Self {
        if in_memory {
            BlobManager::InMemory {
                blobs: HashMap::new(),
                next_id: 1,
            }
        } else {
            BlobManager::Disk
        }
    }

    /// Store `record`, returning its blob id.
    pub fn allocate(
        &mut self,
        pm: &mut PageManager,
        db: Option<DbId>,
        record: &[u8],
    ) -> DbResult<u64> {
        match self {
            BlobManager::InMemory { blobs, next_id } => {
                let id = *next_id;
                *next_id += 1;
                let alloc = round_up(BLOB_HEADER_SIZE + record.len(), CHUNK_SIZE);
                blobs.insert(id, (alloc, record.to_vec()));
                Ok(id)
            }
            BlobManager::Disk => {
                let need = round_up(BLOB_HEADER_SIZE + record.len(), CHUNK_SIZE);
                let address = match pm.alloc_area(need)? {
                    Some(address) => address,
                    None => Self::alloc_fresh_pages(pm, db, need)?,
                };
                let header = BlobHeader {
                    self_address: address,
                    alloc_size: need as u64,
                    size: record.len() as u64,
                    flags: 0,
                };
                let mut buf = Vec::with_capacity(BLOB_HEADER_SIZE + record.len());
                buf.extend_from_slice(&header.encode());
                buf.extend_from_slice(record);
                pm.write_bytes(db, address, &buf)?;
                Ok(address)
            }
        }
    }

    /// Read a blob's payload.
    pub fn read(
        &mut self,
        pm: &mut PageManager,
        db: Option<DbId>,
        blob_id: u64,
    ) -> DbResult<Bytes> {
        match self {
            BlobManager::InMemory { blobs, .. } => blobs
                .get(&blob_id)
                .map(|(_, data)| Bytes::from(data.clone()))
                .ok_or(DbError::KeyNotFound),
            BlobManager::Disk => {
                let header = Self::read_header(pm, db, blob_id)?;
                let payload = pm.read_bytes(db, blob_id + BLOB_HEADER_SIZE as u64,
                    header.size as usize)?;
                Ok(Bytes::from(payload))
            }
        }
    }

    /// Replace a blob's payload.
    ///
    /// Writes in place and returns the same id when the new payload
    /// fits the existing allocation; frees and reallocates otherwise,
    /// returning the new id.
    pub fn overwrite(
        &mut self,
        pm: &mut PageManager,
        db: Option<DbId>,
        blob_id: u64,
        record: &[u8],
    ) -> DbResult<u64> {
        let in_place = match self {
            BlobManager::InMemory { blobs, .. } => {
                let (alloc, _) = *blobs.get(&blob_id).ok_or(DbError::KeyNotFound)?;
                let fits = BLOB_HEADER_SIZE + record.len() <= alloc;
                if fits {
                    blobs.insert(blob_id, (alloc, record.to_vec()));
                }
                fits
            }
            BlobManager::Disk => {
                let mut header = Self::read_header(pm, db, blob_id)?;
                let fits = (BLOB_HEADER_SIZE + record.len()) as u64 <= header.alloc_size;
                if fits {
                    header.size = record.len() as u64;
                    let mut buf = Vec::with_capacity(BLOB_HEADER_SIZE + record.len());
                    buf.extend_from_slice(&header.encode());
                    buf.extend_from_slice(record);
                    pm.write_bytes(db, blob_id, &buf)?;
                }
                fits
            }
        };
        if in_place {
            return Ok(blob_id);
        }
        // allocate before freeing so the new id cannot land on the old
        // allocation and alias it
        let new_id = self.allocate(pm, db, record)?;
        self.free(pm, db, blob_id)?;
        Ok(new_id)
    }

    /// Release a blob's allocation back to the freelist.
    pub fn free(
        &mut self,
        pm: &mut PageManager,
        db: Option<DbId>,
        blob_id: u64,
    ) -> DbResult<()> {
        match self {
            BlobManager::InMemory { blobs, .. } => {
                blobs.remove(&blob_id).ok_or(DbError::KeyNotFound)?;
                Ok(())
            }
            BlobManager::Disk => {
                let header = Self::read_header(pm, db, blob_id)?;
                pm.free_area(blob_id, header.alloc_size as usize)
            }
        }
    }

    fn read_header(pm: &mut PageManager, db: Option<DbId>, blob_id: u64) -> DbResult<BlobHeader> {
        let buf = pm.read_bytes(db, blob_id, BLOB_HEADER_SIZE)?;
        let header = BlobHeader::decode(&buf);
        if header.self_address != blob_id {
            return Err(DbError::IntegrityViolated(format!(
                "blob header at {blob_id} claims address {}",
                header.self_address
            )));
        }
        if header.size + BLOB_HEADER_SIZE as u64 > header.alloc_size {
            return Err(DbError::IntegrityViolated(format!(
                "blob at {blob_id} overruns its allocation"
            )));
        }
        Ok(header)
    }

    // Grow the file by enough consecutive blob pages and return the
    // tail remainder of the last one to the freelist.
    fn alloc_fresh_pages(pm: &mut PageManager, db: Option<DbId>, need: usize) -> DbResult<Address> {
        let page_size = pm.page_size();
        let pages = need.div_ceil(page_size);
        let first = pm.alloc_page(db, PageType::Blob, ALLOC_IGNORE_FREELIST)?;
        for i in 1..pages {
            let addr = pm.alloc_page(db, PageType::Blob, ALLOC_IGNORE_FREELIST)?;
            debug_assert_eq!(addr, first + (i * page_size) as u64);
        }
        let total = pages * page_size;
        if total > need {
            pm.free_area(first + need as u64, total - need)?;
        }
        Ok(first)
    }
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}
