use common::{DbError, DbResult};

pub const ENV_MAGIC: [u8; 4] = *b"KVS1";
pub const ENV_VERSION: [u8; 4] = [2, 0, 0, 0];

/// Fixed part of the header page; the name table follows.
pub const ENV_HEADER_SIZE: usize = 40;
pub const DB_SLOT_SIZE: usize = 12;

/// One entry of the database name table. `name == 0` marks an empty
/// slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DbSlot {
    pub name: u32,
    pub dir_blob_id: u64,
}

/// Contents of page 0.
///
/// Layout: magic, version, page_size, max_databases, the page-map
/// blob id, the first freelist page, a crc32 over the fixed fields,
/// then `max_databases` name-table slots. All fields little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvHeader {
    pub page_size: u32,
    pub max_databases: u32,
    pub pagemap_blob_id: u64,
    pub first_freelist_page: u64,
    pub slots: Vec<DbSlot>,
}

impl EnvHeader {
    pub fn new(page_size: u32, max_databases: u32) -> Self {
        Self {
            page_size,
            max_databases,
            pagemap_blob_id: 0,
            first_freelist_page: 0,
            slots: vec![DbSlot::default(); max_databases as usize],
        }
    }

    /// Bytes needed by the header and name table together; must fit in
    /// one page.
    pub fn byte_len(max_databases: usize) -> usize {
        ENV_HEADER_SIZE + max_databases * DB_SLOT_SIZE
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&ENV_MAGIC);
        buf[4..8].copy_from_slice(&ENV_VERSION);
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.max_databases.to_le_bytes());
        buf[16..24].copy_from_slice(&self.pagemap_blob_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.first_freelist_page.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..32]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        buf[36..40].fill(0);
        for (i, slot) in self.slots.iter().enumerate() {
            let at = ENV_HEADER_SIZE + i * DB_SLOT_SIZE;
            buf[at..at + 4].copy_from_slice(&slot.name.to_le_bytes());
            buf[at + 4..at + 12].copy_from_slice(&slot.dir_blob_id.to_le_bytes());
        }
    }

    /// Decode and verify the fixed fields; `buf` must hold at least
    /// [`ENV_HEADER_SIZE`] bytes. Slots are decoded when the buffer
    /// carries the full table.
    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        if buf.len() < ENV_HEADER_SIZE {
            return Err(DbError::IntegrityViolated("short environment header".into()));
        }
        if buf[0..4] != ENV_MAGIC {
            return Err(DbError::IntegrityViolated("bad magic in header page".into()));
        }
        let crc = u32::from_le_bytes(buf[32..36].try_into().unwrap());
        if crc != crc32fast::hash(&buf[0..32]) {
            return Err(DbError::IntegrityViolated("header page checksum mismatch".into()));
        }
        if buf[4..8] != ENV_VERSION {
            return Err(DbError::InvalidParameter(format!(
                "unsupported file version {:?}",
                &buf[4..8]
            )));
        }
        let page_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let max_databases = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let pagemap_blob_id = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let first_freelist_page = u64::from_le_bytes(buf[24..32].try_into().unwrap());

        let mut slots = Vec::with_capacity(max_databases as usize);
        if buf.len() >= Self::byte_len(max_databases as usize) {
            for i in 0..max_databases as usize {
                let at = ENV_HEADER_SIZE + i * DB_SLOT_SIZE;
                slots.push(DbSlot {
                    name: u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()),
                    dir_blob_id: u64::from_le_bytes(buf[at + 4..at + 12].try_into().unwrap()),
                });
            }
        }
        Ok(Self {
            page_size,
            max_databases,
            pagemap_blob_id,
            first_freelist_page,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut header = EnvHeader::new(4096, 4);
        header.pagemap_blob_id = 0x1234;
        header.first_freelist_page = 0x2000;
        header.slots[1] = DbSlot {
            name: 7,
            dir_blob_id: 0x3000,
        };

        let mut buf = vec![0u8; EnvHeader::byte_len(4)];
        header.encode_into(&mut buf);
        let decoded = EnvHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn bad_magic_is_integrity_violation() {
        let header = EnvHeader::new(4096, 4);
        let mut buf = vec![0u8; EnvHeader::byte_len(4)];
        header.encode_into(&mut buf);
        buf[0] = b'X';
        assert_eq!(EnvHeader::decode(&buf).unwrap_err().code(), 7);
    }

    #[test]
    fn flipped_field_fails_the_checksum() {
        let header = EnvHeader::new(4096, 4);
        let mut buf = vec![0u8; EnvHeader::byte_len(4)];
        header.encode_into(&mut buf);
        buf[9] ^= 0xff; // corrupt page_size
        assert_eq!(EnvHeader::decode(&buf).unwrap_err().code(), 7);
    }

    #[test]
    fn unknown_version_is_invalid_parameter() {
        let header = EnvHeader::new(4096, 4);
        let mut buf = vec![0u8; EnvHeader::byte_len(4)];
        header.encode_into(&mut buf);
        buf[4] = 9;
        // checksum still covers the version bytes
        let crc = crc32fast::hash(&buf[0..32]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(EnvHeader::decode(&buf).unwrap_err().code(), 5);
    }
}
