use common::{Address, DbId, PAGE_HEADER_SIZE};

/// The page carries no on-disk header; its payload starts at byte 0.
/// Set on blob pages so a record can sit at the page start.
pub const PAGE_NO_HEADER: u8 = 0x01;

/// Discriminates what a page stores; persisted in the first header byte
/// of pages that carry a header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Header = 1,
    BtreeRoot = 2,
    BtreeIndex = 3,
    Blob = 4,
    Freelist = 5,
}

impl PageType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PageType::Header,
            2 => PageType::BtreeRoot,
            3 => PageType::BtreeIndex,
            4 => PageType::Blob,
            5 => PageType::Freelist,
            _ => return None,
        })
    }
}

/// A cached page: an owned buffer of exactly `page_size` bytes plus the
/// in-memory attributes the cache needs.
///
/// The on-disk header (type, flags) is written once when the page is
/// allocated with a type; the LSN is a purely in-memory attribute so
/// that flushing a fetched page never rewrites bytes it does not own.
#[derive(Debug)]
pub struct Page {
    address: Address,
    page_type: PageType,
    flags: u8,
    dirty: bool,
    db: Option<DbId>,
    lsn: u64,
    data: Vec<u8>,
}

impl Page {
    pub fn new(address: Address, page_size: usize) -> Self {
        Self {
            address,
            page_type: PageType::Blob,
            flags: PAGE_NO_HEADER,
            dirty: false,
            db: None,
            lsn: 0,
            data: vec![0u8; page_size],
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Set the page's type, writing the on-disk header for pages that
    /// carry one. Blob pages never do (the blob sits at the page
    /// start); neither does the environment header page, whose layout
    /// the environment owns entirely.
    pub fn set_type(&mut self, page_type: PageType) {
        self.page_type = page_type;
        if page_type == PageType::Blob {
            self.flags |= PAGE_NO_HEADER;
        } else {
            self.flags &= !PAGE_NO_HEADER;
        }
        if self.has_disk_header() {
            self.data[0] = page_type as u8;
            self.data[1] = self.flags;
            self.data[2..4].fill(0);
            self.data[4..8].fill(0);
        }
    }

    /// Best-effort reconstruction of the attributes of a page read from
    /// disk. Pages without a recognizable header byte are blob pages.
    pub fn decode_disk_header(&mut self) {
        if self.address == 0 {
            self.page_type = PageType::Header;
            self.flags = 0;
            return;
        }
        match PageType::from_u8(self.data[0]) {
            Some(t) if t != PageType::Blob && t != PageType::Header => {
                self.page_type = t;
                self.flags = self.data[1];
            }
            _ => {
                self.page_type = PageType::Blob;
                self.flags = PAGE_NO_HEADER;
            }
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn db(&self) -> Option<DbId> {
        self.db
    }

    pub fn set_db(&mut self, db: Option<DbId>) {
        self.db = db;
    }

    /// Highest LSN that modified this page.
    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = lsn;
    }

    /// The whole buffer, header bytes included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn has_disk_header(&self) -> bool {
        self.address != 0
            && self.flags & PAGE_NO_HEADER == 0
            && self.page_type != PageType::Header
    }

    /// The usable region: past the on-disk header for pages that carry
    /// one, the whole buffer otherwise.
    pub fn payload(&self) -> &[u8] {
        if self.has_disk_header() {
            &self.data[PAGE_HEADER_SIZE..]
        } else {
            &self.data
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        if self.has_disk_header() {
            &mut self.data[PAGE_HEADER_SIZE..]
        } else {
            &mut self.data
        }
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }
}
