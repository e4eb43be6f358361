use crate::blob::BlobManager;
use crate::changeset::Changeset;
use crate::freelist::Freelist;
use crate::page::{Page, PageType};
use common::{Address, DbError, DbId, DbResult, EnvMetrics, EnvOptions};
use device::Device;
use hashbrown::HashMap;
use lru::LruCache;

/// Do not consult the freelist when allocating the page.
pub const ALLOC_IGNORE_FREELIST: u32 = 0x1;

/// Zero the page buffer after allocation.
pub const ALLOC_CLEAR_WITH_ZERO: u32 = 0x2;

/// Upper bound on pages evicted per purge pass, to avoid I/O bursts.
pub const PURGE_LIMIT: usize = 20;

/// What the manager knows about an address.
///
/// `page: None` with `is_free: true` means the address is known to be
/// free but its data is not currently loaded.
#[derive(Debug, Default)]
pub struct PageState {
    pub page: Option<Page>,
    pub is_free: bool,
}

/// Allocates, fetches, flushes and frees pages.
///
/// Owns the device, the map of all known pages (free and not free),
/// and a recency list over the cached ones; newly stored pages sit at
/// the head, the tail is the first purge candidate.
pub struct PageManager {
    device: Box<dyn Device>,
    page_size: usize,
    cache_size: usize,
    in_memory: bool,
    read_only: bool,
    track_changeset: bool,
    page_map: HashMap<Address, PageState>,
    recency: LruCache<Address, ()>,
    freelist: Option<Freelist>,
    changeset: Changeset,
    state_blob_id: u64,
    state_dirty: bool,
    page_count_fetched: u64,
    page_count_flushed: u64,
    page_count_index: u64,
    page_count_blob: u64,
    page_count_freelist: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl PageManager {
    pub fn new(device: Box<dyn Device>, opts: &EnvOptions) -> Self {
        Self {
            device,
            page_size: opts.page_size,
            cache_size: opts.cache_size,
            in_memory: opts.in_memory,
            read_only: opts.read_only,
            track_changeset: opts.enable_recovery || opts.enable_transactions,
            page_map: HashMap::new(),
            recency: LruCache::unbounded(),
            freelist: None,
            changeset: Changeset::new(),
            state_blob_id: 0,
            state_dirty: false,
            page_count_fetched: 0,
            page_count_flushed: 0,
            page_count_index: 0,
            page_count_blob: 0,
            page_count_freelist: 0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn file_size(&self) -> u64 {
        self.device.file_size()
    }

    pub fn device_mut(&mut self) -> &mut dyn Device {
        self.device.as_mut()
    }

    /// Attach the freelist; in-memory and read-only environments run
    /// without one.
    pub fn enable_freelist(&mut self, first_page: Address) {
        if !self.in_memory && !self.read_only {
            self.freelist = Some(Freelist::new(first_page));
        }
    }

    pub fn freelist_first_page(&self) -> Address {
        self.freelist.as_ref().map(|f| f.first_page()).unwrap_or(0)
    }

    /// Fetch the page at `address`, reading through the device on a
    /// cache miss.
    ///
    /// With `only_from_cache`, or in an in-memory environment, a miss
    /// returns `KeyNotFound` instead of touching the device.
    pub fn fetch_page(
        &mut self,
        db: Option<DbId>,
        address: Address,
        only_from_cache: bool,
    ) -> DbResult<&mut Page> {
        let cached = self
            .page_map
            .get(&address)
            .is_some_and(|state| state.page.is_some());
        if cached {
            self.cache_hits += 1;
            self.recency.promote(&address);
            if self.track_changeset {
                self.changeset.add(address);
            }
            let state = self.page_map.get_mut(&address).unwrap();
            return Ok(state.page.as_mut().unwrap());
        }

        self.cache_misses += 1;
        if only_from_cache || self.in_memory {
            return Err(DbError::KeyNotFound);
        }

        let mut page = Page::new(address, self.page_size);
        self.device.read(address, page.data_mut())?;
        page.decode_disk_header();
        page.set_db(db);
        self.store_page(page);
        if self.track_changeset {
            self.changeset.add(address);
        }
        self.page_count_fetched += 1;

        let state = self.page_map.get_mut(&address).unwrap();
        Ok(state.page.as_mut().unwrap())
    }

    /// Allocate a page: a free one from the page map, then the
    /// freelist, then fresh space at the end of the file.
    ///
    /// The new page is typed, marked dirty, attached to `db`, stored
    /// in the cache and recorded in the changeset. Returns its
    /// address; fetch it to get at the buffer.
    pub fn alloc_page(
        &mut self,
        db: Option<DbId>,
        page_type: PageType,
        flags: u32,
    ) -> DbResult<Address> {
        let mut address: Option<Address> = None;
        let mut reused: Option<Page> = None;

        if flags & ALLOC_IGNORE_FREELIST == 0 && self.freelist.is_some() {
            let free_addr = self
                .page_map
                .iter()
                .filter(|(_, state)| state.is_free)
                .map(|(addr, _)| *addr)
                .min();
            if let Some(addr) = free_addr {
                let state = self.page_map.get_mut(&addr).unwrap();
                state.is_free = false;
                reused = state.page.take();
                self.state_dirty = true;
                // keep the bitmap in line with the page map
                self.freelist_reserve_page(addr)?;
                address = Some(addr);
            } else if let Some(addr) = self.freelist_alloc_page()? {
                address = Some(addr);
            }
        }

        let (address, mut page) = match address {
            Some(addr) => {
                let page = match reused {
                    Some(page) => page,
                    None => match self.page_map.get_mut(&addr).and_then(|s| s.page.take()) {
                        Some(page) => page,
                        None => {
                            let mut page = Page::new(addr, self.page_size);
                            self.device.read(addr, page.data_mut())?;
                            page
                        }
                    },
                };
                (addr, page)
            }
            None => {
                let addr = self.device.grow(self.page_size as u64)?;
                (addr, Page::new(addr, self.page_size))
            }
        };

        if flags & ALLOC_CLEAR_WITH_ZERO != 0 {
            page.zero();
        }
        page.set_db(db);
        page.set_type(page_type);
        page.set_dirty(true);
        self.store_page(page);
        if self.track_changeset {
            self.changeset.add(address);
        }

        match page_type {
            PageType::BtreeRoot | PageType::BtreeIndex => self.page_count_index += 1,
            PageType::Blob => self.page_count_blob += 1,
            PageType::Freelist => self.page_count_freelist += 1,
            PageType::Header => {}
        }
        Ok(address)
    }

    /// Write the page back if it is dirty; a no-op otherwise.
    pub fn flush_page(&mut self, address: Address) -> DbResult<()> {
        let Some(state) = self.page_map.get_mut(&address) else {
            return Ok(());
        };
        let Some(page) = state.page.as_mut() else {
            return Ok(());
        };
        if !page.is_dirty() {
            return Ok(());
        }
        self.device.write(address, page.data())?;
        page.set_dirty(false);
        self.page_count_flushed += 1;
        Ok(())
    }

    /// Flush every cached page; with `keep_cached == false` the cache
    /// is emptied afterwards.
    pub fn flush_all_pages(&mut self, keep_cached: bool) -> DbResult<()> {
        let addresses: Vec<Address> = self
            .page_map
            .iter()
            .filter(|(_, state)| state.page.is_some())
            .map(|(addr, _)| *addr)
            .collect();
        for address in addresses {
            self.flush_page(address)?;
        }
        if !keep_cached {
            self.page_map.clear();
            self.recency.clear();
        }
        Ok(())
    }

    /// True once the resident pages exceed the cache budget.
    pub fn cache_is_full(&self) -> bool {
        self.recency.len() * self.page_size > self.cache_size
    }

    pub fn resident_pages(&self) -> usize {
        self.recency.len()
    }

    /// Evict old clean-able pages when the cache budget is exceeded.
    ///
    /// Walks the recency list oldest-first and drops pages that are
    /// neither the header page nor members of the active changeset,
    /// flushing them as needed; bounded by [`PURGE_LIMIT`] per call.
    /// Returns the evicted addresses so the owner can uncouple any
    /// cursors parked on them.
    pub fn purge_cache(&mut self) -> DbResult<Vec<Address>> {
        let mut evicted = Vec::new();
        if self.in_memory || !self.cache_is_full() {
            return Ok(evicted);
        }

        let order: Vec<Address> = self.recency.iter().map(|(addr, _)| *addr).collect();
        for &address in order.iter().rev() {
            if evicted.len() >= PURGE_LIMIT {
                break;
            }
            if address == 0 || self.changeset.contains(address) {
                continue;
            }
            self.flush_page(address)?;
            self.recency.pop(&address);
            let keep_entry = self
                .page_map
                .get(&address)
                .is_some_and(|state| state.is_free);
            if keep_entry {
                self.page_map.get_mut(&address).unwrap().page = None;
            } else {
                self.page_map.remove(&address);
            }
            evicted.push(address);
        }
        Ok(evicted)
    }

    /// Flush and drop exactly the pages owned by `db`; the header page
    /// survives.
    pub fn close_database(&mut self, db: DbId) -> DbResult<Vec<Address>> {
        let addresses: Vec<Address> = self
            .page_map
            .iter()
            .filter(|(addr, state)| {
                **addr != 0
                    && state
                        .page
                        .as_ref()
                        .is_some_and(|page| page.db() == Some(db))
            })
            .map(|(addr, _)| *addr)
            .collect();
        for &address in &addresses {
            self.flush_page(address)?;
            self.recency.pop(&address);
            let keep_entry = self
                .page_map
                .get(&address)
                .is_some_and(|state| state.is_free);
            if keep_entry {
                self.page_map.get_mut(&address).unwrap().page = None;
            } else {
                self.page_map.remove(&address);
            }
        }
        Ok(addresses)
    }

    /// Return a whole page to the freelist.
    pub fn add_to_freelist(&mut self, address: Address) -> DbResult<()> {
        if address == 0 {
            return Err(DbError::InvalidParameter(
                "the header page is never freed".into(),
            ));
        }
        let state = self.page_map.entry(address).or_default();
        if state.is_free {
            return Err(DbError::IntegrityViolated(format!(
                "page {address} freed twice"
            )));
        }
        state.is_free = true;
        self.state_dirty = true;
        let page_size = self.page_size;
        self.with_freelist(|freelist, pm| freelist.free_page(pm, address, page_size))?;
        Ok(())
    }

    pub fn free_area(&mut self, address: Address, size: usize) -> DbResult<()> {
        self.with_freelist(|freelist, pm| freelist.free_area(pm, address, size))?;
        Ok(())
    }

    pub fn alloc_area(&mut self, size: usize) -> DbResult<Option<Address>> {
        let result = self
            .with_freelist(|freelist, pm| freelist.alloc_area(pm, size))?
            .flatten();
        // a sub-page allocation inside a freed page means that page is
        // no longer wholly free
        if let Some(address) = result {
            let ps = self.page_size as u64;
            let mut page_addr = address - address % ps;
            let last = address + size as u64 - 1;
            while page_addr <= last {
                if let Some(state) = self.page_map.get_mut(&page_addr)
                    && state.is_free
                {
                    state.is_free = false;
                    self.state_dirty = true;
                }
                page_addr += ps;
            }
        }
        Ok(result)
    }

    pub fn is_page_free(&mut self, address: Address) -> DbResult<bool> {
        let page_size = self.page_size;
        Ok(self
            .with_freelist(|freelist, pm| freelist.is_page_free(pm, address, page_size))?
            .unwrap_or(false))
    }

    fn freelist_alloc_page(&mut self) -> DbResult<Option<Address>> {
        let page_size = self.page_size;
        Ok(self
            .with_freelist(|freelist, pm| freelist.alloc_page(pm, page_size))?
            .flatten())
    }

    fn freelist_reserve_page(&mut self, address: Address) -> DbResult<()> {
        let page_size = self.page_size;
        self.with_freelist(|freelist, pm| freelist.reserve_page(pm, address, page_size))?;
        Ok(())
    }

    /// Truncate trailing free pages and shrink the file.
    ///
    /// Silently skipped while the device is memory-mapped: the map
    /// pins the file length, and a missed reclaim only costs space.
    pub fn reclaim_space(&mut self) -> DbResult<()> {
        if self.freelist.is_none() || self.device.is_mapped() {
            return Ok(());
        }
        let page_size = self.page_size as u64;
        let file_size = self.device.file_size();
        let mut new_size = file_size;
        while new_size > page_size {
            let tail = new_size - page_size;
            if !self.is_page_free(tail)? {
                break;
            }
            self.with_freelist(|freelist, pm| freelist.truncate_page(pm, tail))?;
            self.recency.pop(&tail);
            self.page_map.remove(&tail);
            self.state_dirty = true;
            new_size = tail;
        }
        if new_size < file_size {
            self.device.truncate(new_size)?;
        }
        Ok(())
    }

    /// Flush everything, optionally reclaim tail space, flush again
    /// (reclaim dirties freelist pages), and sync the device.
    pub fn close(&mut self, reclaim: bool) -> DbResult<()> {
        if self.in_memory {
            self.page_map.clear();
            self.recency.clear();
            return Ok(());
        }
        self.flush_all_pages(true)?;
        if reclaim {
            self.reclaim_space()?;
        }
        self.flush_all_pages(false)?;
        if !self.read_only {
            self.device.sync()?;
        }
        Ok(())
    }

    /// Persist the page map as a blob: a big-endian count followed by
    /// `{address, is_free}` tuples. Returns the blob id, reusing the
    /// previous blob in place when possible.
    pub fn store_state(&mut self, blobs: &mut BlobManager) -> DbResult<u64> {
        if self.in_memory || self.read_only {
            return Ok(0);
        }
        if !self.state_dirty {
            return Ok(self.state_blob_id);
        }
        self.state_dirty = false;

        let mut entries: Vec<(Address, bool)> = self
            .page_map
            .iter()
            .map(|(addr, state)| (*addr, state.is_free))
            .collect();
        entries.sort_unstable_by_key(|(addr, _)| *addr);
        let buf = encode_state(&entries);

        self.state_blob_id = if self.state_blob_id != 0 {
            blobs.overwrite(self, None, self.state_blob_id, &buf)?
        } else {
            blobs.allocate(self, None, &buf)?
        };
        Ok(self.state_blob_id)
    }

    /// Repopulate the page map from a state blob written by
    /// [`store_state`](Self::store_state).
    pub fn load_state(&mut self, blobs: &mut BlobManager, blob_id: u64) -> DbResult<()> {
        self.state_blob_id = blob_id;
        if blob_id == 0 {
            return Ok(());
        }
        let data = blobs.read(self, None, blob_id)?;
        let entries = decode_state(&data)?;
        for (address, is_free) in entries {
            let state = self.page_map.entry(address).or_default();
            state.is_free = is_free;
        }
        self.state_dirty = false;
        Ok(())
    }

    pub fn state_blob_id(&self) -> u64 {
        self.state_blob_id
    }

    /// Read `len` bytes starting at an arbitrary address, walking the
    /// covering pages through the cache.
    pub fn read_bytes(&mut self, db: Option<DbId>, address: Address, len: usize) -> DbResult<Vec<u8>> {
        let page_size = self.page_size as u64;
        let mut out = Vec::with_capacity(len);
        let mut offset = address;
        let mut remaining = len;
        while remaining > 0 {
            let page_addr = offset - offset % page_size;
            let in_page = (offset - page_addr) as usize;
            let n = remaining.min(self.page_size - in_page);
            let page = self.fetch_page(db, page_addr, false)?;
            out.extend_from_slice(&page.data()[in_page..in_page + n]);
            offset += n as u64;
            remaining -= n;
        }
        Ok(out)
    }

    /// Write bytes starting at an arbitrary address through the cache,
    /// dirtying every covering page.
    pub fn write_bytes(&mut self, db: Option<DbId>, address: Address, data: &[u8]) -> DbResult<()> {
        let page_size = self.page_size as u64;
        let mut offset = address;
        let mut rest = data;
        while !rest.is_empty() {
            let page_addr = offset - offset % page_size;
            let in_page = (offset - page_addr) as usize;
            let n = rest.len().min(self.page_size - in_page);
            let page = self.fetch_page(db, page_addr, false)?;
            page.data_mut()[in_page..in_page + n].copy_from_slice(&rest[..n]);
            page.set_dirty(true);
            offset += n as u64;
            rest = &rest[n..];
        }
        Ok(())
    }

    pub fn changeset_addresses(&self) -> Vec<Address> {
        self.changeset.addresses().to_vec()
    }

    pub fn changeset_contains(&self, address: Address) -> bool {
        self.changeset.contains(address)
    }

    pub fn changeset_is_empty(&self) -> bool {
        self.changeset.is_empty()
    }

    pub fn clear_changeset(&mut self) {
        self.changeset.clear();
    }

    /// Drop the changeset's pages without flushing them, forgetting
    /// uncommitted modifications; the next fetch rereads from disk.
    pub fn discard_changeset(&mut self) {
        let addresses = self.changeset_addresses();
        for address in addresses {
            self.recency.pop(&address);
            let keep_entry = self
                .page_map
                .get(&address)
                .is_some_and(|state| state.is_free);
            if keep_entry {
                self.page_map.get_mut(&address).unwrap().page = None;
            } else {
                self.page_map.remove(&address);
            }
        }
        self.changeset.clear();
    }

    /// Record `lsn` on every changeset page.
    pub fn stamp_changeset(&mut self, lsn: u64) {
        let addresses = self.changeset_addresses();
        for address in addresses {
            if let Some(state) = self.page_map.get_mut(&address)
                && let Some(page) = state.page.as_mut()
            {
                page.set_lsn(lsn);
            }
        }
    }

    /// Snapshot of the counters, including the freelist's.
    pub fn collect_metrics(&mut self) -> DbResult<EnvMetrics> {
        let mut metrics = EnvMetrics {
            page_count_fetched: self.page_count_fetched,
            page_count_flushed: self.page_count_flushed,
            page_count_type_index: self.page_count_index,
            page_count_type_blob: self.page_count_blob,
            page_count_type_freelist: self.page_count_freelist,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            freelist_pages: 0,
            freelist_free_bytes: 0,
        };
        if let Some((pages, free_bytes)) = self.with_freelist(|freelist, pm| freelist.metrics(pm))? {
            metrics.freelist_pages = pages;
            metrics.freelist_free_bytes = free_bytes;
        }
        Ok(metrics)
    }

    pub(crate) fn store_page(&mut self, page: Page) {
        let address = page.address();
        self.recency.push(address, ());
        let state = self.page_map.entry(address).or_default();
        state.page = Some(page);
        self.state_dirty = true;
    }

    // Temporarily move the freelist out so its methods can fetch pages
    // through `self` without aliasing.
    fn with_freelist<R>(
        &mut self,
        f: impl FnOnce(&mut Freelist, &mut PageManager) -> DbResult<R>,
    ) -> DbResult<Option<R>> {
        let Some(mut freelist) = self.freelist.take() else {
            return Ok(None);
        };
        let result = f(&mut freelist, self);
        self.freelist = Some(freelist);
        result.map(Some)
    }

    #[cfg(test)]
    pub(crate) fn page_map_entry(&self, address: Address) -> Option<&PageState> {
        self.page_map.get(&address)
    }
}

// The persisted page map is big-endian on disk, unlike the journal's
// little-endian records; the asymmetry is part of the file format.
pub(crate) fn encode_state(entries: &[(Address, bool)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + entries.len() * 9);
    buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (addr, is_free) in entries {
        buf.extend_from_slice(&addr.to_be_bytes());
        buf.push(u8::from(*is_free));
    }
    buf
}

pub(crate) fn decode_state(data: &[u8]) -> DbResult<Vec<(Address, bool)>> {
    let short = || DbError::IntegrityViolated("truncated page-map blob".into());
    if data.len() < 4 {
        return Err(short());
    }
    let count = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
    if data.len() < 4 + count * 9 {
        return Err(short());
    }
    let mut entries = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let address = u64::from_be_bytes(data[pos..pos + 8].try_into().unwrap());
        let is_free = data[pos + 8] != 0;
        entries.push((address, is_free));
        pos += 9;
    }
    Ok(entries)
}
