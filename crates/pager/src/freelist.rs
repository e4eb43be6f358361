use crate::manager::{ALLOC_CLEAR_WITH_ZERO, ALLOC_IGNORE_FREELIST, PageManager};
use crate::page::PageType;
use common::{Address, CHUNK_SIZE, DbError, DbResult};

// Freelist page payload: {next: u64, range_start: u64, bitmap}.
// One bitmap bit covers one chunk; a set bit means the chunk is free.
const BITMAP_OFFSET: usize = 16;

/// Tracks free file regions in bitmap pages chained from the header.
///
/// Each page covers a fixed, contiguous address range; coverage grows
/// on demand by chaining a fresh page at the tail. Allocation is
/// first-fit in address order; freeing sets bits, so adjacent runs
/// coalesce by construction. Runs never span freelist pages.
pub struct Freelist {
    first_page: Address,
}

struct FreelistPage {
    address: Address,
    next: Address,
    range_start: u64,
    coverage: u64,
}

impl Freelist {
    pub fn new(first_page: Address) -> Self {
        Self { first_page }
    }

    /// Address of the first freelist page, 0 when none exists yet;
    /// recorded in the environment header.
    pub fn first_page(&self) -> Address {
        self.first_page
    }

    fn bitmap_bits(page_size: usize) -> usize {
        (page_size - common::PAGE_HEADER_SIZE - BITMAP_OFFSET) * 8
    }

    fn coverage(page_size: usize) -> u64 {
        (Self::bitmap_bits(page_size) * CHUNK_SIZE) as u64
    }

    fn pages(&self, pm: &mut PageManager) -> DbResult<Vec<FreelistPage>> {
        let page_size = pm.page_size();
        let coverage = Self::coverage(page_size);
        let mut infos = Vec::new();
        let mut address = self.first_page;
        while address != 0 {
            let page = pm.fetch_page(None, address, false)?;
            let payload = page.payload();
            let next = u64::from_le_bytes(payload[0..8].try_into().unwrap());
            let range_start = u64::from_le_bytes(payload[8..16].try_into().unwrap());
            infos.push(FreelistPage {
                address,
                next,
                range_start,
                coverage,
            });
            address = next;
        }
        Ok(infos)
    }

    /// Extend coverage with fresh freelist pages until `upto` is
    /// tracked.
    fn ensure_coverage(&mut self, pm: &mut PageManager, upto: u64) -> DbResult<()> {
        loop {
            let pages = self.pages(pm)?;
            let end = pages
                .last()
                .map(|p| p.range_start + p.coverage)
                .unwrap_or(0);
            if end >= upto {
                return Ok(());
            }
            let new_addr = pm.alloc_page(
                None,
                PageType::Freelist,
                ALLOC_IGNORE_FREELIST | ALLOC_CLEAR_WITH_ZERO,
            )?;
            {
                let page = pm.fetch_page(None, new_addr, false)?;
                let payload = page.payload_mut();
                payload[8..16].copy_from_slice(&end.to_le_bytes());
                page.set_dirty(true);
            }
            match pages.last() {
                Some(last) => {
                    let prev = pm.fetch_page(None, last.address, false)?;
                    prev.payload_mut()[0..8].copy_from_slice(&new_addr.to_le_bytes());
                    prev.set_dirty(true);
                }
                None => self.first_page = new_addr,
            }
        }
    }

    /// Mark `size` bytes starting at `address` as free.
    pub fn free_area(&mut self, pm: &mut PageManager, address: Address, size: usize) -> DbResult<()> {
        if address % CHUNK_SIZE as u64 != 0 {
            return Err(DbError::InvalidParameter(format!(
                "freed address {address} is not chunk-aligned"
            )));
        }
        let chunks = size.div_ceil(CHUNK_SIZE);
        self.ensure_coverage(pm, address + (chunks * CHUNK_SIZE) as u64)?;
        self.set_range(pm, address, chunks, true, true)
    }

    pub fn free_page(&mut self, pm: &mut PageManager, address: Address, page_size: usize) -> DbResult<()> {
        self.free_area(pm, address, page_size)
    }

    /// Clear a page's bits without requiring them to be set; used to
    /// keep the bitmap in line when a page is taken straight from the
    /// page map's free entries.
    pub fn reserve_page(&mut self, pm: &mut PageManager, address: Address, page_size: usize) -> DbResult<()> {
        self.set_range(pm, address, page_size / CHUNK_SIZE, false, false)
    }

    /// First-fit allocation of `size` bytes; `None` when no run is
    /// long enough and the caller should extend the file instead.
    pub fn alloc_area(&mut self, pm: &mut PageManager, size: usize) -> DbResult<Option<Address>> {
        let chunks = size.div_ceil(CHUNK_SIZE);
        let bits = Self::bitmap_bits(pm.page_size());
        let infos = self.pages(pm)?;
        for info in infos {
            let page = pm.fetch_page(None, info.address, false)?;
            let bitmap = &page.payload()[BITMAP_OFFSET..];
            let found = find_run(bitmap, bits, chunks, 0, 1);
            if let Some(idx) = found {
                let payload = page.payload_mut();
                for i in idx..idx + chunks {
                    bit_clear(&mut payload[BITMAP_OFFSET..], i);
                }
                page.set_dirty(true);
                return Ok(Some(info.range_start + (idx * CHUNK_SIZE) as u64));
            }
        }
        Ok(None)
    }

    /// Allocate one whole, page-aligned page; `None` when no such run
    /// exists.
    pub fn alloc_page(&mut self, pm: &mut PageManager, page_size: usize) -> DbResult<Option<Address>> {
        let chunks = page_size / CHUNK_SIZE;
        let infos = self.pages(pm)?;
        for info in infos {
            let bits = Self::bitmap_bits(page_size);
            // first bit index whose address is page-aligned
            let misalign = info.range_start % page_size as u64;
            let first = if misalign == 0 {
                0
            } else {
                ((page_size as u64 - misalign) / CHUNK_SIZE as u64) as usize
            };
            let page = pm.fetch_page(None, info.address, false)?;
            let bitmap = &page.payload()[BITMAP_OFFSET..];
            let found = find_run(bitmap, bits, chunks, first, chunks);
            if let Some(idx) = found {
                let payload = page.payload_mut();
                for i in idx..idx + chunks {
                    bit_clear(&mut payload[BITMAP_OFFSET..], i);
                }
                page.set_dirty(true);
                return Ok(Some(info.range_start + (idx * CHUNK_SIZE) as u64));
            }
        }
        Ok(None)
    }

    /// True when every chunk of the page at `address` is free.
    pub fn is_page_free(&mut self, pm: &mut PageManager, address: Address, page_size: usize) -> DbResult<bool> {
        let chunks = page_size / CHUNK_SIZE;
        let infos = self.pages(pm)?;
        for info in infos {
            if address < info.range_start || address >= info.range_start + info.coverage {
                continue;
            }
            let idx = ((address - info.range_start) / CHUNK_SIZE as u64) as usize;
            let page = pm.fetch_page(None, info.address, false)?;
            let bitmap = &page.payload()[BITMAP_OFFSET..];
            return Ok((idx..idx + chunks).all(|i| bit_get(bitmap, i)));
        }
        Ok(false)
    }

    /// Stop tracking every address at or above `new_size`; the device
    /// is about to shrink below them.
    pub fn truncate_page(&mut self, pm: &mut PageManager, new_size: u64) -> DbResult<()> {
        let infos = self.pages(pm)?;
        for info in infos {
            let end = info.range_start + info.coverage;
            if end <= new_size {
                continue;
            }
            let first = if new_size > info.range_start {
                ((new_size - info.range_start) / CHUNK_SIZE as u64) as usize
            } else {
                0
            };
            let bits = (info.coverage / CHUNK_SIZE as u64) as usize;
            let page = pm.fetch_page(None, info.address, false)?;
            let payload = page.payload_mut();
            let mut changed = false;
            for i in first..bits {
                if bit_get(&payload[BITMAP_OFFSET..], i) {
                    bit_clear(&mut payload[BITMAP_OFFSET..], i);
                    changed = true;
                }
            }
            if changed {
                page.set_dirty(true);
            }
        }
        Ok(())
    }

    /// `(freelist pages, free bytes)` for the metrics snapshot.
    pub fn metrics(&mut self, pm: &mut PageManager) -> DbResult<(u64, u64)> {
        let infos = self.pages(pm)?;
        let mut free_chunks = 0u64;
        let pages = infos.len() as u64;
        for info in infos {
            let page = pm.fetch_page(None, info.address, false)?;
            let bitmap = &page.payload()[BITMAP_OFFSET..];
            free_chunks += bitmap.iter().map(|b| b.count_ones() as u64).sum::<u64>();
        }
        Ok((pages, free_chunks * CHUNK_SIZE as u64))
    }

    fn set_range(
        &mut self,
        pm: &mut PageManager,
        address: Address,
        chunks: usize,
        value: bool,
        strict: bool,
    ) -> DbResult<()> {
        let infos = self.pages(pm)?;
        let mut remaining = chunks;
        let mut cursor = address;
        for info in infos {
            if remaining == 0 {
                break;
            }
            let end = info.range_start + info.coverage;
            if cursor < info.range_start || cursor >= end {
                continue;
            }
            let idx = ((cursor - info.range_start) / CHUNK_SIZE as u64) as usize;
            let available = ((end - cursor) / CHUNK_SIZE as u64) as usize;
            let take = remaining.min(available);
            let page = pm.fetch_page(None, info.address, false)?;
            let payload = page.payload_mut();
            for i in idx..idx + take {
                let bitmap = &mut payload[BITMAP_OFFSET..];
                if strict && bit_get(bitmap, i) == value {
                    return Err(DbError::IntegrityViolated(format!(
                        "chunk at {} freed twice",
                        info.range_start + (i * CHUNK_SIZE) as u64
                    )));
                }
                if value {
                    bit_set(bitmap, i);
                } else {
                    bit_clear(bitmap, i);
                }
            }
            page.set_dirty(true);
            cursor += (take * CHUNK_SIZE) as u64;
            remaining -= take;
        }
        if remaining > 0 && strict {
            return Err(DbError::IntegrityViolated(format!(
                "freed range at {address} exceeds freelist coverage"
            )));
        }
        Ok(())
    }
}

fn bit_get(bitmap: &[u8], idx: usize) -> bool {
    bitmap[idx / 8] & (1 << (idx % 8)) != 0
}

fn bit_set(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] |= 1 << (idx % 8);
}

fn bit_clear(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] &= !(1 << (idx % 8));
}

// First run of `len` set bits starting at or after `first`, stepping
// by `stride` (1 for byte-granular areas, chunks-per-page for aligned
// whole-page runs).
fn find_run(bitmap: &[u8], bits: usize, len: usize, first: usize, stride: usize) -> Option<usize> {
    if len == 0 || len > bits {
        return None;
    }
    let mut idx = first;
    while idx + len <= bits {
        if (idx..idx + len).all(|i| bit_get(bitmap, i)) {
            return Some(idx);
        }
        idx += stride;
    }
    None
}
