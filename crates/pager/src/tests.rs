use crate::manager::{decode_state, encode_state};
use crate::*;
use common::{CHUNK_SIZE, DbId, EnvOptions, PAGE_HEADER_SIZE};
use device::{Device, FileDevice, MemoryDevice};
use proptest::prelude::*;
use tempfile::{TempDir, tempdir};

const PS: usize = 1024;

fn opts(cache_size: usize) -> EnvOptions {
    EnvOptions::builder()
        .page_size(PS)
        .cache_size(cache_size)
        .build()
}

/// A file-backed manager with the header page allocated at address 0
/// and the freelist attached, the way an environment sets one up.
fn disk_pager(dir: &TempDir, cache_size: usize) -> PageManager {
    let device = FileDevice::create(&dir.path().join("main.db"), false).unwrap();
    let mut pm = PageManager::new(Box::new(device), &opts(cache_size));
    pm.enable_freelist(0);
    let header = pm
        .alloc_page(None, PageType::Header, ALLOC_IGNORE_FREELIST | ALLOC_CLEAR_WITH_ZERO)
        .unwrap();
    assert_eq!(header, 0);
    pm
}

mod page {
    use super::*;

    #[test]
    fn typed_pages_reserve_a_disk_header() {
        let mut page = Page::new(PS as u64, PS);
        page.set_type(PageType::Freelist);
        assert_eq!(page.data()[0], PageType::Freelist as u8);
        assert_eq!(page.payload().len(), PS - PAGE_HEADER_SIZE);
    }

    #[test]
    fn blob_pages_use_the_whole_buffer() {
        let mut page = Page::new(PS as u64, PS);
        page.set_type(PageType::Blob);
        assert_eq!(page.flags() & PAGE_NO_HEADER, PAGE_NO_HEADER);
        assert_eq!(page.payload().len(), PS);
    }

    #[test]
    fn header_page_layout_is_owned_by_the_environment() {
        let mut page = Page::new(0, PS);
        page.set_type(PageType::Header);
        assert_eq!(page.data()[0], 0, "no header byte on page 0");
        assert_eq!(page.payload().len(), PS);
    }

    #[test]
    fn disk_header_roundtrip() {
        let mut page = Page::new(PS as u64, PS);
        page.set_type(PageType::BtreeIndex);
        let data = page.data().to_vec();

        let mut read_back = Page::new(PS as u64, PS);
        read_back.data_mut().copy_from_slice(&data);
        read_back.decode_disk_header();
        assert_eq!(read_back.page_type(), PageType::BtreeIndex);
    }
}

mod changeset {
    use super::*;

    #[test]
    fn dedups_and_keeps_insertion_order() {
        let mut cs = Changeset::new();
        cs.add(3072);
        cs.add(1024);
        cs.add(3072);
        assert_eq!(cs.len(), 2);
        assert_eq!(cs.addresses(), &[3072, 1024]);
        assert!(cs.contains(1024));
        assert!(!cs.contains(2048));

        cs.clear();
        assert!(cs.is_empty());
    }
}

mod manager {
    use super::*;

    #[test]
    fn alloc_fetch_flush_persist() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);

        let addr = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        assert_eq!(addr, PS as u64);
        {
            let page = pm.fetch_page(None, addr, false).unwrap();
            page.data_mut()[10] = 0x5a;
            page.set_dirty(true);
        }
        pm.flush_all_pages(false).unwrap();

        // cold fetch reads it back through the device
        let page = pm.fetch_page(None, addr, false).unwrap();
        assert_eq!(page.data()[10], 0x5a);
    }

    #[test]
    fn fetch_only_from_cache_misses_cleanly() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let addr = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.flush_all_pages(false).unwrap();

        let err = pm.fetch_page(None, addr, true).unwrap_err();
        assert_eq!(err.code(), 3);
        // a regular fetch loads it
        pm.fetch_page(None, addr, false).unwrap();
    }

    #[test]
    fn in_memory_pages_never_leave_the_cache() {
        let mut pm = PageManager::new(
            Box::new(MemoryDevice::new()),
            &EnvOptions::builder().page_size(PS).cache_size(0).in_memory(true).build(),
        );
        let addr = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        assert!(pm.cache_is_full());
        assert!(pm.purge_cache().unwrap().is_empty());
        pm.fetch_page(None, addr, false).unwrap();
    }

    #[test]
    fn hit_and_miss_counters() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let addr = pm.alloc_page(None, PageType::Blob, 0).unwrap();

        pm.fetch_page(None, addr, false).unwrap();
        pm.fetch_page(None, addr, false).unwrap();
        pm.flush_all_pages(false).unwrap();
        pm.fetch_page(None, addr, false).unwrap();

        let metrics = pm.collect_metrics().unwrap();
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.page_count_fetched, 1);
    }

    #[test]
    fn purge_evicts_oldest_first_and_is_bounded() {
        let dir = tempdir().unwrap();
        // room for 4 pages
        let mut pm = disk_pager(&dir, 4 * PS);
        let mut addrs = Vec::new();
        for _ in 0..30 {
            addrs.push(pm.alloc_page(None, PageType::Blob, 0).unwrap());
        }
        assert!(pm.cache_is_full());

        let evicted = pm.purge_cache().unwrap();
        assert_eq!(evicted.len(), PURGE_LIMIT);
        // the earliest allocations go first; the header page never does
        assert_eq!(evicted[0], addrs[0]);
        assert!(!evicted.contains(&0));

        // evicted pages were flushed and remain readable
        let page = pm.fetch_page(None, addrs[0], false).unwrap();
        assert_eq!(page.data().len(), PS);
    }

    #[test]
    fn purge_skips_changeset_pages() {
        let dir = tempdir().unwrap();
        let device = FileDevice::create(&dir.path().join("main.db"), false).unwrap();
        let mut pm = PageManager::new(
            Box::new(device),
            &EnvOptions::builder()
                .page_size(PS)
                .cache_size(0)
                .enable_recovery(true)
                .build(),
        );
        pm.enable_freelist(0);
        pm.alloc_page(None, PageType::Header, ALLOC_IGNORE_FREELIST).unwrap();

        let addr = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        assert!(pm.changeset_contains(addr));
        let evicted = pm.purge_cache().unwrap();
        assert!(!evicted.contains(&addr));

        pm.clear_changeset();
        let evicted = pm.purge_cache().unwrap();
        assert!(evicted.contains(&addr));
    }

    #[test]
    fn discard_changeset_forgets_unflushed_writes() {
        let dir = tempdir().unwrap();
        let device = FileDevice::create(&dir.path().join("main.db"), false).unwrap();
        let mut pm = PageManager::new(
            Box::new(device),
            &EnvOptions::builder()
                .page_size(PS)
                .cache_size(64 * PS)
                .enable_recovery(true)
                .build(),
        );
        pm.enable_freelist(0);
        pm.alloc_page(None, PageType::Header, ALLOC_IGNORE_FREELIST).unwrap();
        let addr = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.flush_all_pages(true).unwrap();
        pm.clear_changeset();

        {
            let page = pm.fetch_page(None, addr, false).unwrap();
            page.data_mut()[0] = 0xff;
            page.set_dirty(true);
        }
        pm.discard_changeset();

        let page = pm.fetch_page(None, addr, false).unwrap();
        assert_eq!(page.data()[0], 0, "discarded write must not survive");
    }

    #[test]
    fn close_database_drops_only_its_pages() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(Some(DbId(1)), PageType::Blob, 0).unwrap();
        let b = pm.alloc_page(Some(DbId(2)), PageType::Blob, 0).unwrap();

        let dropped = pm.close_database(DbId(1)).unwrap();
        assert_eq!(dropped, vec![a]);
        assert!(pm.page_map_entry(a).is_none());
        assert!(pm.page_map_entry(b).is_some());
        assert!(pm.page_map_entry(0).is_some(), "header page survives");
    }

    #[test]
    fn freed_pages_are_reused_before_the_file_grows() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        let _b = pm.alloc_page(None, PageType::Blob, 0).unwrap();

        // the first free also chains the freelist page itself in
        pm.add_to_freelist(a).unwrap();
        assert!(pm.is_page_free(a).unwrap());
        assert!(pm.page_map_entry(a).unwrap().is_free);
        let size_before = pm.file_size();

        let again = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        assert_eq!(again, a);
        assert!(!pm.is_page_free(a).unwrap());
        assert_eq!(pm.file_size(), size_before, "no growth while a page is free");
    }

    #[test]
    fn double_free_is_an_integrity_violation() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.add_to_freelist(a).unwrap();
        let err = pm.add_to_freelist(a).unwrap_err();
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn state_blob_roundtrip_through_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.db");
        let free_addr;
        let state_blob;
        {
            let mut pm = disk_pager(&dir, 64 * PS);
            let mut blobs = BlobManager::new(false);
            let low = pm.alloc_page(None, PageType::Blob, 0).unwrap();
            free_addr = pm.alloc_page(None, PageType::Blob, 0).unwrap();
            // a low sub-page run catches the state blob itself, so the
            // freed page stays wholly free
            pm.free_area(low, 512).unwrap();
            pm.add_to_freelist(free_addr).unwrap();
            state_blob = pm.store_state(&mut blobs).unwrap();
            assert_ne!(state_blob, 0);
            pm.close(false).unwrap();
        }

        let device = FileDevice::open(&path, false, false).unwrap();
        let mut pm = PageManager::new(Box::new(device), &opts(64 * PS));
        pm.enable_freelist(0);
        let mut blobs = BlobManager::new(false);
        pm.load_state(&mut blobs, state_blob).unwrap();

        let entry = pm.page_map_entry(free_addr).unwrap();
        assert!(entry.is_free);
        assert!(entry.page.is_none(), "state loads as not-resident entries");
    }

    #[test]
    fn repeated_store_state_stabilizes() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let mut blobs = BlobManager::new(false);
        pm.alloc_page(None, PageType::Blob, 0).unwrap();

        // the first store creates pages of its own, so a second pass
        // may move the blob; after that nothing changes and the id and
        // bytes are stable
        pm.store_state(&mut blobs).unwrap();
        let id2 = pm.store_state(&mut blobs).unwrap();
        let id3 = pm.store_state(&mut blobs).unwrap();
        assert_eq!(id2, id3);
    }

    #[test]
    fn state_encoding_is_big_endian() {
        let buf = encode_state(&[(0x0102_0304_0506_0708, true)]);
        assert_eq!(&buf[..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf[12], 1);
    }

    #[test]
    fn truncated_state_blob_is_rejected() {
        let buf = encode_state(&[(4096, false), (8192, true)]);
        let err = decode_state(&buf[..buf.len() - 1]).unwrap_err();
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn byte_io_spans_page_boundaries() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.alloc_page(None, PageType::Blob, 0).unwrap();

        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let start = (PS + PS / 2) as u64; // straddles the page boundary
        pm.write_bytes(None, start, &data).unwrap();
        let read = pm.read_bytes(None, start, data.len()).unwrap();
        assert_eq!(read, data);

        // and it survives a flush + cold fetch
        pm.flush_all_pages(false).unwrap();
        let read = pm.read_bytes(None, start, data.len()).unwrap();
        assert_eq!(read, data);
    }

    proptest! {
        #[test]
        fn state_codec_roundtrip(entries in proptest::collection::btree_map(
            any::<u64>(), any::<bool>(), 0..64)
        ) {
            let entries: Vec<(u64, bool)> = entries.into_iter().collect();
            let decoded = decode_state(&encode_state(&entries)).unwrap();
            prop_assert_eq!(decoded, entries);
        }
    }
}

mod freelist {
    use super::*;

    #[test]
    fn area_roundtrip_first_fit() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();

        assert_eq!(pm.alloc_area(64).unwrap(), None, "empty freelist");

        pm.free_area(a, 256).unwrap();
        let got = pm.alloc_area(64).unwrap().unwrap();
        assert_eq!(got, a, "first fit starts at the lowest address");
        let got2 = pm.alloc_area(64).unwrap().unwrap();
        assert_eq!(got2, a + 64);
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();

        pm.free_area(a, 128).unwrap();
        pm.free_area(a + 128, 128).unwrap();
        // a single request spanning both freed runs succeeds
        assert_eq!(pm.alloc_area(256).unwrap(), Some(a));
    }

    #[test]
    fn sub_page_frees_do_not_make_a_page_free() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.free_area(a, PS - CHUNK_SIZE).unwrap();
        assert!(!pm.is_page_free(a).unwrap());
        pm.free_area(a + (PS - CHUNK_SIZE) as u64, CHUNK_SIZE).unwrap();
        assert!(pm.is_page_free(a).unwrap());
    }

    #[test]
    fn double_free_of_an_area_is_detected() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.free_area(a, 64).unwrap();
        let err = pm.free_area(a, 64).unwrap_err();
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn misaligned_free_is_rejected() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        let err = pm.free_area(a + 7, 64).unwrap_err();
        assert_eq!(err.code(), 5);
    }

    #[test]
    fn reclaim_truncates_trailing_free_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.db");
        let device = FileDevice::create(&path, true).unwrap(); // no mmap: reclaim runs
        let mut pm = PageManager::new(Box::new(device), &opts(64 * PS));
        pm.enable_freelist(0);
        pm.alloc_page(None, PageType::Header, ALLOC_IGNORE_FREELIST | ALLOC_CLEAR_WITH_ZERO)
            .unwrap();

        let keep = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        // force the freelist page into existence below the pages that
        // will be reclaimed
        pm.free_area(keep, CHUNK_SIZE).unwrap();
        let freelist_page = pm.freelist_first_page();

        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        let b = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        assert!(freelist_page < a && a < b);
        pm.add_to_freelist(a).unwrap();
        pm.add_to_freelist(b).unwrap();

        pm.close(true).unwrap();

        // both tail pages are gone; the freelist page stops the scan
        let device = FileDevice::open(&path, true, false).unwrap();
        assert_eq!(device.file_size(), a);
    }

    #[test]
    fn reclaim_is_skipped_while_mapped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.db");
        let device = FileDevice::create(&path, false).unwrap();
        let mut pm = PageManager::new(Box::new(device), &opts(64 * PS));
        pm.enable_freelist(0);
        pm.alloc_page(None, PageType::Header, ALLOC_IGNORE_FREELIST).unwrap();
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.add_to_freelist(a).unwrap();
        let size = pm.file_size();

        pm.close(true).unwrap();
        let device = FileDevice::open(&path, false, false).unwrap();
        assert_eq!(device.file_size(), size, "mapped device keeps its length");
    }

    #[test]
    fn metrics_report_freelist_pages_and_free_bytes() {
        let dir = tempdir().unwrap();
        let mut pm = disk_pager(&dir, 64 * PS);
        let a = pm.alloc_page(None, PageType::Blob, 0).unwrap();
        pm.free_area(a, 256).unwrap();

        let metrics = pm.collect_metrics().unwrap();
        assert_eq!(metrics.freelist_pages, 1);
        assert_eq!(metrics.freelist_free_bytes, 256);
        assert_eq!(metrics.page_count_type_freelist, 1);
    }

    proptest! {
        // an allocation freed in full can always be re-made without
        // growing the file
        #[test]
        fn freed_space_is_reusable(size in 1usize..4096) {
            let dir = tempdir().unwrap();
            let mut pm = disk_pager(&dir, 256 * PS);
            let mut blobs = BlobManager::new(false);

            let id = blobs.allocate(&mut pm, None, &vec![7u8; size]).unwrap();
            blobs.free(&mut pm, None, id).unwrap();
            let size_before = pm.file_size();

            blobs.allocate(&mut pm, None, &vec![9u8; size]).unwrap();
            prop_assert_eq!(pm.file_size(), size_before);
        }
    }
}

mod blob {
    use super::*;

    fn setup(dir: &TempDir) -> (PageManager, BlobManager) {
        (disk_pager(dir, 256 * PS), BlobManager::new(false))
    }

    #[test]
    fn alloc_read_free() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);

        let record = vec![0x14u8; 500];
        let id = blobs.allocate(&mut pm, None, &record).unwrap();
        assert_ne!(id, 0);
        assert_eq!(blobs.read(&mut pm, None, id).unwrap().as_ref(), &record[..]);
        blobs.free(&mut pm, None, id).unwrap();

        // the allocation is back in the freelist
        let metrics = pm.collect_metrics().unwrap();
        assert!(metrics.freelist_free_bytes >= (BLOB_HEADER_SIZE + 500) as u64);
    }

    #[test]
    fn read_of_a_bad_id_is_an_integrity_violation() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);
        let id = blobs.allocate(&mut pm, None, &[1, 2, 3]).unwrap();
        let err = blobs.read(&mut pm, None, id + CHUNK_SIZE as u64).unwrap_err();
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn overwrite_in_place_keeps_the_id() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);

        let id = blobs.allocate(&mut pm, None, &[0xaau8; 64]).unwrap();
        let same = blobs.overwrite(&mut pm, None, id, &[0xbbu8; 64]).unwrap();
        assert_eq!(same, id);
        assert_eq!(blobs.read(&mut pm, None, id).unwrap().as_ref(), &[0xbbu8; 64][..]);
    }

    #[test]
    fn growing_overwrite_moves_and_frees_the_old_allocation() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);

        let id = blobs.allocate(&mut pm, None, &[0xaau8; 64]).unwrap();
        let moved = blobs.overwrite(&mut pm, None, id, &[0xccu8; 128]).unwrap();
        assert_ne!(moved, id);
        assert_eq!(blobs.read(&mut pm, None, moved).unwrap().as_ref(), &[0xccu8; 128][..]);

        // the old allocation is reusable: a same-sized blob lands there
        let reused = blobs.allocate(&mut pm, None, &[0xddu8; 64]).unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn shrinking_overwrite_stays_in_place() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);
        let id = blobs.allocate(&mut pm, None, &[1u8; 200]).unwrap();
        let same = blobs.overwrite(&mut pm, None, id, &[2u8; 10]).unwrap();
        assert_eq!(same, id);
        assert_eq!(blobs.read(&mut pm, None, id).unwrap().as_ref(), &[2u8; 10][..]);
    }

    #[test]
    fn replace_bigger_and_bigger() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);
        let mut id = blobs.allocate(&mut pm, None, &[0u8; 32]).unwrap();
        for round in 1u8..32 {
            let record = vec![round; 32 + round as usize * 97];
            id = blobs.overwrite(&mut pm, None, id, &record).unwrap();
            assert_eq!(blobs.read(&mut pm, None, id).unwrap().as_ref(), &record[..]);
        }
    }

    #[test]
    fn blob_sizes_around_the_page_size() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);
        for size in [PS - 1, PS, PS + 1] {
            let record: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
            let id = blobs.allocate(&mut pm, None, &record).unwrap();
            assert_eq!(blobs.read(&mut pm, None, id).unwrap().as_ref(), &record[..]);
        }
    }

    #[test]
    fn huge_blob_spans_many_pages() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);
        let record: Vec<u8> = (0..10 * PS + 13).map(|i| (i % 233) as u8).collect();
        let id = blobs.allocate(&mut pm, None, &record).unwrap();

        pm.flush_all_pages(false).unwrap();
        assert_eq!(blobs.read(&mut pm, None, id).unwrap().as_ref(), &record[..]);
    }

    #[test]
    fn fresh_page_remainder_serves_small_allocations() {
        let dir = tempdir().unwrap();
        let (mut pm, mut blobs) = setup(&dir);
        let first = blobs.allocate(&mut pm, None, &[1u8; 64]).unwrap();
        let size_after_first = pm.file_size();

        // the rest of that page satisfies further small blobs
        let second = blobs.allocate(&mut pm, None, &[2u8; 64]).unwrap();
        assert_eq!(second, first + (BLOB_HEADER_SIZE + 64) as u64 + 4); // rounded to chunks
        assert_eq!(pm.file_size(), size_after_first);
    }

    #[test]
    fn in_memory_flavor_matches_disk_semantics() {
        let mut pm = PageManager::new(
            Box::new(MemoryDevice::new()),
            &EnvOptions::builder().page_size(PS).in_memory(true).build(),
        );
        let mut blobs = BlobManager::new(true);

        let id = blobs.allocate(&mut pm, None, &[7u8; 64]).unwrap();
        assert_eq!(blobs.read(&mut pm, None, id).unwrap().as_ref(), &[7u8; 64][..]);

        let same = blobs.overwrite(&mut pm, None, id, &[8u8; 64]).unwrap();
        assert_eq!(same, id);
        let moved = blobs.overwrite(&mut pm, None, id, &[9u8; 256]).unwrap();
        assert_ne!(moved, id);

        blobs.free(&mut pm, None, moved).unwrap();
        assert_eq!(blobs.read(&mut pm, None, moved).unwrap_err().code(), 3);
    }
}
