//! The environment: one paged file (or arena), its page cache,
//! freelist, blob store and write-ahead log, plus the databases that
//! live inside it.
//!
//! A single writer owns the `Environment` mutably; every mutating
//! operation collects its dirty pages in the changeset and commits
//! them atomically with the journal. Opening with recovery enabled
//! replays whatever a crash left in the log files.

mod cursor;
mod database;
mod header;


pub use cursor::{Cursor, CursorId, CursorState};
pub use database::{DatabaseState, DirEntry};
pub use header::{DbSlot, EnvHeader};

use bytes::Bytes;
use common::{
    Address, BLOB_INLINE_THRESHOLD, DbError, DbId, DbResult, EnvMetrics, EnvOptions,
    MIN_PAGE_SIZE, Txn,
};
use device::{Device, FileDevice, MemoryDevice};
use journal::Journal;
use pager::{ALLOC_CLEAR_WITH_ZERO, ALLOC_IGNORE_FREELIST, BlobManager, PageManager, PageType};
use std::collections::BTreeMap;
use std::path::Path;

/// An open environment.
pub struct Environment {
    opts: EnvOptions,
    pager: PageManager,
    blobs: BlobManager,
    journal: Option<Journal>,
    header: EnvHeader,
    databases: BTreeMap<DbId, DatabaseState>,
    cursors: Vec<Option<Cursor>>,
    next_txn_id: u64,
    poisoned: bool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("opts", &self.opts)
            .field("header", &self.header)
            .field("next_txn_id", &self.next_txn_id)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Create a new environment, truncating an existing file.
    pub fn create(path: &Path, opts: EnvOptions) -> DbResult<Self> {
        opts.validate()?;
        reject_remote(path)?;
        if EnvHeader::byte_len(opts.max_databases) > opts.page_size {
            return Err(DbError::InvalidParameter(
                "name table does not fit in one page".into(),
            ));
        }

        let device: Box<dyn Device> = if opts.in_memory {
            Box::new(MemoryDevice::new())
        } else {
            Box::new(FileDevice::create(path, opts.disable_mmap)?)
        };
        let mut pager = PageManager::new(device, &opts);
        pager.enable_freelist(0);
        let header_addr = pager.alloc_page(
            None,
            PageType::Header,
            ALLOC_IGNORE_FREELIST | ALLOC_CLEAR_WITH_ZERO,
        )?;
        debug_assert_eq!(header_addr, 0);

        let journal = if opts.enable_recovery {
            Some(Journal::create(path)?)
        } else {
            None
        };

        let header = EnvHeader::new(opts.page_size as u32, opts.max_databases as u32);
        let mut env = Self {
            blobs: BlobManager::new(opts.in_memory),
            opts,
            pager,
            journal,
            header,
            databases: BTreeMap::new(),
            cursors: Vec::new(),
            next_txn_id: 1,
            poisoned: false,
        };
        env.write_header()?;
        env.finish_mutation(None)?;
        Ok(env)
    }

    /// Open an existing environment, replaying the journal first when
    /// recovery is enabled.
    pub fn open(path: &Path, opts: EnvOptions) -> DbResult<Self> {
        opts.validate()?;
        reject_remote(path)?;
        if opts.in_memory {
            return Err(DbError::InvalidParameter(
                "an in-memory environment cannot be reopened".into(),
            ));
        }
        if !opts.enable_recovery && Journal::exists_nonempty(path) {
            return Err(DbError::NeedRecovery);
        }

        let mut device = FileDevice::open(path, opts.disable_mmap, opts.read_only)?;
        if device.file_size() < MIN_PAGE_SIZE as u64 {
            return Err(DbError::IntegrityViolated(
                "file too small for a header page".into(),
            ));
        }

        // probe the fixed fields first; the page size governs all
        // further I/O and is immutable, so replay cannot change it
        let mut probe = vec![0u8; header::ENV_HEADER_SIZE];
        device.read(0, &mut probe)?;
        let fixed = EnvHeader::decode(&probe)?;
        let page_size = fixed.page_size as usize;
        if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE {
            return Err(DbError::IntegrityViolated(format!(
                "implausible page size {page_size} in header"
            )));
        }

        let mut journal = if opts.enable_recovery {
            let mut journal = if Journal::exists_nonempty(path)
                || std::fs::metadata(log_path(path, 0)).is_ok()
            {
                Journal::open(path)?
            } else {
                Journal::create(path)?
            };
            if !journal.is_empty()? {
                journal.recover(&mut device, page_size)?;
            }
            Some(journal)
        } else {
            None
        };

        // now the durable header is final; read the whole page
        let mut page0 = vec![0u8; page_size];
        device.read(0, &mut page0)?;
        let header = EnvHeader::decode(&page0)?;

        let mut eff_opts = opts.clone();
        eff_opts.page_size = page_size;
        eff_opts.max_databases = header.max_databases as usize;

        let mut pager = PageManager::new(Box::new(device), &eff_opts);
        pager.enable_freelist(header.first_freelist_page);
        let mut blobs = BlobManager::new(false);
        pager.load_state(&mut blobs, header.pagemap_blob_id)?;
        pager.clear_changeset();
        if let Some(journal) = journal.as_mut() {
            journal.sync()?;
        }

        Ok(Self {
            opts: eff_opts,
            pager,
            blobs,
            journal,
            header,
            databases: BTreeMap::new(),
            cursors: Vec::new(),
            next_txn_id: 1,
            poisoned: false,
        })
    }

    /// Flush everything, reclaim trailing free space, clear the
    /// journal and tear the environment down.
    pub fn close(mut self) -> DbResult<()> {
        if self.poisoned {
            // nothing in memory can be trusted; leave the file as the
            // last successful flush left it
            return Ok(());
        }
        // forget whatever an unfinished transaction left behind
        if !self.pager.changeset_is_empty() {
            self.pager.discard_changeset();
        }

        if !self.opts.auto_cleanup && !self.databases.is_empty() {
            return Err(DbError::InvalidParameter(
                "databases are still open; close them or set auto_cleanup".into(),
            ));
        }
        let names: Vec<u32> = self.databases.keys().map(|db| db.0).collect();
        for name in names {
            self.close_database(name)?;
        }

        if !self.opts.in_memory && !self.opts.read_only {
            self.pager.flush_all_pages(true)?;
            if !self.opts.disable_reclaim {
                self.pager.reclaim_space()?;
            }
            self.header.pagemap_blob_id = self.pager.store_state(&mut self.blobs)?;
            self.header.first_freelist_page = self.pager.freelist_first_page();
            self.write_header()?;
            self.pager.clear_changeset();
        }
        self.pager.close(false)?;

        if let Some(mut journal) = self.journal.take() {
            journal.clear()?;
            journal.close()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // databases

    /// Create a database under `name` (nonzero) and open it.
    pub fn create_database(&mut self, name: u32) -> DbResult<DbId> {
        self.guard()?;
        self.writable()?;
        if name == 0 {
            return Err(DbError::InvalidParameter("database name 0 is reserved".into()));
        }
        if self.header.slots.iter().any(|slot| slot.name == name) {
            return Err(DbError::DuplicateKey);
        }
        let Some(slot) = self.header.slots.iter_mut().find(|slot| slot.name == 0) else {
            return Err(DbError::InvalidParameter("database name table is full".into()));
        };
        slot.name = name;
        slot.dir_blob_id = 0;
        self.write_header()?;
        self.finish_mutation(None)?;
        self.databases.insert(DbId(name), DatabaseState::default());
        Ok(DbId(name))
    }

    /// Open an existing database.
    pub fn open_database(&mut self, name: u32) -> DbResult<DbId> {
        self.guard()?;
        let db = DbId(name);
        if self.databases.contains_key(&db) {
            return Ok(db);
        }
        let Some(slot) = self.header.slots.iter().find(|slot| slot.name == name) else {
            return Err(DbError::DatabaseNotFound);
        };
        let blob_id = slot.dir_blob_id;
        let state = if blob_id != 0 {
            let data = self.blobs.read(&mut self.pager, Some(db), blob_id)?;
            let result = DatabaseState::decode(&data);
            self.poison(result)?
        } else {
            DatabaseState::default()
        };
        self.pager.clear_changeset();
        self.databases.insert(db, state);
        Ok(db)
    }

    /// Persist the database's directory and drop its pages from the
    /// cache.
    pub fn close_database(&mut self, name: u32) -> DbResult<()> {
        self.guard()?;
        let db = DbId(name);
        if !self.databases.contains_key(&db) {
            return Err(DbError::DatabaseNotFound);
        }
        if !self.opts.read_only {
            self.persist_directory(db)?;
            self.finish_mutation(None)?;
        }
        self.cursors
            .iter_mut()
            .filter(|slot| slot.as_ref().is_some_and(|c| c.db == db))
            .for_each(|slot| *slot = None);
        self.pager.close_database(db)?;
        self.databases.remove(&db);
        Ok(())
    }

    /// Erase a closed database: its records, its directory blob and
    /// its name table slot.
    pub fn erase_database(&mut self, name: u32) -> DbResult<()> {
        self.guard()?;
        self.writable()?;
        let db = DbId(name);
        if self.databases.contains_key(&db) {
            return Err(DbError::InvalidParameter(
                "cannot erase an open database".into(),
            ));
        }
        let Some(slot) = self.header.slots.iter_mut().find(|slot| slot.name == name) else {
            return Err(DbError::DatabaseNotFound);
        };
        let blob_id = slot.dir_blob_id;
        slot.name = 0;
        slot.dir_blob_id = 0;

        if blob_id != 0 {
            let data = self.blobs.read(&mut self.pager, Some(db), blob_id)?;
            let state = {
                let result = DatabaseState::decode(&data);
                self.poison(result)?
            };
            for entry in state.directory.values() {
                if let DirEntry::Blob(id) = entry {
                    self.blobs.free(&mut self.pager, Some(db), *id)?;
                }
            }
            self.blobs.free(&mut self.pager, Some(db), blob_id)?;
        }
        self.write_header()?;
        self.finish_mutation(None)
    }

    /// Names currently present in the name table.
    pub fn database_names(&self) -> Vec<u32> {
        self.header
            .slots
            .iter()
            .filter(|slot| slot.name != 0)
            .map(|slot| slot.name)
            .collect()
    }

    // ------------------------------------------------------------------
    // records

    /// Store `value` under `key`, overwriting any previous value.
    pub fn put(
        &mut self,
        db: DbId,
        txn: Option<&mut Txn>,
        key: &[u8],
        value: &[u8],
    ) -> DbResult<()> {
        self.guard()?;
        self.writable()?;
        if !self.databases.contains_key(&db) {
            return Err(DbError::DatabaseNotFound);
        }
        self.purge()?;
        let result = self.put_inner(db, key, value);
        match result {
            Ok(()) => self.finish_mutation(txn),
            Err(e) => {
                self.rollback_operation()?;
                Err(e)
            }
        }
    }

    /// Like [`put`](Self::put) but fails on an existing key.
    pub fn insert(
        &mut self,
        db: DbId,
        txn: Option<&mut Txn>,
        key: &[u8],
        value: &[u8],
    ) -> DbResult<()> {
        self.guard()?;
        let state = self.databases.get(&db).ok_or(DbError::DatabaseNotFound)?;
        if state.directory.contains_key(key) {
            return Err(DbError::DuplicateKey);
        }
        self.put(db, txn, key, value)
    }

    /// Look up `key`.
    pub fn get(&mut self, db: DbId, key: &[u8]) -> DbResult<Bytes> {
        self.guard()?;
        let state = self.databases.get(&db).ok_or(DbError::DatabaseNotFound)?;
        match state.directory.get(key) {
            None => Err(DbError::KeyNotFound),
            Some(DirEntry::Inline(bytes)) => Ok(Bytes::copy_from_slice(bytes)),
            Some(DirEntry::Blob(id)) => {
                let id = *id;
                let result = self.blobs.read(&mut self.pager, Some(db), id);
                self.poison(result)
            }
        }
    }

    /// Remove `key` and release its blob.
    pub fn erase(&mut self, db: DbId, txn: Option<&mut Txn>, key: &[u8]) -> DbResult<()> {
        self.guard()?;
        self.writable()?;
        self.purge()?;
        let result = self.erase_inner(db, key);
        match result {
            Ok(()) => self.finish_mutation(txn),
            Err(e) => {
                if matches!(e, DbError::KeyNotFound | DbError::DatabaseNotFound) {
                    return Err(e); // no side effects to roll back
                }
                self.rollback_operation()?;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // transactions

    /// Begin an explicit transaction.
    pub fn txn_begin(&mut self) -> DbResult<Txn> {
        self.guard()?;
        if !self.opts.enable_transactions {
            return Err(DbError::InvalidParameter(
                "transactions are not enabled for this environment".into(),
            ));
        }
        let mut txn = Txn::new(self.next_txn_id);
        self.next_txn_id += 1;
        if let Some(journal) = self.journal.as_mut() {
            journal.append_txn_begin(&mut txn)?;
        }
        Ok(txn)
    }

    /// Commit: journal first, then the dirty pages, then clear the
    /// changeset.
    pub fn txn_commit(&mut self, mut txn: Txn) -> DbResult<()> {
        self.guard()?;
        self.commit_changeset(&mut txn)
    }

    /// Abort: log the abort, drop the uncommitted pages, reload the
    /// in-memory state they backed.
    pub fn txn_abort(&mut self, mut txn: Txn) -> DbResult<()> {
        self.guard()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.append_txn_abort(&mut txn)?;
        }
        self.rollback_operation()
    }

    // ------------------------------------------------------------------
    // cursors

    pub fn cursor_create(&mut self, db: DbId) -> DbResult<CursorId> {
        self.guard()?;
        if !self.databases.contains_key(&db) {
            return Err(DbError::DatabaseNotFound);
        }
        let cursor = Cursor::new(db);
        if let Some(idx) = self.cursors.iter().position(|slot| slot.is_none()) {
            self.cursors[idx] = Some(cursor);
            Ok(CursorId(idx))
        } else {
            self.cursors.push(Some(cursor));
            Ok(CursorId(self.cursors.len() - 1))
        }
    }

    pub fn cursor_close(&mut self, cursor: CursorId) -> DbResult<()> {
        let slot = self
            .cursors
            .get_mut(cursor.0)
            .ok_or_else(bad_cursor)?;
        if slot.take().is_none() {
            return Err(bad_cursor());
        }
        Ok(())
    }

    /// Position the cursor on `key` and return its value.
    pub fn cursor_find(&mut self, cursor: CursorId, key: &[u8]) -> DbResult<Bytes> {
        let db = self.cursor_db(cursor)?;
        let value = self.get(db, key)?;
        let state = self.couple_state(db, key);
        self.set_cursor_state(cursor, state);
        Ok(value)
    }

    /// Insert through the cursor, leaving it positioned on the key.
    pub fn cursor_insert(
        &mut self,
        cursor: CursorId,
        txn: Option<&mut Txn>,
        key: &[u8],
        value: &[u8],
    ) -> DbResult<()> {
        let db = self.cursor_db(cursor)?;
        self.put(db, txn, key, value)?;
        let state = self.couple_state(db, key);
        self.set_cursor_state(cursor, state);
        Ok(())
    }

    /// Erase the record the cursor stands on.
    pub fn cursor_erase(&mut self, cursor: CursorId, txn: Option<&mut Txn>) -> DbResult<()> {
        let db = self.cursor_db(cursor)?;
        let key = self
            .cursor_key(cursor)?
            .ok_or_else(|| DbError::InvalidParameter("cursor is not positioned".into()))?;
        self.erase(db, txn, &key)?;
        self.set_cursor_state(cursor, CursorState::Nil);
        Ok(())
    }

    /// Advance to the next key in order; from `Nil` this is the first
    /// key. Returns `KeyNotFound` past the end.
    pub fn cursor_next(&mut self, cursor: CursorId) -> DbResult<(Vec<u8>, Bytes)> {
        let db = self.cursor_db(cursor)?;
        let current = self.cursor_key(cursor)?;
        let state = self.databases.get(&db).ok_or(DbError::DatabaseNotFound)?;
        let next = match current {
            None => state.directory.keys().next().cloned(),
            Some(key) => state
                .directory
                .range((
                    std::ops::Bound::Excluded(key),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .map(|(k, _)| k.clone()),
        };
        let Some(key) = next else {
            self.set_cursor_state(cursor, CursorState::Nil);
            return Err(DbError::KeyNotFound);
        };
        let value = self.get(db, &key)?;
        let state = self.couple_state(db, &key);
        self.set_cursor_state(cursor, state);
        Ok((key, value))
    }

    // ------------------------------------------------------------------
    // introspection

    pub fn cache_is_full(&self) -> bool {
        self.pager.cache_is_full()
    }

    pub fn get_metrics(&mut self) -> DbResult<EnvMetrics> {
        self.pager.collect_metrics()
    }

    pub fn options(&self) -> &EnvOptions {
        &self.opts
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Rotation threshold of the journal, in closed transactions per
    /// file.
    pub fn set_journal_threshold(&mut self, threshold: u32) {
        if let Some(journal) = self.journal.as_mut() {
            journal.set_threshold(threshold);
        }
    }

    pub fn journal(&mut self) -> Option<&mut Journal> {
        self.journal.as_mut()
    }

    // ------------------------------------------------------------------
    // internals

    fn put_inner(&mut self, db: DbId, key: &[u8], value: &[u8]) -> DbResult<()> {
        let existing = {
            let state = self.databases.get(&db).ok_or(DbError::DatabaseNotFound)?;
            state.directory.get(key).cloned()
        };
        self.uncouple_db_cursors(db);

        let entry = if value.len() < BLOB_INLINE_THRESHOLD {
            if let Some(DirEntry::Blob(id)) = existing {
                let result = self.blobs.free(&mut self.pager, Some(db), id);
                self.poison(result)?;
            }
            DirEntry::Inline(value.to_vec())
        } else {
            let result = match existing {
                Some(DirEntry::Blob(id)) => {
                    self.blobs.overwrite(&mut self.pager, Some(db), id, value)
                }
                _ => self.blobs.allocate(&mut self.pager, Some(db), value),
            };
            DirEntry::Blob(self.poison(result)?)
        };

        let state = self.databases.get_mut(&db).unwrap();
        state.directory.insert(key.to_vec(), entry);
        state.dirty = true;
        self.persist_directory(db)
    }

    fn erase_inner(&mut self, db: DbId, key: &[u8]) -> DbResult<()> {
        {
            let state = self.databases.get(&db).ok_or(DbError::DatabaseNotFound)?;
            if !state.directory.contains_key(key) {
                return Err(DbError::KeyNotFound);
            }
        }
        // capture cursor keys while their slots still hold
        self.uncouple_db_cursors(db);
        let entry = {
            let state = self.databases.get_mut(&db).unwrap();
            state.directory.remove(key).unwrap()
        };
        if let DirEntry::Blob(id) = entry {
            let result = self.blobs.free(&mut self.pager, Some(db), id);
            self.poison(result)?;
        }
        let state = self.databases.get_mut(&db).unwrap();
        state.dirty = true;
        self.persist_directory(db)
    }

    /// Rewrite the database's directory blob and, if its id moved,
    /// the name table slot pointing at it.
    fn persist_directory(&mut self, db: DbId) -> DbResult<()> {
        if self.opts.read_only {
            return Ok(());
        }
        let bytes = {
            let state = self.databases.get(&db).ok_or(DbError::DatabaseNotFound)?;
            if !state.dirty {
                return Ok(());
            }
            state.encode()?
        };
        let slot = self
            .header
            .slots
            .iter()
            .find(|slot| slot.name == db.0)
            .ok_or(DbError::DatabaseNotFound)?;
        let old_id = slot.dir_blob_id;

        let result = if old_id != 0 {
            self.blobs.overwrite(&mut self.pager, Some(db), old_id, &bytes)
        } else {
            self.blobs.allocate(&mut self.pager, Some(db), &bytes)
        };
        let new_id = self.poison(result)?;
        if new_id != old_id {
            let slot = self
                .header
                .slots
                .iter_mut()
                .find(|slot| slot.name == db.0)
                .unwrap();
            slot.dir_blob_id = new_id;
            self.write_header()?;
        }
        self.databases.get_mut(&db).unwrap().dirty = false;
        Ok(())
    }

    /// Encode the header mirror into page 0.
    fn write_header(&mut self) -> DbResult<()> {
        let page = self.pager.fetch_page(None, 0, false)?;
        self.header.encode_into(page.data_mut());
        page.set_dirty(true);
        Ok(())
    }

    /// End a mutating operation: under an explicit transaction, log
    /// the touched page images and keep accumulating; otherwise wrap
    /// the operation in an implicit transaction and commit now.
    fn finish_mutation(&mut self, txn: Option<&mut Txn>) -> DbResult<()> {
        match txn {
            Some(txn) => {
                if self.journal.is_some() {
                    self.append_changeset_images(txn)?;
                }
                Ok(())
            }
            None => {
                let mut txn = Txn::new(self.next_txn_id);
                self.next_txn_id += 1;
                if let Some(journal) = self.journal.as_mut() {
                    journal.append_txn_begin(&mut txn)?;
                }
                self.commit_changeset(&mut txn)
            }
        }
    }

    /// Append a redo image of every changeset page to the journal.
    fn append_changeset_images(&mut self, txn: &mut Txn) -> DbResult<()> {
        let addresses = self.pager.changeset_addresses();
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        for address in addresses {
            let page = self.pager.fetch_page(None, address, true)?;
            journal.append_write(txn, address, page.data())?;
        }
        Ok(())
    }

    /// The write-ahead edge: force the journal up to the commit
    /// record, then flush the dirty pages, then clear the changeset.
    fn commit_changeset(&mut self, txn: &mut Txn) -> DbResult<()> {
        if self.journal.is_some() {
            // the page-map blob must ride in this commit's images, or
            // replay would resurrect freelist state the transaction
            // already consumed
            let blob_id = self.pager.store_state(&mut self.blobs)?;
            if blob_id != self.header.pagemap_blob_id {
                self.header.pagemap_blob_id = blob_id;
                self.write_header()?;
            }
            self.append_changeset_images(txn)?;
        }
        let addresses = self.pager.changeset_addresses();
        if let Some(journal) = self.journal.as_mut() {
            let lsn = journal.append_txn_commit(txn)?;
            self.pager.stamp_changeset(lsn);
        }
        for &address in &addresses {
            self.pager.flush_page(address)?;
        }
        if let Some(journal) = self.journal.as_mut() {
            for &address in &addresses {
                journal.append_flush_page(address)?;
            }
        }
        self.pager.clear_changeset();
        Ok(())
    }

    /// Opportunistic eviction pass at the start of mutating
    /// operations, once the cache exceeds its budget.
    fn purge(&mut self) -> DbResult<()> {
        let evicted = self.pager.purge_cache()?;
        self.uncouple_for_addresses(&evicted);
        Ok(())
    }

    /// Forget an operation's half-done state: drop its pages unflushed
    /// and reload the header and open directories from disk.
    fn rollback_operation(&mut self) -> DbResult<()> {
        self.pager.discard_changeset();
        if !self.opts.in_memory {
            let data = {
                let page = self.pager.fetch_page(None, 0, false)?;
                page.data().to_vec()
            };
            let result = EnvHeader::decode(&data);
            self.header = self.poison(result)?;

            let dbs: Vec<DbId> = self.databases.keys().copied().collect();
            for db in dbs {
                let blob_id = self
                    .header
                    .slots
                    .iter()
                    .find(|slot| slot.name == db.0)
                    .map(|slot| slot.dir_blob_id)
                    .unwrap_or(0);
                let state = if blob_id != 0 {
                    let data = self.blobs.read(&mut self.pager, Some(db), blob_id)?;
                    let result = DatabaseState::decode(&data);
                    self.poison(result)?
                } else {
                    DatabaseState::default()
                };
                self.databases.insert(db, state);
            }
        }
        for cursor in self.cursors.iter_mut().flatten() {
            cursor.state = CursorState::Nil;
        }
        self.pager.clear_changeset();
        Ok(())
    }

    fn couple_state(&self, db: DbId, key: &[u8]) -> CursorState {
        let Some(state) = self.databases.get(&db) else {
            return CursorState::Nil;
        };
        match state.directory.get(key) {
            Some(DirEntry::Blob(id)) => {
                let page_size = self.pager.page_size() as u64;
                CursorState::Coupled {
                    address: id - id % page_size,
                    slot: state.slot_of(key).unwrap_or(0),
                }
            }
            // inline records have no page to couple to
            Some(DirEntry::Inline(_)) => CursorState::Uncoupled { key: key.to_vec() },
            None => CursorState::Nil,
        }
    }

    fn cursor_db(&self, cursor: CursorId) -> DbResult<DbId> {
        self.cursors
            .get(cursor.0)
            .and_then(|slot| slot.as_ref())
            .map(|c| c.db)
            .ok_or_else(bad_cursor)
    }

    /// The key the cursor currently stands on, if any.
    fn cursor_key(&self, cursor: CursorId) -> DbResult<Option<Vec<u8>>> {
        let c = self
            .cursors
            .get(cursor.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(bad_cursor)?;
        Ok(match &c.state {
            CursorState::Nil => None,
            CursorState::Uncoupled { key } => Some(key.clone()),
            CursorState::Coupled { slot, .. } => self
                .databases
                .get(&c.db)
                .and_then(|state| state.key_at(*slot))
                .map(|k| k.to_vec()),
        })
    }

    fn set_cursor_state(&mut self, cursor: CursorId, state: CursorState) {
        if let Some(c) = self.cursors.get_mut(cursor.0).and_then(|s| s.as_mut()) {
            c.state = state;
        }
    }

    /// Uncouple every cursor of `db`, capturing current keys; called
    /// before the directory shifts underneath their slots.
    fn uncouple_db_cursors(&mut self, db: DbId) {
        let Some(state) = self.databases.get(&db) else {
            return;
        };
        for cursor in self.cursors.iter_mut().flatten() {
            if cursor.db != db {
                continue;
            }
            if let CursorState::Coupled { slot, .. } = cursor.state {
                cursor.state = match state.key_at(slot) {
                    Some(key) => CursorState::Uncoupled { key: key.to_vec() },
                    None => CursorState::Nil,
                };
            }
        }
    }

    /// Uncouple cursors whose page was just evicted.
    fn uncouple_for_addresses(&mut self, evicted: &[Address]) {
        if evicted.is_empty() {
            return;
        }
        for cursor in self.cursors.iter_mut().flatten() {
            let CursorState::Coupled { address, slot } = cursor.state else {
                continue;
            };
            if !evicted.contains(&address) {
                continue;
            }
            let key = self
                .databases
                .get(&cursor.db)
                .and_then(|state| state.key_at(slot))
                .map(|k| k.to_vec());
            cursor.state = match key {
                Some(key) => CursorState::Uncoupled { key },
                None => CursorState::Nil,
            };
        }
    }

    fn guard(&self) -> DbResult<()> {
        if self.poisoned {
            return Err(DbError::IntegrityViolated(
                "environment is poisoned by an earlier corruption".into(),
            ));
        }
        Ok(())
    }

    fn writable(&self) -> DbResult<()> {
        if self.opts.read_only {
            return Err(DbError::InvalidParameter(
                "environment is opened read-only".into(),
            ));
        }
        Ok(())
    }

    /// Corruption is fatal: mark the environment so every later call
    /// short-circuits.
    fn poison<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(DbError::IntegrityViolated(_)) = &result {
            self.poisoned = true;
        }
        result
    }
}

fn bad_cursor() -> DbError {
    DbError::InvalidParameter("unknown cursor handle".into())
}

fn reject_remote(path: &Path) -> DbResult<()> {
    if path.to_string_lossy().starts_with("remote://") {
        return Err(DbError::InvalidParameter(
            "remote environments require the network front-end".into(),
        ));
    }
    Ok(())
}

fn log_path(base: &Path, idx: usize) -> std::path::PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(format!(".log{idx}"));
    std::path::PathBuf::from(s)
}
