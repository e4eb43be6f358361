//! Write-ahead log for crash recovery.
//!
//! Two log files per environment (`<path>.log0`, `<path>.log1`) are
//! rotated by a closed-transaction threshold. Every entry carries a
//! strictly monotonic LSN and, for transactional records, the LSN of
//! the transaction's previous record, forming a per-transaction
//! back-chain.
//!
//! A record reaches the log before the page it describes reaches the
//! device; replay after a crash redoes the records of committed
//! transactions and undoes the in-place overwrites of uncommitted ones.


use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{Address, DbError, DbResult, Txn};
use device::Device;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const JOURNAL_MAGIC: u32 = 0x314c_4a47; // "GJL1"
const JOURNAL_VERSION: u32 = 1;

/// Bytes occupied by the file header (magic + version).
pub const FILE_HEADER_SIZE: u64 = 8;

/// Bytes occupied by a serialized [`EntryHeader`].
pub const ENTRY_HEADER_SIZE: usize = 45;

/// Closed transactions per file before the writer rotates.
pub const DEFAULT_THRESHOLD: u32 = 32;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// Discriminates journal entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    TxnBegin = 1,
    TxnCommit = 2,
    TxnAbort = 3,
    Checkpoint = 4,
    FlushPage = 5,
    Write = 6,
    Overwrite = 7,
}

impl TryFrom<u8> for RecordKind {
    type Error = DbError;

    fn try_from(value: u8) -> DbResult<Self> {
        Ok(match value {
            1 => RecordKind::TxnBegin,
            2 => RecordKind::TxnCommit,
            3 => RecordKind::TxnAbort,
            4 => RecordKind::Checkpoint,
            5 => RecordKind::FlushPage,
            6 => RecordKind::Write,
            7 => RecordKind::Overwrite,
            other => {
                return Err(DbError::IntegrityViolated(format!(
                    "unknown journal record kind {other}"
                )));
            }
        })
    }
}

/// Fixed-size on-disk entry header; the payload follows unframed.
///
/// `data_size` is the length of the written bytes; an `Overwrite`
/// entry's payload holds the old image then the new one, each
/// `data_size` long.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct EntryHeader {
    lsn: u64,
    prev_lsn: u64,
    txn_id: u64,
    kind: u8,
    flags: u32,
    offset: u64,
    data_size: u64,
}

/// A decoded journal entry, header plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub lsn: u64,
    pub prev_lsn: u64,
    pub txn_id: u64,
    pub kind: RecordKind,
    pub flags: u32,
    pub offset: Address,
    pub data_size: u64,
    pub payload: Vec<u8>,
}

/// The two-file write-ahead log.
#[derive(Debug)]
pub struct Journal {
    files: [File; 2],
    paths: [PathBuf; 2],
    current: usize,
    next_lsn: u64,
    threshold: u32,
    open_txns: [u32; 2],
    closed_txns: [u32; 2],
}

impl Journal {
    fn log_paths(base: &Path) -> [PathBuf; 2] {
        let mut s0 = base.as_os_str().to_owned();
        let mut s1 = s0.clone();
        s0.push(".log0");
        s1.push(".log1");
        [PathBuf::from(s0), PathBuf::from(s1)]
    }

    /// True if a previous environment left non-empty log files behind.
    pub fn exists_nonempty(base: &Path) -> bool {
        Self::log_paths(base).iter().any(|p| {
            std::fs::metadata(p)
                .map(|m| m.len() > FILE_HEADER_SIZE)
                .unwrap_or(false)
        })
    }

    /// Create both log files, truncating any leftovers.
    pub fn create(base: &Path) -> DbResult<Self> {
        let paths = Self::log_paths(base);
        let mut files = Vec::with_capacity(2);
        for path in &paths {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            write_file_header(&mut file)?;
            files.push(file);
        }
        let files: [File; 2] = files.try_into().expect("two log files");
        Ok(Self {
            files,
            paths,
            current: 0,
            next_lsn: 1,
            threshold: DEFAULT_THRESHOLD,
            open_txns: [0; 2],
            closed_txns: [0; 2],
        })
    }

    /// Open existing log files, validating both headers.
    pub fn open(base: &Path) -> DbResult<Self> {
        let paths = Self::log_paths(base);
        let mut files = Vec::with_capacity(2);
        for path in &paths {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        DbError::FileNotFound(path.display().to_string())
                    }
                    _ => DbError::Io(e),
                })?;
            check_file_header(&mut file)?;
            files.push(file);
        }
        let files: [File; 2] = files.try_into().expect("two log files");
        Ok(Self {
            files,
            paths,
            current: 0,
            next_lsn: 1,
            threshold: DEFAULT_THRESHOLD,
            open_txns: [0; 2],
            closed_txns: [0; 2],
        })
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Index of the file currently appended to (0 or 1).
    pub fn current_file(&self) -> usize {
        self.current
    }

    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    pub fn set_next_lsn(&mut self, lsn: u64) {
        self.next_lsn = lsn;
    }

    /// True when neither file holds entries past its header.
    pub fn is_empty(&self) -> DbResult<bool> {
        for file in &self.files {
            if file.metadata()?.len() > FILE_HEADER_SIZE {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn append_txn_begin(&mut self, txn: &mut Txn) -> DbResult<u64> {
        let lsn = self.append(RecordKind::TxnBegin, Some(txn), 0, 0, &[])?;
        self.open_txns[self.current] += 1;
        Ok(lsn)
    }

    pub fn append_txn_commit(&mut self, txn: &mut Txn) -> DbResult<u64> {
        let lsn = self.append(RecordKind::TxnCommit, Some(txn), 0, 0, &[])?;
        self.files[self.current].sync_all()?;
        self.close_txn()?;
        Ok(lsn)
    }

    pub fn append_txn_abort(&mut self, txn: &mut Txn) -> DbResult<u64> {
        let lsn = self.append(RecordKind::TxnAbort, Some(txn), 0, 0, &[])?;
        self.close_txn()?;
        Ok(lsn)
    }

    /// Redo record: `data` was written at `offset`.
    pub fn append_write(&mut self, txn: &mut Txn, offset: Address, data: &[u8]) -> DbResult<u64> {
        self.append(RecordKind::Write, Some(txn), offset, data.len() as u64, &[data])
    }

    /// Redo+undo record: `offset` held `old` and now holds `new`.
    pub fn append_overwrite(
        &mut self,
        txn: &mut Txn,
        offset: Address,
        old: &[u8],
        new: &[u8],
    ) -> DbResult<u64> {
        if old.len() != new.len() {
            return Err(DbError::InvalidParameter(
                "overwrite images must have equal length".into(),
            ));
        }
        self.append(
            RecordKind::Overwrite,
            Some(txn),
            offset,
            old.len() as u64,
            &[old, new],
        )
    }

    /// Marks the page at `address` as durably written.
    pub fn append_flush_page(&mut self, address: Address) -> DbResult<u64> {
        self.append(RecordKind::FlushPage, None, address, 0, &[])
    }

    pub fn append_checkpoint(&mut self) -> DbResult<u64> {
        self.append(RecordKind::Checkpoint, None, 0, 0, &[])
    }

    /// Fsync both files.
    pub fn sync(&mut self) -> DbResult<()> {
        for file in &self.files {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Drop all entries, keeping the file headers. The LSN counter is
    /// not reset; it stays monotonic for the environment's lifetime.
    pub fn clear(&mut self) -> DbResult<()> {
        for file in &mut self.files {
            file.set_len(FILE_HEADER_SIZE)?;
            file.sync_all()?;
        }
        self.current = 0;
        self.open_txns = [0; 2];
        self.closed_txns = [0; 2];
        Ok(())
    }

    pub fn close(mut self) -> DbResult<()> {
        self.sync()
    }

    /// Sequentially decode one file's entries.
    ///
    /// A torn tail (an entry overrunning the file end) is truncated to
    /// the last good boundary; everything before it is returned.
    pub fn read_entries(&mut self, file_idx: usize) -> DbResult<Vec<JournalEntry>> {
        let file = &mut self.files[file_idx];
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;

        if buf.len() < FILE_HEADER_SIZE as usize {
            return Err(DbError::LogInvalidFileHeader);
        }
        decode_file_header(&buf[..FILE_HEADER_SIZE as usize])?;

        let mut entries = Vec::new();
        let mut pos = FILE_HEADER_SIZE as usize;
        let mut good = pos;
        loop {
            if pos + ENTRY_HEADER_SIZE > buf.len() {
                break;
            }
            let (header, _): (EntryHeader, usize) =
                decode_from_slice(&buf[pos..pos + ENTRY_HEADER_SIZE], bincode_config())
                    .map_err(|e| DbError::IntegrityViolated(format!("journal entry: {e}")))?;
            let kind = RecordKind::try_from(header.kind)?;
            let payload_len = match kind {
                RecordKind::Write => header.data_size as usize,
                RecordKind::Overwrite => 2 * header.data_size as usize,
                _ => 0,
            };
            let end = pos + ENTRY_HEADER_SIZE + payload_len;
            if end > buf.len() {
                break; // torn tail
            }
            entries.push(JournalEntry {
                lsn: header.lsn,
                prev_lsn: header.prev_lsn,
                txn_id: header.txn_id,
                kind,
                flags: header.flags,
                offset: header.offset,
                data_size: header.data_size,
                payload: buf[pos + ENTRY_HEADER_SIZE..end].to_vec(),
            });
            pos = end;
            good = end;
        }
        if good < buf.len() {
            let file = &mut self.files[file_idx];
            file.set_len(good as u64)?;
        }
        Ok(entries)
    }

    /// Replay both files against the device.
    ///
    /// Redoes `Write`/`Overwrite` records of committed transactions in
    /// LSN order from the newest checkpoint on; undoes the overwrites
    /// of uncommitted transactions in reverse LSN order. Afterwards
    /// both files are cleared and the LSN counter continues above the
    /// highest LSN seen.
    pub fn recover(&mut self, device: &mut dyn Device, page_size: usize) -> DbResult<u64> {
        let mut entries = self.read_entries(0)?;
        entries.extend(self.read_entries(1)?);
        entries.sort_by_key(|e| e.lsn);

        let max_lsn = entries.last().map(|e| e.lsn).unwrap_or(0);
        let checkpoint = entries
            .iter()
            .filter(|e| e.kind == RecordKind::Checkpoint)
            .map(|e| e.lsn)
            .max()
            .unwrap_or(0);
        let tail: Vec<&JournalEntry> = entries.iter().filter(|e| e.lsn > checkpoint).collect();

        let mut committed = std::collections::HashSet::new();
        for entry in &tail {
            if entry.kind == RecordKind::TxnCommit {
                committed.insert(entry.txn_id);
            }
        }

        for entry in &tail {
            let redo = match entry.kind {
                RecordKind::Write if committed.contains(&entry.txn_id) => {
                    Some(&entry.payload[..])
                }
                RecordKind::Overwrite if committed.contains(&entry.txn_id) => {
                    Some(&entry.payload[entry.data_size as usize..])
                }
                _ => None,
            };
            if let Some(data) = redo {
                ensure_size(device, entry.offset, data.len(), page_size)?;
                device.write(entry.offset, data)?;
            }
        }

        for entry in tail.iter().rev() {
            if entry.kind == RecordKind::Overwrite && !committed.contains(&entry.txn_id) {
                let old = &entry.payload[..entry.data_size as usize];
                // Skip images past the file end; the page never made it
                // to the device, so there is nothing to roll back.
                if entry.offset + old.len() as u64 <= device.file_size() {
                    device.write(entry.offset, old)?;
                }
            }
        }

        device.sync()?;
        self.clear()?;
        self.next_lsn = max_lsn + 1;
        Ok(max_lsn)
    }

    fn append(
        &mut self,
        kind: RecordKind,
        txn: Option<&mut Txn>,
        offset: Address,
        data_size: u64,
        payloads: &[&[u8]],
    ) -> DbResult<u64> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;

        let (txn_id, prev_lsn) = match &txn {
            Some(t) => (t.id, t.last_lsn),
            None => (0, 0),
        };
        let header = EntryHeader {
            lsn,
            prev_lsn,
            txn_id,
            kind: kind as u8,
            flags: 0,
            offset,
            data_size,
        };
        let bytes = encode_to_vec(header, bincode_config())
            .map_err(|e| DbError::IntegrityViolated(format!("encode journal entry: {e}")))?;
        debug_assert_eq!(bytes.len(), ENTRY_HEADER_SIZE);

        let file = &mut self.files[self.current];
        file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        for payload in payloads {
            file.write_all(payload)?;
        }
        file.flush()?;

        if let Some(t) = txn {
            t.last_lsn = lsn;
        }
        Ok(lsn)
    }

    // Bookkeeping shared by commit and abort: bump the closed counter
    // and rotate when the current file has seen enough of them and no
    // transaction is still open in it.
    fn close_txn(&mut self) -> DbResult<()> {
        let cur = self.current;
        self.open_txns[cur] = self.open_txns[cur].saturating_sub(1);
        self.closed_txns[cur] += 1;

        if self.closed_txns[cur] >= self.threshold && self.open_txns[cur] == 0 {
            self.append_checkpoint()?;
            self.files[cur].sync_all()?;

            let next = cur ^ 1;
            self.files[next].set_len(0)?;
            write_file_header(&mut self.files[next])?;
            self.open_txns[next] = 0;
            self.closed_txns[next] = 0;
            self.current = next;
        }
        Ok(())
    }
}

fn write_file_header(file: &mut File) -> DbResult<()> {
    let bytes = encode_to_vec((JOURNAL_MAGIC, JOURNAL_VERSION), bincode_config())
        .map_err(|e| DbError::IntegrityViolated(format!("encode journal header: {e}")))?;
    debug_assert_eq!(bytes.len() as u64, FILE_HEADER_SIZE);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

fn check_file_header(file: &mut File) -> DbResult<()> {
    let len = file.metadata()?.len();
    if len < FILE_HEADER_SIZE {
        return Err(DbError::LogInvalidFileHeader);
    }
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    decode_file_header(&buf)
}

fn decode_file_header(buf: &[u8]) -> DbResult<()> {
    let ((magic, version), _): ((u32, u32), usize) = decode_from_slice(buf, bincode_config())
        .map_err(|_| DbError::LogInvalidFileHeader)?;
    if magic != JOURNAL_MAGIC || version != JOURNAL_VERSION {
        return Err(DbError::LogInvalidFileHeader);
    }
    Ok(())
}

// Redo may target bytes past the current file end when the crash hit
// before the page was ever flushed; grow to the covering page boundary
// so later page reads stay in bounds.
fn ensure_size(device: &mut dyn Device, offset: Address, len: usize, page_size: usize) -> DbResult<()> {
    let ps = page_size as u64;
    let needed = (offset + len as u64).div_ceil(ps) * ps;
    let size = device.file_size();
    if needed > size {
        device.grow(needed - size)?;
    }
    Ok(())
}
