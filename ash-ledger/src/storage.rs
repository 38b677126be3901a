//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `entries` - Ledger entries (key: big-endian sequence)
//!
//! Big-endian keys make RocksDB's byte-wise iteration order equal to ledger
//! order, so `range` is a forward scan and the tail is the last key.
//!
//! # Single writer
//!
//! `append` holds the writer lock across validation and the synced write.
//! The reader-visible tail is published only after the write commits, so
//! `get`/`range`/`tail_sequence` always observe a committed prefix.

use crate::{
    audit,
    error::{Result, StoreError},
    types::{Digest, LedgerEntry, LogicalTime, StoredEntry},
    StoreConfig,
};
use parking_lot::{Mutex, RwLock};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode, Options,
    WriteOptions, DB,
};
use std::collections::VecDeque;

/// Column family names
const CF_ENTRIES: &str = "entries";

/// Entries fetched per scan in `LedgerRange`
const RANGE_CHUNK: usize = 256;

/// Position of the last committed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTail {
    /// Sequence of the last entry (0 when empty)
    pub sequence: u64,
    /// Hash of the last entry (zero when empty)
    pub hash: Digest,
    /// Acceptance time of the last entry
    pub accepted_at: LogicalTime,
}

impl ChainTail {
    const EMPTY: ChainTail = ChainTail {
        sequence: 0,
        hash: Digest::ZERO,
        accepted_at: LogicalTime {
            physical_ms: 0,
            logical: 0,
        },
    };

    fn of(entry: &LedgerEntry) -> Self {
        Self {
            sequence: entry.sequence,
            hash: entry.hash(),
            accepted_at: entry.accepted_at,
        }
    }
}

/// Append-only ledger on RocksDB
pub struct LedgerStore {
    db: DB,
    /// Writer-side tail, held for the whole of `append`
    writer: Mutex<ChainTail>,
    /// Reader-side tail, advanced after commit
    published: RwLock<ChainTail>,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("path", &self.db.path())
            .field("tail", &*self.published.read())
            .finish()
    }
}

impl LedgerStore {
    /// Open or create database
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut cf_opts = Options::default();
        if config.rocksdb.compress {
            cf_opts.set_compression_type(DBCompressionType::Lz4);
        } else {
            cf_opts.set_compression_type(DBCompressionType::None);
        }

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(CF_ENTRIES, cf_opts)];
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let mut store = Self {
            db,
            writer: Mutex::new(ChainTail::EMPTY),
            published: RwLock::new(ChainTail::EMPTY),
        };

        let tail = store.recover_tail()?;
        *store.writer.get_mut() = tail;
        *store.published.get_mut() = tail;

        tracing::info!(
            path = ?path,
            tail_sequence = tail.sequence,
            tail_hash = %tail.hash,
            "Opened ledger store"
        );

        if config.verify_on_open && tail.sequence > 0 {
            let report = audit::verify_chain(&store, 1, tail.sequence)?;
            tracing::info!(
                entries = report.entries,
                merkle_root = %report.merkle_root,
                "Ledger chain verified"
            );
        }

        Ok(store)
    }

    fn cf_handle(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_ENTRIES)
            .ok_or_else(|| StoreError::Storage(format!("Column family {} not found", CF_ENTRIES)))
    }

    fn recover_tail(&self) -> Result<ChainTail> {
        let cf = self.cf_handle()?;

        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            None => Ok(ChainTail::EMPTY),
            Some(item) => {
                let (key, value) = item?;
                let entry = decode_entry(&key, &value)?;
                Ok(ChainTail::of(&entry))
            }
        }
    }

    /// Append the next entry
    ///
    /// Succeeds only if `entry` extends the tail by one sequence and links to
    /// the tail hash. Returns after the write is synced to disk.
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let mut tail = self.writer.lock();

        let expected = tail.sequence + 1;
        if entry.sequence != expected {
            return Err(StoreError::SequenceGap {
                expected,
                got: entry.sequence,
            });
        }

        if entry.predecessor_hash != tail.hash {
            return Err(StoreError::ChainMismatch {
                sequence: entry.sequence,
            });
        }

        let cf = self.cf_handle()?;
        let value = bincode::serialize(&StoredEntry::from_entry(entry))?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(cf, entry.sequence.to_be_bytes(), &value, &write_opts)?;

        *tail = ChainTail::of(entry);
        *self.published.write() = *tail;

        tracing::debug!(
            sequence = entry.sequence,
            hash = %tail.hash,
            accepted_at = %entry.accepted_at,
            "Entry appended"
        );

        Ok(())
    }

    /// Get entry by sequence
    pub fn get(&self, sequence: u64) -> Result<LedgerEntry> {
        if sequence == 0 || sequence > self.tail_sequence() {
            return Err(StoreError::NotFound(sequence));
        }

        let cf = self.cf_handle()?;
        let key = sequence.to_be_bytes();

        let value = self
            .db
            .get_cf(cf, key)?
            .ok_or(StoreError::NotFound(sequence))?;

        decode_entry(&key, &value)
    }

    /// Lazy iterator over `[from, to]`, clipped to the current tail
    pub fn range(&self, from: u64, to: u64) -> LedgerRange<'_> {
        LedgerRange::new(self, from.max(1), to.min(self.tail_sequence()))
    }

    /// Sequence of the last committed entry (0 if empty)
    pub fn tail_sequence(&self) -> u64 {
        self.published.read().sequence
    }

    /// Hash of the last committed entry (zero if empty)
    pub fn tail_hash(&self) -> Digest {
        self.published.read().hash
    }

    /// Snapshot of the committed tail
    pub fn tail(&self) -> ChainTail {
        *self.published.read()
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        drop(self.db);
        tracing::info!("Ledger store closed");
        Ok(())
    }

    /// Scan up to `limit` entries starting at `from`, stopping after `end`
    fn scan(&self, from: u64, end: u64, limit: usize) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle()?;
        let start = from.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut entries = Vec::with_capacity(limit.min((end - from + 1) as usize));
        let mut expected = from;

        for item in iter {
            if entries.len() >= limit || expected > end {
                break;
            }

            let (key, value) = item?;
            let entry = decode_entry(&key, &value)?;
            if entry.sequence != expected {
                return Err(StoreError::Corrupt(format!(
                    "missing entry {} (next key is {})",
                    expected, entry.sequence
                )));
            }

            entries.push(entry);
            expected += 1;
        }

        if entries.is_empty() && from <= end {
            return Err(StoreError::Corrupt(format!("missing entry {}", from)));
        }

        Ok(entries)
    }
}

fn decode_entry(key: &[u8], value: &[u8]) -> Result<LedgerEntry> {
    let key: [u8; 8] = key
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("invalid key length {}", key.len())))?;
    let stored: StoredEntry = bincode::deserialize(value)?;
    Ok(stored.into_entry(u64::from_be_bytes(key)))
}

/// Finite, restartable, lazily fetched run of entries
///
/// Yields `Err` once and then ends if the underlying store fails.
#[derive(Debug, Clone)]
pub struct LedgerRange<'a> {
    store: &'a LedgerStore,
    from: u64,
    end: u64,
    next: u64,
    buffer: VecDeque<LedgerEntry>,
    failed: bool,
}

impl<'a> LedgerRange<'a> {
    fn new(store: &'a LedgerStore, from: u64, end: u64) -> Self {
        Self {
            store,
            from,
            end,
            next: from,
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    /// First sequence of the range
    pub fn start(&self) -> u64 {
        self.from
    }

    /// Last sequence of the range (inclusive); below `start` when empty
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of entries the range covers
    pub fn len(&self) -> u64 {
        (self.end + 1).saturating_sub(self.from)
    }

    /// Whether the range covers no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewind to the first entry
    pub fn restart(&mut self) {
        self.next = self.from;
        self.buffer.clear();
        self.failed = false;
    }
}

impl Iterator for LedgerRange<'_> {
    type Item = Result<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.buffer.pop_front() {
            return Some(Ok(entry));
        }

        if self.failed || self.next > self.end {
            return None;
        }

        match self.store.scan(self.next, self.end, RANGE_CHUNK) {
            Ok(entries) => {
                self.next += entries.len() as u64;
                self.buffer.extend(entries);
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Ledger operations a single writer needs
///
/// Implemented by [`LedgerStore`]; other backends wrap or replace it.
pub trait EntryLog: Send + Sync {
    /// Append `entry` at the tail
    fn append(&self, entry: &LedgerEntry) -> Result<()>;

    /// Get entry by sequence
    fn get(&self, sequence: u64) -> Result<LedgerEntry>;

    /// Entries in `[from, to]`, clipped to the tail
    fn entries(&self, from: u64, to: u64) -> Box<dyn Iterator<Item = Result<LedgerEntry>> + '_>;

    /// Snapshot of the committed tail
    fn tail(&self) -> ChainTail;

    /// Sequence of the last committed entry
    fn tail_sequence(&self) -> u64 {
        self.tail().sequence
    }

    /// Hash of the last committed entry
    fn tail_hash(&self) -> Digest {
        self.tail().hash
    }
}

impl EntryLog for LedgerStore {
    fn append(&self, entry: &LedgerEntry) -> Result<()> {
        LedgerStore::append(self, entry)
    }

    fn get(&self, sequence: u64) -> Result<LedgerEntry> {
        LedgerStore::get(self, sequence)
    }

    fn entries(&self, from: u64, to: u64) -> Box<dyn Iterator<Item = Result<LedgerEntry>> + '_> {
        Box::new(self.range(from, to))
    }

    fn tail(&self) -> ChainTail {
        LedgerStore::tail(self)
    }

    fn tail_sequence(&self) -> u64 {
        LedgerStore::tail_sequence(self)
    }

    fn tail_hash(&self) -> Digest {
        LedgerStore::tail_hash(self)
    }
}
