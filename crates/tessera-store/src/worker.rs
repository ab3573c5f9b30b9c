//! The store worker and its transaction API.
//!
//! A [`Db`] is a cheap handle onto a single worker thread that owns the
//! in-memory tables and the WAL. Transactions are closures shipped to
//! the worker; results come back through one-shot [`DbFuture`]s.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::wal::{append_record, open_log, read_records, WalOp};
use crate::{StoreError, StoreResult, Table};

/// Transactions per WAL before the worker rewrites the snapshot.
const COMPACTION_THRESHOLD: usize = 4096;

/// Depth of the worker's job queue.
const JOB_QUEUE_DEPTH: usize = 128;

type Tables = BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>;

// ============================================================================
// Futures
// ============================================================================

/// One-shot completion handle for a submitted transaction.
///
/// Futures are single-use: `wait` consumes the handle. If the worker is
/// gone the wait resolves to [`StoreError::Terminated`].
#[derive(Debug)]
pub struct DbFuture<T> {
    rx: Receiver<T>,
}

impl<T> DbFuture<T> {
    /// Blocks until the transaction has executed (and, for writes, its
    /// WAL record is synced).
    pub fn wait(self) -> StoreResult<T> {
        self.rx.recv().map_err(|_| StoreError::Terminated)
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Read-only view of the tables.
pub struct ReadTxn<'a> {
    tables: &'a Tables,
}

impl ReadTxn<'_> {
    pub fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        self.tables.get(&table).and_then(|t| t.get(key)).cloned()
    }

    pub fn contains(&self, table: Table, key: &[u8]) -> bool {
        self.tables
            .get(&table)
            .map(|t| t.contains_key(key))
            .unwrap_or(false)
    }

    /// Opens a cursor over the whole table in key order.
    pub fn cursor(&self, table: Table) -> Cursor {
        self.cursor_from(table, &[])
    }

    /// Opens a cursor positioned at the first key >= `start`.
    pub fn cursor_from(&self, table: Table, start: &[u8]) -> Cursor {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .tables
            .get(&table)
            .map(|t| {
                t.range(start.to_vec()..)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Cursor {
            entries: entries.into_iter(),
        }
    }
}

/// Key-ordered iterator over a table snapshot.
#[derive(Debug)]
pub struct Cursor {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for Cursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// Read-write view; mutations apply immediately and are logged as one
/// atomic WAL record when the closure returns.
pub struct WriteTxn<'a> {
    tables: &'a mut Tables,
    ops: Vec<WalOp>,
}

impl WriteTxn<'_> {
    pub fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        self.tables.get(&table).and_then(|t| t.get(key)).cloned()
    }

    pub fn put(&mut self, table: Table, key: &[u8], value: &[u8]) {
        self.tables
            .entry(table)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        self.ops.push(WalOp::Put {
            table,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&mut self, table: Table, key: &[u8]) {
        let existed = self
            .tables
            .get_mut(&table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false);
        if existed {
            self.ops.push(WalOp::Delete {
                table,
                key: key.to_vec(),
            });
        }
    }

    pub fn cursor(&self, table: Table) -> Cursor {
        ReadTxn {
            tables: self.tables,
        }
        .cursor(table)
    }
}

// ============================================================================
// Worker
// ============================================================================

enum Job {
    Exec(Box<dyn FnOnce(&mut StoreInner) + Send>),
    Shutdown,
}

struct StoreInner {
    tables: Tables,
    wal: File,
    wal_records: usize,
    wal_path: PathBuf,
    snapshot_path: PathBuf,
}

impl StoreInner {
    fn open(data_dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(data_dir)?;
        let snapshot_path = data_dir.join("snapshot.db");
        let wal_path = data_dir.join("wal.db");

        let mut tables: Tables = Table::ALL.iter().map(|&t| (t, BTreeMap::new())).collect();

        if snapshot_path.exists() {
            let mut snap = open_log(&snapshot_path)?;
            for dump in read_records::<Tables>(&mut snap)? {
                tables = dump;
            }
        }

        let mut wal = open_log(&wal_path)?;
        let records = read_records::<Vec<WalOp>>(&mut wal)?;
        let wal_records = records.len();
        for ops in records {
            apply_ops(&mut tables, ops);
        }
        info!(
            dir = %data_dir.display(),
            replayed = wal_records,
            "store opened"
        );

        let mut inner = Self {
            tables,
            wal,
            wal_records,
            wal_path,
            snapshot_path,
        };
        if inner.wal_records >= COMPACTION_THRESHOLD {
            inner.compact()?;
        }
        Ok(inner)
    }

    fn commit(&mut self, ops: Vec<WalOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        append_record(&mut self.wal, &ops)?;
        self.wal_records += 1;
        if self.wal_records >= COMPACTION_THRESHOLD {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrites the snapshot from the live tables and resets the WAL.
    fn compact(&mut self) -> StoreResult<()> {
        debug!(records = self.wal_records, "compacting store");
        let tmp = self.snapshot_path.with_extension("db.tmp");
        let mut snap = open_log(&tmp)?;
        append_record(&mut snap, &self.tables)?;
        drop(snap);
        fs::rename(&tmp, &self.snapshot_path)?;

        self.wal.set_len(0)?;
        self.wal.sync_data()?;
        self.wal = open_log(&self.wal_path)?;
        self.wal_records = 0;
        Ok(())
    }
}

fn apply_ops(tables: &mut Tables, ops: Vec<WalOp>) {
    for op in ops {
        match op {
            WalOp::Put { table, key, value } => {
                tables.entry(table).or_default().insert(key, value);
            }
            WalOp::Delete { table, key } => {
                tables.entry(table).or_default().remove(&key);
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Handle onto the store worker. Cloning shares the worker.
#[derive(Clone)]
pub struct Db {
    jobs: SyncSender<Job>,
}

impl Db {
    /// Opens the store under `data_dir`, replaying snapshot and WAL, and
    /// spawns the worker thread.
    pub fn open(data_dir: impl Into<PathBuf>) -> StoreResult<(Db, JoinHandle<()>)> {
        let mut inner = StoreInner::open(&data_dir.into())?;
        let (jobs, job_rx) = mpsc::sync_channel::<Job>(JOB_QUEUE_DEPTH);

        let handle = thread::Builder::new()
            .name("tessera-store".to_string())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    match job {
                        Job::Exec(f) => f(&mut inner),
                        Job::Shutdown => break,
                    }
                }
                debug!("store worker stopped");
            })
            .expect("spawn store worker");

        Ok((Db { jobs }, handle))
    }

    /// Submits a read-only transaction.
    pub fn read<T, F>(&self, f: F) -> DbFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTxn<'_>) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let job = Job::Exec(Box::new(move |inner: &mut StoreInner| {
            let result = f(&ReadTxn {
                tables: &inner.tables,
            });
            let _ = tx.send(result);
        }));
        let _ = self.jobs.send(job);
        DbFuture { rx }
    }

    /// Submits a read-write transaction. The future resolves only after
    /// the WAL record is synced.
    ///
    /// # Panics
    ///
    /// The worker panics if the WAL cannot be written: durability is the
    /// store's one job, and the process cannot continue without it.
    pub fn read_write<T, F>(&self, f: F) -> DbFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteTxn<'_>) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let job = Job::Exec(Box::new(move |inner: &mut StoreInner| {
            let mut txn = WriteTxn {
                tables: &mut inner.tables,
                ops: Vec::new(),
            };
            let result = f(&mut txn);
            let ops = txn.ops;
            if let Err(e) = inner.commit(ops) {
                panic!("store write failed: {e}");
            }
            let _ = tx.send(result);
        }));
        let _ = self.jobs.send(job);
        DbFuture { rx }
    }

    /// Asks the worker to drain and stop.
    pub fn shutdown(&self) {
        let _ = self.jobs.send(Job::Shutdown);
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_delete() {
        let dir = tempdir().expect("tempdir");
        let (db, worker) = Db::open(dir.path()).expect("open");

        db.read_write(|txn| {
            txn.put(Table::Vars, b"k1", b"v1");
            txn.put(Table::Txns, b"k1", b"other-table");
        })
        .wait()
        .expect("write");

        let got = db
            .read(|txn| txn.get(Table::Vars, b"k1"))
            .wait()
            .expect("read");
        assert_eq!(got.as_deref(), Some(b"v1".as_slice()));

        db.read_write(|txn| txn.delete(Table::Vars, b"k1"))
            .wait()
            .expect("delete");
        let got = db
            .read(|txn| txn.get(Table::Vars, b"k1"))
            .wait()
            .expect("read");
        assert!(got.is_none());

        // The other table is untouched.
        let other = db
            .read(|txn| txn.get(Table::Txns, b"k1"))
            .wait()
            .expect("read");
        assert!(other.is_some());

        db.shutdown();
        worker.join().expect("join");
    }

    #[test]
    fn transactions_are_atomic_across_tables() {
        let dir = tempdir().expect("tempdir");
        let (db, worker) = Db::open(dir.path()).expect("open");

        db.read_write(|txn| {
            txn.put(Table::Txns, b"t1", b"txn-blob");
            txn.put(Table::Vars, b"v1", b"var-record");
            txn.delete(Table::Txns, b"t0");
        })
        .wait()
        .expect("write");
        db.shutdown();
        worker.join().expect("join");

        // Reopen and verify both writes landed.
        let (db, worker) = Db::open(dir.path()).expect("reopen");
        let (t, v) = db
            .read(|txn| (txn.get(Table::Txns, b"t1"), txn.get(Table::Vars, b"v1")))
            .wait()
            .expect("read");
        assert!(t.is_some() && v.is_some());
        db.shutdown();
        worker.join().expect("join");
    }

    #[test]
    fn cursor_iterates_in_key_order() {
        let dir = tempdir().expect("tempdir");
        let (db, worker) = Db::open(dir.path()).expect("open");

        db.read_write(|txn| {
            txn.put(Table::BallotOutcomes, b"c", b"3");
            txn.put(Table::BallotOutcomes, b"a", b"1");
            txn.put(Table::BallotOutcomes, b"b", b"2");
        })
        .wait()
        .expect("write");

        let keys: Vec<Vec<u8>> = db
            .read(|txn| txn.cursor(Table::BallotOutcomes).map(|(k, _)| k).collect())
            .wait()
            .expect("scan");
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let from_b: Vec<Vec<u8>> = db
            .read(|txn| {
                txn.cursor_from(Table::BallotOutcomes, b"b")
                    .map(|(k, _)| k)
                    .collect()
            })
            .wait()
            .expect("scan");
        assert_eq!(from_b, vec![b"b".to_vec(), b"c".to_vec()]);

        db.shutdown();
        worker.join().expect("join");
    }

    #[test]
    fn reopen_replays_wal() {
        let dir = tempdir().expect("tempdir");
        {
            let (db, worker) = Db::open(dir.path()).expect("open");
            for i in 0u8..10 {
                db.read_write(move |txn| txn.put(Table::Meta, &[i], &[i]))
                    .wait()
                    .expect("write");
            }
            db.shutdown();
            worker.join().expect("join");
        }

        let (db, worker) = Db::open(dir.path()).expect("reopen");
        let count = db
            .read(|txn| txn.cursor(Table::Meta).count())
            .wait()
            .expect("scan");
        assert_eq!(count, 10);
        db.shutdown();
        worker.join().expect("join");
    }

    #[test]
    fn read_only_txn_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let (db, worker) = Db::open(dir.path()).expect("open");
        db.read(|_| ()).wait().expect("read");
        db.shutdown();
        worker.join().expect("join");

        let wal_len = std::fs::metadata(dir.path().join("wal.db"))
            .expect("meta")
            .len();
        assert_eq!(wal_len, 0);
    }
}
