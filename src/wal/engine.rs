//! WAL storage engine: MVCC snapshots, transactions, batched append,
//! background compaction.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::lock::FileLock;
use super::record::{RecordKind, WalRecord};
use super::snapshot::{TxOp, apply_ops};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed,
    Aborted,
}

struct TxState {
    ops: Vec<TxOp>,
    status: TxStatus,
}

/// MVCC write-ahead-log engine over a primary data file and its `.wal`
/// sidecar. One `WalEngine` instance holds at most one active transaction's
/// lock at a time; a second writer must wait for it to commit or abort.
pub struct WalEngine {
    data_path: PathBuf,
    wal_path: PathBuf,
    config: Config,
    wal_file: File,
    pending: Vec<WalRecord>,
    last_flush: Instant,
    lock: Option<FileLock>,
    txns: HashMap<u32, TxState>,
    snapshots: BTreeMap<u32, Value>,
    next_txid: u32,
    stable_txid: u32,
    records_since_compaction: usize,
    last_compaction: Instant,
    compacting: bool,
}

impl WalEngine {
    /// Loads the baseline snapshot and replays the WAL.
    ///
    /// # Errors
    /// Returns an error if the data file or WAL cannot be read, or a record
    /// fails to parse.
    pub fn open(data_path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let data_path = data_path.into();
        let wal_path = fsutil::wal_path(&data_path);

        let baseline = if data_path.exists() {
            let mut bytes = Vec::new();
            File::open(&data_path)?.read_to_end(&mut bytes)?;
            if bytes.is_empty() {
                Value::Object(serde_json::Map::new())
            } else if config.use_msgpack {
                rmp_serde::from_slice(&bytes)?
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Value::Object(serde_json::Map::new())
        };

        let wal_file = OpenOptions::new().read(true).append(true).create(true).open(&wal_path)?;

        let mut engine = Self {
            data_path,
            wal_path,
            config,
            wal_file,
            pending: Vec::new(),
            last_flush: Instant::now(),
            lock: None,
            txns: HashMap::new(),
            snapshots: BTreeMap::from([(0, baseline)]),
            next_txid: 1,
            stable_txid: 0,
            records_since_compaction: 0,
            last_compaction: Instant::now(),
            compacting: false,
        };
        engine.replay()?;
        Ok(engine)
    }

    fn replay(&mut self) -> Result<()> {
        for record in Self::read_all_records(&self.wal_path, self.config.use_msgpack)? {
            self.apply_replayed(record);
        }
        Ok(())
    }

    fn apply_replayed(&mut self, record: WalRecord) {
        self.next_txid = self.next_txid.max(record.txid + 1);
        match record.kind {
            RecordKind::Begin => {
                self.txns.insert(record.txid, TxState { ops: Vec::new(), status: TxStatus::Active });
            }
            RecordKind::Write | RecordKind::Update | RecordKind::Delete => {
                let Some(tx) = self.txns.get_mut(&record.txid) else { return };
                let op = match record.kind {
                    RecordKind::Write => TxOp::Write(record.data.unwrap_or(Value::Null)),
                    RecordKind::Update => TxOp::Update(record.data.unwrap_or(Value::Null)),
                    _ => TxOp::Delete,
                };
                tx.ops.push(op);
            }
            RecordKind::Commit => {
                let Some(tx) = self.txns.get(&record.txid) else { return };
                let base = self.snapshot_at(self.stable_txid);
                let built = apply_ops(&base, &tx.ops);
                self.snapshots.insert(record.txid, built);
                if let Some(tx) = self.txns.get_mut(&record.txid) {
                    tx.status = TxStatus::Committed;
                }
                self.stable_txid = self.stable_txid.max(record.txid);
            }
            RecordKind::Abort => {
                if let Some(tx) = self.txns.get_mut(&record.txid) {
                    tx.status = TxStatus::Aborted;
                }
            }
        }
    }

    fn read_all_records(wal_path: &std::path::Path, msgpack: bool) -> Result<Vec<WalRecord>> {
        if !wal_path.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if msgpack {
            let mut file = File::open(wal_path)?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            let mut pos = 0;
            while pos + 4 <= buf.len() {
                let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                if pos + len > buf.len() {
                    break; // trailing partial record discarded
                }
                match rmp_serde::from_slice::<WalRecord>(&buf[pos..pos + len]) {
                    Ok(rec) => out.push(rec),
                    Err(_) => break,
                }
                pos += len;
            }
        } else {
            let file = File::open(wal_path)?;
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalRecord>(&line) {
                    Ok(rec) => out.push(rec),
                    Err(_) => break, // last parseable line wins
                }
            }
        }
        Ok(out)
    }

    fn snapshot_at(&self, txid: u32) -> Value {
        self.snapshots.range(..=txid).next_back().map_or_else(|| Value::Object(serde_json::Map::new()), |(_, v)| v.clone())
    }

    #[must_use]
    pub fn read(&self) -> Value {
        self.snapshot_at(self.stable_txid)
    }

    #[must_use]
    pub fn get_snapshot(&self, txid: u32) -> Value {
        self.snapshot_at(txid)
    }

    #[must_use]
    pub fn stable_txid(&self) -> u32 {
        self.stable_txid
    }

    /// # Errors
    /// Returns `Error::LockContention` if the lock cannot be acquired.
    pub fn begin(&mut self) -> Result<u32> {
        let lock = FileLock::acquire(&fsutil::lock_path(&self.data_path))?;
        let txid = self.next_txid;
        self.next_txid += 1;
        self.lock = Some(lock);
        self.txns.insert(txid, TxState { ops: Vec::new(), status: TxStatus::Active });
        self.enqueue(WalRecord::begin(txid, now_ms()))?;
        Ok(txid)
    }

    /// # Errors
    /// Returns `UnknownTxid`/`Terminated` if the transaction is not active.
    pub fn write(&mut self, txid: u32, data: Value) -> Result<()> {
        self.push_op(txid, TxOp::Write(data.clone()))?;
        self.enqueue(WalRecord::write(txid, now_ms(), data))
    }

    /// # Errors
    /// Returns `UnknownTxid`/`Terminated` if the transaction is not active.
    pub fn update(&mut self, txid: u32, data: Value) -> Result<()> {
        self.push_op(txid, TxOp::Update(data.clone()))?;
        self.enqueue(WalRecord::update(txid, now_ms(), data))
    }

    /// # Errors
    /// Returns `UnknownTxid`/`Terminated` if the transaction is not active.
    pub fn delete(&mut self, txid: u32) -> Result<()> {
        self.push_op(txid, TxOp::Delete)?;
        self.enqueue(WalRecord::delete(txid, now_ms()))
    }

    fn push_op(&mut self, txid: u32, op: TxOp) -> Result<()> {
        let tx = self.active_tx_mut(txid)?;
        tx.ops.push(op);
        Ok(())
    }

    fn active_tx_mut(&mut self, txid: u32) -> Result<&mut TxState> {
        match self.txns.get_mut(&txid) {
            None => Err(Error::UnknownTxid { txid }),
            Some(tx) if tx.status != TxStatus::Active => Err(Error::Terminated { txid }),
            Some(tx) => Ok(tx),
        }
    }

    /// # Errors
    /// Returns `UnknownTxid`/`Terminated` if already terminated, or an I/O
    /// error if the forced flush fails.
    pub fn commit(&mut self, txid: u32) -> Result<()> {
        self.active_tx_mut(txid)?;
        self.enqueue(WalRecord::commit(txid, now_ms()))?;
        self.flush()?;
        let base = self.snapshot_at(self.stable_txid);
        let built = {
            let tx = self.txns.get(&txid).expect("checked active above");
            apply_ops(&base, &tx.ops)
        };
        self.snapshots.insert(txid, built);
        self.stable_txid = self.stable_txid.max(txid);
        if let Some(tx) = self.txns.get_mut(&txid) {
            tx.status = TxStatus::Committed;
        }
        self.write_data_file()?;
        self.lock.take();
        Ok(())
    }

    /// # Errors
    /// Returns `UnknownTxid`/`Terminated` if already terminated.
    pub fn abort(&mut self, txid: u32) -> Result<()> {
        self.active_tx_mut(txid)?;
        self.enqueue(WalRecord::abort(txid, now_ms()))?;
        if let Some(tx) = self.txns.get_mut(&txid) {
            tx.status = TxStatus::Aborted;
        }
        self.lock.take();
        Ok(())
    }

    fn enqueue(&mut self, record: WalRecord) -> Result<()> {
        self.pending.push(record);
        if self.pending.len() >= self.config.batch_size
            || self.last_flush.elapsed() >= Duration::from_millis(self.config.batch_time_ms)
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Force all buffered WAL records to disk and refresh the last-flush
    /// clock. Also opportunistically runs background compaction.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let records = std::mem::take(&mut self.pending);
            self.append_records(&records)?;
            self.records_since_compaction += records.len();
        }
        self.write_data_file()?;
        self.last_flush = Instant::now();
        self.maybe_compact()?;
        Ok(())
    }

    fn append_records(&mut self, records: &[WalRecord]) -> Result<()> {
        if self.config.use_msgpack {
            for record in records {
                let bytes = rmp_serde::to_vec(record)?;
                let len = u32::try_from(bytes.len())
                    .map_err(|_| Error::InvalidFormat("WAL record too large".to_string()))?;
                self.wal_file.write_all(&len.to_be_bytes())?;
                self.wal_file.write_all(&bytes)?;
            }
        } else {
            for record in records {
                let line = serde_json::to_string(record)?;
                self.wal_file.write_all(line.as_bytes())?;
                self.wal_file.write_all(b"\n")?;
            }
        }
        self.wal_file.sync_data()?;
        Ok(())
    }

    fn write_data_file(&self) -> Result<()> {
        let snapshot = self.read();
        let bytes = if self.config.use_msgpack { rmp_serde::to_vec(&snapshot)? } else { serde_json::to_vec(&snapshot)? };
        let tmp = self.data_path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fsutil::atomic_replace(&tmp, &self.data_path)?;
        Ok(())
    }

    /// `checkUnique(table, field, value, excludeDoc)`: true iff no conflict in
    /// the stable snapshot or any active transaction's projected view.
    #[must_use]
    pub fn check_unique(&self, table: &str, field: &str, value: &Value, exclude_doc: Option<&str>) -> bool {
        self.check_compound_unique(table, std::slice::from_ref(&field.to_string()), std::slice::from_ref(value), exclude_doc)
    }

    /// `checkCompoundUnique(table, fields[], values[], excludeDoc)`.
    #[must_use]
    pub fn check_compound_unique(
        &self,
        table: &str,
        fields: &[String],
        values: &[Value],
        exclude_doc: Option<&str>,
    ) -> bool {
        if Self::table_has_conflict(&self.read(), table, fields, values, exclude_doc) {
            return false;
        }
        for tx in self.txns.values().filter(|t| t.status == TxStatus::Active) {
            let projected = apply_ops(&self.snapshot_at(self.stable_txid), &tx.ops);
            if Self::table_has_conflict(&projected, table, fields, values, exclude_doc) {
                return false;
            }
        }
        true
    }

    fn table_has_conflict(
        snapshot: &Value,
        table: &str,
        fields: &[String],
        values: &[Value],
        exclude_doc: Option<&str>,
    ) -> bool {
        let Some(docs) = snapshot.get(table).and_then(Value::as_object) else { return false };
        docs.iter().any(|(doc_id, doc)| {
            if exclude_doc == Some(doc_id.as_str()) {
                return false;
            }
            fields.iter().zip(values).all(|(f, v)| doc.get(f) == Some(v))
        })
    }

    /// Re-parses the WAL from disk and reports whether every record has a
    /// valid `type`/`txid`/`timestamp`.
    ///
    /// # Errors
    /// Returns an error only if the WAL file cannot be opened at all.
    pub fn check_integrity(&self) -> Result<bool> {
        let file = match File::open(&self.wal_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if self.config.use_msgpack {
            let mut buf = Vec::new();
            BufReader::new(file).read_to_end(&mut buf)?;
            let mut pos = 0;
            while pos < buf.len() {
                if pos + 4 > buf.len() {
                    return Ok(false);
                }
                let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                if pos + len > buf.len() {
                    return Ok(false);
                }
                match rmp_serde::from_slice::<WalRecord>(&buf[pos..pos + len]) {
                    Ok(rec) if rec.is_well_formed() => {}
                    _ => return Ok(false),
                }
                pos += len;
            }
            return Ok(true);
        }
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { return Ok(false) };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalRecord>(&line) {
                Ok(rec) if rec.is_well_formed() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if !self.config.background_compaction || self.compacting {
            return Ok(());
        }
        let over_threshold = self.records_since_compaction >= self.config.compact_threshold;
        let interval_ok =
            self.last_compaction.elapsed() >= Duration::from_millis(self.config.min_compaction_interval_ms);
        if over_threshold && interval_ok {
            self.compact()?;
        }
        Ok(())
    }

    /// Drops terminated transactions at or below `stableTxid` and rewrites
    /// the WAL with only the records belonging to surviving transactions.
    ///
    /// # Errors
    /// Returns an error if the rewrite fails; the original WAL is left
    /// intact in that case.
    pub fn compact(&mut self) -> Result<()> {
        self.compacting = true;
        let result = self.compact_inner();
        self.compacting = false;
        self.last_compaction = Instant::now();
        self.records_since_compaction = 0;
        result
    }

    fn compact_inner(&mut self) -> Result<()> {
        self.flush()?;
        let stable = self.stable_txid;
        self.txns.retain(|txid, tx| !(tx.status != TxStatus::Active && *txid <= stable));

        let surviving: std::collections::HashSet<u32> = self.txns.keys().copied().collect();
        let records = Self::read_all_records(&self.wal_path, self.config.use_msgpack)?;
        let keep: Vec<WalRecord> = records.into_iter().filter(|r| surviving.contains(&r.txid)).collect();

        let tmp_path = self.wal_path.with_extension("wal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            if self.config.use_msgpack {
                for record in &keep {
                    let bytes = rmp_serde::to_vec(record)?;
                    let len = u32::try_from(bytes.len())
                        .map_err(|_| Error::InvalidFormat("WAL record too large".to_string()))?;
                    tmp.write_all(&len.to_be_bytes())?;
                    tmp.write_all(&bytes)?;
                }
            } else {
                for record in &keep {
                    let line = serde_json::to_string(record)?;
                    tmp.write_all(line.as_bytes())?;
                    tmp.write_all(b"\n")?;
                }
            }
            tmp.sync_all()?;
        }
        fsutil::atomic_replace(&tmp_path, &self.wal_path)?;
        self.wal_file = OpenOptions::new().read(true).append(true).create(true).open(&self.wal_path)?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn commit_publishes_snapshot_visible_to_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut engine = WalEngine::open(&path, Config::default()).unwrap();
        let tx = engine.begin().unwrap();
        engine.write(tx, json!({"users": {"1": {"name": "Alice"}}})).unwrap();
        engine.commit(tx).unwrap();
        assert_eq!(engine.read(), json!({"users": {"1": {"name": "Alice"}}}));
    }

    #[test]
    fn second_begin_without_releasing_first_is_contention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut a = WalEngine::open(&path, Config::default()).unwrap();
        let mut b = WalEngine::open(&path, Config::default()).unwrap();
        let _tx_a = a.begin().unwrap();
        let err = b.begin().unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
    }

    #[test]
    fn abort_leaves_stable_snapshot_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut engine = WalEngine::open(&path, Config::default()).unwrap();
        let tx = engine.begin().unwrap();
        engine.write(tx, json!({"a": 1})).unwrap();
        engine.abort(tx).unwrap();
        assert_eq!(engine.read(), json!({}));
    }

    #[test]
    fn double_terminate_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut engine = WalEngine::open(&path, Config::default()).unwrap();
        let tx = engine.begin().unwrap();
        engine.commit(tx).unwrap();
        assert!(matches!(engine.commit(tx), Err(Error::Terminated { .. })));
    }

    #[test]
    fn reopen_replays_wal_and_matches_prior_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        {
            let mut engine = WalEngine::open(&path, Config::default()).unwrap();
            let tx = engine.begin().unwrap();
            engine.write(tx, json!({"users": {"1": {"name": "Alice"}}})).unwrap();
            engine.commit(tx).unwrap();
        }
        let reopened = WalEngine::open(&path, Config::default()).unwrap();
        assert_eq!(reopened.read(), json!({"users": {"1": {"name": "Alice"}}}));
        assert_eq!(reopened.stable_txid(), 1);
    }

    #[test]
    fn get_snapshot_before_first_commit_is_baseline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut engine = WalEngine::open(&path, Config::default()).unwrap();
        let tx = engine.begin().unwrap();
        engine.write(tx, json!({"a": 1})).unwrap();
        engine.commit(tx).unwrap();
        assert_eq!(engine.get_snapshot(0), json!({}));
        assert_eq!(engine.get_snapshot(tx), json!({"a": 1}));
    }

    #[test]
    fn check_unique_detects_conflict_and_excludes_self() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut engine = WalEngine::open(&path, Config::default()).unwrap();
        let tx = engine.begin().unwrap();
        engine.write(tx, json!({"users": {"1": {"email": "a@b"}}})).unwrap();
        engine.commit(tx).unwrap();
        assert!(!engine.check_unique("users", "email", &json!("a@b"), None));
        assert!(engine.check_unique("users", "email", &json!("a@b"), Some("1")));
        assert!(engine.check_unique("users", "email", &json!("c@d"), None));
    }

    #[test]
    fn compaction_drops_terminated_transactions_from_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut config = Config::default();
        config.background_compaction = false;
        let mut engine = WalEngine::open(&path, config).unwrap();
        for i in 0..5 {
            let tx = engine.begin().unwrap();
            engine.write(tx, json!({"t": i})).unwrap();
            engine.commit(tx).unwrap();
        }
        engine.compact().unwrap();
        assert!(engine.check_integrity().unwrap());
        assert_eq!(engine.read(), json!({"t": 4}));
    }

    #[test]
    fn check_integrity_handles_msgpack_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bmdb");
        let mut config = Config::default();
        config.use_msgpack = true;
        let mut engine = WalEngine::open(&path, config).unwrap();
        for i in 0..3 {
            let tx = engine.begin().unwrap();
            engine.write(tx, json!({"t": i})).unwrap();
            engine.commit(tx).unwrap();
        }
        assert!(engine.check_integrity().unwrap());

        drop(engine);
        let wal_path = fsutil::wal_path(&path);
        let mut bytes = std::fs::read(&wal_path).unwrap();
        bytes.push(0xFF);
        std::fs::write(&wal_path, &bytes).unwrap();

        let config = {
            let mut c = Config::default();
            c.use_msgpack = true;
            c
        };
        let corrupted = WalEngine::open(&path, config).unwrap();
        assert!(!corrupted.check_integrity().unwrap());
    }
}
