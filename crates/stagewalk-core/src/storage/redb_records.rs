//! # redb-backed Record Store
//!
//! Durable storage for finalized step records and session snapshots,
//! using the redb embedded database:
//! - ACID transactions
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! Records are appended under a monotonically increasing sequence number,
//! so reading them back yields emission order across every session.
//! Snapshots are keyed by session id and overwritten on every save.

use crate::SequencerError;
use crate::formats::{snapshot_from_bytes, snapshot_to_bytes};
use crate::lifecycle::SessionSnapshot;
use crate::primitives::MAX_ID_LENGTH;
use crate::transport::{FinalizedRecord, RecordSink};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;

/// Table for records: sequence number (u64) -> postcard `FinalizedRecord`
const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

/// Table for snapshots: session id -> encoded `SessionSnapshot`
const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_SEQ: &str = "next_seq";

fn io(e: impl std::fmt::Display) -> SequencerError {
    SequencerError::Io(e.to_string())
}

/// A disk-backed store of finalized records and session snapshots.
pub struct RedbRecordStore {
    db: Database,
}

impl std::fmt::Debug for RedbRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRecordStore").finish_non_exhaustive()
    }
}

impl RedbRecordStore {
    /// Open or create a record database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SequencerError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(io)?;
            let _ = write_txn.open_table(RECORDS).map_err(io)?;
            let _ = write_txn.open_table(SNAPSHOTS).map_err(io)?;
            let _ = write_txn.open_table(METADATA).map_err(io)?;
            write_txn.commit().map_err(io)?;
        }

        Ok(Self { db })
    }

    /// Append a record and return its sequence number.
    pub fn append(&self, record: &FinalizedRecord) -> Result<u64, SequencerError> {
        let bytes = postcard::to_allocvec(record)
            .map_err(|e| SequencerError::Serialization(e.to_string()))?;

        let write_txn = self.db.begin_write().map_err(io)?;
        let seq = {
            let mut meta_table = write_txn.open_table(METADATA).map_err(io)?;
            let seq = meta_table
                .get(NEXT_SEQ)
                .map_err(io)?
                .map(|v| v.value())
                .unwrap_or(0);
            meta_table
                .insert(NEXT_SEQ, seq.saturating_add(1))
                .map_err(io)?;
            seq
        };
        {
            let mut records_table = write_txn.open_table(RECORDS).map_err(io)?;
            records_table.insert(seq, bytes.as_slice()).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;

        tracing::debug!(seq, session = %record.session, step = %record.step, "record stored");
        Ok(seq)
    }

    /// Every record in emission order.
    pub fn records(&self) -> Result<Vec<FinalizedRecord>, SequencerError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let records_table = read_txn.open_table(RECORDS).map_err(io)?;

        let mut records = Vec::new();
        for entry in records_table.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            let record: FinalizedRecord = postcard::from_bytes(value.value())
                .map_err(|e| SequencerError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Records of one session in emission order.
    pub fn records_for(&self, session: &str) -> Result<Vec<FinalizedRecord>, SequencerError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.session == session)
            .collect())
    }

    pub fn record_count(&self) -> Result<usize, SequencerError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let records_table = read_txn.open_table(RECORDS).map_err(io)?;
        let count = records_table.len().map_err(io)?;
        Ok(count as usize)
    }

    /// Store the latest snapshot of a session, replacing any previous one.
    pub fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), SequencerError> {
        if snapshot.session.len() > MAX_ID_LENGTH {
            return Err(SequencerError::LimitExceeded(format!(
                "session id is {} bytes (maximum {})",
                snapshot.session.len(),
                MAX_ID_LENGTH
            )));
        }
        let bytes = snapshot_to_bytes(snapshot)?;

        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS).map_err(io)?;
            table
                .insert(snapshot.session.as_str(), bytes.as_slice())
                .map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }

    pub fn load_snapshot(&self, session: &str) -> Result<Option<SessionSnapshot>, SequencerError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(SNAPSHOTS).map_err(io)?;
        match table.get(session).map_err(io)? {
            Some(guard) => snapshot_from_bytes(guard.value()).map(Some),
            None => Ok(None),
        }
    }

    /// Session ids with a stored snapshot, in id order.
    pub fn snapshot_ids(&self) -> Result<Vec<String>, SequencerError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(SNAPSHOTS).map_err(io)?;

        let mut ids = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }
}

impl RecordSink for RedbRecordStore {
    fn emit(&self, record: &FinalizedRecord) -> Result<(), SequencerError> {
        self.append(record)
            .map(|_| ())
            .map_err(|e| SequencerError::Transport(e.to_string()))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{
        FieldId, FieldMap, FieldValue, RendererRegistry, SequenceBuilder, Sequencer, StageId,
        StepDescriptor, StepId, StepStore,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(session: &str, step: &str, answer: &str) -> FinalizedRecord {
        let mut fields = FieldMap::new();
        fields.insert(FieldId::new("answer"), FieldValue::Choice(answer.into()));
        FinalizedRecord {
            session: session.into(),
            treatment: "A".into(),
            stage: StageId::new(step),
            step: StepId::new(step),
            revision: 1,
            fields,
            correct: BTreeMap::new(),
            valid: BTreeMap::new(),
            auto_finished: false,
        }
    }

    #[test]
    fn append_assigns_increasing_sequence_numbers() {
        let temp = tempdir().expect("temp dir");
        let store = RedbRecordStore::open(temp.path().join("records.redb")).expect("open db");

        assert_eq!(store.append(&record("s1", "consent", "yes")).expect("append"), 0);
        assert_eq!(store.append(&record("s2", "consent", "yes")).expect("append"), 1);
        assert_eq!(store.append(&record("s1", "trust", "(3)")).expect("append"), 2);

        assert_eq!(store.record_count().expect("count"), 3);
        let mine = store.records_for("s1").expect("records");
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[1].step, StepId::new("trust"));
    }

    #[test]
    fn records_persist_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("records.redb");
        {
            let store = RedbRecordStore::open(&path).expect("open db");
            store.emit(&record("s1", "consent", "yes")).expect("emit");
        }
        {
            let store = RedbRecordStore::open(&path).expect("open db");
            assert_eq!(store.records().expect("records"), vec![record("s1", "consent", "yes")]);
            assert_eq!(store.append(&record("s1", "end", "")).expect("append"), 1);
        }
    }

    #[test]
    fn snapshots_overwrite_per_session() {
        let temp = tempdir().expect("temp dir");
        let store = Arc::new(RedbRecordStore::open(temp.path().join("db.redb")).expect("open db"));

        let mut steps = StepStore::new();
        steps.register(StepDescriptor::new("consent")).expect("register");
        steps.register(StepDescriptor::new("end").terminal()).expect("register");
        let definition = SequenceBuilder::new()
            .stage("consent")
            .stage("end")
            .build(&steps, "A")
            .expect("build");
        let mut seq = Sequencer::new(
            "s-9",
            definition,
            RendererRegistry::default(),
            Arc::clone(&store) as Arc<dyn RecordSink>,
        )
        .expect("sequencer");

        seq.start().expect("start");
        store.save_snapshot(&seq.snapshot()).expect("save");
        seq.advance().expect("advance");
        store.save_snapshot(&seq.snapshot()).expect("save");

        let loaded = store.load_snapshot("s-9").expect("load").expect("present");
        assert_eq!(loaded, seq.snapshot());
        assert_eq!(store.snapshot_ids().expect("ids"), vec!["s-9".to_string()]);
        assert!(store.load_snapshot("nobody").expect("load").is_none());
        assert_eq!(store.record_count().expect("count"), 2);
    }
}
