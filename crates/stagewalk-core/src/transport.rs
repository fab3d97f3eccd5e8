//! # Record Transport
//!
//! Every time a step reaches `Done` the sequencer emits a
//! [`FinalizedRecord`] to a [`RecordSink`]. The sequencer never retries;
//! a failing sink is logged and counted, and local progression continues.

use crate::{FieldId, FieldMap, SequencerError, StageId, StepId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// The finalized answers of one step, as reported to the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedRecord {
    pub session: String,
    pub treatment: String,
    pub stage: StageId,
    pub step: StepId,
    /// Revision number within the step; greater than 1 after back navigation.
    pub revision: u32,
    pub fields: FieldMap,
    /// Comprehension-check results for fields that declare a correct answer.
    pub correct: BTreeMap<FieldId, bool>,
    /// Validation outcome per declared field. Only auto-finished steps can
    /// carry a `false` here.
    pub valid: BTreeMap<FieldId, bool>,
    /// Whether the step finished without participant input.
    pub auto_finished: bool,
}

/// Destination of finalized records.
pub trait RecordSink: Send + Sync {
    fn emit(&self, record: &FinalizedRecord) -> Result<(), SequencerError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn emit(&self, _record: &FinalizedRecord) -> Result<(), SequencerError> {
        Ok(())
    }
}

/// Keeps records in memory. Useful for tests and for servers without storage.
///
/// A bounded sink keeps only the newest `limit` records and counts the
/// ones it let go.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<VecDeque<FinalizedRecord>>,
    limit: Option<usize>,
    dropped: AtomicU64,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bounded(limit: usize) -> Self {
        Self {
            limit: Some(limit.max(1)),
            ..Self::default()
        }
    }

    /// Snapshot of everything still held, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<FinalizedRecord> {
        self.records
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records evicted to stay within the limit.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records of one session, in emission order.
    #[must_use]
    pub fn records_for(&self, session: &str) -> Vec<FinalizedRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.session == session)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: &FinalizedRecord) -> Result<(), SequencerError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| SequencerError::Transport(e.to_string()))?;
        records.push_back(record.clone());
        if let Some(limit) = self.limit {
            while records.len() > limit {
                records.pop_front();
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!(limit, "in-memory record buffer full, dropping oldest");
                }
            }
        }
        Ok(())
    }
}
