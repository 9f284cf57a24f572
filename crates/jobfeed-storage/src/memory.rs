//! In-process transactional sink with the same merge semantics as the Postgres sink.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jobfeed_core::{FieldValue, NormalizedRecord, WriteMode, WriteOutcome};
use tokio::sync::Mutex;

use crate::{RecordSink, SinkError, SinkTransaction, UpsertTarget};

type Key = (String, String);
type Row = BTreeMap<String, FieldValue>;
type RejectRule = Arc<dyn Fn(&NormalizedRecord) -> Option<String> + Send + Sync>;

/// Clones share stored rows and failure state.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<MemoryState>,
    reject_rule: Option<RejectRule>,
    fatal_after: Option<u64>,
}

#[derive(Default)]
struct MemoryState {
    rows: Mutex<BTreeMap<Key, Row>>,
    transactions: AtomicU64,
    statements: AtomicU64,
    down: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records for which `rule` returns a reason fail like a bad row would.
    pub fn reject_records_where<F>(mut self, rule: F) -> Self
    where
        F: Fn(&NormalizedRecord) -> Option<String> + Send + Sync + 'static,
    {
        self.reject_rule = Some(Arc::new(rule));
        self
    }

    /// The first `statements` upserts succeed; after that the sink behaves as if
    /// the connection dropped.
    pub fn fail_fatally_after(mut self, statements: u64) -> Self {
        self.fatal_after = Some(statements);
        self
    }

    pub async fn rows(&self) -> BTreeMap<Key, Row> {
        self.state.rows.lock().await.clone()
    }

    pub async fn row(&self, company_slug: &str, internal_job_id: &str) -> Option<Row> {
        self.state
            .rows
            .lock()
            .await
            .get(&(company_slug.to_string(), internal_job_id.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn transactions_started(&self) -> u64 {
        self.state.transactions.load(Ordering::SeqCst)
    }

    fn ensure_up(&self) -> Result<(), SinkError> {
        if self.state.down.load(Ordering::SeqCst) {
            Err(SinkError::Fatal("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError> {
        self.ensure_up()?;
        self.state.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            sink: self.clone(),
            pending: BTreeMap::new(),
            savepoint: None,
        }))
    }
}

/// Uncommitted writes live in `pending` and shadow the committed rows.
struct MemoryTransaction {
    sink: MemorySink,
    pending: BTreeMap<Key, Row>,
    savepoint: Option<BTreeMap<Key, Row>>,
}

#[async_trait]
impl SinkTransaction for MemoryTransaction {
    async fn savepoint(&mut self) -> Result<(), SinkError> {
        self.sink.ensure_up()?;
        self.savepoint = Some(self.pending.clone());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), SinkError> {
        self.sink.ensure_up()?;
        self.savepoint = None;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), SinkError> {
        self.sink.ensure_up()?;
        match self.savepoint.take() {
            Some(pending) => {
                self.pending = pending;
                Ok(())
            }
            None => Err(SinkError::Fatal("no active savepoint".into())),
        }
    }

    async fn upsert(
        &mut self,
        _target: &UpsertTarget,
        record: &NormalizedRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, SinkError> {
        self.sink.ensure_up()?;
        let state = &self.sink.state;
        let executed = state.statements.fetch_add(1, Ordering::SeqCst);
        if self.sink.fatal_after.is_some_and(|limit| executed >= limit) {
            state.down.store(true, Ordering::SeqCst);
            return Err(SinkError::Fatal("connection reset by peer".into()));
        }
        if let Some(reason) = self.sink.reject_rule.as_ref().and_then(|rule| rule(record)) {
            return Err(SinkError::Record(reason));
        }

        let key = (record.company_slug.clone(), record.internal_job_id.clone());
        let existing = match self.pending.get(&key) {
            Some(row) => Some(row.clone()),
            None => state.rows.lock().await.get(&key).cloned(),
        };

        let present = record
            .present_fields()
            .map(|(name, value)| (name.to_string(), value.clone()));

        match existing {
            None => {
                self.pending.insert(key, present.collect());
                Ok(WriteOutcome::Inserted)
            }
            Some(_) if mode == WriteMode::InsertOnly => Ok(WriteOutcome::Unchanged),
            Some(stored) => {
                let mut merged = stored.clone();
                merged.extend(present);
                if merged == stored {
                    return Ok(WriteOutcome::Unchanged);
                }
                self.pending.insert(key, merged);
                Ok(WriteOutcome::Updated)
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        let MemoryTransaction { sink, pending, .. } = *self;
        sink.ensure_up()?;
        sink.state.rows.lock().await.extend(pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, fields: &[(&str, FieldValue)]) -> NormalizedRecord {
        NormalizedRecord {
            company_slug: "acme".into(),
            internal_job_id: id.into(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_savepoints_undo_one_record() {
        let sink = MemorySink::new();
        let target = UpsertTarget::new("job_postings");
        let mut tx = sink.begin().await.unwrap();

        tx.upsert(&target, &record("1", &[]), WriteMode::Upsert).await.unwrap();
        tx.savepoint().await.unwrap();
        tx.upsert(&target, &record("2", &[]), WriteMode::Upsert).await.unwrap();
        tx.rollback_to_savepoint().await.unwrap();
        assert!(sink.is_empty().await);

        tx.commit().await.unwrap();
        assert_eq!(sink.len().await, 1);
        assert!(sink.row("acme", "2").await.is_none());
    }

    #[tokio::test]
    async fn merge_keeps_columns_missing_from_the_update() {
        let sink = MemorySink::new();
        let target = UpsertTarget::new("job_postings");

        let mut tx = sink.begin().await.unwrap();
        let first = record(
            "1",
            &[
                ("title", FieldValue::Text("Engineer".into())),
                ("location", FieldValue::Text("Remote".into())),
            ],
        );
        assert_eq!(tx.upsert(&target, &first, WriteMode::Upsert).await.unwrap(), WriteOutcome::Inserted);
        tx.commit().await.unwrap();

        let mut tx = sink.begin().await.unwrap();
        let partial = record(
            "1",
            &[
                ("title", FieldValue::Text("Senior Engineer".into())),
                ("location", FieldValue::Null),
            ],
        );
        assert_eq!(tx.upsert(&target, &partial, WriteMode::Upsert).await.unwrap(), WriteOutcome::Updated);
        assert_eq!(tx.upsert(&target, &partial, WriteMode::Upsert).await.unwrap(), WriteOutcome::Unchanged);
        tx.commit().await.unwrap();

        let row = sink.row("acme", "1").await.unwrap();
        assert_eq!(row["title"], FieldValue::Text("Senior Engineer".into()));
        assert_eq!(row["location"], FieldValue::Text("Remote".into()));
    }

    #[tokio::test]
    async fn fatal_failure_takes_the_sink_down() {
        let sink = MemorySink::new().fail_fatally_after(1);
        let target = UpsertTarget::new("job_postings");
        let mut tx = sink.begin().await.unwrap();

        assert!(tx.upsert(&target, &record("1", &[]), WriteMode::Upsert).await.is_ok());
        let err = tx.upsert(&target, &record("2", &[]), WriteMode::Upsert).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(sink.begin().await.is_err());
    }
}
