//! Applies one batch inside one transaction, isolating per-record failures.

use std::sync::Arc;

use jobfeed_core::{RejectedRecord, StagedRecord, WriteMode, WriteOutcome};
use jobfeed_storage::{RecordSink, SinkError, SinkTransaction, UpsertTarget};
use tracing::{debug, warn};

/// Outcome of a committed batch. Counts only exist once the commit succeeded.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchResult {
    pub outcomes: Vec<WriteOutcome>,
    pub errors: Vec<RejectedRecord>,
}

impl BatchResult {
    pub fn written(&self) -> usize {
        self.outcomes.len()
    }
}

pub struct UpsertExecutor {
    sink: Arc<dyn RecordSink>,
    target: UpsertTarget,
    mode: WriteMode,
}

impl UpsertExecutor {
    pub fn new(sink: Arc<dyn RecordSink>, target: UpsertTarget, mode: WriteMode) -> Self {
        Self { sink, target, mode }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Writes every record of `batch` in one transaction. A record the sink
    /// refuses is rolled back to its savepoint and reported; the rest of the
    /// batch still commits. Any fatal error rolls back the whole batch.
    pub async fn apply(&self, batch: &[StagedRecord]) -> Result<BatchResult, SinkError> {
        let mut tx = self.sink.begin().await.map_err(into_fatal)?;
        let mut result = BatchResult {
            outcomes: Vec::with_capacity(batch.len()),
            errors: Vec::new(),
        };

        for staged in batch {
            if let Err(err) = tx.savepoint().await {
                return Err(abandon(tx, err).await);
            }

            match tx.upsert(&self.target, &staged.record, self.mode).await {
                Ok(outcome) => {
                    if let Err(err) = tx.release_savepoint().await {
                        return Err(abandon(tx, err).await);
                    }
                    result.outcomes.push(outcome);
                }
                Err(SinkError::Record(reason)) => {
                    warn!(
                        position = staged.position,
                        company_slug = %staged.record.company_slug,
                        internal_job_id = %staged.record.internal_job_id,
                        %reason,
                        "record rejected by sink (isolated with savepoint)"
                    );
                    if let Err(err) = tx.rollback_to_savepoint().await {
                        return Err(abandon(tx, err).await);
                    }
                    result.errors.push(RejectedRecord::for_staged(staged, reason));
                }
                Err(fatal) => return Err(abandon(tx, fatal).await),
            }
        }

        tx.commit().await.map_err(into_fatal)?;
        debug!(
            size = batch.len(),
            written = result.written(),
            rejected = result.errors.len(),
            "batch committed"
        );
        Ok(result)
    }
}

async fn abandon(tx: Box<dyn SinkTransaction>, err: SinkError) -> SinkError {
    if let Err(rollback_err) = tx.rollback().await {
        debug!(error = %rollback_err, "rollback after fatal sink error also failed");
    }
    into_fatal(err)
}

/// Failures outside a single record's statement cannot be isolated.
fn into_fatal(err: SinkError) -> SinkError {
    match err {
        SinkError::Record(message) => SinkError::Fatal(message),
        fatal => fatal,
    }
}
