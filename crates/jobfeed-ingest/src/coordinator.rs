//! One import run: decode, normalize, batch, flush, report.

use std::sync::Arc;

use jobfeed_core::{ImportReport, RejectedRecord, RunStatus, SchemaDescriptor, StagedRecord, WriteMode};
use jobfeed_decode::{DecodeError, DecodeEvent, RecordDecoder};
use jobfeed_storage::SinkError;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::batch::{BatchSize, Batcher};
use crate::executor::UpsertExecutor;
use crate::normalize::Normalizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    Streaming,
    Flushing { last: bool },
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    pub batch_size: BatchSize,
    pub mode: WriteMode,
    pub dry_run: bool,
    pub reject_report_limit: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::default(),
            mode: WriteMode::Upsert,
            dry_run: false,
            reject_report_limit: jobfeed_core::DEFAULT_REJECT_REPORT_LIMIT,
        }
    }
}

#[derive(Debug, Error)]
pub enum AbortCause {
    #[error("sink unusable: {0}")]
    Sink(SinkError),
    #[error("input stream failed: {0}")]
    Source(DecodeError),
}

/// A run that ended early on a fatal fault. The report still balances.
#[derive(Debug, Error)]
#[error("import {} aborted: {cause}", .report.run_id)]
pub struct ImportAborted {
    pub report: ImportReport,
    #[source]
    pub cause: AbortCause,
}

pub struct ImportCoordinator {
    options: ImportOptions,
    normalizer: Normalizer,
    schema: Option<Arc<SchemaDescriptor>>,
    executor: UpsertExecutor,
    cancel: CancellationToken,
    state: watch::Sender<ImportState>,
}

impl ImportCoordinator {
    /// `schema: None` runs in pass-through mode.
    pub fn new(
        options: ImportOptions,
        normalizer: Normalizer,
        schema: Option<Arc<SchemaDescriptor>>,
        executor: UpsertExecutor,
    ) -> Self {
        Self {
            options,
            normalizer,
            schema,
            executor,
            cancel: CancellationToken::new(),
            state: watch::channel(ImportState::Idle).0,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ImportState {
        *self.state.borrow()
    }

    /// Follows the run's state after `run` has taken ownership of the coordinator.
    pub fn subscribe(&self) -> watch::Receiver<ImportState> {
        self.state.subscribe()
    }

    /// Consumes the coordinator; a new run needs a new coordinator and a fresh stream.
    pub async fn run<R>(self, decoder: RecordDecoder<R>) -> Result<ImportReport, ImportAborted>
    where
        R: AsyncRead + Unpin + Send,
    {
        let report = ImportReport::new(
            decoder.format().as_str(),
            self.options.mode,
            self.options.dry_run,
            self.options.reject_report_limit,
        );
        let span = info_span!(
            "import",
            run_id = %report.run_id,
            format = decoder.format().as_str(),
            mode = ?self.options.mode,
            dry_run = self.options.dry_run,
        );
        self.drive(decoder, report).instrument(span).await
    }

    async fn drive<R>(
        mut self,
        mut decoder: RecordDecoder<R>,
        mut report: ImportReport,
    ) -> Result<ImportReport, ImportAborted>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.schema.is_none() {
            info!("no writable schema available; importing in pass-through mode");
        }
        self.transition(ImportState::Streaming);
        let mut batcher = Batcher::new(self.options.batch_size);
        let mut cancelled = false;

        let source_failure = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break None;
                }
                event = decoder.next_event() => event,
            };

            match event {
                Ok(Some(DecodeEvent::Record { position, record })) => {
                    report.record_read();
                    match self.normalizer.normalize(position, record, self.schema.as_deref()) {
                        Ok(staged) => {
                            if let Some(batch) = batcher.add(staged) {
                                if let Err(err) = self.flush(batch, false, &mut report).await {
                                    return Err(self.abort(report, AbortCause::Sink(err)));
                                }
                            }
                        }
                        Err(rejected) => {
                            debug!(
                                position,
                                company_slug = rejected.company_slug.as_deref(),
                                internal_job_id = rejected.internal_job_id.as_deref(),
                                reason = %rejected.reason,
                                "record rejected"
                            );
                            report.record_rejected(rejected);
                        }
                    }
                }
                Ok(Some(DecodeEvent::Malformed {
                    position,
                    reason,
                    excerpt,
                })) => {
                    debug!(position, %reason, "undecodable input skipped");
                    report.record_read();
                    report.record_rejected(RejectedRecord {
                        excerpt: Some(excerpt),
                        ..RejectedRecord::new(position, reason)
                    });
                }
                Ok(None) => break None,
                Err(err) => break Some(err),
            }
        };

        if cancelled {
            info!(pending = batcher.pending(), "import cancelled; flushing buffered records");
        }

        // Records already accepted into the buffer are written even when the source failed.
        if let Some(batch) = batcher.drain() {
            if let Err(err) = self.flush(batch, true, &mut report).await {
                return Err(self.abort(report, AbortCause::Sink(err)));
            }
        }

        if let Some(err) = source_failure {
            return Err(self.abort(report, AbortCause::Source(err)));
        }

        self.transition(ImportState::Done);
        report.finish(if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        });
        info!(
            read = report.read,
            written = report.written,
            rejected = report.rejected_count,
            batches = report.batches,
            status = ?report.status,
            "import finished"
        );
        Ok(report)
    }

    fn transition(&mut self, next: ImportState) {
        let previous = self.state.send_replace(next);
        tracing::trace!(from = ?previous, to = ?next, "import state");
    }

    async fn flush(
        &mut self,
        batch: Vec<StagedRecord>,
        last: bool,
        report: &mut ImportReport,
    ) -> Result<(), SinkError> {
        self.transition(ImportState::Flushing { last });
        report.batches += 1;

        if self.options.dry_run {
            report.record_would_write(batch.len() as u64);
        } else {
            match self.executor.apply(&batch).await {
                Ok(result) => {
                    for outcome in result.outcomes {
                        report.record_outcome(outcome);
                    }
                    for rejected in result.errors {
                        report.record_rejected(rejected);
                    }
                }
                Err(err) => {
                    error!(error = %err, size = batch.len(), "batch failed; aborting import");
                    let reason = format!("batch aborted: {err}");
                    for staged in &batch {
                        report.record_rejected(RejectedRecord::for_staged(staged, reason.clone()));
                    }
                    return Err(err);
                }
            }
        }

        if !last {
            self.transition(ImportState::Streaming);
        }
        Ok(())
    }

    fn abort(&mut self, mut report: ImportReport, cause: AbortCause) -> ImportAborted {
        self.transition(ImportState::Aborted);
        report.finish(RunStatus::Aborted);
        warn!(
            read = report.read,
            written = report.written,
            rejected = report.rejected_count,
            %cause,
            "import aborted"
        );
        ImportAborted { report, cause }
    }
}
