//! Sink and schema capabilities for jobfeed, plus the HTTP feed fetcher.

use std::sync::Arc;

use async_trait::async_trait;
use jobfeed_core::{NormalizedRecord, SchemaDescriptor, WriteMode, WriteOutcome, IDENTITY_FIELDS};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

mod fetch;
mod memory;
mod postgres;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FeedBody, FeedResponse, FetchError,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemorySink;
pub use postgres::{
    build_upsert_sql, classify_sqlx_error, kind_for_pg_type, PgSchemaSource, PgSink,
    PgSinkTransaction,
};

pub const CRATE_NAME: &str = "jobfeed-storage";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The sink refused one record's values; the transaction can be recovered.
    #[error("{0}")]
    Record(String),
    /// The sink or its transport is unusable; nothing more can be written in this run.
    #[error("sink unavailable: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Fatal(_))
    }
}

/// Destination table and the conflict key used for every upsert into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertTarget {
    pub table: String,
    pub key_columns: [&'static str; 2],
    /// Values were not coerced against a schema; the sink converts them to
    /// the column types itself.
    pub schemaless: bool,
}

impl UpsertTarget {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_columns: IDENTITY_FIELDS,
            schemaless: false,
        }
    }

    pub fn schemaless(mut self) -> Self {
        self.schemaless = true;
        self
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError>;
}

/// One open transaction. A savepoint brackets each record so a failed
/// statement can be undone without losing the rest of the batch.
#[async_trait]
pub trait SinkTransaction: Send {
    async fn savepoint(&mut self) -> Result<(), SinkError>;

    async fn release_savepoint(&mut self) -> Result<(), SinkError>;

    async fn rollback_to_savepoint(&mut self) -> Result<(), SinkError>;

    async fn upsert(
        &mut self,
        target: &UpsertTarget,
        record: &NormalizedRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, SinkError>;

    async fn commit(self: Box<Self>) -> Result<(), SinkError>;

    async fn rollback(self: Box<Self>) -> Result<(), SinkError>;
}

#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// `Ok(None)` means the capability exists but knows nothing about the target.
    async fn writable_columns(&self) -> anyhow::Result<Option<SchemaDescriptor>>;
}

/// Fixed descriptor, or none at all for pass-through normalization.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema(pub Option<SchemaDescriptor>);

#[async_trait]
impl SchemaSource for StaticSchema {
    async fn writable_columns(&self) -> anyhow::Result<Option<SchemaDescriptor>> {
        Ok(self.0.clone())
    }
}

/// Process-wide descriptor cache. Loaded on first use, cleared only by [`SchemaCache::invalidate`].
pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    cached: RwLock<Option<Arc<SchemaDescriptor>>>,
}

impl SchemaCache {
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }

    /// Returns the cached descriptor, loading it if needed. `None` puts the
    /// caller in pass-through mode; failed loads are retried on the next call.
    pub async fn get(&self) -> Option<Arc<SchemaDescriptor>> {
        if let Some(schema) = self.cached.read().await.as_ref() {
            return Some(Arc::clone(schema));
        }

        let mut slot = self.cached.write().await;
        if let Some(schema) = slot.as_ref() {
            return Some(Arc::clone(schema));
        }

        match self.source.writable_columns().await {
            Ok(Some(schema)) if !schema.is_empty() => {
                info!(columns = schema.len(), "loaded writable column schema");
                let schema = Arc::new(schema);
                *slot = Some(Arc::clone(&schema));
                Some(schema)
            }
            Ok(_) => {
                warn!("schema capability returned no writable columns; using pass-through normalization");
                None
            }
            Err(err) => {
                warn!(error = %err, "schema introspection failed; using pass-through normalization");
                None
            }
        }
    }

    pub async fn invalidate(&self) {
        let previous = self.cached.write().await.take();
        if previous.is_some() {
            info!("schema cache invalidated");
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.cached.read().await.is_some()
    }
}
