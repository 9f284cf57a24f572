//! Core record model and import accounting types for jobfeed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-core";

pub const COMPANY_SLUG: &str = "company_slug";
pub const INTERNAL_JOB_ID: &str = "internal_job_id";

/// Columns whose combination forms the conflict key in the store.
pub const IDENTITY_FIELDS: [&str; 2] = [COMPANY_SLUG, INTERNAL_JOB_ID];

pub const DEFAULT_REJECT_REPORT_LIMIT: usize = 50;

/// One decoded line or row, before any schema is applied.
pub type RawRecord = serde_json::Map<String, JsonValue>;

pub fn is_identity_field(name: &str) -> bool {
    IDENTITY_FIELDS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    Json,
    Timestamp,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Json => "json",
            FieldKind::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value already coerced to the primitive kind of its destination column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    Json(JsonValue),
    /// Raw timestamp text; the sink performs the final cast.
    Timestamp(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Timestamp(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Writable destination columns and their primitive kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaDescriptor {
    columns: BTreeMap<String, FieldKind>,
}

impl SchemaDescriptor {
    pub fn new(columns: BTreeMap<String, FieldKind>) -> Self {
        Self { columns }
    }

    pub fn kind_of(&self, column: &str) -> Option<FieldKind> {
        self.columns.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.columns.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, FieldKind)> for SchemaDescriptor {
    fn from_iter<I: IntoIterator<Item = (S, FieldKind)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// A record restricted to writable columns with both identity values present.
///
/// `fields` never contains the identity columns themselves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub company_slug: String,
    pub internal_job_id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl NormalizedRecord {
    pub fn identity(&self) -> (&str, &str) {
        (&self.company_slug, &self.internal_job_id)
    }

    /// Non-identity columns carrying a value. Null fields are treated as absent
    /// when merging into stored rows.
    pub fn present_fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        IDENTITY_FIELDS
            .iter()
            .copied()
            .chain(self.fields.keys().map(String::as_str))
    }
}

/// A normalized record tagged with its 1-based position in the input stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedRecord {
    pub position: u64,
    pub record: NormalizedRecord,
}

/// Safe summary of a record that did not reach storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRecord {
    pub position: u64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl RejectedRecord {
    pub fn new(position: u64, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
            company_slug: None,
            internal_job_id: None,
            excerpt: None,
        }
    }

    pub fn for_staged(staged: &StagedRecord, reason: impl Into<String>) -> Self {
        Self {
            company_slug: Some(staged.record.company_slug.clone()),
            internal_job_id: Some(staged.record.internal_job_id.clone()),
            ..Self::new(staged.position, reason)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    #[default]
    Upsert,
    /// Conflicting identities are left untouched.
    InsertOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// Identity already stored and nothing changed (insert-only conflict or no-op update).
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Aborted,
}

/// Exact counts for one import run plus a capped list of reject details.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub format: String,
    pub mode: WriteMode,
    pub dry_run: bool,
    pub status: RunStatus,
    pub read: u64,
    pub written: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub rejected_count: u64,
    pub rejected: Vec<RejectedRecord>,
    pub batches: u64,
    reject_limit: usize,
}

impl ImportReport {
    pub fn new(format: impl Into<String>, mode: WriteMode, dry_run: bool, reject_limit: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            format: format.into(),
            mode,
            dry_run,
            status: RunStatus::Running,
            read: 0,
            written: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            rejected_count: 0,
            rejected: Vec::new(),
            batches: 0,
            reject_limit,
        }
    }

    pub fn reject_limit(&self) -> usize {
        self.reject_limit
    }

    pub fn record_read(&mut self) {
        self.read += 1;
    }

    /// Counts the reject exactly; keeps the detail only while under the cap.
    pub fn record_rejected(&mut self, rejected: RejectedRecord) {
        self.rejected_count += 1;
        if self.rejected.len() < self.reject_limit {
            self.rejected.push(rejected);
        }
    }

    pub fn record_outcome(&mut self, outcome: WriteOutcome) {
        self.written += 1;
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Dry-run accounting: records that passed validation but were never sent to the sink.
    pub fn record_would_write(&mut self, count: u64) {
        self.written += count;
    }

    pub fn is_balanced(&self) -> bool {
        self.read == self.written + self.rejected_count
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportReportView<'a> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    format: &'a str,
    mode: WriteMode,
    dry_run: bool,
    status: RunStatus,
    read: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    written: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    would_write: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inserted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unchanged: Option<u64>,
    rejected_count: u64,
    rejected: &'a [RejectedRecord],
    batches: u64,
}

impl Serialize for ImportReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let live = !self.dry_run;
        ImportReportView {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            format: &self.format,
            mode: self.mode,
            dry_run: self.dry_run,
            status: self.status,
            read: self.read,
            written: live.then_some(self.written),
            would_write: self.dry_run.then_some(self.written),
            inserted: live.then_some(self.inserted),
            updated: live.then_some(self.updated),
            unchanged: live.then_some(self.unchanged),
            rejected_count: self.rejected_count,
            rejected: &self.rejected,
            batches: self.batches,
        }
        .serialize(serializer)
    }
}
