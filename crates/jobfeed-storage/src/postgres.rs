//! PostgreSQL sink: one transaction per batch, one savepoint per record.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use jobfeed_core::{FieldKind, FieldValue, NormalizedRecord, SchemaDescriptor, WriteMode, WriteOutcome};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use crate::{RecordSink, SchemaSource, SinkError, SinkTransaction, UpsertTarget};

const RECORD_SAVEPOINT: &str = "jobfeed_record";

#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres sink")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordSink for PgSink {
    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| SinkError::Fatal(format!("beginning transaction: {err}")))?;
        Ok(Box::new(PgSinkTransaction { tx }))
    }
}

pub struct PgSinkTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgSinkTransaction {
    async fn control(&mut self, statement: &str) -> Result<(), SinkError> {
        sqlx::query(statement)
            .execute(&mut *self.tx)
            .await
            .map(|_| ())
            .map_err(|err| SinkError::Fatal(format!("{statement}: {err}")))
    }
}

#[async_trait]
impl SinkTransaction for PgSinkTransaction {
    async fn savepoint(&mut self) -> Result<(), SinkError> {
        self.control(&format!("SAVEPOINT {RECORD_SAVEPOINT}")).await
    }

    async fn release_savepoint(&mut self) -> Result<(), SinkError> {
        self.control(&format!("RELEASE SAVEPOINT {RECORD_SAVEPOINT}"))
            .await
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), SinkError> {
        self.control(&format!("ROLLBACK TO SAVEPOINT {RECORD_SAVEPOINT}"))
            .await
    }

    async fn upsert(
        &mut self,
        target: &UpsertTarget,
        record: &NormalizedRecord,
        mode: WriteMode,
    ) -> Result<WriteOutcome, SinkError> {
        let present: Vec<(&str, &FieldValue)> = record.present_fields().collect();
        let sql = build_upsert_sql(target, &present, mode);

        let mut query = sqlx::query(&sql)
            .bind(record.company_slug.clone())
            .bind(record.internal_job_id.clone());
        if target.schemaless {
            if !present.is_empty() {
                let document: BTreeMap<String, FieldValue> = present
                    .iter()
                    .map(|(name, value)| (name.to_string(), (*value).clone()))
                    .collect();
                query = query.bind(sqlx::types::Json(document));
            }
        } else {
            for (_, value) in &present {
                query = bind_field(query, value);
            }
        }

        let row = query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify_sqlx_error)?;

        match row {
            None => Ok(WriteOutcome::Unchanged),
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(classify_sqlx_error)?;
                Ok(if inserted {
                    WriteOutcome::Inserted
                } else {
                    WriteOutcome::Updated
                })
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        self.tx
            .commit()
            .await
            .map_err(|err| SinkError::Fatal(format!("committing batch: {err}")))
    }

    async fn rollback(self: Box<Self>) -> Result<(), SinkError> {
        self.tx
            .rollback()
            .await
            .map_err(|err| SinkError::Fatal(format!("rolling back batch: {err}")))
    }
}

fn bind_field<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &FieldValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        FieldValue::Null => query.bind(Option::<String>::None),
        FieldValue::Text(text) | FieldValue::Timestamp(text) => query.bind(text.clone()),
        FieldValue::Number(number) => query.bind(*number),
        FieldValue::Boolean(flag) => query.bind(*flag),
        FieldValue::Json(json) => query.bind(sqlx::types::Json(json.clone())),
    }
}

/// Per-row database errors are recoverable; connection, resource and
/// operator-intervention classes (08, 53, 57, 58) and transport errors are not.
pub fn classify_sqlx_error(err: sqlx::Error) -> SinkError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if ["08", "53", "57", "58"].iter().any(|class| code.starts_with(class)) {
                SinkError::Fatal(err.to_string())
            } else if code.is_empty() {
                SinkError::Record(db.message().to_string())
            } else {
                SinkError::Record(format!("{} (sqlstate {code})", db.message()))
            }
        }
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            SinkError::Record(err.to_string())
        }
        _ => SinkError::Fatal(err.to_string()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Builds the single-record upsert. Only columns carrying a value are written,
/// so stored values for omitted columns survive (merge-on-missing). Updates that
/// would change nothing are filtered out and report no row.
///
/// For a schemaless target the non-identity values arrive as one jsonb
/// parameter (`$3`) and `jsonb_populate_record` converts them to the column types.
pub fn build_upsert_sql(
    target: &UpsertTarget,
    present: &[(&str, &FieldValue)],
    mode: WriteMode,
) -> String {
    let table = quote_table(&target.table);
    let mut columns: Vec<String> = target.key_columns.iter().map(|c| quote_ident(c)).collect();
    let mut placeholders = vec!["$1".to_string(), "$2".to_string()];

    for (idx, (name, value)) in present.iter().enumerate() {
        let n = idx + 3;
        let col = quote_ident(name);
        placeholders.push(match value {
            _ if target.schemaless => format!("src.{col}"),
            FieldValue::Timestamp(_) => format!("CAST(${n} AS timestamptz)"),
            _ => format!("${n}"),
        });
        columns.push(col);
    }

    let source = if target.schemaless && !present.is_empty() {
        format!(
            "SELECT {} FROM jsonb_populate_record(NULL::{table}, $3) AS src",
            placeholders.join(", ")
        )
    } else {
        format!("VALUES ({})", placeholders.join(", "))
    };

    let conflict_action = match mode {
        WriteMode::Upsert if !present.is_empty() => {
            let updates = present
                .iter()
                .map(|(name, _)| {
                    let col = quote_ident(name);
                    format!("{col} = EXCLUDED.{col}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            let changed = present
                .iter()
                .map(|(name, _)| {
                    let col = quote_ident(name);
                    format!("target.{col}::text IS DISTINCT FROM EXCLUDED.{col}::text")
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            format!("DO UPDATE SET {updates} WHERE {changed}")
        }
        _ => "DO NOTHING".to_string(),
    };

    format!(
        "INSERT INTO {table} AS target ({columns}) {source} \
         ON CONFLICT ({keys}) {conflict_action} \
         RETURNING (xmax = 0) AS inserted",
        columns = columns.join(", "),
        keys = target
            .key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Maps an `information_schema.columns.data_type` to the kind the coercer targets.
pub fn kind_for_pg_type(data_type: &str) -> Option<FieldKind> {
    match data_type {
        "text" | "character varying" | "character" | "citext" => Some(FieldKind::Text),
        "smallint" | "integer" | "bigint" | "numeric" | "real" | "double precision" => {
            Some(FieldKind::Number)
        }
        "boolean" => Some(FieldKind::Boolean),
        "json" | "jsonb" => Some(FieldKind::Json),
        "timestamp with time zone" | "timestamp without time zone" | "date" => {
            Some(FieldKind::Timestamp)
        }
        _ => None,
    }
}

/// Introspects the target table's writable columns.
#[derive(Debug, Clone)]
pub struct PgSchemaSource {
    pool: PgPool,
    table: String,
}

impl PgSchemaSource {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl SchemaSource for PgSchemaSource {
    async fn writable_columns(&self) -> anyhow::Result<Option<SchemaDescriptor>> {
        let (schema, table) = match self.table.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, self.table.as_str()),
        };

        let rows = sqlx::query(
            r#"
            SELECT column_name, data_type, is_identity, is_generated, column_default
              FROM information_schema.columns
             WHERE table_schema = COALESCE($1, current_schema())
               AND table_name = $2
             ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("introspecting columns of {}", self.table))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            let is_identity: Option<String> = row.try_get("is_identity")?;
            let is_generated: Option<String> = row.try_get("is_generated")?;
            let column_default: Option<String> = row.try_get("column_default")?;

            let generated = is_identity.as_deref() == Some("YES")
                || is_generated.as_deref() == Some("ALWAYS")
                || column_default
                    .as_deref()
                    .is_some_and(|d| d.starts_with("nextval("));
            if generated {
                continue;
            }
            match kind_for_pg_type(&data_type) {
                Some(kind) => columns.push((name, kind)),
                None => debug!(column = %name, data_type, "skipping column of unsupported type"),
            }
        }

        Ok(Some(columns.into_iter().collect()))
    }
}
