//! Thin HTTP surface over the import service.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, post},
    Json, Router,
};
use futures::TryStreamExt;
use jobfeed_core::WriteMode;
use jobfeed_decode::PayloadFormat;
use jobfeed_ingest::{BatchSize, ImportOptions, ImportService, IngestConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImportService>,
}

impl AppState {
    pub fn new(service: ImportService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

/// Per-request overrides of the configured import options.
#[derive(Debug, Deserialize, Default)]
struct ImportQuery {
    batch_size: Option<usize>,
    insert_only: Option<bool>,
    dry_run: Option<bool>,
}

impl ImportQuery {
    fn apply(&self, mut options: ImportOptions) -> ImportOptions {
        if let Some(size) = self.batch_size {
            options.batch_size = BatchSize::clamped(size);
        }
        if let Some(insert_only) = self.insert_only {
            options.mode = if insert_only {
                WriteMode::InsertOnly
            } else {
                WriteMode::Upsert
            };
        }
        if let Some(dry_run) = self.dry_run {
            options.dry_run = dry_run;
        }
        options
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/imports", post(import_handler))
        .route("/schema-cache", delete(invalidate_schema_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let port = config.web_port;
    let service = ImportService::connect(config).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for imports");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImportQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let format = match PayloadFormat::from_content_type(content_type) {
        Ok(format) => format,
        Err(err) => {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    };

    let options = query.apply(state.service.config().import_options());
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));

    // The run lives on its own task so a dropped request cancels it instead of
    // abandoning an open transaction.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let service = Arc::clone(&state.service);
    let run = tokio::spawn(async move { service.import(format, reader, options, cancel).await });

    match run.await {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(aborted)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": aborted.to_string(),
                "report": aborted.report,
            })),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "import task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "import task failed" })),
            )
                .into_response()
        }
    }
}

async fn invalidate_schema_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.service.invalidate_schema().await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use jobfeed_core::{FieldKind, SchemaDescriptor, COMPANY_SLUG, INTERNAL_JOB_ID};
    use jobfeed_storage::{MemorySink, StaticSchema};
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn state(sink: &MemorySink) -> AppState {
        let schema: SchemaDescriptor = [
            (COMPANY_SLUG, FieldKind::Text),
            (INTERNAL_JOB_ID, FieldKind::Text),
            ("title", FieldKind::Text),
        ]
        .into_iter()
        .collect();
        AppState::new(ImportService::new(
            IngestConfig::default(),
            Arc::new(sink.clone()),
            Arc::new(StaticSchema(Some(schema))),
        ))
    }

    fn post_import(uri: &str, content_type: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    const NDJSON: &str = concat!(
        r#"{"company_slug":"acme","internal_job_id":"1","title":"Engineer"}"#,
        "\n",
        r#"{"company_slug":"acme","title":"No id"}"#,
        "\n",
        r#"{"company_slug":"acme","internal_job_id":"2","title":"Analyst"}"#,
        "\n",
    );

    #[tokio::test]
    async fn ndjson_import_returns_report() {
        let sink = MemorySink::new();
        let resp = app(state(&sink))
            .oneshot(post_import("/imports", "application/x-ndjson", NDJSON))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let report = json_body(resp).await;
        assert_eq!(report["status"], "completed");
        assert_eq!(report["read"], 3);
        assert_eq!(report["written"], 2);
        assert_eq!(report["rejectedCount"], 1);
        assert_eq!(report["rejected"][0]["reason"], "missing identity fields");
        assert_eq!(sink.len().await, 2);
    }

    #[tokio::test]
    async fn csv_import_with_charset_parameter() {
        let sink = MemorySink::new();
        let resp = app(state(&sink))
            .oneshot(post_import(
                "/imports",
                "text/csv; charset=utf-8",
                "company_slug,internal_job_id,title\nacme,1,Engineer\n",
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["format"], "csv");
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn unsupported_content_type_is_rejected_before_decoding() {
        let sink = MemorySink::new();
        let resp = app(state(&sink))
            .oneshot(post_import("/imports", "application/json", "[]"))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(json_body(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("application/json"));
        assert_eq!(sink.transactions_started(), 0);
    }

    #[tokio::test]
    async fn query_overrides_enable_dry_run() {
        let sink = MemorySink::new();
        let resp = app(state(&sink))
            .oneshot(post_import(
                "/imports?dry_run=true&batch_size=1&insert_only=true",
                "application/x-ndjson",
                NDJSON,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let report = json_body(resp).await;
        assert_eq!(report["dryRun"], true);
        assert_eq!(report["mode"], "insert-only");
        assert_eq!(report["wouldWrite"], 2);
        assert_eq!(report["batches"], 2);
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn fatal_sink_failure_returns_partial_report() {
        let sink = MemorySink::new().fail_fatally_after(1);
        let resp = app(state(&sink))
            .oneshot(post_import("/imports?batch_size=1", "application/x-ndjson", NDJSON))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(resp).await;
        assert_eq!(body["report"]["status"], "aborted");
        assert_eq!(body["report"]["read"], 3);
        assert_eq!(body["report"]["written"], 1);
        assert_eq!(body["report"]["rejectedCount"], 2);
    }

    #[tokio::test]
    async fn schema_cache_can_be_invalidated() {
        let sink = MemorySink::new();
        let resp = app(state(&sink))
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/schema-cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
