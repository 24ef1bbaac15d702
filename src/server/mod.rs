//! HTTP surface (spec §6): `POST /analyze`, `POST /analyze/stream` (SSE), dataset
//! creation/schema lookup, and file upload. Grounded on the teacher's
//! `otlp::start_receiver` router shape (one `Router` built against a cloneable
//! `AppState`, `tower-http`'s permissive CORS layer, `axum::serve` over a bound
//! `TcpListener`), generalized from a fire-and-forget telemetry receiver into a
//! request/response (and request/SSE-stream) API.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::agent::{self, AgentEvent, AnalysisRequest, AnalysisResponse, CancellationToken};
use crate::error::AppError;
use crate::llm::{self, LlmConfig};
use crate::tools::{AppState, ToolRegistry};

#[derive(Clone)]
pub struct ServerState {
    pub app: AppState,
    pub registry: Arc<ToolRegistry>,
    pub default_llm_config: Option<LlmConfig>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/analyze", post(handle_analyze))
        .route("/analyze/stream", post(handle_analyze_stream))
        .route("/dataset/create", post(handle_dataset_create))
        .route("/dataset/:id/schema", get(handle_dataset_schema))
        .route("/upload", post(handle_upload))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(bind: &str, state: ServerState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(err: AppError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error_code": err.code(), "message": err.message() }))).into_response()
}

fn resolve_llm_config(state: &ServerState, requested: Option<LlmConfig>) -> Result<LlmConfig, AppError> {
    requested
        .or_else(|| state.default_llm_config.clone())
        .ok_or_else(|| AppError::LlmError { message: "no llm_config supplied and no server default configured".to_string() })
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    question: String,
    #[serde(default)]
    dataset_id: Option<String>,
    #[serde(default)]
    llm_config: Option<LlmConfig>,
}

/// `POST /analyze`: runs the agent loop to completion and returns the assembled
/// `AnalysisResponse` as a single JSON body (spec §6).
async fn handle_analyze(State(state): State<ServerState>, Json(req): Json<AnalyzeRequest>) -> Response {
    let llm_config = match resolve_llm_config(&state, req.llm_config) {
        Ok(c) => c,
        Err(err) => return error_response(err),
    };
    let client = match llm::build_client(&llm_config) {
        Ok(c) => Arc::from(c),
        Err(err) => return error_response(err),
    };

    let request = AnalysisRequest { question: req.question, dataset_id: req.dataset_id, llm_config };
    let response: AnalysisResponse =
        agent::run(request, state.app.clone(), state.registry.clone(), client, CancellationToken::new(), None).await;

    let status = match &response.error_code {
        Some(code) => status_for_error_code(code),
        None => StatusCode::OK,
    };
    (status, Json(response)).into_response()
}

fn status_for_error_code(code: &str) -> StatusCode {
    match code {
        "DATASET_NOT_FOUND" | "COLUMN_NOT_FOUND" => StatusCode::NOT_FOUND,
        "BAD_SPEC" | "BAD_PLOT" | "BAD_TOOL_ARGS" | "UNKNOWN_TOOL" => StatusCode::BAD_REQUEST,
        "QUERY_FAILED" => StatusCode::UNPROCESSABLE_ENTITY,
        "QUERY_TIMEOUT" | "BUDGET_EXHAUSTED" => StatusCode::GATEWAY_TIMEOUT,
        "LLM_RATE_LIMITED" => StatusCode::TOO_MANY_REQUESTS,
        "LLM_ERROR" => StatusCode::BAD_GATEWAY,
        "CANCELLED" => StatusCode::from_u16(499).unwrap(),
        _ => StatusCode::OK,
    }
}

/// `POST /analyze/stream`: the same agent loop, but progress is pushed to the client
/// as Server-Sent Events (`AgentEvent` per spec §6), terminating with `complete` or
/// `error`.
async fn handle_analyze_stream(
    State(state): State<ServerState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let llm_config = resolve_llm_config(&state, req.llm_config).map_err(error_response)?;
    let client: Arc<dyn llm::LlmClient> = match llm::build_client(&llm_config) {
        Ok(c) => Arc::from(c),
        Err(err) => return Err(error_response(err)),
    };

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
    let request = AnalysisRequest { question: req.question, dataset_id: req.dataset_id, llm_config };
    let app = state.app.clone();
    let registry = state.registry.clone();

    tokio::spawn(async move {
        let heartbeat_tx = tx.clone();
        let run_fut = agent::run(request, app, registry, client, CancellationToken::new(), Some(tx));
        tokio::pin!(run_fut);
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut run_fut => break,
                _ = ticker.tick() => {
                    if heartbeat_tx.send(AgentEvent::Heartbeat).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let name = event_name(&event);
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(name).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("heartbeat")))
}

/// Matches spec §6's SSE framing (`event: <name>\ndata: <json>`); kept independent
/// of `AgentEvent`'s serde tag so the named frame and the payload shape can evolve
/// separately.
fn event_name(event: &AgentEvent) -> &'static str {
    match event {
        AgentEvent::Start { .. } => "start",
        AgentEvent::StepStart { .. } => "step_start",
        AgentEvent::ToolCall { .. } => "tool_call",
        AgentEvent::ToolResult { .. } => "tool_result",
        AgentEvent::AnswerChunk { .. } => "answer_chunk",
        AgentEvent::Heartbeat => "heartbeat",
        AgentEvent::Complete { .. } => "complete",
        AgentEvent::Error { .. } => "error",
    }
}

#[derive(Debug, Deserialize)]
struct DatasetCreateRequest {
    file_id: String,
    #[serde(default)]
    sheet: Option<String>,
    #[serde(default)]
    header_row: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DatasetCreateResponse {
    dataset_id: String,
    schema: crate::dataset::Schema,
    row_count: u64,
}

/// `POST /dataset/create`: the non-LLM-mediated path to register an uploaded file,
/// for clients that want to materialize a dataset without going through `/analyze`.
async fn handle_dataset_create(State(state): State<ServerState>, Json(req): Json<DatasetCreateRequest>) -> Response {
    let bytes = match state.app.uploads.take(&req.file_id) {
        Ok(b) => b,
        Err(err) => return error_response(err),
    };
    let parsed = match crate::ingest::parse_csv(&bytes, req.header_row.unwrap_or(0), req.sheet.as_deref()) {
        Ok(p) => p,
        Err(err) => return error_response(err),
    };

    let dataset_id = Uuid::new_v4().to_string();
    let table_name = format!("t_{}", dataset_id.replace('-', "_"));
    let schema = crate::store::infer_schema(&parsed.columns, &parsed.rows);

    if let Err(err) = state.app.store.create_table(table_name.clone(), schema.columns.clone(), parsed.rows.clone()).await {
        return error_response(err);
    }

    let row_count = parsed.rows.len() as u64;
    let dataset = state.app.datasets.register(dataset_id, table_name, schema.clone(), row_count, None);

    Json(DatasetCreateResponse { dataset_id: dataset.dataset_id.clone(), schema, row_count }).into_response()
}

/// `GET /dataset/{id}/schema`.
async fn handle_dataset_schema(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    match state.app.datasets.get_schema(&id) {
        Ok(schema) => Json(schema).into_response(),
        Err(err) => error_response(err),
    }
}

/// `POST /upload` (multipart): stages raw file bytes under a fresh `file_id` for a
/// later `create_dataset`/`/dataset/create` call. Spec §6 leaves the upload transport
/// unspecified beyond "accepts a file"; multipart is the natural axum idiom here.
async fn handle_upload(State(state): State<ServerState>, mut multipart: Multipart) -> Response {
    let field = match multipart.next_field().await {
        Ok(Some(f)) => f,
        Ok(None) => return error_response(AppError::bad_spec("upload", "no file field in multipart body")),
        Err(e) => return error_response(AppError::bad_spec("upload", e.to_string())),
    };

    let bytes = match field.bytes().await {
        Ok(b) => b,
        Err(e) => return error_response(AppError::bad_spec("upload", e.to_string())),
    };

    let file_id = Uuid::new_v4().to_string();
    match state.app.uploads.put(file_id.clone(), bytes.to_vec()) {
        Ok(()) => Json(json!({ "file_id": file_id })).into_response(),
        Err(err) => error_response(err),
    }
}
