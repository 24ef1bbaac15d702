//! Tool Registry & Executor (spec §4.D, §4.E): the static table of backend
//! capabilities the LLM may invoke, and the dispatcher that validates, runs, times
//! out, and traces each call. Grounded on the teacher's `Provider`/`ProviderRegistry`
//! pattern, here a `Vec<Box<dyn Tool>>` looked up by name instead of by id.

pub mod create_dataset;
pub mod get_schema;
pub mod plot;
pub mod resolve_fields;
pub mod run_query;
pub mod sample_rows;

use crate::dataset::DatasetRegistry;
use crate::error::{AppError, AppResult};
use crate::ingest::UploadRegistry;
use crate::llm::ToolDeclaration;
use crate::store::{StoreHandle, Table};
use crate::trace::{digest_args, TraceStep};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Process-wide collaborators every tool needs. Cheap to clone (all fields are
/// already `Arc`/cloneable handles).
#[derive(Clone)]
pub struct AppState {
    pub datasets: Arc<DatasetRegistry>,
    pub store: StoreHandle,
    pub uploads: Arc<UploadRegistry>,
}

/// Per-request scratch state: the "most-recent Table" pointer the executor keeps so
/// `plot` can reference the prior `run_query` result (spec §4.E). Never shared
/// across requests.
pub struct ToolContext {
    pub app: AppState,
    pub last_table: Mutex<Option<Table>>,
}

impl ToolContext {
    pub fn new(app: AppState) -> Self {
        Self { app, last_table: Mutex::new(None) }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> AppResult<serde_json::Value>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: vec![
                Box::new(create_dataset::CreateDatasetTool),
                Box::new(get_schema::GetSchemaTool),
                Box::new(sample_rows::SampleRowsTool),
                Box::new(run_query::RunQueryTool),
                Box::new(plot::PlotTool),
                Box::new(resolve_fields::ResolveFieldsTool),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools
            .iter()
            .map(|t| ToolDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ToolOutcome {
    pub call_id: String,
    pub success: bool,
    pub payload: serde_json::Value,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub trace_step: TraceStep,
}

/// Runs one validated tool call end to end: lookup, invoke under a timeout, and
/// produce both the `ToolResult` the LLM sees and the `TraceStep` appended to the
/// request's trace (spec §4.E).
pub async fn execute(
    registry: &ToolRegistry,
    ctx: &ToolContext,
    call_id: &str,
    tool_name: &str,
    args: serde_json::Value,
    step_index: u32,
) -> ToolOutcome {
    let started = Instant::now();
    let digest = digest_args(&args);

    let Some(tool) = registry.get(tool_name) else {
        let err = AppError::UnknownTool { tool_name: tool_name.to_string() };
        return outcome_from_error(call_id, step_index, tool_name, digest, started, err);
    };

    let result = tokio::time::timeout(crate::config::QUERY_TIMEOUT, tool.invoke(ctx, args)).await;

    match result {
        Ok(Ok(payload)) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            let row_count = payload.get("row_count").and_then(|v| v.as_u64()).map(|n| n as usize);
            ToolOutcome {
                call_id: call_id.to_string(),
                success: true,
                payload,
                error_code: None,
                error_message: None,
                trace_step: TraceStep {
                    step_index,
                    tool_name: tool_name.to_string(),
                    args_digest: digest,
                    latency_ms,
                    row_count,
                    tokens: None,
                    cost_usd: None,
                    success: true,
                    error_code: None,
                },
            }
        }
        Ok(Err(err)) => outcome_from_error(call_id, step_index, tool_name, digest, started, err),
        Err(_) => outcome_from_error(call_id, step_index, tool_name, digest, started, AppError::QueryTimeout),
    }
}

fn outcome_from_error(
    call_id: &str,
    step_index: u32,
    tool_name: &str,
    digest: String,
    started: Instant,
    err: AppError,
) -> ToolOutcome {
    let latency_ms = started.elapsed().as_millis() as u64;
    ToolOutcome {
        call_id: call_id.to_string(),
        success: false,
        payload: serde_json::json!({ "error_code": err.code(), "message": err.message() }),
        error_code: Some(err.code().to_string()),
        error_message: Some(err.message()),
        trace_step: TraceStep {
            step_index,
            tool_name: tool_name.to_string(),
            args_digest: digest,
            latency_ms,
            row_count: None,
            tokens: None,
            cost_usd: None,
            success: false,
            error_code: Some(err.code().to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_produces_unknown_tool_error() {
        let app = AppState {
            datasets: Arc::new(DatasetRegistry::new()),
            store: StoreHandle::open_in_memory(1).unwrap(),
            uploads: Arc::new(UploadRegistry::new()),
        };
        let ctx = ToolContext::new(app);
        let registry = ToolRegistry::new();
        let outcome = execute(&registry, &ctx, "call_1", "delete_everything", serde_json::json!({}), 0).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_code.as_deref(), Some("UNKNOWN_TOOL"));
    }
}
