//! The Agent Loop (spec §4.G): drives the prompt↔tool cycle, enforces step/time/cost
//! budgets, emits a streaming event sequence, and assembles the final response.

use crate::config::{DEADLINE, MAX_STEPS};
use crate::error::AppError;
use crate::llm::{cost_usd, LlmAction, LlmClient, LlmConfig, Message, ToolResultMessage};
use crate::plot::ChartOutput;
use crate::store::Table;
use crate::tools::{execute, AppState, ToolContext, ToolRegistry};
use crate::trace::{Trace, TraceSummary};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

const MAX_CONSECUTIVE_QUERY_FAILURES: u32 = 2;
const LLM_RETRY_BACKOFF_MS: &[u64] = &[250, 1000];

/// Cooperative cancellation token checked at every suspension point (spec §5).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Start { trace_id: String },
    StepStart { step: u32, max_steps: u32 },
    ToolCall { tool: String, args_digest: String },
    ToolResult { tool: String, success: bool, latency_ms: u64, error_code: Option<String> },
    AnswerChunk { content: String },
    Heartbeat,
    Complete { answer: String, tables: Vec<Table>, charts: Vec<ChartOutput>, trace: TraceSummary },
    Error { error_code: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub answer: String,
    pub error_code: Option<String>,
    pub tables: Vec<Table>,
    pub charts: Vec<ChartOutput>,
    pub trace: TraceSummary,
}

pub struct AnalysisRequest {
    pub question: String,
    pub dataset_id: Option<String>,
    pub llm_config: LlmConfig,
}

/// Keeps only the last K query tables in the response (spec §4.G step 5 "last K
/// query tables"); charts accumulate in full since each is small and explicitly
/// requested.
const LAST_K_TABLES: usize = 3;

const SYSTEM_PROMPT: &str = "You answer questions about tabular data. You may only act by invoking the \
registered tools; you must never emit SQL, code, or free-form computation yourself. All filtering, \
grouping, aggregation, derivation, and plotting is performed by the tools. When you have enough \
evidence, respond with a final textual answer and no further tool calls.";

/// Runs one `/analyze` invocation end to end. `events` is `Some` for the streaming
/// endpoint and `None` for the plain JSON endpoint; either way the full
/// `AnalysisResponse` is returned.
pub async fn run(
    request: AnalysisRequest,
    app: AppState,
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    cancel: CancellationToken,
    events: Option<UnboundedSender<AgentEvent>>,
) -> AnalysisResponse {
    let emit = |e: AgentEvent| {
        if let Some(tx) = &events {
            let _ = tx.send(e);
        }
    };

    let mut trace = Trace::new();
    emit(AgentEvent::Start { trace_id: trace.trace_id.clone() });

    let mut messages = vec![Message::system(SYSTEM_PROMPT)];
    let mut user_turn = request.question.clone();
    if let Some(dataset_id) = &request.dataset_id {
        user_turn.push_str(&format!("\n\nDataset: {dataset_id}"));
    }
    messages.push(Message::user(user_turn));

    let tool_ctx = ToolContext::new(app.clone());
    let tool_decls = registry.declarations();

    let deadline_at = Instant::now() + DEADLINE;
    let mut tables: Vec<Table> = Vec::new();
    let mut charts: Vec<ChartOutput> = Vec::new();
    let mut consecutive_query_failures: u32 = 0;
    let mut last_failed_tool: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return terminate(&mut trace, &tables, &charts, AppError::Cancelled, &emit);
        }
        if Instant::now() >= deadline_at {
            return budget_exhausted(&mut trace, &tables, &charts, "deadline exceeded", &emit);
        }

        let step = trace.next_step_index();
        if step >= MAX_STEPS {
            return budget_exhausted(&mut trace, &tables, &charts, "step budget exhausted", &emit);
        }
        emit(AgentEvent::StepStart { step, max_steps: MAX_STEPS });

        let llm_result = call_llm_with_retry(llm.as_ref(), &messages, &tool_decls, &cancel).await;

        let response = match llm_result {
            Ok(r) => r,
            Err(err) => return terminate(&mut trace, &tables, &charts, err, &emit),
        };

        let cost = {
            let (usd, unknown) = cost_usd(llm.provider(), &request.llm_config.model, response.usage);
            if unknown {
                trace.mark_cost_unknown();
            }
            usd
        };

        match response.action {
            LlmAction::Answer { content } => {
                emit(AgentEvent::AnswerChunk { content: content.clone() });
                trace.push(crate::trace::TraceStep {
                    step_index: step,
                    tool_name: "llm_answer".to_string(),
                    args_digest: String::new(),
                    latency_ms: 0,
                    row_count: None,
                    tokens: Some(response.usage.total()),
                    cost_usd: Some(cost),
                    success: true,
                    error_code: None,
                });
                let summary = trace.summary();
                emit(AgentEvent::Complete { answer: content.clone(), tables: tables.clone(), charts: charts.clone(), trace: summary.clone() });
                return AnalysisResponse { answer: content, error_code: None, tables, charts, trace: summary };
            }
            LlmAction::ToolCalls(calls) => {
                messages.push(Message::assistant_tool_calls(calls.clone()));

                for call in calls {
                    if cancel.is_cancelled() {
                        return terminate(&mut trace, &tables, &charts, AppError::Cancelled, &emit);
                    }

                    emit(AgentEvent::ToolCall { tool: call.tool_name.clone(), args_digest: crate::trace::digest_args(&call.args) });

                    let outcome = execute(&registry, &tool_ctx, &call.call_id, &call.tool_name, call.args.clone(), trace.next_step_index()).await;

                    emit(AgentEvent::ToolResult {
                        tool: call.tool_name.clone(),
                        success: outcome.success,
                        latency_ms: outcome.trace_step.latency_ms,
                        error_code: outcome.error_code.clone(),
                    });

                    let mut trace_step = outcome.trace_step;
                    trace_step.cost_usd = Some(0.0);
                    trace.push(trace_step);

                    if outcome.success {
                        consecutive_query_failures = 0;
                        if call.tool_name == "run_query" {
                            if let Ok(table) = serde_json::from_value::<Table>(outcome.payload.clone()) {
                                tables.push(table);
                                if tables.len() > LAST_K_TABLES {
                                    tables.remove(0);
                                }
                            }
                        }
                        if call.tool_name == "plot" {
                            if let Ok(chart) = serde_json::from_value::<ChartOutput>(outcome.payload.clone()) {
                                charts.push(chart);
                            }
                        }
                    } else {
                        let code = outcome.error_code.clone().unwrap_or_default();
                        match code.as_str() {
                            "DATASET_NOT_FOUND" => {
                                let err = AppError::DatasetNotFound { dataset_id: outcome.error_message.clone().unwrap_or_default() };
                                return terminate(&mut trace, &tables, &charts, err, &emit);
                            }
                            "UNKNOWN_TOOL" => {
                                let err = AppError::UnknownTool { tool_name: call.tool_name.clone() };
                                return terminate(&mut trace, &tables, &charts, err, &emit);
                            }
                            "QUERY_FAILED" => {
                                if last_failed_tool.as_deref() == Some(call.tool_name.as_str()) {
                                    consecutive_query_failures += 1;
                                } else {
                                    consecutive_query_failures = 1;
                                }
                                last_failed_tool = Some(call.tool_name.clone());
                                if consecutive_query_failures >= MAX_CONSECUTIVE_QUERY_FAILURES {
                                    let summary = trace.summary();
                                    let answer = "Repeated query failures; answering with the evidence gathered so far.".to_string();
                                    emit(AgentEvent::Complete { answer: answer.clone(), tables: tables.clone(), charts: charts.clone(), trace: summary.clone() });
                                    return AnalysisResponse {
                                        answer,
                                        error_code: Some("QUERY_FAILED".to_string()),
                                        tables,
                                        charts,
                                        trace: summary,
                                    };
                                }
                            }
                            // BAD_SPEC/BAD_PLOT are the only other recoverable codes (spec
                            // §4.G retry policy); the error stays in `messages` as a tool
                            // result and the LLM gets to correct it on its next turn.
                            "BAD_SPEC" | "BAD_PLOT" => {}
                            "QUERY_TIMEOUT" => {
                                return terminate(&mut trace, &tables, &charts, AppError::QueryTimeout, &emit);
                            }
                            other => {
                                let message = outcome.error_message.clone().unwrap_or_default();
                                return terminate_with_code(&mut trace, &tables, &charts, other, message, &emit);
                            }
                        }
                    }

                    messages.push(Message::tool_result(ToolResultMessage {
                        call_id: call.call_id.clone(),
                        content: outcome.payload,
                        is_error: !outcome.success,
                    }));
                }
            }
        }
    }
}

async fn call_llm_with_retry(
    llm: &dyn LlmClient,
    messages: &[Message],
    tools: &[crate::llm::ToolDeclaration],
    cancel: &CancellationToken,
) -> Result<crate::llm::LlmResponse, AppError> {
    let mut last_err = None;
    for (attempt, backoff_ms) in std::iter::once(&0u64).chain(LLM_RETRY_BACKOFF_MS.iter()).enumerate() {
        if attempt > 0 {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            tokio::time::sleep(std::time::Duration::from_millis(*backoff_ms)).await;
        }
        match llm.complete(messages, tools).await {
            Ok(resp) => return Ok(resp),
            Err(err) if matches!(err, AppError::LlmError { .. } | AppError::LlmRateLimited) => {
                last_err = Some(err);
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(AppError::LlmError { message: "exhausted retries".to_string() }))
}

fn terminate(
    trace: &mut Trace,
    tables: &[Table],
    charts: &[ChartOutput],
    err: AppError,
    emit: &dyn Fn(AgentEvent),
) -> AnalysisResponse {
    terminate_with_code(trace, tables, charts, err.code(), err.message(), emit)
}

/// Like [`terminate`], but for error codes observed only as strings off a `ToolOutcome`
/// (a non-recoverable code the executor reported that isn't one of the loop's named
/// special cases) rather than as a concrete `AppError` the loop constructed itself.
fn terminate_with_code(
    trace: &mut Trace,
    tables: &[Table],
    charts: &[ChartOutput],
    code: &str,
    message: String,
    emit: &dyn Fn(AgentEvent),
) -> AnalysisResponse {
    emit(AgentEvent::Error { error_code: code.to_string(), message: message.clone() });
    AnalysisResponse {
        answer: format!("The request failed: {message}"),
        error_code: Some(code.to_string()),
        tables: tables.to_vec(),
        charts: charts.to_vec(),
        trace: trace.summary(),
    }
}

fn budget_exhausted(
    trace: &mut Trace,
    tables: &[Table],
    charts: &[ChartOutput],
    reason: &str,
    emit: &dyn Fn(AgentEvent),
) -> AnalysisResponse {
    let answer = format!("Budget exhausted ({reason}); reporting partial findings from {} step(s).", trace.steps.len());
    let summary = trace.summary();
    emit(AgentEvent::Complete { answer: answer.clone(), tables: tables.to_vec(), charts: charts.to_vec(), trace: summary.clone() });
    AnalysisResponse {
        answer,
        error_code: Some("BUDGET_EXHAUSTED".to_string()),
        tables: tables.to_vec(),
        charts: charts.to_vec(),
        trace: summary,
    }
}
