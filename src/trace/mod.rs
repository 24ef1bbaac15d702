//! Trace/Audit (spec §2 component H, elaborated in §4.H): accumulates `TraceStep`
//! records under a `trace_id`, suitable for replay and cost attribution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step_index: u32,
    pub tool_name: String,
    pub args_digest: String,
    pub latency_ms: u64,
    pub row_count: Option<usize>,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub success: bool,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub total_steps: u32,
    pub duration_ms: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub cost_unknown: bool,
}

/// Append-only record of one `/analyze` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub steps: Vec<TraceStep>,
    #[serde(skip)]
    started_at: Option<std::time::Instant>,
    cost_unknown: bool,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            steps: Vec::new(),
            started_at: Some(std::time::Instant::now()),
            cost_unknown: false,
        }
    }

    pub fn push(&mut self, step: TraceStep) {
        self.steps.push(step);
    }

    pub fn mark_cost_unknown(&mut self) {
        self.cost_unknown = true;
    }

    pub fn next_step_index(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0)
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            total_steps: self.steps.len() as u32,
            duration_ms: self.elapsed_ms(),
            total_tokens: self.steps.iter().filter_map(|s| s.tokens).sum(),
            total_cost_usd: self.steps.iter().filter_map(|s| s.cost_usd).sum(),
            cost_unknown: self.cost_unknown,
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

/// Digests tool arguments for the trace without retaining the raw payload (which may
/// contain user data or, post-ingestion, dataset cell contents).
pub fn digest_args(args: &serde_json::Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    args.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_sums_steps() {
        let mut trace = Trace::new();
        trace.push(TraceStep {
            step_index: 0,
            tool_name: "run_query".into(),
            args_digest: "abc".into(),
            latency_ms: 10,
            row_count: Some(5),
            tokens: Some(100),
            cost_usd: Some(0.01),
            success: true,
            error_code: None,
        });
        trace.push(TraceStep {
            step_index: 1,
            tool_name: "plot".into(),
            args_digest: "def".into(),
            latency_ms: 5,
            row_count: None,
            tokens: Some(50),
            cost_usd: Some(0.005),
            success: true,
            error_code: None,
        });
        let summary = trace.summary();
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.total_tokens, 150);
        assert!((summary.total_cost_usd - 0.015).abs() < 1e-9);
    }

    #[test]
    fn digest_is_stable_for_same_args() {
        let a = serde_json::json!({"dataset_id": "sales", "n": 5});
        let b = serde_json::json!({"dataset_id": "sales", "n": 5});
        assert_eq!(digest_args(&a), digest_args(&b));
    }
}
