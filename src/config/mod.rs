//! Process configuration: CLI flags (bind address, store location, pool size) and
//! the LLM credentials environment fallback. Config loading itself sits outside the
//! core (spec §1 lists it as an external collaborator); this module is the thin
//! ambient layer a runnable binary still needs, in the teacher's `clap` + `dirs` style.

use crate::llm::{LlmConfig, Provider};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const MAX_STEPS: u32 = 8;
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEADLINE: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "tabql", about = "Answers natural-language questions over tabular data via a tool-calling agent loop")]
pub struct Args {
    /// Address the HTTP server binds to
    #[arg(short = 'b', long, default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Path to the DuckDB file backing the analytical store
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Number of worker connections in the store pool
    #[arg(long, default_value_t = 4)]
    pub pool_size: usize,
}

impl Args {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("tabql").join("store.duckdb")
        })
    }
}

/// Reads a server-default `LlmConfig` from the environment, used when a request's
/// `llm_config` is omitted (spec §6: all fields optional except `provider`/`api_key`
/// at the protocol level; a deployment may still want a process-wide default).
pub fn llm_config_from_env() -> Option<LlmConfig> {
    let provider = match std::env::var("TABQL_LLM_PROVIDER").ok()?.to_lowercase().as_str() {
        "openai" => Provider::OpenAi,
        "anthropic" => Provider::Anthropic,
        _ => return None,
    };
    let api_key = std::env::var("TABQL_LLM_API_KEY").ok()?;
    let model = std::env::var("TABQL_LLM_MODEL").ok()?;
    let base_url = std::env::var("TABQL_LLM_BASE_URL").ok();
    Some(LlmConfig { provider, api_key, base_url, model })
}
