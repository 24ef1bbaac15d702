use super::{Tool, ToolContext};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const MAX_SAMPLE: usize = 100;

#[derive(Deserialize)]
struct Args {
    dataset_id: String,
    n: usize,
    columns: Option<Vec<String>>,
}

pub struct SampleRowsTool;

#[async_trait]
impl Tool for SampleRowsTool {
    fn name(&self) -> &'static str {
        "sample_rows"
    }

    fn description(&self) -> &'static str {
        "Return a deterministic prefix of a dataset's rows."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "dataset_id": {"type": "string"},
                "n": {"type": "integer", "minimum": 1, "maximum": MAX_SAMPLE},
                "columns": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["dataset_id", "n"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> AppResult<serde_json::Value> {
        let args: Args = serde_json::from_value(args).map_err(|e| AppError::BadToolArgs { reason: e.to_string() })?;
        if args.n == 0 || args.n > MAX_SAMPLE {
            return Err(AppError::BadToolArgs { reason: format!("n must be in 1..={MAX_SAMPLE}") });
        }

        let dataset = ctx.app.datasets.get(&args.dataset_id)?;
        if let Some(cols) = &args.columns {
            for c in cols {
                if !dataset.schema.has_column(c) {
                    return Err(AppError::ColumnNotFound { column: c.clone() });
                }
            }
        }

        let table = ctx.app.store.sample(dataset.table_name.clone(), args.n, args.columns.clone()).await?;
        Ok(json!({ "columns": table.columns, "rows": table.rows }))
    }
}
