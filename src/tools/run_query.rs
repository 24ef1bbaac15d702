use super::{Tool, ToolContext};
use crate::error::{AppError, AppResult};
use crate::query::compiler::compile_and_run;
use crate::query::QuerySpec;
use async_trait::async_trait;
use serde_json::json;

pub struct RunQueryTool;

#[async_trait]
impl Tool for RunQueryTool {
    fn name(&self) -> &'static str {
        "run_query"
    }

    fn description(&self) -> &'static str {
        "Execute a QuerySpec (filter/group/aggregate/derive/sort) over a dataset."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "dataset_id": {"type": "string"},
                "filters": {"type": "array"},
                "group_by": {"type": "array", "items": {"type": "string"}},
                "aggregations": {"type": "array"},
                "derived": {"type": "array"},
                "sort": {"type": "array"},
                "limit": {"type": "integer", "minimum": 1, "maximum": crate::query::MAX_ROWS}
            },
            "required": ["dataset_id"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> AppResult<serde_json::Value> {
        let spec: QuerySpec = serde_json::from_value(args).map_err(|e| AppError::BadToolArgs { reason: e.to_string() })?;
        let dataset = ctx.app.datasets.get(&spec.dataset_id)?;
        let table = compile_and_run(&spec, &dataset, &ctx.app.store).await?;

        *ctx.last_table.lock().await = Some(table.clone());

        Ok(json!({
            "columns": table.columns,
            "rows": table.rows,
            "row_count": table.row_count,
            "truncated": table.truncated,
        }))
    }
}
