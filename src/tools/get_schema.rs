use super::{Tool, ToolContext};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct Args {
    dataset_id: String,
}

pub struct GetSchemaTool;

#[async_trait]
impl Tool for GetSchemaTool {
    fn name(&self) -> &'static str {
        "get_schema"
    }

    fn description(&self) -> &'static str {
        "Return a dataset's column schema."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {"dataset_id": {"type": "string"}},
            "required": ["dataset_id"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> AppResult<serde_json::Value> {
        let args: Args = serde_json::from_value(args).map_err(|e| AppError::BadToolArgs { reason: e.to_string() })?;
        let schema = ctx.app.datasets.get_schema(&args.dataset_id)?;
        Ok(json!({ "columns": schema.columns }))
    }
}
