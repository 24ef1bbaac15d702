use super::{Tool, ToolContext};
use crate::error::{AppError, AppResult};
use crate::ingest::parse_csv;
use crate::store::infer_schema;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize)]
struct Args {
    file_id: String,
    sheet: Option<String>,
    header_row: Option<usize>,
}

pub struct CreateDatasetTool;

#[async_trait]
impl Tool for CreateDatasetTool {
    fn name(&self) -> &'static str {
        "create_dataset"
    }

    fn description(&self) -> &'static str {
        "Register a previously uploaded file as a queryable dataset."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_id": {"type": "string"},
                "sheet": {"type": "string"},
                "header_row": {"type": "integer", "minimum": 0}
            },
            "required": ["file_id"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> AppResult<serde_json::Value> {
        let args: Args = serde_json::from_value(args)
            .map_err(|e| AppError::BadToolArgs { reason: e.to_string() })?;

        let bytes = ctx.app.uploads.take(&args.file_id)?;
        let parsed = parse_csv(&bytes, args.header_row.unwrap_or(0), args.sheet.as_deref())?;

        let dataset_id = Uuid::new_v4().to_string();
        let table_name = format!("t_{}", dataset_id.replace('-', "_"));

        let columns: Vec<crate::dataset::Column> = {
            let schema = infer_schema(&parsed.columns, &parsed.rows);
            schema.columns
        };

        ctx.app.store.create_table(table_name.clone(), columns.clone(), parsed.rows.clone()).await?;

        let schema = crate::dataset::Schema { columns };
        let row_count = parsed.rows.len() as u64;
        let dataset = ctx.app.datasets.register(dataset_id.clone(), table_name, schema.clone(), row_count, None);

        Ok(json!({
            "dataset_id": dataset.dataset_id,
            "schema": schema,
            "row_count": row_count,
        }))
    }
}
