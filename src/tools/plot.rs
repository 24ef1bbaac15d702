use super::{Tool, ToolContext};
use crate::error::{AppError, AppResult};
use crate::plot::{normalize, PlotSpec};
use async_trait::async_trait;
use serde_json::json;

pub struct PlotTool;

#[async_trait]
impl Tool for PlotTool {
    fn name(&self) -> &'static str {
        "plot"
    }

    fn description(&self) -> &'static str {
        "Build a chart from the most recent run_query result."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "chart_type": {"type": "string", "enum": ["line", "bar", "pie", "scatter", "area"]},
                "title": {"type": "string"},
                "x": {"type": "string"},
                "y": {"type": "string"},
                "series": {"type": "string"},
                "y_format": {"type": "string", "enum": ["plain", "percent"]}
            },
            "required": ["chart_type", "title", "x", "y"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> AppResult<serde_json::Value> {
        let spec: PlotSpec = serde_json::from_value(args).map_err(|e| AppError::BadToolArgs { reason: e.to_string() })?;
        let last_table = ctx.last_table.lock().await;
        let table = last_table
            .as_ref()
            .ok_or_else(|| AppError::bad_plot("no prior query result to plot from"))?;
        let chart = normalize(table, &spec)?;
        Ok(serde_json::to_value(chart).expect("ChartOutput always serializes"))
    }
}
