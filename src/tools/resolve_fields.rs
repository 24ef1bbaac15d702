//! `resolve_fields`: maps free-form terms to column names (spec §4.D, §9 Open
//! Question). Baseline heuristic resolved here: case-insensitive exact match, then
//! substring match, then Levenshtein-nearest column name, capped at 5 candidates
//! total (the spec leaves the exact scoring unspecified).

use super::{Tool, ToolContext};
use crate::dataset::Schema;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const MAX_CANDIDATES: usize = 5;

#[derive(Deserialize)]
struct Args {
    dataset_id: String,
    terms: Vec<String>,
}

pub struct ResolveFieldsTool;

#[async_trait]
impl Tool for ResolveFieldsTool {
    fn name(&self) -> &'static str {
        "resolve_fields"
    }

    fn description(&self) -> &'static str {
        "Map free-form terms to the dataset's actual column names."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "dataset_id": {"type": "string"},
                "terms": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["dataset_id", "terms"]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> AppResult<serde_json::Value> {
        let args: Args = serde_json::from_value(args).map_err(|e| AppError::BadToolArgs { reason: e.to_string() })?;
        let dataset = ctx.app.datasets.get(&args.dataset_id)?;

        let mut mapped: Vec<String> = Vec::new();
        for term in &args.terms {
            if let Some(col) = best_match(&dataset.schema, term) {
                if !mapped.contains(&col) {
                    mapped.push(col);
                }
            }
            if mapped.len() >= MAX_CANDIDATES {
                break;
            }
        }
        mapped.truncate(MAX_CANDIDATES);

        Ok(json!({ "mapped_columns": mapped }))
    }
}

fn best_match(schema: &Schema, term: &str) -> Option<String> {
    let lower = term.to_lowercase();

    if let Some(c) = schema.columns.iter().find(|c| c.name.to_lowercase() == lower) {
        return Some(c.name.clone());
    }
    if let Some(c) = schema.columns.iter().find(|c| c.name.to_lowercase().contains(&lower) || lower.contains(&c.name.to_lowercase())) {
        return Some(c.name.clone());
    }
    schema
        .columns
        .iter()
        .min_by_key(|c| levenshtein(&c.name.to_lowercase(), &lower))
        .map(|c| c.name.clone())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for i in 1..=a.len() {
        let mut cur = vec![i];
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            cur.push((prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost));
        }
        prev = cur;
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, ColumnType};

    fn schema() -> Schema {
        Schema {
            columns: vec![
                Column { name: "account".into(), ty: ColumnType::String, null_ratio: 0.0, example_values: vec![] },
                Column { name: "returns".into(), ty: ColumnType::Int, null_ratio: 0.0, example_values: vec![] },
            ],
        }
    }

    #[test]
    fn exact_match_case_insensitive() {
        assert_eq!(best_match(&schema(), "Account"), Some("account".to_string()));
    }

    #[test]
    fn substring_match() {
        assert_eq!(best_match(&schema(), "acc"), Some("account".to_string()));
    }

    #[test]
    fn nearest_match_typo() {
        assert_eq!(best_match(&schema(), "acount"), Some("account".to_string()));
    }
}
