//! Plot Spec Normaliser (spec §4.C): turns the most recent query `Table` plus a
//! `PlotSpec` into a renderer-neutral chart description.

use crate::error::{AppError, AppResult};
use crate::store::{Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Line,
    Bar,
    Pie,
    Scatter,
    Area,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YFormat {
    Plain,
    Percent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotSpec {
    pub chart_type: ChartType,
    pub title: String,
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub y_format: Option<YFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub x: Vec<Value>,
    pub y: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartOption {
    pub x_axis: String,
    pub y_axis: String,
    pub series: Vec<Series>,
    pub legend: Vec<String>,
    pub y_format: YFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartOutput {
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    pub title: String,
    pub option: ChartOption,
}

fn column_index(table: &Table, name: &str) -> AppResult<usize> {
    table
        .columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| AppError::bad_plot(format!("column '{name}' not present in the supplied table")))
}

/// Builds a `ChartOutput` from `table` and `spec` (spec §4.C). `pie` ignores `series`;
/// `line`/`bar`/`area`/`scatter` pivot the table into one series per distinct `series`
/// value when supplied.
pub fn normalize(table: &Table, spec: &PlotSpec) -> AppResult<ChartOutput> {
    let x_idx = column_index(table, &spec.x)?;
    let y_idx = column_index(table, &spec.y)?;
    let y_format = spec.y_format.unwrap_or(YFormat::Plain);

    let series = if spec.chart_type == ChartType::Pie {
        vec![Series {
            name: spec.title.clone(),
            x: table.rows.iter().map(|r| r[x_idx].clone()).collect(),
            y: table.rows.iter().map(|r| r[y_idx].clone()).collect(),
        }]
    } else if let Some(series_col) = &spec.series {
        let series_idx = column_index(table, series_col)?;
        let mut grouped: BTreeMap<String, (Vec<Value>, Vec<Value>)> = BTreeMap::new();
        for row in &table.rows {
            let key = value_key(&row[series_idx]);
            let entry = grouped.entry(key).or_default();
            entry.0.push(row[x_idx].clone());
            entry.1.push(row[y_idx].clone());
        }
        grouped
            .into_iter()
            .map(|(name, (x, y))| Series { name, x, y })
            .collect()
    } else {
        vec![Series {
            name: spec.y.clone(),
            x: table.rows.iter().map(|r| r[x_idx].clone()).collect(),
            y: table.rows.iter().map(|r| r[y_idx].clone()).collect(),
        }]
    };

    let legend = series.iter().map(|s| s.name.clone()).collect();

    Ok(ChartOutput {
        chart_type: spec.chart_type,
        title: spec.title.clone(),
        option: ChartOption {
            x_axis: spec.x.clone(),
            y_axis: spec.y.clone(),
            series,
            legend,
            y_format,
        },
    })
}

fn value_key(v: &Value) -> String {
    match v {
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table {
            columns: vec!["month".into(), "quality_rate".into(), "account".into()],
            rows: vec![
                vec![Value::Str("jan".into()), Value::Float(0.9), Value::Str("acme".into())],
                vec![Value::Str("feb".into()), Value::Float(0.8), Value::Str("acme".into())],
                vec![Value::Str("jan".into()), Value::Float(0.7), Value::Str("globex".into())],
            ],
            row_count: 3,
            truncated: false,
        }
    }

    #[test]
    fn pivots_by_series() {
        let spec = PlotSpec {
            chart_type: ChartType::Line,
            title: "Quality trend".into(),
            x: "month".into(),
            y: "quality_rate".into(),
            series: Some("account".into()),
            y_format: None,
        };
        let chart = normalize(&table(), &spec).unwrap();
        assert_eq!(chart.option.series.len(), 2);
        assert_eq!(chart.option.legend, vec!["acme".to_string(), "globex".to_string()]);
    }

    #[test]
    fn pie_ignores_series() {
        let spec = PlotSpec {
            chart_type: ChartType::Pie,
            title: "Share".into(),
            x: "account".into(),
            y: "quality_rate".into(),
            series: Some("month".into()),
            y_format: None,
        };
        let chart = normalize(&table(), &spec).unwrap();
        assert_eq!(chart.option.series.len(), 1);
    }

    #[test]
    fn unknown_column_is_bad_plot() {
        let spec = PlotSpec {
            chart_type: ChartType::Bar,
            title: "x".into(),
            x: "nonexistent".into(),
            y: "quality_rate".into(),
            series: None,
            y_format: None,
        };
        let err = normalize(&table(), &spec).unwrap_err();
        assert_eq!(err.code(), "BAD_PLOT");
    }
}
