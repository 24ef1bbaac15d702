//! QuerySpec: the structured, whitelist-constrained DSL the LLM emits in place of SQL
//! (spec §3, §4.B). See [`compiler`] for validation and SQL emission, [`expr_parser`]
//! for the derived-expression grammar.

pub mod compiler;
pub mod expr_parser;

use crate::store::Value;
use serde::{Deserialize, Serialize};

pub const MAX_ROWS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    In,
    Between,
    Contains,
    IsNull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Scalar(Value),
    List(Vec<Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCondition {
    pub col: String,
    pub op: Op,
    #[serde(default)]
    pub value: Option<FilterValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Nunique,
}

impl AggFn {
    pub fn sql_name(self) -> &'static str {
        match self {
            AggFn::Sum => "SUM",
            AggFn::Avg => "AVG",
            AggFn::Min => "MIN",
            AggFn::Max => "MAX",
            AggFn::Count => "COUNT",
            AggFn::Nunique => "COUNT",
        }
    }

    pub fn requires_numeric(self) -> bool {
        matches!(self, AggFn::Sum | AggFn::Avg)
    }

    pub fn requires_orderable(self) -> bool {
        matches!(self, AggFn::Min | AggFn::Max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agg {
    #[serde(rename = "as")]
    pub alias: String,
    pub agg: AggFn,
    pub col: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Derived {
    #[serde(rename = "as")]
    pub alias: String,
    pub expr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortItem {
    pub col: String,
    pub dir: SortDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpec {
    pub dataset_id: String,
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub aggregations: Vec<Agg>,
    #[serde(default)]
    pub derived: Vec<Derived>,
    #[serde(default)]
    pub sort: Vec<SortItem>,
    pub limit: Option<usize>,
}

pub(crate) fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
