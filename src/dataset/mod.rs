//! Dataset Registry (spec §4.A): maps a `dataset_id` to a stored table name plus
//! column schema and summary stats. Immutable once published; garbage-collectable by age.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    String,
    Date,
    Datetime,
    Bool,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }

    pub fn is_orderable(self) -> bool {
        !matches!(self, ColumnType::Bool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    pub null_ratio: f64,
    pub example_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: String,
    /// Table name in the embedded analytical store. Never user-supplied into SQL.
    pub table_name: String,
    pub schema: Schema,
    pub row_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Option<Duration>,
}

impl Dataset {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => now - self.created_at > ttl,
            None => false,
        }
    }
}

/// Process-wide registry. Readers take only a read lock on an immutable, already-published
/// entry; `register` takes the write lock only for the insert.
#[derive(Default)]
pub struct DatasetRegistry {
    datasets: RwLock<HashMap<String, Arc<Dataset>>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        dataset_id: String,
        table_name: String,
        schema: Schema,
        row_count: u64,
        ttl: Option<Duration>,
    ) -> Arc<Dataset> {
        let dataset = Arc::new(Dataset {
            dataset_id: dataset_id.clone(),
            table_name,
            schema,
            row_count,
            created_at: Utc::now(),
            ttl,
        });
        self.datasets.write().insert(dataset_id, dataset.clone());
        dataset
    }

    pub fn exists(&self, dataset_id: &str) -> bool {
        self.datasets.read().contains_key(dataset_id)
    }

    pub fn get(&self, dataset_id: &str) -> AppResult<Arc<Dataset>> {
        self.datasets
            .read()
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| AppError::DatasetNotFound { dataset_id: dataset_id.to_string() })
    }

    pub fn get_schema(&self, dataset_id: &str) -> AppResult<Schema> {
        Ok(self.get(dataset_id)?.schema.clone())
    }

    /// Drop datasets whose TTL has elapsed. Called periodically by a reaper task.
    pub fn reap_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut datasets = self.datasets.write();
        let expired: Vec<String> = datasets
            .iter()
            .filter(|(_, d)| d.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            datasets.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.datasets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema {
            columns: vec![Column {
                name: "account".to_string(),
                ty: ColumnType::String,
                null_ratio: 0.0,
                example_values: vec!["acme".to_string()],
            }],
        }
    }

    #[test]
    fn register_then_lookup() {
        let reg = DatasetRegistry::new();
        assert!(!reg.exists("sales"));
        reg.register("sales".to_string(), "t_sales".to_string(), schema(), 1000, None);
        assert!(reg.exists("sales"));
        let s = reg.get_schema("sales").unwrap();
        assert!(s.has_column("account"));
    }

    #[test]
    fn unknown_dataset_errors() {
        let reg = DatasetRegistry::new();
        let err = reg.get("missing").unwrap_err();
        assert_eq!(err.code(), "DATASET_NOT_FOUND");
    }

    #[test]
    fn ttl_expiry() {
        let reg = DatasetRegistry::new();
        reg.register(
            "old".to_string(),
            "t_old".to_string(),
            schema(),
            1,
            Some(Duration::seconds(-1)),
        );
        let expired = reg.reap_expired();
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(!reg.exists("old"));
    }
}
