//! Thread-safe handle onto the embedded analytical store (DuckDB).
//!
//! Generalizes the teacher's single-actor-thread pattern
//! (`storage::StorageHandle` / `run_storage_actor`) into a small fixed-size pool so
//! concurrent `/analyze` requests are not serialized behind one connection (spec §5:
//! "connection acquisition is bounded by a small pool").

use crate::dataset::{Column, ColumnType, Schema};
use crate::error::{AppError, AppResult};
use duckdb::{Connection, params_from_iter, types::Value as DuckValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

/// A single cell value, independent of the store's native type representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl Value {
    fn to_duckdb(&self) -> DuckValue {
        match self {
            Value::Int(i) => DuckValue::BigInt(*i),
            Value::Float(f) => DuckValue::Double(*f),
            Value::Str(s) => DuckValue::Text(s.clone()),
            Value::Bool(b) => DuckValue::Boolean(*b),
            Value::Null => DuckValue::Null,
        }
    }

    fn from_duckdb(v: &DuckValue) -> Value {
        match v {
            DuckValue::Null => Value::Null,
            DuckValue::Boolean(b) => Value::Bool(*b),
            DuckValue::TinyInt(i) => Value::Int(*i as i64),
            DuckValue::SmallInt(i) => Value::Int(*i as i64),
            DuckValue::Int(i) => Value::Int(*i as i64),
            DuckValue::BigInt(i) => Value::Int(*i),
            DuckValue::HugeInt(i) => Value::Int(*i as i64),
            DuckValue::UTinyInt(i) => Value::Int(*i as i64),
            DuckValue::USmallInt(i) => Value::Int(*i as i64),
            DuckValue::UInt(i) => Value::Int(*i as i64),
            DuckValue::UBigInt(i) => Value::Int(*i as i64),
            DuckValue::Float(f) => Value::Float(*f as f64),
            DuckValue::Double(f) => Value::Float(*f),
            DuckValue::Decimal(d) => Value::Float(d.to_string().parse().unwrap_or(0.0)),
            DuckValue::Text(s) => Value::Str(s.clone()),
            other => Value::Str(format!("{other:?}")),
        }
    }
}

/// The result of a compiled-and-executed QuerySpec (spec §4.B contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

/// A parameterized SQL statement, produced by the QuerySpec compiler. Never built by
/// concatenating user-controlled strings into the statement text.
#[derive(Debug, Clone)]
pub struct PreparedSql {
    pub sql: String,
    pub params: Vec<Value>,
}

enum StoreCommand {
    CreateTable {
        table_name: String,
        columns: Vec<Column>,
        rows: Vec<Vec<Value>>,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Run {
        sql: PreparedSql,
        reply: oneshot::Sender<AppResult<Table>>,
    },
    Sample {
        table_name: String,
        n: usize,
        columns: Option<Vec<String>>,
        reply: oneshot::Sender<AppResult<Table>>,
    },
}

/// Cloneable handle to a fixed-size pool of worker threads, each owning one
/// `duckdb::Connection` against the same on-disk database file. DuckDB natively
/// supports multiple connections to one database, so the pool simply distributes
/// work round-robin across them.
#[derive(Clone)]
pub struct StoreHandle {
    senders: Vec<mpsc::UnboundedSender<StoreCommand>>,
    next: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl StoreHandle {
    pub fn open(path: &Path, pool_size: usize) -> AppResult<Self> {
        let primary = Connection::open(path).map_err(|e| AppError::QueryFailed { message: e.to_string() })?;
        init_schema(&primary)?;

        let mut senders = Vec::with_capacity(pool_size.max(1));
        for i in 0..pool_size.max(1) {
            let conn = if i == 0 {
                primary.try_clone().map_err(|e| AppError::QueryFailed { message: e.to_string() })?
            } else {
                primary.try_clone().map_err(|e| AppError::QueryFailed { message: e.to_string() })?
            };
            let (tx, rx) = mpsc::unbounded_channel();
            std::thread::spawn(move || run_worker(conn, rx));
            senders.push(tx);
        }
        drop(primary);

        Ok(Self { senders, next: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)) })
    }

    pub fn open_in_memory(pool_size: usize) -> AppResult<Self> {
        // DuckDB in-memory databases are private per connection; a single worker
        // is sufficient for tests and keeps the schema visible to every query.
        let _ = pool_size;
        let conn = Connection::open_in_memory().map_err(|e| AppError::QueryFailed { message: e.to_string() })?;
        init_schema(&conn)?;
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || run_worker(conn, rx));
        Ok(Self { senders: vec![tx], next: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)) })
    }

    fn pick(&self) -> &mpsc::UnboundedSender<StoreCommand> {
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.senders.len();
        &self.senders[i]
    }

    pub async fn create_table(
        &self,
        table_name: String,
        columns: Vec<Column>,
        rows: Vec<Vec<Value>>,
    ) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.pick()
            .send(StoreCommand::CreateTable { table_name, columns, rows, reply })
            .map_err(|_| AppError::QueryFailed { message: "store worker unavailable".into() })?;
        rx.await.map_err(|_| AppError::QueryFailed { message: "store worker dropped reply".into() })?
    }

    pub async fn run(&self, sql: PreparedSql) -> AppResult<Table> {
        let (reply, rx) = oneshot::channel();
        self.pick()
            .send(StoreCommand::Run { sql, reply })
            .map_err(|_| AppError::QueryFailed { message: "store worker unavailable".into() })?;
        rx.await.map_err(|_| AppError::QueryFailed { message: "store worker dropped reply".into() })?
    }

    pub async fn sample(
        &self,
        table_name: String,
        n: usize,
        columns: Option<Vec<String>>,
    ) -> AppResult<Table> {
        let (reply, rx) = oneshot::channel();
        self.pick()
            .send(StoreCommand::Sample { table_name, n, columns, reply })
            .map_err(|_| AppError::QueryFailed { message: "store worker unavailable".into() })?;
        rx.await.map_err(|_| AppError::QueryFailed { message: "store worker dropped reply".into() })?
    }
}

fn init_schema(conn: &Connection) -> AppResult<()> {
    // Datasets themselves are created on demand by `create_table`; nothing process-wide
    // to set up beyond the connection itself.
    conn.execute_batch("PRAGMA threads=4;")
        .map_err(|e| AppError::QueryFailed { message: e.to_string() })?;
    Ok(())
}

fn run_worker(conn: Connection, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCommand::CreateTable { table_name, columns, rows, reply } => {
                let _ = reply.send(create_table(&conn, &table_name, &columns, &rows));
            }
            StoreCommand::Run { sql, reply } => {
                let _ = reply.send(run_sql(&conn, &sql));
            }
            StoreCommand::Sample { table_name, n, columns, reply } => {
                let _ = reply.send(sample_rows(&conn, &table_name, n, columns.as_deref()));
            }
        }
    }
}

fn duckdb_type_name(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Int => "BIGINT",
        ColumnType::Float => "DOUBLE",
        ColumnType::String => "VARCHAR",
        ColumnType::Date => "DATE",
        ColumnType::Datetime => "TIMESTAMP",
        ColumnType::Bool => "BOOLEAN",
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn create_table(
    conn: &Connection,
    table_name: &str,
    columns: &[Column],
    rows: &[Vec<Value>],
) -> AppResult<()> {
    let cols_ddl: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), duckdb_type_name(c.ty)))
        .collect();
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(table_name)))?;
    conn.execute(
        &format!("CREATE TABLE {} ({})", quote_ident(table_name), cols_ddl.join(", ")),
        [],
    )?;

    if rows.is_empty() {
        return Ok(());
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert_sql = format!("INSERT INTO {} VALUES ({})", quote_ident(table_name), placeholders);
    let mut stmt = conn.prepare(&insert_sql)?;
    for row in rows {
        let values: Vec<DuckValue> = row.iter().map(Value::to_duckdb).collect();
        stmt.execute(params_from_iter(values))?;
    }
    Ok(())
}

fn run_sql(conn: &Connection, sql: &PreparedSql) -> AppResult<Table> {
    let values: Vec<DuckValue> = sql.params.iter().map(Value::to_duckdb).collect();
    let mut stmt = conn.prepare(&sql.sql)?;
    let column_names: Vec<String> = stmt.column_names();

    let mut rows_out = Vec::new();
    let mut rows = stmt.query(params_from_iter(values))?;
    while let Some(row) = rows.next()? {
        let mut out_row = Vec::with_capacity(column_names.len());
        for idx in 0..column_names.len() {
            let v: DuckValue = row.get(idx)?;
            out_row.push(Value::from_duckdb(&v));
        }
        rows_out.push(out_row);
    }

    Ok(Table {
        columns: column_names,
        row_count: rows_out.len(),
        truncated: false,
        rows: rows_out,
    })
}

fn sample_rows(
    conn: &Connection,
    table_name: &str,
    n: usize,
    columns: Option<&[String]>,
) -> AppResult<Table> {
    let select_list = match columns {
        Some(cols) if !cols.is_empty() => cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        _ => "*".to_string(),
    };
    // Deterministic prefix, not a random sample (spec §4.A / §9 open question resolved
    // in favor of the spec's explicit "not a random sample; deterministic" wording).
    let sql = format!(
        "SELECT {select_list} FROM {} LIMIT {}",
        quote_ident(table_name),
        n
    );
    run_sql(conn, &PreparedSql { sql, params: vec![] })
}

/// Infers a `Schema` from already-typed columns and rows (used by `create_table` callers
/// and the ingest collaborator), computing null ratios and up to 3 deduplicated,
/// non-null example values per column, as required by spec §4.A.
pub fn infer_schema(columns: &[(String, ColumnType)], rows: &[Vec<Value>]) -> Schema {
    let mut out = Vec::with_capacity(columns.len());
    for (idx, (name, ty)) in columns.iter().enumerate() {
        let mut nulls = 0usize;
        let mut examples: Vec<String> = Vec::new();
        for row in rows {
            match row.get(idx) {
                Some(Value::Null) | None => nulls += 1,
                Some(v) => {
                    let s = match v {
                        Value::Int(i) => i.to_string(),
                        Value::Float(f) => f.to_string(),
                        Value::Str(s) => s.clone(),
                        Value::Bool(b) => b.to_string(),
                        Value::Null => unreachable!(),
                    };
                    if examples.len() < 3 && !examples.contains(&s) {
                        examples.push(s);
                    }
                }
            }
        }
        let null_ratio = if rows.is_empty() { 0.0 } else { nulls as f64 / rows.len() as f64 };
        out.push(Column { name: name.clone(), ty: *ty, null_ratio, example_values: examples });
    }
    Schema { columns: out }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_columns() -> Vec<Column> {
        vec![
            Column { name: "account".into(), ty: ColumnType::String, null_ratio: 0.0, example_values: vec![] },
            Column { name: "returns".into(), ty: ColumnType::Int, null_ratio: 0.0, example_values: vec![] },
        ]
    }

    #[tokio::test]
    async fn create_and_query_roundtrip() {
        let store = StoreHandle::open_in_memory(1).unwrap();
        store
            .create_table(
                "t_sales".to_string(),
                sample_columns(),
                vec![
                    vec![Value::Str("acme".into()), Value::Int(3)],
                    vec![Value::Str("acme".into()), Value::Int(5)],
                ],
            )
            .await
            .unwrap();

        let table = store
            .run(PreparedSql {
                sql: "SELECT \"account\", SUM(\"returns\") AS \"total\" FROM \"t_sales\" GROUP BY \"account\"".to_string(),
                params: vec![],
            })
            .await
            .unwrap();

        assert_eq!(table.columns, vec!["account", "total"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][1], Value::Int(8));
    }

    #[tokio::test]
    async fn sample_is_deterministic_prefix() {
        let store = StoreHandle::open_in_memory(1).unwrap();
        store
            .create_table(
                "t".to_string(),
                sample_columns(),
                (0..10).map(|i| vec![Value::Str(format!("a{i}")), Value::Int(i)]).collect(),
            )
            .await
            .unwrap();

        let a = store.sample("t".to_string(), 3, None).await.unwrap();
        let b = store.sample("t".to_string(), 3, None).await.unwrap();
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.rows.len(), 3);
    }

    #[test]
    fn infer_schema_counts_nulls_and_examples() {
        let cols = vec![("x".to_string(), ColumnType::String)];
        let rows = vec![
            vec![Value::Str("a".into())],
            vec![Value::Null],
            vec![Value::Str("a".into())],
            vec![Value::Str("b".into())],
        ];
        let schema = infer_schema(&cols, &rows);
        assert_eq!(schema.columns[0].null_ratio, 0.25);
        assert_eq!(schema.columns[0].example_values, vec!["a".to_string(), "b".to_string()]);
    }
}
