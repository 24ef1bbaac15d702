//! Minimal CSV ingestion collaborator (spec §1, §6): deliberately not a full
//! spreadsheet/CSV parser, just enough to exercise the Dataset Registry end-to-end.
//! Column types are inferred by sampling the first 100 data rows.

use crate::dataset::ColumnType;
use crate::error::{AppError, AppResult};
use crate::store::Value;
use parking_lot::RwLock;
use std::collections::HashMap;

const TYPE_SAMPLE_ROWS: usize = 100;
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Holds raw uploaded file bytes by `file_id` until `create_dataset` consumes them.
#[derive(Default)]
pub struct UploadRegistry {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, file_id: String, bytes: Vec<u8>) -> AppResult<()> {
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(AppError::bad_spec("upload", "file exceeds the 50 MB limit"));
        }
        self.files.write().insert(file_id, bytes);
        Ok(())
    }

    pub fn take(&self, file_id: &str) -> AppResult<Vec<u8>> {
        self.files
            .write()
            .remove(file_id)
            .ok_or_else(|| AppError::bad_spec("file_id", format!("no uploaded file '{file_id}'")))
    }
}

pub struct ParsedCsv {
    pub columns: Vec<(String, ColumnType)>,
    pub rows: Vec<Vec<Value>>,
}

/// Splits a CSV line on unquoted commas, honoring doubled-quote escaping.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut cur));
            }
            other => cur.push(other),
        }
    }
    fields.push(cur);
    fields
}

fn infer_cell_type(s: &str) -> ColumnType {
    if s.is_empty() {
        return ColumnType::String;
    }
    if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") {
        return ColumnType::Bool;
    }
    if s.parse::<i64>().is_ok() {
        return ColumnType::Int;
    }
    if s.parse::<f64>().is_ok() {
        return ColumnType::Float;
    }
    ColumnType::String
}

fn parse_cell(s: &str, ty: ColumnType) -> Value {
    if s.is_empty() {
        return Value::Null;
    }
    match ty {
        ColumnType::Int => s.parse::<i64>().map(Value::Int).unwrap_or(Value::Null),
        ColumnType::Float => s.parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
        ColumnType::Bool => s.parse::<bool>().map(Value::Bool).unwrap_or(Value::Null),
        ColumnType::String | ColumnType::Date | ColumnType::Datetime => Value::Str(s.to_string()),
    }
}

/// Parses `bytes` as CSV, treating `header_row` (0-indexed, default 0) as the column
/// name row. `sheet` is accepted for forward compatibility with spreadsheet uploads
/// but unused by this CSV-only collaborator.
pub fn parse_csv(bytes: &[u8], header_row: usize, _sheet: Option<&str>) -> AppResult<ParsedCsv> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    for _ in 0..header_row {
        lines.next();
    }
    let header_line = lines.next().ok_or_else(|| AppError::bad_spec("file", "no header row found"))?;
    let headers = split_csv_line(header_line);

    let data_lines: Vec<&str> = lines.filter(|l| !l.trim().is_empty()).collect();

    let mut inferred: Vec<ColumnType> = vec![ColumnType::Bool; headers.len()];
    let mut seen_any: Vec<bool> = vec![false; headers.len()];
    for line in data_lines.iter().take(TYPE_SAMPLE_ROWS) {
        let fields = split_csv_line(line);
        for (idx, field) in fields.iter().enumerate().take(headers.len()) {
            if field.is_empty() {
                continue;
            }
            let ty = infer_cell_type(field);
            if !seen_any[idx] {
                inferred[idx] = ty;
                seen_any[idx] = true;
            } else if inferred[idx] != ty {
                inferred[idx] = widen(inferred[idx], ty);
            }
        }
    }
    for (idx, seen) in seen_any.iter().enumerate() {
        if !seen {
            inferred[idx] = ColumnType::String;
        }
    }

    let columns: Vec<(String, ColumnType)> = headers.into_iter().zip(inferred.iter().copied()).collect();

    let mut rows = Vec::with_capacity(data_lines.len());
    for line in &data_lines {
        let fields = split_csv_line(line);
        let mut row = Vec::with_capacity(columns.len());
        for (idx, (_, ty)) in columns.iter().enumerate() {
            let raw = fields.get(idx).map(String::as_str).unwrap_or("");
            row.push(parse_cell(raw, *ty));
        }
        rows.push(row);
    }

    Ok(ParsedCsv { columns, rows })
}

fn widen(a: ColumnType, b: ColumnType) -> ColumnType {
    use ColumnType::*;
    match (a, b) {
        (x, y) if x == y => x,
        (Int, Float) | (Float, Int) => Float,
        _ => String,
    }
}
