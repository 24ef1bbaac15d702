//! The QuerySpec → SQL compiler (spec §4.B), the most intricate component of the
//! system: validates a QuerySpec against the dataset schema and a hard-coded
//! allowlist, parses derived expressions, and emits a single parameterized SQL
//! statement. No string received from a QuerySpec is ever concatenated unquoted
//! into the statement text; only enumerated operators, function names, and
//! previously-validated identifiers are.

use super::expr_parser::{parse_derived_expr, ExprAst};
use super::{is_valid_identifier, Agg, AggFn, FilterCondition, FilterValue, Op, QuerySpec, SortDir, MAX_ROWS};
use crate::dataset::{ColumnType, Schema};
use crate::error::{AppError, AppResult};
use crate::store::{PreparedSql, StoreHandle, Table, Value};
use std::collections::HashSet;

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn require_column<'a>(schema: &'a Schema, field_path: &str, col: &str) -> AppResult<&'a crate::dataset::Column> {
    schema
        .column(col)
        .ok_or_else(|| AppError::bad_spec(field_path, format!("unknown column '{col}'")))
}

/// Validates `spec` against `schema` and, on success, returns the prepared SQL
/// (querying `table_name`, the registry's stored name, never user-supplied) plus
/// the clamped limit. Does not touch the store.
pub fn compile(spec: &QuerySpec, schema: &Schema, table_name: &str) -> AppResult<(PreparedSql, usize)> {
    validate_shape(spec)?;

    for g in &spec.group_by {
        require_column(schema, "group_by", g)?;
    }

    for f in &spec.filters {
        validate_filter(f, schema)?;
    }

    let mut alias_set: HashSet<String> = HashSet::new();
    for agg in &spec.aggregations {
        if !is_valid_identifier(&agg.alias) {
            return Err(AppError::bad_spec("aggregations[].as", format!("'{}' is not a valid identifier", agg.alias)));
        }
        if !alias_set.insert(agg.alias.clone()) {
            return Err(AppError::bad_spec("aggregations[].as", format!("duplicate alias '{}'", agg.alias)));
        }
        validate_agg(agg, schema)?;
    }

    let grouped_set: HashSet<&str> = spec.group_by.iter().map(String::as_str).collect();
    let resolvable: HashSet<String> = alias_set.iter().cloned().chain(grouped_set.iter().map(|s| s.to_string())).collect();

    let mut derived_asts = Vec::with_capacity(spec.derived.len());
    for d in &spec.derived {
        if !is_valid_identifier(&d.alias) {
            return Err(AppError::bad_spec("derived[].as", format!("'{}' is not a valid identifier", d.alias)));
        }
        if !alias_set.insert(d.alias.clone()) {
            return Err(AppError::bad_spec("derived[].as", format!("duplicate alias '{}'", d.alias)));
        }
        let ast = parse_derived_expr(&d.expr)?;
        for ident in ast.identifiers() {
            if !resolvable.contains(&ident) {
                return Err(AppError::bad_spec(
                    "derived[].expr",
                    format!("identifier '{ident}' does not resolve to a prior aggregation alias or grouped column"),
                ));
            }
        }
        derived_asts.push((d.alias.clone(), ast));
    }

    let full_alias_set = alias_set;
    for s in &spec.sort {
        if !grouped_set.contains(s.col.as_str()) && !full_alias_set.contains(&s.col) {
            return Err(AppError::bad_spec(
                "sort[].col",
                format!("'{}' is not a grouped column, aggregation alias, or derived alias", s.col),
            ));
        }
    }

    let limit = clamp_limit(spec.limit)?;

    let sql = emit_sql(spec, &derived_asts, limit, table_name)?;
    Ok((sql, limit))
}

fn validate_shape(spec: &QuerySpec) -> AppResult<()> {
    if spec.dataset_id.trim().is_empty() {
        return Err(AppError::bad_spec("dataset_id", "must not be empty"));
    }
    if let Some(limit) = spec.limit {
        if limit == 0 {
            return Err(AppError::bad_spec("limit", "must be at least 1"));
        }
    }
    Ok(())
}

fn clamp_limit(limit: Option<usize>) -> AppResult<usize> {
    match limit {
        None => Ok(MAX_ROWS),
        Some(l) if l == 0 => Err(AppError::bad_spec("limit", "must be at least 1")),
        Some(l) if l > MAX_ROWS => Ok(MAX_ROWS),
        Some(l) => Ok(l),
    }
}

fn validate_filter(f: &FilterCondition, schema: &Schema) -> AppResult<()> {
    let col = require_column(schema, "filters[].col", &f.col)?;
    match f.op {
        Op::IsNull => Ok(()),
        Op::Between => match &f.value {
            Some(FilterValue::List(vals)) if vals.len() == 2 => check_same_type(col, &vals[0], &vals[1], "filters[].value"),
            _ => Err(AppError::bad_spec("filters[].value", "between requires a two-element list")),
        },
        Op::In => match &f.value {
            Some(FilterValue::List(vals)) if !vals.is_empty() => {
                let ty = value_kind(&vals[0]);
                if vals.iter().any(|v| value_kind(v) != ty) {
                    return Err(AppError::bad_spec("filters[].value", "in requires a homogeneous list"));
                }
                for v in vals {
                    check_value_matches_col(col, v, "filters[].value")?;
                }
                Ok(())
            }
            _ => Err(AppError::bad_spec("filters[].value", "in requires a non-empty list")),
        },
        Op::Contains => {
            if col.ty != ColumnType::String {
                return Err(AppError::bad_spec("filters[].col", "contains requires a string column"));
            }
            match &f.value {
                Some(FilterValue::Scalar(Value::Str(_))) => Ok(()),
                _ => Err(AppError::bad_spec("filters[].value", "contains requires a string value")),
            }
        }
        Op::Eq | Op::Ne | Op::Gt | Op::Ge | Op::Lt | Op::Le => match &f.value {
            Some(FilterValue::Scalar(_)) => Ok(()),
            _ => Err(AppError::bad_spec("filters[].value", "expected a scalar value")),
        },
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "string",
        Value::Bool(_) => "bool",
        Value::Null => "null",
    }
}

fn check_same_type(col: &crate::dataset::Column, a: &Value, b: &Value, field_path: &str) -> AppResult<()> {
    let numeric_ok = col.ty.is_numeric() && matches!(value_kind(a), "int" | "float") && matches!(value_kind(b), "int" | "float");
    if !numeric_ok && value_kind(a) != value_kind(b) {
        return Err(AppError::bad_spec(field_path, "between bounds must share the column's comparable type"));
    }
    check_value_matches_col(col, a, field_path)?;
    check_value_matches_col(col, b, field_path)
}

/// Binds a single filter value's kind against the column's declared type, so e.g. a
/// numeric column can't be compared against an all-string `in` list.
fn check_value_matches_col(col: &crate::dataset::Column, v: &Value, field_path: &str) -> AppResult<()> {
    let ok = match col.ty {
        ColumnType::Int | ColumnType::Float => matches!(value_kind(v), "int" | "float"),
        ColumnType::Bool => value_kind(v) == "bool",
        ColumnType::String | ColumnType::Date | ColumnType::Datetime => value_kind(v) == "string",
    };
    if ok {
        Ok(())
    } else {
        Err(AppError::bad_spec(field_path, "value does not match the column's comparable type"))
    }
}

fn validate_agg(agg: &Agg, schema: &Schema) -> AppResult<()> {
    if agg.col == "*" {
        if agg.agg != AggFn::Count {
            return Err(AppError::bad_spec("aggregations[].col", "'*' is only permitted with count"));
        }
        return Ok(());
    }
    let col = require_column(schema, "aggregations[].col", &agg.col)?;
    if agg.agg.requires_numeric() && !col.ty.is_numeric() {
        return Err(AppError::bad_spec("aggregations[].col", format!("{:?} requires a numeric column", agg.agg)));
    }
    if agg.agg.requires_orderable() && !col.ty.is_orderable() {
        return Err(AppError::bad_spec("aggregations[].col", format!("{:?} requires an orderable column", agg.agg)));
    }
    Ok(())
}

fn agg_sql(agg: &Agg) -> String {
    let arg = if agg.col == "*" { "*".to_string() } else { quote_ident(&agg.col) };
    match agg.agg {
        AggFn::Nunique => format!("COUNT(DISTINCT {arg})"),
        other => format!("{}({arg})", other.sql_name()),
    }
}

fn emit_sql(spec: &QuerySpec, derived: &[(String, ExprAst)], limit: usize, table_name: &str) -> AppResult<PreparedSql> {
    let mut params: Vec<Value> = Vec::new();
    let where_sql = emit_where(&spec.filters, &mut params)?;

    let group_cols: Vec<String> = spec.group_by.iter().map(|c| quote_ident(c)).collect();

    let mut inner_select: Vec<String> = group_cols.clone();
    for agg in &spec.aggregations {
        inner_select.push(format!("{} AS {}", agg_sql(agg), quote_ident(&agg.alias)));
    }
    if inner_select.is_empty() {
        inner_select.push("*".to_string());
    }

    let mut inner = format!(
        "SELECT {} FROM {}",
        inner_select.join(", "),
        quote_ident(table_name)
    );
    if let Some(w) = &where_sql {
        inner.push_str(&format!(" WHERE {w}"));
    }
    if !spec.group_by.is_empty() && (!spec.aggregations.is_empty() || !spec.derived.is_empty()) {
        inner.push_str(&format!(" GROUP BY {}", group_cols.join(", ")));
    }

    let needs_subquery = !spec.aggregations.is_empty() || !derived.is_empty();

    let sql = if needs_subquery {
        let mut outer_select: Vec<String> = spec.group_by.iter().map(|c| quote_ident(c)).collect();
        outer_select.extend(spec.aggregations.iter().map(|a| quote_ident(&a.alias)));
        for (alias, ast) in derived {
            outer_select.push(format!("{} AS {}", ast.to_sql(), quote_ident(alias)));
        }
        if outer_select.is_empty() {
            outer_select.push("*".to_string());
        }
        format!("SELECT {} FROM ({inner}) AS agg", outer_select.join(", "))
    } else {
        inner
    };

    let mut sql = sql;
    if !spec.sort.is_empty() {
        let order: Vec<String> = spec
            .sort
            .iter()
            .map(|s| {
                let dir = match s.dir {
                    SortDir::Asc => "ASC",
                    SortDir::Desc => "DESC",
                };
                format!("{} {dir}", quote_ident(&s.col))
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    sql.push_str(&format!(" LIMIT {}", limit + 1));

    Ok(PreparedSql { sql, params })
}

fn emit_where(filters: &[FilterCondition], params: &mut Vec<Value>) -> AppResult<Option<String>> {
    if filters.is_empty() {
        return Ok(None);
    }
    let mut clauses = Vec::with_capacity(filters.len());
    for f in filters {
        let col = quote_ident(&f.col);
        let clause = match f.op {
            Op::Eq => {
                params.push(scalar(&f.value)?);
                format!("{col} = ?")
            }
            Op::Ne => {
                params.push(scalar(&f.value)?);
                format!("{col} != ?")
            }
            Op::Gt => {
                params.push(scalar(&f.value)?);
                format!("{col} > ?")
            }
            Op::Ge => {
                params.push(scalar(&f.value)?);
                format!("{col} >= ?")
            }
            Op::Lt => {
                params.push(scalar(&f.value)?);
                format!("{col} < ?")
            }
            Op::Le => {
                params.push(scalar(&f.value)?);
                format!("{col} <= ?")
            }
            Op::In => {
                let list = list_value(&f.value)?;
                let placeholders = vec!["?"; list.len()].join(", ");
                params.extend(list);
                format!("{col} IN ({placeholders})")
            }
            Op::Between => {
                let list = list_value(&f.value)?;
                params.push(list[0].clone());
                params.push(list[1].clone());
                format!("{col} BETWEEN ? AND ?")
            }
            Op::Contains => {
                let s = match &f.value {
                    Some(FilterValue::Scalar(Value::Str(s))) => s,
                    _ => return Err(AppError::bad_spec("filters[].value", "contains requires a string")),
                };
                let escaped = s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
                params.push(Value::Str(format!("%{escaped}%")));
                format!("{col} LIKE ? ESCAPE '\\'")
            }
            Op::IsNull => format!("{col} IS NULL"),
        };
        clauses.push(clause);
    }
    Ok(Some(clauses.join(" AND ")))
}

fn scalar(value: &Option<FilterValue>) -> AppResult<Value> {
    match value {
        Some(FilterValue::Scalar(v)) => Ok(v.clone()),
        _ => Err(AppError::bad_spec("filters[].value", "expected a scalar value")),
    }
}

fn list_value(value: &Option<FilterValue>) -> AppResult<Vec<Value>> {
    match value {
        Some(FilterValue::List(vs)) => Ok(vs.clone()),
        _ => Err(AppError::bad_spec("filters[].value", "expected a list value")),
    }
}

/// Compiles `spec` against `dataset`, then executes it against the store, truncating
/// the probe row and setting `Table.truncated` (spec §4.B "LIMIT ... plus one row probe").
pub async fn compile_and_run(spec: &QuerySpec, dataset: &crate::dataset::Dataset, store: &StoreHandle) -> AppResult<Table> {
    let (sql, limit) = compile(spec, &dataset.schema, &dataset.table_name)?;
    let mut table = store.run(sql).await?;
    if table.rows.len() > limit {
        table.rows.truncate(limit);
        table.truncated = true;
        table.row_count = limit;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;
    use crate::query::{Derived, SortItem};

    fn sales_schema() -> Schema {
        Schema {
            columns: vec![
                Column { name: "account".into(), ty: ColumnType::String, null_ratio: 0.0, example_values: vec![] },
                Column { name: "month".into(), ty: ColumnType::String, null_ratio: 0.0, example_values: vec![] },
                Column { name: "returns".into(), ty: ColumnType::Int, null_ratio: 0.0, example_values: vec![] },
                Column { name: "quality".into(), ty: ColumnType::Int, null_ratio: 0.0, example_values: vec![] },
                Column { name: "year".into(), ty: ColumnType::Int, null_ratio: 0.0, example_values: vec![] },
            ],
        }
    }

    #[test]
    fn total_returns_per_account() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![FilterCondition { col: "year".into(), op: Op::Eq, value: Some(FilterValue::Scalar(Value::Int(2025))) }],
            group_by: vec!["account".into()],
            aggregations: vec![Agg { alias: "total".into(), agg: AggFn::Sum, col: "returns".into() }],
            derived: vec![],
            sort: vec![],
            limit: None,
        };
        let (sql, limit) = compile(&spec, &sales_schema(), "t_sales").unwrap();
        assert_eq!(limit, MAX_ROWS);
        assert!(sql.sql.contains("GROUP BY \"account\""));
        assert!(sql.sql.contains("SUM(\"returns\") AS \"total\""));
        assert!(sql.sql.contains("LIMIT 10001"));
        assert_eq!(sql.params, vec![Value::Int(2025)]);
    }

    #[test]
    fn derived_quality_rate_resolves_aliases() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![FilterCondition { col: "year".into(), op: Op::Eq, value: Some(FilterValue::Scalar(Value::Int(2025))) }],
            group_by: vec!["account".into(), "month".into()],
            aggregations: vec![
                Agg { alias: "total".into(), agg: AggFn::Sum, col: "returns".into() },
                Agg { alias: "quality_cnt".into(), agg: AggFn::Sum, col: "quality".into() },
            ],
            derived: vec![Derived { alias: "quality_rate".into(), expr: "quality_cnt / nullif(total, 0)".into() }],
            sort: vec![SortItem { col: "month".into(), dir: SortDir::Asc }],
            limit: None,
        };
        let (sql, _) = compile(&spec, &sales_schema(), "t_sales").unwrap();
        assert!(sql.sql.contains("\"quality_cnt\" / NULLIF(\"total\", 0)"));
        assert!(sql.sql.contains("ORDER BY \"month\" ASC"));
    }

    #[test]
    fn undeclared_derived_alias_rejected() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![],
            group_by: vec!["account".into()],
            aggregations: vec![Agg { alias: "total".into(), agg: AggFn::Sum, col: "returns".into() }],
            derived: vec![Derived { alias: "bad".into(), expr: "unknown_thing * 2".into() }],
            sort: vec![],
            limit: None,
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }

    #[test]
    fn limit_zero_rejected() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![],
            group_by: vec![],
            aggregations: vec![],
            derived: vec![],
            sort: vec![],
            limit: Some(0),
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }

    #[test]
    fn oversized_limit_clamped() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![],
            group_by: vec!["account".into()],
            aggregations: vec![Agg { alias: "total".into(), agg: AggFn::Sum, col: "returns".into() }],
            derived: vec![],
            sort: vec![],
            limit: Some(50_000),
        };
        let (sql, limit) = compile(&spec, &sales_schema(), "t_sales").unwrap();
        assert_eq!(limit, MAX_ROWS);
        assert!(sql.sql.contains("LIMIT 10001"));
    }

    #[test]
    fn between_with_one_element_rejected() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![FilterCondition {
                col: "returns".into(),
                op: Op::Between,
                value: Some(FilterValue::List(vec![Value::Int(1)])),
            }],
            group_by: vec![],
            aggregations: vec![],
            derived: vec![],
            sort: vec![],
            limit: None,
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }

    #[test]
    fn heterogeneous_in_list_rejected() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![FilterCondition {
                col: "account".into(),
                op: Op::In,
                value: Some(FilterValue::List(vec![Value::Str("acme".into()), Value::Int(1)])),
            }],
            group_by: vec![],
            aggregations: vec![],
            derived: vec![],
            sort: vec![],
            limit: None,
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }

    #[test]
    fn in_list_type_mismatch_with_column_rejected() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![FilterCondition {
                col: "returns".into(),
                op: Op::In,
                value: Some(FilterValue::List(vec![Value::Str("1".into()), Value::Str("2".into())])),
            }],
            group_by: vec![],
            aggregations: vec![],
            derived: vec![],
            sort: vec![],
            limit: None,
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }

    #[test]
    fn unknown_column_rejected() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![FilterCondition { col: "nope".into(), op: Op::IsNull, value: None }],
            group_by: vec![],
            aggregations: vec![],
            derived: vec![],
            sort: vec![],
            limit: None,
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }

    #[test]
    fn count_star_allowed_only_for_count() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![],
            group_by: vec![],
            aggregations: vec![Agg { alias: "n".into(), agg: AggFn::Sum, col: "*".into() }],
            derived: vec![],
            sort: vec![],
            limit: None,
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }

    #[test]
    fn sort_must_reference_known_alias() {
        let spec = QuerySpec {
            dataset_id: "t_sales".into(),
            filters: vec![],
            group_by: vec!["account".into()],
            aggregations: vec![Agg { alias: "total".into(), agg: AggFn::Sum, col: "returns".into() }],
            derived: vec![],
            sort: vec![SortItem { col: "nonexistent".into(), dir: SortDir::Asc }],
            limit: None,
        };
        let err = compile(&spec, &sales_schema(), "t_sales").unwrap_err();
        assert_eq!(err.code(), "BAD_SPEC");
    }
}
