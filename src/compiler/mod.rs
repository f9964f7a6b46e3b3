//! Query spec to SQL text.
//!
//! Compilation is a pure function of the query, the datasource schema and the
//! row-level-security clauses: the same inputs always produce the same text.

use sha2::{Digest, Sha256};

use crate::datasource::Schema;
use crate::spec::{
    AdhocMetric, ColumnRef, FilterClause, FilterOp, MetricRef, OrderTarget, QuerySpec, TimeGrain,
};

/// SQL text plus the column labels the result is expected to carry, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub sql: String,
    pub expected_labels: Vec<String>,
}

/// Turns a validated spec into SQL for one datasource
pub trait SqlCompiler: Send + Sync {
    fn compile(&self, spec: &QuerySpec, schema: &Schema, rls: &[String]) -> Result<CompiledQuery, CompileError>;
}

/// How the dialect constrains column aliases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelMutation {
    /// Longer aliases are truncated and suffixed with a hash of the full label
    pub max_len: Option<usize>,
    pub lowercase: bool,
}

impl LabelMutation {
    pub fn apply(&self, label: &str) -> String {
        let mut out = if self.lowercase {
            label.to_lowercase()
        } else {
            label.to_string()
        };
        if let Some(max_len) = self.max_len {
            if out.chars().count() > max_len {
                let mut hasher = Sha256::new();
                hasher.update(label.as_bytes());
                let digest = hasher.finalize();
                let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
                let keep = max_len.saturating_sub(suffix.len() + 1);
                out = format!("{}_{}", out.chars().take(keep).collect::<String>(), suffix);
            }
        }
        out
    }
}

/// ANSI-flavoured compiler with double-quoted identifiers
#[derive(Debug, Clone, Default)]
pub struct AnsiSqlCompiler {
    labels: LabelMutation,
}

impl AnsiSqlCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_mutation(mut self, labels: LabelMutation) -> Self {
        self.labels = labels;
        self
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(true) => "TRUE".to_string(),
        serde_json::Value::Bool(false) => "FALSE".to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn timestamp(dttm: chrono::NaiveDateTime) -> String {
    format!("TIMESTAMP '{}'", dttm.format("%Y-%m-%d %H:%M:%S"))
}

fn column_expr(column: &ColumnRef) -> String {
    match column {
        ColumnRef::Named(name) => quote(name),
        ColumnRef::Adhoc(adhoc) => adhoc.sql_expression.clone(),
    }
}

fn metric_expr(metric: &MetricRef, schema: &Schema) -> Result<String, CompileError> {
    match metric {
        MetricRef::Named(name) => schema
            .metric(name)
            .map(str::to_string)
            .ok_or_else(|| CompileError::new(format!("Metric '{}' does not exist", name))),
        MetricRef::Adhoc(adhoc) => Ok(adhoc_metric_expr(adhoc)),
    }
}

fn adhoc_metric_expr(adhoc: &AdhocMetric) -> String {
    match adhoc {
        AdhocMetric::Simple {
            column, aggregate, ..
        } => {
            let aggregate = aggregate.to_uppercase();
            if aggregate == "COUNT_DISTINCT" {
                format!("COUNT(DISTINCT {})", quote(&column.column_name))
            } else {
                format!("{}({})", aggregate, quote(&column.column_name))
            }
        }
        AdhocMetric::Sql { sql_expression, .. } => sql_expression.clone(),
    }
}

fn filter_sql(filter: &FilterClause) -> Option<String> {
    let target = column_expr(&filter.col);
    match filter.op {
        FilterOp::IsNull | FilterOp::IsNotNull => Some(format!("{} {}", target, filter.op.sql())),
        FilterOp::In | FilterOp::NotIn => {
            let values = match &filter.val {
                Some(serde_json::Value::Array(items)) => items.iter().map(literal).collect::<Vec<_>>(),
                Some(other) => vec![literal(other)],
                None => Vec::new(),
            };
            match (filter.op, values.is_empty()) {
                // IN () matches nothing; NOT IN () matches everything
                (FilterOp::In, true) => Some(format!("{} IS NULL AND {} IS NOT NULL", target, target)),
                (_, true) => None,
                _ => Some(format!("{} {} ({})", target, filter.op.sql(), values.join(", "))),
            }
        }
        FilterOp::TemporalRange => None,
        _ => {
            let value = filter.val.as_ref().map(literal).unwrap_or_else(|| "NULL".to_string());
            Some(format!("{} {} {}", target, filter.op.sql(), value))
        }
    }
}

impl AnsiSqlCompiler {
    fn where_clauses(&self, spec: &QuerySpec, rls: &[String]) -> Vec<String> {
        let mut clauses = Vec::new();
        if let Some(granularity) = &spec.granularity {
            if let Some(from) = spec.from_dttm {
                clauses.push(format!("{} >= {}", quote(granularity), timestamp(from)));
            }
            if let Some(to) = spec.to_dttm {
                clauses.push(format!("{} < {}", quote(granularity), timestamp(to)));
            }
        }
        clauses.extend(spec.filters.iter().filter_map(filter_sql));
        if let Some(clause) = spec.extra_clause("where") {
            clauses.push(format!("({})", clause));
        }
        clauses.extend(rls.iter().map(|clause| format!("({})", clause)));
        clauses
    }

    fn order_clauses(&self, spec: &QuerySpec, schema: &Schema, time_label: Option<&str>) -> Result<Vec<String>, CompileError> {
        let direction = |ascending: bool| if ascending { "ASC" } else { "DESC" };
        let metric_labels = spec.metric_labels();

        if !spec.orderby.is_empty() {
            return spec
                .orderby
                .iter()
                .map(|(target, ascending)| {
                    let expr = match target {
                        OrderTarget::Metric(adhoc) => {
                            let label = adhoc.label();
                            if metric_labels.contains(&label) {
                                quote(&self.labels.apply(&label))
                            } else {
                                adhoc_metric_expr(adhoc)
                            }
                        }
                        OrderTarget::Column(ColumnRef::Named(name)) => {
                            if metric_labels.contains(name) || spec.column_labels().contains(name) {
                                quote(&self.labels.apply(name))
                            } else if let Some(expression) = schema.metric(name) {
                                expression.to_string()
                            } else {
                                quote(name)
                            }
                        }
                        OrderTarget::Column(adhoc) => column_expr(adhoc),
                    };
                    Ok(format!("{} {}", expr, direction(*ascending)))
                })
                .collect();
        }

        if let Some(time_label) = time_label {
            return Ok(vec![format!("{} ASC", quote(&self.labels.apply(time_label)))]);
        }
        match spec.metrics.first() {
            Some(metric) => Ok(vec![format!(
                "{} {}",
                quote(&self.labels.apply(&metric.label())),
                direction(!spec.order_desc)
            )]),
            None => Ok(Vec::new()),
        }
    }

    /// `dims IN (SELECT dims ... ORDER BY metric DESC LIMIT n)` restricting to the top series
    fn series_limit_clause(
        &self,
        spec: &QuerySpec,
        schema: &Schema,
        where_clauses: &[String],
    ) -> Result<Option<String>, CompileError> {
        if spec.series_limit == 0 || spec.columns.is_empty() {
            return Ok(None);
        }
        let Some(metric) = spec.series_limit_metric.as_ref().or(spec.metrics.first()) else {
            return Ok(None);
        };
        let dims: Vec<String> = spec.columns.iter().map(column_expr).collect();
        let mut inner = format!("SELECT {} FROM {}", dims.join(", "), quote(&schema.table_name));
        if !where_clauses.is_empty() {
            inner.push_str(&format!(" WHERE {}", where_clauses.join(" AND ")));
        }
        inner.push_str(&format!(
            " GROUP BY {} ORDER BY {} DESC LIMIT {}",
            dims.join(", "),
            metric_expr(metric, schema)?,
            spec.series_limit
        ));
        let target = if dims.len() == 1 {
            dims[0].clone()
        } else {
            format!("({})", dims.join(", "))
        };
        Ok(Some(format!("{} IN ({})", target, inner)))
    }
}

impl SqlCompiler for AnsiSqlCompiler {
    fn compile(&self, spec: &QuerySpec, schema: &Schema, rls: &[String]) -> Result<CompiledQuery, CompileError> {
        let grain = spec.time_grain().map_err(|e| CompileError::new(e.to_string()))?;
        let mut select = Vec::new();
        let mut group_by = Vec::new();
        let mut expected_labels = Vec::new();

        let time_label = match (spec.is_timeseries, &spec.granularity) {
            (true, Some(granularity)) => {
                let expr = match grain {
                    Some(grain) => date_trunc(grain, granularity),
                    None => quote(granularity),
                };
                select.push(format!("{} AS {}", expr, quote(&self.labels.apply(granularity))));
                group_by.push(expr);
                expected_labels.push(granularity.clone());
                Some(granularity.as_str())
            }
            (true, None) => return Err(CompileError::new("Time series queries need a temporal column")),
            _ => None,
        };

        for column in &spec.columns {
            let label = column.label();
            if expected_labels.contains(&label) {
                continue;
            }
            let expr = column_expr(column);
            select.push(format!("{} AS {}", expr, quote(&self.labels.apply(&label))));
            group_by.push(expr);
            expected_labels.push(label);
        }

        for metric in &spec.metrics {
            let label = metric.label();
            select.push(format!("{} AS {}", metric_expr(metric, schema)?, quote(&self.labels.apply(&label))));
            expected_labels.push(label);
        }

        let mut where_clauses = self.where_clauses(spec, rls);
        let mut sql = format!("SELECT {} FROM {}", select.join(", "), quote(&schema.table_name));
        if let Some(series) = self.series_limit_clause(spec, schema, &where_clauses)? {
            where_clauses.push(series);
        }
        if !where_clauses.is_empty() {
            sql.push_str(&format!(" WHERE {}", where_clauses.join(" AND ")));
        }
        if !spec.metrics.is_empty() && !group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
        }
        if let Some(having) = spec.extra_clause("having") {
            if spec.metrics.is_empty() {
                return Err(CompileError::with_sql("HAVING requires at least one metric", sql));
            }
            sql.push_str(&format!(" HAVING {}", having));
        }

        let order = self.order_clauses(spec, schema, time_label)?;
        if !order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        if let Some(limit) = spec.row_limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if spec.row_offset > 0 {
            sql.push_str(&format!(" OFFSET {}", spec.row_offset));
        }

        Ok(CompiledQuery { sql, expected_labels })
    }
}

fn date_trunc(grain: TimeGrain, column: &str) -> String {
    format!("DATE_TRUNC('{}', {})", grain.sql_name(), quote(column))
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    /// Partial SQL produced before the failure
    pub sql: Option<String>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql: None,
        }
    }

    pub fn with_sql(message: impl Into<String>, sql: String) -> Self {
        Self {
            message: message.into(),
            sql: Some(sql),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{parse_datetime, Table, Value};
    use crate::spec::ValidationContext;
    use crate::sql::run_sql;
    use serde_json::json;
    use std::collections::HashMap;

    fn ts(s: &str) -> Value {
        Value::Timestamp(parse_datetime(s).unwrap().and_utc().timestamp_millis())
    }

    fn births() -> Table {
        Table::from_columns(vec![
            ("ds", vec![ts("2020-01-03"), ts("2020-01-20"), ts("2020-02-11"), ts("2020-02-12")]),
            (
                "country",
                vec![
                    Value::String("fr".into()),
                    Value::String("us".into()),
                    Value::String("us".into()),
                    Value::String("de".into()),
                ],
            ),
            ("num", vec![Value::Int64(1), Value::Int64(2), Value::Int64(3), Value::Int64(4)]),
        ])
        .unwrap()
    }

    fn schema() -> Schema {
        let mut schema = Schema::infer("births", &births());
        schema.metrics.insert("sum__num".into(), "SUM(num)".into());
        schema
    }

    fn validated(body: serde_json::Value) -> QuerySpec {
        let mut spec: QuerySpec = serde_json::from_value(body).unwrap();
        let schema = schema();
        spec.validate(&ValidationContext {
            schema: &schema,
            max_row_limit: 1000,
            now: parse_datetime("2020-06-01").unwrap(),
        })
        .unwrap();
        spec
    }

    fn run(sql: &str) -> Table {
        let tables = HashMap::from([("births".to_string(), births())]);
        run_sql(&tables, sql).unwrap().table
    }

    #[test]
    fn test_compile_grouped_query() {
        let spec = validated(json!({
            "columns": ["country"],
            "metrics": ["sum__num"],
            "filters": [{"col": "country", "op": "!=", "val": "de"}],
            "row_limit": 10
        }));
        let compiled = AnsiSqlCompiler::new().compile(&spec, &schema(), &[]).unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "country" AS "country", SUM(num) AS "sum__num" FROM "births" WHERE "country" != 'de' GROUP BY "country" ORDER BY "sum__num" DESC LIMIT 10"#
        );
        assert_eq!(compiled.expected_labels, vec!["country", "sum__num"]);

        let table = run(&compiled.sql);
        assert_eq!(table.rows[0], vec![Value::String("us".into()), Value::Int64(5)]);
        assert_eq!(table.row_count(), 2);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let spec = validated(json!({
            "columns": ["country"],
            "metrics": [{"expressionType": "SIMPLE", "column": {"column_name": "num"}, "aggregate": "MAX"}],
            "time_range": "2020-01-01 : 2020-02-01",
            "extras": {"where": "num  >  0"}
        }));
        let compiler = AnsiSqlCompiler::new();
        let a = compiler.compile(&spec, &schema(), &["country != 'xx'".into()]).unwrap();
        let b = compiler.compile(&spec, &schema(), &["country != 'xx'".into()]).unwrap();
        assert_eq!(a, b);
        assert!(a.sql.contains(r#""ds" >= TIMESTAMP '2020-01-01 00:00:00' AND "ds" < TIMESTAMP '2020-02-01 00:00:00'"#));
        assert!(a.sql.contains("(num > 0) AND (country != 'xx')"));

        let table = run(&a.sql);
        assert_eq!(table.columns, vec!["country", "MAX(num)"]);
        assert_eq!(table.row_count(), 2);
    }

    #[test]
    fn test_compile_timeseries() {
        let spec = validated(json!({
            "metrics": ["sum__num"],
            "is_timeseries": true,
            "granularity": "ds",
            "extras": {"time_grain_sqla": "P1M"}
        }));
        let compiled = AnsiSqlCompiler::new().compile(&spec, &schema(), &[]).unwrap();
        assert!(compiled.sql.starts_with(r#"SELECT DATE_TRUNC('month', "ds") AS "ds""#));
        assert!(compiled.sql.contains(r#"ORDER BY "ds" ASC"#));

        let table = run(&compiled.sql);
        assert_eq!(
            table.rows,
            vec![vec![ts("2020-01-01"), Value::Int64(3)], vec![ts("2020-02-01"), Value::Int64(7)]]
        );
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let spec = validated(json!({
            "columns": ["country"],
            "metrics": ["sum__num"],
            "filters": [{"col": "country", "op": "IN", "val": []}, {"col": "num", "op": "NOT IN", "val": []}]
        }));
        let compiled = AnsiSqlCompiler::new().compile(&spec, &schema(), &[]).unwrap();
        assert!(compiled.sql.contains(r#""country" IS NULL AND "country" IS NOT NULL"#));
        assert!(!compiled.sql.contains("NOT IN"));
        assert!(run(&compiled.sql).is_empty());
    }

    #[test]
    fn test_series_limit() {
        let spec = validated(json!({
            "columns": ["country"],
            "metrics": ["sum__num"],
            "series_limit": 1
        }));
        let compiled = AnsiSqlCompiler::new().compile(&spec, &schema(), &[]).unwrap();
        assert!(compiled.sql.contains(
            r#""country" IN (SELECT "country" FROM "births" GROUP BY "country" ORDER BY SUM(num) DESC LIMIT 1)"#
        ));
        let table = run(&compiled.sql);
        assert_eq!(table.rows, vec![vec![Value::String("us".into()), Value::Int64(5)]]);
    }

    #[test]
    fn test_label_mutation() {
        let mutation = LabelMutation {
            max_len: Some(12),
            lowercase: true,
        };
        assert_eq!(mutation.apply("Country"), "country");
        let long = mutation.apply("SUM(number_of_births)");
        assert_eq!(long.chars().count(), 12);
        assert_eq!(long, mutation.apply("SUM(number_of_births)"));
        assert_ne!(long, mutation.apply("SUM(number_of_deaths)"));

        let spec = validated(json!({"columns": ["country"], "metrics": ["sum__num"]}));
        let compiled = AnsiSqlCompiler::new()
            .with_label_mutation(LabelMutation { max_len: None, lowercase: true })
            .compile(&spec, &schema(), &[])
            .unwrap();
        assert_eq!(compiled.expected_labels, vec!["country", "sum__num"]);
    }

    #[test]
    fn test_unknown_saved_metric() {
        let spec: QuerySpec = serde_json::from_value(json!({"metrics": ["nope"]})).unwrap();
        let err = AnsiSqlCompiler::new().compile(&spec, &schema(), &[]).unwrap_err();
        assert!(err.message.contains("nope"));
    }
}
