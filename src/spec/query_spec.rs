use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

use super::column::{AdhocColumn, AdhocMetric, ColumnRef, MetricRef, OrderBy, OrderTarget};
use super::filter::{FilterClause, FilterOp, FilterSummary};
use super::post_processing::{Orientation, PostProcessingOp};
use super::sanitize::{sanitize_clause, sanitize_expression, ClauseError};
use super::time::{resolve_time_range, RelativeDelta, ShiftedWindow, TimeGrain, TimeOffset, TimeParseError};
use crate::datasource::{DatasourceRef, Schema};

/// Pseudo-column under which the time range filter is reported
pub const TIME_RANGE_COLUMN: &str = "__time_range";

const SANITIZED_EXTRAS: [&str; 2] = ["where", "having"];
const SIMPLE_AGGREGATES: [&str; 6] = ["SUM", "AVG", "MIN", "MAX", "COUNT", "COUNT_DISTINCT"];

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One request for tabular data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DatasourceRef>,
    /// Dimensions
    #[serde(alias = "groupby", deserialize_with = "null_as_default")]
    pub columns: Vec<ColumnRef>,
    #[serde(deserialize_with = "null_as_default")]
    pub metrics: Vec<MetricRef>,
    #[serde(alias = "filter", deserialize_with = "null_as_default")]
    pub filters: Vec<FilterClause>,
    /// Temporal column the time range applies to
    pub granularity: Option<String>,
    /// Prepend the (grain-truncated) temporal column to the dimensions
    pub is_timeseries: bool,
    pub time_range: Option<String>,
    pub time_shift: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub time_offsets: Vec<String>,
    /// `None` means unlimited
    pub row_limit: Option<u64>,
    pub row_offset: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub orderby: Vec<OrderBy>,
    pub order_desc: bool,
    pub series_limit: u64,
    pub series_limit_metric: Option<MetricRef>,
    #[serde(deserialize_with = "null_as_default")]
    pub post_processing: Vec<PostProcessingOp>,
    #[serde(deserialize_with = "null_as_default")]
    pub extras: BTreeMap<String, serde_json::Value>,

    /// Resolved bounds; never part of the cache key
    #[serde(skip)]
    pub from_dttm: Option<NaiveDateTime>,
    #[serde(skip)]
    pub to_dttm: Option<NaiveDateTime>,
    #[serde(skip)]
    pub applied_filters: Vec<FilterSummary>,
    #[serde(skip)]
    pub rejected_filters: Vec<FilterSummary>,
    #[serde(skip)]
    validated: bool,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            datasource: None,
            columns: Vec::new(),
            metrics: Vec::new(),
            filters: Vec::new(),
            granularity: None,
            is_timeseries: false,
            time_range: None,
            time_shift: None,
            time_offsets: Vec::new(),
            row_limit: None,
            row_offset: 0,
            orderby: Vec::new(),
            order_desc: true,
            series_limit: 0,
            series_limit_metric: None,
            post_processing: Vec::new(),
            extras: BTreeMap::new(),
            from_dttm: None,
            to_dttm: None,
            applied_filters: Vec::new(),
            rejected_filters: Vec::new(),
            validated: false,
        }
    }
}

/// What validation checks a spec against
pub struct ValidationContext<'a> {
    pub schema: &'a Schema,
    pub max_row_limit: u64,
    pub now: NaiveDateTime,
}

impl QuerySpec {
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Normalise the query in place. Later calls are no-ops.
    pub fn validate(&mut self, ctx: &ValidationContext<'_>) -> Result<(), SpecError> {
        if self.validated {
            return Ok(());
        }

        self.normalize_filters();
        if self.columns.is_empty() && self.metrics.is_empty() && !self.is_timeseries {
            return Err(SpecError::EmptyQuery);
        }
        self.sanitize_expressions()?;
        self.check_columns(ctx.schema)?;
        self.check_metrics(ctx.schema)?;
        self.split_filters(ctx.schema)?;
        self.resolve_granularity(ctx.schema)?;
        self.sanitize_extras()?;
        self.time_grain()?;

        if let Some(limit) = self.row_limit {
            self.row_limit = Some(limit.min(ctx.max_row_limit));
        }
        if self.series_limit > 0 && self.series_limit_metric.is_none() {
            self.series_limit_metric = self.metrics.first().cloned();
        }

        self.resolve_time(ctx)?;
        for offset in &self.time_offsets {
            TimeOffset::parse(offset)?;
        }

        self.validated = true;
        Ok(())
    }

    /// Move temporal range filters into `time_range` and canonicalise the rest
    fn normalize_filters(&mut self) {
        let mut kept = Vec::with_capacity(self.filters.len());
        for mut filter in std::mem::take(&mut self.filters) {
            if filter.op == FilterOp::TemporalRange {
                let range = filter.val.as_ref().and_then(|v| v.as_str()).map(str::to_string);
                let unset = self
                    .time_range
                    .as_deref()
                    .map(|r| r.trim().is_empty() || r.eq_ignore_ascii_case("no filter"))
                    .unwrap_or(true);
                if unset {
                    self.time_range = range;
                }
                if self.granularity.is_none() {
                    self.granularity = filter.col.physical_name().map(str::to_string);
                }
                continue;
            }
            filter.normalize();
            kept.push(filter);
        }
        self.filters = kept;
    }

    /// Every ad-hoc SQL fragment must be one expression; store its sanitized form
    fn sanitize_expressions(&mut self) -> Result<(), SpecError> {
        let columns = self
            .columns
            .iter_mut()
            .chain(self.filters.iter_mut().map(|f| &mut f.col))
            .chain(self.orderby.iter_mut().filter_map(|(target, _)| match target {
                OrderTarget::Column(column) => Some(column),
                OrderTarget::Metric(_) => None,
            }));
        for column in columns {
            if let ColumnRef::Adhoc(AdhocColumn { sql_expression, .. }) = column {
                *sql_expression = sanitize_sql_expression(sql_expression)?;
            }
        }

        let metrics = self
            .metrics
            .iter_mut()
            .chain(self.series_limit_metric.iter_mut())
            .filter_map(|metric| match metric {
                MetricRef::Adhoc(adhoc) => Some(adhoc),
                MetricRef::Named(_) => None,
            })
            .chain(self.orderby.iter_mut().filter_map(|(target, _)| match target {
                OrderTarget::Metric(adhoc) => Some(adhoc),
                OrderTarget::Column(_) => None,
            }));
        for metric in metrics {
            if let AdhocMetric::Sql { sql_expression, .. } = metric {
                *sql_expression = sanitize_sql_expression(sql_expression)?;
            }
        }
        Ok(())
    }

    fn check_columns(&self, schema: &Schema) -> Result<(), SpecError> {
        for column in &self.columns {
            if let Some(name) = column.physical_name() {
                if !schema.has_column(name) {
                    return Err(SpecError::ColumnNotFound(name.to_string()));
                }
            }
        }
        Ok(())
    }

    fn check_metrics(&self, schema: &Schema) -> Result<(), SpecError> {
        for metric in self.metrics.iter().chain(self.series_limit_metric.iter()) {
            check_metric(metric, schema)?;
        }
        for (target, _) in &self.orderby {
            match target {
                OrderTarget::Metric(adhoc) => check_metric(&MetricRef::Adhoc(adhoc.clone()), schema)?,
                OrderTarget::Column(ColumnRef::Named(name)) => {
                    let known = schema.has_column(name)
                        || schema.metric(name).is_some()
                        || self.metrics.iter().any(|m| m.label() == *name)
                        || self.columns.iter().any(|c| c.label() == *name);
                    if !known {
                        return Err(SpecError::ColumnNotFound(name.clone()));
                    }
                }
                OrderTarget::Column(ColumnRef::Adhoc(_)) => {}
            }
        }
        Ok(())
    }

    /// Drop filters on unknown columns, recording applied and rejected ones
    fn split_filters(&mut self, schema: &Schema) -> Result<(), SpecError> {
        let mut kept = Vec::with_capacity(self.filters.len());
        for filter in std::mem::take(&mut self.filters) {
            let label = filter.col.label();
            if let Some(name) = filter.col.physical_name() {
                if !schema.has_column(name) {
                    warn!(column = %name, "Rejecting filter on column missing from datasource");
                    self.rejected_filters
                        .push(FilterSummary::rejected(&label, "not_in_datasource"));
                    continue;
                }
            }
            check_filter_operand(&filter)?;
            self.applied_filters.push(FilterSummary::applied(&label));
            kept.push(filter);
        }
        self.filters = kept;
        Ok(())
    }

    fn has_time_range(&self) -> bool {
        self.time_range
            .as_deref()
            .map(|r| !r.trim().is_empty() && !r.trim().eq_ignore_ascii_case("no filter"))
            .unwrap_or(false)
    }

    fn resolve_granularity(&mut self, schema: &Schema) -> Result<(), SpecError> {
        if self.granularity.is_none() && (self.is_timeseries || self.has_time_range()) {
            self.granularity = schema.main_dttm_col.clone();
        }
        match &self.granularity {
            Some(column) if !schema.has_column(column) => Err(SpecError::ColumnNotFound(column.clone())),
            Some(column) if !schema.is_temporal(column) => Err(SpecError::NotTemporal(column.clone())),
            None if self.is_timeseries => Err(SpecError::NoTemporalColumn),
            _ => Ok(()),
        }
    }

    fn sanitize_extras(&mut self) -> Result<(), SpecError> {
        for key in SANITIZED_EXTRAS {
            let Some(value) = self.extras.get(key) else {
                continue;
            };
            let Some(clause) = value.as_str() else {
                return Err(SpecError::InvalidExtra(key.to_string()));
            };
            let sanitized = sanitize_clause(clause).map_err(|source| SpecError::InvalidClause {
                key: key.to_string(),
                source,
            })?;
            if sanitized.is_empty() {
                self.extras.remove(key);
            } else {
                self.extras
                    .insert(key.to_string(), serde_json::Value::String(sanitized));
            }
        }
        Ok(())
    }

    fn resolve_time(&mut self, ctx: &ValidationContext<'_>) -> Result<(), SpecError> {
        if !self.has_time_range() {
            return Ok(());
        }
        if self.granularity.is_none() {
            warn!("Rejecting time range: datasource has no temporal column");
            self.rejected_filters
                .push(FilterSummary::rejected(TIME_RANGE_COLUMN, "no_temporal_column"));
            return Ok(());
        }

        let (mut from, mut to) = resolve_time_range(self.time_range.as_deref(), ctx.now)?;
        if let Some(shift) = self.time_shift.as_deref().filter(|s| !s.trim().is_empty()) {
            let delta = RelativeDelta::parse(shift)?;
            from = from.and_then(|f| delta.apply(f));
            to = to.and_then(|t| delta.apply(t));
        }
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(SpecError::InvalidBounds { from: f, to: t });
            }
        }
        self.from_dttm = from;
        self.to_dttm = to;
        if from.is_some() || to.is_some() {
            self.applied_filters
                .push(FilterSummary::applied(TIME_RANGE_COLUMN));
        }
        Ok(())
    }

    /// Grain from `extras.time_grain_sqla`
    pub fn time_grain(&self) -> Result<Option<TimeGrain>, SpecError> {
        match self.extras.get("time_grain_sqla") {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(grain)) => TimeGrain::parse(grain)
                .map(Some)
                .ok_or_else(|| SpecError::InvalidTimeGrain(grain.clone())),
            Some(other) => Err(SpecError::InvalidTimeGrain(other.to_string())),
        }
    }

    pub fn extra_clause(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(|v| v.as_str())
    }

    /// Result column labels: temporal axis, then dimensions, then metrics
    pub fn column_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        if let (true, Some(granularity)) = (self.is_timeseries, &self.granularity) {
            labels.push(granularity.clone());
        }
        for column in &self.columns {
            let label = column.label();
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }

    pub fn metric_labels(&self) -> Vec<String> {
        self.metrics.iter().map(MetricRef::label).collect()
    }

    /// No dimensions, some metrics, no post-processing
    pub fn is_totals_query(&self) -> bool {
        self.columns.is_empty()
            && !self.is_timeseries
            && !self.metrics.is_empty()
            && self.post_processing.is_empty()
    }

    /// Column-oriented contribution steps need denominators from a totals query
    pub fn needs_totals(&self) -> bool {
        self.post_processing.iter().any(|op| {
            matches!(op, PostProcessingOp::Contribution(options)
                if options.orientation == Orientation::Column && options.contribution_totals.is_none())
        })
    }

    /// Inject totals into every column-oriented contribution step
    pub fn inject_totals(&mut self, totals: &BTreeMap<String, f64>) {
        for op in &mut self.post_processing {
            if let PostProcessingOp::Contribution(options) = op {
                if options.orientation == Orientation::Column {
                    options.contribution_totals = Some(totals.clone());
                }
            }
        }
    }

    /// Spec for one comparison window of this (validated) spec
    pub fn shifted(&self, window: &ShiftedWindow) -> QuerySpec {
        let mut shifted = self.clone();
        shifted.time_range = Some(format!(
            "{} : {}",
            window.from.format("%Y-%m-%dT%H:%M:%S"),
            window.to.format("%Y-%m-%dT%H:%M:%S")
        ));
        shifted.time_shift = None;
        shifted.time_offsets.clear();
        shifted.post_processing.clear();
        shifted.from_dttm = Some(window.from);
        shifted.to_dttm = Some(window.to);
        shifted
    }

    /// Raw-row variant of this spec: every physical column, no aggregation,
    /// same filters and time range, capped at `row_limit` rows.
    pub fn samples(&self, schema: &Schema, row_limit: u64) -> QuerySpec {
        let mut samples = self.clone();
        samples.columns = schema
            .columns
            .iter()
            .map(|column| ColumnRef::Named(column.name.clone()))
            .collect();
        samples.metrics.clear();
        samples.is_timeseries = false;
        samples.orderby.clear();
        samples.series_limit = 0;
        samples.series_limit_metric = None;
        samples.post_processing.clear();
        samples.time_offsets.clear();
        samples.extras.remove("having");
        samples.row_limit = Some(row_limit);
        samples.row_offset = 0;
        samples
    }

    /// Deterministic fingerprint of every field except the resolved bounds,
    /// salted with request context (content version, RLS, actor).
    pub fn cache_key(&self, salts: &[(&str, &str)]) -> Result<String, SpecError> {
        let mut canonical = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => return Err(SpecError::Serialization("spec is not an object".into())),
            Err(e) => return Err(SpecError::Serialization(e.to_string())),
        };
        let salts: serde_json::Map<String, serde_json::Value> = salts
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        canonical.insert("__salts".to_string(), serde_json::Value::Object(salts));

        let json = serde_json::to_string(&canonical).map_err(|e| SpecError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        let digest = hasher.finalize();
        Ok(digest[..16].iter().map(|byte| format!("{:02x}", byte)).collect())
    }
}

fn check_metric(metric: &MetricRef, schema: &Schema) -> Result<(), SpecError> {
    match metric {
        MetricRef::Named(name) => {
            if schema.metric(name).is_none() {
                return Err(SpecError::MetricNotFound(name.clone()));
            }
        }
        MetricRef::Adhoc(AdhocMetric::Simple {
            column, aggregate, ..
        }) => {
            if !schema.has_column(&column.column_name) {
                return Err(SpecError::ColumnNotFound(column.column_name.clone()));
            }
            if !SIMPLE_AGGREGATES.contains(&aggregate.to_uppercase().as_str()) {
                return Err(SpecError::InvalidMetric(aggregate.clone()));
            }
        }
        MetricRef::Adhoc(AdhocMetric::Sql { .. }) => {}
    }
    Ok(())
}

fn sanitize_sql_expression(expr: &str) -> Result<String, SpecError> {
    sanitize_expression(expr).map_err(|source| SpecError::InvalidClause {
        key: "sqlExpression".to_string(),
        source,
    })
}

fn check_filter_operand(filter: &FilterClause) -> Result<(), SpecError> {
    let label = filter.col.label();
    match filter.op {
        FilterOp::IsNull | FilterOp::IsNotNull | FilterOp::In | FilterOp::NotIn => Ok(()),
        FilterOp::Like | FilterOp::NotLike => match &filter.val {
            Some(serde_json::Value::String(_)) => Ok(()),
            _ => Err(SpecError::InvalidFilter(format!("{} {} needs a string pattern", label, filter.op.sql()))),
        },
        _ => match &filter.val {
            None | Some(serde_json::Value::Null) => Err(SpecError::InvalidFilter(format!(
                "{} {} needs a value",
                label,
                filter.op.sql()
            ))),
            Some(serde_json::Value::Array(_)) | Some(serde_json::Value::Object(_)) => Err(
                SpecError::InvalidFilter(format!("{} {} needs a scalar value", label, filter.op.sql())),
            ),
            Some(_) => Ok(()),
        },
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SpecError {
    #[error("Query must have at least one dimension or metric")]
    EmptyQuery,

    #[error("Column '{0}' does not exist in the datasource")]
    ColumnNotFound(String),

    #[error("Metric '{0}' does not exist in the datasource")]
    MetricNotFound(String),

    #[error("Unsupported aggregate '{0}'")]
    InvalidMetric(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Column '{0}' is not temporal")]
    NotTemporal(String),

    #[error("Time series queries need a temporal column")]
    NoTemporalColumn,

    #[error("Invalid time grain '{0}'")]
    InvalidTimeGrain(String),

    #[error(transparent)]
    Time(#[from] TimeParseError),

    #[error("From date {from} cannot be larger than to date {to}")]
    InvalidBounds { from: NaiveDateTime, to: NaiveDateTime },

    #[error("Invalid `{key}` clause: {source}")]
    InvalidClause { key: String, source: ClauseError },

    #[error("Extra `{0}` must be a string")]
    InvalidExtra(String),

    #[error("Failed to serialize query: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{parse_datetime, Table, Value};
    use crate::spec::post_processing::ContributionOptions;
    use serde_json::json;

    fn schema() -> Schema {
        let table = Table::from_columns(vec![
            ("ds", vec![Value::Timestamp(0)]),
            ("country", vec![Value::String("fr".into())]),
            ("num", vec![Value::Int64(1)]),
        ])
        .unwrap();
        let mut schema = Schema::infer("births", &table);
        schema.metrics.insert("sum__num".into(), "SUM(num)".into());
        schema
    }

    fn ctx<'a>(schema: &'a Schema, now: &str) -> ValidationContext<'a> {
        ValidationContext {
            schema,
            max_row_limit: 50_000,
            now: parse_datetime(now).unwrap(),
        }
    }

    fn spec(value: serde_json::Value) -> QuerySpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_key_is_deterministic() {
        let schema = schema();
        let body = json!({"columns": ["country"], "metrics": ["sum__num"], "time_range": "Last week"});
        let mut a = spec(body.clone());
        let mut b = spec(body);
        a.validate(&ctx(&schema, "2024-03-15")).unwrap();
        b.validate(&ctx(&schema, "2024-03-15")).unwrap();
        let salts = [("version", "1"), ("rls", "")];
        assert_eq!(a.cache_key(&salts).unwrap(), a.cache_key(&salts).unwrap());
        assert_eq!(a.cache_key(&salts).unwrap(), b.cache_key(&salts).unwrap());
        assert_eq!(a.cache_key(&salts).unwrap().len(), 32);
        assert_ne!(a.cache_key(&salts).unwrap(), a.cache_key(&[("version", "2")]).unwrap());
    }

    #[test]
    fn test_relative_range_keys_on_text() {
        let schema = schema();
        let body = json!({"metrics": ["sum__num"], "time_range": "Last 7 days"});
        let mut monday = spec(body.clone());
        let mut friday = spec(body);
        monday.validate(&ctx(&schema, "2024-03-11 09:00:00")).unwrap();
        friday.validate(&ctx(&schema, "2024-03-15 17:00:00")).unwrap();
        assert_ne!(monday.from_dttm, friday.from_dttm);
        assert_eq!(monday.cache_key(&[]).unwrap(), friday.cache_key(&[]).unwrap());

        let mut literal = spec(json!({"metrics": ["sum__num"], "time_range": "2024-03-04 : 2024-03-11"}));
        literal.validate(&ctx(&schema, "2024-03-11 09:00:00")).unwrap();
        assert_eq!(literal.from_dttm, monday.from_dttm);
        assert_ne!(literal.cache_key(&[]).unwrap(), monday.cache_key(&[]).unwrap());
    }

    #[test]
    fn test_missing_and_empty_filters_share_a_key() {
        let schema = schema();
        let mut keys = Vec::new();
        for filters in [json!(null), json!([])] {
            let mut s = spec(json!({"metrics": ["sum__num"], "filters": filters}));
            s.validate(&ctx(&schema, "2024-01-01")).unwrap();
            keys.push(s.cache_key(&[]).unwrap());
        }
        let mut absent = spec(json!({"metrics": ["sum__num"]}));
        absent.validate(&ctx(&schema, "2024-01-01")).unwrap();
        keys.push(absent.cache_key(&[]).unwrap());
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_validate_sanitizes_once() {
        let schema = schema();
        let mut s = spec(json!({
            "metrics": ["sum__num"],
            "extras": {"where": "(\n  num > 0\n)", "having": " -- nothing"}
        }));
        s.validate(&ctx(&schema, "2024-01-01")).unwrap();
        assert_eq!(s.extra_clause("where"), Some("(num > 0)"));
        let first = s.clone();
        let key = s.cache_key(&[]).unwrap();

        s.validate(&ctx(&schema, "2024-01-01")).unwrap();
        assert_eq!(s.extras, first.extras);
        assert_eq!(s.cache_key(&[]).unwrap(), key);
    }

    #[test]
    fn test_invalid_specs() {
        let schema = schema();
        let now = "2024-01-01";
        let cases = [
            json!({}),
            json!({"columns": ["state"]}),
            json!({"metrics": ["avg__num"]}),
            json!({"metrics": ["sum__num"], "time_range": "2024-02-01 : 2024-01-01"}),
            json!({"metrics": ["sum__num"], "extras": {"where": "1 = 1; DROP TABLE x"}}),
            json!({"metrics": ["sum__num"], "time_offsets": ["sometime"]}),
            json!({"metrics": ["sum__num"], "filters": [{"col": "num", "op": ">"}]}),
            json!({"metrics": ["sum__num"], "extras": {"time_grain_sqla": "P2D"}}),
            json!({"metrics": ["sum__num"], "granularity": "country"}),
        ];
        for case in cases {
            let mut s = spec(case.clone());
            assert!(s.validate(&ctx(&schema, now)).is_err(), "{case}");
        }
    }

    #[test]
    fn test_key_is_pinned() {
        // Keys are shared across processes, so their exact value is part of the contract
        let schema = schema();
        let salts = [("content_version", "1:7"), ("rls", "")];

        let mut bare = spec(json!({"metrics": ["sum__num"]}));
        bare.validate(&ctx(&schema, "2024-03-15")).unwrap();
        assert_eq!(bare.cache_key(&salts).unwrap(), "d876de0693656b7af96ea8df883dff5d");

        let mut grouped = spec(json!({
            "columns": ["country"],
            "metrics": ["sum__num"],
            "granularity": "ds",
            "time_range": "Last week",
            "row_limit": 100
        }));
        grouped.validate(&ctx(&schema, "2024-03-15")).unwrap();
        assert_eq!(grouped.cache_key(&salts).unwrap(), "c5b541f081556ac1150cff8a7f20764e");
    }

    #[test]
    fn test_adhoc_expressions_must_be_single_expressions() {
        let schema = schema();
        let injected = "num FROM births; DROP TABLE births; --";
        let cases = [
            json!({"columns": [{"sqlExpression": injected, "label": "x"}], "metrics": ["sum__num"]}),
            json!({"groupby": [{"sqlExpression": "num FROM births", "label": "x"}], "metrics": ["sum__num"]}),
            json!({"metrics": ["sum__num"],
                   "filters": [{"col": {"sqlExpression": "num) OR (1 = 1", "label": "x"}, "op": "IS NOT NULL"}]}),
            json!({"metrics": ["sum__num"], "orderby": [[{"sqlExpression": "num, state", "label": "x"}, true]]}),
            json!({"metrics": [{"expressionType": "SQL", "sqlExpression": "SUM(num) AS s, 1"}]}),
        ];
        for case in cases {
            let mut s = spec(case.clone());
            let err = s.validate(&ctx(&schema, "2024-01-01")).unwrap_err();
            assert!(matches!(err, SpecError::InvalidClause { .. }), "{case}: {err:?}");
        }

        let mut ok = spec(json!({
            "columns": [{"sqlExpression": "UPPER( country ) -- loud", "label": "c"}],
            "metrics": [{"expressionType": "SQL", "sqlExpression": "SUM( num )", "label": "s"}]
        }));
        ok.validate(&ctx(&schema, "2024-01-01")).unwrap();
        assert_eq!(
            ok.columns[0],
            ColumnRef::Adhoc(AdhocColumn {
                sql_expression: "UPPER(country) /* loud */".into(),
                label: Some("c".into()),
            })
        );
        assert_eq!(ok.metric_labels(), vec!["s"]);
    }

    #[test]
    fn test_filters_split_and_temporal_range() {
        let schema = schema();
        let mut s = spec(json!({
            "metrics": ["sum__num"],
            "filters": [
                {"col": "country", "op": "==", "val": ["fr", "us"]},
                {"col": "state", "op": "==", "val": "CA"},
                {"col": "ds", "op": "TEMPORAL_RANGE", "val": "Last day"}
            ],
            "row_limit": 1_000_000
        }));
        s.validate(&ctx(&schema, "2024-03-15 10:00:00")).unwrap();

        assert_eq!(s.filters.len(), 1);
        assert_eq!(s.filters[0].op, FilterOp::In);
        assert_eq!(s.time_range.as_deref(), Some("Last day"));
        assert_eq!(s.granularity.as_deref(), Some("ds"));
        assert_eq!(s.from_dttm, parse_datetime("2024-03-14"));
        assert_eq!(s.row_limit, Some(50_000));
        assert_eq!(
            s.applied_filters,
            vec![FilterSummary::applied("country"), FilterSummary::applied(TIME_RANGE_COLUMN)]
        );
        assert_eq!(
            s.rejected_filters,
            vec![FilterSummary::rejected("state", "not_in_datasource")]
        );
    }

    #[test]
    fn test_time_range_rejected_without_temporal_column() {
        let table = Table::from_columns(vec![("num", vec![Value::Int64(1)])]).unwrap();
        let mut schema = Schema::infer("t", &table);
        schema.metrics.insert("sum__num".into(), "SUM(num)".into());
        let mut s = spec(json!({"metrics": ["sum__num"], "time_range": "Last week"}));
        s.validate(&ctx(&schema, "2024-01-01")).unwrap();
        assert_eq!(s.from_dttm, None);
        assert_eq!(
            s.rejected_filters,
            vec![FilterSummary::rejected(TIME_RANGE_COLUMN, "no_temporal_column")]
        );
    }

    #[test]
    fn test_time_shift_moves_bounds() {
        let schema = schema();
        let mut s = spec(json!({
            "metrics": ["sum__num"],
            "time_range": "2024-01-10 : 2024-01-20",
            "time_shift": "1 week ago"
        }));
        s.validate(&ctx(&schema, "2024-03-01")).unwrap();
        assert_eq!(s.from_dttm, parse_datetime("2024-01-03"));
        assert_eq!(s.to_dttm, parse_datetime("2024-01-13"));
    }

    #[test]
    fn test_totals_injection_changes_key() {
        let schema = schema();
        let mut s = spec(json!({"columns": ["country"], "metrics": ["sum__num"]}));
        s.post_processing
            .push(PostProcessingOp::Contribution(ContributionOptions::default()));
        s.validate(&ctx(&schema, "2024-01-01")).unwrap();
        assert!(s.needs_totals());
        let before = s.cache_key(&[]).unwrap();

        s.inject_totals(&BTreeMap::from([("sum__num".to_string(), 42.0)]));
        assert!(!s.needs_totals());
        assert_ne!(s.cache_key(&[]).unwrap(), before);
    }

    #[test]
    fn test_samples_select_raw_columns() {
        let schema = schema();
        let source = spec(json!({
            "columns": ["country"],
            "metrics": ["sum__num"],
            "is_timeseries": true,
            "granularity": "ds",
            "filters": [{"col": "country", "op": "==", "val": "fr"}],
            "extras": {"having": "SUM(num) > 1"},
            "row_limit": 10
        }));
        let mut samples = source.samples(&schema, 1_000);
        samples.validate(&ctx(&schema, "2024-01-01")).unwrap();
        assert_eq!(samples.column_labels(), vec!["ds", "country", "num"]);
        assert!(samples.metrics.is_empty());
        assert_eq!(samples.row_limit, Some(1_000));
        assert_eq!(samples.filters.len(), 1);
        assert!(samples.extra_clause("having").is_none());

        let mut full = source.clone();
        full.validate(&ctx(&schema, "2024-01-01")).unwrap();
        assert_ne!(samples.cache_key(&[]).unwrap(), full.cache_key(&[]).unwrap());
    }

    #[test]
    fn test_labels() {
        let mut s = spec(json!({
            "columns": ["country", "ds"],
            "metrics": ["sum__num", {"expressionType": "SQL", "sqlExpression": "COUNT(*)", "label": "n"}],
            "is_timeseries": true,
            "granularity": "ds"
        }));
        s.validate(&ctx(&schema(), "2024-01-01")).unwrap();
        assert_eq!(s.column_labels(), vec!["ds", "country"]);
        assert_eq!(s.metric_labels(), vec!["sum__num", "n"]);
        assert!(!s.is_totals_query());
    }
}
