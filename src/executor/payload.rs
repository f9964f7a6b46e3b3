use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cache::QueryStatus;
use crate::data::{GenericDataType, Table};
use crate::error::ChartDataError;
use crate::spec::FilterSummary;

/// Response entry for one query
#[derive(Debug, Clone, Serialize)]
pub struct QueryPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_dttm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_timeout: Option<i64>,
    pub is_cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub status: QueryStatus,
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub colnames: Vec<String>,
    pub coltypes: Vec<GenericDataType>,
    pub rowcount: usize,
    /// Result column -> requested dimension/metric identifiers
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub label_map: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub applied_filters: Vec<FilterSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected_filters: Vec<FilterSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<&'static str>,
}

impl QueryPayload {
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub(crate) fn succeeded() -> Self {
        Self {
            cache_key: None,
            cached_dttm: None,
            cache_timeout: None,
            is_cached: false,
            query: None,
            status: QueryStatus::Success,
            data: Vec::new(),
            colnames: Vec::new(),
            coltypes: Vec::new(),
            rowcount: 0,
            label_map: BTreeMap::new(),
            applied_filters: Vec::new(),
            rejected_filters: Vec::new(),
            error: None,
            error_type: None,
        }
    }

    pub(crate) fn failed(error: &ChartDataError) -> Self {
        Self {
            query: error.sql().map(str::to_string),
            status: QueryStatus::Failed,
            error: Some(error.to_string()),
            error_type: Some(error.error_type()),
            ..Self::succeeded()
        }
    }

    /// Keep the data and status, drop the SQL, cache provenance and filter reports
    pub fn into_results(self) -> Self {
        Self {
            cache_key: None,
            cached_dttm: None,
            cache_timeout: None,
            is_cached: false,
            query: None,
            label_map: BTreeMap::new(),
            applied_filters: Vec::new(),
            rejected_filters: Vec::new(),
            ..self
        }
    }

    pub(crate) fn with_table(mut self, table: &Table) -> Self {
        self.data = table.to_records();
        self.colnames = table.columns.clone();
        self.coltypes = table.coltypes().iter().map(|t| t.generic()).collect();
        self.rowcount = table.row_count();
        self
    }
}

pub(crate) fn format_dttm(dttm: DateTime<Utc>) -> String {
    dttm.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Response for a whole request, one entry per query in input order
#[derive(Debug, Clone, Serialize)]
pub struct ChartDataPayload {
    pub queries: Vec<QueryPayload>,
    /// Key of the context-level cache entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Failures that did not fail a query, e.g. comparison windows left out
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    #[test]
    fn test_failed_payload_keeps_sql() {
        let error = ChartDataError::Compile {
            message: "bad metric".into(),
            sql: Some("SELECT".into()),
        };
        let payload = QueryPayload::failed(&error);
        assert!(!payload.is_success());
        assert_eq!(payload.query.as_deref(), Some("SELECT"));
        assert_eq!(payload.error_type, Some("COMPILE_ERROR"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[test]
    fn test_with_table() {
        let table = Table::from_columns(vec![
            ("country", vec![Value::String("fr".into())]),
            ("n", vec![Value::Int64(3)]),
        ])
        .unwrap();
        let payload = QueryPayload::succeeded().with_table(&table);
        assert!(payload.is_success());
        assert_eq!(payload.rowcount, 1);
        assert_eq!(payload.colnames, vec!["country", "n"]);
        assert_eq!(payload.coltypes, vec![GenericDataType::String, GenericDataType::Numeric]);
        assert_eq!(payload.data[0]["n"], serde_json::json!(3));
    }

    #[test]
    fn test_results_drop_query_metadata() {
        let table = Table::from_columns(vec![("n", vec![Value::Int64(3)])]).unwrap();
        let mut payload = QueryPayload::succeeded().with_table(&table);
        payload.cache_key = Some("abc".into());
        payload.cache_timeout = Some(60);
        payload.query = Some("SELECT 3 AS n".into());
        payload.label_map.insert("n".into(), vec!["n".into()]);
        payload.applied_filters.push(FilterSummary::applied("n"));

        let json = serde_json::to_value(payload.into_results()).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["colnames", "coltypes", "data", "is_cached", "rowcount", "status"]
        );
        assert_eq!(json["data"][0]["n"], serde_json::json!(3));
    }
}
