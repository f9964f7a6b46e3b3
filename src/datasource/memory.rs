use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{Datasource, DatasourceError, DatasourceRef, Schema};
use crate::data::Table;
use crate::sql::run_sql;

/// Datasource over one in-memory table, queried through the `sql` engine
pub struct MemoryDatasource {
    reference: DatasourceRef,
    table_name: String,
    tables: RwLock<HashMap<String, Table>>,
    metrics: BTreeMap<String, String>,
    main_dttm_col: Option<String>,
    cache_timeout: Option<i64>,
    latency: Option<Duration>,
    version: AtomicU64,
    executions: AtomicU64,
}

impl MemoryDatasource {
    pub fn new(reference: DatasourceRef, table_name: &str, table: Table) -> Self {
        Self {
            reference,
            table_name: table_name.to_string(),
            tables: RwLock::new(HashMap::from([(table_name.to_string(), table)])),
            metrics: BTreeMap::new(),
            main_dttm_col: None,
            cache_timeout: None,
            latency: None,
            version: AtomicU64::new(1),
            executions: AtomicU64::new(0),
        }
    }

    /// Register a saved metric
    pub fn with_metric(mut self, name: &str, expression: &str) -> Self {
        self.metrics.insert(name.to_string(), expression.to_string());
        self
    }

    pub fn with_main_dttm_col(mut self, column: &str) -> Self {
        self.main_dttm_col = Some(column.to_string());
        self
    }

    pub fn with_cache_timeout(mut self, secs: i64) -> Self {
        self.cache_timeout = Some(secs);
        self
    }

    /// Simulated query latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Swap the data; bumps the content version
    pub fn replace_data(&self, table: Table) {
        self.tables.write().insert(self.table_name.clone(), table);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of queries executed so far
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Datasource for MemoryDatasource {
    fn reference(&self) -> &DatasourceRef {
        &self.reference
    }

    fn schema(&self) -> Schema {
        let tables = self.tables.read();
        let mut schema = match tables.get(&self.table_name) {
            Some(table) => Schema::infer(&self.table_name, table),
            None => Schema {
                table_name: self.table_name.clone(),
                ..Default::default()
            },
        };
        schema.metrics = self.metrics.clone();
        if self.main_dttm_col.is_some() {
            schema.main_dttm_col = self.main_dttm_col.clone();
        }
        schema
    }

    fn content_version(&self) -> String {
        format!("{}:{}", self.reference, self.version.load(Ordering::SeqCst))
    }

    fn cache_timeout(&self) -> Option<i64> {
        self.cache_timeout
    }

    async fn execute(&self, sql: &str) -> Result<Table, DatasourceError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let result = {
            let tables = self.tables.read();
            run_sql(&tables, sql)?
        };
        debug!(
            datasource = %self.reference,
            rows = result.row_count(),
            rows_scanned = result.rows_scanned,
            elapsed_ms = result.execution_time_ms,
            "Executed query"
        );
        Ok(result.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    fn datasource() -> MemoryDatasource {
        let table = Table::from_columns(vec![
            ("country", vec![Value::String("fr".into()), Value::String("us".into())]),
            ("num", vec![Value::Int64(2), Value::Int64(5)]),
        ])
        .unwrap();
        MemoryDatasource::new(DatasourceRef::table("1"), "births", table)
            .with_metric("sum__num", "SUM(num)")
    }

    #[tokio::test]
    async fn test_execute_counts() {
        let ds = datasource();
        let table = ds.execute(r#"SELECT SUM("num") AS "sum__num" FROM "births""#).await.unwrap();
        assert_eq!(table.rows, vec![vec![Value::Int64(7)]]);
        assert_eq!(ds.execution_count(), 1);
        assert_eq!(ds.schema().metric("sum__num"), Some("SUM(num)"));
    }

    #[tokio::test]
    async fn test_bad_sql_is_an_error() {
        let ds = datasource();
        assert!(ds.execute("SELECT nope FROM births").await.is_err());
        assert!(ds.execute("DELETE FROM births").await.is_err());
    }

    #[test]
    fn test_replace_data_bumps_version() {
        let ds = datasource();
        let before = ds.content_version();
        ds.replace_data(Table::empty());
        assert_ne!(ds.content_version(), before);
    }
}
