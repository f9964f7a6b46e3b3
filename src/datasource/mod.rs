//! Datasources the executor compiles queries against.

pub mod memory;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::{DataType, Table};
use crate::sql::SqlError;

pub use memory::MemoryDatasource;

/// Opaque datasource identity as sent by clients: `{"id": .., "type": ..}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasourceRef {
    pub id: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "table".to_string()
}

impl DatasourceRef {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn table(id: &str) -> Self {
        Self::new(id, "table")
    }
}

impl std::fmt::Display for DatasourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}__{}", self.id, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    pub is_dttm: bool,
}

/// Columns, saved metrics and default temporal column of a datasource
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Schema {
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
    /// Saved metric name -> SQL aggregate expression
    pub metrics: BTreeMap<String, String>,
    pub main_dttm_col: Option<String>,
}

impl Schema {
    /// Derive a schema from the column types of a table
    pub fn infer(table_name: &str, table: &Table) -> Self {
        let columns: Vec<ColumnSchema> = table
            .columns
            .iter()
            .zip(table.coltypes())
            .map(|(name, data_type)| ColumnSchema {
                name: name.clone(),
                is_dttm: data_type.is_temporal(),
                data_type,
            })
            .collect();
        let main_dttm_col = columns.iter().find(|c| c.is_dttm).map(|c| c.name.clone());
        Self {
            table_name: table_name.to_string(),
            columns,
            metrics: BTreeMap::new(),
            main_dttm_col,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn is_temporal(&self, name: &str) -> bool {
        self.column(name).map(|c| c.is_dttm).unwrap_or(false)
    }

    pub fn has_temporal_column(&self) -> bool {
        self.columns.iter().any(|c| c.is_dttm)
    }

    pub fn metric(&self, name: &str) -> Option<&str> {
        self.metrics.get(name).map(String::as_str)
    }
}

/// A queryable source of tabular data
#[async_trait]
pub trait Datasource: Send + Sync {
    fn reference(&self) -> &DatasourceRef;

    fn schema(&self) -> Schema;

    /// Changes whenever the underlying data changes; salts cache keys
    fn content_version(&self) -> String;

    /// Datasource-specific cache timeout in seconds
    fn cache_timeout(&self) -> Option<i64> {
        None
    }

    async fn execute(&self, sql: &str) -> Result<Table, DatasourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DatasourceError {
    #[error("Query failed: {0}")]
    Sql(#[from] SqlError),

    #[error("Datasource unavailable: {0}")]
    Unavailable(String),
}

/// Datasources addressable by reference
#[derive(Default)]
pub struct DatasourceRegistry {
    sources: DashMap<DatasourceRef, Arc<dyn Datasource>>,
}

impl DatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, datasource: Arc<dyn Datasource>) {
        self.sources.insert(datasource.reference().clone(), datasource);
    }

    pub fn get(&self, reference: &DatasourceRef) -> Option<Arc<dyn Datasource>> {
        self.sources.get(reference).map(|d| Arc::clone(&d))
    }

    pub fn remove(&self, reference: &DatasourceRef) -> Option<Arc<dyn Datasource>> {
        self.sources.remove(reference).map(|(_, d)| d)
    }

    pub fn list(&self) -> Vec<DatasourceRef> {
        let mut refs: Vec<DatasourceRef> = self.sources.iter().map(|e| e.key().clone()).collect();
        refs.sort();
        refs
    }
}
