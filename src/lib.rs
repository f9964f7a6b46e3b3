//! chartq: chart-data query engine
//!
//! Turns declarative chart queries into SQL, runs them against a datasource
//! and serves repeated requests from a memory-bounded result cache.
//!
//! # Features
//!
//! - **Query specs**: validation, filter normalisation, relative time ranges
//! - **Cache keys**: deterministic fingerprints salted with content version and RLS
//! - **Result cache**: byte budget with largest-first eviction and request coalescing
//! - **Totals prefetch**: contribution denominators computed once per context
//! - **Time comparison**: offset queries realigned and joined onto the primary result
//! - **SQL engine**: in-memory SELECT/WHERE/GROUP BY/HAVING/ORDER BY/LIMIT
//!
//! # Example
//!
//! ```no_run
//! use chartq::cache::{MemoryBackend, ResultCache};
//! use chartq::compiler::AnsiSqlCompiler;
//! use chartq::config::EngineConfig;
//! use chartq::data::{Table, Value};
//! use chartq::datasource::{DatasourceRef, MemoryDatasource};
//! use chartq::executor::{QueryContext, QueryExecutor};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let config = EngineConfig::default();
//! let backend = Arc::new(MemoryBackend::new(
//!     config.cache.memory_budget_bytes,
//!     config.cache.eviction_headroom_bytes,
//! ));
//! let cache = Arc::new(ResultCache::new(backend, &config.cache));
//! let executor = QueryExecutor::new(cache, Arc::new(AnsiSqlCompiler::new()), config);
//!
//! let table = Table::from_columns(vec![("num", vec![Value::Int64(3)])]).unwrap();
//! let datasource = Arc::new(
//!     MemoryDatasource::new(DatasourceRef::table("1"), "births", table).with_metric("count", "COUNT(*)"),
//! );
//! let queries = serde_json::from_str(r#"[{"metrics": ["count"]}]"#).unwrap();
//!
//! let payload = executor.run(QueryContext::new(datasource, queries)).await;
//! println!("{}", serde_json::to_string_pretty(&payload).unwrap());
//! # }
//! ```

pub mod cache;
pub mod compiler;
pub mod config;
pub mod data;
pub mod datasource;
pub mod error;
pub mod executor;
pub mod spec;
pub mod sql;

// Re-export commonly used types
pub use cache::{CacheBackend, MemoryBackend, ResultCache};
pub use config::EngineConfig;
pub use data::{Table, Value};
pub use error::ChartDataError;
pub use executor::{ChartDataPayload, QueryContext, QueryExecutor, QueryPayload};
pub use spec::{ChartDataRequest, QueryContextFactory, QuerySpec};
