//! chartq command line
//!
//! Run with: cargo run -- request.json   (or pipe the request on stdin)
//!
//! Environment variables:
//! - CHARTQ_CACHE_MEMORY_MB: Result cache budget in MB (default: 1024)
//! - CHARTQ_CACHE_HEADROOM_MB: Extra room freed per eviction pass (default: 100)
//! - CHARTQ_CACHE_DEFAULT_TIMEOUT: Cache timeout in seconds, -1 disables (default: 86400)
//! - CHARTQ_QUERY_TIMEOUT_SECS: Datasource query deadline (default: 300)
//! - CHARTQ_SAMPLES_ROW_LIMIT: Row cap for samples requests (default: 1000)
//! - RUST_LOG: Log level (default: chartq=info)
//!
//! The request is evaluated against a built-in `birth_names` sample table
//! registered as datasource `{"id": "1", "type": "table"}`.

use chartq::cache::{MemoryBackend, ResultCache};
use chartq::compiler::AnsiSqlCompiler;
use chartq::config::EngineConfig;
use chartq::data::{parse_datetime, Table, Value};
use chartq::datasource::{DatasourceRef, DatasourceRegistry, MemoryDatasource};
use chartq::executor::QueryExecutor;
use chartq::spec::{ChartDataRequest, QueryContextFactory};
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "chartq=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = EngineConfig::from_env();
    tracing::info!("chartq configuration:");
    tracing::info!("  Cache budget: {} MB", config.cache.memory_budget_bytes / (1024 * 1024));
    tracing::info!("  Eviction headroom: {} MB", config.cache.eviction_headroom_bytes / (1024 * 1024));
    tracing::info!("  Default cache timeout: {} seconds", config.cache.default_timeout_secs);
    tracing::info!("  Query timeout: {} seconds", config.query.query_timeout_secs);

    let body = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            body
        }
    };
    let request: ChartDataRequest = serde_json::from_str(&body)?;

    let registry = Arc::new(DatasourceRegistry::new());
    registry.register(Arc::new(sample_datasource()?));

    let backend = Arc::new(MemoryBackend::new(
        config.cache.memory_budget_bytes,
        config.cache.eviction_headroom_bytes,
    ));
    let cache = Arc::new(ResultCache::new(backend, &config.cache));
    let factory = QueryContextFactory::new(config.query.clone(), registry);
    let executor = QueryExecutor::new(cache, Arc::new(AnsiSqlCompiler::new()), config);

    let ctx = factory.create(request)?;
    let payload = executor.run(ctx).await;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn sample_datasource() -> Result<MemoryDatasource, Box<dyn std::error::Error>> {
    let rows = [
        ("2019-01-15", "girl", "CA", 5),
        ("2019-02-10", "boy", "NY", 8),
        ("2019-02-12", "girl", "NY", 3),
        ("2020-01-05", "boy", "CA", 10),
        ("2020-02-20", "girl", "CA", 20),
        ("2020-02-21", "boy", "NY", 7),
    ];
    let mut ds = Vec::with_capacity(rows.len());
    let mut gender = Vec::with_capacity(rows.len());
    let mut state = Vec::with_capacity(rows.len());
    let mut num = Vec::with_capacity(rows.len());
    for (date, g, s, n) in rows {
        let dttm = parse_datetime(date).ok_or_else(|| format!("bad sample date {}", date))?;
        ds.push(Value::from_datetime(dttm));
        gender.push(Value::String(g.to_string()));
        state.push(Value::String(s.to_string()));
        num.push(Value::Int64(n));
    }
    let table = Table::from_columns(vec![("ds", ds), ("gender", gender), ("state", state), ("num", num)])?;
    Ok(
        MemoryDatasource::new(DatasourceRef::table("1"), "birth_names", table)
            .with_metric("sum__num", "SUM(num)")
            .with_metric("count", "COUNT(*)")
            .with_main_dttm_col("ds"),
    )
}
