//! Chart-data query orchestration.
//!
//! Each query moves through validated, key derived, cache checked, then
//! either a cache hit or an execution that is stored before the payload is
//! assembled. Queries fail independently; one failure never aborts the rest
//! of the context.

pub mod context;
pub mod payload;
pub mod time_offset;
pub mod totals;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{ttl_for, CachedResult, ResultCache, StorePolicy};
use crate::compiler::SqlCompiler;
use crate::config::{EngineConfig, CACHE_DISABLED_TIMEOUT};
use crate::data::Table;
use crate::datasource::Schema;
use crate::error::ChartDataError;
use crate::spec::{apply_all, Clock, QuerySpec, SystemClock, TimeOffset, ValidationContext};

pub use context::{QueryContext, ResultType};
pub use payload::{ChartDataPayload, QueryPayload};
pub use time_offset::{offset_column_name, OffsetJoin};

/// Everything known about one query once it has been processed
#[derive(Debug, Clone)]
pub struct SpecOutcome {
    pub spec: QuerySpec,
    pub cache_key: Option<String>,
    pub cache_timeout: Option<i64>,
    pub is_cached: bool,
    pub cached_at: Option<DateTime<Utc>>,
    pub query: Option<String>,
    pub table: Option<Table>,
    pub label_map: BTreeMap<String, Vec<String>>,
    pub error: Option<ChartDataError>,
    /// Problems reported at context level, e.g. a comparison window that failed
    pub context_errors: Vec<String>,
}

impl SpecOutcome {
    fn new(spec: QuerySpec) -> Self {
        Self {
            spec,
            cache_key: None,
            cache_timeout: None,
            is_cached: false,
            cached_at: None,
            query: None,
            table: None,
            label_map: BTreeMap::new(),
            error: None,
            context_errors: Vec::new(),
        }
    }

    fn fail(mut self, error: ChartDataError) -> Self {
        debug!(state = "failed", error = %error, "Query failed");
        if self.query.is_none() {
            self.query = error.sql().map(str::to_string);
        }
        self.error = Some(error);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_payload(self) -> QueryPayload {
        let mut payload = match &self.error {
            Some(error) => QueryPayload::failed(error),
            None => match &self.table {
                Some(table) => QueryPayload::succeeded().with_table(table),
                None => QueryPayload::succeeded(),
            },
        };
        payload.cache_key = self.cache_key;
        payload.cache_timeout = self.cache_timeout;
        payload.is_cached = self.is_cached;
        payload.cached_dttm = self.cached_at.filter(|_| self.is_cached).map(payload::format_dttm);
        if self.query.is_some() {
            payload.query = self.query;
        }
        payload.label_map = self.label_map;
        payload.applied_filters = self.spec.applied_filters;
        payload.rejected_filters = self.spec.rejected_filters;
        payload
    }
}

struct Fetched {
    result: Arc<CachedResult>,
    is_cached: bool,
}

struct FetchFailure {
    error: ChartDataError,
    sql: Option<String>,
}

impl From<ChartDataError> for FetchFailure {
    fn from(error: ChartDataError) -> Self {
        Self { error, sql: None }
    }
}

/// Runs query contexts through the result cache
pub struct QueryExecutor {
    cache: Arc<ResultCache>,
    compiler: Arc<dyn SqlCompiler>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl QueryExecutor {
    pub fn new(cache: Arc<ResultCache>, compiler: Arc<dyn SqlCompiler>, config: EngineConfig) -> Self {
        Self {
            cache,
            compiler,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Run the totals query, when some query's contribution step needs it,
    /// and inject its sums into those queries before any of them is keyed.
    ///
    /// Returns the outcomes of queries already run, by position.
    pub async fn prepare_cross_spec_dependencies(&self, ctx: &mut QueryContext) -> BTreeMap<usize, SpecOutcome> {
        let mut done = BTreeMap::new();
        if ctx.result_type == ResultType::Samples {
            return done;
        }
        let dependents = totals::dependents(&ctx.queries);
        if dependents.is_empty() {
            return done;
        }
        let Some(idx) = totals::find_totals_spec(&ctx.queries) else {
            debug!("No totals query in context; contributions use per-result sums");
            return done;
        };

        ctx.queries[idx].row_limit = None;
        let outcome = self.run_spec(ctx, ctx.queries[idx].clone()).await;
        match (&outcome.error, &outcome.table) {
            (None, Some(table)) => {
                let sums = table.sum_numeric_columns();
                debug!(totals = ?sums, dependents = dependents.len(), "Injecting totals");
                for dependent in dependents {
                    ctx.queries[dependent].inject_totals(&sums);
                }
            }
            _ => warn!("Totals query failed; contributions use per-result sums"),
        }
        done.insert(idx, outcome);
        done
    }

    /// Process every query of the context, preserving input order
    pub async fn run(&self, mut ctx: QueryContext) -> ChartDataPayload {
        let mut done = self.prepare_cross_spec_dependencies(&mut ctx).await;

        let mut outcomes = Vec::with_capacity(ctx.queries.len());
        for (idx, spec) in ctx.queries.iter().enumerate() {
            let outcome = match done.remove(&idx) {
                Some(outcome) => outcome,
                None => self.run_spec(&ctx, spec.clone()).await,
            };
            outcomes.push(outcome);
        }

        let cache_key = context_key(&ctx, &outcomes);
        let errors = outcomes
            .iter()
            .flat_map(|o| o.context_errors.iter().cloned())
            .collect();
        let results_only = ctx.result_type == ResultType::Results;
        let payload = ChartDataPayload {
            queries: outcomes
                .into_iter()
                .map(SpecOutcome::into_payload)
                .map(|query| if results_only { query.into_results() } else { query })
                .collect(),
            cache_key: cache_key.filter(|_| !results_only),
            errors,
        };

        if let Some(key) = &payload.cache_key {
            if ctx.result_type == ResultType::Full && !self.config.cache.is_disabled() {
                match serde_json::to_value(&payload) {
                    Ok(value) => self.cache.set_context(key, value),
                    Err(e) => warn!(error = %e, "Failed to serialize payload for the context cache"),
                }
            }
        }
        payload
    }

    /// Previously materialised context payload
    pub fn cached_payload(&self, key: &str) -> Option<Arc<serde_json::Value>> {
        self.cache.get_context(key)
    }

    /// Validate, key, fetch and post-process one query
    pub async fn run_spec(&self, ctx: &QueryContext, mut spec: QuerySpec) -> SpecOutcome {
        let schema = ctx.datasource.schema();
        if ctx.result_type == ResultType::Samples {
            spec = spec.samples(&schema, self.config.query.samples_row_limit);
        }
        let validation = ValidationContext {
            schema: &schema,
            max_row_limit: self.config.query.max_row_limit,
            now: self.clock.now(),
        };
        if let Err(e) = spec.validate(&validation) {
            return SpecOutcome::new(spec).fail(e.into());
        }
        debug!(state = "validated", datasource = %ctx.datasource.reference(), "Query validated");

        let salts = ctx.salts();
        let key = match spec.cache_key(&salt_refs(&salts)) {
            Ok(key) => key,
            Err(e) => return SpecOutcome::new(spec).fail(e.into()),
        };
        debug!(state = "key_derived", key = %key, "Derived cache key");

        let timeout = self.config.cache.effective_timeout(ctx.datasource.cache_timeout());
        let mut outcome = SpecOutcome::new(spec);
        outcome.cache_key = Some(key.clone());
        outcome.cache_timeout = Some(timeout);

        if ctx.result_type == ResultType::Query {
            return match self.compiler.compile(&outcome.spec, &schema, &ctx.rls) {
                Ok(compiled) => {
                    outcome.query = Some(compiled.sql);
                    outcome
                }
                Err(e) => outcome.fail(e.into()),
            };
        }

        let fetched = match self.fetch(ctx, &outcome.spec, &schema, &key, timeout).await {
            Ok(fetched) => fetched,
            Err(failure) => {
                outcome.query = failure.sql;
                return outcome.fail(failure.error);
            }
        };
        outcome.is_cached = fetched.is_cached;
        outcome.cached_at = Some(fetched.result.created_at);
        outcome.query = Some(fetched.result.query.clone());

        let mut table = fetched.result.table.clone();
        if !outcome.spec.time_offsets.is_empty() {
            table = self
                .join_time_offsets(ctx, &outcome.spec, &schema, table, timeout, &mut outcome.context_errors)
                .await;
        }
        let table = match apply_all(table, &outcome.spec.post_processing) {
            Ok(table) => table,
            Err(e) => return outcome.fail(ChartDataError::Execution(format!("Post-processing failed: {}", e))),
        };

        outcome.label_map = label_map(&table, &outcome.spec);
        outcome.table = Some(table);
        debug!(state = "payload_ready", key = %key, cached = outcome.is_cached, "Query done");
        outcome
    }

    async fn fetch(
        &self,
        ctx: &QueryContext,
        spec: &QuerySpec,
        schema: &Schema,
        key: &str,
        timeout: i64,
    ) -> Result<Fetched, FetchFailure> {
        let disabled = timeout == CACHE_DISABLED_TIMEOUT;
        if !ctx.force && !disabled {
            if let Some(hit) = self.cache.get(key).await {
                debug!(state = "cache_hit", key, "Serving cached result");
                return Ok(Fetched {
                    result: hit,
                    is_cached: true,
                });
            }
        }

        debug!(state = "executing", key, force = ctx.force, "Cache miss");
        let compiled = self.compiler.compile(spec, schema, &ctx.rls).map_err(ChartDataError::from)?;
        let sql = compiled.sql.clone();

        let datasource = ctx.datasource.clone();
        let deadline = Duration::from_secs(self.config.query.query_timeout_secs);
        let owned_key = key.to_string();
        let compute = async move {
            let start = std::time::Instant::now();
            let table = match tokio::time::timeout(deadline, datasource.execute(&compiled.sql)).await {
                Ok(result) => result?,
                Err(_) => return Err(ChartDataError::Timeout(deadline.as_secs())),
            };
            let table = relabel(table, &compiled.expected_labels)?;
            info!(
                datasource = %datasource.reference(),
                key = %owned_key,
                rows = table.row_count(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Executed query"
            );
            Ok::<_, ChartDataError>(Arc::new(CachedResult::new(&owned_key, table, &compiled.sql)))
        };

        let policy = if disabled {
            StorePolicy::Skip
        } else {
            StorePolicy::Ttl(ttl_for(timeout))
        };
        // Cancellation only stops this caller from waiting; others sharing the execution keep it
        let (result, leader) = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => (Err(ChartDataError::Cancelled), false),
            outcome = self.cache.coalesce(key, policy, compute) => outcome,
        };
        let result = result.map_err(|error| FetchFailure {
            error,
            sql: Some(sql),
        })?;
        debug!(state = "stored", key, leader, size_bytes = result.size_bytes, "Result ready");
        Ok(Fetched {
            result,
            is_cached: false,
        })
    }

    async fn join_time_offsets(
        &self,
        ctx: &QueryContext,
        spec: &QuerySpec,
        schema: &Schema,
        primary: Table,
        timeout: i64,
        errors: &mut Vec<String>,
    ) -> Table {
        let time_column = if spec.is_timeseries {
            spec.granularity.as_deref()
        } else {
            None
        };
        let dimensions: Vec<String> = spec
            .column_labels()
            .into_iter()
            .filter(|label| Some(label.as_str()) != time_column)
            .collect();
        let metrics = spec.metric_labels();
        let join = OffsetJoin {
            dimensions: &dimensions,
            time_column,
            grain: spec.time_grain().ok().flatten(),
            metrics: &metrics,
        };
        let salts = ctx.salts();

        let mut table = primary;
        for label in &spec.time_offsets {
            let window = match TimeOffset::parse(label).and_then(|offset| offset.shifted_window(spec.from_dttm, spec.to_dttm)) {
                Ok(window) => window,
                Err(e) => {
                    warn!(offset = %label, error = %e, "Skipping time offset");
                    errors.push(format!("Time offset '{}' skipped: {}", label, e));
                    continue;
                }
            };
            let shifted = spec.shifted(&window);
            let key = match shifted.cache_key(&salt_refs(&salts)) {
                Ok(key) => key,
                Err(e) => {
                    errors.push(format!("Time offset '{}' skipped: {}", label, e));
                    continue;
                }
            };
            let fetched = match self.fetch(ctx, &shifted, schema, &key, timeout).await {
                Ok(fetched) => fetched,
                Err(failure) => {
                    warn!(offset = %label, error = %failure.error, "Time offset query failed");
                    errors.push(format!("Time offset '{}' failed: {}", label, failure.error));
                    continue;
                }
            };
            match join.join(&table, &fetched.result.table, window.realign, label) {
                Ok(joined) => table = joined,
                Err(e) => errors.push(format!("Time offset '{}' could not be joined: {}", label, e)),
            }
        }
        table
    }
}

fn salt_refs<'a>(salts: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
    salts.iter().map(|(k, v)| (*k, v.as_str())).collect()
}

/// Rename result columns positionally to the labels the query asked for
fn relabel(mut table: Table, expected: &[String]) -> Result<Table, ChartDataError> {
    if table.columns == expected {
        return Ok(table);
    }
    if table.columns.len() != expected.len() {
        return Err(ChartDataError::Execution(format!(
            "Expected columns {:?}, datasource returned {:?}",
            expected, table.columns
        )));
    }
    table
        .set_column_names(expected.to_vec())
        .map_err(|e| ChartDataError::Execution(e.to_string()))?;
    Ok(table)
}

/// Result column -> requested identifiers; offset columns map to `[metric, offset]`
fn label_map(table: &Table, spec: &QuerySpec) -> BTreeMap<String, Vec<String>> {
    let metrics = spec.metric_labels();
    table
        .columns
        .iter()
        .map(|column| {
            let ids = metrics
                .iter()
                .flat_map(|metric| spec.time_offsets.iter().map(move |offset| (metric, offset)))
                .find(|(metric, offset)| offset_column_name(metric, offset) == *column)
                .map(|(metric, offset)| vec![metric.clone(), offset.clone()])
                .unwrap_or_else(|| vec![column.clone()]);
            (column.clone(), ids)
        })
        .collect()
}

/// Key for the whole request, when every query produced one
fn context_key(ctx: &QueryContext, outcomes: &[SpecOutcome]) -> Option<String> {
    let keys: Option<Vec<&str>> = outcomes.iter().map(|o| o.cache_key.as_deref()).collect();
    let keys = keys?;
    if keys.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(ctx.datasource.reference().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(ctx.result_type.as_str().as_bytes());
    for key in keys {
        hasher.update(b"|");
        hasher.update(key.as_bytes());
    }
    let digest = hasher.finalize();
    Some(digest[..16].iter().map(|b| format!("{:02x}", b)).collect())
}
