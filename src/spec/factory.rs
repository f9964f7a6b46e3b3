use serde::Deserialize;
use std::sync::Arc;

use super::QuerySpec;
use crate::config::QueryConfig;
use crate::datasource::{DatasourceRef, DatasourceRegistry};
use crate::error::ChartDataError;
use crate::executor::{QueryContext, ResultType};

/// Chart-data request body
#[derive(Debug, Clone, Deserialize)]
pub struct ChartDataRequest {
    pub datasource: DatasourceRef,
    #[serde(default)]
    pub queries: Vec<QuerySpec>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub result_type: ResultType,
}

/// Builds query contexts from requests, filling configured defaults
pub struct QueryContextFactory {
    config: QueryConfig,
    registry: Arc<DatasourceRegistry>,
}

impl QueryContextFactory {
    pub fn new(config: QueryConfig, registry: Arc<DatasourceRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn create(&self, request: ChartDataRequest) -> Result<QueryContext, ChartDataError> {
        let datasource = self
            .registry
            .get(&request.datasource)
            .ok_or_else(|| ChartDataError::DatasourceNotFound(request.datasource.clone()))?;

        let queries = request
            .queries
            .into_iter()
            .map(|mut query| {
                if query.datasource.is_none() {
                    query.datasource = Some(request.datasource.clone());
                }
                if query.row_limit.map_or(true, |limit| limit == 0) {
                    query.row_limit = Some(self.config.default_row_limit);
                }
                query
            })
            .collect();

        Ok(QueryContext::new(datasource, queries)
            .with_force(request.force)
            .with_result_type(request.result_type))
    }
}
