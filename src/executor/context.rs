use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::datasource::Datasource;
use crate::spec::QuerySpec;

/// What a request wants back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// Execute and return data
    #[default]
    Full,
    /// Compile only and return the SQL text
    Query,
    /// Raw rows of every physical column under the same filters
    Samples,
    /// Execute and return data without query metadata
    Results,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Full => "full",
            ResultType::Query => "query",
            ResultType::Samples => "samples",
            ResultType::Results => "results",
        }
    }
}

/// One datasource plus the queries to run against it
pub struct QueryContext {
    pub datasource: Arc<dyn Datasource>,
    pub queries: Vec<QuerySpec>,
    /// Bypass cache reads
    pub force: bool,
    pub result_type: ResultType,
    /// Salts cache keys when results are per-user
    pub actor: Option<String>,
    /// Row-level-security clauses ANDed into every query
    pub rls: Vec<String>,
    pub cancel: CancellationToken,
}

impl QueryContext {
    pub fn new(datasource: Arc<dyn Datasource>, queries: Vec<QuerySpec>) -> Self {
        Self {
            datasource,
            queries,
            force: false,
            result_type: ResultType::Full,
            actor: None,
            rls: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_result_type(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn with_rls(mut self, clauses: Vec<String>) -> Self {
        self.rls = clauses;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn rls_signature(&self) -> String {
        self.rls.join(" AND ")
    }

    /// Cache key salts: content version, RLS signature and the actor if set
    pub fn salts(&self) -> Vec<(&'static str, String)> {
        let mut salts = vec![
            ("content_version", self.datasource.content_version()),
            ("rls", self.rls_signature()),
        ];
        if let Some(actor) = &self.actor {
            salts.push(("actor", actor.clone()));
        }
        salts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Table;
    use crate::datasource::{DatasourceRef, MemoryDatasource};

    #[test]
    fn test_salts() {
        let ds = Arc::new(MemoryDatasource::new(DatasourceRef::table("1"), "t", Table::empty()));
        let ctx = QueryContext::new(ds.clone(), Vec::new());
        assert_eq!(ctx.salts().len(), 2);

        let ctx = QueryContext::new(ds, Vec::new())
            .with_actor("alice")
            .with_rls(vec!["org = 1".into(), "team = 2".into()]);
        let salts = ctx.salts();
        assert_eq!(salts[1], ("rls", "org = 1 AND team = 2".to_string()));
        assert_eq!(salts[2], ("actor", "alice".to_string()));
    }

    #[test]
    fn test_result_type_names() {
        for name in ["full", "query", "samples", "results"] {
            let parsed: ResultType = serde_json::from_value(serde_json::json!(name)).unwrap();
            assert_eq!(parsed.as_str(), name);
        }
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("queries", &self.queries)
            .field("force", &self.force)
            .field("result_type", &self.result_type)
            .field("actor", &self.actor)
            .field("rls", &self.rls)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}
