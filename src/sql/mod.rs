pub mod aggregates;
pub mod executor;
pub mod parser;
pub mod planner;

use std::collections::HashMap;

use crate::data::Table;

pub use executor::{execute_query, truncate_timestamp, ExecuteError, QueryResult};
pub use parser::{parse_query, ParseError, ParsedQuery, TruncUnit};
pub use planner::{plan_query, PlanError, QueryPlan};

/// Convenience function to parse, plan, and execute a query
pub fn run_sql(tables: &HashMap<String, Table>, sql: &str) -> Result<QueryResult, SqlError> {
    let parsed = parse_query(sql)?;
    let plan = plan_query(parsed)?;
    let result = execute_query(tables, &plan)?;
    Ok(result)
}

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Execute error: {0}")]
    Execute(#[from] ExecuteError),
}
