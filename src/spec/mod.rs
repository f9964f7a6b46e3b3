//! Query specifications: what a chart asks for, how it is validated and how
//! it is fingerprinted for caching.

pub mod column;
pub mod factory;
pub mod filter;
pub mod post_processing;
pub mod query_spec;
pub mod sanitize;
pub mod time;

pub use column::{AdhocColumn, AdhocMetric, ColumnRef, MetricColumn, MetricRef, OrderBy, OrderTarget};
pub use factory::{ChartDataRequest, QueryContextFactory};
pub use filter::{FilterClause, FilterOp, FilterSummary};
pub use post_processing::{apply_all, ContributionOptions, Orientation, PostProcessingError, PostProcessingOp};
pub use query_spec::{QuerySpec, SpecError, ValidationContext, TIME_RANGE_COLUMN};
pub use sanitize::{sanitize_clause, sanitize_expression, ClauseError};
pub use time::{
    resolve_time_range, Clock, FixedClock, RelativeDelta, ShiftedWindow, SystemClock, TimeGrain, TimeOffset,
    TimeParseError,
};
