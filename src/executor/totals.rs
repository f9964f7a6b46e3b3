//! Grand totals shared between queries of one context.

use crate::spec::QuerySpec;

/// First query computing grand totals: metrics only, no dimensions, no post-processing
pub fn find_totals_spec(specs: &[QuerySpec]) -> Option<usize> {
    specs.iter().position(QuerySpec::is_totals_query)
}

/// Queries whose contribution step waits on totals
pub fn dependents(specs: &[QuerySpec]) -> Vec<usize> {
    specs
        .iter()
        .enumerate()
        .filter(|(_, spec)| spec.needs_totals())
        .map(|(idx, _)| idx)
        .collect()
}
