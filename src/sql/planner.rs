use super::parser::{
    AggregateFunction, Filter, FilterOperator, GroupByColumn, ParsedQuery, Projection, TruncUnit,
};
use crate::data::Value;

/// Query execution plan
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Table name to query
    pub table: String,
    /// Row filters
    pub filters: Vec<FilterPlan>,
    /// Projection plan
    pub projections: Vec<ProjectionPlan>,
    /// Aggregates only referenced by HAVING / ORDER BY; computed then dropped
    pub hidden: Vec<ProjectionPlan>,
    /// Group by plan
    pub group_by: Option<GroupByPlan>,
    /// Filters over output rows
    pub having: Vec<FilterPlan>,
    /// Order by plan
    pub order_by: Vec<OrderByPlan>,
    /// Result limit
    pub limit: Option<usize>,
    /// Rows skipped before the limit
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub enum FilterPlan {
    Compare {
        column: String,
        operator: FilterOperator,
        value: Value,
    },
    InList {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    InSubquery {
        columns: Vec<String>,
        subquery: Box<QueryPlan>,
        negated: bool,
    },
}

#[derive(Debug, Clone)]
pub enum ProjectionPlan {
    /// Pass through a column value
    Column { name: String, output_name: String },
    /// Compute an aggregation
    Aggregate {
        function: AggregateFunction,
        column: Option<String>,
        output_name: String,
        /// Canonical call text, e.g. `SUM(x)`
        canonical: String,
    },
    /// Truncate a timestamp column
    DateTrunc {
        unit: TruncUnit,
        column: String,
        output_name: String,
    },
}

impl ProjectionPlan {
    pub fn output_name(&self) -> &str {
        match self {
            ProjectionPlan::Column { output_name, .. }
            | ProjectionPlan::Aggregate { output_name, .. }
            | ProjectionPlan::DateTrunc { output_name, .. } => output_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupByPlan {
    pub columns: Vec<GroupByColumnPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupByColumnPlan {
    Column(String),
    DateTrunc { unit: TruncUnit, column: String },
}

#[derive(Debug, Clone)]
pub struct OrderByPlan {
    pub column: String,
    pub descending: bool,
}

/// Create an execution plan from a parsed query
pub fn plan_query(query: ParsedQuery) -> Result<QueryPlan, PlanError> {
    let mut projections = Vec::new();

    for (idx, proj) in query.projections.iter().enumerate() {
        match proj {
            Projection::Wildcard => {
                // Expanded during execution when the schema is known
                projections.push(ProjectionPlan::Column {
                    name: "*".to_string(),
                    output_name: "*".to_string(),
                });
            }
            Projection::Column { name, alias } => {
                projections.push(ProjectionPlan::Column {
                    name: name.clone(),
                    output_name: alias.clone().unwrap_or_else(|| name.clone()),
                });
            }
            Projection::Aggregation {
                function,
                column,
                alias,
            } => {
                let canonical = function.canonical(column.as_deref());
                projections.push(ProjectionPlan::Aggregate {
                    function: *function,
                    column: column.clone(),
                    output_name: alias.clone().unwrap_or_else(|| canonical.clone()),
                    canonical,
                });
            }
            Projection::DateTrunc {
                unit,
                column,
                alias,
            } => {
                projections.push(ProjectionPlan::DateTrunc {
                    unit: *unit,
                    column: column.clone(),
                    output_name: alias.clone().unwrap_or_else(|| format!("date_trunc_{}", idx)),
                });
            }
        }
    }

    let group_by = if query.group_by.is_empty() {
        None
    } else {
        let columns = query
            .group_by
            .iter()
            .map(|gb| match gb {
                GroupByColumn::Column(name) => GroupByColumnPlan::Column(name.clone()),
                GroupByColumn::DateTrunc { unit, column } => GroupByColumnPlan::DateTrunc {
                    unit: *unit,
                    column: column.clone(),
                },
            })
            .collect();
        Some(GroupByPlan { columns })
    };

    let is_aggregation = group_by.is_some()
        || projections
            .iter()
            .any(|p| matches!(p, ProjectionPlan::Aggregate { .. }));

    if is_aggregation {
        for proj in &projections {
            if matches!(proj, ProjectionPlan::Aggregate { .. }) {
                continue;
            }
            if group_position(proj, group_by.as_ref()).is_none() {
                return Err(PlanError::NotGrouped(proj.output_name().to_string()));
            }
        }
    } else if !query.having.is_empty() || !query.aggregate_refs.is_empty() {
        return Err(PlanError::HavingWithoutAggregation);
    }

    let hidden = query
        .aggregate_refs
        .iter()
        .filter_map(|agg| {
            let canonical = agg.function.canonical(agg.column.as_deref());
            let projected = projections.iter().any(|p| {
                matches!(p, ProjectionPlan::Aggregate { canonical: c, .. } if *c == canonical)
            });
            (!projected).then(|| ProjectionPlan::Aggregate {
                function: agg.function,
                column: agg.column.clone(),
                output_name: canonical.clone(),
                canonical,
            })
        })
        .collect();

    let order_by = query
        .order_by
        .iter()
        .map(|ob| OrderByPlan {
            column: ob.column.clone(),
            descending: ob.descending,
        })
        .collect();

    Ok(QueryPlan {
        table: query.table,
        filters: plan_filters(query.filters)?,
        projections,
        hidden,
        group_by,
        having: plan_filters(query.having)?,
        order_by,
        limit: query.limit,
        offset: query.offset.unwrap_or(0),
    })
}

fn plan_filters(filters: Vec<Filter>) -> Result<Vec<FilterPlan>, PlanError> {
    filters
        .into_iter()
        .map(|filter| {
            Ok(match filter {
                Filter::Compare {
                    column,
                    operator,
                    value,
                } => FilterPlan::Compare {
                    column,
                    operator,
                    value,
                },
                Filter::InList {
                    column,
                    values,
                    negated,
                } => FilterPlan::InList {
                    column,
                    values,
                    negated,
                },
                Filter::IsNull { column, negated } => FilterPlan::IsNull { column, negated },
                Filter::InSubquery {
                    columns,
                    subquery,
                    negated,
                } => {
                    let subquery = plan_query(*subquery)?;
                    let width = subquery.projections.len();
                    if width != columns.len() || subquery.projections.iter().any(|p| p.output_name() == "*") {
                        return Err(PlanError::SubqueryWidth {
                            expected: columns.len(),
                            actual: width,
                        });
                    }
                    FilterPlan::InSubquery {
                        columns,
                        subquery: Box::new(subquery),
                        negated,
                    }
                }
            })
        })
        .collect()
}

/// Position of a non-aggregate projection within the GROUP BY key
pub fn group_position(proj: &ProjectionPlan, group_by: Option<&GroupByPlan>) -> Option<usize> {
    let group_by = group_by?;
    let wanted = match proj {
        ProjectionPlan::Column { name, .. } => GroupByColumnPlan::Column(name.clone()),
        ProjectionPlan::DateTrunc { unit, column, .. } => GroupByColumnPlan::DateTrunc {
            unit: *unit,
            column: column.clone(),
        },
        ProjectionPlan::Aggregate { .. } => return None,
    };
    group_by.columns.iter().position(|c| *c == wanted)
}

/// Check if the plan aggregates rows
pub fn is_aggregation(plan: &QueryPlan) -> bool {
    plan.group_by.is_some()
        || plan
            .projections
            .iter()
            .any(|p| matches!(p, ProjectionPlan::Aggregate { .. }))
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Column '{0}' must appear in GROUP BY or be aggregated")]
    NotGrouped(String),

    #[error("HAVING and aggregate ordering require an aggregation")]
    HavingWithoutAggregation,

    #[error("Subquery returns {actual} columns, expected {expected}")]
    SubqueryWidth { expected: usize, actual: usize },
}
