use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;

use super::aggregates::{create_accumulator, Accumulator};
use super::parser::{parse_timestamp_literal, FilterOperator, TruncUnit};
use super::planner::{
    group_position, is_aggregation, FilterPlan, GroupByColumnPlan, GroupByPlan, OrderByPlan,
    ProjectionPlan, QueryPlan,
};
use crate::data::{DataType, Table, Value};

/// Query execution result
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub table: Table,
    /// Number of source rows scanned
    pub rows_scanned: usize,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.table.row_count()
    }
}

/// Execute a query plan against a set of named tables
pub fn execute_query(
    tables: &HashMap<String, Table>,
    plan: &QueryPlan,
) -> Result<QueryResult, ExecuteError> {
    let start = std::time::Instant::now();

    let source = tables
        .get(&plan.table)
        .ok_or_else(|| ExecuteError::TableNotFound(plan.table.clone()))?;

    let filters = bind_filters(tables, source, &plan.filters)?;
    let projections = expand_wildcards(&plan.projections, source);

    let (columns, mut rows) = if is_aggregation(plan) {
        execute_aggregation(source, plan, &projections, &filters)?
    } else {
        execute_scan(source, &projections, &filters)?
    };

    let visible = projections.len();
    let output = Table { columns, rows: Vec::new() };

    if !plan.having.is_empty() {
        let having = bind_output_filters(&output, &plan.having, &projections, &plan.hidden)?;
        rows.retain(|row| passes_filters(row, &having));
    }

    if !plan.order_by.is_empty() {
        apply_order_by(&mut rows, &output, &plan.order_by, &projections, &plan.hidden)?;
    }

    let rows: Vec<Vec<Value>> = rows
        .into_iter()
        .skip(plan.offset)
        .take(plan.limit.unwrap_or(usize::MAX))
        .map(|mut row| {
            row.truncate(visible);
            row
        })
        .collect();

    let mut columns = output.columns;
    columns.truncate(visible);

    Ok(QueryResult {
        table: Table::new(columns, rows)?,
        rows_scanned: source.row_count(),
        execution_time_ms: start.elapsed().as_millis() as u64,
    })
}

fn expand_wildcards(projections: &[ProjectionPlan], table: &Table) -> Vec<ProjectionPlan> {
    let mut expanded = Vec::with_capacity(projections.len());
    for proj in projections {
        match proj {
            ProjectionPlan::Column { name, .. } if name == "*" => {
                expanded.extend(table.columns.iter().map(|c| ProjectionPlan::Column {
                    name: c.clone(),
                    output_name: c.clone(),
                }));
            }
            other => expanded.push(other.clone()),
        }
    }
    expanded
}

fn column_index(table: &Table, name: &str) -> Result<usize, ExecuteError> {
    table
        .column_index(name)
        .ok_or_else(|| ExecuteError::ColumnNotFound(name.to_string()))
}

fn execute_scan(
    source: &Table,
    projections: &[ProjectionPlan],
    filters: &[BoundFilter],
) -> Result<(Vec<String>, Vec<Vec<Value>>), ExecuteError> {
    let columns = projections.iter().map(|p| p.output_name().to_string()).collect();
    let getters = projections
        .iter()
        .map(|p| bind_projection(source, p))
        .collect::<Result<Vec<_>, _>>()?;

    let rows = source
        .rows
        .iter()
        .filter(|row| passes_filters(row, filters))
        .map(|row| getters.iter().map(|g| g.value(row)).collect())
        .collect();

    Ok((columns, rows))
}

fn execute_aggregation(
    source: &Table,
    plan: &QueryPlan,
    projections: &[ProjectionPlan],
    filters: &[BoundFilter],
) -> Result<(Vec<String>, Vec<Vec<Value>>), ExecuteError> {
    let aggregates: Vec<&ProjectionPlan> = projections
        .iter()
        .chain(plan.hidden.iter())
        .filter(|p| matches!(p, ProjectionPlan::Aggregate { .. }))
        .collect();
    let columns = projections
        .iter()
        .chain(plan.hidden.iter())
        .map(|p| p.output_name().to_string())
        .collect();

    let key_getters = match &plan.group_by {
        Some(group_by) => bind_group_by(source, group_by)?,
        None => Vec::new(),
    };
    let agg_inputs: Vec<Option<usize>> = aggregates
        .iter()
        .map(|p| match p {
            ProjectionPlan::Aggregate {
                column: Some(column),
                ..
            } => column_index(source, column).map(Some),
            _ => Ok(None),
        })
        .collect::<Result<_, _>>()?;

    // First-seen order keeps output stable across runs
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut groups: HashMap<Vec<Value>, Vec<Box<dyn Accumulator>>> = HashMap::new();

    for row in &source.rows {
        if !passes_filters(row, filters) {
            continue;
        }

        let key: Vec<Value> = key_getters.iter().map(|g| g.value(row)).collect();
        let accumulators = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            new_accumulators(&aggregates)
        });

        for (acc, input) in accumulators.iter_mut().zip(&agg_inputs) {
            match input {
                Some(idx) => acc.accumulate(&row[*idx]),
                None => acc.accumulate(&Value::Int64(1)),
            }
        }
    }

    // A global aggregate over zero rows still yields one row
    if plan.group_by.is_none() && groups.is_empty() {
        order.push(Vec::new());
        groups.insert(Vec::new(), new_accumulators(&aggregates));
    }

    let mut rows = Vec::with_capacity(order.len());
    for key in order {
        let Some(accumulators) = groups.get(&key) else {
            continue;
        };
        let mut acc_iter = accumulators.iter();
        let mut row = Vec::with_capacity(projections.len() + plan.hidden.len());
        for proj in projections.iter().chain(plan.hidden.iter()) {
            match proj {
                ProjectionPlan::Aggregate { .. } => {
                    row.push(acc_iter.next().map(|a| a.result()).unwrap_or(Value::Null));
                }
                other => {
                    let value = group_position(other, plan.group_by.as_ref())
                        .and_then(|pos| key.get(pos).cloned())
                        .unwrap_or(Value::Null);
                    row.push(value);
                }
            }
        }
        rows.push(row);
    }

    Ok((columns, rows))
}

fn new_accumulators(aggregates: &[&ProjectionPlan]) -> Vec<Box<dyn Accumulator>> {
    aggregates
        .iter()
        .filter_map(|p| match p {
            ProjectionPlan::Aggregate {
                function, column, ..
            } => Some(create_accumulator(*function, column)),
            _ => None,
        })
        .collect()
}

/// Row value getter resolved against a table's column positions
enum Getter {
    Column(usize),
    DateTrunc(TruncUnit, usize),
}

impl Getter {
    fn value(&self, row: &[Value]) -> Value {
        match self {
            Getter::Column(idx) => row[*idx].clone(),
            Getter::DateTrunc(unit, idx) => match &row[*idx] {
                Value::Timestamp(ms) => truncate_timestamp(*ms, *unit)
                    .map(Value::Timestamp)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
        }
    }
}

fn bind_projection(source: &Table, proj: &ProjectionPlan) -> Result<Getter, ExecuteError> {
    match proj {
        ProjectionPlan::Column { name, .. } => Ok(Getter::Column(column_index(source, name)?)),
        ProjectionPlan::DateTrunc { unit, column, .. } => {
            Ok(Getter::DateTrunc(*unit, column_index(source, column)?))
        }
        ProjectionPlan::Aggregate { canonical, .. } => {
            Err(ExecuteError::General(format!("{} outside an aggregation", canonical)))
        }
    }
}

fn bind_group_by(source: &Table, group_by: &GroupByPlan) -> Result<Vec<Getter>, ExecuteError> {
    group_by
        .columns
        .iter()
        .map(|col| match col {
            GroupByColumnPlan::Column(name) => Ok(Getter::Column(column_index(source, name)?)),
            GroupByColumnPlan::DateTrunc { unit, column } => {
                Ok(Getter::DateTrunc(*unit, column_index(source, column)?))
            }
        })
        .collect()
}

/// Truncate epoch milliseconds to the start of the enclosing unit
pub fn truncate_timestamp(ms: i64, unit: TruncUnit) -> Option<i64> {
    let dttm = chrono::DateTime::from_timestamp_millis(ms)?.naive_utc();
    let date = dttm.date();
    let truncated: NaiveDateTime = match unit {
        TruncUnit::Second => date.and_hms_opt(dttm.hour(), dttm.minute(), dttm.second())?,
        TruncUnit::Minute => date.and_hms_opt(dttm.hour(), dttm.minute(), 0)?,
        TruncUnit::Hour => date.and_hms_opt(dttm.hour(), 0, 0)?,
        TruncUnit::Day => date.and_hms_opt(0, 0, 0)?,
        TruncUnit::Week => {
            let back = date.weekday().num_days_from_monday() as u64;
            date.checked_sub_days(Days::new(back))?.and_hms_opt(0, 0, 0)?
        }
        TruncUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?.and_hms_opt(0, 0, 0)?,
        TruncUnit::Quarter => {
            let month = (date.month0() / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(date.year(), month, 1)?.and_hms_opt(0, 0, 0)?
        }
        TruncUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_hms_opt(0, 0, 0)?,
    };
    Some(truncated.and_utc().timestamp_millis())
}

/// Filter with column positions and literals resolved
enum BoundFilter {
    Compare {
        idx: usize,
        operator: FilterOperator,
        value: Value,
    },
    Like {
        idx: usize,
        pattern: Regex,
        negated: bool,
    },
    InList {
        idx: usize,
        values: HashSet<Value>,
        negated: bool,
    },
    IsNull {
        idx: usize,
        negated: bool,
    },
    InSet {
        idxs: Vec<usize>,
        tuples: HashSet<Vec<Value>>,
        negated: bool,
    },
}

fn bind_filters(
    tables: &HashMap<String, Table>,
    source: &Table,
    filters: &[FilterPlan],
) -> Result<Vec<BoundFilter>, ExecuteError> {
    let coltypes = source.coltypes();

    filters
        .iter()
        .map(|filter| match filter {
            FilterPlan::InSubquery {
                columns,
                subquery,
                negated,
            } => {
                let idxs = columns
                    .iter()
                    .map(|c| column_index(source, c))
                    .collect::<Result<Vec<_>, _>>()?;
                let inner = execute_query(tables, subquery)?;
                Ok(BoundFilter::InSet {
                    idxs,
                    tuples: inner.table.rows.into_iter().collect(),
                    negated: *negated,
                })
            }
            FilterPlan::Compare { column, .. }
            | FilterPlan::InList { column, .. }
            | FilterPlan::IsNull { column, .. } => {
                let idx = column_index(source, column)?;
                let temporal = coltypes.get(idx).map(DataType::is_temporal).unwrap_or(false);
                bind_at(filter, idx, temporal)
            }
        })
        .collect()
}

/// Bind a single-column filter to a resolved position
fn bind_at(filter: &FilterPlan, idx: usize, temporal: bool) -> Result<BoundFilter, ExecuteError> {
    match filter {
        FilterPlan::Compare {
            operator: operator @ (FilterOperator::Like | FilterOperator::NotLike),
            value,
            ..
        } => {
            let pattern = value.as_str().ok_or_else(|| {
                ExecuteError::General(format!("LIKE pattern must be a string: {}", value))
            })?;
            Ok(BoundFilter::Like {
                idx,
                pattern: like_regex(pattern)?,
                negated: *operator == FilterOperator::NotLike,
            })
        }
        FilterPlan::Compare {
            operator, value, ..
        } => Ok(BoundFilter::Compare {
            idx,
            operator: *operator,
            value: coerce_literal(value, temporal),
        }),
        FilterPlan::InList {
            values, negated, ..
        } => Ok(BoundFilter::InList {
            idx,
            values: values.iter().map(|v| coerce_literal(v, temporal)).collect(),
            negated: *negated,
        }),
        FilterPlan::IsNull { negated, .. } => Ok(BoundFilter::IsNull {
            idx,
            negated: *negated,
        }),
        FilterPlan::InSubquery { .. } => Err(ExecuteError::General(
            "subquery filters are not allowed here".into(),
        )),
    }
}

/// Resolve output targets by name, falling back to aggregate call text
fn output_index(
    output: &Table,
    name: &str,
    projections: &[ProjectionPlan],
    hidden: &[ProjectionPlan],
) -> Result<usize, ExecuteError> {
    if let Some(idx) = output.column_index(name) {
        return Ok(idx);
    }
    projections
        .iter()
        .chain(hidden.iter())
        .position(|p| matches!(p, ProjectionPlan::Aggregate { canonical, .. } if canonical == name))
        .ok_or_else(|| ExecuteError::ColumnNotFound(name.to_string()))
}

fn bind_output_filters(
    output: &Table,
    filters: &[FilterPlan],
    projections: &[ProjectionPlan],
    hidden: &[ProjectionPlan],
) -> Result<Vec<BoundFilter>, ExecuteError> {
    filters
        .iter()
        .map(|filter| match filter {
            FilterPlan::Compare { column, .. }
            | FilterPlan::InList { column, .. }
            | FilterPlan::IsNull { column, .. } => {
                bind_at(filter, output_index(output, column, projections, hidden)?, false)
            }
            FilterPlan::InSubquery { .. } => Err(ExecuteError::General(
                "subquery filters are not allowed in HAVING".into(),
            )),
        })
        .collect()
}

fn coerce_literal(value: &Value, temporal: bool) -> Value {
    match value {
        Value::String(s) if temporal => parse_timestamp_literal(s)
            .map(Value::from_datetime)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn like_regex(pattern: &str) -> Result<Regex, ExecuteError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| ExecuteError::General(e.to_string()))
}

fn passes_filters(row: &[Value], filters: &[BoundFilter]) -> bool {
    filters.iter().all(|filter| match filter {
        BoundFilter::Compare {
            idx,
            operator,
            value,
        } => {
            let cell = &row[*idx];
            // NULL never satisfies a comparison
            if cell.is_null() || value.is_null() {
                return false;
            }
            match operator {
                FilterOperator::Eq => cell == value,
                FilterOperator::NotEq => cell != value,
                FilterOperator::Lt => cell < value,
                FilterOperator::LtEq => cell <= value,
                FilterOperator::Gt => cell > value,
                FilterOperator::GtEq => cell >= value,
                FilterOperator::Like | FilterOperator::NotLike => false,
            }
        }
        BoundFilter::Like {
            idx,
            pattern,
            negated,
        } => match &row[*idx] {
            Value::String(s) => pattern.is_match(s) != *negated,
            _ => false,
        },
        BoundFilter::InList {
            idx,
            values,
            negated,
        } => {
            let cell = &row[*idx];
            !cell.is_null() && values.contains(cell) != *negated
        }
        BoundFilter::IsNull { idx, negated } => row[*idx].is_null() != *negated,
        BoundFilter::InSet {
            idxs,
            tuples,
            negated,
        } => {
            let key: Vec<Value> = idxs.iter().map(|&i| row[i].clone()).collect();
            tuples.contains(&key) != *negated
        }
    })
}

fn apply_order_by(
    rows: &mut [Vec<Value>],
    output: &Table,
    order_by: &[OrderByPlan],
    projections: &[ProjectionPlan],
    hidden: &[ProjectionPlan],
) -> Result<(), ExecuteError> {
    let keys = order_by
        .iter()
        .map(|ob| Ok((output_index(output, &ob.column, projections, hidden)?, ob.descending)))
        .collect::<Result<Vec<_>, ExecuteError>>()?;

    rows.sort_by(|a, b| {
        for (idx, descending) in &keys {
            let cmp = a[*idx].cmp(&b[*idx]);
            if cmp != std::cmp::Ordering::Equal {
                return if *descending { cmp.reverse() } else { cmp };
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error(transparent)]
    Table(#[from] crate::data::TableError),

    #[error("Execution error: {0}")]
    General(String),
}
