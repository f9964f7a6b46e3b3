use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::data::{Table, TableError, Value};

/// Post-processing step applied to a result table after execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "options", rename_all = "snake_case")]
pub enum PostProcessingOp {
    Contribution(ContributionOptions),
    Sort(SortOptions),
    Rename(RenameOptions),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Row,
    #[default]
    Column,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContributionOptions {
    #[serde(default)]
    pub orientation: Orientation,
    /// Columns to convert; all numeric columns when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Write results to new columns instead of overwriting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_columns: Option<Vec<String>>,
    /// Denominators computed by a totals query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution_totals: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOptions {
    /// `[column, ascending]` pairs, most significant first
    pub columns: Vec<(String, bool)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameOptions {
    pub columns: BTreeMap<String, String>,
}

impl PostProcessingOp {
    pub fn name(&self) -> &'static str {
        match self {
            PostProcessingOp::Contribution(_) => "contribution",
            PostProcessingOp::Sort(_) => "sort",
            PostProcessingOp::Rename(_) => "rename",
        }
    }

    pub fn apply(&self, table: Table) -> Result<Table, PostProcessingError> {
        match self {
            PostProcessingOp::Contribution(options) => contribution(table, options),
            PostProcessingOp::Sort(options) => sort(table, options),
            PostProcessingOp::Rename(options) => {
                let mut table = table;
                let mapping: HashMap<String, String> = options
                    .columns
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                table.rename_columns(&mapping)?;
                Ok(table)
            }
        }
    }
}

/// Run every step in order
pub fn apply_all(table: Table, ops: &[PostProcessingOp]) -> Result<Table, PostProcessingError> {
    ops.iter().try_fold(table, |table, op| op.apply(table))
}

fn ratio(value: &Value, total: f64) -> Value {
    match value.as_f64() {
        Some(v) if total != 0.0 => Value::Float64(v / total),
        _ => Value::Null,
    }
}

fn contribution(mut table: Table, options: &ContributionOptions) -> Result<Table, PostProcessingError> {
    let columns = match &options.columns {
        Some(columns) => columns.clone(),
        None => {
            let coltypes = table.coltypes();
            table
                .columns
                .iter()
                .zip(coltypes)
                .filter(|(_, t)| t.is_numeric())
                .map(|(c, _)| c.clone())
                .collect()
        }
    };
    let idxs = columns
        .iter()
        .map(|c| {
            table
                .column_index(c)
                .ok_or_else(|| PostProcessingError::Table(TableError::ColumnNotFound(c.clone())))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(renamed) = &options.rename_columns {
        if renamed.len() != columns.len() {
            return Err(PostProcessingError::InvalidOptions(format!(
                "`rename_columns` has {} names for {} columns",
                renamed.len(),
                columns.len()
            )));
        }
    }

    let results: Vec<Vec<Value>> = match options.orientation {
        Orientation::Column => idxs
            .iter()
            .zip(&columns)
            .map(|(&idx, name)| {
                let total = options
                    .contribution_totals
                    .as_ref()
                    .and_then(|totals| totals.get(name).copied())
                    .unwrap_or_else(|| table.rows.iter().filter_map(|r| r[idx].as_f64()).sum());
                table.rows.iter().map(|r| ratio(&r[idx], total)).collect()
            })
            .collect(),
        Orientation::Row => {
            let row_totals: Vec<f64> = table
                .rows
                .iter()
                .map(|r| idxs.iter().filter_map(|&i| r[i].as_f64()).sum())
                .collect();
            idxs.iter()
                .map(|&idx| {
                    table
                        .rows
                        .iter()
                        .zip(&row_totals)
                        .map(|(r, total)| ratio(&r[idx], *total))
                        .collect()
                })
                .collect()
        }
    };

    match &options.rename_columns {
        Some(renamed) => {
            for (name, values) in renamed.iter().zip(results) {
                table.add_column(name, values)?;
            }
        }
        None => {
            for (&idx, values) in idxs.iter().zip(results) {
                for (row, value) in table.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
        }
    }
    Ok(table)
}

fn sort(mut table: Table, options: &SortOptions) -> Result<Table, PostProcessingError> {
    let keys = options
        .columns
        .iter()
        .map(|(c, ascending)| {
            table
                .column_index(c)
                .map(|idx| (idx, *ascending))
                .ok_or_else(|| PostProcessingError::Table(TableError::ColumnNotFound(c.clone())))
        })
        .collect::<Result<Vec<_>, _>>()?;

    table.rows.sort_by(|a, b| {
        for (idx, ascending) in &keys {
            let cmp = a[*idx].cmp(&b[*idx]);
            if cmp != std::cmp::Ordering::Equal {
                return if *ascending { cmp } else { cmp.reverse() };
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(table)
}

#[derive(Debug, thiserror::Error)]
pub enum PostProcessingError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Invalid post-processing options: {0}")]
    InvalidOptions(String),
}
