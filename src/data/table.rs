use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::value::{DataType, Value};

/// Row-oriented result table with a stable column order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Column names, in output order
    pub columns: Vec<String>,
    /// Result rows; every row has `columns.len()` cells
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, TableError> {
        let table = Self { columns, rows };
        table.check_shape()?;
        Ok(table)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(name, column values)` pairs
    pub fn from_columns(columns: Vec<(&str, Vec<Value>)>) -> Result<Self, TableError> {
        let height = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut rows = vec![Vec::with_capacity(columns.len()); height];
        let mut names = Vec::with_capacity(columns.len());
        for (name, values) in columns {
            if values.len() != height {
                return Err(TableError::LengthMismatch {
                    column: name.to_string(),
                    expected: height,
                    actual: values.len(),
                });
            }
            names.push(name.to_string());
            for (row, value) in rows.iter_mut().zip(values) {
                row.push(value);
            }
        }
        Self::new(names, rows)
    }

    fn check_shape(&self) -> Result<(), TableError> {
        let mut seen = std::collections::HashSet::new();
        for name in &self.columns {
            if !seen.insert(name.as_str()) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }
        for row in &self.rows {
            if row.len() != self.columns.len() {
                return Err(TableError::RowWidth {
                    expected: self.columns.len(),
                    actual: row.len(),
                });
            }
        }
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value> + '_> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Inferred type of every column, merging the types of non-null cells
    pub fn coltypes(&self) -> Vec<DataType> {
        (0..self.columns.len())
            .map(|idx| {
                self.rows
                    .iter()
                    .map(|row| DataType::from_value(&row[idx]))
                    .fold(DataType::Null, |acc, t| acc.merge(&t))
            })
            .collect()
    }

    /// Approximate memory footprint in bytes
    pub fn estimated_size(&self) -> usize {
        let header: usize = self
            .columns
            .iter()
            .map(|c| c.capacity() + std::mem::size_of::<String>())
            .sum();
        let cells: usize = self
            .rows
            .iter()
            .map(|row| {
                std::mem::size_of::<Vec<Value>>()
                    + row.iter().map(Value::estimated_size).sum::<usize>()
            })
            .sum();
        std::mem::size_of::<Table>() + header + cells
    }

    /// Replace all column names positionally
    pub fn set_column_names(&mut self, names: Vec<String>) -> Result<(), TableError> {
        if names.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                expected: self.columns.len(),
                actual: names.len(),
            });
        }
        let previous = std::mem::replace(&mut self.columns, names);
        if let Err(e) = self.check_shape() {
            self.columns = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Rename columns present in `mapping`; unknown names are ignored
    pub fn rename_columns(&mut self, mapping: &HashMap<String, String>) -> Result<(), TableError> {
        let renamed = self
            .columns
            .iter()
            .map(|c| mapping.get(c).cloned().unwrap_or_else(|| c.clone()))
            .collect();
        self.set_column_names(renamed)
    }

    pub fn add_column(&mut self, name: &str, values: Vec<Value>) -> Result<(), TableError> {
        if self.has_column(name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        if values.len() != self.rows.len() {
            return Err(TableError::LengthMismatch {
                column: name.to_string(),
                expected: self.rows.len(),
                actual: values.len(),
            });
        }
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Result<(), TableError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_string()))?;
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        Ok(())
    }

    /// Rewrite every cell of one column in place
    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> Result<(), TableError>
    where
        F: FnMut(&Value) -> Value,
    {
        let idx = self
            .column_index(name)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_string()))?;
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        Ok(())
    }

    /// Left join `right` on equal `keys`, appending the right-hand `take` columns.
    ///
    /// Every left row is kept. Left rows without a match get `Null` for the
    /// appended columns; a left row matching several right rows is repeated.
    pub fn left_join(
        &self,
        right: &Table,
        keys: &[String],
        take: &[(String, String)],
    ) -> Result<Table, TableError> {
        let left_keys = self.indices_of(keys)?;
        let right_keys = right.indices_of(keys)?;
        let take_idx: Vec<usize> = take
            .iter()
            .map(|(src, _)| {
                right
                    .column_index(src)
                    .ok_or_else(|| TableError::ColumnNotFound(src.clone()))
            })
            .collect::<Result<_, _>>()?;

        let mut lookup: HashMap<Vec<&Value>, Vec<usize>> = HashMap::new();
        for (row_idx, row) in right.rows.iter().enumerate() {
            let key: Vec<&Value> = right_keys.iter().map(|&i| &row[i]).collect();
            lookup.entry(key).or_default().push(row_idx);
        }

        let mut columns = self.columns.clone();
        for (_, dest) in take {
            if columns.contains(dest) {
                return Err(TableError::DuplicateColumn(dest.clone()));
            }
            columns.push(dest.clone());
        }

        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let key: Vec<&Value> = left_keys.iter().map(|&i| &row[i]).collect();
            match lookup.get(&key) {
                Some(matches) => {
                    for &m in matches {
                        let mut joined = row.clone();
                        joined.extend(take_idx.iter().map(|&i| right.rows[m][i].clone()));
                        rows.push(joined);
                    }
                }
                None => {
                    let mut joined = row.clone();
                    joined.extend(std::iter::repeat(Value::Null).take(take_idx.len()));
                    rows.push(joined);
                }
            }
        }

        Ok(Table { columns, rows })
    }

    fn indices_of(&self, names: &[String]) -> Result<Vec<usize>, TableError> {
        names
            .iter()
            .map(|n| {
                self.column_index(n)
                    .ok_or_else(|| TableError::ColumnNotFound(n.clone()))
            })
            .collect()
    }

    /// Sum of every numeric column; columns without numeric cells are skipped
    pub fn sum_numeric_columns(&self) -> BTreeMap<String, f64> {
        let coltypes = self.coltypes();
        self.columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| coltypes[*idx].is_numeric())
            .map(|(idx, name)| {
                let total = self.rows.iter().filter_map(|r| r[idx].as_f64()).sum();
                (name.clone(), total)
            })
            .collect()
    }

    /// Rows as JSON objects keyed by column name
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.clone(), v.to_json()))
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("Row has {actual} cells, expected {expected}")]
    RowWidth { expected: usize, actual: usize },

    #[error("Column '{column}' has {actual} values, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
}
