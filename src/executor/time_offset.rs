//! Joining "time comparison" results back onto the primary result.

use crate::data::{Table, TableError, Value};
use crate::spec::time::Realign;
use crate::spec::TimeGrain;

/// Synthetic join column used for calendar grains
pub const GRAIN_KEY_COLUMN: &str = "__grain_key";

/// Result column carrying `metric` for the offset labelled `offset`
pub fn offset_column_name(metric: &str, offset: &str) -> String {
    format!("{} {}", metric, offset)
}

/// How offset tables line up with the primary table
#[derive(Debug, Clone)]
pub struct OffsetJoin<'a> {
    /// Dimension labels, excluding the temporal axis
    pub dimensions: &'a [String],
    pub time_column: Option<&'a str>,
    pub grain: Option<TimeGrain>,
    pub metrics: &'a [String],
}

impl OffsetJoin<'_> {
    /// Shift the offset table's time axis forward, then left-join its metrics
    /// onto `primary` as `"<metric> <label>"` columns.
    pub fn join(&self, primary: &Table, offset: &Table, realign: Realign, label: &str) -> Result<Table, TableError> {
        let mut offset = offset.clone();
        if let Some(time_column) = self.time_column {
            offset.map_column(time_column, |value| shift(value, realign))?;
        }

        let mut keys: Vec<String> = self.dimensions.to_vec();
        let calendar = match (self.time_column, self.grain) {
            (Some(time_column), Some(grain)) if grain.is_calendar() => Some((time_column, grain)),
            _ => None,
        };

        let mut left = primary.clone();
        match (calendar, self.time_column) {
            (Some((time_column, grain)), _) => {
                add_grain_key(&mut left, time_column, grain)?;
                add_grain_key(&mut offset, time_column, grain)?;
                keys.push(GRAIN_KEY_COLUMN.to_string());
            }
            (None, Some(time_column)) => keys.push(time_column.to_string()),
            (None, None) => {}
        }

        let take: Vec<(String, String)> = self
            .metrics
            .iter()
            .map(|metric| (metric.clone(), offset_column_name(metric, label)))
            .collect();
        let mut joined = left.left_join(&offset, &keys, &take)?;
        if calendar.is_some() {
            joined.drop_column(GRAIN_KEY_COLUMN)?;
        }
        Ok(joined)
    }
}

fn shift(value: &Value, realign: Realign) -> Value {
    match value.as_datetime().and_then(|dttm| realign.apply(dttm)) {
        Some(shifted) if matches!(value, Value::Timestamp(_)) => Value::from_datetime(shifted),
        _ => value.clone(),
    }
}

fn add_grain_key(table: &mut Table, time_column: &str, grain: TimeGrain) -> Result<(), TableError> {
    let idx = table
        .column_index(time_column)
        .ok_or_else(|| TableError::ColumnNotFound(time_column.to_string()))?;
    let keys = table
        .rows
        .iter()
        .map(|row| {
            row[idx]
                .as_datetime()
                .and_then(|dttm| grain.grain_key(dttm))
                .map(Value::String)
                .unwrap_or(Value::Null)
        })
        .collect();
    table.add_column(GRAIN_KEY_COLUMN, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_datetime;
    use crate::spec::time::{RelativeDelta, TimeUnit};
    use chrono::Duration;

    fn ts(s: &str) -> Value {
        Value::from_datetime(parse_datetime(s).unwrap())
    }

    fn year_back() -> Realign {
        Realign::Calendar(RelativeDelta::new(1, TimeUnit::Year))
    }

    #[test]
    fn test_monthly_year_over_year() {
        let primary = Table::from_columns(vec![
            ("d", vec![ts("2020-01-01"), ts("2020-02-01")]),
            ("v", vec![Value::Int64(10), Value::Int64(20)]),
        ])
        .unwrap();
        let offset = Table::from_columns(vec![
            ("d", vec![ts("2019-01-01"), ts("2019-02-01")]),
            ("v", vec![Value::Int64(5), Value::Int64(8)]),
        ])
        .unwrap();
        let metrics = vec!["v".to_string()];
        let join = OffsetJoin {
            dimensions: &[],
            time_column: Some("d"),
            grain: Some(TimeGrain::Month),
            metrics: &metrics,
        };

        let joined = join.join(&primary, &offset, year_back(), "-1 year").unwrap();
        assert_eq!(joined.columns, vec!["d", "v", "v -1 year"]);
        assert_eq!(
            joined.rows,
            vec![
                vec![ts("2020-01-01"), Value::Int64(10), Value::Int64(5)],
                vec![ts("2020-02-01"), Value::Int64(20), Value::Int64(8)],
            ]
        );
    }

    #[test]
    fn test_calendar_grain_aligns_uneven_months() {
        // Weekly buckets start on different days a year apart
        let primary = Table::from_columns(vec![
            ("d", vec![ts("2021-01-04")]),
            ("v", vec![Value::Int64(3)]),
        ])
        .unwrap();
        let offset = Table::from_columns(vec![
            ("d", vec![ts("2020-01-06")]),
            ("v", vec![Value::Int64(1)]),
        ])
        .unwrap();
        let metrics = vec!["v".to_string()];
        let join = OffsetJoin {
            dimensions: &[],
            time_column: Some("d"),
            grain: Some(TimeGrain::Week),
            metrics: &metrics,
        };
        let joined = join
            .join(&primary, &offset, Realign::Fixed(Duration::days(364)), "52 weeks ago")
            .unwrap();
        assert_eq!(joined.columns, vec!["d", "v", "v 52 weeks ago"]);
        assert_eq!(joined.rows[0][2], Value::Int64(1));
    }

    #[test]
    fn test_dimensions_and_missing_rows() {
        let primary = Table::from_columns(vec![
            ("d", vec![ts("2020-01-01"), ts("2020-01-01")]),
            ("country", vec![Value::String("fr".into()), Value::String("us".into())]),
            ("v", vec![Value::Int64(1), Value::Int64(2)]),
        ])
        .unwrap();
        let offset = Table::from_columns(vec![
            ("d", vec![ts("2019-12-31"), ts("2019-12-31")]),
            ("country", vec![Value::String("us".into()), Value::String("de".into())]),
            ("v", vec![Value::Int64(7), Value::Int64(9)]),
        ])
        .unwrap();
        let dims = vec!["country".to_string()];
        let metrics = vec!["v".to_string()];
        let join = OffsetJoin {
            dimensions: &dims,
            time_column: Some("d"),
            grain: Some(TimeGrain::Day),
            metrics: &metrics,
        };
        let joined = join
            .join(&primary, &offset, Realign::Fixed(Duration::days(1)), "1 day ago")
            .unwrap();
        assert_eq!(joined.row_count(), 2);
        assert_eq!(joined.rows[0][3], Value::Null);
        assert_eq!(joined.rows[1][3], Value::Int64(7));
    }
}
