use std::collections::HashSet;

use super::parser::AggregateFunction;
use crate::data::Value;

/// Accumulator trait for aggregation functions
pub trait Accumulator: Send + Sync {
    /// Add a value to the accumulator
    fn accumulate(&mut self, value: &Value);

    /// Get the final result
    fn result(&self) -> Value;
}

/// COUNT(*) or COUNT(column)
#[derive(Debug, Clone)]
pub struct CountAccumulator {
    count: i64,
    count_nulls: bool, // COUNT(*) counts nulls, COUNT(col) doesn't
}

impl CountAccumulator {
    pub fn count_all() -> Self {
        Self {
            count: 0,
            count_nulls: true,
        }
    }

    pub fn count_column() -> Self {
        Self {
            count: 0,
            count_nulls: false,
        }
    }
}

impl Accumulator for CountAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if self.count_nulls || !value.is_null() {
            self.count += 1;
        }
    }

    fn result(&self) -> Value {
        Value::Int64(self.count)
    }
}

/// COUNT(DISTINCT column)
#[derive(Debug, Clone, Default)]
pub struct CountDistinctAccumulator {
    seen: HashSet<Value>,
}

impl Accumulator for CountDistinctAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if !value.is_null() {
            self.seen.insert(value.clone());
        }
    }

    fn result(&self) -> Value {
        Value::Int64(self.seen.len() as i64)
    }
}

/// SUM(column); stays integral while every input is an integer
#[derive(Debug, Clone, Default)]
pub struct SumAccumulator {
    int_sum: i64,
    float_sum: f64,
    is_float: bool,
    has_value: bool,
}

impl Accumulator for SumAccumulator {
    fn accumulate(&mut self, value: &Value) {
        match value {
            Value::Int64(v) if !self.is_float => match self.int_sum.checked_add(*v) {
                Some(sum) => self.int_sum = sum,
                None => {
                    self.is_float = true;
                    self.float_sum = self.int_sum as f64 + *v as f64;
                }
            },
            _ => {
                let Some(v) = value.as_f64() else {
                    return;
                };
                if !self.is_float {
                    self.is_float = true;
                    self.float_sum = self.int_sum as f64;
                }
                self.float_sum += v;
            }
        }
        self.has_value = true;
    }

    fn result(&self) -> Value {
        match (self.has_value, self.is_float) {
            (false, _) => Value::Null,
            (true, false) => Value::Int64(self.int_sum),
            (true, true) => Value::Float64(self.float_sum),
        }
    }
}

/// AVG(column)
#[derive(Debug, Clone, Default)]
pub struct AvgAccumulator {
    sum: f64,
    count: i64,
}

impl Accumulator for AvgAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if let Some(v) = value.as_f64() {
            self.sum += v;
            self.count += 1;
        }
    }

    fn result(&self) -> Value {
        if self.count > 0 {
            Value::Float64(self.sum / self.count as f64)
        } else {
            Value::Null
        }
    }
}

/// MIN(column) / MAX(column)
#[derive(Debug, Clone)]
pub struct ExtremumAccumulator {
    current: Option<Value>,
    keep_max: bool,
}

impl ExtremumAccumulator {
    pub fn min() -> Self {
        Self {
            current: None,
            keep_max: false,
        }
    }

    pub fn max() -> Self {
        Self {
            current: None,
            keep_max: true,
        }
    }
}

impl Accumulator for ExtremumAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        let replace = match &self.current {
            None => true,
            Some(current) if self.keep_max => value > current,
            Some(current) => value < current,
        };
        if replace {
            self.current = Some(value.clone());
        }
    }

    fn result(&self) -> Value {
        self.current.clone().unwrap_or(Value::Null)
    }
}

/// Create an accumulator for an aggregate call
pub fn create_accumulator(func: AggregateFunction, column: &Option<String>) -> Box<dyn Accumulator> {
    match func {
        AggregateFunction::Count => {
            if column.is_some() {
                Box::new(CountAccumulator::count_column())
            } else {
                Box::new(CountAccumulator::count_all())
            }
        }
        AggregateFunction::CountDistinct => Box::new(CountDistinctAccumulator::default()),
        AggregateFunction::Sum => Box::new(SumAccumulator::default()),
        AggregateFunction::Avg => Box::new(AvgAccumulator::default()),
        AggregateFunction::Min => Box::new(ExtremumAccumulator::min()),
        AggregateFunction::Max => Box::new(ExtremumAccumulator::max()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_accumulator() {
        let mut acc = CountAccumulator::count_all();
        acc.accumulate(&Value::Int64(1));
        acc.accumulate(&Value::Int64(2));
        acc.accumulate(&Value::Null);
        assert_eq!(acc.result(), Value::Int64(3));

        let mut acc = CountAccumulator::count_column();
        acc.accumulate(&Value::Int64(1));
        acc.accumulate(&Value::Null);
        assert_eq!(acc.result(), Value::Int64(1));
    }

    #[test]
    fn test_count_distinct() {
        let mut acc = CountDistinctAccumulator::default();
        for v in ["a", "b", "a"] {
            acc.accumulate(&Value::String(v.to_string()));
        }
        acc.accumulate(&Value::Null);
        assert_eq!(acc.result(), Value::Int64(2));
    }

    #[test]
    fn test_sum_stays_integral() {
        let mut acc = SumAccumulator::default();
        acc.accumulate(&Value::Int64(2));
        acc.accumulate(&Value::Int64(3));
        assert!(matches!(acc.result(), Value::Int64(5)));

        acc.accumulate(&Value::Float64(0.5));
        assert_eq!(acc.result(), Value::Float64(5.5));
    }

    #[test]
    fn test_sum_of_nothing_is_null() {
        let mut acc = SumAccumulator::default();
        acc.accumulate(&Value::Null);
        assert!(acc.result().is_null());
    }

    #[test]
    fn test_avg_min_max() {
        let mut avg = AvgAccumulator::default();
        let mut min = ExtremumAccumulator::min();
        let mut max = ExtremumAccumulator::max();
        for v in [4, 1, 7] {
            avg.accumulate(&Value::Int64(v));
            min.accumulate(&Value::Int64(v));
            max.accumulate(&Value::Int64(v));
        }
        assert_eq!(avg.result(), Value::Float64(4.0));
        assert_eq!(min.result(), Value::Int64(1));
        assert_eq!(max.result(), Value::Int64(7));
    }
}
