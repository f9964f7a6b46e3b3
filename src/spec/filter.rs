use serde::{Deserialize, Serialize};

use super::column::ColumnRef;
use crate::data::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = "!=", alias = "<>")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    GtEq,
    #[serde(rename = "IN", alias = "in")]
    In,
    #[serde(rename = "NOT IN", alias = "not in")]
    NotIn,
    #[serde(rename = "LIKE", alias = "like")]
    Like,
    #[serde(rename = "NOT LIKE", alias = "not like")]
    NotLike,
    #[serde(rename = "IS NULL")]
    IsNull,
    #[serde(rename = "IS NOT NULL")]
    IsNotNull,
    #[serde(rename = "TEMPORAL_RANGE")]
    TemporalRange,
}

impl FilterOp {
    pub fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::NotEq => "!=",
            FilterOp::Lt => "<",
            FilterOp::LtEq => "<=",
            FilterOp::Gt => ">",
            FilterOp::GtEq => ">=",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT IN",
            FilterOp::Like => "LIKE",
            FilterOp::NotLike => "NOT LIKE",
            FilterOp::IsNull => "IS NULL",
            FilterOp::IsNotNull => "IS NOT NULL",
            FilterOp::TemporalRange => "TEMPORAL_RANGE",
        }
    }

    pub fn takes_value(&self) -> bool {
        !matches!(self, FilterOp::IsNull | FilterOp::IsNotNull)
    }
}

/// `{col, op, val}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub col: ColumnRef,
    pub op: FilterOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<serde_json::Value>,
}

impl FilterClause {
    pub fn new(col: &str, op: FilterOp, val: Option<serde_json::Value>) -> Self {
        Self {
            col: ColumnRef::from(col),
            op,
            val,
        }
    }

    /// Canonicalise operator/value shapes: scalar IN becomes a one-element
    /// list, equality against a list becomes IN, null-tests drop their value.
    pub fn normalize(&mut self) {
        use serde_json::Value as Json;
        let op = self.op;
        match (op, self.val.take()) {
            (FilterOp::In | FilterOp::NotIn, Some(Json::Array(items))) => {
                self.val = Some(Json::Array(items));
            }
            (FilterOp::In | FilterOp::NotIn, Some(Json::Null) | None) => {
                self.val = Some(Json::Array(Vec::new()));
            }
            (FilterOp::In | FilterOp::NotIn, Some(scalar)) => {
                self.val = Some(Json::Array(vec![scalar]));
            }
            (FilterOp::Eq, Some(Json::Array(items))) => {
                self.op = FilterOp::In;
                self.val = Some(Json::Array(items));
            }
            (FilterOp::NotEq, Some(Json::Array(items))) => {
                self.op = FilterOp::NotIn;
                self.val = Some(Json::Array(items));
            }
            (FilterOp::IsNull | FilterOp::IsNotNull, _) => {}
            (_, val) => self.val = val,
        }
    }

    /// Scalar operand as an engine value
    pub fn scalar(&self) -> Option<Value> {
        self.val.as_ref().map(Value::from_json)
    }

    /// List operand of IN / NOT IN
    pub fn values(&self) -> Vec<Value> {
        match &self.val {
            Some(serde_json::Value::Array(items)) => items.iter().map(Value::from_json).collect(),
            Some(other) => vec![Value::from_json(other)],
            None => Vec::new(),
        }
    }
}

/// Filter reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSummary {
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FilterSummary {
    pub fn applied(column: &str) -> Self {
        Self {
            column: column.to_string(),
            reason: None,
        }
    }

    pub fn rejected(column: &str, reason: &str) -> Self {
        Self {
            column: column.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_clause() {
        let clause: FilterClause =
            serde_json::from_value(json!({"col": "country", "op": "NOT IN", "val": ["a", "b"]}))
                .unwrap();
        assert_eq!(clause.op, FilterOp::NotIn);
        assert_eq!(clause.values().len(), 2);

        let eq: FilterClause = serde_json::from_value(json!({"col": "x", "op": "=", "val": 1})).unwrap();
        assert_eq!(eq.op, FilterOp::Eq);
    }

    #[test]
    fn test_normalize_shapes() {
        let mut scalar_in = FilterClause::new("a", FilterOp::In, Some(json!("x")));
        scalar_in.normalize();
        assert_eq!(scalar_in.val, Some(json!(["x"])));

        let mut eq_list = FilterClause::new("a", FilterOp::Eq, Some(json!([1, 2])));
        eq_list.normalize();
        assert_eq!(eq_list.op, FilterOp::In);

        let mut ne_list = FilterClause::new("a", FilterOp::NotEq, Some(json!([1])));
        ne_list.normalize();
        assert_eq!(ne_list.op, FilterOp::NotIn);

        let mut null_test = FilterClause::new("a", FilterOp::IsNull, Some(json!("ignored")));
        null_test.normalize();
        assert_eq!(null_test.val, None);

        // Normalising twice changes nothing
        let before = eq_list.clone();
        eq_list.normalize();
        assert_eq!(eq_list, before);
    }
}
