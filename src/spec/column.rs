use serde::{Deserialize, Serialize};

/// A dimension: a physical column name or an ad-hoc SQL expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Named(String),
    Adhoc(AdhocColumn),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdhocColumn {
    pub sql_expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ColumnRef {
    /// Name of the result column this reference produces
    pub fn label(&self) -> String {
        match self {
            ColumnRef::Named(name) => name.clone(),
            ColumnRef::Adhoc(adhoc) => adhoc
                .label
                .clone()
                .unwrap_or_else(|| adhoc.sql_expression.clone()),
        }
    }

    pub fn physical_name(&self) -> Option<&str> {
        match self {
            ColumnRef::Named(name) => Some(name),
            ColumnRef::Adhoc(_) => None,
        }
    }
}

impl From<&str> for ColumnRef {
    fn from(name: &str) -> Self {
        ColumnRef::Named(name.to_string())
    }
}

/// A metric: a saved metric name or an ad-hoc aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricRef {
    Named(String),
    Adhoc(AdhocMetric),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "expressionType")]
pub enum AdhocMetric {
    #[serde(rename = "SIMPLE")]
    Simple {
        column: MetricColumn,
        aggregate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    #[serde(rename = "SQL")]
    Sql {
        #[serde(rename = "sqlExpression")]
        sql_expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricColumn {
    pub column_name: String,
}

impl AdhocMetric {
    pub fn label(&self) -> String {
        match self {
            AdhocMetric::Simple {
                column,
                aggregate,
                label,
            } => label
                .clone()
                .unwrap_or_else(|| format!("{}({})", aggregate.to_uppercase(), column.column_name)),
            AdhocMetric::Sql {
                sql_expression,
                label,
            } => label.clone().unwrap_or_else(|| sql_expression.clone()),
        }
    }
}

impl MetricRef {
    pub fn label(&self) -> String {
        match self {
            MetricRef::Named(name) => name.clone(),
            MetricRef::Adhoc(adhoc) => adhoc.label(),
        }
    }
}

impl From<&str> for MetricRef {
    fn from(name: &str) -> Self {
        MetricRef::Named(name.to_string())
    }
}

/// ORDER BY target; plain strings name a metric or a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderTarget {
    Metric(AdhocMetric),
    Column(ColumnRef),
}

impl OrderTarget {
    pub fn label(&self) -> String {
        match self {
            OrderTarget::Metric(metric) => metric.label(),
            OrderTarget::Column(column) => column.label(),
        }
    }
}

/// `[target, ascending]`
pub type OrderBy = (OrderTarget, bool);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_shapes() {
        let named: ColumnRef = serde_json::from_value(json!("country")).unwrap();
        let adhoc: ColumnRef =
            serde_json::from_value(json!({"sqlExpression": "UPPER(country)", "label": "c"})).unwrap();
        assert_eq!(named.label(), "country");
        assert_eq!(adhoc.label(), "c");
        assert_eq!(adhoc.physical_name(), None);
    }

    #[test]
    fn test_metric_shapes() {
        let simple: MetricRef = serde_json::from_value(json!({
            "expressionType": "SIMPLE",
            "column": {"column_name": "num"},
            "aggregate": "sum"
        }))
        .unwrap();
        let sql: MetricRef = serde_json::from_value(json!({
            "expressionType": "SQL",
            "sqlExpression": "COUNT(*)",
            "label": "rows"
        }))
        .unwrap();
        assert_eq!(simple.label(), "SUM(num)");
        assert_eq!(sql.label(), "rows");
        assert_eq!(MetricRef::from("count").label(), "count");
    }

    #[test]
    fn test_order_targets() {
        let order: Vec<OrderBy> = serde_json::from_value(json!([
            ["count", false],
            [{"expressionType": "SQL", "sqlExpression": "MAX(x)"}, true]
        ]))
        .unwrap();
        assert_eq!(order[0].0, OrderTarget::Column(ColumnRef::Named("count".into())));
        assert_eq!(order[1].0.label(), "MAX(x)");
        assert!(order[1].1);
    }
}
