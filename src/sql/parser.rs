use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, ObjectName,
    Offset, OrderByExpr, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
    UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::data::Value;

/// Parsed query representation
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// Table name
    pub table: String,
    /// Selected columns and aggregations
    pub projections: Vec<Projection>,
    /// WHERE conditions (conjunction)
    pub filters: Vec<Filter>,
    /// GROUP BY columns
    pub group_by: Vec<GroupByColumn>,
    /// HAVING conditions (conjunction), evaluated on output rows
    pub having: Vec<Filter>,
    /// ORDER BY clauses
    pub order_by: Vec<OrderBy>,
    /// LIMIT
    pub limit: Option<usize>,
    /// OFFSET
    pub offset: Option<usize>,
    /// Aggregate calls referenced by HAVING / ORDER BY
    pub aggregate_refs: Vec<AggregateRef>,
}

/// Aggregate call appearing outside the SELECT list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRef {
    pub function: AggregateFunction,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Projection {
    /// Simple column reference: SELECT col [AS alias]
    Column { name: String, alias: Option<String> },
    /// All columns: SELECT *
    Wildcard,
    /// Aggregation: SELECT COUNT(*), SUM(col), etc.
    Aggregation {
        function: AggregateFunction,
        column: Option<String>, // None for COUNT(*)
        alias: Option<String>,
    },
    /// DATE_TRUNC('unit', col)
    DateTrunc {
        unit: TruncUnit,
        column: String,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunction::Count | AggregateFunction::CountDistinct => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }

    /// Canonical text of an aggregate call, used to resolve HAVING targets
    pub fn canonical(&self, column: Option<&str>) -> String {
        let arg = column.unwrap_or("*");
        match self {
            AggregateFunction::CountDistinct => format!("COUNT(DISTINCT {})", arg),
            _ => format!("{}({})", self.sql_name(), arg),
        }
    }
}

/// Truncation unit of DATE_TRUNC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TruncUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TruncUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "second" => Some(TruncUnit::Second),
            "minute" => Some(TruncUnit::Minute),
            "hour" => Some(TruncUnit::Hour),
            "day" => Some(TruncUnit::Day),
            "week" => Some(TruncUnit::Week),
            "month" => Some(TruncUnit::Month),
            "quarter" => Some(TruncUnit::Quarter),
            "year" => Some(TruncUnit::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    /// col <op> literal
    Compare {
        column: String,
        operator: FilterOperator,
        value: Value,
    },
    /// col [NOT] IN (literal, ...)
    InList {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    /// col IS [NOT] NULL
    IsNull { column: String, negated: bool },
    /// (col, ...) [NOT] IN (SELECT ...)
    InSubquery {
        columns: Vec<String>,
        subquery: Box<ParsedQuery>,
        negated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
}

#[derive(Debug, Clone)]
pub enum GroupByColumn {
    Column(String),
    DateTrunc { unit: TruncUnit, column: String },
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Parse a SQL query string
pub fn parse_query(sql: &str) -> Result<ParsedQuery, ParseError> {
    let dialect = GenericDialect {};
    let statements = Parser::parse_sql(&dialect, sql)?;

    if statements.is_empty() {
        return Err(ParseError::EmptyQuery);
    }

    if statements.len() > 1 {
        return Err(ParseError::MultipleStatements);
    }

    match &statements[0] {
        Statement::Query(query) => parse_select(query),
        _ => Err(ParseError::UnsupportedStatement),
    }
}

fn parse_select(query: &sqlparser::ast::Query) -> Result<ParsedQuery, ParseError> {
    let select = match &*query.body {
        SetExpr::Select(select) => select,
        _ => return Err(ParseError::UnsupportedQuery("Only SELECT queries supported".into())),
    };

    let table = parse_table_name(&select.from)?;
    let projections = parse_projections(&select.projection)?;
    let filters = parse_conditions(&select.selection)?;
    let group_by = parse_group_by(&select.group_by)?;
    let having = parse_conditions(&select.having)?;
    let order_by = parse_order_by(&query.order_by)?;
    let limit = parse_count(query.limit.as_ref())?;
    let offset = parse_count(query.offset.as_ref().map(|o: &Offset| &o.value))?;

    let mut aggregate_refs = Vec::new();
    if let Some(having) = &select.having {
        collect_aggregate_refs(having, &mut aggregate_refs)?;
    }
    for ob in &query.order_by {
        collect_aggregate_refs(&ob.expr, &mut aggregate_refs)?;
    }

    Ok(ParsedQuery {
        table,
        projections,
        filters,
        group_by,
        having,
        order_by,
        limit,
        offset,
        aggregate_refs,
    })
}

fn collect_aggregate_refs(expr: &Expr, out: &mut Vec<AggregateRef>) -> Result<(), ParseError> {
    match expr {
        Expr::Function(func) => {
            let (function, column) = parse_aggregate(func)?;
            let aggregate = AggregateRef { function, column };
            if !out.contains(&aggregate) {
                out.push(aggregate);
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_aggregate_refs(left, out)?;
            collect_aggregate_refs(right, out)?;
        }
        Expr::Nested(inner) | Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            collect_aggregate_refs(inner, out)?;
        }
        Expr::InList { expr, .. } | Expr::Like { expr, .. } => collect_aggregate_refs(expr, out)?,
        _ => {}
    }
    Ok(())
}

fn parse_table_name(from: &[TableWithJoins]) -> Result<String, ParseError> {
    if from.is_empty() {
        return Err(ParseError::MissingTable);
    }

    if from.len() > 1 {
        return Err(ParseError::JoinsNotSupported);
    }

    let table = &from[0];
    if !table.joins.is_empty() {
        return Err(ParseError::JoinsNotSupported);
    }

    match &table.relation {
        TableFactor::Table { name, .. } => Ok(object_name_to_string(name)),
        _ => Err(ParseError::UnsupportedTableExpression),
    }
}

fn object_name_to_string(name: &ObjectName) -> String {
    name.0.iter().map(|i| i.value.clone()).collect::<Vec<_>>().join(".")
}

fn parse_projections(items: &[SelectItem]) -> Result<Vec<Projection>, ParseError> {
    let mut projections = Vec::new();

    for item in items {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                projections.push(parse_projection_expr(expr, None)?);
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                projections.push(parse_projection_expr(expr, Some(alias.value.clone()))?);
            }
            SelectItem::Wildcard(_) => {
                projections.push(Projection::Wildcard);
            }
            _ => return Err(ParseError::UnsupportedProjection),
        }
    }

    Ok(projections)
}

fn parse_projection_expr(expr: &Expr, alias: Option<String>) -> Result<Projection, ParseError> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => Ok(Projection::Column {
            name: extract_column_name(expr)?,
            alias,
        }),
        Expr::Nested(inner) => parse_projection_expr(inner, alias),
        Expr::Function(func) => {
            let func_name = func.name.to_string().to_uppercase();

            if func_name == "DATE_TRUNC" {
                let (unit, column) = parse_date_trunc_args(&func.args)?;
                return Ok(Projection::DateTrunc {
                    unit,
                    column,
                    alias,
                });
            }

            let (function, column) = parse_aggregate(func)?;
            Ok(Projection::Aggregation {
                function,
                column,
                alias,
            })
        }
        _ => Err(ParseError::UnsupportedExpression(expr.to_string())),
    }
}

fn parse_aggregate(func: &Function) -> Result<(AggregateFunction, Option<String>), ParseError> {
    let func_name = func.name.to_string().to_uppercase();
    let function = match func_name.as_str() {
        "COUNT" if func.distinct => AggregateFunction::CountDistinct,
        "COUNT" => AggregateFunction::Count,
        "SUM" => AggregateFunction::Sum,
        "AVG" => AggregateFunction::Avg,
        "MIN" => AggregateFunction::Min,
        "MAX" => AggregateFunction::Max,
        _ => return Err(ParseError::UnsupportedFunction(func_name)),
    };
    let column = parse_function_column_arg(&func.args)?;
    if column.is_none() && function != AggregateFunction::Count {
        return Err(ParseError::UnsupportedExpression(format!(
            "{}(*)",
            function.sql_name()
        )));
    }
    Ok((function, column))
}

fn parse_function_column_arg(args: &[FunctionArg]) -> Result<Option<String>, ParseError> {
    if args.is_empty() {
        return Ok(None);
    }

    match &args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => Ok(None),
        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Ok(Some(extract_column_name(expr)?)),
        FunctionArg::Named {
            arg: FunctionArgExpr::Expr(expr),
            ..
        } => Ok(Some(extract_column_name(expr)?)),
        _ => Err(ParseError::UnsupportedExpression("Complex function argument".into())),
    }
}

fn parse_date_trunc_args(args: &[FunctionArg]) -> Result<(TruncUnit, String), ParseError> {
    if args.len() != 2 {
        return Err(ParseError::InvalidDateTrunc);
    }

    // First arg: unit string like 'month'
    let unit = match &args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Value(
            SqlValue::SingleQuotedString(s),
        ))) => TruncUnit::parse(s).ok_or_else(|| ParseError::InvalidInterval(s.clone()))?,
        _ => return Err(ParseError::InvalidDateTrunc),
    };

    // Second arg: column name
    let column = match &args[1] {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
            extract_column_name(expr).map_err(|_| ParseError::InvalidDateTrunc)?
        }
        _ => return Err(ParseError::InvalidDateTrunc),
    };

    Ok((unit, column))
}

fn parse_conditions(selection: &Option<Expr>) -> Result<Vec<Filter>, ParseError> {
    let Some(expr) = selection else {
        return Ok(vec![]);
    };

    parse_filter_expr(expr)
}

fn parse_filter_expr(expr: &Expr) -> Result<Vec<Filter>, ParseError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => {
                let mut filters = parse_filter_expr(left)?;
                filters.extend(parse_filter_expr(right)?);
                Ok(filters)
            }
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq => {
                let column = extract_filter_target(left)?;
                let value = extract_value(right)?;
                let operator = match op {
                    BinaryOperator::Eq => FilterOperator::Eq,
                    BinaryOperator::NotEq => FilterOperator::NotEq,
                    BinaryOperator::Lt => FilterOperator::Lt,
                    BinaryOperator::LtEq => FilterOperator::LtEq,
                    BinaryOperator::Gt => FilterOperator::Gt,
                    _ => FilterOperator::GtEq,
                };

                Ok(vec![Filter::Compare {
                    column,
                    operator,
                    value,
                }])
            }
            _ => Err(ParseError::UnsupportedOperator(op.to_string())),
        },
        Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => {
            let column = extract_filter_target(expr)?;
            let value = extract_value(pattern)?;
            Ok(vec![Filter::Compare {
                column,
                operator: if *negated {
                    FilterOperator::NotLike
                } else {
                    FilterOperator::Like
                },
                value,
            }])
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let column = extract_filter_target(expr)?;
            let values = list.iter().map(extract_value).collect::<Result<_, _>>()?;
            Ok(vec![Filter::InList {
                column,
                values,
                negated: *negated,
            }])
        }
        Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => {
            let columns = match expr.as_ref() {
                Expr::Tuple(items) => items
                    .iter()
                    .map(extract_column_name)
                    .collect::<Result<_, _>>()?,
                other => vec![extract_column_name(other)?],
            };
            Ok(vec![Filter::InSubquery {
                columns,
                subquery: Box::new(parse_select(subquery)?),
                negated: *negated,
            }])
        }
        Expr::IsNull(inner) => Ok(vec![Filter::IsNull {
            column: extract_filter_target(inner)?,
            negated: false,
        }]),
        Expr::IsNotNull(inner) => Ok(vec![Filter::IsNull {
            column: extract_filter_target(inner)?,
            negated: true,
        }]),
        Expr::Nested(inner) => parse_filter_expr(inner),
        _ => Err(ParseError::UnsupportedExpression(expr.to_string())),
    }
}

/// Column name, or the canonical text of an aggregate call (HAVING targets)
fn extract_filter_target(expr: &Expr) -> Result<String, ParseError> {
    match expr {
        Expr::Function(func) => {
            let (function, column) = parse_aggregate(func)?;
            Ok(function.canonical(column.as_deref()))
        }
        _ => extract_column_name(expr),
    }
}

fn extract_column_name(expr: &Expr) -> Result<String, ParseError> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => {
            Ok(idents.iter().map(|i| i.value.clone()).collect::<Vec<_>>().join("."))
        }
        Expr::Nested(inner) => extract_column_name(inner),
        _ => Err(ParseError::ExpectedColumnName),
    }
}

fn extract_value(expr: &Expr) -> Result<Value, ParseError> {
    match expr {
        Expr::Value(v) => sql_value_to_value(v),
        Expr::UnaryOp { op, expr } => {
            // Handle negative numbers
            if matches!(op, UnaryOperator::Minus) {
                if let Expr::Value(SqlValue::Number(n, _)) = expr.as_ref() {
                    let negated = format!("-{}", n);
                    if let Ok(i) = negated.parse::<i64>() {
                        return Ok(Value::Int64(i));
                    }
                    if let Ok(f) = negated.parse::<f64>() {
                        return Ok(Value::Float64(f));
                    }
                }
            }
            Err(ParseError::ExpectedValue)
        }
        // TIMESTAMP '2020-01-01 00:00:00'
        Expr::TypedString { value, .. } => parse_timestamp_literal(value)
            .map(Value::from_datetime)
            .ok_or_else(|| ParseError::InvalidTimestamp(value.clone())),
        Expr::Nested(inner) => extract_value(inner),
        _ => Err(ParseError::ExpectedValue),
    }
}

pub(crate) fn parse_timestamp_literal(s: &str) -> Option<chrono::NaiveDateTime> {
    crate::data::value::parse_datetime(s)
}

fn sql_value_to_value(v: &SqlValue) -> Result<Value, ParseError> {
    match v {
        SqlValue::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::Int64(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::Float64(f))
            } else {
                Err(ParseError::InvalidNumber(n.clone()))
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::String(s.clone()))
        }
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Null => Ok(Value::Null),
        _ => Err(ParseError::UnsupportedValue),
    }
}

fn parse_group_by(group_by: &GroupByExpr) -> Result<Vec<GroupByColumn>, ParseError> {
    let exprs = match group_by {
        GroupByExpr::All => return Err(ParseError::UnsupportedExpression("GROUP BY ALL".into())),
        GroupByExpr::Expressions(exprs) => exprs,
    };

    let mut result = Vec::new();

    for expr in exprs {
        match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Nested(_) => {
                result.push(GroupByColumn::Column(extract_column_name(expr)?));
            }
            Expr::Function(func) => {
                let func_name = func.name.to_string().to_uppercase();
                if func_name == "DATE_TRUNC" {
                    let (unit, column) = parse_date_trunc_args(&func.args)?;
                    result.push(GroupByColumn::DateTrunc { unit, column });
                } else {
                    return Err(ParseError::UnsupportedGroupByExpression);
                }
            }
            _ => return Err(ParseError::UnsupportedGroupByExpression),
        }
    }

    Ok(result)
}

fn parse_order_by(order_by: &[OrderByExpr]) -> Result<Vec<OrderBy>, ParseError> {
    let mut result = Vec::new();

    for expr in order_by {
        let column = extract_filter_target(&expr.expr)
            .map_err(|_| ParseError::UnsupportedOrderByExpression)?;
        let descending = expr.asc.map(|asc| !asc).unwrap_or(false);

        result.push(OrderBy { column, descending });
    }

    Ok(result)
}

fn parse_count(expr: Option<&Expr>) -> Result<Option<usize>, ParseError> {
    let Some(expr) = expr else {
        return Ok(None);
    };

    match expr {
        Expr::Value(SqlValue::Number(n, _)) => {
            let count: usize = n.parse().map_err(|_| ParseError::InvalidLimit)?;
            Ok(Some(count))
        }
        _ => Err(ParseError::InvalidLimit),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("SQL parse error: {0}")]
    SqlParser(#[from] sqlparser::parser::ParserError),

    #[error("Empty query")]
    EmptyQuery,

    #[error("Multiple statements not supported")]
    MultipleStatements,

    #[error("Unsupported statement type")]
    UnsupportedStatement,

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Missing FROM table")]
    MissingTable,

    #[error("JOINs are not supported")]
    JoinsNotSupported,

    #[error("Unsupported table expression")]
    UnsupportedTableExpression,

    #[error("Unsupported projection")]
    UnsupportedProjection,

    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Expected column name")]
    ExpectedColumnName,

    #[error("Expected value")]
    ExpectedValue,

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Invalid timestamp literal: {0}")]
    InvalidTimestamp(String),

    #[error("Unsupported value type")]
    UnsupportedValue,

    #[error("Invalid truncation unit: {0}")]
    InvalidInterval(String),

    #[error("Invalid DATE_TRUNC arguments")]
    InvalidDateTrunc,

    #[error("Unsupported GROUP BY expression")]
    UnsupportedGroupByExpression,

    #[error("Unsupported ORDER BY expression")]
    UnsupportedOrderByExpression,

    #[error("Invalid LIMIT/OFFSET value")]
    InvalidLimit,
}
