//! Normalisation of free-form WHERE / HAVING fragments and ad-hoc expressions.
//!
//! The output of [`sanitize_clause`] is a fixed point: sanitizing it again
//! returns the same string.

use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClauseError {
    #[error("Unbalanced parenthesis in clause")]
    UnbalancedParens,

    #[error("Clause contains multiple statements")]
    MultipleStatements,

    #[error("Failed to tokenize clause: {0}")]
    Tokenize(String),

    #[error("Not a single SQL expression: {0}")]
    NotAnExpression(String),
}

/// Collapse whitespace outside literals, tighten parentheses, turn line
/// comments into block comments and reject anything that could escape the
/// surrounding clause.
pub fn sanitize_clause(clause: &str) -> Result<String, ClauseError> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, clause)
        .with_unescape(false)
        .tokenize()
        .map_err(|e| ClauseError::Tokenize(e.message))?;

    let mut out = String::with_capacity(clause.len());
    let mut depth: i32 = 0;
    let mut pending_space = false;

    for token in tokens {
        let text = match token {
            Token::SemiColon => return Err(ClauseError::MultipleStatements),
            Token::EOF => continue,
            Token::Whitespace(Whitespace::SingleLineComment { comment, .. }) => {
                let body = comment.trim().replace("*/", "* /");
                push_token(&mut out, &mut pending_space, &block_comment(&body));
                pending_space = true;
                continue;
            }
            Token::Whitespace(Whitespace::MultiLineComment(body)) => format!("/*{}*/", body),
            Token::Whitespace(_) => {
                pending_space = true;
                continue;
            }
            Token::LParen => {
                depth += 1;
                "(".to_string()
            }
            Token::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(ClauseError::UnbalancedParens);
                }
                ")".to_string()
            }
            other => other.to_string(),
        };
        push_token(&mut out, &mut pending_space, &text);
    }

    if depth != 0 {
        return Err(ClauseError::UnbalancedParens);
    }
    Ok(out)
}

/// Sanitize `expr` and require it to be exactly one SQL expression, as
/// needed wherever it is pasted into a select list or GROUP BY.
pub fn sanitize_expression(expr: &str) -> Result<String, ClauseError> {
    let sanitized = sanitize_clause(expr)?;
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(&sanitized)
        .map_err(|e| ClauseError::NotAnExpression(e.to_string()))?;
    parser
        .parse_expr()
        .map_err(|e| ClauseError::NotAnExpression(e.to_string()))?;
    let trailing = parser.peek_token().token;
    if trailing != Token::EOF {
        return Err(ClauseError::NotAnExpression(format!("unexpected {} after expression", trailing)));
    }
    Ok(sanitized)
}

fn block_comment(body: &str) -> String {
    if body.is_empty() {
        "/* */".to_string()
    } else {
        format!("/* {} */", body)
    }
}

fn push_token(out: &mut String, pending: &mut bool, token: &str) {
    if *pending && !out.is_empty() && !out.ends_with('(') && !token.starts_with(')') {
        out.push(' ');
    }
    *pending = false;
    out.push_str(token);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_and_parens() {
        assert_eq!(sanitize_clause("(\n  col1 > 0\n)").unwrap(), "(col1 > 0)");
        assert_eq!(
            sanitize_clause("  a = 1   AND ( b  <  2 )  ").unwrap(),
            "a = 1 AND (b < 2)"
        );
    }

    #[test]
    fn test_literals_untouched() {
        assert_eq!(
            sanitize_clause("name = 'a  ;  (b'").unwrap(),
            "name = 'a  ;  (b'"
        );
        assert_eq!(sanitize_clause("x = 'it''s'").unwrap(), "x = 'it''s'");
        assert_eq!(sanitize_clause("\"my col\" >= 2").unwrap(), "\"my col\" >= 2");
    }

    #[test]
    fn test_line_comment_becomes_block() {
        assert_eq!(
            sanitize_clause("a = 1 -- keep me\nAND b = 2").unwrap(),
            "a = 1 /* keep me */ AND b = 2"
        );
        assert_eq!(sanitize_clause("a = 1 -- trailing").unwrap(), "a = 1 /* trailing */");
    }

    #[test]
    fn test_rejections() {
        assert_eq!(sanitize_clause("a = 1; DROP TABLE t"), Err(ClauseError::MultipleStatements));
        assert_eq!(sanitize_clause("(a = 1"), Err(ClauseError::UnbalancedParens));
        assert_eq!(sanitize_clause("a = 1) OR (1 = 1"), Err(ClauseError::UnbalancedParens));
        assert!(matches!(sanitize_clause("a = 'x"), Err(ClauseError::Tokenize(_))));
        assert!(matches!(sanitize_clause("a = 1 /* open"), Err(ClauseError::Tokenize(_))));
    }

    #[test]
    fn test_idempotent() {
        for clause in [
            "(\n  col1 > 0\n)",
            "a = 1 -- c1\n AND ( b IN ('x', 'y') )",
            "/* multi\n line */ x >= 2",
            "f( a ,b )",
            "x != 'it''s' -- a */ b",
        ] {
            let once = sanitize_clause(clause).unwrap();
            assert_eq!(sanitize_clause(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_single_expression() {
        assert_eq!(sanitize_expression("UPPER( country )").unwrap(), "UPPER(country)");
        assert_eq!(sanitize_expression("num * 2 -- doubled").unwrap(), "num * 2 /* doubled */");
        assert_eq!(
            sanitize_expression("num FROM births; DROP TABLE births; --"),
            Err(ClauseError::MultipleStatements)
        );
        assert!(matches!(
            sanitize_expression("num FROM births"),
            Err(ClauseError::NotAnExpression(_))
        ));
        assert!(matches!(
            sanitize_expression("num AS x, state"),
            Err(ClauseError::NotAnExpression(_))
        ));
    }
}
