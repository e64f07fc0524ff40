//! In-memory evaluation for the two query options that don't map cleanly
//! onto a single SQL fragment: `$compute` (evaluated against an already
//! row-scanned entity so its bindings can be appended post-SQL) and
//! `$search` (rewritten into an ordinary filter tree over the entity's
//! searchable string properties before it ever reaches the SQL generator).

use crate::expr::{ParseError, ParseNode, Parser};
use crate::metadata::EntityMetadata;
use crate::row::OrderedEntity;
use crate::token::{Token, TokenKind};
use crate::value::SqlValue;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("unknown property `{0}` in $compute expression")]
    PropertyNotFound(String),
    #[error("type mismatch evaluating `{0}`")]
    TypeMismatch(String),
    #[error("unsupported operator `{0}` in $compute expression")]
    UnsupportedOperator(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// Evaluates a `$compute` expression tree against one already-scanned
/// entity, producing the value to append under the binding's alias.
pub fn evaluate(node: &ParseNode, entity: &OrderedEntity) -> Result<SqlValue> {
    match node.token.kind {
        TokenKind::Property => entity
            .get(&node.token.text)
            .cloned()
            .ok_or_else(|| EvalError::PropertyNotFound(node.token.text.clone())),
        TokenKind::StringLiteral => Ok(SqlValue::Text(node.token.text.clone())),
        TokenKind::NumberLiteral => literal_number(&node.token),
        TokenKind::BooleanLiteral => Ok(SqlValue::Bool(node.token.text.eq_ignore_ascii_case("true"))),
        TokenKind::NullLiteral => Ok(SqlValue::Null),
        TokenKind::ArithmeticOp => evaluate_arithmetic(node, entity),
        TokenKind::ComparisonOp => evaluate_comparison(node, entity),
        TokenKind::LogicalOp => evaluate_logical(node, entity),
        TokenKind::FunctionName => evaluate_function(node, entity),
        other => Err(EvalError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn literal_number(tok: &Token) -> Result<SqlValue> {
    if tok.text.contains('.') {
        tok.text
            .parse::<f64>()
            .map(SqlValue::Float)
            .map_err(|_| EvalError::TypeMismatch(tok.text.clone()))
    } else {
        tok.text
            .parse::<i64>()
            .map(SqlValue::Int)
            .map_err(|_| EvalError::TypeMismatch(tok.text.clone()))
    }
}

fn evaluate_arithmetic(node: &ParseNode, entity: &OrderedEntity) -> Result<SqlValue> {
    let lhs = evaluate(&node.children[0], entity)?;
    let rhs = evaluate(&node.children[1], entity)?;
    let (a, b) = (
        lhs.as_f64().ok_or_else(|| EvalError::TypeMismatch(node.text().to_string()))?,
        rhs.as_f64().ok_or_else(|| EvalError::TypeMismatch(node.text().to_string()))?,
    );
    let result = match node.token.text.to_ascii_lowercase().as_str() {
        "add" => a + b,
        "sub" => a - b,
        "mul" => a * b,
        "div" | "divby" => a / b,
        "mod" => a % b,
        other => return Err(EvalError::UnsupportedOperator(other.to_string())),
    };
    if matches!(lhs, SqlValue::Int(_)) && matches!(rhs, SqlValue::Int(_)) && result.fract() == 0.0 {
        Ok(SqlValue::Int(result as i64))
    } else {
        Ok(SqlValue::Float(result))
    }
}

fn evaluate_comparison(node: &ParseNode, entity: &OrderedEntity) -> Result<SqlValue> {
    let op = node.token.text.to_ascii_lowercase();
    if op == "in" {
        let needle = evaluate(&node.children[0], entity)?;
        for candidate in &node.children[1..] {
            if evaluate(candidate, entity)? == needle {
                return Ok(SqlValue::Bool(true));
            }
        }
        return Ok(SqlValue::Bool(false));
    }
    let lhs = evaluate(&node.children[0], entity)?;
    let rhs = evaluate(&node.children[1], entity)?;
    let result = match op.as_str() {
        "eq" => lhs == rhs,
        "ne" => lhs != rhs,
        "gt" => lhs.partial_cmp_numeric(&rhs).map(|o| o.is_gt()).unwrap_or(false),
        "ge" => lhs.partial_cmp_numeric(&rhs).map(|o| o.is_ge()).unwrap_or(false),
        "lt" => lhs.partial_cmp_numeric(&rhs).map(|o| o.is_lt()).unwrap_or(false),
        "le" => lhs.partial_cmp_numeric(&rhs).map(|o| o.is_le()).unwrap_or(false),
        other => return Err(EvalError::UnsupportedOperator(other.to_string())),
    };
    Ok(SqlValue::Bool(result))
}

fn evaluate_logical(node: &ParseNode, entity: &OrderedEntity) -> Result<SqlValue> {
    match node.token.text.to_ascii_lowercase().as_str() {
        "not" => {
            let inner = evaluate(&node.children[0], entity)?;
            Ok(SqlValue::Bool(!as_bool(&inner)))
        }
        "and" => {
            let lhs = as_bool(&evaluate(&node.children[0], entity)?);
            let rhs = as_bool(&evaluate(&node.children[1], entity)?);
            Ok(SqlValue::Bool(lhs && rhs))
        }
        "or" => {
            let lhs = as_bool(&evaluate(&node.children[0], entity)?);
            let rhs = as_bool(&evaluate(&node.children[1], entity)?);
            Ok(SqlValue::Bool(lhs || rhs))
        }
        other => Err(EvalError::UnsupportedOperator(other.to_string())),
    }
}

fn as_bool(v: &SqlValue) -> bool {
    matches!(v, SqlValue::Bool(true))
}

fn evaluate_function(node: &ParseNode, entity: &OrderedEntity) -> Result<SqlValue> {
    let name = node.token.text.to_ascii_lowercase();
    let args: Vec<SqlValue> = node
        .children
        .iter()
        .map(|c| evaluate(c, entity))
        .collect::<Result<_>>()?;
    let as_str = |v: &SqlValue| v.as_str().map(|s| s.to_string()).unwrap_or_default();

    match name.as_str() {
        "contains" => Ok(SqlValue::Bool(as_str(&args[0]).contains(&as_str(&args[1])))),
        "startswith" => Ok(SqlValue::Bool(as_str(&args[0]).starts_with(&as_str(&args[1])))),
        "endswith" => Ok(SqlValue::Bool(as_str(&args[0]).ends_with(&as_str(&args[1])))),
        "length" => Ok(SqlValue::Int(as_str(&args[0]).chars().count() as i64)),
        "tolower" => Ok(SqlValue::Text(as_str(&args[0]).to_lowercase())),
        "toupper" => Ok(SqlValue::Text(as_str(&args[0]).to_uppercase())),
        "trim" => Ok(SqlValue::Text(as_str(&args[0]).trim().to_string())),
        "concat" => Ok(SqlValue::Text(args.iter().map(as_str).collect::<String>())),
        "round" => Ok(SqlValue::Float(args[0].as_f64().unwrap_or_default().round())),
        "floor" => Ok(SqlValue::Float(args[0].as_f64().unwrap_or_default().floor())),
        "ceiling" => Ok(SqlValue::Float(args[0].as_f64().unwrap_or_default().ceil())),
        _ => Err(EvalError::UnsupportedOperator(name)),
    }
}

/// Rewrites a free-text `$search` expression into an OR-chain of
/// `contains(Prop,'term')` clauses over every searchable string property on
/// the entity. Multi-word search strings are split on whitespace and ANDed.
pub fn search_to_filter(raw: &str, entity: &EntityMetadata) -> Result<Option<ParseNode>> {
    let searchable = entity.searchable_properties();
    if searchable.is_empty() {
        return Ok(None);
    }
    let terms: Vec<&str> = raw.split_whitespace().filter(|t| !t.is_empty()).collect();
    if terms.is_empty() {
        return Ok(None);
    }

    let mut term_nodes = Vec::with_capacity(terms.len());
    for term in terms {
        let mut prop_nodes = Vec::with_capacity(searchable.len());
        for prop in searchable {
            let contains_src = format!("contains({prop},{})", quote_literal(term));
            prop_nodes.push(Parser::parse(&contains_src)?);
        }
        term_nodes.push(or_chain(prop_nodes));
    }
    Ok(Some(and_chain(term_nodes)))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn or_chain(mut nodes: Vec<ParseNode>) -> ParseNode {
    let mut acc = nodes.remove(0);
    for n in nodes {
        acc = ParseNode {
            token: Token::new(TokenKind::LogicalOp, "or"),
            children: vec![acc, n],
        };
    }
    acc
}

fn and_chain(mut nodes: Vec<ParseNode>) -> ParseNode {
    let mut acc = nodes.remove(0);
    for n in nodes {
        acc = ParseNode {
            token: Token::new(TokenKind::LogicalOp, "and"),
            children: vec![acc, n],
        };
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetadata, PropertyMetadata, PropertyType};

    fn users() -> EntityMetadata {
        EntityMetadata::new(
            "Users",
            vec![
                PropertyMetadata::scalar("ID", PropertyType::Int64).key(),
                PropertyMetadata::scalar("Name", PropertyType::String),
            ],
        )
    }

    #[test]
    fn compute_evaluates_arithmetic_over_row() {
        let mut row = OrderedEntity::default();
        row.properties.push(("Amount".into(), SqlValue::Int(10)));
        row.properties.push(("Quantity".into(), SqlValue::Int(3)));
        let tree = Parser::parse("Amount mul Quantity").unwrap();
        assert_eq!(evaluate(&tree, &row).unwrap(), SqlValue::Int(30));
    }

    #[test]
    fn search_rewrites_to_contains_over_searchable_properties() {
        let entity = users();
        let tree = search_to_filter("alice", &entity).unwrap().unwrap();
        assert_eq!(tree.text(), "contains");
    }

    #[test]
    fn search_with_no_searchable_properties_yields_none() {
        let entity = EntityMetadata::new(
            "Nums",
            vec![PropertyMetadata::scalar("ID", PropertyType::Int64).key()],
        );
        assert!(search_to_filter("x", &entity).unwrap().is_none());
    }
}
