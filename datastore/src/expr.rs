//! Shunting-Yard expression parser: turns a token stream into a typed parse
//! tree. One parser instance is read-only after construction (the
//! precedence/arity tables are plain functions over `static` data) and is
//! safe to share across concurrently-running requests.

use crate::token::{Token, TokenKind, Tokenizer};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Tokenize(#[from] crate::token::TokenizeError),
    #[error("empty expression")]
    Empty,
    #[error("unbalanced parentheses")]
    Unbalanced,
    #[error("`{0}` expects {1} argument(s), found {2}")]
    ArityMismatch(String, String, usize),
    #[error("`in` must be followed by a parenthesized value list")]
    InMissingList,
    #[error("nested `in` inside another operator is not supported")]
    NestedIn,
    #[error("dangling operator `{0}` with no operand")]
    DanglingOperator(String),
    #[error("`$filter` must evaluate to a boolean expression")]
    NonBooleanFilterRoot,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// A node in the parsed expression tree: one token plus an ordered list of
/// children. Literals and identifiers are leaves.
#[derive(Debug, Clone)]
pub struct ParseNode {
    pub token: Token,
    pub children: Vec<ParseNode>,
}

impl ParseNode {
    fn leaf(token: Token) -> Self {
        Self {
            token,
            children: Vec::new(),
        }
    }

    fn with_children(token: Token, children: Vec<ParseNode>) -> Self {
        Self { token, children }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn text(&self) -> &str {
        &self.token.text
    }
}

fn precedence(word: &str) -> u8 {
    match word.to_ascii_lowercase().as_str() {
        "or" => 1,
        "and" => 2,
        "not" => 3,
        "eq" | "ne" | "gt" | "ge" | "lt" | "le" | "has" | "in" => 4,
        "add" | "sub" => 5,
        "mul" | "div" | "divby" | "mod" => 6,
        _ => 0,
    }
}

fn is_right_assoc(word: &str) -> bool {
    word.eq_ignore_ascii_case("not")
}

/// Expected (min, max) argument count for known functions. `max = None`
/// means variadic with no upper bound. Functions not present here default to
/// exactly one argument.
fn function_arity(name: &str) -> (usize, Option<usize>) {
    match name.to_ascii_lowercase().as_str() {
        "contains" | "startswith" | "endswith" | "indexof" => (2, Some(2)),
        "substring" => (2, Some(3)),
        "concat" => (2, None),
        "length" | "tolower" | "toupper" | "trim" | "year" | "month" | "day" | "hour" | "minute"
        | "second" | "round" | "floor" | "ceiling" => (1, Some(1)),
        "now" => (0, Some(0)),
        _ => (1, Some(1)),
    }
}

const BOOLEAN_FUNCTIONS: &[&str] = &["contains", "startswith", "endswith"];

fn arity_label(min: usize, max: Option<usize>) -> String {
    match max {
        Some(max) if max == min => format!("{min}"),
        Some(max) => format!("{min}-{max}"),
        None => format!("at least {min}"),
    }
}

enum StackItem {
    /// A plain grouping paren, e.g. `(A and B)`.
    Group,
    /// A function-call paren frame: the function token and how many commas
    /// (i.e. argument boundaries) have been seen so far.
    Function { token: Token, commas: usize, has_arg: bool },
    /// An `in` value-list paren frame: the already-reduced left-hand
    /// property node, plus the comma count for its value list.
    InList { token: Token, property: ParseNode, commas: usize, has_arg: bool },
    /// A binary or unary operator awaiting reduction.
    Operator { token: Token, arity: u8 },
    /// `in` consumed its left operand and is waiting for the `(` that opens
    /// its value list.
    PendingIn { token: Token, property: ParseNode },
}

pub struct Parser {
    opstack: Vec<StackItem>,
    output: Vec<ParseNode>,
}

impl Parser {
    pub fn parse_filter(src: &str) -> Result<ParseNode> {
        let root = Self::parse(src)?;
        if !is_boolean_rooted(&root) {
            return Err(ParseError::NonBooleanFilterRoot);
        }
        Ok(root)
    }

    pub fn parse(src: &str) -> Result<ParseNode> {
        let tokens = Tokenizer::tokenize(src)?;
        if tokens.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut parser = Parser {
            opstack: Vec::new(),
            output: Vec::new(),
        };
        parser.run(tokens)?;
        parser.finish()
    }

    fn run(&mut self, tokens: Vec<Token>) -> Result<()> {
        let mut iter = tokens.into_iter().peekable();
        while let Some(tok) = iter.next() {
            match tok.kind {
                TokenKind::Property
                | TokenKind::StringLiteral
                | TokenKind::NumberLiteral
                | TokenKind::BooleanLiteral
                | TokenKind::NullLiteral
                | TokenKind::DateLiteral
                | TokenKind::TimeLiteral
                | TokenKind::DateTimeLiteral
                | TokenKind::DurationLiteral
                | TokenKind::GuidLiteral
                | TokenKind::GeographyLiteral => {
                    self.output.push(ParseNode::leaf(tok));
                }
                TokenKind::FunctionName => {
                    self.opstack.push(StackItem::Function {
                        token: tok,
                        commas: 0,
                        has_arg: false,
                    });
                }
                TokenKind::OpenParen => {
                    match self.opstack.last() {
                        Some(StackItem::Function { .. }) => {
                            // The '(' immediately following a function name
                            // is consumed implicitly; nothing to push, the
                            // Function frame already marks the boundary.
                        }
                        _ => {
                            if let Some(StackItem::PendingIn { .. }) = self.opstack.last() {
                                let item = self.opstack.pop().unwrap();
                                if let StackItem::PendingIn { token, property } = item {
                                    self.opstack.push(StackItem::InList {
                                        token,
                                        property,
                                        commas: 0,
                                        has_arg: false,
                                    });
                                }
                            } else {
                                self.opstack.push(StackItem::Group);
                            }
                        }
                    }
                }
                TokenKind::CloseParen => self.close_paren()?,
                TokenKind::Comma => self.comma()?,
                TokenKind::LogicalOp | TokenKind::ArithmeticOp => {
                    self.push_operator(tok)?;
                }
                TokenKind::ComparisonOp => {
                    if tok.text.eq_ignore_ascii_case("in") {
                        if matches!(self.opstack.last(), Some(StackItem::InList { .. }) | Some(StackItem::PendingIn { .. })) {
                            return Err(ParseError::NestedIn);
                        }
                        let property = self.output.pop().ok_or(ParseError::Unbalanced)?;
                        self.opstack.push(StackItem::PendingIn { token: tok, property });
                    } else {
                        self.push_operator(tok)?;
                    }
                }
            }
            let _ = iter.peek();
        }
        Ok(())
    }

    fn push_operator(&mut self, tok: Token) -> Result<()> {
        let is_not = tok.text.eq_ignore_ascii_case("not");
        if !is_not {
            let p = precedence(&tok.text);
            loop {
                let should_pop = match self.opstack.last() {
                    Some(StackItem::Operator { token, .. }) => {
                        let top_p = precedence(&token.text);
                        if is_right_assoc(&token.text) {
                            top_p > p
                        } else {
                            top_p >= p
                        }
                    }
                    _ => false,
                };
                if !should_pop {
                    break;
                }
                self.reduce_top()?;
            }
            self.opstack.push(StackItem::Operator { token: tok, arity: 2 });
        } else {
            self.opstack.push(StackItem::Operator { token: tok, arity: 1 });
        }
        Ok(())
    }

    fn comma(&mut self) -> Result<()> {
        loop {
            match self.opstack.last() {
                Some(StackItem::Operator { .. }) => {
                    self.reduce_top()?;
                }
                Some(StackItem::Function { .. }) | Some(StackItem::InList { .. }) => break,
                _ => return Err(ParseError::Unbalanced),
            }
        }
        match self.opstack.last_mut() {
            Some(StackItem::Function { commas, has_arg, .. }) => {
                *commas += 1;
                *has_arg = true;
            }
            Some(StackItem::InList { commas, has_arg, .. }) => {
                *commas += 1;
                *has_arg = true;
            }
            _ => return Err(ParseError::Unbalanced),
        }
        Ok(())
    }

    fn close_paren(&mut self) -> Result<()> {
        loop {
            match self.opstack.last() {
                Some(StackItem::Operator { .. }) => {
                    self.reduce_top()?;
                }
                Some(StackItem::Group) | Some(StackItem::Function { .. }) | Some(StackItem::InList { .. }) => break,
                _ => return Err(ParseError::Unbalanced),
            }
        }
        match self.opstack.pop().ok_or(ParseError::Unbalanced)? {
            StackItem::Group => {
                // The grouped expression is already the sole item on top of
                // output; nothing to do.
            }
            StackItem::Function { token, commas, has_arg } => {
                let argc = if has_arg { commas + 1 } else { 0 };
                let (min, max) = function_arity(&token.text);
                let ok = argc >= min && max.map(|m| argc <= m).unwrap_or(true);
                if !ok {
                    return Err(ParseError::ArityMismatch(
                        token.text.clone(),
                        arity_label(min, max),
                        argc,
                    ));
                }
                let mut children = Vec::with_capacity(argc);
                for _ in 0..argc {
                    children.push(self.output.pop().ok_or(ParseError::Unbalanced)?);
                }
                children.reverse();
                self.output.push(ParseNode::with_children(token, children));
            }
            StackItem::InList { token, property, commas, has_arg } => {
                let valuec = if has_arg { commas + 1 } else { 0 };
                if valuec == 0 {
                    return Err(ParseError::InMissingList);
                }
                let mut children = Vec::with_capacity(valuec + 1);
                for _ in 0..valuec {
                    children.push(self.output.pop().ok_or(ParseError::Unbalanced)?);
                }
                children.reverse();
                children.insert(0, property);
                self.output.push(ParseNode::with_children(token, children));
            }
            _ => return Err(ParseError::Unbalanced),
        }
        Ok(())
    }

    fn reduce_top(&mut self) -> Result<()> {
        match self.opstack.pop().ok_or(ParseError::Unbalanced)? {
            StackItem::Operator { token, arity } => {
                if arity == 1 {
                    let child = self.output.pop().ok_or_else(|| ParseError::DanglingOperator(token.text.clone()))?;
                    self.output.push(ParseNode::with_children(token, vec![child]));
                } else {
                    let rhs = self.output.pop().ok_or_else(|| ParseError::DanglingOperator(token.text.clone()))?;
                    let lhs = self.output.pop().ok_or_else(|| ParseError::DanglingOperator(token.text.clone()))?;
                    self.output.push(ParseNode::with_children(token, vec![lhs, rhs]));
                }
                Ok(())
            }
            other => {
                self.opstack.push(other);
                Err(ParseError::Unbalanced)
            }
        }
    }

    fn finish(mut self) -> Result<ParseNode> {
        if let Some(StackItem::PendingIn { token, .. }) = self.opstack.last() {
            return Err(ParseError::InMissingList).map_err(|_| ParseError::DanglingOperator(token.text.clone()));
        }
        while !self.opstack.is_empty() {
            match self.opstack.last() {
                Some(StackItem::Operator { .. }) => self.reduce_top()?,
                _ => return Err(ParseError::Unbalanced),
            }
        }
        match self.output.len() {
            1 => Ok(self.output.pop().unwrap()),
            0 => Err(ParseError::Empty),
            _ => Err(ParseError::Unbalanced),
        }
    }
}

fn is_boolean_rooted(node: &ParseNode) -> bool {
    match node.token.kind {
        TokenKind::LogicalOp | TokenKind::ComparisonOp => true,
        TokenKind::BooleanLiteral => true,
        TokenKind::FunctionName => BOOLEAN_FUNCTIONS.contains(&node.token.text.to_ascii_lowercase().as_str()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_comparison_tree() {
        let tree = Parser::parse_filter("Age gt 18").unwrap();
        assert_eq!(tree.text(), "gt");
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].text(), "Age");
        assert_eq!(tree.children[1].text(), "18");
    }

    #[test]
    fn and_binds_looser_than_comparison_but_tighter_than_or() {
        let tree = Parser::parse_filter("A eq 1 or B eq 2 and C eq 3").unwrap();
        assert_eq!(tree.text(), "or");
        assert_eq!(tree.children[1].text(), "and");
    }

    #[test]
    fn parenthesized_grouping_overrides_precedence() {
        let tree = Parser::parse_filter("(A eq 1 or B eq 2) and C eq 3").unwrap();
        assert_eq!(tree.text(), "and");
        assert_eq!(tree.children[0].text(), "or");
    }

    #[test]
    fn not_is_unary_and_right_associative() {
        let tree = Parser::parse_filter("not (A eq 1)").unwrap();
        assert_eq!(tree.text(), "not");
        assert_eq!(tree.children.len(), 1);
    }

    #[test]
    fn function_call_collects_arguments() {
        let tree = Parser::parse_filter("contains(Name,'an')").unwrap();
        assert_eq!(tree.text(), "contains");
        assert_eq!(tree.children.len(), 2);
    }

    #[test]
    fn in_operator_collects_property_then_values() {
        let tree = Parser::parse_filter("Status in ('A','B','C')").unwrap();
        assert_eq!(tree.text(), "in");
        assert_eq!(tree.children.len(), 4);
        assert_eq!(tree.children[0].text(), "Status");
    }

    #[test]
    fn function_arity_mismatch_is_rejected() {
        let err = Parser::parse_filter("contains(Name)").unwrap_err();
        assert!(matches!(err, ParseError::ArityMismatch(..)));
    }

    #[test]
    fn non_boolean_root_is_rejected_for_filter() {
        let err = Parser::parse_filter("Age add 1").unwrap_err();
        assert!(matches!(err, ParseError::NonBooleanFilterRoot));
    }

    #[test]
    fn nested_in_is_rejected() {
        let err = Parser::parse_filter("A eq 1 and (B in (C in (1,2)))");
        assert!(err.is_err());
    }
}
