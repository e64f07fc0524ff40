//! Tokenizer: lexes a `$filter`/`$orderby`/`$select`/`$expand` fragment into
//! a finite, ordered sequence of `Token`s. Read-only after construction (the
//! reserved-word and function tables below are `static` slices) and safe for
//! concurrent use by many requests at once.

use serde::{Deserialize, Serialize};

use crate::value::SqlValue;

#[derive(Debug, thiserror::Error)]
pub enum TokenizeError {
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),
    #[error("malformed temporal literal `{0}`")]
    MalformedTemporal(String),
    #[error("malformed GUID literal `{0}`")]
    MalformedGuid(String),
    #[error("unknown operator word `{0}` in operator position")]
    UnknownOperatorWord(String),
    #[error("unexpected character `{0}` at byte {1}")]
    UnexpectedChar(char, usize),
}

pub type Result<T> = std::result::Result<T, TokenizeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    Property,
    StringLiteral,
    NumberLiteral,
    BooleanLiteral,
    NullLiteral,
    DateLiteral,
    TimeLiteral,
    DateTimeLiteral,
    DurationLiteral,
    GuidLiteral,
    GeographyLiteral,
    LogicalOp,
    ComparisonOp,
    ArithmeticOp,
    FunctionName,
    Comma,
    OpenParen,
    CloseParen,
}

/// A lexed token. `semantic` preserves a programmatically-constructed
/// literal's original typed value (see the key-filter construction note in
/// the entity service) so it survives independent of `text`'s formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    #[serde(skip)]
    pub semantic: Option<SqlValue>,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            semantic: None,
        }
    }

    pub fn with_semantic(mut self, value: SqlValue) -> Self {
        self.semantic = Some(value);
        self
    }

    pub fn is_logical_or_comparison(&self) -> bool {
        matches!(self.kind, TokenKind::LogicalOp | TokenKind::ComparisonOp)
    }
}

const LOGICAL_WORDS: &[&str] = &["and", "or", "not"];
const COMPARISON_WORDS: &[&str] = &["eq", "ne", "gt", "ge", "lt", "le", "has", "in"];
const ARITHMETIC_WORDS: &[&str] = &["add", "sub", "mul", "div", "divby", "mod"];
pub const FUNCTION_NAMES: &[&str] = &[
    "contains",
    "startswith",
    "endswith",
    "indexof",
    "substring",
    "concat",
    "length",
    "tolower",
    "toupper",
    "trim",
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    "round",
    "floor",
    "ceiling",
    "now",
];

fn operator_word_kind(word: &str) -> Option<TokenKind> {
    let lower = word.to_ascii_lowercase();
    if LOGICAL_WORDS.contains(&lower.as_str()) {
        Some(TokenKind::LogicalOp)
    } else if COMPARISON_WORDS.contains(&lower.as_str()) {
        Some(TokenKind::ComparisonOp)
    } else if ARITHMETIC_WORDS.contains(&lower.as_str()) {
        Some(TokenKind::ArithmeticOp)
    } else {
        None
    }
}

pub struct Tokenizer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(src: &'a str) -> Result<Vec<Token>> {
        Tokenizer::new(src).run()
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut prev_was_value_or_close = false;
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }
            let start = self.pos;
            let tok = match c {
                '(' => {
                    self.pos += 1;
                    prev_was_value_or_close = false;
                    Token::new(TokenKind::OpenParen, "(")
                }
                ')' => {
                    self.pos += 1;
                    prev_was_value_or_close = true;
                    Token::new(TokenKind::CloseParen, ")")
                }
                ',' => {
                    self.pos += 1;
                    prev_was_value_or_close = false;
                    Token::new(TokenKind::Comma, ",")
                }
                '\'' => {
                    let t = self.lex_string(start)?;
                    prev_was_value_or_close = true;
                    t
                }
                c if c.is_ascii_digit() || ((c == '-' || c == '+') && !prev_was_value_or_close) => {
                    let t = self.lex_number_or_temporal_or_guid(start)?;
                    prev_was_value_or_close = true;
                    t
                }
                c if is_ident_start(c) => {
                    let t = self.lex_word(start)?;
                    prev_was_value_or_close = !matches!(
                        t.kind,
                        TokenKind::LogicalOp
                            | TokenKind::ComparisonOp
                            | TokenKind::ArithmeticOp
                            | TokenKind::FunctionName
                    );
                    t
                }
                other => return Err(TokenizeError::UnexpectedChar(other, start)),
            };
            tokens.push(tok);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(offset)
    }

    fn lex_string(&mut self, start: usize) -> Result<Token> {
        debug_assert_eq!(self.bytes[self.pos], b'\'');
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(TokenizeError::UnterminatedString(start)),
                Some('\'') => {
                    self.pos += 1;
                    if self.peek() == Some('\'') {
                        value.push('\'');
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        Ok(Token::new(TokenKind::StringLiteral, value))
    }

    fn lex_word(&mut self, start: usize) -> Result<Token> {
        let mut end = start;
        while let Some(c) = self.src[end..].chars().next() {
            if is_ident_continue(c) {
                end += c.len_utf8();
            } else {
                break;
            }
        }
        self.pos = end;
        let word = &self.src[start..end];

        // trailing '(' and a known name => function
        let next_non_space = self.src[self.pos..].trim_start();
        if next_non_space.starts_with('(') && FUNCTION_NAMES.contains(&word.to_ascii_lowercase().as_str()) {
            return Ok(Token::new(TokenKind::FunctionName, word));
        }
        if next_non_space.starts_with('(') && is_unknown_function_call(word) {
            // Unknown function identifier followed by '(' still tokenizes as a
            // function name; arity defaulting happens in the parser.
            return Ok(Token::new(TokenKind::FunctionName, word));
        }

        match word.to_ascii_lowercase().as_str() {
            "true" => return Ok(Token::new(TokenKind::BooleanLiteral, word).with_semantic(SqlValue::Bool(true))),
            "false" => return Ok(Token::new(TokenKind::BooleanLiteral, word).with_semantic(SqlValue::Bool(false))),
            "null" => return Ok(Token::new(TokenKind::NullLiteral, word)),
            _ => {}
        }

        if is_duration_literal(word) {
            return Ok(Token::new(TokenKind::DurationLiteral, word));
        }

        if let Some(kind) = operator_word_kind(word) {
            return Ok(Token::new(kind, word));
        }

        // A reserved operator word used without proper boundaries (shouldn't
        // happen given our boundary-based lexing, kept for parity with the
        // spec's explicit failure mode) would be rejected here; anything
        // else is a plain property identifier.
        Ok(Token::new(TokenKind::Property, word))
    }

    fn lex_number_or_temporal_or_guid(&mut self, start: usize) -> Result<Token> {
        // GUID: 8-4-4-4-12 hex, optionally led by a sign is never valid, so
        // only attempt this when we're not looking at a sign.
        if self.peek().map(|c| c.is_ascii_hexdigit()).unwrap_or(false) {
            if let Some(tok) = self.try_lex_guid(start) {
                return Ok(tok);
            }
        }

        // Temporal literals start with 4 digits followed by '-' (date) or
        // contain 'T'/':' once we've consumed digits. Duration literals
        // start with 'P', a letter, so they never reach this path; they are
        // recognized in `lex_word` via `is_duration_literal` instead.
        if let Some(tok) = self.try_lex_temporal(start) {
            return Ok(tok);
        }

        self.lex_number(start)
    }

    fn try_lex_guid(&mut self, start: usize) -> Option<Token> {
        let rest = &self.src[start..];
        let guid_re_len = 36; // 8-4-4-4-12 with dashes
        if rest.len() < guid_re_len {
            return None;
        }
        let candidate = &rest[..guid_re_len];
        if is_guid_shape(candidate) {
            self.pos = start + guid_re_len;
            return Some(Token::new(TokenKind::GuidLiteral, candidate));
        }
        None
    }

    fn try_lex_temporal(&mut self, start: usize) -> Option<Token> {
        let rest = &self.src[start..];
        // date: YYYY-MM-DD
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 4 && rest.as_bytes().get(4) == Some(&b'-') {
            // scan forward while looks like date/datetime chars
            let mut end = 4;
            let bytes = rest.as_bytes();
            let is_date_char = |b: u8| b.is_ascii_digit() || b == b'-';
            while end < bytes.len() && is_date_char(bytes[end]) {
                end += 1;
            }
            if end - start >= 10 && end <= rest.len() {
                // Possibly followed by 'T' time-of-day => datetime
                if bytes.get(end) == Some(&b'T') {
                    let mut dt_end = end + 1;
                    let is_dt_char = |b: u8| {
                        b.is_ascii_digit() || matches!(b, b':' | b'.' | b'+' | b'-' | b'Z')
                    };
                    while dt_end < bytes.len() && is_dt_char(bytes[dt_end]) {
                        dt_end += 1;
                    }
                    self.pos = start + dt_end;
                    return Some(Token::new(TokenKind::DateTimeLiteral, &rest[..dt_end]));
                }
                self.pos = start + end;
                return Some(Token::new(TokenKind::DateLiteral, &rest[..end]));
            }
        }
        // time-of-day without a date prefix: HH:MM[:SS[.fff]]
        if digits == 2 && rest.as_bytes().get(2) == Some(&b':') {
            let bytes = rest.as_bytes();
            let mut end = 2;
            let is_time_char = |b: u8| b.is_ascii_digit() || matches!(b, b':' | b'.');
            while end < bytes.len() && is_time_char(bytes[end]) {
                end += 1;
            }
            self.pos = start + end;
            return Some(Token::new(TokenKind::TimeLiteral, &rest[..end]));
        }
        None
    }

    fn lex_number(&mut self, start: usize) -> Result<Token> {
        let bytes = self.bytes;
        let mut end = start;
        if bytes.get(end) == Some(&b'-') || bytes.get(end) == Some(&b'+') {
            end += 1;
        }
        let mut is_fractional = false;
        while end < bytes.len() {
            match bytes[end] {
                b'0'..=b'9' => end += 1,
                b'.' if !is_fractional => {
                    is_fractional = true;
                    end += 1;
                }
                b'e' | b'E'
                    if end + 1 < bytes.len()
                        && (bytes[end + 1].is_ascii_digit()
                            || bytes[end + 1] == b'-'
                            || bytes[end + 1] == b'+') =>
                {
                    end += 2;
                    is_fractional = true;
                }
                _ => break,
            }
        }
        self.pos = end;
        Ok(Token::new(TokenKind::NumberLiteral, &self.src[start..end]))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '/'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '/'
}

fn is_unknown_function_call(word: &str) -> bool {
    // Any identifier immediately followed by '(' that isn't a reserved
    // operator word is treated as a (possibly unregistered) function call;
    // the parser defaults its arity to one per the spec.
    operator_word_kind(word).is_none() && !word.is_empty()
}

fn is_guid_shape(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 5 {
        return false;
    }
    let expected_lens = [8, 4, 4, 4, 12];
    parts
        .iter()
        .zip(expected_lens)
        .all(|(p, len)| p.len() == len && p.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// `PnDTnHnMnS`: a leading `P`, an optional `<digits>D` date part, and an
/// optional `T<digits>H<digits>M<digits>[.<digits>]S` time part, with at
/// least one component present. Every sub-component is optional but the
/// ones that are present must appear in this order, matching what
/// `parse_iso8601_duration` accepts.
fn is_duration_literal(word: &str) -> bool {
    let bytes = word.as_bytes();
    if bytes.first() != Some(&b'P') {
        return false;
    }
    let mut i = 1;
    let mut saw_component = false;

    if let Some(digits_end) = digit_run_end(bytes, i) {
        if bytes.get(digits_end) == Some(&b'D') {
            i = digits_end + 1;
            saw_component = true;
        }
    }

    if bytes.get(i) == Some(&b'T') {
        let time_start = i;
        i += 1;
        if let Some(digits_end) = digit_run_end(bytes, i) {
            if bytes.get(digits_end) == Some(&b'H') {
                i = digits_end + 1;
                saw_component = true;
            }
        }
        if let Some(digits_end) = digit_run_end(bytes, i) {
            if bytes.get(digits_end) == Some(&b'M') {
                i = digits_end + 1;
                saw_component = true;
            }
        }
        if let Some(mut digits_end) = digit_run_end(bytes, i) {
            if bytes.get(digits_end) == Some(&b'.') {
                if let Some(frac_end) = digit_run_end(bytes, digits_end + 1) {
                    digits_end = frac_end;
                }
            }
            if bytes.get(digits_end) == Some(&b'S') {
                i = digits_end + 1;
                saw_component = true;
            }
        }
        if i == time_start + 1 {
            // 'T' with no H/M/S component after it is not a valid duration.
            return false;
        }
    }

    saw_component && i == bytes.len()
}

/// Index just past a (possibly empty) run of ASCII digits starting at `i`;
/// `None` if there are no digits there at all.
fn digit_run_end(bytes: &[u8], i: usize) -> Option<usize> {
    let mut end = i;
    while bytes.get(end).map(u8::is_ascii_digit).unwrap_or(false) {
        end += 1;
    }
    if end > i {
        Some(end)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Tokenizer::tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_simple_comparison() {
        let toks = Tokenizer::tokenize("Age gt 18").unwrap();
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[0].kind, TokenKind::Property);
        assert_eq!(toks[1].kind, TokenKind::ComparisonOp);
        assert_eq!(toks[2].kind, TokenKind::NumberLiteral);
    }

    #[test]
    fn reserved_word_as_identifier_when_not_operator_position() {
        // "and" used as a property name in a context where it's immediately
        // a standalone identifier is still lexed as an operator word by the
        // tokenizer (boundary disambiguation is positional and handled by
        // the parser's grammar, not the lexer) -- but a word that merely
        // *looks* like an operator while embedded in a longer identifier
        // must not be split.
        assert_eq!(kinds("android eq 1"), vec![
            TokenKind::Property,
            TokenKind::ComparisonOp,
            TokenKind::NumberLiteral
        ]);
    }

    #[test]
    fn string_with_escaped_quote() {
        let toks = Tokenizer::tokenize("Name eq 'O''Brien'").unwrap();
        assert_eq!(toks[2].text, "O'Brien");
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(matches!(
            Tokenizer::tokenize("Name eq 'abc"),
            Err(TokenizeError::UnterminatedString(_))
        ));
    }

    #[test]
    fn function_call_recognized() {
        let toks = Tokenizer::tokenize("contains(Name,'an')").unwrap();
        assert_eq!(toks[0].kind, TokenKind::FunctionName);
    }

    #[test]
    fn guid_literal() {
        let toks = Tokenizer::tokenize("ID eq 01234567-89ab-cdef-0123-456789abcdef").unwrap();
        assert_eq!(toks[2].kind, TokenKind::GuidLiteral);
    }

    #[test]
    fn date_and_datetime_literals() {
        let toks = Tokenizer::tokenize("Created eq 2024-01-02").unwrap();
        assert_eq!(toks[2].kind, TokenKind::DateLiteral);
        let toks = Tokenizer::tokenize("Created eq 2024-01-02T10:00:00Z").unwrap();
        assert_eq!(toks[2].kind, TokenKind::DateTimeLiteral);
    }

    #[test]
    fn negative_number_literal() {
        let toks = Tokenizer::tokenize("Balance eq -5.5").unwrap();
        assert_eq!(toks[2].kind, TokenKind::NumberLiteral);
        assert_eq!(toks[2].text, "-5.5");
    }

    #[test]
    fn duration_literal() {
        let toks = Tokenizer::tokenize("Elapsed eq P1DT2H3M4S").unwrap();
        assert_eq!(toks[2].kind, TokenKind::DurationLiteral);
        assert_eq!(toks[2].text, "P1DT2H3M4S");

        let toks = Tokenizer::tokenize("Elapsed eq PT30M").unwrap();
        assert_eq!(toks[2].kind, TokenKind::DurationLiteral);
    }

    #[test]
    fn property_starting_with_p_is_not_a_duration() {
        let toks = Tokenizer::tokenize("Price eq 5").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Property);
    }
}
