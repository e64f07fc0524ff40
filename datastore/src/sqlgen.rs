//! Dialect-aware SQL generator. Walks a parse tree and `QueryOptions`
//! against entity metadata to emit parameterized SQL text plus an ordered
//! parameter list. Never inlines a literal into the SQL string.

use itertools::Itertools;

use crate::dialect::Dialect;
use crate::expr::ParseNode;
use crate::metadata::EntityMetadata;
use crate::query_options::{OrderByItem, QueryOptions, SortDirection};
use crate::token::TokenKind;
use crate::value::SqlValue;

#[derive(Debug, thiserror::Error)]
pub enum SqlGenError {
    #[error("unknown property `{0}`")]
    PropertyNotFound(String),
    #[error("invalid literal `{0}` for {1}")]
    InvalidLiteral(String, &'static str),
    #[error("unsupported operator `{0}` in this position")]
    UnsupportedOperator(String),
    #[error("`in` requires at least one value")]
    EmptyInList(),
    #[error("property identifier `{0}` contains disallowed characters")]
    UnsafePropertyName(String),
    #[error("empty SET clause for UPDATE")]
    EmptySet,
    #[error("empty key set for mutation")]
    EmptyKeys,
}

pub type Result<T> = std::result::Result<T, SqlGenError>;

/// Parameterized SQL plus its ordered bind values.
#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

pub struct SqlGenerator<'a> {
    pub entity: &'a EntityMetadata,
    pub dialect: Dialect,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(entity: &'a EntityMetadata, dialect: Dialect) -> Self {
        Self { entity, dialect }
    }

    fn qualified_table(&self) -> String {
        match &self.entity.schema {
            Some(schema) => format!(
                "{}.{}",
                self.dialect.quote_identifier(schema),
                self.dialect.quote_identifier(&self.entity.table)
            ),
            None => self.dialect.quote_identifier(&self.entity.table),
        }
    }

    fn resolve_column(&self, name: &str) -> Result<String> {
        if !is_safe_property_name(name) {
            return Err(SqlGenError::UnsafePropertyName(name.to_string()));
        }
        self.entity
            .find_property(name)
            .map(|p| p.column.clone())
            .ok_or_else(|| SqlGenError::PropertyNotFound(name.to_string()))
    }

    pub fn select(&self, opts: &QueryOptions) -> Result<GeneratedSql> {
        let mut params = Vec::new();
        let select_list = self.select_list(opts)?;
        let mut sql = format!("SELECT {select_list} FROM {}", self.qualified_table());

        if let Some(filter) = &opts.filter {
            let cond = self.render_node(filter, &mut params)?;
            sql.push_str(" WHERE ");
            sql.push_str(&cond);
        }

        if !opts.orderby.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.render_orderby(&opts.orderby)?);
        }

        sql = self.dialect.render_paging(&sql, opts.skip, opts.top);
        Ok(GeneratedSql { sql: sanitize(&sql), params })
    }

    pub fn count(&self, opts: &QueryOptions) -> Result<GeneratedSql> {
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.qualified_table());
        if let Some(filter) = &opts.filter {
            let cond = self.render_node(filter, &mut params)?;
            sql.push_str(" WHERE ");
            sql.push_str(&cond);
        }
        Ok(GeneratedSql { sql: sanitize(&sql), params })
    }

    fn select_list(&self, opts: &QueryOptions) -> Result<String> {
        let columns: Vec<String> = match &opts.select {
            Some(names) => names
                .iter()
                .map(|n| self.resolve_column(n))
                .collect::<Result<_>>()?,
            None => self
                .entity
                .scalar_properties()
                .map(|p| p.column.clone())
                .collect(),
        };
        Ok(columns
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .join(", "))
    }

    fn render_orderby(&self, items: &[OrderByItem]) -> Result<String> {
        items
            .iter()
            .map(|item| {
                let col = self.resolve_column(&item.property)?;
                let dir = match item.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                Ok(format!("{} {dir}", self.dialect.quote_identifier(&col)))
            })
            .collect::<Result<Vec<_>>>()
            .map(|v| v.join(", "))
    }

    /// Recursively translates a parse-tree node into a SQL fragment,
    /// appending any literal values to `params` in left-to-right order.
    fn render_node(&self, node: &ParseNode, params: &mut Vec<SqlValue>) -> Result<String> {
        match node.token.kind {
            TokenKind::Property => {
                let col = self.resolve_column(&node.token.text)?;
                Ok(self.dialect.quote_identifier(&col))
            }
            TokenKind::StringLiteral
            | TokenKind::NumberLiteral
            | TokenKind::BooleanLiteral
            | TokenKind::NullLiteral
            | TokenKind::DateLiteral
            | TokenKind::TimeLiteral
            | TokenKind::DateTimeLiteral
            | TokenKind::DurationLiteral
            | TokenKind::GuidLiteral
            | TokenKind::GeographyLiteral => {
                if node.token.kind == TokenKind::NullLiteral {
                    return Ok("NULL".to_string());
                }
                let value = literal_to_sqlvalue(node)?;
                params.push(value);
                let mut ph = String::new();
                self.dialect.write_placeholder(&mut ph, params.len());
                Ok(ph)
            }
            TokenKind::LogicalOp => self.render_logical(node, params),
            TokenKind::ComparisonOp => self.render_comparison(node, params),
            TokenKind::ArithmeticOp => self.render_arithmetic(node, params),
            TokenKind::FunctionName => self.render_function(node, params),
            _ => Err(SqlGenError::UnsupportedOperator(node.token.text.clone())),
        }
    }

    fn render_logical(&self, node: &ParseNode, params: &mut Vec<SqlValue>) -> Result<String> {
        match node.token.text.to_ascii_lowercase().as_str() {
            "not" => {
                let inner = self.render_node(&node.children[0], params)?;
                Ok(format!("NOT ({inner})"))
            }
            op @ ("and" | "or") => {
                let lhs = self.render_node(&node.children[0], params)?;
                let rhs = self.render_node(&node.children[1], params)?;
                Ok(format!("({lhs} {} {rhs})", op.to_ascii_uppercase()))
            }
            other => Err(SqlGenError::UnsupportedOperator(other.to_string())),
        }
    }

    fn render_comparison(&self, node: &ParseNode, params: &mut Vec<SqlValue>) -> Result<String> {
        let op = node.token.text.to_ascii_lowercase();
        if op == "in" {
            let property = &node.children[0];
            let col = self.render_node(property, params)?;
            let values = &node.children[1..];
            if values.is_empty() {
                return Err(SqlGenError::EmptyInList());
            }
            let mut placeholders = Vec::with_capacity(values.len());
            for v in values {
                placeholders.push(self.render_node(v, params)?);
            }
            return Ok(format!("{col} IN ({})", placeholders.join(", ")));
        }

        let lhs_node = &node.children[0];
        let rhs_node = &node.children[1];

        // `x eq null` / `x ne null` become IS [NOT] NULL.
        if rhs_node.token.kind == TokenKind::NullLiteral {
            let lhs = self.render_node(lhs_node, params)?;
            return match op.as_str() {
                "eq" => Ok(format!("{lhs} IS NULL")),
                "ne" => Ok(format!("{lhs} IS NOT NULL")),
                other => Err(SqlGenError::UnsupportedOperator(other.to_string())),
            };
        }

        if op == "has" {
            // Flags enumeration membership test; rendered as a bitwise AND
            // against the underlying integer column.
            let lhs = self.render_node(lhs_node, params)?;
            let rhs = self.render_node(rhs_node, params)?;
            return Ok(format!("(({lhs} & {rhs}) = {rhs})"));
        }

        let sql_op = match op.as_str() {
            "eq" => "=",
            "ne" => "<>",
            "gt" => ">",
            "ge" => ">=",
            "lt" => "<",
            "le" => "<=",
            other => return Err(SqlGenError::UnsupportedOperator(other.to_string())),
        };
        let lhs = self.render_node(lhs_node, params)?;
        let rhs = self.render_node(rhs_node, params)?;
        Ok(format!("({lhs} {sql_op} {rhs})"))
    }

    fn render_arithmetic(&self, node: &ParseNode, params: &mut Vec<SqlValue>) -> Result<String> {
        let lhs = self.render_node(&node.children[0], params)?;
        let rhs = self.render_node(&node.children[1], params)?;
        match node.token.text.to_ascii_lowercase().as_str() {
            "add" => Ok(format!("({lhs} + {rhs})")),
            "sub" => Ok(format!("({lhs} - {rhs})")),
            "mul" => Ok(format!("({lhs} * {rhs})")),
            "div" => Ok(format!("({lhs} / {rhs})")),
            "divby" => Ok(format!("({lhs} / {rhs})")),
            "mod" => Ok(self.dialect.modulo(&lhs, &rhs)),
            other => Err(SqlGenError::UnsupportedOperator(other.to_string())),
        }
    }

    fn render_function(&self, node: &ParseNode, params: &mut Vec<SqlValue>) -> Result<String> {
        let name = node.token.text.to_ascii_lowercase();
        let args: Vec<String> = node
            .children
            .iter()
            .map(|c| self.render_node(c, params))
            .collect::<Result<_>>()?;

        match name.as_str() {
            "contains" => Ok(format!(
                "({})",
                self.dialect.ilike_contains(&args[0], &like_wrap(&self.dialect, params, &args[1], true, true))
            )),
            "startswith" => Ok(format!(
                "({})",
                self.dialect.ilike_contains(&args[0], &like_wrap(&self.dialect, params, &args[1], false, true))
            )),
            "endswith" => Ok(format!(
                "({})",
                self.dialect.ilike_contains(&args[0], &like_wrap(&self.dialect, params, &args[1], true, false))
            )),
            "indexof" => Ok(format!("(POSITION({} IN {}) - 1)", args[1], args[0])),
            "substring" => {
                let start = format!("({} + 1)", args[1]);
                Ok(self.dialect.substring(&args[0], &start, args.get(2).map(|s| s.as_str())))
            }
            "concat" => {
                let mut acc = args[0].clone();
                for a in &args[1..] {
                    acc = self.dialect.string_concat(&acc, a);
                }
                Ok(acc)
            }
            "length" => Ok(format!("LENGTH({})", args[0])),
            "tolower" => Ok(format!("LOWER({})", args[0])),
            "toupper" => Ok(format!("UPPER({})", args[0])),
            "trim" => Ok(format!("TRIM({})", args[0])),
            "year" | "month" | "day" | "hour" | "minute" | "second" => {
                Ok(self.dialect.datetime_extract(&name, &args[0]))
            }
            "round" => Ok(format!("ROUND({})", args[0])),
            "floor" => Ok(format!("FLOOR({})", args[0])),
            "ceiling" => Ok(format!("CEILING({})", args[0])),
            "now" => Ok(self.dialect.current_timestamp().to_string()),
            _ => Err(SqlGenError::UnsupportedOperator(name)),
        }
    }

    // ---- Mutation SQL ----

    pub fn insert(&self, values: &[(String, SqlValue)]) -> Result<GeneratedSql> {
        if values.is_empty() {
            return Err(SqlGenError::EmptySet);
        }
        let mut params = Vec::with_capacity(values.len());
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        for (name, value) in values {
            let col = self.resolve_column(name)?;
            columns.push(self.dialect.quote_identifier(&col));
            params.push(value.clone());
            let mut ph = String::new();
            self.dialect.write_placeholder(&mut ph, params.len());
            placeholders.push(ph);
        }
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified_table(),
            columns.join(", "),
            placeholders.join(", ")
        );
        if self.dialect.supports_returning() {
            sql.push_str(" RETURNING *");
        }
        Ok(GeneratedSql { sql: sanitize(&sql), params })
    }

    pub fn update(&self, set: &[(String, SqlValue)], keys: &[(String, SqlValue)]) -> Result<GeneratedSql> {
        if set.is_empty() {
            return Err(SqlGenError::EmptySet);
        }
        if keys.is_empty() {
            return Err(SqlGenError::EmptyKeys);
        }
        let mut params = Vec::new();
        let mut assignments = Vec::with_capacity(set.len());
        for (name, value) in set {
            let col = self.resolve_column(name)?;
            if self.entity.find_property(name).map(|p| p.is_key).unwrap_or(false) {
                continue;
            }
            params.push(value.clone());
            let mut ph = String::new();
            self.dialect.write_placeholder(&mut ph, params.len());
            assignments.push(format!("{} = {ph}", self.dialect.quote_identifier(&col)));
        }
        if assignments.is_empty() {
            return Err(SqlGenError::EmptySet);
        }
        let where_clause = self.render_key_equality(keys, &mut params)?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.qualified_table(),
            assignments.join(", "),
            where_clause
        );
        Ok(GeneratedSql { sql: sanitize(&sql), params })
    }

    pub fn delete(&self, keys: &[(String, SqlValue)]) -> Result<GeneratedSql> {
        if keys.is_empty() {
            return Err(SqlGenError::EmptyKeys);
        }
        let mut params = Vec::new();
        let where_clause = self.render_key_equality(keys, &mut params)?;
        let sql = format!("DELETE FROM {} WHERE {}", self.qualified_table(), where_clause);
        Ok(GeneratedSql { sql: sanitize(&sql), params })
    }

    fn render_key_equality(&self, keys: &[(String, SqlValue)], params: &mut Vec<SqlValue>) -> Result<String> {
        let mut clauses = Vec::with_capacity(keys.len());
        for (name, value) in keys {
            let col = self.resolve_column(name)?;
            params.push(value.clone());
            let mut ph = String::new();
            self.dialect.write_placeholder(&mut ph, params.len());
            clauses.push(format!("{} = {ph}", self.dialect.quote_identifier(&col)));
        }
        Ok(clauses.join(" AND "))
    }
}

/// Wraps a raw string-literal argument node's rendered value with `%`
/// wildcard anchors for `contains`/`startswith`/`endswith`. Since the
/// argument has already been pushed as a bound parameter, this mutates the
/// just-pushed parameter in place rather than re-rendering it.
fn like_wrap(_dialect: &Dialect, params: &mut [SqlValue], placeholder: &str, prefix_wildcard: bool, suffix_wildcard: bool) -> String {
    if let Some(SqlValue::Text(s)) = params.last_mut() {
        let escaped = s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        *s = format!(
            "{}{escaped}{}",
            if prefix_wildcard { "%" } else { "" },
            if suffix_wildcard { "%" } else { "" }
        );
    }
    placeholder.to_string()
}

fn is_safe_property_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '/')
        && !name.contains("--")
        && !name.contains(';')
}

fn literal_to_sqlvalue(node: &ParseNode) -> Result<SqlValue> {
    if let Some(semantic) = &node.token.semantic {
        return Ok(semantic.clone());
    }
    let text = &node.token.text;
    match node.token.kind {
        TokenKind::StringLiteral => Ok(SqlValue::Text(text.clone())),
        TokenKind::NumberLiteral => {
            if text.contains('.') || text.contains('e') || text.contains('E') {
                text.parse::<f64>()
                    .map(SqlValue::Float)
                    .map_err(|_| SqlGenError::InvalidLiteral(text.clone(), "number"))
            } else {
                text.parse::<i64>()
                    .map(SqlValue::Int)
                    .map_err(|_| SqlGenError::InvalidLiteral(text.clone(), "number"))
            }
        }
        TokenKind::BooleanLiteral => Ok(SqlValue::Bool(text.eq_ignore_ascii_case("true"))),
        TokenKind::GuidLiteral => uuid::Uuid::parse_str(text)
            .map(SqlValue::Guid)
            .map_err(|_| SqlGenError::InvalidLiteral(text.clone(), "guid")),
        TokenKind::DateLiteral => time::Date::parse(
            text,
            &time::format_description::well_known::Iso8601::DATE,
        )
        .map(SqlValue::Date)
        .map_err(|_| SqlGenError::InvalidLiteral(text.clone(), "date")),
        TokenKind::TimeLiteral => {
            let padded = if text.matches(':').count() == 1 { format!("{text}:00") } else { text.clone() };
            time::Time::parse(&padded, &time::format_description::well_known::Iso8601::TIME)
                .map(SqlValue::Time)
                .map_err(|_| SqlGenError::InvalidLiteral(text.clone(), "time"))
        }
        TokenKind::DateTimeLiteral => time::OffsetDateTime::parse(
            text,
            &time::format_description::well_known::Iso8601::DATE_TIME,
        )
        .map(SqlValue::DateTime)
        .map_err(|_| SqlGenError::InvalidLiteral(text.clone(), "datetime")),
        TokenKind::DurationLiteral => parse_iso8601_duration(text)
            .map(SqlValue::Duration)
            .ok_or_else(|| SqlGenError::InvalidLiteral(text.clone(), "duration")),
        _ => Err(SqlGenError::InvalidLiteral(text.clone(), "literal")),
    }
}

/// Parses the subset of ISO-8601 durations the tokenizer can produce:
/// `PnDTnHnMnS`, any component optional. Public so the entity service can
/// apply the same parsing to a JSON request body's duration strings.
pub fn parse_iso8601_duration(text: &str) -> Option<time::Duration> {
    let negative = text.starts_with('-');
    let text = text.trim_start_matches('-');
    let text = text.strip_prefix('P')?;
    let (date_part, time_part) = match text.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (text, None),
    };
    let mut seconds: i64 = 0;
    seconds += 86400 * take_number_unit(date_part, 'D').unwrap_or(0);
    if let Some(t) = time_part {
        seconds += 3600 * take_number_unit(t, 'H').unwrap_or(0);
        seconds += 60 * take_number_unit(t, 'M').unwrap_or(0);
        seconds += take_number_unit(t, 'S').unwrap_or(0);
    }
    let total = if negative { -seconds } else { seconds };
    Some(time::Duration::seconds(total))
}

fn take_number_unit(s: &str, unit: char) -> Option<i64> {
    let idx = s.find(unit)?;
    let digits_start = s[..idx]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    s[digits_start..idx].parse::<i64>().ok()
}

/// Strips NUL bytes and ASCII control characters, collapses whitespace runs,
/// and trims a single trailing semicolon.
fn sanitize(sql: &str) -> String {
    let cleaned: String = sql
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect();
    let collapsed = cleaned.split_whitespace().join(" ");
    collapsed.trim_end_matches(';').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Parser;
    use crate::metadata::{AutoGenerate, EntityMetadata, PropertyMetadata, PropertyType};

    fn users() -> EntityMetadata {
        EntityMetadata::new(
            "Users",
            vec![
                PropertyMetadata::scalar("ID", PropertyType::Int64).key().auto(AutoGenerate::Sequence),
                PropertyMetadata::scalar("Name", PropertyType::String),
                PropertyMetadata::scalar("Age", PropertyType::Int32),
            ],
        )
    }

    #[test]
    fn select_with_filter_uses_dialect_placeholder() {
        let entity = users();
        let mut opts = QueryOptions::default();
        opts.filter = Some(Parser::parse_filter("Age gt 18").unwrap());
        let gen = SqlGenerator::new(&entity, Dialect::Postgres);
        let out = gen.select(&opts).unwrap();
        assert!(out.sql.contains("$1"));
        assert_eq!(out.params.len(), 1);
    }

    #[test]
    fn null_comparison_becomes_is_null() {
        let entity = users();
        let mut opts = QueryOptions::default();
        opts.filter = Some(Parser::parse_filter("Name eq null").unwrap());
        let gen = SqlGenerator::new(&entity, Dialect::MySql);
        let out = gen.select(&opts).unwrap();
        assert!(out.sql.contains("IS NULL"));
        assert!(out.params.is_empty());
    }

    #[test]
    fn in_operator_emits_value_list() {
        let entity = users();
        let mut opts = QueryOptions::default();
        opts.filter = Some(Parser::parse_filter("Age in (1,2,3)").unwrap());
        let gen = SqlGenerator::new(&entity, Dialect::MySql);
        let out = gen.select(&opts).unwrap();
        assert!(out.sql.contains("IN (?, ?, ?)"));
        assert_eq!(out.params.len(), 3);
    }

    #[test]
    fn unknown_property_fails() {
        let entity = users();
        let mut opts = QueryOptions::default();
        opts.filter = Some(Parser::parse_filter("Bogus eq 1").unwrap());
        let gen = SqlGenerator::new(&entity, Dialect::MySql);
        assert!(matches!(gen.select(&opts), Err(SqlGenError::PropertyNotFound(_))));
    }

    #[test]
    fn update_excludes_key_columns_from_set() {
        let entity = users();
        let gen = SqlGenerator::new(&entity, Dialect::Postgres);
        let out = gen
            .update(
                &[("ID".into(), SqlValue::Int(1)), ("Name".into(), SqlValue::Text("x".into()))],
                &[("ID".into(), SqlValue::Int(1))],
            )
            .unwrap();
        assert!(!out.sql.contains("\"ID\" = $1"));
        assert!(out.sql.contains("SET"));
    }

    #[test]
    fn insert_appends_returning_on_postgres_only() {
        let entity = users();
        let values = [("Name".into(), SqlValue::Text("a".into()))];
        let pg = SqlGenerator::new(&entity, Dialect::Postgres).insert(&values).unwrap();
        assert!(pg.sql.contains("RETURNING *"));
        let mysql = SqlGenerator::new(&entity, Dialect::MySql).insert(&values).unwrap();
        assert!(!mysql.sql.contains("RETURNING"));
    }

    #[test]
    fn oracle_paging_applies_rownum_wrapping() {
        let entity = users();
        let mut opts = QueryOptions::default();
        opts.skip = Some(10);
        opts.top = Some(5);
        let gen = SqlGenerator::new(&entity, Dialect::Oracle);
        let out = gen.select(&opts).unwrap();
        assert!(out.sql.contains("ROWNUM"));
    }

    #[test]
    fn sanitize_strips_control_chars_and_trailing_semicolon() {
        assert_eq!(sanitize("SELECT  1;\n"), "SELECT 1");
    }

    #[test]
    fn empty_set_update_rejected() {
        let entity = users();
        let gen = SqlGenerator::new(&entity, Dialect::MySql);
        assert!(matches!(gen.update(&[], &[("ID".into(), SqlValue::Int(1))]), Err(SqlGenError::EmptySet)));
    }
}
