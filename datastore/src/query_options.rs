//! Parses the raw HTTP query string into a `QueryOptions` value: the filter
//! tree, orderby list, select set, expand graph, paging, count flag,
//! `$compute` bindings, and `$search` expression.

use std::collections::HashSet;

use crate::expr::{ParseError, ParseNode, Parser};

#[derive(Debug, thiserror::Error)]
pub enum QueryOptionError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unknown query option `{0}`")]
    UnknownOption(String),
    #[error("duplicate query option `{0}`")]
    DuplicateOption(String),
    #[error("`{0}` must be a non-negative integer, found `{1}`")]
    NotNonNegativeInteger(String, String),
    #[error("`$top` of {0} exceeds the maximum of {1}")]
    TopExceedsMax(u64, u64),
    #[error("`$count` must be one of true/false/1/0/t/f, found `{0}`")]
    InvalidCount(String),
    #[error("malformed `$expand` item `{0}`")]
    MalformedExpand(String),
    #[error("malformed `$compute` expression `{0}`")]
    MalformedCompute(String),
}

pub type Result<T> = std::result::Result<T, QueryOptionError>;

/// Governs how unknown and duplicated `$`-prefixed keys are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceMode {
    /// Unknown keys fail; duplicates fail.
    Strict,
    /// Unknown keys are silently dropped; duplicates fail.
    IgnoreUnknownKeywords,
    /// Duplicates keep the first occurrence; unknowns fail.
    IgnoreDuplicateKeywords,
}

impl Default for ComplianceMode {
    fn default() -> Self {
        ComplianceMode::Strict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderByItem {
    pub property: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone)]
pub struct ComputeBinding {
    pub expr: ParseNode,
    pub alias: String,
}

#[derive(Debug, Clone)]
pub struct ExpandItem {
    pub navigation: String,
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub filter: Option<ParseNode>,
    pub orderby: Vec<OrderByItem>,
    pub select: Option<HashSet<String>>,
    pub expand: Vec<ExpandItem>,
    pub skip: Option<u64>,
    pub top: Option<u64>,
    pub count: bool,
    pub compute: Vec<ComputeBinding>,
    /// Raw `$search` text; rewritten into a filter tree by
    /// [`crate::eval::search_to_filter`] once the target entity's searchable
    /// properties are known, not parsed as filter syntax here.
    pub search: Option<String>,
}

const KNOWN_OPTIONS: &[&str] = &[
    "$filter", "$orderby", "$select", "$expand", "$skip", "$top", "$count", "$compute", "$search",
];

pub struct QueryOptionParser {
    pub compliance: ComplianceMode,
    pub max_top: u64,
    pub max_expand_depth: u32,
}

impl Default for QueryOptionParser {
    fn default() -> Self {
        Self {
            compliance: ComplianceMode::Strict,
            max_top: 1000,
            max_expand_depth: 5,
        }
    }
}

impl QueryOptionParser {
    pub fn parse(&self, query: &str) -> Result<QueryOptions> {
        self.parse_at_depth(query, 0)
    }

    fn parse_at_depth(&self, query: &str, depth: u32) -> Result<QueryOptions> {
        let pairs = split_query_pairs(query);
        let mut seen: HashSet<String> = HashSet::new();
        let mut opts = QueryOptions::default();

        for (raw_key, raw_value) in pairs {
            let key_lower = raw_key.to_ascii_lowercase();
            if key_lower.starts_with('$') {
                if !KNOWN_OPTIONS.contains(&key_lower.as_str()) {
                    match self.compliance {
                        ComplianceMode::IgnoreUnknownKeywords => continue,
                        _ => return Err(QueryOptionError::UnknownOption(raw_key)),
                    }
                }
                if !seen.insert(key_lower.clone()) {
                    match self.compliance {
                        ComplianceMode::IgnoreDuplicateKeywords => continue,
                        _ => return Err(QueryOptionError::DuplicateOption(raw_key)),
                    }
                }
            } else {
                // Non-`$`-prefixed keys (e.g. custom alias bindings used by
                // `$compute`) are left for the caller; silently ignored here.
                continue;
            }

            match key_lower.as_str() {
                "$filter" => opts.filter = Some(Parser::parse_filter(&raw_value)?),
                "$orderby" => opts.orderby = parse_orderby(&raw_value)?,
                "$select" => opts.select = Some(parse_select(&raw_value)),
                "$expand" => opts.expand = self.parse_expand(&raw_value, depth)?,
                "$skip" => opts.skip = Some(parse_non_negative(&raw_key, &raw_value)?),
                "$top" => {
                    let top = parse_non_negative(&raw_key, &raw_value)?;
                    if top > self.max_top {
                        return Err(QueryOptionError::TopExceedsMax(top, self.max_top));
                    }
                    opts.top = Some(top);
                }
                "$count" => opts.count = parse_count(&raw_value)?,
                "$compute" => opts.compute = parse_compute(&raw_value)?,
                "$search" => opts.search = Some(raw_value.clone()),
                _ => unreachable!("filtered by KNOWN_OPTIONS above"),
            }
        }

        Ok(opts)
    }

    fn parse_expand(&self, raw: &str, depth: u32) -> Result<Vec<ExpandItem>> {
        if depth + 1 > self.max_expand_depth {
            return Err(QueryOptionError::MalformedExpand(raw.to_string()));
        }
        let mut items = Vec::new();
        for part in split_top_level(raw, ',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (nav, nested) = match part.find('(') {
                Some(open) => {
                    if !part.ends_with(')') {
                        return Err(QueryOptionError::MalformedExpand(part.to_string()));
                    }
                    (part[..open].trim().to_string(), Some(&part[open + 1..part.len() - 1]))
                }
                None => (part.to_string(), None),
            };
            if nav.is_empty() {
                return Err(QueryOptionError::MalformedExpand(part.to_string()));
            }
            let nested_query = nested
                .map(|inner| expand_suboptions_to_query_string(inner))
                .transpose()?
                .unwrap_or_default();
            let nested_opts = self.parse_at_depth(&nested_query, depth + 1)?;
            items.push(ExpandItem {
                navigation: nav,
                options: nested_opts,
            });
        }
        Ok(items)
    }
}

/// `$expand=Orders(filter=Amount gt 10;top=5)` uses `;`-separated
/// `option=value` pairs instead of `&`-separated `$option=value` ones;
/// normalize into an ordinary query string so the same parser can recurse.
fn expand_suboptions_to_query_string(inner: &str) -> Result<String> {
    let mut out = Vec::new();
    for pair in split_top_level(inner, ';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let eq = pair
            .find('=')
            .ok_or_else(|| QueryOptionError::MalformedExpand(pair.to_string()))?;
        let (k, v) = (pair[..eq].trim(), &pair[eq + 1..]);
        let k = if k.starts_with('$') { k.to_string() } else { format!("${k}") };
        out.push(format!("{k}={v}"));
    }
    Ok(out.join("&"))
}

/// Splits on `sep` but only at paren-nesting depth zero, so a nested
/// `$expand` item's own parenthesized sub-options aren't mistaken for a
/// sibling boundary.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn split_query_pairs(query: &str) -> Vec<(String, String)> {
    let query = query.trim_start_matches('?');
    split_top_level(query, '&')
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.find('=') {
            Some(eq) => (
                urlencoding_decode(&pair[..eq]),
                urlencoding_decode(&pair[eq + 1..]),
            ),
            None => (urlencoding_decode(&pair), String::new()),
        })
        .collect()
}

fn urlencoding_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

fn parse_orderby(raw: &str) -> Result<Vec<OrderByItem>> {
    let mut items = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut tokens = part.split_whitespace();
        let property = tokens
            .next()
            .ok_or_else(|| QueryOptionError::MalformedCompute(part.to_string()))?
            .to_string();
        let direction = match tokens.next().map(|d| d.to_ascii_lowercase()) {
            None => SortDirection::Asc,
            Some(ref d) if d == "asc" => SortDirection::Asc,
            Some(ref d) if d == "desc" => SortDirection::Desc,
            Some(other) => return Err(QueryOptionError::MalformedCompute(other)),
        };
        items.push(OrderByItem { property, direction });
    }
    Ok(items)
}

fn parse_select(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_non_negative(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| QueryOptionError::NotNonNegativeInteger(key.to_string(), raw.to_string()))
}

fn parse_count(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "t" => Ok(true),
        "false" | "0" | "f" => Ok(false),
        other => Err(QueryOptionError::InvalidCount(other.to_string())),
    }
}

/// `$compute=Amount mul Quantity as Total,...`
fn parse_compute(raw: &str) -> Result<Vec<ComputeBinding>> {
    let mut bindings = Vec::new();
    for part in split_top_level(raw, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let as_pos = find_word_boundary(part, "as")
            .ok_or_else(|| QueryOptionError::MalformedCompute(part.to_string()))?;
        let (expr_src, alias_src) = (part[..as_pos].trim(), part[as_pos + 2..].trim());
        if alias_src.is_empty() {
            return Err(QueryOptionError::MalformedCompute(part.to_string()));
        }
        let expr = Parser::parse(expr_src)?;
        bindings.push(ComputeBinding {
            expr,
            alias: alias_src.to_string(),
        });
    }
    Ok(bindings)
}

fn find_word_boundary(haystack: &str, word: &str) -> Option<usize> {
    let lower = haystack.to_ascii_lowercase();
    let mut start = 0;
    while let Some(rel) = lower[start..].find(word) {
        let idx = start + rel;
        let before_ok = idx == 0 || !lower.as_bytes()[idx - 1].is_ascii_alphanumeric();
        let after = idx + word.len();
        let after_ok = after >= lower.len() || !lower.as_bytes()[after].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return Some(idx);
        }
        start = idx + word.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paging_and_count() {
        let opts = QueryOptionParser::default().parse("$top=10&$skip=5&$count=true").unwrap();
        assert_eq!(opts.top, Some(10));
        assert_eq!(opts.skip, Some(5));
        assert!(opts.count);
    }

    #[test]
    fn rejects_negative_top() {
        let err = QueryOptionParser::default().parse("$top=-1").unwrap_err();
        assert!(matches!(err, QueryOptionError::NotNonNegativeInteger(..)));
    }

    #[test]
    fn caps_top_at_policy_max() {
        let parser = QueryOptionParser { max_top: 100, ..Default::default() };
        let err = parser.parse("$top=200").unwrap_err();
        assert!(matches!(err, QueryOptionError::TopExceedsMax(200, 100)));
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let err = QueryOptionParser::default().parse("$bogus=1").unwrap_err();
        assert!(matches!(err, QueryOptionError::UnknownOption(_)));
    }

    #[test]
    fn ignore_unknown_mode_drops_unknown_keys() {
        let parser = QueryOptionParser { compliance: ComplianceMode::IgnoreUnknownKeywords, ..Default::default() };
        let opts = parser.parse("$bogus=1&$top=5").unwrap();
        assert_eq!(opts.top, Some(5));
    }

    #[test]
    fn strict_mode_rejects_duplicates() {
        let err = QueryOptionParser::default().parse("$top=1&$top=2").unwrap_err();
        assert!(matches!(err, QueryOptionError::DuplicateOption(_)));
    }

    #[test]
    fn ignore_duplicates_mode_keeps_first() {
        let parser = QueryOptionParser { compliance: ComplianceMode::IgnoreDuplicateKeywords, ..Default::default() };
        let opts = parser.parse("$top=1&$top=2").unwrap();
        assert_eq!(opts.top, Some(1));
    }

    #[test]
    fn orderby_with_explicit_directions() {
        let opts = QueryOptionParser::default().parse("$orderby=Name desc,Age asc").unwrap();
        assert_eq!(opts.orderby.len(), 2);
        assert_eq!(opts.orderby[0].direction, SortDirection::Desc);
        assert_eq!(opts.orderby[1].direction, SortDirection::Asc);
    }

    #[test]
    fn nested_expand_suboptions_parse_recursively() {
        let opts = QueryOptionParser::default()
            .parse("$expand=Orders(filter=Amount gt 10;top=5)")
            .unwrap();
        assert_eq!(opts.expand.len(), 1);
        assert_eq!(opts.expand[0].navigation, "Orders");
        assert_eq!(opts.expand[0].options.top, Some(5));
        assert!(opts.expand[0].options.filter.is_some());
    }

    #[test]
    fn search_is_kept_as_raw_text() {
        let opts = QueryOptionParser::default().parse("$search=alice+cat").unwrap();
        assert_eq!(opts.search.as_deref(), Some("alice cat"));
    }

    #[test]
    fn compute_binding_parses_alias() {
        let opts = QueryOptionParser::default().parse("$compute=Amount mul Quantity as Total").unwrap();
        assert_eq!(opts.compute.len(), 1);
        assert_eq!(opts.compute[0].alias, "Total");
    }
}
