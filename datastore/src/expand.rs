//! Batched `$expand` resolution. One query per navigation property per
//! nesting level, keyed by the distinct set of referenced foreign-key
//! values collected from the parent level's rows — never one query per
//! parent row, which is the N+1 pattern this engine exists to avoid.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::dialect::Dialect;
use crate::metadata::{EntityMetadata, MetadataRegistry, Relationship};
use crate::query_options::{ExpandItem, QueryOptions};
use crate::row::{scan_row, OrderedEntity, RawColumn};
use crate::sqlgen::SqlGenerator;
use crate::value::SqlValue;

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("expand depth exceeds the configured maximum of {0}")]
    DepthExceeded(u32),
    #[error("unknown navigation property `{0}`")]
    UnknownNavigation(String),
    #[error(transparent)]
    Metadata(#[from] crate::metadata::MetadataError),
    #[error(transparent)]
    SqlGen(#[from] crate::sqlgen::SqlGenError),
    #[error("backend error: {0}")]
    Backend(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ExpandError>;

/// Abstracts the one thing the expand engine needs from a live connection:
/// run parameterized SQL and get back raw decoded columns per row. The
/// concrete implementation (per-backend `sqlx` pool) lives in the server
/// crate; the datastore crate never talks to a driver directly.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> anyhow::Result<Vec<Vec<RawColumn>>>;
}

pub struct ExpandEngine<'a> {
    pub registry: &'a MetadataRegistry,
    pub dialect: Dialect,
    pub max_depth: u32,
}

impl<'a> ExpandEngine<'a> {
    pub fn new(registry: &'a MetadataRegistry, dialect: Dialect) -> Self {
        Self { registry, dialect, max_depth: 5 }
    }

    /// Resolves every `ExpandItem` in `items` against `parents` (the
    /// already-scanned rows of the owning entity) and splices the results
    /// into each parent's navigation slot, keyed by navigation name.
    pub async fn expand(
        &self,
        executor: &dyn QueryExecutor,
        owning_entity: &EntityMetadata,
        parents: &mut [OrderedEntity],
        items: &[ExpandItem],
        depth: u32,
    ) -> Result<HashMap<String, Vec<OrderedEntity>>> {
        if depth >= self.max_depth {
            return Err(ExpandError::DepthExceeded(self.max_depth));
        }
        let mut result = HashMap::new();
        for item in items {
            let Some(nav) = owning_entity.find_navigation(&item.navigation) else {
                log::warn!(
                    "$expand references unknown navigation `{}` on `{}`; leaving navigation links as-is",
                    item.navigation,
                    owning_entity.name
                );
                continue;
            };
            let relationship = nav.relationship.as_ref().expect("navigation without relationship");
            let related = match self.registry.require(&relationship.related_entity) {
                Ok(related) => related,
                Err(err) => {
                    log::warn!(
                        "$expand target `{}` for navigation `{}` is unresolvable ({err}); leaving navigation links as-is",
                        relationship.related_entity,
                        item.navigation
                    );
                    continue;
                }
            };

            let keys: Vec<SqlValue> = parents
                .iter()
                .filter_map(|p| p.get(&relationship.local_property).cloned())
                .filter(|v| !v.is_null())
                .collect();
            let distinct_keys = dedup_values(keys);
            if distinct_keys.is_empty() {
                continue;
            }

            match self
                .fetch_related(executor, related, relationship, &distinct_keys, &item.options, depth)
                .await
            {
                Ok(children) => {
                    result.insert(item.navigation.to_ascii_lowercase(), children);
                }
                Err(ExpandError::DepthExceeded(max)) => return Err(ExpandError::DepthExceeded(max)),
                Err(err) => {
                    log::warn!(
                        "$expand of `{}` failed ({err}); leaving navigation links as-is",
                        item.navigation
                    );
                    continue;
                }
            }
        }
        Ok(result)
    }

    /// Resolves `items` against `parents` and splices the results directly
    /// into each parent's `expanded` slot. This is the entry point external
    /// callers (the entity service) use; `expand` alone only resolves and
    /// returns the grouped children, since it also drives the recursive
    /// per-level splicing internally.
    pub async fn expand_into(
        &self,
        executor: &dyn QueryExecutor,
        owning_entity: &EntityMetadata,
        parents: &mut [OrderedEntity],
        items: &[ExpandItem],
    ) -> Result<()> {
        let by_nav = self.expand(executor, owning_entity, parents, items, 0).await?;
        splice_navigations(owning_entity, parents, by_nav);
        Ok(())
    }

    async fn fetch_related(
        &self,
        executor: &dyn QueryExecutor,
        related: &EntityMetadata,
        relationship: &Relationship,
        keys: &[SqlValue],
        nested_options: &QueryOptions,
        depth: u32,
    ) -> Result<Vec<OrderedEntity>> {
        let gen = SqlGenerator::new(related, self.dialect);
        let mut opts = nested_options.clone();
        let in_node = build_in_node(&relationship.referenced_property, keys);
        opts.filter = Some(match opts.filter.take() {
            Some(existing) => and_node(existing, in_node),
            None => in_node,
        });

        let generated = gen.select(&opts)?;
        let rows = executor
            .fetch_all(&generated.sql, &generated.params)
            .await
            .map_err(ExpandError::Backend)?;

        let entity_set_url = format!("/{}", related.name);
        let nested_expand_names: HashSet<String> = nested_options
            .expand
            .iter()
            .map(|e| e.navigation.to_ascii_lowercase())
            .collect();

        let mut scanned: Vec<OrderedEntity> = rows
            .iter()
            .map(|cols| scan_row(related, &entity_set_url, cols, &nested_expand_names))
            .collect();

        if !nested_options.expand.is_empty() {
            // `Box::pin` sidesteps the recursive-async-fn size problem: this
            // function calls itself (indirectly, via `expand`) one level
            // deeper per nesting of `$expand(...)`.
            let nested = Box::pin(self.expand(executor, related, &mut scanned, &nested_options.expand, depth + 1)).await?;
            splice_navigations(related, &mut scanned, nested);
        }

        Ok(scanned)
    }
}

fn dedup_values(mut values: Vec<SqlValue>) -> Vec<SqlValue> {
    values.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    values.dedup_by(|a, b| a == b);
    values
}

fn build_in_node(property: &str, keys: &[SqlValue]) -> crate::expr::ParseNode {
    use crate::expr::ParseNode;
    use crate::token::{Token, TokenKind};

    let prop_node = ParseNode {
        token: Token::new(TokenKind::Property, property),
        children: Vec::new(),
    };
    let mut children = vec![prop_node];
    for key in keys {
        children.push(ParseNode {
            token: literal_token_for(key),
            children: Vec::new(),
        });
    }
    ParseNode {
        token: Token::new(crate::token::TokenKind::ComparisonOp, "in"),
        children,
    }
}

pub fn literal_token_for(value: &SqlValue) -> crate::token::Token {
    use crate::token::{Token, TokenKind};
    let kind = match value {
        SqlValue::Text(_) => TokenKind::StringLiteral,
        SqlValue::Int(_) | SqlValue::Float(_) => TokenKind::NumberLiteral,
        SqlValue::Bool(_) => TokenKind::BooleanLiteral,
        SqlValue::Guid(_) => TokenKind::GuidLiteral,
        SqlValue::Date(_) => TokenKind::DateLiteral,
        SqlValue::Time(_) => TokenKind::TimeLiteral,
        SqlValue::DateTime(_) => TokenKind::DateTimeLiteral,
        SqlValue::Duration(_) => TokenKind::DurationLiteral,
        SqlValue::Null => TokenKind::NullLiteral,
    };
    // `semantic` preserves the typed value so the SQL generator binds it
    // directly instead of re-parsing `value.to_string()` (which would lose
    // type identity for e.g. a GUID rendered without dashes normalized).
    Token::new(kind, value.to_string()).with_semantic(value.clone())
}

pub fn and_node(lhs: crate::expr::ParseNode, rhs: crate::expr::ParseNode) -> crate::expr::ParseNode {
    use crate::expr::ParseNode;
    use crate::token::{Token, TokenKind};
    ParseNode {
        token: Token::new(TokenKind::LogicalOp, "and"),
        children: vec![lhs, rhs],
    }
}

/// Groups each navigation's children back onto their owning parent rows by
/// matching `local_property` against the child's `referenced_property`.
/// Collection navigations get every matching child; single-valued ones get
/// the first match.
fn splice_navigations(
    owning_entity: &EntityMetadata,
    parents: &mut [OrderedEntity],
    mut by_nav: HashMap<String, Vec<OrderedEntity>>,
) {
    for nav in owning_entity.navigation_properties() {
        let Some(children) = by_nav.remove(&nav.name.to_ascii_lowercase()) else { continue };
        let relationship = nav.relationship.as_ref().expect("navigation without relationship");
        for parent in parents.iter_mut() {
            let Some(local_value) = parent.get(&relationship.local_property).cloned() else { continue };
            let matches: Vec<OrderedEntity> = children
                .iter()
                .filter(|c| c.get(&relationship.referenced_property) == Some(&local_value))
                .cloned()
                .collect();
            let json = if nav.is_collection {
                serde_json::Value::Array(matches.iter().map(|e| serde_json::Value::Object(e.to_json_object())).collect())
            } else {
                matches
                    .first()
                    .map(|e| serde_json::Value::Object(e.to_json_object()))
                    .unwrap_or(serde_json::Value::Null)
            };
            parent.expanded.push((nav.name.clone(), json));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_values_removes_duplicates() {
        let values = vec![SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(1)];
        assert_eq!(dedup_values(values).len(), 2);
    }

    #[test]
    fn build_in_node_has_property_then_value_children() {
        let node = build_in_node("CustomerID", &[SqlValue::Int(1), SqlValue::Int(2)]);
        assert_eq!(node.children.len(), 3);
        assert_eq!(node.children[0].text(), "CustomerID");
    }
}
