//! Per-entity query and mutation execution, driven by an already-connected
//! [`DbConnection`] and the process-wide metadata registry. This is where
//! the OData v4 canonical execution order (`$filter` → `$orderby` →
//! `$skip`/`$top` → `$compute` → `$select` → `$expand`) is assembled from
//! the lower-level pieces in the `datastore` crate: the first three fold
//! into SQL via [`SqlGenerator`], the last three run after the row scan.

use std::collections::HashSet;

use datastore::eval;
use datastore::expand::{ExpandEngine, QueryExecutor};
use datastore::expr::ParseNode;
use datastore::metadata::{AutoGenerate, EntityMetadata, PropertyMetadata, PropertyType};
use datastore::query_options::QueryOptions;
use datastore::row::{scan_row, OrderedEntity};
use datastore::sqlgen::SqlGenerator;
use datastore::token::{Token, TokenKind};
use datastore::value::SqlValue;
use datastore::{Dialect, MetadataRegistry};

use crate::error::Result;
use crate::provider::{DbConnection, Transaction};
use utils::Error;

/// A completed `Query` call: the scanned (and compute/select/expand-
/// processed) rows, plus the total count when `$count=true` was requested.
pub struct QueryResult {
    pub rows: Vec<OrderedEntity>,
    pub count: Option<i64>,
}

pub struct EntityService<'a> {
    db: &'a DbConnection,
    registry: &'a MetadataRegistry,
    max_expand_depth: u32,
}

impl<'a> EntityService<'a> {
    pub fn new(db: &'a DbConnection, registry: &'a MetadataRegistry, max_expand_depth: u32) -> Self {
        Self { db, registry, max_expand_depth }
    }

    /// Runs the canonical-order query pipeline for a collection request.
    pub async fn query(&self, entity_name: &str, mut opts: QueryOptions) -> Result<QueryResult> {
        let entity = self.registry.require(entity_name)?;

        if let Some(raw) = opts.search.take() {
            if let Some(search_tree) = eval::search_to_filter(&raw, entity)? {
                opts.filter = Some(match opts.filter.take() {
                    Some(existing) => datastore::expand::and_node(existing, search_tree),
                    None => search_tree,
                });
            }
        }

        let count = if opts.count { Some(self.count_only(entity, &opts).await?) } else { None };

        let expand_names: HashSet<String> =
            opts.expand.iter().map(|e| e.navigation.to_ascii_lowercase()).collect();
        let gen = SqlGenerator::new(entity, self.db.dialect());
        let generated = gen.select(&opts)?;
        let raw_rows = self
            .db
            .fetch_all(&generated.sql, &generated.params)
            .await
            .map_err(Error::internal)?;

        let entity_set_url = format!("/{}", entity.name);
        let mut rows: Vec<OrderedEntity> = raw_rows
            .iter()
            .map(|cols| scan_row(entity, &entity_set_url, cols, &expand_names))
            .collect();

        for row in rows.iter_mut() {
            for binding in &opts.compute {
                let value = eval::evaluate(&binding.expr, row)?;
                row.properties.push((binding.alias.clone(), value));
            }
        }

        if let Some(select) = &opts.select {
            apply_select(entity, &mut rows, select);
        }

        if !opts.expand.is_empty() {
            let engine = ExpandEngine {
                registry: self.registry,
                dialect: self.db.dialect(),
                max_depth: self.max_expand_depth,
            };
            engine.expand_into(self.db, entity, &mut rows, &opts.expand).await?;
        }

        Ok(QueryResult { rows, count })
    }

    async fn count_only(&self, entity: &EntityMetadata, opts: &QueryOptions) -> Result<i64> {
        let gen = SqlGenerator::new(entity, self.db.dialect());
        let generated = gen.count(opts)?;
        let raw_rows = self
            .db
            .fetch_all(&generated.sql, &generated.params)
            .await
            .map_err(Error::internal)?;
        let value = raw_rows
            .first()
            .and_then(|cols| cols.first())
            .and_then(|c| c.value.as_f64())
            .unwrap_or(0.0);
        Ok(value as i64)
    }

    /// Builds a typed key-equality filter (preserving value types via the
    /// token's semantic reference rather than reformatting through text) and
    /// reuses `query`. Returns `Ok(None)` when no row matches.
    pub async fn get(
        &self,
        entity_name: &str,
        keys: &[(String, SqlValue)],
        mut opts: QueryOptions,
    ) -> Result<Option<OrderedEntity>> {
        opts.filter = Some(match opts.filter.take() {
            Some(existing) => datastore::expand::and_node(existing, key_equality_node(keys)),
            None => key_equality_node(keys),
        });
        opts.top = Some(1);
        opts.count = false;
        let mut result = self.query(entity_name, opts).await?;
        Ok(if result.rows.is_empty() { None } else { Some(result.rows.remove(0)) })
    }

    pub async fn create(&self, entity_name: &str, payload: &serde_json::Value) -> Result<OrderedEntity> {
        let mut tx = self.db.begin_transaction().await.map_err(Error::internal)?;
        let outcome = self.create_with(entity_name, payload, &mut tx).await;
        self.finish(tx, outcome).await
    }

    /// Transaction-scoped variant used to group several mutations (e.g. a
    /// batch changeset) under one caller-owned transaction instead of the
    /// per-call transaction `create` manages itself.
    pub async fn create_with(
        &self,
        entity_name: &str,
        payload: &serde_json::Value,
        tx: &mut Transaction<'_>,
    ) -> Result<OrderedEntity> {
        let entity = self.registry.require(entity_name)?;
        let mut values = extract_scalar_values(entity, payload)?;
        apply_client_side_key_defaults(entity, &mut values);

        let gen = SqlGenerator::new(entity, self.db.dialect());
        let generated = gen.insert(&values)?;
        self.create_in_transaction(entity, tx, &generated, &values).await
    }

    async fn create_in_transaction(
        &self,
        entity: &EntityMetadata,
        tx: &mut Transaction<'_>,
        generated: &datastore::sqlgen::GeneratedSql,
        values: &[(String, SqlValue)],
    ) -> Result<OrderedEntity> {
        if self.db.dialect().supports_returning() {
            let rows = tx
                .fetch_all(&generated.sql, &generated.params)
                .await
                .map_err(Error::internal)?;
            let row = rows
                .into_iter()
                .next()
                .ok_or_else(|| Error::internal(anyhow::anyhow!("insert returned no row")))?;
            return Ok(scan_row(entity, &format!("/{}", entity.name), &row, &HashSet::new()));
        }

        tx.execute(&generated.sql, &generated.params)
            .await
            .map_err(Error::internal)?;
        let key_values = self.resolve_inserted_key(entity, tx, values).await?;
        self.fetch_by_key_in_transaction(entity, tx, &key_values).await
    }

    /// Recovers the key of a just-inserted row when the dialect doesn't
    /// support `RETURNING`. MySQL exposes `LAST_INSERT_ID()`; Oracle has no
    /// portable driver-level equivalent reachable through this crate's thin
    /// binding layer, so a sequence-generated Oracle key that wasn't already
    /// present in the submitted payload can't be recovered here.
    async fn resolve_inserted_key(
        &self,
        entity: &EntityMetadata,
        tx: &mut Transaction<'_>,
        values: &[(String, SqlValue)],
    ) -> Result<Vec<(String, SqlValue)>> {
        let mut resolved = Vec::new();
        for key in entity.keys() {
            if let Some((_, v)) = values.iter().find(|(n, _)| n.eq_ignore_ascii_case(&key.name)) {
                resolved.push((key.name.clone(), v.clone()));
                continue;
            }
            if key.auto_generate == AutoGenerate::Sequence && self.db.dialect() == Dialect::MySql {
                let rows = tx
                    .fetch_all("SELECT LAST_INSERT_ID()", &[])
                    .await
                    .map_err(Error::internal)?;
                let value = rows
                    .first()
                    .and_then(|cols| cols.first())
                    .map(|c| c.value.clone())
                    .ok_or_else(|| Error::internal(anyhow::anyhow!("driver returned no last-insert-id")))?;
                resolved.push((key.name.clone(), value));
                continue;
            }
            return Err(Error::internal(anyhow::anyhow!(
                "cannot recover the generated key `{}` on `{}` for this dialect",
                key.name,
                entity.name
            )));
        }
        Ok(resolved)
    }

    async fn fetch_by_key_in_transaction(
        &self,
        entity: &EntityMetadata,
        tx: &mut Transaction<'_>,
        keys: &[(String, SqlValue)],
    ) -> Result<OrderedEntity> {
        let gen = SqlGenerator::new(entity, self.db.dialect());
        let mut opts = QueryOptions::default();
        opts.filter = Some(key_equality_node(keys));
        let generated = gen.select(&opts)?;
        let rows = tx
            .fetch_all(&generated.sql, &generated.params)
            .await
            .map_err(Error::internal)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal(anyhow::anyhow!("row vanished inside its own transaction")))?;
        Ok(scan_row(entity, &format!("/{}", entity.name), &row, &HashSet::new()))
    }

    pub async fn update(
        &self,
        entity_name: &str,
        keys: &[(String, SqlValue)],
        payload: &serde_json::Value,
    ) -> Result<OrderedEntity> {
        let mut tx = self.db.begin_transaction().await.map_err(Error::internal)?;
        let outcome = self.update_with(entity_name, keys, payload, &mut tx).await;
        self.finish(tx, outcome).await
    }

    pub async fn update_with(
        &self,
        entity_name: &str,
        keys: &[(String, SqlValue)],
        payload: &serde_json::Value,
        tx: &mut Transaction<'_>,
    ) -> Result<OrderedEntity> {
        let entity = self.registry.require(entity_name)?;
        let set = extract_scalar_values(entity, payload)?;
        let gen = SqlGenerator::new(entity, self.db.dialect());
        let generated = gen.update(&set, keys)?;
        self.update_in_transaction(entity, tx, &generated, keys, entity_name).await
    }

    async fn update_in_transaction(
        &self,
        entity: &EntityMetadata,
        tx: &mut Transaction<'_>,
        generated: &datastore::sqlgen::GeneratedSql,
        keys: &[(String, SqlValue)],
        entity_name: &str,
    ) -> Result<OrderedEntity> {
        let affected = tx
            .execute(&generated.sql, &generated.params)
            .await
            .map_err(Error::internal)?;
        if affected == 0 {
            return Err(Error::entity_not_found(anyhow::anyhow!(
                "no `{entity_name}` row matches the given key"
            )));
        }
        self.fetch_by_key_in_transaction(entity, tx, keys).await
    }

    pub async fn delete(&self, entity_name: &str, keys: &[(String, SqlValue)]) -> Result<()> {
        let mut tx = self.db.begin_transaction().await.map_err(Error::internal)?;
        let outcome = self.delete_with(entity_name, keys, &mut tx).await;
        self.finish(tx, outcome).await
    }

    pub async fn delete_with(
        &self,
        entity_name: &str,
        keys: &[(String, SqlValue)],
        tx: &mut Transaction<'_>,
    ) -> Result<()> {
        let entity = self.registry.require(entity_name)?;
        let gen = SqlGenerator::new(entity, self.db.dialect());
        let generated = gen.delete(keys)?;
        match tx.execute(&generated.sql, &generated.params).await {
            Ok(0) => Err(Error::entity_not_found(anyhow::anyhow!(
                "no `{entity_name}` row matches the given key"
            ))),
            Ok(_) => Ok(()),
            Err(e) => Err(Error::internal(e)),
        }
    }

    /// Hierarchical update: scalar fields on the entity itself plus
    /// navigation sub-objects, each classified as a delete (`@odata.removed`
    /// marker), an update (key present), or an insert (key absent), then run
    /// in one transaction ordered DELETE → UPDATE → INSERT.
    pub async fn patch(
        &self,
        entity_name: &str,
        keys: &[(String, SqlValue)],
        payload: &serde_json::Value,
    ) -> Result<OrderedEntity> {
        let mut tx = self.db.begin_transaction().await.map_err(Error::internal)?;
        let outcome = self.patch_with(entity_name, keys, payload, &mut tx).await;
        self.finish(tx, outcome).await
    }

    pub async fn patch_with(
        &self,
        entity_name: &str,
        keys: &[(String, SqlValue)],
        payload: &serde_json::Value,
        tx: &mut Transaction<'_>,
    ) -> Result<OrderedEntity> {
        let entity = self.registry.require(entity_name)?;
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::bad_request(anyhow::anyhow!("patch payload must be a JSON object")))?;

        let mut deletes: Vec<(String, Vec<(String, SqlValue)>)> = Vec::new();
        let mut updates: Vec<(String, Vec<(String, SqlValue)>, Vec<(String, SqlValue)>)> = Vec::new();
        let mut inserts: Vec<(String, Vec<(String, SqlValue)>)> = Vec::new();

        let mut own_set = Vec::new();
        for prop in entity.scalar_properties() {
            if prop.is_key {
                continue;
            }
            if let Some(v) = obj.get(&prop.name) {
                own_set.push((prop.name.clone(), json_to_sqlvalue(v, prop)?));
            }
        }
        updates.push((entity.name.clone(), keys.to_vec(), own_set));

        for nav in entity.navigation_properties() {
            let Some(value) = obj.get(&nav.name) else { continue };
            let relationship = nav.relationship.as_ref().expect("navigation without relationship");
            let related = self.registry.require(&relationship.related_entity)?;
            let parent_key_value = keys
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(&relationship.local_property))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    Error::internal(anyhow::anyhow!(
                        "patch keys do not include `{}`",
                        relationship.local_property
                    ))
                })?;

            let items: Vec<&serde_json::Value> = match value {
                serde_json::Value::Array(items) => items.iter().collect(),
                serde_json::Value::Null => Vec::new(),
                other => vec![other],
            };

            for item in items {
                let item_obj = item.as_object().ok_or_else(|| {
                    Error::bad_request(anyhow::anyhow!("`{}` sub-object must be a JSON object", nav.name))
                })?;
                let removed = item_obj.get("@odata.removed").and_then(|v| v.as_bool()).unwrap_or(false);

                let key_count = related.keys().count();
                let mut sub_keys = Vec::with_capacity(key_count);
                for k in related.keys() {
                    if let Some(v) = item_obj.get(&k.name) {
                        sub_keys.push((k.name.clone(), json_to_sqlvalue(v, k)?));
                    }
                }
                let has_keys = sub_keys.len() == key_count;

                if removed {
                    if !has_keys {
                        return Err(Error::bad_request(anyhow::anyhow!(
                            "`{}` removal requires its key",
                            nav.name
                        )));
                    }
                    deletes.push((related.name.clone(), sub_keys));
                    continue;
                }

                let mut sub_set = Vec::new();
                for prop in related.scalar_properties() {
                    if prop.is_key {
                        continue;
                    }
                    if let Some(v) = item_obj.get(&prop.name) {
                        sub_set.push((prop.name.clone(), json_to_sqlvalue(v, prop)?));
                    }
                }
                sub_set.retain(|(n, _)| !n.eq_ignore_ascii_case(&relationship.referenced_property));
                sub_set.push((relationship.referenced_property.clone(), parent_key_value.clone()));

                if has_keys {
                    updates.push((related.name.clone(), sub_keys, sub_set));
                } else {
                    for (name, sv) in &sub_keys {
                        sub_set.push((name.clone(), sv.clone()));
                    }
                    inserts.push((related.name.clone(), sub_set));
                }
            }
        }

        self.run_patch_ops(tx, &deletes, &updates, &inserts).await?;
        self.fetch_by_key_in_transaction(entity, tx, keys).await
    }

    async fn run_patch_ops(
        &self,
        tx: &mut Transaction<'_>,
        deletes: &[(String, Vec<(String, SqlValue)>)],
        updates: &[(String, Vec<(String, SqlValue)>, Vec<(String, SqlValue)>)],
        inserts: &[(String, Vec<(String, SqlValue)>)],
    ) -> Result<()> {
        for (entity_name, keys) in deletes {
            let entity = self.registry.require(entity_name)?;
            let gen = SqlGenerator::new(entity, self.db.dialect());
            let generated = gen.delete(keys)?;
            tx.execute(&generated.sql, &generated.params).await.map_err(Error::internal)?;
        }
        for (entity_name, keys, set) in updates {
            if set.is_empty() {
                continue;
            }
            let entity = self.registry.require(entity_name)?;
            let gen = SqlGenerator::new(entity, self.db.dialect());
            let generated = gen.update(set, keys)?;
            tx.execute(&generated.sql, &generated.params).await.map_err(Error::internal)?;
        }
        for (entity_name, values) in inserts {
            let entity = self.registry.require(entity_name)?;
            let gen = SqlGenerator::new(entity, self.db.dialect());
            let generated = gen.insert(values)?;
            tx.execute(&generated.sql, &generated.params).await.map_err(Error::internal)?;
        }
        Ok(())
    }

    /// Commits on success, rolls back on failure, and always hands the
    /// original result back to the caller.
    async fn finish<T>(&self, tx: Transaction<'_>, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(v) => {
                tx.commit().await.map_err(Error::internal)?;
                Ok(v)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

fn apply_select(entity: &EntityMetadata, rows: &mut [OrderedEntity], select: &HashSet<String>) {
    let keep: HashSet<String> = select.iter().map(|s| s.to_ascii_lowercase()).collect();
    let key_names: HashSet<String> = entity.keys().map(|k| k.name.to_ascii_lowercase()).collect();
    for row in rows.iter_mut() {
        row.properties
            .retain(|(name, _)| keep.contains(&name.to_ascii_lowercase()) || key_names.contains(&name.to_ascii_lowercase()));
    }
}

fn extract_scalar_values(entity: &EntityMetadata, payload: &serde_json::Value) -> Result<Vec<(String, SqlValue)>> {
    let obj = payload
        .as_object()
        .ok_or_else(|| Error::bad_request(anyhow::anyhow!("request body must be a JSON object")))?;
    let mut values = Vec::new();
    for prop in entity.scalar_properties() {
        if let Some(v) = obj.get(&prop.name) {
            values.push((prop.name.clone(), json_to_sqlvalue(v, prop)?));
        }
    }
    Ok(values)
}

/// Fills in application-generated keys (`GuidClientSide`) the client omitted.
/// Server-side sequences and server-side GUIDs are left to the backend.
fn apply_client_side_key_defaults(entity: &EntityMetadata, values: &mut Vec<(String, SqlValue)>) {
    for key in entity.keys() {
        if key.auto_generate == AutoGenerate::GuidClientSide
            && !values.iter().any(|(n, _)| n.eq_ignore_ascii_case(&key.name))
        {
            values.push((key.name.clone(), SqlValue::Guid(uuid::Uuid::new_v4())));
        }
    }
}

fn json_to_sqlvalue(value: &serde_json::Value, prop: &PropertyMetadata) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let converted = match prop.type_ {
        PropertyType::Boolean => value.as_bool().map(SqlValue::Bool),
        PropertyType::Int16 | PropertyType::Int32 | PropertyType::Int64 => value.as_i64().map(SqlValue::Int),
        PropertyType::Float32 | PropertyType::Float64 => value.as_f64().map(SqlValue::Float),
        PropertyType::String | PropertyType::Binary => value.as_str().map(|s| SqlValue::Text(s.to_string())),
        PropertyType::Guid => value
            .as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(SqlValue::Guid),
        PropertyType::Date => value
            .as_str()
            .and_then(|s| time::Date::parse(s, &time::format_description::well_known::Iso8601::DATE).ok())
            .map(SqlValue::Date),
        PropertyType::Time => value
            .as_str()
            .and_then(|s| time::Time::parse(s, &time::format_description::well_known::Iso8601::TIME).ok())
            .map(SqlValue::Time),
        PropertyType::DateTime => value
            .as_str()
            .and_then(|s| time::OffsetDateTime::parse(s, &time::format_description::well_known::Iso8601::DATE_TIME).ok())
            .map(SqlValue::DateTime),
        PropertyType::Duration => value
            .as_str()
            .and_then(datastore::sqlgen::parse_iso8601_duration)
            .map(SqlValue::Duration),
        PropertyType::Navigation => None,
    };
    converted.ok_or_else(|| {
        Error::bad_request(anyhow::anyhow!("invalid value for `{}`: expected {:?}", prop.name, prop.type_))
    })
}

fn key_equality_node(keys: &[(String, SqlValue)]) -> ParseNode {
    let mut iter = keys.iter();
    let (name, value) = iter.next().expect("key filter requires at least one key column");
    let mut acc = eq_node(name, value);
    for (name, value) in iter {
        acc = datastore::expand::and_node(acc, eq_node(name, value));
    }
    acc
}

fn eq_node(name: &str, value: &SqlValue) -> ParseNode {
    let property = ParseNode { token: Token::new(TokenKind::Property, name), children: Vec::new() };
    let literal = ParseNode { token: datastore::expand::literal_token_for(value), children: Vec::new() };
    ParseNode {
        token: Token::new(TokenKind::ComparisonOp, "eq"),
        children: vec![property, literal],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datastore::metadata::{EntityMetadata, PropertyMetadata, PropertyType};

    fn users() -> EntityMetadata {
        EntityMetadata::new(
            "Users",
            vec![
                PropertyMetadata::scalar("ID", PropertyType::Int64).key(),
                PropertyMetadata::scalar("Name", PropertyType::String),
                PropertyMetadata::scalar("Age", PropertyType::Int32),
            ],
        )
    }

    #[test]
    fn key_equality_node_combines_composite_keys_with_and() {
        let node = key_equality_node(&[("ID".into(), SqlValue::Int(1)), ("Tenant".into(), SqlValue::Text("a".into()))]);
        assert_eq!(node.token.text, "and");
    }

    #[test]
    fn apply_select_always_retains_key_columns() {
        let entity = users();
        let mut rows = vec![{
            let mut row = OrderedEntity::default();
            row.properties.push(("ID".into(), SqlValue::Int(1)));
            row.properties.push(("Name".into(), SqlValue::Text("Alice".into())));
            row.properties.push(("Age".into(), SqlValue::Int(30)));
            row
        }];
        let select: HashSet<String> = ["Name".to_string()].into_iter().collect();
        apply_select(&entity, &mut rows, &select);
        let names: Vec<&str> = rows[0].properties.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ID", "Name"]);
    }

    #[test]
    fn json_to_sqlvalue_rejects_type_mismatch() {
        let prop = PropertyMetadata::scalar("Age", PropertyType::Int32);
        let err = json_to_sqlvalue(&serde_json::json!("not a number"), &prop).unwrap_err();
        assert!(matches!(err.kind(), utils::ErrorKind::BadRequest));
    }

    #[test]
    fn json_to_sqlvalue_passes_through_null() {
        let prop = PropertyMetadata::scalar("Name", PropertyType::String);
        assert_eq!(json_to_sqlvalue(&serde_json::Value::Null, &prop).unwrap(), SqlValue::Null);
    }
}
