//! Row scanning: turns a raw, already-decoded column set into an
//! insertion-ordered entity representation. The actual database-driver row
//! type is a server-crate concern (different per backend); this module only
//! needs a column name and a `SqlValue`, so it stays backend-agnostic.

use std::collections::HashSet;

use serde::Serialize;

use crate::metadata::EntityMetadata;
use crate::value::SqlValue;

/// One decoded database column: its name as returned by the driver (which
/// may be the column name, not necessarily matching metadata's logical
/// name) and its already-typed value.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub value: SqlValue,
}

/// The row-scan result: properties and navigation links both preserve
/// insertion order, which is a visible contract of the JSON serializer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderedEntity {
    #[serde(flatten, serialize_with = "serialize_ordered_pairs")]
    pub properties: Vec<(String, SqlValue)>,
    #[serde(skip)]
    pub navigation_links: Vec<(String, String)>,
    /// Columns present in the result set that metadata didn't declare;
    /// retained for debug/projection safety rather than silently dropped.
    #[serde(skip)]
    pub undeclared: Vec<(String, SqlValue)>,
    /// Navigation properties the expand engine has already resolved into
    /// nested JSON, keyed by navigation name; kept separate from
    /// `properties` since its values are full JSON trees, not `SqlValue`
    /// scalars.
    #[serde(skip)]
    pub expanded: Vec<(String, serde_json::Value)>,
}

fn serialize_ordered_pairs<S>(pairs: &[(String, SqlValue)], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(pairs.len()))?;
    for (k, v) in pairs {
        map.serialize_entry(k, &v.to_json())?;
    }
    map.end()
}

impl OrderedEntity {
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Appends `"<name>@odata.navigationLink"` entries for serialization;
    /// called by the JSON envelope writer, kept separate from `properties`
    /// so `$select` trimming never has to special-case navigation links.
    pub fn to_json_object(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.properties {
            map.insert(name.clone(), value.to_json());
        }
        for (name, url) in &self.navigation_links {
            map.insert(format!("{name}@odata.navigationLink"), serde_json::Value::String(url.clone()));
        }
        for (name, value) in &self.undeclared {
            map.insert(name.clone(), value.to_json());
        }
        for (name, value) in &self.expanded {
            map.insert(name.clone(), value.clone());
        }
        map
    }
}

/// Scans one row's columns into an `OrderedEntity`. `expanded` lists the
/// navigation properties the caller is about to resolve separately (via the
/// expand engine); those are skipped here rather than getting a synthesized
/// link, since the caller will replace them with inlined expansion data.
pub fn scan_row(
    entity: &EntityMetadata,
    entity_set_url: &str,
    columns: &[RawColumn],
    expanded: &HashSet<String>,
) -> OrderedEntity {
    let mut out = OrderedEntity::default();
    let mut consumed = vec![false; columns.len()];

    for prop in entity.scalar_properties() {
        let found = columns.iter().enumerate().find(|(_, c)| {
            c.name.eq_ignore_ascii_case(&prop.column) || c.name.eq_ignore_ascii_case(&prop.name)
        });
        let value = match found {
            Some((idx, col)) => {
                consumed[idx] = true;
                convert_type(&col.value, prop.type_)
            }
            None => SqlValue::Null,
        };
        out.properties.push((prop.name.clone(), value));
    }

    let key_value = entity
        .keys()
        .next()
        .and_then(|k| out.get(&k.name))
        .map(|v| v.to_string())
        .unwrap_or_default();

    for nav in entity.navigation_properties() {
        if expanded.contains(&nav.name.to_ascii_lowercase()) {
            continue;
        }
        let url = format!("{entity_set_url}({key_value})/{}", nav.name);
        out.navigation_links.push((nav.name.clone(), url));
    }

    for (idx, col) in columns.iter().enumerate() {
        if !consumed[idx] {
            out.undeclared.push((col.name.clone(), col.value.clone()));
        }
    }

    out
}

/// Widens/narrows a decoded value toward a property's declared semantic
/// type. `[]byte`-as-string and 0/1-as-boolean coercions are handled by the
/// provider before values reach here; this only handles numeric widening and
/// the native-bool/int boolean forms that survive independent of driver.
fn convert_type(value: &SqlValue, declared: crate::metadata::PropertyType) -> SqlValue {
    use crate::metadata::PropertyType as PT;
    match (value, declared) {
        (SqlValue::Int(i), PT::Boolean) => SqlValue::Bool(*i != 0),
        (SqlValue::Int(i), PT::Float32 | PT::Float64) => SqlValue::Float(*i as f64),
        (SqlValue::Float(f), PT::Int16 | PT::Int32 | PT::Int64) => SqlValue::Int(*f as i64),
        (SqlValue::Text(s), PT::Boolean) => SqlValue::Bool(matches!(s.to_ascii_lowercase().as_str(), "true" | "1")),
        (other, _) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetadata, PropertyMetadata, PropertyType, Relationship};

    fn orders() -> EntityMetadata {
        EntityMetadata::new(
            "Orders",
            vec![
                PropertyMetadata::scalar("ID", PropertyType::Int64).key(),
                PropertyMetadata::scalar("Total", PropertyType::Float64),
                PropertyMetadata::navigation(
                    "Customer",
                    Relationship {
                        local_property: "CustomerID".into(),
                        related_entity: "Customers".into(),
                        referenced_property: "ID".into(),
                        cascade: crate::metadata::CascadePolicy::Restrict,
                    },
                    false,
                ),
            ],
        )
    }

    #[test]
    fn scan_row_preserves_metadata_order_and_synthesizes_nav_link() {
        let entity = orders();
        let cols = vec![
            RawColumn { name: "ID".into(), value: SqlValue::Int(7) },
            RawColumn { name: "Total".into(), value: SqlValue::Float(12.5) },
        ];
        let row = scan_row(&entity, "/Orders", &cols, &HashSet::new());
        assert_eq!(row.properties[0].0, "ID");
        assert_eq!(row.properties[1].0, "Total");
        assert_eq!(row.navigation_links.len(), 1);
        assert_eq!(row.navigation_links[0].1, "/Orders(7)/Customer");
    }

    #[test]
    fn expanded_navigation_gets_no_synthesized_link() {
        let entity = orders();
        let cols = vec![RawColumn { name: "ID".into(), value: SqlValue::Int(1) }];
        let mut expanded = HashSet::new();
        expanded.insert("customer".to_string());
        let row = scan_row(&entity, "/Orders", &cols, &expanded);
        assert!(row.navigation_links.is_empty());
    }

    #[test]
    fn undeclared_columns_are_retained() {
        let entity = orders();
        let cols = vec![
            RawColumn { name: "ID".into(), value: SqlValue::Int(1) },
            RawColumn { name: "Extra".into(), value: SqlValue::Text("x".into()) },
        ];
        let row = scan_row(&entity, "/Orders", &cols, &HashSet::new());
        assert_eq!(row.undeclared.len(), 1);
        assert_eq!(row.undeclared[0].0, "Extra");
    }
}
