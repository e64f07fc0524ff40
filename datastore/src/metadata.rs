//! Entity metadata: the registry every other component in this crate
//! consumes to translate OData property names into SQL columns.
//!
//! Metadata is immutable after registration (see the data model's lifecycle
//! note): a `MetadataRegistry` is built once at process startup and then
//! shared read-only across all concurrent requests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("entity `{0}` is already registered")]
    DuplicateEntity(String),
    #[error("entity `{0}` has no key property")]
    NoKeyProperty(String),
    #[error("key property `{1}` on entity `{0}` must not be nullable or navigational")]
    InvalidKeyProperty(String, String),
    #[error("duplicate property name `{1}` on entity `{0}`")]
    DuplicateProperty(String, String),
    #[error("duplicate column name `{1}` on entity `{0}`")]
    DuplicateColumn(String, String),
    #[error("navigation property `{1}` on entity `{0}` names unknown local property `{2}`")]
    UnknownLocalProperty(String, String, String),
    #[error("navigation property `{1}` on entity `{0}` references unknown entity `{2}`")]
    UnknownRelatedEntity(String, String, String),
    #[error(
        "navigation property `{1}` on entity `{0}` references unknown property `{2}` on `{3}`"
    )]
    UnknownReferencedProperty(String, String, String, String),
    #[error("no such entity: {0}")]
    NoSuchEntity(String),
    #[error("no such property `{1}` on entity `{0}`")]
    NoSuchProperty(String, String),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// The semantic type of a scalar property. Navigation properties carry
/// `PropertyType::Navigation` and are resolved through their `Relationship`
/// rather than a SQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    String,
    Binary,
    DateTime,
    Date,
    Time,
    Duration,
    Guid,
    /// Scalar type of a navigation property's target collection/reference;
    /// the property's `relationship` field is authoritative for these.
    Navigation,
}

impl PropertyType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Int16 | Self::Int32 | Self::Int64 | Self::Float32 | Self::Float64
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, Self::DateTime | Self::Date | Self::Time | Self::Duration)
    }
}

/// How a property's value is produced on insert when the client omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AutoGenerate {
    #[default]
    None,
    /// Backend sequence / identity column (e.g. MySQL `AUTO_INCREMENT`,
    /// PostgreSQL `SERIAL`, Oracle sequence-backed trigger).
    Sequence,
    /// GUID generated application-side before the INSERT is issued.
    GuidClientSide,
    /// GUID generated database-side (e.g. PostgreSQL `gen_random_uuid()`).
    GuidServerSide,
}

/// What happens to related rows when the parent is deleted, for a navigation
/// property whose `Relationship` owns the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CascadePolicy {
    #[default]
    Restrict,
    Cascade,
    SetNull,
}

/// Describes a navigation property's join: `local_property` on the owning
/// entity is compared against `referenced_property` on `related_entity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub local_property: String,
    pub related_entity: String,
    pub referenced_property: String,
    pub cascade: CascadePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyMetadata {
    /// Logical (OData-facing) name, e.g. `"Age"`.
    pub name: String,
    /// Physical column name; defaults to `name` at construction time.
    pub column: String,
    pub type_: PropertyType,
    pub nullable: bool,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub is_key: bool,
    pub auto_generate: AutoGenerate,
    pub is_navigation: bool,
    pub is_collection: bool,
    pub relationship: Option<Relationship>,
}

impl PropertyMetadata {
    pub fn scalar(name: impl Into<String>, type_: PropertyType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            type_,
            nullable: true,
            precision: None,
            scale: None,
            is_key: false,
            auto_generate: AutoGenerate::None,
            is_navigation: false,
            is_collection: false,
            relationship: None,
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn auto(mut self, strategy: AutoGenerate) -> Self {
        self.auto_generate = strategy;
        self
    }

    pub fn column_name(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn navigation(name: impl Into<String>, relationship: Relationship, is_collection: bool) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            type_: PropertyType::Navigation,
            nullable: true,
            precision: None,
            scale: None,
            is_key: false,
            auto_generate: AutoGenerate::None,
            is_navigation: true,
            is_collection,
            relationship: Some(relationship),
        }
    }

    /// A string property is "searchable" (eligible for `$search`, per the
    /// entity service's search-to-filter rewrite) when it is a plain,
    /// non-navigational `String` column.
    pub fn is_searchable(&self) -> bool {
        !self.is_navigation && self.type_ == PropertyType::String
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub schema: Option<String>,
    pub properties: Vec<PropertyMetadata>,
    /// Precomputed at registration time so `$search` doesn't rescan metadata
    /// on every request.
    searchable: Vec<String>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, properties: Vec<PropertyMetadata>) -> Self {
        let name = name.into();
        let searchable = properties
            .iter()
            .filter(|p| p.is_searchable())
            .map(|p| p.name.clone())
            .collect();
        Self {
            table: name.clone(),
            schema: None,
            name,
            properties,
            searchable,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &PropertyMetadata> {
        self.properties.iter().filter(|p| p.is_key)
    }

    pub fn scalar_properties(&self) -> impl Iterator<Item = &PropertyMetadata> {
        self.properties.iter().filter(|p| !p.is_navigation)
    }

    pub fn navigation_properties(&self) -> impl Iterator<Item = &PropertyMetadata> {
        self.properties.iter().filter(|p| p.is_navigation)
    }

    pub fn searchable_properties(&self) -> &[String] {
        &self.searchable
    }

    /// Resolve a property by logical name or column name, case-insensitively,
    /// per the SQL generator's property-resolution contract.
    pub fn find_property(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| {
            p.name.eq_ignore_ascii_case(name) || p.column.eq_ignore_ascii_case(name)
        })
    }

    pub fn find_navigation(&self, name: &str) -> Option<&PropertyMetadata> {
        self.find_property(name).filter(|p| p.is_navigation)
    }
}

/// Read-mostly registry of entity metadata, populated once at startup and
/// looked up on every request thereafter (single write-lock at registration,
/// read-lock on lookup — see the concurrency model).
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, EntityMetadata>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: EntityMetadata) -> Result<()> {
        validate(&entity, &self.entities)?;
        let key = entity.name.to_ascii_lowercase();
        if self.entities.contains_key(&key) {
            return Err(MetadataError::DuplicateEntity(entity.name));
        }
        self.entities.insert(key, entity);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EntityMetadata> {
        self.entities.get(&name.to_ascii_lowercase())
    }

    pub fn require(&self, name: &str) -> Result<&EntityMetadata> {
        self.get(name)
            .ok_or_else(|| MetadataError::NoSuchEntity(name.to_owned()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.values()
    }
}

fn validate(entity: &EntityMetadata, existing: &HashMap<String, EntityMetadata>) -> Result<()> {
    if entity.keys().next().is_none() {
        return Err(MetadataError::NoKeyProperty(entity.name.clone()));
    }

    let mut seen_names = std::collections::HashSet::new();
    let mut seen_columns = std::collections::HashSet::new();
    for prop in &entity.properties {
        if !seen_names.insert(prop.name.to_ascii_lowercase()) {
            return Err(MetadataError::DuplicateProperty(
                entity.name.clone(),
                prop.name.clone(),
            ));
        }
        if !seen_columns.insert(prop.column.to_ascii_lowercase()) {
            return Err(MetadataError::DuplicateColumn(
                entity.name.clone(),
                prop.column.clone(),
            ));
        }
        if prop.is_key && (prop.is_navigation || prop.nullable) {
            return Err(MetadataError::InvalidKeyProperty(
                entity.name.clone(),
                prop.name.clone(),
            ));
        }
        if prop.is_navigation {
            let rel = prop.relationship.as_ref().expect("navigation property without relationship");
            if entity.find_property(&rel.local_property).is_none() {
                return Err(MetadataError::UnknownLocalProperty(
                    entity.name.clone(),
                    prop.name.clone(),
                    rel.local_property.clone(),
                ));
            }
            // Self-references are allowed before the related entity is
            // registered; otherwise the related entity must already exist.
            if !rel.related_entity.eq_ignore_ascii_case(&entity.name) {
                let related = existing.get(&rel.related_entity.to_ascii_lowercase()).ok_or_else(|| {
                    MetadataError::UnknownRelatedEntity(
                        entity.name.clone(),
                        prop.name.clone(),
                        rel.related_entity.clone(),
                    )
                })?;
                if related.find_property(&rel.referenced_property).is_none() {
                    return Err(MetadataError::UnknownReferencedProperty(
                        entity.name.clone(),
                        prop.name.clone(),
                        rel.referenced_property.clone(),
                        rel.related_entity.clone(),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn register_and_lookup_is_case_insensitive() {
        let mut reg = MetadataRegistry::new();
        reg.register(users()).unwrap();
        assert!(reg.get("users").is_some());
        assert!(reg.get("USERS").is_some());
        let users = reg.get("Users").unwrap();
        assert!(users.find_property("age").is_some());
        assert!(users.find_property("AGE").is_some());
    }

    #[test]
    fn rejects_entity_without_key() {
        let entity = EntityMetadata::new(
            "NoKey",
            vec![PropertyMetadata::scalar("Name", PropertyType::String)],
        );
        let mut reg = MetadataRegistry::new();
        assert!(matches!(
            reg.register(entity),
            Err(MetadataError::NoKeyProperty(_))
        ));
    }

    #[test]
    fn rejects_duplicate_column_names() {
        let entity = EntityMetadata::new(
            "Dup",
            vec![
                PropertyMetadata::scalar("ID", PropertyType::Int64).key(),
                PropertyMetadata::scalar("A", PropertyType::String).column_name("same"),
                PropertyMetadata::scalar("B", PropertyType::String).column_name("same"),
            ],
        );
        let mut reg = MetadataRegistry::new();
        assert!(matches!(
            reg.register(entity),
            Err(MetadataError::DuplicateColumn(_, _))
        ));
    }

    #[test]
    fn navigation_must_reference_existing_local_property() {
        let entity = EntityMetadata::new(
            "Orders",
            vec![
                PropertyMetadata::scalar("ID", PropertyType::Int64).key(),
                PropertyMetadata::navigation(
                    "Items",
                    Relationship {
                        local_property: "NoSuchProp".into(),
                        related_entity: "Items".into(),
                        referenced_property: "OrderID".into(),
                        cascade: CascadePolicy::Restrict,
                    },
                    true,
                ),
            ],
        );
        let mut reg = MetadataRegistry::new();
        assert!(matches!(
            reg.register(entity),
            Err(MetadataError::UnknownLocalProperty(_, _, _))
        ));
    }

    #[test]
    fn navigation_must_reference_existing_related_entity() {
        let mut reg = MetadataRegistry::new();
        let orders = EntityMetadata::new(
            "Orders",
            vec![
                PropertyMetadata::scalar("ID", PropertyType::Int64).key(),
                PropertyMetadata::navigation(
                    "Items",
                    Relationship {
                        local_property: "ID".into(),
                        related_entity: "Items".into(),
                        referenced_property: "OrderID".into(),
                        cascade: CascadePolicy::Restrict,
                    },
                    true,
                ),
            ],
        );
        assert!(matches!(
            reg.register(orders),
            Err(MetadataError::UnknownRelatedEntity(_, _, _))
        ));
    }
}
