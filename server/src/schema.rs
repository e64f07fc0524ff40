//! Builds the process-wide [`MetadataRegistry`] at startup from a JSON
//! schema file.
//!
//! The file holds a plain array of entity descriptions rather than
//! [`EntityMetadata`] itself, since that type precomputes a private
//! searchable-columns index in its constructor; round-tripping it through
//! `serde` directly would force every schema file to carry that derived
//! data by hand.

use std::path::Path;

use anyhow::{Context, Result};
use datastore::metadata::{EntityMetadata, MetadataRegistry, PropertyMetadata};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SchemaEntity {
    name: String,
    table: Option<String>,
    schema: Option<String>,
    properties: Vec<PropertyMetadata>,
}

pub async fn load_registry(path: &Path) -> Result<MetadataRegistry> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading schema file {}", path.display()))?;
    let entities: Vec<SchemaEntity> = serde_json::from_slice(&content)
        .with_context(|| format!("parsing schema file {}", path.display()))?;

    let mut registry = MetadataRegistry::new();
    for entity in entities {
        let name = entity.name.clone();
        let mut metadata = EntityMetadata::new(entity.name, entity.properties);
        if let Some(table) = entity.table {
            metadata = metadata.with_table(table);
        }
        if let Some(schema) = entity.schema {
            metadata = metadata.with_schema(schema);
        }
        registry
            .register(metadata)
            .with_context(|| format!("registering entity `{name}`"))?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const USERS: &str = r#"{"name":"Users","table":"users","schema":null,"properties":[
        {"name":"ID","column":"id","type_":"Int64","nullable":false,"precision":null,"scale":null,"is_key":true,"auto_generate":"Sequence","is_navigation":false,"is_collection":false,"relationship":null}
    ]}"#;

    #[tokio::test]
    async fn loads_entities_from_a_json_array() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[{USERS}]").unwrap();
        let registry = load_registry(file.path()).await.unwrap();
        assert!(registry.get("Users").is_some());
    }

    #[tokio::test]
    async fn rejects_schema_with_duplicate_entity_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[{USERS},{USERS}]").unwrap();
        let err = load_registry(file.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("registering entity"));
    }

    #[tokio::test]
    async fn missing_file_surfaces_a_readable_error() {
        let err = load_registry(Path::new("/nonexistent/schema.json"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("reading schema file"));
    }
}
