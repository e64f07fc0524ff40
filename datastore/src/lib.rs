//! The query pipeline: tokenizer, Shunting-Yard expression parser, the
//! query-option parser, a dialect-aware SQL generator, a row scanner, and a
//! batched `$expand` engine, all built around a read-mostly metadata
//! registry. Backend connectivity, HTTP routing, and batch/changeset
//! orchestration live in the server crate; this crate never talks to a
//! driver directly.

pub mod dialect;
pub mod eval;
pub mod expand;
pub mod expr;
pub mod metadata;
pub mod query_options;
pub mod row;
pub mod sqlgen;
pub mod token;
pub mod value;

pub use dialect::Dialect;
pub use expr::{ParseError, ParseNode, Parser};
pub use metadata::{EntityMetadata, MetadataRegistry, PropertyMetadata, PropertyType, Relationship};
pub use query_options::{ComplianceMode, QueryOptionParser, QueryOptions};
pub use row::{scan_row, OrderedEntity, RawColumn};
pub use sqlgen::{GeneratedSql, SqlGenError, SqlGenerator};
pub use token::{Token, TokenKind, Tokenizer};
pub use value::SqlValue;
