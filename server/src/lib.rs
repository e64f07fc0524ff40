//! Wires the query engine in the `datastore` crate to a real Postgres,
//! MySQL, or Oracle backend behind a plain `hyper` HTTP surface.

pub mod batch;
pub mod entity_service;
pub mod error;
pub mod http;
pub mod opt;
pub mod provider;
pub mod schema;
