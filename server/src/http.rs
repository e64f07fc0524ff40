//! Thin `hyper` routing shell: the external-collaborator boundary this
//! crate sits behind. No auth, CORS, compression, or rate limiting here —
//! those are the responsibility of whatever sits in front of this listener
//! in a real deployment; this module only exists to exercise the core
//! end-to-end over real HTTP.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};

use datastore::metadata::MetadataRegistry;
use datastore::query_options::QueryOptionParser;
use datastore::value::SqlValue;

use crate::batch;
use crate::entity_service::EntityService;
use crate::error::{to_json_envelope, Result};
use crate::opt::Opt;
use crate::provider::DbConnection;
use utils::{Error, ErrorKind};

pub struct AppState {
    pub db: DbConnection,
    pub registry: MetadataRegistry,
    pub option_parser: QueryOptionParser,
    pub route_prefix: String,
}

pub async fn serve(
    opt: Opt,
    db: DbConnection,
    registry: MetadataRegistry,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let option_parser = QueryOptionParser {
        compliance: opt.compliance_mode()?,
        max_top: opt.max_top,
        max_expand_depth: opt.max_expand_depth,
    };
    let state = Arc::new(AppState {
        db,
        registry,
        option_parser,
        route_prefix: normalize_prefix(&opt.route_prefix),
    });

    let addr: SocketAddr = opt.listen_addr.parse()?;
    let make_service = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });

    log::info!("listening on {addr}");
    hyper::Server::bind(&addr)
        .serve(make_service)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

async fn handle(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = dispatch(&state, req).await.unwrap_or_else(|e| error_response(&e));
    log::debug!("{method} {uri} -> {}", response.status());
    response
}

async fn dispatch(state: &AppState, req: Request<Body>) -> Result<Response<Body>> {
    let path = req
        .uri()
        .path()
        .strip_prefix(&state.route_prefix)
        .ok_or_else(|| Error::bad_request(anyhow::anyhow!("path is outside the configured route prefix")))?;
    let path = if path.is_empty() { "/" } else { path };
    let query = req.uri().query().unwrap_or("").to_string();
    let method = req.method().clone();

    if path == "/" && method == Method::GET {
        return Ok(service_document(state));
    }
    if path == "/$metadata" && method == Method::GET {
        return Ok(metadata_document(state));
    }
    if path == "/$batch" && method == Method::POST {
        let content_type = req
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| Error::bad_request(anyhow::anyhow!(e)))?;
        let response_body = batch::handle_batch(state, &content_type, &body).await?;
        return Ok(response_body);
    }

    let (segment, rest) = path[1..].split_once('/').map(|(a, b)| (a, Some(b))).unwrap_or((&path[1..], None));
    let (entity_name, key_segment) = split_entity_segment(segment)?;

    match (rest, key_segment) {
        (Some("$count"), None) => handle_count(state, entity_name, &query).await,
        (None, None) => match method {
            Method::GET => handle_query(state, entity_name, &query).await,
            Method::POST => handle_create(state, entity_name, req).await,
            _ => Err(Error::method_not_allowed(anyhow::anyhow!("{method} not allowed on a collection"))),
        },
        (None, Some(key_text)) => {
            let entity = state.registry.require(entity_name)?;
            let keys = parse_key_segment(entity, key_text)?;
            match method {
                Method::GET => handle_get(state, entity_name, keys, &query).await,
                Method::PUT | Method::PATCH => handle_update(state, entity_name, keys, req, method == Method::PATCH).await,
                Method::DELETE => handle_delete(state, entity_name, keys).await,
                _ => Err(Error::method_not_allowed(anyhow::anyhow!("{method} not allowed on an entity"))),
            }
        }
        _ => Err(Error::bad_request(anyhow::anyhow!("unrecognized path `{path}`"))),
    }
}

fn service_document(state: &AppState) -> Response<Body> {
    let value: Vec<_> = state
        .registry
        .entities()
        .map(|e| {
            serde_json::json!({ "name": e.name, "kind": "EntitySet", "url": e.name })
        })
        .collect();
    let body = serde_json::json!({ "@odata.context": "$metadata", "value": value });
    json_response(StatusCode::OK, &body)
}

fn metadata_document(state: &AppState) -> Response<Body> {
    let entities: Vec<_> = state
        .registry
        .entities()
        .map(|e| {
            let properties: Vec<_> = e
                .scalar_properties()
                .map(|p| serde_json::json!({ "name": p.name, "type": format!("{:?}", p.type_), "nullable": p.nullable }))
                .collect();
            let navigations: Vec<_> = e
                .navigation_properties()
                .map(|p| serde_json::json!({ "name": p.name, "collection": p.is_collection }))
                .collect();
            let keys: Vec<_> = e.keys().map(|k| k.name.clone()).collect();
            serde_json::json!({
                "name": e.name,
                "keys": keys,
                "properties": properties,
                "navigationProperties": navigations,
            })
        })
        .collect();
    let body = serde_json::json!({ "@odata.context": "$metadata", "entityTypes": entities });
    json_response(StatusCode::OK, &body)
}

async fn handle_query(state: &AppState, entity_name: &str, query: &str) -> Result<Response<Body>> {
    let opts = state.option_parser.parse(query)?;
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);
    let result = service.query(entity_name, opts).await?;
    let value: Vec<_> = result.rows.iter().map(|r| serde_json::Value::Object(r.to_json_object())).collect();
    let mut body = serde_json::json!({
        "@odata.context": format!("$metadata#{entity_name}"),
        "value": value,
    });
    if let Some(count) = result.count {
        body["@odata.count"] = serde_json::Value::from(count);
    }
    Ok(json_response(StatusCode::OK, &body))
}

async fn handle_count(state: &AppState, entity_name: &str, query: &str) -> Result<Response<Body>> {
    let mut opts = state.option_parser.parse(query)?;
    opts.count = true;
    opts.top = Some(0);
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);
    let result = service.query(entity_name, opts).await?;
    let count = result.count.unwrap_or(0);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(count.to_string()))
        .expect("building a plain-text response never fails"))
}

async fn handle_get(state: &AppState, entity_name: &str, keys: Vec<(String, SqlValue)>, query: &str) -> Result<Response<Body>> {
    let opts = state.option_parser.parse(query)?;
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);
    match service.get(entity_name, &keys, opts).await? {
        Some(row) => {
            let body = serde_json::Value::Object(row.to_json_object());
            Ok(json_response(StatusCode::OK, &body))
        }
        None => Err(Error::entity_not_found(anyhow::anyhow!("no `{entity_name}` row matches the given key"))),
    }
}

async fn handle_create(state: &AppState, entity_name: &str, req: Request<Body>) -> Result<Response<Body>> {
    let payload = read_json_body(req).await?;
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);
    let row = service.create(entity_name, &payload).await?;
    let key_text = key_segment_text(&state.registry, entity_name, &row)?;
    let body = serde_json::Value::Object(row.to_json_object());
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(hyper::header::LOCATION, format!("/{entity_name}({key_text})"))
        .body(Body::from(body.to_string()))
        .expect("building a JSON response never fails"))
}

async fn handle_update(
    state: &AppState,
    entity_name: &str,
    keys: Vec<(String, SqlValue)>,
    req: Request<Body>,
    partial: bool,
) -> Result<Response<Body>> {
    let payload = read_json_body(req).await?;
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);
    let row = if partial {
        service.patch(entity_name, &keys, &payload).await?
    } else {
        service.update(entity_name, &keys, &payload).await?
    };
    let body = serde_json::Value::Object(row.to_json_object());
    Ok(json_response(StatusCode::OK, &body))
}

async fn handle_delete(state: &AppState, entity_name: &str, keys: Vec<(String, SqlValue)>) -> Result<Response<Body>> {
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);
    service.delete(entity_name, &keys).await?;
    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .expect("building an empty response never fails"))
}

async fn read_json_body(req: Request<Body>) -> Result<serde_json::Value> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| Error::bad_request(anyhow::anyhow!(e)))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::bad_request(anyhow::anyhow!(e)))
}

fn key_segment_text(registry: &MetadataRegistry, entity_name: &str, row: &datastore::row::OrderedEntity) -> Result<String> {
    let entity = registry.require(entity_name)?;
    let parts: Vec<String> = entity
        .keys()
        .map(|k| match row.get(&k.name) {
            Some(SqlValue::Text(s)) => format!("'{}'", s.replace('\'', "''")),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        })
        .collect();
    Ok(parts.join(","))
}

/// Splits `Entity(key)` into its name and optional key text.
pub(crate) fn split_entity_segment(segment: &str) -> Result<(&str, Option<&str>)> {
    match segment.find('(') {
        Some(open) => {
            if !segment.ends_with(')') {
                return Err(Error::bad_request(anyhow::anyhow!("malformed key segment `{segment}`")));
            }
            Ok((&segment[..open], Some(&segment[open + 1..segment.len() - 1])))
        }
        None => Ok((segment, None)),
    }
}

/// Parses `(n)`, `('s')`, or `(k1=v1,k2=v2)` into typed key values, using
/// the entity's key property types so numeric keys bind as integers rather
/// than strings (the semantic-reference contract `Get` relies on).
pub(crate) fn parse_key_segment(entity: &datastore::metadata::EntityMetadata, text: &str) -> Result<Vec<(String, SqlValue)>> {
    let keys: Vec<_> = entity.keys().collect();
    if text.contains('=') {
        let mut values = Vec::new();
        for pair in text.split(',') {
            let (name, raw) = pair
                .split_once('=')
                .ok_or_else(|| Error::bad_request(anyhow::anyhow!("malformed composite key segment `{pair}`")))?;
            let key = keys
                .iter()
                .find(|k| k.name.eq_ignore_ascii_case(name.trim()))
                .ok_or_else(|| Error::property_not_found(anyhow::anyhow!("no such key `{name}`")).with_target(name.trim()))?;
            values.push((key.name.clone(), parse_key_literal(raw.trim(), key)?));
        }
        if values.len() != keys.len() {
            return Err(Error::bad_request(anyhow::anyhow!("composite key is missing a component")));
        }
        Ok(values)
    } else {
        let key = keys
            .first()
            .ok_or_else(|| Error::internal(anyhow::anyhow!("entity `{}` was registered without a key", entity.name)))?;
        if keys.len() != 1 {
            return Err(Error::bad_request(anyhow::anyhow!(
                "`{}` has a composite key; use `(k1=v1,k2=v2)` syntax",
                entity.name
            )));
        }
        Ok(vec![(key.name.clone(), parse_key_literal(text, key)?)])
    }
}

fn parse_key_literal(raw: &str, key: &datastore::metadata::PropertyMetadata) -> Result<SqlValue> {
    use datastore::metadata::PropertyType;
    if let Some(stripped) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(SqlValue::Text(stripped.replace("''", "'")));
    }
    match key.type_ {
        PropertyType::Int16 | PropertyType::Int32 | PropertyType::Int64 => raw
            .parse::<i64>()
            .map(SqlValue::Int)
            .map_err(|_| Error::bad_request(anyhow::anyhow!("`{raw}` is not a valid integer key"))),
        PropertyType::Guid => uuid::Uuid::parse_str(raw)
            .map(SqlValue::Guid)
            .map_err(|_| Error::bad_request(anyhow::anyhow!("`{raw}` is not a valid GUID key"))),
        _ => Ok(SqlValue::Text(raw.to_string())),
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("building a JSON response never fails")
}

fn error_response(err: &Error) -> Response<Body> {
    let status = StatusCode::from_u16(err.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.kind() == ErrorKind::Internal {
        log::error!("internal error: {:#}", err.inner);
    }
    json_response(status, &to_json_envelope(err))
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
            ],
        )
    }

    #[test]
    fn split_entity_segment_separates_name_and_key() {
        assert_eq!(split_entity_segment("Users(1)").unwrap(), ("Users", Some("1")));
        assert_eq!(split_entity_segment("Users").unwrap(), ("Users", None));
    }

    #[test]
    fn parse_key_segment_binds_numeric_key_as_integer() {
        let entity = users();
        let keys = parse_key_segment(&entity, "7").unwrap();
        assert_eq!(keys, vec![("ID".to_string(), SqlValue::Int(7))]);
    }

    #[test]
    fn parse_key_segment_unquotes_string_literal() {
        let entity = EntityMetadata::new(
            "Tags",
            vec![PropertyMetadata::scalar("Code", PropertyType::String).key()],
        );
        let keys = parse_key_segment(&entity, "'ab''c'").unwrap();
        assert_eq!(keys, vec![("Code".to_string(), SqlValue::Text("ab'c".to_string()))]);
    }

    #[test]
    fn normalize_prefix_strips_trailing_slash() {
        assert_eq!(normalize_prefix("/odata/"), "/odata");
        assert_eq!(normalize_prefix("/"), "");
    }
}
