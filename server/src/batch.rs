//! `multipart/mixed` batch processing: parses the outer envelope, treats a
//! nested `multipart/mixed` part as a changeset executed atomically under
//! one transaction, and every other part as an operation executed on its
//! own. Content-ID references (`$n` / `${n}`) in a changeset operation's URL
//! are substituted from prior operations' response bodies before dispatch.

use std::collections::HashMap;

use hyper::{Body, Response, StatusCode};
use regex::Regex;

use crate::entity_service::EntityService;
use crate::error::{to_json_envelope, Result};
use crate::http::AppState;
use crate::provider::Transaction;
use utils::Error;

struct Operation {
    method: String,
    path: String,
    content_id: Option<String>,
    body: Vec<u8>,
}

struct OperationResult {
    status: u16,
    body: serde_json::Value,
}

enum ResponsePart {
    Single(OperationResult),
    Changeset(Vec<OperationResult>),
}

pub async fn handle_batch(state: &AppState, content_type: &str, body: &[u8]) -> Result<Response<Body>> {
    let boundary = extract_boundary(content_type)?;
    let raw_parts = split_multipart(body, &boundary);
    let mut rendered = Vec::with_capacity(raw_parts.len());

    for raw in raw_parts {
        let (part_headers, envelope) = split_headers_body(&raw)?;
        let part_content_type = part_headers.get("content-type").cloned().unwrap_or_default();

        if part_content_type.to_ascii_lowercase().starts_with("multipart/mixed") {
            let nested_boundary = extract_boundary(&part_content_type)?;
            let mut ops = Vec::new();
            for nested in split_multipart(&envelope, &nested_boundary) {
                let (_, nested_envelope) = split_headers_body(&nested)?;
                ops.push(parse_operation(&nested_envelope)?);
            }
            rendered.push(ResponsePart::Changeset(run_changeset(state, ops).await));
        } else {
            let op = parse_operation(&envelope)?;
            rendered.push(ResponsePart::Single(run_single_operation(state, &op).await));
        }
    }

    Ok(render_batch_response(&rendered))
}

/// Runs a changeset's operations strictly in declaration order inside one
/// transaction. Any operation at or past a 400 status rolls back everything
/// and every operation in the changeset reports the same failure, per the
/// all-or-nothing contract.
async fn run_changeset(state: &AppState, ops: Vec<Operation>) -> Vec<OperationResult> {
    let mut tx = match state.db.begin_transaction().await {
        Ok(tx) => tx,
        Err(e) => {
            let body = to_json_envelope(&Error::internal(e));
            return ops.iter().map(|_| OperationResult { status: 500, body: body.clone() }).collect();
        }
    };

    let mut id_results: HashMap<String, serde_json::Value> = HashMap::new();
    let mut outcomes = Vec::with_capacity(ops.len());
    let mut failed = false;

    for (idx, op) in ops.iter().enumerate() {
        if failed {
            break;
        }
        let resolved_path = substitute_content_ids(&op.path, &id_results);
        match execute_in_changeset(state, &mut tx, &op.method, &resolved_path, &op.body).await {
            Ok((status, body)) => {
                if let Some(id) = &op.content_id {
                    id_results.insert(id.clone(), body.clone());
                }
                id_results.insert((idx + 1).to_string(), body.clone());
                outcomes.push(OperationResult { status, body });
            }
            Err(e) => {
                outcomes.push(OperationResult { status: e.kind().http_status(), body: to_json_envelope(&e) });
                failed = true;
            }
        }
    }

    if failed {
        let _ = tx.rollback().await;
        let body = serde_json::json!({
            "error": {
                "code": "ChangesetRolledBack",
                "message": "an operation in this changeset failed; every operation was rolled back",
            }
        });
        return ops.iter().map(|_| OperationResult { status: 409, body: body.clone() }).collect();
    }

    if let Err(e) = tx.commit().await {
        let body = to_json_envelope(&Error::internal(e));
        return ops.iter().map(|_| OperationResult { status: 500, body: body.clone() }).collect();
    }

    outcomes
}

async fn execute_in_changeset(
    state: &AppState,
    tx: &mut Transaction<'_>,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<(u16, serde_json::Value)> {
    let (entity_name, key_segment, _query) = route_path(state, path)?;
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);
    let payload = parse_json_body(body)?;

    match method.to_ascii_uppercase().as_str() {
        "POST" => {
            if key_segment.is_some() {
                return Err(Error::bad_request(anyhow::anyhow!("POST does not take a key segment")));
            }
            let row = service.create_with(entity_name, &payload, tx).await?;
            Ok((201, serde_json::Value::Object(row.to_json_object())))
        }
        "PUT" | "PATCH" => {
            let entity = state.registry.require(entity_name)?;
            let key_text = key_segment
                .ok_or_else(|| Error::bad_request(anyhow::anyhow!("{method} requires a key segment")))?;
            let keys = crate::http::parse_key_segment(entity, key_text)?;
            let row = if method.eq_ignore_ascii_case("PATCH") {
                service.patch_with(entity_name, &keys, &payload, tx).await?
            } else {
                service.update_with(entity_name, &keys, &payload, tx).await?
            };
            Ok((200, serde_json::Value::Object(row.to_json_object())))
        }
        "DELETE" => {
            let entity = state.registry.require(entity_name)?;
            let key_text = key_segment
                .ok_or_else(|| Error::bad_request(anyhow::anyhow!("DELETE requires a key segment")))?;
            let keys = crate::http::parse_key_segment(entity, key_text)?;
            service.delete_with(entity_name, &keys, tx).await?;
            Ok((204, serde_json::Value::Null))
        }
        "GET" => Err(Error::method_not_allowed(anyhow::anyhow!("GET is not permitted inside a changeset"))),
        other => Err(Error::method_not_allowed(anyhow::anyhow!("unsupported changeset method `{other}`"))),
    }
}

async fn run_single_operation(state: &AppState, op: &Operation) -> OperationResult {
    match execute_standalone(state, &op.method, &op.path, &op.body).await {
        Ok((status, body)) => OperationResult { status, body },
        Err(e) => OperationResult { status: e.kind().http_status(), body: to_json_envelope(&e) },
    }
}

async fn execute_standalone(state: &AppState, method: &str, path: &str, body: &[u8]) -> Result<(u16, serde_json::Value)> {
    let (entity_name, key_segment, query) = route_path(state, path)?;
    let service = EntityService::new(&state.db, &state.registry, state.option_parser.max_expand_depth);

    match (method.to_ascii_uppercase().as_str(), key_segment) {
        ("GET", None) => {
            let opts = state.option_parser.parse(query)?;
            let result = service.query(entity_name, opts).await?;
            let value: Vec<_> = result.rows.iter().map(|r| serde_json::Value::Object(r.to_json_object())).collect();
            let mut json_body = serde_json::json!({ "value": value });
            if let Some(count) = result.count {
                json_body["@odata.count"] = serde_json::Value::from(count);
            }
            Ok((200, json_body))
        }
        ("POST", None) => {
            let payload = parse_json_body(body)?;
            let row = service.create(entity_name, &payload).await?;
            Ok((201, serde_json::Value::Object(row.to_json_object())))
        }
        ("GET", Some(key_text)) => {
            let entity = state.registry.require(entity_name)?;
            let keys = crate::http::parse_key_segment(entity, key_text)?;
            let opts = state.option_parser.parse(query)?;
            let row = service
                .get(entity_name, &keys, opts)
                .await?
                .ok_or_else(|| Error::entity_not_found(anyhow::anyhow!("no `{entity_name}` row matches the given key")))?;
            Ok((200, serde_json::Value::Object(row.to_json_object())))
        }
        ("PUT", Some(key_text)) | ("PATCH", Some(key_text)) => {
            let entity = state.registry.require(entity_name)?;
            let keys = crate::http::parse_key_segment(entity, key_text)?;
            let payload = parse_json_body(body)?;
            let row = if method.eq_ignore_ascii_case("PATCH") {
                service.patch(entity_name, &keys, &payload).await?
            } else {
                service.update(entity_name, &keys, &payload).await?
            };
            Ok((200, serde_json::Value::Object(row.to_json_object())))
        }
        ("DELETE", Some(key_text)) => {
            let entity = state.registry.require(entity_name)?;
            let keys = crate::http::parse_key_segment(entity, key_text)?;
            service.delete(entity_name, &keys).await?;
            Ok((204, serde_json::Value::Null))
        }
        _ => Err(Error::bad_request(anyhow::anyhow!("unsupported batch operation `{method} {path}`"))),
    }
}

/// Splits a batch operation's URL into `(entity name, key segment, query
/// string)`, accepting the path both with and without the configured route
/// prefix since inner operation URLs are conventionally written relative to
/// the service root.
fn route_path<'a>(state: &AppState, path: &'a str) -> Result<(&'a str, Option<&'a str>, &'a str)> {
    let (path_only, query) = path.split_once('?').unwrap_or((path, ""));
    let trimmed = path_only.strip_prefix(&state.route_prefix).unwrap_or(path_only);
    let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);
    if trimmed.contains('/') {
        return Err(Error::bad_request(anyhow::anyhow!("nested paths are not supported inside a batch operation")));
    }
    let (entity_name, key_segment) = crate::http::split_entity_segment(trimmed)?;
    Ok((entity_name, key_segment, query))
}

fn parse_json_body(body: &[u8]) -> Result<serde_json::Value> {
    if body.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| Error::bad_request(anyhow::anyhow!(e)))
}

/// Replaces `$n` / `${n}` references to a prior operation's Content-ID (or,
/// absent an explicit one, its 1-based position in the changeset) with the
/// `id`/`ID`/`Id`/`@odata.id` field of that operation's response body.
/// Unresolvable references are left as-is, so the operation fails naturally.
fn substitute_content_ids(path: &str, results: &HashMap<String, serde_json::Value>) -> String {
    let re = Regex::new(r"\$\{?([A-Za-z0-9_]+)\}?").expect("static regex is valid");
    re.replace_all(path, |caps: &regex::Captures| {
        let id = &caps[1];
        results
            .get(id)
            .and_then(extract_id_field)
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

fn extract_id_field(value: &serde_json::Value) -> Option<String> {
    for key in ["id", "ID", "Id", "@odata.id"] {
        if let Some(found) = value.get(key) {
            return Some(match found {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
    }
    None
}

fn extract_boundary(content_type: &str) -> Result<String> {
    content_type
        .split(';')
        .skip(1)
        .find_map(|param| {
            let param = param.trim();
            param.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_string())
        })
        .ok_or_else(|| Error::bad_request(anyhow::anyhow!("multipart request is missing a boundary parameter")))
}

/// Splits a `multipart/mixed` body into each part's raw bytes (its own
/// headers plus body), excluding the boundary delimiters and the closing
/// `--boundary--` marker.
fn split_multipart(body: &[u8], boundary: &str) -> Vec<Vec<u8>> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut occurrences = Vec::new();
    let mut search_from = 0;
    while let Some(pos) = find_subslice(&body[search_from..], &delimiter) {
        occurrences.push(search_from + pos);
        search_from += pos + delimiter.len();
    }

    let mut parts = Vec::new();
    for window in occurrences.windows(2) {
        let start = window[0] + delimiter.len();
        let end = window[1];
        if start > end {
            continue;
        }
        let slice = trim_crlf(&body[start..end]);
        if !slice.is_empty() {
            parts.push(slice.to_vec());
        }
    }
    parts
}

fn trim_crlf(mut s: &[u8]) -> &[u8] {
    while let Some(rest) = s.strip_prefix(b"\r\n") {
        s = rest;
    }
    while let Some(rest) = s.strip_suffix(b"\r\n") {
        s = rest;
    }
    s
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_headers_body(raw: &[u8]) -> Result<(HashMap<String, String>, Vec<u8>)> {
    let (pos, seplen) = if let Some(p) = find_subslice(raw, b"\r\n\r\n") {
        (p, 4)
    } else if let Some(p) = find_subslice(raw, b"\n\n") {
        (p, 2)
    } else {
        return Err(Error::bad_request(anyhow::anyhow!("multipart part is missing a header/body separator")));
    };

    let head = &raw[..pos];
    let body = raw[pos + seplen..].to_vec();
    let mut headers = HashMap::new();
    for line in String::from_utf8_lossy(head).lines() {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    Ok((headers, body))
}

/// Parses one operation's `METHOD PATH VERSION` request line, headers, and
/// body out of its `application/http` envelope.
fn parse_operation(envelope: &[u8]) -> Result<Operation> {
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_buf);
    let status = req
        .parse(envelope)
        .map_err(|e| Error::bad_request(anyhow::anyhow!("malformed batch operation envelope: {e}")))?;
    let offset = match status {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => {
            return Err(Error::bad_request(anyhow::anyhow!("incomplete batch operation envelope")))
        }
    };

    let method = req
        .method
        .ok_or_else(|| Error::bad_request(anyhow::anyhow!("batch operation is missing a method")))?
        .to_string();
    let path = req
        .path
        .ok_or_else(|| Error::bad_request(anyhow::anyhow!("batch operation is missing a path")))?
        .to_string();
    let content_id = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-id"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned());
    let body = trim_crlf(&envelope[offset..]).to_vec();

    Ok(Operation { method, path, content_id, body })
}

fn render_batch_response(parts: &[ResponsePart]) -> Response<Body> {
    let boundary = format!("batchresponse_{}", uuid::Uuid::new_v4());
    let mut buf = Vec::new();

    for part in parts {
        buf.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match part {
            ResponsePart::Single(result) => {
                buf.extend_from_slice(b"Content-Type: application/http\r\n\r\n");
                buf.extend_from_slice(&render_operation_result(result));
            }
            ResponsePart::Changeset(results) => {
                let inner_boundary = format!("changesetresponse_{}", uuid::Uuid::new_v4());
                buf.extend_from_slice(
                    format!("Content-Type: multipart/mixed; boundary={inner_boundary}\r\n\r\n").as_bytes(),
                );
                for result in results {
                    buf.extend_from_slice(format!("--{inner_boundary}\r\n").as_bytes());
                    buf.extend_from_slice(b"Content-Type: application/http\r\n\r\n");
                    buf.extend_from_slice(&render_operation_result(result));
                }
                buf.extend_from_slice(format!("--{inner_boundary}--\r\n").as_bytes());
            }
        }
    }
    buf.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, format!("multipart/mixed; boundary={boundary}"))
        .body(Body::from(buf))
        .expect("building a multipart response never fails")
}

fn render_operation_result(result: &OperationResult) -> Vec<u8> {
    let body_bytes = if result.body.is_null() { Vec::new() } else { result.body.to_string().into_bytes() };
    let mut out =
        format!("HTTP/1.1 {} {}\r\nContent-Type: application/json\r\n\r\n", result.status, reason_phrase(result.status))
            .into_bytes();
    out.extend_from_slice(&body_bytes);
    out.extend_from_slice(b"\r\n");
    out
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        499 => "Client Closed Request",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_boundary_reads_quoted_and_unquoted_forms() {
        assert_eq!(extract_boundary("multipart/mixed; boundary=abc123").unwrap(), "abc123");
        assert_eq!(extract_boundary("multipart/mixed; boundary=\"abc 123\"").unwrap(), "abc 123");
    }

    #[test]
    fn split_multipart_recovers_two_parts() {
        let body = b"--B\r\nContent-Type: application/http\r\n\r\nGET /Users HTTP/1.1\r\n\r\n\r\n--B\r\nContent-Type: application/http\r\n\r\nGET /Orders HTTP/1.1\r\n\r\n\r\n--B--\r\n";
        let parts = split_multipart(body, "B");
        assert_eq!(parts.len(), 2);
        assert!(String::from_utf8_lossy(&parts[0]).contains("/Users"));
        assert!(String::from_utf8_lossy(&parts[1]).contains("/Orders"));
    }

    #[test]
    fn parse_operation_extracts_method_path_and_content_id() {
        let envelope = b"POST /Products HTTP/1.1\r\nContent-Type: application/json\r\nContent-ID: 1\r\n\r\n{\"name\":\"X\"}";
        let op = parse_operation(envelope).unwrap();
        assert_eq!(op.method, "POST");
        assert_eq!(op.path, "/Products");
        assert_eq!(op.content_id.as_deref(), Some("1"));
        assert_eq!(op.body, b"{\"name\":\"X\"}");
    }

    #[test]
    fn substitute_content_ids_resolves_known_reference() {
        let mut results = HashMap::new();
        results.insert("1".to_string(), serde_json::json!({ "id": 42 }));
        assert_eq!(substitute_content_ids("/Prices?product_id=$1", &results), "/Prices?product_id=42");
        assert_eq!(substitute_content_ids("/Prices?product_id=${1}", &results), "/Prices?product_id=42");
    }

    #[test]
    fn substitute_content_ids_leaves_unresolvable_reference_untouched() {
        let results = HashMap::new();
        assert_eq!(substitute_content_ids("/Prices?product_id=$9", &results), "/Prices?product_id=$9");
    }
}
