//! Converts every fallible layer's error type into the shared
//! [`utils::Error`] taxonomy so the HTTP shell has one place to map errors
//! onto status codes and the JSON error envelope.

use serde::Serialize;
use utils::{Error, ErrorKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

pub fn to_json_envelope(err: &Error) -> serde_json::Value {
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            code: err.kind().code(),
            message: err.inner.to_string(),
            target: err.target.as_deref(),
        },
    };
    serde_json::to_value(envelope).unwrap_or(serde_json::Value::Null)
}

impl From<datastore::token::TokenizeError> for Error {
    fn from(e: datastore::token::TokenizeError) -> Self {
        Error::invalid_filter(anyhow::anyhow!(e))
    }
}

impl From<datastore::ParseError> for Error {
    fn from(e: datastore::ParseError) -> Self {
        Error::invalid_filter(anyhow::anyhow!(e))
    }
}

impl From<datastore::query_options::QueryOptionError> for Error {
    fn from(e: datastore::query_options::QueryOptionError) -> Self {
        use datastore::query_options::QueryOptionError as Q;
        match &e {
            Q::Parse(_) => Error::invalid_filter(anyhow::anyhow!(e)),
            _ => Error::invalid_query(anyhow::anyhow!(e)),
        }
    }
}

impl From<datastore::SqlGenError> for Error {
    fn from(e: datastore::SqlGenError) -> Self {
        use datastore::sqlgen::SqlGenError as S;
        match e {
            S::PropertyNotFound(ref name) => {
                Error::property_not_found(anyhow::anyhow!(e.to_string())).with_target(name.clone())
            }
            _ => Error::bad_request(anyhow::anyhow!(e)),
        }
    }
}

impl From<datastore::metadata::MetadataError> for Error {
    fn from(e: datastore::metadata::MetadataError) -> Self {
        use datastore::metadata::MetadataError as M;
        match e {
            M::NoSuchEntity(_) => Error::entity_not_found(anyhow::anyhow!(e)),
            M::NoSuchProperty(..) => Error::property_not_found(anyhow::anyhow!(e)),
            _ => Error::internal(anyhow::anyhow!(e)),
        }
    }
}

impl From<datastore::eval::EvalError> for Error {
    fn from(e: datastore::eval::EvalError) -> Self {
        Error::bad_request(anyhow::anyhow!(e))
    }
}

impl From<datastore::expand::ExpandError> for Error {
    fn from(e: datastore::expand::ExpandError) -> Self {
        use datastore::expand::ExpandError as X;
        match e {
            X::UnknownNavigation(_) => Error::invalid_expand(anyhow::anyhow!(e)),
            X::DepthExceeded(_) => Error::invalid_expand(anyhow::anyhow!(e)),
            other => Error::internal(anyhow::anyhow!(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_includes_target_when_present() {
        let err = Error::property_not_found(anyhow::anyhow!("no such property")).with_target("Age");
        let json = to_json_envelope(&err);
        assert_eq!(json["error"]["target"], "Age");
        assert_eq!(json["error"]["code"], ErrorKind::PropertyNotFound.code());
    }
}
