use serde::Serialize;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Construct and return an `Error` of the given kind from a format string, the
/// same way `anyhow::bail!` works for plain errors.
#[macro_export]
macro_rules! bad_request {
    ($($token:tt)*) => {
        return Err($crate::error::Error::bad_request(anyhow::anyhow!($($token)*)))
    };
}

#[macro_export]
macro_rules! invalid_filter {
    ($($token:tt)*) => {
        return Err($crate::error::Error::invalid_filter(anyhow::anyhow!($($token)*)))
    };
}

#[macro_export]
macro_rules! property_not_found {
    ($($token:tt)*) => {
        return Err($crate::error::Error::property_not_found(anyhow::anyhow!($($token)*)))
    };
}

#[macro_export]
macro_rules! forbidden {
    ($($token:tt)*) => {
        return Err($crate::error::Error::forbidden(anyhow::anyhow!($($token)*)))
    };
}

#[macro_export]
macro_rules! internal {
    ($($token:tt)*) => {
        return Err($crate::error::Error::internal(anyhow::anyhow!($($token)*)))
    };
}

/// The request-facing error taxonomy (see the error handling design in the
/// project's specification). Every fallible operation in the datastore and
/// server crates eventually resolves to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    BadRequest,
    InvalidFilter,
    InvalidSelect,
    InvalidExpand,
    InvalidOrderBy,
    InvalidQuery,
    PropertyNotFound,
    EntityNotFound,
    MethodNotAllowed,
    Unauthorized,
    Forbidden,
    Internal,
    Cancelled,
}

impl ErrorKind {
    /// The machine-readable `error.code` surfaced in the JSON error envelope.
    pub fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::InvalidFilter => "InvalidFilter",
            Self::InvalidSelect => "InvalidSelect",
            Self::InvalidExpand => "InvalidExpand",
            Self::InvalidOrderBy => "InvalidOrderBy",
            Self::InvalidQuery => "InvalidQuery",
            Self::PropertyNotFound => "PropertyNotFound",
            Self::EntityNotFound => "EntityNotFound",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::Internal => "InternalError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// The HTTP status this kind maps to at the API boundary.
    pub fn http_status(self) -> u16 {
        match self {
            Self::BadRequest
            | Self::InvalidFilter
            | Self::InvalidSelect
            | Self::InvalidExpand
            | Self::InvalidOrderBy
            | Self::InvalidQuery => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::EntityNotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Cancelled => 499,
            Self::Internal => 500,
            Self::PropertyNotFound => 400,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    pub inner: anyhow::Error,
    pub kind: ErrorKind,
    /// The query option, property, or URL segment this error refers to, if any.
    pub target: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        pub fn $name(inner: anyhow::Error) -> Self {
            Self {
                inner,
                kind: ErrorKind::$kind,
                target: None,
            }
        }
    };
}

impl Error {
    ctor!(bad_request, BadRequest);
    ctor!(invalid_filter, InvalidFilter);
    ctor!(invalid_select, InvalidSelect);
    ctor!(invalid_expand, InvalidExpand);
    ctor!(invalid_orderby, InvalidOrderBy);
    ctor!(invalid_query, InvalidQuery);
    ctor!(property_not_found, PropertyNotFound);
    ctor!(entity_not_found, EntityNotFound);
    ctor!(method_not_allowed, MethodNotAllowed);
    ctor!(unauthorized, Unauthorized);
    ctor!(forbidden, Forbidden);
    ctor!(internal, Internal);
    ctor!(cancelled, Cancelled);

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub trait ResultExt<T> {
    fn err_internal(self) -> Result<T>;
    fn err_forbidden(self) -> Result<T>;
    fn err_bad_request(self) -> Result<T>;
    fn err_cancelled(self) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn err_internal(self) -> Result<T> {
        self.map_err(|e| Error::internal(e.into()))
    }

    fn err_forbidden(self) -> Result<T> {
        self.map_err(|e| Error::forbidden(e.into()))
    }

    fn err_bad_request(self) -> Result<T> {
        self.map_err(|e| Error::bad_request(e.into()))
    }

    fn err_cancelled(self) -> Result<T> {
        self.map_err(|e| Error::cancelled(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(ErrorKind::InvalidFilter.code(), "InvalidFilter");
        assert_eq!(ErrorKind::EntityNotFound.http_status(), 404);
        assert_eq!(ErrorKind::Cancelled.http_status(), 499);
    }

    #[test]
    fn with_target_is_chainable() {
        let err = Error::property_not_found(anyhow::anyhow!("no such property"))
            .with_target("Age");
        assert_eq!(err.target.as_deref(), Some("Age"));
    }
}
