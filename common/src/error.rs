use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use owo_colors::OwoColorize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Client-visible error kinds. Everything a façade method or an action body
/// can surface to a caller is one of these; unexpected failures collapse into
/// `Internal` and are logged with their full chain.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The {kind} '{id}' could not be found")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: String, value: String },

    #[error("The {kind} '{id}' is still in use and cannot be deleted")]
    ResourceInUse { kind: &'static str, id: String },

    #[error("The {kind} '{id}' is busy")]
    ResourceBusy { kind: &'static str, id: String },

    #[error("Policy '{policy}' is not attached to cluster '{cluster}'")]
    PolicyBindingNotFound { policy: String, cluster: String },

    #[error("{0}")]
    ProfileTypeNotMatch(String),

    #[error("{0}")]
    NodeNotOrphan(String),

    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),

    #[error("Operation forbidden")]
    Forbidden,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::BadRequest(_)
            | Error::InvalidSpec(_)
            | Error::InvalidParameter { .. }
            | Error::ProfileTypeNotMatch(_)
            | Error::NodeNotOrphan(_) => StatusCode::BAD_REQUEST,
            Error::ResourceInUse { .. } | Error::ResourceBusy { .. } => StatusCode::CONFLICT,
            Error::PolicyBindingNotFound { .. } => StatusCode::NOT_FOUND,
            Error::FeatureNotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable tag carried alongside the reason.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::BadRequest(_) => "BadRequest",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::InvalidParameter { .. } => "InvalidParameter",
            Error::ResourceInUse { .. } => "ResourceInUse",
            Error::ResourceBusy { .. } => "ResourceBusyError",
            Error::PolicyBindingNotFound { .. } => "PolicyBindingNotFound",
            Error::ProfileTypeNotMatch(_) => "ProfileTypeNotMatch",
            Error::NodeNotOrphan(_) => "NodeNotOrphan",
            Error::FeatureNotSupported(_) => "FeatureNotSupported",
            Error::Forbidden => "Forbidden",
            Error::Internal(_) => "Internal",
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        Error::Internal(anyhow::Error::new(e).context("database error"))
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Error::Internal(anyhow::Error::new(e).context("failed to get db connection"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(format!("malformed request body: {e}"))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            if let Error::Internal(ref e) = self {
                eprintln!("{} {}", "✗".red(), format!("{e:?}").red());
            }
        }
        let body = serde_json::json!({
            "error": self.kind(),
            "reason": self.to_string(),
        });
        (code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_formats_kind_and_id() {
        let e = Error::NotFound {
            kind: "cluster",
            id: "c1".into(),
        };
        assert_eq!(e.to_string(), "The cluster 'c1' could not be found");
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn validation_errors_map_to_bad_request() {
        let e = Error::InvalidParameter {
            name: "count".into(),
            value: "zero".into(),
        };
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(e.kind(), "InvalidParameter");
    }
}
