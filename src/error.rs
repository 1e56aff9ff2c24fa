//! # Error Handling
//!
//! Layered error types: `PipelineError` for the conversation-to-issue
//! pipeline, `RepositoryError` for the issue record store, and `ApiError`
//! which renders problem+json responses with trace ID propagation on the HTTP
//! surface.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::ConfigError;
use crate::connectors::ConnectorError;
use crate::telemetry;

/// Failures inside one pipeline cycle. None of them abort other threads.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient failure calling {collaborator}: {source}")]
    TransientExternalFailure {
        collaborator: &'static str,
        #[source]
        source: ConnectorError,
    },

    #[error("{collaborator} rejected the call: {source}")]
    PermanentExternalFailure {
        collaborator: &'static str,
        #[source]
        source: ConnectorError,
    },

    #[error("model output for {schema} failed validation: {reason}")]
    SchemaValidationFailure { schema: &'static str, reason: String },

    #[error("issue for thread {thread} already exists as {external_id}")]
    DuplicateMaterializationAttempt { thread: String, external_id: String },

    #[error("configuration error: {0}")]
    ConfigurationError(#[from] ConfigError),

    #[error("issue record store failure: {0}")]
    Repository(#[from] RepositoryError),
}

impl PipelineError {
    /// Classify a collaborator failure as transient or permanent.
    pub fn external(collaborator: &'static str, source: ConnectorError) -> Self {
        if source.is_transient() {
            PipelineError::TransientExternalFailure {
                collaborator,
                source,
            }
        } else {
            PipelineError::PermanentExternalFailure {
                collaborator,
                source,
            }
        }
    }

    /// Short machine-readable kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientExternalFailure { .. } => "transient_external",
            PipelineError::PermanentExternalFailure { .. } => "permanent_external",
            PipelineError::SchemaValidationFailure { .. } => "schema_validation",
            PipelineError::DuplicateMaterializationAttempt { .. } => "duplicate_materialization",
            PipelineError::ConfigurationError(_) => "configuration",
            PipelineError::Repository(_) => "repository",
        }
    }
}

/// Issue record store errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[source] sea_orm::DbErr),

    /// Another writer already stored a record for this thread
    #[error("issue record already exists for thread {0}")]
    Conflict(String),

    #[error("issue record not found: {0}")]
    NotFound(String),

    #[error("failed to encode issue fields: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    pub fn database_error(error: sea_orm::DbErr) -> Self {
        RepositoryError::Database(error)
    }
}

impl From<sea_orm::DbErr> for RepositoryError {
    fn from(error: sea_orm::DbErr) -> Self {
        RepositoryError::Database(error)
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .map(|code| {
            let code = code.as_ref();
            code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
        })
        .unwrap_or(false)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_error_with_details() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Test error message")
            .with_details(json!({"field": "value"}));

        assert_eq!(error.code, Box::from("BAD_REQUEST"));
        assert_eq!(error.details, Some(Box::new(json!({"field": "value"}))));
    }

    #[test]
    fn test_content_type_and_status() {
        let error = ApiError::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_trace_id_fallback_format() {
        let error = unauthorized(None);
        assert_eq!(error.status, StatusCode::UNAUTHORIZED);
        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn test_from_anyhow_hides_details() {
        let api_error: ApiError = anyhow::anyhow!("secret detail").into();
        assert_eq!(api_error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api_error.message, Box::from("An internal error occurred"));
    }

    #[test]
    fn test_pipeline_error_classifies_connector_failures() {
        let transient = PipelineError::external(
            "tracker",
            ConnectorError::HttpError {
                status: 503,
                body: None,
            },
        );
        assert_eq!(transient.kind(), "transient_external");

        let permanent = PipelineError::external(
            "tracker",
            ConnectorError::AuthenticationError {
                details: "bad credentials".into(),
            },
        );
        assert_eq!(permanent.kind(), "permanent_external");
        assert!(permanent.to_string().contains("tracker"));
    }

    #[test]
    fn test_db_connection_error_maps_to_unavailable() {
        let api_error: ApiError =
            sea_orm::DbErr::Conn(sea_orm::RuntimeErr::Internal("down".into())).into();
        assert_eq!(api_error.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
