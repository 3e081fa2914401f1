use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error types.
///
/// Sync-protocol errors carry enough context for the client to decide
/// whether a retry makes sense; see the `kind` strings on the wire.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Sync validation failed for {table}/{row_id}: {field}: {message}")]
    SyncValidation {
        table: String,
        row_id: String,
        field: String,
        message: String,
    },

    #[error("Missing dependency for {table}/{row_id}: {field} -> {referenced_table}")]
    DependencyMissing {
        table: String,
        row_id: String,
        field: String,
        referenced_table: String,
    },

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Sync conflict for {table}/{row_id}: {reason}")]
    Conflict {
        table: String,
        row_id: String,
        reason: String,
    },

    #[error("Protocol upgrade required: version {required}")]
    ProtocolUpgradeRequired { required: u32 },

    #[error("Authentication required")]
    AuthRequired,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable error kind used in wire bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::SyncValidation { .. } => "sync_validation_error",
            AppError::DependencyMissing { .. } => "sync_dependency_missing",
            AppError::PolicyDenied(_) => "sync_policy_denied",
            AppError::Conflict { .. } => "sync_conflict",
            AppError::ProtocolUpgradeRequired { .. } => "protocol_upgrade_required",
            AppError::AuthRequired => "auth_required",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::NotFound(_) => "not_found",
            AppError::SerdeJson(_) => "validation",
            AppError::Internal(_)
            | AppError::Sqlite(_)
            | AppError::Reqwest(_)
            | AppError::Anyhow(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::SyncValidation { .. } | AppError::SerdeJson(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::DependencyMissing { .. } | AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::PolicyDenied(_) | AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::ProtocolUpgradeRequired { .. } => StatusCode::UPGRADE_REQUIRED,
            AppError::AuthRequired => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_)
            | AppError::Sqlite(_)
            | AppError::Reqwest(_)
            | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire body for this error, `{ kind, message, ...context }`.
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        match self {
            AppError::SyncValidation {
                table,
                row_id,
                field,
                ..
            } => {
                body["table"] = json!(table);
                body["row_id"] = json!(row_id);
                body["field"] = json!(field);
            }
            AppError::DependencyMissing {
                table,
                row_id,
                field,
                referenced_table,
            } => {
                body["table"] = json!(table);
                body["row_id"] = json!(row_id);
                body["field"] = json!(field);
                body["referenced_table"] = json!(referenced_table);
            }
            AppError::Conflict { table, row_id, .. } => {
                body["table"] = json!(table);
                body["row_id"] = json!(row_id);
            }
            AppError::ProtocolUpgradeRequired { required } => {
                body["required_version"] = json!(required);
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "ok": false,
            "error": self.to_body(),
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
