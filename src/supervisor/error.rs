//! Warden error taxonomy. Variants are distinguished so API handlers can map
//! each failure to an HTTP status and a structured `{status, message}` payload
//! instead of a bare 500.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum WardenError {
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("No free port in range {lo}-{hi}")]
    PortExhaustion { lo: u16, hi: u16 },

    #[error("Failed to spawn '{name}': {reason}")]
    Spawn { name: String, reason: String },

    #[error("Health check for '{0}' timed out")]
    HealthCheckTimeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Missing required fields: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl WardenError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PortExhaustion { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HealthCheckTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Self::PortExhaustion { .. } => "PORT_EXHAUSTION",
            Self::Spawn { .. } => "PROCESS_SPAWN_ERROR",
            Self::HealthCheckTimeout(_) => "HEALTH_CHECK_TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON error payload served by the control API.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "error",
            "message": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

/// Lets axum handlers return a WardenError directly.
impl axum::response::IntoResponse for WardenError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
