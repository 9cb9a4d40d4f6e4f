// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Extracts and validates a Bearer token from the `Authorization` header.
// The expected token is read from the `MERIDIAN_ADMIN_TOKEN` environment
// variable. Comparison is performed in constant time to prevent timing
// side-channels.
//
// Usage as an Axum extractor:
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
//
// If the token is missing or invalid, the extractor short-circuits the
// request with a 403 before the handler body executes.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Environment variable holding the operator token.
pub const ADMIN_TOKEN_ENV: &str = "MERIDIAN_ADMIN_TOKEN";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison always examines
/// every byte even when a mismatch is found early.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validate a presented token against the configured one. An unset or empty
/// env var disables authentication (local development).
pub fn validate_token(presented: &str) -> bool {
    match std::env::var(ADMIN_TOKEN_ENV) {
        Ok(expected) if !expected.is_empty() => {
            constant_time_eq(presented.as_bytes(), expected.as_bytes())
        }
        _ => true,
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor validating `Authorization: Bearer <token>` against
/// `MERIDIAN_ADMIN_TOKEN`.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        let token = header.strip_prefix("Bearer ").unwrap_or_default();

        if validate_token(token) {
            Ok(AuthBearer(token.to_string()))
        } else {
            warn!("request rejected: invalid bearer token");
            Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid or missing bearer token",
            })
        }
    }
}
