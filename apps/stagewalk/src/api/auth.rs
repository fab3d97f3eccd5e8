//! # Authentication
//!
//! Optional bearer-key check in front of every session endpoint.
//!
//! - `STAGEWALK_API_KEY`: when set and non-empty, every request except
//!   `GET /health` must carry `Authorization: Bearer <key>` (or the raw key)

use super::types::ErrorResponse;
use axum::{
    Json,
    body::Body,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

pub const API_KEY_ENV: &str = "STAGEWALK_API_KEY";

/// The configured key, if authentication is enabled.
pub fn get_api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// Constant-time key comparison.
///
/// Both sides are padded to the same length before `ct_eq`, so the time
/// spent does not depend on where the keys first differ.
pub fn keys_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    let len = provided.len().max(expected.len());

    let mut a = vec![0u8; len];
    let mut b = vec![0u8; len];
    a[..provided.len()].copy_from_slice(provided);
    b[..expected.len()].copy_from_slice(expected);

    let same_bytes: bool = a.ct_eq(&b).into();
    same_bytes && provided.len() == expected.len()
}

fn unauthorized(reason: &'static str) -> (StatusCode, Json<ErrorResponse>) {
    tracing::warn!(event = "auth_failure", reason, "request rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::message("Unauthorized")),
    )
}

/// Reject requests without the configured key.
pub async fn api_key_auth_middleware(
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = get_api_key_from_env() else {
        return Ok(next.run(request).await);
    };
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

    match provided {
        Some(key) if keys_match(key, &expected) => Ok(next.run(request).await),
        Some(_) => Err(unauthorized("invalid_api_key")),
        None => Err(unauthorized("missing_authorization_header")),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_exact() {
        assert!(keys_match("secret", "secret"));
    }

    #[test]
    fn keys_differ_in_content_or_length() {
        assert!(!keys_match("secreT", "secret"));
        assert!(!keys_match("secret-longer", "secret"));
        assert!(!keys_match("", "secret"));
        assert!(!keys_match("secret", "secret\0"));
    }
}
