//! # Rate Limiting
//!
//! One global token bucket shared by all participants.
//!
//! - `STAGEWALK_RATE_LIMIT`: requests per second (default 100, `0` disables)

use super::types::ErrorResponse;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use std::num::NonZeroU32;
use std::sync::Arc;

pub const RATE_LIMIT_ENV: &str = "STAGEWALK_RATE_LIMIT";

/// Requests per second when the variable is unset or unparsable.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// A limiter allowing `requests_per_second`, or `None` when limiting is off.
pub fn create_rate_limiter(requests_per_second: u32) -> Option<GlobalRateLimiter> {
    let rps = NonZeroU32::new(requests_per_second)?;
    Some(Arc::new(RateLimiter::direct(Quota::per_second(rps))))
}

pub fn get_rate_limit_from_env() -> u32 {
    std::env::var(RATE_LIMIT_ENV)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_RATE_LIMIT)
}

/// Answer 429 once the bucket is empty.
pub async fn rate_limit_middleware(
    State(limiter): State<GlobalRateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    if limiter.check().is_err() {
        tracing::warn!(path = %request.uri().path(), "rate limit exceeded");
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::message("Too Many Requests")),
        ));
    }
    Ok(next.run(request).await)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_first_request() {
        let limiter = create_rate_limiter(5).unwrap();
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn zero_disables_limiting() {
        assert!(create_rate_limiter(0).is_none());
    }

    #[test]
    fn bucket_runs_dry() {
        let limiter = create_rate_limiter(1).unwrap();
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
