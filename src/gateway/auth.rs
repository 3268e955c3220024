use axum::http::HeaderMap;

use crate::{
    breaker::BreakerError,
    domain::UserId,
    error::ErrorCategory,
    external::AuthClient as _,
    gateway::{ApiError, GatewayState},
};

/// Authenticates a request from its `Authorization: Bearer` and
/// `X-CSRF-Token` headers.
///
/// Auth-service calls run behind the auth circuit breaker; an open breaker
/// surfaces as UNAVAILABLE without the call being attempted.
pub async fn authenticate(state: &GatewayState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let token = bearer_token(headers).ok_or_else(|| {
        ApiError::new(
            ErrorCategory::Authentication,
            "missing or malformed Authorization header",
        )
    })?;
    if headers.get("x-csrf-token").is_none() {
        return Err(ApiError::new(
            ErrorCategory::Authentication,
            "missing X-CSRF-Token header",
        ));
    }

    let result = state
        .auth_breaker
        .call(state.auth.validate_token(&token))
        .await
        .map_err(|err| match err {
            BreakerError::Open(name) => ApiError::new(
                ErrorCategory::Unavailable,
                format!("auth service unavailable (circuit '{name}' open)"),
            ),
            BreakerError::Inner(inner) => ApiError::from(inner),
        })?;

    match (result.valid, result.user_id) {
        (true, Some(user_id)) => Ok(user_id),
        _ => Err(ApiError::new(
            ErrorCategory::Authentication,
            "invalid or expired token",
        )),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

#[cfg(test)]
mod test {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok-1"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcg=="),
        );
        assert!(bearer_token(&headers).is_none());
    }
}
