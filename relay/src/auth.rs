//! Bearer token check performed before every WebSocket upgrade.

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Reject the handshake unless it carries `Authorization: Bearer <token>`.
///
/// Both a missing header and a wrong token answer `401 Unauthorized`, the
/// status an expired token produces on the real relay.
pub fn authorize(headers: &HeaderMap, expected: &str) -> Result<(), Response> {
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(expected.as_bytes(), token.as_bytes()) => Ok(()),
        Some(_) => Err(unauthorized("Invalid or expired access token")),
        None => Err(unauthorized("Missing or invalid Authorization header")),
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

/// Compare without short-circuiting on the first differing byte.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn test_accepts_matching_bearer() {
        assert!(authorize(&headers("Bearer s3cret"), "s3cret").is_ok());
    }

    #[test]
    fn test_rejects_wrong_or_missing() {
        let wrong = authorize(&headers("Bearer nope"), "s3cret").unwrap_err();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        let scheme = authorize(&headers("Token s3cret"), "s3cret").unwrap_err();
        assert_eq!(scheme.status(), StatusCode::UNAUTHORIZED);
        let missing = authorize(&HeaderMap::new(), "s3cret").unwrap_err();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
