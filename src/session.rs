//! Cookie session token identifying a caller.
//!
//! The token carries no data of its own; it only keys the caller's captcha
//! challenge and rate-limit bucket. It is rotated every time a new challenge
//! is issued.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderValue},
};
use std::convert::Infallible;

pub const COOKIE_NAME: &str = "jamthemes_session";

/// Cookie lifetime (24 hours)
const MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// The caller's current session token, if their cookie carried a valid one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub token: Option<String>,
}

impl Session {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            token: token_from_headers(headers),
        }
    }

    /// Produce a fresh token, returning it alongside the one it replaces
    pub fn rotate(&self) -> (Option<&str>, String) {
        (self.token.as_deref(), new_token())
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Session::from_headers(&parts.headers))
    }
}

pub fn new_token() -> String {
    ulid::Ulid::new().to_string()
}

/// Extract the session token from any `Cookie` header.
///
/// Values that are not well-formed tokens are ignored.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(cookies) = value.to_str() else {
            continue;
        };
        for pair in cookies.split(';') {
            let Some((name, token)) = pair.trim().split_once('=') else {
                continue;
            };
            if name == COOKIE_NAME && ulid::Ulid::from_string(token).is_ok() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// `Set-Cookie` value that hands `token` to the browser
pub fn set_cookie(token: &str) -> HeaderValue {
    let cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        COOKIE_NAME, token, MAX_AGE_SECS
    );
    // Tokens are ULIDs, always valid header text
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_token_from_headers() {
        let token = new_token();
        let headers = headers_with_cookie(&format!("theme=dark; {}={}; other=1", COOKIE_NAME, token));
        assert_eq!(token_from_headers(&headers), Some(token));
    }

    #[test]
    fn test_missing_or_invalid_cookie() {
        assert_eq!(token_from_headers(&HeaderMap::new()), None);

        let headers = headers_with_cookie(&format!("{}=not-a-token", COOKIE_NAME));
        assert_eq!(token_from_headers(&headers), None);

        let headers = headers_with_cookie("unrelated=01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(token_from_headers(&headers), None);
    }

    #[test]
    fn test_rotate_returns_previous() {
        let session = Session {
            token: Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()),
        };
        let (previous, next) = session.rotate();

        assert_eq!(previous, Some("01ARZ3NDEKTSV4RRFFQ69G5FAV"));
        assert_ne!(next, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
    }

    #[test]
    fn test_set_cookie_roundtrips() {
        let token = new_token();
        let value = set_cookie(&token);
        let cookie = value.to_str().unwrap();

        assert!(cookie.contains("HttpOnly"));
        let pair = cookie.split(';').next().unwrap();
        assert_eq!(token_from_headers(&headers_with_cookie(pair)), Some(token));
    }
}
