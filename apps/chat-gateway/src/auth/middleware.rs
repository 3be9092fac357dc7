//! Credential extraction for the WebSocket upgrade.
//!
//! Browsers cannot set headers on a WebSocket handshake, so the token may
//! arrive in several places. They are probed in this order, and the first
//! candidate that validates wins:
//!
//!   1. `?token=` query parameter
//!   2. `token` cookie
//!   3. `Authorization: Bearer <jwt>`
//!   4. `Sec-WebSocket-Protocol`, as a `token=<jwt>` entry or a bare entry
//!
//! Plain HTTP routes use [`AuthUser`], which accepts only a bearer token.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use messenger_common::UserId;
use serde::Deserialize;

use crate::AppState;

/// Name of the query parameter and cookie carrying the token.
const TOKEN_FIELD: &str = "token";

/// Where a credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Query,
    Cookie,
    Bearer,
    Subprotocol,
}

/// A credential candidate, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: CredentialSource,
    pub token: String,
    /// The raw subprotocol entry that carried the token, echoed back on
    /// upgrade so the browser accepts the handshake.
    pub protocol: Option<String>,
}

/// Authenticated user for a WebSocket upgrade.
#[derive(Debug, Clone)]
pub struct WsAuth {
    pub user_id: UserId,
    pub source: CredentialSource,
    pub protocol: Option<String>,
}

/// Rejection: bare 401. The connection has not upgraded yet, so no JSON body.
#[derive(Debug)]
pub struct WsAuthRejection;

impl IntoResponse for WsAuthRejection {
    fn into_response(self) -> Response {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

/// Authenticated user extracted from a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
}

/// Rejection returned when the bearer token is missing or invalid.
pub struct AuthError {
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": self.message
            }
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Collect every credential candidate in precedence order.
pub fn candidates(parts: &Parts) -> Vec<Candidate> {
    let mut found = Vec::new();
    let mut push = |source, token: &str, protocol: Option<String>| {
        let token = token.trim();
        if !token.is_empty() {
            found.push(Candidate {
                source,
                token: token.to_string(),
                protocol,
            });
        }
    };

    if let Ok(Query(TokenQuery { token: Some(token) })) =
        Query::<TokenQuery>::try_from_uri(&parts.uri)
    {
        push(CredentialSource::Query, &token, None);
    }

    if let Some(cookie) = CookieJar::from_headers(&parts.headers).get(TOKEN_FIELD) {
        push(CredentialSource::Cookie, cookie.value(), None);
    }

    if let Some(token) = bearer_token(&parts.headers) {
        push(CredentialSource::Bearer, token, None);
    }

    for entry in subprotocol_entries(&parts.headers) {
        let token = entry
            .strip_prefix("token=")
            .unwrap_or(entry.as_str())
            .to_string();
        push(CredentialSource::Subprotocol, &token, Some(entry));
    }

    found
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn subprotocol_entries(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

impl FromRequestParts<AppState> for WsAuth {
    type Rejection = WsAuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        for candidate in candidates(parts) {
            match state.tokens.verify(&candidate.token) {
                Ok(user_id) => {
                    tracing::debug!(
                        user_id,
                        source = ?candidate.source,
                        "websocket credential accepted"
                    );
                    return Ok(WsAuth {
                        user_id,
                        source: candidate.source,
                        protocol: candidate.protocol,
                    });
                }
                Err(err) => {
                    tracing::debug!(
                        ?err,
                        source = ?candidate.source,
                        "websocket credential rejected"
                    );
                }
            }
        }

        Err(WsAuthRejection)
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError {
                message: "Missing Authorization header",
            })?;

        let token = header.strip_prefix("Bearer ").ok_or(AuthError {
            message: "Invalid Authorization header format",
        })?;

        let user_id = state.tokens.verify(token).map_err(|_| AuthError {
            message: "Invalid or expired token",
        })?;

        Ok(AuthUser { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn candidates_follow_precedence() {
        let parts = parts(
            "/ws?token=q",
            &[
                ("cookie", "theme=dark; token=c"),
                ("authorization", "Bearer b"),
                ("sec-websocket-protocol", "chat, token=p"),
            ],
        );

        let found: Vec<_> = candidates(&parts)
            .into_iter()
            .map(|c| (c.source, c.token))
            .collect();

        assert_eq!(
            found,
            vec![
                (CredentialSource::Query, "q".to_string()),
                (CredentialSource::Cookie, "c".to_string()),
                (CredentialSource::Bearer, "b".to_string()),
                (CredentialSource::Subprotocol, "chat".to_string()),
                (CredentialSource::Subprotocol, "p".to_string()),
            ]
        );
    }

    #[test]
    fn subprotocol_candidate_remembers_entry() {
        let parts = parts("/ws", &[("sec-websocket-protocol", "token=abc")]);
        let found = candidates(&parts);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].token, "abc");
        assert_eq!(found[0].protocol.as_deref(), Some("token=abc"));
    }

    #[test]
    fn empty_and_malformed_values_are_skipped() {
        let parts = parts(
            "/ws?token=",
            &[("authorization", "Basic abc"), ("cookie", "other=1")],
        );
        assert!(candidates(&parts).is_empty());
    }
}
