//! Authentication for the three caller populations.
//!
//! - Terminal EAs calling webhooks: a static shared secret in `x-api-key`,
//!   or the terminal's own signed token in the request body. Fails closed.
//! - End users calling the management surface: bearer JWT, verified only —
//!   issuance belongs to the identity service.
//! - The external orchestrator: a dedicated shared secret header.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::application::handlers::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ORCHESTRATOR_SECRET_HEADER: &str = "x-orchestrator-secret";

/// Authenticated end user, inserted into request extensions by the
/// management-surface middleware.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub String);

#[derive(Debug, Serialize, Deserialize)]
struct TerminalClaims {
    /// Terminal id.
    sub: String,
    iat: i64,
    exp: i64,
}

/// Signs and verifies per-terminal webhook tokens (HS256).
pub struct TerminalTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: u64,
}

impl TerminalTokenService {
    pub fn new(secret: &str, ttl_seconds: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_seconds,
        }
    }

    pub fn sign_terminal_token(&self, terminal_id: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = TerminalClaims {
            sub: terminal_id.to_string(),
            iat: now,
            exp: now + self.ttl_seconds as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    /// Returns the terminal id the token was issued for, or None.
    pub fn verify_terminal_token(&self, token: &str) -> Option<String> {
        decode::<TerminalClaims>(token, &self.decoding, &Validation::default())
            .ok()
            .map(|data| data.claims.sub)
    }
}

#[derive(Debug, Deserialize)]
struct UserClaims {
    sub: String,
    #[allow(dead_code)]
    exp: i64,
}

/// Verifies end-user session JWTs. Verification contract only.
pub struct UserAuth {
    decoding: DecodingKey,
}

impl UserAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify_user_token(&self, token: &str) -> Option<String> {
        decode::<UserClaims>(token, &self.decoding, &Validation::default())
            .ok()
            .map(|data| data.claims.sub)
    }
}

/// Webhook auth: a valid per-terminal token for this terminal, or the
/// static shared secret. No partial processing on failure.
pub fn authorize_terminal_call(
    webhook_secret: &str,
    tokens: &TerminalTokenService,
    headers: &HeaderMap,
    auth_token: Option<&str>,
    terminal_id: &str,
) -> bool {
    if let Some(token) = auth_token {
        return match tokens.verify_terminal_token(token) {
            Some(subject) if subject == terminal_id => true,
            _ => {
                tracing::warn!("Invalid terminal auth token for terminal {}", terminal_id);
                false
            }
        };
    }

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if api_key.is_empty() || api_key != webhook_secret {
        tracing::warn!("Invalid webhook API key for terminal {}", terminal_id);
        return false;
    }

    true
}

/// Orchestrator feed auth: dedicated shared secret header.
pub fn authorize_orchestrator_call(orchestrator_secret: &str, headers: &HeaderMap) -> bool {
    headers
        .get(ORCHESTRATOR_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|provided| provided == orchestrator_secret)
        .unwrap_or(false)
}

/// Middleware guarding the user-facing management surface. On success the
/// authenticated user id is available via `Extension<AuthedUser>`.
pub async fn require_user_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    match header {
        Some(auth) if auth.starts_with("Bearer ") => {
            let token = &auth[7..];
            match state.user_auth.verify_user_token(token) {
                Some(user_id) => {
                    request.extensions_mut().insert(AuthedUser(user_id));
                    Ok(next.run(request).await)
                }
                None => {
                    tracing::warn!("Rejected management call with invalid session token");
                    Err(StatusCode::UNAUTHORIZED)
                }
            }
        }
        Some(_) => {
            tracing::warn!("Malformed Authorization header (expected Bearer token)");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn tokens() -> TerminalTokenService {
        TerminalTokenService::new("test-signing-secret-0123456789abcdef", 3600)
    }

    #[test]
    fn test_terminal_token_round_trip() {
        let service = tokens();
        let token = service.sign_terminal_token("term-1").unwrap();
        assert_eq!(service.verify_terminal_token(&token).as_deref(), Some("term-1"));
    }

    #[test]
    fn test_terminal_token_wrong_secret_rejected() {
        let token = tokens().sign_terminal_token("term-1").unwrap();
        let other = TerminalTokenService::new("a-completely-different-secret-key", 3600);
        assert!(other.verify_terminal_token(&token).is_none());
    }

    #[test]
    fn test_token_bound_to_terminal() {
        let service = tokens();
        let token = service.sign_terminal_token("term-1").unwrap();
        let headers = HeaderMap::new();

        assert!(authorize_terminal_call(
            "shared", &service, &headers, Some(&token), "term-1"
        ));
        // Valid token for a different terminal must not authorize this one.
        assert!(!authorize_terminal_call(
            "shared", &service, &headers, Some(&token), "term-2"
        ));
    }

    #[test]
    fn test_shared_secret_path() {
        let service = tokens();
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("farm-secret"));

        assert!(authorize_terminal_call(
            "farm-secret", &service, &headers, None, "term-1"
        ));
        assert!(!authorize_terminal_call(
            "other-secret", &service, &headers, None, "term-1"
        ));

        let empty = HeaderMap::new();
        assert!(!authorize_terminal_call(
            "farm-secret", &service, &empty, None, "term-1"
        ));
    }

    #[test]
    fn test_orchestrator_secret() {
        let mut headers = HeaderMap::new();
        headers.insert(
            ORCHESTRATOR_SECRET_HEADER,
            HeaderValue::from_static("orch-secret"),
        );
        assert!(authorize_orchestrator_call("orch-secret", &headers));
        assert!(!authorize_orchestrator_call("different", &headers));
        assert!(!authorize_orchestrator_call("orch-secret", &HeaderMap::new()));
    }

    #[test]
    fn test_user_token_verification() {
        // Issue a token the way the identity service would.
        let secret = "user-session-secret";
        let claims = serde_json::json!({
            "sub": "user-42",
            "exp": Utc::now().timestamp() + 600
        });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let auth = UserAuth::new(secret);
        assert_eq!(auth.verify_user_token(&token).as_deref(), Some("user-42"));
        assert!(auth.verify_user_token("not-a-jwt").is_none());
    }
}
