//! The dual auth decorator (C3) — every request authenticates one of three ways:
//!
//! - **HMAC** (native clients): `X-Meridian-Client`/`-Timestamp`/`-Nonce`/`-Signature`
//!   headers, verified against the client's `client_sessions.session_secret`.
//!   Canonical signing string: `method|path|timestamp|nonce|rawBody`.
//! - **Session** (browser / Custom Tab): a `meridian_session` cookie of the
//!   form `{client_id}.{secret}`, checked against the same `client_sessions` row.
//! - **Public**: no credentials at all. Handlers that require a user call
//!   [`AuthContext::require_user`] and get `RelayError::AuthMissing` otherwise.
//!
//! Exactly one middleware runs for every route; which branch it takes is
//! determined by which credentials are present, not by the route itself, so
//! the same handler can serve both a native app and a web client.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use chrono::Utc;
use hmac::{Hmac, Mac};
use meridian_common::error::{RelayError, RelayResult};
use meridian_storage::Storage;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Who is making this request, and how they proved it.
#[derive(Debug, Clone)]
pub enum AuthContext {
    /// A native client authenticated via HMAC request signing.
    Hmac { user_id: Uuid, client_id: Uuid, device_id: i64 },
    /// A browser authenticated via the session cookie.
    Session { user_id: Uuid, client_id: Uuid },
    /// No credentials presented.
    Public,
}

impl AuthContext {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::Hmac { user_id, .. } | Self::Session { user_id, .. } => Some(*user_id),
            Self::Public => None,
        }
    }

    pub fn client_id(&self) -> Option<Uuid> {
        match self {
            Self::Hmac { client_id, .. } | Self::Session { client_id, .. } => Some(*client_id),
            Self::Public => None,
        }
    }

    pub fn require_user(&self) -> RelayResult<Uuid> {
        self.user_id().ok_or(RelayError::AuthMissing)
    }

    pub fn require_client(&self) -> RelayResult<(Uuid, Uuid)> {
        match (self.user_id(), self.client_id()) {
            (Some(u), Some(c)) => Ok((u, c)),
            _ => Err(RelayError::AuthMissing),
        }
    }

    pub fn require_hmac(&self) -> RelayResult<(Uuid, Uuid, i64)> {
        match self {
            Self::Hmac { user_id, client_id, device_id } => Ok((*user_id, *client_id, *device_id)),
            _ => Err(RelayError::AuthMissing),
        }
    }
}

/// Dual auth decorator. Runs on every route; inserts an [`AuthContext`]
/// extension that handlers pull out and validate for the access level they need.
pub async fn dual_auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return RelayError::validation("request body too large").into_response(),
    };

    let ctx = match resolve_auth(&state.storage, &parts.headers, parts.uri.path(), parts.method.as_str(), &bytes).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// Resolve an [`AuthContext`] from request headers/cookies. Shared by the
/// REST dual-auth decorator and the Signaling Hub's WS upgrade handler,
/// which authenticates the same way (HMAC headers or session cookie) since
/// a WS upgrade is itself an ordinary HTTP request.
pub async fn resolve_auth(
    storage: &Storage,
    headers: &HeaderMap,
    path: &str,
    method: &str,
    body: &[u8],
) -> RelayResult<AuthContext> {
    if let Some(ctx) = try_hmac_auth(storage, headers, path, method, body).await? {
        return Ok(ctx);
    }
    if let Some(ctx) = try_session_auth(storage, headers).await? {
        return Ok(ctx);
    }
    Ok(AuthContext::Public)
}

pub async fn try_hmac_auth(
    storage: &Storage,
    headers: &HeaderMap,
    path: &str,
    method: &str,
    body: &[u8],
) -> RelayResult<Option<AuthContext>> {
    let (client_id, timestamp, nonce, signature) = match (
        headers.get("x-meridian-client").and_then(|v| v.to_str().ok()),
        headers.get("x-meridian-timestamp").and_then(|v| v.to_str().ok()),
        headers.get("x-meridian-nonce").and_then(|v| v.to_str().ok()),
        headers.get("x-meridian-signature").and_then(|v| v.to_str().ok()),
    ) {
        (Some(c), Some(t), Some(n), Some(s)) => (c, t, n, s),
        _ => return Ok(None),
    };

    let client_id: Uuid = client_id.parse().map_err(|_| RelayError::auth_invalid("malformed client id"))?;
    let timestamp: i64 = timestamp.parse().map_err(|_| RelayError::auth_invalid("malformed timestamp"))?;

    let config = meridian_common::config::get();
    let now = Utc::now().timestamp();
    if (now - timestamp).abs() > config.auth.hmac_skew_secs {
        return Err(RelayError::auth_invalid("timestamp outside allowed skew"));
    }

    if !storage.memory.check_and_record_nonce(nonce, Utc::now()) {
        return Err(RelayError::auth_invalid("nonce replay detected"));
    }

    let session = {
        let conn = storage.db.read()?;
        meridian_storage::repository::auth_tokens::find_client_session(&conn, client_id)?
    }
    .ok_or_else(|| RelayError::auth_invalid("unknown client session"))?;

    if session.expires_at < Utc::now() {
        return Err(RelayError::auth_invalid("client session expired"));
    }

    let canonical = canonical_signing_string(method, path, timestamp, nonce, body);
    let expected = sign_hmac(&session.session_secret, &canonical);
    let provided = hex::decode(signature).map_err(|_| RelayError::auth_invalid("malformed signature"))?;

    if expected.ct_eq(&provided).unwrap_u8() != 1 {
        return Err(RelayError::auth_invalid("signature mismatch"));
    }

    Ok(Some(AuthContext::Hmac { user_id: session.user_id, client_id, device_id: session.device_id }))
}

pub async fn try_session_auth(storage: &Storage, headers: &HeaderMap) -> RelayResult<Option<AuthContext>> {
    let jar = CookieJar::from_headers(headers);
    let Some(cookie) = jar.get("meridian_session") else { return Ok(None) };

    let Some((client_id_str, secret)) = cookie.value().split_once('.') else {
        return Err(RelayError::auth_invalid("malformed session cookie"));
    };
    let client_id: Uuid = client_id_str.parse().map_err(|_| RelayError::auth_invalid("malformed session cookie"))?;

    let session = {
        let conn = storage.db.read()?;
        meridian_storage::repository::auth_tokens::find_client_session(&conn, client_id)?
    }
    .ok_or_else(|| RelayError::auth_invalid("unknown session"))?;

    if session.expires_at < Utc::now() {
        return Err(RelayError::auth_invalid("session expired"));
    }

    if session.session_secret.as_bytes().ct_eq(secret.as_bytes()).unwrap_u8() != 1 {
        return Err(RelayError::auth_invalid("session secret mismatch"));
    }

    Ok(Some(AuthContext::Session { user_id: session.user_id, client_id }))
}

/// `method|path|timestamp|nonce|rawBody`, the exact string both client and
/// server sign over. The body is included raw (pre-parse) so a byte-for-byte
/// tampered body always fails verification.
pub fn canonical_signing_string(method: &str, path: &str, timestamp: i64, nonce: &str, body: &[u8]) -> String {
    format!("{method}|{path}|{timestamp}|{nonce}|{}", String::from_utf8_lossy(body))
}

pub fn sign_hmac(secret: &str, canonical: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_includes_every_field() {
        let s = canonical_signing_string("POST", "/api/v1/client", 1_700_000_000, "abc123", b"{}");
        assert_eq!(s, "POST|/api/v1/client|1700000000|abc123|{}");
    }

    #[test]
    fn sign_hmac_is_deterministic() {
        let a = sign_hmac("secret", "canonical");
        let b = sign_hmac("secret", "canonical");
        assert_eq!(a, b);
        let c = sign_hmac("other-secret", "canonical");
        assert_ne!(a, c);
    }
}
