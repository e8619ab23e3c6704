//! Authentication routes (C3) — the full passwordless HTTP surface:
//! registration/OTP, WebAuthn passkeys, backup codes, the hand-off/refresh
//! token exchange, client (device) and HMAC-session management, magic
//! links, and logout. No password login path exists anywhere here.
//!
//! Everything that establishes or tears down a session funnels through
//! [`establish_session`] and [`session_cookie`] so a native client (HMAC +
//! refresh token) and a browser (session cookie only) get identical
//! treatment from the same handler.

use axum::{
    extract::{Extension, State},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use meridian_common::{
    error::{RelayError, RelayResult},
    models::{
        admin::VerifyInvitationRequest,
        client::{AddWebClientRequest, ClientResponse, DeviceInfo},
        user::{OtpVerifyRequest, RegisterRequest, User, UserResponse},
    },
    validation::validate_request,
};
use meridian_storage::{
    memory::MagicLinkEntry,
    repository::{admin, auth_tokens, clients, roles, users},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use crate::{auth, middleware::AuthContext, AppState};

/// WebAuthn ceremony states and the custom-tab CSRF value live this long
/// in [`meridian_storage::memory::MemoryStore`] before they're unusable.
const WEBAUTHN_CHALLENGE_TTL_SECS: i64 = 300;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/otp", post(verify_otp))
        .route("/webauthn/register-challenge", post(webauthn_register_challenge))
        .route("/webauthn/register", post(webauthn_register))
        .route("/webauthn/authenticate-challenge", post(webauthn_authenticate_challenge))
        .route("/webauthn/authenticate", post(webauthn_authenticate))
        .route("/webauthn/delete", post(webauthn_delete))
        .route("/webauthn/list", get(webauthn_list))
        .route("/backupcode/mobile-verify", post(backup_code_mobile_verify))
        .route("/backupcode/list", get(backup_code_list))
        .route("/backupcode/usage", get(backup_code_usage))
        .route("/backupcode/regenerate", post(backup_code_regenerate))
        .route("/backupcode/verify", post(backup_code_verify))
        .route("/token/exchange", post(token_exchange))
        .route("/token/refresh", post(token_refresh))
        .route("/token/revoke", post(token_revoke))
        .route("/session/refresh", post(session_refresh))
        .route("/client/addweb", post(client_addweb))
        .route("/client/list", get(client_list))
        .route("/client/delete", post(client_delete))
        .route("/sessions/list", get(sessions_list))
        .route("/sessions/revoke", post(sessions_revoke))
        .route("/sessions/revoke-all", post(sessions_revoke_all))
        .route("/magic/generate", get(magic_generate))
        .route("/invitations/verify", post(invitations_verify))
        .route("/logout", post(logout))
}

// ============================================================
// Shared session plumbing
// ============================================================

struct SessionBundle {
    client_id: Uuid,
    #[allow(dead_code)]
    device_id: i64,
    session_secret: String,
    refresh_token: Option<String>,
}

/// Bind (or rebind) a `client_sessions` row for `user_id` and, only for
/// native clients (a `client_id` was actually supplied), mint a refresh
/// token alongside it. Browsers get the session cookie without a refresh
/// token — their session is extended via `/session/refresh` instead.
fn establish_session(
    conn: &rusqlite::Connection,
    user_id: Uuid,
    client_id: Option<Uuid>,
    device_info: Option<DeviceInfo>,
) -> RelayResult<SessionBundle> {
    let config = meridian_common::config::get();
    let is_native = client_id.is_some();
    let client_id = client_id.unwrap_or_else(Uuid::new_v4);
    let device_info = device_info.unwrap_or_default();

    let client = clients::find_or_create_client(conn, client_id, user_id, &device_info)?;
    let device_info_json = serde_json::to_string(&device_info).ok();
    let session = auth_tokens::upsert_client_session(
        conn,
        client_id,
        user_id,
        client.device_id,
        chrono::Duration::seconds(config.auth.hmac_session_ttl_secs),
        device_info_json.as_deref(),
    )?;

    let refresh_token = if is_native {
        Some(
            auth_tokens::create_refresh_token(
                conn,
                client_id,
                user_id,
                chrono::Duration::seconds(config.auth.refresh_token_ttl_secs),
            )?
            .token,
        )
    } else {
        None
    };

    Ok(SessionBundle { client_id, device_id: client.device_id, session_secret: session.session_secret, refresh_token })
}

fn session_cookie(client_id: Uuid, secret: &str) -> Cookie<'static> {
    let mut cookie = Cookie::new("meridian_session", format!("{client_id}.{secret}"));
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(axum_extra::extract::cookie::SameSite::Lax);
    cookie
}

fn is_admin_email(email: &str) -> bool {
    meridian_common::config::get().auth.admin_emails.iter().any(|e| e.eq_ignore_ascii_case(email))
}

/// Registration is a linear state machine: `none → otp → backup_codes
/// → webauthn → profile → complete`, tracked per-email in
/// [`meridian_storage::memory::MemoryStore`]. There is no server-side reset
/// once `backup_codes` is reached — a request aimed at the wrong step is
/// refused with the step the caller is actually on, rather than silently
/// advanced or rewound. `none` and `complete` are not "mid-flow": an
/// already-registered user adding a second passkey later hits neither gate.
fn enforce_registration_step(state: &AppState, email: &str, required: &str) -> RelayResult<()> {
    let step = state.storage.memory.registration_step(email);
    if step == "none" || step == "complete" {
        return Ok(());
    }
    if step != required {
        return Err(RelayError::conflict(format!("registration step is '{step}', expected '{required}'")));
    }
    Ok(())
}

/// Resolve the identity a WebAuthn ceremony acts on: the caller's own
/// session if authenticated (adding a second passkey), otherwise the email
/// presented mid-registration.
fn resolve_identity(state: &AppState, auth_ctx: &AuthContext, email: Option<&str>) -> RelayResult<User> {
    let conn = state.storage.db.read()?;
    if let Some(user_id) = auth_ctx.user_id() {
        return users::find_by_id(&conn, user_id)?.ok_or_else(|| RelayError::not_found("user"));
    }
    let email = email.ok_or_else(|| RelayError::validation("email is required"))?.trim().to_lowercase();
    users::find_by_email(&conn, &email)?.ok_or_else(|| RelayError::not_found("user"))
}

#[derive(Debug, Serialize)]
struct AuthSuccessResponse {
    status: &'static str,
    user: Option<UserResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handoff_token: Option<String>,
}

// ============================================================
// Registration / OTP
// ============================================================

#[derive(Debug, Serialize)]
struct RegisterResponse {
    status: String,
    wait: i64,
}

/// POST /api/v1/register — public.
async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> RelayResult<Json<RegisterResponse>> {
    validate_request(&body)?;
    let email = body.email.trim().to_lowercase();
    let now = Utc::now();

    if let Some(remaining) = state.storage.memory.otp_wait_remaining(&email, now) {
        return Ok(Json(RegisterResponse { status: "waitotp".to_string(), wait: remaining.num_seconds().max(1) }));
    }

    // Restartable only up through the `otp` step; past `backup_codes` there
    // is no server-side reset.
    let step = state.storage.memory.registration_step(&email);
    if matches!(step.as_str(), "backup_codes" | "webauthn" | "profile") {
        return Err(RelayError::conflict(format!(
            "registration already in progress at step '{step}'; finish it before restarting"
        )));
    }

    let invitation_token = body.invitation_token.clone();
    let email_for_write = email.clone();
    state
        .storage
        .db
        .write("register", move |conn| {
            auth::check_registration_mode(conn, &email_for_write, invitation_token.as_deref())?;
            if users::find_by_email(conn, &email_for_write)?.is_none() {
                users::create_user(conn, &email_for_write)?;
            }
            Ok::<(), RelayError>(())
        })
        .await?;

    if let Some(token) = body.invitation_token {
        state.storage.memory.put_pending_invitation(&email, token);
    }

    let config = meridian_common::config::get();
    let code = auth::generate_otp();
    state.storage.memory.put_otp(&email, code.clone(), now + chrono::Duration::seconds(config.auth.otp_ttl_secs));
    state.storage.memory.set_registration_step(&email, "otp");

    tracing::info!(email = %email, otp = %code, "registration OTP issued (no SMTP transport configured; logged for manual delivery)");

    Ok(Json(RegisterResponse { status: "otp".to_string(), wait: config.auth.otp_ttl_secs }))
}

/// POST /api/v1/otp — public. Verification always establishes a session;
/// a fresh account additionally generates its one-time backup-code set and
/// reports `registration_step: "backup_codes"` so the client continues the
/// linear registration flow instead of treating this as a finished login.
async fn verify_otp(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<OtpVerifyRequest>,
) -> RelayResult<(CookieJar, Json<AuthSuccessResponse>)> {
    validate_request(&body)?;
    let email = body.email.trim().to_lowercase();
    let now = Utc::now();

    if !state.storage.memory.verify_and_consume_otp(&email, &body.otp, now) {
        return Err(RelayError::auth_invalid("invalid or expired OTP"));
    }

    let config = meridian_common::config::get();
    let is_admin = is_admin_email(&email);
    let pending_invitation = state.storage.memory.take_pending_invitation(&email);
    let client_id = body.client_id;
    let backup_code_count = config.auth.backup_code_count as usize;

    struct Outcome {
        user: User,
        fresh_registration: bool,
        bundle: SessionBundle,
        fresh_codes: Option<Vec<String>>,
    }

    let email_for_write = email.clone();
    let outcome = state
        .storage
        .db
        .write("otp_verify", move |conn| {
            let user = users::find_by_email(conn, &email_for_write)?.ok_or_else(|| RelayError::not_found("user"))?;
            users::mark_verified(conn, user.id)?;
            roles::ensure_server_role_assigned(conn, user.id, "User")?;
            if is_admin {
                roles::ensure_server_role_assigned(conn, user.id, "Administrator")?;
            }
            if let Some(token) = &pending_invitation {
                // Already validated non-consumingly at /register; a concurrent
                // redemption elsewhere is the only way this now fails, and the
                // account still registers successfully either way.
                let _ = admin::verify_and_consume_invitation(conn, &email_for_write, token, Utc::now());
            }

            let fresh_registration = user.credentials.is_empty() && user.backup_codes.is_empty();
            let fresh_codes = if fresh_registration {
                let (plain, hashes) = auth::generate_backup_codes(backup_code_count)?;
                users::set_backup_codes(conn, user.id, &hashes)?;
                Some(plain)
            } else {
                None
            };

            let bundle = establish_session(conn, user.id, client_id, None)?;
            let user = users::find_by_id(conn, user.id)?.ok_or_else(|| RelayError::not_found("user"))?;
            Ok::<_, RelayError>(Outcome { user, fresh_registration, bundle, fresh_codes })
        })
        .await?;

    if outcome.fresh_registration {
        state.storage.memory.set_registration_step(&email, "backup_codes");
        if let Some(codes) = outcome.fresh_codes {
            state.storage.memory.put_backup_code_plaintext(outcome.user.id, codes);
        }
    } else {
        state.storage.memory.clear_registration_step(&email);
    }

    let jar = jar.add(session_cookie(outcome.bundle.client_id, &outcome.bundle.session_secret));
    Ok((
        jar,
        Json(AuthSuccessResponse {
            status: "ok",
            user: Some(outcome.user.into()),
            registration_step: outcome.fresh_registration.then(|| "backup_codes".to_string()),
            client_id: Some(outcome.bundle.client_id),
            session_secret: Some(outcome.bundle.session_secret),
            refresh_token: outcome.bundle.refresh_token,
            handoff_token: None,
        }),
    ))
}

// ============================================================
// WebAuthn
// ============================================================

#[derive(Debug, Deserialize)]
struct WebauthnChallengeRequest {
    email: Option<String>,
}

/// POST /api/v1/webauthn/register-challenge
async fn webauthn_register_challenge(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebauthnChallengeRequest>,
) -> RelayResult<Json<CreationChallengeResponse>> {
    let user = resolve_identity(&state, &auth_ctx, body.email.as_deref())?;
    enforce_registration_step(&state, &user.email, "webauthn")?;

    let existing: Vec<Passkey> =
        user.credentials.iter().filter_map(|c| serde_json::from_str(&c.passkey_json).ok()).collect();
    let exclude = (!existing.is_empty()).then(|| existing.iter().map(|p| p.cred_id().clone()).collect());

    let display_name = user.display_name.clone().unwrap_or_else(|| user.email.clone());
    let (ccr, reg_state) = auth::webauthn()
        .start_passkey_registration(user.id, &user.email, &display_name, exclude)
        .map_err(|e| RelayError::internal(format!("starting passkey registration: {e}")))?;

    let state_json = serde_json::to_string(&reg_state).map_err(|e| RelayError::internal(e.to_string()))?;
    state.storage.memory.put_challenge(
        format!("webauthn_reg:{}", user.email),
        state_json,
        Utc::now() + chrono::Duration::seconds(WEBAUTHN_CHALLENGE_TTL_SECS),
    );

    Ok(Json(ccr))
}

#[derive(Debug, Deserialize)]
struct WebauthnRegisterRequest {
    email: Option<String>,
    credential: RegisterPublicKeyCredential,
}

/// POST /api/v1/webauthn/register
async fn webauthn_register(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebauthnRegisterRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user = resolve_identity(&state, &auth_ctx, body.email.as_deref())?;
    enforce_registration_step(&state, &user.email, "webauthn")?;
    let now = Utc::now();

    let state_json = state
        .storage
        .memory
        .take_challenge(&format!("webauthn_reg:{}", user.email), now)
        .ok_or_else(|| RelayError::auth_invalid("no pending registration challenge"))?;
    let reg_state: PasskeyRegistration =
        serde_json::from_str(&state_json).map_err(|e| RelayError::internal(e.to_string()))?;

    let passkey = auth::webauthn()
        .finish_passkey_registration(&body.credential, &reg_state)
        .map_err(|e| RelayError::auth_invalid(format!("passkey registration failed: {e}")))?;

    // `hybrid` (cross-device) is always accepted even when the authenticator
    // didn't report it, since a cross-device QR flow is always a possible
    // future login path for this credential.
    let mut transports: Vec<String> = body
        .credential
        .response
        .transports
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| serde_json::to_string(&t).ok().map(|s| s.trim_matches('"').to_string()))
        .collect();
    if !transports.iter().any(|t| t == "hybrid") {
        transports.push("hybrid".to_string());
    }

    let credential_id = URL_SAFE_NO_PAD.encode(passkey.cred_id().as_ref());
    let passkey_json = serde_json::to_string(&passkey).map_err(|e| RelayError::internal(e.to_string()))?;
    let cred = meridian_common::models::user::WebAuthnCredential {
        id: credential_id,
        passkey_json,
        transports,
        created_at: now,
        last_login: None,
        browser: None,
        ip: None,
        location: None,
    };

    let user_id = user.id;
    state.storage.db.write("webauthn_register", move |conn| users::add_credential(conn, user_id, &cred)).await?;
    state.storage.memory.set_registration_step(&user.email, "profile");

    Ok(Json(serde_json::json!({ "status": "ok", "registration_step": "profile" })))
}

#[derive(Debug, Deserialize)]
struct WebauthnAuthChallengeRequest {
    email: String,
    from_custom_tab: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WebauthnAuthChallengeResponse {
    challenge: RequestChallengeResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
}

/// POST /api/v1/webauthn/authenticate-challenge — public.
async fn webauthn_authenticate_challenge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebauthnAuthChallengeRequest>,
) -> RelayResult<Json<WebauthnAuthChallengeResponse>> {
    let email = body.email.trim().to_lowercase();
    let user = {
        let conn = state.storage.db.read()?;
        users::find_by_email(&conn, &email)?.ok_or_else(|| RelayError::not_found("user"))?
    };

    let passkeys: Vec<Passkey> =
        user.credentials.iter().filter_map(|c| serde_json::from_str(&c.passkey_json).ok()).collect();
    if passkeys.is_empty() {
        return Err(RelayError::not_found("credential"));
    }

    let (rcr, auth_state) = auth::webauthn()
        .start_passkey_authentication(&passkeys)
        .map_err(|e| RelayError::internal(format!("starting passkey authentication: {e}")))?;

    let now = Utc::now();
    let auth_state_json = serde_json::to_string(&auth_state).map_err(|e| RelayError::internal(e.to_string()))?;
    state.storage.memory.put_challenge(
        format!("webauthn_auth:{email}"),
        auth_state_json,
        now + chrono::Duration::seconds(WEBAUTHN_CHALLENGE_TTL_SECS),
    );

    let csrf_state = body.from_custom_tab.unwrap_or(false).then(|| {
        let token = hex::encode(rand::random::<[u8; 16]>());
        state.storage.memory.put_challenge(
            format!("custom_tab_state:{email}"),
            token.clone(),
            now + chrono::Duration::seconds(WEBAUTHN_CHALLENGE_TTL_SECS),
        );
        token
    });

    Ok(Json(WebauthnAuthChallengeResponse { challenge: rcr, state: csrf_state }))
}

#[derive(Debug, Deserialize)]
struct WebauthnAuthenticateRequest {
    email: String,
    assertion: PublicKeyCredential,
    from_custom_tab: Option<bool>,
    state: Option<String>,
    client_id: Option<Uuid>,
    device_info: Option<DeviceInfo>,
}

/// POST /api/v1/webauthn/authenticate — public. A verified Custom-Tab
/// ceremony gets a one-shot hand-off token and no session; every other
/// caller gets a session directly (see [`establish_session`]).
async fn webauthn_authenticate(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<WebauthnAuthenticateRequest>,
) -> RelayResult<(CookieJar, Json<AuthSuccessResponse>)> {
    let email = body.email.trim().to_lowercase();
    let now = Utc::now();
    let from_custom_tab = body.from_custom_tab.unwrap_or(false);

    if from_custom_tab {
        let expected = state.storage.memory.take_challenge(&format!("custom_tab_state:{email}"), now);
        if expected.is_none() || expected.as_deref() != body.state.as_deref() {
            return Err(RelayError::auth_invalid("CSRF state mismatch"));
        }
    }

    let auth_state_json = state
        .storage
        .memory
        .take_challenge(&format!("webauthn_auth:{email}"), now)
        .ok_or_else(|| RelayError::auth_invalid("no pending authentication challenge"))?;
    let auth_state: PasskeyAuthentication =
        serde_json::from_str(&auth_state_json).map_err(|e| RelayError::internal(e.to_string()))?;

    let result = auth::webauthn()
        .finish_passkey_authentication(&body.assertion, &auth_state)
        .map_err(|e| RelayError::auth_invalid(format!("passkey authentication failed: {e}")))?;

    let credential_id = URL_SAFE_NO_PAD.encode(result.cred_id().as_ref());
    let is_admin = is_admin_email(&email);
    let client_id = body.client_id;
    let device_info = body.device_info.clone();

    let email_for_write = email.clone();
    let credential_id_for_write = credential_id.clone();
    let (user, bundle) = state
        .storage
        .db
        .write("webauthn_authenticate", move |conn| {
            let user =
                users::find_by_email(conn, &email_for_write)?.ok_or_else(|| RelayError::not_found("user"))?;
            users::touch_credential_login(conn, &credential_id_for_write)?;
            users::set_active(conn, user.id, true)?;
            if is_admin {
                roles::ensure_server_role_assigned(conn, user.id, "Administrator")?;
            }
            let bundle =
                if from_custom_tab { None } else { Some(establish_session(conn, user.id, client_id, device_info)?) };
            let user = users::find_by_id(conn, user.id)?.ok_or_else(|| RelayError::not_found("user"))?;
            Ok::<_, RelayError>((user, bundle))
        })
        .await?;

    state.storage.memory.clear_registration_step(&email);

    if from_custom_tab {
        let token = auth::mint_handoff_token(user.id, &email, Some(credential_id), body.state.clone())?;
        return Ok((
            jar,
            Json(AuthSuccessResponse {
                status: "ok",
                user: Some(user.into()),
                registration_step: None,
                client_id: None,
                session_secret: None,
                refresh_token: None,
                handoff_token: Some(token),
            }),
        ));
    }

    let bundle = bundle.expect("non-custom-tab authentication always establishes a session");
    let jar = jar.add(session_cookie(bundle.client_id, &bundle.session_secret));
    Ok((
        jar,
        Json(AuthSuccessResponse {
            status: "ok",
            user: Some(user.into()),
            registration_step: None,
            client_id: Some(bundle.client_id),
            session_secret: Some(bundle.session_secret),
            refresh_token: bundle.refresh_token,
            handoff_token: None,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct WebauthnDeleteRequest {
    credential_id: String,
}

/// POST /api/v1/webauthn/delete
async fn webauthn_delete(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebauthnDeleteRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    state.storage.db.write("webauthn_delete", move |conn| users::delete_credential(conn, user_id, &body.credential_id)).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Serialize)]
struct CredentialSummary {
    id: String,
    created_at: chrono::DateTime<Utc>,
    last_login: Option<chrono::DateTime<Utc>>,
    browser: Option<String>,
}

/// GET /api/v1/webauthn/list
async fn webauthn_list(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<Vec<CredentialSummary>>> {
    let user_id = auth_ctx.require_user()?;
    let conn = state.storage.db.read()?;
    let user = users::find_by_id(&conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))?;
    Ok(Json(
        user.credentials
            .into_iter()
            .map(|c| CredentialSummary { id: c.id, created_at: c.created_at, last_login: c.last_login, browser: c.browser })
            .collect(),
    ))
}

// ============================================================
// Backup codes
// ============================================================

fn enforce_backup_code_backoff(state: &AppState, key: &str) -> RelayResult<()> {
    let now = Utc::now();
    if let Some(until) = state.storage.memory.backup_code_wait_until(key, now) {
        let wait = (until - now).num_seconds().max(1) as u64;
        return Err(RelayError::rate_limited(wait));
    }
    Ok(())
}

fn record_backup_code_outcome(state: &AppState, key: &str, success: bool) {
    let config = meridian_common::config::get();
    if success {
        state.storage.memory.clear_backup_code_backoff(key);
    } else {
        state.storage.memory.record_backup_code_failure(
            key,
            config.auth.backup_code_base_wait_secs,
            config.auth.backup_code_backoff_base,
            Utc::now(),
        );
    }
}

#[derive(Debug, Deserialize)]
struct BackupCodeMobileVerifyRequest {
    email: String,
    backup_code: String,
    client_id: Option<Uuid>,
    device_info: Option<DeviceInfo>,
}

/// POST /api/v1/backupcode/mobile-verify — public; backup-code login for a
/// native client that has lost its passkey-capable device.
async fn backup_code_mobile_verify(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<BackupCodeMobileVerifyRequest>,
) -> RelayResult<(CookieJar, Json<AuthSuccessResponse>)> {
    let email = body.email.trim().to_lowercase();
    enforce_backup_code_backoff(&state, &email)?;

    let client_id = body.client_id;
    let device_info = body.device_info.clone();
    let email_for_write = email.clone();
    let code = body.backup_code.clone();

    let result = state
        .storage
        .db
        .write("backup_code_mobile_verify", move |conn| {
            let user = users::find_by_email(conn, &email_for_write)?.ok_or_else(|| RelayError::not_found("user"))?;
            let Some(hash) = auth::verify_backup_code(&code, &user.backup_codes) else {
                return Ok::<_, RelayError>(None);
            };
            users::mark_backup_code_used(conn, user.id, &hash)?;
            users::set_active(conn, user.id, true)?;
            let bundle = establish_session(conn, user.id, client_id, device_info)?;
            let user = users::find_by_id(conn, user.id)?.ok_or_else(|| RelayError::not_found("user"))?;
            Ok(Some((user, bundle)))
        })
        .await?;

    let Some((user, bundle)) = result else {
        record_backup_code_outcome(&state, &email, false);
        return Err(RelayError::auth_invalid("invalid backup code"));
    };
    record_backup_code_outcome(&state, &email, true);
    state.storage.memory.clear_registration_step(&email);

    let jar = jar.add(session_cookie(bundle.client_id, &bundle.session_secret));
    Ok((
        jar,
        Json(AuthSuccessResponse {
            status: "ok",
            user: Some(user.into()),
            registration_step: None,
            client_id: Some(bundle.client_id),
            session_secret: Some(bundle.session_secret),
            refresh_token: bundle.refresh_token,
            handoff_token: None,
        }),
    ))
}

/// GET /api/v1/backupcode/list — authenticated, one-shot: the plaintext
/// codes generated at the `backup_codes` registration step, retrievable
/// exactly once.
async fn backup_code_list(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    let codes = state
        .storage
        .memory
        .take_backup_code_plaintext(user_id)
        .ok_or_else(|| RelayError::not_found("backup codes (already retrieved, or none pending)"))?;

    // Reading the one-shot codes is the client's signal that it has saved
    // them and is moving on; advance `backup_codes -> webauthn` if that's
    // where this email's registration currently sits.
    let conn = state.storage.db.read()?;
    if let Some(user) = users::find_by_id(&conn, user_id)? {
        if state.storage.memory.registration_step(&user.email) == "backup_codes" {
            state.storage.memory.set_registration_step(&user.email, "webauthn");
        }
    }

    Ok(Json(serde_json::json!({ "codes": codes })))
}

/// GET /api/v1/backupcode/usage
async fn backup_code_usage(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    let conn = state.storage.db.read()?;
    let user = users::find_by_id(&conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))?;
    let config = meridian_common::config::get();
    let remaining = user.backup_codes.iter().filter(|c| !c.used).count();
    let needs_regeneration = auth::backup_codes_need_regeneration(&user.backup_codes, config.auth.backup_code_regen_floor);
    Ok(Json(serde_json::json!({
        "remaining": remaining,
        "total": user.backup_codes.len(),
        "needs_regeneration": needs_regeneration,
    })))
}

/// POST /api/v1/backupcode/regenerate — only once ≥8 of 10 codes are used.
async fn backup_code_regenerate(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    let config = meridian_common::config::get();
    let floor = config.auth.backup_code_regen_floor;
    let count = config.auth.backup_code_count as usize;

    let plain = state
        .storage
        .db
        .write("backup_code_regenerate", move |conn| {
            let user = users::find_by_id(conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))?;
            if !auth::backup_codes_need_regeneration(&user.backup_codes, floor) {
                return Err(RelayError::conflict("regeneration is only allowed once most backup codes are used"));
            }
            let (plain, hashes) = auth::generate_backup_codes(count)?;
            users::set_backup_codes(conn, user_id, &hashes)?;
            Ok::<_, RelayError>(plain)
        })
        .await?;

    Ok(Json(serde_json::json!({ "codes": plain })))
}

#[derive(Debug, Deserialize)]
struct BackupCodeVerifyRequest {
    code: String,
}

/// POST /api/v1/backupcode/verify — step-up confirmation for an already
/// authenticated caller (does not change their session).
async fn backup_code_verify(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<BackupCodeVerifyRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    let key = user_id.to_string();
    enforce_backup_code_backoff(&state, &key)?;

    let code = body.code.clone();
    let matched = state
        .storage
        .db
        .write("backup_code_verify", move |conn| {
            let user = users::find_by_id(conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))?;
            if let Some(hash) = auth::verify_backup_code(&code, &user.backup_codes) {
                users::mark_backup_code_used(conn, user_id, &hash)?;
                Ok::<_, RelayError>(true)
            } else {
                Ok(false)
            }
        })
        .await?;

    record_backup_code_outcome(&state, &key, matched);
    if !matched {
        return Err(RelayError::auth_invalid("invalid backup code"));
    }
    Ok(Json(serde_json::json!({ "verified": true })))
}

// ============================================================
// Tokens
// ============================================================

#[derive(Debug, Deserialize)]
struct TokenExchangeRequest {
    token: String,
    client_id: Uuid,
    device_info: Option<DeviceInfo>,
}

#[derive(Debug, Serialize)]
struct TokenExchangeResponse {
    session_secret: String,
    user_id: Uuid,
    email: String,
    credential_id: Option<String>,
    refresh_token: Option<String>,
}

/// POST /api/v1/token/exchange — public; redeems a hand-off token minted by
/// the Custom-Tab WebAuthn ceremony for a native HMAC session.
async fn token_exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenExchangeRequest>,
) -> RelayResult<Json<TokenExchangeResponse>> {
    let config = meridian_common::config::get();
    let rate_key = format!("token_exchange:{}", body.client_id);
    if !state
        .storage
        .memory
        .check_rate_limit(&rate_key, config.rate_limits.token_exchange_per_15min, chrono::Duration::minutes(15), Utc::now())
    {
        return Err(RelayError::rate_limited(900));
    }

    let client_id = body.client_id;
    let device_info = body.device_info.clone();
    let token = body.token.clone();
    let (claims, bundle) = state
        .storage
        .db
        .write("token_exchange", move |conn| {
            let claims = auth::redeem_handoff_token(conn, &token)?;
            let bundle = establish_session(conn, claims.user_id, Some(client_id), device_info)?;
            Ok::<_, RelayError>((claims, bundle))
        })
        .await?;

    Ok(Json(TokenExchangeResponse {
        session_secret: bundle.session_secret,
        user_id: claims.user_id,
        email: claims.email,
        credential_id: claims.credential_id,
        refresh_token: bundle.refresh_token,
    }))
}

#[derive(Debug, Deserialize)]
struct TokenRefreshRequest {
    client_id: Uuid,
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct TokenRefreshResponse {
    session_secret: String,
    refresh_token: String,
}

/// POST /api/v1/token/refresh — single-use; reuse of an already-rotated
/// token destroys it immediately (handled by `rotate_refresh_token`).
async fn token_refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenRefreshRequest>,
) -> RelayResult<Json<TokenRefreshResponse>> {
    let config = meridian_common::config::get();
    let rate_key = format!("token_refresh:{}", body.client_id);
    if !state
        .storage
        .memory
        .check_rate_limit(&rate_key, config.rate_limits.token_refresh_per_hour, chrono::Duration::hours(1), Utc::now())
    {
        return Err(RelayError::rate_limited(3600));
    }

    let client_id = body.client_id;
    let old_token = body.refresh_token.clone();
    let result = state
        .storage
        .db
        .write("token_refresh", move |conn| {
            let Some(next) =
                auth_tokens::rotate_refresh_token(conn, &old_token, chrono::Duration::seconds(config.auth.refresh_token_ttl_secs))?
            else {
                return Ok::<_, RelayError>(None);
            };
            if next.client_id != client_id {
                return Err(RelayError::auth_invalid("refresh token does not belong to this client"));
            }
            let device_id = clients::find_by_client_id(conn, client_id)?.map(|c| c.device_id).unwrap_or(1);
            let session = auth_tokens::upsert_client_session(
                conn,
                client_id,
                next.user_id,
                device_id,
                chrono::Duration::seconds(config.auth.hmac_session_ttl_secs),
                None,
            )?;
            Ok(Some((session.session_secret, next.token)))
        })
        .await?;

    let Some((session_secret, refresh_token)) = result else {
        return Err(RelayError::auth_invalid("refresh token is invalid, expired, or already used"));
    };
    Ok(Json(TokenRefreshResponse { session_secret, refresh_token }))
}

#[derive(Debug, Deserialize)]
struct TokenRevokeRequest {
    token: String,
}

/// POST /api/v1/token/revoke — blacklist a hand-off token's `jti` until its
/// own expiry, regardless of whether it was ever redeemed.
async fn token_revoke(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenRevokeRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let config = meridian_common::config::get();
    let claims = meridian_common::auth::decode_handoff_token(&body.token, &config.auth.jwt_secret)
        .map_err(|_| RelayError::auth_invalid("invalid hand-off token"))?;
    let exp = chrono::DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now);
    let jti = claims.jti.to_string();
    state.storage.db.write("token_revoke", move |conn| auth_tokens::blacklist_jti(conn, &jti, exp)).await?;
    Ok(Json(serde_json::json!({ "revoked": true })))
}

/// POST /api/v1/session/refresh — extend the caller's HMAC session expiry
/// without rotating its secret.
async fn session_refresh(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<serde_json::Value>> {
    let (_, client_id) = auth_ctx.require_client()?;
    let config = meridian_common::config::get();
    state
        .storage
        .db
        .write("session_refresh", move |conn| {
            auth_tokens::extend_client_session(conn, client_id, chrono::Duration::seconds(config.auth.hmac_session_ttl_secs))
        })
        .await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ============================================================
// Client (device) management
// ============================================================

/// POST /api/v1/client/addweb — register/refresh the browser's own client row.
async fn client_addweb(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddWebClientRequest>,
) -> RelayResult<Json<ClientResponse>> {
    let user_id = auth_ctx.require_user()?;
    let device_info = body.device_info.unwrap_or_default();
    let client_id = body.client_id;
    let client =
        state.storage.db.write("client_addweb", move |conn| clients::find_or_create_client(conn, client_id, user_id, &device_info)).await?;
    Ok(Json(client.into()))
}

/// GET /api/v1/client/list
async fn client_list(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<Vec<ClientResponse>>> {
    let user_id = auth_ctx.require_user()?;
    let conn = state.storage.db.read()?;
    Ok(Json(clients::list_for_owner(&conn, user_id)?.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
struct ClientDeleteRequest {
    client_id: Uuid,
}

/// POST /api/v1/client/delete
async fn client_delete(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClientDeleteRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    state
        .storage
        .db
        .write("client_delete", move |conn| {
            let client = clients::find_by_client_id(conn, body.client_id)?.ok_or_else(|| RelayError::not_found("client"))?;
            if client.owner != user_id {
                return Err(RelayError::permission_denied("client.manage"));
            }
            clients::delete_client(conn, body.client_id)
        })
        .await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ============================================================
// Sessions (active client_sessions, as distinct from the client/device registry)
// ============================================================

#[derive(Debug, Serialize)]
struct SessionSummary {
    client_id: Uuid,
    device_id: i64,
    expires_at: chrono::DateTime<Utc>,
    last_used: Option<chrono::DateTime<Utc>>,
}

/// GET /api/v1/sessions/list
async fn sessions_list(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<Vec<SessionSummary>>> {
    let user_id = auth_ctx.require_user()?;
    let conn = state.storage.db.read()?;
    Ok(Json(
        auth_tokens::list_sessions_for_user(&conn, user_id)?
            .into_iter()
            .map(|s| SessionSummary { client_id: s.client_id, device_id: s.device_id, expires_at: s.expires_at, last_used: s.last_used })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct SessionRevokeRequest {
    session_id: Uuid,
}

/// POST /api/v1/sessions/revoke — `sessionId` is the `clientId` the session
/// belongs to, since each client has at most one `client_sessions` row.
async fn sessions_revoke(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionRevokeRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    state
        .storage
        .db
        .write("sessions_revoke", move |conn| {
            let session = auth_tokens::find_client_session(conn, body.session_id)?.ok_or_else(|| RelayError::not_found("session"))?;
            if session.user_id != user_id {
                return Err(RelayError::permission_denied("session.manage"));
            }
            auth_tokens::delete_client_session(conn, body.session_id)
        })
        .await?;
    Ok(Json(serde_json::json!({ "revoked": true })))
}

/// POST /api/v1/sessions/revoke-all
async fn sessions_revoke_all(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    let count =
        state.storage.db.write("sessions_revoke_all", move |conn| auth_tokens::delete_all_client_sessions_for_user(conn, user_id)).await?;
    Ok(Json(serde_json::json!({ "revoked": count })))
}

// ============================================================
// Magic link
// ============================================================

/// GET /api/v1/magic/generate
async fn magic_generate(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth_ctx.require_user()?;
    let user = {
        let conn = state.storage.db.read()?;
        users::find_by_id(&conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))?
    };

    let config = meridian_common::config::get();
    let now = Utc::now();
    let random_hash = hex::encode(rand::random::<[u8; 32]>());
    let server_url = format!("https://{}", config.server.domain);
    let magic_key = auth::build_magic_link(&server_url, &random_hash, now.timestamp(), &config.auth.jwt_secret);
    let expires_at = now + chrono::Duration::seconds(config.auth.magic_link_ttl_secs);

    state
        .storage
        .memory
        .put_magic_link(random_hash, MagicLinkEntry { email: user.email, user_id, expires_at, used: false });

    Ok(Json(serde_json::json!({ "magic_key": magic_key, "expires_at": expires_at })))
}

/// POST /api/v1/invitations/verify — public. Delegates to the same
/// `invitation_only`-gate storage the admin console's
/// `/admin/invitations/verify` uses; kept as a separate public route since
/// the admin one sits behind the dual-auth layer's path convention.
async fn invitations_verify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyInvitationRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let valid = state
        .storage
        .db
        .write("invitations_verify", move |conn| admin::verify_and_consume_invitation(conn, &body.email, &body.token, Utc::now()))
        .await?;
    if !valid {
        return Err(RelayError::validation("invitation is invalid, expired, or already used"));
    }
    Ok(Json(serde_json::json!({ "verified": true })))
}

// ============================================================
// Logout
// ============================================================

/// POST /api/v1/logout — HMAC clients drop their `client_sessions` row;
/// cookie sessions additionally clear the cookie.
async fn logout(
    Extension(auth_ctx): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> RelayResult<(CookieJar, Json<serde_json::Value>)> {
    match auth_ctx {
        AuthContext::Hmac { client_id, .. } => {
            state.storage.db.write("logout_hmac", move |conn| auth_tokens::delete_client_session(conn, client_id)).await?;
            Ok((jar, Json(serde_json::json!({ "status": "ok" }))))
        }
        AuthContext::Session { client_id, .. } => {
            state.storage.db.write("logout_session", move |conn| auth_tokens::delete_client_session(conn, client_id)).await?;
            let mut removal = Cookie::new("meridian_session", "");
            removal.set_path("/");
            let jar = jar.remove(removal);
            Ok((jar, Json(serde_json::json!({ "status": "ok" }))))
        }
        AuthContext::Public => Err(RelayError::AuthMissing),
    }
}
