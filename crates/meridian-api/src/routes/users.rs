//! User routes — the authenticated caller's own profile, plus public lookup.
//!
//! Passwordless by design: there is nothing here to log in with or reset.
//! Identity changes (credentials, backup codes) go through `routes::auth`.

use axum::{
    extract::{Extension, Path, State},
    routing::get,
    Json, Router,
};
use meridian_common::{
    error::{RelayError, RelayResult},
    models::user::{UpdateUserRequest, UserResponse},
    validation::validate_request,
};
use meridian_storage::repository::users;
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users/@me", get(get_current_user).patch(update_current_user))
        .route("/users/{user_id}", get(get_user))
}

/// GET /api/v1/users/@me — the authenticated user's own profile.
async fn get_current_user(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> RelayResult<Json<UserResponse>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    let user = users::find_by_id(&conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))?;
    Ok(Json(user.into()))
}

/// PATCH /api/v1/users/@me — update display name, handle, or picture.
async fn update_current_user(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateUserRequest>,
) -> RelayResult<Json<UserResponse>> {
    let user_id = auth.require_user()?;
    validate_request(&body)?;

    let user = state
        .storage
        .db
        .write("update_profile", move |conn| {
            users::update_profile(conn, user_id, body.display_name.as_deref(), body.at_name.as_deref(), body.picture.as_deref())?;
            users::find_by_id(conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))
        })
        .await?;

    // This is the final step of the linear registration state machine
    // (`profile -> complete`); a profile edit made well after registration
    // finds the step already "complete" or "none" and is a no-op here.
    if state.storage.memory.registration_step(&user.email) == "profile" {
        state.storage.memory.set_registration_step(&user.email, "complete");
    }

    Ok(Json(user.into()))
}

/// GET /api/v1/users/:user_id — public profile lookup; credential and backup-code
/// material never leaves `UserResponse` either way.
async fn get_user(State(state): State<Arc<AppState>>, Path(user_id): Path<Uuid>) -> RelayResult<Json<UserResponse>> {
    let conn = state.storage.db.read()?;
    let user = users::find_by_id(&conn, user_id)?.ok_or_else(|| RelayError::not_found("user"))?;
    Ok(Json(user.into()))
}
