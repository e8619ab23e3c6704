//! # meridian-api
//!
//! REST API layer for Meridian: registration/auth, the signal-protocol key
//! directory, 1:1 and group envelope delivery, channels, meetings, abuse
//! reporting, and server administration. The realtime signaling hub
//! (presence, WebRTC relay, meeting events) lives in `meridian-gateway`, not
//! here — this crate is HTTP request/response only.

pub mod auth;
pub mod middleware;
pub mod routes;

use axum::Router;
use meridian_common::relay_event::RelayEvent;
use meridian_storage::Storage;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    /// Fan-out to the Signaling Hub for events the REST layer originates
    /// (a meeting knock, an envelope arriving for an online recipient, a
    /// membership change) — the hub subscribes and forwards to connected
    /// clients. A send with no subscribers is a harmless no-op.
    pub relay_tx: broadcast::Sender<RelayEvent>,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let api_routes = Router::new()
        .merge(routes::auth::router())
        .merge(routes::roles::router())
        .merge(routes::keys::router())
        .merge(routes::envelopes::router())
        .merge(routes::channels::router())
        .merge(routes::meetings::router())
        .merge(routes::abuse::router())
        .merge(routes::admin::router())
        .merge(routes::users::router())
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::dual_auth_middleware));

    Router::new()
        .nest("/api/v1", api_routes)
        .merge(routes::health::router())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::compression::CompressionLayer::new())
        .with_state(state)
}

/// Build the small internal admin/metrics listener (C11): liveness/readiness
/// only, meant to be bound to a private interface rather than exposed
/// alongside the public API. The authenticated admin-settings surface lives
/// under `/api/v1/admin/*` on the main router instead, gated by
/// `server.manage` like any other permissioned route.
pub fn build_admin_router(state: AppState) -> Router {
    Router::new().merge(routes::health::router()).layer(tower_http::trace::TraceLayer::new_for_http()).with_state(Arc::new(state))
}
