//! # Meridian Server
//!
//! Main binary that orchestrates Meridian's three listeners:
//! - REST API (registration/auth, keys, envelopes, channels, meetings, admin)
//! - Signaling Hub (persistent WebSocket event stream)
//! - Admin/metrics listener (liveness/readiness, meant for a private interface)
//!
//! All three run concurrently in one process under one `tokio::main`, joined
//! with `tokio::try_join!` so any one's fatal error brings the whole process
//! down with a non-zero exit code.

use meridian_api::{build_admin_router, build_router, AppState};
use meridian_common::relay_event::RelayEvent;
use meridian_gateway::GatewayState;
use meridian_storage::Storage;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the relay event bus. A slow or absent subscriber only misses
/// old events once the ring fills; it never blocks the REST layer.
const RELAY_CHANNEL_CAPACITY: usize = 10_000;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal error, shutting down");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = meridian_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "meridian=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("starting meridian v{}", env!("CARGO_PKG_VERSION"));

    let storage = Storage::open(config).map_err(|e| anyhow::anyhow!("failed to open storage: {e}"))?;
    tracing::info!(db_path = %config.storage.db_path, "storage gateway ready");

    // Bridges REST-originated events (a meeting knock, an envelope arriving
    // for an online recipient, a membership change) into the Signaling Hub.
    let (relay_tx, _) = broadcast::channel::<RelayEvent>(RELAY_CHANNEL_CAPACITY);

    spawn_housekeeping(storage.clone());

    let api_state = AppState { storage: storage.clone(), relay_tx: relay_tx.clone() };
    let admin_state = api_state.clone();
    let api_router = build_router(api_state);
    let admin_router = build_admin_router(admin_state);

    let gateway_state = GatewayState::new(storage, relay_tx);
    let gateway_router = meridian_gateway::build_router(gateway_state);

    let host = config.server.host.parse::<std::net::IpAddr>()?;
    let api_addr = SocketAddr::new(host, config.server.api_port);
    let signaling_addr = SocketAddr::new(host, config.server.signaling_port);
    let admin_addr = SocketAddr::new(host, config.server.admin_port);

    tracing::info!("REST API listening on http://{api_addr}");
    tracing::info!("Signaling Hub listening on ws://{signaling_addr}/signaling");
    tracing::info!("admin/metrics listening on http://{admin_addr}");

    tokio::try_join!(
        async {
            let listener = tokio::net::TcpListener::bind(api_addr).await?;
            axum::serve(listener, api_router).await?;
            Ok::<_, anyhow::Error>(())
        },
        async {
            let listener = tokio::net::TcpListener::bind(signaling_addr).await?;
            axum::serve(listener, gateway_router).await?;
            Ok::<_, anyhow::Error>(())
        },
        async {
            let listener = tokio::net::TcpListener::bind(admin_addr).await?;
            axum::serve(listener, admin_router).await?;
            Ok::<_, anyhow::Error>(())
        },
    )?;

    Ok(())
}

/// Background sweep: purges delivered 1:1 envelopes and expired
/// refresh tokens/client sessions/handoff-jti-blacklist entries from SQLite,
/// and evicts expired OTP/nonce/magic-link/challenge/external-session/
/// rate-bucket/backup-code-backoff entries from the in-memory store. Pure
/// janitorial work: not on any request's critical path, failures are logged
/// and retried on the next tick rather than treated as fatal.
fn spawn_housekeeping(storage: Storage) {
    let interval_secs = meridian_common::config::get().housekeeping.sweep_interval_secs;
    let retention_secs = meridian_common::config::get().housekeeping.envelope_retention_secs;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1) as u64));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();

            storage.memory.purge_expired_otps(now);
            storage.memory.purge_expired_nonces(chrono::Duration::seconds(300), now);
            storage.memory.purge_expired_magic_links(now);
            storage.memory.purge_expired_challenges(now);
            storage.memory.purge_stale_external_sessions(chrono::Duration::hours(6), now);
            storage.memory.purge_stale_rate_buckets(chrono::Duration::hours(1), now);

            let cutoff = now - chrono::Duration::seconds(retention_secs);
            let result = storage
                .db
                .write("housekeeping_sweep", move |conn| {
                    let envelopes = meridian_storage::repository::envelopes::purge_delivered_older_than(conn, cutoff)?;
                    let refresh_tokens = meridian_storage::repository::auth_tokens::purge_expired_refresh_tokens(conn, now)?;
                    let client_sessions = meridian_storage::repository::auth_tokens::purge_expired_client_sessions(conn, now)?;
                    let blacklist = meridian_storage::repository::auth_tokens::purge_expired_blacklist_entries(conn, now)?;
                    Ok((envelopes, refresh_tokens, client_sessions, blacklist))
                })
                .await;

            match result {
                Ok((envelopes, refresh_tokens, client_sessions, blacklist)) => {
                    if envelopes + refresh_tokens + client_sessions + blacklist > 0 {
                        tracing::debug!(envelopes, refresh_tokens, client_sessions, blacklist, "housekeeping sweep completed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "housekeeping sweep failed, will retry next tick"),
            }
        }
    });
}
