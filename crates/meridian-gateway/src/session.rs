//! Connected-client registry (C7) — `clientId -> connection` plus a
//! `userId -> set<clientId>` index for multi-device fan-out (e.g. a knock
//! event must reach every connected client of every admitting-capable user,
//! not just one of their devices).

use axum::extract::ws::Message;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// One connected signaling client. `mailbox` is this connection's outbound
/// queue — routing a message through it rather than writing the socket
/// directly is what gives unicast delivery its per-(source,target) ordering:
/// every sender enqueues in the order it called `send`, and the connection's
/// writer task drains in FIFO order.
#[derive(Clone)]
pub struct ClientHandle {
    pub client_id: Uuid,
    pub user_id: Uuid,
    mailbox: mpsc::Sender<Message>,
}

impl ClientHandle {
    /// Best-effort unicast. A full mailbox means the peer's writer is stuck
    /// or it's gone; messages to a target in that state are dropped rather
    /// than buffered without bound or retried.
    pub async fn send(&self, msg: &crate::events::SignalingMessage) {
        let Ok(text) = serde_json::to_string(msg) else { return };
        let _ = self.mailbox.send(Message::Text(text.into())).await;
    }
}

const MAILBOX_CAPACITY: usize = 64;

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    by_user: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new connection and return its mailbox receiver, which the
    /// caller spawns a task to drain into the WebSocket sink.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<Message>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = ClientHandle { client_id, user_id, mailbox: tx };

        self.clients.write().await.insert(client_id, handle);
        self.by_user.write().await.entry(user_id).or_default().insert(client_id);

        (client_id, rx)
    }

    pub async fn unregister(&self, client_id: Uuid, user_id: Uuid) {
        self.clients.write().await.remove(&client_id);
        if let Some(set) = self.by_user.write().await.get_mut(&user_id) {
            set.remove(&client_id);
        }
    }

    pub async fn get(&self, client_id: Uuid) -> Option<ClientHandle> {
        self.clients.read().await.get(&client_id).cloned()
    }

    pub async fn clients_for_user(&self, user_id: Uuid) -> Vec<ClientHandle> {
        let Some(ids) = self.by_user.read().await.get(&user_id).cloned() else { return Vec::new() };
        let clients = self.clients.read().await;
        ids.iter().filter_map(|id| clients.get(id).cloned()).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_tracks_multiple_devices_per_user() {
        let registry = ClientRegistry::new();
        let user_id = Uuid::new_v4();
        let (client_a, _rx_a) = registry.register(user_id).await;
        let (client_b, _rx_b) = registry.register(user_id).await;

        let devices = registry.clients_for_user(user_id).await;
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().any(|c| c.client_id == client_a));
        assert!(devices.iter().any(|c| c.client_id == client_b));
        assert_eq!(registry.active_count().await, 2);
    }

    #[tokio::test]
    async fn unregister_removes_only_that_device() {
        let registry = ClientRegistry::new();
        let user_id = Uuid::new_v4();
        let (client_a, _rx_a) = registry.register(user_id).await;
        let (client_b, _rx_b) = registry.register(user_id).await;

        registry.unregister(client_a, user_id).await;

        assert!(registry.get(client_a).await.is_none());
        assert!(registry.get(client_b).await.is_some());
        let devices = registry.clients_for_user(user_id).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].client_id, client_b);
    }

    #[tokio::test]
    async fn clients_for_user_is_empty_for_unknown_user() {
        let registry = ClientRegistry::new();
        assert!(registry.clients_for_user(Uuid::new_v4()).await.is_empty());
    }
}
