//! Room registry (C7) — `roomId -> set<clientId>` for the three room kinds,
//! plus per-room metadata (host, slots, voice-only, mute-on-join).

use crate::events::RoomKind;
use meridian_common::error::{RelayError, RelayResult};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RoomMeta {
    pub kind: RoomKind,
    pub host: Uuid,
    /// Max concurrent peers for `stream`/`fileshare`; `None` is unlimited.
    pub slots: Option<u32>,
    pub voice_only: bool,
    pub mute_on_join: bool,
}

struct Room {
    meta: RoomMeta,
    members: HashSet<Uuid>,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch metadata, creating the room (hosted by `client_id`) if absent.
    pub async fn get_or_create(&self, room_id: Uuid, kind: RoomKind, host: Uuid) -> RoomMeta {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id).or_insert_with(|| Room {
            meta: RoomMeta { kind, host, slots: None, voice_only: false, mute_on_join: false },
            members: HashSet::new(),
        });
        room.meta.clone()
    }

    pub async fn meta(&self, room_id: Uuid) -> Option<RoomMeta> {
        self.rooms.read().await.get(&room_id).map(|r| r.meta.clone())
    }

    pub async fn set_slots(&self, room_id: Uuid, n: u32) {
        if let Some(room) = self.rooms.write().await.get_mut(&room_id) {
            room.meta.slots = Some(n);
        }
    }

    /// Admit `client_id` into `room_id` subject to `slots`. `stream`/`fileshare`
    /// are free-join up to capacity; `meeting` admission is checked by the
    /// caller (invited list / channel role / guest admission) before calling.
    pub async fn join(&self, room_id: Uuid, kind: RoomKind, host: Uuid, client_id: Uuid) -> RelayResult<usize> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id).or_insert_with(|| Room {
            meta: RoomMeta { kind, host, slots: None, voice_only: false, mute_on_join: false },
            members: HashSet::new(),
        });

        if let Some(slots) = room.meta.slots {
            if room.members.len() as u32 >= slots && !room.members.contains(&client_id) {
                return Err(RelayError::conflict("room is full"));
            }
        }

        room.members.insert(client_id);
        Ok(room.members.len())
    }

    /// Remove `client_id` from `room_id`. Returns the remaining member count,
    /// or `None` if the client wasn't a member (or the room doesn't exist).
    pub async fn leave(&self, room_id: Uuid, client_id: Uuid) -> Option<usize> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id)?;
        if !room.members.remove(&client_id) {
            return None;
        }
        let remaining = room.members.len();
        if remaining == 0 {
            rooms.remove(&room_id);
        }
        Some(remaining)
    }

    pub async fn members(&self, room_id: Uuid) -> Vec<Uuid> {
        self.rooms.read().await.get(&room_id).map(|r| r.members.iter().copied().collect()).unwrap_or_default()
    }

    pub async fn member_count(&self, room_id: Uuid) -> usize {
        self.rooms.read().await.get(&room_id).map(|r| r.members.len()).unwrap_or(0)
    }

    /// Every room `client_id` currently occupies, without leaving any of them.
    pub async fn rooms_for_client(&self, client_id: Uuid) -> Vec<Uuid> {
        self.rooms.read().await.iter().filter(|(_, room)| room.members.contains(&client_id)).map(|(id, _)| *id).collect()
    }

    /// Remove `client_id` from every room it occupies — used on disconnect.
    /// Returns `(room_id, remaining_members)` for each room it left.
    pub async fn leave_all(&self, client_id: Uuid) -> Vec<(Uuid, usize)> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|room_id, room| {
            if room.members.remove(&client_id) {
                left.push((*room_id, room.members.len()));
            }
            !room.members.is_empty()
        });
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rooms_for_client_does_not_evict() {
        let rooms = RoomRegistry::new();
        let host = Uuid::new_v4();
        let client = Uuid::new_v4();
        let room = Uuid::new_v4();
        rooms.join(room, RoomKind::Fileshare, host, client).await.unwrap();

        let occupied = rooms.rooms_for_client(client).await;
        assert_eq!(occupied, vec![room]);
        assert_eq!(rooms.member_count(room).await, 1, "lookup must not remove membership");
    }
}
