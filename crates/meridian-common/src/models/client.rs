//! Client (device) model — one installation of the client software.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered client/device. `clientid` is client-generated and globally
/// unique; `device_id` is server-assigned, auto-incremented per owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: Uuid,
    pub owner: Uuid,
    pub device_id: i64,
    pub public_key: Option<String>,
    pub registration_id: Option<i32>,
    pub ip: Option<String>,
    pub browser: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contextual info passed when a device connects, used to populate `Client`
/// and to decide whether ownership transfer is needed.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeviceInfo {
    pub ip: Option<String>,
    pub browser: Option<String>,
    pub location: Option<String>,
    pub public_key: Option<String>,
    pub registration_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct AddWebClientRequest {
    pub client_id: Uuid,
    pub device_info: Option<DeviceInfo>,
}

#[derive(Debug, Serialize)]
pub struct ClientResponse {
    pub client_id: Uuid,
    pub device_id: i64,
    pub browser: Option<String>,
    pub location: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Client> for ClientResponse {
    fn from(c: Client) -> Self {
        Self {
            client_id: c.client_id,
            device_id: c.device_id,
            browser: c.browser,
            location: c.location,
            updated_at: c.updated_at,
        }
    }
}
