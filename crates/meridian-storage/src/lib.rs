//! # meridian-storage
//!
//! Storage layer for the Meridian relay backbone: a single-writer SQLite
//! gateway (durable state) plus an in-process memory store (volatile,
//! high-churn state that does not need to survive a restart).

pub mod gateway;
pub mod memory;
pub mod repository;

use meridian_common::config::AppConfig;
use meridian_common::error::RelayResult;
use rand::Rng;

pub use gateway::StorageGateway;
pub use memory::MemoryStore;

/// Bundles the durable gateway and the volatile store behind one handle,
/// cloned freely into Axum state and the signaling hub.
#[derive(Clone)]
pub struct Storage {
    pub db: StorageGateway,
    pub memory: std::sync::Arc<MemoryStore>,
}

impl Storage {
    /// Open storage at the configured path, applying schema/pragmas and
    /// spawning the writer thread.
    pub fn open(config: &AppConfig) -> RelayResult<Self> {
        let db = StorageGateway::open(&config.storage.db_path)?;
        Ok(Self { db, memory: std::sync::Arc::new(MemoryStore::new()) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> RelayResult<Self> {
        let db = StorageGateway::open(":memory:")?;
        Ok(Self { db, memory: std::sync::Arc::new(MemoryStore::new()) })
    }
}

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A cryptographically random uppercase alphanumeric token, excluding
/// visually ambiguous characters (0/O, 1/I/L). Used for signup invitations
/// (6 chars) and meeting invitation tokens (6 chars).
pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..TOKEN_ALPHABET.len());
            TOKEN_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_has_requested_length() {
        let t = random_token(6);
        assert_eq!(t.len(), 6);
        assert!(t.chars().all(|c| TOKEN_ALPHABET.contains(&(c as u8))));
    }

    #[test]
    fn random_token_varies() {
        let a = random_token(8);
        let b = random_token(8);
        assert_ne!(a, b);
    }
}
