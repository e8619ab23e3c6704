//! Repository layer — query functions organized by domain.

pub mod abuse;
pub mod admin;
pub mod auth_tokens;
pub mod channels;
pub mod clients;
pub mod envelopes;
pub mod keystore;
pub mod meetings;
pub mod roles;
pub mod users;
