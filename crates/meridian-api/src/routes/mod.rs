//! API route modules.

pub mod abuse;
pub mod admin;
pub mod auth;
pub mod channels;
pub mod envelopes;
pub mod health;
pub mod keys;
pub mod meetings;
pub mod roles;
pub mod users;
