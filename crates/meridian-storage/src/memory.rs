//! Volatile in-memory stores — OTP codes, the nonce replay cache, magic
//! links, and external (guest) meeting sessions. None of these belong in the
//! durable store: they are short-lived, high-churn, and fully reconstructable
//! from a client retry, so losing them on restart is acceptable.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meridian_common::models::ExternalSession;
use uuid::Uuid;

/// A single outstanding OTP for an email. Only one may be outstanding at a time.
#[derive(Debug, Clone)]
pub struct OtpEntry {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MagicLinkEntry {
    pub email: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// A pending WebAuthn challenge (serialized `PasskeyRegistration` or
/// `PasskeyAuthentication` state from `webauthn-rs`) or a one-shot CSRF
/// `state` value for a Custom-Tab hand-off. Keyed by email.
#[derive(Debug, Clone)]
pub struct ChallengeEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    otps: DashMap<String, OtpEntry>,
    nonces: DashMap<String, DateTime<Utc>>,
    magic_links: DashMap<String, MagicLinkEntry>,
    external_sessions: DashMap<Uuid, ExternalSession>,
    challenges: DashMap<String, ChallengeEntry>,
    /// Current `/register/*` step per email — `none`, `otp`, `backup_codes`,
    /// `webauthn`, `profile`, `complete`. Absent entries are treated as `none`.
    registration_steps: DashMap<String, String>,
    /// Sliding-window rate-limit buckets, keyed by caller + route (e.g.
    /// `"token_exchange:192.0.2.1"`). Holds timestamps within the current window.
    rate_buckets: DashMap<String, Vec<DateTime<Utc>>>,
    /// Backup-code regeneration backoff: consecutive-failure count and the
    /// timestamp after which the next attempt is allowed, keyed by email.
    backup_code_backoff: DashMap<String, (u32, DateTime<Utc>)>,
    /// The `invitation_only` token presented at `/register`, held until OTP
    /// success so it is only actually consumed once registration completes
    /// that step — not merely attempted.
    pending_invitations: DashMap<String, String>,
    /// Freshly generated backup-code plaintext, held for exactly one
    /// `/backupcode/list` read before the hashes become the only record.
    backup_code_plaintext: DashMap<Uuid, Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- OTP ---------------------------------------------------------

    /// Returns `Some(remaining_wait)` if an OTP is already outstanding and not
    /// yet expired, so the caller can return a wait time instead of reissuing.
    pub fn otp_wait_remaining(&self, email: &str, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.otps.get(email).and_then(|entry| {
            let remaining = entry.expires_at - now;
            (remaining > chrono::Duration::zero()).then_some(remaining)
        })
    }

    pub fn put_otp(&self, email: &str, code: String, expires_at: DateTime<Utc>) {
        self.otps.insert(email.to_string(), OtpEntry { code, expires_at });
    }

    /// Verify and consume the OTP for `email`. Returns true on match.
    pub fn verify_and_consume_otp(&self, email: &str, code: &str, now: DateTime<Utc>) -> bool {
        match self.otps.get(email) {
            Some(entry) if entry.expires_at > now && entry.code == code => {
                drop(entry);
                self.otps.remove(email);
                true
            }
            _ => false,
        }
    }

    pub fn purge_expired_otps(&self, now: DateTime<Utc>) {
        self.otps.retain(|_, v| v.expires_at > now);
    }

    // ---- Nonce cache ---------------------------------------------------

    /// Returns true if the nonce was fresh and has now been recorded (i.e. not a replay).
    pub fn check_and_record_nonce(&self, nonce: &str, now: DateTime<Utc>) -> bool {
        if self.nonces.contains_key(nonce) {
            return false;
        }
        self.nonces.insert(nonce.to_string(), now);
        true
    }

    pub fn purge_expired_nonces(&self, max_age: chrono::Duration, now: DateTime<Utc>) {
        self.nonces.retain(|_, created_at| now - *created_at < max_age);
    }

    // ---- Magic links ---------------------------------------------------

    pub fn put_magic_link(&self, hash: String, entry: MagicLinkEntry) {
        self.magic_links.insert(hash, entry);
    }

    pub fn consume_magic_link(&self, hash: &str, now: DateTime<Utc>) -> Option<MagicLinkEntry> {
        let mut entry = self.magic_links.get_mut(hash)?;
        if entry.used || entry.expires_at <= now {
            return None;
        }
        entry.used = true;
        Some(entry.clone())
    }

    pub fn purge_expired_magic_links(&self, now: DateTime<Utc>) {
        self.magic_links.retain(|_, v| v.expires_at > now && !v.used);
    }

    // ---- External (guest) sessions --------------------------------------

    pub fn put_external_session(&self, session: ExternalSession) {
        self.external_sessions.insert(session.session_id, session);
    }

    pub fn get_external_session(&self, id: Uuid) -> Option<ExternalSession> {
        self.external_sessions.get(&id).map(|e| e.clone())
    }

    pub fn update_external_session<F>(&self, id: Uuid, f: F) -> Option<ExternalSession>
    where
        F: FnOnce(&mut ExternalSession),
    {
        let mut entry = self.external_sessions.get_mut(&id)?;
        f(&mut entry);
        Some(entry.clone())
    }

    pub fn remove_external_session(&self, id: Uuid) {
        self.external_sessions.remove(&id);
    }

    pub fn external_sessions_for_room(&self, room_id: Uuid) -> Vec<ExternalSession> {
        self.external_sessions
            .iter()
            .filter(|e| e.room_id == room_id)
            .map(|e| e.clone())
            .collect()
    }

    pub fn purge_stale_external_sessions(&self, max_age: chrono::Duration, now: DateTime<Utc>) {
        self.external_sessions
            .retain(|_, v| now - v.created_at < max_age);
    }

    // ---- WebAuthn / Custom-Tab challenge cache --------------------------

    pub fn put_challenge(&self, key: String, value: String, expires_at: DateTime<Utc>) {
        self.challenges.insert(key, ChallengeEntry { value, expires_at });
    }

    /// Look up without consuming (WebAuthn states are read once per ceremony
    /// step but the ceremony itself may retry on transport error).
    pub fn peek_challenge(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        self.challenges.get(key).and_then(|e| (e.expires_at > now).then(|| e.value.clone()))
    }

    pub fn take_challenge(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let (_, entry) = self.challenges.remove(key)?;
        (entry.expires_at > now).then_some(entry.value)
    }

    pub fn purge_expired_challenges(&self, now: DateTime<Utc>) {
        self.challenges.retain(|_, v| v.expires_at > now);
    }

    // ---- Registration step ----------------------------------------------

    pub fn registration_step(&self, email: &str) -> String {
        self.registration_steps.get(email).map(|s| s.clone()).unwrap_or_else(|| "none".to_string())
    }

    pub fn set_registration_step(&self, email: &str, step: &str) {
        self.registration_steps.insert(email.to_string(), step.to_string());
    }

    pub fn clear_registration_step(&self, email: &str) {
        self.registration_steps.remove(email);
    }

    // ---- Pending invitation (invitation_only mode) ------------------------

    /// Remember the invitation token presented at `/register` until OTP
    /// success, so `invitation_only` consumption happens on step completion
    /// rather than on the mere attempt.
    pub fn put_pending_invitation(&self, email: &str, token: String) {
        self.pending_invitations.insert(email.to_string(), token);
    }

    pub fn take_pending_invitation(&self, email: &str) -> Option<String> {
        self.pending_invitations.remove(email).map(|(_, v)| v)
    }

    // ---- Backup-code plaintext (one-shot reveal) --------------------------

    /// Backup codes are never recoverable from storage once generated (only
    /// their bcrypt hashes persist); the plaintext set is cached here for the
    /// single `/backupcode/list` read that follows generation.
    pub fn put_backup_code_plaintext(&self, user_id: Uuid, codes: Vec<String>) {
        self.backup_code_plaintext.insert(user_id, codes);
    }

    pub fn take_backup_code_plaintext(&self, user_id: Uuid) -> Option<Vec<String>> {
        self.backup_code_plaintext.remove(&user_id).map(|(_, v)| v)
    }

    // ---- Rate limiting ---------------------------------------------------

    /// Returns true and records this attempt if `key` has made fewer than
    /// `max` calls within `window` ending at `now`; otherwise returns false
    /// without recording (so repeated rejected calls don't extend the window).
    pub fn check_rate_limit(&self, key: &str, max: u32, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        let mut bucket = self.rate_buckets.entry(key.to_string()).or_default();
        bucket.retain(|t| now - *t < window);
        if bucket.len() as u32 >= max {
            return false;
        }
        bucket.push(now);
        true
    }

    pub fn purge_stale_rate_buckets(&self, window: chrono::Duration, now: DateTime<Utc>) {
        self.rate_buckets.retain(|_, v| {
            v.retain(|t| now - *t < window);
            !v.is_empty()
        });
    }

    // ---- Backup-code regeneration backoff --------------------------------

    /// Exponential backoff `base_secs * growth^(failures-1)` after repeated
    /// failed backup-code attempts for `email`. Returns `Some(retry_at)` if
    /// still within the cooldown.
    pub fn backup_code_wait_until(&self, email: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.backup_code_backoff.get(email).and_then(|e| (e.1 > now).then_some(e.1))
    }

    pub fn record_backup_code_failure(&self, email: &str, base_secs: i64, growth: f64, now: DateTime<Utc>) {
        let mut entry = self.backup_code_backoff.entry(email.to_string()).or_insert((0, now));
        entry.0 += 1;
        let wait = (base_secs as f64 * growth.powi(entry.0 as i32 - 1)) as i64;
        entry.1 = now + chrono::Duration::seconds(wait);
    }

    pub fn clear_backup_code_backoff(&self, email: &str) {
        self.backup_code_backoff.remove(email);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_verify_consumes_on_success() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_otp("a@example.com", "12345".to_string(), now + chrono::Duration::minutes(5));
        assert!(store.verify_and_consume_otp("a@example.com", "12345", now));
        assert!(!store.verify_and_consume_otp("a@example.com", "12345", now));
    }

    #[test]
    fn nonce_replay_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store.check_and_record_nonce("n1", now));
        assert!(!store.check_and_record_nonce("n1", now));
    }

    #[test]
    fn magic_link_one_shot() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_magic_link(
            "hash1".to_string(),
            MagicLinkEntry {
                email: "a@example.com".to_string(),
                user_id: Uuid::new_v4(),
                expires_at: now + chrono::Duration::minutes(10),
                used: false,
            },
        );
        assert!(store.consume_magic_link("hash1", now).is_some());
        assert!(store.consume_magic_link("hash1", now).is_none());
    }

    #[test]
    fn challenge_is_consumed_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_challenge("a@example.com".into(), "state-json".into(), now + chrono::Duration::minutes(5));
        assert_eq!(store.take_challenge("a@example.com", now), Some("state-json".to_string()));
        assert_eq!(store.take_challenge("a@example.com", now), None);
    }

    #[test]
    fn registration_step_defaults_to_none() {
        let store = MemoryStore::new();
        assert_eq!(store.registration_step("new@example.com"), "none");
        store.set_registration_step("new@example.com", "otp");
        assert_eq!(store.registration_step("new@example.com"), "otp");
    }

    #[test]
    fn rate_limit_rejects_once_max_is_reached() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let window = chrono::Duration::minutes(15);
        assert!(store.check_rate_limit("token_exchange:1.2.3.4", 2, window, now));
        assert!(store.check_rate_limit("token_exchange:1.2.3.4", 2, window, now));
        assert!(!store.check_rate_limit("token_exchange:1.2.3.4", 2, window, now));
    }

    #[test]
    fn backup_code_backoff_grows_with_each_failure() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store.backup_code_wait_until("a@example.com", now).is_none());
        store.record_backup_code_failure("a@example.com", 60, 1.8, now);
        let first_wait = store.backup_code_wait_until("a@example.com", now).unwrap();
        store.record_backup_code_failure("a@example.com", 60, 1.8, now);
        let second_wait = store.backup_code_wait_until("a@example.com", now).unwrap();
        assert!(second_wait > first_wait);
    }
}
