// Copyright (C) Microsoft Corporation. All rights reserved.

//! Table of recent hardware authentication tokens.
//!
//! Authenticators push tokens in as users authenticate; key operations
//! pull the freshest matching token back out. The table holds a small
//! fixed number of entries: adding beyond capacity first drops entries
//! superseded by the newcomer, then falls back to evicting the least
//! recently used one.

use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::HardwareAuthToken;
use crate::types::HardwareAuthenticatorType;

/// Entries held at most.
const MAX_ENTRIES: usize = 32;

/// Why a token lookup came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLookupError {
    /// No token matches the key's authentication binding.
    NotFound,
    /// A matching token exists but its freshness window has passed.
    Expired,
}

/// Monotonic milliseconds used for freshness decisions. Injectable so
/// tests can move time.
pub type ClockFn = Box<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug)]
struct Entry {
    token: HardwareAuthToken,
    last_use_ms: u64,
    /// Set once the operation this token was minted for has finished.
    completed: bool,
}

impl Entry {
    fn supersedes(&self, other: &Entry) -> bool {
        self.token.user_id == other.token.user_id
            && self.token.authenticator_id == other.token.authenticator_id
            && self.token.authenticator_type == other.token.authenticator_type
            && self.token.timestamp_ms > other.token.timestamp_ms
            && other.completed
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    last_off_body_ms: u64,
}

/// The token table.
pub struct AuthTokenTable {
    inner: Mutex<Inner>,
    clock: ClockFn,
}

impl std::fmt::Debug for AuthTokenTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTokenTable").field("inner", &self.inner).finish()
    }
}

impl Default for AuthTokenTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthTokenTable {
    /// Creates a table on the process monotonic clock.
    pub fn new() -> Self {
        let start = Instant::now();
        Self::with_clock(Box::new(move || start.elapsed().as_millis() as u64))
    }

    /// Creates a table with an injected clock.
    pub fn with_clock(clock: ClockFn) -> Self {
        Self { inner: Mutex::new(Inner::default()), clock }
    }

    /// Adds a token, making room by supersession first and LRU second.
    pub fn add(&self, token: HardwareAuthToken) {
        let now = (self.clock)();
        let mut inner = self.inner.lock();
        let entry = Entry { token, last_use_ms: now, completed: false };
        inner.entries.retain(|existing| !entry.supersedes(existing));
        if inner.entries.len() >= MAX_ENTRIES {
            if let Some(oldest) = inner
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_use_ms)
                .map(|(i, _)| i)
            {
                debug!("token table full, evicting least recently used entry");
                inner.entries.swap_remove(oldest);
            }
        }
        inner.entries.push(entry);
    }

    /// Finds the freshest incomplete token minted for operation
    /// `challenge` that vouches for one of `secure_ids` with an
    /// acceptable authenticator.
    pub fn find_for_operation(
        &self,
        secure_ids: &[u64],
        auth_type: HardwareAuthenticatorType,
        challenge: u64,
    ) -> Result<HardwareAuthToken, TokenLookupError> {
        let now = (self.clock)();
        let mut inner = self.inner.lock();
        let best = inner
            .entries
            .iter_mut()
            .filter(|e| {
                e.token.challenge == challenge
                    && !e.completed
                    && token_matches(&e.token, secure_ids, auth_type)
            })
            .max_by_key(|e| e.token.timestamp_ms)
            .ok_or(TokenLookupError::NotFound)?;
        best.last_use_ms = now;
        Ok(best.token.clone())
    }

    /// Finds the freshest token vouching for one of `secure_ids` within
    /// `timeout_secs` of now.
    ///
    /// With `allow_while_on_body`, tokens issued before the last off-body
    /// event are unusable.
    pub fn find_timed(
        &self,
        secure_ids: &[u64],
        auth_type: HardwareAuthenticatorType,
        timeout_secs: u32,
        allow_while_on_body: bool,
    ) -> Result<HardwareAuthToken, TokenLookupError> {
        let now = (self.clock)();
        let mut inner = self.inner.lock();
        let off_body_cutoff = inner.last_off_body_ms;
        let best = inner
            .entries
            .iter_mut()
            .filter(|e| token_matches(&e.token, secure_ids, auth_type))
            .max_by_key(|e| e.token.timestamp_ms)
            .ok_or(TokenLookupError::NotFound)?;
        let age_ms = now.saturating_sub(best.token.timestamp_ms);
        if age_ms > u64::from(timeout_secs) * 1000 {
            return Err(TokenLookupError::Expired);
        }
        if allow_while_on_body && best.token.timestamp_ms < off_body_cutoff {
            return Err(TokenLookupError::Expired);
        }
        best.last_use_ms = now;
        Ok(best.token.clone())
    }

    /// Marks the token minted for operation `challenge` as spent, and
    /// sweeps entries that newer tokens now supersede.
    pub fn mark_completed(&self, challenge: u64) {
        let mut inner = self.inner.lock();
        for i in 0..inner.entries.len() {
            if inner.entries[i].token.challenge == challenge {
                inner.entries[i].completed = true;
            }
        }
        let mut kept: Vec<Entry> = Vec::with_capacity(inner.entries.len());
        for entry in inner.entries.drain(..) {
            if !kept.iter().any(|k| k.supersedes(&entry)) {
                kept.retain(|k| !entry.supersedes(k));
                kept.push(entry);
            }
        }
        inner.entries = kept;
    }

    /// Records that the device left the user's body now.
    pub fn on_device_off_body(&self) {
        let now = (self.clock)();
        self.inner.lock().last_off_body_ms = now;
    }

    /// Drops every token. Used when the device locks all users out.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

fn token_matches(
    token: &HardwareAuthToken,
    secure_ids: &[u64],
    auth_type: HardwareAuthenticatorType,
) -> bool {
    token.authenticator_type.intersects(auth_type)
        && secure_ids
            .iter()
            .any(|sid| *sid == token.user_id || *sid == token.authenticator_id)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    fn table_at(now: Arc<AtomicU64>) -> AuthTokenTable {
        AuthTokenTable::with_clock(Box::new(move || now.load(Ordering::SeqCst)))
    }

    fn token(user_id: u64, challenge: u64, timestamp_ms: u64) -> HardwareAuthToken {
        HardwareAuthToken {
            challenge,
            user_id,
            authenticator_id: 900 + user_id,
            authenticator_type: HardwareAuthenticatorType::PASSWORD,
            timestamp_ms,
            mac: vec![0xaa; 32],
        }
    }

    #[test]
    fn test_find_for_operation_matches_challenge() {
        let now = Arc::new(AtomicU64::new(1_000));
        let table = table_at(now);
        table.add(token(42, 7, 500));
        table.add(token(42, 8, 600));

        let found = table
            .find_for_operation(&[42], HardwareAuthenticatorType::PASSWORD, 7)
            .unwrap();
        assert_eq!(found.challenge, 7);
        assert!(table
            .find_for_operation(&[42], HardwareAuthenticatorType::PASSWORD, 9)
            .is_err());
    }

    #[test]
    fn test_completed_operation_token_is_spent() {
        let now = Arc::new(AtomicU64::new(1_000));
        let table = table_at(now);
        table.add(token(42, 7, 500));
        table.mark_completed(7);
        assert_eq!(
            table.find_for_operation(&[42], HardwareAuthenticatorType::PASSWORD, 7),
            Err(TokenLookupError::NotFound)
        );
    }

    #[test]
    fn test_timed_lookup_honors_timeout() {
        let now = Arc::new(AtomicU64::new(10_000));
        let table = table_at(Arc::clone(&now));
        table.add(token(42, 0, 9_000));

        assert!(table
            .find_timed(&[42], HardwareAuthenticatorType::PASSWORD, 30, false)
            .is_ok());
        now.store(9_000 + 31_000, Ordering::SeqCst);
        assert_eq!(
            table.find_timed(&[42], HardwareAuthenticatorType::PASSWORD, 30, false),
            Err(TokenLookupError::Expired)
        );
    }

    #[test]
    fn test_timed_lookup_matches_authenticator_id() {
        let now = Arc::new(AtomicU64::new(1_000));
        let table = table_at(now);
        table.add(token(42, 0, 900));
        // Secure id list naming the authenticator rather than the user.
        assert!(table
            .find_timed(&[942], HardwareAuthenticatorType::PASSWORD, 60, false)
            .is_ok());
        assert_eq!(
            table.find_timed(&[41], HardwareAuthenticatorType::PASSWORD, 60, false),
            Err(TokenLookupError::NotFound)
        );
    }

    #[test]
    fn test_wrong_authenticator_type_not_found() {
        let now = Arc::new(AtomicU64::new(1_000));
        let table = table_at(now);
        table.add(token(42, 0, 900));
        assert_eq!(
            table.find_timed(&[42], HardwareAuthenticatorType::FINGERPRINT, 60, false),
            Err(TokenLookupError::NotFound)
        );
    }

    #[test]
    fn test_off_body_invalidates_on_body_tokens() {
        let now = Arc::new(AtomicU64::new(10_000));
        let table = table_at(Arc::clone(&now));
        table.add(token(42, 0, 9_000));
        table.on_device_off_body();
        assert_eq!(
            table.find_timed(&[42], HardwareAuthenticatorType::PASSWORD, 600, true),
            Err(TokenLookupError::Expired)
        );
        // Keys without the on-body binding still accept the token.
        assert!(table
            .find_timed(&[42], HardwareAuthenticatorType::PASSWORD, 600, false)
            .is_ok());
    }

    #[test]
    fn test_supersession_requires_completion() {
        let now = Arc::new(AtomicU64::new(1_000));
        let table = table_at(now);
        table.add(token(42, 7, 500));
        table.add(token(42, 8, 600));
        // Both live: the older one is not completed yet.
        assert_eq!(table.len(), 2);

        table.mark_completed(7);
        table.add(token(42, 9, 700));
        // The completed older token is swept by the newer one.
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_capacity_falls_back_to_lru() {
        let now = Arc::new(AtomicU64::new(100_000));
        let table = table_at(Arc::clone(&now));
        for i in 0..MAX_ENTRIES as u64 {
            now.store(1_000 + i, Ordering::SeqCst);
            table.add(token(i, i + 1, 1_000 + i));
        }
        assert_eq!(table.len(), MAX_ENTRIES);

        // Touch the first entry so it is no longer the LRU victim.
        now.store(200_000, Ordering::SeqCst);
        table
            .find_for_operation(&[0], HardwareAuthenticatorType::PASSWORD, 1)
            .unwrap();

        table.add(token(999, 999, 150_000));
        assert_eq!(table.len(), MAX_ENTRIES);
        assert!(table
            .find_for_operation(&[0], HardwareAuthenticatorType::PASSWORD, 1)
            .is_ok());
    }
}
