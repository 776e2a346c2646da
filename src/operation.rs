// Copyright (C) Microsoft Corporation. All rights reserved.

//! Registry of in-flight operations on one device.
//!
//! Clients hold opaque random tokens; the registry maps them back to the
//! device handle, the authorization context captured at `begin`, and
//! pruning metadata. The registry admits at most [`MAX_OPERATIONS`]
//! entries; making room is the worker's job via [`oldest_pruneable`]
//! (OperationRegistry::oldest_pruneable).

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::types::AuthorizationSet;
use crate::types::KeyPurpose;

/// Open operations one device worker tolerates.
pub const MAX_OPERATIONS: usize = 15;

/// Context of one in-flight operation.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Handle the device returned; doubles as the auth challenge.
    pub handle: u64,
    /// Purpose the operation was begun for.
    pub purpose: KeyPurpose,
    /// Rate-limit id of the key.
    pub key_id: u64,
    /// The key's combined enforced tags, for re-authorization.
    pub key_auths: AuthorizationSet,
    /// Uid the operation runs for.
    pub uid: u32,
    /// Whether the worker may abort this operation to make room.
    pub pruneable: bool,
}

#[derive(Debug)]
struct Slot {
    op: Operation,
    last_use: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<u64, Slot>,
    use_counter: u64,
}

/// The registry. Shared between the owning worker and the service's
/// token-routing probes.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    inner: Mutex<Inner>,
}

impl OperationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open operations.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Whether no operations are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the registry is at its ceiling.
    pub fn is_full(&self) -> bool {
        self.len() >= MAX_OPERATIONS
    }

    /// Whether `token` names an operation here. Used to route a token to
    /// its owning worker.
    pub fn contains(&self, token: u64) -> bool {
        self.inner.lock().slots.contains_key(&token)
    }

    /// Registers an operation and returns its client token.
    pub fn add(&self, op: Operation) -> u64 {
        let mut inner = self.inner.lock();
        let mut rng = rand::thread_rng();
        let token = loop {
            let candidate: u64 = rng.gen();
            if candidate != 0 && !inner.slots.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.use_counter += 1;
        let last_use = inner.use_counter;
        debug!(token, handle = op.handle, "operation registered");
        inner.slots.insert(token, Slot { op, last_use });
        token
    }

    /// Looks up an operation, refreshing its recency.
    pub fn get(&self, token: u64) -> Option<Operation> {
        let mut inner = self.inner.lock();
        inner.use_counter += 1;
        let counter = inner.use_counter;
        let slot = inner.slots.get_mut(&token)?;
        slot.last_use = counter;
        Some(slot.op.clone())
    }

    /// Removes an operation.
    pub fn remove(&self, token: u64) -> Option<Operation> {
        self.inner.lock().slots.remove(&token).map(|s| s.op)
    }

    /// Marks whether `token` may be pruned.
    pub fn set_pruneable(&self, token: u64, pruneable: bool) {
        if let Some(slot) = self.inner.lock().slots.get_mut(&token) {
            slot.op.pruneable = pruneable;
        }
    }

    /// Token of the least recently used pruneable operation.
    pub fn oldest_pruneable(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.op.pruneable)
            .min_by_key(|(_, slot)| slot.last_use)
            .map(|(token, _)| *token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(handle: u64, pruneable: bool) -> Operation {
        Operation {
            handle,
            purpose: KeyPurpose::Sign,
            key_id: 1,
            key_auths: AuthorizationSet::new(),
            uid: 10023,
            pruneable,
        }
    }

    #[test]
    fn test_add_get_remove() {
        let registry = OperationRegistry::new();
        let token = registry.add(op(7, true));
        assert_ne!(token, 0);
        assert!(registry.contains(token));
        assert_eq!(registry.get(token).unwrap().handle, 7);
        assert_eq!(registry.remove(token).unwrap().handle, 7);
        assert!(registry.get(token).is_none());
    }

    #[test]
    fn test_oldest_pruneable_ignores_pinned() {
        let registry = OperationRegistry::new();
        let pinned = registry.add(op(1, false));
        let old = registry.add(op(2, true));
        let _new = registry.add(op(3, true));
        assert_eq!(registry.oldest_pruneable(), Some(old));

        registry.set_pruneable(pinned, true);
        assert_eq!(registry.oldest_pruneable(), Some(pinned));
    }

    #[test]
    fn test_access_refreshes_recency() {
        let registry = OperationRegistry::new();
        let a = registry.add(op(1, true));
        let b = registry.add(op(2, true));
        // Touching `a` makes `b` the pruning victim.
        registry.get(a).unwrap();
        assert_eq!(registry.oldest_pruneable(), Some(b));
    }

    #[test]
    fn test_full_at_ceiling() {
        let registry = OperationRegistry::new();
        for i in 0..MAX_OPERATIONS as u64 {
            registry.add(op(i, true));
        }
        assert!(registry.is_full());
    }
}
