// Copyright (C) Microsoft Corporation. All rights reserved.

//! In-memory grants: one uid letting another use a specific key.
//!
//! A grant never renames the underlying entry. The grantee addresses it
//! through a synthetic alias `<alias>_GRANT_<n>` with a random `n`, and
//! resolution maps that back to the owner's entry. Grants do not survive
//! a restart.

use std::collections::HashMap;
use std::collections::HashSet;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

/// Marker between the owner alias and the grant number.
const GRANT_INFIX: &str = "_GRANT_";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Grant {
    owner_uid: u32,
    alias: String,
    grant_no: u64,
}

impl Grant {
    fn granted_alias(&self) -> String {
        format!("{}{}{}", self.alias, GRANT_INFIX, self.grant_no)
    }
}

/// Resolution of a granted alias back to the owning entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGrant {
    /// Uid owning the real entry.
    pub owner_uid: u32,
    /// The owner's alias for it.
    pub alias: String,
}

/// All live grants, keyed by grantee uid.
#[derive(Debug, Default)]
pub struct GrantStore {
    grants: Mutex<HashMap<u32, HashSet<Grant>>>,
}

impl GrantStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `grantee_uid` access to `owner_uid`'s `alias`, returning
    /// the alias the grantee must use. Granting the same key twice
    /// returns the existing alias.
    pub fn put(&self, grantee_uid: u32, owner_uid: u32, alias: &str) -> String {
        let mut grants = self.grants.lock();
        let set = grants.entry(grantee_uid).or_default();
        if let Some(existing) =
            set.iter().find(|g| g.owner_uid == owner_uid && g.alias == alias)
        {
            return existing.granted_alias();
        }
        let grant = Grant {
            owner_uid,
            alias: alias.to_string(),
            grant_no: rand::thread_rng().gen(),
        };
        let granted = grant.granted_alias();
        debug!(grantee_uid, owner_uid, "grant created");
        set.insert(grant);
        granted
    }

    /// Resolves a granted alias for `grantee_uid`, if it names a live
    /// grant.
    pub fn get(&self, grantee_uid: u32, granted_alias: &str) -> Option<ResolvedGrant> {
        let (alias, grant_no) = split_granted_alias(granted_alias)?;
        let grants = self.grants.lock();
        grants.get(&grantee_uid)?.iter().find_map(|g| {
            (g.grant_no == grant_no && g.alias == alias).then(|| ResolvedGrant {
                owner_uid: g.owner_uid,
                alias: g.alias.clone(),
            })
        })
    }

    /// Revokes `grantee_uid`'s grant on `owner_uid`'s `alias`. Returns
    /// whether a grant existed.
    pub fn remove(&self, grantee_uid: u32, owner_uid: u32, alias: &str) -> bool {
        let mut grants = self.grants.lock();
        match grants.get_mut(&grantee_uid) {
            Some(set) => {
                let before = set.len();
                set.retain(|g| !(g.owner_uid == owner_uid && g.alias == alias));
                set.len() != before
            }
            None => false,
        }
    }

    /// Drops every grant on `owner_uid`'s `alias`. Called when the key
    /// is deleted.
    pub fn remove_all_for_key(&self, owner_uid: u32, alias: &str) {
        let mut grants = self.grants.lock();
        for set in grants.values_mut() {
            set.retain(|g| !(g.owner_uid == owner_uid && g.alias == alias));
        }
    }

    /// Drops every grant held by or issued by `uid`. Called when the
    /// uid's keys are cleared.
    pub fn remove_all_for_uid(&self, uid: u32) {
        let mut grants = self.grants.lock();
        grants.remove(&uid);
        for set in grants.values_mut() {
            set.retain(|g| g.owner_uid != uid);
        }
    }
}

fn split_granted_alias(granted_alias: &str) -> Option<(&str, u64)> {
    let pos = granted_alias.rfind(GRANT_INFIX)?;
    let alias = &granted_alias[..pos];
    let grant_no = granted_alias[pos + GRANT_INFIX.len()..].parse().ok()?;
    Some((alias, grant_no))
}
