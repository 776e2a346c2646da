// Copyright (C) Microsoft Corporation. All rights reserved.

//! Key entry naming and per-entry locking.
//!
//! An entry is the pair (owning uid, alias). On disk it becomes the file
//! `<uid>_<escaped alias>` inside the owning user's directory; the escape
//! keeps arbitrary alias strings out of path syntax. The [`LockRegistry`]
//! serializes concurrent access to individual entries and offers a global
//! fence for directory-wide scans.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// One key entry: who owns it and what they call it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyEntry {
    uid: u32,
    alias: String,
}

impl KeyEntry {
    /// Builds an entry.
    pub fn new(uid: u32, alias: impl Into<String>) -> Self {
        Self { uid, alias: alias.into() }
    }

    /// Owning uid.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Client-visible alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// User id of the owning uid.
    pub fn user_id(&self) -> u32 {
        self.uid / crate::user::AID_USER_OFFSET
    }

    /// File name of this entry inside the user directory.
    pub fn file_name(&self) -> String {
        format!("{}_{}", self.uid, escape_alias(&self.alias))
    }

    /// Recovers an entry from a file name produced by [`file_name`]
    /// (KeyEntry::file_name). Returns `None` for names that do not parse.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let (uid, escaped) = name.split_once('_')?;
        let uid = uid.parse().ok()?;
        let alias = unescape_alias(escaped)?;
        Some(Self { uid, alias })
    }
}

/// Escapes an alias for use as a file name component. Bytes in the
/// printable range `0`..`~` pass through; anything else becomes a
/// two-character pair: `+` offset by the high two bits, then `0` offset
/// by the low six.
pub fn escape_alias(alias: &str) -> String {
    let mut out = String::with_capacity(alias.len());
    for byte in alias.bytes() {
        if (b'0'..=b'~').contains(&byte) {
            out.push(byte as char);
        } else {
            out.push((b'+' + (byte >> 6)) as char);
            out.push((b'0' + (byte & 0x3f)) as char);
        }
    }
    out
}

/// Reverses [`escape_alias`]. Returns `None` on malformed escapes.
pub fn unescape_alias(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let first = bytes[i];
        if (b'0'..=b'~').contains(&first) {
            out.push(first);
            i += 1;
        } else if (b'+'..=b'.').contains(&first) {
            let low = bytes.get(i + 1)?.checked_sub(b'0')?;
            if low > 0x3f {
                return None;
            }
            out.push(((first - b'+') << 6) | low);
            i += 2;
        } else {
            return None;
        }
    }
    String::from_utf8(out).ok()
}

#[derive(Debug, Default)]
struct Locked {
    entries: HashSet<KeyEntry>,
}

/// Tracks which entries are currently being worked on.
///
/// `lock` blocks until the entry is free; the returned guard releases it.
/// `fence` waits for every held lock to drain and runs a closure while
/// the registry mutex is held, so no new per-entry lock can be taken
/// until the closure returns.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locked: Mutex<Locked>,
    released: Condvar,
}

impl LockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Locks `entry`, waiting until any current holder releases it.
    pub fn lock(self: &Arc<Self>, entry: KeyEntry) -> LockedEntry {
        let mut locked = self.locked.lock();
        while locked.entries.contains(&entry) {
            self.released.wait(&mut locked);
        }
        locked.entries.insert(entry.clone());
        LockedEntry { registry: Arc::clone(self), entry }
    }

    /// Runs `f` once every held lock has drained, blocking new locks for
    /// the duration.
    pub fn fence<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut locked = self.locked.lock();
        while !locked.entries.is_empty() {
            self.released.wait(&mut locked);
        }
        f()
    }

    fn release(&self, entry: &KeyEntry) {
        let mut locked = self.locked.lock();
        locked.entries.remove(entry);
        drop(locked);
        self.released.notify_all();
    }
}

/// Exclusive hold on one entry. Dropping releases it.
#[derive(Debug)]
pub struct LockedEntry {
    registry: Arc<LockRegistry>,
    entry: KeyEntry,
}

impl Deref for LockedEntry {
    type Target = KeyEntry;

    fn deref(&self) -> &KeyEntry {
        &self.entry
    }
}

impl Drop for LockedEntry {
    fn drop(&mut self) {
        self.registry.release(&self.entry);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for alias in ["simple", "with space", "päß", "a+b", "dots.and/slash", ""] {
            let escaped = escape_alias(alias);
            assert!(!escaped.contains('/'));
            assert_eq!(unescape_alias(&escaped).as_deref(), Some(alias));
        }
    }

    #[test]
    fn test_escape_is_one_pair_per_byte() {
        assert_eq!(escape_alias("a+b"), "a+[b");
        assert_eq!(escape_alias("a/b"), "a+_b");
        assert_eq!(escape_alias("a b"), "a+Pb");
        // High bytes land in the `,`..`.` lead range.
        assert_eq!(escape_alias("ä"), ".3-T");
    }

    #[test]
    fn test_file_name_round_trip() {
        let entry = KeyEntry::new(10023, "my key/1");
        let parsed = KeyEntry::parse_file_name(&entry.file_name()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(KeyEntry::parse_file_name("no-separator").is_none());
        assert!(KeyEntry::parse_file_name("abc_alias").is_none());
        assert!(KeyEntry::parse_file_name("10_bad+zz").is_none());
    }

    #[test]
    fn test_lock_excludes_same_entry() {
        let registry = LockRegistry::new();
        let entry = KeyEntry::new(1, "a");
        let counter = Arc::new(AtomicU32::new(0));

        let guard = registry.lock(entry.clone());
        let handle = {
            let registry = Arc::clone(&registry);
            let counter = Arc::clone(&counter);
            let entry = entry.clone();
            std::thread::spawn(move || {
                let _guard = registry.lock(entry);
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(guard);
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_entries_do_not_block() {
        let registry = LockRegistry::new();
        let _a = registry.lock(KeyEntry::new(1, "a"));
        let _b = registry.lock(KeyEntry::new(1, "b"));
        let _c = registry.lock(KeyEntry::new(2, "a"));
    }

    #[test]
    fn test_fence_waits_for_drain() {
        let registry = LockRegistry::new();
        let guard = registry.lock(KeyEntry::new(1, "a"));
        let fenced = Arc::new(AtomicU32::new(0));

        let handle = {
            let registry = Arc::clone(&registry);
            let fenced = Arc::clone(&fenced);
            std::thread::spawn(move || {
                registry.fence(|| {
                    fenced.store(1, Ordering::SeqCst);
                });
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fenced.load(Ordering::SeqCst), 0);
        drop(guard);
        handle.join().unwrap();
        assert_eq!(fenced.load(Ordering::SeqCst), 1);
    }
}
