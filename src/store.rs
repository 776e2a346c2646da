// Copyright (C) Microsoft Corporation. All rights reserved.

//! The on-disk key store.
//!
//! [`KeyStore`] owns the directory tree, the per-entry lock registry,
//! the per-user master key states, the grant store, the auth token
//! table, and the enforcement engine. It reads and writes blobs with the
//! owning user's master key fetched internally; callers never touch key
//! material paths directly.
//!
//! Discipline: a caller that intends to read, write, or delete an entry
//! acquires its [`LockedEntry`] first; bulk scans go through the
//! registry's global fence. A user state guard may be held while
//! acquiring an entry lock, never the reverse.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::auth_token::AuthTokenTable;
use crate::blob::Blob;
use crate::blob::BlobType;
use crate::enforcement::Enforcement;
use crate::entry::escape_alias;
use crate::entry::KeyEntry;
use crate::entry::LockRegistry;
use crate::entry::LockedEntry;
use crate::error::Error;
use crate::error::Result;
use crate::grant::GrantStore;
use crate::grant::ResolvedGrant;
use crate::types::KeyCharacteristics;
use crate::types::Tag;
use crate::user::LockState;
use crate::user::UserStateDb;
use crate::user::AID_USER_OFFSET;

/// Store schema understood by this version.
const SCHEMA_VERSION: u32 = 2;

/// Top-level file recording the schema version.
const METADATA_FILE: &str = "metadata";

/// The uid owning device-encryption-critical system keys.
pub const AID_SYSTEM: u32 = 1000;

/// The store.
#[derive(Debug)]
pub struct KeyStore {
    root: PathBuf,
    locks: Arc<LockRegistry>,
    users: UserStateDb,
    grants: GrantStore,
    tokens: AuthTokenTable,
    enforcement: Enforcement,
}

impl KeyStore {
    /// Opens the store rooted at `root`, migrating older layouts.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            users: UserStateDb::new(&root),
            locks: LockRegistry::new(),
            grants: GrantStore::new(),
            tokens: AuthTokenTable::new(),
            enforcement: Enforcement::new(),
            root,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Opens the store with injected policy components, for tests.
    pub fn open_with(
        root: impl Into<PathBuf>,
        tokens: AuthTokenTable,
        enforcement: Enforcement,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            users: UserStateDb::new(&root),
            locks: LockRegistry::new(),
            grants: GrantStore::new(),
            tokens,
            enforcement,
            root,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Directory the store lives in.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// The grant store.
    pub fn grants(&self) -> &GrantStore {
        &self.grants
    }

    /// The auth token table.
    pub fn tokens(&self) -> &AuthTokenTable {
        &self.tokens
    }

    /// The enforcement engine.
    pub fn enforcement(&self) -> &Enforcement {
        &self.enforcement
    }

    /// One-time layout migrations, driven by the schema version in the
    /// metadata file. Version 1 kept every user's files flat in the
    /// root; version 2 moved them under `user_<id>` directories.
    fn migrate(&self) -> Result<()> {
        let meta = self.root.join(METADATA_FILE);
        let version = match fs::read(&meta) {
            Ok(raw) if raw.len() >= 4 => {
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
            }
            _ => 1,
        };
        if version < 2 {
            for dirent in fs::read_dir(&self.root)? {
                let dirent = dirent?;
                if !dirent.file_type()?.is_file() {
                    continue;
                }
                let name = dirent.file_name();
                let Some(name) = name.to_str() else { continue };
                if name == METADATA_FILE {
                    continue;
                }
                let Some(entry) = KeyEntry::parse_file_name(name.trim_start_matches('.'))
                else {
                    continue;
                };
                let target_dir = self.root.join(format!("user_{}", entry.user_id()));
                fs::create_dir_all(&target_dir)?;
                fs::rename(dirent.path(), target_dir.join(name))?;
                info!(file = name, "migrated flat entry into user directory");
            }
        }
        if version != SCHEMA_VERSION {
            fs::write(&meta, SCHEMA_VERSION.to_be_bytes())?;
        }
        Ok(())
    }

    fn user_dir(&self, uid: u32) -> PathBuf {
        self.root.join(format!("user_{}", uid / AID_USER_OFFSET))
    }

    fn entry_path(&self, entry: &KeyEntry) -> PathBuf {
        self.user_dir(entry.uid()).join(entry.file_name())
    }

    fn characteristics_path(&self, entry: &KeyEntry) -> PathBuf {
        self.user_dir(entry.uid())
            .join(format!(".{}_chr_{}", entry.uid(), escape_alias(entry.alias())))
    }

    fn master_key_for(&self, uid: u32) -> Result<Option<Vec<u8>>> {
        let state = self.users.get_for_uid(uid)?;
        let state = state.lock();
        Ok(state.master_key().map(|k| k.to_vec()))
    }

    /// Locks an entry for exclusive use.
    pub fn lock_entry(&self, entry: KeyEntry) -> LockedEntry {
        self.locks.lock(entry)
    }

    /// Resolves the entry a caller named: the caller's own alias if it
    /// exists, otherwise a grant made to the caller.
    pub fn get_key_for_name(&self, uid: u32, alias: &str) -> Result<KeyEntry> {
        let own = KeyEntry::new(uid, alias);
        if self.entry_path(&own).exists() {
            return Ok(own);
        }
        match self.grants.get(uid, alias) {
            Some(ResolvedGrant { owner_uid, alias }) => Ok(KeyEntry::new(owner_uid, alias)),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Whether the entry's file exists.
    pub fn exists(&self, entry: &KeyEntry) -> bool {
        self.entry_path(entry).exists()
    }

    /// Reads an entry's blob header without any key material. Used to
    /// route an entry to the device that owns it.
    pub fn peek(&self, entry: &KeyEntry) -> Result<crate::blob::BlobPeek> {
        let raw = match fs::read(self.entry_path(entry)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::KeyNotFound);
            }
            Err(err) => return Err(err.into()),
        };
        Blob::peek(&raw)
    }

    /// Reads and decodes an entry. Superseded formats are rewritten in
    /// place while the blob is in hand.
    #[instrument(skip(self), fields(uid = entry.uid(), alias = entry.alias()))]
    pub fn get(&self, entry: &KeyEntry) -> Result<Blob> {
        let raw = match fs::read(self.entry_path(entry)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::KeyNotFound);
            }
            Err(err) => return Err(err.into()),
        };
        let master_key = self.master_key_for(entry.uid())?;
        let blob = Blob::decode(&raw, master_key.as_deref())?;
        if blob.needs_rewrite() {
            self.put(entry, &blob)?;
        }
        Ok(blob)
    }

    /// Encodes and writes an entry. A write that does not complete fully
    /// is treated as if it never happened.
    #[instrument(skip(self, blob), fields(uid = entry.uid(), alias = entry.alias()))]
    pub fn put(&self, entry: &KeyEntry, blob: &Blob) -> Result<()> {
        let master_key = if blob.is_encrypted() {
            match self.master_key_for(entry.uid())? {
                Some(key) => Some(key),
                None => return Err(Error::Locked),
            }
        } else {
            None
        };
        fs::create_dir_all(self.user_dir(entry.uid()))?;
        self.write_fully(&self.entry_path(entry), &blob.encode(master_key.as_deref())?)
    }

    fn write_fully(&self, path: &std::path::Path, data: &[u8]) -> Result<()> {
        let file = path.file_name().ok_or(Error::SystemError)?;
        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(file);
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        if let Err(err) = fs::write(&tmp, data).and_then(|_| fs::rename(&tmp, path)) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    error!(?cleanup, "failed to remove partial blob file");
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Deletes an entry's files and revokes its grants. Returns the
    /// device key blob payload when it could be recovered, so the caller
    /// can ask the device to forget it too.
    #[instrument(skip(self), fields(uid = entry.uid(), alias = entry.alias()))]
    pub fn del(&self, entry: &KeyEntry) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(entry);
        if !path.exists() {
            return Err(Error::KeyNotFound);
        }
        let device_blob = match self.get(entry) {
            Ok(blob) if blob.blob_type() == BlobType::DeviceKey => {
                Some(blob.value().to_vec())
            }
            Ok(_) => None,
            Err(err) => {
                warn!(?err, "deleting entry whose blob cannot be read");
                None
            }
        };
        fs::remove_file(&path)?;
        let chr = self.characteristics_path(entry);
        if chr.exists() {
            fs::remove_file(chr)?;
        }
        self.grants.remove_all_for_key(entry.uid(), entry.alias());
        Ok(device_blob)
    }

    /// Cached characteristics for an entry, with a flag telling the
    /// caller the cache is in the legacy format and wants a refresh.
    /// Unreadable caches report as absent; they are refreshed, never
    /// surfaced.
    pub fn get_characteristics_cache(
        &self,
        entry: &KeyEntry,
    ) -> Result<Option<(KeyCharacteristics, bool)>> {
        let raw = match fs::read(self.characteristics_path(entry)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let master_key = self.master_key_for(entry.uid())?;
        let blob = match Blob::decode(&raw, master_key.as_deref()) {
            Ok(blob) => blob,
            Err(Error::Locked) => return Err(Error::Locked),
            Err(_) => return Ok(None),
        };
        let legacy = blob.blob_type() == BlobType::CharacteristicsCache;
        match KeyCharacteristics::deserialize(blob.value()) {
            Ok(chars) => Ok(Some((chars, legacy))),
            Err(_) => Ok(None),
        }
    }

    /// Writes the characteristics cache for an entry.
    pub fn put_characteristics_cache(
        &self,
        entry: &KeyEntry,
        chars: &KeyCharacteristics,
        encrypted: bool,
    ) -> Result<()> {
        let flags = if encrypted {
            crate::types::BlobFlags::ENCRYPTED
        } else {
            crate::types::BlobFlags::empty()
        };
        let blob = Blob::new(BlobType::Characteristics, flags, chars.serialize(), vec![]);
        let master_key = if encrypted {
            match self.master_key_for(entry.uid())? {
                Some(key) => Some(key),
                None => return Err(Error::Locked),
            }
        } else {
            None
        };
        fs::create_dir_all(self.user_dir(entry.uid()))?;
        self.write_fully(
            &self.characteristics_path(entry),
            &blob.encode(master_key.as_deref())?,
        )
    }

    /// Lists aliases of `uid`'s entries starting with `prefix`, behind
    /// the global fence.
    pub fn list(&self, uid: u32, prefix: &str) -> Result<Vec<String>> {
        let dir = self.user_dir(uid);
        self.locks.fence(|| {
            let mut aliases = Vec::new();
            let read = match fs::read_dir(&dir) {
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(aliases);
                }
                Err(err) => return Err(err.into()),
            };
            for dirent in read {
                let dirent = dirent?;
                let name = dirent.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                let Some(entry) = KeyEntry::parse_file_name(name) else { continue };
                if entry.uid() == uid && entry.alias().starts_with(prefix) {
                    aliases.push(entry.alias().to_string());
                }
            }
            aliases.sort();
            Ok(aliases)
        })
    }

    /// Whether `uid`'s user has no entries at all.
    pub fn is_empty(&self, uid: u32) -> Result<bool> {
        let dir = self.user_dir(uid);
        self.locks.fence(|| {
            let read = match fs::read_dir(&dir) {
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
                Err(err) => return Err(err.into()),
            };
            for dirent in read {
                let dirent = dirent?;
                let name = dirent.file_name();
                let Some(name) = name.to_str() else { continue };
                if KeyEntry::parse_file_name(name).is_some() {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    /// Deletes all of `uid`'s entries. For the system uid, keys flagged
    /// critical to device encryption survive.
    #[instrument(skip(self))]
    pub fn clear_uid(&self, uid: u32) -> Result<Vec<Vec<u8>>> {
        let dir = self.user_dir(uid);
        let mut device_blobs = Vec::new();
        self.locks.fence(|| -> Result<()> {
            let read = match fs::read_dir(&dir) {
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            for dirent in read {
                let dirent = dirent?;
                let name = dirent.file_name();
                let Some(name) = name.to_str() else { continue };
                let visible = KeyEntry::parse_file_name(name);
                let Some(entry) = visible else { continue };
                if entry.uid() != uid {
                    continue;
                }
                let raw = fs::read(dirent.path())?;
                if let Ok(peek) = Blob::peek(&raw) {
                    if uid == AID_SYSTEM
                        && peek
                            .flags
                            .contains(crate::types::BlobFlags::CRITICAL_TO_DEVICE_ENCRYPTION)
                    {
                        info!(alias = entry.alias(), "sparing device-encryption key");
                        continue;
                    }
                }
                if let Ok(Some(device_blob)) = self.del(&entry) {
                    device_blobs.push(device_blob);
                }
            }
            Ok(())
        })?;
        self.grants.remove_all_for_uid(uid);
        Ok(device_blobs)
    }

    /// Uids under `user_id` owning at least one key bound to an
    /// authenticator, judged from readable characteristics caches.
    /// Entries without a cache are skipped.
    pub fn uids_of_auth_bound_keys(&self, user_id: u32) -> Result<Vec<u32>> {
        let dir = self.root.join(format!("user_{user_id}"));
        self.locks.fence(|| {
            let mut uids: Vec<u32> = Vec::new();
            let read = match fs::read_dir(&dir) {
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(uids),
                Err(err) => return Err(err.into()),
            };
            for dirent in read {
                let dirent = dirent?;
                let name = dirent.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                let Some(entry) = KeyEntry::parse_file_name(name) else { continue };
                if uids.contains(&entry.uid()) {
                    continue;
                }
                let chars = match self.get_characteristics_cache(&entry) {
                    Ok(Some((chars, _))) => chars,
                    Ok(None) | Err(Error::Locked) => continue,
                    Err(err) => return Err(err),
                };
                let auths = chars.all();
                if auths.contains_tag(Tag::UserSecureId)
                    && !auths.contains_tag(Tag::NoAuthRequired)
                {
                    uids.push(entry.uid());
                }
            }
            uids.sort_unstable();
            Ok(uids)
        })
    }

    /// Lock state of `user_id`.
    pub fn state(&self, user_id: u32) -> Result<LockState> {
        let state = self.users.get(user_id)?;
        let state = state.lock();
        Ok(state.state())
    }

    /// Unlocks `user_id` with `password`, or initializes a fresh store.
    pub fn unlock_user(&self, user_id: u32, password: &str) -> Result<()> {
        let state = self.users.get(user_id)?;
        let mut state = state.lock();
        match state.state() {
            LockState::Uninitialized => state.initialize(password),
            _ => state.read_master_key(password),
        }
    }

    /// Reacts to a password change for `user_id`.
    pub fn password_changed(&self, user_id: u32, password: &str) -> Result<()> {
        let state = self.users.get(user_id)?;
        let mut state = state.lock();
        state.password_changed(password)
    }

    /// Drops `user_id`'s master key from memory.
    pub fn lock_user(&self, user_id: u32) -> Result<()> {
        let state = self.users.get(user_id)?;
        let mut state = state.lock();
        state.lock();
        Ok(())
    }

    /// Destroys every entry of `user_id` and returns the store to
    /// uninitialized. Deliberately irreversible.
    pub fn reset_user(&self, user_id: u32) -> Result<()> {
        let state = self.users.get(user_id)?;
        let mut state = state.lock();
        self.locks.fence(|| state.reset())
    }

    /// Duplicates `parent`'s sealed master key for `child`.
    pub fn copy_master_key(&self, parent: u32, child: u32) -> Result<()> {
        let parent_state = self.users.get(parent)?;
        let child_state = self.users.get(child)?;
        let parent_state = parent_state.lock();
        let mut child_state = child_state.lock();
        parent_state.copy_master_key_to(&mut child_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlobFlags;

    fn open_store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn unlocked(store: &KeyStore, user_id: u32) {
        store.unlock_user(user_id, "hunter2").unwrap();
    }

    fn generic(value: &[u8], flags: BlobFlags) -> Blob {
        Blob::new(BlobType::Generic, flags, value.to_vec(), vec![])
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, store) = open_store();
        unlocked(&store, 0);
        let entry = KeyEntry::new(10023, "alias");
        store.put(&entry, &generic(b"data", BlobFlags::ENCRYPTED)).unwrap();
        assert_eq!(store.get(&entry).unwrap().value(), b"data");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = open_store();
        assert_eq!(
            store.get(&KeyEntry::new(10023, "ghost")).unwrap_err(),
            Error::KeyNotFound
        );
    }

    #[test]
    fn test_encrypted_put_requires_unlock() {
        let (_dir, store) = open_store();
        let entry = KeyEntry::new(10023, "alias");
        assert_eq!(
            store.put(&entry, &generic(b"data", BlobFlags::ENCRYPTED)).unwrap_err(),
            Error::Locked
        );
        // Plain blobs go through regardless.
        store.put(&entry, &generic(b"data", BlobFlags::empty())).unwrap();
    }

    #[test]
    fn test_encrypted_get_while_locked() {
        let (_dir, store) = open_store();
        unlocked(&store, 0);
        let entry = KeyEntry::new(10023, "alias");
        store.put(&entry, &generic(b"data", BlobFlags::ENCRYPTED)).unwrap();
        store.lock_user(0).unwrap();
        assert_eq!(store.get(&entry).unwrap_err(), Error::Locked);
        store.unlock_user(0, "hunter2").unwrap();
        assert_eq!(store.get(&entry).unwrap().value(), b"data");
    }

    #[test]
    fn test_list_by_prefix() {
        let (_dir, store) = open_store();
        let blob = generic(b"x", BlobFlags::empty());
        for alias in ["wifi", "wifi2", "vpn"] {
            store.put(&KeyEntry::new(10023, alias), &blob).unwrap();
        }
        store.put(&KeyEntry::new(10024, "wifi9"), &blob).unwrap();

        assert_eq!(store.list(10023, "wifi").unwrap(), vec!["wifi", "wifi2"]);
        assert_eq!(store.list(10023, "").unwrap(), vec!["vpn", "wifi", "wifi2"]);
        assert!(store.list(10099, "").unwrap().is_empty());
    }

    #[test]
    fn test_grant_resolution() {
        let (_dir, store) = open_store();
        let entry = KeyEntry::new(10023, "wifi");
        store.put(&entry, &generic(b"x", BlobFlags::empty())).unwrap();
        let granted = store.grants().put(10100, 10023, "wifi");

        let resolved = store.get_key_for_name(10100, &granted).unwrap();
        assert_eq!(resolved, entry);
        assert_eq!(
            store.get_key_for_name(10100, "wifi").unwrap_err(),
            Error::KeyNotFound
        );
    }

    #[test]
    fn test_del_revokes_grants() {
        let (_dir, store) = open_store();
        let entry = KeyEntry::new(10023, "wifi");
        store.put(&entry, &generic(b"x", BlobFlags::empty())).unwrap();
        let granted = store.grants().put(10100, 10023, "wifi");

        store.del(&entry).unwrap();
        assert_eq!(
            store.get_key_for_name(10100, &granted).unwrap_err(),
            Error::KeyNotFound
        );
        assert_eq!(store.del(&entry).unwrap_err(), Error::KeyNotFound);
    }

    #[test]
    fn test_clear_uid_spares_critical_system_keys() {
        let (_dir, store) = open_store();
        let critical = KeyEntry::new(AID_SYSTEM, "vold-key");
        store
            .put(&critical, &generic(b"x", BlobFlags::CRITICAL_TO_DEVICE_ENCRYPTION))
            .unwrap();
        let normal = KeyEntry::new(AID_SYSTEM, "other");
        store.put(&normal, &generic(b"y", BlobFlags::empty())).unwrap();

        store.clear_uid(AID_SYSTEM).unwrap();
        assert!(store.exists(&critical));
        assert!(!store.exists(&normal));

        // Non-system uids get no exemption.
        let app = KeyEntry::new(10023, "app-key");
        store
            .put(&app, &generic(b"z", BlobFlags::CRITICAL_TO_DEVICE_ENCRYPTION))
            .unwrap();
        store.clear_uid(10023).unwrap();
        assert!(!store.exists(&app));
    }

    #[test]
    fn test_characteristics_cache_round_trip() {
        let (_dir, store) = open_store();
        unlocked(&store, 0);
        let entry = KeyEntry::new(10023, "k");
        let chars = KeyCharacteristics::default();
        assert!(store.get_characteristics_cache(&entry).unwrap().is_none());
        store.put_characteristics_cache(&entry, &chars, true).unwrap();
        let (cached, legacy) = store.get_characteristics_cache(&entry).unwrap().unwrap();
        assert_eq!(cached, chars);
        assert!(!legacy);
    }

    #[test]
    fn test_flat_layout_migration() {
        let dir = tempfile::tempdir().unwrap();
        let blob = generic(b"old", BlobFlags::empty());
        let entry = KeyEntry::new(10023, "legacy");
        fs::write(dir.path().join(entry.file_name()), blob.encode(None).unwrap()).unwrap();

        let store = KeyStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&entry).unwrap().value(), b"old");
        assert!(dir.path().join("user_0").join(entry.file_name()).exists());
        assert!(!dir.path().join(entry.file_name()).exists());
    }

    #[test]
    fn test_uids_of_auth_bound_keys() {
        use crate::types::KeyParameter;

        let (_dir, store) = open_store();
        unlocked(&store, 0);
        let bound = KeyEntry::new(10023, "fp-key");
        store.put(&bound, &generic(b"x", BlobFlags::empty())).unwrap();
        let mut chars = KeyCharacteristics::default();
        chars
            .hardware_enforced
            .push(KeyParameter::new_ulong(Tag::UserSecureId, 42));
        store.put_characteristics_cache(&bound, &chars, false).unwrap();

        let open = KeyEntry::new(10100, "open-key");
        store.put(&open, &generic(b"y", BlobFlags::empty())).unwrap();
        store
            .put_characteristics_cache(&open, &KeyCharacteristics::default(), false)
            .unwrap();

        assert_eq!(store.uids_of_auth_bound_keys(0).unwrap(), vec![10023]);
        assert!(store.uids_of_auth_bound_keys(7).unwrap().is_empty());
    }

    #[test]
    fn test_reset_user_wipes_everything() {
        let (_dir, store) = open_store();
        unlocked(&store, 0);
        let entry = KeyEntry::new(10023, "k");
        store.put(&entry, &generic(b"data", BlobFlags::ENCRYPTED)).unwrap();
        store.reset_user(0).unwrap();
        assert_eq!(store.state(0).unwrap(), LockState::Uninitialized);
        assert!(!store.exists(&entry));
    }
}
