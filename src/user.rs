// Copyright (C) Microsoft Corporation. All rights reserved.

//! Per-user master key lifecycle.
//!
//! Each user owns a directory `user_<id>` and, once a password exists, a
//! `.masterkey` file: the user's random master key sealed under a key
//! stretched from the password. The state machine is uninitialized (no
//! master key file), locked (file present, key not in memory), or
//! unlocked (key in memory). Four consecutive wrong passwords force a
//! reset that destroys the master key and every entry under it.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use zeroize::Zeroizing;

use crate::blob::Blob;
use crate::blob::BlobType;
use crate::crypto;
use crate::crypto::MasterKeyFlavor;
use crate::error::Error;
use crate::error::Result;
use crate::types::BlobFlags;

/// Uids per user; a uid's user id is `uid / AID_USER_OFFSET`.
pub const AID_USER_OFFSET: u32 = 100_000;

/// Master key file name inside a user directory.
const MASTER_KEY_FILE: &str = ".masterkey";

/// Wrong password attempts before a forced reset.
const MAX_RETRY: u8 = 4;

/// Master key length written by current versions.
const MASTER_KEY_LEN: usize = 32;

/// Salt length stored in the master key blob's info tail.
const SALT_LEN: usize = 16;

/// Lock state of one user's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No password has ever been set.
    Uninitialized,
    /// Master key file exists but the key is not in memory.
    Locked,
    /// Master key is in memory.
    Unlocked,
}

/// Mutable state for one user.
#[derive(Debug)]
pub struct UserState {
    user_id: u32,
    dir: PathBuf,
    state: LockState,
    master_key: Zeroizing<Vec<u8>>,
    retries_left: u8,
}

impl UserState {
    /// Opens (creating if needed) the state for `user_id` under `root`.
    pub fn open(root: &Path, user_id: u32) -> Result<Self> {
        let dir = root.join(format!("user_{user_id}"));
        fs::create_dir_all(&dir)?;
        let state = if dir.join(MASTER_KEY_FILE).exists() {
            LockState::Locked
        } else {
            LockState::Uninitialized
        };
        Ok(Self {
            user_id,
            dir,
            state,
            master_key: Zeroizing::new(Vec::new()),
            retries_left: MAX_RETRY,
        })
    }

    /// User id this state belongs to.
    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Directory holding this user's entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current lock state.
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Master key bytes while unlocked.
    pub fn master_key(&self) -> Option<&[u8]> {
        match self.state {
            LockState::Unlocked => Some(&self.master_key),
            _ => None,
        }
    }

    fn master_key_path(&self) -> PathBuf {
        self.dir.join(MASTER_KEY_FILE)
    }

    /// Generates a fresh master key and seals it under `password`.
    #[instrument(skip_all, fields(user_id = self.user_id))]
    pub fn initialize(&mut self, password: &str) -> Result<()> {
        let mut key = Zeroizing::new(vec![0u8; MASTER_KEY_LEN]);
        crypto::fill_random(&mut key)?;
        self.master_key = key;
        self.state = LockState::Unlocked;
        self.retries_left = MAX_RETRY;
        self.write_master_key(password)?;
        info!(user_id = self.user_id, "user store initialized");
        Ok(())
    }

    /// Seals the in-memory master key under `password` and persists it.
    pub fn write_master_key(&mut self, password: &str) -> Result<()> {
        if self.state != LockState::Unlocked {
            return Err(Error::Locked);
        }
        let mut salt = vec![0u8; SALT_LEN];
        crypto::fill_random(&mut salt)?;
        let password_key =
            crypto::derive_master_key(password.as_bytes(), &salt, MasterKeyFlavor::Aes256)?;
        let blob = Blob::new(
            BlobType::MasterKeyAes256,
            BlobFlags::ENCRYPTED,
            self.master_key.to_vec(),
            salt,
        );
        fs::write(self.master_key_path(), blob.encode(Some(&password_key))?)?;
        Ok(())
    }

    /// Unseals the master key file with `password`.
    ///
    /// A wrong password decrements the retry budget; exhausting it wipes
    /// the user's store. Unlocked states are refreshed in place so a
    /// correct password is never penalized.
    ///
    /// # Errors
    ///
    /// * [`Error::Uninitialized`] - no master key file.
    /// * [`Error::WrongPassword`] - bad password, carries the remaining
    ///   budget; `remaining == 0` means the store was just wiped.
    #[instrument(skip_all, fields(user_id = self.user_id))]
    pub fn read_master_key(&mut self, password: &str) -> Result<()> {
        let raw = match fs::read(self.master_key_path()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Uninitialized);
            }
            Err(err) => return Err(err.into()),
        };
        let peek = Blob::peek(&raw)?;
        let flavor = match peek.blob_type {
            BlobType::MasterKeyAes256 => MasterKeyFlavor::Aes256,
            BlobType::MasterKey => MasterKeyFlavor::LegacyAes128,
            _ => return Err(Error::ValueCorrupted),
        };
        let password_key =
            crypto::derive_master_key(password.as_bytes(), &peek.info, flavor)?;

        match Blob::decode(&raw, Some(&password_key)) {
            Ok(blob) => {
                self.master_key = Zeroizing::new(blob.value().to_vec());
                self.state = LockState::Unlocked;
                self.retries_left = MAX_RETRY;
                if blob.needs_rewrite() {
                    self.write_master_key(password)?;
                }
                Ok(())
            }
            Err(Error::ValueCorrupted) | Err(Error::KeyPermanentlyInvalidated) => {
                self.retries_left = self.retries_left.saturating_sub(1);
                if self.retries_left == 0 {
                    warn!(user_id = self.user_id, "retry budget exhausted, wiping store");
                    self.reset()?;
                    return Err(Error::WrongPassword { remaining: 0 });
                }
                Err(Error::WrongPassword { remaining: self.retries_left })
            }
            Err(err) => Err(err),
        }
    }

    /// Reacts to a user password change.
    ///
    /// An empty password tears the crypto down: the master key and every
    /// encrypted entry are deleted, unencrypted entries survive. A
    /// non-empty password re-seals the current master key while unlocked,
    /// or bootstraps a fresh one when uninitialized.
    pub fn password_changed(&mut self, password: &str) -> Result<()> {
        if password.is_empty() {
            info!(user_id = self.user_id, "password cleared, dropping encrypted entries");
            self.delete_encrypted_entries()?;
            let path = self.master_key_path();
            if path.exists() {
                fs::remove_file(path)?;
            }
            self.master_key = Zeroizing::new(Vec::new());
            self.state = LockState::Uninitialized;
            self.retries_left = MAX_RETRY;
            return Ok(());
        }
        match self.state {
            LockState::Unlocked => self.write_master_key(password),
            LockState::Uninitialized => self.initialize(password),
            LockState::Locked => Err(Error::Locked),
        }
    }

    /// Forgets the in-memory master key.
    pub fn lock(&mut self) {
        if self.state == LockState::Unlocked {
            self.master_key = Zeroizing::new(Vec::new());
            self.state = LockState::Locked;
        }
    }

    /// Deletes every file of this user and returns to uninitialized.
    pub fn reset(&mut self) -> Result<()> {
        for file in self.entry_files()? {
            fs::remove_file(&file)?;
        }
        let path = self.master_key_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        self.master_key = Zeroizing::new(Vec::new());
        self.state = LockState::Uninitialized;
        self.retries_left = MAX_RETRY;
        Ok(())
    }

    /// Copies this user's sealed master key file verbatim for `child`,
    /// which shares the password.
    pub fn copy_master_key_to(&self, child: &mut UserState) -> Result<()> {
        if self.state == LockState::Uninitialized {
            return Ok(());
        }
        fs::copy(self.master_key_path(), child.master_key_path())?;
        child.state = LockState::Locked;
        Ok(())
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if dirent.file_name() == MASTER_KEY_FILE {
                continue;
            }
            if dirent.file_type()?.is_file() {
                files.push(dirent.path());
            }
        }
        Ok(files)
    }

    fn delete_encrypted_entries(&self) -> Result<()> {
        for file in self.entry_files()? {
            let raw = fs::read(&file)?;
            let encrypted = match Blob::peek(&raw) {
                Ok(peek) => {
                    peek.flags
                        .intersects(BlobFlags::ENCRYPTED | BlobFlags::SUPER_ENCRYPTED)
                        || peek.version < 2
                }
                // Unreadable files go too.
                Err(_) => true,
            };
            if encrypted {
                fs::remove_file(&file)?;
            }
        }
        Ok(())
    }
}

/// Lazily-populated map from user id to state.
#[derive(Debug)]
pub struct UserStateDb {
    root: PathBuf,
    users: Mutex<std::collections::HashMap<u32, Arc<Mutex<UserState>>>>,
}

impl UserStateDb {
    /// Creates the database rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), users: Mutex::new(Default::default()) }
    }

    /// State for `user_id`, created on first touch.
    pub fn get(&self, user_id: u32) -> Result<Arc<Mutex<UserState>>> {
        let mut users = self.users.lock();
        if let Some(state) = users.get(&user_id) {
            return Ok(Arc::clone(state));
        }
        let state = Arc::new(Mutex::new(UserState::open(&self.root, user_id)?));
        users.insert(user_id, Arc::clone(&state));
        Ok(state)
    }

    /// State for the user owning `uid`.
    pub fn get_for_uid(&self, uid: u32) -> Result<Arc<Mutex<UserState>>> {
        self.get(uid / AID_USER_OFFSET)
    }
}
