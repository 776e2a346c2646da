// Copyright (C) Microsoft Corporation. All rights reserved.

//! The client-facing key management service.
//!
//! Every call resolves the caller's identity (self or an explicitly
//! named target uid behind the impersonation check), verifies the
//! pre-granted permission for the operation, locks the relevant entry,
//! and routes the work to the device worker that owns the key: the
//! trusted environment by default, the strongbox when the blob carries
//! the strongbox flag, and the software fallback for fallback-flagged
//! blobs.

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::blob::Blob;
use crate::blob::BlobType;
use crate::crypto;
use crate::device::SecureDevice;
use crate::device::SoftwareDevice;
use crate::device::UpdateResult;
use crate::entry::KeyEntry;
use crate::error::DeviceError;
use crate::error::Error;
use crate::error::Result;
use crate::store::KeyStore;
use crate::store::AID_SYSTEM;
use crate::types::Algorithm;
use crate::types::AuthorizationSet;
use crate::types::BlobFlags;
use crate::types::HardwareAuthToken;
use crate::types::KeyCharacteristics;
use crate::types::KeyFormat;
use crate::types::KeyParameter;
use crate::types::KeyPurpose;
use crate::types::RequestFlags;
use crate::types::SecurityLevel;
use crate::types::Tag;
use crate::user::LockState;
use crate::worker::BeginOperation;
use crate::worker::DeviceWorker;

/// Sentinel target uid meaning "the caller itself".
pub const UID_SELF: i32 = -1;

/// Upper bound on an attestation application id descriptor.
const MAX_ATTESTATION_APP_ID: usize = 1024;

/// File whose age gates the reset-since-rotation attestation claim.
const ID_ROTATION_FILE: &str = "timestamp";

/// How long a factory reset remains visible to id attestation.
const ID_ROTATION_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Operations a caller must hold a pre-granted permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Read the store state of a user.
    GetState,
    /// Read an entry.
    Get,
    /// Write an entry or create a key.
    Insert,
    /// Delete an entry or clear a uid.
    Delete,
    /// Probe for an entry's existence.
    Exist,
    /// Enumerate aliases.
    List,
    /// Wipe a user's store.
    Reset,
    /// React to password changes.
    Password,
    /// Drop a user's master key from memory.
    Lock,
    /// Unseal a user's master key.
    Unlock,
    /// Grant or revoke access to a key.
    Grant,
    /// Run cryptographic operations with a key.
    Use,
    /// Push hardware auth tokens.
    AddAuth,
    /// Attest device identifiers.
    AttestIds,
}

/// External permission decisions, pre-computed by the platform.
pub trait PermissionCheck: Send + Sync {
    /// Whether `uid` holds `permission`.
    fn has_permission(&self, uid: u32, permission: Permission) -> bool;

    /// Whether `caller` may act on behalf of `target`.
    fn can_act_for(&self, caller: u32, target: u32) -> bool;
}

/// Grants everything. Test and single-tenant configurations.
#[derive(Debug, Default)]
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn has_permission(&self, _uid: u32, _permission: Permission) -> bool {
        true
    }

    fn can_act_for(&self, _caller: u32, _target: u32) -> bool {
        true
    }
}

/// External provider of the caller's package identity descriptor.
pub trait AttestationIdProvider: Send + Sync {
    /// DER descriptor of the packages running as `uid`, or `None` when
    /// the provider cannot answer.
    fn attestation_application_id(&self, uid: u32) -> Option<Vec<u8>>;
}

/// Always-unavailable provider; attestation falls back to the literal
/// placeholder descriptor.
#[derive(Debug, Default)]
pub struct NoAttestationIds;

impl AttestationIdProvider for NoAttestationIds {
    fn attestation_application_id(&self, _uid: u32) -> Option<Vec<u8>> {
        None
    }
}

/// The service.
pub struct KeystoreService {
    store: Arc<KeyStore>,
    tee: Arc<DeviceWorker>,
    strongbox: Option<Arc<DeviceWorker>>,
    fallback: Arc<DeviceWorker>,
    permissions: Box<dyn PermissionCheck>,
    attestation_ids: Box<dyn AttestationIdProvider>,
}

impl std::fmt::Debug for KeystoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreService").finish()
    }
}

impl KeystoreService {
    /// Builds the service: spawns the software fallback worker, the
    /// trusted-environment worker wired to it, and optionally a
    /// strongbox worker.
    pub fn new(
        store: Arc<KeyStore>,
        tee_device: Box<dyn SecureDevice>,
        strongbox_device: Option<Box<dyn SecureDevice>>,
        permissions: Box<dyn PermissionCheck>,
        attestation_ids: Box<dyn AttestationIdProvider>,
    ) -> Result<Self> {
        let soft = Box::new(SoftwareDevice::new(SecurityLevel::Software)?);
        let fallback = DeviceWorker::spawn("fallback", soft, Arc::clone(&store), None)?;
        let tee = DeviceWorker::spawn(
            "tee",
            tee_device,
            Arc::clone(&store),
            Some(Arc::clone(&fallback)),
        )?;
        let strongbox = match strongbox_device {
            Some(device) => {
                Some(DeviceWorker::spawn("strongbox", device, Arc::clone(&store), None)?)
            }
            None => None,
        };
        Ok(Self { store, tee, strongbox, fallback, permissions, attestation_ids })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    fn check(&self, uid: u32, permission: Permission) -> Result<()> {
        if self.permissions.has_permission(uid, permission) {
            Ok(())
        } else {
            warn!(uid, ?permission, "permission denied");
            Err(Error::PermissionDenied)
        }
    }

    fn effective_uid(&self, caller_uid: u32, target_uid: i32) -> Result<u32> {
        if target_uid == UID_SELF || target_uid as u32 == caller_uid {
            return Ok(caller_uid);
        }
        if target_uid >= 0 && self.permissions.can_act_for(caller_uid, target_uid as u32) {
            return Ok(target_uid as u32);
        }
        Err(Error::PermissionDenied)
    }

    /// Only the system identity may mark keys critical to device
    /// encryption; those survive `clear_uid`.
    fn check_creation_flags(&self, caller_uid: u32, flags: RequestFlags) -> Result<()> {
        if flags.contains(RequestFlags::CRITICAL_TO_DEVICE_ENCRYPTION)
            && caller_uid != AID_SYSTEM
        {
            warn!(caller_uid, "non-system caller requested a device-encryption-critical key");
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    fn worker_for_flags(&self, flags: BlobFlags) -> Result<&Arc<DeviceWorker>> {
        if flags.contains(BlobFlags::STRONGBOX) {
            return self
                .strongbox
                .as_ref()
                .ok_or(Error::from(DeviceError::HardwareTypeUnavailable));
        }
        if flags.contains(BlobFlags::FALLBACK) {
            return Ok(&self.fallback);
        }
        Ok(&self.tee)
    }

    fn worker_for_request(&self, flags: RequestFlags) -> Result<&Arc<DeviceWorker>> {
        match flags.security_level() {
            SecurityLevel::Strongbox => self
                .strongbox
                .as_ref()
                .ok_or(Error::from(DeviceError::HardwareTypeUnavailable)),
            SecurityLevel::Software => Ok(&self.fallback),
            SecurityLevel::TrustedEnvironment => Ok(&self.tee),
        }
    }

    fn worker_for_entry(&self, entry: &KeyEntry) -> Result<&Arc<DeviceWorker>> {
        self.worker_for_flags(self.store.peek(entry)?.flags)
    }

    fn worker_for_token(&self, token: u64) -> Result<&Arc<DeviceWorker>> {
        for worker in self.workers() {
            if worker.owns_token(token) {
                return Ok(worker);
            }
        }
        Err(DeviceError::InvalidOperationHandle.into())
    }

    fn workers(&self) -> impl Iterator<Item = &Arc<DeviceWorker>> {
        [Some(&self.tee), self.strongbox.as_ref(), Some(&self.fallback)]
            .into_iter()
            .flatten()
    }

    fn wait<T>(rx: std::sync::mpsc::Receiver<Result<T>>) -> Result<T> {
        rx.recv().map_err(|_| Error::SystemError)?
    }

    // ---- store state ----------------------------------------------------

    /// Lock state of a user's store.
    pub fn state(&self, caller_uid: u32, user_id: u32) -> Result<LockState> {
        self.check(caller_uid, Permission::GetState)?;
        self.store.state(user_id)
    }

    /// Wipes a user's store.
    pub fn reset(&self, caller_uid: u32, user_id: u32) -> Result<()> {
        self.check(caller_uid, Permission::Reset)?;
        self.store.reset_user(user_id)
    }

    /// Reacts to a user's password change.
    pub fn password_changed(&self, caller_uid: u32, user_id: u32, password: &str) -> Result<()> {
        self.check(caller_uid, Permission::Password)?;
        self.store.password_changed(user_id, password)
    }

    /// Drops a user's master key from memory.
    pub fn lock(&self, caller_uid: u32, user_id: u32) -> Result<()> {
        self.check(caller_uid, Permission::Lock)?;
        self.store.lock_user(user_id)
    }

    /// Unseals a user's master key, initializing a fresh store on first
    /// use.
    pub fn unlock(&self, caller_uid: u32, user_id: u32, password: &str) -> Result<()> {
        self.check(caller_uid, Permission::Unlock)?;
        self.store.unlock_user(user_id, password)
    }

    /// Whether a uid has no entries.
    pub fn is_empty(&self, caller_uid: u32, target_uid: i32) -> Result<bool> {
        self.check(caller_uid, Permission::Exist)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        self.store.is_empty(uid)
    }

    /// Uids of a user owning keys bound to an authenticator. The
    /// platform consults this before discarding the user's credential.
    pub fn list_uids_of_auth_bound_keys(
        &self,
        caller_uid: u32,
        user_id: u32,
    ) -> Result<Vec<u32>> {
        self.check(caller_uid, Permission::List)?;
        self.store.uids_of_auth_bound_keys(user_id)
    }

    /// Reacts to a new user. A profile inherits its parent's sealed
    /// master key so both unlock with the parent's password.
    pub fn on_user_added(
        &self,
        caller_uid: u32,
        user_id: u32,
        parent_id: Option<u32>,
    ) -> Result<()> {
        self.check(caller_uid, Permission::Password)?;
        match parent_id {
            Some(parent) => self.store.copy_master_key(parent, user_id),
            None => Ok(()),
        }
    }

    /// Reacts to a removed user by destroying their store.
    pub fn on_user_removed(&self, caller_uid: u32, user_id: u32) -> Result<()> {
        self.check(caller_uid, Permission::Reset)?;
        self.store.reset_user(user_id)
    }

    // ---- generic entries ------------------------------------------------

    /// Stores opaque data under an alias.
    #[instrument(skip(self, data))]
    pub fn insert(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        data: Vec<u8>,
        flags: RequestFlags,
    ) -> Result<()> {
        self.check(caller_uid, Permission::Insert)?;
        self.check_creation_flags(caller_uid, flags)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = KeyEntry::new(uid, alias);
        let _lock = self.store.lock_entry(entry.clone());
        if self.store.exists(&entry) {
            return Err(Error::KeyAlreadyExists);
        }
        let blob_flags = if flags.contains(RequestFlags::ENCRYPTED) {
            BlobFlags::ENCRYPTED
        } else {
            BlobFlags::empty()
        };
        self.store.put(&entry, &Blob::new(BlobType::Generic, blob_flags, data, vec![]))
    }

    /// Reads opaque data stored under an alias, following grants.
    pub fn get(&self, caller_uid: u32, target_uid: i32, alias: &str) -> Result<Vec<u8>> {
        self.check(caller_uid, Permission::Get)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = self.store.get_key_for_name(uid, alias)?;
        let _lock = self.store.lock_entry(entry.clone());
        let blob = self.store.get(&entry)?;
        if blob.blob_type() != BlobType::Generic {
            return Err(Error::KeyNotFound);
        }
        Ok(blob.value().to_vec())
    }

    /// Deletes an entry locally and asks the owning device to forget
    /// the key. Device-side failure is logged, never surfaced: the
    /// local state is already consistent.
    #[instrument(skip(self))]
    pub fn del(&self, caller_uid: u32, target_uid: i32, alias: &str) -> Result<()> {
        self.check(caller_uid, Permission::Delete)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = self.store.get_key_for_name(uid, alias)?;
        let worker = self.worker_for_entry(&entry).ok().cloned();
        let _lock = self.store.lock_entry(entry.clone());
        let device_blob = self.store.del(&entry)?;
        if let (Some(worker), Some(device_blob)) = (worker, device_blob) {
            if let Err(err) = Self::wait(worker.delete_device_key(device_blob)) {
                warn!(?err, alias, "device-side key deletion failed");
            }
        }
        Ok(())
    }

    /// Whether an alias exists for the target uid.
    pub fn exist(&self, caller_uid: u32, target_uid: i32, alias: &str) -> Result<bool> {
        self.check(caller_uid, Permission::Exist)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        Ok(self.store.get_key_for_name(uid, alias).is_ok())
    }

    /// Aliases of the target uid's entries with the given prefix.
    pub fn list(
        &self,
        caller_uid: u32,
        target_uid: i32,
        prefix: &str,
    ) -> Result<Vec<String>> {
        self.check(caller_uid, Permission::List)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        self.store.list(uid, prefix)
    }

    /// Deletes every entry of a uid, sparing system keys flagged
    /// critical to device encryption.
    pub fn clear_uid(&self, caller_uid: u32, target_uid: i32) -> Result<()> {
        self.check(caller_uid, Permission::Delete)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        for device_blob in self.store.clear_uid(uid)? {
            if let Err(err) = Self::wait(self.tee.delete_device_key(device_blob)) {
                warn!(?err, uid, "device-side key deletion failed during clear");
            }
        }
        Ok(())
    }

    // ---- grants ---------------------------------------------------------

    /// Grants `grantee_uid` use of the caller's key, returning the alias
    /// the grantee must use.
    pub fn grant(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        grantee_uid: u32,
    ) -> Result<String> {
        self.check(caller_uid, Permission::Grant)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = KeyEntry::new(uid, alias);
        if !self.store.exists(&entry) {
            return Err(Error::KeyNotFound);
        }
        Ok(self.store.grants().put(grantee_uid, uid, alias))
    }

    /// Revokes a grant.
    pub fn ungrant(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        grantee_uid: u32,
    ) -> Result<()> {
        self.check(caller_uid, Permission::Grant)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        if self.store.grants().remove(grantee_uid, uid, alias) {
            Ok(())
        } else {
            Err(Error::KeyNotFound)
        }
    }

    // ---- keys and operations --------------------------------------------

    /// Mixes caller entropy into the trusted environment's RNG.
    pub fn add_rng_entropy(&self, caller_uid: u32, data: Vec<u8>) -> Result<()> {
        self.check(caller_uid, Permission::Insert)?;
        Self::wait(self.tee.add_rng_entropy(data))
    }

    /// Generates a key on the device the request flags select.
    #[instrument(skip(self, params, entropy))]
    pub fn generate_key(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        params: AuthorizationSet,
        entropy: Vec<u8>,
        flags: RequestFlags,
    ) -> Result<KeyCharacteristics> {
        self.check(caller_uid, Permission::Insert)?;
        self.check_creation_flags(caller_uid, flags)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let worker = self.worker_for_request(flags)?;
        let lock = self.store.lock_entry(KeyEntry::new(uid, alias));
        if self.store.exists(&lock) {
            return Err(Error::KeyAlreadyExists);
        }
        Self::wait(worker.generate_key(lock, params, entropy, flags))
    }

    /// Imports clear key material.
    pub fn import_key(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        params: AuthorizationSet,
        format: KeyFormat,
        key_data: Vec<u8>,
        flags: RequestFlags,
    ) -> Result<KeyCharacteristics> {
        self.check(caller_uid, Permission::Insert)?;
        self.check_creation_flags(caller_uid, flags)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let worker = self.worker_for_request(flags)?;
        let lock = self.store.lock_entry(KeyEntry::new(uid, alias));
        if self.store.exists(&lock) {
            return Err(Error::KeyAlreadyExists);
        }
        Self::wait(worker.import_key(lock, params, format, key_data, flags))
    }

    /// Imports key material wrapped under another of the caller's keys.
    /// The wrapping key decides which device serves the import.
    pub fn import_wrapped_key(
        &self,
        caller_uid: u32,
        alias: &str,
        wrapping_alias: &str,
        wrapped_data: Vec<u8>,
        masking_key: Vec<u8>,
        flags: RequestFlags,
    ) -> Result<KeyCharacteristics> {
        self.check(caller_uid, Permission::Insert)?;
        self.check_creation_flags(caller_uid, flags)?;
        // The target must be a distinct entry; locking the wrapping key
        // twice would never return.
        if alias == wrapping_alias {
            return Err(DeviceError::InvalidArgument.into());
        }
        let wrapping_entry = self.store.get_key_for_name(caller_uid, wrapping_alias)?;
        let worker = self.worker_for_entry(&wrapping_entry)?;
        // Target first, wrapping key second; every caller takes the two
        // locks in this order.
        let lock = self.store.lock_entry(KeyEntry::new(caller_uid, alias));
        if self.store.exists(&lock) {
            return Err(Error::KeyAlreadyExists);
        }
        let wrapping_lock = self.store.lock_entry(wrapping_entry);
        Self::wait(worker.import_wrapped_key(
            lock,
            wrapping_lock,
            wrapped_data,
            masking_key,
            flags,
        ))
    }

    /// Exports a key's public material.
    pub fn export_key(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        format: KeyFormat,
        client_id: Vec<u8>,
        app_data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.check(caller_uid, Permission::Get)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = self.store.get_key_for_name(uid, alias)?;
        let worker = self.worker_for_entry(&entry)?;
        let lock = self.store.lock_entry(entry);
        Self::wait(worker.export_key(lock, format, client_id, app_data))
    }

    /// The enforced tags of a key.
    pub fn get_key_characteristics(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        client_id: Vec<u8>,
        app_data: Vec<u8>,
    ) -> Result<KeyCharacteristics> {
        self.check(caller_uid, Permission::Get)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = self.store.get_key_for_name(uid, alias)?;
        let worker = self.worker_for_entry(&entry)?;
        let lock = self.store.lock_entry(entry);
        Self::wait(worker.get_key_characteristics(lock, client_id, app_data))
    }

    /// Starts an operation on a key.
    #[instrument(skip(self, params, entropy))]
    pub fn begin(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        purpose: KeyPurpose,
        params: AuthorizationSet,
        entropy: Vec<u8>,
    ) -> Result<BeginOperation> {
        self.check(caller_uid, Permission::Use)?;
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = self.store.get_key_for_name(uid, alias)?;
        let worker = self.worker_for_entry(&entry)?;
        let lock = self.store.lock_entry(entry);
        Self::wait(worker.begin(lock, uid, purpose, params, entropy))
    }

    /// Feeds data to an operation.
    pub fn update(&self, caller_uid: u32, token: u64, input: Vec<u8>) -> Result<UpdateResult> {
        self.check(caller_uid, Permission::Use)?;
        let worker = self.worker_for_token(token)?;
        Self::wait(worker.update(token, input))
    }

    /// Completes an operation.
    pub fn finish(
        &self,
        caller_uid: u32,
        token: u64,
        input: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.check(caller_uid, Permission::Use)?;
        let worker = self.worker_for_token(token)?;
        Self::wait(worker.finish(token, input, signature))
    }

    /// Aborts an operation.
    pub fn abort(&self, caller_uid: u32, token: u64) -> Result<()> {
        self.check(caller_uid, Permission::Use)?;
        let worker = self.worker_for_token(token)?;
        Self::wait(worker.abort(token))
    }

    // ---- authentication and attestation ----------------------------------

    /// Accepts a hardware auth token from an authenticator.
    pub fn add_auth_token(&self, caller_uid: u32, token: HardwareAuthToken) -> Result<()> {
        self.check(caller_uid, Permission::AddAuth)?;
        self.store.tokens().add(token);
        Ok(())
    }

    /// Records that the device left the user's body.
    pub fn on_device_off_body(&self, caller_uid: u32) -> Result<()> {
        self.check(caller_uid, Permission::AddAuth)?;
        self.store.tokens().on_device_off_body();
        Ok(())
    }

    /// Feeds keyguard visibility into the per-user device-lock flags.
    pub fn on_keyguard_visibility_changed(
        &self,
        caller_uid: u32,
        user_id: u32,
        keyguard_showing: bool,
    ) -> Result<()> {
        self.check(caller_uid, Permission::Lock)?;
        self.store.enforcement().set_device_locked(user_id, keyguard_showing);
        Ok(())
    }

    /// Attests a key. Device identifier tags are rejected on this path;
    /// they are only reachable through
    /// [`attest_device_ids`](Self::attest_device_ids).
    pub fn attest_key(
        &self,
        caller_uid: u32,
        target_uid: i32,
        alias: &str,
        params: AuthorizationSet,
    ) -> Result<Vec<Vec<u8>>> {
        self.check(caller_uid, Permission::Use)?;
        if params.iter().any(|p| p.tag.is_device_id_attestation()) {
            return Err(DeviceError::CannotAttestIds.into());
        }
        let uid = self.effective_uid(caller_uid, target_uid)?;
        let entry = self.store.get_key_for_name(uid, alias)?;
        let worker = self.worker_for_entry(&entry)?;
        let params = self.complete_attest_params(caller_uid, params)?;
        let lock = self.store.lock_entry(entry);
        Self::wait(worker.attest_key(lock, params))
    }

    /// Attests device identifiers with an ephemeral key: generate,
    /// attest, destroy.
    #[instrument(skip(self, params))]
    pub fn attest_device_ids(
        &self,
        caller_uid: u32,
        params: AuthorizationSet,
    ) -> Result<Vec<Vec<u8>>> {
        self.check(caller_uid, Permission::AttestIds)?;
        let params = self.complete_attest_params(caller_uid, params)?;

        let alias = format!(".attest_{:016x}", crypto::random_u64()?);
        let entry = KeyEntry::new(caller_uid, &alias);
        let key_params = AuthorizationSet::from(vec![
            KeyParameter::algorithm(Algorithm::Ec),
            KeyParameter::purpose(KeyPurpose::Sign),
            KeyParameter::new_bool(Tag::NoAuthRequired),
        ]);
        {
            let lock = self.store.lock_entry(entry.clone());
            Self::wait(self.tee.generate_key(
                lock,
                key_params,
                Vec::new(),
                RequestFlags::empty(),
            ))?;
        }

        let lock = self.store.lock_entry(entry.clone());
        let chain = Self::wait(self.tee.attest_key(lock, params));

        let lock = self.store.lock_entry(entry.clone());
        match self.store.del(&entry) {
            Ok(Some(device_blob)) => {
                if let Err(err) = Self::wait(self.tee.delete_device_key(device_blob)) {
                    warn!(?err, "ephemeral attestation key not deleted on device");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(?err, "ephemeral attestation key not deleted"),
        }
        drop(lock);
        chain
    }

    /// Fills in the service-owned attestation parameters: the caller's
    /// package descriptor (placeholder when the provider cannot answer)
    /// and the reset-since-rotation claim. Callers may not supply either
    /// tag themselves.
    fn complete_attest_params(
        &self,
        caller_uid: u32,
        mut params: AuthorizationSet,
    ) -> Result<AuthorizationSet> {
        if params.iter().any(|p| {
            matches!(p.tag, Tag::AttestationApplicationId | Tag::ResetSinceIdRotation)
        }) {
            return Err(DeviceError::InvalidArgument.into());
        }
        let descriptor = match self.attestation_ids.attestation_application_id(caller_uid) {
            Some(descriptor) => descriptor,
            None => {
                info!(caller_uid, "package identity unavailable, using placeholder");
                b"unknown package".to_vec()
            }
        };
        if descriptor.len() > MAX_ATTESTATION_APP_ID {
            return Err(DeviceError::InvalidArgument.into());
        }
        params.push(KeyParameter::new_bytes(Tag::AttestationApplicationId, descriptor));

        if self.reset_since_id_rotation() {
            params.push(KeyParameter::new_bool(Tag::ResetSinceIdRotation));
        }
        Ok(params)
    }

    fn reset_since_id_rotation(&self) -> bool {
        let path = self.store.root().join(ID_ROTATION_FILE);
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age < ID_ROTATION_PERIOD)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
