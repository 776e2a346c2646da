// Copyright (C) Microsoft Corporation. All rights reserved.

//! One worker thread per secure device.
//!
//! Every call that touches a device's state is a boxed task on that
//! device's queue; tasks run strictly in submission order on the
//! worker's thread, and submission never blocks. Each entry point hands
//! back a single-shot channel carrying exactly one result.
//!
//! The worker composes the policy around raw device calls: the
//! characteristics cache, entropy injection, enforcement, operation
//! registration and pruning, the transparent single retry when a device
//! reports a key needs re-wrapping, and delegation of failed
//! generate/import calls to the software fallback.

use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::blob::Blob;
use crate::blob::BlobType;
use crate::device::SecureDevice;
use crate::device::UpdateResult;
use crate::enforcement::Enforcement;
use crate::entry::KeyEntry;
use crate::entry::LockedEntry;
use crate::error::DeviceError;
use crate::error::Error;
use crate::error::Result;
use crate::operation::Operation;
use crate::operation::OperationRegistry;
use crate::store::KeyStore;
use crate::types::Algorithm;
use crate::types::AuthorizationSet;
use crate::types::BlobFlags;
use crate::types::HardwareAuthToken;
use crate::types::KeyCharacteristics;
use crate::types::KeyFormat;
use crate::types::KeyPurpose;
use crate::types::RequestFlags;
use crate::types::SecurityLevel;
use crate::types::Tag;

/// Caller entropy accepted per request.
const MAX_ENTROPY_LEN: usize = 2048;

type Task = Box<dyn FnOnce(&WorkerState) + Send>;

/// What a successful `begin` hands back to the client.
#[derive(Debug, Clone)]
pub struct BeginOperation {
    /// Opaque token for update/finish/abort.
    pub token: u64,
    /// Device challenge. Per-operation auth tokens must be minted
    /// against it.
    pub challenge: u64,
    /// Device-chosen parameters, e.g. a generated nonce.
    pub out_params: AuthorizationSet,
    /// The key wants per-operation authentication; the client must
    /// deliver a token minted against this operation before finishing.
    pub op_auth_needed: bool,
}

struct WorkerState {
    device: Box<dyn SecureDevice>,
    store: Arc<KeyStore>,
    registry: Arc<OperationRegistry>,
    fallback: Option<Arc<DeviceWorker>>,
    security_level: SecurityLevel,
}

/// Handle to one device's worker thread.
pub struct DeviceWorker {
    sender: Option<mpsc::Sender<Task>>,
    registry: Arc<OperationRegistry>,
    security_level: SecurityLevel,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeviceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWorker")
            .field("security_level", &self.security_level)
            .finish()
    }
}

impl DeviceWorker {
    /// Spawns the worker thread for `device`.
    ///
    /// `fallback`, where given, must be the software device's worker; it
    /// picks up generate/import requests this device fails.
    pub fn spawn(
        name: &str,
        device: Box<dyn SecureDevice>,
        store: Arc<KeyStore>,
        fallback: Option<Arc<DeviceWorker>>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(OperationRegistry::new());
        let security_level = device.security_level();
        let state = WorkerState {
            device,
            store,
            registry: Arc::clone(&registry),
            fallback,
            security_level,
        };
        let (sender, receiver) = mpsc::channel::<Task>();
        let thread = std::thread::Builder::new()
            .name(format!("keystore-{name}"))
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task(&state);
                }
                debug!("device worker draining out");
            })?;
        Ok(Arc::new(Self {
            sender: Some(sender),
            registry,
            security_level,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Trust level of the device behind this worker.
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// Whether this worker owns the operation behind `token`.
    pub fn owns_token(&self, token: u64) -> bool {
        self.registry.contains(token)
    }

    fn submit<T, F>(&self, f: F) -> Receiver<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&WorkerState) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let task: Task = Box::new(move |state| {
            let _ = tx.send(f(state));
        });
        if let Some(sender) = &self.sender {
            // A send failure leaves the receiver empty; the caller sees
            // a disconnected channel.
            let _ = sender.send(task);
        }
        rx
    }

    /// Generates a key and persists its blob and characteristics cache.
    pub fn generate_key(
        &self,
        entry: LockedEntry,
        params: AuthorizationSet,
        entropy: Vec<u8>,
        flags: RequestFlags,
    ) -> Receiver<Result<KeyCharacteristics>> {
        self.submit(move |state| {
            add_entropy(state, &entropy)?;
            match state.device.generate_key(&params) {
                Ok((key_blob, chars)) => {
                    store_new_key(state, &entry, flags, key_blob, &chars)?;
                    Ok(chars)
                }
                Err(err) if delegates_to_fallback(state, &params, flags, err) => {
                    warn!(?err, alias = entry.alias(), "delegating generate to fallback");
                    let fallback = state.fallback.as_ref().ok_or(Error::SystemError)?;
                    fallback
                        .generate_key(entry, params, Vec::new(), flags)
                        .recv()
                        .map_err(|_| Error::SystemError)?
                }
                Err(err) => Err(err),
            }
        })
    }

    /// Imports clear key material.
    pub fn import_key(
        &self,
        entry: LockedEntry,
        params: AuthorizationSet,
        format: KeyFormat,
        key_data: Vec<u8>,
        flags: RequestFlags,
    ) -> Receiver<Result<KeyCharacteristics>> {
        self.submit(move |state| {
            match state.device.import_key(&params, format, &key_data) {
                Ok((key_blob, chars)) => {
                    store_new_key(state, &entry, flags, key_blob, &chars)?;
                    Ok(chars)
                }
                Err(err) if delegates_to_fallback(state, &params, flags, err) => {
                    warn!(?err, alias = entry.alias(), "delegating import to fallback");
                    let fallback = state.fallback.as_ref().ok_or(Error::SystemError)?;
                    fallback
                        .import_key(entry, params, format, key_data, flags)
                        .recv()
                        .map_err(|_| Error::SystemError)?
                }
                Err(err) => Err(err),
            }
        })
    }

    /// Imports key material wrapped under one of this device's keys.
    pub fn import_wrapped_key(
        &self,
        entry: LockedEntry,
        wrapping_entry: LockedEntry,
        wrapped_data: Vec<u8>,
        masking_key: Vec<u8>,
        flags: RequestFlags,
    ) -> Receiver<Result<KeyCharacteristics>> {
        self.submit(move |state| {
            let mut wrapping_blob = read_device_key(state, &wrapping_entry)?;
            let (key_blob, chars) = with_upgrade(
                state,
                &wrapping_entry,
                &mut wrapping_blob,
                &AuthorizationSet::new(),
                |device, wrapping_key| {
                    device.import_wrapped_key(&wrapped_data, wrapping_key, &masking_key)
                },
            )?;
            store_new_key(state, &entry, flags, key_blob, &chars)?;
            Ok(chars)
        })
    }

    /// Exports a key's public material.
    pub fn export_key(
        &self,
        entry: LockedEntry,
        format: KeyFormat,
        client_id: Vec<u8>,
        app_data: Vec<u8>,
    ) -> Receiver<Result<Vec<u8>>> {
        self.submit(move |state| {
            let mut blob = read_device_key(state, &entry)?;
            with_upgrade(state, &entry, &mut blob, &AuthorizationSet::new(), |device, key| {
                device.export_key(key, format, &client_id, &app_data)
            })
        })
    }

    /// The enforced tags of a key, served from the cache when it is
    /// current.
    pub fn get_key_characteristics(
        &self,
        entry: LockedEntry,
        client_id: Vec<u8>,
        app_data: Vec<u8>,
    ) -> Receiver<Result<KeyCharacteristics>> {
        self.submit(move |state| {
            let mut blob = read_device_key(state, &entry)?;
            ensure_characteristics(state, &entry, &mut blob, &client_id, &app_data)
        })
    }

    /// Starts an operation. See the module docs for the composition.
    pub fn begin(
        &self,
        entry: LockedEntry,
        uid: u32,
        purpose: KeyPurpose,
        params: AuthorizationSet,
        entropy: Vec<u8>,
    ) -> Receiver<Result<BeginOperation>> {
        self.submit(move |state| begin_task(state, entry, uid, purpose, params, entropy))
    }

    /// Feeds data to an operation.
    pub fn update(&self, token: u64, input: Vec<u8>) -> Receiver<Result<UpdateResult>> {
        self.submit(move |state| {
            let op = state
                .registry
                .get(token)
                .ok_or(Error::from(DeviceError::InvalidOperationHandle))?;
            state.registry.set_pruneable(token, false);
            let result = reauthorize(state, &op)
                .and_then(|()| state.device.update(op.handle, &input));
            match result {
                Ok(out) => {
                    state.registry.set_pruneable(token, true);
                    Ok(out)
                }
                Err(err) => {
                    abort_evict(state, token, &op);
                    Err(err)
                }
            }
        })
    }

    /// Completes an operation. The operation is gone afterwards whether
    /// or not the device succeeded.
    pub fn finish(
        &self,
        token: u64,
        input: Vec<u8>,
        signature: Vec<u8>,
    ) -> Receiver<Result<Vec<u8>>> {
        self.submit(move |state| {
            let op = state
                .registry
                .get(token)
                .ok_or(Error::from(DeviceError::InvalidOperationHandle))?;
            state.registry.set_pruneable(token, false);
            if let Err(err) = reauthorize(state, &op) {
                abort_evict(state, token, &op);
                return Err(err);
            }
            let result = state.device.finish(op.handle, &input, &signature);
            state.registry.remove(token);
            if result.is_err() {
                let _ = state.device.abort(op.handle);
            }
            state.store.tokens().mark_completed(op.handle);
            result
        })
    }

    /// Tears an operation down. Unknown tokens report an invalid handle.
    pub fn abort(&self, token: u64) -> Receiver<Result<()>> {
        self.submit(move |state| {
            let op = state
                .registry
                .remove(token)
                .ok_or(Error::from(DeviceError::InvalidOperationHandle))?;
            if let Err(err) = state.device.abort(op.handle) {
                debug!(?err, "device abort after eviction");
            }
            state.store.tokens().mark_completed(op.handle);
            Ok(())
        })
    }

    /// Mixes caller entropy into the device.
    pub fn add_rng_entropy(&self, data: Vec<u8>) -> Receiver<Result<()>> {
        self.submit(move |state| add_entropy(state, &data))
    }

    /// Produces an attestation chain for a key.
    pub fn attest_key(
        &self,
        entry: LockedEntry,
        params: AuthorizationSet,
    ) -> Receiver<Result<Vec<Vec<u8>>>> {
        self.submit(move |state| {
            let mut blob = read_device_key(state, &entry)?;
            with_upgrade(state, &entry, &mut blob, &AuthorizationSet::new(), |device, key| {
                device.attest_key(key, &params)
            })
        })
    }

    /// Asks the device to forget a key whose local files are already
    /// gone.
    pub fn delete_device_key(&self, key_blob: Vec<u8>) -> Receiver<Result<()>> {
        self.submit(move |state| state.device.delete_key(&key_blob))
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn add_entropy(state: &WorkerState, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    if data.len() > MAX_ENTROPY_LEN {
        return Err(DeviceError::InvalidArgument.into());
    }
    state.device.add_rng_entropy(data)
}

fn delegates_to_fallback(
    state: &WorkerState,
    params: &AuthorizationSet,
    flags: RequestFlags,
    err: Error,
) -> bool {
    state.fallback.is_some()
        && state.security_level == SecurityLevel::TrustedEnvironment
        && !flags.contains(RequestFlags::STRONGBOX)
        && params.algorithm() != Some(Algorithm::TripleDes)
        && !err.requires_upgrade()
}

fn store_new_key(
    state: &WorkerState,
    entry: &KeyEntry,
    flags: RequestFlags,
    key_blob: Vec<u8>,
    chars: &KeyCharacteristics,
) -> Result<()> {
    let mut blob_flags = BlobFlags::empty();
    if flags.contains(RequestFlags::ENCRYPTED) {
        blob_flags |= BlobFlags::ENCRYPTED;
    }
    if flags.contains(RequestFlags::CRITICAL_TO_DEVICE_ENCRYPTION) {
        blob_flags |= BlobFlags::CRITICAL_TO_DEVICE_ENCRYPTION;
    }
    match state.security_level {
        SecurityLevel::Software => blob_flags |= BlobFlags::FALLBACK,
        SecurityLevel::Strongbox => blob_flags |= BlobFlags::STRONGBOX,
        SecurityLevel::TrustedEnvironment => {}
    }
    let blob = Blob::new(BlobType::DeviceKey, blob_flags, key_blob, vec![]);
    state.store.put(entry, &blob)?;
    state.store.put_characteristics_cache(
        entry,
        chars,
        blob_flags.contains(BlobFlags::ENCRYPTED),
    )?;
    info!(uid = entry.uid(), alias = entry.alias(), "key material stored");
    Ok(())
}

fn read_device_key(state: &WorkerState, entry: &KeyEntry) -> Result<Blob> {
    let blob = state.store.get(entry)?;
    if blob.blob_type() != BlobType::DeviceKey {
        return Err(Error::ValueCorrupted);
    }
    Ok(blob)
}

/// Runs a device call, retrying exactly once after re-wrapping the key
/// when the device reports the blob is in an old format. The rewritten
/// blob keeps every flag of the original.
fn with_upgrade<T>(
    state: &WorkerState,
    entry: &KeyEntry,
    blob: &mut Blob,
    upgrade_params: &AuthorizationSet,
    f: impl Fn(&dyn SecureDevice, &[u8]) -> Result<T>,
) -> Result<T> {
    match f(state.device.as_ref(), blob.value()) {
        Err(err) if err.requires_upgrade() => {
            info!(uid = entry.uid(), alias = entry.alias(), "upgrading key blob");
            let new_key = state.device.upgrade_key(blob.value(), upgrade_params)?;
            let new_blob =
                Blob::new(BlobType::DeviceKey, blob.flags(), new_key, blob.info().to_vec());
            state.store.put(entry, &new_blob)?;
            let result = f(state.device.as_ref(), new_blob.value());
            *blob = new_blob;
            result
        }
        other => other,
    }
}

/// Serves characteristics from the cache, querying the device and
/// rewriting the cache when it is absent or in the legacy format.
fn ensure_characteristics(
    state: &WorkerState,
    entry: &KeyEntry,
    blob: &mut Blob,
    client_id: &[u8],
    app_data: &[u8],
) -> Result<KeyCharacteristics> {
    if let Some((chars, legacy)) = state.store.get_characteristics_cache(entry)? {
        if !legacy {
            return Ok(chars);
        }
    }
    let chars = with_upgrade(state, entry, blob, &AuthorizationSet::new(), |device, key| {
        device.get_key_characteristics(key, client_id, app_data)
    })?;
    state.store.put_characteristics_cache(entry, &chars, blob.is_encrypted())?;
    Ok(chars)
}

fn find_device_auth_token(
    state: &WorkerState,
    key_auths: &AuthorizationSet,
) -> Option<HardwareAuthToken> {
    let secure_ids = key_auths.all_ulongs(Tag::UserSecureId);
    if secure_ids.is_empty() {
        return None;
    }
    let auth_type = crate::types::HardwareAuthenticatorType::from_bits_truncate(
        key_auths.get_enum(Tag::UserAuthType).unwrap_or(0),
    );
    let timeout = key_auths.get_uint(Tag::AuthTimeout)?;
    state
        .store
        .tokens()
        .find_timed(
            &secure_ids,
            auth_type,
            timeout,
            key_auths.contains_tag(Tag::AllowWhileOnBody),
        )
        .ok()
}

#[instrument(skip_all, fields(uid = uid, alias = %entry.alias(), purpose = ?purpose))]
fn begin_task(
    state: &WorkerState,
    entry: LockedEntry,
    uid: u32,
    purpose: KeyPurpose,
    params: AuthorizationSet,
    entropy: Vec<u8>,
) -> Result<BeginOperation> {
    let mut blob = read_device_key(state, &entry)?;
    let client_id = params.get_bytes(Tag::ApplicationId).unwrap_or(&[]).to_vec();
    let app_data = params.get_bytes(Tag::ApplicationData).unwrap_or(&[]).to_vec();
    let chars = ensure_characteristics(state, &entry, &mut blob, &client_id, &app_data)?;
    let key_auths = chars.all();

    add_entropy(state, &entropy)?;

    let key_id = Enforcement::key_id(blob.value())?;
    let outcome = state.store.enforcement().authorize_begin(
        state.store.tokens(),
        purpose,
        key_id,
        entry.user_id(),
        &key_auths,
        &params,
    )?;
    let auth_token = find_device_auth_token(state, &key_auths);

    while state.registry.is_full() {
        let Some(victim) = state.registry.oldest_pruneable() else {
            return Err(DeviceError::TooManyOperations.into());
        };
        if let Some(victim_op) = state.registry.remove(victim) {
            warn!(victim, "pruning oldest operation to make room");
            let _ = state.device.abort(victim_op.handle);
        }
    }

    let begin = with_upgrade(state, &entry, &mut blob, &params, |device, key| {
        device.begin(purpose, key, &params, auth_token.as_ref())
    })?;
    // The blob may have been re-wrapped above; the rate-limit id follows
    // the payload.
    let key_id = Enforcement::key_id(blob.value())?;

    let token = state.registry.add(Operation {
        handle: begin.handle,
        purpose,
        key_id,
        key_auths,
        uid,
        pruneable: true,
    });
    Ok(BeginOperation {
        token,
        challenge: begin.handle,
        out_params: begin.out_params,
        op_auth_needed: outcome.op_auth_needed,
    })
}

fn reauthorize(state: &WorkerState, op: &Operation) -> Result<()> {
    state.store.enforcement().authorize_update_or_finish(
        state.store.tokens(),
        &op.key_auths,
        op.handle,
    )
}

fn abort_evict(state: &WorkerState, token: u64, op: &Operation) {
    state.registry.remove(token);
    if let Err(err) = state.device.abort(op.handle) {
        debug!(?err, "device abort during eviction");
    }
    state.store.tokens().mark_completed(op.handle);
}
