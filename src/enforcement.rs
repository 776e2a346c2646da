// Copyright (C) Microsoft Corporation. All rights reserved.

//! Authorization of key operations against key tags and ambient state.
//!
//! `authorize_begin` runs the full gauntlet: purpose, validity dates,
//! rate and use-count limits, caller-nonce policy, device lock state, and
//! the authentication binding. `authorize_update_or_finish` re-checks
//! only authentication freshness, and only for per-operation bindings.
//!
//! Tag handling is closed-world: tags with no policy weight are listed
//! explicitly and skipped; anything else that reaches the fallthrough is
//! rejected as an invalid key blob rather than silently allowed.

use std::collections::HashMap;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use crate::auth_token::AuthTokenTable;
use crate::crypto;
use crate::error::DeviceError;
use crate::error::Error;
use crate::error::Result;
use crate::types::Algorithm;
use crate::types::AuthorizationSet;
use crate::types::HardwareAuthenticatorType;
use crate::types::KeyPurpose;
use crate::types::Tag;

/// Entries kept in each of the rate-limit tables.
const LIMIT_TABLE_CAP: usize = 32;

/// Milliseconds since the epoch, for date tags.
pub type WallClockFn = Box<dyn Fn() -> i64 + Send + Sync>;

/// Seconds of monotonic time, for rate limiting.
pub type MonoClockFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// Outcome of a successful `begin` authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginOutcome {
    /// The key binds authentication to the operation handle, which does
    /// not exist yet; the caller must be told authorization is still
    /// pending.
    pub op_auth_needed: bool,
}

#[derive(Debug)]
struct LimitEntry {
    key_id: u64,
    value: u64,
    last_touch: u64,
}

/// Bounded map from key id to a counter, evicting the least recently
/// touched entry at capacity.
#[derive(Debug, Default)]
struct LimitTable {
    entries: Vec<LimitEntry>,
}

impl LimitTable {
    fn get(&self, key_id: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.key_id == key_id).map(|e| e.value)
    }

    fn put(&mut self, key_id: u64, value: u64, now: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key_id == key_id) {
            entry.value = value;
            entry.last_touch = now;
            return;
        }
        if self.entries.len() >= LIMIT_TABLE_CAP {
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_touch)
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(oldest);
            }
        }
        self.entries.push(LimitEntry { key_id, value, last_touch: now });
    }
}

#[derive(Debug, Default)]
struct Inner {
    last_use_secs: LimitTable,
    use_count: LimitTable,
    device_locked: HashMap<u32, bool>,
}

/// The enforcement engine.
pub struct Enforcement {
    inner: Mutex<Inner>,
    wall_clock: WallClockFn,
    mono_clock: MonoClockFn,
}

impl std::fmt::Debug for Enforcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enforcement").field("inner", &self.inner).finish()
    }
}

impl Default for Enforcement {
    fn default() -> Self {
        Self::new()
    }
}

impl Enforcement {
    /// Creates an engine on the real clocks.
    pub fn new() -> Self {
        let start = Instant::now();
        Self::with_clocks(
            Box::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0)
            }),
            Box::new(move || start.elapsed().as_secs()),
        )
    }

    /// Creates an engine with injected clocks.
    pub fn with_clocks(wall_clock: WallClockFn, mono_clock: MonoClockFn) -> Self {
        Self { inner: Mutex::new(Inner::default()), wall_clock, mono_clock }
    }

    /// Stable id of a key, derived from its blob payload.
    pub fn key_id(key_blob: &[u8]) -> Result<u64> {
        let digest = crypto::sha256(key_blob)?;
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Ok(u64::from_be_bytes(prefix))
    }

    /// Records whether `user_id`'s device is behind a keyguard.
    pub fn set_device_locked(&self, user_id: u32, locked: bool) {
        self.inner.lock().device_locked.insert(user_id, locked);
    }

    /// Full authorization of a `begin` request.
    ///
    /// # Arguments
    ///
    /// * `key_id` - id from [`Enforcement::key_id`], keys the rate tables.
    /// * `user_id` - user of the calling uid, for the device-lock check.
    /// * `key_auths` - the key's combined enforced tags.
    /// * `op_params` - parameters of this request.
    pub fn authorize_begin(
        &self,
        tokens: &AuthTokenTable,
        purpose: KeyPurpose,
        key_id: u64,
        user_id: u32,
        key_auths: &AuthorizationSet,
        op_params: &AuthorizationSet,
    ) -> Result<BeginOutcome> {
        // Public-key halves of asymmetric keys are not secrets.
        if key_auths.algorithm().is_some_and(|a| a.is_public_key()) {
            match purpose {
                KeyPurpose::Encrypt | KeyPurpose::Verify => {
                    return Ok(BeginOutcome { op_auth_needed: false });
                }
                KeyPurpose::WrapKey => {
                    return Err(DeviceError::IncompatiblePurpose.into());
                }
                KeyPurpose::Decrypt | KeyPurpose::Sign => {}
            }
        }
        if !key_auths.all_enums(Tag::Purpose).contains(&(purpose as u32)) {
            return Err(DeviceError::IncompatiblePurpose.into());
        }

        let now_wall = (self.wall_clock)();
        let now_mono = (self.mono_clock)();
        let mut caller_nonce_allowed = false;
        let mut rate_limited = false;
        let mut use_counted = false;
        let mut no_auth_required = false;
        let mut secure_ids = Vec::new();
        let mut auth_type = HardwareAuthenticatorType::empty();
        let mut auth_timeout_secs = None;
        let mut allow_while_on_body = false;

        for param in key_auths.iter() {
            match param.tag {
                Tag::ActiveDatetime => {
                    if key_auths.get_date(Tag::ActiveDatetime).is_some_and(|t| now_wall < t) {
                        return Err(DeviceError::KeyNotYetValid.into());
                    }
                }
                Tag::OriginationExpireDatetime => {
                    if matches!(purpose, KeyPurpose::Encrypt | KeyPurpose::Sign)
                        && key_auths
                            .get_date(Tag::OriginationExpireDatetime)
                            .is_some_and(|t| now_wall > t)
                    {
                        return Err(DeviceError::KeyExpired.into());
                    }
                }
                Tag::UsageExpireDatetime => {
                    if matches!(purpose, KeyPurpose::Decrypt | KeyPurpose::Verify)
                        && key_auths
                            .get_date(Tag::UsageExpireDatetime)
                            .is_some_and(|t| now_wall > t)
                    {
                        return Err(DeviceError::KeyExpired.into());
                    }
                }
                Tag::MinSecondsBetweenOps => {
                    let min = u64::from(key_auths.get_uint(Tag::MinSecondsBetweenOps).unwrap_or(0));
                    self.check_rate_limit(key_id, min, now_mono)?;
                    rate_limited = true;
                }
                Tag::MaxUsesPerBoot => {
                    let max = u64::from(key_auths.get_uint(Tag::MaxUsesPerBoot).unwrap_or(0));
                    self.check_use_count(key_id, max)?;
                    use_counted = true;
                }
                Tag::UnlockedDeviceRequired => {
                    let locked = self
                        .inner
                        .lock()
                        .device_locked
                        .get(&user_id)
                        .copied()
                        .unwrap_or(false);
                    if locked {
                        return Err(DeviceError::DeviceLocked.into());
                    }
                }
                Tag::CallerNonce => caller_nonce_allowed = true,
                Tag::NoAuthRequired => no_auth_required = true,
                Tag::UserSecureId => {
                    if let crate::types::KeyParameterValue::ULong(sid) = param.value {
                        secure_ids.push(sid);
                    }
                }
                Tag::UserAuthType => {
                    auth_type = HardwareAuthenticatorType::from_bits_truncate(
                        key_auths.get_enum(Tag::UserAuthType).unwrap_or(0),
                    );
                }
                Tag::AuthTimeout => auth_timeout_secs = key_auths.get_uint(Tag::AuthTimeout),
                Tag::AllowWhileOnBody => allow_while_on_body = true,
                Tag::BootloaderOnly => return Err(DeviceError::InvalidKeyBlob.into()),
                // Tags with no begin-time policy weight.
                Tag::Purpose
                | Tag::Algorithm
                | Tag::KeySize
                | Tag::BlockMode
                | Tag::Digest
                | Tag::Padding
                | Tag::MacLength
                | Tag::UserId
                | Tag::ApplicationId
                | Tag::ApplicationData
                | Tag::CreationDatetime
                | Tag::Origin
                | Tag::RollbackResistance
                | Tag::OsVersion
                | Tag::OsPatchlevel
                | Tag::Nonce
                | Tag::IncludeUniqueId
                | Tag::AttestationApplicationId
                | Tag::AttestationIdBrand
                | Tag::AttestationIdDevice
                | Tag::AttestationIdProduct
                | Tag::AttestationIdSerial
                | Tag::AttestationIdImei
                | Tag::AttestationIdMeid
                | Tag::AttestationIdManufacturer
                | Tag::AttestationIdModel
                | Tag::ResetSinceIdRotation => {}
                #[allow(unreachable_patterns)]
                other => {
                    warn!(?other, "unclassified tag in key authorizations");
                    return Err(DeviceError::InvalidKeyBlob.into());
                }
            }
        }

        if op_params.contains_tag(Tag::Nonce)
            && !caller_nonce_allowed
            && purpose == KeyPurpose::Encrypt
        {
            return Err(DeviceError::CallerNonceProhibited.into());
        }

        let outcome = if no_auth_required || secure_ids.is_empty() {
            BeginOutcome { op_auth_needed: false }
        } else {
            match auth_timeout_secs {
                Some(timeout) => {
                    tokens
                        .find_timed(&secure_ids, auth_type, timeout, allow_while_on_body)
                        .map_err(|err| {
                            debug!(?err, "no fresh authentication for timeout-bound key");
                            Error::from(DeviceError::KeyUserNotAuthenticated)
                        })?;
                    BeginOutcome { op_auth_needed: false }
                }
                // Authentication binds to the yet-unknown operation handle.
                None => BeginOutcome { op_auth_needed: true },
            }
        };
        // Limits are consumed only once the whole gauntlet has passed; a
        // rejected begin must not burn a slot.
        self.record_usage(key_id, rate_limited, use_counted, now_mono);
        Ok(outcome)
    }

    /// Authentication re-check for `update`/`finish`. Timeout-bound keys
    /// were checked at `begin` and pass; per-operation keys need a token
    /// minted for this exact handle.
    pub fn authorize_update_or_finish(
        &self,
        tokens: &AuthTokenTable,
        key_auths: &AuthorizationSet,
        op_handle: u64,
    ) -> Result<()> {
        if key_auths.contains_tag(Tag::NoAuthRequired)
            || key_auths.contains_tag(Tag::AuthTimeout)
        {
            return Ok(());
        }
        let secure_ids = key_auths.all_ulongs(Tag::UserSecureId);
        if secure_ids.is_empty() {
            return Ok(());
        }
        let auth_type = HardwareAuthenticatorType::from_bits_truncate(
            key_auths.get_enum(Tag::UserAuthType).unwrap_or(0),
        );
        tokens
            .find_for_operation(&secure_ids, auth_type, op_handle)
            .map_err(|_| Error::OpAuthNeeded)?;
        Ok(())
    }

    fn check_rate_limit(&self, key_id: u64, min_secs: u64, now: u64) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(last) = inner.last_use_secs.get(key_id) {
            if now.saturating_sub(last) < min_secs {
                return Err(DeviceError::KeyRateLimitExceeded.into());
            }
        }
        Ok(())
    }

    fn check_use_count(&self, key_id: u64, max_uses: u64) -> Result<()> {
        let inner = self.inner.lock();
        let count = inner.use_count.get(key_id).unwrap_or(0);
        if max_uses > 0 && count >= max_uses {
            return Err(DeviceError::KeyMaxOpsExceeded.into());
        }
        Ok(())
    }

    fn record_usage(&self, key_id: u64, rate_limited: bool, use_counted: bool, now: u64) {
        if !rate_limited && !use_counted {
            return;
        }
        let mut inner = self.inner.lock();
        if rate_limited {
            inner.last_use_secs.put(key_id, now, now);
        }
        if use_counted {
            let count = inner.use_count.get(key_id).unwrap_or(0);
            inner.use_count.put(key_id, count + 1, now);
        }
    }
}
