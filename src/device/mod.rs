// Copyright (C) Microsoft Corporation. All rights reserved.

//! The secure device boundary.
//!
//! A [`SecureDevice`] is anything that can hold key material and run
//! operations on it: a trusted execution environment, a discrete secure
//! element, or the in-process software fallback. The service never calls
//! a device directly; every call goes through the owning worker's queue.

mod soft;

pub use soft::SoftwareDevice;

use crate::error::Result;
use crate::types::AuthorizationSet;
use crate::types::HardwareAuthToken;
use crate::types::KeyCharacteristics;
use crate::types::KeyFormat;
use crate::types::KeyPurpose;
use crate::types::SecurityLevel;

/// Result of a device `begin`.
#[derive(Debug, Clone)]
pub struct BeginResult {
    /// Opaque handle for the running operation. Also the challenge a
    /// per-operation auth token must carry.
    pub handle: u64,
    /// Parameters the device chose, e.g. a generated nonce.
    pub out_params: AuthorizationSet,
}

/// Result of a device `update`.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Input bytes the device consumed.
    pub input_consumed: usize,
    /// Output produced so far.
    pub output: Vec<u8>,
}

/// A cryptographic device.
///
/// Key blobs returned by a device are opaque to everything above it and
/// only meaningful to the device that produced them.
pub trait SecureDevice: Send {
    /// Trust level of this device.
    fn security_level(&self) -> SecurityLevel;

    /// Generates a key described by `params`.
    fn generate_key(
        &self,
        params: &AuthorizationSet,
    ) -> Result<(Vec<u8>, KeyCharacteristics)>;

    /// Imports clear key material.
    fn import_key(
        &self,
        params: &AuthorizationSet,
        format: KeyFormat,
        key_data: &[u8],
    ) -> Result<(Vec<u8>, KeyCharacteristics)>;

    /// Imports key material wrapped under one of this device's keys.
    fn import_wrapped_key(
        &self,
        wrapped_data: &[u8],
        wrapping_key_blob: &[u8],
        masking_key: &[u8],
    ) -> Result<(Vec<u8>, KeyCharacteristics)>;

    /// Exports the public half (or raw material, where permitted) of a
    /// key.
    fn export_key(
        &self,
        key_blob: &[u8],
        format: KeyFormat,
        client_id: &[u8],
        app_data: &[u8],
    ) -> Result<Vec<u8>>;

    /// Re-wraps `key_blob` under the device's current wrapping scheme.
    fn upgrade_key(&self, key_blob: &[u8], params: &AuthorizationSet) -> Result<Vec<u8>>;

    /// Destroys any device-side state for `key_blob`.
    fn delete_key(&self, key_blob: &[u8]) -> Result<()>;

    /// Reads back the enforced tags of a key.
    fn get_key_characteristics(
        &self,
        key_blob: &[u8],
        client_id: &[u8],
        app_data: &[u8],
    ) -> Result<KeyCharacteristics>;

    /// Starts an operation.
    fn begin(
        &self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: &AuthorizationSet,
        auth_token: Option<&HardwareAuthToken>,
    ) -> Result<BeginResult>;

    /// Feeds data to a running operation.
    fn update(&self, handle: u64, input: &[u8]) -> Result<UpdateResult>;

    /// Completes an operation, returning its final output.
    fn finish(&self, handle: u64, input: &[u8], signature: &[u8]) -> Result<Vec<u8>>;

    /// Tears down a running operation.
    fn abort(&self, handle: u64) -> Result<()>;

    /// Mixes caller entropy into the device RNG.
    fn add_rng_entropy(&self, data: &[u8]) -> Result<()>;

    /// Produces an attestation certificate chain for a key.
    fn attest_key(
        &self,
        key_blob: &[u8],
        params: &AuthorizationSet,
    ) -> Result<Vec<Vec<u8>>>;
}
