// Copyright (C) Microsoft Corporation. All rights reserved.

//! Errors reported by the key-management service.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors in the device-defined space. These mirror the result codes a
/// secure cryptographic device reports for key and operation requests.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The requested algorithm is not supported by the device.
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The requested purpose is not supported by the device.
    #[error("unsupported purpose")]
    UnsupportedPurpose,

    /// The key does not permit the requested purpose.
    #[error("incompatible purpose")]
    IncompatiblePurpose,

    /// The key's usage expiration date has passed.
    #[error("key expired")]
    KeyExpired,

    /// The key's activation date lies in the future.
    #[error("key not yet valid")]
    KeyNotYetValid,

    /// The key's minimum-seconds-between-uses limit was hit.
    #[error("key rate limit exceeded")]
    KeyRateLimitExceeded,

    /// The key's maximum-uses-per-boot limit was hit.
    #[error("max uses per boot exceeded")]
    KeyMaxOpsExceeded,

    /// The key blob could not be parsed or carries a disallowed tag.
    #[error("invalid key blob")]
    InvalidKeyBlob,

    /// No device of the requested security level is available.
    #[error("hardware type unavailable")]
    HardwareTypeUnavailable,

    /// The key blob was wrapped by an older device key and must be
    /// re-wrapped before use.
    #[error("key requires upgrade")]
    KeyRequiresUpgrade,

    /// The device cannot accept further concurrent operations.
    #[error("too many operations")]
    TooManyOperations,

    /// No operation exists for the supplied token or handle.
    #[error("invalid operation handle")]
    InvalidOperationHandle,

    /// The key requires user authentication and no valid proof was found.
    #[error("key user not authenticated")]
    KeyUserNotAuthenticated,

    /// The caller supplied a nonce but the key does not allow it.
    #[error("caller nonce prohibited")]
    CallerNonceProhibited,

    /// The key requires an unlocked device and the device is locked.
    #[error("device locked")]
    DeviceLocked,

    /// An argument was malformed or disallowed.
    #[error("invalid argument")]
    InvalidArgument,

    /// No attestation application id could be gathered.
    #[error("attestation application id missing")]
    AttestationApplicationIdMissing,

    /// Device identifiers cannot be attested for this caller.
    #[error("cannot attest device ids")]
    CannotAttestIds,

    /// An authentication token failed verification.
    #[error("verification failed")]
    VerificationFailed,

    /// The device reported a failure with no further classification.
    #[error("unknown device error")]
    UnknownError,
}

/// Errors reported by key-management operations.
///
/// Service-level conditions live directly in this enum; results from the
/// device-defined error space are carried in [`Error::Device`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The caller lacks the permission or grant for the request.
    #[error("permission denied")]
    PermissionDenied,

    /// No key or operation exists under the given name.
    #[error("key not found")]
    KeyNotFound,

    /// A stored blob failed decoding or its authentication check.
    #[error("value corrupted")]
    ValueCorrupted,

    /// The user's vault is locked; encrypted entries are unreadable.
    #[error("keystore locked")]
    Locked,

    /// The user's vault has no master key yet.
    #[error("keystore uninitialized")]
    Uninitialized,

    /// A key with this name already exists.
    #[error("key already exists")]
    KeyAlreadyExists,

    /// The supplied password did not unlock the vault. `remaining` counts
    /// the attempts left before the vault is force-reset.
    #[error("wrong password ({remaining} attempts remaining)")]
    WrongPassword {
        /// Wrong attempts left before forced reset.
        remaining: u8,
    },

    /// A signature or MAC comparison failed.
    #[error("signature invalid")]
    SignatureInvalid,

    /// The operation was created but still needs a per-operation
    /// authentication token before `update`/`finish`. Not a hard failure.
    #[error("operation authorization needed")]
    OpAuthNeeded,

    /// A super-encrypted blob failed its authentication check, e.g. after
    /// a password change. The key cannot be recovered.
    #[error("key permanently invalidated")]
    KeyPermanentlyInvalidated,

    /// I/O, allocation, or an unexpected device response.
    #[error("system error")]
    SystemError,

    /// An error from the device-defined space.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        tracing::error!(error = %err, "I/O failure");
        Error::SystemError
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        tracing::error!(error = %err, "crypto failure");
        Error::SystemError
    }
}

impl Error {
    /// Whether the error means "retry once after re-wrapping the key".
    pub fn requires_upgrade(&self) -> bool {
        matches!(self, Error::Device(DeviceError::KeyRequiresUpgrade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_wraps() {
        let err: Error = DeviceError::KeyRequiresUpgrade.into();
        assert!(err.requires_upgrade());
        assert!(!Error::SystemError.requires_upgrade());
    }

    #[test]
    fn test_io_error_maps_to_system_error() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err, Error::SystemError);
    }

    #[test]
    fn test_wrong_password_display() {
        let err = Error::WrongPassword { remaining: 2 };
        assert_eq!(err.to_string(), "wrong password (2 attempts remaining)");
    }
}
