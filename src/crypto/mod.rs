// Copyright (C) Microsoft Corporation. All rights reserved.

//! Thin wrappers over the OpenSSL primitives the store depends on.
//!
//! Everything here returns the crate [`Result`](crate::error::Result);
//! OpenSSL stack errors are folded into [`Error::SystemError`]
//! (crate::error::Error::SystemError) at the conversion boundary.

mod aes;
mod digest;
mod pbkdf;
mod rng;

pub use aes::decrypt_aes_cbc;
pub use aes::decrypt_aes_gcm;
pub use aes::encrypt_aes_cbc;
pub use aes::encrypt_aes_gcm;
pub use aes::GCM_IV_LEN;
pub use aes::GCM_TAG_LEN;
pub use digest::hmac_sha256;
pub use digest::md5;
pub use digest::sha256;
pub use pbkdf::derive_master_key;
pub use pbkdf::MasterKeyFlavor;
pub use rng::fill_random;
pub use rng::random_u64;
