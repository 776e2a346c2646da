// Copyright (C) Microsoft Corporation. All rights reserved.

//! Digest and MAC helpers.

use openssl::hash::hash;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

use crate::error::Result;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Result<[u8; 32]> {
    let digest = hash(MessageDigest::sha256(), data)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// MD5 of `data`. Only used to verify checksums of legacy blobs.
pub fn md5(data: &[u8]) -> Result<[u8; 16]> {
    let digest = hash(MessageDigest::md5(), data)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}
