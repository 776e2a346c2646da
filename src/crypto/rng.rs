// Copyright (C) Microsoft Corporation. All rights reserved.

//! Secure randomness.

use openssl::rand::rand_bytes;

use crate::error::Result;

/// Fills `buf` from the OpenSSL CSPRNG.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    rand_bytes(buf)?;
    Ok(())
}

/// A random `u64` from the CSPRNG.
pub fn random_u64() -> Result<u64> {
    let mut buf = [0u8; 8];
    rand_bytes(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}
