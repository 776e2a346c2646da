// Copyright (C) Microsoft Corporation. All rights reserved.

//! AES modes used by the blob codec.

use openssl::symm::decrypt;
use openssl::symm::decrypt_aead;
use openssl::symm::encrypt;
use openssl::symm::encrypt_aead;
use openssl::symm::Cipher;

use crate::error::Error;
use crate::error::Result;

/// GCM nonce length in bytes.
pub const GCM_IV_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const GCM_TAG_LEN: usize = 16;

/// Encrypts `plaintext` with AES-256-GCM. The tag is written into `tag`.
///
/// # Arguments
///
/// * `key` - 32-byte key.
/// * `iv` - [`GCM_IV_LEN`]-byte nonce, unique per key.
/// * `aad` - data authenticated but not encrypted.
/// * `tag` - output buffer for the [`GCM_TAG_LEN`]-byte tag.
pub fn encrypt_aes_gcm(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    plaintext: &[u8],
    tag: &mut [u8],
) -> Result<Vec<u8>> {
    let cipher = match key.len() {
        16 => Cipher::aes_128_gcm(),
        32 => Cipher::aes_256_gcm(),
        _ => return Err(Error::SystemError),
    };
    Ok(encrypt_aead(cipher, key, Some(iv), aad, plaintext, tag)?)
}

/// Decrypts AES-GCM ciphertext, verifying `tag` over it and `aad`.
///
/// # Errors
///
/// Returns [`Error::ValueCorrupted`] when tag verification fails; the
/// caller decides whether that means corruption or a stale
/// super-encryption key.
pub fn decrypt_aes_gcm(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>> {
    let cipher = match key.len() {
        16 => Cipher::aes_128_gcm(),
        32 => Cipher::aes_256_gcm(),
        _ => return Err(Error::SystemError),
    };
    decrypt_aead(cipher, key, Some(iv), aad, ciphertext, tag)
        .map_err(|_| Error::ValueCorrupted)
}

/// Encrypts with AES-128-CBC, PKCS#7 padding. Legacy blob format only.
pub fn encrypt_aes_cbc(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    Ok(encrypt(Cipher::aes_128_cbc(), key, Some(iv), plaintext)?)
}

/// Decrypts AES-128-CBC ciphertext. Legacy blob format only.
pub fn decrypt_aes_cbc(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    decrypt(Cipher::aes_128_cbc(), key, Some(iv), ciphertext)
        .map_err(|_| Error::ValueCorrupted)
}
