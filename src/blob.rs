// Copyright (C) Microsoft Corporation. All rights reserved.

//! Versioned on-disk blob codec.
//!
//! Every file the store writes is a blob: a four-byte header
//! `[version, type, flags, info_len]`, cipher material, a big-endian
//! payload length, the payload, and a plaintext `info` tail. The tail is
//! deliberately readable without the master key so the per-user salt can
//! be recovered before password derivation.
//!
//! Version 3 (current) seals the payload with AES-GCM, authenticating the
//! header as AAD. Version 2 is the legacy AES-128-CBC format with an MD5
//! checksum inside the encrypted region; it decodes with
//! `needs_rewrite` set so the next persist upgrades it. Versions below 2
//! predate the encrypted flag bit and are treated as encrypted
//! unconditionally.

use tracing::warn;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::Error;
use crate::error::Result;
use crate::types::BlobFlags;

/// Current on-disk format version.
const BLOB_VERSION: u8 = 3;

/// Upper bound on `payload + info` bytes in one blob.
const MAX_BLOB_VALUE: usize = 32 * 1024;

/// Header bytes authenticated as GCM AAD.
const HEADER_LEN: usize = 4;

/// Legacy CBC IV length.
const CBC_IV_LEN: usize = 16;

/// Legacy MD5 checksum length.
const MD5_LEN: usize = 16;

/// What a blob file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobType {
    /// Opaque client data.
    Generic = 1,
    /// Legacy 16-byte master key.
    MasterKey = 2,
    /// Opaque device key material.
    DeviceKey = 4,
    /// Serialized key characteristics, current format.
    Characteristics = 5,
    /// Serialized key characteristics, legacy cache format. Decodable
    /// only; refreshed to [`BlobType::Characteristics`] on next use.
    CharacteristicsCache = 6,
    /// 32-byte master key.
    MasterKeyAes256 = 7,
}

impl BlobType {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(BlobType::Generic),
            2 => Some(BlobType::MasterKey),
            4 => Some(BlobType::DeviceKey),
            5 => Some(BlobType::Characteristics),
            6 => Some(BlobType::CharacteristicsCache),
            7 => Some(BlobType::MasterKeyAes256),
            _ => None,
        }
    }
}

/// Header fields of a blob, readable without any key material.
#[derive(Debug, Clone)]
pub struct BlobPeek {
    /// Format version byte.
    pub version: u8,
    /// Blob type.
    pub blob_type: BlobType,
    /// Flag byte.
    pub flags: BlobFlags,
    /// Plaintext info tail.
    pub info: Vec<u8>,
}

/// A decoded blob: type, flags, secret payload, and plaintext info tail.
#[derive(Debug)]
pub struct Blob {
    blob_type: BlobType,
    flags: BlobFlags,
    value: Zeroizing<Vec<u8>>,
    info: Vec<u8>,
    /// Set when the blob came off disk in a superseded format and should
    /// be persisted again.
    needs_rewrite: bool,
}

impl Blob {
    /// Builds a fresh blob ready for encoding.
    pub fn new(blob_type: BlobType, flags: BlobFlags, value: Vec<u8>, info: Vec<u8>) -> Self {
        Self {
            blob_type,
            flags,
            value: Zeroizing::new(value),
            info,
            needs_rewrite: false,
        }
    }

    /// Blob type.
    pub fn blob_type(&self) -> BlobType {
        self.blob_type
    }

    /// Flag byte.
    pub fn flags(&self) -> BlobFlags {
        self.flags
    }

    /// Replaces the flag byte.
    pub fn set_flags(&mut self, flags: BlobFlags) {
        self.flags = flags;
    }

    /// Secret payload.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Replaces the secret payload.
    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = Zeroizing::new(value);
    }

    /// Plaintext info tail.
    pub fn info(&self) -> &[u8] {
        &self.info
    }

    /// Whether the blob was read in a superseded format.
    pub fn needs_rewrite(&self) -> bool {
        self.needs_rewrite
    }

    /// Whether the payload is stored encrypted under the master key.
    pub fn is_encrypted(&self) -> bool {
        self.flags
            .intersects(BlobFlags::ENCRYPTED | BlobFlags::SUPER_ENCRYPTED)
    }

    /// Whether the payload carries the password-bound encryption layer.
    pub fn is_super_encrypted(&self) -> bool {
        self.flags.contains(BlobFlags::SUPER_ENCRYPTED)
    }

    /// Whether the key must survive `clear_uid` for system identities.
    pub fn is_critical_to_device_encryption(&self) -> bool {
        self.flags.contains(BlobFlags::CRITICAL_TO_DEVICE_ENCRYPTION)
    }

    /// Reads the header and info tail of an encoded blob without
    /// decrypting anything.
    pub fn peek(raw: &[u8]) -> Result<BlobPeek> {
        if raw.len() < HEADER_LEN {
            return Err(Error::ValueCorrupted);
        }
        let info_len = raw[3] as usize;
        if raw.len() < HEADER_LEN + info_len {
            return Err(Error::ValueCorrupted);
        }
        let blob_type = BlobType::from_raw(raw[1]).ok_or(Error::ValueCorrupted)?;
        Ok(BlobPeek {
            version: raw[0],
            blob_type,
            flags: BlobFlags::from_bits_truncate(raw[2]),
            info: raw[raw.len() - info_len..].to_vec(),
        })
    }

    /// Encodes the blob in the current format.
    ///
    /// # Arguments
    ///
    /// * `master_key` - required when the encrypted or super-encrypted
    ///   flag is set; ignored otherwise.
    pub fn encode(&self, master_key: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut value = self.value.to_vec();
        if value.len() + self.info.len() > MAX_BLOB_VALUE {
            warn!(
                value_len = value.len(),
                info_len = self.info.len(),
                "blob exceeds size cap, truncating payload"
            );
            value.truncate(MAX_BLOB_VALUE.saturating_sub(self.info.len()));
        }
        let value = Zeroizing::new(value);

        let header = [
            BLOB_VERSION,
            self.blob_type as u8,
            self.flags.bits(),
            self.info.len() as u8,
        ];
        let mut iv = [0u8; crypto::GCM_IV_LEN];
        let mut tag = [0u8; crypto::GCM_TAG_LEN];
        let payload = if self.is_encrypted() {
            let key = master_key.ok_or(Error::Locked)?;
            crypto::fill_random(&mut iv)?;
            crypto::encrypt_aes_gcm(key, &iv, &header, &value, &mut tag)?
        } else {
            value.to_vec()
        };

        let mut out =
            Vec::with_capacity(HEADER_LEN + iv.len() + tag.len() + 4 + payload.len() + self.info.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&self.info);
        Ok(out)
    }

    /// Decodes a blob, decrypting with `master_key` when its flags ask
    /// for it.
    ///
    /// # Errors
    ///
    /// * [`Error::Locked`] - encrypted blob and no key available.
    /// * [`Error::KeyPermanentlyInvalidated`] - super-encrypted blob
    ///   whose seal no longer verifies (the binding secret is gone).
    /// * [`Error::ValueCorrupted`] - any other structural or
    ///   cryptographic failure.
    pub fn decode(raw: &[u8], master_key: Option<&[u8]>) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::ValueCorrupted);
        }
        let version = raw[0];
        let blob_type = BlobType::from_raw(raw[1]).ok_or(Error::ValueCorrupted)?;
        let flags = BlobFlags::from_bits_truncate(raw[2]);
        let info_len = raw[3] as usize;

        // The encrypted bit only exists from version 2 on.
        let encrypted = if version < 2 {
            true
        } else {
            flags.intersects(BlobFlags::ENCRYPTED | BlobFlags::SUPER_ENCRYPTED)
        };
        let key = if encrypted {
            Some(master_key.ok_or(Error::Locked)?)
        } else {
            None
        };

        if version >= BLOB_VERSION {
            Self::decode_v3(raw, blob_type, flags, info_len, key)
        } else {
            Self::decode_v2(raw, blob_type, flags, info_len, key)
        }
    }

    fn decode_v3(
        raw: &[u8],
        blob_type: BlobType,
        flags: BlobFlags,
        info_len: usize,
        key: Option<&[u8]>,
    ) -> Result<Self> {
        let fixed = HEADER_LEN + crypto::GCM_IV_LEN + crypto::GCM_TAG_LEN + 4;
        if raw.len() < fixed + info_len {
            return Err(Error::ValueCorrupted);
        }
        let iv = &raw[HEADER_LEN..HEADER_LEN + crypto::GCM_IV_LEN];
        let tag = &raw[HEADER_LEN + crypto::GCM_IV_LEN..fixed - 4];
        let payload_len =
            u32::from_be_bytes([raw[fixed - 4], raw[fixed - 3], raw[fixed - 2], raw[fixed - 1]])
                as usize;
        if raw.len() < fixed + payload_len + info_len {
            return Err(Error::ValueCorrupted);
        }
        let payload = &raw[fixed..fixed + payload_len];
        let info = raw[fixed + payload_len..fixed + payload_len + info_len].to_vec();

        let value = match key {
            Some(key) => crypto::decrypt_aes_gcm(key, iv, &raw[..HEADER_LEN], payload, tag)
                .map_err(|err| {
                    if flags.contains(BlobFlags::SUPER_ENCRYPTED) {
                        Error::KeyPermanentlyInvalidated
                    } else {
                        err
                    }
                })?,
            None => payload.to_vec(),
        };

        Ok(Self {
            blob_type,
            flags,
            value: Zeroizing::new(value),
            info,
            needs_rewrite: false,
        })
    }

    fn decode_v2(
        raw: &[u8],
        blob_type: BlobType,
        flags: BlobFlags,
        info_len: usize,
        key: Option<&[u8]>,
    ) -> Result<Self> {
        let body_start = HEADER_LEN + CBC_IV_LEN;
        if raw.len() < body_start + info_len {
            return Err(Error::ValueCorrupted);
        }
        let iv = &raw[HEADER_LEN..body_start];
        let body = &raw[body_start..raw.len() - info_len];
        let info = raw[raw.len() - info_len..].to_vec();

        let plain = match key {
            Some(key) => Zeroizing::new(crypto::decrypt_aes_cbc(key, iv, body)?),
            None => Zeroizing::new(body.to_vec()),
        };
        if plain.len() < MD5_LEN + 4 {
            return Err(Error::ValueCorrupted);
        }
        let digest = &plain[..MD5_LEN];
        let payload_len = u32::from_be_bytes([
            plain[MD5_LEN],
            plain[MD5_LEN + 1],
            plain[MD5_LEN + 2],
            plain[MD5_LEN + 3],
        ]) as usize;
        if plain.len() < MD5_LEN + 4 + payload_len {
            return Err(Error::ValueCorrupted);
        }
        let digested = &plain[MD5_LEN..MD5_LEN + 4 + payload_len];
        if crypto::md5(digested)? != digest {
            return Err(Error::ValueCorrupted);
        }
        let value = plain[MD5_LEN + 4..MD5_LEN + 4 + payload_len].to_vec();

        Ok(Self {
            blob_type,
            flags,
            value: Zeroizing::new(value),
            info,
            needs_rewrite: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_aes_cbc;
    use crate::crypto::md5;

    const KEY: [u8; 32] = [0x5a; 32];

    /// Builds a legacy v2 encoding the way old store versions wrote it.
    fn encode_v2(
        version: u8,
        blob_type: BlobType,
        flags: BlobFlags,
        value: &[u8],
        info: &[u8],
        key: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut digested = Vec::new();
        digested.extend_from_slice(&(value.len() as u32).to_be_bytes());
        digested.extend_from_slice(value);
        let mut body = md5(&digested).unwrap().to_vec();
        body.extend_from_slice(&digested);

        let iv = [0x11u8; 16];
        let body = match key {
            Some(key) => encrypt_aes_cbc(key, &iv, &body).unwrap(),
            None => body,
        };

        let mut out = vec![version, blob_type as u8, flags.bits(), info.len() as u8];
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        out.extend_from_slice(info);
        out
    }

    #[test]
    fn test_plain_round_trip() {
        let blob = Blob::new(BlobType::Generic, BlobFlags::empty(), b"data".to_vec(), vec![]);
        let raw = blob.encode(None).unwrap();
        let back = Blob::decode(&raw, None).unwrap();
        assert_eq!(back.value(), b"data");
        assert_eq!(back.blob_type(), BlobType::Generic);
        assert!(!back.needs_rewrite());
    }

    #[test]
    fn test_encrypted_round_trip_with_info() {
        let blob = Blob::new(
            BlobType::DeviceKey,
            BlobFlags::ENCRYPTED,
            b"key material".to_vec(),
            b"salt!".to_vec(),
        );
        let raw = blob.encode(Some(&KEY)).unwrap();
        let back = Blob::decode(&raw, Some(&KEY)).unwrap();
        assert_eq!(back.value(), b"key material");
        assert_eq!(back.info(), b"salt!");
    }

    #[test]
    fn test_peek_reads_info_without_key() {
        let blob = Blob::new(
            BlobType::MasterKeyAes256,
            BlobFlags::ENCRYPTED,
            b"secret".to_vec(),
            b"0123456789abcdef".to_vec(),
        );
        let raw = blob.encode(Some(&KEY)).unwrap();
        let peek = Blob::peek(&raw).unwrap();
        assert_eq!(peek.blob_type, BlobType::MasterKeyAes256);
        assert_eq!(peek.info, b"0123456789abcdef");
        assert!(peek.flags.contains(BlobFlags::ENCRYPTED));
    }

    #[test]
    fn test_encrypted_without_key_is_locked() {
        let blob =
            Blob::new(BlobType::Generic, BlobFlags::ENCRYPTED, b"data".to_vec(), vec![]);
        let raw = blob.encode(Some(&KEY)).unwrap();
        assert_eq!(Blob::decode(&raw, None).unwrap_err(), Error::Locked);
    }

    #[test]
    fn test_wrong_key_is_value_corrupted() {
        let blob =
            Blob::new(BlobType::Generic, BlobFlags::ENCRYPTED, b"data".to_vec(), vec![]);
        let raw = blob.encode(Some(&KEY)).unwrap();
        let wrong = [0u8; 32];
        assert_eq!(
            Blob::decode(&raw, Some(&wrong)).unwrap_err(),
            Error::ValueCorrupted
        );
    }

    #[test]
    fn test_super_encrypted_tag_failure_is_permanent_invalidation() {
        let blob = Blob::new(
            BlobType::DeviceKey,
            BlobFlags::ENCRYPTED | BlobFlags::SUPER_ENCRYPTED,
            b"data".to_vec(),
            vec![],
        );
        let raw = blob.encode(Some(&KEY)).unwrap();
        let wrong = [0u8; 32];
        assert_eq!(
            Blob::decode(&raw, Some(&wrong)).unwrap_err(),
            Error::KeyPermanentlyInvalidated
        );
    }

    #[test]
    fn test_header_tamper_detected() {
        let blob =
            Blob::new(BlobType::Generic, BlobFlags::ENCRYPTED, b"data".to_vec(), vec![]);
        let mut raw = blob.encode(Some(&KEY)).unwrap();
        // Adding the super-encrypted bit changes the AAD, so the seal must
        // fail. The flipped flag also upgrades the error.
        raw[2] |= BlobFlags::SUPER_ENCRYPTED.bits();
        assert_eq!(
            Blob::decode(&raw, Some(&KEY)).unwrap_err(),
            Error::KeyPermanentlyInvalidated
        );
    }

    #[test]
    fn test_legacy_v2_decode_flags_rewrite() {
        let key16 = [0x5au8; 16];
        let raw = encode_v2(
            2,
            BlobType::Generic,
            BlobFlags::ENCRYPTED,
            b"legacy value",
            b"tail",
            Some(&key16),
        );
        let blob = Blob::decode(&raw, Some(&key16)).unwrap();
        assert_eq!(blob.value(), b"legacy value");
        assert_eq!(blob.info(), b"tail");
        assert!(blob.needs_rewrite());
    }

    #[test]
    fn test_pre_v2_is_encrypted_even_without_flag() {
        let key16 = [0x5au8; 16];
        let raw = encode_v2(
            1,
            BlobType::Generic,
            BlobFlags::empty(),
            b"old",
            b"",
            Some(&key16),
        );
        assert_eq!(Blob::decode(&raw, None).unwrap_err(), Error::Locked);
        assert_eq!(Blob::decode(&raw, Some(&key16)).unwrap().value(), b"old");
    }

    #[test]
    fn test_legacy_checksum_mismatch() {
        let mut raw = encode_v2(
            2,
            BlobType::Generic,
            BlobFlags::empty(),
            b"legacy value",
            b"",
            None,
        );
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert_eq!(Blob::decode(&raw, None).unwrap_err(), Error::ValueCorrupted);
    }

    #[test]
    fn test_oversized_payload_truncated() {
        let blob = Blob::new(
            BlobType::Generic,
            BlobFlags::empty(),
            vec![0xab; 40 * 1024],
            vec![],
        );
        let raw = blob.encode(None).unwrap();
        let back = Blob::decode(&raw, None).unwrap();
        assert_eq!(back.value().len(), 32 * 1024);
    }
}
