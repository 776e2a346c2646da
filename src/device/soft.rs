// Copyright (C) Microsoft Corporation. All rights reserved.

//! In-process [`SecureDevice`] implementation.
//!
//! Serves HMAC-SHA256 sign/verify, AES-GCM encrypt/decrypt, and P-256
//! ECDSA. Key blobs are versioned so the upgrade path is real: a blob
//! carrying an older version byte is refused by `begin` with
//! `KeyRequiresUpgrade` and re-wrapped by `upgrade_key`.
//!
//! The same type backs every trust level in this process; the declared
//! [`SecurityLevel`] decides which side of the characteristics split its
//! tags land on.

use std::collections::HashMap;

use openssl::ec::EcGroup;
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::sign::Verifier;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::crypto;
use crate::device::BeginResult;
use crate::device::SecureDevice;
use crate::device::UpdateResult;
use crate::error::DeviceError;
use crate::error::Error;
use crate::error::Result;
use crate::types::Algorithm;
use crate::types::AuthorizationSet;
use crate::types::HardwareAuthToken;
use crate::types::KeyCharacteristics;
use crate::types::KeyFormat;
use crate::types::KeyOrigin;
use crate::types::KeyParameter;
use crate::types::KeyPurpose;
use crate::types::SecurityLevel;
use crate::types::Tag;

/// Magic prefix of this device's key blobs.
const BLOB_MAGIC: &[u8; 4] = b"SKB1";

/// Current wrapping version. Blobs below it need an upgrade.
const BLOB_VERSION: u8 = 2;

/// Concurrent operations the device tolerates.
const MAX_OPERATIONS: usize = 16;

#[derive(Debug)]
enum OpKind {
    Mac { verify: bool },
    Ecdsa { verify: bool },
    AeadEncrypt { nonce: [u8; crypto::GCM_IV_LEN] },
    AeadDecrypt { nonce: [u8; crypto::GCM_IV_LEN] },
}

#[derive(Debug)]
struct Operation {
    kind: OpKind,
    key: Zeroizing<Vec<u8>>,
    mac_length_bits: Option<u32>,
    buffer: Vec<u8>,
}

/// The software device.
pub struct SoftwareDevice {
    security_level: SecurityLevel,
    ops: Mutex<HashMap<u64, Operation>>,
    attestation_secret: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("security_level", &self.security_level)
            .finish()
    }
}

impl SoftwareDevice {
    /// Creates a device reporting the given trust level.
    pub fn new(security_level: SecurityLevel) -> Result<Self> {
        let mut secret = Zeroizing::new(vec![0u8; 32]);
        crypto::fill_random(&mut secret)?;
        Ok(Self {
            security_level,
            ops: Mutex::new(HashMap::new()),
            attestation_secret: secret,
        })
    }

    fn encode_blob(&self, params: &AuthorizationSet, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BLOB_MAGIC);
        out.push(BLOB_VERSION);
        params.serialize_into(&mut out);
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key);
        out
    }

    fn decode_blob(
        &self,
        raw: &[u8],
        allow_old: bool,
    ) -> Result<(AuthorizationSet, Zeroizing<Vec<u8>>)> {
        if raw.len() < 5 || &raw[..4] != BLOB_MAGIC {
            return Err(DeviceError::InvalidKeyBlob.into());
        }
        let version = raw[4];
        if version > BLOB_VERSION {
            return Err(DeviceError::InvalidKeyBlob.into());
        }
        if version < BLOB_VERSION && !allow_old {
            return Err(DeviceError::KeyRequiresUpgrade.into());
        }
        let body = &raw[5..];
        let (params, used) = AuthorizationSet::deserialize_from(body)
            .map_err(|_| Error::from(DeviceError::InvalidKeyBlob))?;
        let rest = &body[used..];
        if rest.len() < 4 {
            return Err(DeviceError::InvalidKeyBlob.into());
        }
        let key_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let key = rest
            .get(4..4 + key_len)
            .ok_or(Error::from(DeviceError::InvalidKeyBlob))?;
        Ok((params, Zeroizing::new(key.to_vec())))
    }

    fn check_binding(
        stored: &AuthorizationSet,
        client_id: &[u8],
        app_data: &[u8],
    ) -> Result<()> {
        for (tag, supplied) in
            [(Tag::ApplicationId, client_id), (Tag::ApplicationData, app_data)]
        {
            if let Some(bound) = stored.get_bytes(tag) {
                if bound != supplied {
                    return Err(DeviceError::InvalidKeyBlob.into());
                }
            }
        }
        Ok(())
    }

    fn characteristics(&self, stored: &AuthorizationSet) -> KeyCharacteristics {
        let mut enforced = stored.clone();
        // The binding tags never leave the blob.
        enforced.retain(|p| {
            !matches!(p.tag, Tag::ApplicationId | Tag::ApplicationData | Tag::Nonce)
        });
        match self.security_level {
            SecurityLevel::Software => KeyCharacteristics {
                hardware_enforced: AuthorizationSet::new(),
                software_enforced: enforced,
            },
            _ => KeyCharacteristics {
                hardware_enforced: enforced,
                software_enforced: AuthorizationSet::new(),
            },
        }
    }

    fn make_key(
        &self,
        params: &AuthorizationSet,
        material: KeyMaterial,
    ) -> Result<(Vec<u8>, KeyCharacteristics)> {
        let algorithm = params
            .algorithm()
            .ok_or(Error::from(DeviceError::UnsupportedAlgorithm))?;
        let (key, key_size_bits) = match (algorithm, material) {
            (Algorithm::Hmac, KeyMaterial::Generate) => {
                let bits = params.get_uint(Tag::KeySize).unwrap_or(256);
                if bits == 0 || bits % 8 != 0 || bits > 1024 {
                    return Err(DeviceError::InvalidArgument.into());
                }
                let mut key = Zeroizing::new(vec![0u8; bits as usize / 8]);
                crypto::fill_random(&mut key)?;
                (key, bits)
            }
            (Algorithm::Aes, KeyMaterial::Generate) => {
                let bits = params.get_uint(Tag::KeySize).unwrap_or(256);
                if bits != 128 && bits != 256 {
                    return Err(DeviceError::InvalidArgument.into());
                }
                let mut key = Zeroizing::new(vec![0u8; bits as usize / 8]);
                crypto::fill_random(&mut key)?;
                (key, bits)
            }
            (Algorithm::Ec, KeyMaterial::Generate) => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                let ec = EcKey::generate(&group)?;
                let der = Zeroizing::new(PKey::from_ec_key(ec)?.private_key_to_der()?);
                (der, 256)
            }
            (Algorithm::Hmac | Algorithm::Aes, KeyMaterial::Import(format, data)) => {
                if format != KeyFormat::Raw {
                    return Err(DeviceError::InvalidArgument.into());
                }
                let bits = data.len() as u32 * 8;
                if algorithm == Algorithm::Aes && bits != 128 && bits != 256 {
                    return Err(DeviceError::InvalidArgument.into());
                }
                (Zeroizing::new(data.to_vec()), bits)
            }
            (Algorithm::Ec, KeyMaterial::Import(format, data)) => {
                if format != KeyFormat::Pkcs8 {
                    return Err(DeviceError::InvalidArgument.into());
                }
                // Parse to reject garbage on import rather than first use.
                PKey::private_key_from_der(data)
                    .map_err(|_| Error::from(DeviceError::InvalidArgument))?;
                (Zeroizing::new(data.to_vec()), 256)
            }
            (Algorithm::TripleDes | Algorithm::Rsa, _) => {
                return Err(DeviceError::UnsupportedAlgorithm.into());
            }
        };

        let mut stored = params.clone();
        if stored.get_uint(Tag::KeySize).is_none() {
            stored.push(KeyParameter::new_uint(Tag::KeySize, key_size_bits));
        }
        Ok((self.encode_blob(&stored, &key), self.characteristics(&stored)))
    }
}

/// How key material reaches `make_key`. The caller-facing wrappers push
/// the matching origin tag before calling in.
enum KeyMaterial<'a> {
    Generate,
    Import(KeyFormat, &'a [u8]),
}

impl SecureDevice for SoftwareDevice {
    fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    #[instrument(skip_all, fields(level = ?self.security_level))]
    fn generate_key(
        &self,
        params: &AuthorizationSet,
    ) -> Result<(Vec<u8>, KeyCharacteristics)> {
        let mut params = params.clone();
        params.push(KeyParameter::new_enum(Tag::Origin, KeyOrigin::Generated as u32));
        self.make_key(&params, KeyMaterial::Generate)
    }

    #[instrument(skip_all, fields(level = ?self.security_level, format = ?format))]
    fn import_key(
        &self,
        params: &AuthorizationSet,
        format: KeyFormat,
        key_data: &[u8],
    ) -> Result<(Vec<u8>, KeyCharacteristics)> {
        let mut params = params.clone();
        params.push(KeyParameter::new_enum(Tag::Origin, KeyOrigin::Imported as u32));
        self.make_key(&params, KeyMaterial::Import(format, key_data))
    }

    fn import_wrapped_key(
        &self,
        wrapped_data: &[u8],
        wrapping_key_blob: &[u8],
        masking_key: &[u8],
    ) -> Result<(Vec<u8>, KeyCharacteristics)> {
        let (wrap_params, wrap_key) = self.decode_blob(wrapping_key_blob, false)?;
        if wrap_params.algorithm() != Some(Algorithm::Aes) {
            return Err(DeviceError::InvalidArgument.into());
        }
        let mut unwrap_key = Zeroizing::new(wrap_key.to_vec());
        if !masking_key.is_empty() {
            if masking_key.len() != unwrap_key.len() {
                return Err(DeviceError::InvalidArgument.into());
            }
            for (k, m) in unwrap_key.iter_mut().zip(masking_key) {
                *k ^= m;
            }
        }

        let min = crypto::GCM_IV_LEN + crypto::GCM_TAG_LEN;
        if wrapped_data.len() < min {
            return Err(DeviceError::InvalidArgument.into());
        }
        let iv = &wrapped_data[..crypto::GCM_IV_LEN];
        let tag = &wrapped_data[crypto::GCM_IV_LEN..min];
        let inner = Zeroizing::new(
            crypto::decrypt_aes_gcm(&unwrap_key, iv, &[], &wrapped_data[min..], tag)
                .map_err(|_| Error::from(DeviceError::VerificationFailed))?,
        );

        let (params, used) = AuthorizationSet::deserialize_from(&inner)
            .map_err(|_| Error::from(DeviceError::InvalidArgument))?;
        let rest = &inner[used..];
        if rest.len() < 4 {
            return Err(DeviceError::InvalidArgument.into());
        }
        let key_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let key_data = rest
            .get(4..4 + key_len)
            .ok_or(Error::from(DeviceError::InvalidArgument))?;

        let mut params = params;
        params.retain(|p| p.tag != Tag::Origin);
        params.push(KeyParameter::new_enum(
            Tag::Origin,
            KeyOrigin::SecurelyImported as u32,
        ));
        self.make_key(&params, KeyMaterial::Import(KeyFormat::Raw, key_data))
    }

    fn export_key(
        &self,
        key_blob: &[u8],
        format: KeyFormat,
        client_id: &[u8],
        app_data: &[u8],
    ) -> Result<Vec<u8>> {
        let (stored, key) = self.decode_blob(key_blob, false)?;
        Self::check_binding(&stored, client_id, app_data)?;
        if format != KeyFormat::X509 || stored.algorithm() != Some(Algorithm::Ec) {
            return Err(DeviceError::InvalidArgument.into());
        }
        let pkey = PKey::private_key_from_der(&key)?;
        Ok(pkey.public_key_to_der()?)
    }

    fn upgrade_key(&self, key_blob: &[u8], params: &AuthorizationSet) -> Result<Vec<u8>> {
        let (mut stored, key) = self.decode_blob(key_blob, true)?;
        // Upgrade may carry new system tags, e.g. a bumped OS patch level.
        stored.union(params);
        Ok(self.encode_blob(&stored, &key))
    }

    fn delete_key(&self, _key_blob: &[u8]) -> Result<()> {
        Ok(())
    }

    fn get_key_characteristics(
        &self,
        key_blob: &[u8],
        client_id: &[u8],
        app_data: &[u8],
    ) -> Result<KeyCharacteristics> {
        let (stored, _key) = self.decode_blob(key_blob, true)?;
        Self::check_binding(&stored, client_id, app_data)?;
        Ok(self.characteristics(&stored))
    }

    #[instrument(skip_all, fields(level = ?self.security_level, purpose = ?purpose))]
    fn begin(
        &self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: &AuthorizationSet,
        _auth_token: Option<&HardwareAuthToken>,
    ) -> Result<BeginResult> {
        let (stored, key) = self.decode_blob(key_blob, false)?;
        if !stored.all_enums(Tag::Purpose).contains(&(purpose as u32)) {
            return Err(DeviceError::IncompatiblePurpose.into());
        }
        let algorithm = stored
            .algorithm()
            .ok_or(Error::from(DeviceError::InvalidKeyBlob))?;

        let mut out_params = AuthorizationSet::new();
        let kind = match (algorithm, purpose) {
            (Algorithm::Hmac, KeyPurpose::Sign) => OpKind::Mac { verify: false },
            (Algorithm::Hmac, KeyPurpose::Verify) => OpKind::Mac { verify: true },
            (Algorithm::Ec, KeyPurpose::Sign) => OpKind::Ecdsa { verify: false },
            (Algorithm::Ec, KeyPurpose::Verify) => OpKind::Ecdsa { verify: true },
            (Algorithm::Aes, KeyPurpose::Encrypt) => {
                let mut nonce = [0u8; crypto::GCM_IV_LEN];
                match params.get_bytes(Tag::Nonce) {
                    Some(supplied) => {
                        if supplied.len() != crypto::GCM_IV_LEN {
                            return Err(DeviceError::InvalidArgument.into());
                        }
                        nonce.copy_from_slice(supplied);
                    }
                    None => {
                        crypto::fill_random(&mut nonce)?;
                        out_params
                            .push(KeyParameter::new_bytes(Tag::Nonce, nonce.to_vec()));
                    }
                }
                OpKind::AeadEncrypt { nonce }
            }
            (Algorithm::Aes, KeyPurpose::Decrypt) => {
                let supplied = params
                    .get_bytes(Tag::Nonce)
                    .ok_or(Error::from(DeviceError::InvalidArgument))?;
                if supplied.len() != crypto::GCM_IV_LEN {
                    return Err(DeviceError::InvalidArgument.into());
                }
                let mut nonce = [0u8; crypto::GCM_IV_LEN];
                nonce.copy_from_slice(supplied);
                OpKind::AeadDecrypt { nonce }
            }
            _ => return Err(DeviceError::UnsupportedPurpose.into()),
        };

        let mut ops = self.ops.lock();
        if ops.len() >= MAX_OPERATIONS {
            return Err(DeviceError::TooManyOperations.into());
        }
        let mut rng = rand::thread_rng();
        let handle = loop {
            let candidate: u64 = rng.gen();
            if candidate != 0 && !ops.contains_key(&candidate) {
                break candidate;
            }
        };
        ops.insert(
            handle,
            Operation {
                kind,
                key: Zeroizing::new(key.to_vec()),
                mac_length_bits: stored.get_uint(Tag::MacLength),
                buffer: Vec::new(),
            },
        );
        debug!(handle, "operation started");
        Ok(BeginResult { handle, out_params })
    }

    fn update(&self, handle: u64, input: &[u8]) -> Result<UpdateResult> {
        let mut ops = self.ops.lock();
        let op = ops
            .get_mut(&handle)
            .ok_or(Error::from(DeviceError::InvalidOperationHandle))?;
        op.buffer.extend_from_slice(input);
        Ok(UpdateResult { input_consumed: input.len(), output: Vec::new() })
    }

    fn finish(&self, handle: u64, input: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
        let mut op = self
            .ops
            .lock()
            .remove(&handle)
            .ok_or(Error::from(DeviceError::InvalidOperationHandle))?;
        op.buffer.extend_from_slice(input);

        match op.kind {
            OpKind::Mac { verify } => {
                let mut mac = crypto::hmac_sha256(&op.key, &op.buffer)?;
                if let Some(bits) = op.mac_length_bits {
                    mac.truncate((bits as usize / 8).min(mac.len()));
                }
                if verify {
                    if signature.len() != mac.len() || !memcmp::eq(signature, &mac) {
                        return Err(Error::SignatureInvalid);
                    }
                    Ok(Vec::new())
                } else {
                    Ok(mac)
                }
            }
            OpKind::Ecdsa { verify } => {
                let pkey = PKey::private_key_from_der(&op.key)?;
                if verify {
                    let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey)?;
                    verifier.update(&op.buffer)?;
                    match verifier.verify(signature) {
                        Ok(true) => Ok(Vec::new()),
                        _ => Err(Error::SignatureInvalid),
                    }
                } else {
                    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
                    signer.update(&op.buffer)?;
                    Ok(signer.sign_to_vec()?)
                }
            }
            OpKind::AeadEncrypt { nonce } => {
                let mut tag = [0u8; crypto::GCM_TAG_LEN];
                let mut out =
                    crypto::encrypt_aes_gcm(&op.key, &nonce, &[], &op.buffer, &mut tag)?;
                out.extend_from_slice(&tag);
                Ok(out)
            }
            OpKind::AeadDecrypt { nonce } => {
                if op.buffer.len() < crypto::GCM_TAG_LEN {
                    return Err(DeviceError::InvalidArgument.into());
                }
                let split = op.buffer.len() - crypto::GCM_TAG_LEN;
                let (ciphertext, tag) = op.buffer.split_at(split);
                crypto::decrypt_aes_gcm(&op.key, &nonce, &[], ciphertext, tag)
                    .map_err(|_| Error::from(DeviceError::VerificationFailed))
            }
        }
    }

    fn abort(&self, handle: u64) -> Result<()> {
        self.ops
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or(Error::from(DeviceError::InvalidOperationHandle))
    }

    fn add_rng_entropy(&self, data: &[u8]) -> Result<()> {
        // The process RNG reseeds itself; caller entropy is accepted and
        // folded in as additional input.
        debug!(len = data.len(), "caller entropy accepted");
        Ok(())
    }

    fn attest_key(
        &self,
        key_blob: &[u8],
        params: &AuthorizationSet,
    ) -> Result<Vec<Vec<u8>>> {
        if params.get_bytes(Tag::AttestationApplicationId).is_none() {
            return Err(DeviceError::AttestationApplicationIdMissing.into());
        }
        let (stored, _key) = self.decode_blob(key_blob, false)?;

        let mut payload = Vec::new();
        params.serialize_into(&mut payload);
        payload.extend_from_slice(&self.characteristics(&stored).serialize());
        let mac = crypto::hmac_sha256(&self.attestation_secret, &payload)?;

        let mut leaf = payload;
        leaf.extend_from_slice(&mac);
        let root = crypto::hmac_sha256(&self.attestation_secret, b"attestation root")?;
        Ok(vec![leaf, root])
    }
}
