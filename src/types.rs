// Copyright (C) Microsoft Corporation. All rights reserved.

//! Common types for keys, authorization tags, and authentication proofs.
//!
//! This module defines the vocabulary shared by the blob store, the
//! enforcement engine, the device workers, and the service façade: key
//! purposes and algorithms, the closed set of authorization [`Tag`]s with
//! their typed values, [`AuthorizationSet`] and [`KeyCharacteristics`]
//! containers (including the binary form persisted in the characteristics
//! cache blob), and hardware authentication tokens.

use crate::error::Error;
use crate::error::Result;

/// Trust level of the device holding a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityLevel {
    /// Software fallback device, no hardware protection.
    Software,
    /// Trusted execution environment.
    TrustedEnvironment,
    /// Discrete secure element.
    Strongbox,
}

/// What an operation on a key is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyPurpose {
    /// Encrypt data.
    Encrypt = 0,
    /// Decrypt data.
    Decrypt = 1,
    /// Create a signature or MAC.
    Sign = 2,
    /// Verify a signature or MAC.
    Verify = 3,
    /// Wrap another key for secure import.
    WrapKey = 5,
}

impl KeyPurpose {
    /// Decodes a raw purpose value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(KeyPurpose::Encrypt),
            1 => Some(KeyPurpose::Decrypt),
            2 => Some(KeyPurpose::Sign),
            3 => Some(KeyPurpose::Verify),
            5 => Some(KeyPurpose::WrapKey),
            _ => None,
        }
    }
}

/// Cryptographic algorithm of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Algorithm {
    /// RSA.
    Rsa = 1,
    /// Elliptic curve (P-256).
    Ec = 3,
    /// AES.
    Aes = 32,
    /// Triple DES. Carried for policy decisions only; the software
    /// fallback never services it.
    TripleDes = 33,
    /// HMAC.
    Hmac = 128,
}

impl Algorithm {
    /// Decodes a raw algorithm value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Algorithm::Rsa),
            3 => Some(Algorithm::Ec),
            32 => Some(Algorithm::Aes),
            33 => Some(Algorithm::TripleDes),
            128 => Some(Algorithm::Hmac),
            _ => None,
        }
    }

    /// Whether the algorithm has a public half. Public-key operations
    /// short-circuit parts of authorization checking.
    pub fn is_public_key(&self) -> bool {
        matches!(self, Algorithm::Rsa | Algorithm::Ec)
    }
}

/// Digest selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Digest {
    /// No digest.
    None = 0,
    /// SHA-2 256.
    Sha256 = 4,
    /// SHA-2 512.
    Sha512 = 6,
}

/// Export/import encoding of key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyFormat {
    /// X.509 SubjectPublicKeyInfo (public keys).
    X509 = 0,
    /// PKCS#8 (asymmetric private keys).
    Pkcs8 = 1,
    /// Raw bytes (symmetric keys).
    Raw = 3,
}

/// How key material came to exist on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyOrigin {
    /// Generated on the device.
    Generated = 0,
    /// Imported in the clear.
    Imported = 2,
    /// Imported wrapped under a device key.
    SecurelyImported = 4,
}

bitflags::bitflags! {
    /// Flag byte of an on-disk blob.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct BlobFlags: u8 {
        /// Payload is encrypted under the user's master key.
        const ENCRYPTED = 1;
        /// Key lives on the software fallback device.
        const FALLBACK = 1 << 1;
        /// Payload carries an additional password-bound encryption layer.
        const SUPER_ENCRYPTED = 1 << 2;
        /// Key must survive `clear_uid` for the system identity.
        const CRITICAL_TO_DEVICE_ENCRYPTION = 1 << 3;
        /// Key lives on the discrete secure element.
        const STRONGBOX = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Flags a client passes with insert/generate/import requests.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// Store the blob encrypted under the user's master key.
        const ENCRYPTED = 1;
        /// Target the software fallback device explicitly.
        const FALLBACK = 1 << 1;
        /// Mark the key critical to device encryption.
        const CRITICAL_TO_DEVICE_ENCRYPTION = 1 << 3;
        /// Target the discrete secure element.
        const STRONGBOX = 1 << 4;
    }
}

impl RequestFlags {
    /// Maps request flags to the security level of the target device.
    pub fn security_level(&self) -> SecurityLevel {
        if self.contains(RequestFlags::STRONGBOX) {
            SecurityLevel::Strongbox
        } else if self.contains(RequestFlags::FALLBACK) {
            SecurityLevel::Software
        } else {
            SecurityLevel::TrustedEnvironment
        }
    }
}

bitflags::bitflags! {
    /// Bitmask naming the authenticator classes that may satisfy a key's
    /// authentication requirement.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HardwareAuthenticatorType: u32 {
        /// Password/PIN/pattern authenticator.
        const PASSWORD = 1;
        /// Biometric authenticator.
        const FINGERPRINT = 1 << 1;
    }
}

/// Authorization tags bound to keys and operations.
///
/// The set is closed: the enforcement engine classifies every variant as
/// either policy-relevant or benign, and anything it cannot classify is
/// rejected as an invalid key blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tag {
    /// Permitted purposes (enum, repeatable).
    Purpose = 1,
    /// Key algorithm (enum).
    Algorithm = 2,
    /// Key size in bits (uint).
    KeySize = 3,
    /// Block mode (enum, repeatable).
    BlockMode = 4,
    /// Digest (enum, repeatable).
    Digest = 5,
    /// Padding mode (enum, repeatable).
    Padding = 6,
    /// Caller may supply the nonce/IV (bool).
    CallerNonce = 7,
    /// MAC output length in bits (uint).
    MacLength = 8,
    /// Minimum seconds between operations on this key (uint).
    MinSecondsBetweenOps = 403,
    /// Maximum uses of this key per boot (uint).
    MaxUsesPerBoot = 404,
    /// Owning user id (uint).
    UserId = 501,
    /// Secure authenticator id that must vouch for use (ulong, repeatable).
    UserSecureId = 502,
    /// No authentication required (bool).
    NoAuthRequired = 503,
    /// Authenticator classes accepted (enum bitmask).
    UserAuthType = 504,
    /// Seconds an authentication remains fresh (uint).
    AuthTimeout = 505,
    /// Authentication remains valid only while the device stays on body
    /// (bool).
    AllowWhileOnBody = 506,
    /// Key only usable while the device is unlocked (bool).
    UnlockedDeviceRequired = 509,
    /// Opaque id binding a key to a client (bytes).
    ApplicationId = 601,
    /// Opaque data binding a key to client state (bytes).
    ApplicationData = 700,
    /// Creation time in ms since epoch (date).
    CreationDatetime = 701,
    /// Key origin (enum).
    Origin = 702,
    /// Key resists rollback (bool).
    RollbackResistance = 703,
    /// Key only usable by the bootloader (bool).
    BootloaderOnly = 704,
    /// Activation time in ms since epoch (date).
    ActiveDatetime = 400,
    /// Expiration for encrypt/sign purposes (date).
    OriginationExpireDatetime = 401,
    /// Expiration for decrypt/verify purposes (date).
    UsageExpireDatetime = 402,
    /// Nonce/IV for this operation (bytes).
    Nonce = 1001,
    /// DER descriptor of the requesting package (bytes). Only the service
    /// itself may add it.
    AttestationApplicationId = 709,
    /// Device brand for id attestation (bytes).
    AttestationIdBrand = 710,
    /// Device identifier for id attestation (bytes).
    AttestationIdDevice = 711,
    /// Product name for id attestation (bytes).
    AttestationIdProduct = 712,
    /// Serial number for id attestation (bytes).
    AttestationIdSerial = 713,
    /// IMEI for id attestation (bytes).
    AttestationIdImei = 714,
    /// MEID for id attestation (bytes).
    AttestationIdMeid = 715,
    /// Manufacturer for id attestation (bytes).
    AttestationIdManufacturer = 716,
    /// Model for id attestation (bytes).
    AttestationIdModel = 717,
    /// Factory reset happened since last id rotation (bool). Only the
    /// service itself may add it.
    ResetSinceIdRotation = 1004,
    /// Include a unique id in attestations (bool).
    IncludeUniqueId = 202,
    /// OS version bound into the key (uint).
    OsVersion = 705,
    /// OS patch level bound into the key (uint).
    OsPatchlevel = 706,
}

impl Tag {
    /// Decodes a raw tag value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Tag::Purpose,
            2 => Tag::Algorithm,
            3 => Tag::KeySize,
            4 => Tag::BlockMode,
            5 => Tag::Digest,
            6 => Tag::Padding,
            7 => Tag::CallerNonce,
            8 => Tag::MacLength,
            202 => Tag::IncludeUniqueId,
            400 => Tag::ActiveDatetime,
            401 => Tag::OriginationExpireDatetime,
            402 => Tag::UsageExpireDatetime,
            403 => Tag::MinSecondsBetweenOps,
            404 => Tag::MaxUsesPerBoot,
            501 => Tag::UserId,
            502 => Tag::UserSecureId,
            503 => Tag::NoAuthRequired,
            504 => Tag::UserAuthType,
            505 => Tag::AuthTimeout,
            506 => Tag::AllowWhileOnBody,
            509 => Tag::UnlockedDeviceRequired,
            601 => Tag::ApplicationId,
            700 => Tag::ApplicationData,
            701 => Tag::CreationDatetime,
            702 => Tag::Origin,
            703 => Tag::RollbackResistance,
            704 => Tag::BootloaderOnly,
            705 => Tag::OsVersion,
            706 => Tag::OsPatchlevel,
            709 => Tag::AttestationApplicationId,
            710 => Tag::AttestationIdBrand,
            711 => Tag::AttestationIdDevice,
            712 => Tag::AttestationIdProduct,
            713 => Tag::AttestationIdSerial,
            714 => Tag::AttestationIdImei,
            715 => Tag::AttestationIdMeid,
            716 => Tag::AttestationIdManufacturer,
            717 => Tag::AttestationIdModel,
            1001 => Tag::Nonce,
            1004 => Tag::ResetSinceIdRotation,
            _ => return None,
        })
    }

    /// Whether the tag requests attestation of a device identifier.
    pub fn is_device_id_attestation(&self) -> bool {
        matches!(
            self,
            Tag::AttestationIdBrand
                | Tag::AttestationIdDevice
                | Tag::AttestationIdProduct
                | Tag::AttestationIdSerial
                | Tag::AttestationIdImei
                | Tag::AttestationIdMeid
                | Tag::AttestationIdManufacturer
                | Tag::AttestationIdModel
        )
    }
}

/// Typed value carried by a [`KeyParameter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyParameterValue {
    /// Enumerated value.
    Enum(u32),
    /// 32-bit unsigned integer.
    UInt(u32),
    /// 64-bit unsigned integer.
    ULong(u64),
    /// Milliseconds since the epoch.
    Date(i64),
    /// Presence-only flag.
    Bool,
    /// Opaque byte string.
    Bytes(Vec<u8>),
}

/// One authorization tag with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParameter {
    /// The tag.
    pub tag: Tag,
    /// The value.
    pub value: KeyParameterValue,
}

impl KeyParameter {
    /// Builds an enum-valued parameter.
    pub fn new_enum(tag: Tag, value: u32) -> Self {
        Self { tag, value: KeyParameterValue::Enum(value) }
    }

    /// Builds a uint-valued parameter.
    pub fn new_uint(tag: Tag, value: u32) -> Self {
        Self { tag, value: KeyParameterValue::UInt(value) }
    }

    /// Builds a ulong-valued parameter.
    pub fn new_ulong(tag: Tag, value: u64) -> Self {
        Self { tag, value: KeyParameterValue::ULong(value) }
    }

    /// Builds a date-valued parameter.
    pub fn new_date(tag: Tag, value: i64) -> Self {
        Self { tag, value: KeyParameterValue::Date(value) }
    }

    /// Builds a presence-only parameter.
    pub fn new_bool(tag: Tag) -> Self {
        Self { tag, value: KeyParameterValue::Bool }
    }

    /// Builds a bytes-valued parameter.
    pub fn new_bytes(tag: Tag, value: Vec<u8>) -> Self {
        Self { tag, value: KeyParameterValue::Bytes(value) }
    }

    /// Convenience constructor for a purpose parameter.
    pub fn purpose(purpose: KeyPurpose) -> Self {
        Self::new_enum(Tag::Purpose, purpose as u32)
    }

    /// Convenience constructor for an algorithm parameter.
    pub fn algorithm(algorithm: Algorithm) -> Self {
        Self::new_enum(Tag::Algorithm, algorithm as u32)
    }
}

/// An ordered multiset of [`KeyParameter`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationSet(Vec<KeyParameter>);

impl AuthorizationSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a parameter.
    pub fn push(&mut self, param: KeyParameter) {
        self.0.push(param);
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the parameters.
    pub fn iter(&self) -> std::slice::Iter<'_, KeyParameter> {
        self.0.iter()
    }

    /// Whether any parameter carries `tag`.
    pub fn contains_tag(&self, tag: Tag) -> bool {
        self.0.iter().any(|p| p.tag == tag)
    }

    /// First enum value under `tag`.
    pub fn get_enum(&self, tag: Tag) -> Option<u32> {
        self.0.iter().find_map(|p| match (&p.value, p.tag == tag) {
            (KeyParameterValue::Enum(v), true) => Some(*v),
            _ => None,
        })
    }

    /// First uint value under `tag`.
    pub fn get_uint(&self, tag: Tag) -> Option<u32> {
        self.0.iter().find_map(|p| match (&p.value, p.tag == tag) {
            (KeyParameterValue::UInt(v), true) => Some(*v),
            _ => None,
        })
    }

    /// First date value under `tag`.
    pub fn get_date(&self, tag: Tag) -> Option<i64> {
        self.0.iter().find_map(|p| match (&p.value, p.tag == tag) {
            (KeyParameterValue::Date(v), true) => Some(*v),
            _ => None,
        })
    }

    /// First bytes value under `tag`.
    pub fn get_bytes(&self, tag: Tag) -> Option<&[u8]> {
        self.0.iter().find_map(|p| match (&p.value, p.tag == tag) {
            (KeyParameterValue::Bytes(v), true) => Some(v.as_slice()),
            _ => None,
        })
    }

    /// All ulong values under `tag`, in order.
    pub fn all_ulongs(&self, tag: Tag) -> Vec<u64> {
        self.0
            .iter()
            .filter_map(|p| match (&p.value, p.tag == tag) {
                (KeyParameterValue::ULong(v), true) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// All enum values under `tag`, in order.
    pub fn all_enums(&self, tag: Tag) -> Vec<u32> {
        self.0
            .iter()
            .filter_map(|p| match (&p.value, p.tag == tag) {
                (KeyParameterValue::Enum(v), true) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Key algorithm, if declared.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.get_enum(Tag::Algorithm).and_then(Algorithm::from_raw)
    }

    /// Adds all parameters from `other` that this set does not already
    /// hold (exact tag+value matches are not duplicated).
    pub fn union(&mut self, other: &AuthorizationSet) {
        for param in other.iter() {
            if !self.0.contains(param) {
                self.0.push(param.clone());
            }
        }
    }

    /// Removes all parameters that also appear (exact match) in `other`.
    pub fn subtract(&mut self, other: &AuthorizationSet) {
        self.0.retain(|p| !other.0.contains(p));
    }

    /// Keeps only parameters matching the predicate.
    pub fn retain(&mut self, f: impl Fn(&KeyParameter) -> bool) {
        self.0.retain(|p| f(p));
    }

    /// Serializes the set into `out`.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.0.len() as u32).to_be_bytes());
        for param in &self.0 {
            out.extend_from_slice(&(param.tag as u32).to_be_bytes());
            match &param.value {
                KeyParameterValue::Enum(v) => {
                    out.push(0);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                KeyParameterValue::UInt(v) => {
                    out.push(1);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                KeyParameterValue::ULong(v) => {
                    out.push(2);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                KeyParameterValue::Date(v) => {
                    out.push(3);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                KeyParameterValue::Bool => out.push(4),
                KeyParameterValue::Bytes(v) => {
                    out.push(5);
                    out.extend_from_slice(&(v.len() as u32).to_be_bytes());
                    out.extend_from_slice(v);
                }
            }
        }
    }

    /// Deserializes a set from the front of `input`, returning it and the
    /// number of bytes consumed.
    pub fn deserialize_from(input: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(input);
        let count = cursor.read_u32()?;
        let mut set = AuthorizationSet::new();
        for _ in 0..count {
            let raw_tag = cursor.read_u32()?;
            let tag = Tag::from_raw(raw_tag).ok_or(Error::ValueCorrupted)?;
            let kind = cursor.read_u8()?;
            let value = match kind {
                0 => KeyParameterValue::Enum(cursor.read_u32()?),
                1 => KeyParameterValue::UInt(cursor.read_u32()?),
                2 => KeyParameterValue::ULong(cursor.read_u64()?),
                3 => KeyParameterValue::Date(cursor.read_u64()? as i64),
                4 => KeyParameterValue::Bool,
                5 => {
                    let len = cursor.read_u32()? as usize;
                    KeyParameterValue::Bytes(cursor.read_bytes(len)?.to_vec())
                }
                _ => return Err(Error::ValueCorrupted),
            };
            set.push(KeyParameter { tag, value });
        }
        Ok((set, cursor.consumed()))
    }
}

impl From<Vec<KeyParameter>> for AuthorizationSet {
    fn from(params: Vec<KeyParameter>) -> Self {
        Self(params)
    }
}

impl<'a> IntoIterator for &'a AuthorizationSet {
    type Item = &'a KeyParameter;
    type IntoIter = std::slice::Iter<'a, KeyParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The enforced authorization tags of a key, split by which component
/// vouches for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCharacteristics {
    /// Tags enforced inside the secure device.
    pub hardware_enforced: AuthorizationSet,
    /// Tags enforced by this service.
    pub software_enforced: AuthorizationSet,
}

impl KeyCharacteristics {
    /// Both tag sets flattened into one, hardware first.
    pub fn all(&self) -> AuthorizationSet {
        let mut all = self.hardware_enforced.clone();
        for param in self.software_enforced.iter() {
            all.push(param.clone());
        }
        all
    }

    /// Serializes both sets for the characteristics cache blob.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.hardware_enforced.serialize_into(&mut out);
        self.software_enforced.serialize_into(&mut out);
        out
    }

    /// Parses the characteristics cache blob payload.
    pub fn deserialize(input: &[u8]) -> Result<Self> {
        let (hardware_enforced, used) = AuthorizationSet::deserialize_from(input)?;
        let (software_enforced, _) = AuthorizationSet::deserialize_from(&input[used..])?;
        Ok(Self { hardware_enforced, software_enforced })
    }
}

/// A signed proof of user authentication from a secure authenticator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareAuthToken {
    /// Challenge the proof was issued against (operation handle for
    /// per-operation authentication, otherwise 0).
    pub challenge: u64,
    /// Secure user id the proof vouches for.
    pub user_id: u64,
    /// Secure id of the authenticator instance.
    pub authenticator_id: u64,
    /// Class of the authenticator.
    pub authenticator_type: HardwareAuthenticatorType,
    /// Authentication time in milliseconds since boot.
    pub timestamp_ms: u64,
    /// MAC over the token fields, keyed inside the secure environment.
    pub mac: Vec<u8>,
}

/// Bounds-checked big-endian reader used by the deserializers.
struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::ValueCorrupted)?;
        let slice = self.input.get(self.pos..end).ok_or(Error::ValueCorrupted)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }
}
