// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use keystored::types::Algorithm;
use keystored::types::AuthorizationSet;
use keystored::types::KeyFormat;
use keystored::types::KeyParameter;
use keystored::types::KeyPurpose;
use keystored::types::RequestFlags;
use keystored::types::Tag;
use keystored::DeviceError;
use keystored::Error;
use keystored::KeystoreService;
use keystored::UID_SELF;

use crate::common::*;

fn hmac_params() -> AuthorizationSet {
    AuthorizationSet::from(vec![
        KeyParameter::algorithm(Algorithm::Hmac),
        KeyParameter::purpose(KeyPurpose::Sign),
        KeyParameter::purpose(KeyPurpose::Verify),
        KeyParameter::new_bool(Tag::NoAuthRequired),
    ])
}

fn ec_params() -> AuthorizationSet {
    AuthorizationSet::from(vec![
        KeyParameter::algorithm(Algorithm::Ec),
        KeyParameter::purpose(KeyPurpose::Sign),
        KeyParameter::purpose(KeyPurpose::Verify),
        KeyParameter::new_bool(Tag::NoAuthRequired),
    ])
}

fn run_to_completion(
    service: &KeystoreService,
    alias: &str,
    purpose: KeyPurpose,
    input: &[u8],
    signature: &[u8],
) -> keystored::Result<Vec<u8>> {
    let begin = service.begin(
        CALLER,
        UID_SELF,
        alias,
        purpose,
        AuthorizationSet::new(),
        Vec::new(),
    )?;
    assert!(!begin.op_auth_needed);
    service.update(CALLER, begin.token, input.to_vec())?;
    service.finish(CALLER, begin.token, Vec::new(), signature.to_vec())
}

#[test]
fn test_generate_sign_verify() {
    service_test(|service| {
        let chars = service
            .generate_key(
                CALLER,
                UID_SELF,
                "mac-key",
                hmac_params(),
                Vec::new(),
                RequestFlags::ENCRYPTED,
            )
            .unwrap();
        assert!(chars.hardware_enforced.contains_tag(Tag::Origin));

        let mac =
            run_to_completion(service, "mac-key", KeyPurpose::Sign, b"message", &[]).unwrap();
        assert_eq!(mac.len(), 32);
        run_to_completion(service, "mac-key", KeyPurpose::Verify, b"message", &mac).unwrap();

        let mut tampered = mac;
        tampered[0] ^= 1;
        assert_eq!(
            run_to_completion(service, "mac-key", KeyPurpose::Verify, b"message", &tampered)
                .unwrap_err(),
            Error::SignatureInvalid
        );
    });
}

#[test]
fn test_finished_token_is_spent() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "k",
                hmac_params(),
                Vec::new(),
                RequestFlags::empty(),
            )
            .unwrap();
        let begin = service
            .begin(CALLER, UID_SELF, "k", KeyPurpose::Sign, AuthorizationSet::new(), Vec::new())
            .unwrap();
        service.finish(CALLER, begin.token, b"m".to_vec(), Vec::new()).unwrap();
        assert_eq!(
            service.abort(CALLER, begin.token).unwrap_err(),
            Error::Device(DeviceError::InvalidOperationHandle)
        );
    });
}

#[test]
fn test_abort_discards_operation() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "k",
                hmac_params(),
                Vec::new(),
                RequestFlags::empty(),
            )
            .unwrap();
        let begin = service
            .begin(CALLER, UID_SELF, "k", KeyPurpose::Sign, AuthorizationSet::new(), Vec::new())
            .unwrap();
        service.abort(CALLER, begin.token).unwrap();
        assert_eq!(
            service.update(CALLER, begin.token, Vec::new()).unwrap_err(),
            Error::Device(DeviceError::InvalidOperationHandle)
        );
    });
}

#[test]
fn test_unknown_token() {
    service_test(|service| {
        assert_eq!(
            service.update(CALLER, 12345, Vec::new()).unwrap_err(),
            Error::Device(DeviceError::InvalidOperationHandle)
        );
    });
}

#[test]
fn test_max_uses_per_boot() {
    service_test(|service| {
        let mut params = hmac_params();
        params.push(KeyParameter::new_uint(Tag::MaxUsesPerBoot, 1));
        service
            .generate_key(CALLER, UID_SELF, "once", params, Vec::new(), RequestFlags::empty())
            .unwrap();

        let begin = service
            .begin(
                CALLER,
                UID_SELF,
                "once",
                KeyPurpose::Sign,
                AuthorizationSet::new(),
                Vec::new(),
            )
            .unwrap();
        service.finish(CALLER, begin.token, b"m".to_vec(), Vec::new()).unwrap();
        assert_eq!(
            service
                .begin(
                    CALLER,
                    UID_SELF,
                    "once",
                    KeyPurpose::Sign,
                    AuthorizationSet::new(),
                    Vec::new()
                )
                .unwrap_err(),
            Error::Device(DeviceError::KeyMaxOpsExceeded)
        );
    });
}

#[test]
fn test_export_public_key() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "ec",
                ec_params(),
                Vec::new(),
                RequestFlags::ENCRYPTED,
            )
            .unwrap();
        let der = service
            .export_key(CALLER, UID_SELF, "ec", KeyFormat::X509, Vec::new(), Vec::new())
            .unwrap();
        assert!(!der.is_empty());
    });
}

#[test]
fn test_import_and_use() {
    service_test(|service| {
        service
            .import_key(
                CALLER,
                UID_SELF,
                "imported",
                hmac_params(),
                KeyFormat::Raw,
                vec![0x42; 32],
                RequestFlags::empty(),
            )
            .unwrap();
        let mac =
            run_to_completion(service, "imported", KeyPurpose::Sign, b"m", &[]).unwrap();
        assert_eq!(mac.len(), 32);
    });
}

#[test]
fn test_characteristics_are_stable_across_reads() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "k",
                hmac_params(),
                Vec::new(),
                RequestFlags::empty(),
            )
            .unwrap();
        let first = service
            .get_key_characteristics(CALLER, UID_SELF, "k", Vec::new(), Vec::new())
            .unwrap();
        let second = service
            .get_key_characteristics(CALLER, UID_SELF, "k", Vec::new(), Vec::new())
            .unwrap();
        assert_eq!(first, second);
    });
}

#[test]
fn test_generic_entry_is_not_a_key() {
    service_test(|service| {
        service
            .insert(CALLER, UID_SELF, "blob", b"data".to_vec(), RequestFlags::empty())
            .unwrap();
        assert!(service
            .begin(
                CALLER,
                UID_SELF,
                "blob",
                KeyPurpose::Sign,
                AuthorizationSet::new(),
                Vec::new()
            )
            .is_err());
    });
}

#[test]
fn test_entropy_cap() {
    service_test(|service| {
        service.add_rng_entropy(CALLER, vec![1, 2, 3]).unwrap();
        assert_eq!(
            service.add_rng_entropy(CALLER, vec![0; 4096]).unwrap_err(),
            Error::Device(DeviceError::InvalidArgument)
        );
    });
}

#[test]
fn test_critical_flag_reserved_for_system() {
    service_test(|service| {
        assert_eq!(
            service
                .generate_key(
                    CALLER,
                    UID_SELF,
                    "vold",
                    hmac_params(),
                    Vec::new(),
                    RequestFlags::CRITICAL_TO_DEVICE_ENCRYPTION,
                )
                .unwrap_err(),
            Error::PermissionDenied
        );
    });
}

#[test]
fn test_generate_refuses_existing_alias() {
    service_test(|service| {
        service
            .generate_key(CALLER, UID_SELF, "dup", hmac_params(), Vec::new(), RequestFlags::empty())
            .unwrap();
        assert_eq!(
            service
                .generate_key(
                    CALLER,
                    UID_SELF,
                    "dup",
                    ec_params(),
                    Vec::new(),
                    RequestFlags::empty(),
                )
                .unwrap_err(),
            Error::KeyAlreadyExists
        );
        assert_eq!(
            service
                .import_key(
                    CALLER,
                    UID_SELF,
                    "dup",
                    hmac_params(),
                    KeyFormat::Raw,
                    vec![0x5a; 32],
                    RequestFlags::empty(),
                )
                .unwrap_err(),
            Error::KeyAlreadyExists
        );
        // The first key is untouched and still signs.
        let begin = service
            .begin(CALLER, UID_SELF, "dup", KeyPurpose::Sign, AuthorizationSet::new(), Vec::new())
            .unwrap();
        service.finish(CALLER, begin.token, b"m".to_vec(), Vec::new()).unwrap();
    });
}

#[test]
fn test_wrapped_import_rejects_wrapping_alias_as_target() {
    service_test(|service| {
        service
            .generate_key(CALLER, UID_SELF, "wrap", hmac_params(), Vec::new(), RequestFlags::empty())
            .unwrap();
        assert_eq!(
            service
                .import_wrapped_key(
                    CALLER,
                    "wrap",
                    "wrap",
                    vec![0; 16],
                    vec![0; 32],
                    RequestFlags::empty(),
                )
                .unwrap_err(),
            Error::Device(DeviceError::InvalidArgument)
        );
    });
}

#[test]
fn test_operation_ceiling_prunes_oldest() {
    service_test(|service| {
        service
            .generate_key(CALLER, UID_SELF, "busy", hmac_params(), Vec::new(), RequestFlags::empty())
            .unwrap();
        let mut tokens = Vec::new();
        for _ in 0..keystored::operation::MAX_OPERATIONS {
            let begin = service
                .begin(
                    CALLER,
                    UID_SELF,
                    "busy",
                    KeyPurpose::Sign,
                    AuthorizationSet::new(),
                    Vec::new(),
                )
                .unwrap();
            tokens.push(begin.token);
        }
        // At the ceiling the oldest pruneable operation gives way.
        let extra = service
            .begin(CALLER, UID_SELF, "busy", KeyPurpose::Sign, AuthorizationSet::new(), Vec::new())
            .unwrap();
        service.finish(CALLER, extra.token, b"m".to_vec(), Vec::new()).unwrap();
        assert_eq!(
            service.update(CALLER, tokens[0], b"x".to_vec()).unwrap_err(),
            Error::Device(DeviceError::InvalidOperationHandle)
        );
    });
}
