// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use keystored::types::Algorithm;
use keystored::types::AuthorizationSet;
use keystored::types::KeyParameter;
use keystored::types::KeyPurpose;
use keystored::types::RequestFlags;
use keystored::types::Tag;
use keystored::DeviceError;
use keystored::Error;
use keystored::UID_SELF;

use crate::common::*;

fn ec_sign_params() -> AuthorizationSet {
    AuthorizationSet::from(vec![
        KeyParameter::algorithm(Algorithm::Ec),
        KeyParameter::purpose(KeyPurpose::Sign),
        KeyParameter::new_bool(Tag::NoAuthRequired),
    ])
}

#[test]
fn test_attest_key_injects_application_id() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "attested",
                ec_sign_params(),
                Vec::new(),
                RequestFlags::empty(),
            )
            .unwrap();
        // No package identity provider is wired up; the placeholder
        // descriptor still satisfies the device's requirement.
        let chain = service
            .attest_key(CALLER, UID_SELF, "attested", AuthorizationSet::new())
            .unwrap();
        assert_eq!(chain.len(), 2);
    });
}

#[test]
fn test_attest_key_rejects_device_id_tags() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "attested",
                ec_sign_params(),
                Vec::new(),
                RequestFlags::empty(),
            )
            .unwrap();
        let params = AuthorizationSet::from(vec![KeyParameter::new_bytes(
            Tag::AttestationIdBrand,
            b"generic".to_vec(),
        )]);
        assert_eq!(
            service.attest_key(CALLER, UID_SELF, "attested", params).unwrap_err(),
            Error::Device(DeviceError::CannotAttestIds)
        );
    });
}

#[test]
fn test_attest_key_missing_alias() {
    service_test(|service| {
        assert_eq!(
            service
                .attest_key(CALLER, UID_SELF, "ghost", AuthorizationSet::new())
                .unwrap_err(),
            Error::KeyNotFound
        );
    });
}

#[test]
fn test_attest_device_ids_leaves_no_key_behind() {
    service_test(|service| {
        assert!(service.is_empty(CALLER, UID_SELF).unwrap());
        let params = AuthorizationSet::from(vec![KeyParameter::new_bytes(
            Tag::AttestationIdBrand,
            b"generic".to_vec(),
        )]);
        let chain = service.attest_device_ids(CALLER, params).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(service.is_empty(CALLER, UID_SELF).unwrap());
    });
}

#[test]
fn test_caller_supplied_app_id_rejected() {
    service_test(|service| {
        service
            .generate_key(CALLER, UID_SELF, "k", ec_sign_params(), Vec::new(), RequestFlags::empty())
            .unwrap();
        let params = AuthorizationSet::from(vec![KeyParameter::new_bytes(
            Tag::AttestationApplicationId,
            b"forged".to_vec(),
        )]);
        assert_eq!(
            service.attest_key(CALLER, UID_SELF, "k", params).unwrap_err(),
            Error::Device(DeviceError::InvalidArgument)
        );
    });
}
