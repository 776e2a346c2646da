// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use keystored::entry::KeyEntry;
use keystored::types::Algorithm;
use keystored::types::AuthorizationSet;
use keystored::types::BlobFlags;
use keystored::types::KeyParameter;
use keystored::types::KeyPurpose;
use keystored::types::RequestFlags;
use keystored::types::Tag;
use keystored::DeviceError;
use keystored::Error;
use keystored::UID_SELF;

use crate::common::*;

fn hmac_params() -> AuthorizationSet {
    AuthorizationSet::from(vec![
        KeyParameter::algorithm(Algorithm::Hmac),
        KeyParameter::purpose(KeyPurpose::Sign),
        KeyParameter::new_bool(Tag::NoAuthRequired),
    ])
}

#[test]
fn test_explicit_fallback_target() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "soft-key",
                hmac_params(),
                Vec::new(),
                RequestFlags::FALLBACK,
            )
            .unwrap();

        // The stored blob carries the fallback marker and later
        // operations are routed back to that device by the marker alone.
        let peek = service.store().peek(&KeyEntry::new(CALLER, "soft-key")).unwrap();
        assert!(peek.flags.contains(BlobFlags::FALLBACK));

        let begin = service
            .begin(
                CALLER,
                UID_SELF,
                "soft-key",
                KeyPurpose::Sign,
                AuthorizationSet::new(),
                Vec::new(),
            )
            .unwrap();
        let mac = service.finish(CALLER, begin.token, b"m".to_vec(), Vec::new()).unwrap();
        assert_eq!(mac.len(), 32);
    });
}

#[test]
fn test_default_target_is_trusted_environment() {
    service_test(|service| {
        service
            .generate_key(
                CALLER,
                UID_SELF,
                "tee-key",
                hmac_params(),
                Vec::new(),
                RequestFlags::empty(),
            )
            .unwrap();
        let peek = service.store().peek(&KeyEntry::new(CALLER, "tee-key")).unwrap();
        assert!(!peek.flags.contains(BlobFlags::FALLBACK));
        assert!(!peek.flags.contains(BlobFlags::STRONGBOX));
    });
}

#[test]
fn test_strongbox_unavailable() {
    service_test(|service| {
        assert_eq!(
            service
                .generate_key(
                    CALLER,
                    UID_SELF,
                    "sb-key",
                    hmac_params(),
                    Vec::new(),
                    RequestFlags::STRONGBOX,
                )
                .unwrap_err(),
            Error::Device(DeviceError::HardwareTypeUnavailable)
        );
    });
}
