// Copyright (C) Microsoft Corporation. All rights reserved.

use std::sync::Arc;
use std::sync::Once;

use keystored::device::SoftwareDevice;
use keystored::service::AllowAll;
use keystored::service::NoAttestationIds;
use keystored::service::PermissionCheck;
use keystored::types::SecurityLevel;
use keystored::KeyStore;
use keystored::KeystoreService;

/// An app uid of user 0.
pub const CALLER: u32 = 10023;

/// A second app uid of user 0.
pub const OTHER: u32 = 10100;

pub const PASSWORD: &str = "hunter2";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Runs `f` against a service over a fresh store, unlocked for user 0,
/// with every permission granted.
pub fn service_test(f: impl FnOnce(&KeystoreService)) {
    service_test_with(Box::new(AllowAll), f);
}

/// Same as [`service_test`] with an injected permission checker.
pub fn service_test_with(
    permissions: Box<dyn PermissionCheck>,
    f: impl FnOnce(&KeystoreService),
) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(KeyStore::open(dir.path()).unwrap());
    let tee = Box::new(SoftwareDevice::new(SecurityLevel::TrustedEnvironment).unwrap());
    let service = KeystoreService::new(
        store,
        tee,
        None,
        permissions,
        Box::new(NoAttestationIds),
    )
    .unwrap();
    service.unlock(CALLER, 0, PASSWORD).unwrap();
    f(&service);
}
