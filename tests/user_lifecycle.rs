// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use keystored::types::RequestFlags;
use keystored::user::LockState;
use keystored::Error;
use keystored::UID_SELF;

use crate::common::*;

#[test]
fn test_lock_unlock_cycle() {
    service_test(|service| {
        assert_eq!(service.state(CALLER, 0).unwrap(), LockState::Unlocked);
        service
            .insert(CALLER, UID_SELF, "sealed", b"x".to_vec(), RequestFlags::ENCRYPTED)
            .unwrap();

        service.lock(CALLER, 0).unwrap();
        assert_eq!(service.state(CALLER, 0).unwrap(), LockState::Locked);
        assert_eq!(
            service.get(CALLER, UID_SELF, "sealed").unwrap_err(),
            Error::Locked
        );

        service.unlock(CALLER, 0, PASSWORD).unwrap();
        assert_eq!(service.get(CALLER, UID_SELF, "sealed").unwrap(), b"x");
    });
}

#[test]
fn test_plain_entries_readable_while_locked() {
    service_test(|service| {
        service
            .insert(CALLER, UID_SELF, "plain", b"open".to_vec(), RequestFlags::empty())
            .unwrap();
        service.lock(CALLER, 0).unwrap();
        assert_eq!(service.get(CALLER, UID_SELF, "plain").unwrap(), b"open");
    });
}

#[test]
fn test_wrong_password_exhaustion_wipes_store() {
    service_test(|service| {
        service
            .insert(CALLER, UID_SELF, "sealed", b"x".to_vec(), RequestFlags::ENCRYPTED)
            .unwrap();
        service.lock(CALLER, 0).unwrap();

        for remaining in [3u8, 2, 1] {
            assert_eq!(
                service.unlock(CALLER, 0, "wrong").unwrap_err(),
                Error::WrongPassword { remaining }
            );
        }
        assert_eq!(
            service.unlock(CALLER, 0, "wrong").unwrap_err(),
            Error::WrongPassword { remaining: 0 }
        );
        assert_eq!(service.state(CALLER, 0).unwrap(), LockState::Uninitialized);
        assert!(!service.exist(CALLER, UID_SELF, "sealed").unwrap());
    });
}

#[test]
fn test_correct_password_resets_retry_budget() {
    service_test(|service| {
        service.lock(CALLER, 0).unwrap();
        for remaining in [3u8, 2] {
            assert_eq!(
                service.unlock(CALLER, 0, "wrong").unwrap_err(),
                Error::WrongPassword { remaining }
            );
        }
        service.unlock(CALLER, 0, PASSWORD).unwrap();
        service.lock(CALLER, 0).unwrap();
        assert_eq!(
            service.unlock(CALLER, 0, "wrong").unwrap_err(),
            Error::WrongPassword { remaining: 3 }
        );
    });
}

#[test]
fn test_password_change_reseals() {
    service_test(|service| {
        service
            .insert(CALLER, UID_SELF, "sealed", b"x".to_vec(), RequestFlags::ENCRYPTED)
            .unwrap();
        service.password_changed(CALLER, 0, "correct horse").unwrap();

        service.lock(CALLER, 0).unwrap();
        assert!(service.unlock(CALLER, 0, PASSWORD).is_err());
        service.unlock(CALLER, 0, "correct horse").unwrap();
        assert_eq!(service.get(CALLER, UID_SELF, "sealed").unwrap(), b"x");
    });
}

#[test]
fn test_cleared_password_drops_encrypted_entries() {
    service_test(|service| {
        service
            .insert(CALLER, UID_SELF, "sealed", b"x".to_vec(), RequestFlags::ENCRYPTED)
            .unwrap();
        service
            .insert(CALLER, UID_SELF, "plain", b"y".to_vec(), RequestFlags::empty())
            .unwrap();

        service.password_changed(CALLER, 0, "").unwrap();
        assert_eq!(service.state(CALLER, 0).unwrap(), LockState::Uninitialized);
        assert!(!service.exist(CALLER, UID_SELF, "sealed").unwrap());
        assert_eq!(service.get(CALLER, UID_SELF, "plain").unwrap(), b"y");
    });
}

#[test]
fn test_reset_wipes_user() {
    service_test(|service| {
        service
            .insert(CALLER, UID_SELF, "a", b"x".to_vec(), RequestFlags::ENCRYPTED)
            .unwrap();
        service.reset(CALLER, 0).unwrap();
        assert_eq!(service.state(CALLER, 0).unwrap(), LockState::Uninitialized);
        assert!(service.is_empty(CALLER, UID_SELF).unwrap());
    });
}

#[test]
fn test_profile_inherits_parent_master_key() {
    service_test(|service| {
        service.on_user_added(CALLER, 10, Some(0)).unwrap();
        assert_eq!(service.state(CALLER, 10).unwrap(), LockState::Locked);
        service.unlock(CALLER, 10, PASSWORD).unwrap();
        assert_eq!(service.state(CALLER, 10).unwrap(), LockState::Unlocked);

        service.on_user_removed(CALLER, 10).unwrap();
        assert_eq!(service.state(CALLER, 10).unwrap(), LockState::Uninitialized);
    });
}
