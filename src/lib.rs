// Copyright (C) Microsoft Corporation. All rights reserved.

//! On-device key management service.
//!
//! This crate keeps application keys in per-user, per-app encrypted files
//! and brokers all use of those keys through secure devices. Key material
//! stored by hardware-backed devices never leaves the device unwrapped;
//! the file store only ever holds the device's opaque key blobs, sealed
//! again under a password-derived per-user master key.
//!
//! # Architecture
//!
//! The service is layered:
//! - [`service`] is the client-facing façade: identity resolution,
//!   permission checks, and routing to the device that owns a key
//! - [`worker`] runs one thread per secure device and serializes all
//!   device traffic, including transparent blob upgrades and software
//!   fallback for algorithms the hardware lacks
//! - [`store`] owns the on-disk layout, per-user master key state, entry
//!   locking, grants, and auth token bookkeeping
//! - [`device`] defines the secure device interface and ships a
//!   software implementation of it
//! - [`enforcement`] replays the device's authorization checks for
//!   software keys

pub mod auth_token;
pub mod blob;
pub mod crypto;
pub mod device;
pub mod enforcement;
pub mod entry;
pub mod error;
pub mod grant;
pub mod operation;
pub mod service;
pub mod store;
pub mod types;
pub mod user;
pub mod worker;

pub use error::DeviceError;
pub use error::Error;
pub use error::Result;
pub use service::KeystoreService;
pub use service::Permission;
pub use service::PermissionCheck;
pub use service::UID_SELF;
pub use store::KeyStore;
