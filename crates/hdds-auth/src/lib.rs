// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PKI-DH authentication plugin core for DDS Security v1.1.
//!
//! Implements the identity-validation and mutual-authentication subsystem
//! two DDS participants use to establish trust and derive a shared secret
//! before exchanging secure data:
//!
//! - **Identity validation** -- X.509 credential loading and verification,
//!   trusted-CA directories, CRLs, certificate-derived (adjusted) GUIDs
//! - **Handshake** -- the three-message PKI-DH exchange
//!   (Request / Reply / Final) with RSASSA-PSS / ECDSA signatures and
//!   MODP-2048-256 / ECDH P-256 key agreement
//! - **Object registry** -- handle-keyed identity and handshake objects
//!   with typed lookups and deterministic teardown
//! - **Expiry dispatch** -- listener callbacks when certificates reach
//!   their notAfter time
//!
//! The wire transport, access control, and cryptographic transforms are
//! external collaborators: tokens enter and leave this crate as named
//! property sequences, permissions documents pass through opaquely, and
//! the derived shared secret is exposed only as an opaque reference.
//!
//! # Usage
//!
//! ```ignore
//! use hdds_auth::{Authentication, Property, GUID};
//!
//! let auth = Authentication::new();
//! let qos = vec![
//!     Property::new("dds.sec.auth.identity_certificate", "file:certs/participant1.pem"),
//!     Property::new("dds.sec.auth.identity_ca", "file:certs/ca.pem"),
//!     Property::new("dds.sec.auth.private_key", "file:certs/participant1_key.pem"),
//! ];
//! let (local, adjusted_guid) = auth.validate_local_identity(0, &qos, candidate)?;
//! let identity_token = auth.get_identity_token(local)?;
//! // exchange tokens with the peer via discovery, then drive the handshake
//! ```
//!
//! # References
//!
//! - [OMG DDS Security v1.1](https://www.omg.org/spec/DDS-SECURITY/1.1/)
//! - [X.509 Certificate Profile (RFC 5280)](https://datatracker.ietf.org/doc/html/rfc5280)
//! - [RFC 5114 (MODP-2048-256 group)](https://datatracker.ietf.org/doc/html/rfc5114)

pub mod config;
pub mod crypto;
pub mod error;
mod expiry;
pub mod guid;
pub mod handshake;
pub mod identity;
mod pdata;
pub mod plugin;
mod registry;
pub mod token;

#[cfg(test)]
mod handshake_tests;

pub use crypto::AuthAlgoKind;
pub use error::{AuthErrorKind, SecResult, SecurityException};
pub use guid::GUID;
pub use handshake::{HandshakeOrigin, HandshakeState};
pub use plugin::{
    Authentication, AuthenticationListener, HandshakeHandle, HandshakeOutcome,
    IdentityHandle, SharedSecretHandle, ValidationOutcome, HANDLE_NIL,
};
pub use registry::ObjectKind;
pub use token::{BinaryProperty, Property, Token};
