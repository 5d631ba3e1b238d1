// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Participant QoS property handling and security-material resolution.
//!
//! Identity material is configured through the participant's property bag.
//! Each value names its source with a prefix:
//!
//! - `file:<path>`  -- read the file at `<path>`
//! - `data:,<body>` -- the PEM text follows inline
//! - `pkcs11:<uri>` -- hardware token reference (recognized, unsupported here)

use std::fs;
use std::sync::Arc;

use crate::crypto::cert::Certificate;
use crate::error::{AuthErrorKind, SecResult, SecurityException};
use crate::token::Property;

/// Identity certificate of the local participant (PEM).
pub const PROP_IDENTITY_CERT: &str = "dds.sec.auth.identity_certificate";
/// Identity CA that issued the local certificate (PEM).
pub const PROP_IDENTITY_CA: &str = "dds.sec.auth.identity_ca";
/// Private key matching the identity certificate (PEM).
pub const PROP_PRIVATE_KEY: &str = "dds.sec.auth.private_key";
/// Password for an encrypted private key.
pub const PROP_PASSWORD: &str = "dds.sec.auth.password";
/// Directory of additionally trusted CA certificates.
pub const PROP_TRUSTED_CA_DIR: &str = "dds.sec.access.trusted_ca_dir";
/// Certificate revocation list for the identity CA (PEM).
pub const PROP_CRL: &str = "org.eclipse.cyclonedds.sec.auth.crl";

/// Find a property value in a QoS property bag (exact name match).
pub(crate) fn find_property<'a>(properties: &'a [Property], name: &str) -> Option<&'a str> {
    properties
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.value.as_str())
}

/// Find a mandatory property, reporting `MissingProperty` when absent.
pub(crate) fn require_property<'a>(
    context: &'static str,
    properties: &'a [Property],
    name: &str,
) -> SecResult<&'a str> {
    find_property(properties, name).ok_or_else(|| {
        SecurityException::new(
            context,
            AuthErrorKind::MissingProperty,
            format!("missing property '{}'", name),
        )
    })
}

/// Resolve a security-material value to its raw bytes.
pub(crate) fn load_security_material(
    context: &'static str,
    value: &str,
) -> SecResult<Vec<u8>> {
    if let Some(path) = value.strip_prefix("file:") {
        fs::read(path).map_err(|e| {
            SecurityException::new(
                context,
                AuthErrorKind::InvalidPem,
                format!("failed to read '{}': {}", path, e),
            )
        })
    } else if let Some(body) = value.strip_prefix("data:,") {
        Ok(body.as_bytes().to_vec())
    } else if value.starts_with("pkcs11:") {
        Err(SecurityException::new(
            context,
            AuthErrorKind::InvalidPem,
            "pkcs11: URIs are not supported by this build",
        ))
    } else {
        Err(SecurityException::new(
            context,
            AuthErrorKind::InvalidPem,
            format!(
                "unsupported material source '{}' (expected file:, data:, or pkcs11:)",
                value
            ),
        ))
    }
}

/// Load every certificate in a trusted-CA directory.
///
/// Each regular file must hold exactly one PEM certificate; anything else
/// fails the whole load, so a typo cannot silently shrink the anchor set.
pub(crate) fn load_trusted_ca_dir(
    context: &'static str,
    dir: &str,
) -> SecResult<Vec<Arc<Certificate>>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        SecurityException::new(
            context,
            AuthErrorKind::InvalidPem,
            format!("failed to read trusted CA directory '{}': {}", dir, e),
        )
    })?;

    let mut certs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            SecurityException::new(
                context,
                AuthErrorKind::InvalidPem,
                format!("failed to enumerate trusted CA directory '{}': {}", dir, e),
            )
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let pem_bytes = fs::read(&path).map_err(|e| {
            SecurityException::new(
                context,
                AuthErrorKind::InvalidPem,
                format!("failed to read trusted CA '{}': {}", path.display(), e),
            )
        })?;
        let cert = Certificate::from_pem(&pem_bytes).map_err(|e| {
            SecurityException::new(
                context,
                AuthErrorKind::InvalidPem,
                format!("trusted CA '{}': {}", path.display(), e.message),
            )
        })?;
        certs.push(Arc::new(cert));
    }

    log::debug!(
        "[auth] loaded {} trusted CA certificate(s) from '{}'",
        certs.len(),
        dir
    );
    Ok(certs)
}
