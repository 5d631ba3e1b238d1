// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Security exception types for the authentication plugin.
//!
//! Every fallible plugin operation reports a [`SecurityException`] carrying
//! the originating operation, a stable numeric code, a minor code (0 when
//! unused) and a human-readable message. Codes are grouped by category:
//!
//! - 1xx configuration
//! - 2xx trust / certificate validation
//! - 3xx token syntax
//! - 4xx handshake semantics
//! - 5xx object registry

use std::fmt;

/// Typed error kind with a stable numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// A required configuration or token property is absent
    MissingProperty,
    /// PEM material could not be parsed
    InvalidPem,
    /// Private key is encrypted and the password is absent or wrong
    BadPassword,
    /// A CRL and a trusted-CA directory were configured together
    CannotCombineCrlAndTrustedCaList,

    /// The configured identity CA is not in the trusted-CA list
    CaNotTrusted,
    /// Certificate does not chain to the expected CA
    ChainInvalid,
    /// Certificate serial is listed in the configured CRL
    Revoked,
    /// Certificate validity period has ended
    Expired,
    /// Certificate validity period has not started
    NotYetValid,
    /// Certificate notAfter could not be interpreted
    InvalidExpiry,
    /// Peer certificate has expired
    PeerExpired,

    /// Token class id does not match the expected value
    BadClassId,
    /// Token class id carries an unsupported protocol version
    UnsupportedVersion,
    /// Binary property has the wrong length
    WrongSize,
    /// Binary property is present but empty
    EmptyValue,

    /// A challenge does not match the pinned future challenge
    ChallengeMismatch,
    /// An optional hash property disagrees with the locally computed hash
    HashMismatch,
    /// Unknown digital-signature or key-agreement algorithm name
    UnsupportedAlgorithm,
    /// Handshake signature verification failed
    BadSignature,
    /// Remote identity token differs from a previously validated one
    InconsistentRemoteIdentity,
    /// c.pdata participant key does not match the peer certificate
    PDataMismatch,
    /// Diffie-Hellman public key is malformed or out of range
    InvalidKey,

    /// Handle is nil or not present in the registry
    InvalidHandle,
    /// Handle refers to an object of a different kind
    WrongHandleKind,
    /// Handle is already in use by a concurrent operation
    HandleBusy,
}

impl AuthErrorKind {
    /// Stable numeric code for this kind.
    pub fn code(self) -> i32 {
        match self {
            Self::MissingProperty => 100,
            Self::InvalidPem => 101,
            Self::BadPassword => 102,
            Self::CannotCombineCrlAndTrustedCaList => 103,
            Self::CaNotTrusted => 200,
            Self::ChainInvalid => 201,
            Self::Revoked => 202,
            Self::Expired => 203,
            Self::NotYetValid => 204,
            Self::InvalidExpiry => 205,
            Self::PeerExpired => 206,
            Self::BadClassId => 300,
            Self::UnsupportedVersion => 301,
            Self::WrongSize => 302,
            Self::EmptyValue => 303,
            Self::ChallengeMismatch => 400,
            Self::HashMismatch => 401,
            Self::UnsupportedAlgorithm => 402,
            Self::BadSignature => 403,
            Self::InconsistentRemoteIdentity => 404,
            Self::PDataMismatch => 405,
            Self::InvalidKey => 406,
            Self::InvalidHandle => 500,
            Self::WrongHandleKind => 501,
            Self::HandleBusy => 502,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::MissingProperty => "missing property",
            Self::InvalidPem => "invalid PEM",
            Self::BadPassword => "bad password",
            Self::CannotCombineCrlAndTrustedCaList => {
                "cannot combine CRL and trusted CA list"
            }
            Self::CaNotTrusted => "CA not trusted",
            Self::ChainInvalid => "certificate chain invalid",
            Self::Revoked => "certificate revoked",
            Self::Expired => "certificate expired",
            Self::NotYetValid => "certificate not yet valid",
            Self::InvalidExpiry => "certificate expiry invalid",
            Self::PeerExpired => "peer certificate expired",
            Self::BadClassId => "bad class id",
            Self::UnsupportedVersion => "unsupported version",
            Self::WrongSize => "wrong size",
            Self::EmptyValue => "empty value",
            Self::ChallengeMismatch => "challenge mismatch",
            Self::HashMismatch => "hash mismatch",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::BadSignature => "bad signature",
            Self::InconsistentRemoteIdentity => "inconsistent remote identity",
            Self::PDataMismatch => "participant data mismatch",
            Self::InvalidKey => "invalid key",
            Self::InvalidHandle => "invalid handle",
            Self::WrongHandleKind => "wrong handle kind",
            Self::HandleBusy => "handle busy",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exception record reported by every failing plugin operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityException {
    /// Operation the error originated from (e.g. `"validate_local_identity"`)
    pub context: &'static str,
    /// Typed error kind
    pub kind: AuthErrorKind,
    /// Minor code, 0 when unused
    pub minor_code: i32,
    /// Human-readable diagnostic
    pub message: String,
}

impl SecurityException {
    /// Create an exception with minor code 0.
    pub fn new(
        context: &'static str,
        kind: AuthErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            context,
            kind,
            minor_code: 0,
            message: message.into(),
        }
    }
}

impl fmt::Display for SecurityException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (code {}): {}",
            self.context,
            self.kind,
            self.kind.code(),
            self.message
        )
    }
}

impl std::error::Error for SecurityException {}

/// Result alias used throughout the plugin.
pub type SecResult<T> = Result<T, SecurityException>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_display() {
        let ex = SecurityException::new(
            "validate_local_identity",
            AuthErrorKind::MissingProperty,
            "missing property 'dds.sec.auth.private_key'",
        );
        assert_eq!(
            ex.to_string(),
            "validate_local_identity: missing property (code 100): \
             missing property 'dds.sec.auth.private_key'"
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AuthErrorKind::MissingProperty.code(), 100);
        assert_eq!(AuthErrorKind::CaNotTrusted.code(), 200);
        assert_eq!(AuthErrorKind::BadClassId.code(), 300);
        assert_eq!(AuthErrorKind::ChallengeMismatch.code(), 400);
        assert_eq!(AuthErrorKind::InvalidHandle.code(), 500);
    }

    #[test]
    fn test_minor_code_defaults_to_zero() {
        let ex = SecurityException::new("op", AuthErrorKind::BadSignature, "x");
        assert_eq!(ex.minor_code, 0);
    }
}
