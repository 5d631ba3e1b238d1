// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identity objects and identity-token handling.
//!
//! A LocalIdentity is created by `validate_local_identity` from configured
//! PEM material; a RemoteIdentity is created when a peer is discovered.
//! The IdentityRelation between one local and one remote identity carries
//! the challenge pair the handshake consumes. Relations live in the remote
//! identity's link table, keyed by the local identity handle.
//!
//! # OMG DDS Security v1.1 Sec.9.3.3 (Adjusted participant GUID)

use std::collections::HashMap;
use std::sync::Arc;

use zeroize::Zeroize;

use crate::crypto::cert::{Certificate, Crl};
use crate::crypto::key::PrivateKey;
use crate::crypto::{sha256, AuthAlgoKind, CHALLENGE_SIZE};
use crate::error::{AuthErrorKind, SecResult, SecurityException};
use crate::guid::GUID;
use crate::token::{BinaryProperty, Property, Token};

/// Identity token class id.
pub const AUTH_TOKEN_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0";
/// Class id prefix shared by every token of this plugin.
pub const AUTH_CLASS_ID_BASE: &str = "DDS:Auth:PKI-DH:";
/// Auth-request message token class id.
pub const AUTH_REQUEST_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0+AuthReq";

/// Permissions credential token class id (produced by Access Control).
pub const PERMISSIONS_CREDENTIAL_CLASS_ID: &str = "DDS:Access:PermissionsCredential";
/// Property carrying the permissions document in the credential token.
pub const PROP_PERMISSIONS_CERT: &str = "dds.perm.cert";

const PROP_CERT_SN: &str = "dds.cert.sn";
const PROP_CERT_ALGO: &str = "dds.cert.algo";
const PROP_CA_SN: &str = "dds.ca.sn";
const PROP_CA_ALGO: &str = "dds.ca.algo";
const PROP_FUTURE_CHALLENGE: &str = "future_challenge";

const SUPPORTED_VERSION_MAJOR: u32 = 1;
const SUPPORTED_VERSION_MINOR: u32 = 1;

/// 32-byte authentication challenge, wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Challenge(pub [u8; CHALLENGE_SIZE]);

impl Drop for Challenge {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Challenge(..)")
    }
}

/// Validated local participant identity.
#[derive(Debug)]
pub(crate) struct LocalIdentityInfo {
    pub domain_id: u32,
    pub candidate_guid: GUID,
    pub adjusted_guid: GUID,
    pub identity_cert: Arc<Certificate>,
    pub identity_ca: Arc<Certificate>,
    pub private_key: Arc<PrivateKey>,
    pub crl: Option<Arc<Crl>>,
    pub dsign_kind: AuthAlgoKind,
    pub kagree_kind: AuthAlgoKind,
    /// Serialized participant data, captured on first handshake
    pub pdata: Vec<u8>,
    /// Opaque permissions document from the Access Control plugin
    pub permissions_document: Vec<u8>,
    /// Pending expiry timer, 0 when none
    pub timer: u64,
}

/// Discovered remote participant identity.
#[derive(Debug)]
pub(crate) struct RemoteIdentityInfo {
    pub guid: GUID,
    /// Certificate learned from a validated Request/Reply token
    pub identity_cert: Option<Arc<Certificate>>,
    pub identity_token: Token,
    pub dsign_kind: Option<AuthAlgoKind>,
    pub kagree_kind: Option<AuthAlgoKind>,
    pub pdata: Vec<u8>,
    pub permissions_document: Vec<u8>,
    /// Relations to local identities, keyed by local identity handle
    pub links: HashMap<u64, IdentityRelation>,
    /// Pending expiry timer, 0 when none
    pub timer: u64,
}

impl RemoteIdentityInfo {
    pub fn new(guid: GUID, identity_token: Token) -> Self {
        Self {
            guid,
            identity_cert: None,
            identity_token,
            dsign_kind: None,
            kagree_kind: None,
            pdata: Vec::new(),
            permissions_document: Vec::new(),
            links: HashMap::new(),
            timer: 0,
        }
    }
}

/// Challenge state linking one local and one remote identity.
#[derive(Debug)]
pub(crate) struct IdentityRelation {
    pub local_handle: u64,
    pub remote_handle: u64,
    pub lchallenge: Challenge,
    pub rchallenge: Option<Challenge>,
}

/// Derive the adjusted participant GUID from an identity certificate and
/// the candidate GUID. Bit-exact and wire-visible: the upper 47 bits come
/// from SHA-256 of the subject DN (top bit forced to 1), the lower prefix
/// half from SHA-256 of the candidate prefix.
pub(crate) fn adjusted_participant_guid(
    cert: &Certificate,
    candidate: &GUID,
) -> SecResult<GUID> {
    let subject = cert.subject_der()?;
    let high = sha256(&subject);
    let low = sha256(&candidate.prefix);

    let mut adjusted = GUID::zero();
    adjusted.entity_id = candidate.entity_id;
    let mut hb: u8 = 0x80;
    for i in 0..6 {
        adjusted.prefix[i] = hb | (high[i] >> 1);
        hb = high[i] << 7;
    }
    adjusted.prefix[6..12].copy_from_slice(&low[..6]);
    Ok(adjusted)
}

/// Build the identity token advertised through discovery.
pub(crate) fn build_identity_token(
    cert: &Certificate,
    ca: &Certificate,
    cert_kind: AuthAlgoKind,
    ca_kind: AuthAlgoKind,
) -> SecResult<Token> {
    let mut token = Token::new(AUTH_TOKEN_CLASS_ID);
    token
        .properties
        .push(Property::new(PROP_CERT_SN, cert.subject_name()?));
    token
        .properties
        .push(Property::new(PROP_CERT_ALGO, cert_kind.name()));
    token
        .properties
        .push(Property::new(PROP_CA_SN, ca.subject_name()?));
    token
        .properties
        .push(Property::new(PROP_CA_ALGO, ca_kind.name()));
    Ok(token)
}

/// Validate a remote identity token's class id and protocol version.
///
/// The class id must start with `DDS:Auth:PKI-DH:` followed by
/// `<major>.<minor>` and an optional `+<suffix>`; major must be 1 and
/// minor at most 1.
pub(crate) fn validate_remote_identity_token(
    context: &'static str,
    token: &Token,
) -> SecResult<()> {
    let Some(version) = token.class_id.strip_prefix(AUTH_CLASS_ID_BASE) else {
        return Err(SecurityException::new(
            context,
            AuthErrorKind::BadClassId,
            format!("remote identity token class_id '{}' not supported", token.class_id),
        ));
    };

    let Some((major, minor)) = split_version(version) else {
        return Err(SecurityException::new(
            context,
            AuthErrorKind::BadClassId,
            format!("remote identity token class_id '{}' has wrong format", token.class_id),
        ));
    };

    if major != SUPPORTED_VERSION_MAJOR || minor > SUPPORTED_VERSION_MINOR {
        return Err(SecurityException::new(
            context,
            AuthErrorKind::UnsupportedVersion,
            format!("remote identity token version {}.{} not supported", major, minor),
        ));
    }
    Ok(())
}

/// Split `<major>.<minor>[+suffix]` into its numeric parts.
fn split_version(version: &str) -> Option<(u32, u32)> {
    let (major_str, rest) = version.split_once('.')?;
    let minor_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (minor_str, suffix) = rest.split_at(minor_end);
    if !suffix.is_empty() && !suffix.starts_with('+') {
        return None;
    }
    let major = major_str.parse().ok()?;
    let minor = minor_str.parse().ok()?;
    Some((major, minor))
}

/// Validate an inbound auth-request token and extract its future challenge.
pub(crate) fn validate_auth_request_token(
    context: &'static str,
    token: &Token,
) -> SecResult<[u8; CHALLENGE_SIZE]> {
    if token.class_id != AUTH_REQUEST_CLASS_ID {
        return Err(SecurityException::new(
            context,
            AuthErrorKind::BadClassId,
            format!("auth request token class_id '{}' is invalid", token.class_id),
        ));
    }
    let prop = token
        .find_binary_property(PROP_FUTURE_CHALLENGE)
        .ok_or_else(|| {
            SecurityException::new(
                context,
                AuthErrorKind::MissingProperty,
                "auth request token: future_challenge not found",
            )
        })?;
    if prop.value.len() != CHALLENGE_SIZE {
        return Err(SecurityException::new(
            context,
            AuthErrorKind::WrongSize,
            format!(
                "auth request token: future_challenge has invalid size {}",
                prop.value.len()
            ),
        ));
    }
    let mut challenge = [0u8; CHALLENGE_SIZE];
    challenge.copy_from_slice(&prop.value);
    Ok(challenge)
}

/// Build the outbound auth-request token carrying our future challenge.
pub(crate) fn build_auth_request_token(challenge: &Challenge) -> Token {
    let mut token = Token::new(AUTH_REQUEST_CLASS_ID);
    token
        .binary_properties
        .push(BinaryProperty::new(PROP_FUTURE_CHALLENGE, challenge.0.to_vec()));
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{date_time_ymd, CertificateParams, DnType, KeyPair};

    fn test_cert() -> Certificate {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "adjusted guid test");
        params.not_before = date_time_ymd(2024, 1, 1);
        params.not_after = date_time_ymd(2035, 1, 1);
        let cert = params.self_signed(&key).unwrap();
        Certificate::from_pem(cert.pem().as_bytes()).unwrap()
    }

    #[test]
    fn test_adjusted_guid_preserves_entity_id() {
        let cert = test_cert();
        let candidate = GUID::new(
            [0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xbb],
            [0xb0, 0xb1, 0xb2, 0x01],
        );
        let adjusted = adjusted_participant_guid(&cert, &candidate).unwrap();
        assert_eq!(adjusted.entity_id, candidate.entity_id);
    }

    #[test]
    fn test_adjusted_guid_top_bit_set() {
        let cert = test_cert();
        let candidate = GUID::new([0x00; 12], [0; 4]);
        let adjusted = adjusted_participant_guid(&cert, &candidate).unwrap();
        assert_eq!(adjusted.prefix[0] & 0x80, 0x80);
    }

    #[test]
    fn test_adjusted_guid_deterministic() {
        let cert = test_cert();
        let candidate = GUID::new([0x42; 12], [1, 2, 3, 4]);
        let a = adjusted_participant_guid(&cert, &candidate).unwrap();
        let b = adjusted_participant_guid(&cert, &candidate).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_adjusted_guid_lower_half_from_candidate() {
        let cert = test_cert();
        let candidate = GUID::new([0x42; 12], [0; 4]);
        let adjusted = adjusted_participant_guid(&cert, &candidate).unwrap();
        let expected = sha256(&candidate.prefix);
        assert_eq!(&adjusted.prefix[6..12], &expected[..6]);
    }

    #[test]
    fn test_version_accepts_minor_zero_and_one() {
        for class_id in ["DDS:Auth:PKI-DH:1.0", "DDS:Auth:PKI-DH:1.1", "DDS:Auth:PKI-DH:1.1+CustomExt"] {
            let token = Token::new(class_id);
            validate_remote_identity_token("test", &token)
                .unwrap_or_else(|e| panic!("{} should be accepted: {}", class_id, e));
        }
    }

    #[test]
    fn test_version_rejects_minor_two_and_major_two() {
        for class_id in ["DDS:Auth:PKI-DH:1.2", "DDS:Auth:PKI-DH:2.0"] {
            let token = Token::new(class_id);
            let err = validate_remote_identity_token("test", &token).unwrap_err();
            assert_eq!(err.kind, AuthErrorKind::UnsupportedVersion, "{}", class_id);
        }
    }

    #[test]
    fn test_version_rejects_malformed() {
        for class_id in ["DDS:Auth:PKI-DH:", "DDS:Auth:PKI-DH:x.y", "DDS:Auth:PKI-DH:1.0x", "Other:1.0"] {
            let token = Token::new(class_id);
            let err = validate_remote_identity_token("test", &token).unwrap_err();
            assert_eq!(err.kind, AuthErrorKind::BadClassId, "{}", class_id);
        }
    }

    #[test]
    fn test_auth_request_token_roundtrip() {
        let challenge = Challenge([0x5a; CHALLENGE_SIZE]);
        let token = build_auth_request_token(&challenge);
        assert_eq!(token.class_id, AUTH_REQUEST_CLASS_ID);
        let extracted = validate_auth_request_token("test", &token).unwrap();
        assert_eq!(extracted, [0x5a; CHALLENGE_SIZE]);
    }

    #[test]
    fn test_auth_request_token_wrong_size() {
        let mut token = Token::new(AUTH_REQUEST_CLASS_ID);
        token
            .binary_properties
            .push(BinaryProperty::new("future_challenge", vec![0u8; 31]));
        let err = validate_auth_request_token("test", &token).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::WrongSize);
    }

    #[test]
    fn test_identity_token_properties() {
        let cert = test_cert();
        let token = build_identity_token(
            &cert,
            &cert,
            AuthAlgoKind::EcPrime256v1,
            AuthAlgoKind::EcPrime256v1,
        )
        .unwrap();
        assert_eq!(token.class_id, AUTH_TOKEN_CLASS_ID);
        assert_eq!(
            token.find_property("dds.cert.algo").unwrap().value,
            "EC-prime256v1"
        );
        assert!(token
            .find_property("dds.ca.sn")
            .unwrap()
            .value
            .contains("adjusted guid test"));
    }
}
