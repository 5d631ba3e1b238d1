// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PKI-DH handshake state machine internals.
//!
//! The three-message exchange mutually authenticates two participants and
//! establishes a shared secret:
//!
//! ```text
//! Initiator                                Responder
//!    |                                         |
//!    |----- Request (c.id, dh1, challenge1) -->|
//!    |                                         | (verify cert, pdata)
//!    |<---- Reply (c.id, dh2, challenge2, -----|
//!    |             signature)                  |
//!    | (verify cert + signature)               |
//!    |----- Final (challenges, signature) ---->|
//!    |                                         | (verify signature)
//!    | secret = SHA-256(DH(dh1, dh2))          | secret = SHA-256(DH(dh1, dh2))
//! ```
//!
//! This module holds the handshake object, the inbound-token validation
//! rules and the hash/signature input construction; the public operations
//! driving it live in [`crate::plugin`].
//!
//! # OMG DDS Security v1.1 Sec.9.3.2 (Handshake protocol)

use std::sync::Arc;

use zeroize::Zeroize;

use crate::crypto::cert::{verify_certificate, Certificate, Crl};
use crate::crypto::dh::{validate_public_key, DhKeyPair};
use crate::crypto::key::{verify_signature, PrivateKey};
use crate::crypto::{sha256, AuthAlgoKind, CHALLENGE_SIZE};
use crate::error::{AuthErrorKind, SecResult, SecurityException};
use crate::guid::GUID;
use crate::identity::Challenge;
use crate::pdata::participant_guid_from_pdata;
use crate::token::{serialize_binary_properties, BinaryProperty, Token};

/// Handshake request token class id.
pub const HANDSHAKE_REQUEST_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0+Req";
/// Handshake reply token class id.
pub const HANDSHAKE_REPLY_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0+Reply";
/// Handshake final token class id.
pub const HANDSHAKE_FINAL_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0+Final";

pub(crate) const PROP_C_ID: &str = "c.id";
pub(crate) const PROP_C_PERM: &str = "c.perm";
pub(crate) const PROP_C_PDATA: &str = "c.pdata";
pub(crate) const PROP_C_DSIGN_ALGO: &str = "c.dsign_algo";
pub(crate) const PROP_C_KAGREE_ALGO: &str = "c.kagree_algo";
pub(crate) const PROP_HASH_C1: &str = "hash_c1";
pub(crate) const PROP_HASH_C2: &str = "hash_c2";
pub(crate) const PROP_DH1: &str = "dh1";
pub(crate) const PROP_DH2: &str = "dh2";
pub(crate) const PROP_CHALLENGE1: &str = "challenge1";
pub(crate) const PROP_CHALLENGE2: &str = "challenge2";
pub(crate) const PROP_SIGNATURE: &str = "signature";

/// Which side created the handshake object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOrigin {
    /// Created by `begin_handshake_request` (initiator side)
    CreatedRequest,
    /// Created by `begin_handshake_reply` (responder side)
    CreatedReply,
}

/// Handshake progress. Terminal states are the `CompletedOk*` pair and
/// `Failed`; a failed handshake is never revived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    CreatedRequest,
    CreatedReply,
    /// Completed on the initiator side, final message emitted
    CompletedOkFinal,
    /// Completed on the responder side
    CompletedOk,
    Failed,
}

/// Shared secret attached to a completed handshake. The crypto plugin
/// addresses it through an opaque handle; the bytes never leave the core.
pub struct SharedSecretData {
    secret: [u8; 32],
    challenge1: [u8; CHALLENGE_SIZE],
    challenge2: [u8; CHALLENGE_SIZE],
}

impl SharedSecretData {
    pub(crate) fn new(
        secret: [u8; 32],
        challenge1: [u8; CHALLENGE_SIZE],
        challenge2: [u8; CHALLENGE_SIZE],
    ) -> Self {
        Self {
            secret,
            challenge1,
            challenge2,
        }
    }

    pub(crate) fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub(crate) fn challenge1(&self) -> &[u8; CHALLENGE_SIZE] {
        &self.challenge1
    }

    pub(crate) fn challenge2(&self) -> &[u8; CHALLENGE_SIZE] {
        &self.challenge2
    }
}

impl Drop for SharedSecretData {
    fn drop(&mut self) {
        self.secret.zeroize();
        self.challenge1.zeroize();
        self.challenge2.zeroize();
    }
}

impl std::fmt::Debug for SharedSecretData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecretData(..)")
    }
}

/// Handshake object stored in the registry.
#[derive(Debug)]
pub(crate) struct HandshakeInfo {
    pub local_handle: u64,
    pub remote_handle: u64,
    pub origin: HandshakeOrigin,
    pub state: HandshakeState,
    pub hash_c1: Option<[u8; 32]>,
    pub hash_c2: Option<[u8; 32]>,
    /// Local ephemeral DH keypair, consumed when the secret is derived
    pub ldh: Option<DhKeyPair>,
    /// Peer DH public key in wire form
    pub rdh: Option<Vec<u8>>,
    pub secret: Option<Arc<SharedSecretData>>,
    /// Opaque reference handed to the crypto plugin, 0 until completed
    pub secret_handle: u64,
}

impl HandshakeInfo {
    pub fn new(local_handle: u64, remote_handle: u64, origin: HandshakeOrigin) -> Self {
        let state = match origin {
            HandshakeOrigin::CreatedRequest => HandshakeState::CreatedRequest,
            HandshakeOrigin::CreatedReply => HandshakeState::CreatedReply,
        };
        Self {
            local_handle,
            remote_handle,
            origin,
            state,
            hash_c1: None,
            hash_c2: None,
            ldh: None,
            rdh: None,
            secret: None,
            secret_handle: 0,
        }
    }
}

/// Build the five credential properties of a Request/Reply token in their
/// canonical order.
pub(crate) fn build_props5(
    cert_pem: &[u8],
    permissions_document: &[u8],
    pdata: &[u8],
    dsign_kind: AuthAlgoKind,
    kagree_kind: AuthAlgoKind,
) -> Vec<BinaryProperty> {
    vec![
        BinaryProperty::new(PROP_C_ID, cert_pem.to_vec()),
        BinaryProperty::new(PROP_C_PERM, permissions_document.to_vec()),
        BinaryProperty::new(PROP_C_PDATA, pdata.to_vec()),
        BinaryProperty::from_string(PROP_C_DSIGN_ALGO, dsign_kind.dsign_name()),
        BinaryProperty::from_string(PROP_C_KAGREE_ALGO, kagree_kind.kagree_name()),
    ]
}

/// SHA-256 over the canonical encoding of a property sequence.
pub(crate) fn hash_properties(props: &[&BinaryProperty]) -> [u8; 32] {
    sha256(&serialize_binary_properties(props))
}

/// Sign the canonical encoding of a signature input tuple.
pub(crate) fn sign_tuple(
    key: &PrivateKey,
    props: &[&BinaryProperty; 6],
) -> SecResult<Vec<u8>> {
    key.sign(&serialize_binary_properties(props))
}

/// Which inbound handshake token is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HsTokenKind {
    Request,
    Reply,
    Final,
}

impl HsTokenKind {
    fn class_id(self) -> &'static str {
        match self {
            Self::Request => HANDSHAKE_REQUEST_CLASS_ID,
            Self::Reply => HANDSHAKE_REPLY_CLASS_ID,
            Self::Final => HANDSHAKE_FINAL_CLASS_ID,
        }
    }
}

/// Everything token validation needs from the surrounding object graph.
/// Copied out under the registry lock so validation itself is pure.
pub(crate) struct HsValidationCtx<'a> {
    pub context: &'static str,
    pub identity_ca: &'a Certificate,
    pub crl: Option<&'a Crl>,
    pub trusted_ca_list: &'a [Arc<Certificate>],
    pub lchallenge: &'a Challenge,
    pub rchallenge: Option<&'a Challenge>,
    /// hash_c1 from the earlier Request step (Reply/Final validation)
    pub hash_c1: Option<[u8; 32]>,
    /// hash_c2 from the earlier Reply step (Final validation)
    pub hash_c2: Option<[u8; 32]>,
    /// Locally generated `dh1` property (Reply/Final validation)
    pub dh1_ref: Option<&'a BinaryProperty>,
    /// Locally generated `dh2` property (Final validation)
    pub dh2_ref: Option<&'a BinaryProperty>,
    /// Peer certificate learned from the Reply (Final validation)
    pub remote_cert: Option<&'a Certificate>,
    /// Peer signature algorithm learned from the Reply (Final validation)
    pub remote_dsign: Option<AuthAlgoKind>,
}

/// State changes a successfully validated token implies. The caller
/// applies these to the registry in one step; on failure nothing is
/// applied and any provisional peer state is cleared instead.
#[derive(Debug, Default)]
pub(crate) struct HsTokenOutcome {
    pub remote_cert: Option<Arc<Certificate>>,
    pub permissions_document: Option<Vec<u8>>,
    pub pdata: Option<Vec<u8>>,
    pub dsign_kind: Option<AuthAlgoKind>,
    pub kagree_kind: Option<AuthAlgoKind>,
    pub hash_c1: Option<[u8; 32]>,
    pub hash_c2: Option<[u8; 32]>,
    /// Peer DH public key (dh1 of a Request, dh2 of a Reply)
    pub rdh: Option<Vec<u8>>,
    /// Future challenge to pin on the relation
    pub rchallenge_pin: Option<[u8; CHALLENGE_SIZE]>,
}

fn missing(ctx: &HsValidationCtx, name: &str) -> SecurityException {
    SecurityException::new(
        ctx.context,
        AuthErrorKind::MissingProperty,
        format!("handshake token property {} missing", name),
    )
}

fn find_required<'t>(
    ctx: &HsValidationCtx,
    token: &'t Token,
    name: &str,
) -> SecResult<&'t BinaryProperty> {
    let prop = token.find_binary_property(name).ok_or_else(|| missing(ctx, name))?;
    if prop.value.len() > i32::MAX as usize {
        return Err(SecurityException::new(
            ctx.context,
            AuthErrorKind::WrongSize,
            format!(
                "handshake token property {} has unsupported size ({} bytes)",
                name,
                prop.value.len()
            ),
        ));
    }
    Ok(prop)
}

fn find_required_nonempty<'t>(
    ctx: &HsValidationCtx,
    token: &'t Token,
    name: &str,
) -> SecResult<&'t BinaryProperty> {
    let prop = find_required(ctx, token, name)?;
    if prop.value.is_empty() {
        return Err(SecurityException::new(
            ctx.context,
            AuthErrorKind::EmptyValue,
            format!("handshake token property {} is empty", name),
        ));
    }
    Ok(prop)
}

fn find_required_exact_size<'t>(
    ctx: &HsValidationCtx,
    token: &'t Token,
    name: &str,
    size: usize,
) -> SecResult<&'t BinaryProperty> {
    let prop = find_required(ctx, token, name)?;
    if prop.value.len() != size {
        return Err(SecurityException::new(
            ctx.context,
            AuthErrorKind::WrongSize,
            format!(
                "handshake token property {} has wrong size ({} while expecting {})",
                name,
                prop.value.len(),
                size
            ),
        ));
    }
    Ok(prop)
}

/// Load and verify the peer certificate from a `c.id` property: against
/// the trusted-CA list when one is configured, against the own identity
/// CA (with optional CRL) otherwise.
fn load_peer_certificate(
    ctx: &HsValidationCtx,
    c_id: &BinaryProperty,
) -> SecResult<Certificate> {
    if ctx.crl.is_some() && !ctx.trusted_ca_list.is_empty() {
        return Err(SecurityException::new(
            ctx.context,
            AuthErrorKind::CannotCombineCrlAndTrustedCaList,
            "cannot specify both CRL and trusted CA list",
        ));
    }

    let cert = Certificate::from_pem(&c_id.value).map_err(|e| {
        SecurityException::new(ctx.context, e.kind, format!("c.id: {}", e.message))
    })?;

    if ctx.trusted_ca_list.is_empty() {
        verify_certificate(&cert, ctx.identity_ca, ctx.crl)?;
    } else {
        let mut last_err = None;
        let mut verified = false;
        for anchor in ctx.trusted_ca_list {
            match verify_certificate(&cert, anchor, None) {
                Ok(()) => {
                    verified = true;
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        if !verified {
            return Err(last_err.unwrap_or_else(|| {
                SecurityException::new(
                    ctx.context,
                    AuthErrorKind::ChainInvalid,
                    "trusted CA list is empty",
                )
            }));
        }
    }

    Ok(cert)
}

/// Check the `c.pdata` participant key against the peer certificate: the
/// first six prefix bytes must equal the certificate-derived adjusted
/// prefix (computed with a zeroed candidate GUID).
fn validate_pdata(
    ctx: &HsValidationCtx,
    cert: &Certificate,
    pdata: &[u8],
) -> SecResult<()> {
    let claimed = participant_guid_from_pdata(ctx.context, pdata)?;
    let derived = crate::identity::adjusted_participant_guid(cert, &GUID::zero())?;
    if claimed.prefix[..6] != derived.prefix[..6] {
        return Err(SecurityException::new(
            ctx.context,
            AuthErrorKind::PDataMismatch,
            "c.pdata contains an incorrect participant guid",
        ));
    }
    Ok(())
}

/// Validate an inbound handshake token and compute the state changes it
/// implies. Mirrors the common-rule table of DDS Security Sec.9.3.2.5.
pub(crate) fn validate_handshake_token(
    token: &Token,
    kind: HsTokenKind,
    ctx: &HsValidationCtx<'_>,
) -> SecResult<HsTokenOutcome> {
    let mut outcome = HsTokenOutcome::default();

    if !token.class_id.starts_with(kind.class_id()) {
        return Err(SecurityException::new(
            ctx.context,
            AuthErrorKind::BadClassId,
            format!(
                "handshake token incorrect class_id: '{}' (expected '{}')",
                token.class_id,
                kind.class_id()
            ),
        ));
    }

    // Credential block, Request and Reply only
    if matches!(kind, HsTokenKind::Request | HsTokenKind::Reply) {
        let c_id = find_required_nonempty(ctx, token, PROP_C_ID)?;
        let cert = load_peer_certificate(ctx, c_id)?;

        let c_perm = find_required(ctx, token, PROP_C_PERM)?;
        if !c_perm.value.is_empty() {
            outcome.permissions_document = Some(c_perm.value.clone());
        }

        let c_pdata = find_required(ctx, token, PROP_C_PDATA)?;
        validate_pdata(ctx, &cert, &c_pdata.value)?;
        outcome.pdata = Some(c_pdata.value.clone());

        let c_dsign = find_required_nonempty(ctx, token, PROP_C_DSIGN_ALGO)?;
        let dsign_kind =
            AuthAlgoKind::from_dsign_octets(&c_dsign.value).ok_or_else(|| {
                SecurityException::new(
                    ctx.context,
                    AuthErrorKind::UnsupportedAlgorithm,
                    "handshake token property c.dsign_algo not supported",
                )
            })?;

        let c_kagree = find_required_nonempty(ctx, token, PROP_C_KAGREE_ALGO)?;
        let kagree_kind =
            AuthAlgoKind::from_kagree_octets(&c_kagree.value).ok_or_else(|| {
                SecurityException::new(
                    ctx.context,
                    AuthErrorKind::UnsupportedAlgorithm,
                    "handshake token property c.kagree_algo not supported",
                )
            })?;

        // hash over the five properties exactly as received
        let hash = hash_properties(&[c_id, c_perm, c_pdata, c_dsign, c_kagree]);
        match kind {
            HsTokenKind::Request => outcome.hash_c1 = Some(hash),
            _ => outcome.hash_c2 = Some(hash),
        }

        outcome.remote_cert = Some(Arc::new(cert));
        outcome.dsign_kind = Some(dsign_kind);
        outcome.kagree_kind = Some(kagree_kind);
    }

    // dh1: carried by the Request, optionally echoed by Reply/Final
    match kind {
        HsTokenKind::Request => {
            let dh1 = find_required_nonempty(ctx, token, PROP_DH1)?;
            let kagree = outcome
                .kagree_kind
                .expect("credential block above always sets kagree for a Request");
            validate_public_key(kagree, &dh1.value).map_err(|e| {
                SecurityException::new(ctx.context, e.kind, format!("dh1: {}", e.message))
            })?;
            outcome.rdh = Some(dh1.value.clone());
        }
        _ => {
            let dh1_ref = ctx
                .dh1_ref
                .expect("Reply/Final validation always supplies dh1_ref");
            if let Some(dh1) = token.find_binary_property(PROP_DH1) {
                if dh1.name != dh1_ref.name || dh1.value != dh1_ref.value {
                    return Err(SecurityException::new(
                        ctx.context,
                        AuthErrorKind::InvalidKey,
                        "handshake token property dh1 not correct",
                    ));
                }
            }
        }
    }

    let challenge1 = find_required_exact_size(ctx, token, PROP_CHALLENGE1, CHALLENGE_SIZE)?;

    let mut challenge2 = None;
    let mut signature = None;
    if matches!(kind, HsTokenKind::Reply | HsTokenKind::Final) {
        challenge2 =
            Some(find_required_exact_size(ctx, token, PROP_CHALLENGE2, CHALLENGE_SIZE)?);
        signature = Some(find_required_nonempty(ctx, token, PROP_SIGNATURE)?);

        if kind == HsTokenKind::Reply {
            let dh2 = find_required_nonempty(ctx, token, PROP_DH2)?;
            let kagree = outcome
                .kagree_kind
                .expect("credential block above always sets kagree for a Reply");
            validate_public_key(kagree, &dh2.value).map_err(|e| {
                SecurityException::new(ctx.context, e.kind, format!("dh2: {}", e.message))
            })?;
            outcome.rdh = Some(dh2.value.clone());
        } else {
            let dh2_ref = ctx
                .dh2_ref
                .expect("Final validation always supplies dh2_ref");
            if let Some(dh2) = token.find_binary_property(PROP_DH2) {
                if dh2.name != dh2_ref.name || dh2.value != dh2_ref.value {
                    return Err(SecurityException::new(
                        ctx.context,
                        AuthErrorKind::InvalidKey,
                        "handshake token property dh2 not correct",
                    ));
                }
            }
        }
    }

    // The peer's challenge must match a future challenge pinned by an
    // earlier auth-request token; absent one, pin it now (except on the
    // Final, which can no longer introduce a challenge).
    let rc = match kind {
        HsTokenKind::Reply => challenge2.expect("challenge2 parsed above for a Reply"),
        _ => challenge1,
    };
    if let Some(rchallenge) = ctx.rchallenge {
        if rc.value != rchallenge.0 {
            return Err(SecurityException::new(
                ctx.context,
                AuthErrorKind::ChallengeMismatch,
                format!(
                    "handshake token property {} does not match future_challenge",
                    rc.name
                ),
            ));
        }
    } else if kind != HsTokenKind::Final {
        let mut pin = [0u8; CHALLENGE_SIZE];
        pin.copy_from_slice(&rc.value);
        outcome.rchallenge_pin = Some(pin);
    }

    // Optional hash copies are diagnostics: when present they must match
    // the locally computed value bytewise.
    let known_hash_c1 = outcome.hash_c1.or(ctx.hash_c1);
    if let Some(hash_c1) = token.find_binary_property(PROP_HASH_C1) {
        let known = known_hash_c1.ok_or_else(|| {
            SecurityException::new(
                ctx.context,
                AuthErrorKind::HashMismatch,
                "handshake token property hash_c1 cannot be checked",
            )
        })?;
        if hash_c1.value != known {
            return Err(SecurityException::new(
                ctx.context,
                AuthErrorKind::HashMismatch,
                "handshake token property hash_c1 invalid",
            ));
        }
    }

    let known_hash_c2 = outcome.hash_c2.or(ctx.hash_c2);
    if matches!(kind, HsTokenKind::Reply | HsTokenKind::Final) {
        if let Some(hash_c2) = token.find_binary_property(PROP_HASH_C2) {
            let known = known_hash_c2.ok_or_else(|| {
                SecurityException::new(
                    ctx.context,
                    AuthErrorKind::HashMismatch,
                    "handshake token property hash_c2 cannot be checked",
                )
            })?;
            if hash_c2.value != known {
                return Err(SecurityException::new(
                    ctx.context,
                    AuthErrorKind::HashMismatch,
                    "handshake token property hash_c2 invalid",
                ));
            }
        }

        // our own challenge must have come back unchanged
        let lc = match kind {
            HsTokenKind::Reply => challenge1,
            _ => challenge2.expect("challenge2 parsed above for a Final"),
        };
        if lc.value != ctx.lchallenge.0 {
            return Err(SecurityException::new(
                ctx.context,
                AuthErrorKind::ChallengeMismatch,
                format!(
                    "handshake token property {} does not match the local challenge",
                    lc.name
                ),
            ));
        }
    }

    // Signature check: each side signs what the other just sent, so the
    // 6-tuple order is swapped between Reply and Final.
    if matches!(kind, HsTokenKind::Reply | HsTokenKind::Final) {
        let signature = signature.expect("signature parsed above");
        let challenge2 = challenge2.expect("challenge2 parsed above");

        let hash_c1_val = BinaryProperty::new(
            PROP_HASH_C1,
            known_hash_c1
                .ok_or_else(|| {
                    SecurityException::new(
                        ctx.context,
                        AuthErrorKind::HashMismatch,
                        "no hash_c1 available for signature verification",
                    )
                })?
                .to_vec(),
        );
        let hash_c2_val = BinaryProperty::new(
            PROP_HASH_C2,
            known_hash_c2
                .ok_or_else(|| {
                    SecurityException::new(
                        ctx.context,
                        AuthErrorKind::HashMismatch,
                        "no hash_c2 available for signature verification",
                    )
                })?
                .to_vec(),
        );

        let (cert, dsign_kind) = match kind {
            HsTokenKind::Reply => (
                outcome
                    .remote_cert
                    .as_deref()
                    .expect("credential block above sets the certificate for a Reply"),
                outcome
                    .dsign_kind
                    .expect("credential block above sets dsign for a Reply"),
            ),
            _ => (
                ctx.remote_cert.ok_or_else(|| {
                    SecurityException::new(
                        ctx.context,
                        AuthErrorKind::BadSignature,
                        "no peer certificate available for signature verification",
                    )
                })?,
                ctx.remote_dsign.ok_or_else(|| {
                    SecurityException::new(
                        ctx.context,
                        AuthErrorKind::BadSignature,
                        "no peer signature algorithm known",
                    )
                })?,
            ),
        };

        let dh1_for_sig = ctx
            .dh1_ref
            .expect("Reply/Final validation always supplies dh1_ref");

        let tuple: [&BinaryProperty; 6] = match kind {
            HsTokenKind::Reply => {
                let dh2 = token
                    .find_binary_property(PROP_DH2)
                    .expect("dh2 presence checked above for a Reply");
                [
                    &hash_c2_val,
                    challenge2,
                    dh2,
                    challenge1,
                    dh1_for_sig,
                    &hash_c1_val,
                ]
            }
            _ => {
                let dh2 = ctx
                    .dh2_ref
                    .expect("Final validation always supplies dh2_ref");
                [
                    &hash_c1_val,
                    challenge1,
                    dh1_for_sig,
                    challenge2,
                    dh2,
                    &hash_c2_val,
                ]
            }
        };

        verify_signature(
            dsign_kind,
            &cert.public_key_bytes()?,
            &serialize_binary_properties(&tuple),
            &signature.value,
        )
        .map_err(|_| {
            SecurityException::new(
                ctx.context,
                AuthErrorKind::BadSignature,
                "handshake signature verification failed",
            )
        })?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props5_fixture() -> Vec<BinaryProperty> {
        build_props5(
            b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
            b"permissions",
            &[0x00, 0x03, 0x00, 0x00],
            AuthAlgoKind::EcPrime256v1,
            AuthAlgoKind::EcPrime256v1,
        )
    }

    #[test]
    fn test_props5_order_and_names() {
        let props = props5_fixture();
        let names: Vec<&str> = props.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["c.id", "c.perm", "c.pdata", "c.dsign_algo", "c.kagree_algo"]
        );
        assert_eq!(props[3].value, b"ECDSA-SHA256");
        assert_eq!(props[4].value, b"ECDH+prime256v1-CEUM");
    }

    #[test]
    fn test_hash_is_deterministic() {
        let props = props5_fixture();
        let refs: Vec<&BinaryProperty> = props.iter().collect();
        assert_eq!(hash_properties(&refs), hash_properties(&refs));
    }

    #[test]
    fn test_hash_changes_with_any_property() {
        let props = props5_fixture();
        let refs: Vec<&BinaryProperty> = props.iter().collect();
        let hash = hash_properties(&refs);

        let mut altered = props.clone();
        altered[1].value = b"other permissions".to_vec();
        let altered_refs: Vec<&BinaryProperty> = altered.iter().collect();
        assert_ne!(hash, hash_properties(&altered_refs));
    }

    #[test]
    fn test_handshake_info_initial_state() {
        let request = HandshakeInfo::new(1, 2, HandshakeOrigin::CreatedRequest);
        assert_eq!(request.state, HandshakeState::CreatedRequest);
        let reply = HandshakeInfo::new(1, 2, HandshakeOrigin::CreatedReply);
        assert_eq!(reply.state, HandshakeState::CreatedReply);
        assert_eq!(reply.secret_handle, 0);
    }

    #[test]
    fn test_reply_and_final_tuples_are_swaps() {
        let a = BinaryProperty::new(PROP_HASH_C1, vec![1; 32]);
        let b = BinaryProperty::new(PROP_CHALLENGE1, vec![2; 32]);
        let c = BinaryProperty::new(PROP_DH1, vec![3; 65]);
        let d = BinaryProperty::new(PROP_CHALLENGE2, vec![4; 32]);
        let e = BinaryProperty::new(PROP_DH2, vec![5; 65]);
        let f = BinaryProperty::new(PROP_HASH_C2, vec![6; 32]);

        let reply = serialize_binary_properties(&[&f, &d, &e, &b, &c, &a]);
        let final_ = serialize_binary_properties(&[&a, &b, &c, &d, &e, &f]);
        assert_ne!(reply, final_);
    }
}
