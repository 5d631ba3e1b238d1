// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end handshake scenarios driving two plugin instances against
//! each other with rcgen-minted certificate chains.

use std::sync::Arc;

use crate::crypto::{AuthAlgoKind, dh::DhKeyPair};
use crate::error::AuthErrorKind;
use crate::guid::GUID;
use crate::handshake::build_props5;
use crate::identity::adjusted_participant_guid;
use crate::pdata::serialize_pdata;
use crate::plugin::{
    Authentication, HandshakeHandle, HandshakeOutcome, IdentityHandle, ValidationOutcome,
    HANDLE_NIL,
};
use crate::token::{BinaryProperty, Property, Token};

use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, CertificateRevocationListParams,
    DnType, IsCa, KeyIdMethod, KeyPair, RevocationReason, RevokedCertParams, SerialNumber,
};

struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

fn make_ca(cn: &str) -> TestCa {
    let key = KeyPair::generate().expect("generate CA key");
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = date_time_ymd(2024, 1, 1);
    params.not_after = date_time_ymd(2035, 1, 1);
    let cert = params.self_signed(&key).expect("self-sign CA");
    TestCa { cert, key }
}

fn issue_cert(
    ca: &TestCa,
    cn: &str,
    serial: Vec<u8>,
    not_before: (i32, u8, u8),
    not_after: (i32, u8, u8),
) -> (rcgen::Certificate, KeyPair) {
    let key = KeyPair::generate().expect("generate participant key");
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.not_before = date_time_ymd(not_before.0, not_before.1, not_before.2);
    params.not_after = date_time_ymd(not_after.0, not_after.1, not_after.2);
    params.serial_number = Some(SerialNumber::from(serial));
    let cert = params
        .signed_by(&key, &ca.cert, &ca.key)
        .expect("sign participant cert");
    (cert, key)
}

struct Participant {
    auth: Arc<Authentication>,
    handle: IdentityHandle,
    adjusted: GUID,
    pdata: Vec<u8>,
    identity_token: Token,
}

fn qos_props(cert_pem: &str, ca_pem: &str, key_pem: &str) -> Vec<Property> {
    vec![
        Property::new(
            "dds.sec.auth.identity_certificate",
            format!("data:,{}", cert_pem),
        ),
        Property::new("dds.sec.auth.identity_ca", format!("data:,{}", ca_pem)),
        Property::new("dds.sec.auth.private_key", format!("data:,{}", key_pem)),
    ]
}

fn make_participant_with_props(
    ca: &TestCa,
    cn: &str,
    serial: Vec<u8>,
    candidate: GUID,
    extra_props: Vec<Property>,
) -> Participant {
    let (cert, key) = issue_cert(ca, cn, serial, (2024, 1, 1), (2034, 1, 1));
    let mut props = qos_props(&cert.pem(), &ca.cert.pem(), &key.serialize_pem());
    props.extend(extra_props);

    let auth = Authentication::new();
    let (handle, adjusted) = auth
        .validate_local_identity(0, &props, candidate)
        .expect("validate local identity");

    let mut credential = Token::new("DDS:Access:PermissionsCredential");
    credential.properties.push(Property::new(
        "dds.perm.cert",
        format!("permissions document for {}", cn),
    ));
    auth.set_permissions_credential_and_token(handle, &credential, &Token::nil())
        .expect("set permissions credential");

    let identity_token = auth.get_identity_token(handle).expect("identity token");
    let pdata = serialize_pdata(&adjusted);

    Participant {
        auth,
        handle,
        adjusted,
        pdata,
        identity_token,
    }
}

fn make_participant(ca: &TestCa, cn: &str, candidate: GUID) -> Participant {
    make_participant_with_props(ca, cn, vec![0x10, cn.len() as u8], candidate, Vec::new())
}

fn candidate_a() -> GUID {
    GUID::new(
        [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xab],
        [0xb0, 0xb1, 0xb2, 0x01],
    )
}

fn candidate_b() -> GUID {
    GUID::new(
        [0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xbb],
        [0xb0, 0xb1, 0xb2, 0x01],
    )
}

/// Cross-validate two participants and return the handles each side
/// assigned to the other, plus who must initiate.
fn discover(
    a: &Participant,
    b: &Participant,
) -> (IdentityHandle, IdentityHandle, ValidationOutcome) {
    let (b_at_a, auth_req, outcome_a) = a
        .auth
        .validate_remote_identity(a.handle, None, &b.identity_token, b.adjusted)
        .expect("a validates b");
    let auth_req = auth_req.expect("no inbound auth request, so one must be produced");

    let (a_at_b, none, outcome_b) = b
        .auth
        .validate_remote_identity(b.handle, Some(&auth_req), &a.identity_token, a.adjusted)
        .expect("b validates a");
    assert!(none.is_none(), "inbound auth request suppresses the outbound one");

    // exactly one side initiates
    match outcome_a {
        ValidationOutcome::PendingHandshakeRequest => {
            assert_eq!(outcome_b, ValidationOutcome::PendingHandshakeMessage);
        }
        ValidationOutcome::PendingHandshakeMessage => {
            assert_eq!(outcome_b, ValidationOutcome::PendingHandshakeRequest);
        }
    }
    (b_at_a, a_at_b, outcome_a)
}

struct Completed {
    initiator_hs: HandshakeHandle,
    responder_hs: HandshakeHandle,
    final_token: Token,
}

/// Drive a full Request/Reply/Final exchange; `init` initiates.
fn run_handshake(
    init: &Participant,
    init_peer_handle: IdentityHandle,
    resp: &Participant,
    resp_peer_handle: IdentityHandle,
) -> Completed {
    let (init_hs, request) = init
        .auth
        .begin_handshake_request(init.handle, init_peer_handle, &init.pdata)
        .expect("begin handshake request");
    assert_eq!(request.class_id, "DDS:Auth:PKI-DH:1.0+Req");

    let (resp_hs, reply) = resp
        .auth
        .begin_handshake_reply(resp.handle, resp_peer_handle, &resp.pdata, &request)
        .expect("begin handshake reply");
    assert_eq!(reply.class_id, "DDS:Auth:PKI-DH:1.0+Reply");

    let (final_token, outcome) = init
        .auth
        .process_handshake(init_hs, &reply)
        .expect("initiator processes reply");
    assert_eq!(outcome, HandshakeOutcome::OkFinalMessage);
    let final_token = final_token.expect("initiator must emit the final token");
    assert_eq!(final_token.class_id, "DDS:Auth:PKI-DH:1.0+Final");

    let (nothing, outcome) = resp
        .auth
        .process_handshake(resp_hs, &final_token)
        .expect("responder processes final");
    assert_eq!(outcome, HandshakeOutcome::Ok);
    assert!(nothing.is_none());

    Completed {
        initiator_hs: init_hs,
        responder_hs: resp_hs,
        final_token,
    }
}

/// Discover and run a full handshake with `a` as initiator.
///
/// Which side *should* initiate is advisory (the ValidationOutcome);
/// `begin_handshake_request` itself accepts either orientation, so the
/// fixtures keep `a` as initiator for determinism.
fn establish(a: &Participant, b: &Participant) -> Completed {
    let (b_at_a, a_at_b, _) = discover(a, b);
    run_handshake(a, b_at_a, b, a_at_b)
}

#[test]
fn test_full_handshake_derives_equal_secrets() {
    let ca = make_ca("handshake test CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());

    let completed = establish(&alice, &bob);
    let (init, resp) = (&alice, &bob);

    let secret_init = init
        .auth
        .shared_secret_data(completed.initiator_hs)
        .expect("initiator secret");
    let secret_resp = resp
        .auth
        .shared_secret_data(completed.responder_hs)
        .expect("responder secret");

    assert_eq!(secret_init.secret(), secret_resp.secret());
    assert_eq!(secret_init.challenge1(), secret_resp.challenge1());
    assert_eq!(secret_init.challenge2(), secret_resp.challenge2());

    // the opaque references are live on both sides
    assert_ne!(
        init.auth.get_shared_secret(completed.initiator_hs).unwrap(),
        HANDLE_NIL
    );
    assert_ne!(
        resp.auth.get_shared_secret(completed.responder_hs).unwrap(),
        HANDLE_NIL
    );
}

#[test]
fn test_peer_credential_token_after_handshake() {
    let ca = make_ca("credential test CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    let completed = establish(&alice, &bob);

    // both sides can produce the peer credential token
    for (participant, hs, peer_cn) in [
        (&alice, completed.initiator_hs, "bob"),
        (&bob, completed.responder_hs, "alice"),
    ] {
        let token = participant
            .auth
            .get_authenticated_peer_credential_token(hs)
            .expect("peer credential token");
        assert_eq!(token.class_id, "DDS:Auth:PKI-DH:1.0");
        let c_id = token.find_property("c.id").expect("c.id");
        assert!(!c_id.propagate);
        assert!(c_id.value.contains("BEGIN CERTIFICATE"));
        let c_perm = token.find_property("c.perm").expect("c.perm");
        assert!(!c_perm.propagate);
        assert!(
            c_perm.value.contains(&format!("permissions document for {}", peer_cn)),
            "peer permissions document expected"
        );
    }
}

#[test]
fn test_tampered_reply_signature_fails_and_poisons_handshake() {
    let ca = make_ca("tamper test CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    let (b_at_a, a_at_b, _) = discover(&alice, &bob);

    let (init_hs, request) = alice
        .auth
        .begin_handshake_request(alice.handle, b_at_a, &alice.pdata)
        .unwrap();
    let (_resp_hs, mut reply) = bob
        .auth
        .begin_handshake_reply(bob.handle, a_at_b, &bob.pdata, &request)
        .unwrap();

    let signature = reply
        .binary_properties
        .iter_mut()
        .find(|p| p.name == "signature")
        .expect("reply carries a signature");
    signature.value[8] ^= 0x01;

    let err = alice.auth.process_handshake(init_hs, &reply).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::BadSignature);

    // provisional peer state is cleared and the handshake is poisoned
    let err = alice
        .auth
        .get_authenticated_peer_credential_token(init_hs)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::EmptyValue);
    let err = alice.auth.process_handshake(init_hs, &reply).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidHandle);
    let err = alice.auth.get_shared_secret(init_hs).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::EmptyValue);
}

#[test]
fn test_peer_from_unrelated_ca_is_rejected() {
    let ca = make_ca("genuine CA");
    let rogue_ca = make_ca("rogue CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let mallory = make_participant(&rogue_ca, "mallory", candidate_b());

    let (m_at_a, a_at_m, _) = discover(&alice, &mallory);
    let (_hs, request) = mallory
        .auth
        .begin_handshake_request(mallory.handle, a_at_m, &mallory.pdata)
        .unwrap();

    let err = alice
        .auth
        .begin_handshake_reply(alice.handle, m_at_a, &alice.pdata, &request)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::ChainInvalid);
}

#[test]
fn test_revoked_peer_is_rejected() {
    let ca = make_ca("revocation test CA");
    let revoked_serial = vec![0x05, 0x42];

    let crl_params = CertificateRevocationListParams {
        this_update: date_time_ymd(2025, 1, 1),
        next_update: date_time_ymd(2034, 1, 1),
        crl_number: SerialNumber::from(vec![0x01]),
        issuing_distribution_point: None,
        revoked_certs: vec![RevokedCertParams {
            serial_number: SerialNumber::from(revoked_serial.clone()),
            revocation_time: date_time_ymd(2025, 1, 1),
            reason_code: Some(RevocationReason::KeyCompromise),
            invalidity_date: None,
        }],
        key_identifier_method: KeyIdMethod::Sha256,
    };
    let crl = crl_params
        .signed_by(&ca.cert, &ca.key)
        .expect("sign CRL");

    let alice = make_participant_with_props(
        &ca,
        "alice",
        vec![0x11],
        candidate_a(),
        vec![Property::new(
            "org.eclipse.cyclonedds.sec.auth.crl",
            format!("data:,{}", crl.pem().expect("CRL pem")),
        )],
    );
    let bob = make_participant_with_props(&ca, "bob", revoked_serial, candidate_b(), vec![]);

    let (b_at_a, a_at_b, _) = discover(&alice, &bob);
    let (_hs, request) = bob
        .auth
        .begin_handshake_request(bob.handle, a_at_b, &bob.pdata)
        .unwrap();

    let err = alice
        .auth
        .begin_handshake_reply(alice.handle, b_at_a, &alice.pdata, &request)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::Revoked);
}

#[test]
fn test_expired_peer_is_rejected() {
    let ca = make_ca("expiry test CA");
    let alice = make_participant(&ca, "alice", candidate_a());

    // an expired certificate cannot pass validate_local_identity, so the
    // Request token is crafted directly
    let (eve_cert, _eve_key) = issue_cert(&ca, "eve", vec![0x66], (2020, 1, 1), (2021, 1, 1));
    let eve_cert_loaded =
        crate::crypto::cert::Certificate::from_pem(eve_cert.pem().as_bytes()).unwrap();
    let eve_adjusted =
        adjusted_participant_guid(&eve_cert_loaded, &candidate_b()).unwrap();

    let (eve_at_a, _, _) = alice
        .auth
        .validate_remote_identity(
            alice.handle,
            None,
            &Token::new("DDS:Auth:PKI-DH:1.0"),
            eve_adjusted,
        )
        .unwrap();

    let dh = DhKeyPair::generate(AuthAlgoKind::EcPrime256v1).unwrap();
    let mut request = Token::new("DDS:Auth:PKI-DH:1.0+Req");
    request.binary_properties = build_props5(
        eve_cert.pem().as_bytes(),
        b"permissions document for eve",
        &serialize_pdata(&eve_adjusted),
        AuthAlgoKind::EcPrime256v1,
        AuthAlgoKind::EcPrime256v1,
    );
    request
        .binary_properties
        .push(BinaryProperty::new("dh1", dh.public_bytes().to_vec()));
    request
        .binary_properties
        .push(BinaryProperty::new("challenge1", vec![0xaa; 32]));

    let err = alice
        .auth
        .begin_handshake_reply(alice.handle, eve_at_a, &alice.pdata, &request)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::Expired);
}

#[test]
fn test_wrong_challenge_size_is_rejected() {
    let ca = make_ca("challenge size CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    let (b_at_a, a_at_b, _) = discover(&alice, &bob);

    let (_hs, request) = bob
        .auth
        .begin_handshake_request(bob.handle, a_at_b, &bob.pdata)
        .unwrap();

    for bad_len in [31usize, 33] {
        let mut tampered = request.clone();
        let challenge = tampered
            .binary_properties
            .iter_mut()
            .find(|p| p.name == "challenge1")
            .expect("request carries challenge1");
        challenge.value = vec![0xcc; bad_len];

        let err = alice
            .auth
            .begin_handshake_reply(alice.handle, b_at_a, &alice.pdata, &tampered)
            .unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::WrongSize, "length {}", bad_len);
    }
}

#[test]
fn test_pdata_guid_mismatch_is_rejected() {
    let ca = make_ca("pdata test CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    let (b_at_a, a_at_b, _) = discover(&alice, &bob);

    let (_hs, mut request) = bob
        .auth
        .begin_handshake_request(bob.handle, a_at_b, &bob.pdata)
        .unwrap();

    // claim a participant key unrelated to the certificate
    let foreign = serialize_pdata(&GUID::new([0x01; 12], [0; 4]));
    let pdata_prop = request
        .binary_properties
        .iter_mut()
        .find(|p| p.name == "c.pdata")
        .expect("request carries c.pdata");
    pdata_prop.value = foreign;

    let err = alice
        .auth
        .begin_handshake_reply(alice.handle, b_at_a, &alice.pdata, &request)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::PDataMismatch);
}

#[test]
fn test_request_property_order_outside_hash_does_not_matter() {
    let ca = make_ca("reorder test CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    let (b_at_a, a_at_b, _) = discover(&alice, &bob);

    let (_hs, mut request) = bob
        .auth
        .begin_handshake_request(bob.handle, a_at_b, &bob.pdata)
        .unwrap();

    // move the trailing challenge1 to the front; the optional hash_c1
    // carried by the token must still match the receiver's computation
    assert!(request.find_binary_property("hash_c1").is_some());
    let challenge = request
        .binary_properties
        .pop()
        .expect("challenge1 is the last property");
    assert_eq!(challenge.name, "challenge1");
    request.binary_properties.insert(0, challenge);

    alice
        .auth
        .begin_handshake_reply(alice.handle, b_at_a, &alice.pdata, &request)
        .expect("reordered non-hash properties must not break validation");
}

#[test]
fn test_handshake_without_optional_properties() {
    let ca = make_ca("mandatory-only CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    alice.auth.set_include_optional(false);
    bob.auth.set_include_optional(false);

    let completed = establish(&alice, &bob);
    assert!(completed.final_token.find_binary_property("hash_c1").is_none());
    assert!(completed.final_token.find_binary_property("dh2").is_none());
    assert!(completed.final_token.find_binary_property("signature").is_some());
}

#[test]
fn test_remote_identity_reuse_and_consistency() {
    let ca = make_ca("reuse test CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());

    let (first, _, _) = alice
        .auth
        .validate_remote_identity(alice.handle, None, &bob.identity_token, bob.adjusted)
        .unwrap();
    let (second, _, _) = alice
        .auth
        .validate_remote_identity(alice.handle, None, &bob.identity_token, bob.adjusted)
        .unwrap();
    assert_eq!(first, second, "same GUID must map to one RemoteIdentity");

    let mut different = bob.identity_token.clone();
    different.properties[0].value = "CN=somebody else".to_string();
    let err = alice
        .auth
        .validate_remote_identity(alice.handle, None, &different, bob.adjusted)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InconsistentRemoteIdentity);
}

#[test]
fn test_auth_request_token_shape() {
    let ca = make_ca("auth request CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());

    let (_handle, auth_req, _) = alice
        .auth
        .validate_remote_identity(alice.handle, None, &bob.identity_token, bob.adjusted)
        .unwrap();
    let auth_req = auth_req.expect("outbound auth request expected");
    assert_eq!(auth_req.class_id, "DDS:Auth:PKI-DH:1.0+AuthReq");
    let challenge = auth_req
        .find_binary_property("future_challenge")
        .expect("future_challenge present");
    assert_eq!(challenge.value.len(), 32);
    assert!(challenge.propagate);
}

#[test]
fn test_unsupported_token_version_is_rejected() {
    let ca = make_ca("version test CA");
    let alice = make_participant(&ca, "alice", candidate_a());

    let mut token = Token::new("DDS:Auth:PKI-DH:1.2");
    token.properties.push(Property::new("dds.cert.sn", "CN=x"));
    let err = alice
        .auth
        .validate_remote_identity(alice.handle, None, &token, candidate_b())
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::UnsupportedVersion);

    // minor 1 with a vendor suffix is fine
    let token = Token::new("DDS:Auth:PKI-DH:1.1+Vendor");
    alice
        .auth
        .validate_remote_identity(alice.handle, None, &token, candidate_b())
        .expect("1.1+Vendor must be accepted");
}

#[test]
fn test_crl_and_trusted_ca_dir_cannot_combine() {
    let ca = make_ca("combine test CA");
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ca.pem"), ca.cert.pem()).unwrap();

    let (cert, key) = issue_cert(&ca, "alice", vec![0x01], (2024, 1, 1), (2034, 1, 1));
    let mut props = qos_props(&cert.pem(), &ca.cert.pem(), &key.serialize_pem());
    props.push(Property::new(
        "dds.sec.access.trusted_ca_dir",
        dir.path().display().to_string(),
    ));
    props.push(Property::new(
        "org.eclipse.cyclonedds.sec.auth.crl",
        "data:,irrelevant",
    ));

    let auth = Authentication::new();
    let err = auth
        .validate_local_identity(0, &props, candidate_a())
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::CannotCombineCrlAndTrustedCaList);
}

#[test]
fn test_trusted_ca_dir_must_contain_identity_ca() {
    let ca = make_ca("trusted dir CA");
    let unrelated = make_ca("some other CA");

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("other.pem"), unrelated.cert.pem()).unwrap();

    let (cert, key) = issue_cert(&ca, "alice", vec![0x02], (2024, 1, 1), (2034, 1, 1));
    let mut props = qos_props(&cert.pem(), &ca.cert.pem(), &key.serialize_pem());
    props.push(Property::new(
        "dds.sec.access.trusted_ca_dir",
        dir.path().display().to_string(),
    ));

    let auth = Authentication::new();
    let err = auth
        .validate_local_identity(0, &props, candidate_a())
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::CaNotTrusted);

    // with the identity CA present in the directory, validation passes
    std::fs::write(dir.path().join("ca.pem"), ca.cert.pem()).unwrap();
    let auth = Authentication::new();
    auth.validate_local_identity(0, &props, candidate_a())
        .expect("identity CA is in the trusted directory");
}

#[test]
fn test_adjusted_guid_is_stable_for_fixed_material() {
    let ca = make_ca("stability CA");
    let (cert, key) = issue_cert(&ca, "alice", vec![0x03], (2024, 1, 1), (2034, 1, 1));
    let props = qos_props(&cert.pem(), &ca.cert.pem(), &key.serialize_pem());

    let auth = Authentication::new();
    let (h1, adjusted1) = auth.validate_local_identity(0, &props, candidate_b()).unwrap();
    let (h2, adjusted2) = auth.validate_local_identity(0, &props, candidate_b()).unwrap();

    assert_ne!(h1, h2, "handles are never reused");
    assert_eq!(adjusted1, adjusted2, "adjusted GUID is deterministic");
    assert_eq!(adjusted1.entity_id, candidate_b().entity_id);
    assert_eq!(adjusted1.prefix[0] & 0x80, 0x80);
}

#[test]
fn test_return_identity_handle_semantics() {
    let ca = make_ca("return test CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    let completed = establish(&alice, &bob);

    // nil is idempotent
    alice.auth.return_identity_handle(HANDLE_NIL).unwrap();

    // a handshake handle is not an identity handle
    let err = alice
        .auth
        .return_identity_handle(completed.initiator_hs)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::WrongHandleKind);

    // returning the local identity tears down relations and handshakes;
    // a second return reports an invalid handle and changes nothing
    alice.auth.return_identity_handle(alice.handle).unwrap();
    let err = alice.auth.return_identity_handle(alice.handle).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidHandle);
    let err = alice
        .auth
        .get_shared_secret(completed.initiator_hs)
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidHandle);
}

#[test]
fn test_return_handshake_handle_twice_fails() {
    let ca = make_ca("handshake return CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());
    let (b_at_a, _a_at_b, _) = discover(&alice, &bob);

    let (hs, _request) = alice
        .auth
        .begin_handshake_request(alice.handle, b_at_a, &alice.pdata)
        .unwrap();

    alice.auth.return_handshake_handle(HANDLE_NIL).unwrap();
    alice.auth.return_handshake_handle(hs).unwrap();
    let err = alice.auth.return_handshake_handle(hs).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidHandle);
}

#[test]
fn test_identity_token_shape() {
    let ca = make_ca("token shape CA");
    let alice = make_participant(&ca, "alice", candidate_a());

    let token = &alice.identity_token;
    assert_eq!(token.class_id, "DDS:Auth:PKI-DH:1.0");
    assert!(token
        .find_property("dds.cert.sn")
        .expect("dds.cert.sn")
        .value
        .contains("alice"));
    assert_eq!(
        token.find_property("dds.cert.algo").expect("algo").value,
        "EC-prime256v1"
    );
    assert!(token
        .find_property("dds.ca.sn")
        .expect("dds.ca.sn")
        .value
        .contains("token shape CA"));
    assert_eq!(
        token.find_property("dds.ca.algo").expect("ca algo").value,
        "EC-prime256v1"
    );
}

#[test]
fn test_missing_configuration_property() {
    let auth = Authentication::new();
    let props = vec![Property::new(
        "dds.sec.auth.identity_certificate",
        "data:,whatever",
    )];
    let err = auth
        .validate_local_identity(0, &props, candidate_a())
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::MissingProperty);
    assert_eq!(err.context, "validate_local_identity");
}

#[test]
fn test_concurrent_remote_validation_yields_one_identity() {
    let ca = make_ca("concurrency CA");
    let alice = make_participant(&ca, "alice", candidate_a());
    let bob = make_participant(&ca, "bob", candidate_b());

    let mut workers = Vec::new();
    for _ in 0..8 {
        let auth = alice.auth.clone();
        let local = alice.handle;
        let token = bob.identity_token.clone();
        let guid = bob.adjusted;
        workers.push(std::thread::spawn(move || {
            let (handle, _, _) = auth
                .validate_remote_identity(local, None, &token, guid)
                .expect("concurrent validation");
            handle
        }));
    }

    let handles: Vec<IdentityHandle> = workers
        .into_iter()
        .map(|w| w.join().expect("worker panicked"))
        .collect();
    assert!(
        handles.windows(2).all(|w| w[0] == w[1]),
        "all threads must observe the same RemoteIdentity: {:?}",
        handles
    );
}

#[test]
fn test_process_handshake_rejects_wrong_handle_kind() {
    let ca = make_ca("kind test CA");
    let alice = make_participant(&ca, "alice", candidate_a());

    let err = alice
        .auth
        .process_handshake(alice.handle, &Token::nil())
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::WrongHandleKind);

    let err = alice
        .auth
        .process_handshake(9999, &Token::nil())
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidHandle);
}
