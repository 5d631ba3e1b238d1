// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Authentication plugin public operations.
//!
//! [`Authentication`] is the process-wide plugin instance: it owns the
//! object registry, the remote-GUID index, the trusted-CA list and the
//! expiry dispatcher. Every public operation takes the single registry
//! mutex on entry; listener callbacks and the expiry thread never run
//! with that mutex held.
//!
//! # OMG DDS Security v1.1 Sec.8.3 (Authentication plugin)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::{
    find_property, load_security_material, load_trusted_ca_dir, require_property,
    PROP_CRL, PROP_IDENTITY_CA, PROP_IDENTITY_CERT, PROP_PASSWORD, PROP_PRIVATE_KEY,
    PROP_TRUSTED_CA_DIR,
};
use crate::crypto::cert::{Certificate, Crl, EXPIRY_NEVER};
use crate::crypto::dh::DhKeyPair;
use crate::crypto::key::PrivateKey;
use crate::crypto::{generate_challenge, AuthAlgoKind, CHALLENGE_SIZE};
use crate::error::{AuthErrorKind, SecResult, SecurityException};
use crate::expiry::ExpiryDispatcher;
use crate::guid::GUID;
use crate::handshake::{
    build_props5, hash_properties, sign_tuple, validate_handshake_token, HandshakeInfo,
    HandshakeOrigin, HandshakeState, HsTokenKind, HsValidationCtx, SharedSecretData,
    HANDSHAKE_FINAL_CLASS_ID, HANDSHAKE_REPLY_CLASS_ID, HANDSHAKE_REQUEST_CLASS_ID,
    PROP_CHALLENGE1, PROP_CHALLENGE2, PROP_DH1, PROP_DH2, PROP_HASH_C1, PROP_HASH_C2,
    PROP_SIGNATURE,
};
use crate::identity::{
    adjusted_participant_guid, build_auth_request_token, build_identity_token,
    validate_auth_request_token, validate_remote_identity_token, Challenge,
    IdentityRelation, LocalIdentityInfo, RemoteIdentityInfo, AUTH_TOKEN_CLASS_ID,
    PERMISSIONS_CREDENTIAL_CLASS_ID, PROP_PERMISSIONS_CERT,
};
use crate::registry::{ObjectKind, Registry, SecurityObject};
use crate::token::{BinaryProperty, Property, Token};

/// Opaque 64-bit identity handle; nil is 0.
pub type IdentityHandle = u64;
/// Opaque 64-bit handshake handle; nil is 0.
pub type HandshakeHandle = u64;
/// Opaque 64-bit shared-secret reference; nil is 0.
pub type SharedSecretHandle = u64;

/// The nil handle.
pub const HANDLE_NIL: u64 = 0;

/// Which side must send the first handshake token after remote-identity
/// validation, decided by lexicographic GUID comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Local GUID sorts first: call `begin_handshake_request`
    PendingHandshakeRequest,
    /// Remote GUID sorts first: wait for the peer's Request
    PendingHandshakeMessage,
}

/// Result of a successful `process_handshake`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Handshake complete, no further message (responder side)
    Ok,
    /// Handshake complete, the returned Final token must be sent
    OkFinalMessage,
}

/// Listener for identity lifecycle events.
pub trait AuthenticationListener: Send + Sync {
    /// An identity's certificate reached its notAfter time.
    fn on_revoke_identity(&self, identity_handle: IdentityHandle);
}

struct AuthState {
    registry: Registry,
    /// Remote GUID -> remote identity handle
    remote_guid_index: HashMap<[u8; 16], u64>,
    /// Anchors loaded from the trusted-CA directory
    trusted_ca_list: Vec<Arc<Certificate>>,
}

/// PKI-DH authentication plugin instance.
pub struct Authentication {
    state: Mutex<AuthState>,
    listener: Mutex<Option<Arc<dyn AuthenticationListener>>>,
    dispatcher: ExpiryDispatcher,
    /// Emit the optional hash/dh token properties (on by default)
    include_optional: AtomicBool,
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Authentication")
    }
}

/// Rewrite an inner error so the exception names the public operation it
/// surfaced from.
fn with_context(context: &'static str, e: SecurityException) -> SecurityException {
    SecurityException { context, ..e }
}

impl Authentication {
    /// Create the plugin instance and start its expiry dispatcher.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Authentication>| {
            let weak = weak.clone();
            let dispatcher = ExpiryDispatcher::spawn(Box::new(move |identity_handle| {
                if let Some(auth) = weak.upgrade() {
                    auth.deliver_expiry(identity_handle);
                }
            }));
            Self {
                state: Mutex::new(AuthState {
                    registry: Registry::new(),
                    remote_guid_index: HashMap::new(),
                    trusted_ca_list: Vec::new(),
                }),
                listener: Mutex::new(None),
                dispatcher,
                include_optional: AtomicBool::new(true),
            }
        })
    }

    /// Control emission of the optional `hash_c1`/`hash_c2`/`dh1`/`dh2`
    /// copies on outbound tokens. They are diagnostics; receivers must
    /// accept tokens with or without them.
    pub fn set_include_optional(&self, include: bool) {
        self.include_optional.store(include, Ordering::Relaxed);
    }

    /// Install or clear the listener. Expiry delivery is enabled exactly
    /// while a listener is installed.
    pub fn set_listener(&self, listener: Option<Arc<dyn AuthenticationListener>>) {
        let enabled = listener.is_some();
        *self.listener.lock() = listener;
        self.dispatcher.set_enabled(enabled);
    }

    /// Expiry callback target, invoked on the dispatcher thread.
    fn deliver_expiry(&self, identity_handle: u64) {
        {
            let state = self.state.lock();
            match state.registry.kind_of(identity_handle) {
                Some(ObjectKind::LocalIdentity | ObjectKind::RemoteIdentity) => {}
                _ => return, // identity was returned before the timer fired
            }
        }

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            log::debug!(
                "[auth] certificate expired for identity handle {}",
                identity_handle
            );
            listener.on_revoke_identity(identity_handle);
        }

        // clear the stored timer only after the lookup succeeded
        let mut state = self.state.lock();
        if let Ok(local) = state.registry.local_mut("on_revoke_identity", identity_handle)
        {
            local.timer = 0;
        } else if let Ok(remote) =
            state.registry.remote_mut("on_revoke_identity", identity_handle)
        {
            remote.timer = 0;
        }
    }

    /// Validate the local participant's identity credentials and derive
    /// its adjusted GUID.
    pub fn validate_local_identity(
        &self,
        domain_id: u32,
        participant_qos: &[Property],
        candidate_guid: GUID,
    ) -> SecResult<(IdentityHandle, GUID)> {
        const CTX: &str = "validate_local_identity";

        let cert_value = require_property(CTX, participant_qos, PROP_IDENTITY_CERT)?;
        let ca_value = require_property(CTX, participant_qos, PROP_IDENTITY_CA)?;
        let key_value = require_property(CTX, participant_qos, PROP_PRIVATE_KEY)?;
        let password = find_property(participant_qos, PROP_PASSWORD);
        let trusted_ca_dir =
            find_property(participant_qos, PROP_TRUSTED_CA_DIR).filter(|v| !v.is_empty());
        let crl_value =
            find_property(participant_qos, PROP_CRL).filter(|v| !v.is_empty());

        let trusted_ca_list = match trusted_ca_dir {
            Some(dir) => load_trusted_ca_dir(CTX, dir)?,
            None => Vec::new(),
        };

        let ca_pem = load_security_material(CTX, ca_value)?;
        let identity_ca = Certificate::from_pem(&ca_pem).map_err(|e| with_context(CTX, e))?;

        if !trusted_ca_list.is_empty() {
            if crl_value.is_some() {
                // A CRL is assumed to belong to the own CA; with a list of
                // anchors that assumption does not hold, so the combination
                // is rejected outright.
                return Err(SecurityException::new(
                    CTX,
                    AuthErrorKind::CannotCombineCrlAndTrustedCaList,
                    "cannot specify both CRL and trusted_ca_dir",
                ));
            }
            let fingerprint = identity_ca.fingerprint_sha1();
            if !trusted_ca_list
                .iter()
                .any(|anchor| anchor.fingerprint_sha1() == fingerprint)
            {
                return Err(SecurityException::new(
                    CTX,
                    AuthErrorKind::CaNotTrusted,
                    "identity CA is not in the trusted CA list",
                ));
            }
        }

        let cert_pem = load_security_material(CTX, cert_value)?;
        let identity_cert =
            Certificate::from_pem(&cert_pem).map_err(|e| with_context(CTX, e))?;

        let key_pem = load_security_material(CTX, key_value)?;
        let private_key =
            PrivateKey::from_pem(&key_pem, password).map_err(|e| with_context(CTX, e))?;

        let crl = match crl_value {
            Some(value) => {
                let crl_pem = load_security_material(CTX, value)?;
                Some(Arc::new(
                    Crl::from_pem(&crl_pem).map_err(|e| with_context(CTX, e))?,
                ))
            }
            None => None,
        };

        crate::crypto::cert::verify_certificate(&identity_cert, &identity_ca, crl.as_deref())
            .map_err(|e| with_context(CTX, e))?;

        let cert_expiry = identity_cert
            .expiry_timestamp()
            .map_err(|e| with_context(CTX, e))?;
        let dsign_kind = identity_cert.algo_kind().map_err(|e| with_context(CTX, e))?;
        let adjusted_guid = adjusted_participant_guid(&identity_cert, &candidate_guid)
            .map_err(|e| with_context(CTX, e))?;

        let handle = {
            let mut state = self.state.lock();
            if trusted_ca_dir.is_some() {
                state.trusted_ca_list = trusted_ca_list;
            }
            let handle = state.registry.allocate_handle();
            state.registry.insert(
                handle,
                SecurityObject::LocalIdentity(LocalIdentityInfo {
                    domain_id,
                    candidate_guid,
                    adjusted_guid,
                    identity_cert: Arc::new(identity_cert),
                    identity_ca: Arc::new(identity_ca),
                    private_key: Arc::new(private_key),
                    crl,
                    dsign_kind,
                    kagree_kind: AuthAlgoKind::EcPrime256v1,
                    pdata: Vec::new(),
                    permissions_document: Vec::new(),
                    timer: 0,
                }),
            );
            handle
        };

        if cert_expiry != EXPIRY_NEVER {
            let timer = self.dispatcher.add(handle, cert_expiry);
            let mut state = self.state.lock();
            if let Ok(local) = state.registry.local_mut(CTX, handle) {
                local.timer = timer;
            }
        }

        log::debug!(
            "[auth] validated local identity {} for domain {} (adjusted guid {})",
            handle,
            domain_id,
            adjusted_guid
        );
        Ok((handle, adjusted_guid))
    }

    /// Produce the identity token advertised through discovery.
    pub fn get_identity_token(&self, identity_handle: IdentityHandle) -> SecResult<Token> {
        const CTX: &str = "get_identity_token";
        let state = self.state.lock();
        let local = state.registry.local(CTX, identity_handle)?;
        let ca_kind = local.identity_ca.algo_kind().map_err(|e| with_context(CTX, e))?;
        build_identity_token(
            &local.identity_cert,
            &local.identity_ca,
            local.dsign_kind,
            ca_kind,
        )
        .map_err(|e| with_context(CTX, e))
    }

    /// Produce the (empty) identity status token.
    pub fn get_identity_status_token(
        &self,
        identity_handle: IdentityHandle,
    ) -> SecResult<Token> {
        const CTX: &str = "get_identity_status_token";
        let state = self.state.lock();
        state.registry.local(CTX, identity_handle)?;
        Ok(Token::new(AUTH_TOKEN_CLASS_ID))
    }

    /// Store the permissions document supplied by the Access Control
    /// plugin; it travels opaquely in handshake tokens.
    pub fn set_permissions_credential_and_token(
        &self,
        identity_handle: IdentityHandle,
        permissions_credential: &Token,
        _permissions_token: &Token,
    ) -> SecResult<()> {
        const CTX: &str = "set_permissions_credential_and_token";

        if permissions_credential.class_id != PERMISSIONS_CREDENTIAL_CLASS_ID {
            return Err(SecurityException::new(
                CTX,
                AuthErrorKind::BadClassId,
                format!(
                    "permissions credential has class_id '{}'",
                    permissions_credential.class_id
                ),
            ));
        }
        let document = permissions_credential
            .find_property(PROP_PERMISSIONS_CERT)
            .ok_or_else(|| {
                SecurityException::new(
                    CTX,
                    AuthErrorKind::MissingProperty,
                    format!("permissions credential lacks '{}'", PROP_PERMISSIONS_CERT),
                )
            })?;

        let mut state = self.state.lock();
        let local = state.registry.local_mut(CTX, identity_handle)?;
        local.permissions_document = document.value.as_bytes().to_vec();
        Ok(())
    }

    /// Validate a discovered peer's identity token, creating or reusing
    /// the RemoteIdentity and its relation to the local identity.
    pub fn validate_remote_identity(
        &self,
        local_identity_handle: IdentityHandle,
        remote_auth_request_token: Option<&Token>,
        remote_identity_token: &Token,
        remote_guid: GUID,
    ) -> SecResult<(IdentityHandle, Option<Token>, ValidationOutcome)> {
        const CTX: &str = "validate_remote_identity";

        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.registry.local(CTX, local_identity_handle)?;
        validate_remote_identity_token(CTX, remote_identity_token)?;

        let rchallenge = remote_auth_request_token
            .map(|token| validate_auth_request_token(CTX, token))
            .transpose()?;
        let lchallenge = generate_challenge(CTX)?;

        let guid_key = remote_guid.as_bytes();
        let remote_handle = match state.remote_guid_index.get(&guid_key).copied() {
            None => {
                let handle = state.registry.allocate_handle();
                let mut remote =
                    RemoteIdentityInfo::new(remote_guid, remote_identity_token.clone());
                remote.links.insert(
                    local_identity_handle,
                    IdentityRelation {
                        local_handle: local_identity_handle,
                        remote_handle: handle,
                        lchallenge: Challenge(lchallenge),
                        rchallenge: rchallenge.map(Challenge),
                    },
                );
                state
                    .registry
                    .insert(handle, SecurityObject::RemoteIdentity(remote));
                state.remote_guid_index.insert(guid_key, handle);
                log::debug!("[auth] new remote identity {} ({})", handle, remote_guid);
                handle
            }
            Some(handle) => {
                let remote = state.registry.remote_mut(CTX, handle)?;
                if remote.identity_token != *remote_identity_token {
                    return Err(SecurityException::new(
                        CTX,
                        AuthErrorKind::InconsistentRemoteIdentity,
                        "remote identity token does not match the previously received one",
                    ));
                }
                match remote.links.entry(local_identity_handle) {
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(IdentityRelation {
                            local_handle: local_identity_handle,
                            remote_handle: handle,
                            lchallenge: Challenge(lchallenge),
                            rchallenge: rchallenge.map(Challenge),
                        });
                    }
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        // the existing relation keeps its challenge; a new
                        // auth request replaces the pinned future challenge
                        if let Some(rchallenge) = rchallenge {
                            entry.get_mut().rchallenge = Some(Challenge(rchallenge));
                        }
                    }
                }
                handle
            }
        };

        let outbound = if remote_auth_request_token.is_none() {
            let remote = state.registry.remote(CTX, remote_handle)?;
            let relation = remote
                .links
                .get(&local_identity_handle)
                .expect("relation installed above");
            Some(build_auth_request_token(&relation.lchallenge))
        } else {
            None
        };

        let adjusted = state.registry.local(CTX, local_identity_handle)?.adjusted_guid;
        let outcome = if adjusted.as_bytes() < remote_guid.as_bytes() {
            ValidationOutcome::PendingHandshakeRequest
        } else {
            ValidationOutcome::PendingHandshakeMessage
        };
        Ok((remote_handle, outbound, outcome))
    }

    /// Start a handshake as initiator, emitting the Request token.
    pub fn begin_handshake_request(
        &self,
        initiator_identity_handle: IdentityHandle,
        replier_identity_handle: IdentityHandle,
        serialized_local_participant_data: &[u8],
    ) -> SecResult<(HandshakeHandle, Token)> {
        const CTX: &str = "begin_handshake_request";
        let include_optional = self.include_optional.load(Ordering::Relaxed);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.registry.local(CTX, initiator_identity_handle)?;
        state.registry.remote(CTX, replier_identity_handle)?;

        let (hs_handle, created) = find_or_create_handshake(
            CTX,
            state,
            initiator_identity_handle,
            replier_identity_handle,
            HandshakeOrigin::CreatedRequest,
        )?;

        let kagree_kind = state
            .registry
            .local(CTX, initiator_identity_handle)?
            .kagree_kind;
        if let Err(e) = ensure_local_dh(CTX, &mut state.registry, hs_handle, kagree_kind) {
            if created {
                state.registry.remove(hs_handle);
            }
            return Err(e);
        }

        {
            let local = state.registry.local_mut(CTX, initiator_identity_handle)?;
            if local.pdata.is_empty() {
                local.pdata = serialized_local_participant_data.to_vec();
            }
        }

        let local = state.registry.local(CTX, initiator_identity_handle)?;
        let props5 = build_props5(
            local.identity_cert.to_pem().as_bytes(),
            &local.permissions_document,
            serialized_local_participant_data,
            local.dsign_kind,
            local.kagree_kind,
        );
        let hash_c1 = {
            let refs: Vec<&BinaryProperty> = props5.iter().collect();
            hash_properties(&refs)
        };

        let dh_public = {
            let hs = state.registry.handshake(CTX, hs_handle)?;
            hs.ldh
                .as_ref()
                .expect("ensure_local_dh installed the keypair")
                .public_bytes()
                .to_vec()
        };
        let lchallenge = {
            let remote = state.registry.remote(CTX, replier_identity_handle)?;
            let relation = remote
                .links
                .get(&initiator_identity_handle)
                .expect("find_or_create_handshake checked the relation");
            relation.lchallenge.0
        };

        let mut token = Token::new(HANDSHAKE_REQUEST_CLASS_ID);
        token.binary_properties = props5;
        if include_optional {
            token
                .binary_properties
                .push(BinaryProperty::new(PROP_HASH_C1, hash_c1.to_vec()));
        }
        token
            .binary_properties
            .push(BinaryProperty::new(PROP_DH1, dh_public));
        token
            .binary_properties
            .push(BinaryProperty::new(PROP_CHALLENGE1, lchallenge.to_vec()));

        state.registry.handshake_mut(CTX, hs_handle)?.hash_c1 = Some(hash_c1);

        log::debug!("[auth] handshake {} request emitted", hs_handle);
        Ok((hs_handle, token))
    }

    /// Process a peer's Request as responder, emitting the Reply token.
    pub fn begin_handshake_reply(
        &self,
        replier_identity_handle: IdentityHandle,
        initiator_identity_handle: IdentityHandle,
        serialized_local_participant_data: &[u8],
        handshake_message_in: &Token,
    ) -> SecResult<(HandshakeHandle, Token)> {
        const CTX: &str = "begin_handshake_reply";
        let include_optional = self.include_optional.load(Ordering::Relaxed);

        if serialized_local_participant_data.is_empty() {
            return Err(SecurityException::new(
                CTX,
                AuthErrorKind::EmptyValue,
                "serialized local participant data is empty",
            ));
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.registry.local(CTX, replier_identity_handle)?;
        state.registry.remote(CTX, initiator_identity_handle)?;

        let (hs_handle, created) = find_or_create_handshake(
            CTX,
            state,
            replier_identity_handle,
            initiator_identity_handle,
            HandshakeOrigin::CreatedReply,
        )?;

        // Validate the Request against copied-out materials
        let outcome = {
            let local = state.registry.local(CTX, replier_identity_handle)?;
            let remote = state.registry.remote(CTX, initiator_identity_handle)?;
            let relation = remote
                .links
                .get(&replier_identity_handle)
                .expect("find_or_create_handshake checked the relation");
            let ctx = HsValidationCtx {
                context: CTX,
                identity_ca: &local.identity_ca,
                crl: local.crl.as_deref(),
                trusted_ca_list: &state.trusted_ca_list,
                lchallenge: &relation.lchallenge,
                rchallenge: relation.rchallenge.as_ref(),
                hash_c1: None,
                hash_c2: None,
                dh1_ref: None,
                dh2_ref: None,
                remote_cert: None,
                remote_dsign: None,
            };
            validate_handshake_token(handshake_message_in, HsTokenKind::Request, &ctx)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                abort_handshake(state, hs_handle, initiator_identity_handle, created);
                return Err(e);
            }
        };

        let peer_kagree = outcome
            .kagree_kind
            .expect("request validation always yields a kagree kind");
        apply_token_outcome(
            state,
            hs_handle,
            initiator_identity_handle,
            replier_identity_handle,
            outcome,
        );

        // DH keypair of the kind the initiator advertised
        if let Err(e) = ensure_local_dh(CTX, &mut state.registry, hs_handle, peer_kagree) {
            abort_handshake(state, hs_handle, initiator_identity_handle, created);
            return Err(e);
        }

        {
            let local = state.registry.local_mut(CTX, replier_identity_handle)?;
            if local.pdata.is_empty() {
                local.pdata = serialized_local_participant_data.to_vec();
            }
        }

        let local = state.registry.local(CTX, replier_identity_handle)?;
        let props = build_props5(
            local.identity_cert.to_pem().as_bytes(),
            &local.permissions_document,
            serialized_local_participant_data,
            local.dsign_kind,
            peer_kagree,
        );
        let hash_c2 = {
            let refs: Vec<&BinaryProperty> = props.iter().collect();
            hash_properties(&refs)
        };

        let hash_c1 = state
            .registry
            .handshake(CTX, hs_handle)?
            .hash_c1
            .expect("request validation stored hash_c1");

        let dh2_public = {
            let hs = state.registry.handshake(CTX, hs_handle)?;
            hs.ldh
                .as_ref()
                .expect("ensure_local_dh installed the keypair")
                .public_bytes()
                .to_vec()
        };
        let (rchallenge, lchallenge) = {
            let remote = state.registry.remote(CTX, initiator_identity_handle)?;
            let relation = remote
                .links
                .get(&replier_identity_handle)
                .expect("relation checked above");
            (
                relation
                    .rchallenge
                    .as_ref()
                    .expect("request validation pinned the peer challenge")
                    .0,
                relation.lchallenge.0,
            )
        };

        let dh1 = handshake_message_in
            .find_binary_property(PROP_DH1)
            .expect("request validation checked dh1")
            .clone();

        let dh2 = BinaryProperty::new(PROP_DH2, dh2_public);
        let challenge1 = BinaryProperty::new(PROP_CHALLENGE1, rchallenge.to_vec());
        let challenge2 = BinaryProperty::new(PROP_CHALLENGE2, lchallenge.to_vec());
        let hash_c1_val = BinaryProperty::new(PROP_HASH_C1, hash_c1.to_vec());
        let hash_c2_val = BinaryProperty::new(PROP_HASH_C2, hash_c2.to_vec());

        let signature = sign_tuple(
            &local.private_key,
            &[&hash_c2_val, &challenge2, &dh2, &challenge1, &dh1, &hash_c1_val],
        )
        .map_err(|e| with_context(CTX, e))?;

        let mut token = Token::new(HANDSHAKE_REPLY_CLASS_ID);
        token.binary_properties = props;
        token.binary_properties.push(dh2);
        token.binary_properties.push(challenge1);
        token.binary_properties.push(challenge2);
        if include_optional {
            token.binary_properties.push(dh1.clone());
            token.binary_properties.push(hash_c2_val);
            token.binary_properties.push(hash_c1_val);
        }
        token
            .binary_properties
            .push(BinaryProperty::new(PROP_SIGNATURE, signature));

        state.registry.handshake_mut(CTX, hs_handle)?.hash_c2 = Some(hash_c2);

        log::debug!("[auth] handshake {} reply emitted", hs_handle);
        Ok((hs_handle, token))
    }

    /// Drive a handshake with an inbound Reply (initiator side) or Final
    /// (responder side). On success the shared secret is derived and, on
    /// the initiator side, the Final token to send is returned.
    pub fn process_handshake(
        &self,
        handshake_handle: HandshakeHandle,
        handshake_message_in: &Token,
    ) -> SecResult<(Option<Token>, HandshakeOutcome)> {
        const CTX: &str = "process_handshake";
        let include_optional = self.include_optional.load(Ordering::Relaxed);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (local_handle, remote_handle, origin) = {
            let hs = state.registry.handshake(CTX, handshake_handle)?;
            if !matches!(
                hs.state,
                HandshakeState::CreatedRequest | HandshakeState::CreatedReply
            ) {
                return Err(SecurityException::new(
                    CTX,
                    AuthErrorKind::InvalidHandle,
                    "handshake is in a terminal state",
                ));
            }
            (hs.local_handle, hs.remote_handle, hs.origin)
        };

        match origin {
            HandshakeOrigin::CreatedRequest => self.process_reply(
                CTX,
                state,
                handshake_handle,
                local_handle,
                remote_handle,
                handshake_message_in,
                include_optional,
            ),
            HandshakeOrigin::CreatedReply => self.process_final(
                CTX,
                state,
                handshake_handle,
                local_handle,
                remote_handle,
                handshake_message_in,
            ),
        }
    }

    /// Initiator side: validate the Reply, emit the Final, derive the
    /// shared secret.
    #[allow(clippy::too_many_arguments)]
    fn process_reply(
        &self,
        ctx_name: &'static str,
        state: &mut AuthState,
        hs_handle: u64,
        local_handle: u64,
        remote_handle: u64,
        token_in: &Token,
        include_optional: bool,
    ) -> SecResult<(Option<Token>, HandshakeOutcome)> {
        let dh1_gen = {
            let hs = state.registry.handshake(ctx_name, hs_handle)?;
            BinaryProperty::new(
                PROP_DH1,
                hs.ldh
                    .as_ref()
                    .expect("begin_handshake_request installed the keypair")
                    .public_bytes()
                    .to_vec(),
            )
        };

        let outcome = {
            let local = state.registry.local(ctx_name, local_handle)?;
            let remote = state.registry.remote(ctx_name, remote_handle)?;
            let relation = remote
                .links
                .get(&local_handle)
                .expect("handshake implies a relation");
            let hs = state.registry.handshake(ctx_name, hs_handle)?;
            let ctx = HsValidationCtx {
                context: ctx_name,
                identity_ca: &local.identity_ca,
                crl: local.crl.as_deref(),
                trusted_ca_list: &state.trusted_ca_list,
                lchallenge: &relation.lchallenge,
                rchallenge: relation.rchallenge.as_ref(),
                hash_c1: hs.hash_c1,
                hash_c2: None,
                dh1_ref: Some(&dh1_gen),
                dh2_ref: None,
                remote_cert: None,
                remote_dsign: None,
            };
            validate_handshake_token(token_in, HsTokenKind::Reply, &ctx)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                abort_handshake(state, hs_handle, remote_handle, false);
                return Err(e);
            }
        };

        let hash_c2 = outcome
            .hash_c2
            .expect("reply validation always yields hash_c2");
        apply_token_outcome(state, hs_handle, remote_handle, local_handle, outcome);

        let hash_c1 = state
            .registry
            .handshake(ctx_name, hs_handle)?
            .hash_c1
            .expect("begin_handshake_request stored hash_c1");

        let (lchallenge, rchallenge) = {
            let remote = state.registry.remote(ctx_name, remote_handle)?;
            let relation = remote
                .links
                .get(&local_handle)
                .expect("handshake implies a relation");
            (
                relation.lchallenge.0,
                relation
                    .rchallenge
                    .as_ref()
                    .expect("reply validation pinned the peer challenge")
                    .0,
            )
        };

        let dh2 = token_in
            .find_binary_property(PROP_DH2)
            .expect("reply validation checked dh2")
            .clone();

        let challenge1 = BinaryProperty::new(PROP_CHALLENGE1, lchallenge.to_vec());
        let challenge2 = BinaryProperty::new(PROP_CHALLENGE2, rchallenge.to_vec());
        let hash_c1_val = BinaryProperty::new(PROP_HASH_C1, hash_c1.to_vec());
        let hash_c2_val = BinaryProperty::new(PROP_HASH_C2, hash_c2.to_vec());

        let signature = {
            let local = state.registry.local(ctx_name, local_handle)?;
            sign_tuple(
                &local.private_key,
                &[&hash_c1_val, &challenge1, &dh1_gen, &challenge2, &dh2, &hash_c2_val],
            )
            .map_err(|e| with_context(ctx_name, e))?
        };

        let mut token = Token::new(HANDSHAKE_FINAL_CLASS_ID);
        token.binary_properties.push(challenge1);
        token.binary_properties.push(challenge2);
        if include_optional {
            token
                .binary_properties
                .push(BinaryProperty::new(PROP_DH1, dh1_gen.value.clone()));
            token.binary_properties.push(dh2.clone());
            token.binary_properties.push(hash_c2_val);
            token.binary_properties.push(hash_c1_val);
        }
        token
            .binary_properties
            .push(BinaryProperty::new(PROP_SIGNATURE, signature));

        self.complete_handshake(
            ctx_name,
            state,
            hs_handle,
            remote_handle,
            lchallenge,
            rchallenge,
            HandshakeState::CompletedOkFinal,
        )?;

        log::debug!("[auth] handshake {} completed (final emitted)", hs_handle);
        Ok((Some(token), HandshakeOutcome::OkFinalMessage))
    }

    /// Responder side: validate the Final and derive the shared secret.
    fn process_final(
        &self,
        ctx_name: &'static str,
        state: &mut AuthState,
        hs_handle: u64,
        local_handle: u64,
        remote_handle: u64,
        token_in: &Token,
    ) -> SecResult<(Option<Token>, HandshakeOutcome)> {
        let (dh1_gen, dh2_gen) = {
            let hs = state.registry.handshake(ctx_name, hs_handle)?;
            (
                BinaryProperty::new(
                    PROP_DH1,
                    hs.rdh
                        .clone()
                        .expect("begin_handshake_reply stored the peer key"),
                ),
                BinaryProperty::new(
                    PROP_DH2,
                    hs.ldh
                        .as_ref()
                        .expect("begin_handshake_reply installed the keypair")
                        .public_bytes()
                        .to_vec(),
                ),
            )
        };

        let validation = {
            let local = state.registry.local(ctx_name, local_handle)?;
            let remote = state.registry.remote(ctx_name, remote_handle)?;
            let relation = remote
                .links
                .get(&local_handle)
                .expect("handshake implies a relation");
            let hs = state.registry.handshake(ctx_name, hs_handle)?;
            let ctx = HsValidationCtx {
                context: ctx_name,
                identity_ca: &local.identity_ca,
                crl: local.crl.as_deref(),
                trusted_ca_list: &state.trusted_ca_list,
                lchallenge: &relation.lchallenge,
                rchallenge: relation.rchallenge.as_ref(),
                hash_c1: hs.hash_c1,
                hash_c2: hs.hash_c2,
                dh1_ref: Some(&dh1_gen),
                dh2_ref: Some(&dh2_gen),
                remote_cert: remote.identity_cert.as_deref(),
                remote_dsign: remote.dsign_kind,
            };
            validate_handshake_token(token_in, HsTokenKind::Final, &ctx)
        };
        if let Err(e) = validation {
            abort_handshake(state, hs_handle, remote_handle, false);
            return Err(e);
        }

        let (lchallenge, rchallenge) = {
            let remote = state.registry.remote(ctx_name, remote_handle)?;
            let relation = remote
                .links
                .get(&local_handle)
                .expect("handshake implies a relation");
            (
                relation.lchallenge.0,
                relation
                    .rchallenge
                    .as_ref()
                    .expect("request validation pinned the peer challenge")
                    .0,
            )
        };

        // challenge1 belongs to the initiator (the peer on this side)
        self.complete_handshake(
            ctx_name,
            state,
            hs_handle,
            remote_handle,
            rchallenge,
            lchallenge,
            HandshakeState::CompletedOk,
        )?;

        log::debug!("[auth] handshake {} completed", hs_handle);
        Ok((None, HandshakeOutcome::Ok))
    }

    /// Derive and store the shared secret, transition to a completed
    /// state and arm the remote identity's expiry trigger.
    #[allow(clippy::too_many_arguments)]
    fn complete_handshake(
        &self,
        ctx_name: &'static str,
        state: &mut AuthState,
        hs_handle: u64,
        remote_handle: u64,
        challenge1: [u8; CHALLENGE_SIZE],
        challenge2: [u8; CHALLENGE_SIZE],
        completed: HandshakeState,
    ) -> SecResult<()> {
        let remote_expiry = {
            let remote = state.registry.remote(ctx_name, remote_handle)?;
            let cert = remote.identity_cert.as_ref().ok_or_else(|| {
                SecurityException::new(
                    ctx_name,
                    AuthErrorKind::InvalidExpiry,
                    "no peer certificate to read an expiry from",
                )
            })?;
            cert.expiry_timestamp().map_err(|e| {
                SecurityException::new(ctx_name, AuthErrorKind::InvalidExpiry, e.message)
            })?
        };

        let secret_handle = state.registry.allocate_handle();
        {
            let hs = state.registry.handshake_mut(ctx_name, hs_handle)?;
            let ldh = hs
                .ldh
                .take()
                .expect("completing a handshake requires the local DH key");
            let rdh = hs.rdh.clone().expect("validation stored the peer DH key");
            let raw = match ldh.derive_raw(&rdh) {
                Ok(raw) => raw,
                Err(e) => {
                    hs.state = HandshakeState::Failed;
                    return Err(with_context(ctx_name, e));
                }
            };
            let secret = crate::crypto::sha256(&raw);

            hs.secret = Some(Arc::new(SharedSecretData::new(
                secret, challenge1, challenge2,
            )));
            hs.secret_handle = secret_handle;
            hs.state = completed;
        }

        if remote_expiry != EXPIRY_NEVER {
            let remote = state.registry.remote_mut(ctx_name, remote_handle)?;
            if remote.timer == 0 {
                remote.timer = self.dispatcher.add(remote_handle, remote_expiry);
            }
        }
        Ok(())
    }

    /// Opaque reference to a completed handshake's shared secret.
    pub fn get_shared_secret(
        &self,
        handshake_handle: HandshakeHandle,
    ) -> SecResult<SharedSecretHandle> {
        const CTX: &str = "get_shared_secret";
        let state = self.state.lock();
        let hs = state.registry.handshake(CTX, handshake_handle)?;
        if hs.secret_handle == HANDLE_NIL {
            return Err(SecurityException::new(
                CTX,
                AuthErrorKind::EmptyValue,
                "handshake has not established a shared secret",
            ));
        }
        Ok(hs.secret_handle)
    }

    /// Crypto-plugin seam: resolve a handshake to its secret storage.
    pub(crate) fn shared_secret_data(
        &self,
        handshake_handle: HandshakeHandle,
    ) -> SecResult<Arc<SharedSecretData>> {
        const CTX: &str = "get_shared_secret";
        let state = self.state.lock();
        let hs = state.registry.handshake(CTX, handshake_handle)?;
        hs.secret.clone().ok_or_else(|| {
            SecurityException::new(
                CTX,
                AuthErrorKind::EmptyValue,
                "handshake has not established a shared secret",
            )
        })
    }

    /// Token identifying the authenticated peer: its certificate and
    /// permissions document, both non-propagating.
    pub fn get_authenticated_peer_credential_token(
        &self,
        handshake_handle: HandshakeHandle,
    ) -> SecResult<Token> {
        const CTX: &str = "get_authenticated_peer_credential_token";
        let state = self.state.lock();
        let hs = state.registry.handshake(CTX, handshake_handle)?;
        let remote = state.registry.remote(CTX, hs.remote_handle)?;

        let cert = remote.identity_cert.as_ref().ok_or_else(|| {
            SecurityException::new(
                CTX,
                AuthErrorKind::EmptyValue,
                "peer certificate not yet learned from a handshake token",
            )
        })?;
        if remote.permissions_document.is_empty() {
            return Err(SecurityException::new(
                CTX,
                AuthErrorKind::EmptyValue,
                "peer permissions document missing",
            ));
        }

        let mut token = Token::new(AUTH_TOKEN_CLASS_ID);
        token.properties.push(Property {
            name: crate::handshake::PROP_C_ID.to_string(),
            value: cert.to_pem(),
            propagate: false,
        });
        token.properties.push(Property {
            name: crate::handshake::PROP_C_PERM.to_string(),
            value: String::from_utf8_lossy(&remote.permissions_document).into_owned(),
            propagate: false,
        });
        Ok(token)
    }

    /// Release an identity handle, tearing down its relations, handshakes
    /// and pending expiry timer. Idempotent on nil.
    pub fn return_identity_handle(&self, identity_handle: IdentityHandle) -> SecResult<()> {
        const CTX: &str = "return_identity_handle";
        if identity_handle == HANDLE_NIL {
            return Ok(());
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.registry.kind_of(identity_handle) {
            None => Err(SecurityException::new(
                CTX,
                AuthErrorKind::InvalidHandle,
                format!("invalid handle {}", identity_handle),
            )),
            Some(ObjectKind::LocalIdentity) => {
                let timer = state.registry.local(CTX, identity_handle)?.timer;
                self.dispatcher.remove(timer);
                for remote_handle in state.registry.handles_of_kind(ObjectKind::RemoteIdentity)
                {
                    if let Some(hs) =
                        state.registry.find_handshake(identity_handle, remote_handle)
                    {
                        state.registry.remove(hs);
                    }
                    if let Ok(remote) = state.registry.remote_mut(CTX, remote_handle) {
                        remote.links.remove(&identity_handle);
                    }
                }
                state.registry.remove(identity_handle);
                log::debug!("[auth] returned local identity {}", identity_handle);
                Ok(())
            }
            Some(ObjectKind::RemoteIdentity) => {
                let (timer, guid_key, local_handles) = {
                    let remote = state.registry.remote(CTX, identity_handle)?;
                    (
                        remote.timer,
                        remote.guid.as_bytes(),
                        remote.links.keys().copied().collect::<Vec<_>>(),
                    )
                };
                self.dispatcher.remove(timer);
                for local_handle in local_handles {
                    if let Some(hs) =
                        state.registry.find_handshake(local_handle, identity_handle)
                    {
                        state.registry.remove(hs);
                    }
                }
                state.remote_guid_index.remove(&guid_key);
                state.registry.remove(identity_handle);
                log::debug!("[auth] returned remote identity {}", identity_handle);
                Ok(())
            }
            Some(ObjectKind::Handshake) => Err(SecurityException::new(
                CTX,
                AuthErrorKind::WrongHandleKind,
                format!("handle {} is a handshake, not an identity", identity_handle),
            )),
        }
    }

    /// Release a handshake handle. Idempotent on nil.
    pub fn return_handshake_handle(
        &self,
        handshake_handle: HandshakeHandle,
    ) -> SecResult<()> {
        const CTX: &str = "return_handshake_handle";
        if handshake_handle == HANDLE_NIL {
            return Ok(());
        }
        let mut state = self.state.lock();
        match state.registry.kind_of(handshake_handle) {
            Some(ObjectKind::Handshake) => {
                state.registry.remove(handshake_handle);
                Ok(())
            }
            Some(_) => Err(SecurityException::new(
                CTX,
                AuthErrorKind::WrongHandleKind,
                format!("handle {} is not a handshake", handshake_handle),
            )),
            None => Err(SecurityException::new(
                CTX,
                AuthErrorKind::InvalidHandle,
                format!("invalid handle {}", handshake_handle),
            )),
        }
    }

    /// Release an identity token (stateless, always succeeds).
    pub fn return_identity_token(&self, _token: &Token) -> SecResult<()> {
        Ok(())
    }

    /// Release an identity status token (stateless, always succeeds).
    pub fn return_identity_status_token(&self, _token: &Token) -> SecResult<()> {
        Ok(())
    }

    /// Release a peer credential token (stateless, always succeeds).
    pub fn return_authenticated_peer_credential_token(
        &self,
        _token: &Token,
    ) -> SecResult<()> {
        Ok(())
    }

    /// Release a shared-secret reference; its lifetime is bounded by the
    /// owning handshake, so this is a no-op.
    pub fn return_shared_secret(&self, _secret_handle: SharedSecretHandle) -> SecResult<()> {
        Ok(())
    }
}

/// Find the handshake for a (local, remote) pair or create one with the
/// given origin. Returns the handle and whether it was created now.
fn find_or_create_handshake(
    context: &'static str,
    state: &mut AuthState,
    local_handle: u64,
    remote_handle: u64,
    origin: HandshakeOrigin,
) -> SecResult<(u64, bool)> {
    if let Some(handle) = state.registry.find_handshake(local_handle, remote_handle) {
        // a failed handshake is never revived; the caller must return the
        // handle and start over
        if state.registry.handshake(context, handle)?.state == HandshakeState::Failed {
            return Err(SecurityException::new(
                context,
                AuthErrorKind::InvalidHandle,
                "handshake for this identity pair previously failed",
            ));
        }
        return Ok((handle, false));
    }
    let remote = state.registry.remote(context, remote_handle)?;
    if !remote.links.contains_key(&local_handle) {
        return Err(SecurityException::new(
            context,
            AuthErrorKind::InvalidHandle,
            "no identity relation between the given identities",
        ));
    }
    let handle = state.registry.allocate_handle();
    state.registry.insert(
        handle,
        SecurityObject::Handshake(HandshakeInfo::new(local_handle, remote_handle, origin)),
    );
    Ok((handle, true))
}

/// Install a local DH keypair on the handshake if it lacks one.
fn ensure_local_dh(
    context: &'static str,
    registry: &mut Registry,
    hs_handle: u64,
    kind: AuthAlgoKind,
) -> SecResult<()> {
    let hs = registry.handshake_mut(context, hs_handle)?;
    if hs.ldh.is_none() {
        hs.ldh = Some(DhKeyPair::generate(kind).map_err(|e| with_context(context, e))?);
    }
    Ok(())
}

/// Apply a validated token's state changes to the object graph.
fn apply_token_outcome(
    state: &mut AuthState,
    hs_handle: u64,
    remote_handle: u64,
    local_handle: u64,
    outcome: crate::handshake::HsTokenOutcome,
) {
    if let Ok(remote) = state.registry.remote_mut("process_handshake", remote_handle) {
        if let Some(cert) = outcome.remote_cert {
            remote.identity_cert = Some(cert);
        }
        if let Some(doc) = outcome.permissions_document {
            remote.permissions_document = doc;
        }
        if let Some(pdata) = outcome.pdata {
            remote.pdata = pdata;
        }
        if let Some(kind) = outcome.dsign_kind {
            remote.dsign_kind = Some(kind);
        }
        if let Some(kind) = outcome.kagree_kind {
            remote.kagree_kind = Some(kind);
        }
        if let Some(pin) = outcome.rchallenge_pin {
            if let Some(relation) = remote.links.get_mut(&local_handle) {
                if relation.rchallenge.is_none() {
                    relation.rchallenge = Some(Challenge(pin));
                }
            }
        }
    }
    if let Ok(hs) = state.registry.handshake_mut("process_handshake", hs_handle) {
        if let Some(hash) = outcome.hash_c1 {
            hs.hash_c1 = Some(hash);
        }
        if let Some(hash) = outcome.hash_c2 {
            hs.hash_c2 = Some(hash);
        }
        if let Some(rdh) = outcome.rdh {
            hs.rdh = Some(rdh);
        }
    }
}

/// Token validation failed: clear provisional peer state and either drop
/// a just-created handshake or poison an existing one.
fn abort_handshake(state: &mut AuthState, hs_handle: u64, remote_handle: u64, created: bool) {
    if let Ok(remote) = state.registry.remote_mut("process_handshake", remote_handle) {
        remote.identity_cert = None;
    }
    if created {
        state.registry.remove(hs_handle);
    } else if let Ok(hs) = state.registry.handshake_mut("process_handshake", hs_handle) {
        hs.rdh = None;
        hs.state = HandshakeState::Failed;
    }
    log::warn!("[auth] handshake {} failed validation", hs_handle);
}
