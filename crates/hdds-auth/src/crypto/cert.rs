// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! X.509 certificate and CRL handling.
//!
//! Certificates are stored as owned DER and re-parsed on demand with
//! `x509-parser`; chain verification uses `ring` against an explicit trust
//! anchor rather than a full RFC 5280 path build (single CA per identity,
//! per DDS Security v1.1 Sec.8.3.2).

use crate::crypto::{sha1, AuthAlgoKind};
use crate::error::{AuthErrorKind, SecResult, SecurityException};

use ring::signature;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;
use x509_parser::revocation_list::CertificateRevocationList;

/// Timestamp of 9999-12-31T23:59:59Z; notAfter at or past this counts as
/// "never expires".
const TIMESTAMP_FOREVER: i64 = 253_402_300_799;

/// Sentinel expiry for certificates that never expire.
pub const EXPIRY_NEVER: i64 = i64::MAX;

/// Owned X.509 certificate.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Load a certificate from PEM bytes.
    pub fn from_pem(pem_bytes: &[u8]) -> SecResult<Self> {
        let block = ::pem::parse(pem_bytes).map_err(|e| {
            SecurityException::new(
                "load_certificate",
                AuthErrorKind::InvalidPem,
                format!("failed to parse certificate PEM: {}", e),
            )
        })?;
        if block.tag() != "CERTIFICATE" {
            return Err(SecurityException::new(
                "load_certificate",
                AuthErrorKind::InvalidPem,
                format!("unexpected PEM tag '{}'", block.tag()),
            ));
        }
        Self::from_der(block.contents().to_vec())
    }

    /// Load a certificate from DER bytes.
    pub fn from_der(der: Vec<u8>) -> SecResult<Self> {
        X509Certificate::from_der(&der).map_err(|e| {
            SecurityException::new(
                "load_certificate",
                AuthErrorKind::InvalidPem,
                format!("failed to parse X.509 certificate: {:?}", e),
            )
        })?;
        Ok(Self { der })
    }

    /// Raw DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Re-encode as PEM (the form certificates travel in `c.id`).
    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// SHA-1 fingerprint over the DER encoding (trusted-CA matching).
    pub fn fingerprint_sha1(&self) -> [u8; 20] {
        sha1(&self.der)
    }

    fn parsed(&self) -> SecResult<X509Certificate<'_>> {
        X509Certificate::from_der(&self.der)
            .map(|(_, cert)| cert)
            .map_err(|e| {
                SecurityException::new(
                    "load_certificate",
                    AuthErrorKind::InvalidPem,
                    format!("failed to re-parse X.509 certificate: {:?}", e),
                )
            })
    }

    /// Subject distinguished name as a display string.
    pub fn subject_name(&self) -> SecResult<String> {
        Ok(self.parsed()?.subject().to_string())
    }

    /// DER encoding of the subject distinguished name.
    pub fn subject_der(&self) -> SecResult<Vec<u8>> {
        Ok(self.parsed()?.tbs_certificate.subject.as_raw().to_vec())
    }

    /// Raw serial number bytes.
    pub fn serial_raw(&self) -> SecResult<Vec<u8>> {
        Ok(self.parsed()?.raw_serial().to_vec())
    }

    /// notAfter as Unix seconds, or [`EXPIRY_NEVER`].
    ///
    /// A notAfter before the Unix epoch is reported as `InvalidExpiry`.
    pub fn expiry_timestamp(&self) -> SecResult<i64> {
        let ts = self.parsed()?.validity().not_after.timestamp();
        if ts < 0 {
            return Err(SecurityException::new(
                "load_certificate",
                AuthErrorKind::InvalidExpiry,
                "certificate notAfter is before the Unix epoch",
            ));
        }
        if ts >= TIMESTAMP_FOREVER {
            return Ok(EXPIRY_NEVER);
        }
        Ok(ts)
    }

    /// Check the validity window against `now` (Unix seconds).
    pub fn check_validity(&self, now: i64) -> SecResult<()> {
        let cert = self.parsed()?;
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        if now < not_before {
            return Err(SecurityException::new(
                "verify_certificate",
                AuthErrorKind::NotYetValid,
                format!(
                    "certificate not valid before {}",
                    cert.validity().not_before
                ),
            ));
        }
        if now > not_after {
            return Err(SecurityException::new(
                "verify_certificate",
                AuthErrorKind::Expired,
                format!("certificate expired at {}", cert.validity().not_after),
            ));
        }
        Ok(())
    }

    /// The SubjectPublicKeyInfo BIT STRING contents: an RSAPublicKey DER
    /// for RSA keys, an uncompressed point for EC keys. This is the form
    /// `ring`'s `UnparsedPublicKey` consumes for both families.
    pub fn public_key_bytes(&self) -> SecResult<Vec<u8>> {
        Ok(self
            .parsed()?
            .public_key()
            .subject_public_key
            .data
            .to_vec())
    }

    /// Classify the subject public key as one of the two supported kinds.
    pub fn algo_kind(&self) -> SecResult<AuthAlgoKind> {
        let cert = self.parsed()?;
        let spki = cert.public_key();
        match spki.parsed() {
            Ok(PublicKey::RSA(rsa)) => {
                // Strip any leading zero octet of the INTEGER encoding
                let modulus = rsa.modulus;
                let bits =
                    (modulus.len() - modulus.iter().take_while(|&&b| b == 0).count()) * 8;
                if bits == 2048 {
                    Ok(AuthAlgoKind::Rsa2048)
                } else {
                    Err(SecurityException::new(
                        "load_certificate",
                        AuthErrorKind::UnsupportedAlgorithm,
                        format!("unsupported RSA key size: {} bits", bits),
                    ))
                }
            }
            Ok(PublicKey::EC(_)) => {
                let curve = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .and_then(|p| p.as_oid().ok())
                    .map(|oid| oid.to_id_string());
                match curve.as_deref() {
                    // prime256v1 / secp256r1
                    Some("1.2.840.10045.3.1.7") => Ok(AuthAlgoKind::EcPrime256v1),
                    other => Err(SecurityException::new(
                        "load_certificate",
                        AuthErrorKind::UnsupportedAlgorithm,
                        format!("unsupported EC curve: {:?}", other),
                    )),
                }
            }
            _ => Err(SecurityException::new(
                "load_certificate",
                AuthErrorKind::UnsupportedAlgorithm,
                "unsupported public key type (RSA-2048 or EC prime256v1 required)",
            )),
        }
    }

    /// Verify that `issuer` signed this certificate's TBS data.
    fn verify_signed_by(&self, issuer: &Certificate) -> SecResult<()> {
        let cert = self.parsed()?;
        let issuer_cert = issuer.parsed()?;

        let issuer_key = &issuer_cert.public_key().subject_public_key.data;
        let tbs = cert.tbs_certificate.as_ref();
        let sig = cert.signature_value.as_ref();
        let sig_oid = cert.signature_algorithm.algorithm.to_id_string();

        let alg = ring_verification_alg(&sig_oid).ok_or_else(|| {
            SecurityException::new(
                "verify_certificate",
                AuthErrorKind::UnsupportedAlgorithm,
                format!("unsupported certificate signature algorithm: {}", sig_oid),
            )
        })?;

        signature::UnparsedPublicKey::new(alg, issuer_key.as_ref())
            .verify(tbs, sig)
            .map_err(|_| {
                SecurityException::new(
                    "verify_certificate",
                    AuthErrorKind::ChainInvalid,
                    "certificate signature does not verify against issuer key",
                )
            })
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

/// Map a certificate signatureAlgorithm OID to a ring verification
/// algorithm. Unknown OIDs are rejected to avoid algorithm confusion.
fn ring_verification_alg(oid: &str) -> Option<&'static dyn signature::VerificationAlgorithm> {
    match oid {
        // RSA PKCS#1 v1.5 (RFC 4055)
        "1.2.840.113549.1.1.11" => Some(&signature::RSA_PKCS1_2048_8192_SHA256),
        "1.2.840.113549.1.1.12" => Some(&signature::RSA_PKCS1_2048_8192_SHA384),
        "1.2.840.113549.1.1.13" => Some(&signature::RSA_PKCS1_2048_8192_SHA512),
        // ECDSA (RFC 5758), DER-encoded (r,s)
        "1.2.840.10045.4.3.2" => Some(&signature::ECDSA_P256_SHA256_ASN1),
        "1.2.840.10045.4.3.3" => Some(&signature::ECDSA_P384_SHA384_ASN1),
        _ => None,
    }
}

/// Owned certificate revocation list.
#[derive(Debug, Clone)]
pub struct Crl {
    der: Vec<u8>,
}

impl Crl {
    /// Load a CRL from PEM bytes.
    pub fn from_pem(pem_bytes: &[u8]) -> SecResult<Self> {
        let block = ::pem::parse(pem_bytes).map_err(|e| {
            SecurityException::new(
                "load_crl",
                AuthErrorKind::InvalidPem,
                format!("failed to parse CRL PEM: {}", e),
            )
        })?;
        if block.tag() != "X509 CRL" {
            return Err(SecurityException::new(
                "load_crl",
                AuthErrorKind::InvalidPem,
                format!("unexpected PEM tag '{}'", block.tag()),
            ));
        }
        let der = block.contents().to_vec();
        CertificateRevocationList::from_der(&der).map_err(|e| {
            SecurityException::new(
                "load_crl",
                AuthErrorKind::InvalidPem,
                format!("failed to parse CRL: {:?}", e),
            )
        })?;
        Ok(Self { der })
    }

    /// Check whether a certificate serial is listed as revoked.
    pub fn is_revoked(&self, serial_raw: &[u8]) -> SecResult<bool> {
        let (_, crl) = CertificateRevocationList::from_der(&self.der).map_err(|e| {
            SecurityException::new(
                "load_crl",
                AuthErrorKind::InvalidPem,
                format!("failed to re-parse CRL: {:?}", e),
            )
        })?;
        let revoked = crl
            .iter_revoked_certificates()
            .any(|revoked| revoked.raw_serial() == serial_raw);
        Ok(revoked)
    }
}

/// Verify a certificate against a trust anchor, consulting an optional CRL.
///
/// Steps: validity window, issuer/subject chain link, issuer signature,
/// revocation. Self-signed certificates are accepted only when they are
/// byte-identical to the anchor (exact-match trust, no DN spoofing).
pub fn verify_certificate(
    leaf: &Certificate,
    anchor: &Certificate,
    crl: Option<&Crl>,
) -> SecResult<()> {
    let now = unix_now();
    leaf.check_validity(now)?;

    let leaf_parsed = leaf.parsed()?;
    let issuer = leaf_parsed.issuer().to_string();
    let subject = leaf_parsed.subject().to_string();

    if issuer == subject {
        if leaf.der() != anchor.der() {
            return Err(SecurityException::new(
                "verify_certificate",
                AuthErrorKind::ChainInvalid,
                "self-signed certificate is not the configured trust anchor",
            ));
        }
    } else {
        let anchor_subject = anchor.parsed()?.subject().to_string();
        if anchor_subject != issuer {
            return Err(SecurityException::new(
                "verify_certificate",
                AuthErrorKind::ChainInvalid,
                format!("certificate issuer '{}' does not match the trust anchor", issuer),
            ));
        }
        leaf.verify_signed_by(anchor)?;
    }

    if let Some(crl) = crl {
        if crl.is_revoked(&leaf.serial_raw()?)? {
            return Err(SecurityException::new(
                "verify_certificate",
                AuthErrorKind::Revoked,
                "certificate serial is listed in the configured CRL",
            ));
        }
    }

    Ok(())
}

/// Current wall-clock time as Unix seconds (0 if the clock is before the
/// epoch, which forces validity checks to fail safe).
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        date_time_ymd, BasicConstraints, CertificateParams, DnType, IsCa, KeyPair,
        SerialNumber,
    };

    fn ca_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = date_time_ymd(2024, 1, 1);
        params.not_after = date_time_ymd(2035, 1, 1);
        params
    }

    fn leaf_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.not_before = date_time_ymd(2024, 1, 1);
        params.not_after = date_time_ymd(2035, 1, 1);
        params.serial_number = Some(SerialNumber::from(vec![0x2a, 0x01]));
        params
    }

    fn make_chain() -> (Certificate, Certificate) {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let ca_cert = ca_params("test identity CA")
            .self_signed(&ca_key)
            .expect("self-sign CA");

        let leaf_key = KeyPair::generate().expect("generate leaf key");
        let leaf_cert = leaf_params("test participant")
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .expect("sign leaf");

        (
            Certificate::from_pem(leaf_cert.pem().as_bytes()).expect("load leaf"),
            Certificate::from_pem(ca_cert.pem().as_bytes()).expect("load CA"),
        )
    }

    #[test]
    fn test_load_invalid_pem() {
        let err = Certificate::from_pem(b"not a certificate").unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InvalidPem);
    }

    #[test]
    fn test_verify_chain_ok() {
        let (leaf, ca) = make_chain();
        verify_certificate(&leaf, &ca, None).expect("chain should verify");
    }

    #[test]
    fn test_verify_chain_wrong_ca() {
        let (leaf, _ca) = make_chain();
        let (_other_leaf, other_ca) = make_chain();
        let err = verify_certificate(&leaf, &other_ca, None).unwrap_err();
        // Same DN but different key: the signature check must reject it
        assert_eq!(err.kind, AuthErrorKind::ChainInvalid);
    }

    #[test]
    fn test_verify_expired() {
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params("expired test CA").self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut params = leaf_params("expired participant");
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(2021, 1, 1);
        let leaf_cert = params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let leaf = Certificate::from_pem(leaf_cert.pem().as_bytes()).unwrap();
        let ca = Certificate::from_pem(ca_cert.pem().as_bytes()).unwrap();
        let err = verify_certificate(&leaf, &ca, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::Expired);
    }

    #[test]
    fn test_verify_not_yet_valid() {
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params("future test CA").self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut params = leaf_params("future participant");
        params.not_before = date_time_ymd(2033, 1, 1);
        params.not_after = date_time_ymd(2035, 1, 1);
        let leaf_cert = params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let leaf = Certificate::from_pem(leaf_cert.pem().as_bytes()).unwrap();
        let ca = Certificate::from_pem(ca_cert.pem().as_bytes()).unwrap();
        let err = verify_certificate(&leaf, &ca, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::NotYetValid);
    }

    #[test]
    fn test_algo_kind_ec() {
        let (leaf, _) = make_chain();
        assert_eq!(leaf.algo_kind().unwrap(), AuthAlgoKind::EcPrime256v1);
    }

    #[test]
    fn test_subject_der_stable() {
        let (leaf, _) = make_chain();
        let a = leaf.subject_der().unwrap();
        let b = leaf.subject_der().unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_certs() {
        let (leaf, ca) = make_chain();
        assert_ne!(leaf.fingerprint_sha1(), ca.fingerprint_sha1());
        assert_eq!(leaf.fingerprint_sha1(), leaf.fingerprint_sha1());
    }

    #[test]
    fn test_pem_roundtrip() {
        let (leaf, _) = make_chain();
        let reloaded = Certificate::from_pem(leaf.to_pem().as_bytes()).unwrap();
        assert_eq!(leaf, reloaded);
    }

    #[test]
    fn test_expiry_timestamp() {
        let (leaf, _) = make_chain();
        let ts = leaf.expiry_timestamp().unwrap();
        assert!(ts > unix_now());
        assert_ne!(ts, EXPIRY_NEVER);
    }
}
