// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diffie-Hellman key agreement for the two fixed handshake profiles.
//!
//! - `ECDH+prime256v1-CEUM`: NIST P-256 via `ring::agreement`; public keys
//!   travel as 65-byte uncompressed points (0x04 || X || Y).
//! - `DH+MODP-2048-256`: the RFC 5114 Sec.2.3 finite-field group via
//!   modular exponentiation; public keys travel as unpadded big-endian
//!   magnitude bytes.
//!
//! The raw agreement output is NOT the shared secret handed to the rest of
//! the system -- callers hash it with SHA-256 first.

use crate::crypto::AuthAlgoKind;
use crate::error::{AuthErrorKind, SecResult, SecurityException};

use num_bigint::BigUint;
use ring::agreement;
use ring::rand::{SecureRandom, SystemRandom};

/// ECDH P-256 public key length (uncompressed: 0x04 || X || Y)
pub const ECDH_P256_PUBLIC_KEY_LEN: usize = 65;

/// RFC 5114 Sec.2.3: 2048-bit MODP group with 256-bit prime order subgroup.
const MODP_2048_256_P: &str = "\
87A8E61DB4B6663CFFBBD19C651959998CEEF608660DD0F25D2CEED4435E3B00\
E00DF8F1D61957D4FAF7DF4561B2AA3016C3D91134096FAA3BF4296D830E9A7C\
209E0C6497517ABD5A8A9D306BCF67ED91F9E6725B4758C022E0B1EF4275BF7B\
6C5BFC11D45F9088B941F54EB1E59BB8BC39A0BF12307F5C4FDB70C581B23F76\
B63ACAE1CAA6B7902D52526735488A0EF13C6D9A51BFA4AB3AD8347796524D8E\
F6A167B5A41825D967E144E5140564251CCACB83E6B486F6B3CA3F7971506026\
C0B857F689962856DED4010ABD0BE621C3A3960A54E710C375F26375D7014103\
A4B54330C198AF126116D2276E11715F693877FAD7EF09CADB094AE91E1A1597";

const MODP_2048_256_G: &str = "\
3FB32C9B73134D0B2E77506660EDBD484CA7B18F21EF205407F4793A1A0BA125\
10DBC15077BE463FFF4FED4AAC0BB555BE3A6C1B0C6B47B1BC3773BF7E8C6F62\
901228F8C28CBB18A55AE31341000A650196F931C77A57F2DDF463E5E9EC144B\
777DE62AAAB8A8628AC376D282D6ED3864E67982428EBC831D14348F6F2F9193\
B5045AF2767164E1DFC967C1FB3F2E55A4BD1BFFE83B9C80D052B985D182EA0A\
DB2A3B7313D3FE14C8484B1E052588B9B7D2BBD2DF016199ECD06E1557CD0915\
B3353BBB64E0EC377FD028370DF92B52C7891428CDC67EB6184B523D1DB246C3\
2F63078490F00EF8D647D148D47954515E2327CFEF98C582664B4C0F6CC41659";

const MODP_2048_256_Q: &str =
    "8CF83642A709A097B447997640129DA299B1A47D1EB3750BA308B0FE64F5FBD3";

fn modp_prime() -> BigUint {
    BigUint::parse_bytes(MODP_2048_256_P.as_bytes(), 16)
        .expect("MODP-2048-256 prime constant is valid hex")
}

fn modp_generator() -> BigUint {
    BigUint::parse_bytes(MODP_2048_256_G.as_bytes(), 16)
        .expect("MODP-2048-256 generator constant is valid hex")
}

fn modp_subgroup_order() -> BigUint {
    BigUint::parse_bytes(MODP_2048_256_Q.as_bytes(), 16)
        .expect("MODP-2048-256 subgroup order constant is valid hex")
}

/// An ephemeral DH keypair of one of the two supported kinds.
///
/// The private half is single-use: deriving the shared secret consumes the
/// keypair (the P-256 backend is `ring`'s one-shot ephemeral key).
pub struct DhKeyPair {
    kind: AuthAlgoKind,
    public: Vec<u8>,
    private: DhPrivate,
}

enum DhPrivate {
    Ec(agreement::EphemeralPrivateKey),
    Modp(BigUint),
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("kind", &self.kind)
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

impl DhKeyPair {
    /// Generate an ephemeral keypair for the given agreement kind.
    pub fn generate(kind: AuthAlgoKind) -> SecResult<Self> {
        match kind {
            AuthAlgoKind::EcPrime256v1 => {
                let rng = SystemRandom::new();
                let private =
                    agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng)
                        .map_err(|_| {
                            SecurityException::new(
                                "generate_dh_keypair",
                                AuthErrorKind::InvalidKey,
                                "failed to generate ECDH P-256 keypair",
                            )
                        })?;
                let public = private.compute_public_key().map_err(|_| {
                    SecurityException::new(
                        "generate_dh_keypair",
                        AuthErrorKind::InvalidKey,
                        "failed to compute ECDH P-256 public key",
                    )
                })?;
                Ok(Self {
                    kind,
                    public: public.as_ref().to_vec(),
                    private: DhPrivate::Ec(private),
                })
            }
            AuthAlgoKind::Rsa2048 => {
                let p = modp_prime();
                let g = modp_generator();
                let q = modp_subgroup_order();

                // x in [1, q-1]
                let rng = SystemRandom::new();
                let mut seed = [0u8; 32];
                rng.fill(&mut seed).map_err(|_| {
                    SecurityException::new(
                        "generate_dh_keypair",
                        AuthErrorKind::InvalidKey,
                        "system CSPRNG failed during MODP key generation",
                    )
                })?;
                let x = BigUint::from_bytes_be(&seed) % (&q - 1u32) + 1u32;
                let y = g.modpow(&x, &p);
                Ok(Self {
                    kind,
                    public: y.to_bytes_be(),
                    private: DhPrivate::Modp(x),
                })
            }
        }
    }

    /// Agreement kind of this keypair.
    pub fn kind(&self) -> AuthAlgoKind {
        self.kind
    }

    /// Public key in its wire form.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Derive the raw agreement output with the peer's public key,
    /// consuming the private half.
    pub fn derive_raw(self, peer_public: &[u8]) -> SecResult<Vec<u8>> {
        validate_public_key(self.kind, peer_public)?;
        match self.private {
            DhPrivate::Ec(private) => {
                let peer =
                    agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, peer_public);
                agreement::agree_ephemeral(private, &peer, |secret| secret.to_vec())
                    .map_err(|_| {
                        SecurityException::new(
                            "derive_shared_secret",
                            AuthErrorKind::InvalidKey,
                            "ECDH P-256 agreement failed",
                        )
                    })
            }
            DhPrivate::Modp(x) => {
                let p = modp_prime();
                let peer = BigUint::from_bytes_be(peer_public);
                Ok(peer.modpow(&x, &p).to_bytes_be())
            }
        }
    }
}

/// Validate a peer public key in its wire form without deriving anything.
///
/// This is the receive-side check performed when `dh1`/`dh2` arrive in a
/// handshake token.
pub fn validate_public_key(kind: AuthAlgoKind, bytes: &[u8]) -> SecResult<()> {
    match kind {
        AuthAlgoKind::EcPrime256v1 => {
            if bytes.len() != ECDH_P256_PUBLIC_KEY_LEN {
                return Err(SecurityException::new(
                    "dh_public_from_bytes",
                    AuthErrorKind::InvalidKey,
                    format!(
                        "invalid P-256 public key length: expected {} bytes, got {}",
                        ECDH_P256_PUBLIC_KEY_LEN,
                        bytes.len()
                    ),
                ));
            }
            if bytes[0] != 0x04 {
                return Err(SecurityException::new(
                    "dh_public_from_bytes",
                    AuthErrorKind::InvalidKey,
                    "invalid P-256 public key format: uncompressed point required",
                ));
            }
            Ok(())
        }
        AuthAlgoKind::Rsa2048 => {
            if bytes.is_empty() {
                return Err(SecurityException::new(
                    "dh_public_from_bytes",
                    AuthErrorKind::InvalidKey,
                    "empty MODP public key",
                ));
            }
            let y = BigUint::from_bytes_be(bytes);
            let p = modp_prime();
            if y <= BigUint::from(1u32) || y >= &p - 1u32 {
                return Err(SecurityException::new(
                    "dh_public_from_bytes",
                    AuthErrorKind::InvalidKey,
                    "MODP public key out of range",
                ));
            }
            Ok(())
        }
    }
}
