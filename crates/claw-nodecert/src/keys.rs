//! Private keys and public-key fingerprints.

use std::path::Path;

use rand::rngs::OsRng;
use ring::error::{KeyRejected, Unspecified};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, RsaKeyPair};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::pem;

/// Default RSA key size.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Smallest RSA key the signing backend accepts.
pub const MIN_KEY_BITS: usize = 2048;

/// Largest RSA key the signing backend accepts.
pub const MAX_KEY_BITS: usize = 8192;

/// `sha256WithRSAEncryption`.
pub const SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113_549, 1, 1, 11];
/// `ecdsa-with-SHA256`.
pub const ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10_045, 4, 3, 2];
/// `ecdsa-with-SHA384`.
pub const ECDSA_WITH_SHA384: &[u64] = &[1, 2, 840, 10_045, 4, 3, 3];
/// `id-Ed25519`.
pub const ED25519: &[u64] = &[1, 3, 101, 112];

/// A PEM-encoded private key with secure memory handling.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    pem: String,
}

impl PrivateKey {
    /// Generates an RSA key of `bits` bits, PKCS#8 encoded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unsupported sizes and
    /// [`Error::KeyGeneration`] if generation fails.
    pub fn generate_rsa(bits: usize) -> Result<Self> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(Error::Config(format!(
                "RSA key size must be between {MIN_KEY_BITS} and {MAX_KEY_BITS} bits, got {bits}"
            )));
        }
        debug!(bits, "generating RSA key");
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::KeyGeneration(format!("RSA-{bits}: {e}")))?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::KeyGeneration(format!("failed to encode key: {e}")))?;
        Ok(Self {
            pem: pem.as_str().to_owned(),
        })
    }

    /// Wraps PEM text holding exactly one private key block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pem`] if the text is malformed or does not hold a
    /// single private key.
    pub fn from_pem(pem_text: &str) -> Result<Self> {
        let blocks = pem::parse(pem_text)?;
        match blocks.as_slice() {
            [only] if only.is_private_key() => Ok(Self {
                pem: pem_text.to_owned(),
            }),
            _ => Err(Error::Pem("expected exactly one private key block".into())),
        }
    }

    /// Loads a key file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingInput`] if absent, otherwise as [`Self::from_pem`].
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_pem(&fsutil::read_required_text(path)?)
    }

    /// PEM text.
    #[must_use]
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Builds the rcgen signing key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if rcgen cannot use the key.
    pub fn to_key_pair(&self) -> Result<rcgen::KeyPair> {
        rcgen::KeyPair::from_pem(&self.pem)
            .map_err(|e| Error::Parse(format!("failed to load private key: {e}")))
    }

    /// Signs `message` with the signature algorithm whose OID arcs are
    /// `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Generation`] if the algorithm is unsupported, does
    /// not fit the key, or signing fails.
    pub fn sign(&self, algorithm: &[u64], message: &[u8]) -> Result<Vec<u8>> {
        let pkcs8 = Zeroizing::new(self.to_key_pair()?.serialize_der());
        let rng = SystemRandom::new();
        let rejected = |e: KeyRejected| Error::Generation(format!("key cannot sign: {e}"));
        let failed = |_: Unspecified| Error::Generation("signing failed".into());

        if algorithm == SHA256_WITH_RSA {
            let key = RsaKeyPair::from_pkcs8(&pkcs8).map_err(rejected)?;
            let mut sig = vec![0; key.public().modulus_len()];
            key.sign(&signature::RSA_PKCS1_SHA256, &rng, message, &mut sig)
                .map_err(failed)?;
            Ok(sig)
        } else if algorithm == ECDSA_WITH_SHA256 || algorithm == ECDSA_WITH_SHA384 {
            let curve = if algorithm == ECDSA_WITH_SHA256 {
                &signature::ECDSA_P256_SHA256_ASN1_SIGNING
            } else {
                &signature::ECDSA_P384_SHA384_ASN1_SIGNING
            };
            let key = EcdsaKeyPair::from_pkcs8(curve, &pkcs8, &rng).map_err(rejected)?;
            Ok(key.sign(&rng, message).map_err(failed)?.as_ref().to_vec())
        } else if algorithm == ED25519 {
            let key = Ed25519KeyPair::from_pkcs8_maybe_unchecked(&pkcs8).map_err(rejected)?;
            Ok(key.sign(message).as_ref().to_vec())
        } else {
            let dotted: Vec<String> = algorithm.iter().map(u64::to_string).collect();
            Err(Error::Generation(format!(
                "unsupported signature algorithm {}",
                dotted.join(".")
            )))
        }
    }

    /// Fingerprint of the public half.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the key cannot be decoded.
    pub fn public_fingerprint(&self) -> Result<PublicKeyFingerprint> {
        if let Some(rsa) = self.as_rsa() {
            return Ok(PublicKeyFingerprint::rsa_modulus(&rsa.n().to_bytes_be()));
        }
        let spki = self.to_key_pair()?.public_key_der();
        Ok(PublicKeyFingerprint::spki(&spki))
    }

    fn as_rsa(&self) -> Option<RsaPrivateKey> {
        RsaPrivateKey::from_pkcs8_pem(&self.pem)
            .ok()
            .or_else(|| RsaPrivateKey::from_pkcs1_pem(&self.pem).ok())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pem", &"[REDACTED]")
            .finish()
    }
}

/// How a [`PublicKeyFingerprint`] was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintKind {
    /// SHA-256 of the big-endian RSA modulus.
    RsaModulus,
    /// SHA-256 of the DER SubjectPublicKeyInfo.
    Spki,
}

/// Comparable digest of public-key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyFingerprint {
    /// Derivation method.
    pub kind: FingerprintKind,
    /// Lower-case hex digest.
    pub digest: String,
}

impl PublicKeyFingerprint {
    /// Fingerprint of an RSA modulus; leading zero bytes are ignored.
    #[must_use]
    pub fn rsa_modulus(modulus: &[u8]) -> Self {
        let start = modulus.iter().position(|b| *b != 0).unwrap_or(modulus.len());
        Self {
            kind: FingerprintKind::RsaModulus,
            digest: sha256_hex(&modulus[start..]),
        }
    }

    /// Fingerprint of a DER SubjectPublicKeyInfo.
    #[must_use]
    pub fn spki(der: &[u8]) -> Self {
        Self {
            kind: FingerprintKind::Spki,
            digest: sha256_hex(der),
        }
    }

    /// Fingerprint of a parsed certificate or CSR public key.
    #[must_use]
    pub fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Self {
        match spki.parsed() {
            Ok(PublicKey::RSA(rsa)) => Self::rsa_modulus(rsa.modulus),
            _ => Self::spki(spki.raw),
        }
    }

    /// Short form for log and report messages.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.digest[..self.digest.len().min(16)]
    }
}

/// Lower-case hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
