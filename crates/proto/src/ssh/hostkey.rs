//! SSH host key and signature algorithms (RFC 4253 Section 6.6).
//!
//! Two halves live here:
//!
//! - [`PublicKey`] parses the server's host key blob, computes its
//!   fingerprint and verifies signatures over the exchange hash.
//! - [`HostKey`] is the signing side, used by client identities and by
//!   the scripted test server.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519`
//! - `rsa-sha2-256`, `rsa-sha2-512` and legacy `ssh-rsa` (verification only)
//! - `ecdsa-sha2-nistp256`, `ecdsa-sha2-nistp384`, `ecdsa-sha2-nistp521`
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::hostkey::{Ed25519HostKey, HostKey, PublicKey};
//!
//! let key = Ed25519HostKey::generate().unwrap();
//! let blob = key.public_key_bytes();
//! let signature = key.sign(b"exchange hash").unwrap();
//!
//! let public = PublicKey::from_blob(&blob).unwrap();
//! public
//!     .verify(key.algorithm(), b"exchange hash", &signature)
//!     .unwrap();
//! assert!(public.fingerprint().starts_with("SHA256:"));
//! ```

use crate::ssh::buffer::WireBuffer;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use ring::signature::{
    RsaKeyPair, RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512, RSA_PKCS1_SHA256, RSA_PKCS1_SHA512,
};
use sha2::{Digest, Sha256};
use skiff_platform::{SkiffError, SkiffResult};
use std::fmt;
use zeroize::Zeroizing;

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// rsa-sha2-256 (RFC 8332)
    RsaSha2_256,
    /// rsa-sha2-512 (RFC 8332)
    RsaSha2_512,
    /// ssh-rsa, RSA with SHA-1
    SshRsa,
    /// ecdsa-sha2-nistp256 (RFC 5656)
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384 (RFC 5656)
    EcdsaSha2Nistp384,
    /// ecdsa-sha2-nistp521 (RFC 5656)
    EcdsaSha2Nistp521,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as negotiated in KEXINIT
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaSha2Nistp521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "ecdsa-sha2-nistp384" => Some(HostKeyAlgorithm::EcdsaSha2Nistp384),
            "ecdsa-sha2-nistp521" => Some(HostKeyAlgorithm::EcdsaSha2Nistp521),
            _ => None,
        }
    }

    /// Name of the key format inside the public key blob.
    ///
    /// The RSA signature variants all share the `ssh-rsa` key format.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_256
            | HostKeyAlgorithm::RsaSha2_512
            | HostKeyAlgorithm::SshRsa => "ssh-rsa",
            other => other.name(),
        }
    }

    /// Returns true for the RSA family.
    pub fn is_rsa(&self) -> bool {
        self.key_type() == "ssh-rsa"
    }
}

impl fmt::Display for HostKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Elliptic curves used by ECDSA keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcdsaCurve {
    /// NIST P-256
    NistP256,
    /// NIST P-384
    NistP384,
    /// NIST P-521
    NistP521,
}

impl EcdsaCurve {
    /// Curve identifier used inside key blobs.
    pub fn identifier(&self) -> &'static str {
        match self {
            EcdsaCurve::NistP256 => "nistp256",
            EcdsaCurve::NistP384 => "nistp384",
            EcdsaCurve::NistP521 => "nistp521",
        }
    }

    /// Byte width of one scalar.
    pub fn field_len(&self) -> usize {
        match self {
            EcdsaCurve::NistP256 => 32,
            EcdsaCurve::NistP384 => 48,
            EcdsaCurve::NistP521 => 66,
        }
    }

    /// Matching host key algorithm.
    pub fn algorithm(&self) -> HostKeyAlgorithm {
        match self {
            EcdsaCurve::NistP256 => HostKeyAlgorithm::EcdsaSha2Nistp256,
            EcdsaCurve::NistP384 => HostKeyAlgorithm::EcdsaSha2Nistp384,
            EcdsaCurve::NistP521 => HostKeyAlgorithm::EcdsaSha2Nistp521,
        }
    }

    fn from_identifier(id: &str) -> Option<Self> {
        match id {
            "nistp256" => Some(EcdsaCurve::NistP256),
            "nistp384" => Some(EcdsaCurve::NistP384),
            "nistp521" => Some(EcdsaCurve::NistP521),
            _ => None,
        }
    }
}

/// A parsed public key blob.
#[derive(Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 point
    Ed25519([u8; 32]),
    /// RSA public exponent and modulus, big-endian without leading zeros
    Rsa {
        /// Public exponent
        e: Vec<u8>,
        /// Modulus
        n: Vec<u8>,
    },
    /// ECDSA curve and SEC1 encoded point
    Ecdsa {
        /// Curve
        curve: EcdsaCurve,
        /// Uncompressed SEC1 point
        point: Vec<u8>,
    },
}

impl PublicKey {
    /// Parses an SSH public key blob.
    pub fn from_blob(blob: &[u8]) -> SkiffResult<Self> {
        let mut buf = WireBuffer::from_slice(blob);
        let key_type = buf.get_utf8()?;

        let key = match key_type.as_str() {
            "ssh-ed25519" => {
                let raw = buf.get_string()?;
                let point: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    SkiffError::Security(format!(
                        "Ed25519 public key must be 32 bytes, got {}",
                        raw.len()
                    ))
                })?;
                PublicKey::Ed25519(point)
            }
            "ssh-rsa" => {
                let e = buf.get_mpint()?;
                let n = buf.get_mpint()?;
                if e.is_empty() || n.is_empty() {
                    return Err(SkiffError::Security("RSA key has a zero component".into()));
                }
                PublicKey::Rsa { e, n }
            }
            name => {
                let algorithm = HostKeyAlgorithm::from_name(name).ok_or_else(|| {
                    SkiffError::Security(format!("Unsupported public key type: {}", name))
                })?;
                let curve_id = buf.get_utf8()?;
                let curve = EcdsaCurve::from_identifier(&curve_id)
                    .filter(|c| c.algorithm() == algorithm)
                    .ok_or_else(|| {
                        SkiffError::Security(format!(
                            "Curve {} does not match key type {}",
                            curve_id, name
                        ))
                    })?;
                let point = buf.get_string()?;
                PublicKey::Ecdsa { curve, point }
            }
        };

        if buf.remaining() != 0 {
            return Err(SkiffError::Security(
                "Trailing data after public key".to_string(),
            ));
        }
        Ok(key)
    }

    /// Serializes the key back into blob form.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_str(self.key_type());
        match self {
            PublicKey::Ed25519(point) => buf.put_string(point),
            PublicKey::Rsa { e, n } => {
                buf.put_mpint(e);
                buf.put_mpint(n);
            }
            PublicKey::Ecdsa { curve, point } => {
                buf.put_str(curve.identifier());
                buf.put_string(point);
            }
        }
        buf.into_vec()
    }

    /// Key format name (`ssh-ed25519`, `ssh-rsa`, `ecdsa-sha2-*`).
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
            PublicKey::Ecdsa { curve, .. } => curve.algorithm().name(),
        }
    }

    /// OpenSSH style SHA-256 fingerprint, `SHA256:<base64>`.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.to_blob())
    }

    /// Verifies an SSH signature blob made with `algorithm`.
    ///
    /// The algorithm must be compatible with the key format, and the name
    /// inside the signature blob must equal the algorithm name.
    pub fn verify(
        &self,
        algorithm: HostKeyAlgorithm,
        data: &[u8],
        signature_blob: &[u8],
    ) -> SkiffResult<()> {
        if algorithm.key_type() != self.key_type() {
            return Err(SkiffError::Security(format!(
                "Algorithm {} cannot be used with a {} key",
                algorithm,
                self.key_type()
            )));
        }

        let mut buf = WireBuffer::from_slice(signature_blob);
        let sig_name = buf.get_utf8()?;
        if sig_name != algorithm.name() {
            return Err(SkiffError::Security(format!(
                "Signature algorithm {} does not match negotiated {}",
                sig_name, algorithm
            )));
        }
        let sig = buf.get_string()?;

        let valid = match self {
            PublicKey::Ed25519(point) => verify_ed25519(point, data, &sig)?,
            PublicKey::Rsa { e, n } => verify_rsa(algorithm, e, n, data, &sig),
            PublicKey::Ecdsa { curve, point } => verify_ecdsa(*curve, point, data, &sig)?,
        };

        if valid {
            Ok(())
        } else {
            Err(SkiffError::Security(format!(
                "{} signature verification failed",
                algorithm
            )))
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("type", &self.key_type())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// SHA-256 fingerprint of a raw key blob.
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// Verifies `signature_blob` over `data` with the host key in `key_blob`.
pub fn verify_signature(
    algorithm: HostKeyAlgorithm,
    key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
) -> SkiffResult<()> {
    PublicKey::from_blob(key_blob)?.verify(algorithm, data, signature_blob)
}

fn verify_ed25519(point: &[u8; 32], data: &[u8], sig: &[u8]) -> SkiffResult<bool> {
    let verifying_key = VerifyingKey::from_bytes(point)
        .map_err(|e| SkiffError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
    let sig: [u8; 64] = sig
        .try_into()
        .map_err(|_| SkiffError::Security("Ed25519 signature must be 64 bytes".to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig);
    Ok(verifying_key.verify(data, &signature).is_ok())
}

fn verify_rsa(algorithm: HostKeyAlgorithm, e: &[u8], n: &[u8], data: &[u8], sig: &[u8]) -> bool {
    let params = match algorithm {
        HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_2048_8192_SHA512,
        HostKeyAlgorithm::RsaSha2_256 => &RSA_PKCS1_2048_8192_SHA256,
        _ => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    };
    RsaPublicKeyComponents { n, e }
        .verify(params, data, sig)
        .is_ok()
}

/// ECDSA signatures travel as `mpint r || mpint s`; the curve crates want
/// fixed width `r || s`.
fn verify_ecdsa(curve: EcdsaCurve, point: &[u8], data: &[u8], sig: &[u8]) -> SkiffResult<bool> {
    use signature::Verifier;

    let mut buf = WireBuffer::from_slice(sig);
    let r = buf.get_mpint()?;
    let s = buf.get_mpint()?;
    let width = curve.field_len();
    if r.len() > width || s.len() > width {
        return Ok(false);
    }
    let mut fixed = vec![0u8; width * 2];
    fixed[width - r.len()..width].copy_from_slice(&r);
    fixed[2 * width - s.len()..].copy_from_slice(&s);

    let bad_key = |e: &dyn fmt::Display| {
        SkiffError::Security(format!("Invalid {} public key: {}", curve.identifier(), e))
    };

    Ok(match curve {
        EcdsaCurve::NistP256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| bad_key(&e))?;
            match p256::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        EcdsaCurve::NistP384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| bad_key(&e))?;
            match p384::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        EcdsaCurve::NistP521 => {
            let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| bad_key(&e))?;
            match p521::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
    })
}

/// A private key able to produce SSH signatures.
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Sign data and return the signature blob
    /// (`string algorithm, string signature`).
    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>>;

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }

    /// SHA-256 fingerprint of the public key.
    fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }
}

fn signature_blob(algorithm: HostKeyAlgorithm, sig: &[u8]) -> Vec<u8> {
    let mut buf = WireBuffer::with_capacity(sig.len() + 32);
    buf.put_str(algorithm.name());
    buf.put_string(sig);
    buf.into_vec()
}

/// Ed25519 key pair (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> SkiffResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut csprng));
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
        })
    }

    /// Create from the 32-byte secret seed
    pub fn from_bytes(secret_bytes: &[u8]) -> SkiffResult<Self> {
        let seed: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(secret_bytes.try_into().map_err(|_| {
                SkiffError::Security("Ed25519 secret key must be 32 bytes".to_string())
            })?);
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// The secret seed.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        PublicKey::Ed25519(self.signing_key.verifying_key().to_bytes()).to_blob()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(signature_blob(self.algorithm(), &signature.to_bytes()))
    }
}

impl fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// RSA key pair signing with `rsa-sha2-256` or `rsa-sha2-512`.
pub struct RsaHostKey {
    key_pair: RsaKeyPair,
    algorithm: HostKeyAlgorithm,
    public: PublicKey,
}

impl RsaHostKey {
    /// Loads a PKCS#8 DER private key.
    ///
    /// `ssh-rsa` (SHA-1) signing is refused.
    pub fn from_pkcs8(der: &[u8], algorithm: HostKeyAlgorithm) -> SkiffResult<Self> {
        match algorithm {
            HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 => {}
            other => {
                return Err(SkiffError::Security(format!(
                    "RSA keys cannot sign with {}",
                    other
                )))
            }
        }
        let key_pair = RsaKeyPair::from_pkcs8(der)
            .map_err(|e| SkiffError::Security(format!("Invalid RSA private key: {}", e)))?;
        let (n, e) = rsa_public_components(key_pair.public().as_ref())?;
        Ok(Self {
            key_pair,
            algorithm,
            public: PublicKey::Rsa { e, n },
        })
    }
}

impl HostKey for RsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        self.algorithm
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_blob()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let encoding = match self.algorithm {
            HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_SHA512,
            _ => &RSA_PKCS1_SHA256,
        };
        let rng = ring::rand::SystemRandom::new();
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(encoding, &rng, data, &mut signature)
            .map_err(|e| SkiffError::Security(format!("RSA signing failed: {}", e)))?;
        Ok(signature_blob(self.algorithm, &signature))
    }
}

impl fmt::Debug for RsaHostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaHostKey")
            .field("algorithm", &self.algorithm.name())
            .field("fingerprint", &self.public.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Extracts `(n, e)` from a DER `RSAPublicKey`.
fn rsa_public_components(der: &[u8]) -> SkiffResult<(Vec<u8>, Vec<u8>)> {
    fn read_tlv<'a>(input: &mut &'a [u8], tag: u8) -> SkiffResult<&'a [u8]> {
        let bad = || SkiffError::Security("Malformed RSA public key DER".to_string());
        let (&t, rest) = input.split_first().ok_or_else(bad)?;
        if t != tag {
            return Err(bad());
        }
        let (&first, mut rest) = rest.split_first().ok_or_else(bad)?;
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 || rest.len() < count {
                return Err(bad());
            }
            let len = rest[..count]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            rest = &rest[count..];
            len
        };
        if rest.len() < len {
            return Err(bad());
        }
        let (value, tail) = rest.split_at(len);
        *input = tail;
        Ok(value)
    }

    let mut outer = der;
    let mut seq = read_tlv(&mut outer, 0x30)?;
    let n = read_tlv(&mut seq, 0x02)?;
    let e = read_tlv(&mut seq, 0x02)?;
    let strip = |v: &[u8]| {
        let start = v.iter().position(|&b| b != 0).unwrap_or(v.len());
        v[start..].to_vec()
    };
    Ok((strip(n), strip(e)))
}

enum EcdsaSigner {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

/// ECDSA key pair on one of the NIST curves.
pub struct EcdsaHostKey {
    signer: EcdsaSigner,
    public: PublicKey,
}

impl EcdsaHostKey {
    /// Generate a new key pair on `curve`.
    pub fn generate(curve: EcdsaCurve) -> SkiffResult<Self> {
        let mut rng = rand::thread_rng();
        let (signer, point) = match curve {
            EcdsaCurve::NistP256 => {
                let sk = p256::ecdsa::SigningKey::random(&mut rng);
                let vk = p256::ecdsa::VerifyingKey::from(&sk);
                let point = vk.to_encoded_point(false).as_bytes().to_vec();
                (EcdsaSigner::P256(sk), point)
            }
            EcdsaCurve::NistP384 => {
                let sk = p384::ecdsa::SigningKey::random(&mut rng);
                let vk = p384::ecdsa::VerifyingKey::from(&sk);
                let point = vk.to_encoded_point(false).as_bytes().to_vec();
                (EcdsaSigner::P384(sk), point)
            }
            EcdsaCurve::NistP521 => {
                let sk = p521::ecdsa::SigningKey::random(&mut rng);
                let vk = p521::ecdsa::VerifyingKey::from(&sk);
                let point = vk.to_encoded_point(false).as_bytes().to_vec();
                (EcdsaSigner::P521(sk), point)
            }
        };
        Ok(Self {
            signer,
            public: PublicKey::Ecdsa { curve, point },
        })
    }

    fn curve(&self) -> EcdsaCurve {
        match self.signer {
            EcdsaSigner::P256(_) => EcdsaCurve::NistP256,
            EcdsaSigner::P384(_) => EcdsaCurve::NistP384,
            EcdsaSigner::P521(_) => EcdsaCurve::NistP521,
        }
    }
}

impl HostKey for EcdsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        self.curve().algorithm()
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_blob()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        use signature::Signer;

        let fixed: Vec<u8> = match &self.signer {
            EcdsaSigner::P256(sk) => {
                let sig: p256::ecdsa::Signature = sk.sign(data);
                sig.to_bytes().to_vec()
            }
            EcdsaSigner::P384(sk) => {
                let sig: p384::ecdsa::Signature = sk.sign(data);
                sig.to_bytes().to_vec()
            }
            EcdsaSigner::P521(sk) => {
                let sig: p521::ecdsa::Signature = sk.sign(data);
                sig.to_bytes().to_vec()
            }
        };
        let (r, s) = fixed.split_at(fixed.len() / 2);
        let mut inner = WireBuffer::new();
        inner.put_mpint(r);
        inner.put_mpint(s);
        Ok(signature_blob(self.algorithm(), inner.as_slice()))
    }
}

impl fmt::Debug for EcdsaHostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdsaHostKey")
            .field("curve", &self.curve().identifier())
            .field("fingerprint", &self.public.fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names_round_trip() {
        for alg in [
            HostKeyAlgorithm::SshEd25519,
            HostKeyAlgorithm::RsaSha2_256,
            HostKeyAlgorithm::RsaSha2_512,
            HostKeyAlgorithm::SshRsa,
            HostKeyAlgorithm::EcdsaSha2Nistp256,
            HostKeyAlgorithm::EcdsaSha2Nistp384,
            HostKeyAlgorithm::EcdsaSha2Nistp521,
        ] {
            assert_eq!(HostKeyAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(HostKeyAlgorithm::from_name("ssh-dss"), None);
        assert_eq!(HostKeyAlgorithm::RsaSha2_512.key_type(), "ssh-rsa");
        assert!(HostKeyAlgorithm::SshRsa.is_rsa());
        assert!(!HostKeyAlgorithm::SshEd25519.is_rsa());
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate().unwrap();
        let sig = key.sign(b"hello").unwrap();
        verify_signature(key.algorithm(), &key.public_key_bytes(), b"hello", &sig).unwrap();

        let err = verify_signature(key.algorithm(), &key.public_key_bytes(), b"hellO", &sig);
        assert!(matches!(err, Err(SkiffError::Security(_))));
    }

    #[test]
    fn test_ed25519_from_bytes_is_deterministic() {
        let a = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        let b = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert_eq!(*a.secret_bytes(), [7u8; 32]);
        assert!(Ed25519HostKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_ecdsa_sign_verify_all_curves() {
        for curve in [EcdsaCurve::NistP256, EcdsaCurve::NistP384, EcdsaCurve::NistP521] {
            let key = EcdsaHostKey::generate(curve).unwrap();
            assert_eq!(key.algorithm(), curve.algorithm());
            let blob = key.public_key_bytes();
            let sig = key.sign(b"exchange hash").unwrap();
            verify_signature(key.algorithm(), &blob, b"exchange hash", &sig).unwrap();
            assert!(verify_signature(key.algorithm(), &blob, b"other", &sig).is_err());
        }
    }

    #[test]
    fn test_signature_name_must_match_algorithm() {
        let key = EcdsaHostKey::generate(EcdsaCurve::NistP256).unwrap();
        let sig = key.sign(b"data").unwrap();
        let err = verify_signature(
            HostKeyAlgorithm::SshEd25519,
            &key.public_key_bytes(),
            b"data",
            &sig,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be used"));

        let mut forged = WireBuffer::new();
        forged.put_str("ecdsa-sha2-nistp384");
        forged.put_string(&[0u8; 8]);
        assert!(verify_signature(
            HostKeyAlgorithm::EcdsaSha2Nistp256,
            &key.public_key_bytes(),
            b"data",
            forged.as_slice()
        )
        .is_err());
    }

    #[test]
    fn test_public_key_blob_round_trip() {
        let ed = Ed25519HostKey::generate().unwrap();
        let parsed = PublicKey::from_blob(&ed.public_key_bytes()).unwrap();
        assert_eq!(parsed.to_blob(), ed.public_key_bytes());
        assert_eq!(parsed.key_type(), "ssh-ed25519");

        let rsa = PublicKey::Rsa {
            e: vec![1, 0, 1],
            n: vec![0xC0; 256],
        };
        let reparsed = PublicKey::from_blob(&rsa.to_blob()).unwrap();
        assert_eq!(reparsed, rsa);
    }

    #[test]
    fn test_malformed_blobs_rejected() {
        assert!(PublicKey::from_blob(&[]).is_err());

        let mut buf = WireBuffer::new();
        buf.put_str("ssh-ed25519");
        buf.put_string(&[1u8; 31]);
        assert!(PublicKey::from_blob(buf.as_slice()).is_err());

        let mut buf = WireBuffer::new();
        buf.put_str("ecdsa-sha2-nistp256");
        buf.put_str("nistp384");
        buf.put_string(&[4u8; 65]);
        assert!(PublicKey::from_blob(buf.as_slice()).is_err());

        let mut buf = WireBuffer::new();
        buf.put_str("ssh-dss");
        assert!(PublicKey::from_blob(buf.as_slice()).is_err());

        let ed = Ed25519HostKey::generate().unwrap();
        let mut trailing = ed.public_key_bytes();
        trailing.push(0);
        assert!(PublicKey::from_blob(&trailing).is_err());
    }

    #[test]
    fn test_rsa_bad_signature_fails() {
        let rsa = PublicKey::Rsa {
            e: vec![1, 0, 1],
            n: vec![0xC3; 256],
        };
        let mut sig = WireBuffer::new();
        sig.put_str("rsa-sha2-256");
        sig.put_string(&[0x11; 256]);
        assert!(rsa
            .verify(HostKeyAlgorithm::RsaSha2_256, b"data", sig.as_slice())
            .is_err());
    }

    #[test]
    fn test_rsa_rejects_invalid_der_and_sha1() {
        assert!(RsaHostKey::from_pkcs8(&[0x30, 0x00], HostKeyAlgorithm::RsaSha2_256).is_err());
        assert!(RsaHostKey::from_pkcs8(&[], HostKeyAlgorithm::SshRsa).is_err());
    }

    #[test]
    fn test_rsa_der_components() {
        // SEQUENCE { INTEGER 0x00C5.., INTEGER 0x010001 }
        let mut der = vec![0x30, 0x0b, 0x02, 0x04, 0x00, 0xC5, 0x01, 0x02, 0x02, 0x03, 0x01, 0x00, 0x01];
        let (n, e) = rsa_public_components(&der).unwrap();
        assert_eq!(n, vec![0xC5, 0x01, 0x02]);
        assert_eq!(e, vec![0x01, 0x00, 0x01]);
        der[0] = 0x31;
        assert!(rsa_public_components(&der).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"blob");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = Ed25519HostKey::from_bytes(&[9u8; 32]).unwrap();
        let dbg = format!("{:?}", key);
        assert!(dbg.contains("SHA256:"));
        assert!(!dbg.contains("signing_key"));
    }
}
