//! Key exchange methods (RFC 4253, RFC 4419, RFC 5656, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - Fixed-group Diffie-Hellman: group1-sha1, group14-sha1/sha256,
//!   group16-sha512
//! - Diffie-Hellman group exchange: sha1 and sha256
//! - ECDH: curve25519-sha256 (and the libssh.org alias), nistp256, nistp384
//! - Exchange hash construction and key derivation
//!
//! # Security
//!
//! - The peer's DH value is checked to lie in `(1, p-1)`
//! - ECDH public values are validated by ring
//! - Private exponents, shared secrets and derived keys are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex_dh::{EcdhExchange, KexMethod};
//!
//! let method = KexMethod::from_name("curve25519-sha256").unwrap();
//! let client = EcdhExchange::new(method).unwrap();
//! let server = EcdhExchange::new(method).unwrap();
//!
//! let client_public = client.public_key().to_vec();
//! let server_public = server.public_key().to_vec();
//!
//! let k1 = client.compute_shared_secret(&server_public).unwrap();
//! let k2 = server.compute_shared_secret(&client_public).unwrap();
//! assert_eq!(*k1, *k2);
//! ```

use crate::ssh::buffer::WireBuffer;
use crate::ssh::crypto::HashAlgorithm;
use crate::ssh::message::MessageType;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{self, agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey};
use ring::rand::SystemRandom;
use skiff_platform::{SkiffError, SkiffResult};
use std::fmt;
use zeroize::Zeroizing;

/// Key exchange methods understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexMethod {
    /// curve25519-sha256
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org
    Curve25519Sha256Libssh,
    /// ecdh-sha2-nistp256
    EcdhNistp256,
    /// ecdh-sha2-nistp384
    EcdhNistp384,
    /// diffie-hellman-group-exchange-sha256
    DhGexSha256,
    /// diffie-hellman-group-exchange-sha1
    DhGexSha1,
    /// diffie-hellman-group16-sha512
    DhGroup16Sha512,
    /// diffie-hellman-group14-sha256
    DhGroup14Sha256,
    /// diffie-hellman-group14-sha1
    DhGroup14Sha1,
    /// diffie-hellman-group1-sha1
    DhGroup1Sha1,
}

/// How a method exchanges its ephemeral values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexFlavor {
    /// KEX_ECDH_INIT / KEX_ECDH_REPLY with octet-string public values
    Ecdh,
    /// KEXDH_INIT / KEXDH_REPLY over a well-known group
    FixedGroup,
    /// KEX_DH_GEX_REQUEST / GROUP / INIT / REPLY
    GroupExchange,
}

impl KexMethod {
    /// Looks up a method by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "curve25519-sha256" => KexMethod::Curve25519Sha256,
            "curve25519-sha256@libssh.org" => KexMethod::Curve25519Sha256Libssh,
            "ecdh-sha2-nistp256" => KexMethod::EcdhNistp256,
            "ecdh-sha2-nistp384" => KexMethod::EcdhNistp384,
            "diffie-hellman-group-exchange-sha256" => KexMethod::DhGexSha256,
            "diffie-hellman-group-exchange-sha1" => KexMethod::DhGexSha1,
            "diffie-hellman-group16-sha512" => KexMethod::DhGroup16Sha512,
            "diffie-hellman-group14-sha256" => KexMethod::DhGroup14Sha256,
            "diffie-hellman-group14-sha1" => KexMethod::DhGroup14Sha1,
            "diffie-hellman-group1-sha1" => KexMethod::DhGroup1Sha1,
            _ => return None,
        })
    }

    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::Curve25519Sha256 => "curve25519-sha256",
            KexMethod::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexMethod::EcdhNistp256 => "ecdh-sha2-nistp256",
            KexMethod::EcdhNistp384 => "ecdh-sha2-nistp384",
            KexMethod::DhGexSha256 => "diffie-hellman-group-exchange-sha256",
            KexMethod::DhGexSha1 => "diffie-hellman-group-exchange-sha1",
            KexMethod::DhGroup16Sha512 => "diffie-hellman-group16-sha512",
            KexMethod::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
            KexMethod::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            KexMethod::DhGroup1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Hash used for H and key derivation.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            KexMethod::Curve25519Sha256
            | KexMethod::Curve25519Sha256Libssh
            | KexMethod::EcdhNistp256
            | KexMethod::DhGexSha256
            | KexMethod::DhGroup14Sha256 => HashAlgorithm::Sha256,
            KexMethod::EcdhNistp384 => HashAlgorithm::Sha384,
            KexMethod::DhGroup16Sha512 => HashAlgorithm::Sha512,
            KexMethod::DhGexSha1 | KexMethod::DhGroup14Sha1 | KexMethod::DhGroup1Sha1 => {
                HashAlgorithm::Sha1
            }
        }
    }

    /// Message flow used by this method.
    pub fn flavor(&self) -> KexFlavor {
        match self {
            KexMethod::Curve25519Sha256
            | KexMethod::Curve25519Sha256Libssh
            | KexMethod::EcdhNistp256
            | KexMethod::EcdhNistp384 => KexFlavor::Ecdh,
            KexMethod::DhGexSha256 | KexMethod::DhGexSha1 => KexFlavor::GroupExchange,
            KexMethod::DhGroup16Sha512
            | KexMethod::DhGroup14Sha256
            | KexMethod::DhGroup14Sha1
            | KexMethod::DhGroup1Sha1 => KexFlavor::FixedGroup,
        }
    }

    /// The well-known group for fixed-group methods.
    pub fn fixed_group(&self) -> Option<SkiffResult<DhGroup>> {
        match self {
            KexMethod::DhGroup1Sha1 => Some(DhGroup::oakley(&GROUP1, "group1")),
            KexMethod::DhGroup14Sha1 | KexMethod::DhGroup14Sha256 => {
                Some(DhGroup::oakley(&GROUP14, "group14"))
            }
            KexMethod::DhGroup16Sha512 => Some(DhGroup::oakley(&GROUP16, "group16")),
            _ => None,
        }
    }
}

impl fmt::Display for KexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// MODP primes from RFC 2409 (group 1) and RFC 3526 (groups 14 and 16).
const GROUP1_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

const GROUP14_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

const GROUP16_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64",
    "ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B",
    "F12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31",
    "43DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA",
    "2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6",
    "287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED",
    "1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199",
    "FFFFFFFFFFFFFFFF",
);

static GROUP1: Lazy<Option<BigUint>> = Lazy::new(|| BigUint::parse_bytes(GROUP1_HEX.as_bytes(), 16));
static GROUP14: Lazy<Option<BigUint>> =
    Lazy::new(|| BigUint::parse_bytes(GROUP14_HEX.as_bytes(), 16));
static GROUP16: Lazy<Option<BigUint>> =
    Lazy::new(|| BigUint::parse_bytes(GROUP16_HEX.as_bytes(), 16));

/// A Diffie-Hellman group: prime modulus and generator.
#[derive(Clone, PartialEq, Eq)]
pub struct DhGroup {
    /// Prime modulus
    pub p: BigUint,
    /// Generator
    pub g: BigUint,
}

impl DhGroup {
    fn oakley(prime: &Lazy<Option<BigUint>>, name: &str) -> SkiffResult<Self> {
        let p = prime
            .as_ref()
            .cloned()
            .ok_or_else(|| SkiffError::Protocol(format!("Invalid built-in DH {} prime", name)))?;
        Ok(Self {
            p,
            g: BigUint::from(2u32),
        })
    }

    /// Builds a group from big-endian magnitudes, as received in
    /// SSH_MSG_KEX_DH_GEX_GROUP.
    pub fn from_bytes(p: &[u8], g: &[u8]) -> Self {
        Self {
            p: BigUint::from_bytes_be(p),
            g: BigUint::from_bytes_be(g),
        }
    }

    /// Size of the prime in bits.
    pub fn bits(&self) -> u64 {
        self.p.bits()
    }
}

impl fmt::Debug for DhGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhGroup")
            .field("bits", &self.bits())
            .field("g", &self.g)
            .finish()
    }
}

/// Upper bound on the private exponent size in bits.
const DH_EXPONENT_BITS: u64 = 512;

/// Ephemeral finite-field Diffie-Hellman.
pub struct DhExchange {
    group: DhGroup,
    /// Private exponent (big-endian)
    private_key: Zeroizing<Vec<u8>>,
    /// Public value g^x mod p (big-endian)
    public_key: Vec<u8>,
}

impl DhExchange {
    /// Generates a key pair in `group`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for degenerate groups.
    pub fn new(group: DhGroup) -> SkiffResult<Self> {
        if group.bits() < 512 || group.g <= BigUint::from(1u32) || group.g >= group.p {
            return Err(SkiffError::Protocol(format!(
                "Unusable DH group ({} bits)",
                group.bits()
            )));
        }

        let mut rng = rand::thread_rng();
        let bits = DH_EXPONENT_BITS.min(group.bits() - 1);
        let mut x = rng.gen_biguint(bits);
        while x <= BigUint::from(1u32) {
            x = rng.gen_biguint(bits);
        }

        let y = group.g.modpow(&x, &group.p);

        Ok(Self {
            group,
            private_key: Zeroizing::new(x.to_bytes_be()),
            public_key: y.to_bytes_be(),
        })
    }

    /// Returns the public value `e` (or `f` on the server side).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Returns the group.
    pub fn group(&self) -> &DhGroup {
        &self.group
    }

    /// Computes `K = peer^x mod p`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if the peer's value is outside
    /// `(1, p-1)`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SkiffResult<Zeroizing<Vec<u8>>> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = &self.group.p - 1u32;

        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(SkiffError::Protocol(
                "Invalid peer DH public value: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &self.group.p);

        Ok(Zeroizing::new(k.to_bytes_be()))
    }
}

/// Ephemeral elliptic-curve Diffie-Hellman through ring.
pub struct EcdhExchange {
    private_key: EphemeralPrivateKey,
    public_key: Vec<u8>,
    algorithm: &'static agreement::Algorithm,
}

impl EcdhExchange {
    /// Generates a key pair for an ECDH method.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for non-ECDH methods and
    /// [`SkiffError::Security`] if key generation fails.
    pub fn new(method: KexMethod) -> SkiffResult<Self> {
        let algorithm: &'static agreement::Algorithm = match method {
            KexMethod::Curve25519Sha256 | KexMethod::Curve25519Sha256Libssh => &agreement::X25519,
            KexMethod::EcdhNistp256 => &agreement::ECDH_P256,
            KexMethod::EcdhNistp384 => &agreement::ECDH_P384,
            other => {
                return Err(SkiffError::Protocol(format!(
                    "{} is not an ECDH method",
                    other
                )))
            }
        };

        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(algorithm, &rng)
            .map_err(|_| SkiffError::Security(format!("Failed to generate {} key", method)))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| SkiffError::Security(format!("Failed to compute {} public key", method)))?
            .as_ref()
            .to_vec();

        Ok(Self {
            private_key,
            public_key,
            algorithm,
        })
    }

    /// Returns the public value `Q_C` (or `Q_S` on the server side).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the ephemeral key.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Security`] if the peer's point is invalid.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> SkiffResult<Zeroizing<Vec<u8>>> {
        let peer = UnparsedPublicKey::new(self.algorithm, peer_public);
        agree_ephemeral(self.private_key, &peer, |key_material| {
            Zeroizing::new(key_material.to_vec())
        })
        .map_err(|_| SkiffError::Security("ECDH key agreement failed".to_string()))
    }
}

/// Method-specific values covered by the exchange hash.
#[derive(Debug, Clone, Copy)]
pub enum ExchangeValues<'a> {
    /// Fixed-group DH: `e`, `f` as mpint magnitudes
    Dh {
        /// Client public value
        e: &'a [u8],
        /// Server public value
        f: &'a [u8],
    },
    /// Group exchange: request sizes, group, `e`, `f`
    GroupExchange {
        /// Minimum acceptable group size
        min: u32,
        /// Preferred group size
        preferred: u32,
        /// Maximum acceptable group size
        max: u32,
        /// Prime magnitude
        p: &'a [u8],
        /// Generator magnitude
        g: &'a [u8],
        /// Client public value
        e: &'a [u8],
        /// Server public value
        f: &'a [u8],
    },
    /// ECDH: `Q_C`, `Q_S` as strings
    Ecdh {
        /// Client public point
        q_c: &'a [u8],
        /// Server public point
        q_s: &'a [u8],
    },
}

/// Inputs to the exchange hash common to every method.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C, client identification without CR LF
    pub client_version: &'a str,
    /// V_S, server identification without CR LF
    pub server_version: &'a str,
    /// I_C, client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S, server host key blob
    pub host_key: &'a [u8],
}

/// Computes the exchange hash H.
///
/// ```text
/// H = HASH(V_C || V_S || I_C || I_S || K_S || <method values> || K)
/// ```
pub fn exchange_hash(
    hash: HashAlgorithm,
    input: &ExchangeHashInput<'_>,
    values: &ExchangeValues<'_>,
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut h = hash.hasher();
    h.update_string(input.client_version.as_bytes());
    h.update_string(input.server_version.as_bytes());
    h.update_string(input.client_kexinit);
    h.update_string(input.server_kexinit);
    h.update_string(input.host_key);

    match *values {
        ExchangeValues::Dh { e, f } => {
            h.update_mpint(e);
            h.update_mpint(f);
        }
        ExchangeValues::GroupExchange {
            min,
            preferred,
            max,
            p,
            g,
            e,
            f,
        } => {
            h.update(&min.to_be_bytes());
            h.update(&preferred.to_be_bytes());
            h.update(&max.to_be_bytes());
            h.update_mpint(p);
            h.update_mpint(g);
            h.update_mpint(e);
            h.update_mpint(f);
        }
        ExchangeValues::Ecdh { q_c, q_s } => {
            h.update_string(q_c);
            h.update_string(q_s);
        }
    }

    h.update_mpint(shared_secret);
    h.finalize()
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...   truncated to key_length
/// ```
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::crypto::HashAlgorithm;
/// use skiff_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(HashAlgorithm::Sha256, &[0x42; 32], &[1; 32], &[2; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut prefix = hash.hasher();
    prefix.update_mpint(shared_secret);
    prefix.update(exchange_hash);

    let mut key = Zeroizing::new(Vec::with_capacity(key_length + hash.output_len()));

    let mut first = prefix.clone();
    first.update(&[letter]);
    first.update(session_id);
    key.extend_from_slice(&first.finalize());

    while key.len() < key_length {
        let mut next = prefix.clone();
        next.update(&key);
        key.extend_from_slice(&next.finalize());
    }

    key.truncate(key_length);
    key
}

/// Key material lengths demanded by the negotiated algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyLengths {
    /// IV client to server
    pub iv_client_to_server: usize,
    /// IV server to client
    pub iv_server_to_client: usize,
    /// Cipher key client to server
    pub enc_client_to_server: usize,
    /// Cipher key server to client
    pub enc_server_to_client: usize,
    /// MAC key client to server
    pub mac_client_to_server: usize,
    /// MAC key server to client
    pub mac_server_to_client: usize,
}

/// The six derived values, letters A to F.
pub struct SessionKeys {
    /// A: initial IV client to server
    pub iv_client_to_server: Zeroizing<Vec<u8>>,
    /// B: initial IV server to client
    pub iv_server_to_client: Zeroizing<Vec<u8>>,
    /// C: encryption key client to server
    pub enc_client_to_server: Zeroizing<Vec<u8>>,
    /// D: encryption key server to client
    pub enc_server_to_client: Zeroizing<Vec<u8>>,
    /// E: integrity key client to server
    pub mac_client_to_server: Zeroizing<Vec<u8>>,
    /// F: integrity key server to client
    pub mac_server_to_client: Zeroizing<Vec<u8>>,
}

impl SessionKeys {
    /// Derives all six values.
    pub fn derive(
        hash: HashAlgorithm,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        lengths: &KeyLengths,
    ) -> Self {
        let d = |letter, len| derive_key(hash, shared_secret, exchange_hash, session_id, letter, len);
        Self {
            iv_client_to_server: d(b'A', lengths.iv_client_to_server),
            iv_server_to_client: d(b'B', lengths.iv_server_to_client),
            enc_client_to_server: d(b'C', lengths.enc_client_to_server),
            enc_server_to_client: d(b'D', lengths.enc_server_to_client),
            mac_client_to_server: d(b'E', lengths.mac_client_to_server),
            mac_server_to_client: d(b'F', lengths.mac_server_to_client),
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("iv_client_to_server", &"<redacted>")
            .field("iv_server_to_client", &"<redacted>")
            .field("enc_client_to_server", &"<redacted>")
            .field("enc_server_to_client", &"<redacted>")
            .field("mac_client_to_server", &"<redacted>")
            .field("mac_server_to_client", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Encodes KEXDH_INIT (30), KEX_ECDH_INIT (30) or KEX_DH_GEX_INIT (32).
pub fn encode_kex_init(flavor: KexFlavor, public_key: &[u8]) -> Vec<u8> {
    let mut buf = WireBuffer::with_capacity(public_key.len() + 16);
    match flavor {
        KexFlavor::Ecdh => {
            buf.put_u8(MessageType::KexdhInit as u8);
            buf.put_string(public_key);
        }
        KexFlavor::FixedGroup => {
            buf.put_u8(MessageType::KexdhInit as u8);
            buf.put_mpint(public_key);
        }
        KexFlavor::GroupExchange => {
            buf.put_u8(MessageType::KexDhGexInit as u8);
            buf.put_mpint(public_key);
        }
    }
    buf.into_vec()
}

/// Encodes SSH_MSG_KEX_DH_GEX_REQUEST.
pub fn encode_gex_request(min: u32, preferred: u32, max: u32) -> Vec<u8> {
    let mut buf = WireBuffer::with_capacity(13);
    buf.put_u8(MessageType::KexDhGexRequest as u8);
    buf.put_u32(min);
    buf.put_u32(preferred);
    buf.put_u32(max);
    buf.into_vec()
}

/// Parses SSH_MSG_KEX_DH_GEX_GROUP into `(p, g)` magnitudes.
pub fn parse_gex_group(payload: &[u8]) -> SkiffResult<(Vec<u8>, Vec<u8>)> {
    let mut buf = WireBuffer::from_slice(payload);
    let msg = buf.get_u8()?;
    if msg != crate::ssh::message::KEX_DH_GEX_GROUP {
        return Err(SkiffError::Protocol(format!(
            "Expected KEX_DH_GEX_GROUP, got message {}",
            msg
        )));
    }
    let p = buf.get_mpint()?;
    let g = buf.get_mpint()?;
    Ok((p, g))
}

/// The server's reply: KEXDH_REPLY, KEX_ECDH_REPLY or KEX_DH_GEX_REPLY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexReply {
    /// K_S, the server host key blob
    pub host_key: Vec<u8>,
    /// `f` magnitude or `Q_S` octets
    pub server_public: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
}

impl KexReply {
    /// Parses the reply for `flavor`.
    pub fn parse(flavor: KexFlavor, payload: &[u8]) -> SkiffResult<Self> {
        let mut buf = WireBuffer::from_slice(payload);
        let msg = buf.get_u8()?;
        let expected = match flavor {
            KexFlavor::Ecdh | KexFlavor::FixedGroup => MessageType::KexdhReply as u8,
            KexFlavor::GroupExchange => MessageType::KexDhGexReply as u8,
        };
        if msg != expected {
            return Err(SkiffError::Protocol(format!(
                "Expected KEX reply message {}, got {}",
                expected, msg
            )));
        }

        let host_key = buf.get_string()?;
        let server_public = match flavor {
            KexFlavor::Ecdh => buf.get_string()?,
            _ => buf.get_mpint()?,
        };
        let signature = buf.get_string()?;

        Ok(Self {
            host_key,
            server_public,
            signature,
        })
    }

    /// Encodes the reply for `flavor`.
    pub fn to_bytes(&self, flavor: KexFlavor) -> Vec<u8> {
        let mut buf = WireBuffer::with_capacity(
            self.host_key.len() + self.server_public.len() + self.signature.len() + 32,
        );
        match flavor {
            KexFlavor::GroupExchange => buf.put_u8(MessageType::KexDhGexReply as u8),
            _ => buf.put_u8(MessageType::KexdhReply as u8),
        }
        buf.put_string(&self.host_key);
        match flavor {
            KexFlavor::Ecdh => buf.put_string(&self.server_public),
            _ => buf.put_mpint(&self.server_public),
        }
        buf.put_string(&self.signature);
        buf.into_vec()
    }
}
