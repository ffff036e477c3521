//! SSH cryptographic providers.
//!
//! The transport layer never names a concrete algorithm. It asks the
//! [`AlgorithmRegistry`](crate::ssh::registry::AlgorithmRegistry) for a
//! provider by its negotiated name and talks to it through the traits in
//! this module:
//!
//! - [`CipherProvider`] / [`PacketCipher`] - packet encryption
//! - [`MacProvider`] / [`PacketMac`] - packet integrity (init/update/final)
//! - [`HashAlgorithm`] / [`Hasher`] - exchange hash and key derivation
//!
//! Built-in providers:
//!
//! - `none`
//! - `aes128-ctr`, `aes192-ctr`, `aes256-ctr`
//! - `aes128-cbc`, `aes256-cbc`
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com` (AEAD, RFC 5647)
//! - `hmac-sha1`, `hmac-sha1-96`, `hmac-sha2-256`, `hmac-sha2-512`
//!
//! # Security
//!
//! - MAC verification uses constant-time comparison
//! - Key material is zeroized on drop
//! - `Debug` output never includes keys

use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Direction a cipher instance is used in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Outgoing packets
    Encrypt,
    /// Incoming packets
    Decrypt,
}

/// Factory for a named cipher.
pub trait CipherProvider: Send + Sync {
    /// Algorithm name as negotiated in KEXINIT.
    fn name(&self) -> &'static str;

    /// Key length in bytes.
    fn key_len(&self) -> usize;

    /// IV length in bytes.
    fn iv_len(&self) -> usize;

    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Authentication tag length for AEAD ciphers, 0 otherwise.
    fn tag_len(&self) -> usize {
        0
    }

    /// Creates a keyed cipher instance.
    ///
    /// `key` and `iv` may be longer than required; only the leading bytes
    /// are used.
    fn create(
        &self,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> SkiffResult<Box<dyn PacketCipher>>;
}

/// A keyed, stateful cipher bound to one direction of the transport.
pub trait PacketCipher: Send {
    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Authentication tag length, non-zero only for AEAD ciphers.
    fn tag_len(&self) -> usize {
        0
    }

    /// Returns true if this cipher authenticates packets itself.
    fn is_aead(&self) -> bool {
        self.tag_len() > 0
    }

    /// Encrypts or decrypts `data` in place.
    ///
    /// `data.len()` must be a multiple of [`block_size`](Self::block_size).
    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()>;

    /// AEAD only. `packet` holds the 4 length bytes followed by the
    /// plaintext; the plaintext is encrypted in place and the tag appended.
    fn seal(&mut self, _packet: &mut Vec<u8>) -> SkiffResult<()> {
        Err(SkiffError::NotImplemented(
            "seal on a non-AEAD cipher".to_string(),
        ))
    }

    /// AEAD only. `packet` holds the 4 length bytes, the ciphertext and the
    /// tag; on success the ciphertext is replaced by plaintext and the tag
    /// removed.
    fn open(&mut self, _packet: &mut Vec<u8>) -> SkiffResult<()> {
        Err(SkiffError::NotImplemented(
            "open on a non-AEAD cipher".to_string(),
        ))
    }
}

/// Factory for a named MAC.
pub trait MacProvider: Send + Sync {
    /// Algorithm name as negotiated in KEXINIT.
    fn name(&self) -> &'static str;

    /// Key length in bytes.
    fn key_len(&self) -> usize;

    /// Length of the MAC appended to each packet.
    fn mac_len(&self) -> usize;

    /// Creates a keyed MAC instance.
    fn create(&self, key: &[u8]) -> SkiffResult<Box<dyn PacketMac>>;
}

/// A keyed MAC computed over `uint32 sequence || unencrypted packet`.
pub trait PacketMac: Send {
    /// Length of the produced MAC.
    fn mac_len(&self) -> usize;

    /// Starts a new MAC computation for a packet.
    fn init(&mut self, sequence: u32);

    /// Feeds packet bytes.
    fn update(&mut self, data: &[u8]);

    /// Finishes the computation and returns the (possibly truncated) MAC.
    fn finish(&mut self) -> Vec<u8>;

    /// Computes the MAC of one complete packet.
    fn compute(&mut self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        self.init(sequence);
        self.update(packet);
        self.finish()
    }

    /// Verifies a received MAC in constant time.
    fn verify(&mut self, sequence: u32, packet: &[u8], mac: &[u8]) -> bool {
        let expected = self.compute(sequence, packet);
        expected.len() == mac.len() && bool::from(expected.ct_eq(mac))
    }
}

// ---------------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------------

/// Hash functions used by key exchange methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (legacy KEX methods only)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Starts an incremental hash.
    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut h = self.hasher();
        for p in parts {
            h.update(p);
        }
        h.finalize()
    }
}

/// Incremental hash state.
#[derive(Clone)]
pub enum Hasher {
    /// SHA-1 state
    Sha1(Sha1),
    /// SHA-256 state
    Sha256(Sha256),
    /// SHA-384 state
    Sha384(Sha384),
    /// SHA-512 state
    Sha512(Sha512),
}

impl Hasher {
    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Feeds an SSH `string` (uint32 length + bytes).
    pub fn update_string(&mut self, data: &[u8]) {
        self.update(&(data.len() as u32).to_be_bytes());
        self.update(data);
    }

    /// Feeds an SSH `mpint` built from a positive magnitude.
    pub fn update_mpint(&mut self, magnitude: &[u8]) {
        let encoded = crate::ssh::buffer::encode_mpint(magnitude);
        self.update_string(&encoded);
    }

    /// Finishes the hash.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ciphers
// ---------------------------------------------------------------------------

/// The `none` cipher. Only valid before the first key exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneCipher;

impl CipherProvider for NoneCipher {
    fn name(&self) -> &'static str {
        "none"
    }
    fn key_len(&self) -> usize {
        0
    }
    fn iv_len(&self) -> usize {
        0
    }
    fn block_size(&self) -> usize {
        8
    }
    fn create(
        &self,
        _direction: CipherDirection,
        _key: &[u8],
        _iv: &[u8],
    ) -> SkiffResult<Box<dyn PacketCipher>> {
        Ok(Box::new(NoneCipher))
    }
}

impl PacketCipher for NoneCipher {
    fn block_size(&self) -> usize {
        8
    }
    fn apply(&mut self, _data: &mut [u8]) -> SkiffResult<()> {
        Ok(())
    }
}

fn check_key_material(name: &str, key: &[u8], key_len: usize, iv: &[u8], iv_len: usize) -> SkiffResult<()> {
    if key.len() < key_len || iv.len() < iv_len {
        return Err(SkiffError::Security(format!(
            "Insufficient key material for {}: key {}/{} iv {}/{}",
            name,
            key.len(),
            key_len,
            iv.len(),
            iv_len
        )));
    }
    Ok(())
}

/// AES in counter mode (RFC 4344).
#[derive(Debug, Clone, Copy)]
pub struct AesCtr {
    key_len: usize,
}

impl AesCtr {
    /// aes128-ctr
    pub const AES128: AesCtr = AesCtr { key_len: 16 };
    /// aes192-ctr
    pub const AES192: AesCtr = AesCtr { key_len: 24 };
    /// aes256-ctr
    pub const AES256: AesCtr = AesCtr { key_len: 32 };
}

struct CtrCipher<C> {
    inner: C,
}

impl<C: StreamCipher + Send> PacketCipher for CtrCipher<C> {
    fn block_size(&self) -> usize {
        16
    }
    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        self.inner
            .try_apply_keystream(data)
            .map_err(|_| SkiffError::Security("CTR keystream exhausted".to_string()))
    }
}

impl CipherProvider for AesCtr {
    fn name(&self) -> &'static str {
        match self.key_len {
            16 => "aes128-ctr",
            24 => "aes192-ctr",
            _ => "aes256-ctr",
        }
    }
    fn key_len(&self) -> usize {
        self.key_len
    }
    fn iv_len(&self) -> usize {
        16
    }
    fn block_size(&self) -> usize {
        16
    }
    fn create(
        &self,
        _direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> SkiffResult<Box<dyn PacketCipher>> {
        check_key_material(self.name(), key, self.key_len, iv, 16)?;
        let key = &key[..self.key_len];
        let iv = &iv[..16];
        let invalid = |_| SkiffError::Security(format!("Invalid key for {}", self.name()));
        Ok(match self.key_len {
            16 => Box::new(CtrCipher {
                inner: ctr::Ctr128BE::<aes::Aes128>::new_from_slices(key, iv).map_err(invalid)?,
            }),
            24 => Box::new(CtrCipher {
                inner: ctr::Ctr128BE::<aes::Aes192>::new_from_slices(key, iv).map_err(invalid)?,
            }),
            _ => Box::new(CtrCipher {
                inner: ctr::Ctr128BE::<aes::Aes256>::new_from_slices(key, iv).map_err(invalid)?,
            }),
        })
    }
}

/// AES in cipher block chaining mode (RFC 4253 Section 6.3).
#[derive(Debug, Clone, Copy)]
pub struct AesCbc {
    key_len: usize,
}

impl AesCbc {
    /// aes128-cbc
    pub const AES128: AesCbc = AesCbc { key_len: 16 };
    /// aes256-cbc
    pub const AES256: AesCbc = AesCbc { key_len: 32 };
}

struct CbcEncrypt<C> {
    inner: C,
}

struct CbcDecrypt<C> {
    inner: C,
}

fn check_block_multiple(len: usize) -> SkiffResult<()> {
    if len % 16 != 0 {
        return Err(SkiffError::Protocol(format!(
            "CBC input of {} bytes is not block aligned",
            len
        )));
    }
    Ok(())
}

impl<C: BlockEncryptMut + Send> PacketCipher for CbcEncrypt<C> {
    fn block_size(&self) -> usize {
        16
    }
    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        check_block_multiple(data.len())?;
        for block in data.chunks_exact_mut(16) {
            self.inner
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

impl<C: BlockDecryptMut + Send> PacketCipher for CbcDecrypt<C> {
    fn block_size(&self) -> usize {
        16
    }
    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        check_block_multiple(data.len())?;
        for block in data.chunks_exact_mut(16) {
            self.inner
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

impl CipherProvider for AesCbc {
    fn name(&self) -> &'static str {
        if self.key_len == 16 {
            "aes128-cbc"
        } else {
            "aes256-cbc"
        }
    }
    fn key_len(&self) -> usize {
        self.key_len
    }
    fn iv_len(&self) -> usize {
        16
    }
    fn block_size(&self) -> usize {
        16
    }
    fn create(
        &self,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> SkiffResult<Box<dyn PacketCipher>> {
        check_key_material(self.name(), key, self.key_len, iv, 16)?;
        let key = &key[..self.key_len];
        let iv = &iv[..16];
        let invalid = |_| SkiffError::Security(format!("Invalid key for {}", self.name()));
        Ok(match (self.key_len, direction) {
            (16, CipherDirection::Encrypt) => Box::new(CbcEncrypt {
                inner: cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv).map_err(invalid)?,
            }),
            (16, CipherDirection::Decrypt) => Box::new(CbcDecrypt {
                inner: cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv).map_err(invalid)?,
            }),
            (_, CipherDirection::Encrypt) => Box::new(CbcEncrypt {
                inner: cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv).map_err(invalid)?,
            }),
            (_, CipherDirection::Decrypt) => Box::new(CbcDecrypt {
                inner: cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv).map_err(invalid)?,
            }),
        })
    }
}

/// Nonce for AES-GCM in SSH (RFC 5647 Section 7.1).
///
/// The 12-byte IV is a 4-byte fixed field followed by a 64-bit invocation
/// counter that is incremented after every packet.
struct GcmNonce {
    iv: [u8; 12],
}

impl NonceSequence for GcmNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let nonce = Nonce::assume_unique_for_key(self.iv);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.iv[4..12]);
        let next = u64::from_be_bytes(counter).wrapping_add(1);
        self.iv[4..12].copy_from_slice(&next.to_be_bytes());
        Ok(nonce)
    }
}

/// AES-GCM as specified for SSH by RFC 5647 / OpenSSH.
#[derive(Debug, Clone, Copy)]
pub struct AesGcm {
    key_len: usize,
}

impl AesGcm {
    /// aes128-gcm@openssh.com
    pub const AES128: AesGcm = AesGcm { key_len: 16 };
    /// aes256-gcm@openssh.com
    pub const AES256: AesGcm = AesGcm { key_len: 32 };
}

enum GcmKey {
    Sealing(SealingKey<GcmNonce>),
    Opening(OpeningKey<GcmNonce>),
}

struct GcmCipher {
    key: GcmKey,
}

impl GcmCipher {
    fn length_aad(packet: &[u8]) -> SkiffResult<Aad<[u8; 4]>> {
        if packet.len() < 4 {
            return Err(SkiffError::Protocol("AEAD packet too short".to_string()));
        }
        Ok(Aad::from([packet[0], packet[1], packet[2], packet[3]]))
    }
}

impl PacketCipher for GcmCipher {
    fn block_size(&self) -> usize {
        16
    }

    fn tag_len(&self) -> usize {
        16
    }

    fn apply(&mut self, _data: &mut [u8]) -> SkiffResult<()> {
        Err(SkiffError::Protocol(
            "AES-GCM packets must be sealed, not transformed".to_string(),
        ))
    }

    fn seal(&mut self, packet: &mut Vec<u8>) -> SkiffResult<()> {
        let aad = Self::length_aad(packet)?;
        let GcmKey::Sealing(key) = &mut self.key else {
            return Err(SkiffError::Protocol("seal on a decrypting cipher".to_string()));
        };
        let tag = key
            .seal_in_place_separate_tag(aad, &mut packet[4..])
            .map_err(|_| SkiffError::Security("Encryption failed".to_string()))?;
        packet.extend_from_slice(tag.as_ref());
        Ok(())
    }

    fn open(&mut self, packet: &mut Vec<u8>) -> SkiffResult<()> {
        let aad = Self::length_aad(packet)?;
        let GcmKey::Opening(key) = &mut self.key else {
            return Err(SkiffError::Protocol("open on an encrypting cipher".to_string()));
        };
        let plaintext_len = key
            .open_in_place(aad, &mut packet[4..])
            .map_err(|_| {
                SkiffError::Security("Decryption failed or authentication tag mismatch".to_string())
            })?
            .len();
        packet.truncate(4 + plaintext_len);
        Ok(())
    }
}

impl CipherProvider for AesGcm {
    fn name(&self) -> &'static str {
        if self.key_len == 16 {
            "aes128-gcm@openssh.com"
        } else {
            "aes256-gcm@openssh.com"
        }
    }
    fn key_len(&self) -> usize {
        self.key_len
    }
    fn iv_len(&self) -> usize {
        12
    }
    fn block_size(&self) -> usize {
        16
    }
    fn tag_len(&self) -> usize {
        16
    }
    fn create(
        &self,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> SkiffResult<Box<dyn PacketCipher>> {
        check_key_material(self.name(), key, self.key_len, iv, 12)?;
        let algorithm = if self.key_len == 16 {
            &AES_128_GCM
        } else {
            &AES_256_GCM
        };
        let unbound = UnboundKey::new(algorithm, &key[..self.key_len])
            .map_err(|_| SkiffError::Security(format!("Failed to create {} key", self.name())))?;
        let mut nonce_iv = [0u8; 12];
        nonce_iv.copy_from_slice(&iv[..12]);
        let nonce = GcmNonce { iv: nonce_iv };
        let key = match direction {
            CipherDirection::Encrypt => GcmKey::Sealing(SealingKey::new(unbound, nonce)),
            CipherDirection::Decrypt => GcmKey::Opening(OpeningKey::new(unbound, nonce)),
        };
        Ok(Box::new(GcmCipher { key }))
    }
}

// ---------------------------------------------------------------------------
// MACs
// ---------------------------------------------------------------------------

/// HMAC-based MAC algorithms (RFC 4253 Section 6.4, RFC 6668).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
    /// hmac-sha1
    Sha1,
    /// hmac-sha1-96
    Sha1_96,
    /// hmac-sha2-256
    Sha256,
    /// hmac-sha2-512
    Sha512,
}

enum HmacState {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

struct HmacInstance {
    algorithm: HmacAlgorithm,
    key: Zeroizing<Vec<u8>>,
    state: Option<HmacState>,
}

impl HmacInstance {
    fn new_state(&self) -> HmacState {
        // HMAC accepts keys of any length, so these constructors cannot fail
        match self.algorithm {
            HmacAlgorithm::Sha1 | HmacAlgorithm::Sha1_96 => HmacState::Sha1(
                <Hmac<Sha1> as Mac>::new_from_slice(&self.key)
                    .unwrap_or_else(|_| unreachable_hmac()),
            ),
            HmacAlgorithm::Sha256 => HmacState::Sha256(
                <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
                    .unwrap_or_else(|_| unreachable_hmac()),
            ),
            HmacAlgorithm::Sha512 => HmacState::Sha512(
                <Hmac<Sha512> as Mac>::new_from_slice(&self.key)
                    .unwrap_or_else(|_| unreachable_hmac()),
            ),
        }
    }
}

#[cold]
fn unreachable_hmac() -> ! {
    unreachable!("HMAC accepts keys of any length")
}

impl PacketMac for HmacInstance {
    fn mac_len(&self) -> usize {
        self.algorithm.mac_len()
    }

    fn init(&mut self, sequence: u32) {
        let mut state = self.new_state();
        match &mut state {
            HmacState::Sha1(m) => m.update(&sequence.to_be_bytes()),
            HmacState::Sha256(m) => m.update(&sequence.to_be_bytes()),
            HmacState::Sha512(m) => m.update(&sequence.to_be_bytes()),
        }
        self.state = Some(state);
    }

    fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            Some(HmacState::Sha1(m)) => m.update(data),
            Some(HmacState::Sha256(m)) => m.update(data),
            Some(HmacState::Sha512(m)) => m.update(data),
            None => {}
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut out = match self.state.take() {
            Some(HmacState::Sha1(m)) => m.finalize().into_bytes().to_vec(),
            Some(HmacState::Sha256(m)) => m.finalize().into_bytes().to_vec(),
            Some(HmacState::Sha512(m)) => m.finalize().into_bytes().to_vec(),
            None => Vec::new(),
        };
        out.truncate(self.algorithm.mac_len());
        out
    }
}

impl HmacAlgorithm {
    fn mac_len(&self) -> usize {
        match self {
            HmacAlgorithm::Sha1 => 20,
            HmacAlgorithm::Sha1_96 => 12,
            HmacAlgorithm::Sha256 => 32,
            HmacAlgorithm::Sha512 => 64,
        }
    }
}

impl MacProvider for HmacAlgorithm {
    fn name(&self) -> &'static str {
        match self {
            HmacAlgorithm::Sha1 => "hmac-sha1",
            HmacAlgorithm::Sha1_96 => "hmac-sha1-96",
            HmacAlgorithm::Sha256 => "hmac-sha2-256",
            HmacAlgorithm::Sha512 => "hmac-sha2-512",
        }
    }

    fn key_len(&self) -> usize {
        match self {
            HmacAlgorithm::Sha1 | HmacAlgorithm::Sha1_96 => 20,
            HmacAlgorithm::Sha256 => 32,
            HmacAlgorithm::Sha512 => 64,
        }
    }

    fn mac_len(&self) -> usize {
        HmacAlgorithm::mac_len(self)
    }

    fn create(&self, key: &[u8]) -> SkiffResult<Box<dyn PacketMac>> {
        let key_len = MacProvider::key_len(self);
        if key.len() < key_len {
            return Err(SkiffError::Security(format!(
                "Insufficient key material for {}: expected {}, got {}",
                self.name(),
                key_len,
                key.len()
            )));
        }
        Ok(Box::new(HmacInstance {
            algorithm: *self,
            key: Zeroizing::new(key[..key_len].to_vec()),
            state: None,
        }))
    }
}

/// The `none` MAC, used before the first key exchange and with AEAD ciphers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneMac;

impl MacProvider for NoneMac {
    fn name(&self) -> &'static str {
        "none"
    }
    fn key_len(&self) -> usize {
        0
    }
    fn mac_len(&self) -> usize {
        0
    }
    fn create(&self, _key: &[u8]) -> SkiffResult<Box<dyn PacketMac>> {
        Ok(Box::new(NoneMac))
    }
}

impl PacketMac for NoneMac {
    fn mac_len(&self) -> usize {
        0
    }
    fn init(&mut self, _sequence: u32) {}
    fn update(&mut self, _data: &[u8]) {}
    fn finish(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_lengths() {
        for (alg, len) in [
            (HashAlgorithm::Sha1, 20),
            (HashAlgorithm::Sha256, 32),
            (HashAlgorithm::Sha384, 48),
            (HashAlgorithm::Sha512, 64),
        ] {
            assert_eq!(alg.output_len(), len);
            assert_eq!(alg.digest(&[b"abc"]).len(), len);
        }
    }

    #[test]
    fn test_sha256_known_answer() {
        let digest = HashAlgorithm::Sha256.digest(&[b"a", b"bc"]);
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hasher_mpint_and_string() {
        let mut h = HashAlgorithm::Sha256.hasher();
        h.update_string(b"x");
        h.update_mpint(&[0x80]);
        let manual = HashAlgorithm::Sha256.digest(&[&[0, 0, 0, 1, b'x', 0, 0, 0, 2, 0, 0x80]]);
        assert_eq!(h.finalize(), manual);
    }

    fn round_trip(provider: &dyn CipherProvider) {
        let key = vec![0x11u8; provider.key_len()];
        let iv = vec![0x22u8; provider.iv_len()];
        let mut enc = provider.create(CipherDirection::Encrypt, &key, &iv).unwrap();
        let mut dec = provider.create(CipherDirection::Decrypt, &key, &iv).unwrap();

        for round in 0..3u8 {
            let original: Vec<u8> = (0..64u8).map(|b| b.wrapping_add(round)).collect();
            let mut data = original.clone();
            enc.apply(&mut data).unwrap();
            assert_ne!(data, original);
            dec.apply(&mut data).unwrap();
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_ctr_round_trip() {
        round_trip(&AesCtr::AES128);
        round_trip(&AesCtr::AES192);
        round_trip(&AesCtr::AES256);
    }

    #[test]
    fn test_cbc_round_trip() {
        round_trip(&AesCbc::AES128);
        round_trip(&AesCbc::AES256);
    }

    #[test]
    fn test_cbc_rejects_unaligned() {
        let mut enc = AesCbc::AES128
            .create(CipherDirection::Encrypt, &[0u8; 16], &[0u8; 16])
            .unwrap();
        let mut data = vec![0u8; 15];
        assert!(enc.apply(&mut data).is_err());
    }

    #[test]
    fn test_gcm_seal_open() {
        let key = [7u8; 32];
        let iv = [9u8; 12];
        let mut enc = AesGcm::AES256
            .create(CipherDirection::Encrypt, &key, &iv)
            .unwrap();
        let mut dec = AesGcm::AES256
            .create(CipherDirection::Decrypt, &key, &iv)
            .unwrap();
        assert!(enc.is_aead());

        for _ in 0..2 {
            let mut packet = vec![0, 0, 0, 16];
            packet.extend_from_slice(&[0xAA; 16]);
            let original = packet.clone();

            enc.seal(&mut packet).unwrap();
            assert_eq!(packet.len(), 4 + 16 + 16);
            assert_eq!(&packet[..4], &original[..4]);

            dec.open(&mut packet).unwrap();
            assert_eq!(packet, original);
        }
    }

    #[test]
    fn test_gcm_detects_tampered_length() {
        let key = [1u8; 16];
        let iv = [2u8; 12];
        let mut enc = AesGcm::AES128
            .create(CipherDirection::Encrypt, &key, &iv)
            .unwrap();
        let mut dec = AesGcm::AES128
            .create(CipherDirection::Decrypt, &key, &iv)
            .unwrap();

        let mut packet = vec![0, 0, 0, 16];
        packet.extend_from_slice(&[0x55; 16]);
        enc.seal(&mut packet).unwrap();
        packet[3] = 32;
        assert!(matches!(dec.open(&mut packet), Err(SkiffError::Security(_))));
    }

    #[test]
    fn test_gcm_nonce_counter_increments() {
        let mut n = GcmNonce {
            iv: [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0xff],
        };
        n.advance().unwrap();
        assert_eq!(n.iv, [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        // RFC 4231 test case 2, fed through the packet MAC interface:
        // the sequence number bytes are part of the message.
        let mut mac = HmacAlgorithm::Sha256.create(&[0u8; 32]).unwrap();
        let tag = mac.compute(0, b"");
        assert_eq!(tag.len(), 32);

        let mut m2 = HmacAlgorithm::Sha256.create(&[0u8; 32]).unwrap();
        m2.init(0);
        m2.update(b"");
        assert_eq!(m2.finish(), tag);
    }

    #[test]
    fn test_hmac_verify() {
        let key = [0x42u8; 64];
        for alg in [
            HmacAlgorithm::Sha1,
            HmacAlgorithm::Sha1_96,
            HmacAlgorithm::Sha256,
            HmacAlgorithm::Sha512,
        ] {
            let mut mac = alg.create(&key).unwrap();
            let tag = mac.compute(7, b"packet");
            assert_eq!(tag.len(), MacProvider::mac_len(&alg));
            assert!(mac.verify(7, b"packet", &tag));
            assert!(!mac.verify(8, b"packet", &tag));
            assert!(!mac.verify(7, b"packeT", &tag));
        }
    }

    #[test]
    fn test_hmac_short_key_rejected() {
        assert!(HmacAlgorithm::Sha256.create(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_none_mac() {
        let mut mac = NoneMac.create(&[]).unwrap();
        assert!(mac.compute(1, b"x").is_empty());
        assert!(mac.verify(1, b"x", &[]));
    }
}
