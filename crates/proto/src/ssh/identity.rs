//! Client identities for public-key and host-based authentication.
//!
//! An [`Identity`] exposes a public key blob and can sign on demand. Keys
//! that are stored encrypted are represented by [`LockedIdentity`], which
//! advertises its public half up front and asks for the passphrase only
//! when the server accepts the key.

use crate::ssh::hostkey::{HostKey, HostKeyAlgorithm};
use skiff_platform::{SkiffError, SkiffResult};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use zeroize::Zeroizing;

/// A key pair usable for authentication signatures.
pub trait Identity: Send + Sync {
    /// Display name, usually the key file name or comment.
    fn name(&self) -> &str;

    /// Signature algorithm advertised in the request.
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Public key blob.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Returns true while the private half still needs a passphrase.
    fn is_encrypted(&self) -> bool {
        false
    }

    /// Decrypts the private half.
    fn unlock(&self, _passphrase: &str) -> SkiffResult<()> {
        Ok(())
    }

    /// Signs `data`, returning an SSH signature blob.
    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// An identity backed by a key already in memory.
pub struct KeyPairIdentity {
    name: String,
    key: Box<dyn HostKey>,
}

impl KeyPairIdentity {
    /// Wraps `key` under `name`.
    pub fn new(name: impl Into<String>, key: Box<dyn HostKey>) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}

impl Identity for KeyPairIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn algorithm(&self) -> HostKeyAlgorithm {
        self.key.algorithm()
    }

    fn public_key_blob(&self) -> Vec<u8> {
        self.key.public_key_bytes()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        self.key.sign(data)
    }
}

impl fmt::Debug for KeyPairIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairIdentity")
            .field("name", &self.name)
            .field("algorithm", &self.key.algorithm_name())
            .finish_non_exhaustive()
    }
}

/// Turns a passphrase into the private key, or fails.
pub type KeyDecryptor = dyn Fn(&str) -> SkiffResult<Box<dyn HostKey>> + Send + Sync;

/// A passphrase-protected identity.
///
/// The decryptor is supplied by the application (for example an OpenSSH
/// key file loader) and runs at most once successfully.
pub struct LockedIdentity {
    name: String,
    algorithm: HostKeyAlgorithm,
    public_blob: Vec<u8>,
    decrypt: Box<KeyDecryptor>,
    unlocked: Mutex<Option<Box<dyn HostKey>>>,
}

impl LockedIdentity {
    /// Creates a locked identity from its public half and a decryptor.
    pub fn new(
        name: impl Into<String>,
        algorithm: HostKeyAlgorithm,
        public_blob: Vec<u8>,
        decrypt: Box<KeyDecryptor>,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm,
            public_blob,
            decrypt,
            unlocked: Mutex::new(None),
        }
    }
}

impl Identity for LockedIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn algorithm(&self) -> HostKeyAlgorithm {
        self.algorithm
    }

    fn public_key_blob(&self) -> Vec<u8> {
        self.public_blob.clone()
    }

    fn is_encrypted(&self) -> bool {
        self.unlocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn unlock(&self, passphrase: &str) -> SkiffResult<()> {
        let passphrase = Zeroizing::new(passphrase.to_string());
        let key = (self.decrypt)(passphrase.as_str())?;
        if key.public_key_bytes() != self.public_blob {
            return Err(SkiffError::Security(format!(
                "Decrypted key does not match public key of {}",
                self.name
            )));
        }
        *self.unlocked.lock().unwrap_or_else(PoisonError::into_inner) = Some(key);
        Ok(())
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        match self
            .unlocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(key) => key.sign(data),
            None => Err(SkiffError::Security(format!(
                "Identity {} is still locked",
                self.name
            ))),
        }
    }
}

impl fmt::Debug for LockedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedIdentity")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm.name())
            .field("encrypted", &self.is_encrypted())
            .finish_non_exhaustive()
    }
}

/// Ordered, shareable collection of identities.
#[derive(Clone, Default)]
pub struct IdentityRepository {
    identities: Arc<RwLock<Vec<Arc<dyn Identity>>>>,
}

impl IdentityRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an identity. Identities are tried in insertion order.
    pub fn add(&self, identity: Arc<dyn Identity>) {
        self.identities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(identity);
    }

    /// Removes every identity with this public key blob.
    pub fn remove(&self, public_blob: &[u8]) -> bool {
        let mut identities = self
            .identities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = identities.len();
        identities.retain(|i| i.public_key_blob() != public_blob);
        before != identities.len()
    }

    /// Snapshot of the identities in order.
    pub fn identities(&self) -> Vec<Arc<dyn Identity>> {
        self.identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Finds the identity owning `public_blob`.
    pub fn find(&self, public_blob: &[u8]) -> Option<Arc<dyn Identity>> {
        self.identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|i| i.public_key_blob() == public_blob)
            .cloned()
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no identity is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for IdentityRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .identities()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        f.debug_struct("IdentityRepository")
            .field("identities", &names)
            .finish()
    }
}
