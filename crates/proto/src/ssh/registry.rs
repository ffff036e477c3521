//! Name-keyed registry of cipher, MAC and compression providers.
//!
//! Negotiation produces algorithm names; the transport resolves them here.
//! Applications can register additional providers before connecting.

use crate::ssh::compression::{CompressionProvider, NoCompression, Zlib};
use crate::ssh::crypto::{
    AesCbc, AesCtr, AesGcm, CipherProvider, HmacAlgorithm, MacProvider, NoneCipher, NoneMac,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Provider lookup table keyed by negotiated algorithm name.
#[derive(Clone)]
pub struct AlgorithmRegistry {
    ciphers: HashMap<&'static str, Arc<dyn CipherProvider>>,
    macs: HashMap<&'static str, Arc<dyn MacProvider>>,
    compression: HashMap<&'static str, Arc<dyn CompressionProvider>>,
}

impl AlgorithmRegistry {
    /// Creates a registry with no providers at all.
    pub fn empty() -> Self {
        Self {
            ciphers: HashMap::new(),
            macs: HashMap::new(),
            compression: HashMap::new(),
        }
    }

    /// Creates a registry holding every built-in provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register_cipher(Arc::new(NoneCipher));
        registry.register_cipher(Arc::new(AesCtr::AES128));
        registry.register_cipher(Arc::new(AesCtr::AES192));
        registry.register_cipher(Arc::new(AesCtr::AES256));
        registry.register_cipher(Arc::new(AesCbc::AES128));
        registry.register_cipher(Arc::new(AesCbc::AES256));
        registry.register_cipher(Arc::new(AesGcm::AES128));
        registry.register_cipher(Arc::new(AesGcm::AES256));

        registry.register_mac(Arc::new(NoneMac));
        registry.register_mac(Arc::new(HmacAlgorithm::Sha1));
        registry.register_mac(Arc::new(HmacAlgorithm::Sha1_96));
        registry.register_mac(Arc::new(HmacAlgorithm::Sha256));
        registry.register_mac(Arc::new(HmacAlgorithm::Sha512));

        registry.register_compression(Arc::new(NoCompression));
        registry.register_compression(Arc::new(Zlib::IMMEDIATE));
        registry.register_compression(Arc::new(Zlib::DELAYED));

        registry
    }

    /// Registers a cipher, replacing any provider with the same name.
    pub fn register_cipher(&mut self, provider: Arc<dyn CipherProvider>) {
        self.ciphers.insert(provider.name(), provider);
    }

    /// Registers a MAC, replacing any provider with the same name.
    pub fn register_mac(&mut self, provider: Arc<dyn MacProvider>) {
        self.macs.insert(provider.name(), provider);
    }

    /// Registers a compression method, replacing any provider with the same name.
    pub fn register_compression(&mut self, provider: Arc<dyn CompressionProvider>) {
        self.compression.insert(provider.name(), provider);
    }

    /// Looks up a cipher.
    pub fn cipher(&self, name: &str) -> Option<Arc<dyn CipherProvider>> {
        self.ciphers.get(name).cloned()
    }

    /// Looks up a MAC.
    pub fn mac(&self, name: &str) -> Option<Arc<dyn MacProvider>> {
        self.macs.get(name).cloned()
    }

    /// Looks up a compression method.
    pub fn compression(&self, name: &str) -> Option<Arc<dyn CompressionProvider>> {
        self.compression.get(name).cloned()
    }

    /// Drops names from `preferred` that have no registered cipher.
    pub fn supported_ciphers(&self, preferred: &[String]) -> Vec<String> {
        preferred
            .iter()
            .filter(|n| self.ciphers.contains_key(n.as_str()))
            .cloned()
            .collect()
    }

    /// Drops names from `preferred` that have no registered MAC.
    pub fn supported_macs(&self, preferred: &[String]) -> Vec<String> {
        preferred
            .iter()
            .filter(|n| self.macs.contains_key(n.as_str()))
            .cloned()
            .collect()
    }

    /// Drops names from `preferred` that have no registered compression method.
    pub fn supported_compression(&self, preferred: &[String]) -> Vec<String> {
        preferred
            .iter()
            .filter(|n| self.compression.contains_key(n.as_str()))
            .cloned()
            .collect()
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ciphers: Vec<_> = self.ciphers.keys().collect();
        let mut macs: Vec<_> = self.macs.keys().collect();
        let mut compression: Vec<_> = self.compression.keys().collect();
        ciphers.sort();
        macs.sort();
        compression.sort();
        f.debug_struct("AlgorithmRegistry")
            .field("ciphers", &ciphers)
            .field("macs", &macs)
            .field("compression", &compression)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let r = AlgorithmRegistry::with_defaults();
        for name in [
            "none",
            "aes128-ctr",
            "aes192-ctr",
            "aes256-ctr",
            "aes128-cbc",
            "aes256-cbc",
            "aes128-gcm@openssh.com",
            "aes256-gcm@openssh.com",
        ] {
            assert_eq!(r.cipher(name).map(|c| c.name()), Some(name));
        }
        for name in ["none", "hmac-sha1", "hmac-sha1-96", "hmac-sha2-256", "hmac-sha2-512"] {
            assert_eq!(r.mac(name).map(|m| m.name()), Some(name));
        }
        for name in ["none", "zlib", "zlib@openssh.com"] {
            assert_eq!(r.compression(name).map(|c| c.name()), Some(name));
        }
        assert!(r.cipher("3des-cbc").is_none());
    }

    #[test]
    fn test_supported_filters_and_keeps_order() {
        let r = AlgorithmRegistry::with_defaults();
        let wanted = vec![
            "chacha20-poly1305@openssh.com".to_string(),
            "aes256-ctr".to_string(),
            "aes128-ctr".to_string(),
        ];
        assert_eq!(r.supported_ciphers(&wanted), vec!["aes256-ctr", "aes128-ctr"]);
    }

    #[test]
    fn test_register_custom() {
        let mut r = AlgorithmRegistry::empty();
        assert!(r.mac("hmac-sha2-256").is_none());
        r.register_mac(Arc::new(HmacAlgorithm::Sha256));
        assert!(r.mac("hmac-sha2-256").is_some());
    }
}
