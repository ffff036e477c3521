//! SSH key exchange messages and algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - The client's algorithm preferences
//! - First-match, client-priority negotiation over the ten categories
//!
//! The key exchange methods themselves live in
//! [`kex_dh`](crate::ssh::kex_dh).
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. Key exchange (DH, group exchange or ECDH)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys at its own NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex::{negotiate_algorithm, KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let client = vec!["a".to_string(), "b".to_string(), "c".to_string()];
//! let server = vec!["c".to_string(), "b".to_string()];
//! assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "b");
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::buffer::WireBuffer;
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::kex_dh::KexMethod;
use crate::ssh::message::MessageType;
use crate::ssh::registry::AlgorithmRegistry;
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};
use std::fmt;

/// The ten KEXINIT name-list categories, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// kex_algorithms
    Kex,
    /// server_host_key_algorithms
    HostKey,
    /// encryption_algorithms_client_to_server
    CipherClientToServer,
    /// encryption_algorithms_server_to_client
    CipherServerToClient,
    /// mac_algorithms_client_to_server
    MacClientToServer,
    /// mac_algorithms_server_to_client
    MacServerToClient,
    /// compression_algorithms_client_to_server
    CompressionClientToServer,
    /// compression_algorithms_server_to_client
    CompressionServerToClient,
    /// languages_client_to_server
    LanguageClientToServer,
    /// languages_server_to_client
    LanguageServerToClient,
}

impl Category {
    /// All categories in wire order.
    pub const ALL: [Category; 10] = [
        Category::Kex,
        Category::HostKey,
        Category::CipherClientToServer,
        Category::CipherServerToClient,
        Category::MacClientToServer,
        Category::MacServerToClient,
        Category::CompressionClientToServer,
        Category::CompressionServerToClient,
        Category::LanguageClientToServer,
        Category::LanguageServerToClient,
    ];

    /// Human-readable category name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Category::Kex => "kex",
            Category::HostKey => "host key",
            Category::CipherClientToServer => "cipher client->server",
            Category::CipherServerToClient => "cipher server->client",
            Category::MacClientToServer => "mac client->server",
            Category::MacServerToClient => "mac server->client",
            Category::CompressionClientToServer => "compression client->server",
            Category::CompressionServerToClient => "compression server->client",
            Category::LanguageClientToServer => "language client->server",
            Category::LanguageServerToClient => "language server->client",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    fn is_language(&self) -> bool {
        matches!(
            self,
            Category::LanguageClientToServer | Category::LanguageServerToClient
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered algorithm preferences for a connection.
///
/// Ciphers, MACs and compression apply to both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Server host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers
    pub ciphers: Vec<String>,
    /// MACs
    pub macs: Vec<String>,
    /// Compression methods
    pub compression: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "ecdh-sha2-nistp256",
                "ecdh-sha2-nistp384",
                "diffie-hellman-group-exchange-sha256",
                "diffie-hellman-group16-sha512",
                "diffie-hellman-group14-sha256",
                "diffie-hellman-group14-sha1",
            ]),
            host_key: names(&[
                "ssh-ed25519",
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "ecdsa-sha2-nistp521",
                "rsa-sha2-512",
                "rsa-sha2-256",
                "ssh-rsa",
            ]),
            ciphers: names(&[
                "aes128-ctr",
                "aes192-ctr",
                "aes256-ctr",
                "aes128-gcm@openssh.com",
                "aes256-gcm@openssh.com",
            ]),
            macs: names(&["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1"]),
            compression: names(&["none"]),
        }
    }
}

impl AlgorithmPreferences {
    /// Prefers `zlib@openssh.com` and `zlib` over `none`.
    pub fn with_compression(mut self) -> Self {
        self.compression = names(&["zlib@openssh.com", "zlib", "none"]);
        self
    }

    /// Drops every name that neither the registry nor the built-in KEX and
    /// host key implementations can serve.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] if a category ends up empty.
    pub fn supported(&self, registry: &AlgorithmRegistry) -> SkiffResult<Self> {
        let filtered = Self {
            kex: self
                .kex
                .iter()
                .filter(|n| KexMethod::from_name(n).is_some())
                .cloned()
                .collect(),
            host_key: self
                .host_key
                .iter()
                .filter(|n| HostKeyAlgorithm::from_name(n).is_some())
                .cloned()
                .collect(),
            ciphers: registry.supported_ciphers(&self.ciphers),
            macs: registry.supported_macs(&self.macs),
            compression: registry.supported_compression(&self.compression),
        };

        for (name, list) in [
            ("kex", &filtered.kex),
            ("host key", &filtered.host_key),
            ("cipher", &filtered.ciphers),
            ("mac", &filtered.macs),
            ("compression", &filtered.compression),
        ] {
            if list.is_empty() {
                return Err(SkiffError::Config(format!(
                    "No supported {} algorithm configured",
                    name
                )));
            }
        }

        Ok(filtered)
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Name-lists in wire order, indexed by [`Category`]
    lists: [Vec<String>; 10],
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie from `prefs`.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            lists: [
                prefs.kex.clone(),
                prefs.host_key.clone(),
                prefs.ciphers.clone(),
                prefs.ciphers.clone(),
                prefs.macs.clone(),
                prefs.macs.clone(),
                prefs.compression.clone(),
                prefs.compression.clone(),
                Vec::new(),
                Vec::new(),
            ],
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT from the default preferences.
    pub fn new_default() -> Self {
        Self::from_preferences(&AlgorithmPreferences::default())
    }

    /// Replaces one name-list.
    pub fn set_list(&mut self, category: Category, names: Vec<String>) {
        self.lists[category.index()] = names;
    }

    /// Sets the first_kex_packet_follows flag.
    pub fn set_first_kex_packet_follows(&mut self, follows: bool) {
        self.first_kex_packet_follows = follows;
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns one name-list.
    pub fn list(&self, category: Category) -> &[String] {
        &self.lists[category.index()]
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        self.list(Category::Kex)
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        self.list(Category::HostKey)
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        self.list(Category::CipherClientToServer)
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        self.list(Category::CipherServerToClient)
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::with_capacity(512);
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_raw(&self.cookie);
        for list in &self.lists {
            buf.put_name_list(list);
        }
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.into_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - Message type is not SSH_MSG_KEXINIT (20)
    /// - Message is truncated
    /// - A name-list is not valid UTF-8
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = WireBuffer::from_slice(data);

        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&buf.get_raw(16)?);

        let mut lists: [Vec<String>; 10] = Default::default();
        for list in lists.iter_mut() {
            *list = buf.get_name_list()?;
        }

        let first_kex_packet_follows = buf.get_bool()?;
        // reserved
        buf.get_u32()?;

        Ok(Self {
            cookie,
            lists,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// Sent by each side once the key exchange is complete. Outgoing packets
/// switch to the new keys right after our NEWKEYS is sent; incoming packets
/// switch right after the peer's NEWKEYS is received. Sequence numbers are
/// not reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - Message is empty
    /// - Message type is not SSH_MSG_NEWKEYS (21)
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() {
            return Err(SkiffError::Protocol("NEWKEYS message is empty".to_string()));
        }

        if data[0] != MessageType::NewKeys as u8 {
            return Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                data[0]
            )));
        }

        Ok(Self)
    }
}

impl Default for NewKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Negotiates algorithms between client and server.
///
/// Uses the first algorithm in the client's list that also appears in the
/// server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`SkiffError::Protocol`] if no common algorithm found.
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// let result = negotiate_algorithm(&client, &server).unwrap();
/// assert_eq!(result, "aes256-ctr");
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> SkiffResult<String> {
    for client_alg in client_list {
        if server_list.contains(client_alg) {
            return Ok(client_alg.clone());
        }
    }

    Err(SkiffError::Protocol(format!(
        "No common algorithm: client={:?}, server={:?}",
        client_list, server_list
    )))
}

/// The outcome of negotiation, one name per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server (`none` under an AEAD cipher)
    pub mac_client_to_server: String,
    /// MAC server to client (`none` under an AEAD cipher)
    pub mac_server_to_client: String,
    /// Compression client to server
    pub compression_client_to_server: String,
    /// Compression server to client
    pub compression_server_to_client: String,
    /// Language client to server (may be empty)
    pub language_client_to_server: String,
    /// Language server to client (may be empty)
    pub language_server_to_client: String,
}

impl NegotiatedAlgorithms {
    /// Returns the name chosen for `category`.
    pub fn get(&self, category: Category) -> &str {
        match category {
            Category::Kex => &self.kex,
            Category::HostKey => &self.host_key,
            Category::CipherClientToServer => &self.cipher_client_to_server,
            Category::CipherServerToClient => &self.cipher_server_to_client,
            Category::MacClientToServer => &self.mac_client_to_server,
            Category::MacServerToClient => &self.mac_server_to_client,
            Category::CompressionClientToServer => &self.compression_client_to_server,
            Category::CompressionServerToClient => &self.compression_server_to_client,
            Category::LanguageClientToServer => &self.language_client_to_server,
            Category::LanguageServerToClient => &self.language_server_to_client,
        }
    }

    fn slot(&mut self, category: Category) -> &mut String {
        match category {
            Category::Kex => &mut self.kex,
            Category::HostKey => &mut self.host_key,
            Category::CipherClientToServer => &mut self.cipher_client_to_server,
            Category::CipherServerToClient => &mut self.cipher_server_to_client,
            Category::MacClientToServer => &mut self.mac_client_to_server,
            Category::MacServerToClient => &mut self.mac_server_to_client,
            Category::CompressionClientToServer => &mut self.compression_client_to_server,
            Category::CompressionServerToClient => &mut self.compression_server_to_client,
            Category::LanguageClientToServer => &mut self.language_client_to_server,
            Category::LanguageServerToClient => &mut self.language_server_to_client,
        }
    }
}

/// Negotiates all ten categories. Every cipher is treated as non-AEAD.
///
/// # Errors
///
/// Fails as a whole if any category has no common algorithm. Language
/// lists may be empty on either side, which negotiates to `""`.
pub fn negotiate(client: &KexInit, server: &KexInit) -> SkiffResult<NegotiatedAlgorithms> {
    negotiate_with(client, server, |_| false)
}

/// Negotiates all ten categories.
///
/// When the chosen cipher in a direction satisfies `is_aead`, the MAC for
/// that direction is not required to match and falls back to `none`.
pub fn negotiate_with<F>(
    client: &KexInit,
    server: &KexInit,
    is_aead: F,
) -> SkiffResult<NegotiatedAlgorithms>
where
    F: Fn(&str) -> bool,
{
    let mut result = NegotiatedAlgorithms::default();

    for category in Category::ALL {
        let client_list = client.list(category);
        let server_list = server.list(category);

        let chosen = match negotiate_algorithm(client_list, server_list) {
            Ok(name) => name,
            Err(_) if category.is_language() && (client_list.is_empty() || server_list.is_empty()) => {
                String::new()
            }
            Err(_) if mac_is_optional(category, &result, &is_aead) => "none".to_string(),
            Err(_) => {
                return Err(SkiffError::Protocol(format!(
                    "No common algorithm for {}: client={:?}, server={:?}",
                    category, client_list, server_list
                )))
            }
        };
        *result.slot(category) = chosen;
    }

    Ok(result)
}

fn mac_is_optional<F: Fn(&str) -> bool>(
    category: Category,
    so_far: &NegotiatedAlgorithms,
    is_aead: &F,
) -> bool {
    match category {
        Category::MacClientToServer => is_aead(&so_far.cipher_client_to_server),
        Category::MacServerToClient => is_aead(&so_far.cipher_server_to_client),
        _ => false,
    }
}

/// Returns true if the peer's guessed first KEX packet can be used.
///
/// A guess is right only when both sides list the same first KEX method and
/// the same first host key algorithm (RFC 4253 Section 7).
pub fn guess_was_correct(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms().first() == server.kex_algorithms().first()
        && client.server_host_key_algorithms().first()
            == server.server_host_key_algorithms().first()
}
