//! SSH2 client protocol engine.
//!
//! This module implements the client side of the SSH protocol according to
//! RFC 4251-4254, with keyboard-interactive (RFC 4256), group exchange
//! (RFC 4419) and ECDH (RFC 5656) key exchange.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire** ([`buffer`], [`message`], [`version`]) - data types, message
//!    numbers and the identification exchange
//! 2. **Packet Layer** ([`packet`]) - binary packet protocol with pluggable
//!    [`crypto`] and [`compression`] providers found through [`registry`]
//! 3. **Key Exchange** ([`kex`], [`kex_dh`], [`hostkey`], [`known_hosts`])
//! 4. **Session Engine** ([`session`], [`transport`], [`config`]) - reader
//!    task, write lock, rekeying and keepalive
//! 5. **Authentication** ([`auth`], [`identity`]) - RFC 4252 negotiation
//! 6. **Connection Layer** ([`connection`], [`channel`]) - channels and
//!    global requests
//! 7. **Client** ([`client`]) - convenience facade
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths, name-lists and counts are bounded
//!   before allocation
//! - **Constant-Time Operations**: MAC verification uses `subtle`
//! - **Memory Safety**: keys, passwords and derived secrets are zeroized
//! - **Host Keys**: the exchange hash signature is verified before any
//!   derived key is used, and the key is checked against a
//!   [`known_hosts::HostKeyRepository`]
//! - **No Unsafe Code**
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod compression;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod identity;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod registry;
pub mod session;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{AuthMethod, NoInteraction, UserInteraction};
pub use channel::{Channel, ChannelEvent, ChannelInit, ChannelKind, ChannelState, SessionRequest};
pub use client::{ExecOutput, SshClient};
pub use config::{AuthConfig, ForwardingPolicy, HostbasedConfig, SshClientConfig};
pub use connection::{ChannelRequestType, ChannelType, GlobalReply, GlobalRequest};
pub use hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm, PublicKey};
pub use identity::{Identity, IdentityRepository, KeyPairIdentity, LockedIdentity};
pub use kex::{AlgorithmPreferences, NegotiatedAlgorithms};
pub use known_hosts::{HostKeyPrompt, HostKeyRepository, HostKeyStatus, KnownHosts, TrustPolicy};
pub use message::MessageType;
pub use registry::AlgorithmRegistry;
pub use session::Session;
pub use transport::{SessionState, TransportConfig};
pub use version::Version;
