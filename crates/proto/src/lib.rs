//! SSH2 client protocol engine.
//!
//! `skiff-proto` speaks the client side of SSH: version exchange, key
//! exchange and rekeying, user authentication, and multiplexed channels
//! over any `AsyncRead + AsyncWrite` stream.
//!
//! # Features
//!
//! - `ssh` (default) - the SSH client
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::{SshClient, SshClientConfig, TrustPolicy};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SshClientConfig::default();
//! config.trust_policy = TrustPolicy::AcceptNew;
//!
//! let client = SshClient::connect("server.example.com:22", config).await?;
//! client.authenticate_password("deploy", "secret").await?;
//! let output = client.execute("uptime").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted crates (`ring`, RustCrypto, `dalek`)
//! - Constant-time MAC comparison
//! - Secret material is zeroized with `zeroize`
//! - Packet parsing is fuzzed (see `fuzz/`)
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
