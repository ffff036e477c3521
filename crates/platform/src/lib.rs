//! # skiff platform
//!
//! Shared types for the skiff SSH stack.
//!
//! This crate provides the unified error type (`SkiffError`) and the
//! `SkiffResult` alias used by every other skiff crate.
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{SkiffError, SkiffResult};
//!
//! fn parse_port(s: &str) -> SkiffResult<u16> {
//!     s.parse()
//!         .map_err(|_| SkiffError::Config(format!("bad port: {}", s)))
//! }
//!
//! # fn main() -> SkiffResult<()> {
//! assert_eq!(parse_port("22")?, 22);
//! assert!(parse_port("x").is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{SkiffError, SkiffResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
