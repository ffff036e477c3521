//! Error types for skiff

use std::fmt;

/// Unified error type for all skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed message, negotiation failure, unexpected state)
    Protocol(String),

    /// Security error (signature or key material failure)
    Security(String),

    /// A packet failed length or MAC validation and the stream was discarded
    PacketCorrupt(String),

    /// The peer sent SSH_MSG_DISCONNECT, or the session was closed locally
    Disconnected {
        /// Disconnect reason code (RFC 4253 Section 11.1)
        reason: u32,
        /// Human readable description
        description: String,
    },

    /// The host key was rejected by the trust policy
    HostKeyRejected(String),

    /// Every configured authentication method was exhausted
    AuthFailed {
        /// Methods the server still advertised when authentication gave up
        methods: Vec<String>,
    },

    /// The user cancelled authentication
    AuthCancelled,

    /// The server refused to open a channel
    ChannelOpenFailed {
        /// Failure reason code (RFC 4254 Section 5.1)
        reason: u32,
        /// Human readable description
        description: String,
    },

    /// An operation timed out
    Timeout(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl SkiffError {
    /// Returns true if the error terminates the whole connection.
    ///
    /// Channel open failures and authentication outcomes leave the
    /// transport usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SkiffError::ChannelOpenFailed { .. }
                | SkiffError::AuthFailed { .. }
                | SkiffError::AuthCancelled
                | SkiffError::Config(_)
        )
    }

    /// Produces an equivalent error for another waiter.
    ///
    /// A terminal connection error is reported to every pending operation,
    /// so it has to be reproduced. `Io` keeps its kind and message; `Other`
    /// becomes a `Protocol` error with the same text.
    pub fn duplicate(&self) -> SkiffError {
        match self {
            SkiffError::Io(e) => SkiffError::Io(std::io::Error::new(e.kind(), e.to_string())),
            SkiffError::Config(m) => SkiffError::Config(m.clone()),
            SkiffError::Protocol(m) => SkiffError::Protocol(m.clone()),
            SkiffError::Security(m) => SkiffError::Security(m.clone()),
            SkiffError::PacketCorrupt(m) => SkiffError::PacketCorrupt(m.clone()),
            SkiffError::Disconnected {
                reason,
                description,
            } => SkiffError::Disconnected {
                reason: *reason,
                description: description.clone(),
            },
            SkiffError::HostKeyRejected(m) => SkiffError::HostKeyRejected(m.clone()),
            SkiffError::AuthFailed { methods } => SkiffError::AuthFailed {
                methods: methods.clone(),
            },
            SkiffError::AuthCancelled => SkiffError::AuthCancelled,
            SkiffError::ChannelOpenFailed {
                reason,
                description,
            } => SkiffError::ChannelOpenFailed {
                reason: *reason,
                description: description.clone(),
            },
            SkiffError::Timeout(m) => SkiffError::Timeout(m.clone()),
            SkiffError::NotImplemented(m) => SkiffError::NotImplemented(m.clone()),
            SkiffError::Other(e) => SkiffError::Protocol(e.to_string()),
        }
    }
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
            SkiffError::PacketCorrupt(msg) => write!(f, "Packet corrupt: {}", msg),
            SkiffError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected (reason {}): {}", reason, description),
            SkiffError::HostKeyRejected(msg) => write!(f, "Host key rejected: {}", msg),
            SkiffError::AuthFailed { methods } => {
                write!(f, "Authentication failed (remaining methods: {})", methods.join(","))
            }
            SkiffError::AuthCancelled => write!(f, "Authentication cancelled by user"),
            SkiffError::ChannelOpenFailed {
                reason,
                description,
            } => write!(f, "Channel open failed (reason {}): {}", reason, description),
            SkiffError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            SkiffError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
