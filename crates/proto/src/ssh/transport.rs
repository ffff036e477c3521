//! SSH transport layer state and generic messages (RFC 4253).
//!
//! # Session States
//!
//! 1. **Disconnected** - no stream, or the stream has been torn down
//! 2. **VersionExchange** - identification strings are being exchanged
//! 3. **Kex** - a key exchange is running (first or rekey)
//! 4. **Authenticating** - transport keys are live, user auth in progress
//! 5. **Running** - authenticated, channels usable
//!
//! Rekeying moves `Authenticating` or `Running` back to `Kex` and returns
//! to the state it left.
//!
//! # Rekeying
//!
//! [`RekeyTracker`] decides when an automatic rekey is due, based on:
//! - Data transferred (1 GiB by default)
//! - Time elapsed (1 hour by default)
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::transport::SessionState;
//!
//! let mut state = SessionState::Disconnected;
//! state.transition(SessionState::VersionExchange).unwrap();
//! state.transition(SessionState::Kex).unwrap();
//! assert!(state.transition(SessionState::Running).is_err());
//! ```

use crate::ssh::buffer::WireBuffer;
use crate::ssh::message::MessageType;
use skiff_platform::{SkiffError, SkiffResult};
use std::time::Duration;
use tokio::time::Instant;

/// Default rekey volume: 1 GiB.
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Default rekey interval: one hour.
pub const DEFAULT_REKEY_TIME: Duration = Duration::from_secs(3600);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// Identification strings are being exchanged.
    VersionExchange,
    /// A key exchange is running.
    Kex,
    /// User authentication is in progress.
    Authenticating,
    /// Authenticated; channels may be opened.
    Running,
}

impl SessionState {
    /// Returns true if moving to `next` is allowed.
    pub fn can_transition(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (a, b) if a == b => true,
            (_, Disconnected) => true,
            (Disconnected, VersionExchange) => true,
            (VersionExchange, Kex) => true,
            (Kex, Authenticating) | (Kex, Running) => true,
            (Authenticating, Kex) | (Running, Kex) => true,
            (Authenticating, Running) => true,
            _ => false,
        }
    }

    /// Moves to `next`, rejecting invalid transitions.
    pub fn transition(&mut self, next: SessionState) -> SkiffResult<()> {
        if !self.can_transition(next) {
            return Err(SkiffError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    /// Returns true once transport keys are live.
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Authenticating | SessionState::Running)
    }
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound for a whole key exchange, and for an application
    /// write waiting on one.
    pub kex_timeout: Duration,

    /// Bytes (both directions) after which a rekey starts.
    pub rekey_bytes_limit: u64,

    /// Time after which a rekey starts.
    pub rekey_time_limit: Duration,

    /// Smallest acceptable group-exchange prime, in bits.
    pub gex_min: u32,

    /// Preferred group-exchange prime size, in bits.
    pub gex_preferred: u32,

    /// Largest acceptable group-exchange prime, in bits.
    pub gex_max: u32,

    /// Idle time before a keepalive probe is sent.
    pub keepalive_interval: Option<Duration>,

    /// Unanswered probes tolerated before the connection is declared dead.
    pub keepalive_max_count: u32,

    /// Lines of pre-identification banner accepted from the server.
    pub max_banner_lines: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kex_timeout: Duration::from_secs(30),
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            rekey_time_limit: DEFAULT_REKEY_TIME,
            gex_min: 2048,
            gex_preferred: 3072,
            gex_max: 8192,
            keepalive_interval: None,
            keepalive_max_count: 3,
            max_banner_lines: 64,
        }
    }
}

impl TransportConfig {
    /// Checks internal consistency.
    pub fn validate(&self) -> SkiffResult<()> {
        if !(self.gex_min <= self.gex_preferred && self.gex_preferred <= self.gex_max) {
            return Err(SkiffError::Config(format!(
                "Group exchange sizes must satisfy min <= preferred <= max, got {}/{}/{}",
                self.gex_min, self.gex_preferred, self.gex_max
            )));
        }
        if self.gex_min < 1024 {
            return Err(SkiffError::Config(format!(
                "Group exchange minimum {} is below 1024 bits",
                self.gex_min
            )));
        }
        if self.keepalive_interval.is_some() && self.keepalive_max_count == 0 {
            return Err(SkiffError::Config(
                "keepalive_max_count must be at least 1".to_string(),
            ));
        }
        if self.max_banner_lines == 0 {
            return Err(SkiffError::Config(
                "max_banner_lines must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tracks volume and age of the current keys.
#[derive(Debug, Clone)]
pub struct RekeyTracker {
    bytes: u64,
    since: Instant,
    bytes_limit: u64,
    time_limit: Duration,
}

impl RekeyTracker {
    /// Starts tracking now.
    pub fn new(bytes_limit: u64, time_limit: Duration) -> Self {
        Self {
            bytes: 0,
            since: Instant::now(),
            bytes_limit,
            time_limit,
        }
    }

    /// Records transferred bytes.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Bytes since the last reset.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns true if either limit has been reached.
    pub fn needs_rekey(&self) -> bool {
        self.bytes >= self.bytes_limit || self.since.elapsed() >= self.time_limit
    }

    /// Restarts both counters after a completed key exchange.
    pub fn reset(&mut self) {
        self.bytes = 0;
        self.since = Instant::now();
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code (see [`crate::ssh::message::disconnect`])
    pub reason: u32,
    /// Human readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: u32, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::with_capacity(16 + self.description.len());
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason);
        buf.put_str(&self.description);
        buf.put_str("");
        buf.into_vec()
    }

    /// Parses from bytes. The language tag is optional.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = WireBuffer::from_slice(data);
        if buf.get_u8()? != MessageType::Disconnect as u8 {
            return Err(SkiffError::Protocol("Not a DISCONNECT message".to_string()));
        }
        let reason = buf.get_u32()?;
        let description = String::from_utf8_lossy(&buf.get_string()?).into_owned();
        Ok(Self {
            reason,
            description,
        })
    }

    /// The error a received DISCONNECT terminates the session with.
    pub fn into_error(self) -> SkiffError {
        SkiffError::Disconnected {
            reason: self.reason,
            description: self.description,
        }
    }
}

/// Encodes SSH_MSG_UNIMPLEMENTED for the packet with `sequence`.
pub fn encode_unimplemented(sequence: u32) -> Vec<u8> {
    let mut buf = WireBuffer::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.into_vec()
}

/// Encodes SSH_MSG_SERVICE_REQUEST.
pub fn encode_service_request(service: &str) -> Vec<u8> {
    let mut buf = WireBuffer::new();
    buf.put_u8(MessageType::ServiceRequest as u8);
    buf.put_str(service);
    buf.into_vec()
}

/// Parses SSH_MSG_SERVICE_ACCEPT and returns the service name.
pub fn parse_service_accept(data: &[u8]) -> SkiffResult<String> {
    let mut buf = WireBuffer::from_slice(data);
    let msg = buf.get_u8()?;
    if msg != MessageType::ServiceAccept as u8 {
        return Err(SkiffError::Protocol(format!(
            "Expected SERVICE_ACCEPT, got message {}",
            msg
        )));
    }
    // Some old servers send an empty accept.
    if buf.remaining() == 0 {
        return Ok(String::new());
    }
    buf.get_utf8()
}

/// Extracts the message text of SSH_MSG_DEBUG, if well formed.
pub fn parse_debug(data: &[u8]) -> Option<String> {
    let mut buf = WireBuffer::from_slice(data);
    buf.skip(2).ok()?;
    buf.get_string()
        .ok()
        .map(|m| String::from_utf8_lossy(&m).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_progression() {
        let mut state = SessionState::Disconnected;
        for next in [
            SessionState::VersionExchange,
            SessionState::Kex,
            SessionState::Authenticating,
            SessionState::Running,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.is_established());
    }

    #[test]
    fn test_rekey_round_trips() {
        let mut state = SessionState::Running;
        state.transition(SessionState::Kex).unwrap();
        state.transition(SessionState::Running).unwrap();

        let mut state = SessionState::Authenticating;
        state.transition(SessionState::Kex).unwrap();
        state.transition(SessionState::Authenticating).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = SessionState::VersionExchange;
        match state.transition(SessionState::Running) {
            Err(SkiffError::Protocol(msg)) => assert!(msg.contains("Invalid state transition")),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(!SessionState::Disconnected.can_transition(SessionState::Kex));
        assert!(!SessionState::Running.can_transition(SessionState::Authenticating));
        assert!(SessionState::Kex.can_transition(SessionState::Disconnected));
    }

    #[test]
    fn test_config_validation() {
        assert!(TransportConfig::default().validate().is_ok());

        let bad = TransportConfig {
            gex_min: 4096,
            gex_preferred: 2048,
            ..TransportConfig::default()
        };
        assert!(matches!(bad.validate(), Err(SkiffError::Config(_))));

        let bad = TransportConfig {
            keepalive_interval: Some(Duration::from_secs(1)),
            keepalive_max_count: 0,
            ..TransportConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_rekey_by_bytes() {
        let mut tracker = RekeyTracker::new(1000, DEFAULT_REKEY_TIME);
        tracker.add_bytes(600);
        assert!(!tracker.needs_rekey());
        tracker.add_bytes(400);
        assert!(tracker.needs_rekey());
        tracker.reset();
        assert_eq!(tracker.bytes(), 0);
        assert!(!tracker.needs_rekey());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rekey_by_time() {
        let tracker = RekeyTracker::new(u64::MAX, Duration::from_secs(60));
        assert!(!tracker.needs_rekey());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(tracker.needs_rekey());
    }

    #[test]
    fn test_disconnect_message() {
        let msg = Disconnect::new(11, "bye");
        let parsed = Disconnect::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        match parsed.into_error() {
            SkiffError::Disconnected {
                reason,
                description,
            } => {
                assert_eq!(reason, 11);
                assert_eq!(description, "bye");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Disconnect::from_bytes(&[2, 0, 0]).is_err());
    }

    #[test]
    fn test_service_messages() {
        let req = encode_service_request("ssh-userauth");
        assert_eq!(req[0], MessageType::ServiceRequest as u8);

        let mut accept = vec![MessageType::ServiceAccept as u8];
        accept.extend_from_slice(&req[1..]);
        assert_eq!(parse_service_accept(&accept).unwrap(), "ssh-userauth");
        assert_eq!(parse_service_accept(&[6]).unwrap(), "");
        assert!(parse_service_accept(&[52]).is_err());
    }

    #[test]
    fn test_unimplemented_and_debug() {
        assert_eq!(encode_unimplemented(0x01020304), vec![3, 1, 2, 3, 4]);
        let debug = [4u8, 1, 0, 0, 0, 2, b'h', b'i', 0, 0, 0, 0];
        assert_eq!(parse_debug(&debug).as_deref(), Some("hi"));
        assert_eq!(parse_debug(&[4]), None);
    }
}
