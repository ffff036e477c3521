//! Keepalive bookkeeping.
//!
//! The reader waits for packets with `keepalive_interval` as a timeout.
//! Every expiry asks [`Keepalive`] what to do: send another
//! `keepalive@openssh.com` probe or give up on the connection. Any packet
//! from the server counts as an answer.

use tracing::debug;

/// What the reader does after an idle interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send a probe and keep waiting.
    Probe,
    /// Too many unanswered probes; the connection is dead.
    Dead,
}

/// Counts consecutive idle intervals.
#[derive(Debug, Clone)]
pub struct Keepalive {
    max_count: u32,
    missed: u32,
}

impl Keepalive {
    /// Tolerates `max_count` unanswered probes, like OpenSSH's
    /// `ServerAliveCountMax`.
    pub fn new(max_count: u32) -> Self {
        Self {
            max_count,
            missed: 0,
        }
    }

    /// Records an idle interval.
    pub fn on_timeout(&mut self) -> KeepaliveAction {
        self.missed += 1;
        if self.missed > self.max_count {
            debug!(missed = self.missed, "Keepalive limit exceeded");
            KeepaliveAction::Dead
        } else {
            debug!(missed = self.missed, "Connection idle, probing");
            KeepaliveAction::Probe
        }
    }

    /// Records traffic from the server.
    pub fn reset(&mut self) {
        self.missed = 0;
    }

    /// Unanswered probes so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }
}
