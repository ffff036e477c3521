//! The per-session reader task.
//!
//! Reads packets strictly in arrival order and dispatches each one. The
//! task ends on the first fatal error, which becomes the session's
//! terminal error.

use super::handshake::KexDriver;
use super::keepalive::{Keepalive, KeepaliveAction};
use super::{lock, Control, SessionInner};
use crate::ssh::connection::{ChannelMessage, GlobalReply, GlobalRequest};
use crate::ssh::message::{allowed_during_kex, MessageType};
use crate::ssh::packet::PacketDecoder;
use crate::ssh::transport::{encode_unimplemented, parse_debug, Disconnect, SessionState};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub(crate) struct Reader {
    inner: Arc<SessionInner>,
    stream: Box<dyn AsyncRead + Send + Unpin>,
    decoder: PacketDecoder,
    kex: KexDriver,
    keepalive: Keepalive,
    control: mpsc::UnboundedReceiver<Control>,
    inbound_seen: u64,
}

/// Reads one packet, or returns `None` when `idle` elapses first.
async fn read_with_idle<R>(
    decoder: &mut PacketDecoder,
    stream: &mut R,
    idle: Option<Duration>,
) -> SkiffResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(limit) => match tokio::time::timeout(limit, decoder.read_packet(stream)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => decoder.read_packet(stream).await.map(Some),
    }
}

impl Reader {
    pub(crate) fn new(
        inner: Arc<SessionInner>,
        stream: Box<dyn AsyncRead + Send + Unpin>,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let keepalive = Keepalive::new(inner.config.transport.keepalive_max_count);
        Self {
            inner,
            stream,
            decoder: PacketDecoder::new(),
            kex: KexDriver::new(),
            keepalive,
            control,
            inbound_seen: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let error = match self.kex.start(&self.inner).await {
            Ok(()) => self.run_loop().await,
            Err(e) => e,
        };
        debug!(error = %error, "Reader stopped");
        self.inner.teardown(error).await;
    }

    async fn run_loop(&mut self) -> SkiffError {
        loop {
            if let Err(e) = self.step().await {
                return e;
            }
        }
    }

    async fn step(&mut self) -> SkiffResult<()> {
        let idle = self.inner.config.transport.keepalive_interval;
        tokio::select! {
            biased;
            Some(control) = self.control.recv() => self.on_control(control).await,
            read = read_with_idle(&mut self.decoder, &mut self.stream, idle) => match read? {
                Some(payload) => {
                    self.keepalive.reset();
                    self.on_packet(payload).await
                }
                None => self.on_idle().await,
            },
        }
    }

    async fn on_control(&mut self, control: Control) -> SkiffResult<()> {
        match control {
            Control::Rekey if self.kex.is_idle() => {
                debug!("Starting rekey");
                self.kex.start(&self.inner).await
            }
            Control::Rekey => Ok(()),
        }
    }

    async fn on_idle(&mut self) -> SkiffResult<()> {
        if !self.kex.is_idle() {
            return Ok(());
        }
        match self.keepalive.on_timeout() {
            KeepaliveAction::Probe => self.inner.send_keepalive().await,
            KeepaliveAction::Dead => Err(SkiffError::Timeout(format!(
                "No response from server after {} keepalive probes",
                self.keepalive.missed() - 1
            ))),
        }
    }

    fn track_inbound(&mut self) {
        let now = self.decoder.counters().bytes;
        let delta = now.saturating_sub(self.inbound_seen);
        self.inbound_seen = now;
        self.inner.note_traffic(delta);
    }

    async fn on_packet(&mut self, payload: Vec<u8>) -> SkiffResult<()> {
        let msg = *payload
            .first()
            .ok_or_else(|| SkiffError::Protocol("Empty packet payload".to_string()))?;
        self.track_inbound();
        trace!(
            msg,
            name = MessageType::from_u8(msg).map_or("unknown", |m| m.name()),
            len = payload.len(),
            "Received packet"
        );

        if !allowed_during_kex(msg)
            && (self.inner.session_id.get().is_none() || self.kex.peer_in_kex())
        {
            return Err(SkiffError::Protocol(format!(
                "Message {} not allowed during key exchange",
                msg
            )));
        }

        match msg {
            1 => Err(Disconnect::from_bytes(&payload)?.into_error()),
            2 => Ok(()),
            3 => {
                debug!("Server reported an unimplemented message");
                if self.inner.auth_active.load(Ordering::SeqCst) {
                    self.inner.deliver_auth(payload);
                }
                Ok(())
            }
            4 => {
                if let Some(text) = parse_debug(&payload) {
                    debug!(message = %text, "Server debug message");
                }
                Ok(())
            }
            20..=49 => {
                let installed = self
                    .kex
                    .on_message(&self.inner, &mut self.decoder, &payload)
                    .await?;
                if installed {
                    self.inbound_seen = 0;
                }
                Ok(())
            }
            6 | 50..=79 => {
                if msg == MessageType::UserauthSuccess as u8 {
                    self.on_auth_success().await;
                }
                self.inner.deliver_auth(payload);
                Ok(())
            }
            80 => {
                let request = GlobalRequest::from_bytes(&payload)?;
                debug!(name = %request.name, want_reply = request.want_reply, "Server global request");
                if request.want_reply {
                    self.inner
                        .send_from_reader(vec![MessageType::RequestFailure as u8])
                        .await?;
                }
                Ok(())
            }
            81 | 82 => {
                self.inner.resolve_global(GlobalReply::from_bytes(&payload)?);
                Ok(())
            }
            90..=100 => self.on_channel(&payload).await,
            _ => {
                warn!(msg, "Unimplemented message from server");
                let sequence = self.decoder.sequence().wrapping_sub(1);
                self.inner
                    .send_from_reader(encode_unimplemented(sequence))
                    .await
            }
        }
    }

    async fn on_auth_success(&mut self) {
        self.inner.authenticated.store(true, Ordering::SeqCst);
        self.decoder.enable_delayed_compression();
        self.inner.writer.lock().await.encoder.enable_delayed_compression();
        if self.inner.state() == SessionState::Authenticating {
            self.inner.set_state(SessionState::Running);
        }
    }

    async fn on_channel(&mut self, payload: &[u8]) -> SkiffResult<()> {
        let message = ChannelMessage::parse(payload)?;
        let policy = *lock(&self.inner.forwarding);
        let dispatch = self.inner.channels.lock().await.dispatch(message, &policy)?;
        for reply in dispatch.replies {
            self.inner.send_from_reader(reply).await?;
        }
        if let Some(pending) = dispatch.accepted {
            self.inner.deliver_accepted(pending);
        }
        Ok(())
    }
}
