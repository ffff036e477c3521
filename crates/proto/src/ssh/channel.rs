//! Channels multiplexed over one session (RFC 4254 Section 5).
//!
//! Two halves cooperate for every channel:
//!
//! - the [`ChannelTable`] entry, owned by the session reader, tracks the
//!   local window, the recipient id and the open waiter
//! - the [`Channel`] handle, owned by the application, tracks the remote
//!   window and the EOF/close flags
//!
//! The reader hands everything addressed to a channel to its handle as a
//! [`ChannelEvent`], including window credit granted by the peer.

use crate::ssh::config::ForwardingPolicy;
use crate::ssh::connection::{
    encode_data, encode_simple, ChannelMessage, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelRequest, ChannelRequestType, ChannelType, ChannelWindowAdjust,
};
use crate::ssh::message::{open_failure, MessageType};
use crate::ssh::session::Session;
use async_trait::async_trait;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::{BTreeMap, VecDeque};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, no answer yet
    OpenRequested,
    /// Open in both directions
    Open,
    /// We sent EOF
    EofSent,
    /// The peer sent EOF
    EofReceived,
    /// CLOSE sent or received
    Closed,
}

/// Something the peer did on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// CHANNEL_DATA
    Data(Vec<u8>),
    /// CHANNEL_EXTENDED_DATA
    ExtendedData {
        /// Data type, 1 for stderr
        data_type: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// CHANNEL_EOF
    Eof,
    /// CHANNEL_CLOSE
    Close,
    /// Window credit. Consumed by the handle, never returned by
    /// [`Channel::next_event`].
    WindowAdjust(u32),
    /// CHANNEL_SUCCESS
    Success,
    /// CHANNEL_FAILURE
    Failure,
    /// `exit-status` request
    ExitStatus(u32),
    /// `exit-signal` request
    ExitSignal {
        /// Signal name without the `SIG` prefix
        signal_name: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
}

/// What a `session` channel starts once open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Interactive shell
    Shell,
    /// A single command
    Exec(String),
    /// A named subsystem such as `sftp`
    Subsystem(String),
    /// Nothing; the caller sends requests itself
    None,
}

/// Channel kinds this client opens or accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// `session`
    Session(SessionRequest),
    /// `direct-tcpip`
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// `forwarded-tcpip`
    ForwardedTcpip {
        /// Address that was connected
        connected_address: String,
        /// Port that was connected
        connected_port: u32,
        /// Originator address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// `x11`
    X11 {
        /// Originator address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// `auth-agent@openssh.com`
    AgentForward,
}

impl ChannelKind {
    /// Wire representation of this kind.
    pub fn to_channel_type(&self) -> ChannelType {
        match self.clone() {
            ChannelKind::Session(_) => ChannelType::Session,
            ChannelKind::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            },
            ChannelKind::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            },
            ChannelKind::X11 {
                originator_address,
                originator_port,
            } => ChannelType::X11 {
                originator_address,
                originator_port,
            },
            ChannelKind::AgentForward => ChannelType::AuthAgent,
        }
    }

    /// Kind of a channel the server opened, if this client knows it.
    pub fn from_channel_type(channel_type: &ChannelType) -> Option<Self> {
        Some(match channel_type.clone() {
            ChannelType::Session => ChannelKind::Session(SessionRequest::None),
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => ChannelKind::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            },
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => ChannelKind::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            },
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => ChannelKind::X11 {
                originator_address,
                originator_port,
            },
            ChannelType::AuthAgent => ChannelKind::AgentForward,
            ChannelType::Unknown(_) => return None,
        })
    }
}

/// How to open a channel and what to do once it is open.
#[async_trait]
pub trait ChannelInit: Send + Sync {
    /// Channel type name sent in CHANNEL_OPEN.
    fn channel_type(&self) -> &str;

    /// Type-specific data appended to CHANNEL_OPEN.
    fn open_payload(&self) -> Vec<u8>;

    /// Runs after the open is confirmed.
    async fn start(&self, _channel: &mut Channel) -> SkiffResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ChannelInit for ChannelKind {
    fn channel_type(&self) -> &str {
        match self {
            ChannelKind::Session(_) => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::X11 { .. } => "x11",
            ChannelKind::AgentForward => "auth-agent@openssh.com",
        }
    }

    fn open_payload(&self) -> Vec<u8> {
        self.to_channel_type().type_data()
    }

    async fn start(&self, channel: &mut Channel) -> SkiffResult<()> {
        match self {
            ChannelKind::Session(SessionRequest::Shell) => channel.shell().await,
            ChannelKind::Session(SessionRequest::Exec(command)) => channel.exec(command).await,
            ChannelKind::Session(SessionRequest::Subsystem(name)) => {
                channel.subsystem(name).await
            }
            _ => Ok(()),
        }
    }
}

/// Parameters from OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenConfirmed {
    pub(crate) recipient: u32,
    pub(crate) remote_window: u32,
    pub(crate) remote_max_packet: u32,
}

/// A server-initiated channel waiting for [`Session::accept_channel`].
#[derive(Debug)]
pub(crate) struct PendingChannel {
    pub(crate) local_id: u32,
    pub(crate) recipient: u32,
    pub(crate) remote_window: u32,
    pub(crate) remote_max_packet: u32,
    pub(crate) channel_type: ChannelType,
    pub(crate) events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// What the reader must do after a channel message.
#[derive(Debug, Default)]
pub(crate) struct Dispatch {
    /// Payloads to send, in order
    pub(crate) replies: Vec<Vec<u8>>,
    /// A server-initiated channel to queue for acceptance
    pub(crate) accepted: Option<PendingChannel>,
}

impl Dispatch {
    fn reply(payload: Vec<u8>) -> Self {
        Self {
            replies: vec![payload],
            accepted: None,
        }
    }
}

type OpenWaiter = oneshot::Sender<SkiffResult<OpenConfirmed>>;

struct Entry {
    state: ChannelState,
    recipient: Option<u32>,
    local_window: u32,
    local_window_max: u32,
    // Delivered to the application but not yet returned to the peer.
    consumed: u32,
    events: mpsc::UnboundedSender<ChannelEvent>,
    opener: Option<OpenWaiter>,
    close_sent: bool,
    close_received: bool,
}

/// Reader-side channel state, keyed by local id.
pub(crate) struct ChannelTable {
    entries: BTreeMap<u32, Entry>,
    window_size: u32,
    max_packet_size: u32,
}

impl ChannelTable {
    pub(crate) fn new(window_size: u32, max_packet_size: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            window_size,
            max_packet_size,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn window_size(&self) -> u32 {
        self.window_size
    }

    pub(crate) fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// Smallest id not in use.
    fn free_id(&self) -> u32 {
        let mut id = 0;
        for &used in self.entries.keys() {
            if used != id {
                break;
            }
            id += 1;
        }
        id
    }

    fn insert(&mut self, state: ChannelState, recipient: Option<u32>) -> (u32, mpsc::UnboundedReceiver<ChannelEvent>) {
        let id = self.free_id();
        let (events, rx) = mpsc::unbounded_channel();
        self.entries.insert(
            id,
            Entry {
                state,
                recipient,
                local_window: self.window_size,
                local_window_max: self.window_size,
                consumed: 0,
                events,
                opener: None,
                close_sent: false,
                close_received: false,
            },
        );
        (id, rx)
    }

    /// Reserves an id for a channel we are about to open.
    pub(crate) fn allocate(
        &mut self,
    ) -> (
        u32,
        mpsc::UnboundedReceiver<ChannelEvent>,
        oneshot::Receiver<SkiffResult<OpenConfirmed>>,
    ) {
        let (id, events) = self.insert(ChannelState::OpenRequested, None);
        let (opener, waiter) = oneshot::channel();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.opener = Some(opener);
        }
        (id, events, waiter)
    }

    pub(crate) fn remove(&mut self, id: u32) {
        self.entries.remove(&id);
    }

    /// Local window of `id`.
    pub(crate) fn local_window(&self, id: u32) -> Option<u32> {
        self.entries.get(&id).map(|e| e.local_window)
    }

    /// Records that the application took `bytes` of data from channel
    /// `id`. Once the local window is below half its maximum, returns
    /// the WINDOW_ADJUST that hands everything consumed so far back to
    /// the peer.
    ///
    /// Queued plus consumed plus window never exceeds the maximum.
    pub(crate) fn consume(&mut self, id: u32, bytes: u32) -> Option<ChannelWindowAdjust> {
        let entry = self.entries.get_mut(&id)?;
        entry.consumed = entry.consumed.saturating_add(bytes);
        if entry.close_sent || entry.consumed == 0 || entry.local_window >= entry.local_window_max / 2 {
            return None;
        }
        let recipient = entry.recipient?;
        let bytes_to_add = entry
            .consumed
            .min(entry.local_window_max - entry.local_window);
        entry.consumed = 0;
        entry.local_window += bytes_to_add;
        trace!(channel = id, bytes_to_add, window = entry.local_window, "Returning window");
        Some(ChannelWindowAdjust {
            recipient_channel: recipient,
            bytes_to_add,
        })
    }

    /// Records that we are sending CLOSE. Returns the recipient to send it
    /// to, or `None` if CLOSE was already sent or the channel is gone.
    pub(crate) fn mark_close_sent(&mut self, id: u32) -> Option<u32> {
        let entry = self.entries.get_mut(&id)?;
        if entry.close_sent {
            return None;
        }
        entry.close_sent = true;
        entry.state = ChannelState::Closed;
        let recipient = entry.recipient;
        if entry.close_received {
            self.entries.remove(&id);
        }
        recipient
    }

    /// Fails every waiter and closes every event queue.
    pub(crate) fn close_all(&mut self, error: &SkiffError) {
        for (_, mut entry) in std::mem::take(&mut self.entries) {
            if let Some(opener) = entry.opener.take() {
                let _ = opener.send(Err(error.duplicate()));
            }
        }
    }

    fn entry(&mut self, id: u32, what: &str) -> Option<&mut Entry> {
        let entry = self.entries.get_mut(&id);
        if entry.is_none() {
            warn!(channel = id, message = what, "Message for unknown channel");
        }
        entry
    }

    /// Applies one channel message from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for violations that end the
    /// session, such as data beyond the window.
    pub(crate) fn dispatch(
        &mut self,
        message: ChannelMessage,
        policy: &ForwardingPolicy,
    ) -> SkiffResult<Dispatch> {
        match message {
            ChannelMessage::Open(open) => Ok(self.on_open(open, policy)),
            ChannelMessage::OpenConfirmation(c) => self.on_confirmation(c),
            ChannelMessage::OpenFailure(f) => self.on_failure(f),
            ChannelMessage::WindowAdjust(w) => {
                if let Some(entry) = self.entry(w.recipient_channel, "WINDOW_ADJUST") {
                    let _ = entry.events.send(ChannelEvent::WindowAdjust(w.bytes_to_add));
                }
                Ok(Dispatch::default())
            }
            ChannelMessage::Data(d) => self.on_data(d.recipient_channel, None, d.data),
            ChannelMessage::ExtendedData(d) => {
                self.on_data(d.recipient_channel, Some(d.data_type), d.data)
            }
            ChannelMessage::Eof(id) => {
                if let Some(entry) = self.entry(id, "EOF") {
                    if entry.state == ChannelState::Open {
                        entry.state = ChannelState::EofReceived;
                    }
                    let _ = entry.events.send(ChannelEvent::Eof);
                }
                Ok(Dispatch::default())
            }
            ChannelMessage::Close(id) => Ok(self.on_close(id)),
            ChannelMessage::Request(request) => Ok(self.on_request(request)),
            ChannelMessage::Success(id) => {
                if let Some(entry) = self.entry(id, "SUCCESS") {
                    let _ = entry.events.send(ChannelEvent::Success);
                }
                Ok(Dispatch::default())
            }
            ChannelMessage::Failure(id) => {
                if let Some(entry) = self.entry(id, "FAILURE") {
                    let _ = entry.events.send(ChannelEvent::Failure);
                }
                Ok(Dispatch::default())
            }
        }
    }

    fn on_open(&mut self, open: ChannelOpen, policy: &ForwardingPolicy) -> Dispatch {
        let allowed = match &open.channel_type {
            ChannelType::ForwardedTcpip { .. } => Some(policy.forwarded_tcpip),
            ChannelType::X11 { .. } => Some(policy.x11),
            ChannelType::AuthAgent => Some(policy.agent),
            ChannelType::Session | ChannelType::DirectTcpip { .. } => Some(false),
            ChannelType::Unknown(_) => None,
        };
        let name = open.channel_type.name().to_string();

        let code = match allowed {
            Some(true) => 0,
            Some(false) => open_failure::ADMINISTRATIVELY_PROHIBITED,
            None => open_failure::UNKNOWN_CHANNEL_TYPE,
        };
        if code != 0 {
            warn!(channel_type = %name, code, "Refusing channel opened by server");
            return Dispatch::reply(ChannelOpenFailure::new(open.sender_channel, code).to_bytes());
        }

        let (id, events) = self.insert(ChannelState::Open, Some(open.sender_channel));
        debug!(channel = id, remote = open.sender_channel, channel_type = %name, "Accepted channel");
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: id,
            initial_window_size: self.window_size,
            maximum_packet_size: self.max_packet_size,
        };
        Dispatch {
            replies: vec![confirmation.to_bytes()],
            accepted: Some(PendingChannel {
                local_id: id,
                recipient: open.sender_channel,
                remote_window: open.initial_window_size,
                remote_max_packet: open.maximum_packet_size,
                channel_type: open.channel_type,
                events,
            }),
        }
    }

    fn on_confirmation(&mut self, c: ChannelOpenConfirmation) -> SkiffResult<Dispatch> {
        let Some(entry) = self.entries.get_mut(&c.recipient_channel) else {
            // The open timed out locally; release the peer's side.
            warn!(channel = c.recipient_channel, "Confirmation for abandoned channel");
            return Ok(Dispatch::reply(encode_simple(
                MessageType::ChannelClose,
                c.sender_channel,
            )));
        };
        if entry.state != ChannelState::OpenRequested {
            return Err(SkiffError::Protocol(format!(
                "Duplicate OPEN_CONFIRMATION for channel {}",
                c.recipient_channel
            )));
        }

        entry.state = ChannelState::Open;
        entry.recipient = Some(c.sender_channel);
        debug!(
            channel = c.recipient_channel,
            remote = c.sender_channel,
            window = c.initial_window_size,
            max_packet = c.maximum_packet_size,
            "Channel open confirmed"
        );
        if let Some(opener) = entry.opener.take() {
            let _ = opener.send(Ok(OpenConfirmed {
                recipient: c.sender_channel,
                remote_window: c.initial_window_size,
                remote_max_packet: c.maximum_packet_size,
            }));
        }
        Ok(Dispatch::default())
    }

    fn on_failure(&mut self, f: ChannelOpenFailure) -> SkiffResult<Dispatch> {
        let Some(entry) = self.entries.get(&f.recipient_channel) else {
            warn!(channel = f.recipient_channel, "OPEN_FAILURE for unknown channel");
            return Ok(Dispatch::default());
        };
        if entry.state != ChannelState::OpenRequested {
            return Err(SkiffError::Protocol(format!(
                "OPEN_FAILURE for channel {} which is already open",
                f.recipient_channel
            )));
        }

        debug!(channel = f.recipient_channel, reason = f.reason_code, "Channel open failed");
        if let Some(mut entry) = self.entries.remove(&f.recipient_channel) {
            if let Some(opener) = entry.opener.take() {
                let _ = opener.send(Err(SkiffError::ChannelOpenFailed {
                    reason: f.reason_code,
                    description: f.description,
                }));
            }
        }
        Ok(Dispatch::default())
    }

    fn on_data(&mut self, id: u32, data_type: Option<u32>, data: Vec<u8>) -> SkiffResult<Dispatch> {
        let Some(entry) = self.entry(id, "DATA") else {
            return Ok(Dispatch::default());
        };
        if entry.recipient.is_none() {
            return Err(SkiffError::Protocol(format!(
                "Data on channel {} before it was confirmed",
                id
            )));
        }

        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if len > entry.local_window {
            return Err(SkiffError::Protocol(format!(
                "Channel {} received {} bytes with a window of {}",
                id, len, entry.local_window
            )));
        }
        entry.local_window -= len;
        trace!(channel = id, len, window = entry.local_window, "Channel data");

        let event = match data_type {
            None => ChannelEvent::Data(data),
            Some(data_type) => ChannelEvent::ExtendedData { data_type, data },
        };
        let _ = entry.events.send(event);
        Ok(Dispatch::default())
    }

    fn on_close(&mut self, id: u32) -> Dispatch {
        let Some(mut entry) = self.entries.remove(&id) else {
            warn!(channel = id, "CLOSE for unknown channel");
            return Dispatch::default();
        };
        debug!(channel = id, "Channel closed by peer");
        entry.close_received = true;
        let _ = entry.events.send(ChannelEvent::Close);

        let mut dispatch = Dispatch::default();
        if !entry.close_sent {
            if let Some(recipient) = entry.recipient {
                dispatch
                    .replies
                    .push(encode_simple(MessageType::ChannelClose, recipient));
            }
        }
        if let Some(opener) = entry.opener.take() {
            let _ = opener.send(Err(SkiffError::Protocol(format!(
                "Channel {} closed before it was confirmed",
                id
            ))));
        }
        dispatch
    }

    fn on_request(&mut self, request: ChannelRequest) -> Dispatch {
        let id = request.recipient_channel;
        let Some(entry) = self.entry(id, "REQUEST") else {
            return Dispatch::default();
        };
        match request.request_type {
            ChannelRequestType::ExitStatus { exit_status } => {
                debug!(channel = id, exit_status, "Exit status");
                let _ = entry.events.send(ChannelEvent::ExitStatus(exit_status));
                Dispatch::default()
            }
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                debug!(channel = id, signal = %signal_name, "Exit signal");
                let _ = entry.events.send(ChannelEvent::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                });
                Dispatch::default()
            }
            other => {
                debug!(channel = id, request = other.name(), "Refusing channel request");
                match (request.want_reply, entry.recipient) {
                    (true, Some(recipient)) => {
                        Dispatch::reply(encode_simple(MessageType::ChannelFailure, recipient))
                    }
                    _ => Dispatch::default(),
                }
            }
        }
    }
}

/// Application handle for one open channel.
///
/// Dropping the handle closes the channel in the background.
pub struct Channel {
    session: Session,
    local_id: u32,
    recipient: u32,
    type_name: String,
    origin: Option<ChannelType>,
    remote_window: u32,
    remote_max_packet: u32,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    backlog: VecDeque<ChannelEvent>,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    closed: bool,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
}

impl Channel {
    pub(crate) fn opened(
        session: Session,
        local_id: u32,
        type_name: &str,
        confirmed: OpenConfirmed,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self::build(
            session,
            local_id,
            confirmed.recipient,
            type_name.to_string(),
            None,
            confirmed.remote_window,
            confirmed.remote_max_packet,
            events,
        )
    }

    pub(crate) fn accepted(session: Session, pending: PendingChannel) -> Self {
        Self::build(
            session,
            pending.local_id,
            pending.recipient,
            pending.channel_type.name().to_string(),
            Some(pending.channel_type),
            pending.remote_window,
            pending.remote_max_packet,
            pending.events,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        session: Session,
        local_id: u32,
        recipient: u32,
        type_name: String,
        origin: Option<ChannelType>,
        remote_window: u32,
        remote_max_packet: u32,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            session,
            local_id,
            recipient,
            type_name,
            origin,
            remote_window,
            remote_max_packet,
            events,
            backlog: VecDeque::new(),
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            closed: false,
            exit_status: None,
            exit_signal: None,
        }
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's id for this channel.
    pub fn recipient_id(&self) -> u32 {
        self.recipient
    }

    /// Channel type name.
    pub fn channel_type(&self) -> &str {
        &self.type_name
    }

    /// Open parameters of a server-initiated channel.
    pub fn origin(&self) -> Option<&ChannelType> {
        self.origin.as_ref()
    }

    /// Bytes the peer currently accepts.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Largest data frame the peer accepts.
    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Current state as seen by this handle.
    pub fn state(&self) -> ChannelState {
        if self.closed || self.close_sent {
            ChannelState::Closed
        } else if self.eof_sent {
            ChannelState::EofSent
        } else if self.eof_received {
            ChannelState::EofReceived
        } else {
            ChannelState::Open
        }
    }

    /// Exit status reported by the peer.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    /// Exit signal reported by the peer.
    pub fn exit_signal(&self) -> Option<&str> {
        self.exit_signal.as_deref()
    }

    fn note(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::WindowAdjust(n) => {
                self.remote_window = self.remote_window.saturating_add(*n);
            }
            ChannelEvent::Eof => self.eof_received = true,
            ChannelEvent::Close => {
                self.closed = true;
                // The reader answers CLOSE on our behalf.
                self.close_sent = true;
            }
            ChannelEvent::ExitStatus(status) => self.exit_status = Some(*status),
            ChannelEvent::ExitSignal { signal_name, .. } => {
                self.exit_signal = Some(signal_name.clone());
            }
            _ => {}
        }
    }

    /// Records an event and keeps it for [`next_event`](Self::next_event).
    fn absorb(&mut self, event: ChannelEvent) {
        self.note(&event);
        if !matches!(event, ChannelEvent::WindowAdjust(_)) {
            self.backlog.push_back(event);
        }
    }

    fn collect_credit(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.absorb(event);
        }
    }

    fn check_open(&self) -> SkiffResult<()> {
        if self.closed || self.close_sent {
            return Err(SkiffError::Protocol(format!(
                "Channel {} is closed",
                self.local_id
            )));
        }
        Ok(())
    }

    // EOF ends data only; requests may still follow it.
    fn check_writable(&self) -> SkiffResult<()> {
        self.check_open()?;
        if self.eof_sent {
            return Err(SkiffError::Protocol(format!(
                "Channel {} already sent EOF",
                self.local_id
            )));
        }
        Ok(())
    }

    /// Sends as much of `data` as the remote window allows, in frames of
    /// at most the remote maximum packet size. Returns the bytes sent.
    pub async fn send_data(&mut self, data: &[u8]) -> SkiffResult<usize> {
        self.collect_credit();
        self.check_writable()?;

        let frame_limit = self.remote_max_packet.max(1) as usize;
        let mut sent = 0;
        while sent < data.len() && self.remote_window > 0 {
            let n = (data.len() - sent)
                .min(self.remote_window as usize)
                .min(frame_limit);
            self.session
                .send(encode_data(self.recipient, &data[sent..sent + n]))
                .await?;
            self.remote_window -= n as u32;
            sent += n;
        }
        trace!(channel = self.local_id, sent, window = self.remote_window, "Sent channel data");
        Ok(sent)
    }

    async fn wait_for_credit(&mut self) -> SkiffResult<()> {
        while self.remote_window == 0 {
            match self.events.recv().await {
                Some(event) => {
                    self.absorb(event);
                    if self.closed {
                        return Err(SkiffError::Protocol(format!(
                            "Channel {} closed by peer while waiting for window",
                            self.local_id
                        )));
                    }
                }
                None => return Err(self.session.terminal_error()),
            }
        }
        Ok(())
    }

    /// Sends all of `data`, waiting for window credit as needed.
    pub async fn write_all(&mut self, data: &[u8]) -> SkiffResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            offset += self.send_data(&data[offset..]).await?;
            if offset < data.len() {
                self.wait_for_credit().await?;
            }
        }
        Ok(())
    }

    /// Sends EOF. Further data fails; requests and receiving continue.
    pub async fn eof(&mut self) -> SkiffResult<()> {
        if self.eof_sent || self.close_sent {
            return Ok(());
        }
        self.session
            .send(encode_simple(MessageType::ChannelEof, self.recipient))
            .await?;
        self.eof_sent = true;
        Ok(())
    }

    /// Sends CLOSE if needed and waits for the peer's CLOSE.
    ///
    /// Events arriving meanwhile are discarded.
    pub async fn close(&mut self) -> SkiffResult<()> {
        if !self.close_sent {
            self.close_sent = true;
            self.session.close_channel(self.local_id).await?;
        }
        self.backlog.clear();
        while !self.closed {
            match self.events.recv().await {
                Some(event) => self.note(&event),
                None => break,
            }
        }
        Ok(())
    }

    /// Sends a channel request. With `want_reply` the result says whether
    /// the peer accepted it; without, it is always `true`.
    pub async fn request(
        &mut self,
        request_type: ChannelRequestType,
        want_reply: bool,
    ) -> SkiffResult<bool> {
        self.check_open()?;
        let name = request_type.name().to_string();
        let request = ChannelRequest {
            recipient_channel: self.recipient,
            request_type,
            want_reply,
        };
        self.session.send(request.to_bytes()).await?;
        debug!(channel = self.local_id, request = %name, want_reply, "Sent channel request");
        if !want_reply {
            return Ok(true);
        }

        loop {
            match self.events.recv().await {
                Some(ChannelEvent::Success) => return Ok(true),
                Some(ChannelEvent::Failure) => return Ok(false),
                Some(event) => {
                    self.absorb(event);
                    if self.closed {
                        return Err(SkiffError::Protocol(format!(
                            "Channel {} closed before answering {}",
                            self.local_id, name
                        )));
                    }
                }
                None => return Err(self.session.terminal_error()),
            }
        }
    }

    async fn require(&mut self, request_type: ChannelRequestType) -> SkiffResult<()> {
        let name = request_type.name().to_string();
        if self.request(request_type, true).await? {
            Ok(())
        } else {
            Err(SkiffError::Protocol(format!(
                "Server refused {} on channel {}",
                name, self.local_id
            )))
        }
    }

    /// Runs `command`.
    pub async fn exec(&mut self, command: &str) -> SkiffResult<()> {
        self.require(ChannelRequestType::Exec {
            command: command.to_string(),
        })
        .await
    }

    /// Starts the user's shell.
    pub async fn shell(&mut self) -> SkiffResult<()> {
        self.require(ChannelRequestType::Shell).await
    }

    /// Starts subsystem `name`.
    pub async fn subsystem(&mut self, name: &str) -> SkiffResult<()> {
        self.require(ChannelRequestType::Subsystem {
            name: name.to_string(),
        })
        .await
    }

    /// Requests a pseudo terminal.
    pub async fn request_pty(&mut self, term: &str, width_chars: u32, height_rows: u32) -> SkiffResult<bool> {
        self.request(
            ChannelRequestType::PtyReq {
                term: term.to_string(),
                width_chars,
                height_rows,
                width_pixels: 0,
                height_pixels: 0,
                // TTY_OP_END only
                modes: vec![0],
            },
            true,
        )
        .await
    }

    /// Sets an environment variable. Servers commonly refuse these.
    pub async fn set_env(&mut self, name: &str, value: &str) -> SkiffResult<bool> {
        self.request(
            ChannelRequestType::Env {
                name: name.to_string(),
                value: value.to_string(),
            },
            true,
        )
        .await
    }

    /// Reports a terminal size change.
    pub async fn window_change(&mut self, width_chars: u32, height_rows: u32) -> SkiffResult<()> {
        self.request(
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels: 0,
                height_pixels: 0,
            },
            false,
        )
        .await
        .map(|_| ())
    }

    /// Delivers a signal such as `INT` or `TERM`.
    pub async fn signal(&mut self, name: &str) -> SkiffResult<()> {
        self.request(
            ChannelRequestType::Signal {
                name: name.to_string(),
            },
            false,
        )
        .await
        .map(|_| ())
    }

    /// Requests X11 forwarding for this session.
    pub async fn request_x11(
        &mut self,
        single_connection: bool,
        auth_protocol: &str,
        auth_cookie: &str,
        screen_number: u32,
    ) -> SkiffResult<bool> {
        self.request(
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol: auth_protocol.to_string(),
                auth_cookie: auth_cookie.to_string(),
                screen_number,
            },
            true,
        )
        .await
    }

    /// Requests agent forwarding for this session.
    pub async fn request_agent_forwarding(&mut self) -> SkiffResult<bool> {
        self.request(ChannelRequestType::AgentForward, true).await
    }

    /// Hands the window used by a delivered data event back to the peer.
    async fn release(&mut self, event: &ChannelEvent) {
        let len = match event {
            ChannelEvent::Data(data) | ChannelEvent::ExtendedData { data, .. } => data.len(),
            _ => return,
        };
        if self.close_sent {
            return;
        }
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if let Err(e) = self.session.consume_channel_data(self.local_id, len).await {
            debug!(channel = self.local_id, error = %e, "Window adjust failed");
        }
    }

    /// Next event from the peer, or `None` once the channel is gone.
    ///
    /// Taking a data event frees its share of the local window.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        let event = match self.backlog.pop_front() {
            Some(event) => event,
            None => loop {
                let event = self.events.recv().await?;
                self.note(&event);
                if !matches!(event, ChannelEvent::WindowAdjust(_)) {
                    break event;
                }
            },
        };
        self.release(&event).await;
        Some(event)
    }

    /// Writes a data event to `output`. Returns false once the channel
    /// closed.
    async fn deliver<W>(&mut self, event: ChannelEvent, output: &mut W) -> SkiffResult<bool>
    where
        W: AsyncWrite + Unpin,
    {
        match &event {
            ChannelEvent::Data(data) | ChannelEvent::ExtendedData { data, .. } => {
                output.write_all(data).await?;
                self.release(&event).await;
                Ok(true)
            }
            ChannelEvent::Close => Ok(false),
            _ => Ok(true),
        }
    }

    /// Copies `input` into the channel and the channel into `output` until
    /// the channel closes. Extended data goes to `output` as well.
    ///
    /// Returns the exit status, if the peer reported one.
    pub async fn pump<R, W>(&mut self, mut input: R, mut output: W) -> SkiffResult<Option<u32>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; (self.remote_max_packet as usize).clamp(1, 32 * 1024)];
        let mut input_open = !self.eof_sent;

        'outer: loop {
            while let Some(event) = self.backlog.pop_front() {
                if !self.deliver(event, &mut output).await? {
                    break 'outer;
                }
            }

            tokio::select! {
                read = input.read(&mut buf), if input_open => {
                    let n = read?;
                    if n == 0 {
                        input_open = false;
                        self.eof().await?;
                    } else if let Err(e) = self.write_all(&buf[..n]).await {
                        if !self.closed {
                            return Err(e);
                        }
                        input_open = false;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.note(&event);
                        if !self.deliver(event, &mut output).await? {
                            break 'outer;
                        }
                    }
                    None => return Err(self.session.terminal_error()),
                },
            }
        }

        output.flush().await?;
        debug!(channel = self.local_id, exit_status = ?self.exit_status, "Pump finished");
        Ok(self.exit_status)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("recipient", &self.recipient)
            .field("type", &self.type_name)
            .field("state", &self.state())
            .field("remote_window", &self.remote_window)
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.close_sent || self.session.is_closed() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            let id = self.local_id;
            handle.spawn(async move {
                if let Err(e) = session.close_channel(id).await {
                    debug!(channel = id, error = %e, "Close on drop failed");
                }
            });
        }
    }
}
