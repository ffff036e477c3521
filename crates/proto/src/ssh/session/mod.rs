//! The session engine.
//!
//! A [`Session`] owns one byte stream. [`Session::connect`] exchanges
//! identification strings, splits the stream and spawns a reader task that
//! drives key exchange and dispatches every inbound message. Outbound
//! packets from any task go through a single write lock, so encoding and
//! writing stay atomic and the sequence number only moves under it.
//!
//! While a key exchange is running, application writes wait on a watch
//! channel instead of spinning; messages the reader itself produces are
//! queued and flushed right after NEWKEYS.

mod handshake;
mod keepalive;
mod reader;

pub use keepalive::{Keepalive, KeepaliveAction};

use crate::ssh::auth::{self, AuthTransport};
use crate::ssh::buffer::WireBuffer;
use crate::ssh::channel::{Channel, ChannelInit, ChannelTable, PendingChannel};
use crate::ssh::config::{AuthConfig, ForwardingPolicy, SshClientConfig};
use crate::ssh::connection::{encode_open, encode_simple, GlobalReply, GlobalRequest};
use crate::ssh::hostkey::fingerprint;
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::message::{allowed_during_kex, disconnect, MessageType};
use crate::ssh::packet::PacketEncoder;
use crate::ssh::transport::{Disconnect, RekeyTracker, SessionState};
use crate::ssh::version::{read_identification, send_identification, Version};
use async_trait::async_trait;
use reader::Reader;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long teardown waits for the write lock before giving up on a
/// final DISCONNECT.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

type GlobalWaiter = oneshot::Sender<SkiffResult<GlobalReply>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Key exchange progress, published to waiting writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct KexStatus {
    pub(crate) in_kex: bool,
    pub(crate) completed: u64,
    pub(crate) closed: bool,
}

/// Requests from handles to the reader task.
#[derive(Debug)]
pub(crate) enum Control {
    Rekey,
}

pub(crate) struct Writer {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) encoder: PacketEncoder,
    pub(crate) in_kex: bool,
    pub(crate) pending: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Writer {
    /// Encodes and writes one packet. Returns the wire size.
    async fn write_packet(&mut self, payload: &[u8]) -> SkiffResult<usize> {
        let bytes = self.encoder.encode(payload)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        trace!(
            msg = payload.first().copied().unwrap_or(0),
            len = bytes.len(),
            seq = self.encoder.sequence().wrapping_sub(1),
            "Sent packet"
        );
        Ok(bytes.len())
    }
}

pub(crate) struct SessionInner {
    pub(crate) config: SshClientConfig,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) client_version: Version,
    pub(crate) server_version: Version,
    pub(crate) writer: tokio::sync::Mutex<Writer>,
    pub(crate) kex_status: watch::Sender<KexStatus>,
    state: Mutex<SessionState>,
    pub(crate) authenticated: AtomicBool,
    service_accepted: AtomicBool,
    // Set while `authenticate` waits for the server.
    pub(crate) auth_active: AtomicBool,
    pub(crate) session_id: OnceLock<Vec<u8>>,
    pub(crate) host_key: OnceLock<Vec<u8>>,
    pub(crate) negotiated: Mutex<Option<NegotiatedAlgorithms>>,
    pub(crate) channels: tokio::sync::Mutex<ChannelTable>,
    global_waiters: Mutex<VecDeque<GlobalWaiter>>,
    auth_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    auth_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<PendingChannel>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingChannel>>,
    fatal: Mutex<Option<SkiffError>>,
    pub(crate) forwarding: Mutex<ForwardingPolicy>,
    pub(crate) traffic: Mutex<RekeyTracker>,
    pub(crate) rekey_requested: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
}

impl SessionInner {
    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if let Err(e) = state.transition(next) {
            warn!(error = %e, "Ignoring state change");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.fatal).is_some()
    }

    /// The error every operation reports once the session is gone.
    pub(crate) fn terminal_error(&self) -> SkiffError {
        match lock(&self.fatal).as_ref() {
            Some(error) => error.duplicate(),
            None => SkiffError::Disconnected {
                reason: disconnect::CONNECTION_LOST,
                description: "Session closed".to_string(),
            },
        }
    }

    /// Counts transferred bytes and asks the reader for a rekey once a
    /// limit is reached.
    pub(crate) fn note_traffic(&self, bytes: u64) {
        let due = {
            let mut traffic = lock(&self.traffic);
            traffic.add_bytes(bytes);
            traffic.needs_rekey()
        };
        if due && !self.rekey_requested.swap(true, Ordering::SeqCst) {
            debug!("Rekey limit reached");
            let _ = self.control.send(Control::Rekey);
        }
    }

    pub(crate) async fn write_locked(&self, writer: &mut Writer, payload: &[u8]) -> SkiffResult<()> {
        if writer.closed {
            return Err(self.terminal_error());
        }
        let written = writer.write_packet(payload).await?;
        self.note_traffic(written as u64);
        Ok(())
    }

    async fn wait_for_gate(&self) -> SkiffResult<()> {
        let mut status = self.kex_status.subscribe();
        let limit = self.config.transport.kex_timeout;
        let waited = tokio::time::timeout(limit, async {
            status
                .wait_for(|s| !s.in_kex || s.closed)
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(status)) if !status.closed => Ok(()),
            Ok(_) => Err(self.terminal_error()),
            Err(_) => Err(SkiffError::Timeout(format!(
                "Key exchange still running after {:?}",
                limit
            ))),
        }
    }

    async fn send_inner(&self, payload: &[u8], waiter: Option<GlobalWaiter>) -> SkiffResult<()> {
        let msg = payload.first().copied().unwrap_or(0);
        if allowed_during_kex(msg) {
            let mut writer = self.writer.lock().await;
            return self.write_locked(&mut writer, payload).await;
        }

        loop {
            self.wait_for_gate().await?;
            let mut writer = self.writer.lock().await;
            if writer.closed {
                return Err(self.terminal_error());
            }
            // Another exchange may have started between the gate and the lock.
            if writer.in_kex {
                continue;
            }
            if let Some(waiter) = waiter {
                lock(&self.global_waiters).push_back(waiter);
            }
            return self.write_locked(&mut writer, payload).await;
        }
    }

    /// Sends one payload on behalf of an application task.
    pub(crate) async fn send(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.send_inner(&payload, None).await
    }

    /// Sends a payload produced by the reader. Non-KEX messages are
    /// queued while a key exchange is running.
    pub(crate) async fn send_from_reader(&self, payload: Vec<u8>) -> SkiffResult<()> {
        let msg = payload.first().copied().unwrap_or(0);
        let mut writer = self.writer.lock().await;
        if writer.in_kex && !allowed_during_kex(msg) {
            trace!(msg, "Queued until key exchange completes");
            writer.pending.push_back(payload);
            return Ok(());
        }
        self.write_locked(&mut writer, &payload).await
    }

    /// Sends a keepalive probe unless a key exchange is running.
    pub(crate) async fn send_keepalive(&self) -> SkiffResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.in_kex || writer.closed {
            return Ok(());
        }
        // Nobody waits for the answer; it only has to keep the FIFO aligned.
        let (waiter, _) = oneshot::channel();
        lock(&self.global_waiters).push_back(waiter);
        self.write_locked(&mut writer, &GlobalRequest::keepalive().to_bytes())
            .await
    }

    pub(crate) fn resolve_global(&self, reply: GlobalReply) {
        match lock(&self.global_waiters).pop_front() {
            Some(waiter) => {
                let _ = waiter.send(Ok(reply));
            }
            None => warn!("Global request reply without a pending request"),
        }
    }

    pub(crate) fn deliver_auth(&self, payload: Vec<u8>) {
        match lock(&self.auth_tx).as_ref() {
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => debug!("Dropping authentication message after teardown"),
        }
    }

    pub(crate) fn deliver_accepted(&self, pending: PendingChannel) {
        if let Some(tx) = lock(&self.accept_tx).as_ref() {
            let _ = tx.send(pending);
        }
    }

    /// Ends the session. Idempotent; only the first error is kept.
    pub(crate) async fn teardown(&self, error: SkiffError) {
        let reason = disconnect_reason(&error);
        let notify_peer = !matches!(error, SkiffError::Disconnected { .. } | SkiffError::Io(_));
        let first = {
            let mut fatal = lock(&self.fatal);
            if fatal.is_none() {
                *fatal = Some(error);
                true
            } else {
                false
            }
        };
        let terminal = self.terminal_error();
        if first {
            match reason {
                disconnect::BY_APPLICATION => info!(error = %terminal, "Session closed"),
                _ => warn!(error = %terminal, "Session terminated"),
            }
        }

        if let Ok(mut writer) = tokio::time::timeout(TEARDOWN_GRACE, self.writer.lock()).await {
            if first && notify_peer && !writer.closed {
                let message = Disconnect::new(reason, terminal.to_string()).to_bytes();
                let _ = tokio::time::timeout(TEARDOWN_GRACE, writer.write_packet(&message)).await;
            }
            writer.closed = true;
            writer.pending.clear();
            let _ = tokio::time::timeout(TEARDOWN_GRACE, writer.stream.shutdown()).await;
        }

        self.kex_status.send_modify(|s| s.closed = true);
        self.channels.lock().await.close_all(&terminal);
        for waiter in lock(&self.global_waiters).drain(..) {
            let _ = waiter.send(Err(terminal.duplicate()));
        }
        lock(&self.auth_tx).take();
        lock(&self.accept_tx).take();
        self.set_state(SessionState::Disconnected);
    }
}

fn disconnect_reason(error: &SkiffError) -> u32 {
    match error {
        SkiffError::Disconnected { reason, .. } => *reason,
        SkiffError::Protocol(m) if m.starts_with("No common algorithm") => {
            disconnect::KEY_EXCHANGE_FAILED
        }
        SkiffError::HostKeyRejected(_) => disconnect::HOST_KEY_NOT_VERIFIABLE,
        SkiffError::PacketCorrupt(_) => disconnect::MAC_ERROR,
        SkiffError::Io(_) => disconnect::CONNECTION_LOST,
        _ => disconnect::PROTOCOL_ERROR,
    }
}

struct ReaderGuard(JoinHandle<()>);

impl ReaderGuard {
    fn abort(&self) {
        self.0.abort();
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A connected SSH session.
///
/// Cheap to clone; every clone talks to the same connection. The reader
/// task stops when the last clone (including those held by channels) is
/// dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    guard: Arc<ReaderGuard>,
}

impl Session {
    /// Runs the version exchange and the first key exchange over `stream`.
    ///
    /// `host` and `port` name the server in the host key repository.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, version mismatch, negotiation or
    /// signature failure, host key rejection, and when the handshake does
    /// not finish within `transport.kex_timeout`.
    pub async fn connect<S>(stream: S, host: &str, port: u16, config: SshClientConfig) -> SkiffResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let mut state = SessionState::Disconnected;
        state.transition(SessionState::VersionExchange)?;

        let mut stream = stream;
        let client_version = Version::new(&config.user_agent, None);
        let limit = config.transport.kex_timeout;
        let max_lines = config.transport.max_banner_lines;
        let server_version = tokio::time::timeout(limit, async {
            send_identification(&mut stream, &client_version).await?;
            read_identification(&mut stream, max_lines).await
        })
        .await
        .map_err(|_| SkiffError::Timeout(format!("Version exchange with {} timed out", host)))??;
        info!(host, port, server = %server_version.identification(), "Version exchange complete");

        let (read_half, write_half) = tokio::io::split(stream);
        let (control, control_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (kex_status, _) = watch::channel(KexStatus::default());
        let transport = &config.transport;

        let inner = Arc::new(SessionInner {
            host: host.to_string(),
            port,
            client_version,
            server_version,
            writer: tokio::sync::Mutex::new(Writer {
                stream: Box::new(write_half),
                encoder: PacketEncoder::new(),
                in_kex: false,
                pending: VecDeque::new(),
                closed: false,
            }),
            kex_status,
            state: Mutex::new(state),
            authenticated: AtomicBool::new(false),
            service_accepted: AtomicBool::new(false),
            auth_active: AtomicBool::new(false),
            session_id: OnceLock::new(),
            host_key: OnceLock::new(),
            negotiated: Mutex::new(None),
            channels: tokio::sync::Mutex::new(ChannelTable::new(config.window_size, config.max_packet_size)),
            global_waiters: Mutex::new(VecDeque::new()),
            auth_tx: Mutex::new(Some(auth_tx)),
            auth_rx: tokio::sync::Mutex::new(auth_rx),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            fatal: Mutex::new(None),
            forwarding: Mutex::new(config.forwarding),
            traffic: Mutex::new(RekeyTracker::new(transport.rekey_bytes_limit, transport.rekey_time_limit)),
            rekey_requested: AtomicBool::new(false),
            control,
            config,
        });

        let reader = Reader::new(Arc::clone(&inner), Box::new(read_half), control_rx);
        let handle = tokio::spawn(reader.run());
        let session = Session {
            inner,
            guard: Arc::new(ReaderGuard(handle)),
        };

        let mut status = session.inner.kex_status.subscribe();
        let waited = tokio::time::timeout(limit, async {
            status
                .wait_for(|s| s.completed >= 1 || s.closed)
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(status)) if !status.closed => {
                info!(host, port, "Session established");
                Ok(session)
            }
            Ok(_) => Err(session.inner.terminal_error()),
            Err(_) => {
                session.guard.abort();
                session
                    .inner
                    .teardown(SkiffError::Timeout(format!(
                        "Key exchange with {} did not finish within {:?}",
                        host, limit
                    )))
                    .await;
                Err(session.inner.terminal_error())
            }
        }
    }

    /// Authenticates the user.
    ///
    /// Authentication failures leave the session usable for another
    /// attempt; protocol violations end it.
    pub async fn authenticate(&self, config: &AuthConfig) -> SkiffResult<()> {
        if self.is_authenticated() {
            return Ok(());
        }
        if self.inner.is_closed() {
            return Err(self.inner.terminal_error());
        }

        let link = AuthLink(self.clone());
        self.inner.auth_active.store(true, Ordering::SeqCst);
        let result = auth::authenticate(&link, config).await;
        self.inner.auth_active.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!(user = config.user(), "Authenticated");
                Ok(())
            }
            Err(e) if e.is_fatal() && !self.inner.is_closed() => {
                self.guard.abort();
                self.inner.teardown(e.duplicate()).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Opens a channel and runs its start hook.
    ///
    /// # Errors
    ///
    /// [`SkiffError::ChannelOpenFailed`] when the server refuses,
    /// [`SkiffError::Timeout`] when no answer arrives within
    /// `channel_open_timeout`.
    pub async fn open_channel<I: ChannelInit>(&self, init: I) -> SkiffResult<Channel> {
        if !self.is_authenticated() {
            return Err(SkiffError::Protocol(
                "Channels require an authenticated session".to_string(),
            ));
        }

        let (id, events, waiter, payload) = {
            let mut table = self.inner.channels.lock().await;
            let (id, events, waiter) = table.allocate();
            let payload = encode_open(
                init.channel_type(),
                id,
                table.window_size(),
                table.max_packet_size(),
                &init.open_payload(),
            );
            (id, events, waiter, payload)
        };
        debug!(channel = id, channel_type = init.channel_type(), "Opening channel");

        if let Err(e) = self.inner.send(payload).await {
            self.inner.channels.lock().await.remove(id);
            return Err(e);
        }

        let limit = self.inner.config.channel_open_timeout;
        let confirmed = match tokio::time::timeout(limit, waiter).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(self.inner.terminal_error()),
            Err(_) => {
                self.inner.channels.lock().await.remove(id);
                return Err(SkiffError::Timeout(format!(
                    "Channel {} open not confirmed within {:?}",
                    id, limit
                )));
            }
        };

        let mut channel = Channel::opened(self.clone(), id, init.channel_type(), confirmed, events);
        init.start(&mut channel).await?;
        Ok(channel)
    }

    /// Waits for the next channel the server opened and this session
    /// accepted under its forwarding policy.
    pub async fn accept_channel(&self) -> SkiffResult<Channel> {
        let pending = self
            .inner
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.inner.terminal_error())?;
        Ok(Channel::accepted(self.clone(), pending))
    }

    /// Sends a global request. Returns the reply when one was requested.
    pub async fn global_request(&self, request: GlobalRequest) -> SkiffResult<Option<GlobalReply>> {
        if !request.want_reply {
            self.inner.send(request.to_bytes()).await?;
            return Ok(None);
        }
        let (waiter, reply) = oneshot::channel();
        self.inner.send_inner(&request.to_bytes(), Some(waiter)).await?;
        match reply.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(self.inner.terminal_error()),
        }
    }

    /// Asks the server to listen on `address:port` and forward connections
    /// back. Port 0 lets the server choose; the bound port is returned.
    ///
    /// Accepting `forwarded-tcpip` channels is enabled on success.
    pub async fn request_remote_forward(&self, address: &str, port: u32) -> SkiffResult<u32> {
        match self
            .global_request(GlobalRequest::tcpip_forward(address, port))
            .await?
        {
            Some(GlobalReply::Success(data)) => {
                lock(&self.inner.forwarding).forwarded_tcpip = true;
                let bound = if port == 0 {
                    WireBuffer::from_slice(&data).get_u32()?
                } else {
                    port
                };
                info!(address, port = bound, "Remote forward established");
                Ok(bound)
            }
            _ => Err(SkiffError::Protocol(format!(
                "Server refused remote forward for {}:{}",
                address, port
            ))),
        }
    }

    /// Cancels a remote forward.
    pub async fn cancel_remote_forward(&self, address: &str, port: u32) -> SkiffResult<()> {
        match self
            .global_request(GlobalRequest::cancel_tcpip_forward(address, port))
            .await?
        {
            Some(GlobalReply::Success(_)) => Ok(()),
            _ => Err(SkiffError::Protocol(format!(
                "Server refused to cancel forward for {}:{}",
                address, port
            ))),
        }
    }

    /// Starts a key exchange and waits until it completes.
    pub async fn rekey(&self) -> SkiffResult<()> {
        let mut status = self.inner.kex_status.subscribe();
        let before = status.borrow().completed;
        self.inner
            .control
            .send(Control::Rekey)
            .map_err(|_| self.inner.terminal_error())?;

        let limit = self.inner.config.transport.kex_timeout;
        let waited = tokio::time::timeout(limit, async {
            status
                .wait_for(|s| s.completed > before || s.closed)
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(status)) if !status.closed => Ok(()),
            Ok(_) => Err(self.inner.terminal_error()),
            Err(_) => Err(SkiffError::Timeout(format!(
                "Rekey did not finish within {:?}",
                limit
            ))),
        }
    }

    /// Sends DISCONNECT, stops the reader and releases every waiter.
    pub async fn disconnect(&self, reason: u32, description: &str) -> SkiffResult<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        let sent = self
            .inner
            .send(Disconnect::new(reason, description).to_bytes())
            .await;
        if let Err(e) = &sent {
            debug!(error = %e, "DISCONNECT not delivered");
        }
        self.guard.abort();
        self.inner
            .teardown(SkiffError::Disconnected {
                reason,
                description: description.to_string(),
            })
            .await;
        Ok(())
    }

    pub(crate) async fn send(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.inner.send(payload).await
    }

    /// Returns window for `bytes` the application took from channel `id`.
    pub(crate) async fn consume_channel_data(&self, id: u32, bytes: u32) -> SkiffResult<()> {
        let adjust = self.inner.channels.lock().await.consume(id, bytes);
        if let Some(adjust) = adjust {
            self.inner.send_from_reader(adjust.to_bytes()).await?;
        }
        Ok(())
    }

    /// Sends CLOSE for local channel `id` unless it was already sent.
    pub(crate) async fn close_channel(&self, id: u32) -> SkiffResult<()> {
        let recipient = self.inner.channels.lock().await.mark_close_sent(id);
        if let Some(recipient) = recipient {
            debug!(channel = id, "Closing channel");
            self.inner
                .send(encode_simple(MessageType::ChannelClose, recipient))
                .await?;
        }
        Ok(())
    }

    pub(crate) fn terminal_error(&self) -> SkiffError {
        self.inner.terminal_error()
    }

    /// Server host name as given to [`connect`](Self::connect).
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Our identification.
    pub fn client_version(&self) -> &Version {
        &self.inner.client_version
    }

    /// The server's identification.
    pub fn server_version(&self) -> &Version {
        &self.inner.server_version
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner.session_id.get().cloned()
    }

    /// Server host key blob.
    pub fn host_key(&self) -> Option<Vec<u8>> {
        self.inner.host_key.get().cloned()
    }

    /// `SHA256:` fingerprint of the server host key.
    pub fn host_key_fingerprint(&self) -> Option<String> {
        self.inner.host_key.get().map(|k| fingerprint(k))
    }

    /// Algorithms of the most recent completed key exchange.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        lock(&self.inner.negotiated).clone()
    }

    /// Number of completed key exchanges.
    pub fn kex_count(&self) -> u64 {
        self.inner.kex_status.borrow().completed
    }

    /// Bytes transferred under the current keys.
    pub fn bytes_since_rekey(&self) -> u64 {
        lock(&self.inner.traffic).bytes()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Whether user authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Current policy for server-initiated channels.
    pub fn forwarding_policy(&self) -> ForwardingPolicy {
        *lock(&self.inner.forwarding)
    }

    /// Replaces the policy for server-initiated channels.
    pub fn set_forwarding_policy(&self, policy: ForwardingPolicy) {
        *lock(&self.inner.forwarding) = policy;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("state", &self.state())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Routes the authentication driver through the session.
struct AuthLink(Session);

#[async_trait]
impl AuthTransport for AuthLink {
    async fn send(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.0.inner.send(payload).await
    }

    async fn recv(&self) -> SkiffResult<Vec<u8>> {
        let inner = &self.0.inner;
        inner
            .auth_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| inner.terminal_error())
    }

    fn session_id(&self) -> SkiffResult<Vec<u8>> {
        self.0
            .session_id()
            .ok_or_else(|| SkiffError::Protocol("No session identifier yet".to_string()))
    }

    fn service_accepted(&self) -> bool {
        self.0.inner.service_accepted.load(Ordering::SeqCst)
    }

    fn set_service_accepted(&self) {
        self.0.inner.service_accepted.store(true, Ordering::SeqCst);
    }
}
