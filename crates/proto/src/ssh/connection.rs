//! SSH connection protocol messages (RFC 4254).
//!
//! Encoders and decoders for the channel and global request messages.
//! The flow-controlled [`Channel`](crate::ssh::channel::Channel) handle and
//! the channel table are built on top of these in [`crate::ssh::channel`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::connection::{ChannelMessage, ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen {
//!     channel_type: ChannelType::Session,
//!     sender_channel: 0,
//!     initial_window_size: 2 * 1024 * 1024,
//!     maximum_packet_size: 32 * 1024,
//! };
//! match ChannelMessage::parse(&open.to_bytes()).unwrap() {
//!     ChannelMessage::Open(parsed) => assert_eq!(parsed, open),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use crate::ssh::buffer::WireBuffer;
use crate::ssh::message::{open_failure, MessageType};
use skiff_platform::{SkiffError, SkiffResult};

/// Default local window: 2 MiB.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default local maximum packet size: 32 KiB.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Extended data type for stderr (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

fn message(msg: MessageType) -> WireBuffer {
    let mut buf = WireBuffer::new();
    buf.put_u8(msg as u8);
    buf
}

fn expect(data: &[u8], msg: MessageType) -> SkiffResult<WireBuffer> {
    let mut buf = WireBuffer::from_slice(data);
    let got = buf.get_u8()?;
    if got != msg as u8 {
        return Err(SkiffError::Protocol(format!(
            "Invalid message type: expected {}, got {}",
            msg, got
        )));
    }
    Ok(buf)
}

/// Channel type with its type-specific open data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// `session`
    Session,
    /// `direct-tcpip` (local port forwarding)
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// `forwarded-tcpip` (remote port forwarding)
    ForwardedTcpip {
        /// Address that was connected
        connected_address: String,
        /// Port that was connected
        connected_port: u32,
        /// Originator IP address
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
    AuthAgent,
    /// Anything else, kept so the open can be refused properly.
    Unknown(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
            ChannelType::AuthAgent => "auth-agent@openssh.com",
            ChannelType::Unknown(name) => name,
        }
    }

    /// Type-specific data that follows the common CHANNEL_OPEN fields.
    pub fn type_data(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        match self {
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                buf.put_str(host);
                buf.put_u32(*port);
                buf.put_str(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                buf.put_str(connected_address);
                buf.put_u32(*connected_port);
                buf.put_str(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                buf.put_str(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::Session | ChannelType::AuthAgent | ChannelType::Unknown(_) => {}
        }
        buf.into_vec()
    }

    fn read(name: String, buf: &mut WireBuffer) -> SkiffResult<Self> {
        Ok(match name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: buf.get_utf8()?,
                port: buf.get_u32()?,
                originator_address: buf.get_utf8()?,
                originator_port: buf.get_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: buf.get_utf8()?,
                connected_port: buf.get_u32()?,
                originator_address: buf.get_utf8()?,
                originator_port: buf.get_u32()?,
            },
            "x11" => ChannelType::X11 {
                originator_address: buf.get_utf8()?,
                originator_port: buf.get_u32()?,
            },
            "auth-agent@openssh.com" => ChannelType::AuthAgent,
            _ => ChannelType::Unknown(name),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and type-specific data
    pub channel_type: ChannelType,
    /// Sender channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_open(
            self.channel_type.name(),
            self.sender_channel,
            self.initial_window_size,
            self.maximum_packet_size,
            &self.channel_type.type_data(),
        )
    }

    /// Parses from bytes. Unknown channel types are returned as
    /// [`ChannelType::Unknown`].
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::ChannelOpen)?;
        let name = buf.get_utf8()?;
        let sender_channel = buf.get_u32()?;
        let initial_window_size = buf.get_u32()?;
        let maximum_packet_size = buf.get_u32()?;
        let channel_type = ChannelType::read(name, &mut buf)?;
        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// Encodes CHANNEL_OPEN for any channel type name and raw type data.
pub fn encode_open(
    channel_type: &str,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
    type_data: &[u8],
) -> Vec<u8> {
    let mut buf = message(MessageType::ChannelOpen);
    buf.put_str(channel_type);
    buf.put_u32(sender_channel);
    buf.put_u32(initial_window_size);
    buf.put_u32(maximum_packet_size);
    buf.put_raw(type_data);
    buf.into_vec()
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Channel number of the side that sent the open
    pub recipient_channel: u32,
    /// Channel number of the confirming side
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::ChannelOpenConfirmation);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
            sender_channel: buf.get_u32()?,
            initial_window_size: buf.get_u32()?,
            maximum_packet_size: buf.get_u32()?,
        })
    }
}

/// Human readable text for a channel open failure code.
pub fn open_failure_text(code: u32) -> &'static str {
    match code {
        open_failure::ADMINISTRATIVELY_PROHIBITED => "Administratively prohibited",
        open_failure::CONNECT_FAILED => "Connect failed",
        open_failure::UNKNOWN_CHANNEL_TYPE => "Unknown channel type",
        open_failure::RESOURCE_SHORTAGE => "Resource shortage",
        _ => "Unknown failure",
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Channel number of the side that sent the open
    pub recipient_channel: u32,
    /// Reason code (see [`open_failure`])
    pub reason_code: u32,
    /// Description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the standard text for `reason_code`.
    pub fn new(recipient_channel: u32, reason_code: u32) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description: open_failure_text(reason_code).to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::ChannelOpenFailure);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        buf.put_str(&self.description);
        buf.put_str("");
        buf.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::ChannelOpenFailure)?;
        let recipient_channel = buf.get_u32()?;
        let reason_code = buf.get_u32()?;
        let description = buf.get_utf8()?;
        // Language tag, absent in some implementations.
        if buf.remaining() > 0 {
            buf.get_string()?;
        }
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Bytes to add to the window
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::ChannelWindowAdjust);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
            bytes_to_add: buf.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Payload
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Bytes of framing around the data in one CHANNEL_DATA payload.
    pub const OVERHEAD: usize = 1 + 4 + 4;

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_data(self.recipient_channel, &self.data)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
            data: buf.get_string()?,
        })
    }
}

/// Encodes a CHANNEL_DATA payload without building a [`ChannelData`].
pub fn encode_data(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = WireBuffer::with_capacity(ChannelData::OVERHEAD + data.len());
    buf.put_u8(MessageType::ChannelData as u8);
    buf.put_u32(recipient_channel);
    buf.put_string(data);
    buf.into_vec()
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data type code, [`EXTENDED_DATA_STDERR`] for stderr
    pub data_type: u32,
    /// Payload
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::ChannelExtendedData);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type);
        buf.put_string(&self.data);
        buf.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
            data_type: buf.get_u32()?,
            data: buf.get_string()?,
        })
    }
}

/// Encodes one of the messages whose only field is the recipient channel:
/// EOF, CLOSE, SUCCESS and FAILURE.
pub fn encode_simple(msg: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = message(msg);
    buf.put_u32(recipient_channel);
    buf.into_vec()
}

/// Channel request with its type-specific data (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// `pty-req`
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Width in characters
        width_chars: u32,
        /// Height in rows
        height_rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// `x11-req`
    X11Req {
        /// Forward a single connection only
        single_connection: bool,
        /// Authentication protocol, e.g. `MIT-MAGIC-COOKIE-1`
        auth_protocol: String,
        /// Hex encoded cookie
        auth_cookie: String,
        /// X11 screen number
        screen_number: u32,
    },
    /// `env`
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// `shell`
    Shell,
    /// `exec`
    Exec {
        /// Command to execute
        command: String,
    },
    /// `subsystem`
    Subsystem {
        /// Subsystem name (e.g., "sftp")
        name: String,
    },
    /// `window-change`
    WindowChange {
        /// Width in characters
        width_chars: u32,
        /// Height in rows
        height_rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
    },
    /// `signal`
    Signal {
        /// Signal name without the `SIG` prefix
        name: String,
    },
    /// `exit-status`
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// `exit-signal`
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// `auth-agent-req@openssh.com`
    AgentForward,
    /// Any other request; the data is kept raw.
    Other {
        /// Request name
        name: String,
        /// Raw type-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::X11Req { .. } => "x11-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::AgentForward => "auth-agent-req@openssh.com",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Request and its data
    pub request_type: ChannelRequestType,
    /// Whether the peer must answer with SUCCESS or FAILURE
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::ChannelRequest);
        buf.put_u32(self.recipient_channel);
        buf.put_str(self.request_type.name());
        buf.put_bool(self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                buf.put_str(term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                buf.put_string(modes);
            }
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen_number,
            } => {
                buf.put_bool(*single_connection);
                buf.put_str(auth_protocol);
                buf.put_str(auth_cookie);
                buf.put_u32(*screen_number);
            }
            ChannelRequestType::Env { name, value } => {
                buf.put_str(name);
                buf.put_str(value);
            }
            ChannelRequestType::Exec { command } => buf.put_str(command),
            ChannelRequestType::Subsystem { name } => buf.put_str(name),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::Signal { name } => buf.put_str(name),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                buf.put_str(signal_name);
                buf.put_bool(*core_dumped);
                buf.put_str(error_message);
                buf.put_str("");
            }
            ChannelRequestType::Other { data, .. } => buf.put_raw(data),
            ChannelRequestType::Shell | ChannelRequestType::AgentForward => {}
        }

        buf.into_vec()
    }

    /// Parses from bytes. Unrecognised requests become
    /// [`ChannelRequestType::Other`].
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::ChannelRequest)?;
        let recipient_channel = buf.get_u32()?;
        let name = buf.get_utf8()?;
        let want_reply = buf.get_bool()?;

        let request_type = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: buf.get_utf8()?,
                width_chars: buf.get_u32()?,
                height_rows: buf.get_u32()?,
                width_pixels: buf.get_u32()?,
                height_pixels: buf.get_u32()?,
                modes: buf.get_string()?,
            },
            "x11-req" => ChannelRequestType::X11Req {
                single_connection: buf.get_bool()?,
                auth_protocol: buf.get_utf8()?,
                auth_cookie: buf.get_utf8()?,
                screen_number: buf.get_u32()?,
            },
            "env" => ChannelRequestType::Env {
                name: buf.get_utf8()?,
                value: buf.get_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec {
                command: buf.get_utf8()?,
            },
            "subsystem" => ChannelRequestType::Subsystem {
                name: buf.get_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: buf.get_u32()?,
                height_rows: buf.get_u32()?,
                width_pixels: buf.get_u32()?,
                height_pixels: buf.get_u32()?,
            },
            "signal" => ChannelRequestType::Signal {
                name: buf.get_utf8()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: buf.get_u32()?,
            },
            "exit-signal" => {
                let signal_name = buf.get_utf8()?;
                let core_dumped = buf.get_bool()?;
                let error_message = buf.get_utf8()?;
                if buf.remaining() > 0 {
                    buf.get_string()?;
                }
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                }
            }
            "auth-agent-req@openssh.com" => ChannelRequestType::AgentForward,
            _ => ChannelRequestType::Other {
                name,
                data: buf.remaining_slice().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether the peer must answer
    pub want_reply: bool,
    /// Request-specific data
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// `tcpip-forward` for `address:port`. Port 0 asks the server to pick.
    pub fn tcpip_forward(address: &str, port: u32) -> Self {
        let mut data = WireBuffer::new();
        data.put_str(address);
        data.put_u32(port);
        Self {
            name: "tcpip-forward".to_string(),
            want_reply: true,
            data: data.into_vec(),
        }
    }

    /// `cancel-tcpip-forward` for `address:port`.
    pub fn cancel_tcpip_forward(address: &str, port: u32) -> Self {
        let mut forward = Self::tcpip_forward(address, port);
        forward.name = "cancel-tcpip-forward".to_string();
        forward
    }

    /// `keepalive@openssh.com`
    pub fn keepalive() -> Self {
        Self {
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
            data: Vec::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::GlobalRequest);
        buf.put_str(&self.name);
        buf.put_bool(self.want_reply);
        buf.put_raw(&self.data);
        buf.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::GlobalRequest)?;
        Ok(Self {
            name: buf.get_utf8()?,
            want_reply: buf.get_bool()?,
            data: buf.remaining_slice().to_vec(),
        })
    }
}

/// Answer to a global request that asked for a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalReply {
    /// SSH_MSG_REQUEST_SUCCESS with its response data
    Success(Vec<u8>),
    /// SSH_MSG_REQUEST_FAILURE
    Failure,
}

impl GlobalReply {
    /// Parses REQUEST_SUCCESS or REQUEST_FAILURE.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        match data.first() {
            Some(&b) if b == MessageType::RequestSuccess as u8 => {
                Ok(GlobalReply::Success(data[1..].to_vec()))
            }
            Some(&b) if b == MessageType::RequestFailure as u8 => Ok(GlobalReply::Failure),
            other => Err(SkiffError::Protocol(format!(
                "Expected global request reply, got {:?}",
                other
            ))),
        }
    }
}

/// A decoded channel message (numbers 90-100).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// CHANNEL_OPEN
    Open(ChannelOpen),
    /// CHANNEL_OPEN_CONFIRMATION
    OpenConfirmation(ChannelOpenConfirmation),
    /// CHANNEL_OPEN_FAILURE
    OpenFailure(ChannelOpenFailure),
    /// CHANNEL_WINDOW_ADJUST
    WindowAdjust(ChannelWindowAdjust),
    /// CHANNEL_DATA
    Data(ChannelData),
    /// CHANNEL_EXTENDED_DATA
    ExtendedData(ChannelExtendedData),
    /// CHANNEL_EOF
    Eof(u32),
    /// CHANNEL_CLOSE
    Close(u32),
    /// CHANNEL_REQUEST
    Request(ChannelRequest),
    /// CHANNEL_SUCCESS
    Success(u32),
    /// CHANNEL_FAILURE
    Failure(u32),
}

impl ChannelMessage {
    /// Decodes any channel message.
    pub fn parse(data: &[u8]) -> SkiffResult<Self> {
        let msg = data
            .first()
            .copied()
            .and_then(MessageType::from_u8)
            .ok_or_else(|| SkiffError::Protocol("Not a channel message".to_string()))?;

        let simple = |msg| -> SkiffResult<u32> { expect(data, msg)?.get_u32() };

        Ok(match msg {
            MessageType::ChannelOpen => ChannelMessage::Open(ChannelOpen::from_bytes(data)?),
            MessageType::ChannelOpenConfirmation => {
                ChannelMessage::OpenConfirmation(ChannelOpenConfirmation::from_bytes(data)?)
            }
            MessageType::ChannelOpenFailure => {
                ChannelMessage::OpenFailure(ChannelOpenFailure::from_bytes(data)?)
            }
            MessageType::ChannelWindowAdjust => {
                ChannelMessage::WindowAdjust(ChannelWindowAdjust::from_bytes(data)?)
            }
            MessageType::ChannelData => ChannelMessage::Data(ChannelData::from_bytes(data)?),
            MessageType::ChannelExtendedData => {
                ChannelMessage::ExtendedData(ChannelExtendedData::from_bytes(data)?)
            }
            MessageType::ChannelEof => ChannelMessage::Eof(simple(msg)?),
            MessageType::ChannelClose => ChannelMessage::Close(simple(msg)?),
            MessageType::ChannelRequest => {
                ChannelMessage::Request(ChannelRequest::from_bytes(data)?)
            }
            MessageType::ChannelSuccess => ChannelMessage::Success(simple(msg)?),
            MessageType::ChannelFailure => ChannelMessage::Failure(simple(msg)?),
            other => {
                return Err(SkiffError::Protocol(format!(
                    "{} is not a channel message",
                    other
                )))
            }
        })
    }

    /// Local channel number the message is addressed to, if any.
    pub fn recipient(&self) -> Option<u32> {
        match self {
            ChannelMessage::Open(_) => None,
            ChannelMessage::OpenConfirmation(m) => Some(m.recipient_channel),
            ChannelMessage::OpenFailure(m) => Some(m.recipient_channel),
            ChannelMessage::WindowAdjust(m) => Some(m.recipient_channel),
            ChannelMessage::Data(m) => Some(m.recipient_channel),
            ChannelMessage::ExtendedData(m) => Some(m.recipient_channel),
            ChannelMessage::Request(m) => Some(m.recipient_channel),
            ChannelMessage::Eof(id)
            | ChannelMessage::Close(id)
            | ChannelMessage::Success(id)
            | ChannelMessage::Failure(id) => Some(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(bytes: Vec<u8>) -> ChannelMessage {
        ChannelMessage::parse(&bytes).unwrap()
    }

    #[test]
    fn test_open_direct_tcpip() {
        let open = ChannelOpen {
            channel_type: ChannelType::DirectTcpip {
                host: "example.com".into(),
                port: 80,
                originator_address: "192.168.1.1".into(),
                originator_port: 12345,
            },
            sender_channel: 1,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            maximum_packet_size: DEFAULT_MAX_PACKET_SIZE,
        };
        assert_eq!(reparse(open.to_bytes()), ChannelMessage::Open(open));
    }

    #[test]
    fn test_open_unknown_type_is_kept() {
        let open = ChannelOpen {
            channel_type: ChannelType::Unknown("tun@openssh.com".into()),
            sender_channel: 3,
            initial_window_size: 1,
            maximum_packet_size: 1,
        };
        match reparse(open.to_bytes()) {
            ChannelMessage::Open(parsed) => {
                assert_eq!(parsed.channel_type.name(), "tun@openssh.com");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_failure_text_and_missing_language() {
        let failure = ChannelOpenFailure::new(4, open_failure::ADMINISTRATIVELY_PROHIBITED);
        assert_eq!(failure.description, "Administratively prohibited");

        let mut bytes = failure.to_bytes();
        bytes.truncate(bytes.len() - 4);
        assert_eq!(ChannelOpenFailure::from_bytes(&bytes).unwrap(), failure);
    }

    #[test]
    fn test_simple_messages_and_recipient() {
        for msg in [
            MessageType::ChannelEof,
            MessageType::ChannelClose,
            MessageType::ChannelSuccess,
            MessageType::ChannelFailure,
        ] {
            let parsed = reparse(encode_simple(msg, 9));
            assert_eq!(parsed.recipient(), Some(9));
        }
        assert_eq!(
            reparse(encode_data(2, b"hi")),
            ChannelMessage::Data(ChannelData {
                recipient_channel: 2,
                data: b"hi".to_vec()
            })
        );
    }

    #[test]
    fn test_requests() {
        let cases = vec![
            ChannelRequestType::Exec {
                command: "ls -la".into(),
            },
            ChannelRequestType::PtyReq {
                term: "xterm".into(),
                width_chars: 80,
                height_rows: 24,
                width_pixels: 0,
                height_pixels: 0,
                modes: vec![0],
            },
            ChannelRequestType::WindowChange {
                width_chars: 100,
                height_rows: 40,
                width_pixels: 0,
                height_pixels: 0,
            },
            ChannelRequestType::Signal { name: "INT".into() },
            ChannelRequestType::ExitSignal {
                signal_name: "KILL".into(),
                core_dumped: false,
                error_message: "killed".into(),
            },
            ChannelRequestType::X11Req {
                single_connection: true,
                auth_protocol: "MIT-MAGIC-COOKIE-1".into(),
                auth_cookie: "00ff".into(),
                screen_number: 0,
            },
            ChannelRequestType::Other {
                name: "keepalive@openssh.com".into(),
                data: vec![],
            },
        ];
        for request_type in cases {
            let req = ChannelRequest {
                recipient_channel: 7,
                request_type,
                want_reply: true,
            };
            assert_eq!(reparse(req.to_bytes()), ChannelMessage::Request(req));
        }
    }

    #[test]
    fn test_truncated_request_is_error() {
        let req = ChannelRequest {
            recipient_channel: 7,
            request_type: ChannelRequestType::ExitStatus { exit_status: 1 },
            want_reply: false,
        };
        let bytes = req.to_bytes();
        assert!(ChannelMessage::parse(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_global_requests() {
        let fwd = GlobalRequest::tcpip_forward("0.0.0.0", 0);
        let parsed = GlobalRequest::from_bytes(&fwd.to_bytes()).unwrap();
        assert_eq!(parsed, fwd);
        assert_eq!(
            GlobalRequest::cancel_tcpip_forward("0.0.0.0", 8080).name,
            "cancel-tcpip-forward"
        );

        assert_eq!(
            GlobalReply::from_bytes(&[81, 0, 0, 0x1f, 0x90]).unwrap(),
            GlobalReply::Success(vec![0, 0, 0x1f, 0x90])
        );
        assert_eq!(GlobalReply::from_bytes(&[82]).unwrap(), GlobalReply::Failure);
        assert!(GlobalReply::from_bytes(&[94]).is_err());
    }

    #[test]
    fn test_non_channel_message_rejected() {
        assert!(ChannelMessage::parse(&[]).is_err());
        assert!(ChannelMessage::parse(&[20]).is_err());
    }
}
