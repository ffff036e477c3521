//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include `mac` or the length field itself
//! - `padding_length` is between 4 and 255
//! - `packet_length + 4` is a multiple of the cipher block size (at least 8).
//!   AEAD ciphers leave the length in the clear, so for them
//!   `packet_length` alone is block aligned
//! - `packet_length + 4` never exceeds [`PACKET_MAX_SIZE`]
//!
//! # Framing
//!
//! [`PacketEncoder`] and [`PacketDecoder`] each own one direction of the
//! transport: cipher, MAC, compression stream and the wrapping sequence
//! number. The decoder is incremental. It buffers raw bytes and yields a
//! payload only once a whole packet has been decrypted and authenticated,
//! so a read can be cancelled at any point without losing framing.
//!
//! A frame with an impossible length or a bad MAC is not rejected on the
//! spot. The decoder first consumes and discards up to [`PACKET_MAX_SIZE`]
//! bytes in total, then fails with [`SkiffError::PacketCorrupt`]. This
//! keeps a peer from learning where the length check tripped.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::{PacketDecoder, PacketEncoder};
//!
//! let mut encoder = PacketEncoder::new();
//! let mut decoder = PacketDecoder::new();
//!
//! let wire = encoder.encode(b"\x05hello").unwrap();
//! decoder.feed(&wire);
//! assert_eq!(decoder.decode().unwrap().unwrap(), b"\x05hello");
//! ```

use crate::ssh::compression::{Compressor, Decompressor};
use crate::ssh::crypto::{NoneCipher, NoneMac, PacketCipher, PacketMac};
use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Largest accepted frame, length field included.
pub const PACKET_MAX_SIZE: usize = 256 * 1024;

/// Smallest `packet_length`: padding length byte plus minimum padding.
pub const MIN_PACKET_LENGTH: usize = 5;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Smallest block size used for alignment.
pub const MIN_BLOCK_SIZE: usize = 8;

/// A plaintext SSH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet padded for the default 8-byte block size.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if the framed packet would exceed
    /// [`PACKET_MAX_SIZE`].
    pub fn new(payload: Vec<u8>) -> SkiffResult<Self> {
        Self::padded(payload, MIN_BLOCK_SIZE, false)
    }

    /// Creates a packet padded for `block_size`.
    ///
    /// When `length_in_clear` is set (AEAD ciphers) the 4-byte length field
    /// is left out of the alignment.
    pub fn padded(payload: Vec<u8>, block_size: usize, length_in_clear: bool) -> SkiffResult<Self> {
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        let unpadded_len = if length_in_clear { 1 } else { 5 } + payload.len();

        let mut padding_len = block_size - (unpadded_len % block_size);
        if padding_len < MIN_PADDING_LEN as usize {
            padding_len += block_size;
        }

        let total_size = 5 + payload.len() + padding_len;
        if total_size > PACKET_MAX_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                total_size, PACKET_MAX_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes the plaintext frame (length field included, no MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Parses a complete plaintext frame (length field included, no MAC).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - Data is too short for the header
    /// - The declared length does not match the data
    /// - Padding length is invalid
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.len() < 5 {
            return Err(SkiffError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;

        if packet_length < MIN_PACKET_LENGTH || packet_length + 4 > PACKET_MAX_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Invalid packet length: {}",
                packet_length
            )));
        }

        if buf.len() != packet_length {
            return Err(SkiffError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;

        if padding_length < MIN_PADDING_LEN as usize {
            return Err(SkiffError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }

        if packet_length < 1 + padding_length {
            return Err(SkiffError::Protocol(format!(
                "Invalid packet: packet_length ({}) too small for padding ({})",
                packet_length, padding_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf[..padding_length].to_vec();

        Ok(Self { payload, padding })
    }
}

/// Byte and packet counts for one direction since the last key change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    /// Wire bytes processed.
    pub bytes: u64,
    /// Packets processed.
    pub packets: u64,
}

/// Outgoing half of the framer.
pub struct PacketEncoder {
    cipher: Box<dyn PacketCipher>,
    mac: Box<dyn PacketMac>,
    compressor: Option<Box<dyn Compressor>>,
    compression_active: bool,
    sequence: u32,
    counters: TrafficCounters,
}

impl PacketEncoder {
    /// Creates an encoder with no cipher, MAC or compression.
    pub fn new() -> Self {
        Self {
            cipher: Box::new(NoneCipher),
            mac: Box::new(NoneMac),
            compressor: None,
            compression_active: false,
            sequence: 0,
            counters: TrafficCounters::default(),
        }
    }

    /// Installs new keys after SSH_MSG_NEWKEYS has been sent.
    ///
    /// The sequence number is not reset. A delayed compressor stays idle
    /// until [`enable_delayed_compression`](Self::enable_delayed_compression).
    pub fn set_keys(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        mac: Box<dyn PacketMac>,
        compressor: Option<Box<dyn Compressor>>,
        delayed: bool,
    ) {
        self.cipher = cipher;
        self.mac = mac;
        // An already running delayed stream keeps running across rekeys.
        let was_active = self.compression_active;
        self.compression_active = compressor.is_some() && (!delayed || was_active);
        self.compressor = compressor;
        self.counters = TrafficCounters::default();
    }

    /// Starts compression for `zlib@openssh.com` after authentication.
    pub fn enable_delayed_compression(&mut self) {
        if self.compressor.is_some() && !self.compression_active {
            debug!("Enabling delayed outgoing compression");
            self.compression_active = true;
        }
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Traffic since the last key change.
    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    /// Frames, authenticates and encrypts one payload.
    pub fn encode(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let payload = match (&mut self.compressor, self.compression_active) {
            (Some(c), true) => c.compress(payload)?,
            _ => payload.to_vec(),
        };

        let aead = self.cipher.is_aead();
        let packet = Packet::padded(payload, self.cipher.block_size(), aead)?;
        let mut frame = packet.to_bytes();

        if aead {
            self.cipher.seal(&mut frame)?;
        } else {
            let mac = self.mac.compute(self.sequence, &frame);
            self.cipher.apply(&mut frame)?;
            frame.extend_from_slice(&mac);
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.counters.packets += 1;
        self.counters.bytes += frame.len() as u64;
        Ok(frame)
    }
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEncoder")
            .field("sequence", &self.sequence)
            .field("block_size", &self.cipher.block_size())
            .field("compression_active", &self.compression_active)
            .finish()
    }
}

enum DecodeState {
    /// Waiting for the first block of a packet.
    Header,
    /// First block decrypted; waiting for the rest.
    Body {
        first_block: Vec<u8>,
        packet_length: usize,
    },
    /// Swallowing bytes before reporting corruption.
    Discard { remaining: usize, reason: String },
    /// Corruption was reported; the stream is unusable.
    Failed(String),
}

/// Incoming half of the framer.
pub struct PacketDecoder {
    buffer: BytesMut,
    cipher: Box<dyn PacketCipher>,
    mac: Box<dyn PacketMac>,
    decompressor: Option<Box<dyn Decompressor>>,
    compression_active: bool,
    sequence: u32,
    state: DecodeState,
    counters: TrafficCounters,
}

impl PacketDecoder {
    /// Creates a decoder with no cipher, MAC or compression.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            cipher: Box::new(NoneCipher),
            mac: Box::new(NoneMac),
            decompressor: None,
            compression_active: false,
            sequence: 0,
            state: DecodeState::Header,
            counters: TrafficCounters::default(),
        }
    }

    /// Installs new keys after SSH_MSG_NEWKEYS has been received.
    pub fn set_keys(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        mac: Box<dyn PacketMac>,
        decompressor: Option<Box<dyn Decompressor>>,
        delayed: bool,
    ) {
        self.cipher = cipher;
        self.mac = mac;
        let was_active = self.compression_active;
        self.compression_active = decompressor.is_some() && (!delayed || was_active);
        self.decompressor = decompressor;
        self.counters = TrafficCounters::default();
    }

    /// Starts decompression for `zlib@openssh.com` after authentication.
    pub fn enable_delayed_compression(&mut self) {
        if self.decompressor.is_some() && !self.compression_active {
            debug!("Enabling delayed incoming compression");
            self.compression_active = true;
        }
    }

    /// Sequence number the next packet is expected to carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Overrides the incoming sequence number.
    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    /// Traffic since the last key change.
    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    /// Returns true while corrupt input is being discarded.
    pub fn is_discarding(&self) -> bool {
        matches!(self.state, DecodeState::Discard { .. })
    }

    /// Appends raw bytes received from the peer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn block_size(&self) -> usize {
        self.cipher.block_size().max(MIN_BLOCK_SIZE)
    }

    fn start_discard(&mut self, consumed: usize, reason: String) {
        warn!("Corrupt packet ({}), discarding before disconnect", reason);
        self.state = DecodeState::Discard {
            remaining: PACKET_MAX_SIZE.saturating_sub(consumed),
            reason,
        };
    }

    fn length_is_valid(&self, packet_length: usize, aead: bool) -> bool {
        let aligned = if aead {
            packet_length
        } else {
            packet_length + 4
        };
        packet_length >= MIN_PACKET_LENGTH
            && packet_length + 4 <= PACKET_MAX_SIZE
            && aligned % self.block_size() == 0
    }

    /// Attempts to decode one packet from buffered bytes.
    ///
    /// Returns `Ok(None)` when more input is needed.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::PacketCorrupt`] once a corrupt frame has been
    ///   fully discarded
    /// - [`SkiffError::Protocol`] for malformed padding or compression
    pub fn decode(&mut self) -> SkiffResult<Option<Vec<u8>>> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Header) {
                DecodeState::Failed(reason) => {
                    self.state = DecodeState::Failed(reason.clone());
                    return Err(SkiffError::PacketCorrupt(reason));
                }
                DecodeState::Discard { remaining, reason } => {
                    let n = remaining.min(self.buffer.len());
                    let discarded = self.buffer.split_to(n);
                    self.mac.update(&discarded);
                    let remaining = remaining - n;
                    if remaining > 0 {
                        self.state = DecodeState::Discard { remaining, reason };
                        return Ok(None);
                    }
                    // The MAC over the discarded bytes is computed but never trusted.
                    let _ = self.mac.finish();
                    self.state = DecodeState::Failed(reason.clone());
                    return Err(SkiffError::PacketCorrupt(reason));
                }
                DecodeState::Header => {
                    if self.cipher.is_aead() {
                        return self.decode_aead();
                    }
                    let block = self.block_size();
                    if self.buffer.len() < block {
                        return Ok(None);
                    }
                    let mut first_block = self.buffer.split_to(block).to_vec();
                    self.cipher.apply(&mut first_block)?;
                    let packet_length = u32::from_be_bytes([
                        first_block[0],
                        first_block[1],
                        first_block[2],
                        first_block[3],
                    ]) as usize;

                    if !self.length_is_valid(packet_length, false) {
                        self.mac.init(self.sequence);
                        self.mac.update(&first_block);
                        self.start_discard(block, format!("bad packet length {}", packet_length));
                        continue;
                    }
                    self.state = DecodeState::Body {
                        first_block,
                        packet_length,
                    };
                }
                DecodeState::Body {
                    first_block,
                    packet_length,
                } => {
                    let rest_len = 4 + packet_length - first_block.len();
                    let mac_len = self.mac.mac_len();
                    if self.buffer.len() < rest_len + mac_len {
                        self.state = DecodeState::Body {
                            first_block,
                            packet_length,
                        };
                        return Ok(None);
                    }

                    let mut rest = self.buffer.split_to(rest_len).to_vec();
                    self.cipher.apply(&mut rest)?;
                    let received_mac = self.buffer.split_to(mac_len);

                    let mut frame = first_block;
                    frame.extend_from_slice(&rest);

                    if !self.mac.verify(self.sequence, &frame, &received_mac) {
                        self.mac.init(self.sequence);
                        self.start_discard(frame.len() + mac_len, "MAC mismatch".to_string());
                        continue;
                    }

                    return self.finish_packet(frame, mac_len).map(Some);
                }
            }
        }
    }

    fn decode_aead(&mut self) -> SkiffResult<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let packet_length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if !self.length_is_valid(packet_length, true) {
            let _ = self.buffer.split_to(4);
            self.mac.init(self.sequence);
            self.start_discard(4, format!("bad packet length {}", packet_length));
            return self.decode();
        }

        let tag_len = self.cipher.tag_len();
        let total = 4 + packet_length + tag_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total).to_vec();
        if self.cipher.open(&mut frame).is_err() {
            self.mac.init(self.sequence);
            self.start_discard(total, "AEAD tag mismatch".to_string());
            return self.decode();
        }

        self.finish_packet(frame, tag_len).map(Some)
    }

    fn finish_packet(&mut self, frame: Vec<u8>, trailer_len: usize) -> SkiffResult<Vec<u8>> {
        let wire_len = frame.len() + trailer_len;
        let packet = Packet::from_bytes(&frame)?;

        self.sequence = self.sequence.wrapping_add(1);
        self.counters.packets += 1;
        self.counters.bytes += wire_len as u64;

        let payload = packet.into_payload();
        match (&mut self.decompressor, self.compression_active) {
            (Some(d), true) => d.decompress(&payload),
            _ => Ok(payload),
        }
    }

    /// Reads from `reader` until one packet is decoded.
    ///
    /// Cancel safe: dropping the future loses no bytes, everything read so
    /// far stays buffered in the decoder.
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> SkiffResult<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(payload) = self.decode()? {
                return Ok(payload);
            }
            self.buffer.reserve(8 * 1024);
            let n = reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if let DecodeState::Discard { reason, .. } = &self.state {
                    return Err(SkiffError::PacketCorrupt(reason.clone()));
                }
                return Err(SkiffError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Connection closed by peer",
                )));
            }
        }
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDecoder")
            .field("sequence", &self.sequence)
            .field("buffered", &self.buffer.len())
            .field("discarding", &self.is_discarding())
            .finish()
    }
}
