//! SSH wire encoding buffer.
//!
//! [`WireBuffer`] is a growable byte buffer with a read cursor. It implements
//! the data type representations of RFC 4251 Section 5:
//!
//! - `byte`, `boolean`, `uint32`, `uint64`
//! - `string` (uint32 length followed by raw bytes)
//! - `mpint` (two's complement, big-endian, minimal length)
//! - `name-list` (comma-separated ASCII names inside a string)
//!
//! Writes always append at the end. Reads advance the cursor and fail with
//! a protocol error instead of panicking when the buffer runs out.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::buffer::WireBuffer;
//!
//! let mut buf = WireBuffer::new();
//! buf.put_u8(94);
//! buf.put_u32(7);
//! buf.put_string(b"hello");
//!
//! let mut reader = WireBuffer::from_slice(buf.as_slice());
//! assert_eq!(reader.get_u8().unwrap(), 94);
//! assert_eq!(reader.get_u32().unwrap(), 7);
//! assert_eq!(reader.get_string().unwrap(), b"hello");
//! ```

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Growable byte buffer with big-endian SSH encoders and decoders.
#[derive(Clone, Default)]
pub struct WireBuffer {
    data: BytesMut,
    pos: usize,
}

impl WireBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            pos: 0,
        }
    }

    /// Creates an empty buffer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Creates a buffer holding a copy of `data`, cursor at the start.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            pos: 0,
        }
    }

    /// Returns the whole buffer contents, independent of the cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the buffer and returns its contents.
    pub fn into_vec(self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Total number of bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current read cursor.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Unread bytes, starting at the cursor.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Moves the cursor back to the start.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Discards all contents and resets the cursor.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    // ---- encoders ----

    /// Appends a single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.data.put_u8(v);
    }

    /// Appends a boolean (0 or 1).
    pub fn put_bool(&mut self, v: bool) {
        self.data.put_u8(u8::from(v));
    }

    /// Appends a big-endian uint32.
    pub fn put_u32(&mut self, v: u32) {
        self.data.put_u32(v);
    }

    /// Appends a big-endian uint64.
    pub fn put_u64(&mut self, v: u64) {
        self.data.put_u64(v);
    }

    /// Appends raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Appends an SSH `string`.
    pub fn put_string(&mut self, bytes: &[u8]) {
        self.data.put_u32(bytes.len() as u32);
        self.data.put_slice(bytes);
    }

    /// Appends a UTF-8 string as an SSH `string`.
    pub fn put_str(&mut self, s: &str) {
        self.put_string(s.as_bytes());
    }

    /// Appends an SSH `name-list`.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined);
    }

    /// Appends a positive big-endian magnitude as an SSH `mpint`.
    ///
    /// Leading zero bytes are stripped; a zero byte is prepended when the
    /// most significant bit of the first byte is set.
    pub fn put_mpint(&mut self, magnitude: &[u8]) {
        let encoded = encode_mpint(magnitude);
        self.put_string(&encoded);
    }

    // ---- decoders ----

    fn take(&mut self, n: usize) -> SkiffResult<&[u8]> {
        if self.remaining() < n {
            return Err(SkiffError::Protocol(format!(
                "buffer underflow: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }

    /// Advances the cursor by `n` bytes.
    pub fn skip(&mut self, n: usize) -> SkiffResult<()> {
        self.take(n).map(|_| ())
    }

    /// Reads a single byte.
    pub fn get_u8(&mut self) -> SkiffResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a boolean; any non-zero byte is true.
    pub fn get_bool(&mut self) -> SkiffResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn get_u32(&mut self) -> SkiffResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn get_u64(&mut self) -> SkiffResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads a uint64 and reinterprets its bits as signed.
    ///
    /// Values above `i64::MAX` come back negative; callers that store
    /// sizes or offsets should prefer [`get_u64`](Self::get_u64).
    pub fn get_i64(&mut self) -> SkiffResult<i64> {
        Ok(self.get_u64()? as i64)
    }

    /// Reads `n` raw bytes.
    pub fn get_raw(&mut self, n: usize) -> SkiffResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Reads an SSH `string` as raw bytes.
    pub fn get_string(&mut self) -> SkiffResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads an SSH `string` and validates it as UTF-8.
    pub fn get_utf8(&mut self) -> SkiffResult<String> {
        let bytes = self.get_string()?;
        String::from_utf8(bytes)
            .map_err(|_| SkiffError::Protocol("invalid UTF-8 in string field".to_string()))
    }

    /// Reads an SSH `name-list`. An empty string yields an empty list.
    pub fn get_name_list(&mut self) -> SkiffResult<Vec<String>> {
        let s = self.get_utf8()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(|n| n.to_string()).collect())
    }

    /// Reads an SSH `mpint` and returns its positive magnitude without
    /// the sign byte.
    pub fn get_mpint(&mut self) -> SkiffResult<Vec<u8>> {
        let raw = self.get_string()?;
        if let Some(&first) = raw.first() {
            if first & 0x80 != 0 {
                return Err(SkiffError::Protocol(
                    "negative mpint not supported".to_string(),
                ));
            }
        }
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(raw[start..].to_vec())
    }
}

impl std::fmt::Debug for WireBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireBuffer")
            .field("len", &self.data.len())
            .field("pos", &self.pos)
            .finish()
    }
}

impl AsRef<[u8]> for WireBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Encodes a positive big-endian magnitude in mpint body form.
///
/// The result excludes the uint32 length prefix.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_round_trip() {
        let mut buf = WireBuffer::new();
        buf.put_u8(0xAB);
        buf.put_bool(true);
        buf.put_u32(0xDEADBEEF);
        buf.put_u64(u64::MAX - 1);

        assert_eq!(
            &buf.as_slice()[..6],
            &[0xAB, 0x01, 0xDE, 0xAD, 0xBE, 0xEF]
        );

        assert_eq!(buf.get_u8().unwrap(), 0xAB);
        assert!(buf.get_bool().unwrap());
        assert_eq!(buf.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(buf.get_u64().unwrap(), u64::MAX - 1);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_signed_u64_view() {
        let mut buf = WireBuffer::new();
        buf.put_u64(u64::MAX);
        assert_eq!(buf.get_i64().unwrap(), -1);
    }

    #[test]
    fn test_string_layout() {
        let mut buf = WireBuffer::new();
        buf.put_str("testing");
        assert_eq!(
            buf.as_slice(),
            &[0, 0, 0, 7, b't', b'e', b's', b't', b'i', b'n', b'g']
        );
        assert_eq!(buf.get_utf8().unwrap(), "testing");
    }

    #[test]
    fn test_name_list() {
        let mut buf = WireBuffer::new();
        buf.put_name_list(&["zlib", "none"]);
        buf.put_name_list::<&str>(&[]);

        assert_eq!(buf.get_name_list().unwrap(), vec!["zlib", "none"]);
        assert!(buf.get_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_mpint_examples_from_rfc4251() {
        // RFC 4251 Section 5 examples
        assert_eq!(encode_mpint(&[]), Vec::<u8>::new());
        assert_eq!(
            encode_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]),
            vec![0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
        assert_eq!(encode_mpint(&[0x80]), vec![0x00, 0x80]);
        assert_eq!(encode_mpint(&[0x00, 0x00, 0x7f]), vec![0x7f]);
    }

    #[test]
    fn test_mpint_round_trip_strips_sign_byte() {
        let mut buf = WireBuffer::new();
        buf.put_mpint(&[0xff, 0x01]);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 3, 0x00, 0xff, 0x01]);
        assert_eq!(buf.get_mpint().unwrap(), vec![0xff, 0x01]);
    }

    #[test]
    fn test_negative_mpint_rejected() {
        let mut buf = WireBuffer::from_slice(&[0, 0, 0, 1, 0x80]);
        assert!(matches!(buf.get_mpint(), Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_underflow_is_error() {
        let mut buf = WireBuffer::from_slice(&[0, 0, 0, 9, 1, 2]);
        let err = buf.get_string().unwrap_err();
        assert!(matches!(err, SkiffError::Protocol(_)));
        assert!(err.to_string().contains("buffer underflow"));

        let mut empty = WireBuffer::new();
        assert!(empty.get_u8().is_err());
        assert!(empty.get_u32().is_err());
    }

    #[test]
    fn test_cursor_controls() {
        let mut buf = WireBuffer::from_slice(&[1, 2, 3, 4]);
        buf.skip(2).unwrap();
        assert_eq!(buf.position(), 2);
        assert_eq!(buf.remaining_slice(), &[3, 4]);
        buf.rewind();
        assert_eq!(buf.get_u8().unwrap(), 1);
        assert!(buf.skip(4).is_err());
    }

    #[test]
    fn test_growth() {
        let mut buf = WireBuffer::with_capacity(2);
        for i in 0..1000u32 {
            buf.put_u32(i);
        }
        assert_eq!(buf.len(), 4000);
        buf.skip(4 * 999).unwrap();
        assert_eq!(buf.get_u32().unwrap(), 999);
    }
}
