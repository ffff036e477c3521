//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides send an identification string before anything else:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string. The
//! client reads and logs them until a line starting with `SSH-` appears.
//!
//! # Security
//!
//! - Maximum line length: 255 characters
//! - Bounded number of pre-identification lines
//! - Only "2.0" and "1.99" protocol versions are accepted
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::Version;
//!
//! let version = Version::new("skiff_0.1.0", Some("client"));
//! assert_eq!(version.to_string(), "SSH-2.0-skiff_0.1.0 client");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum length of an identification line, excluding CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "skiff_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
    /// The identification line exactly as exchanged, without CR LF.
    ///
    /// The exchange hash covers these bytes, so parsing must not
    /// normalise them.
    line: String,
}

impl Version {
    /// Creates a local identification string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::version::Version;
    ///
    /// let version = Version::new("skiff_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-skiff_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let mut line = format!("SSH-2.0-{}", software);
        if let Some(c) = comments {
            line.push(' ');
            line.push_str(c);
        }
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            line,
        }
    }

    /// Returns the default skiff identification.
    pub fn default_skiff() -> Self {
        Self::new(&format!("skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SkiffError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        // SSH-protoversion-softwareversion[ comments]
        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SkiffError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.find(' ') {
            Some(space_pos) => (
                rest[..space_pos].to_string(),
                Some(rest[space_pos + 1..].trim().to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            line: line.to_string(),
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification line as exchanged, without CR LF.
    pub fn identification(&self) -> &str {
        &self.line
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.line).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line)
    }
}

/// Sends the local identification string.
pub async fn send_identification<W>(writer: &mut W, local: &Version) -> SkiffResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&local.to_wire_format()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads lines until the peer's identification string arrives.
///
/// Bytes are read one at a time so nothing past the identification line
/// is consumed; the binary packet protocol starts right after it.
pub async fn read_identification<R>(reader: &mut R, max_lines: usize) -> SkiffResult<Version>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];

    for _ in 0..max_lines.max(1) {
        let mut line = Vec::with_capacity(64);
        loop {
            let n = reader.read(&mut byte).await?;
            if n == 0 {
                return Err(SkiffError::Protocol(
                    "Connection closed during version exchange".to_string(),
                ));
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_VERSION_LENGTH + 1 {
                return Err(SkiffError::Protocol("Version string too long".to_string()));
            }
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let text = String::from_utf8_lossy(&line);
        if text.starts_with("SSH-") {
            return Version::parse(&text);
        }
        debug!("Server banner line: {}", text);
    }

    Err(SkiffError::Protocol(format!(
        "No SSH identification string within {} lines",
        max_lines
    )))
}
