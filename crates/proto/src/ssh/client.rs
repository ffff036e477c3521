//! SSH client facade.
//!
//! [`SshClient`] wraps a [`Session`] with the operations most callers
//! need: connect over TCP, authenticate, run a command and collect its
//! output, open shells and tunnels.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::client::SshClient;
//! use skiff_proto::ssh::config::SshClientConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SshClient::connect("127.0.0.1:22", SshClientConfig::default()).await?;
//! client.authenticate_password("user", "password").await?;
//!
//! let output = client.execute("ls -la").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```

use crate::ssh::channel::{Channel, ChannelEvent, ChannelKind, SessionRequest};
use crate::ssh::config::{AuthConfig, SshClientConfig};
use crate::ssh::connection::EXTENDED_DATA_STDERR;
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::identity::Identity;
use crate::ssh::message::disconnect;
use crate::ssh::session::Session;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Output of [`SshClient::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout.
    pub stdout: Vec<u8>,
    /// Everything the command wrote to stderr.
    pub stderr: Vec<u8>,
    /// Exit status, if the server reported one.
    pub exit_status: Option<u32>,
    /// Exit signal, if the command was killed by one.
    pub exit_signal: Option<String>,
}

impl ExecOutput {
    /// True if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// SSH client.
#[derive(Debug, Clone)]
pub struct SshClient {
    session: Session,
    server_addr: String,
}

impl SshClient {
    /// Connects to `addr` (`host:port`) over TCP and runs the handshake.
    pub async fn connect(addr: &str, config: SshClientConfig) -> SkiffResult<Self> {
        let (host, port) = split_addr(addr)?;
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SkiffError::Timeout(format!("Connecting to {} timed out", addr)))??;
        stream.set_nodelay(true)?;
        debug!(addr, "TCP connection established");

        let session = Session::connect(stream, &host, port, config).await?;
        Ok(Self {
            session,
            server_addr: addr.to_string(),
        })
    }

    /// Runs the handshake over an existing stream.
    pub async fn connect_stream<S>(stream: S, host: &str, port: u16, config: SshClientConfig) -> SkiffResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session = Session::connect(stream, host, port, config).await?;
        Ok(Self {
            session,
            server_addr: format!("{}:{}", host, port),
        })
    }

    /// Authenticates with full control over methods and credentials.
    pub async fn authenticate(&self, auth: &AuthConfig) -> SkiffResult<()> {
        self.session.authenticate(auth).await
    }

    /// Authenticates with a password only.
    pub async fn authenticate_password(&self, user: &str, password: &str) -> SkiffResult<()> {
        let auth = AuthConfig::new(user)
            .with_methods(&["password", "keyboard-interactive"])
            .with_password(password);
        self.authenticate(&auth).await
    }

    /// Authenticates with one identity only.
    pub async fn authenticate_publickey(&self, user: &str, identity: Arc<dyn Identity>) -> SkiffResult<()> {
        let auth = AuthConfig::new(user)
            .with_methods(&["publickey"])
            .with_identity(identity);
        self.authenticate(&auth).await
    }

    /// Runs `command` and collects its output until the channel closes.
    pub async fn execute(&self, command: &str) -> SkiffResult<ExecOutput> {
        let mut channel = self
            .session
            .open_channel(ChannelKind::Session(SessionRequest::Exec(command.to_string())))
            .await?;
        debug!(channel = channel.local_id(), command, "Executing");

        let mut output = ExecOutput::default();
        while let Some(event) = channel.next_event().await {
            match event {
                ChannelEvent::Data(data) => output.stdout.extend_from_slice(&data),
                ChannelEvent::ExtendedData { data_type, data } if data_type == EXTENDED_DATA_STDERR => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelEvent::ExitStatus(status) => output.exit_status = Some(status),
                ChannelEvent::ExitSignal { signal_name, .. } => output.exit_signal = Some(signal_name),
                ChannelEvent::Close => break,
                _ => {}
            }
        }
        if channel.state() != crate::ssh::channel::ChannelState::Closed {
            return Err(self.session.terminal_error());
        }
        debug!(
            command,
            exit_status = ?output.exit_status,
            stdout = output.stdout.len(),
            stderr = output.stderr.len(),
            "Command finished"
        );
        Ok(output)
    }

    /// Opens a session channel with a pseudo terminal and a shell.
    pub async fn open_shell(&self, term: &str, width: u32, height: u32) -> SkiffResult<Channel> {
        let mut channel = self
            .session
            .open_channel(ChannelKind::Session(SessionRequest::None))
            .await?;
        if !channel.request_pty(term, width, height).await? {
            debug!(channel = channel.local_id(), "Server refused pty");
        }
        channel.shell().await?;
        Ok(channel)
    }

    /// Opens a subsystem channel such as `sftp`.
    pub async fn open_subsystem(&self, name: &str) -> SkiffResult<Channel> {
        self.session
            .open_channel(ChannelKind::Session(SessionRequest::Subsystem(name.to_string())))
            .await
    }

    /// Opens a `direct-tcpip` tunnel to `host:port` through the server.
    pub async fn open_direct_tcpip(&self, host: &str, port: u32, originator: (&str, u32)) -> SkiffResult<Channel> {
        self.session
            .open_channel(ChannelKind::DirectTcpip {
                host: host.to_string(),
                port,
                originator_address: originator.0.to_string(),
                originator_port: originator.1,
            })
            .await
    }

    /// Asks the server to forward connections on `address:port` back to
    /// us. Returns the bound port.
    pub async fn request_remote_forward(&self, address: &str, port: u32) -> SkiffResult<u32> {
        self.session.request_remote_forward(address, port).await
    }

    /// Cancels a remote forward.
    pub async fn cancel_remote_forward(&self, address: &str, port: u32) -> SkiffResult<()> {
        self.session.cancel_remote_forward(address, port).await
    }

    /// Waits for the next forwarded connection.
    pub async fn accept_forwarded(&self) -> SkiffResult<Channel> {
        self.session.accept_channel().await
    }

    /// Forces a key exchange.
    pub async fn rekey(&self) -> SkiffResult<()> {
        self.session.rekey().await
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Address given to [`connect`](Self::connect).
    pub fn server_address(&self) -> &str {
        &self.server_addr
    }

    /// Whether authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Server host key blob.
    pub fn server_host_key(&self) -> Option<Vec<u8>> {
        self.session.host_key()
    }

    /// Negotiated host key algorithm.
    pub fn server_host_key_algorithm(&self) -> Option<HostKeyAlgorithm> {
        self.session
            .negotiated()
            .and_then(|n| HostKeyAlgorithm::from_name(&n.host_key))
    }

    /// `SHA256:` fingerprint of the server host key.
    pub fn server_host_key_fingerprint(&self) -> Option<String> {
        self.session.host_key_fingerprint()
    }

    /// Disconnects with `BY_APPLICATION`.
    pub async fn disconnect(&self) -> SkiffResult<()> {
        info!(addr = %self.server_addr, "Disconnecting");
        self.session
            .disconnect(disconnect::BY_APPLICATION, "Client disconnecting")
            .await
    }
}

/// Splits `host:port`, accepting `[v6]:port`.
fn split_addr(addr: &str) -> SkiffResult<(String, u16)> {
    let invalid = || SkiffError::Config(format!("Expected host:port, got {:?}", addr));
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_addr() {
        assert_eq!(split_addr("example.com:22").unwrap(), ("example.com".to_string(), 22));
        assert_eq!(split_addr("[::1]:2222").unwrap(), ("::1".to_string(), 2222));
        assert!(split_addr("example.com").is_err());
        assert!(split_addr(":22").is_err());
        assert!(split_addr("host:99999").is_err());
    }

    #[test]
    fn test_exec_output_success() {
        let mut output = ExecOutput::default();
        assert!(!output.success());
        output.exit_status = Some(0);
        assert!(output.success());
        output.exit_status = Some(1);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = SshClient::connect(&addr.to_string(), SshClientConfig::default()).await;
        assert!(result.is_err());
    }
}
