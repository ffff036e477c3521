//! Scripted SSH server for the integration tests.
//!
//! Implements just enough of the server side of the transport, auth and
//! connection protocols to drive a real client [`Session`] over an
//! in-memory pipe. Each test scripts the server explicitly, so the
//! order of messages on the wire is part of what gets asserted.

#![allow(dead_code)]

use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::ssh::auth::{AuthFailure, AuthRequest};
use skiff_proto::ssh::buffer::WireBuffer;
use skiff_proto::ssh::compression::DEFAULT_LEVEL;
use skiff_proto::ssh::config::SshClientConfig;
use skiff_proto::ssh::connection::{
    encode_simple, ChannelOpen, ChannelOpenConfirmation, ChannelRequest, ChannelRequestType,
};
use skiff_proto::ssh::crypto::CipherDirection;
use skiff_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use skiff_proto::ssh::kex::{negotiate_with, AlgorithmPreferences, KexInit, NegotiatedAlgorithms, NewKeys};
use skiff_proto::ssh::kex_dh::{
    exchange_hash, DhExchange, EcdhExchange, ExchangeHashInput, ExchangeValues, KexFlavor,
    KexMethod, KexReply, KeyLengths, SessionKeys,
};
use skiff_proto::ssh::known_hosts::TrustPolicy;
use skiff_proto::ssh::packet::{PacketDecoder, PacketEncoder};
use skiff_proto::ssh::registry::AlgorithmRegistry;
use skiff_proto::ssh::session::Session;
use skiff_proto::ssh::version::{read_identification, send_identification, Version};
use skiff_proto::ssh::MessageType;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};

/// Channel number the server uses for the first channel it confirms.
pub const SERVER_CHANNEL: u32 = 7;

/// Host name the client connects to.
pub const TEST_HOST: &str = "test.local";

/// Algorithms offered by the scripted server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub kex: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub compression: Vec<String>,
    pub software: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            kex: names(&["curve25519-sha256"]),
            ciphers: names(&["aes128-ctr"]),
            macs: names(&["hmac-sha2-256"]),
            compression: names(&["none"]),
            software: "TestServer_1.0".to_string(),
        }
    }
}

impl ServerOptions {
    pub fn with_kex(mut self, kex: &[&str]) -> Self {
        self.kex = names(kex);
        self
    }

    pub fn with_ciphers(mut self, ciphers: &[&str]) -> Self {
        self.ciphers = names(ciphers);
        self
    }

    pub fn with_macs(mut self, macs: &[&str]) -> Self {
        self.macs = names(macs);
        self
    }

    pub fn with_compression(mut self, compression: &[&str]) -> Self {
        self.compression = names(compression);
        self
    }
}

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Client configuration that trusts any host key and fails fast.
pub fn client_config() -> SshClientConfig {
    let mut config = SshClientConfig::default();
    config.trust_policy = TrustPolicy::No;
    config.transport.kex_timeout = Duration::from_secs(10);
    config.channel_open_timeout = Duration::from_secs(5);
    config
}

/// Routes client logs to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn protocol_error(what: impl Into<String>) -> SkiffError {
    SkiffError::Protocol(what.into())
}

/// The server end of one connection.
pub struct TestServer {
    stream: DuplexStream,
    encoder: PacketEncoder,
    decoder: PacketDecoder,
    options: ServerOptions,
    registry: AlgorithmRegistry,
    host_key: Ed25519HostKey,
    client_version: Version,
    server_version: Version,
    session_id: Option<Vec<u8>>,
    authenticated: bool,
    negotiated: Option<NegotiatedAlgorithms>,
}

impl TestServer {
    /// Exchanges versions. Key exchange is left to the caller.
    pub async fn handshake_versions(mut stream: DuplexStream, options: ServerOptions) -> SkiffResult<Self> {
        let server_version = Version::new(&options.software, None);
        send_identification(&mut stream, &server_version).await?;
        let client_version = read_identification(&mut stream, 16).await?;
        Ok(Self {
            stream,
            encoder: PacketEncoder::new(),
            decoder: PacketDecoder::new(),
            options,
            registry: AlgorithmRegistry::with_defaults(),
            host_key: Ed25519HostKey::generate()?,
            client_version,
            server_version,
            session_id: None,
            authenticated: false,
            negotiated: None,
        })
    }

    /// Exchanges versions and runs the first key exchange.
    pub async fn accept(stream: DuplexStream, options: ServerOptions) -> SkiffResult<Self> {
        let mut server = Self::handshake_versions(stream, options).await?;
        server.key_exchange(None).await?;
        Ok(server)
    }

    pub fn host_key(&self) -> &Ed25519HostKey {
        &self.host_key
    }

    /// Signs later key exchanges with `key`.
    pub fn replace_host_key(&mut self, key: Ed25519HostKey) {
        self.host_key = key;
    }

    pub fn client_version(&self) -> &Version {
        &self.client_version
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Sequence number of the last packet received.
    pub fn last_received_sequence(&self) -> u32 {
        self.decoder.sequence().wrapping_sub(1)
    }

    /// Sequence number the next sent packet will carry.
    pub fn next_send_sequence(&self) -> u32 {
        self.encoder.sequence()
    }

    pub async fn send(&mut self, payload: &[u8]) -> SkiffResult<()> {
        let bytes = self.encoder.encode(payload)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> SkiffResult<Vec<u8>> {
        self.decoder.read_packet(&mut self.stream).await
    }

    /// Receives the next packet and checks its message number.
    pub async fn expect(&mut self, msg: MessageType) -> SkiffResult<Vec<u8>> {
        let payload = self.recv().await?;
        match payload.first() {
            Some(&b) if b == msg as u8 => Ok(payload),
            other => Err(protocol_error(format!(
                "Expected {}, got {:?}",
                msg.name(),
                other
            ))),
        }
    }

    /// Sends our KEXINIT and runs one key exchange as the server.
    ///
    /// Pass the client's KEXINIT when it has already been read, as in a
    /// client-initiated rekey.
    pub async fn key_exchange(&mut self, client_kexinit: Option<Vec<u8>>) -> SkiffResult<()> {
        let prefs = AlgorithmPreferences {
            kex: self.options.kex.clone(),
            host_key: names(&["ssh-ed25519"]),
            ciphers: self.options.ciphers.clone(),
            macs: self.options.macs.clone(),
            compression: self.options.compression.clone(),
        };
        let ours = KexInit::from_preferences(&prefs);
        let server_kexinit = ours.to_bytes();
        self.send(&server_kexinit).await?;

        let client_kexinit = match client_kexinit {
            Some(payload) => payload,
            None => self.expect(MessageType::KexInit).await?,
        };
        let client = KexInit::from_bytes(&client_kexinit)?;
        let registry = &self.registry;
        let negotiated = negotiate_with(&client, &ours, |name| {
            registry.cipher(name).map_or(false, |c| c.tag_len() > 0)
        })?;
        let method = KexMethod::from_name(&negotiated.kex)
            .ok_or_else(|| protocol_error(format!("Unknown kex {}", negotiated.kex)))?;

        let host_key_blob = self.host_key.public_key_bytes();
        let client_version = self.client_version.identification().to_string();
        let server_version = self.server_version.identification().to_string();
        let input = ExchangeHashInput {
            client_version: &client_version,
            server_version: &server_version,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
            host_key: &host_key_blob,
        };
        let hash = method.hash();

        let (server_public, shared_secret, h) = match method.flavor() {
            KexFlavor::Ecdh => {
                let init = self.expect(MessageType::KexdhInit).await?;
                let mut buf = WireBuffer::from_slice(&init[1..]);
                let q_c = buf.get_string()?;
                let exchange = EcdhExchange::new(method)?;
                let q_s = exchange.public_key().to_vec();
                let k = exchange.compute_shared_secret(&q_c)?;
                let h = exchange_hash(hash, &input, &ExchangeValues::Ecdh { q_c: &q_c, q_s: &q_s }, &k);
                (q_s, k, h)
            }
            KexFlavor::FixedGroup => {
                let init = self.expect(MessageType::KexdhInit).await?;
                let mut buf = WireBuffer::from_slice(&init[1..]);
                let e = buf.get_mpint()?;
                let group = method
                    .fixed_group()
                    .ok_or_else(|| protocol_error("No fixed group"))??;
                let exchange = DhExchange::new(group)?;
                let f = exchange.public_key().to_vec();
                let k = exchange.compute_shared_secret(&e)?;
                let h = exchange_hash(hash, &input, &ExchangeValues::Dh { e: &e, f: &f }, &k);
                (f, k, h)
            }
            KexFlavor::GroupExchange => {
                let request = self.expect(MessageType::KexDhGexRequest).await?;
                let mut buf = WireBuffer::from_slice(&request[1..]);
                let (min, preferred, max) = (buf.get_u32()?, buf.get_u32()?, buf.get_u32()?);
                let group = KexMethod::DhGroup14Sha256
                    .fixed_group()
                    .ok_or_else(|| protocol_error("No fixed group"))??;
                let p = group.p.to_bytes_be();
                let g = group.g.to_bytes_be();
                let mut reply = WireBuffer::new();
                reply.put_u8(skiff_proto::ssh::message::KEX_DH_GEX_GROUP);
                reply.put_mpint(&p);
                reply.put_mpint(&g);
                self.send(reply.as_slice()).await?;

                let init = self.expect(MessageType::KexDhGexInit).await?;
                let mut buf = WireBuffer::from_slice(&init[1..]);
                let e = buf.get_mpint()?;
                let exchange = DhExchange::new(group)?;
                let f = exchange.public_key().to_vec();
                let k = exchange.compute_shared_secret(&e)?;
                let values = ExchangeValues::GroupExchange {
                    min,
                    preferred,
                    max,
                    p: &p,
                    g: &g,
                    e: &e,
                    f: &f,
                };
                let h = exchange_hash(hash, &input, &values, &k);
                (f, k, h)
            }
        };

        let reply = KexReply {
            host_key: host_key_blob.clone(),
            server_public,
            signature: self.host_key.sign(&h)?,
        };
        self.send(&reply.to_bytes(method.flavor())).await?;

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        self.send(&NewKeys::new().to_bytes()).await?;
        self.install_keys(&negotiated, method, &shared_secret, &h, &session_id, true)?;
        self.expect(MessageType::NewKeys).await?;
        self.install_keys(&negotiated, method, &shared_secret, &h, &session_id, false)?;
        self.negotiated = Some(negotiated);
        Ok(())
    }

    fn install_keys(
        &mut self,
        negotiated: &NegotiatedAlgorithms,
        method: KexMethod,
        shared_secret: &[u8],
        h: &[u8],
        session_id: &[u8],
        outbound: bool,
    ) -> SkiffResult<()> {
        let missing = |what: &str| protocol_error(format!("No provider for {}", what));
        let cipher_c2s = self
            .registry
            .cipher(&negotiated.cipher_client_to_server)
            .ok_or_else(|| missing("cipher"))?;
        let cipher_s2c = self
            .registry
            .cipher(&negotiated.cipher_server_to_client)
            .ok_or_else(|| missing("cipher"))?;
        let mac_name = |name: &str, aead: bool| if aead { "none".to_string() } else { name.to_string() };
        let mac_c2s = self
            .registry
            .mac(&mac_name(&negotiated.mac_client_to_server, cipher_c2s.tag_len() > 0))
            .ok_or_else(|| missing("mac"))?;
        let mac_s2c = self
            .registry
            .mac(&mac_name(&negotiated.mac_server_to_client, cipher_s2c.tag_len() > 0))
            .ok_or_else(|| missing("mac"))?;

        let lengths = KeyLengths {
            iv_client_to_server: cipher_c2s.iv_len(),
            iv_server_to_client: cipher_s2c.iv_len(),
            enc_client_to_server: cipher_c2s.key_len(),
            enc_server_to_client: cipher_s2c.key_len(),
            mac_client_to_server: mac_c2s.key_len(),
            mac_server_to_client: mac_s2c.key_len(),
        };
        let keys = SessionKeys::derive(method.hash(), shared_secret, h, session_id, &lengths);

        if outbound {
            let compression = self
                .registry
                .compression(&negotiated.compression_server_to_client)
                .ok_or_else(|| missing("compression"))?;
            self.encoder.set_keys(
                cipher_s2c.create(
                    CipherDirection::Encrypt,
                    &keys.enc_server_to_client,
                    &keys.iv_server_to_client,
                )?,
                mac_s2c.create(&keys.mac_server_to_client)?,
                (!compression.is_none()).then(|| compression.compressor(DEFAULT_LEVEL)),
                compression.is_delayed(),
            );
            if self.authenticated {
                self.encoder.enable_delayed_compression();
            }
        } else {
            let compression = self
                .registry
                .compression(&negotiated.compression_client_to_server)
                .ok_or_else(|| missing("compression"))?;
            self.decoder.set_keys(
                cipher_c2s.create(
                    CipherDirection::Decrypt,
                    &keys.enc_client_to_server,
                    &keys.iv_client_to_server,
                )?,
                mac_c2s.create(&keys.mac_client_to_server)?,
                (!compression.is_none()).then(|| compression.decompressor()),
                compression.is_delayed(),
            );
            if self.authenticated {
                self.decoder.enable_delayed_compression();
            }
        }
        Ok(())
    }

    /// Answers SERVICE_REQUEST for `ssh-userauth`.
    pub async fn accept_service(&mut self) -> SkiffResult<()> {
        let request = self.expect(MessageType::ServiceRequest).await?;
        let mut buf = WireBuffer::from_slice(&request[1..]);
        let service = buf.get_utf8()?;
        let mut reply = WireBuffer::new();
        reply.put_u8(MessageType::ServiceAccept as u8);
        reply.put_str(&service);
        self.send(reply.as_slice()).await
    }

    pub async fn auth_request(&mut self) -> SkiffResult<AuthRequest> {
        let payload = self.expect(MessageType::UserauthRequest).await?;
        AuthRequest::from_bytes(&payload)
    }

    pub async fn auth_failure(&mut self, methods: &[&str], partial_success: bool) -> SkiffResult<()> {
        self.send(&AuthFailure::new(names(methods), partial_success).to_bytes())
            .await
    }

    /// Sends USERAUTH_SUCCESS and starts delayed compression.
    pub async fn auth_success(&mut self) -> SkiffResult<()> {
        self.send(&[MessageType::UserauthSuccess as u8]).await?;
        self.authenticated = true;
        self.encoder.enable_delayed_compression();
        self.decoder.enable_delayed_compression();
        Ok(())
    }

    /// Accepts `password` after the client's `none` probe.
    pub async fn accept_password(&mut self, password: &str) -> SkiffResult<()> {
        self.accept_service().await?;
        let probe = self.auth_request().await?;
        if probe.method().name() != "none" {
            return Err(protocol_error("Expected a none probe first"));
        }
        self.auth_failure(&["password"], false).await?;

        let request = self.auth_request().await?;
        match request.method() {
            skiff_proto::ssh::AuthMethod::Password { password: given, .. } if given == password => {
                self.auth_success().await
            }
            other => Err(protocol_error(format!("Unexpected auth method {:?}", other.name()))),
        }
    }

    /// Confirms the next CHANNEL_OPEN with the given window and packet
    /// size.
    pub async fn confirm_channel(&mut self, window: u32, max_packet: u32) -> SkiffResult<ChannelOpen> {
        let payload = self.expect(MessageType::ChannelOpen).await?;
        let open = ChannelOpen::from_bytes(&payload)?;
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: SERVER_CHANNEL,
            initial_window_size: window,
            maximum_packet_size: max_packet,
        };
        self.send(&confirmation.to_bytes()).await?;
        Ok(open)
    }

    pub async fn channel_request(&mut self) -> SkiffResult<ChannelRequest> {
        let payload = self.expect(MessageType::ChannelRequest).await?;
        ChannelRequest::from_bytes(&payload)
    }

    pub async fn channel_success(&mut self, recipient: u32) -> SkiffResult<()> {
        self.send(&encode_simple(MessageType::ChannelSuccess, recipient))
            .await
    }

    pub async fn exit_status(&mut self, recipient: u32, exit_status: u32) -> SkiffResult<()> {
        let request = ChannelRequest {
            recipient_channel: recipient,
            request_type: ChannelRequestType::ExitStatus { exit_status },
            want_reply: false,
        };
        self.send(&request.to_bytes()).await
    }
}

/// Connects a client session to a scripted server that has completed
/// the first key exchange.
pub async fn connect(options: ServerOptions, config: SshClientConfig) -> SkiffResult<(Session, TestServer)> {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(TestServer::accept(server_io, options));
    let session = Session::connect(client_io, TEST_HOST, 22, config).await?;
    let server = server
        .await
        .map_err(|e| protocol_error(format!("Server task failed: {}", e)))??;
    Ok((session, server))
}

/// Connects and authenticates with a password.
pub async fn connect_authenticated(
    options: ServerOptions,
    config: SshClientConfig,
) -> SkiffResult<(Session, TestServer)> {
    let (session, mut server) = connect(options, config).await?;
    let auth = skiff_proto::ssh::config::AuthConfig::new("alice")
        .with_methods(&["password"])
        .with_password("secret");
    let (client, served) = tokio::join!(session.authenticate(&auth), server.accept_password("secret"));
    client?;
    served?;
    Ok((session, server))
}
