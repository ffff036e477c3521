//! Integration tests for the client session against a scripted server.
//!
//! These tests validate the complete SSH protocol flow including:
//! - Version exchange and every key exchange flavor
//! - Host key trust decisions
//! - Authentication, including partial success
//! - Channels, flow control and command execution
//! - Rekeying and the write gate
//! - Keepalive and disconnect handling

mod common;

use common::{
    client_config, connect, connect_authenticated, init_tracing, ServerOptions, TestServer,
    SERVER_CHANNEL, TEST_HOST,
};
use skiff_platform::SkiffError;
use skiff_proto::ssh::auth::AuthPkOk;
use skiff_proto::ssh::channel::{ChannelEvent, ChannelKind, ChannelState, SessionRequest};
use skiff_proto::ssh::config::AuthConfig;
use skiff_proto::ssh::connection::{
    encode_data, encode_simple, ChannelData, ChannelExtendedData, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequestType, ChannelType,
    ChannelWindowAdjust, GlobalRequest,
};
use skiff_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use skiff_proto::ssh::identity::KeyPairIdentity;
use skiff_proto::ssh::kex::{AlgorithmPreferences, KexInit};
use skiff_proto::ssh::known_hosts::{host_entry_name, HostKeyRepository, HostKeyStatus, KnownHosts, TrustPolicy};
use skiff_proto::ssh::message::{disconnect, open_failure};
use skiff_proto::ssh::transport::Disconnect;
use skiff_proto::ssh::{AuthMethod, MessageType, Session, SessionState, SshClient};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const LIMIT: Duration = Duration::from_secs(10);

/// Waits until `check` holds, polling the session.
async fn eventually<F: Fn() -> bool>(check: F) -> TestResult {
    timeout(LIMIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

/// Opens a plain session channel the server confirms with `window`.
async fn open_session_channel(
    session: &Session,
    server: &mut TestServer,
    window: u32,
    max_packet: u32,
) -> Result<(skiff_proto::ssh::Channel, ChannelOpen), Box<dyn std::error::Error>> {
    let (channel, open) = tokio::join!(
        session.open_channel(ChannelKind::Session(SessionRequest::None)),
        server.confirm_channel(window, max_packet)
    );
    Ok((channel?, open?))
}

#[tokio::test]
async fn test_connect_curve25519_ed25519() -> TestResult {
    init_tracing();
    let (session, server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;

    assert_eq!(session.state(), SessionState::Authenticating);
    assert_eq!(session.kex_count(), 1);
    assert!(!session.is_authenticated());
    assert_eq!(session.session_id().as_deref(), server.session_id());
    assert_eq!(session.host_key(), Some(server.host_key().public_key_bytes()));
    assert_eq!(session.host_key_fingerprint(), Some(server.host_key().fingerprint()));
    assert_eq!(session.server_version().software(), "TestServer_1.0");
    assert!(server.client_version().software().starts_with("skiff_"));

    let negotiated = session.negotiated().ok_or("no negotiated algorithms")?;
    assert_eq!(negotiated.kex, "curve25519-sha256");
    assert_eq!(negotiated.host_key, "ssh-ed25519");
    assert_eq!(negotiated.cipher_client_to_server, "aes128-ctr");
    assert_eq!(negotiated.mac_server_to_client, "hmac-sha2-256");
    assert_eq!(negotiated.compression_client_to_server, "none");
    Ok(())
}

#[tokio::test]
async fn test_connect_ecdh_nistp256() -> TestResult {
    let options = ServerOptions::default().with_kex(&["ecdh-sha2-nistp256"]);
    let (session, _server) = timeout(LIMIT, connect(options, client_config())).await??;
    assert_eq!(session.negotiated().map(|n| n.kex), Some("ecdh-sha2-nistp256".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_connect_fixed_group14() -> TestResult {
    let options = ServerOptions::default().with_kex(&["diffie-hellman-group14-sha256"]);
    let (session, server) = timeout(LIMIT, connect(options, client_config())).await??;
    assert_eq!(session.session_id().as_deref(), server.session_id());
    Ok(())
}

#[tokio::test]
async fn test_connect_group_exchange() -> TestResult {
    let options = ServerOptions::default().with_kex(&["diffie-hellman-group-exchange-sha256"]);
    let (session, server) = timeout(LIMIT, connect(options, client_config())).await??;
    assert_eq!(session.session_id().as_deref(), server.session_id());
    assert_eq!(session.state(), SessionState::Authenticating);
    Ok(())
}

#[tokio::test]
async fn test_group_exchange_rejects_small_group() -> TestResult {
    let mut config = client_config();
    // The scripted server always offers the 2048-bit group.
    config.transport.gex_min = 3072;
    config.transport.gex_preferred = 3072;
    let options = ServerOptions::default().with_kex(&["diffie-hellman-group-exchange-sha256"]);

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let (client, server) = tokio::join!(
        Session::connect(client_io, TEST_HOST, 22, config),
        TestServer::accept(server_io, options)
    );
    match client {
        Err(SkiffError::Protocol(message)) => assert!(message.contains("outside")),
        other => panic!("expected a protocol error, got {:?}", other.map(|_| ())),
    }
    assert!(server.is_err());
    Ok(())
}

#[tokio::test]
async fn test_aead_cipher_without_common_mac() -> TestResult {
    let options = ServerOptions::default()
        .with_ciphers(&["aes256-gcm@openssh.com"])
        .with_macs(&["umac-64@openssh.com"]);
    let (session, mut server) = timeout(LIMIT, connect_authenticated(options, client_config())).await??;

    let negotiated = session.negotiated().ok_or("no negotiated algorithms")?;
    assert_eq!(negotiated.cipher_client_to_server, "aes256-gcm@openssh.com");
    assert_eq!(negotiated.mac_client_to_server, "none");
    assert_eq!(negotiated.mac_server_to_client, "none");

    // Traffic flows in both directions under the AEAD cipher.
    let (mut channel, open) = open_session_channel(&session, &mut server, 0x10000, 0x8000).await?;
    server.send(&encode_data(open.sender_channel, b"sealed")).await?;
    assert_eq!(channel.next_event().await, Some(ChannelEvent::Data(b"sealed".to_vec())));
    channel.send_data(b"reply").await?;
    let payload = server.expect(MessageType::ChannelData).await?;
    assert_eq!(ChannelData::from_bytes(&payload)?.data, b"reply");
    Ok(())
}

#[tokio::test]
async fn test_no_common_kex_algorithm() -> TestResult {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let options = ServerOptions::default().with_kex(&["unknown-kex@example.com"]);

    let server_script = async move {
        let mut server = TestServer::handshake_versions(server_io, options).await?;
        let prefs = AlgorithmPreferences {
            kex: common::names(&["unknown-kex@example.com"]),
            ..AlgorithmPreferences::default()
        };
        server.send(&KexInit::from_preferences(&prefs).to_bytes()).await?;
        server.expect(MessageType::KexInit).await?;
        let payload = server.expect(MessageType::Disconnect).await?;
        Disconnect::from_bytes(&payload)
    };
    let (client, server) = timeout(
        LIMIT,
        async { tokio::join!(Session::connect(client_io, TEST_HOST, 22, client_config()), server_script) },
    )
    .await?;

    match client {
        Err(SkiffError::Protocol(message)) => assert!(message.starts_with("No common algorithm for kex")),
        other => panic!("expected negotiation failure, got {:?}", other.map(|_| ())),
    }
    assert_eq!(server?.reason, disconnect::KEY_EXCHANGE_FAILED);
    Ok(())
}

#[tokio::test]
async fn test_strict_policy_rejects_unknown_host() -> TestResult {
    let mut config = client_config();
    config.trust_policy = TrustPolicy::Strict;
    config.host_key_repository = Arc::new(KnownHosts::new());

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let (client, server) = timeout(
        LIMIT,
        async {
            tokio::join!(
                Session::connect(client_io, TEST_HOST, 22, config),
                TestServer::accept(server_io, ServerOptions::default())
            )
        },
    )
    .await?;

    assert!(matches!(client, Err(SkiffError::HostKeyRejected(_))));
    // The server sees DISCONNECT where it expected NEWKEYS.
    assert!(server.is_err());
    Ok(())
}

#[tokio::test]
async fn test_accept_new_records_host_key() -> TestResult {
    let repository = Arc::new(KnownHosts::new());
    let mut config = client_config();
    config.trust_policy = TrustPolicy::AcceptNew;
    config.host_key_repository = repository.clone();

    let (_session, server) = timeout(LIMIT, connect(ServerOptions::default(), config)).await??;
    let status = repository.check(
        &host_entry_name(TEST_HOST, 22),
        "ssh-ed25519",
        &server.host_key().public_key_bytes(),
    );
    assert_eq!(status, HostKeyStatus::Ok);
    Ok(())
}

#[tokio::test]
async fn test_password_authentication() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;
    let auth = AuthConfig::new("alice")
        .with_methods(&["password"])
        .with_password("secret");

    let (client, served) = tokio::join!(session.authenticate(&auth), server.accept_password("secret"));
    client?;
    served?;

    eventually(|| session.state() == SessionState::Running).await?;
    assert!(session.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn test_authentication_failure_keeps_session() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;
    let auth = AuthConfig::new("alice")
        .with_methods(&["password"])
        .with_password("wrong");

    let server_script = async {
        server.accept_service().await?;
        server.auth_request().await?;
        server.auth_failure(&["password"], false).await?;
        let request = server.auth_request().await?;
        assert_eq!(request.method().name(), "password");
        server.auth_failure(&["password"], false).await
    };
    let (client, served) = tokio::join!(session.authenticate(&auth), server_script);
    served?;

    match client {
        Err(SkiffError::AuthFailed { methods }) => assert_eq!(methods, vec!["password".to_string()]),
        other => panic!("expected AuthFailed, got {:?}", other),
    }
    assert!(!session.is_closed());
    assert_eq!(session.state(), SessionState::Authenticating);
    Ok(())
}

#[tokio::test]
async fn test_second_attempt_skips_service_request() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;
    let wrong = AuthConfig::new("alice")
        .with_methods(&["password"])
        .with_password("wrong");
    let right = AuthConfig::new("alice")
        .with_methods(&["password"])
        .with_password("secret");

    let first = async {
        server.accept_service().await?;
        server.auth_request().await?;
        server.auth_failure(&["password"], false).await?;
        server.auth_request().await?;
        server.auth_failure(&["password"], false).await
    };
    let (client, served) = timeout(LIMIT, async { tokio::join!(session.authenticate(&wrong), first) }).await?;
    served?;
    assert!(matches!(client, Err(SkiffError::AuthFailed { .. })));

    // The next packet must be a USERAUTH_REQUEST, not another SERVICE_REQUEST.
    let second = async {
        server.auth_request().await?;
        server.auth_failure(&["password"], false).await?;
        let request = server.auth_request().await?;
        match request.method() {
            AuthMethod::Password { password, .. } => assert_eq!(password, "secret"),
            other => panic!("expected a password request, got {}", other.name()),
        }
        server.auth_success().await
    };
    let (client, served) = timeout(LIMIT, async { tokio::join!(session.authenticate(&right), second) }).await?;
    served?;
    client?;
    assert!(session.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn test_unimplemented_during_auth_is_fatal() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;
    let auth = AuthConfig::new("alice")
        .with_methods(&["password"])
        .with_password("secret");

    let server_script = async {
        server.accept_service().await?;
        server.auth_request().await?;
        let mut reply = skiff_proto::ssh::buffer::WireBuffer::new();
        reply.put_u8(MessageType::Unimplemented as u8);
        reply.put_u32(3);
        server.send(reply.as_slice()).await
    };
    let (client, served) = timeout(LIMIT, async { tokio::join!(session.authenticate(&auth), server_script) }).await?;
    served?;
    assert!(matches!(client, Err(SkiffError::NotImplemented(_))));
    eventually(|| session.is_closed()).await
}

#[tokio::test]
async fn test_partial_success_then_password() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;
    let key = Ed25519HostKey::generate()?;
    let blob = key.public_key_bytes();
    let identity = Arc::new(KeyPairIdentity::new("test-key", Box::new(key)));
    let auth = AuthConfig::new("alice")
        .with_methods(&["publickey", "password"])
        .with_identity(identity)
        .with_password("secret");

    let server_script = async {
        server.accept_service().await?;
        server.auth_request().await?;
        server.auth_failure(&["publickey", "password"], false).await?;

        let query = server.auth_request().await?;
        match query.method() {
            AuthMethod::PublicKey { public_key, signature: None, .. } => assert_eq!(public_key, &blob),
            other => panic!("expected a publickey query, got {}", other.name()),
        }
        server.send(&AuthPkOk::new("ssh-ed25519", blob.clone()).to_bytes()).await?;

        let signed = server.auth_request().await?;
        assert!(matches!(
            signed.method(),
            AuthMethod::PublicKey { signature: Some(_), .. }
        ));
        server.auth_failure(&["password"], true).await?;

        let password = server.auth_request().await?;
        assert_eq!(password.method().name(), "password");
        server.auth_success().await
    };
    let (client, served) = timeout(LIMIT, async { tokio::join!(session.authenticate(&auth), server_script) }).await?;
    served?;
    client?;
    assert!(session.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn test_exec_collects_output() -> TestResult {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let (client, server) = tokio::join!(
        SshClient::connect_stream(client_io, TEST_HOST, 22, client_config()),
        TestServer::accept(server_io, ServerOptions::default())
    );
    let (client, mut server) = (client?, server?);
    let (auth, served) = tokio::join!(
        client.authenticate_password("alice", "secret"),
        server.accept_password("secret")
    );
    auth?;
    served?;

    let server_script = async {
        let open = server.confirm_channel(0x1000, 0x800).await?;
        let client_channel = open.sender_channel;
        let request = server.channel_request().await?;
        assert_eq!(
            request.request_type,
            ChannelRequestType::Exec {
                command: "uname -a".to_string()
            }
        );
        assert!(request.want_reply);
        server.channel_success(client_channel).await?;

        server.send(&encode_data(client_channel, b"Linux test\n")).await?;
        let stderr = ChannelExtendedData {
            recipient_channel: client_channel,
            data_type: 1,
            data: b"warning\n".to_vec(),
        };
        server.send(&stderr.to_bytes()).await?;
        server.exit_status(client_channel, 0).await?;
        server.send(&encode_simple(MessageType::ChannelEof, client_channel)).await?;
        server.send(&encode_simple(MessageType::ChannelClose, client_channel)).await?;

        let close = server.expect(MessageType::ChannelClose).await?;
        assert_eq!(&close[1..5], &SERVER_CHANNEL.to_be_bytes());
        Ok::<_, SkiffError>(())
    };
    let (output, served) = timeout(LIMIT, async { tokio::join!(client.execute("uname -a"), server_script) }).await?;
    served?;
    let output = output?;

    assert_eq!(output.stdout, b"Linux test\n");
    assert_eq!(output.stderr, b"warning\n");
    assert_eq!(output.exit_status, Some(0));
    assert!(output.success());
    Ok(())
}

#[tokio::test]
async fn test_channel_open_failure() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;

    let server_script = async {
        let payload = server.expect(MessageType::ChannelOpen).await?;
        let open = ChannelOpen::from_bytes(&payload)?;
        let failure = ChannelOpenFailure::new(open.sender_channel, open_failure::CONNECT_FAILED);
        server.send(&failure.to_bytes()).await
    };
    let (opened, served) = tokio::join!(
        session.open_channel(ChannelKind::DirectTcpip {
            host: "db.internal".to_string(),
            port: 5432,
            originator_address: "127.0.0.1".to_string(),
            originator_port: 40000,
        }),
        server_script
    );
    served?;

    match opened {
        Err(SkiffError::ChannelOpenFailed { reason, .. }) => assert_eq!(reason, open_failure::CONNECT_FAILED),
        other => panic!("expected ChannelOpenFailed, got {:?}", other),
    }
    // The session survives a refused channel.
    assert!(!session.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_channels_require_authentication() -> TestResult {
    let (session, _server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;
    let result = session
        .open_channel(ChannelKind::Session(SessionRequest::Shell))
        .await;
    assert!(matches!(result, Err(SkiffError::Protocol(_))));
    Ok(())
}

#[tokio::test]
async fn test_send_respects_remote_window() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    let (mut channel, open) = open_session_channel(&session, &mut server, 0x1000, 0x800).await?;
    let client_channel = open.sender_channel;
    assert_eq!(channel.remote_window(), 0x1000);
    assert_eq!(channel.recipient_id(), SERVER_CHANNEL);

    let writer = tokio::spawn(async move {
        channel.write_all(&vec![0x5a; 0x3000]).await?;
        Ok::<_, SkiffError>(channel)
    });

    let mut received = 0;
    while received < 0x1000 {
        let payload = timeout(LIMIT, server.expect(MessageType::ChannelData)).await??;
        let data = ChannelData::from_bytes(&payload)?;
        assert!(data.data.len() <= 0x800);
        received += data.data.len();
    }
    assert_eq!(received, 0x1000);

    // Nothing more until the window opens.
    assert!(timeout(Duration::from_millis(200), server.recv()).await.is_err());

    let adjust = ChannelWindowAdjust {
        recipient_channel: client_channel,
        bytes_to_add: 0x2000,
    };
    server.send(&adjust.to_bytes()).await?;
    while received < 0x3000 {
        let payload = timeout(LIMIT, server.expect(MessageType::ChannelData)).await??;
        received += ChannelData::from_bytes(&payload)?.data.len();
    }
    assert_eq!(received, 0x3000);

    let channel = timeout(LIMIT, writer).await???;
    assert_eq!(channel.remote_window(), 0);
    Ok(())
}

#[tokio::test]
async fn test_data_beyond_local_window_is_fatal() -> TestResult {
    let mut config = client_config();
    config.window_size = 0x1000;
    config.max_packet_size = 0x1000;
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), config)).await??;
    let (_channel, open) = open_session_channel(&session, &mut server, 0x1000, 0x800).await?;
    assert_eq!(open.initial_window_size, 0x1000);

    server.send(&encode_data(open.sender_channel, &vec![0u8; 0x1001])).await?;
    let payload = timeout(LIMIT, server.expect(MessageType::Disconnect)).await??;
    assert_eq!(Disconnect::from_bytes(&payload)?.reason, disconnect::PROTOCOL_ERROR);
    eventually(|| session.is_closed()).await?;
    Ok(())
}

#[tokio::test]
async fn test_window_returned_as_data_is_read() -> TestResult {
    let mut config = client_config();
    config.window_size = 0x2000;
    config.max_packet_size = 0x1000;
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), config)).await??;
    let (mut channel, open) = open_session_channel(&session, &mut server, 0x10000, 0x1000).await?;

    server.send(&encode_data(open.sender_channel, &vec![1u8; 0x1000])).await?;
    server.send(&encode_data(open.sender_channel, &vec![2u8; 0x0800])).await?;

    // Unread data keeps its share of the window.
    assert!(timeout(Duration::from_millis(200), server.recv()).await.is_err());

    assert!(matches!(channel.next_event().await, Some(ChannelEvent::Data(d)) if d.len() == 0x1000));
    let payload = timeout(LIMIT, server.expect(MessageType::ChannelWindowAdjust)).await??;
    let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
    assert_eq!(adjust.recipient_channel, SERVER_CHANNEL);
    assert_eq!(adjust.bytes_to_add, 0x1000);

    // The window is above half again, so this read returns nothing yet.
    assert!(matches!(channel.next_event().await, Some(ChannelEvent::Data(d)) if d.len() == 0x0800));
    assert!(timeout(Duration::from_millis(200), server.recv()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_unread_channel_holds_at_most_one_window() -> TestResult {
    let mut config = client_config();
    config.window_size = 0x2000;
    config.max_packet_size = 0x1000;
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), config)).await??;
    let (_channel, open) = open_session_channel(&session, &mut server, 0x10000, 0x1000).await?;

    server.send(&encode_data(open.sender_channel, &vec![1u8; 0x1000])).await?;
    server.send(&encode_data(open.sender_channel, &vec![2u8; 0x1000])).await?;
    assert!(timeout(Duration::from_millis(200), server.recv()).await.is_err());

    // The window is spent and nobody read anything: one more byte is fatal.
    server.send(&encode_data(open.sender_channel, &[3u8])).await?;
    let payload = timeout(LIMIT, server.expect(MessageType::Disconnect)).await??;
    assert_eq!(Disconnect::from_bytes(&payload)?.reason, disconnect::PROTOCOL_ERROR);
    Ok(())
}

#[tokio::test]
async fn test_client_rekey_holds_application_writes() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    let session_id = session.session_id();
    let (mut channel, _open) = open_session_channel(&session, &mut server, 0x10000, 0x8000).await?;

    let rekeying = session.clone();
    let rekey = tokio::spawn(async move { rekeying.rekey().await });
    let client_kexinit = timeout(LIMIT, server.expect(MessageType::KexInit)).await??;

    let writer = tokio::spawn(async move {
        channel.send_data(b"after-rekey").await?;
        Ok::<_, SkiffError>(channel)
    });
    // The write waits for the exchange to finish.
    assert!(timeout(Duration::from_millis(200), server.recv()).await.is_err());

    timeout(LIMIT, server.key_exchange(Some(client_kexinit))).await??;
    let payload = timeout(LIMIT, server.expect(MessageType::ChannelData)).await??;
    assert_eq!(ChannelData::from_bytes(&payload)?.data, b"after-rekey");

    timeout(LIMIT, rekey).await???;
    timeout(LIMIT, writer).await???;
    assert_eq!(session.kex_count(), 2);
    assert_eq!(session.session_id(), session_id);
    assert_eq!(session.state(), SessionState::Running);
    Ok(())
}

#[tokio::test]
async fn test_server_initiated_rekey() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    let (mut channel, open) = open_session_channel(&session, &mut server, 0x10000, 0x8000).await?;

    timeout(LIMIT, server.key_exchange(None)).await??;
    eventually(|| session.kex_count() == 2).await?;

    server.send(&encode_data(open.sender_channel, b"fresh keys")).await?;
    assert_eq!(channel.next_event().await, Some(ChannelEvent::Data(b"fresh keys".to_vec())));
    Ok(())
}

#[tokio::test]
async fn test_rekey_rejects_changed_host_key() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    server.replace_host_key(Ed25519HostKey::generate()?);

    let server_script = async {
        let kexinit = server.expect(MessageType::KexInit).await?;
        server.key_exchange(Some(kexinit)).await
    };
    let (rekeyed, served) = timeout(LIMIT, async { tokio::join!(session.rekey(), server_script) }).await?;

    assert!(matches!(rekeyed, Err(SkiffError::HostKeyRejected(_))));
    assert!(served.is_err());
    assert!(session.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_rekey_after_byte_limit() -> TestResult {
    let mut config = client_config();
    config.transport.rekey_bytes_limit = 32 * 1024;
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), config)).await??;
    let (mut channel, _open) = open_session_channel(&session, &mut server, 0x100000, 0x4000).await?;

    let total = 96 * 1024;
    let writer = tokio::spawn(async move {
        channel.write_all(&vec![7u8; total]).await?;
        Ok::<_, SkiffError>(channel)
    });

    let mut received = 0;
    let mut rekeys = 0;
    while received < total {
        let payload = timeout(LIMIT, server.recv()).await??;
        match payload.first().copied() {
            Some(b) if b == MessageType::ChannelData as u8 => {
                received += ChannelData::from_bytes(&payload)?.data.len();
            }
            Some(b) if b == MessageType::KexInit as u8 => {
                timeout(LIMIT, server.key_exchange(Some(payload))).await??;
                rekeys += 1;
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    timeout(LIMIT, writer).await???;

    assert!(rekeys >= 1);
    eventually(|| session.kex_count() >= 2).await?;
    Ok(())
}

#[tokio::test]
async fn test_delayed_compression_after_auth() -> TestResult {
    let options = ServerOptions::default().with_compression(&["zlib@openssh.com"]);
    let mut config = client_config();
    config.algorithms = AlgorithmPreferences::default().with_compression();
    let (session, mut server) = timeout(LIMIT, connect_authenticated(options, config)).await??;

    let negotiated = session.negotiated().ok_or("no negotiated algorithms")?;
    assert_eq!(negotiated.compression_client_to_server, "zlib@openssh.com");

    let (mut channel, open) = open_session_channel(&session, &mut server, 0x10000, 0x8000).await?;
    let text = b"compressible compressible compressible compressible".to_vec();
    channel.send_data(&text).await?;
    let payload = timeout(LIMIT, server.expect(MessageType::ChannelData)).await??;
    assert_eq!(ChannelData::from_bytes(&payload)?.data, text);

    server.send(&encode_data(open.sender_channel, &text)).await?;
    assert_eq!(channel.next_event().await, Some(ChannelEvent::Data(text)));
    Ok(())
}

#[tokio::test]
async fn test_requests_allowed_after_eof() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    let (mut channel, _open) = open_session_channel(&session, &mut server, 0x10000, 0x8000).await?;

    channel.eof().await?;
    server.expect(MessageType::ChannelEof).await?;

    channel.window_change(120, 40).await?;
    channel.signal("TERM").await?;
    let resize = skiff_proto::ssh::connection::ChannelRequest::from_bytes(&server.expect(MessageType::ChannelRequest).await?)?;
    assert_eq!(resize.request_type.name(), "window-change");
    assert_eq!(resize.recipient_channel, SERVER_CHANNEL);
    let signal = skiff_proto::ssh::connection::ChannelRequest::from_bytes(&server.expect(MessageType::ChannelRequest).await?)?;
    assert_eq!(
        signal.request_type,
        ChannelRequestType::Signal { name: "TERM".to_string() }
    );

    match channel.send_data(b"late").await {
        Err(SkiffError::Protocol(message)) => assert!(message.contains("EOF")),
        other => panic!("expected a protocol error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_peer_close_is_answered() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    let (mut channel, open) = open_session_channel(&session, &mut server, 0x10000, 0x8000).await?;

    server.send(&encode_simple(MessageType::ChannelEof, open.sender_channel)).await?;
    server.send(&encode_simple(MessageType::ChannelClose, open.sender_channel)).await?;
    assert_eq!(channel.next_event().await, Some(ChannelEvent::Eof));
    assert_eq!(channel.next_event().await, Some(ChannelEvent::Close));
    assert_eq!(channel.state(), ChannelState::Closed);

    let close = timeout(LIMIT, server.expect(MessageType::ChannelClose)).await??;
    assert_eq!(&close[1..5], &SERVER_CHANNEL.to_be_bytes());
    assert!(channel.send_data(b"late").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_remote_forward_and_accept() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;

    let server_script = async {
        let payload = server.expect(MessageType::GlobalRequest).await?;
        let request = GlobalRequest::from_bytes(&payload)?;
        assert_eq!(request.name, "tcpip-forward");
        assert!(request.want_reply);
        let mut reply = vec![MessageType::RequestSuccess as u8];
        reply.extend_from_slice(&40022u32.to_be_bytes());
        server.send(&reply).await
    };
    let (bound, served) = tokio::join!(session.request_remote_forward("0.0.0.0", 0), server_script);
    served?;
    assert_eq!(bound?, 40022);
    assert!(session.forwarding_policy().forwarded_tcpip);

    let open = ChannelOpen {
        channel_type: ChannelType::ForwardedTcpip {
            connected_address: "0.0.0.0".to_string(),
            connected_port: 40022,
            originator_address: "203.0.113.9".to_string(),
            originator_port: 51000,
        },
        sender_channel: 3,
        initial_window_size: 0x8000,
        maximum_packet_size: 0x4000,
    };
    server.send(&open.to_bytes()).await?;

    let channel = timeout(LIMIT, session.accept_channel()).await??;
    assert_eq!(channel.channel_type(), "forwarded-tcpip");
    assert_eq!(channel.recipient_id(), 3);
    assert_eq!(channel.remote_window(), 0x8000);

    let payload = timeout(LIMIT, server.expect(MessageType::ChannelOpenConfirmation)).await??;
    let confirmation = ChannelOpenConfirmation::from_bytes(&payload)?;
    assert_eq!(confirmation.recipient_channel, 3);
    assert_eq!(confirmation.sender_channel, channel.local_id());
    Ok(())
}

#[tokio::test]
async fn test_unrequested_server_channels_are_refused() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    assert!(!session.forwarding_policy().forwarded_tcpip);

    let forwarded = ChannelOpen {
        channel_type: ChannelType::ForwardedTcpip {
            connected_address: "0.0.0.0".to_string(),
            connected_port: 8080,
            originator_address: "203.0.113.9".to_string(),
            originator_port: 51000,
        },
        sender_channel: 4,
        initial_window_size: 0x8000,
        maximum_packet_size: 0x4000,
    };
    server.send(&forwarded.to_bytes()).await?;
    let payload = timeout(LIMIT, server.expect(MessageType::ChannelOpenFailure)).await??;
    let failure = ChannelOpenFailure::from_bytes(&payload)?;
    assert_eq!(failure.recipient_channel, 4);
    assert_eq!(failure.reason_code, open_failure::ADMINISTRATIVELY_PROHIBITED);

    let unknown = ChannelOpen {
        channel_type: ChannelType::Unknown("bogus@example.com".to_string()),
        sender_channel: 5,
        initial_window_size: 0x8000,
        maximum_packet_size: 0x4000,
    };
    server.send(&unknown.to_bytes()).await?;
    let payload = timeout(LIMIT, server.expect(MessageType::ChannelOpenFailure)).await??;
    let failure = ChannelOpenFailure::from_bytes(&payload)?;
    assert_eq!(failure.recipient_channel, 5);
    assert_eq!(failure.reason_code, open_failure::UNKNOWN_CHANNEL_TYPE);
    Ok(())
}

#[tokio::test]
async fn test_server_global_request_is_refused() -> TestResult {
    let (_session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    let request = GlobalRequest {
        name: "hostkeys-prove-00@openssh.com".to_string(),
        want_reply: true,
        data: Vec::new(),
    };
    server.send(&request.to_bytes()).await?;
    let reply = timeout(LIMIT, server.recv()).await??;
    assert_eq!(reply, vec![MessageType::RequestFailure as u8]);
    Ok(())
}

#[tokio::test]
async fn test_unknown_message_gets_unimplemented() -> TestResult {
    let (_session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), client_config())).await??;
    let sequence = server.next_send_sequence();
    server.send(&[200, 1, 2, 3]).await?;

    let reply = timeout(LIMIT, server.expect(MessageType::Unimplemented)).await??;
    assert_eq!(&reply[1..5], &sequence.to_be_bytes());
    Ok(())
}

#[tokio::test]
async fn test_server_disconnect_fails_later_operations() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    server
        .send(&Disconnect::new(disconnect::BY_APPLICATION, "maintenance").to_bytes())
        .await?;
    eventually(|| session.state() == SessionState::Disconnected).await?;
    assert!(session.is_closed());

    let result = session
        .open_channel(ChannelKind::Session(SessionRequest::Shell))
        .await;
    match result {
        Err(SkiffError::Disconnected { reason, description }) => {
            assert_eq!(reason, disconnect::BY_APPLICATION);
            assert_eq!(description, "maintenance");
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_local_disconnect_notifies_server() -> TestResult {
    let (session, mut server) = timeout(LIMIT, connect_authenticated(ServerOptions::default(), client_config())).await??;
    session.disconnect(disconnect::BY_APPLICATION, "done").await?;
    assert!(session.is_closed());

    let payload = timeout(LIMIT, server.expect(MessageType::Disconnect)).await??;
    let message = Disconnect::from_bytes(&payload)?;
    assert_eq!(message.reason, disconnect::BY_APPLICATION);
    assert_eq!(message.description, "done");
    Ok(())
}

#[tokio::test]
async fn test_keepalive_probes_then_gives_up() -> TestResult {
    let mut config = client_config();
    config.transport.keepalive_interval = Some(Duration::from_millis(50));
    config.transport.keepalive_max_count = 2;
    let (session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), config)).await??;

    for _ in 0..2 {
        let payload = timeout(LIMIT, server.expect(MessageType::GlobalRequest)).await??;
        let probe = GlobalRequest::from_bytes(&payload)?;
        assert_eq!(probe.name, "keepalive@openssh.com");
        assert!(probe.want_reply);
    }
    timeout(LIMIT, server.expect(MessageType::Disconnect)).await??;
    eventually(|| session.is_closed()).await?;

    let result = session.rekey().await;
    assert!(matches!(result, Err(SkiffError::Timeout(_))));
    Ok(())
}

#[tokio::test]
async fn test_keepalive_reply_resets_counter() -> TestResult {
    let mut config = client_config();
    config.transport.keepalive_interval = Some(Duration::from_millis(250));
    config.transport.keepalive_max_count = 1;
    let (session, mut server) = timeout(LIMIT, connect(ServerOptions::default(), config)).await??;

    for _ in 0..3 {
        timeout(LIMIT, server.expect(MessageType::GlobalRequest)).await??;
        server.send(&[MessageType::RequestFailure as u8]).await?;
    }
    assert!(!session.is_closed());
    Ok(())
}
