//! Key exchange driver (RFC 4253 Sections 7 and 8).
//!
//! Runs inside the reader task. The first exchange and every rekey go
//! through the same phases:
//!
//! ```text
//! Idle -> KexInitSent -> [AwaitingGexGroup] -> AwaitingReply -> AwaitingNewKeys -> Idle
//! ```
//!
//! Outbound keys are installed under the write lock in the same critical
//! section that writes NEWKEYS. Inbound keys wait for the peer's NEWKEYS.

use super::{lock, SessionInner};
use crate::ssh::compression::{Compressor, Decompressor, DEFAULT_LEVEL};
use crate::ssh::crypto::{CipherDirection, CipherProvider, MacProvider, PacketCipher, PacketMac};
use crate::ssh::hostkey::{verify_signature, HostKeyAlgorithm};
use crate::ssh::kex::{guess_was_correct, negotiate_with, KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{
    encode_gex_request, encode_kex_init, exchange_hash, parse_gex_group, DhExchange, DhGroup,
    EcdhExchange, ExchangeHashInput, ExchangeValues, KexFlavor, KexMethod, KexReply, KeyLengths,
    SessionKeys,
};
use crate::ssh::known_hosts::{host_entry_name, verify_host_key};
use crate::ssh::message::MessageType;
use crate::ssh::packet::PacketDecoder;
use crate::ssh::transport::SessionState;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    KexInitSent,
    AwaitingGexGroup,
    AwaitingReply,
    AwaitingNewKeys,
}

enum Exchange {
    Dh(DhExchange),
    Ecdh(EcdhExchange),
}

struct InboundKeys {
    cipher: Box<dyn PacketCipher>,
    mac: Box<dyn PacketMac>,
    decompressor: Option<Box<dyn Decompressor>>,
    delayed: bool,
}

struct OutboundKeys {
    cipher: Box<dyn PacketCipher>,
    mac: Box<dyn PacketMac>,
    compressor: Option<Box<dyn Compressor>>,
    delayed: bool,
}

pub(crate) struct KexDriver {
    phase: Phase,
    ours: Option<(KexInit, Vec<u8>)>,
    theirs: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    method: Option<KexMethod>,
    exchange: Option<Exchange>,
    gex_group: Option<(Vec<u8>, Vec<u8>)>,
    ignore_next: bool,
    inbound: Option<InboundKeys>,
}

impl KexDriver {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Idle,
            ours: None,
            theirs: None,
            negotiated: None,
            method: None,
            exchange: None,
            gex_group: None,
            ignore_next: false,
            inbound: None,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// True between the peer's KEXINIT and its NEWKEYS, when it may only
    /// send key exchange messages.
    pub(crate) fn peer_in_kex(&self) -> bool {
        self.theirs.is_some()
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Sends our KEXINIT and closes the gate for application writes.
    pub(crate) async fn start(&mut self, inner: &SessionInner) -> SkiffResult<()> {
        if self.phase != Phase::Idle {
            return Ok(());
        }
        let prefs = inner.config.algorithms.supported(&inner.config.registry)?;
        let kexinit = KexInit::from_preferences(&prefs);
        let payload = kexinit.to_bytes();

        {
            let mut writer = inner.writer.lock().await;
            writer.in_kex = true;
            inner.kex_status.send_modify(|s| s.in_kex = true);
            inner.write_locked(&mut writer, &payload).await?;
        }
        inner.set_state(SessionState::Kex);
        debug!(first = inner.session_id.get().is_none(), "Sent KEXINIT");

        self.ours = Some((kexinit, payload));
        self.phase = Phase::KexInitSent;
        Ok(())
    }

    /// Handles one message numbered 20 to 49. Returns true once inbound
    /// keys have been installed in `decoder`.
    pub(crate) async fn on_message(
        &mut self,
        inner: &SessionInner,
        decoder: &mut PacketDecoder,
        payload: &[u8],
    ) -> SkiffResult<bool> {
        let msg = payload.first().copied().unwrap_or(0);
        match msg {
            m if m == MessageType::KexInit as u8 => {
                self.on_kexinit(inner, payload).await?;
                Ok(false)
            }
            m if m == MessageType::NewKeys as u8 => {
                self.on_newkeys(inner, decoder, payload)?;
                Ok(true)
            }
            30..=49 if self.ignore_next => {
                debug!(msg, "Ignoring packet after wrong KEX guess");
                self.ignore_next = false;
                Ok(false)
            }
            30..=49 => {
                match self.phase {
                    Phase::AwaitingGexGroup => self.on_gex_group(inner, payload).await?,
                    Phase::AwaitingReply => self.on_reply(inner, payload).await?,
                    phase => {
                        return Err(SkiffError::Protocol(format!(
                            "Unexpected key exchange message {} in phase {:?}",
                            msg, phase
                        )))
                    }
                }
                Ok(false)
            }
            _ => Err(SkiffError::Protocol(format!(
                "Unexpected message {} during key exchange",
                msg
            ))),
        }
    }

    async fn on_kexinit(&mut self, inner: &SessionInner, payload: &[u8]) -> SkiffResult<()> {
        if self.theirs.is_some() {
            return Err(SkiffError::Protocol("Duplicate KEXINIT".to_string()));
        }
        let server = KexInit::from_bytes(payload)?;
        if self.phase == Phase::Idle {
            debug!("Server initiated key exchange");
            self.start(inner).await?;
        }
        self.theirs = Some(payload.to_vec());

        let client = match &self.ours {
            Some((kexinit, _)) => kexinit,
            None => return Err(SkiffError::Protocol("KEXINIT state lost".to_string())),
        };
        let registry = &inner.config.registry;
        let negotiated = negotiate_with(client, &server, |name| {
            registry.cipher(name).map_or(false, |c| c.tag_len() > 0)
        })?;
        if server.first_kex_packet_follows() && !guess_was_correct(client, &server) {
            self.ignore_next = true;
        }

        let method = KexMethod::from_name(&negotiated.kex).ok_or_else(|| {
            SkiffError::Protocol(format!("Negotiated unknown kex {}", negotiated.kex))
        })?;
        debug!(
            kex = %negotiated.kex,
            host_key = %negotiated.host_key,
            cipher_c2s = %negotiated.cipher_client_to_server,
            cipher_s2c = %negotiated.cipher_server_to_client,
            mac_c2s = %negotiated.mac_client_to_server,
            mac_s2c = %negotiated.mac_server_to_client,
            compression = %negotiated.compression_client_to_server,
            "Negotiated algorithms"
        );

        match method.flavor() {
            KexFlavor::Ecdh => {
                let exchange = EcdhExchange::new(method)?;
                inner
                    .send_from_reader(encode_kex_init(KexFlavor::Ecdh, exchange.public_key()))
                    .await?;
                self.exchange = Some(Exchange::Ecdh(exchange));
                self.phase = Phase::AwaitingReply;
            }
            KexFlavor::FixedGroup => {
                let group = method.fixed_group().ok_or_else(|| {
                    SkiffError::Protocol(format!("{} has no fixed group", method.name()))
                })??;
                let exchange = DhExchange::new(group)?;
                inner
                    .send_from_reader(encode_kex_init(KexFlavor::FixedGroup, exchange.public_key()))
                    .await?;
                self.exchange = Some(Exchange::Dh(exchange));
                self.phase = Phase::AwaitingReply;
            }
            KexFlavor::GroupExchange => {
                let t = &inner.config.transport;
                inner
                    .send_from_reader(encode_gex_request(t.gex_min, t.gex_preferred, t.gex_max))
                    .await?;
                self.phase = Phase::AwaitingGexGroup;
            }
        }

        self.method = Some(method);
        self.negotiated = Some(negotiated);
        Ok(())
    }

    async fn on_gex_group(&mut self, inner: &SessionInner, payload: &[u8]) -> SkiffResult<()> {
        let (p, g) = parse_gex_group(payload)?;
        let group = DhGroup::from_bytes(&p, &g);
        let bits = group.bits();
        let t = &inner.config.transport;
        if bits < u64::from(t.gex_min) || bits > u64::from(t.gex_max) {
            return Err(SkiffError::Protocol(format!(
                "Group exchange prime of {} bits outside [{}, {}]",
                bits, t.gex_min, t.gex_max
            )));
        }
        debug!(bits, "Received group exchange group");

        let exchange = DhExchange::new(group)?;
        inner
            .send_from_reader(encode_kex_init(KexFlavor::GroupExchange, exchange.public_key()))
            .await?;
        self.exchange = Some(Exchange::Dh(exchange));
        self.gex_group = Some((p, g));
        self.phase = Phase::AwaitingReply;
        Ok(())
    }

    async fn on_reply(&mut self, inner: &SessionInner, payload: &[u8]) -> SkiffResult<()> {
        let (method, negotiated) = match (self.method, self.negotiated.as_ref()) {
            (Some(m), Some(n)) => (m, n.clone()),
            _ => return Err(SkiffError::Protocol("Key exchange reply out of order".to_string())),
        };
        let reply = KexReply::parse(method.flavor(), payload)?;
        let (client_kexinit, server_kexinit) = match (&self.ours, &self.theirs) {
            (Some((_, ours)), Some(theirs)) => (ours.clone(), theirs.clone()),
            _ => return Err(SkiffError::Protocol("KEXINIT state lost".to_string())),
        };
        let input = ExchangeHashInput {
            client_version: inner.client_version.identification(),
            server_version: inner.server_version.identification(),
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
            host_key: &reply.host_key,
        };
        let hash = method.hash();

        let (shared_secret, h) = match self.exchange.take() {
            Some(Exchange::Ecdh(exchange)) => {
                let q_c = exchange.public_key().to_vec();
                let k = exchange.compute_shared_secret(&reply.server_public)?;
                let values = ExchangeValues::Ecdh {
                    q_c: &q_c,
                    q_s: &reply.server_public,
                };
                let h = exchange_hash(hash, &input, &values, &k);
                (k, h)
            }
            Some(Exchange::Dh(exchange)) => {
                let k = exchange.compute_shared_secret(&reply.server_public)?;
                let h = match &self.gex_group {
                    Some((p, g)) => {
                        let t = &inner.config.transport;
                        let values = ExchangeValues::GroupExchange {
                            min: t.gex_min,
                            preferred: t.gex_preferred,
                            max: t.gex_max,
                            p,
                            g,
                            e: exchange.public_key(),
                            f: &reply.server_public,
                        };
                        exchange_hash(hash, &input, &values, &k)
                    }
                    None => {
                        let values = ExchangeValues::Dh {
                            e: exchange.public_key(),
                            f: &reply.server_public,
                        };
                        exchange_hash(hash, &input, &values, &k)
                    }
                };
                (k, h)
            }
            None => {
                return Err(SkiffError::Protocol(
                    "Key exchange reply before our init".to_string(),
                ))
            }
        };

        let algorithm = HostKeyAlgorithm::from_name(&negotiated.host_key).ok_or_else(|| {
            SkiffError::Protocol(format!("Negotiated unknown host key {}", negotiated.host_key))
        })?;
        verify_signature(algorithm, &reply.host_key, &h, &reply.signature).map_err(|e| {
            SkiffError::Security(format!("Host key signature verification failed: {}", e))
        })?;

        match inner.host_key.get() {
            None => {
                let config = &inner.config;
                verify_host_key(
                    config.trust_policy,
                    config.host_key_repository.as_ref(),
                    config.host_key_prompt.as_deref(),
                    &host_entry_name(&inner.host, inner.port),
                    algorithm.key_type(),
                    &reply.host_key,
                )
                .await?;
                let _ = inner.host_key.set(reply.host_key.clone());
                let _ = inner.session_id.set(h.clone());
            }
            Some(known) if *known != reply.host_key => {
                return Err(SkiffError::HostKeyRejected(format!(
                    "Host key for {} changed during rekey",
                    inner.host
                )));
            }
            Some(_) => {}
        }
        let session_id = inner
            .session_id
            .get()
            .cloned()
            .ok_or_else(|| SkiffError::Protocol("Missing session identifier".to_string()))?;

        let (outbound, inbound) = install_keys(inner, &negotiated, method, &shared_secret, &h, &session_id)?;
        self.inbound = Some(inbound);

        {
            let mut writer = inner.writer.lock().await;
            inner
                .write_locked(&mut writer, &NewKeys::new().to_bytes())
                .await?;
            writer.encoder.set_keys(
                outbound.cipher,
                outbound.mac,
                outbound.compressor,
                outbound.delayed,
            );
            if inner.authenticated.load(Ordering::SeqCst) {
                writer.encoder.enable_delayed_compression();
            }
            writer.in_kex = false;
            while let Some(queued) = writer.pending.pop_front() {
                inner.write_locked(&mut writer, &queued).await?;
            }
        }
        inner.kex_status.send_modify(|s| s.in_kex = false);
        debug!("Sent NEWKEYS, outbound keys active");

        self.phase = Phase::AwaitingNewKeys;
        Ok(())
    }

    fn on_newkeys(
        &mut self,
        inner: &SessionInner,
        decoder: &mut PacketDecoder,
        payload: &[u8],
    ) -> SkiffResult<()> {
        if self.phase != Phase::AwaitingNewKeys {
            return Err(SkiffError::Protocol(format!(
                "Unexpected NEWKEYS in phase {:?}",
                self.phase
            )));
        }
        NewKeys::from_bytes(payload)?;
        let keys = self
            .inbound
            .take()
            .ok_or_else(|| SkiffError::Protocol("No inbound keys prepared".to_string()))?;
        decoder.set_keys(keys.cipher, keys.mac, keys.decompressor, keys.delayed);

        let authenticated = inner.authenticated.load(Ordering::SeqCst);
        if authenticated {
            decoder.enable_delayed_compression();
        }
        lock(&inner.traffic).reset();
        inner.rekey_requested.store(false, Ordering::SeqCst);
        let negotiated = self.negotiated.take();
        if let Some(n) = &negotiated {
            info!(kex = %n.kex, cipher = %n.cipher_client_to_server, "Key exchange complete");
        }
        *lock(&inner.negotiated) = negotiated;

        inner.set_state(if authenticated {
            SessionState::Running
        } else {
            SessionState::Authenticating
        });
        inner.kex_status.send_modify(|s| s.completed += 1);
        self.reset();
        Ok(())
    }
}

fn cipher_provider(inner: &SessionInner, name: &str) -> SkiffResult<Arc<dyn CipherProvider>> {
    inner
        .config
        .registry
        .cipher(name)
        .ok_or_else(|| SkiffError::Protocol(format!("No provider for cipher {}", name)))
}

fn mac_provider(inner: &SessionInner, name: &str, aead: bool) -> SkiffResult<Arc<dyn MacProvider>> {
    let name = if aead { "none" } else { name };
    inner
        .config
        .registry
        .mac(name)
        .ok_or_else(|| SkiffError::Protocol(format!("No provider for MAC {}", name)))
}

/// Derives the six values and instantiates both directions.
fn install_keys(
    inner: &SessionInner,
    negotiated: &NegotiatedAlgorithms,
    method: KexMethod,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
) -> SkiffResult<(OutboundKeys, InboundKeys)> {
    let registry = &inner.config.registry;
    let cipher_c2s = cipher_provider(inner, &negotiated.cipher_client_to_server)?;
    let cipher_s2c = cipher_provider(inner, &negotiated.cipher_server_to_client)?;
    let mac_c2s = mac_provider(inner, &negotiated.mac_client_to_server, cipher_c2s.tag_len() > 0)?;
    let mac_s2c = mac_provider(inner, &negotiated.mac_server_to_client, cipher_s2c.tag_len() > 0)?;
    let comp_c2s = registry
        .compression(&negotiated.compression_client_to_server)
        .ok_or_else(|| SkiffError::Protocol("No provider for outgoing compression".to_string()))?;
    let comp_s2c = registry
        .compression(&negotiated.compression_server_to_client)
        .ok_or_else(|| SkiffError::Protocol("No provider for incoming compression".to_string()))?;

    let lengths = KeyLengths {
        iv_client_to_server: cipher_c2s.iv_len(),
        iv_server_to_client: cipher_s2c.iv_len(),
        enc_client_to_server: cipher_c2s.key_len(),
        enc_server_to_client: cipher_s2c.key_len(),
        mac_client_to_server: mac_c2s.key_len(),
        mac_server_to_client: mac_s2c.key_len(),
    };
    let keys = SessionKeys::derive(method.hash(), shared_secret, exchange_hash, session_id, &lengths);

    let outbound = OutboundKeys {
        cipher: cipher_c2s.create(
            CipherDirection::Encrypt,
            &keys.enc_client_to_server,
            &keys.iv_client_to_server,
        )?,
        mac: mac_c2s.create(&keys.mac_client_to_server)?,
        compressor: (!comp_c2s.is_none()).then(|| comp_c2s.compressor(DEFAULT_LEVEL)),
        delayed: comp_c2s.is_delayed(),
    };
    let inbound = InboundKeys {
        cipher: cipher_s2c.create(
            CipherDirection::Decrypt,
            &keys.enc_server_to_client,
            &keys.iv_server_to_client,
        )?,
        mac: mac_s2c.create(&keys.mac_server_to_client)?,
        decompressor: (!comp_s2c.is_none()).then(|| comp_s2c.decompressor()),
        delayed: comp_s2c.is_delayed(),
    };
    Ok((outbound, inbound))
}
