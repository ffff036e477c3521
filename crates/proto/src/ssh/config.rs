//! Client configuration.
//!
//! [`SshClientConfig`] is handed to [`Session::connect`](crate::ssh::session::Session::connect)
//! and stays fixed for the life of the session. [`AuthConfig`] is handed to
//! [`Session::authenticate`](crate::ssh::session::Session::authenticate).
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::config::{AuthConfig, SshClientConfig};
//! use skiff_proto::ssh::known_hosts::TrustPolicy;
//!
//! let mut config = SshClientConfig::default();
//! config.trust_policy = TrustPolicy::AcceptNew;
//! config.validate().unwrap();
//!
//! let auth = AuthConfig::new("alice").with_password("secret");
//! assert_eq!(auth.user(), "alice");
//! ```

use crate::ssh::auth::{NoInteraction, UserInteraction};
use crate::ssh::connection::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE};
use crate::ssh::identity::{Identity, IdentityRepository};
use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::known_hosts::{HostKeyPrompt, HostKeyRepository, KnownHosts, TrustPolicy};
use crate::ssh::packet::PACKET_MAX_SIZE;
use crate::ssh::registry::AlgorithmRegistry;
use crate::ssh::transport::TransportConfig;
use skiff_platform::{SkiffError, SkiffResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Which server-initiated channels are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardingPolicy {
    /// Accept `forwarded-tcpip`. Set automatically once a remote forward
    /// has been granted.
    pub forwarded_tcpip: bool,
    /// Accept `x11`.
    pub x11: bool,
    /// Accept `auth-agent@openssh.com`.
    pub agent: bool,
}

/// SSH client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Upper bound for a channel open to be confirmed.
    pub channel_open_timeout: Duration,
    /// Software version in the identification string.
    pub user_agent: String,
    /// Ordered algorithm lists offered in KEXINIT.
    pub algorithms: AlgorithmPreferences,
    /// Providers the negotiated names are resolved against.
    pub registry: Arc<AlgorithmRegistry>,
    /// Host key checking policy.
    pub trust_policy: TrustPolicy,
    /// Known host keys.
    pub host_key_repository: Arc<dyn HostKeyRepository>,
    /// Asked about unknown or changed keys under [`TrustPolicy::Ask`].
    pub host_key_prompt: Option<Arc<dyn HostKeyPrompt>>,
    /// Key exchange, rekey, keepalive and banner limits.
    pub transport: TransportConfig,
    /// Local window advertised for each channel.
    pub window_size: u32,
    /// Local maximum packet size advertised for each channel.
    pub max_packet_size: u32,
    /// Server-initiated channel types to accept.
    pub forwarding: ForwardingPolicy,
}

impl SshClientConfig {
    /// Checks the configuration before connecting.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] for inconsistent limits or an
    /// algorithm category the registry cannot serve.
    pub fn validate(&self) -> SkiffResult<()> {
        self.transport.validate()?;
        if self.window_size == 0 {
            return Err(SkiffError::Config("window_size must be positive".to_string()));
        }
        if self.max_packet_size == 0 || self.max_packet_size as usize > PACKET_MAX_SIZE - 1024 {
            return Err(SkiffError::Config(format!(
                "max_packet_size {} outside 1..={}",
                self.max_packet_size,
                PACKET_MAX_SIZE - 1024
            )));
        }
        if self.user_agent.is_empty() || self.user_agent.contains(char::is_whitespace) {
            return Err(SkiffError::Config(format!(
                "user_agent must be a single non-empty token, got {:?}",
                self.user_agent
            )));
        }
        self.algorithms.supported(&self.registry)?;
        Ok(())
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            channel_open_timeout: Duration::from_secs(30),
            user_agent: format!("skiff_{}", env!("CARGO_PKG_VERSION")),
            algorithms: AlgorithmPreferences::default(),
            registry: Arc::new(AlgorithmRegistry::with_defaults()),
            trust_policy: TrustPolicy::default(),
            host_key_repository: Arc::new(KnownHosts::new()),
            host_key_prompt: None,
            transport: TransportConfig::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            forwarding: ForwardingPolicy::default(),
        }
    }
}

impl fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("channel_open_timeout", &self.channel_open_timeout)
            .field("user_agent", &self.user_agent)
            .field("algorithms", &self.algorithms)
            .field("registry", &self.registry)
            .field("trust_policy", &self.trust_policy)
            .field("host_key_repository", &self.host_key_repository.identifier())
            .field(
                "host_key_prompt",
                &self.host_key_prompt.as_ref().map(|_| "<prompt>"),
            )
            .field("transport", &self.transport)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("forwarding", &self.forwarding)
            .finish()
    }
}

/// Settings for `hostbased` authentication.
#[derive(Clone)]
pub struct HostbasedConfig {
    /// The client host's key.
    pub identity: Arc<dyn Identity>,
    /// Fully qualified client host name.
    pub client_host: String,
    /// User name on the client host.
    pub client_user: String,
}

impl fmt::Debug for HostbasedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostbasedConfig")
            .field("identity", &self.identity.name())
            .field("client_host", &self.client_host)
            .field("client_user", &self.client_user)
            .finish()
    }
}

/// Default method order.
pub const DEFAULT_AUTH_METHODS: [&str; 3] = ["publickey", "keyboard-interactive", "password"];

/// User authentication settings.
#[derive(Clone)]
pub struct AuthConfig {
    user: String,
    methods: Vec<String>,
    password: Option<Zeroizing<String>>,
    identities: IdentityRepository,
    hostbased: Option<HostbasedConfig>,
    interaction: Arc<dyn UserInteraction>,
}

impl AuthConfig {
    /// Authenticates as `user` with the default method order and no
    /// credentials.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            methods: DEFAULT_AUTH_METHODS.iter().map(|m| m.to_string()).collect(),
            password: None,
            identities: IdentityRepository::new(),
            hostbased: None,
            interaction: Arc::new(NoInteraction),
        }
    }

    /// Replaces the method preference list.
    pub fn with_methods<S: AsRef<str>>(mut self, methods: &[S]) -> Self {
        self.methods = methods.iter().map(|m| m.as_ref().to_string()).collect();
        self
    }

    /// Uses `password` for `password` authentication.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Adds an identity for `publickey` authentication.
    pub fn with_identity(self, identity: Arc<dyn Identity>) -> Self {
        self.identities.add(identity);
        self
    }

    /// Uses an existing identity repository.
    pub fn with_identities(mut self, identities: IdentityRepository) -> Self {
        self.identities = identities;
        self
    }

    /// Enables `hostbased` authentication.
    pub fn with_hostbased(mut self, hostbased: HostbasedConfig) -> Self {
        self.hostbased = Some(hostbased);
        self
    }

    /// Sets the hook for banners, prompts and passphrases.
    pub fn with_interaction(mut self, interaction: Arc<dyn UserInteraction>) -> Self {
        self.interaction = interaction;
        self
    }

    /// User name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Method preference list.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Configured password.
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }

    /// Identities for `publickey`.
    pub fn identities(&self) -> &IdentityRepository {
        &self.identities
    }

    /// Settings for `hostbased`.
    pub fn hostbased(&self) -> Option<&HostbasedConfig> {
        self.hostbased.as_ref()
    }

    /// Interaction hook.
    pub fn interaction(&self) -> &dyn UserInteraction {
        self.interaction.as_ref()
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("methods", &self.methods)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identities", &self.identities)
            .field("hostbased", &self.hostbased)
            .finish_non_exhaustive()
    }
}
