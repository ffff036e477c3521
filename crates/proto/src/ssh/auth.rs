//! SSH user authentication (RFC 4252, RFC 4256).
//!
//! Supported methods:
//! - `none` - probes the server's method list
//! - `password` - with password change requests
//! - `publickey` - query first, sign on `PK_OK`
//! - `keyboard-interactive` - prompts answered through [`UserInteraction`]
//! - `hostbased` - signed with the client host's key
//!
//! [`authenticate`] walks the configured method order. A failure moves on
//! to the next method. A partial success records the method as done and,
//! when the server's list changed, starts over from the first preference.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new(
//!     "alice",
//!     "ssh-connection",
//!     AuthMethod::Password {
//!         password: "secret".to_string(),
//!         new_password: None,
//!     },
//! );
//! assert_eq!(request.to_bytes()[0], 50);
//! ```

use crate::ssh::buffer::WireBuffer;
use crate::ssh::config::AuthConfig;
use crate::ssh::identity::Identity;
use crate::ssh::message::MessageType;
use crate::ssh::transport::{encode_service_request, parse_service_accept};
use async_trait::async_trait;
use skiff_platform::{SkiffError, SkiffResult};
use std::fmt;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service started after authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

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

/// Authentication method with its request fields.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// `none`
    None,
    /// `password`; `new_password` answers a change request.
    Password {
        /// Current password
        password: String,
        /// Replacement password
        new_password: Option<String>,
    },
    /// `publickey`; without a signature this is a query.
    PublicKey {
        /// Signature algorithm name
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature blob
        signature: Option<Vec<u8>>,
    },
    /// `keyboard-interactive`
    KeyboardInteractive {
        /// Comma separated submethod hints, usually empty
        submethods: String,
    },
    /// `hostbased`
    Hostbased {
        /// Signature algorithm name
        algorithm: String,
        /// Client host public key blob
        public_key: Vec<u8>,
        /// Client host name
        client_host: String,
        /// User name on the client host
        client_user: String,
        /// Signature blob
        signature: Vec<u8>,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethod::Hostbased { .. } => "hostbased",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { new_password, .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .field("new_password", &new_password.as_ref().map(|_| "<redacted>"))
                .finish(),
            AuthMethod::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish_non_exhaustive(),
            AuthMethod::Hostbased {
                algorithm,
                client_host,
                client_user,
                ..
            } => f
                .debug_struct("Hostbased")
                .field("algorithm", algorithm)
                .field("client_host", client_host)
                .field("client_user", client_user)
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password {
            password,
            new_password,
        } = self
        {
            password.zeroize();
            if let Some(p) = new_password {
                p.zeroize();
            }
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request for `user_name` to start `service_name`.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        buf.put_str(&self.user_name);
        buf.put_str(&self.service_name);
        buf.put_str(self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                buf.put_bool(new_password.is_some());
                buf.put_str(password);
                if let Some(new) = new_password {
                    buf.put_str(new);
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_bool(signature.is_some());
                buf.put_str(algorithm);
                buf.put_string(public_key);
                if let Some(sig) = signature {
                    buf.put_string(sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // language tag, deprecated
                buf.put_str("");
                buf.put_str(submethods);
            }
            AuthMethod::Hostbased {
                algorithm,
                public_key,
                client_host,
                client_user,
                signature,
            } => {
                buf.put_str(algorithm);
                buf.put_string(public_key);
                buf.put_str(client_host);
                buf.put_str(client_user);
                buf.put_string(signature);
            }
        }

        buf.into_vec()
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for a wrong message type, a
    /// truncated body or an unknown method.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::UserauthRequest)?;
        let user_name = buf.get_utf8()?;
        let service_name = buf.get_utf8()?;
        let method_name = buf.get_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let changing = buf.get_bool()?;
                let password = buf.get_utf8()?;
                let new_password = if changing {
                    Some(buf.get_utf8()?)
                } else {
                    None
                };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let has_signature = buf.get_bool()?;
                let algorithm = buf.get_utf8()?;
                let public_key = buf.get_string()?;
                let signature = if has_signature {
                    Some(buf.get_string()?)
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = buf.get_string()?;
                AuthMethod::KeyboardInteractive {
                    submethods: buf.get_utf8()?,
                }
            }
            "hostbased" => AuthMethod::Hostbased {
                algorithm: buf.get_utf8()?,
                public_key: buf.get_string()?,
                client_host: buf.get_utf8()?,
                client_user: buf.get_utf8()?,
                signature: buf.get_string()?,
            },
            other => {
                return Err(SkiffError::Protocol(format!(
                    "Unknown authentication method: {}",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can continue
    pub methods: Vec<String>,
    /// The request succeeded but more methods are required
    pub partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods,
            partial_success,
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods);
        buf.put_bool(self.partial_success);
        buf.into_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::UserauthFailure)?;
        Ok(Self {
            methods: buf.get_name_list()?,
            partial_success: buf.get_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text
    pub message: String,
    /// Language tag
    pub language: String,
}

impl AuthBanner {
    /// Creates a banner without a language tag.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            language: String::new(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        buf.put_str(&self.message);
        buf.put_str(&self.language);
        buf.into_vec()
    }

    /// Parses the message. Invalid UTF-8 is replaced and a missing
    /// language tag is tolerated.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::UserauthBanner)?;
        let message = String::from_utf8_lossy(&buf.get_string()?).into_owned();
        let language = buf.get_utf8().unwrap_or_default();
        Ok(Self { message, language })
    }
}

/// SSH_MSG_USERAUTH_PK_OK (RFC 4252 Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    /// Algorithm from the query
    pub algorithm: String,
    /// Public key blob from the query
    pub public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates the message.
    pub fn new(algorithm: &str, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            public_key,
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_str(&self.algorithm);
        buf.put_string(&self.public_key);
        buf.into_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::UserauthPkOk)?;
        Ok(Self {
            algorithm: buf.get_utf8()?,
            public_key: buf.get_string()?,
        })
    }
}

/// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (RFC 4252 Section 8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordChangeRequest {
    /// Prompt to show the user
    pub prompt: String,
    /// Language tag
    pub language: String,
}

impl PasswordChangeRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_u8(crate::ssh::message::USERAUTH_PASSWD_CHANGEREQ);
        buf.put_str(&self.prompt);
        buf.put_str(&self.language);
        buf.into_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::UserauthPkOk)?;
        Ok(Self {
            prompt: String::from_utf8_lossy(&buf.get_string()?).into_owned(),
            language: buf.get_utf8().unwrap_or_default(),
        })
    }
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Title
    pub name: String,
    /// Instructions
    pub instruction: String,
    /// Prompts in order
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_u8(crate::ssh::message::USERAUTH_INFO_REQUEST);
        buf.put_str(&self.name);
        buf.put_str(&self.instruction);
        buf.put_str("");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            buf.put_str(&prompt.text);
            buf.put_bool(prompt.echo);
        }
        buf.into_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::UserauthPkOk)?;
        let name = String::from_utf8_lossy(&buf.get_string()?).into_owned();
        let instruction = String::from_utf8_lossy(&buf.get_string()?).into_owned();
        let _language = buf.get_string()?;
        let count = buf.get_u32()? as usize;
        // Each prompt takes at least five bytes.
        if count > buf.remaining() / 5 {
            return Err(SkiffError::Protocol(format!(
                "INFO_REQUEST announces {} prompts in {} bytes",
                count,
                buf.remaining()
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(Prompt {
                text: String::from_utf8_lossy(&buf.get_string()?).into_owned(),
                echo: buf.get_bool()?,
            });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Answers in prompt order
    pub responses: Vec<Zeroizing<String>>,
}

impl InfoResponse {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            buf.put_str(response);
        }
        buf.into_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut buf = expect(data, MessageType::UserauthInfoResponse)?;
        let count = buf.get_u32()? as usize;
        if count > buf.remaining() / 4 {
            return Err(SkiffError::Protocol(format!(
                "INFO_RESPONSE announces {} answers in {} bytes",
                count,
                buf.remaining()
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(Zeroizing::new(buf.get_utf8()?));
        }
        Ok(Self { responses })
    }
}

impl fmt::Debug for InfoResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfoResponse")
            .field("responses", &self.responses.len())
            .finish()
    }
}

/// Data signed for `publickey` (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut buf = WireBuffer::with_capacity(session_id.len() + public_key.len() + 128);
    buf.put_string(session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_str(user_name);
    buf.put_str(service_name);
    buf.put_str("publickey");
    buf.put_bool(true);
    buf.put_str(algorithm);
    buf.put_string(public_key);
    buf.into_vec()
}

/// Data signed for `hostbased` (RFC 4252 Section 9).
pub fn hostbased_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
    client_host: &str,
    client_user: &str,
) -> Vec<u8> {
    let mut buf = WireBuffer::with_capacity(session_id.len() + public_key.len() + 128);
    buf.put_string(session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_str(user_name);
    buf.put_str(service_name);
    buf.put_str("hostbased");
    buf.put_str(algorithm);
    buf.put_string(public_key);
    buf.put_str(client_host);
    buf.put_str(client_user);
    buf.into_vec()
}

/// Callbacks for the human side of authentication.
///
/// Every method defaults to "no answer". Returning `None` from a prompt
/// cancels the method that asked.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    /// Shows a server banner.
    async fn show_banner(&self, _banner: &str) {}

    /// Asks for the password of `user`.
    async fn password(&self, _user: &str) -> Option<String> {
        None
    }

    /// Asks for the passphrase of the identity called `identity`.
    async fn passphrase(&self, _identity: &str) -> Option<String> {
        None
    }

    /// Asks for a new password after a change request.
    async fn change_password(&self, _prompt: &str) -> Option<String> {
        None
    }

    /// Answers keyboard-interactive prompts, one answer per prompt.
    async fn keyboard_interactive(&self, _request: &InfoRequest) -> Option<Vec<String>> {
        None
    }
}

/// An interaction hook that never answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInteraction;

impl UserInteraction for NoInteraction {}

/// Message path used by [`authenticate`].
///
/// `recv` yields only SERVICE_ACCEPT and user authentication messages.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    /// Sends one payload.
    async fn send(&self, payload: Vec<u8>) -> SkiffResult<()>;

    /// Receives the next authentication payload.
    async fn recv(&self) -> SkiffResult<Vec<u8>>;

    /// Session identifier of the transport.
    fn session_id(&self) -> SkiffResult<Vec<u8>>;

    /// Whether the server already accepted `ssh-userauth`.
    fn service_accepted(&self) -> bool {
        false
    }

    /// Records that the server accepted `ssh-userauth`.
    fn set_service_accepted(&self) {}
}

/// Result of one method attempt.
#[derive(Debug)]
enum Outcome {
    Success,
    Failure(AuthFailure),
    /// The user declined to answer; the server's last word, if any.
    Cancelled(Option<AuthFailure>),
    /// Nothing was sent because the method has no usable credentials.
    NotApplicable,
}

/// Runs user authentication to completion.
///
/// # Errors
///
/// - [`SkiffError::AuthFailed`] with the server's last method list once
///   every configured method is exhausted
/// - [`SkiffError::AuthCancelled`] if the last attempt was cancelled
/// - transport errors as they occur
pub async fn authenticate(transport: &dyn AuthTransport, config: &AuthConfig) -> SkiffResult<()> {
    // Requested once per connection.
    if !transport.service_accepted() {
        transport
            .send(encode_service_request(SERVICE_USERAUTH))
            .await?;
        let accept = transport.recv().await?;
        reject_unimplemented(&accept)?;
        let service = parse_service_accept(&accept)?;
        if !service.is_empty() && service != SERVICE_USERAUTH {
            return Err(SkiffError::Protocol(format!(
                "Server accepted service {:?} instead of {}",
                service, SERVICE_USERAUTH
            )));
        }
        transport.set_service_accepted();
    }

    let driver = AuthDriver {
        transport,
        config,
        session_id: transport.session_id()?,
    };
    driver.run().await
}

/// Turns an UNIMPLEMENTED reply into an error.
fn reject_unimplemented(payload: &[u8]) -> SkiffResult<()> {
    if payload.first() != Some(&(MessageType::Unimplemented as u8)) {
        return Ok(());
    }
    let mut buf = WireBuffer::from_slice(&payload[1..]);
    let sequence = buf.get_u32()?;
    Err(SkiffError::NotImplemented(format!(
        "Server did not understand authentication packet {}",
        sequence
    )))
}

struct AuthDriver<'a> {
    transport: &'a dyn AuthTransport,
    config: &'a AuthConfig,
    session_id: Vec<u8>,
}

impl AuthDriver<'_> {
    async fn run(&self) -> SkiffResult<()> {
        let mut methods = match self.send_and_wait(AuthMethod::None).await? {
            Outcome::Success => {
                debug!("Authenticated with none");
                return Ok(());
            }
            Outcome::Failure(f) => f.methods,
            _ => Vec::new(),
        };
        debug!(?methods, "Server authentication methods");

        let preferences = self.config.methods();
        let mut completed: Vec<String> = Vec::new();
        let mut last_cancelled = false;
        let mut cursor = 0;

        while cursor < preferences.len() {
            let method = &preferences[cursor];
            cursor += 1;
            if !methods.contains(method) || completed.contains(method) {
                continue;
            }

            debug!(method = %method, "Trying authentication method");
            let outcome = match method.as_str() {
                "password" => self.password().await?,
                "publickey" => self.publickey().await?,
                "keyboard-interactive" => self.keyboard_interactive().await?,
                "hostbased" => self.hostbased().await?,
                other => {
                    debug!(method = other, "Unsupported authentication method");
                    Outcome::NotApplicable
                }
            };

            let failure = match outcome {
                Outcome::Success => {
                    debug!(method = %method, "Authentication succeeded");
                    return Ok(());
                }
                Outcome::NotApplicable => continue,
                Outcome::Cancelled(failure) => {
                    debug!(method = %method, "Authentication method cancelled");
                    last_cancelled = true;
                    match failure {
                        Some(f) => f,
                        None => continue,
                    }
                }
                Outcome::Failure(f) => {
                    last_cancelled = false;
                    f
                }
            };

            if failure.partial_success {
                debug!(method = %method, next = ?failure.methods, "Partial success");
                completed.push(method.clone());
                if failure.methods != methods {
                    cursor = 0;
                }
            }
            methods = failure.methods;
        }

        if last_cancelled {
            Err(SkiffError::AuthCancelled)
        } else {
            Err(SkiffError::AuthFailed { methods })
        }
    }

    fn request(&self, method: AuthMethod) -> Vec<u8> {
        AuthRequest::new(self.config.user(), SERVICE_CONNECTION, method).to_bytes()
    }

    /// Next message that is not a banner.
    async fn recv(&self) -> SkiffResult<Vec<u8>> {
        loop {
            let payload = self.transport.recv().await?;
            reject_unimplemented(&payload)?;
            if payload.first() == Some(&(MessageType::UserauthBanner as u8)) {
                let banner = AuthBanner::from_bytes(&payload)?;
                self.config.interaction().show_banner(&banner.message).await;
                continue;
            }
            return Ok(payload);
        }
    }

    /// Maps SUCCESS or FAILURE; anything else is returned for the caller.
    fn conclude(payload: &[u8]) -> SkiffResult<Option<Outcome>> {
        match payload.first().copied() {
            Some(b) if b == MessageType::UserauthSuccess as u8 => Ok(Some(Outcome::Success)),
            Some(b) if b == MessageType::UserauthFailure as u8 => {
                Ok(Some(Outcome::Failure(AuthFailure::from_bytes(payload)?)))
            }
            _ => Ok(None),
        }
    }

    async fn send_and_wait(&self, method: AuthMethod) -> SkiffResult<Outcome> {
        let name = method.name().to_string();
        self.transport.send(self.request(method)).await?;
        let reply = self.recv().await?;
        Self::conclude(&reply)?.ok_or_else(|| unexpected(&name, &reply))
    }

    async fn password(&self) -> SkiffResult<Outcome> {
        let interaction = self.config.interaction();
        let password = match self.config.password() {
            Some(p) => Zeroizing::new(p.to_string()),
            None => match interaction.password(self.config.user()).await {
                Some(p) => Zeroizing::new(p),
                None => return Ok(Outcome::Cancelled(None)),
            },
        };

        let mut method = AuthMethod::Password {
            password: password.to_string(),
            new_password: None,
        };
        loop {
            self.transport.send(self.request(method)).await?;
            let reply = self.recv().await?;
            if let Some(outcome) = Self::conclude(&reply)? {
                return Ok(outcome);
            }
            if reply.first() != Some(&crate::ssh::message::USERAUTH_PASSWD_CHANGEREQ) {
                return Err(unexpected("password", &reply));
            }

            let change = PasswordChangeRequest::from_bytes(&reply)?;
            debug!("Server requested a password change");
            match interaction.change_password(&change.prompt).await {
                Some(new_password) => {
                    method = AuthMethod::Password {
                        password: password.to_string(),
                        new_password: Some(new_password),
                    };
                }
                None => return Ok(Outcome::Cancelled(None)),
            }
        }
    }

    async fn publickey(&self) -> SkiffResult<Outcome> {
        let mut last = Outcome::NotApplicable;
        for identity in self.config.identities().identities() {
            match self.try_identity(identity.as_ref()).await? {
                Outcome::Failure(f) if !f.partial_success => last = Outcome::Failure(f),
                Outcome::NotApplicable => {}
                outcome => return Ok(outcome),
            }
        }
        Ok(last)
    }

    async fn try_identity(&self, identity: &dyn Identity) -> SkiffResult<Outcome> {
        let algorithm = identity.algorithm().name().to_string();
        let blob = identity.public_key_blob();
        debug!(identity = identity.name(), algorithm = %algorithm, "Querying public key");

        self.transport
            .send(self.request(AuthMethod::PublicKey {
                algorithm: algorithm.clone(),
                public_key: blob.clone(),
                signature: None,
            }))
            .await?;
        let reply = self.recv().await?;
        if let Some(outcome) = Self::conclude(&reply)? {
            return Ok(outcome);
        }
        let pk_ok = AuthPkOk::from_bytes(&reply)?;
        if pk_ok.public_key != blob {
            return Err(SkiffError::Protocol(
                "PK_OK names a different public key".to_string(),
            ));
        }

        if identity.is_encrypted() {
            let passphrase = match self.config.interaction().passphrase(identity.name()).await {
                Some(p) => Zeroizing::new(p),
                None => return Ok(Outcome::Cancelled(None)),
            };
            if let Err(e) = identity.unlock(&passphrase) {
                warn!(identity = identity.name(), error = %e, "Could not unlock identity");
                return Ok(Outcome::NotApplicable);
            }
        }

        let data = construct_signature_data(
            &self.session_id,
            self.config.user(),
            SERVICE_CONNECTION,
            &algorithm,
            &blob,
        );
        let signature = identity.sign(&data)?;
        self.send_and_wait(AuthMethod::PublicKey {
            algorithm,
            public_key: blob,
            signature: Some(signature),
        })
        .await
    }

    async fn keyboard_interactive(&self) -> SkiffResult<Outcome> {
        self.transport
            .send(self.request(AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            }))
            .await?;

        let mut cancelled = false;
        loop {
            let reply = self.recv().await?;
            if let Some(outcome) = Self::conclude(&reply)? {
                return Ok(match outcome {
                    Outcome::Failure(f) if cancelled => Outcome::Cancelled(Some(f)),
                    outcome => outcome,
                });
            }
            if reply.first() != Some(&crate::ssh::message::USERAUTH_INFO_REQUEST) {
                return Err(unexpected("keyboard-interactive", &reply));
            }

            let request = InfoRequest::from_bytes(&reply)?;
            let answers = self.answer(&request).await;
            let responses = match answers {
                Some(answers) if answers.len() == request.prompts.len() => answers,
                Some(answers) => {
                    return Err(SkiffError::Protocol(format!(
                        "{} answers for {} keyboard-interactive prompts",
                        answers.len(),
                        request.prompts.len()
                    )))
                }
                None => {
                    // Empty answers make the server fail the attempt.
                    cancelled = true;
                    vec![String::new(); request.prompts.len()]
                }
            };
            let response = InfoResponse {
                responses: responses.into_iter().map(Zeroizing::new).collect(),
            };
            self.transport.send(response.to_bytes()).await?;
        }
    }

    async fn answer(&self, request: &InfoRequest) -> Option<Vec<String>> {
        if request.prompts.is_empty() {
            return Some(Vec::new());
        }
        if let Some(answers) = self.config.interaction().keyboard_interactive(request).await {
            return Some(answers);
        }
        // A lone hidden prompt is a password prompt.
        match (self.config.password(), request.prompts.as_slice()) {
            (Some(password), [prompt]) if !prompt.echo => Some(vec![password.to_string()]),
            _ => None,
        }
    }

    async fn hostbased(&self) -> SkiffResult<Outcome> {
        let Some(hostbased) = self.config.hostbased() else {
            return Ok(Outcome::NotApplicable);
        };
        let algorithm = hostbased.identity.algorithm().name().to_string();
        let blob = hostbased.identity.public_key_blob();
        let data = hostbased_signature_data(
            &self.session_id,
            self.config.user(),
            SERVICE_CONNECTION,
            &algorithm,
            &blob,
            &hostbased.client_host,
            &hostbased.client_user,
        );
        let signature = hostbased.identity.sign(&data)?;
        self.send_and_wait(AuthMethod::Hostbased {
            algorithm,
            public_key: blob,
            client_host: hostbased.client_host.clone(),
            client_user: hostbased.client_user.clone(),
            signature,
        })
        .await
    }
}

fn unexpected(method: &str, payload: &[u8]) -> SkiffError {
    SkiffError::Protocol(format!(
        "Unexpected message {:?} during {} authentication",
        payload.first(),
        method
    ))
}
