//! Host key trust: the `known_hosts` store and the trust policy.
//!
//! [`KnownHosts`] is an in-memory [`HostKeyRepository`] that reads the
//! OpenSSH `known_hosts` text format:
//!
//! ```text
//! [hostnames] keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! [`verify_host_key`] applies a [`TrustPolicy`] to the repository's answer
//! and, for [`TrustPolicy::Ask`], consults a [`HostKeyPrompt`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::known_hosts::{HostKeyRepository, HostKeyStatus, KnownHosts};
//!
//! let known = KnownHosts::from_string("example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5").unwrap();
//! let blob = [0, 0, 0, 11, b's', b's', b'h', b'-', b'e', b'd', b'2', b'5', b'5', b'1', b'9'];
//! assert_eq!(known.check("example.com", "ssh-ed25519", &blob), HostKeyStatus::Ok);
//! assert_eq!(known.check("other.org", "ssh-ed25519", &blob), HostKeyStatus::NotIncluded);
//! ```

use crate::ssh::hostkey::fingerprint;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use skiff_platform::{SkiffError, SkiffResult};
use std::fmt;
use std::sync::RwLock;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

/// Name under which a host is stored: `host` on port 22, `[host]:port`
/// otherwise.
pub fn host_entry_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Produces an OpenSSH hashed hostname `|1|salt|hash`.
pub fn hash_hostname(host: &str, salt: &[u8]) -> SkiffResult<String> {
    let mut mac = HmacSha1::new_from_slice(salt)
        .map_err(|e| SkiffError::Security(format!("HMAC creation failed: {}", e)))?;
    mac.update(host.as_bytes());
    Ok(format!(
        "|1|{}|{}",
        STANDARD.encode(salt),
        STANDARD.encode(mac.finalize().into_bytes())
    ))
}

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    hostname_pattern: String,
    key_type: String,
    key_data: Vec<u8>,
    comment: String,
}

impl KnownHost {
    /// Creates an entry.
    pub fn new(hostname_pattern: String, key_type: String, key_data: Vec<u8>) -> Self {
        Self {
            hostname_pattern,
            key_type,
            key_data,
            comment: String::new(),
        }
    }

    /// Returns the hostname pattern.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks whether this entry applies to `host`, which is already in
    /// [`host_entry_name`] form.
    ///
    /// A matching negated pattern excludes the entry even if another
    /// pattern matches.
    pub fn matches(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in self.hostname_pattern.split(',') {
            let pattern = pattern.trim();
            if let Some(negated) = pattern.strip_prefix('!') {
                if Self::matches_pattern(negated, host) {
                    return false;
                }
                continue;
            }
            if Self::matches_pattern(pattern, host) {
                matched = true;
            }
        }
        matched
    }

    fn matches_pattern(pattern: &str, host: &str) -> bool {
        if pattern.starts_with("|1|") {
            return Self::verify_hashed_hostname(pattern, host);
        }
        if pattern.contains('*') || pattern.contains('?') {
            return wildcard_match(pattern.as_bytes(), host.as_bytes());
        }
        pattern.eq_ignore_ascii_case(host)
    }

    fn verify_hashed_hostname(hashed: &str, host: &str) -> bool {
        let parts: Vec<&str> = hashed.split('|').collect();
        if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
            return false;
        }
        let (Ok(salt), Ok(expected)) = (STANDARD.decode(parts[2]), STANDARD.decode(parts[3]))
        else {
            debug!("Ignoring malformed hashed known_hosts pattern");
            return false;
        };
        let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
            return false;
        };
        mac.update(host.as_bytes());
        mac.finalize().into_bytes().ct_eq(&expected[..]).into()
    }

    /// Parses one `known_hosts` line.
    ///
    /// Returns `Ok(None)` for blank lines, comments and marker lines
    /// (`@cert-authority`, `@revoked`), which this store does not use.
    pub fn parse_line(line: &str) -> SkiffResult<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace();
        let (Some(hostname_pattern), Some(key_type), Some(encoded)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SkiffError::Config(
                "Invalid known_hosts line: need host, key type and key".to_string(),
            ));
        };

        let key_data = STANDARD
            .decode(encoded)
            .map_err(|e| SkiffError::Config(format!("Invalid base64 key data: {}", e)))?;

        Ok(Some(Self {
            hostname_pattern: hostname_pattern.to_string(),
            key_type: key_type.to_string(),
            key_data,
            comment: parts.collect::<Vec<_>>().join(" "),
        }))
    }

    /// Formats the entry as a `known_hosts` line without the newline.
    pub fn to_line(&self) -> String {
        let encoded = STANDARD.encode(&self.key_data);
        if self.comment.is_empty() {
            format!("{} {} {}", self.hostname_pattern, self.key_type, encoded)
        } else {
            format!(
                "{} {} {} {}",
                self.hostname_pattern, self.key_type, encoded, self.comment
            )
        }
    }
}

/// `*` matches any run of bytes, `?` exactly one.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p].eq_ignore_ascii_case(&text[t])) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Result of looking a host key up in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// An entry for this host holds exactly this key.
    Ok,
    /// The host has an entry of this key type with a different key.
    Changed,
    /// No entry applies.
    NotIncluded,
}

/// Trust store consulted after every key exchange.
pub trait HostKeyRepository: Send + Sync {
    /// Looks up `key` for `host` (in [`host_entry_name`] form).
    fn check(&self, host: &str, key_type: &str, key: &[u8]) -> HostKeyStatus;

    /// Records a key for `host`.
    fn add(&self, host: &str, key_type: &str, key: &[u8]) -> SkiffResult<()>;

    /// Removes entries for `host`, limited to `key_type` when given.
    /// Returns how many entries were removed.
    fn remove(&self, host: &str, key_type: Option<&str>) -> SkiffResult<usize>;

    /// Stable name for user-facing messages.
    fn identifier(&self) -> String;
}

/// In-memory `known_hosts` store.
pub struct KnownHosts {
    entries: RwLock<Vec<KnownHost>>,
    identifier: String,
    hash_new_entries: bool,
}

impl KnownHosts {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            identifier: "known_hosts".to_string(),
            hash_new_entries: false,
        }
    }

    /// Parses `known_hosts` text. Malformed lines are skipped with a
    /// warning.
    pub fn from_string(content: &str) -> SkiffResult<Self> {
        let mut entries = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            match KnownHost::parse_line(line) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!("Skipping known_hosts line {}: {}", line_num + 1, e),
            }
        }
        Ok(Self {
            entries: RwLock::new(entries),
            ..Self::new()
        })
    }

    /// Sets the name reported by [`HostKeyRepository::identifier`].
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Stores hosts added later in hashed form.
    pub fn with_hashed_entries(mut self, hashed: bool) -> Self {
        self.hash_new_entries = hashed;
        self
    }

    /// Snapshot of the current entries.
    pub fn entries(&self) -> Vec<KnownHost> {
        self.read().clone()
    }

    /// Renders the store back to `known_hosts` text.
    pub fn to_openssh_string(&self) -> String {
        self.read()
            .iter()
            .map(|e| e.to_line() + "\n")
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<KnownHost>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<KnownHost>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for KnownHosts {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KnownHosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnownHosts")
            .field("identifier", &self.identifier)
            .field("entries", &self.read().len())
            .finish()
    }
}

impl HostKeyRepository for KnownHosts {
    fn check(&self, host: &str, key_type: &str, key: &[u8]) -> HostKeyStatus {
        let mut status = HostKeyStatus::NotIncluded;
        for entry in self.read().iter() {
            if entry.key_type != key_type || !entry.matches(host) {
                continue;
            }
            if entry.key_data == key {
                return HostKeyStatus::Ok;
            }
            status = HostKeyStatus::Changed;
        }
        status
    }

    fn add(&self, host: &str, key_type: &str, key: &[u8]) -> SkiffResult<()> {
        let pattern = if self.hash_new_entries {
            let mut salt = [0u8; 20];
            rand::thread_rng().fill_bytes(&mut salt);
            hash_hostname(host, &salt)?
        } else {
            host.to_string()
        };
        self.write()
            .push(KnownHost::new(pattern, key_type.to_string(), key.to_vec()));
        Ok(())
    }

    fn remove(&self, host: &str, key_type: Option<&str>) -> SkiffResult<usize> {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|e| !(e.matches(host) && key_type.map_or(true, |t| t == e.key_type)));
        Ok(before - entries.len())
    }

    fn identifier(&self) -> String {
        self.identifier.clone()
    }
}

/// Host key checking policy (OpenSSH `StrictHostKeyChecking`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Reject unknown and changed keys.
    Strict,
    /// Ask the [`HostKeyPrompt`] for unknown and changed keys.
    #[default]
    Ask,
    /// Add unknown keys, reject changed ones.
    AcceptNew,
    /// Accept every key.
    No,
}

/// What the prompt is asked to decide.
#[derive(Debug, Clone)]
pub struct HostKeyQuestion {
    /// Host in [`host_entry_name`] form
    pub host: String,
    /// Key format name
    pub key_type: String,
    /// `SHA256:` fingerprint
    pub fingerprint: String,
    /// `NotIncluded` or `Changed`
    pub status: HostKeyStatus,
    /// Repository the answer will be written to
    pub repository: String,
}

/// Decision hook for [`TrustPolicy::Ask`].
#[async_trait]
pub trait HostKeyPrompt: Send + Sync {
    /// Returns true to trust the key and record it.
    async fn confirm(&self, question: &HostKeyQuestion) -> bool;
}

/// Applies `policy` to the repository's verdict on `key`.
///
/// Accepted unknown keys are added; accepted changed keys replace the old
/// entries of the same type. Rejections surface as
/// [`SkiffError::HostKeyRejected`].
pub async fn verify_host_key(
    policy: TrustPolicy,
    repository: &dyn HostKeyRepository,
    prompt: Option<&dyn HostKeyPrompt>,
    host: &str,
    key_type: &str,
    key: &[u8],
) -> SkiffResult<()> {
    let status = repository.check(host, key_type, key);
    let fp = fingerprint(key);
    debug!(host, key_type, fingerprint = %fp, ?status, "Checked host key");

    if status == HostKeyStatus::Ok {
        return Ok(());
    }

    let reject = |why: &str| {
        Err(SkiffError::HostKeyRejected(format!(
            "{} for {} ({} {}) in {}",
            why,
            host,
            key_type,
            fp,
            repository.identifier()
        )))
    };

    let accept = match (policy, status) {
        (TrustPolicy::No, _) => {
            warn!(host, fingerprint = %fp, ?status, "Accepting host key without verification");
            return Ok(());
        }
        (TrustPolicy::Strict, HostKeyStatus::Changed) | (TrustPolicy::AcceptNew, HostKeyStatus::Changed) => {
            return reject("Host key changed");
        }
        (TrustPolicy::Strict, _) => return reject("Unknown host key"),
        (TrustPolicy::AcceptNew, _) => true,
        (TrustPolicy::Ask, _) => match prompt {
            Some(prompt) => {
                let question = HostKeyQuestion {
                    host: host.to_string(),
                    key_type: key_type.to_string(),
                    fingerprint: fp.clone(),
                    status,
                    repository: repository.identifier(),
                };
                prompt.confirm(&question).await
            }
            None => false,
        },
    };

    if !accept {
        return reject(match status {
            HostKeyStatus::Changed => "Host key changed",
            _ => "Unknown host key",
        });
    }

    if status == HostKeyStatus::Changed {
        repository.remove(host, Some(key_type))?;
    }
    repository.add(host, key_type, key)?;
    debug!(host, fingerprint = %fp, "Recorded host key");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x01A";
    const KEY_B: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x01B";

    fn line(pattern: &str, key: &[u8]) -> String {
        format!("{} ssh-ed25519 {} user@host\n", pattern, STANDARD.encode(key))
    }

    #[test]
    fn test_parse_line_fields() {
        let entry = KnownHost::parse_line(&line("example.com", KEY_A))
            .unwrap()
            .unwrap();
        assert_eq!(entry.hostname_pattern(), "example.com");
        assert_eq!(entry.key_type(), "ssh-ed25519");
        assert_eq!(entry.key_data(), KEY_A);
        assert_eq!(entry.comment(), "user@host");
    }

    #[test]
    fn test_parse_skips_comments_and_markers() {
        assert!(KnownHost::parse_line("   ").unwrap().is_none());
        assert!(KnownHost::parse_line("# comment").unwrap().is_none());
        assert!(KnownHost::parse_line("@revoked * ssh-rsa AAAA").unwrap().is_none());
        assert!(KnownHost::parse_line("host ssh-ed25519").is_err());
        assert!(KnownHost::parse_line("host ssh-ed25519 !!!").is_err());
    }

    #[test]
    fn test_from_string_skips_bad_lines() {
        let text = format!("# header\nbroken\n{}", line("a.example", KEY_A));
        let known = KnownHosts::from_string(&text).unwrap();
        assert_eq!(known.entries().len(), 1);
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_match(b"*.example.com", b"www.example.com"));
        assert!(wildcard_match(b"host?", b"host1"));
        assert!(!wildcard_match(b"host?", b"host12"));
        assert!(wildcard_match(b"*", b""));
        assert!(wildcard_match(b"a*b*c", b"aXXbYYc"));
        assert!(!wildcard_match(b"a*b*c", b"aXXbYY"));
    }

    #[test]
    fn test_negation_overrides_match() {
        let entry = KnownHost::new(
            "*.example.com,!bad.example.com".into(),
            "ssh-ed25519".into(),
            KEY_A.to_vec(),
        );
        assert!(entry.matches("good.example.com"));
        assert!(!entry.matches("bad.example.com"));
        assert!(!entry.matches("example.org"));
    }

    #[test]
    fn test_port_and_hashed_patterns() {
        assert_eq!(host_entry_name("h", 22), "h");
        assert_eq!(host_entry_name("h", 2222), "[h]:2222");

        let hashed = hash_hostname("[h]:2222", b"0123456789abcdefghij").unwrap();
        let known = KnownHosts::from_string(&line(&hashed, KEY_A)).unwrap();
        assert_eq!(known.check("[h]:2222", "ssh-ed25519", KEY_A), HostKeyStatus::Ok);
        assert_eq!(known.check("h", "ssh-ed25519", KEY_A), HostKeyStatus::NotIncluded);
    }

    #[test]
    fn test_check_statuses() {
        let known = KnownHosts::from_string(&line("host", KEY_A)).unwrap();
        assert_eq!(known.check("host", "ssh-ed25519", KEY_A), HostKeyStatus::Ok);
        assert_eq!(known.check("host", "ssh-ed25519", KEY_B), HostKeyStatus::Changed);
        assert_eq!(known.check("host", "ssh-rsa", KEY_B), HostKeyStatus::NotIncluded);
        assert_eq!(known.check("other", "ssh-ed25519", KEY_A), HostKeyStatus::NotIncluded);
    }

    #[test]
    fn test_add_remove_and_export() {
        let known = KnownHosts::new().with_identifier("test-store");
        known.add("[h]:2200", "ssh-ed25519", KEY_A).unwrap();
        assert_eq!(known.check("[h]:2200", "ssh-ed25519", KEY_A), HostKeyStatus::Ok);
        assert!(known.to_openssh_string().starts_with("[h]:2200 ssh-ed25519 "));
        assert_eq!(known.remove("[h]:2200", Some("ssh-rsa")).unwrap(), 0);
        assert_eq!(known.remove("[h]:2200", None).unwrap(), 1);
        assert_eq!(known.identifier(), "test-store");
    }

    #[test]
    fn test_hashed_add_still_matches() {
        let known = KnownHosts::new().with_hashed_entries(true);
        known.add("secret.host", "ssh-ed25519", KEY_A).unwrap();
        assert!(known.entries()[0].hostname_pattern().starts_with("|1|"));
        assert_eq!(known.check("secret.host", "ssh-ed25519", KEY_A), HostKeyStatus::Ok);
    }

    struct FixedPrompt(bool);

    #[async_trait]
    impl HostKeyPrompt for FixedPrompt {
        async fn confirm(&self, _question: &HostKeyQuestion) -> bool {
            self.0
        }
    }

    fn store_for(status: HostKeyStatus) -> KnownHosts {
        match status {
            HostKeyStatus::Ok => KnownHosts::from_string(&line("host", KEY_A)).unwrap(),
            HostKeyStatus::Changed => KnownHosts::from_string(&line("host", KEY_B)).unwrap(),
            HostKeyStatus::NotIncluded => KnownHosts::new(),
        }
    }

    async fn decide(policy: TrustPolicy, status: HostKeyStatus, prompt: Option<bool>) -> (bool, HostKeyStatus) {
        let store = store_for(status);
        let prompt = prompt.map(FixedPrompt);
        let result = verify_host_key(
            policy,
            &store,
            prompt.as_ref().map(|p| p as &dyn HostKeyPrompt),
            "host",
            "ssh-ed25519",
            KEY_A,
        )
        .await;
        if let Err(e) = &result {
            assert!(matches!(e, SkiffError::HostKeyRejected(_)));
        }
        (result.is_ok(), store.check("host", "ssh-ed25519", KEY_A))
    }

    #[tokio::test]
    async fn test_policy_matrix() {
        use HostKeyStatus::*;
        use TrustPolicy::*;

        // (policy, status, prompt answer) -> (accepted, status afterwards)
        let cases = [
            (Strict, Ok, None, (true, Ok)),
            (Strict, Changed, None, (false, Changed)),
            (Strict, NotIncluded, None, (false, NotIncluded)),
            (AcceptNew, Ok, None, (true, Ok)),
            (AcceptNew, Changed, None, (false, Changed)),
            (AcceptNew, NotIncluded, None, (true, Ok)),
            (No, Ok, None, (true, Ok)),
            (No, Changed, None, (true, Changed)),
            (No, NotIncluded, None, (true, NotIncluded)),
            (Ask, Ok, Some(false), (true, Ok)),
            (Ask, Changed, Some(true), (true, Ok)),
            (Ask, Changed, Some(false), (false, Changed)),
            (Ask, NotIncluded, Some(true), (true, Ok)),
            (Ask, NotIncluded, Some(false), (false, NotIncluded)),
            (Ask, NotIncluded, None, (false, NotIncluded)),
        ];
        for (policy, status, answer, expected) in cases {
            assert_eq!(
                decide(policy, status, answer).await,
                expected,
                "{:?} / {:?} / {:?}",
                policy,
                status,
                answer
            );
        }
    }

    #[tokio::test]
    async fn test_rejection_names_host_and_repository() {
        let store = KnownHosts::new().with_identifier("mem");
        let err = verify_host_key(TrustPolicy::Strict, &store, None, "h", "ssh-ed25519", KEY_A)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("h"));
        assert!(msg.contains("SHA256:"));
        assert!(msg.contains("mem"));
    }
}
