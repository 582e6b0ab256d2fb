// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Service configuration.
//!
//! Configuration is loaded once at startup, validated, and then frozen behind
//! an `Arc` for the lifetime of the process. Nothing in here is mutable at
//! runtime; the caches and worker pools carry all transient state.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode, SslVersion};
use serde::{Deserialize, Serialize};

/// The custodian family a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Pkcs11,
    Scdaemon,
    File,
    Gcloud,
    Azure,
    Aws,
}

/// Which PKCS#11 user variant to log in as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pkcs11User {
    #[default]
    User,
    SecurityOfficer,
    ContextSpecific,
}

/// How the token's workers are isolated from the server process.
///
/// `process` spawns one `custodia-worker` subprocess per worker so a
/// crashing provider library cannot take down the server. `task` runs the
/// worker loop as a supervised in-process task; it restarts on failure but
/// shares the server's address space, a strictly weaker guarantee that is
/// only appropriate where subprocesses are unavailable (and in tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Process,
    Task,
}

/// A token descriptor: one logical custodian of private keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Unique name, referenced by key descriptors.
    pub name: String,

    pub kind: TokenKind,

    /// Provider library path (pkcs11), socket path (scdaemon), key file
    /// path (file), or endpoint URL (cloud kinds).
    #[serde(default)]
    pub provider: Option<String>,

    /// Token label selector (pkcs11).
    #[serde(default)]
    pub label: Option<String>,

    /// Token serial number selector (pkcs11).
    #[serde(default)]
    pub serial: Option<String>,

    /// PIN or passphrase. The empty string means "authenticate without
    /// prompting" (the PKCS#11 protected authentication path). When absent,
    /// the `CUSTODIA_PIN_<NAME>` environment variable and then the pin file
    /// are consulted.
    #[serde(default)]
    pub pin: Option<String>,

    #[serde(default)]
    pub user: Pkcs11User,

    #[serde(default)]
    pub isolation: Isolation,

    /// Number of workers in this token's pool.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Per-operation deadline, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// How many times a request is retried on a fresh worker after the
    /// custodian session is lost.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Seconds between health-check pings.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Deadline for a single health-check ping, in seconds.
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,

    /// Consecutive ping failures before the pool reports unhealthy.
    #[serde(default = "default_check_failures")]
    pub check_failures: u32,

    /// How long cached key info (certificate, public key, algorithms) may
    /// be served, in seconds.
    #[serde(default = "default_cache_seconds")]
    pub cache_seconds: u64,
}

impl TokenConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_seconds)
    }

    /// Resolve the PIN for this token from the descriptor, the environment,
    /// or the pin file, in that order.
    pub fn resolve_pin(&self, pin_file: &HashMap<String, String>) -> Option<String> {
        if let Some(pin) = &self.pin {
            return Some(pin.clone());
        }
        let env_key = format!(
            "CUSTODIA_PIN_{}",
            self.name.to_uppercase().replace('-', "_")
        );
        if let Ok(pin) = std::env::var(&env_key) {
            return Some(pin);
        }
        pin_file.get(&self.name).cloned()
    }
}

/// A key descriptor. Either a primary key bound to a token, or an alias
/// that inherits everything from its target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    pub name: String,

    /// The token holding this key. Required unless this is an alias.
    #[serde(default)]
    pub token: Option<String>,

    /// Key label selector.
    #[serde(default)]
    pub label: Option<String>,

    /// Key ID selector (hex for PKCS#11 CKA_ID, `OPENPGP.n` for scdaemon,
    /// a full resource URI for cloud tokens).
    #[serde(default)]
    pub id: Option<String>,

    /// Key file within the token, for file-kind tokens holding several keys.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// PEM X.509 certificate chain, leaf first.
    #[serde(default)]
    pub x509_certificate: Option<PathBuf>,

    /// Armored OpenPGP certificate used for PGP signature packets.
    #[serde(default)]
    pub pgp_certificate: Option<PathBuf>,

    /// Whether signatures from this key get a timestamp by default.
    #[serde(default)]
    pub timestamp: bool,

    /// Roles permitted to use this key. Must be empty on aliases; aliases
    /// always use their target's roles.
    #[serde(default)]
    pub roles: HashSet<String>,

    /// Makes this key an alias of another. An alias inherits every
    /// parameter of its target; pointing an alias at another alias is a
    /// configuration error.
    #[serde(default)]
    pub alias_to: Option<String>,
}

/// A client principal, identified by certificate fingerprint or issuing CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// SHA-256 fingerprint of the client certificate, 64 uppercase hex
    /// characters.
    #[serde(default)]
    pub fingerprint: Option<String>,

    /// A CA certificate (PEM path). Any leaf validating against it
    /// authenticates as this principal.
    #[serde(default)]
    pub certificate: Option<PathBuf>,

    pub nickname: String,

    #[serde(default)]
    pub roles: HashSet<String>,
}

/// TLS credentials for the listening socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// PEM-encoded private key matching `certificate`.
    pub private_key: PathBuf,
    /// The server certificate presented to clients.
    pub certificate: PathBuf,
    /// The certificate authority client certificates must chain to.
    pub ca_certificate: PathBuf,
}

impl Credentials {
    pub(crate) fn ssl_acceptor(&self) -> anyhow::Result<SslAcceptor> {
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        let client_ca_cert = openssl::x509::X509::from_pem(
            std::fs::read_to_string(&self.ca_certificate)?.as_bytes(),
        )?;
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        acceptor.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        acceptor.add_client_ca(&client_ca_cert)?;
        acceptor.set_ca_file(&self.ca_certificate)?;
        acceptor.set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        acceptor.set_certificate_chain_file(&self.certificate)?;
        acceptor.check_private_key()?;

        Ok(acceptor.build())
    }

    /// Fix up any relative paths to be relative to the credentials directory.
    pub fn with_credentials_dir(&mut self, credentials_dir: &Path) -> anyhow::Result<()> {
        for path in [
            &mut self.private_key,
            &mut self.certificate,
            &mut self.ca_certificate,
        ] {
            if !path.is_absolute() {
                *path = credentials_dir.join(&*path);
                if !path.exists() {
                    return Err(anyhow::anyhow!(
                        "No credential file named '{}' found in credentials directory",
                        path.display()
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Azure AD settings for the interactive challenge issued to
/// unauthenticated clients when OPA authorization is in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureAd {
    pub authority: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The mTLS listening address. Socket activation, when present,
    /// overrides this.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Optional plaintext listener for health probes and proxied traffic.
    #[serde(default = "default_listen_http")]
    pub listen_http: Option<String>,

    pub credentials: Credentials,

    /// Equivalent sibling servers clients may be redirected to.
    #[serde(default)]
    pub siblings: Vec<String>,

    /// Source networks (CIDR) whose `X-Forwarded-*` and
    /// `Ssl-Client-Certificate` headers are honored.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Open Policy Agent decision endpoint. When set, the builtin
    /// fingerprint/CA table is bypassed.
    #[serde(default)]
    pub policy_url: Option<String>,

    #[serde(default)]
    pub azure_ad: Option<AzureAd>,

    /// Server-wide concurrent request limit; beyond it requests fail 503.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Path to the custodia-worker executable. Defaults to looking next to
    /// the server binary.
    #[serde(default)]
    pub worker_executable: Option<PathBuf>,

    /// Socket path of socket-activated workers. When set, workers are
    /// reached over this Unix socket (one connection per worker) instead
    /// of being spawned directly.
    #[serde(default)]
    pub worker_socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append-only JSONL audit log. Records are also emitted to the
    /// structured log; an external shipper may forward them to a fanout
    /// exchange.
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// The exchange name recorded in audit documents for downstream
    /// shippers.
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log: None,
            exchange: default_exchange(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// RFC 3161 timestamp authority URLs, tried in order.
    #[serde(default)]
    pub urls: Vec<String>,

    /// Legacy Microsoft Authenticode timestamp URLs, tried in order.
    #[serde(default)]
    pub ms_urls: Vec<String>,

    /// Overall deadline for one timestamp request, in seconds.
    #[serde(default = "default_timestamp_timeout")]
    pub timeout: u64,

    /// Timestamp requests per second, shared across both protocol kinds.
    /// Zero disables rate limiting.
    #[serde(default)]
    pub rate_limit: f64,

    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,

    /// Memoize timestamp tokens keyed by the request bytes.
    #[serde(default)]
    pub memoize: bool,

    /// Escalate a Microsoft timestamp content mismatch to an error instead
    /// of a warning.
    #[serde(default)]
    pub strict_ms_match: bool,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            urls: vec![],
            ms_urls: vec![],
            timeout: default_timestamp_timeout(),
            rate_limit: 0.0,
            rate_burst: default_rate_burst(),
            memoize: false,
            strict_ms_match: false,
        }
    }
}

impl TimestampConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// The complete frozen service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,

    #[serde(default)]
    pub timestamp: TimestampConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub tokens: Vec<TokenConfig>,

    #[serde(default)]
    pub keys: Vec<KeyConfig>,

    #[serde(default)]
    pub clients: Vec<ClientConfig>,

    /// YAML mapping of `{token-name: pin}`, consulted for tokens that do
    /// not carry an inline `pin`.
    #[serde(default)]
    pub pin_file: Option<PathBuf>,
}

impl Config {
    /// Validate the configuration and resolve aliases to their primaries.
    ///
    /// Aliases inherit every parameter of their target (including roles);
    /// an alias that carries its own roles, points at another alias, or
    /// points at a key that does not exist is rejected.
    pub fn finalize(mut self) -> anyhow::Result<Self> {
        let mut token_names = HashSet::new();
        for token in &self.tokens {
            if !token_names.insert(token.name.as_str()) {
                anyhow::bail!("duplicate token name '{}'", token.name);
            }
            if token.num_workers == 0 {
                anyhow::bail!("token '{}' must have at least one worker", token.name);
            }
        }

        let primaries: HashMap<String, KeyConfig> = self
            .keys
            .iter()
            .filter(|k| k.alias_to.is_none())
            .map(|k| (k.name.clone(), k.clone()))
            .collect();

        let alias_names: HashSet<String> = self
            .keys
            .iter()
            .filter(|k| k.alias_to.is_some())
            .map(|k| k.name.clone())
            .collect();

        let mut key_names = HashSet::new();
        for key in &mut self.keys {
            if !key_names.insert(key.name.clone()) {
                anyhow::bail!("duplicate key name '{}'", key.name);
            }
            match &key.alias_to {
                Some(target_name) => {
                    if !key.roles.is_empty() {
                        anyhow::bail!(
                            "alias '{}' must not define roles; it inherits them from '{}'",
                            key.name,
                            target_name
                        );
                    }
                    let target = primaries.get(target_name).ok_or_else(|| {
                        if alias_names.contains(target_name) {
                            anyhow::anyhow!(
                                "alias '{}' points at alias '{}'; aliases must target a primary key",
                                key.name,
                                target_name
                            )
                        } else {
                            anyhow::anyhow!(
                                "alias '{}' points at unknown key '{}'",
                                key.name,
                                target_name
                            )
                        }
                    })?;
                    let mut resolved = target.clone();
                    resolved.name = key.name.clone();
                    resolved.alias_to = Some(target_name.clone());
                    *key = resolved;
                }
                None => {
                    let token = key
                        .token
                        .as_deref()
                        .ok_or_else(|| anyhow::anyhow!("key '{}' names no token", key.name))?;
                    if !token_names.contains(token) {
                        anyhow::bail!("key '{}' references unknown token '{}'", key.name, token);
                    }
                }
            }
        }

        let mut fingerprints = HashSet::new();
        for client in &self.clients {
            match (&client.fingerprint, &client.certificate) {
                (None, None) => anyhow::bail!(
                    "client '{}' needs a fingerprint or a CA certificate",
                    client.nickname
                ),
                (Some(fp), _) => {
                    let upper_hex = |b: u8| b.is_ascii_digit() || (b'A'..=b'F').contains(&b);
                    if fp.len() != 64 || !fp.bytes().all(upper_hex) {
                        anyhow::bail!(
                            "client '{}' fingerprint must be 64 uppercase hex characters",
                            client.nickname
                        );
                    }
                    if !fingerprints.insert(fp.clone()) {
                        anyhow::bail!("duplicate client fingerprint {fp}");
                    }
                }
                _ => {}
            }
        }

        Ok(self)
    }

    fn keys_contains_alias(&self, name: &str) -> bool {
        self.keys
            .iter()
            .any(|k| k.name == name && k.alias_to.is_some())
    }

    pub fn token(&self, name: &str) -> Option<&TokenConfig> {
        self.tokens.iter().find(|t| t.name == name)
    }

    pub fn key(&self, name: &str) -> Option<&KeyConfig> {
        self.keys.iter().find(|k| k.name == name)
    }

    /// Load the pin file, if one is configured.
    pub fn load_pin_file(&self) -> anyhow::Result<HashMap<String, String>> {
        match &self.pin_file {
            None => Ok(HashMap::new()),
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read pin file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("pin file {} is not a YAML mapping", path.display()))
            }
        }
    }

    /// Source networks whose proxy headers are honored, parsed from CIDR.
    pub fn trusted_proxy_networks(&self) -> anyhow::Result<Vec<(IpAddr, u8)>> {
        self.server
            .trusted_proxies
            .iter()
            .map(|cidr| parse_cidr(cidr))
            .collect()
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn parse_cidr(cidr: &str) -> anyhow::Result<(IpAddr, u8)> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, prefix.parse::<u8>()?),
        None => (cidr, if cidr.contains(':') { 128 } else { 32 }),
    };
    let addr: IpAddr = addr.parse()?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        anyhow::bail!("invalid prefix length in '{cidr}'");
    }
    Ok((addr, prefix))
}

/// Whether `ip` falls within the `(network, prefix)` pair.
pub fn network_contains(network: &(IpAddr, u8), ip: &IpAddr) -> bool {
    fn prefix_match(a: &[u8], b: &[u8], prefix: u8) -> bool {
        let full = (prefix / 8) as usize;
        if a[..full] != b[..full] {
            return false;
        }
        let rem = prefix % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (a[full] & mask) == (b[full] & mask)
    }
    match (network.0, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            prefix_match(&net.octets(), &ip.octets(), network.1)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            prefix_match(&net.octets(), &ip.octets(), network.1)
        }
        _ => false,
    }
}

/// Load the configuration from `path`, or from
/// `$CONFIGURATION_DIRECTORY/custodia/server.toml` when no path is given.
#[cfg(feature = "cli")]
pub fn load_config(path: Option<PathBuf>, default: &Path) -> anyhow::Result<Config> {
    let path = path.or_else(|| {
        std::env::var("CONFIGURATION_DIRECTORY")
            .map(PathBuf::from)
            .ok()
            .map(|base| base.join(default))
            .filter(|path| path.is_file())
    });
    let path = path.ok_or_else(|| anyhow::anyhow!("no configuration file found"))?;
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path = %path.display(), "Read configuration file");
    let config: Config = toml::from_str(&raw).context("configuration file is invalid")?;
    config.finalize()
}

fn default_num_workers() -> usize {
    1
}

fn default_timeout() -> u64 {
    60
}

fn default_retries() -> u32 {
    5
}

fn default_check_interval() -> u64 {
    60
}

fn default_check_timeout() -> u64 {
    10
}

fn default_check_failures() -> u32 {
    3
}

fn default_cache_seconds() -> u64 {
    600
}

fn default_listen() -> String {
    ":6300".to_string()
}

fn default_listen_http() -> Option<String> {
    Some(":6301".to_string())
}

fn default_concurrency() -> usize {
    64
}

fn default_exchange() -> String {
    "custodia.signatures".to_string()
}

fn default_timestamp_timeout() -> u64 {
    60
}

fn default_rate_burst() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                listen: default_listen(),
                listen_http: default_listen_http(),
                credentials: Credentials {
                    private_key: "server.key.pem".into(),
                    certificate: "server.cert.pem".into(),
                    ca_certificate: "ca.pem".into(),
                },
                siblings: vec![],
                trusted_proxies: vec![],
                policy_url: None,
                azure_ad: None,
                concurrency: default_concurrency(),
                worker_executable: None,
                worker_socket_path: None,
            },
            timestamp: TimestampConfig::default(),
            audit: AuditConfig::default(),
            tokens: vec![TokenConfig {
                name: "hsm".to_string(),
                kind: TokenKind::Pkcs11,
                provider: Some("/usr/lib64/pkcs11/libsofthsm2.so".to_string()),
                label: Some("signing".to_string()),
                serial: None,
                pin: Some("1234".to_string()),
                user: Pkcs11User::default(),
                isolation: Isolation::default(),
                num_workers: 1,
                timeout: 60,
                retries: 5,
                check_interval: 60,
                check_timeout: 10,
                check_failures: 3,
                cache_seconds: 600,
            }],
            keys: vec![KeyConfig {
                name: "release".to_string(),
                token: Some("hsm".to_string()),
                roles: ["builders".to_string()].into_iter().collect(),
                ..Default::default()
            }],
            clients: vec![],
            pin_file: None,
        }
    }

    #[test]
    fn alias_inherits_target() {
        let mut config = base_config();
        config.keys.push(KeyConfig {
            name: "release-alias".to_string(),
            alias_to: Some("release".to_string()),
            ..Default::default()
        });
        let config = config.finalize().unwrap();
        let alias = config.key("release-alias").unwrap();
        assert_eq!(alias.token.as_deref(), Some("hsm"));
        assert!(alias.roles.contains("builders"));
        assert_eq!(alias.alias_to.as_deref(), Some("release"));
    }

    #[test]
    fn alias_with_roles_rejected() {
        let mut config = base_config();
        config.keys.push(KeyConfig {
            name: "bad".to_string(),
            alias_to: Some("release".to_string()),
            roles: ["extra".to_string()].into_iter().collect(),
            ..Default::default()
        });
        assert!(config.finalize().is_err());
    }

    #[test]
    fn alias_to_alias_rejected() {
        let mut config = base_config();
        config.keys.push(KeyConfig {
            name: "first".to_string(),
            alias_to: Some("release".to_string()),
            ..Default::default()
        });
        config.keys.push(KeyConfig {
            name: "second".to_string(),
            alias_to: Some("first".to_string()),
            ..Default::default()
        });
        let error = config.finalize().unwrap_err().to_string();
        assert!(error.contains("points at alias"), "{error}");
    }

    #[test]
    fn unknown_token_rejected() {
        let mut config = base_config();
        config.keys.push(KeyConfig {
            name: "orphan".to_string(),
            token: Some("nonexistent".to_string()),
            ..Default::default()
        });
        assert!(config.finalize().is_err());
    }

    #[test]
    fn fingerprint_format_enforced() {
        let mut config = base_config();
        config.clients.push(ClientConfig {
            fingerprint: Some("abcd".to_string()),
            certificate: None,
            nickname: "short".to_string(),
            roles: HashSet::new(),
        });
        assert!(config.finalize().is_err());

        let mut config = base_config();
        config.clients.push(ClientConfig {
            fingerprint: Some("A".repeat(64)),
            certificate: None,
            nickname: "ok".to_string(),
            roles: HashSet::new(),
        });
        assert!(config.finalize().is_ok());
    }

    #[test]
    fn duplicate_fingerprints_rejected() {
        let mut config = base_config();
        for nickname in ["one", "two"] {
            config.clients.push(ClientConfig {
                fingerprint: Some("B".repeat(64)),
                certificate: None,
                nickname: nickname.to_string(),
                roles: HashSet::new(),
            });
        }
        assert!(config.finalize().is_err());
    }

    #[test]
    fn cidr_matching() {
        let net = parse_cidr("10.1.0.0/16").unwrap();
        assert!(network_contains(&net, &"10.1.55.3".parse().unwrap()));
        assert!(!network_contains(&net, &"10.2.0.1".parse().unwrap()));
        let host = parse_cidr("192.168.1.9").unwrap();
        assert!(network_contains(&host, &"192.168.1.9".parse().unwrap()));
        assert!(!network_contains(&host, &"192.168.1.10".parse().unwrap()));
    }
}
