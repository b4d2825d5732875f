//! Transport configuration (§6) and the defaults a production deployment
//! of this node's network stack relies on when a field is left unset.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::peer::{AppProtocolVersion, PublicKey, SecretKey};

/// One ICE server this node may use to learn its public endpoint when no
/// `host` is configured (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), username: None, credential: None }
    }
}

/// The serializable subset of [`Config`]: everything that can sensibly
/// live in a config file. The private key and the `different_version_callback`
/// closure are runtime-only and are supplied separately via
/// [`ConfigFile::into_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub workers: usize,
    pub host: Option<String>,
    pub listen_port: u16,
    pub ice_servers: Vec<IceServer>,
    pub message_lifespan_secs: Option<u64>,
    pub outbound_socket_lifetime_secs: u64,
    pub outbound_socket_sweep_period_secs: u64,
}

impl ConfigFile {
    /// Merges this file-sourced configuration with the runtime-only
    /// private key and version token into a full [`Config`].
    pub fn into_config(self, private_key: SecretKey, app_protocol_version: AppProtocolVersion) -> Config {
        Config {
            private_key: std::sync::Arc::new(private_key),
            app_protocol_version,
            trusted_version_signers: None,
            workers: self.workers,
            host: self.host,
            listen_port: self.listen_port,
            ice_servers: self.ice_servers,
            different_version_callback: None,
            message_lifespan: self.message_lifespan_secs.map(Duration::from_secs),
            outbound_socket_lifetime: Duration::from_secs(self.outbound_socket_lifetime_secs),
            outbound_socket_sweep_period: Duration::from_secs(self.outbound_socket_sweep_period_secs),
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            workers: Config::DEFAULT_WORKERS,
            host: None,
            listen_port: 0,
            ice_servers: Vec::new(),
            message_lifespan_secs: None,
            outbound_socket_lifetime_secs: Config::DEFAULT_OUTBOUND_SOCKET_LIFETIME.as_secs(),
            outbound_socket_sweep_period_secs: Config::DEFAULT_SWEEP_PERIOD.as_secs(),
        }
    }
}

/// Callback invoked by the version validator (§4.1) when the remote's
/// version differs from the local one and its signer is not trusted.
pub type DifferentVersionCallback = std::sync::Arc<dyn Fn(&AppProtocolVersion) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Config {
    pub private_key: std::sync::Arc<SecretKey>,
    pub app_protocol_version: AppProtocolVersion,
    pub trusted_version_signers: Option<HashSet<PublicKey>>,
    pub workers: usize,
    pub host: Option<String>,
    pub listen_port: u16,
    pub ice_servers: Vec<IceServer>,
    pub different_version_callback: Option<DifferentVersionCallback>,
    pub message_lifespan: Option<Duration>,
    pub outbound_socket_lifetime: Duration,
    pub outbound_socket_sweep_period: Duration,
}

impl Config {
    pub const DEFAULT_WORKERS: usize = 5;
    pub const DEFAULT_OUTBOUND_SOCKET_LIFETIME: Duration = Duration::from_secs(600);
    pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(10);
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(3);
    pub const REPLY_SEND_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(private_key: SecretKey, app_protocol_version: AppProtocolVersion) -> Self {
        Self {
            private_key: std::sync::Arc::new(private_key),
            app_protocol_version,
            trusted_version_signers: None,
            workers: Self::DEFAULT_WORKERS,
            host: None,
            listen_port: 0,
            ice_servers: Vec::new(),
            different_version_callback: None,
            message_lifespan: None,
            outbound_socket_lifetime: Self::DEFAULT_OUTBOUND_SOCKET_LIFETIME,
            outbound_socket_sweep_period: Self::DEFAULT_SWEEP_PERIOD,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_outbound_socket_lifetime(mut self, lifetime: Duration) -> Self {
        self.outbound_socket_lifetime = lifetime;
        self
    }

    /// Validates the "it is an error for both `host` and `ice_servers` to
    /// be empty" rule (§6) up front, so misconfiguration fails at
    /// construction rather than mid-`start()`.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_none() && self.ice_servers.is_empty() {
            return Err(TransportError::Nat(crate::error::NatError::NoUsableEndpoint));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("public_key", &self.private_key.public_key())
            .field("app_protocol_version", &self.app_protocol_version)
            .field("workers", &self.workers)
            .field("host", &self.host)
            .field("listen_port", &self.listen_port)
            .field("ice_servers", &self.ice_servers.len())
            .field("message_lifespan", &self.message_lifespan)
            .field("outbound_socket_lifetime", &self.outbound_socket_lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_config_with_no_host_and_no_ice_servers() {
        let key = SecretKey::generate();
        let version = AppProtocolVersion::signed(1, vec![], &key);
        let config = Config::new(key, version);
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_config_with_host_only() {
        let key = SecretKey::generate();
        let version = AppProtocolVersion::signed(1, vec![], &key);
        let config = Config::new(key, version).with_host("example.invalid");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_file_merges_into_a_validatable_config() {
        let mut file = ConfigFile { host: Some("node.example.invalid".into()), ..ConfigFile::default() };
        file.listen_port = 4001;
        let key = SecretKey::generate();
        let version = AppProtocolVersion::signed(1, vec![], &key);
        let config = file.into_config(key, version);
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_port, 4001);
    }
}
