//! Typed runtime configuration handed to a [`crate::MediaNode`].
//!
//! The binary is responsible for reading files and environment variables;
//! this module only holds the resolved values and the parsers for the
//! string-encoded lists of the configuration contract.

use crate::{MediaResourceDescriptor, PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub application: ApplicationConfig,
    pub bind_addr: String,
    pub media_root: PathBuf,
    pub keep_deleted_files: bool,
    /// Hex encoded X25519 secret; a fresh key pair is generated when absent.
    pub private_key: Option<String>,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub pool: PoolConfig,
    pub encoding: EncodingConfig,
    pub shutdown: ShutdownConfig,
    pub resources: Vec<MediaResourceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationConfig {
    pub identifier: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub socket_timeout: Duration,
    pub max_frame_bytes: usize,
    pub max_workers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_millis(10_000),
            max_frame_bytes: 64 * 1024 * 1024,
            max_workers: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_active_sessions: usize,
    pub percentage_rate_for_cleaning: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 1000,
            percentage_rate_for_cleaning: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enabled: bool,
    /// Number of this server inside `peers`.
    pub local_number: u32,
    pub main_number: u32,
    pub peers: Vec<PeerSpec>,
    pub max_queue_items: usize,
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_number: 1,
            main_number: 1,
            peers: Vec::new(),
            max_queue_items: 1000,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if !self.peers.iter().any(|peer| peer.number == self.main_number) {
            return Err(PoolError::Config(format!(
                "PoolMainServerNumber {} is not part of MediaPoolList",
                self.main_number
            )));
        }

        if !self.peers.iter().any(|peer| peer.number == self.local_number) {
            return Err(PoolError::Config(format!(
                "PoolServerNumber {} is not part of MediaPoolList",
                self.local_number
            )));
        }

        if self.max_queue_items == 0 {
            return Err(PoolError::Config(
                "MaximumNuOfItemsInCommandQueue must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn is_main(&self) -> bool {
        self.local_number == self.main_number
    }
}

/// One entry of `MediaPoolList`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub number: u32,
    pub host: String,
    pub port: u16,
}

impl PeerSpec {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parses `num:host:port,num:host:port,...`.
    pub fn parse_list(value: &str) -> Result<Vec<PeerSpec>> {
        let mut peers: Vec<PeerSpec> = Vec::new();
        for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let mut fields = entry.splitn(3, ':');
            let (Some(number), Some(host), Some(port)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(PoolError::Config(format!(
                    "invalid MediaPoolList entry '{}': expected num:host:port",
                    entry
                )));
            };

            let number = number.trim().parse::<u32>().map_err(|error| {
                PoolError::Config(format!("invalid pool server number in '{}': {}", entry, error))
            })?;
            let host = host.trim();
            if host.is_empty() {
                return Err(PoolError::Config(format!(
                    "empty host in MediaPoolList entry '{}'",
                    entry
                )));
            }
            let port = port.trim().parse::<u16>().map_err(|error| {
                PoolError::Config(format!("invalid port in '{}': {}", entry, error))
            })?;

            if peers.iter().any(|peer| peer.number == number) {
                return Err(PoolError::Config(format!(
                    "duplicate pool server number {} in MediaPoolList",
                    number
                )));
            }

            peers.push(PeerSpec {
                number,
                host: host.to_string(),
                port,
            });
        }

        Ok(peers)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodingConfig {
    pub enabled: bool,
    /// Key used for newly promoted files.
    pub key_number: u32,
    pub keys: Vec<EncodingKey>,
}

impl EncodingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            if self.key_number == 0 {
                return Err(PoolError::Config(
                    "ServerEncodingKeyNumber must be greater than zero when encoding is enabled"
                        .to_string(),
                ));
            }
            if !self.keys.iter().any(|key| key.number == self.key_number) {
                return Err(PoolError::Config(format!(
                    "ServerEncodingKeyNumber {} is not part of ServerEncodingKeyList",
                    self.key_number
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct EncodingKey {
    pub number: u32,
    pub secret: String,
}

impl std::fmt::Debug for EncodingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodingKey")
            .field("number", &self.number)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl EncodingKey {
    /// Parses `num:key,num:key,...`. Key number 0 is reserved for
    /// unencoded files.
    pub fn parse_list(value: &str) -> Result<Vec<EncodingKey>> {
        let mut keys: Vec<EncodingKey> = Vec::new();
        for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let Some((number, secret)) = entry.split_once(':') else {
                return Err(PoolError::Config(
                    "invalid ServerEncodingKeyList entry: expected num:key".to_string(),
                ));
            };

            let number = number.trim().parse::<u32>().map_err(|error| {
                PoolError::Config(format!("invalid encoding key number: {}", error))
            })?;
            if number == 0 {
                return Err(PoolError::Config(
                    "encoding key number 0 is reserved for unencoded files".to_string(),
                ));
            }
            if secret.is_empty() {
                return Err(PoolError::Config(format!(
                    "encoding key {} has an empty secret",
                    number
                )));
            }
            if keys.iter().any(|key| key.number == number) {
                return Err(PoolError::Config(format!(
                    "duplicate encoding key number {}",
                    number
                )));
            }

            keys.push(EncodingKey {
                number,
                secret: secret.to_string(),
            });
        }

        Ok(keys)
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub grace_period: Duration,
    pub drain_queues: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            drain_queues: false,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.application.identifier.trim().is_empty() {
            return Err(PoolError::Config(
                "application identifier cannot be empty".to_string(),
            ));
        }
        if self.application.identifier.contains('-') {
            return Err(PoolError::Config(
                "application identifier cannot contain '-'".to_string(),
            ));
        }
        if self.application.version.trim().is_empty() {
            return Err(PoolError::Config(
                "application version cannot be empty".to_string(),
            ));
        }
        if self.transport.max_workers == 0 {
            return Err(PoolError::Config(
                "MaximumNuOfWorkers must be greater than zero".to_string(),
            ));
        }
        if self.session.percentage_rate_for_cleaning > 100 {
            return Err(PoolError::Config(
                "PercentageRateForCleaning must be between 0 and 100".to_string(),
            ));
        }

        self.pool.validate()?;
        self.encoding.validate()?;
        Ok(())
    }
}
