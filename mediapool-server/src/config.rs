use mediapool_core::{
    ApplicationConfig, EncodingConfig, EncodingKey, MediaResourceDescriptor, NodeConfig, PeerSpec,
    PoolConfig, PoolError, Result, SessionConfig, ShutdownConfig, TransportConfig,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// File and environment configuration of the `mediapool` binary.
///
/// Key names are part of the external contract. The lowercase aliases match
/// keys coming from `MEDIAPOOL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "ApplicationIdentifier", alias = "applicationidentifier")]
    pub application_identifier: String,
    #[serde(rename = "ApplicationVersion", alias = "applicationversion")]
    pub application_version: String,
    #[serde(
        rename = "BindAddress",
        alias = "bindaddress",
        default = "default_bind_address"
    )]
    pub bind_address: String,
    #[serde(rename = "MediaRootDirectory", alias = "mediarootdirectory")]
    pub media_root_directory: PathBuf,
    #[serde(
        rename = "KeepDeletedMediaFiles",
        alias = "keepdeletedmediafiles",
        default
    )]
    pub keep_deleted_media_files: bool,
    #[serde(rename = "ServerPrivateKey", alias = "serverprivatekey", default)]
    pub server_private_key: Option<String>,

    #[serde(
        rename = "SocketTimeoutInMilliseconds",
        alias = "sockettimeoutinmilliseconds",
        default = "default_socket_timeout"
    )]
    pub socket_timeout_in_milliseconds: u64,
    #[serde(
        rename = "MaximumFrameSizeInBytes",
        alias = "maximumframesizeinbytes",
        default = "default_max_frame_bytes"
    )]
    pub maximum_frame_size_in_bytes: usize,
    #[serde(
        rename = "MaximumNuOfWorkers",
        alias = "maximumnuofworkers",
        default = "default_max_workers"
    )]
    pub maximum_nu_of_workers: usize,

    #[serde(
        rename = "MaxNuOfActiveSessions",
        alias = "maxnuofactivesessions",
        default = "default_max_sessions"
    )]
    pub max_nu_of_active_sessions: usize,
    #[serde(
        rename = "PercentageRateForCleaning",
        alias = "percentagerateforcleaning",
        default = "default_cleaning_rate"
    )]
    pub percentage_rate_for_cleaning: u32,

    #[serde(rename = "EnableMediaPool", alias = "enablemediapool", default)]
    pub enable_media_pool: bool,
    #[serde(rename = "MediaPoolList", alias = "mediapoollist", default)]
    pub media_pool_list: String,
    #[serde(
        rename = "PoolServerNumber",
        alias = "poolservernumber",
        default = "default_server_number"
    )]
    pub pool_server_number: u32,
    #[serde(
        rename = "PoolMainServerNumber",
        alias = "poolmainservernumber",
        default = "default_server_number"
    )]
    pub pool_main_server_number: u32,
    #[serde(
        rename = "MaximumNuOfItemsInCommandQueue",
        alias = "maximumnuofitemsincommandqueue",
        default = "default_queue_items"
    )]
    pub maximum_nu_of_items_in_command_queue: usize,
    #[serde(
        rename = "SecondsToWaitBetweenCommandProcessing",
        alias = "secondstowaitbetweencommandprocessing",
        default = "default_poll_seconds"
    )]
    pub seconds_to_wait_between_command_processing: u64,

    #[serde(rename = "ServerEncodingEnabled", alias = "serverencodingenabled", default)]
    pub server_encoding_enabled: bool,
    #[serde(rename = "ServerEncodingKeyNumber", alias = "serverencodingkeynumber", default)]
    pub server_encoding_key_number: u32,
    #[serde(rename = "ServerEncodingKeyList", alias = "serverencodingkeylist", default)]
    pub server_encoding_key_list: String,

    #[serde(
        rename = "ShutdownGracePeriodInSeconds",
        alias = "shutdowngraceperiodinseconds",
        default = "default_grace_seconds"
    )]
    pub shutdown_grace_period_in_seconds: u64,
    #[serde(rename = "DrainQueuesOnShutdown", alias = "drainqueuesonshutdown", default)]
    pub drain_queues_on_shutdown: bool,

    #[serde(rename = "MediaResources", alias = "mediaresources", default)]
    pub media_resources: Vec<MediaResourceDescriptor>,
}

fn default_bind_address() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_socket_timeout() -> u64 {
    10_000
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_workers() -> usize {
    64
}

fn default_max_sessions() -> usize {
    1000
}

fn default_cleaning_rate() -> u32 {
    20
}

fn default_server_number() -> u32 {
    1
}

fn default_queue_items() -> usize {
    1000
}

fn default_poll_seconds() -> u64 {
    5
}

fn default_grace_seconds() -> u64 {
    10
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("MEDIAPOOL"))
            .build()
            .map_err(|e| PoolError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| PoolError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn into_node_config(self) -> Result<NodeConfig> {
        let peers = if self.enable_media_pool {
            PeerSpec::parse_list(&self.media_pool_list)?
        } else {
            Vec::new()
        };
        let keys = EncodingKey::parse_list(&self.server_encoding_key_list)?;

        let node = NodeConfig {
            application: ApplicationConfig {
                identifier: self.application_identifier,
                version: self.application_version,
            },
            bind_addr: self.bind_address,
            media_root: self.media_root_directory,
            keep_deleted_files: self.keep_deleted_media_files,
            private_key: self.server_private_key.filter(|key| !key.trim().is_empty()),
            transport: TransportConfig {
                socket_timeout: Duration::from_millis(self.socket_timeout_in_milliseconds),
                max_frame_bytes: self.maximum_frame_size_in_bytes,
                max_workers: self.maximum_nu_of_workers,
            },
            session: SessionConfig {
                max_active_sessions: self.max_nu_of_active_sessions,
                percentage_rate_for_cleaning: self.percentage_rate_for_cleaning,
            },
            pool: PoolConfig {
                enabled: self.enable_media_pool,
                local_number: self.pool_server_number,
                main_number: self.pool_main_server_number,
                peers,
                max_queue_items: self.maximum_nu_of_items_in_command_queue,
                poll_interval: Duration::from_secs(self.seconds_to_wait_between_command_processing),
            },
            encoding: EncodingConfig {
                enabled: self.server_encoding_enabled,
                key_number: self.server_encoding_key_number,
                keys,
            },
            shutdown: ShutdownConfig {
                grace_period: Duration::from_secs(self.shutdown_grace_period_in_seconds),
                drain_queues: self.drain_queues_on_shutdown,
            },
            resources: self.media_resources,
        };

        node.validate()?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const POOL_CONFIG: &str = r#"
ApplicationIdentifier: estate
ApplicationVersion: "2.1"
BindAddress: "127.0.0.1:7401"
MediaRootDirectory: /var/lib/mediapool
EnableMediaPool: true
MediaPoolList: "1:alpha:7401,2:beta:7402"
PoolServerNumber: 2
PoolMainServerNumber: 1
SecondsToWaitBetweenCommandProcessing: 3
ServerEncodingEnabled: true
ServerEncodingKeyNumber: 1
ServerEncodingKeyList: "1:first-secret,2:second-secret"
MediaResources:
  - group: Apartment
    name: Room
    alias: room
    file_types: [jpg, png]
"#;

    #[test]
    fn test_load_pool_config() {
        let file = write_config(POOL_CONFIG);
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(config.enable_media_pool);
        assert_eq!(config.pool_server_number, 2);
        assert_eq!(config.socket_timeout_in_milliseconds, 10_000);

        let node = config.into_node_config().unwrap();
        assert_eq!(node.application.identifier, "estate");
        assert_eq!(node.pool.peers.len(), 2);
        assert!(!node.pool.is_main());
        assert_eq!(node.pool.poll_interval, Duration::from_secs(3));
        assert_eq!(node.encoding.keys.len(), 2);
        assert_eq!(node.resources[0].identifier(), "Apartment/Room");
        assert!(node.private_key.is_none());
    }

    #[test]
    fn test_pool_list_ignored_when_disabled() {
        let file = write_config(
            r#"
ApplicationIdentifier: estate
ApplicationVersion: "1"
MediaRootDirectory: /tmp/media
MediaPoolList: "not a list"
"#,
        );
        let node = Config::from_file(file.path().to_str().unwrap())
            .unwrap()
            .into_node_config()
            .unwrap();
        assert!(!node.pool.enabled);
        assert!(node.pool.peers.is_empty());
        assert_eq!(node.transport.max_workers, 64);
    }

    #[test]
    fn test_main_server_must_be_listed() {
        let file = write_config(
            r#"
ApplicationIdentifier: estate
ApplicationVersion: "1"
MediaRootDirectory: /tmp/media
EnableMediaPool: true
MediaPoolList: "1:alpha:7401"
PoolMainServerNumber: 3
"#,
        );
        let err = Config::from_file(file.path().to_str().unwrap())
            .unwrap()
            .into_node_config()
            .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file("/nonexistent/mediapool").unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }
}
