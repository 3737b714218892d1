use super::connection::ConnectionManager;
use super::queue::{CommandQueues, QueueKind, ServerMediaPoolCommand};
use crate::notify::{Notification, Notifier};
use crate::protocol::{CommandId, RequestContainer, props};
use crate::storage::{MediaFileRecord, MediaStore, naming, verify_hash};
use crate::{
    ErrorCode, MediaResourceDescriptor, PoolConfig, PoolError, ResourceCatalog, Result,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

const POOL_CODENAME: &str = "pool";
const DRAIN_PAUSE: Duration = Duration::from_millis(50);

/// Content fetched from a pool peer, already verified against its hash.
#[derive(Debug, Clone)]
pub struct RemoteMediaFile {
    pub file_type: String,
    pub hash_value: String,
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaInfo {
    pub server_number: u32,
    pub file_type: String,
    pub hash_value: String,
    pub encoding_key: u32,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandOutcome {
    Done,
    Retry,
    Failed,
}

/// Counters of one processing cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub processed: usize,
    pub requeued: usize,
    /// Commands that failed for good or found their queue full on requeue.
    pub dropped: usize,
}

/// Multi-host replication of the local media store.
pub struct MediaPool {
    config: PoolConfig,
    store: Arc<MediaStore>,
    catalog: Arc<dyn ResourceCatalog>,
    connections: ConnectionManager,
    queues: CommandQueues,
    notifier: Arc<dyn Notifier>,
}

impl MediaPool {
    pub fn new(
        config: PoolConfig,
        store: Arc<MediaStore>,
        catalog: Arc<dyn ResourceCatalog>,
        connections: ConnectionManager,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let queues = CommandQueues::new(config.max_queue_items);
        Self {
            config,
            store,
            catalog,
            connections,
            queues,
            notifier,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_main(&self) -> bool {
        self.config.is_main()
    }

    pub fn local_number(&self) -> u32 {
        self.config.local_number
    }

    pub fn queues(&self) -> &CommandQueues {
        &self.queues
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Main server first, then the secondaries in ascending number.
    fn peer_order(&self) -> Vec<u32> {
        let main = self.config.main_number;
        std::iter::once(main)
            .chain(self.connections.numbers().filter(|number| *number != main))
            .collect()
    }

    /// Followers other than this server.
    fn followers(&self) -> Vec<u32> {
        self.connections
            .numbers()
            .filter(|number| *number != self.config.main_number && *number != self.config.local_number)
            .collect()
    }

    fn descriptor(&self, identifier: &str) -> Result<Arc<MediaResourceDescriptor>> {
        self.catalog
            .descriptor(identifier)
            .ok_or_else(|| PoolError::ResourceNotFound(identifier.to_string()))
    }

    /// Asks the pool whether any member holds the content, main server
    /// first. Unreachable members count as not having it.
    ///
    /// On a follower, a main server that answers without the content while
    /// another member holds it gets a main queue command sourced from that
    /// member.
    pub async fn check(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        file_type: &str,
        hash_value: &str,
    ) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        validate_check_input(descriptor, data_identifier, file_type, hash_value)?;

        let mut main_lacks_it = false;
        for number in self.peer_order() {
            match self
                .peer_check(number, descriptor, data_identifier, file_type, hash_value)
                .await
            {
                Ok(true) => {
                    tracing::debug!(
                        "Pool server {} has {}:{}",
                        number,
                        descriptor.identifier(),
                        data_identifier
                    );
                    if main_lacks_it {
                        self.schedule_main_repair(descriptor, data_identifier, number)
                            .await;
                    }
                    return Ok(true);
                }
                Ok(false) => {
                    if number == self.config.main_number && !self.is_main() {
                        main_lacks_it = true;
                    }
                }
                Err(error) => tracing::warn!(
                    "Pool check of {}:{} on server {} failed, treating as absent: {}",
                    descriptor.identifier(),
                    data_identifier,
                    number,
                    error
                ),
            }
        }

        Ok(false)
    }

    /// Looks for the content on the followers only. Returns the first
    /// follower that holds it.
    pub async fn find_on_followers(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        file_type: &str,
        hash_value: &str,
    ) -> Result<Option<u32>> {
        if !self.config.enabled {
            return Ok(None);
        }
        validate_check_input(descriptor, data_identifier, file_type, hash_value)?;

        for number in self.followers() {
            match self
                .peer_check(number, descriptor, data_identifier, file_type, hash_value)
                .await
            {
                Ok(true) => return Ok(Some(number)),
                Ok(false) => {}
                Err(error) => tracing::warn!(
                    "Pool check of {}:{} on server {} failed, treating as absent: {}",
                    descriptor.identifier(),
                    data_identifier,
                    number,
                    error
                ),
            }
        }

        Ok(None)
    }

    /// Fetches the content from the first pool member that has it and stores
    /// it locally.
    pub async fn fetch_from_pool(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
    ) -> Result<Option<MediaFileRecord>> {
        if !self.config.enabled {
            return Ok(None);
        }

        for number in self.peer_order() {
            if number == self.config.local_number {
                continue;
            }

            let remote = match self.peer_read(number, descriptor, data_identifier).await {
                Ok(Some(remote)) => remote,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(
                        "Pool read of {}:{} from server {} failed: {}",
                        descriptor.identifier(),
                        data_identifier,
                        number,
                        error
                    );
                    continue;
                }
            };

            let record = self
                .store
                .store(
                    POOL_CODENAME,
                    &number.to_string(),
                    descriptor,
                    data_identifier,
                    &remote.file_type,
                    &remote.content,
                )
                .await?;
            tracing::info!(
                "Fetched {}:{} from pool server {}",
                descriptor.identifier(),
                data_identifier,
                number
            );
            return Ok(Some(record));
        }

        Ok(None)
    }

    /// Metadata of the content on the first pool member that knows it.
    pub async fn info_from_pool(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
    ) -> Result<Option<RemoteMediaInfo>> {
        if !self.config.enabled {
            return Ok(None);
        }

        for number in self.peer_order() {
            if number == self.config.local_number {
                continue;
            }
            match self.peer_info(number, descriptor, data_identifier).await {
                Ok(Some(info)) => return Ok(Some(info)),
                Ok(None) => {}
                Err(error) => tracing::warn!(
                    "Pool info of {}:{} from server {} failed: {}",
                    descriptor.identifier(),
                    data_identifier,
                    number,
                    error
                ),
            }
        }

        Ok(None)
    }

    /// Queues replication of a locally stored upload.
    pub async fn replicate_upload(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        pending_file_name: Option<&str>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut command = ServerMediaPoolCommand::new(descriptor.identifier(), data_identifier);
        if let Some(name) = pending_file_name {
            command = command.with_pending_file(name);
        }

        let mut first_error = None;
        if !self.is_main() {
            if let Err(error) = self.enqueue(QueueKind::Main, command.clone()).await {
                first_error.get_or_insert(error);
            }
        }
        if !self.followers().is_empty() {
            if let Err(error) = self.enqueue(QueueKind::Secondary, command).await {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Queues a catch-up of this server from `source_number`.
    pub async fn schedule_synchronization(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        source_number: u32,
    ) -> Result<bool> {
        let command = ServerMediaPoolCommand::new(descriptor.identifier(), data_identifier)
            .with_source(source_number);
        self.enqueue(QueueKind::Synchronizing, command).await
    }

    /// Queues an upload to the main server of the copy held by `holder`.
    async fn schedule_main_repair(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        holder: u32,
    ) {
        let mut command = ServerMediaPoolCommand::new(descriptor.identifier(), data_identifier);
        if holder != self.config.local_number {
            command = command.with_source(holder);
        }

        tracing::info!(
            "Main server {} is behind on {}:{}, pool server {} has it",
            self.config.main_number,
            descriptor.identifier(),
            data_identifier,
            holder
        );
        // Overflow has already been reported by enqueue.
        let _ = self.enqueue(QueueKind::Main, command).await;
    }

    /// Adds a command to a queue. Overflow is reported to the notifier and
    /// returned.
    pub async fn enqueue(&self, kind: QueueKind, command: ServerMediaPoolCommand) -> Result<bool> {
        let key = command.command_hash_key();
        match self.queues.queue(kind).enqueue(command).await {
            Ok(true) => {
                tracing::debug!("Queued {} on the {} queue", key, kind);
                Ok(true)
            }
            Ok(false) => {
                tracing::debug!("{} is already on the {} queue", key, kind);
                Ok(false)
            }
            Err(error) => {
                tracing::error!("Rejected {} on the {} queue: {}", key, kind, error);
                self.notifier
                    .notify(
                        Notification::new(key, "Replication command rejected")
                            .with_additional_text(format!("{} queue", kind))
                            .with_error(&error),
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Runs one processing cycle: the whole main queue, then at most one
    /// secondary command, or one synchronizing command when both other
    /// queues were empty.
    pub async fn process_cycle(&self) -> CycleReport {
        let batch = self.queues.next_cycle_batch().await;
        let mut report = CycleReport::default();
        if batch.is_empty() {
            return report;
        }

        let mut retry = Vec::new();
        let work = batch
            .main
            .into_iter()
            .map(|command| (QueueKind::Main, command))
            .chain(batch.secondary.map(|command| (QueueKind::Secondary, command)))
            .chain(batch.synchronizing.map(|command| (QueueKind::Synchronizing, command)));

        for (kind, command) in work {
            report.processed += 1;
            match self.process_command(kind, &command).await {
                CommandOutcome::Done => {}
                CommandOutcome::Retry => retry.push((kind, command)),
                CommandOutcome::Failed => report.dropped += 1,
            }
        }

        for (kind, command) in retry {
            match self.enqueue(kind, command).await {
                Ok(_) => report.requeued += 1,
                Err(_) => report.dropped += 1,
            }
        }

        tracing::debug!(
            "Replication cycle processed {} commands, {} requeued, {} dropped",
            report.processed,
            report.requeued,
            report.dropped
        );
        report
    }

    async fn process_command(&self, kind: QueueKind, command: &ServerMediaPoolCommand) -> CommandOutcome {
        let result = match kind {
            QueueKind::Main => match command.source_number {
                Some(source) if source != self.config.local_number => {
                    self.relay(source, self.config.main_number, command).await
                }
                _ => self.push_to(&[self.config.main_number], command).await,
            },
            QueueKind::Secondary => self.push_to(&self.followers(), command).await,
            QueueKind::Synchronizing => self.synchronize(command).await,
        };

        match result {
            Ok(()) => CommandOutcome::Done,
            Err(error) if error.is_retryable() => {
                tracing::warn!(
                    "Replication of {} ({} queue) deferred: {}",
                    command.command_hash_key(),
                    kind,
                    error
                );
                CommandOutcome::Retry
            }
            Err(error) => {
                tracing::error!(
                    "Replication of {} ({} queue) failed: {}",
                    command.command_hash_key(),
                    kind,
                    error
                );
                self.notifier
                    .notify(
                        Notification::new(command.command_hash_key(), "Replication command failed")
                            .with_additional_text(format!("{} queue", kind))
                            .with_error(&error),
                    )
                    .await;
                CommandOutcome::Failed
            }
        }
    }

    /// Uploads the current local file to every target that lacks it.
    async fn push_to(&self, targets: &[u32], command: &ServerMediaPoolCommand) -> Result<()> {
        let descriptor = self.descriptor(&command.media_resource_identifier)?;
        let Some(record) = self.store.lookup(&descriptor, &command.data_identifier).await? else {
            tracing::warn!(
                "Nothing to replicate for {}, no local file",
                command.command_hash_key()
            );
            return Ok(());
        };

        let mut content = None;
        let mut deferred = None;
        for &number in targets {
            if number == self.config.local_number {
                continue;
            }
            match self.replicate_to(number, &descriptor, &record, &mut content).await {
                Ok(()) => {}
                Err(error) if error.is_retryable() => {
                    tracing::warn!("Pool server {} unavailable: {}", number, error);
                    deferred.get_or_insert(error);
                }
                Err(error) => return Err(error),
            }
        }

        match deferred {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn replicate_to(
        &self,
        number: u32,
        descriptor: &MediaResourceDescriptor,
        record: &MediaFileRecord,
        content: &mut Option<Bytes>,
    ) -> Result<()> {
        if self
            .peer_check(
                number,
                descriptor,
                &record.data_identifier,
                &record.file_type,
                &record.hash_value,
            )
            .await?
        {
            tracing::debug!(
                "Pool server {} already has {}",
                number,
                record.file_name
            );
            return Ok(());
        }

        let bytes = match content {
            Some(bytes) => bytes.clone(),
            None => {
                let bytes = self.store.read(record).await?;
                *content = Some(bytes.clone());
                bytes
            }
        };

        self.peer_upload(
            number,
            descriptor,
            &record.data_identifier,
            &record.file_type,
            &record.hash_value,
            &bytes,
        )
        .await?;
        tracing::info!(
            "Replicated {} to pool server {}",
            record.file_name,
            number
        );
        Ok(())
    }

    /// Copies the content held by `source` to `target` without keeping it
    /// locally.
    async fn relay(&self, source: u32, target: u32, command: &ServerMediaPoolCommand) -> Result<()> {
        let descriptor = self.descriptor(&command.media_resource_identifier)?;
        let Some(remote) = self
            .peer_read(source, &descriptor, &command.data_identifier)
            .await?
        else {
            tracing::warn!(
                "Pool server {} no longer holds {}, nothing to relay",
                source,
                command.command_hash_key()
            );
            return Ok(());
        };

        if self
            .peer_check(
                target,
                &descriptor,
                &command.data_identifier,
                &remote.file_type,
                &remote.hash_value,
            )
            .await?
        {
            return Ok(());
        }

        self.peer_upload(
            target,
            &descriptor,
            &command.data_identifier,
            &remote.file_type,
            &remote.hash_value,
            &remote.content,
        )
        .await?;
        tracing::info!(
            "Relayed {} from pool server {} to pool server {}",
            command.command_hash_key(),
            source,
            target
        );
        Ok(())
    }

    /// Pulls the content from the source follower and promotes it locally.
    async fn synchronize(&self, command: &ServerMediaPoolCommand) -> Result<()> {
        let descriptor = self.descriptor(&command.media_resource_identifier)?;
        let sources = match command.source_number {
            Some(number) => vec![number],
            None => self.followers(),
        };

        for source in sources {
            let Some(remote) = self
                .peer_read(source, &descriptor, &command.data_identifier)
                .await?
            else {
                continue;
            };

            let local = self.store.lookup(&descriptor, &command.data_identifier).await?;
            if local
                .as_ref()
                .is_some_and(|record| record.matches(&remote.file_type, &remote.hash_value))
            {
                return Ok(());
            }

            self.store
                .store(
                    POOL_CODENAME,
                    &source.to_string(),
                    &descriptor,
                    &command.data_identifier,
                    &remote.file_type,
                    &remote.content,
                )
                .await?;
            tracing::info!(
                "Synchronized {} from pool server {}",
                command.command_hash_key(),
                source
            );
            return Ok(());
        }

        tracing::warn!(
            "No pool server holds {} anymore, dropping synchronization",
            command.command_hash_key()
        );
        Ok(())
    }

    /// Processes the replication queues every poll interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "Replication loop started (server {}, main {}, every {:?})",
            self.config.local_number,
            self.config.main_number,
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Replication loop stopped");
    }

    /// Processes cycles until all queues are empty or `limit` elapses.
    /// Returns true when the queues were drained.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.queues.is_empty().await {
                return true;
            }
            if Instant::now() >= deadline {
                let left = self.queues.total_len().await;
                tracing::warn!("Stopped draining with {} replication commands left", left);
                return false;
            }

            let report = self.process_cycle().await;
            if report.requeued > 0 {
                tokio::time::sleep(DRAIN_PAUSE).await;
            }
        }
    }

    fn pool_request(&self, command: CommandId) -> RequestContainer {
        RequestContainer::new(self.connections.application(), command)
            .with_property(props::POOL_REQUEST, "true")
    }

    async fn peer_check(
        &self,
        number: u32,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        file_type: &str,
        hash_value: &str,
    ) -> Result<bool> {
        if number == self.config.local_number {
            return self
                .store
                .exists(descriptor, data_identifier, file_type, hash_value)
                .await;
        }

        let request = self
            .pool_request(CommandId::MediaFileCheck)
            .with_property(props::MEDIA_RESOURCE_IDENTIFIER, descriptor.identifier())
            .with_property(props::DATA_IDENTIFIER, data_identifier)
            .with_property(props::FILE_TYPE, file_type)
            .with_property(props::HASH_VALUE, hash_value);
        let response = self.connections.send(number, request).await?;
        Ok(response.flag(props::EXISTS))
    }

    async fn peer_read(
        &self,
        number: u32,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
    ) -> Result<Option<RemoteMediaFile>> {
        let request = self
            .pool_request(CommandId::MediaFileRead)
            .with_property(props::MEDIA_RESOURCE_IDENTIFIER, descriptor.identifier())
            .with_property(props::DATA_IDENTIFIER, data_identifier);

        let response = match self.connections.send(number, request).await {
            Ok(response) => response,
            Err(PoolError::Remote {
                code: ErrorCode::MediaFileNotFound,
                ..
            }) => return Ok(None),
            Err(error) => return Err(error),
        };

        let file_type = response.required_property(props::FILE_TYPE)?.to_string();
        let hash_value = response.required_property(props::HASH_VALUE)?.to_string();
        let content = BASE64
            .decode(response.required_property(props::CONTENT)?)
            .map_err(|error| PoolError::Protocol(format!("invalid content encoding: {}", error)))?;
        verify_hash(&content, &hash_value)?;

        Ok(Some(RemoteMediaFile {
            file_type,
            hash_value,
            content: Bytes::from(content),
        }))
    }

    async fn peer_info(
        &self,
        number: u32,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
    ) -> Result<Option<RemoteMediaInfo>> {
        let request = self
            .pool_request(CommandId::MediaFileInfo)
            .with_property(props::MEDIA_RESOURCE_IDENTIFIER, descriptor.identifier())
            .with_property(props::DATA_IDENTIFIER, data_identifier);
        let response = self.connections.send(number, request).await?;
        if !response.flag(props::EXISTS) {
            return Ok(None);
        }

        let parse_error =
            |name: &str| PoolError::Protocol(format!("invalid {} from pool server {}", name, number));
        let last_modified = DateTime::parse_from_rfc3339(response.required_property(props::LAST_MODIFIED)?)
            .map_err(|_| parse_error(props::LAST_MODIFIED))?
            .with_timezone(&Utc);

        Ok(Some(RemoteMediaInfo {
            server_number: number,
            file_type: response.required_property(props::FILE_TYPE)?.to_string(),
            hash_value: response.required_property(props::HASH_VALUE)?.to_string(),
            encoding_key: response
                .required_property(props::ENCODING_KEY_NUMBER)?
                .parse()
                .map_err(|_| parse_error(props::ENCODING_KEY_NUMBER))?,
            file_size: response
                .required_property(props::FILE_SIZE)?
                .parse()
                .map_err(|_| parse_error(props::FILE_SIZE))?,
            last_modified,
        }))
    }

    async fn peer_upload(
        &self,
        number: u32,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        file_type: &str,
        hash_value: &str,
        content: &[u8],
    ) -> Result<()> {
        let request = self
            .pool_request(CommandId::MediaFileUpload)
            .with_property(props::MEDIA_RESOURCE_IDENTIFIER, descriptor.identifier())
            .with_property(props::DATA_IDENTIFIER, data_identifier)
            .with_property(props::FILE_TYPE, file_type)
            .with_property(props::HASH_VALUE, hash_value)
            .with_property(props::CONTENT, BASE64.encode(content));
        let response = self.connections.send(number, request).await?;

        if !response.flag(props::STORED) {
            return Err(PoolError::Processing(format!(
                "pool server {} did not store {}:{}",
                number,
                descriptor.identifier(),
                data_identifier
            )));
        }
        Ok(())
    }
}

/// Rejects check input that cannot name a media file.
pub fn validate_check_input(
    descriptor: &MediaResourceDescriptor,
    data_identifier: &str,
    file_type: &str,
    hash_value: &str,
) -> Result<()> {
    naming::validate_data_identifier(data_identifier)?;
    if !descriptor.supports_file_type(file_type) {
        return Err(PoolError::InvalidRequest(format!(
            "file type {} is not supported by {}",
            file_type,
            descriptor.identifier()
        )));
    }
    if !naming::is_valid_hash(hash_value) {
        return Err(PoolError::InvalidRequest(format!(
            "invalid hash value: {}",
            hash_value
        )));
    }
    Ok(())
}
