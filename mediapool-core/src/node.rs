use crate::dispatch::{CommandContext, Dispatcher, HandlerRegistry, WorkerInfo};
use crate::notify::{Notification, Notifier, TracingNotifier};
use crate::pool::{ConnectionManager, MediaPool};
use crate::protocol::KeyPair;
use crate::session::SessionRegistry;
use crate::storage::{MediaEncoder, MediaStore};
use crate::{NodeConfig, PoolError, ResourceCatalog, Result, StaticResourceCatalog};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Builder for a [`MediaNode`].
pub struct MediaNodeBuilder {
    config: NodeConfig,
    notifier: Option<Arc<dyn Notifier>>,
    catalog: Option<Arc<dyn ResourceCatalog>>,
    keys: Option<KeyPair>,
}

impl MediaNodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            notifier: None,
            catalog: None,
            keys: None,
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replaces the catalog built from the configured media resources.
    pub fn catalog(mut self, catalog: Arc<dyn ResourceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn key_pair(mut self, keys: KeyPair) -> Self {
        self.keys = Some(keys);
        self
    }

    fn resolve_keys(&mut self) -> Result<KeyPair> {
        if let Some(keys) = self.keys.take() {
            return Ok(keys);
        }
        match self.config.private_key.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => KeyPair::from_secret_hex(secret)
                .map_err(|error| PoolError::Config(format!("invalid ServerPrivateKey: {}", error))),
            _ => {
                tracing::warn!("No ServerPrivateKey configured, generated an ephemeral key pair");
                Ok(KeyPair::generate())
            }
        }
    }

    pub fn build(mut self) -> Result<MediaNode> {
        self.config.validate()?;

        let keys = Arc::new(self.resolve_keys()?);
        let notifier = self
            .notifier
            .take()
            .unwrap_or_else(|| Arc::new(TracingNotifier));
        let catalog: Arc<dyn ResourceCatalog> = match self.catalog.take() {
            Some(catalog) => catalog,
            None => Arc::new(StaticResourceCatalog::new(self.config.resources.clone())?),
        };

        let encoder = Arc::new(MediaEncoder::new(&self.config.encoding)?);
        let store = Arc::new(MediaStore::new(
            self.config.media_root.clone(),
            self.config.application.identifier.clone(),
            encoder,
            self.config.keep_deleted_files,
        )?);
        let sessions = Arc::new(SessionRegistry::new(&self.config.session));

        let pool = if self.config.pool.enabled {
            let connections = ConnectionManager::new(
                self.config.application.clone(),
                keys.clone(),
                &self.config.transport,
                &self.config.pool.peers,
            );
            Some(Arc::new(MediaPool::new(
                self.config.pool.clone(),
                store.clone(),
                catalog.clone(),
                connections,
                notifier.clone(),
            )))
        } else {
            None
        };

        let context = Arc::new(CommandContext::new(
            self.config.application.clone(),
            keys.clone(),
            sessions.clone(),
            catalog,
            store.clone(),
            pool.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            context,
            HandlerRegistry::standard(),
            notifier.clone(),
            self.config.transport.clone(),
        ));

        Ok(MediaNode {
            config: self.config,
            keys,
            sessions,
            store,
            pool,
            dispatcher,
            notifier,
        })
    }
}

/// A configured media server that has not started serving yet.
pub struct MediaNode {
    config: NodeConfig,
    keys: Arc<KeyPair>,
    sessions: Arc<SessionRegistry>,
    store: Arc<MediaStore>,
    pool: Option<Arc<MediaPool>>,
    dispatcher: Arc<Dispatcher>,
    notifier: Arc<dyn Notifier>,
}

impl MediaNode {
    pub fn builder(config: NodeConfig) -> MediaNodeBuilder {
        MediaNodeBuilder::new(config)
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_hex()
    }

    pub fn store(&self) -> &Arc<MediaStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn pool(&self) -> Option<&Arc<MediaPool>> {
        self.pool.as_ref()
    }

    /// Binds the configured address and starts serving.
    pub async fn start(self) -> Result<RunningNode> {
        let listener = TcpListener::bind(&self.config.bind_addr).await.map_err(|error| {
            PoolError::Config(format!("cannot bind {}: {}", self.config.bind_addr, error))
        })?;
        self.start_with_listener(listener)
    }

    /// Starts the accept loop and the replication loop on `listener`.
    pub fn start_with_listener(self, listener: TcpListener) -> Result<RunningNode> {
        let local_addr = listener.local_addr()?;
        let max_workers = self.config.transport.max_workers;
        let workers = Arc::new(Semaphore::new(max_workers));

        let (accept_tx, accept_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.dispatcher.clone(),
            workers.clone(),
            accept_rx,
        ));

        let (replication_tx, replication_rx) = watch::channel(false);
        let replication_task = self
            .pool
            .clone()
            .map(|pool| tokio::spawn(pool.run(replication_rx)));

        tracing::info!(
            "Media node {} {} listening on {} ({} workers, pool {})",
            self.config.application.identifier,
            self.config.application.version,
            local_addr,
            max_workers,
            if self.pool.is_some() { "enabled" } else { "disabled" }
        );

        Ok(RunningNode {
            node: self,
            local_addr,
            workers,
            accept_tx,
            accept_task,
            replication_tx,
            replication_task,
        })
    }
}

/// A serving media node.
pub struct RunningNode {
    node: MediaNode,
    local_addr: SocketAddr,
    workers: Arc<Semaphore>,
    accept_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    replication_tx: watch::Sender<bool>,
    replication_task: Option<JoinHandle<()>>,
}

impl RunningNode {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_key_hex(&self) -> String {
        self.node.public_key_hex()
    }

    pub fn store(&self) -> &Arc<MediaStore> {
        self.node.store()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.node.sessions()
    }

    pub fn pool(&self) -> Option<&Arc<MediaPool>> {
        self.node.pool()
    }

    /// Stops the node: no new connections, in-flight workers get the grace
    /// period, queues are drained when configured, then the replication loop
    /// and finally the notifier are stopped.
    pub async fn shutdown(self) -> Result<()> {
        let shutdown = self.node.config.shutdown.clone();
        let max_workers = self.node.config.transport.max_workers;

        let _ = self.accept_tx.send(true);
        if let Err(error) = self.accept_task.await {
            tracing::error!("Accept loop ended abnormally: {}", error);
        }

        let permits = u32::try_from(max_workers).unwrap_or(u32::MAX);
        match tokio::time::timeout(shutdown.grace_period, self.workers.acquire_many(permits)).await {
            Ok(Ok(_all)) => tracing::info!("All workers finished"),
            Ok(Err(error)) => tracing::warn!("Worker pool closed early: {}", error),
            Err(_) => tracing::warn!(
                "{} workers still busy after {:?}, abandoning them",
                max_workers - self.workers.available_permits(),
                shutdown.grace_period
            ),
        }

        if let Some(pool) = &self.node.pool {
            if shutdown.drain_queues {
                pool.drain(shutdown.grace_period).await;
            }
        }

        let _ = self.replication_tx.send(true);
        if let Some(task) = self.replication_task {
            if let Err(error) = task.await {
                tracing::error!("Replication loop ended abnormally: {}", error);
            }
        }

        self.node
            .notifier
            .notify(Notification::new(
                self.node.config.application.identifier.clone(),
                format!("Media node on {} stopped", self.local_addr),
            ))
            .await;
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_worker: u64 = 0;

    loop {
        // Excess connections wait in the listen backlog until a worker frees up.
        let permit = tokio::select! {
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                next_worker += 1;
                let worker = WorkerInfo {
                    number: next_worker,
                };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.handle_connection(stream, peer, worker).await;
                    drop(permit);
                });
            }
            Err(error) => {
                tracing::warn!("Accept failed: {}", error);
                drop(permit);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::info!("Stopped accepting connections");
}
