use crate::operations::{
    CheckMediaOperation, MediaInfoOperation, ReadMediaOperation, UploadMediaOperation,
};
use crate::pool::MediaPool;
use crate::protocol::{CommandId, KeyPair, RequestContainer, ResponseContainer};
use crate::session::SessionRegistry;
use crate::storage::MediaStore;
use crate::{ApplicationConfig, MediaResourceDescriptor, PoolError, ResourceCatalog, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared state every handler runs against.
pub struct CommandContext {
    pub application: ApplicationConfig,
    pub keys: Arc<KeyPair>,
    pub sessions: Arc<SessionRegistry>,
    pub catalog: Arc<dyn ResourceCatalog>,
    pub store: Arc<MediaStore>,
    pub pool: Option<Arc<MediaPool>>,
    pub check_media: CheckMediaOperation,
    pub read_media: ReadMediaOperation,
    pub media_info: MediaInfoOperation,
    pub upload_media: UploadMediaOperation,
}

impl CommandContext {
    pub fn new(
        application: ApplicationConfig,
        keys: Arc<KeyPair>,
        sessions: Arc<SessionRegistry>,
        catalog: Arc<dyn ResourceCatalog>,
        store: Arc<MediaStore>,
        pool: Option<Arc<MediaPool>>,
    ) -> Self {
        Self {
            check_media: CheckMediaOperation::new(store.clone(), pool.clone()),
            read_media: ReadMediaOperation::new(store.clone(), pool.clone()),
            media_info: MediaInfoOperation::new(store.clone(), pool.clone()),
            upload_media: UploadMediaOperation::new(store.clone(), pool.clone()),
            application,
            keys,
            sessions,
            catalog,
            store,
            pool,
        }
    }

    pub fn descriptor(&self, identifier: &str) -> Result<Arc<MediaResourceDescriptor>> {
        self.catalog
            .descriptor(identifier)
            .ok_or_else(|| PoolError::ResourceNotFound(identifier.to_string()))
    }
}

/// Identifies the worker running a command.
#[derive(Debug, Clone, Copy)]
pub struct WorkerInfo {
    pub number: u64,
}

/// One command implementation.
///
/// The dispatcher calls `validate`, `process` and `arrange_results` in that
/// order and stops at the first error, which becomes the error block of the
/// response.
#[async_trait]
pub trait CommandHandler: Send {
    fn command(&self) -> CommandId;

    fn validate(&mut self, context: &CommandContext, request: &RequestContainer) -> Result<()>;

    async fn process(&mut self, context: &CommandContext, worker: WorkerInfo) -> Result<()>;

    fn arrange_results(
        &self,
        context: &CommandContext,
        response: &mut ResponseContainer,
    ) -> Result<()>;
}

pub type HandlerFactory = fn() -> Box<dyn CommandHandler>;

/// Static map from command identifier to handler constructor.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<CommandId, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every command the server implements.
    pub fn standard() -> Self {
        use super::handlers::{
            CreateSessionHandler, HandshakeHandler, MediaFileCheckHandler, MediaFileInfoHandler,
            MediaFileReadHandler, MediaFileUploadHandler,
        };

        let mut registry = Self::new();
        registry.register(CommandId::Handshake, HandshakeHandler::boxed);
        registry.register(CommandId::CreateSession, CreateSessionHandler::boxed);
        registry.register(CommandId::MediaFileCheck, MediaFileCheckHandler::boxed);
        registry.register(CommandId::MediaFileInfo, MediaFileInfoHandler::boxed);
        registry.register(CommandId::MediaFileRead, MediaFileReadHandler::boxed);
        registry.register(CommandId::MediaFileUpload, MediaFileUploadHandler::boxed);
        registry
    }

    pub fn register(&mut self, command: CommandId, factory: HandlerFactory) {
        self.factories.insert(command, factory);
    }

    pub fn resolve(&self, command: CommandId) -> Result<Box<dyn CommandHandler>> {
        self.factories
            .get(&command)
            .map(|factory| factory())
            .ok_or_else(|| PoolError::UnknownCommand(command.to_string()))
    }
}
