use super::handler::{CommandContext, CommandHandler, WorkerInfo};
use crate::operations::{
    CheckMediaOperationOutcome, CheckMediaOperationRequest, MediaInfoOperationOutcome,
    MediaInfoOperationRequest, MediaInfoOperationResult, ReadMediaOperationOutcome,
    ReadMediaOperationRequest, ReadMediaOperationResult, UploadMediaOperationOutcome,
    UploadMediaOperationRequest,
};
use crate::protocol::{
    CommandId, RequestContainer, ResponseContainer, parse_public_key, props,
};
use crate::storage::MediaFileRecord;
use crate::{PoolError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use x25519_dalek::PublicKey;

const MAX_SESSION_ID_LEN: usize = 128;
const UPLOAD_CODENAME: &str = "upload";

fn not_validated(command: CommandId) -> PoolError {
    PoolError::Internal(format!("{} processed before validation", command))
}

fn client_public_key(request: &RequestContainer) -> Result<PublicKey> {
    parse_public_key(request.required_property(props::CLIENT_PUBLIC_KEY)?)
        .map_err(|error| PoolError::InvalidRequest(format!("invalid client public key: {}", error)))
}

/// Hands out the server public key. The client key only has to parse; the
/// reply to a plain handshake is keyed by the dispatcher.
#[derive(Default)]
pub struct HandshakeHandler;

impl HandshakeHandler {
    pub fn boxed() -> Box<dyn CommandHandler> {
        Box::new(Self)
    }
}

#[async_trait]
impl CommandHandler for HandshakeHandler {
    fn command(&self) -> CommandId {
        CommandId::Handshake
    }

    fn validate(&mut self, _context: &CommandContext, request: &RequestContainer) -> Result<()> {
        client_public_key(request)?;
        Ok(())
    }

    async fn process(&mut self, _context: &CommandContext, _worker: WorkerInfo) -> Result<()> {
        Ok(())
    }

    fn arrange_results(
        &self,
        context: &CommandContext,
        response: &mut ResponseContainer,
    ) -> Result<()> {
        response.set_property(props::SERVER_PUBLIC_KEY, context.keys.public_hex());
        Ok(())
    }
}

#[derive(Default)]
pub struct CreateSessionHandler {
    session_id: Option<String>,
    client_key: Option<PublicKey>,
}

impl CreateSessionHandler {
    pub fn boxed() -> Box<dyn CommandHandler> {
        Box::new(Self::default())
    }
}

#[async_trait]
impl CommandHandler for CreateSessionHandler {
    fn command(&self) -> CommandId {
        CommandId::CreateSession
    }

    fn validate(&mut self, _context: &CommandContext, request: &RequestContainer) -> Result<()> {
        let session_id = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PoolError::InvalidRequest("session identifier is missing".to_string()))?;
        if session_id.len() > MAX_SESSION_ID_LEN || session_id.chars().any(char::is_control) {
            return Err(PoolError::InvalidRequest(
                "session identifier is invalid".to_string(),
            ));
        }

        self.session_id = Some(session_id.to_string());
        self.client_key = Some(client_public_key(request)?);
        Ok(())
    }

    async fn process(&mut self, context: &CommandContext, _worker: WorkerInfo) -> Result<()> {
        let (Some(session_id), Some(client_key)) = (&self.session_id, self.client_key) else {
            return Err(not_validated(self.command()));
        };

        if !context.sessions.add(session_id, client_key).await {
            return Err(PoolError::SessionExists(session_id.clone()));
        }
        tracing::debug!("Created session {}", session_id);
        Ok(())
    }

    fn arrange_results(
        &self,
        _context: &CommandContext,
        response: &mut ResponseContainer,
    ) -> Result<()> {
        response.set_property(props::SESSION_CREATED, "true");
        Ok(())
    }
}

#[derive(Default)]
pub struct MediaFileCheckHandler {
    request: Option<CheckMediaOperationRequest>,
    outcome: Option<CheckMediaOperationOutcome>,
}

impl MediaFileCheckHandler {
    pub fn boxed() -> Box<dyn CommandHandler> {
        Box::new(Self::default())
    }
}

#[async_trait]
impl CommandHandler for MediaFileCheckHandler {
    fn command(&self) -> CommandId {
        CommandId::MediaFileCheck
    }

    fn validate(&mut self, context: &CommandContext, request: &RequestContainer) -> Result<()> {
        let descriptor =
            context.descriptor(request.required_property(props::MEDIA_RESOURCE_IDENTIFIER)?)?;
        self.request = Some(CheckMediaOperationRequest {
            descriptor,
            data_identifier: request.required_property(props::DATA_IDENTIFIER)?.to_string(),
            file_type: request.required_property(props::FILE_TYPE)?.to_ascii_lowercase(),
            hash_value: request.required_property(props::HASH_VALUE)?.to_ascii_lowercase(),
            pool_request: request.flag(props::POOL_REQUEST),
        });
        Ok(())
    }

    async fn process(&mut self, context: &CommandContext, _worker: WorkerInfo) -> Result<()> {
        let request = self
            .request
            .take()
            .ok_or_else(|| not_validated(self.command()))?;
        self.outcome = Some(context.check_media.run(request).await?);
        Ok(())
    }

    fn arrange_results(
        &self,
        _context: &CommandContext,
        response: &mut ResponseContainer,
    ) -> Result<()> {
        let outcome = self.outcome.ok_or_else(|| not_validated(self.command()))?;
        response.set_property(props::EXISTS, outcome.exists().to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MediaFileInfoHandler {
    request: Option<MediaInfoOperationRequest>,
    result: Option<MediaInfoOperationResult>,
    processed: bool,
}

impl MediaFileInfoHandler {
    pub fn boxed() -> Box<dyn CommandHandler> {
        Box::new(Self::default())
    }
}

#[async_trait]
impl CommandHandler for MediaFileInfoHandler {
    fn command(&self) -> CommandId {
        CommandId::MediaFileInfo
    }

    fn validate(&mut self, context: &CommandContext, request: &RequestContainer) -> Result<()> {
        let descriptor =
            context.descriptor(request.required_property(props::MEDIA_RESOURCE_IDENTIFIER)?)?;
        self.request = Some(MediaInfoOperationRequest {
            descriptor,
            data_identifier: request.required_property(props::DATA_IDENTIFIER)?.to_string(),
            pool_request: request.flag(props::POOL_REQUEST),
        });
        Ok(())
    }

    async fn process(&mut self, context: &CommandContext, _worker: WorkerInfo) -> Result<()> {
        let request = self
            .request
            .take()
            .ok_or_else(|| not_validated(self.command()))?;
        self.result = match context.media_info.run(request).await? {
            MediaInfoOperationOutcome::Found(result) => Some(result),
            MediaInfoOperationOutcome::NotFound => None,
        };
        self.processed = true;
        Ok(())
    }

    fn arrange_results(
        &self,
        _context: &CommandContext,
        response: &mut ResponseContainer,
    ) -> Result<()> {
        if !self.processed {
            return Err(not_validated(self.command()));
        }

        let Some(info) = &self.result else {
            response.set_property(props::EXISTS, "false");
            return Ok(());
        };

        response.set_property(props::EXISTS, "true");
        response.set_property(props::FILE_TYPE, info.file_type.as_str());
        response.set_property(props::HASH_VALUE, info.hash_value.as_str());
        response.set_property(props::ENCODING_KEY_NUMBER, info.encoding_key.to_string());
        response.set_property(props::FILE_SIZE, info.file_size.to_string());
        response.set_property(props::LAST_MODIFIED, info.last_modified.to_rfc3339());
        Ok(())
    }
}

#[derive(Default)]
pub struct MediaFileReadHandler {
    request: Option<ReadMediaOperationRequest>,
    result: Option<ReadMediaOperationResult>,
}

impl MediaFileReadHandler {
    pub fn boxed() -> Box<dyn CommandHandler> {
        Box::new(Self::default())
    }
}

#[async_trait]
impl CommandHandler for MediaFileReadHandler {
    fn command(&self) -> CommandId {
        CommandId::MediaFileRead
    }

    fn validate(&mut self, context: &CommandContext, request: &RequestContainer) -> Result<()> {
        let descriptor =
            context.descriptor(request.required_property(props::MEDIA_RESOURCE_IDENTIFIER)?)?;
        self.request = Some(ReadMediaOperationRequest {
            descriptor,
            data_identifier: request.required_property(props::DATA_IDENTIFIER)?.to_string(),
            pool_request: request.flag(props::POOL_REQUEST),
        });
        Ok(())
    }

    async fn process(&mut self, context: &CommandContext, _worker: WorkerInfo) -> Result<()> {
        let request = self
            .request
            .take()
            .ok_or_else(|| not_validated(self.command()))?;
        let key = format!(
            "{}:{}",
            request.descriptor.identifier(),
            request.data_identifier
        );

        match context.read_media.run(request).await? {
            ReadMediaOperationOutcome::Found(result) => {
                if result.fetched {
                    tracing::info!("Served {} from the pool", key);
                }
                self.result = Some(result);
                Ok(())
            }
            ReadMediaOperationOutcome::NotFound => Err(PoolError::MediaNotFound(key)),
        }
    }

    fn arrange_results(
        &self,
        _context: &CommandContext,
        response: &mut ResponseContainer,
    ) -> Result<()> {
        let result = self
            .result
            .as_ref()
            .ok_or_else(|| not_validated(self.command()))?;
        response.set_property(props::FILE_TYPE, result.record.file_type.as_str());
        response.set_property(props::HASH_VALUE, result.record.hash_value.as_str());
        response.set_property(props::CONTENT, BASE64.encode(&result.content));
        Ok(())
    }
}

#[derive(Default)]
pub struct MediaFileUploadHandler {
    request: Option<UploadMediaOperationRequest>,
    record: Option<MediaFileRecord>,
}

impl MediaFileUploadHandler {
    pub fn boxed() -> Box<dyn CommandHandler> {
        Box::new(Self::default())
    }
}

#[async_trait]
impl CommandHandler for MediaFileUploadHandler {
    fn command(&self) -> CommandId {
        CommandId::MediaFileUpload
    }

    fn validate(&mut self, context: &CommandContext, request: &RequestContainer) -> Result<()> {
        let descriptor =
            context.descriptor(request.required_property(props::MEDIA_RESOURCE_IDENTIFIER)?)?;
        let content = BASE64
            .decode(request.required_property(props::CONTENT)?)
            .map_err(|error| PoolError::InvalidRequest(format!("invalid content: {}", error)))?;

        self.request = Some(UploadMediaOperationRequest {
            descriptor,
            data_identifier: request.required_property(props::DATA_IDENTIFIER)?.to_string(),
            file_type: request.required_property(props::FILE_TYPE)?.to_ascii_lowercase(),
            hash_value: request.required_property(props::HASH_VALUE)?.to_ascii_lowercase(),
            content: Bytes::from(content),
            pool_request: request.flag(props::POOL_REQUEST),
            codename: UPLOAD_CODENAME.to_string(),
            thread: String::new(),
        });
        Ok(())
    }

    async fn process(&mut self, context: &CommandContext, worker: WorkerInfo) -> Result<()> {
        let mut request = self
            .request
            .take()
            .ok_or_else(|| not_validated(self.command()))?;
        request.thread = worker.number.to_string();

        let outcome = context.upload_media.run(request).await?;
        if let UploadMediaOperationOutcome::Unchanged(record) = &outcome {
            tracing::debug!("Upload left {} unchanged", record.file_name);
        }
        self.record = Some(outcome.record().clone());
        Ok(())
    }

    fn arrange_results(
        &self,
        _context: &CommandContext,
        response: &mut ResponseContainer,
    ) -> Result<()> {
        let record = self
            .record
            .as_ref()
            .ok_or_else(|| not_validated(self.command()))?;
        response.set_property(props::STORED, "true");
        response.set_property(props::HASH_VALUE, record.hash_value.as_str());
        Ok(())
    }
}
