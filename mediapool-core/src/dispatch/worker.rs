use super::handler::{CommandContext, HandlerRegistry, WorkerInfo};
use crate::notify::{Notification, Notifier};
use crate::protocol::{
    CommandId, Frame, FrameKind, RequestContainer, ResponseContainer, codec, parse_public_key,
    props, read_frame, write_frame,
};
use crate::{ErrorCode, PoolError, Result, TransportConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::timeout;
use x25519_dalek::PublicKey;

/// Response of one exchange and the key it must be sealed to.
#[derive(Debug, Clone)]
pub struct DispatchReply {
    pub response: ResponseContainer,
    /// `None` sends the response as a plain frame.
    pub reply_key: Option<PublicKey>,
}

impl DispatchReply {
    pub fn into_frame(&self) -> Result<Frame> {
        codec::encode(&self.response, self.reply_key.as_ref())
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.response.error.as_ref().map(|block| block.code)
    }
}

/// Runs the request pipeline for accepted connections.
pub struct Dispatcher {
    context: Arc<CommandContext>,
    registry: HandlerRegistry,
    notifier: Arc<dyn Notifier>,
    transport: TransportConfig,
}

impl Dispatcher {
    pub fn new(
        context: Arc<CommandContext>,
        registry: HandlerRegistry,
        notifier: Arc<dyn Notifier>,
        transport: TransportConfig,
    ) -> Self {
        Self {
            context,
            registry,
            notifier,
            transport,
        }
    }

    pub fn context(&self) -> &Arc<CommandContext> {
        &self.context
    }

    /// Serves exactly one request on `stream`, then closes it.
    pub async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr, worker: WorkerInfo) {
        let started = Instant::now();
        let socket_timeout = self.transport.socket_timeout;

        let read = match timeout(
            socket_timeout,
            read_frame(&mut stream, self.transport.max_frame_bytes),
        )
        .await
        {
            Ok(read) => read,
            Err(_) => Err(PoolError::Timeout(format!("reading request from {}", peer))),
        };

        let reply = match read {
            Ok(frame) => self.dispatch(&frame, worker).await,
            Err(error) => {
                tracing::warn!("Worker {} could not read request from {}: {}", worker.number, peer, error);
                self.technical_reply(&error)
            }
        };

        let written = match reply.into_frame() {
            Ok(frame) => match timeout(socket_timeout, write_frame(&mut stream, &frame)).await {
                Ok(result) => result,
                Err(_) => Err(PoolError::Timeout(format!("writing response to {}", peer))),
            },
            Err(error) => Err(error),
        };
        if let Err(error) = written {
            tracing::warn!("Worker {} could not answer {}: {}", worker.number, peer, error);
        }

        let elapsed = started.elapsed();
        tracing::debug!(
            "Worker {} served {} for {} in {:?}",
            worker.number,
            display_command(&reply.response),
            peer,
            elapsed
        );
        self.forward_summary(&reply, peer, elapsed);
    }

    /// Decodes, authorizes and executes one request frame.
    pub async fn dispatch(&self, frame: &Frame, worker: WorkerInfo) -> DispatchReply {
        let request: RequestContainer = match codec::decode(frame, Some(self.context.keys.as_ref())) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!("Worker {} rejected undecodable request: {}", worker.number, error);
                return self.technical_reply(&PoolError::Protocol(
                    "request could not be decoded".to_string(),
                ));
            }
        };

        let mut response = ResponseContainer::for_request(&request, &self.context.application);
        let mut reply_key = None;

        let result = self
            .run_pipeline(&request, frame.kind, worker, &mut response, &mut reply_key)
            .await;

        if let Err(error) = result {
            match error.error_code() {
                ErrorCode::TechnicalError | ErrorCode::ProcessingFailed => tracing::error!(
                    "{} (session {:?}) failed on worker {}: {}",
                    request.command_id,
                    request.session_id,
                    worker.number,
                    error
                ),
                _ => tracing::info!(
                    "{} (session {:?}) rejected on worker {}: {}",
                    request.command_id,
                    request.session_id,
                    worker.number,
                    error
                ),
            }
            response.set_error(&error);
        }

        DispatchReply {
            response,
            reply_key,
        }
    }

    async fn run_pipeline(
        &self,
        request: &RequestContainer,
        kind: FrameKind,
        worker: WorkerInfo,
        response: &mut ResponseContainer,
        reply_key: &mut Option<PublicKey>,
    ) -> Result<()> {
        // A caller that names its key gets its answer sealed, even errors.
        *reply_key = request
            .property(props::CLIENT_PUBLIC_KEY)
            .and_then(|key| parse_public_key(key).ok());

        self.check_application(request)?;

        let command: CommandId = request.command_id.parse()?;
        if kind == FrameKind::Plain && command != CommandId::Handshake {
            return Err(PoolError::Protocol(format!(
                "{} must be sent sealed",
                command
            )));
        }

        if command.requires_session() {
            let session_id = request
                .session_id
                .as_deref()
                .ok_or_else(|| PoolError::SessionNotFound("<none>".to_string()))?;
            let session = self
                .context
                .sessions
                .get(session_id)
                .await
                .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;
            *reply_key = Some(session.client_public_key);
        }

        let mut handler = self.registry.resolve(command)?;
        handler.validate(&self.context, request)?;
        handler.process(&self.context, worker).await?;
        handler.arrange_results(&self.context, response)?;
        Ok(())
    }

    fn check_application(&self, request: &RequestContainer) -> Result<()> {
        let application = &self.context.application;
        if request.client_app_id != application.identifier {
            return Err(PoolError::ApplicationMismatch {
                expected: application.identifier.clone(),
                actual: request.client_app_id.clone(),
            });
        }
        if request.client_version != application.version {
            return Err(PoolError::VersionMismatch {
                expected: application.version.clone(),
                actual: request.client_version.clone(),
            });
        }
        Ok(())
    }

    fn technical_reply(&self, error: &PoolError) -> DispatchReply {
        DispatchReply {
            response: ResponseContainer::technical_error(&self.context.application, error),
            reply_key: None,
        }
    }

    fn forward_summary(&self, reply: &DispatchReply, peer: SocketAddr, elapsed: std::time::Duration) {
        let command = display_command(&reply.response);
        let mut notification = Notification::new(
            command.clone(),
            match reply.error_code() {
                Some(code) => format!("{} answered with {:?}", command, code),
                None => format!("{} answered", command),
            },
        )
        .with_additional_text(format!("peer {} in {} ms", peer, elapsed.as_millis()));
        if let Some(block) = &reply.response.error {
            notification = notification.with_documentation(block.headline.clone());
        }

        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.notify(notification).await;
        });
    }
}

fn display_command(response: &ResponseContainer) -> String {
    if response.command_id.is_empty() {
        "<undecodable>".to_string()
    } else {
        response.command_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::TracingNotifier;
    use crate::protocol::KeyPair;
    use crate::session::SessionRegistry;
    use crate::storage::{MediaEncoder, MediaStore, compute_hash};
    use crate::{
        ApplicationConfig, MediaResourceDescriptor, SessionConfig, StaticResourceCatalog,
    };
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        dispatcher: Dispatcher,
        server_key: PublicKey,
        client: KeyPair,
        application: ApplicationConfig,
    }

    impl Harness {
        fn new(max_sessions: usize) -> Self {
            let dir = TempDir::new().unwrap();
            let application = ApplicationConfig {
                identifier: "mediapool".to_string(),
                version: "1.0".to_string(),
            };
            let keys = Arc::new(KeyPair::generate());
            let server_key = keys.public_key();
            let store = Arc::new(
                MediaStore::new(
                    dir.path().to_path_buf(),
                    "mediapool",
                    Arc::new(MediaEncoder::disabled()),
                    false,
                )
                .unwrap(),
            );
            let catalog = Arc::new(
                StaticResourceCatalog::new(vec![MediaResourceDescriptor::new(
                    "Apartment",
                    "Room",
                    "room",
                    &["jpg"],
                )])
                .unwrap(),
            );
            let sessions = Arc::new(SessionRegistry::new(&SessionConfig {
                max_active_sessions: max_sessions,
                percentage_rate_for_cleaning: 100,
            }));
            let context = Arc::new(CommandContext::new(
                application.clone(),
                keys,
                sessions,
                catalog,
                store,
                None,
            ));

            Self {
                _dir: dir,
                dispatcher: Dispatcher::new(
                    context,
                    HandlerRegistry::standard(),
                    Arc::new(TracingNotifier),
                    TransportConfig::default(),
                ),
                server_key,
                client: KeyPair::generate(),
                application,
            }
        }

        fn request(&self, command: CommandId) -> RequestContainer {
            RequestContainer::new(&self.application, command)
        }

        async fn send(&self, request: &RequestContainer) -> ResponseContainer {
            let frame = codec::encode(request, Some(&self.server_key)).unwrap();
            let reply = self.dispatcher.dispatch(&frame, WorkerInfo { number: 1 }).await;
            let frame = reply.into_frame().unwrap();
            codec::decode(&frame, Some(&self.client)).unwrap()
        }

        async fn create_session(&self, session_id: &str) -> ResponseContainer {
            let request = self
                .request(CommandId::CreateSession)
                .with_session(session_id)
                .with_property(props::CLIENT_PUBLIC_KEY, self.client.public_hex());
            self.send(&request).await
        }

        fn check_request(&self, session_id: &str) -> RequestContainer {
            self.request(CommandId::MediaFileCheck)
                .with_session(session_id)
                .with_property(props::MEDIA_RESOURCE_IDENTIFIER, "Apartment/Room")
                .with_property(props::DATA_IDENTIFIER, "1001")
                .with_property(props::FILE_TYPE, "jpg")
                .with_property(props::HASH_VALUE, compute_hash(b"photo"))
        }
    }

    #[tokio::test]
    async fn test_plain_handshake() {
        let harness = Harness::new(10);
        let request = harness
            .request(CommandId::Handshake)
            .with_property(props::CLIENT_PUBLIC_KEY, harness.client.public_hex());
        let frame = codec::encode(&request, None).unwrap();
        let reply = harness.dispatcher.dispatch(&frame, WorkerInfo { number: 1 }).await;

        assert!(reply.response.is_success());
        assert_eq!(reply.reply_key, Some(harness.client.public_key()));
        assert_eq!(
            reply.response.property(props::SERVER_PUBLIC_KEY).unwrap(),
            crate::protocol::public_key_hex(&harness.server_key)
        );
    }

    #[tokio::test]
    async fn test_handshake_with_unreadable_key_is_rejected() {
        let harness = Harness::new(10);
        let request = harness
            .request(CommandId::Handshake)
            .with_property(props::CLIENT_PUBLIC_KEY, "not-a-key");
        let frame = codec::encode(&request, None).unwrap();
        let reply = harness.dispatcher.dispatch(&frame, WorkerInfo { number: 1 }).await;

        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidParameter));
        assert!(reply.reply_key.is_none());
        assert!(reply.response.property(props::SERVER_PUBLIC_KEY).is_none());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let harness = Harness::new(10);
        let created = harness.create_session("S1").await;
        assert!(created.flag(props::SESSION_CREATED));

        let duplicate = harness.create_session("S1").await;
        assert_eq!(
            duplicate.error.unwrap().code,
            ErrorCode::SessionAlreadyExists
        );

        let response = harness.send(&harness.check_request("S1")).await;
        assert!(response.is_success());
        assert_eq!(response.property(props::EXISTS), Some("false"));
    }

    #[tokio::test]
    async fn test_unknown_session_gets_plain_error() {
        let harness = Harness::new(10);
        let frame = codec::encode(&harness.check_request("S2"), Some(&harness.server_key)).unwrap();
        let reply = harness.dispatcher.dispatch(&frame, WorkerInfo { number: 1 }).await;

        assert_eq!(reply.error_code(), Some(ErrorCode::SessionDoesNotExist));
        assert!(reply.reply_key.is_none());
        assert_eq!(reply.into_frame().unwrap().kind, FrameKind::Plain);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected_for_every_command() {
        let harness = Harness::new(10);
        harness.create_session("S1").await;

        for command in CommandId::ALL {
            let mut request = harness
                .request(command)
                .with_session("S1")
                .with_property(props::CLIENT_PUBLIC_KEY, harness.client.public_hex());
            request.client_version = "0.9".to_string();

            let response = harness.send(&request).await;
            assert_eq!(
                response.error.map(|block| block.code),
                Some(ErrorCode::VersionMismatch),
                "{}",
                command
            );
        }
        // The rejected CreateSession did not register a second session.
        assert_eq!(harness.dispatcher.context().sessions.len().await, 1);
    }

    #[tokio::test]
    async fn test_undecodable_request() {
        let harness = Harness::new(10);
        let frame = Frame::sealed(vec![1, 2, 3]);
        let reply = harness.dispatcher.dispatch(&frame, WorkerInfo { number: 1 }).await;

        assert_eq!(reply.error_code(), Some(ErrorCode::ProtocolError));
        assert!(reply.reply_key.is_none());
        assert!(reply.response.properties.is_empty());
    }

    #[tokio::test]
    async fn test_plain_command_rejected() {
        let harness = Harness::new(10);
        harness.create_session("S1").await;
        let frame = codec::encode(&harness.check_request("S1"), None).unwrap();
        let reply = harness.dispatcher.dispatch(&frame, WorkerInfo { number: 1 }).await;
        assert_eq!(reply.error_code(), Some(ErrorCode::ProtocolError));
    }

    #[tokio::test]
    async fn test_upload_read_info() {
        let harness = Harness::new(10);
        harness.create_session("S1").await;
        let hash = compute_hash(b"photo");

        let upload = harness
            .request(CommandId::MediaFileUpload)
            .with_session("S1")
            .with_property(props::MEDIA_RESOURCE_IDENTIFIER, "Apartment/Room")
            .with_property(props::DATA_IDENTIFIER, "1001")
            .with_property(props::FILE_TYPE, "jpg")
            .with_property(props::HASH_VALUE, hash.clone())
            .with_property(props::CONTENT, BASE64.encode(b"photo"));
        let response = harness.send(&upload).await;
        assert!(response.flag(props::STORED));

        let response = harness.send(&harness.check_request("S1")).await;
        assert_eq!(response.property(props::EXISTS), Some("true"));

        let read = harness
            .request(CommandId::MediaFileRead)
            .with_session("S1")
            .with_property(props::MEDIA_RESOURCE_IDENTIFIER, "Apartment/Room")
            .with_property(props::DATA_IDENTIFIER, "1001");
        let response = harness.send(&read).await;
        assert_eq!(
            BASE64.decode(response.property(props::CONTENT).unwrap()).unwrap(),
            b"photo"
        );

        let mut info = read.clone();
        info.command_id = CommandId::MediaFileInfo.to_string();
        let response = harness.send(&info).await;
        assert_eq!(response.property(props::EXISTS), Some("true"));
        assert_eq!(response.property(props::HASH_VALUE), Some(hash.as_str()));
        assert_eq!(response.property(props::ENCODING_KEY_NUMBER), Some("0"));

        let mut missing = read.clone();
        missing
            .properties
            .insert(props::DATA_IDENTIFIER.to_string(), "2002".to_string());
        let response = harness.send(&missing).await;
        assert_eq!(
            response.error.map(|block| block.code),
            Some(ErrorCode::MediaFileNotFound)
        );
    }

    #[tokio::test]
    async fn test_unknown_resource_is_invalid_parameter() {
        let harness = Harness::new(10);
        harness.create_session("S1").await;
        let mut request = harness.check_request("S1");
        request.properties.insert(
            props::MEDIA_RESOURCE_IDENTIFIER.to_string(),
            "Garage/Door".to_string(),
        );
        let response = harness.send(&request).await;
        assert_eq!(
            response.error.map(|block| block.code),
            Some(ErrorCode::InvalidParameter)
        );
    }
}
