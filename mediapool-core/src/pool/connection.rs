use crate::protocol::{
    CommandId, Frame, KeyPair, RequestContainer, ResponseContainer, codec, parse_public_key,
    props, read_frame, write_frame,
};
use crate::{ApplicationConfig, ErrorCode, PeerSpec, PoolError, Result, TransportConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use x25519_dalek::PublicKey;

#[derive(Debug, Default)]
struct PeerSession {
    server_public_key: Option<PublicKey>,
    session_id: Option<String>,
}

/// One pool peer together with the session this server holds on it.
#[derive(Debug)]
pub struct ConnectionContainer {
    pub number: u32,
    pub host: String,
    pub port: u16,
    session: Mutex<PeerSession>,
}

impl ConnectionContainer {
    pub fn new(peer: &PeerSpec) -> Self {
        Self {
            number: peer.number,
            host: peer.host.clone(),
            port: peer.port,
            session: Mutex::new(PeerSession::default()),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.session_id.clone()
    }

    async fn current(&self) -> Option<(String, PublicKey)> {
        let session = self.session.lock().await;
        match (&session.session_id, session.server_public_key) {
            (Some(session_id), Some(server_key)) => Some((session_id.clone(), server_key)),
            _ => None,
        }
    }

    /// Forgets the cached session; the next request re-establishes it.
    pub async fn invalidate(&self) {
        let mut session = self.session.lock().await;
        session.session_id = None;
        session.server_public_key = None;
    }

    /// Forgets the cached session only if it is still `session_id`.
    async fn invalidate_session(&self, session_id: &str) {
        let mut session = self.session.lock().await;
        if session.session_id.as_deref() == Some(session_id) {
            session.session_id = None;
            session.server_public_key = None;
        }
    }
}

/// Client side of the pool: sessions on every peer and request exchange.
pub struct ConnectionManager {
    application: ApplicationConfig,
    keys: Arc<KeyPair>,
    socket_timeout: Duration,
    max_frame_bytes: usize,
    connections: BTreeMap<u32, Arc<ConnectionContainer>>,
}

impl ConnectionManager {
    pub fn new(
        application: ApplicationConfig,
        keys: Arc<KeyPair>,
        transport: &TransportConfig,
        peers: &[PeerSpec],
    ) -> Self {
        let connections = peers
            .iter()
            .map(|peer| (peer.number, Arc::new(ConnectionContainer::new(peer))))
            .collect();

        Self {
            application,
            keys,
            socket_timeout: transport.socket_timeout,
            max_frame_bytes: transport.max_frame_bytes,
            connections,
        }
    }

    pub fn application(&self) -> &ApplicationConfig {
        &self.application
    }

    pub fn connection(&self, number: u32) -> Result<Arc<ConnectionContainer>> {
        self.connections.get(&number).cloned().ok_or_else(|| {
            PoolError::Config(format!("pool server {} is not configured", number))
        })
    }

    pub fn numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.connections.keys().copied()
    }

    /// Makes sure a session exists on the peer. Returns true when a new
    /// session had to be created.
    ///
    /// The session lock is not held during the handshake. When two callers
    /// race, the first session stored wins and the other one is abandoned
    /// on the peer, where it expires.
    pub async fn establish(&self, connection: &ConnectionContainer) -> Result<bool> {
        if connection.current().await.is_some() {
            return Ok(false);
        }

        let handshake = RequestContainer::new(&self.application, CommandId::Handshake)
            .with_property(props::CLIENT_PUBLIC_KEY, self.keys.public_hex());
        let response = self
            .exchange(connection, &codec::encode(&handshake, None)?)
            .await?
            .into_result()?;
        let server_key = parse_public_key(response.required_property(props::SERVER_PUBLIC_KEY)?)?;

        let session_id = ulid::Ulid::new().to_string();
        let create = RequestContainer::new(&self.application, CommandId::CreateSession)
            .with_session(session_id.clone())
            .with_property(props::CLIENT_PUBLIC_KEY, self.keys.public_hex());
        let response = self
            .exchange(connection, &codec::encode(&create, Some(&server_key))?)
            .await?
            .into_result()?;
        if !response.flag(props::SESSION_CREATED) {
            return Err(PoolError::Auth(format!(
                "pool server {} refused session {}",
                connection.number, session_id
            )));
        }

        let mut session = connection.session.lock().await;
        if session.session_id.is_some() && session.server_public_key.is_some() {
            tracing::debug!(
                "Session on pool server {} was established concurrently, abandoning {}",
                connection.number,
                session_id
            );
            return Ok(false);
        }

        tracing::info!(
            "Established session {} on pool server {} ({})",
            session_id,
            connection.number,
            connection.address()
        );
        session.server_public_key = Some(server_key);
        session.session_id = Some(session_id);
        Ok(true)
    }

    /// Sends a session bound request to pool server `number`.
    ///
    /// A peer answering "session does not exist" invalidates the cached
    /// session, and the request is sent once more on a fresh session.
    pub async fn send(&self, number: u32, request: RequestContainer) -> Result<ResponseContainer> {
        let connection = self.connection(number)?;
        let mut reestablished = false;

        loop {
            self.establish(&connection).await?;
            let Some((session_id, server_key)) = connection.current().await else {
                return Err(PoolError::Internal(format!(
                    "session on pool server {} vanished",
                    number
                )));
            };

            let frame = codec::encode(
                &request.clone().with_session(session_id.clone()),
                Some(&server_key),
            )?;
            let response = self.exchange(&connection, &frame).await?;

            match response.into_result() {
                Err(PoolError::Remote {
                    code: ErrorCode::SessionDoesNotExist,
                    description,
                }) => {
                    tracing::warn!(
                        "Pool server {} dropped session {}: {}",
                        number,
                        session_id,
                        description
                    );
                    connection.invalidate_session(&session_id).await;
                    if reestablished {
                        return Err(PoolError::Remote {
                            code: ErrorCode::SessionDoesNotExist,
                            description,
                        });
                    }
                    reestablished = true;
                }
                other => return other,
            }
        }
    }

    async fn exchange(
        &self,
        connection: &ConnectionContainer,
        frame: &Frame,
    ) -> Result<ResponseContainer> {
        let number = connection.number;
        let lost = |reason: String| PoolError::PoolUnreachable { number, reason };

        let mut stream = timeout(self.socket_timeout, TcpStream::connect(connection.address()))
            .await
            .map_err(|_| lost("connect timed out".to_string()))?
            .map_err(|error| lost(error.to_string()))?;

        timeout(self.socket_timeout, write_frame(&mut stream, frame))
            .await
            .map_err(|_| lost("write timed out".to_string()))?
            .map_err(|error| lost(error.to_string()))?;

        let reply = timeout(
            self.socket_timeout,
            read_frame(&mut stream, self.max_frame_bytes),
        )
        .await
        .map_err(|_| lost("read timed out".to_string()))?
        .map_err(|error| match error {
            PoolError::Io(error) => lost(error.to_string()),
            other => other,
        })?;

        codec::decode(&reply, Some(self.keys.as_ref()))
    }
}
