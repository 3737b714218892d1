use super::command::CommandId;
use crate::{ApplicationConfig, ErrorCode, PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAX_MESSAGE_PARTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContainer {
    pub client_app_id: String,
    pub client_version: String,
    pub server_app_id: String,
    pub server_version: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub command_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl RequestContainer {
    /// A request from `application` to a server running the same application.
    pub fn new(application: &ApplicationConfig, command: CommandId) -> Self {
        Self {
            client_app_id: application.identifier.clone(),
            client_version: application.version.clone(),
            server_app_id: application.identifier.clone(),
            server_version: application.version.clone(),
            session_id: None,
            command_id: command.as_str().to_string(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Non-empty property value, or a validation error.
    pub fn required_property(&self, name: &str) -> Result<&str> {
        match self.property(name).map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(PoolError::InvalidRequest(format!(
                "missing property {}",
                name
            ))),
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        self.property(name)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBlock {
    pub code: ErrorCode,
    pub headline: String,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub technical_description: String,
}

impl ErrorBlock {
    pub fn from_code(code: ErrorCode, technical_description: impl Into<String>) -> Self {
        let mut messages = code.message_parts();
        messages.truncate(MAX_MESSAGE_PARTS);
        Self {
            code,
            headline: code.headline().to_string(),
            messages,
            technical_description: technical_description.into(),
        }
    }

    /// Generic error block for `error`. Details that only make sense to an
    /// operator (paths, IO errors, key problems) stay out of the block.
    pub fn from_error(error: &PoolError) -> Self {
        let code = error.error_code();
        let description = match code {
            ErrorCode::TechnicalError | ErrorCode::ProcessingFailed => format!("{:?}", code),
            _ => error.to_string(),
        };
        Self::from_code(code, description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContainer {
    pub client_app_id: String,
    pub client_version: String,
    pub server_app_id: String,
    pub server_version: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub command_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<ErrorBlock>,
}

impl ResponseContainer {
    /// Empty response mirroring the request header, sent by `server`.
    pub fn for_request(request: &RequestContainer, server: &ApplicationConfig) -> Self {
        Self {
            client_app_id: request.client_app_id.clone(),
            client_version: request.client_version.clone(),
            server_app_id: server.identifier.clone(),
            server_version: server.version.clone(),
            session_id: request.session_id.clone(),
            command_id: request.command_id.clone(),
            properties: BTreeMap::new(),
            error: None,
        }
    }

    /// Error response used when the request itself could not be read.
    pub fn technical_error(server: &ApplicationConfig, error: &PoolError) -> Self {
        Self {
            client_app_id: String::new(),
            client_version: String::new(),
            server_app_id: server.identifier.clone(),
            server_version: server.version.clone(),
            session_id: None,
            command_id: String::new(),
            properties: BTreeMap::new(),
            error: Some(ErrorBlock::from_error(error)),
        }
    }

    pub fn set_property(&mut self, name: &str, value: impl Into<String>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn required_property(&self, name: &str) -> Result<&str> {
        self.property(name).ok_or_else(|| {
            PoolError::Protocol(format!("response is missing property {}", name))
        })
    }

    pub fn flag(&self, name: &str) -> bool {
        self.property(name)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    pub fn set_error(&mut self, error: &PoolError) {
        self.properties.clear();
        self.error = Some(ErrorBlock::from_error(error));
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Turns an error block into [`PoolError::Remote`].
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(block) => Err(PoolError::Remote {
                code: block.code,
                description: block.technical_description,
            }),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> ApplicationConfig {
        ApplicationConfig {
            identifier: "mediapool".to_string(),
            version: "1.0".to_string(),
        }
    }

    #[test]
    fn test_required_property() {
        let request = RequestContainer::new(&app(), CommandId::MediaFileCheck)
            .with_property("DataIdentifier", "1001")
            .with_property("HashValue", "  ");

        assert_eq!(request.required_property("DataIdentifier").unwrap(), "1001");
        assert!(request.required_property("HashValue").is_err());
        assert!(request.required_property("FileType").is_err());
    }

    #[test]
    fn test_error_block_hides_technical_detail() {
        let io = PoolError::Io(std::io::Error::other("/srv/media/secret path"));
        let block = ErrorBlock::from_error(&io);
        assert_eq!(block.code, ErrorCode::ProcessingFailed);
        assert!(!block.technical_description.contains("/srv/media"));
        assert!(block.messages.len() <= 3);

        let missing = PoolError::SessionNotFound("S2".to_string());
        let block = ErrorBlock::from_error(&missing);
        assert_eq!(block.code, ErrorCode::SessionDoesNotExist);
        assert!(block.technical_description.contains("S2"));
    }

    #[test]
    fn test_into_result() {
        let request = RequestContainer::new(&app(), CommandId::MediaFileRead);
        let mut response = ResponseContainer::for_request(&request, &app());
        response.set_property("Exists", "true");
        assert!(response.clone().into_result().is_ok());

        response.set_error(&PoolError::SessionNotFound("S1".to_string()));
        assert!(response.properties.is_empty());
        match response.into_result() {
            Err(PoolError::Remote { code, .. }) => assert_eq!(code, ErrorCode::SessionDoesNotExist),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
