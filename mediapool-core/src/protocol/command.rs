use crate::PoolError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    Handshake,
    CreateSession,
    MediaFileCheck,
    MediaFileInfo,
    MediaFileRead,
    MediaFileUpload,
}

impl CommandId {
    pub const ALL: [CommandId; 6] = [
        CommandId::Handshake,
        CommandId::CreateSession,
        CommandId::MediaFileCheck,
        CommandId::MediaFileInfo,
        CommandId::MediaFileRead,
        CommandId::MediaFileUpload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandId::Handshake => "Handshake",
            CommandId::CreateSession => "CreateSession",
            CommandId::MediaFileCheck => "MediaFileCheck",
            CommandId::MediaFileInfo => "MediaFileInfo",
            CommandId::MediaFileRead => "MediaFileRead",
            CommandId::MediaFileUpload => "MediaFileUpload",
        }
    }

    /// Commands that may run without an established session.
    pub fn requires_session(&self) -> bool {
        !matches!(self, CommandId::Handshake | CommandId::CreateSession)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandId {
    type Err = PoolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        CommandId::ALL
            .into_iter()
            .find(|command| command.as_str() == value)
            .ok_or_else(|| PoolError::UnknownCommand(value.to_string()))
    }
}

/// Property names of the request/response property bag.
pub mod props {
    pub const CLIENT_PUBLIC_KEY: &str = "ClientPublicKey";
    pub const SERVER_PUBLIC_KEY: &str = "ServerPublicKey";
    pub const SESSION_CREATED: &str = "SessionCreated";
    pub const MEDIA_RESOURCE_IDENTIFIER: &str = "MediaResourceIdentifier";
    pub const DATA_IDENTIFIER: &str = "DataIdentifier";
    pub const FILE_TYPE: &str = "FileType";
    pub const HASH_VALUE: &str = "HashValue";
    pub const ENCODING_KEY_NUMBER: &str = "EncodingKeyNumber";
    pub const FILE_SIZE: &str = "FileSize";
    pub const LAST_MODIFIED: &str = "LastModified";
    pub const CONTENT: &str = "Content";
    pub const EXISTS: &str = "Exists";
    pub const STORED: &str = "Stored";
    pub const POOL_REQUEST: &str = "PoolRequest";
}
