use crate::pool::MediaPool;
use crate::storage::{MediaStore, validate_data_identifier};
use crate::{MediaResourceDescriptor, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct MediaInfoOperation {
    store: Arc<MediaStore>,
    pool: Option<Arc<MediaPool>>,
}

#[derive(Debug, Clone)]
pub struct MediaInfoOperationRequest {
    pub descriptor: Arc<MediaResourceDescriptor>,
    pub data_identifier: String,
    pub pool_request: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfoOperationResult {
    pub file_type: String,
    pub hash_value: String,
    pub encoding_key: u32,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
    /// Pool server that answered, `None` for the local repository.
    pub server_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaInfoOperationOutcome {
    Found(MediaInfoOperationResult),
    NotFound,
}

impl MediaInfoOperation {
    pub fn new(store: Arc<MediaStore>, pool: Option<Arc<MediaPool>>) -> Self {
        Self { store, pool }
    }

    pub async fn run(&self, request: MediaInfoOperationRequest) -> Result<MediaInfoOperationOutcome> {
        validate_data_identifier(&request.data_identifier)?;

        if let Some(record) = self
            .store
            .lookup(&request.descriptor, &request.data_identifier)
            .await?
        {
            return Ok(MediaInfoOperationOutcome::Found(MediaInfoOperationResult {
                file_type: record.file_type,
                hash_value: record.hash_value,
                encoding_key: record.encoding_key,
                file_size: record.stored_size,
                last_modified: record.last_modified,
                server_number: None,
            }));
        }

        let pool = match &self.pool {
            Some(pool) if !request.pool_request => pool,
            _ => return Ok(MediaInfoOperationOutcome::NotFound),
        };

        let info = pool
            .info_from_pool(&request.descriptor, &request.data_identifier)
            .await?;
        Ok(match info {
            Some(info) => MediaInfoOperationOutcome::Found(MediaInfoOperationResult {
                file_type: info.file_type,
                hash_value: info.hash_value,
                encoding_key: info.encoding_key,
                file_size: info.file_size,
                last_modified: info.last_modified,
                server_number: Some(info.server_number),
            }),
            None => MediaInfoOperationOutcome::NotFound,
        })
    }
}
