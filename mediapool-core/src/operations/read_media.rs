use crate::pool::MediaPool;
use crate::storage::{MediaFileRecord, MediaStore, validate_data_identifier};
use crate::{MediaResourceDescriptor, Result};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone)]
pub struct ReadMediaOperation {
    store: Arc<MediaStore>,
    pool: Option<Arc<MediaPool>>,
}

#[derive(Debug, Clone)]
pub struct ReadMediaOperationRequest {
    pub descriptor: Arc<MediaResourceDescriptor>,
    pub data_identifier: String,
    pub pool_request: bool,
}

#[derive(Debug, Clone)]
pub struct ReadMediaOperationResult {
    pub record: MediaFileRecord,
    pub content: Bytes,
    /// True when the file was fetched from another pool member.
    pub fetched: bool,
}

#[derive(Debug, Clone)]
pub enum ReadMediaOperationOutcome {
    Found(ReadMediaOperationResult),
    NotFound,
}

impl ReadMediaOperation {
    pub fn new(store: Arc<MediaStore>, pool: Option<Arc<MediaPool>>) -> Self {
        Self { store, pool }
    }

    pub async fn run(&self, request: ReadMediaOperationRequest) -> Result<ReadMediaOperationOutcome> {
        let ReadMediaOperationRequest {
            descriptor,
            data_identifier,
            pool_request,
        } = request;

        validate_data_identifier(&data_identifier)?;

        if let Some(record) = self.store.lookup(&descriptor, &data_identifier).await? {
            let content = self.store.read(&record).await?;
            return Ok(ReadMediaOperationOutcome::Found(ReadMediaOperationResult {
                record,
                content,
                fetched: false,
            }));
        }

        if pool_request {
            return Ok(ReadMediaOperationOutcome::NotFound);
        }

        let Some(pool) = &self.pool else {
            return Ok(ReadMediaOperationOutcome::NotFound);
        };

        match pool.fetch_from_pool(&descriptor, &data_identifier).await? {
            Some(record) => {
                let content = self.store.read(&record).await?;
                Ok(ReadMediaOperationOutcome::Found(ReadMediaOperationResult {
                    record,
                    content,
                    fetched: true,
                }))
            }
            None => Ok(ReadMediaOperationOutcome::NotFound),
        }
    }
}
