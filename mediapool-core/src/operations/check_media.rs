use crate::pool::{MediaPool, validate_check_input};
use crate::storage::MediaStore;
use crate::{MediaResourceDescriptor, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct CheckMediaOperation {
    store: Arc<MediaStore>,
    pool: Option<Arc<MediaPool>>,
}

#[derive(Debug, Clone)]
pub struct CheckMediaOperationRequest {
    pub descriptor: Arc<MediaResourceDescriptor>,
    pub data_identifier: String,
    pub file_type: String,
    pub hash_value: String,
    /// Set for requests issued by another pool member.
    pub pool_request: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMediaOperationOutcome {
    Exists,
    Missing,
    /// The main server lacks the content but a follower has it; a
    /// synchronizing command was queued.
    Synchronizing { source_number: u32 },
}

impl CheckMediaOperationOutcome {
    pub fn exists(&self) -> bool {
        matches!(self, CheckMediaOperationOutcome::Exists)
    }
}

impl CheckMediaOperation {
    pub fn new(store: Arc<MediaStore>, pool: Option<Arc<MediaPool>>) -> Self {
        Self { store, pool }
    }

    pub async fn run(&self, request: CheckMediaOperationRequest) -> Result<CheckMediaOperationOutcome> {
        let CheckMediaOperationRequest {
            descriptor,
            data_identifier,
            file_type,
            hash_value,
            pool_request,
        } = request;

        validate_check_input(&descriptor, &data_identifier, &file_type, &hash_value)?;

        let pool = match &self.pool {
            Some(pool) if pool.is_enabled() && !pool_request => pool,
            _ => {
                let exists = self
                    .store
                    .exists(&descriptor, &data_identifier, &file_type, &hash_value)
                    .await?;
                return Ok(local_outcome(exists));
            }
        };

        if !pool.is_main() {
            // Also queues a main server repair when main lags behind.
            let exists = pool
                .check(&descriptor, &data_identifier, &file_type, &hash_value)
                .await?;
            return Ok(local_outcome(exists));
        }

        // The main server answers from its own repository.
        if self
            .store
            .exists(&descriptor, &data_identifier, &file_type, &hash_value)
            .await?
        {
            return Ok(CheckMediaOperationOutcome::Exists);
        }

        let Some(source_number) = pool
            .find_on_followers(&descriptor, &data_identifier, &file_type, &hash_value)
            .await?
        else {
            return Ok(CheckMediaOperationOutcome::Missing);
        };

        tracing::info!(
            "Main server is behind on {}:{}, pool server {} has it",
            descriptor.identifier(),
            data_identifier,
            source_number
        );
        if let Err(error) = pool
            .schedule_synchronization(&descriptor, &data_identifier, source_number)
            .await
        {
            tracing::warn!(
                "Could not schedule synchronization of {}:{}: {}",
                descriptor.identifier(),
                data_identifier,
                error
            );
        }

        Ok(CheckMediaOperationOutcome::Synchronizing { source_number })
    }
}

fn local_outcome(exists: bool) -> CheckMediaOperationOutcome {
    if exists {
        CheckMediaOperationOutcome::Exists
    } else {
        CheckMediaOperationOutcome::Missing
    }
}
