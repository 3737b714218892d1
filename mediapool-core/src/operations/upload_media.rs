use crate::pool::MediaPool;
use crate::storage::{MediaFileRecord, MediaStore, naming, verify_hash};
use crate::{MediaResourceDescriptor, PoolError, Result};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone)]
pub struct UploadMediaOperation {
    store: Arc<MediaStore>,
    pool: Option<Arc<MediaPool>>,
}

#[derive(Debug, Clone)]
pub struct UploadMediaOperationRequest {
    pub descriptor: Arc<MediaResourceDescriptor>,
    pub data_identifier: String,
    pub file_type: String,
    pub hash_value: String,
    pub content: Bytes,
    pub pool_request: bool,
    /// Name parts of the pending file.
    pub codename: String,
    pub thread: String,
}

#[derive(Debug, Clone)]
pub enum UploadMediaOperationOutcome {
    Stored(MediaFileRecord),
    /// The canonical file already holds this content.
    Unchanged(MediaFileRecord),
}

impl UploadMediaOperationOutcome {
    pub fn record(&self) -> &MediaFileRecord {
        match self {
            UploadMediaOperationOutcome::Stored(record)
            | UploadMediaOperationOutcome::Unchanged(record) => record,
        }
    }
}

impl UploadMediaOperation {
    pub fn new(store: Arc<MediaStore>, pool: Option<Arc<MediaPool>>) -> Self {
        Self { store, pool }
    }

    pub async fn run(&self, request: UploadMediaOperationRequest) -> Result<UploadMediaOperationOutcome> {
        let UploadMediaOperationRequest {
            descriptor,
            data_identifier,
            file_type,
            hash_value,
            content,
            pool_request,
            codename,
            thread,
        } = request;

        naming::validate_data_identifier(&data_identifier)?;
        let file_type = file_type.to_ascii_lowercase();
        if !descriptor.supports_file_type(&file_type) {
            return Err(PoolError::InvalidRequest(format!(
                "file type {} is not supported by {}",
                file_type,
                descriptor.identifier()
            )));
        }
        if content.is_empty() {
            return Err(PoolError::InvalidRequest("content is empty".to_string()));
        }
        verify_hash(&content, &hash_value)?;

        if let Some(existing) = self.store.lookup(&descriptor, &data_identifier).await? {
            if existing.matches(&file_type, &hash_value) {
                tracing::debug!(
                    "Upload of {}:{} matches {}, nothing to do",
                    descriptor.identifier(),
                    data_identifier,
                    existing.file_name
                );
                return Ok(UploadMediaOperationOutcome::Unchanged(existing));
            }
        }

        let pending = self
            .store
            .write_pending(&codename, &thread, &file_type, &content)
            .await?;
        let pending_name = pending
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string);

        let record = match self
            .store
            .promote(&pending, &descriptor, &data_identifier, Some(&hash_value))
            .await
        {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(
                    "Promotion of {:?} for {}:{} failed, pending file kept: {}",
                    pending,
                    descriptor.identifier(),
                    data_identifier,
                    error
                );
                return Err(error);
            }
        };

        if !pool_request {
            if let Some(pool) = &self.pool {
                // Overflow has already been reported; the local copy stands.
                if let Err(error) = pool
                    .replicate_upload(&descriptor, &data_identifier, pending_name.as_deref())
                    .await
                {
                    tracing::warn!(
                        "Replication of {}:{} not queued: {}",
                        descriptor.identifier(),
                        data_identifier,
                        error
                    );
                }
            }
        }

        Ok(UploadMediaOperationOutcome::Stored(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MediaEncoder, compute_hash};
    use tempfile::TempDir;

    fn operation(dir: &TempDir) -> (UploadMediaOperation, Arc<MediaStore>) {
        let store = Arc::new(
            MediaStore::new(
                dir.path().to_path_buf(),
                "mediapool",
                Arc::new(MediaEncoder::disabled()),
                false,
            )
            .unwrap(),
        );
        (UploadMediaOperation::new(store.clone(), None), store)
    }

    fn request(content: &'static [u8], hash: String) -> UploadMediaOperationRequest {
        UploadMediaOperationRequest {
            descriptor: Arc::new(MediaResourceDescriptor::new(
                "Apartment",
                "Room",
                "room",
                &["jpg"],
            )),
            data_identifier: "1001".to_string(),
            file_type: "JPG".to_string(),
            hash_value: hash,
            content: Bytes::from_static(content),
            pool_request: false,
            codename: "upload".to_string(),
            thread: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_identical_upload_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let (operation, store) = operation(&dir);
        let hash = compute_hash(b"photo");

        let first = operation.run(request(b"photo", hash.clone())).await.unwrap();
        assert!(matches!(first, UploadMediaOperationOutcome::Stored(_)));

        let second = operation.run(request(b"photo", hash.clone())).await.unwrap();
        assert!(matches!(second, UploadMediaOperationOutcome::Unchanged(_)));
        assert_eq!(second.record().file_name, first.record().file_name);

        let files = std::fs::read_dir(store.resource_dir(&request(b"photo", hash).descriptor))
            .unwrap()
            .count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let (operation, store) = operation(&dir);
        let error = operation
            .run(request(b"photo", compute_hash(b"other")))
            .await
            .unwrap_err();
        assert!(matches!(error, PoolError::HashMismatch { .. }));
        assert_eq!(std::fs::read_dir(store.pending_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_type_rejected() {
        let dir = TempDir::new().unwrap();
        let (operation, _) = operation(&dir);
        let mut request = request(b"photo", compute_hash(b"photo"));
        request.file_type = "exe".to_string();
        assert!(matches!(
            operation.run(request).await,
            Err(PoolError::InvalidRequest(_))
        ));
    }
}
