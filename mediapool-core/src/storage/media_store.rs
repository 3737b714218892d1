use super::encoding::MediaEncoder;
use super::naming::{self, PENDING_TIMESTAMP_FORMAT};
use crate::{MediaResourceDescriptor, PoolError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use ulid::Ulid;

const PENDING_DIR: &str = "pending";
const DELETED_DIR: &str = "deleted";

/// The current canonical file for one `(descriptor, dataIdentifier)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFileRecord {
    pub data_identifier: String,
    pub file_name: String,
    pub path: PathBuf,
    pub file_type: String,
    pub hash_value: String,
    pub encoding_key: u32,
    pub last_modified: DateTime<Utc>,
    /// Size on disk, including the encoding envelope if any.
    pub stored_size: u64,
}

impl MediaFileRecord {
    /// True when this record holds content of the given type and hash.
    pub fn matches(&self, file_type: &str, hash_value: &str) -> bool {
        self.file_type.eq_ignore_ascii_case(file_type)
            && self.hash_value.eq_ignore_ascii_case(hash_value)
    }
}

/// Local media repository.
///
/// Layout below the base path:
/// - `{group}/{name}/` canonical files of one media resource
/// - `pending/` uploads awaiting promotion
/// - `deleted/{group}/{name}/` retired canonical files, when kept
pub struct MediaStore {
    base_path: PathBuf,
    application: String,
    encoder: Arc<MediaEncoder>,
    keep_deleted: bool,
    promote_lock: Mutex<()>,
}

impl MediaStore {
    pub fn new(
        base_path: PathBuf,
        application: impl Into<String>,
        encoder: Arc<MediaEncoder>,
        keep_deleted: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(base_path.join(PENDING_DIR))?;
        if keep_deleted {
            std::fs::create_dir_all(base_path.join(DELETED_DIR))?;
        }

        Ok(Self {
            base_path,
            application: application.into(),
            encoder,
            keep_deleted,
            promote_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.base_path.join(PENDING_DIR)
    }

    pub fn resource_dir(&self, descriptor: &MediaResourceDescriptor) -> PathBuf {
        self.base_path.join(&descriptor.group).join(&descriptor.name)
    }

    fn deleted_dir(&self, descriptor: &MediaResourceDescriptor) -> PathBuf {
        self.base_path
            .join(DELETED_DIR)
            .join(&descriptor.group)
            .join(&descriptor.name)
    }

    /// Newest canonical file for the key, or `None` when there is none.
    pub async fn lookup(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
    ) -> Result<Option<MediaFileRecord>> {
        let candidates = self.scan_key(descriptor, data_identifier).await?;

        Ok(candidates
            .into_iter()
            .max_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.file_name.cmp(&b.file_name))
            }))
    }

    /// True when the canonical file exists with the given type and hash.
    /// A different hash is not an error, it simply does not exist.
    pub async fn exists(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        file_type: &str,
        hash_value: &str,
    ) -> Result<bool> {
        Ok(self
            .lookup(descriptor, data_identifier)
            .await?
            .is_some_and(|record| record.matches(file_type, hash_value)))
    }

    /// Writes content to a fresh pending file and returns its path.
    ///
    /// Every call gets its own file, even for the same codename and thread
    /// within one millisecond. Nothing is left behind when the write fails.
    pub async fn write_pending(
        &self,
        codename: &str,
        thread: &str,
        file_type: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        if !naming::is_valid_file_type(file_type) {
            return Err(PoolError::InvalidRequest(format!(
                "invalid file type: {}",
                file_type
            )));
        }

        let name = naming::pending_file_name(
            Utc::now(),
            &self.application,
            codename,
            &format!("{}-{}", thread, Ulid::new()),
            &file_type.to_ascii_lowercase(),
        );
        let path = self.pending_dir().join(name);

        write_new_file(&path, data).await?;

        tracing::debug!("Wrote pending file {:?} ({} bytes)", path, data.len());
        Ok(path)
    }

    /// Turns a pending file into the canonical file of the key.
    ///
    /// When `expected_hash` is given the pending content must hash to it.
    /// On success the pending file is removed and every previous canonical
    /// file of the key is retired. On failure the pending file is left in
    /// place and the previous canonical file stays current.
    pub async fn promote(
        &self,
        pending_path: &Path,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        expected_hash: Option<&str>,
    ) -> Result<MediaFileRecord> {
        naming::validate_data_identifier(data_identifier)?;

        let pending_name = pending_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                PoolError::Processing(format!("invalid pending file path {:?}", pending_path))
            })?;
        let file_type = naming::pending_file_type(pending_name)
            .ok_or_else(|| {
                PoolError::InvalidRequest(format!("pending file {} has no file type", pending_name))
            })?
            .to_ascii_lowercase();

        if !descriptor.supports_file_type(&file_type) {
            return Err(PoolError::InvalidRequest(format!(
                "file type {} is not supported by {}",
                file_type,
                descriptor.identifier()
            )));
        }

        let metadata = fs::metadata(pending_path).await.map_err(|error| {
            PoolError::Processing(format!("pending file {:?} unreadable: {}", pending_path, error))
        })?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(PoolError::Processing(format!(
                "pending file {:?} is empty",
                pending_path
            )));
        }

        let plain = fs::read(pending_path).await?;
        if let Some(expected) = expected_hash {
            verify_hash(&plain, expected)?;
        }
        let hash_value = compute_hash(&plain);
        let encoding_key = self.encoder.key_for(descriptor.server_encoding);
        let stored = self.encoder.encode(encoding_key, &plain)?;

        let file_name = naming::build_file_name(
            &self.application,
            &descriptor.alias,
            data_identifier,
            encoding_key,
            &hash_value,
            &file_type,
        );
        let resource_dir = self.resource_dir(descriptor);
        let canonical_path = resource_dir.join(&file_name);

        let _guard = self.promote_lock.lock().await;

        fs::create_dir_all(&resource_dir).await?;

        let previous: Vec<MediaFileRecord> = self
            .scan_key(descriptor, data_identifier)
            .await?
            .into_iter()
            .filter(|record| record.file_name != file_name)
            .collect();
        let replaces_itself = fs::try_exists(&canonical_path).await?;

        // Write to temporary file first, then rename for atomicity
        let temp_path = resource_dir.join(format!(".{}.tmp", file_name));
        let _ = fs::remove_file(&temp_path).await;
        write_new_file(&temp_path, &stored).await?;
        if let Err(error) = fs::rename(&temp_path, &canonical_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error.into());
        }

        for record in &previous {
            if let Err(error) = self.retire(descriptor, record).await {
                if !replaces_itself {
                    if let Err(rollback) = fs::remove_file(&canonical_path).await {
                        tracing::error!(
                            "Could not roll back {:?} after failed retirement: {}",
                            canonical_path,
                            rollback
                        );
                    }
                }
                tracing::warn!(
                    "Retiring {} failed, {} not promoted: {}",
                    record.file_name,
                    file_name,
                    error
                );
                return Err(error);
            }
        }

        if let Err(error) = fs::remove_file(pending_path).await {
            tracing::warn!(
                "Promoted {} but could not remove pending file {:?}: {}",
                file_name,
                pending_path,
                error
            );
        }

        tracing::info!(
            "Promoted {} for {}:{} (encoding key {})",
            file_name,
            descriptor.identifier(),
            data_identifier,
            encoding_key
        );

        let metadata = fs::metadata(&canonical_path).await?;
        Ok(MediaFileRecord {
            data_identifier: data_identifier.to_string(),
            file_name,
            path: canonical_path,
            file_type,
            hash_value,
            encoding_key,
            last_modified: modified_at(&metadata),
            stored_size: metadata.len(),
        })
    }

    /// Writes content as a pending file and promotes it in one go.
    pub async fn store(
        &self,
        codename: &str,
        thread: &str,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
        file_type: &str,
        data: &[u8],
    ) -> Result<MediaFileRecord> {
        let expected_hash = compute_hash(data);
        let pending = self.write_pending(codename, thread, file_type, data).await?;
        match self
            .promote(&pending, descriptor, data_identifier, Some(&expected_hash))
            .await
        {
            Ok(record) => Ok(record),
            Err(error) => {
                tracing::error!(
                    "Promotion of {:?} for {}:{} failed, pending file kept: {}",
                    pending,
                    descriptor.identifier(),
                    data_identifier,
                    error
                );
                Err(error)
            }
        }
    }

    /// Reads and decodes the content of a canonical file.
    pub async fn read(&self, record: &MediaFileRecord) -> Result<Bytes> {
        let stored = fs::read(&record.path).await?;
        let plain = self.encoder.decode(record.encoding_key, &stored)?;
        verify_hash(&plain, &record.hash_value)?;
        Ok(Bytes::from(plain))
    }

    async fn scan_key(
        &self,
        descriptor: &MediaResourceDescriptor,
        data_identifier: &str,
    ) -> Result<Vec<MediaFileRecord>> {
        let resource_dir = self.resource_dir(descriptor);
        if !fs::try_exists(&resource_dir).await? {
            return Ok(Vec::new());
        }

        let wanted = naming::key_part(&self.application, &descriptor.alias, data_identifier);
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&resource_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let Some((key, metadata)) = naming::split_file_name(&name) else {
                continue;
            };
            if key != wanted {
                continue;
            }

            let file_meta = entry.metadata().await?;
            if !file_meta.is_file() {
                continue;
            }

            records.push(MediaFileRecord {
                data_identifier: data_identifier.to_string(),
                path: entry.path(),
                file_name: name.clone(),
                file_type: metadata.file_type,
                hash_value: metadata.hash_value,
                encoding_key: metadata.encoding_key,
                last_modified: modified_at(&file_meta),
                stored_size: file_meta.len(),
            });
        }

        Ok(records)
    }

    async fn retire(
        &self,
        descriptor: &MediaResourceDescriptor,
        record: &MediaFileRecord,
    ) -> Result<()> {
        if self.keep_deleted {
            let deleted_dir = self.deleted_dir(descriptor);
            fs::create_dir_all(&deleted_dir).await?;
            let target = deleted_dir.join(format!(
                "{}-{}",
                Utc::now().format(PENDING_TIMESTAMP_FORMAT),
                record.file_name
            ));
            fs::rename(&record.path, &target).await?;
            tracing::debug!("Moved retired file {} to {:?}", record.file_name, target);
        } else {
            fs::remove_file(&record.path).await?;
            tracing::debug!("Removed retired file {}", record.file_name);
        }
        Ok(())
    }
}

/// Creates `path`, which must not exist yet, and writes `data` to it.
/// A partially written file is removed again.
async fn write_new_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let written = async {
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(error) = written {
        if let Err(cleanup) = fs::remove_file(path).await {
            tracing::warn!("Could not remove partial file {:?}: {}", path, cleanup);
        }
        return Err(error.into());
    }
    Ok(())
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if !actual_hash.eq_ignore_ascii_case(expected_hash) {
        return Err(PoolError::HashMismatch {
            expected: expected_hash.to_string(),
            actual: actual_hash,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncodingConfig, EncodingKey};

    fn descriptor() -> MediaResourceDescriptor {
        MediaResourceDescriptor::new("Apartment", "Room", "room", &["jpg", "png"])
    }

    fn store(dir: &Path, keep_deleted: bool) -> MediaStore {
        MediaStore::new(
            dir.to_path_buf(),
            "mediapool",
            Arc::new(MediaEncoder::disabled()),
            keep_deleted,
        )
        .unwrap()
    }

    fn canonical_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), false);

        assert!(store.lookup(&descriptor(), "1001").await.unwrap().is_none());
        assert!(!store.exists(&descriptor(), "1001", "jpg", "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_and_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), false);
        let data = b"photo content";

        let pending = store
            .write_pending("MediaFileUpload", "1", "jpg", data)
            .await
            .unwrap();
        let record = store
            .promote(&pending, &descriptor(), "1001", Some(&compute_hash(data)))
            .await.unwrap();

        assert!(!pending.exists());
        assert_eq!(record.hash_value, compute_hash(data));
        assert_eq!(record.encoding_key, 0);
        assert_eq!(
            record.file_name,
            format!("mediapool-room-1001-0-{}.jpg", compute_hash(data))
        );

        let found = store.lookup(&descriptor(), "1001").await.unwrap().unwrap();
        assert_eq!(found.file_name, record.file_name);
        assert_eq!(store.read(&found).await.unwrap().as_ref(), data);
        assert!(store
            .exists(&descriptor(), "1001", "JPG", &record.hash_value)
            .await
            .unwrap());
        assert!(!store
            .exists(&descriptor(), "1001", "jpg", "0000")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_single_canonical_copy() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), false);
        let d = descriptor();

        for content in [&b"first"[..], b"second", b"second", b"third"] {
            store
                .store("MediaFileUpload", "1", &d, "1001", "jpg", content)
                .await
                .unwrap();
        }
        store
            .store("MediaFileUpload", "1", &d, "1002", "png", b"other key")
            .await
            .unwrap();

        let names = canonical_files(&store.resource_dir(&d));
        let for_1001: Vec<_> = names
            .iter()
            .filter(|name| name.starts_with("mediapool-room-1001-"))
            .collect();
        assert_eq!(for_1001.len(), 1);
        assert!(for_1001[0].contains(&compute_hash(b"third")));
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn test_retired_files_are_kept_when_configured() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), true);
        let d = descriptor();

        store.store("Upload", "1", &d, "7", "jpg", b"v1").await.unwrap();
        store.store("Upload", "1", &d, "7", "jpg", b"v2").await.unwrap();

        let deleted = canonical_files(&temp_dir.path().join("deleted/Apartment/Room"));
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with(&format!("mediapool-room-7-0-{}.jpg", compute_hash(b"v1"))));
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_pending() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), false);

        let empty = store.write_pending("Upload", "1", "jpg", b"").await.unwrap();
        assert!(store.promote(&empty, &descriptor(), "1", None).await.is_err());
        assert!(empty.exists());

        let unsupported = store.write_pending("Upload", "1", "gif", b"gif").await.unwrap();
        assert!(store.promote(&unsupported, &descriptor(), "1", None).await.is_err());
        assert!(unsupported.exists());
    }

    #[tokio::test]
    async fn test_pending_names_are_unique() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), false);

        let first = store.write_pending("pool", "2", "jpg", b"first").await.unwrap();
        let second = store.write_pending("pool", "2", "jpg", b"second").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_existing_file_is_never_overwritten() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("taken.jpg");
        std::fs::write(&path, b"original").unwrap();

        assert!(write_new_file(&path, b"replacement").await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_from_same_source() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(temp_dir.path(), false));
        let d = descriptor();

        for round in 0..50 {
            let mut handles = Vec::new();
            for identifier in ["1001", "1002"] {
                let store = store.clone();
                let d = d.clone();
                let content = format!("{} round {}", identifier, round).into_bytes();
                handles.push(tokio::spawn(async move {
                    let record = store
                        .store("pool", "2", &d, identifier, "jpg", &content)
                        .await
                        .unwrap();
                    (record, content)
                }));
            }

            for handle in handles {
                let (record, content) = handle.await.unwrap();
                assert_eq!(record.hash_value, compute_hash(&content));
                assert_eq!(store.read(&record).await.unwrap().as_ref(), content.as_slice());
            }
        }

        assert!(canonical_files(&store.pending_dir()).is_empty());
        assert_eq!(canonical_files(&store.resource_dir(&d)).len(), 2);
    }

    #[tokio::test]
    async fn test_promotion_rejects_unexpected_hash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), false);
        let d = descriptor();

        let pending = store.write_pending("pool", "2", "jpg", b"actual").await.unwrap();
        let result = store
            .promote(&pending, &d, "1001", Some(&compute_hash(b"announced")))
            .await;

        assert!(matches!(result, Err(PoolError::HashMismatch { .. })));
        assert!(pending.exists());
        assert!(store.lookup(&d, "1001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_retirement_keeps_previous_copy() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path(), true);
        let d = descriptor();

        let v1 = store.store("Upload", "1", &d, "7", "jpg", b"v1").await.unwrap();
        // A plain file where the retired files of the group should go.
        std::fs::write(temp_dir.path().join("deleted/Apartment"), b"").unwrap();

        assert!(store.store("Upload", "1", &d, "7", "jpg", b"v2").await.is_err());

        assert_eq!(canonical_files(&store.resource_dir(&d)), vec![v1.file_name.clone()]);
        let current = store.lookup(&d, "7").await.unwrap().unwrap();
        assert_eq!(current.hash_value, compute_hash(b"v1"));
        assert_eq!(store.read(&current).await.unwrap().as_ref(), b"v1");
    }

    #[tokio::test]
    async fn test_encoded_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let encoder = MediaEncoder::new(&EncodingConfig {
            enabled: true,
            key_number: 3,
            keys: EncodingKey::parse_list("3:secret").unwrap(),
        })
        .unwrap();
        let store = MediaStore::new(
            temp_dir.path().to_path_buf(),
            "mediapool",
            Arc::new(encoder),
            false,
        )
        .unwrap();
        let d = descriptor().with_server_encoding(true);

        let record = store.store("Upload", "1", &d, "9", "jpg", b"secret photo").await.unwrap();
        assert_eq!(record.encoding_key, 3);
        assert_eq!(record.hash_value, compute_hash(b"secret photo"));
        assert_ne!(std::fs::read(&record.path).unwrap(), b"secret photo");
        assert_eq!(store.read(&record).await.unwrap().as_ref(), b"secret photo");
    }

    #[test]
    fn test_compute_hash() {
        let data = b"hello world";
        let hash = compute_hash(data);
        assert_eq!(hash.len(), 64); // SHA256 hex string is 64 chars
        assert!(verify_hash(data, &hash.to_uppercase()).is_ok());
        assert!(verify_hash(b"other", &hash).is_err());
    }
}
