//! File naming for canonical and pending media files.
//!
//! Canonical: `${application}-${alias}-${identifier}-${encodingkey}-${hashvalue}.${filetype}`
//! Pending:   `${timestamp}-${application}-${codename}-[${thread}].${filetype}`
//!
//! The canonical name is the only persisted metadata, so parsing has to be
//! stable: the type, hash and key are always taken from the right end of the
//! name, which keeps identifiers containing `-` or `.` unambiguous.

use crate::{PoolError, Result};
use chrono::{DateTime, Utc};

pub const PENDING_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const MAX_IDENTIFIER_LEN: usize = 128;

/// Metadata carried by a canonical file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFileMetadata {
    pub file_type: String,
    pub hash_value: String,
    pub encoding_key: u32,
}

pub fn build_file_name(
    application: &str,
    alias: &str,
    identifier: &str,
    encoding_key: u32,
    hash_value: &str,
    file_type: &str,
) -> String {
    format!(
        "{}-{}",
        key_part(application, alias, identifier),
        metadata_part(encoding_key, hash_value, file_type)
    )
}

/// The part of a canonical name shared by every file of one
/// `(descriptor, dataIdentifier)` key.
pub fn key_part(application: &str, alias: &str, identifier: &str) -> String {
    format!("{}-{}-{}", application, alias, identifier)
}

fn metadata_part(encoding_key: u32, hash_value: &str, file_type: &str) -> String {
    format!("{}-{}.{}", encoding_key, hash_value, file_type)
}

/// Extracts file type, hash value and encoding key from a canonical name.
pub fn extract_metadata(file_name: &str) -> Result<MediaFileMetadata> {
    split_file_name(file_name)
        .map(|(_, metadata)| metadata)
        .ok_or_else(|| PoolError::InvalidRequest(format!("not a media file name: {}", file_name)))
}

/// Splits a canonical name into its key part and metadata.
pub fn split_file_name(file_name: &str) -> Option<(&str, MediaFileMetadata)> {
    let (stem, file_type) = file_name.rsplit_once('.')?;
    if !is_valid_file_type(file_type) {
        return None;
    }

    let (rest, hash_value) = stem.rsplit_once('-')?;
    if !is_valid_hash(hash_value) {
        return None;
    }

    let (key, encoding_key) = rest.rsplit_once('-')?;
    if encoding_key.is_empty() || !encoding_key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let encoding_key = encoding_key.parse::<u32>().ok()?;

    if key.is_empty() {
        return None;
    }

    Some((
        key,
        MediaFileMetadata {
            file_type: file_type.to_string(),
            hash_value: hash_value.to_string(),
            encoding_key,
        },
    ))
}

pub fn pending_file_name(
    timestamp: DateTime<Utc>,
    application: &str,
    codename: &str,
    thread: &str,
    file_type: &str,
) -> String {
    format!(
        "{}-{}-{}-[{}].{}",
        timestamp.format(PENDING_TIMESTAMP_FORMAT),
        application,
        codename,
        thread,
        file_type
    )
}

/// File type of a pending file name, taken from its extension.
pub fn pending_file_type(file_name: &str) -> Option<&str> {
    let (_, file_type) = file_name.rsplit_once('.')?;
    is_valid_file_type(file_type).then_some(file_type)
}

pub fn is_valid_file_type(file_type: &str) -> bool {
    !file_type.is_empty() && file_type.bytes().all(|b| b.is_ascii_alphanumeric())
}

pub fn is_valid_hash(hash_value: &str) -> bool {
    !hash_value.is_empty() && hash_value.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn validate_data_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(PoolError::InvalidRequest(
            "data identifier cannot be empty".to_string(),
        ));
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(PoolError::InvalidRequest(format!(
            "data identifier longer than {} characters",
            MAX_IDENTIFIER_LEN
        )));
    }
    if identifier.starts_with('.')
        || identifier.contains(['/', '\\'])
        || identifier.chars().any(char::is_control)
    {
        return Err(PoolError::InvalidRequest(format!(
            "invalid data identifier: {}",
            identifier
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_name_round_trip() {
        let cases = [
            ("jpg", "9f86d081884c7d65", 0u32),
            ("png", "ABCDEF0123", 7),
            ("pdf", "0", 4_294_967_295),
        ];

        for (file_type, hash_value, encoding_key) in cases {
            let name = build_file_name("mediapool", "room", "1001", encoding_key, hash_value, file_type);
            let metadata = extract_metadata(&name).unwrap();
            assert_eq!(
                metadata,
                MediaFileMetadata {
                    file_type: file_type.to_string(),
                    hash_value: hash_value.to_string(),
                    encoding_key,
                }
            );
        }
    }

    #[test]
    fn test_identifier_with_separators() {
        let name = build_file_name("mediapool", "room", "10-01.a", 2, "abc123", "jpg");
        assert_eq!(name, "mediapool-room-10-01.a-2-abc123.jpg");

        let (key, metadata) = split_file_name(&name).unwrap();
        assert_eq!(key, key_part("mediapool", "room", "10-01.a"));
        assert_ne!(key, key_part("mediapool", "room", "10"));
        assert_eq!(metadata.encoding_key, 2);
    }

    #[test]
    fn test_rejects_foreign_names() {
        assert!(extract_metadata("notes.txt").is_err());
        assert!(extract_metadata("mediapool-room-1-x-abc.jpg").is_err());
        assert!(extract_metadata("mediapool-room-1-0-xyz.jpg").is_err());
        assert!(extract_metadata("mediapool-room-1-0-abc.tmp~").is_err());
        assert!(extract_metadata("-0-abc.jpg").is_err());
    }

    #[test]
    fn test_pending_file_name() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let name = pending_file_name(timestamp, "mediapool", "MediaFileUpload", "7", "jpg");
        assert_eq!(name, "20240309140507000-mediapool-MediaFileUpload-[7].jpg");
        assert_eq!(pending_file_type(&name), Some("jpg"));
    }

    #[test]
    fn test_validate_data_identifier() {
        assert!(validate_data_identifier("1001").is_ok());
        assert!(validate_data_identifier("a-b.c").is_ok());
        assert!(validate_data_identifier("").is_err());
        assert!(validate_data_identifier("../etc").is_err());
        assert!(validate_data_identifier("a/b").is_err());
        assert!(validate_data_identifier(&"x".repeat(200)).is_err());
    }
}
