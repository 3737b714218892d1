//! Storage modules for Mediapool
//!
//! Provides the file naming scheme, server side encoding and the local
//! media repository.

pub mod encoding;
pub mod media_store;
pub mod naming;

pub use encoding::MediaEncoder;
pub use media_store::{MediaFileRecord, MediaStore, compute_hash, verify_hash};
pub use naming::{
    MediaFileMetadata, build_file_name, extract_metadata, pending_file_name,
    validate_data_identifier,
};
