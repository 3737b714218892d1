pub mod check_media;
pub mod media_info;
pub mod read_media;
pub mod upload_media;

pub use check_media::{
    CheckMediaOperation, CheckMediaOperationOutcome, CheckMediaOperationRequest,
};
pub use media_info::{
    MediaInfoOperation, MediaInfoOperationOutcome, MediaInfoOperationRequest,
    MediaInfoOperationResult,
};
pub use read_media::{
    ReadMediaOperation, ReadMediaOperationOutcome, ReadMediaOperationRequest,
    ReadMediaOperationResult,
};
pub use upload_media::{
    UploadMediaOperation, UploadMediaOperationOutcome, UploadMediaOperationRequest,
};
