pub mod buffer;
pub mod timers;
pub mod uploader;

pub use buffer::Buffer;
pub use uploader::{BatchUploader, RecordProducer, UploadRequest, UploaderStatus};
