pub mod category;
pub mod coordinator;
pub mod sample_uploader;
pub mod source;

pub use category::{HealthDataType, UnknownCategory};
pub use coordinator::{
    ClearanceCheck, CoordinatorStatus, SequenceConfig, SequenceCoordinator, SequenceState,
};
pub use sample_uploader::{
    LogicalUploader, SampleNetwork, SamplePayload, SampleUploadError, SampleUploader,
};
pub use source::{JsonlSampleSource, SampleBatch, SampleSource, SourceError};
