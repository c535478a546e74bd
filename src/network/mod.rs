pub mod client;
pub mod error;

pub use client::{ApiClient, ApiError};
pub use error::UploadError;
