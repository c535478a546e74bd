use thiserror::Error;

/// Outcome classification for anything pushed to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("backend unreachable: {0}")]
    Connectivity(String),

    #[error("backend returned status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl UploadError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, UploadError::Connectivity(_))
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            UploadError::Connectivity(e.to_string())
        } else if let Some(status) = e.status() {
            UploadError::Server {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            UploadError::Rejected(e.to_string())
        }
    }
}
