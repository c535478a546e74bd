use super::error::UploadError;
use crate::config::types::BackendConfig;
use crate::sequence::{SampleNetwork, SamplePayload};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("backend returned error status {status}: {message}")]
    BackendError { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl From<ApiError> for UploadError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::HttpError(e) => UploadError::from(e),
            ApiError::BackendError { status, message } => UploadError::Server { status, message },
        }
    }
}

/// HTTP client for the upload backend
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone().filter(|t| !t.is_empty()),
            client,
        })
    }

    /// Send one device telemetry record
    pub async fn send_device_data<T: Serialize + ?Sized>(&self, record: &T) -> Result<()> {
        let body = json!({ "phone_event": { "data": record } });
        self.post("v1/phone_events", &body).await
    }

    /// Send the samples of one health category
    pub async fn upload_health_data(&self, payload: &SamplePayload, source: &str) -> Result<()> {
        let body = json!({
            "integration_data": {
                "data": payload.to_json(),
                "source": source,
            }
        });
        self.post("v1/integration_datas", &body).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(ApiError::BackendError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl SampleNetwork for ApiClient {
    async fn upload_health_data(
        &self,
        payload: &SamplePayload,
        source: &str,
    ) -> std::result::Result<(), UploadError> {
        ApiClient::upload_health_data(self, payload, source)
            .await
            .map_err(UploadError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::HealthDataType;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(base_url: &str, token: Option<&str>) -> BackendConfig {
        BackendConfig {
            base_url: base_url.to_string(),
            access_token: token.map(str::to_string),
            request_timeout: Duration::from_secs(5),
            source: "test".to_string(),
        }
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                line.to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
            })
            .unwrap_or(0);
        buf.len() >= header_end + 4 + content_length
    }

    /// Accept one connection, answer with `response` and hand back the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..n]);
                if request_complete(&received) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&received).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_device_data_is_posted_with_bearer_token() {
        let (url, server) =
            serve_once("HTTP/1.1 201 Created\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let client = ApiClient::new(&config(&format!("{}/", url), Some("secret"))).unwrap();

        client
            .send_device_data(&json!({ "battery_level": 0.5 }))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/phone_events "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains("\"phone_event\""));
        assert!(request.contains("\"battery_level\":0.5"));
    }

    #[tokio::test]
    async fn test_health_payload_shape() {
        let (url, server) =
            serve_once("HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let client = ApiClient::new(&config(&url, None)).unwrap();
        let payload = SamplePayload {
            category: HealthDataType::StepCount,
            samples: vec![json!({ "value": 12 })],
        };

        client.upload_health_data(&payload, "watch").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/integration_datas "));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(
            body,
            json!({
                "integration_data": {
                    "data": { "stepCount": [{ "value": 12 }] },
                    "source": "watch",
                }
            })
        );
    }

    #[tokio::test]
    async fn test_error_status_maps_to_server_error() {
        let (url, _server) = serve_once(
            "HTTP/1.1 422 Unprocessable Entity\r\ncontent-length: 3\r\nconnection: close\r\n\r\nbad",
        )
        .await;
        let client = ApiClient::new(&config(&url, None)).unwrap();

        let err = client.send_device_data(&json!({})).await.unwrap_err();
        assert_eq!(
            UploadError::from(err),
            UploadError::Server {
                status: 422,
                message: "bad".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_connectivity_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ApiClient::new(&config(&format!("http://{}", addr), None)).unwrap();
        let err = client.send_device_data(&json!({})).await.unwrap_err();
        assert!(UploadError::from(err).is_connectivity());
    }
}
