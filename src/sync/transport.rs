//! Sync transport — HTTP client for device → backend communication.
//!
//! The worker only sees the [`SyncTransport`] trait, so tests and the
//! simulation binary plug in in-memory transports. The HTTP implementation
//! compresses batches with zstd and carries the checksum and priority
//! metadata end to end.

use super::types::{BatchAck, ConflictNotice, SyncBatch};
use async_trait::async_trait;
use std::time::Duration;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Server(u16),
    #[error("permanent rejection ({status}): {body}")]
    PermanentRejection { status: u16, body: String },
    /// Ack checksum did not match the transmitted batch: transport
    /// corruption or a backend bug. Always retried, never completed.
    #[error("integrity error: ack checksum {got} does not match batch {expected}")]
    Integrity { expected: String, got: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compression(String),
}

impl TransportError {
    /// Permanent failures move items to `Rejected`; everything else drives
    /// retry with backoff.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::PermanentRejection { .. })
    }
}

/// Backend transport used by the sync worker.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Transmit one batch. The returned ack carries the backend-recomputed
    /// batch checksum; the caller compares before completing any item.
    async fn send_batch(&self, batch: &SyncBatch) -> Result<BatchAck, TransportError>;

    /// Pull conflicts dispatch raised against this driver's queued entities.
    async fn poll_conflicts(&self, driver_id: &str) -> Result<Vec<ConflictNotice>, TransportError>;
}

/// HTTP transport against the fleet backend.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    hub_url: String,
    api_key: String,
    device_id: String,
}

impl HttpTransport {
    /// Create a transport with a bounded request timeout. Unbounded waits
    /// are not allowed anywhere on the sync path.
    pub fn new(
        hub_url: &str,
        api_key: &str,
        device_id: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::Http)?;
        Ok(Self {
            http,
            hub_url: hub_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send_batch(&self, batch: &SyncBatch) -> Result<BatchAck, TransportError> {
        let json = serde_json::to_vec(batch)?;
        let compressed = zstd::encode_all(json.as_slice(), 3)
            .map_err(|e| TransportError::Compression(e.to_string()))?;

        let resp = self
            .http
            .post(format!("{}/api/sync/batches", self.hub_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "zstd")
            .header("X-Device-ID", &self.device_id)
            .header("X-Batch-Priority", batch.priority.to_string())
            .header("X-Batch-Checksum", &batch.checksum)
            .body(compressed)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let body = resp.bytes().await?;
            let ack: BatchAck = serde_json::from_slice(&body)?;
            return Ok(ack);
        }

        // 408/429 are transient despite the 4xx class; everything else in
        // 4xx is a validation failure the backend will never accept
        if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::PermanentRejection {
                status: status.as_u16(),
                body,
            });
        }
        Err(TransportError::Server(status.as_u16()))
    }

    async fn poll_conflicts(&self, driver_id: &str) -> Result<Vec<ConflictNotice>, TransportError> {
        let resp = self
            .http
            .get(format!("{}/api/sync/conflicts", self.hub_url))
            .query(&[("driver_id", driver_id)])
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Device-ID", &self.device_id)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Server(status.as_u16()));
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        let permanent = TransportError::PermanentRejection {
            status: 422,
            body: "bad payload".to_string(),
        };
        assert!(permanent.is_permanent());
        assert!(!TransportError::Server(503).is_permanent());
        assert!(!TransportError::Compression("x".to_string()).is_permanent());
        // Integrity failures are always retried
        assert!(!TransportError::Integrity {
            expected: "a".to_string(),
            got: "b".to_string(),
        }
        .is_permanent());
    }
}
