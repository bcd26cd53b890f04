//! Remote commit sink that uploads encrypted batches to an ingest gateway.
//!
//! The gateway only ever sees ciphertext. Batches are posted as JSON with the
//! encrypted bytes base64 encoded.

use crate::store::{EncryptedBatch, SinkError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Gateway endpoint and credentials.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. `https://ingest.example.org`
    pub base_url: String,
    /// Bearer authentication token
    pub token: String,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Read `gateway.url` and `gateway.token` from a directory.
    pub fn from_dir(dir: &Path) -> Result<Self, GatewayError> {
        let url_path = dir.join("gateway.url");
        let token_path = dir.join("gateway.token");

        let url = std::fs::read_to_string(&url_path).map_err(|e| {
            GatewayError::Config(format!("failed to read gateway URL from {url_path:?}: {e}"))
        })?;
        let token = std::fs::read_to_string(&token_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read gateway token from {token_path:?}: {e}"
            ))
        })?;

        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(GatewayError::Config(format!("invalid gateway URL '{url}'")));
        }
        Ok(Self::new(url, token.trim()))
    }

    pub fn batches_url(&self) -> String {
        format!("{}/v1/batches", self.base_url)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway config error: {0}")]
    Config(String),
    #[error("gateway network error: {0}")]
    Network(String),
    #[error("gateway server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl From<GatewayError> for SinkError {
    fn from(err: GatewayError) -> Self {
        match err {
            // Client errors will not succeed on retry; everything else might.
            GatewayError::Server { status, message } if (400..500).contains(&status) => {
                SinkError::Rejected(format!("{status}: {message}"))
            }
            other => SinkError::Unavailable(other.to_string()),
        }
    }
}

/// Body posted for one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchUpload {
    pub batch_id: String,
    pub protocol_id: String,
    pub device_id: String,
    pub datum_count: usize,
    pub created_at: String,
    pub ciphertext: String,
    pub runtime_version: String,
}

impl BatchUpload {
    pub fn new(batch: &EncryptedBatch, device_id: &str) -> Self {
        Self {
            batch_id: batch.id.to_string(),
            protocol_id: batch.protocol_id.clone(),
            device_id: device_id.to_string(),
            datum_count: batch.datum_count,
            created_at: batch.created_at.to_rfc3339(),
            ciphertext: BASE64.encode(&batch.ciphertext),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(feature = "gateway")]
pub use client::{GatewayClient, GatewaySink};

#[cfg(feature = "gateway")]
mod client {
    use super::{BatchUpload, GatewayConfig, GatewayError};
    use crate::store::{CommitSink, EncryptedBatch, SinkError};
    use std::time::Duration;
    use tracing::debug;

    /// Async client for the ingest gateway.
    pub struct GatewayClient {
        config: GatewayConfig,
        client: reqwest::Client,
    }

    impl GatewayClient {
        pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| GatewayError::Config(format!("failed to create HTTP client: {e}")))?;
            Ok(Self { config, client })
        }

        pub async fn test_connection(&self) -> Result<bool, GatewayError> {
            let response = self
                .client
                .get(self.config.health_url())
                .send()
                .await
                .map_err(|e| GatewayError::Network(e.to_string()))?;
            Ok(response.status().is_success())
        }

        pub async fn upload(&self, upload: &BatchUpload) -> Result<(), GatewayError> {
            let response = self
                .client
                .post(self.config.batches_url())
                .bearer_auth(&self.config.token)
                .json(upload)
                .send()
                .await
                .map_err(|e| GatewayError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(GatewayError::Server {
                    status: status.as_u16(),
                    message,
                });
            }
            Ok(())
        }
    }

    /// Blocking commit sink backed by a current-thread runtime.
    ///
    /// Commit cycles run on the data store's worker thread, so blocking here
    /// only delays that store's next cycle.
    pub struct GatewaySink {
        inner: GatewayClient,
        runtime: tokio::runtime::Runtime,
        device_id: String,
    }

    impl GatewaySink {
        pub fn new(config: GatewayConfig, device_id: impl Into<String>) -> Result<Self, GatewayError> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| GatewayError::Config(format!("failed to create runtime: {e}")))?;

            Ok(Self {
                inner: GatewayClient::new(config)?,
                runtime,
                device_id: device_id.into(),
            })
        }

        pub fn test_connection(&self) -> Result<bool, GatewayError> {
            self.runtime.block_on(self.inner.test_connection())
        }
    }

    impl CommitSink for GatewaySink {
        fn name(&self) -> &str {
            "gateway"
        }

        fn commit(&self, batch: &EncryptedBatch) -> Result<(), SinkError> {
            let upload = BatchUpload::new(batch, &self.device_id);
            self.runtime.block_on(self.inner.upload(&upload))?;
            debug!(batch = %batch.id, datums = batch.datum_count, "batch uploaded");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_gateway_urls() {
        let config = GatewayConfig::new("https://ingest.example.org/", "token");
        assert_eq!(config.batches_url(), "https://ingest.example.org/v1/batches");
        assert_eq!(config.health_url(), "https://ingest.example.org/health");
    }

    #[test]
    fn test_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gateway.url"), "http://127.0.0.1:9000\n").unwrap();
        std::fs::write(dir.path().join("gateway.token"), "secret\n").unwrap();

        let config = GatewayConfig::from_dir(dir.path()).unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.token, "secret");

        std::fs::write(dir.path().join("gateway.url"), "ftp://nope").unwrap();
        assert!(GatewayConfig::from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_server_errors_map_to_sink_errors() {
        let rejected: SinkError = GatewayError::Server {
            status: 413,
            message: "too large".into(),
        }
        .into();
        assert!(matches!(rejected, SinkError::Rejected(_)));

        let unavailable: SinkError = GatewayError::Server {
            status: 503,
            message: "busy".into(),
        }
        .into();
        assert!(matches!(unavailable, SinkError::Unavailable(_)));
    }

    #[test]
    fn test_upload_encodes_ciphertext() {
        let batch = EncryptedBatch {
            id: Uuid::new_v4(),
            protocol_id: "p".into(),
            datum_count: 2,
            created_at: Utc::now(),
            ciphertext: vec![1, 2, 3],
        };
        let upload = BatchUpload::new(&batch, "device");
        assert_eq!(upload.ciphertext, "AQID");
        assert_eq!(upload.datum_count, 2);
    }
}
