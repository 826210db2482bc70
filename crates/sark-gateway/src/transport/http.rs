//! HTTP transport: JSON-RPC POST per invocation over a bounded pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use sark_core::errors::GatewayError;
use sark_core::model::ToolResult;

use crate::config::{BackendConfig, TransportKind};
use crate::transport::{parse_tool_response, tool_call_request, Transport};

pub struct HttpTransport {
    backend: String,
    url: String,
    client: reqwest::Client,
    attempt_timeout: std::time::Duration,
    // Bounds in-flight requests; reqwest's pool only bounds idle sockets.
    permits: Arc<Semaphore>,
    request_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, GatewayError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| GatewayError::invalid_request("http backend without url"))?;
        let client = reqwest::Client::builder()
            .timeout(config.attempt_timeout())
            .pool_max_idle_per_host(config.max_connections())
            .build()
            .map_err(|err| GatewayError::TransportConnection {
                backend: config.name.clone(),
                detail: err.to_string(),
            })?;
        Ok(Self {
            backend: config.name.clone(),
            url,
            client,
            attempt_timeout: config.attempt_timeout(),
            permits: Arc::new(Semaphore::new(config.max_connections())),
            request_id: AtomicU64::new(1),
        })
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::TransportTimeout {
                backend: self.backend.clone(),
                timeout: self.attempt_timeout,
            }
        } else {
            GatewayError::TransportConnection {
                backend: self.backend.clone(),
                detail: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn invoke(
        &self,
        tool: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<ToolResult, GatewayError> {
        // Closed semaphore only happens at shutdown.
        let _permit = self.permits.clone().acquire_owned().await.map_err(|_| {
            GatewayError::TransportConnection {
                backend: self.backend.clone(),
                detail: "transport shut down".to_string(),
            }
        })?;

        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = tool_call_request(id, tool, parameters);

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| self.map_reqwest_error(err))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(GatewayError::TransportConnection {
                backend: self.backend.clone(),
                detail: format!("status {status}"),
            });
        }
        if !status.is_success() {
            // 4xx other than 429: the backend rejected the call itself.
            return Err(GatewayError::BackendInvocation {
                backend: self.backend.clone(),
                code: Some(i64::from(status.as_u16())),
                message: format!("http status {status}"),
            });
        }

        let document: Value = response
            .json()
            .await
            .map_err(|err| self.map_reqwest_error(err))?;
        parse_tool_response(&self.backend, &document)
    }

    async fn shutdown(&self) {
        self.permits.close();
    }
}
