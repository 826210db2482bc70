//! SSE transport for streaming backends.
//!
//! The invocation is POSTed with `Accept: text/event-stream`; the backend
//! streams Server-Sent Events and the transport resolves on the first frame
//! carrying a JSON-RPC response document. Frame parsing follows the SSE
//! wire format: `event:`/`data:` lines, blank line terminates a frame.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Semaphore;

use sark_core::errors::GatewayError;
use sark_core::model::ToolResult;

use crate::config::{BackendConfig, TransportKind};
use crate::transport::{parse_tool_response, tool_call_request, Transport};

pub struct SseTransport {
    backend: String,
    url: String,
    client: reqwest::Client,
    attempt_timeout: std::time::Duration,
    permits: Arc<Semaphore>,
    request_id: AtomicU64,
}

impl SseTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, GatewayError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| GatewayError::invalid_request("sse backend without url"))?;
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

    fn connection_error(&self, detail: impl Into<String>) -> GatewayError {
        GatewayError::TransportConnection {
            backend: self.backend.clone(),
            detail: detail.into(),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn invoke(
        &self,
        tool: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<ToolResult, GatewayError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.connection_error("transport shut down"))?;

        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = tool_call_request(id, tool, parameters);

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::TransportTimeout {
                        backend: self.backend.clone(),
                        timeout: self.attempt_timeout,
                    }
                } else {
                    self.connection_error(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.connection_error(format!("status {status}")));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| {
                if err.is_timeout() {
                    GatewayError::TransportTimeout {
                        backend: self.backend.clone(),
                        timeout: self.attempt_timeout,
                    }
                } else {
                    self.connection_error(err.to_string())
                }
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(frame_end) = find_frame_end(&buffer) {
                let frame: String = buffer.drain(..frame_end).collect();
                if let Some(event) = SseEvent::parse(&frame) {
                    if event.event == "ping" {
                        continue;
                    }
                    if let Ok(document) = serde_json::from_str::<Value>(&event.data) {
                        if document.get("result").is_some() || document.get("error").is_some() {
                            return parse_tool_response(&self.backend, &document);
                        }
                    }
                }
            }
        }

        Err(self.connection_error("stream ended without a response event"))
    }

    async fn shutdown(&self) {
        self.permits.close();
    }
}

/// One parsed SSE frame.
#[derive(Debug, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

impl SseEvent {
    fn parse(frame: &str) -> Option<Self> {
        let mut event = "message".to_string();
        let mut data_lines = Vec::new();
        for line in frame.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.trim_start().to_string());
            }
            // Comments (`:`) and other fields are ignored.
        }
        if data_lines.is_empty() {
            None
        } else {
            Some(Self {
                event,
                data: data_lines.join("\n"),
            })
        }
    }
}

/// Index just past the blank line that terminates the first complete frame.
fn find_frame_end(buffer: &str) -> Option<usize> {
    buffer
        .find("\n\n")
        .map(|idx| idx + 2)
        .or_else(|| buffer.find("\r\n\r\n").map(|idx| idx + 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_multiline_data() {
        let frame = "event: result\ndata: {\"a\":\ndata: 1}\n";
        let event = SseEvent::parse(frame).unwrap();
        assert_eq!(event.event, "result");
        assert_eq!(event.data, "{\"a\":\n1}");
    }

    #[test]
    fn comment_only_frames_yield_nothing() {
        assert!(SseEvent::parse(": keepalive\n").is_none());
    }

    #[test]
    fn frame_boundary_is_the_blank_line() {
        let buffer = "data: one\n\ndata: two\n\n";
        let end = find_frame_end(buffer).unwrap();
        assert_eq!(&buffer[..end], "data: one\n\n");
    }

    #[test]
    fn crlf_frames_are_recognized() {
        let buffer = "data: one\r\n\r\n";
        assert_eq!(find_frame_end(buffer), Some(buffer.len()));
    }
}
