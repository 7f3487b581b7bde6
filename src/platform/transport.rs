//! HTTP transport abstraction
//!
//! The engine and the endpoint connector issue every request through
//! [`Transport`], so tests can substitute an in-memory server and host
//! integrations can reroute traffic without touching upload logic.

use crate::error::{ErrorCode, FcResult, FileChunkError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One field of a multipart form
#[derive(Debug, Clone)]
pub struct FormField {
    pub name: String,
    pub part: FormPart,
}

/// Multipart field payload
#[derive(Debug, Clone)]
pub enum FormPart {
    /// Plain text field, transmitted bit-exact
    Text(String),
    /// Binary field with a declared file name
    Bytes {
        file_name: String,
        content_type: Option<String>,
        data: Bytes,
    },
}

impl FormField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            part: FormPart::Text(value.into()),
        }
    }

    pub fn bytes(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: Option<String>,
        data: Bytes,
    ) -> Self {
        Self {
            name: name.into(),
            part: FormPart::Bytes {
                file_name: file_name.into(),
                content_type,
                data,
            },
        }
    }

    /// Text value of this field, if it is a text part
    pub fn as_text(&self) -> Option<&str> {
        match &self.part {
            FormPart::Text(value) => Some(value),
            FormPart::Bytes { .. } => None,
        }
    }
}

/// Response to a POST request
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Client errors reject the request contract and are never retried
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> FcResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            FileChunkError::server(format!("malformed response body: {e}")).retryable(false)
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Response to a HEAD probe
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub latency: Duration,
}

impl ProbeResponse {
    /// 2xx and 304 count as available
    pub fn is_available(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }
}

/// Host HTTP capability used by every subsystem that talks to the network
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> FcResult<TransportResponse>;

    async fn post_multipart(
        &self,
        url: &str,
        headers: &[(String, String)],
        fields: Vec<FormField>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> FcResult<TransportResponse>;

    async fn head(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> FcResult<ProbeResponse>;
}

/// [`Transport`] implementation over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> FcResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| FileChunkError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn apply_headers(
        mut request: reqwest::RequestBuilder,
        headers: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            request = request.header(name, value);
        }
        request
    }

    fn classify(err: reqwest::Error) -> FileChunkError {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            FileChunkError::network(err.to_string()).with_cause(err)
        } else {
            FileChunkError::new(ErrorCode::Network, err.to_string())
                .retryable(false)
                .with_cause(err)
        }
    }

    async fn send(
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> FcResult<TransportResponse> {
        let response = tokio::select! {
            result = request.send() => result.map_err(Self::classify)?,
            _ = cancel.cancelled() => return Err(FileChunkError::cancelled()),
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            result = response.bytes() => result.map_err(Self::classify)?,
            _ = cancel.cancelled() => return Err(FileChunkError::cancelled()),
        };

        Ok(TransportResponse { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> FcResult<TransportResponse> {
        debug!(target: "transport", url = %url, "POST json");
        let request = Self::apply_headers(self.client.post(url), headers)
            .timeout(timeout)
            .json(body);
        Self::send(request, cancel).await
    }

    async fn post_multipart(
        &self,
        url: &str,
        headers: &[(String, String)],
        fields: Vec<FormField>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> FcResult<TransportResponse> {
        debug!(target: "transport", url = %url, fields = fields.len(), "POST multipart");
        let mut form = reqwest::multipart::Form::new();
        for field in fields {
            form = match field.part {
                FormPart::Text(value) => form.text(field.name, value),
                FormPart::Bytes {
                    file_name,
                    content_type,
                    data,
                } => {
                    let mut part = reqwest::multipart::Part::bytes(data.to_vec())
                        .file_name(file_name);
                    if let Some(mime) = content_type {
                        part = part.mime_str(&mime).map_err(|e| {
                            FileChunkError::input(format!("bad content type: {e}"))
                        })?;
                    }
                    form.part(field.name, part)
                }
            };
        }

        let request = Self::apply_headers(self.client.post(url), headers)
            .timeout(timeout)
            .multipart(form);
        Self::send(request, cancel).await
    }

    async fn head(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> FcResult<ProbeResponse> {
        let started = Instant::now();
        let response = Self::apply_headers(self.client.head(url), headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::classify)?;

        Ok(ProbeResponse {
            status: response.status().as_u16(),
            latency: started.elapsed(),
        })
    }
}
