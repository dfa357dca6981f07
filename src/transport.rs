//! Transport boundary between the dispatcher and the remote API.

use crate::dispatch::RequestEnvelope;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

/// A request ready to be sent: where, with which headers, and what.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Endpoint the request is posted to.
    pub url: Url,
    /// Extra headers, authentication included.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: RequestEnvelope,
}

impl OutboundRequest {
    /// Look up a header value by name, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Failures below the protocol level.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be reached, or the connection broke.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    /// A response arrived but its body was not JSON.
    #[error("undecodable response: {0}")]
    Undecodable(String),
}

/// Sends one request and returns the decoded JSON body of the response.
///
/// Implementations must not retry; a failed send is reported once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and wait for its response body.
    async fn send(&self, request: OutboundRequest) -> Result<JsonValue, TransportError>;
}

/// JSON-over-HTTP transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with a fresh connection pool.
    pub fn new(app_name: Option<&str>) -> Result<Self, TransportError> {
        let user_agent = match app_name {
            Some(name) => format!("mongo-proxy/{} {}", env!("CARGO_PKG_VERSION"), name),
            None => format!("mongo-proxy/{}", env!("CARGO_PKG_VERSION")),
        };
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self { http_client })
    }

    /// Wrap an existing `reqwest` client, sharing its pool.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<JsonValue, TransportError> {
        let mut builder = self.http_client.post(request.url.clone()).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        // Error envelopes arrive with non-2xx statuses, so the body is decoded
        // regardless and the status only matters when it is not JSON.
        serde_json::from_slice(&body).map_err(|e| {
            tracing::debug!(%status, url = %request.url, "response body is not JSON");
            TransportError::Undecodable(format!("{}: {}", status, e))
        })
    }
}
