//! Request/response transport over reqwest.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::HttpTransport;
use crate::request::GraphQLRequest;
use crate::{GraphQLClientConfig, GraphQLError, GraphQLResponse, Result};

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 512;

/// POSTs GraphQL documents as JSON to a single endpoint.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: Client,
    endpoint: String,
    default_headers: Vec<(String, String)>,
}

impl ReqwestTransport {
    /// Build a transport for the configured `http_url`.
    ///
    /// Deadlines are enforced by the executor, so the underlying client has
    /// no timeout of its own.
    pub fn new(config: &GraphQLClientConfig) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()
            .map_err(|e| GraphQLError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(http_client, config))
    }

    /// Use an existing reqwest client.
    pub fn with_client(http_client: Client, config: &GraphQLClientConfig) -> Self {
        Self {
            http_client,
            endpoint: config.http_url.clone(),
            default_headers: config.default_headers.clone(),
        }
    }

    /// Endpoint requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &GraphQLRequest) -> Result<GraphQLResponse<Value>> {
        debug!(endpoint = %self.endpoint, "Sending GraphQL request");

        let mut http_request = self.http_client.post(&self.endpoint);
        for (name, value) in &self.default_headers {
            http_request = http_request.header(name.as_str(), value.as_str());
        }

        let response = http_request
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            // Servers commonly reject invalid documents with a 4xx carrying a
            // regular GraphQL error payload.
            if let Ok(payload) = serde_json::from_slice::<GraphQLResponse<Value>>(&body)
                && payload.has_errors()
            {
                return Ok(payload);
            }

            let mut text = String::from_utf8_lossy(&body).into_owned();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(GraphQLError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}
