use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Credential, ToolContext, ToolError};

const MAX_ERROR_MESSAGE_CHARS: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecordApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RecordApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

/// HTTP client for the invoicing record API. Every request carries the
/// caller's credential; the client never holds one of its own.
#[derive(Clone)]
pub struct RecordApiClient {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl RecordApiClient {
    pub fn new(config: &RecordApiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let req = self.client.get(self.url(path)).query(query);
        self.dispatch(req, ctx).await
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let req = self.client.request(method, self.url(path)).json(&body);
        self.dispatch(req, ctx).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn dispatch(&self, req: RequestBuilder, ctx: &ToolContext) -> Result<Value, ToolError> {
        let req = with_credential(req, &ctx.credential).timeout(self.timeout);
        let resp = req
            .send()
            .await
            .map_err(|err| ToolError::Unavailable(err.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| ToolError::Unavailable(err.to_string()))?;
        if !status.is_success() {
            return Err(ToolError::from_status(
                status.as_u16(),
                error_message(&text, status.as_str()),
            ));
        }
        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text).map_err(|err| ToolError::InvalidResponse(err.to_string()))
    }
}

fn with_credential(mut req: RequestBuilder, credential: &Credential) -> RequestBuilder {
    if let Some(authorization) = &credential.authorization {
        req = req.header(reqwest::header::AUTHORIZATION, authorization);
    }
    if let Some(cookie) = &credential.cookie {
        req = req.header(reqwest::header::COOKIE, cookie);
    }
    req
}

fn error_message(body: &str, fallback: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let message = value
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str)
            .or_else(|| value.get("message").and_then(Value::as_str));
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    trimmed.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}
