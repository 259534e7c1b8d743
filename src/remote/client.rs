use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;

use crate::auth::TokenManager;

use super::RemoteError;
use super::types::ApiErrorBody;

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
pub(super) const NOTIFY_BASE: &str = "https://notify.dropboxapi.com/2";

/// HTTP implementation of [`super::RemoteClient`].
pub struct HttpRemote {
    http: reqwest::Client,
    token_manager: Arc<TokenManager>,
}

impl HttpRemote {
    pub fn new(token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            token_manager,
        })
    }

    /// RPC endpoint: JSON in, JSON out.
    pub fn rpc(&self, path: &str) -> AuthenticatedRequest<'_> {
        AuthenticatedRequest {
            client: self,
            url: format!("{API_BASE}{path}"),
            api_arg: None,
            json: None,
            body: None,
        }
    }

    /// Content endpoint: arguments travel in the `Dropbox-API-Arg` header and
    /// the body carries raw bytes.
    pub fn content(&self, path: &str) -> AuthenticatedRequest<'_> {
        AuthenticatedRequest {
            client: self,
            url: format!("{CONTENT_BASE}{path}"),
            api_arg: None,
            json: None,
            body: None,
        }
    }
}

/// Request that can be rebuilt for every attempt, so retries after a token
/// refresh or a 429 resend the same body.
pub struct AuthenticatedRequest<'a> {
    client: &'a HttpRemote,
    url: String,
    api_arg: Option<String>,
    json: Option<String>,
    body: Option<Vec<u8>>,
}

impl<'a> AuthenticatedRequest<'a> {
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, RemoteError> {
        self.json = Some(encode(body)?);
        Ok(self)
    }

    pub fn arg<T: Serialize + ?Sized>(mut self, arg: &T) -> Result<Self, RemoteError> {
        self.api_arg = Some(header_safe(&encode(arg)?));
        Ok(self)
    }

    pub fn body(mut self, bytes: Vec<u8>) -> Self {
        self.body = Some(bytes);
        self
    }

    fn build(&self, token: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .http
            .request(Method::POST, &self.url)
            .bearer_auth(token);
        if let Some(arg) = &self.api_arg {
            builder = builder.header("Dropbox-API-Arg", arg);
        }
        if let Some(json) = &self.json {
            builder = builder
                .header("content-type", "application/json")
                .body(json.clone());
        } else if let Some(bytes) = &self.body {
            builder = builder
                .header("content-type", "application/octet-stream")
                .body(bytes.clone());
        } else if self.api_arg.is_some() {
            builder = builder.header("content-type", "application/octet-stream");
        }
        builder
    }

    /// Send with auth, one token refresh on 401, and waits on 429.
    pub async fn send(self) -> Result<Response, RemoteError> {
        const MAX_RETRIES: u32 = 5;
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            let token = self.client.token_manager.get_access_token().await?;
            let resp = self
                .build(&token)
                .send()
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))?;

            match resp.status() {
                s if s.is_success() => return Ok(resp),

                StatusCode::UNAUTHORIZED if !refreshed => {
                    tracing::debug!(url = %self.url, "access token rejected, refreshing");
                    self.client.token_manager.invalidate().await;
                    refreshed = true;
                }

                StatusCode::UNAUTHORIZED => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(RemoteError::Unauthorized(body));
                }

                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = retry_after(&resp);
                    if attempt >= MAX_RETRIES {
                        return Err(RemoteError::RateLimited { retry_after });
                    }
                    let wait = retry_after.unwrap_or(Duration::from_secs(2)) + jitter();
                    tracing::warn!(
                        attempt = attempt + 1,
                        "rate limited, waiting {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }

                StatusCode::CONFLICT => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(classify_conflict(&body));
                }

                s if s.is_server_error() => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(RemoteError::ServerError {
                        status: s.as_u16(),
                        body,
                    });
                }

                status => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(RemoteError::Api(format!("HTTP {status}: {body}")));
                }
            }
        }
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, RemoteError> {
    serde_json::to_string(value).map_err(|e| RemoteError::Api(format!("encode request: {e}")))
}

/// HTTP headers must be ASCII; escape everything else as JSON `\uXXXX`.
fn header_safe(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a 409 endpoint error onto the typed outcomes the engine handles.
pub(super) fn classify_conflict(body: &str) -> RemoteError {
    let Ok(err) = serde_json::from_str::<ApiErrorBody>(body) else {
        return RemoteError::Api(body.to_string());
    };
    if let Some(expected) = err.correct_offset() {
        return RemoteError::IncorrectOffset { expected };
    }
    let summary = err.error_summary.as_str();
    if summary.contains("not_found") {
        RemoteError::NotFound(summary.to_string())
    } else if summary.contains("conflict") {
        RemoteError::AlreadyExists(summary.to_string())
    } else {
        RemoteError::Api(summary.to_string())
    }
}

pub(super) async fn decode<T: serde::de::DeserializeOwned>(
    resp: Response,
) -> Result<T, RemoteError> {
    resp.json()
        .await
        .map_err(|e| RemoteError::Api(format!("decode response: {e}")))
}

fn jitter() -> Duration {
    let ms: u64 = rand::random::<u64>() % 1000;
    Duration::from_millis(ms)
}
