use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const REST_BASE_URL: &str = "https://www.streamr.com/api/v1";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(200);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(2);
    pub const JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct RestClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: RestDefaults::MAX_ATTEMPTS,
                initial_backoff: RestDefaults::BACKOFF,
                max_backoff: RestDefaults::MAX_BACKOFF,
                jitter: RestDefaults::JITTER,
            },
        }
    }
}

/// Stream metadata as returned by the REST api.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// HTTP client for the login and stream management endpoints.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RestError> {
        Self::with_options(base_url, RestClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: RestClientOptions,
    ) -> Result<Self, RestError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RestError::Transport)?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges an api key for a session token.
    pub async fn fetch_session_token(
        &self,
        api_key: &SecretString,
    ) -> Result<SecretString, RestError> {
        let endpoint = self.endpoint("/login/apikey");
        let body = json!({ "apiKey": api_key.expose_secret() });
        let response = self
            .execute(|| self.http.post(&endpoint).json(&body))
            .await?
            .ok_or_else(|| RestError::NotFound(endpoint.clone()))?;
        parse_session_token(&response)
    }

    pub async fn create_stream(
        &self,
        name: &str,
        description: Option<&str>,
        session_token: &SecretString,
    ) -> Result<StreamRecord, RestError> {
        let endpoint = self.endpoint("/streams");
        let body = json!({
            "name": name,
            "description": description.unwrap_or_default(),
            "config": { "fields": [] },
        });
        let response = self
            .execute(|| bearer_auth(self.http.post(&endpoint).json(&body), session_token))
            .await?
            .ok_or_else(|| RestError::NotFound(endpoint.clone()))?;
        parse_json(&response)
    }

    /// Streams whose name matches exactly. `None` when there are none.
    pub async fn get_streams_by_name(
        &self,
        name: &str,
        session_token: &SecretString,
    ) -> Result<Option<Vec<StreamRecord>>, RestError> {
        let endpoint = self.endpoint("/streams");
        let response = self
            .execute(|| {
                bearer_auth(
                    self.http.get(&endpoint).query(&[("name", name)]),
                    session_token,
                )
            })
            .await?;
        let Some(body) = response else {
            return Ok(None);
        };
        let streams: Vec<StreamRecord> = parse_json(&body)?;
        Ok((!streams.is_empty()).then_some(streams))
    }

    pub async fn get_stream_by_id(
        &self,
        stream_id: &str,
        session_token: &SecretString,
    ) -> Result<Option<StreamRecord>, RestError> {
        let endpoint = self.endpoint(&format!("/streams/{stream_id}"));
        let response = self
            .execute(|| bearer_auth(self.http.get(&endpoint), session_token))
            .await?;
        response.as_deref().map(parse_json).transpose()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<B>(&self, build: B) -> Result<Option<String>, RestError>
    where
        B: Fn() -> RequestBuilder,
    {
        retry_async(
            &self.retry_policy,
            |_| {
                let request = build().timeout(self.attempt_timeout);
                async move { send_attempt(request).await }
            },
            RestError::is_retryable,
        )
        .await
    }
}

/// Sends one request. A 404 resolves to `None`.
async fn send_attempt(request: RequestBuilder) -> Result<Option<String>, RestError> {
    let response = request.send().await.map_err(RestError::Transport)?;
    let status = response.status();
    let body = response.text().await.map_err(RestError::Transport)?;

    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(RestError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    Ok(Some(body))
}

fn bearer_auth(builder: RequestBuilder, session_token: &SecretString) -> RequestBuilder {
    builder.bearer_auth(session_token.expose_secret())
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("endpoint not found: {0}")]
    NotFound(String),

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl RestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::NotFound(_) | Self::Parse(_) => false,
        }
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, RestError> {
    serde_json::from_str(body).map_err(|err| RestError::Parse(err.to_string()))
}

fn parse_session_token(body: &str) -> Result<SecretString, RestError> {
    #[derive(Deserialize)]
    struct LoginResponse {
        #[serde(default)]
        token: Option<String>,
    }

    match parse_json::<LoginResponse>(body)?.token {
        Some(token) if !token.is_empty() => Ok(SecretString::new(token)),
        _ => Err(RestError::Parse("login response missing token".to_string())),
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error).or(parsed.code) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use secrecy::ExposeSecret;
    use serde_json::json;

    use super::{
        parse_json, parse_session_token, summarize_error_body, RestClient, RestError,
        StreamRecord, REST_BASE_URL,
    };

    #[test]
    fn parses_login_token() {
        let token = parse_session_token(r#"{"token":"abc","expires":"2030-01-01"}"#)
            .expect("parse token");
        assert_eq!(token.expose_secret(), "abc");
    }

    #[test]
    fn login_without_token_is_parse_error() {
        let error = parse_session_token(r#"{"expires":"2030-01-01"}"#).expect_err("no token");
        assert!(matches!(error, RestError::Parse(_)));
        let error = parse_session_token(r#"{"token":""}"#).expect_err("empty token");
        assert!(matches!(error, RestError::Parse(_)));
    }

    #[test]
    fn stream_record_keeps_unknown_fields() {
        let record: StreamRecord = parse_json(
            r#"{"id":"s1","name":"temps","description":"d","partitions":2,"uiChannel":false}"#,
        )
        .expect("parse record");
        assert_eq!(record.id, "s1");
        assert_eq!(record.partitions, Some(2));
        assert_eq!(record.extra.get("uiChannel"), Some(&json!(false)));

        let minimal: StreamRecord = parse_json(r#"{"id":"s2"}"#).expect("minimal record");
        assert_eq!(minimal.name, "");
        assert!(minimal.description.is_none());
    }

    #[test]
    fn error_body_prefers_message_then_truncates() {
        assert_eq!(
            summarize_error_body(r#"{"message":"Stream not found","code":"NOT_FOUND"}"#),
            "Stream not found"
        );
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }

    #[test]
    fn retryable_statuses() {
        let busy = RestError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        let denied = RestError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(busy.is_retryable());
        assert!(!denied.is_retryable());
        assert!(!RestError::Parse("bad".to_string()).is_retryable());
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = RestClient::new("http://localhost:8081/api/v1/").expect("build client");
        assert_eq!(client.base_url(), "http://localhost:8081/api/v1");
        assert_eq!(REST_BASE_URL, "https://www.streamr.com/api/v1");
    }
}
