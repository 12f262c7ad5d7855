//! Client configuration.

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::rest::{RestClientOptions, REST_BASE_URL};
use crate::stream::connection::DEFAULT_MAX_RECONNECT_ATTEMPTS;
use crate::stream::session::DEFAULT_SESSION_REFRESH_INTERVAL;

pub const STREAM_ENDPOINT: &str = "wss://www.streamr.com/api/v1/ws";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("api key is required")]
    MissingApiKey,

    #[error("{field} must use one of {expected}: {url}")]
    InvalidUrl {
        field: &'static str,
        expected: &'static str,
        url: String,
    },

    #[error("session refresh interval must be non-zero")]
    ZeroRefreshInterval,
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub api_key: Option<SecretString>,
    /// Older name for `api_key`, used only when `api_key` is unset.
    pub auth_key: Option<SecretString>,
    pub url: String,
    pub rest_url: String,
    /// Connect on the first subscribe or publish.
    pub auto_connect: bool,
    /// Disconnect once the last subscription is gone.
    pub auto_disconnect: bool,
    pub session_refresh_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub rest: RestClientOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            auth_key: None,
            url: STREAM_ENDPOINT.to_string(),
            rest_url: REST_BASE_URL.to_string(),
            auto_connect: true,
            auto_disconnect: true,
            session_refresh_interval: DEFAULT_SESSION_REFRESH_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            rest: RestClientOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key: Some(api_key),
            ..Self::default()
        }
    }

    pub fn with_auth_key(mut self, auth_key: SecretString) -> Self {
        self.auth_key = Some(auth_key);
        self
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_rest_url(mut self, rest_url: impl Into<String>) -> Self {
        self.rest_url = rest_url.into();
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_auto_disconnect(mut self, auto_disconnect: bool) -> Self {
        self.auto_disconnect = auto_disconnect;
        self
    }

    pub fn with_session_refresh_interval(mut self, interval: Duration) -> Self {
        self.session_refresh_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_rest_options(mut self, rest: RestClientOptions) -> Self {
        self.rest = rest;
        self
    }

    /// Checks the options and returns the api key to authenticate with.
    pub fn validate(&self) -> Result<SecretString, ConfigError> {
        check_scheme("url", &self.url, &["ws://", "wss://"], "ws/wss")?;
        check_scheme(
            "rest_url",
            &self.rest_url,
            &["http://", "https://"],
            "http/https",
        )?;
        if self.session_refresh_interval.is_zero() {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        self.api_key
            .as_ref()
            .or(self.auth_key.as_ref())
            .cloned()
            .ok_or(ConfigError::MissingApiKey)
    }
}

fn check_scheme(
    field: &'static str,
    url: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<(), ConfigError> {
    let lower = url.to_ascii_lowercase();
    let valid = schemes
        .iter()
        .any(|scheme| lower.len() > scheme.len() && lower.starts_with(scheme));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            field,
            expected,
            url: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::{ExposeSecret, SecretString};

    use super::{ClientOptions, ConfigError, STREAM_ENDPOINT};

    fn key(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[test]
    fn defaults_match_hosted_service() {
        let options = ClientOptions::default();
        assert_eq!(options.url, STREAM_ENDPOINT);
        assert_eq!(options.rest_url, "https://www.streamr.com/api/v1");
        assert!(options.auto_connect);
        assert!(options.auto_disconnect);
        assert_eq!(options.session_refresh_interval, Duration::from_secs(7200));
        assert_eq!(options.max_reconnect_attempts, 10);
    }

    #[test]
    fn api_key_is_required() {
        assert_eq!(
            ClientOptions::default().validate().map(|_| ()),
            Err(ConfigError::MissingApiKey)
        );
    }

    #[test]
    fn auth_key_is_fallback_for_api_key() {
        let resolved = ClientOptions::default()
            .with_auth_key(key("legacy"))
            .validate()
            .expect("auth key accepted");
        assert_eq!(resolved.expose_secret(), "legacy");

        let resolved = ClientOptions::new(key("primary"))
            .with_auth_key(key("legacy"))
            .validate()
            .expect("api key wins");
        assert_eq!(resolved.expose_secret(), "primary");
    }

    #[test]
    fn rejects_wrong_url_schemes() {
        let error = ClientOptions::new(key("k"))
            .with_endpoint("https://www.streamr.com/api/v1/ws")
            .validate()
            .map(|_| ())
            .expect_err("http endpoint");
        assert!(matches!(error, ConfigError::InvalidUrl { field: "url", .. }));

        let error = ClientOptions::new(key("k"))
            .with_rest_url("ws://localhost")
            .validate()
            .map(|_| ())
            .expect_err("ws rest url");
        assert!(matches!(
            error,
            ConfigError::InvalidUrl {
                field: "rest_url",
                ..
            }
        ));

        assert!(ClientOptions::new(key("k"))
            .with_endpoint("WS://localhost:8890/api/v1/ws")
            .validate()
            .is_ok());
    }

    #[test]
    fn zero_refresh_interval_is_rejected() {
        let result = ClientOptions::new(key("k"))
            .with_session_refresh_interval(Duration::ZERO)
            .validate()
            .map(|_| ());
        assert_eq!(result, Err(ConfigError::ZeroRefreshInterval));
    }
}
