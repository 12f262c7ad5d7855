//! Session token shared by outbound requests and the refresh task.
//!
//! The token sits behind a lock so readers never observe a half-written
//! value. Refreshing runs as a cancellable background task that re-fetches
//! the token every interval.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::SecretString;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::rest::RestError;

/// Default interval between token refreshes.
pub const DEFAULT_SESSION_REFRESH_INTERVAL: Duration = Duration::from_secs(7200);

/// Produces a fresh session token.
pub type TokenFetcher =
    Arc<dyn Fn() -> BoxFuture<'static, Result<SecretString, RestError>> + Send + Sync>;

pub struct SessionToken {
    token: Arc<RwLock<Option<SecretString>>>,
    fetcher: Option<TokenFetcher>,
    interval: Duration,
    runtime: Option<Handle>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionToken {
    /// Fetches the initial token. Refreshing starts with [`Self::start_refresh`].
    pub async fn fetch(fetcher: TokenFetcher, interval: Duration) -> Result<Self, RestError> {
        let token = fetcher().await?;
        debug!(event = "session_token_fetched");
        Ok(Self {
            token: Arc::new(RwLock::new(Some(token))),
            fetcher: Some(fetcher),
            interval,
            runtime: Handle::try_current().ok(),
            refresh_task: Mutex::new(None),
        })
    }

    /// A token that is never refreshed.
    pub fn fixed(token: Option<SecretString>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
            fetcher: None,
            interval: DEFAULT_SESSION_REFRESH_INTERVAL,
            runtime: None,
            refresh_task: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<SecretString> {
        self.token.read().ok().and_then(|token| token.clone())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Starts the refresh task unless one is already running.
    pub fn start_refresh(&self) {
        let (Some(fetcher), Some(runtime)) = (self.fetcher.as_ref(), self.runtime.as_ref()) else {
            return;
        };
        let mut task = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            return;
        }

        let token = Arc::clone(&self.token);
        let fetcher = Arc::clone(fetcher);
        let interval = self.interval;
        *task = Some(runtime.spawn(refresh_loop(token, fetcher, interval)));
        debug!(
            event = "session_refresh_started",
            interval_secs = interval.as_secs()
        );
    }

    pub fn stop_refresh(&self) {
        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            debug!(event = "session_refresh_stopped");
        }
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        self.stop_refresh();
    }
}

async fn refresh_loop(
    token: Arc<RwLock<Option<SecretString>>>,
    fetcher: TokenFetcher,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        match fetcher().await {
            Ok(fresh) => {
                if let Ok(mut guard) = token.write() {
                    *guard = Some(fresh);
                }
                debug!(event = "session_token_refreshed");
            }
            // Keep serving the previous token until a refresh succeeds.
            Err(err) => warn!(event = "session_token_refresh_failed", error = %err),
        }
    }
}
