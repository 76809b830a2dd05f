//! Client configuration: credentials, token source, subscription settings
//! and timing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::{Credentials, TokenSource};
use crate::error::Error;
use crate::transport::EventPosition;

/// Environment variable read by [`ClientConfig::from_env`].
pub const CONNECTION_STRING_ENV: &str = "IOTHUB_SERVICE_CONNECTION_STRING";

pub(crate) const DEFAULT_CONSUMER_GROUP: &str = "$Default";
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_TOKEN_RENEWAL_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Token and network timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Validity of every minted token.
    pub token_ttl: Duration,
    /// Period of the background token re-submission. Must be shorter than
    /// `token_ttl`.
    pub token_renewal_interval: Duration,
    /// Bound for each network step of connect and redirect resolution.
    pub connect_timeout: Duration,
    /// Total timeout of a REST request.
    pub http_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            token_ttl: DEFAULT_TOKEN_TTL,
            token_renewal_interval: DEFAULT_TOKEN_RENEWAL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

/// Configuration for [`ServiceClient`](crate::ServiceClient).
#[derive(Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    pub token_source: Arc<dyn TokenSource>,
    /// Consumer group used by `subscribe_events`. Defaults to `"$Default"`.
    pub consumer_group: String,
    pub event_position: EventPosition,
    /// Upper bound on concurrently running event/feedback handlers. `None`
    /// spawns every handler immediately.
    pub callback_concurrency: Option<usize>,
    /// REST endpoint override. Defaults to `https://<host_name>`.
    pub rest_base_url: Option<String>,
    pub timing: TimingConfig,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("credentials", &self.credentials)
            .field("consumer_group", &self.consumer_group)
            .field("event_position", &self.event_position)
            .field("callback_concurrency", &self.callback_concurrency)
            .field("rest_base_url", &self.rest_base_url)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(credentials: Credentials, token_source: Arc<dyn TokenSource>) -> Self {
        Self {
            credentials,
            token_source,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            event_position: EventPosition::default(),
            callback_concurrency: None,
            rest_base_url: None,
            timing: TimingConfig::default(),
        }
    }

    /// Build a config from the connection string in
    /// `IOTHUB_SERVICE_CONNECTION_STRING`.
    pub fn from_env(token_source: Arc<dyn TokenSource>) -> Result<Self, Error> {
        let cs = std::env::var(CONNECTION_STRING_ENV)
            .map_err(|e| Error::Config(format!("{CONNECTION_STRING_ENV}: {e}")))?;
        let credentials = Credentials::from_connection_string(&cs)?;
        Ok(Self::new(credentials, token_source))
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.credentials.validate()?;
        if self.consumer_group.is_empty() {
            return Err(Error::Config("consumer group is empty".into()));
        }
        if self.callback_concurrency == Some(0) {
            return Err(Error::Config("callback concurrency must be at least 1".into()));
        }
        let t = &self.timing;
        if t.token_ttl.is_zero() {
            return Err(Error::Config("token ttl must be positive".into()));
        }
        if t.token_renewal_interval.is_zero() || t.token_renewal_interval >= t.token_ttl {
            return Err(Error::Config(format!(
                "token renewal interval {:?} must be positive and shorter than the token ttl {:?}",
                t.token_renewal_interval, t.token_ttl
            )));
        }
        if t.connect_timeout.is_zero() || t.http_timeout.is_zero() {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn rest_base_url(&self) -> String {
        self.rest_base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", self.credentials.host_name))
    }
}
