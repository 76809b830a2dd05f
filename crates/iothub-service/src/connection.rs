//! Primary connection management: handshake, token renewal, and close.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, TimingConfig};
use crate::error::{Error, Result};
use crate::transport::{Auth, Connection, Session, Transport, TransportError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn amqps_url(host: &str) -> String {
    format!("amqps://{host}")
}

/// Run one network step under `limit`.
pub(crate) async fn step<T, F>(what: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout { what, after: limit }),
    }
}

/// Close a connection whose setup failed; the original error wins.
pub(crate) async fn close_quietly(conn: &dyn Connection) {
    if let Err(e) = conn.close().await {
        debug!("closing connection after failure: {e}");
    }
}

// ---------------------------------------------------------------------------
// Primary connection
// ---------------------------------------------------------------------------

/// The authenticated connection used for sending and feedback.
///
/// `done` fires on close or when token renewal fails; from then on the
/// connection refuses new work.
pub(crate) struct PrimaryConnection {
    conn: Arc<dyn Connection>,
    session: Box<dyn Session>,
    done: CancellationToken,
    closed: AtomicBool,
    renewal: JoinHandle<()>,
}

impl PrimaryConnection {
    /// Dial the hub, submit a fresh token, open the session, and start the
    /// renewal task.
    pub(crate) async fn open(transport: &dyn Transport, config: &ClientConfig) -> Result<Self> {
        let host = config.credentials.host_name.as_str();
        let timing = &config.timing;

        let conn: Arc<dyn Connection> = Arc::from(
            step(
                "dial",
                timing.connect_timeout,
                transport.dial(&amqps_url(host), Auth::Anonymous),
            )
            .await?,
        );

        let session = match Self::authenticate(conn.as_ref(), config).await {
            Ok(session) => session,
            Err(e) => {
                close_quietly(conn.as_ref()).await;
                return Err(e);
            }
        };

        let done = CancellationToken::new();
        let renewal = tokio::spawn(renew_continuously(
            Arc::clone(&conn),
            Arc::clone(&config.token_source),
            host.to_string(),
            timing.clone(),
            done.clone(),
        ));

        info!(host, "connected");
        Ok(Self {
            conn,
            session,
            done,
            closed: AtomicBool::new(false),
            renewal,
        })
    }

    async fn authenticate(conn: &dyn Connection, config: &ClientConfig) -> Result<Box<dyn Session>> {
        let host = config.credentials.host_name.as_str();
        let timing = &config.timing;
        let token = config
            .token_source
            .sign(host, timing.token_ttl)
            .map_err(Error::Token)?;
        step("put token", timing.connect_timeout, conn.put_token(host, &token)).await?;
        step("open session", timing.connect_timeout, conn.session()).await
    }

    /// The session, if the connection is still usable.
    pub(crate) fn session(&self) -> Result<&dyn Session> {
        if self.done.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        Ok(self.session.as_ref())
    }

    /// Fires when the connection stops being usable.
    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Signal `done` and close the transport. Only the first call does any
    /// work.
    pub(crate) async fn close(&self) -> Result<()> {
        self.done.cancel();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.renewal.abort();
        if let Err(e) = self.session.close().await {
            debug!("closing session: {e}");
        }
        self.conn.close().await?;
        info!("connection closed");
        Ok(())
    }
}

impl Drop for PrimaryConnection {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Re-mint and re-submit the token every renewal interval until `done`
/// fires. A failure degrades the connection by firing `done` itself.
async fn renew_continuously(
    conn: Arc<dyn Connection>,
    tokens: Arc<dyn crate::credentials::TokenSource>,
    host: String,
    timing: TimingConfig,
    done: CancellationToken,
) {
    let ttl = timing.token_ttl;
    let interval = timing.token_renewal_interval;
    let limit = renewal_limit(&timing);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = done.cancelled() => {
                debug!("token renewal stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let token = match tokens.sign(&host, ttl) {
            Ok(token) => token,
            Err(e) => {
                warn!(host = %host, "token generation failed, connection is no longer usable: {e}");
                done.cancel();
                return;
            }
        };
        let submitted = tokio::select! {
            _ = done.cancelled() => return,
            r = step("renew token", limit, conn.put_token(&host, &token)) => r,
        };
        match submitted {
            Ok(()) => debug!(host = %host, "token renewed"),
            Err(e) => {
                warn!(host = %host, "token renewal failed, connection is no longer usable: {e}");
                done.cancel();
                return;
            }
        }
    }
}

/// Bound for one token submission: the connect timeout, shortened when the
/// current token would expire sooner.
fn renewal_limit(timing: &TimingConfig) -> Duration {
    timing
        .connect_timeout
        .min(timing.token_ttl.saturating_sub(timing.token_renewal_interval))
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle of the client's primary connection. Transitions happen under
/// the client's mutex; no transition awaits.
pub(crate) enum ConnState {
    Disconnected,
    /// A connect is in flight; `previous` stays usable until it finishes.
    Connecting { previous: Option<Arc<PrimaryConnection>> },
    Connected(Arc<PrimaryConnection>),
    Closed,
}

impl ConnState {
    /// Enter `Connecting`. Fails when closed or another connect is running.
    pub(crate) fn begin_connect(&mut self) -> Result<()> {
        let previous = match std::mem::replace(self, ConnState::Disconnected) {
            ConnState::Disconnected => None,
            ConnState::Connected(conn) => Some(conn),
            other @ ConnState::Connecting { .. } => {
                *self = other;
                return Err(Error::InvalidArgument("connect already in progress".into()));
            }
            ConnState::Closed => {
                *self = ConnState::Closed;
                return Err(Error::Closed);
            }
        };
        *self = ConnState::Connecting { previous };
        Ok(())
    }

    /// Finish a connect. Returns the connection the caller must close: the
    /// replaced one on success, or the new one if the client was closed in
    /// the meantime (then `Err(Closed)`).
    pub(crate) fn finish_connect(
        &mut self,
        outcome: std::result::Result<Arc<PrimaryConnection>, ()>,
    ) -> (Option<Arc<PrimaryConnection>>, Result<()>) {
        match std::mem::replace(self, ConnState::Disconnected) {
            ConnState::Connecting { previous } => match outcome {
                Ok(conn) => {
                    *self = ConnState::Connected(conn);
                    (previous, Ok(()))
                }
                Err(()) => {
                    *self = previous.map_or(ConnState::Disconnected, ConnState::Connected);
                    (None, Ok(()))
                }
            },
            ConnState::Closed => {
                *self = ConnState::Closed;
                (outcome.ok(), Err(Error::Closed))
            }
            other => {
                // Only reachable if another transition bypassed begin_connect.
                *self = other;
                (outcome.ok(), Err(Error::Closed))
            }
        }
    }

    /// The connection to use for send/feedback.
    pub(crate) fn current(&self) -> Result<Arc<PrimaryConnection>> {
        match self {
            ConnState::Connected(conn)
            | ConnState::Connecting {
                previous: Some(conn),
            } => Ok(Arc::clone(conn)),
            ConnState::Disconnected | ConnState::Connecting { previous: None } => {
                Err(Error::NotConnected)
            }
            ConnState::Closed => Err(Error::Closed),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, ConnState::Closed)
    }

    /// Enter `Closed`, returning the connection to close. `None` if there is
    /// nothing to close or the state was already `Closed`.
    pub(crate) fn close(&mut self) -> Option<Arc<PrimaryConnection>> {
        match std::mem::replace(self, ConnState::Closed) {
            ConnState::Connected(conn) => Some(conn),
            ConnState::Connecting { previous } => previous,
            ConnState::Disconnected | ConnState::Closed => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amqps_url_format() {
        assert_eq!(
            amqps_url("myhub.azure-devices.net"),
            "amqps://myhub.azure-devices.net"
        );
    }

    #[test]
    fn disconnected_state_reports_not_connected() {
        let state = ConnState::Disconnected;
        assert!(matches!(state.current(), Err(Error::NotConnected)));
    }

    #[test]
    fn connect_lifecycle_without_connection() {
        let mut state = ConnState::Disconnected;
        state.begin_connect().unwrap();
        assert!(matches!(
            state.begin_connect(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(state.current(), Err(Error::NotConnected)));

        let (to_close, result) = state.finish_connect(Err(()));
        assert!(to_close.is_none());
        assert!(result.is_ok());
        assert!(matches!(state, ConnState::Disconnected));
    }

    #[test]
    fn closed_state_is_terminal() {
        let mut state = ConnState::Disconnected;
        assert!(state.close().is_none());
        assert!(matches!(state.current(), Err(Error::Closed)));
        assert!(matches!(state.begin_connect(), Err(Error::Closed)));
        assert!(state.close().is_none());
    }

    #[test]
    fn close_during_connect_rejects_the_result() {
        let mut state = ConnState::Disconnected;
        state.begin_connect().unwrap();
        assert!(state.close().is_none());
        let (to_close, result) = state.finish_connect(Err(()));
        assert!(to_close.is_none());
        assert!(matches!(result, Err(Error::Closed)));
        assert!(matches!(state, ConnState::Closed));
    }

    #[test]
    fn renewal_limit_never_outlives_the_token() {
        let mut timing = TimingConfig::default();
        assert_eq!(renewal_limit(&timing), timing.connect_timeout);

        timing.token_ttl = Duration::from_secs(60);
        timing.token_renewal_interval = Duration::from_secs(50);
        assert_eq!(renewal_limit(&timing), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn step_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), TransportError>(())
        };
        let err = step("dial", Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { what: "dial", .. }));
    }

    #[tokio::test]
    async fn step_propagates_transport_error() {
        let failing = async { Err::<(), _>(TransportError::Closed) };
        let err = step("dial", Duration::from_secs(1), failing)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Closed)));
    }
}
