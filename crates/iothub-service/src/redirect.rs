//! Event endpoint discovery.
//!
//! The hub does not serve device events itself. Opening a receiver on
//! `messages/events/` is answered with a link redirect naming the event hub
//! host and the partition group; events are then read from that host.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::{amqps_url, close_quietly, step};
use crate::error::{Error, Result};
use crate::protocol::address;
use crate::transport::{
    Auth, Connection, ReceiverOptions, RedirectInfo, Session, Transport, TransportError,
};

/// Where device events are actually served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RedirectTarget {
    /// Event hub entity (partition group) name.
    pub group: String,
    pub host: String,
}

impl RedirectTarget {
    /// `info.address` is `"<scheme>://<host>:<port>/<group>/"`.
    pub(crate) fn from_info(info: &RedirectInfo) -> Result<Self> {
        let url = url::Url::parse(&info.address)
            .map_err(|e| Error::InvalidRedirect(format!("address {:?}: {e}", info.address)))?;
        let group = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|g| !g.is_empty())
            .ok_or_else(|| {
                Error::InvalidRedirect(format!("no group in address {:?}", info.address))
            })?;
        if info.hostname.is_empty() {
            return Err(Error::InvalidRedirect("empty hostname".into()));
        }
        Ok(Self {
            group: group.to_string(),
            host: info.hostname.clone(),
        })
    }
}

/// Ask the hub for its event endpoint and connect to it.
pub(crate) async fn resolve(
    transport: &dyn Transport,
    config: &ClientConfig,
    cancel: &CancellationToken,
) -> Result<(Box<dyn Connection>, RedirectTarget)> {
    let target = discover(transport, config, cancel).await?;
    info!(host = %target.host, group = %target.group, "event endpoint redirect");

    let creds = &config.credentials;
    let auth = Auth::Plain {
        username: creds.shared_access_key_name.clone(),
        password: creds.shared_access_key.clone(),
    };
    let conn = step(
        "dial event endpoint",
        config.timing.connect_timeout,
        transport.dial(&amqps_url(&target.host), auth),
    )
    .await?;
    Ok((conn, target))
}

/// Trigger the redirect and read the target from it. The discovery
/// connection is closed on every path.
async fn discover(
    transport: &dyn Transport,
    config: &ClientConfig,
    cancel: &CancellationToken,
) -> Result<RedirectTarget> {
    let creds = &config.credentials;
    let limit = config.timing.connect_timeout;
    let token = config
        .token_source
        .sign(&creds.host_name, config.timing.token_ttl)
        .map_err(Error::Token)?;
    let auth = Auth::Plain {
        username: creds.redirect_username(),
        password: token,
    };

    let conn = step("dial", limit, transport.dial(&amqps_url(&creds.host_name), auth)).await?;
    let result = match step("open session", limit, conn.session()).await {
        Ok(session) => {
            let result = await_redirect(session.as_ref(), limit, cancel).await;
            if let Err(e) = session.close().await {
                debug!("closing discovery session: {e}");
            }
            result
        }
        Err(e) => Err(e),
    };
    close_quietly(conn.as_ref()).await;

    RedirectTarget::from_info(&result?)
}

/// Open the events receiver and wait for the redirect. Any other outcome,
/// including a delivered message, is an error.
async fn await_redirect(
    session: &dyn Session,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<RedirectInfo> {
    let mut receiver = step(
        "open discovery receiver",
        limit,
        session.receiver(address::EVENTS, ReceiverOptions::default()),
    )
    .await?;

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = tokio::time::timeout(limit, receiver.receive()) => match r {
            Err(_) => Err(Error::Timeout { what: "redirect receive", after: limit }),
            Ok(Ok(_)) => Err(Error::RedirectExpected),
            Ok(Err(TransportError::Redirect(info))) => Ok(info),
            Ok(Err(other)) => Err(Error::Transport(other)),
        },
    };

    if let Err(e) = receiver.close().await {
        debug!("closing discovery receiver: {e}");
    }
    outcome
}
