//! Abstract messaging transport.
//!
//! The crate does not speak the binary protocol itself. Callers plug in an
//! implementation of [`Transport`] (for example a thin adapter over an AMQP
//! 1.0 library) and the client drives it through these traits.

use std::fmt;

use async_trait::async_trait;

use crate::error::BoxError;
use crate::protocol::WireMessage;

/// Connection authentication.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// SASL ANONYMOUS; authorisation follows via [`Connection::put_token`].
    Anonymous,
    /// SASL PLAIN with a username and password (or signed token).
    Plain { username: String, password: String },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Anonymous => f.write_str("Anonymous"),
            Auth::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Where a partition receiver starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventPosition {
    /// Only events enqueued after the receiver attached.
    #[default]
    Latest,
    /// Everything still retained by the partition.
    Earliest,
}

impl EventPosition {
    /// Selector filter expression understood by event hub partitions.
    pub fn selector(self) -> &'static str {
        match self {
            EventPosition::Latest => "amqp.annotation.x-opt-offset > '@latest'",
            EventPosition::Earliest => "amqp.annotation.x-opt-offset > '-1'",
        }
    }
}

/// Options for opening a receiver link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Source filter, if any.
    pub selector: Option<String>,
}

/// Routing metadata carried by a `amqp:link:redirect` detach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    /// `"<scheme>://<host>:<port>/<group>/"`.
    pub address: String,
    pub hostname: String,
}

/// Errors reported by a [`Transport`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote detached the link with a redirect condition.
    #[error("link redirected to {} ({})", .0.hostname, .0.address)]
    Redirect(RedirectInfo),

    /// The remote rejected an operation (e.g. `amqp:unauthorized-access`).
    #[error("{condition}: {description}")]
    Remote {
        condition: String,
        description: String,
    },

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Other(BoxError),
}

/// Dials connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a TLS connection to `address` (`amqps://<host>`).
    async fn dial(&self, address: &str, auth: Auth) -> Result<Box<dyn Connection>, TransportError>;
}

/// An established connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn session(&self) -> Result<Box<dyn Session>, TransportError>;

    /// Claims-based authorisation: submit `token` for `audience`.
    async fn put_token(&self, audience: &str, token: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn sender(&self, target: &str) -> Result<Box<dyn SenderLink>, TransportError>;

    async fn receiver(
        &self,
        source: &str,
        options: ReceiverOptions,
    ) -> Result<Box<dyn ReceiverLink>, TransportError>;

    /// Partition ids of the event hub `entity`, read from its management node.
    async fn partition_ids(&self, entity: &str) -> Result<Vec<String>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait SenderLink: Send + Sync {
    async fn send(&self, msg: WireMessage) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ReceiverLink: Send {
    /// Wait for the next delivery. Cancel-safe: dropping the future loses no
    /// message.
    async fn receive(&mut self) -> Result<WireMessage, TransportError>;

    /// Settle a delivery as accepted.
    async fn accept(&mut self, msg: &WireMessage) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
