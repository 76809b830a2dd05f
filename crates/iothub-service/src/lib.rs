//! Service-side client for Azure IoT Hub.
//!
//! Covers the back-end half of the hub:
//! - cloud-to-device messages, with optional delivery feedback
//! - device-to-cloud events, read from the event endpoint the hub redirects to
//! - direct method calls and registry reads/writes over REST
//!
//! The messaging protocol is abstracted behind [`Transport`]; tokens are
//! minted by a caller-supplied [`TokenSource`]. The primary connection
//! re-submits a fresh token in the background for as long as it is open.
//!
//! # Example
//! ```no_run
//! # async fn example(
//! #     transport: std::sync::Arc<dyn iothub_service::Transport>,
//! #     tokens: std::sync::Arc<dyn iothub_service::TokenSource>,
//! # ) -> Result<(), iothub_service::Error> {
//! use iothub_service::{ClientConfig, SendOptions, ServiceClient};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig::from_env(tokens)?;
//! let client = ServiceClient::new(config, transport)?;
//! client.connect().await?;
//!
//! let mut opts = SendOptions::default();
//! opts.set_ack("full")?;
//! let cancel = CancellationToken::new();
//! client.send(&cancel, "my-device", b"hello", &opts).await?;
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod credentials;
mod error;
pub mod protocol;
mod redirect;
mod rest;
mod subscribe;
pub mod transport;
mod types;

pub use client::ServiceClient;
pub use config::{CONNECTION_STRING_ENV, ClientConfig, TimingConfig};
pub use credentials::{Credentials, DEFAULT_API_VERSION, TokenSource};
pub use error::{BoxError, Error, Result};
pub use protocol::{WireMessage, WireValue};
pub use rest::RestClient;
pub use transport::{
    Auth, Connection, EventPosition, ReceiverLink, ReceiverOptions, RedirectInfo, SenderLink,
    Session, Transport, TransportError,
};
pub use types::{
    ACK_PROPERTY, AckType, CallOptions, Device, DeviceAuthentication, Feedback, Message,
    MethodResponse, SendOptions, Twin, TwinProperties, X509Thumbprint,
};
