//! The service client: connection lifecycle, cloud-to-device send, event and
//! feedback subscriptions, and REST delegation.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::{ConnState, PrimaryConnection, close_quietly, step};
use crate::error::{Error, Result};
use crate::protocol::{address, encode_message};
use crate::redirect;
use crate::rest::RestClient;
use crate::subscribe::{self, Dispatcher, PartitionConsumer};
use crate::transport::{ReceiverOptions, Transport};
use crate::types::{CallOptions, Device, Feedback, Message, MethodResponse, SendOptions, Twin};

/// Client for the service side of an IoT hub.
///
/// Sending and feedback need [`connect`](Self::connect) first. Event
/// subscriptions open their own connection to the redirected event endpoint,
/// and REST calls need no connection at all.
pub struct ServiceClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    rest: RestClient,
    state: Mutex<ConnState>,
}

impl ServiceClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let rest = RestClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            transport,
            rest,
            state: Mutex::new(ConnState::Disconnected),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The REST channel used by [`call`](Self::call) and the registry methods.
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the primary connection. Calling it again replaces the current
    /// connection once the new one is up; the old one keeps serving until
    /// then.
    pub async fn connect(&self) -> Result<()> {
        self.state().begin_connect()?;
        let mut pending = PendingConnect { client: self, armed: true };

        let opened = PrimaryConnection::open(self.transport.as_ref(), &self.config).await;
        pending.armed = false;

        let opened = match opened {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                let _ = self.state().finish_connect(Err(()));
                return Err(e);
            }
        };
        let (to_close, result) = self.state().finish_connect(Ok(opened));
        if let Some(stale) = to_close
            && let Err(e) = stale.close().await
        {
            debug!("closing replaced connection: {e}");
        }
        result
    }

    /// True while a primary connection is open and its token is current.
    pub fn is_connected(&self) -> bool {
        let current = self.state().current();
        current.is_ok_and(|conn| !conn.done().is_cancelled())
    }

    /// Send `payload` to the device's cloud-to-device queue.
    ///
    /// Firing `cancel` abandons the send with [`Error::Cancelled`]; the
    /// sender link is closed either way.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        payload: &[u8],
        options: &SendOptions,
    ) -> Result<()> {
        if device_id.is_empty() {
            return Err(Error::InvalidArgument("device id is empty".into()));
        }
        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload is empty".into()));
        }
        options.validate()?;

        let conn = self.state().current()?;
        let session = conn.session()?;

        let mut msg = Message {
            payload: payload.to_vec(),
            to: Some(address::device_inbox(device_id)),
            ..Message::default()
        };
        options.apply(&mut msg);

        let sender = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = session.sender(address::DEVICEBOUND) => r?,
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = sender.send(encode_message(&msg)) => r.map_err(Error::from),
        };
        if let Err(e) = sender.close().await {
            debug!("closing sender link: {e}");
        }
        sent?;
        debug!(device_id, bytes = payload.len(), "message sent");
        Ok(())
    }

    /// Receive device-to-cloud events from every partition and hand each one
    /// to `handler` on its own task. Blocks until `cancel` fires or a
    /// partition fails, and always returns the reason as an error.
    pub async fn subscribe_events<F, Fut>(&self, cancel: &CancellationToken, handler: F) -> Result<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.state().is_closed() {
            return Err(Error::Closed);
        }
        let (conn, target) =
            redirect::resolve(self.transport.as_ref(), &self.config, cancel).await?;

        let reason = match step("open session", self.config.timing.connect_timeout, conn.session()).await
        {
            Ok(session) => {
                let consumer = PartitionConsumer {
                    target: &target,
                    consumer_group: &self.config.consumer_group,
                    position: self.config.event_position,
                };
                let reason = subscribe::receive_events(
                    session.as_ref(),
                    consumer,
                    cancel,
                    Arc::new(handler),
                    Dispatcher::new(self.config.callback_concurrency),
                )
                .await;
                if let Err(e) = session.close().await {
                    debug!("closing event session: {e}");
                }
                reason
            }
            Err(e) => e,
        };
        close_quietly(conn.as_ref()).await;
        info!(group = %target.group, "event subscription ended: {reason}");
        Err(reason)
    }

    /// Receive delivery feedback on the primary connection and hand each
    /// record to `handler` on its own task. Blocks until `cancel` fires, the
    /// connection goes away, or the link fails, and always returns the
    /// reason as an error.
    pub async fn subscribe_feedback<F, Fut>(
        &self,
        cancel: &CancellationToken,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Feedback) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let conn = self.state().current()?;
        let receiver = conn
            .session()?
            .receiver(address::FEEDBACK, ReceiverOptions::default())
            .await?;
        let reason = subscribe::receive_feedback(
            receiver,
            cancel,
            conn.done(),
            &handler,
            &Dispatcher::new(self.config.callback_concurrency),
        )
        .await;
        Err(reason)
    }

    /// Invoke a direct method. See [`RestClient::call`].
    pub async fn call(
        &self,
        device_id: &str,
        method_name: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
        options: &CallOptions,
    ) -> Result<MethodResponse> {
        self.rest.call(device_id, method_name, payload, options).await
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Device> {
        self.rest.get_device(device_id).await
    }

    pub async fn update_twin(
        &self,
        device_id: &str,
        desired: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Twin> {
        self.rest.update_twin(device_id, desired).await
    }

    /// Close the primary connection. Later calls are no-ops; every other
    /// operation except REST fails with [`Error::Closed`] afterwards.
    pub async fn close(&self) -> Result<()> {
        let conn = self.state().close();
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

/// Rolls the state back if a `connect` future is dropped mid-flight.
struct PendingConnect<'a> {
    client: &'a ServiceClient,
    armed: bool,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.client.state().finish_connect(Err(()));
        }
    }
}
