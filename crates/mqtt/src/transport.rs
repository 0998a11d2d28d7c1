//! One MQTT session over `rumqttc`, driven by a task on a tokio runtime.
//!
//! Every request method returns immediately: requests are queued with the
//! client's non-blocking `try_*` calls and their outcome is reported later
//! through [`TransportCallbacks`] or the request's [`AckHandler`]. Callbacks
//! run on the driver task and must not block.
//!
//! A connection is never re-established automatically. When it ends, the
//! session reports it once and stays down until `connect` or `reconnect` is
//! called again.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, SubscribeReasonCode};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use validator::Validate;

use super::{
    acks::{AckHandler, AckKind, AckTracker},
    client::{ClientAuth, ClientBuilder},
    config::Config,
    error::TransferError,
    TransportParams,
};

/// Notifications from the driver task.
#[derive(Clone)]
pub struct TransportCallbacks {
    /// CONNACK accepted.
    pub on_connected: Arc<dyn Fn() + Send + Sync + 'static>,
    /// The connection attempt ended before CONNACK.
    pub on_connection_failure: Arc<dyn Fn(TransferError) + Send + Sync + 'static>,
    /// An established connection ended. `None` after a requested disconnect.
    pub on_disconnected: Arc<dyn Fn(Option<TransferError>) + Send + Sync + 'static>,
    pub on_message: Arc<dyn Fn(String, Bytes) + Send + Sync + 'static>,
}

/// State shared with the driver task.
struct Shared {
    connected: AtomicBool,
    /// Set by `disconnect`; a cancelled or failed attempt then ends as a
    /// requested disconnect.
    disconnect_requested: AtomicBool,
    /// The driver has returned and will report nothing more.
    ended: AtomicBool,
    acks: Mutex<AckTracker>,
}

impl Shared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            acks: Mutex::new(AckTracker::default()),
        }
    }

    /// Marks the driver as finished and fails whatever is still awaiting an
    /// ack. Returns whether the connection had been established.
    fn finish(&self) -> bool {
        self.ended.store(true, Ordering::Release);
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.acks().fail_all();
        was_connected
    }

    fn acks(&self) -> MutexGuard<'_, AckTracker> {
        match self.acks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Connection {
    client: AsyncClient,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Stops the driver without reporting a disconnect.
    fn abort(self) {
        self.shared.disconnect_requested.store(false, Ordering::Release);
        self.cancel.cancel();
        self.shared.acks().fail_all();
        drop(self.task);
    }
}

pub struct MqttTransport {
    config: Config,
    params: TransportParams,
    callbacks: TransportCallbacks,
    runtime: Handle,
    client_auth: Option<ClientAuth>,
    connection: Option<Connection>,
}

impl MqttTransport {
    /// Creates an idle session. Nothing touches the network until `connect`.
    pub fn new(
        config: Config,
        params: TransportParams,
        callbacks: TransportCallbacks,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            params,
            callbacks,
            runtime,
            client_auth: None,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.shared.connected.load(Ordering::Acquire))
    }

    /// Starts connecting, replacing any existing connection without
    /// reporting its end.
    pub fn connect(
        &mut self,
        password: Option<&str>,
        client_auth: Option<ClientAuth>,
    ) -> Result<(), TransferError> {
        self.client_auth = client_auth;
        self.start(password)
    }

    /// Connects again with a new password, keeping the client certificate of
    /// the last `connect`.
    pub fn reconnect(&mut self, password: Option<&str>) -> Result<(), TransferError> {
        self.start(password)
    }

    fn start(&mut self, password: Option<&str>) -> Result<(), TransferError> {
        if let Some(previous) = self.connection.take() {
            debug!("Dropping previous connection to {}", self.params.hostname);
            previous.abort();
        }

        self.config.validate()?;
        let (client, event_loop) = ClientBuilder::new(&self.config, &self.params)
            .password(password.map(str::to_owned))
            .client_auth(self.client_auth.clone())
            .build()?;

        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared::new());
        let task = self.runtime.spawn(drive(
            event_loop,
            cancel.clone(),
            Arc::clone(&shared),
            self.callbacks.clone(),
        ));

        info!(
            "Connecting to {}:{} as {}",
            self.params.hostname, self.config.port, self.params.client_id
        );
        self.connection = Some(Connection {
            client,
            cancel,
            shared,
            task,
        });
        Ok(())
    }

    /// Sends DISCONNECT, or abandons an attempt still waiting for CONNACK.
    /// Either way `on_disconnected(None)` follows.
    pub fn disconnect(&mut self) -> Result<(), TransferError> {
        let connection = self.live()?;
        let shared = &connection.shared;
        shared.disconnect_requested.store(true, Ordering::Release);

        if !shared.connected.load(Ordering::Acquire) {
            debug!("Abandoning connection attempt to {}", self.params.hostname);
            connection.cancel.cancel();
            return Ok(());
        }
        if let Err(e) = connection.client.try_disconnect() {
            shared.disconnect_requested.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// The current connection, unless its driver has already finished.
    fn live(&self) -> Result<&Connection, TransferError> {
        match &self.connection {
            Some(c) if !c.shared.ended.load(Ordering::Acquire) && !c.task.is_finished() => Ok(c),
            _ => Err(TransferError::NotConnected),
        }
    }

    pub fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        on_ack: AckHandler,
    ) -> Result<(), TransferError> {
        let qos = self.config.qos();
        self.request(AckKind::Publish, on_ack, |client| {
            client.try_publish(topic, qos, false, payload.to_vec())
        })
    }

    pub fn subscribe(&mut self, topic: &str, on_ack: AckHandler) -> Result<(), TransferError> {
        let qos = self.config.qos();
        self.request(AckKind::Subscribe, on_ack, |client| {
            client.try_subscribe(topic, qos)
        })
    }

    pub fn unsubscribe(&mut self, topic: &str, on_ack: AckHandler) -> Result<(), TransferError> {
        self.request(AckKind::Unsubscribe, on_ack, |client| {
            client.try_unsubscribe(topic)
        })
    }

    /// Queues a request whose ack is tracked. The handler is registered
    /// before the request so the driver cannot see the packet first.
    fn request<F>(&mut self, kind: AckKind, on_ack: AckHandler, send: F) -> Result<(), TransferError>
    where
        F: FnOnce(&AsyncClient) -> Result<(), rumqttc::ClientError>,
    {
        let connection = self.live()?;
        if !connection.shared.connected.load(Ordering::Acquire) {
            return Err(TransferError::NotConnected);
        }

        let mut acks = connection.shared.acks();
        acks.enqueue(kind, on_ack);
        if let Err(e) = send(&connection.client) {
            // Dropped without being called: the error is returned instead.
            drop(acks.withdraw_last(kind));
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

/// Polls the event loop until the connection ends or `cancel` fires.
async fn drive(
    mut event_loop: EventLoop,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    callbacks: TransportCallbacks,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                let requested = shared.disconnect_requested.swap(false, Ordering::AcqRel);
                shared.finish();
                if requested {
                    info!("Connection attempt abandoned by disconnect");
                    (callbacks.on_disconnected)(None);
                } else {
                    debug!("Connection driver cancelled");
                }
                return;
            }
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(packet)) => handle_incoming(packet, &shared, &callbacks),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected by request");
                shared.finish();
                (callbacks.on_disconnected)(None);
                return;
            }
            Ok(Event::Outgoing(outgoing)) => handle_outgoing(outgoing, &shared),
            Err(e) => {
                let was_connected = shared.finish();
                if was_connected {
                    warn!("Connection lost: {}", e);
                    (callbacks.on_disconnected)(Some(e.into()));
                } else if shared.disconnect_requested.load(Ordering::Acquire) {
                    info!("Connection attempt ended after disconnect: {}", e);
                    (callbacks.on_disconnected)(None);
                } else {
                    warn!("Connection attempt failed: {}", e);
                    (callbacks.on_connection_failure)(e.into());
                }
                return;
            }
        }
    }
}

fn handle_incoming(packet: Packet, shared: &Shared, callbacks: &TransportCallbacks) {
    match packet {
        Packet::ConnAck(conn_ack) if conn_ack.code == ConnectReturnCode::Success => {
            info!("Connection established successfully.");
            shared.connected.store(true, Ordering::Release);
            (callbacks.on_connected)();
        }
        Packet::Publish(publish) => {
            trace!("Received publish on topic {}", publish.topic);
            (callbacks.on_message)(publish.topic, publish.payload);
        }
        Packet::PubAck(ack) => {
            shared.acks().acknowledged(AckKind::Publish, ack.pkid, Ok(()));
        }
        Packet::PubComp(comp) => {
            shared.acks().acknowledged(AckKind::Publish, comp.pkid, Ok(()));
        }
        Packet::SubAck(ack) => {
            let outcome = if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                Err(TransferError::SubscriptionRejected(format!(
                    "packet id {}",
                    ack.pkid
                )))
            } else {
                Ok(())
            };
            shared.acks().acknowledged(AckKind::Subscribe, ack.pkid, outcome);
        }
        Packet::UnsubAck(ack) => {
            shared.acks().acknowledged(AckKind::Unsubscribe, ack.pkid, Ok(()));
        }
        Packet::Disconnect => {
            // The event loop reports the closed socket on the next poll.
            warn!("Disconnected by broker");
        }
        other => trace!("Incoming packet: {:?}", other),
    }
}

fn handle_outgoing(outgoing: Outgoing, shared: &Shared) {
    match outgoing {
        Outgoing::Publish(pkid) => shared.acks().sent(AckKind::Publish, pkid),
        Outgoing::Subscribe(pkid) => shared.acks().sent(AckKind::Subscribe, pkid),
        Outgoing::Unsubscribe(pkid) => shared.acks().sent(AckKind::Unsubscribe, pkid),
        other => trace!("Outgoing packet: {:?}", other),
    }
}
