use std::ops::Deref;
use std::sync::Arc;

use messagebus_proto::{
    MESSAGEBUS_SERVICE_CHANNEL, Message, MessageBody, MessageKind, SubscriptionOperation,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use transport_bus::{ListenerId, MessageListener, Transport};

use crate::config::BusConfig;
use crate::dispatch::{Dispatcher, HandlerRegistration};
use crate::error::{BusError, BusResult};
use crate::registry::ChannelRegistry;
use crate::rpc::PendingRpc;

/// One client endpoint on a shared messagebus session.
///
/// Owns the channel registry, the dispatcher and the single pending JSONRPC
/// call. Higher level components register their handlers on
/// [`BusConnection::dispatcher`] and block on their own wait handles.
pub struct BusConnection {
    transport: Arc<dyn Transport>,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: BusConfig,
    listener: Mutex<Option<ListenerId>>,
    rpc: Arc<PendingRpc>,
    _subscriptions: HandlerRegistration,
    _responses: HandlerRegistration,
}

impl BusConnection {
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Arc<Self> {
        let registry = Arc::new(ChannelRegistry::new());
        let dispatcher = Dispatcher::new();
        let events = Arc::clone(&registry);
        let subscriptions =
            dispatcher.register(MessageKind::ChannelSubscriptionEvent, move |message: &Message| {
                if let MessageBody::ChannelSubscriptionEvent {
                    subscribed_channels,
                    error,
                } = &message.body
                {
                    if let Some(error) = error {
                        warn!(
                            target: "messagebus::registry",
                            error = %error.message,
                            "subscription event reported an error"
                        );
                    }
                    debug!(
                        target: "messagebus::registry",
                        channels = ?subscribed_channels,
                        "subscribed channels updated"
                    );
                    events.apply_event(subscribed_channels);
                }
                Ok(())
            });
        let rpc = Arc::new(PendingRpc::default());
        let sink = Arc::clone(&rpc);
        let responses = dispatcher.register(MessageKind::JsonrpcResponse, move |message: &Message| {
            sink.accept(message);
            Ok(())
        });
        Arc::new(Self {
            transport,
            registry,
            dispatcher,
            config,
            listener: Mutex::new(None),
            rpc,
            _subscriptions: subscriptions,
            _responses: responses,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub(crate) fn pending_rpc(&self) -> &PendingRpc {
        &self.rpc
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_open(&self) -> bool {
        self.listener.lock().is_some()
    }

    pub fn connect(&self) -> BusResult<()> {
        if !self.transport.is_connected() {
            info!(target: "messagebus::connection", "connecting to messagebus");
            self.transport.connect()?;
        }
        Ok(())
    }

    pub fn send_message(&self, message: &Message) -> BusResult<()> {
        debug!(
            target: "messagebus::connection",
            kind = %message.kind(),
            channel = %message.channel,
            id = %message.id,
            "sending message"
        );
        self.transport.send_message(message)?;
        Ok(())
    }

    /// Waits until the server lists `channel` among this session's
    /// subscriptions. Returns immediately if it already does.
    pub fn subscribe(&self, channel: &str) -> BusResult<()> {
        if self.registry.is_subscribed(channel) {
            return Ok(());
        }
        let pending = self.registry.begin_request(channel);
        let request = Message::new(
            MESSAGEBUS_SERVICE_CHANNEL,
            MessageBody::ChannelSubscriptionRequest {
                operation: SubscriptionOperation::Add,
                channels: vec![channel.to_string()],
            },
        );
        info!(target: "messagebus::connection", channel, "requesting access to channel");
        self.send_message(&request)?;
        if !pending.wait(self.config.subscription_timeout) {
            warn!(
                target: "messagebus::connection",
                channel,
                timeout = ?self.config.subscription_timeout,
                "channel subscription was not acknowledged"
            );
            return Err(BusError::Connection(format!(
                "failed to subscribe to channel {channel}"
            )));
        }
        debug!(target: "messagebus::connection", channel, "channel subscribed");
        Ok(())
    }

    /// Enters the connection scope: connect if needed, start receiving, and
    /// wait for the server to acknowledge this session.
    pub fn open(self: &Arc<Self>) -> BusResult<ConnectionScope> {
        {
            let mut listener = self.listener.lock();
            if listener.is_some() {
                return Err(BusError::InvalidArgument(
                    "connection scope is already open".into(),
                ));
            }
            self.registry.reset();
            let dispatcher: Arc<dyn MessageListener> = self.dispatcher.clone();
            *listener = Some(self.transport.register_listener(dispatcher));
        }
        let scope = ConnectionScope {
            connection: Arc::clone(self),
        };
        self.connect()?;
        if !self.registry.wait_initial(self.config.subscription_timeout) {
            warn!(
                target: "messagebus::connection",
                timeout = ?self.config.subscription_timeout,
                "no initial channel subscription event received"
            );
            return Err(BusError::Connection(
                "failed to subscribe to session channel".into(),
            ));
        }
        debug!(target: "messagebus::connection", "messagebus connection established");
        Ok(scope)
    }

    fn close(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.transport.unregister_listener(id);
        }
        self.registry.reset();
        if self.transport.listener_count() == 0 && self.transport.is_connected() {
            info!(target: "messagebus::connection", "disconnecting from messagebus");
            if let Err(err) = self.transport.disconnect() {
                warn!(target: "messagebus::connection", error = %err, "disconnect failed");
            }
        }
    }
}

/// Open connection. Dropping it stops delivery to this connection, clears
/// its subscription state and disconnects the session once nobody else
/// listens on it.
pub struct ConnectionScope {
    connection: Arc<BusConnection>,
}

impl ConnectionScope {
    pub fn connection(&self) -> &Arc<BusConnection> {
        &self.connection
    }
}

impl Deref for ConnectionScope {
    type Target = BusConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use transport_bus::LocalBus;

    fn quick() -> BusConfig {
        BusConfig::default().with_subscription_timeout(Duration::from_millis(200))
    }

    #[test_timeout::timeout]
    fn open_waits_for_session_acknowledgement() {
        let bus = LocalBus::new();
        let connection = BusConnection::new(Arc::new(bus.clone()), quick());
        let scope = connection.open().expect("open");
        assert!(scope.registry().is_subscribed(&bus.session_channel()));
        assert!(scope.is_open());
    }

    #[test_timeout::timeout]
    fn open_fails_without_acknowledgement_and_cleans_up() {
        let bus = LocalBus::without_session_ack();
        let connection = BusConnection::new(Arc::new(bus.clone()), quick());
        let started = Instant::now();
        let err = connection.open().err().expect("open must fail");
        assert!(err.is_connection());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!connection.is_open());
        assert_eq!(bus.listener_count(), 0);
        assert!(!bus.is_connected());
    }

    #[test_timeout::timeout]
    fn second_open_on_same_connection_is_rejected() {
        let bus = LocalBus::new();
        let connection = BusConnection::new(Arc::new(bus), quick());
        let _scope = connection.open().expect("open");
        assert!(matches!(
            connection.open(),
            Err(BusError::InvalidArgument(_))
        ));
    }
}
