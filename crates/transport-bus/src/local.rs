use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use messagebus_proto::{
    CONNECTION_USER_CHANNEL, MESSAGEBUS_SERVICE_CHANNEL, Message, MessageBody, MessageKind,
    SubscriptionOperation, session_channel,
};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{ListenerId, MessageListener, Transport, TransportError, TransportResult};

/// Turns a message sent by the client into the server's replies.
pub type Responder = Box<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

struct Delivery {
    generation: u64,
    only: Option<ListenerId>,
    message: Message,
}

#[derive(Default)]
struct Link {
    connected: bool,
    inbound: Option<Sender<Delivery>>,
    connects: usize,
    disconnects: usize,
}

struct Inner {
    session_id: String,
    announce_session: bool,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn MessageListener>)>>,
    next_listener: AtomicU64,
    generation: AtomicU64,
    link: Mutex<Link>,
    sent: Mutex<Vec<Message>>,
    sent_signal: Condvar,
    responder: RwLock<Option<Responder>>,
    server_channels: Mutex<BTreeSet<String>>,
    refused: Mutex<HashSet<String>>,
    last_subscription: Mutex<Option<Message>>,
}

/// In-process messagebus session for tests and non-network contexts.
///
/// Messages handed to [`LocalBus::deliver`] (and replies produced by the
/// responder) reach listeners on a dedicated delivery thread, the same
/// two-thread shape a network session has. Channel subscription requests are
/// acknowledged the way the server does it: by echoing the full subscribed
/// channel list.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A session whose server never acknowledges the connection itself.
    pub fn without_session_ack() -> Self {
        Self::build(false)
    }

    fn build(announce_session: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id: Uuid::new_v4().to_string(),
                announce_session,
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                link: Mutex::new(Link::default()),
                sent: Mutex::new(Vec::new()),
                sent_signal: Condvar::new(),
                responder: RwLock::new(None),
                server_channels: Mutex::new(BTreeSet::new()),
                refused: Mutex::new(HashSet::new()),
                last_subscription: Mutex::new(None),
            }),
        }
    }

    pub fn session_channel(&self) -> String {
        session_channel(&self.inner.session_id)
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        *self.inner.responder.write() = Some(Box::new(responder));
    }

    /// Subscription requests for `channel` are silently ignored.
    pub fn refuse_channel(&self, channel: impl Into<String>) {
        self.inner.refused.lock().insert(channel.into());
    }

    pub fn allow_channel(&self, channel: &str) {
        self.inner.refused.lock().remove(channel);
    }

    /// Queues `message` for the delivery thread.
    pub fn deliver(&self, message: Message) -> TransportResult<()> {
        self.enqueue(None, message)
    }

    pub fn sent(&self) -> Vec<Message> {
        self.inner.sent.lock().clone()
    }

    pub fn sent_of_kind(&self, kind: MessageKind) -> Vec<Message> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter(|message| message.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner.sent.lock().clear();
    }

    /// Blocks until a sent message satisfies `predicate` or `timeout` elapses.
    pub fn wait_for_sent<P>(&self, timeout: Duration, predicate: P) -> Option<Message>
    where
        P: Fn(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut sent = self.inner.sent.lock();
        loop {
            if let Some(found) = sent.iter().find(|message| predicate(message)) {
                return Some(found.clone());
            }
            if self
                .inner
                .sent_signal
                .wait_until(&mut sent, deadline)
                .timed_out()
            {
                return sent.iter().find(|message| predicate(message)).cloned();
            }
        }
    }

    pub fn connect_count(&self) -> usize {
        self.inner.link.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.link.lock().disconnects
    }

    /// Channels the simulated server currently has this session subscribed to.
    pub fn server_channels(&self) -> BTreeSet<String> {
        self.inner.server_channels.lock().clone()
    }

    fn enqueue(&self, only: Option<ListenerId>, message: Message) -> TransportResult<()> {
        let link = self.inner.link.lock();
        let Some(inbound) = link.inbound.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        inbound
            .send(Delivery {
                generation: self.inner.generation.load(Ordering::SeqCst),
                only,
                message,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn subscription_event(&self) -> Message {
        let channels = self.inner.server_channels.lock().iter().cloned().collect();
        Message::new(
            CONNECTION_USER_CHANNEL,
            MessageBody::ChannelSubscriptionEvent {
                subscribed_channels: channels,
                error: None,
            },
        )
        .with_sender(MESSAGEBUS_SERVICE_CHANNEL)
    }

    fn handle_subscription_request(
        &self,
        operation: SubscriptionOperation,
        channels: &[String],
    ) -> Option<Message> {
        let refused = self.inner.refused.lock();
        let accepted: Vec<&String> = channels
            .iter()
            .filter(|channel| !refused.contains(channel.as_str()))
            .collect();
        drop(refused);
        if accepted.is_empty() && !channels.is_empty() {
            debug!(target: "transport::local", ?channels, "subscription request ignored");
            return None;
        }
        {
            let mut server_channels = self.inner.server_channels.lock();
            match operation {
                SubscriptionOperation::Set => {
                    server_channels.clear();
                    server_channels.insert(self.session_channel());
                    server_channels.extend(accepted.into_iter().cloned());
                }
                SubscriptionOperation::Add => {
                    server_channels.extend(accepted.into_iter().cloned());
                }
                SubscriptionOperation::Remove => {
                    for channel in accepted {
                        server_channels.remove(channel);
                    }
                }
            }
        }
        Some(self.subscription_event())
    }

    fn spawn_delivery(&self, receiver: Receiver<Delivery>, generation: u64) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("local-bus-delivery".into())
            .spawn(move || {
                while let Ok(delivery) = receiver.recv() {
                    if delivery.generation != generation
                        || inner.generation.load(Ordering::SeqCst) != generation
                    {
                        trace!(target: "transport::local", "dropping delivery from stale session");
                        continue;
                    }
                    if delivery.message.kind() == MessageKind::ChannelSubscriptionEvent {
                        *inner.last_subscription.lock() = Some(delivery.message.clone());
                    }
                    let listeners: Vec<Arc<dyn MessageListener>> = inner
                        .listeners
                        .read()
                        .iter()
                        .filter(|(id, _)| delivery.only.map_or(true, |only| only == *id))
                        .map(|(_, listener)| Arc::clone(listener))
                        .collect();
                    for listener in listeners {
                        listener.message_received(&delivery.message);
                    }
                }
            });
        if let Err(err) = spawned {
            debug!(target: "transport::local", error = %err, "failed to spawn delivery thread");
        }
    }
}

impl Transport for LocalBus {
    fn connect(&self) -> TransportResult<()> {
        let generation = {
            let mut link = self.inner.link.lock();
            if link.connected {
                return Ok(());
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (sender, receiver) = crossbeam_channel::unbounded();
            link.connected = true;
            link.connects += 1;
            link.inbound = Some(sender);
            self.spawn_delivery(receiver, generation);
            generation
        };
        {
            let mut server_channels = self.inner.server_channels.lock();
            server_channels.clear();
            server_channels.insert(self.session_channel());
        }
        *self.inner.last_subscription.lock() = None;
        debug!(target: "transport::local", generation, "local session connected");
        if self.inner.announce_session {
            self.deliver(self.subscription_event())?;
        }
        Ok(())
    }

    fn disconnect(&self) -> TransportResult<()> {
        let mut link = self.inner.link.lock();
        if !link.connected {
            return Ok(());
        }
        link.connected = false;
        link.disconnects += 1;
        link.inbound = None;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.server_channels.lock().clear();
        *self.inner.last_subscription.lock() = None;
        debug!(target: "transport::local", "local session disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.link.lock().connected
    }

    fn send_message(&self, message: &Message) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        {
            let mut sent = self.inner.sent.lock();
            sent.push(message.clone());
            self.inner.sent_signal.notify_all();
        }

        let mut replies = Vec::new();
        if let MessageBody::ChannelSubscriptionRequest {
            operation,
            channels,
        } = &message.body
        {
            if message.channel == MESSAGEBUS_SERVICE_CHANNEL {
                replies.extend(self.handle_subscription_request(*operation, channels));
            }
        }
        if let Some(responder) = self.inner.responder.read().as_ref() {
            replies.extend(responder(message));
        }
        for reply in replies {
            self.deliver(reply)?;
        }
        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        let replay = self.inner.last_subscription.lock().clone();
        if let Some(event) = replay {
            let _ = self.enqueue(Some(id), event);
        }
        id
    }

    fn unregister_listener(&self, id: ListenerId) {
        self.inner
            .listeners
            .write()
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}
