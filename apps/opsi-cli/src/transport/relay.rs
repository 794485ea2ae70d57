use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use messagebus_proto::{Message, MessageKind};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use transport_bus::{ListenerId, MessageListener, Transport, TransportError, TransportResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static RUNTIME: Lazy<io::Result<Runtime>> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("relay-io")
        .enable_all()
        .build()
});

fn runtime() -> TransportResult<&'static Runtime> {
    RUNTIME
        .as_ref()
        .map_err(|err| TransportError::Transport(format!("failed to start io runtime: {err}")))
}

struct Delivery {
    only: Option<ListenerId>,
    message: Message,
}

struct Link {
    outbound: tokio_mpsc::UnboundedSender<String>,
    inbound: Sender<Delivery>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn MessageListener>)>>,
    next_listener: AtomicU64,
    link: Mutex<Option<Link>>,
    last_subscription: Mutex<Option<Message>>,
}

/// Newline-delimited JSON messages over TCP to a messagebus relay.
pub struct RelayTransport {
    address: String,
    inner: Arc<Inner>,
}

impl RelayTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

fn spawn_delivery(inner: Arc<Inner>, receiver: Receiver<Delivery>) -> io::Result<()> {
    thread::Builder::new()
        .name("relay-delivery".into())
        .spawn(move || {
            while let Ok(delivery) = receiver.recv() {
                if delivery.only.is_none()
                    && delivery.message.kind() == MessageKind::ChannelSubscriptionEvent
                {
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
            debug!(target: "transport::relay", "delivery thread finished");
        })?;
    Ok(())
}

async fn read_messages(reader: tokio::net::tcp::OwnedReadHalf, inbound: Sender<Delivery>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<Message>(&line) {
                Ok(message) => {
                    trace!(target: "transport::relay", kind = message.kind().as_str(), "message received");
                    if inbound.send(Delivery { only: None, message }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(target: "transport::relay", error = %err, "dropping undecodable message");
                }
            },
            Ok(None) => {
                info!(target: "transport::relay", "relay closed the connection");
                break;
            }
            Err(err) => {
                warn!(target: "transport::relay", error = %err, "relay read failed");
                break;
            }
        }
    }
}

async fn write_messages(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: tokio_mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = outbound.recv().await {
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            warn!(target: "transport::relay", error = %err, "relay write failed");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

impl Transport for RelayTransport {
    fn connect(&self) -> TransportResult<()> {
        let mut link = self.inner.link.lock();
        if link.is_some() {
            return Ok(());
        }
        let runtime = runtime()?;
        let stream = runtime
            .block_on(async {
                tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address)).await
            })
            .map_err(|_| TransportError::Transport(format!("timed out connecting to {}", self.address)))?
            .map_err(|err| {
                TransportError::Transport(format!("failed to connect to {}: {err}", self.address))
            })?;
        let (reader, writer) = stream.into_split();

        let (inbound, deliveries) = crossbeam_channel::unbounded();
        spawn_delivery(Arc::clone(&self.inner), deliveries)
            .map_err(|err| TransportError::Transport(format!("failed to spawn delivery thread: {err}")))?;
        let (outbound, outbound_rx) = tokio_mpsc::unbounded_channel();
        let reader = runtime.spawn(read_messages(reader, inbound.clone()));
        // Ends on its own once the outbound sender is dropped, after flushing.
        runtime.spawn(write_messages(writer, outbound_rx));

        *self.inner.last_subscription.lock() = None;
        *link = Some(Link {
            outbound,
            inbound,
            reader,
        });
        info!(target: "transport::relay", address = %self.address, "connected to messagebus relay");
        Ok(())
    }

    fn disconnect(&self) -> TransportResult<()> {
        let Some(link) = self.inner.link.lock().take() else {
            return Ok(());
        };
        link.reader.abort();
        *self.inner.last_subscription.lock() = None;
        debug!(target: "transport::relay", address = %self.address, "disconnected from messagebus relay");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    fn send_message(&self, message: &Message) -> TransportResult<()> {
        let mut line = serde_json::to_string(message)
            .map_err(|err| TransportError::Transport(format!("failed to encode message: {err}")))?;
        line.push('\n');
        let link = self.inner.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        trace!(target: "transport::relay", kind = message.kind().as_str(), channel = %message.channel, "sending message");
        link.outbound.send(line).map_err(|_| TransportError::Closed)
    }

    fn register_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        let replay = self.inner.last_subscription.lock().clone();
        if let (Some(event), Some(link)) = (replay, self.inner.link.lock().as_ref()) {
            let _ = link.inbound.send(Delivery {
                only: Some(id),
                message: event,
            });
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

#[cfg(test)]
mod tests {
    use super::*;
    use messagebus_proto::{MessageBody, SubscriptionOperation};
    use parking_lot::Condvar;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        arrived: Condvar,
    }

    impl Recorder {
        fn wait_len(&self, len: usize) -> Vec<Message> {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut messages = self.messages.lock();
            while messages.len() < len {
                if self.arrived.wait_until(&mut messages, deadline).timed_out() {
                    break;
                }
            }
            messages.clone()
        }
    }

    impl MessageListener for Recorder {
        fn message_received(&self, message: &Message) {
            self.messages.lock().push(message.clone());
            self.arrived.notify_all();
        }
    }

    fn subscription_event() -> Message {
        Message::new(
            "@",
            MessageBody::ChannelSubscriptionEvent {
                subscribed_channels: vec!["session:abc".into()],
                error: None,
            },
        )
        .with_sender("service:messagebus")
    }

    #[test_timeout::timeout]
    fn relay_round_trip_and_replay() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let (received_tx, received_rx) = mpsc::channel();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut event = serde_json::to_string(&subscription_event()).expect("encode");
            event.push('\n');
            stream.write_all(b"not json\n").expect("write");
            stream.write_all(event.as_bytes()).expect("write");
            let mut line = String::new();
            StdBufReader::new(stream).read_line(&mut line).expect("read");
            received_tx.send(line).expect("report");
        });

        let transport = RelayTransport::new(address);
        let first = Arc::new(Recorder::default());
        transport.register_listener(first.clone());
        transport.connect().expect("connect");
        assert!(transport.is_connected());

        let seen = first.wait_len(1);
        assert_eq!(seen[0].kind(), MessageKind::ChannelSubscriptionEvent);

        let late = Arc::new(Recorder::default());
        transport.register_listener(late.clone());
        assert_eq!(late.wait_len(1)[0].id, seen[0].id);
        assert_eq!(first.wait_len(1).len(), 1);

        let request = Message::new(
            "service:messagebus",
            MessageBody::ChannelSubscriptionRequest {
                operation: SubscriptionOperation::Add,
                channels: vec!["event:host_connected".into()],
            },
        );
        transport.send_message(&request).expect("send");
        let line = received_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server got a line");
        let echoed: Message = serde_json::from_str(line.trim_end()).expect("decode");
        assert_eq!(echoed, request);

        transport.disconnect().expect("disconnect");
        assert!(!transport.is_connected());
        server.join().expect("server thread");
    }

    #[test]
    fn send_requires_connection() {
        let transport = RelayTransport::new("127.0.0.1:1");
        let message = Message::new("service:messagebus", subscription_event().body);
        assert!(matches!(
            transport.send_message(&message),
            Err(TransportError::NotConnected)
        ));
    }

    #[test_timeout::timeout]
    fn connect_reports_unreachable_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);
        let transport = RelayTransport::new(address);
        assert!(matches!(transport.connect(), Err(TransportError::Transport(_))));
        assert!(!transport.is_connected());
    }
}
