use std::sync::Arc;

use messagebus_proto::Message;
use thiserror::Error;

mod local;

pub use local::{LocalBus, Responder};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("messagebus session is not connected")]
    NotConnected,
    #[error("messagebus channel closed")]
    Closed,
    #[error("messagebus transport error: {0}")]
    Transport(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Receives every inbound message, invoked from the transport's delivery
/// thread. Implementations must return quickly.
pub trait MessageListener: Send + Sync {
    fn message_received(&self, message: &Message);
}

/// A duplex messagebus session owned by someone else.
///
/// Listeners registered on an already connected session get the session's
/// most recent `channel_subscription_event` replayed, so a late listener can
/// still learn that the server acknowledged the session.
pub trait Transport: Send + Sync {
    fn connect(&self) -> TransportResult<()>;
    fn disconnect(&self) -> TransportResult<()>;
    fn is_connected(&self) -> bool;
    /// Fire-and-forget.
    fn send_message(&self, message: &Message) -> TransportResult<()>;
    fn register_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId;
    fn unregister_listener(&self, id: ListenerId);
    fn listener_count(&self) -> usize;
}
