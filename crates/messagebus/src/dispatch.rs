use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use messagebus_proto::{Message, MessageKind};
use parking_lot::RwLock;
use tracing::{debug, error};
use transport_bus::MessageListener;

use crate::error::HandlerFault;

/// Reacts to one kind of inbound message on the delivery thread.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Result<(), HandlerFault>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), HandlerFault> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerFault> {
        self(message)
    }
}

type HandlerTable = HashMap<MessageKind, Vec<(u64, Arc<dyn MessageHandler>)>>;

/// Routes inbound messages to the handlers registered for their kind.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HandlerTable>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use = "the handler is removed when the registration is dropped"]
    pub fn register<F>(self: &Arc<Self>, kind: MessageKind, handler: F) -> HandlerRegistration
    where
        F: Fn(&Message) -> Result<(), HandlerFault> + Send + Sync + 'static,
    {
        self.register_handler(kind, Arc::new(handler))
    }

    #[must_use = "the handler is removed when the registration is dropped"]
    pub fn register_handler(
        self: &Arc<Self>,
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    ) -> HandlerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        HandlerRegistration {
            dispatcher: Arc::downgrade(self),
            kind,
            id,
        }
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, message: &Message) {
        let kind = message.kind();
        debug!(
            target: "messagebus::dispatch",
            kind = %kind,
            channel = %message.channel,
            sender = %message.sender,
            id = %message.id,
            "message received"
        );
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(target: "messagebus::dispatch", kind = %kind, "no handler registered, dropping");
            return;
        }
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
                Ok(Ok(())) => {}
                Ok(Err(fault)) => {
                    error!(target: "messagebus::dispatch", kind = %kind, error = %fault, "message handler failed");
                }
                Err(payload) => {
                    error!(
                        target: "messagebus::dispatch",
                        kind = %kind,
                        panic = %panic_message(payload.as_ref()),
                        "message handler panicked"
                    );
                }
            }
        }
    }

    fn remove(&self, kind: MessageKind, id: u64) {
        let mut handlers = self.handlers.write();
        if let Some(entries) = handlers.get_mut(&kind) {
            entries.retain(|(entry, _)| *entry != id);
            if entries.is_empty() {
                handlers.remove(&kind);
            }
        }
    }
}

impl MessageListener for Dispatcher {
    fn message_received(&self, message: &Message) {
        self.dispatch(message);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Keeps a handler installed; dropping it removes the handler.
pub struct HandlerRegistration {
    dispatcher: Weak<Dispatcher>,
    kind: MessageKind,
    id: u64,
}

impl HandlerRegistration {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(self.kind, self.id);
        }
    }
}
