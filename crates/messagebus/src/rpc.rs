use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use messagebus_proto::{Message, MessageBody};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::BusConnection;
use crate::error::{BusError, BusResult};
use crate::signal::WaitHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcFailure {
    /// The target answered with an error object.
    Remote(Value),
    /// Nothing arrived before the deadline.
    Timeout,
    /// The call was released without a usable answer.
    Lost,
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcFailure::Remote(error) => write!(f, "{}", remote_error_message(error)),
            RpcFailure::Timeout => f.write_str("timed out waiting for jsonrpc response"),
            RpcFailure::Lost => f.write_str("failed to receive jsonrpc response"),
        }
    }
}

/// Best human readable text of a JSONRPC error object.
pub fn remote_error_message(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

pub type RpcOutcome = Result<Value, RpcFailure>;

#[derive(Debug)]
enum Reply {
    Result(Value),
    Error(Value),
    Empty,
}

struct PendingCall {
    /// `(rpc_id, channel)` in request order.
    targets: Vec<(String, String)>,
    replies: HashMap<String, Reply>,
}

impl PendingCall {
    fn expects(&self, rpc_id: &str) -> bool {
        self.targets.iter().any(|(id, _)| id == rpc_id)
    }

    fn oldest_unanswered(&self) -> Option<String> {
        self.targets
            .iter()
            .map(|(id, _)| id)
            .find(|id| !self.replies.contains_key(*id))
            .cloned()
    }

    fn is_complete(&self) -> bool {
        self.replies.len() >= self.targets.len()
    }
}

/// The connection-wide pending call. Owned by [`BusConnection`] so every
/// correlator on one connection shares it.
#[derive(Default)]
pub(crate) struct PendingRpc {
    cell: Mutex<Option<PendingCall>>,
    done: WaitHandle,
}

impl PendingRpc {
    pub(crate) fn accept(&self, message: &Message) {
        let MessageBody::JsonrpcResponse {
            rpc_id,
            result,
            error,
        } = &message.body
        else {
            return;
        };
        let mut cell = self.cell.lock();
        let Some(call) = cell.as_mut() else {
            debug!(
                target: "messagebus::rpc",
                sender = %message.sender,
                "jsonrpc response without pending call, dropping"
            );
            return;
        };
        let target = match rpc_id {
            Some(id) if call.expects(id) && !call.replies.contains_key(id) => id.clone(),
            Some(id) => {
                warn!(target: "messagebus::rpc", rpc_id = %id, "dropping stale jsonrpc response");
                return;
            }
            None => match call.oldest_unanswered() {
                Some(id) => id,
                None => return,
            },
        };
        let reply = match (error, result) {
            (Some(error), _) if !error.is_null() => Reply::Error(error.clone()),
            (_, Some(result)) => Reply::Result(result.clone()),
            _ => Reply::Empty,
        };
        call.replies.insert(target, reply);
        if call.is_complete() {
            self.done.set();
        }
    }

    fn release(&self) -> Option<PendingCall> {
        let call = self.cell.lock().take();
        self.done.clear();
        call
    }
}

/// Clears the pending cell however the call ends.
struct ReleaseOnDrop<'a>(&'a PendingRpc);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// JSONRPC calls over one [`BusConnection`].
///
/// At most one logical call is in flight per connection, however many
/// correlators share it. A call may address several channels at once, which
/// is what fan-out builds on. Responses are matched on the generated
/// `rpc_id`; one without an id answers the oldest unanswered target.
pub struct RpcCorrelator {
    connection: Arc<BusConnection>,
}

impl RpcCorrelator {
    pub fn new(connection: Arc<BusConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<BusConnection> {
        &self.connection
    }

    fn pending(&self) -> &PendingRpc {
        self.connection.pending_rpc()
    }

    /// True while no call is pending on the underlying connection.
    pub fn is_idle(&self) -> bool {
        self.pending().cell.lock().is_none()
    }

    pub fn jsonrpc(&self, channel: &str, method: &str, params: Vec<Value>) -> BusResult<Value> {
        self.jsonrpc_with_timeout(channel, method, params, self.connection.config().jsonrpc_timeout)
    }

    pub fn jsonrpc_with_timeout(
        &self,
        channel: &str,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> BusResult<Value> {
        let mut outcomes = self.call_many(&[channel.to_string()], method, params, timeout)?;
        match outcomes.remove(channel) {
            Some(Ok(value)) => Ok(value),
            Some(Err(RpcFailure::Remote(error))) => Err(BusError::Remote {
                channel: channel.to_string(),
                error,
            }),
            Some(Err(RpcFailure::Timeout)) => Err(BusError::Timeout(format!(
                "no jsonrpc response from {channel} within {timeout:?}"
            ))),
            Some(Err(RpcFailure::Lost)) | None => Err(BusError::Connection(format!(
                "failed to receive jsonrpc response from {channel}"
            ))),
        }
    }

    /// Sends one request per channel and waits for all answers as a single
    /// logical call. The result is keyed by exactly the requested channels.
    pub fn call_many(
        &self,
        channels: &[String],
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> BusResult<BTreeMap<String, RpcOutcome>> {
        if channels.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = channels.iter().find(|channel| !seen.insert(channel.as_str())) {
            return Err(BusError::InvalidArgument(format!(
                "channel {duplicate} addressed more than once"
            )));
        }

        let requests: Vec<(String, Message)> = channels
            .iter()
            .map(|channel| {
                let body = MessageBody::jsonrpc_request(method, params.clone());
                let rpc_id = match &body {
                    MessageBody::JsonrpcRequest { rpc_id, .. } => rpc_id.clone(),
                    _ => String::new(),
                };
                (rpc_id, Message::new(channel.clone(), body))
            })
            .collect();
        let pending = self.pending();
        {
            let mut cell = pending.cell.lock();
            if cell.is_some() {
                return Err(BusError::RpcInFlight);
            }
            pending.done.clear();
            *cell = Some(PendingCall {
                targets: requests
                    .iter()
                    .map(|(rpc_id, message)| (rpc_id.clone(), message.channel.clone()))
                    .collect(),
                replies: HashMap::new(),
            });
        }
        let _release = ReleaseOnDrop(pending);

        for (_, request) in &requests {
            self.connection.send_message(request)?;
        }
        info!(
            target: "messagebus::rpc",
            method,
            targets = channels.len(),
            "sent jsonrpc request, awaiting response"
        );
        let answered = pending.done.wait(timeout);
        let call = pending.release();

        let mut outcomes = BTreeMap::new();
        for (channel, (rpc_id, _)) in channels.iter().zip(&requests) {
            let reply = call.as_ref().and_then(|call| call.replies.get(rpc_id));
            let outcome = match reply {
                Some(Reply::Result(value)) => Ok(value.clone()),
                Some(Reply::Error(error)) => Err(RpcFailure::Remote(error.clone())),
                Some(Reply::Empty) => Err(RpcFailure::Lost),
                None if answered => Err(RpcFailure::Lost),
                None => Err(RpcFailure::Timeout),
            };
            if let Err(failure) = &outcome {
                debug!(target: "messagebus::rpc", channel = %channel, error = %failure, "jsonrpc target failed");
            }
            outcomes.insert(channel.clone(), outcome);
        }
        Ok(outcomes)
    }
}
