//! Message model for the opsi messagebus: one envelope whose body is an
//! internally tagged enum keyed by `"type"`.

pub mod channel;
mod payload;

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use channel::{
    CONFIG_JSONRPC_CHANNEL, CONNECTION_USER_CHANNEL, MESSAGEBUS_SERVICE_CHANNEL,
    depot_process_channel, depot_terminal_channel, event_channel, host_channel,
    session_channel,
};

pub const JSONRPC_API_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_channel: Option<String>,
    /// Unix time in milliseconds.
    pub created: i64,
    #[serde(default)]
    pub expires: i64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Builds a message sent from the local connection to `channel`.
    pub fn new(channel: impl Into<String>, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: CONNECTION_USER_CHANNEL.to_string(),
            channel: channel.into(),
            back_channel: None,
            created: now_millis(),
            expires: 0,
            body,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_back_channel(mut self, back_channel: impl Into<String>) -> Self {
        self.back_channel = Some(back_channel.into());
        self
    }

    pub fn with_created(mut self, created: i64) -> Self {
        self.created = created;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionOperation {
    Set,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    ChannelSubscriptionRequest {
        operation: SubscriptionOperation,
        channels: Vec<String>,
    },
    ChannelSubscriptionEvent {
        #[serde(default)]
        subscribed_channels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    JsonrpcRequest {
        rpc_id: String,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
        api_version: String,
    },
    JsonrpcResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rpc_id: Option<String>,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    TerminalOpenRequest {
        terminal_id: String,
        rows: u16,
        cols: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
    TerminalOpenEvent {
        terminal_id: String,
        #[serde(default)]
        rows: u16,
        #[serde(default)]
        cols: u16,
    },
    TerminalDataWrite {
        terminal_id: String,
        #[serde(with = "payload")]
        data: Bytes,
    },
    TerminalDataRead {
        terminal_id: String,
        #[serde(with = "payload")]
        data: Bytes,
    },
    TerminalResizeRequest {
        terminal_id: String,
        rows: u16,
        cols: u16,
    },
    TerminalCloseRequest {
        terminal_id: String,
    },
    TerminalCloseEvent {
        terminal_id: String,
    },
    TerminalError {
        terminal_id: String,
        error: ErrorPayload,
    },
    GeneralError {
        error: ErrorPayload,
    },
    /// Broadcast event published on an `event:<name>` channel.
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    ProcessStartRequest {
        process_id: String,
        command: Vec<String>,
        #[serde(default)]
        shell: bool,
    },
    ProcessStartEvent {
        process_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        os_process_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locale_encoding: Option<String>,
    },
    ProcessDataWrite {
        process_id: String,
        #[serde(with = "payload")]
        stdin: Bytes,
    },
    ProcessDataRead {
        process_id: String,
        #[serde(with = "payload", default)]
        stdout: Bytes,
        #[serde(with = "payload", default)]
        stderr: Bytes,
    },
    ProcessStopRequest {
        process_id: String,
    },
    ProcessStopEvent {
        process_id: String,
        exit_code: i32,
    },
    ProcessError {
        process_id: String,
        error: ErrorPayload,
    },
    #[serde(other)]
    Unknown,
}

/// Fieldless mirror of [`MessageBody`], used to key handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    ChannelSubscriptionRequest,
    ChannelSubscriptionEvent,
    JsonrpcRequest,
    JsonrpcResponse,
    TerminalOpenRequest,
    TerminalOpenEvent,
    TerminalDataWrite,
    TerminalDataRead,
    TerminalResizeRequest,
    TerminalCloseRequest,
    TerminalCloseEvent,
    TerminalError,
    GeneralError,
    Event,
    ProcessStartRequest,
    ProcessStartEvent,
    ProcessDataWrite,
    ProcessDataRead,
    ProcessStopRequest,
    ProcessStopEvent,
    ProcessError,
    Unknown,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::ChannelSubscriptionRequest => "channel_subscription_request",
            MessageKind::ChannelSubscriptionEvent => "channel_subscription_event",
            MessageKind::JsonrpcRequest => "jsonrpc_request",
            MessageKind::JsonrpcResponse => "jsonrpc_response",
            MessageKind::TerminalOpenRequest => "terminal_open_request",
            MessageKind::TerminalOpenEvent => "terminal_open_event",
            MessageKind::TerminalDataWrite => "terminal_data_write",
            MessageKind::TerminalDataRead => "terminal_data_read",
            MessageKind::TerminalResizeRequest => "terminal_resize_request",
            MessageKind::TerminalCloseRequest => "terminal_close_request",
            MessageKind::TerminalCloseEvent => "terminal_close_event",
            MessageKind::TerminalError => "terminal_error",
            MessageKind::GeneralError => "general_error",
            MessageKind::Event => "event",
            MessageKind::ProcessStartRequest => "process_start_request",
            MessageKind::ProcessStartEvent => "process_start_event",
            MessageKind::ProcessDataWrite => "process_data_write",
            MessageKind::ProcessDataRead => "process_data_read",
            MessageKind::ProcessStopRequest => "process_stop_request",
            MessageKind::ProcessStopEvent => "process_stop_event",
            MessageKind::ProcessError => "process_error",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::ChannelSubscriptionRequest { .. } => MessageKind::ChannelSubscriptionRequest,
            MessageBody::ChannelSubscriptionEvent { .. } => MessageKind::ChannelSubscriptionEvent,
            MessageBody::JsonrpcRequest { .. } => MessageKind::JsonrpcRequest,
            MessageBody::JsonrpcResponse { .. } => MessageKind::JsonrpcResponse,
            MessageBody::TerminalOpenRequest { .. } => MessageKind::TerminalOpenRequest,
            MessageBody::TerminalOpenEvent { .. } => MessageKind::TerminalOpenEvent,
            MessageBody::TerminalDataWrite { .. } => MessageKind::TerminalDataWrite,
            MessageBody::TerminalDataRead { .. } => MessageKind::TerminalDataRead,
            MessageBody::TerminalResizeRequest { .. } => MessageKind::TerminalResizeRequest,
            MessageBody::TerminalCloseRequest { .. } => MessageKind::TerminalCloseRequest,
            MessageBody::TerminalCloseEvent { .. } => MessageKind::TerminalCloseEvent,
            MessageBody::TerminalError { .. } => MessageKind::TerminalError,
            MessageBody::GeneralError { .. } => MessageKind::GeneralError,
            MessageBody::Event { .. } => MessageKind::Event,
            MessageBody::ProcessStartRequest { .. } => MessageKind::ProcessStartRequest,
            MessageBody::ProcessStartEvent { .. } => MessageKind::ProcessStartEvent,
            MessageBody::ProcessDataWrite { .. } => MessageKind::ProcessDataWrite,
            MessageBody::ProcessDataRead { .. } => MessageKind::ProcessDataRead,
            MessageBody::ProcessStopRequest { .. } => MessageKind::ProcessStopRequest,
            MessageBody::ProcessStopEvent { .. } => MessageKind::ProcessStopEvent,
            MessageBody::ProcessError { .. } => MessageKind::ProcessError,
            MessageBody::Unknown => MessageKind::Unknown,
        }
    }

    /// Builds a JSONRPC request body with a fresh `rpc_id`.
    pub fn jsonrpc_request(method: impl Into<String>, params: Vec<Value>) -> Self {
        MessageBody::JsonrpcRequest {
            rpc_id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
            api_version: JSONRPC_API_VERSION.to_string(),
        }
    }
}
