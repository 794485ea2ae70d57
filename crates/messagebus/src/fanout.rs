use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{BusError, BusResult};
use crate::rpc::{RpcCorrelator, RpcFailure, RpcOutcome, remote_error_message};

/// Remote method every fan-out target executes.
pub const PROCESS_EXECUTE_METHOD: &str = "process_execute";

#[derive(Debug, Clone)]
pub struct FanoutRequest {
    pub channels: Vec<String>,
    pub command: Vec<String>,
    pub shell: bool,
    /// Forwarded to the targets; the local wait adds the JSONRPC timeout.
    pub timeout: Duration,
    /// Forwarded to the targets, never enforced locally.
    pub concurrency: usize,
}

impl FanoutRequest {
    pub fn new(channels: Vec<String>, command: Vec<String>) -> Self {
        Self {
            channels,
            command,
            shell: false,
            timeout: Duration::from_secs(60),
            concurrency: 100,
        }
    }

    fn params(&self) -> Vec<Value> {
        vec![
            json!(self.command),
            json!({
                "shell": self.shell,
                "timeout": self.timeout.as_secs_f64(),
                "concurrency": self.concurrency,
            }),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetOutcome {
    pub status: i32,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetOutcome {
    fn from_rpc(outcome: RpcOutcome) -> Self {
        match outcome {
            Ok(Value::Object(fields)) => {
                let status = fields
                    .get("exit_code")
                    .and_then(Value::as_i64)
                    .map_or(0, |code| code as i32);
                let error = fields
                    .get("error")
                    .filter(|error| !error.is_null())
                    .map(remote_error_message);
                Self {
                    status,
                    payload: Value::Object(fields),
                    error,
                }
            }
            Ok(payload) => Self {
                status: 0,
                payload,
                error: None,
            },
            Err(RpcFailure::Remote(error)) => Self {
                status: 1,
                error: Some(remote_error_message(&error)),
                payload: error,
            },
            Err(failure) => Self {
                status: 1,
                payload: Value::Null,
                error: Some(failure.to_string()),
            },
        }
    }

    pub fn failed(&self) -> bool {
        self.status != 0 || self.error.is_some()
    }
}

/// Per-channel outcomes of one fan-out call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutReport {
    pub outcomes: BTreeMap<String, TargetOutcome>,
}

impl FanoutReport {
    pub fn channels(&self) -> BTreeSet<&str> {
        self.outcomes.keys().map(String::as_str).collect()
    }

    pub fn failed_channels(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.failed())
            .map(|(channel, _)| channel.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(|outcome| !outcome.failed())
    }

    /// First non-zero target status, else 1 if any target failed, else 0.
    pub fn exit_code(&self) -> i32 {
        if let Some(outcome) = self.outcomes.values().find(|outcome| outcome.status != 0) {
            return outcome.status;
        }
        if self.is_success() { 0 } else { 1 }
    }

    /// Prints succeeding targets' output followed by the failing channels.
    pub fn write_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (channel, outcome) in &self.outcomes {
            if outcome.failed() {
                continue;
            }
            writeln!(out, "{channel}:")?;
            match &outcome.payload {
                Value::Object(fields) => {
                    for stream in ["stdout", "stderr"] {
                        if let Some(text) = fields.get(stream).and_then(Value::as_str) {
                            if !text.is_empty() {
                                writeln!(out, "{}", text.trim_end_matches('\n'))?;
                            }
                        }
                    }
                }
                Value::Null => {}
                other => writeln!(out, "{other}")?,
            }
        }
        let failed = self.failed_channels();
        if !failed.is_empty() {
            writeln!(out, "Failed on {} of {} targets:", failed.len(), self.outcomes.len())?;
            for channel in failed {
                let reason = self.outcomes[channel].error.as_deref().unwrap_or("non-zero exit code");
                writeln!(out, "  {channel}: {reason} (status {})", self.outcomes[channel].status)?;
            }
        }
        Ok(())
    }
}

/// Issues one command to many channels as a single logical JSONRPC call.
pub struct FanoutExecutor<'a> {
    rpc: &'a RpcCorrelator,
}

impl<'a> FanoutExecutor<'a> {
    pub fn new(rpc: &'a RpcCorrelator) -> Self {
        Self { rpc }
    }

    pub fn execute(&self, request: &FanoutRequest) -> BusResult<FanoutReport> {
        if request.command.is_empty() {
            return Err(BusError::InvalidArgument("no command given".into()));
        }
        let wait = self
            .rpc
            .connection()
            .config()
            .jsonrpc_timeout
            .saturating_add(request.timeout);
        info!(
            target: "messagebus::fanout",
            targets = request.channels.len(),
            command = ?request.command,
            "executing command on targets"
        );
        let outcomes = self.rpc.call_many(
            &request.channels,
            PROCESS_EXECUTE_METHOD,
            request.params(),
            wait,
        )?;
        let report = FanoutReport {
            outcomes: outcomes
                .into_iter()
                .map(|(channel, outcome)| (channel, TargetOutcome::from_rpc(outcome)))
                .collect(),
        };
        let failed = report.failed_channels();
        if !failed.is_empty() {
            warn!(target: "messagebus::fanout", failed = ?failed, "command failed on some targets");
        }
        Ok(report)
    }
}
