use std::io::{self, Write};

use clap::ValueEnum;
use messagebus::{FanoutReport, HostWaitReport, ProcessReport};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Clone, Copy, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Prints a JSONRPC result. Text mode prints strings bare and lists of
/// scalars one per line.
pub fn write_value<W: Write>(out: &mut W, format: OutputFormat, value: &Value) -> io::Result<()> {
    match (format, value) {
        (OutputFormat::Text, Value::Null) => Ok(()),
        (OutputFormat::Text, Value::String(text)) => writeln!(out, "{text}"),
        (OutputFormat::Text, Value::Array(items)) if items.iter().all(is_scalar) => {
            for item in items {
                match item {
                    Value::String(text) => writeln!(out, "{text}")?,
                    other => writeln!(out, "{other}")?,
                }
            }
            Ok(())
        }
        _ => writeln!(out, "{}", pretty(value)),
    }
}

pub fn write_fanout<W: Write>(out: &mut W, format: OutputFormat, report: &FanoutReport) -> io::Result<()> {
    match format {
        OutputFormat::Text => report.write_summary(out),
        OutputFormat::Json => writeln!(out, "{}", pretty(&json!(report.outcomes))),
    }
}

/// Streamed output has already been written; only JSON mode adds a summary.
pub fn write_process<W: Write>(out: &mut W, format: OutputFormat, report: &ProcessReport) -> io::Result<()> {
    match format {
        OutputFormat::Text => Ok(()),
        OutputFormat::Json => writeln!(out, "{}", pretty(&json!(report.outcomes))),
    }
}

pub fn write_host_wait<W: Write>(out: &mut W, format: OutputFormat, report: &HostWaitReport) -> io::Result<()> {
    match format {
        OutputFormat::Text => {
            writeln!(
                out,
                "{} of {} hosts connected after {:.1}s",
                report.connected_count(),
                report.requested.len(),
                report.elapsed.as_secs_f64()
            )?;
            if !report.is_complete() {
                let missing: Vec<&str> = report.missing.iter().map(String::as_str).collect();
                writeln!(out, "Not connected: {}", missing.join(", "))?;
            }
            Ok(())
        }
        OutputFormat::Json => {
            let summary = json!({
                "connected": report.connected(),
                "missing": report.missing,
                "elapsed": report.elapsed.as_secs_f64(),
            });
            writeln!(out, "{}", pretty(&summary))
        }
    }
}

/// Wakeup packets sent to the hosts that were not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeSent {
    pub sent: usize,
    pub targeted: usize,
}

/// `sent` is `None` when every host was already connected.
pub fn write_wakeup<W: Write>(
    out: &mut W,
    format: OutputFormat,
    sent: Option<WakeSent>,
    report: &HostWaitReport,
) -> io::Result<()> {
    match format {
        OutputFormat::Text => {
            if let Some(WakeSent { sent, targeted }) = sent {
                writeln!(out, "Sent wakeup to {sent} of {targeted} hosts")?;
            }
            write_host_wait(out, format, report)
        }
        OutputFormat::Json => {
            let summary = json!({
                "sent": sent.map_or(0, |wake| wake.sent),
                "connected": report.connected(),
                "missing": report.missing,
                "elapsed": report.elapsed.as_secs_f64(),
            });
            writeln!(out, "{}", pretty(&summary))
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
