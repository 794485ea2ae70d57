use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use messagebus::config::HOST_WAIT_TIMEOUT;
use messagebus::{EventWaiter, RpcCorrelator};
use serde_json::Value;
use tracing::info;

use super::Context;
use crate::cli::{WaitEventArgs, WaitHostsArgs, WakeupArgs};
use crate::error::CliError;
use crate::output::{self, WakeSent};
use crate::service::{ConfigService, normalize_host_id, select_hosts};

pub fn hosts<W: Write>(ctx: &Context, args: &WaitHostsArgs, out: &mut W) -> Result<(), CliError> {
    let host_ids = args
        .hosts
        .iter()
        .map(|host| normalize_host_id(host))
        .collect::<Result<BTreeSet<_>, _>>()?;

    let scope = ctx.connect()?;
    let rpc = RpcCorrelator::new(Arc::clone(scope.connection()));
    let waiter = EventWaiter::new(Arc::clone(scope.connection()));
    let report = waiter.wait_for_hosts(
        &host_ids,
        args.timeout.unwrap_or(HOST_WAIT_TIMEOUT),
        &ConfigService::new(&rpc),
    )?;
    output::write_host_wait(out, ctx.settings.output_format, &report)?;
    if report.is_complete() {
        Ok(())
    } else {
        Err(CliError::Failed(1))
    }
}

/// Sends wakeup packets to the hosts that are not connected, then waits for
/// them the way `hosts` does.
pub fn wakeup<W: Write>(ctx: &Context, args: &WakeupArgs, out: &mut W) -> Result<(), CliError> {
    if ctx.settings.dry_run {
        info!(target: "opsi_cli::wakeup", "operating in dry-run mode, not performing any actions");
        writeln!(out, "Would wake {}", args.hosts.join(","))?;
        return Ok(());
    }

    let scope = ctx.connect()?;
    let rpc = RpcCorrelator::new(Arc::clone(scope.connection()));
    let service = ConfigService::new(&rpc);
    let host_ids = select_hosts(&args.hosts, || service.client_ids())?;
    if host_ids.is_empty() {
        return Err(CliError::InvalidArgument("no hosts selected".into()));
    }

    let waiter = EventWaiter::new(Arc::clone(scope.connection()));
    let mut sent = None;
    let report = waiter.wait_for_hosts_with(
        &host_ids,
        args.timeout.unwrap_or(HOST_WAIT_TIMEOUT),
        &service,
        |missing| {
            let targets: Vec<String> = missing.iter().cloned().collect();
            let count = service.wake_hosts(&targets)?;
            info!(
                target: "opsi_cli::wakeup",
                sent = count,
                hosts = targets.len(),
                "sent wakeup packets, waiting for hosts to connect"
            );
            sent = Some(WakeSent {
                sent: count,
                targeted: targets.len(),
            });
            Ok(())
        },
    )?;
    output::write_wakeup(out, ctx.settings.output_format, sent, &report)?;
    if report.is_complete() {
        Ok(())
    } else {
        Err(CliError::Failed(1))
    }
}

pub fn event<W: Write>(ctx: &Context, args: &WaitEventArgs, out: &mut W) -> Result<(), CliError> {
    let matches = args.matches.clone();
    let scope = ctx.connect()?;
    let waiter = EventWaiter::new(Arc::clone(scope.connection()));
    let found = waiter.wait_for_event(
        &args.event,
        move |data: &Value| matches.iter().all(|(key, expected)| data_matches(data, key, expected)),
        args.timeout.unwrap_or(Duration::MAX),
    )?;
    match found {
        Some(data) => {
            output::write_value(out, ctx.settings.output_format, &data)?;
            Ok(())
        }
        None => Err(CliError::NoMatchingEvent {
            event: args.event.clone(),
        }),
    }
}

/// `key` is a top-level field or a dotted path into nested objects. Strings
/// compare by content, everything else by its JSON text.
fn data_matches(data: &Value, key: &str, expected: &str) -> bool {
    let found = data
        .get(key)
        .or_else(|| key.split('.').try_fold(data, |value, part| value.get(part)));
    match found {
        Some(Value::String(text)) => text == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}
