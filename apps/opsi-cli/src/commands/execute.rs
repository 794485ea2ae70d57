use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use crossterm::tty::IsTty;
use messagebus::{
    BusResult, FanoutExecutor, FanoutRequest, ProcessExecutor, ProcessOutput, ProcessRequest, RpcCorrelator,
};
use tracing::{debug, info};

use super::Context;
use crate::cli::ExecuteArgs;
use crate::error::CliError;
use crate::output;
use crate::service::{ConfigService, client_channels, depot_channels, select_hosts};

pub fn run<W: Write>(ctx: &Context, args: &ExecuteArgs, out: &mut W) -> Result<(), CliError> {
    if args.clients.is_empty() && args.depots.is_empty() {
        return Err(CliError::InvalidArgument(
            "select target hosts with --clients and/or --depots".into(),
        ));
    }
    if args.command.is_empty() {
        return Err(CliError::InvalidArgument("no command given".into()));
    }
    if ctx.settings.dry_run {
        info!(target: "opsi_cli::execute", "operating in dry-run mode, not performing any actions");
        writeln!(
            out,
            "Would execute {:?} on {}",
            args.command,
            describe_targets(&args.clients, &args.depots)
        )?;
        return Ok(());
    }

    let scope = ctx.connect()?;
    let connection = Arc::clone(scope.connection());
    let rpc = RpcCorrelator::new(Arc::clone(&connection));
    let channels = {
        let service = ConfigService::new(&rpc);
        let clients = select_hosts(&args.clients, || service.client_ids())?;
        let depots = select_hosts(&args.depots, || -> BusResult<Vec<String>> {
            Ok(service.server_hosts()?.depots.into_iter().collect())
        })?;
        let mut channels = client_channels(&clients);
        channels.extend(depot_channels(&depots));
        channels
    };
    if channels.is_empty() {
        return Err(CliError::InvalidArgument("no hosts selected".into()));
    }
    debug!(
        target: "opsi_cli::execute",
        targets = channels.len(),
        stream = args.stream,
        shell = args.shell,
        "executing command"
    );

    let exit_code = if args.stream {
        let executor = ProcessExecutor::new(connection, ProcessOutput::stdio());
        let mut request = ProcessRequest::new(channels, args.command.clone());
        request.shell = args.shell;
        request.concurrency = args.concurrent;
        request.timeout = args.timeout;
        request.stdin = piped_stdin()?;
        request.show_host_names = !args.no_host_names;
        request.color = std::env::var_os("NO_COLOR").is_none() && io::stdout().is_tty();
        let report = executor.execute(&request)?;
        output::write_process(out, ctx.settings.output_format, &report)?;
        report.exit_code()
    } else {
        let mut request = FanoutRequest::new(channels, args.command.clone());
        request.shell = args.shell;
        request.concurrency = args.concurrent;
        if let Some(timeout) = args.timeout {
            request.timeout = timeout;
        }
        let report = FanoutExecutor::new(&rpc).execute(&request)?;
        output::write_fanout(out, ctx.settings.output_format, &report)?;
        report.exit_code()
    };

    if exit_code == 0 {
        Ok(())
    } else {
        Err(CliError::Failed(exit_code))
    }
}

/// Input piped into the command, forwarded to every remote process.
fn piped_stdin() -> io::Result<Bytes> {
    let stdin = io::stdin();
    if stdin.is_tty() {
        return Ok(Bytes::new());
    }
    let mut data = Vec::new();
    stdin.lock().read_to_end(&mut data)?;
    Ok(Bytes::from(data))
}

fn describe_targets(clients: &[String], depots: &[String]) -> String {
    let mut parts = Vec::new();
    if !clients.is_empty() {
        parts.push(format!("clients {}", clients.join(",")));
    }
    if !depots.is_empty() {
        parts.push(format!("depots {}", depots.join(",")));
    }
    parts.join(" and ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_described_per_kind() {
        assert_eq!(
            describe_targets(&["c1".into(), "c2".into()], &["d1".into()]),
            "clients c1,c2 and depots d1"
        );
        assert_eq!(describe_targets(&[], &["all".into()]), "depots all");
    }
}
