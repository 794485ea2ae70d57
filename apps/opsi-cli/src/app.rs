use std::io::{self, Write};
use std::sync::Arc;

use tracing::debug;

use crate::cli::{Cli, Command};
use crate::commands::{self, Context};
use crate::config::Settings;
use crate::error::CliError;
use crate::telemetry::logging;
use crate::transport::RelayTransport;

pub fn run(cli: Cli) -> Result<(), CliError> {
    let settings = Settings::resolve(&cli)?;
    logging::init(&settings.log)?;
    debug!(target: "opsi_cli::app", service = %settings.service, dry_run = settings.dry_run, "settings resolved");

    let transport = Arc::new(RelayTransport::new(settings.service.clone()));
    let ctx = Context::new(settings, transport);
    // Unlocked: terminal and process output is written from the delivery thread.
    let mut out = io::stdout();
    let result = dispatch(&ctx, &cli.command, &mut out);
    out.flush()?;
    result
}

pub fn dispatch<W: Write>(ctx: &Context, command: &Command, out: &mut W) -> Result<(), CliError> {
    match command {
        Command::Jsonrpc(args) => commands::jsonrpc::run(ctx, args, out),
        Command::Terminal(args) => commands::terminal::run(ctx, args),
        Command::Execute(args) => commands::execute::run(ctx, args, out),
        Command::WaitHosts(args) => commands::wait::hosts(ctx, args, out),
        Command::Wakeup(args) => commands::wait::wakeup(ctx, args, out),
        Command::WaitEvent(args) => commands::wait::event(ctx, args, out),
    }
}
