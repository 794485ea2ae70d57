use std::io;
use std::sync::Arc;

use crossterm::tty::IsTty;
use messagebus::terminal::{CrosstermTerminal, StdinInput};
use messagebus::{RpcCorrelator, TerminalIo, TerminalSession};
use tracing::{debug, info};

use super::Context;
use crate::cli::TerminalArgs;
use crate::error::CliError;
use crate::service::{ConfigService, terminal_channel};

pub fn run(ctx: &Context, args: &TerminalArgs) -> Result<(), CliError> {
    let scope = ctx.connect()?;
    let connection = Arc::clone(scope.connection());

    let channel = {
        let rpc = RpcCorrelator::new(Arc::clone(&connection));
        let service = ConfigService::new(&rpc);
        let servers = service.server_hosts()?;
        let connected = service.messagebus_connected_ids()?;
        debug!(
            target: "opsi_cli::terminal",
            configserver = ?servers.configserver,
            depots = servers.depots.len(),
            connected = connected.len(),
            "looked up hosts"
        );
        terminal_channel(&args.target, &servers, &connected)?
    };

    let terminal = CrosstermTerminal;
    let mut input = StdinInput::spawn()?;
    let raw_mode = io::stdin().is_tty();
    if raw_mode {
        eprintln!("Return to local shell with 'exit' or 'Ctrl+D'\r");
    }
    let mut session = TerminalSession::new(connection, Box::new(io::stdout()));
    let exit = session.run(
        &channel,
        args.terminal_id.as_deref(),
        args.shell.as_deref(),
        TerminalIo {
            terminal: &terminal,
            input: &mut input,
            raw_mode,
        },
    )?;
    info!(target: "opsi_cli::terminal", ?exit, channel = %channel, "terminal session ended");
    Ok(())
}
