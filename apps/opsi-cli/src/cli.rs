use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use messagebus_proto::CONFIG_JSONRPC_CHANNEL;
use std::path::PathBuf;
use std::time::Duration;

use crate::output::OutputFormat;
use crate::telemetry::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "opsi-cli",
    about = "Talk to opsi hosts over the opsi messagebus",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "OPSI_CLI_CONFIG",
        value_name = "PATH",
        help = "Read settings from this TOML file instead of the default location"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "OPSI_CLI_SERVICE",
        value_name = "HOST:PORT",
        help = "Address of the messagebus relay"
    )]
    pub service: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[arg(
        long = "output-format",
        global = true,
        value_enum,
        env = "OPSI_CLI_OUTPUT_FORMAT",
        help = "How results are printed"
    )]
    pub output_format: Option<OutputFormat>,

    #[arg(
        long = "dry-run",
        global = true,
        env = "OPSI_CLI_DRY_RUN",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Show what would be done without sending anything (--dry-run=false to turn off)"
    )]
    pub dry_run: Option<bool>,

    #[command(flatten)]
    pub timeouts: TimeoutArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "OPSI_CLI_LOG_LEVEL",
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: Option<LogLevel>,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "OPSI_CLI_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TimeoutArgs {
    #[arg(
        long = "subscription-timeout",
        global = true,
        value_name = "SECONDS",
        env = "OPSI_CLI_SUBSCRIPTION_TIMEOUT",
        value_parser = parse_seconds,
        help = "How long to wait for channel subscriptions to be confirmed"
    )]
    pub subscription: Option<Duration>,

    #[arg(
        long = "jsonrpc-timeout",
        global = true,
        value_name = "SECONDS",
        env = "OPSI_CLI_JSONRPC_TIMEOUT",
        value_parser = parse_seconds,
        help = "How long to wait for JSONRPC responses"
    )]
    pub jsonrpc: Option<Duration>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Call a JSONRPC method over the messagebus
    Jsonrpc(JsonrpcArgs),
    /// Open an interactive terminal on a client, depot or the configserver
    Terminal(TerminalArgs),
    /// Run a command on many hosts
    Execute(ExecuteArgs),
    /// Wait until hosts are connected to the messagebus
    WaitHosts(WaitHostsArgs),
    /// Wake up clients that are not connected and wait for them to connect
    Wakeup(WakeupArgs),
    /// Wait for a broadcast event
    WaitEvent(WaitEventArgs),
}

#[derive(Args, Debug)]
pub struct JsonrpcArgs {
    #[arg(value_name = "METHOD")]
    pub method: String,

    #[arg(
        value_name = "PARAM",
        help = "Parameters, parsed as JSON where possible and passed as strings otherwise"
    )]
    pub params: Vec<String>,

    #[arg(long, value_name = "CHANNEL", default_value = CONFIG_JSONRPC_CHANNEL)]
    pub channel: String,
}

#[derive(Args, Debug)]
pub struct TerminalArgs {
    #[arg(
        value_name = "TARGET",
        help = "Host id of a client or depot, or 'configserver'"
    )]
    pub target: String,

    #[arg(
        long = "terminal-id",
        value_name = "ID",
        help = "Reattach to an existing terminal with this id"
    )]
    pub terminal_id: Option<String>,

    #[arg(long, value_name = "PROGRAM", help = "Shell to start on the remote side")]
    pub shell: Option<String>,
}

#[derive(Args, Debug)]
pub struct ExecuteArgs {
    #[arg(
        long,
        value_name = "HOST_IDS",
        value_delimiter = ',',
        help = "Comma-separated list of client ids"
    )]
    pub clients: Vec<String>,

    #[arg(
        long,
        value_name = "HOST_IDS",
        value_delimiter = ',',
        help = "Comma-separated list of depot ids"
    )]
    pub depots: Vec<String>,

    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = parse_seconds,
        help = "Time limit for the command on each host"
    )]
    pub timeout: Option<Duration>,

    #[arg(
        long,
        value_name = "COUNT",
        default_value_t = 100,
        help = "Number of hosts running the command at the same time"
    )]
    pub concurrent: usize,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Run the command in a shell")]
    pub shell: bool,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Stream output while the command runs instead of collecting results"
    )]
    pub stream: bool,

    #[arg(
        long = "no-host-names",
        action = clap::ArgAction::SetTrue,
        help = "Do not prefix streamed output lines with the host id"
    )]
    pub no_host_names: bool,

    #[arg(trailing_var_arg = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct WaitHostsArgs {
    #[arg(value_name = "HOST_ID", required = true)]
    pub hosts: Vec<String>,

    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = parse_seconds,
        help = "Give up after this many seconds (default 60)"
    )]
    pub timeout: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct WakeupArgs {
    #[arg(
        value_name = "HOST_ID",
        required = true,
        help = "Client ids, or 'all' for every client"
    )]
    pub hosts: Vec<String>,

    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = parse_seconds,
        help = "How long to wait for woken hosts to connect (default 60)"
    )]
    pub timeout: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct WaitEventArgs {
    #[arg(value_name = "EVENT")]
    pub event: String,

    #[arg(
        long = "match",
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        help = "Only accept events whose data has KEY set to VALUE (repeatable)"
    )]
    pub matches: Vec<(String, String)>,

    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = parse_seconds,
        help = "Give up after this many seconds (waits forever if omitted)"
    )]
    pub timeout: Option<Duration>,
}

pub fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(seconds).map_err(|err| format!("invalid duration '{raw}': {err}"))
}

pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_accept_fractions() {
        assert_eq!(parse_seconds("1.5"), Ok(Duration::from_millis(1500)));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn key_value_splits_on_first_equals() {
        assert_eq!(
            parse_key_value(" productId = a=b "),
            Ok(("productId".into(), "a=b".into()))
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn execute_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "opsi-cli",
            "--service",
            "relay:9000",
            "execute",
            "--clients",
            "c1,c2",
            "--timeout",
            "5",
            "--",
            "ls",
            "-l",
        ])
        .expect("parse");
        assert_eq!(cli.service.as_deref(), Some("relay:9000"));
        let Command::Execute(args) = cli.command else {
            panic!("expected execute");
        };
        assert_eq!(args.clients, vec!["c1", "c2"]);
        assert_eq!(args.timeout, Some(Duration::from_secs(5)));
        assert_eq!(args.command, vec!["ls", "-l"]);
        assert!(!args.stream);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "opsi-cli",
            "wait-event",
            "host_connected",
            "--match",
            "host.id=c1",
            "--dry-run",
            "--log-level",
            "debug",
        ])
        .expect("parse");
        assert_eq!(cli.dry_run, Some(true));
        assert_eq!(cli.logging.level, Some(LogLevel::Debug));
        let Command::WaitEvent(args) = cli.command else {
            panic!("expected wait-event");
        };
        assert_eq!(args.matches, vec![("host.id".to_string(), "c1".to_string())]);
        assert_eq!(args.timeout, None);
    }

    #[test]
    fn dry_run_before_subcommand_keeps_the_subcommand() {
        let cli = Cli::try_parse_from([
            "opsi-cli",
            "--dry-run",
            "execute",
            "--clients",
            "c1.domain.tld",
            "--",
            "ls",
        ])
        .expect("parse");
        assert_eq!(cli.dry_run, Some(true));
        assert!(matches!(cli.command, Command::Execute(_)));

        let cli = Cli::try_parse_from(["opsi-cli", "--dry-run=false", "jsonrpc", "backend_info"])
            .expect("parse");
        assert_eq!(cli.dry_run, Some(false));
    }
}
