use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use messagebus::BusConfig;
use serde::Deserialize;
use tracing::debug;

use crate::cli::Cli;
use crate::error::CliError;
use crate::output::OutputFormat;
use crate::telemetry::logging::{LogConfig, LogLevel};

pub const DEFAULT_SERVICE: &str = "localhost:4447";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub service: Option<String>,
    pub log_level: Option<LogLevel>,
    pub log_file: Option<PathBuf>,
    pub output_format: Option<OutputFormat>,
    pub dry_run: Option<bool>,
    /// Seconds.
    pub subscription_timeout: Option<f64>,
    /// Seconds.
    pub jsonrpc_timeout: Option<f64>,
    /// Seconds.
    pub process_start_timeout: Option<f64>,
}

impl FileConfig {
    pub fn parse(text: &str, origin: &Path) -> Result<Self, CliError> {
        toml::from_str(text).map_err(|err| CliError::Config(format!("{}: {err}", origin.display())))
    }

    /// Reads `path`; a missing file at the default location is not an error.
    pub fn load(path: &Path, required: bool) -> Result<Self, CliError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, path),
            Err(err) if err.kind() == io::ErrorKind::NotFound && !required => {
                debug!(target: "opsi_cli::config", path = %path.display(), "no config file");
                Ok(Self::default())
            }
            Err(err) => Err(CliError::Config(format!("{}: {err}", path.display()))),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "opsi", "opsi-cli").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Effective settings: command line and environment, then the config file,
/// then built-in defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub service: String,
    pub log: LogConfig,
    pub output_format: OutputFormat,
    pub dry_run: bool,
    pub bus: BusConfig,
}

impl Settings {
    pub fn resolve(cli: &Cli) -> Result<Self, CliError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path, true)?,
            None => match default_config_path() {
                Some(path) => FileConfig::load(&path, false)?,
                None => FileConfig::default(),
            },
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: &Cli, file: FileConfig) -> Result<Self, CliError> {
        let mut bus = BusConfig::default();
        if let Some(timeout) = cli.timeouts.subscription.or(seconds(file.subscription_timeout)?) {
            bus = bus.with_subscription_timeout(timeout);
        }
        if let Some(timeout) = cli.timeouts.jsonrpc.or(seconds(file.jsonrpc_timeout)?) {
            bus = bus.with_jsonrpc_timeout(timeout);
        }
        if let Some(timeout) = seconds(file.process_start_timeout)? {
            bus = bus.with_process_start_timeout(timeout);
        }

        Ok(Self {
            service: cli
                .service
                .clone()
                .or(file.service)
                .unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
            log: LogConfig {
                level: cli.logging.level.or(file.log_level).unwrap_or_default(),
                file: cli.logging.file.clone().or(file.log_file),
            },
            output_format: cli.output_format.or(file.output_format).unwrap_or_default(),
            dry_run: cli.dry_run.or(file.dry_run).unwrap_or(false),
            bus,
        })
    }
}

fn seconds(value: Option<f64>) -> Result<Option<Duration>, CliError> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|err| CliError::Config(format!("invalid timeout {secs}: {err}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["opsi-cli"];
        argv.extend_from_slice(args);
        argv.push("jsonrpc");
        argv.push("backend_info");
        Cli::try_parse_from(argv).expect("parse")
    }

    fn file(text: &str) -> FileConfig {
        FileConfig::parse(text, Path::new("test.toml")).expect("valid config")
    }

    #[test]
    fn defaults_apply_without_file_or_flags() {
        let settings = Settings::merge(&cli(&[]), FileConfig::default()).expect("settings");
        assert_eq!(settings.service, DEFAULT_SERVICE);
        assert_eq!(settings.log.level, LogLevel::Warn);
        assert_eq!(settings.output_format, OutputFormat::Text);
        assert!(!settings.dry_run);
        assert_eq!(settings.bus.jsonrpc_timeout, messagebus::config::JSONRPC_TIMEOUT);
    }

    #[test]
    fn file_values_fill_in_missing_flags() {
        let config = file(
            r#"
            service = "relay.domain.tld:4447"
            log_level = "debug"
            output_format = "json"
            jsonrpc_timeout = 2.5
            process_start_timeout = 30
            "#,
        );
        let settings = Settings::merge(&cli(&[]), config).expect("settings");
        assert_eq!(settings.service, "relay.domain.tld:4447");
        assert_eq!(settings.log.level, LogLevel::Debug);
        assert_eq!(settings.output_format, OutputFormat::Json);
        assert_eq!(settings.bus.jsonrpc_timeout, Duration::from_millis(2500));
        assert_eq!(settings.bus.process_start_timeout, Duration::from_secs(30));
    }

    #[test]
    fn flags_win_over_file() {
        let config = file("service = \"from-file:1\"\njsonrpc_timeout = 2\ndry_run = false\n");
        let settings = Settings::merge(
            &cli(&["--service", "from-flag:2", "--jsonrpc-timeout", "7", "--dry-run"]),
            config,
        )
        .expect("settings");
        assert_eq!(settings.service, "from-flag:2");
        assert_eq!(settings.bus.jsonrpc_timeout, Duration::from_secs(7));
        assert!(settings.dry_run);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = FileConfig::parse("servcie = \"typo\"", Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn negative_timeouts_are_rejected() {
        assert!(Settings::merge(&cli(&[]), file("jsonrpc_timeout = -1.0")).is_err());
    }
}
