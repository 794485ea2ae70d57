pub mod logging {
    use clap::ValueEnum;
    use serde::Deserialize;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const LOG_FILTER_ENV: &str = "OPSI_CLI_LOG_FILTER";

    #[derive(
        Clone, Copy, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq, PartialOrd, Ord,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber once; later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

        // With a log file nothing reaches the tty, which raw-mode terminal
        // sessions depend on.
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
            return EnvFilter::new(filter);
        }
        EnvFilter::new(default_filter_for(level))
    }

    fn default_filter_for(level: LevelFilter) -> String {
        match level {
            LevelFilter::TRACE => "info,opsi_cli=trace,messagebus=trace,transport=trace".to_owned(),
            LevelFilter::DEBUG => "info,opsi_cli=debug,messagebus=debug,transport=debug".to_owned(),
            LevelFilter::INFO => "info".to_owned(),
            LevelFilter::WARN => "warn".to_owned(),
            LevelFilter::ERROR => "error".to_owned(),
            LevelFilter::OFF => "off".to_owned(),
        }
    }

}
