//! Subscriber setup for the sink controllers.
//!
//! Two outputs are supported: human readable console logs, which are on by
//! default, and JSON lines written to rolling files, which are enabled by
//! providing a log directory. Each output has its own level filter read from
//! an environment variable.

use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// Installs the console and file subscribers of a controller process.
///
/// ```
/// use sink_telemetry::tracing::{Error, TelemetryOptions, Tracing};
///
/// fn main() -> Result<(), Error> {
///     let _tracing_guard =
///         Tracing::pre_configured("log-controller", TelemetryOptions::default()).init()?;
///
///     tracing::info!("log a message");
///     Ok(())
/// }
/// ```
///
/// Environment variables (CLI arguments where available):
///
/// - `CONSOLE_LOG_DISABLED` (`--console-log-disabled`)
/// - `CONSOLE_LOG_LEVEL`, defaults to `info`
/// - `FILE_LOG_DIRECTORY` (`--file-log-directory`), enables file logs
/// - `FILE_LOG_ROTATION_PERIOD` (`--file-log-rotation-period`)
/// - `FILE_LOG_MAX_FILES` (`--file-log-max-files`)
/// - `FILE_LOG_LEVEL`, defaults to `info`
#[derive(Debug)]
pub struct Tracing {
    service_name: &'static str,
    console: Option<Output>,
    file: Option<FileOutput>,
}

/// Where an output reads its level filter from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Output {
    level_env_var: &'static str,
    default_level: LevelFilter,
}

impl Output {
    fn env_filter(self) -> EnvFilter {
        EnvFilter::builder()
            .with_env_var(self.level_env_var)
            .with_default_directive(self.default_level.into())
            .from_env_lossy()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FileOutput {
    output: Output,
    directory: PathBuf,
    rotation: Rotation,
    max_files: Option<usize>,
}

impl Tracing {
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";

    /// Suffix of the rolling log files, which are prefixed with the service
    /// name.
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";

    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        let TelemetryOptions {
            console_log_disabled,
            file_log_directory,
            file_log_rotation_period,
            file_log_max_files,
        } = options;

        let console = (!console_log_disabled).then_some(Output {
            level_env_var: Self::CONSOLE_LOG_LEVEL,
            default_level: LevelFilter::INFO,
        });
        let file = file_log_directory.map(|directory| FileOutput {
            output: Output {
                level_env_var: Self::FILE_LOG_LEVEL,
                default_level: LevelFilter::INFO,
            },
            directory,
            rotation: file_log_rotation_period.unwrap_or_default().into(),
            max_files: file_log_max_files,
        });

        Self {
            service_name,
            console,
            file,
        }
    }

    /// Installs the configured subscribers as the global default.
    ///
    /// Keep the returned value in a named binding (not `let _ =`) until the
    /// process exits.
    pub fn init(self) -> Result<Self> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

        if let Some(console) = self.console {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_filter(console.env_filter())
                    .boxed(),
            );
        }

        if let Some(file) = &self.file {
            let mut appender = RollingFileAppender::builder()
                .rotation(file.rotation.clone())
                .filename_prefix(self.service_name)
                .filename_suffix(Self::FILE_LOG_SUFFIX);
            if let Some(max_files) = file.max_files {
                appender = appender.max_log_files(max_files);
            }
            let appender = appender
                .build(&file.directory)
                .context(InitRollingFileAppenderSnafu)?;

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(appender)
                    .with_filter(file.output.env_filter())
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        Ok(self)
    }
}

/// Telemetry settings of a controller, flattened into its CLI arguments when
/// the `clap` feature is enabled.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Enable logging to files located in the specified DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", group = "file_log")
    )]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "PERIOD", requires = "file_log")
    )]
    pub file_log_rotation_period: Option<RotationPeriod>,

    /// Maximum NUMBER of log files to keep.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "NUMBER", requires = "file_log")
    )]
    pub file_log_max_files: Option<usize>,
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}
