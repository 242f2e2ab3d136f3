use std::io;

use clap::Parser;
use sink_operator::{
    cli::{Command, Opts},
    utils::signal::{SignalError, SignalWatcher},
};
use sink_telemetry::Tracing;
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "sink-operator";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: sink_telemetry::tracing::Error,
    },

    #[snafu(display("failed to register shutdown signal handlers"))]
    RegisterSignals { source: SignalError },

    #[snafu(display("failed to print CRDs"))]
    PrintCrds { source: sink_operator::Error },

    #[snafu(display("controller failed"))]
    Controller { source: sink_operator::Error },

    #[snafu(display("validation failed"))]
    Validate { source: sink_operator::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    let telemetry = opts.command.telemetry().cloned().unwrap_or_default();
    let _tracing_guard = Tracing::pre_configured(APP_NAME, telemetry)
        .init()
        .context(InitTracingSnafu)?;

    match opts.command {
        Command::Crd => sink_operator::write_crds(io::stdout().lock()).context(PrintCrdsSnafu),
        Command::Validate {
            file,
            telegraf_binary,
        } => {
            sink_operator::validate_file(&file, telegraf_binary)
                .await
                .context(ValidateSnafu)?;
            println!("{} is valid", file.display());
            Ok(())
        }
        Command::LogController(args) => {
            let signal = SignalWatcher::termination().context(RegisterSignalsSnafu)?;
            let client = sink_operator::create_client().await.context(ControllerSnafu)?;
            sink_operator::run_log_controller(client, args, &signal)
                .await
                .context(ControllerSnafu)
        }
        Command::MetricController(args) => {
            let signal = SignalWatcher::termination().context(RegisterSignalsSnafu)?;
            let client = sink_operator::create_client().await.context(ControllerSnafu)?;
            sink_operator::run_metric_controller(client, args, &signal)
                .await
                .context(ControllerSnafu)
        }
        Command::EventController(args) => {
            let signal = SignalWatcher::termination().context(RegisterSignalsSnafu)?;
            let client = sink_operator::create_client().await.context(ControllerSnafu)?;
            sink_operator::run_event_controller(client, args, &signal)
                .await
                .context(ControllerSnafu)
        }
    }
}
