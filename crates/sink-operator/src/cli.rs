//! Command line interface of the sink operator binary.
//!
//! Every controller is its own subcommand so each one can be deployed as a
//! separate workload. All options can also be provided through environment
//! variables, which is how the in-cluster manifests configure them.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use sink_telemetry::tracing::TelemetryOptions;
use url::Url;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the CustomResourceDefinitions of all sink kinds as YAML.
    Crd,

    /// Fan LogSinks and ClusterLogSinks out to the Fluent Bit DaemonSet.
    LogController(LogControllerArgs),

    /// Fan ClusterMetricSinks out to the Telegraf DaemonSet and run a
    /// collector per MetricSink.
    MetricController(MetricControllerArgs),

    /// Forward Kubernetes events into the log pipeline.
    EventController(EventControllerArgs),

    /// Check a sink manifest the way an admission webhook would.
    Validate {
        /// Path of a single YAML document describing one sink.
        file: PathBuf,

        /// The Telegraf binary used to dry run metric sink configurations.
        #[arg(long, env, default_value = "telegraf")]
        telegraf_binary: PathBuf,
    },
}

/// Options shared by every long running controller.
#[derive(Debug, Args)]
pub struct CommonOptions {
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

/// Options of controllers that manage a shipping agent.
#[derive(Debug, Args)]
pub struct AgentOptions {
    /// The namespace the shipping agent and its ConfigMap live in.
    #[arg(long, env)]
    pub namespace: String,

    /// Name of the cluster, added to every shipped record.
    ///
    /// Read from the `pks-system/cluster.name` label of the first node when
    /// not provided.
    #[arg(long, env)]
    pub cluster_name: Option<String>,
}

#[derive(Debug, Args)]
pub struct LogControllerArgs {
    #[command(flatten)]
    pub agent: AgentOptions,

    /// Address Fluent Bit sends its own output statistics to.
    #[arg(long, env)]
    pub stats_addr: Option<String>,

    #[command(flatten)]
    pub common: CommonOptions,
}

#[derive(Debug, Args)]
pub struct MetricControllerArgs {
    #[command(flatten)]
    pub agent: AgentOptions,

    /// Scrape the kubelet on its read-only port instead of the secure one.
    #[arg(long, env)]
    pub use_insecure_kubernetes_port: bool,

    #[command(flatten)]
    pub common: CommonOptions,
}

#[derive(Debug, Args)]
pub struct EventControllerArgs {
    /// Base URL of the Fluent Bit HTTP input events are posted to.
    #[arg(long, env)]
    pub forwarder_url: Url,

    /// Port serving the forwarding counters on `/debug/vars`.
    #[arg(long, env, default_value_t = 6060)]
    pub metrics_port: u16,

    #[command(flatten)]
    pub common: CommonOptions,
}

impl Command {
    /// The telemetry options of long running subcommands.
    pub fn telemetry(&self) -> Option<&TelemetryOptions> {
        match self {
            Self::Crd | Self::Validate { .. } => None,
            Self::LogController(args) => Some(&args.common.telemetry),
            Self::MetricController(args) => Some(&args.common.telemetry),
            Self::EventController(args) => Some(&args.common.telemetry),
        }
    }
}
