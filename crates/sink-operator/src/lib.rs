//! Control plane fanning declarative log and metric sinks out to the shipping
//! agents running on every node.
//!
//! The binary hosts three independent controllers:
//!
//! - the log controller renders [`crd::LogSink`]s and [`crd::ClusterLogSink`]s
//!   into the Fluent Bit configuration,
//! - the metric controller renders [`crd::ClusterMetricSink`]s into the
//!   Telegraf configuration and runs a collector per [`crd::MetricSink`],
//! - the event controller forwards Kubernetes events into the log pipeline.
pub mod cli;
pub mod crd;
pub mod event;
pub mod log;
pub mod metric;
pub mod reconcile;
pub mod utils;
pub mod validation;
pub mod watch;

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use k8s_openapi::api::core::v1::Event;
use kube::{Api, Client, CustomResourceExt};
use snafu::{ResultExt, Snafu};

use crate::{
    cli::{EventControllerArgs, LogControllerArgs, MetricControllerArgs},
    crd::{ClusterLogSink, ClusterMetricSink, LogSink, MetricSink},
    event::{EventController, HttpForwarder},
    log::{CLUSTER_NAME_FILTER_KEY, FLUENT_BIT, LogSinkRegistry},
    metric::{
        MetricSinkRegistry, TELEGRAF,
        namespaced::{KubeNamespacedResources, MetricSinkController},
    },
    reconcile::{KubeAgentTarget, Reconciler},
    utils::{cluster_info, signal::SignalWatcher},
    validation::TelegrafDryRun,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to write CRDs"))]
    WriteCrds { source: io::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to determine the cluster name"))]
    ClusterName { source: cluster_info::Error },

    #[snafu(display("failed to serve event forwarder stats"))]
    ServeStats { source: event::StatsError },

    #[snafu(display("failed to read manifest {path:?}"))]
    ReadManifest { source: io::Error, path: PathBuf },

    #[snafu(display("manifest {path:?} is invalid"))]
    InvalidManifest {
        source: validation::Error,
        path: PathBuf,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Writes the CRDs of all sink kinds as explicit YAML documents.
pub fn write_crds(mut writer: impl Write) -> Result<()> {
    let crds = [
        LogSink::crd(),
        ClusterLogSink::crd(),
        MetricSink::crd(),
        ClusterMetricSink::crd(),
    ];

    for crd in &crds {
        let document = serde_yaml::to_string(crd).context(SerializeCrdSnafu)?;
        write!(writer, "---\n{document}").context(WriteCrdsSnafu)?;
    }

    Ok(())
}

pub async fn create_client() -> Result<Client> {
    Client::try_default().await.context(CreateClientSnafu)
}

/// Runs the log controller until `signal` fires.
///
/// The cluster name filter is applied once at startup, afterwards both sink
/// kinds feed the same registry.
pub async fn run_log_controller(
    client: Client,
    args: LogControllerArgs,
    signal: &SignalWatcher,
) -> Result<()> {
    let cluster_name = cluster_info::cluster_name(&client, args.agent.cluster_name)
        .await
        .context(ClusterNameSnafu)?;
    let target = Arc::new(KubeAgentTarget::new(client.clone(), &args.agent.namespace));

    if let Some(cluster_name) = &cluster_name {
        reconcile::apply(
            &*target,
            &FLUENT_BIT,
            CLUSTER_NAME_FILTER_KEY,
            log::cluster_name_filter(cluster_name),
        )
        .await;
    }

    let registry = Arc::new(LogSinkRegistry::new(args.stats_addr));
    let reconciler = Reconciler::new(registry, target, FLUENT_BIT);

    tracing::info!(namespace = %args.agent.namespace, "starting log controller");
    futures::join!(
        reconciler.run(Api::<LogSink>::all(client.clone()), signal.handle()),
        reconciler.run(Api::<ClusterLogSink>::all(client), signal.handle()),
    );

    Ok(())
}

/// Runs the metric controller until `signal` fires.
pub async fn run_metric_controller(
    client: Client,
    args: MetricControllerArgs,
    signal: &SignalWatcher,
) -> Result<()> {
    let cluster_name = cluster_info::cluster_name(&client, args.agent.cluster_name)
        .await
        .context(ClusterNameSnafu)?;

    let registry = MetricSinkRegistry::new(cluster_name.clone()).with_default_input(
        "kubernetes",
        metric::kubelet_input(args.use_insecure_kubernetes_port),
    );
    let reconciler = Reconciler::new(
        Arc::new(registry),
        Arc::new(KubeAgentTarget::new(client.clone(), &args.agent.namespace)),
        TELEGRAF,
    );
    let collectors =
        MetricSinkController::new(KubeNamespacedResources::new(client.clone()), cluster_name);

    tracing::info!(namespace = %args.agent.namespace, "starting metric controller");
    futures::join!(
        reconciler.run(Api::<ClusterMetricSink>::all(client.clone()), signal.handle()),
        collectors.run(Api::<MetricSink>::all(client), signal.handle()),
    );

    Ok(())
}

/// Runs the event controller and its stats endpoint until `signal` fires.
pub async fn run_event_controller(
    client: Client,
    args: EventControllerArgs,
    signal: &SignalWatcher,
) -> Result<()> {
    tracing::info!(forwarder.url = %args.forwarder_url, "starting event controller");
    let controller = Arc::new(EventController::new(HttpForwarder::new(args.forwarder_url)));

    let stats = event::serve_stats(
        args.metrics_port,
        event::stats_router(Arc::clone(&controller)),
        signal.handle(),
    );
    let ((), served) = futures::join!(
        controller.run(Api::<Event>::all(client), signal.handle()),
        stats
    );

    served.context(ServeStatsSnafu)
}

/// Checks the sink manifest stored at `path`.
pub async fn validate_file(path: &Path, telegraf_binary: PathBuf) -> Result<()> {
    let manifest = tokio::fs::read_to_string(path)
        .await
        .context(ReadManifestSnafu { path })?;

    validation::validate_manifest(&TelegrafDryRun::new(telegraf_binary), &manifest)
        .await
        .context(InvalidManifestSnafu { path })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn crds_are_separate_documents() {
        let mut output = Vec::new();
        write_crds(&mut output).expect("CRDs serialize");
        let output = String::from_utf8(output).expect("output is UTF-8");

        let names: Vec<_> = serde_yaml::Deserializer::from_str(&output)
            .map(|document| {
                let crd = serde_yaml::Value::deserialize(document).expect("document is YAML");
                crd["metadata"]["name"]
                    .as_str()
                    .expect("CRD has a name")
                    .to_owned()
            })
            .collect();

        assert_eq!(
            names,
            [
                "logsinks.observability.knative.dev",
                "clusterlogsinks.observability.knative.dev",
                "metricsinks.observability.knative.dev",
                "clustermetricsinks.observability.knative.dev",
            ]
        );
    }
}
