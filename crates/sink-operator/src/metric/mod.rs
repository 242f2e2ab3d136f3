//! Metric sinks and the Telegraf collectors consuming them.
//!
//! Cluster metric sinks are merged into a single document for the cluster
//! wide Telegraf DaemonSet. Namespaced metric sinks each get a dedicated
//! collector Deployment, see [`namespaced`].

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use kube::ResourceExt;

use crate::{
    crd::{ClusterMetricSink, ClusterMetricSinkSpec, MetricEntry, MetricValue},
    reconcile::{Agent, SinkStore},
};

pub mod namespaced;
mod telegraf;

pub use telegraf::{FALLBACK_CONFIG, TelegrafConfig};

/// The Telegraf DaemonSet consuming the rendered cluster sinks.
pub const TELEGRAF: Agent = Agent {
    config_map: "telegraf",
    data_key: "cluster-metric-sinks.conf",
    pod_selector: "app=telegraf",
};

/// The kubelet metrics input every node-local collector starts with.
///
/// The read-only port needs no credentials, the secure port is scraped with
/// the pod's service account token.
pub fn kubelet_input(insecure_port: bool) -> MetricEntry {
    if insecure_port {
        MetricEntry::from([("url".to_owned(), "http://127.0.0.1:10255".into())])
    } else {
        MetricEntry::from([
            (
                "bearer_token".to_owned(),
                "/var/run/secrets/kubernetes.io/serviceaccount/token".into(),
            ),
            ("insecure_skip_verify".to_owned(), MetricValue::Bool(true)),
            ("url".to_owned(), "https://127.0.0.1:10250".into()),
        ])
    }
}

/// Renders a single sink the way the cluster collector would run it, on top
/// of the secure kubelet input.
pub fn sink_config(inputs: &[MetricEntry], outputs: &[MetricEntry]) -> String {
    let mut config = TelegrafConfig::default();
    config.add_input("kubernetes", kubelet_input(false));
    config.append_entries(inputs, outputs);
    config.render()
}

/// Concurrency-safe table of the current cluster metric sinks.
#[derive(Debug, Default)]
pub struct MetricSinkRegistry {
    cluster_name: Option<String>,
    default_inputs: Vec<(String, MetricEntry)>,
    sinks: RwLock<BTreeMap<String, ClusterMetricSinkSpec>>,
}

impl MetricSinkRegistry {
    pub fn new(cluster_name: Option<String>) -> Self {
        Self {
            cluster_name,
            ..Self::default()
        }
    }

    /// Adds an input rendered ahead of all sink inputs of the same plugin.
    pub fn with_default_input(mut self, plugin: impl Into<String>, entry: MetricEntry) -> Self {
        self.default_inputs.push((plugin.into(), entry));
        self
    }

    pub fn upsert_sink(&self, name: &str, spec: ClusterMetricSinkSpec) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), spec);
    }

    /// Removes a sink. Unknown sinks are ignored.
    pub fn delete_sink(&self, name: &str) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Renders the Telegraf document for the defaults plus all sinks, in sink
    /// name order.
    pub fn render(&self) -> String {
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut config = TelegrafConfig::new(self.cluster_name.as_deref());
        for (plugin, entry) in &self.default_inputs {
            config.add_input(plugin, entry.clone());
        }
        for spec in sinks.values() {
            config.append_entries(&spec.inputs, &spec.outputs);
        }

        config.render()
    }
}

impl SinkStore<ClusterMetricSink> for MetricSinkRegistry {
    fn upsert(&self, sink: &ClusterMetricSink) {
        self.upsert_sink(&sink.name_any(), sink.spec.clone());
    }

    fn remove(&self, sink: &ClusterMetricSink) {
        self.delete_sink(&sink.name_any());
    }

    fn render(&self) -> String {
        Self::render(self)
    }
}
