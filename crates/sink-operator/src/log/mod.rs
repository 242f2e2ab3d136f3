//! The log sink registry feeding the Fluent Bit `outputs.conf`.
//!
//! Namespaced and cluster sinks live in separate maps behind a single
//! [`RwLock`]. Rendering copies both maps under the read lock and formats the
//! copy afterwards, so writers are never blocked by formatting.

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use kube::ResourceExt;

use crate::{
    crd::{ClusterLogSink, LogSink, SinkSpec},
    reconcile::{Agent, SinkStore},
};

mod render;

/// The Fluent Bit DaemonSet consuming the rendered outputs.
pub const FLUENT_BIT: Agent = Agent {
    config_map: "fluent-bit",
    data_key: "outputs.conf",
    pod_selector: "app=fluent-bit",
};

/// ConfigMap key of the filter stamping every record with the cluster name.
pub const CLUSTER_NAME_FILTER_KEY: &str = "cluster-name-filter.conf";

/// Renders the Fluent Bit filter adding a `cluster_name` field to every record.
pub fn cluster_name_filter(cluster_name: &str) -> String {
    format!("\n[FILTER]\n    Name record_modifier\n    Match *\n    Record cluster_name {cluster_name}\n")
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Sinks {
    /// Keyed by `(namespace, name)`, the namespace as reported by the API.
    pub(crate) namespaced: BTreeMap<(String, String), SinkSpec>,
    pub(crate) cluster: BTreeMap<String, SinkSpec>,
}

impl Sinks {
    fn is_empty(&self) -> bool {
        self.namespaced.is_empty() && self.cluster.is_empty()
    }
}

/// Concurrency-safe table of the current log sinks.
#[derive(Debug, Default)]
pub struct LogSinkRegistry {
    stats_addr: Option<String>,
    sinks: RwLock<Sinks>,
}

impl LogSinkRegistry {
    /// Creates an empty registry. When `stats_addr` is set, every rendered
    /// output block reports its statistics to that address.
    pub fn new(stats_addr: Option<String>) -> Self {
        Self {
            stats_addr,
            sinks: RwLock::default(),
        }
    }

    pub fn upsert_sink(&self, namespace: &str, name: &str, spec: SinkSpec) {
        self.write()
            .namespaced
            .insert((namespace.to_owned(), name.to_owned()), spec);
    }

    /// Removes a namespaced sink. Unknown sinks are ignored.
    pub fn delete_sink(&self, namespace: &str, name: &str) {
        self.write()
            .namespaced
            .remove(&(namespace.to_owned(), name.to_owned()));
    }

    pub fn upsert_cluster_sink(&self, name: &str, spec: SinkSpec) {
        self.write().cluster.insert(name.to_owned(), spec);
    }

    /// Removes a cluster sink. Unknown sinks are ignored.
    pub fn delete_cluster_sink(&self, name: &str) {
        self.write().cluster.remove(name);
    }

    /// Renders the Fluent Bit output sections for the current sinks.
    ///
    /// Identical registry contents always produce byte-identical text,
    /// regardless of the order in which sinks were inserted.
    pub fn render(&self) -> String {
        let sinks = self.read().clone();
        render::render(&sinks, self.stats_addr.as_deref())
    }

    fn read(&self) -> RwLockReadGuard<'_, Sinks> {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sinks> {
        self.sinks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SinkStore<LogSink> for LogSinkRegistry {
    fn upsert(&self, sink: &LogSink) {
        let namespace = sink.namespace().unwrap_or_default();
        self.upsert_sink(&namespace, &sink.name_any(), sink.spec.sink.clone());
    }

    fn remove(&self, sink: &LogSink) {
        let namespace = sink.namespace().unwrap_or_default();
        self.delete_sink(&namespace, &sink.name_any());
    }

    fn render(&self) -> String {
        Self::render(self)
    }
}

impl SinkStore<ClusterLogSink> for LogSinkRegistry {
    fn upsert(&self, sink: &ClusterLogSink) {
        self.upsert_cluster_sink(&sink.name_any(), sink.spec.sink.clone());
    }

    fn remove(&self, sink: &ClusterLogSink) {
        self.delete_cluster_sink(&sink.name_any());
    }

    fn render(&self) -> String {
        Self::render(self)
    }
}
