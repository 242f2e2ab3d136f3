use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{SinkStatus, raw_object_list_schema};

/// A single collector plugin table. The string `type` entry names the plugin,
/// all other entries are passed through as plugin options.
pub type MetricEntry = BTreeMap<String, MetricValue>;

/// Feeds metrics into a collector dedicated to the sink's namespace.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "observability.knative.dev",
    version = "v1alpha1",
    kind = "MetricSink",
    plural = "metricsinks",
    status = "SinkStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
pub struct MetricSinkSpec {
    #[serde(default)]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub inputs: Vec<MetricEntry>,

    #[serde(default)]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub outputs: Vec<MetricEntry>,
}

/// Adds inputs and outputs to the cluster wide collector.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "observability.knative.dev",
    version = "v1alpha1",
    kind = "ClusterMetricSink",
    plural = "clustermetricsinks",
    status = "SinkStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
pub struct ClusterMetricSinkSpec {
    #[serde(default)]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub inputs: Vec<MetricEntry>,

    #[serde(default)]
    #[schemars(schema_with = "raw_object_list_schema")]
    pub outputs: Vec<MetricEntry>,
}

/// A plugin option value.
///
/// Lists and nested tables are kept as written, so every entry the API server
/// accepts under the free-form schema decodes. Only `null` is rejected, TOML
/// has no way to express it.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<MetricValue>),
    Table(BTreeMap<String, MetricValue>),
}

impl MetricValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Builds an entry from literal pairs.
#[cfg(test)]
pub(crate) fn metric_entry<const N: usize>(pairs: [(&str, MetricValue); N]) -> MetricEntry {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_all_value_kinds() {
        let input = indoc! {r#"
            inputs:
              - type: cpu
                percpu: true
                interval: 10
                ratio: 0.5
                name_override: "load"
                fieldpass: ["usage_idle", "usage_user"]
        "#};

        let spec: ClusterMetricSinkSpec = serde_yaml::from_str(input).expect("valid spec");
        let entry = &spec.inputs[0];

        assert_eq!(entry["type"], MetricValue::from("cpu"));
        assert_eq!(entry["percpu"], MetricValue::Bool(true));
        assert_eq!(entry["interval"], MetricValue::Integer(10));
        assert_eq!(entry["ratio"], MetricValue::Float(0.5));
        assert_eq!(entry["name_override"], MetricValue::from("load"));
        assert_eq!(
            entry["fieldpass"],
            MetricValue::List(vec!["usage_idle".into(), "usage_user".into()])
        );
        assert!(spec.outputs.is_empty());
    }

    #[test]
    fn non_string_type_is_not_a_str() {
        assert_eq!(MetricValue::Integer(1).as_str(), None);
        assert_eq!(MetricValue::from("cpu").as_str(), Some("cpu"));
    }

    #[test]
    fn nested_options_decode_within_a_list() {
        let sinks: Vec<ClusterMetricSink> = serde_json::from_value(json!([
            {
                "apiVersion": "observability.knative.dev/v1alpha1",
                "kind": "ClusterMetricSink",
                "metadata": { "name": "plain" },
                "spec": { "outputs": [{ "type": "discard" }] }
            },
            {
                "apiVersion": "observability.knative.dev/v1alpha1",
                "kind": "ClusterMetricSink",
                "metadata": { "name": "nested" },
                "spec": {
                    "inputs": [{
                        "type": "prometheus",
                        "tags": { "env": "prod" },
                        "tagpass": { "cpu": ["cpu0", "cpu1"] },
                        "percentiles": [50, 95.5]
                    }]
                }
            }
        ]))
        .expect("both sinks decode");

        let entry = &sinks[1].spec.inputs[0];
        assert_eq!(
            entry["tags"],
            MetricValue::Table(BTreeMap::from([("env".to_owned(), "prod".into())]))
        );
        assert_eq!(
            entry["tagpass"],
            MetricValue::Table(BTreeMap::from([(
                "cpu".to_owned(),
                MetricValue::List(vec!["cpu0".into(), "cpu1".into()])
            )]))
        );
        assert_eq!(
            entry["percentiles"],
            MetricValue::List(vec![MetricValue::Integer(50), MetricValue::Float(95.5)])
        );
    }
}
