use std::borrow::Cow;

use kube::CustomResource;
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};

use crate::crd::SinkStatus;

/// Forwards the logs of a single namespace to one destination.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "observability.knative.dev",
    version = "v1alpha1",
    kind = "LogSink",
    plural = "logsinks",
    status = "SinkStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
pub struct LogSinkSpec {
    #[serde(flatten)]
    pub sink: SinkSpec,
}

/// Forwards the logs of every namespace to one destination.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "observability.knative.dev",
    version = "v1alpha1",
    kind = "ClusterLogSink",
    plural = "clusterlogsinks",
    status = "SinkStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
pub struct ClusterLogSinkSpec {
    #[serde(flatten)]
    pub sink: SinkSpec,
}

/// The destination of a log sink, selected by the `type` field.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    Syslog(SyslogSink),
    Webhook(WebhookSink),
}

// Structural schemas cannot express a tagged union, so the variants share one
// flat object and the `type` enum tells them apart.
impl JsonSchema for SinkSpec {
    fn schema_name() -> Cow<'static, str> {
        "SinkSpec".into()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "object",
            "required": ["type"],
            "properties": {
                "type": {
                    "type": "string",
                    "enum": ["syslog", "webhook"],
                },
                "host": {
                    "description": "Syslog host name.",
                    "type": "string",
                },
                "port": {
                    "description": "Syslog port.",
                    "type": "integer",
                    "format": "int32",
                },
                "enable_tls": {
                    "description": "Send syslog messages over TLS.",
                    "type": "boolean",
                },
                "url": {
                    "description": "Webhook URL receiving JSON batches.",
                    "type": "string",
                },
                "insecure_skip_verify": {
                    "description": "Skip verification of the destination certificate.",
                    "type": "boolean",
                },
            },
        })
    }
}

impl SinkSpec {
    /// The value of the `type` discriminator.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Syslog(_) => "syslog",
            Self::Webhook(_) => "webhook",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SyslogSink {
    pub host: String,
    pub port: i32,

    #[serde(default)]
    pub enable_tls: bool,

    /// Only honoured when `enable_tls` is set.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WebhookSink {
    pub url: String,

    /// Only honoured for `https` URLs.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kube::CustomResourceExt;
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_syslog_sink() {
        let input = indoc! {"
            apiVersion: observability.knative.dev/v1alpha1
            kind: LogSink
            metadata:
              name: papertrail
              namespace: prod
            spec:
              type: syslog
              host: logs.example.com
              port: 514
              enable_tls: true
        "};

        let sink: LogSink = serde_yaml::from_str(input).expect("valid LogSink");

        assert_eq!(
            sink.spec.sink,
            SinkSpec::Syslog(SyslogSink {
                host: "logs.example.com".to_owned(),
                port: 514,
                enable_tls: true,
                insecure_skip_verify: false,
            })
        );
    }

    #[test]
    fn deserialize_webhook_cluster_sink() {
        let input = indoc! {"
            apiVersion: observability.knative.dev/v1alpha1
            kind: ClusterLogSink
            metadata:
              name: collector
            spec:
              type: webhook
              url: https://collector.example.com/ingest
              insecure_skip_verify: true
        "};

        let sink: ClusterLogSink = serde_yaml::from_str(input).expect("valid ClusterLogSink");

        assert_eq!(sink.spec.sink.type_name(), "webhook");
        assert_eq!(
            sink.spec.sink,
            SinkSpec::Webhook(WebhookSink {
                url: "https://collector.example.com/ingest".to_owned(),
                insecure_skip_verify: true,
            })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let input = "type: kafka\nhost: example.com\n";

        assert!(serde_yaml::from_str::<LogSinkSpec>(input).is_err());
    }

    #[test]
    fn crd_schema_is_a_flat_object() {
        let crd = serde_json::to_value(LogSink::crd()).expect("serializable CRD");
        let spec = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"];

        assert_eq!(spec["type"], "object");
        assert_eq!(
            spec["properties"]["type"]["enum"],
            json!(["syslog", "webhook"])
        );
        assert_eq!(spec["properties"]["port"]["type"], "integer");
    }
}
