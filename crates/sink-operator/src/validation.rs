//! Admission rules for sink resources.
//!
//! Log sinks are checked structurally. Metric sinks are additionally rendered
//! and handed to the collector itself, which is the only authority on which
//! plugin options it accepts.

use std::{ffi::OsString, io, path::PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tokio::process::Command;

use crate::{
    crd::{ClusterLogSink, ClusterMetricSink, LogSink, MetricEntry, MetricSink, SinkSpec},
    metric,
};

/// Added to every cluster collector, sinks must not configure it again.
const RESERVED_INPUT: &str = "kubernetes";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("changing the sink type from {old:?} to {new:?} is not allowed"))]
    ChangedSinkType {
        old: &'static str,
        new: &'static str,
    },

    #[snafu(display("syslog host must not be empty"))]
    EmptySyslogHost,

    #[snafu(display("syslog port {port} is invalid, it must be between 1 and 65535"))]
    InvalidSyslogPort { port: i32 },

    #[snafu(display("webhook URL must not be empty"))]
    EmptyWebhookUrl,

    #[snafu(display("every entry of {section} must specify a type"))]
    MissingEntryType { section: &'static str },

    #[snafu(display("the type of every entry of {section} must be a string"))]
    NonStringEntryType { section: &'static str },

    #[snafu(display("the kubernetes input is configured by default and cannot be added again"))]
    ReservedInput,

    #[snafu(display("the collector rejected the metric sink configuration"))]
    InvalidMetricConfig { source: DryRunError },

    #[snafu(display("failed to parse sink manifest"))]
    ParseManifest { source: serde_yaml::Error },

    #[snafu(display("unsupported manifest kind {kind:?}"))]
    UnsupportedKind { kind: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum DryRunError {
    #[snafu(display("failed to write configuration to a temporary file"))]
    WriteConfig { source: io::Error },

    #[snafu(display("failed to run {binary:?}"))]
    Spawn { source: io::Error, binary: OsString },

    #[snafu(display("configuration test exited with {status}: {stderr}"))]
    Rejected { status: String, stderr: String },
}

/// Checks a rendered collector configuration without running the collector
/// for real.
#[async_trait]
pub trait DryRun: Send + Sync {
    async fn check(&self, config: &str) -> Result<(), DryRunError>;
}

/// Runs `telegraf --config <file> --test` against a temporary file.
#[derive(Clone, Debug)]
pub struct TelegrafDryRun {
    binary: PathBuf,
}

impl Default for TelegrafDryRun {
    fn default() -> Self {
        Self::new("telegraf")
    }
}

impl TelegrafDryRun {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl DryRun for TelegrafDryRun {
    async fn check(&self, config: &str) -> Result<(), DryRunError> {
        let file = tempfile::Builder::new()
            .prefix("telegraf")
            .suffix(".conf")
            .tempfile()
            .context(WriteConfigSnafu)?;
        tokio::fs::write(file.path(), config)
            .await
            .context(WriteConfigSnafu)?;

        let output = Command::new(&self.binary)
            .arg("--config")
            .arg(file.path())
            .arg("--test")
            .output()
            .await
            .context(SpawnSnafu {
                binary: self.binary.as_os_str(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            RejectedSnafu {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .fail()
        }
    }
}

/// Validates a log sink, `old` being the stored version when updating.
pub fn validate_log_sink(old: Option<&SinkSpec>, new: &SinkSpec) -> Result<()> {
    if let Some(old) = old
        && old.type_name() != new.type_name()
    {
        return ChangedSinkTypeSnafu {
            old: old.type_name(),
            new: new.type_name(),
        }
        .fail();
    }

    match new {
        SinkSpec::Syslog(syslog) => {
            snafu::ensure!(!syslog.host.is_empty(), EmptySyslogHostSnafu);
            snafu::ensure!(
                (1..=65535).contains(&syslog.port),
                InvalidSyslogPortSnafu { port: syslog.port }
            );
        }
        SinkSpec::Webhook(webhook) => {
            snafu::ensure!(!webhook.url.is_empty(), EmptyWebhookUrlSnafu);
        }
    }

    Ok(())
}

fn check_entry_types<'a>(section: &'static str, entries: &'a [MetricEntry]) -> Result<Vec<&'a str>> {
    entries
        .iter()
        .map(|entry| {
            let value = entry
                .get("type")
                .ok_or(Error::MissingEntryType { section })?;
            value.as_str().ok_or(Error::NonStringEntryType { section })
        })
        .collect()
}

/// Validates the entries of a metric sink and lets `dry_run` check the
/// rendered configuration.
pub async fn validate_metric_sink(
    dry_run: &(impl DryRun + ?Sized),
    inputs: &[MetricEntry],
    outputs: &[MetricEntry],
) -> Result<()> {
    let input_types = check_entry_types("inputs", inputs)?;
    snafu::ensure!(!input_types.contains(&RESERVED_INPUT), ReservedInputSnafu);
    check_entry_types("outputs", outputs)?;

    dry_run
        .check(&metric::sink_config(inputs, outputs))
        .await
        .context(InvalidMetricConfigSnafu)
}

#[derive(Deserialize)]
struct TypeMeta {
    kind: String,
}

/// Validates a single YAML manifest of any sink kind as if it was created.
pub async fn validate_manifest(dry_run: &(impl DryRun + ?Sized), manifest: &str) -> Result<()> {
    let TypeMeta { kind } = serde_yaml::from_str(manifest).context(ParseManifestSnafu)?;

    match kind.as_str() {
        "LogSink" => {
            let sink: LogSink = serde_yaml::from_str(manifest).context(ParseManifestSnafu)?;
            validate_log_sink(None, &sink.spec.sink)
        }
        "ClusterLogSink" => {
            let sink: ClusterLogSink =
                serde_yaml::from_str(manifest).context(ParseManifestSnafu)?;
            validate_log_sink(None, &sink.spec.sink)
        }
        "MetricSink" => {
            let sink: MetricSink = serde_yaml::from_str(manifest).context(ParseManifestSnafu)?;
            validate_metric_sink(dry_run, &sink.spec.inputs, &sink.spec.outputs).await
        }
        "ClusterMetricSink" => {
            let sink: ClusterMetricSink =
                serde_yaml::from_str(manifest).context(ParseManifestSnafu)?;
            validate_metric_sink(dry_run, &sink.spec.inputs, &sink.spec.outputs).await
        }
        _ => UnsupportedKindSnafu { kind }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::{
        crd::{MetricValue, metric_entry},
        log::tests::{syslog, webhook},
    };

    #[derive(Debug, Default)]
    struct FakeDryRun {
        checked: Mutex<Vec<String>>,
        reject: bool,
    }

    #[async_trait]
    impl DryRun for FakeDryRun {
        async fn check(&self, config: &str) -> Result<(), DryRunError> {
            self.checked
                .lock()
                .expect("lock not poisoned")
                .push(config.to_owned());
            if self.reject {
                return RejectedSnafu {
                    status: "exit status: 1",
                    stderr: "unknown plugin",
                }
                .fail();
            }
            Ok(())
        }
    }

    #[rstest]
    #[case::syslog(syslog("example.com", 514))]
    #[case::lowest_port(syslog("example.com", 1))]
    #[case::highest_port(syslog("example.com", 65535))]
    #[case::webhook(webhook("https://example.com"))]
    fn valid_log_sinks(#[case] spec: SinkSpec) {
        validate_log_sink(None, &spec).expect("valid sink");
    }

    #[rstest]
    #[case::empty_host(syslog("", 514))]
    #[case::port_zero(syslog("example.com", 0))]
    #[case::port_too_large(syslog("example.com", 65536))]
    #[case::negative_port(syslog("example.com", -1))]
    #[case::empty_url(webhook(""))]
    fn invalid_log_sinks(#[case] spec: SinkSpec) {
        assert!(validate_log_sink(None, &spec).is_err());
    }

    #[test]
    fn sink_type_cannot_change() {
        let result = validate_log_sink(
            Some(&syslog("example.com", 514)),
            &webhook("https://example.com"),
        );

        assert!(matches!(
            result,
            Err(Error::ChangedSinkType {
                old: "syslog",
                new: "webhook"
            })
        ));
    }

    #[test]
    fn same_type_update_is_allowed() {
        validate_log_sink(
            Some(&syslog("old.example.com", 514)),
            &syslog("new.example.com", 514),
        )
        .expect("valid update");
    }

    #[tokio::test]
    async fn metric_sink_is_dry_run() {
        let dry_run = FakeDryRun::default();

        validate_metric_sink(
            &dry_run,
            &[metric_entry([("type", "cpu".into())])],
            &[metric_entry([("type", "discard".into())])],
        )
        .await
        .expect("valid sink");

        let checked = dry_run.checked.lock().expect("lock not poisoned");
        assert_eq!(checked.len(), 1);
        assert!(checked[0].contains("[[inputs.cpu]]"));
        assert!(checked[0].contains("[[outputs.discard]]"));
    }

    #[rstest]
    #[case::missing_input_type(vec![metric_entry([("foo", "bar".into())])], vec![])]
    #[case::missing_output_type(vec![], vec![metric_entry([("foo", "bar".into())])])]
    #[case::non_string_type(vec![metric_entry([("type", MetricValue::Integer(1))])], vec![])]
    #[case::kubernetes_input(vec![metric_entry([("type", "kubernetes".into())])], vec![])]
    #[tokio::test]
    async fn invalid_metric_sinks_skip_dry_run(
        #[case] inputs: Vec<MetricEntry>,
        #[case] outputs: Vec<MetricEntry>,
    ) {
        let dry_run = FakeDryRun::default();

        let result = validate_metric_sink(&dry_run, &inputs, &outputs).await;

        assert!(result.is_err());
        assert!(dry_run.checked.lock().expect("lock not poisoned").is_empty());
    }

    #[tokio::test]
    async fn kubernetes_output_is_allowed() {
        let dry_run = FakeDryRun::default();

        validate_metric_sink(&dry_run, &[], &[metric_entry([("type", "kubernetes".into())])])
            .await
            .expect("only inputs are reserved");
    }

    #[tokio::test]
    async fn rejected_dry_run_is_invalid() {
        let dry_run = FakeDryRun {
            reject: true,
            ..FakeDryRun::default()
        };

        let result = validate_metric_sink(
            &dry_run,
            &[metric_entry([("type", "cpu".into())])],
            &[metric_entry([("type", "nope".into())])],
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::InvalidMetricConfig {
                source: DryRunError::Rejected { .. }
            })
        ));
    }

    #[tokio::test]
    async fn manifests_are_validated_by_kind() {
        let dry_run = FakeDryRun::default();

        let log_sink = indoc! {"
            apiVersion: observability.knative.dev/v1alpha1
            kind: LogSink
            metadata:
              name: my-sink
              namespace: ns1
            spec:
              type: syslog
              host: example.com
              port: 0
        "};
        assert!(matches!(
            validate_manifest(&dry_run, log_sink).await,
            Err(Error::InvalidSyslogPort { port: 0 })
        ));

        let metric_sink = indoc! {"
            apiVersion: observability.knative.dev/v1alpha1
            kind: ClusterMetricSink
            metadata:
              name: my-sink
            spec:
              inputs:
                - type: cpu
              outputs:
                - type: discard
        "};
        validate_manifest(&dry_run, metric_sink)
            .await
            .expect("valid metric sink");

        let config_map = indoc! {"
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: other
        "};
        assert!(matches!(
            validate_manifest(&dry_run, config_map).await,
            Err(Error::UnsupportedKind { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_fails_dry_run() {
        let dry_run = TelegrafDryRun::new("/nonexistent/telegraf");

        assert!(matches!(
            dry_run.check("[inputs]\n").await,
            Err(DryRunError::Spawn { .. })
        ));
    }
}
