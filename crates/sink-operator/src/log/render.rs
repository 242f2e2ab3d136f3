use std::fmt::Write as _;

use serde::Serialize;
use url::{Host, Url};

use crate::{
    crd::{SinkSpec, SyslogSink, WebhookSink},
    log::Sinks,
};

const DEFAULT_NAMESPACE: &str = "default";

/// Entry of the `Sinks` and `ClusterSinks` arrays read by the syslog output
/// plugin. Field order is part of the rendered format.
#[derive(Debug, Serialize)]
struct SyslogEntry<'a> {
    addr: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<TlsConfig>,

    name: &'a str,
}

impl<'a> SyslogEntry<'a> {
    fn new(namespace: Option<&'a str>, name: &'a str, sink: &SyslogSink) -> Self {
        Self {
            addr: format!("{}:{}", sink.host, sink.port),
            namespace,
            tls: sink.enable_tls.then_some(TlsConfig {
                insecure_skip_verify: sink.insecure_skip_verify,
            }),
            name,
        }
    }
}

#[derive(Debug, Serialize)]
struct TlsConfig {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    insecure_skip_verify: bool,
}

pub(super) fn render(sinks: &Sinks, stats_addr: Option<&str>) -> String {
    if sinks.is_empty() {
        let mut config = String::from("\n[OUTPUT]\n    Name null\n    Match *\n");
        if let Some(stats_addr) = stats_addr {
            let _ = writeln!(config, "    StatsAddr {stats_addr}");
        }
        return config;
    }

    let mut config = syslog_config(sinks, stats_addr);
    config.push_str(&webhook_config(sinks));
    config
}

fn canonical_namespace(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Namespaced sinks of a single type, sorted by canonical namespace and name.
fn namespaced<'a, T>(
    sinks: &'a Sinks,
    select: impl Fn(&'a SinkSpec) -> Option<&'a T>,
) -> Vec<(&'a str, &'a str, &'a T)> {
    let mut selected: Vec<_> = sinks
        .namespaced
        .iter()
        .filter_map(|((namespace, name), spec)| {
            select(spec).map(|sink| (canonical_namespace(namespace), name.as_str(), sink))
        })
        .collect();
    selected.sort_by_key(|&(namespace, name, _)| (namespace, name));
    selected
}

/// Cluster sinks of a single type. The map is already ordered by name.
fn cluster<'a, T>(
    sinks: &'a Sinks,
    select: impl Fn(&'a SinkSpec) -> Option<&'a T>,
) -> Vec<(&'a str, &'a T)> {
    sinks
        .cluster
        .iter()
        .filter_map(|(name, spec)| select(spec).map(|sink| (name.as_str(), sink)))
        .collect()
}

fn as_syslog(spec: &SinkSpec) -> Option<&SyslogSink> {
    match spec {
        SinkSpec::Syslog(sink) => Some(sink),
        SinkSpec::Webhook(_) => None,
    }
}

fn as_webhook(spec: &SinkSpec) -> Option<&WebhookSink> {
    match spec {
        SinkSpec::Webhook(sink) => Some(sink),
        SinkSpec::Syslog(_) => None,
    }
}

fn syslog_config(sinks: &Sinks, stats_addr: Option<&str>) -> String {
    let namespaced: Vec<_> = namespaced(sinks, as_syslog)
        .into_iter()
        .map(|(namespace, name, sink)| SyslogEntry::new(Some(namespace), name, sink))
        .collect();
    let cluster: Vec<_> = cluster(sinks, as_syslog)
        .into_iter()
        .map(|(name, sink)| SyslogEntry::new(None, name, sink))
        .collect();

    if namespaced.is_empty() && cluster.is_empty() {
        return String::new();
    }

    let mut config = String::from("\n[OUTPUT]\n    Name syslog\n    Match *\n");
    if let Some(stats_addr) = stats_addr {
        let _ = writeln!(config, "    StatsAddr {stats_addr}");
    }
    let _ = writeln!(config, "    Sinks {}", to_json(&namespaced));
    let _ = writeln!(config, "    ClusterSinks {}", to_json(&cluster));
    config
}

fn to_json(entries: &[SyslogEntry<'_>]) -> String {
    serde_json::to_string(entries).unwrap_or_else(|error| {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "failed to serialize syslog sinks, rendering none"
        );
        "[]".to_owned()
    })
}

fn webhook_config(sinks: &Sinks) -> String {
    let namespaced = namespaced(sinks, as_webhook)
        .into_iter()
        .filter_map(|(namespace, name, sink)| {
            http_output(&format!("*_{namespace}_*"), name, sink)
        });
    let cluster = cluster(sinks, as_webhook)
        .into_iter()
        .filter_map(|(name, sink)| http_output("*", name, sink));

    namespaced.chain(cluster).collect()
}

/// Renders one `http` output block. Sinks with an unparsable URL are skipped.
fn http_output(match_pattern: &str, name: &str, sink: &WebhookSink) -> Option<String> {
    let url = match Url::parse(&sink.url) {
        Ok(url) => url,
        Err(error) => {
            tracing::warn!(
                sink.name = name,
                sink.url = %sink.url,
                error = &error as &dyn std::error::Error,
                "skipping webhook sink with unparsable url"
            );
            return None;
        }
    };

    let host = match url.host() {
        Some(Host::Ipv6(address)) => address.to_string(),
        Some(host) => host.to_string(),
        None => String::new(),
    };

    let port = match (url.port(), url.scheme()) {
        (Some(port), _) => port.to_string(),
        (None, "https") => "443".to_owned(),
        (None, "http") => "80".to_owned(),
        (None, _) => String::new(),
    };

    let path = match url.path() {
        "" => "/",
        path => path,
    };

    let mut extras = String::new();
    if url.scheme() == "https" {
        extras.push_str("    tls On\n");
        if sink.insecure_skip_verify {
            extras.push_str("    tls.verify Off\n");
        }
    }

    Some(format!(
        "\n[OUTPUT]\n    Name http\n    Match {match_pattern}\n    Format json\n    Host {host}\n    Port {port}\n    URI {path}\n{extras}\n"
    ))
}
