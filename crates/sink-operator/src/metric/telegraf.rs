//! Telegraf configuration documents.
//!
//! Telegraf reads TOML. The documents written here only ever contain a
//! `global_tags` table and the `inputs`/`outputs` tables holding arrays of
//! plugin tables, so the table layout is written here while every key and
//! value is encoded by the `toml` crate. The layout mirrors what Telegraf's
//! own tooling produces: two-space indented plugin headers, four-space
//! indented options, keys sorted alphabetically. Nested option tables are
//! written inline.

use std::{collections::BTreeMap, fmt::Write as _};

use crate::crd::{MetricEntry, MetricValue};

/// Substituted whenever a document would lack inputs or outputs, since
/// Telegraf refuses to start without both.
pub const FALLBACK_CONFIG: &str = "[inputs]\n\n  [[inputs.cpu]]\n\n[outputs]\n\n  [[outputs.discard]]\n";

const TYPE_KEY: &str = "type";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelegrafConfig {
    global_tags: BTreeMap<String, String>,
    inputs: BTreeMap<String, Vec<MetricEntry>>,
    outputs: BTreeMap<String, Vec<MetricEntry>>,
}

impl TelegrafConfig {
    /// Starts a document, tagging all metrics with `cluster_name` if known.
    pub fn new(cluster_name: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(cluster_name) = cluster_name {
            config
                .global_tags
                .insert("cluster_name".to_owned(), cluster_name.to_owned());
        }
        config
    }

    /// Adds an input plugin table, the `plugin` name is taken as is.
    pub fn add_input(&mut self, plugin: &str, entry: MetricEntry) {
        self.inputs.entry(plugin.to_owned()).or_default().push(entry);
    }

    /// Adds the entries of a sink, bucketing each under its `type`.
    ///
    /// Entries without a string `type` are skipped.
    pub fn append_entries(&mut self, inputs: &[MetricEntry], outputs: &[MetricEntry]) {
        append_typed(&mut self.inputs, inputs, "inputs");
        append_typed(&mut self.outputs, outputs, "outputs");
    }

    pub fn render(&self) -> String {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return FALLBACK_CONFIG.to_owned();
        }

        let mut tables = Vec::with_capacity(3);

        if !self.global_tags.is_empty() {
            let mut table = String::from("[global_tags]\n");
            for (key, value) in &self.global_tags {
                let value = toml::Value::String(value.clone());
                let _ = writeln!(table, "  {} = {value}", toml_key(key));
            }
            tables.push(table);
        }

        tables.push(plugin_tables("inputs", &self.inputs));
        tables.push(plugin_tables("outputs", &self.outputs));

        tables.join("\n")
    }
}

fn append_typed(
    buckets: &mut BTreeMap<String, Vec<MetricEntry>>,
    entries: &[MetricEntry],
    section: &str,
) {
    for entry in entries {
        let Some(plugin) = entry.get(TYPE_KEY).and_then(MetricValue::as_str) else {
            tracing::debug!(section, "skipping metric sink entry without a string type");
            continue;
        };

        let options: MetricEntry = entry
            .iter()
            .filter(|(key, _)| key.as_str() != TYPE_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        buckets.entry(plugin.to_owned()).or_default().push(options);
    }
}

fn plugin_tables(section: &str, buckets: &BTreeMap<String, Vec<MetricEntry>>) -> String {
    let mut table = format!("[{section}]\n");
    for (plugin, entries) in buckets {
        for entry in entries {
            let _ = write!(table, "\n  [[{section}.{}]]\n", toml_key(plugin));
            for (key, value) in entry {
                let _ = writeln!(
                    table,
                    "    {} = {}",
                    toml_key(key),
                    toml::Value::from(value)
                );
            }
        }
    }
    table
}

/// Writes `key` the way the `toml` serializer does, bare whenever TOML allows
/// it and quoted otherwise.
fn toml_key(key: &str) -> String {
    let line: toml::Table = [(key.to_owned(), toml::Value::Boolean(true))]
        .into_iter()
        .collect();
    toml::to_string(&line)
        .ok()
        .and_then(|line| line.strip_suffix(" = true\n").map(str::to_owned))
        .unwrap_or_else(|| toml::Value::String(key.to_owned()).to_string())
}

impl From<&MetricValue> for toml::Value {
    fn from(value: &MetricValue) -> Self {
        match value {
            MetricValue::Bool(value) => Self::Boolean(*value),
            MetricValue::Integer(value) => Self::Integer(*value),
            MetricValue::Float(value) => Self::Float(*value),
            MetricValue::String(value) => Self::String(value.clone()),
            MetricValue::List(values) => Self::Array(values.iter().map(Self::from).collect()),
            MetricValue::Table(entries) => Self::Table(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from(value)))
                    .collect(),
            ),
        }
    }
}
