//! Custom resources of the `observability.knative.dev` group.
//!
//! Log sinks select a single destination (syslog or webhook), metric sinks
//! carry free-form collector plugin tables. Both come in a namespaced and a
//! cluster scoped flavour.
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};

mod log_sink;
mod metric_sink;

pub use log_sink::*;
pub use metric_sink::*;

/// Status shared by all sink kinds, written by the state updater.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct SinkStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SinkState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum SinkState {
    Created,
    Processed,
}

pub fn raw_object_list_schema(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_omits_unset_fields() {
        let status = SinkStatus {
            state: Some(SinkState::Processed),
            message: None,
        };

        assert_eq!(
            serde_json::to_value(&status).expect("serializable status"),
            serde_json::json!({"state": "Processed"})
        );
    }

    #[test]
    fn raw_object_list_schema_preserves_unknown_fields() {
        let schema = raw_object_list_schema(&mut SchemaGenerator::default());
        let value = serde_json::to_value(&schema).expect("serializable schema");

        assert_eq!(value["items"]["x-kubernetes-preserve-unknown-fields"], true);
    }
}
