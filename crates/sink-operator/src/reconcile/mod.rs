//! Turns sink watch events into agent configuration updates.
//!
//! Every handled event ends in one of two outcomes: nothing changed, or the
//! registry was rendered and applied to the agent. Applying consists of two
//! independent effects, patching the agent ConfigMap and deleting the agent
//! pods so they restart with the new file. Either effect may fail without
//! preventing the other, failures are logged and never retried.

use std::{error::Error, fmt::Debug, future::Future, pin::pin, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{Api, Resource, ResourceExt, core::object::HasSpec};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::instrument;

use crate::watch::{WatchEvent, watch_events};

mod client;

pub use client::{Error as KubeTargetError, KubeAgentTarget};

/// A shipping agent reading its configuration from a ConfigMap key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Agent {
    pub config_map: &'static str,
    pub data_key: &'static str,
    /// Label selector matching all agent pods.
    pub pod_selector: &'static str,
}

/// A registry that can be kept in sync with resources of kind `K`.
pub trait SinkStore<K> {
    fn upsert(&self, sink: &K);
    fn remove(&self, sink: &K);
    fn render(&self) -> String;
}

/// The cluster side effects of applying a rendered configuration.
#[async_trait]
pub trait AgentConfigTarget: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    async fn patch_config(
        &self,
        config_map: &str,
        patch: json_patch::Patch,
    ) -> Result<(), Self::Error>;

    async fn restart_agents(&self, pod_selector: &str) -> Result<(), Self::Error>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ApplyReport {
    pub config_patched: bool,
    pub agents_restarted: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The event did not change any spec.
    Unchanged,
    Applied(ApplyReport),
}

/// Builds the JSON patch replacing a single ConfigMap data key.
pub fn replace_data_patch(
    data_key: &str,
    text: String,
) -> Result<json_patch::Patch, serde_json::Error> {
    // Keys are escaped as JSON pointer reference tokens.
    let token = data_key.replace('~', "~0").replace('/', "~1");
    serde_json::from_value(json!([{
        "op": "replace",
        "path": format!("/data/{token}"),
        "value": text,
    }]))
}

/// Writes `text` to `data_key` of the agent ConfigMap and restarts the agent.
#[instrument(
    skip(target, agent, data_key, text),
    fields(k8s.configmap.name = agent.config_map, k8s.configmap.key = data_key)
)]
pub async fn apply<T>(target: &T, agent: &Agent, data_key: &str, text: String) -> ApplyReport
where
    T: AgentConfigTarget + ?Sized,
{
    let mut report = ApplyReport::default();

    match replace_data_patch(data_key, text) {
        Ok(patch) => match target.patch_config(agent.config_map, patch).await {
            Ok(()) => {
                tracing::info!("patched agent configuration");
                report.config_patched = true;
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn Error,
                    "failed to patch agent configuration"
                );
            }
        },
        Err(err) => {
            tracing::error!(
                error = &err as &dyn Error,
                "failed to build agent configuration patch"
            );
        }
    }

    match target.restart_agents(agent.pod_selector).await {
        Ok(()) => {
            tracing::info!(pod_selector = agent.pod_selector, "restarted agent pods");
            report.agents_restarted = true;
        }
        Err(err) => {
            tracing::error!(
                pod_selector = agent.pod_selector,
                error = &err as &dyn Error,
                "failed to restart agent pods"
            );
        }
    }

    report
}

/// Keeps an agent configuration in sync with a sink registry.
#[derive(Debug)]
pub struct Reconciler<S, T> {
    store: Arc<S>,
    target: Arc<T>,
    agent: Agent,
}

impl<S, T> Clone for Reconciler<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            target: Arc::clone(&self.target),
            agent: self.agent,
        }
    }
}

impl<S, T> Reconciler<S, T>
where
    T: AgentConfigTarget,
{
    pub fn new(store: Arc<S>, target: Arc<T>, agent: Agent) -> Self {
        Self {
            store,
            target,
            agent,
        }
    }

    pub async fn handle<K>(&self, event: WatchEvent<K>) -> Outcome
    where
        K: Resource + HasSpec,
        K::Spec: PartialEq,
        S: SinkStore<K>,
    {
        match event {
            WatchEvent::Added(sink) => {
                tracing::info!(sink.name = %sink.name_any(), "sink added");
                self.store.upsert(&sink);
            }
            WatchEvent::Updated(old, new) => {
                if old.spec() == new.spec() {
                    tracing::debug!(sink.name = %new.name_any(), "sink spec unchanged");
                    return Outcome::Unchanged;
                }
                tracing::info!(sink.name = %new.name_any(), "sink updated");
                self.store.upsert(&new);
            }
            WatchEvent::Deleted(sink) => {
                tracing::info!(sink.name = %sink.name_any(), "sink deleted");
                self.store.remove(&sink);
            }
        }

        let text = SinkStore::<K>::render(&*self.store);
        Outcome::Applied(apply(&*self.target, &self.agent, self.agent.data_key, text).await)
    }

    /// Handles events for `K` until `shutdown` completes.
    pub async fn run<K>(&self, api: Api<K>, shutdown: impl Future<Output = ()>)
    where
        K: Resource + HasSpec + Clone + DeserializeOwned + Debug + Send + 'static,
        K::Spec: PartialEq,
        S: SinkStore<K>,
    {
        let mut events = pin!(watch_events(api).take_until(shutdown));
        while let Some(event) = events.next().await {
            self.handle(event).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use serde_json::Value;
    use snafu::Snafu;

    use super::*;
    use crate::{
        crd::{LogSink, LogSinkSpec},
        log::{FLUENT_BIT, LogSinkRegistry},
    };

    #[derive(Debug, Snafu)]
    #[snafu(display("injected failure"))]
    pub(crate) struct InjectedFailure;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub(crate) enum Call {
        Patch { config_map: String, patch: Value },
        Restart { pod_selector: String },
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeTarget {
        pub(crate) calls: Mutex<Vec<Call>>,
        pub(crate) fail_patch: bool,
        pub(crate) fail_restart: bool,
    }

    impl FakeTarget {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("lock not poisoned").clone()
        }
    }

    #[async_trait]
    impl AgentConfigTarget for FakeTarget {
        type Error = InjectedFailure;

        async fn patch_config(
            &self,
            config_map: &str,
            patch: json_patch::Patch,
        ) -> Result<(), Self::Error> {
            self.calls.lock().expect("lock not poisoned").push(Call::Patch {
                config_map: config_map.to_owned(),
                patch: serde_json::to_value(patch).expect("patch serializes"),
            });
            if self.fail_patch {
                return InjectedFailureSnafu.fail();
            }
            Ok(())
        }

        async fn restart_agents(&self, pod_selector: &str) -> Result<(), Self::Error> {
            self.calls.lock().expect("lock not poisoned").push(Call::Restart {
                pod_selector: pod_selector.to_owned(),
            });
            if self.fail_restart {
                return InjectedFailureSnafu.fail();
            }
            Ok(())
        }
    }

    fn sink(name: &str, host: &str, resource_version: &str) -> LogSink {
        let mut sink = LogSink::new(
            name,
            LogSinkSpec {
                sink: crate::log::tests::syslog(host, 514),
            },
        );
        sink.metadata.namespace = Some("ns1".to_owned());
        sink.metadata.resource_version = Some(resource_version.to_owned());
        sink
    }

    fn reconciler(target: FakeTarget) -> Reconciler<LogSinkRegistry, FakeTarget> {
        Reconciler::new(
            Arc::new(LogSinkRegistry::default()),
            Arc::new(target),
            FLUENT_BIT,
        )
    }

    fn patch_call(text: &str) -> Call {
        Call::Patch {
            config_map: "fluent-bit".to_owned(),
            patch: json!([{"op": "replace", "path": "/data/outputs.conf", "value": text}]),
        }
    }

    fn restart_call() -> Call {
        Call::Restart {
            pod_selector: "app=fluent-bit".to_owned(),
        }
    }

    #[test]
    fn patch_replaces_data_key() {
        let patch = replace_data_patch("outputs.conf", "text".to_owned()).expect("valid patch");

        assert_eq!(
            serde_json::to_value(patch).expect("patch serializes"),
            json!([{"op": "replace", "path": "/data/outputs.conf", "value": "text"}])
        );
    }

    #[test]
    fn patch_escapes_pointer_tokens() {
        let patch = replace_data_patch("a/b~c", String::new()).expect("valid patch");

        assert_eq!(
            serde_json::to_value(patch).expect("patch serializes")[0]["path"],
            json!("/data/a~1b~0c")
        );
    }

    #[tokio::test]
    async fn added_sink_patches_and_restarts() {
        let reconciler = reconciler(FakeTarget::default());

        let outcome = reconciler
            .handle(WatchEvent::Added(sink("s1", "example.com", "1")))
            .await;

        assert_eq!(
            outcome,
            Outcome::Applied(ApplyReport {
                config_patched: true,
                agents_restarted: true,
            })
        );
        assert_eq!(
            reconciler.target.calls(),
            vec![patch_call(&reconciler.store.render()), restart_call()]
        );
    }

    #[tokio::test]
    async fn update_without_spec_change_is_a_noop() {
        let reconciler = reconciler(FakeTarget::default());

        let outcome = reconciler
            .handle(WatchEvent::Updated(
                sink("s1", "example.com", "1"),
                sink("s1", "example.com", "2"),
            ))
            .await;

        assert_eq!(outcome, Outcome::Unchanged);
        assert!(reconciler.target.calls().is_empty());
    }

    #[tokio::test]
    async fn update_with_spec_change_applies_new_spec() {
        let reconciler = reconciler(FakeTarget::default());

        reconciler
            .handle(WatchEvent::Updated(
                sink("s1", "old.example.com", "1"),
                sink("s1", "new.example.com", "2"),
            ))
            .await;

        let rendered = reconciler.store.render();
        assert!(rendered.contains("new.example.com:514"));
        assert_eq!(
            reconciler.target.calls(),
            vec![patch_call(&rendered), restart_call()]
        );
    }

    #[tokio::test]
    async fn deleted_sink_renders_null_output() {
        let reconciler = reconciler(FakeTarget::default());
        reconciler
            .handle(WatchEvent::Added(sink("s1", "example.com", "1")))
            .await;

        reconciler
            .handle(WatchEvent::Deleted(sink("s1", "example.com", "1")))
            .await;

        assert_eq!(reconciler.target.calls().last(), Some(&restart_call()));
        assert_eq!(
            reconciler.target.calls()[2],
            patch_call("\n[OUTPUT]\n    Name null\n    Match *\n")
        );
    }

    #[tokio::test]
    async fn patch_failure_still_restarts_agents() {
        let reconciler = reconciler(FakeTarget {
            fail_patch: true,
            ..FakeTarget::default()
        });

        let outcome = reconciler
            .handle(WatchEvent::Added(sink("s1", "example.com", "1")))
            .await;

        assert_eq!(
            outcome,
            Outcome::Applied(ApplyReport {
                config_patched: false,
                agents_restarted: true,
            })
        );
        assert_eq!(reconciler.target.calls().len(), 2);
    }

    #[tokio::test]
    async fn restart_failure_keeps_patch() {
        let reconciler = reconciler(FakeTarget {
            fail_restart: true,
            ..FakeTarget::default()
        });

        let outcome = reconciler
            .handle(WatchEvent::Added(sink("s1", "example.com", "1")))
            .await;

        assert_eq!(
            outcome,
            Outcome::Applied(ApplyReport {
                config_patched: true,
                agents_restarted: false,
            })
        );
    }

    #[tokio::test]
    async fn apply_uses_requested_data_key() {
        let target = FakeTarget::default();

        apply(&target, &FLUENT_BIT, "filter.conf", "text".to_owned()).await;

        assert_eq!(
            target.calls()[0],
            Call::Patch {
                config_map: "fluent-bit".to_owned(),
                patch: json!([{"op": "replace", "path": "/data/filter.conf", "value": "text"}]),
            }
        );
    }
}
