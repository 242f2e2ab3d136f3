//! Forwards Kubernetes events into the log pipeline.
//!
//! Every newly observed [`Event`] is turned into a log record that looks like
//! a container log line of the involved object, so namespaced log sinks pick
//! it up like any other log of their namespace. Updates and deletions are
//! only counted.

use std::{
    error::Error as StdError,
    future::Future,
    pin::pin,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::Api;
use serde::Serialize;
use tracing::instrument;

use crate::watch::{WatchEvent, watch_events};

mod http;
mod stats;

pub use http::{Error as HttpForwarderError, HttpForwarder};
pub use stats::{Error as StatsError, serve_stats, stats_router};

const SOURCE_TYPE: &str = "k8s.event";

/// Only every n-th forwarding failure is logged.
const FAILURE_LOG_INTERVAL: u64 = 100;

/// Delivers tagged records to the log agent.
#[async_trait]
pub trait Forwarder: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn post(&self, tag: &str, record: &serde_json::Value) -> Result<(), Self::Error>;
}

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    log: &'a str,
    stream: &'static str,
    kubernetes: KubernetesMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct KubernetesMetadata<'a> {
    host: &'a str,
    pod_name: &'a str,
    namespace_name: &'a str,
    source_type: &'static str,
}

impl<'a> EventRecord<'a> {
    fn new(event: &'a Event) -> Self {
        let involved = &event.involved_object;
        Self {
            log: event.message.as_deref().unwrap_or_default(),
            stream: "stdout",
            kubernetes: KubernetesMetadata {
                host: event
                    .source
                    .as_ref()
                    .and_then(|source| source.host.as_deref())
                    .unwrap_or_default(),
                pod_name: involved.name.as_deref().unwrap_or_default(),
                namespace_name: involved.namespace.as_deref().unwrap_or_default(),
                source_type: SOURCE_TYPE,
            },
        }
    }

    /// Records are tagged so the log agent routes them by namespace.
    fn tag(&self) -> String {
        format!("{SOURCE_TYPE}._{}_", self.kubernetes.namespace_name)
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    update: AtomicU64,
    delete: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    convert_failed: AtomicU64,
}

/// A point in time copy of the forwarding counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ForwarderStats {
    #[serde(rename = "eventcontroller_forwarder_received_count")]
    pub received: u64,

    #[serde(rename = "eventcontroller_forwarder_update_count")]
    pub update: u64,

    #[serde(rename = "eventcontroller_forwarder_delete_count")]
    pub delete: u64,

    #[serde(rename = "eventcontroller_forwarder_sent_count")]
    pub sent: u64,

    #[serde(rename = "eventcontroller_forwarder_failed_count")]
    pub failed: u64,

    #[serde(rename = "eventcontroller_convert_failed_count")]
    pub convert_failed: u64,
}

pub struct EventController<F> {
    forwarder: F,
    counters: Counters,
}

impl<F> EventController<F>
where
    F: Forwarder,
{
    pub fn new(forwarder: F) -> Self {
        Self {
            forwarder,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        let counters = &self.counters;
        ForwarderStats {
            received: counters.received.load(Ordering::Relaxed),
            update: counters.update.load(Ordering::Relaxed),
            delete: counters.delete.load(Ordering::Relaxed),
            sent: counters.sent.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            convert_failed: counters.convert_failed.load(Ordering::Relaxed),
        }
    }

    pub async fn handle(&self, event: WatchEvent<Event>) {
        match event {
            WatchEvent::Added(event) => self.forward(&event).await,
            WatchEvent::Updated(..) => {
                self.counters.update.fetch_add(1, Ordering::Relaxed);
            }
            WatchEvent::Deleted(_) => {
                self.counters.delete.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[instrument(skip_all)]
    async fn forward(&self, event: &Event) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let record = EventRecord::new(event);
        let tag = record.tag();
        let record = match serde_json::to_value(&record) {
            Ok(record) => record,
            Err(err) => {
                self.counters.convert_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = &err as &dyn StdError,
                    "failed to convert event into log record"
                );
                return;
            }
        };

        match self.forwarder.post(&tag, &record).await {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                let failed = self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if failed % FAILURE_LOG_INTERVAL == 0 {
                    tracing::error!(
                        error = &err as &dyn StdError,
                        failed_count = failed + 1,
                        "unable to forward event"
                    );
                }
            }
        }
    }

    /// Forwards events until `shutdown` completes.
    pub async fn run(&self, api: Api<Event>, shutdown: impl Future<Output = ()>) {
        let mut events = pin!(watch_events(api).take_until(shutdown));
        while let Some(event) = events.next().await {
            self.handle(event).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{EventSource, ObjectReference};
    use serde_json::json;

    use super::*;
    use crate::reconcile::tests::InjectedFailure;

    #[derive(Debug, Default)]
    pub(super) struct FakeForwarder {
        pub(super) posted: Mutex<Vec<(String, serde_json::Value)>>,
        pub(super) fail: bool,
    }

    #[async_trait]
    impl Forwarder for FakeForwarder {
        type Error = InjectedFailure;

        async fn post(&self, tag: &str, record: &serde_json::Value) -> Result<(), Self::Error> {
            if self.fail {
                return Err(InjectedFailure);
            }
            self.posted
                .lock()
                .expect("lock not poisoned")
                .push((tag.to_owned(), record.clone()));
            Ok(())
        }
    }

    pub(super) fn event(message: &str) -> Event {
        Event {
            message: Some(message.to_owned()),
            source: Some(EventSource {
                host: Some("node-1".to_owned()),
                ..EventSource::default()
            }),
            involved_object: ObjectReference {
                name: Some("pod-1".to_owned()),
                namespace: Some("ns1".to_owned()),
                ..ObjectReference::default()
            },
            ..Event::default()
        }
    }

    #[tokio::test]
    async fn added_event_is_forwarded() {
        let controller = EventController::new(FakeForwarder::default());

        controller.handle(WatchEvent::Added(event("pulled image"))).await;

        assert_eq!(
            *controller.forwarder.posted.lock().expect("lock not poisoned"),
            vec![(
                "k8s.event._ns1_".to_owned(),
                json!({
                    "log": "pulled image",
                    "stream": "stdout",
                    "kubernetes": {
                        "host": "node-1",
                        "pod_name": "pod-1",
                        "namespace_name": "ns1",
                        "source_type": "k8s.event",
                    },
                })
            )]
        );
        assert_eq!(
            controller.stats(),
            ForwarderStats {
                received: 1,
                sent: 1,
                ..ForwarderStats::default()
            }
        );
    }

    #[tokio::test]
    async fn missing_fields_become_empty_strings() {
        let controller = EventController::new(FakeForwarder::default());

        controller.handle(WatchEvent::Added(Event::default())).await;

        let posted = controller.forwarder.posted.lock().expect("lock not poisoned");
        assert_eq!(posted[0].0, "k8s.event.__");
        assert_eq!(posted[0].1["kubernetes"]["host"], "");
        assert_eq!(posted[0].1["log"], "");
    }

    #[tokio::test]
    async fn updates_and_deletes_are_only_counted() {
        let controller = EventController::new(FakeForwarder::default());

        controller
            .handle(WatchEvent::Updated(event("a"), event("b")))
            .await;
        controller.handle(WatchEvent::Deleted(event("b"))).await;

        assert!(
            controller
                .forwarder
                .posted
                .lock()
                .expect("lock not poisoned")
                .is_empty()
        );
        assert_eq!(
            controller.stats(),
            ForwarderStats {
                update: 1,
                delete: 1,
                ..ForwarderStats::default()
            }
        );
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let controller = EventController::new(FakeForwarder {
            fail: true,
            ..FakeForwarder::default()
        });

        for _ in 0..150 {
            controller.handle(WatchEvent::Added(event("lost"))).await;
        }

        assert_eq!(
            controller.stats(),
            ForwarderStats {
                received: 150,
                failed: 150,
                ..ForwarderStats::default()
            }
        );
    }

    #[test]
    fn stats_use_expvar_names() {
        let stats = ForwarderStats {
            received: 1,
            update: 2,
            delete: 3,
            sent: 4,
            failed: 5,
            convert_failed: 6,
        };

        assert_eq!(
            serde_json::to_value(stats).expect("stats serialize"),
            json!({
                "eventcontroller_forwarder_received_count": 1,
                "eventcontroller_forwarder_update_count": 2,
                "eventcontroller_forwarder_delete_count": 3,
                "eventcontroller_forwarder_sent_count": 4,
                "eventcontroller_forwarder_failed_count": 5,
                "eventcontroller_convert_failed_count": 6,
            })
        );
    }
}
