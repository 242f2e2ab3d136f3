//! Typed add/update/delete events on top of the Kubernetes watch API.
//!
//! The raw watcher only reports the latest state of an object. To hand the
//! reconciler both the old and the new object on updates, the last seen
//! version of every object is remembered here. A relist after a watch restart
//! is diffed against that memory so objects deleted while the watch was down
//! still produce a [`WatchEvent::Deleted`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
};

use futures::{Stream, StreamExt, future, stream};
use kube::{
    Api, Resource, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use serde::de::DeserializeOwned;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Updated(K, K),
    Deleted(K),
}

type ObjectKey = (String, String);

fn object_key<K: Resource>(object: &K) -> ObjectKey {
    (object.namespace().unwrap_or_default(), object.name_any())
}

/// Converts raw watcher events into [`WatchEvent`]s.
#[derive(Debug)]
pub struct EventTranslator<K> {
    known: BTreeMap<ObjectKey, K>,
    /// Objects seen during an in-progress relist.
    relisted: Option<BTreeSet<ObjectKey>>,
}

impl<K> Default for EventTranslator<K> {
    fn default() -> Self {
        Self {
            known: BTreeMap::new(),
            relisted: None,
        }
    }
}

impl<K> EventTranslator<K>
where
    K: Resource + Clone,
{
    pub fn translate(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            watcher::Event::Apply(object) => vec![self.apply(object)],
            watcher::Event::Delete(object) => {
                self.known.remove(&object_key(&object));
                vec![WatchEvent::Deleted(object)]
            }
            watcher::Event::Init => {
                self.relisted = Some(BTreeSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(object) => {
                if let Some(relisted) = &mut self.relisted {
                    relisted.insert(object_key(&object));
                }
                vec![self.apply(object)]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };

                let vanished: Vec<_> = self
                    .known
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();

                vanished
                    .into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(WatchEvent::Deleted)
                    .collect()
            }
        }
    }

    fn apply(&mut self, object: K) -> WatchEvent<K> {
        match self.known.insert(object_key(&object), object.clone()) {
            Some(old) => WatchEvent::Updated(old, object),
            None => WatchEvent::Added(object),
        }
    }
}

/// Watches all objects of `api`, retrying failed watches with backoff.
pub fn watch_events<K>(api: Api<K>) -> impl Stream<Item = WatchEvent<K>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut translator = EventTranslator::default();

    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "watch failed, retrying"
                    );
                    None
                }
            })
        })
        .flat_map(move |event| stream::iter(translator.translate(event)))
}
