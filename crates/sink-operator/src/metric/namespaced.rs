//! Per-namespace Telegraf collectors backing [`MetricSink`]s.
//!
//! Each sink owns a Role, RoleBinding, ConfigMap and Deployment, all named
//! `telegraf-<sink>` and labelled `app=telegraf-<sink>`. Creation and deletion
//! walk these resources in a fixed order and stop at the first failure,
//! leaving whatever was already done in place. The owner references let the
//! garbage collector clean up leftovers once the sink is gone.

use std::{collections::BTreeMap, error::Error as StdError, fmt::Debug, future::Future, pin::pin};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, Pod, PodSpec, PodTemplateSpec, Volume,
            VolumeMount,
        },
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ListParams, ObjectMeta, PostParams},
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;

use crate::{
    crd::{MetricEntry, MetricSink, MetricSinkSpec, MetricValue},
    metric::TelegrafConfig,
    watch::{WatchEvent, watch_events},
};

pub const TELEGRAF_IMAGE: &str = "telegraf:1.11-alpine";

/// ConfigMap key holding the agent settings.
pub const AGENT_CONFIG_KEY: &str = "telegraf.conf";

/// ConfigMap key holding the rendered sink.
pub const SINK_CONFIG_KEY: &str = "metric-sinks.conf";

const CONFIG_VOLUME: &str = "telegraf-config";
const CONFIG_DIRECTORY: &str = "/etc/telegraf";

/// Agent settings shared by all namespaced collectors.
pub const DEFAULT_TELEGRAF_CONF: &str = r#"
[agent]
  interval = "10s"
  round_interval = true
  metric_batch_size = 1000
  metric_buffer_limit = 10000
  collection_jitter = "0s"
  flush_interval = "10s"
  flush_jitter = "0s"
  precision = ""
  debug = false
  quiet = false
  logfile = ""
  hostname = ""
  omit_hostname = false"#;

#[derive(Debug, Snafu)]
pub enum Error<E: StdError + 'static> {
    #[snafu(display("metric sink has no name or uid to own its collector"))]
    MissingIdentity,

    #[snafu(display("failed to create {kind} for metric sink collector"))]
    CreateResource { source: E, kind: ResourceKind },

    #[snafu(display("failed to update collector ConfigMap"))]
    ReplaceConfigMap { source: E },

    #[snafu(display("failed to restart collector pods"))]
    RestartCollector { source: E },

    #[snafu(display("failed to delete {kind} of metric sink collector"))]
    DeleteResource { source: E, kind: ResourceKind },
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ResourceKind {
    Role,
    RoleBinding,
    ConfigMap,
    Deployment,
}

/// A collector resource ready to be created.
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    Role(Role),
    RoleBinding(RoleBinding),
    ConfigMap(ConfigMap),
    Deployment(Deployment),
}

impl Manifest {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Role(_) => ResourceKind::Role,
            Self::RoleBinding(_) => ResourceKind::RoleBinding,
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::Deployment(_) => ResourceKind::Deployment,
        }
    }
}

/// Namespace scoped operations needed to manage collectors.
#[async_trait]
pub trait NamespacedResources: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn create(&self, namespace: &str, manifest: Manifest) -> Result<(), Self::Error>;

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: ConfigMap,
    ) -> Result<(), Self::Error>;

    async fn delete(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<(), Self::Error>;

    async fn delete_pods(&self, namespace: &str, pod_selector: &str) -> Result<(), Self::Error>;
}

/// Renders the collector configuration of a namespaced sink. The collector
/// always scrapes the annotated pods of its own namespace.
pub fn metric_sink_config(
    namespace: &str,
    cluster_name: Option<&str>,
    spec: &MetricSinkSpec,
) -> String {
    let mut config = TelegrafConfig::new(cluster_name);
    config.add_input(
        "prometheus",
        MetricEntry::from([
            ("monitor_kubernetes_pods".to_owned(), MetricValue::Bool(true)),
            (
                "monitor_kubernetes_pods_namespace".to_owned(),
                namespace.into(),
            ),
        ]),
    );
    config.append_entries(&spec.inputs, &spec.outputs);
    config.render()
}

pub fn app_name(sink: &MetricSink) -> String {
    format!("telegraf-{}", sink.name_any())
}

/// The resources making up the collector of a single sink.
#[derive(Debug)]
pub struct Collector {
    name: String,
    namespace: String,
    owner: OwnerReference,
}

impl Collector {
    /// Returns `None` for sinks lacking the name or uid needed to own resources.
    pub fn for_sink(sink: &MetricSink) -> Option<Self> {
        Some(Self {
            name: app_name(sink),
            namespace: sink.namespace().unwrap_or_default(),
            owner: sink.owner_ref(&())?,
        })
    }

    pub fn pod_selector(&self) -> String {
        format!("app={}", self.name)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_owned(), self.name.clone())])
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            owner_references: Some(vec![self.owner.clone()]),
            ..ObjectMeta::default()
        }
    }

    pub fn role(&self) -> Role {
        Role {
            metadata: self.metadata(),
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec!["extensions".to_owned()]),
                    resources: Some(vec!["podsecuritypolicies".to_owned()]),
                    resource_names: Some(vec!["telegraf".to_owned()]),
                    verbs: vec!["use".to_owned()],
                    ..PolicyRule::default()
                },
                PolicyRule {
                    api_groups: Some(vec![String::new()]),
                    resources: Some(vec!["pods".to_owned()]),
                    verbs: vec!["get".to_owned(), "list".to_owned(), "watch".to_owned()],
                    ..PolicyRule::default()
                },
            ]),
        }
    }

    pub fn role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: self.metadata(),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_owned(),
                kind: "Role".to_owned(),
                name: self.name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_owned(),
                name: "default".to_owned(),
                namespace: Some(self.namespace.clone()),
                ..Subject::default()
            }]),
        }
    }

    pub fn config_map(&self, sink_config: String) -> ConfigMap {
        ConfigMap {
            metadata: self.metadata(),
            data: Some(BTreeMap::from([
                (AGENT_CONFIG_KEY.to_owned(), DEFAULT_TELEGRAF_CONF.to_owned()),
                (SINK_CONFIG_KEY.to_owned(), sink_config),
            ])),
            ..ConfigMap::default()
        }
    }

    pub fn deployment(&self) -> Deployment {
        Deployment {
            metadata: self.metadata(),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        volumes: Some(vec![Volume {
                            name: CONFIG_VOLUME.to_owned(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: self.name.clone(),
                                ..ConfigMapVolumeSource::default()
                            }),
                            ..Volume::default()
                        }]),
                        containers: vec![Container {
                            name: "telegraf".to_owned(),
                            image: Some(TELEGRAF_IMAGE.to_owned()),
                            command: Some(vec![
                                "telegraf".to_owned(),
                                "--config-directory".to_owned(),
                                CONFIG_DIRECTORY.to_owned(),
                            ]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: CONFIG_VOLUME.to_owned(),
                                mount_path: CONFIG_DIRECTORY.to_owned(),
                                ..VolumeMount::default()
                            }]),
                            image_pull_policy: Some("IfNotPresent".to_owned()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }
}

/// Creates, updates and removes the collectors of namespaced metric sinks.
pub struct MetricSinkController<R> {
    resources: R,
    cluster_name: Option<String>,
}

impl<R> MetricSinkController<R>
where
    R: NamespacedResources,
{
    pub fn new(resources: R, cluster_name: Option<String>) -> Self {
        tracing::info!(image = TELEGRAF_IMAGE, "using telegraf image for metric sink collectors");
        Self {
            resources,
            cluster_name,
        }
    }

    fn config_map(&self, collector: &Collector, sink: &MetricSink) -> ConfigMap {
        collector.config_map(metric_sink_config(
            &collector.namespace,
            self.cluster_name.as_deref(),
            &sink.spec,
        ))
    }

    pub async fn handle(&self, event: WatchEvent<MetricSink>) -> Result<(), Error<R::Error>> {
        match event {
            WatchEvent::Added(sink) => self.create(&sink).await,
            WatchEvent::Updated(old, new) => {
                if old.spec == new.spec {
                    return Ok(());
                }
                self.update(&new).await
            }
            WatchEvent::Deleted(sink) => self.delete(&sink).await,
        }
    }

    async fn create(&self, sink: &MetricSink) -> Result<(), Error<R::Error>> {
        let collector = Collector::for_sink(sink).context(MissingIdentitySnafu)?;
        let manifests = [
            Manifest::Role(collector.role()),
            Manifest::RoleBinding(collector.role_binding()),
            Manifest::ConfigMap(self.config_map(&collector, sink)),
            Manifest::Deployment(collector.deployment()),
        ];

        for manifest in manifests {
            let kind = manifest.kind();
            self.resources
                .create(&collector.namespace, manifest)
                .await
                .context(CreateResourceSnafu { kind })?;
        }

        tracing::info!(collector.name = %collector.name, "created metric sink collector");
        Ok(())
    }

    async fn update(&self, sink: &MetricSink) -> Result<(), Error<R::Error>> {
        let collector = Collector::for_sink(sink).context(MissingIdentitySnafu)?;

        self.resources
            .replace_config_map(&collector.namespace, self.config_map(&collector, sink))
            .await
            .context(ReplaceConfigMapSnafu)?;
        self.resources
            .delete_pods(&collector.namespace, &collector.pod_selector())
            .await
            .context(RestartCollectorSnafu)?;

        tracing::info!(collector.name = %collector.name, "updated metric sink collector");
        Ok(())
    }

    async fn delete(&self, sink: &MetricSink) -> Result<(), Error<R::Error>> {
        let name = app_name(sink);
        let namespace = sink.namespace().unwrap_or_default();

        for kind in [
            ResourceKind::ConfigMap,
            ResourceKind::Deployment,
            ResourceKind::RoleBinding,
            ResourceKind::Role,
        ] {
            self.resources
                .delete(&namespace, kind, &name)
                .await
                .context(DeleteResourceSnafu { kind })?;
        }

        tracing::info!(collector.name = %name, "deleted metric sink collector");
        Ok(())
    }

    /// Handles metric sink events until `shutdown` completes.
    pub async fn run(&self, api: Api<MetricSink>, shutdown: impl Future<Output = ()>) {
        let mut events = pin!(watch_events(api).take_until(shutdown));
        while let Some(event) = events.next().await {
            if let Err(err) = self.handle(event).await {
                tracing::error!(
                    error = &err as &dyn StdError,
                    "failed to reconcile metric sink collector"
                );
            }
        }
    }
}

#[derive(Debug, Snafu)]
pub enum KubeError {
    #[snafu(display("Kubernetes API request for {kind} failed"))]
    Api {
        source: kube::Error,
        kind: ResourceKind,
    },

    #[snafu(display("failed to delete pods matching {pod_selector:?}"))]
    DeletePods {
        source: kube::Error,
        pod_selector: String,
    },
}

/// [`NamespacedResources`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeNamespacedResources {
    client: Client,
}

impl KubeNamespacedResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn delete_named<K>(&self, namespace: &str, name: &str) -> Result<(), kube::Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Debug
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NamespacedResources for KubeNamespacedResources {
    type Error = KubeError;

    async fn create(&self, namespace: &str, manifest: Manifest) -> Result<(), KubeError> {
        let kind = manifest.kind();
        let params = PostParams::default();
        match manifest {
            Manifest::Role(role) => self
                .api(namespace)
                .create(&params, &role)
                .await
                .map(drop),
            Manifest::RoleBinding(binding) => self
                .api(namespace)
                .create(&params, &binding)
                .await
                .map(drop),
            Manifest::ConfigMap(config_map) => self
                .api(namespace)
                .create(&params, &config_map)
                .await
                .map(drop),
            Manifest::Deployment(deployment) => self
                .api(namespace)
                .create(&params, &deployment)
                .await
                .map(drop),
        }
        .context(ApiSnafu { kind })
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: ConfigMap,
    ) -> Result<(), KubeError> {
        let name = config_map.name_any();
        self.api::<ConfigMap>(namespace)
            .replace(&name, &PostParams::default(), &config_map)
            .await
            .context(ApiSnafu {
                kind: ResourceKind::ConfigMap,
            })?;
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<(), KubeError> {
        match kind {
            ResourceKind::Role => self.delete_named::<Role>(namespace, name).await,
            ResourceKind::RoleBinding => self.delete_named::<RoleBinding>(namespace, name).await,
            ResourceKind::ConfigMap => self.delete_named::<ConfigMap>(namespace, name).await,
            ResourceKind::Deployment => self.delete_named::<Deployment>(namespace, name).await,
        }
        .context(ApiSnafu { kind })
    }

    async fn delete_pods(&self, namespace: &str, pod_selector: &str) -> Result<(), KubeError> {
        self.api::<Pod>(namespace)
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(pod_selector),
            )
            .await
            .context(DeletePodsSnafu { pod_selector })?;
        Ok(())
    }
}
