use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};

use super::AgentConfigTarget;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to patch ConfigMap {config_map:?}"))]
    PatchConfigMap {
        source: kube::Error,
        config_map: String,
    },

    #[snafu(display("failed to delete pods matching {pod_selector:?}"))]
    DeletePods {
        source: kube::Error,
        pod_selector: String,
    },
}

/// Applies agent configuration through the Kubernetes API, scoped to the
/// namespace the agents run in.
#[derive(Clone)]
pub struct KubeAgentTarget {
    config_maps: Api<ConfigMap>,
    pods: Api<Pod>,
}

impl KubeAgentTarget {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            config_maps: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl AgentConfigTarget for KubeAgentTarget {
    type Error = Error;

    async fn patch_config(&self, config_map: &str, patch: json_patch::Patch) -> Result<(), Error> {
        self.config_maps
            .patch(config_map, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .context(PatchConfigMapSnafu { config_map })?;
        Ok(())
    }

    async fn restart_agents(&self, pod_selector: &str) -> Result<(), Error> {
        self.pods
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(pod_selector),
            )
            .await
            .context(DeletePodsSnafu { pod_selector })?;
        Ok(())
    }
}
