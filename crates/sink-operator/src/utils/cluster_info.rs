use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt, api::ListParams};
use snafu::{OptionExt, ResultExt, Snafu};

/// Node label carrying the name of the cluster.
pub const CLUSTER_NAME_LABEL: &str = "pks-system/cluster.name";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unable to list nodes"))]
    ListNodes { source: kube::Error },

    #[snafu(display("cannot find any nodes"))]
    NoNodes,
}

/// Resolves the cluster name, preferring the configured one.
///
/// Without a configured name the first node is asked for its
/// [`CLUSTER_NAME_LABEL`]. An empty name counts as no name at all.
pub async fn cluster_name(
    client: &Client,
    configured: Option<String>,
) -> Result<Option<String>, Error> {
    if let Some(cluster_name) = configured.filter(|name| !name.is_empty()) {
        tracing::info!(%cluster_name, "using configured cluster name");
        return Ok(Some(cluster_name));
    }

    tracing::info!("fetching cluster name from node labels");
    let nodes = Api::<Node>::all(client.clone())
        .list(&ListParams::default().limit(1))
        .await
        .context(ListNodesSnafu)?;
    let node = nodes.items.first().context(NoNodesSnafu)?;

    let cluster_name = cluster_name_label(node);
    match &cluster_name {
        Some(cluster_name) => tracing::info!(%cluster_name, "using cluster name from node labels"),
        None => tracing::warn!(
            node.name = %node.name_any(),
            label = CLUSTER_NAME_LABEL,
            "node has no cluster name label, records are shipped without one"
        ),
    }

    Ok(cluster_name)
}

fn cluster_name_label(node: &Node) -> Option<String> {
    node.labels()
        .get(CLUSTER_NAME_LABEL)
        .filter(|name| !name.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use rstest::rstest;

    use super::*;

    fn node(label: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_owned()),
                labels: label.map(|value| [(CLUSTER_NAME_LABEL.to_owned(), value.to_owned())].into()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    #[rstest]
    #[case(Some("prod"), Some("prod"))]
    #[case(Some(""), None)]
    #[case(None, None)]
    fn reads_cluster_name_label(#[case] label: Option<&str>, #[case] expected: Option<&str>) {
        assert_eq!(cluster_name_label(&node(label)).as_deref(), expected);
    }
}
