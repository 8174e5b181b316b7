//! Kubernetes usage probe.
//!
//! Enumerates every container image reference from Pods,
//! ReplicationControllers, Deployments, StatefulSets, DaemonSets,
//! ReplicaSets, CronJobs and Jobs across all namespaces, for each
//! configured kube context. The union is used by the cleanup engine to
//! exclude deployed images; any kind's list failure fails the probe with
//! the kind named in the error.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::try_join;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, PodSpec, ReplicationController};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio_util::sync::CancellationToken;

use stagehand_core::cancel::checked;
use stagehand_core::error::{Error, Result};
use stagehand_core::probe::DeployedImagesProbe;

/// Workload probe over one client per configured kube context.
pub struct KubeImagesProbe {
    clients: Vec<(String, Client)>,
}

impl KubeImagesProbe {
    /// Builds clients for the given contexts from the standard
    /// kubeconfig discovery (`KUBECONFIG` or `~/.kube/config`).
    ///
    /// An empty context list means the kubeconfig's current context.
    ///
    /// # Errors
    ///
    /// Fails when the kubeconfig cannot be read or a context's client
    /// cannot be constructed.
    pub async fn from_contexts(contexts: &[String]) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().map_err(|e| Error::Kubernetes {
            kind: "Kubeconfig",
            message: e.to_string(),
        })?;

        let mut selected: Vec<Option<String>> = contexts
            .iter()
            .map(|context| Some(context.clone()))
            .collect();
        if selected.is_empty() {
            selected.push(None);
        }

        let mut clients = Vec::new();
        for context in selected {
            let options = KubeConfigOptions {
                context: context.clone(),
                ..KubeConfigOptions::default()
            };
            let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
                .await
                .map_err(|e| Error::Kubernetes {
                    kind: "Kubeconfig",
                    message: format!(
                        "context {}: {e}",
                        context.as_deref().unwrap_or("<current>")
                    ),
                })?;
            let client = Client::try_from(config).map_err(|e| Error::Kubernetes {
                kind: "Client",
                message: e.to_string(),
            })?;
            clients.push((context.unwrap_or_else(|| "current".to_string()), client));
        }

        Ok(Self { clients })
    }

    /// Wraps pre-built clients (tests, custom discovery).
    #[must_use]
    pub fn from_clients(clients: Vec<(String, Client)>) -> Self {
        Self { clients }
    }

    async fn context_images(client: &Client) -> Result<Vec<String>> {
        let (pods, rcs, deployments, stateful_sets, daemon_sets, replica_sets, cron_jobs, jobs) =
            try_join!(
                pod_images(client),
                replication_controller_images(client),
                deployment_images(client),
                stateful_set_images(client),
                daemon_set_images(client),
                replica_set_images(client),
                cron_job_images(client),
                job_images(client),
            )?;

        let mut images = pods;
        images.extend(rcs);
        images.extend(deployments);
        images.extend(stateful_sets);
        images.extend(daemon_sets);
        images.extend(replica_sets);
        images.extend(cron_jobs);
        images.extend(jobs);
        Ok(images)
    }
}

#[async_trait]
impl DeployedImagesProbe for KubeImagesProbe {
    async fn deployed_images(&self, cancel: &CancellationToken) -> Result<HashSet<String>> {
        let mut deployed = HashSet::new();
        for (context, client) in &self.clients {
            let images = checked(
                cancel,
                "list deployed images",
                Self::context_images(client),
            )
            .await?;
            tracing::debug!(context, count = images.len(), "collected deployed images");
            deployed.extend(images);
        }
        Ok(deployed)
    }
}

/// Collects `container.image` values from a pod spec.
pub fn images_from_pod_spec(spec: &PodSpec) -> Vec<String> {
    spec.containers
        .iter()
        .filter_map(|container| container.image.clone())
        .collect()
}

async fn pod_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<Pod>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("Pods", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|pod| pod.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

async fn replication_controller_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<ReplicationController>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("ReplicationControllers", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|rc| rc.spec.as_ref())
        .filter_map(|spec| spec.template.as_ref())
        .filter_map(|template| template.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

async fn deployment_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<Deployment>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("Deployments", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|deployment| deployment.spec.as_ref())
        .filter_map(|spec| spec.template.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

async fn stateful_set_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<StatefulSet>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("StatefulSets", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|stateful_set| stateful_set.spec.as_ref())
        .filter_map(|spec| spec.template.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

async fn daemon_set_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<DaemonSet>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("DaemonSets", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|daemon_set| daemon_set.spec.as_ref())
        .filter_map(|spec| spec.template.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

async fn replica_set_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<ReplicaSet>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("ReplicaSets", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|replica_set| replica_set.spec.as_ref())
        .filter_map(|spec| spec.template.as_ref())
        .filter_map(|template| template.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

async fn cron_job_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<CronJob>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("CronJobs", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|cron_job| cron_job.spec.as_ref())
        .filter_map(|spec| spec.job_template.spec.as_ref())
        .filter_map(|job_spec| job_spec.template.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

async fn job_images(client: &Client) -> Result<Vec<String>> {
    let list = Api::<Job>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| kind_error("Jobs", &e))?;
    Ok(list
        .items
        .iter()
        .filter_map(|job| job.spec.as_ref())
        .filter_map(|spec| spec.template.spec.as_ref())
        .flat_map(images_from_pod_spec)
        .collect())
}

fn kind_error(kind: &'static str, error: &kube::Error) -> Error {
    Error::Kubernetes {
        kind,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Container;

    #[test]
    fn test_images_from_pod_spec_skips_imageless_containers() {
        let spec = PodSpec {
            containers: vec![
                Container {
                    image: Some("registry.local/demo:v1".into()),
                    ..Container::default()
                },
                Container::default(),
            ],
            ..PodSpec::default()
        };
        assert_eq!(images_from_pod_spec(&spec), vec!["registry.local/demo:v1"]);
    }
}
