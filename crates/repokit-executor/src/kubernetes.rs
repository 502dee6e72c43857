//! Kubernetes pod backend.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, Event, Pod};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use repokit_config::Settings;
use repokit_core::connection::DEFAULT_PORT;
use repokit_core::strategy::{Candidate, first_present};
use repokit_core::{
    Backend, ConnectionData, Error, Instance, InstanceHandle, ProvisionRequest, Result,
    wait_until_ready,
};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::{INSTANCE_LABEL, generate_password, probe};

const BUNDLED_POD_SPEC: &str = include_str!("../templates/pod.yaml");

const POD_SPEC_CANDIDATES: [Candidate<()>; 1] = [Candidate::file("database/pod.yaml", ())];

const PASSWORD_VAR: &str = "POSTGRES_PASSWORD";

// Leaves room for the random suffix the API server appends.
const MAX_NAME_PREFIX: usize = 50;

/// Runs database instances as pods in a Kubernetes namespace.
pub struct KubernetesBackend {
    client: Client,
    settings: Settings,
}

impl KubernetesBackend {
    /// Create a backend from the ambient kubeconfig or in-cluster config.
    pub async fn new(settings: Settings) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Client, settings: Settings) -> Self {
        Self { client, settings }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn events(&self) -> Api<Event> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    /// Resolve the instance whose pod IP is `host`.
    pub async fn find_by_host(&self, host: &str) -> Result<InstanceHandle> {
        let params = ListParams::default().labels(&format!("{}=true", INSTANCE_LABEL));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| Error::Backend(format!("Failed to list pods: {}", e)))?;

        let name = pod_name_for_ip(&pods.items, host).ok_or_else(|| {
            Error::InstanceNotFound(format!(
                "no pod with IP {} in namespace {}",
                host, self.settings.namespace
            ))
        })?;
        debug!(pod = %name, host = %host, "Resolved pod by IP");
        Ok(InstanceHandle::new(self.name(), name))
    }

    async fn pod_ready(&self, pod_name: &str) -> Result<bool> {
        let pod = self
            .pods()
            .get(pod_name)
            .await
            .map_err(|e| api_error(e, pod_name))?;

        let params = ListParams::default().fields(&format!("involvedObject.name={}", pod_name));
        let events = self
            .events()
            .list(&params)
            .await
            .map_err(|e| Error::Backend(format!("Failed to list events: {}", e)))?;

        pod_readiness(&pod, &events.items)
    }

    async fn pod_ip(&self, pod_name: &str) -> Result<String> {
        let pod = self
            .pods()
            .get(pod_name)
            .await
            .map_err(|e| api_error(e, pod_name))?;
        pod.status
            .and_then(|status| status.pod_ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::PodFailed(format!("{} has no IP address", pod_name)))
    }

    async fn delete_pod(&self, pod_name: &str) -> Result<()> {
        match self.pods().delete(pod_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %pod_name, "Deleted pod");
                Ok(())
            }
            Err(e) => Err(api_error(e, pod_name)),
        }
    }
}

/// Load the pod spec: the explicit file, else `database/pod.yaml`, else the bundled template.
pub fn load_pod_spec(repo_path: &Path, explicit: Option<&Path>) -> Result<Pod> {
    let content = match explicit {
        Some(path) if path.is_file() => std::fs::read_to_string(path)?,
        Some(path) => {
            return Err(Error::InvalidInput(format!(
                "pod config {} does not exist",
                path.display()
            )));
        }
        None => match first_present(repo_path, &POD_SPEC_CANDIDATES) {
            Some(resolved) => std::fs::read_to_string(&resolved.path)?,
            None => {
                debug!("Repository has no database/pod.yaml, using the bundled template");
                BUNDLED_POD_SPEC.to_string()
            }
        },
    };
    parse_pod_spec(&content)
}

/// Parse a pod spec from YAML or JSON.
pub fn parse_pod_spec(content: &str) -> Result<Pod> {
    serde_yaml::from_str(content)
        .map_err(|e| Error::InvalidInput(format!("invalid pod spec: {}", e)))
}

/// Stamp a pod spec for one instance: generated name, instance label and password.
pub fn prepare_pod(mut pod: Pod, name: &str, password: &str) -> Result<Pod> {
    pod.metadata.name = None;
    pod.metadata.generate_name = Some(format!("{}-", pod_name_prefix(name)));
    pod.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(INSTANCE_LABEL.to_string(), "true".to_string());

    let container = pod
        .spec
        .as_mut()
        .and_then(|spec| spec.containers.first_mut())
        .ok_or_else(|| Error::InvalidInput("pod spec has no containers".to_string()))?;

    let env = container.env.get_or_insert_with(Vec::new);
    env.retain(|var| var.name != PASSWORD_VAR);
    env.push(EnvVar {
        name: PASSWORD_VAR.to_string(),
        value: Some(password.to_string()),
        ..Default::default()
    });

    Ok(pod)
}

/// Turn a project name into a valid pod name prefix.
pub fn pod_name_prefix(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut prefix: String = mapped.trim_matches('-').chars().take(MAX_NAME_PREFIX).collect();
    while prefix.ends_with('-') {
        prefix.pop();
    }
    if prefix.is_empty() {
        "repokit-db".to_string()
    } else {
        prefix
    }
}

/// Classify a pod and its events: running, still starting, or failed.
///
/// Any event or waiting container reporting an error fails the pod, even when
/// its phase is already `Running`.
pub fn pod_readiness(pod: &Pod, events: &[Event]) -> Result<bool> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");

    for event in events {
        let reason = event.reason.as_deref().unwrap_or_default();
        let message = event.message.as_deref().unwrap_or_default();
        if reason.contains("Error") || message.contains("Error") {
            return Err(Error::PodFailed(format!("{}: {} {}", pod_name, reason, message)));
        }
    }

    let Some(status) = &pod.status else {
        return Ok(false);
    };

    for container in status.container_statuses.iter().flatten() {
        let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) else {
            continue;
        };
        let reason = waiting.reason.as_deref().unwrap_or_default();
        if reason.contains("Error") {
            return Err(Error::PodFailed(format!(
                "{}: container {} {} {}",
                pod_name,
                container.name,
                reason,
                waiting.message.as_deref().unwrap_or_default()
            )));
        }
    }

    match status.phase.as_deref() {
        Some("Running") => Ok(status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty())),
        Some(phase @ ("Failed" | "Succeeded")) => Err(Error::PodFailed(format!(
            "{} entered phase {}",
            pod_name, phase
        ))),
        _ => Ok(false),
    }
}

/// Name of the pod whose IP is `ip`.
pub fn pod_name_for_ip(pods: &[Pod], ip: &str) -> Option<String> {
    pods.iter()
        .find(|pod| {
            pod.status
                .as_ref()
                .and_then(|status| status.pod_ip.as_deref())
                == Some(ip)
        })
        .and_then(|pod| pod.metadata.name.clone())
}

fn api_error(err: kube::Error, pod_name: &str) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 404 => {
            Error::InstanceNotFound(pod_name.to_string())
        }
        e => Error::Backend(format!("Kubernetes request for {} failed: {}", pod_name, e)),
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Instance> {
        let template = load_pod_spec(&request.repo_path, request.pod_config.as_deref())?;
        let password = request.password.clone().unwrap_or_else(generate_password);
        let pod = prepare_pod(template, &request.name, &password)?;

        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| Error::Backend(format!("Failed to create pod: {}", e)))?;
        let pod_name = created
            .metadata
            .name
            .ok_or_else(|| Error::Internal("Created pod has no name".to_string()))?;
        info!(pod = %pod_name, namespace = %self.settings.namespace, "Created pod");

        let started = async {
            wait_until_ready(&pod_name, self.settings.pod_wait, || self.pod_ready(&pod_name))
                .await?;
            self.pod_ip(&pod_name).await
        }
        .await;

        let host = match started {
            Ok(host) => host,
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "Provisioning failed, deleting pod");
                if let Err(cleanup) = self.delete_pod(&pod_name).await {
                    warn!(pod = %pod_name, error = %cleanup, "Cleanup failed");
                }
                return Err(e);
            }
        };

        let connection = ConnectionData::new(
            host,
            DEFAULT_PORT,
            request.dbname(),
            request.user(),
            Some(password),
        );
        info!(pod = %pod_name, connection = %connection, "Pod running");
        Ok(Instance {
            connection,
            handle: InstanceHandle::new(self.name(), pod_name),
        })
    }

    async fn probe_ready(&self, instance: &Instance) -> Result<bool> {
        if !self.pod_ready(&instance.handle.instance_id).await? {
            return Ok(false);
        }
        let admin = instance
            .connection
            .with_admin(&self.settings.admin_user, &self.settings.admin_database);
        probe::probe_database(&admin).await
    }

    async fn teardown(&self, handle: &InstanceHandle) -> Result<()> {
        info!(pod = %handle.instance_id, "Deleting pod");
        self.delete_pod(&handle.instance_id).await
    }
}


/// Integration tests that require a reachable cluster.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_backend_creation() {
        let backend = KubernetesBackend::new(Settings::default()).await.unwrap();
        assert_eq!(backend.name(), "kubernetes");
    }

    #[tokio::test]
    #[ignore]
    async fn test_teardown_unknown_pod() {
        let backend = KubernetesBackend::new(Settings::default()).await.unwrap();
        let handle = InstanceHandle::new("kubernetes", "repokit-missing-00000");
        let err = backend.teardown(&handle).await.unwrap_err();
        assert!(err.is_instance_not_found());
    }

    #[tokio::test]
    #[ignore]
    async fn test_find_by_unknown_host() {
        let backend = KubernetesBackend::new(Settings::default()).await.unwrap();
        let err = backend.find_by_host("192.0.2.1").await.unwrap_err();
        assert!(err.is_instance_not_found());
    }
}
