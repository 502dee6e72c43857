//! Local Docker backend.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerState, ContainerStateStatusEnum, HostConfig, PortBinding};
use repokit_config::Settings;
use repokit_core::connection::DEFAULT_PORT;
use repokit_core::strategy::{Candidate, first_present};
use repokit_core::{
    Backend, ConnectionData, Error, Instance, InstanceHandle, ProvisionRequest, Result,
    wait_until_ready,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::process::{CommandRunner, Invocation};
use crate::{INSTANCE_LABEL, generate_password, probe};

const BUNDLED_DOCKERFILE: &str = include_str!("../templates/Dockerfile");

const DOCKERFILE_CANDIDATES: [Candidate<()>; 1] = [Candidate::file("database/Dockerfile", ())];

/// Runs database instances as containers on the local Docker daemon.
pub struct LocalDockerBackend {
    docker: Docker,
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
}

impl LocalDockerBackend {
    /// Create a new backend connected to the local Docker daemon.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self::with_client(docker, runner, settings))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, runner: Arc<dyn CommandRunner>, settings: Settings) -> Self {
        Self {
            docker,
            runner,
            settings,
        }
    }

    /// Container name for an instance, `{dbname}_{port}`.
    pub fn container_name(dbname: &str, port: u16) -> String {
        format!("{}_{}", dbname, port)
    }

    /// Handle for the container serving `connection`.
    pub fn handle_for(connection: &ConnectionData) -> InstanceHandle {
        InstanceHandle::new(
            "docker",
            Self::container_name(&connection.dbname, connection.port),
        )
    }

    fn image_tag(name: &str) -> String {
        format!("{}:latest", name.to_lowercase())
    }

    async fn build_image(&self, repo_path: &Path, tag: &str) -> Result<()> {
        // Keeps the bundled context alive until the build finishes.
        let mut _bundled = None;
        let context: PathBuf = match first_present(repo_path, &DOCKERFILE_CANDIDATES) {
            Some(resolved) => resolved
                .path
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| Error::Internal("Dockerfile has no parent".to_string()))?,
            None => {
                let dir = tempfile::tempdir()?;
                std::fs::write(dir.path().join("Dockerfile"), BUNDLED_DOCKERFILE)?;
                info!("Repository has no database/Dockerfile, using the bundled template");
                let path = dir.path().to_path_buf();
                _bundled = Some(dir);
                path
            }
        };

        info!(image = %tag, context = %context.display(), "Building database image");
        let invocation = Invocation::new(&self.settings.tools.docker)
            .args(["build", "--rm", "-t", tag])
            .arg(context.display().to_string());
        self.runner.run(&invocation).await?;
        Ok(())
    }

    async fn remove_if_present(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            Ok(()) => {
                info!(container = %container_name, "Removed existing container");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::Backend(format!(
                "Failed to remove container {}: {}",
                container_name, e
            ))),
        }
    }

    async fn launch(&self, container_name: &str, tag: &str, port: u16, password: &str) -> Result<()> {
        let container_port = format!("{}/tcp", DEFAULT_PORT);

        let host_config = HostConfig {
            port_bindings: Some(HashMap::from([(
                container_port.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            )])),
            ..Default::default()
        };

        let config = Config {
            image: Some(tag.to_string()),
            env: Some(vec![format!("POSTGRES_PASSWORD={}", password)]),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            labels: Some(HashMap::from([(
                INSTANCE_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.to_string(),
            platform: None,
        };

        info!(container = %container_name, port, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::Backend(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Backend(format!("Failed to start container: {}", e)))?;

        Ok(())
    }

    async fn container_running(&self, container_name: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(container_name, None)
            .await
            .map_err(|e| match e {
                e if is_not_found(&e) => Error::InstanceNotFound(container_name.to_string()),
                e => Error::Backend(format!("Failed to inspect container: {}", e)),
            })?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No container state".to_string()))?;
        container_readiness(container_name, &state)
    }

    async fn advertised_host(&self) -> String {
        if let Some(host) = &self.settings.host {
            return host.clone();
        }
        match self.runner.run(&Invocation::new("hostname")).await {
            Ok(output) => {
                let hostname = output.stdout.trim().to_string();
                if !hostname.is_empty()
                    && tokio::net::lookup_host((hostname.as_str(), DEFAULT_PORT))
                        .await
                        .is_ok_and(|mut addrs| addrs.next().is_some())
                {
                    return hostname;
                }
                debug!(hostname = %hostname, "Hostname does not resolve, using loopback");
            }
            Err(e) => debug!(error = %e, "Could not read hostname, using loopback"),
        }
        "127.0.0.1".to_string()
    }

    async fn wait_running(&self, container_name: &str) -> Result<String> {
        wait_until_ready(container_name, self.settings.database_wait, || {
            self.container_running(container_name)
        })
        .await?;
        Ok(self.advertised_host().await)
    }
}

/// Classify a container's state: running, still starting, or failed.
pub fn container_readiness(container_name: &str, state: &ContainerState) -> Result<bool> {
    if let Some(error) = state.error.as_deref().filter(|e| !e.is_empty()) {
        return Err(Error::ContainerFailed(format!("{}: {}", container_name, error)));
    }
    if state.running.unwrap_or(false) {
        return Ok(true);
    }
    match state.status {
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            Err(Error::ContainerFailed(format!(
                "{} stopped with exit code {:?}",
                container_name, state.exit_code
            )))
        }
        _ => Ok(false),
    }
}

/// Sample a free local port.
///
/// The port is released before the container binds it, so another process
/// can claim it in between.
pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl Backend for LocalDockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Instance> {
        let tag = Self::image_tag(&request.name);
        self.build_image(&request.repo_path, &tag).await?;

        let port = match request.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let dbname = request.dbname().to_string();
        let container_name = Self::container_name(&dbname, port);
        let password = request.password.clone().unwrap_or_else(generate_password);

        self.remove_if_present(&container_name).await?;
        let handle = InstanceHandle::new(self.name(), container_name.clone());

        let launched = match self.launch(&container_name, &tag, port, &password).await {
            Ok(()) => self.wait_running(&container_name).await,
            Err(e) => Err(e),
        };

        let host = match launched {
            Ok(host) => host,
            Err(e) => {
                warn!(container = %container_name, error = %e, "Provisioning failed, removing container");
                if let Err(cleanup) = self.remove_if_present(&container_name).await {
                    warn!(container = %container_name, error = %cleanup, "Cleanup failed");
                }
                return Err(e);
            }
        };

        let connection = ConnectionData::new(host, port, dbname, request.user(), Some(password));
        info!(container = %container_name, connection = %connection, "Container running");
        Ok(Instance { connection, handle })
    }

    async fn probe_ready(&self, instance: &Instance) -> Result<bool> {
        if !self.container_running(&instance.handle.instance_id).await? {
            return Ok(false);
        }
        let admin = instance
            .connection
            .with_admin(&self.settings.admin_user, &self.settings.admin_database);
        probe::probe_database(&admin).await
    }

    async fn teardown(&self, handle: &InstanceHandle) -> Result<()> {
        let container_name = &handle.instance_id;

        info!(container = %container_name, "Stopping container");
        match self
            .docker
            .kill_container(container_name, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                return Err(Error::InstanceNotFound(container_name.to_string()));
            }
            // 409: already stopped; removal below still applies.
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(container = %container_name, "Container was not running");
            }
            Err(e) => {
                return Err(Error::Backend(format!("Failed to stop container: {}", e)));
            }
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(Error::InstanceNotFound(container_name.to_string())),
            Err(e) => Err(Error::Backend(format!("Failed to remove container: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: ContainerStateStatusEnum, running: bool) -> ContainerState {
        ContainerState {
            status: Some(status),
            running: Some(running),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_name() {
        assert_eq!(LocalDockerBackend::container_name("orders", 54321), "orders_54321");
    }

    #[test]
    fn test_handle_for_connection() {
        let connection = ConnectionData::new("localhost", 40001, "orders", "orders", None);
        let handle = LocalDockerBackend::handle_for(&connection);
        assert_eq!(handle.backend, "docker");
        assert_eq!(handle.instance_id, "orders_40001");
    }

    #[test]
    fn test_image_tag_is_lowercase() {
        assert_eq!(LocalDockerBackend::image_tag("Orders_DB"), "orders_db:latest");
    }

    #[test]
    fn test_running_container_is_ready() {
        let state = state(ContainerStateStatusEnum::RUNNING, true);
        assert!(container_readiness("c", &state).unwrap());
    }

    #[test]
    fn test_created_container_is_pending() {
        let state = state(ContainerStateStatusEnum::CREATED, false);
        assert!(!container_readiness("c", &state).unwrap());
    }

    #[test]
    fn test_exited_container_failed() {
        let mut state = state(ContainerStateStatusEnum::EXITED, false);
        state.exit_code = Some(1);
        let err = container_readiness("orders_1", &state).unwrap_err();
        assert!(matches!(err, Error::ContainerFailed(ref m) if m.contains("orders_1")));
    }

    #[test]
    fn test_container_error_reported() {
        let mut state = state(ContainerStateStatusEnum::CREATED, false);
        state.error = Some("port is already allocated".to_string());
        let err = container_readiness("c", &state).unwrap_err();
        assert!(matches!(err, Error::ContainerFailed(ref m) if m.contains("already allocated")));
    }

    #[test]
    fn test_empty_error_ignored() {
        let mut state = state(ContainerStateStatusEnum::RUNNING, true);
        state.error = Some(String::new());
        assert!(container_readiness("c", &state).unwrap());
    }

    #[test]
    fn test_find_free_port() {
        let port = find_free_port().unwrap();
        assert!(port > 0);
    }
}
