//! `repokit db` subcommands.

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use repokit_config::{ResetStrategy, Settings, load_settings};
use repokit_core::{Backend, ConnectionData, InstanceHandle, ProvisionRequest};
use repokit_executor::{
    CommandRunner, Invocation, KubernetesBackend, LocalDockerBackend, ProcessRunner,
};
use repokit_lifecycle::{DatabaseLifecycle, DatabaseTasks};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct DbArgs {
    /// Repository containing the database/ directory
    #[arg(long, env = "REPOKIT_PATH", default_value = ".")]
    pub path: PathBuf,

    /// Host port for a local database (default: a random free port)
    #[arg(long, env = "REPOKIT_PORT")]
    pub port: Option<u16>,

    /// Database host to advertise or connect to
    #[arg(long, env = "REPOKIT_HOST")]
    pub host: Option<String>,

    /// Password for the new database (default: generated)
    #[arg(long, env = "REPOKIT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Project name, used as database name and owner (default: git repo name with - replaced by _)
    #[arg(long, env = "REPOKIT_PROJECT_NAME")]
    pub project_name: Option<String>,

    /// Connection string of an existing database
    #[arg(long, env = "REPOKIT_CONN_STRING", hide_env_values = true)]
    pub conn_string: Option<String>,

    /// Pod spec to use instead of database/pod.yaml
    #[arg(long)]
    pub kube_pod_config: Option<PathBuf>,

    /// Pod to stop
    #[arg(long)]
    pub pod_id: Option<String>,

    /// Kubernetes namespace for database pods
    #[arg(long, env = "REPOKIT_NAMESPACE")]
    pub namespace: Option<String>,

    /// What reset-data does without a repository reset script (recreate, delete-rows)
    #[arg(long, env = "REPOKIT_RESET_STRATEGY", value_parser = parse_reset_strategy)]
    pub reset_strategy: Option<ResetStrategy>,

    #[command(subcommand)]
    pub command: DbCommand,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbCommand {
    /// Start a database in a local Docker container
    StartLocal,
    /// Start a database in a Kubernetes pod
    #[command(name = "start-k8s")]
    StartK8s,
    /// Start a local database and load the test data
    StartLocalTestDb,
    /// Start a database pod and load the test data
    #[command(name = "start-k8s-test-db")]
    StartK8sTestDb,
    /// Create the role and database, then run migrations
    SetupDb,
    /// Load the repository's test data
    InsertTestData,
    /// Reset the database to its post-setup state
    ResetData,
    /// Stop a local database
    StopLocal,
    /// Stop a database pod
    #[command(name = "stop-k8s")]
    StopK8s,
}

fn parse_reset_strategy(value: &str) -> std::result::Result<ResetStrategy, String> {
    value.parse().map_err(|e: repokit_config::ConfigError| e.to_string())
}

/// Run a `db` subcommand.
pub async fn run(args: DbArgs) -> Result<()> {
    let repo_path = args
        .path
        .canonicalize()
        .with_context(|| format!("Failed to resolve repository path: {}", args.path.display()))?;
    let env: HashMap<String, String> = std::env::vars().collect();
    let settings = resolve_settings(&repo_path, &args, &env)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    let tasks = DatabaseTasks::new(runner.clone(), settings.clone(), &repo_path).with_env(env);

    match args.command {
        DbCommand::StartLocal | DbCommand::StartLocalTestDb => {
            let backend = LocalDockerBackend::new(runner.clone(), settings)
                .context("Failed to connect to Docker")?;
            let request = provision_request(&args, &repo_path, runner.as_ref()).await?;
            let with_data = args.command == DbCommand::StartLocalTestDb;
            let instance = start(Arc::new(backend), tasks, &request, with_data).await?;
            println!("{}", instance.connection.to_uri());
        }
        DbCommand::StartK8s | DbCommand::StartK8sTestDb => {
            let backend = KubernetesBackend::new(settings)
                .await
                .context("Failed to connect to Kubernetes")?;
            let request = provision_request(&args, &repo_path, runner.as_ref()).await?;
            let with_data = args.command == DbCommand::StartK8sTestDb;
            let instance = start(Arc::new(backend), tasks, &request, with_data).await?;
            println!("{}", instance.connection.to_uri());
            println!("{}", instance.handle.instance_id);
        }
        DbCommand::SetupDb => {
            let target = target_connection(&args, &repo_path, runner.as_ref()).await?;
            let outcome = tasks.setup_schema(&target).await?;
            info!(outcome = ?outcome, "Database is set up");
        }
        DbCommand::InsertTestData => {
            let target = target_connection(&args, &repo_path, runner.as_ref()).await?;
            tasks.load_test_data(&target).await?;
        }
        DbCommand::ResetData => {
            let target = target_connection(&args, &repo_path, runner.as_ref()).await?;
            tasks.reset_data(&target).await?;
        }
        DbCommand::StopLocal => {
            let handle = local_handle(&args, &repo_path, runner.as_ref()).await?;
            let backend = LocalDockerBackend::new(runner.clone(), settings)
                .context("Failed to connect to Docker")?;
            backend
                .teardown(&handle)
                .await
                .with_context(|| format!("Failed to stop {}", handle))?;
            info!(handle = %handle, "Database stopped");
        }
        DbCommand::StopK8s => {
            let backend = KubernetesBackend::new(settings)
                .await
                .context("Failed to connect to Kubernetes")?;
            let handle = match (&args.pod_id, &args.conn_string) {
                (Some(pod_id), _) => InstanceHandle::new(backend.name(), pod_id.clone()),
                (None, Some(conn_string)) => {
                    let conn = ConnectionData::parse(conn_string)?;
                    backend.find_by_host(&conn.host).await?
                }
                (None, None) => bail!("stop-k8s needs --pod-id or --conn-string"),
            };
            backend
                .teardown(&handle)
                .await
                .with_context(|| format!("Failed to stop {}", handle))?;
            info!(handle = %handle, "Database stopped");
        }
    }

    Ok(())
}

async fn start(
    backend: Arc<dyn Backend>,
    tasks: DatabaseTasks,
    request: &ProvisionRequest,
    with_data: bool,
) -> Result<repokit_core::Instance> {
    let mut lifecycle = DatabaseLifecycle::new(backend, tasks);
    let instance = if with_data {
        lifecycle.start_test_database(request).await?
    } else {
        let instance = lifecycle.provision(request).await?;
        lifecycle.setup_schema().await?;
        instance
    };
    info!(
        connection = %instance.connection,
        handle = %instance.handle,
        "Successfully started a database"
    );
    Ok(instance)
}

/// Settings from the repository file, then environment, then flags.
fn resolve_settings(
    repo_path: &Path,
    args: &DbArgs,
    env: &HashMap<String, String>,
) -> Result<Settings> {
    let mut settings = load_settings(repo_path)
        .with_context(|| format!("Failed to load settings from {}", repo_path.display()))?
        .with_env_overrides(env);
    if let Some(host) = &args.host {
        settings.host = Some(host.clone());
    }
    if let Some(namespace) = &args.namespace {
        settings.namespace = namespace.clone();
    }
    if let Some(strategy) = args.reset_strategy {
        settings.reset_strategy = strategy;
    }
    Ok(settings)
}

async fn provision_request(
    args: &DbArgs,
    repo_path: &Path,
    runner: &dyn CommandRunner,
) -> Result<ProvisionRequest> {
    let name = project_name(args, repo_path, runner).await?;
    Ok(ProvisionRequest {
        port: args.port,
        password: args.password.clone(),
        pod_config: args.kube_pod_config.clone(),
        ..ProvisionRequest::new(repo_path, name)
    })
}

async fn target_connection(
    args: &DbArgs,
    repo_path: &Path,
    runner: &dyn CommandRunner,
) -> Result<ConnectionData> {
    if let Some(conn_string) = &args.conn_string {
        return Ok(ConnectionData::parse(conn_string)?);
    }
    let Some(port) = args.port else {
        bail!("--conn-string or --port is required");
    };
    let name = project_name(args, repo_path, runner).await?;
    Ok(ConnectionData::new(
        args.host.as_deref().unwrap_or("localhost"),
        port,
        name.clone(),
        name,
        args.password.clone(),
    ))
}

async fn local_handle(
    args: &DbArgs,
    repo_path: &Path,
    runner: &dyn CommandRunner,
) -> Result<InstanceHandle> {
    if let Some(conn_string) = &args.conn_string {
        let conn = ConnectionData::parse(conn_string)?;
        return Ok(LocalDockerBackend::handle_for(&conn));
    }
    let Some(port) = args.port else {
        bail!("stop-local needs --conn-string or --port");
    };
    let name = project_name(args, repo_path, runner).await?;
    Ok(InstanceHandle::new(
        "docker",
        LocalDockerBackend::container_name(&name, port),
    ))
}

/// The `--project-name` flag, else the name of the repository's origin remote.
async fn project_name(args: &DbArgs, repo_path: &Path, runner: &dyn CommandRunner) -> Result<String> {
    if let Some(name) = &args.project_name {
        return Ok(name.clone());
    }

    let invocation = Invocation::new("git")
        .args(["config", "--get", "remote.origin.url"])
        .current_dir(repo_path);
    let output = runner
        .run(&invocation)
        .await
        .context("Failed to read the git remote; pass --project-name")?;
    let name = repo_name_from_remote(&output.stdout).with_context(|| {
        format!("Cannot derive a project name from remote '{}'", output.stdout.trim())
    })?;
    info!(project = %name, "Using project name from git remote");
    Ok(name)
}

/// Project name from a git remote URL: last path segment, without `.git`, `-` replaced by `_`.
pub fn repo_name_from_remote(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        return None;
    }
    Some(name.replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name_from_https_remote() {
        assert_eq!(
            repo_name_from_remote("https://github.com/acme/order-service.git\n").as_deref(),
            Some("order_service")
        );
    }

    #[test]
    fn test_repo_name_from_ssh_remote() {
        assert_eq!(
            repo_name_from_remote("git@github.com:acme/orders.git").as_deref(),
            Some("orders")
        );
        assert_eq!(
            repo_name_from_remote("git@host:orders-db").as_deref(),
            Some("orders_db")
        );
    }

    #[test]
    fn test_repo_name_without_suffix_or_with_trailing_slash() {
        assert_eq!(
            repo_name_from_remote("https://example.com/acme/my-repo/").as_deref(),
            Some("my_repo")
        );
    }

    #[test]
    fn test_empty_remote() {
        assert_eq!(repo_name_from_remote(""), None);
        assert_eq!(repo_name_from_remote("https://example.com/.git"), None);
    }
}
