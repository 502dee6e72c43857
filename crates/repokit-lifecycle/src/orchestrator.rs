//! Database lifecycle orchestrator - drives one instance from provisioning to teardown.

use repokit_core::{Backend, Error, Instance, ProvisionRequest, Result, wait_until_ready};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::migrate::MigrationOutcome;
use crate::tasks::DatabaseTasks;

/// State of the tracked instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Unprovisioned,
    Provisioned,
    Ready,
    SchemaReady,
    DataLoaded,
    TornDown,
    Failed { message: String },
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::TornDown | LifecycleState::Failed { .. })
    }

    /// Whether the instance accepts connections.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::SchemaReady | LifecycleState::DataLoaded
        )
    }
}

/// Owns one database instance and sequences the tasks run against it.
///
/// Any failure after provisioning tears the instance down before the error
/// is returned.
pub struct DatabaseLifecycle {
    backend: Arc<dyn Backend>,
    tasks: DatabaseTasks,
    state: LifecycleState,
    instance: Option<Instance>,
}

impl DatabaseLifecycle {
    pub fn new(backend: Arc<dyn Backend>, tasks: DatabaseTasks) -> Self {
        Self {
            backend,
            tasks,
            state: LifecycleState::Unprovisioned,
            instance: None,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    /// Provision an instance and wait until it accepts connections.
    pub async fn provision(&mut self, request: &ProvisionRequest) -> Result<Instance> {
        if self.instance.is_some() {
            return Err(Error::InvalidInput(
                "an instance is already provisioned".to_string(),
            ));
        }

        info!(backend = %self.backend.name(), name = %request.name, "Provisioning database");
        let instance = match self.backend.provision(request).await {
            Ok(instance) => instance,
            Err(e) => {
                // The backend already removed whatever it created.
                error!(error = %e, "Provisioning failed");
                self.state = LifecycleState::Failed {
                    message: e.to_string(),
                };
                return Err(e);
            }
        };
        self.instance = Some(instance.clone());
        self.state = LifecycleState::Provisioned;

        let backend = self.backend.clone();
        let policy = self.tasks.settings().database_wait;
        let waited = wait_until_ready("database", policy, || backend.probe_ready(&instance)).await;
        match waited {
            Ok(attempts) => {
                info!(handle = %instance.handle, attempts, "Database is ready");
                self.state = LifecycleState::Ready;
                Ok(instance)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Create the role and database, then migrate.
    pub async fn setup_schema(&mut self) -> Result<MigrationOutcome> {
        let instance = self.ready_instance()?;
        match self.tasks.setup_schema(&instance.connection).await {
            Ok(outcome) => {
                self.state = LifecycleState::SchemaReady;
                Ok(outcome)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Load the repository's test data.
    pub async fn load_test_data(&mut self) -> Result<()> {
        let instance = self.ready_instance()?;
        match self.tasks.load_test_data(&instance.connection).await {
            Ok(()) => {
                self.state = LifecycleState::DataLoaded;
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Return the database to its post-setup state.
    pub async fn reset_data(&mut self) -> Result<()> {
        let instance = self.ready_instance()?;
        match self.tasks.reset_data(&instance.connection).await {
            Ok(()) => {
                self.state = LifecycleState::SchemaReady;
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Stop and remove the tracked instance.
    pub async fn teardown(&mut self) -> Result<()> {
        let instance = self
            .instance
            .take()
            .ok_or_else(|| Error::InvalidInput("no instance to tear down".to_string()))?;

        info!(handle = %instance.handle, "Tearing down database");
        self.backend.teardown(&instance.handle).await?;
        self.state = LifecycleState::TornDown;
        Ok(())
    }

    /// Provision, set up the schema and load test data.
    pub async fn start_test_database(&mut self, request: &ProvisionRequest) -> Result<Instance> {
        let instance = self.provision(request).await?;
        self.setup_schema().await?;
        self.load_test_data().await?;
        Ok(instance)
    }

    fn ready_instance(&self) -> Result<Instance> {
        match &self.instance {
            Some(instance) if self.state.is_ready() => Ok(instance.clone()),
            _ => Err(Error::InvalidInput(format!(
                "database is not ready (state: {:?})",
                self.state
            ))),
        }
    }

    async fn fail(&mut self, err: Error) -> Error {
        error!(error = %err, "Database lifecycle failed");
        if let Some(instance) = self.instance.take() {
            warn!(handle = %instance.handle, "Tearing down after failure");
            if let Err(e) = self.backend.teardown(&instance.handle).await {
                warn!(handle = %instance.handle, error = %e, "Teardown after failure failed");
            }
        }
        self.state = LifecycleState::Failed {
            message: err.to_string(),
        };
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, RecordingRunner};
    use repokit_config::Settings;
    use repokit_core::WaitPolicy;
    use repokit_executor::process::CommandOutput;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const PLAN: &str = "%project=orders\ntest_table 2024-01-01T00:00:00Z Dev <dev@example.com>\n";

    fn repo(with_fixture: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("database/sqitch")).unwrap();
        fs::write(dir.path().join("database/sqitch/sqitch.plan"), PLAN).unwrap();
        if with_fixture {
            fs::write(
                dir.path().join("database/insert_test_data.sql"),
                "INSERT INTO test VALUES ('test');",
            )
            .unwrap();
        }
        dir
    }

    fn lifecycle(
        backend: &Arc<FakeBackend>,
        runner: &Arc<RecordingRunner>,
        repo: &Path,
    ) -> DatabaseLifecycle {
        let settings = Settings {
            database_wait: WaitPolicy::new(Duration::from_secs(2), Duration::from_millis(100)),
            ..Settings::default()
        };
        DatabaseLifecycle::new(
            backend.clone(),
            DatabaseTasks::new(runner.clone(), settings, repo),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_waits_for_readiness() {
        let dir = repo(true);
        let backend = Arc::new(FakeBackend {
            not_ready_probes: 3,
            ..FakeBackend::new()
        });
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        let instance = lifecycle
            .provision(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap();
        assert_eq!(instance.connection.dbname, "orders");
        assert_eq!(lifecycle.state(), &LifecycleState::Ready);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_tears_down() {
        let dir = repo(true);
        let backend = Arc::new(FakeBackend {
            not_ready_probes: usize::MAX,
            ..FakeBackend::new()
        });
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        let err = lifecycle
            .provision(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(matches!(lifecycle.state(), LifecycleState::Failed { .. }));
        assert_eq!(backend.torn_down().len(), 1);
        assert!(lifecycle.instance().is_none());
    }

    #[tokio::test]
    async fn test_backend_failure_is_not_torn_down_again() {
        let dir = repo(true);
        let backend = Arc::new(FakeBackend {
            fail_provision: true,
            ..FakeBackend::new()
        });
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        let err = lifecycle
            .provision(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContainerFailed(_)));
        assert!(backend.torn_down().is_empty());
    }

    #[tokio::test]
    async fn test_start_test_database() {
        let dir = repo(true);
        let backend = Arc::new(FakeBackend::new());
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        lifecycle
            .start_test_database(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::DataLoaded);

        let programs: Vec<String> = runner.calls().into_iter().map(|c| c.program).collect();
        assert_eq!(programs, vec!["psql", "sqitch", "psql"]);

        lifecycle.teardown().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::TornDown);
        assert!(lifecycle.state().is_terminal());
        assert_eq!(backend.torn_down().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_fixture_tears_down() {
        let dir = repo(false);
        let backend = Arc::new(FakeBackend::new());
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        let err = lifecycle
            .start_test_database(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingFixture(_)));
        assert!(matches!(lifecycle.state(), LifecycleState::Failed { .. }));
        assert_eq!(backend.torn_down().len(), 1);
    }

    #[tokio::test]
    async fn test_migration_config_error_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        let err = lifecycle
            .start_test_database(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MigrationConfig(_)));
        assert_eq!(backend.torn_down().len(), 1);
    }

    #[tokio::test]
    async fn test_setup_schema_twice() {
        let dir = repo(true);
        let backend = Arc::new(FakeBackend::new());
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        lifecycle
            .provision(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap();
        assert_eq!(
            lifecycle.setup_schema().await.unwrap(),
            MigrationOutcome::Applied
        );

        runner.respond(CommandOutput {
            code: Some(0),
            ..Default::default()
        });
        runner.respond(CommandOutput {
            code: Some(0),
            stdout: "Nothing to deploy (up-to-date)".to_string(),
            stderr: String::new(),
        });
        assert_eq!(lifecycle.setup_schema().await.unwrap(), MigrationOutcome::NoOp);
        assert_eq!(lifecycle.state(), &LifecycleState::SchemaReady);
    }

    #[tokio::test]
    async fn test_steps_require_ready_instance() {
        let dir = repo(true);
        let backend = Arc::new(FakeBackend::new());
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        assert!(matches!(
            lifecycle.setup_schema().await.unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            lifecycle.teardown().await.unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reset_after_load_returns_to_schema_ready() {
        let dir = repo(true);
        fs::write(dir.path().join("database/reset_data.sql"), "DELETE FROM test;").unwrap();
        let backend = Arc::new(FakeBackend::new());
        let runner = Arc::new(RecordingRunner::new());
        let mut lifecycle = lifecycle(&backend, &runner, dir.path());

        lifecycle
            .start_test_database(&ProvisionRequest::new(dir.path(), "orders"))
            .await
            .unwrap();
        lifecycle.reset_data().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::SchemaReady);
        lifecycle.load_test_data().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::DataLoaded);
    }
}
