//! Schema setup, fixture loading and reset against a running database.
//!
//! Every task takes the target [`ConnectionData`] explicitly, so it works for
//! an instance this process provisioned as well as one known only by its
//! connection string.

use repokit_config::{ResetStrategy, Settings, TemplateContextBuilder};
use repokit_core::strategy::{Candidate, first_present};
use repokit_core::{ConnectionData, Error, Result};
use repokit_executor::process::{CommandRunner, Invocation};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::migrate::{self, MigrationOutcome};

const BUNDLED_SETUP_SQL: &str = include_str!("../templates/setup.sql");

const SETUP_CANDIDATES: [Candidate<()>; 1] = [Candidate::file("database/setup.sql", ())];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixtureSource {
    Script,
    Sql,
}

const INSERT_CANDIDATES: [Candidate<FixtureSource>; 2] = [
    Candidate::executable("database/insert_test_data", FixtureSource::Script),
    Candidate::file("database/insert_test_data.sql", FixtureSource::Sql),
];

const RESET_CANDIDATES: [Candidate<FixtureSource>; 2] = [
    Candidate::executable("database/reset_data", FixtureSource::Script),
    Candidate::file("database/reset_data.sql", FixtureSource::Sql),
];

// Skips catalog (pg_*), information schema (sql_*) and sqitch bookkeeping tables.
const USER_TABLES_SQL: &str = "SELECT quote_ident(nspname) || '.' || quote_ident(relname) \
     FROM pg_class JOIN pg_namespace ON relnamespace = pg_namespace.oid \
     WHERE relkind = 'r' AND relname !~ '^(pg_|sql_)' AND nspname != 'sqitch'";

/// Database tasks for one repository.
pub struct DatabaseTasks {
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
    repo_path: PathBuf,
    /// Environment snapshot for the setup password fallback.
    env: HashMap<String, String>,
}

impl DatabaseTasks {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            settings,
            repo_path: repo_path.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create the role and database, then run migrations.
    pub async fn setup_schema(&self, target: &ConnectionData) -> Result<MigrationOutcome> {
        self.run_setup(target).await?;
        self.run_migrations(target).await
    }

    /// Run `database/setup.sql`, or the bundled template, as the superuser.
    pub async fn run_setup(&self, target: &ConnectionData) -> Result<()> {
        let sql = match first_present(&self.repo_path, &SETUP_CANDIDATES) {
            Some(resolved) => {
                info!(script = %resolved.path.display(), "Running repository setup script");
                std::fs::read_to_string(&resolved.path)?
            }
            None => {
                debug!(
                    repo = %self.repo_path.display(),
                    "Repository has no database/setup.sql, using the bundled template"
                );
                self.render_setup_template(target)?
            }
        };

        let admin = self.admin_connection(target);
        self.runner.run(&self.psql(&admin, sql)).await?;
        info!(target_db = %target, "Database setup complete");
        Ok(())
    }

    /// Run the repository's migrations; a failed run is an error.
    pub async fn run_migrations(&self, target: &ConnectionData) -> Result<MigrationOutcome> {
        let outcome =
            migrate::run_migrations(self.runner.as_ref(), &self.settings, &self.repo_path, target)
                .await?
                .into_result()?;
        info!(target_db = %target, outcome = ?outcome, "Migrations finished");
        Ok(outcome)
    }

    /// Load the repository's test data.
    pub async fn load_test_data(&self, target: &ConnectionData) -> Result<()> {
        if self.run_repo_fixture(&INSERT_CANDIDATES, target).await? {
            info!(target_db = %target, "Test data loaded");
            return Ok(());
        }
        Err(Error::MissingFixture(format!(
            "{} has neither database/insert_test_data nor database/insert_test_data.sql",
            self.repo_path.display()
        )))
    }

    /// Return the database to its post-setup state.
    ///
    /// Uses the repository's reset script when it has one, else the
    /// configured [`ResetStrategy`].
    pub async fn reset_data(&self, target: &ConnectionData) -> Result<()> {
        if self.run_repo_fixture(&RESET_CANDIDATES, target).await? {
            info!(target_db = %target, "Data reset by repository script");
            return Ok(());
        }

        match self.settings.reset_strategy {
            ResetStrategy::Recreate => self.recreate(target).await,
            ResetStrategy::DeleteRows => self.delete_rows(target).await,
        }
    }

    async fn recreate(&self, target: &ConnectionData) -> Result<()> {
        if target.user == self.settings.admin_user || target.dbname == self.settings.admin_database
        {
            return Err(Error::InvalidInput(format!(
                "refusing to drop the admin role or database ({})",
                target
            )));
        }

        info!(target_db = %target, "Dropping database and role");
        let sql = format!(
            "DROP DATABASE IF EXISTS {} WITH (FORCE);\nDROP ROLE IF EXISTS {};\n",
            quote_ident(&target.dbname),
            quote_ident(&target.user)
        );
        let admin = self.admin_connection(target);
        self.runner.run(&self.psql(&admin, sql)).await?;

        self.setup_schema(target).await?;
        Ok(())
    }

    async fn delete_rows(&self, target: &ConnectionData) -> Result<()> {
        let (mut client, connection) = tokio_postgres::connect(&target.to_key_value(), NoTls)
            .await
            .map_err(|e| Error::Backend(format!("Failed to connect to {}: {}", target, e)))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Database connection error");
            }
        });

        let result = async {
            let transaction = client.transaction().await?;
            let tables: Vec<String> = transaction
                .query(USER_TABLES_SQL, &[])
                .await?
                .iter()
                .map(|row| row.get(0))
                .collect();
            for table in &tables {
                let deleted = transaction
                    .execute(format!("DELETE FROM {}", table).as_str(), &[])
                    .await?;
                debug!(table = %table, deleted, "Deleted rows");
            }
            transaction.commit().await?;
            Ok::<usize, tokio_postgres::Error>(tables.len())
        }
        .await;

        drop(client);
        let _ = driver.await;

        let tables =
            result.map_err(|e| Error::Backend(format!("Failed to reset {}: {}", target, e)))?;
        info!(target_db = %target, tables, "Deleted all rows");
        Ok(())
    }

    async fn run_repo_fixture(
        &self,
        candidates: &[Candidate<FixtureSource>],
        target: &ConnectionData,
    ) -> Result<bool> {
        let Some(resolved) = first_present(&self.repo_path, candidates) else {
            return Ok(false);
        };

        info!(source = %resolved.path.display(), target_db = %target, "Running repository fixture");
        let invocation = match resolved.strategy {
            FixtureSource::Script => self.script(&resolved.path, target),
            FixtureSource::Sql => {
                let sql = std::fs::read_to_string(&resolved.path)?;
                self.psql(target, sql)
            }
        };
        self.runner.run(&invocation).await?;
        Ok(true)
    }

    fn render_setup_template(&self, target: &ConnectionData) -> Result<String> {
        let password = match &target.password {
            Some(password) => password.clone(),
            None => {
                let vars = password_env_vars(&target.dbname);
                vars.iter()
                    .find_map(|var| self.env.get(var).cloned())
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "{} must be set to set up a database without a password",
                            vars.join(" or ")
                        ))
                    })?
            }
        };

        // Every template variable sits inside a string literal.
        let ctx = TemplateContextBuilder::new()
            .with_database(escape_literal(&target.dbname), escape_literal(&target.user))
            .with_password(Some(escape_literal(&password)))
            .build();

        let missing = ctx.unresolved(BUNDLED_SETUP_SQL);
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "setup template variables not set: {}",
                missing.join(", ")
            )));
        }
        Ok(ctx.interpolate(BUNDLED_SETUP_SQL))
    }

    fn admin_connection(&self, target: &ConnectionData) -> ConnectionData {
        target.with_admin(&self.settings.admin_user, &self.settings.admin_database)
    }

    fn psql(&self, target: &ConnectionData, sql: String) -> Invocation {
        Invocation::new(&self.settings.tools.psql)
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1"])
            .envs(target.to_env())
            .stdin(sql)
            .redact(target.password.as_deref())
    }

    fn script(&self, path: &Path, target: &ConnectionData) -> Invocation {
        Invocation::new(path.display().to_string())
            .current_dir(self.repo_path.join("database"))
            .envs(target.to_env())
            .env("DATABASE_URL", target.to_uri())
            .redact(target.password.as_deref())
    }
}

/// Environment variables that may hold the password for `dbname`, in lookup
/// order: `ORDERS_DB_PASSWORD`, then the name as written, `orders_DB_PASSWORD`.
pub fn password_env_vars(dbname: &str) -> Vec<String> {
    let mut vars = vec![format!("{}_DB_PASSWORD", dbname.to_uppercase())];
    let as_written = format!("{}_DB_PASSWORD", dbname);
    if !vars.contains(&as_written) {
        vars.push(as_written);
    }
    vars
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn escape_ident(name: &str) -> String {
    name.replace('"', "\"\"")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", escape_ident(name))
}
