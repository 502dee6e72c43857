//! Migration runner.
//!
//! A repository migrates either with its own executable `database/migrate`
//! or with a sqitch project in `database/sqitch/`. The script wins when both
//! are present.

use repokit_config::Settings;
use repokit_core::strategy::{Candidate, first_present};
use repokit_core::{ConnectionData, Error, Result};
use repokit_executor::process::{CommandRunner, Invocation};
use std::path::Path;
use tracing::{debug, info};

const NOTHING_TO_DEPLOY: &str = "Nothing to deploy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationSource {
    Script,
    Sqitch,
}

const MIGRATION_CANDIDATES: [Candidate<MigrationSource>; 2] = [
    Candidate::executable("database/migrate", MigrationSource::Script),
    Candidate::directory("database/sqitch", MigrationSource::Sqitch),
];

/// Result of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Changes were deployed.
    Applied,
    /// The database was already up to date.
    NoOp,
    /// The migration tool exited unsuccessfully.
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl MigrationOutcome {
    /// Turn `Failed` into [`Error::CommandFailed`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            MigrationOutcome::Failed {
                command,
                code,
                stderr,
            } => Err(Error::CommandFailed {
                command,
                code,
                stderr,
            }),
            outcome => Ok(outcome),
        }
    }
}

/// Run the repository's migrations against `target`.
///
/// Migrations run as the target role so the objects they create belong to the
/// database owner.
pub async fn run_migrations(
    runner: &dyn CommandRunner,
    settings: &Settings,
    repo_path: &Path,
    target: &ConnectionData,
) -> Result<MigrationOutcome> {
    let resolved = first_present(repo_path, &MIGRATION_CANDIDATES).ok_or_else(|| {
        Error::MigrationConfig(format!(
            "{} has neither an executable database/migrate nor a database/sqitch directory",
            repo_path.display()
        ))
    })?;

    let invocation = match resolved.strategy {
        MigrationSource::Script => {
            info!(script = %resolved.path.display(), "Running repository migration script");
            Invocation::new(resolved.path.display().to_string())
                .current_dir(repo_path.join("database"))
                .envs(target.to_env())
                .env("DATABASE_URL", target.to_uri())
        }
        MigrationSource::Sqitch => {
            if !plan_has_changes(&resolved.path.join("sqitch.plan"))? {
                info!(project = %resolved.path.display(), "Sqitch plan is empty, nothing to deploy");
                return Ok(MigrationOutcome::NoOp);
            }
            info!(project = %resolved.path.display(), "Deploying sqitch changes");
            Invocation::new(&settings.tools.sqitch)
                .args(["--engine", "pg", "deploy"])
                .arg(target.to_migration_uri())
                .current_dir(&resolved.path)
        }
    }
    .redact(target.password.as_deref());

    let output = runner.output(&invocation).await?;
    let outcome = if output.stdout.contains(NOTHING_TO_DEPLOY)
        || output.stderr.contains(NOTHING_TO_DEPLOY)
    {
        MigrationOutcome::NoOp
    } else if output.success() {
        MigrationOutcome::Applied
    } else {
        MigrationOutcome::Failed {
            command: invocation.display(),
            code: output.code,
            stderr: invocation.scrub(output.stderr.trim()),
        }
    };
    debug!(outcome = ?outcome, "Migration finished");
    Ok(outcome)
}

/// Whether a sqitch plan lists at least one change.
///
/// Pragmas (`%`), comments (`#`) and tags (`@`) are not changes.
pub fn plan_has_changes(plan_path: &Path) -> Result<bool> {
    if !plan_path.is_file() {
        return Err(Error::MigrationConfig(format!(
            "sqitch project has no plan at {}",
            plan_path.display()
        )));
    }
    let plan = std::fs::read_to_string(plan_path)?;
    Ok(plan.lines().map(str::trim).any(|line| {
        !line.is_empty() && !line.starts_with('%') && !line.starts_with('#') && !line.starts_with('@')
    }))
}
