//! Database lifecycle orchestration for repokit.
//!
//! Sequences provisioning, readiness, schema setup, migrations, fixture
//! loading, reset and teardown for one ephemeral Postgres instance.

pub mod migrate;
pub mod orchestrator;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use migrate::{MigrationOutcome, run_migrations};
pub use orchestrator::{DatabaseLifecycle, LifecycleState};
pub use tasks::{DatabaseTasks, password_env_vars};
