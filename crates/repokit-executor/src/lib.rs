//! Database instance backends for repokit.
//!
//! Provides backend implementations for ephemeral Postgres instances:
//! - Local Docker (development)
//! - Kubernetes pods (CI)
//!
//! plus the process runner used for the external tools.

pub mod docker;
pub mod kubernetes;
pub mod probe;
pub mod process;

pub use docker::LocalDockerBackend;
pub use kubernetes::KubernetesBackend;
pub use probe::probe_database;
pub use process::{CommandOutput, CommandRunner, Invocation, ProcessRunner};

use rand::Rng;
use rand::distr::Alphanumeric;

/// Label set on every container and pod this crate creates.
pub const INSTANCE_LABEL: &str = "repokit.instance";

const PASSWORD_LENGTH: usize = 32;

/// Generate a random alphanumeric password for a new instance.
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_password_shape() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LENGTH);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generated_passwords_differ() {
        assert_ne!(generate_password(), generate_password());
    }
}
