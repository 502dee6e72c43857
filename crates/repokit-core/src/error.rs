//! Error types for repokit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed connection uri: {0}")]
    MalformedUri(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("container failed: {0}")]
    ContainerFailed(String),

    #[error("pod failed: {0}")]
    PodFailed(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("missing fixture: {0}")]
    MissingFixture(String),

    #[error("migration config: {0}")]
    MigrationConfig(String),

    #[error("readiness probe failed: {0}")]
    ProbeFailed(String),

    #[error("command `{command}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error means the instance was already gone.
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Error::InstanceNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
