//! Backend trait and instance types.
//!
//! Backends provision database instances in isolated environments
//! (local containers, cluster pods).

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{ConnectionData, Result};

/// Handle to a live database instance, used for teardown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{backend}/{instance_id}")]
pub struct InstanceHandle {
    /// Name of the backend that owns the instance.
    pub backend: String,
    /// Backend-specific identifier (container name, pod name).
    pub instance_id: String,
}

impl InstanceHandle {
    pub fn new(backend: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            instance_id: instance_id.into(),
        }
    }
}

/// A provisioned instance and how to reach it.
#[derive(Debug, Clone)]
pub struct Instance {
    pub connection: ConnectionData,
    pub handle: InstanceHandle,
}

/// Parameters for provisioning a new instance.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    /// Repository that may carry `database/` overrides.
    pub repo_path: PathBuf,
    /// Project name; used for the image tag and as the default database and user.
    pub name: String,
    pub dbname: Option<String>,
    pub user: Option<String>,
    /// Host port to bind. Local backend only.
    pub port: Option<u16>,
    /// Generated when absent.
    pub password: Option<String>,
    /// Explicit pod spec file. Cluster backend only.
    pub pod_config: Option<PathBuf>,
}

impl ProvisionRequest {
    pub fn new(repo_path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn dbname(&self) -> &str {
        self.dbname.as_deref().unwrap_or(&self.name)
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.name)
    }
}

/// Trait for database instance backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Start a new instance. Anything created before a failure is removed
    /// before the error is returned.
    async fn provision(&self, request: &ProvisionRequest) -> Result<Instance>;

    /// Whether the instance accepts connections. `Ok(false)` means not yet;
    /// errors are fatal and stop any wait in progress.
    async fn probe_ready(&self, instance: &Instance) -> Result<bool>;

    /// Stop and remove an instance. Fails with `Error::InstanceNotFound`
    /// when it is already gone.
    async fn teardown(&self, handle: &InstanceHandle) -> Result<()>;
}
