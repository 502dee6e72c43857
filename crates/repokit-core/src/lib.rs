//! Core domain types and traits for repokit.
//!
//! This crate contains:
//! - Connection data for reaching a Postgres instance
//! - The backend trait implemented by the container and pod drivers
//! - The readiness waiter shared by every backend
//! - Ranked lookup of repository overrides

pub mod backend;
pub mod connection;
pub mod error;
pub mod strategy;
pub mod wait;

pub use backend::{Backend, Instance, InstanceHandle, ProvisionRequest};
pub use connection::ConnectionData;
pub use error::{Error, Result};
pub use wait::{WaitPolicy, wait_until_ready};
