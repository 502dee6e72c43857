//! CLI command implementations.

pub mod db;
