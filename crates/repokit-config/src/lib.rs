//! KDL settings and template interpolation for repokit.
//!
//! This crate handles:
//! - Settings (`database/repokit.kdl` in the target repository)
//! - `${...}` interpolation for bundled SQL templates

pub mod error;
pub mod settings;
pub mod template;

pub use error::{ConfigError, ConfigResult};
pub use settings::{ResetStrategy, Settings, ToolSettings, load_settings, parse_settings};
pub use template::{DatabaseContext, TemplateContext, TemplateContextBuilder};
