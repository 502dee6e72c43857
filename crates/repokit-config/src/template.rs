//! Variable interpolation for bundled SQL templates.
//!
//! Supports variables like:
//! - `${db.name}` - Target database name
//! - `${db.user}` - Target database owner
//! - `${db.password}` - Owner password

use regex::Regex;
use std::sync::LazyLock;

/// Target database variables.
#[derive(Debug, Clone, Default)]
pub struct DatabaseContext {
    pub name: String,
    pub user: String,
    pub password: Option<String>,
}

/// Variables available to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub db: DatabaseContext,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["db", "name"] => Some(self.db.name.clone()),
            ["db", "user"] => Some(self.db.user.clone()),
            ["db", "password"] => self.db.password.clone(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Variables referenced by `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        let mut missing: Vec<String> = VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

/// Builder for creating TemplateContext.
pub struct TemplateContextBuilder {
    ctx: TemplateContext,
}

impl TemplateContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: TemplateContext::new(),
        }
    }

    pub fn with_database(mut self, name: impl Into<String>, user: impl Into<String>) -> Self {
        self.ctx.db.name = name.into();
        self.ctx.db.user = user.into();
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.ctx.db.password = password;
        self
    }

    pub fn build(self) -> TemplateContext {
        self.ctx
    }
}

impl Default for TemplateContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_interpolation() {
        let ctx = TemplateContextBuilder::new()
            .with_database("orders", "orders_owner")
            .with_password(Some("s3cret".to_string()))
            .build();

        let result = ctx.interpolate(
            "CREATE ROLE ${db.user} LOGIN PASSWORD '${db.password}';\nCREATE DATABASE ${db.name};",
        );
        assert_eq!(
            result,
            "CREATE ROLE orders_owner LOGIN PASSWORD 's3cret';\nCREATE DATABASE orders;"
        );
    }

    #[test]
    fn test_missing_password_left_in_place() {
        let ctx = TemplateContextBuilder::new()
            .with_database("orders", "orders")
            .build();

        assert_eq!(ctx.interpolate("'${db.password}'"), "'${db.password}'");
        assert_eq!(ctx.unresolved("${db.name} ${db.password}"), vec!["db.password"]);
    }

    #[test]
    fn test_unknown_namespaces_are_unresolved() {
        let ctx = TemplateContextBuilder::new()
            .with_database("orders", "orders")
            .build();

        assert_eq!(ctx.interpolate("'${env.HOME}' ${schema}"), "'${env.HOME}' ${schema}");
        assert_eq!(ctx.unresolved("${env.HOME} ${db.name}"), vec!["env.HOME"]);
    }

    #[test]
    fn test_unresolved_is_deduplicated() {
        let ctx = TemplateContext::new();
        assert_eq!(ctx.unresolved("${a} ${b} ${a}"), vec!["a", "b"]);
    }

    #[test]
    fn test_sql_braces_untouched() {
        let ctx = TemplateContextBuilder::new()
            .with_database("orders", "orders")
            .build();
        let sql = r#"SELECT '{"db": "${db.name}"}'::jsonb;"#;
        assert_eq!(ctx.interpolate(sql), r#"SELECT '{"db": "orders"}'::jsonb;"#);
    }
}
