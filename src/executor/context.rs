//! Per-task execution context
//!
//! An [`ExecutionContext`] is assembled for every task invocation and
//! discarded once the task returns. Variable precedence, lowest first:
//! group vars, host vars, facts, context variables, task vars.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::config::Config;
use crate::connection::ConnectionConfig;

/// Variables, facts and configuration visible to one task
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Play or caller supplied variables
    pub variables: HashMap<String, JsonValue>,
    /// Facts gathered about the target
    pub facts: HashMap<String, JsonValue>,
    /// Inventory variables of the target host
    pub host_vars: HashMap<String, JsonValue>,
    /// Inventory variables of the target's groups, already merged
    pub group_vars: HashMap<String, JsonValue>,
    /// Global configuration
    pub config: Arc<Config>,
}

impl ExecutionContext {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    pub fn with_host_var(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.host_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_group_var(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.group_vars.insert(key.into(), value.into());
        self
    }

    /// Flatten every scope into one map for `host`
    pub fn template_vars(&self, host: &str) -> Map<String, JsonValue> {
        let mut vars = Map::new();
        for scope in [&self.group_vars, &self.host_vars, &self.facts, &self.variables] {
            for (key, value) in scope {
                vars.insert(key.clone(), value.clone());
            }
        }
        vars.insert("inventory_hostname".into(), JsonValue::from(host));
        vars
    }

    /// Inventory variable from host scope, falling back to group scope
    fn inventory_var(&self, name: &str) -> Option<&JsonValue> {
        self.host_vars.get(name).or_else(|| self.group_vars.get(name))
    }

    fn inventory_str(&self, name: &str) -> Option<String> {
        match self.inventory_var(name)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn inventory_bool(&self, name: &str) -> Option<bool> {
        match self.inventory_var(name)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) => Some(matches!(
                s.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )),
            JsonValue::Number(n) => Some(n.as_i64() != Some(0)),
            _ => None,
        }
    }

    /// Transport requested by inventory (`ansible_connection`)
    pub fn transport(&self) -> Option<String> {
        self.inventory_str("ansible_connection")
    }

    /// Connection settings for `host`: configuration defaults overlaid with
    /// the `ansible_*` inventory variables
    pub fn connection_config(&self, host: &str) -> ConnectionConfig {
        let mut config = self.config.connection_config(host);

        if let Some(address) = self.inventory_str("ansible_host") {
            config.host = address;
        }
        if let Some(port) = self
            .inventory_str("ansible_port")
            .and_then(|p| p.parse::<u16>().ok())
        {
            config.port = port;
        }
        if let Some(user) = self.inventory_str("ansible_user") {
            config.user = Some(user);
        }
        if let Some(password) = self
            .inventory_str("ansible_password")
            .or_else(|| self.inventory_str("ansible_ssh_pass"))
        {
            config.password = Some(password);
        }
        if let Some(key_file) = self.inventory_str("ansible_ssh_private_key_file") {
            config.private_key_file = Some(key_file);
        }
        if let Some(check) = self.inventory_bool("ansible_host_key_checking") {
            config.host_key_checking = check;
        }

        if let Some(enabled) = self.inventory_bool("ansible_become") {
            config.r#become = enabled;
        }
        if config.r#become {
            if let Some(method) = self.inventory_str("ansible_become_method") {
                config.become_method = Some(method);
            }
            if let Some(user) = self.inventory_str("ansible_become_user") {
                config.become_user = Some(user);
            }
        }
        if let Some(password) = self
            .inventory_str("ansible_become_password")
            .or_else(|| self.inventory_str("ansible_become_pass"))
        {
            config.become_password = Some(password);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_template_vars_precedence() {
        let ctx = ExecutionContext::default()
            .with_group_var("level", "group")
            .with_group_var("region", "eu")
            .with_host_var("level", "host")
            .with_fact("os", "linux")
            .with_var("level", "play");

        let vars = ctx.template_vars("web1");
        assert_eq!(vars["level"], json!("play"));
        assert_eq!(vars["region"], json!("eu"));
        assert_eq!(vars["os"], json!("linux"));
        assert_eq!(vars["inventory_hostname"], json!("web1"));
    }

    #[test]
    fn test_connection_config_from_inventory() {
        let ctx = ExecutionContext::default()
            .with_group_var("ansible_user", "ops")
            .with_host_var("ansible_host", "10.0.0.5")
            .with_host_var("ansible_port", 2222)
            .with_host_var("ansible_become", "yes")
            .with_host_var("ansible_become_method", "doas")
            .with_host_var("ansible_connection", "ssh");

        let conn = ctx.connection_config("web1");
        assert_eq!(conn.host, "10.0.0.5");
        assert_eq!(conn.port, 2222);
        assert_eq!(conn.user.as_deref(), Some("ops"));
        assert!(conn.r#become);
        assert_eq!(conn.become_method.as_deref(), Some("doas"));
        assert_eq!(ctx.transport().as_deref(), Some("ssh"));
    }

    #[test]
    fn test_connection_config_defaults() {
        let conn = ExecutionContext::default().connection_config("db1");
        assert_eq!(conn.host, "db1");
        assert_eq!(conn.port, 0);
        assert!(!conn.r#become);
        assert!(conn.host_key_checking);
    }
}
