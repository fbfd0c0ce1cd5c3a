//! Module and plugin name resolution.
//!
//! The [`Router`] maps a requested module or plugin name to the name of the
//! implementation that should run, following a single redirect hop from the
//! loaded [`RuntimeConfig`]. It also reports deprecations, action plugin
//! overrides and action group membership, and validates that the redirect
//! graph has no cycles.
//!
//! # Example
//!
//! ```rust,ignore
//! use convoy::routing::{Router, RuntimeConfig};
//!
//! let router = Router::new();
//! router.load_config_from_file("routing.yml")?;
//! router.validate_config()?;
//!
//! let name = router.resolve_module("old_module")?;
//! ```

pub mod runtime;

pub use runtime::{Deprecation, ModuleRouting, PluginType, RuntimeConfig};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Errors raised while resolving names or loading routing tables
#[derive(Error, Debug)]
pub enum RouterError {
    /// A blank name was requested
    #[error("Empty {0} name")]
    EmptyName(PluginType),

    /// The plugin has been removed
    #[error("{plugin_type} '{name}' has been removed: {message}")]
    Removed {
        /// Category of the plugin
        plugin_type: PluginType,
        /// Requested name
        name: String,
        /// Removal message
        message: String,
    },

    /// An entry redirects to itself
    #[error("{plugin_type} '{name}' redirects to itself")]
    SelfRedirect {
        /// Category of the plugin
        plugin_type: PluginType,
        /// Requested name
        name: String,
    },

    /// The redirect graph contains a cycle
    #[error("Circular redirect in {plugin_type} routing: {}", chain.join(" -> "))]
    CircularRedirect {
        /// Category containing the cycle
        plugin_type: PluginType,
        /// Names along the cycle, first name repeated at the end
        chain: Vec<String>,
    },

    /// Unknown plugin category
    #[error("Unknown plugin type: {0}")]
    UnknownPluginType(String),

    /// Routing file could not be read
    #[error("Failed to read routing file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Routing YAML is malformed
    #[error("Invalid routing YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Routing map is malformed
    #[error("Invalid routing data: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for routing operations
pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Default)]
struct RouterState {
    config: RuntimeConfig,
    cache: HashMap<(PluginType, String), String>,
}

/// Resolves requested names to implementation names
#[derive(Debug, Default)]
pub struct Router {
    state: RwLock<RouterState>,
}

impl Router {
    /// Create a router with an empty routing table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a router around an existing routing table
    pub fn with_config(config: RuntimeConfig) -> Self {
        let router = Self::new();
        router.load_config(config);
        router
    }

    /// Replace the routing table and clear cached resolutions
    pub fn load_config(&self, config: RuntimeConfig) {
        let mut state = self.state.write();
        state.config = config;
        state.cache.clear();
        debug!("Routing table replaced");
    }

    /// Replace the routing table from a generic key/value map
    pub fn load_config_from_map(
        &self,
        map: serde_json::Map<String, serde_json::Value>,
    ) -> RouterResult<()> {
        self.load_config(RuntimeConfig::from_map(map)?);
        Ok(())
    }

    /// Replace the routing table from a YAML file
    pub fn load_config_from_file(&self, path: impl AsRef<Path>) -> RouterResult<()> {
        self.load_config(RuntimeConfig::from_file(path)?);
        Ok(())
    }

    /// A copy of the current routing table
    pub fn config(&self) -> RuntimeConfig {
        self.state.read().config.clone()
    }

    /// Resolve a module name, following at most one redirect
    pub fn resolve_module(&self, name: &str) -> RouterResult<String> {
        self.resolve_plugin(PluginType::Modules, name)
    }

    /// Resolve a plugin name within a category, following at most one redirect.
    ///
    /// Successful resolutions, identity ones included, are cached until the
    /// table is replaced. Errors are never cached.
    pub fn resolve_plugin(&self, plugin_type: PluginType, name: &str) -> RouterResult<String> {
        if name.trim().is_empty() {
            return Err(RouterError::EmptyName(plugin_type));
        }

        let key = (plugin_type, name.to_string());
        if let Some(resolved) = self.state.read().cache.get(&key) {
            trace!(plugin_type = %plugin_type, name = %name, "Resolution cache hit");
            return Ok(resolved.clone());
        }

        let mut state = self.state.write();
        let resolved = match state.config.get(plugin_type, name) {
            None => name.to_string(),
            Some(entry) => {
                if let Some(message) = entry.removal_message(plugin_type, name) {
                    return Err(RouterError::Removed {
                        plugin_type,
                        name: name.to_string(),
                        message,
                    });
                }
                match entry.redirect.as_deref() {
                    Some(target) if target == name => {
                        return Err(RouterError::SelfRedirect {
                            plugin_type,
                            name: name.to_string(),
                        })
                    }
                    Some(target) => {
                        debug!(plugin_type = %plugin_type, from = %name, to = %target, "Redirected");
                        target.to_string()
                    }
                    None => name.to_string(),
                }
            }
        };

        state.cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Number of cached resolutions
    pub fn cached_resolutions(&self) -> usize {
        self.state.read().cache.len()
    }

    /// Deprecation warning for a module, checking its redirect target when
    /// the entry itself is not deprecated
    pub fn module_deprecation(&self, name: &str) -> Option<String> {
        let state = self.state.read();
        let entry = state.config.get_module_routing(name)?;
        if let Some(warning) = entry.deprecation_warning(PluginType::Modules, name) {
            return Some(warning);
        }

        let target = entry.redirect.as_deref()?;
        state
            .config
            .get_module_routing(target)?
            .deprecation_warning(PluginType::Modules, target)
    }

    /// Whether a module (or its redirect target) is deprecated, with the
    /// warning text (empty when not deprecated)
    pub fn is_module_deprecated(&self, name: &str) -> (bool, String) {
        match self.module_deprecation(name) {
            Some(warning) => (true, warning),
            None => (false, String::new()),
        }
    }

    /// Action plugin override for a module, following one redirect hop
    pub fn get_module_action_plugin(&self, name: &str) -> Option<String> {
        let state = self.state.read();
        let entry = state.config.get_module_routing(name)?;
        if let Some(plugin) = &entry.action_plugin {
            return Some(plugin.clone());
        }

        let target = entry.redirect.as_deref()?;
        state
            .config
            .get_module_routing(target)?
            .action_plugin
            .clone()
    }

    /// Whether `name` is listed in the action group `group`
    pub fn is_module_in_action_group(&self, name: &str, group: &str) -> bool {
        self.state
            .read()
            .config
            .action_groups
            .get(group)
            .map_or(false, |members| members.iter().any(|m| m == name))
    }

    /// Check every category's redirect graph for cycles
    pub fn validate_config(&self) -> RouterResult<()> {
        let state = self.state.read();
        for plugin_type in PluginType::ALL {
            if let Some(entries) = state.config.entries(plugin_type) {
                if let Some(chain) = find_cycle(entries) {
                    return Err(RouterError::CircularRedirect { plugin_type, chain });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// Depth-first search with path coloring over single-successor redirects.
///
/// Returns the first cycle found, as the names along it with the first name
/// repeated at the end.
fn find_cycle(entries: &HashMap<String, ModuleRouting>) -> Option<Vec<String>> {
    let mut names: Vec<&str> = entries.keys().map(String::as_str).collect();
    names.sort_unstable();

    let mut color: HashMap<&str, Color> = HashMap::new();
    for start in names {
        if color.contains_key(start) {
            continue;
        }

        let mut path: Vec<&str> = Vec::new();
        let mut current = Some(start);
        while let Some(node) = current {
            match color.get(node) {
                Some(Color::Gray) => {
                    let from = path.iter().position(|n| *n == node).unwrap_or(0);
                    let mut chain: Vec<String> =
                        path[from..].iter().map(|n| n.to_string()).collect();
                    chain.push(node.to_string());
                    return Some(chain);
                }
                Some(Color::Black) => break,
                None => {}
            }
            color.insert(node, Color::Gray);
            path.push(node);
            current = entries.get(node).and_then(|e| e.redirect.as_deref());
        }

        for node in path {
            color.insert(node, Color::Black);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router_with(entries: &[(&str, ModuleRouting)]) -> Router {
        let mut config = RuntimeConfig::default();
        for (name, entry) in entries {
            config.insert(PluginType::Modules, *name, entry.clone());
        }
        Router::with_config(config)
    }

    #[test]
    fn test_resolve_identity_and_redirect() {
        let router = router_with(&[("old", ModuleRouting::redirect("new"))]);
        assert_eq!(router.resolve_module("old").unwrap(), "new");
        assert_eq!(router.resolve_module("plain").unwrap(), "plain");
        assert_eq!(router.cached_resolutions(), 2);
    }

    #[test]
    fn test_resolution_follows_one_hop_only() {
        let router = router_with(&[
            ("a", ModuleRouting::redirect("b")),
            ("b", ModuleRouting::redirect("c")),
        ]);
        assert_eq!(router.resolve_module("a").unwrap(), "b");
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let router = router_with(&[("old", ModuleRouting::redirect("new"))]);
        let first = router.resolve_module("old").unwrap();
        let cached = router.cached_resolutions();
        let second = router.resolve_module("old").unwrap();
        assert_eq!(first, second);
        assert_eq!(router.cached_resolutions(), cached);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let router = router_with(&[
            ("loop", ModuleRouting::redirect("loop")),
            (
                "gone",
                ModuleRouting {
                    tombstone: Some(Deprecation::default()),
                    ..Default::default()
                },
            ),
        ]);
        assert!(matches!(
            router.resolve_module("loop"),
            Err(RouterError::SelfRedirect { .. })
        ));
        assert!(matches!(
            router.resolve_module("gone"),
            Err(RouterError::Removed { .. })
        ));
        assert!(matches!(
            router.resolve_module("  "),
            Err(RouterError::EmptyName(PluginType::Modules))
        ));
        assert_eq!(router.cached_resolutions(), 0);
        // Same error again on retry.
        assert!(router.resolve_module("loop").is_err());
    }

    #[test]
    fn test_reload_clears_cache() {
        let router = router_with(&[("old", ModuleRouting::redirect("new"))]);
        assert_eq!(router.resolve_module("old").unwrap(), "new");

        let mut config = RuntimeConfig::default();
        config.insert(PluginType::Modules, "old", ModuleRouting::redirect("newer"));
        router.load_config(config);

        assert_eq!(router.cached_resolutions(), 0);
        assert_eq!(router.resolve_module("old").unwrap(), "newer");
    }

    #[test]
    fn test_resolve_plugin_per_category() {
        let mut config = RuntimeConfig::default();
        config.insert(PluginType::Connection, "paramiko", ModuleRouting::redirect("ssh"));
        let router = Router::with_config(config);

        assert_eq!(
            router.resolve_plugin(PluginType::Connection, "paramiko").unwrap(),
            "ssh"
        );
        // Modules are a separate namespace.
        assert_eq!(router.resolve_module("paramiko").unwrap(), "paramiko");
    }

    #[test]
    fn test_deprecation_from_entry_or_target() {
        let router = router_with(&[
            ("old", ModuleRouting::default().deprecated("old is going away")),
            ("alias", ModuleRouting::redirect("legacy")),
            ("legacy", ModuleRouting::default().deprecated("")),
        ]);

        assert_eq!(router.module_deprecation("old").unwrap(), "old is going away");
        assert_eq!(
            router.module_deprecation("alias").unwrap(),
            "module 'legacy' is deprecated"
        );
        assert!(router.is_module_deprecated("legacy").0);
        assert_eq!(router.is_module_deprecated("unknown"), (false, String::new()));
    }

    #[test]
    fn test_action_plugin_lookup() {
        let router = router_with(&[
            ("copy", ModuleRouting::default().with_action_plugin("copy_action")),
            ("cp", ModuleRouting::redirect("copy")),
            ("plain", ModuleRouting::default()),
        ]);
        assert_eq!(router.get_module_action_plugin("copy").as_deref(), Some("copy_action"));
        assert_eq!(router.get_module_action_plugin("cp").as_deref(), Some("copy_action"));
        assert_eq!(router.get_module_action_plugin("plain"), None);
        assert_eq!(router.get_module_action_plugin("missing"), None);
    }

    #[test]
    fn test_action_groups() {
        let mut config = RuntimeConfig::default();
        config
            .action_groups
            .insert("cloud".into(), vec!["ec2".into(), "s3".into()]);
        let router = Router::with_config(config);

        assert!(router.is_module_in_action_group("s3", "cloud"));
        assert!(!router.is_module_in_action_group("copy", "cloud"));
        assert!(!router.is_module_in_action_group("s3", "missing"));
    }

    #[test]
    fn test_validate_detects_cycle() {
        let router = router_with(&[
            ("a", ModuleRouting::redirect("b")),
            ("b", ModuleRouting::redirect("a")),
        ]);
        let err = router.validate_config().unwrap_err();
        match &err {
            RouterError::CircularRedirect { chain, .. } => {
                assert_eq!(chain, &vec!["a".to_string(), "b".into(), "a".into()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_validate_accepts_chain() {
        let router = router_with(&[
            ("a", ModuleRouting::redirect("b")),
            ("b", ModuleRouting::redirect("c")),
            ("d", ModuleRouting::redirect("b")),
        ]);
        assert!(router.validate_config().is_ok());
    }

    #[test]
    fn test_validate_checks_all_categories() {
        let mut config = RuntimeConfig::default();
        config.insert(PluginType::Lookup, "x", ModuleRouting::redirect("y"));
        config.insert(PluginType::Lookup, "y", ModuleRouting::redirect("z"));
        config.insert(PluginType::Lookup, "z", ModuleRouting::redirect("x"));
        let router = Router::with_config(config);

        assert!(matches!(
            router.validate_config(),
            Err(RouterError::CircularRedirect {
                plugin_type: PluginType::Lookup,
                ..
            })
        ));
    }

    #[test]
    fn test_load_config_from_map() {
        let map = json!({
            "plugin_routing": {
                "modules": {
                    "old": { "redirect": "new", "deprecation": { "warning_text": "use new" } }
                },
                "become": {
                    "enable": { "redirect": "sudo" }
                }
            },
            "action_groups": { "net": ["ios_command"] }
        });
        let router = Router::new();
        router
            .load_config_from_map(map.as_object().cloned().unwrap())
            .unwrap();

        assert_eq!(router.resolve_module("old").unwrap(), "new");
        assert_eq!(
            router.resolve_plugin(PluginType::Become, "enable").unwrap(),
            "sudo"
        );
        assert!(router.is_module_in_action_group("ios_command", "net"));
    }

    #[test]
    fn test_load_config_from_map_rejects_bad_shape() {
        let map = json!({ "plugin_routing": { "modules": { "old": { "redirect": 42 } } } });
        let router = Router::new();
        assert!(matches!(
            router.load_config_from_map(map.as_object().cloned().unwrap()),
            Err(RouterError::Json(_))
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.yml");
        std::fs::write(
            &path,
            "plugin_routing:\n  modules:\n    old:\n      redirect: new\n",
        )
        .unwrap();

        let router = Router::new();
        router.load_config_from_file(&path).unwrap();
        assert_eq!(router.resolve_module("old").unwrap(), "new");

        assert!(matches!(
            router.load_config_from_file(dir.path().join("missing.yml")),
            Err(RouterError::Io { .. })
        ));
    }
}
