//! Routing table parsing (runtime.yml)
//!
//! Handles parsing of the routing file that maps requested plugin names to
//! their implementations, including redirects, deprecations, removals and
//! action groups.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::{RouterError, RouterResult};

/// Plugin categories that carry routing entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Task modules
    #[serde(alias = "module")]
    Modules,
    /// Connection plugins
    Connection,
    /// Action plugins
    Action,
    /// Become plugins
    Become,
    /// Cache plugins
    Cache,
    /// Callback plugins
    Callback,
    /// CLI configuration plugins
    Cliconf,
    /// Template filters
    Filter,
    /// HTTP API plugins
    Httpapi,
    /// Inventory plugins
    Inventory,
    /// Lookup plugins
    Lookup,
    /// NETCONF plugins
    Netconf,
    /// Shell plugins
    Shell,
    /// Strategy plugins
    Strategy,
    /// Terminal plugins
    Terminal,
    /// Template tests
    Test,
    /// Vars plugins
    Vars,
}

impl PluginType {
    /// Every category, in table order
    pub const ALL: [PluginType; 17] = [
        PluginType::Modules,
        PluginType::Connection,
        PluginType::Action,
        PluginType::Become,
        PluginType::Cache,
        PluginType::Callback,
        PluginType::Cliconf,
        PluginType::Filter,
        PluginType::Httpapi,
        PluginType::Inventory,
        PluginType::Lookup,
        PluginType::Netconf,
        PluginType::Shell,
        PluginType::Strategy,
        PluginType::Terminal,
        PluginType::Test,
        PluginType::Vars,
    ];

    /// Category key as written in routing files
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Modules => "modules",
            PluginType::Connection => "connection",
            PluginType::Action => "action",
            PluginType::Become => "become",
            PluginType::Cache => "cache",
            PluginType::Callback => "callback",
            PluginType::Cliconf => "cliconf",
            PluginType::Filter => "filter",
            PluginType::Httpapi => "httpapi",
            PluginType::Inventory => "inventory",
            PluginType::Lookup => "lookup",
            PluginType::Netconf => "netconf",
            PluginType::Shell => "shell",
            PluginType::Strategy => "strategy",
            PluginType::Terminal => "terminal",
            PluginType::Test => "test",
            PluginType::Vars => "vars",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        if key == "module" {
            return Ok(PluginType::Modules);
        }
        PluginType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == key)
            .ok_or_else(|| RouterError::UnknownPluginType(s.to_string()))
    }
}

/// Routing table loaded wholesale into the router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Required engine version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_ansible: Option<String>,

    /// Routing entries by category, then by plugin name
    #[serde(default)]
    pub plugin_routing: HashMap<PluginType, HashMap<String, ModuleRouting>>,

    /// Named groups of module names
    #[serde(default)]
    pub action_groups: HashMap<String, Vec<String>>,
}

impl RuntimeConfig {
    /// Load from a YAML (or JSON) file
    pub fn from_file(path: impl AsRef<Path>) -> RouterResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RouterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse from a YAML string
    pub fn from_yaml(yaml: &str) -> RouterResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Normalize a generic key/value map through the typed form
    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> RouterResult<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(map))?)
    }

    /// Check if any routing is defined
    pub fn has_routing(&self) -> bool {
        self.plugin_routing.values().any(|entries| !entries.is_empty())
    }

    /// Routing entries for one category
    pub fn entries(&self, plugin_type: PluginType) -> Option<&HashMap<String, ModuleRouting>> {
        self.plugin_routing.get(&plugin_type)
    }

    /// Routing entry for a specific plugin
    pub fn get(&self, plugin_type: PluginType, name: &str) -> Option<&ModuleRouting> {
        self.entries(plugin_type).and_then(|entries| entries.get(name))
    }

    /// Routing entry for a specific module
    pub fn get_module_routing(&self, name: &str) -> Option<&ModuleRouting> {
        self.get(PluginType::Modules, name)
    }

    /// Add or replace a routing entry
    pub fn insert(&mut self, plugin_type: PluginType, name: impl Into<String>, entry: ModuleRouting) {
        self.plugin_routing
            .entry(plugin_type)
            .or_default()
            .insert(name.into(), entry);
    }
}

/// A single routing entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleRouting {
    /// Name of the implementation to use instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,

    /// Deprecation marker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation: Option<Deprecation>,

    /// The plugin was removed; resolution fails
    #[serde(alias = "removal", skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Deprecation>,

    /// Entry-level warning, used when the marker carries none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_text: Option<String>,

    /// Action plugin that runs this module
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_plugin: Option<String>,
}

impl ModuleRouting {
    /// Entry that redirects to `target`
    pub fn redirect(target: impl Into<String>) -> Self {
        Self {
            redirect: Some(target.into()),
            ..Default::default()
        }
    }

    /// Mark the entry deprecated
    pub fn deprecated(mut self, warning_text: impl Into<String>) -> Self {
        self.deprecation = Some(Deprecation {
            warning_text: Some(warning_text.into()),
            ..Default::default()
        });
        self
    }

    /// Set the action plugin override
    pub fn with_action_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.action_plugin = Some(plugin.into());
        self
    }

    /// Check if this is a redirect
    pub fn is_redirect(&self) -> bool {
        self.redirect.is_some()
    }

    /// Check if this is deprecated
    pub fn is_deprecated(&self) -> bool {
        self.deprecation.is_some()
    }

    /// Check if this is a tombstone
    pub fn is_tombstone(&self) -> bool {
        self.tombstone.is_some()
    }

    /// Deprecation warning, synthesized when the entry carries no text
    pub fn deprecation_warning(&self, plugin_type: PluginType, name: &str) -> Option<String> {
        let marker = self.deprecation.as_ref()?;
        Some(self.describe(marker, "is deprecated", plugin_type, name))
    }

    /// Removal message when the entry is a tombstone
    pub fn removal_message(&self, plugin_type: PluginType, name: &str) -> Option<String> {
        let marker = self.tombstone.as_ref()?;
        Some(self.describe(marker, "has been removed", plugin_type, name))
    }

    fn describe(&self, marker: &Deprecation, kind: &str, plugin_type: PluginType, name: &str) -> String {
        let explicit = marker
            .warning_text
            .as_deref()
            .or(self.warning_text.as_deref())
            .filter(|t| !t.trim().is_empty());
        if let Some(text) = explicit {
            return text.to_string();
        }

        let mut text = format!("{} '{}' {}", singular(plugin_type), name, kind);
        if let Some(version) = &marker.removal_version {
            text.push_str(&format!(" (removal in version {})", version));
        } else if let Some(date) = &marker.removal_date {
            text.push_str(&format!(" (removal after {})", date));
        }
        if let Some(target) = &self.redirect {
            text.push_str(&format!("; use '{}' instead", target));
        }
        text
    }
}

fn singular(plugin_type: PluginType) -> &'static str {
    match plugin_type {
        PluginType::Modules => "module",
        other => other.as_str(),
    }
}

/// Deprecation or removal information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deprecation {
    /// Warning message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_text: Option<String>,

    /// Version in which the plugin is (or was) removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal_version: Option<String>,

    /// Date after which the plugin is removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal_date: Option<String>,
}
