//! Configuration surface consumed by the tracing engine.
//!
//! The engine reads general, advanced and per-plugin config through
//! [`ConfigService`] and reacts to mutations through [`ConfigListener`];
//! config file parsing lives outside the engine. [`InMemoryConfigService`]
//! is the embedding and test vehicle.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Engine-wide enablement and trace-store policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub enabled: bool,
    /// Completed traces at or above this duration are stored in full.
    pub trace_store_threshold_millis: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trace_store_threshold_millis: 1_000,
        }
    }
}

/// Caps and probe switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedConfig {
    pub max_trace_entries_per_transaction: usize,
    pub capture_thread_info: bool,
    pub capture_gc_info: bool,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            max_trace_entries_per_transaction: 2_000,
            capture_thread_info: true,
            capture_gc_info: true,
        }
    }
}

/// A typed plugin property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Double(f64),
    String(String),
}

/// Per-plugin enablement and properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: String,
    pub enabled: bool,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl PluginConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Value of a string property; empty when absent or of another type.
    pub fn string_property(&self, name: &str) -> String {
        match self.properties.get(name) {
            Some(PropertyValue::String(value)) => value.clone(),
            _ => String::new(),
        }
    }

    /// Value of a boolean property; false when absent or of another type.
    pub fn boolean_property(&self, name: &str) -> bool {
        matches!(self.properties.get(name), Some(PropertyValue::Bool(true)))
    }

    /// Value of a double property; `None` when absent or of another type.
    pub fn double_property(&self, name: &str) -> Option<f64> {
        match self.properties.get(name) {
            Some(PropertyValue::Double(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Notified synchronously after any mutation of the watched config.
pub trait ConfigListener: Send + Sync {
    fn on_change(&self);
}

/// Read surface the engine consumes.
pub trait ConfigService: Send + Sync {
    fn general_config(&self) -> GeneralConfig;
    fn advanced_config(&self) -> AdvancedConfig;
    fn plugin_config(&self, plugin_id: &str) -> Option<Arc<PluginConfig>>;
    fn add_config_listener(&self, listener: Arc<dyn ConfigListener>);
    fn add_plugin_config_listener(&self, plugin_id: &str, listener: Arc<dyn ConfigListener>);
}

/// In-memory [`ConfigService`] with typed update operations that fire
/// listeners synchronously on every mutation.
#[derive(Default)]
pub struct InMemoryConfigService {
    general: RwLock<GeneralConfig>,
    advanced: RwLock<AdvancedConfig>,
    plugins: RwLock<HashMap<String, Arc<PluginConfig>>>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
    plugin_listeners: RwLock<HashMap<String, Vec<Arc<dyn ConfigListener>>>>,
}

impl InMemoryConfigService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugins(plugins: impl IntoIterator<Item = PluginConfig>) -> Self {
        let service = Self::default();
        {
            let mut map = service.plugins.write();
            for plugin in plugins {
                map.insert(plugin.id.clone(), Arc::new(plugin));
            }
        }
        service
    }

    pub fn update_general_config(&self, config: GeneralConfig) {
        *self.general.write() = config;
        self.notify_listeners();
    }

    pub fn update_advanced_config(&self, config: AdvancedConfig) {
        *self.advanced.write() = config;
        self.notify_listeners();
    }

    pub fn update_plugin_config(&self, config: PluginConfig) {
        let plugin_id = config.id.clone();
        self.plugins
            .write()
            .insert(plugin_id.clone(), Arc::new(config));
        self.notify_listeners();
        self.notify_plugin_listeners(&plugin_id);
    }

    // Listener lists are cloned out before invocation so a callback can
    // register further listeners without deadlocking.
    fn notify_listeners(&self) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_change();
        }
    }

    fn notify_plugin_listeners(&self, plugin_id: &str) {
        let listeners: Vec<_> = self
            .plugin_listeners
            .read()
            .get(plugin_id)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener.on_change();
        }
    }
}

impl ConfigService for InMemoryConfigService {
    fn general_config(&self) -> GeneralConfig {
        self.general.read().clone()
    }

    fn advanced_config(&self) -> AdvancedConfig {
        self.advanced.read().clone()
    }

    fn plugin_config(&self, plugin_id: &str) -> Option<Arc<PluginConfig>> {
        self.plugins.read().get(plugin_id).cloned()
    }

    fn add_config_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.write().push(listener);
    }

    fn add_plugin_config_listener(&self, plugin_id: &str, listener: Arc<dyn ConfigListener>) {
        self.plugin_listeners
            .write()
            .entry(plugin_id.to_string())
            .or_default()
            .push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(AtomicUsize);

    impl ConfigListener for CountingListener {
        fn on_change(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_default_config() {
        let general = GeneralConfig::default();
        assert!(general.enabled);
        let advanced = AdvancedConfig::default();
        assert!(advanced.max_trace_entries_per_transaction > 0);
    }

    #[test]
    fn test_plugin_property_getters() {
        let plugin = PluginConfig::new("jdbc")
            .with_property("capture_statements", PropertyValue::Bool(true))
            .with_property("prefix", PropertyValue::String("db:".to_string()))
            .with_property("slow_millis", PropertyValue::Double(250.0));
        assert!(plugin.boolean_property("capture_statements"));
        assert_eq!(plugin.string_property("prefix"), "db:");
        assert_eq!(plugin.double_property("slow_millis"), Some(250.0));
        // absent or mistyped -> defaults
        assert_eq!(plugin.string_property("missing"), "");
        assert!(!plugin.boolean_property("prefix"));
        assert_eq!(plugin.double_property("capture_statements"), None);
    }

    #[test]
    fn test_listeners_fire_on_every_mutation() {
        let service = InMemoryConfigService::new();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        service.add_config_listener(listener.clone());
        service.update_general_config(GeneralConfig {
            enabled: false,
            ..Default::default()
        });
        service.update_advanced_config(AdvancedConfig::default());
        assert_eq!(listener.0.load(Ordering::Relaxed), 2);
        assert!(!service.general_config().enabled);
    }

    #[test]
    fn test_plugin_listener_scoped_to_plugin() {
        let service = InMemoryConfigService::with_plugins([PluginConfig::new("jdbc")]);
        let jdbc = Arc::new(CountingListener(AtomicUsize::new(0)));
        let http = Arc::new(CountingListener(AtomicUsize::new(0)));
        service.add_plugin_config_listener("jdbc", jdbc.clone());
        service.add_plugin_config_listener("http", http.clone());
        service.update_plugin_config(PluginConfig::new("jdbc"));
        assert_eq!(jdbc.0.load(Ordering::Relaxed), 1);
        assert_eq!(http.0.load(Ordering::Relaxed), 0);
    }
}
