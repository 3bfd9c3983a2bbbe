use crate::error::{NotifyError, Result};
use crate::NotificationChannel;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory for [`NotificationChannel`]s built from receiver integrations.
///
/// Each plugin is registered in the [`ChannelRegistry`] by its `name()`.
/// When a backend applies a configuration, the registry validates and
/// instantiates every integration through the matching plugin.
pub trait ChannelPlugin: Send + Sync {
    /// Integration type name, e.g. `"webhook"`.
    fn name(&self) -> &str;

    /// Validates the integration's settings blob.
    fn validate_config(&self, config: &Value) -> Result<()>;

    /// Creates a channel for `receiver` from validated settings.
    fn create_channel(&self, receiver: &str, config: &Value) -> Result<Arc<dyn NotificationChannel>>;
}

/// Registry of available [`ChannelPlugin`]s.
///
/// # Examples
///
/// ```
/// use oxalert_notify::plugin::ChannelRegistry;
///
/// let registry = ChannelRegistry::default();
/// assert!(registry.has_plugin("webhook"));
/// assert!(registry.has_plugin("log"));
/// assert!(!registry.has_plugin("nonexistent"));
/// ```
pub struct ChannelRegistry {
    plugins: HashMap<String, Box<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        let name = plugin.name().to_string();
        self.plugins.insert(name, plugin);
    }

    pub fn create_channel(
        &self,
        type_name: &str,
        receiver: &str,
        config: &Value,
    ) -> Result<Arc<dyn NotificationChannel>> {
        let plugin = self
            .plugins
            .get(type_name)
            .ok_or_else(|| NotifyError::UnknownChannelType(type_name.to_string()))?;
        plugin.validate_config(config)?;
        plugin.create_channel(receiver, config)
    }

    pub fn has_plugin(&self, type_name: &str) -> bool {
        self.plugins.contains_key(type_name)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::channels::webhook::WebhookPlugin));
        registry.register(Box::new(crate::channels::log::LogPlugin));
        registry
    }
}
