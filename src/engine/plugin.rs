//! Plugin contract and registry.
//!
//! A plugin bundles registrations (methods, middleware) behind one name.
//! Plugins are installed at most once, only after everything they depend on,
//! and cannot be removed while another installed plugin depends on them.

use std::sync::Arc;

use parking_lot::RwLock;

use super::Engine;
use crate::error::{Error, Result};

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Names of plugins that must be installed first
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn install(&self, engine: &Engine) -> Result<()>;

    fn uninstall(&self, _engine: &Engine) -> Result<()> {
        Ok(())
    }
}

/// Installed plugins in installation order
#[derive(Default)]
pub struct PluginRegistry {
    installed: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("installed", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.read().iter().any(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.installed
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Fail unless every dependency of `plugin` is installed
    pub fn check_dependencies(&self, plugin: &dyn Plugin) -> Result<()> {
        for dependency in plugin.dependencies() {
            if !self.is_installed(&dependency) {
                return Err(Error::PluginDependency {
                    plugin: plugin.name().to_string(),
                    dependency,
                });
            }
        }
        Ok(())
    }

    /// First installed plugin that depends on `name`
    pub fn dependent_of(&self, name: &str) -> Option<String> {
        self.installed
            .read()
            .iter()
            .find(|p| p.dependencies().iter().any(|d| d == name))
            .map(|p| p.name().to_string())
    }

    pub(crate) fn add(&self, plugin: Arc<dyn Plugin>) {
        self.installed.write().push(plugin);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.installed
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let mut installed = self.installed.write();
        let pos = installed.iter().position(|p| p.name() == name)?;
        Some(installed.remove(pos))
    }

    /// Remove every plugin, most recently installed first
    pub(crate) fn drain(&self) -> Vec<Arc<dyn Plugin>> {
        let mut drained: Vec<_> = self.installed.write().drain(..).collect();
        drained.reverse();
        drained
    }
}
