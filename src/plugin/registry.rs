//! Name → factory table for frame processor plugins

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{debug, error, info};

use super::{FrameProcessorPlugin, Options, PluginError};

/// Constructs a plugin instance from its options
pub type PluginFactory =
    Arc<dyn Fn(&Options) -> Result<Box<dyn FrameProcessorPlugin>, PluginError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a frame processor plugin named \"{0}\" is already registered")]
    DuplicateName(String),
}

static GLOBAL: Lazy<Arc<PluginRegistry>> = Lazy::new(|| Arc::new(PluginRegistry::new()));

/// Plugin table with lock-free lookups.
///
/// Registration copies the table and swaps it in; concurrent registrations
/// are serialized so a duplicate can never slip through.
pub struct PluginRegistry {
    plugins: ArcSwap<HashMap<String, PluginFactory>>,
    writer: Mutex<()>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// The process-wide registry populated at startup
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    pub fn register<F, P>(&self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&Options) -> Result<P, PluginError> + Send + Sync + 'static,
        P: FrameProcessorPlugin + 'static,
    {
        let factory: PluginFactory = Arc::new(move |options: &Options| {
            factory(options).map(|plugin| Box::new(plugin) as Box<dyn FrameProcessorPlugin>)
        });
        self.register_factory(name, factory)
    }

    pub fn register_factory(
        &self,
        name: impl Into<String>,
        factory: PluginFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.plugins.load();
        if current.contains_key(&name) {
            error!(
                "Tried to add a frame processor plugin with a name that already exists: \"{}\"",
                name
            );
            return Err(RegistryError::DuplicateName(name));
        }

        let mut next = HashMap::clone(&current);
        next.insert(name.clone(), factory);
        self.plugins.store(Arc::new(next));

        info!("Registered frame processor plugin \"{}\"", name);
        Ok(())
    }

    /// Construct the plugin registered under `name`. Unknown names yield
    /// `Ok(None)`; factory errors are returned unchanged.
    pub fn lookup(
        &self,
        name: &str,
        options: &Options,
    ) -> Result<Option<Box<dyn FrameProcessorPlugin>>, PluginError> {
        let Some(factory) = self.plugins.load().get(name).cloned() else {
            debug!("Frame processor plugin \"{}\" does not exist", name);
            return Ok(None);
        };

        debug!("Initializing frame processor plugin \"{}\"", name);
        factory(options).map(Some)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.load().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.load().is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
