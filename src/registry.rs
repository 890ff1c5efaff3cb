use std::{
    collections::BTreeMap,
    sync::Arc,
};

use crate::{
    backend::BackendFactory,
    error::{
        LaunchError,
        Result,
    },
    plugins::PluginFactory,
};

/// Name → factory table. Filled once at startup, read-only afterwards.
pub struct Registry<F: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Arc<F>>,
}

impl<F: ?Sized> Registry<F> {
    pub fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, key: &str, factory: Arc<F>) -> Result<()> {
        if self.entries.contains_key(key) {
            return Err(LaunchError::DuplicateKey {
                kind: self.kind,
                key: key.to_string(),
            });
        }
        self.entries.insert(key.to_string(), factory);
        Ok(())
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<F>> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| LaunchError::NotFound {
                kind: self.kind,
                key: key.to_string(),
                known: self.keys(),
            })
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

// the two tables consulted while launching
pub struct Registries {
    pub backends: Registry<dyn BackendFactory>,
    pub plugins: Registry<dyn PluginFactory>,
}

impl Registries {
    pub fn empty() -> Self {
        Registries {
            backends: Registry::new("backend"),
            plugins: Registry::new("plugin"),
        }
    }

    // everything this build ships with
    pub fn builtin() -> Result<Self> {
        let mut registries = Registries::empty();
        registries.backends.register(
            crate::backend::gcp::BACKEND_NAME,
            Arc::new(crate::backend::gcp::GoogleBatchFactory),
        )?;
        registries.plugins.register(
            crate::plugins::oncoanalyser::PLUGIN_NAME,
            Arc::new(crate::plugins::oncoanalyser::OncoanalyserFactory),
        )?;
        Ok(registries)
    }
}
