use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use conflux_core::config::ProviderConfig;
use conflux_core::error::{ConfluxError, Result};
use conflux_core::graph::ModelSettings;
use conflux_core::traits::{ModelClient, ModelProvider};

use crate::create_client;

/// Resolves model settings to clients for the providers named in config.
///
/// Clients are built lazily and cached per provider name so the
/// underlying HTTP connection pool is shared by every node using it.
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
    clients: Mutex<HashMap<String, Arc<dyn ModelClient>>>,
}

impl ProviderRegistry {
    pub fn new(providers: HashMap<String, ProviderConfig>) -> Self {
        info!(count = providers.len(), "Model providers configured");
        Self {
            providers,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ModelProvider for ProviderRegistry {
    fn client_for(
        &self,
        project: Option<&str>,
        settings: &ModelSettings,
    ) -> Result<Arc<dyn ModelClient>> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| ConfluxError::Config("provider cache poisoned".into()))?;
        if let Some(client) = clients.get(&settings.provider) {
            return Ok(client.clone());
        }

        let config = self
            .providers
            .get(&settings.provider)
            .ok_or_else(|| ConfluxError::ProviderNotConfigured(settings.provider.clone()))?;
        debug!(
            provider = %settings.provider,
            kind = ?config.kind,
            project = project.unwrap_or("-"),
            "Creating model client"
        );
        let client = create_client(config)?;
        clients.insert(settings.provider.clone(), client.clone());
        Ok(client)
    }
}
