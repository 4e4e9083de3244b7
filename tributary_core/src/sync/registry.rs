use crate::models::ProviderId;
use crate::sync::models::ProviderDefinition;
use crate::sync::traits::ProviderAdapter;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable provider id -> adapter lookup, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn get(&self, provider: ProviderId) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("provider '{provider}' is not registered")))
    }

    pub fn definition(&self, provider: ProviderId) -> Option<&ProviderDefinition> {
        self.adapters.get(&provider).map(|a| a.definition())
    }

    /// All definitions, ordered by provider id.
    pub fn definitions(&self) -> Vec<&ProviderDefinition> {
        self.adapters.values().map(|a| a.definition()).collect()
    }

    pub fn contains(&self, provider: ProviderId) -> bool {
        self.adapters.contains_key(&provider)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[derive(Default)]
pub struct ProviderRegistryBuilder {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistryBuilder {
    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Fails on duplicate provider ids or a definition whose id disagrees with the adapter.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn build(self) -> Result<ProviderRegistry> {
        let mut adapters = BTreeMap::new();
        for adapter in self.adapters {
            let id = adapter.id();
            if adapter.definition().id != id {
                return Err(Error::InvalidInput(format!(
                    "adapter for '{id}' publishes definition for '{}'",
                    adapter.definition().id
                )));
            }
            if adapters.insert(id, adapter).is_some() {
                return Err(Error::Conflict(format!(
                    "provider '{id}' registered more than once"
                )));
            }
        }
        tracing::debug!(providers = adapters.len(), "provider registry built");
        Ok(ProviderRegistry { adapters })
    }
}
