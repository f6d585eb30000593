//! Template resolution: in-run local templates first, then the cached
//! remote store.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use weft_contract::error::AgentError;
use weft_contract::identifier::{AgentIdentifier, IdentifierError};
use weft_contract::ports::TemplateStore;
use weft_contract::template::AgentTemplate;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("agent id conflict: '{0}' is already registered")]
    TemplateConflict(String),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error("template store error: {0}")]
    Store(AgentError),
}

/// Local templates plus a cache over the remote store.
pub struct TemplateRegistry {
    local: HashMap<String, Arc<AgentTemplate>>,
    store: Option<Arc<dyn TemplateStore>>,
    /// Keyed by normalized identifier; single writer via the async mutex.
    cache: tokio::sync::Mutex<HashMap<String, Arc<AgentTemplate>>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            local: HashMap::new(),
            store: None,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TemplateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register(&mut self, template: AgentTemplate) -> Result<(), RegistryError> {
        let id = template.id.clone();
        if self.local.contains_key(&id) {
            return Err(RegistryError::TemplateConflict(id));
        }
        self.local.insert(id, Arc::new(template));
        Ok(())
    }

    pub fn local_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.local.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve `[publisher/]id[@version]` to a template.
    pub async fn resolve(&self, identifier: &str) -> Result<Arc<AgentTemplate>, RegistryError> {
        let parsed = AgentIdentifier::parse(identifier)?;

        if let Some(template) = self
            .local
            .get(identifier)
            .or_else(|| self.local.get(&parsed.id))
        {
            return Ok(template.clone());
        }

        let key = parsed.to_string();
        {
            let cache = self.cache.lock().await;
            if let Some(template) = cache.get(&key) {
                return Ok(template.clone());
            }
        }

        if let Some(store) = &self.store {
            if let Some(template) = store.fetch(&parsed).await.map_err(RegistryError::Store)? {
                let template = Arc::new(template);
                self.cache.lock().await.insert(key, template.clone());
                return Ok(template);
            }
        }

        Err(RegistryError::UnknownAgent(identifier.to_string()))
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("local", &self.local.len())
            .field("store", &self.store.as_ref().map(|_| "<port>"))
            .finish()
    }
}
