//! Registry of trust contexts on one device.

use crate::config::OctagonConfig;
use crate::context::TrustContext;
use crate::trust_core::Collaborators;
use octagon_types::{ContainerName, ContextId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type ContextKey = (ContainerName, ContextId);

/// Hands out one [`TrustContext`] per (container, context), created on
/// first use. Contexts share the device's store, service, cloud and lock
/// state but run independent state machines.
pub struct OctagonManager {
    collaborators: Collaborators,
    config: OctagonConfig,
    contexts: Mutex<HashMap<ContextKey, Arc<TrustContext>>>,
}

impl OctagonManager {
    pub fn new(collaborators: Collaborators, config: OctagonConfig) -> Self {
        Self {
            collaborators,
            config,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<ContextKey, Arc<TrustContext>>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The context for (container, context), starting it if needed. Must be
    /// called within a tokio runtime.
    pub fn context(&self, container: &ContainerName, context: &ContextId) -> Arc<TrustContext> {
        let mut contexts = self.contexts();
        let key = (container.clone(), context.clone());
        Arc::clone(contexts.entry(key).or_insert_with(|| {
            debug!(%container, %context, "creating trust context");
            Arc::new(TrustContext::start(
                container.clone(),
                context.clone(),
                self.collaborators.clone(),
                self.config.clone(),
            ))
        }))
    }

    pub fn default_context(&self) -> Arc<TrustContext> {
        self.context(&ContainerName::default(), &ContextId::default())
    }

    /// Contexts started so far, sorted.
    pub fn active_contexts(&self) -> Vec<ContextKey> {
        let mut keys: Vec<ContextKey> = self.contexts().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stops and forgets every context.
    pub fn shutdown(&self) {
        let contexts: Vec<Arc<TrustContext>> =
            self.contexts().drain().map(|(_, context)| context).collect();
        for context in contexts {
            context.shutdown();
        }
    }
}

impl std::fmt::Debug for OctagonManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctagonManager")
            .field("contexts", &self.active_contexts())
            .finish_non_exhaustive()
    }
}
