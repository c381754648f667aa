//! Agent registry: resolves intents to callable agents.
//!
//! Agents are blocking. The executor runs every call on a dedicated worker
//! thread, so an implementation may do synchronous I/O freely.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AgentError, RegistryError};
use crate::params::{ParamSpec, Params};
use crate::report::StructuredReport;

/// Read-only data shared with every call in a batch.
///
/// Cloning is cheap and never copies the underlying map; agents only ever
/// get a shared reference.
#[derive(Debug, Clone, Default)]
pub struct PrefetchCache {
    entries: Arc<BTreeMap<String, serde_json::Value>>,
}

impl PrefetchCache {
    pub fn new(entries: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An independently addressable computation unit.
pub trait Agent: Send + Sync {
    /// Stable agent name used in traces and reproducibility records.
    fn name(&self) -> &str;

    /// Invoke `method` with `params`. Any error fails this call only.
    fn call(
        &self,
        method: &str,
        params: &Params,
        prefetch: &PrefetchCache,
    ) -> Result<StructuredReport, AgentError>;
}

/// What an intent resolves to.
#[derive(Clone)]
pub struct Resolution {
    pub agent: Arc<dyn Agent>,
    /// Canonical method name for the intent.
    pub method: String,
    /// Declared parameters of the method.
    pub params: Vec<ParamSpec>,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("agent", &self.agent.name())
            .field("method", &self.method)
            .field("params", &self.params)
            .finish()
    }
}

/// Resolves intent strings to agents.
pub trait AgentRegistry: Send + Sync {
    fn resolve(&self, intent: &str) -> Result<Resolution, RegistryError>;
}

/// Registry backed by an in-memory map.
#[derive(Default, Clone)]
pub struct InMemoryRegistry {
    entries: BTreeMap<String, Resolution>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `intent`. Rejects an intent that is already registered.
    pub fn register(
        &mut self,
        intent: impl Into<String>,
        agent: Arc<dyn Agent>,
        method: impl Into<String>,
        params: Vec<ParamSpec>,
    ) -> Result<(), RegistryError> {
        let intent = intent.into();
        if self.entries.contains_key(&intent) {
            return Err(RegistryError::DuplicateIntent { intent });
        }
        self.entries.insert(
            intent,
            Resolution {
                agent,
                method: method.into(),
                params,
            },
        );
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(
        mut self,
        intent: impl Into<String>,
        agent: Arc<dyn Agent>,
        method: impl Into<String>,
        params: Vec<ParamSpec>,
    ) -> Result<Self, RegistryError> {
        self.register(intent, agent, method, params)?;
        Ok(self)
    }

    /// Registered intents in sorted order.
    pub fn intents(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl AgentRegistry for InMemoryRegistry {
    fn resolve(&self, intent: &str) -> Result<Resolution, RegistryError> {
        self.entries
            .get(intent)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownIntent {
                intent: intent.to_string(),
                known: self.intents(),
            })
    }
}

impl fmt::Debug for InMemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRegistry")
            .field("intents", &self.intents())
            .finish()
    }
}
