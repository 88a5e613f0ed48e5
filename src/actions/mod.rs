//! Executable actions and the registry that resolves job action tags.

pub mod health;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// Something a job can run.
///
/// `args` is the job's JSON argument object. The returned value is stored as
/// the run record's output payload; keep it small.
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, args: &Value) -> Result<Value>;
}

/// Maps action tags (e.g. `health_check:jenkins`) to implementations.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a health check for every configured target.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (system, target) in &config.targets {
            let check = health::HttpHealthCheck::new(system, &target.health_url(system))?;
            registry.register(health::tag(system), check);
        }
        info!(actions = ?registry.tags(), "Action registry ready");
        Ok(registry)
    }

    /// Register (or replace) the implementation for `tag`.
    pub fn register(&mut self, tag: impl Into<String>, action: impl Action + 'static) -> &mut Self {
        self.actions.insert(tag.into(), Arc::new(action));
        self
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn Action>, SchedulerError> {
        self.actions
            .get(tag)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownAction(tag.to_string()))
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.actions.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
