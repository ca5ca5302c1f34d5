use std::collections::HashSet;

use anyhow::{anyhow, Result};
use log::info;
use parking_lot::Mutex;

use crate::model::{GithubId, Id, Instance};

/// Instance change notifications for connected clients.
#[async_trait::async_trait]
pub trait InstanceEvents: Send + Sync {
    async fn emit_update(&self, instance: &Instance, actor: GithubId, action: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogInstanceEvents;

#[async_trait::async_trait]
impl InstanceEvents for LogInstanceEvents {
    async fn emit_update(&self, instance: &Instance, actor: GithubId, action: &str) -> Result<()> {
        info!(target: "instance_events", "instance {} {} by {}", instance.id, action, actor);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedUpdate {
    pub instance_id: Id,
    pub actor: GithubId,
    pub action: String,
}

/// Records emitted updates; can be told to fail for specific instances.
#[derive(Debug, Default)]
pub struct MemoryInstanceEvents {
    emitted: Mutex<Vec<EmittedUpdate>>,
    failing: Mutex<HashSet<Id>>,
}

impl MemoryInstanceEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, instance_id: &Id) {
        self.failing.lock().insert(instance_id.clone());
    }

    pub fn emitted(&self) -> Vec<EmittedUpdate> {
        self.emitted.lock().clone()
    }
}

#[async_trait::async_trait]
impl InstanceEvents for MemoryInstanceEvents {
    async fn emit_update(&self, instance: &Instance, actor: GithubId, action: &str) -> Result<()> {
        if self.failing.lock().contains(&instance.id) {
            return Err(anyhow!("socket closed for instance {}", instance.id));
        }
        self.emitted.lock().push(EmittedUpdate {
            instance_id: instance.id.clone(),
            actor,
            action: action.to_string(),
        });
        Ok(())
    }
}
