use anyhow::Result;

use crate::model::{Owner, User};

#[async_trait::async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Actor is the owner or belongs to the owning organization.
    async fn is_owner_of(&self, actor: &User, owner: &Owner) -> Result<bool>;
    /// Owners plus moderators.
    async fn has_model_access(&self, actor: &User, owner: &Owner) -> Result<bool>;
}

/// Decides from the actor record alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerPermissions;

#[async_trait::async_trait]
impl PermissionChecker for OwnerPermissions {
    async fn is_owner_of(&self, actor: &User, owner: &Owner) -> Result<bool> {
        Ok(actor.github_id == owner.github || actor.is_member_of(owner.github))
    }

    async fn has_model_access(&self, actor: &User, owner: &Owner) -> Result<bool> {
        Ok(actor.moderator || self.is_owner_of(actor, owner).await?)
    }
}
