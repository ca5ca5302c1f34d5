use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ContextVersion, GithubId, Id, Owner};

/// Separator between an isolation short hash and the instance name it prefixes.
pub const ISOLATION_PREFIX_SEPARATOR: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub stopping: bool,
}

/// Deployable unit bound to one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Id,
    pub name: String,
    pub lower_name: String,
    pub short_hash: String,
    /// Name the elastic hostname is derived from. Forks and isolated copies keep
    /// the name of the instance they were created from.
    pub short_name: String,
    pub owner: Owner,
    pub created_by: Owner,
    pub build: Id,
    pub context_version: ContextVersion,
    /// Short hash of the instance this one was forked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub master_pod: bool,
    #[serde(default)]
    pub auto_forked: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_isolation_group_master: Option<bool>,
    #[serde(default)]
    pub is_testing: bool,
    #[serde(default)]
    pub env: Vec<String>,
    pub elastic_hostname: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerState>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn is_group_master(&self) -> bool {
        self.is_isolation_group_master.unwrap_or(false)
    }

    /// Isolated instance that is not the master of its group.
    pub fn is_isolated_child(&self) -> bool {
        self.isolated.is_some() && !self.is_group_master()
    }

    pub fn is_running_or_stopping(&self) -> bool {
        self.container
            .as_ref()
            .map(|c| c.running || c.stopping)
            .unwrap_or(false)
    }

    pub fn owner_username(&self) -> &str {
        self.owner.username.as_deref().unwrap_or("")
    }

    pub fn as_dependency_node(&self) -> DependencyNode {
        DependencyNode {
            instance_id: self.id.clone(),
            elastic_hostname: self.elastic_hostname.clone(),
            hostname: self.hostname.clone(),
        }
    }
}

/// Body of `InstanceService::create_instance`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewInstance {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    pub owner: Option<Owner>,
    pub build: Id,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub master_pod: bool,
    #[serde(default)]
    pub auto_forked: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_isolation_group_master: Option<bool>,
    #[serde(default)]
    pub is_testing: bool,
}

/// Filter over instance documents. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceQuery {
    pub owner_github: Option<GithubId>,
    /// Lower-cased `org/repo` of any source reference.
    pub repo: Option<String>,
    /// Lower-cased branch; only meaningful together with `repo`.
    pub branch: Option<String>,
    pub master_pod: Option<bool>,
    /// `Some(None)` matches instances outside any isolation.
    pub isolated: Option<Option<Id>>,
    pub is_isolation_group_master: Option<bool>,
    pub is_testing: Option<bool>,
    pub context_version_ids: Option<Vec<Id>>,
}

impl InstanceQuery {
    pub fn tracking(repo: &str, branch: &str) -> Self {
        Self {
            repo: Some(repo.to_lowercase()),
            branch: Some(branch.to_lowercase()),
            ..Self::default()
        }
    }

    pub fn in_isolation(isolation_id: &Id) -> Self {
        Self {
            isolated: Some(Some(isolation_id.clone())),
            ..Self::default()
        }
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(owner) = self.owner_github {
            if instance.owner.github != owner {
                return false;
            }
        }
        if let Some(repo) = &self.repo {
            let tracked = instance
                .context_version
                .app_code_versions
                .iter()
                .any(|acv| {
                    &acv.lower_repo == repo
                        && self
                            .branch
                            .as_ref()
                            .map_or(true, |branch| &acv.lower_branch == branch)
                });
            if !tracked {
                return false;
            }
        }
        if let Some(master_pod) = self.master_pod {
            if instance.master_pod != master_pod {
                return false;
            }
        }
        if let Some(isolated) = &self.isolated {
            if &instance.isolated != isolated {
                return false;
            }
        }
        if let Some(group_master) = self.is_isolation_group_master {
            if instance.is_group_master() != group_master {
                return false;
            }
        }
        if let Some(is_testing) = self.is_testing {
            if instance.is_testing != is_testing {
                return false;
            }
        }
        if let Some(ids) = &self.context_version_ids {
            if !ids.contains(&instance.context_version.id) {
                return false;
            }
        }
        true
    }
}

/// Dependency graph node. Edges are keyed by `elastic_hostname`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyNode {
    pub instance_id: Id,
    pub elastic_hostname: String,
    pub hostname: String,
}

/// `<name>-staging-<owner>.<domain>`, lower-cased.
pub fn staging_hostname(name: &str, owner_username: &str, domain: &str) -> String {
    format!("{}-staging-{}.{}", name, owner_username, domain).to_lowercase()
}

/// Strip a leading `<hash>--` isolation prefix from a name.
pub fn strip_isolation_prefix(name: &str) -> &str {
    match name.split_once(ISOLATION_PREFIX_SEPARATOR) {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => name,
    }
}

fn is_hostname_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
}

/// Hostname-like tokens of an environment value, in order.
pub fn hostname_tokens(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| !is_hostname_char(c))
        .filter(|token| !token.is_empty())
}

/// Rewrite every hostname-like token of `value` for which `map` returns a
/// replacement, leaving separators untouched.
pub fn rewrite_hostnames<F>(value: &str, mut map: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut token = String::new();
    for c in value.chars() {
        if is_hostname_char(c) {
            token.push(c);
            continue;
        }
        flush_token(&mut out, &mut token, &mut map);
        out.push(c);
    }
    flush_token(&mut out, &mut token, &mut map);
    out
}

fn flush_token<F>(out: &mut String, token: &mut String, map: &mut F)
where
    F: FnMut(&str) -> Option<String>,
{
    if token.is_empty() {
        return;
    }
    match map(token) {
        Some(replacement) => out.push_str(&replacement),
        None => out.push_str(token),
    }
    token.clear();
}

/// Split `KEY=VALUE`. Entries without `=` have an empty value.
pub fn split_env(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}
