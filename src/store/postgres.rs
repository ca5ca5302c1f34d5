use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::external::JobQueue;
use crate::model::{
    AutoIsolationConfig, Build, BuildCompletion, BuildContainer, BuildOutcome, ContextVersion, DependencyNode,
    GithubId, Id, Instance, InstanceQuery, Isolation, IsolationState, Job, Organization, Owner,
    User,
};
use crate::store::traits::{
    AutoIsolationConfigStore, BuildClaim, BuildStart, BuildStore, ContextVersionStore,
    GraphStore, InstanceStore, IsolationStore, OrganizationStore, UserStore,
};

/// JSONB document store, dependency graph and job outbox on one pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn to_doc<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context("Failed to serialize document")
}

fn from_doc<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).context("Failed to deserialize document")
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn get_doc<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>> {
        let sql = format!("SELECT doc FROM {} WHERE id = $1", table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch from {}", table))?;

        row.map(|row| from_doc(row.get("doc"))).transpose()
    }

    /// Read-check-write one document under `FOR UPDATE`. Nothing is written
    /// when `apply` returns false.
    async fn update_locked<T, F>(&self, table: &str, id: &str, apply: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(&mut T) -> bool + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let select = format!("SELECT doc FROM {} WHERE id = $1 FOR UPDATE", table);
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("Failed to lock row in {}", table))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut doc: T = from_doc(row.get("doc"))?;
        if !apply(&mut doc) {
            return Ok(None);
        }

        let update = format!("UPDATE {} SET doc = $2 WHERE id = $1", table);
        sqlx::query(&update)
            .bind(id)
            .bind(to_doc(&doc)?)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to update {}", table))?;
        tx.commit().await.context("Failed to commit transaction")?;

        Ok(Some(doc))
    }
}

#[async_trait::async_trait]
impl BuildStore for PostgresStore {
    async fn insert_build(&self, build: Build) -> Result<()> {
        sqlx::query("INSERT INTO builds (id, doc, created_at) VALUES ($1, $2, $3)")
            .bind(&build.id)
            .bind(to_doc(&build)?)
            .bind(build.created_at)
            .execute(&self.pool)
            .await
            .context("Failed to insert build")?;
        Ok(())
    }

    async fn get_build(&self, id: &Id) -> Result<Option<Build>> {
        self.get_doc("builds", id).await
    }

    async fn mark_build_started(
        &self,
        id: &Id,
        started_by: &Owner,
        at: DateTime<Utc>,
    ) -> Result<Option<Build>> {
        let started_by = started_by.clone();
        self.update_locked("builds", id, move |build: &mut Build| {
            if build.started.is_some() || build.completed.is_some() {
                return false;
            }
            build.started = Some(at);
            build.started_by = Some(started_by);
            true
        })
        .await
    }

    async fn replace_build_context_version(
        &self,
        id: &Id,
        from: &Id,
        to: &ContextVersion,
    ) -> Result<bool> {
        let from = from.clone();
        let (to_id, to_context) = (to.id.clone(), to.context.clone());
        let replaced = self
            .update_locked("builds", id, move |build: &mut Build| {
                if build.context_versions != [from] {
                    return false;
                }
                build.context_versions = vec![to_id];
                build.contexts = vec![to_context];
                true
            })
            .await?;
        Ok(replaced.is_some())
    }

    async fn complete_build(&self, id: &Id, outcome: BuildOutcome) -> Result<Option<Build>> {
        self.update_locked("builds", id, move |build: &mut Build| {
            if build.completed.is_some() {
                return false;
            }
            build.completed = Some(outcome.completed);
            build.failed = outcome.failed;
            true
        })
        .await
    }

    async fn complete_builds_for_context_versions(
        &self,
        context_version_ids: &[Id],
        outcome: BuildOutcome,
    ) -> Result<Vec<Build>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let rows = sqlx::query(
            r#"
            SELECT id, doc FROM builds
            WHERE (doc -> 'context_versions') ?| $1
              AND doc ->> 'completed' IS NULL
            FOR UPDATE
            "#,
        )
        .bind(context_version_ids)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to lock builds for context versions")?;

        let mut settled = Vec::with_capacity(rows.len());
        for row in rows {
            let mut build: Build = from_doc(row.get("doc"))?;
            build.completed = Some(outcome.completed);
            build.failed = outcome.failed;
            sqlx::query("UPDATE builds SET doc = $2 WHERE id = $1")
                .bind(&build.id)
                .bind(to_doc(&build)?)
                .execute(&mut *tx)
                .await
                .context("Failed to settle build")?;
            settled.push(build);
        }
        tx.commit().await.context("Failed to commit transaction")?;

        Ok(settled)
    }
}

#[async_trait::async_trait]
impl ContextVersionStore for PostgresStore {
    async fn insert_context_version(&self, context_version: ContextVersion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO context_versions (id, execution_id, fingerprint, doc, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&context_version.id)
        .bind(&context_version.build.id)
        .bind(&context_version.build.hash)
        .bind(to_doc(&context_version)?)
        .bind(context_version.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert context version")?;
        Ok(())
    }

    async fn get_context_version(&self, id: &Id) -> Result<Option<ContextVersion>> {
        self.get_doc("context_versions", id).await
    }

    async fn start_context_version_build(
        &self,
        id: &Id,
        claim: BuildClaim,
    ) -> Result<BuildStart> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&claim.fingerprint)
            .execute(&mut *tx)
            .await
            .context("Failed to take fingerprint lock")?;

        let row = sqlx::query("SELECT doc FROM context_versions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to lock context version")?
            .ok_or_else(|| anyhow!("context version {} not found", id))?;
        let mut cv: ContextVersion = from_doc(row.get("doc"))?;
        if cv.build.started.is_some() {
            return Ok(BuildStart::Duplicate(cv));
        }

        if !claim.no_cache {
            let duplicate = sqlx::query(
                r#"
                SELECT doc FROM context_versions
                WHERE fingerprint = $1
                  AND id <> $2
                  AND (doc -> 'owner' ->> 'github')::BIGINT = $3
                  AND doc ->> 'context' = $4
                  AND COALESCE((doc ->> 'advanced')::BOOLEAN, FALSE) = $5
                  AND doc -> 'build' ->> 'started' IS NOT NULL
                  AND COALESCE((doc -> 'build' ->> 'failed')::BOOLEAN, FALSE) = FALSE
                  AND (
                    doc -> 'build' ->> 'completed' IS NOT NULL
                    OR doc -> 'build_container' IS NOT NULL
                    OR (doc -> 'build' ->> 'started')::TIMESTAMPTZ >= $6
                  )
                ORDER BY doc -> 'build' ->> 'started'
                LIMIT 1
                "#,
            )
            .bind(&claim.fingerprint)
            .bind(id)
            .bind(cv.owner.github)
            .bind(&cv.context)
            .bind(cv.advanced)
            .bind(claim.stale_before)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to look up duplicate build")?;
            if let Some(row) = duplicate {
                return Ok(BuildStart::Duplicate(from_doc(row.get("doc"))?));
            }
        }

        cv.build.id = Some(claim.execution_id);
        cv.build.started = Some(Utc::now());
        cv.build.hash = Some(claim.fingerprint);
        cv.build.triggered_by = Some(claim.started_by);
        cv.build.message = claim.message;
        cv.build.triggered_action = claim.triggered_action;

        sqlx::query(
            "UPDATE context_versions SET doc = $2, execution_id = $3, fingerprint = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(to_doc(&cv)?)
        .bind(&cv.build.id)
        .bind(&cv.build.hash)
        .execute(&mut *tx)
        .await
        .context("Failed to claim context version build")?;
        tx.commit().await.context("Failed to commit transaction")?;

        Ok(BuildStart::Started(cv))
    }

    async fn mark_context_version_errored(
        &self,
        id: &Id,
        error_message: &str,
    ) -> Result<Option<ContextVersion>> {
        let error_message = error_message.to_string();
        self.update_locked("context_versions", id, move |cv: &mut ContextVersion| {
            if cv.build.is_terminal() {
                return false;
            }
            cv.build.failed = true;
            cv.build.completed = Some(Utc::now());
            cv.build.error_message = Some(error_message);
            true
        })
        .await
    }

    async fn set_build_container(
        &self,
        execution_id: &Id,
        container: &BuildContainer,
    ) -> Result<Vec<ContextVersion>> {
        let rows = sqlx::query(
            r#"
            UPDATE context_versions
            SET doc = jsonb_set(doc, '{build_container}', $2)
            WHERE execution_id = $1
              AND doc -> 'build' ->> 'completed' IS NULL
              AND COALESCE((doc -> 'build' ->> 'failed')::BOOLEAN, FALSE) = FALSE
            RETURNING doc
            "#,
        )
        .bind(execution_id)
        .bind(to_doc(container)?)
        .fetch_all(&self.pool)
        .await
        .context("Failed to record build container")?;

        rows.into_iter()
            .map(|row| from_doc(row.get("doc")))
            .collect()
    }

    async fn complete_context_versions_by_execution(
        &self,
        execution_id: &Id,
        completion: &BuildCompletion,
    ) -> Result<Vec<ContextVersion>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let rows = sqlx::query("SELECT doc FROM context_versions WHERE execution_id = $1 FOR UPDATE")
            .bind(execution_id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to lock context versions for execution")?;

        let now = Utc::now();
        let mut settled = Vec::new();
        for row in rows {
            let mut cv: ContextVersion = from_doc(row.get("doc"))?;
            if cv.build.is_terminal() {
                continue;
            }
            cv.build.completed = Some(now);
            match completion {
                BuildCompletion::Succeeded { docker_image } => {
                    cv.build.docker_image = docker_image.clone();
                }
                BuildCompletion::Failed { error_message } => {
                    cv.build.failed = true;
                    cv.build.error_message = Some(error_message.clone());
                }
            }
            sqlx::query("UPDATE context_versions SET doc = $2 WHERE id = $1")
                .bind(&cv.id)
                .bind(to_doc(&cv)?)
                .execute(&mut *tx)
                .await
                .context("Failed to settle context version")?;
            settled.push(cv);
        }
        tx.commit().await.context("Failed to commit transaction")?;

        Ok(settled)
    }
}

#[async_trait::async_trait]
impl InstanceStore for PostgresStore {
    async fn insert_instance(&self, instance: Instance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (id, short_hash, owner_github, doc, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.short_hash)
        .bind(instance.owner.github)
        .bind(to_doc(&instance)?)
        .bind(instance.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert instance")?;
        Ok(())
    }

    async fn get_instance(&self, id: &Id) -> Result<Option<Instance>> {
        self.get_doc("instances", id).await
    }

    async fn find_instance_by_short_hash(&self, short_hash: &str) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT doc FROM instances WHERE short_hash = $1")
            .bind(short_hash)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch instance by short hash")?;

        row.map(|row| from_doc(row.get("doc"))).transpose()
    }

    async fn find_instances(&self, query: &InstanceQuery) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM instances
            WHERE ($1::BIGINT IS NULL OR owner_github = $1)
              AND ($2::TEXT IS NULL OR doc -> 'context_version' -> 'app_code_versions'
                    @> jsonb_build_array(jsonb_build_object('lower_repo', $2::TEXT)))
            ORDER BY created_at
            "#,
        )
        .bind(query.owner_github)
        .bind(&query.repo)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query instances")?;

        let mut found = Vec::with_capacity(rows.len());
        for row in rows {
            let instance: Instance = from_doc(row.get("doc"))?;
            if query.matches(&instance) {
                found.push(instance);
            }
        }
        Ok(found)
    }

    async fn update_instance(&self, instance: &Instance) -> Result<()> {
        let result = sqlx::query("UPDATE instances SET doc = $2, owner_github = $3 WHERE id = $1")
            .bind(&instance.id)
            .bind(to_doc(instance)?)
            .bind(instance.owner.github)
            .execute(&self.pool)
            .await
            .context("Failed to update instance")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("instance {} not found", instance.id));
        }
        Ok(())
    }

    async fn isolate_instance(
        &self,
        id: &Id,
        isolation_id: &Id,
        is_master: bool,
    ) -> Result<Option<Instance>> {
        let isolation_id = isolation_id.clone();
        self.update_locked("instances", id, move |instance: &mut Instance| {
            if instance.isolated.is_some() {
                return false;
            }
            instance.isolated = Some(isolation_id);
            instance.is_isolation_group_master = Some(is_master);
            true
        })
        .await
    }

    async fn deisolate_instance(&self, id: &Id) -> Result<Option<Instance>> {
        self.update_locked("instances", id, |instance: &mut Instance| {
            instance.isolated = None;
            instance.is_isolation_group_master = None;
            true
        })
        .await
    }
}

#[async_trait::async_trait]
impl IsolationStore for PostgresStore {
    async fn insert_isolation(&self, isolation: Isolation) -> Result<()> {
        sqlx::query("INSERT INTO isolations (id, doc, created_at) VALUES ($1, $2, $3)")
            .bind(&isolation.id)
            .bind(to_doc(&isolation)?)
            .bind(isolation.created_at)
            .execute(&self.pool)
            .await
            .context("Failed to insert isolation")?;
        Ok(())
    }

    async fn get_isolation(&self, id: &Id) -> Result<Option<Isolation>> {
        self.get_doc("isolations", id).await
    }

    async fn transition_isolation(
        &self,
        id: &Id,
        from: IsolationState,
        to: IsolationState,
        redeploy_on_killed: Option<bool>,
    ) -> Result<Option<Isolation>> {
        self.update_locked("isolations", id, move |isolation: &mut Isolation| {
            if isolation.state != from {
                return false;
            }
            isolation.state = to;
            if let Some(redeploy) = redeploy_on_killed {
                isolation.redeploy_on_killed = redeploy;
            }
            true
        })
        .await
    }

    async fn delete_isolation(&self, id: &Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM isolations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete isolation")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl AutoIsolationConfigStore for PostgresStore {
    async fn upsert_auto_isolation_config(&self, config: AutoIsolationConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO auto_isolation_configs (instance_id, doc) VALUES ($1, $2)
            ON CONFLICT (instance_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&config.instance)
        .bind(to_doc(&config)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert auto isolation config")?;
        Ok(())
    }

    async fn find_auto_isolation_config(
        &self,
        instance_id: &Id,
    ) -> Result<Option<AutoIsolationConfig>> {
        let row = sqlx::query("SELECT doc FROM auto_isolation_configs WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch auto isolation config")?;

        row.map(|row| from_doc(row.get("doc"))).transpose()
    }
}

#[async_trait::async_trait]
impl UserStore for PostgresStore {
    async fn upsert_user(&self, user: User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (github_id, username, doc) VALUES ($1, $2, $3)
            ON CONFLICT (github_id) DO UPDATE SET
                username = EXCLUDED.username,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(user.github_id)
        .bind(&user.username)
        .bind(to_doc(&user)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert user")?;
        Ok(())
    }

    async fn find_user_by_github_id(&self, github_id: GithubId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT doc FROM users WHERE github_id = $1")
            .bind(github_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;

        row.map(|row| from_doc(row.get("doc"))).transpose()
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT doc FROM users WHERE LOWER(username) = LOWER($1)")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by username")?;

        row.map(|row| from_doc(row.get("doc"))).transpose()
    }
}

#[async_trait::async_trait]
impl OrganizationStore for PostgresStore {
    async fn upsert_organization(&self, organization: Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (github_id, doc) VALUES ($1, $2)
            ON CONFLICT (github_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(organization.github_id)
        .bind(to_doc(&organization)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert organization")?;
        Ok(())
    }

    async fn find_organization(&self, github_id: GithubId) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT doc FROM organizations WHERE github_id = $1")
            .bind(github_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch organization")?;

        row.map(|row| from_doc(row.get("doc"))).transpose()
    }
}

#[async_trait::async_trait]
impl GraphStore for PostgresStore {
    async fn dependencies(&self, instance_id: &Id) -> Result<Vec<DependencyNode>> {
        let rows = sqlx::query(
            "SELECT to_node FROM instance_dependencies WHERE from_id = $1 ORDER BY created_at",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch dependencies")?;

        rows.into_iter()
            .map(|row| from_doc(row.get("to_node")))
            .collect()
    }

    async fn add_edge(&self, from: &DependencyNode, to: &DependencyNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instance_dependencies (from_id, to_id, to_node) VALUES ($1, $2, $3)
            ON CONFLICT (from_id, to_id) DO UPDATE SET to_node = EXCLUDED.to_node
            "#,
        )
        .bind(&from.instance_id)
        .bind(&to.instance_id)
        .bind(to_doc(to)?)
        .execute(&self.pool)
        .await
        .context("Failed to add dependency edge")?;
        Ok(())
    }

    async fn remove_edge(&self, from_id: &Id, to_id: &Id) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM instance_dependencies WHERE from_id = $1 AND to_id = $2")
                .bind(from_id)
                .bind(to_id)
                .execute(&self.pool)
                .await
                .context("Failed to remove dependency edge")?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_node(&self, instance_id: &Id) -> Result<()> {
        sqlx::query("DELETE FROM instance_dependencies WHERE from_id = $1 OR to_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove dependency node")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobQueue for PostgresStore {
    async fn publish(&self, job: Job) -> Result<()> {
        sqlx::query("INSERT INTO jobs (queue, payload) VALUES ($1, $2)")
            .bind(job.queue())
            .bind(to_doc(&job)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to enqueue {}", job.queue()))?;
        Ok(())
    }
}
