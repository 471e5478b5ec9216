//! Durable records of apps, deployments, env vars and users.
//!
//! Backed by SQLite via `sqlx`: a pool behind a cheaply-`Clone`able handle,
//! tables created with `CREATE TABLE IF NOT EXISTS` at startup, and
//! runtime (not compile-time checked) `sqlx::query`/`query_as` calls so
//! the crate builds without a live database connection.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::error::DatabaseError;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool};

use crate::error::{Error, Result};
use crate::model::{App, Deployment, EnvVar, Plan, Status, User};

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn create_app(&self, owner_id: &str, name: &str, slug: &str, repo_url: &str, branch: &str)
        -> Result<App>;
    async fn get_app(&self, id: &str) -> Result<Option<App>>;
    async fn get_app_by_slug(&self, slug: &str) -> Result<Option<App>>;
    async fn list_apps_by_owner(&self, owner_id: &str) -> Result<Vec<App>>;
    async fn count_apps_by_owner(&self, owner_id: &str) -> Result<u32>;
    async fn delete_app(&self, id: &str) -> Result<()>;
    async fn update_app_status(&self, id: &str, status: Status) -> Result<()>;

    async fn create_deployment(&self, app_id: &str) -> Result<Deployment>;
    async fn claim_next_pending(&self) -> Result<Option<Deployment>>;
    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>>;
    async fn list_deployments_by_app(&self, app_id: &str) -> Result<Vec<Deployment>>;
    async fn get_running_deployment(&self, app_id: &str) -> Result<Option<Deployment>>;
    async fn has_in_flight_deployment(&self, app_id: &str) -> Result<bool>;
    async fn update_deployment(&self, update: DeploymentUpdate) -> Result<()>;
    async fn mark_orphaned_building_as_failed(&self) -> Result<Vec<Deployment>>;

    async fn set_env_var(&self, app_id: &str, key: &str, value: &str) -> Result<()>;
    async fn delete_env_var(&self, app_id: &str, key: &str) -> Result<()>;
    async fn list_env_vars(&self, app_id: &str) -> Result<Vec<EnvVar>>;

    async fn upsert_user(&self, id: &str, email: &str, plan: Plan) -> Result<User>;
    async fn get_user(&self, id: &str) -> Result<Option<User>>;
}

/// Partial update applied to a deployment row. `None` fields are left
/// untouched; `updated_at` is always refreshed.
#[derive(Debug, Default, Clone)]
pub struct DeploymentUpdate {
    pub id: i64,
    pub status: Option<Status>,
    pub image_ref: Option<String>,
    pub container_ref: Option<String>,
    pub subdomain: Option<String>,
    pub build_log: Option<String>,
    pub runtime_log: Option<String>,
    pub error_message: Option<String>,
}

impl DeploymentUpdate {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn container_ref(mut self, container_ref: impl Into<String>) -> Self {
        self.container_ref = Some(container_ref.into());
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn build_log(mut self, build_log: impl Into<String>) -> Self {
        self.build_log = Some(build_log.into());
        self
    }

    pub fn runtime_log(mut self, runtime_log: impl Into<String>) -> Self {
        self.runtime_log = Some(runtime_log.into());
        self
    }

    pub fn error_message(mut self, error_message: impl Into<String>) -> Self {
        self.error_message = Some(error_message.into());
        self
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::create_database(database_url).await?;
        }
        let pool = SqlitePool::connect(database_url).await?;
        Self::from_pool(pool).await
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Self {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Self::from_pool(pool).await.unwrap()
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                plan TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS apps (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                repo_url TEXT NOT NULL,
                branch TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_id, name)
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                image_ref TEXT,
                container_ref TEXT,
                subdomain TEXT,
                build_log TEXT,
                runtime_log TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS env_vars (
                app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (app_id, key)
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_app_id ON deployments(app_id);
            CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status);
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn create_app(
        &self,
        owner_id: &str,
        name: &str,
        slug: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<App> {
        let id = ulid::Ulid::new().to_string().to_lowercase();
        let now = Utc::now();

        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM apps WHERE owner_id = ? AND name = ?",
        )
        .bind(owner_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        if existing > 0 {
            return Err(Error::Conflict(format!(
                "app named '{name}' already exists for this owner"
            )));
        }

        let slug_taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM apps WHERE slug = ?")
            .bind(slug)
            .fetch_one(&self.pool)
            .await?;
        if slug_taken > 0 {
            return Err(Error::Conflict(format!(
                "slug '{slug}' is already in use by another app"
            )));
        }

        sqlx::query(
            "INSERT INTO apps (id, owner_id, name, slug, repo_url, branch, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(name)
        .bind(slug)
        .bind(repo_url)
        .bind(branch)
        .bind(Status::Pending)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            // The pre-checks above are racy under concurrent callers; a
            // unique-constraint violation slipping through them is still a
            // name/slug conflict, not an internal error.
            Some(db_err) if db_err.is_unique_violation() => Error::Conflict(format!(
                "app named '{name}' or slug '{slug}' already exists"
            )),
            _ => Error::Database(e),
        })?;

        Ok(App {
            id,
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            slug: slug.to_string(),
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
            status: Status::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_app(&self, id: &str) -> Result<Option<App>> {
        sqlx::query_as("SELECT * FROM apps WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn get_app_by_slug(&self, slug: &str) -> Result<Option<App>> {
        sqlx::query_as("SELECT * FROM apps WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn list_apps_by_owner(&self, owner_id: &str) -> Result<Vec<App>> {
        sqlx::query_as("SELECT * FROM apps WHERE owner_id = ? ORDER BY created_at DESC")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn count_apps_by_owner(&self, owner_id: &str) -> Result<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apps WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u32)
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        // env_vars and deployments cascade via the foreign key declarations
        // above; SQLite enforces FKs only with `PRAGMA foreign_keys = ON`,
        // which sqlx does not set by default, so delete explicitly in
        // dependency order rather than relying on it.
        sqlx::query("DELETE FROM env_vars WHERE app_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM deployments WHERE app_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_app_status(&self, id: &str, status: Status) -> Result<()> {
        sqlx::query("UPDATE apps SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_deployment(&self, app_id: &str) -> Result<Deployment> {
        if self.has_in_flight_deployment(app_id).await? {
            return Err(Error::Conflict(format!(
                "app '{app_id}' already has a deployment in progress"
            )));
        }

        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO deployments (app_id, status, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(app_id)
        .bind(Status::Pending)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Deployment {
            id,
            app_id: app_id.to_string(),
            status: Status::Pending,
            image_ref: None,
            container_ref: None,
            subdomain: None,
            build_log: None,
            runtime_log: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Atomically claims the oldest `Pending` deployment by moving it to
    /// `Building` in the same statement. SQLite serializes all writers, so
    /// this single `UPDATE ... RETURNING` is linearizable: two workers can
    /// never both see the same row returned.
    async fn claim_next_pending(&self) -> Result<Option<Deployment>> {
        sqlx::query_as(
            "UPDATE deployments SET status = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM deployments WHERE status = ? ORDER BY created_at ASC LIMIT 1
             )
             RETURNING *",
        )
        .bind(Status::Building)
        .bind(Utc::now())
        .bind(Status::Pending)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn list_deployments_by_app(&self, app_id: &str) -> Result<Vec<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE app_id = ? ORDER BY created_at DESC")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn get_running_deployment(&self, app_id: &str) -> Result<Option<Deployment>> {
        sqlx::query_as(
            "SELECT * FROM deployments WHERE app_id = ? AND status = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(app_id)
        .bind(Status::Running)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn has_in_flight_deployment(&self, app_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deployments WHERE app_id = ? AND status IN (?, ?)",
        )
        .bind(app_id)
        .bind(Status::Pending)
        .bind(Status::Building)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn update_deployment(&self, update: DeploymentUpdate) -> Result<()> {
        let current = self
            .get_deployment(update.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment {} not found", update.id)))?;

        let status = update.status.unwrap_or(current.status);
        let image_ref = update.image_ref.or(current.image_ref);
        let container_ref = update.container_ref.or(current.container_ref);
        let subdomain = update.subdomain.or(current.subdomain);
        let build_log = update.build_log.or(current.build_log);
        let runtime_log = update.runtime_log.or(current.runtime_log);
        let error_message = update.error_message.or(current.error_message);

        sqlx::query(
            "UPDATE deployments SET status = ?, image_ref = ?, container_ref = ?, subdomain = ?,
             build_log = ?, runtime_log = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(image_ref)
        .bind(container_ref)
        .bind(subdomain)
        .bind(build_log)
        .bind(runtime_log)
        .bind(error_message)
        .bind(Utc::now())
        .bind(update.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Start-up reconciliation: a deployment left in `Building` (which also
    /// covers the fetch sub-phase — there is no separate `Fetching` status
    /// column, see DESIGN.md) when the engine starts did not survive its
    /// previous process, and is not resumed.
    async fn mark_orphaned_building_as_failed(&self) -> Result<Vec<Deployment>> {
        let orphaned: Vec<Deployment> =
            sqlx::query_as("SELECT * FROM deployments WHERE status = ?")
                .bind(Status::Building)
                .fetch_all(&self.pool)
                .await?;

        for d in &orphaned {
            self.update_deployment(
                DeploymentUpdate::new(d.id)
                    .status(Status::Failed)
                    .error_message("orphaned"),
            )
            .await?;
            self.update_app_status(&d.app_id, Status::Failed).await?;
        }

        Ok(orphaned)
    }

    async fn set_env_var(&self, app_id: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO env_vars (app_id, key, value) VALUES (?, ?, ?)
             ON CONFLICT(app_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(app_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_env_var(&self, app_id: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM env_vars WHERE app_id = ? AND key = ?")
            .bind(app_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_env_vars(&self, app_id: &str) -> Result<Vec<EnvVar>> {
        sqlx::query_as("SELECT * FROM env_vars WHERE app_id = ? ORDER BY key ASC")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn upsert_user(&self, id: &str, email: &str, plan: Plan) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (id, email, plan) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET email = excluded.email, plan = excluded.plan",
        )
        .bind(id)
        .bind(email)
        .bind(plan)
        .execute(&self.pool)
        .await?;

        Ok(User {
            id: id.to_string(),
            email: email.to_string(),
            plan,
        })
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }
}

/// Parses a plan string read back from the DB layer defensively; plans are
/// validated at the API boundary, this is only a last line of defence.
pub fn parse_plan(raw: &str) -> Plan {
    Plan::from_str(raw).unwrap_or_default()
}
