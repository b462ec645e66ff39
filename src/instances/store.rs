//! Instance CRUD storage (SQLite).

use super::{Instance, InstanceStatus, PortAllocator};
use crate::error::{DeployError, Result};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

const INSTANCE_COLUMNS: &str = "id, user_id, port, container_id, container_name, status, service_url, access_url, last_health_check, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct InstanceStore {
    pool: SqlitePool,
    ports: PortAllocator,
}

impl InstanceStore {
    pub fn new(pool: SqlitePool, ports: PortAllocator) -> Self {
        Self { pool, ports }
    }

    /// Maximum number of retries when a concurrent create races on the same
    /// port UNIQUE constraint.
    const MAX_CREATE_RETRIES: usize = 3;

    /// Insert a new instance in `deploying` with a freshly allocated port.
    pub async fn create(&self, user_id: &str, container_name: &str) -> Result<Instance> {
        for attempt in 0..Self::MAX_CREATE_RETRIES {
            let mut tx = self
                .pool
                .begin()
                .await
                .context("failed to open instance create transaction")?;

            let port = self.ports.allocate(&mut tx).await?;
            let id = uuid::Uuid::new_v4().to_string();

            let insert_result = sqlx::query(
                "INSERT INTO instances (id, user_id, port, container_name, status) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(user_id)
            .bind(port)
            .bind(container_name)
            .bind(InstanceStatus::Deploying.as_str())
            .execute(&mut *tx)
            .await;

            match insert_result {
                Ok(_) => {
                    tx.commit()
                        .await
                        .context("failed to commit instance create transaction")?;

                    return self
                        .get(&id)
                        .await?
                        .context("instance inserted but not found")
                        .map_err(Into::into);
                }
                Err(sqlx::Error::Database(ref db_error))
                    if db_error.code().as_deref() == Some("2067")
                        && db_error.message().contains("instances.port") =>
                {
                    tracing::debug!(attempt, port, user_id, "port collision, retrying");
                    continue;
                }
                Err(error) => {
                    return Err(anyhow::anyhow!("failed to insert instance: {error}").into());
                }
            }
        }

        Err(anyhow::anyhow!(
            "failed to create instance after {} retries due to concurrent port collisions",
            Self::MAX_CREATE_RETRIES
        )
        .into())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch instance")?;

        row.map(instance_from_row).transpose()
    }

    /// Like [`get`](Self::get) but a missing row is an error.
    pub async fn require(&self, id: &str) -> Result<Instance> {
        self.get(id)
            .await?
            .ok_or_else(|| DeployError::InstanceNotFound { id: id.to_string() }.into())
    }

    pub async fn get_by_user(&self, user_id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch instance by user")?;

        row.map(instance_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list instances")?;

        rows.into_iter().map(instance_from_row).collect()
    }

    pub async fn set_container_id(&self, id: &str, container_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET container_id = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(container_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to set instance container id")?;
        Ok(())
    }

    pub async fn set_urls(&self, id: &str, service_url: Option<&str>, access_url: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET service_url = ?, access_url = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(service_url)
        .bind(access_url)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to set instance urls")?;
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: InstanceStatus) -> Result<()> {
        sqlx::query("UPDATE instances SET status = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to set instance status")?;
        Ok(())
    }

    /// Store a reconciled status together with the health-check timestamp.
    pub async fn record_health(&self, id: &str, status: InstanceStatus) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET status = ?, last_health_check = datetime('now'), updated_at = datetime('now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to record instance health")?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete instance")?;

        Ok(result.rows_affected() > 0)
    }

    /// Point delegation links and the owning configuration at a replacement
    /// instance so a redeploy keeps the graph intact.
    pub async fn relink(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open relink transaction")?;

        sqlx::query("UPDATE agent_links SET source_instance_id = ? WHERE source_instance_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await
            .context("failed to relink outgoing agent links")?;
        sqlx::query("UPDATE agent_links SET target_instance_id = ? WHERE target_instance_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await
            .context("failed to relink incoming agent links")?;

        tx.commit().await.context("failed to commit relink")?;
        Ok(())
    }
}

fn instance_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Instance> {
    let status_value: String = row
        .try_get("status")
        .context("failed to read instance status")?;
    let status = InstanceStatus::parse(&status_value)
        .with_context(|| format!("invalid instance status in database: {status_value}"))?;

    Ok(Instance {
        id: row.try_get("id").context("failed to read instance id")?,
        user_id: row
            .try_get("user_id")
            .context("failed to read instance user_id")?,
        port: row.try_get("port").context("failed to read instance port")?,
        container_id: row
            .try_get::<Option<String>, _>("container_id")
            .ok()
            .flatten()
            .filter(|value| !value.is_empty()),
        container_name: row
            .try_get("container_name")
            .context("failed to read instance container_name")?,
        status,
        service_url: row.try_get::<Option<String>, _>("service_url").ok().flatten(),
        access_url: row.try_get::<Option<String>, _>("access_url").ok().flatten(),
        last_health_check: row
            .try_get::<Option<chrono::NaiveDateTime>, _>("last_health_check")
            .ok()
            .flatten()
            .map(|value| value.and_utc()),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|value| value.and_utc())
            .context("failed to read instance created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(|value| value.and_utc())
            .context("failed to read instance updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::instances::{DeploymentLogStore, LogAction, resource_name};

    async fn setup() -> (InstanceStore, DeploymentLogStore) {
        let db = Db::in_memory().await.expect("in-memory sqlite should connect");
        (
            InstanceStore::new(db.sqlite.clone(), PortAllocator::new(20000, 20010)),
            DeploymentLogStore::new(db.sqlite),
        )
    }

    #[tokio::test]
    async fn create_allocates_distinct_ports() {
        let (store, _) = setup().await;
        let first = store
            .create("alice", &resource_name("alice"))
            .await
            .expect("first instance");
        let second = store
            .create("bob", &resource_name("bob"))
            .await
            .expect("second instance");

        assert_eq!(first.port, 20000);
        assert_eq!(second.port, 20001);
        assert_eq!(first.status, InstanceStatus::Deploying);
        assert!(first.container_id.is_none());
    }

    #[tokio::test]
    async fn deleted_ports_are_reused() {
        let (store, _) = setup().await;
        let first = store.create("alice", "berth-alice").await.expect("create");
        store.create("bob", "berth-bob").await.expect("create");
        assert!(store.delete(&first.id).await.expect("delete"));

        let third = store.create("carol", "berth-carol").await.expect("create");
        assert_eq!(third.port, 20000);
    }

    #[tokio::test]
    async fn one_row_per_user() {
        let (store, _) = setup().await;
        store.create("alice", "berth-alice").await.expect("create");
        let error = store
            .create("alice", "berth-alice")
            .await
            .expect_err("second live row for the same user must fail");
        assert!(error.to_string().contains("failed to insert instance"));
    }

    #[tokio::test]
    async fn record_health_sets_timestamp() {
        let (store, _) = setup().await;
        let instance = store.create("alice", "berth-alice").await.expect("create");
        store
            .record_health(&instance.id, InstanceStatus::Running)
            .await
            .expect("record health");

        let reloaded = store.require(&instance.id).await.expect("instance exists");
        assert_eq!(reloaded.status, InstanceStatus::Running);
        assert!(reloaded.last_health_check.is_some());
    }

    #[tokio::test]
    async fn require_reports_missing_instance() {
        let (store, _) = setup().await;
        let error = store.require("nope").await.expect_err("missing instance");
        assert!(matches!(
            error,
            crate::Error::Deploy(DeployError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn logs_survive_instance_deletion_and_reject_mutation() {
        let (store, logs) = setup().await;
        let instance = store.create("alice", "berth-alice").await.expect("create");
        logs.success(&instance, LogAction::Deploy, "deployed")
            .await
            .expect("append");
        store.delete(&instance.id).await.expect("delete");

        let entries = logs.list_for_user("alice", 10).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, LogAction::Deploy);

        let update = sqlx::query("UPDATE deployment_logs SET message = 'edited'")
            .execute(&store.pool)
            .await;
        assert!(update.is_err(), "log rows must be immutable");

        let delete = sqlx::query("DELETE FROM deployment_logs")
            .execute(&store.pool)
            .await;
        assert!(delete.is_err(), "log rows must not be deleted");
    }
}
