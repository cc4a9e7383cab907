//! Lock service backed by a SQLite file that every worker on the host opens.
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::lock::Locking;

/// Identifies this process in the lock table.
static PROCESS_HOLDER: Lazy<String> = Lazy::new(|| {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("pid{}-{:x}", std::process::id(), nanos)
});

#[derive(Clone)]
pub struct SqliteLocking {
    pool: SqlitePool,
    holder: String,
    lease: Option<Duration>,
}

impl SqliteLocking {
    pub async fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Lock(format!("creating directory {}: {e}", parent.display()))
            })?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> AppResult<Self> {
        ensure_lock_table(&pool).await?;
        Ok(Self {
            pool,
            holder: PROCESS_HOLDER.clone(),
            lease: None,
        })
    }

    /// Same table, different holder identity.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Holds not renewed within `lease` are treated as abandoned by a crashed
    /// worker and may be taken over. Holders must call
    /// [`Locking::renew`] more often than that.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn holder_of(&self, namespace: &str) -> AppResult<Option<String>> {
        let holder = sqlx::query_scalar::<_, String>(
            "SELECT holder FROM remote_locks WHERE namespace = ?1",
        )
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;
        Ok(holder)
    }
}

async fn ensure_lock_table(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS remote_locks (
            namespace TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl Locking for SqliteLocking {
    async fn lock(&self, namespace: &str) -> AppResult<bool> {
        let now = Utc::now().timestamp();
        if let Some(lease) = self.lease {
            let expired_before = now - lease.as_secs() as i64;
            let reaped = sqlx::query(
                "DELETE FROM remote_locks WHERE namespace = ?1 AND acquired_at < ?2",
            )
            .bind(namespace)
            .bind(expired_before)
            .execute(&self.pool)
            .await?;
            if reaped.rows_affected() > 0 {
                debug!(namespace = %namespace, "Reaped expired lock hold");
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO remote_locks (namespace, holder, acquired_at)
            VALUES (?1, ?2, ?3);
            "#,
        )
        .bind(namespace)
        .bind(&self.holder)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn renew(&self, namespace: &str) -> AppResult<bool> {
        let renewed = sqlx::query(
            "UPDATE remote_locks SET acquired_at = ?3 WHERE namespace = ?1 AND holder = ?2",
        )
        .bind(namespace)
        .bind(&self.holder)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(renewed.rows_affected() == 1)
    }

    async fn unlock(&self, namespace: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM remote_locks WHERE namespace = ?1 AND holder = ?2")
            .bind(namespace)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
