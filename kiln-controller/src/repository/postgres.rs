//! PostgreSQL store backend
//!
//! Objects live in the `objects` table as JSONB bodies keyed by
//! (kind, namespace, name). Every write takes a transaction-scoped advisory
//! lock before drawing its version from `kiln_resource_version`, so versions
//! become visible in the order they were drawn and a reader of
//! `object_changes` never skips a revision that commits later.
//!
//! Each write also prunes `object_changes` to the configured retention and
//! raises `change_log_horizon` to the highest revision it discarded. The most
//! recent change is always kept, so `MAX(revision)` stays the store revision.

use async_trait::async_trait;
use kiln_core::domain::meta::ObjectKey;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

use super::{
    ChangeType, DEFAULT_CHANGE_RETENTION, ObjectKind, ObjectStore, RawChange, RawList, RawObject,
    StoreError, StoreResult,
};

/// Advisory lock key serializing all writers
const WRITE_LOCK_KEY: i64 = 0x6b69_6c6e;

/// Store backend on PostgreSQL
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retention: u64,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retention: DEFAULT_CHANGE_RETENTION as u64,
        }
    }

    /// Keeps only the changes of the `retention` most recent revisions
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1) as u64;
        self
    }

    /// Records a change and prunes the log behind it, inside the write
    async fn log_change(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        revision: u64,
        kind: ObjectKind,
        change: ChangeType,
        key: &ObjectKey,
        body: &serde_json::Value,
    ) -> StoreResult<()> {
        record_change(tx, revision, kind, change, key, body).await?;

        let horizon = revision.saturating_sub(self.retention);
        if horizon == 0 {
            return Ok(());
        }

        sqlx::query("DELETE FROM object_changes WHERE revision <= $1")
            .bind(horizon as i64)
            .execute(&mut **tx)
            .await?;
        sqlx::query("UPDATE change_log_horizon SET revision = GREATEST(revision, $1) WHERE id = 1")
            .bind(horizon as i64)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    async fn begin_write(&self) -> StoreResult<(Transaction<'static, Postgres>, u64)> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(WRITE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let version: i64 = sqlx::query_scalar("SELECT nextval('kiln_resource_version')")
            .fetch_one(&mut *tx)
            .await?;

        Ok((tx, version as u64))
    }

    async fn current_version(
        tx: &mut Transaction<'static, Postgres>,
        kind: ObjectKind,
        key: &ObjectKey,
    ) -> StoreResult<Option<u64>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT resource_version FROM objects WHERE kind = $1 AND namespace = $2 AND name = $3",
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(version.map(|v| v as u64))
    }
}

async fn record_change(
    tx: &mut Transaction<'static, Postgres>,
    revision: u64,
    kind: ObjectKind,
    change: ChangeType,
    key: &ObjectKey,
    body: &serde_json::Value,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO object_changes (revision, kind, namespace, name, change_type, body)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(revision as i64)
    .bind(kind.as_str())
    .bind(&key.namespace)
    .bind(&key.name)
    .bind(change.as_str())
    .bind(body)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl ObjectStore for PostgresStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Option<RawObject>> {
        let row: Option<(i64, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT resource_version, body
            FROM objects
            WHERE kind = $1 AND namespace = $2 AND name = $3
            "#,
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(version, body)| RawObject {
            key: key.clone(),
            version: version as u64,
            body,
        }))
    }

    async fn list(&self, kind: ObjectKind, namespace: &str) -> StoreResult<RawList> {
        // One snapshot for both the items and the revision they reflect
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let revision: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(revision), 0) FROM object_changes")
                .fetch_one(&mut *tx)
                .await?;

        let rows: Vec<(String, String, i64, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT namespace, name, resource_version, body
            FROM objects
            WHERE kind = $1 AND ($2 = '' OR namespace = $2)
            ORDER BY namespace, name
            "#,
        )
        .bind(kind.as_str())
        .bind(namespace)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RawList {
            items: rows
                .into_iter()
                .map(|(namespace, name, version, body)| RawObject {
                    key: ObjectKey::new(namespace, name),
                    version: version as u64,
                    body,
                })
                .collect(),
            revision: revision as u64,
        })
    }

    async fn create(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        body: serde_json::Value,
    ) -> StoreResult<u64> {
        let (mut tx, version) = self.begin_write().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO objects (kind, namespace, name, resource_version, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(version as i64)
        .bind(&body)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::AlreadyExists {
                kind,
                key: key.clone(),
            });
        }

        self.log_change(&mut tx, version, kind, ChangeType::Added, key, &body)
            .await?;
        tx.commit().await?;

        Ok(version)
    }

    async fn update(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        body: serde_json::Value,
        expected_version: u64,
    ) -> StoreResult<u64> {
        let (mut tx, version) = self.begin_write().await?;

        let updated = sqlx::query(
            r#"
            UPDATE objects
            SET resource_version = $1, body = $2
            WHERE kind = $3 AND namespace = $4 AND name = $5 AND resource_version = $6
            "#,
        )
        .bind(version as i64)
        .bind(&body)
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current = Self::current_version(&mut tx, kind, key).await?;
            tx.rollback().await?;
            return Err(match current {
                None => StoreError::NotFound {
                    kind,
                    key: key.clone(),
                },
                Some(actual) => StoreError::Conflict {
                    kind,
                    key: key.clone(),
                    expected: expected_version,
                    actual,
                },
            });
        }

        self.log_change(&mut tx, version, kind, ChangeType::Modified, key, &body)
            .await?;
        tx.commit().await?;

        Ok(version)
    }

    async fn delete(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<()> {
        let (mut tx, version) = self.begin_write().await?;

        let removed: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            DELETE FROM objects
            WHERE kind = $1 AND namespace = $2 AND name = $3
            RETURNING body
            "#,
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(body) = removed else {
            tx.rollback().await?;
            return Err(StoreError::NotFound {
                kind,
                key: key.clone(),
            });
        };

        self.log_change(&mut tx, version, kind, ChangeType::Deleted, key, &body)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn changes(&self, after: u64, limit: usize) -> StoreResult<Vec<RawChange>> {
        // The horizon and the rows must come from the same snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let horizon: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(revision), 0) FROM change_log_horizon")
                .fetch_one(&mut *tx)
                .await?;
        let horizon = horizon as u64;
        if after < horizon {
            tx.commit().await?;
            return Err(StoreError::Compacted { after, horizon });
        }

        let rows: Vec<(i64, String, String, String, String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT revision, kind, namespace, name, change_type, body
            FROM object_changes
            WHERE revision > $1
            ORDER BY revision
            LIMIT $2
            "#,
        )
        .bind(after as i64)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.into_iter()
            .map(|(revision, kind, namespace, name, change, body)| -> StoreResult<RawChange> {
                Ok(RawChange {
                    revision: revision as u64,
                    kind: kind.parse()?,
                    change: change.parse()?,
                    object: RawObject {
                        key: ObjectKey::new(namespace, name),
                        version: revision as u64,
                        body,
                    },
                })
            })
            .collect()
    }

    async fn wait_for_change(&self, _after: u64, timeout: Duration) {
        // The change log is polled; there is no notification channel
        tokio::time::sleep(timeout).await;
    }
}
