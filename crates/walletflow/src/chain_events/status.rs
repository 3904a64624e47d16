//! The persisted listener cursor and its row lock.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::chain_events::error::ListenerError;
use crate::db;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    /// Highest height whose events were fetched and dispatched.
    pub latest_height: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ListenerStatusRepo {
    pool: PgPool,
}

impl ListenerStatusRepo {
    const STATUS_ID: i16 = 1;

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock the status row for update, creating it at height 0 on first use.
    ///
    /// Does not wait: if another transaction holds the row this returns
    /// [`ListenerError::Locked`] immediately. The lock lasts until the
    /// returned guard is committed or dropped.
    pub async fn lock(&self) -> Result<LockedStatus, ListenerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chain_events_status (id, latest_height, created_at, updated_at)
            VALUES ($1, 0, now(), now())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(Self::STATUS_ID)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT latest_height, created_at, updated_at
            FROM chain_events_status
            WHERE id = $1
            FOR UPDATE NOWAIT
            "#,
        )
        .bind(Self::STATUS_ID)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if db::is_lock_not_available(&e) {
                ListenerError::Locked
            } else {
                ListenerError::Database(e)
            }
        })?;

        let latest_height: i64 = row.try_get("latest_height")?;
        let status = ListenerStatus {
            latest_height: latest_height.max(0) as u64,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        };

        Ok(LockedStatus {
            tx,
            original_height: status.latest_height,
            status,
        })
    }

    /// Unlocked read, for inspection only.
    pub async fn current(&self) -> Result<Option<ListenerStatus>, ListenerError> {
        let row = sqlx::query(
            r#"
            SELECT latest_height, created_at, updated_at
            FROM chain_events_status
            WHERE id = $1
            "#,
        )
        .bind(Self::STATUS_ID)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ListenerStatus, ListenerError> {
            let latest_height: i64 = row.try_get("latest_height")?;
            Ok(ListenerStatus {
                latest_height: latest_height.max(0) as u64,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }
}

/// A status row held under `FOR UPDATE`.
///
/// Dropping the guard without [`LockedStatus::commit`] rolls the
/// transaction back and leaves the stored height untouched.
pub struct LockedStatus {
    tx: Transaction<'static, Postgres>,
    original_height: u64,
    status: ListenerStatus,
}

impl LockedStatus {
    pub fn latest_height(&self) -> u64 {
        self.status.latest_height
    }

    pub fn set_latest_height(&mut self, height: u64) {
        self.status.latest_height = height;
    }

    pub fn status(&self) -> &ListenerStatus {
        &self.status
    }

    /// Persist the (possibly changed) height and release the lock.
    pub async fn commit(mut self) -> Result<ListenerStatus, ListenerError> {
        if self.status.latest_height != self.original_height {
            let height = i64::try_from(self.status.latest_height)
                .map_err(|_| ListenerError::HeightOutOfRange(self.status.latest_height))?;

            let updated_at: DateTime<Utc> = sqlx::query_scalar(
                r#"
                UPDATE chain_events_status
                SET latest_height = $2,
                    updated_at = now()
                WHERE id = $1
                RETURNING updated_at
                "#,
            )
            .bind(ListenerStatusRepo::STATUS_ID)
            .bind(height)
            .fetch_one(&mut *self.tx)
            .await?;

            self.status.updated_at = updated_at;
        }

        self.tx.commit().await?;
        Ok(self.status)
    }

    /// Release the lock without writing.
    pub async fn rollback(self) -> Result<(), ListenerError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
