//! System-wide settings. Currently just the maintenance-mode switch that
//! pauses job scheduling and chain event polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

#[async_trait]
pub trait MaintenanceMode: Send + Sync {
    async fn is_maintenance_mode(&self) -> bool;
}

/// In-process switch, shared by cloning.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceFlag(Arc<AtomicBool>);

impl MaintenanceFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MaintenanceMode for MaintenanceFlag {
    async fn is_maintenance_mode(&self) -> bool {
        self.get()
    }
}

/// Settings persisted in `system_settings`, shared by every replica.
#[derive(Clone)]
pub struct SystemRepo {
    pool: PgPool,
}

impl SystemRepo {
    const SETTINGS_ID: i16 = 1;

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn maintenance_mode(&self) -> anyhow::Result<bool> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT maintenance_mode FROM system_settings WHERE id = $1")
                .bind(Self::SETTINGS_ID)
                .fetch_optional(&self.pool)
                .await?;
        Ok(enabled.unwrap_or(false))
    }

    pub async fn set_maintenance_mode(&self, enabled: bool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (id, maintenance_mode, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (id) DO UPDATE
            SET maintenance_mode = EXCLUDED.maintenance_mode,
                updated_at = now()
            "#,
        )
        .bind(Self::SETTINGS_ID)
        .bind(enabled)
        .execute(&self.pool)
        .await?;

        tracing::info!(enabled, "maintenance mode updated");
        Ok(())
    }
}

#[async_trait]
impl MaintenanceMode for SystemRepo {
    async fn is_maintenance_mode(&self) -> bool {
        match self.maintenance_mode().await {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::warn!(error = %e, "could not read maintenance mode, assuming off");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flag_is_shared_between_clones() {
        let flag = MaintenanceFlag::default();
        let other = flag.clone();
        assert!(!flag.is_maintenance_mode().await);

        other.set(true);
        assert!(flag.is_maintenance_mode().await);
    }
}
