use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let max_connections = std::env::var("WALLETFLOW_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(8)
        .clamp(2, 64);

    let acquire_timeout_secs = std::env::var("WALLETFLOW_DB_ACQUIRE_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10)
        .clamp(1, 60);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect(database_url)
        .await?;

    tracing::debug!(max_connections, acquire_timeout_secs, "database pool ready");

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}

/// Postgres SQLSTATE codes that mean "someone else holds the row right now".
///
/// 55P03 lock_not_available, 40P01 deadlock_detected, 40001 serialization_failure.
pub(crate) const LOCK_CONTENTION_CODES: [&str; 3] = ["55P03", "40P01", "40001"];

pub(crate) fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| LOCK_CONTENTION_CODES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}

pub(crate) fn is_lock_not_available(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("55P03"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_not_contention() {
        assert!(!is_lock_contention(&sqlx::Error::RowNotFound));
        assert!(!is_lock_contention(&sqlx::Error::PoolTimedOut));
        assert!(!is_lock_not_available(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn contention_codes_cover_nowait_deadlock_and_serialization() {
        for code in ["55P03", "40P01", "40001"] {
            assert!(LOCK_CONTENTION_CODES.contains(&code));
        }
        assert!(!LOCK_CONTENTION_CODES.contains(&"23505"));
    }
}
