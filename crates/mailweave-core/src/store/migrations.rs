//! Versioned schema migrations.
//!
//! The SQL files under `migrations/` are embedded at build time. sqlx
//! records every applied file with a checksum in `_sqlx_migrations`. A
//! recorded migration whose file changed, or a recorded version this build
//! does not know, means the database cannot be trusted and startup fails.

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::{Error, Result};

/// Migrations of the mail store.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Applies every pending migration of `migrator`, each in its own
/// transaction.
///
/// # Errors
///
/// Returns [`Error::MigrationChecksum`] if an applied migration changed,
/// [`Error::UnknownMigration`] if the database records a version missing
/// from `migrator`, or [`Error::Migrate`] if a migration fails to apply.
/// A failing migration leaves no trace of its statements.
pub async fn migrate(pool: &SqlitePool, migrator: &Migrator) -> Result<()> {
    migrator.run(pool).await.map_err(from_migrate_error)?;
    debug!("Schema up to date ({} migration(s))", migrator.iter().count());
    Ok(())
}

fn from_migrate_error(err: MigrateError) -> Error {
    match err {
        MigrateError::VersionMismatch(version) => Error::MigrationChecksum {
            version: version.to_string(),
        },
        MigrateError::VersionMissing(version) => Error::UnknownMigration(version.to_string()),
        other => Error::Migrate(other),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    const FIRST: &str = "CREATE TABLE one (id INTEGER PRIMARY KEY);";
    const SECOND: &str = "CREATE TABLE two (id INTEGER PRIMARY KEY);";

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn write(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join(name), sql).unwrap();
    }

    async fn migrator(dir: &Path) -> Migrator {
        Migrator::new(dir).await.unwrap()
    }

    async fn applied(pool: &SqlitePool) -> Vec<i64> {
        sqlx::query_scalar("SELECT version FROM _sqlx_migrations ORDER BY version")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_applies_in_version_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0002_second.sql", SECOND);
        write(dir.path(), "0001_first.sql", FIRST);

        let pool = pool().await;
        migrate(&pool, &migrator(dir.path()).await).await.unwrap();
        assert_eq!(applied(&pool).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reapply_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_first.sql", FIRST);
        let pool = pool().await;

        migrate(&pool, &migrator(dir.path()).await).await.unwrap();
        migrate(&pool, &migrator(dir.path()).await).await.unwrap();

        write(dir.path(), "0002_second.sql", SECOND);
        migrate(&pool, &migrator(dir.path()).await).await.unwrap();
        assert_eq!(applied(&pool).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_first.sql", FIRST);
        let pool = pool().await;
        migrate(&pool, &migrator(dir.path()).await).await.unwrap();

        write(
            dir.path(),
            "0001_first.sql",
            "CREATE TABLE one (id INTEGER PRIMARY KEY, extra TEXT);",
        );
        let err = migrate(&pool, &migrator(dir.path()).await)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MigrationChecksum { version } if version == "1"));
    }

    #[tokio::test]
    async fn test_unknown_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_first.sql", FIRST);
        write(dir.path(), "0002_second.sql", SECOND);
        let pool = pool().await;
        migrate(&pool, &migrator(dir.path()).await).await.unwrap();

        std::fs::remove_file(dir.path().join("0002_second.sql")).unwrap();
        let err = migrate(&pool, &migrator(dir.path()).await)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownMigration(version) if version == "2"));
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_first.sql", FIRST);
        write(
            dir.path(),
            "0002_broken.sql",
            "CREATE TABLE three (id INTEGER);\nNOT SQL;",
        );
        let pool = pool().await;

        let err = migrate(&pool, &migrator(dir.path()).await)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Migrate(_)));

        let tables: i64 =
            sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE name = 'three'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(tables, 0);
        assert_eq!(applied(&pool).await, vec![1]);
    }

    #[tokio::test]
    async fn test_store_schema_applies() {
        let pool = pool().await;
        migrate(&pool, &MIGRATOR).await.unwrap();

        let counter: i64 = sqlx::query_scalar("SELECT value FROM counter WHERE name = 'threadid'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(counter, 0);

        let readonly: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM pragma_table_info('mailbox') \
             WHERE name IN ('readonly', 'uidnext')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(readonly, 2);
    }
}
