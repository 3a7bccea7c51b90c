pub use sea_orm_migration::prelude::*;

mod m20250101_000001_create_extensions;
mod m20250101_000002_create_library_items;
mod m20250101_000003_create_downloads;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_extensions::Migration),
            Box::new(m20250101_000002_create_library_items::Migration),
            Box::new(m20250101_000003_create_downloads::Migration),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm_migration::sea_orm::{ConnectionTrait, Database};

    #[tokio::test]
    async fn test_migrations_up_and_down_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let db = Database::connect(&url).await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        for table in ["extensions", "library_items", "downloads", "downloaded_pages"] {
            db.execute_unprepared(&format!("SELECT COUNT(*) FROM {table}"))
                .await
                .unwrap_or_else(|e| panic!("table {table} missing: {e}"));
        }

        Migrator::down(&db, None).await.unwrap();
        assert!(db
            .execute_unprepared("SELECT COUNT(*) FROM downloads")
            .await
            .is_err());
    }
}
