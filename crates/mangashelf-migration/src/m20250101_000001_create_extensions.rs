use sea_orm_migration::prelude::*;

/// Migration 1: installed extension catalog.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS extensions (
                id VARCHAR(128) PRIMARY KEY,
                slug VARCHAR(128) NOT NULL UNIQUE,
                name VARCHAR(255) NOT NULL,
                version VARCHAR(50) NOT NULL,
                install_path VARCHAR(1024) NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                checksum VARCHAR(128),
                repo_source VARCHAR(1024),
                manifest JSONB NOT NULL,
                installed_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared("DROP TABLE IF EXISTS extensions")
            .await?;
        Ok(())
    }
}
