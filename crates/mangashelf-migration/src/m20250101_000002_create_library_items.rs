use sea_orm_migration::prelude::*;

/// Migration 2: the user's tracked manga, one row per (extension, manga).
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS library_items (
                id UUID PRIMARY KEY,
                manga_id VARCHAR(512) NOT NULL,
                extension_id VARCHAR(128) NOT NULL,
                title VARCHAR(1024) NOT NULL,
                cover_url VARCHAR(2048),
                status VARCHAR(20) NOT NULL DEFAULT 'reading',
                favorite BOOLEAN NOT NULL DEFAULT FALSE,
                date_added TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                last_updated TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(extension_id, manga_id)
            )",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared("DROP TABLE IF EXISTS library_items")
            .await?;
        Ok(())
    }
}
