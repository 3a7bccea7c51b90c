use sea_orm_migration::prelude::*;

/// Migration 3: chapter download queue and the pages fetched for each row.
///
/// - `downloads`: one row per chapter attempt, status driven by the orchestrator
/// - `downloaded_pages`: persisted page files, unique per (download, page)
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        // ── downloads table ───────────────────────────────────────────
        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS downloads (
                id UUID PRIMARY KEY,
                library_id UUID NOT NULL REFERENCES library_items(id) ON DELETE CASCADE,
                chapter_id VARCHAR(512) NOT NULL,
                chapter_number VARCHAR(64),
                extension_id VARCHAR(128) NOT NULL,
                status VARCHAR(20) NOT NULL
                    CHECK (status IN ('queued', 'downloading', 'completed', 'failed', 'cancelled')),
                progress INTEGER NOT NULL DEFAULT 0,
                total_pages INTEGER,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )",
        )
        .await?;

        // ── downloaded_pages table ────────────────────────────────────
        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS downloaded_pages (
                id UUID PRIMARY KEY,
                download_id UUID NOT NULL REFERENCES downloads(id) ON DELETE CASCADE,
                page_number INTEGER NOT NULL,
                source_url TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size BIGINT NOT NULL DEFAULT 0,
                downloaded_at TIMESTAMPTZ NOT NULL,
                UNIQUE(download_id, page_number)
            )",
        )
        .await?;

        // ── indexes ───────────────────────────────────────────────────
        db.execute_unprepared("CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status)")
            .await?;

        db.execute_unprepared(
            "CREATE INDEX IF NOT EXISTS idx_downloads_library ON downloads(library_id)",
        )
        .await?;

        db.execute_unprepared(
            "CREATE INDEX IF NOT EXISTS idx_downloads_created_at ON downloads(created_at)",
        )
        .await?;

        // at most one active download per chapter of a library item
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_downloads_active_chapter
             ON downloads(library_id, chapter_id)
             WHERE status IN ('queued', 'downloading')",
        )
        .await?;

        db.execute_unprepared(
            "CREATE INDEX IF NOT EXISTS idx_downloaded_pages_download
             ON downloaded_pages(download_id)",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared("DROP TABLE IF EXISTS downloaded_pages")
            .await?;
        db.execute_unprepared("DROP TABLE IF EXISTS downloads")
            .await?;
        Ok(())
    }
}
