//! Schema setup for the annotation database and the search-index database.
//!
//! Both migrations are idempotent and run every time a store is opened.

use sqlx::SqlitePool;

use crate::error::Result;

/// Name of the FTS5 mirror over annotation search text.
pub const ANNOTATION_FTS: &str = "annotation_search";
/// Name of the FTS5 index over page content.
pub const CONTENT_FTS: &str = "content_fts";

pub async fn migrate_annotations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS annotations (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            document_path TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            data TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'default',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS annotation_categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            color TEXT NOT NULL DEFAULT '#808080',
            description TEXT NOT NULL DEFAULT '',
            parent_id TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            is_default INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            annotation_count INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(name, parent_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS annotation_category_assignments (
            annotation_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            assigned_by TEXT NOT NULL DEFAULT 'user',
            PRIMARY KEY (annotation_id, category_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    if !table_exists(pool, ANNOTATION_FTS).await? {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE annotation_search USING fts5(
                annotation_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_annotations_document ON annotations(document_path)",
        "CREATE INDEX IF NOT EXISTS idx_annotations_page ON annotations(document_path, page_number)",
        "CREATE INDEX IF NOT EXISTS idx_annotations_type ON annotations(type)",
        "CREATE INDEX IF NOT EXISTS idx_annotations_category ON annotations(category)",
        "CREATE INDEX IF NOT EXISTS idx_annotations_created ON annotations(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_categories_parent ON annotation_categories(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_assignments_category ON annotation_category_assignments(category_id)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}

pub async fn migrate_search_index(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_path TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            content TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            UNIQUE(document_path, page_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query TEXT NOT NULL,
            searched_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    if !table_exists(pool, CONTENT_FTS).await? {
        // External-content table: rows live in document_index and the FTS
        // index is rebuilt from it after every replace.
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE content_fts USING fts5(
                document_path UNINDEXED,
                page_number UNINDEXED,
                content,
                content='document_index',
                content_rowid='id'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_document_index_path ON document_index(document_path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_search_history_query ON search_history(query)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}
