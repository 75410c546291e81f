//! Full-text index over document page content.
//!
//! Pages live in `document_index`, one row per `(document_path,
//! page_number)`. `content_fts` is an FTS5 external-content table over
//! those rows and is rebuilt after every write, so the two never drift.
//!
//! Writes (indexing, removal, clearing) are serialized by an async mutex and
//! each runs in a single transaction. Reads go straight to the pool and may
//! run alongside a write under WAL.
//!
//! Queries are ranked with bm25 (negated so that higher is better). If the
//! FTS query fails, a `LIKE` scan over the raw pages answers instead with a
//! flat relevance of 1.0. Search never surfaces an error to the caller.

use marginalia_core::models::{format_timestamp, now};
use marginalia_core::text;
use marginalia_core::DocumentSearchResult;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn, Span};

use crate::db;
use crate::error::{Reported, Result};
use crate::migrate;

/// Characters of context kept either side of a match.
const SNIPPET_RADIUS: usize = 100;
/// Length of the leading excerpt used when the query is not found verbatim.
const FALLBACK_EXCERPT: usize = 200;
/// Queries remembered by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

pub struct SearchIndex {
    pool: SqlitePool,
    path: PathBuf,
    write_lock: Mutex<()>,
    history_limit: usize,
    span: Span,
}

impl SearchIndex {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_history(path, DEFAULT_HISTORY_LIMIT).await
    }

    pub async fn open_with_history(path: impl AsRef<Path>, history_limit: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let span = tracing::info_span!("search_index", db = %path.display());
        let pool = db::connect(&path).await?;
        migrate::migrate_search_index(&pool).await?;
        Ok(Self {
            pool,
            path,
            write_lock: Mutex::new(()),
            history_limit: history_limit.max(1),
            span,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════

    /// Replace everything indexed for `document_path` with `pages`. Page
    /// numbers are 1-based positions in `pages`; blank pages are skipped.
    #[instrument(parent = &self.span, skip(self, pages), fields(pages = pages.len()))]
    pub async fn index_document(&self, document_path: &str, pages: &[String]) -> bool {
        self.try_index_document(document_path, pages)
            .await
            .reported("index_document")
            .is_some()
    }

    pub(crate) async fn try_index_document(&self, document_path: &str, pages: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let indexed_at = format_timestamp(&now());

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM document_index WHERE document_path = ?")
            .bind(document_path)
            .execute(&mut *tx)
            .await?;

        let mut stored = 0usize;
        for (i, content) in pages.iter().enumerate() {
            if content.trim().is_empty() {
                continue;
            }
            sqlx::query(
                "INSERT INTO document_index (document_path, page_number, content, indexed_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(document_path)
            .bind(i as i64 + 1)
            .bind(content)
            .bind(&indexed_at)
            .execute(&mut *tx)
            .await?;
            stored += 1;
        }

        rebuild_fts(&mut tx).await?;
        tx.commit().await?;

        info!(document_path, pages = stored, "indexed document");
        Ok(())
    }

    /// Drop a document from the index. Returns false if it was not indexed.
    pub async fn remove_document(&self, document_path: &str) -> bool {
        let result: Result<u64> = async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self.pool.begin().await?;
            let removed = sqlx::query("DELETE FROM document_index WHERE document_path = ?")
                .bind(document_path)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            rebuild_fts(&mut tx).await?;
            tx.commit().await?;
            Ok(removed)
        }
        .await;
        result.reported("remove_document").is_some_and(|n| n > 0)
    }

    /// Remove every indexed page. Search history is kept.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn clear_index(&self) -> bool {
        let result: Result<()> = async {
            let _guard = self.write_lock.lock().await;
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM document_index")
                .execute(&mut *tx)
                .await?;
            rebuild_fts(&mut tx).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        let ok = result.reported("clear_index").is_some();
        if ok {
            info!("search index cleared");
        }
        ok
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Ranked search over page content. A blank query returns nothing and
    /// is not recorded in the history.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn search(&self, query: &str, max_results: usize) -> Vec<DocumentSearchResult> {
        let query = query.trim();
        let Some(expr) = text::fts_match_expression(query) else {
            return Vec::new();
        };
        self.add_to_history(query).await;

        match self.search_fts(&expr, query, max_results).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "full-text query failed, scanning pages instead");
                self.search_like(query, max_results)
                    .await
                    .reported("search")
                    .unwrap_or_default()
            }
        }
    }

    async fn search_fts(
        &self,
        expr: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<DocumentSearchResult>> {
        let rows = sqlx::query(
            r#"
            SELECT d.document_path, d.page_number, d.content, bm25(content_fts) AS score
            FROM content_fts
            JOIN document_index d ON d.id = content_fts.rowid
            WHERE content_fts MATCH ?
            ORDER BY score
            LIMIT ?
            "#,
        )
        .bind(expr)
        .bind(max_results as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let score: f64 = row.try_get("score")?;
            out.push(page_result(&row, query, -score)?);
        }
        Ok(out)
    }

    async fn search_like(&self, query: &str, max_results: usize) -> Result<Vec<DocumentSearchResult>> {
        let pattern = format!("%{}%", escape_like(query));
        let rows = sqlx::query(
            "SELECT document_path, page_number, content FROM document_index \
             WHERE content LIKE ? ESCAPE '\\' \
             ORDER BY document_path, page_number LIMIT ?",
        )
        .bind(pattern)
        .bind(max_results as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| page_result(row, query, 1.0)).collect()
    }

    /// Distinct indexed document paths, sorted.
    pub async fn get_indexed_documents(&self) -> Vec<String> {
        let result: Result<Vec<String>> = async {
            Ok(sqlx::query_scalar(
                "SELECT DISTINCT document_path FROM document_index ORDER BY document_path",
            )
            .fetch_all(&self.pool)
            .await?)
        }
        .await;
        result.reported("get_indexed_documents").unwrap_or_default()
    }

    pub async fn is_indexed(&self, document_path: &str) -> bool {
        self.page_count(document_path).await > 0
    }

    /// Number of pages stored for a document.
    pub async fn page_count(&self, document_path: &str) -> usize {
        let result: Result<i64> = async {
            Ok(
                sqlx::query_scalar("SELECT COUNT(*) FROM document_index WHERE document_path = ?")
                    .bind(document_path)
                    .fetch_one(&self.pool)
                    .await?,
            )
        }
        .await;
        result.reported("page_count").unwrap_or(0) as usize
    }

    // ═══════════════════════════════════════════════════════════════════
    // History
    // ═══════════════════════════════════════════════════════════════════

    /// Record a query as the most recent, keeping each query once and at
    /// most `history_limit` entries.
    async fn add_to_history(&self, query: &str) {
        let result: Result<()> = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM search_history WHERE query = ?")
                .bind(query)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO search_history (query, searched_at) VALUES (?, ?)")
                .bind(query)
                .bind(format_timestamp(&now()))
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "DELETE FROM search_history WHERE id NOT IN \
                 (SELECT id FROM search_history ORDER BY id DESC LIMIT ?)",
            )
            .bind(self.history_limit as i64)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        result.reported("add_to_history");
    }

    /// Recent queries, most recent first.
    pub async fn get_search_history(&self, limit: usize) -> Vec<String> {
        let result: Result<Vec<String>> = async {
            Ok(
                sqlx::query_scalar("SELECT query FROM search_history ORDER BY id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?,
            )
        }
        .await;
        result.reported("get_search_history").unwrap_or_default()
    }

    pub async fn clear_search_history(&self) -> bool {
        let result: Result<()> = async {
            sqlx::query("DELETE FROM search_history")
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .await;
        let ok = result.reported("clear_search_history").is_some();
        debug!(parent: &self.span, ok, "search history cleared");
        ok
    }
}

async fn rebuild_fts(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("INSERT INTO content_fts(content_fts) VALUES('rebuild')")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn page_result(row: &sqlx::sqlite::SqliteRow, query: &str, relevance: f64) -> Result<DocumentSearchResult> {
    let content: String = row.try_get("content")?;
    let page: i64 = row.try_get("page_number")?;
    let (snippet, match_offsets) = snippet_for(&content, query);
    Ok(DocumentSearchResult {
        document_path: row.try_get("document_path")?,
        page_number: page as u32,
        snippet,
        relevance,
        match_offsets,
    })
}

/// Snippet around the whole query, else around its first term that occurs,
/// else the head of the page.
fn snippet_for(content: &str, query: &str) -> (String, Vec<(usize, usize)>) {
    let candidates = std::iter::once(query).chain(query.split_whitespace());
    for candidate in candidates {
        if let Some(snippet) = text::extract_snippet(content, candidate, SNIPPET_RADIUS) {
            return (snippet.text, snippet.matches);
        }
    }
    (text::leading_excerpt(content, FALLBACK_EXCERPT), Vec::new())
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_index() -> (TempDir, SearchIndex) {
        let tmp = TempDir::new().unwrap();
        let index = SearchIndex::open(tmp.path().join("search_index.db"))
            .await
            .unwrap();
        (tmp, index)
    }

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_search_finds_page() {
        let (_tmp, index) = open_index().await;
        assert!(index.index_document("d.txt", &pages(&["alpha beta", "gamma delta"])).await);

        let hits = index.search("gamma", 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_number, 2);
        assert!(hits[0].snippet.contains("gamma"));
        assert!(hits[0].relevance > 0.0);
        let (s, e) = hits[0].match_offsets[0];
        assert_eq!(&hits[0].snippet[s..e], "gamma");
    }

    #[tokio::test]
    async fn test_reindex_replaces_pages() {
        let (_tmp, index) = open_index().await;
        assert!(index.index_document("d.txt", &pages(&["old words", "more old"])).await);
        assert!(index.index_document("d.txt", &pages(&["new words"])).await);

        assert!(index.search("old", 10).await.is_empty());
        assert_eq!(index.search("new", 10).await.len(), 1);
        assert_eq!(index.page_count("d.txt").await, 1);
    }

    #[tokio::test]
    async fn test_blank_pages_skipped_but_numbering_kept() {
        let (_tmp, index) = open_index().await;
        assert!(index.index_document("d.txt", &pages(&["one", "   ", "three"])).await);
        assert_eq!(index.page_count("d.txt").await, 2);
        assert_eq!(index.search("three", 5).await[0].page_number, 3);
    }

    #[tokio::test]
    async fn test_blank_query_returns_nothing() {
        let (_tmp, index) = open_index().await;
        assert!(index.index_document("d.txt", &pages(&["text"])).await);
        assert!(index.search("   ", 5).await.is_empty());
        assert!(index.get_search_history(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_like_fallback_when_fts_missing() {
        let (_tmp, index) = open_index().await;
        assert!(index.index_document("d.txt", &pages(&["needle here", "hay"])).await);
        sqlx::query("DROP TABLE content_fts")
            .execute(index.pool())
            .await
            .unwrap();

        let hits = index.search("needle", 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relevance, 1.0);
        assert_eq!(hits[0].page_number, 1);
    }

    #[tokio::test]
    async fn test_history_bounded_distinct_and_recent_first() {
        let tmp = TempDir::new().unwrap();
        let index = SearchIndex::open_with_history(tmp.path().join("s.db"), 5)
            .await
            .unwrap();
        for i in 0..8 {
            index.search(&format!("q{i}"), 1).await;
        }
        index.search("q3", 1).await;

        let history = index.get_search_history(100).await;
        assert_eq!(history, vec!["q3", "q7", "q6", "q5", "q4"]);
        assert!(index.clear_search_history().await);
        assert!(index.get_search_history(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_documents_listing_and_clear() {
        let (_tmp, index) = open_index().await;
        assert!(index.index_document("b.txt", &pages(&["x"])).await);
        assert!(index.index_document("a.txt", &pages(&["y"])).await);
        assert_eq!(index.get_indexed_documents().await, vec!["a.txt", "b.txt"]);

        assert!(index.remove_document("a.txt").await);
        assert!(!index.remove_document("a.txt").await);
        assert!(index.is_indexed("b.txt").await);

        assert!(index.clear_index().await);
        assert!(index.get_indexed_documents().await.is_empty());
        assert!(index.search("x", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_default_limit_keeps_latest_hundred() {
        let (_tmp, index) = open_index().await;
        for i in 0..120 {
            index.search(&format!("q{i}"), 1).await;
        }

        let history = index.get_search_history(500).await;
        assert_eq!(history.len(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.first().map(String::as_str), Some("q119"));
        assert_eq!(history.last().map(String::as_str), Some("q20"));
        assert_eq!(index.get_search_history(3).await, vec!["q119", "q118", "q117"]);
    }

    #[tokio::test]
    async fn test_clear_index_is_idempotent() {
        let (_tmp, index) = open_index().await;
        assert!(index.index_document("a.txt", &pages(&["words"])).await);

        assert!(index.clear_index().await);
        assert!(index.get_indexed_documents().await.is_empty());
        assert!(index.clear_index().await);
        assert!(index.get_indexed_documents().await.is_empty());
        assert!(index.search("words", 5).await.is_empty());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%_a\\b"), "100\\%\\_a\\\\b");
    }
}
