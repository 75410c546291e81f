//! Durable storage for annotations and categories.
//!
//! # Layout
//!
//! Each annotation is one row in `annotations`: the envelope fields are
//! plain indexed columns and the variant payload is a tagged JSON blob in
//! `data`. A parallel FTS5 table, `annotation_search`, mirrors each
//! annotation's searchable text so that queries can be ranked with bm25.
//!
//! Categories live in `annotation_categories` as a flat table with
//! `parent_id` links. Every annotation has a primary category (the
//! `category` column); `annotation_category_assignments` records any
//! additional links made through the category manager.
//!
//! # Failure handling
//!
//! Public methods never return raw storage errors. Each one runs an inner
//! fallible operation and, on error, logs it and returns `false`, `None`,
//! or an empty collection. Rows that fail to decode during a batch read are
//! skipped with a warning.
//!
//! # Writes
//!
//! A save is a single transaction: upsert the row, replace its FTS entry,
//! and recompute `annotation_count` for the categories it touched.

use marginalia_core::models::{format_timestamp, parse_timestamp, AnnotationStats};
use marginalia_core::text;
use marginalia_core::thread::NoteArena;
use marginalia_core::{
    Annotation, AnnotationFilter, AnnotationKind, AnnotationSearchResult, AnnotationType,
    Category, ValidationError, DEFAULT_CATEGORY_ID,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::str::FromStr;
use tracing::{debug, info, instrument, warn, Span};

use crate::db;
use crate::error::{Error, Reported, Result};
use crate::migrate;

/// Characters of context kept either side of a match.
const SNIPPET_RADIUS: usize = 50;
/// Length of the display-text excerpt used when the query is not found.
const FALLBACK_EXCERPT: usize = 100;

const ANNOTATION_COLUMNS: &str =
    "a.id, a.type, a.document_path, a.page_number, a.data, a.category, a.created_at, a.updated_at";

const CATEGORY_COLUMNS: &str = "id, name, color, description, parent_id, sort_order, is_default, \
     is_active, annotation_count, metadata, created_at, updated_at";

/// SQLite-backed annotation and category store.
pub struct AnnotationStore {
    pool: SqlitePool,
    path: PathBuf,
    /// Bumped after every committed write that can change a category row
    /// or an `annotation_count`.
    generation: AtomicU64,
    span: Span,
}

impl AnnotationStore {
    /// Open (creating if needed) the annotation database at `path`, run
    /// migrations, and seed the default categories into an empty table.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let span = tracing::info_span!("annotation_store", db = %path.display());
        let pool = db::connect(&path).await?;
        migrate::migrate_annotations(&pool).await?;
        let store = Self {
            pool,
            path,
            generation: AtomicU64::new(0),
            span,
        };
        store.seed_default_categories().await?;
        Ok(store)
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

    /// Write generation of the category data. Readers holding a snapshot
    /// compare it to detect writes made since they loaded.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Annotations
    // ═══════════════════════════════════════════════════════════════════

    /// Insert or replace an annotation. Returns `false` if it fails
    /// validation or the write fails.
    #[instrument(parent = &self.span, skip_all, fields(id = %annotation.id))]
    pub async fn save(&self, annotation: &Annotation) -> bool {
        self.try_save(annotation).await.reported("save").is_some()
    }

    pub(crate) async fn try_save(&self, annotation: &Annotation) -> Result<()> {
        let category = self.prepare(annotation).await?;
        let mut tx = self.pool.begin().await?;
        write_in_tx(&mut tx, annotation, &category).await?;
        tx.commit().await?;
        self.bump_generation();
        debug!(id = %annotation.id, kind = %annotation.annotation_type(), "saved annotation");
        Ok(())
    }

    /// Save `created` and delete `removed` in one transaction. Every new
    /// annotation is validated before anything is written.
    pub(crate) async fn try_replace(
        &self,
        created: &[Annotation],
        removed: &[String],
    ) -> Result<()> {
        let mut prepared = Vec::with_capacity(created.len());
        for annotation in created {
            prepared.push((annotation, self.prepare(annotation).await?));
        }

        let mut tx = self.pool.begin().await?;
        for (annotation, category) in &prepared {
            write_in_tx(&mut tx, annotation, category).await?;
        }
        for id in removed {
            if !delete_in_tx(&mut tx, id).await? {
                return Err(Error::NotFound(format!("annotation {id}")));
            }
        }
        tx.commit().await?;
        self.bump_generation();
        debug!(created = created.len(), removed = removed.len(), "replaced annotations");
        Ok(())
    }

    /// Validate an annotation and resolve the category it will be stored
    /// under.
    async fn prepare(&self, annotation: &Annotation) -> Result<String> {
        annotation.validate()?;
        if let Some(parent_id) = annotation.parent_note_id() {
            self.check_note_parent(annotation, parent_id).await?;
        }

        let category = self.resolve_category(&annotation.category).await?;
        if category != annotation.category {
            warn!(
                id = %annotation.id,
                requested = %annotation.category,
                "category does not exist, storing under default"
            );
        }
        Ok(category)
    }

    /// Note replies must point at an existing note of the same document and
    /// must not point into their own subtree.
    async fn check_note_parent(&self, note: &Annotation, parent_id: &str) -> Result<()> {
        let parent = self
            .try_load(parent_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("parent note {parent_id}")))?;
        if parent.as_note().is_none() {
            return Err(ValidationError::Other(format!("{parent_id} is not a note")).into());
        }
        if parent.document_path != note.document_path {
            return Err(ValidationError::ThreadDocumentMismatch {
                parent: parent_id.to_string(),
            }
            .into());
        }
        let notes = self
            .try_load_many(&note.document_path, None, Some(AnnotationType::Note))
            .await?;
        NoteArena::new(&notes).check_parent(note, parent_id)?;
        Ok(())
    }

    /// The id itself if it names a stored category, else the default.
    async fn resolve_category(&self, id: &str) -> Result<String> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM annotation_categories WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(if exists {
            id.to_string()
        } else {
            DEFAULT_CATEGORY_ID.to_string()
        })
    }

    pub async fn load(&self, id: &str) -> Option<Annotation> {
        self.try_load(id).await.reported("load").flatten()
    }

    pub(crate) async fn try_load(&self, id: &str) -> Result<Option<Annotation>> {
        let row = sqlx::query(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations a WHERE a.id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_annotation).transpose()
    }

    /// Annotations of one document, optionally narrowed to a page and a
    /// variant, ordered by `(page_number, created_at)`.
    pub async fn load_many(
        &self,
        document_path: &str,
        page: Option<u32>,
        kind: Option<AnnotationType>,
    ) -> Vec<Annotation> {
        self.try_load_many(document_path, page, kind)
            .await
            .reported("load_many")
            .unwrap_or_default()
    }

    pub(crate) async fn try_load_many(
        &self,
        document_path: &str,
        page: Option<u32>,
        kind: Option<AnnotationType>,
    ) -> Result<Vec<Annotation>> {
        let filter = AnnotationFilter {
            document_path: Some(document_path.to_string()),
            annotation_type: kind,
            page_range: page.map(|p| (p, p)),
            ..Default::default()
        };
        self.fetch_filtered(&filter, "a.page_number, a.created_at", None)
            .await
    }

    /// Every annotation matching `filter`, oldest first.
    pub async fn load_filtered(&self, filter: &AnnotationFilter) -> Vec<Annotation> {
        self.fetch_filtered(filter, "a.created_at", None)
            .await
            .reported("load_filtered")
            .unwrap_or_default()
    }

    async fn fetch_filtered(
        &self,
        filter: &AnnotationFilter,
        order_by: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Annotation>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations a WHERE 1=1"
        ));
        push_filters(&mut qb, filter);
        qb.push(format!(" ORDER BY {order_by}"));
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(decode_rows(&rows))
    }

    #[instrument(parent = &self.span, skip(self))]
    pub async fn delete(&self, id: &str) -> bool {
        self.try_delete(id).await.reported("delete").is_some()
    }

    pub(crate) async fn try_delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_in_tx(&mut tx, id).await?;
        tx.commit().await?;
        self.bump_generation();
        if deleted {
            Ok(())
        } else {
            Err(Error::NotFound(format!("annotation {id}")))
        }
    }

    /// Delete several annotations in one transaction, in the given order.
    /// Ids that are already gone are ignored.
    pub(crate) async fn try_delete_all(&self, ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut count = 0;
        for id in ids {
            if delete_in_tx(&mut tx, id).await? {
                count += 1;
            }
        }
        tx.commit().await?;
        self.bump_generation();
        Ok(count)
    }

    /// Remove every annotation attached to a document. Returns how many
    /// were deleted.
    pub async fn delete_document(&self, document_path: &str) -> usize {
        let ids = self.try_document_ids(document_path).await;
        let result = match ids {
            Ok(ids) => self.try_delete_all(&ids).await,
            Err(e) => Err(e),
        };
        result.reported("delete_document").unwrap_or(0)
    }

    async fn try_document_ids(&self, document_path: &str) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM annotations WHERE document_path = ?")
                .bind(document_path)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Distinct document paths that have at least one annotation.
    pub async fn document_paths(&self) -> Vec<String> {
        let result: Result<Vec<String>> = async {
            Ok(sqlx::query_scalar(
                "SELECT DISTINCT document_path FROM annotations ORDER BY document_path",
            )
            .fetch_all(&self.pool)
            .await?)
        }
        .await;
        result.reported("document_paths").unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Search
    // ═══════════════════════════════════════════════════════════════════

    /// Search annotations.
    ///
    /// A non-empty query goes through the FTS5 mirror, ranked by bm25 with
    /// higher scores better. If that query fails, a substring scan over the
    /// stored annotations is used instead and every hit scores 1.0. An
    /// empty query returns the newest annotations matching `filter`.
    #[instrument(parent = &self.span, skip(self, filter))]
    pub async fn search(
        &self,
        query: &str,
        filter: &AnnotationFilter,
        limit: usize,
    ) -> Vec<AnnotationSearchResult> {
        self.try_search(query, filter, limit)
            .await
            .reported("search")
            .unwrap_or_default()
    }

    async fn try_search(
        &self,
        query: &str,
        filter: &AnnotationFilter,
        limit: usize,
    ) -> Result<Vec<AnnotationSearchResult>> {
        let query = query.trim();
        let Some(expr) = text::fts_match_expression(query) else {
            let rows = self
                .fetch_filtered(filter, "a.created_at DESC", Some(limit))
                .await?;
            return Ok(rows
                .into_iter()
                .map(|a| {
                    let excerpt = text::leading_excerpt(&a.display_text(), FALLBACK_EXCERPT);
                    AnnotationSearchResult {
                        annotation: a,
                        relevance_score: 1.0,
                        context_snippet: excerpt,
                        match_highlights: Vec::new(),
                    }
                })
                .collect());
        };

        match self.search_indexed(&expr, query, filter, limit).await {
            Ok(results) => Ok(results),
            Err(e) => {
                warn!(error = %e, "indexed annotation search failed, scanning instead");
                self.search_scan(query, filter, limit).await
            }
        }
    }

    async fn search_indexed(
        &self,
        expr: &str,
        query: &str,
        filter: &AnnotationFilter,
        limit: usize,
    ) -> Result<Vec<AnnotationSearchResult>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ANNOTATION_COLUMNS}, bm25(annotation_search) AS score \
             FROM annotation_search JOIN annotations a ON a.id = annotation_search.annotation_id \
             WHERE annotation_search MATCH "
        ));
        qb.push_bind(expr.to_string());
        push_filters(&mut qb, filter);
        qb.push(" ORDER BY score LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_annotation(row) {
                Ok(annotation) => {
                    let score: f64 = row.try_get("score")?;
                    out.push(search_result(annotation, query, -score));
                }
                Err(e) => warn!(error = %e, "skipping corrupt annotation row"),
            }
        }
        Ok(out)
    }

    async fn search_scan(
        &self,
        query: &str,
        filter: &AnnotationFilter,
        limit: usize,
    ) -> Result<Vec<AnnotationSearchResult>> {
        let needle = query.replace('"', "");
        let candidates = self.fetch_filtered(filter, "a.created_at DESC", None).await?;
        Ok(candidates
            .into_iter()
            .filter(|a| text::find_case_insensitive(&a.search_text(), &needle).is_some())
            .take(limit)
            .map(|a| search_result(a, &needle, 1.0))
            .collect())
    }

    /// Totals by variant, for one document or the whole store.
    pub async fn stats(&self, document_path: Option<&str>) -> AnnotationStats {
        self.try_stats(document_path)
            .await
            .reported("stats")
            .unwrap_or_else(|| AnnotationStats {
                document_path: document_path.map(str::to_string),
                ..Default::default()
            })
    }

    async fn try_stats(&self, document_path: Option<&str>) -> Result<AnnotationStats> {
        let rows = match document_path {
            Some(doc) => {
                sqlx::query(
                    "SELECT type, COUNT(*) AS n FROM annotations WHERE document_path = ? GROUP BY type",
                )
                .bind(doc)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT type, COUNT(*) AS n FROM annotations GROUP BY type")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut stats = AnnotationStats {
            document_path: document_path.map(str::to_string),
            ..Default::default()
        };
        for row in rows {
            let kind: String = row.try_get("type")?;
            let n: i64 = row.try_get("n")?;
            stats.total += n as u64;
            stats.by_type.insert(kind, n as u64);
        }
        Ok(stats)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Categories
    // ═══════════════════════════════════════════════════════════════════

    async fn seed_default_categories(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM annotation_categories")
            .fetch_one(&self.pool)
            .await?;
        let seeds = marginalia_core::defaults::default_categories();
        let mut tx = self.pool.begin().await?;
        for category in &seeds {
            // An existing table only needs the fallback category guaranteed.
            if count > 0 && category.id != DEFAULT_CATEGORY_ID {
                continue;
            }
            insert_category_if_missing(&mut tx, category).await?;
        }
        tx.commit().await?;
        self.bump_generation();
        if count == 0 {
            info!(count = seeds.len(), "seeded default categories");
        }
        Ok(())
    }

    /// Insert or replace a category. `annotation_count` is always
    /// recomputed from the annotations table.
    pub async fn save_category(&self, category: &Category) -> bool {
        self.try_save_category(category)
            .await
            .reported("save_category")
            .is_some()
    }

    pub(crate) async fn try_save_category(&self, category: &Category) -> Result<()> {
        category.validate()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO annotation_categories
                (id, name, color, description, parent_id, sort_order, is_default, is_active,
                 annotation_count, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                color = excluded.color,
                description = excluded.description,
                parent_id = excluded.parent_id,
                sort_order = excluded.sort_order,
                is_default = excluded.is_default,
                is_active = excluded.is_active,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&category.id)
        .bind(&category.name)
        .bind(&category.color)
        .bind(&category.description)
        .bind(&category.parent_id)
        .bind(category.sort_order)
        .bind(category.is_default)
        .bind(category.is_active)
        .bind(serde_json::to_string(&category.metadata)?)
        .bind(format_timestamp(&category.created_at))
        .bind(format_timestamp(&category.updated_at))
        .execute(&mut *tx)
        .await?;
        recount(&mut tx, &category.id).await?;
        tx.commit().await?;
        self.bump_generation();
        Ok(())
    }

    pub async fn load_category(&self, id: &str) -> Option<Category> {
        self.try_load_category(id)
            .await
            .reported("load_category")
            .flatten()
    }

    pub(crate) async fn try_load_category(&self, id: &str) -> Result<Option<Category>> {
        let row = sqlx::query(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM annotation_categories WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_category).transpose()
    }

    /// All categories ordered by `(sort_order, name)`.
    pub async fn load_categories(&self, include_inactive: bool) -> Vec<Category> {
        self.try_load_categories(include_inactive)
            .await
            .reported("load_categories")
            .unwrap_or_default()
    }

    pub(crate) async fn try_load_categories(&self, include_inactive: bool) -> Result<Vec<Category>> {
        let sql = if include_inactive {
            format!("SELECT {CATEGORY_COLUMNS} FROM annotation_categories ORDER BY sort_order, name")
        } else {
            format!(
                "SELECT {CATEGORY_COLUMNS} FROM annotation_categories \
                 WHERE is_active = 1 ORDER BY sort_order, name"
            )
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_category(row) {
                Ok(c) => out.push(c),
                Err(e) => warn!(error = %e, "skipping corrupt category row"),
            }
        }
        Ok(out)
    }

    /// Delete a category.
    ///
    /// Its children move up to its own parent, its annotations and links
    /// move to `reassign_to` (or the default category), and the target's
    /// count is recomputed. Default categories are refused.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn delete_category(&self, id: &str, reassign_to: Option<&str>) -> bool {
        self.try_delete_category(id, reassign_to)
            .await
            .reported("delete_category")
            .is_some()
    }

    pub(crate) async fn try_delete_category(&self, id: &str, reassign_to: Option<&str>) -> Result<()> {
        let category = self
            .try_load_category(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("category {id}")))?;
        if category.is_default {
            return Err(ValidationError::ProtectedCategory(id.to_string()).into());
        }
        let target = reassign_to.unwrap_or(DEFAULT_CATEGORY_ID);
        if target == id {
            return Err(ValidationError::Other(
                "cannot reassign a category's annotations to itself".to_string(),
            )
            .into());
        }
        if self.try_load_category(target).await?.is_none() {
            return Err(Error::NotFound(format!("reassignment target {target}")));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE annotation_categories SET parent_id = ? WHERE parent_id = ?")
            .bind(&category.parent_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let moved = sqlx::query("UPDATE annotations SET category = ? WHERE category = ?")
            .bind(target)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "INSERT OR IGNORE INTO annotation_category_assignments \
             (annotation_id, category_id, assigned_at, assigned_by) \
             SELECT annotation_id, ?, assigned_at, assigned_by \
             FROM annotation_category_assignments WHERE category_id = ?",
        )
        .bind(target)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM annotation_category_assignments WHERE category_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM annotation_categories WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        recount(&mut tx, target).await?;
        tx.commit().await?;
        self.bump_generation();

        info!(id, target, moved, "deleted category");
        Ok(())
    }

    /// Link an annotation to a category and make it the primary one.
    pub async fn assign_category(&self, annotation_id: &str, category_id: &str) -> bool {
        self.try_assign_category(annotation_id, category_id)
            .await
            .reported("assign_category")
            .is_some()
    }

    pub(crate) async fn try_assign_category(
        &self,
        annotation_id: &str,
        category_id: &str,
    ) -> Result<()> {
        if self.try_load_category(category_id).await?.is_none() {
            return Err(Error::NotFound(format!("category {category_id}")));
        }
        let mut tx = self.pool.begin().await?;
        let previous: Option<String> =
            sqlx::query_scalar("SELECT category FROM annotations WHERE id = ?")
                .bind(annotation_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(previous) = previous else {
            return Err(Error::NotFound(format!("annotation {annotation_id}")));
        };

        sqlx::query(
            "INSERT INTO annotation_category_assignments (annotation_id, category_id, assigned_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(annotation_id, category_id) DO UPDATE SET assigned_at = excluded.assigned_at",
        )
        .bind(annotation_id)
        .bind(category_id)
        .bind(format_timestamp(&marginalia_core::models::now()))
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE annotations SET category = ? WHERE id = ?")
            .bind(category_id)
            .bind(annotation_id)
            .execute(&mut *tx)
            .await?;
        recount(&mut tx, category_id).await?;
        if previous != category_id {
            recount(&mut tx, &previous).await?;
        }
        tx.commit().await?;
        self.bump_generation();
        Ok(())
    }

    /// Drop a link. If it was the annotation's primary category, the most
    /// recent remaining link (or the default category) takes its place.
    pub async fn remove_category_assignment(&self, annotation_id: &str, category_id: &str) -> bool {
        self.try_remove_category_assignment(annotation_id, category_id)
            .await
            .reported("remove_category_assignment")
            .is_some()
    }

    async fn try_remove_category_assignment(
        &self,
        annotation_id: &str,
        category_id: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM annotation_category_assignments WHERE annotation_id = ? AND category_id = ?",
        )
        .bind(annotation_id)
        .bind(category_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(Error::NotFound(format!(
                "assignment {annotation_id} -> {category_id}"
            )));
        }

        let primary: Option<String> =
            sqlx::query_scalar("SELECT category FROM annotations WHERE id = ?")
                .bind(annotation_id)
                .fetch_optional(&mut *tx)
                .await?;
        if primary.as_deref() == Some(category_id) {
            let replacement: Option<String> = sqlx::query_scalar(
                "SELECT category_id FROM annotation_category_assignments \
                 WHERE annotation_id = ? ORDER BY assigned_at DESC LIMIT 1",
            )
            .bind(annotation_id)
            .fetch_optional(&mut *tx)
            .await?;
            let replacement = replacement.unwrap_or_else(|| DEFAULT_CATEGORY_ID.to_string());
            sqlx::query("UPDATE annotations SET category = ? WHERE id = ?")
                .bind(&replacement)
                .bind(annotation_id)
                .execute(&mut *tx)
                .await?;
            recount(&mut tx, &replacement).await?;
        }
        recount(&mut tx, category_id).await?;
        tx.commit().await?;
        self.bump_generation();
        Ok(())
    }

    /// Categories linked to an annotation, its primary category first.
    pub async fn annotation_categories(&self, annotation_id: &str) -> Vec<Category> {
        self.try_annotation_categories(annotation_id)
            .await
            .reported("annotation_categories")
            .unwrap_or_default()
    }

    async fn try_annotation_categories(&self, annotation_id: &str) -> Result<Vec<Category>> {
        let rows = sqlx::query(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM annotation_categories WHERE id IN ( \
                 SELECT category FROM annotations WHERE id = ? \
                 UNION SELECT category_id FROM annotation_category_assignments WHERE annotation_id = ?) \
             ORDER BY sort_order, name"
        ))
        .bind(annotation_id)
        .bind(annotation_id)
        .fetch_all(&self.pool)
        .await?;

        let primary: Option<String> =
            sqlx::query_scalar("SELECT category FROM annotations WHERE id = ?")
                .bind(annotation_id)
                .fetch_optional(&self.pool)
                .await?;

        let mut out: Vec<Category> = rows.iter().filter_map(|r| decode_category(r).ok()).collect();
        if let Some(primary) = primary {
            if let Some(pos) = out.iter().position(|c| c.id == primary) {
                let c = out.remove(pos);
                out.insert(0, c);
            }
        }
        Ok(out)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Backup / restore
    // ═══════════════════════════════════════════════════════════════════

    /// Write a consistent snapshot of the database to `dest`, replacing any
    /// existing file.
    #[instrument(parent = &self.span, skip(self), fields(dest = %dest.display()))]
    pub async fn backup(&self, dest: &Path) -> bool {
        self.try_backup(dest).await.reported("backup").is_some()
    }

    async fn try_backup(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        sqlx::query("VACUUM INTO ?")
            .bind(dest.display().to_string())
            .execute(&self.pool)
            .await?;
        info!(dest = %dest.display(), "annotation database backed up");
        Ok(())
    }

    /// Replace every table's contents with those of a snapshot written by
    /// [`backup`](Self::backup). The swap is a single transaction.
    #[instrument(parent = &self.span, skip(self), fields(src = %src.display()))]
    pub async fn restore(&self, src: &Path) -> bool {
        self.try_restore(src).await.reported("restore").is_some()
    }

    async fn try_restore(&self, src: &Path) -> Result<()> {
        if !src.is_file() {
            return Err(Error::NotFound(format!("backup file {}", src.display())));
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("ATTACH DATABASE ? AS snapshot")
            .bind(src.display().to_string())
            .execute(&mut *conn)
            .await?;
        let copied = copy_from_snapshot(&mut conn).await;
        sqlx::query("DETACH DATABASE snapshot")
            .execute(&mut *conn)
            .await?;
        copied?;
        self.bump_generation();
        info!(src = %src.display(), "annotation database restored");
        Ok(())
    }
}

async fn copy_from_snapshot(conn: &mut SqliteConnection) -> Result<()> {
    let mut tx = conn.begin().await?;
    for table in [
        "annotations",
        "annotation_categories",
        "annotation_category_assignments",
    ] {
        sqlx::query(&format!("DELETE FROM main.{table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("INSERT INTO main.{table} SELECT * FROM snapshot.{table}"))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM main.annotation_search")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO main.annotation_search (annotation_id, content) \
         SELECT annotation_id, content FROM snapshot.annotation_search",
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Upsert one annotation row, replace its FTS entry, and fix the counts of
/// the categories it moved between.
async fn write_in_tx(
    conn: &mut SqliteConnection,
    annotation: &Annotation,
    category: &str,
) -> Result<()> {
    let data = serde_json::to_string(&annotation.kind)?;
    let search_text = annotation.search_text();

    let previous: Option<String> =
        sqlx::query_scalar("SELECT category FROM annotations WHERE id = ?")
            .bind(&annotation.id)
            .fetch_optional(&mut *conn)
            .await?;

    sqlx::query(
        r#"
        INSERT INTO annotations (id, type, document_path, page_number, data, category, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            type = excluded.type,
            document_path = excluded.document_path,
            page_number = excluded.page_number,
            data = excluded.data,
            category = excluded.category,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&annotation.id)
    .bind(annotation.annotation_type().as_str())
    .bind(&annotation.document_path)
    .bind(annotation.page_number as i64)
    .bind(&data)
    .bind(category)
    .bind(format_timestamp(&annotation.created_at))
    .bind(format_timestamp(&annotation.updated_at))
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM annotation_search WHERE annotation_id = ?")
        .bind(&annotation.id)
        .execute(&mut *conn)
        .await?;
    if !search_text.is_empty() {
        sqlx::query("INSERT INTO annotation_search (annotation_id, content) VALUES (?, ?)")
            .bind(&annotation.id)
            .bind(&search_text)
            .execute(&mut *conn)
            .await?;
    }

    recount(conn, category).await?;
    if let Some(prev) = previous.filter(|p| *p != category) {
        recount(conn, &prev).await?;
    }
    Ok(())
}

/// Delete one annotation with its FTS entry and links, then fix the count
/// of the category it belonged to. Returns whether a row was removed.
async fn delete_in_tx(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let category: Option<String> =
        sqlx::query_scalar("SELECT category FROM annotations WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(category) = category else {
        return Ok(false);
    };
    let linked: Vec<String> = sqlx::query_scalar(
        "SELECT category_id FROM annotation_category_assignments WHERE annotation_id = ?",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM annotations WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM annotation_search WHERE annotation_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM annotation_category_assignments WHERE annotation_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    recount(conn, &category).await?;
    for other in linked.iter().filter(|c| **c != category) {
        recount(conn, other).await?;
    }
    Ok(true)
}

/// Recompute a category's `annotation_count` from its primary members.
async fn recount(conn: &mut SqliteConnection, category_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE annotation_categories \
         SET annotation_count = (SELECT COUNT(*) FROM annotations WHERE category = ?) \
         WHERE id = ?",
    )
    .bind(category_id)
    .bind(category_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_category_if_missing(conn: &mut SqliteConnection, category: &Category) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO annotation_categories
            (id, name, color, description, parent_id, sort_order, is_default, is_active,
             annotation_count, metadata, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, '{}', ?, ?)
        "#,
    )
    .bind(&category.id)
    .bind(&category.name)
    .bind(&category.color)
    .bind(&category.description)
    .bind(&category.parent_id)
    .bind(category.sort_order)
    .bind(category.is_default)
    .bind(category.is_active)
    .bind(format_timestamp(&category.created_at))
    .bind(format_timestamp(&category.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AnnotationFilter) {
    if let Some(doc) = &filter.document_path {
        qb.push(" AND a.document_path = ").push_bind(doc.clone());
    }
    if let Some(kind) = filter.annotation_type {
        qb.push(" AND a.type = ").push_bind(kind.as_str());
    }
    if let Some(category) = &filter.category {
        qb.push(" AND a.category = ").push_bind(category.clone());
    }
    if let Some(from) = &filter.date_from {
        qb.push(" AND a.created_at >= ").push_bind(format_timestamp(from));
    }
    if let Some(to) = &filter.date_to {
        qb.push(" AND a.created_at <= ").push_bind(format_timestamp(to));
    }
    if let Some((lo, hi)) = filter.page_range {
        qb.push(" AND a.page_number BETWEEN ")
            .push_bind(lo as i64)
            .push(" AND ")
            .push_bind(hi as i64);
    }
}

fn search_result(annotation: Annotation, query: &str, relevance: f64) -> AnnotationSearchResult {
    let (context_snippet, match_highlights) = context_for(&annotation, query);
    AnnotationSearchResult {
        annotation,
        relevance_score: relevance,
        context_snippet,
        match_highlights,
    }
}

/// Snippet around the whole query if it occurs verbatim, else around the
/// first of its terms that does, else the head of the display text.
fn context_for(annotation: &Annotation, query: &str) -> (String, Vec<(usize, usize)>) {
    let haystack = annotation.search_text();
    let query = query.replace('"', "");
    let candidates = std::iter::once(query.as_str()).chain(query.split_whitespace());
    for candidate in candidates {
        if let Some(snippet) = text::extract_snippet(&haystack, candidate, SNIPPET_RADIUS) {
            return (snippet.text, snippet.matches);
        }
    }
    (
        text::leading_excerpt(&annotation.display_text(), FALLBACK_EXCERPT),
        Vec::new(),
    )
}

fn decode_rows(rows: &[SqliteRow]) -> Vec<Annotation> {
    rows.iter()
        .filter_map(|row| match decode_annotation(row) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(error = %e, "skipping corrupt annotation row");
                None
            }
        })
        .collect()
}

fn decode_annotation(row: &SqliteRow) -> Result<Annotation> {
    let id: String = row.try_get("id")?;
    let kind_column: String = row.try_get("type")?;
    let data: String = row.try_get("data")?;
    let kind: AnnotationKind = serde_json::from_str(&data)?;

    let expected = AnnotationType::from_str(&kind_column)?;
    if kind.annotation_type() != expected {
        return Err(Error::corrupt(format!(
            "annotation {id}: type column {kind_column} disagrees with payload"
        )));
    }

    let page: i64 = row.try_get("page_number")?;
    let page_number = u32::try_from(page)
        .map_err(|_| Error::corrupt(format!("annotation {id}: bad page number {page}")))?;

    Ok(Annotation {
        document_path: row.try_get("document_path")?,
        page_number,
        category: row.try_get("category")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
        kind,
        id,
    })
}

fn decode_category(row: &SqliteRow) -> Result<Category> {
    let metadata: String = row.try_get("metadata")?;
    Ok(Category {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        color: row.try_get("color")?,
        description: row.try_get("description")?,
        parent_id: row.try_get("parent_id")?,
        sort_order: row.try_get("sort_order")?,
        is_active: row.try_get("is_active")?,
        is_default: row.try_get("is_default")?,
        annotation_count: row.try_get("annotation_count")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.try_get(column)?;
    parse_timestamp(&raw).ok_or_else(|| Error::corrupt(format!("bad timestamp in {column}: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::{Bookmark, Highlight, HighlightColor, Note, Point, TextSelection};
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, AnnotationStore) {
        let tmp = TempDir::new().unwrap();
        let store = AnnotationStore::open(tmp.path().join("annotations.db"))
            .await
            .unwrap();
        (tmp, store)
    }

    fn bookmark(doc: &str, page: u32, title: &str) -> Annotation {
        Annotation::new(
            doc,
            page,
            AnnotationKind::Bookmark(Bookmark {
                title: title.to_string(),
                description: String::new(),
                position: Some(Point::new(1.5, 2.5)),
            }),
        )
    }

    fn highlight(doc: &str, page: u32, text: &str) -> Annotation {
        let sel = TextSelection::new(Point::new(0.0, 0.0), Point::new(5.0, 1.0), 0, text.len(), text);
        Annotation::new(
            doc,
            page,
            AnnotationKind::Highlight(Highlight::from_selection(sel, HighlightColor::Blue)),
        )
    }

    #[tokio::test]
    async fn test_round_trip_every_variant() {
        let (_tmp, store) = open_store().await;
        let mut note = Annotation::new(
            "book.epub",
            4,
            AnnotationKind::Note(Note::new(Point::new(3.0, 4.0), "<p>A <i>thought</i></p>")),
        );
        note.category = "default".into();
        let mut hl = highlight("book.epub", 2, "quoted passage");
        hl.as_highlight_mut().unwrap().note = "why".into();

        for a in [bookmark("book.epub", 1, "Start"), hl, note] {
            assert!(store.save(&a).await);
            assert_eq!(store.load(&a.id).await, Some(a));
        }
    }

    #[tokio::test]
    async fn test_defaults_seeded_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("annotations.db");
        let store = AnnotationStore::open(&path).await.unwrap();
        let first = store.load_categories(true).await.len();
        store.close().await;
        let store = AnnotationStore::open(&path).await.unwrap();
        assert_eq!(store.load_categories(true).await.len(), first);
        assert!(store.load_category(DEFAULT_CATEGORY_ID).await.is_some());
    }

    #[tokio::test]
    async fn test_load_many_filters_and_orders() {
        let (_tmp, store) = open_store().await;
        let a = bookmark("a.pdf", 3, "three");
        let b = bookmark("a.pdf", 1, "one");
        let c = highlight("a.pdf", 1, "text");
        let d = bookmark("b.pdf", 1, "other doc");
        for x in [&a, &b, &c, &d] {
            assert!(store.save(x).await);
        }

        let all = store.load_many("a.pdf", None, None).await;
        let pages: Vec<u32> = all.iter().map(|x| x.page_number).collect();
        assert_eq!(pages, vec![1, 1, 3]);

        let bookmarks = store
            .load_many("a.pdf", None, Some(AnnotationType::Bookmark))
            .await;
        assert_eq!(bookmarks, vec![b.clone(), a.clone()]);

        let page1 = store
            .load_many("a.pdf", Some(1), Some(AnnotationType::Bookmark))
            .await;
        assert_eq!(page1, vec![b]);
    }

    #[tokio::test]
    async fn test_invalid_annotation_is_not_written() {
        let (_tmp, store) = open_store().await;
        let mut bad = bookmark("a.pdf", 1, "x");
        bad.page_number = 0;
        assert!(!store.save(&bad).await);
        assert!(store.load(&bad.id).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_category_falls_back_to_default() {
        let (_tmp, store) = open_store().await;
        let a = bookmark("a.pdf", 1, "x").with_category("no-such-category");
        assert!(store.save(&a).await);
        assert_eq!(store.load(&a.id).await.unwrap().category, DEFAULT_CATEGORY_ID);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_skipped() {
        let (_tmp, store) = open_store().await;
        let good = bookmark("a.pdf", 1, "good");
        assert!(store.save(&good).await);
        sqlx::query(
            "INSERT INTO annotations (id, type, document_path, page_number, data, category, created_at, updated_at) \
             VALUES ('broken', 'note', 'a.pdf', 2, '{not json', 'default', 'x', 'y')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let loaded = store.load_many("a.pdf", None, None).await;
        assert_eq!(loaded, vec![good]);
        assert!(store.load("broken").await.is_none());
    }

    #[tokio::test]
    async fn test_search_ranked_and_filtered() {
        let (_tmp, store) = open_store().await;
        let a = highlight("a.pdf", 1, "the quick brown fox");
        let b = highlight("b.pdf", 1, "a fox in another book");
        let c = bookmark("a.pdf", 2, "unrelated");
        for x in [&a, &b, &c] {
            assert!(store.save(x).await);
        }

        let hits = store.search("FOX", &AnnotationFilter::default(), 10).await;
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.context_snippet.to_lowercase().contains("fox")));

        let only_a = store
            .search("fox", &AnnotationFilter::for_document("a.pdf"), 10)
            .await;
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].annotation.id, a.id);
        let (s, e) = only_a[0].match_highlights[0];
        assert_eq!(&only_a[0].context_snippet[s..e], "fox");
    }

    #[tokio::test]
    async fn test_search_falls_back_when_fts_missing() {
        let (_tmp, store) = open_store().await;
        let a = highlight("a.pdf", 1, "needle in a haystack");
        assert!(store.save(&a).await);
        sqlx::query("DROP TABLE annotation_search")
            .execute(store.pool())
            .await
            .unwrap();

        let hits = store.search("needle", &AnnotationFilter::default(), 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relevance_score, 1.0);
    }

    #[tokio::test]
    async fn test_empty_query_uses_filters_only() {
        let (_tmp, store) = open_store().await;
        assert!(store.save(&bookmark("a.pdf", 1, "x")).await);
        assert!(store.save(&highlight("a.pdf", 5, "y")).await);
        let filter = AnnotationFilter {
            page_range: Some((2, 10)),
            ..Default::default()
        };
        let hits = store.search("  ", &filter, 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].annotation.page_number, 5);
    }

    #[tokio::test]
    async fn test_counts_follow_saves_and_deletes() {
        let (_tmp, store) = open_store().await;
        let a = bookmark("a.pdf", 1, "x");
        assert!(store.save(&a).await);
        let general = store.load_category(DEFAULT_CATEGORY_ID).await.unwrap();
        assert_eq!(general.annotation_count, 1);
        assert!(store.delete(&a.id).await);
        let general = store.load_category(DEFAULT_CATEGORY_ID).await.unwrap();
        assert_eq!(general.annotation_count, 0);
        assert!(!store.delete(&a.id).await);
    }

    #[tokio::test]
    async fn test_replace_is_all_or_nothing() {
        let (_tmp, store) = open_store().await;
        let old = highlight("a.pdf", 1, "old text");
        assert!(store.save(&old).await);
        let generation = store.generation();

        let merged = highlight("a.pdf", 1, "merged text");
        let err = store
            .try_replace(std::slice::from_ref(&merged), &[old.id.clone(), "gone".into()])
            .await;
        assert!(matches!(err, Err(Error::NotFound(_))));
        assert!(store.load(&merged.id).await.is_none());
        assert!(store.load(&old.id).await.is_some());
        assert_eq!(store.generation(), generation);

        store
            .try_replace(std::slice::from_ref(&merged), &[old.id.clone()])
            .await
            .unwrap();
        assert!(store.load(&old.id).await.is_none());
        assert_eq!(store.load(&merged.id).await, Some(merged));
        assert!(store.generation() > generation);
    }

    #[tokio::test]
    async fn test_delete_category_reassigns_members() {
        let (_tmp, store) = open_store().await;
        let cat = Category::new("Temporary", "#123456");
        assert!(store.save_category(&cat).await);
        let a = bookmark("a.pdf", 1, "x").with_category(cat.id.clone());
        assert!(store.save(&a).await);
        assert_eq!(store.load_category(&cat.id).await.unwrap().annotation_count, 1);

        assert!(store.delete_category(&cat.id, None).await);
        assert_eq!(store.load(&a.id).await.unwrap().category, DEFAULT_CATEGORY_ID);
        assert!(store.load_category(&cat.id).await.is_none());
        assert!(!store.delete_category(DEFAULT_CATEGORY_ID, None).await);
    }

    #[tokio::test]
    async fn test_assignment_links() {
        let (_tmp, store) = open_store().await;
        let cat = Category::new("Linked", "#654321");
        assert!(store.save_category(&cat).await);
        let a = bookmark("a.pdf", 1, "x");
        assert!(store.save(&a).await);

        assert!(store.assign_category(&a.id, &cat.id).await);
        assert_eq!(store.load(&a.id).await.unwrap().category, cat.id);
        let linked = store.annotation_categories(&a.id).await;
        assert_eq!(linked[0].id, cat.id);

        assert!(store.remove_category_assignment(&a.id, &cat.id).await);
        assert_eq!(store.load(&a.id).await.unwrap().category, DEFAULT_CATEGORY_ID);
        assert!(!store.assign_category(&a.id, "missing").await);
    }

    #[tokio::test]
    async fn test_stats_and_document_delete() {
        let (_tmp, store) = open_store().await;
        assert!(store.save(&bookmark("a.pdf", 1, "x")).await);
        assert!(store.save(&highlight("a.pdf", 1, "y")).await);
        assert!(store.save(&highlight("b.pdf", 1, "z")).await);

        let stats = store.stats(Some("a.pdf")).await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type.get("highlight"), Some(&1));
        assert_eq!(store.stats(None).await.total, 3);

        assert_eq!(store.delete_document("a.pdf").await, 2);
        assert_eq!(store.document_paths().await, vec!["b.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let (tmp, store) = open_store().await;
        let keep = bookmark("a.pdf", 1, "kept");
        assert!(store.save(&keep).await);
        let backup = tmp.path().join("backups/snapshot.db");
        assert!(store.backup(&backup).await);

        let later = bookmark("a.pdf", 2, "added after backup");
        assert!(store.save(&later).await);
        assert!(store.restore(&backup).await);

        assert_eq!(store.load(&keep.id).await, Some(keep));
        assert!(store.load(&later.id).await.is_none());
        let hits = store.search("kept", &AnnotationFilter::default(), 5).await;
        assert_eq!(hits.len(), 1);
        assert!(!store.restore(&tmp.path().join("absent.db")).await);
    }
}
