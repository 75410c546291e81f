//! Single entry point over the annotation store.
//!
//! [`AnnotationCoordinator`] owns the store and hands out the per-variant
//! managers and the category manager, all sharing it. Cross-type queries,
//! export and import live here.

use marginalia_core::{
    Annotation, AnnotationFilter, AnnotationSearchResult, AnnotationStats, BulkOperationResult,
    Category,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn, Span};

use crate::bookmarks::BookmarkManager;
use crate::category::CategoryManager;
use crate::config::Config;
use crate::error::{Reported, Result};
use crate::export::{self, ExportBundle, ExportFormat};
use crate::highlights::HighlightManager;
use crate::notes::NoteManager;
use crate::store::AnnotationStore;

pub struct AnnotationCoordinator {
    store: Arc<AnnotationStore>,
    bookmarks: BookmarkManager,
    highlights: HighlightManager,
    notes: NoteManager,
    categories: CategoryManager,
    span: Span,
}

impl AnnotationCoordinator {
    /// Open the annotation database named by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = AnnotationStore::open(config.annotations_db_path()).await?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn with_store(store: Arc<AnnotationStore>, config: &Config) -> Self {
        let span = tracing::info_span!(parent: store.span(), "coordinator");
        Self {
            bookmarks: BookmarkManager::new(Arc::clone(&store)),
            highlights: HighlightManager::new(Arc::clone(&store)),
            notes: NoteManager::new(Arc::clone(&store)),
            categories: CategoryManager::with_cache_ttl(
                Arc::clone(&store),
                config.category_cache_ttl(),
            ),
            store,
            span,
        }
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn bookmarks(&self) -> &BookmarkManager {
        &self.bookmarks
    }

    pub fn highlights(&self) -> &HighlightManager {
        &self.highlights
    }

    pub fn notes(&self) -> &NoteManager {
        &self.notes
    }

    pub fn categories(&self) -> &CategoryManager {
        &self.categories
    }

    /// Every annotation of a document (optionally one page), oldest first.
    pub async fn get_all_annotations(&self, document_path: &str, page: Option<u32>) -> Vec<Annotation> {
        let mut all = self.store.load_many(document_path, page, None).await;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn search_annotations(
        &self,
        query: &str,
        filter: &AnnotationFilter,
        limit: usize,
    ) -> Vec<AnnotationSearchResult> {
        self.store.search(query, filter, limit).await
    }

    pub async fn get_statistics(&self, document_path: Option<&str>) -> AnnotationStats {
        self.store.stats(document_path).await
    }

    /// Remove every annotation on a document. Returns how many went.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn delete_annotations_by_document(&self, document_path: &str) -> usize {
        let removed = self.store.delete_document(document_path).await;
        self.categories.refresh_cache();
        info!(removed, "deleted document annotations");
        removed
    }

    /// Export a document's annotations. JSON includes the full category
    /// table.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn export(&self, document_path: &str, format: ExportFormat) -> Option<String> {
        let annotations = self.get_all_annotations(document_path, None).await;
        let categories = match format {
            ExportFormat::Json => self.categories.get_categories(true).await,
            ExportFormat::Csv => Vec::new(),
        };
        let bundle = ExportBundle::new(document_path, annotations, categories);
        export::render(&bundle, format).reported("export")
    }

    /// Import exported data. Returns true if the data parsed and every
    /// annotation in it was stored.
    pub async fn import(&self, data: &str, format: ExportFormat) -> bool {
        self.import_report(data, format)
            .await
            .is_some_and(|r| r.failure_count == 0)
    }

    /// Import exported data and report per-annotation outcomes.
    ///
    /// Categories are stored before annotations. An imported category whose
    /// name is already taken under the same parent is not stored; its
    /// annotations are moved onto the existing category instead.
    #[instrument(parent = &self.span, skip(self, data))]
    pub async fn import_report(&self, data: &str, format: ExportFormat) -> Option<BulkOperationResult> {
        let (mut annotations, categories) = export::parse(data, format).reported("import")?;

        let mut remap = HashMap::new();
        for category in &categories {
            if let Some(existing) = self.import_category(category).await {
                remap.insert(category.id.clone(), existing);
            }
        }

        let mut result = BulkOperationResult::default();
        for annotation in &mut annotations {
            if let Some(target) = remap.get(&annotation.category) {
                annotation.category = target.clone();
            }
            match self.store.try_save(annotation).await {
                Ok(()) => result.record_success(),
                Err(e) => {
                    warn!(id = %annotation.id, error = %e, "skipping imported annotation");
                    result.record_failure(format!("{}: {e}", annotation.id));
                }
            }
        }
        self.categories.refresh_cache();
        info!(
            imported = result.success_count,
            failed = result.failure_count,
            categories = categories.len(),
            "import finished"
        );
        Some(result)
    }

    /// Store one imported category. Returns the id of the existing category
    /// it collided with, if any.
    async fn import_category(&self, category: &Category) -> Option<String> {
        if let Some(existing) = self
            .categories
            .find_sibling(&category.name, category.parent_id.as_deref())
            .await
            .filter(|c| c.id != category.id)
        {
            debug!(name = %category.name, existing = %existing.id, "imported category already present");
            return Some(existing.id);
        }
        if let Err(e) = self.store.try_save_category(category).await {
            warn!(id = %category.id, name = %category.name, error = %e, "skipping imported category");
        }
        self.categories.refresh_cache();
        None
    }

    /// Snapshot the annotation database to `dest`.
    pub async fn backup(&self, dest: &Path) -> bool {
        self.store.backup(dest).await
    }

    /// Replace the annotation database with a snapshot.
    pub async fn restore(&self, src: &Path) -> bool {
        let ok = self.store.restore(src).await;
        self.categories.refresh_cache();
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::{AnnotationType, Point, TextSelection};
    use tempfile::TempDir;

    async fn coordinator(dir: &Path) -> AnnotationCoordinator {
        AnnotationCoordinator::open(&Config::with_data_dir(dir))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_category_counts_fresh_after_variant_writes() {
        let tmp = TempDir::new().unwrap();
        let c = coordinator(tmp.path()).await;
        let count = |c: Option<marginalia_core::Category>| c.unwrap().annotation_count;
        assert_eq!(count(c.categories().get("default").await), 0);

        let b = c.bookmarks().create("a.pdf", 1, "x", "", None).await.unwrap();
        assert_eq!(count(c.categories().get("default").await), 1);

        let sel = TextSelection::new(Point::default(), Point::default(), 0, 8, "two part");
        let h = c.highlights().create("a.pdf", 1, sel, None, "").await.unwrap();
        assert_eq!(count(c.categories().get("default").await), 2);
        c.highlights().split(&h.id, 3).await.unwrap();
        assert_eq!(count(c.categories().get("default").await), 3);

        assert!(c.bookmarks().delete(&b.id).await);
        assert_eq!(count(c.categories().get("default").await), 2);
    }

    #[tokio::test]
    async fn test_routes_to_variant_managers() {
        let tmp = TempDir::new().unwrap();
        let c = coordinator(tmp.path()).await;
        c.bookmarks().create("a.pdf", 1, "b", "", None).await.unwrap();
        let sel = TextSelection::new(Point::default(), Point::default(), 0, 4, "text");
        c.highlights().create("a.pdf", 1, sel, None, "").await.unwrap();
        c.notes().create("a.pdf", 2, Point::default(), "n").await.unwrap();

        let all = c.get_all_annotations("a.pdf", None).await;
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(c.get_all_annotations("a.pdf", Some(2)).await.len(), 1);

        let stats = c.get_statistics(Some("a.pdf")).await;
        assert_eq!(stats.by_type.get(AnnotationType::Note.as_str()), Some(&1));
    }

    #[tokio::test]
    async fn test_json_export_import_into_fresh_store() {
        let src = TempDir::new().unwrap();
        let c = coordinator(src.path()).await;
        let cat = c.categories().create("Custom", "purple", None, "").await.unwrap();
        let b = c.bookmarks().create("a.pdf", 4, "mark", "", None).await.unwrap();
        assert!(c.categories().assign_category(&b.id, &cat.id).await);
        c.notes().create("a.pdf", 1, Point::new(1.0, 1.0), "<i>hi</i>").await.unwrap();

        let json = c.export("a.pdf", ExportFormat::Json).await.unwrap();

        let dst = TempDir::new().unwrap();
        let fresh = coordinator(dst.path()).await;
        assert!(fresh.import(&json, ExportFormat::Json).await);
        assert_eq!(
            fresh.get_all_annotations("a.pdf", None).await,
            c.get_all_annotations("a.pdf", None).await
        );
        assert!(fresh.categories().get(&cat.id).await.is_some());
    }

    #[tokio::test]
    async fn test_csv_import_and_bad_data() {
        let tmp = TempDir::new().unwrap();
        let c = coordinator(tmp.path()).await;
        c.bookmarks().create("a.pdf", 1, "one", "", None).await.unwrap();
        let csv = c.export("a.pdf", ExportFormat::Csv).await.unwrap();
        assert_eq!(c.delete_annotations_by_document("a.pdf").await, 1);

        assert!(c.import(&csv, ExportFormat::Csv).await);
        assert_eq!(c.get_all_annotations("a.pdf", None).await.len(), 1);
        assert!(!c.import("{ not json", ExportFormat::Json).await);
    }
}
