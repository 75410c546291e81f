//! Category hierarchy management on top of [`AnnotationStore`].
//!
//! Reads are served from a snapshot of the whole category table held in an
//! id-keyed [`CategoryTree`]. The snapshot expires after a fixed window and
//! is dropped synchronously by every mutation made through this manager. It
//! also records the store's write generation, so a save or delete made
//! through any other handle on the same store retires it on the next read.

use marginalia_core::defaults;
use marginalia_core::hierarchy::{CategoryTree, Hierarchy};
use marginalia_core::models::{CategoryStats, CategoryUsage};
use marginalia_core::{BulkOperationResult, Category, HighlightColor, ValidationError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, Span};

use crate::error::{Error, Reported, Result};
use crate::store::AnnotationStore;

/// Default lifetime of the category snapshot.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

struct Snapshot {
    loaded_at: Instant,
    generation: u64,
    tree: Arc<CategoryTree>,
}

pub struct CategoryManager {
    store: Arc<AnnotationStore>,
    cache: RwLock<Option<Snapshot>>,
    ttl: Duration,
    span: Span,
}

impl CategoryManager {
    pub fn new(store: Arc<AnnotationStore>) -> Self {
        Self::with_cache_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(store: Arc<AnnotationStore>, ttl: Duration) -> Self {
        let span = tracing::info_span!(parent: store.span(), "categories");
        Self {
            store,
            cache: RwLock::new(None),
            ttl,
            span,
        }
    }

    /// Drop the snapshot so the next read goes to the store.
    pub fn refresh_cache(&self) {
        *self.cache.write() = None;
    }

    async fn tree(&self) -> Result<Arc<CategoryTree>> {
        let generation = self.store.generation();
        let cached = {
            let guard = self.cache.read();
            guard
                .as_ref()
                .filter(|s| s.generation == generation && s.loaded_at.elapsed() < self.ttl)
                .map(|s| Arc::clone(&s.tree))
        };
        if let Some(tree) = cached {
            return Ok(tree);
        }
        let tree = Arc::new(CategoryTree::new(
            self.store.try_load_categories(true).await?,
        ));
        *self.cache.write() = Some(Snapshot {
            loaded_at: Instant::now(),
            generation,
            tree: Arc::clone(&tree),
        });
        debug!(parent: &self.span, count = tree.len(), "category cache loaded");
        Ok(tree)
    }

    // ═══════════════════════════════════════════════════════════════════
    // CRUD
    // ═══════════════════════════════════════════════════════════════════

    /// Create a category. `color` may be a palette name or `#RRGGBB`.
    #[instrument(parent = &self.span, skip(self, description))]
    pub async fn create(
        &self,
        name: &str,
        color: &str,
        parent_id: Option<&str>,
        description: &str,
    ) -> Option<Category> {
        self.try_create(name, color, parent_id, description)
            .await
            .reported("create_category")
    }

    async fn try_create(
        &self,
        name: &str,
        color: &str,
        parent_id: Option<&str>,
        description: &str,
    ) -> Result<Category> {
        let color = HighlightColor::resolve(color)
            .ok_or_else(|| ValidationError::InvalidColor(color.to_string()))?;
        let mut category = Category::new(name.trim(), color);
        category.description = description.to_string();
        category.parent_id = parent_id.map(str::to_string);

        let tree = self.tree().await?;
        check_placement(&tree, &category)?;
        category.sort_order = tree
            .children(parent_id)
            .iter()
            .map(|c| c.sort_order + 1)
            .max()
            .unwrap_or(0);

        self.store.try_save_category(&category).await?;
        self.refresh_cache();
        info!(id = %category.id, name = %category.name, "created category");
        Ok(category)
    }

    /// Persist edits to an existing category. Name, color and parent are
    /// revalidated; a parent change goes through cycle detection.
    #[instrument(parent = &self.span, skip_all, fields(id = %category.id))]
    pub async fn update(&self, category: &Category) -> bool {
        self.try_update(category)
            .await
            .reported("update_category")
            .is_some()
    }

    async fn try_update(&self, category: &Category) -> Result<()> {
        let tree = self.tree().await?;
        let existing = tree
            .get(&category.id)
            .ok_or_else(|| Error::NotFound(format!("category {}", category.id)))?;

        let mut updated = category.clone();
        updated.name = updated.name.trim().to_string();
        updated.color = HighlightColor::resolve(&updated.color)
            .ok_or_else(|| ValidationError::InvalidColor(category.color.clone()))?;
        updated.created_at = existing.created_at;
        updated.is_default = existing.is_default;
        check_placement(&tree, &updated)?;
        if updated.parent_id != existing.parent_id {
            tree.check_reparent(&updated.id, updated.parent_id.as_deref())?;
        }
        updated.touch();

        self.store.try_save_category(&updated).await?;
        self.refresh_cache();
        Ok(())
    }

    /// Delete a category, moving its annotations to `reassign_to` (or the
    /// default category). A category with children is only deleted when a
    /// target is given; its children then move up to its parent.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn delete(&self, id: &str, reassign_to: Option<&str>) -> bool {
        self.try_delete(id, reassign_to)
            .await
            .reported("delete_category")
            .is_some()
    }

    async fn try_delete(&self, id: &str, reassign_to: Option<&str>) -> Result<()> {
        let tree = self.tree().await?;
        let category = tree
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("category {id}")))?;
        if category.is_default {
            return Err(ValidationError::ProtectedCategory(id.to_string()).into());
        }
        if tree.has_children(id) && reassign_to.is_none() {
            return Err(ValidationError::HasChildren(id.to_string()).into());
        }
        let result = self.store.try_delete_category(id, reassign_to).await;
        self.refresh_cache();
        result
    }

    pub async fn get(&self, id: &str) -> Option<Category> {
        let tree = self.tree().await.reported("get_category")?;
        tree.get(id).cloned()
    }

    /// First category with this name, compared case-insensitively.
    pub async fn get_by_name(&self, name: &str) -> Option<Category> {
        let tree = self.tree().await.reported("get_category_by_name")?;
        let needle = name.trim().to_lowercase();
        let mut matches: Vec<&Category> = tree
            .iter()
            .filter(|c| c.name.to_lowercase() == needle)
            .collect();
        matches.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)));
        matches.first().map(|c| (*c).clone())
    }

    /// The category named `name` (case-insensitively) directly under
    /// `parent_id`.
    pub async fn find_sibling(&self, name: &str, parent_id: Option<&str>) -> Option<Category> {
        let tree = self.tree().await.reported("find_sibling")?;
        tree.find_sibling(name, parent_id, None).cloned()
    }

    /// Categories ordered by `(sort_order, name)`.
    pub async fn get_categories(&self, include_inactive: bool) -> Vec<Category> {
        let Some(tree) = self.tree().await.reported("get_categories") else {
            return Vec::new();
        };
        let mut out: Vec<Category> = tree
            .iter()
            .filter(|c| include_inactive || c.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        out
    }

    // ═══════════════════════════════════════════════════════════════════
    // Hierarchy
    // ═══════════════════════════════════════════════════════════════════

    /// Active categories grouped by parent id, top level under `"root"`.
    pub async fn get_hierarchy(&self) -> Hierarchy {
        let Some(tree) = self.tree().await.reported("get_hierarchy") else {
            return Hierarchy::new();
        };
        CategoryTree::new(tree.iter().filter(|c| c.is_active).cloned()).hierarchy()
    }

    pub async fn get_root_categories(&self) -> Vec<Category> {
        self.children_of(None).await
    }

    pub async fn get_child_categories(&self, parent_id: &str) -> Vec<Category> {
        self.children_of(Some(parent_id)).await
    }

    async fn children_of(&self, parent: Option<&str>) -> Vec<Category> {
        let Some(tree) = self.tree().await.reported("get_child_categories") else {
            return Vec::new();
        };
        tree.children(parent)
            .into_iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect()
    }

    /// Ancestors of `id` then `id` itself. Empty if `id` is unknown.
    pub async fn get_path(&self, id: &str) -> Vec<Category> {
        let Some(tree) = self.tree().await.reported("get_path") else {
            return Vec::new();
        };
        tree.path(id).into_iter().cloned().collect()
    }

    /// Re-parent a category, or make it top level with `None`.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn move_category(&self, id: &str, new_parent: Option<&str>) -> bool {
        self.try_move(id, new_parent)
            .await
            .reported("move_category")
            .is_some()
    }

    async fn try_move(&self, id: &str, new_parent: Option<&str>) -> Result<()> {
        let tree = self.tree().await?;
        let mut category = tree
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("category {id}")))?;
        tree.check_reparent(id, new_parent)?;
        category.parent_id = new_parent.map(str::to_string);
        check_placement(&tree, &category)?;
        category.touch();
        self.store.try_save_category(&category).await?;
        self.refresh_cache();
        Ok(())
    }

    /// Apply new sort orders. Returns true only if every entry was applied.
    pub async fn reorder(&self, orders: &[(String, i64)]) -> bool {
        let mut all_ok = true;
        for (id, sort_order) in orders {
            let result = self.try_set_sort_order(id, *sort_order).await;
            all_ok &= result.reported("reorder").is_some();
        }
        self.refresh_cache();
        all_ok
    }

    async fn try_set_sort_order(&self, id: &str, sort_order: i64) -> Result<()> {
        let mut category = self
            .store
            .try_load_category(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("category {id}")))?;
        category.sort_order = sort_order;
        category.touch();
        self.store.try_save_category(&category).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Assignments
    // ═══════════════════════════════════════════════════════════════════

    pub async fn assign_category(&self, annotation_id: &str, category_id: &str) -> bool {
        let ok = self.store.assign_category(annotation_id, category_id).await;
        self.refresh_cache();
        ok
    }

    pub async fn remove_category_assignment(&self, annotation_id: &str, category_id: &str) -> bool {
        let ok = self
            .store
            .remove_category_assignment(annotation_id, category_id)
            .await;
        self.refresh_cache();
        ok
    }

    pub async fn get_annotation_categories(&self, annotation_id: &str) -> Vec<Category> {
        self.store.annotation_categories(annotation_id).await
    }

    /// Link every annotation to every category. Each pair counts as one
    /// success or failure.
    #[instrument(parent = &self.span, skip_all, fields(annotations = annotation_ids.len(), categories = category_ids.len()))]
    pub async fn bulk_assign(
        &self,
        annotation_ids: &[String],
        category_ids: &[String],
    ) -> BulkOperationResult {
        let mut result = BulkOperationResult::default();
        for annotation_id in annotation_ids {
            for category_id in category_ids {
                match self
                    .store
                    .try_assign_category(annotation_id, category_id)
                    .await
                {
                    Ok(()) => result.record_success(),
                    Err(e) => result.record_failure(format!("{annotation_id} -> {category_id}: {e}")),
                }
            }
        }
        self.refresh_cache();
        info!(
            success = result.success_count,
            failure = result.failure_count,
            "bulk category assignment"
        );
        result
    }

    // ═══════════════════════════════════════════════════════════════════
    // Templates and defaults
    // ═══════════════════════════════════════════════════════════════════

    pub fn available_templates(&self) -> &'static [&'static str] {
        defaults::TEMPLATE_NAMES
    }

    /// Create a template's categories at the top level. Categories whose
    /// name already exists there are skipped. Unknown names are rejected.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn apply_template(&self, name: &str) -> Option<Vec<Category>> {
        self.try_apply_template(name)
            .await
            .reported("apply_template")
    }

    async fn try_apply_template(&self, name: &str) -> Result<Vec<Category>> {
        let seeds = defaults::template(name)
            .ok_or_else(|| ValidationError::UnknownTemplate(name.to_string()))?;
        let tree = self.tree().await?;
        let base = tree
            .children(None)
            .iter()
            .map(|c| c.sort_order + 1)
            .max()
            .unwrap_or(0);

        let mut created = Vec::new();
        for mut category in seeds {
            if tree.find_sibling(&category.name, None, None).is_some() {
                debug!(name = %category.name, "template category already present");
                continue;
            }
            category.sort_order += base;
            self.store.try_save_category(&category).await?;
            created.push(category);
        }
        self.refresh_cache();
        info!(template = name, created = created.len(), "applied category template");
        Ok(created)
    }

    /// Insert any default category that is missing. Returns how many were
    /// added.
    pub async fn initialize_default_categories(&self) -> usize {
        self.try_initialize_defaults()
            .await
            .reported("initialize_default_categories")
            .unwrap_or(0)
    }

    async fn try_initialize_defaults(&self) -> Result<usize> {
        let tree = self.tree().await?;
        let mut added = 0;
        for category in defaults::default_categories() {
            let present = tree.get(&category.id).is_some()
                || tree.find_sibling(&category.name, None, None).is_some();
            if present {
                continue;
            }
            self.store.try_save_category(&category).await?;
            added += 1;
        }
        self.refresh_cache();
        Ok(added)
    }

    /// Whether `name` is free under `parent_id`, ignoring `exclude_id`.
    pub async fn validate_category_name(
        &self,
        name: &str,
        parent_id: Option<&str>,
        exclude_id: Option<&str>,
    ) -> bool {
        if name.trim().is_empty() {
            return false;
        }
        match self.tree().await.reported("validate_category_name") {
            Some(tree) => tree.find_sibling(name, parent_id, exclude_id).is_none(),
            None => false,
        }
    }

    pub async fn get_category_statistics(&self) -> CategoryStats {
        let Some(tree) = self.tree().await.reported("get_category_statistics") else {
            return CategoryStats::default();
        };
        let mut all: Vec<&Category> = tree.iter().collect();
        all.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));

        let usage = |c: &&Category| CategoryUsage {
            name: c.name.clone(),
            count: c.annotation_count,
        };
        let total_annotations: i64 = all.iter().map(|c| c.annotation_count).sum();
        CategoryStats {
            total_categories: all.len(),
            active_categories: all.iter().filter(|c| c.is_active).count(),
            default_categories: all.iter().filter(|c| c.is_default).count(),
            root_categories: all.iter().filter(|c| c.parent_id.is_none()).count(),
            categories_with_children: all.iter().filter(|c| tree.has_children(&c.id)).count(),
            most_used: all
                .iter()
                .rev()
                .max_by_key(|c| c.annotation_count)
                .map(usage),
            least_used: all
                .iter()
                .min_by_key(|c| c.annotation_count)
                .map(usage),
            average_annotations_per_category: if all.is_empty() {
                0.0
            } else {
                total_annotations as f64 / all.len() as f64
            },
        }
    }
}

/// Name, color and parent checks shared by create, update and move.
fn check_placement(tree: &CategoryTree, category: &Category) -> Result<()> {
    category.validate()?;
    if let Some(parent) = category.parent_id.as_deref() {
        if tree.get(parent).is_none() {
            return Err(Error::NotFound(format!("parent category {parent}")));
        }
    }
    if tree
        .find_sibling(
            &category.name,
            category.parent_id.as_deref(),
            Some(&category.id),
        )
        .is_some()
    {
        return Err(ValidationError::DuplicateName(category.name.clone()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::hierarchy::ROOT_KEY;
    use marginalia_core::{Annotation, AnnotationKind, Bookmark, DEFAULT_CATEGORY_ID};
    use tempfile::TempDir;

    async fn manager() -> (TempDir, Arc<AnnotationStore>, CategoryManager) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(
            AnnotationStore::open(tmp.path().join("annotations.db"))
                .await
                .unwrap(),
        );
        let manager = CategoryManager::new(Arc::clone(&store));
        (tmp, store, manager)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_case_insensitively() {
        let (_tmp, _store, m) = manager().await;
        let a = m.create("Reading", "blue", None, "").await.unwrap();
        assert_eq!(a.color, "#0080FF");
        assert!(m.create("reading", "#123456", None, "").await.is_none());
        // Same name under a different parent is fine.
        assert!(m.create("Reading", "#123456", Some(&a.id), "").await.is_some());
        assert!(m.create("", "#123456", None, "").await.is_none());
        assert!(m.create("Bad color", "#12", None, "").await.is_none());
        assert!(m.create("Orphan", "#123456", Some("missing"), "").await.is_none());
    }

    #[tokio::test]
    async fn test_move_rejects_cycles_and_leaves_tree_unchanged() {
        let (_tmp, _store, m) = manager().await;
        let a = m.create("A", "#111111", None, "").await.unwrap();
        let b = m.create("B", "#222222", Some(&a.id), "").await.unwrap();
        let c = m.create("C", "#333333", Some(&b.id), "").await.unwrap();

        assert!(!m.move_category(&a.id, Some(&c.id)).await);
        assert!(!m.move_category(&a.id, Some(&a.id)).await);
        let path: Vec<String> = m.get_path(&c.id).await.into_iter().map(|x| x.id).collect();
        assert_eq!(path, vec![a.id.clone(), b.id.clone(), c.id.clone()]);
        assert_eq!(m.get(&a.id).await.unwrap().parent_id, None);

        assert!(m.move_category(&c.id, None).await);
        assert_eq!(m.get_path(&c.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_hierarchy_groups_by_parent() {
        let (_tmp, _store, m) = manager().await;
        let parent = m.create("Parent", "#111111", None, "").await.unwrap();
        m.create("Zeta", "#222222", Some(&parent.id), "").await.unwrap();
        m.create("Alpha", "#333333", Some(&parent.id), "").await.unwrap();

        let h = m.get_hierarchy().await;
        assert!(h[ROOT_KEY].iter().any(|c| c.id == parent.id));
        let names: Vec<&str> = h[&parent.id].iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);

        let kids = m.get_child_categories(&parent.id).await;
        assert_eq!(kids.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_policy() {
        let (_tmp, store, m) = manager().await;
        assert!(!m.delete(DEFAULT_CATEGORY_ID, None).await);

        let parent = m.create("Parent", "#111111", None, "").await.unwrap();
        let child = m.create("Child", "#222222", Some(&parent.id), "").await.unwrap();
        let a = Annotation::new("a.pdf", 1, AnnotationKind::Bookmark(Bookmark::default()))
            .with_category(parent.id.clone());
        assert!(store.save(&a).await);

        assert!(!m.delete(&parent.id, None).await);
        assert!(m.get(&parent.id).await.is_some());

        assert!(m.delete(&parent.id, Some(DEFAULT_CATEGORY_ID)).await);
        assert!(m.get(&parent.id).await.is_none());
        assert_eq!(m.get(&child.id).await.unwrap().parent_id, None);
        assert_eq!(store.load(&a.id).await.unwrap().category, DEFAULT_CATEGORY_ID);
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_mutation() {
        let (_tmp, _store, m) = manager().await;
        let before = m.get_categories(true).await.len();
        m.create("Fresh", "#abcdef", None, "").await.unwrap();
        assert_eq!(m.get_categories(true).await.len(), before + 1);
    }

    #[tokio::test]
    async fn test_counts_follow_annotation_writes_through_store() {
        let (_tmp, store, m) = manager().await;
        assert_eq!(m.get(DEFAULT_CATEGORY_ID).await.unwrap().annotation_count, 0);

        let a = Annotation::new("a.pdf", 1, AnnotationKind::Bookmark(Bookmark::default()));
        assert!(store.save(&a).await);
        assert_eq!(m.get(DEFAULT_CATEGORY_ID).await.unwrap().annotation_count, 1);
        let most_used = m.get_category_statistics().await.most_used.unwrap();
        assert_eq!((most_used.name.as_str(), most_used.count), ("General", 1));

        assert!(store.delete(&a.id).await);
        assert_eq!(m.get(DEFAULT_CATEGORY_ID).await.unwrap().annotation_count, 0);
    }

    #[tokio::test]
    async fn test_templates_and_stats() {
        let (_tmp, _store, m) = manager().await;
        assert!(m.apply_template("unknown").await.is_none());
        let created = m.apply_template("academic").await.unwrap();
        assert_eq!(created.len(), 5);
        assert!(m.apply_template("Academic").await.unwrap().is_empty());
        assert!(m.get_by_name("methodology").await.is_some());

        let stats = m.get_category_statistics().await;
        assert_eq!(stats.total_categories, 11);
        assert_eq!(stats.default_categories, 6);
        assert_eq!(m.initialize_default_categories().await, 0);
    }

    #[tokio::test]
    async fn test_reorder_reports_partial_failure() {
        let (_tmp, _store, m) = manager().await;
        let a = m.create("A", "#111111", None, "").await.unwrap();
        assert!(m.reorder(&[(a.id.clone(), 42)]).await);
        assert_eq!(m.get(&a.id).await.unwrap().sort_order, 42);
        assert!(!m.reorder(&[(a.id.clone(), 1), ("missing".into(), 2)]).await);
    }

    #[tokio::test]
    async fn test_bulk_assign_counts_pairs() {
        let (_tmp, store, m) = manager().await;
        let cat = m.create("Bulk", "#111111", None, "").await.unwrap();
        let a = Annotation::new("a.pdf", 1, AnnotationKind::Bookmark(Bookmark::default()));
        assert!(store.save(&a).await);

        let result = m
            .bulk_assign(&[a.id.clone(), "ghost".into()], &[cat.id.clone()])
            .await;
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 1);
        assert_eq!(m.get(&cat.id).await.unwrap().annotation_count, 1);
    }

    #[tokio::test]
    async fn test_validate_category_name() {
        let (_tmp, _store, m) = manager().await;
        let a = m.create("Taken", "#111111", None, "").await.unwrap();
        assert!(!m.validate_category_name("TAKEN", None, None).await);
        assert!(m.validate_category_name("Taken", None, Some(&a.id)).await);
        assert!(m.validate_category_name("Taken", Some(&a.id), None).await);
        assert!(!m.validate_category_name("  ", None, None).await);
    }
}
