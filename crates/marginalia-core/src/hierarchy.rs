//! In-memory view of the category tree.
//!
//! Categories are persisted as a flat table with `parent_id` references.
//! [`CategoryTree`] holds them in an id-keyed arena and derives paths,
//! children, and the hierarchy map on demand. It never links categories
//! to each other directly, so a stale or corrupt table can at worst yield
//! a truncated path, never an infinite walk.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::ValidationError;
use crate::models::Category;

/// Hierarchy key under which top-level categories are listed.
pub const ROOT_KEY: &str = "root";

/// Parent key → children sorted by `(sort_order, name)`.
pub type Hierarchy = BTreeMap<String, Vec<Category>>;

#[derive(Debug, Clone, Default)]
pub struct CategoryTree {
    by_id: HashMap<String, Category>,
}

impl CategoryTree {
    pub fn new(categories: impl IntoIterator<Item = Category>) -> Self {
        Self {
            by_id: categories
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Category> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.by_id.values()
    }

    /// Ancestors of `id` followed by `id` itself, root first.
    ///
    /// The walk visits each category at most once, so it terminates within
    /// `len()` steps even if the stored parent links form a loop.
    pub fn path(&self, id: &str) -> Vec<&Category> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.by_id.get(id);
        while let Some(cat) = current {
            if !seen.insert(cat.id.as_str()) {
                break;
            }
            path.push(cat);
            current = cat.parent_id.as_deref().and_then(|p| self.by_id.get(p));
        }
        path.reverse();
        path
    }

    /// Number of ancestors above `id`.
    pub fn depth(&self, id: &str) -> usize {
        self.path(id).len().saturating_sub(1)
    }

    /// Reject re-parenting `id` under `new_parent` if `id` is already on the
    /// new parent's path (which includes `new_parent` itself).
    pub fn check_reparent(&self, id: &str, new_parent: Option<&str>) -> Result<(), ValidationError> {
        let Some(parent) = new_parent else {
            return Ok(());
        };
        if parent == id || self.path(parent).iter().any(|c| c.id == id) {
            return Err(ValidationError::Cycle {
                id: id.to_string(),
                parent: parent.to_string(),
            });
        }
        Ok(())
    }

    /// Direct children of `parent` (or top-level categories for `None`),
    /// sorted by `(sort_order, name)`.
    pub fn children(&self, parent: Option<&str>) -> Vec<&Category> {
        let mut out: Vec<&Category> = self
            .by_id
            .values()
            .filter(|c| c.parent_id.as_deref() == parent)
            .collect();
        out.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }

    pub fn has_children(&self, id: &str) -> bool {
        self.by_id
            .values()
            .any(|c| c.parent_id.as_deref() == Some(id))
    }

    /// Case-insensitive sibling lookup, optionally ignoring one id.
    pub fn find_sibling(
        &self,
        name: &str,
        parent: Option<&str>,
        exclude_id: Option<&str>,
    ) -> Option<&Category> {
        let needle = name.trim().to_lowercase();
        self.by_id.values().find(|c| {
            c.parent_id.as_deref() == parent
                && Some(c.id.as_str()) != exclude_id
                && c.name.trim().to_lowercase() == needle
        })
    }

    /// Group every category under its parent key.
    pub fn hierarchy(&self) -> Hierarchy {
        let mut map: Hierarchy = BTreeMap::new();
        for cat in self.by_id.values() {
            let key = cat
                .parent_id
                .clone()
                .unwrap_or_else(|| ROOT_KEY.to_string());
            map.entry(key).or_default().push(cat.clone());
        }
        for children in map.values_mut() {
            children.sort_by(|a, b| {
                a.sort_order
                    .cmp(&b.sort_order)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        map
    }
}
