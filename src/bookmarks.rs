//! Bookmark operations.

use marginalia_core::{Annotation, AnnotationKind, AnnotationType, Bookmark, Point};
use std::sync::Arc;
use tracing::{info, instrument, Span};

use crate::error::{Error, Reported, Result};
use crate::store::AnnotationStore;

pub struct BookmarkManager {
    store: Arc<AnnotationStore>,
    span: Span,
}

impl BookmarkManager {
    pub fn new(store: Arc<AnnotationStore>) -> Self {
        let span = tracing::info_span!(parent: store.span(), "bookmarks");
        Self { store, span }
    }

    /// Bookmark a page. An empty title becomes `"Page N"`.
    #[instrument(parent = &self.span, skip(self, description, position))]
    pub async fn create(
        &self,
        document_path: &str,
        page_number: u32,
        title: &str,
        description: &str,
        position: Option<Point>,
    ) -> Option<Annotation> {
        let title = match title.trim() {
            "" => format!("Page {page_number}"),
            t => t.to_string(),
        };
        let annotation = Annotation::new(
            document_path,
            page_number,
            AnnotationKind::Bookmark(Bookmark {
                title,
                description: description.to_string(),
                position,
            }),
        );
        self.store.try_save(&annotation).await.reported("create_bookmark")?;
        info!(id = %annotation.id, "created bookmark");
        Some(annotation)
    }

    pub async fn get(&self, id: &str) -> Option<Annotation> {
        self.store.load(id).await.filter(|a| a.as_bookmark().is_some())
    }

    /// Bookmarks of a document, by page then creation time.
    pub async fn list(&self, document_path: &str, page: Option<u32>) -> Vec<Annotation> {
        self.store
            .load_many(document_path, page, Some(AnnotationType::Bookmark))
            .await
    }

    /// Persist edits to an existing bookmark, bumping `updated_at`.
    pub async fn update(&self, bookmark: &Annotation) -> bool {
        self.try_update(bookmark.clone())
            .await
            .reported("update_bookmark")
            .is_some()
    }

    async fn try_update(&self, mut bookmark: Annotation) -> Result<()> {
        if bookmark.as_bookmark().is_none() {
            return Err(Error::NotFound(format!("bookmark {}", bookmark.id)));
        }
        self.expect_bookmark(&bookmark.id).await?;
        bookmark.touch();
        self.store.try_save(&bookmark).await
    }

    pub async fn delete(&self, id: &str) -> bool {
        let result: Result<_> = async {
            self.expect_bookmark(id).await?;
            self.store.try_delete(id).await
        }
        .await;
        result.reported("delete_bookmark").is_some()
    }

    /// Remove the page's bookmark if there is one, else add one. Returns
    /// the new bookmark, or `None` when the page ends up unbookmarked.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn toggle(&self, document_path: &str, page_number: u32) -> Option<Annotation> {
        let existing = self.list(document_path, Some(page_number)).await;
        match existing.into_iter().next() {
            Some(bookmark) => {
                if self.delete(&bookmark.id).await {
                    info!(page_number, "removed bookmark");
                    None
                } else {
                    Some(bookmark)
                }
            }
            None => self.create(document_path, page_number, "", "", None).await,
        }
    }

    pub async fn rename(&self, id: &str, title: &str, description: &str) -> bool {
        self.modify(id, "rename_bookmark", |a| {
            if let Some(b) = a.as_bookmark_mut() {
                b.title = title.to_string();
                b.description = description.to_string();
            }
        })
        .await
    }

    pub async fn move_to_page(&self, id: &str, page_number: u32) -> bool {
        self.modify(id, "move_bookmark", |a| a.page_number = page_number)
            .await
    }

    /// The document's bookmarks, newest first.
    pub async fn recent(&self, document_path: &str, limit: usize) -> Vec<Annotation> {
        let mut bookmarks = self.list(document_path, None).await;
        bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        bookmarks.truncate(limit);
        bookmarks
    }

    async fn modify(&self, id: &str, op: &'static str, edit: impl FnOnce(&mut Annotation)) -> bool {
        let result: Result<_> = async move {
            let mut bookmark = self.expect_bookmark(id).await?;
            edit(&mut bookmark);
            bookmark.touch();
            self.store.try_save(&bookmark).await
        }
        .await;
        result.reported(op).is_some()
    }

    async fn expect_bookmark(&self, id: &str) -> Result<Annotation> {
        self.store
            .try_load(id)
            .await?
            .filter(|a| a.as_bookmark().is_some())
            .ok_or_else(|| Error::NotFound(format!("bookmark {id}")))
    }
}
