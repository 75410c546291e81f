//! Note operations and reply threads.

use marginalia_core::thread::NoteArena;
use marginalia_core::{Annotation, AnnotationKind, AnnotationType, Note, Point};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, instrument, Span};

use crate::error::{Error, Reported, Result};
use crate::store::AnnotationStore;

/// A note matched by [`NoteManager::search`] with its score: 3 when the
/// plain text equals the query, 2 when it starts with it, 1 otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteMatch {
    pub note: Annotation,
    pub score: u8,
}

pub struct NoteManager {
    store: Arc<AnnotationStore>,
    span: Span,
}

impl NoteManager {
    pub fn new(store: Arc<AnnotationStore>) -> Self {
        let span = tracing::info_span!(parent: store.span(), "notes");
        Self { store, span }
    }

    /// Create a top-level note. `content` is HTML; its plain text is derived.
    #[instrument(parent = &self.span, skip(self, content))]
    pub async fn create(
        &self,
        document_path: &str,
        page_number: u32,
        position: Point,
        content: &str,
    ) -> Option<Annotation> {
        let annotation = Annotation::new(
            document_path,
            page_number,
            AnnotationKind::Note(Note::new(position, content)),
        );
        self.store.try_save(&annotation).await.reported("create_note")?;
        info!(id = %annotation.id, "created note");
        Some(annotation)
    }

    pub async fn get(&self, id: &str) -> Option<Annotation> {
        self.store.load(id).await.filter(|a| a.as_note().is_some())
    }

    /// Notes of a document ordered by page, then position (x, y), then
    /// creation time.
    pub async fn list(&self, document_path: &str, page: Option<u32>) -> Vec<Annotation> {
        let mut notes = self
            .store
            .load_many(document_path, page, Some(AnnotationType::Note))
            .await;
        notes.sort_by(reading_order);
        notes
    }

    /// Persist edits to a note. The plain text is re-derived from the
    /// content.
    pub async fn update(&self, note: &Annotation) -> bool {
        let result: Result<_> = async {
            let mut updated = note.clone();
            let Some(n) = updated.as_note_mut() else {
                return Err(Error::NotFound(format!("note {}", note.id)));
            };
            let content = n.content.clone();
            n.set_content(content);
            self.expect_note(&note.id).await?;
            updated.touch();
            self.store.try_save(&updated).await
        }
        .await;
        result.reported("update_note").is_some()
    }

    /// Reply to a note. The reply lands on the parent's page and position.
    #[instrument(parent = &self.span, skip(self, content))]
    pub async fn create_reply(&self, parent_id: &str, content: &str) -> Option<Annotation> {
        self.try_create_reply(parent_id, content)
            .await
            .reported("create_reply")
    }

    async fn try_create_reply(&self, parent_id: &str, content: &str) -> Result<Annotation> {
        let parent = self.expect_note(parent_id).await?;
        let position = parent.as_note().map(|n| n.position).unwrap_or_default();
        let mut note = Note::new(position, content);
        note.parent_note_id = Some(parent.id.clone());
        let reply = Annotation::new(
            parent.document_path.clone(),
            parent.page_number,
            AnnotationKind::Note(note),
        )
        .with_category(parent.category.clone());
        self.store.try_save(&reply).await?;
        Ok(reply)
    }

    /// The whole thread containing `id`: its root note first, then every
    /// reply at any depth in creation order.
    pub async fn get_thread(&self, id: &str) -> Vec<Annotation> {
        let result: Result<Vec<Annotation>> = async {
            let note = self.expect_note(id).await?;
            let notes = self.document_notes(&note.document_path).await?;
            let arena = NoteArena::new(&notes);
            Ok(arena.thread(id).into_iter().cloned().collect())
        }
        .await;
        result.reported("get_thread").unwrap_or_default()
    }

    /// Direct replies to a note, oldest first.
    pub async fn get_replies(&self, id: &str) -> Vec<Annotation> {
        let result: Result<Vec<Annotation>> = async {
            let note = self.expect_note(id).await?;
            let notes = self.document_notes(&note.document_path).await?;
            let arena = NoteArena::new(&notes);
            Ok(arena.replies(id).iter().map(|a| (*a).clone()).collect())
        }
        .await;
        result.reported("get_replies").unwrap_or_default()
    }

    /// Delete a note and every reply beneath it, deepest replies first.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn delete(&self, id: &str) -> bool {
        self.try_delete(id).await.reported("delete_note").is_some()
    }

    async fn try_delete(&self, id: &str) -> Result<()> {
        let note = self.expect_note(id).await?;
        let notes = self.document_notes(&note.document_path).await?;
        let order = NoteArena::new(&notes).deletion_order(id);
        let removed = self.store.try_delete_all(&order).await?;
        info!(id, removed, "deleted note thread");
        Ok(())
    }

    /// Move a note to a new position, and optionally a new page.
    pub async fn move_note(&self, id: &str, position: Point, page: Option<u32>) -> bool {
        let result: Result<_> = async {
            let mut note = self.expect_note(id).await?;
            if let Some(n) = note.as_note_mut() {
                n.position = position;
            }
            if let Some(page) = page {
                note.page_number = page;
            }
            note.touch();
            self.store.try_save(&note).await
        }
        .await;
        result.reported("move_note").is_some()
    }

    /// Case-insensitive substring search over a document's notes, best
    /// score first and oldest first within a score.
    pub async fn search(&self, document_path: &str, query: &str) -> Vec<NoteMatch> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let mut matches: Vec<NoteMatch> = self
            .list(document_path, None)
            .await
            .into_iter()
            .filter_map(|note| {
                let n = note.as_note()?;
                let plain = n.plain_text.to_lowercase();
                if !plain.contains(&needle) && !n.content.to_lowercase().contains(&needle) {
                    return None;
                }
                let score = if plain == needle {
                    3
                } else if plain.starts_with(&needle) {
                    2
                } else {
                    1
                };
                Some(NoteMatch { note, score })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.note.created_at.cmp(&b.note.created_at))
        });
        matches
    }

    async fn document_notes(&self, document_path: &str) -> Result<Vec<Annotation>> {
        self.store
            .try_load_many(document_path, None, Some(AnnotationType::Note))
            .await
    }

    async fn expect_note(&self, id: &str) -> Result<Annotation> {
        self.store
            .try_load(id)
            .await?
            .filter(|a| a.as_note().is_some())
            .ok_or_else(|| Error::NotFound(format!("note {id}")))
    }
}

fn reading_order(a: &Annotation, b: &Annotation) -> Ordering {
    let pos = |x: &Annotation| x.as_note().map(|n| n.position).unwrap_or_default();
    let (pa, pb) = (pos(a), pos(b));
    a.page_number
        .cmp(&b.page_number)
        .then_with(|| pa.x.total_cmp(&pb.x))
        .then_with(|| pa.y.total_cmp(&pb.y))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager() -> (TempDir, Arc<AnnotationStore>, NoteManager) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(
            AnnotationStore::open(tmp.path().join("annotations.db"))
                .await
                .unwrap(),
        );
        let m = NoteManager::new(Arc::clone(&store));
        (tmp, store, m)
    }

    #[tokio::test]
    async fn test_thread_and_recursive_delete() {
        let (_tmp, store, m) = manager().await;
        let root = m.create("a.pdf", 3, Point::new(1.0, 2.0), "root").await.unwrap();
        let r1 = m.create_reply(&root.id, "first reply").await.unwrap();
        let r2 = m.create_reply(&r1.id, "nested reply").await.unwrap();
        let other = m.create("a.pdf", 3, Point::new(9.0, 9.0), "unrelated").await.unwrap();

        assert_eq!(r1.page_number, 3);
        assert_eq!(r1.as_note().unwrap().position, Point::new(1.0, 2.0));

        let ids: Vec<String> = m.get_thread(&r2.id).await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![root.id.clone(), r1.id.clone(), r2.id.clone()]);

        assert!(m.delete(&root.id).await);
        for id in [&root.id, &r1.id, &r2.id] {
            assert!(store.load(id).await.is_none());
        }
        assert!(store.load(&other.id).await.is_some());
    }

    #[tokio::test]
    async fn test_reply_to_missing_parent_fails() {
        let (_tmp, _store, m) = manager().await;
        assert!(m.create_reply("nope", "hello").await.is_none());
    }

    #[tokio::test]
    async fn test_cross_document_parent_rejected() {
        let (_tmp, store, m) = manager().await;
        let parent = m.create("a.pdf", 1, Point::default(), "parent").await.unwrap();
        let mut note = Note::new(Point::default(), "stray");
        note.parent_note_id = Some(parent.id.clone());
        let stray = Annotation::new("b.pdf", 1, AnnotationKind::Note(note));
        assert!(!store.save(&stray).await);
    }

    #[tokio::test]
    async fn test_reparenting_into_own_subtree_rejected() {
        let (_tmp, store, m) = manager().await;
        let root = m.create("a.pdf", 1, Point::default(), "root").await.unwrap();
        let child = m.create_reply(&root.id, "child").await.unwrap();

        let mut looped = store.load(&root.id).await.unwrap();
        looped.as_note_mut().unwrap().parent_note_id = Some(child.id.clone());
        assert!(!m.update(&looped).await);
        assert_eq!(store.load(&root.id).await.unwrap().parent_note_id(), None);
    }

    #[tokio::test]
    async fn test_search_scores() {
        let (_tmp, _store, m) = manager().await;
        m.create("a.pdf", 1, Point::default(), "some rust notes").await.unwrap();
        m.create("a.pdf", 1, Point::default(), "<b>Rust</b>").await.unwrap();
        m.create("a.pdf", 1, Point::default(), "rust is fun").await.unwrap();
        m.create("a.pdf", 1, Point::default(), "python").await.unwrap();

        let scores: Vec<u8> = m.search("a.pdf", "RUST").await.iter().map(|x| x.score).collect();
        assert_eq!(scores, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_list_reading_order_and_move() {
        let (_tmp, _store, m) = manager().await;
        let right = m.create("a.pdf", 1, Point::new(50.0, 0.0), "right").await.unwrap();
        let left = m.create("a.pdf", 1, Point::new(5.0, 0.0), "left").await.unwrap();
        let ids: Vec<String> = m.list("a.pdf", None).await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![left.id.clone(), right.id.clone()]);

        assert!(m.move_note(&right.id, Point::new(1.0, 1.0), Some(4)).await);
        let moved = m.get(&right.id).await.unwrap();
        assert_eq!(moved.page_number, 4);
        assert_eq!(moved.as_note().unwrap().position, Point::new(1.0, 1.0));
    }
}
