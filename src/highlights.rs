//! Highlight operations, including merge and split.

use marginalia_core::highlight;
use marginalia_core::{
    Annotation, AnnotationKind, AnnotationType, Highlight, HighlightColor, TextSelection,
    ValidationError,
};
use std::sync::Arc;
use tracing::{info, instrument, warn, Span};

use crate::error::{Error, Reported, Result};
use crate::store::AnnotationStore;

pub struct HighlightManager {
    store: Arc<AnnotationStore>,
    span: Span,
}

impl HighlightManager {
    pub fn new(store: Arc<AnnotationStore>) -> Self {
        let span = tracing::info_span!(parent: store.span(), "highlights");
        Self { store, span }
    }

    /// Highlight a selection. `color` may be a palette name or `#RRGGBB`;
    /// anything else falls back to yellow.
    #[instrument(parent = &self.span, skip(self, selection, note))]
    pub async fn create(
        &self,
        document_path: &str,
        page_number: u32,
        selection: TextSelection,
        color: Option<&str>,
        note: &str,
    ) -> Option<Annotation> {
        let mut highlight = Highlight::from_selection(selection, HighlightColor::Yellow);
        highlight.color = resolve_color(color);
        highlight.note = note.to_string();
        let annotation = Annotation::new(
            document_path,
            page_number,
            AnnotationKind::Highlight(highlight),
        );
        self.store
            .try_save(&annotation)
            .await
            .reported("create_highlight")?;
        info!(id = %annotation.id, "created highlight");
        Some(annotation)
    }

    pub async fn get(&self, id: &str) -> Option<Annotation> {
        self.store.load(id).await.filter(|a| a.as_highlight().is_some())
    }

    /// Highlights of a document, by page then selection start.
    pub async fn list(&self, document_path: &str, page: Option<u32>) -> Vec<Annotation> {
        let mut highlights = self
            .store
            .load_many(document_path, page, Some(AnnotationType::Highlight))
            .await;
        highlights.sort_by_key(|a| (a.page_number, start_of(a)));
        highlights
    }

    pub async fn update(&self, highlight: &Annotation) -> bool {
        let result: Result<_> = async {
            if highlight.as_highlight().is_none() {
                return Err(Error::NotFound(format!("highlight {}", highlight.id)));
            }
            self.expect_highlight(&highlight.id).await?;
            let mut updated = highlight.clone();
            updated.touch();
            self.store.try_save(&updated).await
        }
        .await;
        result.reported("update_highlight").is_some()
    }

    pub async fn delete(&self, id: &str) -> bool {
        let result: Result<_> = async {
            self.expect_highlight(id).await?;
            self.store.try_delete(id).await
        }
        .await;
        result.reported("delete_highlight").is_some()
    }

    /// Recolor a highlight. Unlike creation, an unknown color is refused.
    pub async fn change_color(&self, id: &str, color: &str) -> bool {
        let result: Result<_> = async {
            let hex = HighlightColor::resolve(color)
                .ok_or_else(|| ValidationError::InvalidColor(color.to_string()))?;
            self.modify(id, |h| h.color = hex).await
        }
        .await;
        result.reported("change_color").is_some()
    }

    pub async fn add_note(&self, id: &str, note: &str) -> bool {
        self.modify(id, |h| h.note = note.to_string())
            .await
            .reported("add_note")
            .is_some()
    }

    /// Highlights on a page whose selection overlaps `[start, end)`.
    pub async fn find_overlapping(
        &self,
        document_path: &str,
        page_number: u32,
        start: usize,
        end: usize,
    ) -> Vec<Annotation> {
        self.list(document_path, Some(page_number))
            .await
            .into_iter()
            .filter(|a| {
                a.as_highlight()
                    .is_some_and(|h| h.text_selection.overlaps(start, end))
            })
            .collect()
    }

    /// Replace two or more highlights on the same page with one covering
    /// all of them. The result takes the first input's category.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn merge(&self, ids: &[String], color: Option<&str>) -> Option<Annotation> {
        self.try_merge(ids, color).await.reported("merge_highlights")
    }

    async fn try_merge(&self, ids: &[String], color: Option<&str>) -> Result<Annotation> {
        if ids.len() < 2 {
            return Err(ValidationError::MergeTooFew(ids.len()).into());
        }
        let mut sources = Vec::with_capacity(ids.len());
        for id in ids {
            sources.push(self.expect_highlight(id).await?);
        }
        let first = &sources[0];
        if sources
            .iter()
            .any(|a| a.document_path != first.document_path || a.page_number != first.page_number)
        {
            return Err(ValidationError::MergeMixedPages.into());
        }

        let color = match color {
            Some(c) => Some(
                HighlightColor::resolve(c)
                    .ok_or_else(|| ValidationError::InvalidColor(c.to_string()))?,
            ),
            None => None,
        };
        let parts: Vec<&Highlight> = sources.iter().filter_map(Annotation::as_highlight).collect();
        let merged = highlight::merge(&parts, color.as_deref())?;

        let annotation = Annotation::new(
            first.document_path.clone(),
            first.page_number,
            AnnotationKind::Highlight(merged),
        )
        .with_category(first.category.clone());
        self.store
            .try_replace(std::slice::from_ref(&annotation), ids)
            .await?;
        info!(id = %annotation.id, merged = ids.len(), "merged highlights");
        Ok(annotation)
    }

    /// Split a highlight at absolute character `position`, which must lie
    /// strictly inside it. The original is replaced by the two halves.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn split(&self, id: &str, position: usize) -> Option<(Annotation, Annotation)> {
        self.try_split(id, position).await.reported("split_highlight")
    }

    async fn try_split(&self, id: &str, position: usize) -> Result<(Annotation, Annotation)> {
        let source = self.expect_highlight(id).await?;
        let Some(original) = source.as_highlight() else {
            return Err(Error::NotFound(format!("highlight {id}")));
        };
        let (left, right) = highlight::split(original, position)?;

        let make = |h: Highlight| {
            Annotation::new(
                source.document_path.clone(),
                source.page_number,
                AnnotationKind::Highlight(h),
            )
            .with_category(source.category.clone())
        };
        let (left, right) = (make(left), make(right));
        self.store
            .try_replace(&[left.clone(), right.clone()], &[id.to_string()])
            .await?;
        Ok((left, right))
    }

    async fn modify(&self, id: &str, edit: impl FnOnce(&mut Highlight)) -> Result<()> {
        let mut annotation = self.expect_highlight(id).await?;
        if let Some(h) = annotation.as_highlight_mut() {
            edit(h);
        }
        annotation.touch();
        self.store.try_save(&annotation).await
    }

    async fn expect_highlight(&self, id: &str) -> Result<Annotation> {
        self.store
            .try_load(id)
            .await?
            .filter(|a| a.as_highlight().is_some())
            .ok_or_else(|| Error::NotFound(format!("highlight {id}")))
    }
}

fn resolve_color(color: Option<&str>) -> String {
    match color {
        None => HighlightColor::default().hex().to_string(),
        Some(c) => HighlightColor::resolve(c).unwrap_or_else(|| {
            warn!(color = c, "invalid highlight color, using yellow");
            HighlightColor::Yellow.hex().to_string()
        }),
    }
}

fn start_of(annotation: &Annotation) -> usize {
    annotation
        .as_highlight()
        .map(|h| h.text_selection.start_char_index)
        .unwrap_or(0)
}
