//! End-to-end tests through the public library API: the coordinator over
//! one annotation database and the indexer over one search index, both in
//! a temporary data directory.

use marginalia::config::Config;
use marginalia::export::ExportFormat;
use marginalia::reader::{DocumentReader, ReaderRegistry};
use marginalia::{
    AnnotationCoordinator, AnnotationFilter, AnnotationType, DocumentIndexer, Point, SearchIndex,
    TextSelection,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// ─── Test Reader ────────────────────────────────────────────────────

/// Stands in for a MOBI decoder: every file has the same two pages.
struct CannedReader {
    pages: Vec<String>,
}

impl DocumentReader for CannedReader {
    fn load(&mut self, _path: &Path) -> marginalia::Result<()> {
        self.pages = vec!["kindle page one".into(), "kindle page two".into()];
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_text(&self, index: usize) -> Option<&str> {
        self.pages.get(index).map(String::as_str)
    }
}

#[tokio::test]
async fn test_annotation_workflow() {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_data_dir(tmp.path());
    let c = AnnotationCoordinator::open(&config).await.unwrap();

    let thesis = c
        .categories()
        .create("Thesis", "green", None, "")
        .await
        .unwrap();
    let sources = c
        .categories()
        .create("Sources", "#112233", Some(&thesis.id), "")
        .await
        .unwrap();
    assert_eq!(
        c.categories()
            .get_path(&sources.id)
            .await
            .iter()
            .map(|cat| cat.name.as_str())
            .collect::<Vec<_>>(),
        vec!["Thesis", "Sources"]
    );
    assert!(!c.categories().move_category(&thesis.id, Some(&sources.id)).await);

    let sel = TextSelection::new(Point::default(), Point::default(), 10, 30, "a memorable phrase");
    let h = c
        .highlights()
        .create("book.epub", 4, sel, Some("pink"), "")
        .await
        .unwrap();
    assert!(c.categories().assign_category(&h.id, &sources.id).await);
    c.notes()
        .create("book.epub", 4, Point::new(5.0, 5.0), "unrelated thought")
        .await
        .unwrap();

    let filter = AnnotationFilter {
        category: Some(sources.id.clone()),
        ..Default::default()
    };
    let hits = c.search_annotations("memorable", &filter, 10).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].annotation.id, h.id);
    assert!(hits[0].context_snippet.contains("memorable"));

    let stats = c.get_statistics(Some("book.epub")).await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_type.get(AnnotationType::Highlight.as_str()), Some(&1));

    assert_eq!(
        c.categories().get(&sources.id).await.unwrap().annotation_count,
        1
    );
    assert!(c.categories().delete(&sources.id, Some(&thesis.id)).await);
    let moved = c.highlights().get(&h.id).await.unwrap();
    assert_eq!(moved.category, thesis.id);
}

#[tokio::test]
async fn test_export_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_data_dir(tmp.path());
    let json = {
        let c = AnnotationCoordinator::open(&config).await.unwrap();
        c.bookmarks()
            .create("book.pdf", 9, "Ch. 9", "", None)
            .await
            .unwrap();
        let json = c.export("book.pdf", ExportFormat::Json).await.unwrap();
        c.store().close().await;
        json
    };

    let reopened = AnnotationCoordinator::open(&config).await.unwrap();
    let stored = reopened.get_all_annotations("book.pdf", None).await;
    assert_eq!(stored.len(), 1);

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["annotations"][0]["id"], stored[0].id.as_str());
}

#[tokio::test]
async fn test_indexer_with_registered_reader() {
    let tmp = TempDir::new().unwrap();
    let index = SearchIndex::open(tmp.path().join("search_index.db"))
        .await
        .unwrap();
    let mut readers = ReaderRegistry::with_defaults(50);
    readers.register("mobi", || {
        Box::new(CannedReader { pages: Vec::new() }) as Box<dyn DocumentReader>
    });
    let indexer = DocumentIndexer::new(Arc::new(index), readers);

    let mobi = tmp.path().join("book.mobi");
    std::fs::write(&mobi, b"binary").unwrap();
    let txt = tmp.path().join("plain.txt");
    std::fs::write(&txt, "plain text page").unwrap();

    let indexed = indexer
        .index_documents(&[mobi.clone(), txt.clone()], 2)
        .await;
    assert_eq!(indexed, 2);

    let hits = indexer.index().search("kindle two", 10).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].page_number, 2);
    assert!(indexer.is_indexed(&txt).await);
}
