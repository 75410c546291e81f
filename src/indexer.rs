//! Feeds documents through the readers into the search index.
//!
//! Single documents are indexed inline. Batches run on a fixed pool of tokio
//! workers pulling paths from a shared queue; each worker reports its
//! outcome on a result channel that the caller drains, so progress is
//! reported in completion order. Text extraction is blocking and runs on
//! `spawn_blocking`.
//!
//! A document is `NotIndexed` until a worker picks it up, `Indexing` while
//! it is extracted and written, then `Indexed`. A failure leaves it (or puts
//! it back) in `NotIndexed` and is logged, never raised: pages left over
//! from an earlier successful run are removed from the index. Runs for the
//! same path may overlap; it stays `Indexing` until the last one finishes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn, Span};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Reported, Result};
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};
use crate::reader::ReaderRegistry;
use crate::search_index::SearchIndex;

pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    NotIndexed,
    Indexing,
    Indexed,
}

#[derive(Clone)]
pub struct DocumentIndexer {
    index: Arc<SearchIndex>,
    readers: Arc<ReaderRegistry>,
    max_workers: usize,
    /// Running `index_document` calls per document key.
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    progress: Arc<dyn IndexProgressReporter>,
    span: Span,
}

impl DocumentIndexer {
    pub fn new(index: Arc<SearchIndex>, readers: ReaderRegistry) -> Self {
        let span = tracing::info_span!(parent: index.span(), "indexer");
        Self {
            index,
            readers: Arc::new(readers),
            max_workers: DEFAULT_MAX_WORKERS,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(NoProgress),
            span,
        }
    }

    /// Open the search index named by `config` with the built-in readers.
    pub async fn open(config: &Config) -> Result<Self> {
        let index = SearchIndex::open_with_history(
            config.search_index_db_path(),
            config.search.history_limit,
        )
        .await?;
        let readers = ReaderRegistry::with_defaults(config.indexing.lines_per_page);
        Ok(Self::new(Arc::new(index), readers).with_max_workers(config.indexing.max_workers))
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_progress(mut self, reporter: Box<dyn IndexProgressReporter>) -> Self {
        self.progress = Arc::from(reporter);
        self
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn readers(&self) -> &ReaderRegistry {
        &self.readers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn supported_extensions(&self) -> Vec<String> {
        self.readers.supported_extensions()
    }

    pub async fn is_indexed(&self, path: &Path) -> bool {
        self.index.is_indexed(&document_key(path)).await
    }

    pub async fn state(&self, path: &Path) -> DocumentState {
        let key = document_key(path);
        if self.in_flight.lock().contains_key(&key) {
            DocumentState::Indexing
        } else if self.index.is_indexed(&key).await {
            DocumentState::Indexed
        } else {
            DocumentState::NotIndexed
        }
    }

    /// Extract and index one document, replacing any earlier entry for it.
    #[instrument(parent = &self.span, skip(self, path), fields(path = %path.display()))]
    pub async fn index_document(&self, path: &Path) -> bool {
        let key = document_key(path);
        *self.in_flight.lock().entry(key.clone()).or_insert(0) += 1;
        let result = self.try_index_document(path, &key).await;
        if result.is_err() && self.runs_in_flight(&key) == 1 {
            self.drop_stale(&key).await;
        }
        self.finish_run(&key);
        result.reported("index_document").is_some()
    }

    fn runs_in_flight(&self, key: &str) -> usize {
        self.in_flight.lock().get(key).copied().unwrap_or(0)
    }

    fn finish_run(&self, key: &str) {
        let mut in_flight = self.in_flight.lock();
        if let Some(runs) = in_flight.get_mut(key) {
            *runs -= 1;
            if *runs == 0 {
                in_flight.remove(key);
            }
        }
    }

    /// Remove pages indexed by an earlier run so a failed document is no
    /// longer searchable.
    async fn drop_stale(&self, key: &str) {
        if self.index.is_indexed(key).await && self.index.remove_document(key).await {
            warn!(path = key, "removed stale pages after failed re-index");
        }
    }

    async fn try_index_document(&self, path: &Path, key: &str) -> Result<()> {
        if !path.is_file() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        if !self.readers.is_supported(path) {
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_else(|| path.display().to_string());
            return Err(Error::UnsupportedFormat(ext));
        }

        let readers = Arc::clone(&self.readers);
        let owned = path.to_path_buf();
        let pages = tokio::task::spawn_blocking(move || readers.extract_pages(&owned))
            .await
            .map_err(|e| Error::Index(format!("extraction task failed: {e}")))??;

        if pages.iter().all(|p| p.trim().is_empty()) {
            return Err(Error::Extract {
                path: key.to_string(),
                message: "no text content".into(),
            });
        }
        self.index.try_index_document(key, &pages).await
    }

    /// Index `paths` on a pool of `max_workers` tasks. Returns how many
    /// documents were indexed.
    #[instrument(parent = &self.span, skip(self, paths), fields(documents = paths.len()))]
    pub async fn index_documents(&self, paths: &[PathBuf], max_workers: usize) -> usize {
        if paths.is_empty() {
            return 0;
        }
        let total = paths.len() as u64;
        let workers = max_workers.clamp(1, paths.len());
        info!(workers, "indexing documents");
        self.progress.report(IndexProgressEvent::Started { total });

        let (job_tx, job_rx) = mpsc::channel::<PathBuf>(paths.len());
        for path in paths {
            // Capacity equals the job count, so this never waits.
            if job_tx.send(path.clone()).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(PathBuf, bool)>();

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let indexer = self.clone();
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = jobs.lock().await.recv().await;
                    let Some(path) = next else { break };
                    let ok = indexer.index_document(&path).await;
                    if results.send((path, ok)).is_err() {
                        break;
                    }
                }
                debug!(worker, "index worker finished");
            }));
        }
        drop(result_tx);

        let mut done = 0u64;
        let mut indexed = 0usize;
        while let Some((path, ok)) = result_rx.recv().await {
            done += 1;
            if ok {
                indexed += 1;
            }
            self.progress.report(IndexProgressEvent::Document {
                path: path.display().to_string(),
                indexed: ok,
                n: done,
                total,
            });
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "index worker panicked");
            }
        }

        self.progress.report(IndexProgressEvent::Finished {
            indexed: indexed as u64,
            total,
        });
        info!(indexed, total, "batch indexing finished");
        indexed
    }

    /// Index every supported file under `root`.
    pub async fn index_directory(&self, root: &Path) -> usize {
        let paths = self.discover(root);
        if paths.is_empty() {
            warn!(parent: &self.span, root = %root.display(), "no supported documents found");
            return 0;
        }
        self.index_documents(&paths, self.max_workers).await
    }

    /// Supported files under `root`, sorted.
    pub fn discover(&self, root: &Path) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| self.readers.is_supported(p))
            .collect();
        paths.sort();
        paths
    }

    /// Clear the index and index every previously indexed document again.
    /// Documents that no longer exist drop out.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn reindex_all(&self) -> usize {
        let documents: Vec<PathBuf> = self
            .index
            .get_indexed_documents()
            .await
            .into_iter()
            .map(PathBuf::from)
            .collect();
        if !self.index.clear_index().await {
            return 0;
        }
        self.index_documents(&documents, self.max_workers).await
    }
}

/// The key a document is stored under in the index.
fn document_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
