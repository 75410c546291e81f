//! Page-level text extraction for ebook formats.
//!
//! A [`DocumentReader`] loads one file and exposes its text page by page.
//! The [`ReaderRegistry`] maps lowercase file extensions to reader
//! factories; the indexer asks it for a fresh reader per document.
//!
//! Built-in readers:
//!
//! | Extension | Reader | Pages |
//! |-----------|--------|-------|
//! | `txt` | [`TextReader`] | fixed number of lines per page |
//! | `pdf` | [`PdfReader`] | split on form feed |
//! | `epub` | [`EpubReader`] | one page per spine item |
//!
//! `mobi` is recognized as an ebook format but has no built-in reader.
//! Loading one fails with [`Error::UnsupportedFormat`] until a reader is
//! registered for it.

use marginalia_core::text::html_to_plain_text;
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Extensions treated as ebooks, whether or not a reader exists for them.
pub const RECOGNIZED_EXTENSIONS: &[&str] = &["epub", "mobi", "pdf", "txt"];

/// Maximum decompressed bytes read from a single EPUB entry (zip-bomb protection).
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Text access to one loaded document. Page indices are 0-based.
pub trait DocumentReader: Send {
    fn load(&mut self, path: &Path) -> Result<()>;

    fn page_count(&self) -> usize;

    fn page_text(&self, index: usize) -> Option<&str>;

    /// Every page in order.
    fn pages(&self) -> Vec<String> {
        (0..self.page_count())
            .filter_map(|i| self.page_text(i))
            .map(str::to_string)
            .collect()
    }
}

pub type ReaderFactory = Arc<dyn Fn() -> Box<dyn DocumentReader> + Send + Sync>;

#[derive(Clone)]
pub struct ReaderRegistry {
    factories: HashMap<String, ReaderFactory>,
    recognized: BTreeSet<String>,
}

impl ReaderRegistry {
    /// A registry with no readers that still recognizes the ebook extensions.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            recognized: RECOGNIZED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The built-in readers. Text files are paged every `lines_per_page` lines.
    pub fn with_defaults(lines_per_page: usize) -> Self {
        let mut registry = Self::empty();
        registry.register("txt", move || {
            Box::new(TextReader::new(lines_per_page)) as Box<dyn DocumentReader>
        });
        registry.register("pdf", || Box::new(PdfReader::default()) as Box<dyn DocumentReader>);
        registry.register("epub", || Box::new(EpubReader::default()) as Box<dyn DocumentReader>);
        registry
    }

    /// Register (or replace) the reader for an extension.
    pub fn register<F>(&mut self, extension: &str, factory: F)
    where
        F: Fn() -> Box<dyn DocumentReader> + Send + Sync + 'static,
    {
        let ext = normalize_extension(extension);
        self.recognized.insert(ext.clone());
        self.factories.insert(ext, Arc::new(factory));
    }

    /// Recognized extensions, sorted, without the leading dot.
    pub fn supported_extensions(&self) -> Vec<String> {
        self.recognized.iter().cloned().collect()
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.recognized.contains(&ext))
    }

    /// A fresh, unloaded reader for `path`.
    pub fn reader_for(&self, path: &Path) -> Result<Box<dyn DocumentReader>> {
        let ext = extension_of(path).unwrap_or_default();
        match self.factories.get(&ext) {
            Some(factory) => Ok(factory()),
            None => Err(Error::UnsupportedFormat(if ext.is_empty() {
                path.display().to_string()
            } else {
                format!(".{ext}")
            })),
        }
    }

    /// Load `path` and return its pages. Blocking.
    pub fn extract_pages(&self, path: &Path) -> Result<Vec<String>> {
        let mut reader = self.reader_for(path)?;
        reader.load(path)?;
        Ok(reader.pages())
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::with_defaults(50)
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(normalize_extension)
}

fn extract_error(path: &Path, message: impl std::fmt::Display) -> Error {
    Error::Extract {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Plain text
// ═══════════════════════════════════════════════════════════════════════

pub struct TextReader {
    lines_per_page: usize,
    pages: Vec<String>,
}

impl TextReader {
    pub fn new(lines_per_page: usize) -> Self {
        Self {
            lines_per_page: lines_per_page.max(1),
            pages: Vec::new(),
        }
    }
}

impl DocumentReader for TextReader {
    fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        self.pages = lines
            .chunks(self.lines_per_page)
            .map(|chunk| chunk.join("\n"))
            .collect();
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_text(&self, index: usize) -> Option<&str> {
        self.pages.get(index).map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// PDF
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct PdfReader {
    pages: Vec<String>,
}

impl DocumentReader for PdfReader {
    fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let text =
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| extract_error(path, e))?;
        self.pages = split_form_feeds(&text);
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_text(&self, index: usize) -> Option<&str> {
        self.pages.get(index).map(String::as_str)
    }
}

/// pdf-extract ends every page with a form feed, so a trailing empty
/// segment is not a page.
fn split_form_feeds(text: &str) -> Vec<String> {
    let mut pages: Vec<String> = text.split('\x0c').map(str::to_string).collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    pages
}

// ═══════════════════════════════════════════════════════════════════════
// EPUB
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct EpubReader {
    pages: Vec<String>,
}

impl DocumentReader for EpubReader {
    fn load(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| extract_error(path, e))?;

        let container = read_zip_entry_bounded(&mut archive, "META-INF/container.xml")
            .map_err(|e| extract_error(path, e))?;
        let opf_path = rootfile_path(&container)
            .ok_or_else(|| extract_error(path, "container.xml names no rootfile"))?;
        let opf = read_zip_entry_bounded(&mut archive, &opf_path)
            .map_err(|e| extract_error(path, e))?;
        let base = match opf_path.rfind('/') {
            Some(i) => &opf_path[..=i],
            None => "",
        };

        let mut pages = Vec::new();
        for href in spine_hrefs(&opf).map_err(|e| extract_error(path, e))? {
            let entry = format!("{base}{href}");
            let xhtml = read_zip_entry_bounded(&mut archive, &entry)
                .map_err(|e| extract_error(path, e))?;
            pages.push(html_to_plain_text(body_of(&String::from_utf8_lossy(&xhtml))));
        }
        self.pages = pages;
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_text(&self, index: usize) -> Option<&str> {
        self.pages.get(index).map(String::as_str)
    }
}

fn read_zip_entry_bounded<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| format!("{name}: {e}"))?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| format!("{name}: {e}"))?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_ENTRY_BYTES
        ));
    }
    Ok(out)
}

/// The `full-path` of the first `<rootfile>` in `META-INF/container.xml`.
fn rootfile_path(xml: &[u8]) -> Option<String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                return attribute(&e, b"full-path");
            }
            Ok(quick_xml::events::Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Content documents in reading order: spine `idref`s resolved through the
/// manifest.
fn spine_hrefs(opf: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut spine: Vec<String> = Vec::new();

    let mut reader = quick_xml::Reader::from_reader(opf);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"item" => {
                        if let (Some(id), Some(href)) = (attribute(&e, b"id"), attribute(&e, b"href"))
                        {
                            manifest.insert(id, href);
                        }
                    }
                    b"itemref" => {
                        if let Some(idref) = attribute(&e, b"idref") {
                            spine.push(idref);
                        }
                    }
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    Ok(spine
        .iter()
        .filter_map(|idref| manifest.get(idref).cloned())
        .collect())
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// The markup from `<body` on, so that head metadata is not indexed.
fn body_of(xhtml: &str) -> &str {
    match xhtml.to_ascii_lowercase().find("<body") {
        Some(i) => &xhtml[i..],
        None => xhtml,
    }
}
