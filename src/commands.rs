//! Command implementations for the `marg` binary.
//!
//! Each `run_*` function opens what it needs from the config, performs one
//! operation, and prints a human-readable result to stdout. Failures the
//! library reports as `false`/`None` become errors here so the process
//! exits non-zero.

use anyhow::{bail, Context, Result};
use marginalia::config::Config;
use marginalia::export::ExportFormat;
use marginalia::indexer::DocumentIndexer;
use marginalia::progress::ProgressMode;
use marginalia::{
    Annotation, AnnotationCoordinator, AnnotationFilter, AnnotationKind, AnnotationType, Category,
    Point, TextSelection,
};
use std::path::{Path, PathBuf};

async fn coordinator(config: &Config) -> Result<AnnotationCoordinator> {
    AnnotationCoordinator::open(config)
        .await
        .with_context(|| {
            format!(
                "Failed to open annotation database: {}",
                config.annotations_db_path().display()
            )
        })
}

async fn indexer(config: &Config) -> Result<DocumentIndexer> {
    DocumentIndexer::open(config).await.with_context(|| {
        format!(
            "Failed to open search index: {}",
            config.search_index_db_path().display()
        )
    })
}

pub async fn run_init(config: &Config) -> Result<()> {
    let c = coordinator(config).await?;
    let idx = indexer(config).await?;
    let categories = c.categories().get_categories(true).await.len();
    println!("Data directory: {}", config.data_dir().display());
    println!("  annotations:  {}", c.store().path().display());
    println!("  search index: {}", idx.index().path().display());
    println!("  categories:   {}", categories);
    println!("Databases initialized successfully.");
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Annotations
// ═══════════════════════════════════════════════════════════════════════

fn print_annotation(a: &Annotation) {
    let detail = match &a.kind {
        AnnotationKind::Bookmark(b) => b.title.clone(),
        AnnotationKind::Highlight(h) => format!(
            "[{}..{}] {} {}",
            h.text_selection.start_char_index,
            h.text_selection.end_char_index,
            h.color,
            h.highlighted_text
        ),
        AnnotationKind::Note(n) => match &n.parent_note_id {
            Some(parent) => format!("{} (reply to {})", n.plain_text, parent),
            None => n.plain_text.clone(),
        },
    };
    println!(
        "{}  {:<9} p.{:<4} {}",
        a.id,
        a.annotation_type().as_str(),
        a.page_number,
        detail.replace('\n', " ")
    );
}

fn print_annotations(annotations: &[Annotation]) {
    if annotations.is_empty() {
        println!("No annotations.");
        return;
    }
    for a in annotations {
        print_annotation(a);
    }
}

pub async fn run_bookmark_add(
    config: &Config,
    document: &str,
    page: u32,
    title: &str,
    description: &str,
) -> Result<()> {
    let c = coordinator(config).await?;
    let Some(bookmark) = c
        .bookmarks()
        .create(document, page, title, description, None)
        .await
    else {
        bail!("Failed to create bookmark on page {}", page);
    };
    print_annotation(&bookmark);
    Ok(())
}

pub async fn run_bookmark_list(config: &Config, document: &str, page: Option<u32>) -> Result<()> {
    let c = coordinator(config).await?;
    print_annotations(&c.bookmarks().list(document, page).await);
    Ok(())
}

pub async fn run_bookmark_delete(config: &Config, id: &str) -> Result<()> {
    let c = coordinator(config).await?;
    if !c.bookmarks().delete(id).await {
        bail!("No bookmark with id {}", id);
    }
    println!("Deleted bookmark {}", id);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_highlight_add(
    config: &Config,
    document: &str,
    page: u32,
    start: usize,
    end: usize,
    text: &str,
    color: Option<&str>,
    note: &str,
) -> Result<()> {
    let c = coordinator(config).await?;
    let selection = TextSelection::new(Point::default(), Point::default(), start, end, text);
    let Some(highlight) = c
        .highlights()
        .create(document, page, selection, color, note)
        .await
    else {
        bail!("Failed to create highlight on page {}", page);
    };
    print_annotation(&highlight);
    Ok(())
}

pub async fn run_highlight_list(config: &Config, document: &str, page: Option<u32>) -> Result<()> {
    let c = coordinator(config).await?;
    print_annotations(&c.highlights().list(document, page).await);
    Ok(())
}

pub async fn run_highlight_merge(config: &Config, ids: &[String], color: Option<&str>) -> Result<()> {
    let c = coordinator(config).await?;
    let Some(merged) = c.highlights().merge(ids, color).await else {
        bail!("Highlights could not be merged (need two or more on the same page)");
    };
    print_annotation(&merged);
    Ok(())
}

pub async fn run_highlight_split(config: &Config, id: &str, position: usize) -> Result<()> {
    let c = coordinator(config).await?;
    let Some((left, right)) = c.highlights().split(id, position).await else {
        bail!("Highlight {} could not be split at {}", id, position);
    };
    print_annotation(&left);
    print_annotation(&right);
    Ok(())
}

pub async fn run_highlight_delete(config: &Config, id: &str) -> Result<()> {
    let c = coordinator(config).await?;
    if !c.highlights().delete(id).await {
        bail!("No highlight with id {}", id);
    }
    println!("Deleted highlight {}", id);
    Ok(())
}

pub async fn run_note_add(
    config: &Config,
    document: &str,
    page: u32,
    content: &str,
    x: f64,
    y: f64,
) -> Result<()> {
    let c = coordinator(config).await?;
    let Some(note) = c
        .notes()
        .create(document, page, Point::new(x, y), content)
        .await
    else {
        bail!("Failed to create note on page {}", page);
    };
    print_annotation(&note);
    Ok(())
}

pub async fn run_note_reply(config: &Config, parent: &str, content: &str) -> Result<()> {
    let c = coordinator(config).await?;
    let Some(reply) = c.notes().create_reply(parent, content).await else {
        bail!("Failed to reply to note {}", parent);
    };
    print_annotation(&reply);
    Ok(())
}

pub async fn run_note_thread(config: &Config, id: &str) -> Result<()> {
    let c = coordinator(config).await?;
    let thread = c.notes().get_thread(id).await;
    if thread.is_empty() {
        bail!("No note with id {}", id);
    }
    print_annotations(&thread);
    Ok(())
}

pub async fn run_note_delete(config: &Config, id: &str) -> Result<()> {
    let c = coordinator(config).await?;
    if !c.notes().delete(id).await {
        bail!("No note with id {}", id);
    }
    println!("Deleted note {} and its replies", id);
    Ok(())
}

pub async fn run_annotations_list(config: &Config, document: &str, page: Option<u32>) -> Result<()> {
    let c = coordinator(config).await?;
    print_annotations(&c.get_all_annotations(document, page).await);
    Ok(())
}

pub async fn run_annotations_search(
    config: &Config,
    query: &str,
    document: Option<String>,
    kind: Option<String>,
    category: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let annotation_type = kind
        .as_deref()
        .map(str::parse::<AnnotationType>)
        .transpose()?;
    let filter = AnnotationFilter {
        document_path: document,
        annotation_type,
        category,
        ..Default::default()
    };
    let c = coordinator(config).await?;
    let limit = limit.unwrap_or(config.search.max_results);
    let results = c.search_annotations(query, &filter, limit).await;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} p.{} ({})",
            i + 1,
            r.relevance_score,
            r.annotation.document_path,
            r.annotation.page_number,
            r.annotation.annotation_type().as_str()
        );
        println!(
            "    excerpt: \"{}\"",
            r.context_snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", r.annotation.id);
        println!();
    }
    Ok(())
}

pub async fn run_annotations_export(
    config: &Config,
    document: &str,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let c = coordinator(config).await?;
    let Some(data) = c.export(document, format).await else {
        bail!("Export of {} failed", document);
    };
    match output {
        Some(path) => {
            std::fs::write(path, data)
                .with_context(|| format!("Failed to write export: {}", path.display()))?;
            eprintln!("Exported {} as {} to {}", document, format, path.display());
        }
        None => println!("{}", data),
    }
    Ok(())
}

pub async fn run_annotations_import(config: &Config, input: &Path, format: ExportFormat) -> Result<()> {
    let data = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read import file: {}", input.display()))?;
    let c = coordinator(config).await?;
    let Some(report) = c.import_report(&data, format).await else {
        bail!("{} is not valid {} export data", input.display(), format);
    };
    println!(
        "Imported {} annotations ({} failed)",
        report.success_count, report.failure_count
    );
    for error in &report.errors {
        println!("  {}", error);
    }
    if report.failure_count > 0 {
        bail!("{} annotations could not be imported", report.failure_count);
    }
    Ok(())
}

pub async fn run_annotations_stats(config: &Config, document: Option<&str>) -> Result<()> {
    let c = coordinator(config).await?;
    let stats = c.get_statistics(document).await;
    match &stats.document_path {
        Some(path) => println!("Annotations in {}: {}", path, stats.total),
        None => println!("Annotations: {}", stats.total),
    }
    for (kind, count) in &stats.by_type {
        println!("  {:<10} {}", kind, count);
    }

    let cats = c.categories().get_category_statistics().await;
    println!(
        "Categories: {} ({} active, {} default, {} top level)",
        cats.total_categories, cats.active_categories, cats.default_categories, cats.root_categories
    );
    if let Some(most) = &cats.most_used {
        println!("  most used:  {} ({})", most.name, most.count);
    }
    if let Some(least) = &cats.least_used {
        println!("  least used: {} ({})", least.name, least.count);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Categories
// ═══════════════════════════════════════════════════════════════════════

fn print_category(c: &Category, depth: usize) {
    let marker = if c.is_default { " *" } else { "" };
    let inactive = if c.is_active { "" } else { " (inactive)" };
    println!(
        "{}{} {} [{}] {}{}{}",
        "  ".repeat(depth),
        c.color,
        c.name,
        c.annotation_count,
        c.id,
        marker,
        inactive
    );
}

pub async fn run_category_list(config: &Config, all: bool) -> Result<()> {
    let c = coordinator(config).await?;
    if all {
        for category in c.categories().get_categories(true).await {
            print_category(&category, 0);
        }
        return Ok(());
    }

    let hierarchy = c.categories().get_hierarchy().await;
    let mut stack: Vec<(Category, usize)> = hierarchy
        .get(marginalia_core::hierarchy::ROOT_KEY)
        .map(|roots| roots.iter().rev().map(|r| (r.clone(), 0)).collect())
        .unwrap_or_default();
    if stack.is_empty() {
        println!("No categories.");
    }
    while let Some((category, depth)) = stack.pop() {
        print_category(&category, depth);
        if let Some(children) = hierarchy.get(&category.id) {
            stack.extend(children.iter().rev().map(|ch| (ch.clone(), depth + 1)));
        }
    }
    Ok(())
}

pub async fn run_category_add(
    config: &Config,
    name: &str,
    color: &str,
    parent: Option<&str>,
    description: &str,
) -> Result<()> {
    let c = coordinator(config).await?;
    let Some(category) = c
        .categories()
        .create(name, color, parent, description)
        .await
    else {
        bail!("Failed to create category {:?}", name);
    };
    print_category(&category, 0);
    Ok(())
}

pub async fn run_category_move(config: &Config, id: &str, parent: Option<&str>) -> Result<()> {
    let c = coordinator(config).await?;
    if !c.categories().move_category(id, parent).await {
        bail!("Category {} could not be moved", id);
    }
    let path: Vec<String> = c
        .categories()
        .get_path(id)
        .await
        .into_iter()
        .map(|cat| cat.name)
        .collect();
    println!("Moved: {}", path.join(" / "));
    Ok(())
}

pub async fn run_category_delete(config: &Config, id: &str, reassign_to: Option<&str>) -> Result<()> {
    let c = coordinator(config).await?;
    if !c.categories().delete(id, reassign_to).await {
        bail!("Category {} could not be deleted", id);
    }
    println!("Deleted category {}", id);
    Ok(())
}

pub async fn run_category_template(config: &Config, name: Option<&str>) -> Result<()> {
    let c = coordinator(config).await?;
    let Some(name) = name else {
        println!("Available templates:");
        for t in c.categories().available_templates() {
            println!("  {}", t);
        }
        return Ok(());
    };
    let Some(created) = c.categories().apply_template(name).await else {
        bail!("Unknown template {:?}", name);
    };
    println!("Applied template {}: {} categories created", name, created.len());
    for category in &created {
        print_category(category, 1);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Document index
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_index_add(
    config: &Config,
    paths: &[PathBuf],
    workers: Option<usize>,
    progress: ProgressMode,
) -> Result<()> {
    let idx = indexer(config).await?.with_progress(progress.reporter());
    let workers = workers.unwrap_or(idx.max_workers());
    let indexed = idx.index_documents(paths, workers).await;
    println!("Indexed {} of {} documents.", indexed, paths.len());
    if indexed < paths.len() {
        bail!("{} documents could not be indexed", paths.len() - indexed);
    }
    Ok(())
}

pub async fn run_index_dir(config: &Config, root: &Path, progress: ProgressMode) -> Result<()> {
    if !root.is_dir() {
        bail!("Not a directory: {}", root.display());
    }
    let idx = indexer(config).await?.with_progress(progress.reporter());
    let indexed = idx.index_directory(root).await;
    println!("Indexed {} documents under {}", indexed, root.display());
    Ok(())
}

pub async fn run_index_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    let idx = indexer(config).await?;
    let limit = limit.unwrap_or(config.search.max_results);
    let results = idx.index().search(query, limit).await;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!("{}. [{:.2}] {} p.{}", i + 1, r.relevance, r.document_path, r.page_number);
        println!("    excerpt: \"{}\"", r.snippet.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

pub async fn run_index_list(config: &Config) -> Result<()> {
    let idx = indexer(config).await?;
    let documents = idx.index().get_indexed_documents().await;
    if documents.is_empty() {
        println!("No indexed documents.");
        return Ok(());
    }
    for doc in &documents {
        println!("{}  ({} pages)", doc, idx.index().page_count(doc).await);
    }
    Ok(())
}

pub async fn run_index_clear(config: &Config) -> Result<()> {
    let idx = indexer(config).await?;
    if !idx.index().clear_index().await {
        bail!("Failed to clear the search index");
    }
    println!("Search index cleared.");
    Ok(())
}

pub async fn run_index_reindex(config: &Config, progress: ProgressMode) -> Result<()> {
    let idx = indexer(config).await?.with_progress(progress.reporter());
    let indexed = idx.reindex_all().await;
    println!("Reindexed {} documents.", indexed);
    Ok(())
}

pub async fn run_index_history(config: &Config, limit: usize, clear: bool) -> Result<()> {
    let idx = indexer(config).await?;
    if clear {
        if !idx.index().clear_search_history().await {
            bail!("Failed to clear search history");
        }
        println!("Search history cleared.");
        return Ok(());
    }
    let history = idx.index().get_search_history(limit).await;
    if history.is_empty() {
        println!("No search history.");
    }
    for query in history {
        println!("{}", query);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Backup
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_backup(config: &Config, dest: &Path) -> Result<()> {
    let c = coordinator(config).await?;
    if !c.backup(dest).await {
        bail!("Backup to {} failed", dest.display());
    }
    println!("Backed up annotations to {}", dest.display());
    Ok(())
}

pub async fn run_restore(config: &Config, src: &Path) -> Result<()> {
    if !src.is_file() {
        bail!("Backup file not found: {}", src.display());
    }
    let c = coordinator(config).await?;
    if !c.restore(src).await {
        bail!("Restore from {} failed", src.display());
    }
    println!("Restored annotations from {}", src.display());
    Ok(())
}
