//! # Marginalia CLI (`marg`)
//!
//! The `marg` binary drives the annotation store and the document search
//! index from the command line.
//!
//! ## Usage
//!
//! ```bash
//! marg --config ~/.config/marginalia.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `marg init` | Create both databases and seed the default categories |
//! | `marg bookmark add\|list\|delete` | Manage bookmarks |
//! | `marg highlight add\|list\|merge\|split\|delete` | Manage highlights |
//! | `marg note add\|reply\|thread\|delete` | Manage notes and reply threads |
//! | `marg category list\|add\|move\|delete\|template` | Manage the category tree |
//! | `marg annotations list\|search\|export\|import\|stats` | Cross-type queries and exchange |
//! | `marg index add\|dir\|search\|list\|clear\|reindex\|history` | Document full-text index |
//! | `marg backup <dest>` / `marg restore <src>` | Snapshot the annotation database |
//! | `marg completions <shell>` | Print shell completions |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default
//! `marginalia=info`); stdout carries only command output.

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use marginalia::config;
use marginalia::export::ExportFormat;
use marginalia::progress::ProgressMode;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Marginalia CLI: ebook annotations and full-text document search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults and `~/.marginalia` as the
/// data directory.
#[derive(Parser)]
#[command(
    name = "marg",
    about = "Marginalia: ebook annotations and full-text document search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/marginalia.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the annotation database and search index.
    ///
    /// Idempotent. Seeds the default categories on first run.
    Init,

    /// Manage bookmarks.
    Bookmark {
        #[command(subcommand)]
        action: BookmarkAction,
    },

    /// Manage highlights.
    Highlight {
        #[command(subcommand)]
        action: HighlightAction,
    },

    /// Manage notes and reply threads.
    Note {
        #[command(subcommand)]
        action: NoteAction,
    },

    /// Manage the category tree.
    Category {
        #[command(subcommand)]
        action: CategoryAction,
    },

    /// Query, search, export, and import annotations of every type.
    Annotations {
        #[command(subcommand)]
        action: AnnotationsAction,
    },

    /// Index document text and search it.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Write a snapshot of the annotation database.
    Backup {
        /// Destination file. Overwritten if it exists.
        dest: PathBuf,
    },

    /// Replace the annotation database with a snapshot.
    Restore {
        /// Snapshot written by `marg backup`.
        src: PathBuf,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum BookmarkAction {
    /// Bookmark a page.
    Add {
        document: String,
        page: u32,
        /// Defaults to "Page N".
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List a document's bookmarks.
    List {
        document: String,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Delete a bookmark by id.
    Delete { id: String },
}

#[derive(Subcommand)]
enum HighlightAction {
    /// Highlight a text selection.
    Add {
        document: String,
        page: u32,
        /// Selection start (character index on the page).
        #[arg(long)]
        start: usize,
        /// Selection end (exclusive).
        #[arg(long)]
        end: usize,
        /// The selected text.
        #[arg(long)]
        text: String,
        /// Palette name (`yellow`, `green`, ...) or `#RRGGBB`.
        #[arg(long)]
        color: Option<String>,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// List a document's highlights.
    List {
        document: String,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Merge two or more highlights on one page into one.
    Merge {
        #[arg(required = true, num_args = 2..)]
        ids: Vec<String>,
        #[arg(long)]
        color: Option<String>,
    },
    /// Split a highlight at a character position.
    Split { id: String, position: usize },
    /// Delete a highlight by id.
    Delete { id: String },
}

#[derive(Subcommand)]
enum NoteAction {
    /// Add a note to a page.
    Add {
        document: String,
        page: u32,
        /// Note content; HTML is allowed.
        content: String,
        #[arg(long, default_value_t = 0.0)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
    },
    /// Reply to a note.
    Reply { parent: String, content: String },
    /// Print a note's whole thread.
    Thread { id: String },
    /// Delete a note and all replies under it.
    Delete { id: String },
}

#[derive(Subcommand)]
enum CategoryAction {
    /// Print the category tree.
    List {
        /// Flat list including inactive categories.
        #[arg(long)]
        all: bool,
    },
    /// Create a category.
    Add {
        name: String,
        /// Palette name or `#RRGGBB`.
        #[arg(long, default_value = "#808080")]
        color: String,
        /// Parent category id.
        #[arg(long)]
        parent: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Re-parent a category. Omit `--parent` to make it top level.
    Move {
        id: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Delete a category, moving its annotations to another.
    Delete {
        id: String,
        #[arg(long)]
        reassign_to: Option<String>,
    },
    /// Apply a category template. Lists templates when no name is given.
    Template { name: Option<String> },
}

#[derive(Subcommand)]
enum AnnotationsAction {
    /// List every annotation of a document, oldest first.
    List {
        document: String,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Full-text search over annotations.
    Search {
        query: String,
        #[arg(long)]
        document: Option<String>,
        /// `bookmark`, `highlight`, or `note`.
        #[arg(long = "type")]
        kind: Option<String>,
        /// Category id.
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Export a document's annotations.
    Export {
        document: String,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        /// Write to a file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Import annotations from an export file.
    Import {
        input: PathBuf,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },
    /// Annotation and category statistics.
    Stats {
        #[arg(long)]
        document: Option<String>,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Index documents.
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Worker count (defaults to `indexing.max_workers`).
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
    /// Index every supported document under a directory.
    Dir {
        root: PathBuf,
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
    /// Search indexed document text.
    Search {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List indexed documents.
    List,
    /// Remove every document from the index.
    Clear,
    /// Re-extract and re-index every indexed document.
    Reindex {
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
    /// Show or clear recent search queries.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        clear: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marginalia=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "marg", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;
    let progress = |mode: Option<ProgressMode>| mode.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Bookmark { action } => match action {
            BookmarkAction::Add {
                document,
                page,
                title,
                description,
            } => commands::run_bookmark_add(&cfg, &document, page, &title, &description).await?,
            BookmarkAction::List { document, page } => {
                commands::run_bookmark_list(&cfg, &document, page).await?
            }
            BookmarkAction::Delete { id } => commands::run_bookmark_delete(&cfg, &id).await?,
        },
        Commands::Highlight { action } => match action {
            HighlightAction::Add {
                document,
                page,
                start,
                end,
                text,
                color,
                note,
            } => {
                commands::run_highlight_add(
                    &cfg,
                    &document,
                    page,
                    start,
                    end,
                    &text,
                    color.as_deref(),
                    &note,
                )
                .await?
            }
            HighlightAction::List { document, page } => {
                commands::run_highlight_list(&cfg, &document, page).await?
            }
            HighlightAction::Merge { ids, color } => {
                commands::run_highlight_merge(&cfg, &ids, color.as_deref()).await?
            }
            HighlightAction::Split { id, position } => {
                commands::run_highlight_split(&cfg, &id, position).await?
            }
            HighlightAction::Delete { id } => commands::run_highlight_delete(&cfg, &id).await?,
        },
        Commands::Note { action } => match action {
            NoteAction::Add {
                document,
                page,
                content,
                x,
                y,
            } => commands::run_note_add(&cfg, &document, page, &content, x, y).await?,
            NoteAction::Reply { parent, content } => {
                commands::run_note_reply(&cfg, &parent, &content).await?
            }
            NoteAction::Thread { id } => commands::run_note_thread(&cfg, &id).await?,
            NoteAction::Delete { id } => commands::run_note_delete(&cfg, &id).await?,
        },
        Commands::Category { action } => match action {
            CategoryAction::List { all } => commands::run_category_list(&cfg, all).await?,
            CategoryAction::Add {
                name,
                color,
                parent,
                description,
            } => {
                commands::run_category_add(&cfg, &name, &color, parent.as_deref(), &description)
                    .await?
            }
            CategoryAction::Move { id, parent } => {
                commands::run_category_move(&cfg, &id, parent.as_deref()).await?
            }
            CategoryAction::Delete { id, reassign_to } => {
                commands::run_category_delete(&cfg, &id, reassign_to.as_deref()).await?
            }
            CategoryAction::Template { name } => {
                commands::run_category_template(&cfg, name.as_deref()).await?
            }
        },
        Commands::Annotations { action } => match action {
            AnnotationsAction::List { document, page } => {
                commands::run_annotations_list(&cfg, &document, page).await?
            }
            AnnotationsAction::Search {
                query,
                document,
                kind,
                category,
                limit,
            } => {
                commands::run_annotations_search(&cfg, &query, document, kind, category, limit)
                    .await?
            }
            AnnotationsAction::Export {
                document,
                format,
                output,
            } => {
                commands::run_annotations_export(&cfg, &document, format, output.as_deref())
                    .await?
            }
            AnnotationsAction::Import { input, format } => {
                commands::run_annotations_import(&cfg, &input, format).await?
            }
            AnnotationsAction::Stats { document } => {
                commands::run_annotations_stats(&cfg, document.as_deref()).await?
            }
        },
        Commands::Index { action } => match action {
            IndexAction::Add {
                paths,
                workers,
                progress: mode,
            } => commands::run_index_add(&cfg, &paths, workers, progress(mode)).await?,
            IndexAction::Dir {
                root,
                progress: mode,
            } => commands::run_index_dir(&cfg, &root, progress(mode)).await?,
            IndexAction::Search { query, limit } => {
                commands::run_index_search(&cfg, &query, limit).await?
            }
            IndexAction::List => commands::run_index_list(&cfg).await?,
            IndexAction::Clear => commands::run_index_clear(&cfg).await?,
            IndexAction::Reindex { progress: mode } => {
                commands::run_index_reindex(&cfg, progress(mode)).await?
            }
            IndexAction::History { limit, clear } => {
                commands::run_index_history(&cfg, limit, clear).await?
            }
        },
        Commands::Backup { dest } => commands::run_backup(&cfg, &dest).await?,
        Commands::Restore { src } => commands::run_restore(&cfg, &src).await?,
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
