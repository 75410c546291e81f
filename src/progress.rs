//! Indexing progress reporting.
//!
//! `marg index add` and `marg index dir` report how many documents have been
//! processed so far. Progress goes to **stderr** so stdout stays parseable.

use std::io::{IsTerminal, Write};

/// A single progress event for a batch index run.
#[derive(Clone, Debug)]
pub enum IndexProgressEvent {
    /// The batch is about to start.
    Started { total: u64 },
    /// One document finished, successfully or not.
    Document {
        path: String,
        indexed: bool,
        n: u64,
        total: u64,
    },
    /// Every document has been processed.
    Finished { indexed: u64, total: u64 },
}

/// Reports index progress. Called from the indexer's result loop.
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr: "index  1,234 / 5,000 documents  book.pdf".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Started { total } => {
                format!("index  {} documents queued\n", format_number(*total))
            }
            IndexProgressEvent::Document {
                path,
                indexed,
                n,
                total,
            } => {
                let status = if *indexed { "" } else { "  (failed)" };
                format!(
                    "index  {} / {} documents  {}{}\n",
                    format_number(*n),
                    format_number(*total),
                    path,
                    status
                )
            }
            IndexProgressEvent::Finished { indexed, total } => format!(
                "index  done: {} of {} indexed\n",
                format_number(*indexed),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let obj = match &event {
            IndexProgressEvent::Started { total } => serde_json::json!({
                "event": "progress",
                "phase": "started",
                "total": total
            }),
            IndexProgressEvent::Document {
                path,
                indexed,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "document",
                "path": path,
                "indexed": indexed,
                "n": n,
                "total": total
            }),
            IndexProgressEvent::Finished { indexed, total } => serde_json::json!({
                "event": "progress",
                "phase": "finished",
                "indexed": indexed,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
