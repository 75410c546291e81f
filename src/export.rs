//! Annotation export and import in JSON and CSV.
//!
//! JSON carries a whole bundle (the document's annotations plus the
//! category table) and round-trips losslessly. CSV carries one row per
//! annotation: the envelope as plain columns, a human-readable `content`
//! column, and the full variant payload as a JSON `payload` column so that
//! rows can be read back.

use marginalia_core::models::{format_timestamp, now, parse_timestamp};
use marginalia_core::{Annotation, AnnotationKind, AnnotationType, Category, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

/// The JSON export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBundle {
    pub document_path: String,
    pub export_timestamp: String,
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl ExportBundle {
    pub fn new(
        document_path: impl Into<String>,
        annotations: Vec<Annotation>,
        categories: Vec<Category>,
    ) -> Self {
        Self {
            document_path: document_path.into(),
            export_timestamp: format_timestamp(&now()),
            annotations,
            categories,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    document_path: String,
    page_number: u32,
    category: String,
    content: String,
    created_at: String,
    updated_at: String,
    payload: String,
}

/// Serialize a bundle. CSV output drops the categories.
pub fn render(bundle: &ExportBundle, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(bundle)?),
        ExportFormat::Csv => render_csv(&bundle.annotations),
    }
}

fn render_csv(annotations: &[Annotation]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for a in annotations {
        writer.serialize(CsvRow {
            id: a.id.clone(),
            kind: a.annotation_type().to_string(),
            document_path: a.document_path.clone(),
            page_number: a.page_number,
            category: a.category.clone(),
            content: a.display_text(),
            created_at: format_timestamp(&a.created_at),
            updated_at: format_timestamp(&a.updated_at),
            payload: serde_json::to_string(&a.kind)?,
        })?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| Error::Index(format!("non-UTF-8 CSV output: {e}")))
}

/// Parse exported data back into annotations and categories.
pub fn parse(data: &str, format: ExportFormat) -> Result<(Vec<Annotation>, Vec<Category>)> {
    match format {
        ExportFormat::Json => {
            let bundle: ExportBundle = serde_json::from_str(data)?;
            Ok((bundle.annotations, bundle.categories))
        }
        ExportFormat::Csv => Ok((parse_csv(data)?, Vec::new())),
    }
}

fn parse_csv(data: &str) -> Result<Vec<Annotation>> {
    let mut reader = csv::Reader::from_reader(data.as_bytes());
    let mut out = Vec::new();
    for row in reader.deserialize() {
        let row: CsvRow = row?;
        let kind: AnnotationKind = serde_json::from_str(&row.payload)?;
        if kind.annotation_type() != AnnotationType::from_str(&row.kind)? {
            return Err(ValidationError::Other(format!(
                "row {}: type column {} disagrees with payload",
                row.id, row.kind
            ))
            .into());
        }
        out.push(Annotation {
            created_at: csv_timestamp(&row.id, &row.created_at)?,
            updated_at: csv_timestamp(&row.id, &row.updated_at)?,
            id: row.id,
            document_path: row.document_path,
            page_number: row.page_number,
            category: row.category,
            kind,
        });
    }
    Ok(out)
}

fn csv_timestamp(id: &str, raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_timestamp(raw)
        .ok_or_else(|| ValidationError::Other(format!("row {id}: bad timestamp {raw}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::{Bookmark, Note, Point};

    fn sample() -> Vec<Annotation> {
        vec![
            Annotation::new(
                "book.pdf",
                2,
                AnnotationKind::Bookmark(Bookmark {
                    title: "Chapter, with comma".into(),
                    description: "line one\nline two".into(),
                    position: None,
                }),
            ),
            Annotation::new(
                "book.pdf",
                3,
                AnnotationKind::Note(Note::new(Point::new(1.0, 2.0), "<p>\"quoted\"</p>")),
            ),
        ]
    }

    #[test]
    fn test_csv_header_and_read_back() {
        let bundle = ExportBundle::new("book.pdf", sample(), Vec::new());
        let csv = render(&bundle, ExportFormat::Csv).unwrap();
        assert!(csv.starts_with(
            "id,type,document_path,page_number,category,content,created_at,updated_at,payload"
        ));
        let (annotations, categories) = parse(&csv, ExportFormat::Csv).unwrap();
        assert_eq!(annotations, bundle.annotations);
        assert!(categories.is_empty());
    }

    #[test]
    fn test_json_bundle_fields() {
        let bundle = ExportBundle::new("book.pdf", sample(), Vec::new());
        let json = render(&bundle, ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for key in ["document_path", "export_timestamp", "annotations", "categories"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["annotations"][0]["type"], "bookmark");
    }

    #[test]
    fn test_csv_type_mismatch_rejected() {
        let bundle = ExportBundle::new("book.pdf", sample()[..1].to_vec(), Vec::new());
        let csv = render(&bundle, ExportFormat::Csv)
            .unwrap()
            .replace(",bookmark,", ",note,");
        assert!(parse(&csv, ExportFormat::Csv).is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(Error::UnsupportedFormat(_))
        ));
    }
}
