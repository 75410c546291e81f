//! Annotation and category data model.
//!
//! An [`Annotation`] is a common envelope (id, document, page, category,
//! timestamps) around an [`AnnotationKind`] payload. Behavior that differs
//! per variant (display text, searchable text, validation) is dispatched by
//! matching on the kind.
//!
//! Timestamps are UTC truncated to microseconds so that they survive the
//! ISO-8601 text columns used by the store without losing precision.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::text;

/// Id of the category every annotation falls back to.
pub const DEFAULT_CATEGORY_ID: &str = "default";

/// Color assigned to categories created without one.
pub const DEFAULT_CATEGORY_COLOR: &str = "#808080";

/// Current time at the precision the store persists.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Returns true for `#RRGGBB`.
pub fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

// ═══════════════════════════════════════════════════════════════════════
// Geometry
// ═══════════════════════════════════════════════════════════════════════

/// A 2D position on a rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A span of page text, by both screen coordinates and character offsets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextSelection {
    pub start_point: Point,
    pub end_point: Point,
    pub start_char_index: usize,
    pub end_char_index: usize,
    pub selected_text: String,
}

impl TextSelection {
    pub fn new(
        start_point: Point,
        end_point: Point,
        start_char_index: usize,
        end_char_index: usize,
        selected_text: impl Into<String>,
    ) -> Self {
        Self {
            start_point,
            end_point,
            start_char_index,
            end_char_index,
            selected_text: selected_text.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.start_char_index > self.end_char_index {
            return Err(ValidationError::SelectionBounds {
                start: self.start_char_index,
                end: self.end_char_index,
            });
        }
        Ok(())
    }

    /// Two half-open ranges overlap unless one ends before the other starts.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        !(self.end_char_index <= start || end <= self.start_char_index)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Highlight colors
// ═══════════════════════════════════════════════════════════════════════

/// The fixed highlight palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HighlightColor {
    #[default]
    Yellow,
    Green,
    Blue,
    Pink,
    Orange,
    Purple,
    Red,
    Cyan,
}

impl HighlightColor {
    pub const ALL: [HighlightColor; 8] = [
        HighlightColor::Yellow,
        HighlightColor::Green,
        HighlightColor::Blue,
        HighlightColor::Pink,
        HighlightColor::Orange,
        HighlightColor::Purple,
        HighlightColor::Red,
        HighlightColor::Cyan,
    ];

    pub fn hex(self) -> &'static str {
        match self {
            HighlightColor::Yellow => "#FFFF00",
            HighlightColor::Green => "#00FF00",
            HighlightColor::Blue => "#0080FF",
            HighlightColor::Pink => "#FF69B4",
            HighlightColor::Orange => "#FFA500",
            HighlightColor::Purple => "#8A2BE2",
            HighlightColor::Red => "#FF0000",
            HighlightColor::Cyan => "#00FFFF",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HighlightColor::Yellow => "yellow",
            HighlightColor::Green => "green",
            HighlightColor::Blue => "blue",
            HighlightColor::Pink => "pink",
            HighlightColor::Orange => "orange",
            HighlightColor::Purple => "purple",
            HighlightColor::Red => "red",
            HighlightColor::Cyan => "cyan",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Resolve a palette name or `#RRGGBB` string to a hex color.
    pub fn resolve(input: &str) -> Option<String> {
        let input = input.trim();
        if let Some(c) = Self::from_name(input) {
            return Some(c.hex().to_string());
        }
        if is_hex_color(input) {
            return Some(input.to_ascii_uppercase());
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Annotations
// ═══════════════════════════════════════════════════════════════════════

/// Discriminant stored in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationType {
    Bookmark,
    Highlight,
    Note,
}

impl AnnotationType {
    pub const ALL: [AnnotationType; 3] = [
        AnnotationType::Bookmark,
        AnnotationType::Highlight,
        AnnotationType::Note,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationType::Bookmark => "bookmark",
            AnnotationType::Highlight => "highlight",
            AnnotationType::Note => "note",
        }
    }
}

impl fmt::Display for AnnotationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnnotationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bookmark" => Ok(AnnotationType::Bookmark),
            "highlight" => Ok(AnnotationType::Highlight),
            "note" => Ok(AnnotationType::Note),
            other => Err(ValidationError::Other(format!(
                "unknown annotation type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bookmark {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub position: Option<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub text_selection: TextSelection,
    pub highlighted_text: String,
    pub color: String,
    #[serde(default)]
    pub note: String,
}

impl Highlight {
    /// Build a highlight whose text is the selection's text.
    pub fn from_selection(text_selection: TextSelection, color: HighlightColor) -> Self {
        let highlighted_text = text_selection.selected_text.clone();
        Self {
            text_selection,
            highlighted_text,
            color: color.hex().to_string(),
            note: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Note {
    pub position: Point,
    /// Rich (HTML) content as authored.
    pub content: String,
    /// Tag-free text derived from `content`.
    pub plain_text: String,
    #[serde(default)]
    pub parent_note_id: Option<String>,
}

impl Note {
    pub fn new(position: Point, content: impl Into<String>) -> Self {
        let content = content.into();
        let plain_text = text::html_to_plain_text(&content);
        Self {
            position,
            content,
            plain_text,
            parent_note_id: None,
        }
    }

    /// Replace the content and re-derive the plain text.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.plain_text = text::html_to_plain_text(&self.content);
    }
}

/// Per-variant payload. Serialized with an internal `type` tag, which makes
/// the `data` blob self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnnotationKind {
    Bookmark(Bookmark),
    Highlight(Highlight),
    Note(Note),
}

impl AnnotationKind {
    pub fn annotation_type(&self) -> AnnotationType {
        match self {
            AnnotationKind::Bookmark(_) => AnnotationType::Bookmark,
            AnnotationKind::Highlight(_) => AnnotationType::Highlight,
            AnnotationKind::Note(_) => AnnotationType::Note,
        }
    }
}

/// A user-authored marker attached to one page of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub document_path: String,
    pub page_number: u32,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AnnotationKind,
}

impl Annotation {
    /// A fresh annotation with a generated id in the default category.
    pub fn new(document_path: impl Into<String>, page_number: u32, kind: AnnotationKind) -> Self {
        let ts = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_path: document_path.into(),
            page_number,
            category: DEFAULT_CATEGORY_ID.to_string(),
            created_at: ts,
            updated_at: ts,
            kind,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn annotation_type(&self) -> AnnotationType {
        self.kind.annotation_type()
    }

    /// Bump `updated_at`. Every explicit update goes through here.
    pub fn touch(&mut self) {
        self.updated_at = now().max(self.created_at);
    }

    /// Short human-readable label for lists.
    pub fn display_text(&self) -> String {
        match &self.kind {
            AnnotationKind::Bookmark(b) => {
                if b.title.is_empty() {
                    format!("Bookmark - Page {}", self.page_number)
                } else {
                    b.title.clone()
                }
            }
            AnnotationKind::Highlight(h) => {
                let head = text::truncate_chars(&h.highlighted_text, 50);
                if head.len() < h.highlighted_text.len() {
                    format!("\"{head}...\"")
                } else {
                    format!("\"{head}\"")
                }
            }
            AnnotationKind::Note(n) => {
                if !n.plain_text.is_empty() {
                    return n.plain_text.clone();
                }
                if n.content.is_empty() {
                    return "Empty Note".to_string();
                }
                let head = text::truncate_chars(&n.content, 50);
                if head.len() < n.content.len() {
                    format!("{head}...")
                } else {
                    head.to_string()
                }
            }
        }
    }

    /// The text mirrored into the full-text index.
    pub fn search_text(&self) -> String {
        match &self.kind {
            AnnotationKind::Bookmark(b) => format!("{} {}", b.title, b.description)
                .trim()
                .to_string(),
            AnnotationKind::Highlight(h) => format!("{} {}", h.highlighted_text, h.note)
                .trim()
                .to_string(),
            AnnotationKind::Note(n) => {
                if n.plain_text.is_empty() {
                    n.content.clone()
                } else {
                    n.plain_text.clone()
                }
            }
        }
    }

    /// Checks that need nothing but the annotation itself.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.page_number < 1 {
            return Err(ValidationError::PageOutOfRange(self.page_number));
        }
        if self.updated_at < self.created_at {
            return Err(ValidationError::TimestampOrder);
        }
        match &self.kind {
            AnnotationKind::Highlight(h) => {
                h.text_selection.validate()?;
                if !is_hex_color(&h.color) {
                    return Err(ValidationError::InvalidColor(h.color.clone()));
                }
            }
            AnnotationKind::Note(n) => {
                if n.parent_note_id.as_deref() == Some(self.id.as_str()) {
                    return Err(ValidationError::ThreadCycle(self.id.clone()));
                }
            }
            AnnotationKind::Bookmark(_) => {}
        }
        Ok(())
    }

    pub fn as_bookmark(&self) -> Option<&Bookmark> {
        match &self.kind {
            AnnotationKind::Bookmark(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bookmark_mut(&mut self) -> Option<&mut Bookmark> {
        match &mut self.kind {
            AnnotationKind::Bookmark(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_highlight(&self) -> Option<&Highlight> {
        match &self.kind {
            AnnotationKind::Highlight(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_highlight_mut(&mut self) -> Option<&mut Highlight> {
        match &mut self.kind {
            AnnotationKind::Highlight(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_note(&self) -> Option<&Note> {
        match &self.kind {
            AnnotationKind::Note(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_note_mut(&mut self) -> Option<&mut Note> {
        match &mut self.kind {
            AnnotationKind::Note(n) => Some(n),
            _ => None,
        }
    }

    pub fn parent_note_id(&self) -> Option<&str> {
        self.as_note().and_then(|n| n.parent_note_id.as_deref())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Categories
// ═══════════════════════════════════════════════════════════════════════

/// A hierarchical label attachable to annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub annotation_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl Category {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            color: color.into(),
            description: String::new(),
            parent_id: None,
            sort_order: 0,
            is_active: true,
            is_default: false,
            annotation_count: 0,
            created_at: ts,
            updated_at: ts,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !is_hex_color(&self.color) {
            return Err(ValidationError::InvalidColor(self.color.clone()));
        }
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::Cycle {
                id: self.id.clone(),
                parent: self.id.clone(),
            });
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = now().max(self.created_at);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Queries and results
// ═══════════════════════════════════════════════════════════════════════

/// Predicates applied on top of (or instead of) a text query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationFilter {
    pub document_path: Option<String>,
    pub annotation_type: Option<AnnotationType>,
    pub category: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Inclusive page range.
    pub page_range: Option<(u32, u32)>,
}

impl AnnotationFilter {
    pub fn for_document(document_path: impl Into<String>) -> Self {
        Self {
            document_path: Some(document_path.into()),
            ..Default::default()
        }
    }
}

/// A matched annotation with its preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationSearchResult {
    pub annotation: Annotation,
    pub relevance_score: f64,
    pub context_snippet: String,
    /// Byte ranges of query matches inside `context_snippet`.
    pub match_highlights: Vec<(usize, usize)>,
}

/// A matched document page with its preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSearchResult {
    pub document_path: String,
    pub page_number: u32,
    pub snippet: String,
    pub relevance: f64,
    /// Byte ranges of query matches inside `snippet`.
    pub match_offsets: Vec<(usize, usize)>,
}

/// Aggregated outcome of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOperationResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<String>,
}

impl BulkOperationResult {
    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failure_count += 1;
        self.errors.push(error.into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnnotationStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub document_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryUsage {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    pub total_categories: usize,
    pub active_categories: usize,
    pub default_categories: usize,
    pub root_categories: usize,
    pub categories_with_children: usize,
    pub most_used: Option<CategoryUsage>,
    pub least_used: Option<CategoryUsage>,
    pub average_annotations_per_category: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn highlight(text: &str) -> Annotation {
        let sel = TextSelection::new(Point::default(), Point::default(), 0, text.len(), text);
        Annotation::new(
            "a.pdf",
            1,
            AnnotationKind::Highlight(Highlight::from_selection(sel, HighlightColor::Yellow)),
        )
    }

    #[test]
    fn test_timestamps_survive_text_format() {
        let ts = now();
        let parsed = parse_timestamp(&format_timestamp(&ts)).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_bookmark_display_falls_back_to_page() {
        let a = Annotation::new("a.pdf", 7, AnnotationKind::Bookmark(Bookmark::default()));
        assert_eq!(a.display_text(), "Bookmark - Page 7");
    }

    #[test]
    fn test_highlight_display_truncates() {
        let long = "x".repeat(80);
        let a = highlight(&long);
        assert_eq!(a.display_text(), format!("\"{}...\"", "x".repeat(50)));
        assert_eq!(highlight("short").display_text(), "\"short\"");
    }

    #[test]
    fn test_search_text_per_variant() {
        let b = Annotation::new(
            "a.pdf",
            1,
            AnnotationKind::Bookmark(Bookmark {
                title: "Intro".into(),
                description: "".into(),
                position: None,
            }),
        );
        assert_eq!(b.search_text(), "Intro");

        let mut h = highlight("some text");
        h.as_highlight_mut().unwrap().note = "remember".into();
        assert_eq!(h.search_text(), "some text remember");

        let n = Annotation::new(
            "a.pdf",
            1,
            AnnotationKind::Note(Note::new(Point::default(), "<p>Hello <b>world</b></p>")),
        );
        assert_eq!(n.search_text(), "Hello world");
    }

    #[test]
    fn test_validate_rejects_bad_selection_and_color() {
        let mut h = highlight("abc");
        h.as_highlight_mut().unwrap().text_selection.start_char_index = 10;
        assert!(matches!(
            h.validate(),
            Err(ValidationError::SelectionBounds { .. })
        ));

        let mut h = highlight("abc");
        h.as_highlight_mut().unwrap().color = "yellowish".into();
        assert!(matches!(h.validate(), Err(ValidationError::InvalidColor(_))));
    }

    #[test]
    fn test_validate_rejects_page_zero() {
        let mut a = highlight("abc");
        a.page_number = 0;
        assert_eq!(a.validate(), Err(ValidationError::PageOutOfRange(0)));
    }

    #[test]
    fn test_color_resolution() {
        assert_eq!(HighlightColor::resolve("Pink").as_deref(), Some("#FF69B4"));
        assert_eq!(HighlightColor::resolve("#a0b1c2").as_deref(), Some("#A0B1C2"));
        assert_eq!(HighlightColor::resolve("#12345"), None);
        assert_eq!(HighlightColor::resolve("mauve"), None);
    }

    #[test]
    fn test_annotation_json_is_flat_and_tagged() {
        let a = highlight("abc");
        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(value["type"], "highlight");
        assert_eq!(value["highlighted_text"], "abc");
        let back: Annotation = serde_json::from_value(value).unwrap();
        assert_eq!(back, a);
    }
}
