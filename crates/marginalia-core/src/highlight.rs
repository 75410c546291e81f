//! Merge and split arithmetic for highlight selections.

use crate::error::ValidationError;
use crate::models::{Highlight, Point, TextSelection};

/// Combine highlights into one covering `[min(start), max(end)]`.
///
/// Inputs are ordered by start offset. The start point comes from the
/// earliest-starting input and the end point from the latest-ending one.
/// Texts are joined with a space and non-empty notes with `" | "`. The
/// color of the result is `color` or, failing that, the first input's.
pub fn merge(highlights: &[&Highlight], color: Option<&str>) -> Result<Highlight, ValidationError> {
    if highlights.len() < 2 {
        return Err(ValidationError::MergeTooFew(highlights.len()));
    }

    let mut ordered: Vec<&Highlight> = highlights.to_vec();
    ordered.sort_by_key(|h| h.text_selection.start_char_index);

    let first = ordered[0];
    let last = ordered
        .iter()
        .copied()
        .max_by_key(|h| h.text_selection.end_char_index)
        .unwrap_or(first);

    let text = ordered
        .iter()
        .map(|h| h.highlighted_text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let note = ordered
        .iter()
        .map(|h| h.note.as_str())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");

    let selection = TextSelection::new(
        first.text_selection.start_point,
        last.text_selection.end_point,
        first.text_selection.start_char_index,
        last.text_selection.end_char_index,
        text.clone(),
    );

    Ok(Highlight {
        text_selection: selection,
        highlighted_text: text,
        color: color
            .map(str::to_string)
            .unwrap_or_else(|| highlights[0].color.clone()),
        note,
    })
}

/// Split a highlight at absolute character `position`, which must lie
/// strictly inside the selection. Both halves keep the color and note; the
/// inner edge of each half gets a zero point since its on-screen position
/// is unknown.
pub fn split(highlight: &Highlight, position: usize) -> Result<(Highlight, Highlight), ValidationError> {
    let sel = &highlight.text_selection;
    if position <= sel.start_char_index || position >= sel.end_char_index {
        return Err(ValidationError::SplitPosition {
            position,
            start: sel.start_char_index,
            end: sel.end_char_index,
        });
    }

    let offset = position - sel.start_char_index;
    let cut = highlight
        .highlighted_text
        .char_indices()
        .nth(offset)
        .map(|(i, _)| i)
        .unwrap_or(highlight.highlighted_text.len());
    let (head, tail) = highlight.highlighted_text.split_at(cut);

    let first = Highlight {
        text_selection: TextSelection::new(
            sel.start_point,
            Point::default(),
            sel.start_char_index,
            position,
            head,
        ),
        highlighted_text: head.to_string(),
        color: highlight.color.clone(),
        note: highlight.note.clone(),
    };
    let second = Highlight {
        text_selection: TextSelection::new(
            Point::default(),
            sel.end_point,
            position,
            sel.end_char_index,
            tail,
        ),
        highlighted_text: tail.to_string(),
        color: highlight.color.clone(),
        note: highlight.note.clone(),
    };
    Ok((first, second))
}
