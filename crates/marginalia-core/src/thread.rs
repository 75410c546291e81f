//! Note threads rebuilt from a flat set of notes.
//!
//! Replies point at their parent through `parent_note_id`. A [`NoteArena`]
//! indexes notes by id and children by parent id; threads are assembled by
//! lookup, so a dangling or looping parent id only shortens a walk.

use std::collections::{HashMap, HashSet};

use crate::error::ValidationError;
use crate::models::Annotation;

pub struct NoteArena<'a> {
    by_id: HashMap<&'a str, &'a Annotation>,
    children: HashMap<&'a str, Vec<&'a Annotation>>,
}

impl<'a> NoteArena<'a> {
    /// Index the notes among `annotations`; other variants are ignored.
    pub fn new(annotations: &'a [Annotation]) -> Self {
        let mut by_id = HashMap::new();
        let mut children: HashMap<&str, Vec<&Annotation>> = HashMap::new();
        for a in annotations.iter().filter(|a| a.as_note().is_some()) {
            by_id.insert(a.id.as_str(), a);
            if let Some(parent) = a.parent_note_id() {
                children.entry(parent).or_default().push(a);
            }
        }
        for list in children.values_mut() {
            list.sort_by_key(|a| a.created_at);
        }
        Self { by_id, children }
    }

    pub fn get(&self, id: &str) -> Option<&'a Annotation> {
        self.by_id.get(id).copied()
    }

    /// Direct replies, oldest first.
    pub fn replies(&self, id: &str) -> &[&'a Annotation] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Follow parent links up to the topmost note still present.
    pub fn root_of(&self, id: &str) -> Option<&'a Annotation> {
        let mut current = self.get(id)?;
        let mut seen = HashSet::new();
        seen.insert(current.id.as_str());
        while let Some(parent) = current.parent_note_id().and_then(|p| self.get(p)) {
            if !seen.insert(parent.id.as_str()) {
                break;
            }
            current = parent;
        }
        Some(current)
    }

    /// Every note below `id`, excluding `id`.
    pub fn descendants(&self, id: &str) -> Vec<&'a Annotation> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(id);
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            for reply in self.replies(next) {
                if seen.insert(reply.id.as_str()) {
                    out.push(*reply);
                    stack.push(reply.id.as_str());
                }
            }
        }
        out
    }

    /// The root of `id`'s thread followed by all of its replies (at any
    /// depth) in creation order.
    pub fn thread(&self, id: &str) -> Vec<&'a Annotation> {
        let Some(root) = self.root_of(id) else {
            return Vec::new();
        };
        let mut replies = self.descendants(&root.id);
        replies.sort_by_key(|a| a.created_at);
        let mut out = Vec::with_capacity(replies.len() + 1);
        out.push(root);
        out.extend(replies);
        out
    }

    /// Ids of `id` and its replies, deepest replies first, `id` last.
    pub fn deletion_order(&self, id: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        self.post_order(id, &mut seen, &mut order);
        order
    }

    fn post_order(&self, id: &str, seen: &mut HashSet<String>, order: &mut Vec<String>) {
        if !seen.insert(id.to_string()) {
            return;
        }
        for reply in self.replies(id) {
            self.post_order(&reply.id, seen, order);
        }
        order.push(id.to_string());
    }

    /// Validate attaching `note` under `parent_id`: the parent must exist in
    /// this arena, live in the same document, and not be one of `note`'s own
    /// replies.
    pub fn check_parent(&self, note: &Annotation, parent_id: &str) -> Result<(), ValidationError> {
        if parent_id == note.id {
            return Err(ValidationError::ThreadCycle(note.id.clone()));
        }
        let parent = self
            .get(parent_id)
            .ok_or_else(|| ValidationError::Other(format!("parent note {parent_id} not found")))?;
        if parent.document_path != note.document_path {
            return Err(ValidationError::ThreadDocumentMismatch {
                parent: parent_id.to_string(),
            });
        }
        if self.descendants(&note.id).iter().any(|d| d.id == parent_id) {
            return Err(ValidationError::ThreadCycle(note.id.clone()));
        }
        Ok(())
    }
}
