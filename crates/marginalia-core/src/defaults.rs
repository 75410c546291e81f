//! Built-in categories and category templates.

use crate::models::{Category, DEFAULT_CATEGORY_ID};

/// `(name, color, description)` triples.
type Seed = (&'static str, &'static str, &'static str);

const BUILT_IN: &[Seed] = &[
    ("Important", "#FF4444", "Critical and important content"),
    ("Research", "#4444FF", "Research-related annotations"),
    ("Personal", "#44FF44", "Personal thoughts and ideas"),
    ("Questions", "#FF8844", "Questions and clarifications needed"),
    ("References", "#8844FF", "References and citations"),
];

const ACADEMIC: &[Seed] = &[
    ("Literature Review", "#3498db", "Literature review notes"),
    ("Methodology", "#e74c3c", "Methodology and methods"),
    ("Results", "#2ecc71", "Results and findings"),
    ("Discussion", "#f39c12", "Discussion and analysis"),
    ("Future Work", "#9b59b6", "Future research directions"),
];

const BUSINESS: &[Seed] = &[
    ("Strategy", "#34495e", "Strategic insights"),
    ("Market Analysis", "#16a085", "Market research and analysis"),
    ("Competitive Intelligence", "#e67e22", "Competitor information"),
    ("Action Items", "#c0392b", "Tasks and action items"),
    ("Key Metrics", "#8e44ad", "Important metrics and KPIs"),
];

const LEARNING: &[Seed] = &[
    ("Key Concepts", "#2980b9", "Important concepts to remember"),
    ("Examples", "#27ae60", "Examples and case studies"),
    ("Practice", "#f1c40f", "Practice problems and exercises"),
    ("Review", "#e74c3c", "Content to review later"),
    ("Mastered", "#95a5a6", "Fully understood content"),
];

/// Names accepted by [`template`].
pub const TEMPLATE_NAMES: &[&str] = &["academic", "business", "learning"];

/// The categories seeded into an empty store: the fallback `default`
/// category plus five protected built-ins, in sort order.
pub fn default_categories() -> Vec<Category> {
    let mut general = Category::new("General", "#808080");
    general.id = DEFAULT_CATEGORY_ID.to_string();
    general.description = "Uncategorized annotations".to_string();
    general.is_default = true;

    let mut out = vec![general];
    out.extend(BUILT_IN.iter().enumerate().map(|(i, seed)| {
        let mut c = from_seed(seed, i as i64 + 1);
        c.is_default = true;
        c
    }));
    out
}

/// Fresh, unsaved categories for a named template.
pub fn template(name: &str) -> Option<Vec<Category>> {
    let seeds = match name.trim().to_ascii_lowercase().as_str() {
        "academic" => ACADEMIC,
        "business" => BUSINESS,
        "learning" => LEARNING,
        _ => return None,
    };
    Some(
        seeds
            .iter()
            .enumerate()
            .map(|(i, seed)| from_seed(seed, i as i64 + 1))
            .collect(),
    )
}

fn from_seed(&(name, color, description): &Seed, sort_order: i64) -> Category {
    let mut c = Category::new(name, color.to_ascii_uppercase());
    c.description = description.to_string();
    c.sort_order = sort_order;
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_fallback_category() {
        let cats = default_categories();
        assert_eq!(cats.len(), 6);
        assert_eq!(cats[0].id, DEFAULT_CATEGORY_ID);
        assert!(cats.iter().all(|c| c.is_default && c.validate().is_ok()));
    }

    #[test]
    fn test_templates() {
        for name in TEMPLATE_NAMES {
            let cats = template(name).unwrap();
            assert_eq!(cats.len(), 5);
            assert!(cats.iter().all(|c| !c.is_default && c.validate().is_ok()));
        }
        assert!(template("cooking").is_none());
    }
}
