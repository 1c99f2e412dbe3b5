//! Per-kind normalization of source nodes into plain text.
//!
//! | Kind | Output |
//! |------|--------|
//! | Heading (level n) | `#`×n + space + text |
//! | Bulleted list item | `• text` |
//! | Numbered list item | `1. text` |
//! | To-do | `[x] text` / `[ ] text` |
//! | Toggle | `▸ text` |
//! | Quote | `> text` |
//! | Callout | `! text` |
//! | Code | fenced block with language tag |
//! | Divider | `----` |
//! | Table row | `\| a \| b \|` |
//! | Paragraph | text as-is |
//!
//! Pages, databases, tables and unsupported kinds produce no text of their
//! own. Nested content is indented four spaces per depth level so the
//! contained-in relation survives flattening.

use crate::models::{NodeKind, Segment, SourceNode};

const INDENT: &str = "    ";

/// Render a node's own text, without indentation.
///
/// Returns `None` for kinds that carry no text and for empty text.
pub fn normalize(kind: &NodeKind) -> Option<String> {
    let text = match kind {
        NodeKind::Paragraph { text } => non_empty(text)?.to_string(),
        NodeKind::Heading { level, text } => {
            let level = (*level).clamp(1, 6) as usize;
            format!("{} {}", "#".repeat(level), non_empty(text)?)
        }
        NodeKind::BulletedListItem { text } => format!("• {}", non_empty(text)?),
        NodeKind::NumberedListItem { text } => format!("1. {}", non_empty(text)?),
        NodeKind::ToDo { text, checked } => {
            let mark = if *checked { "[x]" } else { "[ ]" };
            format!("{} {}", mark, non_empty(text)?)
        }
        NodeKind::Toggle { text } => format!("▸ {}", non_empty(text)?),
        NodeKind::Quote { text } => format!("> {}", non_empty(text)?),
        NodeKind::Callout { text } => format!("! {}", non_empty(text)?),
        NodeKind::Code { language, text } => {
            format!("```{}\n{}\n```", language, non_empty(text)?)
        }
        NodeKind::Divider => "----".to_string(),
        NodeKind::TableRow { cells } => {
            if cells.iter().all(|c| c.trim().is_empty()) {
                return None;
            }
            format!("| {} |", cells.join(" | "))
        }
        NodeKind::Page { .. }
        | NodeKind::Database { .. }
        | NodeKind::Table
        | NodeKind::Unsupported { .. } => return None,
    };
    Some(text)
}

/// Build the segment for `node` at `depth` below its document.
pub fn segment(node: &SourceNode, depth: usize) -> Option<Segment> {
    let text = normalize(&node.kind)?;
    Some(Segment {
        node_id: node.node_id.clone(),
        kind: node.kind.label(),
        depth,
        text: indent(&text, depth),
    })
}

/// Whether a node kind is skipped as non-text content (logged by the caller).
pub fn is_skipped_kind(kind: &NodeKind) -> bool {
    matches!(kind, NodeKind::Unsupported { .. })
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn indent(text: &str, depth: usize) -> String {
    if depth == 0 {
        return text.to_string();
    }
    let prefix = INDENT.repeat(depth);
    text.lines()
        .map(|line| format!("{}{}", prefix, line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(kind: NodeKind) -> SourceNode {
        SourceNode {
            node_id: "b1".into(),
            parent_id: Some("p1".into()),
            kind,
            has_children: false,
            last_edited_at: Utc::now(),
            url: None,
        }
    }

    #[test]
    fn test_heading_levels_become_markers() {
        let h = NodeKind::Heading {
            level: 2,
            text: "Install".into(),
        };
        assert_eq!(normalize(&h).as_deref(), Some("## Install"));
    }

    #[test]
    fn test_list_items_are_prefixed() {
        let b = NodeKind::BulletedListItem { text: "one".into() };
        let n = NodeKind::NumberedListItem { text: "two".into() };
        let t = NodeKind::ToDo {
            text: "ship".into(),
            checked: true,
        };
        assert_eq!(normalize(&b).as_deref(), Some("• one"));
        assert_eq!(normalize(&n).as_deref(), Some("1. two"));
        assert_eq!(normalize(&t).as_deref(), Some("[x] ship"));
    }

    #[test]
    fn test_table_row_delimited() {
        let row = NodeKind::TableRow {
            cells: vec!["a".into(), "b".into()],
        };
        assert_eq!(normalize(&row).as_deref(), Some("| a | b |"));
        assert_eq!(normalize(&NodeKind::Table), None);
    }

    #[test]
    fn test_code_is_fenced() {
        let code = NodeKind::Code {
            language: "rust".into(),
            text: "fn main() {}".into(),
        };
        assert_eq!(
            normalize(&code).as_deref(),
            Some("```rust\nfn main() {}\n```")
        );
    }

    #[test]
    fn test_empty_and_unsupported_yield_nothing() {
        assert_eq!(normalize(&NodeKind::Paragraph { text: "  ".into() }), None);
        let embed = NodeKind::Unsupported {
            block_type: "video".into(),
        };
        assert_eq!(normalize(&embed), None);
        assert!(is_skipped_kind(&embed));
    }

    #[test]
    fn test_nested_segment_is_indented_per_line() {
        let n = node(NodeKind::Code {
            language: String::new(),
            text: "a\nb".into(),
        });
        let seg = segment(&n, 1).unwrap();
        assert_eq!(seg.text, "    ```\n    a\n    b\n    ```");
        assert_eq!(seg.kind, "code");
        assert_eq!(seg.depth, 1);
    }
}
