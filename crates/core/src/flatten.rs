#![forbid(unsafe_code)]

//! Depth-first walk of a source book into the ordered task sequence the
//! state store is seeded with. Indices are implicit: a task's index is
//! its position in the returned list.

use crate::book::{BookMeta, InputTask, Role, TaskAttrs};
use serde_json::Value;

const BLOCK_KEYS: &[(&str, Role)] = &[
    ("paragraph", Role::Paragraph),
    ("blockquote", Role::Blockquote),
    ("header", Role::Header),
    ("list", Role::List),
    ("table", Role::Table),
    ("code", Role::Code),
    ("macro", Role::Macro),
];

fn text_of(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

fn push_block_tasks(tasks: &mut Vec<InputTask>, role: Role, payload: &Value, attrs: &TaskAttrs) {
    match payload {
        Value::String(text) if !text.is_empty() => {
            tasks.push(InputTask {
                role,
                source_text: text.clone(),
                attrs: attrs.clone(),
            });
        }
        Value::Array(items) => {
            // array payloads (list rows, table rows) become one task per
            // element; continuation siblings carry the concat flag so the
            // rebuilder can regroup them
            for (i, item) in items.iter().enumerate() {
                let Some(text) = text_of(item) else { continue };
                tasks.push(InputTask {
                    role,
                    source_text: text.to_string(),
                    attrs: TaskAttrs {
                        raw_line: if i == 0 { attrs.raw_line.clone() } else { None },
                        concat: if i == 0 { attrs.concat } else { true },
                    },
                });
            }
        }
        _ => {}
    }
}

/// Flatten a source book into `(meta, ordered tasks)`.
pub fn flatten_book(data: &Value) -> (BookMeta, Vec<InputTask>) {
    let mut meta = BookMeta::default();
    let mut tasks = Vec::new();
    meta.id = data
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(title) = data.get("title").and_then(text_of) {
        meta.title = Some(title.to_string());
        tasks.push(InputTask::new(Role::BookTitle, title));
    }
    if let Some(author) = data.get("author").and_then(text_of) {
        meta.author = Some(author.to_string());
        tasks.push(InputTask::new(Role::BookAuthor, author));
    }
    let chapters = data
        .get("chapters")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for chapter in chapters {
        meta.chapter_raw_lines.push(
            chapter
                .get("raw_line")
                .and_then(Value::as_str)
                .map(str::to_string),
        );
        if let Some(title) = chapter.get("title").and_then(text_of) {
            tasks.push(InputTask::new(Role::ChapterTitle, title));
        }
        let body = chapter
            .get("body")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for element in body {
            let attrs = TaskAttrs {
                raw_line: element
                    .get("raw_line")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                concat: element
                    .get("concat")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            };
            for (key, role) in BLOCK_KEYS {
                if let Some(payload) = element.get(*key) {
                    push_block_tasks(&mut tasks, *role, payload, &attrs);
                }
            }
        }
    }
    (meta, tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_in_document_order() {
        let data = json!({
            "format": "source",
            "id": "tale-001",
            "title": "A Tale",
            "author": "A. Writer",
            "chapters": [{
                "title": "Chapter One",
                "raw_line": "# Chapter One",
                "body": [
                    {"paragraph": "He loved linguistics."},
                    {"header": "Notes", "raw_line": "## Notes"},
                ],
            }],
        });
        let (meta, tasks) = flatten_book(&data);
        assert_eq!(meta.id.as_deref(), Some("tale-001"));
        assert_eq!(meta.title.as_deref(), Some("A Tale"));
        assert_eq!(meta.chapter_raw_lines, vec![Some("# Chapter One".to_string())]);
        let roles: Vec<Role> = tasks.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::BookTitle,
                Role::BookAuthor,
                Role::ChapterTitle,
                Role::Paragraph,
                Role::Header,
            ]
        );
        assert_eq!(tasks[3].source_text, "He loved linguistics.");
        assert_eq!(tasks[4].attrs.raw_line.as_deref(), Some("## Notes"));
    }

    #[test]
    fn array_payloads_mark_continuation_siblings() {
        let data = json!({
            "chapters": [{
                "body": [
                    {"table": ["| Name | Score |", "| Alice | 10 |"], "raw_line": "| Name | Score |"},
                    {"table": ["| Bob | 20 |"], "concat": true},
                ],
            }],
        });
        let (_, tasks) = flatten_book(&data);
        assert_eq!(tasks.len(), 3);
        assert!(!tasks[0].attrs.concat);
        assert_eq!(tasks[0].attrs.raw_line.as_deref(), Some("| Name | Score |"));
        assert!(tasks[1].attrs.concat);
        assert!(tasks[1].attrs.raw_line.is_none());
        // a block-level concat flag continues the previous table block
        assert!(tasks[2].attrs.concat);
    }

    #[test]
    fn skips_empty_and_unknown_payloads() {
        let data = json!({
            "chapters": [{
                "body": [
                    {"paragraph": ""},
                    {"figure": "unsupported"},
                    {"macro": "image cover.png"},
                ],
            }],
        });
        let (_, tasks) = flatten_book(&data);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].role, Role::Macro);
    }
}
