#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task roles in document order. The four title-ish roles collapse to a
/// single pair on rebuild; `Code` and `Macro` are never sent to the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    BookTitle,
    BookAuthor,
    ChapterTitle,
    Paragraph,
    Blockquote,
    Header,
    List,
    Table,
    Code,
    Macro,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::BookTitle => "book_title",
            Role::BookAuthor => "book_author",
            Role::ChapterTitle => "chapter_title",
            Role::Paragraph => "paragraph",
            Role::Blockquote => "blockquote",
            Role::Header => "header",
            Role::List => "list",
            Role::Table => "table",
            Role::Code => "code",
            Role::Macro => "macro",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "book_title" => Some(Role::BookTitle),
            "book_author" => Some(Role::BookAuthor),
            "chapter_title" => Some(Role::ChapterTitle),
            "paragraph" => Some(Role::Paragraph),
            "blockquote" => Some(Role::Blockquote),
            "header" => Some(Role::Header),
            "list" => Some(Role::List),
            "table" => Some(Role::Table),
            "code" => Some(Role::Code),
            "macro" => Some(Role::Macro),
            _ => None,
        }
    }

    /// Roles whose source text goes through the translation ladder.
    pub fn is_translated(self) -> bool {
        !matches!(self, Role::Code | Role::Macro)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional attributes carried from the input block to its tasks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskAttrs {
    pub raw_line: Option<String>,
    pub concat: bool,
}

/// One flattened unit of work, before any model call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputTask {
    pub role: Role,
    pub source_text: String,
    pub attrs: TaskAttrs,
}

impl InputTask {
    pub fn new(role: Role, source_text: impl Into<String>) -> Self {
        Self {
            role,
            source_text: source_text.into(),
            attrs: TaskAttrs::default(),
        }
    }
}

/// Aligned source/target sentence pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationPair {
    pub source: String,
    pub target: String,
}

impl TranslationPair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Non-translated payload for `macro` and `code` tasks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A task response body: sentence pairs for translated roles, a single
/// name/value record for `macro`/`code`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseContent {
    Pairs(Vec<TranslationPair>),
    Record(MacroRecord),
}

impl ResponseContent {
    /// The pair list, or an empty slice for record content.
    pub fn pairs(&self) -> &[TranslationPair] {
        match self {
            ResponseContent::Pairs(pairs) => pairs,
            ResponseContent::Record(_) => &[],
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

/// Persisted per-task result. Absent keys stay absent on the wire so the
/// stored JSON round-trips byte-for-byte.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub content: ResponseContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub intact: bool,
}

impl TaskResponse {
    pub fn pairs(content: Vec<TranslationPair>) -> Self {
        Self {
            content: ResponseContent::Pairs(content),
            hint: None,
            cost: 0.0,
            error: false,
            intact: false,
        }
    }

    pub fn record(record: MacroRecord) -> Self {
        Self {
            content: ResponseContent::Record(record),
            hint: None,
            cost: 0.0,
            error: false,
            intact: false,
        }
    }
}

/// A durable translation task row.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub index: i64,
    pub role: Role,
    pub source_text: String,
    pub response: Option<TaskResponse>,
}

/// Analysis pipeline request/response row. The request is the batch of
/// pairs sent in one prompt; the response content is the parallel
/// sentence-tree array, kept as raw JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub content: Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cost: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisRecord {
    pub index: i64,
    pub request: Vec<TranslationPair>,
    pub response: Option<AnalysisResponse>,
}

/// Book-level data that is not task work: id, original title/author text
/// and per-chapter provenance lines, carried into the rebuilt output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BookMeta {
    pub id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub chapter_raw_lines: Vec<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_strings() {
        for role in [
            Role::BookTitle,
            Role::BookAuthor,
            Role::ChapterTitle,
            Role::Paragraph,
            Role::Blockquote,
            Role::Header,
            Role::List,
            Role::Table,
            Role::Code,
            Role::Macro,
        ] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("chapter"), None);
    }

    #[test]
    fn response_json_omits_absent_markers() {
        let response = TaskResponse {
            content: ResponseContent::Pairs(vec![TranslationPair::new("Hi.", "やあ。")]),
            hint: Some("greeting".to_string()),
            cost: 0.0,
            error: false,
            intact: false,
        };
        let json = serde_json::to_string(&response).expect("serialize");
        assert_eq!(
            json,
            r#"{"content":[{"source":"Hi.","target":"やあ。"}],"hint":"greeting"}"#
        );
    }

    #[test]
    fn response_json_keeps_markers_when_set() {
        let response = TaskResponse {
            content: ResponseContent::Pairs(vec![TranslationPair::new("・・・", "・・・")]),
            hint: None,
            cost: 0.0,
            error: false,
            intact: true,
        };
        let json = serde_json::to_string(&response).expect("serialize");
        assert_eq!(
            json,
            r#"{"content":[{"source":"・・・","target":"・・・"}],"intact":true}"#
        );
        let back: TaskResponse = serde_json::from_str(&json).expect("parse");
        assert!(back.intact);
        assert!(!back.error);
        assert_eq!(back.cost, 0.0);
    }

    #[test]
    fn record_content_parses_from_object() {
        let json = r#"{"content":{"name":"image","value":"cover.png"}}"#;
        let response: TaskResponse = serde_json::from_str(json).expect("parse");
        match response.content {
            ResponseContent::Record(record) => {
                assert_eq!(record.name, "image");
                assert_eq!(record.value.as_deref(), Some("cover.png"));
            }
            ResponseContent::Pairs(_) => panic!("expected record content"),
        }
    }
}
