#![forbid(unsafe_code)]

//! Structural and lexical validation of model responses. A rejected
//! response is discarded by the retry engine and counted as a failed
//! attempt, so every check here must be cheap and deterministic.

use crate::book::{ResponseContent, Role, TaskRecord, TranslationPair};
use crate::width::normalize_ws;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Maximum normalized Levenshtein distance over mean length between the
/// joined response sources and the task source.
pub const MAX_DIFF_RATIO: f64 = 0.10;

const HEAD_CHARS: usize = 8;
const TAIL_CHARS: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub enum ContentError {
    AffixMismatch,
    ExcessiveDiff { ratio: f64 },
    MarkMismatch { expected: String, actual: String },
    SeparatorMismatch,
    EmptyTarget { source: String },
}

impl std::fmt::Display for ContentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AffixMismatch => write!(f, "leading or trailing characters differ"),
            Self::ExcessiveDiff { ratio } => write!(f, "too much diff: {ratio:.2}"),
            Self::MarkMismatch { expected, actual } => {
                write!(f, "different marks: {expected} vs {actual}")
            }
            Self::SeparatorMismatch => write!(f, "different cell separators"),
            Self::EmptyTarget { source } => write!(f, "too short target for: {source}"),
        }
    }
}

impl std::error::Error for ContentError {}

fn quotation_mark_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{Quotation_Mark}").expect("static mark pattern"))
}

fn word_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z]{2,} +[A-Za-z]{3,}").expect("static word pattern"))
}

fn normalize_text(text: &str) -> String {
    normalize_ws(text).to_lowercase()
}

fn extract_marks(text: &str) -> String {
    quotation_mark_re()
        .find_iter(text)
        .map(|m| m.as_str())
        .collect()
}

fn extract_verticals(text: &str) -> String {
    text.chars().filter(|c| *c == '|').collect()
}

fn affix_matches(orig: &str, proc: &str) -> bool {
    let orig: Vec<char> = orig.chars().filter(|c| !c.is_whitespace()).collect();
    let proc: Vec<char> = proc.chars().filter(|c| !c.is_whitespace()).collect();
    let head = HEAD_CHARS.min(orig.len()).min(proc.len());
    if orig[..head] != proc[..head] {
        return false;
    }
    let tail = TAIL_CHARS.min(orig.len()).min(proc.len());
    orig[orig.len() - tail..] == proc[proc.len() - tail..]
}

/// Normalized Levenshtein distance over mean character length.
pub fn diff_ratio(orig: &str, proc: &str) -> f64 {
    let distance = strsim::levenshtein(orig, proc) as f64;
    let orig_len = orig.chars().count() as f64;
    let proc_len = proc.chars().count() as f64;
    let mean = ((orig_len + proc_len) / 2.0).max(1.0);
    distance / mean
}

/// Translation-content validation: the joined `source` fields must stay
/// faithful to the task source text.
pub fn validate_content(
    role: Role,
    source_text: &str,
    pairs: &[TranslationPair],
) -> Result<(), ContentError> {
    let joint = pairs
        .iter()
        .map(|p| p.source.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if !affix_matches(source_text, &joint) {
        return Err(ContentError::AffixMismatch);
    }
    let ratio = diff_ratio(&normalize_text(source_text), &normalize_text(&joint));
    if ratio > MAX_DIFF_RATIO {
        return Err(ContentError::ExcessiveDiff { ratio });
    }
    let mark_orig = extract_marks(source_text);
    let mark_proc = extract_marks(&joint);
    if mark_orig != mark_proc {
        return Err(ContentError::MarkMismatch {
            expected: mark_orig,
            actual: mark_proc,
        });
    }
    if role == Role::Table && extract_verticals(source_text) != extract_verticals(&joint) {
        return Err(ContentError::SeparatorMismatch);
    }
    for pair in pairs {
        if word_pair_re().is_match(&pair.source) && pair.target.is_empty() {
            return Err(ContentError::EmptyTarget {
                source: pair.source.clone(),
            });
        }
    }
    Ok(())
}

/// Whole-store validation before the rebuilder runs. Missing responses
/// and non-translated roles are skipped.
pub fn validate_tasks(tasks: &[TaskRecord]) -> bool {
    for task in tasks {
        if !task.role.is_translated() {
            continue;
        }
        let Some(response) = &task.response else {
            continue;
        };
        let ResponseContent::Pairs(pairs) = &response.content else {
            log::warn!("invalid task content: index={}: not a pair list", task.index);
            return false;
        };
        if let Err(e) = validate_content(task.role, &task.source_text, pairs) {
            log::warn!("invalid task content: index={}: {e}", task.index);
            return false;
        }
    }
    true
}

/// Whole-store validation for the analysis pipeline. Missing responses
/// are skipped.
pub fn validate_analysis_tasks(tasks: &[crate::book::AnalysisRecord]) -> bool {
    for task in tasks {
        let Some(response) = &task.response else {
            continue;
        };
        if let Err(e) = validate_analysis_content(&response.content, &task.request) {
            log::warn!("invalid task data: index={}: {e}", task.index);
            return false;
        }
    }
    true
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisError {
    NotAList,
    NotAnObject,
    WrongFormat { expected: &'static str },
    MissingText,
    MissingPattern,
    MissingElements,
    BadElementType,
    BadElementText,
    WrongLength { expected: usize, actual: usize },
    InconsistentText { expected: String, actual: String },
    ExcessiveDiff { expected: String, actual: String },
    DuplicatedSplit { text: String },
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAList => write!(f, "not a list"),
            Self::NotAnObject => write!(f, "not an object"),
            Self::WrongFormat { expected } => write!(f, "not a {expected} format"),
            Self::MissingText => write!(f, "no text"),
            Self::MissingPattern => write!(f, "no pattern"),
            Self::MissingElements => write!(f, "no elements list"),
            Self::BadElementType => write!(f, "invalid element type"),
            Self::BadElementText => write!(f, "invalid element text"),
            Self::WrongLength { expected, actual } => {
                write!(f, "invalid size of the output list: {actual} for {expected}")
            }
            Self::InconsistentText { expected, actual } => {
                write!(f, "inconsistent text: {expected} vs {actual}")
            }
            Self::ExcessiveDiff { expected, actual } => {
                write!(f, "too much diff: {expected} vs {actual}")
            }
            Self::DuplicatedSplit { text } => write!(f, "duplicated texts: {text}"),
        }
    }
}

impl std::error::Error for AnalysisError {}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn check_sentence(sentence: &Value, format: &'static str) -> Result<(), AnalysisError> {
    let Some(obj) = sentence.as_object() else {
        return Err(AnalysisError::NotAnObject);
    };
    if obj.get("format").and_then(Value::as_str) != Some(format) {
        return Err(AnalysisError::WrongFormat { expected: format });
    }
    if non_empty_str(obj.get("text")).is_none() {
        return Err(AnalysisError::MissingText);
    }
    if non_empty_str(obj.get("pattern")).is_none() {
        return Err(AnalysisError::MissingPattern);
    }
    let Some(elements) = obj.get("elements").and_then(Value::as_array) else {
        return Err(AnalysisError::MissingElements);
    };
    for element in elements {
        if element.get("type").and_then(Value::as_str).is_none() {
            return Err(AnalysisError::BadElementType);
        }
        if element.get("text").and_then(Value::as_str).is_none() {
            return Err(AnalysisError::BadElementText);
        }
    }
    for subclause in obj
        .get("subclauses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
    {
        check_sentence(subclause, "clause")?;
    }
    for subsentence in obj
        .get("subsentences")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
    {
        check_sentence(subsentence, "sentence")?;
    }
    Ok(())
}

/// Structural check for one source text's sentence list.
pub fn validate_sentence_content(content: &Value) -> Result<(), AnalysisError> {
    let Some(sentences) = content.as_array() else {
        return Err(AnalysisError::NotAList);
    };
    for sentence in sentences {
        check_sentence(sentence, "sentence")?;
    }
    Ok(())
}

fn chars_prefix(text: &str, len: usize) -> String {
    text.chars().take(len).collect()
}

/// Batch-level analysis validation: structure of every item plus lexical
/// agreement between each request pair and the first parsed sentence.
pub fn validate_analysis_content(
    content: &Value,
    pairs: &[TranslationPair],
) -> Result<(), AnalysisError> {
    let Some(items) = content.as_array() else {
        return Err(AnalysisError::NotAList);
    };
    for item in items {
        validate_sentence_content(item)?;
    }
    if items.len() != pairs.len() {
        return Err(AnalysisError::WrongLength {
            expected: pairs.len(),
            actual: items.len(),
        });
    }
    for (item, pair) in items.iter().zip(pairs) {
        let sentences = item.as_array().map(Vec::as_slice).unwrap_or(&[]);
        let first_text = sentences
            .first()
            .and_then(|s| s.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let norm_orig = normalize_text(&pair.source);
        let norm_first = normalize_text(first_text);
        let short_orig = chars_prefix(&norm_orig, norm_first.chars().count());
        if chars_prefix(&short_orig, 3) != chars_prefix(&norm_first, 3) {
            return Err(AnalysisError::InconsistentText {
                expected: short_orig,
                actual: norm_first,
            });
        }
        if diff_ratio(&short_orig, &norm_first) > MAX_DIFF_RATIO {
            return Err(AnalysisError::ExcessiveDiff {
                expected: short_orig,
                actual: norm_first,
            });
        }
        if norm_orig == norm_first && sentences.len() > 1 {
            let second_text = sentences[1].get("text").and_then(Value::as_str);
            if second_text == Some(first_text) {
                return Err(AnalysisError::DuplicatedSplit { text: short_orig });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(entries: &[(&str, &str)]) -> Vec<TranslationPair> {
        entries
            .iter()
            .map(|(s, t)| TranslationPair::new(*s, *t))
            .collect()
    }

    #[test]
    fn accepts_faithful_split() {
        let source = "He loved linguistics. It gave him wisdom.";
        let content = pairs(&[
            ("He loved linguistics.", "彼は言語学を好んだ。"),
            ("It gave him wisdom.", "それは彼に知恵を与えた。"),
        ]);
        assert_eq!(validate_content(Role::Paragraph, source, &content), Ok(()));
    }

    #[test]
    fn rejects_rewritten_source() {
        let source = "He loved linguistics. It gave him wisdom.";
        let content = pairs(&[("He adored the study of language and all it offered.", "訳")]);
        assert!(validate_content(Role::Paragraph, source, &content).is_err());
    }

    #[test]
    fn rejects_dropped_quotation_mark() {
        let source = "“Excuse me!”, shouted John.";
        let content = pairs(&[("“Excuse me!, shouted John.", "「すみません！」とジョンは叫んだ。")]);
        assert_eq!(
            validate_content(Role::Paragraph, source, &content),
            Err(ContentError::MarkMismatch {
                expected: "“”".to_string(),
                actual: "“".to_string(),
            })
        );
    }

    #[test]
    fn accepts_preserved_quotation_marks() {
        let source = "“Excuse me!”, shouted John.";
        let content = pairs(&[("“Excuse me!”, shouted John.", "「すみません！」とジョンは叫んだ。")]);
        assert_eq!(validate_content(Role::Paragraph, source, &content), Ok(()));
    }

    #[test]
    fn rejects_table_with_lost_separator() {
        let source = "| one | two | three | four |";
        let content = pairs(&[("| one | two  three | four |", "| 一 | 二 三 | 四 |")]);
        assert_eq!(
            validate_content(Role::Table, source, &content),
            Err(ContentError::SeparatorMismatch)
        );
    }

    #[test]
    fn table_separators_checked_only_for_tables() {
        let source = "| one | two | three | four |";
        let content = pairs(&[("| one | two  three | four |", "一 二 三 四")]);
        assert_eq!(validate_content(Role::Paragraph, source, &content), Ok(()));
    }

    #[test]
    fn rejects_empty_target_for_english_source() {
        let source = "The quick brown fox jumps.";
        let content = pairs(&[("The quick brown fox jumps.", "")]);
        assert_eq!(
            validate_content(Role::Paragraph, source, &content),
            Err(ContentError::EmptyTarget {
                source: "The quick brown fox jumps.".to_string(),
            })
        );
    }

    #[test]
    fn allows_empty_target_for_symbol_source() {
        let source = "# 1";
        let content = pairs(&[("# 1", "")]);
        assert_eq!(validate_content(Role::Header, source, &content), Ok(()));
    }

    #[test]
    fn rejects_mismatched_affix() {
        let source = "Everything stayed quiet in the old house.";
        let content = pairs(&[("Something stayed quiet in the old house.", "静かだった。")]);
        assert_eq!(
            validate_content(Role::Paragraph, source, &content),
            Err(ContentError::AffixMismatch)
        );
    }

    fn sentence(text: &str, pattern: &str) -> Value {
        json!({
            "format": "sentence",
            "text": text,
            "pattern": pattern,
            "elements": [
                {"type": "S", "text": "He", "translation": "彼は"},
                {"type": "V", "text": "ran", "translation": "走った"},
            ],
        })
    }

    #[test]
    fn sentence_content_accepts_well_formed_tree() {
        let content = json!([sentence("He ran.", "SV")]);
        assert_eq!(validate_sentence_content(&content), Ok(()));
    }

    #[test]
    fn sentence_content_rejects_wrong_format_tag() {
        let mut bad = sentence("He ran.", "SV");
        bad["format"] = json!("clause");
        assert_eq!(
            validate_sentence_content(&json!([bad])),
            Err(AnalysisError::WrongFormat {
                expected: "sentence"
            })
        );
    }

    #[test]
    fn sentence_content_rejects_missing_pattern() {
        let mut bad = sentence("He ran.", "SV");
        bad.as_object_mut().expect("object").remove("pattern");
        assert_eq!(
            validate_sentence_content(&json!([bad])),
            Err(AnalysisError::MissingPattern)
        );
    }

    #[test]
    fn sentence_content_checks_subclause_format() {
        let mut outer = sentence("He ran because it rained.", "SV");
        outer["subclauses"] = json!([sentence("because it rained", "SV")]);
        assert_eq!(
            validate_sentence_content(&json!([outer])),
            Err(AnalysisError::WrongFormat { expected: "clause" })
        );
    }

    #[test]
    fn analysis_content_requires_matching_length() {
        let content = json!([[sentence("He ran.", "SV")]]);
        let request = pairs(&[("He ran.", "彼は走った。"), ("She ran.", "彼女は走った。")]);
        assert_eq!(
            validate_analysis_content(&content, &request),
            Err(AnalysisError::WrongLength {
                expected: 2,
                actual: 1,
            })
        );
    }

    #[test]
    fn analysis_content_rejects_unrelated_first_sentence() {
        let content = json!([[sentence("Totally different text.", "SV")]]);
        let request = pairs(&[("He ran.", "彼は走った。")]);
        assert!(matches!(
            validate_analysis_content(&content, &request),
            Err(AnalysisError::InconsistentText { .. })
        ));
    }

    #[test]
    fn analysis_content_rejects_duplicated_split() {
        let content = json!([[sentence("He ran.", "SV"), sentence("He ran.", "SV")]]);
        let request = pairs(&[("He ran.", "彼は走った。")]);
        assert!(matches!(
            validate_analysis_content(&content, &request),
            Err(AnalysisError::DuplicatedSplit { .. })
        ));
    }

    #[test]
    fn analysis_content_accepts_split_sentences() {
        let content = json!([[sentence("He ran.", "SV"), sentence("She ran.", "SV")]]);
        let request = pairs(&[("He ran. She ran.", "彼は走った。彼女は走った。")]);
        assert_eq!(validate_analysis_content(&content, &request), Ok(()));
    }
}
