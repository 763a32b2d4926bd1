#![forbid(unsafe_code)]

//! Syntactic-analysis post-processing and output annotation. The model's
//! sentence trees are corrected against the element-type multiset, then
//! spliced back onto the parallel book by source text.

use crate::book::{AnalysisRecord, TranslationPair};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisInputError {
    NotParallel,
}

impl std::fmt::Display for AnalysisInputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotParallel => write!(f, "not parallel book data"),
        }
    }
}

impl std::error::Error for AnalysisInputError {}

const PAIR_BLOCK_KEYS: &[&str] = &["header", "paragraph", "blockquote", "list", "table"];

/// Visit every `{source, target}` pair object of a parallel book in
/// document order: title, author, then chapter titles and body blocks.
fn visit_pairs(book: &mut Value, visit: &mut impl FnMut(&mut Map<String, Value>)) {
    fn visit_obj(value: &mut Value, visit: &mut impl FnMut(&mut Map<String, Value>)) {
        if let Some(obj) = value.as_object_mut()
            && obj.contains_key("source")
        {
            visit(obj);
        }
    }

    if let Some(title) = book.get_mut("title") {
        visit_obj(title, visit);
    }
    if let Some(author) = book.get_mut("author") {
        visit_obj(author, visit);
    }
    let Some(chapters) = book.get_mut("chapters").and_then(Value::as_array_mut) else {
        return;
    };
    for chapter in chapters {
        if let Some(title) = chapter.get_mut("title") {
            visit_obj(title, visit);
        }
        let Some(body) = chapter.get_mut("body").and_then(Value::as_array_mut) else {
            continue;
        };
        for element in body {
            for name in PAIR_BLOCK_KEYS {
                match element.get_mut(*name) {
                    Some(Value::Array(items)) => {
                        for item in items {
                            if let Value::Array(cells) = item {
                                for cell in cells {
                                    visit_obj(cell, visit);
                                }
                            } else {
                                visit_obj(item, visit);
                            }
                        }
                    }
                    Some(other) => visit_obj(other, visit),
                    None => {}
                }
            }
        }
    }
}

/// Extract the ordered `{source, target}` pairs of a parallel book.
pub fn collect_pairs(book: &mut Value) -> Result<Vec<TranslationPair>, AnalysisInputError> {
    if book.get("format").and_then(Value::as_str) != Some("parallel") {
        return Err(AnalysisInputError::NotParallel);
    }
    let mut pairs = Vec::new();
    visit_pairs(book, &mut |obj| {
        let source = obj.get("source").and_then(Value::as_str).unwrap_or("");
        let target = obj.get("target").and_then(Value::as_str).unwrap_or("");
        pairs.push(TranslationPair::new(source, target));
    });
    Ok(pairs)
}

fn element_text_is_blank(element: &Value) -> bool {
    element
        .get("text")
        .and_then(Value::as_str)
        .map(|t| t.trim().is_empty())
        .unwrap_or(true)
}

/// Drop blank elements and correct `pattern` to match the element-type
/// multiset. Precedence: O with C is SVOC, two O is SVOO, O alone is SVO,
/// C alone is SVC, otherwise SV; without a V the pattern stays as-is.
pub fn postprocess_sentence(sentence: &mut Value, index: i64) {
    let Some(obj) = sentence.as_object_mut() else {
        return;
    };
    let mut counts: HashMap<String, usize> = HashMap::new();
    if let Some(elements) = obj.get_mut("elements").and_then(Value::as_array_mut) {
        elements.retain(|element| !element_text_is_blank(element));
        for element in elements.iter() {
            if let Some(kind) = element.get("type").and_then(Value::as_str) {
                *counts.entry(kind.to_string()).or_insert(0) += 1;
            }
        }
    }
    if !counts.contains_key("V") {
        return;
    }
    let corrected = if counts.contains_key("O") {
        if counts.contains_key("C") {
            "SVOC"
        } else if counts.get("O").copied().unwrap_or(0) >= 2 {
            "SVOO"
        } else {
            "SVO"
        }
    } else if counts.contains_key("C") {
        "SVC"
    } else {
        "SV"
    };
    let pattern = obj.get("pattern").and_then(Value::as_str).unwrap_or("");
    if pattern != corrected {
        let text = obj.get("text").and_then(Value::as_str).unwrap_or("");
        log::debug!("pattern corrected: {pattern} -> {corrected} : task={index}: {text}");
        obj.insert("pattern".to_string(), json!(corrected));
    }
}

fn postprocess_children(sentence: &mut Value, index: i64) {
    for key in ["subclauses", "subsentences"] {
        if let Some(children) = sentence.get_mut(key).and_then(Value::as_array_mut) {
            for child in children {
                postprocess_sentence(child, index);
            }
        }
    }
}

/// Per-task post-processing over a response's content list, one item per
/// request pair.
pub fn postprocess_response(content: &mut Value, request: &[TranslationPair], index: i64) {
    let Some(items) = content.as_array_mut() else {
        return;
    };
    for (item, pair) in items.iter_mut().zip(request) {
        let Some(sentences) = item.as_array_mut() else {
            continue;
        };
        // a common model slip: the first "sentence" echoes the whole
        // source and the second repeats its own tail
        if sentences.len() == 2 {
            let first_text = sentences[0]
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let second_text = sentences[1]
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if first_text == pair.source
                && let Some(stripped) = first_text.strip_suffix(second_text.as_str())
            {
                let short = stripped.trim_end();
                if short.chars().count() >= 3
                    && let Some(obj) = sentences[0].as_object_mut()
                {
                    obj.insert("text".to_string(), json!(short));
                }
            }
        }
        for sentence in sentences {
            postprocess_sentence(sentence, index);
            postprocess_children(sentence, index);
        }
    }
}

/// Run post-processing over every completed task.
pub fn postprocess_tasks(tasks: &mut [AnalysisRecord]) {
    for task in tasks {
        let index = task.index;
        let request = task.request.clone();
        if let Some(response) = task.response.as_mut() {
            postprocess_response(&mut response.content, &request, index);
        }
    }
}

fn strip_format(sentence: &mut Value) {
    let Some(obj) = sentence.as_object_mut() else {
        return;
    };
    obj.remove("format");
    for key in ["subclauses", "subsentences"] {
        if let Some(children) = obj.get_mut(key).and_then(Value::as_array_mut) {
            for child in children {
                if let Some(child_obj) = child.as_object_mut() {
                    child_obj.remove("format");
                }
            }
        }
    }
}

/// Splice completed analyses back onto the parallel book. Results are
/// keyed by source text and consumed in document order so repeated texts
/// resolve to distinct task items.
pub fn annotate_book(book: &mut Value, tasks: &[AnalysisRecord]) {
    let mut depot: HashMap<String, VecDeque<(String, Value)>> = HashMap::new();
    for task in tasks {
        let Some(response) = &task.response else {
            log::warn!("Stop by an unprocessed task: {}", task.index);
            break;
        };
        let items = response.content.as_array().map(Vec::as_slice).unwrap_or(&[]);
        for (seq, (pair, item)) in task.request.iter().zip(items).enumerate() {
            let index_seq = format!("{:05}-{:03}", task.index, seq);
            depot
                .entry(pair.source.clone())
                .or_default()
                .push_back((index_seq, item.clone()));
        }
    }
    visit_pairs(book, &mut |obj| {
        let source = obj.get("source").and_then(Value::as_str).unwrap_or("");
        let Some(results) = depot.get_mut(source) else {
            return;
        };
        let Some((index_seq, content)) = results.pop_front() else {
            return;
        };
        let mut sentences = content.as_array().cloned().unwrap_or_default();
        for (i, sentence) in sentences.iter_mut().enumerate() {
            strip_format(sentence);
            if let Some(sentence_obj) = sentence.as_object_mut() {
                sentence_obj.insert("id".to_string(), json!(format!("{index_seq}-{i:03}")));
            }
        }
        obj.insert("analysis".to_string(), Value::Array(sentences));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::AnalysisResponse;

    fn sentence(text: &str, pattern: &str, types: &[&str]) -> Value {
        let elements: Vec<Value> = types
            .iter()
            .map(|t| json!({"type": t, "text": "word", "translation": "語"}))
            .collect();
        json!({
            "format": "sentence",
            "text": text,
            "pattern": pattern,
            "elements": elements,
        })
    }

    #[test]
    fn corrects_pattern_to_svoc() {
        let mut s = sentence("You make me happy.", "SVO", &["S", "V", "O", "C"]);
        postprocess_sentence(&mut s, 0);
        assert_eq!(s["pattern"], "SVOC");
    }

    #[test]
    fn corrects_pattern_to_svoo() {
        let mut s = sentence("She gave him chocolate.", "SVO", &["S", "V", "O", "O"]);
        postprocess_sentence(&mut s, 0);
        assert_eq!(s["pattern"], "SVOO");
    }

    #[test]
    fn corrects_pattern_to_svo_svc_sv() {
        let mut s = sentence("You ate it.", "SV", &["S", "V", "O", "M"]);
        postprocess_sentence(&mut s, 0);
        assert_eq!(s["pattern"], "SVO");

        let mut s = sentence("He is kind.", "SVO", &["S", "V", "C"]);
        postprocess_sentence(&mut s, 0);
        assert_eq!(s["pattern"], "SVC");

        let mut s = sentence("I ran.", "SVC", &["S", "V", "M"]);
        postprocess_sentence(&mut s, 0);
        assert_eq!(s["pattern"], "SV");
    }

    #[test]
    fn keeps_pattern_without_verb() {
        let mut s = sentence("Nice to meet you.", "other", &["M"]);
        postprocess_sentence(&mut s, 0);
        assert_eq!(s["pattern"], "other");
    }

    #[test]
    fn drops_blank_elements_before_counting() {
        let mut s = sentence("He ran.", "SVO", &["S", "V"]);
        s["elements"]
            .as_array_mut()
            .expect("elements")
            .push(json!({"type": "O", "text": "   "}));
        postprocess_sentence(&mut s, 0);
        assert_eq!(s["pattern"], "SV");
        assert_eq!(s["elements"].as_array().expect("elements").len(), 2);
    }

    #[test]
    fn trims_echoed_tail_from_first_sentence() {
        let source = "He stopped. Then he ran.";
        let mut content = json!([[
            sentence(source, "SV", &["S", "V"]),
            sentence("Then he ran.", "SV", &["S", "V"]),
        ]]);
        postprocess_response(
            &mut content,
            &[TranslationPair::new(source, "彼は止まった。そして走った。")],
            7,
        );
        assert_eq!(content[0][0]["text"], "He stopped.");
        assert_eq!(content[0][1]["text"], "Then he ran.");
    }

    #[test]
    fn annotates_pairs_in_document_order() {
        let mut book = json!({
            "format": "parallel",
            "title": {"source": "A Tale", "target": "ある物語"},
            "chapters": [{
                "body": [
                    {"paragraph": [
                        {"source": "He ran.", "target": "彼は走った。"},
                        {"source": "He ran.", "target": "彼は走った。"},
                    ]},
                ],
            }],
        });
        let tasks = vec![AnalysisRecord {
            index: 0,
            request: vec![
                TranslationPair::new("A Tale", "ある物語"),
                TranslationPair::new("He ran.", "彼は走った。"),
                TranslationPair::new("He ran.", "彼は走った。"),
            ],
            response: Some(AnalysisResponse {
                content: json!([
                    [sentence("A Tale", "other", &["M"])],
                    [sentence("He ran.", "SV", &["S", "V"])],
                    [sentence("He ran.", "SV", &["S", "V"])],
                ]),
                cost: 0.0,
            }),
        }];
        annotate_book(&mut book, &tasks);
        assert_eq!(book["title"]["analysis"][0]["id"], "00000-000-000");
        let body = &book["chapters"][0]["body"][0]["paragraph"];
        assert_eq!(body[0]["analysis"][0]["id"], "00000-001-000");
        assert_eq!(body[1]["analysis"][0]["id"], "00000-002-000");
        // format tags are an exchange detail, not output
        assert!(body[0]["analysis"][0].get("format").is_none());
    }

    #[test]
    fn collect_pairs_requires_parallel_format() {
        let mut book = json!({"format": "source"});
        assert_eq!(
            collect_pairs(&mut book),
            Err(AnalysisInputError::NotParallel)
        );
    }

    #[test]
    fn collect_pairs_walks_tables_and_lists() {
        let mut book = json!({
            "format": "parallel",
            "chapters": [{
                "body": [
                    {"list": [
                        {"source": "one", "target": "一"},
                        {"source": "two", "target": "二"},
                    ]},
                    {"table": [[
                        {"source": "Name", "target": "名前"},
                        {"source": "Score", "target": "得点"},
                    ]]},
                ],
            }],
        });
        let pairs = collect_pairs(&mut book).expect("pairs");
        let sources: Vec<&str> = pairs.iter().map(|p| p.source.as_str()).collect();
        assert_eq!(sources, vec!["one", "two", "Name", "Score"]);
    }
}
