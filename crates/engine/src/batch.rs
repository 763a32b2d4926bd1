#![forbid(unsafe_code)]

//! Offline batch-API plumbing: serialize attempt-1 prompts to a JSONL
//! request file, and index a returned JSONL response file by task index
//! so the retry engines can reuse the results in place of online calls.

use crate::chat::extract_json_payload;
use crate::context;
use crate::prompt::{
    TranslationPromptInput, build_analysis_prompt, build_translation_prompt,
};
use crate::retry;
use pb_core::book::{InputTask, TranslationPair};
use regex::Regex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::OnceLock;
use uuid::Uuid;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

fn custom_id_index_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-(\d+)$").expect("static custom id pattern"))
}

fn latin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{Latin}").expect("static latin pattern"))
}

/// One parsed batch-API response, indexed for reuse at attempt 1.
#[derive(Clone, Debug)]
pub struct BatchReply {
    pub index: i64,
    /// The assistant message body after fence/comma normalization,
    /// parsed; an empty array when it did not parse.
    pub content: Value,
    /// The normalized message text, kept for cost estimation.
    pub raw: String,
    pub usage: Value,
}

/// `"<prog>-<stem16>-<uuid4hex>"`; the per-task suffix added later keeps
/// the index recoverable by regex.
pub fn custom_id_prefix(prog: &str, input_stem: &str) -> String {
    let mut stem: String = input_stem
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .take(16)
        .collect();
    if stem.is_empty() {
        stem = "book".to_string();
    }
    format!("{prog}-{stem}-{}", Uuid::new_v4().simple())
}

fn request_line(custom_id: String, model: &str, prompt: String) -> Value {
    json!({
        "custom_id": custom_id,
        "method": "POST",
        "url": CHAT_COMPLETIONS_PATH,
        "body": {
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        },
    })
}

/// Attempt-1 prompts for every model-bound translation task. Tasks the
/// online path would satisfy locally (macro/code, non-English, very long
/// sources) get no batch request.
pub fn make_translation_batch_input(
    tasks: &[InputTask],
    book_title: &str,
    model: &str,
    extra_hint: &str,
    prefix: &str,
) -> Vec<Value> {
    let mut lines = Vec::new();
    for (index, task) in tasks.iter().enumerate() {
        if !task.role.is_translated() {
            continue;
        }
        if latin_re().find_iter(&task.source_text).count() < 2 {
            continue;
        }
        if task.source_text.chars().count() > 2000 {
            continue;
        }
        let prompt = build_translation_prompt(&TranslationPromptInput {
            book_title,
            role: task.role,
            source_text: &task.source_text,
            hint: &context::scene_hint(tasks, index as i64),
            prev_context: &context::prev_context(tasks, index as i64),
            next_context: &context::next_context(tasks, index as i64),
            extra_hint,
            attempt: 1,
            jsonize_input: retry::LADDER[0].1,
        });
        lines.push(request_line(format!("{prefix}-{index:05}"), model, prompt));
    }
    lines
}

/// Attempt-1 prompts for every analysis request batch.
pub fn make_analysis_batch_input(
    requests: &[Vec<TranslationPair>],
    model: &str,
    extra_hint: &str,
    prefix: &str,
) -> Vec<Value> {
    requests
        .iter()
        .enumerate()
        .map(|(index, request)| {
            let prompt = build_analysis_prompt(request, extra_hint, crate::analyze::LADDER[0].1);
            request_line(format!("{prefix}-{index:05}"), model, prompt)
        })
        .collect()
}

pub fn write_jsonl(path: &Path, lines: &[Value]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Parse a batch-API output file into replies indexed by task index.
/// Malformed lines are logged and skipped; only file I/O errors fail.
pub fn read_batch_output(path: &Path) -> std::io::Result<BTreeMap<i64, BatchReply>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut replies = BTreeMap::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line_num = line_num + 1;
        let data: Value = match serde_json::from_str(&line) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("invalid batch data: line={line_num}: {e}");
                continue;
            }
        };
        let Some(custom_id) = data.get("custom_id").and_then(Value::as_str) else {
            continue;
        };
        let Some(index) = custom_id_index_re()
            .captures(custom_id)
            .and_then(|c| c[1].parse::<i64>().ok())
        else {
            continue;
        };
        let body = data.get("response").and_then(|v| v.get("body"));
        let Some(usage) = body.and_then(|v| v.get("usage")) else {
            continue;
        };
        let Some(message) = body
            .and_then(|v| v.get("choices"))
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let raw = extract_json_payload(message);
        let content: Value = serde_json::from_str(&raw).unwrap_or_else(|_| json!([]));
        replies.insert(
            index,
            BatchReply {
                index,
                content,
                raw,
                usage: usage.clone(),
            },
        );
    }
    Ok(replies)
}
