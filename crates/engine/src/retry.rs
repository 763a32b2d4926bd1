#![forbid(unsafe_code)]

//! The translation retry ladder. Per task: primary model across six
//! (temperature, context-variant) rows, then the fallback model over the
//! same rows. Only a validated response is ever returned, so the caller
//! can persist whatever comes back.

use crate::batch::BatchReply;
use crate::chat::{ChatApi, ChatRequest, estimate_cost, extract_json_payload, fallback_model};
use crate::prompt::{TranslationPromptInput, build_translation_prompt};
use crate::{EngineConfig, EngineError};
use pb_core::book::{MacroRecord, ResponseContent, Role, TaskResponse, TranslationPair};
use pb_core::split::split_sentences;
use pb_core::validate::validate_content;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

/// Temperature and context-variant rows tried per model, in order.
pub const LADDER: &[(f64, bool)] = &[
    (0.0, true),
    (0.0, false),
    (0.4, true),
    (0.4, false),
    (0.8, true),
    (0.8, false),
];

pub const FAILSOFT_TARGET: &str = "[*FAILSOFT*]";
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Sources longer than this are translated as sub-batches.
const LONG_SOURCE_CHARS: usize = 2000;
const SUB_BATCH_CHARS: usize = 1000;

fn latin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{Latin}").expect("static latin pattern"))
}

fn leading_mark_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\p{Quotation_Mark}").expect("static mark pattern"))
}

fn trailing_mark_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{Quotation_Mark}$").expect("static mark pattern"))
}

fn macro_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([-_a-zA-Z0-9]+)(\s.*)?$").expect("static macro pattern"))
}

/// Scene hint plus the prev/next source windows for one task.
#[derive(Clone, Debug, Default)]
pub struct TaskContext {
    pub hint: String,
    pub prev: Vec<String>,
    pub next: Vec<String>,
}

fn optional_hint(hint: &str) -> Option<String> {
    if hint.is_empty() {
        None
    } else {
        Some(hint.to_string())
    }
}

fn intact_response(source_text: &str, hint: &str) -> TaskResponse {
    TaskResponse {
        content: ResponseContent::Pairs(vec![TranslationPair::new(source_text, source_text)]),
        hint: optional_hint(hint),
        cost: 0.0,
        error: false,
        intact: true,
    }
}

fn failsoft_response(source_text: &str, hint: &str) -> TaskResponse {
    TaskResponse {
        content: ResponseContent::Pairs(vec![TranslationPair::new(
            source_text,
            FAILSOFT_TARGET,
        )]),
        hint: optional_hint(hint),
        cost: 0.0,
        error: true,
        intact: false,
    }
}

/// Macro tasks never reach the model: the name is the first word, the
/// rest is the value.
pub fn simulate_macro_task(source_text: &str) -> TaskResponse {
    let (name, value) = match macro_name_re().captures(source_text) {
        Some(captures) => (
            captures[1].to_string(),
            captures.get(2).map(|m| m.as_str().trim().to_string()),
        ),
        None => ("unknown".to_string(), None),
    };
    TaskResponse::record(MacroRecord { name, value })
}

/// Code tasks keep their text verbatim.
pub fn simulate_code_task(source_text: &str) -> TaskResponse {
    TaskResponse::record(MacroRecord {
        name: "code".to_string(),
        value: Some(source_text.to_string()),
    })
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// Re-attach a quotation mark the model dropped from the first or last
/// pair, mirroring it on the target side.
fn reattach_quotes(source_text: &str, pairs: &mut [TranslationPair]) {
    if pairs.is_empty() {
        return;
    }
    if let Some(mark) = leading_mark_re().find(source_text).map(|m| m.as_str().to_string()) {
        let first = &mut pairs[0];
        if !first.source.starts_with(&mark) {
            first.source = format!("{mark}{}", first.source);
            if !leading_mark_re().is_match(&first.target) {
                first.target = format!("「{}", first.target);
            }
        }
    }
    if let Some(mark) = trailing_mark_re().find(source_text).map(|m| m.as_str().to_string()) {
        let Some(last) = pairs.last_mut() else {
            return;
        };
        if !last.source.ends_with(&mark) {
            last.source = format!("{}{mark}", last.source);
            if !trailing_mark_re().is_match(&last.target) {
                last.target = format!("{}」", last.target);
            }
        }
    }
}

/// Shape-check a parsed reply and turn it into validated pairs.
fn record_from_reply(
    data: &Value,
    role: Role,
    source_text: &str,
) -> Result<(Vec<TranslationPair>, String), String> {
    let Some(translations) = data.get("translations").and_then(Value::as_array) else {
        return Err("missing translations list".to_string());
    };
    let Some(hint) = data.get("context_hint").and_then(Value::as_str) else {
        return Err("missing context_hint string".to_string());
    };
    let mut pairs = Vec::new();
    for translation in translations {
        let Some(en) = translation.get("en").and_then(Value::as_str) else {
            return Err("missing en field".to_string());
        };
        let Some(ja) = translation.get("ja").and_then(Value::as_str) else {
            return Err("missing ja field".to_string());
        };
        pairs.push(TranslationPair::new(en, ja));
    }
    reattach_quotes(source_text, &mut pairs);
    validate_content(role, source_text, &pairs).map_err(|e| e.to_string())?;
    Ok((pairs, hint.to_string()))
}

struct Attempt<'a> {
    book_title: &'a str,
    role: Role,
    source_text: &'a str,
    ctx: &'a TaskContext,
    extra_hint: &'a str,
    attempt: u32,
    jsonize_input: bool,
}

impl Attempt<'_> {
    fn prompt(&self) -> String {
        build_translation_prompt(&TranslationPromptInput {
            book_title: self.book_title,
            role: self.role,
            source_text: self.source_text,
            hint: &self.ctx.hint,
            prev_context: &self.ctx.prev,
            next_context: &self.ctx.next,
            extra_hint: self.extra_hint,
            attempt: self.attempt,
            jsonize_input: self.jsonize_input,
        })
    }
}

fn run_attempt(
    api: &dyn ChatApi,
    model: &str,
    temperature: f64,
    attempt: &Attempt<'_>,
) -> Result<TaskResponse, String> {
    let prompt = attempt.prompt();
    log::debug!("Prompt:\n{prompt}");
    let reply = api
        .complete(&ChatRequest {
            model,
            prompt: &prompt,
            temperature,
            timeout: CALL_TIMEOUT,
        })
        .map_err(|e| e.to_string())?;
    let payload = extract_json_payload(&reply);
    log::debug!("Response:\n{payload}");
    let data: Value = serde_json::from_str(&payload).map_err(|e| e.to_string())?;
    let (pairs, hint) = record_from_reply(&data, attempt.role, attempt.source_text)?;
    let cost = round8(estimate_cost(&prompt, &payload, model).map_err(|e| e.to_string())?);
    Ok(TaskResponse {
        content: ResponseContent::Pairs(pairs),
        hint: Some(hint),
        cost,
        error: false,
        intact: false,
    })
}

fn reuse_batch_reply(
    reply: &BatchReply,
    model: &str,
    attempt: &Attempt<'_>,
) -> Result<TaskResponse, String> {
    let (pairs, hint) = record_from_reply(&reply.content, attempt.role, attempt.source_text)?;
    let prompt = attempt.prompt();
    let cost = round8(estimate_cost(&prompt, &reply.raw, model).map_err(|e| e.to_string())?);
    Ok(TaskResponse {
        content: ResponseContent::Pairs(pairs),
        hint: Some(hint),
        cost,
        error: false,
        intact: false,
    })
}

fn run_ladder(
    api: &dyn ChatApi,
    cfg: &EngineConfig,
    book_title: &str,
    role: Role,
    source_text: &str,
    ctx: &TaskContext,
    batch_reply: Option<&BatchReply>,
) -> Result<TaskResponse, EngineError> {
    let mut models: Vec<&str> = vec![&cfg.model];
    if !cfg.no_fallback
        && let Some(fallback) = fallback_model(&cfg.model)
    {
        models.push(fallback);
    }
    for (model_index, model) in models.iter().enumerate() {
        for (attempt_index, (temperature, jsonize_input)) in LADDER.iter().enumerate() {
            let attempt = Attempt {
                book_title,
                role,
                source_text,
                ctx,
                extra_hint: &cfg.extra_hint,
                attempt: attempt_index as u32 + 1,
                jsonize_input: *jsonize_input,
            };
            // a supplied batch result replaces the very first online call
            if model_index == 0 && attempt.attempt == 1
                && let Some(reply) = batch_reply
            {
                match reuse_batch_reply(reply, model, &attempt) {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        log::info!("Attempt 1 failed (batch): {e}");
                        std::thread::sleep(RETRY_BACKOFF);
                        continue;
                    }
                }
            }
            match run_attempt(api, model, *temperature, &attempt) {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log::info!(
                        "Attempt {} failed (model={}, temperature={}, jsonize_input={}): {e}",
                        attempt.attempt,
                        model,
                        temperature,
                        jsonize_input,
                    );
                    std::thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    if cfg.failsoft {
        log::warn!("Failsoft: dummy data is generated");
        return Ok(failsoft_response(source_text, &ctx.hint));
    }
    Err(EngineError::RetriesExhausted)
}

fn pick_window(sentences: &[String], width_budget: usize, from_end: bool) -> Vec<String> {
    let mut picked = Vec::new();
    let mut sum = 0usize;
    let iter: Box<dyn Iterator<Item = &String>> = if from_end {
        Box::new(sentences.iter().rev())
    } else {
        Box::new(sentences.iter())
    };
    for sentence in iter {
        if sum >= width_budget {
            break;
        }
        sum += pb_core::width::display_width(sentence);
        picked.push(sentence.clone());
    }
    if from_end {
        picked.reverse();
    }
    picked
}

fn execute_long_translation(
    api: &dyn ChatApi,
    cfg: &EngineConfig,
    book_title: &str,
    role: Role,
    source_text: &str,
    ctx: &TaskContext,
) -> Result<TaskResponse, EngineError> {
    let sentences = split_sentences(source_text);
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut batch_chars = 0usize;
    for sentence in sentences {
        let chars = sentence.chars().count();
        if batches.is_empty() || batch_chars + chars > SUB_BATCH_CHARS {
            batches.push(Vec::new());
            batch_chars = 0;
        }
        if let Some(batch) = batches.last_mut() {
            batch.push(sentence);
        }
        batch_chars += chars;
    }
    log::info!("Long input: {} sub-batches", batches.len());
    let mut pairs: Vec<TranslationPair> = Vec::new();
    let mut cost = 0.0;
    let mut hint = ctx.hint.clone();
    let mut had_error = false;
    for (i, batch) in batches.iter().enumerate() {
        let batch_text = batch.join(" ");
        let prev = if i == 0 {
            ctx.prev.clone()
        } else {
            pick_window(&batches[i - 1], crate::context::PREV_WIDTH_BUDGET, true)
        };
        let next = if i + 1 == batches.len() {
            ctx.next.clone()
        } else {
            pick_window(&batches[i + 1], crate::context::NEXT_WIDTH_BUDGET, false)
        };
        let batch_ctx = TaskContext {
            hint: hint.clone(),
            prev,
            next,
        };
        let response = run_ladder(api, cfg, book_title, role, &batch_text, &batch_ctx, None)?;
        if let Some(batch_hint) = &response.hint {
            hint = batch_hint.clone();
        }
        cost += response.cost;
        had_error = had_error || response.error;
        if let ResponseContent::Pairs(batch_pairs) = response.content {
            pairs.extend(batch_pairs);
        }
    }
    Ok(TaskResponse {
        content: ResponseContent::Pairs(pairs),
        hint: optional_hint(&hint),
        cost: round8(cost),
        error: had_error,
        intact: false,
    })
}

/// Execute one translation task end to end: intact synthesis for
/// non-English sources, sub-batching for very long ones, otherwise the
/// retry ladder with optional batch-result reuse.
pub fn execute_translation_task(
    api: &dyn ChatApi,
    cfg: &EngineConfig,
    book_title: &str,
    role: Role,
    source_text: &str,
    ctx: &TaskContext,
    batch_reply: Option<&BatchReply>,
) -> Result<TaskResponse, EngineError> {
    if latin_re().find_iter(source_text).count() < 2 {
        log::debug!("Not English: intact data is generated");
        return Ok(intact_response(source_text, &ctx.hint));
    }
    if source_text.chars().count() > LONG_SOURCE_CHARS {
        return execute_long_translation(api, cfg, book_title, role, source_text, ctx);
    }
    run_ladder(api, cfg, book_title, role, source_text, ctx, batch_reply)
}
