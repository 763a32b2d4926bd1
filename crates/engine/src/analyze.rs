#![forbid(unsafe_code)]

//! Retry engine for the syntactic-analysis pipeline. Requests are
//! token-bounded batches of pairs; non-English pairs are pulled out
//! before the model sees the batch and re-merged as fixed dummies.

use crate::batch::BatchReply;
use crate::chat::{ChatApi, ChatRequest, estimate_cost, extract_json_payload, fallback_model};
use crate::prompt::build_analysis_prompt;
use crate::{EngineConfig, EngineError};
use pb_core::book::{AnalysisResponse, TranslationPair};
use pb_core::tokens::count_tokens;
use pb_core::validate::validate_analysis_content;
use pb_core::width::cut_by_width;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

pub const MAX_TOKENS_IN_BATCH: usize = 1000;
pub const MAX_PAIRS_IN_BATCH: usize = 16;

/// Analysis ladder: same temperatures, but the variant flag injects the
/// source-echo example instead of switching context encoding.
pub const LADDER: &[(f64, bool)] = &[
    (0.0, false),
    (0.0, true),
    (0.4, false),
    (0.4, true),
    (0.8, false),
    (0.8, true),
];

const CALL_TIMEOUT: Duration = Duration::from_secs(300);
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

fn latin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{Latin}").expect("static latin pattern"))
}

/// Group pairs into prompt-sized requests: at most
/// `MAX_TOKENS_IN_BATCH` source tokens and `MAX_PAIRS_IN_BATCH` pairs
/// per request.
pub fn make_analysis_batches(pairs: &[TranslationPair]) -> Vec<Vec<TranslationPair>> {
    let mut batches: Vec<Vec<TranslationPair>> = Vec::new();
    let mut batch_tokens = 0usize;
    let mut batch_items = 0usize;
    for pair in pairs {
        let item_tokens = count_tokens(&pair.source);
        if batches.is_empty()
            || (batch_tokens > 0 && batch_tokens + item_tokens > MAX_TOKENS_IN_BATCH)
            || (batch_items > 0 && batch_items >= MAX_PAIRS_IN_BATCH)
        {
            batches.push(Vec::new());
            batch_tokens = 0;
            batch_items = 0;
        }
        if let Some(batch) = batches.last_mut() {
            batch.push(pair.clone());
        }
        batch_tokens += item_tokens;
        batch_items += 1;
    }
    batches
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

fn dummy_content(pair: &TranslationPair) -> Value {
    json!([{
        "format": "sentence",
        "text": pair.source,
        "pattern": "other",
        "elements": [
            {"type": "M", "text": pair.source, "translation": pair.target},
        ],
    }])
}

fn run_attempt(
    api: &dyn ChatApi,
    model: &str,
    temperature: f64,
    pairs: &[TranslationPair],
    extra_hint: &str,
    use_source_example: bool,
) -> Result<(Value, f64), String> {
    let prompt = build_analysis_prompt(pairs, extra_hint, use_source_example);
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
    let content: Value = serde_json::from_str(&payload).map_err(|e| e.to_string())?;
    validate_analysis_content(&content, pairs).map_err(|e| e.to_string())?;
    let cost = round8(estimate_cost(&prompt, &payload, model).map_err(|e| e.to_string())?);
    Ok((content, cost))
}

fn reuse_batch_reply(
    reply: &BatchReply,
    model: &str,
    pairs: &[TranslationPair],
    extra_hint: &str,
) -> Result<(Value, f64), String> {
    let texts: Vec<&str> = reply
        .content
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or(&[])
        .iter()
        .flat_map(|item| item.as_array().map(Vec::as_slice).unwrap_or(&[]))
        .filter_map(|sentence| sentence.get("text").and_then(Value::as_str))
        .collect();
    log::info!("Reusing: {}", cut_by_width(&texts.join(" "), 80));
    validate_analysis_content(&reply.content, pairs).map_err(|e| e.to_string())?;
    let prompt = build_analysis_prompt(pairs, extra_hint, LADDER[0].1);
    let cost = round8(estimate_cost(&prompt, &reply.raw, model).map_err(|e| e.to_string())?);
    Ok((reply.content.clone(), cost))
}

/// Execute one analysis request. Non-English pairs are excluded before
/// the ladder runs and merged back, in position, as `pattern="other"`
/// single-`M` dummies.
pub fn execute_analysis_task(
    api: &dyn ChatApi,
    cfg: &EngineConfig,
    request: &[TranslationPair],
    batch_reply: Option<&BatchReply>,
) -> Result<AnalysisResponse, EngineError> {
    let mut pairs: Vec<TranslationPair> = Vec::new();
    let mut void_pairs: HashMap<usize, Vec<TranslationPair>> = HashMap::new();
    for item in request {
        if latin_re().find_iter(&item.source).count() < 2 {
            void_pairs.entry(pairs.len()).or_default().push(item.clone());
        } else {
            pairs.push(item.clone());
        }
    }

    let mut models: Vec<&str> = vec![&cfg.model];
    if !cfg.no_fallback
        && let Some(fallback) = fallback_model(&cfg.model)
    {
        models.push(fallback);
    }
    let mut valid_content: Option<Value> = None;
    let mut valid_cost = 0.0;
    if !pairs.is_empty() {
        'models: for (model_index, model) in models.iter().enumerate() {
            for (attempt_index, (temperature, use_source_example)) in LADDER.iter().enumerate() {
                let attempt = attempt_index + 1;
                if model_index == 0 && attempt == 1
                    && let Some(reply) = batch_reply
                {
                    match reuse_batch_reply(reply, model, &pairs, &cfg.extra_hint) {
                        Ok((content, cost)) => {
                            valid_content = Some(content);
                            valid_cost = cost;
                            break 'models;
                        }
                        Err(e) => {
                            log::info!("Attempt {attempt} failed (batch): {e}");
                            std::thread::sleep(RETRY_BACKOFF);
                            continue;
                        }
                    }
                }
                match run_attempt(
                    api,
                    model,
                    *temperature,
                    &pairs,
                    &cfg.extra_hint,
                    *use_source_example,
                ) {
                    Ok((content, cost)) => {
                        valid_content = Some(content);
                        valid_cost = cost;
                        break 'models;
                    }
                    Err(e) => {
                        log::info!(
                            "Attempt {attempt} failed (model={model}, temperature={temperature}, use_source_example={use_source_example}): {e}",
                        );
                        std::thread::sleep(RETRY_BACKOFF);
                    }
                }
            }
        }
    }
    let valid_content = match valid_content {
        Some(content) => content,
        None if pairs.is_empty() => json!([]),
        None if cfg.failsoft => {
            log::warn!("Failsoft: dummy data is generated");
            let dummies = void_pairs.entry(0).or_default();
            for _ in &pairs {
                dummies.push(TranslationPair::new("[*FAILSOFT*]", "[*FAILSOFT*]"));
            }
            json!([])
        }
        None => return Err(EngineError::RetriesExhausted),
    };

    let mut merged: Vec<Value> = Vec::new();
    let items = valid_content.as_array().map(Vec::as_slice).unwrap_or(&[]);
    for (index, item) in items.iter().enumerate() {
        if let Some(void_items) = void_pairs.get(&index) {
            for void_item in void_items {
                merged.push(dummy_content(void_item));
            }
        }
        merged.push(item.clone());
    }
    if let Some(void_items) = void_pairs.get(&items.len()) {
        for void_item in void_items {
            merged.push(dummy_content(void_item));
        }
    }
    Ok(AnalysisResponse {
        content: Value::Array(merged),
        cost: valid_cost,
    })
}
