#![forbid(unsafe_code)]

//! Chat-completion RPC seam. The retry engine only sees the `ChatApi`
//! trait, so tests swap in a deterministic fake and never touch the
//! network.

use pb_core::tokens::count_tokens;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::OnceLock;
use std::time::Duration;

/// Known models with USD-per-1K-token input/output rates. The fallback
/// model for any primary is the first entry with a different name.
pub const MODELS: &[(&str, f64, f64)] = &[
    ("gpt-4.1-mini", 0.00040, 0.00160),
    ("gpt-4.1", 0.00200, 0.00800),
    ("gpt-4.1-nano", 0.00010, 0.00040),
    ("gpt-3.5-turbo", 0.00050, 0.00150),
    ("gpt-4o", 0.00250, 0.01000),
    ("gpt-4-turbo", 0.01000, 0.03000),
    ("gpt-4", 0.01000, 0.03000),
];

pub fn default_model() -> &'static str {
    MODELS[0].0
}

pub fn model_rates(model: &str) -> Option<(f64, f64)> {
    MODELS
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|(_, input, output)| (*input, *output))
}

pub fn fallback_model(primary: &str) -> Option<&'static str> {
    MODELS
        .iter()
        .map(|(name, _, _)| *name)
        .find(|name| *name != primary)
}

#[derive(Debug)]
pub enum ChatError {
    Http(ureq::Error),
    MalformedReply,
    UnknownModel(String),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(err) => write!(f, "http: {err}"),
            Self::MalformedReply => write!(f, "no assistant message in reply"),
            Self::UnknownModel(model) => write!(f, "no matching model: {model}"),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<ureq::Error> for ChatError {
    fn from(value: ureq::Error) -> Self {
        Self::Http(value)
    }
}

/// Prompt token count priced at the model's input rate plus reply token
/// count at the output rate.
pub fn estimate_cost(prompt: &str, reply: &str, model: &str) -> Result<f64, ChatError> {
    let (input_rate, output_rate) =
        model_rates(model).ok_or_else(|| ChatError::UnknownModel(model.to_string()))?;
    let input_tokens = count_tokens(prompt) as f64;
    let output_tokens = count_tokens(reply) as f64;
    let total = input_tokens / 1000.0 * input_rate + output_tokens / 1000.0 * output_rate;
    log::debug!(
        "Cost: {total:.6} ({:.3}*{input_rate}+{:.3}*{output_rate})",
        input_tokens / 1000.0,
        output_tokens / 1000.0,
    );
    Ok(total)
}

#[derive(Clone, Debug)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub temperature: f64,
    pub timeout: Duration,
}

pub trait ChatApi {
    /// One chat completion; returns the assistant message text.
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, ChatError>;
}

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Blocking OpenAI-compatible client with a per-call global timeout.
#[derive(Debug)]
pub struct OpenAiClient {
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

impl ChatApi for OpenAiClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, ChatError> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(request.timeout))
            .build()
            .into();
        let body = json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
        });
        let mut response = agent
            .post(CHAT_COMPLETIONS_URL)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(&body)?;
        let data: Value = response.body_mut().read_json()?;
        data.get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ChatError::MalformedReply)
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*([{\[].*?[}\]])\s*```").expect("static fence pattern")
    })
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([\]}])").expect("static comma pattern"))
}

/// Strip an outer ```json fence and trailing commas so a merely sloppy
/// reply still parses.
pub fn extract_json_payload(reply: &str) -> String {
    let body = match fence_re().captures(reply) {
        Some(captures) => captures[1].to_string(),
        None => reply.to_string(),
    };
    trailing_comma_re().replace_all(&body, "${1}").into_owned()
}
