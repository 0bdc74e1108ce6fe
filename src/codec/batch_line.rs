//! JSONL framing of batch requests and responses.
//!
//! One request line per document:
//!
//! ```json
//! {"key":"<document key>","request":{"contents":[{"role":"user","parts":[
//!   {"text":"<prompt>"},{"inline_data":{"mime_type":"application/pdf","data":"<base64>"}}]}],
//!   "generationConfig":{"temperature":0.1,"maxOutputTokens":8192}}}
//! ```
//!
//! Output lines carry the same key with either a `response` or an `error`.
//! Inline jobs return the same records, with the key under `metadata`.

use base64::Engine;
use serde_json::{json, Value};

/// What the request asks the service to read.
#[derive(Debug, Clone, Copy)]
pub enum RequestContent<'a> {
    /// A PDF document, sent as base64 inline data.
    Pdf(&'a [u8]),
    /// Text only, e.g. an extraction to be validated.
    Text(&'a str),
}

/// Generation settings shared by every line of a job.
#[derive(Debug, Clone)]
pub struct RequestContext<'a> {
    pub prompt: &'a str,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Build the request object for one document.
pub fn encode_request(key: &str, content: RequestContent<'_>, ctx: &RequestContext<'_>) -> Value {
    let mut parts = vec![json!({ "text": ctx.prompt })];
    match content {
        RequestContent::Pdf(bytes) => parts.push(json!({
            "inline_data": {
                "mime_type": "application/pdf",
                "data": base64::engine::general_purpose::STANDARD.encode(bytes),
            }
        })),
        RequestContent::Text(text) => parts.push(json!({ "text": text })),
    }
    json!({
        "key": key,
        "request": {
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": ctx.temperature,
                "maxOutputTokens": ctx.max_tokens,
            }
        }
    })
}

/// Serialise a request object as one JSONL line, newline included.
pub fn to_line(request: &Value) -> String {
    let mut line = request.to_string();
    line.push('\n');
    line
}

/// Rewrap a file-style request for an inline job.
pub fn to_inline(request: &Value) -> Value {
    json!({
        "request": request.get("request").cloned().unwrap_or(Value::Null),
        "metadata": { "key": request.get("key").cloned().unwrap_or(Value::Null) },
    })
}

/// One decoded output record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRecord {
    pub key: Option<String>,
    /// Concatenated text parts of the first candidate.
    pub text: Option<String>,
    /// The candidate stopped at the output token limit.
    pub truncated: bool,
    pub error: Option<String>,
}

/// Decode one line of a JSONL output file.
pub fn decode_output_line(line: &str) -> Result<OutputRecord, serde_json::Error> {
    let value: Value = serde_json::from_str(line.trim())?;
    Ok(decode_record(&value))
}

/// Decode one output record, file or inline style.
pub fn decode_record(value: &Value) -> OutputRecord {
    let key = value
        .get("key")
        .or_else(|| value.pointer("/metadata/key"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return OutputRecord {
            key,
            error: Some(message),
            ..OutputRecord::default()
        };
    }

    let Some(response) = value.get("response") else {
        return OutputRecord {
            key,
            error: Some("record carries neither response nor error".to_string()),
            ..OutputRecord::default()
        };
    };

    let candidate = response.pointer("/candidates/0");
    let text: String = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
        .unwrap_or("");

    if text.is_empty() {
        let reason = response
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .map(|r| format!("prompt blocked: {r}"))
            .unwrap_or_else(|| format!("empty response (finishReason={finish_reason})"));
        return OutputRecord {
            key,
            error: Some(reason),
            ..OutputRecord::default()
        };
    }

    OutputRecord {
        key,
        text: Some(text),
        truncated: finish_reason == "MAX_TOKENS",
        error: None,
    }
}
