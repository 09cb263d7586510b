//! Token usage observed in upstream response bodies.
//!
//! Buffered JSON responses carry an OpenAI `usage` object, usually as the last field. Bodies
//! over the observation limit keep only their tail, where that object is looked up. Event
//! streams may carry one on a late chunk (`stream_options.include_usage`); otherwise the
//! streamed delta text is counted and estimated.

use bytes::BytesMut;
use serde_json::Value;

use super::costing::estimate_tokens_from_len;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservedUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

pub fn extract_usage_from_json(body: &[u8]) -> Option<ObservedUsage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    usage_from_value(&value)
}

fn usage_from_value(value: &Value) -> Option<ObservedUsage> {
    usage_from_object(value.get("usage")?)
}

/// Finds the last `"usage": {...}` object in a window that may start mid-document.
fn extract_usage_from_tail(tail: &[u8]) -> Option<ObservedUsage> {
    const KEY: &[u8] = b"\"usage\"";
    let key_at = tail.windows(KEY.len()).rposition(|window| window == KEY)?;
    let after_key = &tail[key_at + KEY.len()..];
    let colon = after_key.iter().position(|byte| !byte.is_ascii_whitespace())?;
    if after_key[colon] != b':' {
        return None;
    }
    let value = serde_json::Deserializer::from_slice(&after_key[colon + 1..])
        .into_iter::<Value>()
        .next()?
        .ok()?;
    usage_from_object(&value)
}

fn usage_from_object(usage: &Value) -> Option<ObservedUsage> {
    let usage = usage.as_object()?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(ObservedUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn delta_text_len(value: &Value) -> usize {
    let Some(choices) = value.get("choices").and_then(Value::as_array) else {
        return 0;
    };
    choices
        .iter()
        .map(|choice| {
            let delta = choice
                .get("delta")
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
                .map(str::len)
                .unwrap_or(0);
            let text = choice
                .get("text")
                .and_then(Value::as_str)
                .map(str::len)
                .unwrap_or(0);
            delta + text
        })
        .sum()
}

#[derive(Debug)]
pub enum UsageObserver {
    Json {
        /// Whole body while it fits in `max_bytes`, then its last `max_bytes` bytes.
        buffer: BytesMut,
        max_bytes: usize,
        truncated: bool,
    },
    Sse {
        line: BytesMut,
        max_line_bytes: usize,
        usage: Option<ObservedUsage>,
        streamed_text_bytes: usize,
    },
}

impl UsageObserver {
    pub fn for_content_type(content_type: &str, max_bytes: usize) -> Self {
        if content_type
            .to_ascii_lowercase()
            .starts_with("text/event-stream")
        {
            Self::Sse {
                line: BytesMut::new(),
                max_line_bytes: max_bytes,
                usage: None,
                streamed_text_bytes: 0,
            }
        } else {
            Self::Json {
                buffer: BytesMut::new(),
                max_bytes,
                truncated: false,
            }
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        match self {
            Self::Json {
                buffer,
                max_bytes,
                truncated,
            } => {
                let max_bytes = (*max_bytes).max(1);
                let chunk = if chunk.len() > max_bytes {
                    buffer.clear();
                    *truncated = true;
                    &chunk[chunk.len() - max_bytes..]
                } else {
                    chunk
                };
                let overflow = (buffer.len() + chunk.len()).saturating_sub(max_bytes);
                if overflow > 0 {
                    *truncated = true;
                    let _ = buffer.split_to(overflow);
                }
                buffer.extend_from_slice(chunk);
            }
            Self::Sse {
                line,
                max_line_bytes,
                usage,
                streamed_text_bytes,
            } => {
                for &byte in chunk {
                    if byte == b'\n' {
                        scan_sse_line(line, usage, streamed_text_bytes);
                        line.clear();
                    } else if line.len() < *max_line_bytes {
                        line.extend_from_slice(&[byte]);
                    }
                }
            }
        }
    }

    /// Usage reported by the upstream, or `None` when nothing parseable was seen.
    pub fn finish(mut self) -> (Option<ObservedUsage>, u64) {
        match &mut self {
            Self::Json {
                buffer, truncated, ..
            } => {
                if *truncated {
                    return (extract_usage_from_tail(buffer), 0);
                }
                (extract_usage_from_json(buffer), 0)
            }
            Self::Sse {
                line,
                usage,
                streamed_text_bytes,
                ..
            } => {
                if !line.is_empty() {
                    scan_sse_line(line, usage, streamed_text_bytes);
                }
                (*usage, estimate_tokens_from_len(*streamed_text_bytes))
            }
        }
    }
}

fn scan_sse_line(line: &[u8], usage: &mut Option<ObservedUsage>, streamed: &mut usize) {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let Some(data) = line.strip_prefix(b"data:") else {
        return;
    };
    let data = data.strip_prefix(b" ").unwrap_or(data);
    if data == b"[DONE]" {
        return;
    }
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    if let Some(found) = usage_from_value(&value) {
        *usage = Some(found);
    }
    *streamed = streamed.saturating_add(delta_text_len(&value));
}
