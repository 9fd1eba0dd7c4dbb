use serde_json::{json, Value};
use tracing::debug;

use crate::ledger::{TokenCounter, TokenLedger};
use crate::types::{ContentBlock, Message, MessageContent};

// Thresholds are fractions of the raw context size, in chars/token units.
const TOOL_RESULT_FRACTION: f64 = 0.30;
const TOOL_INPUT_FRACTION: f64 = 0.15;
const CHARS_PER_TOKEN: usize = 4;
const TOOL_INPUT_CHAR_CAP: usize = 200_000;

/// Largest tool-result string allowed through to the packer.
pub fn max_tool_result_chars(max_context_tokens: u32) -> usize {
    ((max_context_tokens as f64 * TOOL_RESULT_FRACTION) as usize) * CHARS_PER_TOKEN
}

/// Largest serialized tool-call input allowed through to the packer.
pub fn max_tool_input_chars(max_context_tokens: u32) -> usize {
    let scaled = ((max_context_tokens as f64 * TOOL_INPUT_FRACTION).floor() as usize) * CHARS_PER_TOKEN;
    scaled.min(TOOL_INPUT_CHAR_CAP)
}

/// Keep `head` and `tail` chars of `text` with a marker reporting the
/// elision. Char-boundary safe.
pub fn truncate_head_tail(text: &str, head: usize, tail: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= head + tail {
        return text.to_string();
    }
    let elided = chars.len() - head - tail;
    let head_str: String = chars[..head].iter().collect();
    let tail_str: String = chars[chars.len() - tail..].iter().collect();
    format!("{head_str}\n[... {elided} chars truncated ...]\n{tail_str}")
}

/// Keep only the head of `text`, with a marker.
fn truncate_head(text: &str, head: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= head {
        return text.to_string();
    }
    let elided = chars.len() - head;
    let head_str: String = chars[..head].iter().collect();
    format!("{head_str}\n[... {elided} chars truncated ...]")
}

/// Cap every oversized tool-result string before packing. A single payload
/// larger than the whole budget would otherwise defeat the packer. Returns
/// the number of messages truncated.
pub fn truncate_tool_results(
    messages: &mut [Message],
    ledger: &mut TokenLedger,
    max_context_tokens: u32,
    counter: &dyn TokenCounter,
) -> usize {
    let limit = max_tool_result_chars(max_context_tokens);
    if limit == 0 {
        return 0;
    }
    let mut truncated = 0usize;
    for (index, message) in messages.iter_mut().enumerate() {
        if !message.is_tool() {
            continue;
        }
        let Some(text) = message.content().as_text() else {
            continue;
        };
        if text.chars().count() <= limit {
            continue;
        }
        let replacement = truncate_head_tail(text, limit / 2, limit / 2);
        *message.content_mut() = MessageContent::Text(replacement);
        ledger.recount(index, message, counter);
        truncated += 1;
    }
    if truncated > 0 {
        debug!(truncated, limit, "oversized tool results capped");
    }
    truncated
}

/// Replace an oversized serialized input with a stub recording the head and
/// the original size.
fn truncated_input_stub(serialized: &str, limit: usize) -> Value {
    json!({
        "_truncated": truncate_head(serialized, limit),
        "_originalChars": serialized.chars().count(),
    })
}

/// Cap every oversized tool-use input before packing, mirroring the
/// truncation onto the message's `tool_calls` args. Returns the number of
/// inputs truncated.
pub fn truncate_tool_call_inputs(
    messages: &mut [Message],
    ledger: &mut TokenLedger,
    max_context_tokens: u32,
    counter: &dyn TokenCounter,
) -> usize {
    let limit = max_tool_input_chars(max_context_tokens);
    if limit == 0 {
        return 0;
    }
    let mut truncated = 0usize;
    for (index, message) in messages.iter_mut().enumerate() {
        let Some(ai) = message.as_ai_mut() else {
            continue;
        };
        let mut changed = false;
        let mut touched_ids: Vec<String> = Vec::new();
        if let Some(blocks) = ai.content.blocks_mut() {
            for block in blocks.iter_mut() {
                let ContentBlock::ToolUse { id, input, .. } = block else {
                    continue;
                };
                let serialized = input.to_string();
                if serialized.chars().count() <= limit {
                    continue;
                }
                *input = truncated_input_stub(&serialized, limit);
                touched_ids.push(id.clone());
                truncated += 1;
                changed = true;
            }
        }
        // Mirror onto tool_calls so both representations stay in step.
        for call in ai.tool_calls.iter_mut() {
            let serialized = call.args.to_string();
            if touched_ids.contains(&call.id) {
                call.args = truncated_input_stub(&serialized, limit);
            } else if serialized.chars().count() > limit {
                call.args = truncated_input_stub(&serialized, limit);
                truncated += 1;
                changed = true;
            }
        }
        if changed {
            ledger.recount(index, message, counter);
        }
    }
    if truncated > 0 {
        debug!(truncated, limit, "oversized tool inputs capped");
    }
    truncated
}
