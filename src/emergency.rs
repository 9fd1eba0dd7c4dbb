use serde_json::json;
use tracing::{debug, info};

use crate::ledger::{TokenCounter, TokenLedger};
use crate::packer::{pack_backward, PackParams, PackedMessage};
use crate::preflight::truncate_head_tail;
use crate::repair::repair_tool_pairing;
use crate::types::{ContentBlock, Message, MessageContent, ReasoningType, Role};
use crate::error::ContextError;

/// Per-message character budget: proportional to the effective token budget,
/// floored so no message goes blank.
pub fn emergency_max_chars(effective_max: u32, message_count: usize) -> usize {
    ((effective_max as usize / message_count.max(1)) * 4).max(200)
}

pub struct EmergencyRequest<'a> {
    pub messages: &'a [Message],
    /// maxTokens minus the reserve, as for the normal pack.
    pub budget: u32,
    pub instruction_tokens: u32,
    pub effective_max: u32,
    pub start_types: Option<Vec<Role>>,
    pub thinking_enabled: bool,
    pub thinking_start_index: Option<usize>,
    pub reasoning_type: Option<ReasoningType>,
}

#[derive(Debug, Default)]
pub struct EmergencyOutcome {
    pub context: Vec<PackedMessage>,
    /// Messages that still did not make it, chronological.
    pub refine: Vec<(usize, Message)>,
    pub remaining: u32,
    pub thinking_start_index: Option<usize>,
}

/// One-shot recovery when the packer came back empty: clone the transcript,
/// truncate every oversized tool payload to the per-message budget, re-pack
/// and re-repair the clone.
///
/// The ledger is snapshotted up front and restored at the end — the original
/// messages stay intact in graph state, so the next turn must count them at
/// their true size (it may have more budget available).
pub fn run_emergency(
    request: &EmergencyRequest,
    ledger: &mut TokenLedger,
    counter: &dyn TokenCounter,
) -> Result<EmergencyOutcome, ContextError> {
    let message_count = request.messages.len();
    let max_chars = emergency_max_chars(request.effective_max, message_count);
    info!(
        message_count,
        max_chars, "emergency truncation engaged"
    );

    let snapshot = ledger.snapshot();
    let mut cloned: Vec<Message> = request.messages.to_vec();
    for (index, message) in cloned.iter_mut().enumerate() {
        if truncate_message(message, max_chars) {
            ledger.recount(index, message, counter);
        }
    }

    let pack = pack_backward(&PackParams {
        messages: &cloned,
        ledger,
        budget: request.budget,
        instruction_tokens: request.instruction_tokens,
        start_types: request.start_types.clone(),
        thinking_enabled: request.thinking_enabled,
        thinking_start_index: request.thinking_start_index,
        reasoning_type: request.reasoning_type,
    });
    let pack = match pack {
        Ok(pack) => pack,
        Err(err) => {
            ledger.restore(snapshot);
            return Err(err);
        }
    };
    let repair = repair_tool_pairing(pack.context, ledger);
    ledger.restore(snapshot);

    let mut refine = pack.pruned;
    refine.extend(repair.dropped_messages);
    refine.sort_by_key(|(idx, _)| *idx);

    debug!(
        context_len = repair.context.len(),
        refine_len = refine.len(),
        "emergency truncation complete"
    );
    Ok(EmergencyOutcome {
        context: repair.context,
        refine,
        remaining: pack.remaining.saturating_add(repair.reclaimed_tokens),
        thinking_start_index: pack.thinking_start_index,
    })
}

/// Truncate one cloned message's oversized tool payloads. Returns whether
/// anything changed.
fn truncate_message(message: &mut Message, max_chars: usize) -> bool {
    let mut changed = false;
    match message {
        Message::Tool(tool) => {
            if let MessageContent::Text(text) = &tool.content {
                if text.chars().count() > max_chars {
                    let head = max_chars / 2;
                    let tail = max_chars - head;
                    tool.content =
                        MessageContent::Text(truncate_head_tail(text, head, tail));
                    changed = true;
                }
            }
        }
        Message::Ai(ai) => {
            if let Some(blocks) = ai.content.blocks_mut() {
                for block in blocks.iter_mut() {
                    let ContentBlock::ToolUse { input, .. } = block else {
                        continue;
                    };
                    let serialized = input.to_string();
                    if serialized.chars().count() > max_chars {
                        *input = json!({
                            "_truncated": truncate_head_tail(&serialized, max_chars / 2, max_chars / 2),
                            "_originalChars": serialized.chars().count(),
                        });
                        changed = true;
                    }
                }
            }
            for call in ai.tool_calls.iter_mut() {
                let serialized = call.args.to_string();
                if serialized.chars().count() > max_chars {
                    call.args = json!({
                        "_truncated": truncate_head_tail(&serialized, max_chars / 2, max_chars / 2),
                        "_originalChars": serialized.chars().count(),
                    });
                    changed = true;
                }
            }
        }
        _ => {}
    }
    changed
}
