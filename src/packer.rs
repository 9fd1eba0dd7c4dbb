use tracing::debug;

use crate::error::ContextError;
use crate::ledger::{estimate_text_tokens, TokenLedger};
use crate::types::{ContentBlock, Message, MessageContent, ReasoningType, Role};

/// Tokens reserved for the assistant priming label the chat template adds.
pub const PRIMING_TOKENS: u32 = 3;

/// A packed message paired with its original transcript index. Synthetic
/// messages created during thinking reintegration have no index.
#[derive(Debug, Clone)]
pub struct PackedMessage {
    pub index: Option<usize>,
    pub message: Message,
}

pub struct PackParams<'a> {
    pub messages: &'a [Message],
    pub ledger: &'a TokenLedger,
    /// maxTokens minus the reserve.
    pub budget: u32,
    /// Charged against the budget when no leading System message carries the
    /// instructions.
    pub instruction_tokens: u32,
    pub start_types: Option<Vec<Role>>,
    pub thinking_enabled: bool,
    /// Carried from the previous turn: original index at or after which the
    /// latest reasoning block lives. Bounds the capture search.
    pub thinking_start_index: Option<usize>,
    pub reasoning_type: Option<ReasoningType>,
}

#[derive(Debug, Default)]
pub struct PackOutcome {
    /// Chronological packed context.
    pub context: Vec<PackedMessage>,
    /// Chronological messages that did not fit, by original index.
    pub pruned: Vec<(usize, Message)>,
    /// Budget left after packing.
    pub remaining: u32,
    /// Original transcript index of the reasoning block that survived.
    pub thinking_start_index: Option<usize>,
}

/// Pack messages newest-to-oldest into the budget.
///
/// The walk tracks the latest AI/Tool sequence so the reasoning block that
/// certain providers require on the newest assistant turn survives pruning;
/// if its carrier message is cut, the block is re-attached to the latest
/// surviving AI (with a budget-anchored second pass when the first
/// attachment would overflow).
pub fn pack_backward(params: &PackParams) -> Result<PackOutcome, ContextError> {
    let messages = params.messages;
    let n = messages.len();
    if n == 0 {
        return Ok(PackOutcome {
            remaining: params.budget,
            thinking_start_index: params.thinking_start_index,
            ..PackOutcome::default()
        });
    }

    let has_system = messages[0].is_system();
    let end_index = usize::from(has_system);
    let seed = if has_system {
        params.ledger.get(0).unwrap_or(0)
    } else {
        params.instruction_tokens
    };
    let budget_after_seed = params.budget as i64 - seed as i64;

    if budget_after_seed <= 0 {
        // Nothing can fit; the orchestrator's emergency path takes over.
        let pruned = (end_index..n).map(|i| (i, messages[i].clone())).collect();
        return Ok(PackOutcome {
            context: Vec::new(),
            pruned,
            remaining: 0,
            thinking_start_index: params.thinking_start_index,
        });
    }

    let mut current: i64 = PRIMING_TOKENS as i64;
    // Newest-first while packing; reversed before returning.
    let mut context_rev: Vec<(usize, Message)> = Vec::new();
    let mut pruned: Vec<(usize, Message)> = Vec::new();
    let mut thinking_end_index: Option<usize> = None;
    let mut thinking_block: Option<(usize, ContentBlock)> = None;
    let mut in_latest_sequence = true;
    let mut broke_at: Option<usize> = None;
    let search_floor = params.thinking_start_index.unwrap_or(0);

    let mut i = n;
    while i > end_index {
        i -= 1;
        let message = &messages[i];
        let in_assistant_turn = message.is_assistant_turn();

        if params.thinking_enabled && in_assistant_turn && thinking_end_index.is_none() {
            thinking_end_index = Some(i);
        }
        // False start: the message right before the candidate sequence end
        // is not part of an assistant turn. The end index resets; a block
        // captured already is kept.
        if let Some(te) = thinking_end_index {
            if i + 1 == te && !in_assistant_turn {
                thinking_end_index = None;
            }
        }

        let searching =
            params.thinking_enabled && in_latest_sequence && thinking_block.is_none();
        if searching && i >= search_floor {
            if let Some(ai) = message.as_ai() {
                if let Some(block) = ai
                    .content
                    .blocks()
                    .iter()
                    .find(|b| b.matches_reasoning(params.reasoning_type))
                {
                    thinking_block = Some((i, block.clone()));
                }
            }
        }
        if !in_assistant_turn {
            in_latest_sequence = false;
        }

        let tokens = params.ledger.get(i).unwrap_or(0) as i64;
        if current + tokens <= budget_after_seed {
            context_rev.push((i, message.clone()));
            current += tokens;
        } else {
            pruned.push((i, message.clone()));
            let still_searching =
                params.thinking_enabled && in_latest_sequence && thinking_block.is_none();
            if still_searching {
                continue;
            }
            broke_at = Some(i);
            break;
        }
    }

    let mut remaining = (budget_after_seed - current).max(0) as u32;

    // A tool result must not start the context some providers see.
    // Source quirk: the check reads the newest element of the
    // not-yet-reversed context.
    let mut start_types = params.start_types.clone();
    if context_rev.first().is_some_and(|(_, m)| m.is_tool()) {
        start_types = Some(vec![Role::Ai, Role::Human]);
    }

    // Type trim: drop from the chronological head until it matches.
    let mut trim_casualties: Vec<(usize, Message)> = Vec::new();
    if let Some(types) = &start_types {
        while context_rev
            .last()
            .is_some_and(|(_, oldest)| !types.contains(&oldest.role()))
        {
            if let Some((idx, message)) = context_rev.pop() {
                remaining += params.ledger.get(idx).unwrap_or(0);
                trim_casualties.push((idx, message));
            }
        }
    }

    // Chronological order from here on.
    let mut context: Vec<PackedMessage> = context_rev
        .into_iter()
        .rev()
        .map(|(index, message)| PackedMessage {
            index: Some(index),
            message,
        })
        .collect();

    if let Some(b) = broke_at {
        for idx in end_index..b {
            pruned.push((idx, messages[idx].clone()));
        }
    }
    pruned.extend(trim_casualties);
    pruned.sort_by_key(|(idx, _)| *idx);

    // The transcript index of the captured block is carried to the next
    // turn even when reattachment is not needed (or the false-start reset
    // cleared the sequence end) — the original message still owns it.
    let mut out_thinking_start = params.thinking_start_index;
    if let Some((block_idx, _)) = thinking_block {
        out_thinking_start = Some(block_idx);
    }
    if let Some(te) = thinking_end_index {
        match thinking_block {
            Some((block_idx, ref block)) => {
                let in_context = context
                    .iter()
                    .any(|pm| pm.index == Some(block_idx));
                if !in_context {
                    reattach_thinking(
                        params,
                        &mut context,
                        &mut pruned,
                        &mut remaining,
                        block,
                        has_system,
                        seed,
                    );
                }
            }
            None => {
                // The carried start index promised a reasoning block inside
                // the walked sequence. If none is present in the packed
                // context either, the payload is malformed.
                let promised = params
                    .thinking_start_index
                    .is_some_and(|ts| ts <= te);
                let present_in_context = context.iter().any(|pm| {
                    pm.message
                        .content()
                        .blocks()
                        .iter()
                        .any(|b| b.matches_reasoning(params.reasoning_type))
                });
                if params.reasoning_type.is_some() && promised && !present_in_context {
                    return Err(ContextError::MalformedThinkingPayload(format!(
                        "thinking sequence ends at index {te} but no reasoning block found \
                         at or after index {search_floor}"
                    )));
                }
            }
        }
    }

    if has_system {
        context.insert(
            0,
            PackedMessage {
                index: Some(0),
                message: messages[0].clone(),
            },
        );
    }

    debug!(
        packed = context.len(),
        pruned = pruned.len(),
        remaining,
        "backward pack complete"
    );
    Ok(PackOutcome {
        context,
        pruned,
        remaining,
        thinking_start_index: out_thinking_start,
    })
}

fn block_tokens(block: &ContentBlock) -> u32 {
    estimate_text_tokens(&block.to_value().to_string())
}

/// Prepend a reasoning block to an AI message's content.
fn prepend_block(message: &mut Message, block: &ContentBlock) {
    let Some(ai) = message.as_ai_mut() else {
        return;
    };
    let mut blocks = vec![block.clone()];
    match &ai.content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                blocks.push(ContentBlock::text(text.clone()));
            }
        }
        MessageContent::Blocks(existing) => blocks.extend(existing.iter().cloned()),
    }
    ai.content = MessageContent::Blocks(blocks);
}

/// Attach a reasoning block whose carrier was pruned. First try the latest
/// surviving AI; when that would overflow, re-walk with the budget anchored
/// around the block. With no surviving AI the block is dropped silently —
/// the orchestrator's recovery handles the rest.
#[allow(clippy::too_many_arguments)]
fn reattach_thinking(
    params: &PackParams,
    context: &mut Vec<PackedMessage>,
    pruned: &mut Vec<(usize, Message)>,
    remaining: &mut u32,
    block: &ContentBlock,
    has_system: bool,
    seed: u32,
) {
    let Some(latest_ai) = context.iter().rposition(|pm| pm.message.is_ai()) else {
        debug!("no surviving AI message, reasoning block dropped");
        return;
    };
    let needed = block_tokens(block);
    if needed <= *remaining {
        prepend_block(&mut context[latest_ai].message, block);
        *remaining -= needed;
        return;
    }

    // Second pass: anchor the budget around the reasoning block and re-walk.
    let messages = params.messages;
    let n = messages.len();
    let end_index = usize::from(has_system);
    let anchored = params.budget as i64 - seed as i64 - needed as i64;
    let mut current: i64 = PRIMING_TOKENS as i64;
    let mut context_rev: Vec<(usize, Message)> = Vec::new();
    for i in (end_index..n).rev() {
        let tokens = params.ledger.get(i).unwrap_or(0) as i64;
        if current + tokens > anchored {
            break;
        }
        context_rev.push((i, messages[i].clone()));
        current += tokens;
    }

    let mut start_types = params.start_types.clone();
    if context_rev.first().is_some_and(|(_, m)| m.is_tool()) {
        start_types = Some(vec![Role::Ai, Role::Human]);
    }
    if let Some(types) = &start_types {
        while let Some((_, oldest)) = context_rev.last() {
            if types.contains(&oldest.role()) {
                break;
            }
            context_rev.pop();
        }
    }

    let mut repacked: Vec<PackedMessage> = context_rev
        .into_iter()
        .rev()
        .map(|(index, message)| PackedMessage {
            index: Some(index),
            message,
        })
        .collect();

    if let Some(oldest_ai) = repacked.iter().position(|pm| pm.message.is_ai()) {
        prepend_block(&mut repacked[oldest_ai].message, block);
    } else {
        repacked.insert(
            0,
            PackedMessage {
                index: None,
                message: Message::ai(MessageContent::Blocks(vec![block.clone()])),
            },
        );
    }

    let packed_tokens: i64 = repacked
        .iter()
        .filter_map(|pm| pm.index)
        .map(|idx| params.ledger.get(idx).unwrap_or(0) as i64)
        .sum();
    *remaining = (anchored - PRIMING_TOKENS as i64 - packed_tokens).max(0) as u32;

    // Everything not in the repacked context is pruned.
    pruned.clear();
    for idx in end_index..n {
        if !repacked.iter().any(|pm| pm.index == Some(idx)) {
            pruned.push((idx, messages[idx].clone()));
        }
    }
    *context = repacked;
    debug!("reasoning block reattached via second pass");
}
