use std::collections::HashSet;

use tracing::debug;

use crate::ledger::{estimate_message_tokens, TokenLedger};
use crate::packer::PackedMessage;
use crate::types::{ContentBlock, Message};

/// Result of a pairing-repair pass over a packed context.
#[derive(Debug, Default)]
pub struct RepairOutcome {
    pub context: Vec<PackedMessage>,
    pub reclaimed_tokens: u32,
    pub dropped_orphan_count: usize,
    /// Messages removed by the repair, chronological.
    pub dropped_messages: Vec<(usize, Message)>,
}

fn tool_use_ids(message: &Message) -> Vec<&str> {
    let Some(ai) = message.as_ai() else {
        return Vec::new();
    };
    let mut ids: Vec<&str> = ai.tool_calls.iter().map(|tc| tc.id.as_str()).collect();
    for block in ai.content.blocks() {
        if let ContentBlock::ToolUse { id, .. } = block {
            ids.push(id.as_str());
        }
    }
    ids
}

fn tokens_for(ledger: &TokenLedger, pm: &PackedMessage) -> u32 {
    pm.index
        .and_then(|idx| ledger.get(idx))
        .unwrap_or_else(|| estimate_message_tokens(&pm.message))
}

/// Restore the tool-call ↔ tool-result pairing invariants after packing.
///
/// Tool results whose call was pruned are dropped; tool-use blocks whose
/// result was pruned are stripped (from content and from `tool_calls`); an
/// AI message left with nothing is dropped. Providers on both API families
/// reject unpaired halves, so this is the single choke point that guarantees
/// the output is well-formed.
pub fn repair_tool_pairing(context: Vec<PackedMessage>, ledger: &TokenLedger) -> RepairOutcome {
    let mut valid_call_ids: HashSet<String> = HashSet::new();
    let mut present_result_ids: HashSet<String> = HashSet::new();
    for pm in &context {
        for id in tool_use_ids(&pm.message) {
            valid_call_ids.insert(id.to_string());
        }
        if let Some(tool) = pm.message.as_tool() {
            present_result_ids.insert(tool.tool_call_id.clone());
        }
    }

    let mut outcome = RepairOutcome::default();
    for mut pm in context {
        if let Some(tool) = pm.message.as_tool() {
            if !valid_call_ids.contains(&tool.tool_call_id) {
                outcome.reclaimed_tokens += tokens_for(ledger, &pm);
                outcome.dropped_orphan_count += 1;
                if let Some(idx) = pm.index {
                    outcome.dropped_messages.push((idx, pm.message));
                }
                continue;
            }
            outcome.context.push(pm);
            continue;
        }

        let has_orphan_use = tool_use_ids(&pm.message)
            .iter()
            .any(|id| !present_result_ids.contains(*id));
        if !has_orphan_use {
            outcome.context.push(pm);
            continue;
        }

        let original_tokens = tokens_for(ledger, &pm);
        let Some(ai) = pm.message.as_ai_mut() else {
            outcome.context.push(pm);
            continue;
        };
        ai.tool_calls
            .retain(|tc| present_result_ids.contains(&tc.id));
        if let Some(blocks) = ai.content.blocks_mut() {
            blocks.retain(|block| match block {
                ContentBlock::ToolUse { id, .. } => present_result_ids.contains(id),
                _ => true,
            });
        }

        if ai.content.is_empty() && ai.tool_calls.is_empty() {
            outcome.reclaimed_tokens += original_tokens;
            outcome.dropped_orphan_count += 1;
            if let Some(idx) = pm.index {
                outcome.dropped_messages.push((idx, pm.message));
            }
            continue;
        }

        let stripped_tokens = estimate_message_tokens(&pm.message);
        outcome.reclaimed_tokens += original_tokens.saturating_sub(stripped_tokens);
        outcome.context.push(pm);
    }

    if outcome.dropped_orphan_count > 0 {
        debug!(
            dropped = outcome.dropped_orphan_count,
            reclaimed = outcome.reclaimed_tokens,
            "tool pairing repaired"
        );
    }
    outcome.dropped_messages.sort_by_key(|(idx, _)| *idx);
    outcome
}

/// Lighter pairing safety net run just before model dispatch, with no token
/// accounting. Fast path: a fully-paired list is returned untouched, no
/// clones. Additionally drops a trailing AI whose tool uses were stripped in
/// this pass — some providers require the conversation to end user-side.
pub fn sanitize_orphan_tool_blocks(messages: Vec<Message>) -> Vec<Message> {
    let mut call_ids: HashSet<String> = HashSet::new();
    let mut result_ids: HashSet<String> = HashSet::new();
    for message in &messages {
        for id in tool_use_ids(message) {
            call_ids.insert(id.to_string());
        }
        if let Some(tool) = message.as_tool() {
            result_ids.insert(tool.tool_call_id.clone());
        }
    }
    if call_ids == result_ids {
        return messages;
    }

    let last_index = messages.len().saturating_sub(1);

    let mut sanitized = Vec::with_capacity(messages.len());
    for (i, mut message) in messages.into_iter().enumerate() {
        if let Some(tool) = message.as_tool() {
            if !call_ids.contains(&tool.tool_call_id) {
                continue;
            }
            sanitized.push(message);
            continue;
        }

        let has_orphan_use = tool_use_ids(&message)
            .iter()
            .any(|id| !result_ids.contains(*id));
        if !has_orphan_use {
            sanitized.push(message);
            continue;
        }

        let Some(ai) = message.as_ai_mut() else {
            sanitized.push(message);
            continue;
        };
        ai.tool_calls.retain(|tc| result_ids.contains(&tc.id));
        if let Some(blocks) = ai.content.blocks_mut() {
            blocks.retain(|block| match block {
                ContentBlock::ToolUse { id, .. } => result_ids.contains(id),
                _ => true,
            });
        }

        // A stripped trailing AI is an incomplete exchange.
        if i == last_index {
            continue;
        }
        if ai.content.is_empty() && ai.tool_calls.is_empty() {
            continue;
        }
        sanitized.push(message);
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AiMessage, MessageContent, ToolCall};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn packed(entries: Vec<(usize, Message)>) -> Vec<PackedMessage> {
        entries
            .into_iter()
            .map(|(index, message)| PackedMessage {
                index: Some(index),
                message,
            })
            .collect()
    }

    fn ai_calling(ids: &[&str]) -> Message {
        Message::Ai(AiMessage {
            content: MessageContent::Blocks(
                std::iter::once(ContentBlock::text("working"))
                    .chain(
                        ids.iter()
                            .map(|id| ContentBlock::tool_use(*id, "read", json!({}))),
                    )
                    .collect(),
            ),
            tool_calls: ids
                .iter()
                .map(|id| ToolCall {
                    id: id.to_string(),
                    name: "read".into(),
                    args: json!({}),
                })
                .collect(),
            ..AiMessage::default()
        })
    }

    fn ledger(counts: &[(usize, u32)]) -> TokenLedger {
        TokenLedger::from_counts(counts.iter().copied().collect::<BTreeMap<_, _>>())
    }

    #[test]
    fn orphan_tool_result_dropped_and_reclaimed() {
        let context = packed(vec![
            (0, Message::system("sys")),
            (1, Message::tool("orphan", "stale result")),
            (2, ai_calling(&["valid"])),
            (3, Message::tool("valid", "fresh result")),
        ]);
        let ledger = ledger(&[(0, 10), (1, 40), (2, 15), (3, 15)]);

        let outcome = repair_tool_pairing(context, &ledger);

        assert_eq!(outcome.context.len(), 3);
        assert_eq!(outcome.dropped_orphan_count, 1);
        assert_eq!(outcome.reclaimed_tokens, 40);
        assert_eq!(outcome.dropped_messages.len(), 1);
        assert_eq!(outcome.dropped_messages[0].0, 1);
        assert!(outcome
            .context
            .iter()
            .all(|pm| pm.message.as_tool().map(|t| t.tool_call_id.as_str()) != Some("orphan")));
    }

    #[test]
    fn orphan_tool_use_stripped_from_ai() {
        let context = packed(vec![
            (0, ai_calling(&["kept", "dangling"])),
            (1, Message::tool("kept", "result")),
        ]);
        let ledger = ledger(&[(0, 80), (1, 10)]);

        let outcome = repair_tool_pairing(context, &ledger);

        assert_eq!(outcome.context.len(), 2);
        let ai = outcome.context[0].message.as_ai().unwrap();
        assert_eq!(ai.tool_calls.len(), 1);
        assert_eq!(ai.tool_calls[0].id, "kept");
        assert!(ai
            .content
            .blocks()
            .iter()
            .all(|b| !matches!(b, ContentBlock::ToolUse { id, .. } if id == "dangling")));
        assert!(outcome.reclaimed_tokens > 0);
    }

    #[test]
    fn emptied_ai_dropped_entirely() {
        let ai = Message::Ai(AiMessage {
            content: MessageContent::Blocks(vec![ContentBlock::tool_use(
                "gone",
                "read",
                json!({}),
            )]),
            tool_calls: vec![ToolCall {
                id: "gone".into(),
                name: "read".into(),
                args: json!({}),
            }],
            ..AiMessage::default()
        });
        let context = packed(vec![(0, Message::human("q")), (1, ai)]);
        let ledger = ledger(&[(0, 10), (1, 30)]);

        let outcome = repair_tool_pairing(context, &ledger);

        assert_eq!(outcome.context.len(), 1);
        assert!(outcome.context[0].message.is_human());
        assert_eq!(outcome.reclaimed_tokens, 30);
        assert_eq!(outcome.dropped_orphan_count, 1);
    }

    #[test]
    fn well_formed_context_untouched() {
        let context = packed(vec![
            (0, Message::human("q")),
            (1, ai_calling(&["c1"])),
            (2, Message::tool("c1", "result")),
            (3, Message::ai("done")),
        ]);
        let ledger = ledger(&[(0, 5), (1, 20), (2, 10), (3, 5)]);

        let outcome = repair_tool_pairing(context, &ledger);

        assert_eq!(outcome.context.len(), 4);
        assert_eq!(outcome.reclaimed_tokens, 0);
        assert_eq!(outcome.dropped_orphan_count, 0);
        assert!(outcome.dropped_messages.is_empty());
    }

    #[test]
    fn sanitize_fast_path_identity() {
        let messages = vec![
            Message::human("q"),
            ai_calling(&["c1"]),
            Message::tool("c1", "result"),
        ];
        let expected = messages.clone();
        assert_eq!(sanitize_orphan_tool_blocks(messages), expected);
    }

    #[test]
    fn sanitize_drops_stripped_trailing_ai() {
        // Trailing AI with one valid and one orphan tool use, the valid
        // result missing too — the whole exchange is incomplete.
        let messages = vec![Message::human("q"), ai_calling(&["x", "orphan"])];
        let sanitized = sanitize_orphan_tool_blocks(messages);
        assert_eq!(sanitized.len(), 1);
        assert!(sanitized[0].is_human());
    }

    #[test]
    fn sanitize_keeps_stripped_middle_ai_with_text() {
        let messages = vec![
            Message::human("q"),
            ai_calling(&["c1", "orphan"]),
            Message::tool("c1", "result"),
        ];
        let sanitized = sanitize_orphan_tool_blocks(messages);
        assert_eq!(sanitized.len(), 3);
        let ai = sanitized[1].as_ai().unwrap();
        assert_eq!(ai.tool_calls.len(), 1);
    }

    #[test]
    fn sanitize_drops_orphan_result() {
        let messages = vec![
            Message::human("q"),
            Message::tool("nobody-called-this", "result"),
            Message::ai("done"),
        ];
        let sanitized = sanitize_orphan_tool_blocks(messages);
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.iter().all(|m| !m.is_tool()));
    }
}
