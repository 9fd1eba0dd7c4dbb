use tracing::debug;

use crate::config::ContextPruningConfig;
use crate::ledger::{TokenCounter, TokenLedger};
use crate::types::{Message, MessageContent};

/// Counters returned by a degradation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DegradeOutcome {
    pub soft_trimmed: usize,
    pub hard_cleared: usize,
}

/// Relative age of index `i` in a list of length `n`: 0 = latest, 1 = oldest.
pub fn age_ratio(index: usize, len: usize) -> f64 {
    if len == 0 {
        return 0.0;
    }
    (len - index) as f64 / len as f64
}

/// First index of the protected tail: the last `keep_last_assistants`
/// assistant turns (maximal contiguous AI+Tool runs, counted from the end)
/// plus any Human messages between them.
fn protected_tail_start(messages: &[Message], keep_last_assistants: usize) -> usize {
    let mut start = messages.len();
    let mut runs = 0usize;
    let mut in_run = false;
    for i in (0..messages.len()).rev() {
        if messages[i].is_assistant_turn() {
            if !in_run {
                runs += 1;
                if runs > keep_last_assistants {
                    break;
                }
            }
            in_run = true;
        } else {
            in_run = false;
        }
        start = i;
    }
    start
}

/// Degrade stale tool results in place: hard-clear the oldest, soft-trim the
/// middle-aged, leave the protected tail alone. Each mutation recounts its
/// ledger entry.
pub fn degrade_stale_tool_results(
    messages: &mut [Message],
    ledger: &mut TokenLedger,
    config: &ContextPruningConfig,
    counter: &dyn TokenCounter,
) -> DegradeOutcome {
    let mut outcome = DegradeOutcome::default();
    if !config.enabled || messages.is_empty() {
        return outcome;
    }

    let len = messages.len();
    let tail_start = protected_tail_start(messages, config.keep_last_assistants);
    let first_human = messages.iter().position(Message::is_human);

    for i in 0..len {
        // Protected zone: leading System, everything before the first Human,
        // the recent-assistant tail, image-bearing messages.
        if i == 0 && messages[i].is_system() {
            continue;
        }
        if first_human.is_none_or(|h| i < h) {
            continue;
        }
        if i >= tail_start {
            continue;
        }
        if messages[i].content().has_image() {
            continue;
        }
        if !messages[i].is_tool() {
            continue;
        }

        let text_len = messages[i].content().text_len();
        if text_len == 0 {
            continue;
        }
        let age = age_ratio(i, len);

        if age >= config.hard_clear_ratio
            && config.hard_clear.enabled
            && text_len >= config.min_prunable_tool_chars
        {
            *messages[i].content_mut() = MessageContent::Text(config.hard_clear.placeholder.clone());
            ledger.recount(i, &messages[i], counter);
            outcome.hard_cleared += 1;
        } else if age >= config.soft_trim_ratio && text_len > config.soft_trim.max_chars {
            let text = match messages[i].content().as_text() {
                Some(t) => t,
                None => continue,
            };
            let trimmed = soft_trim(text, config.soft_trim.head_chars, config.soft_trim.tail_chars);
            *messages[i].content_mut() = MessageContent::Text(trimmed);
            ledger.recount(i, &messages[i], counter);
            outcome.soft_trimmed += 1;
        }
    }

    if outcome.soft_trimmed > 0 || outcome.hard_cleared > 0 {
        debug!(
            soft_trimmed = outcome.soft_trimmed,
            hard_cleared = outcome.hard_cleared,
            "stale tool results degraded"
        );
    }
    outcome
}

/// Keep `head` and `tail` chars with a marker reporting what was elided.
fn soft_trim(text: &str, head: usize, tail: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= head + tail {
        return text.to_string();
    }
    let elided = chars.len() - head - tail;
    let head_str: String = chars[..head].iter().collect();
    let tail_str: String = chars[chars.len() - tail..].iter().collect();
    format!("{head_str}\n[... {elided} chars elided ...]\n{tail_str}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HardClearConfig, SoftTrimConfig};
    use crate::ledger::HeuristicCounter;
    use crate::types::ContentBlock;
    use serde_json::json;

    fn config() -> ContextPruningConfig {
        ContextPruningConfig {
            enabled: true,
            soft_trim_ratio: 0.3,
            hard_clear_ratio: 0.6,
            keep_last_assistants: 1,
            soft_trim: SoftTrimConfig {
                head_chars: 20,
                tail_chars: 10,
                max_chars: 40,
            },
            hard_clear: HardClearConfig {
                enabled: true,
                placeholder: "[cleared]".into(),
            },
            min_prunable_tool_chars: 10,
        }
    }

    /// Several Human → AI → Tool rounds, newest round last. Each round is
    /// its own assistant turn (the Human breaks the AI/Tool run).
    fn transcript(rounds: usize, result_len: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        for i in 0..rounds {
            messages.push(Message::human(format!("task {i}")));
            messages.push(Message::ai(format!("calling {i}")));
            messages.push(Message::tool(format!("c{i}"), "x".repeat(result_len)));
        }
        messages
    }

    fn ledger_for(messages: &[Message]) -> TokenLedger {
        let mut ledger = TokenLedger::new();
        ledger.ensure_counted(messages, 0, None, &HeuristicCounter);
        ledger
    }

    #[test]
    fn age_ratio_monotone_decreasing() {
        for i in 0..9 {
            assert!(age_ratio(i, 10) > age_ratio(i + 1, 10));
        }
        assert_eq!(age_ratio(0, 10), 1.0);
    }

    #[test]
    fn oldest_results_hard_cleared() {
        let mut messages = transcript(5, 100);
        let mut ledger = ledger_for(&messages);
        let before = ledger.get(2).unwrap();

        let outcome =
            degrade_stale_tool_results(&mut messages, &mut ledger, &config(), &HeuristicCounter);

        assert!(outcome.hard_cleared >= 1);
        // The oldest tool result (index 2) is now the placeholder.
        assert_eq!(messages[2].content().as_text(), Some("[cleared]"));
        assert!(ledger.get(2).unwrap() < before, "recount should shrink");
    }

    #[test]
    fn recent_tail_untouched() {
        let mut messages = transcript(5, 100);
        let mut ledger = ledger_for(&messages);
        let newest_tool = messages.len() - 1;
        let original = messages[newest_tool].clone();

        degrade_stale_tool_results(&mut messages, &mut ledger, &config(), &HeuristicCounter);

        assert_eq!(messages[newest_tool], original);
    }

    #[test]
    fn middle_aged_results_soft_trimmed() {
        let mut messages = transcript(6, 200);
        let mut ledger = ledger_for(&messages);
        let cfg = ContextPruningConfig {
            hard_clear: HardClearConfig {
                enabled: false,
                ..HardClearConfig::default()
            },
            ..config()
        };

        let outcome =
            degrade_stale_tool_results(&mut messages, &mut ledger, &cfg, &HeuristicCounter);

        assert!(outcome.soft_trimmed >= 1);
        assert_eq!(outcome.hard_cleared, 0);
        let trimmed = messages[2].content().as_text().unwrap();
        assert!(trimmed.contains("chars elided"), "got: {trimmed}");
        assert!(trimmed.starts_with("xxxxx"));
        assert!(trimmed.ends_with("xxxxx"));
    }

    #[test]
    fn short_results_never_cleared() {
        let mut messages = transcript(5, 5);
        let mut ledger = ledger_for(&messages);

        let outcome =
            degrade_stale_tool_results(&mut messages, &mut ledger, &config(), &HeuristicCounter);

        assert_eq!(outcome, DegradeOutcome::default());
    }

    #[test]
    fn image_messages_protected() {
        let mut messages = transcript(5, 100);
        messages[2] = Message::Tool(crate::types::ToolMessage {
            id: None,
            content: MessageContent::Blocks(vec![ContentBlock::from_value(
                &json!({ "type": "image", "source": {} }),
            )]),
            tool_call_id: "c0".into(),
            name: None,
            status: None,
        });
        let mut ledger = ledger_for(&messages);
        let original = messages[2].clone();

        degrade_stale_tool_results(&mut messages, &mut ledger, &config(), &HeuristicCounter);

        assert_eq!(messages[2], original);
    }

    #[test]
    fn prefix_before_first_human_protected() {
        let mut messages = vec![
            Message::system("sys"),
            Message::tool("warmup", "y".repeat(300)),
            Message::human("task"),
        ];
        for i in 0..4 {
            messages.push(Message::ai(format!("a{i}")));
            messages.push(Message::tool(format!("c{i}"), "x".repeat(300)));
        }
        let mut ledger = ledger_for(&messages);
        let original = messages[1].clone();

        degrade_stale_tool_results(&mut messages, &mut ledger, &config(), &HeuristicCounter);

        assert_eq!(messages[1], original);
    }

    #[test]
    fn disabled_config_is_noop() {
        let mut messages = transcript(5, 100);
        let mut ledger = ledger_for(&messages);
        let cfg = ContextPruningConfig {
            enabled: false,
            ..config()
        };
        let snapshot = messages.clone();

        let outcome =
            degrade_stale_tool_results(&mut messages, &mut ledger, &cfg, &HeuristicCounter);

        assert_eq!(outcome, DegradeOutcome::default());
        assert_eq!(messages, snapshot);
    }
}
