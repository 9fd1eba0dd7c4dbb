use tracing::debug;

use crate::config::{SummarizationTrigger, TriggerKind};
use crate::types::{Message, SummaryBlock};

/// Runtime figures the trigger decision is evaluated against. Fields are
/// optional where the pipeline may not have been able to compute them —
/// a configured trigger with missing data is conservative and does not fire.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerInputs {
    pub max_context_tokens: u32,
    pub pre_prune_total_tokens: Option<u32>,
    pub remaining_context_tokens: Option<u32>,
    pub messages_to_refine_count: usize,
}

impl TriggerInputs {
    /// Effective remaining budget: prefer the pre-prune total (it reflects
    /// the true transcript weight), fall back to the packer's remainder.
    fn effective_remaining(&self) -> Option<u32> {
        if let Some(total) = self.pre_prune_total_tokens {
            return Some(self.max_context_tokens.saturating_sub(total));
        }
        self.remaining_context_tokens
    }
}

/// Decide whether the tail warrants invoking the summarization collaborator.
///
/// No trigger configured means "fire on any pruning". A configured trigger
/// whose value or runtime data is missing never fires — the condition cannot
/// be evaluated, so the cheap answer wins.
pub fn should_summarize(trigger: Option<&SummarizationTrigger>, inputs: &TriggerInputs) -> bool {
    if inputs.messages_to_refine_count == 0 {
        return false;
    }
    let Some(trigger) = trigger else {
        return true;
    };
    let Some(value) = trigger.value.filter(|v| v.is_finite()) else {
        return false;
    };

    let fire = match trigger.kind {
        TriggerKind::MessagesToRefine => inputs.messages_to_refine_count as f64 >= value,
        TriggerKind::TokenRatio => {
            if inputs.max_context_tokens == 0 {
                false
            } else {
                match inputs.effective_remaining() {
                    Some(remaining) => {
                        let used =
                            1.0 - remaining as f64 / inputs.max_context_tokens as f64;
                        used >= value
                    }
                    None => false,
                }
            }
        }
        TriggerKind::RemainingTokens => match inputs.effective_remaining() {
            Some(remaining) => (remaining as f64) <= value,
            None => false,
        },
        TriggerKind::Unknown => false,
    };
    debug!(?trigger.kind, fire, "summarization trigger evaluated");
    fire
}

// Prompt sent by the external summarization node. The summary replaces the
// refined tail in a fresh window, so it must stand alone.
const REFINEMENT_PROMPT: &str = "\
Condense the conversation excerpt below. The result replaces these messages \
in a continuing session, so keep every fact needed to carry on without them.

Cover, in order:
1. **Goal and progress** — what was requested, what is done
2. **Technical state** — files, data, decisions, tool outcomes that still matter
3. **Failures and fixes** — what broke and how it was resolved
4. **Outstanding work** — what comes next

Skip pleasantries and meta-commentary. Facts and decisions only.";

const CONTINUED_REFINEMENT_PROMPT: &str = "\
An earlier summary already covers the start of this session; it is included \
first below and must not be re-summarized. Condense only the messages that \
follow it:

1. New progress
2. New technical state
3. New failures and fixes
4. Updated next steps";

/// Build the prompt the external summarization node sends to its LLM.
/// `prior` is the summary from an earlier refinement round, if any.
pub fn build_refinement_prompt(
    messages_to_refine: &[Message],
    prior: Option<&SummaryBlock>,
) -> String {
    let transcript = messages_to_refine
        .iter()
        .map(|m| m.to_value().to_string())
        .collect::<Vec<_>>()
        .join("\n---\n");

    match prior {
        Some(summary) => format!(
            "{CONTINUED_REFINEMENT_PROMPT}\n\n---\nEarlier summary:\n{}\n\n---\nMessages to condense:\n{transcript}",
            summary.text
        ),
        None => format!("{REFINEMENT_PROMPT}\n\n---\nMessages to condense:\n{transcript}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn inputs(refine_count: usize) -> TriggerInputs {
        TriggerInputs {
            max_context_tokens: 1_000,
            pre_prune_total_tokens: Some(900),
            remaining_context_tokens: Some(100),
            messages_to_refine_count: refine_count,
        }
    }

    #[test]
    fn empty_tail_never_fires() {
        let triggers = [
            None,
            Some(SummarizationTrigger::messages_to_refine(1)),
            Some(SummarizationTrigger::token_ratio(0.0)),
            Some(SummarizationTrigger::remaining_tokens(u32::MAX)),
        ];
        for trigger in &triggers {
            assert!(!should_summarize(trigger.as_ref(), &inputs(0)));
        }
    }

    #[test]
    fn absent_trigger_fires_on_any_pruning() {
        assert!(should_summarize(None, &inputs(1)));
    }

    #[test]
    fn missing_value_never_fires() {
        let trigger = SummarizationTrigger {
            kind: TriggerKind::MessagesToRefine,
            value: None,
        };
        assert!(!should_summarize(Some(&trigger), &inputs(5)));

        let nan = SummarizationTrigger {
            kind: TriggerKind::TokenRatio,
            value: Some(f64::NAN),
        };
        assert!(!should_summarize(Some(&nan), &inputs(5)));
    }

    #[test]
    fn messages_to_refine_threshold() {
        let trigger = SummarizationTrigger::messages_to_refine(3);
        assert!(!should_summarize(Some(&trigger), &inputs(2)));
        assert!(should_summarize(Some(&trigger), &inputs(3)));
        assert!(should_summarize(Some(&trigger), &inputs(4)));
    }

    #[test]
    fn token_ratio_threshold() {
        // 900 of 1000 used → 0.9.
        let fires = SummarizationTrigger::token_ratio(0.85);
        assert!(should_summarize(Some(&fires), &inputs(1)));
        let holds = SummarizationTrigger::token_ratio(0.95);
        assert!(!should_summarize(Some(&holds), &inputs(1)));
    }

    #[test]
    fn token_ratio_prefers_pre_prune_total() {
        // Pre-prune total says 40% used; the packer remainder would say 90%.
        let inputs = TriggerInputs {
            max_context_tokens: 1_000,
            pre_prune_total_tokens: Some(400),
            remaining_context_tokens: Some(100),
            messages_to_refine_count: 1,
        };
        let trigger = SummarizationTrigger::token_ratio(0.5);
        assert!(!should_summarize(Some(&trigger), &inputs));
    }

    #[test]
    fn token_ratio_requires_data() {
        let inputs = TriggerInputs {
            max_context_tokens: 0,
            pre_prune_total_tokens: None,
            remaining_context_tokens: None,
            messages_to_refine_count: 1,
        };
        let trigger = SummarizationTrigger::token_ratio(0.1);
        assert!(!should_summarize(Some(&trigger), &inputs));
    }

    #[test]
    fn remaining_tokens_threshold() {
        // 1000 − 900 = 100 remaining.
        let fires = SummarizationTrigger::remaining_tokens(150);
        assert!(should_summarize(Some(&fires), &inputs(1)));
        let holds = SummarizationTrigger::remaining_tokens(50);
        assert!(!should_summarize(Some(&holds), &inputs(1)));
    }

    #[test]
    fn unknown_kind_never_fires() {
        let trigger = SummarizationTrigger {
            kind: TriggerKind::Unknown,
            value: Some(1.0),
        };
        assert!(!should_summarize(Some(&trigger), &inputs(10)));
    }

    #[test]
    fn prompt_includes_transcript() {
        let messages = vec![Message::human("find the bug"), Message::ai("found it")];
        let prompt = build_refinement_prompt(&messages, None);
        assert!(prompt.contains("find the bug"));
        assert!(prompt.contains("found it"));
        assert!(!prompt.contains("Earlier summary"));
    }

    #[test]
    fn prompt_carries_prior_summary() {
        let prior = SummaryBlock {
            text: "earlier work: fixed the parser".into(),
            token_count: 10,
            provider: "anthropic".into(),
            model: "claude".into(),
            created_at: Utc::now(),
        };
        let messages = vec![Message::human("now the tests")];
        let prompt = build_refinement_prompt(&messages, Some(&prior));
        assert!(prompt.contains("fixed the parser"));
        assert!(prompt.contains("must not be re-summarized"));
    }
}
