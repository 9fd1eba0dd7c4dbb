pub mod config;
pub mod degrade;
pub mod emergency;
pub mod error;
pub mod events;
pub mod ledger;
pub mod packer;
pub mod preflight;
pub mod refine;
pub mod repair;
pub mod session;
pub mod types;

use serde_json::Value;
use tracing::{debug, warn};

pub use config::{
    ContextPruningConfig, HardClearConfig, SoftTrimConfig, SummarizationTrigger, TriggerKind,
};
pub use degrade::DegradeOutcome;
pub use error::ContextError;
pub use events::{ContextEvent, EventSink, LogLevel};
pub use ledger::{
    estimate_message_tokens, estimate_text_tokens, HeuristicCounter, TokenCounter, TokenLedger,
};
pub use refine::{build_refinement_prompt, should_summarize, TriggerInputs};
pub use repair::sanitize_orphan_tool_blocks;
pub use session::{FileStateStore, NoStateStore, PrunerState, StateStore};
pub use types::{
    AiMessage, ContentBlock, HumanMessage, Message, MessageContent, Provider, ReasoningType, Role,
    SummaryBlock, SystemMessage, ToolCall, ToolMessage, UsageMetadata,
};

use degrade::degrade_stale_tool_results;
use emergency::{run_emergency, EmergencyRequest};
use packer::{pack_backward, PackParams, PackedMessage};
use preflight::{truncate_tool_call_inputs, truncate_tool_results};
use repair::repair_tool_pairing;

type InstructionTokensFn = Box<dyn Fn() -> u32 + Send + Sync>;
type SetSummaryFn = Box<dyn Fn(&SummaryBlock) + Send + Sync>;

/// Per-invocation inputs to [`ContextPruner::prune`].
#[derive(Default)]
pub struct PruneOptions {
    /// Usage for the just-emitted AI message; its `output_tokens` is
    /// authoritative for that message's ledger entry.
    pub usage_metadata: Option<UsageMetadata>,
    /// Roles the compacted context may start with (after the optional
    /// leading System message).
    pub start_types: Option<Vec<Role>>,
    /// Usage of the last completed call, for calibration.
    pub last_call_usage: Option<UsageMetadata>,
    /// Whether `last_call_usage` describes the call that just finished.
    /// Stale usage must not ground calibration.
    pub usage_is_fresh: bool,
}

/// What a prune pass hands back to the agent graph.
#[derive(Debug)]
pub struct PruneResult {
    /// The compacted context for the next model call.
    pub context: Vec<Message>,
    /// Messages that fell out of the window, oldest first — candidate input
    /// for the summarization collaborator.
    pub messages_to_refine: Vec<Message>,
    pub pre_prune_total_tokens: u32,
    pub remaining_context_tokens: u32,
    pub thinking_start_index: Option<usize>,
    /// Whether the configured trigger says the tail warrants summarizing.
    pub should_summarize: bool,
}

/// The conversation context manager. One per agent; owns the token ledger
/// and the turn state that must survive between calls.
///
/// Built with `ContextPruner::new(max_tokens)` plus `with_*` methods, then
/// driven once per agent turn via [`prune`](Self::prune), between tool
/// execution and the next model call.
pub struct ContextPruner {
    max_tokens: u32,
    reserve_ratio: f64,
    provider: Option<Provider>,
    thinking_enabled: bool,
    pruning: ContextPruningConfig,
    trigger: Option<SummarizationTrigger>,
    counter: Box<dyn TokenCounter>,
    instruction_tokens: InstructionTokensFn,
    event_sink: Option<EventSink>,
    set_summary: Option<SetSummaryFn>,
    active_summary: Option<SummaryBlock>,

    // Turn state, carried across prune calls.
    last_cutoff_index: usize,
    last_turn_start_index: usize,
    run_thinking_start_index: Option<usize>,
    total_tokens: u32,
    ledger: TokenLedger,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl ContextPruner {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            reserve_ratio: 0.05,
            provider: None,
            thinking_enabled: false,
            pruning: ContextPruningConfig::default(),
            trigger: None,
            counter: Box::new(HeuristicCounter),
            instruction_tokens: Box::new(|| 0),
            event_sink: None,
            set_summary: None,
            active_summary: None,
            last_cutoff_index: 0,
            last_turn_start_index: 0,
            run_thinking_start_index: None,
            total_tokens: 0,
            ledger: TokenLedger::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_reserve_ratio(mut self, ratio: f64) -> Self {
        self.reserve_ratio = ratio.clamp(0.0, 0.999);
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_thinking(mut self, enabled: bool) -> Self {
        self.thinking_enabled = enabled;
        self
    }

    pub fn with_pruning_config(mut self, config: ContextPruningConfig) -> Self {
        self.pruning = config.resolve();
        self
    }

    pub fn with_summarization_trigger(mut self, trigger: SummarizationTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_token_counter(mut self, counter: impl TokenCounter + 'static) -> Self {
        self.counter = Box::new(counter);
        self
    }

    /// Provider of instruction tokens: system prompt + tool schemas + active
    /// summary, prepended later by an external builder.
    pub fn with_instruction_tokens(
        mut self,
        provider: impl Fn() -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.instruction_tokens = Box::new(provider);
        self
    }

    pub fn with_event_sink(
        mut self,
        sink: impl Fn(&ContextEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_sink = Some(Box::new(sink));
        self
    }

    /// Hook invoked when a produced summary is applied, so the caller can
    /// attach it to the next turn's system context.
    pub fn with_set_summary(
        mut self,
        hook: impl Fn(&SummaryBlock) + Send + Sync + 'static,
    ) -> Self {
        self.set_summary = Some(Box::new(hook));
        self
    }

    /// Where counting begins; messages before this index predate this
    /// manager and their counts come from the seeded ledger
    /// ([`with_token_counts`](Self::with_token_counts)).
    pub fn with_start_index(mut self, index: usize) -> Self {
        self.last_turn_start_index = index;
        self
    }

    /// Seed the ledger with caller-held counts.
    pub fn with_token_counts(mut self, counts: std::collections::BTreeMap<usize, u32>) -> Self {
        self.ledger = TokenLedger::from_counts(counts);
        self
    }

    pub fn index_token_counts(&self) -> &std::collections::BTreeMap<usize, u32> {
        self.ledger.counts()
    }

    pub fn active_summary(&self) -> Option<&SummaryBlock> {
        self.active_summary.as_ref()
    }

    /// Accept a summary produced by the external summarization node and
    /// notify the caller's hook.
    pub fn apply_summary(&mut self, summary: SummaryBlock) {
        if let Some(hook) = &self.set_summary {
            hook(&summary);
        }
        self.active_summary = Some(summary);
    }

    fn emit(&self, event: ContextEvent) {
        events::trace_event(&event);
        if let Some(sink) = &self.event_sink {
            sink(&event);
        }
    }

    /// Compact the transcript for the next model call.
    ///
    /// Mutates `messages` in place on the normal path (degradation and
    /// pre-flight truncation); the emergency path operates on a clone and
    /// leaves the originals intact.
    pub fn prune(
        &mut self,
        messages: &mut Vec<Message>,
        options: PruneOptions,
    ) -> Result<PruneResult, ContextError> {
        if messages.is_empty() {
            return Ok(PruneResult {
                context: Vec::new(),
                messages_to_refine: Vec::new(),
                pre_prune_total_tokens: 0,
                remaining_context_tokens: self.max_tokens,
                thinking_start_index: self.run_thinking_start_index,
                should_summarize: false,
            });
        }

        // OpenAI-family reasoning arrives as kwargs side-channels; hoist it
        // into content blocks so the packer can see and preserve it.
        let reasoning_type = match self.provider {
            Some(provider) if self.thinking_enabled => {
                if provider.hoists_reasoning_kwargs() {
                    hoist_reasoning_kwargs(messages);
                    Some(ReasoningType::Thinking)
                } else {
                    provider.reasoning_type()
                }
            }
            _ => None,
        };

        self.ledger.ensure_counted(
            messages,
            self.last_turn_start_index,
            options.usage_metadata.as_ref(),
            self.counter.as_ref(),
        );
        if options.usage_is_fresh {
            if let Some(usage) = &options.last_call_usage {
                match self
                    .ledger
                    .calibrate(messages, self.last_cutoff_index, usage)
                {
                    Some(ratio) => self.emit(ContextEvent::CalibrationApplied { ratio }),
                    None => debug!("calibration not applied"),
                }
            }
        }

        let reserve_tokens = (self.max_tokens as f64 * self.reserve_ratio).round() as u32;
        let pruning_budget = self.max_tokens.saturating_sub(reserve_tokens);
        let instruction_tokens = (self.instruction_tokens)();
        let effective_max = pruning_budget.saturating_sub(instruction_tokens);

        let tool_results_truncated = truncate_tool_results(
            messages,
            &mut self.ledger,
            self.max_tokens,
            self.counter.as_ref(),
        );
        let tool_inputs_truncated = truncate_tool_call_inputs(
            messages,
            &mut self.ledger,
            self.max_tokens,
            self.counter.as_ref(),
        );
        if tool_results_truncated > 0 || tool_inputs_truncated > 0 {
            self.emit(ContextEvent::PreFlight {
                tool_results_truncated,
                tool_inputs_truncated,
            });
        }

        let degraded = degrade_stale_tool_results(
            messages,
            &mut self.ledger,
            &self.pruning,
            self.counter.as_ref(),
        );
        if degraded.soft_trimmed > 0 || degraded.hard_cleared > 0 {
            self.emit(ContextEvent::Degraded {
                soft_trimmed: degraded.soft_trimmed,
                hard_cleared: degraded.hard_cleared,
            });
        }

        let pre_prune_total_tokens =
            self.ledger.live_total(messages, self.last_cutoff_index) as u32;
        self.emit(ContextEvent::Budget {
            max_tokens: self.max_tokens,
            reserve_tokens,
            pruning_budget,
            instruction_tokens,
            effective_max,
            message_count: messages.len(),
            total_tokens: pre_prune_total_tokens,
        });

        // Fast path: the whole transcript still fits and nothing has ever
        // been cut — hand it back untouched.
        if self.last_cutoff_index == 0
            && pre_prune_total_tokens as u64 + instruction_tokens as u64 <= pruning_budget as u64
        {
            self.last_turn_start_index = messages.len();
            self.total_tokens = pre_prune_total_tokens;
            return Ok(PruneResult {
                context: messages.clone(),
                messages_to_refine: Vec::new(),
                pre_prune_total_tokens,
                remaining_context_tokens: pruning_budget
                    .saturating_sub(pre_prune_total_tokens + instruction_tokens),
                thinking_start_index: self.run_thinking_start_index,
                should_summarize: false,
            });
        }

        let pack = pack_backward(&PackParams {
            messages,
            ledger: &self.ledger,
            budget: pruning_budget,
            instruction_tokens,
            start_types: options.start_types.clone(),
            thinking_enabled: self.thinking_enabled,
            thinking_start_index: self.run_thinking_start_index,
            reasoning_type,
        })?;
        let pack_remaining = pack.remaining;
        let mut thinking_start_index = pack.thinking_start_index;
        let mut refine_pairs = pack.pruned;
        let repair = repair_tool_pairing(pack.context, &self.ledger);
        let mut context = repair.context;
        let mut remaining_context_tokens =
            pack_remaining.saturating_add(repair.reclaimed_tokens);
        refine_pairs.extend(repair.dropped_messages);
        refine_pairs.sort_by_key(|(idx, _)| *idx);

        if context.is_empty() && effective_max > 0 {
            self.emit(ContextEvent::EmergencyStart {
                message_count: messages.len(),
                effective_max,
            });
            let outcome = run_emergency(
                &EmergencyRequest {
                    messages,
                    budget: pruning_budget,
                    instruction_tokens,
                    effective_max,
                    start_types: options.start_types.clone(),
                    thinking_enabled: self.thinking_enabled,
                    thinking_start_index: self.run_thinking_start_index,
                    reasoning_type,
                },
                &mut self.ledger,
                self.counter.as_ref(),
            )?;
            context = outcome.context;
            refine_pairs = outcome.refine;
            remaining_context_tokens = outcome.remaining;
            thinking_start_index = outcome.thinking_start_index;
            self.emit(ContextEvent::EmergencyComplete {
                context_len: context.len(),
                refine_len: refine_pairs.len(),
            });
            if context.is_empty() {
                warn!("emergency truncation could not salvage a context");
                self.emit(ContextEvent::BudgetExhausted { effective_max });
            }
        }

        let remaining_context_tokens = remaining_context_tokens.min(pruning_budget);

        // Carry turn state forward.
        self.last_cutoff_index = context
            .iter()
            .filter_map(|pm| pm.index)
            .find(|&idx| idx > 0 || !messages[0].is_system())
            .unwrap_or(messages.len());
        self.last_turn_start_index = messages.len();
        self.run_thinking_start_index = thinking_start_index;
        self.total_tokens = pre_prune_total_tokens;

        let messages_to_refine: Vec<Message> =
            refine_pairs.into_iter().map(|(_, m)| m).collect();
        let should_summarize = should_summarize(
            self.trigger.as_ref(),
            &TriggerInputs {
                max_context_tokens: self.max_tokens,
                pre_prune_total_tokens: Some(pre_prune_total_tokens),
                remaining_context_tokens: Some(remaining_context_tokens),
                messages_to_refine_count: messages_to_refine.len(),
            },
        );
        self.emit(ContextEvent::SummarizeDecision {
            fire: should_summarize,
            messages_to_refine: messages_to_refine.len(),
        });

        Ok(PruneResult {
            context: context.into_iter().map(|pm: PackedMessage| pm.message).collect(),
            messages_to_refine,
            pre_prune_total_tokens,
            remaining_context_tokens,
            thinking_start_index,
            should_summarize,
        })
    }

    /// Snapshot the turn state for persistence.
    pub fn state(&self) -> PrunerState {
        PrunerState {
            last_cutoff_index: self.last_cutoff_index,
            last_turn_start_index: self.last_turn_start_index,
            run_thinking_start_index: self.run_thinking_start_index,
            total_tokens: self.total_tokens,
            index_token_counts: self.ledger.snapshot(),
            created_at: self.created_at,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Restore turn state from a checkpoint.
    pub fn restore_state(&mut self, state: &PrunerState) {
        self.last_cutoff_index = state.last_cutoff_index;
        self.last_turn_start_index = state.last_turn_start_index;
        self.run_thinking_start_index = state.run_thinking_start_index;
        self.total_tokens = state.total_tokens;
        self.ledger = TokenLedger::from_counts(state.index_token_counts.clone());
        self.created_at = state.created_at;
    }
}

/// Hoist `additional_kwargs.reasoning_content` (plus the trailing
/// `thinking_blocks` signature) into a leading Thinking block on AI messages
/// that carry tool calls, then clear the side-channel.
fn hoist_reasoning_kwargs(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        let Some(ai) = message.as_ai_mut() else {
            continue;
        };
        let carries_tool_calls = !ai.tool_calls.is_empty()
            || ai.content.blocks().iter().any(ContentBlock::is_tool_use);
        if !carries_tool_calls {
            continue;
        }
        let Some(reasoning) = ai
            .additional_kwargs
            .get("reasoning_content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
        else {
            continue;
        };
        let signature = ai
            .additional_kwargs
            .get("thinking_blocks")
            .and_then(Value::as_array)
            .and_then(|blocks| blocks.last())
            .and_then(|b| b.get("signature"))
            .and_then(Value::as_str)
            .map(String::from);

        let block = ContentBlock::Thinking {
            thinking: reasoning,
            signature,
        };
        let mut blocks = vec![block];
        match &ai.content {
            MessageContent::Text(text) => {
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text.clone()));
                }
            }
            MessageContent::Blocks(existing) => blocks.extend(existing.iter().cloned()),
        }
        ai.content = MessageContent::Blocks(blocks);
        ai.additional_kwargs.remove("reasoning_content");
    }
}
