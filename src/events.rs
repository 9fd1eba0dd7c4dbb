use tracing::{debug, error, info, warn};

/// Stream event names surfaced to external observers by the agent graph.
/// The pipeline itself only emits [`ContextEvent`]s; these constants exist so
/// collaborators and the pipeline agree on spelling.
pub const SUMMARIZE_START: &str = "summarize_start";
pub const SUMMARIZE_COMPLETE: &str = "summarize_complete";
pub const RUN_STEP: &str = "run_step";
pub const RUN_STEP_DELTA: &str = "run_step_delta";
pub const RUN_STEP_COMPLETED: &str = "run_step_completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Diagnostic events emitted once per decision point in a prune pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    /// Budget arithmetic for this pass.
    Budget {
        max_tokens: u32,
        reserve_tokens: u32,
        pruning_budget: u32,
        instruction_tokens: u32,
        effective_max: u32,
        message_count: usize,
        total_tokens: u32,
    },
    /// Pre-flight capping counters.
    PreFlight {
        tool_results_truncated: usize,
        tool_inputs_truncated: usize,
    },
    /// Position-based degradation counters.
    Degraded {
        soft_trimmed: usize,
        hard_cleared: usize,
    },
    CalibrationApplied {
        ratio: f64,
    },
    CalibrationReverted {
        ratio: f64,
    },
    /// The packer produced an empty context; the emergency path is about to
    /// run.
    EmergencyStart {
        message_count: usize,
        effective_max: u32,
    },
    EmergencyComplete {
        context_len: usize,
        refine_len: usize,
    },
    /// The emergency path still produced nothing usable.
    BudgetExhausted {
        effective_max: u32,
    },
    /// Outcome of the summarization trigger for this pass.
    SummarizeDecision {
        fire: bool,
        messages_to_refine: usize,
    },
}

impl ContextEvent {
    pub fn level(&self) -> LogLevel {
        match self {
            ContextEvent::Budget { .. }
            | ContextEvent::PreFlight { .. }
            | ContextEvent::Degraded { .. }
            | ContextEvent::CalibrationApplied { .. }
            | ContextEvent::CalibrationReverted { .. }
            | ContextEvent::SummarizeDecision { .. } => LogLevel::Debug,
            ContextEvent::EmergencyStart { .. } => LogLevel::Warn,
            ContextEvent::EmergencyComplete { .. } => LogLevel::Info,
            ContextEvent::BudgetExhausted { .. } => LogLevel::Warn,
        }
    }
}

/// Callback through which the orchestrator reports [`ContextEvent`]s.
pub type EventSink = Box<dyn Fn(&ContextEvent) + Send + Sync>;

/// Forward an event to `tracing` at its level. The orchestrator calls this
/// for every event, sink or no sink.
pub fn trace_event(event: &ContextEvent) {
    match event.level() {
        LogLevel::Debug => debug!(?event, "context event"),
        LogLevel::Info => info!(?event, "context event"),
        LogLevel::Warn => warn!(?event, "context event"),
        LogLevel::Error => error!(?event, "context event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_events_escalate() {
        let start = ContextEvent::EmergencyStart {
            message_count: 4,
            effective_max: 100,
        };
        assert_eq!(start.level(), LogLevel::Warn);

        let done = ContextEvent::EmergencyComplete {
            context_len: 2,
            refine_len: 2,
        };
        assert_eq!(done.level(), LogLevel::Info);
    }

    #[test]
    fn budget_is_debug() {
        let event = ContextEvent::Budget {
            max_tokens: 100,
            reserve_tokens: 5,
            pruning_budget: 95,
            instruction_tokens: 10,
            effective_max: 85,
            message_count: 3,
            total_tokens: 50,
        };
        assert_eq!(event.level(), LogLevel::Debug);
    }
}
