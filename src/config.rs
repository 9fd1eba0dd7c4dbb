use serde::{Deserialize, Serialize};

/// Soft-trim parameters: keep a head and a tail of the tool result, elide
/// the middle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftTrimConfig {
    pub head_chars: usize,
    pub tail_chars: usize,
    /// Only content longer than this is trimmed. Resolution raises it to at
    /// least `head_chars + tail_chars`.
    pub max_chars: usize,
}

impl Default for SoftTrimConfig {
    fn default() -> Self {
        Self {
            head_chars: 1_000,
            tail_chars: 500,
            max_chars: 2_000,
        }
    }
}

/// Hard-clear parameters: replace the whole tool result with a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardClearConfig {
    pub enabled: bool,
    pub placeholder: String,
}

impl Default for HardClearConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            placeholder: "[stale tool result removed]".into(),
        }
    }
}

/// Position-based degradation of stale tool results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPruningConfig {
    pub enabled: bool,
    /// Age ratio at or above which tool results are soft-trimmed. 0 = oldest
    /// first; values are clamped into [0, 1] on resolution.
    pub soft_trim_ratio: f64,
    /// Age ratio at or above which tool results are hard-cleared.
    pub hard_clear_ratio: f64,
    /// The most recent assistant turns are never degraded.
    pub keep_last_assistants: usize,
    pub soft_trim: SoftTrimConfig,
    pub hard_clear: HardClearConfig,
    /// Tool results shorter than this are never worth clearing.
    pub min_prunable_tool_chars: usize,
}

impl Default for ContextPruningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_trim_ratio: 0.3,
            hard_clear_ratio: 0.6,
            keep_last_assistants: 3,
            soft_trim: SoftTrimConfig::default(),
            hard_clear: HardClearConfig::default(),
            min_prunable_tool_chars: 200,
        }
    }
}

impl ContextPruningConfig {
    /// Merge caller-supplied values into a usable config: ratios clamped
    /// into [0, 1], `max_chars` raised to cover head + tail.
    pub fn resolve(mut self) -> Self {
        self.soft_trim_ratio = self.soft_trim_ratio.clamp(0.0, 1.0);
        self.hard_clear_ratio = self.hard_clear_ratio.clamp(0.0, 1.0);
        let floor = self.soft_trim.head_chars + self.soft_trim.tail_chars;
        if self.soft_trim.max_chars < floor {
            self.soft_trim.max_chars = floor;
        }
        self
    }
}

/// What condition fires the summarization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    MessagesToRefine,
    TokenRatio,
    RemainingTokens,
    /// A trigger type this version does not understand. Never fires.
    #[serde(other)]
    Unknown,
}

/// Configured summarization trigger. Absent configuration means "fire on any
/// pruning"; a configured trigger whose condition cannot be evaluated does
/// not fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizationTrigger {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub value: Option<f64>,
}

impl SummarizationTrigger {
    pub fn messages_to_refine(count: u32) -> Self {
        Self {
            kind: TriggerKind::MessagesToRefine,
            value: Some(count as f64),
        }
    }

    pub fn token_ratio(ratio: f64) -> Self {
        Self {
            kind: TriggerKind::TokenRatio,
            value: Some(ratio),
        }
    }

    pub fn remaining_tokens(tokens: u32) -> Self {
        Self {
            kind: TriggerKind::RemainingTokens,
            value: Some(tokens as f64),
        }
    }
}
