use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{Message, UsageMetadata};

/// Counts tokens for a single message. The real counter is supplied by the
/// caller (it knows the provider's tokenizer); [`HeuristicCounter`] is the
/// shipped fallback.
pub trait TokenCounter: Send + Sync {
    fn count(&self, message: &Message) -> u32;
}

impl<F> TokenCounter for F
where
    F: Fn(&Message) -> u32 + Send + Sync,
{
    fn count(&self, message: &Message) -> u32 {
        self(message)
    }
}

/// Estimate token count from serialized length. Chars/4 — good enough for
/// trend detection, and calibration grounds it against provider totals.
pub fn estimate_message_tokens(message: &Message) -> u32 {
    (message.to_value().to_string().len() as u32) / 4
}

pub fn estimate_text_tokens(text: &str) -> u32 {
    (text.len() as u32) / 4
}

/// The chars/4 counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, message: &Message) -> u32 {
        estimate_message_tokens(message)
    }
}

// Calibration guard rails. A ratio outside the gate means the usage snapshot
// does not describe these messages (accumulated usage, cache-read inflation).
const CALIBRATION_RATIO_MIN: f64 = 1.0 / 3.0;
const CALIBRATION_RATIO_MAX: f64 = 2.5;
const SANITY_RATIO_MIN: f64 = 0.25;
const SANITY_RATIO_MAX: f64 = 3.0;

/// Maps original message index → estimated token count. Entries for pruned
/// messages persist across turns, keyed by the index the message had when it
/// entered the transcript.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    counts: BTreeMap<usize, u32>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a caller-held map (e.g. a restored session).
    pub fn from_counts(counts: BTreeMap<usize, u32>) -> Self {
        Self { counts }
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        self.counts.get(&index).copied()
    }

    pub fn insert(&mut self, index: usize, tokens: u32) {
        self.counts.insert(index, tokens);
    }

    pub fn counts(&self) -> &BTreeMap<usize, u32> {
        &self.counts
    }

    /// Fill in counts for every index from `turn_start` on that has none.
    /// The first uncounted index of a turn is the provider's just-emitted
    /// output; its reported `output_tokens` is authoritative over any local
    /// estimate.
    pub fn ensure_counted(
        &mut self,
        messages: &[Message],
        turn_start: usize,
        usage: Option<&UsageMetadata>,
        counter: &dyn TokenCounter,
    ) {
        let mut first_new = true;
        for (index, message) in messages.iter().enumerate().skip(turn_start) {
            if self.counts.contains_key(&index) {
                continue;
            }
            let from_usage = if first_new {
                usage.and_then(|u| u.output_tokens).map(|t| t as u32)
            } else {
                None
            };
            first_new = false;
            let tokens = from_usage.unwrap_or_else(|| counter.count(message));
            self.counts.insert(index, tokens);
        }
    }

    /// Replace one entry after a message mutation.
    pub fn recount(&mut self, index: usize, message: &Message, counter: &dyn TokenCounter) {
        self.counts.insert(index, counter.count(message));
    }

    /// Sum of entries for indices in `[start, end)`.
    pub fn total(&self, start: usize, end: usize) -> u64 {
        self.counts
            .range(start..end)
            .map(|(_, &tokens)| tokens as u64)
            .sum()
    }

    /// Sum of the live window: indices from `last_cutoff` on, plus the
    /// leading System message when the cutoff has moved past it.
    pub fn live_total(&self, messages: &[Message], last_cutoff: usize) -> u64 {
        let mut total = self.total(last_cutoff, messages.len());
        if last_cutoff > 0 && messages.first().is_some_and(Message::is_system) {
            total += self.get(0).unwrap_or(0) as u64;
        }
        total
    }

    pub fn snapshot(&self) -> BTreeMap<usize, u32> {
        self.counts.clone()
    }

    pub fn restore(&mut self, snapshot: BTreeMap<usize, u32>) {
        self.counts = snapshot;
    }

    /// Scale entries so their sum matches the provider-reported total for
    /// the just-completed call. Returns the applied ratio, or `None` when
    /// the counts were left unchanged.
    ///
    /// The usage must be fresh (the caller guards this) and must carry at
    /// least one input-side figure. The scaling is gated: a raw ratio
    /// outside [1/3, 2.5] is rejected outright, and a post-scale sum that
    /// lands outside [1/4, 3] of the raw sum reverts from a snapshot.
    pub fn calibrate(
        &mut self,
        messages: &[Message],
        last_cutoff: usize,
        usage: &UsageMetadata,
    ) -> Option<f64> {
        if !usage.has_input_side() {
            return None;
        }
        // The reported usage covers everything up to and including the last
        // AI output; tool results recorded after it are not part of it.
        let last_ai = messages.iter().rposition(Message::is_ai)?;
        if last_ai < last_cutoff {
            return None;
        }

        let mut indices: Vec<usize> = (last_cutoff..=last_ai).collect();
        if last_cutoff > 0 && messages.first().is_some_and(Message::is_system) {
            indices.insert(0, 0);
        }

        let raw_sum: u64 = indices
            .iter()
            .filter_map(|&i| self.get(i))
            .map(|t| t as u64)
            .sum();
        if raw_sum == 0 {
            return None;
        }

        let calibration_total = usage.grounded_total();
        let ratio = calibration_total as f64 / raw_sum as f64;
        if !(CALIBRATION_RATIO_MIN..=CALIBRATION_RATIO_MAX).contains(&ratio) {
            debug!(ratio, raw_sum, calibration_total, "calibration ratio out of bounds, skipping");
            return None;
        }

        let snapshot = self.snapshot();
        for &index in &indices {
            if let Some(tokens) = self.counts.get_mut(&index) {
                *tokens = ((*tokens as f64) * ratio).round() as u32;
            }
        }

        let calibrated_sum: u64 = indices
            .iter()
            .filter_map(|&i| self.get(i))
            .map(|t| t as u64)
            .sum();
        let sanity = calibrated_sum as f64 / raw_sum as f64;
        if !(SANITY_RATIO_MIN..=SANITY_RATIO_MAX).contains(&sanity) {
            debug!(sanity, "calibrated counts failed sanity check, reverting");
            self.restore(snapshot);
            return None;
        }

        debug!(ratio, raw_sum, calibrated_sum, "token counts calibrated");
        Some(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn char_counter() -> impl TokenCounter {
        |message: &Message| message.content().as_text().map(|s| s.len() as u32).unwrap_or(1)
    }

    fn transcript() -> Vec<Message> {
        vec![
            Message::ai("aaaaaaaaaa"),       // 10
            Message::ai("aaaaaaaaaaaaaaaaaaaa"), // 20
            Message::ai("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"), // 30
        ]
    }

    #[test]
    fn ensure_counted_fills_missing() {
        let messages = transcript();
        let mut ledger = TokenLedger::new();
        ledger.ensure_counted(&messages, 0, None, &char_counter());
        assert_eq!(ledger.get(0), Some(10));
        assert_eq!(ledger.get(1), Some(20));
        assert_eq!(ledger.get(2), Some(30));
    }

    #[test]
    fn ensure_counted_prefers_output_tokens_for_first_new() {
        let messages = transcript();
        let mut ledger = TokenLedger::new();
        ledger.insert(0, 10);
        let usage = UsageMetadata {
            output_tokens: Some(99),
            ..Default::default()
        };
        ledger.ensure_counted(&messages, 0, Some(&usage), &char_counter());
        // Index 1 is the first uncounted index — takes the reported output.
        assert_eq!(ledger.get(1), Some(99));
        // Index 2 falls back to the counter.
        assert_eq!(ledger.get(2), Some(30));
    }

    #[test]
    fn ensure_counted_never_overwrites() {
        let messages = transcript();
        let mut ledger = TokenLedger::new();
        ledger.insert(1, 7);
        ledger.ensure_counted(&messages, 0, None, &char_counter());
        assert_eq!(ledger.get(1), Some(7));
    }

    #[test]
    fn calibrate_scales_in_gate() {
        let messages = transcript();
        let mut ledger = TokenLedger::new();
        ledger.insert(0, 10);
        ledger.insert(1, 20);
        ledger.insert(2, 30);
        let usage = UsageMetadata {
            input_tokens: Some(40),
            output_tokens: Some(50),
            ..Default::default()
        };
        // total = 90, raw = 60, ratio = 1.5 — inside the gate.
        assert!(ledger.calibrate(&messages, 0, &usage).is_some());
        assert_eq!(ledger.get(0), Some(15));
        assert_eq!(ledger.get(1), Some(30));
        assert_eq!(ledger.get(2), Some(45));
    }

    #[test]
    fn calibrate_rejects_out_of_gate_ratio() {
        let messages = transcript();
        let mut ledger = TokenLedger::new();
        ledger.insert(0, 10);
        ledger.insert(1, 20);
        ledger.insert(2, 30);
        let usage = UsageMetadata {
            input_tokens: Some(10),
            total_tokens: Some(10),
            ..Default::default()
        };
        // ratio = 10/60 < 1/3 — left unchanged.
        assert!(ledger.calibrate(&messages, 0, &usage).is_none());
        assert_eq!(ledger.get(0), Some(10));
        assert_eq!(ledger.get(1), Some(20));
        assert_eq!(ledger.get(2), Some(30));
    }

    #[test]
    fn calibrate_requires_input_side() {
        let messages = transcript();
        let mut ledger = TokenLedger::new();
        ledger.insert(0, 10);
        let usage = UsageMetadata {
            output_tokens: Some(500),
            ..Default::default()
        };
        assert!(ledger.calibrate(&messages, 0, &usage).is_none());
    }

    #[test]
    fn calibrate_excludes_trailing_tool_results() {
        let messages = vec![
            Message::human("question"),
            Message::ai("calling a tool"),
            Message::tool("c1", "result arriving after the call"),
        ];
        let mut ledger = TokenLedger::new();
        ledger.insert(0, 20);
        ledger.insert(1, 20);
        ledger.insert(2, 1_000);
        let usage = UsageMetadata {
            input_tokens: Some(30),
            output_tokens: Some(30),
            ..Default::default()
        };
        // raw = 40 (tool result at index 2 excluded), ratio = 1.5.
        assert!(ledger.calibrate(&messages, 0, &usage).is_some());
        assert_eq!(ledger.get(0), Some(30));
        assert_eq!(ledger.get(1), Some(30));
        assert_eq!(ledger.get(2), Some(1_000));
    }

    #[test]
    fn calibrate_includes_leading_system_past_cutoff() {
        let messages = vec![
            Message::system("instructions"),
            Message::human("old"),
            Message::human("new"),
            Message::ai("answer"),
        ];
        let mut ledger = TokenLedger::new();
        ledger.insert(0, 10);
        ledger.insert(1, 10);
        ledger.insert(2, 10);
        ledger.insert(3, 10);
        let usage = UsageMetadata {
            input_tokens: Some(45),
            ..Default::default()
        };
        // Cutoff at 2: raw = system(10) + idx 2..=3 (20) = 30, ratio = 1.5.
        assert!(ledger.calibrate(&messages, 2, &usage).is_some());
        assert_eq!(ledger.get(0), Some(15));
        assert_eq!(ledger.get(1), Some(10)); // below cutoff, untouched
        assert_eq!(ledger.get(2), Some(15));
    }

    #[test]
    fn live_total_counts_system_once() {
        let messages = vec![
            Message::system("sys"),
            Message::human("a"),
            Message::human("b"),
        ];
        let mut ledger = TokenLedger::new();
        ledger.insert(0, 5);
        ledger.insert(1, 10);
        ledger.insert(2, 15);
        assert_eq!(ledger.live_total(&messages, 0), 30);
        assert_eq!(ledger.live_total(&messages, 2), 20);
    }

    #[test]
    fn recount_replaces_entry() {
        let messages = transcript();
        let mut ledger = TokenLedger::new();
        ledger.ensure_counted(&messages, 0, None, &char_counter());
        let shorter = Message::ai("aa");
        ledger.recount(2, &shorter, &char_counter());
        assert_eq!(ledger.get(2), Some(2));
    }
}
