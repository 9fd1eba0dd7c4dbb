#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// A thinking end index was established but the reasoning payload it
    /// promises cannot be located. Caller contract violation; the turn is
    /// terminated rather than repaired.
    #[error("malformed thinking payload: {0}")]
    MalformedThinkingPayload(String),
    #[error("state store error: {0}")]
    State(String),
}
