use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Everything a pruner needs to resume an agent at the exact same spot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrunerState {
    pub last_cutoff_index: usize,
    pub last_turn_start_index: usize,
    pub run_thinking_start_index: Option<usize>,
    pub total_tokens: u32,
    pub index_token_counts: BTreeMap<usize, u32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Persists pruner state so a conversation can stop and resume without
/// recounting or re-pruning from scratch.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Save a checkpoint for an agent.
    async fn checkpoint(&self, agent_id: &str, state: &PrunerState) -> Result<(), ContextError>;

    /// Load the most recent checkpoint for an agent.
    async fn load(&self, agent_id: &str) -> Result<Option<PrunerState>, ContextError>;
}

// --- NoStateStore ---

/// No persistence. Fire-and-forget.
pub struct NoStateStore;

#[async_trait]
impl StateStore for NoStateStore {
    async fn checkpoint(&self, _: &str, _: &PrunerState) -> Result<(), ContextError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<PrunerState>, ContextError> {
        Ok(None)
    }
}

// --- FileStateStore ---

/// Saves pruner state to disk as JSON, one file per agent.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn checkpoint(&self, agent_id: &str, state: &PrunerState) -> Result<(), ContextError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ContextError::State(e.to_string()))?;
        let path = self.dir.join(format!("{agent_id}.json"));
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ContextError::State(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| ContextError::State(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, agent_id: &str) -> Result<Option<PrunerState>, ContextError> {
        let path = self.dir.join(format!("{agent_id}.json"));
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let state: PrunerState = serde_json::from_str(&json)
                    .map_err(|e| ContextError::State(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ContextError::State(e.to_string())),
        }
    }
}
