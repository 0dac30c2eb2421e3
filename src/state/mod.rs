//! Authoritative `{activeAgents, paused}` snapshot with atomic disk
//! persistence.
//!
//! 🔒 CONCURRENCY DESIGN: single async mutex guards the in-memory
//! snapshot; every mutation triggers a save, and saves are coalesced
//! so at most one write is in flight at a time, with a follow-up save
//! queued if a mutation lands mid-write.

use crate::models::{AgentState, OrchestrationState};
use crate::{ConductorError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct StateManager {
    path: PathBuf,
    state: Arc<Mutex<OrchestrationState>>,
    saving: Arc<AtomicBool>,
    save_pending: Arc<AtomicBool>,
}

impl StateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(OrchestrationState::default())),
            saving: Arc::new(AtomicBool::new(false)),
            save_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load from disk. A missing file yields a fresh empty state; an
    /// unparseable file is a fatal error so a corrupted snapshot never
    /// silently resets the orchestrator to empty.
    pub async fn load(&self) -> Result<()> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let loaded: OrchestrationState = serde_json::from_str(&contents).map_err(|e| {
                    ConductorError::SystemState {
                        message: format!(
                            "state file at {:?} is not valid JSON: {e}",
                            self.path
                        ),
                    }
                })?;
                info!(
                    active_agents = loaded.active_agents.len(),
                    paused = loaded.paused,
                    "loaded orchestration state"
                );
                *self.state.lock().await = loaded;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "no existing state file, starting fresh");
                Ok(())
            }
            Err(e) => Err(ConductorError::Io(e)),
        }
    }

    pub async fn reset(&self) {
        *self.state.lock().await = OrchestrationState::default();
    }

    pub async fn add_agent(&self, agent: AgentState) {
        {
            let mut state = self.state.lock().await;
            state.active_agents.insert(agent.session_id.clone(), agent);
        }
        self.save().await;
    }

    pub async fn remove_agent(&self, session_id: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            state.active_agents.remove(session_id).is_some()
        };
        if removed {
            self.save().await;
        }
    }

    pub async fn update_agent(
        &self,
        session_id: &str,
        patch: impl FnOnce(&mut AgentState),
    ) -> bool {
        let updated = {
            let mut state = self.state.lock().await;
            match state.active_agents.get_mut(session_id) {
                Some(agent) => {
                    patch(agent);
                    true
                }
                None => {
                    warn!(%session_id, "update_agent called for unknown session");
                    false
                }
            }
        };
        if updated {
            self.save().await;
        }
        updated
    }

    pub async fn set_paused(&self, paused: bool) {
        {
            let mut state = self.state.lock().await;
            state.paused = paused;
        }
        self.save().await;
    }

    pub async fn get_agent(&self, session_id: &str) -> Option<AgentState> {
        self.state.lock().await.active_agents.get(session_id).cloned()
    }

    pub async fn get_all_agents(&self) -> Vec<AgentState> {
        self.state.lock().await.active_agents.values().cloned().collect()
    }

    /// Defensive snapshot: callers get an owned copy, never a
    /// reference into the guarded state.
    pub async fn get_state(&self) -> OrchestrationState {
        self.state.lock().await.clone()
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    /// Coalescing save: if a save is already in flight, mark a pending
    /// follow-up and return — the in-flight save's trailer performs it.
    pub async fn save(&self) {
        if self
            .saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.save_pending.store(true, Ordering::Release);
            return;
        }

        loop {
            self.save_pending.store(false, Ordering::Release);
            if let Err(e) = self.write_once().await {
                error!(error = %e, "failed to persist orchestration state");
            }
            if !self.save_pending.load(Ordering::Acquire) {
                break;
            }
        }

        self.saving.store(false, Ordering::Release);
    }

    async fn write_once(&self) -> Result<()> {
        let mut snapshot = self.state.lock().await.clone();
        snapshot.persisted_at = chrono::Utc::now();

        let serialized = serde_json::to_string_pretty(&snapshot)?;
        let tmp_path = Self::tmp_path(&self.path);

        fs::write(&tmp_path, serialized).await?;
        let file = fs::File::open(&tmp_path).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;

        Ok(())
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentStatus, ModelClass};

    #[tokio::test]
    async fn load_on_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        manager.load().await.unwrap();
        assert!(manager.get_all_agents().await.is_empty());
    }

    #[tokio::test]
    async fn add_agent_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let manager = StateManager::new(&path);
        manager.load().await.unwrap();
        manager
            .add_agent(AgentState::new("s1", "t1", ModelClass::Opus))
            .await;

        let reloaded = StateManager::new(&path);
        reloaded.load().await.unwrap();
        let agent = reloaded.get_agent("s1").await.unwrap();
        assert_eq!(agent.task_id, "t1");
    }

    #[tokio::test]
    async fn load_rejects_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let manager = StateManager::new(&path);
        assert!(manager.load().await.is_err());
    }

    #[tokio::test]
    async fn remove_agent_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        manager.load().await.unwrap();
        manager
            .add_agent(AgentState::new("s1", "t1", ModelClass::SonnetPool))
            .await;
        manager.remove_agent("s1").await;
        assert!(manager.get_agent("s1").await.is_none());
    }

    #[tokio::test]
    async fn update_agent_mutates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        manager.load().await.unwrap();
        manager
            .add_agent(AgentState::new("s1", "t1", ModelClass::Opus))
            .await;

        let updated = manager
            .update_agent("s1", |a| a.status = AgentStatus::Blocked)
            .await;
        assert!(updated);
        assert_eq!(manager.get_agent("s1").await.unwrap().status, AgentStatus::Blocked);
    }
}
