//! The session manager: namespaced sessions behind one concurrent map.
//!
//! Sessions feel like singletons but are never process-global: every bus,
//! state store, and runtime hangs off its session entry here.

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::paths::HivePaths;
use crate::session::Session;
use dashmap::DashMap;
use hive_checkpoint::FileCheckpointStore;
use hive_core::llm::{CompletionModel, ThrottledModel};
use hive_core::tool::ToolRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Owns every live session.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    model: Arc<dyn CompletionModel>,
    tools: ToolRegistry,
    checkpoints: Arc<FileCheckpointStore>,
    paths: HivePaths,
    config: ServerConfig,
}

impl SessionManager {
    /// Build a manager. The model is wrapped with the configured
    /// concurrency cap; excess LLM calls queue FIFO.
    pub fn new(
        config: ServerConfig,
        model: Arc<dyn CompletionModel>,
        tools: ToolRegistry,
    ) -> Self {
        let paths = HivePaths::new(config.data_dir.clone());
        let mut checkpoints = FileCheckpointStore::new(paths.checkpoints());
        if let Some(ttl) = config.checkpoint_ttl() {
            checkpoints = checkpoints.with_ttl(ttl);
        }
        let model: Arc<dyn CompletionModel> =
            Arc::new(ThrottledModel::new(model, config.llm_concurrency));

        Self {
            sessions: DashMap::new(),
            model,
            tools,
            checkpoints: Arc::new(checkpoints),
            paths,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn paths(&self) -> &HivePaths {
        &self.paths
    }

    /// Create a session. A caller-supplied id that is already taken is a
    /// conflict.
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        queen_prompt: Option<String>,
        model_name: Option<String>,
    ) -> Result<Arc<Session>> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.sessions.contains_key(&session_id) {
            return Err(ServerError::SessionExists(session_id));
        }

        let event_log_dir = self.config.event_log.then(|| self.paths.event_logs());
        let session = Arc::new(
            Session::create(
                session_id.clone(),
                Arc::clone(&self.model),
                model_name,
                self.tools.clone(),
                Arc::clone(&self.checkpoints),
                self.config.isolation,
                queen_prompt,
                event_log_dir.as_deref(),
                self.config.health_interval(),
            )
            .await?,
        );

        match self.sessions.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost a racing create; tear down the duplicate.
                session.shutdown().await;
                Err(ServerError::SessionExists(session_id))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_string()))
    }

    /// Session details, sorted by id.
    pub fn list(&self) -> Vec<Value> {
        let mut details: Vec<(String, Value)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().detail()))
            .collect();
        details.sort_by(|a, b| a.0.cmp(&b.0));
        details.into_iter().map(|(_, detail)| detail).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop and remove a session. All streams are cancelled and active
    /// executions are checkpointed.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_string()))?;
        session.shutdown().await;
        Ok(())
    }

    /// Stop every session (server shutdown).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop_session(&id).await {
                tracing::warn!(session_id = %id, error = %e, "session teardown failed");
            }
        }
    }
}
