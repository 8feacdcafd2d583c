//! The hive home directory layout.
//!
//! ```text
//! ~/.hive/
//!   queen/session/{sid}/          queen conversation persistence
//!   agents/{name}/sessions/{ws}/  per-agent working state
//!   checkpoints/{sid}/{cp}.json   execution checkpoints
//!   credentials/                  provider credential files
//!   event_logs/<timestamp>.jsonl  opt-in event debug logs
//! ```

use std::path::{Path, PathBuf};

/// Resolves paths under the hive home directory.
#[derive(Debug, Clone)]
pub struct HivePaths {
    root: PathBuf,
}

impl HivePaths {
    /// Use an explicit root, or fall back to `~/.hive`.
    pub fn new(root: Option<PathBuf>) -> Self {
        let root = root.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".hive")
        });
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn queen_session(&self, session_id: &str) -> PathBuf {
        self.root.join("queen").join("session").join(session_id)
    }

    pub fn agent_sessions(&self, agent_name: &str, workspace_id: &str) -> PathBuf {
        self.root
            .join("agents")
            .join(agent_name)
            .join("sessions")
            .join(workspace_id)
    }

    pub fn credentials(&self) -> PathBuf {
        self.root.join("credentials")
    }

    pub fn event_logs(&self) -> PathBuf {
        self.root.join("event_logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = HivePaths::new(Some(PathBuf::from("/tmp/hive-test")));
        assert_eq!(
            paths.checkpoints(),
            PathBuf::from("/tmp/hive-test/checkpoints")
        );
        assert_eq!(
            paths.queen_session("s1"),
            PathBuf::from("/tmp/hive-test/queen/session/s1")
        );
        assert_eq!(
            paths.agent_sessions("scanner", "ws1"),
            PathBuf::from("/tmp/hive-test/agents/scanner/sessions/ws1")
        );
        assert_eq!(paths.event_logs(), PathBuf::from("/tmp/hive-test/event_logs"));
    }
}
