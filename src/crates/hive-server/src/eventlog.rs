//! Opt-in JSONL event debug log.
//!
//! Subscribes to the session bus and appends one JSON-serialized event per
//! line to `event_logs/<timestamp>.jsonl` under the hive home directory.

use hive_core::bus::{EventBus, EventFilter};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Handle to a running event log writer.
pub struct EventLog {
    path: PathBuf,
    cancel: CancellationToken,
}

impl EventLog {
    /// Start logging all events on `bus` into `dir`.
    pub async fn start(bus: &EventBus, dir: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let filename = format!("{}.jsonl", chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f"));
        let path = dir.join(filename);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let subscription = bus.subscribe(EventFilter::new());
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = subscription.recv() => {
                            let Some(event) = event else { break };
                            let Ok(line) = event.to_json() else { continue };
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                tracing::warn!(path = %path.display(), error = %e, "event log write failed");
                                break;
                            }
                            let _ = file.write_all(b"\n").await;
                        }
                    }
                }
                let _ = file.flush().await;
            });
        }

        tracing::info!(path = %path.display(), "event debug log enabled");
        Ok(Self { path, cancel })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the writer.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::event::{AgentEvent, EventType};
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_written_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let log = EventLog::start(&bus, dir.path()).await.unwrap();

        bus.publish(AgentEvent::new(EventType::Custom, "s1").with_data("n", 1));
        bus.publish(AgentEvent::new(EventType::Custom, "s1").with_data("n", 2));

        // The writer runs in the background; poll for both lines.
        let mut content = String::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            content = tokio::fs::read_to_string(log.path()).await.unwrap_or_default();
            if content.lines().count() >= 2 {
                break;
            }
        }
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let event: AgentEvent = serde_json::from_str(line).unwrap();
            assert_eq!(event.event_type, EventType::Custom);
        }
        log.shutdown();
    }
}
