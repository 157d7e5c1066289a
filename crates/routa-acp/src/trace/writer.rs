//! JSONL append-only trace writer.
//!
//! Storage: `<workspace>/.routa/traces/{YYYY-MM-DD}/traces-{datetime}.jsonl`,
//! rotated daily. Writing never fails the main flow — `append_safe` logs
//! and swallows errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::TraceRecord;

#[derive(Clone)]
pub struct TraceWriter {
    base_dir: PathBuf,
    current_file: Arc<Mutex<Option<CurrentFile>>>,
}

struct CurrentFile {
    date: String,
    path: PathBuf,
}

impl TraceWriter {
    /// Traces go to `<workspace_root>/.routa/traces/`.
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            base_dir: workspace_root.as_ref().join(".routa").join("traces"),
            current_file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Append one record to today's file.
    pub async fn append(&self, record: &TraceRecord) -> Result<(), String> {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let file_path = self.file_for(&today).await?;

        let json =
            serde_json::to_string(record).map_err(|e| format!("serialize trace: {e}"))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .await
            .map_err(|e| format!("open {}: {e}", file_path.display()))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(b"\n").await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Append, logging failures instead of propagating them.
    pub async fn append_safe(&self, record: &TraceRecord) {
        if let Err(e) = self.append(record).await {
            tracing::warn!("[trace] write failed: {}", e);
        }
    }

    async fn file_for(&self, date: &str) -> Result<PathBuf, String> {
        let mut current = self.current_file.lock().await;
        if let Some(cf) = current.as_ref() {
            if cf.date == date {
                return Ok(cf.path.clone());
            }
        }

        let day_dir = self.base_dir.join(date);
        fs::create_dir_all(&day_dir)
            .await
            .map_err(|e| format!("mkdir {}: {e}", day_dir.display()))?;

        let datetime = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let path = day_dir.join(format!("traces-{datetime}.jsonl"));
        *current = Some(CurrentFile {
            date: date.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Contributor, TraceEventType};

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = TraceWriter::new(tmp.path());

        for i in 0..3 {
            let record = TraceRecord::new(
                format!("s{i}"),
                TraceEventType::AgentMessage,
                Contributor::new("opencode", None),
            );
            writer.append(&record).await.unwrap();
        }

        let day_dir = std::fs::read_dir(writer.base_dir())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let file = std::fs::read_dir(&day_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content.lines().count(), 3);

        let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["sessionId"], "s0");
    }

    #[tokio::test]
    async fn append_safe_swallows_unwritable_path() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocked");
        tokio::fs::write(&blocker, b"file, not dir").await.unwrap();

        let writer = TraceWriter::new(&blocker);
        let record = TraceRecord::new(
            "s1",
            TraceEventType::UserMessage,
            Contributor::new("opencode", None),
        );
        // Must not panic.
        writer.append_safe(&record).await;
    }
}
