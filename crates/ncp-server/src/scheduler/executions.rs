// crates/ncp-server/src/scheduler/executions.rs
// Execution records with hybrid retention (N per task AND max age)

use crate::error::Result;
use crate::utils::write_atomic;
use chrono::{Duration, Utc};
use ncp_types::{ExecutionRecord, ExecutionStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Most recent records kept per task.
pub const DEFAULT_KEEP_PER_TASK: usize = 50;
/// Records older than this are dropped regardless of count.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExecutionDocument {
    #[serde(default)]
    executions: Vec<ExecutionRecord>,
}

/// Append-mostly log of scheduled invocations, persisted to
/// `executions.json` with write-ahead-then-rename updates.
pub struct ExecutionLog {
    path: PathBuf,
    records: RwLock<Vec<ExecutionRecord>>,
}

impl ExecutionLog {
    pub fn load(path: &Path) -> Self {
        let records = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<ExecutionDocument>(&contents) {
                Ok(doc) => doc.executions,
                Err(e) => {
                    warn!(error = %e, "executions.json is corrupt; starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path: path.to_path_buf(),
            records: RwLock::new(records),
        }
    }

    /// Open a record in `running` state and persist it.
    pub async fn begin(&self, task_id: &str) -> Result<String> {
        let execution_id = Uuid::new_v4().to_string();
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            task_id: task_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
            skipped_slots: 0,
        };
        let mut records = self.records.write().await;
        records.push(record);
        self.persist(&records)?;
        Ok(execution_id)
    }

    /// Close a record with its final status and payload.
    pub async fn complete(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records
            .iter_mut()
            .find(|r| r.execution_id == execution_id)
        {
            record.status = status;
            record.completed_at = Some(Utc::now());
            record.result = result;
            record.error = error;
        }
        self.persist(&records)?;
        Ok(())
    }

    /// Note a slot that arrived while the task's previous execution was
    /// still running. The slot is skipped, not queued.
    pub async fn note_skipped_slot(&self, task_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records
            .iter_mut()
            .rev()
            .find(|r| r.task_id == task_id && r.status == ExecutionStatus::Running)
        {
            record.skipped_slots += 1;
            debug!(task = %task_id, skipped = record.skipped_slots, "Slot skipped; task still running");
        }
        self.persist(&records)?;
        Ok(())
    }

    pub async fn for_task(&self, task_id: &str, limit: usize) -> Vec<ExecutionRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .filter(|r| r.task_id == task_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        let records = self.records.read().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    pub async fn count_for_task(&self, task_id: &str) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.task_id == task_id)
            .count()
    }

    /// Drop records a removed task left behind.
    pub async fn purge_task(&self, task_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        records.retain(|r| r.task_id != task_id);
        self.persist(&records)?;
        Ok(())
    }

    /// Hybrid retention sweep: keep the newest `keep_per_task` records per
    /// task AND drop anything older than `max_age_days`. Running records are
    /// always kept. Returns how many records were removed.
    pub async fn sweep(&self, keep_per_task: usize, max_age_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let mut records = self.records.write().await;
        let before = records.len();

        // Newest first so the per-task counter keeps the most recent.
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        records.retain(|record| {
            if record.status == ExecutionStatus::Running {
                return true;
            }
            let kept = seen.entry(record.task_id.clone()).or_insert(0);
            if *kept >= keep_per_task || record.started_at < cutoff {
                return false;
            }
            *kept += 1;
            true
        });
        // Back to chronological order for stable persistence.
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let removed = before - records.len();
        if removed > 0 {
            self.persist(&records)?;
            debug!(removed, "Execution retention sweep");
        }
        Ok(removed)
    }

    fn persist(&self, records: &[ExecutionRecord]) -> Result<()> {
        let doc = ExecutionDocument {
            executions: records.to_vec(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        write_atomic(&self.path, json.as_bytes())?;
        Ok(())
    }
}
