// crates/ncp-server/src/scheduler/mod.rs
// Scheduler - persistent cron-driven tool invocations through the orchestrator

pub mod executions;
pub mod timing;

use crate::error::{NcpError, Result};
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use executions::{ExecutionLog, DEFAULT_KEEP_PER_TASK, DEFAULT_MAX_AGE_DAYS};
use ncp_types::{
    parse_qualified_name, ExecutionRecord, ExecutionStatus, ScheduleDocument, ScheduledTask,
    TaskStatus, TimingGroup,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-invocation ceiling when a task does not set its own.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 60_000;
/// When the retention sweep runs (daily, 03:00 UTC).
pub const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 3 * * *";

/// Capability interface through which scheduled tasks invoke tools.
///
/// Injected at `start`; a task that fires before injection fails with a
/// defined "scheduler not started" error instead of panicking.
#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke_tool(
        &self,
        qualified_name: &str,
        args: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value>;
}

/// Parameters for `schedule.create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskParams {
    pub name: String,
    /// Fully-qualified tool name (`server tool` or `server:tool`).
    pub tool: String,
    /// Cron expression (five or six fields).
    pub schedule: String,
    pub timezone: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub fire_once: bool,
    pub max_executions: Option<u32>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub catchup_missed: bool,
}

/// Partial update for `schedule.update`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub timezone: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub status: Option<TaskStatus>,
    pub fire_once: Option<bool>,
    pub max_executions: Option<u32>,
    pub end_date: Option<DateTime<Utc>>,
    pub catchup_missed: Option<bool>,
}

/// Result of `schedule.validate`: the expression echoed back with its
/// normalized form, a field-by-field explanation, and upcoming fire times.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub expression: String,
    pub normalized: String,
    pub timezone: String,
    pub explanation: String,
    pub next_occurrences: Vec<DateTime<Utc>>,
}

/// Cron-driven job runner. One timer task per timing group; tasks sharing an
/// expression share a timer and fire in parallel.
pub struct Scheduler {
    schedule_path: PathBuf,
    doc: RwLock<ScheduleDocument>,
    executions: ExecutionLog,
    invoker: RwLock<Option<Arc<dyn ToolInvoker>>>,
    /// Stop signals for running group timers, keyed by timing id.
    timers: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Tasks currently executing; an arriving slot for a running task is
    /// skipped, not queued.
    running: Mutex<HashSet<String>>,
    default_timeout_ms: u64,
}

impl Scheduler {
    /// Load persisted state. Unknown document versions are refused rather
    /// than silently migrated.
    pub fn load(schedule_path: &Path, executions_path: &Path) -> Result<Self> {
        let doc = match std::fs::read_to_string(schedule_path) {
            Ok(contents) => match serde_json::from_str::<ScheduleDocument>(&contents) {
                Ok(doc) if doc.version == ncp_types::SCHEDULE_DOCUMENT_VERSION => doc,
                Ok(doc) => {
                    warn!(
                        version = %doc.version,
                        "Unsupported schedule.json version; starting with an empty schedule"
                    );
                    ScheduleDocument::default()
                }
                Err(e) => {
                    warn!(error = %e, "schedule.json is corrupt; starting with an empty schedule");
                    ScheduleDocument::default()
                }
            },
            Err(_) => ScheduleDocument::default(),
        };

        info!(
            tasks = doc.tasks.len(),
            timings = doc.timings.len(),
            "Scheduler loaded"
        );
        Ok(Self {
            schedule_path: schedule_path.to_path_buf(),
            doc: RwLock::new(doc),
            executions: ExecutionLog::load(executions_path),
            invoker: RwLock::new(None),
            timers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            default_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
        })
    }

    /// Inject the invoker, run the catch-up pass, and start group timers
    /// plus the retention sweep.
    pub async fn start(self: &Arc<Self>, invoker: Arc<dyn ToolInvoker>) {
        *self.invoker.write().await = Some(invoker);

        self.catchup_pass().await;

        let timing_ids: Vec<String> = self.doc.read().await.timings.keys().cloned().collect();
        for timing_id in timing_ids {
            self.ensure_timer(&timing_id).await;
        }
        self.spawn_cleanup_timer();
        info!("Scheduler started");
    }

    /// Stop all timers. Running executions complete on their own.
    pub async fn stop(&self) {
        let mut timers = self.timers.lock().await;
        for (_, stop) in timers.drain() {
            let _ = stop.send(true);
        }
        info!("Scheduler timers stopped");
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    pub async fn create(self: &Arc<Self>, params: CreateTaskParams) -> Result<ScheduledTask> {
        if params.name.trim().is_empty() {
            return Err(NcpError::ValidationFailed("task name must not be empty".into()));
        }
        if parse_qualified_name(&params.tool).is_none() {
            return Err(NcpError::ValidationFailed(format!(
                "tool must be fully qualified ('server tool'), got {:?}",
                params.tool
            )));
        }
        // Parse up front so an invalid expression never lands on disk.
        timing::parse_schedule(&params.schedule, params.timezone.as_deref())?;
        let normalized = timing::normalize_cron(&params.schedule);

        let task_id = Uuid::new_v4().to_string();
        let timing_id = {
            let mut doc = self.doc.write().await;

            // One timer fires every task that shares an expression+timezone.
            let existing = doc
                .timings
                .values()
                .find(|t| t.cron_expression == normalized && t.timezone == params.timezone)
                .map(|t| t.id.clone());
            let timing_id = match existing {
                Some(id) => id,
                None => {
                    let id = Uuid::new_v4().to_string();
                    doc.timings.insert(
                        id.clone(),
                        TimingGroup {
                            id: id.clone(),
                            cron_expression: normalized.clone(),
                            timezone: params.timezone.clone(),
                            task_ids: Vec::new(),
                        },
                    );
                    id
                }
            };

            let task = ScheduledTask {
                id: task_id.clone(),
                name: params.name,
                timing_id: timing_id.clone(),
                tool: params.tool,
                parameters: params.parameters,
                fire_once: params.fire_once,
                max_executions: params.max_executions,
                end_date: params.end_date,
                catchup_missed: params.catchup_missed,
                status: TaskStatus::Active,
                execution_count: 0,
                last_execution_at: None,
                created_at: Utc::now(),
            };
            doc.tasks.insert(task_id.clone(), task);
            if let Some(group) = doc.timings.get_mut(&timing_id) {
                group.task_ids.push(task_id.clone());
            }
            self.persist(&doc)?;
            timing_id
        };

        if self.is_started().await {
            self.ensure_timer(&timing_id).await;
        }
        let task = self.get(&task_id).await.ok_or_else(|| {
            NcpError::Internal("task vanished immediately after create".into())
        })?;
        info!(task = %task.id, name = %task.name, "Scheduled task created");
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Option<ScheduledTask> {
        self.doc.read().await.tasks.get(task_id).cloned()
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<ScheduledTask> {
        let doc = self.doc.read().await;
        let mut tasks: Vec<ScheduledTask> = doc
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub async fn list_executions(
        &self,
        task_id: Option<&str>,
        limit: usize,
    ) -> Vec<ExecutionRecord> {
        match task_id {
            Some(id) => self.executions.for_task(id, limit).await,
            None => self.executions.recent(limit).await,
        }
    }

    pub async fn timing_groups(&self) -> Vec<TimingGroup> {
        let mut groups: Vec<TimingGroup> =
            self.doc.read().await.timings.values().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    pub async fn update(self: &Arc<Self>, task_id: &str, patch: TaskPatch) -> Result<ScheduledTask> {
        let mut regrouped_timing: Option<String> = None;
        let mut emptied_timing: Option<String> = None;

        {
            let mut doc = self.doc.write().await;
            let task = doc
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| NcpError::NotFound(format!("task '{}' not found", task_id)))?;

            // Re-timing moves the task to a (possibly new) group.
            let new_timing = if patch.schedule.is_some() || patch.timezone.is_some() {
                let current_group = doc.timings.get(&task.timing_id).cloned();
                let expression = match &patch.schedule {
                    Some(expr) => expr.clone(),
                    None => current_group
                        .as_ref()
                        .map(|g| g.cron_expression.clone())
                        .unwrap_or_default(),
                };
                let timezone = patch
                    .timezone
                    .clone()
                    .or_else(|| current_group.as_ref().and_then(|g| g.timezone.clone()));
                timing::parse_schedule(&expression, timezone.as_deref())?;
                let normalized = timing::normalize_cron(&expression);

                let existing = doc
                    .timings
                    .values()
                    .find(|t| t.cron_expression == normalized && t.timezone == timezone)
                    .map(|t| t.id.clone());
                let timing_id = match existing {
                    Some(id) => id,
                    None => {
                        let id = Uuid::new_v4().to_string();
                        doc.timings.insert(
                            id.clone(),
                            TimingGroup {
                                id: id.clone(),
                                cron_expression: normalized,
                                timezone,
                                task_ids: Vec::new(),
                            },
                        );
                        id
                    }
                };
                Some(timing_id)
            } else {
                None
            };

            let old_timing_id = task.timing_id.clone();
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| NcpError::NotFound(format!("task '{}' not found", task_id)))?;

            if let Some(name) = patch.name {
                task.name = name;
            }
            if let Some(parameters) = patch.parameters {
                task.parameters = parameters;
            }
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(fire_once) = patch.fire_once {
                task.fire_once = fire_once;
            }
            if let Some(max_executions) = patch.max_executions {
                task.max_executions = Some(max_executions);
            }
            if let Some(end_date) = patch.end_date {
                task.end_date = Some(end_date);
            }
            if let Some(catchup) = patch.catchup_missed {
                task.catchup_missed = catchup;
            }

            if let Some(new_timing_id) = new_timing {
                if new_timing_id != old_timing_id {
                    task.timing_id = new_timing_id.clone();
                    if let Some(old_group) = doc.timings.get_mut(&old_timing_id) {
                        old_group.task_ids.retain(|id| id != task_id);
                        if old_group.task_ids.is_empty() {
                            doc.timings.remove(&old_timing_id);
                            emptied_timing = Some(old_timing_id);
                        }
                    }
                    if let Some(new_group) = doc.timings.get_mut(&new_timing_id) {
                        new_group.task_ids.push(task_id.to_string());
                    }
                    regrouped_timing = Some(new_timing_id);
                }
            }

            self.persist(&doc)?;
        }

        if let Some(timing_id) = emptied_timing {
            self.stop_timer(&timing_id).await;
        }
        if let Some(timing_id) = regrouped_timing {
            if self.is_started().await {
                self.ensure_timer(&timing_id).await;
            }
        }

        self.get(task_id)
            .await
            .ok_or_else(|| NcpError::NotFound(format!("task '{}' not found", task_id)))
    }

    /// Delete a task; a timing group left with no tasks is garbage-collected
    /// and its timer stopped.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let emptied_timing = {
            let mut doc = self.doc.write().await;
            let task = doc
                .tasks
                .remove(task_id)
                .ok_or_else(|| NcpError::NotFound(format!("task '{}' not found", task_id)))?;

            let mut emptied = None;
            if let Some(group) = doc.timings.get_mut(&task.timing_id) {
                group.task_ids.retain(|id| id != task_id);
                if group.task_ids.is_empty() {
                    doc.timings.remove(&task.timing_id);
                    emptied = Some(task.timing_id);
                }
            }
            self.persist(&doc)?;
            emptied
        };

        if let Some(timing_id) = emptied_timing {
            self.stop_timer(&timing_id).await;
        }
        self.executions.purge_task(task_id).await?;
        info!(task = %task_id, "Scheduled task deleted");
        Ok(())
    }

    /// Validate a cron expression and echo it back with an explanation and
    /// the next three fire times in the given timezone.
    pub fn validate(&self, expression: &str, timezone: Option<&str>) -> Result<ValidationReport> {
        let (schedule, tz) = timing::parse_schedule(expression, timezone)?;
        Ok(ValidationReport {
            expression: expression.to_string(),
            normalized: timing::normalize_cron(expression),
            timezone: tz.to_string(),
            explanation: timing::describe(expression),
            next_occurrences: timing::next_occurrences(&schedule, tz, 3),
        })
    }

    /// Run the retention sweep immediately.
    pub async fn run_retention_sweep(&self) -> Result<usize> {
        self.executions.sweep(DEFAULT_KEEP_PER_TASK, DEFAULT_MAX_AGE_DAYS).await
    }

    /// Serialize scheduler state for the state manager's snapshots.
    pub async fn capture_state(&self) -> serde_json::Value {
        serde_json::to_value(&*self.doc.read().await).unwrap_or_default()
    }

    pub async fn restore_state(&self, snapshot: serde_json::Value) -> Result<()> {
        let restored: ScheduleDocument = serde_json::from_value(snapshot)?;
        let mut doc = self.doc.write().await;
        *doc = restored;
        self.persist(&doc)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn is_started(&self) -> bool {
        self.invoker.read().await.is_some()
    }

    /// Fire one task now, honoring the running guard and lifecycle limits.
    pub(crate) async fn execute_task_now(self: &Arc<Self>, task_id: &str) {
        let Some(task) = self.get(task_id).await else {
            return;
        };
        if task.status != TaskStatus::Active {
            return;
        }
        let now = Utc::now();
        if let Some(end) = task.end_date {
            if now >= end {
                let _ = self.finish_task(task_id, TaskStatus::Completed).await;
                return;
            }
        }
        if let Some(max) = task.max_executions {
            if task.execution_count >= max {
                let _ = self.finish_task(task_id, TaskStatus::Completed).await;
                return;
            }
        }

        // A slot that arrives while the previous execution is still running
        // is skipped and noted, never queued.
        {
            let mut running = self.running.lock().await;
            if !running.insert(task_id.to_string()) {
                let _ = self.executions.note_skipped_slot(task_id).await;
                return;
            }
        }

        let execution_id = match self.executions.begin(task_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(task = %task_id, error = %e, "Failed to open execution record");
                self.running.lock().await.remove(task_id);
                return;
            }
        };

        let invoker = self.invoker.read().await.clone();
        let outcome = match invoker {
            Some(invoker) => {
                invoker
                    .invoke_tool(&task.tool, task.parameters.clone(), self.default_timeout_ms)
                    .await
            }
            None => Err(NcpError::Internal(
                "scheduler not started: no tool invoker injected".into(),
            )),
        };

        let (status, result, error) = match outcome {
            Ok(value) => (ExecutionStatus::Success, Some(value), None),
            Err(NcpError::Timeout(ms)) => (
                ExecutionStatus::Timeout,
                None,
                Some(format!("timed out after {}ms", ms)),
            ),
            Err(e) => (ExecutionStatus::Failure, None, Some(e.to_user_string())),
        };
        debug!(task = %task_id, status = ?status, "Scheduled execution finished");
        if let Err(e) = self
            .executions
            .complete(&execution_id, status, result, error)
            .await
        {
            warn!(task = %task_id, error = %e, "Failed to close execution record");
        }

        // Failures do not pause the task; only lifecycle limits complete it.
        {
            let mut doc = self.doc.write().await;
            if let Some(task) = doc.tasks.get_mut(task_id) {
                task.execution_count += 1;
                task.last_execution_at = Some(Utc::now());
                let max_reached = task
                    .max_executions
                    .is_some_and(|max| task.execution_count >= max);
                if task.fire_once || max_reached {
                    task.status = TaskStatus::Completed;
                }
            }
            if let Err(e) = self.persist(&doc) {
                warn!(error = %e, "Failed to persist schedule after execution");
            }
        }

        self.running.lock().await.remove(task_id);
    }

    async fn finish_task(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut doc = self.doc.write().await;
        if let Some(task) = doc.tasks.get_mut(task_id) {
            task.status = status;
        }
        self.persist(&doc)
    }

    /// Fire overdue `catchup_missed` tasks once each. Any number of missed
    /// slots collapses to a single synthesized execution.
    async fn catchup_pass(self: &Arc<Self>) {
        let now = Utc::now();
        let candidates: Vec<(String, String)> = {
            let doc = self.doc.read().await;
            doc.tasks
                .values()
                .filter(|t| t.catchup_missed && t.status == TaskStatus::Active)
                .map(|t| (t.id.clone(), t.timing_id.clone()))
                .collect()
        };

        for (task_id, timing_id) in candidates {
            let overdue = {
                let doc = self.doc.read().await;
                let Some(task) = doc.tasks.get(&task_id) else {
                    continue;
                };
                let Some(group) = doc.timings.get(&timing_id) else {
                    continue;
                };
                match timing::parse_schedule(&group.cron_expression, group.timezone.as_deref()) {
                    Ok((schedule, tz)) => {
                        let reference = task.last_execution_at.unwrap_or(task.created_at);
                        timing::fired_between(&schedule, tz, reference, now)
                    }
                    Err(e) => {
                        warn!(timing = %timing_id, error = %e, "Skipping catch-up for unparsable timing");
                        false
                    }
                }
            };
            if overdue {
                info!(task = %task_id, "Firing missed slot on restart (collapsed to one)");
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    scheduler.execute_task_now(&task_id).await;
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn ensure_timer(self: &Arc<Self>, timing_id: &str) {
        let mut timers = self.timers.lock().await;
        if timers.contains_key(timing_id) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        timers.insert(timing_id.to_string(), stop_tx);
        drop(timers);

        let scheduler = Arc::clone(self);
        let timing_id = timing_id.to_string();
        tokio::spawn(async move {
            scheduler.run_timing_group(timing_id, stop_rx).await;
        });
    }

    async fn stop_timer(&self, timing_id: &str) {
        if let Some(stop) = self.timers.lock().await.remove(timing_id) {
            let _ = stop.send(true);
            debug!(timing = %timing_id, "Timing group timer stopped");
        }
    }

    async fn run_timing_group(self: Arc<Self>, timing_id: String, mut stop: watch::Receiver<bool>) {
        debug!(timing = %timing_id, "Timing group timer started");
        loop {
            let parsed = {
                let doc = self.doc.read().await;
                doc.timings.get(&timing_id).map(|group| {
                    timing::parse_schedule(&group.cron_expression, group.timezone.as_deref())
                })
            };
            let (schedule, tz) = match parsed {
                Some(Ok(parsed)) => parsed,
                Some(Err(e)) => {
                    warn!(timing = %timing_id, error = %e, "Timing group expression unparsable; timer exits");
                    break;
                }
                None => break, // group was garbage-collected
            };

            let Some(next) = timing::next_after(&schedule, tz, Utc::now()) else {
                debug!(timing = %timing_id, "No future occurrences; timer exits");
                break;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => break,
            }

            let task_ids: Vec<String> = {
                let doc = self.doc.read().await;
                match doc.timings.get(&timing_id) {
                    Some(group) => group.task_ids.clone(),
                    None => break,
                }
            };

            // Tasks sharing a timing group fire in parallel.
            for task_id in task_ids {
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move {
                    scheduler.execute_task_now(&task_id).await;
                });
            }
        }
        self.timers.lock().await.remove(&timing_id);
    }

    fn spawn_cleanup_timer(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let Ok((schedule, tz)) = timing::parse_schedule(DEFAULT_CLEANUP_SCHEDULE, None) else {
                return;
            };
            loop {
                let Some(next) = timing::next_after(&schedule, tz, Utc::now()) else {
                    return;
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;
                match scheduler.run_retention_sweep().await {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "Execution retention sweep completed")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Execution retention sweep failed"),
                }
            }
        });
    }

    fn persist(&self, doc: &ScheduleDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc)?;
        write_atomic(&self.schedule_path, json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockInvoker {
        calls: AtomicU32,
        delay_ms: u64,
        fail: bool,
    }

    impl MockInvoker {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                delay_ms: 0,
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ToolInvoker for MockInvoker {
        async fn invoke_tool(
            &self,
            _qualified_name: &str,
            _args: serde_json::Value,
            _timeout_ms: u64,
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                Err(NcpError::InvocationFailed("mock failure".into()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    fn params(name: &str, schedule: &str) -> CreateTaskParams {
        CreateTaskParams {
            name: name.to_string(),
            tool: "github list_issues".to_string(),
            schedule: schedule.to_string(),
            timezone: None,
            parameters: serde_json::json!({"repo": "ncp"}),
            fire_once: false,
            max_executions: None,
            end_date: None,
            catchup_missed: false,
        }
    }

    async fn scheduler() -> (tempfile::TempDir, Arc<Scheduler>) {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(
            Scheduler::load(
                &dir.path().join("schedule.json"),
                &dir.path().join("executions.json"),
            )
            .unwrap(),
        );
        (dir, scheduler)
    }

    #[tokio::test]
    async fn test_same_expression_shares_one_timing_group() {
        let (_dir, scheduler) = scheduler().await;
        let a = scheduler.create(params("a", "*/5 * * * *")).await.unwrap();
        let b = scheduler.create(params("b", "*/5 * * * *")).await.unwrap();
        let c = scheduler.create(params("c", "0 9 * * 1")).await.unwrap();

        assert_eq!(a.timing_id, b.timing_id);
        assert_ne!(a.timing_id, c.timing_id);
        assert_eq!(scheduler.timing_groups().await.len(), 2);
    }

    #[tokio::test]
    async fn test_deleting_last_task_garbage_collects_group() {
        let (_dir, scheduler) = scheduler().await;
        let a = scheduler.create(params("a", "*/5 * * * *")).await.unwrap();
        let b = scheduler.create(params("b", "*/5 * * * *")).await.unwrap();

        scheduler.delete(&a.id).await.unwrap();
        assert_eq!(scheduler.timing_groups().await.len(), 1);

        scheduler.delete(&b.id).await.unwrap();
        assert!(scheduler.timing_groups().await.is_empty());

        let err = scheduler.delete(&b.id).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn test_invalid_expression_and_tool_rejected() {
        let (_dir, scheduler) = scheduler().await;
        let mut bad_cron = params("a", "every so often");
        bad_cron.schedule = "every so often".to_string();
        assert_eq!(
            scheduler.create(bad_cron).await.unwrap_err().kind(),
            "ValidationFailed"
        );

        let mut bad_tool = params("a", "*/5 * * * *");
        bad_tool.tool = "unqualified".to_string();
        assert_eq!(
            scheduler.create(bad_tool).await.unwrap_err().kind(),
            "ValidationFailed"
        );
    }

    #[tokio::test]
    async fn test_execution_updates_count_and_records() {
        let (_dir, scheduler) = scheduler().await;
        let invoker = Arc::new(MockInvoker::new());
        *scheduler.invoker.write().await = Some(invoker.clone());

        let task = scheduler.create(params("a", "*/5 * * * *")).await.unwrap();
        scheduler.execute_task_now(&task.id).await;
        scheduler.execute_task_now(&task.id).await;

        let task = scheduler.get(&task.id).await.unwrap();
        assert_eq!(task.execution_count, 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.executions.count_for_task(&task.id).await, 2);
        assert_eq!(task.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn test_fire_once_completes_after_one_execution() {
        let (_dir, scheduler) = scheduler().await;
        *scheduler.invoker.write().await = Some(Arc::new(MockInvoker::new()));

        let mut p = params("once", "*/5 * * * *");
        p.fire_once = true;
        let task = scheduler.create(p).await.unwrap();

        scheduler.execute_task_now(&task.id).await;
        let task = scheduler.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.execution_count, 1);

        // Completed tasks do not fire again.
        scheduler.execute_task_now(&task.id).await;
        assert_eq!(scheduler.get(&task.id).await.unwrap().execution_count, 1);
    }

    #[tokio::test]
    async fn test_max_executions_ceiling() {
        let (_dir, scheduler) = scheduler().await;
        *scheduler.invoker.write().await = Some(Arc::new(MockInvoker::new()));

        let mut p = params("capped", "*/5 * * * *");
        p.max_executions = Some(2);
        let task = scheduler.create(p).await.unwrap();

        for _ in 0..4 {
            scheduler.execute_task_now(&task.id).await;
        }
        let task = scheduler.get(&task.id).await.unwrap();
        assert_eq!(task.execution_count, 2);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_overlapping_slot_is_skipped_and_noted() {
        let (_dir, scheduler) = scheduler().await;
        let invoker = Arc::new(MockInvoker {
            calls: AtomicU32::new(0),
            delay_ms: 100,
            fail: false,
        });
        *scheduler.invoker.write().await = Some(invoker.clone());

        let task = scheduler.create(params("slow", "*/5 * * * *")).await.unwrap();

        let first = {
            let scheduler = scheduler.clone();
            let id = task.id.clone();
            tokio::spawn(async move { scheduler.execute_task_now(&id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scheduler.execute_task_now(&task.id).await; // overlaps; skipped
        first.await.unwrap();

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        let records = scheduler.executions.for_task(&task.id, 10).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].skipped_slots, 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_but_task_stays_active() {
        let (_dir, scheduler) = scheduler().await;
        *scheduler.invoker.write().await = Some(Arc::new(MockInvoker {
            calls: AtomicU32::new(0),
            delay_ms: 0,
            fail: true,
        }));

        let task = scheduler.create(params("flaky", "*/5 * * * *")).await.unwrap();
        scheduler.execute_task_now(&task.id).await;

        let records = scheduler.executions.for_task(&task.id, 10).await;
        assert_eq!(records[0].status, ExecutionStatus::Failure);
        assert!(records[0].error.as_deref().unwrap().contains("mock failure"));
        assert_eq!(scheduler.get(&task.id).await.unwrap().status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn test_uninjected_invoker_is_a_defined_error() {
        let (_dir, scheduler) = scheduler().await;
        let task = scheduler.create(params("early", "*/5 * * * *")).await.unwrap();
        scheduler.execute_task_now(&task.id).await;

        let records = scheduler.executions.for_task(&task.id, 10).await;
        assert_eq!(records[0].status, ExecutionStatus::Failure);
        assert!(records[0].error.as_deref().unwrap().contains("not started"));
    }

    #[tokio::test]
    async fn test_update_regroups_on_schedule_change() {
        let (_dir, scheduler) = scheduler().await;
        let a = scheduler.create(params("a", "*/5 * * * *")).await.unwrap();
        let _b = scheduler.create(params("b", "*/5 * * * *")).await.unwrap();

        let patch = TaskPatch {
            schedule: Some("0 9 * * 1".to_string()),
            ..Default::default()
        };
        let updated = scheduler.update(&a.id, patch).await.unwrap();
        assert_ne!(updated.timing_id, a.timing_id);
        assert_eq!(scheduler.timing_groups().await.len(), 2);

        // Old group still holds task b, new group holds task a.
        let groups = scheduler.timing_groups().await;
        assert!(groups.iter().any(|g| g.task_ids == vec![a.id.clone()]));
    }

    #[tokio::test]
    async fn test_catchup_fires_once_on_restart() {
        let (_dir, scheduler) = scheduler().await;
        let mut p = params("missed", "*/1 * * * *");
        p.catchup_missed = true;
        p.fire_once = true;
        let task = scheduler.create(p).await.unwrap();

        // Simulate a process that was down across several slots.
        {
            let mut doc = scheduler.doc.write().await;
            doc.tasks.get_mut(&task.id).unwrap().created_at =
                Utc::now() - chrono::Duration::minutes(10);
        }

        let invoker = Arc::new(MockInvoker::new());
        *scheduler.invoker.write().await = Some(invoker.clone());
        scheduler.catchup_pass().await;
        // Give the spawned catch-up execution time to finish.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        let task = scheduler.get(&task.id).await.unwrap();
        assert_eq!(task.execution_count, 1);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_no_catchup_when_disabled() {
        let (_dir, scheduler) = scheduler().await;
        let task = scheduler.create(params("no-catchup", "*/1 * * * *")).await.unwrap();
        {
            let mut doc = scheduler.doc.write().await;
            doc.tasks.get_mut(&task.id).unwrap().created_at =
                Utc::now() - chrono::Duration::minutes(10);
        }

        let invoker = Arc::new(MockInvoker::new());
        *scheduler.invoker.write().await = Some(invoker.clone());
        scheduler.catchup_pass().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let schedule_path = dir.path().join("schedule.json");
        let executions_path = dir.path().join("executions.json");

        let task_id = {
            let scheduler = Arc::new(Scheduler::load(&schedule_path, &executions_path).unwrap());
            scheduler.create(params("persisted", "*/5 * * * *")).await.unwrap().id
        };

        let reloaded = Scheduler::load(&schedule_path, &executions_path).unwrap();
        let task = reloaded.get(&task_id).await.unwrap();
        assert_eq!(task.name, "persisted");
        assert_eq!(reloaded.timing_groups().await.len(), 1);

        let raw = std::fs::read_to_string(&schedule_path).unwrap();
        assert!(raw.contains("\"version\": \"2.0.0\""));
    }

    #[tokio::test]
    async fn test_validate_report() {
        let (_dir, scheduler) = scheduler().await;
        let report = scheduler.validate("*/5 * * * *", None).unwrap();
        assert_eq!(report.normalized, "0 */5 * * * *");
        assert_eq!(report.next_occurrences.len(), 3);
        assert!(report.explanation.contains("minute: every 5"));
        assert_eq!(report.timezone, "UTC");
    }
}
