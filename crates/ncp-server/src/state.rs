// crates/ncp-server/src/state.rs
// State Manager - per-resource locks, snapshots, and do-or-rollback execution

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

/// Lock/snapshot namespace. Different types are independent: a `Profile`
/// mutation never waits on a `Schedule` mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Profile,
    Server,
    Schedule,
    InternalMcp,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Profile => "profile",
            ResourceType::Server => "server",
            ResourceType::Schedule => "schedule",
            ResourceType::InternalMcp => "internal_mcp",
        }
    }
}

type ResourceKey = (ResourceType, String);

/// Emitted when a snapshot is saved or rolled back.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Saved {
        resource_type: ResourceType,
        resource_id: String,
        at: DateTime<Utc>,
    },
    Restored {
        resource_type: ResourceType,
        resource_id: String,
        at: DateTime<Utc>,
    },
}

/// A component whose state can be captured and rolled back as a JSON value.
#[async_trait::async_trait]
pub trait AtomicResource: Send + Sync {
    async fn capture(&self) -> Result<serde_json::Value>;
    async fn restore(&self, snapshot: serde_json::Value) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Snapshot {
    value: serde_json::Value,
    saved_at: DateTime<Utc>,
}

/// Per-resource mutual exclusion plus snapshot/rollback around multi-step
/// mutations. Lock waiters are served in FIFO order (tokio mutexes queue
/// fairly), so concurrent mutations of the same resource serialize and each
/// observes the post-state of the previous one.
pub struct StateManager {
    locks: Mutex<HashMap<ResourceKey, Arc<Mutex<()>>>>,
    backups: RwLock<HashMap<ResourceKey, Snapshot>>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            locks: Mutex::new(HashMap::new()),
            backups: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Run `op` holding the `(resource_type, resource_id)` lock, with the
    /// resource's state snapshotted first. `op` is lazy: it is not polled
    /// until the lock is held and the snapshot saved. On failure the
    /// snapshot is restored before the error propagates; on success it is
    /// discarded.
    pub async fn execute_atomic<T, Fut>(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        resource: &dyn AtomicResource,
        op: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.lock_for(resource_type, resource_id).await;
        let _guard = lock.lock().await;

        let snapshot = resource.capture().await?;
        self.save_state(resource_type, resource_id, snapshot).await;

        match op.await {
            Ok(value) => {
                self.clear_state_backup(resource_type, resource_id).await;
                Ok(value)
            }
            Err(err) => {
                if let Some(snapshot) = self.restore_state(resource_type, resource_id).await {
                    if let Err(restore_err) = resource.restore(snapshot).await {
                        warn!(
                            resource = resource_type.as_str(),
                            id = %resource_id,
                            error = %restore_err,
                            "Rollback failed; state may be inconsistent"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Store a snapshot for a resource, replacing any previous one.
    pub async fn save_state(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        value: serde_json::Value,
    ) {
        let at = Utc::now();
        self.backups.write().await.insert(
            (resource_type, resource_id.to_string()),
            Snapshot { value, saved_at: at },
        );
        debug!(resource = resource_type.as_str(), id = %resource_id, "state:saved");
        let _ = self.events.send(StateEvent::Saved {
            resource_type,
            resource_id: resource_id.to_string(),
            at,
        });
    }

    /// Take a stored snapshot, if any, emitting `state:restored`.
    pub async fn restore_state(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Option<serde_json::Value> {
        let snapshot = self
            .backups
            .write()
            .await
            .remove(&(resource_type, resource_id.to_string()))?;
        debug!(
            resource = resource_type.as_str(),
            id = %resource_id,
            saved_at = %snapshot.saved_at,
            "state:restored"
        );
        let _ = self.events.send(StateEvent::Restored {
            resource_type,
            resource_id: resource_id.to_string(),
            at: Utc::now(),
        });
        Some(snapshot.value)
    }

    /// Discard a stored snapshot without restoring it.
    pub async fn clear_state_backup(&self, resource_type: ResourceType, resource_id: &str) {
        self.backups
            .write()
            .await
            .remove(&(resource_type, resource_id.to_string()));
    }

    /// Drop all locks and snapshots. Idempotent.
    pub async fn cleanup(&self) {
        self.locks.lock().await.clear();
        self.backups.write().await.clear();
    }

    async fn lock_for(&self, resource_type: ResourceType, resource_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((resource_type, resource_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// The profile store is the main rollback target: add/remove server mutate it
// in several steps (document, cache, index) and any failure must leave the
// profile files untouched.
#[async_trait::async_trait]
impl AtomicResource for crate::config::ProfileStore {
    async fn capture(&self) -> Result<serde_json::Value> {
        Ok(self.capture_state().await)
    }

    async fn restore(&self, snapshot: serde_json::Value) -> Result<()> {
        self.restore_state(snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NcpError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory resource for exercising capture/restore.
    struct Counter {
        value: RwLock<u32>,
    }

    #[async_trait::async_trait]
    impl AtomicResource for Counter {
        async fn capture(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!(*self.value.read().await))
        }

        async fn restore(&self, snapshot: serde_json::Value) -> Result<()> {
            *self.value.write().await = snapshot.as_u64().unwrap_or(0) as u32;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_success_commits_and_clears_backup() {
        let manager = StateManager::new();
        let counter = Counter {
            value: RwLock::new(1),
        };

        let result: Result<u32> = manager
            .execute_atomic(ResourceType::Profile, "dev", &counter, async {
                *counter.value.write().await = 2;
                Ok(2)
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(*counter.value.read().await, 2);
        assert!(
            manager
                .restore_state(ResourceType::Profile, "dev")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_failure_rolls_back() {
        let manager = StateManager::new();
        let counter = Counter {
            value: RwLock::new(1),
        };

        let result: Result<()> = manager
            .execute_atomic(ResourceType::Profile, "dev", &counter, async {
                *counter.value.write().await = 99;
                Err(NcpError::InvocationFailed("boom".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*counter.value.read().await, 1);
    }

    #[tokio::test]
    async fn test_same_resource_serializes() {
        let manager = Arc::new(StateManager::new());
        let counter = Arc::new(Counter {
            value: RwLock::new(0),
        });
        let max_concurrent = Arc::new(AtomicU32::new(0));
        let in_flight = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                let op = {
                    let counter = counter.clone();
                    let max_concurrent = max_concurrent.clone();
                    let in_flight = in_flight.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        let mut value = counter.value.write().await;
                        *value += 1;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                };
                manager
                    .execute_atomic(ResourceType::Server, "git", counter.as_ref(), op)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*counter.value.read().await, 8);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_types_are_independent() {
        let manager = Arc::new(StateManager::new());
        let counter = Counter {
            value: RwLock::new(0),
        };

        // Hold the Profile lock while a Schedule operation proceeds.
        let profile_lock = manager.lock_for(ResourceType::Profile, "x").await;
        let _held = profile_lock.lock().await;

        let result: Result<u32> = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            manager.execute_atomic(ResourceType::Schedule, "x", &counter, async { Ok(7) }),
        )
        .await
        .expect("schedule operation must not wait on profile lock");
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let manager = StateManager::new();
        manager
            .save_state(ResourceType::Profile, "dev", serde_json::json!(1))
            .await;
        manager.cleanup().await;
        manager.cleanup().await;
        assert!(
            manager
                .restore_state(ResourceType::Profile, "dev")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_events_carry_timestamps() {
        let manager = StateManager::new();
        let mut events = manager.subscribe();
        manager
            .save_state(ResourceType::Schedule, "t1", serde_json::json!({}))
            .await;
        manager.restore_state(ResourceType::Schedule, "t1").await;

        match events.recv().await.unwrap() {
            StateEvent::Saved { resource_id, .. } => assert_eq!(resource_id, "t1"),
            other => panic!("expected Saved, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            StateEvent::Restored { resource_id, .. } => assert_eq!(resource_id, "t1"),
            other => panic!("expected Restored, got {:?}", other),
        }
    }
}
