// crates/ncp-server/src/health.rs
// Health Supervisor - per-downstream state tracking and reconnect backoff

use chrono::{DateTime, Utc};
use ncp_types::ServerHealth;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Call timeouts within the window before a healthy server is degraded.
pub const DEGRADE_TIMEOUT_THRESHOLD: usize = 3;
/// Call successes within the window before a degraded server recovers.
pub const RECOVER_SUCCESS_THRESHOLD: usize = 2;
/// Sliding window for the two thresholds above.
pub const HEALTH_WINDOW: Duration = Duration::from_secs(60);

/// Reconnect backoff bounds.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Emitted on every health transition.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub server: String,
    pub from: Option<ServerHealth>,
    pub to: ServerHealth,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct ServerStatus {
    health: ServerHealth,
    recent_timeouts: Vec<Instant>,
    recent_successes: Vec<Instant>,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

impl ServerStatus {
    fn new() -> Self {
        Self {
            health: ServerHealth::Starting,
            recent_timeouts: Vec::new(),
            recent_successes: Vec::new(),
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// Tracks per-downstream health and drives the reconnect backoff schedule.
///
/// Transitions are event-driven: the downstream manager reports connect,
/// call, and disconnect outcomes; consumers subscribe to the broadcast
/// channel for `stateChanged` events.
pub struct HealthSupervisor {
    states: RwLock<HashMap<String, ServerStatus>>,
    events: broadcast::Sender<HealthEvent>,
}

impl Default for HealthSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSupervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            states: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Register a server in `starting` state (idempotent).
    pub async fn register(&self, server: &str) {
        let mut states = self.states.write().await;
        if !states.contains_key(server) {
            states.insert(server.to_string(), ServerStatus::new());
            drop(states);
            self.emit(server, None, ServerHealth::Starting);
        }
    }

    /// Connection established and `initialize` succeeded.
    pub async fn record_initialize_ok(&self, server: &str) {
        self.transition(server, ServerHealth::Healthy, |status| {
            status.reconnect_attempts = 0;
            status.recent_timeouts.clear();
            status.last_error = None;
        })
        .await;
    }

    /// `initialize` failed or the connection dropped.
    pub async fn record_connection_lost(&self, server: &str, reason: &str) {
        let reason = reason.to_string();
        self.transition(server, ServerHealth::Unhealthy, move |status| {
            status.last_error = Some(reason);
        })
        .await;
    }

    /// A tool call timed out. Enough of these within the window degrade a
    /// healthy server.
    pub async fn record_call_timeout(&self, server: &str) {
        let mut states = self.states.write().await;
        let Some(status) = states.get_mut(server) else {
            return;
        };
        let now = Instant::now();
        status.recent_timeouts.push(now);
        status
            .recent_timeouts
            .retain(|t| now.duration_since(*t) < HEALTH_WINDOW);

        if status.health == ServerHealth::Healthy
            && status.recent_timeouts.len() >= DEGRADE_TIMEOUT_THRESHOLD
        {
            let from = status.health;
            status.health = ServerHealth::Degraded;
            status.recent_successes.clear();
            drop(states);
            self.emit(server, Some(from), ServerHealth::Degraded);
        }
    }

    /// A tool call succeeded. Enough of these within the window recover a
    /// degraded server.
    pub async fn record_call_success(&self, server: &str) {
        let mut states = self.states.write().await;
        let Some(status) = states.get_mut(server) else {
            return;
        };
        let now = Instant::now();
        status.recent_successes.push(now);
        status
            .recent_successes
            .retain(|t| now.duration_since(*t) < HEALTH_WINDOW);

        if status.health == ServerHealth::Degraded
            && status.recent_successes.len() >= RECOVER_SUCCESS_THRESHOLD
        {
            let from = status.health;
            status.health = ServerHealth::Healthy;
            status.recent_timeouts.clear();
            drop(states);
            self.emit(server, Some(from), ServerHealth::Healthy);
        }
    }

    /// Forget a server entirely (halts its backoff schedule).
    pub async fn remove(&self, server: &str) {
        self.states.write().await.remove(server);
        debug!(server = %server, "Health tracking removed");
    }

    pub async fn health_of(&self, server: &str) -> Option<ServerHealth> {
        self.states.read().await.get(server).map(|s| s.health)
    }

    pub async fn last_error(&self, server: &str) -> Option<String> {
        self.states
            .read()
            .await
            .get(server)
            .and_then(|s| s.last_error.clone())
    }

    /// Current health of every tracked server.
    pub async fn snapshot(&self) -> HashMap<String, ServerHealth> {
        self.states
            .read()
            .await
            .iter()
            .map(|(name, status)| (name.clone(), status.health))
            .collect()
    }

    /// Bump the reconnect attempt counter and return how long to wait before
    /// the next attempt: exponential from 1s to a 60s cap, with up to 25%
    /// jitter so a fleet of failing servers does not reconnect in lockstep.
    pub async fn next_backoff(&self, server: &str) -> Duration {
        let mut states = self.states.write().await;
        let attempt = match states.get_mut(server) {
            Some(status) => {
                status.reconnect_attempts = status.reconnect_attempts.saturating_add(1);
                status.reconnect_attempts
            }
            None => 1,
        };
        drop(states);
        backoff_for_attempt(attempt)
    }

    /// Wait until the server leaves `starting`, up to `deadline`.
    /// Returns the state observed when waiting stopped.
    pub async fn wait_while_starting(
        &self,
        server: &str,
        deadline: Duration,
    ) -> Option<ServerHealth> {
        let mut events = self.subscribe();
        let wait_until = Instant::now() + deadline;

        loop {
            match self.health_of(server).await {
                Some(ServerHealth::Starting) => {}
                other => return other,
            }
            let remaining = wait_until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Some(ServerHealth::Starting);
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(event)) if event.server == server => continue,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => return self.health_of(server).await,
            }
        }
    }

    async fn transition(
        &self,
        server: &str,
        to: ServerHealth,
        update: impl FnOnce(&mut ServerStatus),
    ) {
        let mut states = self.states.write().await;
        let status = states
            .entry(server.to_string())
            .or_insert_with(ServerStatus::new);
        let from = status.health;
        status.health = to;
        update(status);
        drop(states);
        if from != to {
            self.emit(server, Some(from), to);
        }
    }

    fn emit(&self, server: &str, from: Option<ServerHealth>, to: ServerHealth) {
        info!(server = %server, from = ?from, to = %to, "Server health changed");
        let _ = self.events.send(HealthEvent {
            server: server.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

/// Exponential backoff with jitter for the given 1-based attempt number.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6); // 2^6 = 64 > cap
    let base = BACKOFF_INITIAL.saturating_mul(1u32 << exp).min(BACKOFF_CAP);
    let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_ok_is_healthy() {
        let supervisor = HealthSupervisor::new();
        supervisor.register("git").await;
        assert_eq!(
            supervisor.health_of("git").await,
            Some(ServerHealth::Starting)
        );

        supervisor.record_initialize_ok("git").await;
        assert_eq!(
            supervisor.health_of("git").await,
            Some(ServerHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn test_timeouts_degrade_then_successes_recover() {
        let supervisor = HealthSupervisor::new();
        supervisor.register("git").await;
        supervisor.record_initialize_ok("git").await;

        for _ in 0..DEGRADE_TIMEOUT_THRESHOLD {
            supervisor.record_call_timeout("git").await;
        }
        assert_eq!(
            supervisor.health_of("git").await,
            Some(ServerHealth::Degraded)
        );

        for _ in 0..RECOVER_SUCCESS_THRESHOLD {
            supervisor.record_call_success("git").await;
        }
        assert_eq!(
            supervisor.health_of("git").await,
            Some(ServerHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn test_connection_lost_is_unhealthy_and_reconnect_recovers() {
        let supervisor = HealthSupervisor::new();
        supervisor.register("git").await;
        supervisor.record_initialize_ok("git").await;

        supervisor.record_connection_lost("git", "pipe closed").await;
        assert_eq!(
            supervisor.health_of("git").await,
            Some(ServerHealth::Unhealthy)
        );
        assert_eq!(
            supervisor.last_error("git").await.as_deref(),
            Some("pipe closed")
        );

        supervisor.record_initialize_ok("git").await;
        assert_eq!(
            supervisor.health_of("git").await,
            Some(ServerHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn test_events_emitted_on_transition() {
        let supervisor = HealthSupervisor::new();
        let mut events = supervisor.subscribe();

        supervisor.register("git").await;
        supervisor.record_initialize_ok("git").await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.to, ServerHealth::Starting);
        let second = events.recv().await.unwrap();
        assert_eq!(second.from, Some(ServerHealth::Starting));
        assert_eq!(second.to, ServerHealth::Healthy);
    }

    #[tokio::test]
    async fn test_removed_server_is_untracked() {
        let supervisor = HealthSupervisor::new();
        supervisor.register("git").await;
        supervisor.remove("git").await;
        assert_eq!(supervisor.health_of("git").await, None);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        for attempt in 1..=10u32 {
            let backoff = backoff_for_attempt(attempt);
            let expected_base = BACKOFF_INITIAL
                .saturating_mul(1u32 << attempt.saturating_sub(1).min(6))
                .min(BACKOFF_CAP);
            assert!(backoff >= expected_base);
            // Jitter adds at most 25%.
            assert!(backoff <= expected_base + expected_base / 4 + Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn test_wait_while_starting_observes_transition() {
        let supervisor = std::sync::Arc::new(HealthSupervisor::new());
        supervisor.register("slow").await;

        let waiter = supervisor.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_while_starting("slow", Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.record_initialize_ok("slow").await;

        let observed = handle.await.unwrap();
        assert_eq!(observed, Some(ServerHealth::Healthy));
    }
}
