//! Test utilities for NCP integration tests

use ncp::config::EnvConfig;
use ncp::orchestrator::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// An orchestrator over a throwaway config directory.
pub struct TestContext {
    pub dir: TempDir,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestContext {
    /// Background init disabled: no downstream connects, no scheduler
    /// timers. This is how most tests want the orchestrator.
    pub async fn new() -> Self {
        Self::build(true).await
    }

    /// Background init enabled, for tests exercising connect probes,
    /// scheduler start, and catch-up.
    pub async fn with_background() -> Self {
        Self::build(false).await
    }

    /// Orchestrator over a pre-populated config dir (no initialize yet).
    pub fn from_dir(dir: TempDir, disable_background: bool) -> Self {
        let env = env_for(dir.path().to_path_buf(), disable_background);
        let orchestrator = Arc::new(Orchestrator::new(env).expect("orchestrator must load"));
        Self { dir, orchestrator }
    }

    async fn build(disable_background: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = Self::from_dir(dir, disable_background);
        ctx.orchestrator
            .initialize("all")
            .await
            .expect("initialize must succeed on the all profile");
        ctx
    }
}

pub fn env_for(config_dir: PathBuf, disable_background: bool) -> EnvConfig {
    EnvConfig {
        config_dir,
        profile: "all".to_string(),
        debug: false,
        disable_background_init: disable_background,
        confirm_before_run: false,
    }
}

/// Pull a field out of a tool's pretty-printed JSON content.
pub fn json_content(content: &str) -> serde_json::Value {
    serde_json::from_str(content).expect("tool content must be JSON")
}
