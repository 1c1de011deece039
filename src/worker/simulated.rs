use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::scheduler::job::{JobKind, JobPayload};
use crate::worker::backend::{BackendError, ExecutionBackend};

/// Stand-in generation provider: sleeps for a per-kind processing time and
/// returns a fresh `asset_<id>` reference. Never fails on its own.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    /// Multiplier applied to every processing time; `0.0` makes it instant
    speed: f64,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl SimulatedBackend {
    /// Slowest multiplier accepted; larger values are clamped to it.
    pub const MAX_SPEED: f64 = 1000.0;

    /// `speed` is clamped to `0.0..=MAX_SPEED`; NaN falls back to `1.0`.
    pub fn new(speed: f64) -> Self {
        let speed = if speed.is_nan() {
            1.0
        } else {
            speed.clamp(0.0, Self::MAX_SPEED)
        };
        Self { speed }
    }

    pub fn processing_time(&self, kind: &JobKind) -> Duration {
        let base = match kind {
            JobKind::Text => Duration::from_millis(2000),
            JobKind::Image => Duration::from_millis(3000),
            JobKind::Video => Duration::from_millis(5000),
            JobKind::Music => Duration::from_millis(4000),
            JobKind::Task(_) => Duration::from_millis(1000),
        };
        base.mul_f64(self.speed)
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn validate(&self, kind: &JobKind, payload: &JobPayload) -> Result<(), BackendError> {
        if kind.requires_prompt() && payload.prompt.len() > 4000 {
            return Err(BackendError::InvalidPayload(
                "prompt longer than 4000 characters".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, kind: &JobKind, _payload: &JobPayload) -> Result<String, BackendError> {
        let wait = self.processing_time(kind);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(format!("asset_{}", Uuid::now_v7().simple()))
    }
}
