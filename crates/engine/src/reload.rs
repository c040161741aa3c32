use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use transport::{Frame, WireMessage};

use crate::registry::EnvironmentRegistry;
use crate::runner::ReloadOutcome;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadSummary {
    pub outcomes: Vec<ReloadOutcome>,
}

impl ReloadSummary {
    pub fn failed(&self) -> impl Iterator<Item = &ReloadOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_ok())
    }

    pub fn is_ok(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Applies reload signals to the environments of one process.
#[derive(Clone)]
pub struct ReloadController {
    registry: Arc<EnvironmentRegistry>,
}

impl ReloadController {
    pub fn new(registry: Arc<EnvironmentRegistry>) -> Self {
        Self { registry }
    }

    /// Reload every environment concurrently; resolves once all settle.
    pub async fn reload_all(&self) -> ReloadSummary {
        let runners = self.registry.runners();
        let outcomes = join_all(runners.iter().map(|runner| runner.reload())).await;
        let summary = ReloadSummary { outcomes };
        let failed = summary.failed().count();
        if failed == 0 {
            tracing::info!("reloaded {} environment(s)", summary.outcomes.len());
        } else {
            tracing::warn!(
                "reloaded {} environment(s), {} failed",
                summary.outcomes.len(),
                failed
            );
        }
        summary
    }

    /// Reload one environment. `None` when the name is not hosted here.
    pub async fn reload_one(&self, name: &str) -> Option<ReloadOutcome> {
        let runner = self.registry.get(name)?;
        Some(runner.reload().await)
    }

    /// React to a frame from the transport. Returns `None` for frames that
    /// are not reload signals.
    pub async fn handle(&self, frame: &Frame) -> Option<ReloadSummary> {
        if !matches!(frame.payload, WireMessage::FullReload) {
            return None;
        }
        match frame.tag() {
            None => Some(self.reload_all().await),
            Some(name) => {
                let outcomes = self.reload_one(name).await.into_iter().collect();
                Some(ReloadSummary { outcomes })
            }
        }
    }
}
