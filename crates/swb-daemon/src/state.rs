//! Shared runtime state for swb-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The pipeline owns all
//! request state; this module only carries wiring and build metadata.

use std::sync::Arc;
use std::time::Instant;

use swb_router::{Pipeline, TargetDispatcher};

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

pub struct AppState {
    pub build: BuildInfo,
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: Arc<TargetDispatcher>,
    started_at: Instant,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, dispatcher: Arc<TargetDispatcher>) -> Self {
        Self {
            build: BuildInfo::current(),
            pipeline,
            dispatcher,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
