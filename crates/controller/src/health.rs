use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No event has been processed since startup.
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub state: HealthState,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Last reported controller health. Written by the control loop, read by the host.
#[derive(Clone)]
pub struct Health {
    inner: Arc<ArcSwap<HealthStatus>>,
}

impl Default for Health {
    fn default() -> Self { Self::new() }
}

impl Health {
    pub fn new() -> Self {
        let initial = HealthStatus { state: HealthState::Unknown, message: "starting".into(), updated_at: Utc::now() };
        Self { inner: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    pub fn report_healthy(&self) { self.set(HealthState::Healthy, "reconciled".into()); }

    pub fn report_unhealthy(&self, err: &dyn fmt::Display) { self.set(HealthState::Unhealthy, err.to_string()); }

    pub fn current(&self) -> Arc<HealthStatus> { self.inner.load_full() }

    fn set(&self, state: HealthState, message: String) {
        self.inner.store(Arc::new(HealthStatus { state, message, updated_at: Utc::now() }));
    }
}
