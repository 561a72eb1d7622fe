//! Liveness / readiness state shared between the poll loop and the HTTP probes.

use crate::lifecycle::{StartupPhase, StartupState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    startup: Mutex<StartupState>,
    heartbeat: Mutex<Option<(Instant, DateTime<Utc>)>>,
    stale_after: Duration,
    last_report: Mutex<Option<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub live: bool,
    pub ready: bool,
    pub phase: StartupPhase,
    pub uptime_secs: u64,
    pub phase_durations_ms: Vec<(StartupPhase, u128)>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_age_secs: Option<u64>,
    pub last_report: Option<serde_json::Value>,
}

impl HealthState {
    /// `stale_after` is how long the loop may go without a heartbeat before
    /// liveness is withdrawn.
    pub fn new(stale_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicBool::new(true),
            startup: Mutex::new(StartupState::new()),
            heartbeat: Mutex::new(None),
            stale_after,
            last_report: Mutex::new(None),
        })
    }

    pub fn advance_to(&self, phase: StartupPhase) {
        let mut st = self.startup.lock();
        st.advance_to(phase);
        tracing::info!(phase=?st.phase(), "startup_phase");
    }

    pub fn phase(&self) -> StartupPhase { self.startup.lock().phase() }
    pub fn is_ready(&self) -> bool { self.live.load(Ordering::SeqCst) && self.startup.lock().is_ready() }
    pub fn mark_not_live(&self) { self.live.store(false, Ordering::SeqCst); }

    pub fn heartbeat(&self) {
        *self.heartbeat.lock() = Some((Instant::now(), Utc::now()));
    }

    /// Live unless explicitly withdrawn, or the loop is polling and its last
    /// heartbeat is older than `stale_after`.
    pub fn is_live(&self) -> bool {
        if !self.live.load(Ordering::SeqCst) { return false; }
        if !self.startup.lock().is_ready() { return true; }
        match *self.heartbeat.lock() {
            Some((at, _)) => at.elapsed() <= self.stale_after,
            None => true,
        }
    }

    /// Keep the latest cycle summary around for `/status`.
    pub fn record_report<T: Serialize>(&self, report: &T) {
        match serde_json::to_value(report) {
            Ok(v) => *self.last_report.lock() = Some(v),
            Err(e) => tracing::warn!(error=?e, "report_not_serializable"),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (phase, uptime, durations) = {
            let st = self.startup.lock();
            let durations = st.durations().iter().map(|(p, d)| (*p, d.as_millis())).collect();
            (st.phase(), st.uptime(), durations)
        };
        let hb = *self.heartbeat.lock();
        StatusSnapshot {
            live: self.is_live(),
            ready: self.is_ready(),
            phase,
            uptime_secs: uptime.as_secs(),
            phase_durations_ms: durations,
            last_heartbeat: hb.map(|(_, wall)| wall),
            heartbeat_age_secs: hb.map(|(at, _)| at.elapsed().as_secs()),
            last_report: self.last_report.lock().clone(),
        }
    }
}
