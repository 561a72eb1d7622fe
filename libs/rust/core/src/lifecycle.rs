//! Startup finite state machine for the sidecar.
//!
//! Phases:
//! - Configuring: settings loaded and validated
//! - HealthCheck: bucket, models root and config directory verified
//! - InitialSync: first reconciliation pass running
//! - Polling: steady-state poll loop (the only ready phase)
//!
//! Tracks how long each phase took so `/status` can report slow startups.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    Configuring,
    HealthCheck,
    InitialSync,
    Polling,
}

impl StartupPhase {
    fn next(self) -> Self {
        match self {
            StartupPhase::Configuring => StartupPhase::HealthCheck,
            StartupPhase::HealthCheck => StartupPhase::InitialSync,
            StartupPhase::InitialSync => StartupPhase::Polling,
            StartupPhase::Polling => StartupPhase::Polling,
        }
    }
}

#[derive(Debug)]
pub struct StartupState {
    phase: StartupPhase,
    started_at: Instant,
    phase_started_at: Instant,
    phase_durations: Vec<(StartupPhase, Duration)>,
}

impl Default for StartupState {
    fn default() -> Self { Self::new() }
}

impl StartupState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { phase: StartupPhase::Configuring, started_at: now, phase_started_at: now, phase_durations: Vec::new() }
    }

    pub fn phase(&self) -> StartupPhase { self.phase }

    pub fn advance(&mut self) {
        if self.phase == StartupPhase::Polling { return; }
        let now = Instant::now();
        self.phase_durations.push((self.phase, now - self.phase_started_at));
        self.phase = self.phase.next();
        self.phase_started_at = now;
    }

    /// Advance until `target` is reached; never moves backwards.
    pub fn advance_to(&mut self, target: StartupPhase) {
        while self.phase < target {
            self.advance();
        }
    }

    pub fn is_ready(&self) -> bool { self.phase == StartupPhase::Polling }
    pub fn durations(&self) -> &[(StartupPhase, Duration)] { &self.phase_durations }
    pub fn uptime(&self) -> Duration { self.started_at.elapsed() }
}
