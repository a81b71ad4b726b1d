//! Zero/span calibration overlay.
//!
//! A finite state machine layered over ordinary polling. The cycle starts on
//! wall-clock boundaries of `zero_span_check_interval`, runs a zero check for
//! `zero_check_duration`, then a span check for `span_check_duration` (skipped
//! when zero), then returns to `Idle`. A forced check runs one phase and
//! returns straight to `Idle`.
//!
//! The adapter calls [`CalibrationCycle::advance`] before each poll and sends
//! the returned state to the instrument when it changes.

use crate::config::CalibrationSettings;
use crate::core::OperationState;
use crate::timebin::next_boundary;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Calibration state machine
#[derive(Debug, Clone)]
pub struct CalibrationCycle {
    settings: CalibrationSettings,
    state: OperationState,
    phase_ends: Option<DateTime<Utc>>,
    next_cycle: Option<DateTime<Utc>>,
    forced: bool,
}

fn plus(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

impl CalibrationCycle {
    /// Idle overlay; the first cycle starts at the next aligned boundary.
    pub fn new(settings: CalibrationSettings) -> Self {
        Self {
            settings,
            state: OperationState::Idle,
            phase_ends: None,
            next_cycle: None,
            forced: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> OperationState {
        self.state
    }

    /// When the active phase ends.
    pub fn phase_ends(&self) -> Option<DateTime<Utc>> {
        self.phase_ends
    }

    /// Start a single zero or span check now. Returns the state to command.
    pub fn force(&mut self, check: OperationState, now: DateTime<Utc>) -> OperationState {
        let duration = match check {
            OperationState::ZeroCheck => self.settings.zero_check_duration,
            OperationState::SpanCheck => self.settings.span_check_duration,
            OperationState::Idle => Duration::ZERO,
        };
        self.forced = true;
        self.enter(check, now, duration);
        self.state
    }

    fn enter(&mut self, state: OperationState, now: DateTime<Utc>, duration: Duration) {
        self.state = state;
        self.phase_ends = match state {
            OperationState::Idle => None,
            _ => Some(plus(now, duration)),
        };
        if state == OperationState::Idle {
            self.forced = false;
        }
    }

    /// Move the machine to `now`. Returns the new state if it changed.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<OperationState> {
        let before = self.state;
        let interval = self.settings.zero_span_check_interval;
        if self.next_cycle.is_none() {
            self.next_cycle = Some(next_boundary(now, interval, Duration::ZERO));
        }

        // Several phases may have elapsed since the last poll; phases are
        // timed from their scheduled start, not from when they were noticed.
        loop {
            match self.state {
                OperationState::Idle => {
                    let Some(start) = self.next_cycle else { break };
                    if now < start {
                        break;
                    }
                    self.next_cycle = Some(next_boundary(now, interval, Duration::ZERO));
                    self.enter(OperationState::ZeroCheck, start, self.settings.zero_check_duration);
                }
                OperationState::ZeroCheck => {
                    let Some(end) = self.phase_ends else { break };
                    if now < end {
                        break;
                    }
                    if self.forced || self.settings.span_check_duration.is_zero() {
                        self.enter(OperationState::Idle, end, Duration::ZERO);
                        break;
                    }
                    self.enter(OperationState::SpanCheck, end, self.settings.span_check_duration);
                }
                OperationState::SpanCheck => {
                    let Some(end) = self.phase_ends else { break };
                    if now >= end {
                        self.enter(OperationState::Idle, end, Duration::ZERO);
                    }
                    break;
                }
            }
        }

        (self.state != before).then_some(self.state)
    }
}

/// Instrument code for an operation state.
pub fn operation_code(state: OperationState) -> u32 {
    match state {
        OperationState::Idle => 0,
        OperationState::ZeroCheck => 1,
        OperationState::SpanCheck => 2,
    }
}
