//! Alert state machine with hysteresis
//!
//! `WarmingUp` until a baseline exists, then `Baseline`. `alert_after`
//! consecutive deviating observations raise an alert; `clear_after`
//! consecutive normal observations clear it. Any interruption of a streak
//! resets that streak.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    WarmingUp,
    Baseline,
    Alerting,
}

/// Outcome of one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Raised,
    Cleared,
}

#[derive(Debug, Clone)]
pub struct Hysteresis {
    state: DetectorState,
    alert_after: u32,
    clear_after: u32,
    over: u32,
    under: u32,
}

impl Hysteresis {
    pub fn new(alert_after: u32, clear_after: u32) -> Self {
        Self {
            state: DetectorState::WarmingUp,
            alert_after: alert_after.max(1),
            clear_after: clear_after.max(1),
            over: 0,
            under: 0,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Feed one post-warm-up observation
    pub fn observe(&mut self, deviating: bool) -> Transition {
        if self.state == DetectorState::WarmingUp {
            self.state = DetectorState::Baseline;
        }

        match self.state {
            DetectorState::Alerting => {
                if deviating {
                    self.under = 0;
                    return Transition::None;
                }
                self.under += 1;
                if self.under >= self.clear_after {
                    self.state = DetectorState::Baseline;
                    self.under = 0;
                    return Transition::Cleared;
                }
                Transition::None
            }
            _ => {
                if !deviating {
                    self.over = 0;
                    return Transition::None;
                }
                self.over += 1;
                if self.over >= self.alert_after {
                    self.state = DetectorState::Alerting;
                    self.over = 0;
                    return Transition::Raised;
                }
                Transition::None
            }
        }
    }
}
