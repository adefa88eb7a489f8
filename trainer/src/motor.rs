//! Resistance motor position controller.
//!
//! Bang-bang control in bounded bursts against a pulse-counted position.
//! Position 0 is the stop position (least resistance); ±`max_position` are
//! both full load. `tick()` never blocks: a burst in progress is a timed
//! state that is polled on every control-loop tick.
//!
//! ```text
//! Uncalibrated → Calibrating → Idle ⇄ Seeking
//!                     │                  │
//!                     └──→ Fault ←───────┘   (terminal until reset_fault)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::MotorConfig;
use crate::error::FaultKind;
use crate::pulse::PulseCounter;

/// Drive direction. Forward counts position up, Reverse counts it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    fn sign(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }
}

/// H-bridge direction outputs.
///
/// Implementations must never leave both direction inputs asserted:
/// `drive` de-asserts the opposite input before asserting the requested one.
pub trait HBridge: Send {
    fn drive(&mut self, direction: Direction);
    /// De-assert both inputs (un-powered coast).
    fn coast(&mut self);
}

impl<T: HBridge + ?Sized> HBridge for Box<T> {
    fn drive(&mut self, direction: Direction) {
        (**self).drive(direction)
    }

    fn coast(&mut self) {
        (**self).coast()
    }
}

/// Externally visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorState {
    Uncalibrated,
    Calibrating,
    Idle,
    Seeking(Direction),
    Fault(FaultKind),
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Uncalibrated,
    Calibrating {
        deadline: Instant,
    },
    Idle,
    Seeking {
        direction: Direction,
        deadline: Instant,
        waypoint: i32,
        pulses: u32,
    },
    Fault(FaultKind),
}

pub struct MotorController<B: HBridge> {
    bridge: B,
    motor_pulses: Arc<PulseCounter>,
    stop_trigger: Arc<PulseCounter>,
    max_position: i32,
    dead_band: i32,
    burst: Duration,
    stall_bursts: u32,
    calibration_timeout: Duration,
    phase: Phase,
    position: i32,
    target: i32,
    /// Sign used for a non-zero target while sitting at position 0.
    preferred_sign: i32,
    /// Last direction driven; coasting pulses are attributed to it.
    last_drive: Option<Direction>,
    stalled: u32,
    hold: bool,
}

impl<B: HBridge> MotorController<B> {
    pub fn new(
        mut bridge: B,
        motor_pulses: Arc<PulseCounter>,
        stop_trigger: Arc<PulseCounter>,
        config: &MotorConfig,
    ) -> Self {
        bridge.coast();
        Self {
            bridge,
            motor_pulses,
            stop_trigger,
            max_position: config.max_position,
            dead_band: config.dead_band.max(0),
            burst: Duration::from_millis(config.burst_ms),
            stall_bursts: config.stall_bursts.max(1),
            calibration_timeout: Duration::from_secs(config.calibration_timeout_secs),
            phase: Phase::Uncalibrated,
            position: 0,
            target: 0,
            preferred_sign: 1,
            last_drive: None,
            stalled: 0,
            hold: false,
        }
    }

    pub fn state(&self) -> MotorState {
        match self.phase {
            Phase::Uncalibrated => MotorState::Uncalibrated,
            Phase::Calibrating { .. } => MotorState::Calibrating,
            Phase::Idle => MotorState::Idle,
            Phase::Seeking { direction, .. } => MotorState::Seeking(direction),
            Phase::Fault(kind) => MotorState::Fault(kind),
        }
    }

    pub fn fault(&self) -> Option<FaultKind> {
        match self.phase {
            Phase::Fault(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn target_position(&self) -> i32 {
        self.target
    }

    /// Load implied by the current position, 0.0..=100.0.
    pub fn current_load_percent(&self) -> f64 {
        f64::from(self.position.abs().min(self.max_position)) / f64::from(self.max_position) * 100.0
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Stop starting new bursts (a burst already running still completes).
    pub fn set_hold(&mut self, hold: bool) {
        if self.hold != hold {
            debug!("Motor hold {}", if hold { "on" } else { "off" });
        }
        self.hold = hold;
    }

    /// Start the zero-calibration sequence. Only valid from `Uncalibrated`.
    pub fn begin_calibration(&mut self, now: Instant) -> bool {
        if !matches!(self.phase, Phase::Uncalibrated) {
            return false;
        }
        // An edge latched before we start driving says nothing about where we are.
        self.stop_trigger.take();
        self.motor_pulses.take();
        self.drive(Direction::Reverse);
        self.phase = Phase::Calibrating {
            deadline: now + self.calibration_timeout,
        };
        info!(
            "Motor calibration started (timeout {:?})",
            self.calibration_timeout
        );
        true
    }

    /// Clear a fault so calibration can be run again.
    pub fn reset_fault(&mut self) -> bool {
        if let Phase::Fault(kind) = self.phase {
            info!("Motor fault cleared ({})", kind);
            self.phase = Phase::Uncalibrated;
            self.stalled = 0;
            self.bridge.coast();
            true
        } else {
            false
        }
    }

    /// Set the target from a load percentage. Returns the signed target position.
    pub fn set_target_load(&mut self, load_percent: u8) -> i32 {
        let magnitude = (f64::from(load_percent.min(100)) / 100.0 * f64::from(self.max_position))
            .round() as i32;
        let sign = match self.position.signum() {
            0 => self.preferred_sign,
            s => s,
        };
        let target = sign * magnitude;
        if target != self.target {
            debug!(
                "Motor target {} -> {} ({}% load)",
                self.target, target, load_percent
            );
            self.target = target;
        }
        target
    }

    /// Advance the state machine by one control-loop step.
    ///
    /// Returns a fault only on the tick that raises it.
    pub fn tick(&mut self, now: Instant) -> Option<FaultKind> {
        self.account_pulses();

        match self.phase {
            Phase::Uncalibrated | Phase::Fault(_) => {
                self.stop_trigger.take();
                None
            }
            Phase::Calibrating { deadline } => {
                if self.stop_trigger.take() > 0 {
                    self.bridge.coast();
                    self.position = 0;
                    self.stalled = 0;
                    self.phase = Phase::Idle;
                    info!("Motor calibration complete, at stop position");
                    None
                } else if now >= deadline {
                    Some(self.raise(FaultKind::CalibrationTimeout))
                } else {
                    None
                }
            }
            Phase::Idle => {
                self.stop_trigger.take();
                self.evaluate(now);
                None
            }
            Phase::Seeking {
                direction,
                deadline,
                waypoint,
                pulses,
            } => {
                self.stop_trigger.take();
                let arrived = match direction {
                    Direction::Forward => self.position >= waypoint,
                    Direction::Reverse => self.position <= waypoint,
                };
                if arrived {
                    self.bridge.coast();
                    self.stalled = 0;
                    self.phase = Phase::Idle;
                    self.evaluate(now);
                    return None;
                }
                if now < deadline {
                    return None;
                }

                self.bridge.coast();
                if pulses == 0 {
                    self.stalled += 1;
                    warn!(
                        "Motor burst produced no pulses ({}/{})",
                        self.stalled, self.stall_bursts
                    );
                    if self.stalled >= self.stall_bursts {
                        return Some(self.raise(FaultKind::MotorStall));
                    }
                } else {
                    self.stalled = 0;
                }
                self.phase = Phase::Idle;
                self.evaluate(now);
                None
            }
        }
    }

    fn account_pulses(&mut self) {
        let pulses = self.motor_pulses.take();
        if pulses == 0 {
            return;
        }
        let Some(direction) = self.last_drive else {
            debug!("Ignoring {} motor pulses before first drive", pulses);
            return;
        };
        let delta = direction.sign() * pulses.min(i32::MAX as u32) as i32;
        self.position = (self.position + delta).clamp(-self.max_position, self.max_position);
        if self.position != 0 {
            self.preferred_sign = self.position.signum();
        }
        if let Phase::Seeking { pulses: seen, .. } = &mut self.phase {
            *seen = seen.saturating_add(pulses);
        }
    }

    /// From Idle: start a burst toward the next waypoint or stay put.
    fn evaluate(&mut self, now: Instant) {
        if self.hold {
            return;
        }
        let waypoint = next_waypoint(self.position, self.target);
        let distance = waypoint - self.position;
        if distance.abs() <= self.dead_band {
            return;
        }
        let direction = if distance > 0 {
            Direction::Forward
        } else {
            Direction::Reverse
        };
        self.drive(direction);
        self.phase = Phase::Seeking {
            direction,
            deadline: now + self.burst,
            waypoint,
            pulses: 0,
        };
        debug!(
            "Motor burst {:?}: position {} -> waypoint {} (target {})",
            direction, self.position, waypoint, self.target
        );
    }

    fn drive(&mut self, direction: Direction) {
        self.bridge.drive(direction);
        self.last_drive = Some(direction);
    }

    fn raise(&mut self, kind: FaultKind) -> FaultKind {
        self.bridge.coast();
        self.phase = Phase::Fault(kind);
        error!("Motor fault: {} (outputs disabled)", kind);
        kind
    }
}

/// Where to head next from `position` on the way to `target`.
///
/// Crossing zero always stops at 0 first so the move is re-evaluated there.
pub fn next_waypoint(position: i32, target: i32) -> i32 {
    if position != 0 && target != 0 && position.signum() != target.signum() {
        0
    } else {
        target
    }
}
