//! Interrupt-fed pulse counting and RPM estimation.
//!
//! Edge handlers only ever touch a [`PulseCounter`]: one relaxed atomic
//! increment, no allocation, no locks. The control loop owns a
//! [`RateEstimator`] per sensor and polls it once per tick.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SensorConfig;

/// Edge accumulator shared between interrupt context and the control loop.
#[derive(Debug, Default)]
pub struct PulseCounter {
    count: AtomicU32,
}

impl PulseCounter {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Called from interrupt context on every rising edge.
    #[inline]
    pub fn on_edge(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read the accumulated count and reset it to zero.
    #[inline]
    pub fn take(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }

    /// Current count without resetting (diagnostics only).
    pub fn peek(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// The four edge-counted inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Crank,
    Wheel,
    Motor,
    MotorStop,
}

impl FromStr for Sensor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crank" => Ok(Sensor::Crank),
            "wheel" => Ok(Sensor::Wheel),
            "motor" => Ok(Sensor::Motor),
            "stop" | "motor_stop" => Ok(Sensor::MotorStop),
            other => Err(format!("unknown sensor '{other}'")),
        }
    }
}

/// Counters shared between the edge handlers and the control loop.
#[derive(Debug, Clone, Default)]
pub struct SensorInputs {
    pub crank: Arc<PulseCounter>,
    pub wheel: Arc<PulseCounter>,
    pub motor: Arc<PulseCounter>,
    /// Fires once when the mechanism passes the stop position.
    pub motor_stop: Arc<PulseCounter>,
}

impl SensorInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, sensor: Sensor) -> &Arc<PulseCounter> {
        match sensor {
            Sensor::Crank => &self.crank,
            Sensor::Wheel => &self.wheel,
            Sensor::Motor => &self.motor,
            Sensor::MotorStop => &self.motor_stop,
        }
    }

    /// Inject `count` edges, as the simulator and debug console do.
    pub fn inject(&self, sensor: Sensor, count: u32) {
        let counter = self.counter(sensor);
        for _ in 0..count {
            counter.on_edge();
        }
    }
}

/// Turns windows of pulse counts into RPM for one sensor.
///
/// The estimator starts stopped. The first pulse only opens a window; a rate
/// is derived once a later window closes with pulses in it. A window stays
/// open until at least `min_window` has elapsed, and while it is open the
/// counter is not drained, so short polls never lose pulses. An empty window
/// is kept growing until `stale_after`, at which point the sensor is stopped
/// again and the rate drops to zero.
#[derive(Debug)]
pub struct RateEstimator {
    pulses_per_revolution: u32,
    min_window: Duration,
    stale_after: Duration,
    epoch: Instant,
    /// `None` while stopped.
    window_start: Option<Instant>,
    last_pulse_at: Option<Instant>,
    rpm: f64,
    total_pulses: u64,
}

impl RateEstimator {
    pub fn new(config: &SensorConfig, now: Instant) -> Self {
        Self {
            pulses_per_revolution: config.pulses_per_revolution.max(1),
            min_window: Duration::from_millis(config.min_window_ms),
            stale_after: Duration::from_millis(config.stale_after_ms),
            epoch: now,
            window_start: None,
            last_pulse_at: None,
            rpm: 0.0,
            total_pulses: 0,
        }
    }

    /// Close the current window if it is old enough and return its RPM.
    ///
    /// Returns 0 without touching `counter` while the window is younger than
    /// the debounce interval.
    pub fn sample(&mut self, counter: &PulseCounter, now: Instant) -> f64 {
        let Some(start) = self.window_start else {
            let pulses = counter.take();
            if pulses > 0 {
                // Nothing to measure the first pulses against yet.
                self.record(pulses, now);
                self.window_start = Some(now);
            }
            return 0.0;
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed.is_zero() || elapsed < self.min_window {
            return 0.0;
        }

        let pulses = counter.take();
        if pulses == 0 {
            if elapsed > self.stale_after {
                self.rpm = 0.0;
                self.window_start = None;
            }
            return self.rpm;
        }

        self.record(pulses, now);
        self.window_start = Some(now);
        self.rpm = if elapsed > self.stale_after {
            // Pulses after a gap nobody sampled: treat as a restart.
            0.0
        } else {
            let minutes = elapsed.as_secs_f64() / 60.0;
            f64::from(pulses) / f64::from(self.pulses_per_revolution) / minutes
        };
        self.rpm
    }

    fn record(&mut self, pulses: u32, now: Instant) {
        self.total_pulses += u64::from(pulses);
        self.last_pulse_at = Some(now);
    }

    /// Rate of the last completed window.
    pub fn rpm(&self) -> f64 {
        self.rpm
    }

    /// True while pulses have been seen within the staleness threshold.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.last_pulse_at
            .is_some_and(|at| now.saturating_duration_since(at) <= self.stale_after)
    }

    /// Whole revolutions counted since startup.
    pub fn cumulative_revolutions(&self) -> u64 {
        self.total_pulses / u64::from(self.pulses_per_revolution)
    }

    /// Time of the most recent pulse-bearing poll in 1/1024 s units.
    pub fn last_event_1024(&self) -> u16 {
        event_1024(self.epoch, self.last_pulse_at)
    }
}

/// Revolutions integrated from a rate rather than counted, for a wheel whose
/// speed is derived (cadence times gear, or a flywheel adjustment).
#[derive(Debug)]
pub struct RevolutionIntegrator {
    epoch: Instant,
    revolutions: f64,
    last_event_at: Option<Instant>,
}

impl RevolutionIntegrator {
    pub fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            revolutions: 0.0,
            last_event_at: None,
        }
    }

    /// Add `dt` worth of turning at `rpm`, ending at `now`.
    pub fn advance(&mut self, rpm: f64, dt: Duration, now: Instant) {
        if !(rpm > 0.0) || dt.is_zero() {
            return;
        }
        let revs_per_sec = rpm / 60.0;
        let before = self.revolutions;
        let after = before + revs_per_sec * dt.as_secs_f64();
        self.revolutions = after;
        if after.floor() > before.floor() {
            // Stamp the moment the last whole revolution completed.
            let overshoot = Duration::from_secs_f64((after - after.floor()) / revs_per_sec);
            self.last_event_at = Some(now.checked_sub(overshoot).unwrap_or(now));
        }
    }

    pub fn cumulative_revolutions(&self) -> u64 {
        self.revolutions.floor() as u64
    }

    pub fn last_event_1024(&self) -> u16 {
        event_1024(self.epoch, self.last_event_at)
    }
}

/// Event time in 1/1024 s since `epoch`, wrapped to 16 bits as the CSC
/// measurement requires.
fn event_1024(epoch: Instant, at: Option<Instant>) -> u16 {
    match at {
        Some(at) => {
            let ticks = at.saturating_duration_since(epoch).as_millis() * 1024 / 1000;
            (ticks & 0xFFFF) as u16
        }
        None => 0,
    }
}
