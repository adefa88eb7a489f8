//! RPM to road speed.

use log::warn;

use crate::config::{SpeedUnit, WheelConfig};

const KMH_TO_MPH: f64 = 0.621371;

/// Speed conversion constants, fixed at startup.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    circumference_m: f64,
    calibration_factor: f64,
    flywheel_gear_adjustment: Option<f64>,
}

impl SpeedEstimator {
    pub fn new(config: &WheelConfig) -> Self {
        let calibration_factor = match (config.calibration_speed_kmh, config.calibration_wheel_rpm) {
            (Some(kmh), Some(rpm)) => calibration_factor(config.circumference_m, kmh, rpm),
            _ => 1.0,
        };
        Self {
            circumference_m: config.circumference_m,
            calibration_factor,
            flywheel_gear_adjustment: config.flywheel_gear_adjustment,
        }
    }

    pub fn calibration_factor(&self) -> f64 {
        self.calibration_factor
    }

    /// Wheel RPM to use: the direct reading when there is one, otherwise
    /// cadence times the selected gear ratio.
    pub fn effective_wheel_rpm(&self, wheel_rpm: Option<f64>, crank_rpm: f64, gear_ratio: f64) -> f64 {
        match (wheel_rpm, self.flywheel_gear_adjustment) {
            (Some(rpm), Some(adj)) => rpm / adj * gear_ratio,
            (Some(rpm), None) => rpm,
            (None, _) => crank_rpm * gear_ratio,
        }
    }

    /// Speed for the given readings. `wheel_rpm` is `None` when the wheel
    /// sensor is absent or stale.
    pub fn estimate(
        &self,
        wheel_rpm: Option<f64>,
        crank_rpm: f64,
        gear_ratio: f64,
        unit: SpeedUnit,
    ) -> f64 {
        let rpm = self.effective_wheel_rpm(wheel_rpm, crank_rpm, gear_ratio);
        let kmh = self.rpm_to_kmh(rpm);
        match unit {
            SpeedUnit::Kmh => kmh,
            SpeedUnit::Mph => kmh * KMH_TO_MPH,
        }
    }

    /// rpm * circumference(m) * factor gives m/min; * 0.06 gives km/h.
    pub fn rpm_to_kmh(&self, rpm: f64) -> f64 {
        rpm * self.circumference_m * self.calibration_factor * 0.06
    }
}

/// Ratio between the circumference implied by a known speed/RPM pair and
/// the configured one. Falls back to 1.0 on unusable input.
pub fn calibration_factor(circumference_m: f64, known_speed_kmh: f64, known_wheel_rpm: f64) -> f64 {
    if known_speed_kmh <= 0.0 || known_wheel_rpm <= 0.0 || circumference_m <= 0.0 {
        warn!(
            "Ignoring speed calibration (speed={} km/h, rpm={}, circumference={} m)",
            known_speed_kmh, known_wheel_rpm, circumference_m
        );
        return 1.0;
    }
    let wheel_rps = known_wheel_rpm / 60.0;
    let implied_circumference = known_speed_kmh / (wheel_rps * 3.6);
    implied_circumference / circumference_m
}
