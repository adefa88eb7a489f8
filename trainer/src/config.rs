//! Trainer configuration.
//!
//! Read once at startup from `trainer_config.json` (or `--config <path>`)
//! and handed to each component by reference. Nothing mutates it afterwards.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub device: DeviceConfig,
    pub gears: GearConfig,
    pub wheel: WheelConfig,
    pub sensors: SensorsConfig,
    pub motor: MotorConfig,
    pub load: LoadConfig,
    pub control_loop: LoopConfig,
    pub gpio: GpioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Advertised BLE local name.
    pub name: String,
    /// Appended to `name` while a pairing window is open.
    pub pairing_suffix: String,
    pub pairing_duration_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Pico Bike".to_string(),
            pairing_suffix: " [PAIRING]".to_string(),
            pairing_duration_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GearConfig {
    pub count: u8,
    pub min_ratio: f64,
    pub max_ratio: f64,
}

impl Default for GearConfig {
    fn default() -> Self {
        Self {
            count: 7,
            min_ratio: 1.0,
            max_ratio: 4.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    Kmh,
    #[default]
    Mph,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelConfig {
    /// Wheel circumference in meters (26-inch wheel ≈ 2.075).
    pub circumference_m: f64,
    /// Known speed/RPM pair used to derive the calibration factor.
    pub calibration_speed_kmh: Option<f64>,
    pub calibration_wheel_rpm: Option<f64>,
    /// When set, speed is `wheel_rpm / adjustment * gear_ratio` (virtual gearing
    /// on a fixed-gear flywheel).
    pub flywheel_gear_adjustment: Option<f64>,
    pub display_unit: SpeedUnit,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            circumference_m: 2.075,
            calibration_speed_kmh: Some(48.28),
            calibration_wheel_rpm: Some(388.0),
            flywheel_gear_adjustment: None,
            display_unit: SpeedUnit::Mph,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub pulses_per_revolution: u32,
    /// Windows shorter than this are not closed (noise debounce).
    pub min_window_ms: u64,
    /// No pulses for this long means the sensor is stopped.
    pub stale_after_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            pulses_per_revolution: 1,
            min_window_ms: 250,
            stale_after_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub crank: SensorConfig,
    pub wheel: SensorConfig,
    /// False when no wheel sensor is fitted; speed is then always derived
    /// from cadence and gear ratio.
    pub wheel_sensor_fitted: bool,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            crank: SensorConfig::default(),
            wheel: SensorConfig::default(),
            wheel_sensor_fitted: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Motor pulses between the stop position and full load.
    pub max_position: i32,
    pub burst_ms: u64,
    /// Positions this close to the target count as arrived.
    pub dead_band: i32,
    /// Consecutive pulse-less bursts that declare a stall.
    pub stall_bursts: u32,
    pub calibration_timeout_secs: u64,
    /// Hold the mechanism where it is while training is paused.
    pub halt_on_pause: bool,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            max_position: 500,
            burst_ms: 100,
            dead_band: 1,
            stall_bursts: 5,
            calibration_timeout_secs: 120,
            halt_on_pause: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Power mapped to 100% load by the Set Target Power estimate.
    pub max_power_watts: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_power_watts: 400.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub tick_hz: u32,
    pub notify_interval_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_hz: 20,
            notify_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub crank: u8,
    pub wheel: u8,
    pub motor_count: u8,
    pub motor_stop: u8,
    pub bridge_in1: u8,
    pub bridge_in2: u8,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            crank: 7,
            wheel: 4,
            motor_count: 0,
            motor_stop: 1,
            bridge_in1: 5,
            bridge_in2: 6,
        }
    }
}

impl TrainerConfig {
    /// Reject values that would make the control loop misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.gears.count == 0 {
            return invalid("gears.count must be at least 1");
        }
        if self.gears.min_ratio <= 0.0 || self.gears.max_ratio < self.gears.min_ratio {
            return invalid("gears ratios must satisfy 0 < min_ratio <= max_ratio");
        }
        if !(self.wheel.circumference_m > 0.0) {
            return invalid("wheel.circumference_m must be > 0");
        }
        if self.wheel.flywheel_gear_adjustment.is_some_and(|a| a <= 0.0) {
            return invalid("wheel.flywheel_gear_adjustment must be > 0");
        }
        if self.sensors.crank.pulses_per_revolution == 0
            || self.sensors.wheel.pulses_per_revolution == 0
        {
            return invalid("sensor pulses_per_revolution must be at least 1");
        }
        if self.motor.max_position <= 0 {
            return invalid("motor.max_position must be > 0");
        }
        if self.motor.burst_ms == 0 || self.motor.stall_bursts == 0 {
            return invalid("motor.burst_ms and motor.stall_bursts must be > 0");
        }
        if self.control_loop.tick_hz < 10 {
            return invalid("control_loop.tick_hz must be at least 10");
        }
        if !(self.load.max_power_watts > 0.0) {
            return invalid("load.max_power_watts must be > 0");
        }
        Ok(())
    }
}

/// Load and validate config. A missing file yields the defaults.
pub fn load(path: &str) -> Result<TrainerConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(data) => {
            let cfg = serde_json::from_str::<TrainerConfig>(&data).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_string(),
                    source,
                }
            })?;
            info!("Loaded config from {}", path);
            cfg
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config {} not found, using defaults", path);
            TrainerConfig::default()
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_string(),
                source,
            })
        }
    };
    config.validate()?;
    Ok(config)
}
