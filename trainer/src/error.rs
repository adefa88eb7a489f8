//! Error types shared across the trainer core.

use thiserror::Error;

/// Configuration could not be loaded or is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// GPIO setup failures. Only produced when built with the `hardware` feature.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("gpio error: {0}")]
    Gpio(String),
}

/// Terminal motor faults. Cleared only by an explicit external reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize)]
pub enum FaultKind {
    #[error("stop trigger not seen before calibration timeout")]
    CalibrationTimeout,
    #[error("no motor pulses while driving (stall)")]
    MotorStall,
}
