//! Load model: (gear ratio, incline) → quantized load percentage.
//!
//! First gear on the flat is 50%. The gear range adds up to +25, the incline
//! adds ±25 at ±100% grade, and the sum is clamped to 0..=100 and rounded to
//! the nearest 5%.

/// Load granularity in percent.
pub const LOAD_STEP: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
pub struct LoadModel {
    min_ratio: f64,
    max_ratio: f64,
}

impl LoadModel {
    pub fn new(min_ratio: f64, max_ratio: f64) -> Self {
        Self {
            min_ratio,
            max_ratio,
        }
    }

    /// 50 at `min_ratio`, 75 at `max_ratio`, linear in between.
    pub fn base_load(&self, ratio: f64) -> f64 {
        let normalized = if self.max_ratio > self.min_ratio {
            ((ratio - self.min_ratio) / (self.max_ratio - self.min_ratio)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        50.0 + normalized * 25.0
    }

    pub fn incline_adjustment(incline_percent: f64) -> f64 {
        incline_percent / 100.0 * 25.0
    }

    /// Target load in percent, a multiple of 5 in 0..=100.
    pub fn target_load(&self, ratio: f64, incline_percent: f64) -> u8 {
        quantize(self.base_load(ratio) + Self::incline_adjustment(incline_percent))
    }
}

/// Clamp to 0..=100 and round to the nearest multiple of 5.
pub fn quantize(load_percent: f64) -> u8 {
    if load_percent.is_nan() {
        return 0;
    }
    let clamped = load_percent.clamp(0.0, 100.0);
    ((clamped / LOAD_STEP).round() * LOAD_STEP) as u8
}

/// Linear power → load estimate used for ERG-style power targets.
pub fn power_to_load(watts: f64, max_power_watts: f64) -> u8 {
    if max_power_watts <= 0.0 {
        return 0;
    }
    quantize(watts / max_power_watts * 100.0)
}
