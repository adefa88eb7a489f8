//! Virtual gear selection.

use crate::config::GearConfig;

/// Evenly spaced gear ratios from `min_ratio` (gear 1) to `max_ratio`.
#[derive(Debug, Clone)]
pub struct GearSelector {
    ratios: Vec<f64>,
    current: usize,
    min_ratio: f64,
    max_ratio: f64,
}

impl GearSelector {
    pub fn new(config: &GearConfig) -> Self {
        let count = usize::from(config.count.max(1));
        let ratios = if count == 1 {
            vec![config.min_ratio]
        } else {
            let step = (config.max_ratio - config.min_ratio) / (count - 1) as f64;
            (0..count)
                .map(|i| config.min_ratio + step * i as f64)
                .collect()
        };
        Self {
            ratios,
            current: 1,
            min_ratio: config.min_ratio,
            max_ratio: config.max_ratio,
        }
    }

    /// Currently selected gear, 1-based.
    pub fn gear(&self) -> u8 {
        self.current as u8
    }

    pub fn count(&self) -> u8 {
        self.ratios.len() as u8
    }

    pub fn ratio(&self) -> f64 {
        self.ratios[self.current - 1]
    }

    pub fn min_ratio(&self) -> f64 {
        self.min_ratio
    }

    pub fn max_ratio(&self) -> f64 {
        self.max_ratio
    }

    /// Returns false when already in the top gear.
    pub fn shift_up(&mut self) -> bool {
        if self.current < self.ratios.len() {
            self.current += 1;
            true
        } else {
            false
        }
    }

    /// Returns false when already in gear 1.
    pub fn shift_down(&mut self) -> bool {
        if self.current > 1 {
            self.current -= 1;
            true
        } else {
            false
        }
    }
}
