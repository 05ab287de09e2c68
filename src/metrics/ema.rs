//! Exponential moving averages over the control loop's tick cadence.

#![allow(missing_docs)]

/// Single EMA whose alpha is derived from a smoothing period and step size.
///
/// `alpha = 2 / (n + 1)` where `n = period / step`, the classic span
/// formulation. The first finite sample seeds the average.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    #[must_use]
    pub fn new(period_sec: f64, step_sec: f64) -> Self {
        let n = (period_sec / step_sec.max(0.1)).max(1.0);
        Self {
            alpha: 2.0 / (n + 1.0),
            value: None,
        }
    }

    /// Fold in a new observation; non-finite inputs are ignored.
    pub fn update(&mut self, x: f64) -> Option<f64> {
        if !x.is_finite() {
            return self.value;
        }
        self.value = Some(match self.value {
            None => x,
            Some(prev) => self.alpha.mul_add(x - prev, prev),
        });
        self.value
    }

    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// The four smoothed series the coordinator steers by.
#[derive(Debug, Clone)]
pub struct EmaSet {
    pub cpu: Ema,
    pub mem: Ema,
    pub net: Ema,
    pub load: Ema,
}

impl EmaSet {
    #[must_use]
    pub fn new(period_sec: f64, step_sec: f64) -> Self {
        Self {
            cpu: Ema::new(period_sec, step_sec),
            mem: Ema::new(period_sec, step_sec),
            net: Ema::new(period_sec, step_sec),
            load: Ema::new(period_sec, step_sec),
        }
    }
}
