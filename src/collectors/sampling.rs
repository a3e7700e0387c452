//! Bounded value sampling
//!
//! Fallback and synthetic values are drawn through the [`Sampler`] trait so
//! production code can use real randomness while tests pin the values.

use rand::Rng;

/// Inclusive range a sampled value must fall in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub low: f64,
    pub high: f64,
}

impl Bounds {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }

    /// Smallest and largest integer inside the range, if any
    fn integers(&self) -> Option<(f64, f64)> {
        let low = self.low.ceil();
        let high = self.high.floor();
        (low <= high).then_some((low, high))
    }
}

/// Decimal precision a value is published with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Integral values
    Whole,
    /// Rounded to this many decimal places
    Places(u32),
}

impl Precision {
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Precision::Whole => value.round(),
            Precision::Places(places) => {
                let factor = 10f64.powi(places as i32);
                (value * factor).round() / factor
            }
        }
    }
}

/// Source of bounded pseudo-random values
pub trait Sampler: Send + Sync {
    /// A real number within `bounds`
    fn uniform(&self, bounds: Bounds) -> f64;

    /// An integer within `bounds` (both ends inclusive). A range holding no
    /// integer yields a real number within `bounds` instead.
    fn integer(&self, bounds: Bounds) -> f64;

    /// A value within `bounds`, published with `precision`
    fn sample(&self, bounds: Bounds, precision: Precision) -> f64 {
        match precision {
            Precision::Whole => self.integer(bounds),
            Precision::Places(_) => {
                let value = precision.apply(self.uniform(bounds));
                value.clamp(bounds.low, bounds.high)
            }
        }
    }
}

/// Thread-local RNG backed sampler
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn uniform(&self, bounds: Bounds) -> f64 {
        if bounds.low >= bounds.high {
            return bounds.low;
        }
        rand::thread_rng().gen_range(bounds.low..=bounds.high)
    }

    fn integer(&self, bounds: Bounds) -> f64 {
        match bounds.integers() {
            Some((low, high)) if low < high => {
                rand::thread_rng().gen_range(low as i64..=high as i64) as f64
            }
            Some((low, _)) => low,
            None => self.uniform(bounds),
        }
    }
}

/// Deterministic sampler returning a fixed relative position in each range.
///
/// `position` 0.0 yields the lower bound, 1.0 the upper bound.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler {
    position: f64,
}

impl FixedSampler {
    pub fn new(position: f64) -> Self {
        Self {
            position: position.clamp(0.0, 1.0),
        }
    }

    /// Always the midpoint of the range
    pub fn midpoint() -> Self {
        Self::new(0.5)
    }
}

impl Sampler for FixedSampler {
    fn uniform(&self, bounds: Bounds) -> f64 {
        bounds.low + (bounds.high - bounds.low) * self.position
    }

    fn integer(&self, bounds: Bounds) -> f64 {
        match bounds.integers() {
            Some((low, high)) => (low + ((high - low) * self.position).round()).min(high),
            None => self.uniform(bounds),
        }
    }
}
