//! Descriptive statistics over probe readings.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoreError, CoreResult};

/// Summary of a numeric sample set.
///
/// `stdev` is the sample standard deviation and is `NaN` for a single
/// sample. A `NaN` serializes as JSON `null` and reads back as `NaN`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Describe {
    pub mean: f64,
    pub minimum: f64,
    pub maximum: f64,
    #[serde(deserialize_with = "nan_from_null")]
    pub stdev: f64,
}

impl Describe {
    /// All-zero summary, used as the starting value of a fold.
    pub const ZERO: Describe = Describe {
        mean: 0.0,
        minimum: 0.0,
        maximum: 0.0,
        stdev: 0.0,
    };

    /// Apply `f` to every field.
    pub fn map(self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            mean: f(self.mean),
            minimum: f(self.minimum),
            maximum: f(self.maximum),
            stdev: f(self.stdev),
        }
    }

    /// Combine two summaries field by field.
    pub fn zip(self, other: Describe, f: impl Fn(f64, f64) -> f64) -> Self {
        Self {
            mean: f(self.mean, other.mean),
            minimum: f(self.minimum, other.minimum),
            maximum: f(self.maximum, other.maximum),
            stdev: f(self.stdev, other.stdev),
        }
    }

    /// Whether the sample set had a single value (stdev undefined).
    pub fn is_degenerate(&self) -> bool {
        self.stdev.is_nan()
    }
}

/// Compute mean, minimum, maximum and sample standard deviation.
///
/// The deviation divides by `n - 1`, so a single sample yields `NaN`.
pub fn describe(samples: &[f64]) -> CoreResult<Describe> {
    if samples.is_empty() {
        return Err(CoreError::EmptySamples);
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let minimum = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let maximum = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let squares: f64 = samples.iter().map(|x| (x - mean).powi(2)).sum();
    let stdev = (squares / (n - 1.0)).sqrt();

    Ok(Describe {
        mean,
        minimum,
        maximum,
        stdev,
    })
}

/// Trailing moving average of `window` ticks ending at `index`.
///
/// `current` stands in for the value at `index`; the remaining
/// `window - 1` values come from `prior`, whose index is clamped at 0 so
/// the start of a history repeats its first reading.
pub fn moving_average<F>(current: f64, index: usize, window: usize, prior: F) -> f64
where
    F: Fn(usize) -> f64,
{
    let window = window.max(1);
    let sum = (1..window)
        .map(|back| prior(index.saturating_sub(back)))
        .fold(current, |acc, v| acc + v);
    sum / window as f64
}

fn nan_from_null<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.unwrap_or(f64::NAN))
}
