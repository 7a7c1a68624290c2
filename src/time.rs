//! Time resolution and unit handling.
//!
//! The [`TimeLord`] owns the base tick period for a run and converts
//! human-readable quantities ("1ns", "2.5GHz", "500 ps") into integer tick
//! factors. Floating point appears only here, at parse time; every
//! downstream scheduling computation is integer arithmetic on ticks.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SimTime;

/// Errors from parsing time or frequency specifications.
#[derive(Debug, Error)]
pub enum TimeError {
    #[error("empty time specification")]
    Empty,

    #[error("malformed quantity in \"{0}\"")]
    BadNumber(String),

    #[error("unknown unit \"{unit}\" in \"{spec}\"")]
    UnknownUnit { spec: String, unit: String },

    #[error("\"{0}\" is finer than the base tick period")]
    BelowResolution(String),

    #[error("zero or negative quantity in \"{0}\"")]
    NonPositive(String),
}

/// A parsed physical time quantity, in femtoseconds.
///
/// Frequencies are normalized to their period at parse time, so "2GHz"
/// and "500ps" parse to the same quantity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeQuantity {
    pub femtoseconds: f64,
}

impl TimeQuantity {
    /// Parses a value-with-unit string. Accepted units are SI time units
    /// (`s` down to `fs`) and SI frequencies (`Hz` up to `THz`); whitespace
    /// between value and unit is allowed.
    pub fn parse(spec: &str) -> Result<Self, TimeError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(TimeError::Empty);
        }

        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| TimeError::UnknownUnit {
                spec: spec.to_string(),
                unit: String::new(),
            })?;
        let (num_part, unit_part) = trimmed.split_at(split);
        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| TimeError::BadNumber(spec.to_string()))?;
        if value <= 0.0 {
            return Err(TimeError::NonPositive(spec.to_string()));
        }

        let unit = unit_part.trim();
        let femtoseconds = match unit {
            "s" => value * 1e15,
            "ms" => value * 1e12,
            "us" => value * 1e9,
            "ns" => value * 1e6,
            "ps" => value * 1e3,
            "fs" => value,
            "Hz" | "hz" => 1e15 / value,
            "kHz" | "KHz" | "khz" => 1e12 / value,
            "MHz" | "mhz" => 1e9 / value,
            "GHz" | "ghz" => 1e6 / value,
            "THz" | "thz" => 1e3 / value,
            other => {
                return Err(TimeError::UnknownUnit {
                    spec: spec.to_string(),
                    unit: other.to_string(),
                })
            }
        };

        Ok(Self { femtoseconds })
    }

    /// True if the spec denotes a frequency rather than a period.
    pub fn is_frequency(spec: &str) -> bool {
        let s = spec.trim();
        s.ends_with("Hz") || s.ends_with("hz")
    }
}

/// An immutable handle mapping a user rate or period to an integer tick
/// factor.
///
/// `factor` is the number of base ticks in one user interval: a converter
/// for "10ns" against a "1ns" base has `factor == 10`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConverter {
    factor: SimTime,
}

impl TimeConverter {
    pub(crate) fn new(factor: SimTime) -> Self {
        debug_assert!(factor > 0);
        Self { factor }
    }

    /// Ticks per user interval.
    pub fn factor(&self) -> SimTime {
        self.factor
    }

    /// Converts a count of user intervals to core ticks.
    pub fn to_core_time(&self, user: SimTime) -> SimTime {
        user * self.factor
    }

    /// Converts core ticks to whole user intervals (truncating).
    pub fn from_core_time(&self, core: SimTime) -> SimTime {
        core / self.factor
    }
}

/// Owner of the base tick period; issues [`TimeConverter`]s.
///
/// One `TimeLord` exists per simulation. Converters are cached by their
/// source string so repeated registrations of the same clock rate share a
/// factor.
#[derive(Debug)]
pub struct TimeLord {
    base_fs: f64,
    base_spec: String,
    cache: Mutex<HashMap<String, TimeConverter>>,
}

impl TimeLord {
    /// Creates a time lord with the given base period, e.g. "1ps".
    pub fn new(base: &str) -> Result<Self, TimeError> {
        let q = TimeQuantity::parse(base)?;
        Ok(Self {
            base_fs: q.femtoseconds,
            base_spec: base.trim().to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The configured base period string.
    pub fn base_spec(&self) -> &str {
        &self.base_spec
    }

    /// The base period in femtoseconds.
    pub fn base_femtoseconds(&self) -> f64 {
        self.base_fs
    }

    /// Returns a converter for the given period or frequency spec.
    ///
    /// The factor is the spec's period divided by the base period, rounded
    /// to the nearest tick; specs finer than the base period are an error.
    pub fn converter(&self, spec: &str) -> Result<TimeConverter, TimeError> {
        if let Some(tc) = self.cache.lock().get(spec) {
            return Ok(*tc);
        }
        let q = TimeQuantity::parse(spec)?;
        let factor = (q.femtoseconds / self.base_fs).round();
        if factor < 1.0 {
            return Err(TimeError::BelowResolution(spec.to_string()));
        }
        let tc = TimeConverter::new(factor as SimTime);
        self.cache.lock().insert(spec.to_string(), tc);
        Ok(tc)
    }

    /// Parses a spec directly to a tick count (period / base period).
    pub fn to_ticks(&self, spec: &str) -> Result<SimTime, TimeError> {
        Ok(self.converter(spec)?.factor())
    }
}
