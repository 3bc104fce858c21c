//! Display units and measurement parsing
//!
//! Committed parameter values live in baseline units (millimeters). The
//! parameter machine converts to and from a display unit, and parses free
//! text entry including unit suffixes and vulgar fractions ("1 3/8 in").

use serde::{Deserialize, Serialize};

/// A display unit for length parameters. Baseline is millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Millimeters,
    Centimeters,
    Meters,
    Inches,
}

impl Unit {
    /// Millimeters per one of this unit.
    fn factor(self) -> f64 {
        match self {
            Unit::Millimeters => 1.0,
            Unit::Centimeters => 10.0,
            Unit::Meters => 1000.0,
            Unit::Inches => 25.4,
        }
    }

    /// Convert a value in this unit to baseline millimeters.
    pub fn to_baseline(self, value: f64) -> f64 {
        value * self.factor()
    }

    /// Convert a baseline millimeter value into this unit.
    pub fn from_baseline(self, value: f64) -> f64 {
        value / self.factor()
    }

    /// Recognized text suffixes for this unit.
    pub fn suffixes(self) -> &'static [&'static str] {
        match self {
            Unit::Millimeters => &["mm"],
            Unit::Centimeters => &["cm"],
            Unit::Meters => &["m"],
            Unit::Inches => &["in", "\"", "inch"],
        }
    }

    fn from_suffix(suffix: &str) -> Option<Unit> {
        let suffix = suffix.trim();
        for unit in [Unit::Millimeters, Unit::Centimeters, Unit::Inches, Unit::Meters] {
            if unit.suffixes().iter().any(|s| *s == suffix) {
                return Some(unit);
            }
        }
        None
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Unit::Millimeters => "mm",
            Unit::Centimeters => "cm",
            Unit::Meters => "m",
            Unit::Inches => "in",
        };
        write!(f, "{label}")
    }
}

/// Parse a measurement from free text: a number, an optional vulgar
/// fraction, and an optional unit suffix.
///
/// Accepted forms include `12`, `12.5`, `25.4mm`, `1 3/8 in`, `3/4"`,
/// `-2.5 cm`. Returns the numeric value and the explicit unit, if one was
/// written. Returns `None` for text that does not parse.
pub fn parse_measurement(input: &str) -> Option<(f64, Option<Unit>)> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Split the trailing unit suffix, if any.
    let (body, unit) = split_unit_suffix(trimmed);
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    let (negative, body) = match body.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, body),
    };

    let magnitude = parse_magnitude(body)?;
    let value = if negative { -magnitude } else { magnitude };
    Some((value, unit))
}

/// Parse `N`, `N/D`, or `W N/D` (whole plus fraction).
fn parse_magnitude(body: &str) -> Option<f64> {
    let parts: Vec<&str> = body.split_whitespace().collect();
    match parts.as_slice() {
        [single] => {
            if let Some(frac) = parse_fraction(single) {
                Some(frac)
            } else {
                single.parse().ok()
            }
        }
        [whole, frac] => {
            let whole: f64 = whole.parse().ok()?;
            let frac = parse_fraction(frac)?;
            Some(whole + frac)
        }
        _ => None,
    }
}

fn parse_fraction(text: &str) -> Option<f64> {
    let (num, den) = text.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

fn split_unit_suffix(text: &str) -> (&str, Option<Unit>) {
    // Longest suffixes first so "inch" is not cut to "in" + leftover.
    for suffix in ["inch", "mm", "cm", "in", "m", "\""] {
        if let Some(body) = text.strip_suffix(suffix) {
            // Skip suffixes that leave no numeric body behind.
            if body.trim().is_empty() {
                continue;
            }
            if let Some(unit) = Unit::from_suffix(suffix) {
                return (body, Some(unit));
            }
        }
    }
    (text, None)
}
