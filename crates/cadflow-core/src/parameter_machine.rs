//! Per-parameter interaction state
//!
//! One `ParameterMachine` per editable numeric parameter. It keeps the
//! committed value (baseline millimeters) apart from the local display
//! value (current display unit), reconciles slider / text / keyboard
//! input, guards against external-update feedback loops, and suppresses
//! commits within a floating-point epsilon of the last emission.
//!
//! Pure interaction state: never persisted, no async. Committed values
//! feed the CAD machine's parameter set through whatever channel the host
//! wires up.

use crate::units::{parse_measurement, Unit};

/// Commits within this distance of the last emitted value are suppressed.
pub const COMMIT_EPSILON: f64 = 1e-10;

/// Step floor so tiny defaults never produce a zero step.
const STEP_FLOOR: f64 = 1e-10;

/// Fallback half-range for zero defaults.
const ZERO_DEFAULT_BOUND: f64 = 100.0;

/// Slider step for a default value: the default's order of magnitude,
/// clamped to at most 1 with a small epsilon floor. Zero defaults use a
/// step of 1 to match the fixed fallback range.
pub fn slider_step(default: f64) -> f64 {
    if default == 0.0 {
        return 1.0;
    }
    let magnitude = 10f64.powf(default.abs().log10().floor());
    magnitude.clamp(STEP_FLOOR, 1.0)
}

/// Upper slider bound for a default value.
///
/// The tier boundary is the largest power of ten not exceeding the
/// default's magnitude. If doubling the default meets or exceeds the next
/// tier, the range expands to twice the next tier; otherwise it stops at
/// the next tier. Negative defaults mirror the rule (their upper bound is
/// zero); zero defaults get the fixed symmetric fallback.
pub fn slider_max(default: f64) -> f64 {
    if default == 0.0 {
        return ZERO_DEFAULT_BOUND;
    }
    if default < 0.0 {
        return 0.0;
    }
    expanded_bound(default)
}

/// Lower slider bound for a default value. Zero for positive defaults,
/// the mirrored expanded bound for negative ones.
pub fn slider_min(default: f64) -> f64 {
    if default == 0.0 {
        return -ZERO_DEFAULT_BOUND;
    }
    if default < 0.0 {
        return -expanded_bound(-default);
    }
    0.0
}

fn expanded_bound(positive_default: f64) -> f64 {
    let tier = 10f64.powf(positive_default.log10().floor());
    let next_tier = tier * 10.0;
    if positive_default * 2.0 >= next_tier {
        next_tier * 2.0
    } else {
        next_tier
    }
}

/// Computed slider range in display units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Static configuration of one parameter widget.
#[derive(Debug, Clone)]
pub struct ParameterConfig {
    pub name: String,
    /// Default value in baseline millimeters
    pub default: f64,
    /// Explicit range overrides (baseline millimeters)
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    /// Commit on every slider tick instead of on release
    pub continuous_commit: bool,
    /// Initial display unit
    pub unit: Unit,
}

impl ParameterConfig {
    pub fn new(name: impl Into<String>, default: f64) -> Self {
        Self {
            name: name.into(),
            default,
            min: None,
            max: None,
            step: None,
            continuous_commit: false,
            unit: Unit::Millimeters,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_continuous_commit(mut self, continuous: bool) -> Self {
        self.continuous_commit = continuous;
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>, step: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self.step = step;
        self
    }
}

/// Interaction state machine for one parameter.
#[derive(Debug)]
pub struct ParameterMachine {
    config: ParameterConfig,
    /// Committed value, baseline millimeters
    committed: f64,
    /// Local display value, in `unit`
    local: f64,
    /// Last value actually emitted upward (baseline)
    last_emitted: Option<f64>,
    unit: Unit,
    range: SliderRange,
    focused: bool,
    dragging: bool,
}

impl ParameterMachine {
    pub fn new(config: ParameterConfig) -> Self {
        let unit = config.unit;
        let committed = config.default;
        let range = compute_range(&config, unit);
        Self {
            local: unit.from_baseline(committed),
            committed,
            last_emitted: None,
            unit,
            range,
            focused: false,
            dragging: false,
            config,
        }
    }

    /// Committed value in baseline millimeters.
    pub fn committed(&self) -> f64 {
        self.committed
    }

    /// Current local display value.
    pub fn local(&self) -> f64 {
        self.local
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn range(&self) -> SliderRange {
        self.range
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Switch the display unit, recomputing the local value and range.
    pub fn set_unit(&mut self, unit: Unit) {
        self.unit = unit;
        self.local = unit.from_baseline(self.committed);
        self.range = compute_range(&self.config, unit);
    }

    /// Replace the default (baseline), recomputing the range. The committed
    /// value is untouched; only the slider geometry changes.
    pub fn set_default(&mut self, default: f64) {
        self.config.default = default;
        self.range = compute_range(&self.config, self.unit);
    }

    /// Replace explicit range overrides (baseline), recomputing the range.
    pub fn set_explicit_range(&mut self, min: Option<f64>, max: Option<f64>, step: Option<f64>) {
        self.config.min = min;
        self.config.max = max;
        self.config.step = step;
        self.range = compute_range(&self.config, self.unit);
    }

    pub fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    /// Slider moved to `value` (display units). In continuous-commit mode
    /// every tick may emit; otherwise commits wait for release.
    pub fn slider_changed(&mut self, value: f64) -> Option<f64> {
        self.dragging = true;
        self.local = value;
        if self.config.continuous_commit {
            self.try_commit()
        } else {
            None
        }
    }

    /// Slider released: commit the final value.
    pub fn slider_released(&mut self) -> Option<f64> {
        self.dragging = false;
        self.try_commit()
    }

    /// Text entry submitted. Accepts unit suffixes and fractions; an
    /// explicit suffix overrides the display unit for this entry. Returns
    /// the emitted baseline value, if any. Unparseable text reverts the
    /// local value to the committed one.
    pub fn text_submitted(&mut self, text: &str) -> Option<f64> {
        match parse_measurement(text) {
            Some((value, explicit_unit)) => {
                let entry_unit = explicit_unit.unwrap_or(self.unit);
                let baseline = entry_unit.to_baseline(value);
                self.local = self.unit.from_baseline(baseline);
                self.try_commit()
            }
            None => {
                self.local = self.unit.from_baseline(self.committed);
                None
            }
        }
    }

    /// Arrow-key nudge: one step per press, ten steps while the modifier
    /// is held. Keyboard input commits immediately.
    pub fn key_nudge(&mut self, direction: i8, accelerated: bool) -> Option<f64> {
        let factor = if accelerated { 10.0 } else { 1.0 };
        self.local += self.range.step * factor * f64::from(direction.signum());
        self.try_commit()
    }

    /// External value change (baseline), e.g. another client editing the
    /// same parameter. Accepted only while the widget is neither focused
    /// nor mid-drag; returns whether it was applied.
    pub fn external_update(&mut self, baseline: f64) -> bool {
        if self.focused || self.dragging {
            return false;
        }
        self.committed = baseline;
        self.last_emitted = Some(baseline);
        self.local = self.unit.from_baseline(baseline);
        true
    }

    /// Commit the local value if it moved more than the epsilon from the
    /// last emission. Returns the baseline value to send upward, if any.
    fn try_commit(&mut self) -> Option<f64> {
        let baseline = self.unit.to_baseline(self.local);
        if let Some(last) = self.last_emitted {
            if (baseline - last).abs() <= COMMIT_EPSILON {
                return None;
            }
        }
        self.committed = baseline;
        self.last_emitted = Some(baseline);
        Some(baseline)
    }
}

/// Derive the slider range in display units: explicit overrides first,
/// heuristics from the default otherwise.
fn compute_range(config: &ParameterConfig, unit: Unit) -> SliderRange {
    let display_default = unit.from_baseline(config.default);
    SliderRange {
        min: config
            .min
            .map(|m| unit.from_baseline(m))
            .unwrap_or_else(|| slider_min(display_default)),
        max: config
            .max
            .map(|m| unit.from_baseline(m))
            .unwrap_or_else(|| slider_max(display_default)),
        step: config
            .step
            .map(|s| unit.from_baseline(s))
            .unwrap_or_else(|| slider_step(display_default)),
    }
}
