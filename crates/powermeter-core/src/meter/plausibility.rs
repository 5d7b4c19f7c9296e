//! Plausibility filter
//!
//! Post-decode correction of values no real installation of this meter family
//! produces. Every adjustment is recorded on the reading as a [`Correction`]
//! and logged, so a bad decode is never hidden silently.
//!
//! Order: system power, system energy, each phase's power then energy,
//! frequency last.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::reading::{Correction, CorrectionKind, DetailedReading, Reading};

/// Thresholds for the filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlausibilityLimits {
    /// System active power ceiling in kW
    pub system_power_kw_max: f64,
    /// Per-phase active power ceiling in kW
    pub phase_power_kw_max: f64,
    /// Divisor applied to power above its ceiling
    pub power_divisor: f64,
    /// Active energy ceiling in kWh
    pub energy_kwh_max: f64,
    /// Divisor applied to energy above its ceiling
    pub energy_divisor: f64,
    /// Lowest plausible line frequency in Hz
    pub frequency_min: f64,
    /// Highest plausible line frequency in Hz
    pub frequency_max: f64,
}

impl Default for PlausibilityLimits {
    fn default() -> Self {
        Self {
            system_power_kw_max: 10_000.0,
            phase_power_kw_max: 5_000.0,
            power_divisor: 10.0,
            energy_kwh_max: 1e9,
            energy_divisor: 100.0,
            frequency_min: 45.0,
            frequency_max: 65.0,
        }
    }
}

/// Frequency recomputed from its raw register, if the raw value falls in a
/// known magnitude band
pub fn frequency_from_raw(raw: u16) -> Option<f64> {
    let raw = raw as f64;
    if raw > 550.0 && raw < 650.0 {
        Some(raw / 10.0)
    } else if raw > 5500.0 && raw < 6500.0 {
        Some(raw / 100.0)
    } else if raw > 10_000.0 {
        Some(raw / 200.0)
    } else {
        None
    }
}

/// The correction stage between decoding and publication
#[derive(Debug, Clone, Default)]
pub struct PlausibilityFilter {
    limits: PlausibilityLimits,
}

impl PlausibilityFilter {
    /// Filter applying `limits`
    pub fn new(limits: PlausibilityLimits) -> Self {
        Self { limits }
    }

    /// Thresholds in use
    pub fn limits(&self) -> &PlausibilityLimits {
        &self.limits
    }

    /// Correct `reading`, recording every change on it
    pub fn apply(&self, reading: Reading) -> Reading {
        match reading {
            Reading::Detailed(mut r) => {
                self.apply_detailed(&mut r);
                Reading::Detailed(r)
            }
            Reading::Basic(mut r) => {
                if let Some(c) = self.check_frequency(r.frequency, r.raw_values.frequency) {
                    r.frequency = c.after;
                    r.corrections.push(c);
                }
                Reading::Basic(r)
            }
        }
    }

    fn apply_detailed(&self, r: &mut DetailedReading) {
        let limits = &self.limits;
        let mut found = Vec::new();

        found.extend(ceiling(
            &mut r.system.power_kw,
            limits.system_power_kw_max,
            limits.power_divisor,
            CorrectionKind::PowerCeiling,
            "system.power_kw",
        ));
        found.extend(ceiling(
            &mut r.system.energy_kwh,
            limits.energy_kwh_max,
            limits.energy_divisor,
            CorrectionKind::EnergyCeiling,
            "system.energy_kwh",
        ));

        for (key, phase) in r.phases_mut() {
            found.extend(ceiling(
                &mut phase.power_kw,
                limits.phase_power_kw_max,
                limits.power_divisor,
                CorrectionKind::PowerCeiling,
                &format!("{}.power_kw", key),
            ));
            found.extend(ceiling(
                &mut phase.energy_kwh,
                limits.energy_kwh_max,
                limits.energy_divisor,
                CorrectionKind::EnergyCeiling,
                &format!("{}.energy_kwh", key),
            ));
        }

        if let Some(c) = self.check_frequency(r.frequency, r.raw_values.frequency) {
            r.frequency = c.after;
            found.push(c);
        }

        r.corrections.extend(found);
    }

    fn check_frequency(&self, frequency: f64, raw: u16) -> Option<Correction> {
        if frequency >= self.limits.frequency_min && frequency <= self.limits.frequency_max {
            return None;
        }
        match frequency_from_raw(raw) {
            Some(after) => {
                warn!(
                    "Frequency {:.3} Hz implausible, corrected to {:.3} Hz from raw {}",
                    frequency, after, raw
                );
                Some(Correction {
                    kind: CorrectionKind::FrequencyBand,
                    field: "frequency".to_string(),
                    before: frequency,
                    after,
                })
            }
            None => {
                warn!(
                    "Frequency {:.3} Hz implausible and raw {} fits no band, leaving it",
                    frequency, raw
                );
                None
            }
        }
    }
}

fn ceiling(
    value: &mut f64,
    max: f64,
    divisor: f64,
    kind: CorrectionKind,
    field: &str,
) -> Option<Correction> {
    if *value <= max {
        return None;
    }
    let before = *value;
    *value = before / divisor;
    warn!("{} = {} above {}, divided by {}", field, before, max, divisor);
    Some(Correction {
        kind,
        field: field.to_string(),
        before,
        after: *value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_bands() {
        assert_eq!(frequency_from_raw(600), Some(60.0));
        assert_eq!(frequency_from_raw(6000), Some(60.0));
        assert_eq!(frequency_from_raw(12000), Some(60.0));
        assert_eq!(frequency_from_raw(550), None);
        assert_eq!(frequency_from_raw(6500), None);
        assert_eq!(frequency_from_raw(10000), None);
        assert_eq!(frequency_from_raw(0), None);
    }

    #[test]
    fn test_ceiling_is_exclusive() {
        let mut v = 5000.0;
        assert!(ceiling(&mut v, 5000.0, 10.0, CorrectionKind::PowerCeiling, "p").is_none());
        assert_eq!(v, 5000.0);

        let mut v = 6000.0;
        let c = ceiling(&mut v, 5000.0, 10.0, CorrectionKind::PowerCeiling, "p").unwrap();
        assert_eq!(v, 600.0);
        assert_eq!(c.before, 6000.0);
        assert_eq!(c.after, 600.0);
    }
}
