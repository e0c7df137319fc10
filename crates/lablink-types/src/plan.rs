//! Measurement plans driving the detuning scan sequencer.
//!
//! A plan is an ordered list of `{offset, duration}` entries. Plans arrive
//! from callers as untyped JSON (either an array or a string holding one), so
//! parsing is done field by field to report *which* entry is malformed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LabError;

/// One step of a scan: detune by `offset` Hz and record for `duration` units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub offset: f64,
    pub duration: f64,
}

/// Ordered sequence of [`PlanEntry`] values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementPlan {
    pub entries: Vec<PlanEntry>,
}

impl MeasurementPlan {
    pub fn new(entries: Vec<PlanEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a plan from a JSON array, or from a JSON string containing one.
    ///
    /// Every entry must be an object with numeric `offset` and `duration`.
    pub fn from_value(value: &Value) -> Result<Self, LabError> {
        let parsed;
        let value = match value {
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(text)
                    .map_err(|e| LabError::InvalidPlan(format!("plan is not valid JSON: {e}")))?;
                &parsed
            }
            other => other,
        };
        let items = value
            .as_array()
            .ok_or_else(|| LabError::InvalidPlan("plan must be a list of entries".into()))?;

        let entries = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let field = |name: &str| {
                    item.get(name).and_then(Value::as_f64).ok_or_else(|| {
                        LabError::InvalidPlan(format!("entry {i} has no numeric '{name}'"))
                    })
                };
                Ok(PlanEntry {
                    offset: field("offset")?,
                    duration: field("duration")?,
                })
            })
            .collect::<Result<Vec<_>, LabError>>()?;
        Ok(Self { entries })
    }

    /// Check every entry against `max_abs_offset` and a positive duration.
    pub fn validate(&self, max_abs_offset: f64) -> Result<(), LabError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if !(entry.duration.is_finite() && entry.duration > 0.0) {
                return Err(LabError::out_of_range(
                    format!("entry {i} duration"),
                    entry.duration,
                    f64::MIN_POSITIVE,
                    f64::INFINITY,
                ));
            }
            if !(entry.offset.is_finite() && entry.offset.abs() <= max_abs_offset) {
                return Err(LabError::out_of_range(
                    format!("entry {i} offset"),
                    entry.offset,
                    -max_abs_offset,
                    max_abs_offset,
                ));
            }
        }
        Ok(())
    }

    /// Absolute targets `base + offset`, in plan order.
    pub fn targets(&self, base: f64) -> Vec<f64> {
        self.entries.iter().map(|e| base + e.offset).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_array_and_string_forms() -> Result<(), Box<dyn std::error::Error>> {
        let from_array = MeasurementPlan::from_value(&json!([
            {"offset": 1e6, "duration": 1},
            {"offset": -2e6, "duration": 2}
        ]))?;
        let from_string = MeasurementPlan::from_value(&json!(
            r#"[{"offset": 1000000, "duration": 1}, {"offset": -2000000, "duration": 2}]"#
        ))?;
        assert_eq!(from_array, from_string);
        assert_eq!(from_array.targets(9e9), vec![9.001e9, 8.998e9]);
        Ok(())
    }

    #[test]
    fn missing_or_non_numeric_fields_are_rejected() {
        let err = MeasurementPlan::from_value(&json!([{"offset": 1.0}])).unwrap_err();
        assert!(matches!(err, LabError::InvalidPlan(ref m) if m.contains("duration")));

        let err =
            MeasurementPlan::from_value(&json!([{"offset": "1e6", "duration": 1}])).unwrap_err();
        assert!(matches!(err, LabError::InvalidPlan(ref m) if m.contains("offset")));

        assert!(MeasurementPlan::from_value(&json!({"offset": 1})).is_err());
        assert!(MeasurementPlan::from_value(&json!("not json")).is_err());
    }

    #[test]
    fn validate_bounds() {
        let ok = MeasurementPlan::new(vec![PlanEntry { offset: 10e6, duration: 0.5 }]);
        assert!(ok.validate(10e6).is_ok());

        let zero = MeasurementPlan::new(vec![
            PlanEntry { offset: 0.0, duration: 1.0 },
            PlanEntry { offset: 0.0, duration: 0.0 },
        ]);
        assert!(matches!(
            zero.validate(10e6),
            Err(LabError::OutOfRange { ref quantity, .. }) if quantity == "entry 1 duration"
        ));

        let wide = MeasurementPlan::new(vec![PlanEntry { offset: -10.5e6, duration: 1.0 }]);
        assert!(matches!(wide.validate(10e6), Err(LabError::OutOfRange { .. })));
    }

    #[test]
    fn plan_serializes_as_plain_list() {
        let plan = MeasurementPlan::new(vec![PlanEntry { offset: 1.0, duration: 2.0 }]);
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json, json!([{"offset": 1.0, "duration": 2.0}]));
    }
}
