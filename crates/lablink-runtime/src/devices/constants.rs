//! Experiment-wide calibration constants.
//!
//! `set(name, value)` matches `name` against the camelCase field names
//! ignoring case and underscores, so `heterodyne_frequency` and
//! `HeterodyneFrequency` both address `heterodyneFrequency`. The settings
//! blob is the whole status and replaces it wholesale on load.

use async_trait::async_trait;
use lablink_types::{ConstantsStatus, LabError};
use serde_json::Value;
use tracing::info;

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

#[derive(Default)]
pub struct ConstantsDevice {
    constants: ConstantsStatus,
}

fn normalise(name: &str) -> String {
    name.chars().filter(|c| *c != '_').flat_map(char::to_lowercase).collect()
}

impl ConstantsDevice {
    pub fn new(constants: ConstantsStatus) -> Self {
        Self { constants }
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<(), LabError> {
        if !value.is_finite() {
            return Err(LabError::InvalidArguments(format!("{name} must be finite")));
        }
        let mut fields = match serde_json::to_value(&self.constants)? {
            Value::Object(map) => map,
            _ => return Err(LabError::Serialization("constants are not an object".into())),
        };
        let wanted = normalise(name);
        let key = fields
            .keys()
            .find(|k| normalise(k) == wanted)
            .cloned()
            .ok_or_else(|| LabError::InvalidArguments(format!("unknown constant '{name}'")))?;
        fields.insert(key.clone(), value.into());
        self.constants = serde_json::from_value(Value::Object(fields))?;
        info!(constant = %key, value, "constant updated");
        Ok(())
    }
}

#[async_trait]
impl Device for ConstantsDevice {
    fn kind(&self) -> &'static str {
        "constants"
    }

    fn status(&self) -> Value {
        to_status(&self.constants)
    }

    async fn call(&mut self, _ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        match call.method.as_str() {
            "set" => {
                self.set(call.args.str(0)?, call.args.f64(1)?)?;
                Ok(Value::Null)
            }
            "get_state" => Ok(self.status()),
            _ => Err(call.unknown()),
        }
    }

    fn settings(&self) -> Option<Value> {
        Some(self.status())
    }

    fn load_settings(&mut self, settings: Value) -> Result<(), LabError> {
        self.constants = serde_json::from_value(settings)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_match_loosely() -> Result<(), LabError> {
        let mut device = ConstantsDevice::default();
        device.set("HeterodyneFrequency", 2.5e6)?;
        device.set("tweezer_qwp_offset", 1.5)?;
        assert_eq!(device.constants.heterodyne_frequency, 2.5e6);
        assert_eq!(device.constants.tweezer_qwp_offset, 1.5);
        assert!(matches!(device.set("warpFactor", 9.0), Err(LabError::InvalidArguments(_))));
        assert!(matches!(device.set("tweezerHwpOffset", f64::NAN), Err(LabError::InvalidArguments(_))));
        Ok(())
    }

    #[test]
    fn settings_replace_wholesale() -> Result<(), Box<dyn std::error::Error>> {
        let mut device = ConstantsDevice::default();
        device.set("cavityDetuningGeneratorOffset", 9e9)?;
        let saved = device.settings().ok_or("no settings")?;

        let mut fresh = ConstantsDevice::default();
        fresh.load_settings(saved.clone())?;
        assert_eq!(fresh.settings(), Some(saved));
        assert!(fresh.load_settings(json!({"heterodyneFrequency": "fast"})).is_err());
        Ok(())
    }
}
