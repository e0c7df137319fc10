//! The Device Instance contract.
//!
//! Every instrument and every control loop implements [`Device`]. The
//! runtime owns each instance behind its own async mutex, so a device never
//! sees its handlers and its loop step run at the same time; each discrete
//! step still has to leave channel state consistent because handlers and loop
//! steps of the same device interleave between steps.
//!
//! | Hook | Called |
//! |---|---|
//! | [`Device::initialize`] | Once, at registration (channel enumeration) |
//! | [`Device::call`] | For every routed `action` / `request` |
//! | [`Device::poll`] | Repeatedly, while the runtime is running |
//! | [`Device::teardown`] | Once, when the loop exits |
//! | [`Device::settings`] / [`Device::load_settings`] | Save / restore |
//! | [`Device::on_save_snapshot`] | Compact projection for audit logs |

use std::time::Duration;

use async_trait::async_trait;
use lablink_types::{LabError, MoveMode};
use serde::Serialize;
use serde_json::Value;

use crate::context::DeviceContext;

/// Loop cadence used when a device does not say otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Device trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Device: Send + 'static {
    /// Short kind tag, e.g. `"stage"` or `"polarization-lock"`.
    fn kind(&self) -> &'static str;

    /// Current status, serialized from the device's typed status struct.
    fn status(&self) -> Value;

    /// Read or default every channel once.
    async fn initialize(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        Ok(())
    }

    /// Dispatch a routed call to the matching handler.
    ///
    /// Unknown methods must fail with [`LabError::UnknownMethod`].
    async fn call(&mut self, ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError>;

    /// Loop cadence, or `None` for devices without a loop.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// One loop step. Returns how long to wait before the next step.
    async fn poll(&mut self, _ctx: &DeviceContext) -> Result<Duration, LabError> {
        Ok(self.poll_interval().unwrap_or(DEFAULT_POLL_INTERVAL))
    }

    /// Release the backend and undo anything left half-done.
    async fn teardown(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        Ok(())
    }

    /// Settings blob to persist, or `None` when the device has nothing to save.
    fn settings(&self) -> Option<Value> {
        None
    }

    /// Replace internal state wholesale from a blob produced by
    /// [`Device::settings`].
    fn load_settings(&mut self, _settings: Value) -> Result<(), LabError> {
        Ok(())
    }

    /// Compact, human-auditable projection of the current channel values.
    fn on_save_snapshot(&self) -> Option<Value> {
        None
    }
}

/// Serialize a typed status struct for [`Device::status`].
pub fn to_status<T: Serialize>(status: &T) -> Value {
    serde_json::to_value(status).unwrap_or(Value::Null)
}

// ─────────────────────────────────────────────────────────────────────────────
// Routed calls
// ─────────────────────────────────────────────────────────────────────────────

/// A cross-device call addressed by `(device, channel, method, args)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCall {
    pub device: String,
    /// Optional named sub-target. The bundled devices address channels
    /// through `args` and ignore it.
    pub channel: Option<String>,
    pub method: String,
    pub args: Args,
}

impl DeviceCall {
    pub fn new(device: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            device: device.into(),
            channel: None,
            method: method.into(),
            args: Args(args),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Error for a method the addressed device does not implement.
    pub fn unknown(&self) -> LabError {
        LabError::UnknownMethod {
            device: self.device.clone(),
            method: self.method.clone(),
        }
    }
}

/// Positional call arguments with typed accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(pub Vec<Value>);

impl Args {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx).filter(|v| !v.is_null())
    }

    fn required(&self, idx: usize, what: &str) -> Result<&Value, LabError> {
        self.get(idx)
            .ok_or_else(|| LabError::InvalidArguments(format!("missing argument {idx} ({what})")))
    }

    fn mismatch(idx: usize, what: &str, value: &Value) -> LabError {
        LabError::InvalidArguments(format!("argument {idx} must be {what}, got {value}"))
    }

    /// A channel index. Kept signed so negative indices reach the channel
    /// check and fail as `InvalidChannel`.
    pub fn index(&self, idx: usize) -> Result<i64, LabError> {
        let value = self.required(idx, "an integer")?;
        value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| Self::mismatch(idx, "an integer", value))
    }

    pub fn f64(&self, idx: usize) -> Result<f64, LabError> {
        let value = self.required(idx, "a number")?;
        value.as_f64().ok_or_else(|| Self::mismatch(idx, "a number", value))
    }

    pub fn bool(&self, idx: usize) -> Result<bool, LabError> {
        let value = self.required(idx, "a boolean")?;
        value.as_bool().ok_or_else(|| Self::mismatch(idx, "a boolean", value))
    }

    pub fn str(&self, idx: usize) -> Result<&str, LabError> {
        let value = self.required(idx, "a string")?;
        value.as_str().ok_or_else(|| Self::mismatch(idx, "a string", value))
    }

    pub fn value(&self, idx: usize) -> Result<&Value, LabError> {
        self.required(idx, "a value")
    }

    pub fn mode(&self, idx: usize) -> Result<MoveMode, LabError> {
        let text = self.str(idx)?;
        MoveMode::parse(text)
            .ok_or_else(|| LabError::InvalidArguments(format!("argument {idx}: unknown mode '{text}'")))
    }

    /// A mode the caller may leave out (absent or `null`).
    pub fn opt_mode(&self, idx: usize) -> Result<Option<MoveMode>, LabError> {
        match self.get(idx) {
            None => Ok(None),
            Some(_) => self.mode(idx).map(Some),
        }
    }

    pub fn opt_index(&self, idx: usize) -> Result<Option<i64>, LabError> {
        match self.get(idx) {
            None => Ok(None),
            Some(_) => self.index(idx).map(Some),
        }
    }

    pub fn opt_f64(&self, idx: usize) -> Result<Option<f64>, LabError> {
        match self.get(idx) {
            None => Ok(None),
            Some(_) => self.f64(idx).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors() -> Result<(), LabError> {
        let args = Args(vec![json!(2), json!(1.5), json!("scan"), json!(true), json!(null)]);
        assert_eq!(args.index(0)?, 2);
        assert_eq!(args.f64(1)?, 1.5);
        assert_eq!(args.f64(0)?, 2.0);
        assert_eq!(args.mode(2)?, MoveMode::Scan);
        assert!(args.bool(3)?);
        assert_eq!(args.opt_mode(4)?, None);
        assert_eq!(args.opt_mode(9)?, None);
        Ok(())
    }

    #[test]
    fn accessor_errors_name_the_argument() {
        let args = Args(vec![json!("x"), json!(1.5)]);
        assert!(matches!(args.f64(0), Err(LabError::InvalidArguments(ref m)) if m.contains("argument 0")));
        assert!(matches!(args.index(1), Err(LabError::InvalidArguments(_))));
        assert!(matches!(args.str(5), Err(LabError::InvalidArguments(ref m)) if m.contains("missing")));
        assert!(matches!(args.mode(0), Err(LabError::InvalidArguments(ref m)) if m.contains("unknown mode")));
    }

    #[test]
    fn negative_index_survives_parsing() -> Result<(), LabError> {
        let args = Args(vec![json!(-1)]);
        assert_eq!(args.index(0)?, -1);
        Ok(())
    }

    #[test]
    fn unknown_method_error_names_device() {
        let call = DeviceCall::new("rf", "warp", vec![]).with_channel("ch0");
        assert_eq!(call.channel.as_deref(), Some("ch0"));
        assert_eq!(
            call.unknown(),
            LabError::UnknownMethod {
                device: "rf".into(),
                method: "warp".into()
            }
        );
    }
}
