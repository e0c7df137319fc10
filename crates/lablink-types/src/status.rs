//! Typed status payloads, one struct per device kind.
//!
//! The runtime stores every status as an opaque [`serde_json::Value`]; the
//! structs here are the schema consumers deserialize into on demand through
//! [`DeviceState::typed`]. Field names are camelCase on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{Channel, SyncState};
use crate::error::LabError;
use crate::plan::MeasurementPlan;

/// Read-only copy of a device's last published status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceState(pub Value);

impl DeviceState {
    /// Deserialize into the schema of the device kind the caller expects.
    pub fn typed<T: DeserializeOwned>(&self) -> Result<T, LabError> {
        T::deserialize(&self.0).map_err(LabError::from)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instruments
// ─────────────────────────────────────────────────────────────────────────────

/// Multi-axis positioner (linear stages, rotation mounts).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RfChannel {
    pub frequency: f64,
    pub power: f64,
    pub is_on: bool,
    #[serde(default)]
    pub sync: SyncState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RfSourceStatus {
    pub channels: Vec<RfChannel>,
}

/// Polarimeter reading. Angles are in radians as reported by the sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolarimeterStatus {
    pub status: String,
    #[serde(rename = "DOP")]
    pub dop: f64,
    pub theta: f64,
    pub eta: f64,
}

impl PolarimeterStatus {
    pub const OK: &'static str = "ok";

    pub fn is_ok(&self) -> bool {
        self.status == Self::OK
    }
}

impl Default for PolarimeterStatus {
    fn default() -> Self {
        Self {
            status: "no data".into(),
            dop: 0.0,
            theta: 0.0,
            eta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureChannel {
    pub pressure: Option<f64>,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureStatus {
    pub channels: Vec<PressureChannel>,
}

/// Heterodyne spectrum analyser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrumStatus {
    pub channel_count: usize,
    pub averaging_ms: u32,
    pub last_band_power: Option<f64>,
}

/// Data recorder: file naming and timed recordings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatus {
    pub save_directory: String,
    pub filename: String,
    pub is_recording: bool,
    pub recording_time_seconds: f64,
    pub planned_recording_time_seconds: Option<f64>,
    pub remaining_additional_recordings: u32,
    /// Path of the recording in progress, or of the last one.
    #[serde(default)]
    pub current_file: Option<String>,
}

/// Experiment-wide calibration constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstantsStatus {
    pub heterodyne_frequency: f64,
    pub cavity_detuning_generator_offset: f64,
    pub tweezer_qwp_offset: f64,
    pub tweezer_hwp_offset: f64,
}

impl Default for ConstantsStatus {
    fn default() -> Self {
        Self {
            heterodyne_frequency: 1.0e6,
            cavity_detuning_generator_offset: 0.0,
            tweezer_qwp_offset: 0.0,
            tweezer_hwp_offset: 0.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control loops
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,
    LockedOutOfRange,
}

/// Waveplate axis corrected by the polarization lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveplateAxis {
    /// Quarter-wave plate, corrects ellipticity (eta).
    #[default]
    Qwp,
    /// Half-wave plate, corrects orientation (theta).
    Hwp,
}

impl WaveplateAxis {
    pub fn other(self) -> Self {
        match self {
            Self::Qwp => Self::Hwp,
            Self::Hwp => Self::Qwp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolarizationLockStatus {
    pub state: LockState,
    pub out_of_lock_range: bool,
    pub next_axis: WaveplateAxis,
    /// Last computed errors in degrees, after calibration offsets.
    pub theta_error: Option<f64>,
    pub eta_error: Option<f64>,
    pub last_error: Option<String>,
}

/// Step of the three-point gradient search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPhase {
    #[default]
    Idle,
    Capture,
    Center,
    Minus,
    Plus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionLockStatus {
    pub locked: bool,
    pub debug: bool,
    pub phase: SearchPhase,
    pub step: Option<f64>,
    pub last_gradient: Option<f64>,
    pub last_proposed_position: Option<f64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub measurement_plan: MeasurementPlan,
    pub running: bool,
    pub current_entry: Option<usize>,
    pub remaining: usize,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelType, MoveMode};
    use serde_json::json;

    #[test]
    fn device_state_typed_view() -> Result<(), Box<dyn std::error::Error>> {
        let state = DeviceState(json!({
            "status": "ok", "DOP": 0.93, "theta": 0.01, "eta": -0.02
        }));
        let reading: PolarimeterStatus = state.typed()?;
        assert!(reading.is_ok());
        assert!((reading.dop - 0.93).abs() < f64::EPSILON);

        let wrong: Result<StageStatus, _> = state.typed();
        assert!(matches!(wrong, Err(LabError::Serialization(_))));
        Ok(())
    }

    #[test]
    fn stage_status_roundtrip() {
        let status = StageStatus {
            channels: vec![Channel {
                kind: ChannelType::Linear,
                mode: MoveMode::Scan,
                supported_modes: vec![MoveMode::Scan],
                ..Channel::unknown()
            }],
        };
        let value = serde_json::to_value(&status).unwrap();
        let back: StageStatus = DeviceState(value).typed().unwrap();
        assert_eq!(status, back);
    }

    #[test]
    fn lock_state_wire_names() {
        assert_eq!(
            serde_json::to_value(LockState::LockedOutOfRange).unwrap(),
            json!("locked-out-of-range")
        );
        assert_eq!(WaveplateAxis::Qwp.other(), WaveplateAxis::Hwp);
    }
}
