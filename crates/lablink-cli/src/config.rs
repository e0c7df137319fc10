//! Rig configuration – reads `~/.lablink/rig.toml`.
//!
//! The rig file lists the devices to host, each tagged with its `kind`:
//!
//! ```toml
//! settings_path = "/data/lab/settings.json"
//! health_timeout_ms = 5000
//!
//! [[device]]
//! kind = "stage"
//! name = "smaract"
//! channels = [{ type = "linear", mode = "closed-loop" }]
//!
//! [[device]]
//! kind = "position-lock"
//! name = "z_lock"
//! gain = -0.002
//! ```
//!
//! Every control-loop constant is optional and falls back to the runtime's
//! default. Without a rig file the built-in simulated bench is used.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lablink_runtime::RuntimeConfig;
use lablink_runtime::control::{DetuningScanConfig, PolarizationLockConfig, PositionLockConfig};
use lablink_types::{ChannelType, MoveMode};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Rig
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    /// Where device settings are restored from and saved to.
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Extra time past a device's poll interval before its loop counts as stale.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    #[serde(default = "default_devices", rename = "device")]
    pub devices: Vec<DeviceSpec>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            settings_path: default_settings_path(),
            health_timeout_ms: default_health_timeout_ms(),
            devices: default_devices(),
        }
    }
}

impl RigConfig {
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            health_grace: Duration::from_millis(self.health_timeout_ms),
            ..RuntimeConfig::default()
        }
    }
}

fn default_settings_path() -> PathBuf {
    lablink_dir(&home()).join("settings.json")
}

fn default_health_timeout_ms() -> u64 {
    10_000
}

// ─────────────────────────────────────────────────────────────────────────────
// Device specs
// ─────────────────────────────────────────────────────────────────────────────

/// One `[[device]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeviceSpec {
    Stage(StageSpec),
    RfSource(RfSourceSpec),
    Polarimeter(NamedSpec),
    PressureGauge(PressureSpec),
    Spectrum(SpectrumSpec),
    Recorder(RecorderSpec),
    Constants(NamedSpec),
    PolarizationLock(PolarizationLockSpec),
    PositionLock(PositionLockSpec),
    DetuningScan(DetuningScanSpec),
}

impl DeviceSpec {
    pub fn name(&self) -> &str {
        match self {
            DeviceSpec::Stage(s) => &s.name,
            DeviceSpec::RfSource(s) => &s.name,
            DeviceSpec::Polarimeter(s) | DeviceSpec::Constants(s) => &s.name,
            DeviceSpec::PressureGauge(s) => &s.name,
            DeviceSpec::Spectrum(s) => &s.name,
            DeviceSpec::Recorder(s) => &s.name,
            DeviceSpec::PolarizationLock(s) => &s.name,
            DeviceSpec::PositionLock(s) => &s.name,
            DeviceSpec::DetuningScan(s) => &s.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSpec {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub mode: MoveMode,
    #[serde(default)]
    pub position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<AxisSpec>,
    /// Hard travel limits `[min, max]` for absolute moves.
    pub travel: Option<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfSourceSpec {
    pub name: String,
    /// Simulated start frequency, Hz.
    #[serde(default = "default_rf_frequency")]
    pub frequency: f64,
    pub frequency_limits: Option<[f64; 2]>,
    pub power_limits: Option<[f64; 2]>,
}

fn default_rf_frequency() -> f64 {
    9.0e9
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureSpec {
    pub name: String,
    /// Simulated pressure per channel, mbar.
    #[serde(default)]
    pub pressures: Vec<f64>,
}

/// Quadratic signal well `floor + curvature * (z - optimum)^2` over a stage axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellSpec {
    pub stage: String,
    #[serde(default)]
    pub channel: usize,
    pub optimum: f64,
    pub curvature: f64,
    pub floor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSpec {
    pub name: String,
    #[serde(default = "default_spectrum_channels")]
    pub channels: usize,
    pub coupled_to: Option<WellSpec>,
}

fn default_spectrum_channels() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderSpec {
    pub name: String,
    pub save_directory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolarizationLockSpec {
    pub name: String,
    pub polarimeter: Option<String>,
    pub waveplates: Option<String>,
    pub qwp_channel: Option<usize>,
    pub hwp_channel: Option<usize>,
    pub dop_threshold: Option<f64>,
    pub lock_range_deg: Option<f64>,
    pub theta_offset_deg: Option<f64>,
    pub eta_offset_deg: Option<f64>,
    pub deadband_deg: Option<f64>,
    pub interval_ms: Option<u64>,
}

impl PolarizationLockSpec {
    pub fn to_config(&self) -> PolarizationLockConfig {
        let d = PolarizationLockConfig::default();
        PolarizationLockConfig {
            polarimeter: self.polarimeter.clone().unwrap_or(d.polarimeter),
            waveplates: self.waveplates.clone().unwrap_or(d.waveplates),
            qwp_channel: self.qwp_channel.unwrap_or(d.qwp_channel),
            hwp_channel: self.hwp_channel.unwrap_or(d.hwp_channel),
            dop_threshold: self.dop_threshold.unwrap_or(d.dop_threshold),
            lock_range_deg: self.lock_range_deg.unwrap_or(d.lock_range_deg),
            theta_offset_deg: self.theta_offset_deg.unwrap_or(d.theta_offset_deg),
            eta_offset_deg: self.eta_offset_deg.unwrap_or(d.eta_offset_deg),
            deadband_deg: self.deadband_deg.unwrap_or(d.deadband_deg),
            interval: millis_or(self.interval_ms, d.interval),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionLockSpec {
    pub name: String,
    pub stage: Option<String>,
    pub stage_channel: Option<usize>,
    pub spectrum: Option<String>,
    pub spectrum_channel: Option<usize>,
    pub constants: Option<String>,
    pub band_half_width: Option<f64>,
    pub gain: Option<f64>,
    pub gradient_clip: Option<f64>,
    pub closed_loop_step: Option<f64>,
    pub scan_step: Option<f64>,
    pub first_settle_ms: Option<u64>,
    pub settle_ms: Option<u64>,
    pub backoff_ms: Option<u64>,
    pub idle_interval_ms: Option<u64>,
    pub averaging_ms: Option<u32>,
    pub debug: Option<bool>,
}

impl PositionLockSpec {
    pub fn to_config(&self) -> PositionLockConfig {
        let d = PositionLockConfig::default();
        PositionLockConfig {
            stage: self.stage.clone().unwrap_or(d.stage),
            stage_channel: self.stage_channel.unwrap_or(d.stage_channel),
            spectrum: self.spectrum.clone().unwrap_or(d.spectrum),
            spectrum_channel: self.spectrum_channel.unwrap_or(d.spectrum_channel),
            constants: self.constants.clone().unwrap_or(d.constants),
            band_half_width: self.band_half_width.unwrap_or(d.band_half_width),
            gain: self.gain.unwrap_or(d.gain),
            gradient_clip: self.gradient_clip.unwrap_or(d.gradient_clip),
            closed_loop_step: self.closed_loop_step.unwrap_or(d.closed_loop_step),
            scan_step: self.scan_step.unwrap_or(d.scan_step),
            first_settle: millis_or(self.first_settle_ms, d.first_settle),
            settle: millis_or(self.settle_ms, d.settle),
            backoff: millis_or(self.backoff_ms, d.backoff),
            idle_interval: millis_or(self.idle_interval_ms, d.idle_interval),
            averaging_ms: self.averaging_ms.unwrap_or(d.averaging_ms),
            debug: self.debug.unwrap_or(d.debug),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetuningScanSpec {
    pub name: String,
    pub recorder: Option<String>,
    pub rf: Option<String>,
    pub rf_channel: Option<usize>,
    pub max_abs_offset: Option<f64>,
    pub base_band: Option<[f64; 2]>,
    /// Seconds per plan duration unit.
    pub duration_unit_s: Option<f64>,
    pub poll_interval_ms: Option<u64>,
}

impl DetuningScanSpec {
    pub fn to_config(&self) -> DetuningScanConfig {
        let d = DetuningScanConfig::default();
        let duration_unit = self
            .duration_unit_s
            .filter(|s| s.is_finite() && *s > 0.0)
            .map_or(d.duration_unit, Duration::from_secs_f64);
        DetuningScanConfig {
            recorder: self.recorder.clone().unwrap_or(d.recorder),
            rf: self.rf.clone().unwrap_or(d.rf),
            rf_channel: self.rf_channel.unwrap_or(d.rf_channel),
            max_abs_offset: self.max_abs_offset.unwrap_or(d.max_abs_offset),
            base_band: self.base_band.map_or(d.base_band, |[lo, hi]| (lo, hi)),
            duration_unit,
            poll_interval: millis_or(self.poll_interval_ms, d.poll_interval),
        }
    }
}

fn millis_or(ms: Option<u64>, default: Duration) -> Duration {
    ms.map_or(default, Duration::from_millis)
}

/// The simulated bench used when no rig file exists.
fn default_devices() -> Vec<DeviceSpec> {
    let linear = |position| AxisSpec {
        kind: ChannelType::Linear,
        mode: MoveMode::ClosedLoop,
        position,
    };
    let rotation = |position| AxisSpec {
        kind: ChannelType::Rotation,
        mode: MoveMode::ClosedLoop,
        position,
    };
    vec![
        DeviceSpec::Stage(StageSpec {
            name: "smaract".into(),
            channels: vec![linear(0.05)],
            travel: Some([-5.0, 5.0]),
        }),
        DeviceSpec::Stage(StageSpec {
            name: "waveplates".into(),
            channels: vec![rotation(10.0), rotation(20.0)],
            travel: None,
        }),
        DeviceSpec::RfSource(RfSourceSpec {
            name: "cavity_detuning".into(),
            frequency: default_rf_frequency(),
            frequency_limits: None,
            power_limits: None,
        }),
        DeviceSpec::Polarimeter(NamedSpec {
            name: "polarimeter".into(),
        }),
        DeviceSpec::PressureGauge(PressureSpec {
            name: "pressure".into(),
            pressures: vec![1.0e-6, 2.0e-3],
        }),
        DeviceSpec::Spectrum(SpectrumSpec {
            name: "het".into(),
            channels: 1,
            coupled_to: Some(WellSpec {
                stage: "smaract".into(),
                channel: 0,
                optimum: 0.0,
                curvature: 1.0e3,
                floor: 1.0,
            }),
        }),
        DeviceSpec::Recorder(RecorderSpec {
            name: "main".into(),
            save_directory: None,
        }),
        DeviceSpec::Constants(NamedSpec {
            name: "constants".into(),
        }),
        DeviceSpec::PolarizationLock(PolarizationLockSpec {
            name: "polarization_lock".into(),
            ..PolarizationLockSpec::default()
        }),
        // The simulated well is a minimum, so the demo lock descends.
        DeviceSpec::PositionLock(PositionLockSpec {
            name: "z_lock".into(),
            gain: Some(-0.002),
            ..PositionLockSpec::default()
        }),
        DeviceSpec::DetuningScan(DetuningScanSpec {
            name: "detuning_scan".into(),
            ..DetuningScanSpec::default()
        }),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

fn home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn lablink_dir(home: &str) -> PathBuf {
    PathBuf::from(home).join(".lablink")
}

/// Return the path to `~/.lablink/rig.toml`.
pub fn rig_path() -> PathBuf {
    rig_path_for_home(&home())
}

/// Build the rig path relative to the given home directory.
pub(crate) fn rig_path_for_home(home: &str) -> PathBuf {
    lablink_dir(home).join("rig.toml")
}

/// Load the rig file. Returns `None` if it does not exist.
pub fn load_from(path: &Path) -> Result<Option<RigConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read rig file at {}: {}", path.display(), e))?;
    let mut cfg: RigConfig = toml::from_str(&raw).map_err(|e| format!("Failed to parse rig file: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load `path`, or the built-in bench when it is absent. Environment
/// overrides apply either way.
pub fn load_or_default(path: &Path) -> Result<RigConfig, String> {
    match load_from(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = RigConfig::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Apply `LABLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LABLINK_SETTINGS_PATH` | `settings_path` |
/// | `LABLINK_HEALTH_TIMEOUT_MS` | `health_timeout_ms` |
pub fn apply_env_overrides(cfg: &mut RigConfig) {
    if let Ok(v) = std::env::var("LABLINK_SETTINGS_PATH") {
        cfg.settings_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("LABLINK_HEALTH_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.health_timeout_ms = ms;
    }
}

/// Write `cfg` as TOML, creating the parent directory if needed.
pub fn save_to(cfg: &RigConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create rig directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize rig: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write rig file at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rig_path_points_to_lablink_dir() {
        let p = rig_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".lablink"));
        assert!(p.to_string_lossy().ends_with("rig.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = rig_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn default_bench_round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = rig_path_for_home(&dir.path().to_string_lossy());
        let cfg = RigConfig::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.devices, cfg.devices);
        let names: Vec<&str> = loaded.devices.iter().map(DeviceSpec::name).collect();
        assert!(names.contains(&"z_lock"));
        assert!(names.contains(&"detuning_scan"));
    }

    #[test]
    fn tagged_devices_and_partial_overrides() {
        let raw = r#"
            health_timeout_ms = 2500

            [[device]]
            kind = "stage"
            name = "elliptec"
            channels = [{ type = "rotation", mode = "closed-loop", position = 45.0 }]

            [[device]]
            kind = "position-lock"
            name = "z_lock"
            gain = -0.5
            settle_ms = 250

            [[device]]
            kind = "detuning-scan"
            name = "scan"
            base_band = [1e9, 2e9]
            duration_unit_s = 1.5
        "#;
        let cfg: RigConfig = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.health_timeout_ms, 2500);
        assert_eq!(cfg.runtime_config().health_grace, Duration::from_millis(2500));
        assert_eq!(cfg.devices.len(), 3);

        let DeviceSpec::Stage(stage) = &cfg.devices[0] else {
            panic!("expected a stage, got {:?}", cfg.devices[0]);
        };
        assert_eq!(stage.channels[0].kind, ChannelType::Rotation);
        assert_eq!(stage.channels[0].position, 45.0);

        let DeviceSpec::PositionLock(lock) = &cfg.devices[1] else {
            panic!("expected a position lock");
        };
        let lock = lock.to_config();
        assert_eq!(lock.gain, -0.5);
        assert_eq!(lock.settle, Duration::from_millis(250));
        assert_eq!(lock.first_settle, PositionLockConfig::default().first_settle);
        assert_eq!(lock.stage, "smaract");

        let DeviceSpec::DetuningScan(scan) = &cfg.devices[2] else {
            panic!("expected a detuning scan");
        };
        let scan = scan.to_config();
        assert_eq!(scan.base_band, (1e9, 2e9));
        assert_eq!(scan.duration_unit, Duration::from_millis(1500));
        assert_eq!(scan.recorder, "main");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"
            [[device]]
            kind = "particle-namer"
            name = "names"
        "#;
        assert!(toml::from_str::<RigConfig>(raw).is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: the only test touching these variables.
        unsafe {
            std::env::set_var("LABLINK_SETTINGS_PATH", "/tmp/lab/settings.json");
            std::env::set_var("LABLINK_HEALTH_TIMEOUT_MS", "not-a-number");
        }
        let mut cfg = RigConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.settings_path, PathBuf::from("/tmp/lab/settings.json"));
        assert_eq!(cfg.health_timeout_ms, default_health_timeout_ms());

        unsafe { std::env::set_var("LABLINK_HEALTH_TIMEOUT_MS", "750") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.health_timeout_ms, 750);
        unsafe {
            std::env::remove_var("LABLINK_SETTINGS_PATH");
            std::env::remove_var("LABLINK_HEALTH_TIMEOUT_MS");
        }
    }
}
