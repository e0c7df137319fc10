//! Rig assembly – registers the configured devices on a runtime.
//!
//! Hardware devices are backed by the in-process simulators from
//! `lablink_hal::sim`. Registration follows file order, so a spectrum analyser
//! coupled to a stage must be listed after it.

use std::collections::HashMap;

use lablink_hal::sim::{SimPolarimeter, SimPressureGauge, SimRfSource, SimSpectrum, SimStage, SimStageHandle};
use lablink_runtime::DeviceRuntime;
use lablink_runtime::control::{DetuningScan, PolarizationLock, PositionLock};
use lablink_runtime::devices::{
    ConstantsDevice, PolarimeterDevice, PressureGaugeDevice, RecorderDevice, RfSourceConfig, RfSourceDevice,
    SpectrumDevice, StageConfig, StageDevice,
};
use lablink_types::LabError;
use tracing::info;

use crate::config::{DeviceSpec, RigConfig};

/// Register every device of `rig` on `runtime`, in order.
pub async fn build(runtime: &DeviceRuntime, rig: &RigConfig) -> Result<(), LabError> {
    let mut stages: HashMap<String, SimStageHandle> = HashMap::new();

    for spec in &rig.devices {
        let name = spec.name();
        match spec {
            DeviceSpec::Stage(s) => {
                let mut sim = SimStage::new(name);
                for axis in &s.channels {
                    sim = sim.with_channel(axis.kind, axis.mode).at(axis.position);
                }
                stages.insert(name.to_string(), sim.handle());
                let config = StageConfig {
                    travel: s.travel.map(|[lo, hi]| (lo, hi)),
                    ..StageConfig::default()
                };
                runtime.register(name, StageDevice::with_config(sim, config)).await?;
            }
            DeviceSpec::RfSource(s) => {
                let d = RfSourceConfig::default();
                let config = RfSourceConfig {
                    frequency_limits: s.frequency_limits.map_or(d.frequency_limits, |[lo, hi]| (lo, hi)),
                    power_limits: s.power_limits.map_or(d.power_limits, |[lo, hi]| (lo, hi)),
                    ..d
                };
                let sim = SimRfSource::new(name, s.frequency);
                runtime.register(name, RfSourceDevice::with_config(sim, config)).await?;
            }
            DeviceSpec::Polarimeter(_) => {
                runtime.register(name, PolarimeterDevice::new(SimPolarimeter::new(name))).await?;
            }
            DeviceSpec::PressureGauge(s) => {
                let sim = SimPressureGauge::new(name, s.pressures.iter().copied().map(Some).collect());
                runtime.register(name, PressureGaugeDevice::new(sim)).await?;
            }
            DeviceSpec::Spectrum(s) => {
                let mut sim = SimSpectrum::new(name, s.channels);
                if let Some(well) = &s.coupled_to {
                    let stage = stages.get(&well.stage).cloned().ok_or_else(|| {
                        LabError::InvalidArguments(format!(
                            "spectrum '{name}' is coupled to '{}', which is not a stage listed before it",
                            well.stage
                        ))
                    })?;
                    sim = sim.coupled_to(stage, well.channel, well.optimum, well.curvature, well.floor);
                }
                runtime.register(name, SpectrumDevice::new(sim)).await?;
            }
            DeviceSpec::Recorder(s) => {
                let recorder = match &s.save_directory {
                    Some(dir) => RecorderDevice::default().with_save_directory(dir.clone()),
                    None => RecorderDevice::default(),
                };
                runtime.register(name, recorder).await?;
            }
            DeviceSpec::Constants(_) => runtime.register(name, ConstantsDevice::default()).await?,
            DeviceSpec::PolarizationLock(s) => runtime.register(name, PolarizationLock::new(s.to_config())).await?,
            DeviceSpec::PositionLock(s) => runtime.register(name, PositionLock::new(s.to_config())).await?,
            DeviceSpec::DetuningScan(s) => runtime.register(name, DetuningScan::new(s.to_config())).await?,
        }
    }
    info!(devices = rig.devices.len(), "rig assembled");
    Ok(())
}
