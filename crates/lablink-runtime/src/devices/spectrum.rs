//! Heterodyne spectrum analyser.
//!
//! Has no loop: readings are taken on demand by the position lock.
//!
//! | Method | Arguments | Returns |
//! |---|---|---|
//! | `band_power` (alias `get_fft`) | `channel, f_min, f_max` | Summed PSD over the band |
//! | `set_fft_averaging` | `millis` | Sync state |

use async_trait::async_trait;
use lablink_hal::SpectrumBackend;
use lablink_types::{LabError, SpectrumStatus, SyncState, check_channel, check_range};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

/// Longest averaging window the analyser accepts.
const MAX_AVERAGING_MS: f64 = 60_000.0;

pub struct SpectrumDevice {
    backend: Box<dyn SpectrumBackend>,
    status: SpectrumStatus,
}

impl SpectrumDevice {
    pub fn new(backend: impl SpectrumBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            status: SpectrumStatus::default(),
        }
    }

    pub fn band_power(&mut self, channel: i64, f_min: f64, f_max: f64) -> Result<f64, LabError> {
        let idx = check_channel(channel, self.status.channel_count)?;
        if f_min.is_nan() || f_max.is_nan() || f_min >= f_max {
            return Err(LabError::InvalidArguments(format!("empty band [{f_min}, {f_max}] Hz")));
        }
        let power = self.backend.band_power(idx, f_min, f_max)?;
        debug!(channel = idx, f_min, f_max, power, "band power");
        self.status.last_band_power = Some(power);
        Ok(power)
    }

    pub fn set_averaging(&mut self, millis: f64) -> Result<SyncState, LabError> {
        let millis = check_range("averaging", millis, 1.0, MAX_AVERAGING_MS)?;
        self.backend.set_averaging(millis.round() as u32)?;
        self.status.averaging_ms = millis.round() as u32;
        Ok(SyncState::Applied)
    }
}

#[async_trait]
impl Device for SpectrumDevice {
    fn kind(&self) -> &'static str {
        "spectrum"
    }

    fn status(&self) -> Value {
        to_status(&self.status)
    }

    async fn initialize(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        self.status.channel_count = self.backend.channel_count();
        info!(device = ctx.name(), backend = self.backend.id(), channels = self.status.channel_count, "spectrum analyser initialised");
        Ok(())
    }

    async fn call(&mut self, _ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        let args = &call.args;
        match call.method.as_str() {
            "band_power" | "get_fft" => {
                let power = self.band_power(args.index(0)?, args.f64(1)?, args.f64(2)?)?;
                Ok(power.into())
            }
            "set_fft_averaging" => Ok(serde_json::to_value(self.set_averaging(args.f64(0)?)?)?),
            "get_state" => Ok(self.status()),
            _ => Err(call.unknown()),
        }
    }

    async fn teardown(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        self.backend.close();
        Ok(())
    }
}
