//! RF signal generator device.
//!
//! Exposes a single channel (`0`) with `frequency`, `power` and `isOn`.
//! Handlers: `set_frequency(channel, hz)`, `set_power(channel, dbm)`,
//! `set_output(channel, on)` (alias `set_on`). Limits are checked before the
//! backend is touched; failed writes are retried by the loop.

use std::time::Duration;

use async_trait::async_trait;
use lablink_hal::{RetryPolicy, RfSourceBackend, SyncTags, WriteQueue};
use lablink_types::{LabError, RfChannel, RfSourceStatus, SyncState, check_channel, check_range};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

#[derive(Debug, Clone)]
pub struct RfSourceConfig {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Allowed output frequency in Hz.
    pub frequency_limits: (f64, f64),
    /// Allowed output level in dBm.
    pub power_limits: (f64, f64),
}

impl Default for RfSourceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            frequency_limits: (8.0e3, 20.0e9),
            power_limits: (-120.0, 25.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Setting {
    Frequency,
    Power,
    Output,
}

pub struct RfSourceDevice {
    backend: Box<dyn RfSourceBackend>,
    config: RfSourceConfig,
    channel: RfChannel,
    writes: WriteQueue<Setting, f64>,
    sync: SyncTags<Setting>,
}

impl RfSourceDevice {
    pub fn new(backend: impl RfSourceBackend + 'static) -> Self {
        Self::with_config(backend, RfSourceConfig::default())
    }

    pub fn with_config(backend: impl RfSourceBackend + 'static, config: RfSourceConfig) -> Self {
        Self {
            backend: Box::new(backend),
            writes: WriteQueue::new(config.retry),
            config,
            channel: RfChannel::default(),
            sync: SyncTags::new(),
        }
    }

    fn write(&mut self, setting: Setting, value: f64) -> Result<SyncState, LabError> {
        let backend = &mut self.backend;
        let sync = self.writes.submit(setting, value, |v| apply(backend.as_mut(), setting, v))?;
        self.record_sync(setting, sync);
        Ok(sync)
    }

    fn record_sync(&mut self, setting: Setting, state: SyncState) {
        self.sync.record(setting, state);
        self.channel.sync = self.sync.worst();
    }

    pub fn set_frequency(&mut self, channel: i64, hz: f64) -> Result<SyncState, LabError> {
        check_channel(channel, 1)?;
        let (min, max) = self.config.frequency_limits;
        check_range("frequency", hz, min, max)?;
        let sync = self.write(Setting::Frequency, hz)?;
        self.channel.frequency = hz;
        debug!(hz, ?sync, "frequency staged");
        Ok(sync)
    }

    pub fn set_power(&mut self, channel: i64, dbm: f64) -> Result<SyncState, LabError> {
        check_channel(channel, 1)?;
        let (min, max) = self.config.power_limits;
        check_range("power", dbm, min, max)?;
        let sync = self.write(Setting::Power, dbm)?;
        self.channel.power = dbm;
        Ok(sync)
    }

    pub fn set_output(&mut self, channel: i64, on: bool) -> Result<SyncState, LabError> {
        check_channel(channel, 1)?;
        let sync = self.write(Setting::Output, if on { 1.0 } else { 0.0 })?;
        self.channel.is_on = on;
        Ok(sync)
    }

    /// Read back whatever is not waiting on a retry.
    fn refresh(&mut self) {
        if !self.writes.is_pending(&Setting::Frequency) {
            match self.backend.frequency() {
                Ok(hz) => self.channel.frequency = hz,
                Err(e) => debug!(error = %e, "frequency read failed, skipping"),
            }
        }
        if !self.writes.is_pending(&Setting::Power) {
            if let Ok(dbm) = self.backend.power() {
                self.channel.power = dbm;
            }
        }
        if !self.writes.is_pending(&Setting::Output) {
            if let Ok(on) = self.backend.output() {
                self.channel.is_on = on;
            }
        }
    }
}

fn apply(backend: &mut dyn RfSourceBackend, setting: Setting, value: f64) -> Result<(), LabError> {
    match setting {
        Setting::Frequency => backend.set_frequency(value),
        Setting::Power => backend.set_power(value),
        Setting::Output => backend.set_output(value != 0.0),
    }
}

#[async_trait]
impl Device for RfSourceDevice {
    fn kind(&self) -> &'static str {
        "rf-source"
    }

    fn status(&self) -> Value {
        to_status(&RfSourceStatus {
            channels: vec![self.channel.clone()],
        })
    }

    async fn initialize(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        self.channel = RfChannel {
            frequency: self.backend.frequency()?,
            power: self.backend.power()?,
            is_on: self.backend.output()?,
            sync: SyncState::Applied,
        };
        self.sync = SyncTags::new();
        info!(device = ctx.name(), backend = self.backend.id(), hz = self.channel.frequency, "rf source initialised");
        Ok(())
    }

    async fn call(&mut self, _ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        let args = &call.args;
        let sync = match call.method.as_str() {
            "set_frequency" => self.set_frequency(args.index(0)?, args.f64(1)?)?,
            "set_power" => self.set_power(args.index(0)?, args.f64(1)?)?,
            "set_output" | "set_on" => self.set_output(args.index(0)?, args.bool(1)?)?,
            "get_state" => return Ok(self.status()),
            _ => return Err(call.unknown()),
        };
        Ok(serde_json::to_value(sync)?)
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.config.poll_interval)
    }

    async fn poll(&mut self, _ctx: &DeviceContext) -> Result<Duration, LabError> {
        if !self.writes.is_empty() {
            let backend = &mut self.backend;
            let outcomes = self.writes.retry(|setting, value| apply(backend.as_mut(), setting, value));
            for (setting, sync) in outcomes {
                self.record_sync(setting, sync);
            }
        }
        self.refresh();
        Ok(self.config.poll_interval)
    }

    async fn teardown(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        self.backend.close();
        Ok(())
    }

    fn on_save_snapshot(&self) -> Option<Value> {
        Some(serde_json::json!([{
            "frequency": self.channel.frequency,
            "power": self.channel.power,
            "isOn": self.channel.is_on,
        }]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::DeviceRuntime;
    use lablink_hal::sim::{FaultInjector, SimRfSource};
    use serde_json::json;

    #[tokio::test]
    async fn only_channel_zero_exists() -> Result<(), Box<dyn std::error::Error>> {
        let sim = SimRfSource::new("smb", 9e9);
        let handle = sim.handle();
        let runtime = DeviceRuntime::default();
        runtime.register("rf", RfSourceDevice::new(sim)).await?;

        for ch in [1, -1, 5] {
            let result = runtime.action("rf", None, "set_frequency", vec![json!(ch), json!(9.1e9)]).await;
            assert!(matches!(result, Err(LabError::InvalidChannel { .. })));
        }
        assert!(handle.frequency_log().is_empty());

        runtime.action("rf", None, "set_frequency", vec![json!(0), json!(9.1e9)]).await?;
        runtime.action("rf", None, "set_on", vec![json!(0), json!(true)]).await?;
        let status: RfSourceStatus = runtime.get_device_state("rf")?.typed()?;
        assert_eq!(status.channels[0].frequency, 9.1e9);
        assert!(status.channels[0].is_on);
        assert!(handle.is_on());
        Ok(())
    }

    #[tokio::test]
    async fn limits_are_checked_before_the_backend() -> Result<(), Box<dyn std::error::Error>> {
        let sim = SimRfSource::new("smb", 9e9);
        let handle = sim.handle();
        let runtime = DeviceRuntime::default();
        let config = RfSourceConfig {
            frequency_limits: (8e9, 10e9),
            ..RfSourceConfig::default()
        };
        runtime.register("rf", RfSourceDevice::with_config(sim, config)).await?;
        let result = runtime.action("rf", None, "set_frequency", vec![json!(0), json!(11e9)]).await;
        assert!(matches!(result, Err(LabError::OutOfRange { .. })));
        let result = runtime.action("rf", None, "set_power", vec![json!(0), json!(40.0)]).await;
        assert!(matches!(result, Err(LabError::OutOfRange { .. })));
        assert!(handle.frequency_log().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_frequency_write_is_retried() -> Result<(), Box<dyn std::error::Error>> {
        let faults = FaultInjector::default();
        let sim = SimRfSource::new("smb", 9e9).with_faults(faults.clone());
        let handle = sim.handle();
        let runtime = DeviceRuntime::default();
        let ctx = runtime.context("rf");
        let mut device = RfSourceDevice::new(sim);
        device.initialize(&ctx).await?;

        faults.fail_next_writes(1);
        assert_eq!(device.set_frequency(0, 9.2e9)?, SyncState::Pending);
        device.poll(&ctx).await?;
        assert_eq!(handle.frequency(), 9.2e9);
        let status: RfSourceStatus = serde_json::from_value(device.status())?;
        assert_eq!(status.channels[0].sync, SyncState::Applied);
        assert_eq!(status.channels[0].frequency, 9.2e9);
        Ok(())
    }

    #[tokio::test]
    async fn stale_frequency_survives_a_later_power_write() -> Result<(), Box<dyn std::error::Error>> {
        let faults = FaultInjector::default();
        let sim = SimRfSource::new("smb", 9e9).with_faults(faults.clone());
        let runtime = DeviceRuntime::default();
        let ctx = runtime.context("rf");
        let config = RfSourceConfig {
            retry: RetryPolicy::new(1),
            ..RfSourceConfig::default()
        };
        let mut device = RfSourceDevice::with_config(sim, config);
        device.initialize(&ctx).await?;

        faults.fail_next_writes(1);
        assert_eq!(device.set_frequency(0, 9.2e9)?, SyncState::Stale);
        assert_eq!(device.set_power(0, -10.0)?, SyncState::Applied);
        device.poll(&ctx).await?;
        let status: RfSourceStatus = serde_json::from_value(device.status())?;
        assert_eq!(status.channels[0].sync, SyncState::Stale);

        assert_eq!(device.set_frequency(0, 9.3e9)?, SyncState::Applied);
        let status: RfSourceStatus = serde_json::from_value(device.status())?;
        assert_eq!(status.channels[0].sync, SyncState::Applied);
        Ok(())
    }
}
