//! Vacuum gauge controller.
//!
//! Each channel publishes `{pressure, status}`; `pressure` is `null` while
//! the gauge is off or out of range. The save snapshot is the pressures only.

use std::time::Duration;

use async_trait::async_trait;
use lablink_hal::PressureBackend;
use lablink_types::{LabError, PressureChannel, PressureStatus, check_channel};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

pub struct PressureGaugeDevice {
    backend: Box<dyn PressureBackend>,
    poll_interval: Duration,
    channels: Vec<PressureChannel>,
}

impl PressureGaugeDevice {
    pub fn new(backend: impl PressureBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            poll_interval: Duration::from_secs(1),
            channels: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn read_channel(&mut self, idx: usize) {
        match self.backend.read(idx) {
            Ok(reading) => {
                self.channels[idx] = PressureChannel {
                    pressure: reading.pressure,
                    status: reading.status,
                }
            }
            Err(e) => debug!(channel = idx, error = %e, "pressure read failed, skipping"),
        }
    }
}

#[async_trait]
impl Device for PressureGaugeDevice {
    fn kind(&self) -> &'static str {
        "pressure-gauge"
    }

    fn status(&self) -> Value {
        to_status(&PressureStatus {
            channels: self.channels.clone(),
        })
    }

    async fn initialize(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        let count = self.backend.channel_count();
        self.channels = vec![
            PressureChannel {
                pressure: None,
                status: "unknown".into(),
            };
            count
        ];
        for idx in 0..count {
            self.read_channel(idx);
        }
        info!(device = ctx.name(), backend = self.backend.id(), channels = count, "pressure gauge initialised");
        Ok(())
    }

    async fn call(&mut self, _ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        match call.method.as_str() {
            "get_pressure" => {
                let idx = check_channel(call.args.index(0)?, self.channels.len())?;
                self.read_channel(idx);
                Ok(self.channels[idx].pressure.into())
            }
            "get_state" => Ok(self.status()),
            _ => Err(call.unknown()),
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    async fn poll(&mut self, _ctx: &DeviceContext) -> Result<Duration, LabError> {
        for idx in 0..self.channels.len() {
            self.read_channel(idx);
        }
        Ok(self.poll_interval)
    }

    async fn teardown(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        self.backend.close();
        Ok(())
    }

    fn on_save_snapshot(&self) -> Option<Value> {
        let pressures: Vec<Option<f64>> = self.channels.iter().map(|c| c.pressure).collect();
        serde_json::to_value(pressures).ok()
    }
}
