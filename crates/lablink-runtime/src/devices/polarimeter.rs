//! Polarimeter device.
//!
//! Polls the sensor and publishes `{status, DOP, theta, eta}` with angles in
//! radians. A failed read keeps the previous values and marks the status
//! `"read failed"`, which the polarization lock treats as a skipped cycle.

use std::time::Duration;

use async_trait::async_trait;
use lablink_hal::PolarimeterBackend;
use lablink_types::{LabError, PolarimeterStatus};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

const READ_FAILED: &str = "read failed";

pub struct PolarimeterDevice {
    backend: Box<dyn PolarimeterBackend>,
    poll_interval: Duration,
    reading: PolarimeterStatus,
}

impl PolarimeterDevice {
    pub fn new(backend: impl PolarimeterBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            poll_interval: Duration::from_millis(500),
            reading: PolarimeterStatus::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn refresh(&mut self) {
        match self.backend.read() {
            Ok(r) => {
                self.reading = PolarimeterStatus {
                    status: r.status,
                    dop: r.dop,
                    theta: r.theta,
                    eta: r.eta,
                }
            }
            Err(e) => {
                debug!(error = %e, "polarimeter read failed, skipping");
                self.reading.status = READ_FAILED.to_string();
            }
        }
    }
}

#[async_trait]
impl Device for PolarimeterDevice {
    fn kind(&self) -> &'static str {
        "polarimeter"
    }

    fn status(&self) -> Value {
        to_status(&self.reading)
    }

    async fn initialize(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        self.refresh();
        info!(device = ctx.name(), backend = self.backend.id(), status = %self.reading.status, "polarimeter initialised");
        Ok(())
    }

    async fn call(&mut self, _ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        match call.method.as_str() {
            "get_state" => Ok(self.status()),
            "read" => {
                self.refresh();
                Ok(self.status())
            }
            _ => Err(call.unknown()),
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    async fn poll(&mut self, _ctx: &DeviceContext) -> Result<Duration, LabError> {
        self.refresh();
        Ok(self.poll_interval)
    }

    async fn teardown(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        self.backend.close();
        Ok(())
    }
}
