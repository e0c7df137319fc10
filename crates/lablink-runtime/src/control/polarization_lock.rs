//! Alternating-axis polarization lock.
//!
//! Every cycle reads the polarimeter and, while locked, nudges one waveplate
//! by half of its error: the QWP from the ellipticity error `eta`, the HWP
//! from the orientation error `theta`. The two axes are coupled, so only one
//! is corrected per cycle and the corrected axis alternates.
//!
//! ```text
//!  unlocked ──start_lock──► locked ◄──────► locked-out-of-range
//!     ▲                       │    error back        │
//!     └───────stop_lock───────┴──── inside range ────┘
//! ```
//!
//! Outside the lock range no correction is attempted. The transition is
//! published once and the reason kept in `lastError`.

use std::time::Duration;

use async_trait::async_trait;
use lablink_types::{
    ChannelType, LabError, LockState, PolarimeterStatus, PolarizationLockStatus, WaveplateAxis,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::stage_channel;
use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

#[derive(Debug, Clone)]
pub struct PolarizationLockConfig {
    pub polarimeter: String,
    pub waveplates: String,
    pub qwp_channel: usize,
    pub hwp_channel: usize,
    /// Readings below this degree of polarization are ignored.
    pub dop_threshold: f64,
    /// Largest error, in degrees, the lock will try to correct.
    pub lock_range_deg: f64,
    /// Calibration offsets subtracted from the measured angles, in degrees.
    pub theta_offset_deg: f64,
    pub eta_offset_deg: f64,
    /// Ellipticity below which the QWP is left alone.
    pub deadband_deg: f64,
    pub interval: Duration,
}

impl Default for PolarizationLockConfig {
    fn default() -> Self {
        Self {
            polarimeter: "polarimeter".into(),
            waveplates: "waveplates".into(),
            qwp_channel: 0,
            hwp_channel: 1,
            dop_threshold: 0.8,
            lock_range_deg: 5.0,
            theta_offset_deg: 1.2,
            eta_offset_deg: 0.2,
            deadband_deg: 0.2,
            interval: Duration::from_secs(1),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Sensor not ok or DOP too low.
    Skipped,
    /// Lock not engaged; only the range flag was tracked.
    Idle,
    OutOfRange,
    /// Both errors inside the deadband.
    Settled,
    Corrected(WaveplateAxis),
}

pub struct PolarizationLock {
    config: PolarizationLockConfig,
    locked: bool,
    status: PolarizationLockStatus,
}

impl PolarizationLock {
    pub fn new(config: PolarizationLockConfig) -> Self {
        Self {
            config,
            locked: false,
            // No reading yet, so the polarization is not known to be in range.
            status: PolarizationLockStatus {
                next_axis: WaveplateAxis::Hwp,
                out_of_lock_range: true,
                ..PolarizationLockStatus::default()
            },
        }
    }

    fn start(&mut self) {
        self.locked = true;
        self.status.last_error = None;
        self.status.state = if self.status.out_of_lock_range {
            LockState::LockedOutOfRange
        } else {
            LockState::Locked
        };
        info!(state = ?self.status.state, "polarization lock engaged");
    }

    fn stop(&mut self) {
        self.locked = false;
        self.status.state = LockState::Unlocked;
        info!("polarization lock released");
    }

    /// Run one feedback cycle.
    pub async fn cycle(&mut self, ctx: &DeviceContext) -> Result<CycleOutcome, LabError> {
        let cfg = &self.config;
        let reading: PolarimeterStatus = ctx.state(&cfg.polarimeter)?;
        if !reading.is_ok() || reading.dop < cfg.dop_threshold {
            debug!(status = %reading.status, dop = reading.dop, "polarimeter reading unusable, skipping");
            return Ok(CycleOutcome::Skipped);
        }
        let theta = reading.theta.to_degrees() - cfg.theta_offset_deg;
        let eta = reading.eta.to_degrees() - cfg.eta_offset_deg;
        let out_of_range = theta.abs() > cfg.lock_range_deg || eta.abs() > cfg.lock_range_deg;

        let flipped = out_of_range != self.status.out_of_lock_range;
        self.status.theta_error = Some(theta);
        self.status.eta_error = Some(eta);
        self.status.out_of_lock_range = out_of_range;
        if self.locked {
            if out_of_range {
                self.status.state = LockState::LockedOutOfRange;
                self.status.last_error = Some(format!(
                    "polarization out of lock range (±{}°): theta {theta:.2}°, eta {eta:.2}°",
                    cfg.lock_range_deg
                ));
            } else {
                self.status.state = LockState::Locked;
            }
        }
        if flipped {
            ctx.send_status_update(self.status());
        }

        if !self.locked {
            return Ok(CycleOutcome::Idle);
        }
        if out_of_range {
            warn!(theta, eta, "polarization out of lock range, not correcting");
            return Ok(CycleOutcome::OutOfRange);
        }

        let cfg = &self.config;
        let qwp = stage_channel(ctx, &cfg.waveplates, cfg.qwp_channel)?;
        let hwp = stage_channel(ctx, &cfg.waveplates, cfg.hwp_channel)?;
        if qwp.kind != ChannelType::Rotation || hwp.kind != ChannelType::Rotation {
            return Err(LabError::InvalidArguments(format!(
                "waveplate channels {} and {} must both be rotation mounts",
                cfg.qwp_channel, cfg.hwp_channel
            )));
        }

        let mut axis = self.status.next_axis;
        if axis == WaveplateAxis::Qwp && eta.abs() < cfg.deadband_deg {
            if theta.abs() > cfg.deadband_deg {
                axis = WaveplateAxis::Hwp;
            } else {
                return Ok(CycleOutcome::Settled);
            }
        }
        let (channel, target) = match axis {
            WaveplateAxis::Qwp => (cfg.qwp_channel, qwp.target_position + eta / 2.0),
            WaveplateAxis::Hwp => (cfg.hwp_channel, hwp.target_position + theta / 2.0),
        };
        ctx.action(&cfg.waveplates, None, "set_position", vec![channel.into(), target.into()])
            .await?;
        debug!(?axis, channel, target, "waveplate corrected");

        self.status.next_axis = axis.other();
        self.status.last_error = None;
        Ok(CycleOutcome::Corrected(axis))
    }
}

impl Default for PolarizationLock {
    fn default() -> Self {
        Self::new(PolarizationLockConfig::default())
    }
}

#[async_trait]
impl Device for PolarizationLock {
    fn kind(&self) -> &'static str {
        "polarization-lock"
    }

    fn status(&self) -> Value {
        to_status(&self.status)
    }

    async fn call(&mut self, _ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        match call.method.as_str() {
            "start_lock" | "start_polarization_lock" => self.start(),
            "stop_lock" | "stop_polarization_lock" => self.stop(),
            "get_state" => return Ok(self.status()),
            _ => return Err(call.unknown()),
        }
        Ok(Value::Null)
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.config.interval)
    }

    async fn poll(&mut self, ctx: &DeviceContext) -> Result<Duration, LabError> {
        match self.cycle(ctx).await {
            Ok(outcome) => debug!(?outcome, "polarization cycle"),
            Err(e) => {
                warn!(error = %e, "polarization cycle failed");
                self.status.last_error = Some(e.to_string());
                ctx.report_fault(e.to_string());
            }
        }
        Ok(self.config.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{PolarimeterDevice, StageDevice};
    use crate::runtime::DeviceRuntime;
    use lablink_hal::sim::{FaultInjector, SimPolarimeter, SimPolarimeterHandle, SimStage, SimStageHandle};
    use lablink_middleware::Topic;
    use lablink_types::MoveMode;

    struct Rig {
        runtime: DeviceRuntime,
        waveplates: SimStageHandle,
        sensor: SimPolarimeterHandle,
    }

    /// Polarimeter, two-axis waveplate mount and a lock without calibration
    /// offsets, so the reading is the error.
    async fn rig(kind: ChannelType) -> Result<Rig, LabError> {
        let polarimeter = SimPolarimeter::new("pax");
        let sensor = polarimeter.handle();
        let mount = SimStage::new("elliptec")
            .with_channel(kind, MoveMode::ClosedLoop)
            .with_channel(kind, MoveMode::ClosedLoop);
        let waveplates = mount.handle();

        let runtime = DeviceRuntime::default();
        runtime.register("polarimeter", PolarimeterDevice::new(polarimeter)).await?;
        runtime.register("waveplates", StageDevice::new(mount)).await?;
        let config = PolarizationLockConfig {
            theta_offset_deg: 0.0,
            eta_offset_deg: 0.0,
            ..PolarizationLockConfig::default()
        };
        runtime.register("pol", PolarizationLock::new(config)).await?;
        Ok(Rig {
            runtime,
            waveplates,
            sensor,
        })
    }

    impl Rig {
        async fn read(&self, dop: f64, theta: f64, eta: f64) -> Result<(), LabError> {
            self.sensor.set_degrees(dop, theta, eta);
            self.runtime.step("polarimeter").await.map(|_| ())
        }

        fn status(&self) -> Result<PolarizationLockStatus, LabError> {
            self.runtime.get_device_state("pol")?.typed()
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn out_of_range_publishes_once_and_holds_still() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(ChannelType::Rotation).await?;
        rig.runtime.action("pol", None, "start_lock", vec![]).await?;
        rig.read(0.95, 6.0, 0.0).await?;

        let mut events = rig.runtime.bus().subscribe_to(Topic::Status);
        rig.runtime.step("pol").await?;
        let published = events.drain().into_iter().filter(|e| e.device == "pol").count();
        assert_eq!(published, 1);

        let status = rig.status()?;
        assert_eq!(status.state, LockState::LockedOutOfRange);
        assert!(status.out_of_lock_range);
        assert!(status.last_error.is_some());
        assert!(rig.waveplates.commands().is_empty());

        rig.runtime.step("pol").await?;
        assert!(events.drain().into_iter().all(|e| e.device != "pol"));
        assert!(rig.waveplates.commands().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn range_is_unknown_until_the_first_reading() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(ChannelType::Rotation).await?;
        assert!(rig.status()?.out_of_lock_range);
        rig.runtime.action("pol", None, "start_lock", vec![]).await?;
        assert_eq!(rig.status()?.state, LockState::LockedOutOfRange);

        rig.read(0.95, 2.0, 1.0).await?;
        let mut events = rig.runtime.bus().subscribe_to(Topic::Status);
        rig.runtime.step("pol").await?;
        let status = rig.status()?;
        assert!(!status.out_of_lock_range);
        assert_eq!(status.state, LockState::Locked);
        assert!(events.drain().iter().any(|e| e.device == "pol"));
        assert_eq!(rig.waveplates.position_commands(1).len(), 1, "first in-range cycle corrects");
        Ok(())
    }

    #[tokio::test]
    async fn failed_polarimeter_read_skips_the_cycle() -> Result<(), Box<dyn std::error::Error>> {
        let faults = FaultInjector::default();
        let polarimeter = SimPolarimeter::new("pax").with_faults(faults.clone());
        let sensor = polarimeter.handle();
        let mount = SimStage::new("elliptec")
            .with_channel(ChannelType::Rotation, MoveMode::ClosedLoop)
            .with_channel(ChannelType::Rotation, MoveMode::ClosedLoop);
        let waveplates = mount.handle();
        let runtime = DeviceRuntime::default();
        runtime.register("polarimeter", PolarimeterDevice::new(polarimeter)).await?;
        runtime.register("waveplates", StageDevice::new(mount)).await?;
        runtime.register("pol", PolarizationLock::default()).await?;
        runtime.action("pol", None, "start_lock", vec![]).await?;

        sensor.set_degrees(0.95, 3.0, 1.0);
        faults.fail_next_reads(1);
        runtime.step("polarimeter").await?;
        runtime.step("pol").await?;
        assert!(waveplates.commands().is_empty());

        runtime.step("polarimeter").await?;
        runtime.step("pol").await?;
        assert_eq!(waveplates.position_commands(1).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn corrected_axis_alternates() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(ChannelType::Rotation).await?;
        rig.runtime.action("pol", None, "start_lock", vec![]).await?;
        rig.read(0.95, 2.0, 1.0).await?;

        rig.runtime.step("pol").await?;
        let hwp = rig.waveplates.position_commands(1);
        assert_eq!(hwp.len(), 1);
        assert!(approx(hwp[0], 1.0), "HWP moves by theta/2, got {hwp:?}");
        assert!(rig.waveplates.position_commands(0).is_empty());
        assert_eq!(rig.status()?.next_axis, WaveplateAxis::Qwp);

        rig.runtime.step("pol").await?;
        let qwp = rig.waveplates.position_commands(0);
        assert_eq!(qwp.len(), 1);
        assert!(approx(qwp[0], 0.5), "QWP moves by eta/2, got {qwp:?}");
        assert_eq!(rig.waveplates.position_commands(1).len(), 1);
        assert_eq!(rig.status()?.state, LockState::Locked);
        Ok(())
    }

    #[tokio::test]
    async fn deadband_redirects_or_skips() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(ChannelType::Rotation).await?;
        rig.runtime.action("pol", None, "start_lock", vec![]).await?;
        rig.read(0.95, 2.0, 0.1).await?;

        rig.runtime.step("pol").await?;
        rig.runtime.step("pol").await?;
        assert_eq!(rig.waveplates.position_commands(1).len(), 2, "small eta hands the turn to the HWP");
        assert!(rig.waveplates.position_commands(0).is_empty());

        rig.read(0.95, 0.1, 0.1).await?;
        rig.runtime.step("pol").await?;
        assert_eq!(rig.waveplates.commands().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn poor_readings_and_unlocked_state_issue_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(ChannelType::Rotation).await?;
        rig.read(0.95, 6.0, 0.0).await?;
        rig.runtime.step("pol").await?;
        let status = rig.status()?;
        assert_eq!(status.state, LockState::Unlocked);
        assert!(status.out_of_lock_range, "range is tracked while unlocked");

        rig.runtime.action("pol", None, "start_lock", vec![]).await?;
        rig.read(0.5, 2.0, 2.0).await?;
        rig.runtime.step("pol").await?;
        assert!(rig.waveplates.commands().is_empty());
        assert_eq!(rig.status()?.state, LockState::LockedOutOfRange);
        Ok(())
    }

    #[tokio::test]
    async fn linear_mounts_fail_the_cycle_only() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(ChannelType::Linear).await?;
        rig.runtime.action("pol", None, "start_lock", vec![]).await?;
        rig.read(0.95, 2.0, 1.0).await?;
        let mut faults = rig.runtime.bus().subscribe_to(Topic::Faults);

        assert_eq!(rig.runtime.step("pol").await?, Duration::from_secs(1));
        assert!(rig.status()?.last_error.is_some());
        assert_eq!(faults.drain().len(), 1);
        assert!(rig.waveplates.commands().is_empty());

        rig.runtime.action("pol", None, "stop_lock", vec![]).await?;
        assert_eq!(rig.status()?.state, LockState::Unlocked);
        Ok(())
    }
}
