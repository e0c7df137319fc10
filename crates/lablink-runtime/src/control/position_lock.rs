//! Three-point gradient search on one stage axis.
//!
//! The signal is the heterodyne peak: the spectrum analyser's band power
//! around the heterodyne frequency published by the constants device. Each
//! search samples the signal at `p`, `p - step` and `p + step`, waiting for
//! the stage to settle before every sample, then feeds the three samples to
//! [`decide`].
//!
//! The search is a state machine advanced one step per loop iteration. The
//! settle waits are the loop's sleeps, so `stop_lock` and other handlers are
//! served between samples and the lock flag is re-checked at every step.

use std::time::Duration;

use async_trait::async_trait;
use lablink_types::{ConstantsStatus, LabError, MoveMode, PositionLockStatus, SearchPhase};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::stage_channel;
use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

#[derive(Debug, Clone)]
pub struct PositionLockConfig {
    pub stage: String,
    pub stage_channel: usize,
    pub spectrum: String,
    pub spectrum_channel: usize,
    /// Device publishing `heterodyneFrequency`.
    pub constants: String,
    /// Half-width of the integrated band around the heterodyne frequency, Hz.
    pub band_half_width: f64,
    /// Signed: the applied move is `gain * gradient`.
    pub gain: f64,
    pub gradient_clip: f64,
    pub closed_loop_step: f64,
    pub scan_step: f64,
    /// Wait before the centre sample.
    pub first_settle: Duration,
    /// Wait after each probing move.
    pub settle: Duration,
    pub backoff: Duration,
    pub idle_interval: Duration,
    /// FFT averaging requested from the analyser when the lock starts.
    pub averaging_ms: u32,
    /// Compute moves without applying them.
    pub debug: bool,
}

impl Default for PositionLockConfig {
    fn default() -> Self {
        Self {
            stage: "smaract".into(),
            stage_channel: 0,
            spectrum: "het".into(),
            spectrum_channel: 0,
            constants: "constants".into(),
            band_half_width: 5.0e3,
            gain: 1.0,
            gradient_clip: 10.0,
            closed_loop_step: 0.010,
            scan_step: 0.100,
            first_settle: Duration::from_secs(3),
            settle: Duration::from_secs(1),
            backoff: Duration::from_secs(1),
            idle_interval: Duration::from_secs(1),
            averaging_ms: 1000,
            debug: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision rule
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Centre sample is zero or NaN: a sensor fault, nothing is moved.
    Skip,
    /// Centre already below both neighbours: return to the centre.
    Hold,
    /// Clipped normalised gradient to follow.
    Climb(f64),
}

/// Decide the next move from three samples taken `step` apart.
///
/// The gradient is `(plus - minus) / (2 * step) / center`, clipped to
/// `±clip`.
pub fn decide(center: f64, minus: f64, plus: f64, step: f64, clip: f64) -> Decision {
    if center == 0.0 || center.is_nan() {
        return Decision::Skip;
    }
    if center < minus.min(plus) {
        return Decision::Hold;
    }
    let gradient = (plus - minus) / (2.0 * step) / center;
    Decision::Climb(gradient.clamp(-clip, clip))
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Probe {
    origin: f64,
    mode: MoveMode,
    step: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Search {
    Capture,
    Center(Probe),
    Minus { probe: Probe, center: f64 },
    Plus { probe: Probe, center: f64, minus: f64 },
}

impl Search {
    fn phase(&self) -> SearchPhase {
        match self {
            Self::Capture => SearchPhase::Capture,
            Self::Center(_) => SearchPhase::Center,
            Self::Minus { .. } => SearchPhase::Minus,
            Self::Plus { .. } => SearchPhase::Plus,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionLockSettings {
    gain: f64,
    debug: bool,
}

pub struct PositionLock {
    config: PositionLockConfig,
    search: Search,
    status: PositionLockStatus,
}

impl PositionLock {
    pub fn new(config: PositionLockConfig) -> Self {
        let status = PositionLockStatus {
            debug: config.debug,
            ..PositionLockStatus::default()
        };
        Self {
            config,
            search: Search::Capture,
            status,
        }
    }

    fn step_size(&self, mode: MoveMode) -> Result<f64, LabError> {
        match mode {
            MoveMode::ClosedLoop => Ok(self.config.closed_loop_step),
            MoveMode::Scan => Ok(self.config.scan_step),
            other => Err(LabError::InvalidArguments(format!(
                "position lock cannot probe in {other} mode"
            ))),
        }
    }

    async fn signal(&self, ctx: &DeviceContext) -> Result<f64, LabError> {
        let constants: ConstantsStatus = ctx.state(&self.config.constants)?;
        let f = constants.heterodyne_frequency;
        let half = self.config.band_half_width;
        let power = ctx
            .request(
                &self.config.spectrum,
                None,
                "band_power",
                vec![self.config.spectrum_channel.into(), (f - half).into(), (f + half).into()],
            )
            .await?;
        // NaN does not survive JSON; it arrives as null.
        Ok(power.as_f64().unwrap_or(f64::NAN))
    }

    async fn move_axis(&self, ctx: &DeviceContext, position: f64, mode: MoveMode) -> Result<(), LabError> {
        ctx.action(
            &self.config.stage,
            None,
            "move_to",
            vec![self.config.stage_channel.into(), position.into(), mode.to_string().into()],
        )
        .await
    }

    /// Advance the search by one step and return the wait before the next.
    async fn advance(&mut self, ctx: &DeviceContext) -> Result<Duration, LabError> {
        let search = std::mem::replace(&mut self.search, Search::Capture);
        let (next, wait) = match search {
            Search::Capture => {
                let channel = stage_channel(ctx, &self.config.stage, self.config.stage_channel)?;
                let step = self.step_size(channel.mode)?;
                self.status.step = Some(step);
                let probe = Probe {
                    origin: channel.target_position,
                    mode: channel.mode,
                    step,
                };
                (Search::Center(probe), self.config.first_settle)
            }
            Search::Center(probe) => {
                let center = self.signal(ctx).await?;
                self.move_axis(ctx, probe.origin - probe.step, probe.mode).await?;
                (Search::Minus { probe, center }, self.config.settle)
            }
            Search::Minus { probe, center } => {
                let minus = self.signal(ctx).await?;
                self.move_axis(ctx, probe.origin + probe.step, probe.mode).await?;
                (Search::Plus { probe, center, minus }, self.config.settle)
            }
            Search::Plus { probe, center, minus } => {
                let plus = self.signal(ctx).await?;
                self.conclude(ctx, probe, center, minus, plus).await?;
                (Search::Capture, Duration::ZERO)
            }
        };
        self.search = next;
        self.status.phase = next.phase();
        Ok(wait)
    }

    async fn conclude(
        &mut self,
        ctx: &DeviceContext,
        probe: Probe,
        center: f64,
        minus: f64,
        plus: f64,
    ) -> Result<(), LabError> {
        let decision = decide(center, minus, plus, probe.step, self.config.gradient_clip);
        debug!(center, minus, plus, ?decision, "gradient search");
        match decision {
            Decision::Skip => {
                warn!(center, "signal is zero or NaN, skipping");
                self.status.last_error = Some("signal is zero or NaN".into());
                return Ok(());
            }
            Decision::Hold => {
                self.move_axis(ctx, probe.origin, probe.mode).await?;
            }
            Decision::Climb(gradient) => {
                let proposed = probe.origin + self.config.gain * gradient;
                self.status.last_gradient = Some(gradient);
                self.status.last_proposed_position = Some(proposed);
                if self.config.debug {
                    info!(proposed, gradient, "debug mode, move not applied");
                    self.move_axis(ctx, probe.origin, probe.mode).await?;
                } else {
                    self.move_axis(ctx, proposed, probe.mode).await?;
                }
            }
        }
        self.status.last_error = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.search = Search::Capture;
        self.status.phase = if self.status.locked {
            SearchPhase::Capture
        } else {
            SearchPhase::Idle
        };
    }
}

impl Default for PositionLock {
    fn default() -> Self {
        Self::new(PositionLockConfig::default())
    }
}

#[async_trait]
impl Device for PositionLock {
    fn kind(&self) -> &'static str {
        "position-lock"
    }

    fn status(&self) -> Value {
        to_status(&self.status)
    }

    async fn call(&mut self, ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        match call.method.as_str() {
            "start_lock" | "start_z_lock" => {
                ctx.action(
                    &self.config.spectrum,
                    None,
                    "set_fft_averaging",
                    vec![self.config.averaging_ms.into()],
                )
                .await?;
                self.status.locked = true;
                self.status.last_error = None;
                self.reset();
                info!(stage = %self.config.stage, channel = self.config.stage_channel, "position lock engaged");
            }
            "stop_lock" | "stop_z_lock" => {
                self.status.locked = false;
                self.reset();
                info!("position lock released");
            }
            "set_debug" => {
                self.config.debug = call.args.bool(0)?;
                self.status.debug = self.config.debug;
            }
            "set_gain" => {
                let gain = call.args.f64(0)?;
                if !gain.is_finite() {
                    return Err(LabError::InvalidArguments("gain must be finite".into()));
                }
                self.config.gain = gain;
            }
            "get_state" => return Ok(self.status()),
            _ => return Err(call.unknown()),
        }
        Ok(Value::Null)
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.config.idle_interval)
    }

    async fn poll(&mut self, ctx: &DeviceContext) -> Result<Duration, LabError> {
        if !self.status.locked {
            return Ok(self.config.idle_interval);
        }
        match self.advance(ctx).await {
            Ok(wait) => Ok(wait),
            Err(e) => {
                warn!(error = %e, "position lock step failed, restarting search");
                self.status.last_error = Some(e.to_string());
                self.reset();
                ctx.report_fault(e.to_string());
                Ok(self.config.backoff)
            }
        }
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(PositionLockSettings {
            gain: self.config.gain,
            debug: self.config.debug,
        })
        .ok()
    }

    fn load_settings(&mut self, settings: Value) -> Result<(), LabError> {
        let settings: PositionLockSettings = serde_json::from_value(settings)?;
        self.config.gain = settings.gain;
        self.config.debug = settings.debug;
        self.status.debug = settings.debug;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{ConstantsDevice, SpectrumDevice, StageDevice};
    use crate::runtime::DeviceRuntime;
    use lablink_hal::sim::{SimSpectrum, SimSpectrumHandle, SimStage, SimStageHandle};
    use lablink_types::ChannelType;
    use serde_json::json;

    fn approx(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn gradient_is_normalised_and_clipped() {
        // (6 - 8) / (2 * 0.01) / 10 = -10, right at the clip.
        match decide(10.0, 8.0, 6.0, 0.01, 10.0) {
            Decision::Climb(g) => assert!((g + 10.0).abs() < 1e-9),
            other => panic!("expected a climb, got {other:?}"),
        }
        assert_eq!(decide(1.0, 0.0, 10.0, 0.01, 10.0), Decision::Climb(10.0));
        match decide(10.0, 9.9, 10.1, 0.1, 10.0) {
            Decision::Climb(g) => assert!((g - 0.1).abs() < 1e-9),
            other => panic!("expected a climb, got {other:?}"),
        }
    }

    #[test]
    fn zero_nan_and_minimum_are_special() {
        assert_eq!(decide(0.0, 1.0, 2.0, 0.01, 10.0), Decision::Skip);
        assert_eq!(decide(f64::NAN, 1.0, 2.0, 0.01, 10.0), Decision::Skip);
        assert_eq!(decide(5.0, 8.0, 6.0, 0.01, 10.0), Decision::Hold);
    }

    struct Rig {
        runtime: DeviceRuntime,
        stage: SimStageHandle,
        spectrum: SimSpectrumHandle,
    }

    async fn rig(mode: MoveMode, config: PositionLockConfig) -> Result<Rig, LabError> {
        let sim_stage = SimStage::new("smaract").with_channel(ChannelType::Linear, mode);
        let stage = sim_stage.handle();
        let sim_spectrum = SimSpectrum::new("het", 1);
        let spectrum = sim_spectrum.handle();

        let runtime = DeviceRuntime::default();
        runtime.register("smaract", StageDevice::new(sim_stage)).await?;
        runtime.register("het", SpectrumDevice::new(sim_spectrum)).await?;
        runtime.register("constants", ConstantsDevice::default()).await?;
        runtime.register("zlock", PositionLock::new(config)).await?;
        Ok(Rig {
            runtime,
            stage,
            spectrum,
        })
    }

    impl Rig {
        /// Run steps until the search returns to capture.
        async fn search_once(&self) -> Result<Vec<Duration>, LabError> {
            let mut waits = Vec::new();
            for _ in 0..4 {
                waits.push(self.runtime.step("zlock").await?);
            }
            Ok(waits)
        }

        fn status(&self) -> Result<PositionLockStatus, LabError> {
            self.runtime.get_device_state("zlock")?.typed()
        }
    }

    #[tokio::test]
    async fn probes_then_moves_along_the_gradient() -> Result<(), Box<dyn std::error::Error>> {
        let config = PositionLockConfig {
            gain: 0.01,
            ..PositionLockConfig::default()
        };
        let rig = rig(MoveMode::ClosedLoop, config).await?;
        rig.spectrum.push_samples([10.0, 8.0, 6.0]);
        rig.runtime.action("zlock", None, "start_lock", vec![]).await?;
        assert_eq!(rig.spectrum.averaging_ms(), 1000);

        let waits = rig.search_once().await?;
        assert_eq!(
            waits,
            vec![Duration::from_secs(3), Duration::from_secs(1), Duration::from_secs(1), Duration::ZERO]
        );
        assert!(approx(&rig.stage.position_commands(0), &[-0.01, 0.01, -0.1]));
        assert!(rig.spectrum.queries().iter().all(|q| *q == (0, 0.995e6, 1.005e6)));

        let status = rig.status()?;
        assert!(status.last_gradient.is_some_and(|g| (g + 10.0).abs() < 1e-9));
        assert_eq!(status.step, Some(0.01));
        assert_eq!(status.phase, SearchPhase::Capture);
        Ok(())
    }

    #[tokio::test]
    async fn debug_mode_returns_to_origin() -> Result<(), Box<dyn std::error::Error>> {
        let config = PositionLockConfig {
            gain: 0.01,
            ..PositionLockConfig::default()
        };
        let rig = rig(MoveMode::Scan, config).await?;
        rig.spectrum.push_samples([10.0, 8.0, 6.0]);
        rig.runtime.action("zlock", None, "set_debug", vec![json!(true)]).await?;
        rig.runtime.action("zlock", None, "start_lock", vec![]).await?;

        rig.search_once().await?;
        assert!(approx(&rig.stage.position_commands(0), &[-0.1, 0.1, 0.0]));
        let status = rig.status()?;
        assert!(status.debug);
        // Scan step 0.1: (6 - 8) / (2 * 0.1) / 10 = -1, scaled by the gain.
        let gradient = status.last_gradient.ok_or("no gradient")?;
        assert!((gradient - (-1.0)).abs() < 1e-9);
        let proposed = status.last_proposed_position.ok_or("no proposal")?;
        assert!((proposed - (-0.01)).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn zero_signal_skips_without_final_move() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(MoveMode::ClosedLoop, PositionLockConfig::default()).await?;
        rig.spectrum.push_samples([0.0, 8.0, 6.0]);
        rig.runtime.action("zlock", None, "start_lock", vec![]).await?;
        rig.search_once().await?;
        assert!(approx(&rig.stage.position_commands(0), &[-0.01, 0.01]));
        assert!(rig.status()?.last_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_mode_backs_off() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(MoveMode::OpenLoop, PositionLockConfig::default()).await?;
        rig.runtime.action("zlock", None, "start_lock", vec![]).await?;
        assert_eq!(rig.runtime.step("zlock").await?, Duration::from_secs(1));
        let status = rig.status()?;
        assert!(status.last_error.is_some());
        assert_eq!(status.phase, SearchPhase::Capture);
        assert!(rig.stage.commands().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unlocked_loop_idles_and_stop_interrupts() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(MoveMode::ClosedLoop, PositionLockConfig::default()).await?;
        assert_eq!(rig.runtime.step("zlock").await?, Duration::from_secs(1));
        assert!(rig.spectrum.queries().is_empty());

        rig.runtime.action("zlock", None, "start_lock", vec![]).await?;
        rig.runtime.step("zlock").await?;
        rig.runtime.step("zlock").await?;
        rig.runtime.action("zlock", None, "stop_lock", vec![]).await?;
        rig.runtime.step("zlock").await?;
        assert_eq!(rig.spectrum.queries().len(), 1);
        assert_eq!(rig.stage.position_commands(0).len(), 1);
        assert_eq!(rig.status()?.phase, SearchPhase::Idle);
        Ok(())
    }

    #[test]
    fn settings_carry_gain_and_debug() -> Result<(), Box<dyn std::error::Error>> {
        let mut lock = PositionLock::default();
        lock.load_settings(json!({"gain": -0.5, "debug": true}))?;
        assert_eq!(lock.settings(), Some(json!({"gain": -0.5, "debug": true})));
        assert!(lock.status.debug);
        Ok(())
    }
}
