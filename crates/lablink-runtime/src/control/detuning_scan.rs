//! Cavity detuning scan sequencer.
//!
//! Runs a [`MeasurementPlan`] against the RF generator that sets the cavity
//! detuning and the recorder. For entry `i` it:
//!
//! 1. relabels the recorder (`<original> SCAN_<i>`),
//! 2. sets the generator to `base + offset`,
//! 3. starts a recording of `duration` plan units,
//! 4. publishes how many entries remain,
//! 5. waits, one loop step at a time, until the recording stops.
//!
//! The whole plan and the base frequency are validated before the first
//! command. Whatever ends the scan (completion, `stop_scan`, a failing step
//! or runtime shutdown), the remaining count is zeroed and the original
//! label and frequency are restored.

use std::time::Duration;

use async_trait::async_trait;
use lablink_types::{
    LabError, MeasurementPlan, RecorderStatus, RfSourceStatus, ScanStatus, check_channel, check_range,
};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

#[derive(Debug, Clone)]
pub struct DetuningScanConfig {
    pub recorder: String,
    pub rf: String,
    pub rf_channel: usize,
    /// Largest accepted `|offset|`, Hz.
    pub max_abs_offset: f64,
    /// Accepted base frequency, Hz.
    pub base_band: (f64, f64),
    /// Length of one plan duration unit.
    pub duration_unit: Duration,
    pub poll_interval: Duration,
}

impl Default for DetuningScanConfig {
    fn default() -> Self {
        Self {
            recorder: "main".into(),
            rf: "cavity_detuning".into(),
            rf_channel: 0,
            max_abs_offset: 10.0e6,
            base_band: (8.0e9, 10.0e9),
            duration_unit: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// One validated step: absolute frequency and recording length in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Step {
    frequency: f64,
    seconds: f64,
}

#[derive(Debug)]
struct ActiveScan {
    steps: Vec<Step>,
    next: usize,
    recording: bool,
    original_filename: String,
    base_frequency: f64,
}

pub struct DetuningScan {
    config: DetuningScanConfig,
    plan: MeasurementPlan,
    active: Option<ActiveScan>,
    last_error: Option<String>,
}

impl DetuningScan {
    pub fn new(config: DetuningScanConfig) -> Self {
        Self {
            config,
            plan: MeasurementPlan::default(),
            active: None,
            last_error: None,
        }
    }

    fn busy(&self, ctx: &DeviceContext) -> Result<(), LabError> {
        if self.active.is_some() {
            return Err(LabError::Busy {
                device: ctx.name().to_string(),
                reason: "a scan is running".into(),
            });
        }
        Ok(())
    }

    /// Validate `plan` (or the saved plan) and arm the scan. No command is
    /// issued here; the first entry runs on the next loop step.
    fn start(&mut self, ctx: &DeviceContext, plan: Option<&Value>) -> Result<(), LabError> {
        self.busy(ctx)?;
        let plan = match plan {
            Some(value) => MeasurementPlan::from_value(value)?,
            None => self.plan.clone(),
        };
        if plan.is_empty() {
            return Err(LabError::InvalidPlan("measurement plan is empty".into()));
        }
        plan.validate(self.config.max_abs_offset)?;

        let rf: RfSourceStatus = ctx.state(&self.config.rf)?;
        let idx = check_channel(self.config.rf_channel as i64, rf.channels.len())?;
        let (min, max) = self.config.base_band;
        let base_frequency = check_range("base frequency", rf.channels[idx].frequency, min, max)?;
        let recorder: RecorderStatus = ctx.state(&self.config.recorder)?;

        let unit = self.config.duration_unit.as_secs_f64();
        let steps = plan
            .targets(base_frequency)
            .into_iter()
            .zip(&plan.entries)
            .map(|(frequency, entry)| Step {
                frequency,
                seconds: entry.duration * unit,
            })
            .collect();
        info!(entries = plan.len(), base_frequency, "detuning scan armed");
        self.plan = plan;
        self.last_error = None;
        self.active = Some(ActiveScan {
            steps,
            next: 0,
            recording: false,
            original_filename: recorder.filename,
            base_frequency,
        });
        Ok(())
    }

    /// One sequencer step: either keep waiting for the recording or start
    /// the next entry.
    async fn advance(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.recording {
            let recorder: RecorderStatus = ctx.state(&self.config.recorder)?;
            if recorder.is_recording {
                return Ok(());
            }
            active.recording = false;
            active.next += 1;
        }
        let Some(step) = active.steps.get(active.next).copied() else {
            info!("detuning scan complete");
            return self.finish(ctx).await;
        };
        let i = active.next;
        let remaining = active.steps.len() - i - 1;
        let label = format!("{} SCAN_{i}", active.original_filename);

        let cfg = &self.config;
        ctx.action(&cfg.recorder, None, "set_filename", vec![label.into()]).await?;
        ctx.action(&cfg.rf, None, "set_frequency", vec![cfg.rf_channel.into(), step.frequency.into()])
            .await?;
        ctx.action(&cfg.recorder, None, "start_recording", vec![step.seconds.into()]).await?;
        ctx.action(&cfg.recorder, None, "set_remaining_recordings", vec![remaining.into()])
            .await?;
        info!(entry = i, frequency = step.frequency, seconds = step.seconds, remaining, "scan entry started");
        if let Some(active) = self.active.as_mut() {
            active.recording = true;
        }
        Ok(())
    }

    /// End the scan and restore the recorder and generator. Every restore
    /// step is attempted; the first failure is returned.
    async fn finish(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let cfg = &self.config;
        let restores = [
            (&cfg.recorder, "set_remaining_recordings", vec![json!(0)]),
            (&cfg.recorder, "set_filename", vec![json!(active.original_filename)]),
            (&cfg.rf, "set_frequency", vec![json!(cfg.rf_channel), json!(active.base_frequency)]),
        ];
        let mut first_error = None;
        for (device, method, args) in restores {
            if let Err(e) = ctx.action(device, None, method, args).await {
                error!(device = %device, method, error = %e, "scan cleanup step failed");
                first_error.get_or_insert(e);
            }
        }
        info!(base_frequency = active.base_frequency, "detuning scan cleaned up");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        let recording = self.active.as_ref().is_some_and(|a| a.recording);
        if recording {
            if let Err(e) = ctx.action(&self.config.recorder, None, "stop_recording", vec![]).await {
                warn!(error = %e, "could not stop the scan recording");
            }
        }
        self.finish(ctx).await
    }

    fn scan_status(&self) -> ScanStatus {
        let (current_entry, remaining) = match &self.active {
            Some(active) => (Some(active.next), active.steps.len() - active.next),
            None => (None, 0),
        };
        ScanStatus {
            measurement_plan: self.plan.clone(),
            running: self.active.is_some(),
            current_entry,
            remaining,
            last_error: self.last_error.clone(),
        }
    }
}

impl Default for DetuningScan {
    fn default() -> Self {
        Self::new(DetuningScanConfig::default())
    }
}

#[async_trait]
impl Device for DetuningScan {
    fn kind(&self) -> &'static str {
        "detuning-scan"
    }

    fn status(&self) -> Value {
        to_status(&self.scan_status())
    }

    async fn call(&mut self, ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        match call.method.as_str() {
            "save_measurement_plan" => {
                self.busy(ctx)?;
                self.plan = MeasurementPlan::from_value(call.args.value(0)?)?;
            }
            "start_scan" => self.start(ctx, call.args.get(0))?,
            "stop_scan" => {
                info!("detuning scan stopped by request");
                self.stop(ctx).await?;
            }
            "get_state" => return Ok(self.status()),
            _ => return Err(call.unknown()),
        }
        Ok(Value::Null)
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.config.poll_interval)
    }

    async fn poll(&mut self, ctx: &DeviceContext) -> Result<Duration, LabError> {
        if let Err(e) = self.advance(ctx).await {
            error!(error = %e, "detuning scan aborted");
            self.last_error = Some(e.to_string());
            if let Err(cleanup) = self.finish(ctx).await {
                self.last_error = Some(format!("{e}; cleanup failed: {cleanup}"));
            }
            return Err(e);
        }
        Ok(self.config.poll_interval)
    }

    async fn teardown(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        if self.active.is_some() {
            warn!("runtime stopping mid-scan, restoring");
        }
        self.finish(ctx).await
    }

    fn settings(&self) -> Option<Value> {
        Some(json!({ "measurementPlan": self.plan }))
    }

    fn load_settings(&mut self, settings: Value) -> Result<(), LabError> {
        let plan = settings
            .get("measurementPlan")
            .ok_or_else(|| LabError::InvalidPlan("settings carry no measurementPlan".into()))?;
        self.plan = MeasurementPlan::from_value(plan)?;
        Ok(())
    }
}
