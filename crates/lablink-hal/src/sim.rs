//! In-process simulated backends for CI and bench testing without hardware.
//!
//! Each simulator keeps its state behind a shared handle so tests (and other
//! simulators) can observe commands and steer readings while the owning
//! device drives the backend.
//!
//! | Simulator | Behaviour |
//! |---|---|
//! | [`SimStage`] | Moves instantly to the commanded target; open-loop commands are relative steps. Logs every command. |
//! | [`SimRfSource`] | Stores frequency, power and output state; logs every frequency command. |
//! | [`SimPolarimeter`] | Returns the reading last set through its handle. |
//! | [`SimSpectrum`] | Returns scripted samples first, then a quadratic well around an optimum of a coupled stage axis. |
//! | [`SimPressureGauge`] | Returns the pressures last set through its handle. |
//!
//! All simulators accept a [`FaultInjector`] so retry and skip paths can be
//! exercised deterministically.
//!
//! # Example
//!
//! ```rust
//! use lablink_hal::backend::StageBackend;
//! use lablink_hal::sim::{FaultInjector, SimStage};
//! use lablink_types::{ChannelType, MoveMode};
//!
//! let faults = FaultInjector::default();
//! let mut stage = SimStage::new("smaract")
//!     .with_channel(ChannelType::Linear, MoveMode::ClosedLoop)
//!     .with_faults(faults.clone());
//! let handle = stage.handle();
//!
//! faults.fail_next_writes(1);
//! assert!(stage.set_position(0, 1.0).is_err());
//! stage.set_position(0, 1.0).unwrap();
//! assert_eq!(handle.position(0), Some(1.0));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lablink_types::{ChannelType, LabError, MoveMode};
use parking_lot::Mutex;

use crate::backend::{
    PolarimeterBackend, PolarizationReading, PressureBackend, PressureReading, RfSourceBackend,
    SpectrumBackend, StageBackend,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fault injection
// ─────────────────────────────────────────────────────────────────────────────

/// Shared switchboard for injected backend faults.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    failing_writes: Arc<AtomicU32>,
    failing_reads: Arc<AtomicU32>,
    offline: Arc<AtomicBool>,
}

impl FaultInjector {
    /// The next `n` write operations fail with a backend fault.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// The next `n` read operations fail with a backend fault.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// While offline every operation fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn check_write(&self, component: &str) -> Result<(), LabError> {
        Self::check(&self.failing_writes, &self.offline, component, "write")
    }

    pub fn check_read(&self, component: &str) -> Result<(), LabError> {
        Self::check(&self.failing_reads, &self.offline, component, "read")
    }

    fn check(budget: &AtomicU32, offline: &AtomicBool, component: &str, op: &str) -> Result<(), LabError> {
        if offline.load(Ordering::SeqCst) {
            return Err(LabError::backend(component, "communication lost"));
        }
        let consumed = budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            Err(LabError::backend(component, format!("injected {op} fault")))
        } else {
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage
// ─────────────────────────────────────────────────────────────────────────────

/// A command a [`SimStage`] accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageCommand {
    SetPosition { channel: usize, value: f64 },
    SetVelocity { channel: usize, value: f64 },
    SetMode { channel: usize, mode: MoveMode },
    Stop { channel: usize },
}

#[derive(Debug, Clone)]
struct SimAxis {
    kind: ChannelType,
    mode: MoveMode,
    target: f64,
    position: f64,
    velocity: f64,
}

#[derive(Debug, Default)]
struct SimStageState {
    axes: Vec<SimAxis>,
    commands: Vec<StageCommand>,
}

/// Observer and steering handle for a [`SimStage`].
#[derive(Debug, Clone)]
pub struct SimStageHandle {
    state: Arc<Mutex<SimStageState>>,
}

impl SimStageHandle {
    /// Every command the stage accepted, oldest first.
    pub fn commands(&self) -> Vec<StageCommand> {
        self.state.lock().commands.clone()
    }

    /// Accepted `set_position` values for `channel`, oldest first.
    pub fn position_commands(&self, channel: usize) -> Vec<f64> {
        self.state
            .lock()
            .commands
            .iter()
            .filter_map(|cmd| match *cmd {
                StageCommand::SetPosition { channel: c, value } if c == channel => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, channel: usize) -> Option<f64> {
        self.state.lock().axes.get(channel).map(|a| a.position)
    }

    pub fn mode(&self, channel: usize) -> Option<MoveMode> {
        self.state.lock().axes.get(channel).map(|a| a.mode)
    }

    /// Displace an axis without a command, e.g. to model drift.
    pub fn set_actual(&self, channel: usize, position: f64) {
        if let Some(axis) = self.state.lock().axes.get_mut(channel) {
            axis.position = position;
        }
    }
}

pub struct SimStage {
    id: String,
    state: Arc<Mutex<SimStageState>>,
    faults: FaultInjector,
}

impl SimStage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(SimStageState::default())),
            faults: FaultInjector::default(),
        }
    }

    /// Append an axis of the given kind, starting at zero in `mode`.
    pub fn with_channel(self, kind: ChannelType, mode: MoveMode) -> Self {
        self.state.lock().axes.push(SimAxis {
            kind,
            mode,
            target: 0.0,
            position: 0.0,
            velocity: 1.0,
        });
        self
    }

    /// Start the most recently added axis at `position`.
    pub fn at(self, position: f64) -> Self {
        if let Some(axis) = self.state.lock().axes.last_mut() {
            axis.target = position;
            axis.position = position;
        }
        self
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn handle(&self) -> SimStageHandle {
        SimStageHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn axis<T>(&self, channel: usize, f: impl FnOnce(&mut SimAxis) -> T) -> Result<T, LabError> {
        let mut state = self.state.lock();
        state
            .axes
            .get_mut(channel)
            .map(f)
            .ok_or_else(|| LabError::backend(&self.id, format!("no axis {channel}")))
    }

    fn log(&self, command: StageCommand) {
        self.state.lock().commands.push(command);
    }
}

impl StageBackend for SimStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_count(&mut self) -> Result<usize, LabError> {
        self.faults.check_read(&self.id)?;
        Ok(self.state.lock().axes.len())
    }

    fn channel_type(&mut self, channel: usize) -> Result<ChannelType, LabError> {
        self.axis(channel, |a| a.kind)
    }

    fn position(&mut self, channel: usize) -> Result<f64, LabError> {
        self.faults.check_read(&self.id)?;
        self.axis(channel, |a| a.position)
    }

    fn target_position(&mut self, channel: usize) -> Result<f64, LabError> {
        self.faults.check_read(&self.id)?;
        self.axis(channel, |a| a.target)
    }

    fn set_position(&mut self, channel: usize, position: f64) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        self.axis(channel, |a| {
            a.target = match a.mode {
                MoveMode::OpenLoop => a.position + position,
                _ => position,
            };
            a.position = a.target;
        })?;
        self.log(StageCommand::SetPosition { channel, value: position });
        Ok(())
    }

    fn velocity(&mut self, channel: usize) -> Result<f64, LabError> {
        self.axis(channel, |a| a.velocity)
    }

    fn set_velocity(&mut self, channel: usize, velocity: f64) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        self.axis(channel, |a| a.velocity = velocity)?;
        self.log(StageCommand::SetVelocity { channel, value: velocity });
        Ok(())
    }

    fn mode(&mut self, channel: usize) -> Result<MoveMode, LabError> {
        self.axis(channel, |a| a.mode)
    }

    fn set_mode(&mut self, channel: usize, mode: MoveMode) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        self.axis(channel, |a| a.mode = mode)?;
        self.log(StageCommand::SetMode { channel, mode });
        Ok(())
    }

    fn stop(&mut self, channel: usize) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        self.axis(channel, |a| a.target = a.position)?;
        self.log(StageCommand::Stop { channel });
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RF source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimRfState {
    frequency: f64,
    power: f64,
    on: bool,
    frequency_log: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SimRfHandle {
    state: Arc<Mutex<SimRfState>>,
}

impl SimRfHandle {
    pub fn frequency(&self) -> f64 {
        self.state.lock().frequency
    }

    /// Every accepted frequency command, oldest first.
    pub fn frequency_log(&self) -> Vec<f64> {
        self.state.lock().frequency_log.clone()
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().on
    }
}

pub struct SimRfSource {
    id: String,
    state: Arc<Mutex<SimRfState>>,
    faults: FaultInjector,
}

impl SimRfSource {
    pub fn new(id: impl Into<String>, frequency: f64) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(SimRfState {
                frequency,
                power: -10.0,
                on: false,
                frequency_log: Vec::new(),
            })),
            faults: FaultInjector::default(),
        }
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn handle(&self) -> SimRfHandle {
        SimRfHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl RfSourceBackend for SimRfSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn frequency(&mut self) -> Result<f64, LabError> {
        self.faults.check_read(&self.id)?;
        Ok(self.state.lock().frequency)
    }

    fn set_frequency(&mut self, hz: f64) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        let mut state = self.state.lock();
        state.frequency = hz;
        state.frequency_log.push(hz);
        Ok(())
    }

    fn power(&mut self) -> Result<f64, LabError> {
        self.faults.check_read(&self.id)?;
        Ok(self.state.lock().power)
    }

    fn set_power(&mut self, dbm: f64) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        self.state.lock().power = dbm;
        Ok(())
    }

    fn output(&mut self) -> Result<bool, LabError> {
        self.faults.check_read(&self.id)?;
        Ok(self.state.lock().on)
    }

    fn set_output(&mut self, on: bool) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        self.state.lock().on = on;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Polarimeter
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimPolarimeterHandle {
    reading: Arc<Mutex<PolarizationReading>>,
}

impl SimPolarimeterHandle {
    pub fn set_reading(&self, reading: PolarizationReading) {
        *self.reading.lock() = reading;
    }

    /// Set an `ok` reading from angles given in degrees.
    pub fn set_degrees(&self, dop: f64, theta_deg: f64, eta_deg: f64) {
        self.set_reading(PolarizationReading {
            status: "ok".into(),
            dop,
            theta: theta_deg.to_radians(),
            eta: eta_deg.to_radians(),
        });
    }
}

pub struct SimPolarimeter {
    id: String,
    reading: Arc<Mutex<PolarizationReading>>,
    faults: FaultInjector,
}

impl SimPolarimeter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reading: Arc::new(Mutex::new(PolarizationReading {
                status: "ok".into(),
                dop: 1.0,
                theta: 0.0,
                eta: 0.0,
            })),
            faults: FaultInjector::default(),
        }
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn handle(&self) -> SimPolarimeterHandle {
        SimPolarimeterHandle {
            reading: Arc::clone(&self.reading),
        }
    }
}

impl PolarimeterBackend for SimPolarimeter {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&mut self) -> Result<PolarizationReading, LabError> {
        self.faults.check_read(&self.id)?;
        Ok(self.reading.lock().clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Spectrum
// ─────────────────────────────────────────────────────────────────────────────

/// Quadratic signal model `floor + curvature * (z - optimum)^2` over one
/// stage axis.
#[derive(Debug, Clone)]
struct Well {
    stage: SimStageHandle,
    channel: usize,
    optimum: f64,
    curvature: f64,
    floor: f64,
}

#[derive(Debug, Default)]
struct SimSpectrumState {
    scripted: VecDeque<f64>,
    queries: Vec<(usize, f64, f64)>,
    averaging_ms: u32,
}

#[derive(Debug, Clone)]
pub struct SimSpectrumHandle {
    state: Arc<Mutex<SimSpectrumState>>,
}

impl SimSpectrumHandle {
    /// Queue samples returned, in order, before the model is consulted.
    pub fn push_samples(&self, samples: impl IntoIterator<Item = f64>) {
        self.state.lock().scripted.extend(samples);
    }

    /// Every `(channel, f_min, f_max)` band queried, oldest first.
    pub fn queries(&self) -> Vec<(usize, f64, f64)> {
        self.state.lock().queries.clone()
    }

    pub fn averaging_ms(&self) -> u32 {
        self.state.lock().averaging_ms
    }
}

pub struct SimSpectrum {
    id: String,
    channels: usize,
    well: Option<Well>,
    state: Arc<Mutex<SimSpectrumState>>,
    faults: FaultInjector,
}

impl SimSpectrum {
    pub fn new(id: impl Into<String>, channels: usize) -> Self {
        Self {
            id: id.into(),
            channels,
            well: None,
            state: Arc::new(Mutex::new(SimSpectrumState::default())),
            faults: FaultInjector::default(),
        }
    }

    /// Derive band power from the position of a simulated stage axis.
    pub fn coupled_to(mut self, stage: SimStageHandle, channel: usize, optimum: f64, curvature: f64, floor: f64) -> Self {
        self.well = Some(Well {
            stage,
            channel,
            optimum,
            curvature,
            floor,
        });
        self
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn handle(&self) -> SimSpectrumHandle {
        SimSpectrumHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SpectrumBackend for SimSpectrum {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn band_power(&mut self, channel: usize, f_min: f64, f_max: f64) -> Result<f64, LabError> {
        self.faults.check_read(&self.id)?;
        let mut state = self.state.lock();
        state.queries.push((channel, f_min, f_max));
        if let Some(sample) = state.scripted.pop_front() {
            return Ok(sample);
        }
        drop(state);
        match &self.well {
            Some(well) => {
                let z = well.stage.position(well.channel).unwrap_or(well.optimum);
                Ok(well.floor + well.curvature * (z - well.optimum).powi(2))
            }
            None => Ok(0.0),
        }
    }

    fn set_averaging(&mut self, millis: u32) -> Result<(), LabError> {
        self.faults.check_write(&self.id)?;
        self.state.lock().averaging_ms = millis;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pressure gauge
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimPressureHandle {
    pressures: Arc<Mutex<Vec<Option<f64>>>>,
}

impl SimPressureHandle {
    pub fn set_pressure(&self, channel: usize, pressure: Option<f64>) {
        if let Some(slot) = self.pressures.lock().get_mut(channel) {
            *slot = pressure;
        }
    }
}

pub struct SimPressureGauge {
    id: String,
    pressures: Arc<Mutex<Vec<Option<f64>>>>,
    faults: FaultInjector,
}

impl SimPressureGauge {
    pub fn new(id: impl Into<String>, pressures: Vec<Option<f64>>) -> Self {
        Self {
            id: id.into(),
            pressures: Arc::new(Mutex::new(pressures)),
            faults: FaultInjector::default(),
        }
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn handle(&self) -> SimPressureHandle {
        SimPressureHandle {
            pressures: Arc::clone(&self.pressures),
        }
    }
}

impl PressureBackend for SimPressureGauge {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_count(&self) -> usize {
        self.pressures.lock().len()
    }

    fn read(&mut self, channel: usize) -> Result<PressureReading, LabError> {
        self.faults.check_read(&self.id)?;
        let pressure = self
            .pressures
            .lock()
            .get(channel)
            .copied()
            .ok_or_else(|| LabError::backend(&self.id, format!("no gauge {channel}")))?;
        Ok(PressureReading {
            pressure,
            status: if pressure.is_some() { "ok" } else { "off" }.into(),
        })
    }
}
