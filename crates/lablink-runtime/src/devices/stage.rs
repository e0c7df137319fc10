//! Multi-axis positioner device (piezo stages, rotation mounts).
//!
//! # Handlers
//!
//! | Method | Arguments | Effect |
//! |---|---|---|
//! | `move_to` / `set_position` | `channel, position, [mode]` | Stage a new target and send it |
//! | `set_mode` | `channel, mode` | Switch the controller mode |
//! | `set_velocity` | `channel, velocity, [mode]` | Stage a new velocity |
//! | `stop` | `[channel]` | Halt one or all axes, dropping pending writes |
//!
//! A supplied `mode` must equal the channel's current mode, otherwise the
//! call fails with `InvalidMode` before anything reaches the backend. In
//! open-loop mode the backend receives the relative step from the last
//! target the controller accepted, so a step that never reached the hardware
//! is folded into the next one.
//!
//! Each channel's `sync` tag is the worst outcome across its position and
//! velocity writes.

use std::time::Duration;

use async_trait::async_trait;
use lablink_hal::{RetryPolicy, StageBackend, SyncTags, WriteQueue};
use lablink_types::{
    Channel, ChannelType, LabError, MoveMode, StageStatus, SyncState, check_channel, check_range,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Hard travel limits applied to absolute targets.
    pub travel: Option<(f64, f64)>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            travel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Axis {
    Position,
    Velocity,
}

pub struct StageDevice {
    backend: Box<dyn StageBackend>,
    config: StageConfig,
    channels: Vec<Channel>,
    writes: WriteQueue<(usize, Axis), f64>,
    sync: SyncTags<(usize, Axis)>,
    /// Last position target the backend accepted, per channel.
    applied_targets: Vec<f64>,
}

impl StageDevice {
    pub fn new(backend: impl StageBackend + 'static) -> Self {
        Self::with_config(backend, StageConfig::default())
    }

    pub fn with_config(backend: impl StageBackend + 'static, config: StageConfig) -> Self {
        Self {
            backend: Box::new(backend),
            writes: WriteQueue::new(config.retry),
            config,
            channels: Vec::new(),
            sync: SyncTags::new(),
            applied_targets: Vec::new(),
        }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Resolve `channel` to a usable axis index.
    fn axis(&self, channel: i64) -> Result<usize, LabError> {
        let idx = check_channel(channel, self.channels.len())?;
        if self.channels[idx].kind == ChannelType::Unknown {
            return Err(LabError::InvalidArguments(format!(
                "channel {idx} has an unknown axis type"
            )));
        }
        Ok(idx)
    }

    fn record_sync(&mut self, key: (usize, Axis), state: SyncState) {
        self.sync.record(key, state);
        let idx = key.0;
        if let Some(channel) = self.channels.get_mut(idx) {
            channel.sync = self.sync.worst_where(|(ch, _)| *ch == idx);
        }
    }

    /// The backend and the device agree on `target` for `idx`.
    fn settle_target(&mut self, idx: usize, target: f64) {
        self.channels[idx].target_position = target;
        self.applied_targets[idx] = target;
    }

    fn check_mode(&self, idx: usize, supplied: Option<MoveMode>) -> Result<(), LabError> {
        match supplied {
            Some(mode) if mode != self.channels[idx].mode => Err(LabError::InvalidMode {
                channel: idx,
                actual: self.channels[idx].mode,
                supplied: mode,
            }),
            _ => Ok(()),
        }
    }

    pub fn move_to(&mut self, channel: i64, position: f64, mode: Option<MoveMode>) -> Result<SyncState, LabError> {
        let idx = self.axis(channel)?;
        self.check_mode(idx, mode)?;
        if let Some((min, max)) = self.config.travel {
            check_range("position", position, min, max)?;
        } else if !position.is_finite() {
            return Err(LabError::out_of_range("position", position, f64::MIN, f64::MAX));
        }

        let command = match self.channels[idx].mode {
            MoveMode::OpenLoop => position - self.applied_targets[idx],
            _ => position,
        };
        let backend = &mut self.backend;
        let sync = self
            .writes
            .submit((idx, Axis::Position), command, |v| backend.set_position(idx, v))?;

        if sync == SyncState::Applied {
            self.applied_targets[idx] = position;
        }
        self.channels[idx].target_position = position;
        self.record_sync((idx, Axis::Position), sync);
        debug!(channel = idx, position, ?sync, "move staged");
        Ok(sync)
    }

    pub fn set_mode(&mut self, channel: i64, mode: MoveMode) -> Result<(), LabError> {
        let idx = self.axis(channel)?;
        if !self.channels[idx].supports(mode) {
            return Err(LabError::InvalidArguments(format!(
                "channel {idx} does not support {mode} mode"
            )));
        }
        if self.channels[idx].mode == mode {
            return Ok(());
        }
        let policy = self.writes.policy();
        policy.run(|| self.backend.set_mode(idx, mode))?;
        // Targets are mode-relative; anything still queued is meaningless now.
        self.writes.cancel(&(idx, Axis::Position));
        self.writes.cancel(&(idx, Axis::Velocity));

        let target = self.backend.target_position(idx);
        let velocity = self.backend.velocity(idx);
        self.channels[idx].mode = mode;
        let target = target.unwrap_or(self.channels[idx].target_position);
        self.settle_target(idx, target);
        if let Ok(velocity) = velocity {
            self.channels[idx].velocity = velocity;
        }
        self.record_sync((idx, Axis::Position), SyncState::Applied);
        self.record_sync((idx, Axis::Velocity), SyncState::Applied);
        info!(channel = idx, %mode, "mode changed");
        Ok(())
    }

    pub fn set_velocity(&mut self, channel: i64, velocity: f64, mode: Option<MoveMode>) -> Result<SyncState, LabError> {
        let idx = self.axis(channel)?;
        self.check_mode(idx, mode)?;
        check_range("velocity", velocity, 0.0, f64::MAX)?;
        let backend = &mut self.backend;
        let sync = self
            .writes
            .submit((idx, Axis::Velocity), velocity, |v| backend.set_velocity(idx, v))?;
        self.channels[idx].velocity = velocity;
        self.record_sync((idx, Axis::Velocity), sync);
        Ok(sync)
    }

    pub fn stop(&mut self, channel: Option<i64>) -> Result<(), LabError> {
        let targets: Vec<usize> = match channel {
            Some(ch) => vec![self.axis(ch)?],
            None => (0..self.channels.len())
                .filter(|&i| self.channels[i].kind != ChannelType::Unknown)
                .collect(),
        };
        let policy = self.writes.policy();
        for idx in targets {
            self.writes.cancel(&(idx, Axis::Position));
            policy.run(|| self.backend.stop(idx))?;
            let target = self
                .backend
                .target_position(idx)
                .unwrap_or(self.channels[idx].target_position);
            self.settle_target(idx, target);
            self.record_sync((idx, Axis::Position), SyncState::Applied);
        }
        Ok(())
    }

    fn read_channel(&mut self, idx: usize) -> Result<Channel, LabError> {
        let kind = self.backend.channel_type(idx)?;
        if kind == ChannelType::Unknown {
            return Ok(Channel::unknown());
        }
        let mode = self.backend.mode(idx)?;
        let mut supported_modes = self.backend.supported_modes(idx)?;
        if mode != MoveMode::Unknown && !supported_modes.contains(&mode) {
            warn!(channel = idx, %mode, "controller reports a mode it does not list as supported");
            supported_modes.push(mode);
        }
        Ok(Channel {
            kind,
            target_position: self.backend.target_position(idx)?,
            actual_position: self.backend.position(idx)?,
            mode,
            velocity: self.backend.velocity(idx)?,
            supported_modes,
            sync: SyncState::Applied,
        })
    }
}

#[async_trait]
impl Device for StageDevice {
    fn kind(&self) -> &'static str {
        "stage"
    }

    fn status(&self) -> Value {
        to_status(&StageStatus {
            channels: self.channels.clone(),
        })
    }

    async fn initialize(&mut self, ctx: &DeviceContext) -> Result<(), LabError> {
        let count = self.backend.channel_count()?;
        let channels = (0..count)
            .map(|idx| self.read_channel(idx))
            .collect::<Result<Vec<_>, _>>()?;
        self.applied_targets = channels.iter().map(|c| c.target_position).collect();
        self.channels = channels;
        self.sync = SyncTags::new();
        info!(device = ctx.name(), backend = self.backend.id(), channels = count, "stage initialised");
        Ok(())
    }

    async fn call(&mut self, _ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        let args = &call.args;
        match call.method.as_str() {
            "move_to" | "set_position" => {
                let sync = self.move_to(args.index(0)?, args.f64(1)?, args.opt_mode(2)?)?;
                Ok(serde_json::to_value(sync)?)
            }
            "set_mode" => self.set_mode(args.index(0)?, args.mode(1)?).map(|_| Value::Null),
            "set_velocity" => {
                let sync = self.set_velocity(args.index(0)?, args.f64(1)?, args.opt_mode(2)?)?;
                Ok(serde_json::to_value(sync)?)
            }
            "stop" => self.stop(args.opt_index(0)?).map(|_| Value::Null),
            "get_state" => Ok(self.status()),
            _ => Err(call.unknown()),
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.config.poll_interval)
    }

    async fn poll(&mut self, _ctx: &DeviceContext) -> Result<Duration, LabError> {
        let backend = &mut self.backend;
        let outcomes = self.writes.retry(|(idx, axis), value| match axis {
            Axis::Position => backend.set_position(idx, value),
            Axis::Velocity => backend.set_velocity(idx, value),
        });
        for (key, sync) in outcomes {
            if key.1 == Axis::Position && sync == SyncState::Applied {
                self.applied_targets[key.0] = self.channels[key.0].target_position;
            }
            self.record_sync(key, sync);
        }

        for idx in 0..self.channels.len() {
            if self.channels[idx].kind == ChannelType::Unknown {
                continue;
            }
            match self.backend.position(idx) {
                Ok(position) => self.channels[idx].actual_position = position,
                Err(e) => debug!(channel = idx, error = %e, "position read failed, skipping"),
            }
        }
        Ok(self.config.poll_interval)
    }

    async fn teardown(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        self.backend.close();
        Ok(())
    }

    fn on_save_snapshot(&self) -> Option<Value> {
        let positions: Vec<f64> = self.channels.iter().map(|c| c.actual_position).collect();
        Some(positions.into())
    }
}
