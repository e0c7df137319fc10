//! Control loops.
//!
//! These devices own no hardware. They read other devices through
//! [`DeviceContext::state`] and command them with `action` / `request`, so
//! every interaction goes through the runtime's per-device locking.
//!
//! | Loop | Kind | Handlers |
//! |---|---|---|
//! | [`PolarizationLock`] | `polarization-lock` | `start_lock`, `stop_lock` |
//! | [`PositionLock`] | `position-lock` | `start_lock`, `stop_lock`, `set_debug`, `set_gain` |
//! | [`DetuningScan`] | `detuning-scan` | `save_measurement_plan`, `start_scan`, `stop_scan` |
//!
//! A failing cycle is logged, retained in the loop's `lastError` and
//! published on the fault topic. The loop itself keeps running.

mod detuning_scan;
mod polarization_lock;
mod position_lock;

pub use detuning_scan::{DetuningScan, DetuningScanConfig};
pub use polarization_lock::{CycleOutcome, PolarizationLock, PolarizationLockConfig};
pub use position_lock::{Decision, PositionLock, PositionLockConfig, decide};

use lablink_types::{Channel, LabError, StageStatus, check_channel};

use crate::context::DeviceContext;

/// Published channel `channel` of stage device `device`.
pub(crate) fn stage_channel(ctx: &DeviceContext, device: &str, channel: usize) -> Result<Channel, LabError> {
    let stage: StageStatus = ctx.state(device)?;
    let idx = check_channel(channel as i64, stage.channels.len())?;
    Ok(stage.channels[idx].clone())
}
