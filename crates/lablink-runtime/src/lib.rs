//! `lablink-runtime` – the device runtime.
//!
//! Hosts named devices, runs each device's periodic loop on its own Tokio
//! task, routes handler calls to devices one at a time, and keeps a table of
//! the latest published status of every device.
//!
//! # Modules
//!
//! - [`device`] – the [`Device`] contract plus [`DeviceCall`] / [`Args`]
//!   argument decoding.
//! - [`context`] – [`DeviceContext`], the handle a device uses to reach the
//!   rest of the rig, and the shared [`RunFlag`].
//! - [`runtime`] – [`DeviceRuntime`]: registration, routing, loops and the
//!   status table.
//! - [`devices`] – instrument devices wrapping `lablink-hal` backends.
//! - [`control`] – control loops built purely on other devices' state:
//!   polarization lock, position lock and the detuning scan.
//! - [`settings`] – [`SettingsStore`][settings::SettingsStore]: persisted
//!   per-device settings and save snapshots.
//! - [`health`] – [`LoopHealth`][health::LoopHealth]: heartbeat-based stale
//!   loop detection.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging with optional OTLP span export.
//!
//! # Concurrency
//!
//! Every device sits behind its own async mutex. A handler call and a loop
//! step on the same device never overlap; calls on different devices run
//! concurrently. Status is published after every call and every step, and
//! observers are only notified when the published value changes.

pub mod context;
pub mod control;
pub mod device;
pub mod devices;
pub mod health;
pub mod runtime;
pub mod settings;
pub mod telemetry;

pub use context::{DeviceContext, RunFlag};
pub use device::{Args, DEFAULT_POLL_INTERVAL, Device, DeviceCall};
pub use runtime::{DeviceRuntime, RuntimeConfig};
pub use settings::SettingsStore;
pub use telemetry::{TracerProviderGuard, init_tracing};
