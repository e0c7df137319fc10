//! Cancellation and the per-device view of the runtime.
//!
//! [`RunFlag`] is the runtime-wide running flag. Loops check it at every
//! iteration boundary and sleep through [`RunFlag::sleep`], which wakes early
//! when the flag is cleared so a stop request is observed within one interval.
//!
//! [`DeviceContext`] is what a device sees of the runtime while it runs: the
//! routing surface (`action`, `request`, `get_device_state`) plus
//! [`DeviceContext::send_status_update`] for its own status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lablink_types::{DeviceState, LabError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;

use crate::device::DeviceCall;
use crate::runtime::DeviceRuntime;

// ─────────────────────────────────────────────────────────────────────────────
// RunFlag
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime-wide running flag with prompt wake-up of sleeping loops.
#[derive(Debug, Clone)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
    stopped: Arc<Notify>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clear the flag and wake every loop currently sleeping.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stopped.notify_waiters();
    }

    /// Sleep for `duration` unless stopped first.
    ///
    /// Returns `true` when the full duration elapsed and the flag still holds.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let stopped = self.stopped.notified();
        tokio::pin!(stopped);
        // Register before re-checking so a concurrent stop() cannot slip
        // between the check and the wait.
        stopped.as_mut().enable();
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = stopped => false,
        }
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceContext
// ─────────────────────────────────────────────────────────────────────────────

/// A device's handle on the runtime it is registered with.
#[derive(Clone)]
pub struct DeviceContext {
    runtime: DeviceRuntime,
    name: String,
}

impl DeviceContext {
    pub(crate) fn new(runtime: DeviceRuntime, name: impl Into<String>) -> Self {
        Self {
            runtime,
            name: name.into(),
        }
    }

    /// Name the device is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.runtime.run_flag().is_running()
    }

    pub fn run_flag(&self) -> &RunFlag {
        self.runtime.run_flag()
    }

    /// Invoke a mutating handler on another device, discarding its result.
    pub async fn action(
        &self,
        device: &str,
        channel: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LabError> {
        self.request(device, channel, method, args).await.map(|_| ())
    }

    /// Invoke a handler on another device and return its result.
    pub async fn request(
        &self,
        device: &str,
        channel: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, LabError> {
        if device == self.name {
            // The caller already holds its own lock.
            return Err(LabError::SelfCall(self.name.clone()));
        }
        let mut call = DeviceCall::new(device, method, args);
        call.channel = channel.map(str::to_string);
        self.runtime.invoke(&call).await
    }

    /// Last published status of `device`.
    pub fn get_device_state(&self, device: &str) -> Result<DeviceState, LabError> {
        self.runtime.get_device_state(device)
    }

    /// Last published status of `device`, deserialized into `T`.
    pub fn state<T: DeserializeOwned>(&self, device: &str) -> Result<T, LabError> {
        self.get_device_state(device)?.typed()
    }

    /// Publish this device's status now rather than at the end of the step.
    pub fn send_status_update(&self, status: Value) -> bool {
        self.runtime.publish_status(&self.name, status)
    }

    /// Publish a swallowed failure on the fault topic.
    pub fn report_fault(&self, message: impl Into<String>) {
        self.runtime.bus().publish_fault(&self.name, message);
    }
}
