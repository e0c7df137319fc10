//! [`DeviceRuntime`] – owner of every device instance.
//!
//! The runtime is an arena of devices keyed by unique name. It:
//!
//! 1. **Registers** devices, running their one-time initialisation.
//! 2. **Runs** one Tokio task per device that has a loop.
//! 3. **Routes** `action` / `request` calls to the addressed device's
//!    handlers, under that device's exclusive lock.
//! 4. **Publishes** status changes into the status table and onto the
//!    [`StatusBus`].
//! 5. **Shuts down** by clearing the [`RunFlag`], joining every loop and then
//!    tearing devices down in reverse registration order, so control loops
//!    restore their dependents before the instruments release their drivers.
//!
//! A loop step and a handler of the same device never overlap. A device must
//! not synchronously call back into a device that is itself calling it; the
//! bundled control loops only ever call instruments.
//!
//! # Example
//!
//! ```rust,no_run
//! use lablink_runtime::DeviceRuntime;
//! use lablink_runtime::devices::ConstantsDevice;
//!
//! # async fn demo() -> Result<(), lablink_types::LabError> {
//! let runtime = DeviceRuntime::default();
//! runtime.register("constants", ConstantsDevice::default()).await?;
//! runtime.start();
//! runtime
//!     .action("constants", None, "set", vec!["heterodyneFrequency".into(), 2.0e6.into()])
//!     .await?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lablink_middleware::StatusBus;
use lablink_middleware::bus::DEFAULT_CAPACITY;
use lablink_types::{DeviceState, LabError};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::{DeviceContext, RunFlag};
use crate::device::{Device, DeviceCall};
use crate::health::LoopHealth;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`DeviceRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Extra time on top of a device's poll interval before its loop is
    /// reported stale.
    pub health_grace: Duration,
    /// Buffered events per bus topic.
    pub bus_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            health_grace: Duration::from_secs(10),
            bus_capacity: DEFAULT_CAPACITY,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

struct Slot {
    name: String,
    kind: &'static str,
    interval: Option<Duration>,
    device: tokio::sync::Mutex<Box<dyn Device>>,
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Arc<Slot>>,
    order: Vec<String>,
}

struct Inner {
    config: RuntimeConfig,
    registry: RwLock<Registry>,
    table: RwLock<HashMap<String, Value>>,
    bus: StatusBus,
    run: RunFlag,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    health: Mutex<LoopHealth>,
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceRuntime
// ─────────────────────────────────────────────────────────────────────────────

/// Shared handle to the runtime. Clone it cheaply – all clones share the
/// same devices, table and bus.
#[derive(Clone)]
pub struct DeviceRuntime {
    inner: Arc<Inner>,
}

impl DeviceRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let bus = StatusBus::new(config.bus_capacity);
        Self::with_bus(config, bus)
    }

    /// Build a runtime that publishes onto an existing bus.
    pub fn with_bus(config: RuntimeConfig, bus: StatusBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(Registry::default()),
                table: RwLock::new(HashMap::new()),
                bus,
                run: RunFlag::new(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                health: Mutex::new(LoopHealth::new()),
            }),
        }
    }

    pub fn bus(&self) -> &StatusBus {
        &self.inner.bus
    }

    pub fn run_flag(&self) -> &RunFlag {
        &self.inner.run
    }

    /// The view of the runtime handed to the device registered as `name`.
    pub fn context(&self, name: &str) -> DeviceContext {
        DeviceContext::new(self.clone(), name)
    }

    /// Registered device names, in registration order.
    pub fn device_names(&self) -> Vec<String> {
        self.inner.registry.read().order.clone()
    }

    /// Kind tag of a registered device.
    pub fn device_kind(&self, name: &str) -> Result<&'static str, LabError> {
        self.slot(name).map(|slot| slot.kind)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Initialise `device` and add it under `name`.
    ///
    /// Names are unique for the lifetime of the runtime.
    pub async fn register<D: Device>(&self, name: &str, device: D) -> Result<(), LabError> {
        self.register_boxed(name, Box::new(device)).await
    }

    pub async fn register_boxed(&self, name: &str, mut device: Box<dyn Device>) -> Result<(), LabError> {
        if self.inner.registry.read().by_name.contains_key(name) {
            return Err(LabError::DuplicateDevice(name.to_string()));
        }
        device.initialize(&self.context(name)).await?;
        let status = device.status();
        let slot = Arc::new(Slot {
            name: name.to_string(),
            kind: device.kind(),
            interval: device.poll_interval(),
            device: tokio::sync::Mutex::new(device),
        });
        {
            let mut registry = self.inner.registry.write();
            if registry.by_name.contains_key(name) {
                return Err(LabError::DuplicateDevice(name.to_string()));
            }
            registry.by_name.insert(name.to_string(), Arc::clone(&slot));
            registry.order.push(name.to_string());
        }
        self.publish_status(name, status);
        info!(device = name, kind = slot.kind, "device registered");

        if self.inner.started.load(Ordering::SeqCst) {
            self.spawn_loop(slot);
        }
        Ok(())
    }

    /// Spawn the loop of every device that has one. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<Arc<Slot>> = {
            let registry = self.inner.registry.read();
            registry.order.iter().filter_map(|n| registry.by_name.get(n).cloned()).collect()
        };
        for slot in slots {
            self.spawn_loop(slot);
        }
        info!(devices = self.device_names().len(), "device runtime started");
    }

    /// Stop every loop, wait for them to exit, then tear devices down in
    /// reverse registration order.
    pub async fn shutdown(&self) {
        info!("device runtime shutting down");
        self.inner.run.stop();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "device loop task failed");
            }
        }

        let slots: Vec<Arc<Slot>> = {
            let registry = self.inner.registry.read();
            registry.order.iter().rev().filter_map(|n| registry.by_name.get(n).cloned()).collect()
        };
        for slot in slots {
            let ctx = self.context(&slot.name);
            let mut device = slot.device.lock().await;
            if let Err(e) = device.teardown(&ctx).await {
                error!(device = %slot.name, error = %e, "teardown failed");
                self.inner.bus.publish_fault(&slot.name, format!("teardown failed: {e}"));
            }
            self.publish_status(&slot.name, device.status());
            self.inner.health.lock().unregister(&slot.name);
            debug!(device = %slot.name, "device torn down");
        }
    }

    fn spawn_loop(&self, slot: Arc<Slot>) {
        let Some(interval) = slot.interval else {
            return;
        };
        self.inner
            .health
            .lock()
            .register(&slot.name, interval + self.inner.config.health_grace);
        let span = info_span!("device_loop", device = %slot.name, kind = slot.kind);
        let task = tokio::spawn(run_loop(self.clone(), slot).instrument(span));
        self.inner.tasks.lock().push(task);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────

    /// Invoke a mutating handler and discard its result.
    ///
    /// Returns once the handler has returned; deferred backend retries keep
    /// running in the target's loop.
    pub async fn action(
        &self,
        device: &str,
        channel: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LabError> {
        self.request(device, channel, method, args).await.map(|_| ())
    }

    /// Invoke a handler and return its result.
    pub async fn request(
        &self,
        device: &str,
        channel: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, LabError> {
        let mut call = DeviceCall::new(device, method, args);
        call.channel = channel.map(str::to_string);
        self.invoke(&call).await
    }

    /// Route `call` under the target's lock and publish its status afterwards.
    ///
    /// Handler errors propagate unchanged; the status is published either
    /// way because a handler may have changed state before failing.
    pub async fn invoke(&self, call: &DeviceCall) -> Result<Value, LabError> {
        let slot = self.slot(&call.device)?;
        let ctx = self.context(&slot.name);
        let mut device = slot.device.lock().await;
        let result = device.call(&ctx, call).await;
        self.publish_status(&slot.name, device.status());
        if let Err(ref e) = result {
            debug!(device = %call.device, method = %call.method, error = %e, "handler rejected call");
        }
        result
    }

    /// Copy of the most recently published status of `name`.
    pub fn get_device_state(&self, name: &str) -> Result<DeviceState, LabError> {
        self.inner
            .table
            .read()
            .get(name)
            .cloned()
            .map(DeviceState)
            .ok_or_else(|| LabError::UnknownDevice(name.to_string()))
    }

    /// Record `status` for `name` and notify observers if it changed.
    ///
    /// Returns `true` when a notification was emitted.
    pub fn publish_status(&self, name: &str, status: Value) -> bool {
        {
            let mut table = self.inner.table.write();
            if table.get(name) == Some(&status) {
                return false;
            }
            table.insert(name.to_string(), status.clone());
        }
        self.inner.bus.publish_status(name, status);
        true
    }

    fn slot(&self, name: &str) -> Result<Arc<Slot>, LabError> {
        self.inner
            .registry
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::UnknownDevice(name.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence glue
    // ─────────────────────────────────────────────────────────────────────

    /// Settings blob of every device that has one.
    pub async fn collect_settings(&self) -> BTreeMap<String, Value> {
        let mut blobs = BTreeMap::new();
        for slot in self.slots() {
            if let Some(blob) = slot.device.lock().await.settings() {
                blobs.insert(slot.name.clone(), blob);
            }
        }
        blobs
    }

    /// Hand every blob to the device of the same name.
    ///
    /// Best effort: unknown names and rejected blobs are logged and returned,
    /// the rest are still applied.
    pub async fn restore_settings(&self, blobs: BTreeMap<String, Value>) -> Vec<(String, LabError)> {
        let mut failures = Vec::new();
        for (name, blob) in blobs {
            let slot = match self.slot(&name) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(device = %name, "settings for unregistered device ignored");
                    failures.push((name, e));
                    continue;
                }
            };
            let mut device = slot.device.lock().await;
            match device.load_settings(blob) {
                Ok(()) => debug!(device = %name, "settings restored"),
                Err(e) => {
                    warn!(device = %name, error = %e, "settings rejected");
                    failures.push((name.clone(), e));
                }
            }
            self.publish_status(&name, device.status());
        }
        failures
    }

    /// Save snapshot of every device that provides one.
    pub async fn collect_snapshots(&self) -> BTreeMap<String, Value> {
        let mut snapshots = BTreeMap::new();
        for slot in self.slots() {
            if let Some(snapshot) = slot.device.lock().await.on_save_snapshot() {
                snapshots.insert(slot.name.clone(), snapshot);
            }
        }
        snapshots
    }

    /// Devices whose loop missed its step deadline.
    pub fn stale_devices(&self) -> Vec<String> {
        self.inner.health.lock().stale()
    }

    fn slots(&self) -> Vec<Arc<Slot>> {
        let registry = self.inner.registry.read();
        registry.order.iter().filter_map(|n| registry.by_name.get(n).cloned()).collect()
    }
}

impl Default for DeviceRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device loop
// ─────────────────────────────────────────────────────────────────────────────

/// Step `slot` until the run flag clears. Step errors are logged, published
/// as faults and never end the loop.
async fn run_loop(runtime: DeviceRuntime, slot: Arc<Slot>) {
    debug!("device loop started");
    while runtime.run_flag().is_running() {
        let wait = runtime.step_slot(&slot).await;
        runtime.inner.health.lock().heartbeat(&slot.name);
        if !runtime.run_flag().sleep(wait).await {
            break;
        }
    }
    debug!("device loop exited");
}

impl DeviceRuntime {
    /// Run one loop step of `name` outside its task and return the wait it
    /// asked for. Used by the CLI `step` command and by tests that drive a
    /// loop cycle by cycle without starting the runtime.
    pub async fn step(&self, name: &str) -> Result<Duration, LabError> {
        let slot = self.slot(name)?;
        Ok(self.step_slot(&slot).await)
    }

    async fn step_slot(&self, slot: &Slot) -> Duration {
        let ctx = self.context(&slot.name);
        let fallback = slot.interval.unwrap_or(crate::device::DEFAULT_POLL_INTERVAL);
        let mut device = slot.device.lock().await;
        let wait = match device.poll(&ctx).await {
            Ok(wait) => wait,
            Err(e) => {
                warn!(device = %slot.name, error = %e, "loop step failed, skipping");
                self.inner.bus.publish_fault(&slot.name, e.to_string());
                fallback
            }
        };
        self.publish_status(&slot.name, device.status());
        wait
    }
}
