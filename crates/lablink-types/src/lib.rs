//! `lablink-types` – shared data model for the lab device runtime.
//!
//! | Module | Contents |
//! |---|---|
//! | [`channel`] | [`Channel`], [`ChannelType`], [`MoveMode`], [`SyncState`] |
//! | [`status`] | Typed per-device status payloads and [`DeviceState`] |
//! | [`plan`] | [`MeasurementPlan`] parsing and validation |
//! | [`error`] | [`LabError`] and the shared validation helpers |

pub mod channel;
pub mod error;
pub mod plan;
pub mod status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use channel::{Channel, ChannelType, MoveMode, SyncState};
pub use error::{LabError, check_channel, check_range};
pub use plan::{MeasurementPlan, PlanEntry};
pub use status::*;

/// Unified event wrapper for the status bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Name of the device the event concerns.
    pub device: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(device: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            device: device.into(),
            payload,
        }
    }
}

/// Variants of data routed over the status bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A device published a status that differs from its previous one.
    Status(Value),
    /// A loop step or control cycle failed; the loop carries on.
    Fault { message: String },
}
