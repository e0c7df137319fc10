//! `lablink-hal` – Driver Backend layer.
//!
//! Vendor drivers implement the synchronous traits in [`backend`]; device
//! instances only ever talk to those traits. [`retry`] holds the bounded
//! write-retry policy shared by every device, and [`sim`] provides
//! in-process simulators for tests and bench runs without hardware.

pub mod backend;
pub mod retry;
pub mod sim;

pub use backend::{
    PolarimeterBackend, PolarizationReading, PressureBackend, PressureReading, RfSourceBackend,
    SpectrumBackend, StageBackend,
};
pub use retry::{RetryPolicy, SyncTags, WriteQueue};
