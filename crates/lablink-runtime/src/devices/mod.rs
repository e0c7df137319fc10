//! Instrument devices.
//!
//! Each wraps one backend from `lablink-hal` behind the [`Device`] contract.
//!
//! | Device | Kind | Loop |
//! |---|---|---|
//! | [`StageDevice`] | `stage` | 100 ms |
//! | [`RfSourceDevice`] | `rf-source` | 1 s |
//! | [`PolarimeterDevice`] | `polarimeter` | 500 ms |
//! | [`PressureGaugeDevice`] | `pressure-gauge` | 1 s |
//! | [`SpectrumDevice`] | `spectrum` | none |
//! | [`RecorderDevice`] | `recorder` | 100 ms |
//! | [`ConstantsDevice`] | `constants` | none |
//!
//! [`Device`]: crate::device::Device

mod constants;
mod polarimeter;
mod pressure;
mod recorder;
mod rf_source;
mod spectrum;
mod stage;

pub use constants::ConstantsDevice;
pub use polarimeter::PolarimeterDevice;
pub use pressure::PressureGaugeDevice;
pub use recorder::RecorderDevice;
pub use rf_source::{RfSourceConfig, RfSourceDevice};
pub use spectrum::SpectrumDevice;
pub use stage::{StageConfig, StageDevice};
