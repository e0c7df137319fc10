//! Driver Backend contracts.
//!
//! A backend is the thin, synchronous layer that speaks one instrument's wire
//! protocol. Device instances in `lablink-runtime` own exactly one backend and
//! only ever talk to the trait, so vendor drivers and the simulators in
//! [`crate::sim`] are interchangeable.
//!
//! Every call may block briefly and may fail with
//! [`LabError::Backend`]; callers treat that as transient.
//!
//! | Trait | Instruments |
//! |---|---|
//! | [`StageBackend`] | Piezo positioners, rotation mounts |
//! | [`RfSourceBackend`] | Signal generators |
//! | [`PolarimeterBackend`] | Polarimeters |
//! | [`SpectrumBackend`] | Heterodyne FFT readout |
//! | [`PressureBackend`] | Vacuum gauges |

use lablink_types::{ChannelType, LabError, MoveMode};

/// A multi-channel positioner.
pub trait StageBackend: Send {
    /// Stable identifier used in logs and fault messages.
    fn id(&self) -> &str;

    fn channel_count(&mut self) -> Result<usize, LabError>;

    fn channel_type(&mut self, channel: usize) -> Result<ChannelType, LabError>;

    /// Measured position of `channel`.
    fn position(&mut self, channel: usize) -> Result<f64, LabError>;

    /// Last target the controller accepted for `channel`.
    fn target_position(&mut self, channel: usize) -> Result<f64, LabError>;

    /// Command `channel` to `position`.
    ///
    /// In [`MoveMode::OpenLoop`] the value is a relative step, otherwise an
    /// absolute target.
    fn set_position(&mut self, channel: usize, position: f64) -> Result<(), LabError>;

    fn velocity(&mut self, channel: usize) -> Result<f64, LabError>;

    fn set_velocity(&mut self, channel: usize, velocity: f64) -> Result<(), LabError>;

    fn mode(&mut self, channel: usize) -> Result<MoveMode, LabError>;

    fn set_mode(&mut self, channel: usize, mode: MoveMode) -> Result<(), LabError>;

    /// Modes `channel` can be switched to. Defaults to every commandable mode.
    fn supported_modes(&mut self, _channel: usize) -> Result<Vec<MoveMode>, LabError> {
        Ok(MoveMode::COMMANDABLE.to_vec())
    }

    fn stop(&mut self, channel: usize) -> Result<(), LabError>;

    /// Release the driver handle. Called once when the owning device exits.
    fn close(&mut self) {}
}

/// A single-output RF signal generator.
pub trait RfSourceBackend: Send {
    fn id(&self) -> &str;

    fn frequency(&mut self) -> Result<f64, LabError>;

    fn set_frequency(&mut self, hz: f64) -> Result<(), LabError>;

    fn power(&mut self) -> Result<f64, LabError>;

    fn set_power(&mut self, dbm: f64) -> Result<(), LabError>;

    fn output(&mut self) -> Result<bool, LabError>;

    fn set_output(&mut self, on: bool) -> Result<(), LabError>;

    fn close(&mut self) {}
}

/// One polarimeter measurement. Angles in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarizationReading {
    /// Sensor-reported condition, `"ok"` when the measurement is valid.
    pub status: String,
    /// Degree of polarization in `[0, 1]`.
    pub dop: f64,
    /// Orientation angle of the polarization ellipse.
    pub theta: f64,
    /// Ellipticity angle.
    pub eta: f64,
}

pub trait PolarimeterBackend: Send {
    fn id(&self) -> &str;

    fn read(&mut self) -> Result<PolarizationReading, LabError>;

    fn close(&mut self) {}
}

/// Heterodyne FFT readout.
pub trait SpectrumBackend: Send {
    fn id(&self) -> &str;

    fn channel_count(&self) -> usize;

    /// Sum of the averaged power spectral density of `channel` over
    /// `[f_min, f_max]` Hz.
    fn band_power(&mut self, channel: usize, f_min: f64, f_max: f64) -> Result<f64, LabError>;

    /// Set the FFT averaging window.
    fn set_averaging(&mut self, millis: u32) -> Result<(), LabError>;

    fn close(&mut self) {}
}

/// One gauge measurement. `pressure` is `None` when the gauge is off or
/// over/under range.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureReading {
    pub pressure: Option<f64>,
    pub status: String,
}

pub trait PressureBackend: Send {
    fn id(&self) -> &str;

    fn channel_count(&self) -> usize;

    fn read(&mut self, channel: usize) -> Result<PressureReading, LabError>;

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─────────────────────────────────────────────────────────────────────
    // Test doubles
    // ─────────────────────────────────────────────────────────────────────

    /// Single-channel stage with no optional capabilities.
    struct BareStage {
        position: f64,
    }

    impl StageBackend for BareStage {
        fn id(&self) -> &str {
            "bare"
        }
        fn channel_count(&mut self) -> Result<usize, LabError> {
            Ok(1)
        }
        fn channel_type(&mut self, _channel: usize) -> Result<ChannelType, LabError> {
            Ok(ChannelType::Linear)
        }
        fn position(&mut self, _channel: usize) -> Result<f64, LabError> {
            Ok(self.position)
        }
        fn target_position(&mut self, _channel: usize) -> Result<f64, LabError> {
            Ok(self.position)
        }
        fn set_position(&mut self, _channel: usize, position: f64) -> Result<(), LabError> {
            self.position = position;
            Ok(())
        }
        fn velocity(&mut self, _channel: usize) -> Result<f64, LabError> {
            Ok(0.0)
        }
        fn set_velocity(&mut self, _channel: usize, _velocity: f64) -> Result<(), LabError> {
            Err(LabError::backend("bare", "velocity control not supported"))
        }
        fn mode(&mut self, _channel: usize) -> Result<MoveMode, LabError> {
            Ok(MoveMode::ClosedLoop)
        }
        fn set_mode(&mut self, _channel: usize, _mode: MoveMode) -> Result<(), LabError> {
            Ok(())
        }
        fn stop(&mut self, _channel: usize) -> Result<(), LabError> {
            Ok(())
        }
    }

    #[test]
    fn default_supported_modes_cover_commandable_modes() -> Result<(), LabError> {
        let mut stage = BareStage { position: 0.0 };
        let modes = stage.supported_modes(0)?;
        assert_eq!(modes.len(), 3);
        assert!(!modes.contains(&MoveMode::Unknown));
        Ok(())
    }

    #[test]
    fn backend_works_as_trait_object() -> Result<(), LabError> {
        let mut stage: Box<dyn StageBackend> = Box::new(BareStage { position: 0.0 });
        stage.set_position(0, 1.25)?;
        assert_eq!(stage.position(0)?, 1.25);
        assert!(stage.set_velocity(0, 1.0).is_err());
        stage.close();
        Ok(())
    }
}
