use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical kind of a channel, read once from the backend at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Linear,
    Rotation,
    #[default]
    Unknown,
}

/// Motion-controller operating mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MoveMode {
    ClosedLoop,
    OpenLoop,
    Scan,
    #[default]
    Unknown,
}

impl MoveMode {
    /// Modes a controller can actually be put in.
    pub const COMMANDABLE: [MoveMode; 3] = [MoveMode::ClosedLoop, MoveMode::OpenLoop, MoveMode::Scan];

    /// Parse the wire spelling (`closed-loop`, `open-loop`, `scan`).
    /// Underscores and case are tolerated.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "closed-loop" => Some(Self::ClosedLoop),
            "open-loop" => Some(Self::OpenLoop),
            "scan" => Some(Self::Scan),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for MoveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ClosedLoop => "closed-loop",
            Self::OpenLoop => "open-loop",
            Self::Scan => "scan",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Whether the last commanded target has reached the hardware.
///
/// `Stale` means the bounded retry budget ran out: the target was updated
/// but the actual value no longer tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Applied,
    Pending,
    Stale,
}

impl SyncState {
    /// The further-drifted of two tags (`Stale` > `Pending` > `Applied`).
    pub fn worst(self, other: Self) -> Self {
        let rank = |s: Self| match s {
            Self::Applied => 0,
            Self::Pending => 1,
            Self::Stale => 2,
        };
        if rank(other) > rank(self) { other } else { self }
    }
}

/// One controllable or measurable axis within a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub target_position: f64,
    pub actual_position: f64,
    pub mode: MoveMode,
    pub velocity: f64,
    pub supported_modes: Vec<MoveMode>,
    #[serde(default)]
    pub sync: SyncState,
}

impl Channel {
    /// Placeholder for an axis the backend could not identify.
    pub fn unknown() -> Self {
        Self {
            kind: ChannelType::Unknown,
            target_position: 0.0,
            actual_position: 0.0,
            mode: MoveMode::Unknown,
            velocity: 0.0,
            supported_modes: Vec::new(),
            sync: SyncState::Applied,
        }
    }

    pub fn supports(&self, mode: MoveMode) -> bool {
        self.supported_modes.contains(&mode)
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_wire_names() {
        let channel = Channel {
            kind: ChannelType::Rotation,
            target_position: 1.0,
            actual_position: 0.5,
            mode: MoveMode::ClosedLoop,
            velocity: 2.0,
            supported_modes: MoveMode::COMMANDABLE.to_vec(),
            sync: SyncState::Pending,
        };
        let json = serde_json::to_value(&channel).unwrap();
        assert_eq!(json["type"], "rotation");
        assert_eq!(json["mode"], "closed-loop");
        assert_eq!(json["targetPosition"], 1.0);
        assert_eq!(json["supportedModes"][1], "open-loop");
        assert_eq!(json["sync"], "pending");
    }

    #[test]
    fn sync_defaults_when_absent() {
        let json = r#"{"type":"linear","targetPosition":0,"actualPosition":0,
            "mode":"scan","velocity":0,"supportedModes":["scan"]}"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.sync, SyncState::Applied);
        assert!(channel.supports(MoveMode::Scan));
        assert!(!channel.supports(MoveMode::OpenLoop));
    }

    #[test]
    fn worst_sync_state() {
        assert_eq!(SyncState::Applied.worst(SyncState::Pending), SyncState::Pending);
        assert_eq!(SyncState::Stale.worst(SyncState::Applied), SyncState::Stale);
    }

    #[test]
    fn move_mode_parse_is_lenient() {
        assert_eq!(MoveMode::parse("Closed_Loop"), Some(MoveMode::ClosedLoop));
        assert_eq!(MoveMode::parse(" scan "), Some(MoveMode::Scan));
        assert_eq!(MoveMode::parse("stepper"), None);
    }
}
