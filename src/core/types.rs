use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one slot in the shared parameter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamId(pub u8);

impl ParamId {
    /// Set once the actuator controller has finished booting
    pub const BOOT_FLAG: ParamId = ParamId(0);
    /// Buzzer request
    pub const BUZZER: ParamId = ParamId(1);
    /// Latched emergency disable
    pub const EMERGENCY_DISABLE: ParamId = ParamId(2);

    /// Ids a bulk refresh must never overwrite
    pub const BULK_EXCLUDED: [ParamId; 3] =
        [ParamId::BOOT_FLAG, ParamId::BUZZER, ParamId::EMERGENCY_DISABLE];

    /// Returns the table index of this id
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier carried in the operation byte of a Command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub u8);

impl CommandId {
    /// Liveness probe
    pub const KEEPALIVE: CommandId = CommandId(1);
    /// Persist the parameter table on the receiving side
    pub const SAVE_PARAMETERS: CommandId = CommandId(2);
    /// Reset the parameter table to defaults on the receiving side
    pub const RESTORE_DEFAULTS: CommandId = CommandId(3);
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CommandId::KEEPALIVE => f.write_str("keepalive"),
            CommandId::SAVE_PARAMETERS => f.write_str("save-parameters"),
            CommandId::RESTORE_DEFAULTS => f.write_str("restore-defaults"),
            CommandId(other) => write!(f, "command-{}", other),
        }
    }
}

/// Side of the link a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Handheld unit, connects outbound
    Client,
    /// Actuator controller, listens and accepts one peer
    Server,
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    /// Waiting for `start()`
    Idle = 0,
    /// Opening a stream socket
    CreatingSocket = 1,
    /// Client connecting to the peer
    Connecting = 2,
    /// Server waiting for a peer
    Listening = 3,
    /// Connected, polling for inbound bytes
    Ready = 4,
    /// Handing received bytes to the dispatcher
    ParsingResponse = 5,
    /// Releasing sockets
    Closing = 6,
    /// Reporting the sticky error of the last cycle
    CheckingErrors = 7,
}

impl LinkState {
    /// Decodes a state stored as its discriminant
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => LinkState::Idle,
            1 => LinkState::CreatingSocket,
            2 => LinkState::Connecting,
            3 => LinkState::Listening,
            4 => LinkState::Ready,
            5 => LinkState::ParsingResponse,
            6 => LinkState::Closing,
            7 => LinkState::CheckingErrors,
            _ => return None,
        })
    }

    /// Returns true while the peer socket is usable for writes
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Ready | LinkState::ParsingResponse)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "Idle",
            LinkState::CreatingSocket => "CreatingSocket",
            LinkState::Connecting => "Connecting",
            LinkState::Listening => "Listening",
            LinkState::Ready => "Ready",
            LinkState::ParsingResponse => "ParsingResponse",
            LinkState::Closing => "Closing",
            LinkState::CheckingErrors => "CheckingErrors",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_round_trip() {
        for raw in 0..8u8 {
            let state = LinkState::from_u8(raw).unwrap();
            assert_eq!(state as u8, raw);
        }
        assert!(LinkState::from_u8(8).is_none());
    }

    #[test]
    fn test_open_states() {
        assert!(LinkState::Ready.is_open());
        assert!(LinkState::ParsingResponse.is_open());
        assert!(!LinkState::Listening.is_open());
        assert!(!LinkState::Closing.is_open());
    }

    #[test]
    fn test_command_display() {
        assert_eq!(CommandId::KEEPALIVE.to_string(), "keepalive");
        assert_eq!(CommandId(9).to_string(), "command-9");
    }
}
