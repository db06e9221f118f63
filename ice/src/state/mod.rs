#[cfg(test)]
mod state_test;

use std::fmt;

use serde::Serialize;

/// An enum showing the state of a ICE Connection List of supported States.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,

    /// ICE agent is gathering addresses.
    #[serde(rename = "new")]
    New,

    /// ICE agent has been given local and remote candidates, and is attempting to find a match.
    #[serde(rename = "checking")]
    Checking,

    /// ICE agent has a pairing, but is still checking other pairs.
    #[serde(rename = "connected")]
    Connected,

    /// ICE agent never could successfully connect.
    #[serde(rename = "failed")]
    Failed,

    /// ICE agent connected successfully, but the selected pair went silent.
    #[serde(rename = "disconnected")]
    Disconnected,

    /// ICE agent has finished and is no longer handling requests.
    #[serde(rename = "closed")]
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Unspecified => "Unspecified",
            Self::New => "New",
            Self::Checking => "Checking",
            Self::Connected => "Connected",
            Self::Failed => "Failed",
            Self::Disconnected => "Disconnected",
            Self::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::New,
            2 => Self::Checking,
            3 => Self::Connected,
            4 => Self::Failed,
            5 => Self::Disconnected,
            6 => Self::Closed,
            _ => Self::Unspecified,
        }
    }
}

/// Describes the state of the candidate gathering process.
#[derive(Default, PartialEq, Eq, Copy, Clone, Debug, Serialize)]
pub enum GatheringState {
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,

    /// Indicates candidate gathering is not yet started.
    #[serde(rename = "new")]
    New,

    /// Indicates candidate gathering is ongoing.
    #[serde(rename = "gathering")]
    Gathering,

    /// Indicates candidate gathering has been completed.
    #[serde(rename = "complete")]
    Complete,
}

impl From<u8> for GatheringState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::New,
            2 => Self::Gathering,
            3 => Self::Complete,
            _ => Self::Unspecified,
        }
    }
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::New => "new",
            Self::Gathering => "gathering",
            Self::Complete => "complete",
            Self::Unspecified => "unspecified",
        };
        write!(f, "{s}")
    }
}
