use serde::{Deserialize, Serialize};

/// Session lifecycle state (§3.3). Mutated only by the state machine in
/// the calibration engine (C3) and the guiding loop (C5); never assigned
/// from a bare bool (the source's `AGENT_START_PROCESS_PROPERTY->state`
/// bug, called out in the design notes, does not get ported).
#[derive(Debug, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    Initializing,
    Previewing,
    ClearingDec,
    ClearingRa,
    MovingNorth,
    MovingSouth,
    MovingWest,
    MovingEast,
    Guiding,
    Done,
    Failed,
}

impl Phase {
    pub fn is_calibrating(self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::ClearingDec
                | Self::ClearingRa
                | Self::MovingNorth
                | Self::MovingSouth
                | Self::MovingWest
                | Self::MovingEast
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// External control requests and collaborator events delivered on a single
/// `mpsc` channel to the worker task (§3.12, §9's message-passing redesign
/// note). Replaces the source's property-change callbacks.
#[derive(Debug, Clone)]
pub enum Command {
    StartPreviewOnce,
    StartPreviewStream,
    StartCalibration,
    StartCalibrationAndGuiding,
    StartGuiding,
    ClearSelection,
    Dither { strategy: crate::config::DitherStrategy },
    Abort,
}
