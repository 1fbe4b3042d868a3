//! Closed-loop autoguiding core for astrophotography: drift detection,
//! multi-phase calibration, a PI correction controller and the steady-
//! state guiding loop that ties them together (§1-§2). Camera, mount and
//! star-detection collaborators are external — see the traits in
//! [`collaborators`].

pub mod acquirer;
pub mod calibration;
pub mod collaborators;
pub mod config;
pub mod correction;
pub mod detector;
pub mod dither;
pub mod error;
pub mod guiding_loop;
pub mod phase;
pub mod session_log;
pub mod stats;
pub mod supervisor;

pub mod util;

pub use calibration::{CalibrationEngine, CalibrationOutcome};
pub use config::{DecGuidingMode, DetectionMode, DitherStrategy, RecoveryPolicy, Settings};
pub use error::{ErrorKind, GuiderError, Result};
pub use phase::{Command, Phase};
pub use supervisor::Session;
