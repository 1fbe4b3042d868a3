use async_trait::async_trait;

/// The two pulse-guideable mount axes.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum Axis {
    Ra,
    Dec,
}

/// Cardinal pulse-guide direction (§6).
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

impl GuideDirection {
    pub fn axis(self) -> Axis {
        match self {
            Self::North | Self::South => Axis::Dec,
            Self::East | Self::West => Axis::Ra,
        }
    }

    /// Picks the cardinal direction for a signed pulse on an axis: positive
    /// RA pulses move West, positive DEC pulses move North (mirrors the
    /// source's sign convention carried through §4.4).
    pub fn from_signed_pulse(axis: Axis, seconds: f64) -> Option<Self> {
        if seconds == 0.0 {
            return None;
        }
        Some(match (axis, seconds.is_sign_positive()) {
            (Axis::Ra, true) => Self::West,
            (Axis::Ra, false) => Self::East,
            (Axis::Dec, true) => Self::North,
            (Axis::Dec, false) => Self::South,
        })
    }
}

/// Discrete mount orientation (§GLOSSARY, "Side of pier").
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SideOfPier {
    East,
    Unknown,
    West,
}

impl SideOfPier {
    pub fn as_signed(self) -> i8 {
        match self {
            Self::East => -1,
            Self::Unknown => 0,
            Self::West => 1,
        }
    }

    pub fn from_signed(v: i8) -> Self {
        match v {
            v if v < 0 => Self::East,
            0 => Self::Unknown,
            _ => Self::West,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct MountError;

impl std::fmt::Display for MountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mount unresponsive")
    }
}
impl std::error::Error for MountError {}

/// The mount collaborator's guider port (§6). Pulses are fire-and-forget;
/// the caller polls `ra_busy`/`dec_busy` to know when a pulse has finished.
#[async_trait]
pub trait Mount: Send + Sync {
    async fn pulse(&self, direction: GuideDirection, duration_ms: u32) -> Result<(), MountError>;
    async fn ra_busy(&self) -> Result<bool, MountError>;
    async fn dec_busy(&self) -> Result<bool, MountError>;
    async fn declination_deg(&self) -> Result<f64, MountError>;
    async fn side_of_pier(&self) -> Result<SideOfPier, MountError>;
}
