use std::fmt::{self, Display, Formatter};
use std::result;

/// Numeric codes loosely mirror the ASCOM driver-error range so a future
/// protocol adapter can surface them without renumbering.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorKind {
    Aborted = 0x300,
    NoGuidingStar = 0x301,
    CalibrationInconsistent = 0x302,
    TooCloseToPole = 0x303,
    CameraUnresponsive = 0x304,
    MountUnresponsive = 0x305,
    ConfigurationLocked = 0x306,
    Timeout = 0x307,
    InvalidValue = 0x308,
}

#[derive(Debug)]
pub struct GuiderError {
    kind: ErrorKind,
    message: String,
}

pub type Result<T> = result::Result<T, GuiderError>;

impl GuiderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "operation aborted")
    }

    pub fn no_guiding_star(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoGuidingStar, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    pub fn is_no_guiding_star(&self) -> bool {
        self.kind == ErrorKind::NoGuidingStar
    }
}

impl Display for GuiderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.kind as i32, self.message)
    }
}

impl std::error::Error for GuiderError {}
