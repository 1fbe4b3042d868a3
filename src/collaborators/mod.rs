pub mod camera;
pub mod detection;
pub mod mount;

pub use camera::{Camera, FrameError, Image, PixelFormat};
pub use detection::{CentroidDigest, DetectionFailure, DonutsDigest, StarDetectionLibrary};
pub use mount::{Axis, GuideDirection, Mount, MountError, SideOfPier};
