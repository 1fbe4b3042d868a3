use async_trait::async_trait;
use std::fmt::{self, Display, Formatter};

/// Pixel plane encoding distinguished by the blob header signature (§6).
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    Rgb24,
    Rgb48,
}

impl PixelFormat {
    pub fn from_signature(signature: u32) -> Option<Self> {
        match signature {
            0x01 => Some(Self::Mono8),
            0x02 => Some(Self::Mono16),
            0x03 => Some(Self::Rgb24),
            0x04 => Some(Self::Rgb48),
            _ => None,
        }
    }

    pub fn is_bayered(self) -> bool {
        matches!(self, Self::Rgb24 | Self::Rgb48)
    }

    pub fn channels(self) -> usize {
        match self {
            Self::Mono8 | Self::Mono16 => 1,
            Self::Rgb24 | Self::Rgb48 => 3,
        }
    }
}

/// A decoded raw frame: header plus pixel plane, already channel-equalised
/// if it arrived bayered (§4.1).
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<f32>,
}

impl Image {
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: Vec<f32>) -> Self {
        Self {
            width,
            height,
            format,
            pixels,
        }
    }

    /// Averages the channel planes of a bayered frame into a single
    /// grayscale-equivalent plane in place (§4.1's channel-equalise step).
    pub fn equalize_channels(&mut self) {
        if !self.format.is_bayered() {
            return;
        }
        let channels = self.format.channels();
        let pixel_count = (self.width as usize) * (self.height as usize);
        let mut mono = Vec::with_capacity(pixel_count);
        for i in 0..pixel_count {
            let mut sum = 0.0f32;
            for c in 0..channels {
                sum += self.pixels[i * channels + c];
            }
            mono.push(sum / channels as f32);
        }
        self.pixels = mono;
        self.format = match self.format {
            PixelFormat::Rgb24 => PixelFormat::Mono8,
            PixelFormat::Rgb48 => PixelFormat::Mono16,
            other => other,
        };
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum FrameError {
    Aborted,
    Timeout,
    CameraUnresponsive,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "exposure aborted"),
            Self::Timeout => write!(f, "camera did not enter busy state in time"),
            Self::CameraUnresponsive => write!(f, "camera unresponsive after retries"),
        }
    }
}

impl std::error::Error for FrameError {}

/// The camera collaborator (§6). Exposure start, blob retrieval and
/// subframe/format configuration are external concerns; this core only
/// calls through this interface.
#[async_trait]
pub trait Camera: Send + Sync {
    async fn set_subframe(&self, left: u32, top: u32, width: u32, height: u32) -> Result<(), FrameError>;
    async fn set_upload_mode_client_only(&self, client_only: bool) -> Result<(), FrameError>;
    async fn set_raw_image_format(&self) -> Result<(), FrameError>;
    async fn start_exposure(&self, seconds: f64) -> Result<(), FrameError>;
    async fn abort_exposure(&self) -> Result<(), FrameError>;

    /// True once the camera has entered the busy/integrating state after
    /// `start_exposure`.
    async fn is_busy(&self) -> Result<bool, FrameError>;

    /// True once the exposure has completed and a blob is ready.
    async fn is_image_ready(&self) -> Result<bool, FrameError>;

    /// Downloads and decodes the completed exposure.
    async fn fetch_image(&self) -> Result<Image, FrameError>;

    fn sensor_width(&self) -> u32;
    fn sensor_height(&self) -> u32;
}
