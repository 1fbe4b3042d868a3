use crate::collaborators::camera::Image;
use crate::config::Rect;

/// A single-star centroid digest (used for `Centroid`, `Selection` and
/// `WeightedSelection` modes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidDigest {
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub snr: f64,
}

/// A whole-frame phase-correlation digest (`Donuts` mode). Opaque beyond
/// what the detector needs to compare two frames.
#[derive(Debug, Clone)]
pub struct DonutsDigest {
    pub region: Rect,
    pub spectrum: Vec<f32>,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct DetectionFailure;

impl std::fmt::Display for DetectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "star detection library could not produce a digest")
    }
}
impl std::error::Error for DetectionFailure {}

/// The star-detection black box (§4.2, §6). Centroid refinement, DONUTS
/// phase correlation and multi-star reduction are external algorithms; the
/// drift detector (C2) only calls through this interface.
pub trait StarDetectionLibrary: Send + Sync {
    fn build_donuts_digest(&self, image: &Image, region: Rect) -> Result<DonutsDigest, DetectionFailure>;

    /// Phase-correlates two digests of the same region, returning
    /// `(dx, dy, snr)`.
    fn correlate_donuts(
        &self,
        reference: &DonutsDigest,
        current: &DonutsDigest,
    ) -> Result<(f64, f64, f64), DetectionFailure>;

    fn build_centroid_digest(&self, image: &Image) -> Result<CentroidDigest, DetectionFailure>;

    /// Three iterations of centroid refinement around `(approx_x,
    /// approx_y)`, returning the refined star position and its SNR.
    fn refine_star_centroid(
        &self,
        image: &Image,
        approx_x: f64,
        approx_y: f64,
        iterations: u32,
    ) -> Result<CentroidDigest, DetectionFailure>;

    /// Reduces per-star `(dx, dy, snr)` samples into one composite drift,
    /// plainly averaged or SNR-weighted.
    fn multistar_reduce(&self, drifts: &[(f64, f64, f64)], weighted: bool) -> (f64, f64, f64);
}
