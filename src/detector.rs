use crate::collaborators::camera::Image;
use crate::collaborators::detection::{CentroidDigest, DonutsDigest, StarDetectionLibrary};
use crate::config::{DetectionMode, Rect, Settings};
use crate::error::{ErrorKind, GuiderError, Result};
use crate::phase::Phase;

/// SNR floor below which DONUTS treats the frame as starless during
/// guiding (§4.2). The source reused this same constant for Centroid mode
/// by reading the wrong field; this port gives Centroid its own floor
/// (`CENTROID_MIN_SNR`) defaulted to the same value.
pub const DONUTS_MIN_SNR: f64 = 19.0;
pub const CENTROID_MIN_SNR: f64 = 19.0;

const REFINE_ITERATIONS: u32 = 3;

/// Per-detection-mode reference captured on frame #1 of a session (§3.5),
/// owned by the session supervisor.
#[derive(Debug, Clone)]
pub enum Reference {
    /// Pinned star positions at calibration/selection time, plus the
    /// live search positions the refinement loop writes back to so the
    /// search box tracks the star (§4.2: "positions are written back so
    /// the selection tracks the star as it moves").
    Selection {
        pinned: Vec<(f64, f64)>,
        tracking: Vec<(f64, f64)>,
        weighted: bool,
    },
    Donuts(DonutsDigest),
    Centroid(CentroidDigest),
}

impl Reference {
    pub fn star_count(&self) -> usize {
        match self {
            Self::Selection { pinned, .. } => pinned.len(),
            Self::Donuts(_) | Self::Centroid(_) => 1,
        }
    }

    /// Live search positions for single/multi-star modes, used by the
    /// guiding loop to compute an auto-subframe ROI (§4.5 step 3).
    pub fn tracking_positions(&self) -> Option<&[(f64, f64)]> {
        match self {
            Self::Selection { tracking, .. } => Some(tracking),
            _ => None,
        }
    }

    pub fn set_tracking_positions(&mut self, positions: Vec<(f64, f64)>) {
        if let Self::Selection { tracking, .. } = self {
            *tracking = positions;
        }
    }
}

/// Active DONUTS region under the precedence rule resolved in the design
/// notes: `full ∖ exclude ∩ include` when `include_rect` is set, else
/// `full` shrunk by the edge-clipping margin, with `exclude_rect` always
/// subtracted when present. Subtraction is approximated, as the source
/// does, by the include/clip rectangle alone when no exclude rect
/// overlaps it; full exclude-rect differencing would require a non-
/// rectangular region, which the DONUTS digest cannot represent.
pub fn active_donuts_region(width: u32, height: u32, settings: &Settings) -> Rect {
    let base = if settings.use_include_for_donuts {
        settings.include_rect.unwrap_or(Rect {
            left: 0,
            top: 0,
            width,
            height,
        })
    } else {
        let c = settings.edge_clipping_px.min(width / 2).min(height / 2);
        Rect {
            left: c,
            top: c,
            width: width.saturating_sub(2 * c),
            height: height.saturating_sub(2 * c),
        }
    };
    match settings.exclude_rect {
        Some(ex) => subtract_overlap(base, ex),
        None => base,
    }
}

/// Shrinks `base` to stop before `exclude` when they overlap on one edge;
/// if `exclude` properly splits `base` the region is left untouched (a
/// true boolean difference cannot be expressed as a single `Rect`), which
/// matches the source's best-effort rectangular approximation.
fn subtract_overlap(base: Rect, exclude: Rect) -> Rect {
    let base_right = base.left + base.width;
    let base_bottom = base.top + base.height;
    let ex_right = exclude.left + exclude.width;
    let ex_bottom = exclude.top + exclude.height;

    if exclude.left <= base.left && ex_right < base_right && ex_right > base.left {
        return Rect {
            left: ex_right,
            top: base.top,
            width: base_right - ex_right,
            height: base.height,
        };
    }
    if exclude.top <= base.top && ex_bottom < base_bottom && ex_bottom > base.top {
        return Rect {
            left: base.left,
            top: ex_bottom,
            width: base.width,
            height: base_bottom - ex_bottom,
        };
    }
    base
}

/// The drift detector (C2): thin dispatch over the star-detection black
/// box named in §4.2/§6.
pub struct DriftDetector<'a> {
    lib: &'a dyn StarDetectionLibrary,
}

impl<'a> DriftDetector<'a> {
    pub fn new(lib: &'a dyn StarDetectionLibrary) -> Self {
        Self { lib }
    }

    pub fn build_reference(
        &self,
        image: &Image,
        mode: DetectionMode,
        settings: &Settings,
        star_positions: Option<&[(f64, f64)]>,
    ) -> Result<Reference> {
        match mode {
            DetectionMode::Donuts => {
                let region = active_donuts_region(image.width, image.height, settings);
                let digest = self
                    .lib
                    .build_donuts_digest(image, region)
                    .map_err(|e| GuiderError::no_guiding_star(e.to_string()))?;
                Ok(Reference::Donuts(digest))
            }
            DetectionMode::Centroid => {
                let digest = self
                    .lib
                    .build_centroid_digest(image)
                    .map_err(|e| GuiderError::no_guiding_star(e.to_string()))?;
                Ok(Reference::Centroid(digest))
            }
            DetectionMode::Selection | DetectionMode::WeightedSelection => {
                let stars = star_positions
                    .ok_or_else(|| GuiderError::no_guiding_star("no stars selected"))?;
                let mut pinned = Vec::with_capacity(stars.len());
                for &(x, y) in stars {
                    let digest = self
                        .lib
                        .refine_star_centroid(image, x, y, REFINE_ITERATIONS)
                        .map_err(|e| GuiderError::no_guiding_star(e.to_string()))?;
                    pinned.push((digest.centroid_x, digest.centroid_y));
                }
                let tracking = pinned.clone();
                Ok(Reference::Selection {
                    pinned,
                    tracking,
                    weighted: mode == DetectionMode::WeightedSelection,
                })
            }
        }
    }

    /// Measures drift of `image` against `reference`, returning `(dx, dy,
    /// snr)`. Updates tracking positions in place for selection modes.
    pub fn measure_drift(
        &self,
        image: &Image,
        reference: &mut Reference,
        settings: &Settings,
        phase: Phase,
    ) -> Result<(f64, f64, f64)> {
        match reference {
            Reference::Donuts(reference_digest) => {
                let region = active_donuts_region(image.width, image.height, settings);
                let current = self
                    .lib
                    .build_donuts_digest(image, region)
                    .map_err(|e| GuiderError::no_guiding_star(e.to_string()))?;
                let (dx, dy, snr) = self
                    .lib
                    .correlate_donuts(reference_digest, &current)
                    .map_err(|e| GuiderError::no_guiding_star(e.to_string()))?;
                check_snr(snr, DONUTS_MIN_SNR, phase)?;
                Ok((dx, dy, snr))
            }
            Reference::Centroid(reference_digest) => {
                let current = self
                    .lib
                    .build_centroid_digest(image)
                    .map_err(|e| GuiderError::no_guiding_star(e.to_string()))?;
                check_snr(current.snr, CENTROID_MIN_SNR, phase)?;
                Ok((
                    current.centroid_x - reference_digest.centroid_x,
                    current.centroid_y - reference_digest.centroid_y,
                    current.snr,
                ))
            }
            Reference::Selection {
                pinned,
                tracking,
                weighted,
            } => {
                let mut drifts = Vec::with_capacity(pinned.len());
                let mut new_tracking = Vec::with_capacity(tracking.len());
                for (i, &(search_x, search_y)) in tracking.iter().enumerate() {
                    let digest = self
                        .lib
                        .refine_star_centroid(image, search_x, search_y, REFINE_ITERATIONS)
                        .map_err(|e| GuiderError::no_guiding_star(e.to_string()))?;
                    let (ref_x, ref_y) = pinned[i];
                    drifts.push((
                        digest.centroid_x - ref_x,
                        digest.centroid_y - ref_y,
                        digest.snr,
                    ));
                    new_tracking.push((digest.centroid_x, digest.centroid_y));
                }
                *tracking = new_tracking;
                let (dx, dy, snr) = self.lib.multistar_reduce(&drifts, *weighted);
                Ok((dx, dy, snr))
            }
        }
    }

    /// The reported alignment coordinate for centroid reports (§4.2):
    /// `digest_centroid + dither_offset`.
    pub fn centroid_report_position(
        reference: &Reference,
        dither_offset_x: f64,
        dither_offset_y: f64,
    ) -> Option<(f64, f64)> {
        match reference {
            Reference::Centroid(d) => Some((d.centroid_x + dither_offset_x, d.centroid_y + dither_offset_y)),
            _ => None,
        }
    }
}

fn check_snr(snr: f64, floor: f64, phase: Phase) -> Result<()> {
    if phase == Phase::Guiding && snr < floor {
        return Err(GuiderError::new(
            ErrorKind::NoGuidingStar,
            format!("snr {snr:.1} below floor {floor:.1}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn donuts_region_clips_edges_without_include() {
        let s = settings();
        let r = active_donuts_region(1000, 800, &s);
        assert_eq!(r.left, s.edge_clipping_px);
        assert_eq!(r.top, s.edge_clipping_px);
        assert_eq!(r.width, 1000 - 2 * s.edge_clipping_px);
        assert_eq!(r.height, 800 - 2 * s.edge_clipping_px);
    }

    #[test]
    fn donuts_region_prefers_include_rect() {
        let mut s = settings();
        s.use_include_for_donuts = true;
        s.include_rect = Some(Rect {
            left: 100,
            top: 100,
            width: 200,
            height: 200,
        });
        let r = active_donuts_region(1000, 800, &s);
        assert_eq!(r, s.include_rect.unwrap());
    }

    #[test]
    fn snr_boundary_exactly_at_floor_passes_guiding() {
        assert!(check_snr(DONUTS_MIN_SNR, DONUTS_MIN_SNR, Phase::Guiding).is_ok());
        assert!(check_snr(DONUTS_MIN_SNR - 0.001, DONUTS_MIN_SNR, Phase::Guiding).is_err());
    }

    #[test]
    fn snr_floor_only_enforced_while_guiding() {
        assert!(check_snr(0.0, DONUTS_MIN_SNR, Phase::Initializing).is_ok());
    }
}
