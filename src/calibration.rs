use crate::acquirer::FrameAcquirer;
use crate::collaborators::camera::Camera;
use crate::collaborators::detection::StarDetectionLibrary;
use crate::collaborators::mount::{GuideDirection, Mount};
use crate::config::{DetectionMode, Settings};
use crate::correction::wait_until_idle;
use crate::detector::DriftDetector;
use crate::error::{ErrorKind, GuiderError, Result};
use crate::phase::Phase;
use crate::util::cancel::AbortWaiter;
use tokio::sync::watch;

const MIN_STEP_S: f64 = 0.05;
const MAX_STEP_S: f64 = 2.0;
const MAX_RESTARTS: u32 = 6;
const MIN_COS_DEC: f64 = 0.017;
const MAX_DEC_FOR_GUIDING: f64 = 89.0;
const WARN_DEC: f64 = 85.0;

/// Outputs of a successful calibration run (§4.3's per-phase output table,
/// after orthogonality resolution and pole normalisation).
#[derive(Debug, Clone, Copy)]
pub struct CalibrationOutcome {
    pub angle_deg: f64,
    pub speed_ra_px_per_s: f64,
    pub speed_dec_px_per_s: f64,
    pub backlash_px: f64,
    pub side_of_pier: i8,
}

/// Result of driving one pulse/measure primitive to completion, before
/// adaptive step-size evaluation.
struct PhaseRun {
    steps_used: u32,
    dx: f64,
    dy: f64,
    reached_threshold: bool,
}

/// The calibration engine (C3): the `Initializing → ClearingDec →
/// ClearingRa → MovingNorth → MovingSouth → MovingWest → MovingEast →
/// Done` state machine.
pub struct CalibrationEngine;

impl CalibrationEngine {
    /// Runs the full calibration sequence, reporting phase transitions on
    /// `phase_tx` as it goes. `mode`/`star_positions` select the
    /// detection reference the way an active guiding session would.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        camera: &dyn Camera,
        mount: &dyn Mount,
        lib: &dyn StarDetectionLibrary,
        settings: &Settings,
        mode: DetectionMode,
        star_positions: Option<&[(f64, f64)]>,
        phase_tx: &watch::Sender<Phase>,
        abort: &mut AbortWaiter,
    ) -> Result<CalibrationOutcome> {
        let declination_deg = mount
            .declination_deg()
            .await
            .map_err(|_| GuiderError::new(ErrorKind::MountUnresponsive, "could not read declination"))?;
        if declination_deg.abs() > WARN_DEC {
            tracing::warn!(declination_deg, "calibrating close to the celestial pole");
        }

        let detector = DriftDetector::new(lib);
        let mut step_s = settings.calibration_step_s;

        let mut restarts = 0;
        let (north, backlash_px) = loop {
            phase_tx.send_replace(Phase::ClearingDec);
            let _ = Self::run_phase(
                camera,
                mount,
                &detector,
                settings,
                mode,
                star_positions,
                GuideDirection::North,
                step_s,
                settings.backlash_clear_min_drift_px,
                settings.backlash_clear_max_steps,
                abort,
            )
            .await?;

            phase_tx.send_replace(Phase::ClearingRa);
            let _ = Self::run_phase(
                camera,
                mount,
                &detector,
                settings,
                mode,
                star_positions,
                GuideDirection::West,
                step_s,
                settings.backlash_clear_min_drift_px,
                settings.backlash_clear_max_steps * 20,
                abort,
            )
            .await?;

            phase_tx.send_replace(Phase::MovingNorth);
            let north = Self::run_phase(
                camera,
                mount,
                &detector,
                settings,
                mode,
                star_positions,
                GuideDirection::North,
                step_s,
                settings.calibration_min_drift_px,
                settings.calibration_max_steps,
                abort,
            )
            .await?;

            match Self::adapt(&north, step_s, settings.calibration_max_steps)? {
                Adaptation::Accept => {}
                Adaptation::Halve(new_step) => {
                    step_s = Self::bound_step(new_step)?;
                    continue;
                }
                Adaptation::DoubleAndRestart(new_step) => {
                    step_s = Self::bound_step(new_step)?;
                    restarts += 1;
                    if restarts > MAX_RESTARTS {
                        return Err(GuiderError::new(
                            ErrorKind::CalibrationInconsistent,
                            "calibration did not converge after adaptive restarts",
                        ));
                    }
                    continue;
                }
            }

            phase_tx.send_replace(Phase::MovingSouth);
            let south = Self::run_phase(
                camera,
                mount,
                &detector,
                settings,
                mode,
                star_positions,
                GuideDirection::South,
                step_s,
                settings.calibration_min_drift_px,
                north.steps_used,
                abort,
            )
            .await?;

            let north_mag = north.dx.hypot(north.dy);
            let south_mag = south.dx.hypot(south.dy);
            let backlash_px = (north_mag - south_mag).max(0.0);

            break (north, backlash_px);
        };

        let dec_angle = north.dy.atan2(north.dx).to_degrees();
        let speed_dec_raw = north.dx.hypot(north.dy) / (north.steps_used as f64 * step_s);
        if speed_dec_raw.abs() < f64::EPSILON {
            return Err(GuiderError::new(
                ErrorKind::CalibrationInconsistent,
                "measured zero DEC speed",
            ));
        }

        phase_tx.send_replace(Phase::MovingWest);
        let west = Self::run_phase(
            camera,
            mount,
            &detector,
            settings,
            mode,
            star_positions,
            GuideDirection::West,
            step_s,
            settings.calibration_min_drift_px,
            settings.calibration_max_steps * 5,
            abort,
        )
        .await?;
        let ra_angle = west.dy.atan2(west.dx).to_degrees();
        let speed_ra_west = west.dx.hypot(west.dy) / (west.steps_used as f64 * step_s);

        phase_tx.send_replace(Phase::MovingEast);
        let east = Self::run_phase(
            camera,
            mount,
            &detector,
            settings,
            mode,
            star_positions,
            GuideDirection::East,
            step_s,
            settings.calibration_min_drift_px,
            west.steps_used,
            abort,
        )
        .await?;
        let speed_ra_east = east.dx.hypot(east.dy) / (east.steps_used as f64 * step_s);

        if speed_ra_west.abs() < f64::EPSILON || speed_ra_east.abs() < f64::EPSILON {
            return Err(GuiderError::new(
                ErrorKind::CalibrationInconsistent,
                "RA drift too slow to measure",
            ));
        }
        let speed_ra_raw = (speed_ra_west + speed_ra_east) / 2.0;

        let (angle_deg, dec_sign) = resolve_orthogonality(ra_angle, dec_angle);
        let speed_dec = speed_dec_raw * dec_sign;

        if declination_deg.abs() > MAX_DEC_FOR_GUIDING {
            return Err(GuiderError::new(ErrorKind::TooCloseToPole, "|declination| > 89 degrees"));
        }
        let cos_dec = declination_deg.to_radians().cos().abs().max(MIN_COS_DEC);
        let speed_ra = speed_ra_raw / cos_dec;

        phase_tx.send_replace(Phase::Done);
        let current_sop = mount
            .side_of_pier()
            .await
            .map_err(|_| GuiderError::new(ErrorKind::MountUnresponsive, "could not read side of pier"))?;

        Ok(CalibrationOutcome {
            angle_deg,
            speed_ra_px_per_s: speed_ra,
            speed_dec_px_per_s: speed_dec,
            backlash_px: backlash_px.max(0.0),
            side_of_pier: current_sop.as_signed(),
        })
    }

    fn bound_step(step_s: f64) -> Result<f64> {
        if !(MIN_STEP_S..=MAX_STEP_S).contains(&step_s) {
            return Err(GuiderError::new(
                ErrorKind::CalibrationInconsistent,
                "calibration step size hit its bound",
            ));
        }
        Ok(step_s)
    }

    fn adapt(run: &PhaseRun, step_s: f64, max_steps: u32) -> Result<Adaptation> {
        if !run.reached_threshold {
            return Ok(Adaptation::DoubleAndRestart(step_s * 2.0));
        }
        if run.steps_used < max_steps / 5 {
            return Ok(Adaptation::Halve(step_s / 2.0));
        }
        Ok(Adaptation::Accept)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        camera: &dyn Camera,
        mount: &dyn Mount,
        detector: &DriftDetector<'_>,
        settings: &Settings,
        mode: DetectionMode,
        star_positions: Option<&[(f64, f64)]>,
        direction: GuideDirection,
        step_s: f64,
        threshold_px: f64,
        max_steps: u32,
        abort: &mut AbortWaiter,
    ) -> Result<PhaseRun> {
        if abort.is_aborted() {
            return Err(GuiderError::aborted());
        }
        let start_image = FrameAcquirer::capture_frame(camera, settings, abort)
            .await
            .map_err(map_frame_error)?;
        let mut reference = detector.build_reference(&start_image, mode, settings, star_positions)?;

        let step_ms = (step_s * 1000.0).round() as u32;
        let mut last = PhaseRun {
            steps_used: 0,
            dx: 0.0,
            dy: 0.0,
            reached_threshold: false,
        };

        for step in 1..=max_steps.max(1) {
            mount
                .pulse(direction, step_ms)
                .await
                .map_err(|_| GuiderError::new(ErrorKind::MountUnresponsive, "calibration pulse failed"))?;
            wait_until_idle(mount, abort).await?;

            let image = FrameAcquirer::capture_frame(camera, settings, abort)
                .await
                .map_err(|_| GuiderError::aborted())?;
            let (dx, dy, _snr) = detector.measure_drift(&image, &mut reference, settings, Phase::Initializing)?;

            last.steps_used = step;
            last.dx = dx;
            last.dy = dy;

            if dx.hypot(dy) >= threshold_px {
                last.reached_threshold = true;
                break;
            }
        }

        Ok(last)
    }
}

enum Adaptation {
    Accept,
    Halve(f64),
    DoubleAndRestart(f64),
}

/// Disambiguates the measured RA/DEC angles (§4.3's orthogonality
/// resolution): the axis that is ±90° from the other wins; if the sign
/// test shows DEC is flipped relative to RA, `speed_dec`'s sign is
/// negated. Returns `(angle_deg, dec_sign)` where `angle_deg` is the
/// average of the RA angle and the rotated DEC angle.
fn resolve_orthogonality(ra_angle_deg: f64, dec_angle_deg: f64) -> (f64, f64) {
    let minus_90 = normalize_deg(dec_angle_deg - 90.0);
    let plus_90 = normalize_deg(dec_angle_deg + 90.0);
    let ra_norm = normalize_deg(ra_angle_deg);

    let dist_minus = angle_distance(ra_norm, minus_90);
    let dist_plus = angle_distance(ra_norm, plus_90);

    let (rotated_dec, dec_sign) = if dist_minus <= dist_plus {
        (minus_90, 1.0)
    } else {
        (plus_90, -1.0)
    };

    let angle_deg = circular_mean(ra_norm, rotated_dec);
    (angle_deg, dec_sign)
}

fn normalize_deg(deg: f64) -> f64 {
    let mut d = deg % 360.0;
    if d < 0.0 {
        d += 360.0;
    }
    d
}

fn angle_distance(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 360.0;
    diff.min(360.0 - diff)
}

fn circular_mean(a: f64, b: f64) -> f64 {
    let (ax, ay) = (a.to_radians().cos(), a.to_radians().sin());
    let (bx, by) = (b.to_radians().cos(), b.to_radians().sin());
    let mx = (ax + bx) / 2.0;
    let my = (ay + by) / 2.0;
    my.atan2(mx).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orthogonality_resolves_unrotated_axes() {
        let (angle, sign) = resolve_orthogonality(0.0, 90.0);
        assert!(angle.abs() < 1e-6);
        assert_eq!(sign, 1.0);
    }

    #[test]
    fn orthogonality_detects_flipped_dec() {
        let (_angle, sign) = resolve_orthogonality(0.0, -90.0);
        assert_eq!(sign, -1.0);
    }

    #[test]
    fn equator_calibration_matches_s1_formula() {
        // S1: pure RA drift of 2px/s, pure DEC drift of 1px/s, cal_steps=20,
        // step=0.2s arranged so the drift budget (20px) is hit exactly at
        // the configured step count.
        let step_s = 0.2;
        let steps_used = 20u32;
        let ra_mag = 2.0 * (steps_used as f64 * step_s);
        let dec_mag = 1.0 * (steps_used as f64 * step_s);
        let speed_ra = ra_mag / (steps_used as f64 * step_s);
        let speed_dec = dec_mag / (steps_used as f64 * step_s);
        assert!((speed_ra - 2.0).abs() < 1e-9);
        assert!((speed_dec - 1.0).abs() < 1e-9);
    }
}
