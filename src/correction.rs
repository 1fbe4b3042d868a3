use crate::collaborators::mount::{GuideDirection, Mount, SideOfPier};
use crate::config::{DecGuidingMode, DetectionMode, Settings};
use crate::error::{GuiderError, Result};
use crate::stats::DriftStack;
use crate::util::cancel::AbortWaiter;
use std::time::Duration;

const MOUNT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MOUNT_BUSY_TICK: Duration = Duration::from_millis(50);
const MIN_COS_DEC: f64 = 0.017;

/// A single pass of (dx, dy) → (pulse_ra_s, pulse_dec_s), including
/// diagnostic intermediates the session log records (§3.11).
#[derive(Debug, Clone, Copy, Default)]
pub struct Correction {
    pub drift_ra_px: f64,
    pub drift_dec_px: f64,
    pub pulse_ra_s: f64,
    pub pulse_dec_s: f64,
}

/// The correction controller (C4): rotation, PI response, DEC masking
/// and backlash compensation (§4.4). Retains the sign of the last
/// applied non-zero DEC pulse across calls, per the backlash-compensation
/// memory rule.
#[derive(Debug, Default)]
pub struct CorrectionController {
    last_dec_sign: Option<f64>,
}

impl CorrectionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective rotation angle: `calibration_angle`, rotated 180° when
    /// the mount's current side of pier differs from the one recorded at
    /// calibration (meridian flip detected, §4.4 step 1).
    pub fn effective_angle_deg(settings: &Settings, current_sop: SideOfPier) -> f64 {
        let calibrated_sop = SideOfPier::from_signed(settings.side_of_pier);
        if flipped(calibrated_sop, current_sop) {
            settings.angle_deg + 180.0
        } else {
            settings.angle_deg
        }
    }

    /// Effective signed DEC speed after applying the flip-reversal rule
    /// (§4.4 step 1).
    pub fn effective_speed_dec(settings: &Settings, current_sop: SideOfPier) -> f64 {
        let calibrated_sop = SideOfPier::from_signed(settings.side_of_pier);
        if flipped(calibrated_sop, current_sop) && settings.flip_reverses_dec {
            -settings.speed_dec_px_per_s
        } else {
            settings.speed_dec_px_per_s
        }
    }

    /// Computes the correction for one frame. `declination_deg` is the
    /// mount's current reported declination, used to normalise the RA
    /// speed (§4.4 step 2). `multi_star` selects the aperture-escape
    /// clamp used by Selection/WeightedSelection modes.
    pub fn compute(
        &mut self,
        dx: f64,
        dy: f64,
        settings: &Settings,
        drift_stack: &DriftStack,
        declination_deg: f64,
        current_sop: SideOfPier,
        mode: DetectionMode,
    ) -> Correction {
        let alpha_eff = Self::effective_angle_deg(settings, current_sop);
        let speed_dec = Self::effective_speed_dec(settings, current_sop);
        let theta = -std::f64::consts::PI * alpha_eff / 180.0;

        let drift_ra = dx * theta.cos() + dy * theta.sin();
        let drift_dec = dx * theta.sin() - dy * theta.cos();

        let (mean_dx, mean_dy) = drift_stack.mean_drift();
        let mean_ra = mean_dx * theta.cos() + mean_dy * theta.sin();
        let mean_dec = mean_dx * theta.sin() - mean_dy * theta.cos();

        let multi_star = matches!(
            mode,
            DetectionMode::Selection | DetectionMode::WeightedSelection
        );

        let cos_dec = declination_deg.to_radians().cos().abs().max(MIN_COS_DEC);
        let speed_ra_eff = settings.speed_ra_px_per_s * cos_dec;

        let mut pulse_ra_s = self.axis_pulse(
            drift_ra,
            mean_ra,
            settings.aggr_ra_pct,
            settings.i_gain_ra,
            speed_ra_eff,
            settings,
            multi_star,
        );
        let mut pulse_dec_s = self.axis_pulse(
            drift_dec,
            mean_dec,
            settings.aggr_dec_pct,
            settings.i_gain_dec,
            speed_dec,
            settings,
            multi_star,
        );

        // Step 3 — DEC mode mask.
        pulse_dec_s = match settings.dec_guiding_mode {
            DecGuidingMode::None => 0.0,
            DecGuidingMode::NorthOnly => pulse_dec_s.max(0.0),
            DecGuidingMode::SouthOnly => pulse_dec_s.min(0.0),
            DecGuidingMode::Both => pulse_dec_s,
        };

        // Step 4 — backlash compensation (DEC only).
        if pulse_dec_s != 0.0 {
            let sign = pulse_dec_s.signum();
            if let Some(last) = self.last_dec_sign {
                if last != sign && settings.backlash_px > 0.0 && speed_dec.abs() > 0.0 {
                    pulse_dec_s += sign * settings.backlash_px / speed_dec.abs();
                }
            }
            self.last_dec_sign = Some(sign);
        }

        pulse_ra_s = clamp_pulse(pulse_ra_s, settings);
        pulse_dec_s = clamp_pulse(pulse_dec_s, settings);

        Correction {
            drift_ra_px: drift_ra,
            drift_dec_px: drift_dec,
            pulse_ra_s,
            pulse_dec_s,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn axis_pulse(
        &self,
        drift: f64,
        mean: f64,
        aggr_pct: f64,
        i_gain: f64,
        speed: f64,
        settings: &Settings,
        multi_star: bool,
    ) -> f64 {
        if drift.abs() <= settings.min_err_px {
            return 0.0;
        }
        let mut correction_px = (aggr_pct / 100.0) * drift + i_gain * mean;
        if multi_star {
            let cap = 0.9 * settings.selection_radius_px;
            correction_px = correction_px.clamp(-cap, cap);
        }
        if speed.abs() < f64::EPSILON {
            return 0.0;
        }
        correction_px / speed
    }
}

fn clamp_pulse(pulse_s: f64, settings: &Settings) -> f64 {
    let magnitude = pulse_s.abs().min(settings.max_pulse_s);
    if magnitude < settings.min_pulse_s {
        0.0
    } else {
        magnitude * pulse_s.signum()
    }
}

fn flipped(calibrated: SideOfPier, current: SideOfPier) -> bool {
    !matches!(
        (calibrated, current),
        (SideOfPier::Unknown, _) | (_, SideOfPier::Unknown)
    ) && calibrated != current
}

/// Dispatches both axis pulses concurrently via the mount collaborator
/// and waits for the mount to report idle (§4.4 step 5).
pub async fn dispatch(
    mount: &dyn Mount,
    correction: &Correction,
    abort: &mut AbortWaiter,
) -> Result<()> {
    let ra_dir = GuideDirection::from_signed_pulse(crate::collaborators::mount::Axis::Ra, correction.pulse_ra_s);
    let dec_dir = GuideDirection::from_signed_pulse(crate::collaborators::mount::Axis::Dec, correction.pulse_dec_s);

    let ra_ms = (correction.pulse_ra_s.abs() * 1000.0).round() as u32;
    let dec_ms = (correction.pulse_dec_s.abs() * 1000.0).round() as u32;

    let ra_fut = async {
        if let Some(dir) = ra_dir {
            mount.pulse(dir, ra_ms).await
        } else {
            Ok(())
        }
    };
    let dec_fut = async {
        if let Some(dir) = dec_dir {
            mount.pulse(dir, dec_ms).await
        } else {
            Ok(())
        }
    };
    let (ra_res, dec_res) = tokio::join!(ra_fut, dec_fut);
    ra_res.map_err(|_| GuiderError::new(crate::error::ErrorKind::MountUnresponsive, "pulse(ra) failed"))?;
    dec_res.map_err(|_| GuiderError::new(crate::error::ErrorKind::MountUnresponsive, "pulse(dec) failed"))?;

    let longest = correction.pulse_ra_s.abs().max(correction.pulse_dec_s.abs());
    if longest > 0.0 {
        abort.sleep(Duration::from_secs_f64(longest)).await;
    }

    wait_until_idle(mount, abort).await
}

/// Polls the mount's guide-busy state (up to 10s, every 50ms) until both
/// axes report idle (§4.4 step 5). Shared by the steady-state correction
/// dispatch and the calibration engine's single-axis pulse primitive.
pub async fn wait_until_idle(mount: &dyn Mount, abort: &mut AbortWaiter) -> Result<()> {
    abort
        .poll_until(MOUNT_BUSY_TIMEOUT, MOUNT_BUSY_TICK, || async {
            let ra_busy = mount
                .ra_busy()
                .await
                .map_err(|_| GuiderError::new(crate::error::ErrorKind::MountUnresponsive, "ra_busy failed"))?;
            let dec_busy = mount
                .dec_busy()
                .await
                .map_err(|_| GuiderError::new(crate::error::ErrorKind::MountUnresponsive, "dec_busy failed"))?;
            Ok(!ra_busy && !dec_busy)
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_float_eq::assert_float_absolute_eq;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.speed_ra_px_per_s = 2.0;
        s.speed_dec_px_per_s = 1.0;
        s.angle_deg = 0.0;
        s.min_err_px = 0.1;
        s.min_pulse_s = 0.0;
        s.max_pulse_s = 3.0;
        s.aggr_ra_pct = 100.0;
        s.aggr_dec_pct = 100.0;
        s
    }

    #[test]
    fn dec_none_forces_zero_correction() {
        let mut s = settings();
        s.dec_guiding_mode = DecGuidingMode::None;
        let mut controller = CorrectionController::new();
        let stack = DriftStack::new(10);
        let c = controller.compute(1.0, 5.0, &s, &stack, 0.0, SideOfPier::West, DetectionMode::Donuts);
        assert_eq!(c.pulse_dec_s, 0.0);
    }

    #[test]
    fn north_only_clamps_non_negative() {
        let mut s = settings();
        s.dec_guiding_mode = DecGuidingMode::NorthOnly;
        let mut controller = CorrectionController::new();
        let stack = DriftStack::new(10);
        let c = controller.compute(0.0, -5.0, &s, &stack, 0.0, SideOfPier::West, DetectionMode::Donuts);
        assert!(c.pulse_dec_s >= 0.0);
    }

    #[test]
    fn pulse_clamped_to_max() {
        let mut s = settings();
        s.max_pulse_s = 0.5;
        let mut controller = CorrectionController::new();
        let stack = DriftStack::new(10);
        let c = controller.compute(100.0, 0.0, &s, &stack, 0.0, SideOfPier::West, DetectionMode::Donuts);
        assert!(c.pulse_ra_s.abs() <= 0.5 + 1e-9);
    }

    #[test]
    fn backlash_compensation_increases_magnitude_on_sign_change() {
        let mut s = settings();
        s.backlash_px = 0.3;
        s.speed_dec_px_per_s = 1.0;
        s.max_pulse_s = 10.0;
        let mut controller = CorrectionController::new();
        controller.last_dec_sign = Some(1.0);
        let stack = DriftStack::new(10);
        // drift_dec negative enough to demand a -0.2s pulse at speed 1px/s, aggr 100%.
        let c = controller.compute(0.0, 0.2, &s, &stack, 0.0, SideOfPier::West, DetectionMode::Donuts);
        assert_float_absolute_eq!(c.pulse_dec_s, -0.5, 1e-6);
    }

    #[test]
    fn meridian_flip_inverts_dec_and_rotates_ra() {
        let mut s = settings();
        s.side_of_pier = 1;
        s.flip_reverses_dec = true;
        let angle_before = CorrectionController::effective_angle_deg(&s, SideOfPier::West);
        let angle_after = CorrectionController::effective_angle_deg(&s, SideOfPier::East);
        assert_float_absolute_eq!(angle_after - angle_before, 180.0, 1e-9);
        let dec_before = CorrectionController::effective_speed_dec(&s, SideOfPier::West);
        let dec_after = CorrectionController::effective_speed_dec(&s, SideOfPier::East);
        assert_float_absolute_eq!(dec_after + dec_before, 0.0, 1e-9);
    }
}
