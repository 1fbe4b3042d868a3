use crate::acquirer::FrameAcquirer;
use crate::calibration::{CalibrationEngine, CalibrationOutcome};
use crate::collaborators::camera::{Camera, FrameError, Image};
use crate::collaborators::detection::StarDetectionLibrary;
use crate::collaborators::mount::Mount;
use crate::config::{DecGuidingMode, DetectionMode, DitherStrategy, Settings};
use crate::detector::DriftDetector;
use crate::error::{ErrorKind, GuiderError, Result};
use crate::guiding_loop::{self, GuidingState, LoopRequest};
use crate::session_log::SessionLog;
use crate::phase::Phase;
use crate::util::cancel::AbortToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, RwLock};

const MAX_DEC_FOR_GUIDING: f64 = 89.0;

/// The session supervisor (C6): owns every long-lived piece of state for a
/// session (§3.9) and dispatches the top-level commands in §4.6. Exactly
/// one of the `start_*` operations may be in flight at a time, enforced by
/// `running` (the `running_process` guard of §5's scheduling model).
pub struct Session {
    camera: Arc<dyn Camera>,
    mount: Arc<dyn Mount>,
    detection: Arc<dyn StarDetectionLibrary>,

    settings: RwLock<Settings>,
    mode: RwLock<DetectionMode>,
    star_positions: RwLock<Vec<(f64, f64)>>,

    phase_tx: watch::Sender<Phase>,
    phase_rx: watch::Receiver<Phase>,

    abort: AbortToken,
    running: AtomicBool,

    last_image: tokio::sync::Mutex<Option<Image>>,
    loop_requests: StdMutex<Option<mpsc::Sender<LoopRequest>>>,
}

impl Session {
    pub fn new(
        camera: Arc<dyn Camera>,
        mount: Arc<dyn Mount>,
        detection: Arc<dyn StarDetectionLibrary>,
        settings: Settings,
        mode: DetectionMode,
    ) -> Self {
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (abort, _waiter) = AbortToken::new();
        Self {
            camera,
            mount,
            detection,
            settings: RwLock::new(settings),
            mode: RwLock::new(mode),
            star_positions: RwLock::new(Vec::new()),
            phase_tx,
            phase_rx,
            abort,
            running: AtomicBool::new(false),
            last_image: tokio::sync::Mutex::new(None),
            loop_requests: StdMutex::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase_rx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase_rx.clone()
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    pub async fn last_image(&self) -> Option<Image> {
        self.last_image.lock().await.clone()
    }

    /// Applies a settings update, rejecting changes to the subset that's
    /// locked while a session is active (§6, §7's `ConfigurationLocked`):
    /// edge-clipping, star-count and leaving/entering DEC `Both`.
    pub async fn update_settings(&self, new: Settings) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            let current = self.settings.read().await;
            if new.edge_clipping_px != current.edge_clipping_px {
                return Err(locked("edge_clipping_px"));
            }
            if new.min_usable_stars != current.min_usable_stars {
                return Err(locked("min_usable_stars"));
            }
            let leaving_both = current.dec_guiding_mode == DecGuidingMode::Both
                && new.dec_guiding_mode != DecGuidingMode::Both;
            let entering_both = new.dec_guiding_mode == DecGuidingMode::Both
                && current.dec_guiding_mode != DecGuidingMode::Both;
            if leaving_both || entering_both {
                return Err(locked("dec_guiding_mode"));
            }
        }
        *self.settings.write().await = new;
        Ok(())
    }

    /// Detection mode is immutable for the lifetime of an active session
    /// (§3.1, §7).
    pub async fn set_detection_mode(&self, mode: DetectionMode) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(locked("detection_mode"));
        }
        *self.mode.write().await = mode;
        Ok(())
    }

    pub async fn set_star_positions(&self, positions: Vec<(f64, f64)>) {
        *self.star_positions.write().await = positions;
    }

    /// `ClearSelection` (§4.6): zero all star coordinates.
    pub async fn clear_selection(&self) {
        self.star_positions.write().await.clear();
    }

    /// Sets the abort flag; every suspension point in an active operation
    /// observes it within 200ms (§4.6, §5).
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// `StartPreviewOnce` / `StartPreviewStream` (§4.6): capture only, no
    /// corrections, no logging.
    pub async fn start_preview_once(&self) -> Result<()> {
        self.run_preview(false).await
    }

    pub async fn start_preview_stream(&self) -> Result<()> {
        self.run_preview(true).await
    }

    async fn run_preview(&self, stream: bool) -> Result<()> {
        self.begin_session()?;
        let mut waiter = self.abort.waiter();
        self.phase_tx.send_replace(Phase::Previewing);

        let result = async {
            loop {
                if waiter.is_aborted() {
                    return Err(GuiderError::aborted());
                }
                let settings = self.settings.read().await.clone();
                let image = FrameAcquirer::capture_frame(self.camera.as_ref(), &settings, &mut waiter)
                    .await
                    .map_err(map_frame_error)?;
                *self.last_image.lock().await = Some(image);
                if !stream {
                    return Ok(());
                }
            }
        }
        .await;

        self.phase_tx.send_replace(if result.is_ok() { Phase::Done } else { Phase::Failed });
        self.end_session();
        result
    }

    /// `StartCalibration` (§4.6): runs C3 and, on success, folds the
    /// computed angle/speed/backlash/side-of-pier back into settings.
    pub async fn start_calibration(&self) -> Result<CalibrationOutcome> {
        self.begin_session()?;
        let mut waiter = self.abort.waiter();
        self.phase_tx.send_replace(Phase::Initializing);

        let settings = self.settings.read().await.clone();
        let mode = *self.mode.read().await;
        let positions = self.star_positions.read().await.clone();
        let positions_arg = (!positions.is_empty()).then_some(positions.as_slice());

        let outcome = CalibrationEngine::run(
            self.camera.as_ref(),
            self.mount.as_ref(),
            self.detection.as_ref(),
            &settings,
            mode,
            positions_arg,
            &self.phase_tx,
            &mut waiter,
        )
        .await;

        match &outcome {
            Ok(o) => {
                let mut s = self.settings.write().await;
                s.angle_deg = o.angle_deg;
                s.speed_ra_px_per_s = o.speed_ra_px_per_s;
                s.speed_dec_px_per_s = o.speed_dec_px_per_s;
                s.backlash_px = o.backlash_px;
                s.side_of_pier = o.side_of_pier;
            }
            Err(_) => {
                self.phase_tx.send_replace(Phase::Failed);
            }
        }
        self.end_session();
        outcome
    }

    /// `StartCalibrationAndGuiding` (§4.6): C3 then, on success, C5.
    pub async fn start_calibration_and_guiding(&self) -> Result<()> {
        self.start_calibration().await?;
        self.start_guiding().await
    }

    /// `StartGuiding` (§4.6): requires a prior successful calibration
    /// (`speed_ra ≠ 0` and `|δ| ≤ 89°`), else fails with an explanatory
    /// reason.
    pub async fn start_guiding(&self) -> Result<()> {
        let settings = self.settings.read().await.clone();
        if settings.speed_ra_px_per_s == 0.0 {
            return Err(GuiderError::new(
                ErrorKind::CalibrationInconsistent,
                "guiding requires a prior successful calibration",
            ));
        }
        let declination_deg = self
            .mount
            .declination_deg()
            .await
            .map_err(|_| GuiderError::new(ErrorKind::MountUnresponsive, "could not read declination"))?;
        if declination_deg.abs() > MAX_DEC_FOR_GUIDING {
            return Err(GuiderError::new(ErrorKind::TooCloseToPole, "|declination| > 89 degrees"));
        }

        self.begin_session()?;
        let mut waiter = self.abort.waiter();
        self.phase_tx.send_replace(Phase::Initializing);

        let result = self.run_guiding_session(&settings, &mut waiter).await;

        self.phase_tx.send_replace(if result.is_ok() { Phase::Done } else { Phase::Failed });
        self.end_session();
        result
    }

    async fn run_guiding_session(
        &self,
        settings: &Settings,
        waiter: &mut crate::util::cancel::AbortWaiter,
    ) -> Result<()> {
        let mode = *self.mode.read().await;
        let positions = self.star_positions.read().await.clone();
        let positions_arg = (!positions.is_empty()).then_some(positions.as_slice());

        let detector = DriftDetector::new(self.detection.as_ref());
        let first_image = FrameAcquirer::capture_frame(self.camera.as_ref(), settings, waiter)
            .await
            .map_err(map_frame_error)?;
        let reference = detector.build_reference(&first_image, mode, settings, positions_arg)?;
        let mut state = GuidingState::new(reference, settings.stack_size);

        let mut log = Some(SessionLog::open(&settings.log_path_template)?);
        let (tx, mut rx) = mpsc::channel(8);
        *self.loop_requests.lock().unwrap() = Some(tx);

        self.phase_tx.send_replace(Phase::Guiding);
        let result = guiding_loop::run(
            self.camera.as_ref(),
            self.mount.as_ref(),
            self.detection.as_ref(),
            settings,
            mode,
            &mut state,
            &self.phase_tx,
            &mut log,
            &mut rx,
            waiter,
        )
        .await;

        *self.loop_requests.lock().unwrap() = None;
        if let Some(log) = log {
            log.close()?;
        }
        result
    }

    /// Triggers a dither of a running guiding session (§4.6, §4.5's dither
    /// request handling).
    pub async fn dither(&self, strategy: DitherStrategy) -> Result<()> {
        let sender = self.loop_requests.lock().unwrap().clone();
        match sender {
            Some(tx) => tx
                .send(LoopRequest::Dither { strategy })
                .await
                .map_err(|_| GuiderError::new(ErrorKind::InvalidValue, "guiding loop is not accepting requests")),
            None => Err(GuiderError::new(ErrorKind::InvalidValue, "not currently guiding")),
        }
    }

    /// Dispatches a top-level `Command` (§3.12, §9's message-passing
    /// redesign note: control requests and collaborator events arrive as
    /// enum variants rather than driving state through property-change
    /// callbacks). `Start*` variants run their operation to completion;
    /// callers that want to observe progress meanwhile should hold a
    /// [`Session::subscribe_phase`] receiver.
    pub async fn dispatch(self: &Arc<Self>, command: crate::phase::Command) -> Result<()> {
        use crate::phase::Command;
        match command {
            Command::StartPreviewOnce => self.start_preview_once().await,
            Command::StartPreviewStream => self.start_preview_stream().await,
            Command::StartCalibration => self.start_calibration().await.map(|_| ()),
            Command::StartCalibrationAndGuiding => self.start_calibration_and_guiding().await,
            Command::StartGuiding => self.start_guiding().await,
            Command::ClearSelection => {
                self.clear_selection().await;
                Ok(())
            }
            Command::Dither { strategy } => self.dither(strategy).await,
            Command::Abort => {
                self.abort();
                Ok(())
            }
        }
    }

    fn begin_session(&self) -> Result<()> {
        self.abort.reset();
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| GuiderError::new(ErrorKind::ConfigurationLocked, "a session is already active"))?;
        Ok(())
    }

    fn end_session(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn locked(field: &str) -> GuiderError {
    GuiderError::new(
        ErrorKind::ConfigurationLocked,
        format!("'{field}' cannot change while a session is active"),
    )
}

fn map_frame_error(e: FrameError) -> GuiderError {
    match e {
        FrameError::Aborted => GuiderError::aborted(),
        FrameError::Timeout => GuiderError::new(ErrorKind::Timeout, "camera exposure timed out"),
        FrameError::CameraUnresponsive => {
            GuiderError::new(ErrorKind::CameraUnresponsive, "camera unresponsive after retries")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::camera::PixelFormat;
    use crate::collaborators::detection::{CentroidDigest, DetectionFailure, DonutsDigest};
    use crate::collaborators::mount::{GuideDirection, MountError, SideOfPier};
    use async_trait::async_trait;

    struct FakeCamera;
    #[async_trait]
    impl Camera for FakeCamera {
        async fn set_subframe(&self, _l: u32, _t: u32, _w: u32, _h: u32) -> Result<(), FrameError> {
            Ok(())
        }
        async fn set_upload_mode_client_only(&self, _c: bool) -> Result<(), FrameError> {
            Ok(())
        }
        async fn set_raw_image_format(&self) -> Result<(), FrameError> {
            Ok(())
        }
        async fn start_exposure(&self, _s: f64) -> Result<(), FrameError> {
            Ok(())
        }
        async fn abort_exposure(&self) -> Result<(), FrameError> {
            Ok(())
        }
        async fn is_busy(&self) -> Result<bool, FrameError> {
            Ok(true)
        }
        async fn is_image_ready(&self) -> Result<bool, FrameError> {
            Ok(true)
        }
        async fn fetch_image(&self) -> Result<Image, FrameError> {
            Ok(Image::new(16, 16, PixelFormat::Mono16, vec![0.0; 256]))
        }
        fn sensor_width(&self) -> u32 {
            16
        }
        fn sensor_height(&self) -> u32 {
            16
        }
    }

    struct FakeMount;
    #[async_trait]
    impl Mount for FakeMount {
        async fn pulse(&self, _d: GuideDirection, _ms: u32) -> Result<(), MountError> {
            Ok(())
        }
        async fn ra_busy(&self) -> Result<bool, MountError> {
            Ok(false)
        }
        async fn dec_busy(&self) -> Result<bool, MountError> {
            Ok(false)
        }
        async fn declination_deg(&self) -> Result<f64, MountError> {
            Ok(0.0)
        }
        async fn side_of_pier(&self) -> Result<SideOfPier, MountError> {
            Ok(SideOfPier::West)
        }
    }

    struct FakeDetection;
    impl StarDetectionLibrary for FakeDetection {
        fn build_donuts_digest(&self, _i: &Image, region: crate::config::Rect) -> std::result::Result<DonutsDigest, DetectionFailure> {
            Ok(DonutsDigest { region, spectrum: vec![] })
        }
        fn correlate_donuts(&self, _r: &DonutsDigest, _c: &DonutsDigest) -> std::result::Result<(f64, f64, f64), DetectionFailure> {
            Ok((0.0, 0.0, 40.0))
        }
        fn build_centroid_digest(&self, _i: &Image) -> std::result::Result<CentroidDigest, DetectionFailure> {
            Ok(CentroidDigest { centroid_x: 8.0, centroid_y: 8.0, snr: 40.0 })
        }
        fn refine_star_centroid(&self, _i: &Image, x: f64, y: f64, _n: u32) -> std::result::Result<CentroidDigest, DetectionFailure> {
            Ok(CentroidDigest { centroid_x: x, centroid_y: y, snr: 40.0 })
        }
        fn multistar_reduce(&self, drifts: &[(f64, f64, f64)], _w: bool) -> (f64, f64, f64) {
            drifts.first().copied().unwrap_or((0.0, 0.0, 0.0))
        }
    }

    fn session() -> Session {
        Session::new(
            Arc::new(FakeCamera),
            Arc::new(FakeMount),
            Arc::new(FakeDetection),
            Settings::default(),
            DetectionMode::Centroid,
        )
    }

    #[tokio::test]
    async fn preview_once_populates_last_image() {
        let s = session();
        s.start_preview_once().await.unwrap();
        assert!(s.last_image().await.is_some());
        assert_eq!(s.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn start_guiding_without_calibration_fails() {
        let s = session();
        let err = s.start_guiding().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CalibrationInconsistent);
    }

    #[tokio::test]
    async fn settings_locked_fields_rejected_while_running() {
        let s = session();
        s.running.store(true, Ordering::SeqCst);
        let mut new = s.settings().await;
        new.edge_clipping_px += 1;
        let err = s.update_settings(new).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationLocked);
        s.running.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn dispatch_routes_preview_command() {
        let s = Arc::new(session());
        s.dispatch(crate::phase::Command::StartPreviewOnce).await.unwrap();
        assert_eq!(s.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn dispatch_clear_selection_empties_positions() {
        let s = Arc::new(session());
        s.set_star_positions(vec![(1.0, 1.0)]).await;
        s.dispatch(crate::phase::Command::ClearSelection).await.unwrap();
        assert!(s.star_positions.read().await.is_empty());
    }
}
