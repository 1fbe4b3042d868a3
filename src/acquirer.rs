use crate::collaborators::camera::{Camera, FrameError, Image};
use crate::config::Settings;
use crate::error::{ErrorKind, GuiderError};
use crate::util::cancel::AbortWaiter;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const BUSY_POLL_TICK: Duration = Duration::from_millis(200);
const EXPOSURE_POLL_TICK_MIN: Duration = Duration::from_millis(10);
const EXPOSURE_POLL_TICK_MAX: Duration = Duration::from_millis(200);
const MAX_RETRIES: u32 = 3;

/// The frame acquirer (C1): triggers an exposure and blocks until the
/// decoded, channel-equalised image is available (§4.1).
pub struct FrameAcquirer;

impl FrameAcquirer {
    /// Requests one exposure at `settings.exposure_s` and returns the
    /// decoded image. Retries a stalled camera up to three times before
    /// surfacing `CameraUnresponsive`; observes `abort` at least every
    /// 200 ms throughout.
    pub async fn capture_frame(
        camera: &dyn Camera,
        settings: &Settings,
        abort: &mut AbortWaiter,
    ) -> Result<Image, FrameError> {
        let mut attempt = 0;
        loop {
            match Self::try_capture(camera, settings, abort).await {
                Ok(image) => return Ok(image),
                Err(FrameError::Aborted) => return Err(FrameError::Aborted),
                Err(FrameError::Timeout) if attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, "camera did not enter busy state; retrying exposure");
                    camera.abort_exposure().await?;
                }
                Err(FrameError::Timeout) => {
                    tracing::error!("camera unresponsive after {MAX_RETRIES} attempts");
                    return Err(FrameError::CameraUnresponsive);
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn try_capture(
        camera: &dyn Camera,
        settings: &Settings,
        abort: &mut AbortWaiter,
    ) -> Result<Image, FrameError> {
        camera.start_exposure(settings.exposure_s).await?;

        let entered_busy = abort
            .poll_until(BUSY_TIMEOUT, BUSY_POLL_TICK, || async {
                camera
                    .is_busy()
                    .await
                    .map_err(|e| GuiderError::new(ErrorKind::CameraUnresponsive, e.to_string()))
            })
            .await
            .map_err(map_poll_error)?;
        if !entered_busy {
            return Err(FrameError::Timeout);
        }

        // Coarsen the poll tick as the exposure runs: the source polls
        // quickly at first then backs off toward 200ms.
        let exposure_timeout = Duration::from_secs_f64((settings.exposure_s + 10.0).max(10.0));
        let tick = if settings.exposure_s < 1.0 {
            EXPOSURE_POLL_TICK_MIN
        } else {
            EXPOSURE_POLL_TICK_MAX
        };
        let ready = abort
            .poll_until(exposure_timeout, tick, || async {
                camera
                    .is_image_ready()
                    .await
                    .map_err(|e| GuiderError::new(ErrorKind::CameraUnresponsive, e.to_string()))
            })
            .await
            .map_err(map_poll_error)?;
        if !ready {
            return Err(FrameError::Timeout);
        }

        let mut image = camera.fetch_image().await?;
        if image.format.is_bayered() {
            image.equalize_channels();
        }
        Ok(image)
    }
}

fn map_poll_error(e: GuiderError) -> FrameError {
    if e.is_aborted() {
        FrameError::Aborted
    } else {
        FrameError::CameraUnresponsive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::camera::PixelFormat;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeCamera {
        busy_after_polls: u32,
        polls: AtomicU32,
        never_busy: AtomicBool,
    }

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
            self.polls.store(0, Ordering::SeqCst);
            Ok(())
        }
        async fn abort_exposure(&self) -> Result<(), FrameError> {
            Ok(())
        }
        async fn is_busy(&self) -> Result<bool, FrameError> {
            if self.never_busy.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(n >= self.busy_after_polls)
        }
        async fn is_image_ready(&self) -> Result<bool, FrameError> {
            Ok(true)
        }
        async fn fetch_image(&self) -> Result<Image, FrameError> {
            Ok(Image::new(2, 2, PixelFormat::Mono16, vec![0.0; 4]))
        }
        fn sensor_width(&self) -> u32 {
            2
        }
        fn sensor_height(&self) -> u32 {
            2
        }
    }

    #[tokio::test]
    async fn captures_after_busy_transition() {
        let camera = FakeCamera {
            busy_after_polls: 0,
            polls: AtomicU32::new(0),
            never_busy: AtomicBool::new(false),
        };
        let settings = Settings::default();
        let (_token, mut waiter) = crate::util::cancel::AbortToken::new();
        let image = FrameAcquirer::capture_frame(&camera, &settings, &mut waiter)
            .await
            .unwrap();
        assert_eq!(image.width, 2);
    }

    #[tokio::test]
    async fn surfaces_camera_unresponsive_after_retries() {
        let camera = FakeCamera {
            busy_after_polls: u32::MAX,
            polls: AtomicU32::new(0),
            never_busy: AtomicBool::new(true),
        };
        let settings = Settings::default();
        let (_token, mut waiter) = crate::util::cancel::AbortToken::new();
        let result = FrameAcquirer::capture_frame(&camera, &settings, &mut waiter).await;
        assert_eq!(result.unwrap_err(), FrameError::CameraUnresponsive);
    }

    #[tokio::test]
    async fn abort_short_circuits_wait() {
        let camera = Arc::new(FakeCamera {
            busy_after_polls: u32::MAX,
            polls: AtomicU32::new(0),
            never_busy: AtomicBool::new(true),
        });
        let settings = Settings::default();
        let (token, mut waiter) = crate::util::cancel::AbortToken::new();
        token.abort();
        let result = FrameAcquirer::capture_frame(camera.as_ref(), &settings, &mut waiter).await;
        assert_eq!(result.unwrap_err(), FrameError::Aborted);
    }
}
