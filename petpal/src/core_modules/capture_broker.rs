// THEORY:
// There is exactly one camera and its driver is not reentrant. The
// `CaptureBroker` is the only path to it: every read goes through one lock and
// runs on the blocking pool, so at most one read is ever in flight no matter
// how many tasks ask for frames. Viewers never read the camera themselves; the
// frame pump is the single consumer and the `StreamHub` fans its output out.

use crate::core_modules::schedule_clock::Clock;
use chrono::NaiveDateTime;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera read failed: {0}")]
    Read(String),
    #[error("camera returned an empty frame")]
    Empty,
    #[error("camera has been released")]
    Released,
    #[error("capture task failed: {0}")]
    Task(String),
}

/// A blocking camera driver.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<RgbImage, CaptureError>;

    /// Stops the device. Called once, on shutdown.
    fn stop(&mut self) {}
}

/// One captured frame, shared read-only between the detector and the encoder.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: NaiveDateTime,
    pub image: Arc<RgbImage>,
}

struct SourceSlot {
    source: Box<dyn FrameSource>,
    released: bool,
}

#[derive(Clone)]
pub struct CaptureBroker {
    slot: Arc<Mutex<SourceSlot>>,
    next_seq: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl CaptureBroker {
    pub fn new(source: Box<dyn FrameSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(SourceSlot {
                source,
                released: false,
            })),
            next_seq: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Reads one frame. Safe to call from any number of tasks; reads are
    /// serialized.
    pub async fn acquire_frame(&self) -> Result<Frame, CaptureError> {
        let slot = Arc::clone(&self.slot);
        let image = tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.released {
                return Err(CaptureError::Released);
            }
            slot.source.capture()
        })
        .await
        .map_err(|e| CaptureError::Task(e.to_string()))??;

        if image.width() == 0 || image.height() == 0 {
            return Err(CaptureError::Empty);
        }

        Ok(Frame {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            captured_at: self.clock.now(),
            image: Arc::new(image),
        })
    }

    /// Stops the camera. Waits for an in-flight read to finish first.
    pub async fn release(&self) {
        let slot = Arc::clone(&self.slot);
        let released = tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.released {
                return false;
            }
            slot.source.stop();
            slot.released = true;
            true
        })
        .await;

        match released {
            Ok(true) => tracing::info!("camera released"),
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "camera release task failed"),
        }
    }
}
