use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use petpal::{CaptureError, FrameSource};

/// A V4L2/USB camera read through OpenCV's `VideoCapture`.
pub struct OpenCvCamera {
    capture: VideoCapture,
    bgr: Mat,
    rgb: Mat,
}

impl OpenCvCamera {
    pub fn open(index: i32, width: u32, height: u32) -> anyhow::Result<Self> {
        let mut capture = VideoCapture::new(index, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            anyhow::bail!("camera {index} could not be opened");
        }
        capture.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(width))?;
        capture.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(height))?;
        tracing::info!(
            index,
            width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32,
            height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32,
            "camera opened"
        );
        Ok(Self {
            capture,
            bgr: Mat::default(),
            rgb: Mat::default(),
        })
    }
}

fn read_error(error: opencv::Error) -> CaptureError {
    CaptureError::Read(error.to_string())
}

impl FrameSource for OpenCvCamera {
    fn capture(&mut self) -> Result<RgbImage, CaptureError> {
        if !self.capture.read(&mut self.bgr).map_err(read_error)? || self.bgr.empty() {
            return Err(CaptureError::Empty);
        }

        // OpenCV hands us BGR; everything downstream of the broker is RGB.
        imgproc::cvt_color(&self.bgr, &mut self.rgb, imgproc::COLOR_BGR2RGB, 0)
            .map_err(read_error)?;
        let width = self.rgb.cols() as u32;
        let height = self.rgb.rows() as u32;
        let bytes = self.rgb.data_bytes().map_err(read_error)?.to_vec();
        RgbImage::from_raw(width, height, bytes)
            .ok_or_else(|| CaptureError::Read(format!("unexpected {width}x{height} buffer")))
    }

    fn stop(&mut self) {
        if let Err(error) = self.capture.release() {
            tracing::warn!(%error, "camera release failed");
        }
    }
}
