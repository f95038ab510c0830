// THEORY:
// SSD-MobileNet v3 trained on COCO, run through OpenCV's `DetectionModel`.
// The model wants 320x320 BGR input scaled to [-1, 1]; it reports 1-based
// class ids into `coco.names` and already applies confidence filtering and
// non-maximum suppression, so `detect` only has to translate the results.

use anyhow::Context;
use image::RgbImage;
use opencv::{
    core::{self, Mat, Rect, Scalar, Size, Vector},
    dnn, imgproc,
    prelude::*,
};
use petpal::{BoundingBox, DetectError, Detection, DetectionParams, Detector};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DnnConfig {
    pub model_path: PathBuf,
    pub config_path: PathBuf,
    pub class_names_path: PathBuf,
    pub input_size: i32,
    pub input_scale: f64,
    pub input_mean: f64,
    pub swap_rb: bool,
}

impl DnnConfig {
    /// The usual file names inside a model directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            model_path: dir.join("frozen_inference_graph.pb"),
            config_path: dir.join("ssd_mobilenet_v3_large_coco_2020_01_14.pbtxt"),
            class_names_path: dir.join("coco.names"),
            input_size: 320,
            input_scale: 1.0 / 127.5,
            input_mean: 127.5,
            swap_rb: true,
        }
    }
}

pub struct DnnDetector {
    model: dnn::DetectionModel,
    class_names: Vec<String>,
}

impl DnnDetector {
    pub fn load(config: &DnnConfig) -> anyhow::Result<Self> {
        let class_names = fs::read_to_string(&config.class_names_path)
            .with_context(|| format!("reading {}", config.class_names_path.display()))?
            .lines()
            .map(|line| line.trim().to_string())
            .collect::<Vec<_>>();

        let mut model = dnn::DetectionModel::new(
            &config.model_path.to_string_lossy(),
            &config.config_path.to_string_lossy(),
        )
        .with_context(|| format!("loading {}", config.model_path.display()))?;
        model.set_input_size(Size::new(config.input_size, config.input_size))?;
        model.set_input_scale(Scalar::all(config.input_scale))?;
        model.set_input_mean(Scalar::all(config.input_mean))?;
        model.set_input_swap_rb(config.swap_rb)?;

        tracing::info!(classes = class_names.len(), "detection model loaded");
        Ok(Self { model, class_names })
    }

    fn class_name(&self, class_id: i32) -> String {
        usize::try_from(class_id - 1)
            .ok()
            .and_then(|index| self.class_names.get(index))
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }
}

fn inference_error(error: opencv::Error) -> DetectError {
    DetectError::Inference(error.to_string())
}

impl Detector for DnnDetector {
    fn detect(
        &mut self,
        frame: &RgbImage,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectError> {
        let (width, height) = frame.dimensions();
        let mut rgb = Mat::new_rows_cols_with_default(
            height as i32,
            width as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(|e| DetectError::MalformedFrame(e.to_string()))?;
        rgb.data_bytes_mut()
            .map_err(|e| DetectError::MalformedFrame(e.to_string()))?
            .copy_from_slice(frame.as_raw());
        let mut bgr = Mat::default();
        imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0).map_err(inference_error)?;

        let mut class_ids = Vector::<i32>::new();
        let mut confidences = Vector::<f32>::new();
        let mut boxes = Vector::<Rect>::new();
        self.model
            .detect(
                &bgr,
                &mut class_ids,
                &mut confidences,
                &mut boxes,
                params.confidence_threshold,
                params.nms_threshold,
            )
            .map_err(inference_error)?;

        Ok(class_ids
            .iter()
            .zip(confidences.iter())
            .zip(boxes.iter())
            .map(|((class_id, confidence), rect)| Detection {
                class_name: self.class_name(class_id),
                confidence,
                bbox: BoundingBox {
                    x: rect.x,
                    y: rect.y,
                    width: rect.width.max(0) as u32,
                    height: rect.height.max(0) as u32,
                },
            })
            .collect())
    }
}
