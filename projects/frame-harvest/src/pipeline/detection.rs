use crate::config::AcceleratorId;
use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use serde::Serialize;
use std::path::Path;
use usls::models::RTDETR;
use usls::{Config, Image};

/// Bounding box in image pixels
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Black-box object detector over a single BGR frame.
pub trait Detector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>>;
}

/// Presence test used by the signal scan: stops at the first matching box.
pub fn has_target(detections: &[Detection], target_class: &str, min_conf: f32) -> bool {
    detections
        .iter()
        .any(|d| d.class_name == target_class && d.confidence >= min_conf)
}

/// RT-DETR through usls, pinned to one accelerator.
pub struct RtDetrDetector {
    model: RTDETR,
}

impl RtDetrDetector {
    pub fn new(model_path: &Path, accelerator: AcceleratorId) -> Result<Self> {
        let model_file = model_path
            .to_str()
            .ok_or_else(|| anyhow!("Model path is not valid UTF-8: {:?}", model_path))?;
        let config = Config::default()
            .with_model_file(model_file)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = {
            let _ = accelerator;
            config.with_model_device(usls::Device::CoreMl)
        };
        #[cfg(not(target_os = "macos"))]
        let config = if accelerator.is_cpu() {
            config.with_model_device(usls::Device::Cpu(0))
        } else {
            config.with_model_device(usls::Device::Cuda(accelerator.0 as usize))
        };

        let config = config.commit()?;
        let model = RTDETR::new(config)
            .with_context(|| format!("Failed to load RT-DETR model {:?}", model_path))?;
        tracing::info!("Loaded detector {:?} on {}", model_path, accelerator);
        Ok(Self { model })
    }
}

impl Detector for RtDetrDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        let dynamic_image = mat_to_dynamic_image(frame)?;

        // usls RT-DETR pads to a square and reports boxes in the padded space;
        // scale the long axis back.
        let size = frame.size()?;
        let (w, h) = (size.width as f32, size.height as f32);
        let (x_corr, y_corr) = if w > h {
            (w / h, 1.0)
        } else if h > w {
            (1.0, h / w)
        } else {
            (1.0, 1.0)
        };

        let results = self.model.forward(&[Image::from(dynamic_image)])?;
        let detections = results
            .into_iter()
            .next()
            .map(|y| {
                y.hbbs
                    .into_iter()
                    .map(|hbb| Detection {
                        class_name: hbb.name().unwrap_or("").to_string(),
                        confidence: hbb.confidence().unwrap_or(0.0),
                        bbox: BBox {
                            x: hbb.xmin() * x_corr,
                            y: hbb.ymin() * y_corr,
                            w: hbb.width() * x_corr,
                            h: hbb.height() * y_corr,
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(detections)
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer =
        ImageBuffer::<Rgb<u8>, _>::from_vec(size.width as u32, size.height as u32, buffer)
            .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}
