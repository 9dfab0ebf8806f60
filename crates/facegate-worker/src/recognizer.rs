//! ArcFace recognizer via ONNX Runtime.
//!
//! Crops the detected face with a margin, resizes it to 112x112 and returns
//! the L2-normalized 512-d embedding of the w600k_r50 model.

use crate::detector::FaceBox;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Fraction of the box size added on every side before cropping.
const CROP_MARGIN: f32 = 0.2;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the image")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    pub fn extract(&mut self, image: &DynamicImage, face: &FaceBox) -> Result<Vec<f32>, RecognizerError> {
        let crop = crop_with_margin(image, face).ok_or(RecognizerError::EmptyCrop)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(l2_normalize(raw.to_vec()))
    }
}

/// Crop `face` grown by [`CROP_MARGIN`] and clamped to the image.
pub fn crop_with_margin(image: &DynamicImage, face: &FaceBox) -> Option<DynamicImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;

    let x0 = (face.x - mx).floor().clamp(0.0, w);
    let y0 = (face.y - my).floor().clamp(0.0, h);
    let x1 = (face.x + face.width + mx).ceil().clamp(0.0, w);
    let y1 = (face.y + face.height + my).ceil().clamp(0.0, h);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }
    Some(image.crop_imm(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

fn preprocess(crop: &DynamicImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let resized = crop
        .resize_exact(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle)
        .to_rgb8();

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
