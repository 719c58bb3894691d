use std::path::Path;

use anyhow::{Context, Result, anyhow};
use image::{RgbaImage, imageops::FilterType};
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use rayon::prelude::*;

use super::FaceEngine;
use crate::types::{BLENDSHAPE_NAMES, Blendshape, Detection, Frame};

const INPUT_SIZE: u32 = 256;
const FACE_PRESENCE_THRESHOLD: f32 = 0.5;

/// Runs an ONNX model mapping an RGB frame (NHWC, `[0, 1]`) to blendshape
/// scores. Output 0 holds the scores; an optional output 1 holds a face
/// presence score gating the result.
pub(super) struct OrtEngine {
    session: Session,
}

impl OrtEngine {
    pub(super) fn new(model_path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ORT session from {}", model_path.display()))?;

        log::info!("ort face engine ready using {}", model_path.display());
        Ok(Self { session })
    }
}

fn prepare_input(frame: &Frame) -> Result<Array4<f32>> {
    let image = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone())
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    let resized = image::imageops::resize(&image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let normalized: Vec<f32> = resized
        .as_raw()
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();

    Array4::<f32>::from_shape_vec(
        (1, INPUT_SIZE as usize, INPUT_SIZE as usize, 3),
        normalized,
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))
}

fn label_for(index: usize, total: usize) -> String {
    if total == BLENDSHAPE_NAMES.len() {
        BLENDSHAPE_NAMES[index].to_string()
    } else {
        format!("score_{index}")
    }
}

impl FaceEngine for OrtEngine {
    fn infer(&mut self, frame: &Frame) -> Result<Detection> {
        let tensor = Tensor::from_array(prepare_input(frame)?)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run ORT session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("model returned no outputs"));
        }

        let presence = if outputs.len() > 1 {
            outputs[1]
                .try_extract_array::<f32>()
                .ok()
                .and_then(|arr| arr.iter().next().copied())
                .unwrap_or(1.0)
        } else {
            1.0
        };
        if presence < FACE_PRESENCE_THRESHOLD {
            return Ok(Detection::empty());
        }

        let scores: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        let total = scores.len();
        let face = scores
            .into_iter()
            .enumerate()
            .map(|(index, score)| Blendshape {
                name: label_for(index, total),
                score: score.clamp(0.0, 1.0),
            })
            .collect();

        Ok(Detection { faces: vec![face] })
    }
}
