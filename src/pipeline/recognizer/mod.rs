#[cfg(feature = "engine-ort")]
mod ort;

use std::path::PathBuf;

use anyhow::Result;

use crate::types::{BLENDSHAPE_NAMES, Blendshape, Detection, Frame};

/// Perception step: turns one frame into zero or more faces of blendshape
/// scores. Implementations may block for as long as inference takes.
pub trait FaceEngine: Send + 'static {
    fn infer(&mut self, frame: &Frame) -> Result<Detection>;
}

impl<E: FaceEngine + ?Sized> FaceEngine for Box<E> {
    fn infer(&mut self, frame: &Frame) -> Result<Detection> {
        (**self).infer(frame)
    }
}

#[derive(Clone, Debug, Default)]
pub enum EngineBackend {
    #[default]
    Placeholder,
    #[cfg(feature = "engine-ort")]
    Ort { model_path: PathBuf },
}

impl EngineBackend {
    pub fn label(&self) -> &'static str {
        match self {
            EngineBackend::Placeholder => "placeholder",
            #[cfg(feature = "engine-ort")]
            EngineBackend::Ort { .. } => "ort",
        }
    }

    /// Builds the engine selected by `name`, rejecting backends that were not
    /// compiled in.
    pub fn from_name(name: &str, model_path: Option<PathBuf>) -> Result<Self> {
        match name {
            "placeholder" => Ok(EngineBackend::Placeholder),
            #[cfg(feature = "engine-ort")]
            "ort" => {
                let model_path =
                    model_path.ok_or_else(|| anyhow::anyhow!("the ort engine needs --model"))?;
                Ok(EngineBackend::Ort { model_path })
            }
            other => {
                let _ = model_path;
                Err(anyhow::anyhow!(
                    "engine `{other}` is not available in this build"
                ))
            }
        }
    }

    pub fn build(&self) -> Result<Box<dyn FaceEngine>> {
        log::info!("starting face engine: {}", self.label());
        match self {
            EngineBackend::Placeholder => Ok(Box::new(PlaceholderEngine::default())),
            #[cfg(feature = "engine-ort")]
            EngineBackend::Ort { model_path } => Ok(Box::new(ort::OrtEngine::new(model_path)?)),
        }
    }
}

/// Frames darker than this are treated as "no face in view".
const NO_FACE_BRIGHTNESS: f32 = 8.0;

/// Brightness-driven stand-in for a real model. Useful for demos and for
/// exercising the pipeline without a camera or model file.
#[derive(Debug, Default)]
pub struct PlaceholderEngine;

impl FaceEngine for PlaceholderEngine {
    fn infer(&mut self, frame: &Frame) -> Result<Detection> {
        let brightness = frame.mean_brightness();
        if brightness < NO_FACE_BRIGHTNESS {
            return Ok(Detection::empty());
        }

        let level = (brightness / 255.0).clamp(0.0, 1.0);
        let face = BLENDSHAPE_NAMES
            .iter()
            .map(|&name| {
                let score = match name {
                    "jawOpen" => level,
                    "mouthSmileLeft" | "mouthSmileRight" => level * 0.5,
                    "eyeBlinkLeft" | "eyeBlinkRight" => 1.0 - level,
                    "browInnerUp" => level * level,
                    _ => 0.0,
                };
                Blendshape {
                    name: name.to_string(),
                    score,
                }
            })
            .collect();

        Ok(Detection { faces: vec![face] })
    }
}
