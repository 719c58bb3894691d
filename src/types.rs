use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Mean of the R, G and B channels over every pixel, in `0.0..=255.0`.
    pub fn mean_brightness(&self) -> f32 {
        let pixels = self.rgba.len() / 4;
        if pixels == 0 {
            return 0.0;
        }

        let sum: u64 = self
            .rgba
            .chunks_exact(4)
            .map(|px| px[0] as u64 + px[1] as u64 + px[2] as u64)
            .sum();
        sum as f32 / (pixels as f32 * 3.0)
    }
}

/// One ordered vector of expression scores produced by one inference cycle.
///
/// Serialized as a bare JSON array of numbers, which is also the wire format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample(pub Vec<f32>);

impl From<Vec<f32>> for Sample {
    fn from(scores: Vec<f32>) -> Self {
        Sample(scores)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Blendshape {
    pub name: String,
    pub score: f32,
}

/// Result of a single inference call. `faces` is empty when nothing was found.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Detection {
    pub faces: Vec<Vec<Blendshape>>,
}

impl Detection {
    pub fn empty() -> Self {
        Detection { faces: Vec::new() }
    }

    /// Scores of the first detected face, in category order.
    pub fn primary_sample(&self) -> Option<Sample> {
        let face = self.faces.first()?;
        if face.is_empty() {
            return None;
        }
        Some(Sample(face.iter().map(|shape| shape.score).collect()))
    }
}

pub const BLENDSHAPE_NAMES: [&str; 52] = [
    "_neutral",
    "browDownLeft",
    "browDownRight",
    "browInnerUp",
    "browOuterUpLeft",
    "browOuterUpRight",
    "cheekPuff",
    "cheekSquintLeft",
    "cheekSquintRight",
    "eyeBlinkLeft",
    "eyeBlinkRight",
    "eyeLookDownLeft",
    "eyeLookDownRight",
    "eyeLookInLeft",
    "eyeLookInRight",
    "eyeLookOutLeft",
    "eyeLookOutRight",
    "eyeLookUpLeft",
    "eyeLookUpRight",
    "eyeSquintLeft",
    "eyeSquintRight",
    "eyeWideLeft",
    "eyeWideRight",
    "jawForward",
    "jawLeft",
    "jawOpen",
    "jawRight",
    "mouthClose",
    "mouthDimpleLeft",
    "mouthDimpleRight",
    "mouthFrownLeft",
    "mouthFrownRight",
    "mouthFunnel",
    "mouthLeft",
    "mouthLowerDownLeft",
    "mouthLowerDownRight",
    "mouthPressLeft",
    "mouthPressRight",
    "mouthPucker",
    "mouthRight",
    "mouthRollLower",
    "mouthRollUpper",
    "mouthShrugLower",
    "mouthShrugUpper",
    "mouthSmileLeft",
    "mouthSmileRight",
    "mouthStretchLeft",
    "mouthStretchRight",
    "mouthUpperUpLeft",
    "mouthUpperUpRight",
    "noseSneerLeft",
    "noseSneerRight",
];
