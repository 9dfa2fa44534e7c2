use serde::Serialize;

use crate::orchestrator::GenerationResult;

/// `produced_by` value for fallback results.
pub const PROCEDURAL: &str = "procedural";

/// Canned shapes shipped with the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Cube,
    Sphere,
    Cylinder,
    Cone,
    Torus,
}

impl Shape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cube => "cube",
            Self::Sphere => "sphere",
            Self::Cylinder => "cylinder",
            Self::Cone => "cone",
            Self::Torus => "torus",
        }
    }
}

/// Keyword table, checked top to bottom. First row with a keyword contained
/// in the lower-cased prompt wins.
pub const SHAPE_TABLE: &[(&[&str], Shape)] = &[
    (&["cube", "box"], Shape::Cube),
    (&["sphere", "ball", "globe"], Shape::Sphere),
    (&["cylinder", "tube", "can"], Shape::Cylinder),
    (&["cone", "pyramid"], Shape::Cone),
    (&["torus", "donut", "ring"], Shape::Torus),
];

pub const DEFAULT_SHAPE: Shape = Shape::Cube;

/// Offline keyword-to-shape mapping. Total over all prompts.
#[derive(Debug, Clone)]
pub struct ProceduralFallback {
    base: String,
}

impl Default for ProceduralFallback {
    fn default() -> Self {
        Self::new("/models/fallback")
    }
}

impl ProceduralFallback {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn shape_for(prompt: &str) -> Shape {
        let lower = prompt.to_lowercase();
        SHAPE_TABLE
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(_, shape)| *shape)
            .unwrap_or(DEFAULT_SHAPE)
    }

    pub fn reference_for(&self, shape: Shape) -> String {
        format!("{}/{}.glb", self.base, shape.as_str())
    }

    pub fn generate(&self, prompt: &str) -> GenerationResult {
        GenerationResult {
            model_reference: self.reference_for(Self::shape_for(prompt)),
            produced_by: PROCEDURAL.to_string(),
        }
    }
}
