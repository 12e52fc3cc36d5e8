use std::sync::Arc;

use image::RgbImage;

use crate::error::ClassifyError;
use crate::labels::ClassLabelTable;
use crate::preprocess::{self, ModelKind, TensorLayout};
use crate::registry::ModelRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub confidence: f32,
    pub scores: Vec<f32>,
}

/// Preprocesses an image for the selected model family and runs it.
pub struct InferenceDispatcher {
    registry: Arc<ModelRegistry>,
    labels: Arc<ClassLabelTable>,
    layout: TensorLayout,
}

impl InferenceDispatcher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        labels: Arc<ClassLabelTable>,
        layout: TensorLayout,
    ) -> Self {
        Self {
            registry,
            labels,
            layout,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn labels(&self) -> &ClassLabelTable {
        &self.labels
    }

    pub fn classify_bytes(&self, kind: ModelKind, bytes: &[u8]) -> Result<Prediction, ClassifyError> {
        let image = preprocess::decode_image(bytes)?;
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            "Image decoded"
        );
        self.classify(kind, &image)
    }

    pub fn classify(&self, kind: ModelKind, image: &RgbImage) -> Result<Prediction, ClassifyError> {
        let input = preprocess::to_tensor(image, kind, self.layout);

        let scores = self
            .registry
            .model(kind)
            .predict(&input)
            .map_err(ClassifyError::Inference)?;

        if scores.len() != self.labels.len() {
            tracing::warn!(
                model = %kind,
                outputs = scores.len(),
                classes = self.labels.len(),
                "Model output size does not match the label table"
            );
        }

        if scores.is_empty() {
            return Err(ClassifyError::EmptyOutput);
        }
        let (index, confidence) =
            top1(&scores).ok_or(ClassifyError::NoFiniteScore(scores.len()))?;
        let class_name = self
            .labels
            .name(index)
            .ok_or(ClassifyError::LabelOutOfRange {
                index,
                classes: self.labels.len(),
            })?
            .to_string();

        Ok(Prediction {
            class_name,
            confidence,
            scores,
        })
    }
}

/// Index and value of the highest score. Ties go to the lowest index; NaN never wins.
pub fn top1(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((index, score)),
        }
    }
    best
}
