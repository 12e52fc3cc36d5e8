use serde::{Deserialize, Serialize};

use crate::dispatcher::Prediction;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResponse {
    pub predicted_class: String,
    pub confidence: f32,
    pub raw_predictions: Vec<f32>,
}

impl From<Prediction> for PredictionResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            predicted_class: prediction.class_name,
            confidence: prediction.confidence,
            raw_predictions: prediction.scores,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub message: String,
    pub models_loaded: Vec<String>,
    pub classes_loaded: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorResponse {
    pub detail: String,
}
