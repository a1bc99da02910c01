use std::collections::BTreeMap;

use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Prediction returned by the inference endpoint for one scan.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictionPayload {
    #[garde(length(min = 1, max = 200))]
    pub label: String,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    /// Class label -> probability.
    #[garde(custom(probabilities_in_unit_range))]
    pub probabilities: BTreeMap<String, f64>,

    /// Optional volumetric measurements (e.g. lesion volume in mL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub volumetry: Option<BTreeMap<String, f64>>,

    #[garde(length(min = 1, max = 100))]
    pub model_version: String,
}

fn probabilities_in_unit_range(value: &BTreeMap<String, f64>, _ctx: &()) -> garde::Result {
    match value.iter().find(|(_, p)| !(0.0..=1.0).contains(*p)) {
        Some((label, p)) => Err(garde::Error::new(format!(
            "probability for {label} out of range: {p}"
        ))),
        None => Ok(()),
    }
}

/// Classification of a failed prediction attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    // Transient
    Timeout,
    Connection,
    ServerError,
    RateLimited,
    InvalidResponse,

    // Permanent
    MalformedInput,
    UnsupportedFormat,
    Unprocessable,
    Rejected,
}

impl ErrorKind {
    /// Whether retrying unchanged input can plausibly succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::ServerError
                | ErrorKind::RateLimited
                | ErrorKind::InvalidResponse
        )
    }
}

/// A failed prediction attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PredictionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PredictionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> PredictionPayload {
        PredictionPayload {
            label: "glioma".to_string(),
            confidence: 0.91,
            probabilities: BTreeMap::from([
                ("glioma".to_string(), 0.91),
                ("meningioma".to_string(), 0.06),
                ("no_tumor".to_string(), 0.03),
            ]),
            volumetry: Some(BTreeMap::from([("tumor_ml".to_string(), 12.4)])),
            model_version: "resnet50-v2".to_string(),
        }
    }

    #[test]
    fn test_payload_wire_names_are_camel_case() {
        let json = serde_json::to_value(sample_payload()).unwrap();
        assert_eq!(json["modelVersion"], "resnet50-v2");
        assert_eq!(json["volumetry"]["tumor_ml"], 12.4);
    }

    #[test]
    fn test_payload_without_volumetry_deserializes() {
        let body = r#"{
            "label": "no_tumor",
            "confidence": 0.7,
            "probabilities": {"no_tumor": 0.7, "glioma": 0.3},
            "modelVersion": "v1"
        }"#;
        let payload: PredictionPayload = serde_json::from_str(body).unwrap();
        assert!(payload.volumetry.is_none());
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let mut payload = sample_payload();
        payload.confidence = 1.4;
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_probability_out_of_range_rejected() {
        let mut payload = sample_payload();
        payload.probabilities.insert("edema".to_string(), -0.2);
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::ServerError.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(!ErrorKind::MalformedInput.is_transient());
        assert!(!ErrorKind::UnsupportedFormat.is_transient());
        assert!(!ErrorKind::Rejected.is_transient());
    }

    #[test]
    fn test_error_display_includes_kind() {
        let err = PredictionError::new(ErrorKind::UnsupportedFormat, "expected DICOM");
        assert_eq!(err.to_string(), "unsupported_format: expected DICOM");
    }
}
