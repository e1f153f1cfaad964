//! Vehicle detector and plate reader client
//!
//! Inference runs in a separate service. Each processed frame is posted as
//! the raw image body; the service answers with every detection it found
//! and the vehicle filtering (class and confidence) happens here.
//!
//! Endpoints:
//! - `POST {url}/v1/detect` -> `{"detections":[{"class_id":2,"confidence":0.91,"bbox":[x1,y1,x2,y2]}]}`
//! - `POST {url}/v1/ocr?x1=&y1=&x2=&y2=` -> `{"lines":[{"text":"AB123CD","confidence":0.8}]}`

use crate::domain::types::VehicleBox;
use crate::io::frame_source::Frame;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// COCO class ids treated as vehicles: car, motorcycle, bus, truck
pub const VEHICLE_CLASSES: [u32; 4] = [2, 3, 5, 7];

/// Plate candidates this short are discarded
const MIN_PLATE_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detector request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("detector returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Detection capability consumed by camera workers
pub trait Detector: Send + Sync {
    /// Vehicle boxes in frame pixel coordinates
    fn detect(&self, frame: &Frame) -> Result<Vec<VehicleBox>, DetectionError>;

    /// Best-effort text read inside a region
    fn read_text(&self, frame: &Frame, region: &VehicleBox) -> Result<Option<String>, DetectionError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    lines: Vec<TextLine>,
}

/// Keep vehicle-class detections at or above the threshold.
///
/// Coordinates are truncated to whole pixels.
pub fn filter_vehicles(detections: &[RawDetection], threshold: f32) -> Vec<VehicleBox> {
    detections
        .iter()
        .filter(|d| VEHICLE_CLASSES.contains(&d.class_id) && d.confidence >= threshold)
        .map(|d| {
            let [x1, y1, x2, y2] = d.bbox;
            VehicleBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32)
        })
        .collect()
}

/// Highest-confidence line longer than four characters
pub fn best_plate(lines: &[TextLine]) -> Option<String> {
    lines
        .iter()
        .map(|l| (l.text.trim(), l.confidence))
        .filter(|(text, _)| text.chars().count() >= MIN_PLATE_LEN)
        .fold(None::<(&str, f32)>, |best, (text, conf)| match best {
            Some((_, best_conf)) if best_conf >= conf => best,
            _ => Some((text, conf)),
        })
        .map(|(text, _)| text.to_string())
}

/// HTTP client for the inference service
pub struct HttpDetector {
    client: reqwest::blocking::Client,
    base_url: String,
    confidence_threshold: f32,
}

impl HttpDetector {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        confidence_threshold: f32,
    ) -> Result<Self, DetectionError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            confidence_threshold,
        })
    }

    fn post_frame(
        &self,
        url: &str,
        frame: &Frame,
    ) -> Result<reqwest::blocking::Response, DetectionError> {
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(frame.data.to_vec())
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(DetectionError::Status { status: status.as_u16(), body });
        }
        Ok(resp)
    }
}

impl Detector for HttpDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<VehicleBox>, DetectionError> {
        let url = format!("{}/v1/detect", self.base_url);
        let parsed: DetectResponse = self.post_frame(&url, frame)?.json()?;
        let boxes = filter_vehicles(&parsed.detections, self.confidence_threshold);
        trace!(raw = parsed.detections.len(), vehicles = boxes.len(), "detect_response");
        Ok(boxes)
    }

    fn read_text(&self, frame: &Frame, region: &VehicleBox) -> Result<Option<String>, DetectionError> {
        let url = format!(
            "{}/v1/ocr?x1={}&y1={}&x2={}&y2={}",
            self.base_url, region.x1, region.y1, region.x2, region.y2
        );
        let parsed: OcrResponse = self.post_frame(&url, frame)?.json()?;
        Ok(best_plate(&parsed.lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, confidence: f32) -> RawDetection {
        RawDetection { class_id, confidence, bbox: [10.7, 20.2, 110.9, 220.5] }
    }

    fn line(text: &str, confidence: f32) -> TextLine {
        TextLine { text: text.to_string(), confidence }
    }

    #[test]
    fn test_filter_vehicle_classes_and_threshold() {
        let raw = [det(2, 0.9), det(0, 0.99), det(7, 0.5), det(5, 0.49), det(3, 0.6)];
        let boxes = filter_vehicles(&raw, 0.5);
        assert_eq!(boxes.len(), 3);
        assert_eq!(boxes[0], VehicleBox::new(10, 20, 110, 220));
    }

    #[test]
    fn test_detect_response_parses() {
        let json = r#"{"detections":[{"class_id":2,"confidence":0.8,"bbox":[1,2,3,4]}]}"#;
        let parsed: DetectResponse = serde_json::from_str(json).unwrap();
        assert_eq!(filter_vehicles(&parsed.detections, 0.5), vec![VehicleBox::new(1, 2, 3, 4)]);

        let empty: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.detections.is_empty());
    }

    #[test]
    fn test_best_plate_prefers_confidence_among_long_lines() {
        let lines = [line("AB12", 0.99), line("KA01AB1234", 0.7), line("MH12XY", 0.9)];
        assert_eq!(best_plate(&lines), Some("MH12XY".to_string()));
    }

    #[test]
    fn test_best_plate_none_when_all_short() {
        assert_eq!(best_plate(&[line("AB1", 0.9), line(" X ", 0.95)]), None);
        assert_eq!(best_plate(&[]), None);
    }
}
