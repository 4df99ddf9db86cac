//! Classifier - Subject Detection Adapter
//!
//! ## Responsibilities
//!
//! - Send a frame to the detection service and parse labeled boxes
//! - Decide whether a result counts as a detection event (target label at
//!   or above the confidence floor)

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounding box in image coordinates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    #[serde(default, alias = "left")]
    pub x1: f32,
    #[serde(default, alias = "top")]
    pub y1: f32,
    #[serde(default, alias = "right")]
    pub x2: f32,
    #[serde(default, alias = "bottom")]
    pub y2: f32,
}

/// One labeled detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "class")]
    pub label: String,
    #[serde(default, alias = "conf", alias = "Confidence")]
    pub confidence: f32,
    #[serde(default, rename = "box", alias = "bbox")]
    pub bbox: Option<BBox>,
}

/// Subject detection boundary
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &[u8]) -> Result<Vec<Detection>>;
}

/// Which detections count as an event
#[derive(Debug, Clone)]
pub struct DetectionFilter {
    pub target_label: String,
    pub min_confidence: f32,
}

impl DetectionFilter {
    pub fn matches(&self, detections: &[Detection]) -> bool {
        detections.iter().any(|d| {
            d.label.eq_ignore_ascii_case(&self.target_label) && d.confidence >= self.min_confidence
        })
    }
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            target_label: "person".to_string(),
            min_confidence: 0.5,
        }
    }
}

/// HTTP detection service client (`POST {base_url}/detect`)
pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClassifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("classifier client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Check classifier reachability
    pub async fn health_check(&self) -> Result<bool> {
        let resp = self.client.get(&self.base_url).send().await?;
        Ok(resp.status().is_success())
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: &[u8]) -> Result<Vec<Detection>> {
        let url = format!("{}/detect", self.base_url);

        let form = Form::new().part(
            "image",
            Part::bytes(image.to_vec())
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Classifier(format!("{}: {}", status, body.trim())));
        }

        let detections: Vec<Detection> = resp
            .json()
            .await
            .map_err(|e| Error::Classifier(format!("invalid response: {}", e)))?;

        Ok(detections)
    }
}
