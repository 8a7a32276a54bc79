//! Clients for the two external recognition services.
//!
//! A page goes through a region detector, which finds text regions, and then
//! a text recognizer, which reads the cropped regions. Both are reached
//! through traits, so the orchestrator can be driven by real HTTP services,
//! by the offline [`echo`] backend, or by test doubles.

use std::sync::Arc;

use image::RgbImage;

use crate::{
    config::{BackendType, RecognitionConfig, Settings},
    geometry::Region,
    prelude::*,
};

pub mod echo;
pub mod http;

/// One recognized text region on a page.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    pub region: Region,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Detection {
    /// Pair detector regions with recognized texts, index by index.
    pub fn zip(regions: Vec<Region>, texts: Vec<String>) -> Vec<Detection> {
        regions
            .into_iter()
            .zip(texts)
            .map(|(region, text)| Detection {
                language: region.language.clone(),
                region,
                text,
            })
            .collect()
    }
}

/// Finds text regions on a page.
#[async_trait]
pub trait RegionDetector: Send + Sync + 'static {
    /// Return the regions in `page`, in the order the model emits them.
    async fn detect_regions(
        &self,
        page: &RgbImage,
        config: &RecognitionConfig,
    ) -> Result<Vec<Region>>;
}

/// Reads text from cropped region images.
#[async_trait]
pub trait TextRecognizer: Send + Sync + 'static {
    /// Return one text per image, index-aligned with `images`. Callers must
    /// check the length.
    async fn recognize_texts(&self, images: &[RgbImage], model_id: &str) -> Result<Vec<String>>;
}

/// The pair of clients a worker talks to.
#[derive(Clone)]
pub struct RecognitionClients {
    pub detector: Arc<dyn RegionDetector>,
    pub recognizer: Arc<dyn TextRecognizer>,
}

impl RecognitionClients {
    /// Build clients for the configured backend.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        match settings.backend {
            BackendType::Http => {
                let detector_url = settings.detector_url.as_deref().ok_or_else(|| {
                    anyhow!("--detector-url (or OCR_DETECTOR_URL) is required with the http backend")
                })?;
                let recognizer_url = settings.recognizer_url.as_deref().ok_or_else(|| {
                    anyhow!("--recognizer-url (or OCR_RECOGNIZER_URL) is required with the http backend")
                })?;
                Ok(Self {
                    detector: Arc::new(http::HttpRegionDetector::new(detector_url)?),
                    recognizer: Arc::new(http::HttpTextRecognizer::new(recognizer_url)?),
                })
            }
            BackendType::Echo => Ok(Self::echo()),
        }
    }

    /// Offline clients with deterministic output.
    pub fn echo() -> Self {
        Self {
            detector: Arc::new(echo::EchoDetector::default()),
            recognizer: Arc::new(echo::EchoRecognizer),
        }
    }
}
