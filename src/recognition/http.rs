//! HTTP clients for the recognition services.

use image::RgbImage;
use keen_retry::{ExponentialJitter, RetryResult};
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::{RegionDetector, TextRecognizer};
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    config::RecognitionConfig,
    geometry::Region,
    image_codec::png_base64,
    prelude::*,
    retry::{
        IsKnownTransient, into_logged_result, retry_result_fatal, retry_result_ok,
        retry_result_transient, try_fatal, try_potentially_transient,
    },
};

/// Build an endpoint URL from a service base URL.
fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

fn build_client() -> Result<Client> {
    Client::builder()
        .build()
        .context("failed to build HTTP client")
}

/// POST `body` as JSON and parse the JSON response, retrying transient
/// failures with exponential backoff.
async fn post_json<Req, Resp>(client: &Client, url: &str, body: &Req) -> Result<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 100..=5_000,
        re_attempts: 3,
        jitter_ratio: 0.2,
    };
    let result = post_json_once(client, url, body)
        .await
        .retry_with_async(|_| async { post_json_once(client, url, body).await })
        .with_exponential_jitter(|| jitter)
        .await;
    into_logged_result(url, result)
}

/// A single attempt at [`post_json`].
async fn post_json_once<Req, Resp>(
    client: &Client,
    url: &str,
    body: &Req,
) -> RetryResult<(), (), Resp, anyhow::Error>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let response = try_potentially_transient!(client.post(url).json(body).send().await);
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let err = anyhow!("{url} returned {status}: {text}");
        return if status.is_known_transient() {
            debug!("Potentially transient error: {:?}", err);
            retry_result_transient(err)
        } else {
            retry_result_fatal(err)
        };
    }
    let parsed = try_fatal!(
        response
            .json::<Resp>()
            .await
            .with_context(|| format!("failed to parse response from {url}"))
    );
    retry_result_ok(parsed)
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    image: String,
    model_id: &'a str,
    language: &'a str,
    allow_padding: bool,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    regions: Vec<Region>,
}

/// Region detector reached over HTTP.
pub struct HttpRegionDetector {
    client: Client,
    url: String,
}

impl HttpRegionDetector {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            url: endpoint(base_url, "get-bboxes-for-image/"),
        })
    }
}

#[async_trait]
impl RegionDetector for HttpRegionDetector {
    #[instrument(level = "debug", skip_all, fields(model = %config.detector))]
    async fn detect_regions(
        &self,
        page: &RgbImage,
        config: &RecognitionConfig,
    ) -> Result<Vec<Region>> {
        let page = page.clone();
        let image = spawn_blocking_propagating_panics(move || png_base64(&page)).await?;
        let request = DetectRequest {
            image,
            model_id: &config.detector,
            language: &config.language,
            allow_padding: config.allow_padding,
        };
        let response: DetectResponse = post_json(&self.client, &self.url, &request).await?;
        debug!(count = response.regions.len(), "Detected regions");
        Ok(response
            .regions
            .into_iter()
            .map(|mut region| {
                region.language.get_or_insert_with(|| config.language.clone());
                region
            })
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    images: Vec<String>,
    model_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    texts: Vec<String>,
}

/// Text recognizer reached over HTTP.
pub struct HttpTextRecognizer {
    client: Client,
    url: String,
}

impl HttpTextRecognizer {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            url: endpoint(base_url, "get-texts-for-images/"),
        })
    }
}

#[async_trait]
impl TextRecognizer for HttpTextRecognizer {
    #[instrument(level = "debug", skip_all, fields(model = %model_id, count = images.len()))]
    async fn recognize_texts(&self, images: &[RgbImage], model_id: &str) -> Result<Vec<String>> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let owned = images.to_vec();
        let images = spawn_blocking_propagating_panics(move || {
            owned.iter().map(png_base64).collect::<Result<Vec<_>>>()
        })
        .await?;
        let request = RecognizeRequest { images, model_id };
        let response: RecognizeResponse = post_json(&self.client, &self.url, &request).await?;
        Ok(response.texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_cleanly() {
        assert_eq!(
            endpoint("http://ocr:8000/", "get-texts-for-images/"),
            "http://ocr:8000/get-texts-for-images/"
        );
        assert_eq!(
            endpoint("http://ocr:8000", "get-bboxes-for-image/"),
            "http://ocr:8000/get-bboxes-for-image/"
        );
    }

    #[test]
    fn test_detect_request_wire_format() {
        let request = DetectRequest {
            image: "aGk=".to_owned(),
            model_id: "layout-v2",
            language: "hi",
            allow_padding: true,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "image": "aGk=",
                "model_id": "layout-v2",
                "language": "hi",
                "allow_padding": true,
            })
        );
    }

    #[test]
    fn test_detect_response_without_rotation() {
        let response: DetectResponse = serde_json::from_str(
            r#"{"regions": [{"x_min": 0, "y_min": 0, "x_max": 5, "y_max": 5, "line_index": 0, "word_index": 0}]}"#,
        )
        .unwrap();
        assert_eq!(response.regions[0].rotation, 0.0);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_the_network() {
        // Nothing listens on port 9 here, so any request would fail.
        let recognizer = HttpTextRecognizer::new("http://127.0.0.1:9").unwrap();
        let texts = recognizer.recognize_texts(&[], "any").await.unwrap();
        assert!(texts.is_empty());
    }
}
