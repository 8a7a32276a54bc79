//! Recognizing a single page or region.

use std::{future::Future, sync::Arc};

use super::Orchestrator;
use crate::{
    async_utils::{io::remove_file_if_exists, spawn_blocking_propagating_panics},
    config::RecognitionConfig,
    error::{PipelineError, Service},
    geometry::{Region, crop_regions, drop_degenerate, merge_regions},
    image_codec::load_page,
    jobs::{JobId, JobStatus},
    prelude::*,
    recognition::Detection,
    store::{JobQueueStore, Progress},
};

/// Publishes region-level progress for the page a job step is working on.
pub(crate) struct ProgressReporter<'a> {
    pub store: &'a dyn JobQueueStore,
    pub job_id: JobId,
    pub status: JobStatus,
}

impl ProgressReporter<'_> {
    async fn regions(&self, done: usize, total: usize) -> Result<(), PipelineError> {
        self.store
            .set_progress(self.job_id, &Progress::regions(self.status, done, total))
            .await
            .map_err(PipelineError::storage)
    }
}

/// Detections for one page.
#[derive(Debug)]
pub struct RecognizedPage {
    pub detections: Vec<Detection>,
    /// Were regions merged into lines before recognition?
    pub merged: bool,
}

impl Orchestrator {
    /// Run a recognition service call with our timeout, classifying any
    /// failure.
    async fn call_service<T>(
        &self,
        service: Service,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T, PipelineError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PipelineError::service(service, err)),
            Err(_elapsed) => Err(PipelineError::Timeout {
                service,
                seconds: self.call_timeout.as_secs(),
            }),
        }
    }

    /// Crop `regions` out of `image` on a blocking thread, then recognize
    /// them. Returns one text per region.
    async fn crop_and_recognize(
        &self,
        image: Arc<image::RgbImage>,
        regions: &[Region],
        recognizer: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let owned_regions = regions.to_vec();
        let options = self.crop_options.clone();
        let crops = spawn_blocking_propagating_panics(move || {
            crop_regions(&image, &owned_regions, &options)
        })
        .await;
        let texts = self
            .call_service(
                Service::Recognizer,
                self.clients.recognizer.recognize_texts(&crops, recognizer),
            )
            .await?;
        if texts.len() != regions.len() {
            return Err(PipelineError::Service {
                service: Service::Recognizer,
                message: format!(
                    "returned {} texts for {} regions",
                    texts.len(),
                    regions.len()
                ),
            });
        }
        Ok(texts)
    }

    /// Detect, crop and recognize every region on one page.
    #[instrument(level = "debug", skip_all, fields(page = %page_ref.display()))]
    pub(crate) async fn recognize_page(
        &self,
        page_ref: &Path,
        config: &RecognitionConfig,
        progress: Option<&ProgressReporter<'_>>,
    ) -> Result<RecognizedPage, PipelineError> {
        let image = Arc::new(load_page(page_ref).await.map_err(PipelineError::storage)?);

        let regions = self
            .call_service(
                Service::Detector,
                self.clients.detector.detect_regions(&image, config),
            )
            .await?;
        for region in &regions {
            region.check_bounds()?;
        }
        let mut regions = drop_degenerate(
            regions,
            self.crop_options.min_width,
            self.crop_options.min_height,
        );
        if config.merge_regions {
            let before = regions.len();
            regions = merge_regions(&regions);
            debug!(before, after = regions.len(), "Merged regions into lines");
        }

        let total = regions.len();
        if let Some(progress) = progress {
            progress.regions(0, total).await?;
        }
        let texts = self
            .crop_and_recognize(image, &regions, &config.recognizer)
            .await?;
        if let Some(progress) = progress {
            progress.regions(total, total).await?;
        }

        Ok(RecognizedPage {
            detections: Detection::zip(regions, texts),
            merged: config.merge_regions,
        })
    }

    /// Recognize one region of a previously processed page, such as a box a
    /// user has corrected.
    ///
    /// This touches no job or store state, so it's safe to repeat.
    #[instrument(level = "debug", skip_all, fields(image = %image_ref.display(), recognizer = %recognizer))]
    pub async fn process_single_region(
        &self,
        image_ref: &Path,
        region: &Region,
        recognizer: &str,
    ) -> Result<String, PipelineError> {
        region.check_bounds()?;
        if !region.is_at_least(self.crop_options.min_width, self.crop_options.min_height) {
            return Err(PipelineError::Validation(format!(
                "region is too small to recognize: {region:?}"
            )));
        }
        let image = Arc::new(load_page(image_ref).await.map_err(PipelineError::storage)?);
        let mut texts = self
            .crop_and_recognize(image, std::slice::from_ref(region), recognizer)
            .await?;
        Ok(texts.pop().unwrap_or_default())
    }

    /// Recognize a whole page outside of any job, for the service API. The
    /// page image is deleted afterwards, whatever happens.
    #[instrument(level = "debug", skip_all, fields(image = %image_ref.display()))]
    pub async fn process_service_page(
        &self,
        image_ref: &Path,
        config: &RecognitionConfig,
    ) -> Result<Vec<Detection>, PipelineError> {
        let result = self.recognize_page(image_ref, config, None).await;
        if let Err(err) = remove_file_if_exists(image_ref).await {
            warn!("Failed to release service page: {err:#}");
        }
        Ok(result?.detections)
    }
}
