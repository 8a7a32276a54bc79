//! Offline recognition backend.
//!
//! Nothing here looks at text. The detector slices the page into horizontal
//! bands, and the recognizer describes each crop by its size and a checksum
//! of its pixels. That's enough to exercise the whole pipeline without any
//! services running, and the output only changes when the input does.

use image::RgbImage;

use super::{RegionDetector, TextRecognizer};
use crate::{config::RecognitionConfig, geometry::Region, prelude::*};

/// Reports one full-width region per horizontal band of the page.
pub struct EchoDetector {
    band_height: u32,
}

impl Default for EchoDetector {
    fn default() -> Self {
        Self { band_height: 32 }
    }
}

#[async_trait]
impl RegionDetector for EchoDetector {
    async fn detect_regions(
        &self,
        page: &RgbImage,
        config: &RecognitionConfig,
    ) -> Result<Vec<Region>> {
        let (width, height) = page.dimensions();
        let width = i32::try_from(width).context("page too wide")?;
        let height = i32::try_from(height).context("page too tall")?;
        let band = i32::try_from(self.band_height.max(1)).context("band too tall")?;
        let regions = (0..height)
            .step_by(band as usize)
            .enumerate()
            .map(|(line, y)| {
                let mut region = Region::new(0, y, width, (y + band).min(height));
                region.line_index = Some(line);
                region.word_index = Some(0);
                region.language = Some(config.language.clone());
                region
            })
            .collect();
        Ok(regions)
    }
}

/// Describes each crop as `WIDTHxHEIGHT#CHECKSUM`.
pub struct EchoRecognizer;

/// Render the text [`EchoRecognizer`] returns for `image`.
pub fn describe(image: &RgbImage) -> String {
    let checksum = image
        .as_raw()
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(u16::from(byte)));
    format!("{}x{}#{:04x}", image.width(), image.height(), checksum)
}

#[async_trait]
impl TextRecognizer for EchoRecognizer {
    async fn recognize_texts(&self, images: &[RgbImage], _model_id: &str) -> Result<Vec<String>> {
        Ok(images.iter().map(describe).collect())
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[tokio::test]
    async fn test_bands_cover_the_page() {
        let page = RgbImage::new(50, 70);
        let regions = EchoDetector::default()
            .detect_regions(&page, &RecognitionConfig::default())
            .await
            .unwrap();
        let spans = regions.iter().map(|r| (r.y_min, r.y_max)).collect::<Vec<_>>();
        assert_eq!(spans, vec![(0, 32), (32, 64), (64, 70)]);
        assert!(regions.iter().all(|r| r.width() == 50));
        assert_eq!(regions[2].line_index, Some(2));
        assert_eq!(regions[0].language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_recognizer_is_deterministic() {
        let image = RgbImage::from_pixel(3, 2, Rgb([1, 2, 3]));
        let texts = EchoRecognizer
            .recognize_texts(&[image.clone(), image], "m")
            .await
            .unwrap();
        assert_eq!(texts, vec!["3x2#0024", "3x2#0024"]);
    }
}
