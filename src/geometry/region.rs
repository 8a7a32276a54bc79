//! Text regions as reported by a region detector.

use crate::{error::PipelineError, prelude::*};

/// Largest coordinate magnitude we accept from a detector or a user. Real
/// pages are a few thousand pixels across.
pub const MAX_COORDINATE: i32 = 1 << 20;

/// An axis-aligned box on a page, plus the rotation needed to make the text
/// inside it horizontal.
///
/// Regions are never modified after they are produced. Merging builds new
/// ones.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Region {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,

    /// Rotation in degrees, counter-clockwise. Detectors may omit it.
    #[serde(default, alias = "rotation_degrees")]
    pub rotation: f32,

    /// Which text line the detector assigned this region to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_index: Option<usize>,

    /// Position of this region within its line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_index: Option<usize>,

    /// Language the detector was asked to look for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Region {
    /// Create an unrotated region with no provenance.
    pub fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
            rotation: 0.0,
            line_index: None,
            word_index: None,
            language: None,
        }
    }

    /// The same region, rotated by `degrees`.
    pub fn with_rotation(mut self, degrees: f32) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn width(&self) -> i64 {
        i64::from(self.x_max) - i64::from(self.x_min)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.y_max) - i64::from(self.y_min)
    }

    /// Is this region at least `min_width` by `min_height` pixels?
    pub fn is_at_least(&self, min_width: i32, min_height: i32) -> bool {
        self.width() >= i64::from(min_width) && self.height() >= i64::from(min_height)
    }

    /// Reject coordinates no page could have, and rotations that aren't
    /// numbers.
    pub fn check_bounds(&self) -> Result<(), PipelineError> {
        let coords = [self.x_min, self.y_min, self.x_max, self.y_max];
        if coords.iter().any(|c| c.unsigned_abs() > MAX_COORDINATE.unsigned_abs()) {
            return Err(PipelineError::Validation(format!(
                "region coordinates out of range: {coords:?}"
            )));
        }
        if !self.rotation.is_finite() {
            return Err(PipelineError::Validation(format!(
                "region rotation is not finite: {}",
                self.rotation
            )));
        }
        Ok(())
    }
}

/// Drop regions narrower or shorter than the given minimums, keeping order.
pub fn drop_degenerate(
    regions: Vec<Region>,
    min_width: i32,
    min_height: i32,
) -> Vec<Region> {
    let before = regions.len();
    let kept = regions
        .into_iter()
        .filter(|r| r.is_at_least(min_width, min_height))
        .collect::<Vec<_>>();
    if kept.len() < before {
        debug!(dropped = before - kept.len(), "Dropped degenerate regions");
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_rotation_defaults_to_zero() {
        let region: Region = serde_json::from_str(
            r#"{"x_min": 1, "y_min": 2, "x_max": 30, "y_max": 12, "line_index": 0, "word_index": 3}"#,
        )
        .unwrap();
        assert_eq!(region.rotation, 0.0);
        assert_eq!(region.line_index, Some(0));
        assert_eq!(region.word_index, Some(3));
        assert_eq!(region.width(), 29);
        assert_eq!(region.height(), 10);
    }

    #[test]
    fn test_huge_regions_are_measured_and_rejected() {
        let region = Region::new(-2_000_000_000, 0, 2_000_000_000, 10);
        assert_eq!(region.width(), 4_000_000_000);
        assert!(region.is_at_least(1, 1));
        assert_eq!(region.check_bounds().unwrap_err().kind(), "validation");

        let spinning = Region::new(0, 0, 10, 10).with_rotation(f32::NAN);
        assert!(spinning.check_bounds().is_err());
        assert!(Region::new(0, 0, MAX_COORDINATE, 10).check_bounds().is_ok());
    }

    #[test]
    fn test_drop_degenerate_keeps_order() {
        let regions = vec![
            Region::new(0, 0, 10, 10),
            Region::new(5, 5, 5, 20),
            Region::new(20, 0, 30, 0),
            Region::new(40, 0, 41, 1),
        ];
        let kept = drop_degenerate(regions, 1, 1);
        assert_eq!(kept, vec![Region::new(0, 0, 10, 10), Region::new(40, 0, 41, 1)]);
    }
}
