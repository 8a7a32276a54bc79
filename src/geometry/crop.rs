//! Rotation-aware cropping.
//!
//! Detectors report each text region as an axis-aligned box on the original
//! page plus the angle that would make its text horizontal. To cut a region
//! out, we pad the page so that no rotation can clip it, rotate the padded
//! page about its center by the region's angle, carry the region's anchor
//! point through the same rotation, and cut an upright box of the region's
//! original size at the new anchor.
//!
//! Unrotated regions go through exactly the same steps. The rotation matrix
//! is the identity, so the crop is pixel-identical to a plain crop.

use std::collections::HashMap;

use image::{Rgb, RgbImage, imageops};
use imageproc::geometric_transformations::{Interpolation, Projection, warp};

use super::region::Region;
use crate::prelude::*;

/// Which point of a region is carried through the rotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Pivot {
    /// Rotate the top-left corner and hang the box below and right of it.
    #[default]
    TopLeft,
    /// Rotate the center and grow the box around it.
    Center,
}

/// Options for [`crop_regions`].
#[derive(Clone, Debug)]
pub struct CropOptions {
    /// Regions narrower than this produce an empty crop.
    pub min_width: i32,
    /// Regions shorter than this produce an empty crop.
    pub min_height: i32,
    /// Anchor point used to place the rotated box.
    pub pivot: Pivot,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            min_width: 1,
            min_height: 1,
            pivot: Pivot::default(),
        }
    }
}

/// Border added on each side of an image so it can rotate freely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Padding {
    pub horizontal: u32,
    pub vertical: u32,
}

impl Padding {
    /// The smallest symmetric padding that makes both sides at least as long
    /// as the image diagonal.
    pub fn for_rotation(width: u32, height: u32) -> Self {
        let (w, h) = (f64::from(width), f64::from(height));
        let diagonal = (w * w + h * h).sqrt().ceil();
        Self {
            horizontal: ((diagonal - w) / 2.0).ceil().max(0.0) as u32,
            vertical: ((diagonal - h) / 2.0).ceil().max(0.0) as u32,
        }
    }

    /// Surround `image` with black pixels.
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let mut padded = RgbImage::new(
            width + 2 * self.horizontal,
            height + 2 * self.vertical,
        );
        imageops::replace(
            &mut padded,
            image,
            i64::from(self.horizontal),
            i64::from(self.vertical),
        );
        padded
    }
}

/// A 2x3 affine rotation about a point, laid out like OpenCV's
/// `getRotationMatrix2D` with unit scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RotationMatrix {
    m: [[f64; 3]; 2],
}

impl RotationMatrix {
    /// Rotate by `degrees` (counter-clockwise on screen) about the center of
    /// an image of the given size. The center uses integer division.
    pub fn about_center(width: u32, height: u32, degrees: f32) -> Self {
        let cx = f64::from(width / 2);
        let cy = f64::from(height / 2);
        let radians = f64::from(degrees).to_radians();
        let (alpha, beta) = (radians.cos(), radians.sin());
        Self {
            m: [
                [alpha, beta, (1.0 - alpha) * cx - beta * cy],
                [-beta, alpha, beta * cx + (1.0 - alpha) * cy],
            ],
        }
    }

    /// Map a point through the matrix.
    pub fn transform(&self, x: f64, y: f64) -> (f64, f64) {
        let [r0, r1] = self.m;
        (
            r0[0] * x + r0[1] * y + r0[2],
            r1[0] * x + r1[1] * y + r1[2],
        )
    }

    fn to_projection(self) -> Option<Projection> {
        let [r0, r1] = self.m;
        Projection::from_matrix([
            r0[0] as f32,
            r0[1] as f32,
            r0[2] as f32,
            r1[0] as f32,
            r1[1] as f32,
            r1[2] as f32,
            0.0,
            0.0,
            1.0,
        ])
    }

    /// Rotate an entire image, keeping its size. Pixels rotated in from
    /// outside are black.
    pub fn warp(&self, image: &RgbImage) -> RgbImage {
        match self.to_projection() {
            Some(projection) => {
                warp(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]))
            }
            // Rotations are always invertible, but don't panic on NaN input.
            None => {
                warn!(matrix = ?self.m, "Rotation matrix is not invertible");
                RgbImage::new(image.width(), image.height())
            }
        }
    }
}

/// An integer pixel rectangle, possibly reaching outside an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PixelBox {
    x_min: i64,
    y_min: i64,
    x_max: i64,
    y_max: i64,
}

impl PixelBox {
    /// Where `region` lands after rotating the padded page with `matrix`.
    ///
    /// `region` is in original-page coordinates; `padding` shifts it into
    /// the padded page first.
    fn after_rotation(
        region: &Region,
        padding: Padding,
        matrix: &RotationMatrix,
        pivot: Pivot,
    ) -> Self {
        let dx = f64::from(padding.horizontal);
        let dy = f64::from(padding.vertical);
        let width = region.width() as f64;
        let height = region.height() as f64;
        match pivot {
            Pivot::TopLeft => {
                let (x, y) = matrix.transform(
                    f64::from(region.x_min) + dx,
                    f64::from(region.y_min) + dy,
                );
                Self {
                    x_min: x.trunc() as i64,
                    y_min: y.trunc() as i64,
                    x_max: (x + width).trunc() as i64,
                    y_max: (y + height).trunc() as i64,
                }
            }
            Pivot::Center => {
                let (x, y) = matrix.transform(
                    (f64::from(region.x_min) + f64::from(region.x_max)) / 2.0 + dx,
                    (f64::from(region.y_min) + f64::from(region.y_max)) / 2.0 + dy,
                );
                Self {
                    x_min: (x - width / 2.0).trunc() as i64,
                    y_min: (y - height / 2.0).trunc() as i64,
                    x_max: (x + width / 2.0).ceil() as i64,
                    y_max: (y + height / 2.0).ceil() as i64,
                }
            }
        }
    }

    /// Cut this box out of `image`, clipped to the image bounds. A box that
    /// misses the image entirely gives a zero-size image.
    fn crop_from(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let x0 = self.x_min.clamp(0, i64::from(width));
        let y0 = self.y_min.clamp(0, i64::from(height));
        let x1 = self.x_max.clamp(0, i64::from(width));
        let y1 = self.y_max.clamp(0, i64::from(height));
        if x1 <= x0 || y1 <= y0 {
            return RgbImage::new(0, 0);
        }
        imageops::crop_imm(
            image,
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        )
        .to_image()
    }
}

/// Key for caching rotated pages. `-0.0` and `0.0` share an entry.
fn angle_key(degrees: f32) -> u32 {
    if degrees == 0.0 {
        0.0f32.to_bits()
    } else {
        degrees.to_bits()
    }
}

/// Crop every region out of `image`, de-rotating each one.
///
/// Returns exactly one image per input region, in input order. Regions
/// smaller than the minimum size in `options`, and regions that land
/// entirely outside the rotated page, yield zero-size images; callers that
/// don't want those should run [`super::region::drop_degenerate`] first.
///
/// The padded page is rotated once per distinct angle, not once per region.
#[instrument(level = "debug", skip_all, fields(regions = regions.len()))]
pub fn crop_regions(
    image: &RgbImage,
    regions: &[Region],
    options: &CropOptions,
) -> Vec<RgbImage> {
    let (width, height) = image.dimensions();
    let padding = Padding::for_rotation(width, height);
    let padded = padding.apply(image);
    let (padded_width, padded_height) = padded.dimensions();

    let mut rotated_pages: HashMap<u32, (RotationMatrix, RgbImage)> = HashMap::new();
    regions
        .iter()
        .map(|region| {
            if !region.is_at_least(options.min_width, options.min_height) {
                return RgbImage::new(0, 0);
            }
            let (matrix, rotated) = rotated_pages
                .entry(angle_key(region.rotation))
                .or_insert_with(|| {
                    let matrix = RotationMatrix::about_center(
                        padded_width,
                        padded_height,
                        region.rotation,
                    );
                    trace!(angle = region.rotation, "Rotating padded page");
                    (matrix, matrix.warp(&padded))
                });
            PixelBox::after_rotation(region, padding, matrix, options.pivot)
                .crop_from(rotated)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A page with a distinct color at every pixel.
    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_padding_reaches_diagonal() {
        // 3-4-5 triangle: diagonal is exactly 5.
        let padding = Padding::for_rotation(40, 30);
        assert_eq!(padding, Padding { horizontal: 5, vertical: 10 });

        let padding = Padding::for_rotation(10, 10);
        // sqrt(200) = 14.14.. -> 15, (15 - 10) / 2 = 2.5 -> 3
        assert_eq!(padding, Padding { horizontal: 3, vertical: 3 });
        let padded = padding.apply(&gradient(10, 10));
        assert_eq!(padded.dimensions(), (16, 16));
        assert_eq!(padded.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(padded.get_pixel(3, 3), gradient(10, 10).get_pixel(0, 0));
    }

    #[test]
    fn test_zero_rotation_matrix_is_identity() {
        let matrix = RotationMatrix::about_center(101, 57, 0.0);
        assert_eq!(matrix.transform(12.0, 34.0), (12.0, 34.0));
    }

    #[test]
    fn test_quarter_turn_about_center() {
        let matrix = RotationMatrix::about_center(100, 100, 90.0);
        let (x, y) = matrix.transform(60.0, 50.0);
        assert!((x - 50.0).abs() < 1e-9, "x = {x}");
        assert!((y - 40.0).abs() < 1e-9, "y = {y}");
    }

    #[test]
    fn test_unrotated_crop_matches_direct_crop() {
        let page = gradient(64, 48);
        let regions = vec![
            Region::new(0, 0, 10, 5),
            Region::new(17, 9, 40, 30),
            Region::new(50, 40, 64, 48),
        ];
        let crops = crop_regions(&page, &regions, &CropOptions::default());
        assert_eq!(crops.len(), regions.len());
        for (region, crop) in regions.iter().zip(&crops) {
            let expected = imageops::crop_imm(
                &page,
                region.x_min as u32,
                region.y_min as u32,
                region.width() as u32,
                region.height() as u32,
            )
            .to_image();
            assert_eq!(crop.dimensions(), expected.dimensions());
            assert_eq!(crop.as_raw(), expected.as_raw());
        }
    }

    #[test]
    fn test_center_pivot_unrotated_matches_direct_crop() {
        let page = gradient(32, 32);
        let region = Region::new(4, 6, 14, 12);
        let options = CropOptions {
            pivot: Pivot::Center,
            ..CropOptions::default()
        };
        let crops = crop_regions(&page, &[region.clone()], &options);
        let expected = imageops::crop_imm(&page, 4, 6, 10, 6).to_image();
        assert_eq!(crops[0].as_raw(), expected.as_raw());
    }

    #[test]
    fn test_rotated_crop_keeps_region_size() {
        let page = gradient(80, 60);
        let region = Region::new(20, 20, 50, 30).with_rotation(15.0);
        let crops = crop_regions(&page, &[region], &CropOptions::default());
        assert_eq!(crops[0].dimensions(), (30, 10));
    }

    #[test]
    fn test_outside_and_degenerate_regions_give_empty_crops() {
        let page = gradient(20, 20);
        let regions = vec![
            Region::new(-500, -500, -400, -450),
            Region::new(5, 5, 5, 10),
            Region::new(2, 2, 6, 6),
        ];
        let crops = crop_regions(&page, &regions, &CropOptions::default());
        assert_eq!(crops.len(), 3);
        assert_eq!(crops[0].dimensions(), (0, 0));
        assert_eq!(crops[1].dimensions(), (0, 0));
        assert_eq!(crops[2].dimensions(), (4, 4));
    }

    #[test]
    fn test_partially_outside_region_is_clipped() {
        let page = gradient(20, 20);
        // The padded page is 30x30 with a 5px border, so a box hanging off
        // the page by 15px gets clipped at the padded edge.
        let regions = vec![Region::new(15, 0, 35, 4)];
        let crops = crop_regions(&page, &regions, &CropOptions::default());
        assert_eq!(crops[0].dimensions(), (10, 4));
    }
}
