//! Page geometry: regions, rotation-aware cropping and line merging.
//!
//! Everything here is pure and synchronous. Callers on the async side should
//! run the image work on a blocking thread.

pub mod crop;
pub mod merge;
pub mod region;

pub use self::{
    crop::{CropOptions, crop_regions},
    merge::merge_regions,
    region::{Region, drop_degenerate},
};
