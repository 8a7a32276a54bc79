//! Loading page images and encoding crops for the wire.

use std::io::Cursor;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use image::{ImageFormat, RgbImage};

use crate::{async_utils::spawn_blocking_propagating_panics, prelude::*};

/// Encode an image as Base64 PNG, the format both recognition services
/// accept.
pub fn png_base64(image: &RgbImage) -> Result<String> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(BASE64_STANDARD.encode(buffer.into_inner()))
}

/// Decode a Base64 image of any supported format.
#[cfg(test)]
pub fn decode_base64(data: &str) -> Result<RgbImage> {
    let bytes = BASE64_STANDARD
        .decode(data)
        .context("invalid Base64 image data")?;
    let image = image::load_from_memory(&bytes).context("failed to decode image")?;
    Ok(image.to_rgb8())
}

/// Load a page image from disk as RGB, decoding on a blocking thread.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn load_page(path: &Path) -> Result<RgbImage> {
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || {
        let image = image::open(&path)
            .with_context(|| format!("failed to open page image {:?}", path))?;
        Ok(image.to_rgb8())
    })
    .await
}
