use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use crate::host::HostLimits;
use crate::utils::SyncError;

/// Pixel dimensions decoded from an image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    pub fn pixels(&self) -> i64 {
        i64::from(self.width) * i64::from(self.height)
    }
}

pub fn check_file_size(name: &str, size: i64, limits: &HostLimits) -> Result<(), SyncError> {
    if size > limits.max_file_size {
        return Err(SyncError::FileTooLarge {
            name: name.to_string(),
            size,
            limit: limits.max_file_size,
        });
    }
    Ok(())
}

/// Rejects raster images above the host's resolution limit, and raster
/// images whose header cannot be decoded. The format is sniffed from the
/// content; the file name plays no part. SVG and other text formats pass.
pub fn check_image_resolution(
    name: &str,
    data: &[u8],
    limits: &HostLimits,
) -> Result<(), SyncError> {
    let Some(format) = sniff_image_format(data) else {
        return Ok(());
    };
    let dimensions = image_dimensions(data, format).map_err(|e| {
        SyncError::InvalidInput(format!("unable to read the dimensions of image {name}: {e}"))
    })?;
    if dimensions.pixels() > limits.max_image_resolution {
        return Err(SyncError::ResolutionTooHigh {
            name: name.to_string(),
            pixels: dimensions.pixels(),
            limit: limits.max_image_resolution,
        });
    }
    Ok(())
}

/// Raster formats the host renders as images, detected by magic bytes.
pub fn sniff_image_format(data: &[u8]) -> Option<ImageFormat> {
    match image::guess_format(data).ok()? {
        format @ (ImageFormat::Png
        | ImageFormat::Jpeg
        | ImageFormat::Gif
        | ImageFormat::WebP
        | ImageFormat::Bmp
        | ImageFormat::Ico) => Some(format),
        _ => None,
    }
}

/// Reads width and height from the image header only.
pub fn image_dimensions(
    data: &[u8],
    format: ImageFormat,
) -> Result<ImageDimensions, image::ImageError> {
    let (width, height) = ImageReader::with_format(Cursor::new(data), format).into_dimensions()?;
    Ok(ImageDimensions { width, height })
}

/// File extension, with the leading dot, for sniffed image content.
pub fn image_extension(data: &[u8]) -> String {
    sniff_image_format(data)
        .and_then(|format| format.extensions_str().first())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}
