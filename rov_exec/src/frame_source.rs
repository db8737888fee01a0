//! # Frame Source
//!
//! Provides the images sent to vision workers, already encoded as base64 JPEG.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::path::PathBuf;

use image::{DynamicImage, ImageOutputFormat};
use log::debug;
use serde::Deserialize;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Something that can capture a frame on demand.
pub trait FrameSource {
    /// Capture a frame and return it as a base64 encoded JPEG.
    fn capture_encoded(&mut self) -> Result<String, FrameSourceError>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Result<String, FrameSourceError>,
{
    fn capture_encoded(&mut self) -> Result<String, FrameSourceError> {
        self()
    }
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FrameParams {
    /// Image file kept up to date with the latest camera frame
    pub image_path: PathBuf,

    /// JPEG quality between 1 and 100, where 100 is best
    pub jpeg_quality: u8,
}

/// Reads the latest frame from an image file written by the camera process.
pub struct FileFrameSource {
    params: FrameParams,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameSourceError {
    #[error("Could not load the frame {0:?}: {1}")]
    LoadError(PathBuf, image::ImageError),

    #[error("Could not encode the frame: {0}")]
    EncodeError(image::ImageError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl FileFrameSource {
    pub fn new(params: FrameParams) -> Self {
        Self { params }
    }
}

impl FrameSource for FileFrameSource {
    fn capture_encoded(&mut self) -> Result<String, FrameSourceError> {
        let image = image::open(&self.params.image_path)
            .map_err(|e| FrameSourceError::LoadError(self.params.image_path.clone(), e))?;

        let encoded = encode_jpeg_base64(&image, self.params.jpeg_quality)?;
        debug!(
            "Captured frame from {:?} ({} base64 bytes)",
            self.params.image_path,
            encoded.len()
        );

        Ok(encoded)
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Encode an image as JPEG with the given quality, then as base64.
pub fn encode_jpeg_base64(image: &DynamicImage, quality: u8) -> Result<String, FrameSourceError> {
    let mut data = Vec::<u8>::new();

    image
        .write_to(&mut data, ImageOutputFormat::Jpeg(quality.max(1).min(100)))
        .map_err(FrameSourceError::EncodeError)?;

    Ok(base64::encode(&data))
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
