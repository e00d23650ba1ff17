//! Payload validation before anything is stored.

use std::fmt;

use image::{GenericImageView, ImageFormat};
use tracing::debug;

use crate::error::{ContentInvalidReason, Result, StoreError};

/// Per-kind requirements on accepted content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentConstraints {
    pub require_square: bool,
    pub max_size: Option<usize>,
}

impl ContentConstraints {
    /// Square images of at most `max_size` bytes.
    pub fn square(max_size: usize) -> Self {
        Self {
            require_square: true,
            max_size: Some(max_size),
        }
    }
}

/// What a validator learned about an accepted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedContent {
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

/// Checks payloads and sniffs their format.
///
/// Implementations are synchronous and may be CPU heavy; callers run them on a
/// blocking thread.
pub trait ContentValidator: fmt::Debug + Send + Sync {
    /// Accept `data` or explain why not. A `declared_type` that disagrees with the
    /// detected format is rejected.
    fn validate(
        &self,
        data: &[u8],
        declared_type: Option<&str>,
        constraints: &ContentConstraints,
    ) -> Result<ValidatedContent>;

    /// MIME type of `data`, if recognised.
    fn detect_format(&self, data: &[u8]) -> Option<String>;
}

/// Validator for raster images.
#[derive(Debug, Clone)]
pub struct ImageValidator {
    formats: Vec<ImageFormat>,
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self {
            formats: vec![
                ImageFormat::Png,
                ImageFormat::Jpeg,
                ImageFormat::Gif,
                ImageFormat::WebP,
            ],
        }
    }
}

impl ImageValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict accepted formats.
    pub fn with_formats(formats: impl IntoIterator<Item = ImageFormat>) -> Self {
        Self {
            formats: formats.into_iter().collect(),
        }
    }

    fn guess(&self, data: &[u8]) -> Option<ImageFormat> {
        image::guess_format(data)
            .ok()
            .filter(|format| self.formats.contains(format))
    }
}

impl ContentValidator for ImageValidator {
    fn validate(
        &self,
        data: &[u8],
        declared_type: Option<&str>,
        constraints: &ContentConstraints,
    ) -> Result<ValidatedContent> {
        if data.is_empty() {
            return Err(StoreError::InvalidArgument(
                "content must not be empty".to_string(),
            ));
        }

        if let Some(limit) = constraints.max_size {
            if data.len() > limit {
                return Err(ContentInvalidReason::TooBig {
                    size: data.len(),
                    limit,
                }
                .into());
            }
        }

        let format = self.guess(data).ok_or(ContentInvalidReason::CantDecode)?;
        let detected = format.to_mime_type();

        if let Some(declared) = declared_type {
            let declared_format = ImageFormat::from_mime_type(declared);
            if declared_format != Some(format) {
                return Err(ContentInvalidReason::UnmatchedFormat {
                    declared: declared.to_string(),
                    detected: detected.to_string(),
                }
                .into());
            }
        }

        let image = image::load_from_memory_with_format(data, format).map_err(|e| {
            debug!(error = %e, "image failed to decode");
            ContentInvalidReason::CantDecode
        })?;
        let (width, height) = image.dimensions();

        if width == 0 || height == 0 || (constraints.require_square && width != height) {
            return Err(ContentInvalidReason::BadSize { width, height }.into());
        }

        Ok(ValidatedContent {
            content_type: detected.to_string(),
            width,
            height,
        })
    }

    fn detect_format(&self, data: &[u8]) -> Option<String> {
        self.guess(data).map(|format| format.to_mime_type().to_string())
    }
}
