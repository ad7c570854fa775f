//! Grayscale conversion and resizing of frames.
//!
//! Frames are borrowed as `image::ImageBuffer` views and handed to
//! `image::imageops`; results are moved back into frame types without
//! copying.

use crate::types::{ColorFrame, GrayFrame, Resolution};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb};
use thiserror::Error;

/// Interpolation used for every resize (bilinear).
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// Errors from pixel operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageOpError {
    #[error("Cannot process an empty frame ({0})")]
    EmptyFrame(Resolution),

    #[error("Cannot resize to an empty resolution ({0})")]
    EmptyTarget(Resolution),

    #[error("Frame buffer does not match its resolution ({0})")]
    BufferMismatch(Resolution),
}

type RgbView<'a> = ImageBuffer<Rgb<u8>, &'a [u8]>;
type LumaView<'a> = ImageBuffer<Luma<u8>, &'a [u8]>;

fn rgb_view(frame: &ColorFrame) -> Result<RgbView<'_>, ImageOpError> {
    ImageBuffer::from_raw(frame.width(), frame.height(), frame.data())
        .ok_or(ImageOpError::BufferMismatch(frame.resolution()))
}

fn luma_view(frame: &GrayFrame) -> Result<LumaView<'_>, ImageOpError> {
    ImageBuffer::from_raw(frame.width(), frame.height(), frame.data())
        .ok_or(ImageOpError::BufferMismatch(frame.resolution()))
}

/// Converts a color frame to grayscale using the `image` crate's luma weights.
pub fn to_gray(frame: &ColorFrame) -> Result<GrayFrame, ImageOpError> {
    let resolution = frame.resolution();
    if resolution.is_empty() {
        return Err(ImageOpError::EmptyFrame(resolution));
    }
    let gray = imageops::grayscale(&rgb_view(frame)?);
    GrayFrame::from_raw(resolution, gray.into_raw()).ok_or(ImageOpError::BufferMismatch(resolution))
}

/// Resizes a grayscale frame.
///
/// Returns a copy when the frame already has the target resolution.
pub fn resize_gray(frame: &GrayFrame, target: Resolution) -> Result<GrayFrame, ImageOpError> {
    check_sizes(frame.resolution(), target)?;
    if frame.resolution() == target {
        return Ok(frame.clone());
    }
    let resized = imageops::resize(&luma_view(frame)?, target.width, target.height, RESIZE_FILTER);
    GrayFrame::from_raw(target, resized.into_raw()).ok_or(ImageOpError::BufferMismatch(target))
}

/// Resizes a color frame.
///
/// Returns a copy when the frame already has the target resolution.
pub fn resize_color(frame: &ColorFrame, target: Resolution) -> Result<ColorFrame, ImageOpError> {
    check_sizes(frame.resolution(), target)?;
    if frame.resolution() == target {
        return Ok(frame.clone());
    }
    let resized = imageops::resize(&rgb_view(frame)?, target.width, target.height, RESIZE_FILTER);
    ColorFrame::from_raw(target, resized.into_raw()).ok_or(ImageOpError::BufferMismatch(target))
}

fn check_sizes(source: Resolution, target: Resolution) -> Result<(), ImageOpError> {
    if source.is_empty() {
        return Err(ImageOpError::EmptyFrame(source));
    }
    if target.is_empty() {
        return Err(ImageOpError::EmptyTarget(target));
    }
    Ok(())
}
