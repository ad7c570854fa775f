//! Video sinks for rendered event frames.

use crate::types::{ColorFrame, Resolution};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while writing rendered frames.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot encode frame {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Frame resolution {actual} does not match video resolution {expected}")]
    ResolutionMismatch {
        expected: Resolution,
        actual: Resolution,
    },
}

/// An ordered consumer of rendered frames.
///
/// The first frame written fixes the video resolution.
pub trait VideoSink {
    /// Appends one frame.
    fn write_frame(&mut self, frame: &ColorFrame) -> Result<(), SinkError>;

    /// Flushes and closes the video.
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Number of frames written so far.
    fn frames_written(&self) -> u64;
}

/// Writes frames as numbered PNG files (`frame_000000.png`, ...) into a
/// directory.
#[derive(Debug)]
pub struct ImageSequenceSink {
    dir: PathBuf,
    prefix: String,
    resolution: Option<Resolution>,
    written: u64,
}

impl ImageSequenceSink {
    /// Creates the output directory (and parents) if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: "frame".to_string(),
            resolution: None,
            written: 0,
        })
    }

    /// Sets the file name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the frame with the given index.
    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}_{:06}.png", self.prefix, index))
    }
}

fn check_resolution(fixed: &mut Option<Resolution>, frame: &ColorFrame) -> Result<(), SinkError> {
    match *fixed {
        Some(expected) if expected != frame.resolution() => Err(SinkError::ResolutionMismatch {
            expected,
            actual: frame.resolution(),
        }),
        Some(_) => Ok(()),
        None => {
            *fixed = Some(frame.resolution());
            Ok(())
        }
    }
}

impl VideoSink for ImageSequenceSink {
    fn write_frame(&mut self, frame: &ColorFrame) -> Result<(), SinkError> {
        check_resolution(&mut self.resolution, frame)?;

        let path = self.frame_path(self.written);
        let encode_err = |source| SinkError::Encode {
            path: path.clone(),
            source,
        };
        let image = image::RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
            .ok_or_else(|| {
                encode_err(image::ImageError::Parameter(
                    image::error::ParameterError::from_kind(
                        image::error::ParameterErrorKind::DimensionMismatch,
                    ),
                ))
            })?;
        image.save(&path).map_err(encode_err)?;

        self.written += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }
}

/// Keeps rendered frames in memory.
#[derive(Debug, Default)]
pub struct FrameCollector {
    resolution: Option<Resolution>,
    frames: Vec<ColorFrame>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected frames in write order.
    pub fn frames(&self) -> &[ColorFrame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<ColorFrame> {
        self.frames
    }
}

impl VideoSink for FrameCollector {
    fn write_frame(&mut self, frame: &ColorFrame) -> Result<(), SinkError> {
        check_resolution(&mut self.resolution, frame)?;
        self.frames.push(frame.clone());
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames.len() as u64
    }
}
