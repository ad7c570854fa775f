//! Frame sources.
//!
//! A [`FrameSource`] yields color frames in order. Two implementations are
//! provided: [`ImageSequenceSource`] reads a decoded video stored as a
//! directory of numbered still images (optionally paced and looped to stand
//! in for a live capture device), and [`SyntheticSource`] renders a moving
//! square for demos and tests.

use crate::imgproc::{self, ImageOpError};
use crate::types::{ColorFrame, Resolution, Rgb};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Frame file extensions recognized by [`ImageSequenceSource`].
pub const FRAME_EXTENSIONS: &[&str] = &["png", "bmp", "jpg", "jpeg"];

/// Frame rate assumed when a source does not know its own.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Errors produced by frame sources.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Cannot open frame directory {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No frame images (png, bmp, jpg) found in {0:?}")]
    NoFrames(PathBuf),

    #[error("Cannot decode frame {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid frame: {0}")]
    Image(#[from] ImageOpError),
}

/// An ordered producer of color frames.
pub trait FrameSource: Send {
    /// Returns the next frame.
    ///
    /// `Ok(None)` means no frame is available right now. For finite sources
    /// it marks the end of the stream; live callers treat it as a skipped
    /// iteration.
    fn next_frame(&mut self) -> Result<Option<ColorFrame>, SourceError>;

    /// Requests that subsequent frames are delivered at `resolution`.
    fn set_resolution(&mut self, resolution: Resolution);

    /// Resolution of the frames this source currently delivers.
    fn resolution(&self) -> Resolution;

    /// Nominal frame rate, if known.
    fn frame_rate(&self) -> Option<f64> {
        None
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<ColorFrame>, SourceError> {
        (**self).next_frame()
    }

    fn set_resolution(&mut self, resolution: Resolution) {
        (**self).set_resolution(resolution)
    }

    fn resolution(&self) -> Resolution {
        (**self).resolution()
    }

    fn frame_rate(&self) -> Option<f64> {
        (**self).frame_rate()
    }
}

/// Sleeps so that successive frames are at least one interval apart.
#[derive(Debug, Default)]
struct Pacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl Pacer {
    fn set_rate(&mut self, fps: Option<f64>) {
        self.interval = fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps));
    }

    fn wait(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Compares file names so that "frame2" sorts before "frame10".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let da = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let db = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let (na, ra) = a.split_at(da);
                let (nb, rb) = b.split_at(db);
                let na = trim_leading_zeros(na);
                let nb = trim_leading_zeros(nb);
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = ra;
                b = rb;
            }
            (Some(ca), Some(cb)) => {
                let ord = ca.to_ascii_lowercase().cmp(&cb.to_ascii_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_leading_zeros(digits: &[u8]) -> &[u8] {
    let zeros = digits.iter().take_while(|&&c| c == b'0').count();
    &digits[zeros.min(digits.len().saturating_sub(1))..]
}

/// Lists the frame images of `dir` in natural order.
pub fn list_frames<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, SourceError> {
    let dir = dir.as_ref();
    let open_err = |source| SourceError::Open {
        path: dir.to_path_buf(),
        source,
    };

    let mut frames = Vec::new();
    for entry in fs::read_dir(dir).map_err(open_err)? {
        let path = entry.map_err(open_err)?.path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| FRAME_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame && path.is_file() {
            frames.push(path);
        }
    }

    frames.sort_by(|a, b| {
        let name = |p: &Path| p.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        natural_cmp(&name(a), &name(b))
    });
    Ok(frames)
}

fn decode_frame(path: &Path) -> Result<ColorFrame, SourceError> {
    let rgb = image::open(path)
        .map_err(|source| SourceError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let resolution = Resolution::new(width, height);
    ColorFrame::from_raw(resolution, rgb.into_raw())
        .ok_or(SourceError::Image(ImageOpError::EmptyFrame(resolution)))
}

/// A decoded video stored as a directory of numbered still images.
#[derive(Debug)]
pub struct ImageSequenceSource {
    frames: Vec<PathBuf>,
    position: usize,
    native: Resolution,
    requested: Option<Resolution>,
    frame_rate: f64,
    pacer: Pacer,
    looping: bool,
}

impl ImageSequenceSource {
    /// Opens a frame directory.
    ///
    /// Fails if the directory cannot be read, holds no frame images, or its
    /// first frame cannot be decoded. The first frame fixes the native
    /// resolution; later frames of a different size are resized to it.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let frames = list_frames(dir)?;
        let first = frames
            .first()
            .ok_or_else(|| SourceError::NoFrames(dir.to_path_buf()))?;
        let native = decode_frame(first)?.resolution();

        tracing::debug!(frames = frames.len(), %native, dir = ?dir, "opened image sequence");

        Ok(Self {
            frames,
            position: 0,
            native,
            requested: None,
            frame_rate: DEFAULT_FRAME_RATE,
            pacer: Pacer::default(),
            looping: false,
        })
    }

    /// Sets the nominal frame rate reported by [`FrameSource::frame_rate`].
    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        if fps.is_finite() && fps > 0.0 {
            self.frame_rate = fps;
            if self.pacer.interval.is_some() {
                self.pacer.set_rate(Some(fps));
            }
        }
        self
    }

    /// Delivers frames no faster than the frame rate, like a capture device.
    pub fn paced(mut self, paced: bool) -> Self {
        self.pacer.set_rate(paced.then_some(self.frame_rate));
        self
    }

    /// Restarts from the first frame instead of ending.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Number of frames in the sequence.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the sequence holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Resolution of the frame files themselves.
    pub fn native_resolution(&self) -> Resolution {
        self.native
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<ColorFrame>, SourceError> {
        if self.position >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return Ok(None);
            }
            self.position = 0;
        }

        self.pacer.wait();
        let path = &self.frames[self.position];
        self.position += 1;

        let frame = decode_frame(path)?;
        Ok(Some(imgproc::resize_color(&frame, self.resolution())?))
    }

    fn set_resolution(&mut self, resolution: Resolution) {
        self.requested = (!resolution.is_empty()).then_some(resolution);
    }

    fn resolution(&self) -> Resolution {
        self.requested.unwrap_or(self.native)
    }

    fn frame_rate(&self) -> Option<f64> {
        Some(self.frame_rate)
    }
}

/// A moving bright square over a dark background.
///
/// The square advances `speed` pixels per frame and wraps around, so every
/// frame after the first produces events along its leading and trailing
/// edges.
#[derive(Debug)]
pub struct SyntheticSource {
    resolution: Resolution,
    square: u32,
    speed: u32,
    emitted: u64,
    limit: Option<u64>,
    frame_rate: f64,
    pacer: Pacer,
}

impl SyntheticSource {
    pub const BACKGROUND: Rgb = Rgb([40, 40, 40]);
    pub const FOREGROUND: Rgb = Rgb([230, 230, 230]);

    /// Creates an unpaced, unbounded synthetic source.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            square: (resolution.height / 4).max(1),
            speed: (resolution.width / 64).max(1),
            emitted: 0,
            limit: None,
            frame_rate: DEFAULT_FRAME_RATE,
            pacer: Pacer::default(),
        }
    }

    /// Ends the stream after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Delivers frames no faster than `fps`.
    pub fn paced(mut self, fps: f64) -> Self {
        if fps.is_finite() && fps > 0.0 {
            self.frame_rate = fps;
        }
        self.pacer.set_rate(Some(self.frame_rate));
        self
    }

    /// Horizontal position of the square in frame `index`.
    pub fn square_origin(&self, index: u64) -> (u32, u32) {
        let span = self.resolution.width.max(1) as u64;
        let x = (index * self.speed as u64 % span) as u32;
        let y = self.resolution.height.saturating_sub(self.square) / 2;
        (x, y)
    }

    fn render(&self, index: u64) -> ColorFrame {
        let mut frame = ColorFrame::filled(self.resolution, Self::BACKGROUND);
        let (x0, y0) = self.square_origin(index);
        for y in y0..(y0 + self.square).min(self.resolution.height) {
            for dx in 0..self.square {
                let x = (x0 + dx) % self.resolution.width;
                frame.set(x, y, Self::FOREGROUND);
            }
        }
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<ColorFrame>, SourceError> {
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return Ok(None);
        }
        if self.resolution.is_empty() {
            return Err(SourceError::Image(ImageOpError::EmptyFrame(self.resolution)));
        }
        self.pacer.wait();
        let frame = self.render(self.emitted);
        self.emitted += 1;
        Ok(Some(frame))
    }

    fn set_resolution(&mut self, resolution: Resolution) {
        if !resolution.is_empty() {
            *self = Self {
                resolution,
                square: (resolution.height / 4).max(1),
                speed: (resolution.width / 64).max(1),
                emitted: self.emitted,
                limit: self.limit,
                frame_rate: self.frame_rate,
                pacer: std::mem::take(&mut self.pacer),
            };
        }
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn frame_rate(&self) -> Option<f64> {
        Some(self.frame_rate)
    }
}
