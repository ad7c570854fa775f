//! Core types for frames, configuration and generated events.
//!
//! Frames are plain row-major byte grids. Grayscale frames feed the event
//! engine; color frames (interleaved RGB) come out of frame sources and are
//! used for visualization.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default processing resolution of the event engine (1280x720).
pub const DEFAULT_RESOLUTION: Resolution = Resolution {
    width: 1280,
    height: 720,
};

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Creates a new resolution.
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered by this resolution.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Returns true if either dimension is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Default for Resolution {
    fn default() -> Self {
        DEFAULT_RESOLUTION
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Errors from parsing textual configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid resolution: {0}. Use WIDTHxHEIGHT, e.g. 1280x720")]
    Resolution(String),

    #[error("Invalid background: {0}. Use white, black, gray or r,g,b")]
    Background(String),
}

impl FromStr for Resolution {
    type Err = ParseError;

    /// Parses a resolution like "1280x720".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::Resolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        let resolution = Resolution::new(width, height);
        if resolution.is_empty() {
            return Err(invalid());
        }
        Ok(resolution)
    }
}

/// An 8-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const WHITE: Rgb = Rgb([255, 255, 255]);
    pub const BLACK: Rgb = Rgb([0, 0, 0]);
    pub const GRAY: Rgb = Rgb([127, 127, 127]);
    /// Color used for positive (brighter) events.
    pub const POSITIVE: Rgb = Rgb([255, 0, 0]);
    /// Color used for negative (darker) events.
    pub const NEGATIVE: Rgb = Rgb([0, 0, 255]);
}

/// Background fill of rendered event images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Background {
    #[default]
    White,
    Black,
    Gray,
    /// Explicit RGB triple
    Custom(Rgb),
}

impl Background {
    /// Returns the fill color.
    pub fn rgb(&self) -> Rgb {
        match self {
            Self::White => Rgb::WHITE,
            Self::Black => Rgb::BLACK,
            Self::Gray => Rgb::GRAY,
            Self::Custom(rgb) => *rgb,
        }
    }
}

impl FromStr for Background {
    type Err = ParseError;

    /// Parses "white", "black", "gray"/"grey" or an explicit "r,g,b" triple.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();
        match value.as_str() {
            "white" => return Ok(Self::White),
            "black" => return Ok(Self::Black),
            "gray" | "grey" => return Ok(Self::Gray),
            _ => {}
        }

        let parts: Vec<&str> = value.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(ParseError::Background(s.to_string()));
        }
        let mut rgb = [0u8; 3];
        for (channel, part) in rgb.iter_mut().zip(&parts) {
            *channel = part
                .parse()
                .map_err(|_| ParseError::Background(s.to_string()))?;
        }
        Ok(Self::Custom(Rgb(rgb)))
    }
}

/// Event generation parameters, read fresh on every generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventConfig {
    /// Minimum absolute intensity change (exclusive) that produces an event
    pub threshold: u32,
    /// Decay factor. Carried for interface compatibility; it does not affect
    /// event generation.
    pub decay: i32,
    /// Emit events for brightness increases
    pub polarity_pos: bool,
    /// Emit events for brightness decreases
    pub polarity_neg: bool,
    /// Fill of the rendered event image
    pub background: Background,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            threshold: 15,
            decay: 10,
            polarity_pos: true,
            polarity_neg: true,
            background: Background::White,
        }
    }
}

/// Sign of a brightness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    /// Pixel became brighter (+1)
    Positive,
    /// Pixel became darker (-1)
    Negative,
}

impl Polarity {
    /// Returns +1 or -1.
    #[inline]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Positive => 1,
            Self::Negative => -1,
        }
    }

    /// Parses +1 / -1. Any other value is rejected.
    #[inline]
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Positive),
            -1 => Some(Self::Negative),
            _ => None,
        }
    }
}

/// A generated change event.
///
/// All events derived from the same frame share one timestamp, expressed in
/// seconds of wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// X coordinate of the pixel
    pub x: u32,
    /// Y coordinate of the pixel
    pub y: u32,
    /// Timestamp in seconds since the Unix epoch
    pub timestamp: f64,
    /// Direction of the brightness change
    pub polarity: Polarity,
}

impl Event {
    /// Creates a new event.
    #[inline]
    pub fn new(x: u32, y: u32, timestamp: f64, polarity: Polarity) -> Self {
        Self {
            x,
            y,
            timestamp,
            polarity,
        }
    }
}

/// A single-channel 8-bit frame, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    resolution: Resolution,
    data: Vec<u8>,
}

impl GrayFrame {
    /// Creates a frame filled with one intensity.
    pub fn filled(resolution: Resolution, value: u8) -> Self {
        Self {
            resolution,
            data: vec![value; resolution.pixel_count()],
        }
    }

    /// Wraps existing samples. Returns `None` if the length does not match.
    pub fn from_raw(resolution: Resolution, data: Vec<u8>) -> Option<Self> {
        (data.len() == resolution.pixel_count()).then_some(Self { resolution, data })
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the sample at (x, y).
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.resolution.width as usize + x as usize]
    }

    /// Sets the sample at (x, y).
    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        let idx = y as usize * self.resolution.width as usize + x as usize;
        self.data[idx] = value;
    }
}

/// A three-channel 8-bit frame, interleaved RGB, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorFrame {
    resolution: Resolution,
    data: Vec<u8>,
}

impl ColorFrame {
    /// Creates a frame filled with one color.
    pub fn filled(resolution: Resolution, color: Rgb) -> Self {
        let mut data = Vec::with_capacity(resolution.pixel_count() * 3);
        for _ in 0..resolution.pixel_count() {
            data.extend_from_slice(&color.0);
        }
        Self { resolution, data }
    }

    /// Wraps existing interleaved RGB samples. Returns `None` if the length
    /// does not match.
    pub fn from_raw(resolution: Resolution, data: Vec<u8>) -> Option<Self> {
        (data.len() == resolution.pixel_count() * 3).then_some(Self { resolution, data })
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the frame, returning the interleaved samples.
    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Returns the color at (x, y).
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Rgb {
        let idx = (y as usize * self.resolution.width as usize + x as usize) * 3;
        Rgb([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Sets the color at (x, y).
    #[inline]
    pub fn set(&mut self, x: u32, y: u32, color: Rgb) {
        let idx = (y as usize * self.resolution.width as usize + x as usize) * 3;
        self.data[idx..idx + 3].copy_from_slice(&color.0);
    }

    /// Sets the color of the pixel at linear index `pixel`.
    #[inline]
    pub(crate) fn set_linear(&mut self, pixel: usize, color: Rgb) {
        let idx = pixel * 3;
        self.data[idx..idx + 3].copy_from_slice(&color.0);
    }
}
