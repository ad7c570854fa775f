//! Stateful event generation engine.
//!
//! The engine keeps exactly one previous grayscale frame and differences every
//! new frame against it. Pixels whose signed intensity change exceeds the
//! threshold become events; everything derived from one call shares a single
//! timestamp.

use crate::log::EventLog;
use crate::types::{ColorFrame, Event, EventConfig, GrayFrame, Polarity, Resolution, Rgb};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during event generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Frame resolution {actual} does not match processing resolution {expected}")]
    ResolutionMismatch {
        expected: Resolution,
        actual: Resolution,
    },

    #[error("Threshold must be greater than zero")]
    InvalidThreshold,
}

/// Output of one generation call.
#[derive(Debug, Clone)]
pub struct Generated {
    /// Events for this frame: positives first, then negatives, each in
    /// row-major order
    pub events: Vec<Event>,
    /// Rendered visualization at the processing resolution
    pub image: ColorFrame,
}

impl Generated {
    /// Number of positive events in this batch.
    pub fn positive_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.polarity == Polarity::Positive)
            .count()
    }

    /// Number of negative events in this batch.
    pub fn negative_count(&self) -> usize {
        self.events.len() - self.positive_count()
    }
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Frame-differencing event generator.
#[derive(Debug)]
pub struct EventGenerator {
    resolution: Resolution,
    previous: Option<GrayFrame>,
    log: EventLog,
    logging: bool,
}

impl Default for EventGenerator {
    fn default() -> Self {
        Self::new(Resolution::default())
    }
}

impl EventGenerator {
    /// Creates an engine that accepts frames of exactly `resolution`.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            previous: None,
            log: EventLog::new(),
            logging: true,
        }
    }

    /// Creates an engine that does not record events in its log.
    ///
    /// Events are still returned from every call; callers that keep their
    /// own copy (such as batch conversion) avoid holding each event twice.
    pub fn without_log(resolution: Resolution) -> Self {
        Self {
            logging: false,
            ..Self::new(resolution)
        }
    }

    /// Returns true if generated events are appended to the log.
    #[inline]
    pub fn is_logging(&self) -> bool {
        self.logging
    }

    /// Returns the processing resolution.
    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Returns the session event log. Clone it to read from another thread.
    #[inline]
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Returns the stored baseline frame, if any.
    #[inline]
    pub fn previous_frame(&self) -> Option<&GrayFrame> {
        self.previous.as_ref()
    }

    /// Differences `frame` against the previous frame, stamping the events
    /// with the current wall-clock time.
    pub fn generate(
        &mut self,
        frame: &GrayFrame,
        config: &EventConfig,
    ) -> Result<Generated, EngineError> {
        self.run(frame, config, wall_clock_seconds)
    }

    /// Like [`generate`](Self::generate), with a caller-supplied timestamp.
    pub fn generate_at(
        &mut self,
        frame: &GrayFrame,
        config: &EventConfig,
        timestamp: f64,
    ) -> Result<Generated, EngineError> {
        self.run(frame, config, || timestamp)
    }

    fn run(
        &mut self,
        frame: &GrayFrame,
        config: &EventConfig,
        clock: impl FnOnce() -> f64,
    ) -> Result<Generated, EngineError> {
        if frame.resolution() != self.resolution {
            return Err(EngineError::ResolutionMismatch {
                expected: self.resolution,
                actual: frame.resolution(),
            });
        }
        if config.threshold == 0 {
            return Err(EngineError::InvalidThreshold);
        }

        let mut image = ColorFrame::filled(self.resolution, config.background.rgb());

        let Some(previous) = self.previous.as_mut() else {
            self.previous = Some(frame.clone());
            return Ok(Generated {
                events: Vec::new(),
                image,
            });
        };

        let timestamp = clock();
        let threshold = config.threshold as i32;
        let width = self.resolution.width as usize;

        let mut positive = Vec::new();
        let mut negative = Vec::new();

        for (idx, (&cur, &prev)) in frame.data().iter().zip(previous.data()).enumerate() {
            let diff = cur as i32 - prev as i32;
            if config.polarity_pos && diff > threshold {
                positive.push(idx);
            } else if config.polarity_neg && diff < -threshold {
                negative.push(idx);
            }
        }

        let mut events = Vec::with_capacity(positive.len() + negative.len());
        for (pixels, polarity, color) in [
            (&positive, Polarity::Positive, Rgb::POSITIVE),
            (&negative, Polarity::Negative, Rgb::NEGATIVE),
        ] {
            for &idx in pixels {
                image.set_linear(idx, color);
                let x = (idx % width) as u32;
                let y = (idx / width) as u32;
                events.push(Event::new(x, y, timestamp, polarity));
            }
        }

        previous.data_mut().copy_from_slice(frame.data());
        if self.logging {
            self.log.extend(&events);
        }

        Ok(Generated { events, image })
    }
}
