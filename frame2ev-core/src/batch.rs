//! Offline batch conversion of a stored video.
//!
//! Every frame is converted to grayscale, resized to the processing
//! resolution and run through the engine. Event coordinates are then mapped
//! back to the source resolution, and the rendered event image is resized to
//! the source resolution and written to the output video. Nothing is dropped:
//! the output has exactly one frame per input frame.

use crate::engine::{EngineError, EventGenerator};
use crate::imgproc::{self, ImageOpError};
use crate::sink::{SinkError, VideoSink};
use crate::source::{FrameSource, SourceError};
use crate::types::{Event, EventConfig, Resolution};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Default number of frames between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 50;

/// Errors that abort a batch run.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to read frame {frame}: {source}")]
    Source {
        frame: u64,
        #[source]
        source: SourceError,
    },

    #[error("Failed to write frame {frame}: {source}")]
    Sink {
        frame: u64,
        #[source]
        source: SinkError,
    },

    #[error("Failed to process frame {frame}: {source}")]
    Image {
        frame: u64,
        #[source]
        source: ImageOpError,
    },

    #[error("Failed to generate events for frame {frame}: {source}")]
    Engine {
        frame: u64,
        #[source]
        source: EngineError,
    },
}

/// Parameters of a batch run, fixed for its whole duration.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub config: EventConfig,
    /// Resolution the engine operates at
    pub processing: Resolution,
    /// Frames between progress reports (0 disables them)
    pub progress_interval: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            config: EventConfig::default(),
            processing: Resolution::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Progress telemetry.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub frames: u64,
    pub events: usize,
    pub elapsed: Duration,
}

impl BatchProgress {
    /// Average frames per second so far.
    pub fn average_fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct BatchReport {
    /// All events, in frame order, at the output resolution
    pub events: Vec<Event>,
    pub frames_read: u64,
    pub frames_written: u64,
    /// Resolution of the source and of the written video
    pub output: Resolution,
    pub processing: Resolution,
    pub elapsed: Duration,
}

/// Maps a coordinate from one axis length to another: `floor(v * to / from)`.
#[inline]
pub fn rescale_coordinate(value: u32, from: u32, to: u32) -> u32 {
    (value as u64 * to as u64 / from.max(1) as u64) as u32
}

/// Maps an event from processing coordinates to output coordinates, scaling
/// x and y independently.
pub fn rescale_event(event: &Event, processing: Resolution, output: Resolution) -> Event {
    Event {
        x: rescale_coordinate(event.x, processing.width, output.width),
        y: rescale_coordinate(event.y, processing.height, output.height),
        ..*event
    }
}

/// Runs the event engine over an entire finite source.
#[derive(Debug)]
pub struct BatchProcessor {
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Processes every frame of `source`, writing rendered frames to `sink`.
    pub fn run<S, K>(&self, source: &mut S, sink: &mut K) -> Result<BatchReport, BatchError>
    where
        S: FrameSource + ?Sized,
        K: VideoSink + ?Sized,
    {
        self.run_with_progress(source, sink, |_| {})
    }

    /// Like [`run`](Self::run), calling `progress` every progress interval
    /// and once at the end.
    pub fn run_with_progress<S, K, F>(
        &self,
        source: &mut S,
        sink: &mut K,
        mut progress: F,
    ) -> Result<BatchReport, BatchError>
    where
        S: FrameSource + ?Sized,
        K: VideoSink + ?Sized,
        F: FnMut(&BatchProgress),
    {
        let processing = self.options.processing;
        let config = self.options.config;
        let interval = self.options.progress_interval;
        // Only the rescaled copies in `events` are kept
        let mut engine = EventGenerator::without_log(processing);

        let mut output = source.resolution();
        let mut events = Vec::new();
        let mut frames = 0u64;
        let start = Instant::now();

        info!(%processing, threshold = config.threshold, "batch processing started");

        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(source) => return Err(BatchError::Source { frame: frames, source }),
            };
            output = frame.resolution();

            let image_err = |source: ImageOpError| BatchError::Image {
                frame: frames,
                source,
            };
            let gray = imgproc::to_gray(&frame).map_err(image_err)?;
            let gray = imgproc::resize_gray(&gray, processing).map_err(image_err)?;

            let generated = engine
                .generate(&gray, &config)
                .map_err(|source| BatchError::Engine {
                    frame: frames,
                    source,
                })?;
            events.extend(
                generated
                    .events
                    .iter()
                    .map(|e| rescale_event(e, processing, output)),
            );

            let rendered = imgproc::resize_color(&generated.image, output).map_err(image_err)?;
            sink.write_frame(&rendered)
                .map_err(|source| BatchError::Sink {
                    frame: frames,
                    source,
                })?;

            frames += 1;
            if interval > 0 && frames % interval == 0 {
                let report = BatchProgress {
                    frames,
                    events: events.len(),
                    elapsed: start.elapsed(),
                };
                info!(
                    frames,
                    elapsed_s = report.elapsed.as_secs_f64(),
                    avg_fps = report.average_fps(),
                    "batch progress"
                );
                progress(&report);
            }
        }

        sink.finish().map_err(|source| BatchError::Sink {
            frame: frames,
            source,
        })?;

        let elapsed = start.elapsed();
        progress(&BatchProgress {
            frames,
            events: events.len(),
            elapsed,
        });
        info!(
            frames,
            events = events.len(),
            elapsed_s = elapsed.as_secs_f64(),
            "batch processing finished"
        );

        Ok(BatchReport {
            events,
            frames_read: frames,
            frames_written: sink.frames_written(),
            output,
            processing,
            elapsed,
        })
    }
}
