//! Event camera simulator.
//!
//! This crate turns ordinary video frames into the output of a dynamic
//! vision sensor: a signed brightness change beyond a threshold between two
//! consecutive frames becomes an event `(x, y, timestamp, polarity)`.
//!
//! # Example
//!
//! ```no_run
//! use frame2ev_core::batch::{BatchOptions, BatchProcessor};
//! use frame2ev_core::sink::ImageSequenceSink;
//! use frame2ev_core::source::ImageSequenceSource;
//!
//! let mut source = ImageSequenceSource::open("input_frames").unwrap();
//! let mut sink = ImageSequenceSink::create("event_frames").unwrap();
//! let report = BatchProcessor::new(BatchOptions::default())
//!     .run(&mut source, &mut sink)
//!     .unwrap();
//!
//! frame2ev_core::output::write_csv("events.csv", &report.events).unwrap();
//! println!("{} frames, {} events", report.frames_read, report.events.len());
//! ```
//!
//! # Features
//!
//! - Frame-differencing event engine with configurable threshold and polarity filters
//! - Live acquisition pipeline with a bounded, drop-when-full frame reservoir
//! - Offline batch conversion that keeps every frame
//! - CSV and NPZ event export

pub mod batch;
pub mod engine;
pub mod imgproc;
pub mod log;
pub mod output;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use batch::{BatchError, BatchOptions, BatchProcessor, BatchReport};
pub use engine::{EngineError, EventGenerator, Generated};
pub use log::EventLog;
pub use output::OutputError;
pub use pipeline::{AcquisitionPipeline, PipelineError, PipelineStats, SharedConfig};
pub use sink::{ImageSequenceSink, SinkError, VideoSink};
pub use source::{FrameSource, ImageSequenceSource, SourceError, SyntheticSource};
pub use types::{Background, ColorFrame, Event, EventConfig, GrayFrame, Polarity, Resolution, Rgb};
