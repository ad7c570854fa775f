//! End-to-end tests for the event engine, batch conversion and exporters.
//!
//! Frame sequences are generated on the fly into temporary directories.
//! Run with: cargo test --test integration_tests

use frame2ev_core::batch::{BatchOptions, BatchProcessor};
use frame2ev_core::pipeline::{
    AcquisitionPipeline, DiscardSink, DisplaySink, DisplayUpdate, PipelineOptions, SharedConfig,
};
use frame2ev_core::sink::{FrameCollector, ImageSequenceSink, VideoSink};
use frame2ev_core::source::{FrameSource, ImageSequenceSource, SourceError, SyntheticSource};
use frame2ev_core::{output, Event, EventConfig, EventGenerator, GrayFrame, Polarity, Resolution};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Small deterministic generator for pseudo-random frames.
struct Lcg(u64);

impl Lcg {
    fn next_u8(&mut self) -> u8 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 56) as u8
    }

    fn frame(&mut self, resolution: Resolution) -> GrayFrame {
        let data = (0..resolution.pixel_count()).map(|_| self.next_u8()).collect();
        GrayFrame::from_raw(resolution, data).unwrap()
    }
}

fn config(threshold: u32) -> EventConfig {
    EventConfig {
        threshold,
        ..EventConfig::default()
    }
}

/// Runs a fresh engine over two frames and returns the second frame's events.
fn events_between(a: &GrayFrame, b: &GrayFrame, config: &EventConfig) -> Vec<Event> {
    let mut engine = EventGenerator::new(a.resolution());
    engine.generate_at(a, config, 0.0).unwrap();
    engine.generate_at(b, config, 1.0).unwrap().events
}

fn write_gray_png(path: &Path, resolution: Resolution, pixels: &[(u32, u32, u8)], fill: u8) {
    let mut img = image::RgbImage::from_pixel(
        resolution.width,
        resolution.height,
        image::Rgb([fill, fill, fill]),
    );
    for &(x, y, v) in pixels {
        img.put_pixel(x, y, image::Rgb([v, v, v]));
    }
    img.save(path).unwrap();
}

/// Test that a higher threshold never produces more events than a lower one.
#[test]
fn test_threshold_monotonicity() {
    let res = Resolution::new(48, 32);
    let mut rng = Lcg(7);
    let a = rng.frame(res);
    let b = rng.frame(res);

    let mut last = usize::MAX;
    for threshold in [1, 5, 15, 40, 100, 200, 254, 255] {
        let count = events_between(&a, &b, &config(threshold)).len();
        assert!(
            count <= last,
            "threshold {} produced {} events, more than {}",
            threshold,
            count,
            last
        );
        last = count;
    }
    assert_eq!(last, 0);
}

/// Test that no pixel is reported with both polarities in one frame.
#[test]
fn test_polarity_disjointness() {
    let res = Resolution::new(40, 30);
    let mut rng = Lcg(11);
    let a = rng.frame(res);
    let b = rng.frame(res);
    let events = events_between(&a, &b, &config(10));

    let mut seen = std::collections::HashSet::new();
    for e in &events {
        assert!(seen.insert((e.x, e.y)), "pixel ({}, {}) reported twice", e.x, e.y);
    }

    // Positives come first, then negatives
    let first_negative = events
        .iter()
        .position(|e| e.polarity == Polarity::Negative)
        .unwrap_or(events.len());
    assert!(events[first_negative..]
        .iter()
        .all(|e| e.polarity == Polarity::Negative));
}

/// Test that disabling a polarity removes exactly that polarity.
#[test]
fn test_polarity_gating() {
    let res = Resolution::new(32, 32);
    let mut rng = Lcg(3);
    let a = rng.frame(res);
    let b = rng.frame(res);

    let both = events_between(&a, &b, &config(20));
    let positive_only = events_between(
        &a,
        &b,
        &EventConfig {
            polarity_neg: false,
            ..config(20)
        },
    );
    let negative_only = events_between(
        &a,
        &b,
        &EventConfig {
            polarity_pos: false,
            ..config(20)
        },
    );
    let neither = events_between(
        &a,
        &b,
        &EventConfig {
            polarity_pos: false,
            polarity_neg: false,
            ..config(20)
        },
    );

    assert!(positive_only.iter().all(|e| e.polarity == Polarity::Positive));
    assert!(negative_only.iter().all(|e| e.polarity == Polarity::Negative));
    assert_eq!(positive_only.len() + negative_only.len(), both.len());
    assert!(neither.is_empty());
}

/// Test that the engine's output depends only on the previous and current frame.
#[test]
fn test_state_update_determinism() {
    let res = Resolution::new(24, 16);
    let mut rng = Lcg(42);
    let frames: Vec<GrayFrame> = (0..6).map(|_| rng.frame(res)).collect();
    let cfg = config(25);

    let mut engine = EventGenerator::new(res);
    for (i, frame) in frames.iter().enumerate() {
        let events = engine.generate_at(frame, &cfg, i as f64).unwrap().events;
        assert_eq!(engine.previous_frame(), Some(frame));
        if i > 0 {
            let fresh: Vec<_> = events_between(&frames[i - 1], frame, &cfg)
                .into_iter()
                .map(|e| Event { timestamp: i as f64, ..e })
                .collect();
            assert_eq!(events, fresh);
        }
    }
}

/// Test CSV and NPZ exports through real files, and conversion between them.
#[test]
fn test_export_round_trip_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let events = vec![
        Event::new(0, 0, 1_700_000_000.123456, Polarity::Positive),
        Event::new(1279, 719, 1_700_000_000.5, Polarity::Negative),
        Event::new(640, 360, 0.1, Polarity::Positive),
    ];

    let csv_path = dir.path().join("events.csv");
    let npz_path = dir.path().join("events.npz");
    output::write_csv(&csv_path, &events).unwrap();
    output::write_npz(&npz_path, &events).unwrap();

    assert_eq!(output::read_csv(&csv_path).unwrap(), events);
    assert_eq!(output::read_npz(&npz_path).unwrap(), events);

    let converted = dir.path().join("converted.npz");
    output::write_npz(&converted, &output::read_csv(&csv_path).unwrap()).unwrap();
    assert_eq!(output::read_npz(&converted).unwrap(), events);
}

/// Test that an empty log exports a header-only CSV and an NPZ of empty arrays.
#[test]
fn test_empty_export() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("empty.csv");
    let npz_path = dir.path().join("empty.npz");
    output::write_csv(&csv_path, &[]).unwrap();
    output::write_npz(&npz_path, &[]).unwrap();

    assert_eq!(
        std::fs::read_to_string(&csv_path).unwrap().trim_end(),
        output::CSV_HEADER
    );
    assert!(output::read_npz(&npz_path).unwrap().is_empty());
}

/// Test a full batch run: one changed pixel yields one positive event.
#[test]
fn test_batch_single_pixel_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::create_dir(&input).unwrap();
    let res = Resolution::new(64, 36);

    write_gray_png(&input.join("frame_2.png"), res, &[(10, 5, 150)], 100);
    write_gray_png(&input.join("frame_1.png"), res, &[], 100);
    // Natural ordering puts frame_10 last
    write_gray_png(&input.join("frame_10.png"), res, &[(10, 5, 150)], 100);

    let mut source = ImageSequenceSource::open(&input).unwrap();
    let out_dir = dir.path().join("events");
    let mut sink = ImageSequenceSink::create(&out_dir).unwrap();

    let options = BatchOptions {
        config: config(15),
        processing: res,
        ..BatchOptions::default()
    };
    let report = BatchProcessor::new(options)
        .run(&mut source, &mut sink)
        .unwrap();

    assert_eq!(report.frames_read, 3);
    assert_eq!(report.frames_written, 3);
    assert_eq!(report.output, res);
    assert_eq!(report.events.len(), 1);
    let event = report.events[0];
    assert_eq!((event.x, event.y, event.polarity), (10, 5, Polarity::Positive));

    let rendered = image::open(out_dir.join("frame_000001.png")).unwrap().to_rgb8();
    assert_eq!(rendered.dimensions(), (64, 36));
    assert_eq!(rendered.get_pixel(10, 5).0, [255, 0, 0]);
    assert_eq!(rendered.get_pixel(11, 5).0, [255, 255, 255]);

    let first = image::open(out_dir.join("frame_000000.png")).unwrap().to_rgb8();
    assert!(first.pixels().all(|p| p.0 == [255, 255, 255]));
}

/// Test that batch events land at the source resolution when processing
/// happens at a larger one.
#[test]
fn test_batch_rescales_to_source_resolution() {
    let source_res = Resolution::new(64, 36);
    let processing = Resolution::new(128, 72);
    let mut source = SyntheticSource::new(source_res).with_limit(5);
    let mut sink = FrameCollector::new();

    let options = BatchOptions {
        processing,
        progress_interval: 2,
        ..BatchOptions::default()
    };
    let mut reports = Vec::new();
    let report = BatchProcessor::new(options)
        .run_with_progress(&mut source, &mut sink, |p| reports.push(p.frames))
        .unwrap();

    assert_eq!(report.frames_read, 5);
    assert_eq!(sink.frames_written(), 5);
    assert!(sink.frames().iter().all(|f| f.resolution() == source_res));
    assert!(!report.events.is_empty());
    assert!(report
        .events
        .iter()
        .all(|e| e.x < source_res.width && e.y < source_res.height));
    assert_eq!(reports, vec![2, 4, 5]);
}

/// Test that an unreadable input fails before any output is created.
#[test]
fn test_unreadable_input_creates_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken");
    std::fs::create_dir(&input).unwrap();
    std::fs::write(input.join("frame_0.png"), b"not an image").unwrap();

    let err = ImageSequenceSource::open(&input).unwrap_err();
    assert!(matches!(err, SourceError::Decode { .. }));

    let empty = dir.path().join("empty");
    std::fs::create_dir(&empty).unwrap();
    std::fs::write(empty.join("notes.txt"), b"no frames here").unwrap();
    assert!(matches!(
        ImageSequenceSource::open(&empty),
        Err(SourceError::NoFrames(_))
    ));

    assert!(!dir.path().join("events").exists());
}

/// Test a short live session against a synthetic camera, then export it.
#[test]
fn test_live_session_exports_snapshot() {
    let res = Resolution::new(64, 48);
    let mut pipeline = AcquisitionPipeline::new(
        Box::new(SyntheticSource::new(res).paced(200.0)),
        EventGenerator::new(res),
        SharedConfig::new(EventConfig::default()),
        Arc::new(DiscardSink),
        PipelineOptions::default(),
    );
    let log = pipeline.log().clone();

    pipeline.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while log.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    pipeline.config().update(|c| c.polarity_neg = false);
    let engine = pipeline.close().unwrap().unwrap();
    assert!(engine.previous_frame().is_some());

    let events = log.snapshot();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.x < res.width && e.y < res.height));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(output::timestamped_filename("events", "npz"));
    output::write_npz(&path, &events).unwrap();
    assert_eq!(output::read_npz(&path).unwrap(), events);
}

/// Test that a synthetic source honours the requested resolution.
#[test]
fn test_synthetic_source_resolution_request() {
    let mut source = SyntheticSource::new(Resolution::new(32, 32));
    source.set_resolution(Resolution::new(16, 8));
    let frame = source.next_frame().unwrap().unwrap();
    assert_eq!(frame.resolution(), Resolution::new(16, 8));
}

/// Test one brightened pixel at the default 1280x720 processing resolution.
#[test]
fn test_single_pixel_at_default_resolution() {
    let mut engine = EventGenerator::default();
    let res = engine.resolution();
    assert_eq!(res, Resolution::new(1280, 720));

    let base = GrayFrame::filled(res, 100);
    let mut next = base.clone();
    next.set(1000, 700, 150);

    let first = engine.generate_at(&base, &config(15), 10.0).unwrap();
    assert!(first.events.is_empty());

    let second = engine.generate_at(&next, &config(15), 11.0).unwrap();
    assert_eq!(
        second.events,
        vec![Event::new(1000, 700, 11.0, Polarity::Positive)]
    );
    assert_eq!(second.positive_count(), 1);
    assert_eq!(second.negative_count(), 0);
    assert_eq!(engine.log().len(), 1);
}

/// Display that takes 50 ms per update, slowing the processing worker.
struct SlowDisplay;

impl DisplaySink for SlowDisplay {
    fn deliver(&self, _update: DisplayUpdate) {
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Test that a slow consumer makes the running pipeline drop frames.
#[test]
fn test_slow_processing_drops_frames() {
    let res = Resolution::new(32, 24);
    let capacity = 5;
    let mut pipeline = AcquisitionPipeline::new(
        Box::new(SyntheticSource::new(res)),
        EventGenerator::new(res),
        SharedConfig::default(),
        Arc::new(SlowDisplay),
        PipelineOptions {
            reservoir_capacity: capacity,
            ..PipelineOptions::default()
        },
    );

    pipeline.start().unwrap();
    std::thread::sleep(Duration::from_millis(500));
    pipeline.stop().unwrap();

    let stats = pipeline.stats();
    assert!(stats.processed > 0);
    assert!(stats.dropped > 0, "no frame dropped: {:?}", stats);
    assert!(stats.processed < stats.captured);
    // Every captured frame was processed, dropped, or left in the reservoir
    let unaccounted = stats.captured - stats.processed - stats.dropped;
    assert!(unaccounted <= capacity as u64, "{:?}", stats);
    assert_eq!(stats.failed, 0);
}
