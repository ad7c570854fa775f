//! Live frame acquisition pipeline.
//!
//! A capture worker pulls frames from the [`FrameSource`] and offers them to
//! a bounded [`Reservoir`]; a processing worker takes them out, conforms them
//! to the engine's processing resolution, generates events and hands the
//! result to a [`DisplaySink`]. When the reservoir is full the newest frame is
//! dropped: the pipeline sheds load instead of stalling the capture device.
//!
//! The workers own the source and the engine while running and hand them back
//! when joined, so engine state (previous frame and event log) survives
//! `stop()`/`start()` cycles, and the source is released only after both
//! workers have stopped.

use crate::engine::{EngineError, EventGenerator};
use crate::imgproc::{self, ImageOpError};
use crate::log::EventLog;
use crate::source::FrameSource;
use crate::types::{ColorFrame, EventConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default reservoir capacity (frames).
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 5;

/// Default interval at which idle workers re-check the running flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Length of one capture-rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

// Floor for the event-rate denominator.
const MIN_RATE_ELAPSED: Duration = Duration::from_millis(1);

/// Errors from pipeline lifecycle operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to spawn {name} worker: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("The {0} worker panicked")]
    WorkerPanicked(&'static str),

    #[error("The pipeline has no frame source")]
    SourceLost,

    #[error("The pipeline has no engine")]
    EngineLost,
}

/// Failure while processing one frame. Contained within the worker loop.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Image(#[from] ImageOpError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// The writer half of a reservoir was dropped; no item will arrive again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The reservoir has no writer")]
pub struct ReservoirClosed;

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
}

/// Writer half of a [`Reservoir`].
#[derive(Debug, Clone)]
pub struct ReservoirWriter<T> {
    tx: Sender<T>,
}

/// Reader half of a [`Reservoir`].
#[derive(Debug, Clone)]
pub struct ReservoirReader<T> {
    rx: Receiver<T>,
}

/// Bounded FIFO holding area that refuses new items when full.
pub struct Reservoir;

impl Reservoir {
    /// Creates a reservoir holding at most `capacity` items (at least 1).
    pub fn bounded<T>(capacity: usize) -> (ReservoirWriter<T>, ReservoirReader<T>) {
        let (tx, rx) = bounded(capacity.max(1));
        (ReservoirWriter { tx }, ReservoirReader { rx })
    }
}

impl<T> ReservoirWriter<T> {
    /// Admits `item` without blocking. Returns false if it was dropped
    /// because the reservoir is full or the reader is gone.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> ReservoirReader<T> {
    /// Takes the oldest item, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the wait timed out. Once every writer is gone and the
    /// reservoir is drained, fails immediately with [`ReservoirClosed`].
    pub fn take(&self, timeout: Duration) -> Result<Option<T>, ReservoirClosed> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ReservoirClosed),
        }
    }

    /// Takes the oldest item if one is waiting.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Frames-per-second over rolling fixed windows.
#[derive(Debug)]
pub struct RateWindow {
    window: Duration,
    start: Instant,
    count: u64,
}

impl RateWindow {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            start: now,
            count: 0,
        }
    }

    /// Counts one frame. When the window has elapsed, returns the rate and
    /// starts a new window.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed < self.window {
            return None;
        }
        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.start = now;
        self.count = 0;
        Some(rate)
    }
}

/// Events per second between successive emissions.
#[derive(Debug)]
pub struct EventRate {
    last: Instant,
}

impl EventRate {
    pub fn new(now: Instant) -> Self {
        Self { last: now }
    }

    /// Rate of `events` emitted at `now`, over the time since the previous
    /// emission.
    pub fn record(&mut self, events: usize, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).max(MIN_RATE_ELAPSED);
        self.last = now;
        events as f64 / elapsed.as_secs_f64()
    }
}

/// Live counters shared between the workers and the owner.
#[derive(Debug, Default)]
struct Counters {
    captured: AtomicU64,
    dropped: AtomicU64,
    empty_reads: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    events: AtomicU64,
    capture_rate_bits: AtomicU64,
    event_rate_bits: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn store_f64(cell: &AtomicU64, value: f64) {
        cell.store(value.to_bits(), Ordering::Relaxed);
    }

    fn load_f64(cell: &AtomicU64) -> f64 {
        f64::from_bits(cell.load(Ordering::Relaxed))
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            capture_rate: Self::load_f64(&self.capture_rate_bits),
            event_rate: Self::load_f64(&self.event_rate_bits),
        }
    }
}

/// Point-in-time pipeline telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PipelineStats {
    /// Frames pulled from the source
    pub captured: u64,
    /// Frames refused by a full reservoir
    pub dropped: u64,
    /// Iterations where the source had no frame or failed to read
    pub empty_reads: u64,
    /// Frames run through the engine
    pub processed: u64,
    /// Frames whose processing failed
    pub failed: u64,
    /// Events generated
    pub events: u64,
    /// Processed frames per second, updated once per second
    pub capture_rate: f64,
    /// Events per second of the latest emission
    pub event_rate: f64,
}

/// One processed frame, as delivered to the display.
#[derive(Debug, Clone)]
pub struct DisplayUpdate {
    /// Captured frame at the processing resolution
    pub frame: ColorFrame,
    /// Rendered events
    pub event_image: ColorFrame,
    /// Events per second
    pub event_rate: f64,
}

/// Receiver of processed frames.
///
/// Called from the processing worker; implementations must not block.
pub trait DisplaySink: Send + Sync {
    fn deliver(&self, update: DisplayUpdate);
}

/// Drops updates the display has not caught up with.
impl DisplaySink for Sender<DisplayUpdate> {
    fn deliver(&self, update: DisplayUpdate) {
        if let Err(TrySendError::Full(_)) = self.try_send(update) {
            debug!("display is behind; update discarded");
        }
    }
}

/// A display sink that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl DisplaySink for DiscardSink {
    fn deliver(&self, _update: DisplayUpdate) {}
}

/// Configuration shared with the UI; read by the pipeline on every frame.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<EventConfig>>,
}

impl SharedConfig {
    pub fn new(config: EventConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Returns the current configuration.
    pub fn get(&self) -> EventConfig {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the configuration.
    pub fn set(&self, config: EventConfig) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Modifies the configuration in place.
    pub fn update(&self, f: impl FnOnce(&mut EventConfig)) {
        f(&mut self.inner.write().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Tunables of the acquisition pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Frames the reservoir can hold before captures are dropped
    pub reservoir_capacity: usize,
    /// Longest time a worker waits before re-checking the running flag
    pub poll_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            reservoir_capacity: DEFAULT_RESERVOIR_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

type BoxedSource = Box<dyn FrameSource>;

/// Live acquisition session.
pub struct AcquisitionPipeline {
    state: PipelineState,
    source: Option<BoxedSource>,
    engine: Option<EventGenerator>,
    log: EventLog,
    config: SharedConfig,
    sink: Arc<dyn DisplaySink>,
    options: PipelineOptions,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    capture: Option<JoinHandle<BoxedSource>>,
    processor: Option<JoinHandle<EventGenerator>>,
}

impl AcquisitionPipeline {
    /// Creates an idle pipeline.
    ///
    /// The source is asked to deliver frames at the engine's processing
    /// resolution; frames that still differ are resized per frame.
    pub fn new(
        mut source: BoxedSource,
        engine: EventGenerator,
        config: SharedConfig,
        sink: Arc<dyn DisplaySink>,
        options: PipelineOptions,
    ) -> Self {
        source.set_resolution(engine.resolution());
        Self {
            state: PipelineState::Idle,
            source: Some(source),
            log: engine.log().clone(),
            engine: Some(engine),
            config,
            sink,
            options,
            counters: Arc::new(Counters::default()),
            running: Arc::new(AtomicBool::new(false)),
            capture: None,
            processor: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle to the session event log.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Shared configuration read by the processing worker.
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Current telemetry.
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Returns the engine while the pipeline is idle.
    pub fn engine(&self) -> Option<&EventGenerator> {
        self.engine.as_ref()
    }

    /// Starts the capture and processing workers. No-op when running.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state == PipelineState::Running {
            return Ok(());
        }

        let source = self.source.take().ok_or(PipelineError::SourceLost)?;
        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => {
                self.source = Some(source);
                return Err(PipelineError::EngineLost);
            }
        };

        let (writer, reader) = Reservoir::bounded(self.options.reservoir_capacity);
        self.running.store(true, Ordering::Release);

        let processor = ProcessingWorker {
            engine,
            reader,
            config: self.config.clone(),
            sink: Arc::clone(&self.sink),
            counters: Arc::clone(&self.counters),
            running: Arc::clone(&self.running),
            poll: self.options.poll_interval,
        };
        let processor = match thread::Builder::new()
            .name("frame2ev-process".to_string())
            .spawn(move || processor.run())
        {
            Ok(handle) => handle,
            Err(source_err) => {
                // The closure (and the engine in it) is gone; nothing to restore.
                self.running.store(false, Ordering::Release);
                self.source = Some(source);
                return Err(PipelineError::Spawn {
                    name: "processing",
                    source: source_err,
                });
            }
        };

        let capture = CaptureWorker {
            source,
            writer,
            counters: Arc::clone(&self.counters),
            running: Arc::clone(&self.running),
            poll: self.options.poll_interval,
        };
        let capture = match thread::Builder::new()
            .name("frame2ev-capture".to_string())
            .spawn(move || capture.run())
        {
            Ok(handle) => handle,
            Err(source_err) => {
                self.running.store(false, Ordering::Release);
                self.engine = processor.join().ok();
                return Err(PipelineError::Spawn {
                    name: "capture",
                    source: source_err,
                });
            }
        };

        self.capture = Some(capture);
        self.processor = Some(processor);
        self.state = PipelineState::Running;
        info!(
            reservoir = self.options.reservoir_capacity,
            "acquisition pipeline started"
        );
        Ok(())
    }

    /// Signals the workers to stop and waits for both to finish.
    ///
    /// No-op when idle.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Running {
            return Ok(());
        }
        self.state = PipelineState::Stopping;
        self.running.store(false, Ordering::Release);

        let mut result = Ok(());
        if let Some(handle) = self.capture.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => result = Err(PipelineError::WorkerPanicked("capture")),
            }
        }
        if let Some(handle) = self.processor.take() {
            match handle.join() {
                Ok(engine) => self.engine = Some(engine),
                Err(_) => result = result.and(Err(PipelineError::WorkerPanicked("processing"))),
            }
        }

        self.state = PipelineState::Idle;
        let stats = self.stats();
        info!(
            processed = stats.processed,
            dropped = stats.dropped,
            failed = stats.failed,
            events = self.log.len(),
            "acquisition pipeline stopped"
        );
        result
    }

    /// Stops the workers and releases the frame source.
    ///
    /// Returns the engine so its state can outlive the session.
    pub fn close(mut self) -> Result<Option<EventGenerator>, PipelineError> {
        self.stop()?;
        drop(self.source.take());
        debug!("frame source released");
        Ok(self.engine.take())
    }
}

impl Drop for AcquisitionPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "pipeline did not stop cleanly");
        }
    }
}

struct CaptureWorker {
    source: BoxedSource,
    writer: ReservoirWriter<ColorFrame>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    poll: Duration,
}

impl CaptureWorker {
    fn run(mut self) -> BoxedSource {
        debug!("capture worker started");
        while self.running.load(Ordering::Acquire) {
            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    Counters::bump(&self.counters.captured);
                    if !self.writer.offer(frame) {
                        Counters::bump(&self.counters.dropped);
                        debug!("reservoir full; frame dropped");
                    }
                }
                Ok(None) => {
                    Counters::bump(&self.counters.empty_reads);
                    debug!("no frame available");
                    thread::sleep(self.poll);
                }
                Err(e) => {
                    Counters::bump(&self.counters.empty_reads);
                    warn!(error = %e, "frame read failed");
                    thread::sleep(self.poll);
                }
            }
        }
        debug!("capture worker stopped");
        self.source
    }
}

struct ProcessingWorker {
    engine: EventGenerator,
    reader: ReservoirReader<ColorFrame>,
    config: SharedConfig,
    sink: Arc<dyn DisplaySink>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    poll: Duration,
}

impl ProcessingWorker {
    fn run(mut self) -> EventGenerator {
        debug!("processing worker started");
        let started = Instant::now();
        let mut window = RateWindow::new(RATE_WINDOW, started);
        let mut event_rate = EventRate::new(started);

        while self.running.load(Ordering::Acquire) {
            let frame = match self.reader.take(self.poll) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(closed) => {
                    warn!(error = %closed, "capture worker is gone; processing stops");
                    break;
                }
            };

            match process_frame(&mut self.engine, frame, &self.config.get()) {
                Ok(update) => {
                    let now = Instant::now();
                    let events = update.events;
                    let rate = event_rate.record(events, now);
                    Counters::bump(&self.counters.processed);
                    self.counters
                        .events
                        .fetch_add(events as u64, Ordering::Relaxed);
                    Counters::store_f64(&self.counters.event_rate_bits, rate);

                    if let Some(fps) = window.tick(now) {
                        Counters::store_f64(&self.counters.capture_rate_bits, fps);
                        debug!(fps, "capture rate updated");
                    }

                    self.sink.deliver(DisplayUpdate {
                        frame: update.frame,
                        event_image: update.event_image,
                        event_rate: rate,
                    });
                }
                Err(e) => {
                    Counters::bump(&self.counters.failed);
                    warn!(error = %e, "frame processing failed");
                }
            }
        }
        debug!("processing worker stopped");
        self.engine
    }
}

struct Processed {
    frame: ColorFrame,
    event_image: ColorFrame,
    events: usize,
}

/// Conforms one captured frame to the engine and generates its events.
fn process_frame(
    engine: &mut EventGenerator,
    frame: ColorFrame,
    config: &EventConfig,
) -> Result<Processed, FrameError> {
    let frame = if frame.resolution() == engine.resolution() {
        frame
    } else {
        imgproc::resize_color(&frame, engine.resolution())?
    };
    let gray = imgproc::to_gray(&frame)?;
    let generated = engine.generate(&gray, config)?;
    Ok(Processed {
        frame,
        events: generated.events.len(),
        event_image: generated.image,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceError, SyntheticSource};
    use crate::types::{Resolution, Rgb};
    use std::sync::Mutex;

    const RES: Resolution = Resolution::new(64, 36);

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_reservoir_drops_overflow_and_keeps_order() {
        let capacity = 5;
        let extra = 3;
        let (writer, reader) = Reservoir::bounded(capacity);

        let admitted: Vec<bool> = (0..capacity + extra).map(|i| writer.offer(i)).collect();
        let dropped = admitted.iter().filter(|a| !**a).count();
        assert_eq!(dropped, extra);
        assert_eq!(writer.len(), capacity);

        let drained: Vec<usize> = std::iter::from_fn(|| reader.try_take()).collect();
        assert_eq!(drained, (0..capacity).collect::<Vec<_>>());
    }

    #[test]
    fn test_rate_window_updates_once_per_window() {
        let t0 = Instant::now();
        let mut window = RateWindow::new(Duration::from_secs(1), t0);
        for i in 1..10 {
            assert!(window.tick(t0 + Duration::from_millis(i * 100)).is_none());
        }
        let rate = window.tick(t0 + Duration::from_secs(1)).unwrap();
        assert!((rate - 10.0).abs() < 1e-9);
        assert!(window.tick(t0 + Duration::from_millis(1100)).is_none());
    }

    #[test]
    fn test_event_rate_uses_time_since_previous_emission() {
        let t0 = Instant::now();
        let mut rate = EventRate::new(t0);
        let r1 = rate.record(100, t0 + Duration::from_millis(500));
        assert!((r1 - 200.0).abs() < 1e-9);
        let r2 = rate.record(30, t0 + Duration::from_millis(600));
        assert!((r2 - 300.0).abs() < 1e-6);
        // Same instant: denominator floored at 1 ms
        let r3 = rate.record(1, t0 + Duration::from_millis(600));
        assert!((r3 - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_shared_config_updates_are_visible() {
        let shared = SharedConfig::new(EventConfig::default());
        let reader = shared.clone();
        shared.update(|c| c.threshold = 40);
        assert_eq!(reader.get().threshold, 40);
    }

    #[test]
    fn test_process_frame_resizes_and_generates() {
        let mut engine = EventGenerator::new(RES);
        let config = EventConfig::default();
        let big = ColorFrame::filled(Resolution::new(128, 72), Rgb::BLACK);
        let out = process_frame(&mut engine, big, &config).unwrap();
        assert_eq!(out.frame.resolution(), RES);
        assert_eq!(out.event_image.resolution(), RES);
        assert_eq!(out.events, 0);
        assert!(engine.previous_frame().is_some());
    }

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<f64>>,
    }

    impl DisplaySink for RecordingSink {
        fn deliver(&self, update: DisplayUpdate) {
            self.updates.lock().unwrap().push(update.event_rate);
        }
    }

    #[test]
    fn test_pipeline_runs_and_restarts() {
        let recorder = Arc::new(RecordingSink::default());
        let source = SyntheticSource::new(RES);
        let mut pipeline = AcquisitionPipeline::new(
            Box::new(source),
            EventGenerator::new(RES),
            SharedConfig::new(EventConfig::default()),
            recorder.clone(),
            PipelineOptions::default(),
        );
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.start().unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(wait_until(Duration::from_secs(5), || pipeline.stats().processed >= 3));
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let engine = pipeline.engine().unwrap();
        assert!(engine.previous_frame().is_some());
        let logged = pipeline.log().len();
        assert!(logged > 0);

        pipeline.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || pipeline.log().len() > logged));
        pipeline.stop().unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.events as usize, pipeline.log().len());
        assert!(!recorder.updates.lock().unwrap().is_empty());
        assert!(pipeline.close().unwrap().is_some());
    }

    /// Fails every other read and yields an undersized frame now and then.
    struct FlakySource {
        inner: SyntheticSource,
        reads: u64,
    }

    impl FrameSource for FlakySource {
        fn next_frame(&mut self) -> Result<Option<ColorFrame>, SourceError> {
            self.reads += 1;
            match self.reads % 4 {
                0 => Err(SourceError::NoFrames("flaky".into())),
                1 => Ok(None),
                2 => Ok(Some(ColorFrame::filled(Resolution::new(0, 0), Rgb::WHITE))),
                _ => self.inner.next_frame(),
            }
        }

        fn set_resolution(&mut self, resolution: Resolution) {
            self.inner.set_resolution(resolution);
        }

        fn resolution(&self) -> Resolution {
            self.inner.resolution()
        }
    }

    #[test]
    fn test_pipeline_survives_read_and_processing_failures() {
        let source = FlakySource {
            inner: SyntheticSource::new(RES),
            reads: 0,
        };
        let mut pipeline = AcquisitionPipeline::new(
            Box::new(source),
            EventGenerator::new(RES),
            SharedConfig::default(),
            Arc::new(DiscardSink),
            PipelineOptions {
                poll_interval: Duration::from_millis(1),
                ..PipelineOptions::default()
            },
        );

        pipeline.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            let stats = pipeline.stats();
            stats.processed >= 3 && stats.failed >= 1 && stats.empty_reads >= 2
        }));
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_channel_sink_discards_when_full() {
        let (tx, rx) = bounded(1);
        let update = DisplayUpdate {
            frame: ColorFrame::filled(RES, Rgb::BLACK),
            event_image: ColorFrame::filled(RES, Rgb::WHITE),
            event_rate: 1.0,
        };
        tx.deliver(update.clone());
        tx.deliver(DisplayUpdate {
            event_rate: 2.0,
            ..update
        });
        assert_eq!(rx.try_recv().unwrap().event_rate, 1.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reservoir_reports_closed_writer() {
        let (writer, reader) = Reservoir::bounded(2);
        assert_eq!(reader.take(Duration::from_millis(1)), Ok(None));
        assert!(writer.offer(7));
        drop(writer);

        // Items already admitted are still delivered
        assert_eq!(reader.take(Duration::from_millis(1)), Ok(Some(7)));
        let started = Instant::now();
        assert_eq!(reader.take(Duration::from_secs(5)), Err(ReservoirClosed));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    struct PanickingSource;

    impl FrameSource for PanickingSource {
        fn next_frame(&mut self) -> Result<Option<ColorFrame>, SourceError> {
            panic!("capture device unplugged");
        }

        fn set_resolution(&mut self, _resolution: Resolution) {}

        fn resolution(&self) -> Resolution {
            RES
        }
    }

    #[test]
    fn test_processing_worker_exits_when_capture_dies() {
        let mut pipeline = AcquisitionPipeline::new(
            Box::new(PanickingSource),
            EventGenerator::new(RES),
            SharedConfig::default(),
            Arc::new(DiscardSink),
            PipelineOptions::default(),
        );
        pipeline.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            pipeline
                .processor
                .as_ref()
                .is_some_and(|handle| handle.is_finished())
        }));

        assert!(matches!(
            pipeline.stop(),
            Err(PipelineError::WorkerPanicked("capture"))
        ));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline.engine().is_some());
    }
}
