//! Bounded-timeout frame polling loop.
//!
//! The loop makes exactly `frame_count` poll attempts unless it is stopped or
//! hits a fatal device error. Timeouts and empty reads are counted and
//! skipped. Every delivered frame gets a reconstructed exposure window and a
//! header, then moves into the write-back sink. Whatever happens, capture is
//! stopped and the sink drained before `run` returns.

use super::timestamps::{TimestampChain, TimestampPolicy};
use super::{check_physical, CaptureConfig, CaptureError, RunMetrics};
use crate::camera_interface::{
    CapabilityInfo, ControlKind, DeviceHandle, Polled, SensorDriver,
};
use crate::frame_writer::{build_header, FrameRecord, HeaderContext, WriteBackSink};
use crate::image_size::ImageSize;
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default bound on a single frame poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Observable state of the capture loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Polling,
    FrameReady,
    FrameTimeout,
    EmptyRead,
    Fatal,
}

impl CaptureState {
    /// States entered once per poll
    fn is_per_frame(&self) -> bool {
        matches!(
            self,
            CaptureState::Polling
                | CaptureState::FrameReady
                | CaptureState::FrameTimeout
                | CaptureState::EmptyRead
        )
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Capturing => "capturing",
            CaptureState::Polling => "polling",
            CaptureState::FrameReady => "frame-ready",
            CaptureState::FrameTimeout => "frame-timeout",
            CaptureState::EmptyRead => "empty-read",
            CaptureState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Per-run loop parameters
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub frame_count: u64,
    pub poll_timeout: Duration,
    pub timestamp_policy: TimestampPolicy,
    /// Written as INSTRUME
    pub instrument: String,
    /// Unbinned pixel pitch in microns
    pub pixel_size_um: f64,
    /// Checked once per iteration; setting it ends the run early
    pub stop_signal: Option<Arc<AtomicBool>>,
}

impl LoopSettings {
    pub fn new(frame_count: u64, instrument: impl Into<String>, pixel_size_um: f64) -> Self {
        Self {
            frame_count,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            timestamp_policy: TimestampPolicy::default(),
            instrument: instrument.into(),
            pixel_size_um,
            stop_signal: None,
        }
    }

    /// Settings with the instrument name and pixel pitch taken from the device
    pub fn for_device(frame_count: u64, capability: &CapabilityInfo) -> Self {
        Self::new(frame_count, capability.name.clone(), capability.pixel_size_um)
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_timestamp_policy(mut self, policy: TimestampPolicy) -> Self {
        self.timestamp_policy = policy;
        self
    }

    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop_signal = Some(stop);
        self
    }
}

/// Drives one capture run over an opened, configured device
#[derive(Debug)]
pub struct CaptureLoop {
    settings: LoopSettings,
    state: CaptureState,
}

/// Values fixed for the whole run
struct RunPlan<'a> {
    config: &'a CaptureConfig,
    size: ImageSize,
    timeout_ms: u32,
    context: HeaderContext,
}

impl CaptureLoop {
    pub fn new(settings: LoopSettings) -> Self {
        Self {
            settings,
            state: CaptureState::Idle,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    fn transition(&mut self, next: CaptureState) {
        if self.state == next {
            return;
        }
        if next.is_per_frame() && self.state.is_per_frame() {
            debug!("Capture state {} -> {}", self.state, next);
        } else {
            info!("Capture state {} -> {}", self.state, next);
        }
        self.state = next;
    }

    fn stop_requested(&self) -> bool {
        self.settings
            .stop_signal
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::SeqCst))
    }

    /// Run the capture with an already applied `config`.
    ///
    /// `config` must be the effective configuration returned by
    /// [`ControlManager::configure`](super::ControlManager::configure).
    pub fn run<D: SensorDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        handle: DeviceHandle,
        config: &CaptureConfig,
        sink: WriteBackSink,
    ) -> Result<RunMetrics, CaptureError> {
        let mut metrics = RunMetrics::new(self.settings.frame_count);

        let Some(size) = config.region.dimensions() else {
            sink.drain();
            return Err(CaptureError::Capture(
                "capture needs a configuration with explicit region dimensions".to_string(),
            ));
        };
        let plan = RunPlan {
            config,
            size,
            timeout_ms: u32::try_from(self.settings.poll_timeout.as_millis()).unwrap_or(u32::MAX),
            context: HeaderContext {
                instrument: self.settings.instrument.clone(),
                pixel_size_um: self.settings.pixel_size_um,
                target_temperature_c: config
                    .cooler_enabled
                    .then_some(config.target_temperature_c),
            },
        };

        self.transition(CaptureState::Idle);
        if let Err(e) = driver.start_capture(handle) {
            self.transition(CaptureState::Fatal);
            sink.drain();
            return Err(CaptureError::fatal("start capture", e));
        }
        self.transition(CaptureState::Capturing);
        info!(
            "Capturing {} frames of {} {} at {} us ({} timestamps)",
            self.settings.frame_count,
            size,
            config.pixel_format,
            config.exposure_us,
            self.settings.timestamp_policy
        );

        let started = Instant::now();
        let outcome = self.acquire(driver, handle, &plan, &sink, &mut metrics);
        metrics.elapsed_acquisition = started.elapsed();

        if let Err(e) = driver.stop_capture(handle) {
            warn!("Stop capture on {} failed: {}", handle, e);
        }
        match driver.get_dropped_frame_count(handle) {
            Ok(dropped) => metrics.frames_dropped = dropped,
            Err(e) => warn!("Could not read dropped frame counter: {}", e),
        }

        debug!("Waiting for write-back to finish");
        metrics.merge_write_stats(sink.drain());

        match outcome {
            Ok(()) => {
                self.transition(CaptureState::Idle);
                info!(
                    "Run complete: {} captured, {} written, {} dropped by driver",
                    metrics.frames_captured, metrics.frames_written, metrics.frames_dropped
                );
                Ok(metrics)
            }
            Err(e) => {
                self.transition(CaptureState::Fatal);
                error!(
                    "Run aborted after {} polls ({} written): {}",
                    metrics.poll_attempts, metrics.frames_written, e
                );
                Err(e)
            }
        }
    }

    fn acquire<D: SensorDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        handle: DeviceHandle,
        plan: &RunPlan<'_>,
        sink: &WriteBackSink,
        metrics: &mut RunMetrics,
    ) -> Result<(), CaptureError> {
        let config = plan.config;
        let mut chain = TimestampChain::new(Utc::now(), config.exposure_us);
        let mut sequence = 0u64;
        let mut drops_seen = 0u64;

        for attempt in 0..self.settings.frame_count {
            if self.stop_requested() {
                info!("Stop requested after {} polls", attempt);
                break;
            }

            self.transition(CaptureState::Polling);
            metrics.poll_attempts += 1;
            let polled = driver.poll_frame(handle, plan.size, config.pixel_format, plan.timeout_ms);

            match polled {
                Ok(Polled::Frame(pixel_buffer)) => {
                    self.transition(CaptureState::FrameReady);
                    let sensor_temperature_c = read_temperature(driver, handle)?;

                    if self.settings.timestamp_policy == TimestampPolicy::ResyncOnDrop {
                        match driver.get_dropped_frame_count(handle) {
                            Ok(dropped) if dropped > drops_seen => {
                                debug!("Skipping {} dropped exposures", dropped - drops_seen);
                                chain.skip(dropped - drops_seen);
                                drops_seen = dropped;
                            }
                            Ok(_) => {}
                            Err(e) if e.is_fatal() => {
                                return Err(CaptureError::fatal("dropped frame counter", e))
                            }
                            Err(e) => warn!("Could not read dropped frame counter: {}", e),
                        }
                    }

                    let record = FrameRecord {
                        sequence,
                        size: plan.size,
                        pixel_format: config.pixel_format,
                        pixel_buffer,
                        window: chain.next_window(),
                        sensor_temperature_c,
                        start_x: config.region.x,
                        start_y: config.region.y,
                        binning: config.binning,
                        gain: config.gain,
                        exposure_us: config.exposure_us,
                    };
                    let header = build_header(&record, &plan.context);
                    debug!("Frame {} ready on poll {}", sequence, attempt);

                    sink.submit(record, header);
                    metrics.frames_captured += 1;
                    sequence += 1;
                }
                Ok(Polled::Timeout) => {
                    self.transition(CaptureState::FrameTimeout);
                    metrics.poll_timeouts += 1;
                    warn!("Poll {} timed out after {} ms", attempt, plan.timeout_ms);
                }
                Ok(Polled::Empty) => {
                    self.transition(CaptureState::EmptyRead);
                    metrics.empty_reads += 1;
                    debug!("Poll {} returned no data", attempt);
                }
                Err(e) if e.is_fatal() => {
                    return Err(CaptureError::fatal(format!("poll {attempt}"), e));
                }
                Err(e) => {
                    self.transition(CaptureState::EmptyRead);
                    metrics.empty_reads += 1;
                    warn!("Poll {} failed: {}", attempt, e);
                }
            }
        }
        Ok(())
    }
}

/// Read the sensor temperature in degrees Celsius.
///
/// A failed read is logged and yields `None`; an implausible value is fatal.
fn read_temperature<D: SensorDriver + ?Sized>(
    driver: &mut D,
    handle: DeviceHandle,
) -> Result<Option<f64>, CaptureError> {
    let kind = ControlKind::SensorTemperature;
    match driver.get_control(handle, kind) {
        Ok(raw) => {
            let raw = check_physical(kind, raw)?;
            Ok(kind.raw_to_celsius(raw))
        }
        Err(e) if e.is_fatal() => Err(CaptureError::fatal("temperature read", e)),
        Err(e) => {
            warn!("Temperature read failed: {}", e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::mock::{DriverCall, MockSensor, PollScript};
    use crate::camera_interface::DeviceError;
    use crate::capture::{open_camera, ControlManager, Region};
    use crate::frame_writer::test_support::RecordingEncoder;
    use crate::frame_writer::{FrameHeader, HeaderValue, OutputLayout};

    struct Rig {
        sensor: MockSensor,
        handle: DeviceHandle,
        config: CaptureConfig,
        settings: LoopSettings,
    }

    fn rig(sensor: MockSensor, frames: u64) -> Rig {
        let mut sensor = sensor;
        let handle = open_camera(&mut sensor, None).unwrap();
        let mut manager = ControlManager::new();
        let desired = CaptureConfig {
            region: Region::explicit(0, 0, 400, 400),
            binning: 2,
            exposure_us: 20_000,
            ..CaptureConfig::default()
        };
        let config = manager.configure(&mut sensor, handle, &desired).unwrap();
        let settings = LoopSettings::for_device(frames, manager.cached_capability().unwrap());
        Rig {
            sensor,
            handle,
            config,
            settings,
        }
    }

    fn run(rig: &mut Rig) -> (Result<RunMetrics, CaptureError>, Arc<RecordingEncoder>) {
        let encoder = Arc::new(RecordingEncoder::default());
        let sink = WriteBackSink::synchronous(encoder.clone(), OutputLayout::new("out"));
        let result = CaptureLoop::new(rig.settings.clone()).run(
            &mut rig.sensor,
            rig.handle,
            &rig.config,
            sink,
        );
        (result, encoder)
    }

    fn headers(encoder: &RecordingEncoder) -> Vec<FrameHeader> {
        let mut written = encoder.written.lock().unwrap().clone();
        written.sort_by(|a, b| a.0.cmp(&b.0));
        written.into_iter().map(|(_, h)| h).collect()
    }

    fn string_key(header: &FrameHeader, key: &str) -> String {
        match header.get(key) {
            Some(HeaderValue::Str(s)) => s.clone(),
            other => panic!("{key} is {other:?}"),
        }
    }

    #[test]
    fn test_all_frames_captured() {
        let mut rig = rig(MockSensor::new(), 20);
        let (result, encoder) = run(&mut rig);
        let metrics = result.unwrap();

        assert_eq!(metrics.poll_attempts, 20);
        assert_eq!(metrics.frames_captured, 20);
        assert_eq!(metrics.frames_written, 20);
        assert_eq!(metrics.frames_dropped, 0);
        assert_eq!(metrics.last_written_sequence, Some(19));
        assert_eq!(encoder.written_paths().len(), 20);
        assert!(!rig.sensor.is_capturing());
    }

    #[test]
    fn test_exposure_windows_chain() {
        let mut rig = rig(MockSensor::new(), 10);
        let (result, encoder) = run(&mut rig);
        result.unwrap();

        let headers = headers(&encoder);
        for pair in headers.windows(2) {
            assert_eq!(string_key(&pair[1], "DATE-OBS"), string_key(&pair[0], "DATE-END"));
        }
        for header in &headers {
            assert_eq!(header.get("EXPOUS"), Some(&HeaderValue::Int(20_000)));
        }
    }

    #[test]
    fn test_timeouts_are_skipped() {
        let mut rig = rig(MockSensor::new().timeouts_at(&[4, 5]), 12);
        let (result, _) = run(&mut rig);
        let metrics = result.unwrap();

        assert_eq!(metrics.poll_attempts, 12);
        assert_eq!(rig.sensor.poll_count(), 12);
        assert_eq!(metrics.poll_timeouts, 2);
        assert_eq!(metrics.frames_captured, 10);
        assert_eq!(metrics.last_written_sequence, Some(9));
    }

    #[test]
    fn test_empty_reads_and_soft_errors_counted() {
        let sensor = MockSensor::new()
            .poll_outcome(1, PollScript::Empty)
            .poll_outcome(
                3,
                PollScript::Fail(DeviceError::Communication("usb stall".to_string())),
            );
        let mut rig = rig(sensor, 6);
        let metrics = run(&mut rig).0.unwrap();
        assert_eq!(metrics.empty_reads, 2);
        assert_eq!(metrics.frames_captured, 4);
    }

    #[test]
    fn test_fatal_poll_stops_capture_and_drains() {
        let sensor = MockSensor::new().poll_outcome(3, PollScript::Fail(DeviceError::CameraRemoved));
        let mut rig = rig(sensor, 10);
        let (result, encoder) = run(&mut rig);

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FatalDevice {
                source: DeviceError::CameraRemoved,
                ..
            }
        ));
        assert_eq!(rig.sensor.poll_count(), 4);
        assert_eq!(encoder.written_paths().len(), 3);
        assert_eq!(rig.sensor.calls().last(), Some(&DriverCall::GetDroppedFrames));
        assert!(rig.sensor.calls().contains(&DriverCall::StopCapture));
    }

    #[test]
    fn test_stop_signal_ends_run() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut rig = rig(MockSensor::new(), 10);
        rig.settings = rig.settings.clone().with_stop_signal(stop);
        let metrics = run(&mut rig).0.unwrap();

        assert_eq!(metrics.poll_attempts, 0);
        assert!(rig.sensor.calls().contains(&DriverCall::StopCapture));
    }

    #[test]
    fn test_driver_drop_counter_reported() {
        let mut rig = rig(MockSensor::new().drops_at(2, 3), 5);
        let metrics = run(&mut rig).0.unwrap();
        assert_eq!(metrics.frames_dropped, 3);
        assert_eq!(metrics.frames_captured, 5);
    }

    #[test]
    fn test_resync_on_drop_leaves_gap() {
        let mut rig = rig(MockSensor::new().drops_at(2, 3), 4);
        rig.settings = rig
            .settings
            .clone()
            .with_timestamp_policy(TimestampPolicy::ResyncOnDrop);
        let (result, encoder) = run(&mut rig);
        result.unwrap();

        let headers = headers(&encoder);
        assert_eq!(string_key(&headers[1], "DATE-OBS"), string_key(&headers[0], "DATE-END"));
        assert_ne!(string_key(&headers[2], "DATE-OBS"), string_key(&headers[1], "DATE-END"));
    }

    #[test]
    fn test_temperature_in_header() {
        let mut rig = rig(MockSensor::new().sensor_temperature(-15.3), 1);
        let (result, encoder) = run(&mut rig);
        result.unwrap();
        match headers(&encoder)[0].get("CCD-TEMP") {
            Some(HeaderValue::Float(t)) => approx::assert_relative_eq!(*t, -15.3),
            other => panic!("unexpected CCD-TEMP {other:?}"),
        }
    }

    #[test]
    fn test_implausible_temperature_is_fatal() {
        let mut rig = rig(MockSensor::new(), 3);
        rig.sensor = std::mem::take(&mut rig.sensor).readback(ControlKind::SensorTemperature, 5_000);
        let (result, _) = run(&mut rig);
        assert!(matches!(
            result,
            Err(CaptureError::ReadbackOutOfRange {
                control: ControlKind::SensorTemperature,
                ..
            })
        ));
        assert!(rig.sensor.calls().contains(&DriverCall::StopCapture));
    }

    #[test]
    fn test_start_failure_is_fatal() {
        let sensor = MockSensor::new().fail_start(DeviceError::CameraRemoved);
        let mut rig = rig(sensor, 5);
        let encoder = Arc::new(RecordingEncoder::default());
        let sink = WriteBackSink::synchronous(encoder.clone(), OutputLayout::new("out"));
        let mut capture = CaptureLoop::new(rig.settings.clone());

        let err = capture
            .run(&mut rig.sensor, rig.handle, &rig.config, sink)
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FatalDevice {
                source: DeviceError::CameraRemoved,
                ..
            }
        ));
        assert_eq!(capture.state(), CaptureState::Fatal);
        assert_eq!(rig.sensor.poll_count(), 0);
        assert!(encoder.written_paths().is_empty());
    }

    #[test]
    fn test_unresolved_region_rejected() {
        let mut rig = rig(MockSensor::new(), 3);
        rig.config.region = Region::full_frame();
        let (result, _) = run(&mut rig);
        assert!(matches!(result, Err(CaptureError::Capture(_))));
        assert_eq!(rig.sensor.poll_count(), 0);
    }
}
