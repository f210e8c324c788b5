//! In-process sensor driver with scripted behaviour.
//!
//! `MockSensor` behaves like a single cooled mono camera. Poll outcomes,
//! driver-side frame drops and control read-backs can be scripted per
//! iteration, and every driver call is recorded for later inspection.

use super::{
    CameraId, CapabilityInfo, ControlCaps, ControlKind, DeviceError, DeviceHandle, DeviceResult,
    PixelFormat, Polled, RegionFormat, SensorDriver,
};
use crate::image_size::ImageSize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Scripted result for one poll attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollScript {
    Frame,
    Timeout,
    Empty,
    Fail(DeviceError),
}

/// A driver call as observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Enumerate,
    Open(CameraId),
    Init,
    Close,
    GetCapability,
    GetControl(ControlKind),
    SetControl(ControlKind, i64),
    SetRegion(RegionFormat),
    GetRegion,
    SetOffset(u32, u32),
    GetOffset,
    StartCapture,
    StopCapture,
    Poll,
    GetDroppedFrames,
}

/// Capability set of the default mock camera (a cooled 4144x2822 mono sensor)
pub fn default_capability() -> CapabilityInfo {
    let mut controls = BTreeMap::new();
    controls.insert(ControlKind::Gain, ControlCaps::new(0, 570, 200, true));
    controls.insert(
        ControlKind::Exposure,
        ControlCaps::new(32, 2_000_000_000, 10_000, true),
    );
    controls.insert(ControlKind::Offset, ControlCaps::new(0, 80, 8, true));
    controls.insert(
        ControlKind::BandwidthOverload,
        ControlCaps::new(40, 100, 50, true),
    );
    controls.insert(ControlKind::HighSpeedMode, ControlCaps::new(0, 1, 0, true));
    controls.insert(ControlKind::HardwareBin, ControlCaps::new(0, 1, 0, true));
    controls.insert(ControlKind::CoolerOn, ControlCaps::new(0, 1, 0, true));
    controls.insert(
        ControlKind::TargetTemperature,
        ControlCaps::new(-40, 30, 0, true),
    );
    controls.insert(
        ControlKind::SensorTemperature,
        ControlCaps::new(-500, 1000, 200, false),
    );
    controls.insert(
        ControlKind::CoolerPowerPercent,
        ControlCaps::new(0, 100, 0, false),
    );

    CapabilityInfo {
        name: "Mock ASI294MM Pro".to_string(),
        max_width: 4144,
        max_height: 2822,
        pixel_size_um: 4.63,
        supported_bins: vec![1, 2, 3, 4],
        supported_formats: vec![PixelFormat::Raw8, PixelFormat::Raw16, PixelFormat::Y8],
        roi_alignment: 8,
        has_cooler: true,
        is_color: false,
        bit_depth: 14,
        controls,
    }
}

/// Scriptable in-memory sensor driver
#[derive(Debug)]
pub struct MockSensor {
    serial: String,
    capability: CapabilityInfo,
    opened: Option<DeviceHandle>,
    initialized: bool,
    capturing: bool,
    controls: BTreeMap<ControlKind, i64>,
    region: RegionFormat,
    offset: (u32, u32),
    poll_script: HashMap<u64, PollScript>,
    readback_overrides: HashMap<ControlKind, i64>,
    region_override: Option<RegionFormat>,
    offset_override: Option<(u32, u32)>,
    start_failure: Option<DeviceError>,
    drops_at_poll: HashMap<u64, u64>,
    polls: u64,
    frames_delivered: u64,
    dropped_frames: u64,
    realtime: bool,
    calls: Vec<DriverCall>,
}

impl MockSensor {
    /// Create a mock camera with [`default_capability`]
    pub fn new() -> Self {
        Self::with_capability(default_capability())
    }

    pub fn with_capability(capability: CapabilityInfo) -> Self {
        let controls = capability
            .controls
            .iter()
            .map(|(kind, caps)| (*kind, caps.default))
            .collect();
        let region = RegionFormat {
            size: capability.max_size(),
            binning: 1,
            format: capability
                .supported_formats
                .first()
                .copied()
                .unwrap_or(PixelFormat::Raw8),
        };

        Self {
            serial: "1f2f190206070900".to_string(),
            capability,
            opened: None,
            initialized: false,
            capturing: false,
            controls,
            region,
            offset: (0, 0),
            poll_script: HashMap::new(),
            readback_overrides: HashMap::new(),
            region_override: None,
            offset_override: None,
            start_failure: None,
            drops_at_poll: HashMap::new(),
            polls: 0,
            frames_delivered: 0,
            dropped_frames: 0,
            realtime: false,
            calls: Vec::new(),
        }
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = serial.to_string();
        self
    }

    /// Script the outcome of the poll with zero-based index `poll_index`
    pub fn poll_outcome(mut self, poll_index: u64, outcome: PollScript) -> Self {
        self.poll_script.insert(poll_index, outcome);
        self
    }

    /// Time out on each of the given poll indices
    pub fn timeouts_at(mut self, indices: &[u64]) -> Self {
        for &index in indices {
            self.poll_script.insert(index, PollScript::Timeout);
        }
        self
    }

    /// Report `count` additional driver-side drops when poll `poll_index` runs
    pub fn drops_at(mut self, poll_index: u64, count: u64) -> Self {
        *self.drops_at_poll.entry(poll_index).or_insert(0) += count;
        self
    }

    /// Force `get_control` to return `value` regardless of what was written
    pub fn readback(mut self, kind: ControlKind, value: i64) -> Self {
        self.readback_overrides.insert(kind, value);
        self
    }

    /// Report `region` from `get_region` instead of the applied one
    pub fn region_readback(mut self, region: RegionFormat) -> Self {
        self.region_override = Some(region);
        self
    }

    /// Report `(x, y)` from `get_offset` instead of the applied one
    pub fn offset_readback(mut self, x: u32, y: u32) -> Self {
        self.offset_override = Some((x, y));
        self
    }

    /// Fail every `start_capture` call with `error`
    pub fn fail_start(mut self, error: DeviceError) -> Self {
        self.start_failure = Some(error);
        self
    }

    /// Sensor temperature reported through [`ControlKind::SensorTemperature`]
    pub fn sensor_temperature(mut self, celsius: f64) -> Self {
        self.controls
            .insert(ControlKind::SensorTemperature, (celsius * 10.0).round() as i64);
        self
    }

    /// Sleep for the configured exposure on every delivered frame
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Every driver call made so far, in order
    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn poll_count(&self) -> u64 {
        self.polls
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Raw value currently stored for a control
    pub fn control_value(&self, kind: ControlKind) -> Option<i64> {
        self.controls.get(&kind).copied()
    }

    fn check(&self, handle: DeviceHandle) -> DeviceResult<()> {
        match self.opened {
            Some(open) if open == handle => Ok(()),
            _ => Err(DeviceError::InvalidHandle),
        }
    }

    fn check_ready(&self, handle: DeviceHandle) -> DeviceResult<()> {
        self.check(handle)?;
        if !self.initialized {
            return Err(DeviceError::InvalidState("camera not initialized".to_string()));
        }
        Ok(())
    }

    fn frame_bytes(&self, size: ImageSize, format: PixelFormat) -> Vec<u8> {
        let seed = self.frames_delivered as usize;
        (0..size.buffer_len(format))
            .map(|i| (seed.wrapping_add(i) & 0xff) as u8)
            .collect()
    }
}

impl Default for MockSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorDriver for MockSensor {
    fn sdk_version(&self) -> String {
        "1.31 (mock)".to_string()
    }

    fn enumerate(&mut self) -> DeviceResult<HashMap<String, CameraId>> {
        self.calls.push(DriverCall::Enumerate);
        Ok(HashMap::from([(self.serial.clone(), CameraId(0))]))
    }

    fn open(&mut self, id: CameraId) -> DeviceResult<DeviceHandle> {
        self.calls.push(DriverCall::Open(id));
        if id != CameraId(0) {
            return Err(DeviceError::NotFound(format!("camera id {}", id.0)));
        }
        let handle = DeviceHandle(id.0);
        self.opened = Some(handle);
        Ok(handle)
    }

    fn init(&mut self, handle: DeviceHandle) -> DeviceResult<()> {
        self.calls.push(DriverCall::Init);
        self.check(handle)?;
        self.initialized = true;
        Ok(())
    }

    fn close(&mut self, handle: DeviceHandle) -> DeviceResult<()> {
        self.calls.push(DriverCall::Close);
        self.check(handle)?;
        self.opened = None;
        self.initialized = false;
        self.capturing = false;
        Ok(())
    }

    fn get_capability(&mut self, handle: DeviceHandle) -> DeviceResult<CapabilityInfo> {
        self.calls.push(DriverCall::GetCapability);
        self.check(handle)?;
        Ok(self.capability.clone())
    }

    fn get_control(&mut self, handle: DeviceHandle, control: ControlKind) -> DeviceResult<i64> {
        self.calls.push(DriverCall::GetControl(control));
        self.check_ready(handle)?;
        if let Some(value) = self.readback_overrides.get(&control) {
            return Ok(*value);
        }
        self.controls
            .get(&control)
            .copied()
            .ok_or_else(|| DeviceError::Rejected {
                control: control.name().to_string(),
                reason: "control not supported".to_string(),
            })
    }

    fn set_control(
        &mut self,
        handle: DeviceHandle,
        control: ControlKind,
        value: i64,
    ) -> DeviceResult<()> {
        self.calls.push(DriverCall::SetControl(control, value));
        self.check_ready(handle)?;
        let caps = self
            .capability
            .control(control)
            .copied()
            .ok_or_else(|| DeviceError::Rejected {
                control: control.name().to_string(),
                reason: "control not supported".to_string(),
            })?;
        if !caps.writable {
            return Err(DeviceError::Rejected {
                control: control.name().to_string(),
                reason: "control is read only".to_string(),
            });
        }
        self.controls.insert(control, caps.clamp(value));
        Ok(())
    }

    fn set_region(
        &mut self,
        handle: DeviceHandle,
        size: ImageSize,
        binning: u32,
        format: PixelFormat,
    ) -> DeviceResult<()> {
        let requested = RegionFormat {
            size,
            binning,
            format,
        };
        self.calls.push(DriverCall::SetRegion(requested));
        self.check_ready(handle)?;
        if self.capturing {
            return Err(DeviceError::InvalidState("region change while capturing".to_string()));
        }

        let reject = |reason: String| DeviceError::Rejected {
            control: "ROI".to_string(),
            reason,
        };
        if !self.capability.supported_bins.contains(&binning) {
            return Err(reject(format!("unsupported binning {binning}")));
        }
        if !self.capability.supported_formats.contains(&format) {
            return Err(reject(format!("unsupported format {format}")));
        }
        if !size.is_aligned(self.capability.roi_alignment) {
            return Err(reject(format!("{size} is not aligned")));
        }
        let fits = |extent: u32, max: u32| extent.checked_mul(binning).is_some_and(|px| px <= max);
        if !fits(size.width, self.capability.max_width)
            || !fits(size.height, self.capability.max_height)
        {
            return Err(reject(format!("{size} at bin {binning} exceeds sensor")));
        }

        self.region = requested;
        self.offset = (0, 0);
        Ok(())
    }

    fn get_region(&mut self, handle: DeviceHandle) -> DeviceResult<RegionFormat> {
        self.calls.push(DriverCall::GetRegion);
        self.check_ready(handle)?;
        Ok(self.region_override.unwrap_or(self.region))
    }

    fn set_offset(&mut self, handle: DeviceHandle, x: u32, y: u32) -> DeviceResult<()> {
        self.calls.push(DriverCall::SetOffset(x, y));
        self.check_ready(handle)?;
        let binned_width = self.capability.max_width / self.region.binning;
        let binned_height = self.capability.max_height / self.region.binning;
        let fits = |start: u32, extent: u32, max: u32| {
            start.checked_add(extent).is_some_and(|end| end <= max)
        };
        if !fits(x, self.region.size.width, binned_width)
            || !fits(y, self.region.size.height, binned_height)
        {
            return Err(DeviceError::Rejected {
                control: "StartPos".to_string(),
                reason: format!("offset ({x}, {y}) places ROI outside the sensor"),
            });
        }
        self.offset = (x, y);
        Ok(())
    }

    fn get_offset(&mut self, handle: DeviceHandle) -> DeviceResult<(u32, u32)> {
        self.calls.push(DriverCall::GetOffset);
        self.check_ready(handle)?;
        Ok(self.offset_override.unwrap_or(self.offset))
    }

    fn start_capture(&mut self, handle: DeviceHandle) -> DeviceResult<()> {
        self.calls.push(DriverCall::StartCapture);
        self.check_ready(handle)?;
        if let Some(error) = self.start_failure.clone() {
            return Err(error);
        }
        self.capturing = true;
        self.dropped_frames = 0;
        Ok(())
    }

    fn stop_capture(&mut self, handle: DeviceHandle) -> DeviceResult<()> {
        self.calls.push(DriverCall::StopCapture);
        self.check(handle)?;
        self.capturing = false;
        Ok(())
    }

    fn poll_frame(
        &mut self,
        handle: DeviceHandle,
        size: ImageSize,
        format: PixelFormat,
        _timeout_ms: u32,
    ) -> DeviceResult<Polled> {
        self.calls.push(DriverCall::Poll);
        self.check_ready(handle)?;
        if !self.capturing {
            return Err(DeviceError::InvalidState("capture not started".to_string()));
        }

        let index = self.polls;
        self.polls += 1;
        if let Some(dropped) = self.drops_at_poll.get(&index) {
            self.dropped_frames += dropped;
        }

        match self.poll_script.get(&index).cloned().unwrap_or(PollScript::Frame) {
            PollScript::Frame => {
                if self.realtime {
                    let exposure_us = self.controls.get(&ControlKind::Exposure).copied();
                    std::thread::sleep(Duration::from_micros(
                        exposure_us.unwrap_or(0).max(0) as u64,
                    ));
                }
                let bytes = self.frame_bytes(size, format);
                self.frames_delivered += 1;
                debug!("Mock sensor delivered frame {} ({} bytes)", index, bytes.len());
                Ok(Polled::Frame(bytes))
            }
            PollScript::Timeout => Ok(Polled::Timeout),
            PollScript::Empty => Ok(Polled::Empty),
            PollScript::Fail(err) => {
                if err.is_fatal() {
                    self.opened = None;
                }
                Err(err)
            }
        }
    }

    fn get_dropped_frame_count(&mut self, handle: DeviceHandle) -> DeviceResult<u64> {
        self.calls.push(DriverCall::GetDroppedFrames);
        self.check_ready(handle)?;
        Ok(self.dropped_frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> (MockSensor, DeviceHandle) {
        let mut sensor = MockSensor::new();
        let handle = sensor.open(CameraId(0)).unwrap();
        sensor.init(handle).unwrap();
        (sensor, handle)
    }

    #[test]
    fn test_enumerate_reports_serial() {
        let mut sensor = MockSensor::new().serial("ABC123");
        let cameras = sensor.enumerate().unwrap();
        assert_eq!(cameras.get("ABC123"), Some(&CameraId(0)));
    }

    #[test]
    fn test_unknown_camera_not_found() {
        let mut sensor = MockSensor::new();
        assert!(matches!(
            sensor.open(CameraId(3)),
            Err(DeviceError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_control_clamps() {
        let (mut sensor, handle) = opened();
        sensor.set_control(handle, ControlKind::Gain, 9000).unwrap();
        assert_eq!(sensor.get_control(handle, ControlKind::Gain).unwrap(), 570);
    }

    #[test]
    fn test_read_only_control_rejected() {
        let (mut sensor, handle) = opened();
        let result = sensor.set_control(handle, ControlKind::SensorTemperature, 0);
        assert!(matches!(result, Err(DeviceError::Rejected { .. })));
    }

    #[test]
    fn test_misaligned_region_rejected() {
        let (mut sensor, handle) = opened();
        let result = sensor.set_region(
            handle,
            ImageSize::from_width_height(401, 400),
            1,
            PixelFormat::Raw16,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_scripted_polls() {
        let (sensor, handle) = opened();
        let mut sensor = sensor.timeouts_at(&[1]).poll_outcome(2, PollScript::Empty);
        let size = ImageSize::from_width_height(8, 8);
        sensor.start_capture(handle).unwrap();

        let first = sensor.poll_frame(handle, size, PixelFormat::Raw16, 500).unwrap();
        assert!(matches!(first, Polled::Frame(ref bytes) if bytes.len() == 128));
        assert_eq!(
            sensor.poll_frame(handle, size, PixelFormat::Raw16, 500).unwrap(),
            Polled::Timeout
        );
        assert_eq!(
            sensor.poll_frame(handle, size, PixelFormat::Raw16, 500).unwrap(),
            Polled::Empty
        );
        assert_eq!(sensor.poll_count(), 3);
        assert_eq!(sensor.frames_delivered(), 1);
    }

    #[test]
    fn test_poll_requires_capture() {
        let (mut sensor, handle) = opened();
        let result = sensor.poll_frame(
            handle,
            ImageSize::from_width_height(8, 8),
            PixelFormat::Raw8,
            500,
        );
        assert!(matches!(result, Err(DeviceError::InvalidState(_))));
    }

    #[test]
    fn test_fatal_poll_invalidates_handle() {
        let (sensor, handle) = opened();
        let mut sensor = sensor.poll_outcome(0, PollScript::Fail(DeviceError::InvalidHandle));
        sensor.start_capture(handle).unwrap();
        let size = ImageSize::from_width_height(8, 8);
        assert!(sensor.poll_frame(handle, size, PixelFormat::Raw8, 500).is_err());
        assert_eq!(
            sensor.stop_capture(handle),
            Err(DeviceError::InvalidHandle)
        );
    }

    #[test]
    fn test_scripted_start_failure() {
        let (sensor, handle) = opened();
        let mut sensor = sensor.fail_start(DeviceError::CameraRemoved);
        assert_eq!(
            sensor.start_capture(handle),
            Err(DeviceError::CameraRemoved)
        );
        assert!(!sensor.is_capturing());
    }

    #[test]
    fn test_drop_counter() {
        let (sensor, handle) = opened();
        let mut sensor = sensor.drops_at(1, 3);
        sensor.start_capture(handle).unwrap();
        let size = ImageSize::from_width_height(8, 8);
        for _ in 0..3 {
            sensor.poll_frame(handle, size, PixelFormat::Raw8, 500).unwrap();
        }
        assert_eq!(sensor.get_dropped_frame_count(handle).unwrap(), 3);
    }
}
