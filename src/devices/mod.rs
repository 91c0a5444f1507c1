//! Device capability traits
//!
//! The run engine never talks to a driver directly. It sees each device
//! through one small capability trait:
//!
//! - [`Motor`] - rotation stage and sample translation stages
//! - [`Shutter`] - beamline shutter
//! - [`AreaDetector`] - camera with a frame filter and two file sinks
//! - [`FlyTrigger`] - external position-based trigger controller
//! - [`SignalSource`] - read-only process variables watched by suspenders
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Resolves only once the operation has completed on the hardware
//!
//! Timeouts are applied by the caller, not by the device. A driver that never
//! answers simply never resolves.
//!
//! [`DeviceContext`] bundles one instance of every capability. It is built by
//! [`crate::mode::ModeController`] and handed to the engine.

pub mod sim;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::scan::{projection_count, FrameType, OutputFormat};

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: Motion Control
///
/// # Contract
/// - Positions are in device-native units (mm or degrees)
/// - `move_abs` resolves once the axis has settled at the target
#[async_trait]
pub trait Motor: Send + Sync {
    /// Device name used in logs and errors
    fn name(&self) -> &str;

    /// Move to absolute position and wait for completion
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Current position
    async fn position(&self) -> Result<f64>;
}

/// Shutter position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    /// Beam passes
    Open,
    /// Beam blocked
    Closed,
}

/// Capability: Beam Shutter
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Device name used in logs and errors
    fn name(&self) -> &str;

    /// Open and wait until the shutter reports open
    async fn open(&self) -> Result<()>;

    /// Close and wait until the shutter reports closed
    async fn close(&self) -> Result<()>;

    /// Current state
    async fn state(&self) -> Result<ShutterState>;
}

/// Capability: Monitored scalar signal
///
/// Used for the shutter PSS state and the ring current. The receiver always
/// holds the most recent value.
pub trait SignalSource: Send + Sync {
    /// Signal name used in logs
    fn name(&self) -> &str;

    /// Subscribe to value updates
    fn subscribe(&self) -> watch::Receiver<f64>;
}

/// Camera trigger source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Camera times its own exposures
    Internal,
    /// Each external pulse starts an exposure
    Bulb,
    /// External pulses with overlapped readout
    Overlapped,
}

/// Camera image mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageMode {
    /// One image per acquisition
    Single,
    /// `num_images` per acquisition
    Multiple,
    /// Until stopped
    Continuous,
}

/// Port the file sinks read arrays from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayPort {
    /// Frame-averaging processing plugin
    Proc1,
    /// Raw camera output
    Pg1,
}

impl fmt::Display for ArrayPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayPort::Proc1 => write!(f, "PROC1"),
            ArrayPort::Pg1 => write!(f, "PG1"),
        }
    }
}

/// One detector parameter write
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DetectorSetting {
    /// Exposure time in seconds
    AcquireTime(f64),
    /// Frame period in seconds
    AcquirePeriod(f64),
    /// Trigger source
    TriggerMode(TriggerMode),
    /// Image mode
    ImageMode(ImageMode),
    /// Images per acquisition
    NumImages(u32),
    /// Frame-type tag stamped on subsequent frames
    FrameType(FrameType),
    /// Enable and reset the averaging filter over `n` frames; `None` disables it
    FrameFilter(Option<u32>),
    /// Source port for both file sinks
    SinkPort(ArrayPort),
}

/// File sink on the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SinkKind {
    /// TIFF writer
    Tiff,
    /// HDF5 writer
    Hdf5,
}

impl SinkKind {
    /// The sink that is not `self`
    pub fn other(self) -> SinkKind {
        match self {
            SinkKind::Tiff => SinkKind::Hdf5,
            SinkKind::Hdf5 => SinkKind::Tiff,
        }
    }
}

impl From<OutputFormat> for SinkKind {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Tiff => SinkKind::Tiff,
            OutputFormat::Hdf5 => SinkKind::Hdf5,
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Tiff => write!(f, "tiff1"),
            SinkKind::Hdf5 => write!(f, "hdf1"),
        }
    }
}

/// Sink file write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// Write each array as it arrives to its own file
    #[default]
    Single,
    /// Buffer `num_capture` arrays, then write
    Capture,
    /// Stream arrays into one open file
    Stream,
}

/// Settings of one file sink
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Sink accepts arrays
    pub enabled: bool,
    /// Arrays to write before the file closes
    pub num_capture: u32,
    /// Output directory
    pub file_path: PathBuf,
    /// File name prefix
    pub file_name: String,
    /// printf-style template: path, name, frame index
    pub file_template: String,
    /// Write mode
    pub write_mode: WriteMode,
    /// Capture armed
    pub capture: bool,
}

impl SinkSettings {
    /// Settings that stop the sink from accepting arrays
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Outcome of one acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acquisition {
    /// Images the camera produced
    pub images: u32,
    /// Frames the active sink archived
    pub archived: u32,
}

/// Capability: Area Detector
///
/// A camera whose arrays flow through an optional averaging filter into
/// two file sinks. At most one sink should be enabled at a time.
#[async_trait]
pub trait AreaDetector: Send + Sync {
    /// Device name used in logs and errors
    fn name(&self) -> &str;

    /// Write one camera or plugin parameter
    async fn set(&self, setting: DetectorSetting) -> Result<()>;

    /// Replace the settings of a file sink
    async fn configure_sink(&self, sink: SinkKind, settings: SinkSettings) -> Result<()>;

    /// Read back the settings of a file sink
    async fn sink(&self, sink: SinkKind) -> Result<SinkSettings>;

    /// Start an acquisition and return immediately
    async fn start_acquisition(&self) -> Result<()>;

    /// Wait until the started acquisition has produced all its images
    async fn wait_acquisition(&self) -> Result<Acquisition>;

    /// Abort the running acquisition, keeping frames already archived
    async fn stop_acquisition(&self) -> Result<()>;

    /// Images produced so far by the running (or last) acquisition
    async fn images_collected(&self) -> Result<u32>;

    /// Stop sink capture and close open files
    async fn unstage(&self) -> Result<()>;

    /// Acquire with the current settings and wait for completion
    async fn trigger_and_read(&self) -> Result<Acquisition> {
        self.start_acquisition().await?;
        self.wait_acquisition().await
    }
}

/// Fly sweep parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlyParams {
    /// Start angle
    pub start: f64,
    /// End angle
    pub end: f64,
    /// Angular distance between trigger pulses
    pub step: f64,
    /// Rotation speed during the sweep
    pub slew_speed: f64,
    /// Rotation acceleration, controller default when `None`
    pub acceleration: Option<f64>,
}

impl FlyParams {
    /// Pulses the controller should emit over the sweep
    pub fn expected_triggers(&self) -> u32 {
        projection_count(self.start, self.end, self.step)
    }
}

/// Trigger count reported by the fly controller after a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReport {
    /// Pulses requested
    pub expected: u32,
    /// Pulses delivered to the detector
    pub actual: u32,
}

impl TriggerReport {
    /// Whether every requested pulse was delivered
    pub fn is_complete(&self) -> bool {
        self.actual == self.expected
    }
}

/// Capability: Taxi/Fly Trigger Controller
///
/// The controller is driven in two busy-record phases: `taxi` brings the
/// rotation stage to its run-up position, `fly` performs the sweep and emits
/// one pulse per `step`.
#[async_trait]
pub trait FlyTrigger: Send + Sync {
    /// Device name used in logs and errors
    fn name(&self) -> &str;

    /// Load the sweep parameters
    async fn configure(&self, params: FlyParams) -> Result<()>;

    /// Move to the run-up position
    async fn taxi(&self) -> Result<()>;

    /// Sweep and report the triggers delivered
    async fn fly(&self) -> Result<TriggerReport>;
}

// =============================================================================
// Device Context
// =============================================================================

/// How a device in the context is backed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    /// In-process simulation
    Simulated,
    /// Real hardware
    Live,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Simulated => write!(f, "simulated"),
            Binding::Live => write!(f, "live"),
        }
    }
}

/// Motor axes the sequencer drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// Rotation stage (omega)
    Rotation,
    /// Horizontal sample translation
    SampleX,
    /// Vertical sample translation
    SampleY,
}

impl Axis {
    /// All axes, in restore order
    pub const ALL: [Axis; 3] = [Axis::SampleX, Axis::SampleY, Axis::Rotation];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Rotation => write!(f, "rotation"),
            Axis::SampleX => write!(f, "sample_x"),
            Axis::SampleY => write!(f, "sample_y"),
        }
    }
}

/// Every device one scan needs, with its binding
#[derive(Clone)]
pub struct DeviceContext {
    /// Rotation stage
    pub rotation: Arc<dyn Motor>,
    /// Horizontal sample stage
    pub sample_x: Arc<dyn Motor>,
    /// Vertical sample stage
    pub sample_y: Arc<dyn Motor>,
    /// Beam shutter
    pub shutter: Arc<dyn Shutter>,
    /// Area detector
    pub detector: Arc<dyn AreaDetector>,
    /// Fly-scan trigger controller
    pub fly_trigger: Arc<dyn FlyTrigger>,
    /// Shutter PSS permit signal
    pub shutter_permit: Arc<dyn SignalSource>,
    /// Storage-ring current
    pub ring_current: Arc<dyn SignalSource>,
    /// Binding of the motors, detector and fly controller
    pub instrument_binding: Binding,
    /// Binding of the shutter and beam signals
    pub beam_binding: Binding,
}

impl DeviceContext {
    /// Motor driving `axis`
    pub fn motor(&self, axis: Axis) -> &Arc<dyn Motor> {
        match axis {
            Axis::Rotation => &self.rotation,
            Axis::SampleX => &self.sample_x,
            Axis::SampleY => &self.sample_y,
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("rotation", &self.rotation.name())
            .field("sample_x", &self.sample_x.name())
            .field("sample_y", &self.sample_y.name())
            .field("shutter", &self.shutter.name())
            .field("detector", &self.detector.name())
            .field("fly_trigger", &self.fly_trigger.name())
            .field("instrument_binding", &self.instrument_binding)
            .field("beam_binding", &self.beam_binding)
            .finish()
    }
}
