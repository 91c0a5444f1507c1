//! Scan documents: the user-facing description of one tomography acquisition.
//!
//! A scan document is a YAML mapping with a `tomo` section and an `output`
//! section:
//!
//! ```yaml
//! tomo:
//!   acquire_time: 0.05
//!   acquire_period: 0.06
//!   n_frames: 5
//!   n_white: 10
//!   n_dark: 10
//!   omega_start: 0.0
//!   omega_end: 180.0
//!   omega_step: 0.25
//!   mode: step
//!   sample_out_position:
//!     samx: -3.0
//!     samy: 0.0
//!     preci: 0.0
//! output:
//!   filepath: /data/2019-1/tomo/
//!   fileprefix: sample_a
//!   type: hdf5
//! ```
//!
//! [`ScanConfig`] is the validated, flattened form the engine consumes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{AppResult, TomoError};

/// Projection acquisition sub-mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Stop at each angle, then trigger
    #[default]
    Step,
    /// Continuous rotation with position-triggered frames
    Fly,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Step => write!(f, "step"),
            ScanMode::Fly => write!(f, "fly"),
        }
    }
}

/// Tag written to the detector before each phase.
///
/// The detector records the tag with every frame, so a single archive can be
/// split into white, projection and dark subsets afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// White field before the projections
    WhiteFront = 0,
    /// Sample projections
    Projection = 1,
    /// White field after the projections
    WhiteBack = 2,
    /// Dark field, shutter closed
    Dark = 3,
}

impl FrameType {
    /// All tags in acquisition order
    pub const ALL: [FrameType; 4] = [
        FrameType::WhiteFront,
        FrameType::Projection,
        FrameType::WhiteBack,
        FrameType::Dark,
    ];

    /// Numeric code written to the detector
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Dataset the archive writer routes frames of this type to
    pub fn exchange_path(self) -> &'static str {
        match self {
            FrameType::WhiteFront => "/exchange/data_white_pre",
            FrameType::Projection => "/exchange/data",
            FrameType::WhiteBack => "/exchange/data_white_post",
            FrameType::Dark => "/exchange/data_dark",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::WhiteFront => write!(f, "white_front"),
            FrameType::Projection => write!(f, "projection"),
            FrameType::WhiteBack => write!(f, "white_back"),
            FrameType::Dark => write!(f, "dark"),
        }
    }
}

/// Archive format of the active output sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputFormat {
    /// One TIFF file per frame
    Tiff,
    /// Single HDF5 archive
    Hdf5,
}

impl OutputFormat {
    /// Parse a user-supplied output type (case-insensitive).
    ///
    /// Accepts `tif`, `tiff`, `hdf`, `hdf1` and `hdf5`.
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tif" | "tiff" => Ok(OutputFormat::Tiff),
            "hdf" | "hdf1" | "hdf5" => Ok(OutputFormat::Hdf5),
            _ => Err(TomoError::UnsupportedFormat(raw.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Tiff => write!(f, "tiff"),
            OutputFormat::Hdf5 => write!(f, "hdf5"),
        }
    }
}

/// Where and how frames are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output type as written by the user; parsed with [`OutputFormat::parse`]
    #[serde(rename = "type")]
    pub format: String,
    /// Directory on the detector host; session default when absent
    #[serde(default)]
    pub filepath: Option<PathBuf>,
    /// File name prefix; session default when absent
    #[serde(default)]
    pub fileprefix: Option<String>,
}

impl OutputSpec {
    /// Create an output spec with an explicit path and prefix
    pub fn new(format: &str, filepath: impl Into<PathBuf>, fileprefix: &str) -> Self {
        Self {
            format: format.to_string(),
            filepath: Some(filepath.into()),
            fileprefix: Some(fileprefix.to_string()),
        }
    }

    /// Parsed output format
    pub fn output_format(&self) -> AppResult<OutputFormat> {
        OutputFormat::parse(&self.format)
    }

    /// File extension: the requested type as written, lower-cased
    pub fn extension(&self) -> String {
        self.format.trim().to_ascii_lowercase()
    }
}

/// Relative displacements that take the sample out of the beam
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleOut {
    /// Horizontal translation offset
    #[serde(default, alias = "samx")]
    pub dx: f64,
    /// Vertical translation offset
    #[serde(default, alias = "samy")]
    pub dy: f64,
    /// Rotation offset (step mode only)
    #[serde(default, alias = "preci")]
    pub dr: f64,
}

/// Number of angles in `start, start+step, ..., end`.
///
/// The end is included when it lies within half a step of a grid point.
pub fn projection_count(start: f64, end: f64, step: f64) -> u32 {
    let span = (end - start) / step;
    (span + 0.5).ceil().max(1.0) as u32
}

#[derive(Debug, Deserialize)]
struct TomoSection {
    acquire_time: f64,
    acquire_period: f64,
    #[serde(default = "default_count")]
    n_frames: u32,
    n_white: u32,
    n_dark: u32,
    omega_start: f64,
    omega_end: f64,
    omega_step: f64,
    #[serde(default)]
    mode: ScanMode,
    #[serde(default, alias = "sample_out")]
    sample_out_position: SampleOut,
    #[serde(default)]
    slew_speed: Option<f64>,
    #[serde(default)]
    accl: Option<f64>,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ScanDocument {
    tomo: TomoSection,
    output: OutputSpec,
}

/// Where a scan document comes from
#[derive(Debug, Clone)]
pub enum ScanSource {
    /// Already-parsed mapping
    Document(serde_yaml::Value),
    /// Path to a YAML file
    File(PathBuf),
}

impl From<serde_yaml::Value> for ScanSource {
    fn from(value: serde_yaml::Value) -> Self {
        ScanSource::Document(value)
    }
}

impl From<&Path> for ScanSource {
    fn from(path: &Path) -> Self {
        ScanSource::File(path.to_path_buf())
    }
}

impl From<PathBuf> for ScanSource {
    fn from(path: PathBuf) -> Self {
        ScanSource::File(path)
    }
}

/// Validated input for one tomography acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    /// Exposure time per frame in seconds
    pub acquire_time: f64,
    /// Frame period in seconds
    pub acquire_period: f64,
    /// Exposures averaged into one archived frame (step mode)
    pub n_frames: u32,
    /// Archived white frames per white phase
    pub n_white: u32,
    /// Archived dark frames
    pub n_dark: u32,
    /// First projection angle (degrees)
    pub omega_start: f64,
    /// Last projection angle (degrees, inclusive within half a step)
    pub omega_end: f64,
    /// Angular increment; negative for a descending sweep
    pub omega_step: f64,
    /// Default projection sub-mode
    pub mode: ScanMode,
    /// Sample-out offsets
    pub sample_out: SampleOut,
    /// Rotation speed during the fly sweep (deg/s)
    pub slew_speed: Option<f64>,
    /// Rotation acceleration for the fly sweep (deg/s²)
    pub accl: Option<f64>,
    /// Output sink selection
    pub output: OutputSpec,
}

impl ScanConfig {
    /// Create a step-mode config over `[omega_start, omega_end]` with one
    /// frame per exposure and a single white and dark frame.
    pub fn new(omega_start: f64, omega_end: f64, omega_step: f64) -> Self {
        Self {
            acquire_time: 0.05,
            acquire_period: 0.06,
            n_frames: 1,
            n_white: 1,
            n_dark: 1,
            omega_start,
            omega_end,
            omega_step,
            mode: ScanMode::Step,
            sample_out: SampleOut::default(),
            slew_speed: None,
            accl: None,
            output: OutputSpec {
                format: "hdf5".to_string(),
                filepath: None,
                fileprefix: None,
            },
        }
    }

    /// Set background frame counts
    pub fn with_backgrounds(mut self, n_white: u32, n_dark: u32) -> Self {
        self.n_white = n_white;
        self.n_dark = n_dark;
        self
    }

    /// Set exposures averaged per archived frame
    pub fn with_frames(mut self, n_frames: u32) -> Self {
        self.n_frames = n_frames;
        self
    }

    /// Set exposure timing
    pub fn with_timing(mut self, acquire_time: f64, acquire_period: f64) -> Self {
        self.acquire_time = acquire_time;
        self.acquire_period = acquire_period;
        self
    }

    /// Set sample-out offsets
    pub fn with_sample_out(mut self, dx: f64, dy: f64, dr: f64) -> Self {
        self.sample_out = SampleOut { dx, dy, dr };
        self
    }

    /// Set the default projection sub-mode
    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the output spec
    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = output;
        self
    }

    /// Set the fly-scan slew speed
    pub fn with_slew_speed(mut self, slew_speed: f64) -> Self {
        self.slew_speed = Some(slew_speed);
        self
    }

    /// Load and validate a scan document from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a scan document from YAML text
    pub fn from_yaml_str(text: &str) -> AppResult<Self> {
        let doc: ScanDocument = serde_yaml::from_str(text)?;
        Self::from_document(doc)
    }

    /// Validate an already-parsed mapping
    pub fn from_value(value: serde_yaml::Value) -> AppResult<Self> {
        let doc: ScanDocument = serde_yaml::from_value(value)?;
        Self::from_document(doc)
    }

    /// Resolve either a mapping or a file path
    pub fn from_source(source: impl Into<ScanSource>) -> AppResult<Self> {
        match source.into() {
            ScanSource::Document(value) => Self::from_value(value),
            ScanSource::File(path) => Self::load(path),
        }
    }

    fn from_document(doc: ScanDocument) -> AppResult<Self> {
        let t = doc.tomo;
        let config = Self {
            acquire_time: t.acquire_time,
            acquire_period: t.acquire_period,
            n_frames: t.n_frames,
            n_white: t.n_white,
            n_dark: t.n_dark,
            omega_start: t.omega_start,
            omega_end: t.omega_end,
            omega_step: t.omega_step,
            mode: t.mode,
            sample_out: t.sample_out_position,
            slew_speed: t.slew_speed,
            accl: t.accl,
            output: doc.output,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant. Runs before any device is touched.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(TomoError::InvalidConfig(msg));

        for (name, value) in [
            ("omega_start", self.omega_start),
            ("omega_end", self.omega_end),
            ("omega_step", self.omega_step),
            ("acquire_time", self.acquire_time),
            ("acquire_period", self.acquire_period),
        ] {
            if !value.is_finite() {
                return invalid(format!("{} must be finite, got {}", name, value));
            }
        }
        if self.omega_step == 0.0 {
            return invalid("omega_step must be non-zero".to_string());
        }
        if (self.omega_end - self.omega_start) / self.omega_step < 0.0 {
            return invalid(format!(
                "omega_step {} points away from omega_end {} (start {})",
                self.omega_step, self.omega_end, self.omega_start
            ));
        }
        let span = ((self.omega_end - self.omega_start) / self.omega_step + 0.5).ceil();
        if span > f64::from(u32::MAX) {
            return invalid(format!(
                "omega_step {} yields {:e} projections between {} and {}",
                self.omega_step, span, self.omega_start, self.omega_end
            ));
        }
        for (name, value) in [
            ("n_frames", self.n_frames),
            ("n_white", self.n_white),
            ("n_dark", self.n_dark),
        ] {
            if value == 0 {
                return invalid(format!("{} must be at least 1", name));
            }
        }
        for (name, value) in [("n_white", self.n_white), ("n_dark", self.n_dark)] {
            if value.checked_mul(self.n_frames).is_none() {
                return invalid(format!(
                    "{} x n_frames ({} x {}) overflows the detector image count",
                    name, value, self.n_frames
                ));
            }
        }
        if self.checked_total_images().is_none() {
            return invalid(format!(
                "2 x n_white + n_projections + n_dark overflows the archive count (n_white {}, n_dark {})",
                self.n_white, self.n_dark
            ));
        }
        if self.acquire_time <= 0.0 {
            return invalid(format!(
                "acquire_time must be positive, got {}",
                self.acquire_time
            ));
        }
        if self.acquire_period < self.acquire_time {
            return invalid(format!(
                "acquire_period {} is shorter than acquire_time {}",
                self.acquire_period, self.acquire_time
            ));
        }
        for (name, value) in [("slew_speed", self.slew_speed), ("accl", self.accl)] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return invalid(format!("{} must be positive, got {}", name, v));
                }
            }
        }
        self.output.output_format()?;
        Ok(())
    }

    /// Number of projection angles.
    ///
    /// `floor((end - start) / step) + 1` on an exact grid. The end is kept
    /// when it lies within half a step, so floating-point error in the
    /// quotient never drops the last angle.
    pub fn n_projections(&self) -> u32 {
        projection_count(self.omega_start, self.omega_end, self.omega_step)
    }

    /// Projection angles in acquisition order
    pub fn angles(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.n_projections()).map(move |i| self.angle_at(i))
    }

    /// Angle of the `index`-th projection, computed without accumulation
    pub fn angle_at(&self, index: u32) -> f64 {
        self.omega_start + self.omega_step * f64::from(index)
    }

    /// Archived frames in the whole run: `2*n_white + n_projections + n_dark`
    ///
    /// Saturates at `u32::MAX`; [`ScanConfig::validate`] rejects such scans.
    pub fn total_images(&self) -> u32 {
        self.checked_total_images().unwrap_or(u32::MAX)
    }

    fn checked_total_images(&self) -> Option<u32> {
        self.n_white
            .checked_mul(2)?
            .checked_add(self.n_projections())?
            .checked_add(self.n_dark)
    }

    /// Rotation speed for the fly sweep.
    ///
    /// Uses `slew_speed` when given, otherwise one step per frame period.
    pub fn effective_slew_speed(&self) -> f64 {
        self.slew_speed
            .unwrap_or_else(|| self.omega_step.abs() / self.acquire_period)
    }
}
