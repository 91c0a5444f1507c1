//! # tomo_daq
//!
//! Scan sequencing and device coordination for synchrotron tomography.
//!
//! A tomography acquisition takes white fields, projections over an angle
//! range (stepping or flying the rotation stage) and dark fields, while
//! keeping the detector's frame-type labels and file layout consistent and
//! pausing whenever the beam goes away.
//!
//! ## Crate Structure
//!
//! - **`scan`**: Scan documents and the validated [`scan::ScanConfig`].
//! - **`config`**: Session configuration (figment, TOML + environment).
//! - **`devices`**: Async capability traits for motors, shutter, detector,
//!   fly controller and monitored signals, plus simulations in `devices::sim`.
//! - **`monitor`**: Beam-availability suspenders with hysteresis.
//! - **`output`**: Selects and arms exactly one detector file sink.
//! - **`engine`**: The tomography plan state machine and the run engine.
//! - **`mode`**: Debug / dry-run / production device binding.
//! - **`documents`**: Start, event and stop documents broadcast per run.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The crate-wide `TomoError`.

pub mod config;
pub mod devices;
pub mod documents;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mode;
pub mod monitor;
pub mod output;
pub mod scan;

pub use engine::{RunEngine, ScanResult};
pub use error::{AppResult, TomoError};
pub use mode::{Mode, ModeController};
pub use scan::{ScanConfig, ScanMode};
