//! Scan sequencing
//!
//! - [`plans`] - the [`Plan`] trait and the [`TomoScan`] state machine
//! - [`run_engine`] - the [`RunEngine`] that executes plans against devices

pub mod plans;
pub mod run_engine;

pub use plans::{summarize, MoveTarget, Plan, PlanCommand, ScanPhase, TomoScan};
pub use run_engine::{EngineState, RunEngine, ScanFailure, ScanResult, ScanSummary};
