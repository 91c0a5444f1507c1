//! Device binding modes
//!
//! The [`ModeController`] turns a [`Mode`] into a [`DeviceContext`]:
//!
//! | Mode         | Motors / detector / fly | Shutter / beam signals |
//! |--------------|-------------------------|------------------------|
//! | `Debug`      | simulated               | simulated              |
//! | `DryRun`     | live                    | simulated              |
//! | `Production` | live                    | live                   |
//!
//! Production binding is refused unless the facility reports user operations,
//! the instrument reservation is held and the hutch light is off.
//!
//! Live devices come from a [`LiveBackend`] supplied by the caller. The crate
//! ships no hardware drivers; without a backend only `Debug` binds.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::devices::sim::{SimDetector, SimFlyTrigger, SimMotor, SimShutter, SimSignal};
use crate::devices::{
    AreaDetector, Binding, DeviceContext, FlyTrigger, Motor, Shutter, SignalSource,
};
use crate::error::{AppResult, TomoError};

/// Device binding mode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Every device simulated
    #[default]
    Debug,
    /// Live instrument, simulated beam
    #[value(name = "dryrun")]
    DryRun,
    /// Every device live
    Production,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Debug => write!(f, "debug"),
            Mode::DryRun => write!(f, "dryrun"),
            Mode::Production => write!(f, "production"),
        }
    }
}

/// Facility state checked before a production binding
#[async_trait]
pub trait FacilityStatus: Send + Sync {
    /// Storage ring is in user operations
    async fn user_operations(&self) -> Result<bool>;

    /// This station holds the instrument reservation
    async fn instrument_in_use(&self) -> Result<bool>;

    /// Hutch light is on (someone may be inside)
    async fn hutch_light_on(&self) -> Result<bool>;
}

/// Fixed facility readout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacilityReadout {
    /// Storage ring is in user operations
    pub user_operations: bool,
    /// This station holds the instrument reservation
    pub instrument_in_use: bool,
    /// Hutch light is on
    pub hutch_light_on: bool,
}

impl FacilityReadout {
    /// A facility ready for production
    pub fn ready() -> Self {
        Self {
            user_operations: true,
            instrument_in_use: true,
            hutch_light_on: false,
        }
    }
}

#[async_trait]
impl FacilityStatus for FacilityReadout {
    async fn user_operations(&self) -> Result<bool> {
        Ok(self.user_operations)
    }

    async fn instrument_in_use(&self) -> Result<bool> {
        Ok(self.instrument_in_use)
    }

    async fn hutch_light_on(&self) -> Result<bool> {
        Ok(self.hutch_light_on)
    }
}

/// Live rotation stage, sample stages, detector and fly controller
#[derive(Clone)]
pub struct InstrumentSet {
    /// Rotation stage
    pub rotation: Arc<dyn Motor>,
    /// Horizontal sample stage
    pub sample_x: Arc<dyn Motor>,
    /// Vertical sample stage
    pub sample_y: Arc<dyn Motor>,
    /// Area detector
    pub detector: Arc<dyn AreaDetector>,
    /// Fly-scan trigger controller
    pub fly_trigger: Arc<dyn FlyTrigger>,
}

/// Shutter and beam-availability signals
#[derive(Clone)]
pub struct BeamSet {
    /// Beam shutter
    pub shutter: Arc<dyn Shutter>,
    /// Shutter PSS permit signal
    pub shutter_permit: Arc<dyn SignalSource>,
    /// Storage-ring current
    pub ring_current: Arc<dyn SignalSource>,
}

/// Connects to real hardware
///
/// Implemented outside this crate by the beamline's driver layer.
pub trait LiveBackend: Send + Sync {
    /// Backend name used in logs and errors
    fn name(&self) -> &str;

    /// Connect the motors, detector and fly controller
    fn connect_instrument(&self) -> BoxFuture<'static, Result<InstrumentSet>>;

    /// Connect the shutter and beam signals
    fn connect_beam(&self) -> BoxFuture<'static, Result<BeamSet>>;
}

/// A complete simulated beamline
///
/// Holds the concrete simulation types so callers can inspect them after a
/// run. By default the fly controller is wired to the detector and rotation
/// stage and the ring current reads 100 mA.
#[derive(Clone)]
pub struct SimulatedBeamline {
    /// Rotation stage
    pub rotation: Arc<SimMotor>,
    /// Horizontal sample stage
    pub sample_x: Arc<SimMotor>,
    /// Vertical sample stage
    pub sample_y: Arc<SimMotor>,
    /// Beam shutter (drives its own permit signal)
    pub shutter: Arc<SimShutter>,
    /// Area detector
    pub detector: Arc<SimDetector>,
    /// Fly controller
    pub fly_trigger: Arc<SimFlyTrigger>,
    /// Storage-ring current
    pub ring_current: Arc<SimSignal>,
}

impl Default for SimulatedBeamline {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBeamline {
    /// Default simulated beamline
    pub fn new() -> Self {
        Self::with_detector(SimDetector::new("sim_det"))
    }

    /// Simulated beamline around a customised detector
    pub fn with_detector(detector: SimDetector) -> Self {
        let rotation = Arc::new(SimMotor::new("sim_rotation", 0.0));
        let detector = Arc::new(detector);
        let fly_trigger = Arc::new(
            SimFlyTrigger::new("sim_psofly")
                .with_detector(detector.clone())
                .with_rotation(rotation.clone()),
        );
        Self {
            rotation,
            sample_x: Arc::new(SimMotor::new("sim_sample_x", 0.0)),
            sample_y: Arc::new(SimMotor::new("sim_sample_y", 0.0)),
            shutter: Arc::new(SimShutter::new("sim_shutter")),
            detector,
            fly_trigger,
            ring_current: Arc::new(SimSignal::new("sim_ring_current", 100.0)),
        }
    }

    /// Simulated instrument devices
    pub fn instrument(&self) -> InstrumentSet {
        InstrumentSet {
            rotation: self.rotation.clone(),
            sample_x: self.sample_x.clone(),
            sample_y: self.sample_y.clone(),
            detector: self.detector.clone(),
            fly_trigger: self.fly_trigger.clone(),
        }
    }

    /// Simulated shutter and beam signals
    pub fn beam(&self) -> BeamSet {
        BeamSet {
            shutter: self.shutter.clone(),
            shutter_permit: self.shutter.permit(),
            ring_current: self.ring_current.clone(),
        }
    }

    /// Fully simulated device context
    pub fn context(&self) -> DeviceContext {
        assemble(
            self.instrument(),
            Binding::Simulated,
            self.beam(),
            Binding::Simulated,
        )
    }
}

fn assemble(
    instrument: InstrumentSet,
    instrument_binding: Binding,
    beam: BeamSet,
    beam_binding: Binding,
) -> DeviceContext {
    DeviceContext {
        rotation: instrument.rotation,
        sample_x: instrument.sample_x,
        sample_y: instrument.sample_y,
        shutter: beam.shutter,
        detector: instrument.detector,
        fly_trigger: instrument.fly_trigger,
        shutter_permit: beam.shutter_permit,
        ring_current: beam.ring_current,
        instrument_binding,
        beam_binding,
    }
}

/// Builds device contexts for a mode
pub struct ModeController {
    sim: SimulatedBeamline,
    live: Option<Arc<dyn LiveBackend>>,
    facility: Option<Arc<dyn FacilityStatus>>,
}

impl ModeController {
    /// Controller with a default simulated beamline and no live backend
    pub fn new() -> Self {
        Self::with_simulation(SimulatedBeamline::new())
    }

    /// Controller around a specific simulated beamline
    pub fn with_simulation(sim: SimulatedBeamline) -> Self {
        Self {
            sim,
            live: None,
            facility: None,
        }
    }

    /// Register the live device backend
    pub fn with_live_backend(mut self, backend: Arc<dyn LiveBackend>) -> Self {
        self.live = Some(backend);
        self
    }

    /// Register the facility status source
    pub fn with_facility(mut self, facility: Arc<dyn FacilityStatus>) -> Self {
        self.facility = Some(facility);
        self
    }

    /// The simulated beamline backing simulated bindings
    pub fn simulation(&self) -> &SimulatedBeamline {
        &self.sim
    }

    /// Bind devices for `mode`
    #[instrument(skip(self), err)]
    pub async fn bind(&self, mode: Mode) -> AppResult<DeviceContext> {
        let ctx = match mode {
            Mode::Debug => self.sim.context(),
            Mode::DryRun => {
                let backend = self.backend(mode)?;
                let instrument = backend
                    .connect_instrument()
                    .await
                    .map_err(|e| TomoError::device(backend.name(), "connect", e))?;
                assemble(instrument, Binding::Live, self.sim.beam(), Binding::Simulated)
            }
            Mode::Production => {
                self.check_production().await?;
                let backend = self.backend(mode)?;
                let instrument = backend
                    .connect_instrument()
                    .await
                    .map_err(|e| TomoError::device(backend.name(), "connect", e))?;
                let beam = backend
                    .connect_beam()
                    .await
                    .map_err(|e| TomoError::device(backend.name(), "connect", e))?;
                assemble(instrument, Binding::Live, beam, Binding::Live)
            }
        };

        info!(
            %mode,
            instrument = %ctx.instrument_binding,
            beam = %ctx.beam_binding,
            "Devices bound"
        );
        Ok(ctx)
    }

    fn backend(&self, mode: Mode) -> AppResult<&Arc<dyn LiveBackend>> {
        self.live
            .as_ref()
            .ok_or(TomoError::BackendUnavailable(mode))
    }

    async fn check_production(&self) -> AppResult<()> {
        let facility = self.facility.as_ref().ok_or_else(|| {
            TomoError::PreconditionNotMet("facility status unavailable".to_string())
        })?;

        require(facility.user_operations().await, true, "storage ring not in user operations")?;
        require(
            facility.instrument_in_use().await,
            true,
            "instrument reservation not held by this station",
        )?;
        require(facility.hutch_light_on().await, false, "hutch light is on")?;
        Ok(())
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

/// A failing status read counts as a failed check
fn require(reading: Result<bool>, expected: bool, message: &str) -> AppResult<()> {
    match reading {
        Ok(value) if value == expected => Ok(()),
        Ok(_) => {
            warn!(check = message, "Production precondition not met");
            Err(TomoError::PreconditionNotMet(message.to_string()))
        }
        Err(e) => {
            warn!(check = message, error = %e, "Facility status read failed");
            Err(TomoError::PreconditionNotMet(format!(
                "{} (status read failed: {})",
                message, e
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SimBackend(SimulatedBeamline);

    impl LiveBackend for SimBackend {
        fn name(&self) -> &str {
            "sim-backend"
        }

        fn connect_instrument(&self) -> BoxFuture<'static, Result<InstrumentSet>> {
            let set = self.0.instrument();
            Box::pin(async move { Ok(set) })
        }

        fn connect_beam(&self) -> BoxFuture<'static, Result<BeamSet>> {
            let set = self.0.beam();
            Box::pin(async move { Ok(set) })
        }
    }

    struct BrokenFacility;

    #[async_trait]
    impl FacilityStatus for BrokenFacility {
        async fn user_operations(&self) -> Result<bool> {
            anyhow::bail!("PV disconnected")
        }

        async fn instrument_in_use(&self) -> Result<bool> {
            Ok(true)
        }

        async fn hutch_light_on(&self) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_mode_serde_names() {
        let mode: Mode = serde_json::from_str("\"dryrun\"").unwrap();
        assert_eq!(mode, Mode::DryRun);
        assert_eq!(Mode::Production.to_string(), "production");
    }

    #[tokio::test]
    async fn test_debug_binds_all_simulated() {
        let ctx = ModeController::new().bind(Mode::Debug).await.unwrap();
        assert_eq!(ctx.instrument_binding, Binding::Simulated);
        assert_eq!(ctx.beam_binding, Binding::Simulated);
    }

    #[tokio::test]
    async fn test_dryrun_without_backend_unavailable() {
        let err = ModeController::new().bind(Mode::DryRun).await.unwrap_err();
        assert!(matches!(err, TomoError::BackendUnavailable(Mode::DryRun)));
    }

    #[tokio::test]
    async fn test_dryrun_keeps_beam_simulated() {
        let controller = ModeController::new()
            .with_live_backend(Arc::new(SimBackend(SimulatedBeamline::new())));
        let ctx = controller.bind(Mode::DryRun).await.unwrap();
        assert_eq!(ctx.instrument_binding, Binding::Live);
        assert_eq!(ctx.beam_binding, Binding::Simulated);
    }

    #[tokio::test]
    async fn test_production_ready_binds_live() {
        let controller = ModeController::new()
            .with_live_backend(Arc::new(SimBackend(SimulatedBeamline::new())))
            .with_facility(Arc::new(FacilityReadout::ready()));
        let ctx = controller.bind(Mode::Production).await.unwrap();
        assert_eq!(ctx.beam_binding, Binding::Live);
    }

    #[tokio::test]
    async fn test_production_without_facility_refused() {
        let controller = ModeController::new()
            .with_live_backend(Arc::new(SimBackend(SimulatedBeamline::new())));
        let err = controller.bind(Mode::Production).await.unwrap_err();
        assert!(matches!(err, TomoError::PreconditionNotMet(_)));
    }

    #[tokio::test]
    async fn test_production_status_read_failure_refused() {
        let controller = ModeController::new()
            .with_live_backend(Arc::new(SimBackend(SimulatedBeamline::new())))
            .with_facility(Arc::new(BrokenFacility));
        let err = controller.bind(Mode::Production).await.unwrap_err();
        assert!(err.to_string().contains("user operations"));
    }
}
