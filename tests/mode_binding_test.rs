//! Mode binding integration tests
//!
//! Binds each mode through the `ModeController` and runs a short scan on the
//! resulting device set. The "live" backend here is a second simulated
//! beamline, so the tests can tell which devices a run actually drove.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tomo_daq::config::SessionConfig;
use tomo_daq::devices::{Binding, ShutterState};
use tomo_daq::engine::RunEngine;
use tomo_daq::error::TomoError;
use tomo_daq::mode::{
    BeamSet, FacilityReadout, InstrumentSet, LiveBackend, Mode, ModeController, SimulatedBeamline,
};
use tomo_daq::scan::{ScanConfig, ScanMode};

/// Backend handing out a simulated beamline and counting connections
struct CountingBackend {
    hardware: SimulatedBeamline,
    connects: AtomicU32,
}

impl CountingBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hardware: SimulatedBeamline::new(),
            connects: AtomicU32::new(0),
        })
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl LiveBackend for CountingBackend {
    fn name(&self) -> &str {
        "bench-ioc"
    }

    fn connect_instrument(&self) -> BoxFuture<'static, anyhow::Result<InstrumentSet>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let set = self.hardware.instrument();
        Box::pin(async move { Ok(set) })
    }

    fn connect_beam(&self) -> BoxFuture<'static, anyhow::Result<BeamSet>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let set = self.hardware.beam();
        Box::pin(async move { Ok(set) })
    }
}

fn short_scan() -> ScanConfig {
    ScanConfig::new(0.0, 2.0, 1.0).with_sample_out(4.0, 0.0, 0.0)
}

#[tokio::test]
async fn test_debug_mode_drives_only_simulation() {
    let backend = CountingBackend::new();
    let controller = ModeController::new().with_live_backend(backend.clone());

    let devices = controller.bind(Mode::Debug).await.unwrap();
    assert_eq!(devices.instrument_binding, Binding::Simulated);
    assert_eq!(devices.beam_binding, Binding::Simulated);

    let engine = RunEngine::new(devices, SessionConfig::default());
    assert!(engine.run(&short_scan(), ScanMode::Step).await.unwrap().is_success());

    assert_eq!(backend.connects(), 0);
    assert!(!controller.simulation().rotation.history().await.is_empty());
    assert!(backend.hardware.rotation.history().await.is_empty());
}

#[tokio::test]
async fn test_dryrun_keeps_beam_simulated() {
    let backend = CountingBackend::new();
    let controller = ModeController::new().with_live_backend(backend.clone());

    let devices = controller.bind(Mode::DryRun).await.unwrap();
    assert_eq!(devices.instrument_binding, Binding::Live);
    assert_eq!(devices.beam_binding, Binding::Simulated);
    assert_eq!(backend.connects(), 1);

    let engine = RunEngine::new(devices, SessionConfig::default());
    assert!(engine.run(&short_scan(), ScanMode::Step).await.unwrap().is_success());

    // Motors and detector were the live ones
    assert!(backend.hardware.sample_x.history().await.contains(&4.0));
    assert!(!backend.hardware.detector.triggers().await.is_empty());

    // The real shutter never moved
    assert!(backend.hardware.shutter.history().await.is_empty());
    assert_eq!(
        controller.simulation().shutter.history().await.first(),
        Some(&ShutterState::Open)
    );
}

#[tokio::test]
async fn test_production_refused_with_hutch_light_on() {
    let backend = CountingBackend::new();
    let controller = ModeController::new()
        .with_live_backend(backend.clone())
        .with_facility(Arc::new(FacilityReadout {
            hutch_light_on: true,
            ..FacilityReadout::ready()
        }));

    let err = controller.bind(Mode::Production).await.unwrap_err();
    assert!(matches!(err, TomoError::PreconditionNotMet(ref why) if why.contains("hutch")));
    assert_eq!(backend.connects(), 0);
}

#[tokio::test]
async fn test_production_refused_outside_user_operations() {
    let backend = CountingBackend::new();
    let controller = ModeController::new()
        .with_live_backend(backend.clone())
        .with_facility(Arc::new(FacilityReadout {
            user_operations: false,
            ..FacilityReadout::ready()
        }));

    let err = controller.bind(Mode::Production).await.unwrap_err();
    assert!(matches!(err, TomoError::PreconditionNotMet(_)));
    assert_eq!(backend.connects(), 0);
}

#[tokio::test]
async fn test_production_binds_everything_live() {
    let backend = CountingBackend::new();
    let controller = ModeController::new()
        .with_live_backend(backend.clone())
        .with_facility(Arc::new(FacilityReadout::ready()));

    let devices = controller.bind(Mode::Production).await.unwrap();
    assert_eq!(devices.instrument_binding, Binding::Live);
    assert_eq!(devices.beam_binding, Binding::Live);
    assert_eq!(backend.connects(), 2);

    let engine = RunEngine::new(devices, SessionConfig::default());
    assert!(engine.run(&short_scan(), ScanMode::Fly).await.unwrap().is_success());
    let shutter = backend.hardware.shutter.history().await;
    assert_eq!(shutter.first(), Some(&ShutterState::Open));
    assert_eq!(shutter.last(), Some(&ShutterState::Closed));
}

#[tokio::test]
async fn test_live_modes_need_a_backend() {
    let controller = ModeController::new();
    let err = controller.bind(Mode::DryRun).await.unwrap_err();
    assert!(matches!(err, TomoError::BackendUnavailable(Mode::DryRun)));
}
