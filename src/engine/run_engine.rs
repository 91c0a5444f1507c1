//! RunEngine - executes tomography plans against a device context
//!
//! The engine pulls one [`PlanCommand`] at a time from a plan, waits for the
//! beam gate, executes the command with its device-kind timeout, and only
//! then asks for the next. The first failing command ends the plan; cleanup
//! runs on every exit path.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   run()   ┌─────────┐  beam lost   ┌───────────┐
//! │ Idle │──────────▶│ Running │─────────────▶│ Suspended │
//! └──────┘           └────┬────┘◀─────────────└───────────┘
//!    ▲                    │       beam back
//!    │                    │ plan done / failure
//!    │               ┌────▼─────┐
//!    └───────────────│ Cleanup  │
//!                    └──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let devices = ModeController::new().bind(Mode::Debug).await?;
//! let engine = RunEngine::new(devices, SessionConfig::default());
//!
//! let mut docs = engine.subscribe();
//! let result = engine.run(&scan, ScanMode::Step).await?;
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::plans::{MoveTarget, Plan, PlanCommand, ScanPhase, TomoScan};
use crate::config::SessionConfig;
use crate::devices::{Axis, DetectorSetting, DeviceContext, SinkKind, TriggerMode};
use crate::documents::{session_metadata, Document, EventDoc, StartDoc, StopDoc};
use crate::error::{AppResult, TomoError};
use crate::monitor::{BeamMonitor, SuspenderHandle};
use crate::output::OutputConfigurator;
use crate::scan::{FrameType, ScanConfig, ScanMode};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run active
    Idle,
    /// Executing plan commands
    Running,
    /// Waiting for the beam to come back
    Suspended,
    /// Running the cleanup sequence
    Cleanup,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Suspended => write!(f, "suspended"),
            EngineState::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Completed run
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    /// Monotonic run number
    pub run_id: u64,
    /// Run UID shared by all documents of this run
    pub run_uid: String,
    /// Projection sub-mode
    pub mode: ScanMode,
    /// Projection angles
    pub n_projections: u32,
    /// Detector triggers executed
    pub triggers: u32,
    /// Frames archived by the sink
    pub archived: u32,
    /// Frame types written, in order
    pub frame_types: Vec<FrameType>,
    /// Sink that wrote the run
    pub sink: SinkKind,
    /// Cleanup steps that failed (already logged)
    pub cleanup_errors: Vec<String>,
}

/// Run that ended early
#[derive(Debug)]
pub struct ScanFailure {
    /// Monotonic run number
    pub run_id: u64,
    /// Run UID shared by all documents of this run
    pub run_uid: String,
    /// Phase the failing command belonged to
    pub phase: ScanPhase,
    /// First error of the run
    pub error: TomoError,
    /// Frame types written before the failure
    pub frame_types: Vec<FrameType>,
    /// Cleanup steps that failed (already logged)
    pub cleanup_errors: Vec<String>,
}

impl ScanFailure {
    /// `(expected, actual)` when the run ended on a fly trigger shortfall
    pub fn trigger_shortfall(&self) -> Option<(u32, u32)> {
        match self.error {
            TomoError::TriggerShortfall { expected, actual } => Some((expected, actual)),
            _ => None,
        }
    }
}

/// Outcome of [`RunEngine::run`]
#[derive(Debug)]
pub enum ScanResult {
    /// Every phase completed
    Success(ScanSummary),
    /// A device failed, timed out or the fly sweep fell short
    Failed(ScanFailure),
}

impl ScanResult {
    /// Whether every phase completed
    pub fn is_success(&self) -> bool {
        matches!(self, ScanResult::Success(_))
    }

    /// Summary of a successful run
    pub fn summary(&self) -> Option<&ScanSummary> {
        match self {
            ScanResult::Success(s) => Some(s),
            ScanResult::Failed(_) => None,
        }
    }

    /// Failure of an unsuccessful run
    pub fn failure(&self) -> Option<&ScanFailure> {
        match self {
            ScanResult::Success(_) => None,
            ScanResult::Failed(f) => Some(f),
        }
    }
}

/// Run-scoped state, created when a run begins
#[derive(Debug)]
struct ScanSession {
    run_id: u64,
    run_uid: String,
    mode: ScanMode,
    n_projections: u32,
    phase: ScanPhase,
    initial: BTreeMap<Axis, f64>,
    positions: BTreeMap<Axis, f64>,
    frame_type: Option<FrameType>,
    frame_history: Vec<FrameType>,
    suspender: Option<SuspenderHandle>,
    sink: SinkKind,
    last_checkpoint: Option<String>,
    num_events: u32,
    archived: u32,
}

impl ScanSession {
    fn new(run_id: u64, run_uid: String, plan: &TomoScan) -> Self {
        Self {
            run_id,
            run_uid,
            mode: plan.mode(),
            n_projections: plan.config().n_projections(),
            phase: ScanPhase::Setup,
            initial: BTreeMap::new(),
            positions: BTreeMap::new(),
            frame_type: None,
            frame_history: Vec::new(),
            suspender: None,
            sink: plan.sink().sink,
            last_checkpoint: None,
            num_events: 0,
            archived: 0,
        }
    }

    fn resolve(&self, axis: Axis, target: MoveTarget) -> AppResult<f64> {
        let initial = || {
            self.initial.get(&axis).copied().ok_or_else(|| {
                TomoError::InvalidConfig(format!("initial position of {} not recorded", axis))
            })
        };
        match target {
            MoveTarget::Absolute(p) => Ok(p),
            MoveTarget::Initial => initial(),
            MoveTarget::InitialOffset(d) => Ok(initial()? + d),
        }
    }
}

/// Await a device call under `limit`, naming the device on failure
async fn timed<T, F>(device: &str, operation: &str, limit: Duration, call: F) -> AppResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TomoError::device(device, operation, e)),
        Err(_) => Err(TomoError::DeviceTimeout {
            device: device.to_string(),
            operation: operation.to_string(),
            timeout: limit,
        }),
    }
}

/// The RunEngine executes tomography plans
pub struct RunEngine {
    /// Devices bound by the mode controller
    devices: DeviceContext,

    /// Session configuration
    config: SessionConfig,

    /// Beam suspenders
    monitor: Arc<BeamMonitor>,

    /// Output sink selection
    output: OutputConfigurator,

    /// Current engine state
    state: RwLock<EngineState>,

    /// Last issued run id
    run_counter: AtomicU64,

    /// Document broadcast channel
    doc_sender: broadcast::Sender<Document>,
}

impl RunEngine {
    /// Create an engine for `devices`
    pub fn new(devices: DeviceContext, config: SessionConfig) -> Self {
        let (doc_sender, _) = broadcast::channel(1024);
        let monitor = Arc::new(BeamMonitor::beamline(
            &config.suspenders,
            devices.shutter_permit.clone(),
            devices.ring_current.clone(),
        ));
        let output = OutputConfigurator::from_session(&config.session);

        Self {
            devices,
            config,
            monitor,
            output,
            state: RwLock::new(EngineState::Idle),
            run_counter: AtomicU64::new(0),
            doc_sender,
        }
    }

    /// Subscribe to document stream
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    /// Get current engine state
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Beam monitor gating this engine
    pub fn monitor(&self) -> &Arc<BeamMonitor> {
        &self.monitor
    }

    /// Devices this engine drives
    pub fn devices(&self) -> &DeviceContext {
        &self.devices
    }

    /// Build the plan `run` would execute, without touching devices
    pub fn plan(&self, config: &ScanConfig, mode: ScanMode) -> AppResult<TomoScan> {
        TomoScan::from_config(config, mode, &self.output)
    }

    /// Run one tomography acquisition
    ///
    /// Configuration problems and a concurrent run are returned as `Err`
    /// before any device command. Everything that goes wrong afterwards is
    /// reported as [`ScanResult::Failed`] once cleanup has run.
    #[instrument(skip_all, fields(mode = %mode), err)]
    pub async fn run(&self, config: &ScanConfig, mode: ScanMode) -> AppResult<ScanResult> {
        let plan = self.plan(config, mode)?;

        {
            let mut state = self.state.write().await;
            if *state != EngineState::Idle {
                return Err(TomoError::ScanInProgress);
            }
            *state = EngineState::Running;
        }

        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.execute_plan(plan, run_id).await;
        *self.state.write().await = EngineState::Idle;
        Ok(result)
    }

    #[instrument(skip(self, plan), fields(plan = %plan.plan_name()))]
    async fn execute_plan(&self, mut plan: TomoScan, run_id: u64) -> ScanResult {
        let start_doc = StartDoc::new(run_id, plan.plan_name())
            .with_args(plan.plan_args())
            .with_metadata(session_metadata(
                &self.config.session.beamline_id,
                &self.config.session.proposal_id,
            ));
        let run_uid = start_doc.uid.clone();
        let mut session = ScanSession::new(run_id, run_uid.clone(), &plan);
        self.emit_document(Document::Start(start_doc));

        info!(
            run_uid = %run_uid,
            n_projections = plan.num_points(),
            instrument = %self.devices.instrument_binding,
            beam = %self.devices.beam_binding,
            "Run started"
        );

        let mut failure = None;
        while let Some(cmd) = plan.next_command() {
            self.suspend_gate(&session).await;
            if let Err(e) = self.process_command(&mut session, cmd).await {
                error!(
                    run_uid = %run_uid,
                    phase = %session.phase,
                    checkpoint = ?session.last_checkpoint,
                    error = %e,
                    "Run failed"
                );
                failure = Some(e);
                break;
            }
        }

        let cleanup_errors = self.cleanup(&mut session).await;

        let stop_doc = match &failure {
            None => StopDoc::success(&run_uid, session.num_events),
            Some(e) => StopDoc::fail(&run_uid, &e.to_string(), session.num_events),
        };
        self.emit_document(Document::Stop(stop_doc));

        info!(
            run_uid = %run_uid,
            exit_status = if failure.is_none() { "success" } else { "fail" },
            num_events = session.num_events,
            archived = session.archived,
            "Run complete"
        );

        match failure {
            None => ScanResult::Success(ScanSummary {
                run_id,
                run_uid,
                mode: session.mode,
                n_projections: session.n_projections,
                triggers: session.num_events,
                archived: session.archived,
                frame_types: session.frame_history,
                sink: session.sink,
                cleanup_errors,
            }),
            Some(error) => ScanResult::Failed(ScanFailure {
                run_id,
                run_uid,
                phase: session.phase,
                error,
                frame_types: session.frame_history,
                cleanup_errors,
            }),
        }
    }

    /// Hold the command stream while a suspender is tripped
    async fn suspend_gate(&self, session: &ScanSession) {
        if !self.monitor.is_suspended() {
            return;
        }
        *self.state.write().await = EngineState::Suspended;
        warn!(
            run_id = session.run_id,
            phase = %session.phase,
            guards = ?self.monitor.tripped_guards(),
            "Run suspended, waiting for beam"
        );
        self.monitor.wait_until_clear().await;
        info!(run_id = session.run_id, phase = %session.phase, "Beam back, resuming run");
        *self.state.write().await = EngineState::Running;
    }

    /// Process a single plan command
    async fn process_command(&self, session: &mut ScanSession, cmd: PlanCommand) -> AppResult<()> {
        debug!(%cmd, "Processing command");
        let timeouts = self.config.timeouts;
        let d = &self.devices;

        match cmd {
            PlanCommand::BeginPhase(phase) => {
                session.phase = phase;
                info!(run_id = session.run_id, %phase, "Phase started");
            }

            PlanCommand::RecordPositions => {
                for axis in Axis::ALL {
                    let motor = d.motor(axis);
                    let position =
                        timed(motor.name(), "position", timeouts.motor, motor.position()).await?;
                    session.initial.insert(axis, position);
                    session.positions.insert(axis, position);
                }
                debug!(positions = ?session.initial, "Initial positions recorded");
            }

            PlanCommand::ConfigureSink { sink, settings } => {
                timed(
                    d.detector.name(),
                    "configure_sink",
                    timeouts.detector,
                    d.detector.configure_sink(sink, settings),
                )
                .await?;
            }

            PlanCommand::SetDetector(setting) => {
                timed(d.detector.name(), "set", timeouts.detector, d.detector.set(setting))
                    .await?;
                if let DetectorSetting::FrameType(tag) = setting {
                    session.frame_type = Some(tag);
                    session.frame_history.push(tag);
                    info!(frame_type = %tag, destination = tag.exchange_path(), "Frame type set");
                }
            }

            PlanCommand::OpenShutter => {
                timed(d.shutter.name(), "open", timeouts.shutter, d.shutter.open()).await?;
            }

            PlanCommand::CloseShutter => {
                timed(d.shutter.name(), "close", timeouts.shutter, d.shutter.close()).await?;
            }

            PlanCommand::InstallSuspender => {
                if session.suspender.is_none() {
                    session.suspender = Some(self.monitor.install().await);
                }
            }

            PlanCommand::RemoveSuspender => {
                if let Some(handle) = session.suspender.take() {
                    self.monitor.remove(&handle).await;
                }
            }

            PlanCommand::MoveTo { axis, target } => {
                let position = session.resolve(axis, target)?;
                let motor = d.motor(axis);
                timed(motor.name(), "move", timeouts.motor, motor.move_abs(position)).await?;
                session.positions.insert(axis, position);
            }

            PlanCommand::Checkpoint { label } => {
                debug!(checkpoint = %label, "Checkpoint");
                session.last_checkpoint = Some(label);
            }

            PlanCommand::TriggerAndRead => {
                let acq = timed(
                    d.detector.name(),
                    "trigger",
                    timeouts.detector,
                    d.detector.trigger_and_read(),
                )
                .await?;
                self.record_event(session, acq.images, acq.archived);
            }

            PlanCommand::ConfigureFly(params) => {
                timed(
                    d.fly_trigger.name(),
                    "configure",
                    timeouts.fly,
                    d.fly_trigger.configure(params),
                )
                .await?;
            }

            PlanCommand::Taxi => {
                timed(d.fly_trigger.name(), "taxi", timeouts.fly, d.fly_trigger.taxi()).await?;
            }

            PlanCommand::FlyAndCollect => {
                self.fly_and_collect(session).await?;
            }
        }
        Ok(())
    }

    /// Start the detector, sweep, and wait for both under the stall watchdog
    async fn fly_and_collect(&self, session: &mut ScanSession) -> AppResult<()> {
        let timeouts = self.config.timeouts;
        let det = &self.devices.detector;
        let fly = &self.devices.fly_trigger;

        timed(det.name(), "start_acquisition", timeouts.detector, det.start_acquisition()).await?;

        let expected = session.n_projections;
        let mut sweep = Box::pin(async {
            let report = timed(fly.name(), "fly", timeouts.fly, fly.fly()).await?;
            if report.actual != expected {
                return Ok((report, None));
            }
            let acq = timed(det.name(), "wait_acquisition", timeouts.fly, det.wait_acquisition())
                .await?;
            Ok::<_, TomoError>((report, Some(acq)))
        });

        let outcome = tokio::select! {
            res = &mut sweep => Ok(res),
            stalled_at = self.stall_watchdog() => Err(stalled_at),
        };
        drop(sweep);

        match outcome {
            Ok(Ok((_, Some(acq)))) => {
                self.record_event(session, acq.images, acq.archived);
                Ok(())
            }
            Ok(Ok((report, None))) => {
                self.stop_detector().await;
                warn!(
                    expected,
                    reported_expected = report.expected,
                    actual = report.actual,
                    "Fly controller delivered the wrong trigger count"
                );
                Err(TomoError::TriggerShortfall {
                    expected,
                    actual: report.actual,
                })
            }
            Ok(Err(e)) => {
                self.stop_detector().await;
                Err(e)
            }
            Err(stalled_at) => {
                warn!(
                    images = stalled_at,
                    stall_timeout = ?self.config.fly.stall_timeout,
                    "Image counter stalled, forcing internal trigger"
                );
                timed(
                    det.name(),
                    "set",
                    timeouts.detector,
                    det.set(DetectorSetting::TriggerMode(TriggerMode::Internal)),
                )
                .await?;
                match timed(det.name(), "wait_acquisition", timeouts.detector, det.wait_acquisition())
                    .await
                {
                    Ok(acq) => self.record_event(session, acq.images, acq.archived),
                    Err(e) => {
                        warn!(error = %e, "Forced acquisition did not finish");
                        self.stop_detector().await;
                    }
                }
                Err(TomoError::TriggerShortfall {
                    expected: session.n_projections,
                    actual: stalled_at,
                })
            }
        }
    }

    /// Resolve with the image count once it has not advanced for `stall_timeout`
    async fn stall_watchdog(&self) -> u32 {
        let det = &self.devices.detector;
        let mut ticker = tokio::time::interval(self.config.fly.stall_poll);
        let mut last_count = 0u32;
        let mut last_change = Instant::now();

        loop {
            ticker.tick().await;
            match det.images_collected().await {
                Ok(count) if count != last_count => {
                    last_count = count;
                    last_change = Instant::now();
                }
                Ok(_) => {
                    if last_change.elapsed() >= self.config.fly.stall_timeout {
                        return last_count;
                    }
                }
                Err(e) => debug!(error = %e, "Image counter read failed"),
            }
        }
    }

    async fn stop_detector(&self) {
        let det = &self.devices.detector;
        if let Err(e) = timed(
            det.name(),
            "stop_acquisition",
            self.config.timeouts.detector,
            det.stop_acquisition(),
        )
        .await
        {
            warn!(error = %e, "Failed to stop acquisition");
        }
    }

    fn record_event(&self, session: &mut ScanSession, images: u32, archived: u32) {
        session.num_events += 1;
        session.archived += archived;
        let mut event = EventDoc::new(&session.run_uid, session.num_events)
            .with_counts(images, archived)
            .with_frame_type(session.frame_type);
        for (axis, position) in &session.positions {
            event = event.with_position(&axis.to_string(), *position);
        }
        debug!(
            seq_num = session.num_events,
            frame_type = ?session.frame_type,
            images,
            archived,
            "Trigger complete"
        );
        self.emit_document(Document::Event(event));
    }

    /// Return the devices to a safe state; every step runs even if an earlier one failed
    async fn cleanup(&self, session: &mut ScanSession) -> Vec<String> {
        *self.state.write().await = EngineState::Cleanup;
        let timeouts = self.config.timeouts;
        let d = &self.devices;
        let mut errors = Vec::new();
        let mut note = |result: AppResult<()>| {
            if let Err(e) = result {
                warn!(error = %e, "Cleanup step failed");
                errors.push(e.to_string());
            }
        };

        if let Some(handle) = session.suspender.take() {
            self.monitor.remove(&handle).await;
        }

        note(timed(d.shutter.name(), "close", timeouts.shutter, d.shutter.close()).await);

        for axis in Axis::ALL {
            if let Some(&position) = session.initial.get(&axis) {
                let motor = d.motor(axis);
                note(timed(motor.name(), "move", timeouts.motor, motor.move_abs(position)).await);
            }
        }

        note(
            timed(
                d.detector.name(),
                "set",
                timeouts.detector,
                d.detector.set(DetectorSetting::TriggerMode(TriggerMode::Internal)),
            )
            .await,
        );
        note(timed(d.detector.name(), "unstage", timeouts.detector, d.detector.unstage()).await);

        debug!(run_id = session.run_id, errors = errors.len(), "Cleanup finished");
        errors
    }

    fn emit_document(&self, doc: Document) {
        // No subscribers is fine
        let _ = self.doc_sender.send(doc);
    }
}
