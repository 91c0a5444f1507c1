//! Simulated devices
//!
//! In-process stand-ins for every capability trait, used in debug mode and by
//! the test suite. All simulations use async-safe waits (`tokio::time::sleep`),
//! and default to zero motion/readout time so scans complete instantly.
//!
//! # Available Simulations
//!
//! - `SimMotor` - axis with optional speed and a move history
//! - `SimShutter` - shutter that drives its own PSS permit signal
//! - `SimSignal` - settable scalar signal (ring current, permits)
//! - `SimDetector` - camera with frame filter, two sinks and an archive log
//! - `SimFlyTrigger` - fly controller that pulses a `SimDetector`
//!
//! Faults are injected per operation with [`FaultInjector`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use super::{
    Acquisition, AreaDetector, ArrayPort, DetectorSetting, FlyParams, FlyTrigger, ImageMode,
    Motor, Shutter, ShutterState, SignalSource, SinkKind, SinkSettings, TriggerMode,
    TriggerReport,
};
use crate::scan::FrameType;

// =============================================================================
// Fault Injection
// =============================================================================

/// A scripted failure of one device operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The `call`-th invocation of `operation` never completes
    Hang {
        /// Operation name, e.g. `"move"`
        operation: &'static str,
        /// 1-based invocation number
        call: u32,
    },
    /// The `call`-th invocation of `operation` returns an error
    Fail {
        /// Operation name, e.g. `"open"`
        operation: &'static str,
        /// 1-based invocation number
        call: u32,
    },
}

/// Per-device fault schedule with invocation counters
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    faults: Arc<Vec<Fault>>,
    counts: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl FaultInjector {
    /// No faults
    pub fn none() -> Self {
        Self::default()
    }

    /// A single fault
    pub fn fault(fault: Fault) -> Self {
        Self::faults(vec![fault])
    }

    /// Several faults
    pub fn faults(faults: Vec<Fault>) -> Self {
        Self {
            faults: Arc::new(faults),
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count an invocation and apply any fault scheduled for it
    async fn check(&self, device: &str, operation: &'static str) -> Result<()> {
        let n = {
            let mut counts = self.counts.lock().await;
            let count = counts.entry(operation).or_insert(0);
            *count += 1;
            *count
        };

        for fault in self.faults.iter() {
            match *fault {
                Fault::Hang { operation: op, call } if op == operation && call == n => {
                    warn!(device, operation, call, "Injected hang");
                    std::future::pending::<()>().await;
                }
                Fault::Fail { operation: op, call } if op == operation && call == n => {
                    bail!("{}: injected failure on {} #{}", device, operation, call);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

async fn pause_for(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        sleep(delay).await;
    }
}

// =============================================================================
// SimMotor
// =============================================================================

/// Simulated motor axis
///
/// # Example
///
/// ```rust,ignore
/// let stage = SimMotor::new("sample_x", 0.0).with_speed(5.0);
/// stage.move_abs(10.0).await?; // Takes ~2 seconds
/// assert_eq!(stage.position().await?, 10.0);
/// ```
pub struct SimMotor {
    name: String,
    position: RwLock<f64>,
    speed: Option<f64>,
    history: Mutex<Vec<f64>>,
    faults: FaultInjector,
}

impl SimMotor {
    /// Create an instantaneous axis at `position`
    pub fn new(name: &str, position: f64) -> Self {
        Self {
            name: name.to_string(),
            position: RwLock::new(position),
            speed: None,
            history: Mutex::new(Vec::new()),
            faults: FaultInjector::none(),
        }
    }

    /// Move at `units_per_sec` instead of instantly
    pub fn with_speed(mut self, units_per_sec: f64) -> Self {
        self.speed = Some(units_per_sec);
        self
    }

    /// Attach a fault schedule (operation `"move"`)
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    /// Targets of every completed move, in order
    pub async fn history(&self) -> Vec<f64> {
        self.history.lock().await.clone()
    }

    /// Set the readback without a move (fly controller sweeps)
    pub async fn set_position(&self, position: f64) {
        *self.position.write().await = position;
    }
}

#[async_trait]
impl Motor for SimMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn move_abs(&self, target: f64) -> Result<()> {
        self.faults.check(&self.name, "move").await?;

        let current = *self.position.read().await;
        let delay = match self.speed {
            Some(speed) if speed > 0.0 => Duration::from_secs_f64((target - current).abs() / speed),
            _ => Duration::ZERO,
        };
        debug!(motor = %self.name, from = current, to = target, ?delay, "Moving");
        pause_for(delay).await;

        *self.position.write().await = target;
        self.history.lock().await.push(target);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }
}

// =============================================================================
// SimSignal
// =============================================================================

/// Settable scalar signal
pub struct SimSignal {
    name: String,
    tx: watch::Sender<f64>,
}

impl SimSignal {
    /// Create a signal holding `initial`
    pub fn new(name: &str, initial: f64) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            name: name.to_string(),
            tx,
        }
    }

    /// Publish a new value
    pub fn set(&self, value: f64) {
        self.tx.send_replace(value);
    }

    /// Current value
    pub fn value(&self) -> f64 {
        *self.tx.borrow()
    }
}

impl SignalSource for SimSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self) -> watch::Receiver<f64> {
        self.tx.subscribe()
    }
}

// =============================================================================
// SimShutter
// =============================================================================

/// Simulated shutter
///
/// Publishes 1.0 on its permit signal while open and 0.0 while closed, so a
/// permit suspender left installed across a close trips exactly as it would
/// on the beamline.
pub struct SimShutter {
    name: String,
    state: RwLock<ShutterState>,
    permit: Arc<SimSignal>,
    history: Mutex<Vec<ShutterState>>,
    faults: FaultInjector,
}

impl SimShutter {
    /// Create a closed shutter
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(ShutterState::Closed),
            permit: Arc::new(SimSignal::new(&format!("{}_permit", name), 0.0)),
            history: Mutex::new(Vec::new()),
            faults: FaultInjector::none(),
        }
    }

    /// Attach a fault schedule (operations `"open"`, `"close"`)
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    /// Permit signal driven by this shutter
    pub fn permit(&self) -> Arc<SimSignal> {
        self.permit.clone()
    }

    /// Every completed actuation, in order
    pub async fn history(&self) -> Vec<ShutterState> {
        self.history.lock().await.clone()
    }

    async fn actuate(&self, target: ShutterState) {
        *self.state.write().await = target;
        self.permit.set(match target {
            ShutterState::Open => 1.0,
            ShutterState::Closed => 0.0,
        });
        self.history.lock().await.push(target);
        debug!(shutter = %self.name, state = ?target, "Shutter actuated");
    }
}

#[async_trait]
impl Shutter for SimShutter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<()> {
        self.faults.check(&self.name, "open").await?;
        self.actuate(ShutterState::Open).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.faults.check(&self.name, "close").await?;
        self.actuate(ShutterState::Closed).await;
        Ok(())
    }

    async fn state(&self) -> Result<ShutterState> {
        Ok(*self.state.read().await)
    }
}

// =============================================================================
// SimDetector
// =============================================================================

/// One frame written by a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFrame {
    /// Sink that wrote the frame
    pub sink: SinkKind,
    /// Tag active when the frame was produced
    pub frame_type: Option<FrameType>,
    /// 0-based index within the sink's capture
    pub index: u32,
    /// Rendered file name
    pub file_name: String,
}

/// One acquisition start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRecord {
    /// Tag active at the start
    pub frame_type: Option<FrameType>,
    /// Trigger source at the start
    pub trigger_mode: TriggerMode,
    /// Images requested
    pub num_images: u32,
}

#[derive(Debug)]
struct DetectorState {
    acquire_time: f64,
    acquire_period: f64,
    trigger_mode: TriggerMode,
    image_mode: ImageMode,
    num_images: u32,
    frame_type: Option<FrameType>,
    filter: Option<u32>,
    filter_accum: u32,
    port: ArrayPort,
    sinks: HashMap<SinkKind, SinkSettings>,
    sink_counts: HashMap<SinkKind, u32>,
    acquiring: bool,
    collected: u32,
    archived_this: u32,
    archive: Vec<ArchivedFrame>,
    triggers: Vec<TriggerRecord>,
    frame_type_log: Vec<FrameType>,
}

impl DetectorState {
    fn new() -> Self {
        let mut sinks = HashMap::new();
        sinks.insert(SinkKind::Tiff, SinkSettings::disabled());
        sinks.insert(SinkKind::Hdf5, SinkSettings::disabled());
        Self {
            acquire_time: 0.05,
            acquire_period: 0.06,
            trigger_mode: TriggerMode::Internal,
            image_mode: ImageMode::Multiple,
            num_images: 1,
            frame_type: None,
            filter: None,
            filter_accum: 0,
            port: ArrayPort::Proc1,
            sinks,
            sink_counts: HashMap::new(),
            acquiring: false,
            collected: 0,
            archived_this: 0,
            archive: Vec::new(),
            triggers: Vec::new(),
            frame_type_log: Vec::new(),
        }
    }

    /// Produce one camera image and route it through filter and sinks
    fn produce_frame(&mut self) {
        self.collected += 1;
        let averaged = match (self.port, self.filter) {
            (ArrayPort::Proc1, Some(n)) => {
                self.filter_accum += 1;
                if self.filter_accum >= n {
                    self.filter_accum = 0;
                    true
                } else {
                    false
                }
            }
            _ => true,
        };
        if averaged {
            self.archive_frame();
        }
    }

    fn archive_frame(&mut self) {
        let Some((&kind, settings)) = self
            .sinks
            .iter()
            .find(|(_, s)| s.enabled && s.capture)
        else {
            return;
        };
        let count = self.sink_counts.entry(kind).or_insert(0);
        if *count >= settings.num_capture {
            return;
        }
        let file_name = render_template(
            &settings.file_template,
            &settings.file_path.to_string_lossy(),
            &settings.file_name,
            *count,
        );
        self.archive.push(ArchivedFrame {
            sink: kind,
            frame_type: self.frame_type,
            index: *count,
            file_name,
        });
        *count += 1;
        self.archived_this += 1;
    }

    fn acquisition(&self) -> Acquisition {
        Acquisition {
            images: self.collected,
            archived: self.archived_this,
        }
    }
}

/// Render a `%s%s_%06d.ext` style template
fn render_template(template: &str, path: &str, name: &str, index: u32) -> String {
    template
        .replacen("%s", path, 1)
        .replacen("%s", name, 1)
        .replacen("%06d", &format!("{:06}", index), 1)
}

/// Simulated area detector
///
/// Internal-trigger acquisitions produce their images on their own; external
/// trigger acquisitions wait for [`SimDetector::pulse`]. Switching to internal
/// trigger mid-acquisition makes the camera finish the remaining images by
/// itself, which is how a stalled fly scan is recovered.
pub struct SimDetector {
    name: String,
    state: Mutex<DetectorState>,
    progress: watch::Sender<u64>,
    frame_delay: Duration,
    stall_after: Option<u32>,
    faults: FaultInjector,
}

impl SimDetector {
    /// Create an idle detector with both sinks disabled
    pub fn new(name: &str) -> Self {
        let (progress, _rx) = watch::channel(0);
        Self {
            name: name.to_string(),
            state: Mutex::new(DetectorState::new()),
            progress,
            frame_delay: Duration::ZERO,
            stall_after: None,
            faults: FaultInjector::none(),
        }
    }

    /// Readout time per internally triggered image
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Ignore external pulses once `images` have been collected
    pub fn with_stall_after(mut self, images: u32) -> Self {
        self.stall_after = Some(images);
        self
    }

    /// Attach a fault schedule (operations `"set"`, `"acquire"`)
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    /// Deliver one external trigger pulse
    pub async fn pulse(&self) {
        {
            let mut st = self.state.lock().await;
            let stalled = self.stall_after.is_some_and(|n| st.collected >= n);
            if !st.acquiring
                || st.trigger_mode == TriggerMode::Internal
                || st.collected >= st.num_images
                || stalled
            {
                return;
            }
            st.produce_frame();
        }
        self.bump();
    }

    /// Every archived frame, in write order
    pub async fn archive(&self) -> Vec<ArchivedFrame> {
        self.state.lock().await.archive.clone()
    }

    /// Archived frame count per tag
    pub async fn archived_by_type(&self) -> HashMap<FrameType, u32> {
        let mut counts = HashMap::new();
        for frame in self.state.lock().await.archive.iter() {
            if let Some(tag) = frame.frame_type {
                *counts.entry(tag).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Every acquisition start, in order
    pub async fn triggers(&self) -> Vec<TriggerRecord> {
        self.state.lock().await.triggers.clone()
    }

    /// Every frame-type write, in order
    pub async fn frame_type_log(&self) -> Vec<FrameType> {
        self.state.lock().await.frame_type_log.clone()
    }

    /// Current trigger mode
    pub async fn trigger_mode(&self) -> TriggerMode {
        self.state.lock().await.trigger_mode
    }

    /// Current sink source port
    pub async fn port(&self) -> ArrayPort {
        self.state.lock().await.port
    }

    fn bump(&self) {
        self.progress.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl AreaDetector for SimDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, setting: DetectorSetting) -> Result<()> {
        self.faults.check(&self.name, "set").await?;
        {
            let mut st = self.state.lock().await;
            match setting {
                DetectorSetting::AcquireTime(t) => st.acquire_time = t,
                DetectorSetting::AcquirePeriod(t) => st.acquire_period = t,
                DetectorSetting::TriggerMode(mode) => st.trigger_mode = mode,
                DetectorSetting::ImageMode(mode) => st.image_mode = mode,
                DetectorSetting::NumImages(n) => st.num_images = n,
                DetectorSetting::FrameType(tag) => {
                    st.frame_type = Some(tag);
                    st.frame_type_log.push(tag);
                }
                DetectorSetting::FrameFilter(n) => {
                    st.filter = n;
                    st.filter_accum = 0;
                }
                DetectorSetting::SinkPort(port) => st.port = port,
            }
        }
        // Waiters re-check the trigger mode
        self.bump();
        Ok(())
    }

    async fn configure_sink(&self, sink: SinkKind, settings: SinkSettings) -> Result<()> {
        self.faults.check(&self.name, "set").await?;
        let mut st = self.state.lock().await;
        st.sink_counts.insert(sink, 0);
        st.sinks.insert(sink, settings);
        Ok(())
    }

    async fn sink(&self, sink: SinkKind) -> Result<SinkSettings> {
        let st = self.state.lock().await;
        st.sinks
            .get(&sink)
            .cloned()
            .ok_or_else(|| anyhow!("{}: no sink {}", self.name, sink))
    }

    async fn start_acquisition(&self) -> Result<()> {
        self.faults.check(&self.name, "acquire").await?;
        {
            let mut st = self.state.lock().await;
            if st.acquiring {
                bail!("{}: acquisition already running", self.name);
            }
            if st.image_mode == ImageMode::Single {
                st.num_images = 1;
            }
            st.acquiring = true;
            st.collected = 0;
            st.archived_this = 0;
            let record = TriggerRecord {
                frame_type: st.frame_type,
                trigger_mode: st.trigger_mode,
                num_images: st.num_images,
            };
            st.triggers.push(record);
            debug!(
                detector = %self.name,
                images = st.num_images,
                exposure = st.acquire_time,
                period = st.acquire_period,
                "Acquisition started"
            );
        }
        self.bump();
        Ok(())
    }

    async fn wait_acquisition(&self) -> Result<Acquisition> {
        let mut rx = self.progress.subscribe();
        loop {
            let internal = {
                let mut st = self.state.lock().await;
                if !st.acquiring {
                    return Ok(st.acquisition());
                }
                if st.collected >= st.num_images {
                    st.acquiring = false;
                    return Ok(st.acquisition());
                }
                if st.trigger_mode == TriggerMode::Internal {
                    st.produce_frame();
                    true
                } else {
                    false
                }
            };

            if internal {
                pause_for(self.frame_delay).await;
            } else if rx.changed().await.is_err() {
                bail!("{}: progress channel closed", self.name);
            }
        }
    }

    async fn stop_acquisition(&self) -> Result<()> {
        self.state.lock().await.acquiring = false;
        self.bump();
        Ok(())
    }

    async fn images_collected(&self) -> Result<u32> {
        Ok(self.state.lock().await.collected)
    }

    async fn unstage(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        for settings in st.sinks.values_mut() {
            settings.capture = false;
        }
        Ok(())
    }
}

// =============================================================================
// SimFlyTrigger
// =============================================================================

/// Simulated taxi/fly controller
///
/// When wired to a [`SimDetector`] every emitted pulse triggers one image;
/// when wired to a [`SimMotor`] the rotation readback follows the sweep.
pub struct SimFlyTrigger {
    name: String,
    params: Mutex<Option<FlyParams>>,
    taxied: Mutex<bool>,
    detector: Option<Arc<SimDetector>>,
    rotation: Option<Arc<SimMotor>>,
    pulse_interval: Duration,
    deliver_limit: Option<u32>,
    sweep_count: Option<u32>,
    faults: FaultInjector,
}

impl SimFlyTrigger {
    /// Create an unwired controller
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Mutex::new(None),
            taxied: Mutex::new(false),
            detector: None,
            rotation: None,
            pulse_interval: Duration::ZERO,
            deliver_limit: None,
            sweep_count: None,
            faults: FaultInjector::none(),
        }
    }

    /// Deliver pulses to `detector`
    pub fn with_detector(mut self, detector: Arc<SimDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Update `rotation` as the sweep progresses
    pub fn with_rotation(mut self, rotation: Arc<SimMotor>) -> Self {
        self.rotation = Some(rotation);
        self
    }

    /// Time between pulses
    pub fn with_pulse_interval(mut self, interval: Duration) -> Self {
        self.pulse_interval = interval;
        self
    }

    /// Deliver at most `actual` pulses per sweep
    pub fn with_shortfall(mut self, actual: u32) -> Self {
        self.deliver_limit = Some(actual);
        self
    }

    /// Treat every sweep as `triggers` pulses long, regardless of the
    /// configured range. Both the pulses sent and the reported expected
    /// count follow this miscount.
    pub fn with_miscounted_sweep(mut self, triggers: u32) -> Self {
        self.sweep_count = Some(triggers);
        self
    }

    /// Attach a fault schedule (operations `"configure"`, `"taxi"`, `"fly"`)
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }
}

#[async_trait]
impl FlyTrigger for SimFlyTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, params: FlyParams) -> Result<()> {
        self.faults.check(&self.name, "configure").await?;
        *self.params.lock().await = Some(params);
        *self.taxied.lock().await = false;
        Ok(())
    }

    async fn taxi(&self) -> Result<()> {
        self.faults.check(&self.name, "taxi").await?;
        let params = (*self.params.lock().await)
            .ok_or_else(|| anyhow!("{}: taxi before configure", self.name))?;
        if let Some(rotation) = &self.rotation {
            rotation.set_position(params.start).await;
        }
        *self.taxied.lock().await = true;
        Ok(())
    }

    async fn fly(&self) -> Result<TriggerReport> {
        self.faults.check(&self.name, "fly").await?;
        let params = (*self.params.lock().await)
            .ok_or_else(|| anyhow!("{}: fly before configure", self.name))?;
        {
            let mut taxied = self.taxied.lock().await;
            if !*taxied {
                bail!("{}: fly before taxi", self.name);
            }
            *taxied = false;
        }

        let expected = self.sweep_count.unwrap_or_else(|| params.expected_triggers());
        let delivered = self.deliver_limit.map_or(expected, |limit| limit.min(expected));
        for i in 0..delivered {
            pause_for(self.pulse_interval).await;
            if let Some(rotation) = &self.rotation {
                rotation
                    .set_position(params.start + params.step * f64::from(i))
                    .await;
            }
            if let Some(detector) = &self.detector {
                detector.pulse().await;
            }
        }
        if let Some(rotation) = &self.rotation {
            rotation.set_position(params.end).await;
        }

        debug!(fly = %self.name, expected, delivered, "Sweep finished");
        Ok(TriggerReport {
            expected,
            actual: delivered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn capturing_sink(num_capture: u32) -> SinkSettings {
        SinkSettings {
            enabled: true,
            num_capture,
            file_path: PathBuf::from("/data/"),
            file_name: "s".to_string(),
            file_template: "%s%s_%06d.h5".to_string(),
            capture: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_motor_moves_and_records_history() {
        let motor = SimMotor::new("x", 1.0);
        motor.move_abs(3.5).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 3.5);
        assert_eq!(motor.history().await, vec![3.5]);
    }

    #[tokio::test]
    async fn test_injected_failure_hits_only_that_call() {
        let motor = SimMotor::new("x", 0.0)
            .with_faults(FaultInjector::fault(Fault::Fail { operation: "move", call: 2 }));
        assert!(motor.move_abs(1.0).await.is_ok());
        assert!(motor.move_abs(2.0).await.is_err());
        assert!(motor.move_abs(3.0).await.is_ok());
        assert_eq!(motor.position().await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn test_injected_hang_never_resolves() {
        let motor = SimMotor::new("x", 0.0)
            .with_faults(FaultInjector::fault(Fault::Hang { operation: "move", call: 1 }));
        let res = tokio::time::timeout(Duration::from_millis(20), motor.move_abs(1.0)).await;
        assert!(res.is_err());
        assert_eq!(motor.position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_shutter_drives_permit() {
        let shutter = SimShutter::new("A_shutter");
        let permit = shutter.permit();
        assert_eq!(permit.value(), 0.0);
        shutter.open().await.unwrap();
        assert_eq!(permit.value(), 1.0);
        shutter.close().await.unwrap();
        assert_eq!(permit.value(), 0.0);
        assert_eq!(
            shutter.history().await,
            vec![ShutterState::Open, ShutterState::Closed]
        );
    }

    #[tokio::test]
    async fn test_filter_averages_into_archive() {
        let det = SimDetector::new("det");
        det.configure_sink(SinkKind::Hdf5, capturing_sink(100)).await.unwrap();
        det.set(DetectorSetting::FrameFilter(Some(5))).await.unwrap();
        det.set(DetectorSetting::NumImages(15)).await.unwrap();
        det.set(DetectorSetting::FrameType(FrameType::WhiteFront)).await.unwrap();

        let acq = det.trigger_and_read().await.unwrap();
        assert_eq!(acq, Acquisition { images: 15, archived: 3 });

        let archive = det.archive().await;
        assert_eq!(archive.len(), 3);
        assert_eq!(archive[2].file_name, "/data/s_000002.h5");
        assert!(archive.iter().all(|f| f.frame_type == Some(FrameType::WhiteFront)));
    }

    #[tokio::test]
    async fn test_raw_port_bypasses_filter() {
        let det = SimDetector::new("det");
        det.configure_sink(SinkKind::Tiff, capturing_sink(100)).await.unwrap();
        det.set(DetectorSetting::FrameFilter(Some(5))).await.unwrap();
        det.set(DetectorSetting::SinkPort(ArrayPort::Pg1)).await.unwrap();
        det.set(DetectorSetting::NumImages(4)).await.unwrap();
        let acq = det.trigger_and_read().await.unwrap();
        assert_eq!(acq.archived, 4);
    }

    #[tokio::test]
    async fn test_sink_stops_at_num_capture() {
        let det = SimDetector::new("det");
        det.configure_sink(SinkKind::Hdf5, capturing_sink(2)).await.unwrap();
        det.set(DetectorSetting::NumImages(5)).await.unwrap();
        let acq = det.trigger_and_read().await.unwrap();
        assert_eq!(acq.images, 5);
        assert_eq!(acq.archived, 2);
    }

    #[tokio::test]
    async fn test_fly_pulses_detector() {
        let det = Arc::new(SimDetector::new("det"));
        det.configure_sink(SinkKind::Hdf5, capturing_sink(100)).await.unwrap();
        det.set(DetectorSetting::SinkPort(ArrayPort::Pg1)).await.unwrap();
        det.set(DetectorSetting::TriggerMode(TriggerMode::Bulb)).await.unwrap();
        det.set(DetectorSetting::NumImages(11)).await.unwrap();

        let fly = SimFlyTrigger::new("psofly").with_detector(det.clone());
        fly.configure(FlyParams {
            start: 0.0,
            end: 5.0,
            step: 0.5,
            slew_speed: 1.0,
            acceleration: None,
        })
        .await
        .unwrap();
        fly.taxi().await.unwrap();

        det.start_acquisition().await.unwrap();
        let report = fly.fly().await.unwrap();
        assert!(report.is_complete());
        let acq = det.wait_acquisition().await.unwrap();
        assert_eq!(acq.images, 11);
    }

    #[tokio::test]
    async fn test_fly_requires_taxi() {
        let fly = SimFlyTrigger::new("psofly");
        fly.configure(FlyParams {
            start: 0.0,
            end: 1.0,
            step: 0.5,
            slew_speed: 1.0,
            acceleration: None,
        })
        .await
        .unwrap();
        assert!(fly.fly().await.is_err());
    }

    #[tokio::test]
    async fn test_internal_switch_finishes_stalled_acquisition() {
        let det = Arc::new(SimDetector::new("det").with_stall_after(2));
        det.set(DetectorSetting::TriggerMode(TriggerMode::Bulb)).await.unwrap();
        det.set(DetectorSetting::NumImages(6)).await.unwrap();
        det.start_acquisition().await.unwrap();
        for _ in 0..6 {
            det.pulse().await;
        }
        assert_eq!(det.images_collected().await.unwrap(), 2);

        det.set(DetectorSetting::TriggerMode(TriggerMode::Internal)).await.unwrap();
        let acq = det.wait_acquisition().await.unwrap();
        assert_eq!(acq.images, 6);
    }
}
