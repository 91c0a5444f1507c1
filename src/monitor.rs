//! Beam-availability suspenders
//!
//! A [`SuspendFloor`] trips when its signal drops below a floor and clears
//! only once the signal is back at or above the resume threshold. The
//! [`BeamMonitor`] runs one watcher task per installed guard and exposes a
//! single gate: while any guard is tripped, [`BeamMonitor::wait_until_clear`]
//! blocks. The run engine awaits that gate before every command, so the
//! command in flight always finishes and the next one waits for the beam.
//!
//! Suspenders never abort a run.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SuspenderConfig;
use crate::devices::SignalSource;

/// Floor guard with hysteresis
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendFloor {
    /// Guard name used in logs
    pub name: String,
    /// Values below this trip the guard
    pub floor: f64,
    /// Values at or above this clear a tripped guard
    pub resume: f64,
}

impl SuspendFloor {
    /// Guard that resumes as soon as the floor is regained
    pub fn new(name: &str, floor: f64) -> Self {
        Self {
            name: name.to_string(),
            floor,
            resume: floor,
        }
    }

    /// Require `resume` before a tripped guard clears
    pub fn with_resume(mut self, resume: f64) -> Self {
        self.resume = resume.max(self.floor);
        self
    }

    /// Next tripped state given the current one and a new value
    pub fn evaluate(&self, tripped: bool, value: f64) -> bool {
        if tripped {
            value < self.resume
        } else {
            value < self.floor
        }
    }
}

/// Token for one installed set of guards
///
/// Removing it through [`BeamMonitor::remove`] more than once is harmless.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SuspenderHandle {
    id: u64,
}

impl SuspenderHandle {
    /// Numeric id, for logs
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Installed {
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

type TrippedSet = BTreeSet<(u64, String)>;

/// Watches beam signals and gates the command stream
pub struct BeamMonitor {
    guards: Vec<(SuspendFloor, Arc<dyn SignalSource>)>,
    next_id: AtomicU64,
    installed: Mutex<HashMap<u64, Installed>>,
    tripped: Arc<watch::Sender<TrippedSet>>,
}

impl BeamMonitor {
    /// Monitor with no guards
    pub fn new() -> Self {
        let (tripped, _rx) = watch::channel(BTreeSet::new());
        Self {
            guards: Vec::new(),
            next_id: AtomicU64::new(1),
            installed: Mutex::new(HashMap::new()),
            tripped: Arc::new(tripped),
        }
    }

    /// Standard guards: shutter PSS permit and ring current
    pub fn beamline(
        config: &SuspenderConfig,
        shutter_permit: Arc<dyn SignalSource>,
        ring_current: Arc<dyn SignalSource>,
    ) -> Self {
        Self::new()
            .with_guard(
                SuspendFloor::new("shutter_permit", config.shutter_floor),
                shutter_permit,
            )
            .with_guard(
                SuspendFloor::new("ring_current", config.current_floor)
                    .with_resume(config.current_resume),
                ring_current,
            )
    }

    /// Add a guard on `signal`
    pub fn with_guard(mut self, guard: SuspendFloor, signal: Arc<dyn SignalSource>) -> Self {
        self.guards.push((guard, signal));
        self
    }

    /// Start watching every guard
    ///
    /// Guards are evaluated against their current value before this returns,
    /// so a signal that is already low suspends the very next command.
    pub async fn install(&self) -> SuspenderHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::with_capacity(self.guards.len());

        for (guard, signal) in &self.guards {
            let mut rx = signal.subscribe();
            let initial = guard.evaluate(false, *rx.borrow_and_update());
            if initial {
                warn!(guard = %guard.name, floor = guard.floor, "Beam unavailable at install, suspending");
                self.tripped.send_modify(|set| {
                    set.insert((id, guard.name.clone()));
                });
            }

            let guard = guard.clone();
            let alive = alive.clone();
            let tripped_tx = self.tripped.clone();
            tasks.push(tokio::spawn(async move {
                let mut tripped = initial;
                while rx.changed().await.is_ok() {
                    let value = *rx.borrow_and_update();
                    let next = guard.evaluate(tripped, value);
                    if next == tripped {
                        continue;
                    }
                    tripped = next;
                    if tripped {
                        warn!(guard = %guard.name, value, floor = guard.floor, "Suspending: signal below floor");
                    } else {
                        info!(guard = %guard.name, value, resume = guard.resume, "Signal recovered, resuming");
                    }
                    tripped_tx.send_if_modified(|set| {
                        if !alive.load(Ordering::SeqCst) {
                            return false;
                        }
                        let key = (id, guard.name.clone());
                        if tripped {
                            set.insert(key)
                        } else {
                            set.remove(&key)
                        }
                    });
                }
            }));
        }

        debug!(handle = id, guards = self.guards.len(), "Suspenders installed");
        self.installed
            .lock()
            .await
            .insert(id, Installed { alive, tasks });
        SuspenderHandle { id }
    }

    /// Stop watching the guards of `handle` and drop any suspension they hold
    ///
    /// Removing a handle twice, or one this monitor never issued, does nothing.
    pub async fn remove(&self, handle: &SuspenderHandle) {
        let Some(installed) = self.installed.lock().await.remove(&handle.id) else {
            debug!(handle = handle.id, "Suspender not installed, nothing to remove");
            return;
        };

        installed.alive.store(false, Ordering::SeqCst);
        for task in &installed.tasks {
            task.abort();
        }
        self.tripped.send_if_modified(|set| {
            let before = set.len();
            set.retain(|(id, _)| *id != handle.id);
            set.len() != before
        });
        debug!(handle = handle.id, "Suspenders removed");
    }

    /// Whether any installed guard is tripped
    pub fn is_suspended(&self) -> bool {
        !self.tripped.borrow().is_empty()
    }

    /// Names of the tripped guards
    pub fn tripped_guards(&self) -> Vec<String> {
        self.tripped
            .borrow()
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Resolve once no guard is tripped
    pub async fn wait_until_clear(&self) {
        let mut rx = self.tripped.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|set| set.is_empty()).await;
    }

    /// Number of installed handles
    pub async fn installed_count(&self) -> usize {
        self.installed.lock().await.len()
    }
}

impl Default for BeamMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::sim::SimSignal;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn settle_until(monitor: &BeamMonitor, suspended: bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while monitor.is_suspended() != suspended {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    fn current_monitor() -> (BeamMonitor, Arc<SimSignal>) {
        let current = Arc::new(SimSignal::new("ring_current", 100.0));
        let monitor = BeamMonitor::new().with_guard(
            SuspendFloor::new("ring_current", 2.0).with_resume(10.0),
            current.clone(),
        );
        (monitor, current)
    }

    #[test]
    fn test_floor_evaluation() {
        let guard = SuspendFloor::new("pss", 1.0);
        assert!(guard.evaluate(false, 0.0));
        assert!(!guard.evaluate(false, 1.0));
        assert!(!guard.evaluate(true, 1.0));
    }

    #[tokio::test]
    async fn test_hysteresis() {
        let (monitor, current) = current_monitor();
        let _handle = monitor.install().await;
        assert!(!monitor.is_suspended());

        current.set(1.0);
        settle_until(&monitor, true).await;

        current.set(5.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.is_suspended());

        current.set(12.0);
        settle_until(&monitor, false).await;
        monitor.wait_until_clear().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_low_signal_trips_at_install() {
        let (monitor, current) = current_monitor();
        current.set(0.5);
        let _handle = monitor.install().await;
        assert!(monitor.is_suspended());
        assert_eq!(monitor.tripped_guards(), vec!["ring_current".to_string()]);
        assert!(logs_contain("Beam unavailable at install"));
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let (monitor, current) = current_monitor();
        current.set(0.5);
        let handle = monitor.install().await;
        assert!(monitor.is_suspended());

        monitor.remove(&handle).await;
        assert!(!monitor.is_suspended());
        monitor.remove(&handle).await;
        assert_eq!(monitor.installed_count().await, 0);

        // A removed guard no longer reacts
        current.set(0.1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_suspended());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_remove_unknown_handle_is_noop() {
        let (monitor, _current) = current_monitor();
        let _installed = monitor.install().await;
        monitor.remove(&SuspenderHandle { id: 999 }).await;
        assert_eq!(monitor.installed_count().await, 1);
        assert!(logs_contain("Suspender not installed"));
    }
}
