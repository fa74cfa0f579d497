// =============================================================================
// Central Application State — QuoteMesh pipeline
// =============================================================================
//
// Ties the subsystems together for the API layer. Each subsystem manages its
// own interior mutability behind an Arc; AppState holds the references, the
// run state, and the uptime clock.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::api::ws::PushServer;
use crate::archive::ArchiveWriter;
use crate::deviation::DeviationCalculator;
use crate::health::HealthMonitor;
use crate::orchestrator::Orchestrator;
use crate::rolling_window::RollingWindowStore;
use crate::runtime_config::RuntimeConfig;
use crate::signals::SignalDetector;

/// Process lifecycle as reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopping,
}

pub struct AppState {
    pub config: RuntimeConfig,

    pub health: Arc<HealthMonitor>,
    pub store: Arc<RollingWindowStore>,
    pub deviation: Arc<DeviationCalculator>,
    pub detector: Arc<SignalDetector>,
    pub archive: Arc<ArchiveWriter>,
    pub orchestrator: Arc<Orchestrator>,
    pub push: Arc<PushServer>,

    run_state: RwLock<RunState>,
    start_time: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        health: Arc<HealthMonitor>,
        store: Arc<RollingWindowStore>,
        deviation: Arc<DeviationCalculator>,
        detector: Arc<SignalDetector>,
        archive: Arc<ArchiveWriter>,
        orchestrator: Arc<Orchestrator>,
        push: Arc<PushServer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            health,
            store,
            deviation,
            detector,
            archive,
            orchestrator,
            push,
            run_state: RwLock::new(RunState::Running),
            start_time: Instant::now(),
        })
    }

    /// Health-endpoint status string; flips to `stopping` for the duration
    /// of the shutdown sequence.
    pub fn status_str(&self) -> &'static str {
        match *self.run_state.read() {
            RunState::Running => "ok",
            RunState::Stopping => "stopping",
        }
    }

    pub fn set_stopping(&self) {
        *self.run_state.write() = RunState::Stopping;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Resident set size of this process in MiB, best effort.
    pub fn working_set_mb() -> u64 {
        use sysinfo::{get_current_pid, ProcessesToUpdate, System};
        let Ok(pid) = get_current_pid() else {
            return 0;
        };
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        sys.process(pid).map(|p| p.memory() / 1_048_576).unwrap_or(0)
    }
}
