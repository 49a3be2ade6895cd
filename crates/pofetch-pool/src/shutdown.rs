//! Phased, timeout-bounded shutdown machinery.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// The five ordered shutdown phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Stop accepting new tasks.
    StopIntake,
    /// Wait for in-flight tasks, force-failing stragglers.
    AwaitTasks,
    /// Stop every worker.
    StopWorkers,
    /// Clean up spare profiles.
    CleanProfiles,
    /// Stop monitor and maintenance loops.
    StopMonitors,
}

impl ShutdownPhase {
    /// All phases in execution order.
    pub const ALL: [ShutdownPhase; 5] = [
        ShutdownPhase::StopIntake,
        ShutdownPhase::AwaitTasks,
        ShutdownPhase::StopWorkers,
        ShutdownPhase::CleanProfiles,
        ShutdownPhase::StopMonitors,
    ];

    /// Phase name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            ShutdownPhase::StopIntake => "stop_intake",
            ShutdownPhase::AwaitTasks => "await_tasks",
            ShutdownPhase::StopWorkers => "stop_workers",
            ShutdownPhase::CleanProfiles => "clean_profiles",
            ShutdownPhase::StopMonitors => "stop_monitors",
        }
    }

    /// Whether failure of this phase aborts the remaining phases
    /// (emergency shutdown always proceeds regardless).
    pub fn required(&self) -> bool {
        matches!(
            self,
            ShutdownPhase::StopIntake | ShutdownPhase::AwaitTasks | ShutdownPhase::StopWorkers
        )
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    /// Which phase.
    pub phase: ShutdownPhase,
    /// Whether it completed within its budget without error.
    pub success: bool,
    /// Wall time spent.
    pub duration: Duration,
    /// Failure detail, if any.
    pub error: Option<String>,
}

/// Outcome of a full shutdown sequence.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Per-phase results, in execution order. Aborted phases are
    /// absent.
    pub phases: Vec<PhaseResult>,
    /// Whether every executed required phase succeeded.
    pub success: bool,
    /// Whether this was an emergency shutdown.
    pub emergency: bool,
    /// Total wall time.
    pub duration: Duration,
}

impl ShutdownReport {
    /// Result for a given phase, if it ran.
    pub fn phase(&self, phase: ShutdownPhase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Run one phase under a hard timeout. A phase that exceeds its budget
/// is recorded as failed; the future is dropped at the deadline.
pub(crate) async fn run_phase<F>(phase: ShutdownPhase, budget: Duration, fut: F) -> PhaseResult
where
    F: Future<Output = Result<(), String>>,
{
    info!("Shutdown phase '{}' (budget {:?})", phase.name(), budget);
    let started = Instant::now();

    let result = match tokio::time::timeout(budget, fut).await {
        Ok(Ok(())) => PhaseResult {
            phase,
            success: true,
            duration: started.elapsed(),
            error: None,
        },
        Ok(Err(e)) => PhaseResult {
            phase,
            success: false,
            duration: started.elapsed(),
            error: Some(e),
        },
        Err(_) => PhaseResult {
            phase,
            success: false,
            duration: started.elapsed(),
            error: Some(format!("phase timed out after {budget:?}")),
        },
    };

    if !result.success {
        warn!(
            "Shutdown phase '{}' failed: {}",
            phase.name(),
            result.error.as_deref().unwrap_or("unknown")
        );
    }
    result
}
