// ABOUTME: Failover orchestration - state machine, run record, run log and per-pair lock
// ABOUTME: The orchestrator is the only caller of the leaf components during a failover

pub mod lock;
pub mod log;
pub mod orchestrator;
mod rollback;
pub mod run;
pub mod state;

pub use lock::FailoverLock;
pub use log::{RunEvent, RunLog, RunSummary};
pub use orchestrator::{FailoverOrchestrator, FailoverPlan};
pub use run::{
    AbortReport, FailoverRun, RunOptions, RunOutcome, Step, StepResult, StepStatus,
};
pub use state::{Edge, FailoverState};
