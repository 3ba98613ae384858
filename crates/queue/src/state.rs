//! The job lifecycle as a pure transition function, testable without
//! timers or network.

use store::JobState;

pub const TIMEOUT_ERROR: &str = "Timeout";
pub const MISSING_ARTIFACT_ERROR: &str = "No video data in response";
pub const CANCELLED_ERROR: &str = "Cancelled by user";
pub const DEFAULT_FAILURE: &str = "Job failed";

/// Everything that can move a job between states.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// A poll tick saw the job still running; `elapsed_ms` since start.
    Progress { elapsed_ms: i64 },
    /// The server reported the job done.
    Completed,
    /// The server reported done but no artifact could be located. Valid
    /// from `Completed`: the one post-hoc correction of a terminal state.
    ArtifactMissing,
    /// The server reported failure, with its reason if it gave one.
    Failed { error: Option<String> },
    /// The poll attempt cap was exhausted.
    TimedOut,
    /// The user cancelled and the server acknowledged.
    Cancelled,
}

/// Apply an event to a state. Terminal states absorb every event except
/// `ArtifactMissing` on a fresh completion; a cancelled or finished job
/// can never be resurrected by a late tick.
pub fn transition(state: &JobState, event: StateEvent) -> JobState {
    match (state, event) {
        (JobState::Processing { .. }, StateEvent::Completed) => JobState::Completed,
        (JobState::Completed, StateEvent::ArtifactMissing) => JobState::Failed {
            error: MISSING_ARTIFACT_ERROR.to_string(),
        },
        (JobState::Processing { .. }, StateEvent::Failed { error }) => JobState::Failed {
            error: error.unwrap_or_else(|| DEFAULT_FAILURE.to_string()),
        },
        (JobState::Processing { progress }, StateEvent::Progress { elapsed_ms }) => {
            JobState::Processing {
                progress: synthetic_progress(*progress, elapsed_ms),
            }
        }
        (JobState::Processing { .. }, StateEvent::TimedOut) => JobState::Failed {
            error: TIMEOUT_ERROR.to_string(),
        },
        (JobState::Processing { .. }, StateEvent::Cancelled) => JobState::Failed {
            error: CANCELLED_ERROR.to_string(),
        },
        (state, _) => state.clone(),
    }
}

/// Synthetic time-based progress estimate, capped below 100 so true
/// completion stays visually distinguishable, and clamped non-decreasing.
fn synthetic_progress(current: f32, elapsed_ms: i64) -> f32 {
    let estimate = (elapsed_ms as f32 / 2000.0).min(90.0);
    estimate.max(current)
}
