//! The job queue engine: submit → poll → resolve → persist → resume.
//!
//! Jobs are created by [`Engine::submit`], polled on a fixed interval
//! until the remote endpoint reports a terminal state (or the attempt
//! cap forces a timeout), delivered at most once per job id, and
//! persisted through [`store::Store`] on every state change. After a
//! restart, [`Engine::resume`] picks interrupted jobs back up.
//!
//! Nothing here is fatal to the engine itself: validation and submit
//! failures surface synchronously to the caller, while every
//! polling-phase failure is absorbed into the affected job record and
//! surfaces through the event stream.

use api::ApiError;
use thiserror::Error;

mod engine;
mod state;

pub use engine::{Engine, QueueEvent, QueueStats};
pub use state::{transition, StateEvent};
pub use store::{Job, JobState, LoraPair, Submission};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid image payload: expected a data:image/ URI")]
    InvalidImage,
    #[error("invalid LoRA configuration: {0}")]
    InvalidLora(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} has no stored submission to retry")]
    NoRetryData(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}
