//! Artifact delivery: turns a completed job's encoded video payload into
//! a locally saved file. Per-job idempotence is the queue engine's
//! concern (its delivered-set); the sink itself just decodes and writes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::info;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Where completed artifacts go. One call per job id; a failure is
/// reported to the caller but must not change the job's state.
pub trait ArtifactSink: Send + Sync {
    fn deliver(&self, job_id: &str, payload: &str) -> Result<PathBuf, DeliveryError>;
}

/// Saves artifacts as `wan22_<id8>_<timestamp>.mp4` in a directory.
pub struct FileDelivery {
    output_dir: PathBuf,
}

impl FileDelivery {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl ArtifactSink for FileDelivery {
    fn deliver(&self, job_id: &str, payload: &str) -> Result<PathBuf, DeliveryError> {
        let bytes = STANDARD.decode(strip_data_uri(payload))?;

        let short_id = &job_id[..job_id.len().min(8)];
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let path = self
            .output_dir
            .join(format!("wan22_{short_id}_{timestamp}.mp4"));

        fs::create_dir_all(&self.output_dir)?;
        fs::write(&path, bytes)?;
        info!("saved video for job {short_id}: {}", path.display());
        Ok(path)
    }
}

/// Payloads arrive either as a `data:video/...;base64,` URI or as the
/// bare base64 body.
fn strip_data_uri(payload: &str) -> &str {
    if payload.starts_with("data:") {
        if let Some((_, body)) = payload.split_once(',') {
            return body;
        }
    }
    payload
}
