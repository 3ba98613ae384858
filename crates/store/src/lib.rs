//! Persisted record types and the local key/value store.
//!
//! The queue snapshot, API credentials, and theme preference each live
//! under their own key (a JSON file beneath the app data directory).
//! Artifact payloads are never written to disk; only job metadata is.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

mod job;

pub use job::{Job, JobState, LoraPair, Submission};

const QUEUE_KEY: &str = "wan22_queue";
const API_CONFIG_KEY: &str = "wan22_api_config";
const THEME_KEY: &str = "wan22_theme";

/// Serialized-queue budget; beyond this the snapshot is trimmed.
const MAX_QUEUE_BYTES: usize = 4 * 1024 * 1024;
/// Finished jobs kept when trimming an oversized snapshot.
const TRIM_KEEP_FINISHED: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Remote endpoint configuration: base URL plus the raw credential
/// string sent in the `Authorization` header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl ApiConfig {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("wanstudio")
}

pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open() -> Self {
        Self::with_root(app_data_dir())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Persist the queue snapshot. Artifact payloads never serialize (see
    /// `Job::video_data`). Oversized snapshots fall back to a trimmed set:
    /// every processing job plus the most recent finished ones.
    pub fn save_queue(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let json = serde_json::to_string(jobs)?;
        let payload = if json.len() > MAX_QUEUE_BYTES {
            warn!(
                "queue snapshot is {} bytes, trimming old finished jobs",
                json.len()
            );
            serde_json::to_string(&trim_for_save(jobs))?
        } else {
            json
        };
        self.write_key(QUEUE_KEY, &payload)
    }

    /// Load the queue snapshot. A missing key yields an empty queue; a
    /// corrupt one is cleared and also yields an empty queue. Startup
    /// never fails on bad stored state.
    pub fn load_queue(&self) -> Vec<Job> {
        let path = self.key_path(QUEUE_KEY);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<Vec<Job>>(&raw) {
            Ok(jobs) => {
                info!("loaded {} jobs from queue snapshot", jobs.len());
                jobs
            }
            Err(e) => {
                warn!("queue snapshot unreadable ({e}), clearing it");
                let _ = fs::remove_file(&path);
                Vec::new()
            }
        }
    }

    pub fn save_api_config(&self, config: &ApiConfig) -> Result<(), StoreError> {
        self.write_key(API_CONFIG_KEY, &serde_json::to_string(config)?)
    }

    pub fn load_api_config(&self) -> ApiConfig {
        self.read_key(API_CONFIG_KEY).unwrap_or_default()
    }

    pub fn save_theme(&self, theme: &str) -> Result<(), StoreError> {
        self.write_key(THEME_KEY, &serde_json::to_string(theme)?)
    }

    pub fn load_theme(&self) -> Option<String> {
        self.read_key(THEME_KEY)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn write_key(&self, key: &str, payload: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.key_path(key), payload)?;
        Ok(())
    }

    fn read_key<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = fs::read_to_string(self.key_path(key)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("stored key {key} unreadable ({e})");
                None
            }
        }
    }
}

fn trim_for_save(jobs: &[Job]) -> Vec<&Job> {
    let mut kept: Vec<&Job> = jobs.iter().filter(|j| j.state.is_processing()).collect();
    let finished: Vec<&Job> = jobs.iter().filter(|j| !j.state.is_processing()).collect();
    let skip = finished.len().saturating_sub(TRIM_KEEP_FINISHED);
    kept.extend(finished.into_iter().skip(skip));
    kept
}
