use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. Serialized with a lowercase `status` tag so
/// snapshots read as `{"status":"processing","progress":12.5,...}`.
///
/// `completed` and `failed` are terminal; no further transitions occur
/// from them (the engine enforces the single exception, the post-hoc
/// missing-artifact correction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobState {
    Processing { progress: f32 },
    Completed,
    Failed { error: String },
}

impl JobState {
    pub fn is_processing(&self) -> bool {
        matches!(self, JobState::Processing { .. })
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_processing()
    }

    /// Display progress: exact while processing, 100 once completed.
    pub fn progress(&self) -> f32 {
        match self {
            JobState::Processing { progress } => *progress,
            JobState::Completed => 100.0,
            JobState::Failed { .. } => 0.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Processing { .. } => "processing",
            JobState::Completed => "completed",
            JobState::Failed { .. } => "failed",
        }
    }
}

/// One generation request and its tracked lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
    /// Parameters the job was created with, retained verbatim for retry.
    /// Absent on records restored from snapshots that lacked them.
    pub submission: Option<Submission>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    /// Transient artifact payload. Never persisted: only job metadata
    /// goes to disk.
    #[serde(skip)]
    pub video_data: Option<String>,
}

impl Job {
    /// Milliseconds from start to end, or to `now` while still running.
    pub fn duration_ms(&self, now: i64) -> i64 {
        self.ended_at.unwrap_or(now) - self.started_at
    }

    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(8);
        &self.id[..end]
    }
}

/// A high/low model pair with independent weight multipliers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraPair {
    pub high: String,
    pub low: String,
    pub high_weight: f32,
    pub low_weight: f32,
}

/// The full parameter set for one generation request. Immutable once
/// attached to a job; reused verbatim for retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Self-describing data URI (`data:image/...;base64,<payload>`).
    pub image: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_length")]
    pub length: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_cfg")]
    pub cfg: f32,
    #[serde(default)]
    pub lora_pairs: Vec<LoraPair>,
}

impl Submission {
    /// The pure base64 body that crosses the wire to the endpoint.
    pub fn image_base64(&self) -> &str {
        strip_data_uri(&self.image)
    }
}

impl Default for Submission {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            image: String::new(),
            width: 480,
            height: 832,
            length: default_length(),
            steps: default_steps(),
            seed: default_seed(),
            cfg: default_cfg(),
            lora_pairs: Vec::new(),
        }
    }
}

fn default_length() -> u32 {
    81
}

fn default_steps() -> u32 {
    10
}

fn default_seed() -> i64 {
    42
}

fn default_cfg() -> f32 {
    2.0
}

pub(crate) fn strip_data_uri(payload: &str) -> &str {
    if payload.starts_with("data:") {
        if let Some((_, body)) = payload.split_once(',') {
            return body;
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_with_status_tag() {
        let job = Job {
            id: "abc123".into(),
            state: JobState::Processing { progress: 42.0 },
            submission: None,
            created_at: 1,
            started_at: 2,
            ended_at: None,
            video_data: None,
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["progress"], 42.0);
    }

    #[test]
    fn failed_state_round_trips_error() {
        let state = JobState::Failed {
            error: "Timeout".into(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            serde_json::from_str::<JobState>(&json).unwrap(),
            state
        );
    }

    #[test]
    fn submission_defaults_fill_missing_numeric_fields() {
        let sub: Submission = serde_json::from_str(
            r#"{"prompt":"cat","image":"data:image/png;base64,QUJD","width":832,"height":480}"#,
        )
        .unwrap();
        assert_eq!(sub.length, 81);
        assert_eq!(sub.steps, 10);
        assert_eq!(sub.seed, 42);
        assert_eq!(sub.cfg, 2.0);
        assert!(sub.lora_pairs.is_empty());
    }

    #[test]
    fn image_base64_strips_data_uri_prefix() {
        let sub = Submission {
            image: "data:image/png;base64,QUJD".into(),
            ..Submission::default()
        };
        assert_eq!(sub.image_base64(), "QUJD");

        let bare = Submission {
            image: "QUJD".into(),
            ..Submission::default()
        };
        assert_eq!(bare.image_base64(), "QUJD");
    }

    #[test]
    fn short_id_handles_small_ids() {
        let mut job = Job {
            id: "abc".into(),
            state: JobState::Completed,
            submission: None,
            created_at: 0,
            started_at: 0,
            ended_at: None,
            video_data: None,
        };
        assert_eq!(job.short_id(), "abc");
        job.id = "0123456789".into();
        assert_eq!(job.short_id(), "01234567");
    }
}
