use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The image operations a job can perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    StyleTransfer,
    Grayscale,
    Upscale,
    TextToImage,
    FaceSwap,
    CreativeUpscale,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::StyleTransfer,
        JobKind::Grayscale,
        JobKind::Upscale,
        JobKind::TextToImage,
        JobKind::FaceSwap,
        JobKind::CreativeUpscale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::StyleTransfer => "style_transfer",
            JobKind::Grayscale => "grayscale",
            JobKind::Upscale => "upscale",
            JobKind::TextToImage => "text_to_image",
            JobKind::FaceSwap => "face_swap",
            JobKind::CreativeUpscale => "creative_upscale",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unsupported processing kind: {}", s))
    }
}

/// Lifecycle state of a job.
///
/// `Completed` and `Failed` are terminal: once reached, the job record never
/// changes again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Point-in-time view of a job, as returned by `GET /api/jobs/{job_id}`.
///
/// Timestamps are RFC 3339 strings so this crate stays free of a date library.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Returned by the submission endpoint as soon as the job is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
}

/// One row of the `GET /api/processors` listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingKindInfo {
    pub kind: JobKind,
    pub description: String,
    pub cost: i64,
    pub min_attachments: usize,
    pub max_attachments: usize,
    pub requires_prompt: bool,
    /// Whether a degraded local transform is used when the remote engine is down.
    pub fallback: bool,
}
