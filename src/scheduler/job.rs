use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time-ordered job identifier. Never reused: v7 UUIDs combine a
/// millisecond timestamp with random bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which execution backend handles a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobKind {
    Text,
    Image,
    Video,
    Music,
    /// Generic external side-effect task, e.g. `task:render`.
    Task(String),
}

impl JobKind {
    pub fn task(name: impl Into<String>) -> Self {
        JobKind::Task(name.into())
    }

    /// Generation kinds carry a prompt; generic tasks may not.
    pub fn requires_prompt(&self) -> bool {
        !matches!(self, JobKind::Task(_))
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Text => write!(f, "text"),
            JobKind::Image => write!(f, "image"),
            JobKind::Video => write!(f, "video"),
            JobKind::Music => write!(f, "music"),
            JobKind::Task(name) => write!(f, "task:{}", name),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(JobKind::Text),
            "image" => Ok(JobKind::Image),
            "video" => Ok(JobKind::Video),
            "music" => Ok(JobKind::Music),
            other => match other.strip_prefix("task:") {
                Some(name) if !name.is_empty() => Ok(JobKind::Task(name.to_string())),
                _ => Err(format!("unknown job kind '{}'", other)),
            },
        }
    }
}

impl TryFrom<String> for JobKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobKind> for String {
    fn from(kind: JobKind) -> Self {
        kind.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Organization and user a job belongs to. Used for listing only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerScope {
    pub org_id: String,
    pub user_id: String,
}

impl OwnerScope {
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Input handed verbatim to the execution backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            parameters: serde_json::Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub owner: OwnerScope,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(kind: JobKind, owner: OwnerScope, payload: JobPayload, max_attempts: u32) -> Self {
        Self::with_id(JobId::new(), kind, owner, payload, max_attempts, Utc::now())
    }

    pub fn with_id(
        id: JobId,
        kind: JobKind,
        owner: OwnerScope,
        payload: JobPayload,
        max_attempts: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            owner,
            payload,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts,
            last_error: None,
            result_ref: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
