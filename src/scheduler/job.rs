use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{GridError, Result};

/// Highest accepted job priority.
pub const MAX_PRIORITY: i32 = 1000;

/// Lowest accepted job priority.
pub const MIN_PRIORITY: i32 = -1000;

/// Priority used when a submission does not specify one.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Stored spellings older producers used for [`JobStatus::Pending`].
pub(crate) const PENDING_ALIASES: &[&str] = &["queued", "QUEUED"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Assigned => "ASSIGNED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States reachable from `self` in one step.
    ///
    /// `Assigned -> Pending` is the reclaim path for a lapsed claim.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[Assigned, Cancelled],
            Assigned => &[Running, Pending, Completed, Failed, Cancelled],
            Running => &[Completed, Failed],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition(&self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" => Ok(JobStatus::Pending),
            "ASSIGNED" => Ok(JobStatus::Assigned),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(GridError::Validation(format!("unknown job status {other:?}"))),
        }
    }
}

/// A client request as handed over by the ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_id: Option<String>,
    pub client_id: String,
    pub model_name: String,
    pub input_payload: Value,
    pub priority: i32,
    pub region: String,
}

impl JobSubmission {
    pub fn new(client_id: impl Into<String>, model_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            job_id: None,
            client_id: client_id.into(),
            model_name: model_name.into(),
            input_payload: Value::Object(Default::default()),
            priority: DEFAULT_PRIORITY,
            region: region.into(),
        }
    }

    pub fn with_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_payload = input;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.job_id {
            validate_identifier("job_id", id)?;
        }
        validate_identifier("client_id", &self.client_id)?;
        validate_identifier("region", &self.region)?;
        if self.model_name.trim().is_empty() {
            return Err(GridError::Validation("model_name must not be empty".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(GridError::Validation(format!(
                "priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// Reject ids that would break the key layout or be unreadable in logs.
pub fn validate_identifier(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(GridError::Validation(format!("{what} must not be empty")));
    }
    if value.len() > 128 {
        return Err(GridError::Validation(format!(
            "{what} must not exceed 128 characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(GridError::Validation(format!(
            "{what} may only contain alphanumeric, hyphen, underscore, or dot characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub client_id: String,
    pub model_name: String,
    pub input_payload: Value,
    pub priority: i32,
    pub region: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_node: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Number of times the job has been handed to a node
    pub attempts: u32,
}

impl Job {
    pub fn from_submission(submission: JobSubmission) -> Self {
        let job_id = submission
            .job_id
            .unwrap_or_else(|| format!("job_{}", Uuid::new_v4().simple()));
        Self {
            job_id,
            client_id: submission.client_id,
            model_name: submission.model_name,
            input_payload: submission.input_payload,
            priority: submission.priority,
            region: submission.region,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            assigned_node: None,
            assigned_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    /// Flatten into hash fields. Absent optionals are written as empty strings.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![
            field("job_id", &self.job_id),
            field("client_id", &self.client_id),
            field("model_name", &self.model_name),
            field("input_payload", serde_json::to_string(&self.input_payload)?),
            field("priority", self.priority.to_string()),
            field("region", &self.region),
            field("status", self.status.as_str()),
            field("created_at", self.created_at.to_rfc3339()),
            field("assigned_node", self.assigned_node.clone().unwrap_or_default()),
            field("assigned_at", opt_time(self.assigned_at)),
            field("completed_at", opt_time(self.completed_at)),
            field(
                "result",
                match &self.result {
                    Some(v) => serde_json::to_string(v)?,
                    None => String::new(),
                },
            ),
            field("error", self.error.clone().unwrap_or_default()),
            field("attempts", self.attempts.to_string()),
        ])
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| -> Result<&str> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| GridError::Validation(format!("job record missing {name}")))
        };
        let optional = |name: &str| fields.get(name).filter(|v| !v.is_empty());

        Ok(Self {
            job_id: get("job_id")?.to_string(),
            client_id: get("client_id")?.to_string(),
            model_name: get("model_name")?.to_string(),
            input_payload: serde_json::from_str(get("input_payload")?)?,
            priority: parse_field("priority", get("priority")?)?,
            region: get("region")?.to_string(),
            status: get("status")?.parse()?,
            created_at: parse_time("created_at", get("created_at")?)?,
            assigned_node: optional("assigned_node").cloned(),
            assigned_at: optional("assigned_at")
                .map(|v| parse_time("assigned_at", v))
                .transpose()?,
            completed_at: optional("completed_at")
                .map(|v| parse_time("completed_at", v))
                .transpose()?,
            result: optional("result")
                .map(|v| serde_json::from_str(v))
                .transpose()?,
            error: optional("error").cloned(),
            attempts: optional("attempts")
                .map(|v| parse_field("attempts", v))
                .transpose()?
                .unwrap_or(0),
        })
    }
}

pub(crate) fn field(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}

pub(crate) fn opt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

pub(crate) fn parse_time(name: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GridError::Validation(format!("invalid {name} {raw:?}: {e}")))
}

/// `true` once more than `age` has passed between `since` and `now`.
pub(crate) fn is_older_than(since: DateTime<Utc>, now: DateTime<Utc>, age: std::time::Duration) -> bool {
    match chrono::Duration::from_std(age) {
        Ok(age) => now.signed_duration_since(since) > age,
        Err(_) => false,
    }
}

pub(crate) fn parse_field<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| GridError::Validation(format!("invalid {name} {raw:?}")))
}
