use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::scheduler::job::{field, parse_field, parse_time, validate_identifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "ONLINE",
            NodeStatus::Offline => "OFFLINE",
            NodeStatus::Busy => "BUSY",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(NodeStatus::Online),
            "OFFLINE" => Ok(NodeStatus::Offline),
            "BUSY" => Ok(NodeStatus::Busy),
            other => Err(GridError::Validation(format!("unknown node status {other:?}"))),
        }
    }
}

/// What a node can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Supported model names. Empty means any model.
    pub models: BTreeSet<String>,
    pub max_concurrency: u32,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            models: BTreeSet::new(),
            max_concurrency: 1,
        }
    }
}

impl NodeCapabilities {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.insert(model.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn supports(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.contains(model)
    }
}

/// Health metrics reported with every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Percent, 0..100
    pub cpu_usage: f64,
    /// Percent of memory still free, 0..100
    pub memory_available: f64,
    /// Fraction of jobs that succeeded, 0..1
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub uptime_hours: f64,
    /// Reported utilization, 0..1
    pub load: f64,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_available: 100.0,
            success_rate: 1.0,
            avg_response_ms: 0.0,
            uptime_hours: 0.0,
            load: 0.0,
        }
    }
}

impl NodeStats {
    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("cpu_usage", self.cpu_usage.to_string()),
            field("memory_available", self.memory_available.to_string()),
            field("success_rate", self.success_rate.to_string()),
            field("avg_response_ms", self.avg_response_ms.to_string()),
            field("uptime_hours", self.uptime_hours.to_string()),
            field("load", self.load.to_string()),
        ]
    }
}

/// Registration request sent by a node on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub region: String,
    pub capabilities: NodeCapabilities,
    pub capacity: f64,
    pub stats: NodeStats,
}

impl NodeRegistration {
    pub fn new(node_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            region: region.into(),
            capabilities: NodeCapabilities::default(),
            capacity: 1.0,
            stats: NodeStats::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: NodeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_stats(mut self, stats: NodeStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("node_id", &self.node_id)?;
        validate_identifier("region", &self.region)?;
        if self.capabilities.max_concurrency == 0 {
            return Err(GridError::Validation(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if !self.capacity.is_finite() || self.capacity < 0.0 {
            return Err(GridError::Validation(format!(
                "capacity must be a non-negative number, got {}",
                self.capacity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub region: String,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    /// In-flight job count
    pub current_load: u32,
    pub capacity: f64,
    /// Score from the last ranking pass
    pub score: f64,
    pub stats: NodeStats,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub total_rewards: f64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn has_spare_concurrency(&self) -> bool {
        self.current_load < self.capabilities.max_concurrency
    }

    /// Status implied by the current load, unless the node has signed off.
    pub fn derived_status(&self) -> NodeStatus {
        match self.status {
            NodeStatus::Offline => NodeStatus::Offline,
            _ if self.has_spare_concurrency() => NodeStatus::Online,
            _ => NodeStatus::Busy,
        }
    }

    /// Fields written when a node record is first created.
    pub(crate) fn initial_fields(registration: &NodeRegistration) -> Result<Vec<(String, String)>> {
        let now = Utc::now().to_rfc3339();
        let mut fields = Self::descriptive_fields(registration)?;
        fields.extend([
            field("current_load", "0"),
            field("score", "0"),
            field("completed_jobs", "0"),
            field("failed_jobs", "0"),
            field("total_rewards", "0"),
            field("registered_at", now.clone()),
            field("last_heartbeat", now),
        ]);
        Ok(fields)
    }

    /// Fields a re-registration overwrites. Counters are left alone.
    pub(crate) fn descriptive_fields(
        registration: &NodeRegistration,
    ) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            field("node_id", &registration.node_id),
            field("region", &registration.region),
            field(
                "models",
                serde_json::to_string(&registration.capabilities.models)?,
            ),
            field(
                "max_concurrency",
                registration.capabilities.max_concurrency.to_string(),
            ),
            field("status", NodeStatus::Online.as_str()),
            field("capacity", registration.capacity.to_string()),
        ];
        fields.extend(registration.stats.to_fields());
        Ok(fields)
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| -> Result<&str> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| GridError::Validation(format!("node record missing {name}")))
        };
        let number = |name: &str| -> Result<f64> { parse_field(name, get(name)?) };

        Ok(Self {
            node_id: get("node_id")?.to_string(),
            region: get("region")?.to_string(),
            capabilities: NodeCapabilities {
                models: serde_json::from_str(get("models")?)?,
                max_concurrency: parse_field("max_concurrency", get("max_concurrency")?)?,
            },
            status: get("status")?.parse()?,
            // Decrements race with each other, so a transiently negative value reads as idle.
            current_load: parse_field::<i64>("current_load", get("current_load")?)?
                .clamp(0, u32::MAX as i64) as u32,
            capacity: number("capacity")?,
            score: number("score")?,
            stats: NodeStats {
                cpu_usage: number("cpu_usage")?,
                memory_available: number("memory_available")?,
                success_rate: number("success_rate")?,
                avg_response_ms: number("avg_response_ms")?,
                uptime_hours: number("uptime_hours")?,
                load: number("load")?,
            },
            completed_jobs: parse_field("completed_jobs", get("completed_jobs")?)?,
            failed_jobs: parse_field("failed_jobs", get("failed_jobs")?)?,
            total_rewards: number("total_rewards")?,
            registered_at: parse_time("registered_at", get("registered_at")?)?,
            last_heartbeat: parse_time("last_heartbeat", get("last_heartbeat")?)?,
        })
    }
}
