//! Event types for lifecycle notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobId, JobState};

/// A lifecycle notification published on the event bus.
///
/// Topics are `"<queue kind>.<event>"`, e.g. `download.running` or
/// `session.invocation_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobState>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            job_id: None,
            status: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Event for a job entering `state`, topic `<kind>.<state>`.
    pub fn job_state(kind: &str, job_id: JobId, state: JobState) -> Self {
        Self::new(format!("{kind}.{state}"))
            .with_job(job_id)
            .with_status(state)
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_status(mut self, status: JobState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Queue kind prefix of the topic.
    pub fn kind(&self) -> &str {
        self.topic
            .split_once('.')
            .map_or(self.topic.as_str(), |(kind, _)| kind)
    }

    /// Get a human-readable description of the event.
    pub fn description(&self) -> String {
        match (self.job_id, self.status) {
            (Some(id), Some(status)) => format!("{}: job {id} is {status}", self.topic),
            (Some(id), None) => format!("{}: job {id}", self.topic),
            _ => self.topic.clone(),
        }
    }
}

/// Subscription filter over event topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// `*`
    All,
    /// `download.*` matches every topic starting with `download.`
    Prefix(String),
    Exact(String),
}

impl TopicFilter {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            TopicFilter::All
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TopicFilter::Prefix(prefix.to_string())
        } else {
            TopicFilter::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicFilter::Exact(exact) => topic == exact,
        }
    }
}

impl From<&str> for TopicFilter {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}
