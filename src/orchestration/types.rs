// Core types for the routing system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Declared type of an inbound request.
///
/// The set of types is open: anything present in the capability table is
/// routable. `general` is the broadcast type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RequestType(String);

impl RequestType {
    pub const GENERAL: &'static str = "general";

    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_lowercase())
    }

    pub fn general() -> Self {
        Self(Self::GENERAL.to_string())
    }

    pub fn is_general(&self) -> bool {
        self.0 == Self::GENERAL
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for RequestType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<RequestType> for String {
    fn from(value: RequestType) -> Self {
        value.0
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request as seen by the orchestrator and forwarded to experts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl RouteRequest {
    /// Create a request with a freshly generated id
    pub fn new(request_type: impl Into<RequestType>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_type: request_type.into(),
            content: content.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Liveness of an expert as last observed by the health probe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExpertStatus {
    Online,
    Busy,
    Offline,
}

impl ExpertStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ExpertStatus::Online => "online",
            ExpertStatus::Busy => "busy",
            ExpertStatus::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ExpertStatus::Online)
    }
}

/// A registered expert service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Expert {
    pub id: String,
    pub display_name: String,
    pub capabilities: BTreeSet<String>,
    pub status: ExpertStatus,
    pub endpoint: String,
}

impl Expert {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            capabilities: BTreeSet::new(),
            status: ExpertStatus::Online,
            endpoint: endpoint.into(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: ExpertStatus) -> Self {
        self.status = status;
        self
    }

    /// Capabilities this expert shares with `keys`, in the order of `keys`
    pub fn matching_capabilities<'a>(&'a self, keys: &'a [String]) -> Vec<&'a str> {
        keys.iter()
            .filter(|key| self.capabilities.contains(key.as_str()))
            .map(String::as_str)
            .collect()
    }
}

/// Public view of an expert served by `GET /agents`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: ExpertStatus,
}

impl From<&Expert> for AgentInfo {
    fn from(expert: &Expert) -> Self {
        Self {
            id: expert.id.clone(),
            name: expert.display_name.clone(),
            capabilities: expert.capabilities.iter().cloned().collect(),
            status: expert.status,
        }
    }
}

/// Routing decision from the classifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub selected_agents: Vec<String>,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of invoking one expert. Exactly one of `response` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpertOutcome {
    pub agent_id: String,
    pub response: Option<String>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub processing_time_ms: f64,
}

impl ExpertOutcome {
    pub const TIMEOUT: &'static str = "timeout";
    pub const DEADLINE_EXCEEDED: &'static str = "deadline_exceeded";

    pub fn success(agent_id: impl Into<String>, response: String, processing_time_ms: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            response: Some(response),
            error: None,
            details: None,
            processing_time_ms: processing_time_ms.max(0.0),
        }
    }

    pub fn failed(agent_id: impl Into<String>, error: impl Into<String>, processing_time_ms: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            response: None,
            error: Some(error.into()),
            details: None,
            processing_time_ms: processing_time_ms.max(0.0),
        }
    }

    pub fn with_details(mut self, details: Option<serde_json::Value>) -> Self {
        if self.response.is_some() {
            self.details = details;
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.response.is_some()
    }
}

/// The single response returned for a routed request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateResponse {
    pub request_id: String,
    pub routing: RoutingDecision,
    pub responses: BTreeMap<String, ExpertOutcome>,
}

impl AggregateResponse {
    pub fn failed_count(&self) -> usize {
        self.responses.values().filter(|o| !o.is_success()).count()
    }
}

/// Live update pushed to `/ws` subscribers as `{type, data, timestamp}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl RouterEvent {
    pub const ROUTING_DECISION: &'static str = "routing_decision";
    pub const REQUEST_COMPLETED: &'static str = "request_completed";

    pub fn routing_decision(request_id: &str, decision: &RoutingDecision) -> Self {
        Self::new(
            Self::ROUTING_DECISION,
            serde_json::json!({
                "request_id": request_id,
                "selected_agents": decision.selected_agents,
                "reasoning": decision.reasoning,
                "timestamp": decision.timestamp,
            }),
        )
    }

    pub fn request_completed(response: &AggregateResponse) -> Self {
        Self::new(
            Self::REQUEST_COMPLETED,
            serde_json::json!({
                "request_id": response.request_id,
                "responses": response.responses,
            }),
        )
    }

    fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}
