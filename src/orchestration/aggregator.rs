// Aggregator - assembles the response returned to the caller

use super::types::{AggregateResponse, ExpertOutcome, RoutingDecision};
use std::collections::{BTreeMap, BTreeSet};

/// Combine a routing decision with its dispatch outcomes.
///
/// The outcome keys must be exactly the selected agents. A mismatch means the
/// dispatcher broke its contract and is reported rather than patched over.
pub fn aggregate(
    request_id: impl Into<String>,
    decision: RoutingDecision,
    outcomes: BTreeMap<String, ExpertOutcome>,
) -> Result<AggregateResponse, AggregationError> {
    let selected: BTreeSet<&str> = decision.selected_agents.iter().map(String::as_str).collect();
    let received: BTreeSet<&str> = outcomes.keys().map(String::as_str).collect();

    if selected != received {
        return Err(AggregationError::KeyMismatch {
            missing: selected.difference(&received).map(|s| s.to_string()).collect(),
            unexpected: received.difference(&selected).map(|s| s.to_string()).collect(),
        });
    }

    Ok(AggregateResponse {
        request_id: request_id.into(),
        routing: decision,
        responses: outcomes,
    })
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AggregationError {
    #[error("outcomes do not match routing decision (missing: {missing:?}, unexpected: {unexpected:?})")]
    KeyMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}
