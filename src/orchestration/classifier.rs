// Classifier - decides which experts handle a request

use super::experts::RegistrySnapshot;
use super::types::{Expert, RequestType, RouteRequest, RoutingDecision};
use chrono::Utc;
use std::collections::BTreeMap;

/// Maps a request type to the capability keys that qualify an expert for it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityTable {
    entries: BTreeMap<RequestType, Vec<String>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry<I, S>(mut self, request_type: impl Into<RequestType>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(request_type, capabilities);
        self
    }

    pub fn insert<I, S>(&mut self, request_type: impl Into<RequestType>, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .insert(request_type.into(), capabilities.into_iter().map(Into::into).collect());
    }

    pub fn capabilities_for(&self, request_type: &RequestType) -> Option<&[String]> {
        self.entries.get(request_type).map(Vec::as_slice)
    }

    pub fn types(&self) -> impl Iterator<Item = &RequestType> {
        self.entries.keys()
    }
}

/// Pure routing policy over a registry snapshot.
///
/// `general` broadcasts to every online expert. Any other type selects the
/// online experts whose capabilities intersect the type's table entry, falling
/// back to matching experts that are busy or offline when none is online.
#[derive(Debug, Clone)]
pub struct Classifier {
    table: CapabilityTable,
}

impl Classifier {
    pub fn new(table: CapabilityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CapabilityTable {
        &self.table
    }

    pub fn classify(
        &self,
        request: &RouteRequest,
        snapshot: &RegistrySnapshot,
    ) -> Result<RoutingDecision, ClassificationError> {
        if request.request_type.is_general() {
            return self.broadcast(request, snapshot);
        }

        let keys = self
            .table
            .capabilities_for(&request.request_type)
            .ok_or_else(|| ClassificationError::UnknownType(request.request_type.clone()))?;

        let candidates: Vec<(&Expert, Vec<&str>)> = snapshot
            .experts()
            .iter()
            .filter_map(|expert| {
                let matched = expert.matching_capabilities(keys);
                (!matched.is_empty()).then_some((expert, matched))
            })
            .collect();

        let online: Vec<&(&Expert, Vec<&str>)> =
            candidates.iter().filter(|(e, _)| e.status.is_online()).collect();

        let (selected, mode) = if !online.is_empty() {
            (online, "online")
        } else if !candidates.is_empty() {
            (candidates.iter().collect(), "best-effort, no matching expert online")
        } else {
            return Err(ClassificationError::NoEligibleExpert(request.request_type.clone()));
        };

        let selected_agents: Vec<String> = selected.iter().map(|(e, _)| e.id.clone()).collect();
        let matches: Vec<String> = selected
            .iter()
            .map(|(e, caps)| format!("{} via {}", e.id, caps.join("+")))
            .collect();

        Ok(RoutingDecision {
            reasoning: format!(
                "type '{}' requires capability [{}]; selected {} ({})",
                request.request_type,
                keys.join(", "),
                matches.join(", "),
                mode
            ),
            selected_agents,
            timestamp: Utc::now(),
        })
    }

    fn broadcast(
        &self,
        request: &RouteRequest,
        snapshot: &RegistrySnapshot,
    ) -> Result<RoutingDecision, ClassificationError> {
        let selected_agents: Vec<String> = snapshot.online().map(|e| e.id.clone()).collect();
        if selected_agents.is_empty() {
            return Err(ClassificationError::NoEligibleExpert(request.request_type.clone()));
        }

        Ok(RoutingDecision {
            reasoning: format!(
                "type '{}' broadcasts to all online experts: {}",
                RequestType::GENERAL,
                selected_agents.join(", ")
            ),
            selected_agents,
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ClassificationError {
    #[error("No eligible expert for request type '{0}'")]
    NoEligibleExpert(RequestType),

    #[error("Unknown request type '{0}'")]
    UnknownType(RequestType),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::types::ExpertStatus;

    fn table() -> CapabilityTable {
        CapabilityTable::new()
            .with_entry("credit", ["credit_scoring", "risk_assessment"])
            .with_entry("fraud", ["transaction_analysis"])
            .with_entry("esg", ["environmental_impact"])
    }

    fn snapshot(experts: Vec<Expert>) -> RegistrySnapshot {
        RegistrySnapshot::new(experts)
    }

    fn credit(status: ExpertStatus) -> Expert {
        Expert::new("credit-agent", "Credit", "http://credit")
            .with_capabilities(["credit_scoring", "loan_eligibility"])
            .with_status(status)
    }

    fn fraud(status: ExpertStatus) -> Expert {
        Expert::new("fraud-agent", "Fraud", "http://fraud")
            .with_capabilities(["transaction_analysis"])
            .with_status(status)
    }

    #[test]
    fn test_general_selects_all_online() {
        let snap = snapshot(vec![
            credit(ExpertStatus::Online),
            fraud(ExpertStatus::Offline),
            Expert::new("risk-agent", "Risk", "http://risk").with_capabilities(["risk_assessment"]),
        ]);
        let decision = Classifier::new(table())
            .classify(&RouteRequest::new("general", "hello"), &snap)
            .unwrap();
        assert_eq!(decision.selected_agents, vec!["credit-agent", "risk-agent"]);
        assert!(decision.reasoning.contains("general"));
    }

    #[test]
    fn test_general_with_nothing_online_fails() {
        let snap = snapshot(vec![credit(ExpertStatus::Offline)]);
        let err = Classifier::new(table())
            .classify(&RouteRequest::new("general", "hello"), &snap)
            .unwrap_err();
        assert_eq!(err, ClassificationError::NoEligibleExpert(RequestType::general()));
    }

    #[test]
    fn test_credit_scenario_selects_online_match() {
        let snap = snapshot(vec![credit(ExpertStatus::Online), fraud(ExpertStatus::Offline)]);
        let decision = Classifier::new(table())
            .classify(&RouteRequest::new("credit", "evaluate applicant X"), &snap)
            .unwrap();
        assert_eq!(decision.selected_agents, vec!["credit-agent"]);
        assert!(decision.reasoning.contains("credit_scoring"));
        assert!(decision.reasoning.contains("online"));
    }

    #[test]
    fn test_multiple_experts_per_type() {
        let second = Expert::new("scoring-agent", "Scoring", "http://scoring").with_capabilities(["risk_assessment"]);
        let snap = snapshot(vec![credit(ExpertStatus::Online), second]);
        let decision = Classifier::new(table())
            .classify(&RouteRequest::new("credit", "x"), &snap)
            .unwrap();
        assert_eq!(decision.selected_agents, vec!["credit-agent", "scoring-agent"]);
        assert!(decision.reasoning.contains("scoring-agent via risk_assessment"));
    }

    #[test]
    fn test_offline_match_selected_best_effort() {
        let snap = snapshot(vec![credit(ExpertStatus::Online), fraud(ExpertStatus::Offline)]);
        let decision = Classifier::new(table())
            .classify(&RouteRequest::new("fraud", "suspicious transfer"), &snap)
            .unwrap();
        assert_eq!(decision.selected_agents, vec!["fraud-agent"]);
        assert!(decision.reasoning.contains("best-effort"));
    }

    #[test]
    fn test_online_matches_preferred_over_busy() {
        let busy = Expert::new("fraud-2", "Fraud 2", "http://fraud2")
            .with_capabilities(["transaction_analysis"])
            .with_status(ExpertStatus::Busy);
        let snap = snapshot(vec![busy, fraud(ExpertStatus::Online)]);
        let decision = Classifier::new(table())
            .classify(&RouteRequest::new("fraud", "tx"), &snap)
            .unwrap();
        assert_eq!(decision.selected_agents, vec!["fraud-agent"]);
    }

    #[test]
    fn test_esg_without_match_fails() {
        let snap = snapshot(vec![credit(ExpertStatus::Offline), fraud(ExpertStatus::Offline)]);
        let err = Classifier::new(table())
            .classify(&RouteRequest::new("esg", "carbon report"), &snap)
            .unwrap_err();
        assert_eq!(err, ClassificationError::NoEligibleExpert(RequestType::new("esg")));
    }

    #[test]
    fn test_unknown_type() {
        let snap = snapshot(vec![credit(ExpertStatus::Online)]);
        let err = Classifier::new(table())
            .classify(&RouteRequest::new("weather", "rain?"), &snap)
            .unwrap_err();
        assert!(matches!(err, ClassificationError::UnknownType(_)));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let snap = snapshot(vec![
            credit(ExpertStatus::Online),
            fraud(ExpertStatus::Online),
        ]);
        let classifier = Classifier::new(table());
        let request = RouteRequest::new("general", "anything");
        let first = classifier.classify(&request, &snap).unwrap();
        let second = classifier.classify(&request, &snap).unwrap();
        assert_eq!(first.selected_agents, second.selected_agents);
        assert_eq!(first.reasoning, second.reasoning);
    }
}
