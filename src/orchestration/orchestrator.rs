// Orchestrator - drives classification, dispatch and aggregation for a request

use super::aggregator::{AggregationError, aggregate};
use super::classifier::{ClassificationError, Classifier};
use super::dispatcher::{DispatchLimits, Dispatcher};
use super::experts::{
    ExpertClient, ExpertRegistry, HttpExpertClient, HttpHealthProbe, RegistryError, RetryingClient,
};
use super::types::{AggregateResponse, Expert, RouteRequest, RouterEvent};
use crate::config::RouterConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Lifecycle of one routed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Classified,
    Dispatched,
    Aggregated,
    Returned,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &str {
        match self {
            RequestState::Received => "received",
            RequestState::Classified => "classified",
            RequestState::Dispatched => "dispatched",
            RequestState::Aggregated => "aggregated",
            RequestState::Returned => "returned",
            RequestState::Failed => "failed",
        }
    }

    /// `Failed` is only reachable before classification succeeds
    pub fn can_advance_to(&self, next: RequestState) -> bool {
        matches!(
            (self, next),
            (RequestState::Received, RequestState::Classified)
                | (RequestState::Received, RequestState::Failed)
                | (RequestState::Classified, RequestState::Dispatched)
                | (RequestState::Dispatched, RequestState::Aggregated)
                | (RequestState::Aggregated, RequestState::Returned)
        )
    }
}

struct Lifecycle<'a> {
    request_id: &'a str,
    state: RequestState,
}

impl<'a> Lifecycle<'a> {
    fn new(request_id: &'a str) -> Self {
        debug!(request_id, state = RequestState::Received.as_str(), "Request state");
        Self {
            request_id,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            request_id = self.request_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Request state"
        );
        self.state = next;
    }
}

/// Events buffered per subscriber before a slow one starts lagging
const EVENT_BUFFER: usize = 64;

/// Routes requests to experts and assembles their results
pub struct Orchestrator {
    registry: Arc<ExpertRegistry>,
    classifier: Classifier,
    dispatcher: Dispatcher,
    limits: DispatchLimits,
    events: broadcast::Sender<RouterEvent>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ExpertRegistry>,
        classifier: Classifier,
        dispatcher: Dispatcher,
        limits: DispatchLimits,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            registry,
            classifier,
            dispatcher,
            limits,
            events,
        }
    }

    /// Build an orchestrator talking HTTP to the configured experts
    pub fn with_config(config: &RouterConfig) -> Result<Self, OrchestratorError> {
        let probe = HttpHealthProbe::new(config.probe_timeout())?;
        let registry = Arc::new(ExpertRegistry::new(config.experts(), Arc::new(probe)));

        let retry = config.dispatch.retry.clone();
        let client: Arc<dyn ExpertClient> = if retry.is_enabled() {
            Arc::new(RetryingClient::new(HttpExpertClient::new(), retry))
        } else {
            Arc::new(HttpExpertClient::new())
        };

        Ok(Self::new(
            registry,
            Classifier::new(config.capability_table()),
            Dispatcher::new(client),
            config.dispatch_limits(),
        ))
    }

    pub fn registry(&self) -> &Arc<ExpertRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> DispatchLimits {
        self.limits
    }

    /// Live feed of routing decisions and completed requests
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RouterEvent) {
        // Err only means nobody is listening
        let _ = self.events.send(event);
    }

    /// Process a request through the expert system.
    ///
    /// Only classification can fail the request. Once experts are selected a
    /// response is always produced, with per-expert failures recorded inline.
    pub async fn process(&self, request: RouteRequest) -> Result<AggregateResponse, OrchestratorError> {
        let mut lifecycle = Lifecycle::new(&request.id);

        // One snapshot for the whole request so the decision and the endpoints agree
        let snapshot = self.registry.snapshot();

        let decision = match self.classifier.classify(&request, &snapshot) {
            Ok(decision) => decision,
            Err(e) => {
                lifecycle.advance(RequestState::Failed);
                warn!(request_id = %request.id, "Classification failed: {}", e);
                return Err(e.into());
            }
        };
        lifecycle.advance(RequestState::Classified);

        info!(
            request_id = %request.id,
            selected = ?decision.selected_agents,
            reasoning = %decision.reasoning,
            "Routing decision"
        );
        self.publish(RouterEvent::routing_decision(&request.id, &decision));

        let experts: Vec<Expert> = decision
            .selected_agents
            .iter()
            .filter_map(|id| snapshot.get(id).cloned())
            .collect();

        let outcomes = self.dispatcher.dispatch(&request, &experts, self.limits).await;
        lifecycle.advance(RequestState::Dispatched);

        let response = aggregate(request.id.clone(), decision, outcomes)?;
        lifecycle.advance(RequestState::Aggregated);

        info!(
            request_id = %request.id,
            experts = response.responses.len(),
            failed = response.failed_count(),
            "Request completed"
        );
        self.publish(RouterEvent::request_completed(&response));
        lifecycle.advance(RequestState::Returned);

        Ok(response)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("Internal invariant violated: {0}")]
    Invariant(#[from] AggregationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}
