// Dispatcher - concurrent fan-out to the selected experts

use super::experts::ExpertClient;
use super::types::{Expert, ExpertOutcome, RouteRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Timers applied to one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// How long to wait for a single expert
    pub per_call_timeout: Duration,
    /// How long the whole dispatch may take
    pub overall_deadline: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            per_call_timeout: Duration::from_secs(10),
            overall_deadline: Duration::from_secs(30),
        }
    }
}

pub struct Dispatcher {
    client: Arc<dyn ExpertClient>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn ExpertClient>) -> Self {
        Self { client }
    }

    /// Invoke every expert concurrently and return exactly one outcome per expert.
    ///
    /// Each call runs on its own task under `per_call_timeout`. When
    /// `overall_deadline` elapses the remaining tasks are aborted and recorded
    /// as `deadline_exceeded`; this never waits for stragglers. The tasks live
    /// in a `JoinSet`, so dropping this future aborts any call still in flight.
    pub async fn dispatch(
        &self,
        request: &RouteRequest,
        experts: &[Expert],
        limits: DispatchLimits,
    ) -> BTreeMap<String, ExpertOutcome> {
        let started = Instant::now();
        let deadline = started + limits.overall_deadline;
        let request = Arc::new(request.clone());

        let mut tasks = JoinSet::new();
        let mut pending: HashMap<task::Id, String> = HashMap::with_capacity(experts.len());

        for expert in experts {
            let client = self.client.clone();
            let request = request.clone();
            let expert_clone = expert.clone();
            let per_call_timeout = limits.per_call_timeout;

            let handle = tasks.spawn(async move {
                call_expert(client.as_ref(), &expert_clone, &request, per_call_timeout).await
            });
            pending.insert(handle.id(), expert.id.clone());
        }

        let mut outcomes = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(Some(Ok((task_id, outcome)))) => {
                    pending.remove(&task_id);
                    outcomes.insert(outcome.agent_id.clone(), outcome);
                }
                Ok(Some(Err(e))) => {
                    let Some(id) = pending.remove(&e.id()) else {
                        continue;
                    };
                    warn!(expert = %id, request_id = %request.id, "Expert task failed: {}", e);
                    let outcome = ExpertOutcome::failed(&id, format!("expert task failed: {}", e), elapsed_ms(started));
                    outcomes.insert(id, outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    let elapsed = elapsed_ms(started);
                    for (_, id) in pending.drain() {
                        warn!(expert = %id, request_id = %request.id, "Overall deadline exceeded");
                        outcomes.insert(
                            id.clone(),
                            ExpertOutcome::failed(id, ExpertOutcome::DEADLINE_EXCEEDED, elapsed),
                        );
                    }
                    break;
                }
            }
        }

        debug!(
            request_id = %request.id,
            experts = outcomes.len(),
            elapsed_ms = elapsed_ms(started),
            "Dispatch complete"
        );
        outcomes
    }
}

/// One expert invocation under its own timer
async fn call_expert(
    client: &dyn ExpertClient,
    expert: &Expert,
    request: &RouteRequest,
    per_call_timeout: Duration,
) -> ExpertOutcome {
    let started = Instant::now();

    match tokio::time::timeout(per_call_timeout, client.invoke(expert, request)).await {
        Ok(Ok(reply)) => {
            ExpertOutcome::success(&expert.id, reply.response, elapsed_ms(started)).with_details(reply.details)
        }
        Ok(Err(e)) => {
            warn!(expert = %expert.id, request_id = %request.id, "Expert call failed: {}", e);
            ExpertOutcome::failed(&expert.id, e.to_string(), elapsed_ms(started))
        }
        Err(_) => {
            warn!(expert = %expert.id, request_id = %request.id, "Expert call timed out after {:?}", per_call_timeout);
            ExpertOutcome::failed(&expert.id, ExpertOutcome::TIMEOUT, elapsed_ms(started))
        }
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}
