// Expert registry, transport and liveness probing

mod client;
mod probe;
mod retry;

pub use client::{ExpertCallError, ExpertClient, ExpertReply, HttpExpertClient};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use retry::{RetryPolicy, RetryingClient};

use super::types::{Expert, ExpertStatus};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Immutable view of the registry at one point in time.
///
/// Request handlers work against a snapshot for their whole lifetime, so a
/// refresh committing a newer one never changes a decision mid-flight.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    experts: Vec<Expert>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    pub fn new(experts: Vec<Expert>) -> Self {
        Self {
            experts,
            refreshed_at: None,
        }
    }

    /// Experts in configuration order
    pub fn experts(&self) -> &[Expert] {
        &self.experts
    }

    pub fn get(&self, id: &str) -> Option<&Expert> {
        self.experts.iter().find(|e| e.id == id)
    }

    pub fn online(&self) -> impl Iterator<Item = &Expert> {
        self.experts.iter().filter(|e| e.status.is_online())
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    /// Time of the last completed refresh, `None` before the first probe
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}

/// What a call to [`ExpertRegistry::refresh`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed { online: usize, total: usize },
    /// Another refresh was already in flight
    Coalesced,
}

/// Process-wide registry of experts.
///
/// Reads are lock-free loads of the current snapshot. Only `refresh` stores a
/// new one, and at most one refresh runs at a time.
pub struct ExpertRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    probe: Arc<dyn HealthProbe>,
    refresh_lock: Mutex<()>,
}

impl ExpertRegistry {
    pub fn new(experts: Vec<Expert>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::new(experts)),
            probe,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Most recently committed snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    pub fn list(&self) -> Vec<Expert> {
        self.snapshot.load().experts().to_vec()
    }

    pub fn get(&self, id: &str) -> Result<Expert, RegistryError> {
        self.snapshot
            .load()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Re-probe every expert and commit a snapshot with the new statuses.
    ///
    /// Entries are never removed. A probe that cannot reach a verdict keeps
    /// the expert's previous status.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!("Registry refresh already in flight, coalescing");
            return RefreshOutcome::Coalesced;
        };

        let current = self.snapshot.load_full();
        let verdicts = join_all(current.experts().iter().map(|expert| self.probe.probe(expert))).await;

        let mut experts = Vec::with_capacity(current.len());
        for (expert, verdict) in current.experts().iter().zip(verdicts) {
            let mut updated = expert.clone();
            match verdict {
                Ok(status) => {
                    if status != expert.status {
                        info!(
                            expert = %expert.id,
                            from = expert.status.as_str(),
                            to = status.as_str(),
                            "Expert status changed"
                        );
                    }
                    updated.status = status;
                }
                Err(e) => {
                    warn!(expert = %expert.id, "Health probe failed, keeping previous status: {}", e);
                }
            }
            experts.push(updated);
        }

        let online = experts.iter().filter(|e| e.status.is_online()).count();
        let total = experts.len();
        self.snapshot.store(Arc::new(RegistrySnapshot {
            experts,
            refreshed_at: Some(Utc::now()),
        }));

        debug!(online, total, "Registry refreshed");
        RefreshOutcome::Completed { online, total }
    }

    /// Refresh on a fixed interval until `shutdown` flips to `true` or its
    /// sender is dropped. The first refresh runs immediately, and a shutdown
    /// arriving mid-round abandons that round.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let every = if every.is_zero() {
            warn!("Zero refresh interval, using {:?}", MIN_REFRESH_INTERVAL);
            MIN_REFRESH_INTERVAL
        } else {
            every
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_signalled(&mut shutdown) => break,
                }
                tokio::select! {
                    _ = self.refresh() => {}
                    _ = shutdown_signalled(&mut shutdown) => break,
                }
            }
            info!("Registry refresh loop shutting down");
        })
    }
}

/// Floor applied to a zero refresh interval
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves once shutdown is requested or the sender is gone
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Expert not found: {0}")]
    NotFound(String),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe returning canned verdicts per expert id
    struct ScriptedProbe {
        verdicts: HashMap<String, Option<ExpertStatus>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(verdicts: &[(&str, Option<ExpertStatus>)]) -> Self {
            Self {
                verdicts: verdicts.iter().map(|(id, v)| (id.to_string(), *v)).collect(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, expert: &Expert) -> Result<ExpertStatus, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.verdicts.get(&expert.id).copied().flatten() {
                Some(status) => Ok(status),
                None => Err(RegistryError::Unavailable("probe crashed".to_string())),
            }
        }
    }

    fn experts() -> Vec<Expert> {
        vec![
            Expert::new("credit-agent", "Credit", "http://credit").with_capabilities(["credit_scoring"]),
            Expert::new("fraud-agent", "Fraud", "http://fraud").with_capabilities(["transaction_analysis"]),
        ]
    }

    #[test]
    fn test_get_and_list() {
        let registry = ExpertRegistry::new(experts(), Arc::new(ScriptedProbe::new(&[])));
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("fraud-agent").unwrap().display_name, "Fraud");
        assert!(matches!(registry.get("esg-agent"), Err(RegistryError::NotFound(_))));
        assert!(registry.snapshot().refreshed_at().is_none());
    }

    #[tokio::test]
    async fn test_refresh_marks_unreachable_offline_without_removing() {
        let probe = ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Online)),
            ("fraud-agent", Some(ExpertStatus::Offline)),
        ]);
        let registry = ExpertRegistry::new(experts(), Arc::new(probe));

        let outcome = registry.refresh().await;
        assert_eq!(outcome, RefreshOutcome::Completed { online: 1, total: 2 });

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("fraud-agent").unwrap().status, ExpertStatus::Offline);
        assert!(snapshot.refreshed_at().is_some());
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_previous_status() {
        let probe = ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Busy)),
            ("fraud-agent", None),
        ]);
        let registry = ExpertRegistry::new(experts(), Arc::new(probe));

        registry.refresh().await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get("credit-agent").unwrap().status, ExpertStatus::Busy);
        assert_eq!(snapshot.get("fraud-agent").unwrap().status, ExpertStatus::Online);
    }

    #[tokio::test]
    async fn test_old_snapshot_unchanged_by_refresh() {
        let probe = ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Offline)),
            ("fraud-agent", Some(ExpertStatus::Offline)),
        ]);
        let registry = ExpertRegistry::new(experts(), Arc::new(probe));

        let before = registry.snapshot();
        registry.refresh().await;
        assert_eq!(before.online().count(), 2);
        assert_eq!(registry.snapshot().online().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_coalesced() {
        let mut probe = ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Online)),
            ("fraud-agent", Some(ExpertStatus::Online)),
        ]);
        probe.delay = Duration::from_millis(100);
        let probe = Arc::new(probe);
        let registry = ExpertRegistry::new(experts(), probe.clone());

        let (first, second) = tokio::join!(registry.refresh(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.refresh().await
        });

        assert!(matches!(first, RefreshOutcome::Completed { .. }));
        assert_eq!(second, RefreshOutcome::Coalesced);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_runs_on_interval() {
        let probe = Arc::new(ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Online)),
            ("fraud-agent", Some(ExpertStatus::Online)),
        ]));
        let registry = Arc::new(ExpertRegistry::new(experts(), probe.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = registry.clone().spawn_refresh_loop(Duration::from_secs(30), rx);

        // ticks at 0s, 30s and 60s
        tokio::time::sleep(Duration::from_secs(65)).await;
        let rounds = probe.calls.load(Ordering::SeqCst) / experts().len();
        assert!(rounds >= 3, "expected at least 3 refresh rounds, got {}", rounds);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let probe = Arc::new(ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Online)),
            ("fraud-agent", Some(ExpertStatus::Online)),
        ]));
        let registry = Arc::new(ExpertRegistry::new(experts(), probe.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = registry.clone().spawn_refresh_loop(Duration::ZERO, rx);
        tokio::time::sleep(MIN_REFRESH_INTERVAL * 2 + Duration::from_millis(500)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3 * experts().len());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_do_not_wait_for_refresh() {
        let mut probe = ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Offline)),
            ("fraud-agent", Some(ExpertStatus::Offline)),
        ]);
        probe.delay = Duration::from_secs(5);
        let registry = Arc::new(ExpertRegistry::new(experts(), Arc::new(probe)));
        let (_tx, rx) = watch::channel(false);

        let handle = registry.clone().spawn_refresh_loop(Duration::from_secs(3600), rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        assert_eq!(registry.snapshot().online().count(), 2);
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.refresh().await, RefreshOutcome::Coalesced);
        assert!(started.elapsed() < Duration::from_millis(100));

        handle.abort();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_slow_refresh() {
        let mut probe = ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Offline)),
            ("fraud-agent", Some(ExpertStatus::Offline)),
        ]);
        probe.delay = Duration::from_secs(10);
        let registry = Arc::new(ExpertRegistry::new(experts(), Arc::new(probe)));
        let (tx, rx) = watch::channel(false);

        let handle = registry.clone().spawn_refresh_loop(Duration::from_secs(3600), rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop mid-round")
            .unwrap();

        // the abandoned round committed nothing
        assert!(registry.snapshot().refreshed_at().is_none());
        assert_eq!(registry.snapshot().online().count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_loop_stops_on_shutdown() {
        let probe = Arc::new(ScriptedProbe::new(&[
            ("credit-agent", Some(ExpertStatus::Offline)),
            ("fraud-agent", Some(ExpertStatus::Online)),
        ]));
        let registry = Arc::new(ExpertRegistry::new(experts(), probe.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = registry.clone().spawn_refresh_loop(Duration::from_secs(3600), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.snapshot().get("credit-agent").unwrap().status, ExpertStatus::Offline);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop")
            .unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }
}
