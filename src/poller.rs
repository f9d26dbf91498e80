//! The tick-fetch-diff-advance loop.
//!
//! A [`Poller`] owns everything one monitor remembers between ticks: the
//! last index it saw and the last snapshot it observed, held together in
//! a [`MonitorState`].  Several pollers can run side by side; they share
//! the gateway (which is immutable) and the event channel, nothing else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::diff::{diff_instances, diff_services};
use crate::error::{Error, Result};
use crate::registry::{Fetched, RegistryGateway};
use crate::types::{DeltaEvent, InstanceSnapshot, ServiceSnapshot, WaitIndex};

/// What a poller watches.
#[async_trait]
pub trait Target: Send + Sync {
    type Snapshot: Default + Send + Sync;

    /// Human-readable name used in log lines.
    fn describe(&self) -> String;

    async fn fetch(
        &self,
        gateway: &dyn RegistryGateway,
        index: WaitIndex,
    ) -> Result<Fetched<Self::Snapshot>>;

    fn diff(&self, prev: &Self::Snapshot, curr: &Self::Snapshot) -> Vec<DeltaEvent>;
}

/// Registrations and deregistrations of whole services.
pub struct ServiceCatalog;

#[async_trait]
impl Target for ServiceCatalog {
    type Snapshot = ServiceSnapshot;

    fn describe(&self) -> String {
        "service catalog".to_string()
    }

    async fn fetch(
        &self,
        gateway: &dyn RegistryGateway,
        index: WaitIndex,
    ) -> Result<Fetched<ServiceSnapshot>> {
        gateway.fetch_service_names(index).await
    }

    fn diff(&self, prev: &ServiceSnapshot, curr: &ServiceSnapshot) -> Vec<DeltaEvent> {
        diff_services(prev, curr)
    }
}

/// Instances and health transitions of one named service.
pub struct ServiceHealth {
    pub service: String,
}

impl ServiceHealth {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl Target for ServiceHealth {
    type Snapshot = InstanceSnapshot;

    fn describe(&self) -> String {
        format!("health of {}", self.service)
    }

    async fn fetch(
        &self,
        gateway: &dyn RegistryGateway,
        index: WaitIndex,
    ) -> Result<Fetched<InstanceSnapshot>> {
        gateway.fetch_service_instances(&self.service, index).await
    }

    fn diff(&self, prev: &InstanceSnapshot, curr: &InstanceSnapshot) -> Vec<DeltaEvent> {
        diff_instances(&self.service, prev, curr)
    }
}

/// Index and snapshot retained by one monitor.
///
/// The two only ever change together, through [`MonitorState::advance`].
#[derive(Debug, Clone)]
pub struct MonitorState<S> {
    last_index: WaitIndex,
    snapshot: Option<S>,
}

impl<S> MonitorState<S> {
    pub fn new(initial_index: WaitIndex) -> Self {
        Self {
            last_index: initial_index,
            snapshot: None,
        }
    }

    pub fn last_index(&self) -> WaitIndex {
        self.last_index
    }

    /// The last snapshot actually observed, if any poll has succeeded.
    pub fn snapshot(&self) -> Option<&S> {
        self.snapshot.as_ref()
    }

    /// Replace index and snapshot in one step.  Never moves the index
    /// backwards.
    pub fn advance(&mut self, fetched: Fetched<S>) -> Result<()> {
        if fetched.index < self.last_index {
            return Err(Error::StaleIndex {
                last: self.last_index,
                returned: fetched.index,
            });
        }
        self.last_index = fetched.index;
        self.snapshot = Some(fetched.value);
        Ok(())
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The registry returned the index we already had.
    Unchanged,
    /// First observation, recorded without reporting anything.
    Baseline,
    /// The index advanced; these are the differences found.
    Changed(Vec<DeltaEvent>),
}

pub struct Poller<T: Target> {
    gateway: Arc<dyn RegistryGateway>,
    target: T,
    tick: Duration,
    report_initial: bool,
    state: MonitorState<T::Snapshot>,
}

impl<T: Target> Poller<T> {
    pub fn new(
        gateway: Arc<dyn RegistryGateway>,
        target: T,
        tick: Duration,
        initial_index: WaitIndex,
    ) -> Self {
        Self {
            gateway,
            target,
            tick,
            report_initial: false,
            state: MonitorState::new(initial_index),
        }
    }

    /// Report the first observation as additions instead of silently
    /// recording it.
    pub fn report_initial(mut self, enabled: bool) -> Self {
        self.report_initial = enabled;
        self
    }

    pub fn state(&self) -> &MonitorState<T::Snapshot> {
        &self.state
    }

    /// One fetch-diff-advance cycle.
    ///
    /// On error the retained state is left exactly as it was.  Nothing
    /// after the fetch awaits, so dropping this future part-way never
    /// leaves a half-applied update behind.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let last = self.state.last_index();
        if self.state.snapshot().is_none() && last != WaitIndex::ZERO {
            return self.seed_from(last).await;
        }

        let fetched = self.target.fetch(self.gateway.as_ref(), last).await?;

        if fetched.index == last {
            return Ok(PollOutcome::Unchanged);
        }
        if fetched.index < last {
            return Err(Error::StaleIndex {
                last,
                returned: fetched.index,
            });
        }

        let outcome = match self.state.snapshot() {
            Some(prev) => PollOutcome::Changed(self.target.diff(prev, &fetched.value)),
            None if self.report_initial => {
                let empty = <T::Snapshot as Default>::default();
                PollOutcome::Changed(self.target.diff(&empty, &fetched.value))
            }
            None => PollOutcome::Baseline,
        };

        self.state.advance(fetched)?;
        Ok(outcome)
    }

    /// First poll when starting from a configured index.
    ///
    /// A blocking query on `start` would only return once something has
    /// already changed, leaving nothing to diff it against.  Read the
    /// current state without blocking instead: if the registry has not
    /// moved past `start`, that is the state as of `start` and becomes the
    /// baseline.  If it has, the state at `start` is gone and the whole
    /// current membership is reported as added.
    async fn seed_from(&mut self, start: WaitIndex) -> Result<PollOutcome> {
        let fetched = self.target.fetch(self.gateway.as_ref(), WaitIndex::ZERO).await?;

        if fetched.index <= start {
            self.state.advance(Fetched::new(fetched.value, start))?;
            return Ok(PollOutcome::Baseline);
        }

        let empty = <T::Snapshot as Default>::default();
        let events = self.target.diff(&empty, &fetched.value);
        self.state.advance(fetched)?;
        Ok(PollOutcome::Changed(events))
    }

    /// Poll on every tick until `cancel` fires, forwarding events to
    /// `events`.
    ///
    /// Failed fetches are logged and retried on the next tick.  The loop
    /// only ends early if the event channel closes.  Cancellation is also
    /// honoured while waiting for room in a full channel; any events of
    /// that batch not yet sent are dropped.
    pub async fn run(
        mut self,
        events: mpsc::Sender<DeltaEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let name = self.target.describe();
        info!("Monitoring {} every {:?}", name, self.tick);

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'poll: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(PollOutcome::Unchanged) => {
                    debug!("No change in {} at index {}", name, self.state.last_index());
                }
                Ok(PollOutcome::Baseline) => {
                    info!("Recorded baseline for {} at index {}", name, self.state.last_index());
                }
                Ok(PollOutcome::Changed(batch)) => {
                    debug!(
                        "{} changed at index {}: {} events",
                        name,
                        self.state.last_index(),
                        batch.len()
                    );
                    for event in batch {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'poll,
                            sent = events.send(event) => {
                                if sent.is_err() {
                                    error!("Event channel closed, stopping monitor for {}", name);
                                    return Err(Error::ChannelClosed);
                                }
                            }
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    error!("Failed to poll {}: {}", name, e);
                }
                Err(e) => return Err(e),
            }
        }

        info!("Monitor for {} stopped", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckStatus, HealthState, InstanceId, InstanceRecord};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Script<T> = Mutex<VecDeque<Result<Fetched<T>>>>;

    /// Gateway that replays canned answers and records the indices it
    /// was asked for.  Once a script runs dry the call blocks forever.
    #[derive(Default)]
    struct ScriptedGateway {
        services: Script<ServiceSnapshot>,
        instances: Script<InstanceSnapshot>,
        requested: Mutex<Vec<WaitIndex>>,
    }

    impl ScriptedGateway {
        fn services(script: Vec<Result<Fetched<ServiceSnapshot>>>) -> Arc<Self> {
            Arc::new(Self {
                services: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn instances(script: Vec<Result<Fetched<InstanceSnapshot>>>) -> Arc<Self> {
            Arc::new(Self {
                instances: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn requested(&self) -> Vec<WaitIndex> {
            self.requested.lock().unwrap().clone()
        }
    }

    async fn next<T>(script: &Script<T>) -> Result<Fetched<T>> {
        let answer = script.lock().unwrap().pop_front();
        match answer {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }

    #[async_trait]
    impl RegistryGateway for ScriptedGateway {
        async fn fetch_service_names(&self, index: WaitIndex) -> Result<Fetched<ServiceSnapshot>> {
            self.requested.lock().unwrap().push(index);
            next(&self.services).await
        }

        async fn fetch_service_instances(
            &self,
            _service: &str,
            index: WaitIndex,
        ) -> Result<Fetched<InstanceSnapshot>> {
            self.requested.lock().unwrap().push(index);
            next(&self.instances).await
        }
    }

    fn names(names: &[&str], index: u64) -> Result<Fetched<ServiceSnapshot>> {
        Ok(Fetched::new(
            names.iter().map(|n| n.to_string()).collect(),
            WaitIndex(index),
        ))
    }

    fn failure<T>() -> Result<Fetched<T>> {
        Err(Error::Registry("HTTP 500: No cluster leader".into()))
    }

    fn catalog_poller(gateway: Arc<ScriptedGateway>) -> Poller<ServiceCatalog> {
        Poller::new(gateway, ServiceCatalog, Duration::from_millis(10), WaitIndex::ZERO)
    }

    #[tokio::test]
    async fn failures_do_not_corrupt_retained_state() {
        let gateway = ScriptedGateway::services(vec![
            names(&["web", "db"], 10),
            failure(),
            failure(),
            names(&["db", "cache"], 12),
        ]);
        let mut poller = catalog_poller(gateway.clone());

        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Baseline);
        for _ in 0..2 {
            assert!(poller.poll_once().await.is_err());
            assert_eq!(poller.state().last_index(), WaitIndex(10));
            assert_eq!(poller.state().snapshot().unwrap().len(), 2);
        }

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Changed(vec![
                DeltaEvent::ServiceRemoved { name: "web".into() },
                DeltaEvent::ServiceAdded {
                    name: "cache".into()
                },
            ])
        );
        assert_eq!(poller.state().last_index(), WaitIndex(12));
        assert_eq!(
            gateway.requested(),
            vec![WaitIndex(0), WaitIndex(10), WaitIndex(10), WaitIndex(10)]
        );
    }

    #[tokio::test]
    async fn same_index_skips_the_diff() {
        let gateway = ScriptedGateway::services(vec![
            names(&["web"], 10),
            names(&["web", "surprise"], 10),
        ]);
        let mut poller = catalog_poller(gateway);

        poller.poll_once().await.unwrap();
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Unchanged);

        let retained: Vec<&String> = poller.state().snapshot().unwrap().iter().collect();
        assert_eq!(retained, vec!["web"]);
    }

    #[tokio::test]
    async fn stale_index_is_rejected_without_regressing() {
        let gateway = ScriptedGateway::services(vec![names(&["web"], 10), names(&[], 5)]);
        let mut poller = catalog_poller(gateway);

        poller.poll_once().await.unwrap();
        let err = poller.poll_once().await.unwrap_err();

        assert!(matches!(
            err,
            Error::StaleIndex {
                last: WaitIndex(10),
                returned: WaitIndex(5)
            }
        ));
        assert_eq!(poller.state().last_index(), WaitIndex(10));
        assert!(poller.state().snapshot().unwrap().contains("web"));
    }

    #[tokio::test]
    async fn index_never_decreases_across_polls() {
        let gateway = ScriptedGateway::services(vec![
            names(&["a"], 3),
            names(&["a", "b"], 8),
            failure(),
            names(&["b"], 2),
            names(&["b"], 8),
            names(&["c"], 20),
        ]);
        let mut poller = catalog_poller(gateway);

        let mut last = poller.state().last_index();
        for _ in 0..6 {
            let _ = poller.poll_once().await;
            assert!(poller.state().last_index() >= last);
            last = poller.state().last_index();
        }
        assert_eq!(last, WaitIndex(20));
    }

    #[tokio::test]
    async fn initial_observation_can_be_reported() {
        let gateway = ScriptedGateway::services(vec![names(&["web", "db"], 4)]);
        let mut poller = catalog_poller(gateway).report_initial(true);

        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Changed(vec![
                DeltaEvent::ServiceAdded { name: "db".into() },
                DeltaEvent::ServiceAdded { name: "web".into() },
            ])
        );
    }

    #[tokio::test]
    async fn first_change_after_configured_index_is_reported() {
        let gateway = ScriptedGateway::services(vec![
            names(&["web"], 100),
            names(&["web", "db"], 120),
        ]);
        let mut poller = Poller::new(
            gateway.clone(),
            ServiceCatalog,
            Duration::from_millis(10),
            WaitIndex(100),
        );

        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Baseline);
        assert_eq!(poller.state().last_index(), WaitIndex(100));
        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Changed(vec![DeltaEvent::ServiceAdded { name: "db".into() }])
        );
        // Seeded without blocking, then blocked from the configured index.
        assert_eq!(gateway.requested(), vec![WaitIndex(0), WaitIndex(100)]);
    }

    #[tokio::test]
    async fn registry_already_past_configured_index_reports_full_membership() {
        let gateway = ScriptedGateway::services(vec![names(&["web", "db"], 120)]);
        let mut poller = Poller::new(
            gateway,
            ServiceCatalog,
            Duration::from_millis(10),
            WaitIndex(100),
        );

        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Changed(vec![
                DeltaEvent::ServiceAdded { name: "db".into() },
                DeltaEvent::ServiceAdded { name: "web".into() },
            ])
        );
        assert_eq!(poller.state().last_index(), WaitIndex(120));
    }

    #[tokio::test]
    async fn failed_seed_keeps_configured_index() {
        let gateway = ScriptedGateway::services(vec![failure(), names(&["web"], 90)]);
        let mut poller = Poller::new(
            gateway.clone(),
            ServiceCatalog,
            Duration::from_millis(10),
            WaitIndex(100),
        );

        assert!(poller.poll_once().await.is_err());
        assert!(poller.state().snapshot().is_none());
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Baseline);
        assert_eq!(poller.state().last_index(), WaitIndex(100));
        assert_eq!(gateway.requested(), vec![WaitIndex(0), WaitIndex(0)]);
    }

    #[tokio::test]
    async fn polling_resumes_once_registry_passes_the_old_index() {
        // A registry restored from an older snapshot reports lower indices
        // until it catches up; those answers are skipped, not diffed.
        let gateway = ScriptedGateway::services(vec![
            names(&["web"], 10),
            names(&["db"], 5),
            names(&["db"], 7),
            names(&["db"], 12),
        ]);
        let mut poller = catalog_poller(gateway);

        poller.poll_once().await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                poller.poll_once().await,
                Err(Error::StaleIndex { .. })
            ));
            assert_eq!(poller.state().last_index(), WaitIndex(10));
        }
        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Changed(vec![
                DeltaEvent::ServiceRemoved { name: "web".into() },
                DeltaEvent::ServiceAdded { name: "db".into() },
            ])
        );
    }

    #[tokio::test]
    async fn run_stops_on_cancel_while_channel_is_full() {
        let gateway = ScriptedGateway::services(vec![
            names(&["a"], 1),
            names(&["a", "b", "c", "d"], 2),
        ]);
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(catalog_poller(gateway).run(tx, cancel.clone()));

        // Wait until the first event fills the channel; the second send
        // then has nowhere to go.
        while rx.len() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor ignored cancellation")
            .unwrap()
            .unwrap();
        assert_eq!(rx.recv().await, Some(DeltaEvent::ServiceAdded { name: "b".into() }));
    }

    #[tokio::test]
    async fn health_transition_is_reported_once() {
        fn snapshot(checks: Vec<CheckStatus>, index: u64) -> Result<Fetched<InstanceSnapshot>> {
            let id = InstanceId::new("node-1", "web-1");
            let record = InstanceRecord {
                id: id.clone(),
                checks,
            };
            Ok(Fetched::new([(id, record)].into_iter().collect(), WaitIndex(index)))
        }

        let gateway = ScriptedGateway::instances(vec![
            snapshot(vec![CheckStatus::Passing, CheckStatus::Passing], 1),
            snapshot(vec![CheckStatus::Critical, CheckStatus::Warning], 2),
            snapshot(vec![CheckStatus::Critical, CheckStatus::Warning], 3),
        ]);
        let mut poller = Poller::new(
            gateway,
            ServiceHealth::new("web"),
            Duration::from_millis(10),
            WaitIndex::ZERO,
        );

        poller.poll_once().await.unwrap();
        assert_eq!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Changed(vec![DeltaEvent::InstanceHealthChanged {
                service: "web".into(),
                id: InstanceId::new("node-1", "web-1"),
                old: HealthState::Passing,
                new: HealthState::NotPassing,
            }])
        );
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Changed(vec![]));
    }

    #[tokio::test]
    async fn run_forwards_events_and_stops_on_cancel() {
        let gateway = ScriptedGateway::services(vec![
            names(&["web"], 1),
            failure(),
            names(&["web", "db"], 2),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(catalog_poller(gateway).run(tx, cancel.clone()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, DeltaEvent::ServiceAdded { name: "db".into() });

        // The script is exhausted, so the poller is parked inside a fetch.
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn run_stops_when_channel_closes() {
        let gateway = ScriptedGateway::services(vec![names(&["a"], 1), names(&["a", "b"], 2)]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = catalog_poller(gateway)
            .run(tx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[test]
    fn state_refuses_to_go_backwards() {
        let mut state = MonitorState::new(WaitIndex(5));
        let err = state
            .advance(Fetched::new(ServiceSnapshot::new(), WaitIndex(4)))
            .unwrap_err();
        assert!(matches!(err, Error::StaleIndex { .. }));
        assert!(state.snapshot().is_none());
        assert_eq!(state.last_index(), WaitIndex(5));
    }
}
