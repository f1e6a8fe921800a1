//! Connection poller — reconciles the observed state of messaging-channel
//! instances and reports each connect / disconnect exactly once.
//!
//! The poller only observes. Every known instance stays watched, including
//! disconnected ones, so a reconnection done elsewhere is still picked up.
//! A fetch that fails or times out is logged and skipped for that tick; the
//! previous snapshot is kept and other instances are unaffected.
//!
//! Each watch entry carries an epoch that changes whenever the id is added
//! again. Fetches are tagged with it, so a reply for an entry that was
//! removed (or removed and re-added) since the fetch started is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use schoolcast_core::error::{Result, SchoolCastError};
use schoolcast_core::traits::StatusApi;
use schoolcast_core::types::{ConnectionResource, ConnectionStatus, StatusReport};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// A detected change between two consecutive observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        id: String,
        phone_number: Option<String>,
    },
    Disconnected {
        id: String,
    },
}

impl ConnectionEvent {
    pub fn id(&self) -> &str {
        match self {
            ConnectionEvent::Connected { id, .. } | ConnectionEvent::Disconnected { id } => id,
        }
    }
}

/// What one `tick()` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    /// Skipped because the previous fetch for the same id is still pending.
    pub skipped_in_flight: usize,
    pub failed: usize,
    pub events: usize,
}

#[derive(Default)]
struct PollerState {
    /// Watched id -> epoch of the entry.
    watched: BTreeMap<String, u64>,
    next_epoch: u64,
    snapshots: HashMap<String, ConnectionResource>,
    /// Id -> epoch of the fetch pending for it.
    in_flight: HashMap<String, u64>,
}

impl PollerState {
    fn add(&mut self, id: String) -> bool {
        if self.watched.contains_key(&id) {
            return false;
        }
        self.next_epoch += 1;
        self.watched.insert(id, self.next_epoch);
        true
    }

    fn remove(&mut self, id: &str) -> bool {
        self.snapshots.remove(id);
        self.watched.remove(id).is_some()
    }
}

struct Inner {
    api: Arc<dyn StatusApi>,
    fetch_timeout: Duration,
    state: Mutex<PollerState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

enum Applied {
    Failed,
    Discarded,
    Updated(Option<ConnectionEvent>),
}

/// Cloneable poller handle; clones share the watch set and snapshots.
#[derive(Clone)]
pub struct ConnectionPoller {
    inner: Arc<Inner>,
}

impl ConnectionPoller {
    /// Create a poller and the receiver its transition events are sent to.
    pub fn new(
        api: Arc<dyn StatusApi>,
        fetch_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let poller = Self {
            inner: Arc::new(Inner {
                api,
                fetch_timeout,
                state: Mutex::new(PollerState::default()),
                events,
            }),
        };
        (poller, rx)
    }

    /// Start watching `id`. Returns `false` if it was already watched.
    pub fn watch(&self, id: &str) -> bool {
        let added = self.lock_state().add(id.to_string());
        if added {
            tracing::debug!("👀 Watching instance {}", id);
        }
        added
    }

    /// Stop watching `id` and forget its snapshot.
    pub fn unwatch(&self, id: &str) -> bool {
        let removed = self.lock_state().remove(id);
        if removed {
            tracing::debug!("🙈 Unwatched instance {}", id);
        }
        removed
    }

    /// Make the watch set equal to `desired`.
    pub fn reconcile_set<I, S>(&self, desired: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let desired: BTreeSet<String> = desired.into_iter().map(Into::into).collect();
        let mut state = self.lock_state();

        let stale: Vec<String> = state
            .watched
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            state.remove(id);
        }
        let mut added = 0;
        for id in desired {
            if state.add(id) {
                added += 1;
            }
        }
        if added > 0 || !stale.is_empty() {
            tracing::debug!(
                "🔄 Watch set reconciled: +{} -{} ({} watched)",
                added,
                stale.len(),
                state.watched.len()
            );
        }
    }

    pub fn watched(&self) -> Vec<String> {
        self.lock_state().watched.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().watched.is_empty()
    }

    /// Last observed state of `id`, if any fetch for it has succeeded.
    pub fn snapshot(&self, id: &str) -> Option<ConnectionResource> {
        self.lock_state().snapshots.get(id).cloned()
    }

    /// Fetch every watched id that has no fetch pending, concurrently, and
    /// diff each reply against its snapshot as soon as it arrives.
    ///
    /// The set of ids is fixed when the tick starts; watch-set changes made
    /// while it runs apply from the next tick on. An id re-added since its
    /// pending fetch started is fetched again; the older reply is dropped.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let targets: Vec<(String, u64)> = {
            let mut state = self.lock_state();
            let round: Vec<(String, u64)> = state
                .watched
                .iter()
                .map(|(id, epoch)| (id.clone(), *epoch))
                .collect();
            round
                .into_iter()
                .filter(|(id, epoch)| {
                    if state.in_flight.get(id) == Some(epoch) {
                        report.skipped_in_flight += 1;
                        return false;
                    }
                    state.in_flight.insert(id.clone(), *epoch);
                    true
                })
                .collect()
        };

        if targets.is_empty() {
            return report;
        }

        let fetches = targets.into_iter().map(|(id, epoch)| async move {
            let _pending = InFlight {
                poller: self,
                id: id.clone(),
                epoch,
            };
            let outcome = self.fetch(&id).await;
            self.apply(&id, epoch, outcome)
        });

        for applied in futures::future::join_all(fetches).await {
            match applied {
                Applied::Failed => report.failed += 1,
                Applied::Discarded => report.fetched += 1,
                Applied::Updated(event) => {
                    report.fetched += 1;
                    if event.is_some() {
                        report.events += 1;
                    }
                }
            }
        }
        report
    }

    /// Drive `tick()` every `interval` until `shutdown` turns true.
    ///
    /// Each tick runs on its own task so a slow instance never delays the
    /// cadence. Ticks are skipped while nothing is watched.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "📡 Connection poller started (every {}s)",
            interval.as_secs_f32()
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while ticks.try_join_next().is_some() {}
                    if self.is_empty() {
                        continue;
                    }
                    let poller = self.clone();
                    ticks.spawn(async move {
                        let report = poller.tick().await;
                        tracing::trace!("📡 Poll tick: {:?}", report);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        ticks.shutdown().await;
        tracing::info!("📡 Connection poller stopped");
    }

    fn lock_state(&self) -> MutexGuard<'_, PollerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, id: &str) -> Result<StatusReport> {
        let timeout = self.inner.fetch_timeout;
        match tokio::time::timeout(timeout, self.inner.api.fetch_status(id)).await {
            Ok(result) => result,
            Err(_) => Err(SchoolCastError::timeout(timeout)),
        }
    }

    fn apply(&self, id: &str, epoch: u64, outcome: Result<StatusReport>) -> Applied {
        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("⚠️ Status fetch for {} failed: {}", id, e);
                return Applied::Failed;
            }
        };

        let mut state = self.lock_state();
        if state.watched.get(id) != Some(&epoch) {
            tracing::debug!("🗑️ Dropping stale status for instance {}", id);
            return Applied::Discarded;
        }

        let current = ConnectionResource::from_report(id, report);
        let (event, changed) = match state.snapshots.get(id) {
            // First observation only sets the baseline.
            None => (None, true),
            Some(previous) => (
                transition(previous, &current),
                previous.status != current.status || previous.metadata_differs(&current),
            ),
        };
        if changed {
            state.snapshots.insert(id.to_string(), current);
        }

        if let Some(event) = &event {
            tracing::info!("🔌 Instance {}: {:?}", id, event);
            // Nobody listening is not an error for the poller.
            let _ = self.inner.events.send(event.clone());
        }
        Applied::Updated(event)
    }
}

fn transition(previous: &ConnectionResource, current: &ConnectionResource) -> Option<ConnectionEvent> {
    use ConnectionStatus::*;
    match (previous.status, current.status) {
        (Disconnected | Connecting, Connected) => Some(ConnectionEvent::Connected {
            id: current.id.clone(),
            phone_number: current.phone_number.clone(),
        }),
        (Connected, Disconnected) => Some(ConnectionEvent::Disconnected {
            id: current.id.clone(),
        }),
        _ => None,
    }
}

/// Clears the in-flight mark for one fetch, even if the fetch is dropped.
/// A newer fetch for a re-added entry keeps its own mark.
struct InFlight<'a> {
    poller: &'a ConnectionPoller,
    id: String,
    epoch: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.poller.lock_state();
        if state.in_flight.get(&self.id) == Some(&self.epoch) {
            state.in_flight.remove(&self.id);
        }
    }
}
