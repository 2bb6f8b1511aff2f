//! Global coordinator
//!
//! S3-backed worker registry and leader election. One coordinator per
//! namespace serializes singleton background work (consolidation loops,
//! cleanup) across processes. Workers heartbeat into
//! `plg_coordinator_global/{ns}/workers/{workerId}.json`; the leader holds
//! `plg_coordinator_global/{ns}/state.json`, renewed every cycle and
//! guarded by conditional puts so only one election writer wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use s3db_types::S3dbError;

use crate::database::Database;
use crate::events::EventBus;
use crate::plugins::Plugin;
use crate::storage::{ObjectClient, PutOptions};

const COORDINATOR_PREFIX: &str = "plg_coordinator_global";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub namespace: String,
    pub heartbeat_interval: Duration,
    pub lease_timeout: Duration,
    pub worker_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(15),
            worker_timeout: Duration::from_secs(20),
        }
    }
}

/// Contents of `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaderState {
    leader: String,
    epoch: u64,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

/// Contents of `workers/{workerId}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerRecord {
    #[serde(rename = "workerId")]
    worker_id: String,
    #[serde(rename = "startedAt")]
    started_at: DateTime<Utc>,
    #[serde(rename = "lastHeartbeat")]
    last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorMetrics {
    pub heartbeats: u64,
    pub elections: u64,
    pub leader_changes: u64,
    pub election_failures: u64,
}

struct CoordinatorRuntime {
    client: ObjectClient,
    prefix: String,
    events: EventBus,
}

pub struct GlobalCoordinator {
    config: CoordinatorConfig,
    worker_id: String,
    started_at: DateTime<Utc>,
    is_leader: AtomicBool,
    known_leader: RwLock<Option<String>>,
    metrics: RwLock<CoordinatorMetrics>,
    runtime: tokio::sync::RwLock<Option<CoordinatorRuntime>>,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    self_ref: std::sync::Weak<GlobalCoordinator>,
}

fn make_worker_id(namespace: &str) -> String {
    format!(
        "gcs-{}-{}-{:08x}",
        namespace,
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

impl GlobalCoordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let worker_id = make_worker_id(&config.namespace);
        Arc::new_cyclic(|weak| Self {
            config,
            worker_id,
            started_at: Utc::now(),
            is_leader: AtomicBool::new(false),
            known_leader: RwLock::new(None),
            metrics: RwLock::new(CoordinatorMetrics::default()),
            runtime: tokio::sync::RwLock::new(None),
            shutdown: Notify::new(),
            task: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        self.metrics.read().unwrap().clone()
    }

    fn state_key(&self, prefix: &str) -> String {
        let relative = format!("{COORDINATOR_PREFIX}/{}/state.json", self.config.namespace);
        if prefix.is_empty() {
            relative
        } else {
            format!("{prefix}/{relative}")
        }
    }

    fn worker_key(&self, prefix: &str, worker_id: &str) -> String {
        let relative = format!(
            "{COORDINATOR_PREFIX}/{}/workers/{worker_id}.json",
            self.config.namespace
        );
        if prefix.is_empty() {
            relative
        } else {
            format!("{prefix}/{relative}")
        }
    }

    fn workers_prefix(&self, prefix: &str) -> String {
        let relative = format!("{COORDINATOR_PREFIX}/{}/workers/", self.config.namespace);
        if prefix.is_empty() {
            relative
        } else {
            format!("{prefix}/{relative}")
        }
    }

    /// Bind this coordinator to a database without spawning the loop.
    /// Used by `start` and directly by tests that drive `tick` manually.
    pub async fn bind(&self, db: &Database) {
        *self.runtime.write().await = Some(CoordinatorRuntime {
            client: db.client().clone(),
            prefix: db.config().prefix.clone(),
            events: db.events().clone(),
        });
    }

    /// One heartbeat + election cycle.
    pub async fn tick(&self) -> Result<(), S3dbError> {
        let runtime = self.runtime.read().await;
        let Some(runtime) = runtime.as_ref() else {
            return Err(S3dbError::Config {
                message: "coordinator is not bound to a database".to_string(),
            });
        };
        self.heartbeat(runtime).await?;
        self.observe_leadership(runtime).await
    }

    async fn heartbeat(&self, runtime: &CoordinatorRuntime) -> Result<(), S3dbError> {
        let record = WorkerRecord {
            worker_id: self.worker_id.clone(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
        };
        let body = serde_json::to_vec(&record).unwrap_or_default();
        runtime
            .client
            .put(
                &self.worker_key(&runtime.prefix, &self.worker_id),
                Bytes::from(body),
                Default::default(),
                PutOptions::default(),
            )
            .await?;
        self.metrics.write().unwrap().heartbeats += 1;
        Ok(())
    }

    async fn read_state(
        &self,
        runtime: &CoordinatorRuntime,
    ) -> Result<Option<(LeaderState, String)>, S3dbError> {
        match runtime.client.get(&self.state_key(&runtime.prefix)).await {
            Ok(data) => {
                let state: LeaderState =
                    serde_json::from_slice(&data.body).map_err(|_| S3dbError::Config {
                        message: "corrupt coordinator state object".to_string(),
                    })?;
                Ok(Some((state, data.etag)))
            }
            Err(e) if e.is_missing() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn active_workers(&self, runtime: &CoordinatorRuntime) -> Result<Vec<String>, S3dbError> {
        let keys = runtime
            .client
            .list_all_keys(&self.workers_prefix(&runtime.prefix))
            .await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.worker_timeout).unwrap_or_default();
        let mut active = Vec::new();
        for key in keys {
            let Ok(data) = runtime.client.get(&key).await else {
                continue;
            };
            let Ok(record) = serde_json::from_slice::<WorkerRecord>(&data.body) else {
                continue;
            };
            if record.last_heartbeat >= cutoff {
                active.push(record.worker_id);
            }
        }
        active.sort();
        Ok(active)
    }

    async fn observe_leadership(&self, runtime: &CoordinatorRuntime) -> Result<(), S3dbError> {
        let state = self.read_state(runtime).await?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease_timeout).unwrap_or_default();

        if let Some((state, etag)) = &state {
            let fresh = now - state.updated_at <= lease;
            if fresh {
                if state.leader == self.worker_id {
                    // renew the lease; losing the conditional put just
                    // means someone else moved state, re-read next cycle
                    match self
                        .write_state(runtime, state.leader.clone(), state.epoch, Some(etag.clone()))
                        .await
                    {
                        Ok(()) => self.become_leader(runtime, state.epoch),
                        Err(S3dbError::Race { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    return Ok(());
                }
                // a fresh lease still needs a live leader behind it: a
                // recorded leader with no active worker record forces an
                // election even before the lease expires
                let active = self.active_workers(runtime).await?;
                if active.contains(&state.leader) {
                    self.observe_other_leader(runtime, &state.leader, state.epoch);
                    return Ok(());
                }
                warn!(
                    namespace = %self.config.namespace,
                    leader = %state.leader,
                    "lease is fresh but the leader has no active worker, attempting election"
                );
            }
        }

        // stale or missing state: attempt an election
        self.metrics.write().unwrap().elections += 1;
        let active = self.active_workers(runtime).await?;
        let Some(winner) = active.first().cloned() else {
            debug!(namespace = %self.config.namespace, "no active workers, skipping election");
            return Ok(());
        };
        let (previous_leader, previous_epoch, etag) = match &state {
            Some((s, etag)) => (Some(s.leader.clone()), s.epoch, Some(etag.clone())),
            None => (None, 0, None),
        };
        let epoch = if previous_leader.as_deref() == Some(winner.as_str()) {
            previous_epoch
        } else {
            previous_epoch + 1
        };

        match self.write_state(runtime, winner.clone(), epoch, etag).await {
            Ok(()) => {
                info!(
                    namespace = %self.config.namespace,
                    leader = %winner,
                    epoch,
                    "leader elected"
                );
                if winner == self.worker_id {
                    self.become_leader(runtime, epoch);
                } else {
                    self.observe_other_leader(runtime, &winner, epoch);
                }
                Ok(())
            }
            Err(S3dbError::Race { .. }) => {
                // another worker won the conditional write; pick it up next cycle
                self.metrics.write().unwrap().election_failures += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_state(
        &self,
        runtime: &CoordinatorRuntime,
        leader: String,
        epoch: u64,
        etag: Option<String>,
    ) -> Result<(), S3dbError> {
        let state = LeaderState {
            leader,
            epoch,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec(&state).unwrap_or_default();
        let options = PutOptions {
            if_match: etag.clone(),
            if_none_match_any: etag.is_none(),
            ..Default::default()
        };
        runtime
            .client
            .put(
                &self.state_key(&runtime.prefix),
                Bytes::from(body),
                Default::default(),
                options,
            )
            .await
            .map(|_| ())
    }

    fn become_leader(&self, runtime: &CoordinatorRuntime, epoch: u64) {
        let was_leader = self.is_leader.swap(true, Ordering::SeqCst);
        let previous = self
            .known_leader
            .write()
            .unwrap()
            .replace(self.worker_id.clone());
        if !was_leader {
            self.metrics.write().unwrap().leader_changes += 1;
            runtime.events.emit(
                "leader:acquired",
                json!({
                    "namespace": self.config.namespace,
                    "workerId": self.worker_id,
                    "epoch": epoch,
                }),
            );
        }
        if previous.as_deref() != Some(self.worker_id.as_str()) {
            runtime.events.emit(
                "leader:changed",
                json!({
                    "namespace": self.config.namespace,
                    "leader": self.worker_id,
                    "epoch": epoch,
                }),
            );
        }
    }

    fn observe_other_leader(&self, runtime: &CoordinatorRuntime, leader: &str, epoch: u64) {
        let was_leader = self.is_leader.swap(false, Ordering::SeqCst);
        if was_leader {
            runtime.events.emit(
                "leader:lost",
                json!({
                    "namespace": self.config.namespace,
                    "workerId": self.worker_id,
                    "epoch": epoch,
                }),
            );
        }
        let previous = self
            .known_leader
            .write()
            .unwrap()
            .replace(leader.to_string());
        if previous.as_deref() != Some(leader) {
            runtime.events.emit(
                "leader:changed",
                json!({
                    "namespace": self.config.namespace,
                    "leader": leader,
                    "epoch": epoch,
                }),
            );
        }
    }

    async fn cleanup(&self) {
        let runtime = self.runtime.read().await;
        let Some(runtime) = runtime.as_ref() else {
            return;
        };
        let _ = runtime
            .client
            .delete(&self.worker_key(&runtime.prefix, &self.worker_id))
            .await;
        if self.is_leader.swap(false, Ordering::SeqCst) {
            let _ = runtime.client.delete(&self.state_key(&runtime.prefix)).await;
            runtime.events.emit(
                "leader:lost",
                json!({
                    "namespace": self.config.namespace,
                    "workerId": self.worker_id,
                }),
            );
        }
    }
}

#[async_trait]
impl Plugin for GlobalCoordinator {
    fn name(&self) -> &str {
        "coordinator"
    }

    async fn install(&self, db: &Database) -> Result<(), S3dbError> {
        self.bind(db).await;
        Ok(())
    }

    async fn start(&self, db: &Database) -> Result<(), S3dbError> {
        self.bind(db).await;
        let coordinator = self.self_ref.upgrade().ok_or_else(|| S3dbError::Config {
            message: "coordinator was dropped before start".to_string(),
        })?;
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.tick().await {
                            warn!(error = %e, "coordinator cycle failed");
                        }
                    }
                    _ = coordinator.shutdown.notified() => break,
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), S3dbError> {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.cleanup().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::connect("memory://coord-bucket/app").await.unwrap()
    }

    fn coordinator(namespace: &str) -> Arc<GlobalCoordinator> {
        GlobalCoordinator::new(CoordinatorConfig {
            namespace: namespace.to_string(),
            heartbeat_interval: Duration::from_millis(10),
            lease_timeout: Duration::from_millis(200),
            worker_timeout: Duration::from_millis(400),
        })
    }

    #[tokio::test]
    async fn single_worker_elects_itself() {
        let db = test_db().await;
        let worker = coordinator("ns");
        worker.bind(&db).await;

        worker.tick().await.unwrap();
        assert!(worker.is_leader());
        assert_eq!(worker.metrics().elections, 1);
        assert_eq!(worker.metrics().leader_changes, 1);

        // a second cycle renews, it does not re-elect
        worker.tick().await.unwrap();
        assert!(worker.is_leader());
        assert_eq!(worker.metrics().elections, 1);
    }

    #[tokio::test]
    async fn smallest_worker_id_wins() {
        let db = test_db().await;
        let a = coordinator("ns");
        let b = coordinator("ns");
        a.bind(&db).await;
        b.bind(&db).await;

        // both register before any election runs, so the electorate is
        // complete and the deterministic tie-break decides
        {
            let runtime = a.runtime.read().await;
            a.heartbeat(runtime.as_ref().unwrap()).await.unwrap();
        }
        {
            let runtime = b.runtime.read().await;
            b.heartbeat(runtime.as_ref().unwrap()).await.unwrap();
        }
        a.tick().await.unwrap();
        b.tick().await.unwrap();

        let expected_leader = std::cmp::min(a.worker_id(), b.worker_id());
        assert_eq!(a.is_leader(), a.worker_id() == expected_leader);
        assert_eq!(b.is_leader(), b.worker_id() == expected_leader);
        assert!(a.is_leader() ^ b.is_leader());
    }

    #[tokio::test]
    async fn dead_leader_is_replaced_with_epoch_bump() {
        let db = test_db().await;
        let a = coordinator("ns");
        let b = coordinator("ns");
        a.bind(&db).await;
        b.bind(&db).await;

        a.tick().await.unwrap();
        b.tick().await.unwrap();

        let (leader, follower) = if a.is_leader() { (&a, &b) } else { (&b, &a) };
        assert!(leader.is_leader());

        // the leader dies abruptly: no cleanup, its heartbeat just stops
        // and both its worker record and the lease go stale
        tokio::time::sleep(Duration::from_millis(450)).await;

        follower.tick().await.unwrap();
        follower.tick().await.unwrap();
        assert!(follower.is_leader());

        let runtime = follower.runtime.read().await;
        let state = follower
            .read_state(runtime.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap()
            .0;
        assert_eq!(state.leader, follower.worker_id());
        assert_eq!(state.epoch, 2);
    }

    #[tokio::test]
    async fn dead_leader_is_replaced_while_lease_is_still_fresh() {
        let db = test_db().await;
        // lease far longer than the worker timeout: only the
        // worker-liveness trigger can unblock failover here
        let worker = |_: ()| {
            GlobalCoordinator::new(CoordinatorConfig {
                namespace: "ns".to_string(),
                heartbeat_interval: Duration::from_millis(10),
                lease_timeout: Duration::from_secs(60),
                worker_timeout: Duration::from_millis(100),
            })
        };
        let a = worker(());
        let b = worker(());
        a.bind(&db).await;
        b.bind(&db).await;

        a.tick().await.unwrap();
        assert!(a.is_leader());

        // a dies abruptly; its worker record goes stale long before the
        // lease would expire
        tokio::time::sleep(Duration::from_millis(250)).await;

        b.tick().await.unwrap();
        assert!(b.is_leader());

        let runtime = b.runtime.read().await;
        let state = b
            .read_state(runtime.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap()
            .0;
        assert_eq!(state.leader, b.worker_id());
        assert_eq!(state.epoch, 2);
    }

    #[tokio::test]
    async fn stop_cleans_worker_and_state() {
        let db = test_db().await;
        let worker = coordinator("ns");
        worker.bind(&db).await;
        worker.tick().await.unwrap();
        assert!(worker.is_leader());

        Plugin::stop(worker.as_ref()).await.unwrap();
        assert!(!worker.is_leader());
        let state_key = "app/plg_coordinator_global/ns/state.json";
        assert!(!db.client().exists(state_key).await.unwrap());
    }

    #[tokio::test]
    async fn leader_events_fire() {
        let db = test_db().await;
        let acquired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let changed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let a1 = Arc::clone(&acquired);
        db.events().on("leader:acquired", move |_| {
            a1.fetch_add(1, Ordering::SeqCst);
        });
        let c1 = Arc::clone(&changed);
        db.events().on("leader:changed", move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });

        let worker = coordinator("ns");
        worker.bind(&db).await;
        worker.tick().await.unwrap();
        worker.tick().await.unwrap();

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(changed.load(Ordering::SeqCst), 1);
    }
}
