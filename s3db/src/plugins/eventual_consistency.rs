//! Eventual-consistency consolidator
//!
//! Aggregates high-frequency numeric mutations (`add`, `sub`, `set`)
//! against one field of one record without read-modify-write on the hot
//! path. Writers append transactions to a per-field sibling resource
//! (`{resource}_transactions_{field}`), hour-partitioned by cohort. A
//! background loop (gated on coordinator leadership when one is attached)
//! folds pending transactions per record under a put-if-absent lock and
//! upserts the aggregate onto the owning record.
//!
//! Crash safety: the owner upsert carries a `pendingVersion` fence (the
//! sort key of the last folded transaction) in the same put as the
//! aggregate. Recovery ignores unapplied transactions at or below the
//! fence, so a crash between the upsert and the applied-marking never
//! double-counts additive operations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Number, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use s3db_types::{Document, S3dbError};

use crate::database::{Database, ResourceOptions};
use crate::partition::PartitionDefinition;
use crate::plugins::coordinator::GlobalCoordinator;
use crate::plugins::Plugin;
use crate::resource::ListOptions;

/// Immutable configuration for one `(resource, field)` pair. Every pair
/// gets its own value; the consolidator never shares mutable config.
#[derive(Debug, Clone)]
pub struct EventualConsistencyConfig {
    pub resource: String,
    pub field: String,
    pub consolidation_interval: Duration,
    pub consolidation_window_hours: i64,
    pub lock_timeout: Duration,
    pub max_retries: u32,
    pub batch_size: usize,
    pub concurrency: usize,
    pub retention_days: i64,
    pub verbose: bool,
    pub analytics: bool,
}

impl EventualConsistencyConfig {
    pub fn new(resource: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field: field.into(),
            consolidation_interval: Duration::from_secs(30),
            consolidation_window_hours: 24,
            lock_timeout: Duration::from_secs(300),
            max_retries: 3,
            batch_size: 100,
            concurrency: 10,
            retention_days: 30,
            verbose: true,
            analytics: false,
        }
    }

    pub fn transactions_resource(&self) -> String {
        format!("{}_transactions_{}", self.resource, self.field)
    }

    pub fn analytics_resource(&self) -> String {
        format!("{}_analytics_{}", self.resource, self.field)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationMetrics {
    pub rounds: u64,
    pub records_consolidated: u64,
    pub transactions_applied: u64,
    pub lock_acquisitions: u64,
    pub lock_skips: u64,
    pub lock_timeouts: u64,
    pub failures: u64,
}

/// Outcome of one consolidation round.
#[derive(Debug, Clone, Default)]
pub struct RoundSummary {
    pub records: usize,
    pub transactions: usize,
    pub skipped_locked: usize,
}

/// Deterministic fold order: `createdAt` then transaction id. ISO-8601
/// timestamps sort lexicographically, so the composite key does too.
pub fn transaction_sort_key(tx: &Document) -> String {
    let created = tx
        .get("createdAt")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let id = tx.get("id").and_then(Value::as_str).unwrap_or_default();
    format!("{created}#{id}")
}

fn cohort_hour(when: DateTime<Utc>) -> String {
    when.format("%Y-%m-%d-%H").to_string()
}

fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9e15 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub struct EventualConsistencyPlugin {
    configs: Vec<Arc<EventualConsistencyConfig>>,
    coordinator: Option<Arc<GlobalCoordinator>>,
    db: tokio::sync::RwLock<Option<Database>>,
    metrics: RwLock<ConsolidationMetrics>,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<EventualConsistencyPlugin>,
}

impl EventualConsistencyPlugin {
    pub fn new(configs: Vec<EventualConsistencyConfig>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            configs: configs.into_iter().map(Arc::new).collect(),
            coordinator: None,
            db: tokio::sync::RwLock::new(None),
            metrics: RwLock::new(ConsolidationMetrics::default()),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            self_ref: weak.clone(),
        })
    }

    /// Gate consolidation on coordinator leadership.
    pub fn with_coordinator(
        configs: Vec<EventualConsistencyConfig>,
        coordinator: Arc<GlobalCoordinator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            configs: configs.into_iter().map(Arc::new).collect(),
            coordinator: Some(coordinator),
            db: tokio::sync::RwLock::new(None),
            metrics: RwLock::new(ConsolidationMetrics::default()),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            self_ref: weak.clone(),
        })
    }

    pub fn metrics(&self) -> ConsolidationMetrics {
        self.metrics.read().unwrap().clone()
    }

    /// The shared-config guard: a blank resource/field here means a
    /// misconfigured or corrupted config object and must never proceed.
    fn guard(config: &EventualConsistencyConfig) -> Result<(), S3dbError> {
        if config.resource.is_empty() || config.field.is_empty() {
            return Err(S3dbError::Config {
                message: "eventual-consistency config has an empty resource or field".to_string(),
            });
        }
        Ok(())
    }

    fn config_for(
        &self,
        resource: &str,
        field: &str,
    ) -> Result<Arc<EventualConsistencyConfig>, S3dbError> {
        self.configs
            .iter()
            .find(|c| c.resource == resource && c.field == field)
            .cloned()
            .ok_or_else(|| S3dbError::Config {
                message: format!("no eventual-consistency config for {resource}.{field}"),
            })
    }

    async fn database(&self) -> Result<Database, S3dbError> {
        self.db
            .read()
            .await
            .clone()
            .ok_or_else(|| S3dbError::Config {
                message: "eventual-consistency plugin is not installed".to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Writer path
    // ------------------------------------------------------------------

    async fn record_transaction(
        &self,
        resource: &str,
        field: &str,
        id: &str,
        value: f64,
        operation: &str,
    ) -> Result<Document, S3dbError> {
        let config = self.config_for(resource, field)?;
        Self::guard(&config)?;
        let db = self.database().await?;
        let transactions = db.resource(&config.transactions_resource())?;

        let mut tx = Document::new();
        tx.insert("originalId".to_string(), Value::String(id.to_string()));
        tx.insert("field".to_string(), Value::String(field.to_string()));
        tx.insert("value".to_string(), number_value(value));
        tx.insert("operation".to_string(), Value::String(operation.to_string()));
        tx.insert("cohortHour".to_string(), Value::String(cohort_hour(Utc::now())));
        tx.insert("applied".to_string(), Value::Bool(false));
        transactions.insert(tx).await
    }

    /// Append `field += amount` for the record. Durable once it returns;
    /// writers never block on each other.
    pub async fn add(
        &self,
        resource: &str,
        field: &str,
        id: &str,
        amount: f64,
    ) -> Result<Document, S3dbError> {
        self.record_transaction(resource, field, id, amount, "add").await
    }

    /// Append `field -= amount`.
    pub async fn sub(
        &self,
        resource: &str,
        field: &str,
        id: &str,
        amount: f64,
    ) -> Result<Document, S3dbError> {
        self.record_transaction(resource, field, id, amount, "sub").await
    }

    /// Append `field = value`.
    pub async fn set(
        &self,
        resource: &str,
        field: &str,
        id: &str,
        value: f64,
    ) -> Result<Document, S3dbError> {
        self.record_transaction(resource, field, id, value, "set").await
    }

    // ------------------------------------------------------------------
    // Consolidation
    // ------------------------------------------------------------------

    /// Run one consolidation round for a pair now, regardless of the
    /// interval. The leadership gate still applies.
    pub async fn consolidate_now(
        &self,
        resource: &str,
        field: &str,
    ) -> Result<RoundSummary, S3dbError> {
        let config = self.config_for(resource, field)?;
        self.consolidate_round(&config).await
    }

    async fn consolidate_round(
        &self,
        config: &EventualConsistencyConfig,
    ) -> Result<RoundSummary, S3dbError> {
        Self::guard(config)?;
        if let Some(coordinator) = &self.coordinator {
            if !coordinator.is_leader() {
                debug!(
                    resource = %config.resource,
                    field = %config.field,
                    "not the leader, skipping consolidation round"
                );
                return Ok(RoundSummary::default());
            }
        }

        let db = self.database().await?;
        db.events().emit(
            "consolidation.started",
            json!({"resource": config.resource, "field": config.field}),
        );
        self.metrics.write().unwrap().rounds += 1;

        let pending = self.pending_by_record(config, &db).await?;
        let candidates: Vec<(String, Vec<Document>)> =
            pending.into_iter().take(config.batch_size).collect();

        let mut summary = RoundSummary::default();
        let results: Vec<Result<Option<usize>, (String, S3dbError)>> = stream::iter(
            candidates
                .into_iter()
                .map(|(id, txs)| self.consolidate_record_with_retries(config, &db, id, txs)),
        )
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;

        for result in results {
            match result {
                Ok(Some(applied)) => {
                    summary.records += 1;
                    summary.transactions += applied;
                }
                Ok(None) => summary.skipped_locked += 1,
                Err((id, e)) => {
                    self.metrics.write().unwrap().failures += 1;
                    warn!(
                        resource = %config.resource,
                        field = %config.field,
                        %id,
                        error = %e,
                        "record consolidation failed"
                    );
                    db.events().emit(
                        "consolidation.failed",
                        json!({
                            "resource": config.resource,
                            "field": config.field,
                            "id": id,
                            "code": e.code(),
                            "message": e.to_string(),
                        }),
                    );
                }
            }
        }

        self.gc_applied(config, &db).await;

        if config.verbose {
            info!(
                resource = %config.resource,
                field = %config.field,
                records = summary.records,
                transactions = summary.transactions,
                skipped = summary.skipped_locked,
                "consolidation round finished"
            );
        }
        db.events().emit(
            "consolidation.completed",
            json!({
                "resource": config.resource,
                "field": config.field,
                "records": summary.records,
                "transactions": summary.transactions,
            }),
        );
        Ok(summary)
    }

    /// Unapplied transactions in the window, grouped by owning record.
    async fn pending_by_record(
        &self,
        config: &EventualConsistencyConfig,
        db: &Database,
    ) -> Result<BTreeMap<String, Vec<Document>>, S3dbError> {
        let transactions = db.resource(&config.transactions_resource())?;
        let now = Utc::now();
        let mut grouped: BTreeMap<String, Vec<Document>> = BTreeMap::new();

        for hours_back in 0..=config.consolidation_window_hours {
            let cohort = cohort_hour(now - chrono::Duration::hours(hours_back));
            let mut values = Document::new();
            values.insert("cohortHour".to_string(), Value::String(cohort));
            let scope = ListOptions {
                partition: Some("byCohort".to_string()),
                partition_values: Some(values),
                ..Default::default()
            };
            for tx in transactions.list(&scope).await? {
                if tx.get("applied") == Some(&Value::Bool(true)) {
                    continue;
                }
                let Some(original_id) = tx.get("originalId").and_then(Value::as_str) else {
                    continue;
                };
                grouped.entry(original_id.to_string()).or_default().push(tx);
            }
        }
        Ok(grouped)
    }

    async fn consolidate_record_with_retries(
        &self,
        config: &EventualConsistencyConfig,
        db: &Database,
        id: String,
        txs: Vec<Document>,
    ) -> Result<Option<usize>, (String, S3dbError)> {
        let mut attempt = 0;
        loop {
            match self.consolidate_record(config, db, &id, &txs).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < config.max_retries => {
                    let delay = Duration::from_secs(1 << attempt.min(4))
                        .min(config.consolidation_interval);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((id, e)),
            }
        }
    }

    fn lock_key(&self, db: &Database, config: &EventualConsistencyConfig, id: &str) -> String {
        db.config().full_key(&format!(
            "locks/{}.{}.{}",
            config.resource, config.field, id
        ))
    }

    /// Acquire the per-record lock, reclaiming orphans past the TTL.
    async fn acquire_lock(
        &self,
        db: &Database,
        config: &EventualConsistencyConfig,
        key: &str,
    ) -> Result<bool, S3dbError> {
        let body = || {
            Bytes::from(
                serde_json::to_vec(&json!({"acquiredAt": Utc::now().to_rfc3339()}))
                    .unwrap_or_default(),
            )
        };
        if db
            .client()
            .put_if_absent(key, body(), Default::default())
            .await?
            .is_some()
        {
            self.metrics.write().unwrap().lock_acquisitions += 1;
            return Ok(true);
        }

        // held: a crashed consolidator leaves the lock behind, reclaim it
        // once it is older than the TTL
        let age_exceeded = match db.client().get(key).await {
            Ok(data) => serde_json::from_slice::<Value>(&data.body)
                .ok()
                .and_then(|v| {
                    v.get("acquiredAt")
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                })
                .map(|acquired| {
                    Utc::now().signed_duration_since(acquired.with_timezone(&Utc))
                        > chrono::Duration::from_std(config.lock_timeout).unwrap_or_default()
                })
                .unwrap_or(true),
            Err(e) if e.is_missing() => true,
            Err(e) => return Err(e),
        };

        if age_exceeded {
            warn!(key, "reclaiming orphaned consolidation lock");
            self.metrics.write().unwrap().lock_timeouts += 1;
            db.client().delete(key).await?;
            if db
                .client()
                .put_if_absent(key, body(), Default::default())
                .await?
                .is_some()
            {
                self.metrics.write().unwrap().lock_acquisitions += 1;
                return Ok(true);
            }
        }
        self.metrics.write().unwrap().lock_skips += 1;
        Ok(false)
    }

    /// Consolidate one record. `Ok(None)` means the lock was busy and the
    /// record was skipped for this round.
    async fn consolidate_record(
        &self,
        config: &EventualConsistencyConfig,
        db: &Database,
        id: &str,
        txs: &[Document],
    ) -> Result<Option<usize>, S3dbError> {
        Self::guard(config)?;
        let lock_key = self.lock_key(db, config, id);
        if !self.acquire_lock(db, config, &lock_key).await? {
            return Ok(None);
        }

        let result = self.fold_and_upsert(config, db, id, txs).await;
        // the lock is released on both paths; an error leaves the
        // transactions unapplied for the next round
        let _ = db.client().delete(&lock_key).await;

        match result {
            Ok(applied) => {
                let mut metrics = self.metrics.write().unwrap();
                metrics.records_consolidated += 1;
                metrics.transactions_applied += applied as u64;
                Ok(Some(applied))
            }
            Err(e) => Err(e),
        }
    }

    async fn fold_and_upsert(
        &self,
        config: &EventualConsistencyConfig,
        db: &Database,
        id: &str,
        txs: &[Document],
    ) -> Result<usize, S3dbError> {
        let owner_resource = db.resource(&config.resource)?;
        let transactions = db.resource(&config.transactions_resource())?;

        let mut pending: Vec<&Document> = txs.iter().collect();
        pending.sort_by_key(|tx| transaction_sort_key(tx));

        let owner = match owner_resource.get(id).await {
            Ok(document) => Some(document),
            Err(e) if e.is_missing() => None,
            Err(e) => return Err(e),
        };
        let fence = owner
            .as_ref()
            .and_then(|o| o.get("pendingVersion"))
            .and_then(|pv| pv.get(&config.field))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();

        // transactions at or below the fence were folded by a run that
        // crashed before marking them applied
        let to_fold: Vec<&&Document> = pending
            .iter()
            .filter(|tx| transaction_sort_key(tx) > fence)
            .collect();

        if !to_fold.is_empty() {
            let mut aggregate = owner
                .as_ref()
                .and_then(|o| o.get(&config.field))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            for tx in &to_fold {
                let value = tx.get("value").and_then(Value::as_f64).unwrap_or(0.0);
                match tx.get("operation").and_then(Value::as_str) {
                    Some("add") => aggregate += value,
                    Some("sub") => aggregate -= value,
                    Some("set") => aggregate = value,
                    other => {
                        warn!(operation = ?other, "unknown transaction operation, skipping");
                    }
                }
            }

            let new_fence = transaction_sort_key(to_fold.last().unwrap());
            let mut pending_version = owner
                .as_ref()
                .and_then(|o| o.get("pendingVersion"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_else(Map::new);
            pending_version.insert(config.field.clone(), Value::String(new_fence));

            let mut patch = Document::new();
            patch.insert(config.field.clone(), number_value(aggregate));
            patch.insert("pendingVersion".to_string(), Value::Object(pending_version));

            if owner.is_some() {
                match owner_resource.update(id, patch.clone()).await {
                    Ok(_) => {}
                    // deleted between our read and the write: fall through
                    // to insert, deltas are never silently lost
                    Err(e) if e.is_missing() => {
                        patch.insert("id".to_string(), Value::String(id.to_string()));
                        owner_resource.insert(patch).await?;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                patch.insert("id".to_string(), Value::String(id.to_string()));
                owner_resource.insert(patch).await?;
            }
        }

        // phase two: mark every pending transaction applied, including the
        // fence-skipped ones that are already in the owner value
        let mut applied = 0;
        for tx in &pending {
            let Some(tx_id) = tx.get("id").and_then(Value::as_str) else {
                continue;
            };
            let mut patch = Document::new();
            patch.insert("applied".to_string(), Value::Bool(true));
            transactions.patch(tx_id, patch).await?;
            applied += 1;
        }

        if config.analytics {
            self.roll_up(config, db, &pending).await;
        }
        Ok(applied)
    }

    /// Periodic roll-ups (hour/day/month counts and sums) for dashboards.
    /// Best-effort: failures are logged, never fatal to consolidation.
    async fn roll_up(
        &self,
        config: &EventualConsistencyConfig,
        db: &Database,
        txs: &[&Document],
    ) {
        let Ok(analytics) = db.resource(&config.analytics_resource()) else {
            return;
        };
        let mut buckets: BTreeMap<(String, String), (i64, f64)> = BTreeMap::new();
        for tx in txs {
            let Some(cohort) = tx.get("cohortHour").and_then(Value::as_str) else {
                continue;
            };
            let value = tx.get("value").and_then(Value::as_f64).unwrap_or(0.0);
            for (period, len) in [("hour", 13), ("day", 10), ("month", 7)] {
                let key = (
                    period.to_string(),
                    cohort.chars().take(len).collect::<String>(),
                );
                let entry = buckets.entry(key).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += value;
            }
        }

        for ((period, cohort), (count, sum)) in buckets {
            let id = format!("{period}-{cohort}");
            let existing = analytics.get(&id).await;
            let result = match existing {
                Ok(current) => {
                    let count = current.get("count").and_then(Value::as_i64).unwrap_or(0) + count;
                    let sum = current.get("sum").and_then(Value::as_f64).unwrap_or(0.0) + sum;
                    let mut patch = Document::new();
                    patch.insert("count".to_string(), Value::Number(count.into()));
                    patch.insert("sum".to_string(), number_value(sum));
                    analytics.update(&id, patch).await
                }
                Err(e) if e.is_missing() => {
                    let mut record = Document::new();
                    record.insert("id".to_string(), Value::String(id.clone()));
                    record.insert("period".to_string(), Value::String(period));
                    record.insert("cohort".to_string(), Value::String(cohort));
                    record.insert("count".to_string(), Value::Number(count.into()));
                    record.insert("sum".to_string(), number_value(sum));
                    analytics.insert(record).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(%id, error = %e, "analytics roll-up failed");
            }
        }
    }

    /// Delete applied transactions whose cohort is past the retention
    /// window.
    async fn gc_applied(&self, config: &EventualConsistencyConfig, db: &Database) {
        let Ok(transactions) = db.resource(&config.transactions_resource()) else {
            return;
        };
        let cutoff = cohort_hour(Utc::now() - chrono::Duration::days(config.retention_days));
        let all = match transactions.list(&ListOptions::default()).await {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "transaction GC listing failed");
                return;
            }
        };
        for tx in all {
            let applied = tx.get("applied") == Some(&Value::Bool(true));
            let old = tx
                .get("cohortHour")
                .and_then(Value::as_str)
                .map(|c| c < cutoff.as_str())
                .unwrap_or(false);
            if applied && old {
                if let Some(id) = tx.get("id").and_then(Value::as_str) {
                    let _ = transactions.delete(id).await;
                }
            }
        }
    }

    async fn ensure_resources(&self, db: &Database) -> Result<(), S3dbError> {
        for config in &self.configs {
            Self::guard(config)?;
            // the owning resource must exist before deltas can target it
            db.resource(&config.resource)?;

            let mut attributes = Map::new();
            attributes.insert("applied".to_string(), json!("boolean|default:false"));
            attributes.insert("cohortHour".to_string(), json!("string|required"));
            attributes.insert("field".to_string(), json!("string|required"));
            attributes.insert(
                "operation".to_string(),
                json!("string|required|enum:add,sub,set"),
            );
            attributes.insert("originalId".to_string(), json!("string|required"));
            attributes.insert("value".to_string(), json!("number|required"));

            let options = ResourceOptions::new(config.transactions_resource(), attributes)
                .with_timestamps()
                .with_partition(PartitionDefinition::new(
                    "byCohort",
                    &[("cohortHour", "string")],
                ));
            db.create_resource(options).await?;

            if config.analytics {
                let mut attributes = Map::new();
                attributes.insert("cohort".to_string(), json!("string|required"));
                attributes.insert("count".to_string(), json!("number|default:0"));
                attributes.insert(
                    "period".to_string(),
                    json!("string|required|enum:hour,day,month"),
                );
                attributes.insert("sum".to_string(), json!("number|default:0"));
                let options = ResourceOptions::new(config.analytics_resource(), attributes)
                    .with_timestamps()
                    .with_partition(PartitionDefinition::new("byPeriod", &[("period", "string")]));
                db.create_resource(options).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for EventualConsistencyPlugin {
    fn name(&self) -> &str {
        "eventual-consistency"
    }

    async fn install(&self, db: &Database) -> Result<(), S3dbError> {
        self.ensure_resources(db).await?;
        *self.db.write().await = Some(db.clone());
        Ok(())
    }

    async fn start(&self, _db: &Database) -> Result<(), S3dbError> {
        let mut tasks = self.tasks.lock().await;
        for config in &self.configs {
            let plugin = self.self_ref.upgrade().ok_or_else(|| S3dbError::Config {
                message: "eventual-consistency plugin dropped before start".to_string(),
            })?;
            let config = Arc::clone(config);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.consolidation_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = plugin.consolidate_round(&config).await {
                                warn!(
                                    resource = %config.resource,
                                    field = %config.field,
                                    error = %e,
                                    "consolidation round failed"
                                );
                            }
                        }
                        _ = plugin.shutdown.notified() => break,
                    }
                }
            });
            tasks.push(handle);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), S3dbError> {
        self.shutdown.notify_waiters();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Behavior;

    async fn setup() -> (Database, Arc<EventualConsistencyPlugin>) {
        let db = Database::connect("memory://ec-bucket/app").await.unwrap();
        let mut attributes = Map::new();
        attributes.insert("clicks".to_string(), json!("number|default:0"));
        attributes.insert("url".to_string(), json!("string"));
        db.create_resource(
            ResourceOptions::new("urls", attributes).with_behavior(Behavior::UserManaged),
        )
        .await
        .unwrap();

        let mut config = EventualConsistencyConfig::new("urls", "clicks");
        config.consolidation_interval = Duration::from_millis(50);
        config.analytics = true;
        let plugin = EventualConsistencyPlugin::new(vec![config]);
        plugin.install(&db).await.unwrap();
        (db, plugin)
    }

    #[tokio::test]
    async fn install_creates_sibling_resources() {
        let (db, _plugin) = setup().await;
        assert!(db.resource("urls_transactions_clicks").is_ok());
        assert!(db.resource("urls_analytics_clicks").is_ok());
    }

    #[tokio::test]
    async fn writer_path_appends_unapplied_transactions() {
        let (db, plugin) = setup().await;
        plugin.add("urls", "clicks", "abc", 1.0).await.unwrap();
        plugin.add("urls", "clicks", "abc", 2.0).await.unwrap();

        let transactions = db.resource("urls_transactions_clicks").unwrap();
        let all = transactions.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|t| t.get("applied") == Some(&json!(false))));
        assert!(all.iter().all(|t| t.get("originalId") == Some(&json!("abc"))));
    }

    #[tokio::test]
    async fn consolidation_upserts_missing_owner() {
        let (db, plugin) = setup().await;
        // deltas arrive before the owner record exists
        for _ in 0..3 {
            plugin.add("urls", "clicks", "abc", 1.0).await.unwrap();
        }

        let summary = plugin.consolidate_now("urls", "clicks").await.unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.transactions, 3);

        let urls = db.resource("urls").unwrap();
        let owner = urls.get("abc").await.unwrap();
        assert_eq!(owner.get("clicks"), Some(&json!(3)));

        let transactions = db.resource("urls_transactions_clicks").unwrap();
        let all = transactions.get_all().await.unwrap();
        assert!(all.iter().all(|t| t.get("applied") == Some(&json!(true))));
    }

    #[tokio::test]
    async fn add_sub_set_fold_in_order() {
        let (db, plugin) = setup().await;
        // fold order ties break on transaction id, so keep the
        // timestamps distinct at millisecond resolution
        plugin.set("urls", "clicks", "u", 10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        plugin.add("urls", "clicks", "u", 5.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        plugin.sub("urls", "clicks", "u", 3.0).await.unwrap();

        plugin.consolidate_now("urls", "clicks").await.unwrap();
        let owner = db.resource("urls").unwrap().get("u").await.unwrap();
        assert_eq!(owner.get("clicks"), Some(&json!(12)));
    }

    #[tokio::test]
    async fn consolidation_is_incremental_across_rounds() {
        let (db, plugin) = setup().await;
        plugin.add("urls", "clicks", "u", 1.0).await.unwrap();
        plugin.consolidate_now("urls", "clicks").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        plugin.add("urls", "clicks", "u", 1.0).await.unwrap();
        let summary = plugin.consolidate_now("urls", "clicks").await.unwrap();
        assert_eq!(summary.transactions, 1);

        let owner = db.resource("urls").unwrap().get("u").await.unwrap();
        assert_eq!(owner.get("clicks"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn fence_prevents_double_fold_after_crash() {
        let (db, plugin) = setup().await;
        for _ in 0..5 {
            plugin.add("urls", "clicks", "u", 2.0).await.unwrap();
        }

        // simulate a consolidator that crashed after the owner upsert but
        // before marking transactions applied: the owner already carries
        // the aggregate and the fence of the last folded transaction
        let transactions = db.resource("urls_transactions_clicks").unwrap();
        let mut pending = transactions.get_all().await.unwrap();
        pending.sort_by_key(transaction_sort_key);
        let fence = transaction_sort_key(pending.last().unwrap());

        let urls = db.resource("urls").unwrap();
        let mut owner = Document::new();
        owner.insert("id".to_string(), json!("u"));
        owner.insert("clicks".to_string(), json!(10));
        owner.insert("pendingVersion".to_string(), json!({"clicks": fence}));
        urls.insert(owner).await.unwrap();

        // recovery: all five are still unapplied, but every one is at or
        // below the fence, so nothing is re-added
        let summary = plugin.consolidate_now("urls", "clicks").await.unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.transactions, 5);

        let owner = urls.get("u").await.unwrap();
        assert_eq!(owner.get("clicks"), Some(&json!(10)));
        let all = transactions.get_all().await.unwrap();
        assert!(all.iter().all(|t| t.get("applied") == Some(&json!(true))));
    }

    #[tokio::test]
    async fn busy_lock_skips_record_without_error() {
        let (db, plugin) = setup().await;
        plugin.add("urls", "clicks", "u", 1.0).await.unwrap();

        // someone else holds the per-record lock
        db.client()
            .put_if_absent(
                "app/locks/urls.clicks.u",
                Bytes::from(
                    serde_json::to_vec(&json!({"acquiredAt": Utc::now().to_rfc3339()})).unwrap(),
                ),
                Default::default(),
            )
            .await
            .unwrap();

        let summary = plugin.consolidate_now("urls", "clicks").await.unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.skipped_locked, 1);
        assert_eq!(plugin.metrics().lock_skips, 1);

        // the delta is still pending for the next round
        let urls = db.resource("urls").unwrap();
        assert!(urls.get("u").await.is_err());
    }

    #[tokio::test]
    async fn orphaned_lock_is_reclaimed() {
        let (db, plugin) = setup().await;
        plugin.add("urls", "clicks", "u", 1.0).await.unwrap();

        // a lock left behind by a crashed consolidator, older than the TTL
        let stale = Utc::now() - chrono::Duration::seconds(400);
        db.client()
            .put_if_absent(
                "app/locks/urls.clicks.u",
                Bytes::from(
                    serde_json::to_vec(&json!({"acquiredAt": stale.to_rfc3339()})).unwrap(),
                ),
                Default::default(),
            )
            .await
            .unwrap();

        let summary = plugin.consolidate_now("urls", "clicks").await.unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(plugin.metrics().lock_timeouts, 1);
        let owner = db.resource("urls").unwrap().get("u").await.unwrap();
        assert_eq!(owner.get("clicks"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn analytics_roll_ups_accumulate() {
        let (db, plugin) = setup().await;
        plugin.add("urls", "clicks", "u", 2.0).await.unwrap();
        plugin.add("urls", "clicks", "u", 3.0).await.unwrap();
        plugin.consolidate_now("urls", "clicks").await.unwrap();

        let analytics = db.resource("urls_analytics_clicks").unwrap();
        let month_id = format!("month-{}", cohort_hour(Utc::now()).chars().take(7).collect::<String>());
        let month = analytics.get(&month_id).await.unwrap();
        assert_eq!(month.get("count"), Some(&json!(2)));
        assert_eq!(month.get("sum"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn unknown_pair_is_config_error() {
        let (_db, plugin) = setup().await;
        let err = plugin.add("urls", "views", "u", 1.0).await.unwrap_err();
        assert_eq!(err.code(), "ConfigError");
    }

    #[tokio::test]
    async fn blank_field_is_rejected_at_entry() {
        let config = EventualConsistencyConfig::new("urls", "");
        assert!(EventualConsistencyPlugin::guard(&config).is_err());
    }
}
