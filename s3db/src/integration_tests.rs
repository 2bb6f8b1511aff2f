//! End-to-end scenarios over `memory://` connections
//!
//! These drive the full stack (database root, resource runtime, metadata
//! codec, partition index, plugins) the way an application would.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use s3db_types::Document;

use crate::behavior::Behavior;
use crate::database::{Database, ResourceOptions};
use crate::partition::PartitionDefinition;
use crate::plugins::coordinator::{CoordinatorConfig, GlobalCoordinator};
use crate::plugins::eventual_consistency::{
    EventualConsistencyConfig, EventualConsistencyPlugin,
};
use crate::plugins::Plugin;
use crate::resource::ListOptions;

fn attrs(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

fn doc(value: Value) -> Document {
    value.as_object().unwrap().clone()
}

#[tokio::test]
async fn metadata_packing_budget() {
    let db = Database::connect("memory://it-bucket/app").await.unwrap();
    let users = db
        .create_resource(
            ResourceOptions::new(
                "users",
                attrs(json!({"age": "number", "email": "string", "name": "string"})),
            )
            .with_behavior(Behavior::EnforceLimits),
        )
        .await
        .unwrap();

    let record = users
        .insert(doc(json!({"name": "Ada", "email": "ada@ex.com", "age": 36})))
        .await
        .unwrap();
    let id = record.get("id").unwrap().as_str().unwrap();

    // one head resolves the whole record: the three attributes live in
    // short-key metadata headers, the body stays empty
    let key = format!("app/resource=users/id={id}");
    let head = db.client().head(&key).await.unwrap();
    for short_key in ["0", "1", "2"] {
        assert!(head.metadata.contains_key(short_key), "missing {short_key}");
    }
    assert_eq!(head.content_length, 0);

    let fetched = users.get(id).await.unwrap();
    assert_eq!(fetched.get("name"), Some(&json!("Ada")));
    assert_eq!(fetched.get("email"), Some(&json!("ada@ex.com")));
    assert_eq!(fetched.get("age"), Some(&json!(36)));

    // undeclared attributes are a validation error, not a silent drop
    let err = users
        .insert(doc(json!({"name": "A", "bio": "x".repeat(4000)})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ValidationError");
}

#[tokio::test]
async fn body_overflow_round_trip() {
    let db = Database::connect("memory://it-bucket/app").await.unwrap();
    let docs = db
        .create_resource(
            ResourceOptions::new(
                "docs",
                attrs(json!({"body": "string", "title": "string"})),
            )
            .with_behavior(Behavior::BodyOverflow),
        )
        .await
        .unwrap();

    let body = "X".repeat(5000);
    let record = docs
        .insert(doc(json!({"title": "T", "body": body})))
        .await
        .unwrap();
    let id = record.get("id").unwrap().as_str().unwrap();

    let key = format!("app/resource=docs/id={id}");
    let head = db.client().head(&key).await.unwrap();
    assert_eq!(head.metadata.get("_of").map(String::as_str), Some("1"));
    assert!(head.content_length > 0);

    let fetched = docs.get(id).await.unwrap();
    assert_eq!(fetched.get("title"), Some(&json!("T")));
    assert_eq!(fetched.get("body"), Some(&json!("X".repeat(5000))));
}

#[tokio::test]
async fn partition_maintenance_on_update() {
    let db = Database::connect("memory://it-bucket/app").await.unwrap();
    let orders = db
        .create_resource(
            ResourceOptions::new("orders", attrs(json!({"status": "string|required"})))
                .with_partition(PartitionDefinition::new("byStatus", &[("status", "string")])),
        )
        .await
        .unwrap();

    orders
        .insert(doc(json!({"id": "o1", "status": "pending"})))
        .await
        .unwrap();

    let by_status = |status: &str| ListOptions {
        partition: Some("byStatus".to_string()),
        partition_values: Some(doc(json!({"status": status}))),
        ..Default::default()
    };
    assert_eq!(orders.count(&by_status("pending")).await.unwrap(), 1);

    orders
        .update("o1", doc(json!({"status": "shipped"})))
        .await
        .unwrap();
    assert_eq!(orders.count(&by_status("pending")).await.unwrap(), 0);
    assert_eq!(orders.count(&by_status("shipped")).await.unwrap(), 1);

    let pending = orders.list(&by_status("pending")).await.unwrap();
    assert!(pending.is_empty());
    let shipped = orders.list(&by_status("shipped")).await.unwrap();
    assert_eq!(shipped[0].get("id"), Some(&json!("o1")));
}

#[tokio::test]
async fn eventual_consistency_upsert_under_race() {
    let db = Database::connect("memory://it-bucket/app").await.unwrap();
    db.create_resource(ResourceOptions::new(
        "urls",
        attrs(json!({"clicks": "number|default:0", "url": "string"})),
    ))
    .await
    .unwrap();

    let mut config = EventualConsistencyConfig::new("urls", "clicks");
    config.consolidation_interval = Duration::from_millis(50);
    let plugin = EventualConsistencyPlugin::new(vec![config]);
    plugin.install(&db).await.unwrap();

    // three concurrent clicks land before any insert of the owning record
    let (a, b, c) = tokio::join!(
        plugin.add("urls", "clicks", "abc", 1.0),
        plugin.add("urls", "clicks", "abc", 1.0),
        plugin.add("urls", "clicks", "abc", 1.0),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    plugin.consolidate_now("urls", "clicks").await.unwrap();

    let urls = db.resource("urls").unwrap();
    let owner = urls.get("abc").await.unwrap();
    assert_eq!(owner.get("clicks"), Some(&json!(3)));

    let transactions = db.resource("urls_transactions_clicks").unwrap();
    let all = transactions.get_all().await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|t| t.get("applied") == Some(&json!(true))));
}

#[tokio::test]
async fn leader_election_with_three_workers() {
    let db = Database::connect("memory://it-bucket/app").await.unwrap();

    let worker = |_n: &str| {
        GlobalCoordinator::new(CoordinatorConfig {
            namespace: "ns".to_string(),
            heartbeat_interval: Duration::from_millis(10),
            lease_timeout: Duration::from_millis(200),
            worker_timeout: Duration::from_millis(400),
        })
    };
    let workers = [worker("a"), worker("b"), worker("c")];
    for w in &workers {
        w.bind(&db).await;
    }

    // a few full cycles: exactly one leader emerges
    for _ in 0..3 {
        for w in &workers {
            w.tick().await.unwrap();
        }
    }
    let leaders: Vec<_> = workers.iter().filter(|w| w.is_leader()).collect();
    assert_eq!(leaders.len(), 1);

    // kill the leader: its heartbeat stops and the lease expires
    let survivors: Vec<_> = workers.iter().filter(|w| !w.is_leader()).collect();
    tokio::time::sleep(Duration::from_millis(450)).await;
    for _ in 0..2 {
        for w in &survivors {
            w.tick().await.unwrap();
        }
    }
    let new_leaders: Vec<_> = survivors.iter().filter(|w| w.is_leader()).collect();
    assert_eq!(new_leaders.len(), 1);

    // the state object carries the bumped epoch
    let state = db
        .client()
        .get("app/plg_coordinator_global/ns/state.json")
        .await
        .unwrap();
    let parsed: Value = serde_json::from_slice(&state.body).unwrap();
    assert_eq!(parsed["epoch"], json!(2));
    assert_eq!(
        parsed["leader"],
        json!(new_leaders[0].worker_id())
    );
}

#[tokio::test]
async fn leader_gated_consolidation() {
    let db = Database::connect("memory://it-bucket/app").await.unwrap();
    db.create_resource(ResourceOptions::new(
        "urls",
        attrs(json!({"clicks": "number|default:0"})),
    ))
    .await
    .unwrap();

    let coordinator = GlobalCoordinator::new(CoordinatorConfig {
        namespace: "ns".to_string(),
        heartbeat_interval: Duration::from_millis(10),
        lease_timeout: Duration::from_millis(200),
        worker_timeout: Duration::from_millis(400),
    });
    coordinator.bind(&db).await;

    let mut config = EventualConsistencyConfig::new("urls", "clicks");
    config.consolidation_interval = Duration::from_millis(50);
    let plugin = EventualConsistencyPlugin::with_coordinator(vec![config], Arc::clone(&coordinator));
    plugin.install(&db).await.unwrap();

    plugin.add("urls", "clicks", "u", 1.0).await.unwrap();

    // not the leader yet: the round is a no-op
    let summary = plugin.consolidate_now("urls", "clicks").await.unwrap();
    assert_eq!(summary.records, 0);
    assert!(db.resource("urls").unwrap().get("u").await.is_err());

    // once elected, the same round applies the delta
    coordinator.tick().await.unwrap();
    assert!(coordinator.is_leader());
    let summary = plugin.consolidate_now("urls", "clicks").await.unwrap();
    assert_eq!(summary.records, 1);
    let owner = db.resource("urls").unwrap().get("u").await.unwrap();
    assert_eq!(owner.get("clicks"), Some(&json!(1)));
}

#[tokio::test]
async fn database_lifecycle_with_plugins() {
    let db = Database::connect("memory://it-bucket/app").await.unwrap();
    db.create_resource(ResourceOptions::new(
        "urls",
        attrs(json!({"clicks": "number|default:0"})),
    ))
    .await
    .unwrap();

    let coordinator = GlobalCoordinator::new(CoordinatorConfig {
        namespace: "ns".to_string(),
        heartbeat_interval: Duration::from_millis(10),
        lease_timeout: Duration::from_millis(100),
        worker_timeout: Duration::from_millis(200),
    });
    db.install_plugin(coordinator.clone()).await.unwrap();

    let mut config = EventualConsistencyConfig::new("urls", "clicks");
    config.consolidation_interval = Duration::from_millis(20);
    let plugin = EventualConsistencyPlugin::with_coordinator(vec![config], Arc::clone(&coordinator));
    db.install_plugin(plugin.clone()).await.unwrap();

    plugin.add("urls", "clicks", "u", 2.0).await.unwrap();

    // the background loops elect a leader and consolidate on their own
    let mut applied = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(owner) = db.resource("urls").unwrap().get("u").await {
            if owner.get("clicks") == Some(&json!(2)) {
                applied = true;
                break;
            }
        }
    }
    assert!(applied, "background consolidation never applied the delta");

    db.disconnect().await.unwrap();
}

#[tokio::test]
async fn filesystem_backend_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("file://{}", dir.path().display());
    let db = Database::connect(&url).await.unwrap();
    let notes = db
        .create_resource(ResourceOptions::new(
            "notes",
            attrs(json!({"text": "string|required"})),
        ))
        .await
        .unwrap();

    let record = notes
        .insert(doc(json!({"id": "n1", "text": "hello"})))
        .await
        .unwrap();
    assert_eq!(record.get("id"), Some(&json!("n1")));

    // a fresh connection sees the resource and the record
    let db2 = Database::connect(&url).await.unwrap();
    let notes2 = db2.resource("notes").unwrap();
    let fetched = notes2.get("n1").await.unwrap();
    assert_eq!(fetched.get("text"), Some(&json!("hello")));
}
