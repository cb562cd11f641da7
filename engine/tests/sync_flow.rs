//! End-to-end sync flows against an in-memory origin.

mod common;

use chrono::{TimeZone, Utc};
use common::{engine, engine_with, eventually, names, pull, test_config};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use till_sync_engine::{
    operation::is_temporary_id, CallKind, Error, MemoryOrigin, OperationKind, Selector, Session,
    SyncIndicator,
};

fn session() -> Session {
    Session::new("u-1", "secret-token")
}

// ============================================================================
// Offline create, reconnect, id swap
// ============================================================================

#[tokio::test]
async fn offline_create_is_delivered_on_reconnect() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine(origin.clone(), false).await;
    assert!(engine.start(session()).await);

    let local = engine
        .add_to_queue("client", OperationKind::Create, json!({"name": "Ana"}))
        .await
        .unwrap()
        .unwrap();
    assert!(is_temporary_id(&local.id));
    assert_eq!(local.collection, "clients");
    assert!(local.updated_at.is_none());
    assert!(engine.get("clients", &local.id).await.unwrap().is_some());

    let status = engine.status().await.unwrap();
    assert_eq!(status.pending, 1);
    assert_eq!(status.indicator(), SyncIndicator::Offline);
    assert!(origin.calls().is_empty());

    origin.queue_id("clients", "c-101");
    origin.set_now(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    assert!(engine.set_online(true));

    eventually("the create to be acknowledged", || async {
        engine.status().await.unwrap().pending == 0
            && engine.get("clients", "c-101").await.unwrap().is_some()
    })
    .await;

    let record = engine.get("clients", "c-101").await.unwrap().unwrap();
    assert_eq!(record.payload, json!({"name": "Ana"}));
    assert_eq!(
        record.updated_at,
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    );
    assert_eq!(
        engine.get("clients", &local.id).await.unwrap(),
        Some(record.clone())
    );
    assert!(engine.store().get("clients", &local.id).await.unwrap().is_none());

    let creates = origin.calls_of(CallKind::Create);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].actor.as_deref(), Some("u-1"));
    assert_eq!(creates[0].idempotency_key.as_deref(), Some(local.id.as_str()));

    // Pulling the same state back is a no-op.
    let outcome = pull(&engine, "clients").await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.written(), 0);
    assert_eq!(engine.list("clients").await.unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn temporary_id_keeps_working_after_ack() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine(origin.clone(), true).await;
    engine.start(session()).await;

    origin.queue_id("clients", "c-7");
    let local = engine.create("clients", json!({"name": "Ana"})).await.unwrap();
    eventually("the create to be acknowledged", || async {
        engine.status().await.unwrap().pending == 0
    })
    .await;

    // Feature code still holds the id `create` returned.
    let edited = engine
        .update("clients", &local.id, json!({"name": "Bea"}))
        .await
        .unwrap();
    assert_eq!(edited.id, "c-7");
    assert_eq!(
        engine.get("clients", &local.id).await.unwrap().unwrap().payload,
        json!({"name": "Bea"})
    );

    eventually("the update to be delivered", || async {
        engine.status().await.unwrap().pending == 0
    })
    .await;
    let updates = origin.calls_of(CallKind::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id.as_deref(), Some("c-7"));

    engine.delete("clients", &local.id).await.unwrap();
    assert!(engine.get("clients", "c-7").await.unwrap().is_none());
    eventually("the delete to be delivered", || async {
        origin.get("clients", "c-7").is_none()
    })
    .await;

    engine.shutdown().await;
}

// ============================================================================
// Outbox ordering and durability
// ============================================================================

#[tokio::test]
async fn offline_mutations_reach_origin_in_order() {
    let origin = Arc::new(MemoryOrigin::new());
    origin.seed(
        "clients",
        json!({"id": "c-1", "name": "Ana", "updatedAt": "2024-01-01T00:00:00Z"}),
    );
    origin.seed(
        "clients",
        json!({"id": "c-2", "name": "Bea", "updatedAt": "2024-01-01T00:00:00Z"}),
    );
    let engine = engine(origin.clone(), true).await;
    engine.start(session()).await;
    pull(&engine, "clients").await.unwrap();
    assert_eq!(names(engine.store(), "clients").await, vec!["Ana", "Bea"]);

    engine.set_online(false);
    engine
        .update("clients", "c-1", json!({"name": "Ana Maria"}))
        .await
        .unwrap();
    engine.delete("clients", "c-2").await.unwrap();
    engine
        .create("clients", json!({"name": "Carla"}))
        .await
        .unwrap();

    // Optimistic state is visible at once.
    assert_eq!(names(engine.store(), "clients").await.len(), 2);
    assert!(engine.get("clients", "c-2").await.unwrap().is_none());
    assert_eq!(engine.status().await.unwrap().pending, 3);

    engine.set_online(true);
    eventually("the outbox to drain", || async {
        engine.status().await.unwrap().pending == 0
    })
    .await;

    let writes: Vec<_> = origin
        .calls()
        .into_iter()
        .filter(|c| c.kind != CallKind::FetchAll)
        .map(|c| (c.kind, c.id))
        .collect();
    assert_eq!(
        writes,
        vec![
            (CallKind::Update, Some("c-1".to_string())),
            (CallKind::Delete, Some("c-2".to_string())),
            (CallKind::Create, None),
        ]
    );
    assert_eq!(origin.snapshot("clients").len(), 2);
    assert!(engine
        .store()
        .get_including_deleted("clients", "c-2")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn queued_mutations_survive_restart() {
    let path = std::env::temp_dir().join(format!("till-sync-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let config = test_config().with_database_url(url);

    let origin = Arc::new(MemoryOrigin::new());
    {
        let engine = engine_with(config.clone(), origin.clone(), false).await;
        engine.create("taxes", json!({"name": "VAT", "rate": 0.21})).await.unwrap();
        engine
            .create("taxes", json!({"name": "Reduced", "rate": 0.10}))
            .await
            .unwrap();
        engine.shutdown().await;
    }

    let engine = engine_with(config, origin.clone(), true).await;
    assert_eq!(engine.status().await.unwrap().pending, 2);
    let report = engine.flush().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert!(report.is_complete());

    let names: Vec<_> = origin
        .snapshot("taxes")
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["VAT", "Reduced"]);

    engine.shutdown().await;
    drop(engine);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

#[tokio::test]
async fn failed_head_blocks_until_it_succeeds() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine(origin.clone(), true).await;

    engine.create("categories", json!({"name": "Drinks"})).await.unwrap();
    engine.create("categories", json!({"name": "Food"})).await.unwrap();

    origin.fail_next(Error::OriginRejected {
        status: 503,
        message: "maintenance".into(),
    });
    let report = engine.flush().await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 2);
    assert_eq!(origin.calls().len(), 1);

    let pending = engine.pending_entries().await.unwrap();
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[1].attempts, 0);

    let report = engine.flush().await.unwrap();
    assert_eq!(report.delivered, 2);
    let names: Vec<_> = origin
        .snapshot("categories")
        .iter()
        .map(|c| c["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Drinks", "Food"]);
}

// ============================================================================
// Parking
// ============================================================================

#[tokio::test]
async fn rejected_update_is_parked_and_discarded() {
    let origin = Arc::new(MemoryOrigin::new());
    origin.seed(
        "products",
        json!({"id": "p-1", "name": "Tea", "price": 2.0, "updatedAt": "2024-01-01T00:00:00Z"}),
    );
    let engine = engine_with(test_config().with_max_attempts(2), origin.clone(), true).await;
    pull(&engine, "products").await.unwrap();

    engine
        .update("products", "p-1", json!({"price": 0.0}))
        .await
        .unwrap();
    for _ in 0..2 {
        origin.fail_next(Error::OriginRejected {
            status: 422,
            message: "price must be positive".into(),
        });
        engine.flush().await.unwrap();
    }

    let status = engine.status().await.unwrap();
    assert_eq!(status.parked, 1);
    assert_eq!(status.pending, 0);
    assert_eq!(status.indicator(), SyncIndicator::NeedsAttention);

    let stuck = engine.stuck_entries().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].attempts, 2);

    engine.discard(stuck[0].seq).await.unwrap();
    assert!(engine.status().await.unwrap().is_settled());

    // The origin's copy comes back on the next pull.
    pull(&engine, "products").await.unwrap();
    let product = engine.get("products", "p-1").await.unwrap().unwrap();
    assert_eq!(product.payload["price"], 2.0);
}

#[tokio::test]
async fn parked_entries_can_be_retried() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine_with(test_config().with_max_attempts(1), origin.clone(), true).await;

    engine.create("clients", json!({"name": "Ana"})).await.unwrap();
    origin.fail_next(Error::OriginRejected {
        status: 409,
        message: "conflict".into(),
    });
    let report = engine.flush().await.unwrap();
    assert_eq!(report.parked, 1);

    assert_eq!(engine.retry_parked().await.unwrap(), 1);
    let report = engine.flush().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(origin.snapshot("clients").len(), 1);
}

#[tokio::test]
async fn discarding_a_create_drops_its_record_and_followers() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine(origin, false).await;

    let record = engine.create("clients", json!({"name": "Ana"})).await.unwrap();
    engine
        .update("clients", &record.id, json!({"name": "Ana B"}))
        .await
        .unwrap();
    let entries = engine.pending_entries().await.unwrap();
    assert_eq!(entries.len(), 2);

    engine.discard(entries[0].seq).await.unwrap();

    assert!(engine.pending_entries().await.unwrap().is_empty());
    assert!(engine.get("clients", &record.id).await.unwrap().is_none());
}

// ============================================================================
// Online-only user creation
// ============================================================================

#[tokio::test]
async fn user_creation_is_online_only() {
    let origin = Arc::new(MemoryOrigin::new());
    origin.mint_invites_for("users");
    let engine = engine(origin.clone(), false).await;
    engine.start(session()).await;

    let offline = engine
        .create_user(json!({"name": "Ana", "email": "ana@example.com"}))
        .await;
    assert_eq!(offline, Err(Error::OnlineOnly("users".into())));
    assert!(engine.list("users").await.unwrap().is_empty());

    engine.set_online(true);
    let user = engine
        .create_user(json!({"name": "Ana", "email": "ana@example.com"}))
        .await
        .unwrap();
    assert!(!is_temporary_id(&user.id));
    assert!(user.payload["inviteToken"].is_string());
    assert_eq!(engine.get("users", &user.id).await.unwrap(), Some(user));

    // Routed the same way through the generic entry point.
    let again = engine
        .add_to_queue(
            "user",
            OperationKind::Create,
            json!({"name": "Bea", "email": "bea@example.com"}),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(again.updated_at.is_some());
    assert_eq!(engine.status().await.unwrap().pending, 0);
    assert_eq!(origin.calls_of(CallKind::Create).len(), 2);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn start_is_idempotent() {
    let origin = Arc::new(MemoryOrigin::new());
    let config = test_config().with_reconcile_interval(Duration::from_millis(200));
    let engine = engine_with(config, origin.clone(), true).await;

    assert!(engine.start(session()).await);
    assert!(!engine.start(session()).await);
    assert_eq!(origin.session(), Some(session()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(engine.stop().await);
    assert!(!engine.stop().await);
    assert_eq!(origin.session(), None);

    let pulls = |origin: &MemoryOrigin| {
        origin
            .calls_of(CallKind::FetchAll)
            .iter()
            .filter(|c| c.collection == "clients")
            .count()
    };
    let during = pulls(&origin);
    assert!((2..=4).contains(&during), "pulled clients {during} times");

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(pulls(&origin), during);
}

#[tokio::test]
async fn stop_silences_the_connectivity_listener() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine(origin.clone(), true).await;
    engine.start(session()).await;
    eventually("the eager pull", || async {
        !origin.calls_of(CallKind::FetchAll).is_empty()
    })
    .await;
    assert!(engine.stop().await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    origin.clear_calls();

    engine.set_online(false);
    engine.create("clients", json!({"name": "Ana"})).await.unwrap();
    engine.set_online(true);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(origin.calls().is_empty(), "calls after stop: {:?}", origin.calls());
    assert_eq!(engine.status().await.unwrap().pending, 1);
}

#[tokio::test]
async fn zero_cadence_is_rejected_at_build() {
    let config = test_config().with_reconcile_interval(Duration::ZERO);
    let built = till_sync_engine::SyncEngine::builder(config)
        .origin(Arc::new(MemoryOrigin::new()))
        .build()
        .await;
    assert!(matches!(built, Err(Error::Config(_))));
}

#[tokio::test]
async fn start_pulls_eagerly_and_reconnect_pulls_again() {
    let origin = Arc::new(MemoryOrigin::new());
    origin.seed(
        "taxes",
        json!({"id": "t-1", "name": "VAT", "rate": 0.21, "updatedAt": "2024-01-01T00:00:00Z"}),
    );
    let engine = engine(origin.clone(), true).await;
    engine.start(session()).await;

    eventually("the eager pull", || async {
        engine.get("taxes", "t-1").await.unwrap().is_some()
    })
    .await;
    assert!(engine.status().await.unwrap().last_pulled.is_some());

    engine.set_online(false);
    origin.seed(
        "taxes",
        json!({"id": "t-2", "name": "Reduced", "rate": 0.1, "updatedAt": "2024-01-02T00:00:00Z"}),
    );
    engine.set_online(true);

    eventually("the reconnect pull", || async {
        engine.get("taxes", "t-2").await.unwrap().is_some()
    })
    .await;
}

// ============================================================================
// Reactive bus
// ============================================================================

#[tokio::test]
async fn subscribers_see_each_write_once() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine(origin, false).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine
        .subscribe(Selector::collection("client"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.create("clients", json!({"name": "Ana"})).await.unwrap();
    eventually("the subscriber to hear about the write", || async {
        calls.load(Ordering::SeqCst) == 2
    })
    .await;

    // Writes elsewhere do not wake this subscriber.
    engine.create("taxes", json!({"name": "VAT", "rate": 0.21})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pulled_changes_reach_subscribers() {
    let origin = Arc::new(MemoryOrigin::new());
    let engine = engine(origin.clone(), true).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine
        .subscribe(
            Selector::collection("products").sort_by("price"),
            move |state| {
                let names: Vec<String> = state
                    .view()
                    .and_then(|v| v.records())
                    .unwrap_or_default()
                    .iter()
                    .map(|r| r.payload["name"].as_str().unwrap_or_default().to_string())
                    .collect();
                sink.lock().unwrap().push(names);
            },
        )
        .await
        .unwrap();

    origin.seed(
        "products",
        json!({"id": "p-1", "name": "Tea", "price": 3.0, "updatedAt": "2024-01-01T00:00:00Z"}),
    );
    origin.seed(
        "products",
        json!({"id": "p-2", "name": "Water", "price": 1.0, "updatedAt": "2024-01-01T00:00:00Z"}),
    );
    pull(&engine, "products").await.unwrap();

    eventually("the pulled products", || async {
        seen.lock()
            .unwrap()
            .last()
            .is_some_and(|names| names == &["Water", "Tea"])
    })
    .await;
}

#[tokio::test]
async fn translations_follow_locale() {
    let origin = Arc::new(MemoryOrigin::new());
    origin.seed(
        "translations",
        json!({"id": "tr-1", "key": "menu.file", "values": {"en": "File", "es": "Archivo"}}),
    );
    origin.seed(
        "translations",
        json!({"id": "tr-2", "key": "menu.quit", "values": {"en": "Quit"}}),
    );
    let engine = engine(origin.clone(), true).await;
    pull(&engine, "translations").await.unwrap();

    let handle = engine.subscribe_translations("es", |_| {}).await;
    let tree = |engine: &till_sync_engine::SyncEngine| {
        engine
            .bus()
            .state(handle)
            .and_then(|s| s.view().and_then(|v| v.translations().cloned()))
    };
    assert_eq!(
        tree(&engine),
        Some(json!({"menu": {"file": "Archivo", "quit": "Quit"}}))
    );

    assert!(engine.set_locale(handle, "fr").await);
    assert_eq!(
        tree(&engine),
        Some(json!({"menu": {"file": "File", "quit": "Quit"}}))
    );

    origin.seed(
        "translations",
        json!({"id": "tr-3", "key": "menu.open", "values": {"fr": "Ouvrir"}, "updatedAt": "2024-01-01T00:00:00Z"}),
    );
    pull(&engine, "translations").await.unwrap();
    eventually("the new translation", || async {
        tree(&engine).is_some_and(|t| t["menu"]["open"] == "Ouvrir")
    })
    .await;
}
